//! Credential store — per-principal aPAKE material.
//!
//! State machine per principal: absent → registered → replaced-by-change.
//! The envelope and server public key are written together, only ever by a
//! completed registration run, and the export-key hash from the previous
//! registration is consulted to reject a change to the same password.

use rusqlite::OptionalExtension;
use subtle::ConstantTimeEq;

use crate::db::{now, Db};
use crate::{Error, Result};

use super::Cohort;

/// Stored credential material for one principal.
#[derive(Debug, Clone)]
pub struct Credential {
    /// The registration record (envelope ‖ client public key), opaque
    pub envelope: Vec<u8>,
    /// Server public key returned during that registration
    pub server_pub_key: Vec<u8>,
    /// SHA-256 of the export key from that registration
    pub export_key_hash: Vec<u8>,
}

/// Store for user and admin credentials.
#[derive(Clone)]
pub struct CredentialStore {
    db: Db,
}

fn table(cohort: Cohort) -> (&'static str, &'static str) {
    match cohort {
        Cohort::User => ("credentials", "sub"),
        Cohort::Admin => ("admin_credentials", "admin_id"),
    }
}

impl CredentialStore {
    /// New handle.
    #[must_use]
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Load the credential for a principal.
    pub fn get(&self, cohort: Cohort, principal_id: &str) -> Result<Option<Credential>> {
        let (table, key) = table(cohort);
        self.db.with(|conn| {
            conn.query_row(
                &format!(
                    "SELECT envelope, server_pub_key, export_key_hash FROM {table} WHERE {key} = ?1"
                ),
                rusqlite::params![principal_id],
                |r| {
                    Ok(Credential {
                        envelope: r.get(0)?,
                        server_pub_key: r.get(1)?,
                        export_key_hash: r.get(2)?,
                    })
                },
            )
            .optional()
            .map_err(Error::from)
        })
    }

    /// First registration for a principal. Fails with `Conflict` if a
    /// credential already exists (changes go through [`Self::replace`]).
    pub fn register(
        &self,
        cohort: Cohort,
        principal_id: &str,
        credential: &Credential,
    ) -> Result<()> {
        let (table, key) = table(cohort);
        self.db.with(|conn| {
            conn.execute(
                &format!(
                    "INSERT INTO {table} ({key}, envelope, server_pub_key, export_key_hash, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)"
                ),
                rusqlite::params![
                    principal_id,
                    credential.envelope,
                    credential.server_pub_key,
                    credential.export_key_hash,
                    now()
                ],
            )
            .map_err(Error::from)
        })?;
        Ok(())
    }

    /// Password change: atomically replace the envelope, server key and
    /// export-key hash. Rejects a new export-key hash equal to the stored
    /// one (same password), compared in constant time.
    pub fn replace(
        &self,
        cohort: Cohort,
        principal_id: &str,
        credential: &Credential,
    ) -> Result<()> {
        let (table, key) = table(cohort);
        self.db.with_tx(|tx| {
            let existing: Option<Vec<u8>> = tx
                .query_row(
                    &format!("SELECT export_key_hash FROM {table} WHERE {key} = ?1"),
                    rusqlite::params![principal_id],
                    |r| r.get(0),
                )
                .optional()?;
            let Some(existing) = existing else {
                return Err(Error::not_found(format!("credential for {principal_id}")));
            };

            if existing.len() == credential.export_key_hash.len()
                && bool::from(existing.ct_eq(&credential.export_key_hash))
            {
                return Err(Error::NewPasswordEqualsCurrent);
            }

            tx.execute(
                &format!(
                    "UPDATE {table}
                     SET envelope = ?1, server_pub_key = ?2, export_key_hash = ?3, updated_at = ?4
                     WHERE {key} = ?5"
                ),
                rusqlite::params![
                    credential.envelope,
                    credential.server_pub_key,
                    credential.export_key_hash,
                    now(),
                    principal_id
                ],
            )?;
            Ok(())
        })
    }

    /// Admin-forced set: replace unconditionally (no same-password check —
    /// the admin does not know the old password) or create if absent.
    pub fn force_set(
        &self,
        cohort: Cohort,
        principal_id: &str,
        credential: &Credential,
    ) -> Result<()> {
        let (table, key) = table(cohort);
        self.db.with(|conn| {
            conn.execute(
                &format!(
                    "INSERT INTO {table} ({key}, envelope, server_pub_key, export_key_hash, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT({key}) DO UPDATE SET
                       envelope = excluded.envelope,
                       server_pub_key = excluded.server_pub_key,
                       export_key_hash = excluded.export_key_hash,
                       updated_at = excluded.updated_at"
                ),
                rusqlite::params![
                    principal_id,
                    credential.envelope,
                    credential.server_pub_key,
                    credential.export_key_hash,
                    now()
                ],
            )
            .map_err(Error::from)
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(tag: u8) -> Credential {
        Credential {
            envelope: vec![tag; 96],
            server_pub_key: vec![1; 32],
            export_key_hash: vec![tag; 32],
        }
    }

    fn store() -> CredentialStore {
        CredentialStore::new(Db::open_in_memory().unwrap())
    }

    #[test]
    fn register_then_get() {
        let store = store();
        store.register(Cohort::User, "sub-1", &sample(7)).unwrap();
        let loaded = store.get(Cohort::User, "sub-1").unwrap().unwrap();
        assert_eq!(loaded.envelope, vec![7; 96]);
    }

    #[test]
    fn cohorts_are_isolated() {
        // GIVEN: a user credential
        let store = store();
        store.register(Cohort::User, "p-1", &sample(7)).unwrap();

        // THEN: the admin table knows nothing about it
        assert!(store.get(Cohort::Admin, "p-1").unwrap().is_none());
    }

    #[test]
    fn double_register_conflicts() {
        let store = store();
        store.register(Cohort::User, "sub-1", &sample(7)).unwrap();
        let err = store.register(Cohort::User, "sub-1", &sample(8)).unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[test]
    fn replace_rejects_same_password() {
        // GIVEN: a registered credential
        let store = store();
        store.register(Cohort::User, "sub-1", &sample(7)).unwrap();

        // WHEN: replacing with the same export-key hash
        let err = store.replace(Cohort::User, "sub-1", &sample(7)).unwrap_err();

        // THEN: the change is rejected
        assert!(matches!(err, Error::NewPasswordEqualsCurrent));

        // AND: the stored credential is unchanged
        let unchanged = store.get(Cohort::User, "sub-1").unwrap().unwrap();
        assert_eq!(unchanged.envelope, vec![7; 96]);
    }

    #[test]
    fn replace_with_new_password_succeeds() {
        let store = store();
        store.register(Cohort::User, "sub-1", &sample(7)).unwrap();
        store.replace(Cohort::User, "sub-1", &sample(9)).unwrap();
        let loaded = store.get(Cohort::User, "sub-1").unwrap().unwrap();
        assert_eq!(loaded.export_key_hash, vec![9; 32]);
    }

    #[test]
    fn replace_without_existing_is_not_found() {
        let err = store().replace(Cohort::User, "ghost", &sample(7)).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn force_set_overwrites_without_same_password_check() {
        let store = store();
        store.register(Cohort::Admin, "adm-1", &sample(7)).unwrap();
        // Same hash: allowed for an admin-forced set
        store.force_set(Cohort::Admin, "adm-1", &sample(7)).unwrap();
        // And works when absent
        store.force_set(Cohort::Admin, "adm-2", &sample(3)).unwrap();
        assert!(store.get(Cohort::Admin, "adm-2").unwrap().is_some());
    }
}
