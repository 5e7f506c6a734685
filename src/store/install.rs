//! Install tokens — single-use bootstrap guard.
//!
//! An install token is minted on first start when the system is
//! uninitialized, printed for the operator, and consumed exactly once by
//! `POST /api/install/complete`. Only its hash is persisted.

use rusqlite::OptionalExtension;

use crate::db::{now, Db};
use crate::{Error, Result};

use super::{random_token, token_hash};

/// Store for install tokens.
#[derive(Clone)]
pub struct InstallStore {
    db: Db,
}

impl InstallStore {
    /// New handle.
    #[must_use]
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Whether the system has been installed (KEK parameters exist).
    pub fn is_installed(&self) -> Result<bool> {
        let count: i64 = self.db.with(|conn| {
            conn.query_row("SELECT COUNT(*) FROM kek_params", [], |r| r.get(0))
                .map_err(Error::from)
        })?;
        Ok(count > 0)
    }

    /// Mint a fresh install token (plaintext returned once).
    pub fn mint(&self) -> Result<String> {
        let token = random_token();
        self.db.with(|conn| {
            conn.execute(
                "INSERT INTO install_tokens (token_hash, created_at, used_at) VALUES (?1, ?2, NULL)",
                rusqlite::params![token_hash(&token), now()],
            )
            .map_err(Error::from)
        })?;
        Ok(token)
    }

    /// Check a token is known and unused without consuming it. The
    /// two-step install flow verifies at start and consumes at complete.
    pub fn peek(&self, token: &str) -> Result<()> {
        let used_at: Option<Option<i64>> = self.db.with(|conn| {
            use rusqlite::OptionalExtension;
            conn.query_row(
                "SELECT used_at FROM install_tokens WHERE token_hash = ?1",
                rusqlite::params![token_hash(token)],
                |r| r.get(0),
            )
            .optional()
            .map_err(Error::from)
        })?;
        match used_at {
            Some(None) => Ok(()),
            _ => Err(Error::Unauthorized),
        }
    }

    /// Consume a token exactly once. Returns `Unauthorized` for unknown or
    /// already-used tokens.
    pub fn consume(&self, token: &str) -> Result<()> {
        self.db.with_tx(|tx| {
            let hash = token_hash(token);
            let used_at: Option<Option<i64>> = tx
                .query_row(
                    "SELECT used_at FROM install_tokens WHERE token_hash = ?1",
                    rusqlite::params![hash],
                    |r| r.get(0),
                )
                .optional()?;
            match used_at {
                Some(None) => {
                    tx.execute(
                        "UPDATE install_tokens SET used_at = ?1 WHERE token_hash = ?2",
                        rusqlite::params![now(), hash],
                    )?;
                    Ok(())
                }
                _ => Err(Error::Unauthorized),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_is_single_use() {
        let store = InstallStore::new(Db::open_in_memory().unwrap());
        let token = store.mint().unwrap();
        store.consume(&token).unwrap();
        assert!(matches!(store.consume(&token), Err(Error::Unauthorized)));
    }

    #[test]
    fn unknown_token_is_unauthorized() {
        let store = InstallStore::new(Db::open_in_memory().unwrap());
        assert!(matches!(store.consume("bogus"), Err(Error::Unauthorized)));
    }

    #[test]
    fn installed_flag_tracks_kek_params() {
        let db = Db::open_in_memory().unwrap();
        let store = InstallStore::new(db.clone());
        assert!(!store.is_installed().unwrap());

        crate::keystore::KeyStore::install(db, "p", crate::keystore::fresh_kek_params(8, 1, 1))
            .unwrap();
        assert!(store.is_installed().unwrap());
    }
}
