//! Subjects (end users) and admin principals.

use rusqlite::OptionalExtension;
use serde::Serialize;

use crate::db::{now, Db};
use crate::{Error, Result};

/// An end user of the identity provider.
#[derive(Debug, Clone, Serialize)]
pub struct Subject {
    /// Stable identifier (`sub` claim)
    pub sub: String,
    /// Unique, case-folded email
    pub email: String,
    /// Display name
    pub name: String,
    /// Set by admin password-set; cleared by self change
    pub password_reset_required: bool,
    /// Creation time (epoch seconds)
    pub created_at: i64,
}

/// An administrator.
#[derive(Debug, Clone, Serialize)]
pub struct AdminUser {
    /// Stable identifier
    pub admin_id: String,
    /// Unique, case-folded email
    pub email: String,
    /// Display name
    pub name: String,
    /// `read` or `write`
    pub role: AdminRole,
    /// Set by admin password-set; cleared by self change
    pub password_reset_required: bool,
    /// Creation time (epoch seconds)
    pub created_at: i64,
}

/// Admin privilege level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AdminRole {
    /// May read everything, change nothing
    Read,
    /// Full access
    Write,
}

impl AdminRole {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
        }
    }

    pub(crate) fn parse(s: &str) -> Result<Self> {
        match s {
            "read" => Ok(Self::Read),
            "write" => Ok(Self::Write),
            other => Err(Error::Internal(format!("unknown admin role {other}"))),
        }
    }
}

/// Case-fold an email for uniqueness.
#[must_use]
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Store for subjects and admin principals.
#[derive(Clone)]
pub struct SubjectStore {
    db: Db,
}

impl SubjectStore {
    /// New handle.
    #[must_use]
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Create a subject. Fails with `Conflict` on a duplicate email.
    pub fn create_subject(&self, email: &str, name: &str) -> Result<Subject> {
        let subject = Subject {
            sub: uuid::Uuid::new_v4().to_string(),
            email: normalize_email(email),
            name: name.to_string(),
            password_reset_required: false,
            created_at: now(),
        };
        self.db.with(|conn| {
            conn.execute(
                "INSERT INTO subjects (sub, email, name, password_reset_required, created_at)
                 VALUES (?1, ?2, ?3, 0, ?4)",
                rusqlite::params![subject.sub, subject.email, subject.name, subject.created_at],
            )
            .map_err(Error::from)
        })?;
        Ok(subject)
    }

    /// Look up by stable id.
    pub fn subject_by_id(&self, sub: &str) -> Result<Option<Subject>> {
        self.db.with(|conn| {
            conn.query_row(
                "SELECT sub, email, name, password_reset_required, created_at
                 FROM subjects WHERE sub = ?1",
                rusqlite::params![sub],
                row_to_subject,
            )
            .optional()
            .map_err(Error::from)
        })
    }

    /// Look up by email (case-folded).
    pub fn subject_by_email(&self, email: &str) -> Result<Option<Subject>> {
        self.db.with(|conn| {
            conn.query_row(
                "SELECT sub, email, name, password_reset_required, created_at
                 FROM subjects WHERE email = ?1",
                rusqlite::params![normalize_email(email)],
                row_to_subject,
            )
            .optional()
            .map_err(Error::from)
        })
    }

    /// All subjects, newest first.
    pub fn list_subjects(&self) -> Result<Vec<Subject>> {
        self.db.with(|conn| {
            let mut stmt = conn.prepare(
                "SELECT sub, email, name, password_reset_required, created_at
                 FROM subjects ORDER BY created_at DESC",
            )?;
            let rows = stmt.query_map([], row_to_subject)?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(Error::from)
        })
    }

    /// Update email and/or name. The stable `sub` never changes, so the
    /// aPAKE credential survives; the envelope's identity binding is
    /// refreshed at the next password set.
    pub fn update_subject(
        &self,
        sub: &str,
        email: Option<&str>,
        name: Option<&str>,
    ) -> Result<Subject> {
        self.db.with(|conn| {
            if let Some(email) = email {
                conn.execute(
                    "UPDATE subjects SET email = ?1, password_reset_required = 1 WHERE sub = ?2",
                    rusqlite::params![normalize_email(email), sub],
                )?;
            }
            if let Some(name) = name {
                conn.execute(
                    "UPDATE subjects SET name = ?1 WHERE sub = ?2",
                    rusqlite::params![name, sub],
                )?;
            }
            Ok(())
        })?;
        self.subject_by_id(sub)?
            .ok_or_else(|| Error::not_found(format!("subject {sub}")))
    }

    /// Delete a subject and (via cascade) its credential.
    pub fn delete_subject(&self, sub: &str) -> Result<()> {
        let deleted = self.db.with(|conn| {
            conn.execute("DELETE FROM subjects WHERE sub = ?1", rusqlite::params![sub])
                .map_err(Error::from)
        })?;
        if deleted == 0 {
            return Err(Error::not_found(format!("subject {sub}")));
        }
        Ok(())
    }

    /// Flip the password-reset flag.
    pub fn set_password_reset_required(&self, sub: &str, required: bool) -> Result<()> {
        self.db.with(|conn| {
            conn.execute(
                "UPDATE subjects SET password_reset_required = ?1 WHERE sub = ?2",
                rusqlite::params![required, sub],
            )
            .map_err(Error::from)
        })?;
        Ok(())
    }

    // ── Admin principals ──────────────────────────────────────────────────

    /// Create an admin principal.
    pub fn create_admin(&self, email: &str, name: &str, role: AdminRole) -> Result<AdminUser> {
        let admin = AdminUser {
            admin_id: uuid::Uuid::new_v4().to_string(),
            email: normalize_email(email),
            name: name.to_string(),
            role,
            password_reset_required: false,
            created_at: now(),
        };
        self.db.with(|conn| {
            conn.execute(
                "INSERT INTO admin_users (admin_id, email, name, role, password_reset_required, created_at)
                 VALUES (?1, ?2, ?3, ?4, 0, ?5)",
                rusqlite::params![
                    admin.admin_id,
                    admin.email,
                    admin.name,
                    role.as_str(),
                    admin.created_at
                ],
            )
            .map_err(Error::from)
        })?;
        Ok(admin)
    }

    /// Look up an admin by id.
    pub fn admin_by_id(&self, admin_id: &str) -> Result<Option<AdminUser>> {
        self.db.with(|conn| {
            conn.query_row(
                "SELECT admin_id, email, name, role, password_reset_required, created_at
                 FROM admin_users WHERE admin_id = ?1",
                rusqlite::params![admin_id],
                row_to_admin,
            )
            .optional()
            .map_err(Error::from)
        })
    }

    /// Look up an admin by email.
    pub fn admin_by_email(&self, email: &str) -> Result<Option<AdminUser>> {
        self.db.with(|conn| {
            conn.query_row(
                "SELECT admin_id, email, name, role, password_reset_required, created_at
                 FROM admin_users WHERE email = ?1",
                rusqlite::params![normalize_email(email)],
                row_to_admin,
            )
            .optional()
            .map_err(Error::from)
        })
    }

    /// All admins.
    pub fn list_admins(&self) -> Result<Vec<AdminUser>> {
        self.db.with(|conn| {
            let mut stmt = conn.prepare(
                "SELECT admin_id, email, name, role, password_reset_required, created_at
                 FROM admin_users ORDER BY created_at DESC",
            )?;
            let rows = stmt.query_map([], row_to_admin)?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(Error::from)
        })
    }

    /// Delete an admin principal.
    pub fn delete_admin(&self, admin_id: &str) -> Result<()> {
        let deleted = self.db.with(|conn| {
            conn.execute(
                "DELETE FROM admin_users WHERE admin_id = ?1",
                rusqlite::params![admin_id],
            )
            .map_err(Error::from)
        })?;
        if deleted == 0 {
            return Err(Error::not_found(format!("admin {admin_id}")));
        }
        Ok(())
    }

    /// Flip an admin's password-reset flag.
    pub fn set_admin_password_reset_required(&self, admin_id: &str, required: bool) -> Result<()> {
        self.db.with(|conn| {
            conn.execute(
                "UPDATE admin_users SET password_reset_required = ?1 WHERE admin_id = ?2",
                rusqlite::params![required, admin_id],
            )
            .map_err(Error::from)
        })?;
        Ok(())
    }
}

fn row_to_subject(row: &rusqlite::Row<'_>) -> rusqlite::Result<Subject> {
    Ok(Subject {
        sub: row.get(0)?,
        email: row.get(1)?,
        name: row.get(2)?,
        password_reset_required: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn row_to_admin(row: &rusqlite::Row<'_>) -> rusqlite::Result<AdminUser> {
    let role: String = row.get(3)?;
    Ok(AdminUser {
        admin_id: row.get(0)?,
        email: row.get(1)?,
        name: row.get(2)?,
        role: AdminRole::parse(&role).unwrap_or(AdminRole::Read),
        password_reset_required: row.get(4)?,
        created_at: row.get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SubjectStore {
        SubjectStore::new(Db::open_in_memory().unwrap())
    }

    #[test]
    fn create_and_find_subject() {
        // GIVEN: a created subject
        let store = store();
        let created = store.create_subject("Alice@Example.com", "Alice").unwrap();

        // THEN: email is case-folded and lookups agree
        assert_eq!(created.email, "alice@example.com");
        let by_id = store.subject_by_id(&created.sub).unwrap().unwrap();
        let by_email = store.subject_by_email("ALICE@example.COM").unwrap().unwrap();
        assert_eq!(by_id.sub, by_email.sub);
    }

    #[test]
    fn duplicate_email_conflicts() {
        let store = store();
        store.create_subject("a@example.com", "A").unwrap();
        let err = store.create_subject("A@Example.com", "A2").unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[test]
    fn email_change_keeps_sub_and_forces_reset() {
        // GIVEN: a subject
        let store = store();
        let subject = store.create_subject("a@example.com", "A").unwrap();

        // WHEN: an admin changes the email
        let updated = store
            .update_subject(&subject.sub, Some("b@example.com"), None)
            .unwrap();

        // THEN: same sub, new email, reset required
        assert_eq!(updated.sub, subject.sub);
        assert_eq!(updated.email, "b@example.com");
        assert!(updated.password_reset_required);
    }

    #[test]
    fn admin_roles_roundtrip() {
        let store = store();
        let admin = store
            .create_admin("root@example.com", "Root", AdminRole::Write)
            .unwrap();
        let loaded = store.admin_by_id(&admin.admin_id).unwrap().unwrap();
        assert_eq!(loaded.role, AdminRole::Write);
    }

    #[test]
    fn delete_missing_subject_is_not_found() {
        let err = store().delete_subject("nope").unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
