//! RBAC graph storage — organizations, memberships, roles, permissions.

use rusqlite::OptionalExtension;
use serde::Serialize;

use crate::db::{now, Db};
use crate::{Error, Result};

/// An organization.
#[derive(Debug, Clone, Serialize)]
pub struct Organization {
    /// Stable id
    pub org_id: String,
    /// Unique URL-safe slug
    pub slug: String,
    /// Display name
    pub name: String,
    /// Force OTP for user sessions in this org's context
    pub require_otp: bool,
    /// Creation time
    pub created_at: i64,
}

/// A membership row with its status.
#[derive(Debug, Clone, Serialize)]
pub struct Membership {
    /// Organization
    pub org_id: String,
    /// Subject
    pub sub: String,
    /// `active` or `suspended`
    pub status: String,
    /// Creation time
    pub created_at: i64,
}

/// Store for the RBAC join graph.
#[derive(Clone)]
pub struct RbacStore {
    db: Db,
}

impl RbacStore {
    /// New handle.
    #[must_use]
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    // ── Organizations ─────────────────────────────────────────────────────

    /// Create an organization.
    pub fn create_org(&self, slug: &str, name: &str, require_otp: bool) -> Result<Organization> {
        let org = Organization {
            org_id: uuid::Uuid::new_v4().to_string(),
            slug: slug.to_string(),
            name: name.to_string(),
            require_otp,
            created_at: now(),
        };
        self.db.with(|conn| {
            conn.execute(
                "INSERT INTO organizations (org_id, slug, name, require_otp, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![org.org_id, org.slug, org.name, org.require_otp, org.created_at],
            )
            .map_err(Error::from)
        })?;
        Ok(org)
    }

    /// Look up an organization.
    pub fn org(&self, org_id: &str) -> Result<Option<Organization>> {
        self.db.with(|conn| {
            conn.query_row(
                "SELECT org_id, slug, name, require_otp, created_at
                 FROM organizations WHERE org_id = ?1",
                rusqlite::params![org_id],
                row_to_org,
            )
            .optional()
            .map_err(Error::from)
        })
    }

    /// List all organizations.
    pub fn list_orgs(&self) -> Result<Vec<Organization>> {
        self.db.with(|conn| {
            let mut stmt = conn.prepare(
                "SELECT org_id, slug, name, require_otp, created_at
                 FROM organizations ORDER BY slug",
            )?;
            let rows = stmt.query_map([], row_to_org)?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(Error::from)
        })
    }

    /// Delete an organization (cascades memberships).
    pub fn delete_org(&self, org_id: &str) -> Result<()> {
        let deleted = self.db.with(|conn| {
            conn.execute(
                "DELETE FROM organizations WHERE org_id = ?1",
                rusqlite::params![org_id],
            )
            .map_err(Error::from)
        })?;
        if deleted == 0 {
            return Err(Error::not_found(format!("organization {org_id}")));
        }
        Ok(())
    }

    // ── Memberships ───────────────────────────────────────────────────────

    /// Add or reactivate a membership.
    pub fn upsert_membership(&self, org_id: &str, sub: &str, status: &str) -> Result<()> {
        if status != "active" && status != "suspended" {
            return Err(Error::validation("membership status must be active or suspended"));
        }
        self.db.with(|conn| {
            conn.execute(
                "INSERT INTO memberships (org_id, sub, status, created_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(org_id, sub) DO UPDATE SET status = excluded.status",
                rusqlite::params![org_id, sub, status, now()],
            )
            .map_err(Error::from)
        })?;
        Ok(())
    }

    /// Remove a membership.
    pub fn delete_membership(&self, org_id: &str, sub: &str) -> Result<()> {
        self.db.with(|conn| {
            conn.execute(
                "DELETE FROM memberships WHERE org_id = ?1 AND sub = ?2",
                rusqlite::params![org_id, sub],
            )
            .map_err(Error::from)
        })?;
        Ok(())
    }

    /// All **active** memberships for a subject, with their organizations.
    pub fn active_memberships(&self, sub: &str) -> Result<Vec<Organization>> {
        self.db.with(|conn| {
            let mut stmt = conn.prepare(
                "SELECT o.org_id, o.slug, o.name, o.require_otp, o.created_at
                 FROM memberships m JOIN organizations o ON o.org_id = m.org_id
                 WHERE m.sub = ?1 AND m.status = 'active'
                 ORDER BY o.slug",
            )?;
            let rows = stmt.query_map(rusqlite::params![sub], row_to_org)?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(Error::from)
        })
    }

    /// Memberships of an organization.
    pub fn org_members(&self, org_id: &str) -> Result<Vec<Membership>> {
        self.db.with(|conn| {
            let mut stmt = conn.prepare(
                "SELECT org_id, sub, status, created_at FROM memberships WHERE org_id = ?1",
            )?;
            let rows = stmt.query_map(rusqlite::params![org_id], |r| {
                Ok(Membership {
                    org_id: r.get(0)?,
                    sub: r.get(1)?,
                    status: r.get(2)?,
                    created_at: r.get(3)?,
                })
            })?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(Error::from)
        })
    }

    // ── Roles and permissions ─────────────────────────────────────────────

    /// Create a role.
    pub fn create_role(&self, name: &str) -> Result<String> {
        let role_id = uuid::Uuid::new_v4().to_string();
        self.db.with(|conn| {
            conn.execute(
                "INSERT INTO roles (role_id, name) VALUES (?1, ?2)",
                rusqlite::params![role_id, name],
            )
            .map_err(Error::from)
        })?;
        Ok(role_id)
    }

    /// Create a permission.
    pub fn create_permission(&self, name: &str) -> Result<String> {
        let permission_id = uuid::Uuid::new_v4().to_string();
        self.db.with(|conn| {
            conn.execute(
                "INSERT INTO permissions (permission_id, name) VALUES (?1, ?2)",
                rusqlite::params![permission_id, name],
            )
            .map_err(Error::from)
        })?;
        Ok(permission_id)
    }

    /// Attach a permission to a role.
    pub fn grant_permission(&self, role_id: &str, permission_id: &str) -> Result<()> {
        self.db.with(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO role_permissions (role_id, permission_id) VALUES (?1, ?2)",
                rusqlite::params![role_id, permission_id],
            )
            .map_err(Error::from)
        })?;
        Ok(())
    }

    /// Assign a role to a membership.
    pub fn assign_role(&self, org_id: &str, sub: &str, role_id: &str) -> Result<()> {
        self.db.with(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO membership_roles (org_id, sub, role_id) VALUES (?1, ?2, ?3)",
                rusqlite::params![org_id, sub, role_id],
            )
            .map_err(Error::from)
        })?;
        Ok(())
    }

    /// List roles and permission names for `(org, sub)`: role names, plus
    /// the deduplicated union of the roles' permissions.
    pub fn roles_and_permissions(&self, org_id: &str, sub: &str) -> Result<(Vec<String>, Vec<String>)> {
        let roles = self.db.with(|conn| {
            let mut stmt = conn.prepare(
                "SELECT r.name FROM membership_roles mr
                 JOIN roles r ON r.role_id = mr.role_id
                 WHERE mr.org_id = ?1 AND mr.sub = ?2 ORDER BY r.name",
            )?;
            let rows = stmt.query_map(rusqlite::params![org_id, sub], |r| r.get::<_, String>(0))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(Error::from)
        })?;
        let permissions = self.db.with(|conn| {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT p.name FROM membership_roles mr
                 JOIN role_permissions rp ON rp.role_id = mr.role_id
                 JOIN permissions p ON p.permission_id = rp.permission_id
                 WHERE mr.org_id = ?1 AND mr.sub = ?2 ORDER BY p.name",
            )?;
            let rows = stmt.query_map(rusqlite::params![org_id, sub], |r| r.get::<_, String>(0))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(Error::from)
        })?;
        Ok((roles, permissions))
    }

    /// All roles.
    pub fn list_roles(&self) -> Result<Vec<(String, String)>> {
        self.db.with(|conn| {
            let mut stmt = conn.prepare("SELECT role_id, name FROM roles ORDER BY name")?;
            let rows = stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(Error::from)
        })
    }

    /// All permissions.
    pub fn list_permissions(&self) -> Result<Vec<(String, String)>> {
        self.db.with(|conn| {
            let mut stmt =
                conn.prepare("SELECT permission_id, name FROM permissions ORDER BY name")?;
            let rows = stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(Error::from)
        })
    }
}

fn row_to_org(row: &rusqlite::Row<'_>) -> rusqlite::Result<Organization> {
    Ok(Organization {
        org_id: row.get(0)?,
        slug: row.get(1)?,
        name: row.get(2)?,
        require_otp: row.get(3)?,
        created_at: row.get(4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::subjects::SubjectStore;

    fn setup() -> (RbacStore, String) {
        let db = Db::open_in_memory().unwrap();
        let subjects = SubjectStore::new(db.clone());
        let sub = subjects.create_subject("a@example.com", "A").unwrap().sub;
        (RbacStore::new(db), sub)
    }

    #[test]
    fn permissions_union_is_deduplicated() {
        // GIVEN: a subject with two roles sharing a permission
        let (store, sub) = setup();
        let org = store.create_org("acme", "Acme", false).unwrap();
        store.upsert_membership(&org.org_id, &sub, "active").unwrap();

        let admin_role = store.create_role("admin").unwrap();
        let editor_role = store.create_role("editor").unwrap();
        let read = store.create_permission("docs:read").unwrap();
        let write = store.create_permission("docs:write").unwrap();
        store.grant_permission(&admin_role, &read).unwrap();
        store.grant_permission(&admin_role, &write).unwrap();
        store.grant_permission(&editor_role, &read).unwrap();
        store.assign_role(&org.org_id, &sub, &admin_role).unwrap();
        store.assign_role(&org.org_id, &sub, &editor_role).unwrap();

        // WHEN: resolving
        let (roles, permissions) = store.roles_and_permissions(&org.org_id, &sub).unwrap();

        // THEN: both roles, permissions deduplicated
        assert_eq!(roles, vec!["admin", "editor"]);
        assert_eq!(permissions, vec!["docs:read", "docs:write"]);
    }

    #[test]
    fn suspended_membership_is_not_active() {
        let (store, sub) = setup();
        let org = store.create_org("acme", "Acme", false).unwrap();
        store.upsert_membership(&org.org_id, &sub, "suspended").unwrap();
        assert!(store.active_memberships(&sub).unwrap().is_empty());

        store.upsert_membership(&org.org_id, &sub, "active").unwrap();
        assert_eq!(store.active_memberships(&sub).unwrap().len(), 1);
    }

    #[test]
    fn duplicate_slug_conflicts() {
        let (store, _) = setup();
        store.create_org("acme", "Acme", false).unwrap();
        assert!(matches!(
            store.create_org("acme", "Other", false),
            Err(Error::Conflict(_))
        ));
    }
}
