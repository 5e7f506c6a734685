//! RBAC resolution — organization context and claim material at mint time.

use serde::Serialize;

use crate::store::rbac::RbacStore;
use crate::{Error, Result};

/// Resolved organization context attached to token claims.
#[derive(Debug, Clone, Serialize)]
pub struct OrgContext {
    /// Organization id (`org_id` claim)
    pub org_id: String,
    /// Organization slug (`org_slug` claim)
    pub org_slug: String,
    /// The org forces OTP for user sessions
    pub require_otp: bool,
    /// Role names from the chosen membership
    pub roles: Vec<String>,
    /// Deduplicated union of role permissions
    pub permissions: Vec<String>,
}

/// Resolver over the RBAC store.
#[derive(Clone)]
pub struct RbacResolver {
    store: RbacStore,
}

impl RbacResolver {
    /// New resolver.
    #[must_use]
    pub fn new(store: RbacStore) -> Self {
        Self { store }
    }

    /// Choose an organization context for a subject.
    ///
    /// - no active memberships → 403 `no_active_membership`
    /// - exactly one → that organization
    /// - several and no request → 400 `org_context_required`
    /// - a requested org must be an active membership, else 403
    pub fn resolve(&self, sub: &str, requested_org: Option<&str>) -> Result<OrgContext> {
        let memberships = self.store.active_memberships(sub)?;

        let org = match (memberships.len(), requested_org) {
            (0, _) => return Err(Error::Forbidden("no_active_membership".to_string())),
            (_, Some(requested)) => memberships
                .into_iter()
                .find(|org| org.org_id == requested)
                .ok_or_else(|| Error::Forbidden("not a member of the requested organization".to_string()))?,
            (1, None) => memberships.into_iter().next().expect("len checked"),
            (_, None) => return Err(Error::Validation("org_context_required".to_string())),
        };

        let (roles, permissions) = self.store.roles_and_permissions(&org.org_id, sub)?;
        Ok(OrgContext {
            org_id: org.org_id,
            org_slug: org.slug,
            require_otp: org.require_otp,
            roles,
            permissions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;
    use crate::store::subjects::SubjectStore;

    fn setup() -> (RbacResolver, RbacStore, String) {
        let db = Db::open_in_memory().unwrap();
        let sub = SubjectStore::new(db.clone())
            .create_subject("a@example.com", "A")
            .unwrap()
            .sub;
        let store = RbacStore::new(db);
        (RbacResolver::new(store.clone()), store, sub)
    }

    #[test]
    fn no_membership_is_forbidden() {
        let (resolver, _, sub) = setup();
        let err = resolver.resolve(&sub, None).unwrap_err();
        assert!(matches!(err, Error::Forbidden(ref m) if m == "no_active_membership"));
    }

    #[test]
    fn single_membership_is_implicit() {
        let (resolver, store, sub) = setup();
        let org = store.create_org("acme", "Acme", false).unwrap();
        store.upsert_membership(&org.org_id, &sub, "active").unwrap();

        let context = resolver.resolve(&sub, None).unwrap();
        assert_eq!(context.org_slug, "acme");
    }

    #[test]
    fn multiple_memberships_require_explicit_choice() {
        let (resolver, store, sub) = setup();
        for slug in ["acme", "globex"] {
            let org = store.create_org(slug, slug, false).unwrap();
            store.upsert_membership(&org.org_id, &sub, "active").unwrap();
        }

        // No choice → 400
        let err = resolver.resolve(&sub, None).unwrap_err();
        assert!(matches!(err, Error::Validation(ref m) if m == "org_context_required"));

        // Explicit choice works
        let acme = store
            .list_orgs()
            .unwrap()
            .into_iter()
            .find(|o| o.slug == "acme")
            .unwrap();
        let context = resolver.resolve(&sub, Some(&acme.org_id)).unwrap();
        assert_eq!(context.org_slug, "acme");
    }

    #[test]
    fn requested_org_must_be_an_active_membership() {
        let (resolver, store, sub) = setup();
        let acme = store.create_org("acme", "Acme", false).unwrap();
        let globex = store.create_org("globex", "Globex", false).unwrap();
        store.upsert_membership(&acme.org_id, &sub, "active").unwrap();
        store.upsert_membership(&globex.org_id, &sub, "suspended").unwrap();

        let err = resolver.resolve(&sub, Some(&globex.org_id)).unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));
    }
}
