//! Relying-party client registry.

use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};

use crate::db::{now, Db};
use crate::{Error, Result};

/// Zero-knowledge DRK delivery mode for a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ZkDelivery {
    /// No DRK channel
    #[serde(rename = "none")]
    None,
    /// Wrapped DRK travels as a JWE returned with the token response
    #[serde(rename = "fragment-jwe")]
    FragmentJwe,
}

impl ZkDelivery {
    fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::FragmentJwe => "fragment-jwe",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "fragment-jwe" => Self::FragmentJwe,
            _ => Self::None,
        }
    }
}

/// A registered relying party.
#[derive(Debug, Clone, Serialize)]
pub struct Client {
    /// OAuth client id
    pub client_id: String,
    /// Display name
    pub name: String,
    /// Registered redirect URIs; matched by exact string equality
    pub redirect_uris: Vec<String>,
    /// PKCE required even for confidential clients
    pub require_pkce: bool,
    /// Public client (no secret; PKCE always required)
    pub public: bool,
    /// DRK delivery mode
    pub zk_delivery: ZkDelivery,
    /// JWE algorithms accepted on wrapped DRK blobs
    pub allowed_jwe_algs: Vec<String>,
    /// JWE encodings accepted on wrapped DRK blobs
    pub allowed_jwe_encs: Vec<String>,
    /// Absolute refresh-token lifetime override, seconds
    pub refresh_lifetime_secs: Option<i64>,
    /// Creation time
    pub created_at: i64,
}

impl Client {
    /// Whether this client must present PKCE.
    #[must_use]
    pub fn pkce_required(&self) -> bool {
        self.public || self.require_pkce
    }
}

/// Fields accepted when creating or updating a client.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientUpsert {
    /// OAuth client id
    pub client_id: String,
    /// Display name
    pub name: String,
    /// Registered redirect URIs
    pub redirect_uris: Vec<String>,
    /// PKCE required flag
    #[serde(default = "default_true")]
    pub require_pkce: bool,
    /// Public-client flag
    #[serde(default = "default_true")]
    pub public: bool,
    /// DRK delivery mode
    #[serde(default = "default_zk_delivery")]
    pub zk_delivery: ZkDelivery,
    /// Allowed JWE algorithms (defaults to ECDH-ES)
    #[serde(default = "default_jwe_algs")]
    pub allowed_jwe_algs: Vec<String>,
    /// Allowed JWE encodings (defaults to A256GCM)
    #[serde(default = "default_jwe_encs")]
    pub allowed_jwe_encs: Vec<String>,
    /// Refresh lifetime override
    #[serde(default)]
    pub refresh_lifetime_secs: Option<i64>,
}

fn default_true() -> bool {
    true
}
fn default_zk_delivery() -> ZkDelivery {
    ZkDelivery::None
}
fn default_jwe_algs() -> Vec<String> {
    vec!["ECDH-ES".to_string()]
}
fn default_jwe_encs() -> Vec<String> {
    vec!["A256GCM".to_string()]
}

/// Store for relying-party clients.
#[derive(Clone)]
pub struct ClientStore {
    db: Db,
}

impl ClientStore {
    /// New handle.
    #[must_use]
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Create a client.
    pub fn create(&self, upsert: &ClientUpsert) -> Result<Client> {
        if upsert.redirect_uris.is_empty() {
            return Err(Error::validation("at least one redirect_uri is required"));
        }
        self.db.with(|conn| {
            conn.execute(
                "INSERT INTO clients (client_id, name, redirect_uris, require_pkce, public,
                                      zk_delivery, allowed_jwe_algs, allowed_jwe_encs,
                                      refresh_lifetime_secs, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                rusqlite::params![
                    upsert.client_id,
                    upsert.name,
                    serde_json::to_string(&upsert.redirect_uris)?,
                    upsert.require_pkce,
                    upsert.public,
                    upsert.zk_delivery.as_str(),
                    serde_json::to_string(&upsert.allowed_jwe_algs)?,
                    serde_json::to_string(&upsert.allowed_jwe_encs)?,
                    upsert.refresh_lifetime_secs,
                    now()
                ],
            )
            .map_err(Error::from)
        })?;
        self.get(&upsert.client_id)?
            .ok_or_else(|| Error::Internal("client vanished after insert".to_string()))
    }

    /// Look up by client id.
    pub fn get(&self, client_id: &str) -> Result<Option<Client>> {
        self.db.with(|conn| {
            conn.query_row(
                "SELECT client_id, name, redirect_uris, require_pkce, public, zk_delivery,
                        allowed_jwe_algs, allowed_jwe_encs, refresh_lifetime_secs, created_at
                 FROM clients WHERE client_id = ?1",
                rusqlite::params![client_id],
                row_to_client,
            )
            .optional()
            .map_err(Error::from)
        })
    }

    /// All clients.
    pub fn list(&self) -> Result<Vec<Client>> {
        self.db.with(|conn| {
            let mut stmt = conn.prepare(
                "SELECT client_id, name, redirect_uris, require_pkce, public, zk_delivery,
                        allowed_jwe_algs, allowed_jwe_encs, refresh_lifetime_secs, created_at
                 FROM clients ORDER BY created_at DESC",
            )?;
            let rows = stmt.query_map([], row_to_client)?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(Error::from)
        })
    }

    /// Replace a client's mutable fields.
    pub fn update(&self, upsert: &ClientUpsert) -> Result<Client> {
        let updated = self.db.with(|conn| {
            conn.execute(
                "UPDATE clients SET name = ?2, redirect_uris = ?3, require_pkce = ?4,
                        public = ?5, zk_delivery = ?6, allowed_jwe_algs = ?7,
                        allowed_jwe_encs = ?8, refresh_lifetime_secs = ?9
                 WHERE client_id = ?1",
                rusqlite::params![
                    upsert.client_id,
                    upsert.name,
                    serde_json::to_string(&upsert.redirect_uris)?,
                    upsert.require_pkce,
                    upsert.public,
                    upsert.zk_delivery.as_str(),
                    serde_json::to_string(&upsert.allowed_jwe_algs)?,
                    serde_json::to_string(&upsert.allowed_jwe_encs)?,
                    upsert.refresh_lifetime_secs
                ],
            )
            .map_err(Error::from)
        })?;
        if updated == 0 {
            return Err(Error::not_found(format!("client {}", upsert.client_id)));
        }
        self.get(&upsert.client_id)?
            .ok_or_else(|| Error::Internal("client vanished after update".to_string()))
    }

    /// Delete a client.
    pub fn delete(&self, client_id: &str) -> Result<()> {
        let deleted = self.db.with(|conn| {
            conn.execute(
                "DELETE FROM clients WHERE client_id = ?1",
                rusqlite::params![client_id],
            )
            .map_err(Error::from)
        })?;
        if deleted == 0 {
            return Err(Error::not_found(format!("client {client_id}")));
        }
        Ok(())
    }
}

fn row_to_client(row: &rusqlite::Row<'_>) -> rusqlite::Result<Client> {
    let redirect_uris: String = row.get(2)?;
    let zk_delivery: String = row.get(5)?;
    let algs: String = row.get(6)?;
    let encs: String = row.get(7)?;
    Ok(Client {
        client_id: row.get(0)?,
        name: row.get(1)?,
        redirect_uris: serde_json::from_str(&redirect_uris).unwrap_or_default(),
        require_pkce: row.get(3)?,
        public: row.get(4)?,
        zk_delivery: ZkDelivery::parse(&zk_delivery),
        allowed_jwe_algs: serde_json::from_str(&algs).unwrap_or_default(),
        allowed_jwe_encs: serde_json::from_str(&encs).unwrap_or_default(),
        refresh_lifetime_secs: row.get(8)?,
        created_at: row.get(9)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upsert(id: &str) -> ClientUpsert {
        ClientUpsert {
            client_id: id.to_string(),
            name: "Web App".to_string(),
            redirect_uris: vec!["https://app/cb".to_string()],
            require_pkce: true,
            public: true,
            zk_delivery: ZkDelivery::FragmentJwe,
            allowed_jwe_algs: default_jwe_algs(),
            allowed_jwe_encs: default_jwe_encs(),
            refresh_lifetime_secs: None,
        }
    }

    #[test]
    fn create_and_get_client() {
        let store = ClientStore::new(Db::open_in_memory().unwrap());
        store.create(&upsert("app-web")).unwrap();
        let client = store.get("app-web").unwrap().unwrap();
        assert_eq!(client.redirect_uris, vec!["https://app/cb"]);
        assert_eq!(client.zk_delivery, ZkDelivery::FragmentJwe);
        assert!(client.pkce_required());
        assert_eq!(client.allowed_jwe_algs, vec!["ECDH-ES"]);
    }

    #[test]
    fn create_without_redirect_uri_fails() {
        let store = ClientStore::new(Db::open_in_memory().unwrap());
        let mut bad = upsert("app-web");
        bad.redirect_uris.clear();
        assert!(matches!(store.create(&bad), Err(Error::Validation(_))));
    }

    #[test]
    fn duplicate_client_id_conflicts() {
        let store = ClientStore::new(Db::open_in_memory().unwrap());
        store.create(&upsert("app-web")).unwrap();
        assert!(matches!(store.create(&upsert("app-web")), Err(Error::Conflict(_))));
    }

    #[test]
    fn pkce_required_for_confidential_client_with_flag() {
        let store = ClientStore::new(Db::open_in_memory().unwrap());
        let mut confidential = upsert("backend");
        confidential.public = false;
        confidential.require_pkce = false;
        store.create(&confidential).unwrap();
        assert!(!store.get("backend").unwrap().unwrap().pkce_required());
    }

    #[test]
    fn update_missing_client_is_not_found() {
        let store = ClientStore::new(Db::open_in_memory().unwrap());
        assert!(matches!(store.update(&upsert("ghost")), Err(Error::NotFound(_))));
    }
}
