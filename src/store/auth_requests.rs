//! Persisted OIDC authorization requests.
//!
//! An authorization request is created by `GET /authorize`, finalized after
//! login into an authorization code, and marked consumed when that code is
//! redeemed. The nonce captured here must survive verbatim into the ID
//! token.

use rusqlite::OptionalExtension;
use serde::Serialize;

use crate::db::{now, Db};
use crate::{Error, Result};

/// Status of an authorization request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthRequestStatus {
    /// Waiting for the user to authenticate
    Pending,
    /// Converted into an authorization code
    Finalized,
    /// The code was redeemed
    Consumed,
}

impl AuthRequestStatus {
    fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Finalized => "finalized",
            Self::Consumed => "consumed",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "finalized" => Self::Finalized,
            "consumed" => Self::Consumed,
            _ => Self::Pending,
        }
    }
}

/// A persisted authorization request.
#[derive(Debug, Clone, Serialize)]
pub struct AuthRequest {
    /// Server-generated id
    pub id: String,
    /// Requesting client
    pub client_id: String,
    /// Exact redirect URI from the request
    pub redirect_uri: String,
    /// Always `code`
    pub response_type: String,
    /// Requested scope
    pub scope: String,
    /// Client state, echoed on redirect
    pub state: Option<String>,
    /// Nonce, preserved through to the ID token
    pub nonce: Option<String>,
    /// PKCE challenge (base64url SHA-256 of the verifier)
    pub code_challenge: Option<String>,
    /// Always `S256` when present
    pub code_challenge_method: Option<String>,
    /// Caller's ephemeral public key for the wrapped-DRK channel
    pub zk_pub_key: Option<String>,
    /// Origin header captured at the authorization endpoint
    pub request_origin: Option<String>,
    /// Lifecycle status
    pub status: AuthRequestStatus,
    /// Creation time
    pub created_at: i64,
    /// Expiry (≤ 10 minutes after creation)
    pub expires_at: i64,
}

/// Fields captured when persisting a new authorization request.
#[derive(Debug, Clone)]
pub struct NewAuthRequest {
    /// Requesting client
    pub client_id: String,
    /// Exact redirect URI
    pub redirect_uri: String,
    /// Requested scope
    pub scope: String,
    /// Client state
    pub state: Option<String>,
    /// Nonce
    pub nonce: Option<String>,
    /// PKCE challenge
    pub code_challenge: Option<String>,
    /// PKCE method
    pub code_challenge_method: Option<String>,
    /// Origin header
    pub request_origin: Option<String>,
}

/// Store for authorization requests.
#[derive(Clone)]
pub struct AuthRequestStore {
    db: Db,
    ttl_secs: i64,
}

impl AuthRequestStore {
    /// New handle.
    #[must_use]
    pub fn new(db: Db, ttl_secs: i64) -> Self {
        Self { db, ttl_secs }
    }

    /// Persist a new pending request; returns its server-generated id.
    pub fn create(&self, new: &NewAuthRequest) -> Result<AuthRequest> {
        let id = uuid::Uuid::new_v4().to_string();
        let created = now();
        self.db.with(|conn| {
            conn.execute(
                "INSERT INTO auth_requests
                   (id, client_id, redirect_uri, response_type, scope, state, nonce,
                    code_challenge, code_challenge_method, zk_pub_key, request_origin,
                    status, created_at, expires_at)
                 VALUES (?1, ?2, ?3, 'code', ?4, ?5, ?6, ?7, ?8, NULL, ?9, 'pending', ?10, ?11)",
                rusqlite::params![
                    id,
                    new.client_id,
                    new.redirect_uri,
                    new.scope,
                    new.state,
                    new.nonce,
                    new.code_challenge,
                    new.code_challenge_method,
                    new.request_origin,
                    created,
                    created + self.ttl_secs
                ],
            )
            .map_err(Error::from)
        })?;
        self.get(&id)?
            .ok_or_else(|| Error::Internal("auth request vanished after insert".to_string()))
    }

    /// Look up by id.
    pub fn get(&self, id: &str) -> Result<Option<AuthRequest>> {
        self.db.with(|conn| {
            conn.query_row(
                "SELECT id, client_id, redirect_uri, response_type, scope, state, nonce,
                        code_challenge, code_challenge_method, zk_pub_key, request_origin,
                        status, created_at, expires_at
                 FROM auth_requests WHERE id = ?1",
                rusqlite::params![id],
                row_to_request,
            )
            .optional()
            .map_err(Error::from)
        })
    }

    /// Load a request that is still pending and unexpired, for finalize.
    pub fn get_pending(&self, id: &str) -> Result<AuthRequest> {
        let request = self
            .get(id)?
            .ok_or_else(|| Error::not_found(format!("auth request {id}")))?;
        if request.status != AuthRequestStatus::Pending {
            return Err(Error::Conflict("authorization request already used".to_string()));
        }
        if request.expires_at <= now() {
            return Err(Error::validation("authorization request expired"));
        }
        Ok(request)
    }

    /// Attach the caller's ephemeral public key (wrapped-DRK channel).
    pub fn set_zk_pub_key(&self, id: &str, zk_pub_key: &str) -> Result<()> {
        self.db.with(|conn| {
            conn.execute(
                "UPDATE auth_requests SET zk_pub_key = ?1 WHERE id = ?2",
                rusqlite::params![zk_pub_key, id],
            )
            .map_err(Error::from)
        })?;
        Ok(())
    }

    /// Transition pending → finalized. Guarded so a request finalizes once.
    pub fn mark_finalized(&self, id: &str) -> Result<()> {
        let updated = self.db.with(|conn| {
            conn.execute(
                "UPDATE auth_requests SET status = 'finalized'
                 WHERE id = ?1 AND status = 'pending'",
                rusqlite::params![id],
            )
            .map_err(Error::from)
        })?;
        if updated == 0 {
            return Err(Error::Conflict("authorization request already finalized".to_string()));
        }
        Ok(())
    }

    /// Remove expired requests.
    pub fn sweep(&self) -> Result<usize> {
        self.db.with(|conn| {
            conn.execute(
                "DELETE FROM auth_requests WHERE expires_at <= ?1 AND status = 'pending'",
                rusqlite::params![now()],
            )
            .map_err(Error::from)
        })
    }
}

fn row_to_request(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuthRequest> {
    let status: String = row.get(11)?;
    Ok(AuthRequest {
        id: row.get(0)?,
        client_id: row.get(1)?,
        redirect_uri: row.get(2)?,
        response_type: row.get(3)?,
        scope: row.get(4)?,
        state: row.get(5)?,
        nonce: row.get(6)?,
        code_challenge: row.get(7)?,
        code_challenge_method: row.get(8)?,
        zk_pub_key: row.get(9)?,
        request_origin: row.get(10)?,
        status: AuthRequestStatus::parse(&status),
        created_at: row.get(12)?,
        expires_at: row.get(13)?,
    })
}
