//! Authorization codes — issuance and single-use redemption.
//!
//! Redemption is the concurrency-critical path: the whole check-and-consume
//! runs in one immediate write transaction, so two concurrent redemptions of
//! the same code produce exactly one success. A redemption attempt against
//! an already-consumed code additionally revokes every session in the
//! refresh chain that was minted from it.

use rusqlite::OptionalExtension;

use crate::db::{now, Db};
use crate::{Error, Result};

use super::random_token;

/// A persisted authorization code.
#[derive(Debug, Clone)]
pub struct AuthorizationCode {
    /// The random single-use code value
    pub code: String,
    /// Originating authorization request
    pub auth_request_id: String,
    /// Authenticated subject
    pub sub: String,
    /// Client the code was issued to
    pub client_id: String,
    /// Redirect URI bound at authorization time
    pub redirect_uri: String,
    /// Scope
    pub scope: String,
    /// Nonce copied from the authorization request
    pub nonce: Option<String>,
    /// PKCE challenge copied from the authorization request
    pub code_challenge: Option<String>,
    /// Client-supplied wrapped DRK (JWE), if the zk channel is active
    pub wrapped_drk: Option<String>,
    /// Caller's ephemeral public key for the zk channel
    pub zk_client_pub: Option<String>,
    /// Resolved organization context
    pub org_id: Option<String>,
    /// Refresh chain minted at redemption (set in the redeeming transaction)
    pub chain_id: Option<String>,
    /// Issue time
    pub issued_at: i64,
    /// Expiry (≤ 60 s after issue)
    pub expires_at: i64,
    /// Consumption time, set atomically with token issuance
    pub consumed_at: Option<i64>,
}

/// Fields bound into a code at finalize time.
#[derive(Debug, Clone)]
pub struct NewCode {
    /// Originating authorization request
    pub auth_request_id: String,
    /// Authenticated subject
    pub sub: String,
    /// Client
    pub client_id: String,
    /// Redirect URI
    pub redirect_uri: String,
    /// Scope
    pub scope: String,
    /// Nonce from the authorization request
    pub nonce: Option<String>,
    /// PKCE challenge from the authorization request
    pub code_challenge: Option<String>,
    /// Wrapped DRK blob
    pub wrapped_drk: Option<String>,
    /// Caller's ephemeral public key
    pub zk_client_pub: Option<String>,
    /// Organization context
    pub org_id: Option<String>,
}

/// Store for authorization codes.
#[derive(Clone)]
pub struct CodeStore {
    db: Db,
    ttl_secs: i64,
}

impl CodeStore {
    /// New handle.
    #[must_use]
    pub fn new(db: Db, ttl_secs: i64) -> Self {
        Self { db, ttl_secs }
    }

    /// Issue a fresh random code.
    pub fn issue(&self, new: &NewCode) -> Result<String> {
        let code = random_token();
        let issued = now();
        self.db.with(|conn| {
            conn.execute(
                "INSERT INTO authorization_codes
                   (code, auth_request_id, sub, client_id, redirect_uri, scope, nonce,
                    code_challenge, wrapped_drk, zk_client_pub, org_id, chain_id,
                    issued_at, expires_at, consumed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, NULL, ?12, ?13, NULL)",
                rusqlite::params![
                    code,
                    new.auth_request_id,
                    new.sub,
                    new.client_id,
                    new.redirect_uri,
                    new.scope,
                    new.nonce,
                    new.code_challenge,
                    new.wrapped_drk,
                    new.zk_client_pub,
                    new.org_id,
                    issued,
                    issued + self.ttl_secs
                ],
            )
            .map_err(Error::from)
        })?;
        Ok(code)
    }

    /// Redeem a code exactly once.
    ///
    /// Inside one write transaction: load the row, fail on replay (revoking
    /// the derived refresh chain), expiry, client or redirect mismatch, run
    /// the caller's PKCE verifier, then set `consumed_at` and the new chain
    /// id, and mark the originating authorization request consumed.
    pub fn redeem(
        &self,
        code: &str,
        client_id: &str,
        redirect_uri: &str,
        chain_id: &str,
        verify_pkce: impl FnOnce(Option<&str>) -> Result<()>,
    ) -> Result<AuthorizationCode> {
        self.db.with_tx(|tx| {
            let row: Option<AuthorizationCode> = tx
                .query_row(
                    "SELECT code, auth_request_id, sub, client_id, redirect_uri, scope, nonce,
                            code_challenge, wrapped_drk, zk_client_pub, org_id, chain_id,
                            issued_at, expires_at, consumed_at
                     FROM authorization_codes WHERE code = ?1",
                    rusqlite::params![code],
                    row_to_code,
                )
                .optional()?;
            let Some(mut row) = row else {
                return Err(Error::InvalidGrant("unknown authorization code".to_string()));
            };

            if row.consumed_at.is_some() {
                // Replay: revoke every session descended from this code.
                if let Some(ref chain) = row.chain_id {
                    tx.execute(
                        "DELETE FROM sessions WHERE chain_id = ?1",
                        rusqlite::params![chain],
                    )?;
                }
                return Err(Error::InvalidGrant(
                    "authorization code already consumed".to_string(),
                ));
            }
            if row.expires_at <= now() {
                return Err(Error::InvalidGrant("authorization code expired".to_string()));
            }
            if row.client_id != client_id {
                return Err(Error::InvalidGrant("client mismatch".to_string()));
            }
            if row.redirect_uri != redirect_uri {
                return Err(Error::InvalidGrant("redirect_uri mismatch".to_string()));
            }
            verify_pkce(row.code_challenge.as_deref())?;

            let consumed = now();
            tx.execute(
                "UPDATE authorization_codes SET consumed_at = ?1, chain_id = ?2 WHERE code = ?3",
                rusqlite::params![consumed, chain_id, code],
            )?;
            tx.execute(
                "UPDATE auth_requests SET status = 'consumed' WHERE id = ?1",
                rusqlite::params![row.auth_request_id],
            )?;

            row.consumed_at = Some(consumed);
            row.chain_id = Some(chain_id.to_string());
            Ok(row)
        })
    }

    /// Remove expired, unconsumed codes.
    pub fn sweep(&self) -> Result<usize> {
        self.db.with(|conn| {
            conn.execute(
                "DELETE FROM authorization_codes
                 WHERE expires_at <= ?1 AND consumed_at IS NULL",
                rusqlite::params![now()],
            )
            .map_err(Error::from)
        })
    }
}

fn row_to_code(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuthorizationCode> {
    Ok(AuthorizationCode {
        code: row.get(0)?,
        auth_request_id: row.get(1)?,
        sub: row.get(2)?,
        client_id: row.get(3)?,
        redirect_uri: row.get(4)?,
        scope: row.get(5)?,
        nonce: row.get(6)?,
        code_challenge: row.get(7)?,
        wrapped_drk: row.get(8)?,
        zk_client_pub: row.get(9)?,
        org_id: row.get(10)?,
        chain_id: row.get(11)?,
        issued_at: row.get(12)?,
        expires_at: row.get(13)?,
        consumed_at: row.get(14)?,
    })
}
