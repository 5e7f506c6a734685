//! Server-side sessions — opaque ids, CSRF pairing, refresh rotation.
//!
//! The client holds only the opaque `session_id` (in an HttpOnly cookie) and
//! the paired CSRF token (in a readable cookie, echoed per request). OIDC
//! user sessions additionally carry the hash of their refresh token and the
//! rotation chain id; rotation atomically replaces the row, so a concurrent
//! attempt with the stale token finds nothing.

use rusqlite::OptionalExtension;

use crate::db::{now, Db};
use crate::{Error, Result};

use super::{random_token, token_hash, Cohort};

/// A server-side session row.
#[derive(Debug, Clone)]
pub struct Session {
    /// Opaque id held by the client
    pub session_id: String,
    /// Cohort this session belongs to
    pub cohort: Cohort,
    /// Subject or admin id
    pub principal_id: String,
    /// Bound client for OIDC user sessions
    pub client_id: Option<String>,
    /// Creation time
    pub created_at: i64,
    /// Last access
    pub last_seen_at: i64,
    /// Sliding idle deadline
    pub idle_timeout_at: i64,
    /// Hard deadline
    pub absolute_expires_at: i64,
    /// CSRF token paired with this session
    pub csrf_token: String,
    /// OTP state: `None` = not applicable, `Some(false)` = pending
    pub otp_verified: Option<bool>,
    /// Organization context
    pub org_id: Option<String>,
    /// Rotation chain id (OIDC sessions)
    pub chain_id: Option<String>,
}

/// Parameters for creating a session.
#[derive(Debug, Clone)]
pub struct NewSession {
    /// Cohort
    pub cohort: Cohort,
    /// Subject or admin id
    pub principal_id: String,
    /// Bound client (OIDC user sessions)
    pub client_id: Option<String>,
    /// Idle timeout in seconds
    pub idle_secs: i64,
    /// Absolute lifetime in seconds
    pub absolute_secs: i64,
    /// OTP state at creation
    pub otp_verified: Option<bool>,
    /// Organization context
    pub org_id: Option<String>,
    /// Rotation chain id
    pub chain_id: Option<String>,
}

/// A session plus the secrets minted with it.
#[derive(Debug, Clone)]
pub struct IssuedSession {
    /// The stored session
    pub session: Session,
    /// Plaintext refresh token (only if one was requested; never stored)
    pub refresh_token: Option<String>,
}

/// Store for sessions.
#[derive(Clone)]
pub struct SessionStore {
    db: Db,
}

impl SessionStore {
    /// New handle.
    #[must_use]
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Create a session; optionally mint a refresh token (stored hashed).
    pub fn create(&self, new: &NewSession, with_refresh: bool) -> Result<IssuedSession> {
        let created = now();
        let session = Session {
            session_id: random_token(),
            cohort: new.cohort,
            principal_id: new.principal_id.clone(),
            client_id: new.client_id.clone(),
            created_at: created,
            last_seen_at: created,
            idle_timeout_at: created + new.idle_secs,
            absolute_expires_at: created + new.absolute_secs,
            csrf_token: random_token(),
            otp_verified: new.otp_verified,
            org_id: new.org_id.clone(),
            chain_id: new.chain_id.clone(),
        };
        let refresh_token = with_refresh.then(random_token);
        let refresh_hash = refresh_token.as_deref().map(token_hash);

        self.db.with(|conn| {
            conn.execute(
                "INSERT INTO sessions
                   (session_id, cohort, principal_id, client_id, created_at, last_seen_at,
                    idle_timeout_at, absolute_expires_at, csrf_token, otp_verified, org_id,
                    refresh_token_hash, chain_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                rusqlite::params![
                    session.session_id,
                    session.cohort.as_str(),
                    session.principal_id,
                    session.client_id,
                    session.created_at,
                    session.last_seen_at,
                    session.idle_timeout_at,
                    session.absolute_expires_at,
                    session.csrf_token,
                    session.otp_verified,
                    session.org_id,
                    refresh_hash,
                    session.chain_id
                ],
            )
            .map_err(Error::from)
        })?;

        Ok(IssuedSession {
            session,
            refresh_token,
        })
    }

    /// Load a live session for its cohort and slide the idle window.
    /// Expired or wrong-cohort sessions return `None`; expired rows are
    /// dropped lazily.
    pub fn get_valid(&self, cohort: Cohort, session_id: &str, idle_secs: i64) -> Result<Option<Session>> {
        let session = self.db.with(|conn| {
            conn.query_row(
                &format!("SELECT {COLUMNS} FROM sessions WHERE session_id = ?1"),
                rusqlite::params![session_id],
                row_to_session,
            )
            .optional()
            .map_err(Error::from)
        })?;
        let Some(session) = session else {
            return Ok(None);
        };
        if session.cohort != cohort {
            return Ok(None);
        }
        let current = now();
        if session.idle_timeout_at <= current || session.absolute_expires_at <= current {
            // Lazy eviction
            let _ = self.delete(session_id);
            return Ok(None);
        }
        // Best-effort touch; no transaction needed.
        let _ = self.db.with(|conn| {
            conn.execute(
                "UPDATE sessions SET last_seen_at = ?1, idle_timeout_at = ?2 WHERE session_id = ?3",
                rusqlite::params![current, current + idle_secs, session_id],
            )
            .map_err(Error::from)
        });
        Ok(Some(session))
    }

    /// Delete a session (logout / revocation).
    pub fn delete(&self, session_id: &str) -> Result<()> {
        self.db.with(|conn| {
            conn.execute(
                "DELETE FROM sessions WHERE session_id = ?1",
                rusqlite::params![session_id],
            )
            .map_err(Error::from)
        })?;
        Ok(())
    }

    /// Mark OTP as verified for this session.
    pub fn set_otp_verified(&self, session_id: &str) -> Result<()> {
        self.db.with(|conn| {
            conn.execute(
                "UPDATE sessions SET otp_verified = 1 WHERE session_id = ?1",
                rusqlite::params![session_id],
            )
            .map_err(Error::from)
        })?;
        Ok(())
    }

    /// Rotate a refresh token in one transaction.
    ///
    /// Verifies the presented token by hash, checks the bound client and the
    /// absolute deadline, inserts the replacement row (inheriting principal,
    /// org, chain and absolute expiry) and deletes the old row. The old
    /// token is invalid before the new one is returned.
    pub fn rotate_refresh(
        &self,
        presented_token: &str,
        client_id: &str,
        idle_secs: i64,
    ) -> Result<IssuedSession> {
        let hash = token_hash(presented_token);
        let new_session_id = random_token();
        let new_csrf = random_token();
        let new_refresh = random_token();
        let new_refresh_hash = token_hash(&new_refresh);

        let session = self.db.with_tx(|tx| {
            let old: Option<Session> = tx
                .query_row(
                    &format!("SELECT {COLUMNS} FROM sessions WHERE refresh_token_hash = ?1"),
                    rusqlite::params![hash],
                    row_to_session,
                )
                .optional()?;
            let Some(old) = old else {
                return Err(Error::InvalidGrant("unknown or rotated refresh token".to_string()));
            };

            if old.absolute_expires_at <= now() {
                tx.execute(
                    "DELETE FROM sessions WHERE session_id = ?1",
                    rusqlite::params![old.session_id],
                )?;
                return Err(Error::InvalidGrant("refresh token expired".to_string()));
            }
            // A refresh token is valid only for the client it was issued to.
            if old.client_id.as_deref() != Some(client_id) {
                return Err(Error::InvalidGrant("client mismatch".to_string()));
            }

            let current = now();
            let new_session = Session {
                session_id: new_session_id.clone(),
                cohort: old.cohort,
                principal_id: old.principal_id.clone(),
                client_id: old.client_id.clone(),
                created_at: current,
                last_seen_at: current,
                idle_timeout_at: current + idle_secs,
                absolute_expires_at: old.absolute_expires_at,
                csrf_token: new_csrf.clone(),
                otp_verified: old.otp_verified,
                org_id: old.org_id.clone(),
                chain_id: old.chain_id.clone(),
            };
            tx.execute(
                "INSERT INTO sessions
                   (session_id, cohort, principal_id, client_id, created_at, last_seen_at,
                    idle_timeout_at, absolute_expires_at, csrf_token, otp_verified, org_id,
                    refresh_token_hash, chain_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                rusqlite::params![
                    new_session.session_id,
                    new_session.cohort.as_str(),
                    new_session.principal_id,
                    new_session.client_id,
                    new_session.created_at,
                    new_session.last_seen_at,
                    new_session.idle_timeout_at,
                    new_session.absolute_expires_at,
                    new_session.csrf_token,
                    new_session.otp_verified,
                    new_session.org_id,
                    new_refresh_hash,
                    new_session.chain_id
                ],
            )?;
            tx.execute(
                "DELETE FROM sessions WHERE session_id = ?1",
                rusqlite::params![old.session_id],
            )?;
            Ok(new_session)
        })?;

        Ok(IssuedSession {
            session,
            refresh_token: Some(new_refresh),
        })
    }

    /// Delete every session for a principal (admin revocation).
    pub fn delete_for_principal(&self, cohort: Cohort, principal_id: &str) -> Result<usize> {
        self.db.with(|conn| {
            conn.execute(
                "DELETE FROM sessions WHERE cohort = ?1 AND principal_id = ?2",
                rusqlite::params![cohort.as_str(), principal_id],
            )
            .map_err(Error::from)
        })
    }

    /// Remove sessions past either deadline.
    pub fn sweep(&self) -> Result<usize> {
        self.db.with(|conn| {
            conn.execute(
                "DELETE FROM sessions WHERE idle_timeout_at <= ?1 OR absolute_expires_at <= ?1",
                rusqlite::params![now()],
            )
            .map_err(Error::from)
        })
    }
}

const COLUMNS: &str = "session_id, cohort, principal_id, client_id, created_at, last_seen_at,
                       idle_timeout_at, absolute_expires_at, csrf_token, otp_verified, org_id,
                       chain_id";

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    let cohort: String = row.get(1)?;
    Ok(Session {
        session_id: row.get(0)?,
        cohort: Cohort::parse(&cohort).unwrap_or(Cohort::User),
        principal_id: row.get(2)?,
        client_id: row.get(3)?,
        created_at: row.get(4)?,
        last_seen_at: row.get(5)?,
        idle_timeout_at: row.get(6)?,
        absolute_expires_at: row.get(7)?,
        csrf_token: row.get(8)?,
        otp_verified: row.get(9)?,
        org_id: row.get(10)?,
        chain_id: row.get(11)?,
    })
}
