//! Login-session store — short-lived aPAKE handshake state.
//!
//! Each row holds the opaque server transcript state between KE1 and KE3,
//! bound to the principal it was started for. Rows are single-use: `take`
//! reads and deletes in one transaction, so concurrent KE3s see at most one
//! success. A periodic sweep removes rows that expired without a KE3.

use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};

use crate::db::{now, Db};
use crate::{Error, Result};

use super::{random_token, Cohort};

/// What the server needs to finish a login: the engine state plus the bound
/// identity, serialized into the row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingLogin {
    /// Opaque AKE transcript state
    pub state: crate::ake::ServerLoginState,
    /// Principal this handshake is bound to
    pub principal_id: String,
    /// Email the handshake was bound to
    pub email: String,
}

/// Store for pending logins.
#[derive(Clone)]
pub struct LoginSessionStore {
    db: Db,
    ttl_secs: i64,
}

impl LoginSessionStore {
    /// New handle with the configured TTL (≤ 5 minutes).
    #[must_use]
    pub fn new(db: Db, ttl_secs: i64) -> Self {
        Self { db, ttl_secs }
    }

    /// Persist a pending login and return its fresh session id
    /// (32 bytes of entropy, base64url).
    pub fn create(&self, cohort: Cohort, pending: &PendingLogin) -> Result<String> {
        let id = random_token();
        let state = serde_json::to_vec(pending)?;
        let created = now();
        self.db.with(|conn| {
            conn.execute(
                "INSERT INTO login_sessions (id, cohort, state, created_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![id, cohort.as_str(), state, created, created + self.ttl_secs],
            )
            .map_err(Error::from)
        })?;
        Ok(id)
    }

    /// Atomically take (read + delete) a pending login. Returns `None` for
    /// unknown, expired, or wrong-cohort ids — indistinguishable on purpose.
    pub fn take(&self, cohort: Cohort, id: &str) -> Result<Option<PendingLogin>> {
        self.db.with_tx(|tx| {
            let row: Option<(String, Vec<u8>, i64)> = tx
                .query_row(
                    "SELECT cohort, state, expires_at FROM login_sessions WHERE id = ?1",
                    rusqlite::params![id],
                    |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
                )
                .optional()?;
            let Some((row_cohort, state, expires_at)) = row else {
                return Ok(None);
            };
            // Single-use regardless of outcome.
            tx.execute(
                "DELETE FROM login_sessions WHERE id = ?1",
                rusqlite::params![id],
            )?;
            if row_cohort != cohort.as_str() || expires_at <= now() {
                return Ok(None);
            }
            Ok(Some(serde_json::from_slice(&state)?))
        })
    }

    /// Remove expired rows. Returns how many were swept.
    pub fn sweep(&self) -> Result<usize> {
        self.db.with(|conn| {
            conn.execute(
                "DELETE FROM login_sessions WHERE expires_at <= ?1",
                rusqlite::params![now()],
            )
            .map_err(Error::from)
        })
    }
}
