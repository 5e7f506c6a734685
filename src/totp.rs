//! TOTP engine — RFC 6238 enrollment, verification, lockout, backup codes.
//!
//! Suite is fixed: SHA-1, 6 digits, 30-second step (±1 step skew). Secrets
//! are wrapped with the KEK at rest; backup codes are stored as SHA-256
//! hashes and invalidated on use.
//!
//! Per-principal state machine: absent → pending (after setup init) →
//! enabled (after a verified setup code). Failed verifications within the
//! configured window increment a counter; crossing the threshold locks the
//! record until the lockout expires, during which every attempt fails with
//! `OtpLocked` without touching the counter.

use std::sync::Arc;

use base64::Engine;
use rand::{rngs::OsRng, RngCore};
use rusqlite::OptionalExtension;
use serde::Serialize;
use totp_rs::{Algorithm, Secret, TOTP};

use crate::config::TotpConfig;
use crate::db::{now, Db};
use crate::keystore::KeyStore;
use crate::store::{token_hash, Cohort};
use crate::{Error, Result};

/// Issuer shown in authenticator apps.
const OTP_ISSUER: &str = "zkauth";

/// Per-principal OTP status as reported to the UI.
#[derive(Debug, Clone, Serialize)]
pub struct TotpStatus {
    /// Fully enrolled
    pub enabled: bool,
    /// Setup started but not yet verified
    pub pending: bool,
    /// Epoch seconds until which verification is locked
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locked_until: Option<i64>,
    /// Remaining unused backup codes
    pub backup_codes_remaining: i64,
}

struct TotpRow {
    secret_wrapped: Vec<u8>,
    status: String,
    failure_count: i64,
    first_failure_at: Option<i64>,
    locked_until: Option<i64>,
}

/// TOTP engine over the database and key store.
#[derive(Clone)]
pub struct TotpEngine {
    db: Db,
    keystore: Arc<KeyStore>,
    config: TotpConfig,
}

impl TotpEngine {
    /// New engine.
    #[must_use]
    pub fn new(db: Db, keystore: Arc<KeyStore>, config: TotpConfig) -> Self {
        Self {
            db,
            keystore,
            config,
        }
    }

    fn row(&self, cohort: Cohort, principal_id: &str) -> Result<Option<TotpRow>> {
        self.db.with(|conn| {
            conn.query_row(
                "SELECT secret_wrapped, status, failure_count, first_failure_at, locked_until
                 FROM totp_records WHERE cohort = ?1 AND principal_id = ?2",
                rusqlite::params![cohort.as_str(), principal_id],
                |r| {
                    Ok(TotpRow {
                        secret_wrapped: r.get(0)?,
                        status: r.get(1)?,
                        failure_count: r.get(2)?,
                        first_failure_at: r.get(3)?,
                        locked_until: r.get(4)?,
                    })
                },
            )
            .optional()
            .map_err(Error::from)
        })
    }

    /// Whether a principal has OTP fully enabled.
    pub fn is_enabled(&self, cohort: Cohort, principal_id: &str) -> Result<bool> {
        Ok(self
            .row(cohort, principal_id)?
            .is_some_and(|r| r.status == "enabled"))
    }

    /// Status for the OTP UI.
    pub fn status(&self, cohort: Cohort, principal_id: &str) -> Result<TotpStatus> {
        let row = self.row(cohort, principal_id)?;
        let backup_codes_remaining: i64 = self.db.with(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM totp_backup_codes
                 WHERE cohort = ?1 AND principal_id = ?2 AND used_at IS NULL",
                rusqlite::params![cohort.as_str(), principal_id],
                |r| r.get(0),
            )
            .map_err(Error::from)
        })?;
        Ok(match row {
            None => TotpStatus {
                enabled: false,
                pending: false,
                locked_until: None,
                backup_codes_remaining: 0,
            },
            Some(row) => TotpStatus {
                enabled: row.status == "enabled",
                pending: row.status == "pending",
                locked_until: row.locked_until.filter(|until| *until > now()),
                backup_codes_remaining,
            },
        })
    }

    /// Begin enrollment: generate a secret, wrap it, store the record as
    /// pending. Returns (base32 secret, provisioning URI).
    pub fn setup_init(
        &self,
        cohort: Cohort,
        principal_id: &str,
        account_email: &str,
    ) -> Result<(String, String)> {
        if let Some(row) = self.row(cohort, principal_id)? {
            if row.status == "enabled" {
                return Err(Error::Conflict("OTP already enabled".to_string()));
            }
        }

        let secret = Secret::generate_secret();
        let secret_bytes = secret
            .to_bytes()
            .map_err(|e| Error::Internal(format!("secret generation: {e:?}")))?;
        let totp = self.build_totp(secret_bytes.clone(), account_email)?;
        let wrapped = self.keystore.wrap(&secret_bytes)?;

        self.db.with(|conn| {
            conn.execute(
                "INSERT INTO totp_records
                   (cohort, principal_id, secret_wrapped, status, created_at, failure_count)
                 VALUES (?1, ?2, ?3, 'pending', ?4, 0)
                 ON CONFLICT(cohort, principal_id) DO UPDATE SET
                   secret_wrapped = excluded.secret_wrapped,
                   status = 'pending',
                   failure_count = 0,
                   first_failure_at = NULL,
                   locked_until = NULL",
                rusqlite::params![cohort.as_str(), principal_id, wrapped, now()],
            )
            .map_err(Error::from)
        })?;

        Ok((secret.to_encoded().to_string(), totp.get_url()))
    }

    /// Verify the setup code; on success the record becomes enabled and the
    /// freshly generated backup codes are returned exactly once.
    pub fn setup_verify(
        &self,
        cohort: Cohort,
        principal_id: &str,
        account_email: &str,
        code: &str,
    ) -> Result<Vec<String>> {
        let row = self
            .row(cohort, principal_id)?
            .ok_or_else(|| Error::validation("OTP setup was not started"))?;
        if row.status != "pending" {
            return Err(Error::Conflict("OTP already enabled".to_string()));
        }
        self.check_lockout(&row)?;

        if !self.code_matches(&row, account_email, code)? {
            self.record_failure(cohort, principal_id, &row)?;
            return Err(Error::AuthenticationFailed);
        }

        let backup_codes: Vec<String> = (0..self.config.backup_codes)
            .map(|_| generate_backup_code())
            .collect();

        self.db.with_tx(|tx| {
            tx.execute(
                "UPDATE totp_records
                 SET status = 'enabled', failure_count = 0, first_failure_at = NULL,
                     locked_until = NULL, last_used_at = ?1
                 WHERE cohort = ?2 AND principal_id = ?3",
                rusqlite::params![now(), cohort.as_str(), principal_id],
            )?;
            tx.execute(
                "DELETE FROM totp_backup_codes WHERE cohort = ?1 AND principal_id = ?2",
                rusqlite::params![cohort.as_str(), principal_id],
            )?;
            for code in &backup_codes {
                tx.execute(
                    "INSERT INTO totp_backup_codes (cohort, principal_id, code_hash, used_at)
                     VALUES (?1, ?2, ?3, NULL)",
                    rusqlite::params![cohort.as_str(), principal_id, token_hash(code)],
                )?;
            }
            Ok(())
        })?;

        Ok(backup_codes)
    }

    /// Verify a login-time code: the current TOTP or an unused backup code.
    pub fn verify(
        &self,
        cohort: Cohort,
        principal_id: &str,
        account_email: &str,
        code: &str,
    ) -> Result<()> {
        let row = self
            .row(cohort, principal_id)?
            .ok_or(Error::AuthenticationFailed)?;
        if row.status != "enabled" {
            return Err(Error::AuthenticationFailed);
        }
        self.check_lockout(&row)?;

        if self.code_matches(&row, account_email, code)? {
            self.record_success(cohort, principal_id)?;
            return Ok(());
        }
        if self.consume_backup_code(cohort, principal_id, code)? {
            self.record_success(cohort, principal_id)?;
            return Ok(());
        }

        self.record_failure(cohort, principal_id, &row)?;
        Err(Error::AuthenticationFailed)
    }

    /// Disable OTP. Requires a currently valid TOTP or backup code.
    pub fn disable(
        &self,
        cohort: Cohort,
        principal_id: &str,
        account_email: &str,
        code: &str,
    ) -> Result<()> {
        self.verify(cohort, principal_id, account_email, code)?;
        self.db.with_tx(|tx| {
            tx.execute(
                "DELETE FROM totp_records WHERE cohort = ?1 AND principal_id = ?2",
                rusqlite::params![cohort.as_str(), principal_id],
            )?;
            tx.execute(
                "DELETE FROM totp_backup_codes WHERE cohort = ?1 AND principal_id = ?2",
                rusqlite::params![cohort.as_str(), principal_id],
            )?;
            Ok(())
        })
    }

    // ── Internals ─────────────────────────────────────────────────────────

    fn build_totp(&self, secret_bytes: Vec<u8>, account_email: &str) -> Result<TOTP> {
        TOTP::new(
            Algorithm::SHA1,
            6,
            1,
            30,
            secret_bytes,
            Some(OTP_ISSUER.to_string()),
            account_email.to_string(),
        )
        .map_err(|e| Error::Internal(format!("TOTP construction: {e}")))
    }

    fn code_matches(&self, row: &TotpRow, account_email: &str, code: &str) -> Result<bool> {
        let secret_bytes = self.keystore.unwrap(&row.secret_wrapped)?;
        let totp = self.build_totp(secret_bytes, account_email)?;
        totp.check_current(code)
            .map_err(|e| Error::Internal(format!("clock error: {e}")))
    }

    fn check_lockout(&self, row: &TotpRow) -> Result<()> {
        if let Some(until) = row.locked_until {
            let current = now();
            if until > current {
                return Err(Error::OtpLocked {
                    retry_after_secs: until - current,
                });
            }
        }
        Ok(())
    }

    fn record_success(&self, cohort: Cohort, principal_id: &str) -> Result<()> {
        self.db.with(|conn| {
            conn.execute(
                "UPDATE totp_records
                 SET failure_count = 0, first_failure_at = NULL, locked_until = NULL,
                     last_used_at = ?1
                 WHERE cohort = ?2 AND principal_id = ?3",
                rusqlite::params![now(), cohort.as_str(), principal_id],
            )
            .map_err(Error::from)
        })?;
        Ok(())
    }

    fn record_failure(&self, cohort: Cohort, principal_id: &str, row: &TotpRow) -> Result<()> {
        let current = now();
        let window_start = current - self.config.failure_window_secs;
        let (count, first_at) = match row.first_failure_at {
            Some(first) if first >= window_start => (row.failure_count + 1, first),
            _ => (1, current),
        };
        let locked_until = (count >= i64::from(self.config.max_failures))
            .then(|| current + self.config.lockout_secs);

        self.db.with(|conn| {
            conn.execute(
                "UPDATE totp_records
                 SET failure_count = ?1, first_failure_at = ?2, locked_until = ?3
                 WHERE cohort = ?4 AND principal_id = ?5",
                rusqlite::params![count, first_at, locked_until, cohort.as_str(), principal_id],
            )
            .map_err(Error::from)
        })?;
        Ok(())
    }

    fn consume_backup_code(&self, cohort: Cohort, principal_id: &str, code: &str) -> Result<bool> {
        let updated = self.db.with_tx(|tx| {
            tx.execute(
                "UPDATE totp_backup_codes SET used_at = ?1
                 WHERE cohort = ?2 AND principal_id = ?3 AND code_hash = ?4 AND used_at IS NULL",
                rusqlite::params![now(), cohort.as_str(), principal_id, token_hash(code)],
            )
            .map_err(Error::from)
        })?;
        Ok(updated == 1)
    }
}

/// Eight-character backup code, grouped for readability.
fn generate_backup_code() -> String {
    // 6 bytes → 8 base64url chars; dashes/underscores folded out so the
    // code stays double-click selectable.
    let mut bytes = [0u8; 6];
    OsRng.fill_bytes(&mut bytes);
    let encoded = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .encode(bytes)
        .to_lowercase()
        .replace(['-', '_'], "x");
    format!("{}-{}", &encoded[..4], &encoded[4..8])
}
