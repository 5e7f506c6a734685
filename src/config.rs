//! Configuration management
//!
//! Configuration is layered: built-in defaults, then a YAML file, then
//! `ZKAUTH_`-prefixed environment variables (double underscore as the
//! section separator, e.g. `ZKAUTH_SERVER__PORT=9090`).

use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// HTTP server configuration
    pub server: ServerConfig,
    /// Persistence configuration
    pub database: DatabaseConfig,
    /// Key-store configuration
    pub keystore: KeystoreConfig,
    /// Session lifetimes and cookie policy
    pub sessions: SessionConfig,
    /// OIDC issuance parameters
    pub oidc: OidcConfig,
    /// TOTP lockout policy
    pub totp: TotpConfig,
    /// Per-route rate limits
    pub rate_limits: RateLimitConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address
    pub host: String,
    /// Bind port
    pub port: u16,
    /// Public issuer URL (used in tokens and discovery documents)
    pub issuer: String,
    /// Origins allowed for CORS. Reflected explicitly; never `*` with credentials.
    pub allowed_origins: Vec<String>,
    /// Development mode: HSTS off, cookies not marked Secure
    pub development: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9080,
            issuer: "http://127.0.0.1:9080".to_string(),
            allowed_origins: Vec::new(),
            development: false,
        }
    }
}

/// Persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file
    pub path: String,
    /// Busy timeout for database calls
    pub busy_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "zkauth.db".to_string(),
            busy_timeout_secs: 5,
        }
    }
}

/// Key-store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeystoreConfig {
    /// Environment variable holding the KEK passphrase
    pub passphrase_env: String,
    /// Argon2id memory cost in KiB (used at install only; persisted after)
    pub kdf_memory_kib: u32,
    /// Argon2id iteration count (used at install only; persisted after)
    pub kdf_iterations: u32,
    /// Argon2id parallelism (used at install only; persisted after)
    pub kdf_parallelism: u32,
}

impl Default for KeystoreConfig {
    fn default() -> Self {
        Self {
            passphrase_env: "ZKAUTH_KEK_PASSPHRASE".to_string(),
            // 64 MiB / 3 passes lands well above 250 ms on commodity hardware
            kdf_memory_kib: 64 * 1024,
            kdf_iterations: 3,
            kdf_parallelism: 1,
        }
    }
}

/// Session lifetimes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Idle timeout in seconds (default 30 min)
    pub idle_timeout_secs: i64,
    /// Absolute lifetime for admin sessions in seconds (default 24 h)
    pub admin_absolute_secs: i64,
    /// Default absolute lifetime for user OIDC sessions in seconds
    /// (overridable per client)
    pub user_absolute_secs: i64,
    /// Login-session (aPAKE handshake) TTL in seconds (default 5 min)
    pub login_ttl_secs: i64,
    /// Sweep interval for expired login sessions
    pub sweep_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 30 * 60,
            admin_absolute_secs: 24 * 3600,
            user_absolute_secs: 24 * 3600,
            login_ttl_secs: 5 * 60,
            sweep_interval_secs: 60,
        }
    }
}

/// OIDC issuance parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OidcConfig {
    /// Authorization-request TTL in seconds (≤ 10 min)
    pub auth_request_ttl_secs: i64,
    /// Authorization-code TTL in seconds (≤ 60 s)
    pub code_ttl_secs: i64,
    /// ID / access token lifetime in seconds
    pub token_ttl_secs: i64,
}

impl Default for OidcConfig {
    fn default() -> Self {
        Self {
            auth_request_ttl_secs: 10 * 60,
            code_ttl_secs: 60,
            token_ttl_secs: 15 * 60,
        }
    }
}

/// TOTP lockout policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TotpConfig {
    /// Consecutive failures before lockout
    pub max_failures: u32,
    /// Window in which failures are counted, in seconds
    pub failure_window_secs: i64,
    /// Lockout duration in seconds
    pub lockout_secs: i64,
    /// Number of backup codes generated at enrollment
    pub backup_codes: usize,
}

impl Default for TotpConfig {
    fn default() -> Self {
        Self {
            max_failures: 5,
            failure_window_secs: 10 * 60,
            lockout_secs: 15 * 60,
            backup_codes: 10,
        }
    }
}

/// Per-route-class rate limits, requests per minute per (route, ip)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Whether rate limiting is enforced
    pub enabled: bool,
    /// Login / register / token endpoints
    pub auth_per_minute: u32,
    /// OTP verification endpoints
    pub otp_per_minute: u32,
    /// Everything else
    pub general_per_minute: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auth_per_minute: 10,
            otp_per_minute: 10,
            general_per_minute: 120,
        }
    }
}

impl Config {
    /// Load configuration from an optional YAML file plus environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        figment
            .merge(Env::prefixed("ZKAUTH_").split("__"))
            .extract()
            .map_err(|e| Error::Internal(format!("configuration error: {e}")))
    }

    /// Database busy timeout as a [`Duration`]
    #[must_use]
    pub fn db_busy_timeout(&self) -> Duration {
        Duration::from_secs(self.database.busy_timeout_secs)
    }
}
