//! zkauth — a zero-knowledge OpenID Connect identity provider.
//!
//! The defining property: the server never learns user passwords.
//! Authentication runs an OPAQUE-style augmented PAKE between the browser
//! and the server; only an opaque envelope is persisted, useless for
//! offline password recovery. On top of that primitive the server issues
//! OIDC authorization codes, access/refresh/ID tokens (EdDSA), and can
//! relay a wrapped data-return key (DRK) that it cannot read.
//!
//! # Subsystems
//!
//! - **ake** — the aPAKE engine (OPRF over P-256, HKDF, HMAC, Ed25519)
//! - **keystore** — Argon2id-derived KEK, AES-GCM wrapping, signing keys,
//!   JWKS publication and rotation
//! - **oidc** — authorization requests, PKCE, single-use codes, refresh
//!   rotation, discovery documents
//! - **totp** — RFC 6238 enrollment/verification with lockout and backup
//!   codes
//! - **store** — SQLite persistence; sessions survive restarts
//! - **http** — the axum surface: cohort sessions, CSRF, rate limits,
//!   security headers

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod ake;
pub mod audit;
pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod http;
pub mod keystore;
pub mod oidc;
pub mod rbac;
pub mod store;
pub mod totp;

pub use error::{Error, Result};

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Setup tracing/logging.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
