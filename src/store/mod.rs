//! Entity stores over the SQLite database.
//!
//! Each store is a thin, cloneable handle around [`Db`]. State-changing
//! operations that must be single-winner (login-session consumption, code
//! redemption, refresh rotation) run inside write transactions; see the
//! concurrency notes in [`crate::db`].

pub mod auth_requests;
pub mod clients;
pub mod codes;
pub mod credentials;
pub mod install;
pub mod login_sessions;
pub mod rbac;
pub mod sessions;
pub mod settings;
pub mod subjects;

use base64::Engine;
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};

/// Principal cohort. Admin and user surfaces are strictly isolated; the
/// cohort is always an explicit parameter, never inferred from a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cohort {
    /// End users (OIDC subjects)
    User,
    /// Administrators
    Admin,
}

impl Cohort {
    /// Stable string form used in storage and audit events.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Admin => "admin",
        }
    }

    /// Parse the stored form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }
}

/// A fresh high-entropy token: 32 random bytes, base64url without padding.
#[must_use]
pub fn random_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// SHA-256 of a token string; the storage representation of every secret
/// token (refresh tokens, backup codes, install tokens).
#[must_use]
pub fn token_hash(token: &str) -> Vec<u8> {
    Sha256::digest(token.as_bytes()).to_vec()
}
