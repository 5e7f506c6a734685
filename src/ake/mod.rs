//! Augmented PAKE engine — OPAQUE-style registration and login.
//!
//! # Suite (fixed)
//!
//! | Piece | Choice |
//! |-------|--------|
//! | OPRF group | NIST P-256, SHA-256, try-and-increment hash-to-group |
//! | KDF | HKDF-SHA256 |
//! | MAC | HMAC-SHA256 |
//! | Server authentication | Ed25519 signature over the transcript |
//! | Key agreement | ephemeral P-256 ECDH |
//!
//! # Shape
//!
//! The engine is pure: every function takes its inputs (OPRF seed, AKE
//! identity key, stored credential material, wire messages) and returns
//! outputs without touching storage. Multi-step login state is serialized
//! by the caller into the login-session store between KE1 and KE3.
//!
//! The server's OPRF key for a principal is derived from the OPRF seed and
//! the principal's **stable id** — never the email — so an email change
//! cannot silently detach a credential.
//!
//! Registration (server side):
//! 1. Client sends a blinded password element.
//! 2. Server evaluates the OPRF and returns the evaluation plus its
//!    long-term public key.
//! 3. Client returns a record: envelope (nonce ‖ MAC binding the server key
//!    and both identities) and its long-term public key, both derived from
//!    the password.
//! 4. Server persists the record and the public key **it sent in step 2**.
//!
//! Login is three messages (KE1/KE2/KE3); both sides derive a fresh session
//! key from ephemeral ECDH while the envelope MAC and two signatures tie the
//! exchange to the password and the server identity. A failure anywhere
//! surfaces as one opaque [`AkeError::AuthenticationFailed`].
//!
//! The export key is deterministic in (password, envelope) and never reaches
//! the server; only its SHA-256 is uploaded for same-password detection on
//! change.

mod client;
mod envelope;
mod oprf;
mod server;

pub use client::{ClientLoginFinish, ClientLoginStart, ClientRegistration};
pub use server::{
    login_finish, login_start, registration_response, validate_record, ServerLoginState,
    AKE_SERVER_IDENTITY,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Length of the serialized envelope (nonce ‖ MAC).
pub const ENVELOPE_LEN: usize = 64;
/// Length of a registration record (envelope ‖ client public key).
pub const RECORD_LEN: usize = ENVELOPE_LEN + 32;
/// Length of the export key handed to clients.
pub const EXPORT_KEY_LEN: usize = 64;

/// Errors inside the AKE engine. Everything protocol-visible collapses to
/// [`AkeError::AuthenticationFailed`] at the engine boundary.
#[derive(Debug, Error)]
pub enum AkeError {
    /// Envelope could not be opened: wrong password or identity mismatch.
    #[error("envelope recovery failed")]
    EnvelopeRecovery,

    /// Any other failure: malformed points, bad MAC, bad signature.
    #[error("authentication failed")]
    AuthenticationFailed,
}

impl From<AkeError> for crate::Error {
    fn from(_: AkeError) -> Self {
        // Both variants leave the engine as the same opaque error.
        crate::Error::AuthenticationFailed
    }
}

/// base64url (no padding) serde helper for wire byte fields.
pub mod b64 {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialize bytes as base64url without padding.
    pub fn serialize<S: Serializer>(bytes: &Vec<u8>, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&URL_SAFE_NO_PAD.encode(bytes))
    }

    /// Deserialize base64url (no padding) into bytes.
    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        URL_SAFE_NO_PAD
            .decode(s.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// Registration request: the blinded password element.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationRequest {
    /// Compressed P-256 point, blinded password element
    #[serde(with = "b64")]
    pub blinded: Vec<u8>,
}

/// Registration response: OPRF evaluation plus the server public key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationResponse {
    /// Compressed P-256 point, evaluated element
    #[serde(with = "b64")]
    pub evaluated: Vec<u8>,
    /// Server long-term public key (raw Ed25519, 32 bytes)
    #[serde(with = "b64")]
    pub server_pub_key: Vec<u8>,
}

/// Registration record uploaded by the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationRecord {
    /// envelope ‖ client public key ([`RECORD_LEN`] bytes)
    #[serde(with = "b64")]
    pub record: Vec<u8>,
    /// SHA-256 of the export key, for same-password detection on change
    #[serde(with = "b64")]
    pub export_key_hash: Vec<u8>,
}

/// First login message, client → server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ke1 {
    /// Compressed P-256 point, blinded password element
    #[serde(with = "b64")]
    pub blinded: Vec<u8>,
    /// Client nonce (32 bytes)
    #[serde(with = "b64")]
    pub client_nonce: Vec<u8>,
    /// Client ephemeral public key (compressed P-256)
    #[serde(with = "b64")]
    pub client_eph_pub: Vec<u8>,
}

/// Second login message, server → client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ke2 {
    /// Compressed P-256 point, evaluated element
    #[serde(with = "b64")]
    pub evaluated: Vec<u8>,
    /// Stored registration record (envelope ‖ client public key)
    #[serde(with = "b64")]
    pub record: Vec<u8>,
    /// Server public key stored at registration (raw Ed25519)
    #[serde(with = "b64")]
    pub server_pub_key: Vec<u8>,
    /// Server nonce (32 bytes)
    #[serde(with = "b64")]
    pub server_nonce: Vec<u8>,
    /// Server ephemeral public key (compressed P-256)
    #[serde(with = "b64")]
    pub server_eph_pub: Vec<u8>,
    /// HMAC-SHA256 over the transcript under the server MAC key
    #[serde(with = "b64")]
    pub server_mac: Vec<u8>,
    /// Ed25519 signature over the transcript hash
    #[serde(with = "b64")]
    pub server_sig: Vec<u8>,
}

/// Third login message, client → server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ke3 {
    /// HMAC-SHA256 over the transcript under the client MAC key
    #[serde(with = "b64")]
    pub client_mac: Vec<u8>,
    /// Ed25519 signature over the transcript hash by the client's
    /// password-derived long-term key
    #[serde(with = "b64")]
    pub client_sig: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_messages_roundtrip_base64url() {
        // GIVEN: a KE1 with binary fields
        let ke1 = Ke1 {
            blinded: vec![2u8; 33],
            client_nonce: vec![7u8; 32],
            client_eph_pub: vec![3u8; 33],
        };

        // WHEN: serialized to JSON
        let json = serde_json::to_string(&ke1).unwrap();

        // THEN: fields are base64url strings without padding
        assert!(!json.contains('='));
        let back: Ke1 = serde_json::from_str(&json).unwrap();
        assert_eq!(back.blinded, ke1.blinded);
        assert_eq!(back.client_nonce, ke1.client_nonce);
    }

    #[test]
    fn ake_errors_collapse_to_authentication_failed() {
        // GIVEN: both engine error variants
        let e1: crate::Error = AkeError::EnvelopeRecovery.into();
        let e2: crate::Error = AkeError::AuthenticationFailed.into();

        // THEN: both surface as the same opaque kind
        assert!(matches!(e1, crate::Error::AuthenticationFailed));
        assert!(matches!(e2, crate::Error::AuthenticationFailed));
    }
}
