//! Signing-key lifecycle — generation, rotation, JWKS publication.
//!
//! Keys are Ed25519 only. Exactly one row in `signing_keys` has
//! `rotated_at IS NULL` at any moment; that row is the active signer.
//! Rotated keys stay published in the JWKS (verifiers during overlap accept
//! both) until an administrator purges them.
//!
//! Stored formats:
//! - private: PKCS#8 DER, wrapped with the KEK
//! - public:  JWK JSON (`kty=OKP`, `crv=Ed25519`, `x` = base64url raw key)
//!
//! jsonwebtoken's EdDSA signer takes the PKCS#8 DER while its verifier takes
//! the raw 32-byte public key, hence the two representations.

use base64::Engine;
use ed25519_dalek::{pkcs8::EncodePrivateKey, SigningKey};
use jsonwebtoken::EncodingKey;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::db::{now, Db};
use crate::{Error, Result};

use super::{unwrap_with, wrap_with};

/// The in-memory active signer handed to token minting.
#[derive(Clone)]
pub struct ActiveSigningKey {
    /// Key id, also the JWT `kid` header
    pub kid: String,
    /// jsonwebtoken signer (EdDSA)
    pub encoding_key: EncodingKey,
    /// Raw 32-byte public key
    pub public_key: [u8; 32],
}

impl std::fmt::Debug for ActiveSigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveSigningKey")
            .field("kid", &self.kid)
            .finish_non_exhaustive()
    }
}

/// One public key as published in the JWKS.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwkPublic {
    /// Key type, always `OKP`
    pub kty: String,
    /// Curve, always `Ed25519`
    pub crv: String,
    /// base64url raw public key
    pub x: String,
    /// Key id
    pub kid: String,
    /// Algorithm, always `EdDSA`
    pub alg: String,
    /// Usage, always `sig`
    #[serde(rename = "use")]
    pub usage: String,
}

/// The published key set plus the currently active `kid`.
#[derive(Debug, Clone, Serialize)]
pub struct JwksDocument {
    /// All non-purged public keys
    pub keys: Vec<JwkPublic>,
    /// The `kid` new tokens are signed with
    #[serde(skip_serializing)]
    pub active_kid: String,
}

fn b64(bytes: &[u8]) -> String {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

fn new_key_material(kek: &[u8; 32]) -> Result<(String, Vec<u8>, String, ActiveSigningKey)> {
    let signing_key = SigningKey::generate(&mut OsRng);
    let public_key = signing_key.verifying_key().to_bytes();
    let kid = uuid::Uuid::new_v4().to_string();

    let der = Zeroizing::new(
        signing_key
            .to_pkcs8_der()
            .map_err(|e| Error::Internal(format!("pkcs8 encode: {e}")))?
            .as_bytes()
            .to_vec(),
    );
    let wrapped = wrap_with(kek, &der)?;

    let jwk = JwkPublic {
        kty: "OKP".to_string(),
        crv: "Ed25519".to_string(),
        x: b64(&public_key),
        kid: kid.clone(),
        alg: "EdDSA".to_string(),
        usage: "sig".to_string(),
    };
    let jwk_json = serde_json::to_string(&jwk)?;

    let active = ActiveSigningKey {
        kid: kid.clone(),
        encoding_key: EncodingKey::from_ed_der(&der),
        public_key,
    };
    Ok((kid, wrapped, jwk_json, active))
}

/// Generate the first signing key at install time.
pub(super) fn generate_first_key(db: &Db, kek: &[u8; 32]) -> Result<ActiveSigningKey> {
    let (kid, wrapped, jwk_json, active) = new_key_material(kek)?;
    db.with(|conn| {
        conn.execute(
            "INSERT INTO signing_keys (kid, wrapped_private, public_jwk, created_at, rotated_at)
             VALUES (?1, ?2, ?3, ?4, NULL)",
            rusqlite::params![kid, wrapped, jwk_json, now()],
        )
        .map_err(Error::from)
    })?;
    Ok(active)
}

/// Load and unwrap the active signing key.
pub(super) fn load_active_key(db: &Db, kek: &[u8; 32]) -> Result<ActiveSigningKey> {
    let (kid, wrapped, jwk_json): (String, Vec<u8>, String) = db.with(|conn| {
        conn.query_row(
            "SELECT kid, wrapped_private, public_jwk FROM signing_keys WHERE rotated_at IS NULL",
            [],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .map_err(|_| Error::Internal("no active signing key".to_string()))
    })?;

    let der = Zeroizing::new(unwrap_with(kek, &wrapped)?);
    let jwk: JwkPublic = serde_json::from_str(&jwk_json)?;
    let public_key: [u8; 32] = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(&jwk.x)
        .ok()
        .and_then(|v| v.try_into().ok())
        .ok_or_else(|| Error::Internal("malformed public JWK".to_string()))?;

    Ok(ActiveSigningKey {
        kid,
        encoding_key: EncodingKey::from_ed_der(&der),
        public_key,
    })
}

/// Rotate: stamp the current active key and insert a fresh one, atomically.
pub(super) fn rotate(db: &Db, kek: &[u8; 32]) -> Result<ActiveSigningKey> {
    let (kid, wrapped, jwk_json, active) = new_key_material(kek)?;
    db.with_tx(|tx| {
        let stamped = tx.execute(
            "UPDATE signing_keys SET rotated_at = ?1 WHERE rotated_at IS NULL",
            rusqlite::params![now()],
        )?;
        if stamped != 1 {
            return Err(Error::Internal(format!(
                "expected one active signing key, found {stamped}"
            )));
        }
        tx.execute(
            "INSERT INTO signing_keys (kid, wrapped_private, public_jwk, created_at, rotated_at)
             VALUES (?1, ?2, ?3, ?4, NULL)",
            rusqlite::params![kid, wrapped, jwk_json, now()],
        )?;
        Ok(())
    })?;
    Ok(active)
}

/// Publish all non-purged keys.
pub(super) fn publish(db: &Db, active_kid: &str) -> Result<JwksDocument> {
    let keys = db.with(|conn| {
        let mut stmt = conn.prepare(
            "SELECT public_jwk FROM signing_keys ORDER BY created_at ASC, kid ASC",
        )?;
        let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
        let mut keys = Vec::new();
        for row in rows {
            keys.push(serde_json::from_str::<JwkPublic>(&row?)?);
        }
        Ok(keys)
    })?;
    Ok(JwksDocument {
        keys,
        active_kid: active_kid.to_string(),
    })
}

/// Purge a rotated key. The active key cannot be purged.
pub fn purge(db: &Db, kid: &str) -> Result<()> {
    db.with_tx(|tx| {
        let rotated_at: Option<i64> = tx
            .query_row(
                "SELECT rotated_at FROM signing_keys WHERE kid = ?1",
                rusqlite::params![kid],
                |r| r.get(0),
            )
            .map_err(|_| Error::not_found(format!("signing key {kid}")))?;
        if rotated_at.is_none() {
            return Err(Error::Conflict("cannot purge the active signing key".to_string()));
        }
        tx.execute("DELETE FROM signing_keys WHERE kid = ?1", rusqlite::params![kid])?;
        Ok(())
    })
}
