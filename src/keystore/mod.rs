//! Key management — KEK derivation, at-rest wrapping, signing keys, JWKS.
//!
//! # Model
//!
//! A single Key Encryption Key (KEK) is derived from an operator passphrase
//! with Argon2id. The KDF parameters (salt, memory, iterations, parallelism)
//! are generated at install, persisted in `kek_params`, and read-only
//! afterwards; they are public. The KEK itself exists only in process memory.
//!
//! Everything secret at rest is wrapped with AES-256-GCM under the KEK:
//! signing-key private halves, the OPRF seed, TOTP secrets, and the AKE
//! identity key. A wrapped blob is `nonce(12) ‖ ciphertext‖tag`; a fresh
//! nonce is drawn per wrap. Unwrap failures collapse to one opaque error —
//! the caller never learns whether the nonce, tag, or ciphertext was at
//! fault.
//!
//! Missing or wrong passphrase means [`KeyStore::unlock`] fails and the
//! server refuses to start in secure mode.

pub mod signing;

pub use signing::{ActiveSigningKey, JwkPublic, JwksDocument};

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use argon2::{Algorithm, Argon2, Params, Version};
use ed25519_dalek::{
    pkcs8::{DecodePrivateKey, EncodePrivateKey},
    SigningKey,
};
use parking_lot::RwLock;
use rand::{rngs::OsRng, RngCore};
use zeroize::Zeroizing;

use crate::db::{now, Db};
use crate::{Error, Result};

/// Size of the AES-GCM nonce prefix on every wrapped blob.
const NONCE_LEN: usize = 12;

/// Identifier persisted in `kek_params.kdf`.
const KDF_ID: &str = "argon2id-v19";

/// Settings key under which the wrapped AKE identity keypair lives.
const AKE_KEY_SETTING: &str = "ake_identity_key";

/// Argon2id parameters chosen at install time.
#[derive(Debug, Clone)]
pub struct KekParams {
    /// Random salt, generated once
    pub salt: Vec<u8>,
    /// Memory cost in KiB
    pub memory_kib: u32,
    /// Iteration count
    pub iterations: u32,
    /// Lanes
    pub parallelism: u32,
}

/// Key store: in-memory KEK, unwrapped OPRF seed, AKE identity key, and the
/// active signing key cache. Constructed by [`KeyStore::install`] or
/// [`KeyStore::unlock`]; the KEK is read-only afterwards.
pub struct KeyStore {
    db: Db,
    kek: Zeroizing<[u8; 32]>,
    oprf_seed: Zeroizing<[u8; 32]>,
    ake_key: SigningKey,
    active: RwLock<ActiveSigningKey>,
}

impl std::fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyStore")
            .field("kek", &"[REDACTED]")
            .field("active_kid", &self.active.read().kid)
            .finish_non_exhaustive()
    }
}

impl KeyStore {
    /// First-time installation: generate KDF parameters, derive the KEK,
    /// create and wrap the OPRF seed, the AKE identity key, and the first
    /// signing key.
    pub fn install(db: Db, passphrase: &str, params: KekParams) -> Result<Self> {
        let existing: i64 = db.with(|conn| {
            conn.query_row("SELECT COUNT(*) FROM kek_params", [], |r| r.get(0))
                .map_err(Error::from)
        })?;
        if existing > 0 {
            return Err(Error::Conflict("key store already installed".to_string()));
        }

        let kek = derive_kek(passphrase, &params)?;

        db.with(|conn| {
            conn.execute(
                "INSERT INTO kek_params (id, kdf, salt, memory_kib, iterations, parallelism, created_at)
                 VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    KDF_ID,
                    params.salt,
                    params.memory_kib,
                    params.iterations,
                    params.parallelism,
                    now()
                ],
            )
            .map_err(Error::from)
        })?;

        // OPRF seed: 32 random bytes, wrapped once, never rotated.
        let mut seed = Zeroizing::new([0u8; 32]);
        OsRng.fill_bytes(seed.as_mut());
        let wrapped_seed = wrap_with(&kek, seed.as_ref())?;
        db.with(|conn| {
            conn.execute(
                "INSERT INTO oprf_seed (id, wrapped_seed, created_at) VALUES (1, ?1, ?2)",
                rusqlite::params![wrapped_seed, now()],
            )
            .map_err(Error::from)
        })?;

        // AKE identity key (server authentication inside the aPAKE). Not a
        // JWT signing key, so it lives outside `signing_keys` and JWKS.
        let ake_key = SigningKey::generate(&mut OsRng);
        let ake_der = ake_key
            .to_pkcs8_der()
            .map_err(|e| Error::Internal(format!("pkcs8 encode: {e}")))?;
        let wrapped_ake = wrap_with(&kek, ake_der.as_bytes())?;
        db.with(|conn| {
            conn.execute(
                "INSERT INTO settings (key, value, secure) VALUES (?1, ?2, 1)",
                rusqlite::params![
                    AKE_KEY_SETTING,
                    serde_json::to_string(&base64_url(&wrapped_ake))?
                ],
            )
            .map_err(Error::from)
        })?;

        let active = signing::generate_first_key(&db, &kek)?;

        Ok(Self {
            db,
            kek,
            oprf_seed: seed,
            ake_key,
            active: RwLock::new(active),
        })
    }

    /// Unlock with the operator passphrase using the persisted KDF
    /// parameters. Fails if the store was never installed or the passphrase
    /// is wrong (detected by the OPRF-seed unwrap).
    pub fn unlock(db: Db, passphrase: &str) -> Result<Self> {
        let params = db.with(|conn| {
            conn.query_row(
                "SELECT salt, memory_kib, iterations, parallelism FROM kek_params WHERE id = 1",
                [],
                |r| {
                    Ok(KekParams {
                        salt: r.get(0)?,
                        memory_kib: r.get(1)?,
                        iterations: r.get(2)?,
                        parallelism: r.get(3)?,
                    })
                },
            )
            .map_err(|_| Error::Internal("key store not installed".to_string()))
        })?;

        let kek = derive_kek(passphrase, &params)?;

        let wrapped_seed: Vec<u8> = db.with(|conn| {
            conn.query_row("SELECT wrapped_seed FROM oprf_seed WHERE id = 1", [], |r| {
                r.get(0)
            })
            .map_err(|_| Error::Internal("OPRF seed missing".to_string()))
        })?;
        // Wrong passphrase surfaces here as an AEAD failure.
        let seed_bytes = unwrap_with(&kek, &wrapped_seed)?;
        let mut seed = Zeroizing::new([0u8; 32]);
        seed.copy_from_slice(&seed_bytes);

        let wrapped_ake_b64: String = db.with(|conn| {
            conn.query_row(
                "SELECT value FROM settings WHERE key = ?1",
                rusqlite::params![AKE_KEY_SETTING],
                |r| r.get(0),
            )
            .map_err(|_| Error::Internal("AKE identity key missing".to_string()))
        })?;
        let wrapped_ake = base64_url_decode(
            &serde_json::from_str::<String>(&wrapped_ake_b64)?,
        )?;
        let ake_der = unwrap_with(&kek, &wrapped_ake)?;
        let ake_key = SigningKey::from_pkcs8_der(&ake_der)
            .map_err(|e| Error::Internal(format!("pkcs8 decode: {e}")))?;

        let active = signing::load_active_key(&db, &kek)?;

        Ok(Self {
            db,
            kek,
            oprf_seed: seed,
            ake_key,
            active: RwLock::new(active),
        })
    }

    /// Wrap a plaintext under the KEK. Blob layout: nonce ‖ ciphertext‖tag.
    pub fn wrap(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        wrap_with(&self.kek, plaintext)
    }

    /// Unwrap a blob produced by [`KeyStore::wrap`].
    pub fn unwrap(&self, blob: &[u8]) -> Result<Vec<u8>> {
        unwrap_with(&self.kek, blob)
    }

    /// The unwrapped OPRF seed.
    #[must_use]
    pub fn oprf_seed(&self) -> &[u8; 32] {
        &self.oprf_seed
    }

    /// The server's long-term AKE identity key.
    #[must_use]
    pub fn ake_key(&self) -> &SigningKey {
        &self.ake_key
    }

    /// Raw public half of the AKE identity key (32 bytes).
    #[must_use]
    pub fn ake_public_key(&self) -> [u8; 32] {
        self.ake_key.verifying_key().to_bytes()
    }

    /// Snapshot of the active signing key.
    #[must_use]
    pub fn active_signing_key(&self) -> ActiveSigningKey {
        self.active.read().clone()
    }

    /// Rotate the signing key: insert a fresh active key and stamp the old
    /// one `rotated_at`, in one transaction. Concurrent readers see either
    /// the old or the new active key, never two.
    pub fn rotate_signing_key(&self) -> Result<String> {
        let new_active = signing::rotate(&self.db, &self.kek)?;
        let kid = new_active.kid.clone();
        *self.active.write() = new_active;
        Ok(kid)
    }

    /// Publish the JWKS: all non-purged public keys, active `kid` advertised
    /// separately so verifiers accept both during rotation overlap.
    pub fn publish_jwks(&self) -> Result<JwksDocument> {
        signing::publish(&self.db, &self.active.read().kid)
    }
}

/// Derive the 32-byte KEK with Argon2id.
fn derive_kek(passphrase: &str, params: &KekParams) -> Result<Zeroizing<[u8; 32]>> {
    let argon_params = Params::new(
        params.memory_kib,
        params.iterations,
        params.parallelism,
        Some(32),
    )
    .map_err(|e| Error::Internal(format!("invalid KDF parameters: {e}")))?;
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params);

    let mut kek = Zeroizing::new([0u8; 32]);
    argon
        .hash_password_into(passphrase.as_bytes(), &params.salt, kek.as_mut())
        .map_err(|e| Error::Internal(format!("KDF failure: {e}")))?;
    Ok(kek)
}

/// Fresh Kek parameters for installation.
#[must_use]
pub fn fresh_kek_params(memory_kib: u32, iterations: u32, parallelism: u32) -> KekParams {
    let mut salt = vec![0u8; 16];
    OsRng.fill_bytes(&mut salt);
    KekParams {
        salt,
        memory_kib,
        iterations,
        parallelism,
    }
}

pub(crate) fn wrap_with(kek: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(kek.into());
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| Error::Internal("wrap failed".to_string()))?;
    let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&ciphertext);
    Ok(blob)
}

pub(crate) fn unwrap_with(kek: &[u8; 32], blob: &[u8]) -> Result<Vec<u8>> {
    // One opaque error for every failure mode.
    let opaque = || Error::Internal("unwrap failed".to_string());
    if blob.len() < NONCE_LEN + 16 {
        return Err(opaque());
    }
    let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new(kek.into());
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| opaque())
}

fn base64_url(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

fn base64_url_decode(s: &str) -> Result<Vec<u8>> {
    use base64::Engine;
    base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(s)
        .map_err(|e| Error::Internal(format!("base64 decode: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_params() -> KekParams {
        // Small costs keep the unit suite fast; production parameters are
        // chosen in config.
        let mut p = fresh_kek_params(8, 1, 1);
        p.salt = vec![7u8; 16];
        p
    }

    fn installed_store() -> KeyStore {
        KeyStore::install(Db::open_in_memory().unwrap(), "hunter2 passphrase", test_params())
            .unwrap()
    }

    #[test]
    fn wrap_unwrap_roundtrip_is_identity() {
        // GIVEN: an installed key store
        let ks = installed_store();

        // WHEN: wrapping and unwrapping arbitrary bytes
        let plaintext = b"some secret material \x00\xff";
        let blob = ks.wrap(plaintext).unwrap();
        let recovered = ks.unwrap(&blob).unwrap();

        // THEN: identity
        assert_eq!(recovered, plaintext);
        // And the blob is not the plaintext
        assert_ne!(&blob[NONCE_LEN..NONCE_LEN + plaintext.len()], plaintext);
    }

    #[test]
    fn unwrap_fails_on_any_bit_flip() {
        // GIVEN: a wrapped blob
        let ks = installed_store();
        let blob = ks.wrap(b"payload").unwrap();

        // WHEN/THEN: flipping any single bit fails with the opaque error
        for byte in 0..blob.len() {
            let mut mutated = blob.clone();
            mutated[byte] ^= 0x01;
            let err = ks.unwrap(&mutated).unwrap_err();
            assert!(matches!(err, Error::Internal(_)), "byte {byte} did not fail");
        }
    }

    #[test]
    fn wrap_uses_fresh_nonces() {
        // GIVEN: the same plaintext wrapped twice
        let ks = installed_store();
        let a = ks.wrap(b"same").unwrap();
        let b = ks.wrap(b"same").unwrap();

        // THEN: blobs differ (fresh nonce each time)
        assert_ne!(a, b);
    }

    #[test]
    fn unlock_with_correct_passphrase_restores_state() {
        // GIVEN: an installed store
        let db = Db::open_in_memory().unwrap();
        let ks = KeyStore::install(db.clone(), "correct passphrase", test_params()).unwrap();
        let seed = *ks.oprf_seed();
        let ake_pub = ks.ake_public_key();
        let kid = ks.active_signing_key().kid;

        // WHEN: unlocked again from the same database
        let ks2 = KeyStore::unlock(db, "correct passphrase").unwrap();

        // THEN: seed, AKE key and active signing key are identical
        assert_eq!(ks2.oprf_seed(), &seed);
        assert_eq!(ks2.ake_public_key(), ake_pub);
        assert_eq!(ks2.active_signing_key().kid, kid);
    }

    #[test]
    fn unlock_with_wrong_passphrase_fails() {
        // GIVEN: an installed store
        let db = Db::open_in_memory().unwrap();
        KeyStore::install(db.clone(), "correct passphrase", test_params()).unwrap();

        // WHEN: unlocking with the wrong passphrase
        let err = KeyStore::unlock(db, "wrong passphrase").unwrap_err();

        // THEN: a single opaque error
        assert!(matches!(err, Error::Internal(_)));
    }

    #[test]
    fn install_twice_is_a_conflict() {
        // GIVEN: an installed store
        let db = Db::open_in_memory().unwrap();
        KeyStore::install(db.clone(), "p", test_params()).unwrap();

        // WHEN/THEN: installing again fails
        let err = KeyStore::install(db, "p", test_params()).unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[test]
    fn jwks_is_stable_across_unlock() {
        // GIVEN: an installed store and its JWKS
        let db = Db::open_in_memory().unwrap();
        let ks = KeyStore::install(db.clone(), "p", test_params()).unwrap();
        let jwks1 = ks.publish_jwks().unwrap();

        // WHEN: the process "restarts"
        let ks2 = KeyStore::unlock(db, "p").unwrap();
        let jwks2 = ks2.publish_jwks().unwrap();

        // THEN: same keys, same active kid
        assert_eq!(jwks1.active_kid, jwks2.active_kid);
        assert_eq!(jwks1.keys.len(), jwks2.keys.len());
        assert_eq!(jwks1.keys[0].x, jwks2.keys[0].x);
    }
}
