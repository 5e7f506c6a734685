//! Envelope construction and recovery.
//!
//! The envelope is the only per-principal secret material the server stores:
//! a 32-byte nonce plus an HMAC binding {server public key, server identity,
//! client identity} under a key derived from the OPRF output. Nothing in it
//! is decryptable — the client re-derives its long-term key and the export
//! key from the password, and the MAC only proves the password was right and
//! the identities match.

use ed25519_dalek::SigningKey;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::{rngs::OsRng, RngCore};
use sha2::Sha256;
use zeroize::Zeroizing;

use super::{AkeError, ENVELOPE_LEN, EXPORT_KEY_LEN};

type HmacSha256 = Hmac<Sha256>;

const AUTH_KEY_LABEL: &[u8] = b"zkauth-auth-key-v1";
const EXPORT_KEY_LABEL: &[u8] = b"zkauth-export-key-v1";
const CLIENT_KEY_LABEL: &[u8] = b"zkauth-client-key-v1";

/// Key material derived from one OPRF output and one envelope nonce.
pub(super) struct EnvelopeKeys {
    /// MAC key authenticating the envelope contents
    pub auth_key: Zeroizing<[u8; 32]>,
    /// Export key handed to the client, never stored server-side
    pub export_key: Zeroizing<[u8; EXPORT_KEY_LEN]>,
    /// The client's deterministic long-term Ed25519 key
    pub client_key: SigningKey,
}

/// Derive the randomized password (HKDF extract of the OPRF output).
pub(super) fn randomized_password(oprf_output: &[u8; 32]) -> Zeroizing<[u8; 32]> {
    let (prk, _) = Hkdf::<Sha256>::extract(None, oprf_output);
    let mut out = Zeroizing::new([0u8; 32]);
    out.copy_from_slice(&prk);
    out
}

/// Expand the randomized password and envelope nonce into the envelope keys.
pub(super) fn derive_keys(randomized_pwd: &[u8; 32], nonce: &[u8]) -> EnvelopeKeys {
    let hk = Hkdf::<Sha256>::from_prk(randomized_pwd)
        .expect("32-byte PRK is always valid for HKDF-SHA256");

    let mut auth_key = Zeroizing::new([0u8; 32]);
    let mut info = Vec::with_capacity(AUTH_KEY_LABEL.len() + nonce.len());
    info.extend_from_slice(AUTH_KEY_LABEL);
    info.extend_from_slice(nonce);
    hk.expand(&info, auth_key.as_mut())
        .expect("32 bytes is a valid HKDF output length");

    // The export key deliberately excludes the envelope nonce: it must be
    // deterministic in (password, credential) so that a password change to
    // the same password reproduces it and the stored hash detects the reuse.
    let mut export_key = Zeroizing::new([0u8; EXPORT_KEY_LEN]);
    hk.expand(EXPORT_KEY_LABEL, export_key.as_mut())
        .expect("64 bytes is a valid HKDF output length");

    let mut client_seed = Zeroizing::new([0u8; 32]);
    let mut info = Vec::with_capacity(CLIENT_KEY_LABEL.len() + nonce.len());
    info.extend_from_slice(CLIENT_KEY_LABEL);
    info.extend_from_slice(nonce);
    hk.expand(&info, client_seed.as_mut())
        .expect("32 bytes is a valid HKDF output length");
    let client_key = SigningKey::from_bytes(&client_seed);

    EnvelopeKeys {
        auth_key,
        export_key,
        client_key,
    }
}

fn binding_mac(
    auth_key: &[u8; 32],
    nonce: &[u8],
    server_pub_key: &[u8],
    server_identity: &str,
    client_identity: &str,
) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(auth_key)
        .expect("HMAC accepts any key length");
    mac.update(nonce);
    mac.update(server_pub_key);
    mac.update(&(server_identity.len() as u64).to_be_bytes());
    mac.update(server_identity.as_bytes());
    mac.update(&(client_identity.len() as u64).to_be_bytes());
    mac.update(client_identity.as_bytes());
    mac.finalize().into_bytes().to_vec()
}

/// Build a fresh envelope. Returns (envelope bytes, derived keys).
pub(super) fn seal(
    randomized_pwd: &[u8; 32],
    server_pub_key: &[u8],
    server_identity: &str,
    client_identity: &str,
) -> (Vec<u8>, EnvelopeKeys) {
    let mut nonce = [0u8; 32];
    OsRng.fill_bytes(&mut nonce);

    let keys = derive_keys(randomized_pwd, &nonce);
    let tag = binding_mac(
        &keys.auth_key,
        &nonce,
        server_pub_key,
        server_identity,
        client_identity,
    );

    let mut envelope = Vec::with_capacity(ENVELOPE_LEN);
    envelope.extend_from_slice(&nonce);
    envelope.extend_from_slice(&tag);
    (envelope, keys)
}

/// Recover the keys from an envelope, verifying the identity binding.
/// Fails with [`AkeError::EnvelopeRecovery`] on a wrong password or a
/// mismatched identity pair.
pub(super) fn open(
    randomized_pwd: &[u8; 32],
    envelope: &[u8],
    server_pub_key: &[u8],
    server_identity: &str,
    client_identity: &str,
) -> Result<EnvelopeKeys, AkeError> {
    if envelope.len() != ENVELOPE_LEN {
        return Err(AkeError::EnvelopeRecovery);
    }
    let (nonce, tag) = envelope.split_at(32);
    let keys = derive_keys(randomized_pwd, nonce);

    let mut mac = HmacSha256::new_from_slice(&*keys.auth_key)
        .expect("HMAC accepts any key length");
    mac.update(nonce);
    mac.update(server_pub_key);
    mac.update(&(server_identity.len() as u64).to_be_bytes());
    mac.update(server_identity.as_bytes());
    mac.update(&(client_identity.len() as u64).to_be_bytes());
    mac.update(client_identity.as_bytes());
    mac.verify_slice(tag).map_err(|_| AkeError::EnvelopeRecovery)?;

    Ok(keys)
}
