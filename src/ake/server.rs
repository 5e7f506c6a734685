//! Server side of the aPAKE — registration evaluation and the KE1/KE3 login
//! steps.
//!
//! All functions are pure given the OPRF seed, the server's AKE identity
//! key, and the stored credential material. The only thing carried between
//! KE1 and KE3 is [`ServerLoginState`], which the caller persists (opaquely)
//! in the login-session store and feeds back exactly once.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{b64, oprf, AkeError, Ke1, Ke2, Ke3, RegistrationRequest, RegistrationResponse, RECORD_LEN};

type HmacSha256 = Hmac<Sha256>;

/// Fixed server identity bound into every envelope and transcript.
pub const AKE_SERVER_IDENTITY: &str = "zkauth";

const TRANSCRIPT_LABEL: &[u8] = b"zkauth-ake-transcript-v1";
const SERVER_MAC_LABEL: &[u8] = b"zkauth-server-mac-v1";
const CLIENT_MAC_LABEL: &[u8] = b"zkauth-client-mac-v1";
const SESSION_KEY_LABEL: &[u8] = b"zkauth-session-key-v1";
pub(super) const SERVER_SIG_CONTEXT: &[u8] = b"zkauth-server-auth-v1";
pub(super) const CLIENT_SIG_CONTEXT: &[u8] = b"zkauth-client-auth-v1";

/// Opaque server transcript state persisted between KE1 and KE3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerLoginState {
    /// SHA-256 over the full transcript
    #[serde(with = "b64")]
    pub transcript_hash: Vec<u8>,
    /// Expected client MAC key
    #[serde(with = "b64")]
    pub client_mac_key: Vec<u8>,
    /// Session key released on successful KE3
    #[serde(with = "b64")]
    pub session_key: Vec<u8>,
    /// The client's registered long-term public key
    #[serde(with = "b64")]
    pub client_pub_key: Vec<u8>,
}

/// Registration step 2: evaluate the OPRF and return the server public key.
pub fn registration_response(
    oprf_seed: &[u8; 32],
    ake_key: &SigningKey,
    credential_id: &str,
    request: &RegistrationRequest,
) -> Result<RegistrationResponse, AkeError> {
    let evaluated = oprf::evaluate(oprf_seed, credential_id, &request.blinded)?;
    Ok(RegistrationResponse {
        evaluated,
        server_pub_key: ake_key.verifying_key().to_bytes().to_vec(),
    })
}

/// Validate the uploaded registration record's shape.
pub fn validate_record(record: &[u8]) -> Result<(), AkeError> {
    if record.len() != RECORD_LEN {
        return Err(AkeError::AuthenticationFailed);
    }
    // The trailing 32 bytes must parse as an Ed25519 public key.
    let client_pub: [u8; 32] = record[super::ENVELOPE_LEN..]
        .try_into()
        .map_err(|_| AkeError::AuthenticationFailed)?;
    VerifyingKey::from_bytes(&client_pub).map_err(|_| AkeError::AuthenticationFailed)?;
    Ok(())
}

/// Hash the full login transcript.
#[allow(clippy::too_many_arguments)]
pub(super) fn transcript_hash(
    client_identity: &str,
    ke1: &Ke1,
    evaluated: &[u8],
    record: &[u8],
    server_pub_key: &[u8],
    server_nonce: &[u8],
    server_eph_pub: &[u8],
) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(TRANSCRIPT_LABEL);
    hasher.update((client_identity.len() as u64).to_be_bytes());
    hasher.update(client_identity.as_bytes());
    hasher.update((AKE_SERVER_IDENTITY.len() as u64).to_be_bytes());
    hasher.update(AKE_SERVER_IDENTITY.as_bytes());
    hasher.update(&ke1.blinded);
    hasher.update(&ke1.client_nonce);
    hasher.update(&ke1.client_eph_pub);
    hasher.update(evaluated);
    hasher.update(record);
    hasher.update(server_pub_key);
    hasher.update(server_nonce);
    hasher.update(server_eph_pub);
    hasher.finalize().to_vec()
}

/// Session key schedule: HKDF over the ECDH shared secret, salted by the
/// transcript hash.
pub(super) struct KeySchedule {
    pub server_mac_key: [u8; 32],
    pub client_mac_key: [u8; 32],
    pub session_key: [u8; 32],
}

pub(super) fn key_schedule(transcript: &[u8], shared_secret: &[u8]) -> KeySchedule {
    let hk = Hkdf::<Sha256>::new(Some(transcript), shared_secret);
    let mut schedule = KeySchedule {
        server_mac_key: [0u8; 32],
        client_mac_key: [0u8; 32],
        session_key: [0u8; 32],
    };
    hk.expand(SERVER_MAC_LABEL, &mut schedule.server_mac_key)
        .expect("32 bytes is a valid HKDF output length");
    hk.expand(CLIENT_MAC_LABEL, &mut schedule.client_mac_key)
        .expect("32 bytes is a valid HKDF output length");
    hk.expand(SESSION_KEY_LABEL, &mut schedule.session_key)
        .expect("32 bytes is a valid HKDF output length");
    schedule
}

pub(super) fn mac(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

pub(super) fn sign_with_context(key: &SigningKey, context: &[u8], data: &[u8]) -> Vec<u8> {
    let mut message = Vec::with_capacity(context.len() + data.len());
    message.extend_from_slice(context);
    message.extend_from_slice(data);
    key.sign(&message).to_bytes().to_vec()
}

pub(super) fn verify_with_context(
    public_key: &[u8],
    context: &[u8],
    data: &[u8],
    signature: &[u8],
) -> Result<(), AkeError> {
    let public_key: [u8; 32] = public_key
        .try_into()
        .map_err(|_| AkeError::AuthenticationFailed)?;
    let verifying = VerifyingKey::from_bytes(&public_key)
        .map_err(|_| AkeError::AuthenticationFailed)?;
    let signature: [u8; 64] = signature
        .try_into()
        .map_err(|_| AkeError::AuthenticationFailed)?;
    let signature = Signature::from_bytes(&signature);

    let mut message = Vec::with_capacity(context.len() + data.len());
    message.extend_from_slice(context);
    message.extend_from_slice(data);
    verifying
        .verify(&message, &signature)
        .map_err(|_| AkeError::AuthenticationFailed)
}

/// Login step KE1 → KE2.
///
/// `record` and `server_pub_key` are the credential material stored at
/// registration; `client_identity` is the principal's current email.
pub fn login_start(
    oprf_seed: &[u8; 32],
    ake_key: &SigningKey,
    credential_id: &str,
    client_identity: &str,
    record: &[u8],
    server_pub_key: &[u8],
    ke1: &Ke1,
) -> Result<(Ke2, ServerLoginState), AkeError> {
    if record.len() != RECORD_LEN || ke1.client_nonce.len() != 32 {
        return Err(AkeError::AuthenticationFailed);
    }

    let evaluated = oprf::evaluate(oprf_seed, credential_id, &ke1.blinded)?;

    // Ephemeral ECDH half.
    let eph_scalar = oprf::random_scalar();
    let server_eph_pub = oprf::encode_point(&(p256::ProjectivePoint::GENERATOR * eph_scalar));
    let client_eph = oprf::decode_point(&ke1.client_eph_pub)?;
    let shared = oprf::encode_point(&(client_eph * eph_scalar));

    let mut server_nonce = vec![0u8; 32];
    OsRng.fill_bytes(&mut server_nonce);

    let transcript = transcript_hash(
        client_identity,
        ke1,
        &evaluated,
        record,
        server_pub_key,
        &server_nonce,
        &server_eph_pub,
    );
    let schedule = key_schedule(&transcript, &shared);

    let server_mac = mac(&schedule.server_mac_key, &transcript);
    let server_sig = sign_with_context(ake_key, SERVER_SIG_CONTEXT, &transcript);

    let ke2 = Ke2 {
        evaluated,
        record: record.to_vec(),
        server_pub_key: server_pub_key.to_vec(),
        server_nonce,
        server_eph_pub,
        server_mac,
        server_sig,
    };
    let state = ServerLoginState {
        transcript_hash: transcript,
        client_mac_key: schedule.client_mac_key.to_vec(),
        session_key: schedule.session_key.to_vec(),
        client_pub_key: record[super::ENVELOPE_LEN..].to_vec(),
    };
    Ok((ke2, state))
}

/// Login step KE3: verify the client MAC and signature, release the session
/// key. The caller must have deleted the persisted state before calling, so
/// a replayed KE3 finds nothing.
pub fn login_finish(state: &ServerLoginState, ke3: &Ke3) -> Result<Vec<u8>, AkeError> {
    let mut mac = HmacSha256::new_from_slice(&state.client_mac_key)
        .expect("HMAC accepts any key length");
    mac.update(&state.transcript_hash);
    mac.verify_slice(&ke3.client_mac)
        .map_err(|_| AkeError::AuthenticationFailed)?;

    verify_with_context(
        &state.client_pub_key,
        CLIENT_SIG_CONTEXT,
        &state.transcript_hash,
        &ke3.client_sig,
    )?;

    Ok(state.session_key.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> SigningKey {
        SigningKey::from_bytes(&[3u8; 32])
    }

    #[test]
    fn registration_response_returns_server_pub() {
        // GIVEN: a valid blinded element
        let (_, blinded) = oprf::blind(b"pw");
        let request = RegistrationRequest { blinded };

        // WHEN: the server responds
        let response =
            registration_response(&[1u8; 32], &test_key(), "sub-1", &request).unwrap();

        // THEN: the public key matches the AKE identity key
        assert_eq!(
            response.server_pub_key,
            test_key().verifying_key().to_bytes().to_vec()
        );
        assert_eq!(response.evaluated.len(), 33);
    }

    #[test]
    fn validate_record_rejects_bad_shapes() {
        assert!(validate_record(&[0u8; 10]).is_err());
        assert!(validate_record(&[0u8; RECORD_LEN + 1]).is_err());
    }

    #[test]
    fn login_start_rejects_malformed_ke1() {
        // GIVEN: a KE1 with a garbage ephemeral key
        let ke1 = Ke1 {
            blinded: oprf::blind(b"pw").1,
            client_nonce: vec![0u8; 32],
            client_eph_pub: vec![0u8; 33],
        };

        // WHEN/THEN: login start fails
        let result = login_start(
            &[1u8; 32],
            &test_key(),
            "sub-1",
            "a@example.com",
            &[0u8; RECORD_LEN],
            &[0u8; 32],
            &ke1,
        );
        assert!(result.is_err());
    }

    #[test]
    fn login_finish_rejects_wrong_mac() {
        // GIVEN: a fabricated state and a KE3 with a wrong MAC
        let state = ServerLoginState {
            transcript_hash: vec![1u8; 32],
            client_mac_key: vec![2u8; 32],
            session_key: vec![3u8; 32],
            client_pub_key: test_key().verifying_key().to_bytes().to_vec(),
        };
        let ke3 = Ke3 {
            client_mac: vec![0u8; 32],
            client_sig: vec![0u8; 64],
        };

        // WHEN/THEN: finish fails
        assert!(login_finish(&state, &ke3).is_err());
    }

    #[test]
    fn server_state_roundtrips_through_serde() {
        // GIVEN: a login state (as persisted in the login-session store)
        let state = ServerLoginState {
            transcript_hash: vec![1u8; 32],
            client_mac_key: vec![2u8; 32],
            session_key: vec![3u8; 32],
            client_pub_key: vec![4u8; 32],
        };

        // WHEN: serialized and restored
        let json = serde_json::to_vec(&state).unwrap();
        let back: ServerLoginState = serde_json::from_slice(&json).unwrap();

        // THEN: identical
        assert_eq!(back.session_key, state.session_key);
        assert_eq!(back.transcript_hash, state.transcript_hash);
    }
}
