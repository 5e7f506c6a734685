//! OPRF over P-256 with SHA-256.
//!
//! The per-principal OPRF key is derived from the server's OPRF seed and the
//! principal's stable id. Blinding and unblinding happen client-side; the
//! server only multiplies a received group element by the derived key.
//!
//! Hash-to-group uses try-and-increment over SHA-256 candidates, which is
//! deterministic for a given input. Rejection sampling terminates quickly
//! (each candidate x-coordinate decompresses with probability ~1/2).

use hkdf::Hkdf;
use p256::elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
use p256::elliptic_curve::{Field, PrimeField};
use p256::{AffinePoint, EncodedPoint, FieldBytes, ProjectivePoint, Scalar};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};

use super::AkeError;

const H2C_LABEL: &[u8] = b"zkauth-h2c-v1";
const KEY_LABEL: &[u8] = b"zkauth-oprf-key-v1";
const OUT_LABEL: &[u8] = b"zkauth-oprf-out-v1";

/// Map arbitrary bytes to a non-identity group element, deterministically.
pub(super) fn hash_to_group(input: &[u8]) -> ProjectivePoint {
    for counter in 0u8..=255 {
        let mut hasher = Sha256::new();
        hasher.update(H2C_LABEL);
        hasher.update([counter]);
        hasher.update(input);
        let digest = hasher.finalize();

        let mut candidate = [0u8; 33];
        candidate[0] = 0x02;
        candidate[1..].copy_from_slice(&digest);

        if let Ok(encoded) = EncodedPoint::from_bytes(candidate) {
            let point = AffinePoint::from_encoded_point(&encoded);
            if bool::from(point.is_some()) {
                return ProjectivePoint::from(point.unwrap());
            }
        }
    }
    // 256 consecutive rejections has probability ~2^-256.
    unreachable!("hash_to_group exhausted all counters")
}

/// Derive a scalar from key material, deterministically, via rejection
/// sampling over HKDF expansions.
fn derive_scalar(ikm: &[u8], info: &[u8]) -> Scalar {
    let hk = Hkdf::<Sha256>::new(None, ikm);
    for counter in 0u8..=255 {
        let mut okm = [0u8; 32];
        let mut full_info = Vec::with_capacity(info.len() + 1);
        full_info.extend_from_slice(info);
        full_info.push(counter);
        hk.expand(&full_info, &mut okm)
            .expect("32 bytes is a valid HKDF output length");
        let repr = *FieldBytes::from_slice(&okm);
        let scalar = Scalar::from_repr(repr);
        if bool::from(scalar.is_some()) {
            let scalar = scalar.unwrap();
            if scalar != Scalar::ZERO {
                return scalar;
            }
        }
    }
    unreachable!("derive_scalar exhausted all counters")
}

/// The server's OPRF key for one principal: seed + stable credential id.
pub(super) fn oprf_key(seed: &[u8; 32], credential_id: &str) -> Scalar {
    let mut info = Vec::with_capacity(KEY_LABEL.len() + credential_id.len());
    info.extend_from_slice(KEY_LABEL);
    info.extend_from_slice(credential_id.as_bytes());
    derive_scalar(seed, &info)
}

/// A fresh random non-zero scalar.
pub(super) fn random_scalar() -> Scalar {
    loop {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        let repr = *FieldBytes::from_slice(&bytes);
        let scalar = Scalar::from_repr(repr);
        if bool::from(scalar.is_some()) {
            let scalar = scalar.unwrap();
            if scalar != Scalar::ZERO {
                return scalar;
            }
        }
    }
}

/// Decode a compressed point, rejecting the identity.
pub(super) fn decode_point(bytes: &[u8]) -> Result<ProjectivePoint, AkeError> {
    let encoded = EncodedPoint::from_bytes(bytes).map_err(|_| AkeError::AuthenticationFailed)?;
    let point = AffinePoint::from_encoded_point(&encoded);
    if bool::from(point.is_some()) {
        let point = ProjectivePoint::from(point.unwrap());
        if point == ProjectivePoint::IDENTITY {
            return Err(AkeError::AuthenticationFailed);
        }
        Ok(point)
    } else {
        Err(AkeError::AuthenticationFailed)
    }
}

/// Compressed SEC1 encoding (33 bytes).
pub(super) fn encode_point(point: &ProjectivePoint) -> Vec<u8> {
    point.to_affine().to_encoded_point(true).as_bytes().to_vec()
}

/// Client-side blinding: returns (blind scalar, blinded element bytes).
pub(super) fn blind(password: &[u8]) -> (Scalar, Vec<u8>) {
    let r = random_scalar();
    let element = hash_to_group(password) * r;
    (r, encode_point(&element))
}

/// Server-side evaluation: multiply the blinded element by the OPRF key.
pub(super) fn evaluate(
    seed: &[u8; 32],
    credential_id: &str,
    blinded: &[u8],
) -> Result<Vec<u8>, AkeError> {
    let element = decode_point(blinded)?;
    let key = oprf_key(seed, credential_id);
    Ok(encode_point(&(element * key)))
}

/// Client-side finalize: unblind and hash into the OPRF output.
pub(super) fn finalize(
    password: &[u8],
    blind: &Scalar,
    evaluated: &[u8],
) -> Result<[u8; 32], AkeError> {
    let element = decode_point(evaluated)?;
    let inverted = blind.invert();
    if !bool::from(inverted.is_some()) {
        return Err(AkeError::AuthenticationFailed);
    }
    let unblinded = element * inverted.unwrap();

    let mut hasher = Sha256::new();
    hasher.update(OUT_LABEL);
    hasher.update((password.len() as u64).to_be_bytes());
    hasher.update(password);
    hasher.update(encode_point(&unblinded));
    Ok(hasher.finalize().into())
}
