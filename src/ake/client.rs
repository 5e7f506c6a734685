//! Client side of the aPAKE.
//!
//! In production this role is played by the browser; the Rust client exists
//! for the install bootstrap (registering the first admin), operator tooling,
//! and the end-to-end test suites. It mirrors the server's derivations
//! exactly: a divergence anywhere shows up as an authentication failure.

use p256::Scalar;
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use super::server::{
    key_schedule, mac, sign_with_context, transcript_hash, verify_with_context,
    CLIENT_SIG_CONTEXT, SERVER_SIG_CONTEXT,
};
use super::{
    envelope, oprf, AkeError, Ke1, Ke2, Ke3, RegistrationRecord, RegistrationRequest,
    RegistrationResponse, AKE_SERVER_IDENTITY, ENVELOPE_LEN, EXPORT_KEY_LEN,
};

/// In-flight client registration: holds the password and blind between the
/// request and the server's response.
pub struct ClientRegistration {
    password: Zeroizing<Vec<u8>>,
    blind: Scalar,
}

impl ClientRegistration {
    /// Step 1: blind the password.
    pub fn start(password: &str) -> (Self, RegistrationRequest) {
        let (blind, blinded) = oprf::blind(password.as_bytes());
        (
            Self {
                password: Zeroizing::new(password.as_bytes().to_vec()),
                blind,
            },
            RegistrationRequest { blinded },
        )
    }

    /// Step 3: finalize the OPRF, seal the envelope, derive the export key.
    /// Returns the record to upload and the export key (client-held).
    pub fn finish(
        self,
        response: &RegistrationResponse,
        client_identity: &str,
    ) -> Result<(RegistrationRecord, Zeroizing<[u8; EXPORT_KEY_LEN]>), AkeError> {
        let oprf_output = oprf::finalize(&self.password, &self.blind, &response.evaluated)?;
        let randomized_pwd = envelope::randomized_password(&oprf_output);

        let (sealed, keys) = envelope::seal(
            &randomized_pwd,
            &response.server_pub_key,
            AKE_SERVER_IDENTITY,
            client_identity,
        );

        let mut record = Vec::with_capacity(super::RECORD_LEN);
        record.extend_from_slice(&sealed);
        record.extend_from_slice(&keys.client_key.verifying_key().to_bytes());

        let export_key_hash = Sha256::digest(&*keys.export_key).to_vec();

        Ok((
            RegistrationRecord {
                record,
                export_key_hash,
            },
            keys.export_key,
        ))
    }
}

/// In-flight client login between KE1 and KE2.
pub struct ClientLoginStart {
    password: Zeroizing<Vec<u8>>,
    blind: Scalar,
    eph_scalar: Scalar,
    ke1: Ke1,
}

/// Outcome of a completed client login.
pub struct ClientLoginFinish {
    /// Message to send as the final login step
    pub ke3: Ke3,
    /// Shared session key (fresh per login)
    pub session_key: Zeroizing<[u8; 32]>,
    /// Export key (deterministic per password + envelope)
    pub export_key: Zeroizing<[u8; EXPORT_KEY_LEN]>,
}

impl ClientLoginStart {
    /// Produce KE1.
    pub fn start(password: &str) -> (Self, Ke1) {
        let (blind, blinded) = oprf::blind(password.as_bytes());
        let eph_scalar = oprf::random_scalar();
        let client_eph_pub =
            oprf::encode_point(&(p256::ProjectivePoint::GENERATOR * eph_scalar));
        let mut client_nonce = vec![0u8; 32];
        OsRng.fill_bytes(&mut client_nonce);

        let ke1 = Ke1 {
            blinded,
            client_nonce,
            client_eph_pub,
        };
        (
            Self {
                password: Zeroizing::new(password.as_bytes().to_vec()),
                blind,
                eph_scalar,
                ke1: ke1.clone(),
            },
            ke1,
        )
    }

    /// Process KE2: recover the envelope, authenticate the server, derive
    /// the session key, and produce KE3.
    pub fn finish(self, ke2: &Ke2, client_identity: &str) -> Result<ClientLoginFinish, AkeError> {
        let oprf_output = oprf::finalize(&self.password, &self.blind, &ke2.evaluated)?;
        let randomized_pwd = envelope::randomized_password(&oprf_output);

        if ke2.record.len() != super::RECORD_LEN {
            return Err(AkeError::AuthenticationFailed);
        }
        let (sealed, registered_pub) = ke2.record.split_at(ENVELOPE_LEN);

        // Wrong password or identity mismatch fails here.
        let keys = envelope::open(
            &randomized_pwd,
            sealed,
            &ke2.server_pub_key,
            AKE_SERVER_IDENTITY,
            client_identity,
        )?;

        // The password-derived key must be the registered one.
        if keys.client_key.verifying_key().to_bytes().as_slice() != registered_pub {
            return Err(AkeError::EnvelopeRecovery);
        }

        // ECDH with the server's ephemeral key.
        let server_eph = oprf::decode_point(&ke2.server_eph_pub)?;
        let shared = oprf::encode_point(&(server_eph * self.eph_scalar));

        let transcript = transcript_hash(
            client_identity,
            &self.ke1,
            &ke2.evaluated,
            &ke2.record,
            &ke2.server_pub_key,
            &ke2.server_nonce,
            &ke2.server_eph_pub,
        );
        let schedule = key_schedule(&transcript, &shared);

        // Authenticate the server: MAC, then signature under the envelope-
        // bound public key.
        let expected_mac = mac(&schedule.server_mac_key, &transcript);
        if !constant_time_eq(&expected_mac, &ke2.server_mac) {
            return Err(AkeError::AuthenticationFailed);
        }
        verify_with_context(
            &ke2.server_pub_key,
            SERVER_SIG_CONTEXT,
            &transcript,
            &ke2.server_sig,
        )?;

        let ke3 = Ke3 {
            client_mac: mac(&schedule.client_mac_key, &transcript),
            client_sig: sign_with_context(&keys.client_key, CLIENT_SIG_CONTEXT, &transcript),
        };

        let mut session_key = Zeroizing::new([0u8; 32]);
        session_key.copy_from_slice(&schedule.session_key);

        Ok(ClientLoginFinish {
            ke3,
            session_key,
            export_key: keys.export_key,
        })
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    use subtle::ConstantTimeEq;
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

#[cfg(test)]
mod tests {
    use super::super::server;
    use super::*;
    use ed25519_dalek::SigningKey;

    const SEED: [u8; 32] = [11u8; 32];

    fn server_key() -> SigningKey {
        SigningKey::from_bytes(&[5u8; 32])
    }

    /// Register a principal and return the stored material.
    fn register(password: &str, email: &str, cid: &str) -> (Vec<u8>, Vec<u8>) {
        let (reg, request) = ClientRegistration::start(password);
        let response =
            server::registration_response(&SEED, &server_key(), cid, &request).unwrap();
        let (record, _export) = reg.finish(&response, email).unwrap();
        server::validate_record(&record.record).unwrap();
        (record.record, response.server_pub_key)
    }

    fn login(
        password: &str,
        email: &str,
        cid: &str,
        record: &[u8],
        server_pub: &[u8],
    ) -> Result<(Vec<u8>, ClientLoginFinish), AkeError> {
        let (client, ke1) = ClientLoginStart::start(password);
        let (ke2, state) = server::login_start(
            &SEED,
            &server_key(),
            cid,
            email,
            record,
            server_pub,
            &ke1,
        )?;
        let finish = client.finish(&ke2, email)?;
        let server_session = server::login_finish(&state, &finish.ke3)?;
        Ok((server_session, finish))
    }

    #[test]
    fn full_registration_and_login_agree_on_session_key() {
        // GIVEN: a registered principal
        let (record, server_pub) = register("correct horse battery staple", "alice@example.com", "sub-1");

        // WHEN: logging in with the right password
        let (server_session, finish) =
            login("correct horse battery staple", "alice@example.com", "sub-1", &record, &server_pub)
                .unwrap();

        // THEN: both sides hold the same session key
        assert_eq!(server_session, finish.session_key.to_vec());
        assert_eq!(finish.export_key.len(), EXPORT_KEY_LEN);
    }

    #[test]
    fn two_logins_same_export_key_different_session_keys() {
        // GIVEN: a registered principal
        let (record, server_pub) = register("correct horse battery staple", "alice@example.com", "sub-1");

        // WHEN: logging in twice
        let (_, first) =
            login("correct horse battery staple", "alice@example.com", "sub-1", &record, &server_pub)
                .unwrap();
        let (_, second) =
            login("correct horse battery staple", "alice@example.com", "sub-1", &record, &server_pub)
                .unwrap();

        // THEN: export keys identical, session keys fresh
        assert_eq!(first.export_key.to_vec(), second.export_key.to_vec());
        assert_ne!(first.session_key.to_vec(), second.session_key.to_vec());
    }

    #[test]
    fn wrong_password_fails_at_envelope_recovery() {
        // GIVEN: a registered principal
        let (record, server_pub) = register("correct horse battery staple", "alice@example.com", "sub-1");

        // WHEN: logging in with the wrong password
        let result = login("wrong", "alice@example.com", "sub-1", &record, &server_pub);

        // THEN: authentication fails
        assert!(result.is_err());
    }

    #[test]
    fn identity_mismatch_fails() {
        // GIVEN: a principal registered under alice's email
        let (record, server_pub) = register("pw pw pw", "alice@example.com", "sub-1");

        // WHEN: the server binds a different client identity at login
        let result = login("pw pw pw", "mallory@example.com", "sub-1", &record, &server_pub);

        // THEN: authentication fails
        assert!(result.is_err());
    }

    #[test]
    fn tampered_ke3_is_rejected_by_server() {
        // GIVEN: a valid exchange up to KE3
        let (record, server_pub) = register("pw pw pw", "alice@example.com", "sub-1");
        let (client, ke1) = ClientLoginStart::start("pw pw pw");
        let (ke2, state) = server::login_start(
            &SEED,
            &server_key(),
            "sub-1",
            "alice@example.com",
            &record,
            &server_pub,
            &ke1,
        )
        .unwrap();
        let finish = client.finish(&ke2, "alice@example.com").unwrap();

        // WHEN: the client MAC is flipped
        let mut bad = finish.ke3.clone();
        bad.client_mac[0] ^= 1;

        // THEN: the server rejects it
        assert!(server::login_finish(&state, &bad).is_err());

        // AND: a flipped signature is rejected too
        let mut bad_sig = finish.ke3;
        bad_sig.client_sig[0] ^= 1;
        assert!(server::login_finish(&state, &bad_sig).is_err());
    }

    #[test]
    fn server_key_substitution_is_detected_by_client() {
        // GIVEN: a registered principal
        let (record, _server_pub) = register("pw pw pw", "alice@example.com", "sub-1");

        // WHEN: a man-in-the-middle presents a different server key
        let mallory = SigningKey::from_bytes(&[6u8; 32]);
        let (client, ke1) = ClientLoginStart::start("pw pw pw");
        let (ke2, _state) = server::login_start(
            &SEED,
            &mallory,
            "sub-1",
            "alice@example.com",
            &record,
            &mallory.verifying_key().to_bytes(),
            &ke1,
        )
        .unwrap();

        // THEN: the client refuses (envelope binds the registered key)
        assert!(client.finish(&ke2, "alice@example.com").is_err());
    }

    #[test]
    fn reregistration_with_same_password_reproduces_export_key() {
        // GIVEN: two registrations with the same password (fresh nonces)
        let (reg1, req1) = ClientRegistration::start("same password");
        let resp1 = server::registration_response(&SEED, &server_key(), "sub-1", &req1).unwrap();
        let (rec1, export1) = reg1.finish(&resp1, "alice@example.com").unwrap();

        let (reg2, req2) = ClientRegistration::start("same password");
        let resp2 = server::registration_response(&SEED, &server_key(), "sub-1", &req2).unwrap();
        let (rec2, export2) = reg2.finish(&resp2, "alice@example.com").unwrap();

        // THEN: the records differ (fresh envelope nonce) but the export key
        // is reproduced, so its stored hash detects a same-password change
        assert_ne!(rec1.record, rec2.record);
        assert_eq!(export1.to_vec(), export2.to_vec());
        assert_eq!(rec1.export_key_hash, rec2.export_key_hash);

        // AND: a different password yields a different export-key hash
        let (reg3, req3) = ClientRegistration::start("different password");
        let resp3 = server::registration_response(&SEED, &server_key(), "sub-1", &req3).unwrap();
        let (rec3, _) = reg3.finish(&resp3, "alice@example.com").unwrap();
        assert_ne!(rec1.export_key_hash, rec3.export_key_hash);
    }
}
