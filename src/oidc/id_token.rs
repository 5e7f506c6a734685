//! ID / access token minting and verification.
//!
//! Both tokens are JWTs signed EdDSA (Ed25519) with the active signing key;
//! the `kid` header lets verifiers pick the right JWKS entry across
//! rotation overlap. Access tokens carry a `token_use` discriminator so a
//! resource server cannot accept an ID token in place of an access token.

use jsonwebtoken::{Algorithm, DecodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::db::now;
use crate::keystore::{ActiveSigningKey, JwksDocument};
use crate::{Error, Result};

/// Claims of an ID token (and, with `token_use = "access"`, access tokens).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdTokenClaims {
    /// Issuer URL
    pub iss: String,
    /// Subject
    pub sub: String,
    /// Audience: the client id
    pub aud: String,
    /// Issued at
    pub iat: i64,
    /// Expiry
    pub exp: i64,
    /// Unique token id
    pub jti: String,
    /// Nonce from the authorization request, verbatim
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    /// Subject email
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Email verification state
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email_verified: Option<bool>,
    /// Display name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Organization id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,
    /// Organization slug
    #[serde(skip_serializing_if = "Option::is_none")]
    pub org_slug: Option<String>,
    /// Role names
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roles: Option<Vec<String>>,
    /// Permission names
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permissions: Option<Vec<String>>,
    /// `"access"` on access tokens, absent on ID tokens
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_use: Option<String>,
    /// Granted scope (access tokens)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl IdTokenClaims {
    /// Skeleton claims for a subject/audience pair, valid `ttl_secs`.
    #[must_use]
    pub fn new(issuer: &str, sub: &str, aud: &str, ttl_secs: i64) -> Self {
        let issued = now();
        Self {
            iss: issuer.to_string(),
            sub: sub.to_string(),
            aud: aud.to_string(),
            iat: issued,
            exp: issued + ttl_secs,
            jti: uuid::Uuid::new_v4().to_string(),
            nonce: None,
            email: None,
            email_verified: None,
            name: None,
            org_id: None,
            org_slug: None,
            roles: None,
            permissions: None,
            token_use: None,
            scope: None,
        }
    }
}

/// Sign claims with the active key; the `kid` goes into the JWT header.
pub fn sign(claims: &IdTokenClaims, key: &ActiveSigningKey) -> Result<String> {
    let mut header = Header::new(Algorithm::EdDSA);
    header.kid = Some(key.kid.clone());
    jsonwebtoken::encode(&header, claims, &key.encoding_key)
        .map_err(|e| Error::Internal(format!("token signing: {e}")))
}

/// Verifier over a published JWKS — what a relying party does, used by the
/// test suites to close the loop.
pub struct TokenVerifier {
    jwks: JwksDocument,
}

impl TokenVerifier {
    /// Build from a published JWKS.
    #[must_use]
    pub fn new(jwks: JwksDocument) -> Self {
        Self { jwks }
    }

    /// Verify signature and expiry; returns the claims. The token's `kid`
    /// must appear in the JWKS.
    pub fn verify(&self, token: &str, expected_aud: &str) -> Result<IdTokenClaims> {
        use base64::Engine;

        let header = jsonwebtoken::decode_header(token)
            .map_err(|e| Error::validation(format!("malformed token: {e}")))?;
        let kid = header
            .kid
            .ok_or_else(|| Error::validation("token has no kid"))?;
        let jwk = self
            .jwks
            .keys
            .iter()
            .find(|k| k.kid == kid)
            .ok_or_else(|| Error::validation(format!("unknown kid {kid}")))?;

        let public_key = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(&jwk.x)
            .map_err(|_| Error::Internal("malformed JWK".to_string()))?;

        let mut validation = Validation::new(Algorithm::EdDSA);
        validation.set_audience(&[expected_aud]);
        let data = jsonwebtoken::decode::<IdTokenClaims>(
            token,
            &DecodingKey::from_ed_der(&public_key),
            &validation,
        )
        .map_err(|e| Error::validation(format!("token verification failed: {e}")))?;
        Ok(data.claims)
    }
}
