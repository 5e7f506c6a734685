//! The token endpoint — `authorization_code` and `refresh_token` grants.

use subtle::ConstantTimeEq;

use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::store::sessions::NewSession;
use crate::store::{random_token, Cohort};
use crate::{Error, Result};

use super::id_token::{sign, IdTokenClaims};
use super::OidcEngine;

/// Form body of `POST /token`.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenRequest {
    /// `authorization_code` or `refresh_token`
    pub grant_type: String,
    /// The code being redeemed (code grant)
    #[serde(default)]
    pub code: Option<String>,
    /// Redirect URI, must equal the one bound to the code
    #[serde(default)]
    pub redirect_uri: Option<String>,
    /// Requesting client
    pub client_id: String,
    /// PKCE verifier
    #[serde(default)]
    pub code_verifier: Option<String>,
    /// The refresh token being rotated (refresh grant)
    #[serde(default)]
    pub refresh_token: Option<String>,
}

/// Successful token response.
#[derive(Debug, Clone, Serialize)]
pub struct TokenResponse {
    /// Signed access token (JWT, `token_use = "access"`)
    pub access_token: String,
    /// Always `Bearer`
    pub token_type: String,
    /// Seconds until the access token expires
    pub expires_in: i64,
    /// Signed ID token
    pub id_token: String,
    /// Rotating refresh token
    pub refresh_token: String,
    /// Granted scope
    pub scope: String,
    /// Wrapped DRK blob for zk-enabled clients, passed through opaquely
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zk_drk_jwe: Option<String>,
}

impl OidcEngine {
    /// Dispatch a token request by grant type.
    pub fn token(&self, request: &TokenRequest) -> Result<TokenResponse> {
        match request.grant_type.as_str() {
            "authorization_code" => self.token_code_grant(request),
            "refresh_token" => self.token_refresh_grant(request),
            other => Err(Error::validation(format!("unsupported grant_type {other}"))),
        }
    }

    /// `authorization_code`: redeem the code (single winner), resolve the
    /// org context, mint the tokens, bind a refresh token to a new session.
    fn token_code_grant(&self, request: &TokenRequest) -> Result<TokenResponse> {
        let code = request
            .code
            .as_deref()
            .ok_or_else(|| Error::validation("code is required"))?;
        let redirect_uri = request
            .redirect_uri
            .as_deref()
            .ok_or_else(|| Error::validation("redirect_uri is required"))?;

        let chain_id = random_token();
        let verifier = request.code_verifier.clone();
        let redeemed = self.codes.redeem(
            code,
            &request.client_id,
            redirect_uri,
            &chain_id,
            |challenge| verify_pkce(challenge, verifier.as_deref()),
        )?;

        let subject = self
            .subjects
            .subject_by_id(&redeemed.sub)?
            .ok_or_else(|| Error::InvalidGrant("subject no longer exists".to_string()))?;

        // Fresh role data at mint time for the org bound to the code.
        let org = redeemed
            .org_id
            .as_deref()
            .map(|org_id| self.rbac.resolve(&redeemed.sub, Some(org_id)))
            .transpose()?;

        let client = self
            .clients
            .get(&request.client_id)?
            .ok_or_else(|| Error::InvalidGrant("unknown client".to_string()))?;
        let absolute_secs = client
            .refresh_lifetime_secs
            .unwrap_or(self.session_config.user_absolute_secs);

        let issued = self.sessions.create(
            &NewSession {
                cohort: Cohort::User,
                principal_id: redeemed.sub.clone(),
                client_id: Some(request.client_id.clone()),
                idle_secs: self.session_config.idle_timeout_secs,
                absolute_secs,
                otp_verified: None,
                org_id: redeemed.org_id.clone(),
                chain_id: Some(chain_id),
            },
            true,
        )?;

        let key = self.keystore.active_signing_key();
        let ttl = self.oidc_config.token_ttl_secs;

        let mut id_claims = IdTokenClaims::new(&self.issuer, &redeemed.sub, &request.client_id, ttl);
        id_claims.nonce = redeemed.nonce.clone();
        id_claims.email = Some(subject.email.clone());
        id_claims.email_verified = Some(true);
        id_claims.name = Some(subject.name.clone());
        if let Some(ref org) = org {
            id_claims.org_id = Some(org.org_id.clone());
            id_claims.org_slug = Some(org.org_slug.clone());
            id_claims.roles = Some(org.roles.clone());
            id_claims.permissions = Some(org.permissions.clone());
        }

        let mut access_claims =
            IdTokenClaims::new(&self.issuer, &redeemed.sub, &request.client_id, ttl);
        access_claims.token_use = Some("access".to_string());
        access_claims.scope = Some(redeemed.scope.clone());
        if let Some(ref org) = org {
            access_claims.org_id = Some(org.org_id.clone());
            access_claims.roles = Some(org.roles.clone());
            access_claims.permissions = Some(org.permissions.clone());
        }

        Ok(TokenResponse {
            access_token: sign(&access_claims, &key)?,
            token_type: "Bearer".to_string(),
            expires_in: ttl,
            id_token: sign(&id_claims, &key)?,
            refresh_token: issued
                .refresh_token
                .ok_or_else(|| Error::Internal("refresh token not minted".to_string()))?,
            scope: redeemed.scope,
            zk_drk_jwe: redeemed.wrapped_drk,
        })
    }

    /// `refresh_token`: rotate atomically and reissue tokens with fresh
    /// `jti`s. The old token is invalid before the new one is delivered.
    fn token_refresh_grant(&self, request: &TokenRequest) -> Result<TokenResponse> {
        let presented = request
            .refresh_token
            .as_deref()
            .ok_or_else(|| Error::validation("refresh_token is required"))?;

        let rotated = self.sessions.rotate_refresh(
            presented,
            &request.client_id,
            self.session_config.idle_timeout_secs,
        )?;
        let session = &rotated.session;

        let subject = self
            .subjects
            .subject_by_id(&session.principal_id)?
            .ok_or_else(|| Error::InvalidGrant("subject no longer exists".to_string()))?;

        let org = session
            .org_id
            .as_deref()
            .map(|org_id| self.rbac.resolve(&session.principal_id, Some(org_id)))
            .transpose()?;

        let key = self.keystore.active_signing_key();
        let ttl = self.oidc_config.token_ttl_secs;

        let mut id_claims =
            IdTokenClaims::new(&self.issuer, &session.principal_id, &request.client_id, ttl);
        id_claims.email = Some(subject.email.clone());
        id_claims.email_verified = Some(true);
        id_claims.name = Some(subject.name.clone());
        if let Some(ref org) = org {
            id_claims.org_id = Some(org.org_id.clone());
            id_claims.org_slug = Some(org.org_slug.clone());
            id_claims.roles = Some(org.roles.clone());
            id_claims.permissions = Some(org.permissions.clone());
        }

        let mut access_claims =
            IdTokenClaims::new(&self.issuer, &session.principal_id, &request.client_id, ttl);
        access_claims.token_use = Some("access".to_string());

        Ok(TokenResponse {
            access_token: sign(&access_claims, &key)?,
            token_type: "Bearer".to_string(),
            expires_in: ttl,
            id_token: sign(&id_claims, &key)?,
            refresh_token: rotated
                .refresh_token
                .ok_or_else(|| Error::Internal("refresh token not minted".to_string()))?,
            scope: "openid".to_string(),
            zk_drk_jwe: None,
        })
    }
}

/// Constant-time PKCE check: base64url(SHA-256(verifier)) == challenge.
fn verify_pkce(stored_challenge: Option<&str>, verifier: Option<&str>) -> Result<()> {
    match (stored_challenge, verifier) {
        (None, _) => Ok(()),
        (Some(_), None) => Err(Error::InvalidGrant("code_verifier is required".to_string())),
        (Some(challenge), Some(verifier)) => {
            if verifier.len() < 43 || verifier.len() > 128 {
                return Err(Error::InvalidGrant("malformed code_verifier".to_string()));
            }
            let computed = base64::engine::general_purpose::URL_SAFE_NO_PAD
                .encode(Sha256::digest(verifier.as_bytes()));
            let matches = computed.as_bytes().len() == challenge.as_bytes().len()
                && bool::from(computed.as_bytes().ct_eq(challenge.as_bytes()));
            if matches {
                Ok(())
            } else {
                Err(Error::InvalidGrant("PKCE verification failed".to_string()))
            }
        }
    }
}
