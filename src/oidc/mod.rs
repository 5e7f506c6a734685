//! OIDC engine — authorization requests, codes, token grants, discovery.
//!
//! # Flow
//!
//! 1. `GET /authorize` validates the request against the client registry and
//!    persists it; the user agent goes to the sign-in UI with the request id.
//! 2. After login (and OTP, where required) `finalize` converts the pending
//!    request into a single-use authorization code, copying the nonce and,
//!    for zk-enabled clients, attaching the wrapped DRK blob.
//! 3. `POST /token` redeems the code (one winner under concurrency), mints
//!    the EdDSA ID token and access token, and binds a hashed refresh token
//!    to a fresh session row.
//!
//! PKCE is S256-only and compared in constant time. Redirect URIs match by
//! exact string equality, no wildcards, no prefixes.

mod discovery;
mod id_token;
mod token;

pub use discovery::discovery_document;
pub use id_token::{IdTokenClaims, TokenVerifier};
pub use token::{TokenRequest, TokenResponse};

use std::sync::Arc;

use base64::Engine;
use serde::Deserialize;

use crate::config::{OidcConfig, SessionConfig};
use crate::keystore::KeyStore;
use crate::rbac::{OrgContext, RbacResolver};
use crate::store::auth_requests::{AuthRequest, AuthRequestStore, NewAuthRequest};
use crate::store::clients::{Client, ClientStore, ZkDelivery};
use crate::store::codes::{CodeStore, NewCode};
use crate::store::sessions::SessionStore;
use crate::store::subjects::SubjectStore;
use crate::{Error, Result};

/// Query parameters of `GET /authorize`.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthorizeParams {
    /// Requesting client
    pub client_id: String,
    /// Redirect URI, must match a registered one exactly
    pub redirect_uri: String,
    /// Must be `code`
    pub response_type: String,
    /// Requested scope
    #[serde(default)]
    pub scope: Option<String>,
    /// Opaque client state
    #[serde(default)]
    pub state: Option<String>,
    /// Nonce, echoed into the ID token
    #[serde(default)]
    pub nonce: Option<String>,
    /// PKCE challenge
    #[serde(default)]
    pub code_challenge: Option<String>,
    /// PKCE method, must be `S256` when a challenge is present
    #[serde(default)]
    pub code_challenge_method: Option<String>,
}

/// Inputs to `finalize` beyond the authenticated subject.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeParams {
    /// The pending authorization request
    pub auth_request_id: String,
    /// Requested organization context
    #[serde(default)]
    pub organization_id: Option<String>,
    /// Caller's ephemeral public key for the zk channel
    #[serde(default)]
    pub zk_pub: Option<String>,
    /// Wrapped DRK (compact JWE) for zk-enabled clients
    #[serde(default)]
    pub wrapped_drk: Option<String>,
}

/// The OIDC engine.
#[derive(Clone)]
pub struct OidcEngine {
    pub(crate) auth_requests: AuthRequestStore,
    pub(crate) codes: CodeStore,
    pub(crate) sessions: SessionStore,
    pub(crate) clients: ClientStore,
    pub(crate) subjects: SubjectStore,
    pub(crate) keystore: Arc<KeyStore>,
    pub(crate) rbac: RbacResolver,
    pub(crate) issuer: String,
    pub(crate) oidc_config: OidcConfig,
    pub(crate) session_config: SessionConfig,
}

impl OidcEngine {
    /// Assemble the engine from its collaborators.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        auth_requests: AuthRequestStore,
        codes: CodeStore,
        sessions: SessionStore,
        clients: ClientStore,
        subjects: SubjectStore,
        keystore: Arc<KeyStore>,
        rbac: RbacResolver,
        issuer: String,
        oidc_config: OidcConfig,
        session_config: SessionConfig,
    ) -> Self {
        Self {
            auth_requests,
            codes,
            sessions,
            clients,
            subjects,
            keystore,
            rbac,
            issuer,
            oidc_config,
            session_config,
        }
    }

    /// Validate and persist an authorization request. Returns the stored
    /// request; the caller redirects the user agent to the sign-in UI with
    /// its id.
    pub fn begin_authorization(
        &self,
        params: &AuthorizeParams,
        request_origin: Option<&str>,
    ) -> Result<AuthRequest> {
        let client = self
            .clients
            .get(&params.client_id)?
            .ok_or_else(|| Error::validation("unknown client_id"))?;

        // Exact string equality, nothing fuzzier.
        if !client.redirect_uris.iter().any(|u| u == &params.redirect_uri) {
            return Err(Error::validation("redirect_uri is not registered for this client"));
        }
        if params.response_type != "code" {
            return Err(Error::validation("response_type must be code"));
        }

        match (&params.code_challenge, &params.code_challenge_method) {
            (Some(challenge), method) => {
                if method.as_deref() != Some("S256") {
                    return Err(Error::validation("code_challenge_method must be S256"));
                }
                if challenge.len() != 43 {
                    return Err(Error::validation("malformed code_challenge"));
                }
            }
            (None, _) if client.pkce_required() => {
                return Err(Error::validation("PKCE is required for this client"));
            }
            (None, _) => {}
        }

        self.auth_requests.create(&NewAuthRequest {
            client_id: params.client_id.clone(),
            redirect_uri: params.redirect_uri.clone(),
            scope: params.scope.clone().unwrap_or_else(|| "openid".to_string()),
            state: params.state.clone(),
            nonce: params.nonce.clone(),
            code_challenge: params.code_challenge.clone(),
            code_challenge_method: params
                .code_challenge
                .is_some()
                .then(|| "S256".to_string()),
            request_origin: request_origin.map(str::to_string),
        })
    }

    /// Convert a pending request into an authorization code for the
    /// authenticated subject. Returns the redirect URL carrying `code` and
    /// `state`. `otp_verified` reflects the caller's session; an org with
    /// `require_otp` refuses finalization until it is true.
    pub fn finalize(&self, sub: &str, otp_verified: bool, params: &FinalizeParams) -> Result<String> {
        let request = self.auth_requests.get_pending(&params.auth_request_id)?;
        let client = self
            .clients
            .get(&request.client_id)?
            .ok_or_else(|| Error::validation("client no longer exists"))?;

        let org = self.resolve_org_for_finalize(sub, params.organization_id.as_deref())?;
        if org.as_ref().is_some_and(|o| o.require_otp) && !otp_verified {
            return Err(Error::OtpRequired);
        }

        let wrapped_drk = match (client.zk_delivery, &params.wrapped_drk) {
            (ZkDelivery::FragmentJwe, Some(blob)) => {
                validate_jwe_header(blob, &client)?;
                Some(blob.clone())
            }
            (ZkDelivery::FragmentJwe, None) => None,
            (ZkDelivery::None, Some(_)) => {
                return Err(Error::validation("client has no zk delivery channel"));
            }
            (ZkDelivery::None, None) => None,
        };
        if let Some(ref zk_pub) = params.zk_pub {
            self.auth_requests.set_zk_pub_key(&request.id, zk_pub)?;
        }

        self.auth_requests.mark_finalized(&request.id)?;
        let code = self.codes.issue(&NewCode {
            auth_request_id: request.id.clone(),
            sub: sub.to_string(),
            client_id: request.client_id.clone(),
            redirect_uri: request.redirect_uri.clone(),
            scope: request.scope.clone(),
            nonce: request.nonce.clone(),
            code_challenge: request.code_challenge.clone(),
            wrapped_drk,
            zk_client_pub: params.zk_pub.clone(),
            org_id: org.map(|o| o.org_id),
        })?;

        let mut redirect = url::Url::parse(&request.redirect_uri)
            .map_err(|_| Error::validation("stored redirect_uri is not a URL"))?;
        redirect.query_pairs_mut().append_pair("code", &code);
        if let Some(ref state) = request.state {
            redirect.query_pairs_mut().append_pair("state", state);
        }
        Ok(redirect.to_string())
    }

    /// Organization context at finalize time.
    ///
    /// Subjects with no memberships get no org claims (plain OIDC); with
    /// memberships the resolution rules apply in full, including the
    /// explicit-choice requirement when several are active.
    fn resolve_org_for_finalize(
        &self,
        sub: &str,
        requested_org: Option<&str>,
    ) -> Result<Option<OrgContext>> {
        match self.rbac.resolve(sub, requested_org) {
            Ok(context) => Ok(Some(context)),
            Err(Error::Forbidden(ref code)) if code == "no_active_membership" => {
                if requested_org.is_some() {
                    Err(Error::Forbidden("no_active_membership".to_string()))
                } else {
                    Ok(None)
                }
            }
            Err(other) => Err(other),
        }
    }
}

/// Validate a compact JWE's protected header against the client's allowed
/// algorithms. The payload stays opaque to the server.
fn validate_jwe_header(jwe: &str, client: &Client) -> Result<()> {
    let header_b64 = jwe
        .split('.')
        .next()
        .ok_or_else(|| Error::validation("malformed JWE"))?;
    let header_bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(header_b64)
        .map_err(|_| Error::validation("malformed JWE header"))?;
    let header: serde_json::Value = serde_json::from_slice(&header_bytes)
        .map_err(|_| Error::validation("malformed JWE header"))?;

    let alg = header.get("alg").and_then(|v| v.as_str()).unwrap_or("");
    let enc = header.get("enc").and_then(|v| v.as_str()).unwrap_or("");
    if !client.allowed_jwe_algs.iter().any(|a| a == alg) {
        return Err(Error::validation(format!("JWE alg {alg} not allowed")));
    }
    if !client.allowed_jwe_encs.iter().any(|e| e == enc) {
        return Err(Error::validation(format!("JWE enc {enc} not allowed")));
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::test_support::{authorize_params, engine, pkce_pair};
    use super::*;

    #[test]
    fn authorize_validates_client_and_redirect() {
        let (engine, _db) = engine();
        let (_, challenge) = pkce_pair();

        // Unknown client
        let mut params = authorize_params(&challenge);
        params.client_id = "ghost".to_string();
        assert!(matches!(
            engine.begin_authorization(&params, None),
            Err(Error::Validation(_))
        ));

        // Unregistered redirect (exact match only)
        let mut params = authorize_params(&challenge);
        params.redirect_uri = "https://app/cb/".to_string();
        assert!(matches!(
            engine.begin_authorization(&params, None),
            Err(Error::Validation(_))
        ));

        // Wrong response type
        let mut params = authorize_params(&challenge);
        params.response_type = "token".to_string();
        assert!(matches!(
            engine.begin_authorization(&params, None),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn pkce_is_mandatory_for_public_clients() {
        let (engine, _db) = engine();
        let (_, challenge) = pkce_pair();

        let mut params = authorize_params(&challenge);
        params.code_challenge = None;
        params.code_challenge_method = None;
        assert!(matches!(
            engine.begin_authorization(&params, None),
            Err(Error::Validation(_))
        ));

        // plain method rejected
        let mut params = authorize_params(&challenge);
        params.code_challenge_method = Some("plain".to_string());
        assert!(matches!(
            engine.begin_authorization(&params, None),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn finalize_builds_redirect_with_code_and_state() {
        let (engine, _db) = engine();
        let (_, challenge) = pkce_pair();
        let sub = engine
            .subjects
            .create_subject("a@example.com", "A")
            .unwrap()
            .sub;
        let request = engine
            .begin_authorization(&authorize_params(&challenge), Some("https://app"))
            .unwrap();

        let redirect = engine
            .finalize(
                &sub,
                true,
                &FinalizeParams {
                    auth_request_id: request.id.clone(),
                    organization_id: None,
                    zk_pub: None,
                    wrapped_drk: None,
                },
            )
            .unwrap();

        let parsed = url::Url::parse(&redirect).unwrap();
        assert!(parsed.as_str().starts_with("https://app/cb?"));
        let pairs: std::collections::HashMap<_, _> = parsed.query_pairs().into_owned().collect();
        assert!(pairs.contains_key("code"));
        assert_eq!(pairs.get("state").map(String::as_str), Some("xyz"));

        // A second finalize of the same request conflicts
        assert!(matches!(
            engine.finalize(
                &sub,
                true,
                &FinalizeParams {
                    auth_request_id: request.id,
                    organization_id: None,
                    zk_pub: None,
                    wrapped_drk: None,
                }
            ),
            Err(Error::Conflict(_))
        ));
    }

    #[test]
    fn wrapped_drk_header_is_validated() {
        let (engine, _db) = engine();
        let (_, challenge) = pkce_pair();
        let sub = engine
            .subjects
            .create_subject("a@example.com", "A")
            .unwrap()
            .sub;

        // A JWE with a disallowed alg
        let bad_header = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .encode(r#"{"alg":"RSA-OAEP","enc":"A256GCM"}"#);
        let bad_jwe = format!("{bad_header}..c.d.e");
        let request = engine
            .begin_authorization(&authorize_params(&challenge), None)
            .unwrap();
        assert!(matches!(
            engine.finalize(
                &sub,
                true,
                &FinalizeParams {
                    auth_request_id: request.id,
                    organization_id: None,
                    zk_pub: Some("pub".to_string()),
                    wrapped_drk: Some(bad_jwe),
                }
            ),
            Err(Error::Validation(_))
        ));

        // The default ECDH-ES + A256GCM is accepted
        let good_header = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .encode(r#"{"alg":"ECDH-ES","enc":"A256GCM"}"#);
        let good_jwe = format!("{good_header}..c.d.e");
        let request = engine
            .begin_authorization(&authorize_params(&challenge), None)
            .unwrap();
        engine
            .finalize(
                &sub,
                true,
                &FinalizeParams {
                    auth_request_id: request.id,
                    organization_id: None,
                    zk_pub: Some("pub".to_string()),
                    wrapped_drk: Some(good_jwe),
                },
            )
            .unwrap();
    }
}
