//! OIDC code flow end-to-end: PKCE, nonce round-trip, single-use codes
//! under concurrency, client-bound refresh rotation, key rotation overlap.

mod common;

use axum::http::StatusCode;
use base64::Engine;
use pretty_assertions::assert_eq;
use serde_json::json;
use sha2::{Digest, Sha256};
use tower::ServiceExt;

use zkauth::oidc::TokenVerifier;
use zkauth::store::clients::{ClientUpsert, ZkDelivery};

use common::{form_request, installed_app, json_request, login_user, register_user, Cookies};

const VERIFIER: &str = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
const NONCE: &str = "n-0S6_WzA2Mj";

fn challenge() -> String {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(Sha256::digest(VERIFIER.as_bytes()))
}

fn app_web_client() -> ClientUpsert {
    ClientUpsert {
        client_id: "app-web".to_string(),
        name: "Web App".to_string(),
        redirect_uris: vec!["https://app/cb".to_string()],
        require_pkce: true,
        public: true,
        zk_delivery: ZkDelivery::None,
        allowed_jwe_algs: vec!["ECDH-ES".to_string()],
        allowed_jwe_encs: vec!["A256GCM".to_string()],
        refresh_lifetime_secs: None,
    }
}

/// Drive /authorize → login → finalize; returns the authorization code and
/// the user's cookie jar.
async fn obtain_code(
    ctx: &std::sync::Arc<zkauth::http::AppContext>,
    app: &axum::Router,
) -> (String, Cookies) {
    ctx.clients.create(&app_web_client()).unwrap();
    register_user(app, "alice@example.com", "Alice", "correct horse battery staple").await;
    let mut cookies = Cookies::default();
    login_user(app, &mut cookies, "alice@example.com", "correct horse battery staple")
        .await
        .unwrap();

    // GET /authorize redirects to the sign-in UI with the request id
    let uri = format!(
        "/authorize?client_id=app-web&redirect_uri=https%3A%2F%2Fapp%2Fcb&response_type=code\
         &scope=openid&state=xyz&nonce={NONCE}&code_challenge={}&code_challenge_method=S256",
        challenge()
    );
    let response = app
        .clone()
        .oneshot(
            axum::http::Request::builder()
                .method("GET")
                .uri(uri)
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert!(response.status().is_redirection());
    let location = response.headers()["location"].to_str().unwrap();
    let request_id = location.split("request_id=").nth(1).unwrap().to_string();

    // Finalize with the logged-in session
    let (status, body) = json_request(
        app,
        &mut cookies,
        false,
        "POST",
        "/api/user/authorize/finalize",
        Some(json!({ "authRequestId": request_id })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "finalize failed: {body}");

    let redirect = body["redirectUri"].as_str().unwrap();
    let parsed = url::Url::parse(redirect).unwrap();
    assert!(redirect.starts_with("https://app/cb?"));
    let code = parsed
        .query_pairs()
        .find(|(k, _)| k == "code")
        .map(|(_, v)| v.into_owned())
        .unwrap();
    let state = parsed
        .query_pairs()
        .find(|(k, _)| k == "state")
        .map(|(_, v)| v.into_owned())
        .unwrap();
    assert_eq!(state, "xyz");
    (code, cookies)
}

fn code_grant_fields<'a>(code: &'a str) -> Vec<(&'static str, &'a str)> {
    vec![
        ("grant_type", "authorization_code"),
        ("code", code),
        ("redirect_uri", "https://app/cb"),
        ("client_id", "app-web"),
        ("code_verifier", VERIFIER),
    ]
}

#[tokio::test]
async fn full_code_flow_id_token_carries_nonce_and_verifies() {
    // GIVEN: an authorization code from the full browser flow
    let (ctx, app) = installed_app();
    let (code, _) = obtain_code(&ctx, &app).await;

    // WHEN: redeemed at the token endpoint
    let (status, body) = form_request(&app, "/token", &code_grant_fields(&code)).await;
    assert_eq!(status, StatusCode::OK, "token failed: {body}");

    // THEN: the ID token verifies against the published JWKS and carries
    // the original nonce verbatim
    let jwks = ctx.services().unwrap().keystore.publish_jwks().unwrap();
    let verifier = TokenVerifier::new(jwks);
    let claims = verifier
        .verify(body["id_token"].as_str().unwrap(), "app-web")
        .unwrap();
    assert_eq!(claims.nonce.as_deref(), Some(NONCE));
    assert_eq!(claims.email.as_deref(), Some("alice@example.com"));
    assert_eq!(claims.iss, "https://idp.example.com");
    assert!(body["refresh_token"].as_str().is_some());
}

#[tokio::test]
async fn concurrent_redemptions_yield_exactly_one_success() {
    // GIVEN: one authorization code
    let (ctx, app) = installed_app();
    let (code, _) = obtain_code(&ctx, &app).await;

    // WHEN: two redemptions race
    let first_fields = code_grant_fields(&code);
    let second_fields = code_grant_fields(&code);
    let (first, second) = tokio::join!(
        form_request(&app, "/token", &first_fields),
        form_request(&app, "/token", &second_fields),
    );

    // THEN: exactly one 200 and one invalid_grant
    let statuses = [first.0, second.0];
    assert_eq!(
        statuses.iter().filter(|s| **s == StatusCode::OK).count(),
        1,
        "expected exactly one success, got {statuses:?}"
    );
    let failure = if first.0 == StatusCode::OK { &second } else { &first };
    assert_eq!(failure.0, StatusCode::BAD_REQUEST);
    assert_eq!(failure.1["error"], "invalid_grant");
}

#[tokio::test]
async fn refresh_token_is_bound_to_its_client() {
    // GIVEN: a redeemed code and a second registered client
    let (ctx, app) = installed_app();
    let (code, _) = obtain_code(&ctx, &app).await;
    let mut other = app_web_client();
    other.client_id = "other".to_string();
    ctx.clients.create(&other).unwrap();

    let (status, body) = form_request(&app, "/token", &code_grant_fields(&code)).await;
    assert_eq!(status, StatusCode::OK);
    let refresh_token = body["refresh_token"].as_str().unwrap().to_string();

    // WHEN: the wrong client tries to refresh
    let (status, body) = form_request(
        &app,
        "/token",
        &[
            ("grant_type", "refresh_token"),
            ("client_id", "other"),
            ("refresh_token", &refresh_token),
        ],
    )
    .await;

    // THEN: invalid_grant, and the token is still rotatable by app-web
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_grant");

    let (status, body) = form_request(
        &app,
        "/token",
        &[
            ("grant_type", "refresh_token"),
            ("client_id", "app-web"),
            ("refresh_token", &refresh_token),
        ],
    )
    .await;
    assert_eq!(status, StatusCode::OK, "rightful refresh failed: {body}");
    let rotated = body["refresh_token"].as_str().unwrap();
    assert_ne!(rotated, refresh_token);

    // AND: the pre-rotation token is now dead
    let (status, _) = form_request(
        &app,
        "/token",
        &[
            ("grant_type", "refresh_token"),
            ("client_id", "app-web"),
            ("refresh_token", &refresh_token),
        ],
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn rotation_during_validity_keeps_old_tokens_verifiable() {
    // GIVEN: a token minted under the first signing key
    let (ctx, app) = installed_app();
    let (code, _) = obtain_code(&ctx, &app).await;
    let (_, body) = form_request(&app, "/token", &code_grant_fields(&code)).await;
    let old_token = body["id_token"].as_str().unwrap().to_string();
    let refresh_token = body["refresh_token"].as_str().unwrap().to_string();
    let keystore = ctx.services().unwrap().keystore.clone();
    let old_kid = keystore.active_signing_key().kid;

    // WHEN: the signing key rotates and a new token is minted via refresh
    keystore.rotate_signing_key().unwrap();
    let (status, body) = form_request(
        &app,
        "/token",
        &[
            ("grant_type", "refresh_token"),
            ("client_id", "app-web"),
            ("refresh_token", &refresh_token),
        ],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let new_token = body["id_token"].as_str().unwrap().to_string();

    // THEN: both verify against the overlapping JWKS with distinct kids
    let verifier = TokenVerifier::new(keystore.publish_jwks().unwrap());
    verifier.verify(&old_token, "app-web").unwrap();
    verifier.verify(&new_token, "app-web").unwrap();
    let old_header = jsonwebtoken::decode_header(&old_token).unwrap();
    let new_header = jsonwebtoken::decode_header(&new_token).unwrap();
    assert_eq!(old_header.kid.as_deref(), Some(old_kid.as_str()));
    assert_ne!(old_header.kid, new_header.kid);

    // AND: after purging the old key, tokens signed with it stop verifying
    zkauth::keystore::signing::purge(&ctx.db, &old_kid).unwrap();
    let verifier = TokenVerifier::new(keystore.publish_jwks().unwrap());
    assert!(verifier.verify(&old_token, "app-web").is_err());
    verifier.verify(&new_token, "app-web").unwrap();
}

#[tokio::test]
async fn discovery_documents_are_served() {
    // GIVEN: the installed app
    let (_ctx, app) = installed_app();

    // WHEN/THEN: openid-configuration advertises the fixed suites
    let (status, body) = json_request(
        &app,
        &mut Cookies::default(),
        false,
        "GET",
        "/.well-known/openid-configuration",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["issuer"], "https://idp.example.com");
    assert_eq!(body["grant_types_supported"], json!(["authorization_code", "refresh_token"]));
    assert_eq!(body["id_token_signing_alg_values_supported"], json!(["EdDSA"]));

    // AND: the JWKS carries an OKP/Ed25519 key
    let (status, body) = json_request(
        &app,
        &mut Cookies::default(),
        false,
        "GET",
        "/.well-known/jwks.json",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["keys"][0]["kty"], "OKP");
    assert_eq!(body["keys"][0]["crv"], "Ed25519");
    assert!(body["keys"][0]["kid"].as_str().is_some());
}
