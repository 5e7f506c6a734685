//! Install bootstrap, admin login, OTP gating of the admin surface.

mod common;

use std::sync::Arc;

use axum::http::StatusCode;
use pretty_assertions::assert_eq;
use serde_json::json;

use zkauth::ake::{ClientLoginStart, ClientRegistration};
use zkauth::config::Config;
use zkauth::db::Db;
use zkauth::http::{router, AppContext};

use common::{json_request, Cookies};

/// An uninstalled application plus its minted install token.
fn uninstalled_app() -> (Arc<AppContext>, axum::Router, String) {
    let mut config = Config::default();
    config.server.development = true;
    config.rate_limits.enabled = false;
    // Fast KDF for the test install path
    config.keystore.kdf_memory_kib = 8;
    config.keystore.kdf_iterations = 1;
    std::env::set_var(&config.keystore.passphrase_env, "operator passphrase");
    let db = Db::open_in_memory().unwrap();
    let ctx = AppContext::new(config, db);
    let token = ctx.install.mint().unwrap();
    let app = router(ctx.clone());
    (ctx, app, token)
}

/// Run the interactive install: returns the admin email/password used.
async fn run_install(app: &axum::Router, token: &str) -> (String, String) {
    let email = "root@example.com".to_string();
    let password = "operator password".to_string();

    let (registration, request) = ClientRegistration::start(&password);
    let (status, body) = json_request(
        app,
        &mut Cookies::default(),
        false,
        "POST",
        "/api/install/opaque/start",
        Some(json!({ "token": token, "email": email, "name": "Root", "request": request })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "install start failed: {body}");

    let response = serde_json::from_value(body["message"].clone()).unwrap();
    let (record, _) = registration.finish(&response, &email).unwrap();

    let (status, body) = json_request(
        app,
        &mut Cookies::default(),
        false,
        "POST",
        "/api/install/complete",
        Some(json!({ "token": token, "email": email, "record": record })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "install complete failed: {body}");
    (email, password)
}

/// Admin login over HTTP; fills the cookie jar.
async fn login_admin(
    app: &axum::Router,
    cookies: &mut Cookies,
    email: &str,
    password: &str,
) -> (StatusCode, serde_json::Value) {
    let (client, ke1) = ClientLoginStart::start(password);
    let (status, body) = json_request(
        app,
        cookies,
        true,
        "POST",
        "/api/admin/opaque/login/start",
        Some(json!({ "email": email, "request": ke1 })),
    )
    .await;
    if status != StatusCode::OK {
        return (status, body);
    }
    let ke2 = serde_json::from_value(body["message"].clone()).unwrap();
    let session_id = body["sessionId"].as_str().unwrap().to_string();
    let finish = client.finish(&ke2, email).unwrap();
    json_request(
        app,
        cookies,
        true,
        "POST",
        "/api/admin/opaque/login/finish",
        Some(json!({ "finish": finish.ke3, "sessionId": session_id })),
    )
    .await
}

/// Current TOTP code for a base32 secret, as an authenticator app computes it.
fn current_totp(secret_base32: &str, email: &str) -> String {
    let secret = totp_rs::Secret::Encoded(secret_base32.to_string());
    totp_rs::TOTP::new(
        totp_rs::Algorithm::SHA1,
        6,
        1,
        30,
        secret.to_bytes().unwrap(),
        Some("zkauth".to_string()),
        email.to_string(),
    )
    .unwrap()
    .generate_current()
    .unwrap()
}

#[tokio::test]
async fn install_is_single_use_and_yields_a_working_admin() {
    // GIVEN: an uninstalled system
    let (ctx, app, token) = uninstalled_app();
    assert!(!ctx.install.is_installed().unwrap());

    // WHEN: installation completes
    let (email, password) = run_install(&app, &token).await;
    assert!(ctx.install.is_installed().unwrap());

    // THEN: the install token is burnt
    let (status, _) = json_request(
        &app,
        &mut Cookies::default(),
        false,
        "POST",
        "/api/install/complete",
        Some(json!({ "token": token, "email": email, "record": { "record": "", "exportKeyHash": "" } })),
    )
    .await;
    assert_ne!(status, StatusCode::OK);

    // AND: the bootstrapped admin can log in and list users
    let mut cookies = Cookies::default();
    let (status, body) = login_admin(&app, &mut cookies, &email, &password).await;
    assert_eq!(status, StatusCode::OK, "admin login failed: {body}");
    assert_eq!(body["role"], "write");

    let (status, _) = json_request(&app, &mut cookies, true, "GET", "/api/admin/users", None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn otp_enabled_admin_is_boxed_in_until_verified() {
    // GIVEN: an installed system with a logged-in admin
    let (_ctx, app, token) = uninstalled_app();
    let (email, password) = run_install(&app, &token).await;
    let mut cookies = Cookies::default();
    login_admin(&app, &mut cookies, &email, &password).await;

    // WHEN: the admin enrolls in OTP
    let (status, body) =
        json_request(&app, &mut cookies, true, "POST", "/api/admin/otp/setup/init", None).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let secret = body["secret"].as_str().unwrap().to_string();
    assert!(body["provisioning_uri"].as_str().unwrap().starts_with("otpauth://"));

    let code = current_totp(&secret, &email);
    let (status, body) = json_request(
        &app,
        &mut cookies,
        true,
        "POST",
        "/api/admin/otp/setup/verify",
        Some(json!({ "code": code })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert!(!body["backupCodes"].as_array().unwrap().is_empty());

    // AND: logs in again on a fresh session
    let mut fresh = Cookies::default();
    let (status, body) = login_admin(&app, &mut fresh, &email, &password).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["otpRequired"], true);
    assert_eq!(body["otpVerified"], false);

    // THEN: write endpoints are gated behind OTP verification
    let (status, body) = json_request(
        &app,
        &mut fresh,
        true,
        "POST",
        "/api/admin/users",
        Some(json!({ "email": "bob@example.com", "name": "Bob" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "otp_required");

    // Introspection stays reachable
    let (status, _) = json_request(&app, &mut fresh, true, "GET", "/api/admin/session", None).await;
    assert_eq!(status, StatusCode::OK);

    // AND: after verifying, the write goes through
    let code = current_totp(&secret, &email);
    let (status, body) = json_request(
        &app,
        &mut fresh,
        true,
        "POST",
        "/api/admin/otp/verify",
        Some(json!({ "code": code })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");

    let (status, _) = json_request(
        &app,
        &mut fresh,
        true,
        "POST",
        "/api/admin/users",
        Some(json!({ "email": "bob@example.com", "name": "Bob" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn admin_password_set_forces_reset_flag() {
    // GIVEN: an installed system, an admin, and a user
    let (ctx, app, token) = uninstalled_app();
    let (email, password) = run_install(&app, &token).await;
    let mut cookies = Cookies::default();
    login_admin(&app, &mut cookies, &email, &password).await;

    let (status, body) = json_request(
        &app,
        &mut cookies,
        true,
        "POST",
        "/api/admin/users",
        Some(json!({ "email": "carol@example.com", "name": "Carol" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let sub = body["sub"].as_str().unwrap().to_string();

    // WHEN: the admin runs the registration protocol on Carol's behalf
    let (registration, request) = ClientRegistration::start("temporary password");
    let (status, body) = json_request(
        &app,
        &mut cookies,
        true,
        "POST",
        &format!("/api/admin/users/{sub}/password/set/start"),
        Some(json!({ "request": request })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let response = serde_json::from_value(body["message"].clone()).unwrap();
    let (record, _) = registration.finish(&response, "carol@example.com").unwrap();
    let (status, body) = json_request(
        &app,
        &mut cookies,
        true,
        "POST",
        &format!("/api/admin/users/{sub}/password/set/finish"),
        Some(json!({ "record": record })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");

    // THEN: Carol can log in with the set password and sees the reset flag
    let mut carol = Cookies::default();
    let (body, _) = common::login_user(&app, &mut carol, "carol@example.com", "temporary password")
        .await
        .unwrap();
    assert_eq!(body["passwordResetRequired"], true);

    // AND: the flag is visible to the admin listing
    let listed = ctx.subjects.subject_by_id(&sub).unwrap().unwrap();
    assert!(listed.password_reset_required);
}

#[tokio::test]
async fn read_role_admin_cannot_write() {
    // GIVEN: an installed system and a read-only admin created by root
    let (ctx, app, token) = uninstalled_app();
    let (email, password) = run_install(&app, &token).await;
    let mut cookies = Cookies::default();
    login_admin(&app, &mut cookies, &email, &password).await;

    let (status, body) = json_request(
        &app,
        &mut cookies,
        true,
        "POST",
        "/api/admin/admin-users",
        Some(json!({ "email": "viewer@example.com", "name": "Viewer", "role": "read" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let viewer_id = body["admin_id"].as_str().unwrap().to_string();

    // Give the viewer a password via the admin set flow
    let (registration, request) = ClientRegistration::start("viewer password");
    let (_, body) = json_request(
        &app,
        &mut cookies,
        true,
        "POST",
        &format!("/api/admin/admin-users/{viewer_id}/password/set/start"),
        Some(json!({ "request": request })),
    )
    .await;
    let response = serde_json::from_value(body["message"].clone()).unwrap();
    let (record, _) = registration.finish(&response, "viewer@example.com").unwrap();
    json_request(
        &app,
        &mut cookies,
        true,
        "POST",
        &format!("/api/admin/admin-users/{viewer_id}/password/set/finish"),
        Some(json!({ "record": record })),
    )
    .await;

    // WHEN: the viewer logs in
    let mut viewer = Cookies::default();
    let (status, _) = login_admin(&app, &mut viewer, "viewer@example.com", "viewer password").await;
    assert_eq!(status, StatusCode::OK);

    // THEN: reads pass, writes are forbidden
    let (status, _) = json_request(&app, &mut viewer, true, "GET", "/api/admin/clients", None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = json_request(
        &app,
        &mut viewer,
        true,
        "POST",
        "/api/admin/users",
        Some(json!({ "email": "x@example.com", "name": "X" })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN, "{body}");

    drop(ctx);
}
