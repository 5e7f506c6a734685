//! Shared harness for the end-to-end suites: an installed in-memory server
//! plus small request/cookie helpers for driving the router directly.

// Each suite uses its own slice of these helpers.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use zkauth::config::Config;
use zkauth::db::Db;
use zkauth::http::{router, AppContext};
use zkauth::keystore::{fresh_kek_params, KeyStore};

/// An installed application over an in-memory database, development mode,
/// rate limits off (the rate-limit unit tests cover those).
pub fn installed_app() -> (Arc<AppContext>, Router) {
    let mut config = Config::default();
    config.server.development = true;
    config.server.issuer = "https://idp.example.com".to_string();
    config.rate_limits.enabled = false;
    let db = Db::open_in_memory().unwrap();
    let keystore = Arc::new(
        KeyStore::install(db.clone(), "test passphrase", fresh_kek_params(8, 1, 1)).unwrap(),
    );
    let ctx = AppContext::new(config, db);
    ctx.attach_keystore(keystore);
    let app = router(ctx.clone());
    (ctx, app)
}

/// Cookies accumulated across requests, plus the CSRF token to echo.
#[derive(Debug, Default, Clone)]
pub struct Cookies {
    jar: HashMap<String, String>,
}

impl Cookies {
    pub fn absorb(&mut self, response: &Response<Body>) {
        for set_cookie in response.headers().get_all("set-cookie") {
            let Ok(raw) = set_cookie.to_str() else { continue };
            let Some(pair) = raw.split(';').next() else { continue };
            let Some((name, value)) = pair.split_once('=') else { continue };
            if value.is_empty() {
                self.jar.remove(name.trim());
            } else {
                self.jar.insert(name.trim().to_string(), value.to_string());
            }
        }
    }

    pub fn header(&self) -> String {
        self.jar
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("; ")
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.jar.get(name).map(String::as_str)
    }

    pub fn csrf(&self, admin: bool) -> Option<&str> {
        self.get(if admin {
            "__Host-ZkAuth-Admin-Csrf"
        } else {
            "__Host-ZkAuth-Csrf"
        })
    }

    /// Forget the CSRF cookie (simulates a client that cannot echo it).
    pub fn remove_csrf(&mut self, admin: bool) {
        self.jar.remove(if admin {
            "__Host-ZkAuth-Admin-Csrf"
        } else {
            "__Host-ZkAuth-Csrf"
        });
    }
}

/// One JSON request against the router; cookies and CSRF applied and
/// re-absorbed. Returns status and parsed body.
pub async fn json_request(
    app: &Router,
    cookies: &mut Cookies,
    admin: bool,
    method: &str,
    path: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(path);
    if !cookies.jar.is_empty() {
        builder = builder.header("cookie", cookies.header());
    }
    if let Some(csrf) = cookies.csrf(admin) {
        builder = builder.header("x-csrf-token", csrf.to_string());
    }
    let request = match body {
        Some(value) => builder
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&value).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    cookies.absorb(&response);
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

/// A form-encoded request (the token endpoint).
pub async fn form_request(
    app: &Router,
    path: &str,
    fields: &[(&str, &str)],
) -> (StatusCode, Value) {
    let body: String = url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(fields.iter().copied())
        .finish();
    let request = Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/x-www-form-urlencoded")
        .body(Body::from(body))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

/// Register a user over HTTP with the in-crate aPAKE client.
/// Returns the subject id and the export key.
pub async fn register_user(
    app: &Router,
    email: &str,
    name: &str,
    password: &str,
) -> (String, Vec<u8>) {
    use zkauth::ake::ClientRegistration;

    let (registration, request) = ClientRegistration::start(password);
    let (status, body) = json_request(
        app,
        &mut Cookies::default(),
        false,
        "POST",
        "/api/user/opaque/register/start",
        Some(serde_json::json!({ "email": email, "request": request })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "register start failed: {body}");

    let response = serde_json::from_value(body["message"].clone()).unwrap();
    let (record, export_key) = registration.finish(&response, email).unwrap();

    let (status, body) = json_request(
        app,
        &mut Cookies::default(),
        false,
        "POST",
        "/api/user/opaque/register/finish",
        Some(serde_json::json!({ "email": email, "name": name, "record": record })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "register finish failed: {body}");
    (
        body["sub"].as_str().unwrap().to_string(),
        export_key.to_vec(),
    )
}

/// Log a user in over HTTP. On success the cookie jar holds the session and
/// the export key is returned alongside the response body.
pub async fn login_user(
    app: &Router,
    cookies: &mut Cookies,
    email: &str,
    password: &str,
) -> Result<(Value, Vec<u8>), StatusCode> {
    use zkauth::ake::ClientLoginStart;

    let (client, ke1) = ClientLoginStart::start(password);
    let (status, body) = json_request(
        app,
        cookies,
        false,
        "POST",
        "/api/user/opaque/login/start",
        Some(serde_json::json!({ "email": email, "request": ke1 })),
    )
    .await;
    if status != StatusCode::OK {
        return Err(status);
    }

    let ke2 = serde_json::from_value(body["message"].clone()).unwrap();
    let session_id = body["sessionId"].as_str().unwrap().to_string();
    let finish = client.finish(&ke2, email).map_err(|_| StatusCode::BAD_REQUEST)?;

    let (status, body) = json_request(
        app,
        cookies,
        false,
        "POST",
        "/api/user/opaque/login/finish",
        Some(serde_json::json!({ "finish": finish.ke3, "sessionId": session_id })),
    )
    .await;
    if status != StatusCode::OK {
        return Err(status);
    }
    Ok((body, finish.export_key.to_vec()))
}
