//! Public OIDC endpoints: `/authorize`, `/token`, well-known documents.

use std::sync::Arc;

use axum::extract::{Form, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Redirect};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;

use crate::audit::AuditEvent;
use crate::oidc::{AuthorizeParams, TokenRequest};
use crate::Result;

use super::rate_limit::RouteClass;
use super::{client_ip, AppContext};

/// Route table for the OIDC surface.
pub fn routes() -> Router<Arc<AppContext>> {
    Router::new()
        .route("/authorize", get(authorize))
        .route("/token", post(token))
        .route("/.well-known/openid-configuration", get(openid_configuration))
        .route("/.well-known/jwks.json", get(jwks))
}

/// `GET /authorize` — validate, persist, and hand off to the sign-in UI.
async fn authorize(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Query(params): Query<AuthorizeParams>,
) -> Result<Redirect> {
    ctx.rate_limits
        .check(RouteClass::General, &client_ip(&headers))?;
    let services = ctx.services()?;

    let origin = headers
        .get("origin")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let request = services
        .oidc
        .begin_authorization(&params, origin.as_deref())?;

    Ok(Redirect::to(&format!("/signin?request_id={}", request.id)))
}

/// `POST /token` — the standard OIDC token endpoint.
async fn token(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Form(request): Form<TokenRequest>,
) -> Result<impl IntoResponse> {
    let ip = client_ip(&headers);
    ctx.rate_limits.check(RouteClass::Auth, &ip)?;
    let services = ctx.services()?;

    let grant = request.grant_type.clone();
    let client_id = request.client_id.clone();
    let result = services.oidc.token(&request);

    let mut event = AuditEvent::new("oidc.token", "POST", "/token", "token");
    event.client_id = Some(client_id);
    event.ip_address = Some(ip);
    event.resource_type = Some("grant".to_string());
    event.resource_id = Some(grant);
    let event = match &result {
        Ok(_) => event.outcome(200, None),
        Err(e) => event.outcome(e.status().as_u16(), Some(e.code())),
    };
    ctx.audit.emit(&event);

    result.map(Json)
}

/// `GET /.well-known/openid-configuration`
async fn openid_configuration(State(ctx): State<Arc<AppContext>>) -> Json<serde_json::Value> {
    Json(crate::oidc::discovery_document(&ctx.config.server.issuer))
}

/// `GET /.well-known/jwks.json`
async fn jwks(State(ctx): State<Arc<AppContext>>) -> Result<Json<serde_json::Value>> {
    let services = ctx.services()?;
    let document = services.keystore.publish_jwks()?;
    Ok(Json(json!({ "keys": document.keys })))
}
