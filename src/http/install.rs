//! Install cohort — first-run bootstrap guarded by a single-use token.
//!
//! Installation is interactive because the first admin's OPAQUE
//! registration needs a server round: `opaque/start` verifies the token,
//! performs the key-store installation (KEK parameters, OPRF seed, AKE
//! identity key, first signing key) and returns the registration response;
//! `complete` consumes the token and stores the admin credential.

use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use serde::Deserialize;
use serde_json::json;

use crate::ake::{self, RegistrationRecord, RegistrationRequest};
use crate::audit::AuditEvent;
use crate::keystore::{fresh_kek_params, KeyStore};
use crate::store::credentials::Credential;
use crate::store::subjects::AdminRole;
use crate::store::Cohort;
use crate::{Error, Result};

use super::AppContext;

/// Route table for the install cohort.
pub fn routes() -> Router<Arc<AppContext>> {
    Router::new()
        .route("/api/install/status", get(status))
        .route("/api/install/opaque/start", post(opaque_start))
        .route("/api/install/complete", post(complete))
}

async fn status(State(ctx): State<Arc<AppContext>>) -> Result<impl IntoResponse> {
    Ok(Json(json!({
        "installed": ctx.install.is_installed()?,
        "unlocked": ctx.is_unlocked(),
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstallStartBody {
    token: String,
    email: String,
    name: String,
    request: RegistrationRequest,
}

async fn opaque_start(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<InstallStartBody>,
) -> Result<impl IntoResponse> {
    ctx.install.peek(&body.token)?;

    // Idempotent across a retried start: install once, then reuse.
    if !ctx.is_unlocked() {
        if ctx.install.is_installed()? {
            return Err(Error::Internal(
                "installed but locked; restart with the passphrase set".to_string(),
            ));
        }
        let passphrase = std::env::var(&ctx.config.keystore.passphrase_env).map_err(|_| {
            Error::Internal(format!(
                "{} must be set before installation",
                ctx.config.keystore.passphrase_env
            ))
        })?;
        let params = fresh_kek_params(
            ctx.config.keystore.kdf_memory_kib,
            ctx.config.keystore.kdf_iterations,
            ctx.config.keystore.kdf_parallelism,
        );
        let keystore = Arc::new(KeyStore::install(ctx.db.clone(), &passphrase, params)?);
        ctx.attach_keystore(keystore);
    }
    let services = ctx.services()?;

    let admin = match ctx.subjects.admin_by_email(&body.email)? {
        Some(existing) => existing,
        None => ctx
            .subjects
            .create_admin(&body.email, &body.name, AdminRole::Write)?,
    };

    let response = ake::registration_response(
        services.keystore.oprf_seed(),
        services.keystore.ake_key(),
        &admin.admin_id,
        &body.request,
    )?;
    let server_public_key = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .encode(&response.server_pub_key);
    Ok(Json(json!({
        "message": response,
        "serverPublicKey": server_public_key,
        "adminId": admin.admin_id,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstallCompleteBody {
    token: String,
    email: String,
    record: RegistrationRecord,
}

async fn complete(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<InstallCompleteBody>,
) -> Result<impl IntoResponse> {
    let services = ctx.services()?;
    ake::validate_record(&body.record.record)?;

    let admin = ctx
        .subjects
        .admin_by_email(&body.email)?
        .ok_or(Error::Unauthorized)?;

    // Single-use: this is the step that burns the token.
    ctx.install.consume(&body.token)?;
    ctx.credentials.force_set(
        Cohort::Admin,
        &admin.admin_id,
        &Credential {
            envelope: body.record.record.clone(),
            server_pub_key: services.keystore.ake_public_key().to_vec(),
            export_key_hash: body.record.export_key_hash.clone(),
        },
    )?;

    let mut event = AuditEvent::new("install.complete", "POST", "/api/install/complete", "install")
        .outcome(200, None);
    event.admin_id = Some(admin.admin_id.clone());
    ctx.audit.emit(&event);

    Ok(Json(json!({ "ok": true, "adminId": admin.admin_id })))
}
