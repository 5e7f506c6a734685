//! User-cohort endpoints — OPAQUE registration/login, session, OTP,
//! password change, authorization finalize.
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/api/user/opaque/register/start` | OPRF evaluation for registration |
//! | `POST` | `/api/user/opaque/register/finish` | Persist envelope + server key |
//! | `POST` | `/api/user/opaque/login/start` | KE1 → KE2 |
//! | `POST` | `/api/user/opaque/login/finish` | KE3 → session cookie |
//! | `GET`  | `/api/user/session` | Session introspection |
//! | `POST` | `/api/user/logout` | Delete the session |
//! | `POST` | `/api/user/authorize/finalize` | Pending auth request → code |
//! | `GET`  | `/api/user/otp/status` | OTP state |
//! | `POST` | `/api/user/otp/setup/init` | Begin enrollment |
//! | `POST` | `/api/user/otp/setup/verify` | Confirm enrollment |
//! | `POST` | `/api/user/otp/verify` | Verify a login-time code |
//! | `POST` | `/api/user/password/change/start` | OPRF evaluation for change |
//! | `POST` | `/api/user/password/change/finish` | Replace the envelope |
//!
//! Login failures are uniform: the response never distinguishes an unknown
//! email from a wrong password, and unknown-email starts still run an OPRF
//! evaluation so the timing profile matches.

use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use axum_extra::extract::cookie::CookieJar;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::ake::{self, Ke1, Ke3, RegistrationRecord, RegistrationRequest};
use crate::audit::AuditEvent;
use crate::oidc::FinalizeParams;
use crate::store::credentials::Credential;
use crate::store::login_sessions::PendingLogin;
use crate::store::sessions::NewSession;
use crate::store::Cohort;
use crate::{Error, Result};

use super::rate_limit::RouteClass;
use super::{client_ip, cookies, require_session, AppContext, CsrfCheck};

/// Route table for the user cohort.
pub fn routes() -> Router<Arc<AppContext>> {
    Router::new()
        .route("/api/user/opaque/register/start", post(register_start))
        .route("/api/user/opaque/register/finish", post(register_finish))
        .route("/api/user/opaque/login/start", post(login_start))
        .route("/api/user/opaque/login/finish", post(login_finish))
        .route("/api/user/session", get(session_info))
        .route("/api/user/logout", post(logout))
        .route("/api/user/authorize/finalize", post(authorize_finalize))
        .route("/api/user/otp/status", get(otp_status))
        .route("/api/user/otp/setup/init", post(otp_setup_init))
        .route("/api/user/otp/setup/verify", post(otp_setup_verify))
        .route("/api/user/otp/verify", post(otp_verify))
        .route("/api/user/password/change/start", post(password_change_start))
        .route("/api/user/password/change/finish", post(password_change_finish))
}

// ── Registration ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterStartBody {
    email: String,
    request: RegistrationRequest,
}

async fn register_start(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Json(body): Json<RegisterStartBody>,
) -> Result<impl IntoResponse> {
    ctx.rate_limits.check(RouteClass::Auth, &client_ip(&headers))?;
    let services = ctx.services()?;

    if let Some(value) = ctx.settings.get("self_registration.enabled")? {
        if value == serde_json::Value::Bool(false) {
            return Err(Error::Forbidden("self-registration is disabled".to_string()));
        }
    }

    let subject = match ctx.subjects.subject_by_email(&body.email)? {
        Some(existing) => {
            if ctx.credentials.get(Cohort::User, &existing.sub)?.is_some() {
                return Err(Error::Conflict("account already registered".to_string()));
            }
            existing
        }
        None => ctx.subjects.create_subject(&body.email, "")?,
    };

    let response = ake::registration_response(
        services.keystore.oprf_seed(),
        services.keystore.ake_key(),
        &subject.sub,
        &body.request,
    )?;
    let server_public_key = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .encode(&response.server_pub_key);
    Ok(Json(json!({
        "message": response,
        "serverPublicKey": server_public_key,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterFinishBody {
    email: String,
    name: String,
    record: RegistrationRecord,
}

async fn register_finish(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Json(body): Json<RegisterFinishBody>,
) -> Result<impl IntoResponse> {
    ctx.rate_limits.check(RouteClass::Auth, &client_ip(&headers))?;
    ctx.services()?;

    ake::validate_record(&body.record.record)?;
    let subject = ctx
        .subjects
        .subject_by_email(&body.email)?
        .ok_or(Error::AuthenticationFailed)?;

    ctx.credentials.register(
        Cohort::User,
        &subject.sub,
        &Credential {
            envelope: body.record.record.clone(),
            server_pub_key: ctx
                .services()?
                .keystore
                .ake_public_key()
                .to_vec(),
            export_key_hash: body.record.export_key_hash.clone(),
        },
    )?;
    if !body.name.is_empty() {
        ctx.subjects.update_subject(&subject.sub, None, Some(&body.name))?;
        // update_subject flips reset on email change only; name-only is safe
    }

    let event = AuditEvent::new("user.register.finish", "POST", "/api/user/opaque/register/finish", "register")
        .cohort(Cohort::User)
        .outcome(200, None);
    ctx.audit.emit(&event);

    Ok(Json(json!({ "sub": subject.sub })))
}

// ── Login ─────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginStartBody {
    email: String,
    request: Ke1,
}

async fn login_start(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Json(body): Json<LoginStartBody>,
) -> Result<impl IntoResponse> {
    ctx.rate_limits.check(RouteClass::Auth, &client_ip(&headers))?;
    let services = ctx.services()?;

    let credential = match ctx.subjects.subject_by_email(&body.email)? {
        Some(subject) => ctx
            .credentials
            .get(Cohort::User, &subject.sub)?
            .map(|credential| (subject, credential)),
        None => None,
    };
    let Some((subject, credential)) = credential else {
        // Unknown account: burn the same OPRF work, answer identically.
        let _ = crate::ake::registration_response(
            services.keystore.oprf_seed(),
            services.keystore.ake_key(),
            "00000000-0000-0000-0000-000000000000",
            &RegistrationRequest {
                blinded: body.request.blinded.clone(),
            },
        );
        return Err(Error::AuthenticationFailed);
    };

    let (ke2, state) = ake::login_start(
        services.keystore.oprf_seed(),
        services.keystore.ake_key(),
        &subject.sub,
        &subject.email,
        &credential.envelope,
        &credential.server_pub_key,
        &body.request,
    )?;
    let session_id = ctx.login_sessions.create(
        Cohort::User,
        &PendingLogin {
            state,
            principal_id: subject.sub,
            email: subject.email,
        },
    )?;

    Ok(Json(json!({ "message": ke2, "sessionId": session_id })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginFinishBody {
    finish: Ke3,
    session_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LoginFinishResponse {
    sub: String,
    otp_required: bool,
    otp_verified: bool,
    password_reset_required: bool,
}

async fn login_finish(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    jar: CookieJar,
    Json(body): Json<LoginFinishBody>,
) -> Result<impl IntoResponse> {
    let ip = client_ip(&headers);
    ctx.rate_limits.check(RouteClass::Auth, &ip)?;
    let services = ctx.services()?;

    let pending = ctx
        .login_sessions
        .take(Cohort::User, &body.session_id)?
        .ok_or(Error::AuthenticationFailed)?;
    ake::login_finish(&pending.state, &body.finish)?;

    let subject = ctx
        .subjects
        .subject_by_id(&pending.principal_id)?
        .ok_or(Error::AuthenticationFailed)?;

    let otp_required = services.totp.is_enabled(Cohort::User, &subject.sub)?;
    let issued = ctx.sessions.create(
        &NewSession {
            cohort: Cohort::User,
            principal_id: subject.sub.clone(),
            client_id: None,
            idle_secs: ctx.config.sessions.idle_timeout_secs,
            absolute_secs: ctx.config.sessions.user_absolute_secs,
            otp_verified: otp_required.then_some(false),
            org_id: None,
            chain_id: None,
        },
        false,
    )?;

    let mut event = AuditEvent::new("user.login.finish", "POST", "/api/user/opaque/login/finish", "login")
        .cohort(Cohort::User)
        .outcome(200, None);
    event.subject_id = Some(subject.sub.clone());
    event.ip_address = Some(ip);
    ctx.audit.emit(&event);

    let jar = cookies::add_session_cookies(
        jar,
        Cohort::User,
        &issued.session.session_id,
        &issued.session.csrf_token,
        !ctx.config.server.development,
    );
    Ok((
        jar,
        Json(LoginFinishResponse {
            sub: subject.sub,
            otp_required,
            otp_verified: false,
            password_reset_required: subject.password_reset_required,
        }),
    ))
}

// ── Session ───────────────────────────────────────────────────────────────

async fn session_info(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    jar: CookieJar,
) -> Result<impl IntoResponse> {
    let session = require_session(&ctx, &jar, &headers, Cohort::User, CsrfCheck::Skip)?;
    let subject = ctx
        .subjects
        .subject_by_id(&session.principal_id)?
        .ok_or(Error::Unauthorized)?;
    Ok(Json(json!({
        "sub": subject.sub,
        "email": subject.email,
        "name": subject.name,
        "otpVerified": session.otp_verified,
        "orgId": session.org_id,
        "passwordResetRequired": subject.password_reset_required,
    })))
}

async fn logout(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    jar: CookieJar,
) -> Result<impl IntoResponse> {
    let session = require_session(&ctx, &jar, &headers, Cohort::User, CsrfCheck::Enforce)?;
    ctx.sessions.delete(&session.session_id)?;

    let event = AuditEvent::new("user.logout", "POST", "/api/user/logout", "logout")
        .cohort(Cohort::User)
        .outcome(200, None);
    ctx.audit.emit(&event);

    let jar = cookies::clear_session_cookies(jar, Cohort::User);
    Ok((jar, Json(json!({ "ok": true }))))
}

// ── Authorization finalize ────────────────────────────────────────────────

async fn authorize_finalize(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    jar: CookieJar,
    Json(params): Json<FinalizeParams>,
) -> Result<impl IntoResponse> {
    let session = require_session(&ctx, &jar, &headers, Cohort::User, CsrfCheck::Enforce)?;
    let services = ctx.services()?;

    // A principal with OTP enabled must verify before leaving the OTP
    // endpoints; finalize mints codes, so it is gated.
    if session.otp_verified == Some(false) {
        return Err(Error::OtpRequired);
    }
    let otp_verified = session.otp_verified == Some(true);

    let redirect = services
        .oidc
        .finalize(&session.principal_id, otp_verified, &params)?;

    let mut event = AuditEvent::new(
        "user.authorize.finalize",
        "POST",
        "/api/user/authorize/finalize",
        "finalize",
    )
    .cohort(Cohort::User)
    .outcome(200, None);
    event.subject_id = Some(session.principal_id.clone());
    event.resource_type = Some("auth_request".to_string());
    event.resource_id = Some(params.auth_request_id.clone());
    ctx.audit.emit(&event);

    Ok(Json(json!({ "redirectUri": redirect })))
}

// ── OTP ───────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct OtpCodeBody {
    code: String,
}

async fn otp_status(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    jar: CookieJar,
) -> Result<impl IntoResponse> {
    let session = require_session(&ctx, &jar, &headers, Cohort::User, CsrfCheck::Skip)?;
    let services = ctx.services()?;
    Ok(Json(services.totp.status(Cohort::User, &session.principal_id)?))
}

async fn otp_setup_init(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    jar: CookieJar,
) -> Result<impl IntoResponse> {
    let session = require_session(&ctx, &jar, &headers, Cohort::User, CsrfCheck::Enforce)?;
    let services = ctx.services()?;
    let subject = ctx
        .subjects
        .subject_by_id(&session.principal_id)?
        .ok_or(Error::Unauthorized)?;

    let (secret, provisioning_uri) =
        services
            .totp
            .setup_init(Cohort::User, &subject.sub, &subject.email)?;
    Ok(Json(json!({
        "secret": secret,
        "provisioning_uri": provisioning_uri,
    })))
}

async fn otp_setup_verify(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    jar: CookieJar,
    Json(body): Json<OtpCodeBody>,
) -> Result<impl IntoResponse> {
    let session = require_session(&ctx, &jar, &headers, Cohort::User, CsrfCheck::Enforce)?;
    ctx.rate_limits.check(
        RouteClass::Otp,
        &format!("{}:{}", client_ip(&headers), session.principal_id),
    )?;
    let services = ctx.services()?;
    let subject = ctx
        .subjects
        .subject_by_id(&session.principal_id)?
        .ok_or(Error::Unauthorized)?;

    let backup_codes =
        services
            .totp
            .setup_verify(Cohort::User, &subject.sub, &subject.email, &body.code)?;
    ctx.sessions.set_otp_verified(&session.session_id)?;

    let event = AuditEvent::new("user.otp.enable", "POST", "/api/user/otp/setup/verify", "enable")
        .cohort(Cohort::User)
        .outcome(200, None);
    ctx.audit.emit(&event);

    Ok(Json(json!({ "backupCodes": backup_codes })))
}

async fn otp_verify(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    jar: CookieJar,
    Json(body): Json<OtpCodeBody>,
) -> Result<impl IntoResponse> {
    let session = require_session(&ctx, &jar, &headers, Cohort::User, CsrfCheck::Enforce)?;
    ctx.rate_limits.check(
        RouteClass::Otp,
        &format!("{}:{}", client_ip(&headers), session.principal_id),
    )?;
    let services = ctx.services()?;
    let subject = ctx
        .subjects
        .subject_by_id(&session.principal_id)?
        .ok_or(Error::Unauthorized)?;

    services
        .totp
        .verify(Cohort::User, &subject.sub, &subject.email, &body.code)?;
    ctx.sessions.set_otp_verified(&session.session_id)?;

    Ok(Json(json!({ "otpVerified": true })))
}

// ── Password change ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChangeStartBody {
    request: RegistrationRequest,
}

async fn password_change_start(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    jar: CookieJar,
    Json(body): Json<ChangeStartBody>,
) -> Result<impl IntoResponse> {
    let session = require_session(&ctx, &jar, &headers, Cohort::User, CsrfCheck::Enforce)?;
    if session.otp_verified == Some(false) {
        return Err(Error::OtpRequired);
    }
    let services = ctx.services()?;

    let response = ake::registration_response(
        services.keystore.oprf_seed(),
        services.keystore.ake_key(),
        &session.principal_id,
        &body.request,
    )?;
    let server_public_key = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .encode(&response.server_pub_key);
    Ok(Json(json!({
        "message": response,
        "serverPublicKey": server_public_key,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChangeFinishBody {
    record: RegistrationRecord,
}

async fn password_change_finish(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    jar: CookieJar,
    Json(body): Json<ChangeFinishBody>,
) -> Result<impl IntoResponse> {
    let session = require_session(&ctx, &jar, &headers, Cohort::User, CsrfCheck::Enforce)?;
    if session.otp_verified == Some(false) {
        return Err(Error::OtpRequired);
    }
    let services = ctx.services()?;

    ake::validate_record(&body.record.record)?;
    let result = ctx.credentials.replace(
        Cohort::User,
        &session.principal_id,
        &Credential {
            envelope: body.record.record.clone(),
            server_pub_key: services.keystore.ake_public_key().to_vec(),
            export_key_hash: body.record.export_key_hash.clone(),
        },
    );

    let mut event = AuditEvent::new(
        "user.password.change",
        "POST",
        "/api/user/password/change/finish",
        "change",
    )
    .cohort(Cohort::User);
    event.subject_id = Some(session.principal_id.clone());
    let event = match &result {
        Ok(()) => event.outcome(200, None),
        Err(e) => event.outcome(e.status().as_u16(), Some(e.code())),
    };
    ctx.audit.emit(&event);
    result?;

    ctx.subjects
        .set_password_reset_required(&session.principal_id, false)?;
    Ok(Json(json!({ "ok": true })))
}
