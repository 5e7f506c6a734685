//! Admin-cohort endpoints under `/api/admin`.
//!
//! Everything here requires an admin session from the admin cookie pair;
//! state-changing routes additionally require the CSRF echo, a `write`
//! admin role, and — once the admin has OTP enabled — a verified OTP on the
//! session. Until OTP is verified the session can reach only the OTP
//! endpoints and session introspection.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use axum_extra::extract::cookie::CookieJar;
use base64::Engine;
use serde::Deserialize;
use serde_json::json;

use crate::ake::{self, Ke1, Ke3, RegistrationRecord, RegistrationRequest};
use crate::audit::{AuditEvent, AuditQuery};
use crate::keystore::signing;
use crate::store::clients::ClientUpsert;
use crate::store::credentials::Credential;
use crate::store::login_sessions::PendingLogin;
use crate::store::sessions::{NewSession, Session};
use crate::store::subjects::{AdminRole, AdminUser};
use crate::store::Cohort;
use crate::{Error, Result};

use super::rate_limit::RouteClass;
use super::{client_ip, cookies, require_session, AppContext, CsrfCheck};

/// Route table for the admin cohort.
pub fn routes() -> Router<Arc<AppContext>> {
    Router::new()
        // Session
        .route("/api/admin/opaque/login/start", post(login_start))
        .route("/api/admin/opaque/login/finish", post(login_finish))
        .route("/api/admin/session", get(session_info))
        .route("/api/admin/logout", post(logout))
        // OTP
        .route("/api/admin/otp/status", get(otp_status))
        .route("/api/admin/otp/setup/init", post(otp_setup_init))
        .route("/api/admin/otp/setup/verify", post(otp_setup_verify))
        .route("/api/admin/otp/verify", post(otp_verify))
        // Admin principals
        .route("/api/admin/admin-users", get(list_admins).post(create_admin))
        .route("/api/admin/admin-users/{id}", delete(delete_admin))
        .route(
            "/api/admin/admin-users/{id}/password/set/start",
            post(admin_password_set_start),
        )
        .route(
            "/api/admin/admin-users/{id}/password/set/finish",
            post(admin_password_set_finish),
        )
        // Users
        .route("/api/admin/users", get(list_users).post(create_user))
        .route(
            "/api/admin/users/{sub}",
            get(get_user).put(update_user).delete(delete_user),
        )
        .route(
            "/api/admin/users/{sub}/password/set/start",
            post(user_password_set_start),
        )
        .route(
            "/api/admin/users/{sub}/password/set/finish",
            post(user_password_set_finish),
        )
        // Clients
        .route("/api/admin/clients", get(list_clients).post(create_client))
        .route(
            "/api/admin/clients/{id}",
            put(update_client).delete(delete_client),
        )
        // RBAC
        .route("/api/admin/roles", get(list_roles).post(create_role))
        .route(
            "/api/admin/permissions",
            get(list_permissions).post(create_permission),
        )
        .route("/api/admin/roles/{id}/permissions", post(grant_permission))
        .route(
            "/api/admin/organizations",
            get(list_orgs).post(create_org),
        )
        .route("/api/admin/organizations/{id}", delete(delete_org))
        .route(
            "/api/admin/organizations/{id}/members",
            get(list_members).post(upsert_member),
        )
        .route(
            "/api/admin/organizations/{id}/members/{sub}",
            delete(delete_member),
        )
        .route(
            "/api/admin/organizations/{id}/members/{sub}/roles",
            post(assign_member_role),
        )
        // Keys
        .route("/api/admin/jwks", get(list_jwks))
        .route("/api/admin/jwks/rotate", post(rotate_jwks))
        .route("/api/admin/jwks/{kid}", delete(purge_jwk))
        // Audit
        .route("/api/admin/audit-logs", get(list_audit))
        .route("/api/admin/audit-logs/export", get(export_audit))
        .route("/api/admin/audit-logs/{id}", get(get_audit))
        // Settings
        .route("/api/admin/settings", get(list_settings).put(put_setting))
}

// ── Authorization helpers ─────────────────────────────────────────────────

/// Resolve an admin session; enforce CSRF, OTP gating and role.
fn require_admin(
    ctx: &AppContext,
    jar: &CookieJar,
    headers: &HeaderMap,
    csrf: CsrfCheck,
    write: bool,
) -> Result<(Session, AdminUser)> {
    let session = require_session(ctx, jar, headers, Cohort::Admin, csrf)?;
    let admin = ctx
        .subjects
        .admin_by_id(&session.principal_id)?
        .ok_or(Error::Unauthorized)?;

    // OTP-enabled admins are boxed into OTP + introspection until verified.
    if session.otp_verified == Some(false) {
        return Err(Error::OtpRequired);
    }
    if write && admin.role != AdminRole::Write {
        return Err(Error::Forbidden("write role required".to_string()));
    }
    Ok((session, admin))
}

fn audit_write(
    ctx: &AppContext,
    admin: &AdminUser,
    event_type: &str,
    path: &str,
    action: &str,
    resource_type: &str,
    resource_id: &str,
) {
    let mut event = AuditEvent::new(event_type, "POST", path, action)
        .cohort(Cohort::Admin)
        .outcome(200, None);
    event.admin_id = Some(admin.admin_id.clone());
    event.resource_type = Some(resource_type.to_string());
    event.resource_id = Some(resource_id.to_string());
    ctx.audit.emit(&event);
}

// ── OPAQUE login ──────────────────────────────────────────────────────────

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

    let found = match ctx.subjects.admin_by_email(&body.email)? {
        Some(admin) => ctx
            .credentials
            .get(Cohort::Admin, &admin.admin_id)?
            .map(|credential| (admin, credential)),
        None => None,
    };
    let Some((admin, credential)) = found else {
        let _ = ake::registration_response(
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
        &admin.admin_id,
        &admin.email,
        &credential.envelope,
        &credential.server_pub_key,
        &body.request,
    )?;
    let session_id = ctx.login_sessions.create(
        Cohort::Admin,
        &PendingLogin {
            state,
            principal_id: admin.admin_id,
            email: admin.email,
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
        .take(Cohort::Admin, &body.session_id)?
        .ok_or(Error::AuthenticationFailed)?;
    ake::login_finish(&pending.state, &body.finish)?;

    let admin = ctx
        .subjects
        .admin_by_id(&pending.principal_id)?
        .ok_or(Error::AuthenticationFailed)?;

    let otp_required = services.totp.is_enabled(Cohort::Admin, &admin.admin_id)?;
    let issued = ctx.sessions.create(
        &NewSession {
            cohort: Cohort::Admin,
            principal_id: admin.admin_id.clone(),
            client_id: None,
            idle_secs: ctx.config.sessions.idle_timeout_secs,
            absolute_secs: ctx.config.sessions.admin_absolute_secs,
            otp_verified: otp_required.then_some(false),
            org_id: None,
            chain_id: None,
        },
        false,
    )?;

    let mut event = AuditEvent::new("admin.login.finish", "POST", "/api/admin/opaque/login/finish", "login")
        .cohort(Cohort::Admin)
        .outcome(200, None);
    event.admin_id = Some(admin.admin_id.clone());
    event.ip_address = Some(ip);
    ctx.audit.emit(&event);

    let jar = cookies::add_session_cookies(
        jar,
        Cohort::Admin,
        &issued.session.session_id,
        &issued.session.csrf_token,
        !ctx.config.server.development,
    );
    Ok((
        jar,
        Json(json!({
            "adminId": admin.admin_id,
            "role": admin.role,
            "otpRequired": otp_required,
            "otpVerified": false,
            "passwordResetRequired": admin.password_reset_required,
        })),
    ))
}

async fn session_info(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    jar: CookieJar,
) -> Result<impl IntoResponse> {
    // Introspection stays reachable while OTP is pending.
    let session = require_session(&ctx, &jar, &headers, Cohort::Admin, CsrfCheck::Skip)?;
    let admin = ctx
        .subjects
        .admin_by_id(&session.principal_id)?
        .ok_or(Error::Unauthorized)?;
    Ok(Json(json!({
        "adminId": admin.admin_id,
        "email": admin.email,
        "name": admin.name,
        "role": admin.role,
        "otpVerified": session.otp_verified,
        "passwordResetRequired": admin.password_reset_required,
    })))
}

async fn logout(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    jar: CookieJar,
) -> Result<impl IntoResponse> {
    let session = require_session(&ctx, &jar, &headers, Cohort::Admin, CsrfCheck::Enforce)?;
    ctx.sessions.delete(&session.session_id)?;
    let jar = cookies::clear_session_cookies(jar, Cohort::Admin);
    Ok((jar, Json(json!({ "ok": true }))))
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
    let session = require_session(&ctx, &jar, &headers, Cohort::Admin, CsrfCheck::Skip)?;
    let services = ctx.services()?;
    Ok(Json(services.totp.status(Cohort::Admin, &session.principal_id)?))
}

async fn otp_setup_init(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    jar: CookieJar,
) -> Result<impl IntoResponse> {
    let session = require_session(&ctx, &jar, &headers, Cohort::Admin, CsrfCheck::Enforce)?;
    let services = ctx.services()?;
    let admin = ctx
        .subjects
        .admin_by_id(&session.principal_id)?
        .ok_or(Error::Unauthorized)?;
    let (secret, provisioning_uri) =
        services
            .totp
            .setup_init(Cohort::Admin, &admin.admin_id, &admin.email)?;
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
    let session = require_session(&ctx, &jar, &headers, Cohort::Admin, CsrfCheck::Enforce)?;
    ctx.rate_limits.check(
        RouteClass::Otp,
        &format!("{}:{}", client_ip(&headers), session.principal_id),
    )?;
    let services = ctx.services()?;
    let admin = ctx
        .subjects
        .admin_by_id(&session.principal_id)?
        .ok_or(Error::Unauthorized)?;
    let backup_codes =
        services
            .totp
            .setup_verify(Cohort::Admin, &admin.admin_id, &admin.email, &body.code)?;
    ctx.sessions.set_otp_verified(&session.session_id)?;
    Ok(Json(json!({ "backupCodes": backup_codes })))
}

async fn otp_verify(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    jar: CookieJar,
    Json(body): Json<OtpCodeBody>,
) -> Result<impl IntoResponse> {
    let session = require_session(&ctx, &jar, &headers, Cohort::Admin, CsrfCheck::Enforce)?;
    ctx.rate_limits.check(
        RouteClass::Otp,
        &format!("{}:{}", client_ip(&headers), session.principal_id),
    )?;
    let services = ctx.services()?;
    let admin = ctx
        .subjects
        .admin_by_id(&session.principal_id)?
        .ok_or(Error::Unauthorized)?;
    services
        .totp
        .verify(Cohort::Admin, &admin.admin_id, &admin.email, &body.code)?;
    ctx.sessions.set_otp_verified(&session.session_id)?;
    Ok(Json(json!({ "otpVerified": true })))
}

// ── Admin principals ──────────────────────────────────────────────────────

async fn list_admins(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    jar: CookieJar,
) -> Result<impl IntoResponse> {
    require_admin(&ctx, &jar, &headers, CsrfCheck::Skip, false)?;
    Ok(Json(ctx.subjects.list_admins()?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateAdminBody {
    email: String,
    name: String,
    role: String,
}

async fn create_admin(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    jar: CookieJar,
    Json(body): Json<CreateAdminBody>,
) -> Result<impl IntoResponse> {
    let (_, actor) = require_admin(&ctx, &jar, &headers, CsrfCheck::Enforce, true)?;
    let role = match body.role.as_str() {
        "read" => AdminRole::Read,
        "write" => AdminRole::Write,
        other => return Err(Error::validation(format!("unknown role {other}"))),
    };
    let created = ctx.subjects.create_admin(&body.email, &body.name, role)?;
    audit_write(
        &ctx,
        &actor,
        "admin.admin_user.create",
        "/api/admin/admin-users",
        "create",
        "admin_user",
        &created.admin_id,
    );
    Ok(Json(created))
}

async fn delete_admin(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    jar: CookieJar,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let (session, actor) = require_admin(&ctx, &jar, &headers, CsrfCheck::Enforce, true)?;
    if session.principal_id == id {
        return Err(Error::Conflict("cannot delete your own admin account".to_string()));
    }
    ctx.subjects.delete_admin(&id)?;
    ctx.sessions.delete_for_principal(Cohort::Admin, &id)?;
    audit_write(
        &ctx,
        &actor,
        "admin.admin_user.delete",
        "/api/admin/admin-users",
        "delete",
        "admin_user",
        &id,
    );
    Ok(Json(json!({ "ok": true })))
}

// ── Users ─────────────────────────────────────────────────────────────────

async fn list_users(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    jar: CookieJar,
) -> Result<impl IntoResponse> {
    require_admin(&ctx, &jar, &headers, CsrfCheck::Skip, false)?;
    Ok(Json(ctx.subjects.list_subjects()?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateUserBody {
    email: String,
    name: String,
}

async fn create_user(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    jar: CookieJar,
    Json(body): Json<CreateUserBody>,
) -> Result<impl IntoResponse> {
    let (_, actor) = require_admin(&ctx, &jar, &headers, CsrfCheck::Enforce, true)?;
    let created = ctx.subjects.create_subject(&body.email, &body.name)?;
    audit_write(
        &ctx,
        &actor,
        "admin.user.create",
        "/api/admin/users",
        "create",
        "subject",
        &created.sub,
    );
    Ok(Json(created))
}

async fn get_user(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    jar: CookieJar,
    Path(sub): Path<String>,
) -> Result<impl IntoResponse> {
    require_admin(&ctx, &jar, &headers, CsrfCheck::Skip, false)?;
    let subject = ctx
        .subjects
        .subject_by_id(&sub)?
        .ok_or_else(|| Error::not_found(format!("subject {sub}")))?;
    Ok(Json(subject))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateUserBody {
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

async fn update_user(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    jar: CookieJar,
    Path(sub): Path<String>,
    Json(body): Json<UpdateUserBody>,
) -> Result<impl IntoResponse> {
    let (_, actor) = require_admin(&ctx, &jar, &headers, CsrfCheck::Enforce, true)?;
    let updated = ctx
        .subjects
        .update_subject(&sub, body.email.as_deref(), body.name.as_deref())?;
    audit_write(
        &ctx,
        &actor,
        "admin.user.update",
        "/api/admin/users",
        "update",
        "subject",
        &sub,
    );
    Ok(Json(updated))
}

async fn delete_user(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    jar: CookieJar,
    Path(sub): Path<String>,
) -> Result<impl IntoResponse> {
    let (_, actor) = require_admin(&ctx, &jar, &headers, CsrfCheck::Enforce, true)?;
    ctx.subjects.delete_subject(&sub)?;
    ctx.sessions.delete_for_principal(Cohort::User, &sub)?;
    audit_write(
        &ctx,
        &actor,
        "admin.user.delete",
        "/api/admin/users",
        "delete",
        "subject",
        &sub,
    );
    Ok(Json(json!({ "ok": true })))
}

// ── Password set (admin-driven registration) ──────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PasswordSetStartBody {
    request: RegistrationRequest,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PasswordSetFinishBody {
    record: RegistrationRecord,
}

async fn user_password_set_start(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    jar: CookieJar,
    Path(sub): Path<String>,
    Json(body): Json<PasswordSetStartBody>,
) -> Result<impl IntoResponse> {
    require_admin(&ctx, &jar, &headers, CsrfCheck::Enforce, true)?;
    let services = ctx.services()?;
    ctx.subjects
        .subject_by_id(&sub)?
        .ok_or_else(|| Error::not_found(format!("subject {sub}")))?;

    let response = ake::registration_response(
        services.keystore.oprf_seed(),
        services.keystore.ake_key(),
        &sub,
        &body.request,
    )?;
    let server_public_key = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .encode(&response.server_pub_key);
    Ok(Json(json!({ "message": response, "serverPublicKey": server_public_key })))
}

async fn user_password_set_finish(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    jar: CookieJar,
    Path(sub): Path<String>,
    Json(body): Json<PasswordSetFinishBody>,
) -> Result<impl IntoResponse> {
    let (_, actor) = require_admin(&ctx, &jar, &headers, CsrfCheck::Enforce, true)?;
    let services = ctx.services()?;
    ake::validate_record(&body.record.record)?;

    ctx.credentials.force_set(
        Cohort::User,
        &sub,
        &Credential {
            envelope: body.record.record.clone(),
            server_pub_key: services.keystore.ake_public_key().to_vec(),
            export_key_hash: body.record.export_key_hash.clone(),
        },
    )?;
    // The principal must change this password on next login.
    ctx.subjects.set_password_reset_required(&sub, true)?;
    ctx.sessions.delete_for_principal(Cohort::User, &sub)?;
    audit_write(
        &ctx,
        &actor,
        "admin.user.password_set",
        "/api/admin/users",
        "password_set",
        "subject",
        &sub,
    );
    Ok(Json(json!({ "ok": true })))
}

async fn admin_password_set_start(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    jar: CookieJar,
    Path(id): Path<String>,
    Json(body): Json<PasswordSetStartBody>,
) -> Result<impl IntoResponse> {
    require_admin(&ctx, &jar, &headers, CsrfCheck::Enforce, true)?;
    let services = ctx.services()?;
    ctx.subjects
        .admin_by_id(&id)?
        .ok_or_else(|| Error::not_found(format!("admin {id}")))?;

    let response = ake::registration_response(
        services.keystore.oprf_seed(),
        services.keystore.ake_key(),
        &id,
        &body.request,
    )?;
    let server_public_key = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .encode(&response.server_pub_key);
    Ok(Json(json!({ "message": response, "serverPublicKey": server_public_key })))
}

async fn admin_password_set_finish(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    jar: CookieJar,
    Path(id): Path<String>,
    Json(body): Json<PasswordSetFinishBody>,
) -> Result<impl IntoResponse> {
    let (_, actor) = require_admin(&ctx, &jar, &headers, CsrfCheck::Enforce, true)?;
    let services = ctx.services()?;
    ake::validate_record(&body.record.record)?;

    ctx.credentials.force_set(
        Cohort::Admin,
        &id,
        &Credential {
            envelope: body.record.record.clone(),
            server_pub_key: services.keystore.ake_public_key().to_vec(),
            export_key_hash: body.record.export_key_hash.clone(),
        },
    )?;
    ctx.subjects.set_admin_password_reset_required(&id, true)?;
    ctx.sessions.delete_for_principal(Cohort::Admin, &id)?;
    audit_write(
        &ctx,
        &actor,
        "admin.admin_user.password_set",
        "/api/admin/admin-users",
        "password_set",
        "admin_user",
        &id,
    );
    Ok(Json(json!({ "ok": true })))
}

// ── Clients ───────────────────────────────────────────────────────────────

async fn list_clients(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    jar: CookieJar,
) -> Result<impl IntoResponse> {
    require_admin(&ctx, &jar, &headers, CsrfCheck::Skip, false)?;
    Ok(Json(ctx.clients.list()?))
}

async fn create_client(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    jar: CookieJar,
    Json(body): Json<ClientUpsert>,
) -> Result<impl IntoResponse> {
    let (_, actor) = require_admin(&ctx, &jar, &headers, CsrfCheck::Enforce, true)?;
    let created = ctx.clients.create(&body)?;
    audit_write(
        &ctx,
        &actor,
        "admin.client.create",
        "/api/admin/clients",
        "create",
        "client",
        &created.client_id,
    );
    Ok(Json(created))
}

async fn update_client(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    jar: CookieJar,
    Path(id): Path<String>,
    Json(mut body): Json<ClientUpsert>,
) -> Result<impl IntoResponse> {
    let (_, actor) = require_admin(&ctx, &jar, &headers, CsrfCheck::Enforce, true)?;
    body.client_id = id.clone();
    let updated = ctx.clients.update(&body)?;
    audit_write(
        &ctx,
        &actor,
        "admin.client.update",
        "/api/admin/clients",
        "update",
        "client",
        &id,
    );
    Ok(Json(updated))
}

async fn delete_client(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    jar: CookieJar,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let (_, actor) = require_admin(&ctx, &jar, &headers, CsrfCheck::Enforce, true)?;
    ctx.clients.delete(&id)?;
    audit_write(
        &ctx,
        &actor,
        "admin.client.delete",
        "/api/admin/clients",
        "delete",
        "client",
        &id,
    );
    Ok(Json(json!({ "ok": true })))
}

// ── RBAC ──────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct NameBody {
    name: String,
}

async fn list_roles(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    jar: CookieJar,
) -> Result<impl IntoResponse> {
    require_admin(&ctx, &jar, &headers, CsrfCheck::Skip, false)?;
    let roles: Vec<_> = ctx
        .rbac
        .list_roles()?
        .into_iter()
        .map(|(role_id, name)| json!({ "roleId": role_id, "name": name }))
        .collect();
    Ok(Json(roles))
}

async fn create_role(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    jar: CookieJar,
    Json(body): Json<NameBody>,
) -> Result<impl IntoResponse> {
    let (_, actor) = require_admin(&ctx, &jar, &headers, CsrfCheck::Enforce, true)?;
    let role_id = ctx.rbac.create_role(&body.name)?;
    audit_write(&ctx, &actor, "admin.role.create", "/api/admin/roles", "create", "role", &role_id);
    Ok(Json(json!({ "roleId": role_id, "name": body.name })))
}

async fn list_permissions(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    jar: CookieJar,
) -> Result<impl IntoResponse> {
    require_admin(&ctx, &jar, &headers, CsrfCheck::Skip, false)?;
    let permissions: Vec<_> = ctx
        .rbac
        .list_permissions()?
        .into_iter()
        .map(|(permission_id, name)| json!({ "permissionId": permission_id, "name": name }))
        .collect();
    Ok(Json(permissions))
}

async fn create_permission(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    jar: CookieJar,
    Json(body): Json<NameBody>,
) -> Result<impl IntoResponse> {
    let (_, actor) = require_admin(&ctx, &jar, &headers, CsrfCheck::Enforce, true)?;
    let permission_id = ctx.rbac.create_permission(&body.name)?;
    audit_write(
        &ctx,
        &actor,
        "admin.permission.create",
        "/api/admin/permissions",
        "create",
        "permission",
        &permission_id,
    );
    Ok(Json(json!({ "permissionId": permission_id, "name": body.name })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GrantBody {
    permission_id: String,
}

async fn grant_permission(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    jar: CookieJar,
    Path(role_id): Path<String>,
    Json(body): Json<GrantBody>,
) -> Result<impl IntoResponse> {
    let (_, actor) = require_admin(&ctx, &jar, &headers, CsrfCheck::Enforce, true)?;
    ctx.rbac.grant_permission(&role_id, &body.permission_id)?;
    audit_write(&ctx, &actor, "admin.role.grant", "/api/admin/roles", "grant", "role", &role_id);
    Ok(Json(json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateOrgBody {
    slug: String,
    name: String,
    #[serde(default)]
    require_otp: bool,
}

async fn list_orgs(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    jar: CookieJar,
) -> Result<impl IntoResponse> {
    require_admin(&ctx, &jar, &headers, CsrfCheck::Skip, false)?;
    Ok(Json(ctx.rbac.list_orgs()?))
}

async fn create_org(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    jar: CookieJar,
    Json(body): Json<CreateOrgBody>,
) -> Result<impl IntoResponse> {
    let (_, actor) = require_admin(&ctx, &jar, &headers, CsrfCheck::Enforce, true)?;
    let org = ctx.rbac.create_org(&body.slug, &body.name, body.require_otp)?;
    audit_write(
        &ctx,
        &actor,
        "admin.org.create",
        "/api/admin/organizations",
        "create",
        "organization",
        &org.org_id,
    );
    Ok(Json(org))
}

async fn delete_org(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    jar: CookieJar,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let (_, actor) = require_admin(&ctx, &jar, &headers, CsrfCheck::Enforce, true)?;
    ctx.rbac.delete_org(&id)?;
    audit_write(
        &ctx,
        &actor,
        "admin.org.delete",
        "/api/admin/organizations",
        "delete",
        "organization",
        &id,
    );
    Ok(Json(json!({ "ok": true })))
}

async fn list_members(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    jar: CookieJar,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    require_admin(&ctx, &jar, &headers, CsrfCheck::Skip, false)?;
    Ok(Json(ctx.rbac.org_members(&id)?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MemberBody {
    sub: String,
    #[serde(default = "default_member_status")]
    status: String,
}

fn default_member_status() -> String {
    "active".to_string()
}

async fn upsert_member(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    jar: CookieJar,
    Path(id): Path<String>,
    Json(body): Json<MemberBody>,
) -> Result<impl IntoResponse> {
    let (_, actor) = require_admin(&ctx, &jar, &headers, CsrfCheck::Enforce, true)?;
    ctx.rbac.upsert_membership(&id, &body.sub, &body.status)?;
    audit_write(
        &ctx,
        &actor,
        "admin.membership.upsert",
        "/api/admin/organizations",
        "upsert",
        "membership",
        &format!("{id}:{}", body.sub),
    );
    Ok(Json(json!({ "ok": true })))
}

async fn delete_member(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    jar: CookieJar,
    Path((id, sub)): Path<(String, String)>,
) -> Result<impl IntoResponse> {
    let (_, actor) = require_admin(&ctx, &jar, &headers, CsrfCheck::Enforce, true)?;
    ctx.rbac.delete_membership(&id, &sub)?;
    audit_write(
        &ctx,
        &actor,
        "admin.membership.delete",
        "/api/admin/organizations",
        "delete",
        "membership",
        &format!("{id}:{sub}"),
    );
    Ok(Json(json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AssignRoleBody {
    role_id: String,
}

async fn assign_member_role(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    jar: CookieJar,
    Path((id, sub)): Path<(String, String)>,
    Json(body): Json<AssignRoleBody>,
) -> Result<impl IntoResponse> {
    let (_, actor) = require_admin(&ctx, &jar, &headers, CsrfCheck::Enforce, true)?;
    ctx.rbac.assign_role(&id, &sub, &body.role_id)?;
    audit_write(
        &ctx,
        &actor,
        "admin.membership.role",
        "/api/admin/organizations",
        "assign_role",
        "membership",
        &format!("{id}:{sub}"),
    );
    Ok(Json(json!({ "ok": true })))
}

// ── Signing keys ──────────────────────────────────────────────────────────

async fn list_jwks(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    jar: CookieJar,
) -> Result<impl IntoResponse> {
    require_admin(&ctx, &jar, &headers, CsrfCheck::Skip, false)?;
    let services = ctx.services()?;
    let document = services.keystore.publish_jwks()?;
    Ok(Json(json!({
        "keys": document.keys,
        "activeKid": document.active_kid,
    })))
}

async fn rotate_jwks(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    jar: CookieJar,
) -> Result<impl IntoResponse> {
    let (_, actor) = require_admin(&ctx, &jar, &headers, CsrfCheck::Enforce, true)?;
    let services = ctx.services()?;
    let kid = services.keystore.rotate_signing_key()?;
    audit_write(&ctx, &actor, "admin.jwks.rotate", "/api/admin/jwks/rotate", "rotate", "signing_key", &kid);
    Ok(Json(json!({ "activeKid": kid })))
}

async fn purge_jwk(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    jar: CookieJar,
    Path(kid): Path<String>,
) -> Result<impl IntoResponse> {
    let (_, actor) = require_admin(&ctx, &jar, &headers, CsrfCheck::Enforce, true)?;
    signing::purge(&ctx.db, &kid)?;
    audit_write(&ctx, &actor, "admin.jwks.purge", "/api/admin/jwks", "purge", "signing_key", &kid);
    Ok(Json(json!({ "ok": true })))
}

// ── Audit logs ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct AuditListQuery {
    #[serde(default)]
    cohort: Option<String>,
    #[serde(default)]
    event_prefix: Option<String>,
    #[serde(default)]
    since: Option<i64>,
    #[serde(default)]
    limit: Option<i64>,
}

impl From<AuditListQuery> for AuditQuery {
    fn from(q: AuditListQuery) -> Self {
        Self {
            cohort: q.cohort,
            event_prefix: q.event_prefix,
            since: q.since,
            limit: q.limit,
        }
    }
}

async fn list_audit(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    jar: CookieJar,
    Query(query): Query<AuditListQuery>,
) -> Result<impl IntoResponse> {
    require_admin(&ctx, &jar, &headers, CsrfCheck::Skip, false)?;
    Ok(Json(ctx.audit.list(&query.into())?))
}

async fn get_audit(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    jar: CookieJar,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse> {
    require_admin(&ctx, &jar, &headers, CsrfCheck::Skip, false)?;
    let record = ctx
        .audit
        .get(id)?
        .ok_or_else(|| Error::not_found(format!("audit record {id}")))?;
    Ok(Json(record))
}

async fn export_audit(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    jar: CookieJar,
    Query(query): Query<AuditListQuery>,
) -> Result<impl IntoResponse> {
    require_admin(&ctx, &jar, &headers, CsrfCheck::Skip, false)?;
    let mut query: AuditQuery = query.into();
    query.limit = Some(1000);
    let records = ctx.audit.list(&query)?;
    Ok((
        [(
            axum::http::header::CONTENT_DISPOSITION,
            "attachment; filename=\"audit-logs.json\"",
        )],
        Json(records),
    ))
}

// ── Settings ──────────────────────────────────────────────────────────────

async fn list_settings(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    jar: CookieJar,
) -> Result<impl IntoResponse> {
    require_admin(&ctx, &jar, &headers, CsrfCheck::Skip, false)?;
    let settings: Vec<_> = ctx
        .settings
        .list()?
        .into_iter()
        .map(|(key, value)| json!({ "key": key, "value": value }))
        .collect();
    Ok(Json(settings))
}

#[derive(Debug, Deserialize)]
struct PutSettingBody {
    key: String,
    value: serde_json::Value,
}

async fn put_setting(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    jar: CookieJar,
    Json(body): Json<PutSettingBody>,
) -> Result<impl IntoResponse> {
    let (_, actor) = require_admin(&ctx, &jar, &headers, CsrfCheck::Enforce, true)?;
    ctx.settings.put(&body.key, &body.value)?;
    audit_write(&ctx, &actor, "admin.setting.put", "/api/admin/settings", "put", "setting", &body.key);
    Ok(Json(json!({ "ok": true })))
}
