//! HTTP adapter — router composition, context, security middleware.
//!
//! Translates HTTP/JSON into component calls. Every state-changing route
//! requires the CSRF header to echo the session's CSRF cookie; per-endpoint
//! token buckets return 429 with `Retry-After`; responses carry the standard
//! security headers, and CORS reflects configured origins explicitly.

pub mod admin;
pub mod cookies;
pub mod install;
pub mod oidc_routes;
pub mod rate_limit;
pub mod user;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::http::{header, HeaderMap, HeaderValue, Method};
use axum::response::Response;
use axum::Router;
use axum_extra::extract::cookie::CookieJar;
use parking_lot::RwLock;
use subtle::ConstantTimeEq;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{info, warn};

use crate::audit::AuditLogger;
use crate::config::Config;
use crate::db::Db;
use crate::keystore::KeyStore;
use crate::oidc::OidcEngine;
use crate::rbac::RbacResolver;
use crate::store::clients::ClientStore;
use crate::store::credentials::CredentialStore;
use crate::store::install::InstallStore;
use crate::store::login_sessions::LoginSessionStore;
use crate::store::rbac::RbacStore;
use crate::store::sessions::{Session, SessionStore};
use crate::store::settings::SettingsStore;
use crate::store::subjects::SubjectStore;
use crate::store::{auth_requests::AuthRequestStore, codes::CodeStore, Cohort};
use crate::totp::TotpEngine;
use crate::{Error, Result};

use rate_limit::RateLimits;

/// Services that exist only once the key store is unlocked.
pub struct Services {
    /// Unlocked key store
    pub keystore: Arc<KeyStore>,
    /// OIDC engine
    pub oidc: OidcEngine,
    /// TOTP engine
    pub totp: TotpEngine,
}

/// Everything handlers need, threaded through axum state.
pub struct AppContext {
    /// Loaded configuration
    pub config: Config,
    /// Database handle
    pub db: Db,
    /// Subjects and admins
    pub subjects: SubjectStore,
    /// aPAKE credential material
    pub credentials: CredentialStore,
    /// Pending aPAKE handshakes
    pub login_sessions: LoginSessionStore,
    /// Relying-party registry
    pub clients: ClientStore,
    /// Server-side sessions
    pub sessions: SessionStore,
    /// RBAC graph
    pub rbac: RbacStore,
    /// Settings
    pub settings: SettingsStore,
    /// Install bootstrap
    pub install: InstallStore,
    /// Audit trail
    pub audit: AuditLogger,
    /// Token buckets
    pub rate_limits: RateLimits,
    services: RwLock<Option<Arc<Services>>>,
}

impl AppContext {
    /// Build the context over an opened database.
    #[must_use]
    pub fn new(config: Config, db: Db) -> Arc<Self> {
        Arc::new(Self {
            subjects: SubjectStore::new(db.clone()),
            credentials: CredentialStore::new(db.clone()),
            login_sessions: LoginSessionStore::new(db.clone(), config.sessions.login_ttl_secs),
            clients: ClientStore::new(db.clone()),
            sessions: SessionStore::new(db.clone()),
            rbac: RbacStore::new(db.clone()),
            settings: SettingsStore::new(db.clone()),
            install: InstallStore::new(db.clone()),
            audit: AuditLogger::new(db.clone()),
            rate_limits: RateLimits::new(&config.rate_limits),
            services: RwLock::new(None),
            config,
            db,
        })
    }

    /// Wire up the unlocked services. Called at startup (after unlock) or at
    /// the end of a successful install.
    pub fn attach_keystore(&self, keystore: Arc<KeyStore>) {
        let oidc = OidcEngine::new(
            AuthRequestStore::new(self.db.clone(), self.config.oidc.auth_request_ttl_secs),
            CodeStore::new(self.db.clone(), self.config.oidc.code_ttl_secs),
            self.sessions.clone(),
            self.clients.clone(),
            self.subjects.clone(),
            keystore.clone(),
            RbacResolver::new(self.rbac.clone()),
            self.config.server.issuer.clone(),
            self.config.oidc.clone(),
            self.config.sessions.clone(),
        );
        let totp = TotpEngine::new(self.db.clone(), keystore.clone(), self.config.totp.clone());
        *self.services.write() = Some(Arc::new(Services {
            keystore,
            oidc,
            totp,
        }));
    }

    /// The unlocked services, or an error while uninstalled/locked.
    pub fn services(&self) -> Result<Arc<Services>> {
        self.services
            .read()
            .clone()
            .ok_or_else(|| Error::Internal("server is not installed or the key store is locked".to_string()))
    }

    /// Whether services are attached.
    #[must_use]
    pub fn is_unlocked(&self) -> bool {
        self.services.read().is_some()
    }
}

// ── Request helpers ───────────────────────────────────────────────────────

/// Client IP from `X-Forwarded-For` / `X-Real-IP`, or a placeholder.
#[must_use]
pub fn client_ip(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|s| s.trim().to_string())
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|v| v.to_str().ok())
                .map(|s| s.trim().to_string())
        })
        .unwrap_or_else(|| "unknown".to_string())
}

/// Whether the request must carry the CSRF echo header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsrfCheck {
    /// State-changing request: header must match the session's token
    Enforce,
    /// Read-only request
    Skip,
}

/// Resolve the cohort session from cookies, enforcing CSRF where required.
pub fn require_session(
    ctx: &AppContext,
    jar: &CookieJar,
    headers: &HeaderMap,
    cohort: Cohort,
    csrf: CsrfCheck,
) -> Result<Session> {
    let session_id = cookies::session_id(jar, cohort).ok_or(Error::Unauthorized)?;
    let session = ctx
        .sessions
        .get_valid(cohort, &session_id, ctx.config.sessions.idle_timeout_secs)?
        .ok_or(Error::Unauthorized)?;

    if csrf == CsrfCheck::Enforce {
        let presented = headers
            .get(cookies::CSRF_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or(Error::ForbiddenCsrf)?;
        let matches = presented.len() == session.csrf_token.len()
            && bool::from(presented.as_bytes().ct_eq(session.csrf_token.as_bytes()));
        if !matches {
            return Err(Error::ForbiddenCsrf);
        }
    }
    Ok(session)
}

// ── Router composition ────────────────────────────────────────────────────

/// Build the full application router.
pub fn router(ctx: Arc<AppContext>) -> Router {
    let cors = cors_layer(&ctx.config.server.allowed_origins);
    let development = ctx.config.server.development;

    Router::new()
        .merge(oidc_routes::routes())
        .merge(user::routes())
        .merge(admin::routes())
        .merge(install::routes())
        .layer(axum::middleware::from_fn(move |req, next| {
            security_headers(req, next, development)
        }))
        .layer(cors)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(ctx)
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();
    // Origins are reflected explicitly; `*` never appears with credentials.
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([
            header::CONTENT_TYPE,
            header::HeaderName::from_static(cookies::CSRF_HEADER),
        ])
        .allow_credentials(true)
}

async fn security_headers(
    req: axum::extract::Request,
    next: axum::middleware::Next,
    development: bool,
) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert("x-content-type-options", HeaderValue::from_static("nosniff"));
    headers.insert("referrer-policy", HeaderValue::from_static("no-referrer"));
    if !development {
        headers.insert(
            "strict-transport-security",
            HeaderValue::from_static("max-age=31536000; includeSubDomains"),
        );
    }
    response
}

// ── Server lifecycle ──────────────────────────────────────────────────────

/// Bind and serve until ctrl-c. Also runs the periodic expiry sweeper.
pub async fn serve(ctx: Arc<AppContext>) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", ctx.config.server.host, ctx.config.server.port)
        .parse()
        .map_err(|e| Error::Internal(format!("invalid bind address: {e}")))?;

    spawn_sweeper(ctx.clone());

    let app = router(ctx);
    info!(%addr, "zkauth listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("bind failed: {e}")))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await
        .map_err(|e| Error::Internal(format!("server error: {e}")))
}

/// Periodically remove expired login sessions, auth requests, codes and
/// sessions. The stores stay correct without it (expiry is checked on read);
/// the sweep just keeps the tables small.
pub fn spawn_sweeper(ctx: Arc<AppContext>) {
    let interval = Duration::from_secs(ctx.config.sessions.sweep_interval_secs.max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(e) = sweep_once(&ctx) {
                warn!(error = %e, "expiry sweep failed");
            }
        }
    });
}

fn sweep_once(ctx: &AppContext) -> Result<()> {
    ctx.login_sessions.sweep()?;
    ctx.sessions.sweep()?;
    if let Ok(services) = ctx.services() {
        services.oidc.auth_requests.sweep()?;
        services.oidc.codes.sweep()?;
    }
    Ok(())
}
