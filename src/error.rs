//! Error types for zkauth
//!
//! Every fallible path in the crate funnels into [`Error`]. Handlers convert
//! domain errors to HTTP responses through the single [`Error::status`] /
//! [`Error::code`] mapping, so a given failure always produces the same
//! status and wire shape no matter which route it surfaced on.
//!
//! OPAQUE-protocol failures are collapsed into [`Error::AuthenticationFailed`]
//! before they leave the AKE engine: the response never distinguishes
//! "unknown user" from "wrong password".

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Result type alias for zkauth
pub type Result<T> = std::result::Result<T, Error>;

/// zkauth errors
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or semantically invalid request input
    #[error("Validation error: {0}")]
    Validation(String),

    /// Requested entity does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Uniqueness or state-machine conflict
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Missing or invalid session
    #[error("Unauthorized")]
    Unauthorized,

    /// Authenticated but not allowed
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// CSRF token missing or mismatched
    #[error("CSRF token missing or invalid")]
    ForbiddenCsrf,

    /// Any aPAKE failure: unknown user, wrong password, expired login
    /// session, identity mismatch. Deliberately carries no detail.
    #[error("Authentication failed")]
    AuthenticationFailed,

    /// The session requires OTP verification before this operation
    #[error("OTP verification required")]
    OtpRequired,

    /// OTP verification is locked out after repeated failures
    #[error("OTP locked, retry after {retry_after_secs}s")]
    OtpLocked {
        /// Seconds until the lockout expires
        retry_after_secs: i64,
    },

    /// OIDC token endpoint failure (consumed code, bad PKCE, wrong client)
    #[error("invalid_grant: {0}")]
    InvalidGrant(String),

    /// Rate limit exceeded
    #[error("Too many requests, retry after {retry_after_secs}s")]
    TooManyRequests {
        /// Seconds the client should wait before retrying
        retry_after_secs: u64,
    },

    /// New password equals the current one during a change flow
    #[error("New password equals current password")]
    NewPasswordEqualsCurrent,

    /// Anything the caller cannot act on: storage, crypto, serialization
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Shorthand for a not-found error
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// HTTP status for this error
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) | Self::NewPasswordEqualsCurrent => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Unauthorized | Self::OtpRequired => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) | Self::ForbiddenCsrf => StatusCode::FORBIDDEN,
            // A failed login is a client error, not a server one; 400 keeps
            // the response identical for unknown-user and wrong-password.
            Self::AuthenticationFailed => StatusCode::BAD_REQUEST,
            Self::OtpLocked { .. } => StatusCode::LOCKED,
            Self::InvalidGrant(_) => StatusCode::BAD_REQUEST,
            Self::TooManyRequests { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable error code for the response body
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Unauthorized => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::ForbiddenCsrf => "forbidden_csrf",
            Self::AuthenticationFailed => "authentication_failed",
            Self::OtpRequired => "otp_required",
            Self::OtpLocked { .. } => "otp_locked",
            Self::InvalidGrant(_) => "invalid_grant",
            Self::TooManyRequests { .. } => "too_many_requests",
            Self::NewPasswordEqualsCurrent => "new_password_equals_current",
            Self::Internal(_) => "internal_error",
        }
    }

    /// User-safe message. Internal detail is logged, never returned.
    #[must_use]
    pub fn public_message(&self) -> String {
        match self {
            Self::Internal(_) => "Internal server error".to_string(),
            Self::AuthenticationFailed => "Incorrect email or password".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        if let Self::Internal(ref detail) = self {
            tracing::error!(error = %detail, "internal error");
        }

        let status = self.status();
        let body = match &self {
            // OIDC error shape on the token endpoint family
            Self::InvalidGrant(desc) => json!({
                "error": "invalid_grant",
                "error_description": desc,
            }),
            _ => json!({
                "error": self.code(),
                "message": self.public_message(),
            }),
        };

        let mut response = (status, Json(body)).into_response();
        let retry_after = match self {
            Self::TooManyRequests { retry_after_secs } => Some(retry_after_secs.to_string()),
            Self::OtpLocked { retry_after_secs } => Some(retry_after_secs.to_string()),
            _ => None,
        };
        if let Some(secs) = retry_after {
            if let Ok(v) = secs.parse() {
                response.headers_mut().insert("retry-after", v);
            }
        }
        response
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::SqliteFailure(ref err, _)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Self::Conflict("uniqueness constraint violated".to_string())
            }
            other => Self::Internal(format!("database error: {other}")),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Internal(format!("serialization error: {e}"))
    }
}
