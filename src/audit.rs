//! Audit logging — append-only events for every state-changing request.
//!
//! Each event lands in the `audit_logs` table and is also emitted via
//! `tracing::info!` with the serialized event in an `audit` field, so any
//! log aggregator can pick it up. Audit persistence is best-effort: a failed
//! write is logged and swallowed, never failing the request it describes.
//!
//! Request bodies are stored only after redaction against a fixed keyword
//! list; any JSON field whose name contains one of the keywords is replaced
//! with `"[REDACTED]"`, recursively.

use serde::Serialize;
use serde_json::Value;

use crate::db::{now, Db};
use crate::store::Cohort;
use crate::{Error, Result};

/// Field-name fragments whose values never reach the audit log.
const REDACTED_KEYWORDS: &[&str] = &[
    "password",
    "token",
    "code",
    "code_verifier",
    "secret",
    "request",
    "record",
    "finish",
    "refreshToken",
];

/// One audit event.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    /// Event type, e.g. `user.login.finish`
    pub event_type: String,
    /// HTTP method
    pub method: String,
    /// Request path
    pub path: String,
    /// Cohort, when a session was involved
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cohort: Option<&'static str>,
    /// Subject id, for user events
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject_id: Option<String>,
    /// Admin id, for admin events
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin_id: Option<String>,
    /// OAuth client, for OIDC events
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Remote address
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    /// User agent header
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    /// Whether the request succeeded
    pub success: bool,
    /// HTTP status returned
    pub status_code: u16,
    /// Stable error code on failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    /// Affected resource type
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,
    /// Affected resource id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    /// Verb, e.g. `create`, `delete`, `rotate`
    pub action: String,
    /// Redacted request body
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_body: Option<Value>,
    /// Handler latency
    pub response_time_ms: i64,
}

impl AuditEvent {
    /// A minimal event; callers fill in what they know.
    #[must_use]
    pub fn new(event_type: &str, method: &str, path: &str, action: &str) -> Self {
        Self {
            event_type: event_type.to_string(),
            method: method.to_string(),
            path: path.to_string(),
            cohort: None,
            subject_id: None,
            admin_id: None,
            client_id: None,
            ip_address: None,
            user_agent: None,
            success: true,
            status_code: 200,
            error_code: None,
            resource_type: None,
            resource_id: None,
            action: action.to_string(),
            request_body: None,
            response_time_ms: 0,
        }
    }

    /// Set the cohort.
    #[must_use]
    pub fn cohort(mut self, cohort: Cohort) -> Self {
        self.cohort = Some(cohort.as_str());
        self
    }

    /// Record the outcome.
    #[must_use]
    pub fn outcome(mut self, status_code: u16, error_code: Option<&str>) -> Self {
        self.success = status_code < 400;
        self.status_code = status_code;
        self.error_code = error_code.map(str::to_string);
        self
    }

    /// Attach a request body; it is redacted here, before storage.
    #[must_use]
    pub fn body(mut self, body: &Value) -> Self {
        self.request_body = Some(redact(body));
        self
    }
}

/// A stored audit row (list/detail/export surface).
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    /// Row id
    pub id: i64,
    /// The event
    #[serde(flatten)]
    pub event: AuditEvent,
    /// Insertion time
    pub created_at: i64,
}

/// Filters for the admin audit-log listing.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    /// Only events of this cohort
    pub cohort: Option<String>,
    /// Only events whose type starts with this prefix
    pub event_prefix: Option<String>,
    /// Only events at or after this time
    pub since: Option<i64>,
    /// Page size (default 100, max 1000)
    pub limit: Option<i64>,
}

/// Audit logger over the database.
#[derive(Clone)]
pub struct AuditLogger {
    db: Db,
}

impl AuditLogger {
    /// New logger.
    #[must_use]
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Emit an event: tracing always, database best-effort.
    pub fn emit(&self, event: &AuditEvent) {
        match serde_json::to_string(event) {
            Ok(ref json) => tracing::info!(audit = %json, "audit"),
            Err(ref e) => tracing::warn!(error = %e, "failed to serialize audit event"),
        }

        if let Err(e) = self.persist(event) {
            // Audit writes must never fail the request they describe.
            tracing::warn!(error = %e, event_type = %event.event_type, "audit write failed");
        }
    }

    fn persist(&self, event: &AuditEvent) -> Result<()> {
        self.db.with(|conn| {
            conn.execute(
                "INSERT INTO audit_logs
                   (event_type, method, path, cohort, subject_id, admin_id, client_id,
                    ip_address, user_agent, success, status_code, error_code,
                    resource_type, resource_id, action, request_body, response_time_ms,
                    created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
                rusqlite::params![
                    event.event_type,
                    event.method,
                    event.path,
                    event.cohort,
                    event.subject_id,
                    event.admin_id,
                    event.client_id,
                    event.ip_address,
                    event.user_agent,
                    event.success,
                    event.status_code,
                    event.error_code,
                    event.resource_type,
                    event.resource_id,
                    event.action,
                    event
                        .request_body
                        .as_ref()
                        .map(serde_json::to_string)
                        .transpose()?,
                    event.response_time_ms,
                    now()
                ],
            )
            .map_err(Error::from)
        })?;
        Ok(())
    }

    /// List events, newest first.
    pub fn list(&self, query: &AuditQuery) -> Result<Vec<AuditRecord>> {
        let limit = query.limit.unwrap_or(100).clamp(1, 1000);
        self.db.with(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, event_type, method, path, cohort, subject_id, admin_id, client_id,
                        ip_address, user_agent, success, status_code, error_code,
                        resource_type, resource_id, action, request_body, response_time_ms,
                        created_at
                 FROM audit_logs
                 WHERE (?1 IS NULL OR cohort = ?1)
                   AND (?2 IS NULL OR event_type LIKE ?2 || '%')
                   AND (?3 IS NULL OR created_at >= ?3)
                 ORDER BY id DESC LIMIT ?4",
            )?;
            let rows = stmt.query_map(
                rusqlite::params![query.cohort, query.event_prefix, query.since, limit],
                row_to_record,
            )?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(Error::from)
        })
    }

    /// One event by id.
    pub fn get(&self, id: i64) -> Result<Option<AuditRecord>> {
        use rusqlite::OptionalExtension;
        self.db.with(|conn| {
            conn.query_row(
                "SELECT id, event_type, method, path, cohort, subject_id, admin_id, client_id,
                        ip_address, user_agent, success, status_code, error_code,
                        resource_type, resource_id, action, request_body, response_time_ms,
                        created_at
                 FROM audit_logs WHERE id = ?1",
                rusqlite::params![id],
                row_to_record,
            )
            .optional()
            .map_err(Error::from)
        })
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditRecord> {
    let cohort: Option<String> = row.get(4)?;
    let body: Option<String> = row.get(16)?;
    Ok(AuditRecord {
        id: row.get(0)?,
        event: AuditEvent {
            event_type: row.get(1)?,
            method: row.get(2)?,
            path: row.get(3)?,
            cohort: cohort.as_deref().and_then(Cohort::parse).map(Cohort::as_str),
            subject_id: row.get(5)?,
            admin_id: row.get(6)?,
            client_id: row.get(7)?,
            ip_address: row.get(8)?,
            user_agent: row.get(9)?,
            success: row.get(10)?,
            status_code: row.get(11)?,
            error_code: row.get(12)?,
            resource_type: row.get(13)?,
            resource_id: row.get(14)?,
            action: row.get(15)?,
            request_body: body.and_then(|b| serde_json::from_str(&b).ok()),
            response_time_ms: row.get(17)?,
        },
        created_at: row.get(18)?,
    })
}

/// Redact sensitive fields from a JSON body, recursively.
#[must_use]
pub fn redact(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, val)| {
                    let lowered = key.to_lowercase();
                    if REDACTED_KEYWORDS
                        .iter()
                        .any(|kw| lowered.contains(&kw.to_lowercase()))
                    {
                        (key.clone(), Value::String("[REDACTED]".to_string()))
                    } else {
                        (key.clone(), redact(val))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn redaction_removes_sensitive_fields() {
        // GIVEN: a body with secrets at several depths
        let body = json!({
            "email": "a@example.com",
            "password": "hunter2",
            "refreshToken": "abc",
            "nested": { "client_secret": "s3cret", "name": "ok" },
            "items": [{ "code_verifier": "v" }]
        });

        // WHEN: redacted
        let clean = redact(&body);

        // THEN: secrets replaced, the rest preserved
        assert_eq!(clean["email"], "a@example.com");
        assert_eq!(clean["password"], "[REDACTED]");
        assert_eq!(clean["refreshToken"], "[REDACTED]");
        assert_eq!(clean["nested"]["client_secret"], "[REDACTED]");
        assert_eq!(clean["nested"]["name"], "ok");
        assert_eq!(clean["items"][0]["code_verifier"], "[REDACTED]");
    }

    #[test]
    fn emit_persists_and_list_filters() {
        // GIVEN: a logger with two events
        let logger = AuditLogger::new(crate::db::Db::open_in_memory().unwrap());
        logger.emit(
            &AuditEvent::new("user.login.finish", "POST", "/api/user/opaque/login/finish", "login")
                .cohort(Cohort::User)
                .outcome(200, None),
        );
        logger.emit(
            &AuditEvent::new("admin.client.create", "POST", "/api/admin/clients", "create")
                .cohort(Cohort::Admin)
                .outcome(409, Some("conflict")),
        );

        // WHEN: listing with a cohort filter
        let admin_events = logger
            .list(&AuditQuery {
                cohort: Some("admin".to_string()),
                ..Default::default()
            })
            .unwrap();

        // THEN: only the admin event, with its outcome
        assert_eq!(admin_events.len(), 1);
        assert_eq!(admin_events[0].event.event_type, "admin.client.create");
        assert!(!admin_events[0].event.success);
        assert_eq!(admin_events[0].event.error_code.as_deref(), Some("conflict"));
    }

    #[test]
    fn emitted_body_is_stored_redacted() {
        let logger = AuditLogger::new(crate::db::Db::open_in_memory().unwrap());
        logger.emit(
            &AuditEvent::new("user.register.finish", "POST", "/x", "register")
                .body(&json!({"email": "a@b.c", "record": "opaque-bytes"})),
        );
        let stored = logger.list(&AuditQuery::default()).unwrap();
        let body = stored[0].event.request_body.as_ref().unwrap();
        assert_eq!(body["record"], "[REDACTED]");
        assert_eq!(body["email"], "a@b.c");
    }
}
