//! SQLite persistence — connection handling, schema, migrations.
//!
//! One write connection behind a mutex serializes every write transaction,
//! which is what gives authorization-code redemption, refresh rotation and
//! login-session consumption their exactly-one-winner semantics: the losing
//! request re-reads the consumed/rotated row inside its own transaction and
//! fails cleanly.
//!
//! The database is the source of truth. There are no write-behind caches;
//! sessions and login state survive process restarts.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags, Transaction};
use tracing::info;

use crate::{Error, Result};

/// Current schema version, stored in `PRAGMA user_version`.
const SCHEMA_VERSION: i64 = 1;

/// Shared database handle.
#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    /// Open (or create) the database at `path` and run migrations.
    pub fn open<P: AsRef<Path>>(path: P, busy_timeout: Duration) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path.as_ref(),
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Self::init(conn, busy_timeout)
    }

    /// Open an in-memory database. Used by tests and the install dry-run.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?, Duration::from_secs(5))
    }

    fn init(conn: Connection, busy_timeout: Duration) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(busy_timeout)?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.migrate()?;
        Ok(db)
    }

    /// Run a closure with the connection. Reads and single-statement writes.
    pub fn with<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Run a closure inside a transaction. Rolls back on error.
    pub fn with_tx<T>(&self, f: impl FnOnce(&Transaction) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)
            .map_err(Error::from)?;
        let out = f(&tx)?;
        tx.commit().map_err(Error::from)?;
        Ok(out)
    }

    fn migrate(&self) -> Result<()> {
        self.with(|conn| {
            let version: i64 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
            if version >= SCHEMA_VERSION {
                return Ok(());
            }
            info!(from = version, to = SCHEMA_VERSION, "migrating database schema");
            conn.execute_batch(SCHEMA)?;
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
            Ok(())
        })
    }
}

/// Unix-epoch seconds, the timestamp representation used across all tables.
#[must_use]
pub fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS subjects (
    sub                     TEXT PRIMARY KEY,
    email                   TEXT NOT NULL UNIQUE,
    name                    TEXT NOT NULL,
    password_reset_required INTEGER NOT NULL DEFAULT 0,
    created_at              INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS admin_users (
    admin_id                TEXT PRIMARY KEY,
    email                   TEXT NOT NULL UNIQUE,
    name                    TEXT NOT NULL,
    role                    TEXT NOT NULL CHECK (role IN ('read', 'write')),
    password_reset_required INTEGER NOT NULL DEFAULT 0,
    created_at              INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS credentials (
    sub             TEXT PRIMARY KEY REFERENCES subjects(sub) ON DELETE CASCADE,
    envelope        BLOB NOT NULL,
    server_pub_key  BLOB NOT NULL,
    export_key_hash BLOB NOT NULL,
    updated_at      INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS admin_credentials (
    admin_id        TEXT PRIMARY KEY REFERENCES admin_users(admin_id) ON DELETE CASCADE,
    envelope        BLOB NOT NULL,
    server_pub_key  BLOB NOT NULL,
    export_key_hash BLOB NOT NULL,
    updated_at      INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS clients (
    client_id             TEXT PRIMARY KEY,
    name                  TEXT NOT NULL,
    redirect_uris         TEXT NOT NULL,
    require_pkce          INTEGER NOT NULL DEFAULT 1,
    public                INTEGER NOT NULL DEFAULT 1,
    zk_delivery           TEXT NOT NULL DEFAULT 'none'
                          CHECK (zk_delivery IN ('none', 'fragment-jwe')),
    allowed_jwe_algs      TEXT NOT NULL DEFAULT '["ECDH-ES"]',
    allowed_jwe_encs      TEXT NOT NULL DEFAULT '["A256GCM"]',
    refresh_lifetime_secs INTEGER,
    created_at            INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS login_sessions (
    id         TEXT PRIMARY KEY,
    cohort     TEXT NOT NULL CHECK (cohort IN ('user', 'admin')),
    state      BLOB NOT NULL,
    created_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS auth_requests (
    id                    TEXT PRIMARY KEY,
    client_id             TEXT NOT NULL,
    redirect_uri          TEXT NOT NULL,
    response_type         TEXT NOT NULL,
    scope                 TEXT NOT NULL,
    state                 TEXT,
    nonce                 TEXT,
    code_challenge        TEXT,
    code_challenge_method TEXT,
    zk_pub_key            TEXT,
    request_origin        TEXT,
    status                TEXT NOT NULL DEFAULT 'pending'
                          CHECK (status IN ('pending', 'finalized', 'consumed')),
    created_at            INTEGER NOT NULL,
    expires_at            INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS authorization_codes (
    code            TEXT PRIMARY KEY,
    auth_request_id TEXT NOT NULL,
    sub             TEXT NOT NULL,
    client_id       TEXT NOT NULL,
    redirect_uri    TEXT NOT NULL,
    scope           TEXT NOT NULL,
    nonce           TEXT,
    code_challenge  TEXT,
    wrapped_drk     TEXT,
    zk_client_pub   TEXT,
    org_id          TEXT,
    chain_id        TEXT,
    issued_at       INTEGER NOT NULL,
    expires_at      INTEGER NOT NULL,
    consumed_at     INTEGER
);

CREATE TABLE IF NOT EXISTS sessions (
    session_id          TEXT PRIMARY KEY,
    cohort              TEXT NOT NULL CHECK (cohort IN ('user', 'admin')),
    principal_id        TEXT NOT NULL,
    client_id           TEXT,
    created_at          INTEGER NOT NULL,
    last_seen_at        INTEGER NOT NULL,
    idle_timeout_at     INTEGER NOT NULL,
    absolute_expires_at INTEGER NOT NULL,
    csrf_token          TEXT NOT NULL,
    otp_verified        INTEGER,
    org_id              TEXT,
    refresh_token_hash  BLOB UNIQUE,
    chain_id            TEXT
);
CREATE INDEX IF NOT EXISTS idx_sessions_chain ON sessions(chain_id);

CREATE TABLE IF NOT EXISTS totp_records (
    cohort           TEXT NOT NULL,
    principal_id     TEXT NOT NULL,
    secret_wrapped   BLOB NOT NULL,
    status           TEXT NOT NULL CHECK (status IN ('pending', 'enabled')),
    created_at       INTEGER NOT NULL,
    last_used_at     INTEGER,
    failure_count    INTEGER NOT NULL DEFAULT 0,
    first_failure_at INTEGER,
    locked_until     INTEGER,
    PRIMARY KEY (cohort, principal_id)
);

CREATE TABLE IF NOT EXISTS totp_backup_codes (
    cohort       TEXT NOT NULL,
    principal_id TEXT NOT NULL,
    code_hash    BLOB NOT NULL,
    used_at      INTEGER,
    PRIMARY KEY (cohort, principal_id, code_hash)
);

CREATE TABLE IF NOT EXISTS signing_keys (
    kid             TEXT PRIMARY KEY,
    wrapped_private BLOB NOT NULL,
    public_jwk      TEXT NOT NULL,
    created_at      INTEGER NOT NULL,
    rotated_at      INTEGER
);

CREATE TABLE IF NOT EXISTS kek_params (
    id          INTEGER PRIMARY KEY CHECK (id = 1),
    kdf         TEXT NOT NULL,
    salt        BLOB NOT NULL,
    memory_kib  INTEGER NOT NULL,
    iterations  INTEGER NOT NULL,
    parallelism INTEGER NOT NULL,
    created_at  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS oprf_seed (
    id           INTEGER PRIMARY KEY CHECK (id = 1),
    wrapped_seed BLOB NOT NULL,
    created_at   INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS settings (
    key    TEXT PRIMARY KEY,
    value  TEXT NOT NULL,
    secure INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS organizations (
    org_id      TEXT PRIMARY KEY,
    slug        TEXT NOT NULL UNIQUE,
    name        TEXT NOT NULL,
    require_otp INTEGER NOT NULL DEFAULT 0,
    created_at  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS memberships (
    org_id     TEXT NOT NULL REFERENCES organizations(org_id) ON DELETE CASCADE,
    sub        TEXT NOT NULL REFERENCES subjects(sub) ON DELETE CASCADE,
    status     TEXT NOT NULL CHECK (status IN ('active', 'suspended')),
    created_at INTEGER NOT NULL,
    PRIMARY KEY (org_id, sub)
);

CREATE TABLE IF NOT EXISTS roles (
    role_id TEXT PRIMARY KEY,
    name    TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS permissions (
    permission_id TEXT PRIMARY KEY,
    name          TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS role_permissions (
    role_id       TEXT NOT NULL REFERENCES roles(role_id) ON DELETE CASCADE,
    permission_id TEXT NOT NULL REFERENCES permissions(permission_id) ON DELETE CASCADE,
    PRIMARY KEY (role_id, permission_id)
);

CREATE TABLE IF NOT EXISTS membership_roles (
    org_id  TEXT NOT NULL,
    sub     TEXT NOT NULL,
    role_id TEXT NOT NULL REFERENCES roles(role_id) ON DELETE CASCADE,
    PRIMARY KEY (org_id, sub, role_id),
    FOREIGN KEY (org_id, sub) REFERENCES memberships(org_id, sub) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS audit_logs (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    event_type       TEXT NOT NULL,
    method           TEXT NOT NULL,
    path             TEXT NOT NULL,
    cohort           TEXT,
    subject_id       TEXT,
    admin_id         TEXT,
    client_id        TEXT,
    ip_address       TEXT,
    user_agent       TEXT,
    success          INTEGER NOT NULL,
    status_code      INTEGER NOT NULL,
    error_code       TEXT,
    resource_type    TEXT,
    resource_id      TEXT,
    action           TEXT NOT NULL,
    request_body     TEXT,
    response_time_ms INTEGER NOT NULL,
    created_at       INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_audit_logs_created ON audit_logs(created_at);

CREATE TABLE IF NOT EXISTS install_tokens (
    token_hash BLOB PRIMARY KEY,
    created_at INTEGER NOT NULL,
    used_at    INTEGER
);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrate_creates_schema() {
        // GIVEN: a fresh in-memory database
        let db = Db::open_in_memory().unwrap();

        // THEN: the core tables exist
        let count: i64 = db
            .with(|conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'
                     AND name IN ('subjects', 'credentials', 'sessions',
                                  'authorization_codes', 'signing_keys')",
                    [],
                    |r| r.get(0),
                )
                .map_err(Error::from)
            })
            .unwrap();
        assert_eq!(count, 5);
    }

    #[test]
    fn migrate_is_idempotent() {
        // GIVEN: a database created on disk
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        drop(Db::open(&path, Duration::from_secs(1)).unwrap());

        // WHEN: reopened (migration runs again)
        let db = Db::open(&path, Duration::from_secs(1)).unwrap();

        // THEN: it still works
        db.with(|conn| {
            conn.execute(
                "INSERT INTO subjects (sub, email, name, created_at) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params!["s1", "a@example.com", "A", now()],
            )
            .map_err(Error::from)
        })
        .unwrap();
    }

    #[test]
    fn with_tx_rolls_back_on_error() {
        // GIVEN: a database and a transaction that fails midway
        let db = Db::open_in_memory().unwrap();
        let result: Result<()> = db.with_tx(|tx| {
            tx.execute(
                "INSERT INTO subjects (sub, email, name, created_at) VALUES ('s1', 'a@b.c', 'A', 0)",
                [],
            )?;
            Err(Error::Internal("boom".to_string()))
        });
        assert!(result.is_err());

        // THEN: the insert was rolled back
        let count: i64 = db
            .with(|conn| {
                conn.query_row("SELECT COUNT(*) FROM subjects", [], |r| r.get(0))
                    .map_err(Error::from)
            })
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn duplicate_email_is_a_conflict() {
        // GIVEN: a subject
        let db = Db::open_in_memory().unwrap();
        db.with(|conn| {
            conn.execute(
                "INSERT INTO subjects (sub, email, name, created_at) VALUES ('s1', 'a@b.c', 'A', 0)",
                [],
            )
            .map_err(Error::from)
        })
        .unwrap();

        // WHEN: inserting the same email again
        let err = db
            .with(|conn| {
                conn.execute(
                    "INSERT INTO subjects (sub, email, name, created_at) VALUES ('s2', 'a@b.c', 'B', 0)",
                    [],
                )
                .map_err(Error::from)
            })
            .unwrap_err();

        // THEN: it maps to Conflict
        assert!(matches!(err, Error::Conflict(_)));
    }
}
