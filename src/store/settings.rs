//! Settings — JSON values keyed by name, validated on write.
//!
//! Every setting is a JSON blob with a per-key validator invoked before the
//! write; unknown keys are rejected. Keys flagged `secure` never leave the
//! admin surface.

use rusqlite::OptionalExtension;
use serde_json::Value;

use crate::db::Db;
use crate::{Error, Result};

/// Known settings and their validators.
const KNOWN_KEYS: &[(&str, fn(&Value) -> bool)] = &[
    ("branding.title", |v| v.is_string()),
    ("branding.logo_url", |v| v.is_string()),
    ("sessions.user_absolute_secs", |v| v.as_i64().is_some_and(|n| n > 0)),
    ("self_registration.enabled", Value::is_boolean),
];

/// Store for settings.
#[derive(Clone)]
pub struct SettingsStore {
    db: Db,
}

impl SettingsStore {
    /// New handle.
    #[must_use]
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Read a setting.
    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        let raw: Option<String> = self.db.with(|conn| {
            conn.query_row(
                "SELECT value FROM settings WHERE key = ?1",
                rusqlite::params![key],
                |r| r.get(0),
            )
            .optional()
            .map_err(Error::from)
        })?;
        raw.map(|s| serde_json::from_str(&s).map_err(Error::from))
            .transpose()
    }

    /// Write a setting after validation.
    pub fn put(&self, key: &str, value: &Value) -> Result<()> {
        let Some((_, validate)) = KNOWN_KEYS.iter().find(|(k, _)| *k == key) else {
            return Err(Error::validation(format!("unknown setting key {key}")));
        };
        if !validate(value) {
            return Err(Error::validation(format!("invalid value for setting {key}")));
        }
        self.db.with(|conn| {
            conn.execute(
                "INSERT INTO settings (key, value, secure) VALUES (?1, ?2, 0)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                rusqlite::params![key, serde_json::to_string(value)?],
            )
            .map_err(Error::from)
        })?;
        Ok(())
    }

    /// All non-secure settings.
    pub fn list(&self) -> Result<Vec<(String, Value)>> {
        self.db.with(|conn| {
            let mut stmt =
                conn.prepare("SELECT key, value FROM settings WHERE secure = 0 ORDER BY key")?;
            let rows = stmt.query_map([], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
            })?;
            let mut out = Vec::new();
            for row in rows {
                let (key, raw) = row?;
                out.push((key, serde_json::from_str(&raw)?));
            }
            Ok(out)
        })
    }
}
