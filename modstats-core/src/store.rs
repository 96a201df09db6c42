//! Durable consent and check-in state
//!
//! The reporting subsystem keeps three flags under a single namespaced key
//! group: `optin` (default true), `firstboot` (default true) and `checkedin`
//! (default false). Writes are read-modify-write with immediate durability;
//! there is no batching. The backing store is injectable so tests run against
//! an in-memory map while production uses SQLite.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;

use crate::error::Result;

const KEY_OPT_IN: &str = "optin";
const KEY_FIRST_BOOT: &str = "firstboot";
const KEY_CHECKED_IN: &str = "checkedin";
const KEY_INSTALL_ID: &str = "install_id";
const KEY_LAST_CHECKIN: &str = "last_checkin_at";

/// Current schema version for the SQLite backend
const SCHEMA_VERSION: i32 = 1;

/// SQL migrations, indexed by version number
const MIGRATIONS: &[&str] = &[
    // Version 1: single key/value preference table
    r#"
    CREATE TABLE IF NOT EXISTS prefs (
        key    TEXT PRIMARY KEY,
        value  TEXT NOT NULL
    );
    "#,
];

/// Key/value backing store for consent state.
///
/// Every `put` must be durable before it returns; the reporting state machine
/// relies on the stored flags surviving process restarts and reboots.
pub trait StoreBackend: Send {
    /// Read a value, returning None when the key has never been written.
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a value with immediate durability.
    fn put(&mut self, key: &str, value: &str) -> Result<()>;
}

/// In-memory backend for tests.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    values: HashMap<String, String>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StoreBackend for MemoryBackend {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.get(key).cloned())
    }

    fn put(&mut self, key: &str, value: &str) -> Result<()> {
        self.values.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// SQLite-backed preference store for production use.
pub struct SqliteBackend {
    conn: Connection,
}

impl SqliteBackend {
    /// Open or create the preference store at the given path
    pub fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        // WAL keeps concurrent readers cheap; FULL synchronous because every
        // flag write must survive an immediate power cut.
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = FULL;
            ",
        )?;

        run_migrations(&conn)?;

        Ok(Self { conn })
    }

    /// Open an in-memory store (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        run_migrations(&conn)?;
        Ok(Self { conn })
    }
}

impl StoreBackend for SqliteBackend {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn
            .query_row("SELECT value FROM prefs WHERE key = ?1", params![key], |r| {
                r.get(0)
            })
            .optional()?;
        Ok(value)
    }

    fn put(&mut self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO prefs (key, value) VALUES (?1, ?2)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
            params![key, value],
        )?;
        Ok(())
    }
}

/// Run migrations on a preference store connection
fn run_migrations(conn: &Connection) -> Result<()> {
    let current_version: i32 = conn
        .query_row("PRAGMA user_version", [], |r| r.get(0))
        .unwrap_or(0);

    for (i, migration) in MIGRATIONS.iter().enumerate() {
        let version = (i + 1) as i32;
        if version > current_version {
            tracing::info!(version, "Running preference store migration");
            conn.execute_batch(migration)?;
            conn.execute(&format!("PRAGMA user_version = {}", version), [])?;
        }
    }

    if current_version < SCHEMA_VERSION {
        tracing::debug!(
            from = current_version,
            to = SCHEMA_VERSION,
            "Preference store migrations complete"
        );
    }

    Ok(())
}

/// Typed accessors over the consent key group.
///
/// Exclusively owned by the reporting subsystem; the consent UI mutates
/// `optin`/`firstboot` through the same contract (via the state machine's
/// consent-changed entry point), never through a second store handle.
pub struct ConsentStore {
    backend: Box<dyn StoreBackend>,
}

impl ConsentStore {
    pub fn new(backend: Box<dyn StoreBackend>) -> Self {
        Self { backend }
    }

    /// In-memory store for tests.
    pub fn in_memory() -> Self {
        Self::new(Box::new(MemoryBackend::new()))
    }

    fn get_bool(&self, key: &str, default: bool) -> Result<bool> {
        Ok(self
            .backend
            .get(key)?
            .map(|v| v == "true")
            .unwrap_or(default))
    }

    fn put_bool(&mut self, key: &str, value: bool) -> Result<()> {
        self.backend.put(key, if value { "true" } else { "false" })
    }

    /// User consent flag; opt-in by default.
    pub fn opted_in(&self) -> Result<bool> {
        self.get_bool(KEY_OPT_IN, true)
    }

    /// Set only by explicit user action via the consent entry point.
    pub fn set_opted_in(&mut self, opted_in: bool) -> Result<()> {
        self.put_bool(KEY_OPT_IN, opted_in)
    }

    /// True until the user has seen the consent prompt once.
    pub fn first_boot(&self) -> Result<bool> {
        self.get_bool(KEY_FIRST_BOOT, true)
    }

    /// Monotonic: only ever writes `false`. Cleared the first time the
    /// consent UI is shown or interacted with, never re-set except by
    /// reinstall (which wipes the store).
    pub fn clear_first_boot(&mut self) -> Result<()> {
        self.put_bool(KEY_FIRST_BOOT, false)
    }

    /// True once a report has been successfully submitted since the last
    /// boot or shutdown event.
    pub fn checked_in(&self) -> Result<bool> {
        self.get_bool(KEY_CHECKED_IN, false)
    }

    pub fn set_checked_in(&mut self, checked_in: bool) -> Result<()> {
        self.put_bool(KEY_CHECKED_IN, checked_in)
    }

    /// Returns the stable per-install identifier, generating and persisting
    /// one on first read. The device hash is derived from this value.
    pub fn install_id(&mut self) -> Result<String> {
        if let Some(id) = self.backend.get(KEY_INSTALL_ID)? {
            return Ok(id);
        }

        let id = uuid::Uuid::new_v4().to_string();
        self.backend.put(KEY_INSTALL_ID, &id)?;
        tracing::info!("Generated new install id");
        Ok(id)
    }

    /// Timestamp of the most recent successful submission, if any.
    pub fn last_checkin_at(&self) -> Result<Option<DateTime<Utc>>> {
        let value = self.backend.get(KEY_LAST_CHECKIN)?;
        Ok(value
            .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
            .map(|dt| dt.with_timezone(&Utc)))
    }

    pub fn set_last_checkin_at(&mut self, at: DateTime<Utc>) -> Result<()> {
        self.backend.put(KEY_LAST_CHECKIN, &at.to_rfc3339())
    }
}
