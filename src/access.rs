//! Durable access policy for callers of the gateway
//!
//! Every caller address has at most one entry. Unknown addresses are
//! registered as `pending` the first time they are seen and are denied
//! until a human allows them. Entries live in SQLite so decisions survive
//! restarts of the gateway.

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 1;

/// Trust status of a caller address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessStatus {
    /// Seen but not yet reviewed
    Pending,
    Allowed,
    Blocked,
}

impl AccessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessStatus::Pending => "pending",
            AccessStatus::Allowed => "allowed",
            AccessStatus::Blocked => "blocked",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(AccessStatus::Pending),
            "allowed" => Some(AccessStatus::Allowed),
            "blocked" => Some(AccessStatus::Blocked),
            _ => None,
        }
    }
}

/// Outcome of an admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    Denied,
}

/// One caller address and its trust status
#[derive(Debug, Clone, Serialize)]
pub struct AccessEntry {
    pub address: String,
    pub status: AccessStatus,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// The admission authority consulted for every inbound connection.
///
/// All access goes through a single SQLite connection behind a mutex, which
/// makes the store a single serialized access point: the check-and-register
/// step in [`decide`](AccessPolicyStore::decide) cannot interleave with another
/// call for the same address.
pub struct AccessPolicyStore {
    conn: Arc<Mutex<Connection>>,
}

impl AccessPolicyStore {
    /// Open or create a store at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path).context("Failed to open access store")?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.run_migrations()?;

        info!(path = %path.display(), "Access store opened");
        Ok(store)
    }

    /// Open an in-memory store (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory access store")?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < SCHEMA_VERSION {
            info!("Running access store migrations from v{} to v{}", current_version, SCHEMA_VERSION);

            if current_version < 1 {
                debug!("Applying migration v1: access entries");
                conn.execute_batch(
                    r#"
                    CREATE TABLE IF NOT EXISTS access_entries (
                        address TEXT PRIMARY KEY,
                        status TEXT NOT NULL DEFAULT 'pending',
                        first_seen TEXT NOT NULL,
                        last_seen TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_access_status ON access_entries(status, first_seen);

                    INSERT INTO schema_migrations (version) VALUES (1);
                    "#,
                )?;
            }
        }

        Ok(())
    }

    /// Classify-or-register: the admission check for one caller.
    ///
    /// This is deliberately a write. If `address` has never been seen, a
    /// `pending` entry is created and the caller is denied; an unknown caller
    /// is never trusted. Known callers get `last_seen` refreshed and are
    /// allowed only when their status is `allowed`. Registration and
    /// classification happen under one lock, so concurrent first contacts from
    /// the same address create exactly one entry.
    pub fn decide(&self, address: &str) -> Result<Decision> {
        let now = timestamp_now();
        let conn = self.conn.lock();

        let inserted = conn.execute(
            "INSERT OR IGNORE INTO access_entries (address, status, first_seen, last_seen)
             VALUES (?1, 'pending', ?2, ?2)",
            params![address, now],
        )?;

        if inserted > 0 {
            info!(address, "New caller registered as pending");
            return Ok(Decision::Denied);
        }

        conn.execute(
            "UPDATE access_entries SET last_seen = ?2 WHERE address = ?1",
            params![address, now],
        )?;

        let status: String = conn.query_row(
            "SELECT status FROM access_entries WHERE address = ?1",
            params![address],
            |row| row.get(0),
        )?;

        match AccessStatus::parse(&status) {
            Some(AccessStatus::Allowed) => Ok(Decision::Allowed),
            _ => Ok(Decision::Denied),
        }
    }

    /// Entries still awaiting review, oldest first
    pub fn list_pending(&self) -> Result<Vec<AccessEntry>> {
        self.query_entries(
            "SELECT address, status, first_seen, last_seen FROM access_entries
             WHERE status = 'pending' ORDER BY first_seen ASC, address ASC",
        )
    }

    /// Every known entry, oldest first
    pub fn list_all(&self) -> Result<Vec<AccessEntry>> {
        self.query_entries(
            "SELECT address, status, first_seen, last_seen FROM access_entries
             ORDER BY first_seen ASC, address ASC",
        )
    }

    pub fn get(&self, address: &str) -> Result<Option<AccessEntry>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT address, status, first_seen, last_seen FROM access_entries WHERE address = ?1",
            params![address],
            row_to_entry,
        )
        .optional()
        .map_err(Into::into)
    }

    /// Trust `address`. Idempotent, and creates the entry if it was never seen.
    pub fn allow(&self, address: &str) -> Result<()> {
        self.set_status(address, AccessStatus::Allowed)
    }

    /// Reject `address`. Idempotent, and creates the entry if it was never seen.
    pub fn block(&self, address: &str) -> Result<()> {
        self.set_status(address, AccessStatus::Blocked)
    }

    /// Remove an entry entirely; the address becomes unseen again
    pub fn forget(&self, address: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "DELETE FROM access_entries WHERE address = ?1",
            params![address],
        )?;
        if rows > 0 {
            info!(address, "Access entry removed");
        }
        Ok(rows > 0)
    }

    fn set_status(&self, address: &str, status: AccessStatus) -> Result<()> {
        let now = timestamp_now();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO access_entries (address, status, first_seen, last_seen)
             VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT(address) DO UPDATE SET status = excluded.status",
            params![address, status.as_str(), now],
        )?;
        info!(address, status = status.as_str(), "Access decision recorded");
        Ok(())
    }

    fn query_entries(&self, sql: &str) -> Result<Vec<AccessEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql)?;
        let entries = stmt
            .query_map([], row_to_entry)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<AccessEntry> {
    let status: String = row.get(1)?;
    let first_seen: String = row.get(2)?;
    let last_seen: String = row.get(3)?;
    Ok(AccessEntry {
        address: row.get(0)?,
        status: AccessStatus::parse(&status).unwrap_or(AccessStatus::Pending),
        first_seen: parse_timestamp(&first_seen),
        last_seen: parse_timestamp(&last_seen),
    })
}

/// Fixed-width timestamps so that text ordering matches time ordering
fn timestamp_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_default()
}
