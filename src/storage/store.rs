//! SQLite store for works, tasks, estimates, the outbox and workflow state
//!
//! The database sits in `.beadflow/beadflow.db` and is the source of truth
//! for everything the engine schedules. Several processes may open it at
//! once: WAL mode plus a busy timeout lets them queue on the write lock, and
//! every state transition is a conditional update that reports whether it
//! applied.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("{kind} already exists: {id}")]
    Duplicate { kind: &'static str, id: String },

    #[error("Task {id} is {actual}, expected {expected}")]
    Conflict {
        id: String,
        expected: String,
        actual: String,
    },

    #[error("Invalid task: {0}")]
    InvalidTask(String),

    #[error("Invalid dependency: {0}")]
    InvalidDependency(String),

    #[error("Database schema version {found} is newer than supported version {supported}")]
    SchemaTooNew { found: i32, supported: i32 },

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    pub(crate) fn not_found(kind: &'static str, id: impl ToString) -> Self {
        StoreError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// True for any not-found error, whatever the kind
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

/// Result of a conditional transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The row moved to the requested state
    Applied,
    /// The row was already in the requested state; nothing changed
    AlreadyDone,
}

/// Persistent store shared by the planner, scheduler, outbox and workflow driver
pub struct Store {
    /// Path to the SQLite database, None for in-memory stores
    db_path: Option<PathBuf>,

    /// Serialises in-process access; cross-process safety comes from SQLite locking
    conn: Mutex<Connection>,
}

impl Store {
    /// Schema version - bump when schema changes
    const SCHEMA_VERSION: i32 = 1;

    /// How long a writer waits for another process to release the lock
    const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

    /// Opens or creates the store at the given path
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)?;

        // Enable WAL mode for concurrent readers alongside one writer
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        Self::init(conn, Some(db_path.to_path_buf()))
    }

    /// Opens a private in-memory store
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?, None)
    }

    fn init(conn: Connection, db_path: Option<PathBuf>) -> Result<Self, StoreError> {
        conn.busy_timeout(Self::BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let store = Self {
            db_path,
            conn: Mutex::new(conn),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    /// Returns the path to the database, if file-backed
    pub fn path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    /// Runs `f` with exclusive use of the connection
    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut guard = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    fn ensure_schema(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            let current: i32 = conn
                .query_row("PRAGMA user_version", [], |row| row.get(0))
                .optional()?
                .unwrap_or(0);

            if current > Self::SCHEMA_VERSION {
                return Err(StoreError::SchemaTooNew {
                    found: current,
                    supported: Self::SCHEMA_VERSION,
                });
            }

            if current < Self::SCHEMA_VERSION {
                Self::create_schema(conn)?;
            }

            Ok(())
        })
    }

    /// Creates any missing tables and stamps the schema version
    fn create_schema(conn: &mut Connection) -> Result<(), StoreError> {
        let tx = conn.transaction()?;
        tx.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS works (
                id TEXT PRIMARY KEY,
                branch_name TEXT NOT NULL UNIQUE,
                worktree_path TEXT NOT NULL,
                base_branch TEXT NOT NULL,
                status TEXT NOT NULL,
                pr_url TEXT,
                next_task_seq INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                work_id TEXT NOT NULL REFERENCES works(id) ON DELETE CASCADE,
                seq INTEGER NOT NULL,
                task_type TEXT NOT NULL,
                status TEXT NOT NULL,
                complexity_budget INTEGER,
                actual_complexity INTEGER,
                error_message TEXT,
                pr_url TEXT,
                review_epic TEXT,
                claimed_by TEXT,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                UNIQUE (work_id, seq)
            );

            CREATE TABLE IF NOT EXISTS task_beads (
                task_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                bead_id TEXT NOT NULL,
                position INTEGER NOT NULL,
                completed INTEGER NOT NULL DEFAULT 0,
                completed_at TEXT,
                PRIMARY KEY (task_id, bead_id)
            );

            CREATE TABLE IF NOT EXISTS task_dependencies (
                task_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                depends_on_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                PRIMARY KEY (task_id, depends_on_id)
            );

            CREATE TABLE IF NOT EXISTS complexity_cache (
                bead_id TEXT NOT NULL,
                description_hash TEXT NOT NULL,
                score INTEGER NOT NULL,
                tokens INTEGER NOT NULL,
                estimated_at TEXT NOT NULL,
                PRIMARY KEY (bead_id, description_hash)
            );

            CREATE TABLE IF NOT EXISTS scheduled_outbox (
                idempotency_key TEXT PRIMARY KEY,
                work_id TEXT NOT NULL,
                task_type TEXT NOT NULL,
                run_at TEXT NOT NULL,
                metadata TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL,
                status TEXT NOT NULL,
                last_error TEXT,
                created_at TEXT NOT NULL,
                completed_at TEXT
            );

            CREATE TABLE IF NOT EXISTS workflow_state (
                workflow_id TEXT PRIMARY KEY,
                work_id TEXT,
                current_step INTEGER NOT NULL,
                step_status TEXT NOT NULL,
                error_message TEXT,
                payload TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_work ON tasks(work_id, seq);
            CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
            CREATE INDEX IF NOT EXISTS idx_task_beads_bead ON task_beads(bead_id);
            CREATE INDEX IF NOT EXISTS idx_deps_depends_on ON task_dependencies(depends_on_id);
            CREATE INDEX IF NOT EXISTS idx_outbox_due ON scheduled_outbox(status, run_at);
            ",
        )?;
        tx.execute_batch(&format!("PRAGMA user_version = {}", Self::SCHEMA_VERSION))?;
        tx.commit()?;
        Ok(())
    }

    /// Reads the schema version stamped on the database
    pub fn schema_version(&self) -> Result<i32, StoreError> {
        self.with_conn(|conn| Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?))
    }
}

/// Formats a timestamp so that string order equals time order
pub(crate) fn ts(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn now_ts() -> String {
    ts(Utc::now())
}

fn conversion_error(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

#[derive(Debug, Error)]
#[error("{0}")]
struct ParseColumnError(String);

/// Reads a required RFC 3339 timestamp column
pub(crate) fn col_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

/// Reads an optional RFC 3339 timestamp column
pub(crate) fn col_opt_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| conversion_error(idx, e))
    })
    .transpose()
}

/// Reads a text column through `FromStr`
pub(crate) fn col_parse<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>()
        .map_err(|e| conversion_error(idx, ParseColumnError(e.to_string())))
}

/// Reads a JSON text column
pub(crate) fn col_json<T: serde::de::DeserializeOwned>(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e))
}

/// True if the error is a UNIQUE / PRIMARY KEY violation
pub(crate) fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn store_creation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".beadflow").join("beadflow.db");
        let store = Store::open(&path).unwrap();

        assert!(path.exists());
        assert_eq!(store.path(), Some(path.as_path()));
    }

    #[test]
    fn schema_version_is_stamped() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(store.schema_version().unwrap(), Store::SCHEMA_VERSION);
    }

    #[test]
    fn reopening_keeps_data() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("beadflow.db");

        {
            let store = Store::open(&path).unwrap();
            store
                .with_conn(|conn| {
                    conn.execute(
                        "INSERT INTO complexity_cache VALUES ('bd-1', 'h', 3, 6000, ?1)",
                        [now_ts()],
                    )?;
                    Ok(())
                })
                .unwrap();
        }

        let store = Store::open(&path).unwrap();
        let count: i64 = store
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM complexity_cache", [], |r| r.get(0))?)
            })
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn newer_schema_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("beadflow.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch("PRAGMA user_version = 99").unwrap();
        }

        assert!(matches!(
            Store::open(&path),
            Err(StoreError::SchemaTooNew { found: 99, .. })
        ));
    }

    #[test]
    fn timestamps_sort_as_strings() {
        let early = Utc::now();
        let late = early + chrono::Duration::milliseconds(5);
        assert!(ts(early) < ts(late));
    }
}
