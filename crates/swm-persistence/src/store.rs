//! ---
//! swm_section: "03-persistence-logging"
//! swm_subsection: "module"
//! swm_type: "source"
//! swm_scope: "code"
//! swm_description: "SQLite store for updates and operations."
//! swm_version: "v0.0.0-prealpha"
//! swm_owner: "tbd"
//! ---
use std::fs;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::metrics::PersistenceMetrics;
use crate::status::Status;
use crate::{PersistenceError, Result};

/// Schema version understood by this build.
pub const SCHEMA_VERSION: &str = "0.0.1";

const KEY_SCHEMA_VERSION: &str = "SchemaVersion";

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS system (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS sw_update (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        start_time TEXT,
        finish_time TEXT,
        status TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS sw_operation (
        update_id TEXT NOT NULL REFERENCES sw_update (id),
        id TEXT NOT NULL,
        operation_type TEXT NOT NULL,
        start_time TEXT,
        finish_time TEXT,
        status TEXT NOT NULL,
        result_code INTEGER,
        PRIMARY KEY (update_id, id)
    );
";

/// Persisted software update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateRecord {
    /// Externally assigned update identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Lifecycle status.
    pub status: Status,
    /// Set when the update was started.
    pub start_time: Option<DateTime<Utc>>,
    /// Set when the update reached a terminal status.
    pub finish_time: Option<DateTime<Utc>>,
}

impl UpdateRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            name: row.get("name")?,
            status: row.get("status")?,
            start_time: row.get("start_time")?,
            finish_time: row.get("finish_time")?,
        })
    }
}

/// Persisted operation belonging to an update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationRecord {
    /// Owning update.
    pub update_id: String,
    /// Identifier, unique within the update.
    pub id: String,
    /// Operation type key.
    pub operation_type: String,
    /// Lifecycle status.
    pub status: Status,
    /// Set when the operation was dispatched.
    pub start_time: Option<DateTime<Utc>>,
    /// Set when the operation reached a terminal status.
    pub finish_time: Option<DateTime<Utc>>,
    /// Result code reported on completion.
    pub result_code: Option<i32>,
}

impl OperationRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            update_id: row.get("update_id")?,
            id: row.get("id")?,
            operation_type: row.get("operation_type")?,
            status: row.get("status")?,
            start_time: row.get("start_time")?,
            finish_time: row.get("finish_time")?,
            result_code: row.get("result_code")?,
        })
    }
}

/// Condition on the child operations that must hold for an update transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Barrier {
    None,
    AllFinished,
    SettledWithError,
}

impl Barrier {
    fn holds(self, tx: &Transaction<'_>, update_id: &str) -> Result<bool> {
        let count = |sql: &str| -> Result<i64> {
            Ok(tx.query_row(sql, params![update_id], |row| row.get(0))?)
        };
        Ok(match self {
            Barrier::None => true,
            Barrier::AllFinished => {
                count("SELECT COUNT(*) FROM sw_operation WHERE update_id = ?1 AND status != 'FINISHED'")?
                    == 0
            }
            Barrier::SettledWithError => {
                let open = count(
                    "SELECT COUNT(*) FROM sw_operation WHERE update_id = ?1 \
                     AND status NOT IN ('FINISHED', 'ABORTED', 'ERROR')",
                )?;
                let failed = count(
                    "SELECT COUNT(*) FROM sw_operation WHERE update_id = ?1 AND status = 'ERROR'",
                )?;
                open == 0 && failed > 0
            }
        })
    }
}

/// Durable store of updates and operations.
///
/// Cloning shares the underlying connection.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    metrics: Option<PersistenceMetrics>,
}

impl Store {
    /// Open (or create) the database at `path`.
    ///
    /// Refuses to return a store when the recorded schema version differs
    /// from [`SCHEMA_VERSION`].
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        info!(path = %path.display(), "opening update store");
        Self::initialise(conn)
    }

    /// Open a throwaway in-memory store.
    pub fn open_in_memory() -> Result<Self> {
        Self::initialise(Connection::open_in_memory()?)
    }

    fn initialise(mut conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let initialised: bool = conn.query_row(
            "SELECT EXISTS (SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'system')",
            [],
            |row| row.get(0),
        )?;

        if initialised {
            let found: Option<String> = conn
                .query_row(
                    "SELECT value FROM system WHERE key = ?1",
                    params![KEY_SCHEMA_VERSION],
                    |row| row.get(0),
                )
                .optional()?;
            match found {
                Some(found) if found == SCHEMA_VERSION => {}
                found => {
                    let found = found.unwrap_or_default();
                    error!(
                        found = %found,
                        expected = SCHEMA_VERSION,
                        "database schema version mismatch"
                    );
                    return Err(PersistenceError::SchemaVersionMismatch {
                        found,
                        expected: SCHEMA_VERSION.to_string(),
                    });
                }
            }
        } else {
            info!(version = SCHEMA_VERSION, "creating database schema");
            let tx = conn.transaction()?;
            tx.execute_batch(SCHEMA)?;
            tx.execute(
                "INSERT INTO system (key, value) VALUES (?1, ?2)",
                params![KEY_SCHEMA_VERSION, SCHEMA_VERSION],
            )?;
            tx.commit()?;
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            metrics: None,
        })
    }

    /// Attach transition counters.
    pub fn with_metrics(mut self, metrics: PersistenceMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Remove every update and operation, keeping the schema marker.
    pub fn reset(&self) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let operations = tx.execute("DELETE FROM sw_operation", [])?;
        let updates = tx.execute("DELETE FROM sw_update", [])?;
        tx.commit()?;
        info!(updates, operations, "update store reset");
        Ok(())
    }

    /// Load the update `id`, creating it as `Pending` when unknown.
    pub fn get_or_create_update(&self, id: &str, name: &str) -> Result<UpdateRecord> {
        let conn = self.conn.lock();
        let created = conn.execute(
            "INSERT OR IGNORE INTO sw_update (id, name, status) VALUES (?1, ?2, ?3)",
            params![id, name, Status::Pending],
        )?;
        if created > 0 {
            debug!(update_id = id, "update record created");
            if let Some(metrics) = &self.metrics {
                metrics.record_update(Status::Pending);
            }
        }
        Ok(conn.query_row(
            "SELECT * FROM sw_update WHERE id = ?1",
            params![id],
            UpdateRecord::from_row,
        )?)
    }

    /// Look up an update.
    pub fn update(&self, id: &str) -> Result<Option<UpdateRecord>> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                "SELECT * FROM sw_update WHERE id = ?1",
                params![id],
                UpdateRecord::from_row,
            )
            .optional()?)
    }

    /// All updates in creation order.
    pub fn list_updates(&self) -> Result<Vec<UpdateRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT * FROM sw_update ORDER BY rowid")?;
        let rows = stmt.query_map([], UpdateRecord::from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// `Pending` -> `Started`.
    pub fn start_update(&self, id: &str) -> Result<bool> {
        self.transition_update(id, &[Status::Pending], Status::Started, Barrier::None)
    }

    /// `Started` -> `Finished`, only once every operation is `Finished`.
    pub fn finish_update(&self, id: &str) -> Result<bool> {
        self.transition_update(id, &[Status::Started], Status::Finished, Barrier::AllFinished)
    }

    /// `Pending`/`Started` -> `Aborted`.
    pub fn abort_update(&self, id: &str) -> Result<bool> {
        self.transition_update(
            id,
            &[Status::Pending, Status::Started],
            Status::Aborted,
            Barrier::None,
        )
    }

    /// `Started` -> `Error`, only once every operation has settled and at
    /// least one of them failed.
    pub fn error_update(&self, id: &str) -> Result<bool> {
        self.transition_update(
            id,
            &[Status::Started],
            Status::Error,
            Barrier::SettledWithError,
        )
    }

    fn transition_update(
        &self,
        id: &str,
        from: &[Status],
        to: Status,
        barrier: Barrier,
    ) -> Result<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let current: Status = tx
            .query_row(
                "SELECT status FROM sw_update WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| PersistenceError::UpdateNotFound(id.to_string()))?;

        if !from.contains(&current) || !barrier.holds(&tx, id)? {
            debug!(update_id = id, status = %current, target = %to, "update transition skipped");
            return Ok(false);
        }

        let now = Utc::now();
        if to == Status::Started {
            tx.execute(
                "UPDATE sw_update SET status = ?1, start_time = ?2 WHERE id = ?3",
                params![to, now, id],
            )?;
        } else {
            tx.execute(
                "UPDATE sw_update SET status = ?1, finish_time = ?2 WHERE id = ?3",
                params![to, now, id],
            )?;
        }
        tx.commit()?;

        if let Some(metrics) = &self.metrics {
            metrics.record_update(to);
        }
        info!(update_id = id, from = %current, to = %to, "update status changed");
        Ok(true)
    }

    /// Load operation `id` of `update_id`, creating it as `Pending` when unknown.
    pub fn get_or_create_operation(
        &self,
        update_id: &str,
        id: &str,
        operation_type: &str,
    ) -> Result<OperationRecord> {
        let conn = self.conn.lock();
        let created = conn.execute(
            "INSERT OR IGNORE INTO sw_operation (update_id, id, operation_type, status) \
             VALUES (?1, ?2, ?3, ?4)",
            params![update_id, id, operation_type, Status::Pending],
        )?;
        if created > 0 {
            debug!(update_id, operation_id = id, operation_type, "operation record created");
            if let Some(metrics) = &self.metrics {
                metrics.record_operation(Status::Pending);
            }
        }
        Ok(conn.query_row(
            "SELECT * FROM sw_operation WHERE update_id = ?1 AND id = ?2",
            params![update_id, id],
            OperationRecord::from_row,
        )?)
    }

    /// Look up an operation.
    pub fn operation(&self, update_id: &str, id: &str) -> Result<Option<OperationRecord>> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                "SELECT * FROM sw_operation WHERE update_id = ?1 AND id = ?2",
                params![update_id, id],
                OperationRecord::from_row,
            )
            .optional()?)
    }

    /// Whether the operation completed successfully in an earlier run.
    pub fn is_operation_finished(&self, update_id: &str, id: &str) -> Result<bool> {
        Ok(self
            .operation(update_id, id)?
            .is_some_and(|op| op.status == Status::Finished))
    }

    /// Operations of an update in creation order.
    pub fn operations_for(&self, update_id: &str) -> Result<Vec<OperationRecord>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT * FROM sw_operation WHERE update_id = ?1 ORDER BY rowid")?;
        let rows = stmt.query_map(params![update_id], OperationRecord::from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Mark an operation dispatched. Any status except `Finished` may be
    /// restarted, which clears the previous outcome.
    pub fn start_operation(&self, update_id: &str, id: &str) -> Result<bool> {
        self.transition_operation(
            update_id,
            id,
            &[Status::Pending, Status::Started, Status::Aborted, Status::Error],
            Status::Started,
            None,
        )
    }

    /// `Started` -> `Finished`.
    pub fn finish_operation(&self, update_id: &str, id: &str, result_code: i32) -> Result<bool> {
        self.transition_operation(
            update_id,
            id,
            &[Status::Started],
            Status::Finished,
            Some(result_code),
        )
    }

    /// `Pending`/`Started` -> `Aborted`.
    pub fn abort_operation(&self, update_id: &str, id: &str, result_code: i32) -> Result<bool> {
        self.transition_operation(
            update_id,
            id,
            &[Status::Pending, Status::Started],
            Status::Aborted,
            Some(result_code),
        )
    }

    /// `Started` -> `Error`.
    pub fn error_operation(&self, update_id: &str, id: &str, result_code: i32) -> Result<bool> {
        self.transition_operation(
            update_id,
            id,
            &[Status::Started],
            Status::Error,
            Some(result_code),
        )
    }

    fn transition_operation(
        &self,
        update_id: &str,
        id: &str,
        from: &[Status],
        to: Status,
        result_code: Option<i32>,
    ) -> Result<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let current: Option<Status> = tx
            .query_row(
                "SELECT status FROM sw_operation WHERE update_id = ?1 AND id = ?2",
                params![update_id, id],
                |row| row.get(0),
            )
            .optional()?;

        let Some(current) = current else {
            warn!(update_id, operation_id = id, target = %to, "operation not found");
            return Ok(false);
        };
        if !from.contains(&current) {
            debug!(update_id, operation_id = id, status = %current, target = %to, "operation transition skipped");
            return Ok(false);
        }

        let now = Utc::now();
        if to == Status::Started {
            tx.execute(
                "UPDATE sw_operation SET status = ?1, start_time = ?2, finish_time = NULL, \
                 result_code = NULL WHERE update_id = ?3 AND id = ?4",
                params![to, now, update_id, id],
            )?;
        } else {
            tx.execute(
                "UPDATE sw_operation SET status = ?1, finish_time = ?2, result_code = ?3 \
                 WHERE update_id = ?4 AND id = ?5",
                params![to, now, result_code, update_id, id],
            )?;
        }
        tx.commit()?;

        if let Some(metrics) = &self.metrics {
            metrics.record_operation(to);
        }
        debug!(update_id, operation_id = id, from = %current, to = %to, result_code, "operation status changed");
        Ok(true)
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("metrics", &self.metrics.is_some())
            .finish_non_exhaustive()
    }
}
