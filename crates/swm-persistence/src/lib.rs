//! ---
//! swm_section: "03-persistence-logging"
//! swm_subsection: "module"
//! swm_type: "source"
//! swm_scope: "code"
//! swm_description: "Durable update and operation records."
//! swm_version: "v0.0.0-prealpha"
//! swm_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! SQLite-backed resume record for software updates.
//!
//! Every mutating call commits before it returns so a crash between two
//! operations never loses progress that was already recorded.

/// Result alias used throughout the persistence crate.
pub type Result<T> = std::result::Result<T, PersistenceError>;

/// Error type for the persistence subsystem.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// Wrapper for IO errors encountered while preparing the database location.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Wrapper for SQLite failures.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// Wrapper for Prometheus metrics registration failures.
    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
    /// The database was written by an incompatible schema.
    #[error("database schema version {found} does not match expected {expected}")]
    SchemaVersionMismatch {
        /// Version stored in the database.
        found: String,
        /// Version this build understands.
        expected: String,
    },
    /// A status column held an unrecognised value.
    #[error(transparent)]
    UnknownStatus(#[from] status::UnknownStatus),
    /// No update row with the given id.
    #[error("update `{0}` not found")]
    UpdateNotFound(String),
}

pub mod metrics;
pub mod status;
pub mod store;

pub use metrics::PersistenceMetrics;
pub use status::Status;
pub use store::{OperationRecord, Store, UpdateRecord, SCHEMA_VERSION};
