//! ---
//! swm_section: "01-core-functionality"
//! swm_subsection: "module"
//! swm_type: "source"
//! swm_scope: "code"
//! swm_description: "Manifest and mount failure taxonomy."
//! swm_version: "v0.0.0-prealpha"
//! swm_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::process::ExitStatus;

use swm_persistence::PersistenceError;

/// Result alias for manifest loading.
pub type Result<T> = std::result::Result<T, ManifestError>;

/// Reasons a manifest cannot be loaded. Every variant is fatal to the
/// whole manifest: none of its operations run.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    /// Malformed JSON or a missing mandatory top-level field.
    #[error("malformed manifest: {0}")]
    Parse(#[from] serde_json::Error),
    /// A mandatory argument is absent from an operation record.
    #[error("operation `{operation_id}` is missing mandatory field `{field}`")]
    MissingField {
        /// Owning operation.
        operation_id: String,
        /// Missing argument name.
        field: String,
    },
    /// The operation type has no descriptor.
    #[error("operation `{operation_id}` uses unsupported operation `{operation}`")]
    UnsupportedOperation {
        /// Owning operation.
        operation_id: String,
        /// Unknown operation type key.
        operation: String,
    },
    /// Two operation records share an id.
    #[error("update `{update_id}` lists operation `{operation_id}` more than once")]
    DuplicateOperation {
        /// Owning update.
        update_id: String,
        /// Repeated operation id.
        operation_id: String,
    },
    /// A field is present but carries the wrong type.
    #[error("operation `{operation_id}` field `{field}` must be {expected}")]
    InvalidField {
        /// Owning operation.
        operation_id: String,
        /// Offending field.
        field: String,
        /// Human readable expected type.
        expected: &'static str,
    },
    /// The manifest file could not be read.
    #[error("failed to read manifest {path}: {source}")]
    Io {
        /// Manifest location.
        path: PathBuf,
        /// Underlying failure.
        #[source]
        source: std::io::Error,
    },
    /// The update store rejected a read or write.
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// Mount or unmount failures.
#[derive(Debug, thiserror::Error)]
pub enum MountError {
    /// The configured command template is empty.
    #[error("{0} command is empty")]
    EmptyCommand(&'static str),
    /// The command could not be started.
    #[error("failed to run `{command}`: {source}")]
    Spawn {
        /// Program that was attempted.
        command: String,
        /// Underlying failure.
        #[source]
        source: std::io::Error,
    },
    /// The command ran and reported failure.
    #[error("`{command}` exited with {status}")]
    Failed {
        /// Program that ran.
        command: String,
        /// Exit status.
        status: ExitStatus,
    },
}
