//! ---
//! swm_section: "02-messaging-ipc-data-model"
//! swm_subsection: "module"
//! swm_type: "source"
//! swm_scope: "code"
//! swm_description: "Bus message schema, result codes and transports."
//! swm_version: "v0.0.0-prealpha"
//! swm_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Messaging primitives shared by the software loading manager daemon, its
//! control CLI and the orchestration core.

pub mod logging;
pub mod transport;
pub mod types;

/// Shared result type for messaging operations.
pub type Result<T> = std::result::Result<T, MessagingError>;

/// Errors raised while encoding or delivering bus messages.
#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    /// Wrapper for IO errors encountered during messaging operations.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Wrapper for JSON serialization or deserialization problems.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    /// No endpoint is configured for the addressed service.
    #[error("no endpoint configured for service `{0}`")]
    UnknownEndpoint(String),
    /// Only call messages can be routed by service name.
    #[error("cannot route {0} message")]
    Unroutable(&'static str),
    /// The transport writer has shut down.
    #[error("transport closed")]
    Closed,
    /// The peer hung up before answering.
    #[error("connection closed before a reply was received")]
    NoReply,
}

pub use logging::{log_message, MessageDirection, MessagingMetricsExporter};
pub use transport::{
    decode_line, encode_line, request, InMemoryTransport, TcpTransport, Transport,
};
pub use types::{
    ArgValue, Call, Message, MessagePayload, OperationResult, Reply, ResultCode, SCHEMA_VERSION,
};
