//! ---
//! swm_section: "02-messaging-ipc-data-model"
//! swm_subsection: "module"
//! swm_type: "source"
//! swm_scope: "code"
//! swm_description: "Bus message schema and result codes."
//! swm_version: "v0.0.0-prealpha"
//! swm_owner: "tbd"
//! ---
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Schema version broadcast alongside every message payload.
pub const SCHEMA_VERSION: u16 = 1;

/// Typed argument carried by a bus call.
///
/// Values are tagged on the wire so that an empty list still tells the
/// receiver which element type it holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ArgValue {
    /// UTF-8 string.
    Str(String),
    /// Signed integer.
    Int(i64),
    /// Boolean flag.
    Bool(bool),
    /// List of strings (package names, components, blacklists).
    StrList(Vec<String>),
    /// Aggregated operation results of an update report.
    Results(Vec<OperationResult>),
}

impl ArgValue {
    /// Borrow the string payload, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ArgValue::Str(value) => Some(value),
            _ => None,
        }
    }

    /// Integer payload, if this is an integer.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            ArgValue::Int(value) => Some(*value),
            _ => None,
        }
    }

    /// Boolean payload, if this is a flag.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ArgValue::Bool(value) => Some(*value),
            _ => None,
        }
    }
}

impl From<&str> for ArgValue {
    fn from(value: &str) -> Self {
        ArgValue::Str(value.to_owned())
    }
}

impl From<String> for ArgValue {
    fn from(value: String) -> Self {
        ArgValue::Str(value)
    }
}

impl From<i64> for ArgValue {
    fn from(value: i64) -> Self {
        ArgValue::Int(value)
    }
}

impl From<bool> for ArgValue {
    fn from(value: bool) -> Self {
        ArgValue::Bool(value)
    }
}

impl From<Vec<String>> for ArgValue {
    fn from(values: Vec<String>) -> Self {
        ArgValue::StrList(values)
    }
}

impl From<Vec<OperationResult>> for ArgValue {
    fn from(values: Vec<OperationResult>) -> Self {
        ArgValue::Results(values)
    }
}

/// Result codes shared by the orchestrator and every executor.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum ResultCode {
    Ok = 0,
    AlreadyProcessed = 1,
    DependencyFailure = 2,
    ValidationFailed = 3,
    InstallFailed = 4,
    UpgradeFailed = 5,
    RemovalFailed = 6,
    FlashFailed = 7,
    CreatePartitionFailed = 8,
    DeletePartitionFailed = 9,
    ResizePartitionFailed = 10,
    WritePartitionFailed = 11,
    PatchPartitionFailed = 12,
    UserDeclined = 13,
    OperationBlacklisted = 14,
    DiskFull = 15,
    NotFound = 16,
    OldVersion = 17,
    InternalError = 18,
    GeneralError = 19,
}

impl ResultCode {
    const ALL: [ResultCode; 20] = [
        ResultCode::Ok,
        ResultCode::AlreadyProcessed,
        ResultCode::DependencyFailure,
        ResultCode::ValidationFailed,
        ResultCode::InstallFailed,
        ResultCode::UpgradeFailed,
        ResultCode::RemovalFailed,
        ResultCode::FlashFailed,
        ResultCode::CreatePartitionFailed,
        ResultCode::DeletePartitionFailed,
        ResultCode::ResizePartitionFailed,
        ResultCode::WritePartitionFailed,
        ResultCode::PatchPartitionFailed,
        ResultCode::UserDeclined,
        ResultCode::OperationBlacklisted,
        ResultCode::DiskFull,
        ResultCode::NotFound,
        ResultCode::OldVersion,
        ResultCode::InternalError,
        ResultCode::GeneralError,
    ];

    /// Look up a code received over the bus.
    pub fn from_code(code: i32) -> Option<Self> {
        usize::try_from(code)
            .ok()
            .and_then(|index| Self::ALL.get(index).copied())
    }

    /// Numeric wire value.
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Clamp an arbitrary executor code into the known range.
    pub fn normalize(code: i32) -> i32 {
        Self::from_code(code)
            .unwrap_or(ResultCode::GeneralError)
            .code()
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.code())
    }
}

/// One entry of an update report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationResult {
    /// Operation identifier from the manifest, `N/A` for update-level results.
    pub id: String,
    /// Result code, see [`ResultCode`].
    pub result_code: i32,
    /// Human readable outcome.
    pub result_text: String,
}

impl OperationResult {
    /// Build a result entry, normalising unknown codes to `GeneralError`.
    pub fn new(id: impl Into<String>, code: i32, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            result_code: ResultCode::normalize(code),
            result_text: text.into(),
        }
    }

    /// Build a result entry from a well-known code.
    pub fn with_code(id: impl Into<String>, code: ResultCode, text: impl Into<String>) -> Self {
        Self::new(id, code.code(), text)
    }
}

/// Remote method invocation addressed to a named service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
    /// Target service name, e.g. `org.genivi.PackageManager`.
    pub service: String,
    /// Method on the target service.
    pub method: String,
    /// Ordered, typed arguments.
    #[serde(default)]
    pub args: Vec<ArgValue>,
}

impl Call {
    /// Construct a call.
    pub fn new(service: impl Into<String>, method: impl Into<String>, args: Vec<ArgValue>) -> Self {
        Self {
            service: service.into(),
            method: method.into(),
            args,
        }
    }
}

/// Synchronous acknowledgement returned for an inbound call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    /// Identifier of the message being answered.
    pub in_reply_to: Uuid,
    /// Whether the callee accepted the call.
    pub accepted: bool,
    /// Optional return value (query methods only).
    #[serde(default)]
    pub value: Option<ArgValue>,
}

/// Payload variants carried on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum MessagePayload {
    /// Method invocation.
    Call(Call),
    /// Acknowledgement of a call.
    Reply(Reply),
}

/// Unified message structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique identifier for correlation and tracing.
    pub id: Uuid,
    /// Version of the schema used by the payload.
    pub schema_version: u16,
    /// Timestamp when the message was created.
    pub timestamp: DateTime<Utc>,
    /// Actual payload carried by the message.
    pub payload: MessagePayload,
}

impl Message {
    /// Construct a new message envelope around the provided payload.
    pub fn new(payload: MessagePayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            schema_version: SCHEMA_VERSION,
            timestamp: Utc::now(),
            payload,
        }
    }

    /// Convenience constructor for a call message.
    pub fn call(service: impl Into<String>, method: impl Into<String>, args: Vec<ArgValue>) -> Self {
        Self::new(MessagePayload::Call(Call::new(service, method, args)))
    }

    /// Build the acknowledgement for this message.
    pub fn reply(&self, accepted: bool, value: Option<ArgValue>) -> Self {
        Self::new(MessagePayload::Reply(Reply {
            in_reply_to: self.id,
            accepted,
            value,
        }))
    }

    /// Payload kind as a static string.
    pub fn kind(&self) -> &'static str {
        match &self.payload {
            MessagePayload::Call(_) => "call",
            MessagePayload::Reply(_) => "reply",
        }
    }

    /// Borrow the call payload, if any.
    pub fn as_call(&self) -> Option<&Call> {
        match &self.payload {
            MessagePayload::Call(call) => Some(call),
            MessagePayload::Reply(_) => None,
        }
    }
}
