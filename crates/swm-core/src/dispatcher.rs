//! ---
//! swm_section: "01-core-functionality"
//! swm_subsection: "module"
//! swm_type: "source"
//! swm_scope: "code"
//! swm_description: "Turns manifest operation records into executor calls."
//! swm_version: "v0.0.0-prealpha"
//! swm_owner: "tbd"
//! ---
use std::path::Path;

use serde_json::{Map, Value};
use swm_msg::{ArgValue, Message, Transport};
use tracing::debug;

use crate::descriptor::{
    ArgKind, DescriptorTable, OnFailure, OperationDescriptor, OperationType, IMAGE_ARGUMENT,
};
use crate::error::{ManifestError, Result};

/// Correlates a dispatched call with its asynchronous result callback.
pub type TransactionId = i64;

/// Operation record as it appears in a manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestOperation {
    pub id: String,
    pub operation: Option<String>,
    pub fields: Map<String, Value>,
}

impl ManifestOperation {
    /// Extract a record from a manifest `operations` entry. Entries that
    /// are not objects or carry no string `id` yield `None`.
    pub fn from_value(value: &Value) -> Option<Self> {
        let fields = value.as_object()?;
        let id = fields.get("id")?.as_str()?.to_string();
        let operation = fields
            .get("operation")
            .and_then(Value::as_str)
            .map(str::to_string);
        Some(Self {
            id,
            operation,
            fields: fields.clone(),
        })
    }

    fn invalid(&self, field: &str, expected: &'static str) -> ManifestError {
        ManifestError::InvalidField {
            operation_id: self.id.clone(),
            field: field.to_string(),
            expected,
        }
    }
}

/// Dispatchable operation built at manifest load time.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    pub operation_id: String,
    pub operation: OperationType,
    pub service: &'static str,
    pub method: &'static str,
    pub args: Vec<ArgValue>,
    pub time_estimate_ms: u64,
    pub hmi_message: String,
    pub on_failure: OnFailure,
}

/// Resolve the record's operation type and build its work item.
pub fn prepare(
    table: &DescriptorTable,
    record: &ManifestOperation,
    mount_point: &Path,
) -> Result<WorkItem> {
    let operation = record
        .operation
        .as_deref()
        .ok_or_else(|| ManifestError::MissingField {
            operation_id: record.id.clone(),
            field: "operation".to_string(),
        })?;
    let descriptor = table
        .resolve(operation)
        .ok_or_else(|| ManifestError::UnsupportedOperation {
            operation_id: record.id.clone(),
            operation: operation.to_string(),
        })?;
    build_call(descriptor, record, mount_point)
}

/// Build the ordered arguments for `record` according to `descriptor`.
///
/// Present fields are taken from the record, absent ones fall back to the
/// descriptor default, and a missing mandatory field fails the build. The
/// `image` argument is rewritten to live under `mount_point`.
pub fn build_call(
    descriptor: &OperationDescriptor,
    record: &ManifestOperation,
    mount_point: &Path,
) -> Result<WorkItem> {
    let mut args = Vec::with_capacity(descriptor.args.len());
    for spec in &descriptor.args {
        let value = match record.fields.get(spec.name) {
            Some(raw) => convert(record, spec.name, spec.kind, raw)?,
            None => spec
                .default
                .clone()
                .ok_or_else(|| ManifestError::MissingField {
                    operation_id: record.id.clone(),
                    field: spec.name.to_string(),
                })?,
        };
        let value = match value {
            ArgValue::Str(path) if spec.name == IMAGE_ARGUMENT => {
                ArgValue::Str(format!("{}/{}", mount_point.display(), path))
            }
            other => other,
        };
        args.push(value);
    }

    let time_estimate_ms = match record.fields.get("timeEstimate") {
        Some(raw) => raw
            .as_u64()
            .ok_or_else(|| record.invalid("timeEstimate", "a non-negative integer"))?,
        None => descriptor.scheduling.time_estimate_ms,
    };
    let hmi_message = match record.fields.get("hmiMessage") {
        Some(raw) => raw
            .as_str()
            .ok_or_else(|| record.invalid("hmiMessage", "a string"))?
            .to_string(),
        None => String::new(),
    };
    let on_failure = match record.fields.get("onFailure").map(Value::as_str) {
        Some(Some("abort")) => OnFailure::Abort,
        Some(Some("continue")) => OnFailure::Continue,
        Some(_) => return Err(record.invalid("onFailure", "`abort` or `continue`")),
        None => descriptor.scheduling.on_failure,
    };

    debug!(
        operation_id = %record.id,
        operation = %descriptor.operation,
        service = descriptor.service,
        method = descriptor.method,
        args = args.len(),
        "operation prepared"
    );

    Ok(WorkItem {
        operation_id: record.id.clone(),
        operation: descriptor.operation,
        service: descriptor.service,
        method: descriptor.method,
        args,
        time_estimate_ms,
        hmi_message,
        on_failure,
    })
}

fn convert(
    record: &ManifestOperation,
    field: &str,
    kind: ArgKind,
    raw: &Value,
) -> Result<ArgValue> {
    let converted = match kind {
        ArgKind::Str => raw.as_str().map(|s| ArgValue::Str(s.to_string())),
        ArgKind::Int => raw.as_i64().map(ArgValue::Int),
        ArgKind::Bool => raw.as_bool().map(ArgValue::Bool),
        ArgKind::StrList => raw.as_array().and_then(|items| {
            items
                .iter()
                .map(|item| item.as_str().map(str::to_string))
                .collect::<Option<Vec<_>>>()
                .map(ArgValue::StrList)
        }),
    };
    converted.ok_or_else(|| record.invalid(field, kind.expected()))
}

/// Send the work item as a call whose first argument is the transaction id.
pub fn send(
    transport: &dyn Transport,
    item: &WorkItem,
    transaction_id: TransactionId,
) -> swm_msg::Result<()> {
    let mut args = Vec::with_capacity(item.args.len() + 1);
    args.push(ArgValue::Int(transaction_id));
    args.extend(item.args.iter().cloned());
    transport.send(Message::call(item.service, item.method, args))
}
