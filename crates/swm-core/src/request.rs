//! ---
//! swm_section: "01-core-functionality"
//! swm_subsection: "module"
//! swm_type: "source"
//! swm_scope: "code"
//! swm_description: "Decoding of inbound orchestrator calls."
//! swm_version: "v0.0.0-prealpha"
//! swm_owner: "tbd"
//! ---
use swm_msg::{ArgValue, Call};

use crate::dispatcher::TransactionId;

/// Service name the orchestrator answers to.
pub const SERVICE_NAME: &str = "org.genivi.SoftwareLoadingManager";

pub const UPDATE_AVAILABLE: &str = "updateAvailable";
pub const UPDATE_CONFIRMATION: &str = "updateConfirmation";
pub const DOWNLOAD_COMPLETE: &str = "downloadComplete";
pub const OPERATION_RESULT: &str = "operationResult";
pub const GET_INSTALLED_PACKAGES: &str = "getInstalledPackages";

/// Why an inbound call could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("unknown method `{0}`")]
    UnknownMethod(String),
    #[error("`{method}` argument {index} must be {expected}")]
    BadArgument {
        method: &'static str,
        index: usize,
        expected: &'static str,
    },
}

/// Typed form of every call the orchestrator accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundRequest {
    UpdateAvailable {
        update_id: String,
        description: String,
        signature: String,
        request_confirmation: bool,
    },
    UpdateConfirmation {
        update_id: String,
        approved: bool,
    },
    DownloadComplete {
        image_path: String,
        signature: String,
    },
    OperationResult {
        transaction_id: TransactionId,
        result_code: i32,
        result_text: String,
    },
    GetInstalledPackages {
        include_packages: bool,
        include_module_firmware: bool,
    },
}

struct Args<'a> {
    method: &'static str,
    args: &'a [ArgValue],
}

impl Args<'_> {
    fn get<T>(
        &self,
        index: usize,
        expected: &'static str,
        extract: impl FnOnce(&ArgValue) -> Option<T>,
    ) -> Result<T, RequestError> {
        self.args
            .get(index)
            .and_then(extract)
            .ok_or(RequestError::BadArgument {
                method: self.method,
                index,
                expected,
            })
    }

    fn string(&self, index: usize) -> Result<String, RequestError> {
        self.get(index, "a string", |v| v.as_str().map(str::to_string))
    }

    fn flag(&self, index: usize) -> Result<bool, RequestError> {
        self.get(index, "a boolean", ArgValue::as_bool)
    }

    fn int(&self, index: usize) -> Result<i64, RequestError> {
        self.get(index, "an integer", ArgValue::as_int)
    }
}

impl InboundRequest {
    /// Decode a call addressed to the orchestrator.
    pub fn from_call(call: &Call) -> Result<Self, RequestError> {
        let method = match call.method.as_str() {
            UPDATE_AVAILABLE => UPDATE_AVAILABLE,
            UPDATE_CONFIRMATION => UPDATE_CONFIRMATION,
            DOWNLOAD_COMPLETE => DOWNLOAD_COMPLETE,
            OPERATION_RESULT => OPERATION_RESULT,
            GET_INSTALLED_PACKAGES => GET_INSTALLED_PACKAGES,
            other => return Err(RequestError::UnknownMethod(other.to_string())),
        };
        let args = Args {
            method,
            args: &call.args,
        };

        Ok(match method {
            UPDATE_AVAILABLE => InboundRequest::UpdateAvailable {
                update_id: args.string(0)?,
                description: args.string(1)?,
                signature: args.string(2)?,
                request_confirmation: args.flag(3)?,
            },
            UPDATE_CONFIRMATION => InboundRequest::UpdateConfirmation {
                update_id: args.string(0)?,
                approved: args.flag(1)?,
            },
            DOWNLOAD_COMPLETE => InboundRequest::DownloadComplete {
                image_path: args.string(0)?,
                signature: args.string(1)?,
            },
            OPERATION_RESULT => InboundRequest::OperationResult {
                transaction_id: args.int(0)?,
                result_code: i32::try_from(args.int(1)?).unwrap_or(i32::MAX),
                result_text: args.string(2)?,
            },
            _ => InboundRequest::GetInstalledPackages {
                include_packages: args.flag(0)?,
                include_module_firmware: args.flag(1)?,
            },
        })
    }

    /// Method name on the wire.
    pub fn method(&self) -> &'static str {
        match self {
            InboundRequest::UpdateAvailable { .. } => UPDATE_AVAILABLE,
            InboundRequest::UpdateConfirmation { .. } => UPDATE_CONFIRMATION,
            InboundRequest::DownloadComplete { .. } => DOWNLOAD_COMPLETE,
            InboundRequest::OperationResult { .. } => OPERATION_RESULT,
            InboundRequest::GetInstalledPackages { .. } => GET_INSTALLED_PACKAGES,
        }
    }

    /// Encode as a call to the orchestrator.
    pub fn into_call(self) -> Call {
        let method = self.method();
        let args = match self {
            InboundRequest::UpdateAvailable {
                update_id,
                description,
                signature,
                request_confirmation,
            } => vec![
                update_id.into(),
                description.into(),
                signature.into(),
                request_confirmation.into(),
            ],
            InboundRequest::UpdateConfirmation {
                update_id,
                approved,
            } => vec![update_id.into(), approved.into()],
            InboundRequest::DownloadComplete {
                image_path,
                signature,
            } => vec![image_path.into(), signature.into()],
            InboundRequest::OperationResult {
                transaction_id,
                result_code,
                result_text,
            } => vec![
                transaction_id.into(),
                i64::from(result_code).into(),
                result_text.into(),
            ],
            InboundRequest::GetInstalledPackages {
                include_packages,
                include_module_firmware,
            } => vec![include_packages.into(), include_module_firmware.into()],
        };
        Call::new(SERVICE_NAME, method, args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_what_it_encodes() {
        let requests = [
            InboundRequest::UpdateAvailable {
                update_id: "u1".into(),
                description: "Maps".into(),
                signature: "sig".into(),
                request_confirmation: true,
            },
            InboundRequest::OperationResult {
                transaction_id: 3,
                result_code: 0,
                result_text: "ok".into(),
            },
            InboundRequest::GetInstalledPackages {
                include_packages: true,
                include_module_firmware: false,
            },
        ];
        for request in requests {
            let call = request.clone().into_call();
            assert_eq!(call.service, SERVICE_NAME);
            assert_eq!(InboundRequest::from_call(&call), Ok(request));
        }
    }

    #[test]
    fn rejects_unknown_methods_and_bad_arguments() {
        let unknown = Call::new(SERVICE_NAME, "reboot", Vec::new());
        assert_eq!(
            InboundRequest::from_call(&unknown),
            Err(RequestError::UnknownMethod("reboot".into()))
        );

        let short = Call::new(SERVICE_NAME, UPDATE_CONFIRMATION, vec!["u1".into()]);
        assert_eq!(
            InboundRequest::from_call(&short),
            Err(RequestError::BadArgument {
                method: UPDATE_CONFIRMATION,
                index: 1,
                expected: "a boolean",
            })
        );

        let wrong = Call::new(SERVICE_NAME, OPERATION_RESULT, vec!["1".into(), ArgValue::Int(0), "ok".into()]);
        assert!(matches!(
            InboundRequest::from_call(&wrong),
            Err(RequestError::BadArgument { index: 0, .. })
        ));
    }
}
