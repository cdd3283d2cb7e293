//! ---
//! swm_section: "01-core-functionality"
//! swm_subsection: "module"
//! swm_type: "source"
//! swm_scope: "code"
//! swm_description: "Manifest processing and update orchestration."
//! swm_version: "v0.0.0-prealpha"
//! swm_owner: "tbd"
//! ---
//! Orchestration core of the software loading manager: the descriptor
//! table, manifest model, image queue and the update state machine.

pub mod descriptor;
pub mod dispatcher;
pub mod error;
pub mod manifest;
pub mod metrics;
pub mod mount;
pub mod orchestrator;
pub mod processor;
pub mod request;

pub use descriptor::{DescriptorTable, OnFailure, OperationDescriptor, OperationType};
pub use dispatcher::{build_call, ManifestOperation, TransactionId, WorkItem};
pub use error::{ManifestError, MountError};
pub use manifest::{ActiveOperation, Dispatch, Manifest, TransactionIds};
pub use metrics::OrchestratorMetrics;
pub use mount::{CommandMounter, Mounter};
pub use orchestrator::{Orchestrator, PipelineState, HMI_SERVICE, UPDATE_SOURCE_SERVICE};
pub use processor::ManifestProcessor;
pub use request::{InboundRequest, RequestError, SERVICE_NAME};
