//! ---
//! swm_section: "01-core-functionality"
//! swm_subsection: "module"
//! swm_type: "source"
//! swm_scope: "code"
//! swm_description: "Top-level update lifecycle state machine."
//! swm_version: "v0.0.0-prealpha"
//! swm_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::{Duration, Instant};

use swm_common::{AppConfig, InventoryConfig};
use swm_msg::{ArgValue, Message, OperationResult, ResultCode, Transport};
use swm_persistence::Store;
use tracing::{debug, error, info, warn};

use crate::descriptor::DescriptorTable;
use crate::dispatcher::TransactionId;
use crate::manifest::{Dispatch, Manifest};
use crate::metrics::OrchestratorMetrics;
use crate::mount::{CommandMounter, Mounter};
use crate::processor::ManifestProcessor;
use crate::request::InboundRequest;

/// Human-machine interface notifier.
pub const HMI_SERVICE: &str = "org.genivi.hmi";
/// Client that downloads updates and receives final reports.
pub const UPDATE_SOURCE_SERVICE: &str = "org.genivi.SotaClient";

/// Result id used for update-level outcomes.
const UPDATE_LEVEL_ID: &str = "N/A";

/// Composite pipeline state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// No manifest is loaded.
    Idle,
    /// A manifest is loaded and nothing is in flight.
    ManifestLoaded,
    /// An operation awaits its result callback.
    OperationInFlight,
}

/// Drives updates from availability to final report.
pub struct Orchestrator {
    processor: ManifestProcessor,
    transport: Arc<dyn Transport>,
    inventory: InventoryConfig,
    deadline: Option<Duration>,
    metrics: Option<OrchestratorMetrics>,
}

impl Orchestrator {
    pub fn new(
        processor: ManifestProcessor,
        transport: Arc<dyn Transport>,
        inventory: InventoryConfig,
        deadline: Option<Duration>,
    ) -> Self {
        Self {
            processor,
            transport,
            inventory,
            deadline,
            metrics: None,
        }
    }

    /// Assemble the pipeline described by `config` with the command based mounter.
    pub fn from_config(config: &AppConfig, store: Store, transport: Arc<dyn Transport>) -> Self {
        Self::with_mounter(
            config,
            store,
            transport,
            Box::new(CommandMounter::from_config(&config.storage)),
        )
    }

    /// Like [`Orchestrator::from_config`] with a caller supplied mounter.
    pub fn with_mounter(
        config: &AppConfig,
        store: Store,
        transport: Arc<dyn Transport>,
        mounter: Box<dyn Mounter>,
    ) -> Self {
        let table = DescriptorTable::new(&config.operations);
        let processor = ManifestProcessor::new(&config.storage, table, store, mounter);
        Self::new(
            processor,
            transport,
            config.inventory.clone(),
            config.operations.deadline(),
        )
    }

    pub fn with_metrics(mut self, metrics: OrchestratorMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn state(&self) -> PipelineState {
        match self.processor.current_manifest() {
            None => PipelineState::Idle,
            Some(manifest) if manifest.active_operation().is_some() => {
                PipelineState::OperationInFlight
            }
            Some(_) => PipelineState::ManifestLoaded,
        }
    }

    pub fn current_manifest(&self) -> Option<&Manifest> {
        self.processor.current_manifest()
    }

    pub fn processor(&self) -> &ManifestProcessor {
        &self.processor
    }

    /// Handle one decoded inbound call. Only queries produce a value.
    pub fn handle(&mut self, request: InboundRequest) -> Option<ArgValue> {
        match request {
            InboundRequest::UpdateAvailable {
                update_id,
                description,
                signature,
                request_confirmation,
            } => self.update_available(&update_id, &description, &signature, request_confirmation),
            InboundRequest::UpdateConfirmation {
                update_id,
                approved,
            } => self.update_confirmation(&update_id, approved),
            InboundRequest::DownloadComplete {
                image_path,
                signature,
            } => self.download_complete(&image_path, &signature),
            InboundRequest::OperationResult {
                transaction_id,
                result_code,
                result_text,
            } => self.operation_result(transaction_id, result_code, &result_text),
            InboundRequest::GetInstalledPackages {
                include_packages,
                include_module_firmware,
            } => {
                return Some(ArgValue::StrList(
                    self.get_installed_packages(include_packages, include_module_firmware),
                ))
            }
        }
        None
    }

    /// An update can be downloaded. Either ask the user first or start the
    /// download right away.
    pub fn update_available(
        &mut self,
        update_id: &str,
        description: &str,
        signature: &str,
        request_confirmation: bool,
    ) {
        info!(update_id, request_confirmation, signature_len = signature.len(), "update available");
        if request_confirmation {
            self.notify(
                HMI_SERVICE,
                "updateNotification",
                vec![update_id.into(), description.into()],
            );
        } else {
            self.initiate_download(update_id);
        }
    }

    pub fn update_confirmation(&mut self, update_id: &str, approved: bool) {
        info!(update_id, approved, "update confirmation received");
        if approved {
            self.initiate_download(update_id);
        } else {
            self.distribute_report(
                update_id,
                vec![OperationResult::with_code(
                    UPDATE_LEVEL_ID,
                    ResultCode::UserDeclined,
                    "Installation declined by user",
                )],
            );
        }
    }

    /// A downloaded image is ready. Its signature is not verified.
    pub fn download_complete(&mut self, image_path: &str, signature: &str) {
        info!(image = image_path, signature_len = signature.len(), "download complete");
        debug!(image = image_path, "image signature accepted without verification");
        self.processor.queue_image(image_path);
        self.start_next_operation();
    }

    /// Result callback from an executor.
    pub fn operation_result(
        &mut self,
        transaction_id: TransactionId,
        result_code: i32,
        result_text: &str,
    ) {
        let Some(manifest) = self.processor.current_manifest_mut() else {
            warn!(transaction_id, result_code, "no manifest to handle operation result");
            return;
        };
        let operation = manifest
            .active_operation()
            .map(|active| active.item.operation.as_str());
        if !manifest.complete_operation(transaction_id, result_code, result_text) {
            return;
        }
        if let (Some(metrics), Some(operation)) = (&self.metrics, operation) {
            metrics.record_completed(operation, result_code == ResultCode::Ok.code());
        }
        self.start_next_operation();
    }

    /// Installed software known to this node.
    pub fn get_installed_packages(
        &self,
        include_packages: bool,
        include_module_firmware: bool,
    ) -> Vec<String> {
        let mut installed = Vec::new();
        if include_packages {
            installed.extend(self.inventory.packages.iter().cloned());
        }
        if include_module_firmware {
            installed.extend(self.inventory.module_firmware.iter().cloned());
        }
        installed
    }

    /// Make progress: load a manifest if none is loaded, otherwise dispatch
    /// its next operation. Exhausted manifests are reported and the next
    /// queued image is loaded.
    ///
    /// Returns `true` while an operation is in flight.
    pub fn start_next_operation(&mut self) -> bool {
        let Some(manifest) = self.processor.current_manifest() else {
            return self.start_next_manifest();
        };
        if manifest.active_operation().is_some() {
            return true;
        }
        match self.dispatch_next() {
            Some(true) => true,
            Some(false) => false,
            None => {
                self.report_current_manifest();
                self.start_next_manifest()
            }
        }
    }

    /// Fail an operation that outlived the configured deadline and advance.
    pub fn expire_stalled_operation(&mut self, now: Instant) -> bool {
        let Some(deadline) = self.deadline else {
            return false;
        };
        let Some(manifest) = self.processor.current_manifest_mut() else {
            return false;
        };
        let operation = manifest
            .active_operation()
            .map(|active| active.item.operation.as_str());
        if !manifest.expire(now, deadline) {
            return false;
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_expired();
            if let Some(operation) = operation {
                metrics.record_completed(operation, false);
            }
        }
        self.start_next_operation();
        true
    }

    /// Unmount whatever is mounted.
    pub fn shutdown(&mut self) {
        if self.state() == PipelineState::OperationInFlight {
            warn!("shutting down with an operation in flight");
        }
        self.processor.release();
    }

    /// Load queued images until one yields an operation to run. Manifests
    /// with nothing left to do are reported immediately.
    fn start_next_manifest(&mut self) -> bool {
        loop {
            if !self.processor.load_next_manifest() {
                if self.processor.pending_images() == 0 {
                    return false;
                }
                continue;
            }
            if let Some(manifest) = self.processor.current_manifest() {
                self.notify(
                    HMI_SERVICE,
                    "manifestStarted",
                    vec![
                        manifest.update_id().into(),
                        ArgValue::Int(clamp_ms(manifest.total_time_estimate_ms())),
                        manifest.description().into(),
                    ],
                );
            }
            match self.dispatch_next() {
                Some(in_flight) => return in_flight,
                None => self.report_current_manifest(),
            }
        }
    }

    /// `Some(true)` when an operation was started, `Some(false)` when the
    /// transport refused it and `None` when the manifest is exhausted.
    fn dispatch_next(&mut self) -> Option<bool> {
        match self.processor.dispatch_next(self.transport.as_ref(), Instant::now()) {
            Dispatch::Started(_) => {
                self.inform_operation_started();
                Some(true)
            }
            Dispatch::Busy => Some(true),
            Dispatch::SendFailed => {
                warn!("dispatch stalled until the next trigger");
                Some(false)
            }
            Dispatch::Exhausted => None,
        }
    }

    fn inform_operation_started(&self) {
        let Some(active) = self
            .processor
            .current_manifest()
            .and_then(Manifest::active_operation)
        else {
            return;
        };
        if let Some(metrics) = &self.metrics {
            metrics.record_dispatched(active.item.operation.as_str());
        }
        self.notify(
            HMI_SERVICE,
            "operationStarted",
            vec![
                active.item.operation_id.as_str().into(),
                ArgValue::Int(clamp_ms(active.item.time_estimate_ms)),
                active.item.hmi_message.as_str().into(),
            ],
        );
    }

    fn report_current_manifest(&mut self) {
        if let Some(manifest) = self.processor.current_manifest() {
            let update_id = manifest.update_id().to_string();
            let results = manifest.results().to_vec();
            self.distribute_report(&update_id, results);
        }
    }

    fn initiate_download(&self, update_id: &str) {
        self.notify(UPDATE_SOURCE_SERVICE, "initiateDownload", vec![update_id.into()]);
    }

    /// Send the final results to the HMI and the update source.
    fn distribute_report(&self, update_id: &str, results: Vec<OperationResult>) {
        info!(update_id, results = results.len(), "distributing update report");
        if let Some(metrics) = &self.metrics {
            metrics.record_report();
        }
        for service in [HMI_SERVICE, UPDATE_SOURCE_SERVICE] {
            self.notify(
                service,
                "updateReport",
                vec![update_id.into(), ArgValue::Results(results.clone())],
            );
        }
    }

    fn notify(&self, service: &str, method: &str, args: Vec<ArgValue>) {
        if let Err(err) = self.transport.send(Message::call(service, method, args)) {
            error!(service, method, transport = self.transport.name(), error = %err, "failed to send notification");
        }
    }
}

fn clamp_ms(ms: u64) -> i64 {
    i64::try_from(ms).unwrap_or(i64::MAX)
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("processor", &self.processor)
            .field("transport", &self.transport.name())
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}
