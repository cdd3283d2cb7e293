//! ---
//! swm_section: "01-core-functionality"
//! swm_subsection: "module"
//! swm_type: "source"
//! swm_scope: "code"
//! swm_description: "Parsed update manifest with dispatch and result tracking."
//! swm_version: "v0.0.0-prealpha"
//! swm_owner: "tbd"
//! ---
use std::collections::{HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::Deserialize;
use serde_json::Value;
use swm_msg::{OperationResult, ResultCode, Transport};
use swm_persistence::Store;
use tracing::{debug, error, info, warn};

use crate::descriptor::{DescriptorTable, OnFailure};
use crate::dispatcher::{self, ManifestOperation, TransactionId, WorkItem};
use crate::error::{ManifestError, Result};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawManifest {
    update_id: String,
    name: String,
    description: String,
    #[serde(default)]
    show_progress: bool,
    #[serde(default)]
    show_result: bool,
    #[serde(default)]
    get_user_confirmation: bool,
    #[serde(default)]
    allow_downgrade: Option<bool>,
    #[serde(default)]
    operations: Vec<Value>,
}

/// Source of monotonically increasing transaction ids. The first id is 1.
#[derive(Debug, Default)]
pub struct TransactionIds {
    last: TransactionId,
}

impl TransactionIds {
    /// Mint the next id.
    pub fn next_id(&mut self) -> TransactionId {
        self.last += 1;
        self.last
    }
}

/// Operation dispatched and awaiting its result callback.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveOperation {
    pub item: WorkItem,
    pub transaction_id: TransactionId,
    pub dispatched_at: Instant,
}

/// Outcome of [`Manifest::start_next_operation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// The head of the queue was sent and is now active.
    Started(TransactionId),
    /// Nothing left to dispatch.
    Exhausted,
    /// The transport refused the call; the operation stays queued.
    SendFailed,
    /// An operation is already in flight.
    Busy,
}

/// One update's operations plus progress and result tracking.
#[derive(Debug)]
pub struct Manifest {
    update_id: String,
    name: String,
    description: String,
    show_progress: bool,
    show_result: bool,
    get_user_confirmation: bool,
    allow_downgrade: Option<bool>,
    mount_point: PathBuf,
    queue: VecDeque<WorkItem>,
    active: Option<ActiveOperation>,
    results: Vec<OperationResult>,
    store: Store,
}

impl Manifest {
    /// Read and load the manifest file at `path`.
    pub fn load_from_file(
        path: &Path,
        mount_point: &Path,
        table: &DescriptorTable,
        store: &Store,
    ) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|source| ManifestError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::load(&text, mount_point, table, store)
    }

    /// Parse `text` and build the work queue.
    ///
    /// Operations already `Finished` in the store are reported as already
    /// processed and not queued. Any unsupported or malformed operation
    /// fails the whole load before the store is touched.
    pub fn load(
        text: &str,
        mount_point: &Path,
        table: &DescriptorTable,
        store: &Store,
    ) -> Result<Self> {
        let raw: RawManifest = serde_json::from_str(text)?;
        let overridden;
        let table = match raw.allow_downgrade {
            Some(allow) => {
                overridden = table.with_allow_downgrade(allow);
                &overridden
            }
            None => table,
        };

        let mut queue = VecDeque::new();
        let mut results = Vec::new();
        let mut seen = HashSet::new();
        for value in &raw.operations {
            let Some(record) = ManifestOperation::from_value(value) else {
                warn!(update_id = %raw.update_id, "skipping manifest operation without id");
                continue;
            };
            if !seen.insert(record.id.clone()) {
                return Err(ManifestError::DuplicateOperation {
                    update_id: raw.update_id,
                    operation_id: record.id,
                });
            }
            if store.is_operation_finished(&raw.update_id, &record.id)? {
                debug!(update_id = %raw.update_id, operation_id = %record.id, "operation already processed");
                results.push(OperationResult::with_code(
                    record.id.clone(),
                    ResultCode::AlreadyProcessed,
                    "Operation already processed",
                ));
                continue;
            }
            queue.push_back(dispatcher::prepare(table, &record, mount_point)?);
        }

        store.get_or_create_update(&raw.update_id, &raw.name)?;
        store.start_update(&raw.update_id)?;
        for item in &queue {
            store.get_or_create_operation(&raw.update_id, &item.operation_id, item.operation.as_str())?;
        }

        info!(
            update_id = %raw.update_id,
            name = %raw.name,
            queued = queue.len(),
            already_processed = results.len(),
            mount_point = %mount_point.display(),
            "manifest loaded"
        );

        let manifest = Self {
            update_id: raw.update_id,
            name: raw.name,
            description: raw.description,
            show_progress: raw.show_progress,
            show_result: raw.show_result,
            get_user_confirmation: raw.get_user_confirmation,
            allow_downgrade: raw.allow_downgrade,
            mount_point: mount_point.to_path_buf(),
            queue,
            active: None,
            results,
            store: store.clone(),
        };
        // Nothing to run: every operation finished in an earlier run or the
        // manifest lists none.
        if manifest.queue.is_empty() {
            manifest.settle_update();
        }
        Ok(manifest)
    }

    pub fn update_id(&self) -> &str {
        &self.update_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn show_progress(&self) -> bool {
        self.show_progress
    }

    pub fn show_result(&self) -> bool {
        self.show_result
    }

    pub fn get_user_confirmation(&self) -> bool {
        self.get_user_confirmation
    }

    /// Manifest-level downgrade override, if the manifest set one.
    pub fn allow_downgrade(&self) -> Option<bool> {
        self.allow_downgrade
    }

    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    /// Operations waiting to be dispatched.
    pub fn pending(&self) -> impl Iterator<Item = &WorkItem> {
        self.queue.iter()
    }

    pub fn pending_len(&self) -> usize {
        self.queue.len()
    }

    pub fn active_operation(&self) -> Option<&ActiveOperation> {
        self.active.as_ref()
    }

    /// Results accumulated so far, in completion order.
    pub fn results(&self) -> &[OperationResult] {
        &self.results
    }

    /// Sum of the time estimates of every queued operation.
    pub fn total_time_estimate_ms(&self) -> u64 {
        self.queue.iter().map(|item| item.time_estimate_ms).sum()
    }

    /// Nothing queued and nothing in flight.
    pub fn is_exhausted(&self) -> bool {
        self.queue.is_empty() && self.active.is_none()
    }

    /// Dispatch the head of the queue.
    pub fn start_next_operation(
        &mut self,
        transport: &dyn Transport,
        transactions: &mut TransactionIds,
        now: Instant,
    ) -> Dispatch {
        if let Some(active) = &self.active {
            warn!(
                update_id = %self.update_id,
                operation_id = %active.item.operation_id,
                transaction_id = active.transaction_id,
                "operation already in flight"
            );
            return Dispatch::Busy;
        }
        let Some(item) = self.queue.pop_front() else {
            return Dispatch::Exhausted;
        };

        let transaction_id = transactions.next_id();
        if let Err(err) = dispatcher::send(transport, &item, transaction_id) {
            error!(
                update_id = %self.update_id,
                operation_id = %item.operation_id,
                transaction_id,
                transport = transport.name(),
                error = %err,
                "failed to dispatch operation"
            );
            self.queue.push_front(item);
            return Dispatch::SendFailed;
        }

        if let Err(err) = self.store.start_operation(&self.update_id, &item.operation_id) {
            error!(update_id = %self.update_id, operation_id = %item.operation_id, error = %err, "failed to record operation start");
        }
        info!(
            update_id = %self.update_id,
            operation_id = %item.operation_id,
            operation = %item.operation,
            transaction_id,
            "operation dispatched"
        );
        self.active = Some(ActiveOperation {
            item,
            transaction_id,
            dispatched_at: now,
        });
        Dispatch::Started(transaction_id)
    }

    /// Record the result of the active operation.
    ///
    /// Returns `false` without touching the store when no operation is in
    /// flight or `transaction_id` belongs to another dispatch.
    pub fn complete_operation(
        &mut self,
        transaction_id: TransactionId,
        result_code: i32,
        result_text: &str,
    ) -> bool {
        let matches = self
            .active
            .as_ref()
            .is_some_and(|active| active.transaction_id == transaction_id);
        if !matches {
            warn!(
                update_id = %self.update_id,
                transaction_id,
                active = ?self.active.as_ref().map(|a| a.transaction_id),
                "no active operation for transaction"
            );
            return false;
        }
        let Some(active) = self.active.take() else {
            return false;
        };

        let result = OperationResult::new(active.item.operation_id.clone(), result_code, result_text);
        let succeeded = result.result_code == ResultCode::Ok.code();
        let recorded = if succeeded {
            self.store
                .finish_operation(&self.update_id, &result.id, result.result_code)
        } else {
            self.store
                .error_operation(&self.update_id, &result.id, result.result_code)
        };
        if let Err(err) = recorded {
            error!(update_id = %self.update_id, operation_id = %result.id, error = %err, "failed to record operation result");
        }

        info!(
            update_id = %self.update_id,
            operation_id = %result.id,
            transaction_id,
            result_code = result.result_code,
            result_text = %result.result_text,
            "operation completed"
        );
        self.results.push(result);

        if !succeeded && active.item.on_failure == OnFailure::Abort {
            self.abort_remaining(&active.item.operation_id);
        } else {
            self.settle_update();
        }
        true
    }

    /// Fail the active operation with `InternalError` once `deadline` has
    /// elapsed since dispatch.
    pub fn expire(&mut self, now: Instant, deadline: Duration) -> bool {
        let Some(active) = &self.active else {
            return false;
        };
        if now.saturating_duration_since(active.dispatched_at) < deadline {
            return false;
        }
        let transaction_id = active.transaction_id;
        warn!(
            update_id = %self.update_id,
            operation_id = %active.item.operation_id,
            transaction_id,
            deadline_secs = deadline.as_secs(),
            "operation deadline expired"
        );
        self.complete_operation(
            transaction_id,
            ResultCode::InternalError.code(),
            "Operation timed out",
        )
    }

    fn abort_remaining(&mut self, failed: &str) {
        let text = format!("Aborted after failure of operation {failed}");
        for item in self.queue.drain(..) {
            if let Err(err) = self.store.abort_operation(
                &self.update_id,
                &item.operation_id,
                ResultCode::GeneralError.code(),
            ) {
                error!(update_id = %self.update_id, operation_id = %item.operation_id, error = %err, "failed to record operation abort");
            }
            self.results.push(OperationResult::with_code(
                item.operation_id,
                ResultCode::GeneralError,
                text.clone(),
            ));
        }
        match self.store.abort_update(&self.update_id) {
            Ok(_) => warn!(update_id = %self.update_id, operation_id = failed, "update aborted"),
            Err(err) => error!(update_id = %self.update_id, error = %err, "failed to abort update"),
        }
    }

    fn settle_update(&self) {
        let settled = self
            .store
            .finish_update(&self.update_id)
            .and_then(|finished| {
                if finished {
                    Ok(true)
                } else {
                    self.store.error_update(&self.update_id)
                }
            });
        if let Err(err) = settled {
            error!(update_id = %self.update_id, error = %err, "failed to settle update status");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use swm_common::OperationsConfig;
    use swm_msg::{ArgValue, InMemoryTransport, Message, MessagingError};
    use swm_persistence::Status;

    const SINGLE: &str = r#"{"updateId":"u1","name":"N","description":"D","operations":[{"id":"op1","operation":"installPackage","image":"pkg.rpm"}]}"#;

    struct BrokenTransport;

    impl Transport for BrokenTransport {
        fn send(&self, _msg: Message) -> swm_msg::Result<()> {
            Err(MessagingError::Closed)
        }

        fn name(&self) -> &'static str {
            "broken"
        }
    }

    fn table() -> DescriptorTable {
        DescriptorTable::new(&OperationsConfig::default())
    }

    fn load(text: &str, store: &Store) -> Result<Manifest> {
        Manifest::load(text, Path::new("/tmp/swlm/1"), &table(), store)
    }

    fn status(store: &Store, op: &str) -> Status {
        store.operation("u1", op).unwrap().unwrap().status
    }

    #[test]
    fn single_operation_runs_to_finished() {
        let store = Store::open_in_memory().unwrap();
        let transport = InMemoryTransport::new();
        let mut ids = TransactionIds::default();

        let mut manifest = load(SINGLE, &store).unwrap();
        assert_eq!(manifest.pending_len(), 1);
        assert_eq!(store.update("u1").unwrap().unwrap().status, Status::Started);

        assert_eq!(
            manifest.start_next_operation(&transport, &mut ids, Instant::now()),
            Dispatch::Started(1)
        );
        let calls = transport.drain_calls();
        assert_eq!(calls[0].method, "installPackage");
        assert_eq!(
            calls[0].args,
            vec![
                ArgValue::Int(1),
                ArgValue::Str("/tmp/swlm/1/pkg.rpm".into()),
                ArgValue::StrList(Vec::new()),
            ]
        );
        assert_eq!(status(&store, "op1"), Status::Started);

        assert!(manifest.complete_operation(1, 0, "ok"));
        assert_eq!(status(&store, "op1"), Status::Finished);
        assert_eq!(store.update("u1").unwrap().unwrap().status, Status::Finished);
        assert_eq!(
            manifest.results(),
            [OperationResult::new("op1", 0, "ok")].as_slice()
        );
        assert!(manifest.is_exhausted());
    }

    #[test]
    fn reload_after_finish_reports_already_processed() {
        let store = Store::open_in_memory().unwrap();
        let transport = InMemoryTransport::new();
        let mut ids = TransactionIds::default();
        let mut manifest = load(SINGLE, &store).unwrap();
        manifest.start_next_operation(&transport, &mut ids, Instant::now());
        manifest.complete_operation(1, 0, "ok");

        let reloaded = load(SINGLE, &store).unwrap();
        assert_eq!(reloaded.pending_len(), 0);
        assert_eq!(reloaded.results().len(), 1);
        assert_eq!(reloaded.results()[0].id, "op1");
        assert_eq!(
            reloaded.results()[0].result_code,
            ResultCode::AlreadyProcessed.code()
        );
    }

    #[test]
    fn reload_settles_update_left_started_by_a_crash() {
        let store = Store::open_in_memory().unwrap();
        load(SINGLE, &store).unwrap();
        store.start_operation("u1", "op1").unwrap();
        store.finish_operation("u1", "op1", 0).unwrap();
        assert_eq!(store.update("u1").unwrap().unwrap().status, Status::Started);

        let reloaded = load(SINGLE, &store).unwrap();
        assert!(reloaded.is_exhausted());
        let update = store.update("u1").unwrap().unwrap();
        assert_eq!(update.status, Status::Finished);
        assert!(update.finish_time.is_some());
    }

    #[test]
    fn manifest_without_operations_finishes_on_load() {
        let store = Store::open_in_memory().unwrap();
        let manifest = load(
            r#"{"updateId":"u1","name":"N","description":"D","operations":[]}"#,
            &store,
        )
        .unwrap();
        assert!(manifest.is_exhausted());
        assert!(manifest.results().is_empty());
        assert_eq!(store.update("u1").unwrap().unwrap().status, Status::Finished);
    }

    #[test]
    fn repeated_operation_id_rejects_the_manifest() {
        let store = Store::open_in_memory().unwrap();
        let text = r#"{"updateId":"u1","name":"N","description":"D","operations":[
            {"id":"op1","operation":"reboot"},
            {"id":"op1","operation":"reboot"}
        ]}"#;
        let err = load(text, &store).unwrap_err();
        assert!(matches!(
            err,
            ManifestError::DuplicateOperation { ref update_id, ref operation_id }
                if update_id == "u1" && operation_id == "op1"
        ));
        assert!(store.update("u1").unwrap().is_none());
    }

    #[test]
    fn stale_callback_is_dropped_without_store_writes() {
        let store = Store::open_in_memory().unwrap();
        let mut manifest = load(SINGLE, &store).unwrap();
        let before = store.operation("u1", "op1").unwrap();

        assert!(!manifest.complete_operation(1, 0, "late"));
        assert!(manifest.results().is_empty());
        assert_eq!(store.operation("u1", "op1").unwrap(), before);

        let transport = InMemoryTransport::new();
        let mut ids = TransactionIds::default();
        manifest.start_next_operation(&transport, &mut ids, Instant::now());
        assert!(!manifest.complete_operation(7, 0, "wrong transaction"));
        assert_eq!(status(&store, "op1"), Status::Started);
        assert!(manifest.active_operation().is_some());
    }

    #[test]
    fn missing_top_level_field_is_a_parse_error() {
        let store = Store::open_in_memory().unwrap();
        let err = load(r#"{"updateId":"u1","name":"N","operations":[]}"#, &store).unwrap_err();
        assert!(matches!(err, ManifestError::Parse(_)));
        assert!(matches!(load("{", &store), Err(ManifestError::Parse(_))));
        assert!(store.list_updates().unwrap().is_empty());
    }

    #[test]
    fn one_bad_operation_rejects_the_whole_manifest() {
        let store = Store::open_in_memory().unwrap();
        let text = r#"{"updateId":"u1","name":"N","description":"D","operations":[
            {"id":"op1","operation":"installPackage","image":"a.rpm"},
            {"id":"op2","operation":"removePackage"}
        ]}"#;
        let err = load(text, &store).unwrap_err();
        assert!(matches!(err, ManifestError::MissingField { ref field, .. } if field == "packageId"));
        assert!(store.operations_for("u1").unwrap().is_empty());
    }

    #[test]
    fn operations_without_id_are_skipped() {
        let store = Store::open_in_memory().unwrap();
        let text = r#"{"updateId":"u1","name":"N","description":"D","operations":[
            {"operation":"reboot"},
            {"id":"op2","operation":"reboot","timeEstimate":250}
        ]}"#;
        let manifest = load(text, &store).unwrap();
        assert_eq!(manifest.pending_len(), 1);
        assert_eq!(manifest.total_time_estimate_ms(), 250);
    }

    #[test]
    fn send_failure_keeps_operation_queued() {
        let store = Store::open_in_memory().unwrap();
        let mut ids = TransactionIds::default();
        let mut manifest = load(SINGLE, &store).unwrap();

        assert_eq!(
            manifest.start_next_operation(&BrokenTransport, &mut ids, Instant::now()),
            Dispatch::SendFailed
        );
        assert!(manifest.active_operation().is_none());
        assert_eq!(manifest.pending_len(), 1);
        assert_eq!(status(&store, "op1"), Status::Pending);

        let transport = InMemoryTransport::new();
        assert_eq!(
            manifest.start_next_operation(&transport, &mut ids, Instant::now()),
            Dispatch::Started(2)
        );
        assert_eq!(
            manifest.start_next_operation(&transport, &mut ids, Instant::now()),
            Dispatch::Busy
        );
    }

    #[test]
    fn abort_on_failure_discards_remaining_operations() {
        let store = Store::open_in_memory().unwrap();
        let transport = InMemoryTransport::new();
        let mut ids = TransactionIds::default();
        let text = r#"{"updateId":"u1","name":"N","description":"D","operations":[
            {"id":"op1","operation":"installPackage","image":"a.rpm","onFailure":"abort"},
            {"id":"op2","operation":"installPackage","image":"b.rpm"},
            {"id":"op3","operation":"reboot"}
        ]}"#;
        let mut manifest = load(text, &store).unwrap();
        manifest.start_next_operation(&transport, &mut ids, Instant::now());
        assert!(manifest.complete_operation(1, ResultCode::InstallFailed.code(), "disk full"));

        assert!(manifest.is_exhausted());
        let codes: Vec<_> = manifest
            .results()
            .iter()
            .map(|r| (r.id.as_str(), r.result_code))
            .collect();
        assert_eq!(codes, [("op1", 4), ("op2", 19), ("op3", 19)]);
        assert_eq!(status(&store, "op1"), Status::Error);
        assert_eq!(status(&store, "op2"), Status::Aborted);
        assert_eq!(store.update("u1").unwrap().unwrap().status, Status::Aborted);
    }

    #[test]
    fn continue_on_failure_settles_update_as_error() {
        let store = Store::open_in_memory().unwrap();
        let transport = InMemoryTransport::new();
        let mut ids = TransactionIds::default();
        let text = r#"{"updateId":"u1","name":"N","description":"D","operations":[
            {"id":"op1","operation":"reboot"},
            {"id":"op2","operation":"removePackage","packageId":"nav","onFailure":"continue"}
        ]}"#;
        let mut manifest = load(text, &store).unwrap();

        manifest.start_next_operation(&transport, &mut ids, Instant::now());
        manifest.complete_operation(1, 77, "unknown failure");
        assert_eq!(manifest.results()[0].result_code, ResultCode::GeneralError.code());
        assert_eq!(manifest.pending_len(), 1);
        assert_eq!(store.update("u1").unwrap().unwrap().status, Status::Started);

        manifest.start_next_operation(&transport, &mut ids, Instant::now());
        manifest.complete_operation(2, 0, "removed");
        assert_eq!(store.update("u1").unwrap().unwrap().status, Status::Error);
    }

    #[test]
    fn expired_operation_fails_with_internal_error() {
        let store = Store::open_in_memory().unwrap();
        let transport = InMemoryTransport::new();
        let mut ids = TransactionIds::default();
        let mut manifest = load(SINGLE, &store).unwrap();
        let dispatched = Instant::now();
        manifest.start_next_operation(&transport, &mut ids, dispatched);

        let deadline = Duration::from_secs(30);
        assert!(!manifest.expire(dispatched + Duration::from_secs(10), deadline));
        assert!(manifest.expire(dispatched + deadline, deadline));
        assert_eq!(
            manifest.results()[0].result_code,
            ResultCode::InternalError.code()
        );
        assert_eq!(status(&store, "op1"), Status::Error);
        assert!(!manifest.complete_operation(1, 0, "too late"));
    }

    #[test]
    fn manifest_flag_overrides_downgrade_default() {
        let store = Store::open_in_memory().unwrap();
        let text = r#"{"updateId":"u1","name":"N","description":"D","allowDowngrade":true,
            "operations":[{"id":"op1","operation":"upgradePackage","image":"a.rpm"}]}"#;
        let manifest = load(text, &store).unwrap();
        assert_eq!(manifest.allow_downgrade(), Some(true));
        let item = manifest.pending().next().unwrap();
        assert_eq!(item.args[2], ArgValue::Bool(true));
    }
}
