//! ---
//! swm_section: "01-core-functionality"
//! swm_subsection: "tests"
//! swm_type: "test"
//! swm_scope: "code"
//! swm_description: "End-to-end update lifecycle through the orchestrator."
//! swm_version: "v0.0.0-prealpha"
//! swm_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use prometheus::Registry;
use swm_common::{AppConfig, InventoryConfig};
use swm_core::{
    InboundRequest, MountError, Mounter, Orchestrator, OrchestratorMetrics, PipelineState,
    HMI_SERVICE, UPDATE_SOURCE_SERVICE,
};
use swm_msg::{ArgValue, Call, InMemoryTransport, OperationResult, ResultCode};
use swm_persistence::{Status, Store};
use tempfile::TempDir;

/// Treats an image as a directory holding `update_manifest.json`.
#[derive(Clone, Default)]
struct DirMounter {
    events: Arc<Mutex<Vec<String>>>,
}

impl Mounter for DirMounter {
    fn mount(&self, image: &Path, mount_point: &Path) -> Result<(), MountError> {
        self.events
            .lock()
            .push(format!("mount {}", image.file_name().unwrap().to_string_lossy()));
        fs::copy(
            image.join("update_manifest.json"),
            mount_point.join("update_manifest.json"),
        )
        .map(|_| ())
        .map_err(|source| MountError::Spawn {
            command: "copy".into(),
            source,
        })
    }

    fn unmount(&self, mount_point: &Path) -> Result<(), MountError> {
        self.events.lock().push("unmount".into());
        let _ = fs::remove_file(mount_point.join("update_manifest.json"));
        Ok(())
    }
}

struct Harness {
    dir: TempDir,
    store: Store,
    transport: InMemoryTransport,
    mounter: DirMounter,
    orchestrator: Orchestrator,
}

impl Harness {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("swlm.sqlite")).unwrap();
        Self::with_store(dir, store, |_| {})
    }

    fn with_store(dir: TempDir, store: Store, tweak: impl FnOnce(&mut AppConfig)) -> Self {
        let mut config = AppConfig::default();
        config.storage.mount_root = dir.path().join("mnt");
        config.inventory = InventoryConfig {
            packages: vec!["bluez_driver".into(), "bluez_apps".into()],
            module_firmware: vec!["ecu1_fw_1.2".into()],
        };
        tweak(&mut config);

        let transport = InMemoryTransport::new();
        let mounter = DirMounter::default();
        let orchestrator = Orchestrator::with_mounter(
            &config,
            store.clone(),
            Arc::new(transport.clone()),
            Box::new(mounter.clone()),
        );
        Self {
            dir,
            store,
            transport,
            mounter,
            orchestrator,
        }
    }

    fn with_metrics(self, metrics: OrchestratorMetrics) -> Self {
        Self {
            orchestrator: self.orchestrator.with_metrics(metrics),
            ..self
        }
    }

    fn image(&self, name: &str, manifest: &str) -> PathBuf {
        let path = self.dir.path().join("images").join(name);
        fs::create_dir_all(&path).unwrap();
        fs::write(path.join("update_manifest.json"), manifest).unwrap();
        path
    }

    fn download(&mut self, image: &Path) {
        self.orchestrator
            .download_complete(image.to_str().unwrap(), "signature");
    }

    fn calls(&self) -> Vec<Call> {
        self.transport.drain_calls()
    }
}

fn methods(calls: &[Call]) -> Vec<String> {
    calls
        .iter()
        .map(|c| format!("{}.{}", c.service, c.method))
        .collect()
}

fn report_results(call: &Call) -> &[OperationResult] {
    match &call.args[1] {
        ArgValue::Results(results) => results,
        other => panic!("unexpected report payload {other:?}"),
    }
}

const SINGLE: &str = r#"{"updateId":"u1","name":"N","description":"D","operations":[
    {"id":"op1","operation":"installPackage","image":"pkg.rpm","hmiMessage":"Installing","timeEstimate":5000}
]}"#;

#[test]
fn availability_either_asks_the_user_or_downloads() {
    let mut h = Harness::new();
    h.orchestrator
        .update_available("u1", "Navigation maps", "sig", true);
    let calls = h.calls();
    assert_eq!(methods(&calls), [format!("{HMI_SERVICE}.updateNotification")]);
    assert_eq!(
        calls[0].args,
        vec![ArgValue::from("u1"), ArgValue::from("Navigation maps")]
    );

    h.orchestrator.update_available("u2", "Radio", "sig", false);
    h.orchestrator.update_confirmation("u1", true);
    let calls = h.calls();
    assert_eq!(
        methods(&calls),
        [
            format!("{UPDATE_SOURCE_SERVICE}.initiateDownload"),
            format!("{UPDATE_SOURCE_SERVICE}.initiateDownload"),
        ]
    );
    assert_eq!(calls[0].args, vec![ArgValue::from("u2")]);
    assert_eq!(calls[1].args, vec![ArgValue::from("u1")]);
}

#[test]
fn declined_update_is_reported_without_loading_anything() {
    let mut h = Harness::new();
    h.orchestrator.update_confirmation("u1", false);
    let calls = h.calls();
    assert_eq!(
        methods(&calls),
        [
            format!("{HMI_SERVICE}.updateReport"),
            format!("{UPDATE_SOURCE_SERVICE}.updateReport"),
        ]
    );
    let results = report_results(&calls[0]);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].id, "N/A");
    assert_eq!(results[0].result_code, ResultCode::UserDeclined.code());
    assert!(h.store.list_updates().unwrap().is_empty());
    assert_eq!(h.orchestrator.state(), PipelineState::Idle);
}

#[test]
fn downloaded_image_runs_to_a_report() {
    let mut h = Harness::new();
    let image = h.image("a", SINGLE);
    h.download(&image);

    assert_eq!(h.orchestrator.state(), PipelineState::OperationInFlight);
    let calls = h.calls();
    assert_eq!(
        methods(&calls),
        [
            format!("{HMI_SERVICE}.manifestStarted"),
            "org.genivi.PackageManager.installPackage".to_string(),
            format!("{HMI_SERVICE}.operationStarted"),
        ]
    );
    assert_eq!(
        calls[0].args,
        vec![ArgValue::from("u1"), ArgValue::Int(5000), ArgValue::from("D")]
    );
    let mount_point = h.orchestrator.processor().mount_point().unwrap().to_path_buf();
    assert_eq!(
        calls[1].args,
        vec![
            ArgValue::Int(1),
            ArgValue::Str(format!("{}/pkg.rpm", mount_point.display())),
            ArgValue::StrList(Vec::new()),
        ]
    );
    assert_eq!(
        calls[2].args,
        vec![ArgValue::from("op1"), ArgValue::Int(5000), ArgValue::from("Installing")]
    );

    h.orchestrator.operation_result(1, 0, "installed");
    let calls = h.calls();
    assert_eq!(
        methods(&calls),
        [
            format!("{HMI_SERVICE}.updateReport"),
            format!("{UPDATE_SOURCE_SERVICE}.updateReport"),
        ]
    );
    assert_eq!(
        report_results(&calls[1]),
        [OperationResult::new("op1", 0, "installed")].as_slice()
    );
    assert_eq!(h.orchestrator.state(), PipelineState::Idle);
    assert_eq!(h.store.update("u1").unwrap().unwrap().status, Status::Finished);
    assert_eq!(*h.mounter.events.lock(), ["mount a", "unmount"]);
}

#[test]
fn callbacks_without_an_active_operation_are_dropped() {
    let mut h = Harness::new();
    h.orchestrator.operation_result(4, 0, "stray");
    assert!(h.calls().is_empty());

    let image = h.image("a", SINGLE);
    h.download(&image);
    h.calls();
    h.orchestrator.operation_result(99, 0, "wrong transaction");
    assert!(h.calls().is_empty());
    assert_eq!(h.orchestrator.state(), PipelineState::OperationInFlight);
    assert_eq!(
        h.store.operation("u1", "op1").unwrap().unwrap().status,
        Status::Started
    );
}

#[test]
fn completed_manifest_is_reported_immediately_on_resupply() {
    let mut h = Harness::new();
    let image = h.image("a", SINGLE);
    h.download(&image);
    h.orchestrator.operation_result(1, 0, "installed");
    h.calls();

    h.download(&image);
    let calls = h.calls();
    assert_eq!(
        methods(&calls),
        [
            format!("{HMI_SERVICE}.manifestStarted"),
            format!("{HMI_SERVICE}.updateReport"),
            format!("{UPDATE_SOURCE_SERVICE}.updateReport"),
        ]
    );
    assert_eq!(calls[0].args[1], ArgValue::Int(0));
    let results = report_results(&calls[1]);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].result_code, ResultCode::AlreadyProcessed.code());
    assert_eq!(h.orchestrator.state(), PipelineState::Idle);
}

#[test]
fn queued_images_run_one_after_another() {
    let mut h = Harness::new();
    let a = h.image("a", SINGLE);
    let b = h.image(
        "b",
        r#"{"updateId":"u2","name":"N2","description":"D2","operations":[
            {"id":"op1","operation":"reboot"}
        ]}"#,
    );
    h.download(&a);
    h.download(&b);
    assert_eq!(h.orchestrator.processor().pending_images(), 1);
    assert_eq!(*h.mounter.events.lock(), ["mount a"]);
    h.calls();

    h.orchestrator.operation_result(1, 0, "installed");
    let calls = h.calls();
    assert_eq!(
        methods(&calls),
        [
            format!("{HMI_SERVICE}.updateReport"),
            format!("{UPDATE_SOURCE_SERVICE}.updateReport"),
            format!("{HMI_SERVICE}.manifestStarted"),
            "org.genivi.LifecycleManager.reboot".to_string(),
            format!("{HMI_SERVICE}.operationStarted"),
        ]
    );
    assert_eq!(calls[3].args[0], ArgValue::Int(2));
    assert_eq!(*h.mounter.events.lock(), ["mount a", "unmount", "mount b"]);

    h.orchestrator.operation_result(2, 0, "rebooted");
    assert_eq!(h.orchestrator.state(), PipelineState::Idle);
    assert_eq!(h.store.update("u2").unwrap().unwrap().status, Status::Finished);
}

#[test]
fn broken_image_does_not_block_the_next_one() {
    let mut h = Harness::new();
    let broken = h.image("broken", r#"{"updateId":"u0"}"#);
    let good = h.image("good", SINGLE);
    h.orchestrator.download_complete(broken.to_str().unwrap(), "sig");
    assert_eq!(h.orchestrator.state(), PipelineState::Idle);
    h.download(&good);
    assert_eq!(h.orchestrator.state(), PipelineState::OperationInFlight);
    assert!(h.store.update("u0").unwrap().is_none());
}

#[test]
fn stalled_operation_expires_and_pipeline_advances() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path().join("swlm.sqlite")).unwrap();
    let h = Harness::with_store(dir, store, |config| {
        config.operations.timeout = Some(Duration::from_secs(60));
    });
    let metrics = OrchestratorMetrics::new(Arc::new(Registry::new())).unwrap();
    let mut h = h.with_metrics(metrics.clone());

    let image = h.image(
        "a",
        r#"{"updateId":"u1","name":"N","description":"D","operations":[
            {"id":"op1","operation":"reboot"},
            {"id":"op2","operation":"stopComponents","components":["nav"]}
        ]}"#,
    );
    h.download(&image);
    h.calls();

    assert!(!h.orchestrator.expire_stalled_operation(Instant::now()));
    assert!(h
        .orchestrator
        .expire_stalled_operation(Instant::now() + Duration::from_secs(61)));

    let calls = h.calls();
    assert_eq!(
        methods(&calls),
        [
            "org.genivi.LifecycleManager.stopComponents".to_string(),
            format!("{HMI_SERVICE}.operationStarted"),
        ]
    );
    assert_eq!(
        h.store.operation("u1", "op1").unwrap().unwrap().status,
        Status::Error
    );
    assert_eq!(metrics.dispatched("reboot"), 1);
    assert_eq!(metrics.dispatched("stopComponents"), 1);

    h.orchestrator.operation_result(2, 0, "stopped");
    assert_eq!(metrics.reports(), 1);
    let calls = h.calls();
    let results = report_results(&calls[0]);
    assert_eq!(results[0].result_code, ResultCode::InternalError.code());
    assert_eq!(h.store.update("u1").unwrap().unwrap().status, Status::Error);
}

#[test]
fn installed_packages_follow_inventory_flags() {
    let mut h = Harness::new();
    assert_eq!(
        h.orchestrator.handle(InboundRequest::GetInstalledPackages {
            include_packages: true,
            include_module_firmware: false,
        }),
        Some(ArgValue::StrList(vec![
            "bluez_driver".into(),
            "bluez_apps".into()
        ]))
    );
    assert_eq!(
        h.orchestrator.get_installed_packages(true, true).len(),
        3
    );
    assert!(h.orchestrator.get_installed_packages(false, false).is_empty());
}
