//! ---
//! swm_section: "15-testing-qa-runbook"
//! swm_subsection: "integration-tests"
//! swm_type: "source"
//! swm_scope: "code"
//! swm_description: "Restart, resume and image queue draining against a file-backed store."
//! swm_version: "v0.0.0-prealpha"
//! swm_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use swm_common::AppConfig;
use swm_core::{Orchestrator, PipelineState, HMI_SERVICE, UPDATE_SOURCE_SERVICE};
use swm_msg::{ArgValue, Call, InMemoryTransport, OperationResult, ResultCode};
use swm_persistence::{Status, Store};
use tempfile::TempDir;

const THREE_STEPS: &str = r#"{
    "updateId": "nav-2024.1",
    "name": "Navigation",
    "description": "Navigation stack refresh",
    "operations": [
        {"id": "install-maps", "operation": "installPackage", "image": "maps.rpm"},
        {"id": "restart", "operation": "reboot", "timeEstimate": 4000},
        {"id": "stop-nav", "operation": "stopComponents", "components": ["nav"], "timeEstimate": 2000}
    ]
}"#;

/// Mounting is a `cp` of the manifest file, unmounting removes the copy.
fn config(root: &Path) -> AppConfig {
    let raw = format!(
        r#"
        [database]
        path = "{db}"

        [storage]
        mount_root = "{mnt}"
        mount_command = ["cp", "{{image_path}}", "{{mount_point}}/update_manifest.json"]
        unmount_command = ["rm", "-f", "{{mount_point}}/update_manifest.json"]
        "#,
        db = root.join("swlm.sqlite").display(),
        mnt = root.join("mnt").display(),
    );
    raw.parse().expect("valid test configuration")
}

fn write_image(root: &Path, name: &str, manifest: &str) -> PathBuf {
    let path = root.join(format!("{name}.json"));
    fs::write(&path, manifest).unwrap();
    path
}

fn start(root: &TempDir) -> (Orchestrator, InMemoryTransport, Store) {
    let config = config(root.path());
    let store = Store::open(&config.database.path).unwrap();
    let transport = InMemoryTransport::new();
    let orchestrator =
        Orchestrator::from_config(&config, store.clone(), Arc::new(transport.clone()));
    (orchestrator, transport, store)
}

fn executor_calls(calls: &[Call]) -> Vec<(String, i64)> {
    calls
        .iter()
        .filter(|call| call.service != HMI_SERVICE && call.service != UPDATE_SOURCE_SERVICE)
        .map(|call| (call.method.clone(), call.args[0].as_int().unwrap()))
        .collect()
}

fn reports(calls: &[Call]) -> Vec<(String, Vec<OperationResult>)> {
    calls
        .iter()
        .filter(|call| call.service == UPDATE_SOURCE_SERVICE && call.method == "updateReport")
        .map(|call| match (&call.args[0], &call.args[1]) {
            (ArgValue::Str(id), ArgValue::Results(results)) => (id.clone(), results.clone()),
            other => panic!("unexpected report arguments {other:?}"),
        })
        .collect()
}

#[test]
fn interrupted_update_resumes_after_restart() {
    let root = tempfile::tempdir().unwrap();
    let image = write_image(root.path(), "nav", THREE_STEPS);

    {
        let (mut orchestrator, transport, store) = start(&root);
        orchestrator.download_complete(image.to_str().unwrap(), "sig");
        orchestrator.operation_result(1, 0, "maps installed");
        assert_eq!(
            executor_calls(&transport.drain_calls()),
            [("installPackage".to_string(), 1), ("reboot".to_string(), 2)]
        );
        assert_eq!(
            store.operation("nav-2024.1", "restart").unwrap().unwrap().status,
            Status::Started
        );
        // The process goes away while the reboot is in flight.
    }

    let (mut orchestrator, transport, store) = start(&root);
    orchestrator.download_complete(image.to_str().unwrap(), "sig");
    let calls = transport.drain_calls();
    let started = calls
        .iter()
        .find(|call| call.method == "manifestStarted")
        .expect("manifestStarted sent");
    assert_eq!(started.args[1], ArgValue::Int(6000));
    assert_eq!(executor_calls(&calls), [("reboot".to_string(), 1)]);

    orchestrator.operation_result(1, 0, "rebooted");
    orchestrator.operation_result(2, 0, "stopped");
    let calls = transport.drain_calls();
    let reports = reports(&calls);
    assert_eq!(reports.len(), 1);
    let (update_id, results) = &reports[0];
    assert_eq!(update_id, "nav-2024.1");
    let codes: Vec<_> = results
        .iter()
        .map(|r| (r.id.as_str(), r.result_code))
        .collect();
    assert_eq!(
        codes,
        [
            ("install-maps", ResultCode::AlreadyProcessed.code()),
            ("restart", 0),
            ("stop-nav", 0),
        ]
    );
    assert_eq!(orchestrator.state(), PipelineState::Idle);

    let update = store.update("nav-2024.1").unwrap().unwrap();
    assert_eq!(update.status, Status::Finished);
    assert!(update.finish_time.is_some());
    assert!(store
        .operations_for("nav-2024.1")
        .unwrap()
        .iter()
        .all(|op| op.status == Status::Finished));
}

#[test]
fn queued_images_drain_in_arrival_order() {
    let root = tempfile::tempdir().unwrap();
    let (mut orchestrator, transport, store) = start(&root);
    let manifest = |id: &str| {
        format!(
            r#"{{"updateId":"{id}","name":"{id}","description":"d","operations":[
                {{"id":"op","operation":"removePackage","packageId":"{id}-pkg"}}
            ]}}"#
        )
    };
    let first = write_image(root.path(), "first", &manifest("first"));
    let broken = write_image(root.path(), "broken", "{\"updateId\": ");
    let missing = root.path().join("never-downloaded.json");
    let last = write_image(root.path(), "last", &manifest("last"));

    orchestrator.download_complete(first.to_str().unwrap(), "sig");
    for image in [&broken, &missing, &last] {
        orchestrator.download_complete(image.to_str().unwrap(), "sig");
    }
    assert_eq!(orchestrator.processor().pending_images(), 3);

    orchestrator.operation_result(1, 0, "removed");
    assert_eq!(orchestrator.processor().pending_images(), 0);
    assert_eq!(
        orchestrator.current_manifest().map(|m| m.update_id()),
        Some("last")
    );
    orchestrator.operation_result(2, ResultCode::RemovalFailed.code(), "busy");

    let calls = transport.drain_calls();
    let order: Vec<_> = reports(&calls).into_iter().map(|(id, _)| id).collect();
    assert_eq!(order, ["first", "last"]);
    assert_eq!(orchestrator.state(), PipelineState::Idle);
    assert_eq!(store.update("first").unwrap().unwrap().status, Status::Finished);
    assert_eq!(store.update("last").unwrap().unwrap().status, Status::Error);
    assert_eq!(store.list_updates().unwrap().len(), 2);
}
