//! Copyright © 2025-2026 Wenze Wei. All Rights Reserved.
//!
//! This file is part of Zi.
//! The Zi project belongs to the Dunimd project team.

#![cfg(unix)]

#[path = "support.rs"]
mod support;

use std::sync::Arc;

use support::{build_archive, manifest_json, script_archive, wait_for_state, ECHO_SCRIPT};
use tempfile::TempDir;
use zi_orbit::{
    ZiActiveState, ZiError, ZiManager, ZiManifest, ZiMemoryRecordStore, ZiPluginId, ZiPluginRecord,
    ZiProcessRunner, ZiReportedState, ZiRunner, ZiRuntimeConfigBuilder,
};

fn record(id: &str, plugin: &str, active_state: ZiActiveState) -> ZiPluginRecord {
    ZiPluginRecord {
        id: id.to_string(),
        manifest: ZiManifest::parse(&manifest_json(plugin)).unwrap(),
        active_state,
    }
}

fn setup(root: &TempDir) -> (Arc<ZiMemoryRecordStore>, Arc<dyn ZiRunner>, ZiManager) {
    let store = Arc::new(ZiMemoryRecordStore::new());
    let runner: Arc<dyn ZiRunner> = Arc::new(ZiProcessRunner::new(
        ZiRuntimeConfigBuilder::new()
            .work_root(root.path())
            .stop_grace_ms(500)
            .build(),
    ));
    let manager = ZiManager::new(store.clone(), Arc::clone(&runner));
    (store, runner, manager)
}

#[tokio::test]
async fn test_activate_loads_and_starts() {
    let root = tempfile::tempdir().unwrap();
    let (store, runner, manager) = setup(&root);
    store.insert(record("r1", "echo", ZiActiveState::Inactive), script_archive("echo", ECHO_SCRIPT));

    manager.set_active_state("r1", ZiActiveState::Active).await.unwrap();
    let session = runner.get_session(&ZiPluginId::new("echo")).await.unwrap();
    assert_eq!(session.state(), ZiReportedState::Active);

    // Repeating the request changes nothing.
    manager.set_active_state("r1", ZiActiveState::Active).await.unwrap();
    assert_eq!(runner.get_sessions().await.len(), 1);
    assert_eq!(manager.reported_state("r1").await.unwrap().state, ZiReportedState::Active);

    manager.set_active_state("r1", ZiActiveState::Inactive).await.unwrap();
    assert_eq!(session.state(), ZiReportedState::Inactive);
    manager.set_active_state("r1", ZiActiveState::Inactive).await.unwrap();

    // Reactivation reuses the loaded session.
    manager.set_active_state_str("r1", "active").await.unwrap();
    let again = runner.get_session(&ZiPluginId::new("echo")).await.unwrap();
    assert!(Arc::ptr_eq(&session, &again));
    manager.set_active_state_str("r1", "inactive").await.unwrap();
}

#[tokio::test]
async fn test_deactivate_without_session_succeeds() {
    let root = tempfile::tempdir().unwrap();
    let (store, runner, manager) = setup(&root);
    store.insert(record("r1", "echo", ZiActiveState::Active), script_archive("echo", ECHO_SCRIPT));

    manager.set_active_state("r1", ZiActiveState::Inactive).await.unwrap();
    assert!(runner.get_sessions().await.is_empty());
    let report = manager.reported_state("r1").await.unwrap();
    assert_eq!(report.state, ZiReportedState::Inactive);
    assert_eq!(report.error, None);
}

#[tokio::test]
async fn test_unknown_state_and_record_are_errors() {
    let root = tempfile::tempdir().unwrap();
    let (store, _runner, manager) = setup(&root);
    store.insert(record("r1", "echo", ZiActiveState::Inactive), script_archive("echo", ECHO_SCRIPT));

    let err = manager.set_active_state_str("r1", "paused").await.unwrap_err();
    assert!(matches!(err, ZiError::Validation { .. }));
    assert!(err.to_string().contains("unknown desired state"));

    let err = manager.set_active_state("missing", ZiActiveState::Active).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_archive_must_match_record_manifest() {
    let root = tempfile::tempdir().unwrap();
    let (store, runner, manager) = setup(&root);
    store.insert(record("r1", "expected", ZiActiveState::Inactive), script_archive("actual", ECHO_SCRIPT));

    let err = manager.set_active_state("r1", ZiActiveState::Active).await.unwrap_err();
    assert!(matches!(err, ZiError::Validation { .. }), "unexpected error {:?}", err);
    assert!(runner.get_sessions().await.is_empty());
}

#[tokio::test]
async fn test_reported_state_carries_error_note() {
    let root = tempfile::tempdir().unwrap();
    let (store, runner, manager) = setup(&root);
    store.insert(
        record("r1", "crash", ZiActiveState::Active),
        script_archive("crash", "#!/bin/sh\nexit 1\n"),
    );

    manager.set_active_state("r1", ZiActiveState::Active).await.unwrap();
    let session = runner.get_session(&ZiPluginId::new("crash")).await.unwrap();
    wait_for_state(&session, ZiReportedState::Errored).await;

    let report = manager.reported_state("r1").await.unwrap();
    assert_eq!(report.state, ZiReportedState::Errored);
    assert!(report.error.is_some());
}

#[tokio::test]
async fn test_restore_starts_desired_plugins_and_reports_failures() {
    let root = tempfile::tempdir().unwrap();
    let (store, runner, manager) = setup(&root);
    store.insert(record("r1", "echo", ZiActiveState::Active), script_archive("echo", ECHO_SCRIPT));
    store.insert(record("r2", "idle", ZiActiveState::Inactive), script_archive("idle", ECHO_SCRIPT));
    store.insert(
        record("r3", "broken", ZiActiveState::Active),
        build_archive(&[("manifest.json", &manifest_json("broken"), 0o644)]),
    );

    let failures = manager.restore().await.unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].record_id, "r3");
    assert!(failures[0].error.to_string().contains("missing main executable"));

    let echo = runner.get_session(&ZiPluginId::new("echo")).await.unwrap();
    assert_eq!(echo.state(), ZiReportedState::Active);
    assert!(runner.get_session(&ZiPluginId::new("idle")).await.unwrap_err().is_not_found());

    runner.stop_plugin(echo.id()).await.unwrap();
}
