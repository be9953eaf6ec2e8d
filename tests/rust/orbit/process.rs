//! Copyright © 2025-2026 Wenze Wei. All Rights Reserved.
//!
//! This file is part of Zi.
//! The Zi project belongs to the Dunimd project team.

#![cfg(unix)]

#[path = "support.rs"]
mod support;

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde_json::json;
use support::{build_archive, dir_entries, manifest_json, script_archive, wait_for_state, ECHO_SCRIPT};
use tempfile::TempDir;
use zi_orbit::{
    build_runner, ZiError, ZiPluginId, ZiProcessRunner, ZiReportedState, ZiRunner,
    ZiRuntimeConfigBuilder,
};

fn runner(root: &TempDir) -> ZiProcessRunner {
    ZiProcessRunner::new(
        ZiRuntimeConfigBuilder::new()
            .work_root(root.path())
            .stop_grace_ms(500)
            .command_timeout_ms(5_000)
            .build(),
    )
}

#[tokio::test]
async fn test_load_registers_inactive_session() {
    let root = tempfile::tempdir().unwrap();
    let runner = runner(&root);
    let bin = script_archive("search", ECHO_SCRIPT);

    let manifest = runner.validate(&bin).await.unwrap();
    let session = runner.load(&bin).await.unwrap();
    assert_eq!(session.id(), &manifest.id);
    assert_eq!(session.state(), ZiReportedState::Inactive);

    let fetched = runner.get_session(&manifest.id).await.unwrap();
    assert!(Arc::ptr_eq(&session, &fetched));
    assert_eq!(runner.get_sessions().await.len(), 1);
    assert_eq!(dir_entries(root.path()), 0, "load must not extract");
}

#[tokio::test]
async fn test_second_load_of_same_id_is_rejected() {
    let root = tempfile::tempdir().unwrap();
    let runner = runner(&root);
    let bin = script_archive("search", ECHO_SCRIPT);

    let first = runner.load(&bin).await.unwrap();
    let err = runner.load(&bin).await.unwrap_err();
    assert!(matches!(err, ZiError::AlreadyLoaded { .. }));

    let kept = runner.get_session(first.id()).await.unwrap();
    assert!(Arc::ptr_eq(&first, &kept));
}

#[tokio::test]
async fn test_invalid_archive_never_registers() {
    let root = tempfile::tempdir().unwrap();
    let runner = runner(&root);
    let bin = build_archive(&[("manifest.json", &manifest_json("broken"), 0o644)]);

    let err = runner.load(&bin).await.unwrap_err();
    assert!(err.to_string().contains("missing main executable"));
    assert!(runner.get_sessions().await.is_empty());
    assert!(runner.get_session(&"broken".into()).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_echo_round_trip_delivers_once() {
    let root = tempfile::tempdir().unwrap();
    let runner = runner(&root);
    let session = runner.load(&script_archive("echo", ECHO_SCRIPT)).await.unwrap();

    runner.start_plugin(session.id()).await.unwrap();
    assert_eq!(session.state(), ZiReportedState::Active);
    assert_eq!(dir_entries(root.path()), 1);
    assert!(runner.process_id(session.id()).await.unwrap().is_some());

    let response = session.send_command("echo", json!({"text": "hi"})).await.unwrap();
    assert_eq!(response.result, json!("ok"));
    assert!(response.correlation_id().is_ok());
    assert_eq!(session.pending_count(), 0);

    runner.stop_plugin(session.id()).await.unwrap();
    assert_eq!(session.state(), ZiReportedState::Inactive);
    assert_eq!(dir_entries(root.path()), 0, "workdir must be removed on stop");
}

#[tokio::test]
async fn test_concurrent_commands_are_correlated() {
    let root = tempfile::tempdir().unwrap();
    let runner = runner(&root);
    let session = runner.load(&script_archive("echo", ECHO_SCRIPT)).await.unwrap();
    runner.start_plugin(session.id()).await.unwrap();

    let calls = (0..8).map(|n| {
        let session = Arc::clone(&session);
        async move { session.send_command("echo", json!({ "n": n })).await }
    });
    let responses: Vec<_> = join_all(calls).await.into_iter().map(|r| r.unwrap()).collect();

    let mut ids: Vec<String> = responses.iter().map(|r| r.id.clone()).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 8);
    assert_eq!(session.pending_count(), 0);

    runner.stop_plugin(session.id()).await.unwrap();
}

#[tokio::test]
async fn test_double_start_reports_already_running() {
    let root = tempfile::tempdir().unwrap();
    let runner = runner(&root);
    let session = runner.load(&script_archive("echo", ECHO_SCRIPT)).await.unwrap();

    runner.start_plugin(session.id()).await.unwrap();
    let err = runner.start_plugin(session.id()).await.unwrap_err();
    assert!(matches!(err, ZiError::AlreadyRunning { .. }));
    assert_eq!(session.state(), ZiReportedState::Active);
    assert_eq!(dir_entries(root.path()), 1);

    runner.stop_plugin(session.id()).await.unwrap();
}

#[tokio::test]
async fn test_unexpected_exit_moves_to_errored() {
    let root = tempfile::tempdir().unwrap();
    let runner = runner(&root);
    let session = runner
        .load(&script_archive("crash", "#!/bin/sh\necho 'giving up' >&2\nexit 3\n"))
        .await
        .unwrap();

    runner.start_plugin(session.id()).await.unwrap();
    wait_for_state(&session, ZiReportedState::Errored).await;
    let note = session.error_note().unwrap();
    assert!(note.contains("exit"), "unexpected note: {}", note);

    support::wait_until(|| dir_entries(root.path()) == 0).await;

    // An errored session can be started again.
    runner.start_plugin(session.id()).await.unwrap();
    wait_for_state(&session, ZiReportedState::Errored).await;
}

#[tokio::test]
async fn test_external_kill_moves_to_errored() {
    let root = tempfile::tempdir().unwrap();
    let runner = runner(&root);
    let session = runner
        .load(&script_archive("victim", "#!/bin/sh\nexec cat >/dev/null\n"))
        .await
        .unwrap();
    runner.start_plugin(session.id()).await.unwrap();

    let pid = runner.process_id(session.id()).await.unwrap().unwrap();
    let status = std::process::Command::new("kill")
        .arg("-9")
        .arg(pid.to_string())
        .status()
        .unwrap();
    assert!(status.success());

    wait_for_state(&session, ZiReportedState::Errored).await;
    assert!(session.error_note().unwrap().contains("exited"));
}

#[tokio::test]
async fn test_unmatched_response_moves_to_errored() {
    let root = tempfile::tempdir().unwrap();
    let runner = runner(&root);
    let script = "#!/bin/sh\necho '{\"id\":\"0190f1c2-7b7e-7000-8000-000000000001\",\"result\":\"stray\"}'\nexec cat >/dev/null\n";
    let session = runner.load(&script_archive("stray", script)).await.unwrap();

    runner.start_plugin(session.id()).await.unwrap();
    wait_for_state(&session, ZiReportedState::Errored).await;
    let note = session.error_note().unwrap();
    assert!(note.contains("unknown command"), "unexpected note: {}", note);
    support::wait_until(|| dir_entries(root.path()) == 0).await;
}

#[tokio::test]
async fn test_command_times_out_and_releases_pending() {
    let root = tempfile::tempdir().unwrap();
    let runner = ZiProcessRunner::new(
        ZiRuntimeConfigBuilder::new()
            .work_root(root.path())
            .command_timeout_ms(200)
            .build(),
    );
    let session = runner
        .load(&script_archive("mute", "#!/bin/sh\nexec cat >/dev/null\n"))
        .await
        .unwrap();
    runner.start_plugin(session.id()).await.unwrap();

    let err = session.send_command("echo", json!(null)).await.unwrap_err();
    assert!(matches!(err, ZiError::Timeout(_)), "unexpected error {:?}", err);
    assert_eq!(session.pending_count(), 0);
    assert_eq!(session.state(), ZiReportedState::Active);

    runner.stop_plugin(session.id()).await.unwrap();
    assert_eq!(session.state(), ZiReportedState::Inactive);
}

#[tokio::test]
async fn test_late_reply_after_timeout_keeps_plugin_running() {
    let root = tempfile::tempdir().unwrap();
    let runner = ZiProcessRunner::new(
        ZiRuntimeConfigBuilder::new()
            .work_root(root.path())
            .stop_grace_ms(500)
            .command_timeout_ms(200)
            .build(),
    );
    let script = "#!/bin/sh\nslow=1\nwhile IFS= read -r line; do\n  id=${line#*'\"id\":\"'}\n  id=${id%%'\"'*}\n  if [ -n \"$slow\" ]; then sleep 1; slow=; fi\n  printf '{\"id\":\"%s\",\"result\":\"ok\"}\\n' \"$id\"\ndone\n";
    let session = runner.load(&script_archive("sluggish", script)).await.unwrap();
    runner.start_plugin(session.id()).await.unwrap();

    let err = session.send_command("echo", json!(1)).await.unwrap_err();
    assert!(matches!(err, ZiError::Timeout(_)), "unexpected error {:?}", err);

    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert_eq!(session.state(), ZiReportedState::Active, "note: {:?}", session.error_note());

    let response = session.send_command("echo", json!(2)).await.unwrap();
    assert_eq!(response.result, json!("ok"));

    runner.stop_plugin(session.id()).await.unwrap();
    assert_eq!(session.state(), ZiReportedState::Inactive);
}

#[tokio::test]
async fn test_unload_racing_start_leaves_nothing_running() {
    let root = tempfile::tempdir().unwrap();
    let runner = runner(&root);
    for _ in 0..5 {
        let session = runner.load(&script_archive("racer", ECHO_SCRIPT)).await.unwrap();
        let id = session.id().clone();

        let (started, unloaded) = tokio::join!(runner.start_plugin(&id), runner.unload(&id));
        unloaded.unwrap();
        if let Err(err) = started {
            assert!(err.is_not_found(), "unexpected error {:?}", err);
        }

        assert_ne!(session.state(), ZiReportedState::Active);
        assert!(runner.get_session(&id).await.unwrap_err().is_not_found());
        support::wait_until(|| dir_entries(root.path()) == 0).await;
    }
}

#[tokio::test]
async fn test_stop_escalates_when_plugin_ignores_eof() {
    let root = tempfile::tempdir().unwrap();
    let runner = ZiProcessRunner::new(
        ZiRuntimeConfigBuilder::new()
            .work_root(root.path())
            .stop_grace_ms(200)
            .build(),
    );
    let session = runner
        .load(&script_archive("stubborn", "#!/bin/sh\nexec sleep 30\n"))
        .await
        .unwrap();
    runner.start_plugin(session.id()).await.unwrap();

    let started = Instant::now();
    runner.stop_plugin(session.id()).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(session.state(), ZiReportedState::Inactive);
    assert_eq!(dir_entries(root.path()), 0);
}

#[tokio::test]
async fn test_stop_without_run_is_a_no_op() {
    let root = tempfile::tempdir().unwrap();
    let runner = runner(&root);
    let session = runner.load(&script_archive("idle", ECHO_SCRIPT)).await.unwrap();

    runner.stop_plugin(session.id()).await.unwrap();
    runner.stop_plugin(session.id()).await.unwrap();
    assert_eq!(session.state(), ZiReportedState::Inactive);

    let err = session.send_command("echo", json!(null)).await.unwrap_err();
    assert!(matches!(err, ZiError::NotRunning { .. }));
}

#[tokio::test]
async fn test_unload_stops_and_forgets_session() {
    let root = tempfile::tempdir().unwrap();
    let runner = runner(&root);
    let session = runner.load(&script_archive("echo", ECHO_SCRIPT)).await.unwrap();
    let id = session.id().clone();
    runner.start_plugin(&id).await.unwrap();

    runner.unload(&id).await.unwrap();
    assert_eq!(session.state(), ZiReportedState::Inactive);
    assert_eq!(dir_entries(root.path()), 0);
    assert!(runner.get_session(&id).await.unwrap_err().is_not_found());
    assert!(runner.unload(&id).await.unwrap_err().is_not_found());

    // The id is free again.
    runner.load(&script_archive("echo", ECHO_SCRIPT)).await.unwrap();
}

#[tokio::test]
async fn test_unknown_plugin_is_not_found() {
    let root = tempfile::tempdir().unwrap();
    let runner = runner(&root);
    let ghost = ZiPluginId::new("ghost");
    assert!(runner.start_plugin(&ghost).await.unwrap_err().is_not_found());
    assert!(runner.stop_plugin(&ghost).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_build_runner_selects_process_backend() {
    let root = tempfile::tempdir().unwrap();
    let runner = build_runner(ZiRuntimeConfigBuilder::new().work_root(root.path()).build()).unwrap();
    let session = runner.load(&script_archive("echo", ECHO_SCRIPT)).await.unwrap();
    runner.start_plugin(session.id()).await.unwrap();
    let response = session.send_command("ping", json!({})).await.unwrap();
    assert_eq!(response.into_result().unwrap(), json!("ok"));
    runner.stop_plugin(session.id()).await.unwrap();
}
