// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for the orchestrator: launch, container events, kill, restarts and
//! finalize queueing.

mod common;

use std::collections::BTreeMap;

use chrono::Utc;

use berth::backend::mock::MockBackend;
use berth::events::{ContainerEvent, TaskEvent};
use berth::finalize::FinalizeOutcome;
use berth::orchestrator::OrchestratorConfig;
use berth::store::WorkloadStore;
use berth::task::{NODE_ERROR_MESSAGE, Task};
use berth::workload::{SourceKind, WorkloadRole};
use common::{Harness, context, descriptor};

fn container_event(container_id: &str, status: &str, exit_code: Option<&str>) -> ContainerEvent {
    let now = Utc::now();
    let mut attributes = BTreeMap::new();
    if let Some(code) = exit_code {
        attributes.insert("exitCode".to_string(), code.to_string());
    }
    ContainerEvent {
        status: status.to_string(),
        container_id: container_id.to_string(),
        time: now.timestamp(),
        time_nano: now.timestamp_nanos_opt(),
        attributes,
    }
}

fn task(service_id: &str, task_id: &str, state: &str) -> Task {
    Task {
        service_id: service_id.to_string(),
        task_id: Some(task_id.to_string()),
        node_id: Some("node-a".to_string()),
        state: state.to_string(),
        desired_state: Some("running".to_string()),
        container_id: Some(format!("{}-container", task_id)),
        status_time: Some(Utc::now()),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_launch_creates_and_starts_container() {
    let h = Harness::new(MockBackend::new());

    let w = h.launch(&descriptor("busybox")).await;

    assert_eq!(w.container_id.as_deref(), Some("container-1"));
    assert_eq!(w.role, WorkloadRole::Main);
    assert_eq!(w.status(), "Created");
    assert_eq!(w.username, "alice");
    assert_eq!(w.workflow_id.as_deref(), Some("wf-main"));
    assert_eq!(h.backend.started().await, vec!["container-1".to_string()]);
    assert_eq!(h.workflows.status_of("wf-main").as_deref(), Some("Running"));
}

#[tokio::test]
async fn test_successful_exit_completes_workload() {
    let mut h = Harness::new(MockBackend::new());
    let mut d = descriptor("busybox");
    d.outputs.push(berth::workload::OutputSpec {
        name: "result".to_string(),
        mount: "out".to_string(),
        path: "result.json".to_string(),
        required: true,
    });
    let w = h.launch(&d).await;

    h.orchestrator
        .apply_container_event(w.id, &container_event("container-1", "die", Some("0")))
        .await
        .unwrap();
    let outcomes = h.drain_finalize().await;

    assert_eq!(outcomes, vec![(w.id, FinalizeOutcome::Completed)]);
    assert_eq!(
        h.statuses(w.id).await,
        vec!["Created", "die", "_die", "Finalizing", "Complete"]
    );
    let w = h.reload(w.id).await;
    assert!(w.is_finalized());
    assert_eq!(w.exit_code(), Some("0"));
    assert_eq!(
        h.outputs.registered.lock().unwrap().clone(),
        vec![(w.id, "result".to_string())]
    );
    assert_eq!(h.backend.removed().await, vec!["container-1".to_string()]);
    assert_eq!(h.workflows.status_of("wf-main").as_deref(), Some("Complete"));
}

#[tokio::test]
async fn test_nonzero_exit_fails_workload() {
    let mut h = Harness::new(MockBackend::new());
    let w = h.launch(&descriptor("busybox")).await;

    h.orchestrator
        .apply_container_event(w.id, &container_event("container-1", "die", Some("3")))
        .await
        .unwrap();
    let outcomes = h.drain_finalize().await;

    assert_eq!(outcomes, vec![(w.id, FinalizeOutcome::Failed)]);
    let w = h.reload(w.id).await;
    assert_eq!(w.status(), "Failed");
    assert_eq!(h.workflows.status_of("wf-main").as_deref(), Some("Failed"));
    assert_eq!(
        h.workflows.details_of("wf-main").as_deref(),
        Some("Non-zero exit code and/or failure status from container")
    );
}

#[tokio::test]
async fn test_oom_is_not_a_success() {
    let mut h = Harness::new(MockBackend::new());
    let w = h.launch(&descriptor("busybox")).await;

    h.orchestrator
        .apply_container_event(w.id, &container_event("container-1", "oom", None))
        .await
        .unwrap();

    let requests = h.take_requests();
    assert_eq!(requests.len(), 1);
    assert!(!requests[0].successful);
    assert_eq!(requests[0].exit_code.as_deref(), Some(""));
}

#[tokio::test]
async fn test_duplicate_event_is_applied_once() {
    let mut h = Harness::new(MockBackend::new());
    let w = h.launch(&descriptor("busybox")).await;
    let event = container_event("container-1", "die", Some("0"));

    h.orchestrator.apply_container_event(w.id, &event).await.unwrap();
    h.orchestrator.apply_container_event(w.id, &event).await.unwrap();

    assert_eq!(h.take_requests().len(), 1);
    assert_eq!(h.statuses(w.id).await, vec!["Created", "die", "_die"]);
}

#[tokio::test]
async fn test_events_after_finalize_are_ignored() {
    let mut h = Harness::new(MockBackend::new());
    let w = h.launch(&descriptor("busybox")).await;
    h.orchestrator
        .apply_container_event(w.id, &container_event("container-1", "die", Some("0")))
        .await
        .unwrap();
    h.drain_finalize().await;

    h.orchestrator
        .apply_container_event(w.id, &container_event("container-1", "die", Some("0")))
        .await
        .unwrap();

    assert!(h.take_requests().is_empty());
    assert_eq!(h.reload(w.id).await.status(), "Complete");
}

#[tokio::test]
async fn test_kill_records_user_and_kills_container() {
    let h = Harness::new(MockBackend::new());
    let w = h.launch(&descriptor("busybox")).await;

    h.orchestrator.kill(w.id, "bob").await.unwrap();

    let w = h.reload(w.id).await;
    let kill = w.history.last().unwrap();
    assert_eq!(kill.status, "kill");
    assert_eq!(kill.source, SourceKind::User);
    assert_eq!(kill.source_id.as_deref(), Some("bob"));
    assert!(w.was_killed());
    assert_eq!(h.backend.killed().await, vec!["container-1".to_string()]);
}

#[tokio::test]
async fn test_start_failure_is_recorded() {
    let h = Harness::new(MockBackend::new());
    h.backend.fail_starts("daemon unavailable").await;

    let result = h.orchestrator.launch(&descriptor("busybox"), &context()).await;

    assert!(result.is_err());
    let w = h.reload(1).await;
    assert_eq!(w.status(), "Failed");
    let message = w.history.last().unwrap().message.clone().unwrap();
    assert!(message.starts_with("Did not start."));
    assert!(message.contains("daemon unavailable"));
}

#[tokio::test]
async fn test_refused_finalize_request_puts_workload_back_to_waiting() {
    let mut h = Harness::with_config(MockBackend::new(), OrchestratorConfig::default(), 1);
    let first = h.launch(&descriptor("one")).await;
    let second = h.launch(&descriptor("two")).await;

    h.orchestrator
        .apply_container_event(first.id, &container_event("container-1", "die", Some("0")))
        .await
        .unwrap();
    h.orchestrator
        .apply_container_event(second.id, &container_event("container-2", "die", Some("0")))
        .await
        .unwrap();

    assert_eq!(h.reload(second.id).await.status(), "Waiting");
    assert!(
        h.notifier
            .subjects()
            .contains(&"Finalizing queue error".to_string())
    );

    assert_eq!(
        h.drain_finalize().await,
        vec![(first.id, FinalizeOutcome::Completed)]
    );

    h.orchestrator
        .process_task_event(second.id, TaskEvent::Waiting)
        .await
        .unwrap();
    assert_eq!(
        h.drain_finalize().await,
        vec![(second.id, FinalizeOutcome::Completed)]
    );
}

#[tokio::test]
async fn test_queue_finalize_skips_already_queued() {
    let mut h = Harness::new(MockBackend::new());
    let w = h.launch(&descriptor("busybox")).await;

    h.orchestrator
        .queue_finalize(&w, Some("0".to_string()), true)
        .await
        .unwrap();
    let w = h.reload(w.id).await;
    assert_eq!(w.status(), "_Created");

    h.orchestrator
        .queue_finalize(&w, Some("0".to_string()), true)
        .await
        .unwrap();
    assert_eq!(h.take_requests().len(), 1);
}

#[tokio::test]
async fn test_service_completion_is_finalized() {
    let mut h = Harness::new(MockBackend::swarm());
    let w = h.launch(&descriptor("busybox")).await;
    assert_eq!(w.service_id.as_deref(), Some("service-1"));

    let mut done = task("service-1", "t1", "complete");
    done.exit_code = Some(0);
    h.orchestrator
        .process_task_event(w.id, TaskEvent::ProcessTask(done.classify()))
        .await
        .unwrap();

    let w = h.reload(w.id).await;
    assert_eq!(w.task_id.as_deref(), Some("t1"));
    assert_eq!(w.node_id.as_deref(), Some("node-a"));
    assert_eq!(w.container_id.as_deref(), Some("t1-container"));

    assert_eq!(
        h.drain_finalize().await,
        vec![(w.id, FinalizeOutcome::Completed)]
    );
    assert_eq!(h.reload(w.id).await.status(), "Complete");
}

#[tokio::test]
async fn test_node_loss_restarts_service_until_budget_is_spent() {
    let config = OrchestratorConfig {
        max_restarts: 1,
        ..Default::default()
    };
    let mut h = Harness::with_config(MockBackend::swarm(), config, 8);
    let w = h.launch(&descriptor("busybox")).await;

    let mut lost = task("service-1", "t1", "running");
    lost.desired_state = Some("shutdown".to_string());
    h.orchestrator
        .process_task_event(w.id, TaskEvent::ProcessTask(lost.classify()))
        .await
        .unwrap();

    let w = h.reload(w.id).await;
    assert_eq!(w.restart_count(), 1);
    assert_eq!(w.service_id.as_deref(), Some("service-2"));
    assert_eq!(w.task_id, None);
    assert!(h.backend.removed().await.contains(&"service-1".to_string()));
    assert!(h.backend.started().await.contains(&"service-2".to_string()));
    assert!(h.take_requests().is_empty());

    let mut lost_again = task("service-2", "t2", "running");
    lost_again.desired_state = Some("shutdown".to_string());
    h.orchestrator
        .process_task_event(w.id, TaskEvent::ProcessTask(lost_again.classify()))
        .await
        .unwrap();

    let requests = h.take_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].exit_code.as_deref(), Some("126"));
    assert!(!requests[0].successful);
    assert_eq!(
        h.workflows.status_of("wf-main").as_deref(),
        Some("Failed (Swarm)")
    );

    let outcome = h.orchestrator.consume_finalize(&requests[0]).await.unwrap();
    assert_eq!(outcome, FinalizeOutcome::Failed);
    let w = h.reload(w.id).await;
    assert_eq!(w.status(), "Failed (Swarm)");
    assert!(
        w.history
            .iter()
            .any(|e| e.status == "failed"
                && e.message.as_deref().is_some_and(|m| m.starts_with(NODE_ERROR_MESSAGE)))
    );
}

#[tokio::test]
async fn test_restart_event_on_missing_service() {
    let h = Harness::new(MockBackend::swarm());
    let w = h.launch(&descriptor("busybox")).await;

    h.orchestrator
        .process_task_event(w.id, TaskEvent::Restart)
        .await
        .unwrap();

    let w = h.reload(w.id).await;
    assert_eq!(w.restart_count(), 1);
    assert_eq!(w.service_id.as_deref(), Some("service-2"));
}

#[tokio::test]
async fn test_waiting_event_for_unstarted_service_annotates_once() {
    let mut h = Harness::new(MockBackend::swarm());
    let w = h.launch(&descriptor("busybox")).await;

    h.orchestrator
        .process_task_event(w.id, TaskEvent::Waiting)
        .await
        .unwrap();
    assert_eq!(h.reload(w.id).await.status(), "Waiting");
    assert!(h.take_requests().is_empty());

    h.orchestrator
        .process_task_event(w.id, TaskEvent::Waiting)
        .await
        .unwrap();
    let requests = h.take_requests();
    assert_eq!(requests.len(), 1);
    assert!(!requests[0].successful);
}

#[tokio::test]
async fn test_children_listed_by_role() {
    let h = Harness::new(MockBackend::new());
    let mut d = descriptor("main");
    d.setup.push(descriptor("setup"));
    d.wrapup.push(descriptor("wrapup"));

    let w = h.launch(&d).await;

    let setups = h.store.list_children(w.id, WorkloadRole::Setup).await.unwrap();
    let wrapups = h.store.list_children(w.id, WorkloadRole::Wrapup).await.unwrap();
    assert_eq!(setups.len(), 1);
    assert_eq!(wrapups.len(), 1);
    assert!(setups[0].is_launched());
    assert!(!wrapups[0].is_launched());
    assert_eq!(setups[0].parent_id, Some(w.id));

    let created = h.workflows.created.lock().unwrap().clone();
    assert!(created.contains(&("wf-main".to_string(), "setup".to_string())));
    assert!(created.contains(&("wf-main".to_string(), "wrapup".to_string())));
}
