// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for the staging and finalizing stages and the embedded runtime.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use berth::backend::mock::MockBackend;
use berth::events::ContainerEvent;
use berth::queue::{FinalizeConsumer, FinalizeRequest, LaunchConsumer, LaunchRequest, StageConsumer};
use berth::runtime::BerthRuntime;
use berth::store::{MemoryStore, WorkloadStore};
use berth::workload::history::HistoryEntry;
use berth::workload::{ExecutionMode, LaunchPlan, NewWorkload, WorkloadRole};
use common::{
    Harness, RecordingNotifier, RecordingRegistrar, RecordingTracker, StaticResolver, descriptor,
};

fn request(workflow_id: Option<&str>) -> LaunchRequest {
    let mut input_values = BTreeMap::new();
    input_values.insert("session".to_string(), "XNAT_E0001".to_string());
    LaunchRequest {
        project: Some("proj".to_string()),
        wrapper_id: "7".to_string(),
        command_id: "3".to_string(),
        wrapper_name: "dcm2niix".to_string(),
        input_values,
        username: "alice".to_string(),
        workflow_id: workflow_id.map(String::from),
    }
}

fn consumer(h: &Harness, resolves: bool) -> LaunchConsumer {
    let mut d = descriptor("busybox");
    d.wrapper_name = None;
    let resolver = StaticResolver {
        descriptor: resolves.then_some(d),
    };
    LaunchConsumer::new(Arc::new(resolver), h.orchestrator.clone())
}

#[tokio::test]
async fn test_launch_request_is_staged() {
    let h = Harness::new(MockBackend::new());
    let consumer = consumer(&h, true);

    consumer.consume(request(Some("wf-9"))).await;

    let w = h.reload(1).await;
    assert_eq!(w.workflow_id.as_deref(), Some("wf-9"));
    assert_eq!(w.wrapper_name.as_deref(), Some("dcm2niix"));
    assert_eq!(w.project.as_deref(), Some("proj"));
    assert_eq!(h.backend.started().await, vec!["container-1".to_string()]);
    assert_eq!(h.workflows.status_of("wf-9").as_deref(), Some("Running"));
    assert!(consumer.in_flight().is_empty());
}

#[tokio::test]
async fn test_missing_workflow_is_created() {
    let h = Harness::new(MockBackend::new());
    let consumer = consumer(&h, true);

    consumer.consume(request(None)).await;

    assert_eq!(
        h.workflows.created.lock().unwrap().clone(),
        vec![("proj".to_string(), "container".to_string())]
    );
    assert_eq!(h.reload(1).await.workflow_id.as_deref(), Some("wf-1"));
}

#[tokio::test]
async fn test_resolution_failure_is_reported() {
    let h = Harness::new(MockBackend::new());
    let consumer = consumer(&h, false);

    consumer.consume(request(Some("wf-9"))).await;

    assert!(h.store.get_workload(1).await.unwrap().is_none());
    assert_eq!(
        h.workflows.status_of("wf-9").as_deref(),
        Some("Failed (Command resolution)")
    );
    let sent = h.notifier.sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "Container launch failed: Command resolution");
    assert!(sent[0].1.contains("<li>session: (unresolved)</li>"));
}

#[tokio::test]
async fn test_backend_failure_is_reported_as_container_launch() {
    let h = Harness::new(MockBackend::new());
    h.backend.fail_launches("daemon unavailable").await;
    let consumer = consumer(&h, true);

    consumer.consume(request(Some("wf-9"))).await;

    assert_eq!(
        h.workflows.status_of("wf-9").as_deref(),
        Some("Failed (Container launch)")
    );
    assert!(
        h.workflows
            .details_of("wf-9")
            .is_some_and(|d| d.contains("daemon unavailable"))
    );
}

#[tokio::test]
async fn test_workflow_already_staging_is_skipped() {
    let h = Harness::new(MockBackend::new());
    let consumer = consumer(&h, true);
    let guard = consumer.in_flight().try_acquire("wf-9".to_string()).unwrap();

    consumer.consume(request(Some("wf-9"))).await;

    assert!(h.store.get_workload(1).await.unwrap().is_none());
    drop(guard);
    consumer.consume(request(Some("wf-9"))).await;
    assert!(h.store.get_workload(1).await.unwrap().is_some());
}

#[tokio::test]
async fn test_finalize_failure_is_reported() {
    let h = Harness::new(MockBackend::new());
    let consumer = FinalizeConsumer::new(h.orchestrator.clone());

    consumer
        .consume(FinalizeRequest {
            workload_id: 42,
            exit_code: Some("0".to_string()),
            successful: true,
            username: "alice".to_string(),
        })
        .await;

    assert_eq!(h.notifier.subjects(), vec!["Finalizing failure".to_string()]);
    assert!(consumer.in_flight().is_empty());
}

#[tokio::test]
async fn test_finalize_consumer_completes_workload() {
    let h = Harness::new(MockBackend::new());
    let w = h.launch(&descriptor("busybox")).await;
    let consumer = FinalizeConsumer::new(h.orchestrator.clone());

    consumer
        .consume(FinalizeRequest {
            workload_id: w.id,
            exit_code: Some("0".to_string()),
            successful: true,
            username: "alice".to_string(),
        })
        .await;

    assert_eq!(h.reload(w.id).await.status(), "Complete");
}

#[tokio::test]
async fn test_finalize_already_in_flight_is_skipped() {
    let h = Harness::new(MockBackend::new());
    let w = h.launch(&descriptor("busybox")).await;
    let consumer = FinalizeConsumer::new(h.orchestrator.clone());
    let finalize = || FinalizeRequest {
        workload_id: w.id,
        exit_code: Some("0".to_string()),
        successful: true,
        username: "alice".to_string(),
    };

    let guard = consumer.in_flight().try_acquire(w.id).unwrap();
    consumer.consume(finalize()).await;

    assert_eq!(h.statuses(w.id).await, vec!["Created"]);
    assert!(h.notifier.subjects().is_empty());

    drop(guard);
    consumer.consume(finalize()).await;
    consumer.consume(finalize()).await;

    let statuses = h.statuses(w.id).await;
    assert_eq!(statuses.iter().filter(|s| *s == "Complete").count(), 1);
    assert_eq!(statuses.last().map(String::as_str), Some("Complete"));
    assert_eq!(h.notifier.subjects(), vec!["busybox Complete".to_string()]);
    assert!(consumer.in_flight().is_empty());
}

async fn wait_for_status(store: &MemoryStore, id: i64, status: &str) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(Some(w)) = store.get_workload(id).await
                && w.status() == status
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("workload {} never reached {}", id, status));
}

#[tokio::test]
async fn test_runtime_runs_launch_to_completion() {
    let store = Arc::new(MemoryStore::new());
    let backend = Arc::new(MockBackend::new());
    let workflows = Arc::new(RecordingTracker::default());

    let runtime = BerthRuntime::builder()
        .store(store.clone())
        .backend(backend.clone())
        .resolver(Arc::new(StaticResolver {
            descriptor: Some(descriptor("busybox")),
        }))
        .workflows(workflows.clone())
        .notifier(Arc::new(RecordingNotifier::default()))
        .outputs(Arc::new(RecordingRegistrar::default()))
        .event_poll_interval(Duration::from_millis(20))
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();
    assert!(runtime.is_running());

    runtime.submit_launch(request(Some("wf-9"))).await.unwrap();
    wait_for_status(&store, 1, "Created").await;

    let now = Utc::now();
    let mut attributes = BTreeMap::new();
    attributes.insert("exitCode".to_string(), "0".to_string());
    backend
        .push_event(ContainerEvent {
            status: "die".to_string(),
            container_id: "container-1".to_string(),
            time: now.timestamp(),
            time_nano: now.timestamp_nanos_opt(),
            attributes,
        })
        .await;

    wait_for_status(&store, 1, "Complete").await;
    tokio::time::timeout(Duration::from_secs(5), async {
        while workflows.status_of("wf-9").as_deref() != Some("Complete") {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("workflow should be marked complete");

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_runtime_recovers_queued_workloads_on_start() {
    let store = Arc::new(MemoryStore::new());
    let w = store
        .create_workload(
            NewWorkload {
                mode: ExecutionMode::Container,
                role: WorkloadRole::Main,
                parent_id: None,
                runtime_id: Some("container-7".to_string()),
                plan: LaunchPlan::default(),
                outputs: Vec::new(),
                workflow_id: None,
                username: "alice".to_string(),
                project: None,
                wrapper_name: None,
            },
            HistoryEntry::from_system("Created", "Created"),
        )
        .await
        .unwrap();
    store
        .append_history(w.id, HistoryEntry::from_system("_die", "Queued for finalizing"))
        .await
        .unwrap();

    let runtime = BerthRuntime::builder()
        .store(store.clone())
        .backend(Arc::new(MockBackend::new()))
        .event_poll_interval(Duration::from_secs(3600))
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();

    assert_eq!(runtime.recovery_report().requeued, 1);
    assert_eq!(store.get_workload(w.id).await.unwrap().unwrap().status(), "Waiting");
    assert!(runtime.submit_launch(request(None)).await.is_err());

    runtime.shutdown().await.unwrap();
}
