// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for startup orphan recovery.

use std::time::Duration;

use chrono::Utc;

use berth::orphan_recovery::{OrphanRecoveryConfig, RecoveryReport, recover_orphaned_workloads};
use berth::store::{MemoryStore, WorkloadStore};
use berth::workload::history::HistoryEntry;
use berth::workload::{ExecutionMode, LaunchPlan, NewWorkload, WorkloadRole};

async fn workload_with(store: &MemoryStore, status: &str, age_hours: i64) -> i64 {
    let mut created = HistoryEntry::from_system("Created", "Created");
    created.recorded_at = Utc::now() - chrono::Duration::hours(age_hours + 1);
    let w = store
        .create_workload(
            NewWorkload {
                mode: ExecutionMode::Container,
                role: WorkloadRole::Main,
                parent_id: None,
                runtime_id: Some("abc123".to_string()),
                plan: LaunchPlan::default(),
                outputs: Vec::new(),
                workflow_id: None,
                username: "alice".to_string(),
                project: None,
                wrapper_name: None,
            },
            created,
        )
        .await
        .unwrap();

    let mut entry = HistoryEntry::from_system(status, "test");
    entry.recorded_at = Utc::now() - chrono::Duration::hours(age_hours);
    store.append_history(w.id, entry).await.unwrap();
    w.id
}

async fn status(store: &MemoryStore, id: i64) -> String {
    store
        .get_workload(id)
        .await
        .unwrap()
        .unwrap()
        .status()
        .to_string()
}

#[tokio::test]
async fn test_recent_finalizing_is_reset_to_waiting() {
    let store = MemoryStore::new();
    let id = workload_with(&store, "Finalizing", 1).await;

    let report = recover_orphaned_workloads(&store, &OrphanRecoveryConfig::default())
        .await
        .unwrap();

    assert_eq!(report.reset_to_waiting, 1);
    assert_eq!(status(&store, id).await, "Waiting");
}

#[tokio::test]
async fn test_stale_finalizing_is_failed() {
    let store = MemoryStore::new();
    let id = workload_with(&store, "Finalizing", 100).await;

    let report = recover_orphaned_workloads(&store, &OrphanRecoveryConfig::default())
        .await
        .unwrap();

    assert_eq!(report.failed, 1);
    let w = store.get_workload(id).await.unwrap().unwrap();
    assert_eq!(w.status(), "Failed (Finalizing)");
    assert!(w.is_finalized());
    assert_eq!(
        w.history.last().unwrap().message.as_deref(),
        Some("Finalizing for more than 72 hours")
    );
}

#[tokio::test]
async fn test_custom_timeout_is_honored() {
    let store = MemoryStore::new();
    let id = workload_with(&store, "Finalizing", 3).await;
    let config = OrphanRecoveryConfig {
        finalizing_timeout: Duration::from_secs(2 * 3600),
        ..Default::default()
    };

    recover_orphaned_workloads(&store, &config).await.unwrap();

    assert_eq!(status(&store, id).await, "Failed (Finalizing)");
}

#[tokio::test]
async fn test_queued_workloads_are_requeued() {
    let store = MemoryStore::new();
    let queued = workload_with(&store, "_die", 0).await;
    let running = workload_with(&store, "start", 0).await;

    let report = recover_orphaned_workloads(&store, &OrphanRecoveryConfig::default())
        .await
        .unwrap();

    assert_eq!(report.requeued, 1);
    assert_eq!(status(&store, queued).await, "Waiting");
    assert_eq!(status(&store, running).await, "start");
}

#[tokio::test]
async fn test_non_primary_node_does_nothing() {
    let store = MemoryStore::new();
    let id = workload_with(&store, "Finalizing", 1).await;
    let config = OrphanRecoveryConfig {
        primary_node: false,
        ..Default::default()
    };

    let report = recover_orphaned_workloads(&store, &config).await.unwrap();

    assert_eq!(report, RecoveryReport::default());
    assert_eq!(status(&store, id).await, "Finalizing");
}

#[tokio::test]
async fn test_second_pass_changes_nothing() {
    let store = MemoryStore::new();
    workload_with(&store, "Finalizing", 1).await;
    workload_with(&store, "Finalizing", 100).await;
    workload_with(&store, "_Waiting", 0).await;

    let first = recover_orphaned_workloads(&store, &OrphanRecoveryConfig::default())
        .await
        .unwrap();
    let second = recover_orphaned_workloads(&store, &OrphanRecoveryConfig::default())
        .await
        .unwrap();

    assert_eq!(first.total(), 3);
    assert_eq!(second.total(), 0);
}
