// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Startup recovery of workloads abandoned mid-finalization.
//!
//! A workload left in `Finalizing` is either a crash during finalization or
//! a finalize still running on another node; the two cannot be told apart
//! from the store alone. Recovery always resets such workloads, so a finalize
//! running elsewhere can race with the reset. Only the primary node runs
//! this pass.
//!
//! Workloads queued for finalizing (`_` statuses) are reset as well: the
//! in-process queue does not survive a restart.

use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::store::WorkloadStore;
use crate::workload::history::{
    HistoryEntry, QUEUED_PREFIX, STATUS_FAILED_FINALIZING, STATUS_FINALIZING, STATUS_WAITING,
};

/// Configuration for orphan recovery.
#[derive(Debug, Clone)]
pub struct OrphanRecoveryConfig {
    /// Whether this node is the designated primary.
    pub primary_node: bool,
    /// Age after which a `Finalizing` workload is failed instead of retried.
    pub finalizing_timeout: Duration,
}

impl Default for OrphanRecoveryConfig {
    fn default() -> Self {
        Self {
            primary_node: true,
            finalizing_timeout: Duration::from_secs(72 * 3600),
        }
    }
}

/// What one recovery pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// `Finalizing` workloads put back to `Waiting`.
    pub reset_to_waiting: usize,
    /// `Finalizing` workloads failed for exceeding the timeout.
    pub failed: usize,
    /// Queued workloads put back to `Waiting`.
    pub requeued: usize,
    /// Workloads whose status changed before they could be reset.
    pub skipped: usize,
}

impl RecoveryReport {
    /// Number of workloads written to.
    pub fn total(&self) -> usize {
        self.reset_to_waiting + self.failed + self.requeued
    }
}

/// Reset orphaned `Finalizing` and queued workloads.
///
/// Each workload is reloaded before it is written, and skipped unless it is
/// still in the state it was listed in, so running the pass twice changes
/// nothing the second time.
pub async fn recover_orphaned_workloads(
    store: &dyn WorkloadStore,
    config: &OrphanRecoveryConfig,
) -> Result<RecoveryReport> {
    let mut report = RecoveryReport::default();
    if !config.primary_node {
        debug!("Not the primary node, skipping orphan recovery");
        return Ok(report);
    }

    let timeout = chrono::Duration::from_std(config.finalizing_timeout)
        .map_err(|e| Error::Other(format!("Invalid duration: {}", e)))?;
    let timeout_hours = config.finalizing_timeout.as_secs() / 3600;

    let finalizing = store.list_by_status(STATUS_FINALIZING).await?;
    if finalizing.is_empty() {
        info!("No workloads in orphaned Finalizing state");
    }

    for listed in finalizing {
        let Some(workload) = store.get_workload(listed.id).await? else {
            report.skipped += 1;
            continue;
        };
        if !workload.is_finalizing() {
            report.skipped += 1;
            continue;
        }

        let age = workload
            .status_time()
            .map(|t| Utc::now() - t)
            .unwrap_or_default();
        if age < timeout {
            store
                .append_history(
                    workload.id,
                    HistoryEntry::from_system(
                        STATUS_WAITING,
                        "Reset status from Finalizing to Waiting.",
                    ),
                )
                .await?;
            info!(
                workload_id = workload.id,
                workflow_id = workload.workflow_id.as_deref().unwrap_or_default(),
                "Reset Finalizing workload to Waiting"
            );
            report.reset_to_waiting += 1;
        } else {
            store
                .append_history(
                    workload.id,
                    HistoryEntry::from_system(
                        STATUS_FAILED_FINALIZING,
                        format!("Finalizing for more than {} hours", timeout_hours),
                    ),
                )
                .await?;
            warn!(
                workload_id = workload.id,
                age_hours = age.num_hours(),
                "Failed workload stuck in Finalizing"
            );
            report.failed += 1;
        }
    }

    for listed in store.list_by_status_prefix(QUEUED_PREFIX).await? {
        let Some(workload) = store.get_workload(listed.id).await? else {
            report.skipped += 1;
            continue;
        };
        if !workload.status().starts_with(QUEUED_PREFIX) {
            report.skipped += 1;
            continue;
        }

        store
            .append_history(
                workload.id,
                HistoryEntry::from_system(STATUS_WAITING, "Reset status from queued to Waiting."),
            )
            .await?;
        info!(
            workload_id = workload.id,
            status = workload.status(),
            "Reset queued workload to Waiting"
        );
        report.requeued += 1;
    }

    info!(
        reset_to_waiting = report.reset_to_waiting,
        failed = report.failed,
        requeued = report.requeued,
        skipped = report.skipped,
        "Orphan recovery complete"
    );
    Ok(report)
}
