// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Finalize routine.
//!
//! Finalizing turns an exited workload into a terminal one: wrapups are
//! launched or failed, logs captured, outputs registered, resources removed
//! and the terminal status recorded. Setup and wrapup children report back
//! to their parent once they are terminal.

use chrono::Utc;
use futures_util::future::BoxFuture;
use tracing::{debug, error, info, warn};

use crate::backend::LogStream;
use crate::collaborators::escape_html;
use crate::error::Result;
use crate::orchestrator::Orchestrator;
use crate::queue::FinalizeRequest;
use crate::workload::history::{
    self, HistoryEntry, STATUS_COMPLETE, STATUS_FAILED, STATUS_FAILED_PARENT, STATUS_FAILED_SWARM,
    STATUS_FAILED_UPLOAD, STATUS_FINALIZING, SourceKind,
};
use crate::workload::{Workload, WorkloadRole};

const FAILURE_DETAILS: &str = "Non-zero exit code and/or failure status from container";

/// Result of one finalize attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeOutcome {
    /// The workload was already terminal; nothing was done.
    AlreadyFinalized,
    /// Wrapups were launched; the workload finishes when they do.
    AwaitingWrapup,
    /// Recorded as `Complete`.
    Completed,
    /// Recorded with a `Failed` status.
    Failed,
}

impl Orchestrator {
    /// Handle one finalize request from the queue.
    pub async fn consume_finalize(&self, request: &FinalizeRequest) -> Result<FinalizeOutcome> {
        let workload = self.load(request.workload_id).await?;
        if workload.is_finalized() {
            debug!(workload_id = workload.id, status = workload.status(), "Already finalized");
            return Ok(FinalizeOutcome::AlreadyFinalized);
        }

        self.store
            .append_history(
                workload.id,
                HistoryEntry::from_system(STATUS_FINALIZING, "Processing finished. Uploading files."),
            )
            .await?;

        let workload = self.load(workload.id).await?;
        self.finalize(&workload, request.exit_code.as_deref(), request.successful)
            .await
    }

    /// Finalize a workload. Running it twice is harmless: a terminal
    /// workload is left untouched.
    pub fn finalize<'a>(
        &'a self,
        workload: &'a Workload,
        exit_code: Option<&'a str>,
        successful: bool,
    ) -> BoxFuture<'a, Result<FinalizeOutcome>> {
        Box::pin(async move {
            if workload.is_finalized() {
                return Ok(FinalizeOutcome::AlreadyFinalized);
            }

            let mut failed = history::exit_code_is_failed(exit_code) || !successful;
            info!(
                workload_id = workload.id,
                role = workload.role.as_str(),
                exit_code = exit_code.unwrap_or_default(),
                successful,
                failed,
                "Finalizing workload"
            );

            let mut wrapup_failure = None;
            if workload.role == WorkloadRole::Main {
                let wrapups = self
                    .store
                    .list_children(workload.id, WorkloadRole::Wrapup)
                    .await?;
                let (pending, launched): (Vec<_>, Vec<_>) =
                    wrapups.iter().partition(|w| !w.is_launched());
                let pending: Vec<_> = pending.into_iter().filter(|w| !w.is_finalized()).collect();

                if failed {
                    for wrapup in pending {
                        self.fail_workload(wrapup, STATUS_FAILED_PARENT, "Parent workload failed")
                            .await?;
                    }
                } else if !pending.is_empty() {
                    for wrapup in pending {
                        if let Err(e) = self.launch_from_record(wrapup).await {
                            error!(workload_id = wrapup.id, error = %e, "Wrapup did not launch");
                            if !self.load(wrapup.id).await?.is_finalized() {
                                self.fail_workload(
                                    wrapup,
                                    STATUS_FAILED,
                                    &format!("Did not launch. {}", e),
                                )
                                .await?;
                            }
                            wrapup_failure = Some(e.to_string());
                            break;
                        }
                    }
                    if wrapup_failure.is_none() {
                        info!(workload_id = workload.id, "Waiting for wrapups");
                        return Ok(FinalizeOutcome::AwaitingWrapup);
                    }
                } else if launched.iter().any(|w| !w.is_finalized()) {
                    debug!(workload_id = workload.id, "Wrapups still running");
                    return Ok(FinalizeOutcome::AwaitingWrapup);
                }
            }
            if wrapup_failure.is_some() {
                failed = true;
            }

            let log_paths = self.capture_logs(workload).await;

            let (status, details) = if failed {
                let status = match workload.last_real_status() {
                    Some(s) if s.starts_with(STATUS_FAILED) => s.to_string(),
                    _ if wrapup_failure.is_some() => "Failed wrapup".to_string(),
                    _ if workload.latest_task_snapshot().is_some_and(|t| t.node_error) => {
                        STATUS_FAILED_SWARM.to_string()
                    }
                    _ => STATUS_FAILED.to_string(),
                };
                let details = wrapup_failure
                    .or_else(|| failed_task_message(workload))
                    .unwrap_or_else(|| FAILURE_DETAILS.to_string());
                (status, details)
            } else {
                match self.register_outputs(workload).await {
                    Ok(()) => (STATUS_COMPLETE.to_string(), "Completed".to_string()),
                    Err(details) => (STATUS_FAILED_UPLOAD.to_string(), details),
                }
            };

            if let Err(e) = self.backend.remove(workload).await {
                warn!(workload_id = workload.id, error = %e, "Failed to remove resources");
            }

            let mut entry = HistoryEntry::from_system(status.clone(), details.clone());
            if let Some(code) = exit_code.filter(|c| !c.trim().is_empty()) {
                entry = entry.with_exit_code(code);
            }
            self.store.append_history(workload.id, entry).await?;
            if !log_paths.is_empty() {
                self.store.record_log_paths(workload.id, &log_paths).await?;
            }

            self.set_workflow(workload.workflow_id.as_deref(), &status, Some(&details))
                .await;

            let name = workload.wrapper_name.as_deref().unwrap_or("Container");
            self.notify(
                &format!("{} {}", name, status),
                &format!(
                    "<p>Dear {},</p><p>Workload {} finished with status {}.</p><p>{}</p>",
                    escape_html(&workload.username),
                    workload.id,
                    escape_html(&status),
                    escape_html(&details)
                ),
            )
            .await;

            info!(workload_id = workload.id, status = %status, "Workload finalized");

            if let Some(parent_id) = workload.parent_id {
                self.check_parent(parent_id, workload.role).await?;
            }

            Ok(if status == STATUS_COMPLETE {
                FinalizeOutcome::Completed
            } else {
                FinalizeOutcome::Failed
            })
        })
    }

    /// Advance a parent once its setup or wrapup children settle.
    async fn check_parent(&self, parent_id: i64, role: WorkloadRole) -> Result<()> {
        let parent = self.load(parent_id).await?;
        if parent.is_finalized() {
            return Ok(());
        }

        let children = self.store.list_children(parent_id, role).await?;
        let failed_status = format!("Failed {}", role.as_str());

        let any_failed = children.iter().any(|c| {
            c.is_finalized()
                && (history::exit_code_is_failed(c.exit_code()) || c.status() != STATUS_COMPLETE)
        });
        if any_failed {
            for child in children.iter().filter(|c| !c.is_finalized() && c.is_launched()) {
                if let Err(e) = self.backend.kill(child).await {
                    warn!(workload_id = child.id, error = %e, "Failed to kill sibling");
                }
            }
            if role == WorkloadRole::Setup {
                let wrapups = self
                    .store
                    .list_children(parent_id, WorkloadRole::Wrapup)
                    .await?;
                for wrapup in wrapups.iter().filter(|w| !w.is_launched() && !w.is_finalized()) {
                    self.fail_workload(wrapup, STATUS_FAILED_PARENT, "Setup failed")
                        .await?;
                }
            }
            if let Err(e) = self.backend.remove(&parent).await {
                debug!(workload_id = parent.id, error = %e, "Failed to remove parent resources");
            }
            return self
                .fail_workload(
                    &parent,
                    &failed_status,
                    &format!("One or more {} workloads failed", role.as_str()),
                )
                .await;
        }

        if children.iter().any(|c| !c.is_finalized()) {
            debug!(parent_id, role = role.as_str(), "Siblings still running");
            return Ok(());
        }

        if children.iter().all(|c| c.exit_code().is_none()) {
            return self
                .fail_workload(
                    &parent,
                    &failed_status,
                    &format!("No {} workload reported an exit code", role.as_str()),
                )
                .await;
        }

        match role {
            WorkloadRole::Setup => {
                info!(parent_id, "Setups complete, starting workload");
                self.start(&parent).await
            }
            WorkloadRole::Wrapup => {
                info!(parent_id, "Wrapups complete, finishing workload");
                self.finalize(&parent, parent.exit_code(), true).await?;
                Ok(())
            }
            WorkloadRole::Main => Ok(()),
        }
    }

    pub(crate) async fn fail_workload(&self, workload: &Workload, status: &str, details: &str) -> Result<()> {
        warn!(workload_id = workload.id, status, details, "Marking workload failed");
        self.store
            .append_history(workload.id, HistoryEntry::from_system(status, details))
            .await?;
        self.set_workflow(workload.workflow_id.as_deref(), status, Some(details))
            .await;
        Ok(())
    }

    /// Register declared outputs. A failed required output yields the
    /// failure details.
    async fn register_outputs(&self, workload: &Workload) -> std::result::Result<(), String> {
        for output in &workload.outputs {
            if let Err(e) = self.outputs.register(workload, output).await {
                if output.required {
                    return Err(format!("Failed to upload required output {}: {}", output.name, e));
                }
                warn!(workload_id = workload.id, output = %output.name, error = %e, "Optional output not registered");
            }
        }
        Ok(())
    }

    /// Write stdout/stderr under the log directory. Failures are logged.
    async fn capture_logs(&self, workload: &Workload) -> Vec<String> {
        let Some(log_dir) = &self.config.log_dir else {
            return Vec::new();
        };
        if !workload.is_launched() {
            return Vec::new();
        }

        let dir = log_dir
            .join(Utc::now().format("%Y%m%d_%H%M%S%f").to_string())
            .join("LOGS")
            .join(workload.role.as_str());
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            warn!(workload_id = workload.id, path = %dir.display(), error = %e, "Failed to create log directory");
            return Vec::new();
        }

        let mut paths = Vec::new();
        for stream in [LogStream::Stdout, LogStream::Stderr] {
            match self.backend.logs(workload, stream).await {
                Ok(Some(text)) => {
                    let path = dir.join(format!("{}.log", stream.as_str()));
                    match tokio::fs::write(&path, text).await {
                        Ok(()) => paths.push(path.display().to_string()),
                        Err(e) => {
                            warn!(workload_id = workload.id, path = %path.display(), error = %e, "Failed to write log")
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(workload_id = workload.id, stream = stream.as_str(), error = %e, "Failed to read logs")
                }
            }
        }
        paths
    }
}

/// Message of the newest `failed` service entry.
fn failed_task_message(workload: &Workload) -> Option<String> {
    workload
        .history
        .iter()
        .rev()
        .find(|e| e.source == SourceKind::Service && e.status == "failed")
        .and_then(|e| e.message.clone())
}
