// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workload records and launch plans.

pub mod history;

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::task::{NODE_ERROR_MESSAGE, Task};
pub use history::{HistoryEntry, SourceKind};

/// How a workload runs on the execution server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// A single, directly managed container.
    Container,
    /// An orchestrator-managed service.
    Service,
}

impl ExecutionMode {
    /// Database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Container => "container",
            ExecutionMode::Service => "service",
        }
    }

    /// Parse the database representation.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "container" => Some(ExecutionMode::Container),
            "service" => Some(ExecutionMode::Service),
            _ => None,
        }
    }
}

/// Position of a workload in a setup/main/wrapup group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadRole {
    /// The requested job.
    Main,
    /// Runs before its parent starts.
    Setup,
    /// Runs after its parent finishes.
    Wrapup,
}

impl WorkloadRole {
    /// Database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadRole::Main => "main",
            WorkloadRole::Setup => "setup",
            WorkloadRole::Wrapup => "wrapup",
        }
    }

    /// Parse the database representation.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "main" => Some(WorkloadRole::Main),
            "setup" => Some(WorkloadRole::Setup),
            "wrapup" => Some(WorkloadRole::Wrapup),
            _ => None,
        }
    }
}

/// A bind mount.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MountSpec {
    /// Mount name, referenced by outputs.
    pub name: String,
    /// Writable inside the container.
    pub writable: bool,
    /// Path on the platform host.
    pub host_path: String,
    /// Path inside the container.
    pub container_path: String,
    /// The host path names a single file, not a directory.
    #[serde(default)]
    pub file: bool,
}

/// A declared output, registered during finalize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSpec {
    /// Output name.
    pub name: String,
    /// Name of the mount holding the output.
    pub mount: String,
    /// Path relative to the mount root.
    pub path: String,
    /// Missing or failed registration fails the workload.
    pub required: bool,
}

/// Everything the backend needs to create a workload.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LaunchPlan {
    /// Image reference.
    pub image: String,
    /// Command line.
    pub command_line: String,
    /// Run the command line through `/bin/sh -c` with the entrypoint cleared.
    #[serde(default)]
    pub override_entrypoint: bool,
    /// Working directory.
    pub working_directory: Option<String>,
    /// Environment variables.
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// Container port to host port.
    #[serde(default)]
    pub ports: BTreeMap<String, String>,
    /// Bind mounts.
    #[serde(default)]
    pub mounts: Vec<MountSpec>,
    /// Memory reservation in megabytes.
    pub reserve_memory_mb: Option<i64>,
    /// Memory limit in megabytes.
    pub limit_memory_mb: Option<i64>,
    /// CPU limit in fractional cores.
    pub limit_cpu: Option<f64>,
    /// Placement constraints, services only.
    #[serde(default)]
    pub placement_constraints: Vec<String>,
}

/// Fully resolved, already validated launch descriptor.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResolvedLaunchDescriptor {
    /// Plan for the main workload.
    pub plan: LaunchPlan,
    /// Setup workloads, run before the main workload.
    #[serde(default)]
    pub setup: Vec<ResolvedLaunchDescriptor>,
    /// Wrapup workloads, run after the main workload.
    #[serde(default)]
    pub wrapup: Vec<ResolvedLaunchDescriptor>,
    /// Input values as submitted.
    #[serde(default)]
    pub raw_inputs: BTreeMap<String, String>,
    /// Input values after resolution.
    #[serde(default)]
    pub resolved_inputs: BTreeMap<String, String>,
    /// Names of inputs that must never be logged.
    #[serde(default)]
    pub sensitive_inputs: BTreeSet<String>,
    /// Declared outputs.
    #[serde(default)]
    pub outputs: Vec<OutputSpec>,
    /// Wrapper the descriptor was resolved from.
    pub wrapper_id: Option<String>,
    /// Command the descriptor was resolved from.
    pub command_id: Option<String>,
    /// Wrapper display name.
    pub wrapper_name: Option<String>,
}

impl ResolvedLaunchDescriptor {
    /// Resolved inputs with sensitive values replaced by `*****`.
    pub fn masked_inputs(&self) -> BTreeMap<String, String> {
        mask_inputs(&self.resolved_inputs, &self.sensitive_inputs)
    }
}

/// Replace the values of `sensitive` keys with `*****`.
pub fn mask_inputs(
    inputs: &BTreeMap<String, String>,
    sensitive: &BTreeSet<String>,
) -> BTreeMap<String, String> {
    inputs
        .iter()
        .map(|(k, v)| {
            let value = if sensitive.contains(k) {
                "*****".to_string()
            } else {
                v.clone()
            };
            (k.clone(), value)
        })
        .collect()
}

/// A launched (or pending) unit of work and its history.
#[derive(Debug, Clone, PartialEq)]
pub struct Workload {
    /// Store identity.
    pub id: i64,
    /// Execution mode.
    pub mode: ExecutionMode,
    /// Role within its group.
    pub role: WorkloadRole,
    /// Parent workload for setup/wrapup.
    pub parent_id: Option<i64>,
    /// Container id; in service mode, the cached task container.
    pub container_id: Option<String>,
    /// Service id, service mode only.
    pub service_id: Option<String>,
    /// Cached task id.
    pub task_id: Option<String>,
    /// Cached node id.
    pub node_id: Option<String>,
    /// Plan the workload was (or will be) launched from.
    pub plan: LaunchPlan,
    /// Declared outputs.
    pub outputs: Vec<OutputSpec>,
    /// Workflow handle.
    pub workflow_id: Option<String>,
    /// Acting user.
    pub username: String,
    /// Owning project.
    pub project: Option<String>,
    /// Wrapper display name.
    pub wrapper_name: Option<String>,
    /// Captured log files.
    pub log_paths: Vec<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// History in insertion order.
    pub history: Vec<HistoryEntry>,
}

impl Workload {
    /// Container id or service id, selected by mode.
    pub fn runtime_id(&self) -> Option<&str> {
        match self.mode {
            ExecutionMode::Container => self.container_id.as_deref(),
            ExecutionMode::Service => self.service_id.as_deref(),
        }
    }

    /// Current status projection.
    pub fn status(&self) -> &str {
        history::current(&self.history)
            .map(|e| e.status.as_str())
            .unwrap_or_default()
    }

    /// Timestamp of the current status entry.
    pub fn status_time(&self) -> Option<DateTime<Utc>> {
        history::current(&self.history).map(|e| e.external_timestamp.unwrap_or(e.recorded_at))
    }

    /// Latest status that is not a side annotation.
    pub fn last_real_status(&self) -> Option<&str> {
        history::last_real(&self.history).map(|e| e.status.as_str())
    }

    /// See [`history::exit_code`].
    pub fn exit_code(&self) -> Option<&str> {
        history::exit_code(&self.history)
    }

    /// See [`history::restart_count`].
    pub fn restart_count(&self) -> usize {
        history::restart_count(&self.history)
    }

    /// Task rebuilt from the newest service entry, else the newest entry.
    pub fn latest_task_snapshot(&self) -> Option<Task> {
        let entry = history::latest_service_entry(&self.history)
            .or_else(|| history::current(&self.history))?;
        let message = entry.message.clone();
        Some(Task {
            service_id: self.service_id.clone().unwrap_or_default(),
            task_id: self.task_id.clone(),
            node_id: self.node_id.clone(),
            state: entry.status.clone(),
            desired_state: None,
            container_id: self.container_id.clone(),
            exit_code: entry
                .exit_code
                .as_deref()
                .and_then(|c| c.trim().parse().ok()),
            node_error: message
                .as_deref()
                .is_some_and(|m| m.starts_with(NODE_ERROR_MESSAGE)),
            message,
            err: None,
            status_time: entry.external_timestamp,
        })
    }

    /// Terminal status reached.
    pub fn is_finalized(&self) -> bool {
        history::is_terminal_status(self.status())
    }

    /// Status is `Waiting`.
    pub fn is_waiting(&self) -> bool {
        self.status() == history::STATUS_WAITING
    }

    /// Status is `Finalizing`.
    pub fn is_finalizing(&self) -> bool {
        self.status() == history::STATUS_FINALIZING
    }

    /// Has a runtime identity.
    pub fn is_launched(&self) -> bool {
        self.runtime_id().is_some()
    }

    /// A user kill was recorded.
    pub fn was_killed(&self) -> bool {
        self.history
            .iter()
            .any(|e| e.source == SourceKind::User && e.status == history::STATUS_KILL)
    }
}

/// Values for a workload about to be stored.
#[derive(Debug, Clone)]
pub struct NewWorkload {
    /// Execution mode.
    pub mode: ExecutionMode,
    /// Role within its group.
    pub role: WorkloadRole,
    /// Parent workload.
    pub parent_id: Option<i64>,
    /// Runtime identity, if launched.
    pub runtime_id: Option<String>,
    /// Launch plan.
    pub plan: LaunchPlan,
    /// Declared outputs.
    pub outputs: Vec<OutputSpec>,
    /// Workflow handle.
    pub workflow_id: Option<String>,
    /// Acting user.
    pub username: String,
    /// Owning project.
    pub project: Option<String>,
    /// Wrapper display name.
    pub wrapper_name: Option<String>,
}

/// Runtime identifiers, written together.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeBinding {
    /// Container id.
    pub container_id: Option<String>,
    /// Service id.
    pub service_id: Option<String>,
    /// Task id.
    pub task_id: Option<String>,
    /// Node id.
    pub node_id: Option<String>,
}

impl RuntimeBinding {
    /// Current binding of `workload`.
    pub fn of(workload: &Workload) -> Self {
        Self {
            container_id: workload.container_id.clone(),
            service_id: workload.service_id.clone(),
            task_id: workload.task_id.clone(),
            node_id: workload.node_id.clone(),
        }
    }
}
