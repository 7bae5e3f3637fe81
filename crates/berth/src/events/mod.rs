// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runtime and orchestrator events.
//!
//! Container events come from the runtime's event stream. Task events are
//! synthesized by polling the orchestrator. [`EventIngestion`] drives both.

mod ingestion;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::task::Task;
pub use ingestion::{EventIngestion, EventIngestionConfig};

const EXIT_STATUSES: &[&str] = &["kill", "die", "oom"];
const SUCCESS_STATUSES: &[&str] = &["die"];
const IGNORED_STATUSES: &[&str] = &["kill", "destroy"];

/// Status reported when a container exits on its own.
pub fn is_success_status(status: &str) -> bool {
    SUCCESS_STATUSES.contains(&status)
}

/// One container runtime event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerEvent {
    /// Event action (`start`, `die`, `oom`, ...).
    pub status: String,
    /// Container the event is about.
    pub container_id: String,
    /// Event time in seconds.
    pub time: i64,
    /// Event time in nanoseconds, when reported.
    pub time_nano: Option<i64>,
    /// Actor attributes.
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl ContainerEvent {
    /// Event time, preferring nanosecond precision.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        match self.time_nano {
            Some(nanos) => Some(DateTime::from_timestamp_nanos(nanos)),
            None => DateTime::from_timestamp(self.time, 0),
        }
    }

    /// Terminal for the container.
    pub fn is_exit(&self) -> bool {
        EXIT_STATUSES.contains(&self.status.as_str())
    }

    /// Exit that is not a kill or out-of-memory.
    pub fn is_success(&self) -> bool {
        is_success_status(&self.status)
    }

    /// Cleanup noise that is dropped before dispatch.
    pub fn is_ignored(&self) -> bool {
        IGNORED_STATUSES.contains(&self.status.as_str())
    }

    /// `exitCode` attribute for exit events; blank when the runtime left it out.
    pub fn exit_code(&self) -> Option<String> {
        if !self.is_exit() {
            return None;
        }
        Some(self.attributes.get("exitCode").cloned().unwrap_or_default())
    }
}

/// Event synthesized for a service workload.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskEvent {
    /// A freshly observed task.
    ProcessTask(Task),
    /// The service's node was lost.
    Restart,
    /// Task has not started, or the workload is waiting to be finalized.
    Waiting,
}

impl TaskEvent {
    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            TaskEvent::ProcessTask(_) => "process_task",
            TaskEvent::Restart => "restart",
            TaskEvent::Waiting => "waiting",
        }
    }
}
