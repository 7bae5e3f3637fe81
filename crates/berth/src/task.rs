// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Orchestrator task model and state classification.
//!
//! A [`Task`] is built fresh from the orchestrator on every reconciliation
//! and is never persisted; what survives is the history entry synthesized
//! from it.

use chrono::{DateTime, Utc};

use crate::backend::{BackendError, Result};

/// Message stored on a task abandoned because its node went away.
pub const NODE_ERROR_MESSAGE: &str = "Swarm node error";

const EXITED_STATES: &[&str] = &["failed", "complete", "completed", "rejected", "shutdown"];
const NOT_STARTED_STATES: &[&str] = &[
    "new",
    "allocated",
    "pending",
    "assigned",
    "accepted",
    "preparing",
    "ready",
    "starting",
];
const SUCCESS_STATES: &[&str] = &["complete", "completed"];

/// State is one of the exit states.
pub fn has_exited(state: &str) -> bool {
    EXITED_STATES.contains(&state)
}

/// State is one of the pre-running states.
pub fn has_not_started(state: &str) -> bool {
    NOT_STARTED_STATES.contains(&state)
}

/// State is the success state.
pub fn is_success_state(state: &str) -> bool {
    SUCCESS_STATES.contains(&state)
}

/// Whether the orchestrator abandoned the task because its node was lost.
pub fn is_node_loss(state: &str, desired_state: Option<&str>, exit_code: Option<i64>) -> bool {
    let abandoned = desired_state == Some("shutdown") || exit_code.is_some_and(|c| c < 0);
    (!has_exited(state) && abandoned) || state == "shutdown"
}

/// One orchestrator attempt to run a service.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Task {
    /// Service the task belongs to.
    pub service_id: String,
    /// Orchestrator task id.
    pub task_id: Option<String>,
    /// Node the task was scheduled on.
    pub node_id: Option<String>,
    /// Current state.
    pub state: String,
    /// State the orchestrator wants the task in.
    pub desired_state: Option<String>,
    /// Container running the task.
    pub container_id: Option<String>,
    /// Container exit code.
    pub exit_code: Option<i64>,
    /// Node-loss flag, set by [`Task::classify`].
    pub node_error: bool,
    /// Orchestrator status message.
    pub message: Option<String>,
    /// Orchestrator error string.
    pub err: Option<String>,
    /// Timestamp of the reported state.
    pub status_time: Option<DateTime<Utc>>,
}

impl Task {
    /// Compute the node-loss flag, replacing the message with the sentinel on loss.
    pub fn classify(mut self) -> Self {
        self.node_error = is_node_loss(&self.state, self.desired_state.as_deref(), self.exit_code);
        if self.node_error {
            self.message = Some(NODE_ERROR_MESSAGE.to_string());
        }
        self
    }

    /// See [`has_exited`].
    pub fn is_exited(&self) -> bool {
        has_exited(&self.state)
    }

    /// See [`has_not_started`].
    pub fn not_started(&self) -> bool {
        has_not_started(&self.state)
    }

    /// See [`is_success_state`].
    pub fn succeeded(&self) -> bool {
        is_success_state(&self.state)
    }
}

/// Reduce a name-filtered task listing to at most one task.
pub fn pick_single_task<T>(service_id: &str, service_name: &str, mut tasks: Vec<T>) -> Result<Option<T>> {
    match tasks.len() {
        0 => Ok(None),
        1 => Ok(tasks.pop()),
        count => Err(BackendError::AmbiguousTask {
            service_id: service_id.to_string(),
            service_name: service_name.to_string(),
            count,
        }),
    }
}
