// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Append-only workload history and the projections computed from it.
//!
//! Nothing in this module stores a "current status". The current status,
//! the last real status, the exit code and the restart count are all pure
//! functions of the ordered entry list, so they cannot drift from the log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::events::ContainerEvent;
use crate::task::Task;

/// Initial status of every workload.
pub const STATUS_CREATED: &str = "Created";
/// Workload is waiting to be finalized, or has not started yet.
pub const STATUS_WAITING: &str = "Waiting";
/// Finalize routine is running.
pub const STATUS_FINALIZING: &str = "Finalizing";
/// Service was relaunched after a node loss.
pub const STATUS_RESTART: &str = "Restart";
/// Terminal success status.
pub const STATUS_COMPLETE: &str = "Complete";
/// Terminal failure status; variants append a parenthesised reason.
pub const STATUS_FAILED: &str = "Failed";
/// User kill action.
pub const STATUS_KILL: &str = "kill";
/// Prefix marking a workload that has a finalize request in flight.
pub const QUEUED_PREFIX: &str = "_";

/// Failure caused by repeated node loss.
pub const STATUS_FAILED_SWARM: &str = "Failed (Swarm)";
/// Wrapup never ran because its parent failed.
pub const STATUS_FAILED_PARENT: &str = "Failed (Parent)";
/// Required outputs could not be registered.
pub const STATUS_FAILED_UPLOAD: &str = "Failed (Upload)";
/// Workload stayed in `Finalizing` past the recovery timeout.
pub const STATUS_FAILED_FINALIZING: &str = "Failed (Finalizing)";

/// Where a history entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// This process.
    System,
    /// A user action.
    User,
    /// A container runtime event.
    Event,
    /// An orchestrator task observation.
    Service,
}

impl SourceKind {
    /// Wire/database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::System => "system",
            SourceKind::User => "user",
            SourceKind::Event => "event",
            SourceKind::Service => "service",
        }
    }

    /// Parse the database representation.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "system" => Some(SourceKind::System),
            "user" => Some(SourceKind::User),
            "event" => Some(SourceKind::Event),
            "service" => Some(SourceKind::Service),
            _ => None,
        }
    }
}

/// One status observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Status string.
    pub status: String,
    /// Source kind.
    pub source: SourceKind,
    /// Id of the source entity (container id, task id, username).
    pub source_id: Option<String>,
    /// When this process recorded the entry.
    pub recorded_at: DateTime<Utc>,
    /// Timestamp reported by the runtime/orchestrator.
    pub external_timestamp: Option<DateTime<Utc>>,
    /// Free-form message.
    pub message: Option<String>,
    /// Exit code as reported, possibly blank.
    pub exit_code: Option<String>,
}

impl HistoryEntry {
    /// Entry written by this process.
    pub fn from_system(status: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            source: SourceKind::System,
            source_id: None,
            recorded_at: Utc::now(),
            external_timestamp: None,
            message: Some(message.into()),
            exit_code: None,
        }
    }

    /// Entry recording a user action.
    pub fn from_user(status: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            source: SourceKind::User,
            source_id: Some(username.into()),
            recorded_at: Utc::now(),
            external_timestamp: None,
            message: None,
            exit_code: None,
        }
    }

    /// Entry translated from a container runtime event.
    pub fn from_container_event(event: &ContainerEvent) -> Self {
        Self {
            status: event.status.clone(),
            source: SourceKind::Event,
            source_id: Some(event.container_id.clone()),
            recorded_at: Utc::now(),
            external_timestamp: event.timestamp(),
            message: None,
            exit_code: event.exit_code(),
        }
    }

    /// Entry synthesized from an orchestrator task.
    ///
    /// The exit code is only kept once the task has exited on its own; a
    /// running container reports `0` and a lost node reports garbage.
    pub fn from_task(task: &Task) -> Self {
        let message = match (&task.message, &task.err) {
            (Some(message), Some(err)) => Some(format!("{}: {}", message, err)),
            (Some(message), None) => Some(message.clone()),
            (None, Some(err)) => Some(err.clone()),
            (None, None) => None,
        };
        Self {
            status: task.state.clone(),
            source: SourceKind::Service,
            source_id: task.task_id.clone(),
            recorded_at: Utc::now(),
            external_timestamp: task.status_time,
            message,
            exit_code: task
                .exit_code
                .filter(|_| task.is_exited() && !task.node_error)
                .map(|c| c.to_string()),
        }
    }

    /// Builder-style exit code.
    pub fn with_exit_code(mut self, exit_code: impl Into<String>) -> Self {
        self.exit_code = Some(exit_code.into());
        self
    }

    /// Builder-style source id.
    pub fn with_source_id(mut self, source_id: impl Into<String>) -> Self {
        self.source_id = Some(source_id.into());
        self
    }

    fn order_key(&self) -> DateTime<Utc> {
        self.external_timestamp.unwrap_or(self.recorded_at)
    }
}

/// Most recent entry by timestamp, ties broken by later insertion.
pub fn current(entries: &[HistoryEntry]) -> Option<&HistoryEntry> {
    newest(entries.iter())
}

/// Most recent entry that is not a side annotation.
pub fn last_real(entries: &[HistoryEntry]) -> Option<&HistoryEntry> {
    newest(entries.iter().filter(|e| !is_annotation(&e.status)))
}

/// Most recent orchestrator task observation.
pub fn latest_service_entry(entries: &[HistoryEntry]) -> Option<&HistoryEntry> {
    newest(entries.iter().filter(|e| e.source == SourceKind::Service))
}

fn newest<'a>(entries: impl Iterator<Item = &'a HistoryEntry>) -> Option<&'a HistoryEntry> {
    entries
        .enumerate()
        .max_by_key(|(idx, e)| (e.order_key(), *idx))
        .map(|(_, e)| e)
}

/// First non-null exit code, scanning oldest-first by insertion.
///
/// A blank code counts as a hit: a later duplicate terminal event must not
/// replace the value recorded with the first one.
pub fn exit_code(entries: &[HistoryEntry]) -> Option<&str> {
    entries.iter().find_map(|e| e.exit_code.as_deref())
}

/// Number of `Restart` entries.
pub fn restart_count(entries: &[HistoryEntry]) -> usize {
    entries
        .iter()
        .filter(|e| e.status == STATUS_RESTART)
        .count()
}

/// Whether `candidate` repeats an already stored observation.
pub fn is_duplicate(entries: &[HistoryEntry], candidate: &HistoryEntry) -> bool {
    let Some(ts) = candidate.external_timestamp else {
        return false;
    };
    entries.iter().any(|e| {
        e.status == candidate.status
            && e.source == candidate.source
            && e.external_timestamp == Some(ts)
    })
}

/// `Complete` or any `Failed...` status.
pub fn is_terminal_status(status: &str) -> bool {
    status == STATUS_COMPLETE || status.starts_with(STATUS_FAILED)
}

/// Status carries the queued-for-finalize marker.
pub fn is_queued(status: &str) -> bool {
    status.starts_with(QUEUED_PREFIX)
}

/// Queued marker for `status`.
pub fn queued_status(status: &str) -> String {
    format!("{}{}", QUEUED_PREFIX, status)
}

/// Strip the queued marker, if present.
pub fn unqueued_status(status: &str) -> &str {
    status.strip_prefix(QUEUED_PREFIX).unwrap_or(status)
}

/// Statuses that do not replace the last real status.
pub fn is_annotation(status: &str) -> bool {
    status == STATUS_RESTART
        || status == STATUS_WAITING
        || status == STATUS_FINALIZING
        || is_queued(status)
}

/// Non-zero numeric exit code. Blank, missing and unparseable codes are not failures.
pub fn exit_code_is_failed(exit_code: Option<&str>) -> bool {
    exit_code
        .map(str::trim)
        .and_then(|c| c.parse::<i64>().ok())
        .is_some_and(|c| c != 0)
}
