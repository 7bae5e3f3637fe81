// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Execution backends.
//!
//! An [`ExecutionBackend`] turns launch plans and workload records into
//! calls against a container runtime. Plain containers and clustered
//! services share the interface; implementations switch on
//! [`ExecutionMode`] at the boundary.
//!
//! Backends are PURE runtime adapters - they do NOT touch the workload
//! store. Persistence is handled by the orchestrator.

pub mod docker;
pub mod mock;
pub mod prepare;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::events::ContainerEvent;
use crate::task::Task;
use crate::workload::{ExecutionMode, LaunchPlan, Workload};

pub use docker::DockerBackend;
pub use mock::MockBackend;

/// Errors from backend operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BackendError {
    /// No execution server is configured.
    #[error("No container server is configured")]
    NotConfigured,

    /// Transport or authentication failure.
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    /// The id does not exist on the backend.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The plan is malformed.
    #[error("{0}")]
    InvalidRequest(String),

    /// More than one task matched a service name.
    #[error("Found {count} tasks for service {service_id} (name {service_name}); expected at most one")]
    AmbiguousTask {
        /// Service id.
        service_id: String,
        /// Service name used for the lookup.
        service_name: String,
        /// Number of matching tasks.
        count: usize,
    },

    /// Local mount preparation failed.
    #[error("Could not prepare {path}: {reason}")]
    ResourceSetup {
        /// Offending path.
        path: String,
        /// Reason.
        reason: String,
    },
}

impl BackendError {
    /// Only transport failures are worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BackendError::Unavailable(_))
    }

    /// Short name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            BackendError::NotConfigured => "NotConfigured",
            BackendError::Unavailable(_) => "BackendUnavailable",
            BackendError::NotFound(_) => "NotFound",
            BackendError::InvalidRequest(_) => "InvalidRequest",
            BackendError::AmbiguousTask { .. } => "AmbiguousTaskError",
            BackendError::ResourceSetup { .. } => "ResourceSetupError",
        }
    }
}

/// Result type for backend operations.
pub type Result<T> = std::result::Result<T, BackendError>;

/// Runtime identity of a freshly created workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Launched {
    /// Mode the workload was created in.
    pub mode: ExecutionMode,
    /// Container id or service id.
    pub runtime_id: String,
}

/// Status reported by the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeStatus {
    /// Runtime state string.
    pub state: String,
    /// Exit code, if exited.
    pub exit_code: Option<i64>,
}

/// Log stream selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

impl LogStream {
    /// File stem used for captured logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStream::Stdout => "stdout",
            LogStream::Stderr => "stderr",
        }
    }
}

/// Container runtime adapter.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Backend type identifier (e.g., "docker", "mock").
    fn backend_type(&self) -> &'static str;

    /// Whether the execution server answers. Never errors.
    async fn ping(&self) -> bool;

    /// Create a workload without starting it.
    ///
    /// Mounts are prepared and ports validated before any runtime call, so
    /// a rejected plan leaves nothing behind.
    async fn launch(&self, plan: &LaunchPlan, acting_user: &str) -> Result<Launched>;

    /// Start a created workload. Services are scaled to one replica.
    async fn start(&self, workload: &Workload) -> Result<()>;

    /// Runtime status of the workload.
    async fn status(&self, workload: &Workload) -> Result<RuntimeStatus>;

    /// Full contents of one log stream, `None` when nothing was captured.
    async fn logs(&self, workload: &Workload, stream: LogStream) -> Result<Option<String>>;

    /// Container events in `[since, until]`.
    async fn container_events(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<ContainerEvent>>;

    /// Kill a container, or remove a service.
    async fn kill(&self, workload: &Workload) -> Result<()>;

    /// Remove runtime resources. No-op unless auto-cleanup is enabled.
    async fn remove(&self, workload: &Workload) -> Result<()>;

    /// Current task of a service workload, `None` when not yet scheduled.
    async fn resolve_task_for_service(&self, workload: &Workload) -> Result<Option<Task>>;
}
