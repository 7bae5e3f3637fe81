// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for berth.
//!
//! [`BerthRuntime`] wires the store, the execution backend and the platform
//! collaborators into running background tasks: the staging and finalizing
//! stages and event ingestion. Orphan recovery runs once before they start.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use berth::backend::docker::DockerBackend;
//! use berth::runtime::BerthRuntime;
//! use berth::server::ServerSettings;
//! use berth::store::PostgresStore;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let pool = sqlx::PgPool::connect("postgres://...").await?;
//!     let settings = ServerSettings::new(None);
//!
//!     let runtime = BerthRuntime::builder()
//!         .store(Arc::new(PostgresStore::new(pool)))
//!         .backend(Arc::new(DockerBackend::new(settings)))
//!         .resolver(Arc::new(MyResolver))
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... submit launches ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backend::ExecutionBackend;
use crate::collaborators::{
    AdminNotifier, DescriptorResolver, NoopOutputRegistrar, OutputRegistrar, TracingNotifier,
    TracingWorkflowTracker, WorkflowTracker, escape_html,
};
use crate::events::{EventIngestion, EventIngestionConfig};
use crate::orchestrator::{Orchestrator, OrchestratorConfig};
use crate::orphan_recovery::{OrphanRecoveryConfig, RecoveryReport, recover_orphaned_workloads};
use crate::queue::{
    self, ConcurrencyBounds, FinalizeConsumer, FinalizeRequest, LaunchConsumer, LaunchRequest,
    QueueKind, QueueSender, QueueSettings, StageRunner,
};
use crate::store::WorkloadStore;

/// Builder for creating a [`BerthRuntime`].
pub struct BerthRuntimeBuilder {
    store: Option<Arc<dyn WorkloadStore>>,
    backend: Option<Arc<dyn ExecutionBackend>>,
    resolver: Option<Arc<dyn DescriptorResolver>>,
    workflows: Arc<dyn WorkflowTracker>,
    notifier: Arc<dyn AdminNotifier>,
    outputs: Arc<dyn OutputRegistrar>,
    event_poll_interval: Duration,
    not_started_threshold: u32,
    max_restarts: usize,
    staging_concurrency: ConcurrencyBounds,
    finalizing_concurrency: ConcurrencyBounds,
    queue_capacity: usize,
    log_dir: Option<PathBuf>,
    primary_node: bool,
    finalizing_timeout: Duration,
}

impl Default for BerthRuntimeBuilder {
    fn default() -> Self {
        Self {
            store: None,
            backend: None,
            resolver: None,
            workflows: Arc::new(TracingWorkflowTracker),
            notifier: Arc::new(TracingNotifier),
            outputs: Arc::new(NoopOutputRegistrar),
            event_poll_interval: Duration::from_secs(10),
            not_started_threshold: 10,
            max_restarts: 5,
            staging_concurrency: ConcurrencyBounds::default(),
            finalizing_concurrency: ConcurrencyBounds::default(),
            queue_capacity: 1000,
            log_dir: None,
            primary_node: true,
            finalizing_timeout: Duration::from_secs(72 * 3600), // 72 hours
        }
    }
}

impl BerthRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the workload store (required).
    pub fn store(mut self, store: Arc<dyn WorkloadStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the execution backend (required).
    pub fn backend(mut self, backend: Arc<dyn ExecutionBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Set the descriptor resolver. Without one, the staging stage is not
    /// started and [`BerthRuntime::submit_launch`] is refused.
    pub fn resolver(mut self, resolver: Arc<dyn DescriptorResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Set the workflow tracker.
    pub fn workflows(mut self, workflows: Arc<dyn WorkflowTracker>) -> Self {
        self.workflows = workflows;
        self
    }

    /// Set the administrator notifier.
    pub fn notifier(mut self, notifier: Arc<dyn AdminNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Set the output registrar.
    pub fn outputs(mut self, outputs: Arc<dyn OutputRegistrar>) -> Self {
        self.outputs = outputs;
        self
    }

    /// Set the event ingestion poll interval.
    pub fn event_poll_interval(mut self, interval: Duration) -> Self {
        self.event_poll_interval = interval;
        self
    }

    /// Set how many not-started observations make a service `Waiting`.
    pub fn not_started_threshold(mut self, threshold: u32) -> Self {
        self.not_started_threshold = threshold;
        self
    }

    /// Set the restart budget for services lost with their node.
    pub fn max_restarts(mut self, max_restarts: usize) -> Self {
        self.max_restarts = max_restarts;
        self
    }

    /// Set the initial staging concurrency.
    pub fn staging_concurrency(mut self, bounds: ConcurrencyBounds) -> Self {
        self.staging_concurrency = bounds;
        self
    }

    /// Set the initial finalizing concurrency.
    pub fn finalizing_concurrency(mut self, bounds: ConcurrencyBounds) -> Self {
        self.finalizing_concurrency = bounds;
        self
    }

    /// Set the capacity of each stage queue.
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Set the directory captured logs are written to.
    pub fn log_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(path.into());
        self
    }

    /// Set whether this node runs orphan recovery.
    pub fn primary_node(mut self, primary: bool) -> Self {
        self.primary_node = primary;
        self
    }

    /// Set the age after which orphaned `Finalizing` workloads are failed.
    pub fn finalizing_timeout(mut self, timeout: Duration) -> Self {
        self.finalizing_timeout = timeout;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<BerthRuntimeConfig> {
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store is required"))?;
        let backend = self
            .backend
            .ok_or_else(|| anyhow::anyhow!("backend is required"))?;

        Ok(BerthRuntimeConfig {
            store,
            backend,
            resolver: self.resolver,
            workflows: self.workflows,
            notifier: self.notifier,
            outputs: self.outputs,
            event_poll_interval: self.event_poll_interval,
            not_started_threshold: self.not_started_threshold,
            max_restarts: self.max_restarts,
            staging_concurrency: self.staging_concurrency,
            finalizing_concurrency: self.finalizing_concurrency,
            queue_capacity: self.queue_capacity,
            log_dir: self.log_dir,
            primary_node: self.primary_node,
            finalizing_timeout: self.finalizing_timeout,
        })
    }
}

/// Configuration for a [`BerthRuntime`].
pub struct BerthRuntimeConfig {
    store: Arc<dyn WorkloadStore>,
    backend: Arc<dyn ExecutionBackend>,
    resolver: Option<Arc<dyn DescriptorResolver>>,
    workflows: Arc<dyn WorkflowTracker>,
    notifier: Arc<dyn AdminNotifier>,
    outputs: Arc<dyn OutputRegistrar>,
    event_poll_interval: Duration,
    not_started_threshold: u32,
    max_restarts: usize,
    staging_concurrency: ConcurrencyBounds,
    finalizing_concurrency: ConcurrencyBounds,
    queue_capacity: usize,
    log_dir: Option<PathBuf>,
    primary_node: bool,
    finalizing_timeout: Duration,
}

impl BerthRuntimeConfig {
    /// Start the runtime: run orphan recovery, then spawn the stages and
    /// event ingestion.
    pub async fn start(self) -> Result<BerthRuntime> {
        if !self.backend.ping().await {
            warn!(
                backend = self.backend.backend_type(),
                "Execution server did not answer ping"
            );
        }

        let recovery = match recover_orphaned_workloads(
            self.store.as_ref(),
            &OrphanRecoveryConfig {
                primary_node: self.primary_node,
                finalizing_timeout: self.finalizing_timeout,
            },
        )
        .await
        {
            Ok(report) => report,
            Err(e) => {
                warn!(error = %e, "Failed to recover orphaned workloads");
                RecoveryReport::default()
            }
        };

        let queue_settings = Arc::new(QueueSettings::new(
            self.staging_concurrency,
            self.finalizing_concurrency,
        ));

        let (finalize_tx, finalize_rx) =
            queue::channel::<FinalizeRequest>("finalizing", self.queue_capacity);

        let orchestrator = Arc::new(Orchestrator::new(
            self.store.clone(),
            self.backend.clone(),
            self.workflows.clone(),
            self.notifier.clone(),
            self.outputs.clone(),
            finalize_tx,
            OrchestratorConfig {
                max_restarts: self.max_restarts,
                log_dir: self.log_dir.clone(),
            },
        ));

        // Finalizing stage
        let finalize_runner = StageRunner::new(
            "finalizing",
            finalize_rx,
            queue_settings.subscribe(QueueKind::Finalizing),
            Arc::new(FinalizeConsumer::new(orchestrator.clone())),
        );
        let finalize_shutdown = finalize_runner.shutdown_handle();
        let finalize_handle = tokio::spawn(finalize_runner.run());

        // Staging stage, only with a resolver
        let (launch_queue, staging) = match self.resolver.clone() {
            Some(resolver) => {
                let (launch_tx, launch_rx) =
                    queue::channel::<LaunchRequest>("staging", self.queue_capacity);
                let runner = StageRunner::new(
                    "staging",
                    launch_rx,
                    queue_settings.subscribe(QueueKind::Staging),
                    Arc::new(LaunchConsumer::new(resolver, orchestrator.clone())),
                );
                let shutdown = runner.shutdown_handle();
                let handle = tokio::spawn(runner.run());
                (Some(launch_tx), Some((shutdown, handle)))
            }
            None => {
                debug!("No descriptor resolver configured; staging stage disabled");
                (None, None)
            }
        };

        // Event ingestion
        let ingestion = EventIngestion::new(
            orchestrator.clone(),
            EventIngestionConfig {
                poll_interval: self.event_poll_interval,
                not_started_threshold: self.not_started_threshold,
                ..Default::default()
            },
        );
        let ingestion_shutdown = ingestion.shutdown_handle();
        let ingestion_handle = tokio::spawn(async move {
            ingestion.run().await;
        });

        info!(
            backend = self.backend.backend_type(),
            staging = staging.is_some(),
            primary_node = self.primary_node,
            recovered = recovery.total(),
            "BerthRuntime started"
        );

        Ok(BerthRuntime {
            orchestrator,
            queue_settings,
            launch_queue,
            recovery,
            finalize_handle,
            finalize_shutdown,
            staging,
            ingestion_handle,
            ingestion_shutdown,
        })
    }
}

/// A running berth instance that can be embedded in an application.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct BerthRuntime {
    orchestrator: Arc<Orchestrator>,
    queue_settings: Arc<QueueSettings>,
    launch_queue: Option<QueueSender<LaunchRequest>>,
    recovery: RecoveryReport,
    finalize_handle: JoinHandle<()>,
    finalize_shutdown: Arc<Notify>,
    staging: Option<(Arc<Notify>, JoinHandle<()>)>,
    ingestion_handle: JoinHandle<()>,
    ingestion_shutdown: Arc<Notify>,
}

impl BerthRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> BerthRuntimeBuilder {
        BerthRuntimeBuilder::new()
    }

    /// The orchestrator, for direct operations such as kill.
    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Live stage concurrency settings.
    pub fn queue_settings(&self) -> &Arc<QueueSettings> {
        &self.queue_settings
    }

    /// What orphan recovery did at startup.
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery
    }

    /// Queue a launch request for staging.
    ///
    /// A refused message is reported to the administrator and returned as
    /// an error; it is not retried.
    pub async fn submit_launch(&self, request: LaunchRequest) -> crate::error::Result<()> {
        let Some(queue) = &self.launch_queue else {
            return Err(crate::error::Error::InvalidRequest(
                "staging is disabled: no descriptor resolver configured".to_string(),
            ));
        };

        let wrapper_id = request.wrapper_id.clone();
        let username = request.username.clone();
        if let Err(e) = queue.send(request) {
            error!(wrapper_id = %wrapper_id, error = %e, "Launch request refused");
            self.orchestrator
                .notify(
                    "Staging queue error",
                    &format!(
                        "<p>A launch of wrapper {} for user {} could not be queued.</p><p>{}</p>",
                        escape_html(&wrapper_id),
                        escape_html(&username),
                        escape_html(&e.to_string())
                    ),
                )
                .await;
            return Err(e);
        }
        Ok(())
    }

    /// Gracefully shut down the runtime.
    ///
    /// Signals event ingestion and both stages to stop, then waits for
    /// in-flight work to finish.
    pub async fn shutdown(self) -> Result<()> {
        info!("BerthRuntime shutting down...");

        self.ingestion_shutdown.notify_one();
        if let Some((shutdown, _)) = &self.staging {
            shutdown.notify_one();
        }
        self.finalize_shutdown.notify_one();

        if let Err(e) = self.ingestion_handle.await {
            error!("Event ingestion task panicked: {}", e);
        }

        if let Some((_, handle)) = self.staging
            && let Err(e) = handle.await
        {
            error!("Staging stage task panicked: {}", e);
        }

        if let Err(e) = self.finalize_handle.await {
            error!("Finalizing stage task panicked: {}", e);
        }

        info!("BerthRuntime shutdown complete");
        Ok(())
    }

    /// Check if the runtime is still running.
    pub fn is_running(&self) -> bool {
        let staging_running = self
            .staging
            .as_ref()
            .is_none_or(|(_, handle)| !handle.is_finished());

        !self.finalize_handle.is_finished() && !self.ingestion_handle.is_finished() && staging_running
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockBackend;
    use crate::store::MemoryStore;

    #[test]
    fn test_builder_default_values() {
        let builder = BerthRuntimeBuilder::default();

        assert!(builder.store.is_none());
        assert!(builder.backend.is_none());
        assert!(builder.resolver.is_none());
        assert_eq!(builder.event_poll_interval, Duration::from_secs(10));
        assert_eq!(builder.not_started_threshold, 10);
        assert_eq!(builder.max_restarts, 5);
        assert_eq!(builder.staging_concurrency, ConcurrencyBounds::default());
        assert_eq!(builder.finalizing_concurrency, ConcurrencyBounds::default());
        assert!(builder.log_dir.is_none());
        assert!(builder.primary_node);
        assert_eq!(builder.finalizing_timeout, Duration::from_secs(72 * 3600));
    }

    #[test]
    fn test_builder_chaining() {
        let builder = BerthRuntimeBuilder::new()
            .event_poll_interval(Duration::from_millis(250))
            .not_started_threshold(3)
            .max_restarts(2)
            .queue_capacity(16)
            .log_dir("/var/log/berth")
            .primary_node(false)
            .finalizing_timeout(Duration::from_secs(3600));

        assert_eq!(builder.event_poll_interval, Duration::from_millis(250));
        assert_eq!(builder.not_started_threshold, 3);
        assert_eq!(builder.max_restarts, 2);
        assert_eq!(builder.queue_capacity, 16);
        assert_eq!(builder.log_dir, Some(PathBuf::from("/var/log/berth")));
        assert!(!builder.primary_node);
        assert_eq!(builder.finalizing_timeout, Duration::from_secs(3600));
    }

    #[test]
    fn test_builder_build_fails_without_store() {
        let result = BerthRuntimeBuilder::new()
            .backend(Arc::new(MockBackend::new()))
            .build();

        assert!(result.is_err());
        let err = result.err().unwrap();
        assert!(err.to_string().contains("store is required"));
    }

    #[test]
    fn test_builder_build_fails_without_backend() {
        let result = BerthRuntimeBuilder::new()
            .store(Arc::new(MemoryStore::new()))
            .build();

        assert!(result.is_err());
        let err = result.err().unwrap();
        assert!(err.to_string().contains("backend is required"));
    }

    #[tokio::test]
    async fn test_start_and_shutdown_without_resolver() {
        let runtime = BerthRuntime::builder()
            .store(Arc::new(MemoryStore::new()))
            .backend(Arc::new(MockBackend::new()))
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();

        assert!(runtime.is_running());
        assert_eq!(runtime.recovery_report().total(), 0);

        let request = LaunchRequest {
            project: None,
            wrapper_id: "1".to_string(),
            command_id: "1".to_string(),
            wrapper_name: "w".to_string(),
            input_values: Default::default(),
            username: "alice".to_string(),
            workflow_id: None,
        };
        assert!(runtime.submit_launch(request).await.is_err());

        runtime.shutdown().await.unwrap();
    }
}
