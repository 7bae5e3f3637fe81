// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for berth integration tests.
//!
//! Provides [`Harness`], an orchestrator wired to an in-memory store, the
//! mock backend and recording collaborators. The finalize queue is drained
//! by hand so tests control when finalizing happens.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use berth::backend::mock::MockBackend;
use berth::collaborators::{AdminNotifier, DescriptorResolver, OutputRegistrar, WorkflowTracker};
use berth::error::{Error, Result};
use berth::finalize::FinalizeOutcome;
use berth::orchestrator::{LaunchContext, Orchestrator, OrchestratorConfig};
use berth::queue::{self, FinalizeRequest};
use berth::store::{MemoryStore, WorkloadStore};
use berth::workload::{
    HistoryEntry, LaunchPlan, NewWorkload, OutputSpec, ResolvedLaunchDescriptor, RuntimeBinding,
    Workload, WorkloadRole,
};

/// Workflow tracker remembering every call.
#[derive(Default)]
pub struct RecordingTracker {
    pub created: Mutex<Vec<(String, String)>>,
    pub statuses: Mutex<Vec<(String, String)>>,
    pub details: Mutex<Vec<(String, String)>>,
}

impl RecordingTracker {
    /// Last status set on a workflow.
    pub fn status_of(&self, workflow_id: &str) -> Option<String> {
        self.statuses
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(id, _)| id == workflow_id)
            .map(|(_, status)| status.clone())
    }

    /// Last details set on a workflow.
    pub fn details_of(&self, workflow_id: &str) -> Option<String> {
        self.details
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(id, _)| id == workflow_id)
            .map(|(_, details)| details.clone())
    }
}

#[async_trait]
impl WorkflowTracker for RecordingTracker {
    async fn create(
        &self,
        root_id: &str,
        kind: &str,
        _wrapper_name: &str,
        _project: Option<&str>,
        _user: &str,
    ) -> Result<String> {
        let mut created = self.created.lock().unwrap();
        let id = format!("wf-{}", created.len() + 1);
        created.push((root_id.to_string(), kind.to_string()));
        Ok(id)
    }

    async fn set_status(&self, workflow_id: &str, status: &str) -> Result<()> {
        self.statuses
            .lock()
            .unwrap()
            .push((workflow_id.to_string(), status.to_string()));
        Ok(())
    }

    async fn set_details(&self, workflow_id: &str, details: &str) -> Result<()> {
        self.details
            .lock()
            .unwrap()
            .push((workflow_id.to_string(), details.to_string()));
        Ok(())
    }
}

/// Notifier remembering every notification.
#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<(String, String)>>,
}

impl RecordingNotifier {
    /// Subjects sent so far.
    pub fn subjects(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(subject, _)| subject.clone())
            .collect()
    }
}

#[async_trait]
impl AdminNotifier for RecordingNotifier {
    async fn notify(&self, subject: &str, body_html: &str) -> Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((subject.to_string(), body_html.to_string()));
        Ok(())
    }
}

/// Output registrar that fails for selected output names.
#[derive(Default)]
pub struct RecordingRegistrar {
    pub failing: Mutex<HashSet<String>>,
    pub registered: Mutex<Vec<(i64, String)>>,
}

#[async_trait]
impl OutputRegistrar for RecordingRegistrar {
    async fn register(&self, workload: &Workload, output: &OutputSpec) -> Result<()> {
        if self.failing.lock().unwrap().contains(&output.name) {
            return Err(Error::Other(format!("upload of {} rejected", output.name)));
        }
        self.registered
            .lock()
            .unwrap()
            .push((workload.id, output.name.clone()));
        Ok(())
    }
}

/// Memory store whose container lookups fail once for selected ids.
pub struct FlakyStore {
    pub inner: Arc<MemoryStore>,
    pub failing_lookups: Mutex<HashSet<String>>,
}

impl FlakyStore {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            failing_lookups: Mutex::new(HashSet::new()),
        }
    }
}

#[async_trait]
impl WorkloadStore for FlakyStore {
    async fn create_workload(&self, new: NewWorkload, initial: HistoryEntry) -> Result<Workload> {
        self.inner.create_workload(new, initial).await
    }

    async fn get_workload(&self, id: i64) -> Result<Option<Workload>> {
        self.inner.get_workload(id).await
    }

    async fn find_by_container_id(&self, container_id: &str) -> Result<Option<Workload>> {
        if self.failing_lookups.lock().unwrap().remove(container_id) {
            return Err(Error::Other(format!("lookup of {} timed out", container_id)));
        }
        self.inner.find_by_container_id(container_id).await
    }

    async fn update_binding(&self, id: i64, binding: &RuntimeBinding) -> Result<()> {
        self.inner.update_binding(id, binding).await
    }

    async fn append_history(&self, id: i64, entry: HistoryEntry) -> Result<bool> {
        self.inner.append_history(id, entry).await
    }

    async fn record_log_paths(&self, id: i64, paths: &[String]) -> Result<()> {
        self.inner.record_log_paths(id, paths).await
    }

    async fn list_active_services(&self) -> Result<Vec<Workload>> {
        self.inner.list_active_services().await
    }

    async fn list_by_status(&self, status: &str) -> Result<Vec<Workload>> {
        self.inner.list_by_status(status).await
    }

    async fn list_by_status_prefix(&self, prefix: &str) -> Result<Vec<Workload>> {
        self.inner.list_by_status_prefix(prefix).await
    }

    async fn list_children(&self, parent_id: i64, role: WorkloadRole) -> Result<Vec<Workload>> {
        self.inner.list_children(parent_id, role).await
    }

    async fn purge_workload(&self, id: i64) -> Result<bool> {
        self.inner.purge_workload(id).await
    }
}

/// Resolver returning a fixed descriptor, or failing.
pub struct StaticResolver {
    pub descriptor: Option<ResolvedLaunchDescriptor>,
}

#[async_trait]
impl DescriptorResolver for StaticResolver {
    async fn resolve(
        &self,
        _wrapper_id: &str,
        command_id: &str,
        _inputs: &BTreeMap<String, String>,
        _acting_user: &str,
    ) -> Result<ResolvedLaunchDescriptor> {
        self.descriptor
            .clone()
            .ok_or_else(|| Error::Resolution(format!("no command {}", command_id)))
    }
}

/// Orchestrator with in-memory collaborators.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub backend: Arc<MockBackend>,
    pub workflows: Arc<RecordingTracker>,
    pub notifier: Arc<RecordingNotifier>,
    pub outputs: Arc<RecordingRegistrar>,
    pub orchestrator: Arc<Orchestrator>,
    pub finalize_rx: mpsc::Receiver<FinalizeRequest>,
}

impl Harness {
    /// Harness around `backend` with default settings.
    pub fn new(backend: MockBackend) -> Self {
        Self::with_config(backend, OrchestratorConfig::default(), 64)
    }

    /// Harness with explicit orchestrator config and finalize queue capacity.
    pub fn with_config(backend: MockBackend, config: OrchestratorConfig, capacity: usize) -> Self {
        Self::with_store(backend, config, capacity, |store| store as Arc<dyn WorkloadStore>)
    }

    /// Harness whose orchestrator sees the memory store through `wrap`.
    pub fn with_store(
        backend: MockBackend,
        config: OrchestratorConfig,
        capacity: usize,
        wrap: impl FnOnce(Arc<MemoryStore>) -> Arc<dyn WorkloadStore>,
    ) -> Self {
        let store = Arc::new(MemoryStore::new());
        let backend = Arc::new(backend);
        let workflows = Arc::new(RecordingTracker::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let outputs = Arc::new(RecordingRegistrar::default());
        let (finalize_tx, finalize_rx) = queue::channel("finalizing", capacity);

        let orchestrator = Arc::new(Orchestrator::new(
            wrap(store.clone()),
            backend.clone(),
            workflows.clone(),
            notifier.clone(),
            outputs.clone(),
            finalize_tx,
            config,
        ));

        Self {
            store,
            backend,
            workflows,
            notifier,
            outputs,
            orchestrator,
            finalize_rx,
        }
    }

    /// Launch `descriptor` as alice under workflow `wf-main`.
    pub async fn launch(&self, descriptor: &ResolvedLaunchDescriptor) -> Workload {
        self.orchestrator
            .launch(descriptor, &context())
            .await
            .expect("launch should succeed")
    }

    /// Reload a workload.
    pub async fn reload(&self, id: i64) -> Workload {
        self.store
            .get_workload(id)
            .await
            .unwrap()
            .expect("workload should exist")
    }

    /// Pending finalize requests, without consuming them.
    pub fn take_requests(&mut self) -> Vec<FinalizeRequest> {
        let mut requests = Vec::new();
        while let Ok(request) = self.finalize_rx.try_recv() {
            requests.push(request);
        }
        requests
    }

    /// Consume every queued finalize request, including ones queued while
    /// finalizing.
    pub async fn drain_finalize(&mut self) -> Vec<(i64, FinalizeOutcome)> {
        let mut outcomes = Vec::new();
        while let Ok(request) = self.finalize_rx.try_recv() {
            let outcome = self
                .orchestrator
                .consume_finalize(&request)
                .await
                .expect("finalize should succeed");
            outcomes.push((request.workload_id, outcome));
        }
        outcomes
    }

    /// Statuses of a workload's history, oldest first.
    pub async fn statuses(&self, id: i64) -> Vec<String> {
        self.reload(id)
            .await
            .history
            .iter()
            .map(|e| e.status.clone())
            .collect()
    }
}

/// Launch context used by the harness.
pub fn context() -> LaunchContext {
    LaunchContext {
        username: "alice".to_string(),
        project: Some("proj".to_string()),
        workflow_id: Some("wf-main".to_string()),
    }
}

/// Descriptor running `image` with no setups, wrapups or outputs.
pub fn descriptor(image: &str) -> ResolvedLaunchDescriptor {
    ResolvedLaunchDescriptor {
        plan: LaunchPlan {
            image: image.to_string(),
            command_line: "run.sh".to_string(),
            ..Default::default()
        },
        wrapper_id: Some("7".to_string()),
        command_id: Some("3".to_string()),
        wrapper_name: Some(image.to_string()),
        ..Default::default()
    }
}
