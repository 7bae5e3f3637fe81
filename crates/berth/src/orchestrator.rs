// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workload orchestration.
//!
//! The [`Orchestrator`] owns every status transition of a workload:
//!
//! - launching a resolved descriptor (main, setup and wrapup workloads)
//! - applying container events and service task events to the history
//! - restarting services lost with their node
//! - handing terminal workloads to the finalize queue
//!
//! The finalize routine itself lives in [`crate::finalize`].

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::backend::ExecutionBackend;
use crate::collaborators::{AdminNotifier, OutputRegistrar, WorkflowTracker};
use crate::error::{Error, Result};
use crate::events::{ContainerEvent, TaskEvent};
use crate::queue::{FinalizeRequest, QueueSender};
use crate::store::WorkloadStore;
use crate::task::{self, NODE_ERROR_MESSAGE, Task};
use crate::workload::history::{
    self, HistoryEntry, STATUS_CREATED, STATUS_FAILED, STATUS_FAILED_PARENT, STATUS_FAILED_SWARM,
    STATUS_KILL, STATUS_RESTART, STATUS_WAITING, SourceKind,
};
use crate::workload::{
    ExecutionMode, NewWorkload, ResolvedLaunchDescriptor, RuntimeBinding, Workload, WorkloadRole,
};

/// Exit code recorded when a service cannot be restarted.
pub const RESTART_EXHAUSTED_EXIT_CODE: &str = "126";

/// Orchestrator tuning.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Restarts allowed after node loss before the workload fails.
    pub max_restarts: usize,
    /// Root directory for captured logs. Logs are not written when unset.
    pub log_dir: Option<PathBuf>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            log_dir: None,
        }
    }
}

/// Who launched a descriptor, and under which workflow.
#[derive(Debug, Clone, Default)]
pub struct LaunchContext {
    /// Acting user.
    pub username: String,
    /// Owning project.
    pub project: Option<String>,
    /// Workflow handle of the main workload.
    pub workflow_id: Option<String>,
}

/// Drives workloads through their lifecycle.
pub struct Orchestrator {
    pub(crate) store: Arc<dyn WorkloadStore>,
    pub(crate) backend: Arc<dyn ExecutionBackend>,
    pub(crate) workflows: Arc<dyn WorkflowTracker>,
    pub(crate) notifier: Arc<dyn AdminNotifier>,
    pub(crate) outputs: Arc<dyn OutputRegistrar>,
    finalize_queue: QueueSender<FinalizeRequest>,
    pub(crate) config: OrchestratorConfig,
}

impl Orchestrator {
    /// Create an orchestrator.
    pub fn new(
        store: Arc<dyn WorkloadStore>,
        backend: Arc<dyn ExecutionBackend>,
        workflows: Arc<dyn WorkflowTracker>,
        notifier: Arc<dyn AdminNotifier>,
        outputs: Arc<dyn OutputRegistrar>,
        finalize_queue: QueueSender<FinalizeRequest>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            backend,
            workflows,
            notifier,
            outputs,
            finalize_queue,
            config,
        }
    }

    /// Workload store.
    pub fn store(&self) -> &Arc<dyn WorkloadStore> {
        &self.store
    }

    /// Execution backend.
    pub fn backend(&self) -> &Arc<dyn ExecutionBackend> {
        &self.backend
    }

    /// Workflow tracker.
    pub fn workflows(&self) -> &Arc<dyn WorkflowTracker> {
        &self.workflows
    }

    /// Administrator notifier.
    pub fn notifier(&self) -> &Arc<dyn AdminNotifier> {
        &self.notifier
    }

    /// Load a workload, failing if it does not exist.
    pub async fn load(&self, id: i64) -> Result<Workload> {
        self.store
            .get_workload(id)
            .await?
            .ok_or(Error::WorkloadNotFound(id))
    }

    // ========================================================================
    // Launch
    // ========================================================================

    /// Launch a resolved descriptor.
    ///
    /// The main workload is created first, then its wrapups as unlaunched
    /// records, then its setups. The main workload starts immediately only
    /// when there are no setups.
    pub async fn launch(
        &self,
        descriptor: &ResolvedLaunchDescriptor,
        ctx: &LaunchContext,
    ) -> Result<Workload> {
        let launched = self.backend.launch(&descriptor.plan, &ctx.username).await?;

        let main = self
            .store
            .create_workload(
                NewWorkload {
                    mode: launched.mode,
                    role: WorkloadRole::Main,
                    parent_id: None,
                    runtime_id: Some(launched.runtime_id.clone()),
                    plan: descriptor.plan.clone(),
                    outputs: descriptor.outputs.clone(),
                    workflow_id: ctx.workflow_id.clone(),
                    username: ctx.username.clone(),
                    project: ctx.project.clone(),
                    wrapper_name: descriptor.wrapper_name.clone(),
                },
                HistoryEntry::from_system(STATUS_CREATED, "Created"),
            )
            .await?;

        info!(
            workload_id = main.id,
            mode = main.mode.as_str(),
            runtime_id = %launched.runtime_id,
            image = %descriptor.plan.image,
            "Workload created"
        );

        for wrapup in &descriptor.wrapup {
            self.create_child(&main, WorkloadRole::Wrapup, wrapup, ctx, None)
                .await?;
        }

        if descriptor.setup.is_empty() {
            self.start(&main).await?;
        } else {
            // Every setup exists before any of them starts.
            let mut setups = Vec::with_capacity(descriptor.setup.len());
            for setup in &descriptor.setup {
                match self.launch_setup(&main, setup, ctx).await {
                    Ok(child) => setups.push(child),
                    Err(e) => return Err(self.abort_setups(&main, &setups, e).await),
                }
            }
            for setup in &setups {
                if let Err(e) = self.start(setup).await {
                    return Err(self.abort_setups(&main, &setups, e).await);
                }
            }
        }

        self.set_workflow(
            main.workflow_id.as_deref(),
            "Running",
            Some(&format!("{} {}", main.mode.as_str(), launched.runtime_id)),
        )
        .await;

        self.load(main.id).await
    }

    async fn launch_setup(
        &self,
        main: &Workload,
        setup: &ResolvedLaunchDescriptor,
        ctx: &LaunchContext,
    ) -> Result<Workload> {
        let launched = self.backend.launch(&setup.plan, &ctx.username).await?;
        self.create_child(
            main,
            WorkloadRole::Setup,
            setup,
            ctx,
            Some((launched.mode, launched.runtime_id)),
        )
        .await
    }

    /// Fail a main workload whose setup group could not be brought up.
    ///
    /// Created setups are killed and failed, pending wrapups are failed and
    /// the main workload gets a terminal entry, so a setup that still exits
    /// successfully can never start it. Returns `cause`.
    async fn abort_setups(&self, main: &Workload, setups: &[Workload], cause: Error) -> Error {
        error!(workload_id = main.id, error = %cause, "Setup launch failed");
        let details = format!("Setup launch failed: {}", cause);
        if let Err(e) = self.fail_setup_group(main, setups, &details).await {
            error!(workload_id = main.id, error = %e, "Failed to record setup launch failure");
        }
        cause
    }

    async fn fail_setup_group(&self, main: &Workload, setups: &[Workload], details: &str) -> Result<()> {
        for setup in setups {
            let setup = self.load(setup.id).await?;
            if setup.is_finalized() {
                continue;
            }
            if let Err(e) = self.backend.kill(&setup).await {
                debug!(workload_id = setup.id, error = %e, "Failed to kill setup");
            }
            self.fail_workload(&setup, STATUS_FAILED_PARENT, details).await?;
        }

        let wrapups = self.store.list_children(main.id, WorkloadRole::Wrapup).await?;
        for wrapup in wrapups.iter().filter(|w| !w.is_finalized()) {
            self.fail_workload(wrapup, STATUS_FAILED_PARENT, details).await?;
        }

        if let Err(e) = self.backend.remove(main).await {
            debug!(workload_id = main.id, error = %e, "Failed to remove workload");
        }
        self.fail_workload(main, &format!("Failed {}", WorkloadRole::Setup.as_str()), details)
            .await
    }

    async fn create_child(
        &self,
        parent: &Workload,
        role: WorkloadRole,
        descriptor: &ResolvedLaunchDescriptor,
        ctx: &LaunchContext,
        launched: Option<(ExecutionMode, String)>,
    ) -> Result<Workload> {
        let root = parent
            .workflow_id
            .clone()
            .unwrap_or_else(|| parent.id.to_string());
        let workflow_id = match self
            .workflows
            .create(
                &root,
                role.as_str(),
                descriptor
                    .wrapper_name
                    .as_deref()
                    .or(parent.wrapper_name.as_deref())
                    .unwrap_or_default(),
                ctx.project.as_deref(),
                &ctx.username,
            )
            .await
        {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(parent_id = parent.id, role = role.as_str(), error = %e, "Failed to create child workflow");
                None
            }
        };

        let (mode, runtime_id) = match launched {
            Some((mode, id)) => (mode, Some(id)),
            None => (parent.mode, None),
        };

        let child = self
            .store
            .create_workload(
                NewWorkload {
                    mode,
                    role,
                    parent_id: Some(parent.id),
                    runtime_id,
                    plan: descriptor.plan.clone(),
                    outputs: descriptor.outputs.clone(),
                    workflow_id,
                    username: ctx.username.clone(),
                    project: ctx.project.clone(),
                    wrapper_name: descriptor
                        .wrapper_name
                        .clone()
                        .or_else(|| parent.wrapper_name.clone()),
                },
                HistoryEntry::from_system(STATUS_CREATED, "Created"),
            )
            .await?;

        debug!(
            workload_id = child.id,
            parent_id = parent.id,
            role = role.as_str(),
            launched = child.is_launched(),
            "Child workload created"
        );
        Ok(child)
    }

    /// Launch a stored, unlaunched workload (wrapups, restarted services),
    /// then start it.
    pub async fn launch_from_record(&self, workload: &Workload) -> Result<Workload> {
        let launched = self.backend.launch(&workload.plan, &workload.username).await?;
        if launched.mode != workload.mode {
            return Err(Error::InvalidRequest(format!(
                "workload {} was recorded in {} mode but the server now runs {} mode",
                workload.id,
                workload.mode.as_str(),
                launched.mode.as_str()
            )));
        }

        let mut binding = RuntimeBinding::default();
        match launched.mode {
            ExecutionMode::Container => binding.container_id = Some(launched.runtime_id.clone()),
            ExecutionMode::Service => binding.service_id = Some(launched.runtime_id.clone()),
        }
        self.store.update_binding(workload.id, &binding).await?;

        let workload = self.load(workload.id).await?;
        info!(
            workload_id = workload.id,
            runtime_id = %launched.runtime_id,
            "Workload launched from record"
        );
        self.start(&workload).await?;
        Ok(workload)
    }

    /// Start a launched workload. A failure is recorded in the history.
    pub async fn start(&self, workload: &Workload) -> Result<()> {
        match self.backend.start(workload).await {
            Ok(()) => {
                debug!(workload_id = workload.id, "Workload started");
                Ok(())
            }
            Err(e) => {
                error!(workload_id = workload.id, error = %e, "Workload did not start");
                self.store
                    .append_history(
                        workload.id,
                        HistoryEntry::from_system(STATUS_FAILED, format!("Did not start. {}", e)),
                    )
                    .await?;
                Err(e.into())
            }
        }
    }

    /// Kill a workload on behalf of a user.
    pub async fn kill(&self, workload_id: i64, username: &str) -> Result<()> {
        let workload = self.load(workload_id).await?;
        self.store
            .append_history(workload.id, HistoryEntry::from_user(STATUS_KILL, username))
            .await?;

        info!(workload_id, username, "Kill requested");
        if workload.is_launched() {
            self.backend.kill(&workload).await?;
        }
        Ok(())
    }

    // ========================================================================
    // Event handling
    // ========================================================================

    /// Apply one container event to a plain-mode workload.
    pub async fn apply_container_event(&self, workload_id: i64, event: &ContainerEvent) -> Result<()> {
        let workload = self.load(workload_id).await?;
        if workload.is_finalizing() || workload.is_finalized() {
            debug!(workload_id, status = workload.status(), event = %event.status, "Skipping container event");
            return Ok(());
        }

        let appended = self
            .store
            .append_history(workload_id, HistoryEntry::from_container_event(event))
            .await?;
        if !appended {
            debug!(workload_id, event = %event.status, "Duplicate container event");
            return Ok(());
        }

        if event.is_exit() {
            let workload = self.load(workload_id).await?;
            self.queue_finalize(&workload, event.exit_code(), event.is_success())
                .await?;
        }
        Ok(())
    }

    /// Apply one service task event.
    pub async fn process_task_event(&self, workload_id: i64, event: TaskEvent) -> Result<()> {
        let workload = self.load(workload_id).await?;
        debug!(workload_id, event = event.name(), status = workload.status(), "Processing task event");

        match event {
            TaskEvent::ProcessTask(task) => self.process_task(workload, task).await,
            TaskEvent::Restart => {
                if workload.is_waiting() {
                    self.handle_waiting(workload).await
                } else {
                    self.restart_service(&workload).await
                }
            }
            TaskEvent::Waiting => self.handle_waiting(workload).await,
        }
    }

    async fn process_task(&self, workload: Workload, task: Task) -> Result<()> {
        if workload.is_finalized() {
            return Ok(());
        }

        let binding = RuntimeBinding {
            container_id: task.container_id.clone().or_else(|| workload.container_id.clone()),
            service_id: workload.service_id.clone(),
            task_id: task.task_id.clone().or_else(|| workload.task_id.clone()),
            node_id: task.node_id.clone().or_else(|| workload.node_id.clone()),
        };
        if binding != RuntimeBinding::of(&workload) {
            self.store.update_binding(workload.id, &binding).await?;
        }

        if workload.is_finalizing() {
            debug!(workload_id = workload.id, "Workload is finalizing");
            return Ok(());
        }

        let waiting = workload.is_waiting();
        let appended = self
            .store
            .append_history(workload.id, HistoryEntry::from_task(&task))
            .await?;
        if !appended && !waiting {
            return Ok(());
        }

        if task.node_error && !waiting {
            warn!(
                workload_id = workload.id,
                node_id = task.node_id.as_deref().unwrap_or_default(),
                state = %task.state,
                "Task lost with its node"
            );
            let workload = self.load(workload.id).await?;
            return self.restart_service(&workload).await;
        }

        if waiting || task.is_exited() {
            let workload = self.load(workload.id).await?;
            self.queue_finalize(
                &workload,
                task.exit_code.map(|c| c.to_string()),
                task.succeeded(),
            )
            .await?;
        }
        Ok(())
    }

    async fn handle_waiting(&self, workload: Workload) -> Result<()> {
        if workload.is_finalized() || workload.is_finalizing() {
            return Ok(());
        }

        let exited = history::latest_service_entry(&workload.history)
            .is_some_and(|e| task::has_exited(&e.status));
        if exited || workload.is_waiting() || workload.was_killed() {
            let exit_code = workload.exit_code().map(str::to_string);
            let successful = observed_success(&workload);
            return self.queue_finalize(&workload, exit_code, successful).await;
        }

        info!(workload_id = workload.id, status = workload.status(), "Workload has not started");
        self.store
            .append_history(
                workload.id,
                HistoryEntry::from_system(STATUS_WAITING, "Task has not started"),
            )
            .await?;
        Ok(())
    }

    // ========================================================================
    // Restart
    // ========================================================================

    /// Replace a service lost with its node, or fail it once restarts run out.
    pub async fn restart_service(&self, workload: &Workload) -> Result<()> {
        if workload.mode != ExecutionMode::Service {
            return Err(Error::InvalidRequest(format!(
                "workload {} is not a service",
                workload.id
            )));
        }

        if let Err(e) = self.backend.remove(workload).await {
            debug!(workload_id = workload.id, error = %e, "Service removal before restart failed");
        }

        let restarts = workload.restart_count();
        let reason = if restarts < self.config.max_restarts {
            match self.relaunch(workload, restarts).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    error!(workload_id = workload.id, error = %e, "Service restart failed");
                    format!("Restart failed: {}", e)
                }
            }
        } else {
            format!("Exceeded {} restarts", self.config.max_restarts)
        };

        warn!(workload_id = workload.id, restarts, reason = %reason, "Failing service after node loss");
        let mut failed = HistoryEntry::from_system(
            "failed",
            format!("{}. {}", NODE_ERROR_MESSAGE, reason),
        )
        .with_exit_code(RESTART_EXHAUSTED_EXIT_CODE);
        failed.source = SourceKind::Service;
        self.store.append_history(workload.id, failed).await?;

        self.set_workflow(workload.workflow_id.as_deref(), STATUS_FAILED_SWARM, Some(&reason))
            .await;

        let workload = self.load(workload.id).await?;
        self.queue_finalize(&workload, Some(RESTART_EXHAUSTED_EXIT_CODE.to_string()), false)
            .await
    }

    async fn relaunch(&self, workload: &Workload, restarts: usize) -> Result<()> {
        self.store
            .update_binding(workload.id, &RuntimeBinding::default())
            .await?;

        let node = workload.node_id.as_deref().unwrap_or("unknown");
        self.store
            .append_history(
                workload.id,
                HistoryEntry::from_system(
                    STATUS_RESTART,
                    format!(
                        "Restarting service lost with node {} (restart {} of {})",
                        node,
                        restarts + 1,
                        self.config.max_restarts
                    ),
                ),
            )
            .await?;

        let workload = self.load(workload.id).await?;
        let relaunched = self.launch_from_record(&workload).await?;
        info!(
            workload_id = relaunched.id,
            service_id = relaunched.service_id.as_deref().unwrap_or_default(),
            restart = restarts + 1,
            "Service restarted"
        );
        Ok(())
    }

    // ========================================================================
    // Finalize queueing
    // ========================================================================

    /// Mark a workload as queued for finalizing and enqueue the request.
    ///
    /// A workload already queued is left alone. When the queue refuses the
    /// message the workload is put back to `Waiting` for a later attempt.
    pub async fn queue_finalize(
        &self,
        workload: &Workload,
        exit_code: Option<String>,
        successful: bool,
    ) -> Result<()> {
        let status = workload.status();
        if history::is_queued(status) {
            debug!(workload_id = workload.id, status, "Already queued for finalizing");
            return Ok(());
        }

        self.store
            .append_history(
                workload.id,
                HistoryEntry::from_system(history::queued_status(status), "Queued for finalizing"),
            )
            .await?;

        let request = FinalizeRequest {
            workload_id: workload.id,
            exit_code,
            successful,
            username: workload.username.clone(),
        };
        if let Err(e) = self.finalize_queue.send(request) {
            warn!(workload_id = workload.id, error = %e, "Finalize request refused");
            self.store
                .append_history(
                    workload.id,
                    HistoryEntry::from_system(
                        STATUS_WAITING,
                        "Finalizing message queue failed. Throw back into waiting and try again later.",
                    ),
                )
                .await?;
            self.notify(
                "Finalizing queue error",
                &format!(
                    "<p>Workload {} could not be queued for finalizing.</p><p>{}</p>",
                    workload.id,
                    crate::collaborators::escape_html(&e.to_string())
                ),
            )
            .await;
        }
        Ok(())
    }

    // ========================================================================
    // Collaborator helpers
    // ========================================================================

    pub(crate) async fn set_workflow(
        &self,
        workflow_id: Option<&str>,
        status: &str,
        details: Option<&str>,
    ) {
        let Some(workflow_id) = workflow_id else {
            return;
        };
        if let Err(e) = self.workflows.set_status(workflow_id, status).await {
            warn!(workflow_id, status, error = %e, "Failed to update workflow status");
        }
        if let Some(details) = details {
            if let Err(e) = self.workflows.set_details(workflow_id, details).await {
                warn!(workflow_id, error = %e, "Failed to update workflow details");
            }
        }
    }

    pub(crate) async fn notify(&self, subject: &str, body_html: &str) {
        if let Err(e) = self.notifier.notify(subject, body_html).await {
            warn!(subject, error = %e, "Failed to send notification");
        }
    }
}

/// Success as last observed: the newest service entry for services, the last
/// real event for plain containers.
pub(crate) fn observed_success(workload: &Workload) -> bool {
    match workload.mode {
        ExecutionMode::Service => history::latest_service_entry(&workload.history)
            .is_some_and(|e| task::is_success_state(&e.status)),
        ExecutionMode::Container => workload
            .last_real_status()
            .is_some_and(crate::events::is_success_status),
    }
}
