// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock backend for testing.
//!
//! Simulates a container server in memory. Plan validation and mount
//! preparation run for real, so rejected plans behave exactly like they
//! do against Docker.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::prepare;
use super::{BackendError, ExecutionBackend, Launched, LogStream, Result, RuntimeStatus};
use crate::events::ContainerEvent;
use crate::task::{Task, pick_single_task};
use crate::workload::{ExecutionMode, LaunchPlan, Workload};

#[derive(Debug, Default)]
struct MockState {
    next_id: u64,
    created: HashMap<String, LaunchPlan>,
    started: Vec<String>,
    killed: Vec<String>,
    removed: Vec<String>,
    tasks: HashMap<String, Vec<Task>>,
    deleted_services: HashSet<String>,
    /// Every event pushed, with whether it was delivered yet.
    events: Vec<(ContainerEvent, bool)>,
    logs: HashMap<(String, &'static str), String>,
    statuses: HashMap<String, RuntimeStatus>,
    fail_launch: Option<String>,
    fail_start: Option<String>,
    fail_tasks: Option<String>,
}

/// Mock backend for testing.
pub struct MockBackend {
    state: Arc<Mutex<MockState>>,
    /// Mode new workloads are created in
    pub mode: ExecutionMode,
    /// If false, `remove` does nothing
    pub auto_cleanup: bool,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    /// Create a mock launching plain containers.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            mode: ExecutionMode::Container,
            auto_cleanup: true,
        }
    }

    /// Create a mock launching swarm services.
    pub fn swarm() -> Self {
        Self {
            mode: ExecutionMode::Service,
            ..Self::new()
        }
    }

    /// Make every launch fail with an unavailable error.
    pub async fn fail_launches(&self, message: &str) {
        self.state.lock().await.fail_launch = Some(message.to_string());
    }

    /// Make every start fail with an unavailable error.
    pub async fn fail_starts(&self, message: &str) {
        self.state.lock().await.fail_start = Some(message.to_string());
    }

    /// Make task resolution fail with an unavailable error.
    pub async fn fail_task_lookups(&self, message: Option<&str>) {
        self.state.lock().await.fail_tasks = message.map(String::from);
    }

    /// Script the tasks listed for a service.
    pub async fn set_tasks(&self, service_id: &str, tasks: Vec<Task>) {
        self.state
            .lock()
            .await
            .tasks
            .insert(service_id.to_string(), tasks);
    }

    /// Forget a service, as if it was removed out of band.
    pub async fn delete_service(&self, service_id: &str) {
        self.state
            .lock()
            .await
            .deleted_services
            .insert(service_id.to_string());
    }

    /// Record a container event. It is delivered by the next poll, and again
    /// by any later poll whose window covers its timestamp.
    pub async fn push_event(&self, event: ContainerEvent) {
        self.state.lock().await.events.push((event, false));
    }

    /// Set the captured log of a container.
    pub async fn set_logs(&self, container_id: &str, stream: LogStream, text: &str) {
        self.state
            .lock()
            .await
            .logs
            .insert((container_id.to_string(), stream.as_str()), text.to_string());
    }

    /// Set the status reported for a runtime id.
    pub async fn set_status(&self, runtime_id: &str, status: RuntimeStatus) {
        self.state
            .lock()
            .await
            .statuses
            .insert(runtime_id.to_string(), status);
    }

    /// Number of workloads created.
    pub async fn created_count(&self) -> usize {
        self.state.lock().await.created.len()
    }

    /// Plan a runtime id was created from.
    pub async fn plan_for(&self, runtime_id: &str) -> Option<LaunchPlan> {
        self.state.lock().await.created.get(runtime_id).cloned()
    }

    /// Started runtime ids, in order.
    pub async fn started(&self) -> Vec<String> {
        self.state.lock().await.started.clone()
    }

    /// Killed runtime ids, in order.
    pub async fn killed(&self) -> Vec<String> {
        self.state.lock().await.killed.clone()
    }

    /// Removed runtime ids, in order.
    pub async fn removed(&self) -> Vec<String> {
        self.state.lock().await.removed.clone()
    }
}

fn runtime_id(workload: &Workload) -> Result<String> {
    workload
        .runtime_id()
        .map(String::from)
        .ok_or_else(|| BackendError::InvalidRequest(format!("workload {} has no runtime id", workload.id)))
}

#[async_trait]
impl ExecutionBackend for MockBackend {
    fn backend_type(&self) -> &'static str {
        "mock"
    }

    async fn ping(&self) -> bool {
        true
    }

    async fn launch(&self, plan: &LaunchPlan, _acting_user: &str) -> Result<Launched> {
        let ports = prepare::validate_ports(&plan.ports)?;
        if self.mode == ExecutionMode::Service {
            for (container, host) in &ports {
                prepare::parse_port(container)?;
                prepare::parse_port(host)?;
            }
        }
        prepare::validate_resources(plan)?;
        prepare::command_for(plan)?;
        prepare::prepare_mounts(&plan.mounts).await?;

        let mut state = self.state.lock().await;
        if let Some(message) = &state.fail_launch {
            return Err(BackendError::Unavailable(message.clone()));
        }
        state.next_id += 1;
        let runtime_id = format!("{}-{}", self.mode.as_str(), state.next_id);
        state.created.insert(runtime_id.clone(), plan.clone());
        Ok(Launched {
            mode: self.mode,
            runtime_id,
        })
    }

    async fn start(&self, workload: &Workload) -> Result<()> {
        let id = runtime_id(workload)?;
        let mut state = self.state.lock().await;
        if let Some(message) = &state.fail_start {
            return Err(BackendError::Unavailable(message.clone()));
        }
        if !state.created.contains_key(&id) {
            return Err(BackendError::NotFound(id));
        }
        state.started.push(id);
        Ok(())
    }

    async fn status(&self, workload: &Workload) -> Result<RuntimeStatus> {
        let id = runtime_id(workload)?;
        let state = self.state.lock().await;
        if let Some(status) = state.statuses.get(&id) {
            return Ok(status.clone());
        }
        if !state.created.contains_key(&id) {
            return Err(BackendError::NotFound(id));
        }
        let running = state.started.contains(&id);
        Ok(RuntimeStatus {
            state: if running { "running" } else { "created" }.to_string(),
            exit_code: None,
        })
    }

    async fn logs(&self, workload: &Workload, stream: LogStream) -> Result<Option<String>> {
        let Some(container_id) = workload.container_id.as_deref() else {
            return Ok(None);
        };
        let state = self.state.lock().await;
        Ok(state
            .logs
            .get(&(container_id.to_string(), stream.as_str()))
            .cloned())
    }

    async fn container_events(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<ContainerEvent>> {
        let mut state = self.state.lock().await;
        let mut due = Vec::new();
        for (event, delivered) in state.events.iter_mut() {
            let ts = event.timestamp();
            let in_window = ts.is_some_and(|ts| ts >= since && ts <= until);
            let pending = !*delivered && ts.is_none_or(|ts| ts <= until);
            if in_window || pending {
                *delivered = true;
                due.push(event.clone());
            }
        }
        Ok(due)
    }

    async fn kill(&self, workload: &Workload) -> Result<()> {
        let id = runtime_id(workload)?;
        let mut state = self.state.lock().await;
        if workload.mode == ExecutionMode::Service {
            state.deleted_services.insert(id.clone());
        }
        state.killed.push(id);
        Ok(())
    }

    async fn remove(&self, workload: &Workload) -> Result<()> {
        if !self.auto_cleanup {
            return Ok(());
        }
        let id = runtime_id(workload)?;
        let mut state = self.state.lock().await;
        if workload.mode == ExecutionMode::Service {
            state.deleted_services.insert(id.clone());
        }
        state.removed.push(id);
        Ok(())
    }

    async fn resolve_task_for_service(&self, workload: &Workload) -> Result<Option<Task>> {
        let service_id = workload.service_id.clone().ok_or_else(|| {
            BackendError::InvalidRequest(format!("workload {} has no service id", workload.id))
        })?;
        let state = self.state.lock().await;
        if let Some(message) = &state.fail_tasks {
            return Err(BackendError::Unavailable(message.clone()));
        }
        if state.deleted_services.contains(&service_id) {
            return Err(BackendError::NotFound(service_id));
        }
        let tasks: Vec<Task> = state
            .tasks
            .get(&service_id)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter(|t| workload.task_id.is_none() || t.task_id == workload.task_id)
            .collect();
        let task = pick_single_task(&service_id, &service_id, tasks)?;
        Ok(task.map(Task::classify))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn test_blank_host_port_is_rejected_before_create() {
        let backend = MockBackend::new();
        let plan = LaunchPlan {
            image: "busybox:latest".to_string(),
            ports: BTreeMap::from([("8080".to_string(), " ".to_string())]),
            ..Default::default()
        };

        let err = backend.launch(&plan, "alice").await.unwrap_err();
        assert!(matches!(err, BackendError::InvalidRequest(_)));
        assert_eq!(backend.created_count().await, 0);
    }
}
