// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker feeding runtime and orchestrator events into the
//! orchestrator.
//!
//! Each poll interval the worker:
//! 1. Fetches container events since the last fully applied window and
//!    applies them, grouped by container, in order.
//! 2. Reconciles every active service against its orchestrator task and
//!    turns the result into a [`TaskEvent`].
//! 3. Re-dispatches plain containers left in `Waiting`.
//!
//! Every workload is processed in its own task behind an in-flight guard,
//! so a workload already being handled is skipped until the next poll.
//! Container events skipped that way are read again with the same window.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::{ContainerEvent, TaskEvent};
use crate::backend::BackendError;
use crate::error::{Error, Result};
use crate::inflight::InFlightSet;
use crate::orchestrator::Orchestrator;
use crate::workload::history::STATUS_WAITING;
use crate::workload::{ExecutionMode, Workload};

/// Configuration for event ingestion.
#[derive(Debug, Clone)]
pub struct EventIngestionConfig {
    /// How often to poll.
    pub poll_interval: Duration,
    /// Event window of the first poll.
    pub initial_lookback: Duration,
    /// Consecutive not-started observations before a service is `Waiting`.
    pub not_started_threshold: u32,
}

impl Default for EventIngestionConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            initial_lookback: Duration::from_secs(10),
            not_started_threshold: 10,
        }
    }
}

/// Background event ingestion worker.
pub struct EventIngestion {
    orchestrator: Arc<Orchestrator>,
    config: EventIngestionConfig,
    in_flight: InFlightSet<i64>,
    not_started: Arc<Mutex<HashMap<i64, u32>>>,
    last_poll: Mutex<Option<DateTime<Utc>>>,
    shutdown: Arc<Notify>,
}

impl EventIngestion {
    /// Create a new ingestion worker.
    pub fn new(orchestrator: Arc<Orchestrator>, config: EventIngestionConfig) -> Self {
        Self {
            orchestrator,
            config,
            in_flight: InFlightSet::new(),
            not_started: Arc::new(Mutex::new(HashMap::new())),
            last_poll: Mutex::new(None),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Workloads currently being processed.
    pub fn in_flight(&self) -> &InFlightSet<i64> {
        &self.in_flight
    }

    /// Run the polling loop until shutdown.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            not_started_threshold = self.config.not_started_threshold,
            "Event ingestion started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Event ingestion received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    self.tick().await;
                }
            }
        }

        info!("Event ingestion stopped");
    }

    /// One polling pass over all sources. Waits for every dispatched unit
    /// of work before returning.
    pub async fn tick(&self) {
        if let Err(e) = self.poll_container_events().await {
            error!(error = %e, "Failed to poll container events");
        }
        if let Err(e) = self.poll_services().await {
            error!(error = %e, "Failed to poll services");
        }
        if let Err(e) = self.sweep_waiting_containers().await {
            error!(error = %e, "Failed to sweep waiting containers");
        }
    }

    /// Apply the container events of one window. The window only moves
    /// forward once every event in it was applied; otherwise the next poll
    /// re-reads it and already stored events are dropped as duplicates.
    async fn poll_container_events(&self) -> Result<()> {
        let until = Utc::now();
        let since = self.since(until)?;

        let events = self
            .orchestrator
            .backend()
            .container_events(since, until)
            .await?;

        let mut by_container: BTreeMap<String, Vec<ContainerEvent>> = BTreeMap::new();
        for event in events {
            if event.is_ignored() {
                continue;
            }
            by_container
                .entry(event.container_id.clone())
                .or_default()
                .push(event);
        }
        if by_container.is_empty() {
            self.set_last_poll(until);
            return Ok(());
        }
        debug!(containers = by_container.len(), "Container events received");

        let mut complete = true;
        let mut workers = JoinSet::new();
        for (container_id, events) in by_container {
            let workload = match self
                .orchestrator
                .store()
                .find_by_container_id(&container_id)
                .await
            {
                Ok(Some(w)) if w.mode == ExecutionMode::Container => w,
                Ok(_) => {
                    debug!(container_id = %container_id, "Event for unknown container");
                    continue;
                }
                Err(e) => {
                    error!(container_id = %container_id, error = %e, "Failed to look up container");
                    complete = false;
                    continue;
                }
            };

            let Some(guard) = self.in_flight.try_acquire(workload.id) else {
                debug!(workload_id = workload.id, "Workload busy, retrying container events next poll");
                complete = false;
                continue;
            };

            let orchestrator = self.orchestrator.clone();
            workers.spawn(async move {
                let _guard = guard;
                for event in events {
                    if let Err(e) = orchestrator.apply_container_event(workload.id, &event).await {
                        error!(
                            workload_id = workload.id,
                            event = %event.status,
                            error = %e,
                            "Failed to apply container event"
                        );
                        return false;
                    }
                }
                true
            });
        }

        while let Some(result) = workers.join_next().await {
            match result {
                Ok(applied) => complete &= applied,
                Err(e) => {
                    error!(error = %e, "Event worker panicked");
                    complete = false;
                }
            }
        }

        if complete {
            self.set_last_poll(until);
        } else {
            warn!(since = %since, "Container event window not fully applied, retrying next poll");
        }
        Ok(())
    }

    async fn poll_services(&self) -> Result<()> {
        let services = self.orchestrator.store().list_active_services().await?;
        self.prune_counters(&services);

        let mut workers = JoinSet::new();
        for workload in services {
            if workload.is_finalizing() {
                continue;
            }
            let Some(guard) = self.in_flight.try_acquire(workload.id) else {
                debug!(workload_id = workload.id, "Workload busy, skipping service poll");
                continue;
            };

            let orchestrator = self.orchestrator.clone();
            let counters = self.not_started.clone();
            let threshold = self.config.not_started_threshold;
            workers.spawn(async move {
                let _guard = guard;
                let id = workload.id;
                let event = match reconcile(&orchestrator, &workload, &counters, threshold).await {
                    Some(event) => event,
                    None => return,
                };
                if let Err(e) = orchestrator.process_task_event(id, event).await {
                    error!(workload_id = id, error = %e, "Failed to process task event");
                }
            });
        }

        join_all(workers).await;
        Ok(())
    }

    async fn sweep_waiting_containers(&self) -> Result<()> {
        let waiting = self
            .orchestrator
            .store()
            .list_by_status(STATUS_WAITING)
            .await?;

        let mut workers = JoinSet::new();
        for workload in waiting
            .into_iter()
            .filter(|w| w.mode == ExecutionMode::Container)
        {
            let Some(guard) = self.in_flight.try_acquire(workload.id) else {
                continue;
            };
            let orchestrator = self.orchestrator.clone();
            workers.spawn(async move {
                let _guard = guard;
                if let Err(e) = orchestrator
                    .process_task_event(workload.id, TaskEvent::Waiting)
                    .await
                {
                    error!(workload_id = workload.id, error = %e, "Failed to process waiting container");
                }
            });
        }

        join_all(workers).await;
        Ok(())
    }

    fn since(&self, until: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let last = *self.last_poll.lock().unwrap_or_else(|p| p.into_inner());
        match last {
            Some(since) => Ok(since),
            None => {
                let lookback = chrono::Duration::from_std(self.config.initial_lookback)
                    .map_err(|e| Error::Other(format!("Invalid duration: {}", e)))?;
                Ok(until - lookback)
            }
        }
    }

    fn set_last_poll(&self, until: DateTime<Utc>) {
        *self.last_poll.lock().unwrap_or_else(|p| p.into_inner()) = Some(until);
    }

    fn prune_counters(&self, active: &[Workload]) {
        let ids: HashSet<i64> = active.iter().map(|w| w.id).collect();
        self.not_started
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .retain(|id, _| ids.contains(id));
    }
}

/// Turn the orchestrator's view of a service into an event, or `None` when
/// there is nothing to do this poll.
async fn reconcile(
    orchestrator: &Orchestrator,
    workload: &Workload,
    counters: &Mutex<HashMap<i64, u32>>,
    threshold: u32,
) -> Option<TaskEvent> {
    let count_not_started = || {
        let mut counters = counters.lock().unwrap_or_else(|p| p.into_inner());
        let count = counters.entry(workload.id).or_insert(0);
        *count += 1;
        if *count >= threshold {
            counters.remove(&workload.id);
            true
        } else {
            false
        }
    };
    let reset = || {
        counters
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&workload.id);
    };

    match orchestrator.backend().resolve_task_for_service(workload).await {
        Ok(Some(task)) => {
            if task.not_started() {
                if count_not_started() {
                    info!(workload_id = workload.id, state = %task.state, threshold, "Task has not started");
                    return Some(TaskEvent::Waiting);
                }
            } else {
                reset();
            }
            Some(TaskEvent::ProcessTask(task))
        }
        Ok(None) => {
            if workload.is_waiting() {
                Some(TaskEvent::Waiting)
            } else if count_not_started() {
                Some(TaskEvent::Waiting)
            } else {
                debug!(workload_id = workload.id, "Service has no task yet");
                None
            }
        }
        Err(BackendError::NotFound(what)) => {
            if workload.is_waiting() || workload.was_killed() {
                Some(TaskEvent::Waiting)
            } else {
                warn!(workload_id = workload.id, missing = %what, "Service disappeared");
                Some(TaskEvent::Restart)
            }
        }
        Err(e @ BackendError::AmbiguousTask { .. }) => {
            error!(workload_id = workload.id, error = %e, "Cannot reconcile service");
            None
        }
        Err(e) => {
            warn!(workload_id = workload.id, error = %e, "Task lookup failed, retrying next poll");
            None
        }
    }
}

async fn join_all(mut workers: JoinSet<()>) {
    while let Some(result) = workers.join_next().await {
        if let Err(e) = result {
            error!(error = %e, "Event worker panicked");
        }
    }
}
