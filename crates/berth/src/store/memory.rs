// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process workload store, for tests and embedding.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::WorkloadStore;
use crate::error::{Error, Result};
use crate::workload::history;
use crate::workload::{
    ExecutionMode, HistoryEntry, NewWorkload, RuntimeBinding, Workload, WorkloadRole,
};

#[derive(Debug, Default)]
struct Inner {
    next_id: i64,
    workloads: BTreeMap<i64, Workload>,
}

/// Workload store kept in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    async fn filtered(&self, keep: impl Fn(&Workload) -> bool) -> Vec<Workload> {
        let inner = self.inner.read().await;
        inner.workloads.values().filter(|w| keep(w)).cloned().collect()
    }
}

#[async_trait]
impl WorkloadStore for MemoryStore {
    async fn create_workload(&self, new: NewWorkload, initial: HistoryEntry) -> Result<Workload> {
        let mut inner = self.inner.write().await;
        inner.next_id += 1;
        let id = inner.next_id;

        let (container_id, service_id) = match new.mode {
            ExecutionMode::Container => (new.runtime_id, None),
            ExecutionMode::Service => (None, new.runtime_id),
        };
        let workload = Workload {
            id,
            mode: new.mode,
            role: new.role,
            parent_id: new.parent_id,
            container_id,
            service_id,
            task_id: None,
            node_id: None,
            plan: new.plan,
            outputs: new.outputs,
            workflow_id: new.workflow_id,
            username: new.username,
            project: new.project,
            wrapper_name: new.wrapper_name,
            log_paths: Vec::new(),
            created_at: Utc::now(),
            history: vec![initial],
        };
        inner.workloads.insert(id, workload.clone());
        Ok(workload)
    }

    async fn get_workload(&self, id: i64) -> Result<Option<Workload>> {
        Ok(self.inner.read().await.workloads.get(&id).cloned())
    }

    async fn find_by_container_id(&self, container_id: &str) -> Result<Option<Workload>> {
        let inner = self.inner.read().await;
        Ok(inner
            .workloads
            .values()
            .find(|w| {
                w.mode == ExecutionMode::Container && w.container_id.as_deref() == Some(container_id)
            })
            .cloned())
    }

    async fn update_binding(&self, id: i64, binding: &RuntimeBinding) -> Result<()> {
        let mut inner = self.inner.write().await;
        let workload = inner
            .workloads
            .get_mut(&id)
            .ok_or(Error::WorkloadNotFound(id))?;
        workload.container_id = binding.container_id.clone();
        workload.service_id = binding.service_id.clone();
        workload.task_id = binding.task_id.clone();
        workload.node_id = binding.node_id.clone();
        Ok(())
    }

    async fn append_history(&self, id: i64, entry: HistoryEntry) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let workload = inner
            .workloads
            .get_mut(&id)
            .ok_or(Error::WorkloadNotFound(id))?;
        if history::is_duplicate(&workload.history, &entry) {
            return Ok(false);
        }
        workload.history.push(entry);
        Ok(true)
    }

    async fn record_log_paths(&self, id: i64, paths: &[String]) -> Result<()> {
        let mut inner = self.inner.write().await;
        let workload = inner
            .workloads
            .get_mut(&id)
            .ok_or(Error::WorkloadNotFound(id))?;
        workload.log_paths = paths.to_vec();
        Ok(())
    }

    async fn list_active_services(&self) -> Result<Vec<Workload>> {
        Ok(self
            .filtered(|w| {
                w.mode == ExecutionMode::Service && w.service_id.is_some() && !w.is_finalized()
            })
            .await)
    }

    async fn list_by_status(&self, status: &str) -> Result<Vec<Workload>> {
        Ok(self.filtered(|w| w.status() == status).await)
    }

    async fn list_by_status_prefix(&self, prefix: &str) -> Result<Vec<Workload>> {
        Ok(self.filtered(|w| w.status().starts_with(prefix)).await)
    }

    async fn list_children(&self, parent_id: i64, role: WorkloadRole) -> Result<Vec<Workload>> {
        Ok(self
            .filtered(|w| w.parent_id == Some(parent_id) && w.role == role)
            .await)
    }

    async fn purge_workload(&self, id: i64) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let removed = inner.workloads.remove(&id).is_some();
        if removed {
            let children: Vec<i64> = inner
                .workloads
                .values()
                .filter(|w| w.parent_id == Some(id))
                .map(|w| w.id)
                .collect();
            for child in children {
                inner.workloads.remove(&child);
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workload::LaunchPlan;
    use crate::workload::history::{STATUS_COMPLETE, STATUS_CREATED};

    fn new_workload(mode: ExecutionMode, runtime_id: Option<&str>) -> NewWorkload {
        NewWorkload {
            mode,
            role: WorkloadRole::Main,
            parent_id: None,
            runtime_id: runtime_id.map(String::from),
            plan: LaunchPlan::default(),
            outputs: vec![],
            workflow_id: None,
            username: "alice".to_string(),
            project: None,
            wrapper_name: None,
        }
    }

    #[tokio::test]
    async fn test_create_binds_runtime_id_by_mode() {
        let store = MemoryStore::new();
        let c = store
            .create_workload(
                new_workload(ExecutionMode::Container, Some("c1")),
                HistoryEntry::from_system(STATUS_CREATED, "created"),
            )
            .await
            .unwrap();
        let s = store
            .create_workload(
                new_workload(ExecutionMode::Service, Some("s1")),
                HistoryEntry::from_system(STATUS_CREATED, "created"),
            )
            .await
            .unwrap();

        assert_eq!(c.container_id.as_deref(), Some("c1"));
        assert_eq!(s.service_id.as_deref(), Some("s1"));
        assert!(s.container_id.is_none());
        assert_eq!(
            store.find_by_container_id("c1").await.unwrap().unwrap().id,
            c.id
        );
        assert_eq!(store.list_active_services().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_append_skips_duplicates() {
        let store = MemoryStore::new();
        let w = store
            .create_workload(
                new_workload(ExecutionMode::Container, Some("c1")),
                HistoryEntry::from_system(STATUS_CREATED, "created"),
            )
            .await
            .unwrap();

        let mut die = HistoryEntry::from_system("die", "exited");
        die.source = crate::workload::SourceKind::Event;
        die.external_timestamp = Some(Utc::now());

        assert!(store.append_history(w.id, die.clone()).await.unwrap());
        assert!(!store.append_history(w.id, die).await.unwrap());
        assert_eq!(store.get_workload(w.id).await.unwrap().unwrap().history.len(), 2);
    }

    #[tokio::test]
    async fn test_terminal_services_are_not_active() {
        let store = MemoryStore::new();
        let s = store
            .create_workload(
                new_workload(ExecutionMode::Service, Some("s1")),
                HistoryEntry::from_system(STATUS_CREATED, "created"),
            )
            .await
            .unwrap();
        store
            .append_history(s.id, HistoryEntry::from_system(STATUS_COMPLETE, "done"))
            .await
            .unwrap();

        assert!(store.list_active_services().await.unwrap().is_empty());
        assert_eq!(store.list_by_status(STATUS_COMPLETE).await.unwrap().len(), 1);
        assert!(matches!(
            store.append_history(99, HistoryEntry::from_system("x", "y")).await,
            Err(Error::WorkloadNotFound(99))
        ));
    }
}
