// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workload persistence.
//!
//! History is append-only. The store never keeps a "current status"
//! column; queries that filter on status use the same projection as
//! [`crate::workload::history::current`].

pub mod memory;
pub mod postgres;

use async_trait::async_trait;

use crate::error::Result;
use crate::workload::{HistoryEntry, NewWorkload, RuntimeBinding, Workload, WorkloadRole};

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

/// Storage for workloads and their history.
#[async_trait]
pub trait WorkloadStore: Send + Sync {
    /// Insert a workload with its first history entry.
    async fn create_workload(&self, new: NewWorkload, initial: HistoryEntry) -> Result<Workload>;

    /// Load a workload with its full history.
    async fn get_workload(&self, id: i64) -> Result<Option<Workload>>;

    /// Plain-container workload owning `container_id`.
    async fn find_by_container_id(&self, container_id: &str) -> Result<Option<Workload>>;

    /// Overwrite the runtime identifiers.
    async fn update_binding(&self, id: i64, binding: &RuntimeBinding) -> Result<()>;

    /// Append a history entry.
    ///
    /// Returns `false` when the entry duplicates a stored observation
    /// (see [`crate::workload::history::is_duplicate`]) and was skipped.
    async fn append_history(&self, id: i64, entry: HistoryEntry) -> Result<bool>;

    /// Record captured log files.
    async fn record_log_paths(&self, id: i64, paths: &[String]) -> Result<()>;

    /// Launched service workloads whose status is not terminal.
    async fn list_active_services(&self) -> Result<Vec<Workload>>;

    /// Workloads whose current status equals `status`.
    async fn list_by_status(&self, status: &str) -> Result<Vec<Workload>>;

    /// Workloads whose current status starts with `prefix`.
    async fn list_by_status_prefix(&self, prefix: &str) -> Result<Vec<Workload>>;

    /// Sub-workloads of `parent_id` with the given role, oldest first.
    async fn list_children(&self, parent_id: i64, role: WorkloadRole) -> Result<Vec<Workload>>;

    /// Delete a workload and its history. Administrative only.
    async fn purge_workload(&self, id: i64) -> Result<bool>;
}
