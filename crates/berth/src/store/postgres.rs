// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL workload store.
//!
//! Free functions do the work; [`PostgresStore`] delegates to them so
//! callers holding only a pool can use them directly.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::types::Json;

use super::WorkloadStore;
use crate::error::{Error, Result};
use crate::workload::{
    ExecutionMode, HistoryEntry, LaunchPlan, NewWorkload, OutputSpec, RuntimeBinding, SourceKind,
    Workload, WorkloadRole,
};

/// PostgreSQL-backed workload store.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a new Postgres-backed store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// ============================================================================
// Record Types
// ============================================================================

/// Row of the `workloads` table.
#[derive(Debug, sqlx::FromRow)]
struct WorkloadRecord {
    /// Primary key.
    id: i64,
    /// `container` or `service`.
    mode: String,
    /// `main`, `setup` or `wrapup`.
    role: String,
    /// Parent workload.
    parent_id: Option<i64>,
    /// Container id.
    container_id: Option<String>,
    /// Service id.
    service_id: Option<String>,
    /// Task id.
    task_id: Option<String>,
    /// Node id.
    node_id: Option<String>,
    /// Launch plan.
    plan: Json<LaunchPlan>,
    /// Declared outputs.
    outputs: Json<Vec<OutputSpec>>,
    /// Workflow handle.
    workflow_id: Option<String>,
    /// Acting user.
    username: String,
    /// Owning project.
    project: Option<String>,
    /// Wrapper display name.
    wrapper_name: Option<String>,
    /// Captured log files.
    log_paths: Json<Vec<String>>,
    /// Creation time.
    created_at: DateTime<Utc>,
}

/// Row of the `workload_history` table.
#[derive(Debug, sqlx::FromRow)]
struct HistoryRecord {
    /// Owning workload.
    workload_id: i64,
    /// Status string.
    status: String,
    /// Source kind.
    source: String,
    /// Source entity id.
    source_id: Option<String>,
    /// Local record time.
    recorded_at: DateTime<Utc>,
    /// Runtime-reported time.
    external_timestamp: Option<DateTime<Utc>>,
    /// Message.
    message: Option<String>,
    /// Exit code.
    exit_code: Option<String>,
}

impl HistoryRecord {
    fn into_entry(self) -> Result<HistoryEntry> {
        let source = SourceKind::parse(&self.source)
            .ok_or_else(|| Error::Other(format!("unknown history source '{}'", self.source)))?;
        Ok(HistoryEntry {
            status: self.status,
            source,
            source_id: self.source_id,
            recorded_at: self.recorded_at,
            external_timestamp: self.external_timestamp,
            message: self.message,
            exit_code: self.exit_code,
        })
    }
}

impl WorkloadRecord {
    fn into_workload(self, history: Vec<HistoryEntry>) -> Result<Workload> {
        let mode = ExecutionMode::parse(&self.mode)
            .ok_or_else(|| Error::Other(format!("unknown execution mode '{}'", self.mode)))?;
        let role = WorkloadRole::parse(&self.role)
            .ok_or_else(|| Error::Other(format!("unknown workload role '{}'", self.role)))?;
        Ok(Workload {
            id: self.id,
            mode,
            role,
            parent_id: self.parent_id,
            container_id: self.container_id,
            service_id: self.service_id,
            task_id: self.task_id,
            node_id: self.node_id,
            plan: self.plan.0,
            outputs: self.outputs.0,
            workflow_id: self.workflow_id,
            username: self.username,
            project: self.project,
            wrapper_name: self.wrapper_name,
            log_paths: self.log_paths.0,
            created_at: self.created_at,
            history,
        })
    }
}

const WORKLOAD_COLUMNS: &str = r#"
    w.id, w.mode, w.role, w.parent_id, w.container_id, w.service_id, w.task_id, w.node_id,
    w.plan, w.outputs, w.workflow_id, w.username, w.project, w.wrapper_name, w.log_paths,
    w.created_at
"#;

/// Attach history to workload rows, preserving row order.
async fn hydrate(pool: &PgPool, records: Vec<WorkloadRecord>) -> Result<Vec<Workload>> {
    if records.is_empty() {
        return Ok(Vec::new());
    }
    let ids: Vec<i64> = records.iter().map(|r| r.id).collect();

    let rows = sqlx::query_as::<_, HistoryRecord>(
        r#"
        SELECT workload_id, status, source, source_id, recorded_at,
               external_timestamp, message, exit_code
        FROM workload_history
        WHERE workload_id = ANY($1)
        ORDER BY id
        "#,
    )
    .bind(&ids)
    .fetch_all(pool)
    .await?;

    let mut by_workload: HashMap<i64, Vec<HistoryEntry>> = HashMap::new();
    for row in rows {
        let workload_id = row.workload_id;
        by_workload
            .entry(workload_id)
            .or_default()
            .push(row.into_entry()?);
    }

    records
        .into_iter()
        .map(|r| {
            let history = by_workload.remove(&r.id).unwrap_or_default();
            r.into_workload(history)
        })
        .collect()
}

// ============================================================================
// Workload Operations
// ============================================================================

/// Insert a workload and its first history entry in one transaction.
pub async fn create_workload(
    pool: &PgPool,
    new: NewWorkload,
    initial: HistoryEntry,
) -> Result<Workload> {
    let (container_id, service_id) = match new.mode {
        ExecutionMode::Container => (new.runtime_id.clone(), None),
        ExecutionMode::Service => (None, new.runtime_id.clone()),
    };

    let mut tx = pool.begin().await?;
    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO workloads (mode, role, parent_id, container_id, service_id, plan, outputs,
                               workflow_id, username, project, wrapper_name)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        RETURNING id
        "#,
    )
    .bind(new.mode.as_str())
    .bind(new.role.as_str())
    .bind(new.parent_id)
    .bind(container_id)
    .bind(service_id)
    .bind(Json(new.plan))
    .bind(Json(new.outputs))
    .bind(new.workflow_id)
    .bind(new.username)
    .bind(new.project)
    .bind(new.wrapper_name)
    .fetch_one(&mut *tx)
    .await?;

    insert_history(&mut *tx, id, &initial).await?;
    tx.commit().await?;

    get_workload(pool, id)
        .await?
        .ok_or(Error::WorkloadNotFound(id))
}

async fn insert_history<'e, E>(executor: E, workload_id: i64, entry: &HistoryEntry) -> Result<bool>
where
    E: sqlx::PgExecutor<'e>,
{
    // Duplicate observations (same status, source and non-null external time) are skipped.
    let result = sqlx::query(
        r#"
        INSERT INTO workload_history (workload_id, status, source, source_id, recorded_at,
                                      external_timestamp, message, exit_code)
        SELECT $1, $2, $3, $4, $5, $6, $7, $8
        WHERE NOT EXISTS (
            SELECT 1 FROM workload_history
            WHERE workload_id = $1 AND status = $2 AND source = $3
              AND external_timestamp = $6
        )
        "#,
    )
    .bind(workload_id)
    .bind(&entry.status)
    .bind(entry.source.as_str())
    .bind(&entry.source_id)
    .bind(entry.recorded_at)
    .bind(entry.external_timestamp)
    .bind(&entry.message)
    .bind(&entry.exit_code)
    .execute(executor)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Get a workload by id.
pub async fn get_workload(pool: &PgPool, id: i64) -> Result<Option<Workload>> {
    let record = sqlx::query_as::<_, WorkloadRecord>(&format!(
        "SELECT {} FROM workloads w WHERE w.id = $1",
        WORKLOAD_COLUMNS
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(hydrate(pool, record.into_iter().collect()).await?.pop())
}

/// Get the plain-container workload owning `container_id`.
pub async fn find_by_container_id(pool: &PgPool, container_id: &str) -> Result<Option<Workload>> {
    let record = sqlx::query_as::<_, WorkloadRecord>(&format!(
        "SELECT {} FROM workloads w WHERE w.container_id = $1 AND w.mode = 'container' \
         ORDER BY w.id DESC LIMIT 1",
        WORKLOAD_COLUMNS
    ))
    .bind(container_id)
    .fetch_optional(pool)
    .await?;

    Ok(hydrate(pool, record.into_iter().collect()).await?.pop())
}

/// Overwrite the runtime identifiers.
pub async fn update_binding(pool: &PgPool, id: i64, binding: &RuntimeBinding) -> Result<()> {
    let result = sqlx::query(
        r#"
        UPDATE workloads
        SET container_id = $2, service_id = $3, task_id = $4, node_id = $5
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(&binding.container_id)
    .bind(&binding.service_id)
    .bind(&binding.task_id)
    .bind(&binding.node_id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(Error::WorkloadNotFound(id));
    }
    Ok(())
}

/// Append a history entry, returning `false` if it was a duplicate.
pub async fn append_history(pool: &PgPool, id: i64, entry: &HistoryEntry) -> Result<bool> {
    match insert_history(pool, id, entry).await {
        Err(Error::Database(sqlx::Error::Database(db))) if db.is_foreign_key_violation() => {
            Err(Error::WorkloadNotFound(id))
        }
        other => other,
    }
}

/// Record captured log files.
pub async fn record_log_paths(pool: &PgPool, id: i64, paths: &[String]) -> Result<()> {
    let result = sqlx::query("UPDATE workloads SET log_paths = $2 WHERE id = $1")
        .bind(id)
        .bind(Json(paths.to_vec()))
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(Error::WorkloadNotFound(id));
    }
    Ok(())
}

/// Delete a workload; children and history cascade.
pub async fn purge_workload(pool: &PgPool, id: i64) -> Result<bool> {
    let result = sqlx::query("DELETE FROM workloads WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

// ============================================================================
// Status Queries
// ============================================================================

/// Launched service workloads whose current status is not terminal.
pub async fn list_active_services(pool: &PgPool) -> Result<Vec<Workload>> {
    let records = sqlx::query_as::<_, WorkloadRecord>(&format!(
        r#"
        SELECT {}
        FROM workloads w
        JOIN workload_current_status cur ON cur.workload_id = w.id
        WHERE w.mode = 'service'
          AND w.service_id IS NOT NULL
          AND cur.status <> 'Complete'
          AND NOT starts_with(cur.status, 'Failed')
        ORDER BY w.id
        "#,
        WORKLOAD_COLUMNS
    ))
    .fetch_all(pool)
    .await?;

    hydrate(pool, records).await
}

/// Workloads whose current status equals `status`.
pub async fn list_by_status(pool: &PgPool, status: &str) -> Result<Vec<Workload>> {
    let records = sqlx::query_as::<_, WorkloadRecord>(&format!(
        r#"
        SELECT {}
        FROM workloads w
        JOIN workload_current_status cur ON cur.workload_id = w.id
        WHERE cur.status = $1
        ORDER BY w.id
        "#,
        WORKLOAD_COLUMNS
    ))
    .bind(status)
    .fetch_all(pool)
    .await?;

    hydrate(pool, records).await
}

/// Workloads whose current status starts with `prefix`.
pub async fn list_by_status_prefix(pool: &PgPool, prefix: &str) -> Result<Vec<Workload>> {
    let records = sqlx::query_as::<_, WorkloadRecord>(&format!(
        r#"
        SELECT {}
        FROM workloads w
        JOIN workload_current_status cur ON cur.workload_id = w.id
        WHERE starts_with(cur.status, $1)
        ORDER BY w.id
        "#,
        WORKLOAD_COLUMNS
    ))
    .bind(prefix)
    .fetch_all(pool)
    .await?;

    hydrate(pool, records).await
}

/// Sub-workloads of `parent_id` with the given role.
pub async fn list_children(
    pool: &PgPool,
    parent_id: i64,
    role: WorkloadRole,
) -> Result<Vec<Workload>> {
    let records = sqlx::query_as::<_, WorkloadRecord>(&format!(
        "SELECT {} FROM workloads w WHERE w.parent_id = $1 AND w.role = $2 ORDER BY w.id",
        WORKLOAD_COLUMNS
    ))
    .bind(parent_id)
    .bind(role.as_str())
    .fetch_all(pool)
    .await?;

    hydrate(pool, records).await
}

// ============================================================================
// Trait Implementation
// ============================================================================

#[async_trait]
impl WorkloadStore for PostgresStore {
    async fn create_workload(&self, new: NewWorkload, initial: HistoryEntry) -> Result<Workload> {
        create_workload(&self.pool, new, initial).await
    }

    async fn get_workload(&self, id: i64) -> Result<Option<Workload>> {
        get_workload(&self.pool, id).await
    }

    async fn find_by_container_id(&self, container_id: &str) -> Result<Option<Workload>> {
        find_by_container_id(&self.pool, container_id).await
    }

    async fn update_binding(&self, id: i64, binding: &RuntimeBinding) -> Result<()> {
        update_binding(&self.pool, id, binding).await
    }

    async fn append_history(&self, id: i64, entry: HistoryEntry) -> Result<bool> {
        append_history(&self.pool, id, &entry).await
    }

    async fn record_log_paths(&self, id: i64, paths: &[String]) -> Result<()> {
        record_log_paths(&self.pool, id, paths).await
    }

    async fn list_active_services(&self) -> Result<Vec<Workload>> {
        list_active_services(&self.pool).await
    }

    async fn list_by_status(&self, status: &str) -> Result<Vec<Workload>> {
        list_by_status(&self.pool, status).await
    }

    async fn list_by_status_prefix(&self, prefix: &str) -> Result<Vec<Workload>> {
        list_by_status_prefix(&self.pool, prefix).await
    }

    async fn list_children(&self, parent_id: i64, role: WorkloadRole) -> Result<Vec<Workload>> {
        list_children(&self.pool, parent_id, role).await
    }

    async fn purge_workload(&self, id: i64) -> Result<bool> {
        purge_workload(&self.pool, id).await
    }
}
