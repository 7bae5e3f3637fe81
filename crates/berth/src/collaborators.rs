// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Interfaces to the platform around the orchestrator.
//!
//! Descriptor resolution, workflow tracking, admin mail and output
//! registration belong to the hosting platform. Only their contracts live
//! here, plus logging implementations used by the standalone daemon.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::workload::{OutputSpec, ResolvedLaunchDescriptor, Workload};

/// Turns launch identifiers and raw inputs into a launch descriptor.
#[async_trait]
pub trait DescriptorResolver: Send + Sync {
    /// Resolve a descriptor. Failures should use [`crate::Error::Resolution`].
    async fn resolve(
        &self,
        wrapper_id: &str,
        command_id: &str,
        inputs: &BTreeMap<String, String>,
        acting_user: &str,
    ) -> Result<ResolvedLaunchDescriptor>;
}

/// Platform-tracked record of job progress shown to users.
#[async_trait]
pub trait WorkflowTracker: Send + Sync {
    /// Create a workflow handle.
    async fn create(
        &self,
        root_id: &str,
        kind: &str,
        wrapper_name: &str,
        project: Option<&str>,
        user: &str,
    ) -> Result<String>;

    /// Set the status string.
    async fn set_status(&self, workflow_id: &str, status: &str) -> Result<()>;

    /// Set the details string.
    async fn set_details(&self, workflow_id: &str, details: &str) -> Result<()>;
}

/// Administrator notification sink. Best-effort.
#[async_trait]
pub trait AdminNotifier: Send + Sync {
    /// Send a notification with an HTML body.
    async fn notify(&self, subject: &str, body_html: &str) -> Result<()>;
}

/// Receives output registration calls during finalize.
#[async_trait]
pub trait OutputRegistrar: Send + Sync {
    /// Register one declared output of a finished workload.
    async fn register(&self, workload: &Workload, output: &OutputSpec) -> Result<()>;
}

/// Workflow tracker that only logs.
#[derive(Debug, Default, Clone)]
pub struct TracingWorkflowTracker;

#[async_trait]
impl WorkflowTracker for TracingWorkflowTracker {
    async fn create(
        &self,
        root_id: &str,
        kind: &str,
        wrapper_name: &str,
        project: Option<&str>,
        user: &str,
    ) -> Result<String> {
        let workflow_id = Uuid::new_v4().to_string();
        info!(
            workflow_id = %workflow_id,
            root_id = %root_id,
            kind = %kind,
            wrapper = %wrapper_name,
            project = ?project,
            user = %user,
            "Workflow created"
        );
        Ok(workflow_id)
    }

    async fn set_status(&self, workflow_id: &str, status: &str) -> Result<()> {
        info!(workflow_id = %workflow_id, status = %status, "Workflow status");
        Ok(())
    }

    async fn set_details(&self, workflow_id: &str, details: &str) -> Result<()> {
        info!(workflow_id = %workflow_id, details = %details, "Workflow details");
        Ok(())
    }
}

/// Notifier that logs at `warn`.
#[derive(Debug, Default, Clone)]
pub struct TracingNotifier;

#[async_trait]
impl AdminNotifier for TracingNotifier {
    async fn notify(&self, subject: &str, body_html: &str) -> Result<()> {
        warn!(subject = %subject, body = %body_html, "Admin notification");
        Ok(())
    }
}

/// Registrar that accepts every output without doing anything.
#[derive(Debug, Default, Clone)]
pub struct NoopOutputRegistrar;

#[async_trait]
impl OutputRegistrar for NoopOutputRegistrar {
    async fn register(&self, workload: &Workload, output: &OutputSpec) -> Result<()> {
        info!(workload_id = workload.id, output = %output.name, "Output not registered (no registrar configured)");
        Ok(())
    }
}

/// Escape text for inclusion in an HTML notification body.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
