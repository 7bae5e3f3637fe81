// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Staging stage: resolve a descriptor and launch it.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use super::messages::LaunchRequest;
use super::stage::StageConsumer;
use crate::collaborators::{DescriptorResolver, escape_html};
use crate::error::Error;
use crate::inflight::InFlightSet;
use crate::orchestrator::{LaunchContext, Orchestrator};

/// Workflow kind recorded for launches without a workflow handle.
const WORKFLOW_KIND: &str = "container";

/// Consumes [`LaunchRequest`]s.
///
/// Requests are guarded by workflow id; a request for a workflow already
/// being staged is dropped. Failures are reported on the workflow and to
/// the administrator and never returned to the transport.
pub struct LaunchConsumer {
    resolver: Arc<dyn DescriptorResolver>,
    orchestrator: Arc<Orchestrator>,
    in_flight: InFlightSet<String>,
}

/// Where staging stopped, and with which error.
struct StagingFailure {
    stage: &'static str,
    error: Error,
    inputs: BTreeMap<String, String>,
}

impl LaunchConsumer {
    /// Create a consumer.
    pub fn new(resolver: Arc<dyn DescriptorResolver>, orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            resolver,
            orchestrator,
            in_flight: InFlightSet::new(),
        }
    }

    /// Workflows currently being staged.
    pub fn in_flight(&self) -> &InFlightSet<String> {
        &self.in_flight
    }

    async fn ensure_workflow(&self, request: &LaunchRequest) -> Option<String> {
        if let Some(id) = &request.workflow_id {
            return Some(id.clone());
        }
        let root = request.project.as_deref().unwrap_or(&request.wrapper_id);
        match self
            .orchestrator
            .workflows()
            .create(
                root,
                WORKFLOW_KIND,
                &request.wrapper_name,
                request.project.as_deref(),
                &request.username,
            )
            .await
        {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(wrapper_id = %request.wrapper_id, error = %e, "Failed to create workflow");
                None
            }
        }
    }

    async fn stage(
        &self,
        request: &LaunchRequest,
        workflow_id: Option<String>,
    ) -> Result<i64, StagingFailure> {
        let mut descriptor = self
            .resolver
            .resolve(
                &request.wrapper_id,
                &request.command_id,
                &request.input_values,
                &request.username,
            )
            .await
            .map_err(|error| StagingFailure {
                stage: "Command resolution",
                error,
                inputs: request
                    .input_values
                    .keys()
                    .map(|k| (k.clone(), "(unresolved)".to_string()))
                    .collect(),
            })?;

        if descriptor.wrapper_name.is_none() {
            descriptor.wrapper_name = Some(request.wrapper_name.clone());
        }

        let ctx = LaunchContext {
            username: request.username.clone(),
            project: request.project.clone(),
            workflow_id,
        };
        match self.orchestrator.launch(&descriptor, &ctx).await {
            Ok(workload) => Ok(workload.id),
            Err(error) => Err(StagingFailure {
                stage: if matches!(error, Error::Backend(_)) {
                    "Container launch"
                } else {
                    "Staging"
                },
                error,
                inputs: descriptor.masked_inputs(),
            }),
        }
    }

    async fn report(&self, request: &LaunchRequest, workflow_id: Option<&str>, failure: StagingFailure) {
        let StagingFailure {
            stage,
            error,
            inputs,
        } = failure;
        error!(
            wrapper_id = %request.wrapper_id,
            command_id = %request.command_id,
            workflow_id = workflow_id.unwrap_or_default(),
            stage,
            error = %error,
            "Launch failed"
        );

        let message = error.to_string();
        self.orchestrator
            .set_workflow(workflow_id, &format!("Failed ({})", stage), Some(&message))
            .await;

        let body = failure_body(request, workflow_id, stage, &error, &inputs);
        self.orchestrator
            .notify(&format!("Container launch failed: {}", stage), &body)
            .await;
    }
}

#[async_trait]
impl StageConsumer<LaunchRequest> for LaunchConsumer {
    async fn consume(&self, request: LaunchRequest) {
        let _guard = match &request.workflow_id {
            Some(id) => match self.in_flight.try_acquire(id.clone()) {
                Some(guard) => Some(guard),
                None => {
                    debug!(workflow_id = %id, "Workflow already staging, skipping");
                    return;
                }
            },
            None => None,
        };

        let workflow_id = self.ensure_workflow(&request).await;
        match self.stage(&request, workflow_id.clone()).await {
            Ok(workload_id) => {
                info!(workload_id, workflow_id = workflow_id.as_deref().unwrap_or_default(), "Launch staged");
            }
            Err(failure) => self.report(&request, workflow_id.as_deref(), failure).await,
        }
    }
}

fn failure_body(
    request: &LaunchRequest,
    workflow_id: Option<&str>,
    stage: &str,
    error: &Error,
    inputs: &BTreeMap<String, String>,
) -> String {
    let mut body = String::new();
    body.push_str("<p>Hello,</p>");
    body.push_str(&format!(
        "<p>A container launch failed during <b>{}</b>.</p>",
        escape_html(stage)
    ));
    body.push_str(&format!(
        "<p>{}: {}</p>",
        error.kind(),
        escape_html(&error.to_string())
    ));
    body.push_str("<ul>");
    for (label, value) in [
        ("User", Some(request.username.as_str())),
        ("Project", request.project.as_deref()),
        ("Wrapper", Some(request.wrapper_id.as_str())),
        ("Command", Some(request.command_id.as_str())),
        ("Workflow", workflow_id),
    ] {
        body.push_str(&format!(
            "<li>{}: {}</li>",
            label,
            escape_html(value.unwrap_or("-"))
        ));
    }
    body.push_str("</ul>");
    if !inputs.is_empty() {
        body.push_str("<p>Inputs:</p><ul>");
        for (name, value) in inputs {
            body.push_str(&format!(
                "<li>{}: {}</li>",
                escape_html(name),
                escape_html(value)
            ));
        }
        body.push_str("</ul>");
    }
    body
}
