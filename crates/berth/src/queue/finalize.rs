// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Finalizing stage.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error};

use super::messages::FinalizeRequest;
use super::stage::StageConsumer;
use crate::collaborators::escape_html;
use crate::inflight::InFlightSet;
use crate::orchestrator::Orchestrator;
use crate::workload::history::STATUS_FAILED_FINALIZING;

/// Consumes [`FinalizeRequest`]s, one at a time per workload.
pub struct FinalizeConsumer {
    orchestrator: Arc<Orchestrator>,
    in_flight: InFlightSet<i64>,
}

impl FinalizeConsumer {
    /// Create a consumer.
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            orchestrator,
            in_flight: InFlightSet::new(),
        }
    }

    /// Workloads currently being finalized.
    pub fn in_flight(&self) -> &InFlightSet<i64> {
        &self.in_flight
    }
}

#[async_trait]
impl StageConsumer<FinalizeRequest> for FinalizeConsumer {
    async fn consume(&self, request: FinalizeRequest) {
        let Some(_guard) = self.in_flight.try_acquire(request.workload_id) else {
            debug!(workload_id = request.workload_id, "Workload already finalizing, skipping");
            return;
        };

        match self.orchestrator.consume_finalize(&request).await {
            Ok(outcome) => {
                debug!(workload_id = request.workload_id, ?outcome, "Finalize request handled");
            }
            Err(e) => {
                error!(workload_id = request.workload_id, error = %e, "Finalize failed");
                if let Ok(workload) = self.orchestrator.load(request.workload_id).await {
                    self.orchestrator
                        .set_workflow(
                            workload.workflow_id.as_deref(),
                            STATUS_FAILED_FINALIZING,
                            Some(&e.to_string()),
                        )
                        .await;
                }
                self.orchestrator
                    .notify(
                        "Finalizing failure",
                        &format!(
                            "<p>Hello,</p><p>Finalizing workload {} failed.</p><p>{}: {}</p>",
                            request.workload_id,
                            e.kind(),
                            escape_html(&e.to_string())
                        ),
                    )
                    .await;
            }
        }
    }
}
