// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Queue message shapes.
//!
//! Field names on the wire are stable; an external broker can carry these
//! messages unchanged.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Request to resolve a descriptor and launch it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchRequest {
    /// Owning project.
    pub project: Option<String>,
    /// Wrapper to resolve.
    pub wrapper_id: String,
    /// Command to resolve.
    pub command_id: String,
    /// Wrapper display name.
    pub wrapper_name: String,
    /// Raw input values.
    #[serde(default)]
    pub input_values: BTreeMap<String, String>,
    /// Acting user.
    pub username: String,
    /// Workflow handle; created during staging when absent.
    pub workflow_id: Option<String>,
}

/// Request to finalize a workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeRequest {
    /// Workload to finalize.
    pub workload_id: i64,
    /// Exit code as reported, possibly blank.
    #[serde(rename = "exitCodeString")]
    pub exit_code: Option<String>,
    /// Whether the terminal observation was a success.
    #[serde(rename = "successFlag")]
    pub successful: bool,
    /// User on whose behalf the workload ran.
    pub username: String,
}
