// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for berth.

use thiserror::Error;

/// Orchestration errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Execution backend call failed.
    #[error("Backend error: {0}")]
    Backend(#[from] crate::backend::BackendError),

    /// Workload was not found in the store.
    #[error("Workload not found: {0}")]
    WorkloadNotFound(i64),

    /// Request validation failed.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Launch descriptor could not be resolved.
    #[error("Command resolution failed: {0}")]
    Resolution(String),

    /// Queue transport refused a message.
    #[error("Queue error: {0}")]
    Queue(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Short, human-readable name of the error kind, used in notifications.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Config(_) => "ConfigError",
            Error::Database(_) => "DatabaseError",
            Error::Io(_) => "IoError",
            Error::Json(_) => "JsonError",
            Error::Backend(e) => e.kind(),
            Error::WorkloadNotFound(_) => "WorkloadNotFound",
            Error::InvalidRequest(_) => "InvalidRequest",
            Error::Resolution(_) => "CommandResolutionError",
            Error::Queue(_) => "QueueError",
            Error::Other(_) => "Error",
        }
    }
}

/// Result type using berth Error.
pub type Result<T> = std::result::Result<T, Error>;
