// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Berth - Container Execution and Lifecycle Orchestration
//!
//! This crate launches containerized jobs on a Docker engine or a Docker
//! Swarm cluster, follows them through their lifecycle and finalizes them
//! once they exit. Every observation is appended to a per-workload history
//! from which the current status is projected.
//!
//! # Architecture
//!
//! ```text
//!        submit_launch                         Docker engine / Swarm
//!              │                                   ▲          │
//!              ▼                                   │          │ events, tasks
//! ┌─────────────────────────┐   launch/start ┌─────┴──────────▼──────┐
//! │  staging stage          │───────────────►│   ExecutionBackend    │
//! │  (LaunchConsumer)       │                └─────▲──────────┬──────┘
//! └────────────┬────────────┘                      │          │
//!              │                                   │          ▼
//!              ▼                             ┌─────┴─────────────────┐
//! ┌─────────────────────────┐                │   EventIngestion      │
//! │      Orchestrator       │◄───────────────│   (poll loop)         │
//! │  history, restarts,     │  TaskEvent /   └───────────────────────┘
//! │  queue_finalize         │  ContainerEvent
//! └────────────┬────────────┘
//!              │ FinalizeRequest
//!              ▼
//! ┌─────────────────────────┐        ┌──────────────────────────────┐
//! │  finalizing stage       │───────►│  WorkloadStore (PostgreSQL)  │
//! │  (FinalizeConsumer)     │        │  workloads + history         │
//! └─────────────────────────┘        └──────────────────────────────┘
//! ```
//!
//! # Workload Status
//!
//! ```text
//! Created ──► start/running ──► die | kill | oom | task exit
//!                                      │
//!                                      ▼
//!                               _<status> (queued)
//!                                      │
//!                                      ▼
//!                                 Finalizing ──► Complete | Failed…
//! ```
//!
//! `Restart` and `Waiting` are side annotations: a `Waiting` workload is
//! finalized on the next poll, a `Restart` records a service relaunched
//! after its node was lost.
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `BERTH_DATABASE_URL` | Yes | - | PostgreSQL connection string |
//! | `BERTH_DOCKER_HOST` | No | - | Execution server address; no server when unset |
//! | `BERTH_DOCKER_NAME` | No | host | Display name of the server |
//! | `BERTH_DOCKER_CERT_PATH` | No | - | Directory with `key.pem`, `cert.pem`, `ca.pem` |
//! | `BERTH_SWARM_MODE` | No | `false` | Launch services instead of containers |
//! | `BERTH_AUTO_CLEANUP` | No | `true` | Remove resources after finalizing |
//! | `BERTH_CONTAINER_USER` | No | - | User to run containers as |
//! | `BERTH_SWARM_CONSTRAINTS` | No | - | Comma-separated placement constraints |
//! | `BERTH_PATH_TRANSLATION_PLATFORM_PREFIX` | No | - | Mount path prefix to replace |
//! | `BERTH_PATH_TRANSLATION_BACKEND_PREFIX` | No | - | Replacement prefix on the server |
//! | `BERTH_PRIMARY_NODE` | No | `true` | Run orphan recovery on startup |
//! | `BERTH_EVENT_POLL_SECS` | No | `10` | Event ingestion poll interval |
//! | `BERTH_STAGING_CONCURRENCY` | No | `10-20` | Staging workers, `min-max` |
//! | `BERTH_FINALIZING_CONCURRENCY` | No | `10-20` | Finalizing workers, `min-max` |
//! | `BERTH_LOG_DIR` | No | - | Directory for captured container logs |
//!
//! # Modules
//!
//! - [`backend`]: Execution backends (Docker, mock)
//! - [`orchestrator`]: Status transitions, restarts and finalize queueing
//! - [`finalize`]: The finalize routine
//! - [`events`]: Container and task events, and the ingestion worker
//! - [`queue`]: Staging and finalizing stages
//! - [`store`]: Workload persistence
//! - [`orphan_recovery`]: Startup reset of abandoned finalizations
//! - [`runtime`]: Embeddable runtime wiring it all together

#![warn(missing_docs)]

/// Database migrations for berth.
///
/// ```ignore
/// let pool = PgPool::connect(&database_url).await?;
/// berth::migrations::run(&pool).await?;
/// ```
pub mod migrations;

/// Daemon configuration loaded from environment variables.
pub mod config;

/// Error types for berth operations.
pub mod error;

/// Execution server settings.
pub mod server;

/// Container execution backends (Docker, mock).
pub mod backend;

/// Orchestrator task model and state classification.
pub mod task;

/// Workload records, launch plans and history.
pub mod workload;

/// Container and service task events.
pub mod events;

/// Workload persistence.
pub mod store;

/// Platform collaborator contracts.
pub mod collaborators;

/// At-most-one-in-flight guard.
pub mod inflight;

/// Launch and finalize queue pipeline.
pub mod queue;

/// Workload orchestration.
pub mod orchestrator;

/// Finalize routine.
pub mod finalize;

/// Startup recovery of abandoned finalizations.
pub mod orphan_recovery;

/// Embeddable runtime for berth.
pub mod runtime;

pub use config::Config;
pub use error::Error;
pub use orchestrator::Orchestrator;
pub use runtime::BerthRuntime;
