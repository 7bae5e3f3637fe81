// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Launch and finalize queue pipeline.
//!
//! Two independent stages, each draining a bounded channel into a worker
//! set whose size follows the stage's live [`ConcurrencyBounds`]:
//!
//! ```text
//! submit_launch ──► [staging]    ──► LaunchConsumer   ──► Orchestrator::launch
//! queue_finalize ─► [finalizing] ──► FinalizeConsumer ──► Orchestrator::consume_finalize
//! ```
//!
//! Consumers assume at-least-once delivery and never hand errors back to
//! the transport.

mod finalize;
mod launch;
mod messages;
mod settings;
mod stage;

pub use finalize::FinalizeConsumer;
pub use launch::LaunchConsumer;
pub use messages::{FinalizeRequest, LaunchRequest};
pub use settings::{ConcurrencyBounds, QueueKind, QueueSettings, QueueSettingsError};
pub use stage::{QueueSender, StageConsumer, StageRunner, channel};
