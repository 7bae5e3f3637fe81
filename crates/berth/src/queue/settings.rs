// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-stage concurrency bounds.
//!
//! Bounds are published through `watch` channels, so a running stage picks
//! up a new maximum on its next dispatch. `min` is validated and exposed;
//! `max` caps concurrent workers.

use thiserror::Error;
use tokio::sync::watch;
use tracing::info;

/// Queue settings errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueSettingsError {
    /// `min` exceeds `max`, or `max` is zero.
    #[error("Invalid concurrency bounds {min}-{max}: min must not exceed max and max must be at least 1")]
    InvalidBounds {
        /// Requested minimum.
        min: usize,
        /// Requested maximum.
        max: usize,
    },
}

/// Min/max worker count of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcurrencyBounds {
    /// Minimum workers.
    pub min: usize,
    /// Maximum workers.
    pub max: usize,
}

impl Default for ConcurrencyBounds {
    fn default() -> Self {
        Self { min: 10, max: 20 }
    }
}

impl ConcurrencyBounds {
    /// Validated bounds.
    pub fn new(min: usize, max: usize) -> Result<Self, QueueSettingsError> {
        if min > max || max == 0 {
            return Err(QueueSettingsError::InvalidBounds { min, max });
        }
        Ok(Self { min, max })
    }

    /// Parse `min-max`.
    pub fn parse(value: &str) -> Option<Self> {
        let (min, max) = value.split_once('-')?;
        Self::new(min.trim().parse().ok()?, max.trim().parse().ok()?).ok()
    }
}

/// Pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    /// Resolve & launch.
    Staging,
    /// Finalize.
    Finalizing,
}

impl QueueKind {
    /// Stage name.
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueKind::Staging => "staging",
            QueueKind::Finalizing => "finalizing",
        }
    }
}

/// Live concurrency settings of both stages.
#[derive(Debug)]
pub struct QueueSettings {
    staging: watch::Sender<ConcurrencyBounds>,
    finalizing: watch::Sender<ConcurrencyBounds>,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self::new(ConcurrencyBounds::default(), ConcurrencyBounds::default())
    }
}

impl QueueSettings {
    /// Create settings with initial bounds.
    pub fn new(staging: ConcurrencyBounds, finalizing: ConcurrencyBounds) -> Self {
        Self {
            staging: watch::Sender::new(staging),
            finalizing: watch::Sender::new(finalizing),
        }
    }

    fn sender(&self, kind: QueueKind) -> &watch::Sender<ConcurrencyBounds> {
        match kind {
            QueueKind::Staging => &self.staging,
            QueueKind::Finalizing => &self.finalizing,
        }
    }

    /// Current bounds of a stage.
    pub fn bounds(&self, kind: QueueKind) -> ConcurrencyBounds {
        *self.sender(kind).borrow()
    }

    /// Replace the bounds of a stage.
    ///
    /// Invalid bounds are rejected and the previous bounds stay in force.
    pub fn set_bounds(
        &self,
        kind: QueueKind,
        min: usize,
        max: usize,
    ) -> Result<ConcurrencyBounds, QueueSettingsError> {
        let bounds = ConcurrencyBounds::new(min, max)?;
        self.sender(kind).send_replace(bounds);
        info!(queue = kind.as_str(), min, max, "Queue concurrency updated");
        Ok(bounds)
    }

    /// Receiver following a stage's bounds.
    pub fn subscribe(&self, kind: QueueKind) -> watch::Receiver<ConcurrencyBounds> {
        self.sender(kind).subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_update_keeps_previous_bounds() {
        let settings = QueueSettings::default();
        settings.set_bounds(QueueKind::Staging, 2, 4).unwrap();

        let err = settings.set_bounds(QueueKind::Staging, 5, 3).unwrap_err();
        assert_eq!(err, QueueSettingsError::InvalidBounds { min: 5, max: 3 });
        assert_eq!(
            settings.bounds(QueueKind::Staging),
            ConcurrencyBounds { min: 2, max: 4 }
        );
        assert_eq!(
            settings.bounds(QueueKind::Finalizing),
            ConcurrencyBounds::default()
        );
    }

    #[test]
    fn test_equal_bounds_accepted() {
        let settings = QueueSettings::default();
        assert!(settings.set_bounds(QueueKind::Finalizing, 3, 3).is_ok());
        assert!(settings.set_bounds(QueueKind::Finalizing, 0, 0).is_err());
    }

    #[test]
    fn test_subscribers_see_updates() {
        let settings = QueueSettings::default();
        let rx = settings.subscribe(QueueKind::Finalizing);
        settings.set_bounds(QueueKind::Finalizing, 1, 2).unwrap();
        assert_eq!(rx.borrow().max, 2);
    }

    #[test]
    fn test_parse() {
        assert_eq!(
            ConcurrencyBounds::parse("10-20"),
            Some(ConcurrencyBounds { min: 10, max: 20 })
        );
        assert_eq!(ConcurrencyBounds::parse("5 - 5").unwrap().max, 5);
        assert_eq!(ConcurrencyBounds::parse("20-10"), None);
        assert_eq!(ConcurrencyBounds::parse("x"), None);
    }
}
