// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for the berth daemon.

use std::path::PathBuf;
use std::time::Duration;

use crate::queue::ConcurrencyBounds;
use crate::server::{ExecutionServer, PathTranslation};

/// Daemon configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Database URL for workload and history storage
    pub database_url: String,
    /// Execution server, if one is configured at startup
    pub server: Option<ExecutionServer>,
    /// Whether this node runs orphan recovery
    pub primary_node: bool,
    /// How often event ingestion polls the backend
    pub event_poll_interval: Duration,
    /// Worker bounds for the resolve & launch stage
    pub staging_concurrency: ConcurrencyBounds,
    /// Worker bounds for the finalize stage
    pub finalizing_concurrency: ConcurrencyBounds,
    /// Root directory for captured container logs
    pub log_dir: Option<PathBuf>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("BERTH_DATABASE_URL")
            .map_err(|_| ConfigError::MissingEnvVar("BERTH_DATABASE_URL"))?;

        let server = server_from_env()?;

        let primary_node = env_flag("BERTH_PRIMARY_NODE", true);

        let poll_secs = env_parse::<u64>("BERTH_EVENT_POLL_SECS")?.unwrap_or(10);

        let staging_concurrency =
            env_bounds("BERTH_STAGING_CONCURRENCY")?.unwrap_or_default();
        let finalizing_concurrency =
            env_bounds("BERTH_FINALIZING_CONCURRENCY")?.unwrap_or_default();

        let log_dir = std::env::var("BERTH_LOG_DIR").ok().map(PathBuf::from);

        Ok(Self {
            database_url,
            server,
            primary_node,
            event_poll_interval: Duration::from_secs(poll_secs),
            staging_concurrency,
            finalizing_concurrency,
            log_dir,
        })
    }
}

fn server_from_env() -> Result<Option<ExecutionServer>, ConfigError> {
    let Ok(host) = std::env::var("BERTH_DOCKER_HOST") else {
        return Ok(None);
    };

    let platform_prefix = std::env::var("BERTH_PATH_TRANSLATION_PLATFORM_PREFIX").ok();
    let backend_prefix = std::env::var("BERTH_PATH_TRANSLATION_BACKEND_PREFIX").ok();
    let path_translation = match (platform_prefix, backend_prefix) {
        (Some(platform_prefix), Some(backend_prefix)) => Some(PathTranslation {
            platform_prefix,
            backend_prefix,
        }),
        (None, None) => None,
        (Some(value), None) | (None, Some(value)) => {
            return Err(ConfigError::InvalidValue {
                var: "BERTH_PATH_TRANSLATION_PLATFORM_PREFIX/BERTH_PATH_TRANSLATION_BACKEND_PREFIX",
                value,
            });
        }
    };

    let swarm_constraints = std::env::var("BERTH_SWARM_CONSTRAINTS")
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();

    Ok(Some(ExecutionServer {
        name: std::env::var("BERTH_DOCKER_NAME").unwrap_or_else(|_| host.clone()),
        host,
        cert_path: std::env::var("BERTH_DOCKER_CERT_PATH").ok().map(PathBuf::from),
        swarm_mode: env_flag("BERTH_SWARM_MODE", false),
        auto_cleanup: env_flag("BERTH_AUTO_CLEANUP", true),
        container_user: std::env::var("BERTH_CONTAINER_USER")
            .ok()
            .filter(|u| !u.is_empty()),
        swarm_constraints,
        path_translation,
    }))
}

fn env_flag(var: &str, default: bool) -> bool {
    std::env::var(var)
        .map(|v| v == "true" || v == "1")
        .unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(var: &'static str) -> Result<Option<T>, ConfigError> {
    match std::env::var(var) {
        Ok(value) => value
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { var, value }),
        Err(_) => Ok(None),
    }
}

fn env_bounds(var: &'static str) -> Result<Option<ConcurrencyBounds>, ConfigError> {
    match std::env::var(var) {
        Ok(value) => ConcurrencyBounds::parse(&value)
            .map(Some)
            .ok_or(ConfigError::InvalidValue { var, value }),
        Err(_) => Ok(None),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// An environment variable holds a value that cannot be used.
    #[error("Invalid value for {var}: {value}")]
    InvalidValue {
        /// Variable name.
        var: &'static str,
        /// Offending value.
        value: String,
    },
}
