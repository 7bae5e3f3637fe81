// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Execution server settings.
//!
//! There is one execution server per deployment. It can be replaced at
//! runtime by an administrative action, so every backend call reads the
//! current value through [`ServerSettings`] instead of caching it.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::backend::{BackendError, Result};
use crate::workload::ExecutionMode;

/// Rewrites platform-side paths into the paths the container runtime sees.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathTranslation {
    /// Prefix as seen by this process.
    pub platform_prefix: String,
    /// Prefix as seen by the container runtime host.
    pub backend_prefix: String,
}

impl PathTranslation {
    /// Translate `path` if it starts with the platform prefix.
    pub fn apply(&self, path: &str) -> String {
        match path.strip_prefix(&self.platform_prefix) {
            Some(rest) => format!("{}{}", self.backend_prefix, rest),
            None => path.to_string(),
        }
    }
}

/// Target container runtime endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionServer {
    /// Display name.
    pub name: String,
    /// Host address: `unix:///var/run/docker.sock`, `tcp://host:2376`, ...
    pub host: String,
    /// Directory holding `key.pem`, `cert.pem` and `ca.pem`.
    pub cert_path: Option<PathBuf>,
    /// Launch clustered services instead of plain containers.
    pub swarm_mode: bool,
    /// Remove containers/services once finalized.
    pub auto_cleanup: bool,
    /// User the workload runs as.
    pub container_user: Option<String>,
    /// Placement constraints applied to every service.
    pub swarm_constraints: Vec<String>,
    /// Mount path translation.
    pub path_translation: Option<PathTranslation>,
}

impl ExecutionServer {
    /// Server talking to the local daemon socket.
    pub fn local_socket() -> Self {
        Self {
            name: "Local socket".to_string(),
            host: "unix:///var/run/docker.sock".to_string(),
            cert_path: None,
            swarm_mode: false,
            auto_cleanup: true,
            container_user: None,
            swarm_constraints: Vec::new(),
            path_translation: None,
        }
    }

    /// Mode new workloads are launched in.
    pub fn execution_mode(&self) -> ExecutionMode {
        if self.swarm_mode {
            ExecutionMode::Service
        } else {
            ExecutionMode::Container
        }
    }

    /// Apply path translation, if configured.
    pub fn translate_path(&self, path: &str) -> String {
        match &self.path_translation {
            Some(translation) => translation.apply(path),
            None => path.to_string(),
        }
    }
}

/// Shared, replaceable holder for the current [`ExecutionServer`].
#[derive(Debug, Clone, Default)]
pub struct ServerSettings {
    inner: Arc<RwLock<Option<ExecutionServer>>>,
}

impl ServerSettings {
    /// Create settings with an optional initial server.
    pub fn new(server: Option<ExecutionServer>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(server)),
        }
    }

    /// Current server, or [`BackendError::NotConfigured`].
    pub fn current(&self) -> Result<ExecutionServer> {
        let guard = self.inner.read().unwrap_or_else(|p| p.into_inner());
        guard.clone().ok_or(BackendError::NotConfigured)
    }

    /// Replace the server.
    pub fn set(&self, server: ExecutionServer) {
        info!(name = %server.name, host = %server.host, swarm_mode = server.swarm_mode, "Execution server updated");
        let mut guard = self.inner.write().unwrap_or_else(|p| p.into_inner());
        *guard = Some(server);
    }

    /// Remove the server.
    pub fn clear(&self) {
        let mut guard = self.inner.write().unwrap_or_else(|p| p.into_inner());
        *guard = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unconfigured_settings() {
        let settings = ServerSettings::default();
        assert!(matches!(
            settings.current(),
            Err(BackendError::NotConfigured)
        ));
    }

    #[test]
    fn test_settings_replace_and_clear() {
        let settings = ServerSettings::new(Some(ExecutionServer::local_socket()));
        assert_eq!(
            settings.current().unwrap().execution_mode(),
            ExecutionMode::Container
        );

        let mut swarm = ExecutionServer::local_socket();
        swarm.swarm_mode = true;
        settings.set(swarm);
        assert_eq!(
            settings.current().unwrap().execution_mode(),
            ExecutionMode::Service
        );

        settings.clear();
        assert!(settings.current().is_err());
    }

    #[test]
    fn test_path_translation() {
        let mut server = ExecutionServer::local_socket();
        assert_eq!(server.translate_path("/data/archive/x"), "/data/archive/x");

        server.path_translation = Some(PathTranslation {
            platform_prefix: "/data".to_string(),
            backend_prefix: "/mnt/nfs".to_string(),
        });
        assert_eq!(server.translate_path("/data/archive/x"), "/mnt/nfs/archive/x");
        assert_eq!(server.translate_path("/other/x"), "/other/x");
    }
}
