// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Plan translation shared by all backends.
//!
//! Everything here runs before the first runtime call. A plan that fails
//! these checks is rejected without side effects on the runtime.

use std::collections::BTreeMap;
use std::path::Path;

use tracing::debug;

use super::{BackendError, Result};
use crate::server::ExecutionServer;
use crate::workload::{LaunchPlan, MountSpec};

/// Command and entrypoint for a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    /// Entrypoint override; `Some(vec![""])` clears the image entrypoint.
    pub entrypoint: Option<Vec<String>>,
    /// Command words.
    pub cmd: Vec<String>,
}

/// Make sure every mount's host path exists.
///
/// A missing host path gets its parent directories created, and for
/// directory mounts the path itself.
pub async fn prepare_mounts(mounts: &[MountSpec]) -> Result<()> {
    for mount in mounts {
        if mount.host_path.trim().is_empty() || mount.container_path.trim().is_empty() {
            return Err(BackendError::InvalidRequest(format!(
                "Mount \"{}\" has a blank host or container path.",
                mount.name
            )));
        }

        let host = Path::new(&mount.host_path);
        if tokio::fs::try_exists(host).await.unwrap_or(false) {
            continue;
        }

        let parent = host
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or_else(|| BackendError::ResourceSetup {
                path: mount.host_path.clone(),
                reason: "could not determine parent directory".to_string(),
            })?;

        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| setup_error(parent, e))?;

        if !mount.file {
            tokio::fs::create_dir_all(host)
                .await
                .map_err(|e| setup_error(host, e))?;
        }

        debug!(mount = %mount.name, path = %mount.host_path, "Created missing mount path");
    }
    Ok(())
}

fn setup_error(path: &Path, e: std::io::Error) -> BackendError {
    BackendError::ResourceSetup {
        path: path.display().to_string(),
        reason: e.to_string(),
    }
}

/// Megabytes to bytes; absent means unconstrained (0).
pub fn megabytes_to_bytes(mb: Option<i64>) -> Result<i64> {
    match mb {
        None => Ok(0),
        Some(mb) if mb < 0 => Err(invalid("Memory must not be negative.")),
        Some(mb) => mb
            .checked_mul(1024 * 1024)
            .ok_or_else(|| invalid("Memory value is too large.")),
    }
}

/// Fractional cores to nano-CPUs; absent means unconstrained (0).
pub fn cores_to_nano_cpus(cores: Option<f64>) -> Result<i64> {
    let Some(cores) = cores else {
        return Ok(0);
    };
    if !cores.is_finite() || cores < 0.0 {
        return Err(invalid("CPU value must be a non-negative number."));
    }
    let nanos = (cores * 1e9).round();
    if nanos >= i64::MAX as f64 {
        return Err(invalid("CPU value is too large."));
    }
    Ok(nanos as i64)
}

/// Check that the plan's resource values convert cleanly.
pub fn validate_resources(plan: &LaunchPlan) -> Result<()> {
    megabytes_to_bytes(plan.reserve_memory_mb)?;
    megabytes_to_bytes(plan.limit_memory_mb)?;
    cores_to_nano_cpus(plan.limit_cpu)?;
    Ok(())
}

/// Validate the port map, returning `(container, host)` pairs.
pub fn validate_ports(ports: &BTreeMap<String, String>) -> Result<Vec<(String, String)>> {
    ports
        .iter()
        .map(|(container, host)| {
            let container = container.trim();
            let host = host.trim();
            match (container.is_empty(), host.is_empty()) {
                (false, false) => Ok((container.to_string(), host.to_string())),
                (true, false) => Err(invalid("Container port is blank.")),
                (false, true) => Err(invalid("Host port is blank")),
                (true, true) => Err(invalid("Container and host ports are blank")),
            }
        })
        .collect()
}

/// Numeric port, for service endpoint specs.
pub fn parse_port(port: &str) -> Result<i64> {
    port.trim()
        .parse::<u16>()
        .map(i64::from)
        .map_err(|_| invalid("Error creating port binding."))
}

fn invalid(message: &str) -> BackendError {
    BackendError::InvalidRequest(message.to_string())
}

/// Split a command line into words the way a POSIX shell would, without
/// expansions.
pub fn shell_split(line: &str) -> Result<Vec<String>> {
    #[derive(PartialEq)]
    enum Quote {
        None,
        Single,
        Double,
    }

    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote = Quote::None;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match quote {
            Quote::Single => {
                if c == '\'' {
                    quote = Quote::None;
                } else {
                    current.push(c);
                }
            }
            Quote::Double => match c {
                '"' => quote = Quote::None,
                '\\' => match chars.next() {
                    Some(next @ ('"' | '\\' | '$' | '`')) => current.push(next),
                    Some(next) => {
                        current.push('\\');
                        current.push(next);
                    }
                    None => return Err(invalid("Unterminated quote in command line.")),
                },
                _ => current.push(c),
            },
            Quote::None => match c {
                '\'' => {
                    quote = Quote::Single;
                    in_word = true;
                }
                '"' => {
                    quote = Quote::Double;
                    in_word = true;
                }
                '\\' => {
                    if let Some(next) = chars.next() {
                        current.push(next);
                        in_word = true;
                    }
                }
                c if c.is_whitespace() => {
                    if in_word {
                        words.push(std::mem::take(&mut current));
                        in_word = false;
                    }
                }
                _ => {
                    current.push(c);
                    in_word = true;
                }
            },
        }
    }

    if quote != Quote::None {
        return Err(invalid("Unterminated quote in command line."));
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}

/// Command and entrypoint for `plan`.
pub fn command_for(plan: &LaunchPlan) -> Result<CommandSpec> {
    if plan.override_entrypoint {
        Ok(CommandSpec {
            entrypoint: Some(vec![String::new()]),
            cmd: vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                plan.command_line.clone(),
            ],
        })
    } else {
        Ok(CommandSpec {
            entrypoint: None,
            cmd: shell_split(&plan.command_line)?,
        })
    }
}

/// `KEY=VALUE` pairs.
pub fn env_list(environment: &BTreeMap<String, String>) -> Vec<String> {
    environment
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect()
}

/// Host path for a mount, after path translation.
pub fn bind_source(server: &ExecutionServer, mount: &MountSpec) -> String {
    server.translate_path(&mount.host_path)
}

/// `host:container[:ro]` bind string.
pub fn bind_string(server: &ExecutionServer, mount: &MountSpec) -> String {
    let mut bind = format!("{}:{}", bind_source(server, mount), mount.container_path);
    if !mount.writable {
        bind.push_str(":ro");
    }
    bind
}
