// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Docker Engine / Swarm backend.
//!
//! Plain containers go through the container API. Clustered workloads are
//! swarm services created with zero replicas and scaled to one on start,
//! so bookkeeping can be persisted between the two calls.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::models::{
    ContainerCreateBody, EndpointPortConfig, EndpointPortConfigProtocolEnum, EndpointSpec, EventMessage, HostConfig,
    Limit, Mount, MountTypeEnum, PortBinding, ResourceObject, ServiceSpec, ServiceSpecMode,
    ServiceSpecModeReplicated, TaskSpec, TaskSpecContainerSpec, TaskSpecPlacement,
    TaskSpecResources, TaskSpecRestartPolicy, TaskSpecRestartPolicyConditionEnum,
};
use bollard::query_parameters::{
    CreateContainerOptions, EventsOptionsBuilder, InspectContainerOptions, InspectServiceOptions,
    KillContainerOptions, ListTasksOptionsBuilder, LogsOptionsBuilder,
    RemoveContainerOptionsBuilder, StartContainerOptions, UpdateServiceOptionsBuilder,
};
use bollard::{API_DEFAULT_VERSION, Docker};
use chrono::{DateTime, Utc};
use futures_util::TryStreamExt;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::prepare::{self, CommandSpec};
use super::{BackendError, ExecutionBackend, Launched, LogStream, Result, RuntimeStatus};
use crate::events::ContainerEvent;
use crate::server::{ExecutionServer, ServerSettings};
use crate::task::{Task, pick_single_task};
use crate::workload::{ExecutionMode, LaunchPlan, Workload};

/// Client request timeout in seconds.
const TIMEOUT_SECS: u64 = 120;

/// Socket mounted into services so they can launch nested containers.
const CONTROL_SOCKET: &str = "/var/run/docker.sock";

/// Backend talking to a Docker daemon or swarm manager.
pub struct DockerBackend {
    settings: ServerSettings,
    client: Mutex<Option<(ExecutionServer, Docker)>>,
}

impl DockerBackend {
    /// Create a backend reading the server from `settings` on every call.
    pub fn new(settings: ServerSettings) -> Self {
        Self {
            settings,
            client: Mutex::new(None),
        }
    }

    /// Current server and a client connected to it.
    ///
    /// The client is rebuilt whenever the configured server changes.
    async fn client(&self) -> Result<(ExecutionServer, Docker)> {
        let server = self.settings.current()?;
        let mut cached = self.client.lock().await;
        if let Some((cached_server, docker)) = cached.as_ref()
            && *cached_server == server
        {
            return Ok((server, docker.clone()));
        }

        let docker = connect(&server)?;
        info!(name = %server.name, host = %server.host, "Connected to container server");
        *cached = Some((server.clone(), docker.clone()));
        Ok((server, docker))
    }

    async fn launch_container(
        &self,
        server: &ExecutionServer,
        docker: &Docker,
        plan: &LaunchPlan,
        ports: Vec<(String, String)>,
        command: CommandSpec,
    ) -> Result<String> {
        let port_bindings: HashMap<String, Option<Vec<PortBinding>>> = ports
            .into_iter()
            .map(|(container, host)| {
                (
                    format!("{}/tcp", container),
                    Some(vec![PortBinding {
                        host_ip: None,
                        host_port: Some(host),
                    }]),
                )
            })
            .collect();

        let host_config = HostConfig {
            binds: Some(
                plan.mounts
                    .iter()
                    .map(|m| prepare::bind_string(server, m))
                    .collect(),
            ),
            memory_reservation: Some(prepare::megabytes_to_bytes(plan.reserve_memory_mb)?),
            memory: Some(prepare::megabytes_to_bytes(plan.limit_memory_mb)?),
            nano_cpus: Some(prepare::cores_to_nano_cpus(plan.limit_cpu)?),
            port_bindings: Some(port_bindings),
            ..Default::default()
        };

        let config = ContainerCreateBody {
            image: Some(plan.image.clone()),
            cmd: Some(command.cmd),
            entrypoint: command.entrypoint,
            env: Some(prepare::env_list(&plan.environment)),
            working_dir: plan.working_directory.clone(),
            user: server.container_user.clone(),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            host_config: Some(host_config),
            ..Default::default()
        };

        let response = docker
            .create_container(None::<CreateContainerOptions>, config)
            .await
            .map_err(map_error)?;
        for warning in &response.warnings {
            warn!(container_id = %response.id, warning = %warning, "Container created with warning");
        }
        Ok(response.id)
    }

    async fn launch_service(
        &self,
        server: &ExecutionServer,
        docker: &Docker,
        plan: &LaunchPlan,
        ports: Vec<(String, String)>,
        command: CommandSpec,
    ) -> Result<String> {
        let endpoint_ports = ports
            .iter()
            .map(|(container, host)| {
                Ok(EndpointPortConfig {
                    protocol: Some(EndpointPortConfigProtocolEnum::TCP),
                    target_port: Some(prepare::parse_port(container)?),
                    published_port: Some(prepare::parse_port(host)?),
                    ..Default::default()
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let mut mounts: Vec<Mount> = plan
            .mounts
            .iter()
            .map(|m| Mount {
                source: Some(prepare::bind_source(server, m)),
                target: Some(m.container_path.clone()),
                typ: Some(MountTypeEnum::BIND),
                read_only: Some(!m.writable),
                ..Default::default()
            })
            .collect();
        mounts.push(Mount {
            source: Some(CONTROL_SOCKET.to_string()),
            target: Some(CONTROL_SOCKET.to_string()),
            typ: Some(MountTypeEnum::BIND),
            read_only: Some(false),
            ..Default::default()
        });

        // Services have no separate entrypoint: `command` replaces it, `args` follow it.
        let (service_command, args) = match command.entrypoint {
            Some(_) => (Some(command.cmd), None),
            None => (None, Some(command.cmd)),
        };

        let constraints: Vec<String> = server
            .swarm_constraints
            .iter()
            .chain(plan.placement_constraints.iter())
            .cloned()
            .collect();

        let spec = ServiceSpec {
            name: Some(Uuid::new_v4().to_string()),
            task_template: Some(TaskSpec {
                container_spec: Some(TaskSpecContainerSpec {
                    image: Some(plan.image.clone()),
                    command: service_command,
                    args,
                    env: Some(prepare::env_list(&plan.environment)),
                    dir: plan.working_directory.clone(),
                    user: server.container_user.clone(),
                    mounts: Some(mounts),
                    ..Default::default()
                }),
                resources: Some(TaskSpecResources {
                    reservations: Some(ResourceObject {
                        memory_bytes: Some(prepare::megabytes_to_bytes(plan.reserve_memory_mb)?),
                        ..Default::default()
                    }),
                    limits: Some(Limit {
                        memory_bytes: Some(prepare::megabytes_to_bytes(plan.limit_memory_mb)?),
                        nano_cpus: Some(prepare::cores_to_nano_cpus(plan.limit_cpu)?),
                        ..Default::default()
                    }),
                }),
                restart_policy: Some(TaskSpecRestartPolicy {
                    condition: Some(TaskSpecRestartPolicyConditionEnum::NONE),
                    ..Default::default()
                }),
                placement: Some(TaskSpecPlacement {
                    constraints: Some(constraints),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            mode: Some(ServiceSpecMode {
                replicated: Some(ServiceSpecModeReplicated { replicas: Some(0) }),
                ..Default::default()
            }),
            endpoint_spec: Some(EndpointSpec {
                ports: Some(endpoint_ports),
                ..Default::default()
            }),
            ..Default::default()
        };

        let response = docker.create_service(spec, None).await.map_err(map_error)?;
        response
            .id
            .ok_or_else(|| BackendError::Unavailable("service created without an id".to_string()))
    }

    async fn container_exit_code(&self, docker: &Docker, container_id: &str) -> Option<i64> {
        match docker.inspect_container(container_id, None::<InspectContainerOptions>).await {
            Ok(inspect) => inspect.state.and_then(|s| s.exit_code),
            Err(e) => {
                debug!(container_id = %container_id, error = %e, "Could not inspect task container");
                None
            }
        }
    }
}

#[async_trait]
impl ExecutionBackend for DockerBackend {
    fn backend_type(&self) -> &'static str {
        "docker"
    }

    async fn ping(&self) -> bool {
        match self.client().await {
            Ok((_, docker)) => docker.ping().await.is_ok(),
            Err(_) => false,
        }
    }

    async fn launch(&self, plan: &LaunchPlan, acting_user: &str) -> Result<Launched> {
        self.settings.current()?;
        let ports = prepare::validate_ports(&plan.ports)?;
        prepare::validate_resources(plan)?;
        let command = prepare::command_for(plan)?;
        prepare::prepare_mounts(&plan.mounts).await?;

        let (server, docker) = self.client().await?;
        let mode = server.execution_mode();
        let runtime_id = match mode {
            ExecutionMode::Container => {
                self.launch_container(&server, &docker, plan, ports, command)
                    .await?
            }
            ExecutionMode::Service => {
                self.launch_service(&server, &docker, plan, ports, command)
                    .await?
            }
        };

        info!(
            mode = mode.as_str(),
            runtime_id = %runtime_id,
            image = %plan.image,
            user = %acting_user,
            "Workload created"
        );
        Ok(Launched { mode, runtime_id })
    }

    async fn start(&self, workload: &Workload) -> Result<()> {
        let id = runtime_id(workload)?;
        let (_, docker) = self.client().await?;
        match workload.mode {
            ExecutionMode::Container => docker
                .start_container(id, None::<StartContainerOptions>)
                .await
                .map_err(map_error),
            ExecutionMode::Service => {
                let service = docker
                    .inspect_service(id, None::<InspectServiceOptions>)
                    .await
                    .map_err(map_error)?;
                let version = service
                    .version
                    .and_then(|v| v.index)
                    .and_then(|index| i32::try_from(index).ok())
                    .ok_or_else(|| BackendError::Unavailable(format!("service {} has no version", id)))?;
                let mut spec = service
                    .spec
                    .ok_or_else(|| BackendError::NotFound(format!("service {} has no spec", id)))?;
                spec.mode = Some(ServiceSpecMode {
                    replicated: Some(ServiceSpecModeReplicated { replicas: Some(1) }),
                    ..Default::default()
                });
                docker
                    .update_service(
                        id,
                        spec,
                        UpdateServiceOptionsBuilder::new().version(version).build(),
                        None,
                    )
                    .await
                    .map_err(map_error)?;
                Ok(())
            }
        }
    }

    async fn status(&self, workload: &Workload) -> Result<RuntimeStatus> {
        match workload.mode {
            ExecutionMode::Container => {
                let id = runtime_id(workload)?;
                let (_, docker) = self.client().await?;
                let inspect = docker.inspect_container(id, None::<InspectContainerOptions>).await.map_err(map_error)?;
                let state = inspect.state.unwrap_or_default();
                Ok(RuntimeStatus {
                    state: state
                        .status
                        .as_ref()
                        .and_then(wire_string)
                        .unwrap_or_default(),
                    exit_code: state.exit_code,
                })
            }
            ExecutionMode::Service => {
                let task = self.resolve_task_for_service(workload).await?;
                Ok(match task {
                    Some(task) => RuntimeStatus {
                        state: task.state,
                        exit_code: task.exit_code,
                    },
                    None => RuntimeStatus {
                        state: "pending".to_string(),
                        exit_code: None,
                    },
                })
            }
        }
    }

    async fn logs(&self, workload: &Workload, stream: LogStream) -> Result<Option<String>> {
        // Service logs are read from the task's container.
        let Some(container_id) = workload.container_id.as_deref() else {
            return Ok(None);
        };
        let (_, docker) = self.client().await?;

        let options = LogsOptionsBuilder::new()
            .stdout(stream == LogStream::Stdout)
            .stderr(stream == LogStream::Stderr)
            .tail("all")
            .build();
        let mut chunks = Box::pin(docker.logs(container_id, Some(options)));
        let mut out = String::new();
        while let Some(chunk) = chunks.try_next().await.map_err(map_error)? {
            out.push_str(&String::from_utf8_lossy(&chunk.into_bytes()));
        }
        Ok(if out.is_empty() { None } else { Some(out) })
    }

    async fn container_events(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<ContainerEvent>> {
        let (_, docker) = self.client().await?;
        // Whole seconds; the next window starts at this `until` again and
        // repeated events are dropped as duplicates.
        let options = EventsOptionsBuilder::new()
            .since(&since.timestamp().to_string())
            .until(&until.timestamp().to_string())
            .filters(&HashMap::from([("type", vec!["container"])]))
            .build();
        let messages: Vec<EventMessage> = docker
            .events(Some(options))
            .try_collect()
            .await
            .map_err(map_error)?;
        Ok(messages.into_iter().filter_map(event_from_bollard).collect())
    }

    async fn kill(&self, workload: &Workload) -> Result<()> {
        let id = runtime_id(workload)?;
        let (_, docker) = self.client().await?;
        match workload.mode {
            ExecutionMode::Container => docker
                .kill_container(id, None::<KillContainerOptions>)
                .await
                .map_err(map_error),
            ExecutionMode::Service => docker.delete_service(id).await.map_err(map_error),
        }
    }

    async fn remove(&self, workload: &Workload) -> Result<()> {
        let (server, docker) = self.client().await?;
        if !server.auto_cleanup {
            debug!(workload_id = workload.id, "Auto-cleanup disabled, leaving workload in place");
            return Ok(());
        }
        let id = runtime_id(workload)?;
        match workload.mode {
            ExecutionMode::Container => docker
                .remove_container(
                    id,
                    Some(RemoveContainerOptionsBuilder::new().force(true).build()),
                )
                .await
                .map_err(map_error),
            ExecutionMode::Service => docker.delete_service(id).await.map_err(map_error),
        }
    }

    async fn resolve_task_for_service(&self, workload: &Workload) -> Result<Option<Task>> {
        let service_id = workload.service_id.as_deref().ok_or_else(|| {
            BackendError::InvalidRequest(format!("workload {} has no service id", workload.id))
        })?;
        let (_, docker) = self.client().await?;

        let raw = match workload.task_id.as_deref() {
            Some(task_id) => {
                let tasks = docker
                    .list_tasks(Some(
                        ListTasksOptionsBuilder::new()
                            .filters(&HashMap::from([("id", vec![task_id])]))
                            .build(),
                    ))
                    .await
                    .map_err(map_error)?;
                if tasks.is_empty() {
                    // Surfaces NotFound when the service itself is gone.
                    docker
                        .inspect_service(service_id, None::<InspectServiceOptions>)
                        .await
                        .map_err(map_error)?;
                }
                tasks.into_iter().next()
            }
            None => {
                let service = docker
                    .inspect_service(service_id, None::<InspectServiceOptions>)
                    .await
                    .map_err(map_error)?;
                let name = service.spec.and_then(|s| s.name).ok_or_else(|| {
                    BackendError::NotFound(format!("service {} has no name", service_id))
                })?;
                let tasks = docker
                    .list_tasks(Some(
                        ListTasksOptionsBuilder::new()
                            .filters(&HashMap::from([("service", vec![name.as_str()])]))
                            .build(),
                    ))
                    .await
                    .map_err(map_error)?;
                pick_single_task(service_id, &name, tasks)?
            }
        };

        let Some(raw) = raw else {
            return Ok(None);
        };

        let mut task = task_from_bollard(service_id, raw);
        if task.is_exited() && task.exit_code.is_none() {
            if let Some(container_id) = task.container_id.as_deref() {
                task.exit_code = self.container_exit_code(&docker, container_id).await;
            }
            if task.exit_code.is_none() {
                debug!(
                    service_id = %service_id,
                    state = %task.state,
                    "Exited task reported no exit code"
                );
            }
        }
        Ok(Some(task.classify()))
    }
}

fn runtime_id(workload: &Workload) -> Result<&str> {
    workload.runtime_id().ok_or_else(|| {
        BackendError::InvalidRequest(format!(
            "workload {} has no {} id",
            workload.id,
            workload.mode.as_str()
        ))
    })
}

fn connect(server: &ExecutionServer) -> Result<Docker> {
    let host = server.host.as_str();
    let docker = if let Some(path) = host.strip_prefix("unix://") {
        Docker::connect_with_unix(path, TIMEOUT_SECS, API_DEFAULT_VERSION)
    } else if let Some(cert_path) = &server.cert_path {
        Docker::connect_with_ssl(
            host,
            &cert_path.join("key.pem"),
            &cert_path.join("cert.pem"),
            &cert_path.join("ca.pem"),
            TIMEOUT_SECS,
            API_DEFAULT_VERSION,
        )
    } else {
        Docker::connect_with_http(host, TIMEOUT_SECS, API_DEFAULT_VERSION)
    };
    docker.map_err(map_error)
}

fn map_error(e: bollard::errors::Error) -> BackendError {
    match e {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message,
        } => BackendError::NotFound(message),
        other => BackendError::Unavailable(other.to_string()),
    }
}

/// String form of a serde-serialized API value (enum states, timestamps).
fn wire_string<T: Serialize>(value: &T) -> Option<String> {
    match serde_json::to_value(value).ok()? {
        serde_json::Value::String(s) if !s.is_empty() => Some(s),
        _ => None,
    }
}

fn parse_timestamp(value: String) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

fn task_from_bollard(service_id: &str, raw: bollard::models::Task) -> Task {
    let status = raw.status.unwrap_or_default();
    let state = status
        .state
        .as_ref()
        .and_then(wire_string)
        .unwrap_or_default();
    let status_time = status
        .timestamp
        .as_ref()
        .and_then(wire_string)
        .and_then(parse_timestamp);
    let container_id = status
        .container_status
        .as_ref()
        .and_then(|c| c.container_id.clone());
    let exit_code = status.container_status.as_ref().and_then(|c| c.exit_code);

    Task {
        service_id: service_id.to_string(),
        task_id: raw.id,
        node_id: raw.node_id,
        state,
        desired_state: raw.desired_state.as_ref().and_then(wire_string),
        container_id,
        exit_code,
        node_error: false,
        message: status.message,
        err: status.err,
        status_time,
    }
}

fn event_from_bollard(message: EventMessage) -> Option<ContainerEvent> {
    let actor = message.actor?;
    Some(ContainerEvent {
        status: message.action?,
        container_id: actor.id?,
        time: message.time.unwrap_or_default(),
        time_nano: message.time_nano,
        attributes: actor.attributes.unwrap_or_default().into_iter().collect(),
    })
}
