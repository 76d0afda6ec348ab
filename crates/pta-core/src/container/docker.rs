// Copyright (C) 2025 pwnthemall contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Docker daemon runtime.
//!
//! Drives the daemon through bollard. The client is created lazily and
//! dropped whenever a call fails at the transport level; the next call
//! reconnects. Every operation is retried once after a reconnect before
//! `Unavailable` is surfaced. `ssh://` daemons are reached through a
//! forwarded socket that is reopened when the ssh process dies.

use std::collections::HashMap;
use std::future::Future;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogOutput, NetworkingConfig,
    RemoveContainerOptions, StartContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::{BuildImageOptions, CreateImageOptions};
use bollard::models::{
    EndpointSettings, HostConfig, Ipam, IpamConfig, RestartPolicy, RestartPolicyNameEnum,
};
use bollard::network::{CreateNetworkOptions, ListNetworksOptions};
use bollard::{API_DEFAULT_VERSION, Docker};
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::compose::{ComposePlan, PlannedService};
use super::ports::{exposed_ports, port_bindings, team_subnet};
use super::ssh::{SshTarget, SshTunnel};
use super::{
    ContainerRuntime, ContainerSpec, ExecOutput, PROJECT_LABEL, Result, RuntimeError,
    STOP_TIMEOUT_SECS, build_context_tar_async, team_network_name,
};

/// Seconds bollard waits on a single request. Builds can take a while.
const CLIENT_TIMEOUT_SECS: u64 = 600;

/// Where the daemon lives, parsed from the configured URL.
#[derive(Debug, Clone, PartialEq)]
pub enum DaemonAddress {
    /// Platform defaults (`DOCKER_HOST` or the local socket).
    LocalDefaults,
    /// Local unix socket.
    Socket(String),
    /// Plain HTTP endpoint (`tcp://` or `http://`).
    Http(String),
    /// Remote daemon reached through an ssh tunnel.
    Ssh(SshTarget),
}

impl DaemonAddress {
    pub fn parse(url: &str) -> Result<Self> {
        let url = url.trim();
        if url.is_empty() {
            Ok(Self::LocalDefaults)
        } else if let Some(path) = url.strip_prefix("unix://") {
            Ok(Self::Socket(path.to_string()))
        } else if url.starts_with("tcp://") || url.starts_with("http://") {
            Ok(Self::Http(url.to_string()))
        } else if url.starts_with("ssh://") {
            Ok(Self::Ssh(SshTarget::parse(url)?))
        } else {
            Err(RuntimeError::Unavailable(format!(
                "unsupported daemon address '{}'",
                url
            )))
        }
    }
}

struct Connection {
    docker: Docker,
    // Kept alive for as long as the client talks through it.
    tunnel: Option<SshTunnel>,
}

/// Runtime backed by a Docker-compatible daemon.
pub struct DockerRuntime {
    url: String,
    client: Mutex<Option<Connection>>,
}

impl DockerRuntime {
    /// Create a runtime for `url` (`unix://`, `tcp://`, `http://`, `ssh://` or
    /// empty for the local defaults). Nothing is dialled until the first call.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: Mutex::new(None),
        }
    }

    async fn connect(&self) -> Result<Connection> {
        let unavailable = |e: BollardError| RuntimeError::Unavailable(e.to_string());
        match DaemonAddress::parse(&self.url)? {
            DaemonAddress::LocalDefaults => Ok(Connection {
                docker: Docker::connect_with_local_defaults().map_err(unavailable)?,
                tunnel: None,
            }),
            DaemonAddress::Socket(path) => Ok(Connection {
                docker: Docker::connect_with_socket(&path, CLIENT_TIMEOUT_SECS, API_DEFAULT_VERSION)
                    .map_err(unavailable)?,
                tunnel: None,
            }),
            DaemonAddress::Http(url) => Ok(Connection {
                docker: Docker::connect_with_http(&url, CLIENT_TIMEOUT_SECS, API_DEFAULT_VERSION)
                    .map_err(unavailable)?,
                tunnel: None,
            }),
            DaemonAddress::Ssh(target) => {
                let tunnel = SshTunnel::open(&target).await?;
                let socket = tunnel.socket_path().to_string_lossy().into_owned();
                let docker =
                    Docker::connect_with_socket(&socket, CLIENT_TIMEOUT_SECS, API_DEFAULT_VERSION)
                        .map_err(unavailable)?;
                Ok(Connection {
                    docker,
                    tunnel: Some(tunnel),
                })
            }
        }
    }

    /// Cached client, or a fresh one that answered a ping.
    async fn client(&self) -> Result<Docker> {
        let mut guard = self.client.lock().await;
        if let Some(conn) = guard.as_mut() {
            if conn.tunnel.as_mut().is_none_or(SshTunnel::is_alive) {
                return Ok(conn.docker.clone());
            }
            warn!(url = %self.url, "ssh tunnel exited, reconnecting");
            *guard = None;
        }

        let conn = self.connect().await?;
        conn.docker
            .ping()
            .await
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))?;
        info!(url = %self.url, "Connected to container daemon");
        let docker = conn.docker.clone();
        *guard = Some(conn);
        Ok(docker)
    }

    async fn invalidate(&self) {
        *self.client.lock().await = None;
    }

    /// Run `op`, reconnecting and retrying once on transport failure.
    async fn call<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn(Docker) -> Fut,
        Fut: Future<Output = std::result::Result<T, BollardError>>,
    {
        let docker = self.client().await?;
        match op(docker).await {
            Ok(v) => Ok(v),
            Err(e) if is_transport_error(&e) => {
                warn!(error = %e, "Container daemon call failed, reconnecting");
                self.invalidate().await;
                let docker = self.client().await?;
                op(docker).await.map_err(|e| {
                    if is_transport_error(&e) {
                        RuntimeError::Unavailable(e.to_string())
                    } else {
                        map_error(e)
                    }
                })
            }
            Err(e) => Err(map_error(e)),
        }
    }

    async fn build_with_dockerfile(&self, tag: &str, dockerfile: &str, context: Bytes) -> Result<()> {
        info!(tag = %tag, "Building image");
        let docker = self.client().await?;
        let options = BuildImageOptions {
            t: tag.to_string(),
            dockerfile: dockerfile.to_string(),
            rm: true,
            forcerm: true,
            ..Default::default()
        };

        let mut stream = docker.build_image(options, None, Some(context));
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(info) => {
                    if let Some(line) = info.stream {
                        debug!(tag = %tag, "{}", line.trim_end());
                    }
                    if let Some(error) = info.error {
                        return Err(RuntimeError::BuildFailed(error));
                    }
                }
                Err(e) if is_transport_error(&e) => {
                    self.invalidate().await;
                    return Err(RuntimeError::Unavailable(e.to_string()));
                }
                Err(e) => return Err(RuntimeError::BuildFailed(e.to_string())),
            }
        }

        info!(tag = %tag, "Image built");
        Ok(())
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        info!(image = %image, "Pulling image");
        let docker = self.client().await?;
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut stream = docker.create_image(Some(options), None, None);
        while let Some(frame) = stream.next().await {
            frame.map_err(map_error)?;
        }
        Ok(())
    }

    async fn create_and_start(&self, name: &str, config: Config<String>) -> Result<()> {
        self.call(|d| {
            let config = config.clone();
            async move {
                d.create_container(
                    Some(CreateContainerOptions {
                        name,
                        platform: None,
                    }),
                    config,
                )
                .await
            }
        })
        .await?;

        let started = self
            .call(|d| async move { d.start_container(name, None::<StartContainerOptions<String>>).await })
            .await;

        if let Err(e) = started {
            // Leave nothing behind when the start fails (usually a port clash)
            if let Err(cleanup) = self.stop_container(name).await {
                debug!(container = %name, error = %cleanup, "Cleanup after failed start");
            }
            return Err(e);
        }
        Ok(())
    }

    fn service_config(plan: &ComposePlan, svc: &PlannedService) -> Config<String> {
        let mut endpoints = HashMap::new();
        endpoints.insert(
            plan.network.clone(),
            EndpointSettings {
                aliases: Some(vec![svc.service.clone()]),
                ..Default::default()
            },
        );

        Config {
            image: Some(svc.image.clone()),
            env: Some(svc.env.clone()),
            cmd: svc.command.clone(),
            entrypoint: svc.entrypoint.clone(),
            working_dir: svc.working_dir.clone(),
            user: svc.user.clone(),
            labels: Some(svc.labels.clone()),
            exposed_ports: Some(exposed_ports(&svc.ports)),
            stop_timeout: Some(STOP_TIMEOUT_SECS),
            host_config: Some(HostConfig {
                port_bindings: Some(port_bindings(&svc.ports)),
                memory: Some(plan.memory_bytes),
                nano_cpus: Some(plan.nano_cpus),
                network_mode: Some(plan.network.clone()),
                runtime: Some(plan.runtime.clone()),
                restart_policy: Some(RestartPolicy {
                    name: Some(RestartPolicyNameEnum::NO),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            networking_config: Some(NetworkingConfig {
                endpoints_config: endpoints,
            }),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn image_exists(&self, tag: &str) -> Result<bool> {
        match self.call(|d| async move { d.inspect_image(tag).await }).await {
            Ok(_) => Ok(true),
            Err(RuntimeError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn build_image(&self, tag: &str, context_tar: Bytes) -> Result<()> {
        self.build_with_dockerfile(tag, "Dockerfile", context_tar).await
    }

    async fn container_exists(&self, name: &str) -> Result<bool> {
        match self
            .call(|d| async move { d.inspect_container(name, None).await })
            .await
        {
            Ok(_) => Ok(true),
            Err(RuntimeError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn run_container(&self, spec: &ContainerSpec) -> Result<String> {
        let config = Config {
            image: Some(spec.image.clone()),
            labels: Some(spec.labels.clone()),
            exposed_ports: Some(exposed_ports(&spec.ports)),
            stop_timeout: Some(STOP_TIMEOUT_SECS),
            host_config: Some(HostConfig {
                port_bindings: Some(port_bindings(&spec.ports)),
                memory: Some(spec.memory_bytes),
                nano_cpus: Some(spec.nano_cpus),
                network_mode: Some(spec.network.clone()),
                runtime: Some(spec.runtime.clone()),
                auto_remove: Some(true),
                restart_policy: Some(RestartPolicy {
                    name: Some(RestartPolicyNameEnum::NO),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        };

        self.create_and_start(&spec.name, config).await?;
        info!(container = %spec.name, image = %spec.image, "Container started");
        Ok(spec.name.clone())
    }

    async fn stop_container(&self, name: &str) -> Result<()> {
        self.call(|d| async move {
            d.remove_container(
                name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        })
        .await
    }

    async fn ensure_network(&self, team_id: i32) -> Result<String> {
        let name = team_network_name(team_id);

        let existing = self
            .call(|d| {
                let mut filters = HashMap::new();
                filters.insert("name".to_string(), vec![name.clone()]);
                async move { d.list_networks(Some(ListNetworksOptions { filters })).await }
            })
            .await?;
        // The name filter matches substrings
        if existing.iter().any(|n| n.name.as_deref() == Some(name.as_str())) {
            return Ok(name);
        }

        let (subnet, gateway) = team_subnet(team_id);
        let created = self
            .call(|d| {
                let options = CreateNetworkOptions {
                    name: name.clone(),
                    driver: "bridge".to_string(),
                    attachable: true,
                    check_duplicate: true,
                    ipam: Ipam {
                        config: Some(vec![IpamConfig {
                            subnet: Some(subnet.clone()),
                            gateway: Some(gateway.clone()),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    },
                    ..Default::default()
                };
                async move { d.create_network(options).await }
            })
            .await;

        match created {
            Ok(_) => {
                info!(network = %name, subnet = %subnet, "Created team network");
                Ok(name)
            }
            // Lost a creation race with a teammate
            Err(RuntimeError::Api(msg)) if msg.contains("already exists") => Ok(name),
            Err(e) => Err(e),
        }
    }

    async fn compose_up(&self, plan: &ComposePlan) -> Result<()> {
        for svc in &plan.services {
            match &svc.build {
                Some(build) => {
                    if !self.image_exists(&svc.image).await? {
                        let tar = build_context_tar_async(&build.dir).await?;
                        self.build_with_dockerfile(&svc.image, &build.dockerfile, tar)
                            .await?;
                    }
                }
                None => {
                    if !self.image_exists(&svc.image).await? {
                        self.pull_image(&svc.image).await?;
                    }
                }
            }
        }

        for svc in &plan.services {
            let config = Self::service_config(plan, svc);
            if let Err(e) = self.create_and_start(&svc.container_name, config).await {
                warn!(project = %plan.project, service = %svc.service, error = %e, "Compose service failed to start");
                if let Err(cleanup) = self.compose_down(&plan.project).await {
                    debug!(project = %plan.project, error = %cleanup, "Cleanup after failed compose up");
                }
                return Err(e);
            }
        }

        info!(project = %plan.project, services = plan.services.len(), "Compose project up");
        Ok(())
    }

    async fn compose_down(&self, project: &str) -> Result<()> {
        let containers = self
            .call(|d| {
                let mut filters = HashMap::new();
                filters.insert(
                    "label".to_string(),
                    vec![format!("{}={}", PROJECT_LABEL, project)],
                );
                async move {
                    d.list_containers(Some(ListContainersOptions {
                        all: true,
                        filters,
                        ..Default::default()
                    }))
                    .await
                }
            })
            .await?;

        if containers.is_empty() {
            return Err(RuntimeError::NotFound(project.to_string()));
        }

        for container in containers {
            let Some(id) = container.id else { continue };
            let removed = self
                .call(|d| {
                    let id = id.clone();
                    async move {
                        d.remove_container(
                            &id,
                            Some(RemoveContainerOptions {
                                force: true,
                                v: true,
                                ..Default::default()
                            }),
                        )
                        .await
                    }
                })
                .await;
            match removed {
                Ok(()) | Err(RuntimeError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        info!(project = %project, "Compose project down");
        Ok(())
    }

    async fn exec(&self, container: &str, cmd: &[String]) -> Result<ExecOutput> {
        let exec = self
            .call(|d| {
                let options = CreateExecOptions {
                    cmd: Some(cmd.to_vec()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                };
                async move { d.create_exec(container, options).await }
            })
            .await?;

        let docker = self.client().await?;
        let mut output = ExecOutput::default();
        if let StartExecResults::Attached { output: mut stream, .. } =
            docker.start_exec(&exec.id, None).await.map_err(map_error)?
        {
            while let Some(chunk) = stream.next().await {
                match chunk.map_err(map_error)? {
                    LogOutput::StdOut { message } => {
                        output.stdout.push_str(&String::from_utf8_lossy(&message))
                    }
                    LogOutput::StdErr { message } => {
                        output.stderr.push_str(&String::from_utf8_lossy(&message))
                    }
                    _ => {}
                }
            }
        }

        let inspect = docker.inspect_exec(&exec.id).await.map_err(map_error)?;
        output.exit_code = inspect.exit_code;
        Ok(output)
    }
}

fn is_transport_error(e: &BollardError) -> bool {
    matches!(
        e,
        BollardError::IOError { .. }
            | BollardError::HyperResponseError { .. }
            | BollardError::RequestTimeoutError
    )
}

fn map_error(e: BollardError) -> RuntimeError {
    match e {
        BollardError::DockerResponseServerError {
            status_code: 404,
            message,
        } => RuntimeError::NotFound(message),
        BollardError::DockerResponseServerError { message, .. }
            if is_port_clash(&message) =>
        {
            RuntimeError::PortBindFailed(message)
        }
        BollardError::DockerResponseServerError { message, .. } => RuntimeError::Api(message),
        other if is_transport_error(&other) => RuntimeError::Unavailable(other.to_string()),
        other => RuntimeError::Api(other.to_string()),
    }
}

fn is_port_clash(message: &str) -> bool {
    let msg = message.to_ascii_lowercase();
    msg.contains("port is already allocated") || msg.contains("address already in use")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_error_classifies_responses() {
        let not_found = map_error(BollardError::DockerResponseServerError {
            status_code: 404,
            message: "No such container: web".into(),
        });
        assert!(matches!(not_found, RuntimeError::NotFound(_)));

        let clash = map_error(BollardError::DockerResponseServerError {
            status_code: 500,
            message: "Bind for 0.0.0.0:31337 failed: port is already allocated".into(),
        });
        assert!(matches!(clash, RuntimeError::PortBindFailed(_)));

        let other = map_error(BollardError::DockerResponseServerError {
            status_code: 409,
            message: "Conflict".into(),
        });
        assert!(matches!(other, RuntimeError::Api(_)));
    }

    #[test]
    fn test_daemon_address_schemes() {
        assert_eq!(DaemonAddress::parse("").unwrap(), DaemonAddress::LocalDefaults);
        assert_eq!(
            DaemonAddress::parse("unix:///var/run/docker.sock").unwrap(),
            DaemonAddress::Socket("/var/run/docker.sock".into())
        );
        assert_eq!(
            DaemonAddress::parse("tcp://10.0.0.2:2375").unwrap(),
            DaemonAddress::Http("tcp://10.0.0.2:2375".into())
        );
        assert!(matches!(
            DaemonAddress::parse("npipe:////./pipe/docker_engine"),
            Err(RuntimeError::Unavailable(_))
        ));
    }

    #[test]
    fn test_ssh_address_is_accepted() {
        match DaemonAddress::parse("ssh://user@host").unwrap() {
            DaemonAddress::Ssh(target) => {
                assert_eq!(target.destination, "user@host");
                assert_eq!(target.remote_socket, "/var/run/docker.sock");
            }
            other => panic!("expected ssh address, got {:?}", other),
        }
        assert!(DaemonAddress::parse("ssh://").is_err());
    }

    #[tokio::test]
    async fn test_unreachable_socket_is_unavailable() {
        let runtime = DockerRuntime::new("unix:///nonexistent/docker.sock");
        let err = runtime.image_exists("pta-web").await.unwrap_err();
        assert!(matches!(err, RuntimeError::Unavailable(_)));
    }

    #[test]
    fn test_service_config_attaches_network() {
        let plan = ComposePlan {
            project: "web_1_2".into(),
            network: "team_1_network".into(),
            team_id: 1,
            memory_bytes: 1024,
            nano_cpus: 5,
            runtime: "runsc".into(),
            services: vec![],
        };
        let svc = PlannedService {
            service: "app".into(),
            container_name: "web_1_2-app-1".into(),
            image: "pta-web-app".into(),
            build: None,
            ports: vec![(80, 40000)],
            env: vec![],
            command: None,
            entrypoint: None,
            working_dir: None,
            user: None,
            labels: HashMap::new(),
        };
        let config = DockerRuntime::service_config(&plan, &svc);
        let host = config.host_config.unwrap();
        assert_eq!(host.network_mode.as_deref(), Some("team_1_network"));
        assert_eq!(host.runtime.as_deref(), Some("runsc"));
        assert_eq!(host.memory, Some(1024));
        let endpoints = config.networking_config.unwrap().endpoints_config;
        assert_eq!(
            endpoints["team_1_network"].aliases.as_deref(),
            Some(&["app".to_string()][..])
        );
    }
}
