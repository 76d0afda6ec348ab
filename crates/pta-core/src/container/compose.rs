// Copyright (C) 2025 pwnthemall contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Compose project loading and planning.
//!
//! A compose file is read from the challenge's build context and turned into
//! a [`ComposePlan`]: every service attached to the team network, build
//! contexts resolved and tagged, every published port rewritten to a freshly
//! allocated host port, resource caps and ownership labels applied. The
//! runtime then only has to execute the plan.

use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path, PathBuf};

use serde::Deserialize;

use super::{PROJECT_LABEL, RuntimeError, SERVICE_LABEL, TEAM_LABEL};

/// File names tried, in order.
pub const COMPOSE_FILE_NAMES: [&str; 4] = [
    "docker-compose.yml",
    "docker-compose.yaml",
    "compose.yml",
    "compose.yaml",
];

/// The subset of the compose specification instances use.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ComposeFile {
    /// Services by name.
    #[serde(default)]
    pub services: BTreeMap<String, ComposeService>,
}

/// One service from the compose file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ComposeService {
    /// Image reference.
    pub image: Option<String>,
    /// Build context.
    pub build: Option<BuildSpec>,
    /// Published ports.
    #[serde(default)]
    pub ports: Vec<PortEntry>,
    /// Environment variables.
    pub environment: Option<Environment>,
    /// Command override.
    pub command: Option<CommandSpec>,
    /// Entrypoint override.
    pub entrypoint: Option<CommandSpec>,
    /// Working directory.
    pub working_dir: Option<String>,
    /// User to run as.
    pub user: Option<String>,
}

/// `build:` in short or long form.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum BuildSpec {
    /// Context directory only.
    Context(String),
    /// Context plus Dockerfile.
    Detailed {
        /// Context directory.
        context: Option<String>,
        /// Dockerfile path.
        dockerfile: Option<String>,
    },
}

/// `ports:` entry in any accepted syntax.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PortEntry {
    /// Bare container port.
    Number(u16),
    /// `host:container/proto` string.
    Short(String),
    /// Long syntax.
    Long {
        /// Container port.
        target: u16,
        /// Transport protocol.
        protocol: Option<String>,
    },
}

/// `environment:` as a mapping or a list.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Environment {
    /// Mapping syntax.
    Map(BTreeMap<String, Option<serde_yaml::Value>>),
    /// `KEY=value` list.
    List(Vec<String>),
}

/// `command:` or `entrypoint:` value.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CommandSpec {
    /// Shell string.
    Shell(String),
    /// Exec array.
    Exec(Vec<String>),
}

impl PortEntry {
    /// Container-side TCP port of this entry.
    pub fn target(&self) -> Result<i32, RuntimeError> {
        match self {
            PortEntry::Number(p) => Ok(i32::from(*p)),
            PortEntry::Long { target, protocol } => {
                if protocol.as_deref().is_some_and(|p| p != "tcp") {
                    return Err(RuntimeError::Compose(format!(
                        "only tcp ports are supported (port {})",
                        target
                    )));
                }
                Ok(i32::from(*target))
            }
            PortEntry::Short(s) => {
                let (mapping, protocol) = match s.split_once('/') {
                    Some((m, p)) => (m, p),
                    None => (s.as_str(), "tcp"),
                };
                if protocol != "tcp" {
                    return Err(RuntimeError::Compose(format!(
                        "only tcp ports are supported ({})",
                        s
                    )));
                }
                // HOST_IP:HOST:CONTAINER, HOST:CONTAINER or CONTAINER
                let container = mapping.rsplit(':').next().unwrap_or(mapping);
                container
                    .trim()
                    .parse::<u16>()
                    .map(i32::from)
                    .map_err(|_| RuntimeError::Compose(format!("unsupported port entry '{}'", s)))
            }
        }
    }
}

impl Environment {
    fn to_vars(&self) -> Vec<String> {
        match self {
            Environment::List(items) => items.clone(),
            Environment::Map(map) => map
                .iter()
                .filter_map(|(k, v)| {
                    let value = match v.as_ref()? {
                        serde_yaml::Value::String(s) => s.clone(),
                        serde_yaml::Value::Number(n) => n.to_string(),
                        serde_yaml::Value::Bool(b) => b.to_string(),
                        _ => return None,
                    };
                    Some(format!("{}={}", k, value))
                })
                .collect(),
        }
    }
}

impl CommandSpec {
    fn to_argv(&self) -> Vec<String> {
        match self {
            CommandSpec::Shell(s) => s.split_whitespace().map(str::to_string).collect(),
            CommandSpec::Exec(v) => v.clone(),
        }
    }
}

impl ComposeFile {
    /// Parse compose YAML.
    pub fn parse(yaml: &str) -> Result<Self, RuntimeError> {
        let file: ComposeFile = serde_yaml::from_str(yaml)
            .map_err(|e| RuntimeError::Compose(format!("invalid compose file: {}", e)))?;
        if file.services.is_empty() {
            return Err(RuntimeError::Compose("compose file has no services".into()));
        }
        Ok(file)
    }

    /// Load the first compose file found in `dir`.
    pub async fn load(dir: &Path) -> Result<Self, RuntimeError> {
        for name in COMPOSE_FILE_NAMES {
            let path = dir.join(name);
            if tokio::fs::try_exists(&path).await? {
                let yaml = tokio::fs::read_to_string(&path).await?;
                return Self::parse(&yaml);
            }
        }
        Err(RuntimeError::Compose("no compose file in challenge context".into()))
    }

    /// Number of host ports the project publishes.
    pub fn port_count(&self) -> usize {
        self.services.values().map(|s| s.ports.len()).sum()
    }
}

/// Inputs for planning a project.
#[derive(Debug, Clone)]
pub struct PlanContext<'a> {
    /// Project name.
    pub project: &'a str,
    /// Challenge slug.
    pub slug: &'a str,
    /// Owning team.
    pub team_id: i32,
    /// Project network name.
    pub network: &'a str,
    /// Prefix for built image tags.
    pub image_prefix: &'a str,
    /// Memory cap per container.
    pub memory_bytes: i64,
    /// CPU cap per container.
    pub nano_cpus: i64,
    /// OCI runtime.
    pub runtime: &'a str,
    /// Downloaded challenge context.
    pub context_dir: &'a Path,
}

/// A build the runtime must perform before starting the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildContext {
    /// Context directory, relative to the project root.
    pub dir: PathBuf,
    /// Dockerfile path inside the context.
    pub dockerfile: String,
}

/// A service resolved against one team.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedService {
    /// Service name.
    pub service: String,
    /// Per-team container name.
    pub container_name: String,
    /// Image reference.
    pub image: String,
    /// Build context.
    pub build: Option<BuildContext>,
    /// `(container_port, host_port)` pairs.
    pub ports: Vec<(i32, i32)>,
    /// Environment variables as `KEY=value`.
    pub env: Vec<String>,
    /// Command override.
    pub command: Option<Vec<String>>,
    /// Entrypoint override.
    pub entrypoint: Option<Vec<String>>,
    /// Working directory.
    pub working_dir: Option<String>,
    /// User to run as.
    pub user: Option<String>,
    /// Labels attached to the container.
    pub labels: HashMap<String, String>,
}

/// A fully resolved project, ready for `compose_up`.
#[derive(Debug, Clone, PartialEq)]
pub struct ComposePlan {
    /// Project name.
    pub project: String,
    /// Project network name.
    pub network: String,
    /// Owning team.
    pub team_id: i32,
    /// Memory cap per container.
    pub memory_bytes: i64,
    /// CPU cap per container.
    pub nano_cpus: i64,
    /// OCI runtime.
    pub runtime: String,
    /// Services in start order.
    pub services: Vec<PlannedService>,
}

impl ComposePlan {
    /// All published host ports, in service order.
    pub fn host_ports(&self) -> Vec<i32> {
        self.services
            .iter()
            .flat_map(|s| s.ports.iter().map(|(_, host)| *host))
            .collect()
    }

    /// Build a plan from a compose file, consuming `host_ports` in order.
    pub fn build(
        file: &ComposeFile,
        ctx: &PlanContext<'_>,
        host_ports: &[i32],
    ) -> Result<Self, RuntimeError> {
        if host_ports.len() < file.port_count() {
            return Err(RuntimeError::PortBindFailed(format!(
                "{} host ports allocated, {} needed",
                host_ports.len(),
                file.port_count()
            )));
        }

        let mut next_port = host_ports.iter().copied();
        let mut services = Vec::with_capacity(file.services.len());

        for (name, svc) in &file.services {
            let build = match &svc.build {
                Some(spec) => Some(resolve_build(ctx.context_dir, spec)?),
                None => None,
            };
            let image = match (&build, &svc.image) {
                (Some(_), _) => format!("{}{}-{}", ctx.image_prefix, ctx.slug, name),
                (None, Some(image)) => image.clone(),
                (None, None) => {
                    return Err(RuntimeError::Compose(format!(
                        "service '{}' has neither image nor build",
                        name
                    )));
                }
            };

            let mut ports = Vec::with_capacity(svc.ports.len());
            for entry in &svc.ports {
                let host = next_port
                    .next()
                    .ok_or_else(|| RuntimeError::PortBindFailed("ran out of host ports".into()))?;
                ports.push((entry.target()?, host));
            }

            let mut labels = HashMap::new();
            labels.insert(PROJECT_LABEL.to_string(), ctx.project.to_string());
            labels.insert(SERVICE_LABEL.to_string(), name.clone());
            labels.insert(TEAM_LABEL.to_string(), ctx.team_id.to_string());

            services.push(PlannedService {
                service: name.clone(),
                container_name: format!("{}-{}-1", ctx.project, name),
                image,
                build,
                ports,
                env: svc.environment.as_ref().map(Environment::to_vars).unwrap_or_default(),
                command: svc.command.as_ref().map(CommandSpec::to_argv),
                entrypoint: svc.entrypoint.as_ref().map(CommandSpec::to_argv),
                working_dir: svc.working_dir.clone(),
                user: svc.user.clone(),
                labels,
            });
        }

        Ok(Self {
            project: ctx.project.to_string(),
            network: ctx.network.to_string(),
            team_id: ctx.team_id,
            memory_bytes: ctx.memory_bytes,
            nano_cpus: ctx.nano_cpus,
            runtime: ctx.runtime.to_string(),
            services,
        })
    }
}

/// Compose project name for a team member's instance.
pub fn project_name(slug: &str, team_id: i32, user_id: i32) -> String {
    format!("{}_{}_{}", slug, team_id, user_id)
}

fn resolve_build(root: &Path, spec: &BuildSpec) -> Result<BuildContext, RuntimeError> {
    let (context, dockerfile) = match spec {
        BuildSpec::Context(c) => (c.as_str(), None),
        BuildSpec::Detailed { context, dockerfile } => {
            (context.as_deref().unwrap_or("."), dockerfile.as_deref())
        }
    };

    let relative = Path::new(context);
    let escapes = relative
        .components()
        .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)));
    if escapes {
        return Err(RuntimeError::Compose(format!(
            "build context '{}' leaves the challenge directory",
            context
        )));
    }

    Ok(BuildContext {
        dir: root.join(relative),
        dockerfile: dockerfile.unwrap_or("Dockerfile").to_string(),
    })
}
