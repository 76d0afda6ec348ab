// Copyright (C) 2025 pwnthemall contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Container runtime adapter.
//!
//! A capability set over the local container daemon. The orchestrator only
//! ever talks to [`ContainerRuntime`]; [`DockerRuntime`] drives a real daemon
//! through bollard and [`MockRuntime`] keeps everything in memory for tests.
//!
//! Runtimes are pure execution backends. They never touch the database.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

pub mod compose;
pub mod docker;
pub mod mock;
pub mod ports;
pub mod ssh;

pub use compose::{ComposePlan, PlannedService};
pub use docker::{DaemonAddress, DockerRuntime};
pub use mock::MockRuntime;

/// Label carrying the compose project name.
pub const PROJECT_LABEL: &str = "com.docker.compose.project";
/// Label carrying the compose service name.
pub const SERVICE_LABEL: &str = "com.docker.compose.service";
/// Label carrying the owning team.
pub const TEAM_LABEL: &str = "pta.team";

/// Seconds the daemon waits before killing a stopping container.
pub const STOP_TIMEOUT_SECS: i64 = 60;

/// Errors from runtime operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RuntimeError {
    /// Daemon unreachable, even after a reconnect.
    #[error("Container runtime unavailable: {0}")]
    Unavailable(String),

    /// Container, project or image does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Image build reported an error frame.
    #[error("Image build failed: {0}")]
    BuildFailed(String),

    /// A host port was taken between allocation and bind.
    #[error("Port bind failed: {0}")]
    PortBindFailed(String),

    /// Compose file missing or unusable.
    #[error("Compose error: {0}")]
    Compose(String),

    /// Any other daemon error.
    #[error("Runtime API error: {0}")]
    Api(String),

    /// Local I/O failed (build context, port scouting).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Everything needed to run a single-container instance.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    /// Container name, also the runtime name reported to clients.
    pub name: String,
    /// Image tag.
    pub image: String,
    /// `(container_port, host_port)` pairs, TCP.
    pub ports: Vec<(i32, i32)>,
    /// Memory cap in bytes.
    pub memory_bytes: i64,
    /// CPU cap in nano-CPUs.
    pub nano_cpus: i64,
    /// Network to attach to.
    pub network: String,
    /// OCI runtime (`runc`, `runsc`, ...).
    pub runtime: String,
    /// Container labels.
    pub labels: HashMap<String, String>,
}

/// Captured output of an exec.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Process exit code.
    pub exit_code: Option<i64>,
}

/// Operations the orchestrator needs from a container daemon.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Whether an image with this tag is present.
    async fn image_exists(&self, tag: &str) -> Result<bool>;

    /// Build an image from a tarred build context with a root `Dockerfile`.
    async fn build_image(&self, tag: &str, context_tar: Bytes) -> Result<()>;

    /// Whether a container with this name exists (running or not).
    async fn container_exists(&self, name: &str) -> Result<bool>;

    /// Create and start a container. Returns the runtime name.
    async fn run_container(&self, spec: &ContainerSpec) -> Result<String>;

    /// Force-remove a container. `NotFound` when it is already gone.
    async fn stop_container(&self, name: &str) -> Result<()>;

    /// Make sure the team's bridge network exists and return its name.
    async fn ensure_network(&self, team_id: i32) -> Result<String>;

    /// Build, create and start every service of a planned project.
    async fn compose_up(&self, plan: &ComposePlan) -> Result<()>;

    /// Remove a project's containers and volumes. `NotFound` when nothing matched.
    async fn compose_down(&self, project: &str) -> Result<()>;

    /// Run a command in a running container and capture its output.
    async fn exec(&self, container: &str, cmd: &[String]) -> Result<ExecOutput>;

    /// Reserve `n` distinct free host ports.
    async fn find_free_ports(&self, n: usize) -> Result<Vec<i32>> {
        Ok(ports::find_free_ports(n).await?)
    }
}

/// Name of a team's network.
pub fn team_network_name(team_id: i32) -> String {
    format!("team_{}_network", team_id)
}

/// Tar a build context directory in memory.
pub fn build_context_tar(dir: &Path) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    {
        let mut builder = tar::Builder::new(&mut buf);
        builder.follow_symlinks(false);
        builder.append_dir_all(".", dir)?;
        builder.finish()?;
    }
    Ok(buf)
}

/// Tar a build context on the blocking pool.
pub async fn build_context_tar_async(dir: &Path) -> Result<Bytes> {
    let dir = dir.to_path_buf();
    let tar = tokio::task::spawn_blocking(move || build_context_tar(&dir))
        .await
        .map_err(|e| RuntimeError::Api(format!("build context task failed: {}", e)))??;
    Ok(Bytes::from(tar))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_team_network_name() {
        assert_eq!(team_network_name(7), "team_7_network");
    }

    #[test]
    fn test_build_context_tar_contains_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Dockerfile"), "FROM scratch\n").unwrap();
        std::fs::create_dir(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/app.py"), "print(1)\n").unwrap();

        let tar = build_context_tar(dir.path()).unwrap();
        let mut archive = tar::Archive::new(&tar[..]);
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();

        assert!(names.iter().any(|n| n.ends_with("Dockerfile")));
        assert!(names.iter().any(|n| n.ends_with("src/app.py")));
    }
}
