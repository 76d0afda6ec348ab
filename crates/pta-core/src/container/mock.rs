// Copyright (C) 2025 pwnthemall contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock runtime for testing.
//!
//! Simulates a daemon without running anything. Host ports are handed out
//! from a counter so tests get stable numbers.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;

use super::compose::ComposePlan;
use super::ports::team_subnet;
use super::{ContainerRuntime, ContainerSpec, ExecOutput, Result, RuntimeError, team_network_name};

#[derive(Debug, Default)]
struct MockState {
    images: HashSet<String>,
    builds: Vec<String>,
    containers: HashMap<String, ContainerSpec>,
    networks: BTreeMap<String, String>,
    projects: HashMap<String, ComposePlan>,
    stopped: Vec<String>,
    next_port: i32,
}

/// In-memory container runtime.
#[derive(Clone)]
pub struct MockRuntime {
    state: Arc<Mutex<MockState>>,
    unavailable: Arc<AtomicBool>,
    bind_failures: Arc<AtomicUsize>,
    /// When set, every build fails with this message.
    pub build_error: Option<String>,
    /// When set, every compose up fails with this message.
    pub compose_error: Option<String>,
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRuntime {
    /// Create a healthy mock runtime.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                next_port: 40000,
                ..Default::default()
            })),
            unavailable: Arc::new(AtomicBool::new(false)),
            bind_failures: Arc::new(AtomicUsize::new(0)),
            build_error: None,
            compose_error: None,
        }
    }

    /// Create a runtime whose builds fail.
    pub fn failing_builds(message: &str) -> Self {
        Self {
            build_error: Some(message.to_string()),
            ..Self::new()
        }
    }

    /// Create a runtime whose compose projects fail to come up.
    pub fn failing_compose(message: &str) -> Self {
        Self {
            compose_error: Some(message.to_string()),
            ..Self::new()
        }
    }

    /// Toggle daemon reachability.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make the next `n` container starts fail with a port clash.
    pub fn fail_next_binds(&self, n: usize) {
        self.bind_failures.store(n, Ordering::SeqCst);
    }

    /// Pretend an image is already present.
    pub async fn add_image(&self, tag: &str) {
        self.state.lock().await.images.insert(tag.to_string());
    }

    /// Tags built so far, in order.
    pub async fn builds(&self) -> Vec<String> {
        self.state.lock().await.builds.clone()
    }

    /// Spec of a running container.
    pub async fn container(&self, name: &str) -> Option<ContainerSpec> {
        self.state.lock().await.containers.get(name).cloned()
    }

    /// Names of running containers.
    pub async fn running(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().await.containers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Whether a compose project is up.
    pub async fn has_project(&self, project: &str) -> bool {
        self.state.lock().await.projects.contains_key(project)
    }

    /// Subnet of a created network.
    pub async fn network_subnet(&self, name: &str) -> Option<String> {
        self.state.lock().await.networks.get(name).cloned()
    }

    /// Containers and projects removed so far, in order.
    pub async fn stopped(&self) -> Vec<String> {
        self.state.lock().await.stopped.clone()
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RuntimeError::Unavailable("mock daemon is down".into()));
        }
        Ok(())
    }

    fn take_bind_failure(&self) -> bool {
        self.bind_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn image_exists(&self, tag: &str) -> Result<bool> {
        self.check_available()?;
        Ok(self.state.lock().await.images.contains(tag))
    }

    async fn build_image(&self, tag: &str, context_tar: Bytes) -> Result<()> {
        self.check_available()?;
        if let Some(msg) = &self.build_error {
            return Err(RuntimeError::BuildFailed(msg.clone()));
        }
        if context_tar.is_empty() {
            return Err(RuntimeError::BuildFailed("empty build context".into()));
        }
        let mut state = self.state.lock().await;
        state.images.insert(tag.to_string());
        state.builds.push(tag.to_string());
        Ok(())
    }

    async fn container_exists(&self, name: &str) -> Result<bool> {
        self.check_available()?;
        Ok(self.state.lock().await.containers.contains_key(name))
    }

    async fn run_container(&self, spec: &ContainerSpec) -> Result<String> {
        self.check_available()?;
        if self.take_bind_failure() {
            return Err(RuntimeError::PortBindFailed(format!(
                "Bind for 0.0.0.0:{} failed: port is already allocated",
                spec.ports.first().map(|p| p.1).unwrap_or_default()
            )));
        }

        let mut state = self.state.lock().await;
        if !state.images.contains(&spec.image) {
            return Err(RuntimeError::NotFound(format!("No such image: {}", spec.image)));
        }
        if state.containers.contains_key(&spec.name) {
            return Err(RuntimeError::Api(format!(
                "Conflict. The container name \"/{}\" is already in use",
                spec.name
            )));
        }
        state.containers.insert(spec.name.clone(), spec.clone());
        Ok(spec.name.clone())
    }

    async fn stop_container(&self, name: &str) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        if state.containers.remove(name).is_none() {
            return Err(RuntimeError::NotFound(name.to_string()));
        }
        state.stopped.push(name.to_string());
        Ok(())
    }

    async fn ensure_network(&self, team_id: i32) -> Result<String> {
        self.check_available()?;
        let name = team_network_name(team_id);
        self.state
            .lock()
            .await
            .networks
            .entry(name.clone())
            .or_insert_with(|| team_subnet(team_id).0);
        Ok(name)
    }

    async fn compose_up(&self, plan: &ComposePlan) -> Result<()> {
        self.check_available()?;
        if let Some(msg) = &self.compose_error {
            return Err(RuntimeError::Compose(msg.clone()));
        }
        if self.take_bind_failure() {
            return Err(RuntimeError::PortBindFailed("port is already allocated".into()));
        }
        let mut state = self.state.lock().await;
        for svc in &plan.services {
            if svc.build.is_some() {
                state.images.insert(svc.image.clone());
                state.builds.push(svc.image.clone());
            }
        }
        state.projects.insert(plan.project.clone(), plan.clone());
        Ok(())
    }

    async fn compose_down(&self, project: &str) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        if state.projects.remove(project).is_none() {
            return Err(RuntimeError::NotFound(project.to_string()));
        }
        state.stopped.push(project.to_string());
        Ok(())
    }

    async fn exec(&self, container: &str, cmd: &[String]) -> Result<ExecOutput> {
        self.check_available()?;
        if !self.state.lock().await.containers.contains_key(container) {
            return Err(RuntimeError::NotFound(container.to_string()));
        }
        Ok(ExecOutput {
            stdout: cmd.join(" "),
            stderr: String::new(),
            exit_code: Some(0),
        })
    }

    async fn find_free_ports(&self, n: usize) -> Result<Vec<i32>> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let start = state.next_port;
        state.next_port += n as i32;
        Ok((start..start + n as i32).collect())
    }
}
