// Copyright (C) 2025 pwnthemall contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instance orchestrator.
//!
//! Starts, stops and reports per-team challenge instances. The database row
//! is the source of truth: a start inserts it under the `(team, challenge)`
//! uniqueness constraint, a stop deletes it first and only the caller whose
//! delete succeeded schedules runtime cleanup. Runtime work that can outlive
//! a request (compose bring-up, container removal, firewall pushes) runs on
//! the [`JobQueue`](crate::jobs::JobQueue).

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::broadcast::{Audience, Event, InstanceUpdate, publish};
use crate::container::compose::{self, ComposeFile, ComposePlan, PlanContext};
use crate::container::{
    ContainerRuntime, ContainerSpec, RuntimeError, TEAM_LABEL, build_context_tar_async,
};
use crate::deps::Deps;
use crate::error::{Error, Result};
use crate::firewall::{FirewallClient, FirewallRule};
use crate::jobs::{ComposeStart, Job, JobExecutor, JobQueue};
use crate::keyed::KeyedLocks;
use crate::models::{
    Challenge, ChallengeType, DockerConfig, Instance, InstanceLimits, InstanceStatus, NewInstance,
    User,
};
use crate::object_store::{Bucket, download_prefix, get_bytes};
use crate::scores;
use crate::store::InstanceInsert;

/// Substituted for `$ip` when no worker IP is configured.
pub const DEFAULT_WORKER_IP: &str = "instance-ip";

const COMPOSE_UP_TIMEOUT: Duration = Duration::from_secs(600);
const COMPOSE_FILE_LIMIT: u64 = 1024 * 1024;
const CLEANUP_CONCURRENCY: usize = 3;

/// Orchestrator settings.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Address players connect to, substituted for `$ip`.
    pub worker_ip: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            worker_ip: DEFAULT_WORKER_IP.to_string(),
        }
    }
}

/// Reply to a start request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartOutcome {
    /// Instance state.
    pub status: InstanceStatus,
    /// Container or project name.
    pub name: String,
    /// Allocated host ports.
    pub ports: Vec<i32>,
    /// Expiry time.
    pub expires_at: DateTime<Utc>,
    /// Rendered connection strings.
    #[serde(rename = "connection_info")]
    pub connection_info: Vec<String>,
}

/// Reply to a stop request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StopOutcome {
    /// Outcome code.
    pub message: &'static str,
    /// Stopped container or project.
    pub name: String,
}

/// Reply to a status request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceView {
    /// Whether the team has a live instance.
    pub has_instance: bool,
    /// Instance state, or `failed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Why there is no usable instance.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Container or project name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Allocated host ports.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ports: Option<Vec<i32>>,
    #[serde(
        rename = "connection_info",
        skip_serializing_if = "Option::is_none"
    )]
    /// Rendered connection strings.
    pub connection_info: Option<Vec<String>>,
    /// Start time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// Expiry time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl InstanceView {
    fn absent(reason: &str) -> Self {
        Self {
            has_instance: false,
            status: None,
            reason: Some(reason.to_string()),
            name: None,
            ports: None,
            connection_info: None,
            created_at: None,
            expires_at: None,
        }
    }

    fn failed(reason: String) -> Self {
        Self {
            status: Some("failed".to_string()),
            reason: Some(reason),
            ..Self::absent("")
        }
    }
}

/// Render connection strings for an instance.
///
/// `$ip` becomes `worker_ip`; `[<internal>]` becomes the host port allocated
/// for that internal port, matched by position.
pub fn render_connection_info(
    templates: &[String],
    worker_ip: &str,
    internal_ports: &[i32],
    host_ports: &[i32],
) -> Vec<String> {
    templates
        .iter()
        .map(|template| {
            let mut line = template.replace("$ip", worker_ip);
            for (internal, host) in internal_ports.iter().zip(host_ports) {
                line = line.replace(&format!("[{}]", internal), &host.to_string());
            }
            line
        })
        .collect()
}

/// Seconds left before a restart is accepted, if any.
pub fn cooldown_remaining(
    cooldown_seconds: i32,
    last_stopped_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Option<i64> {
    if cooldown_seconds <= 0 {
        return None;
    }
    let elapsed = now.signed_duration_since(last_stopped_at?).num_seconds();
    let remaining = i64::from(cooldown_seconds) - elapsed;
    (remaining > 0).then_some(remaining)
}

fn stop_job(kind: ChallengeType, name: &str) -> Job {
    match kind {
        ChallengeType::Compose => Job::StopCompose {
            project: name.to_string(),
        },
        _ => Job::StopContainer {
            name: name.to_string(),
        },
    }
}

/// Who a stop is attributed to in the broadcast.
#[derive(Debug, Clone)]
struct Actor {
    user_id: i32,
    username: String,
}

impl Actor {
    fn of(user: &User) -> Self {
        Self {
            user_id: user.id,
            username: user.username.clone(),
        }
    }
}

struct Inner {
    deps: Deps,
    jobs: JobQueue,
    firewall: FirewallClient,
    config: OrchestratorConfig,
    starts: KeyedLocks<(i32, i32)>,
}

/// Instance lifecycle service. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Create an orchestrator. Jobs it enqueues are executed by a
    /// [`JobWorker`](crate::jobs::JobWorker) running this orchestrator.
    pub fn new(
        deps: Deps,
        jobs: JobQueue,
        firewall: FirewallClient,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                deps,
                jobs,
                firewall,
                config,
                starts: KeyedLocks::new(),
            }),
        }
    }

    fn deps(&self) -> &Deps {
        &self.inner.deps
    }

    fn runtime(&self) -> &dyn ContainerRuntime {
        self.inner.deps.runtime.as_ref()
    }

    // ========================================================================
    // Start
    // ========================================================================

    /// Launch an instance of `challenge_id` for the caller's team.
    ///
    /// An existing instance for the team is returned as success. Compose
    /// challenges answer `starting` and come up in the background.
    pub async fn start(&self, user_id: i32, challenge_id: i32) -> Result<StartOutcome> {
        let store = &self.deps().store;
        let config = store.docker_config().await?;
        let user = store.user(user_id).await?.ok_or(Error::Unauthorized)?;
        let challenge = store
            .challenge(challenge_id)
            .await?
            .ok_or(Error::ChallengeNotFound)?;
        if !scores::visible_to(store.as_ref(), &user, &challenge).await? {
            return Err(Error::ChallengeNotFound);
        }
        if !challenge.challenge_type.supports_instances() {
            return Err(Error::Unsupported);
        }
        let team_id = match user.team_id {
            Some(team_id) => team_id,
            None if user.is_admin() => return Err(Error::AdminTeamRequired),
            None => return Err(Error::TeamRequired),
        };

        let _guard = self.inner.starts.lock((team_id, challenge_id)).await;
        let now = self.deps().now();

        let last_stop = store.last_stopped_at(team_id, challenge_id).await?;
        if let Some(remaining_seconds) = cooldown_remaining(config.cooldown_seconds, last_stop, now)
        {
            return Err(Error::CooldownActive { remaining_seconds });
        }

        if let Some(existing) = store.instance_for(team_id, challenge_id).await? {
            debug!(instance_id = existing.id, "Instance already exists, returning it");
            return Ok(self.outcome(&challenge, &existing));
        }

        let limits = InstanceLimits {
            per_user: config.instances_by_user,
            per_team: config.instances_by_team,
        };
        if store.count_team_instances(team_id).await? >= i64::from(limits.per_team) {
            return Err(Error::PerTeamLimit);
        }
        if store.count_user_instances(user.id).await? >= i64::from(limits.per_user) {
            return Err(Error::PerUserLimit);
        }

        match challenge.challenge_type {
            ChallengeType::Docker => {
                self.start_docker(&config, &user, team_id, &challenge, limits, now)
                    .await
            }
            ChallengeType::Compose => {
                self.start_compose(&config, &user, team_id, &challenge, limits, now)
                    .await
            }
            _ => Err(Error::Unsupported),
        }
    }

    async fn start_docker(
        &self,
        config: &DockerConfig,
        user: &User,
        team_id: i32,
        challenge: &Challenge,
        limits: InstanceLimits,
        now: DateTime<Utc>,
    ) -> Result<StartOutcome> {
        if challenge.ports.is_empty() {
            return Err(Error::NoPortsDefined);
        }

        let tag = config.image_tag(&challenge.slug);
        if !self.runtime().image_exists(&tag).await? {
            self.build_from_objects(&challenge.slug, &tag).await?;
        }

        let network = self.runtime().ensure_network(team_id).await?;
        let name = if self.runtime().container_exists(&tag).await? {
            format!("{}_{}_{}", tag, team_id, user.id)
        } else {
            tag.clone()
        };

        let mut ports = self.allocate_ports(challenge.ports.len()).await?;
        let mut spec = ContainerSpec {
            name,
            image: tag,
            ports: challenge.ports.iter().copied().zip(ports.iter().copied()).collect(),
            memory_bytes: config.memory_bytes(),
            nano_cpus: config.nano_cpus(),
            network,
            runtime: config.runtime.clone(),
            labels: HashMap::from([(TEAM_LABEL.to_string(), team_id.to_string())]),
        };

        let runtime_name = match self.runtime().run_container(&spec).await {
            Ok(name) => name,
            Err(RuntimeError::PortBindFailed(msg)) => {
                warn!(container = %spec.name, error = %msg, "Port bind failed, reallocating once");
                ports = self.allocate_ports(challenge.ports.len()).await?;
                spec.ports = challenge.ports.iter().copied().zip(ports.iter().copied()).collect();
                match self.runtime().run_container(&spec).await {
                    Ok(name) => name,
                    Err(RuntimeError::PortBindFailed(_)) => return Err(Error::NoFreePorts),
                    Err(e) => return Err(e.into()),
                }
            }
            Err(e) => return Err(e.into()),
        };

        let new = NewInstance {
            name: runtime_name.clone(),
            user_id: user.id,
            team_id,
            challenge_id: challenge.id,
            ports: ports.clone(),
            status: InstanceStatus::Running,
            created_at: now,
            expires_at: now + config.instance_lifetime(),
        };
        let instance = match self.deps().store.create_instance(&new, limits).await {
            Ok(InstanceInsert::Created(instance)) => instance,
            Ok(InstanceInsert::Existing(existing)) => {
                self.discard(ChallengeType::Docker, &runtime_name).await;
                return Ok(self.outcome(challenge, &existing));
            }
            Err(e) => {
                self.discard(ChallengeType::Docker, &runtime_name).await;
                return Err(match e {
                    Error::PortConflict(_) => Error::NoFreePorts,
                    other => other,
                });
            }
        };

        self.deps()
            .store
            .clear_instance_failure(team_id, challenge.id)
            .await?;
        self.push_firewall(team_id, &instance.ports).await;

        info!(
            instance_id = instance.id,
            name = %instance.name,
            team_id,
            challenge_id = challenge.id,
            ports = ?instance.ports,
            "Instance started"
        );

        let outcome = self.outcome(challenge, &instance);
        self.announce_running(
            &instance,
            &outcome.connection_info,
            &Actor::of(user),
            Audience::TeamExcept {
                team_id,
                user_id: user.id,
            },
        );
        Ok(outcome)
    }

    async fn start_compose(
        &self,
        config: &DockerConfig,
        user: &User,
        team_id: i32,
        challenge: &Challenge,
        limits: InstanceLimits,
        now: DateTime<Utc>,
    ) -> Result<StartOutcome> {
        let file = self.fetch_compose_file(&challenge.slug).await?;
        let needed = file.port_count();
        if needed == 0 {
            return Err(Error::NoPortsDefined);
        }
        let ports = self.allocate_ports(needed).await?;
        let project = compose::project_name(&challenge.slug, team_id, user.id);

        let permit = self.inner.jobs.reserve()?;
        let new = NewInstance {
            name: project.clone(),
            user_id: user.id,
            team_id,
            challenge_id: challenge.id,
            ports,
            status: InstanceStatus::Starting,
            created_at: now,
            expires_at: now + config.instance_lifetime(),
        };
        let instance = match self.deps().store.create_instance(&new, limits).await {
            Ok(InstanceInsert::Created(instance)) => instance,
            Ok(InstanceInsert::Existing(existing)) => return Ok(self.outcome(challenge, &existing)),
            Err(Error::PortConflict(_)) => return Err(Error::NoFreePorts),
            Err(e) => return Err(e),
        };
        self.deps()
            .store
            .clear_instance_failure(team_id, challenge.id)
            .await?;

        permit.send(Job::StartCompose(ComposeStart {
            instance_id: instance.id,
            project,
            challenge_id: challenge.id,
            team_id,
            user_id: user.id,
        }));

        info!(
            instance_id = instance.id,
            project = %instance.name,
            team_id,
            challenge_id = challenge.id,
            "Compose instance scheduled"
        );
        Ok(self.outcome(challenge, &instance))
    }

    /// Build the image for a docker challenge from its stored context.
    pub async fn build_image(&self, challenge_id: i32) -> Result<String> {
        let challenge = self
            .deps()
            .store
            .challenge(challenge_id)
            .await?
            .ok_or(Error::ChallengeNotFound)?;
        if challenge.challenge_type != ChallengeType::Docker {
            return Err(Error::NotDockerChallenge);
        }
        let config = self.deps().store.docker_config().await?;
        let tag = config.image_tag(&challenge.slug);
        self.build_from_objects(&challenge.slug, &tag).await?;
        Ok(tag)
    }

    async fn build_from_objects(&self, slug: &str, tag: &str) -> Result<()> {
        let dir = tempfile::tempdir()?;
        let count =
            download_prefix(self.deps().objects.as_ref(), Bucket::Challenges, slug, dir.path())
                .await?;
        if count == 0 {
            return Err(RuntimeError::BuildFailed(format!("no build context for {}", slug)).into());
        }
        let context = build_context_tar_async(dir.path()).await?;
        info!(slug, tag, files = count, "Building challenge image");
        self.runtime().build_image(tag, context).await?;
        Ok(())
    }

    async fn fetch_compose_file(&self, slug: &str) -> Result<ComposeFile> {
        for name in compose::COMPOSE_FILE_NAMES {
            let key = format!("{}/{}", slug, name);
            match get_bytes(
                self.deps().objects.as_ref(),
                Bucket::Challenges,
                &key,
                COMPOSE_FILE_LIMIT,
            )
            .await
            {
                Ok(bytes) => {
                    let text = String::from_utf8_lossy(&bytes);
                    return Ok(ComposeFile::parse(&text)?);
                }
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(RuntimeError::Compose(format!("no compose file for {}", slug)).into())
    }

    async fn allocate_ports(&self, n: usize) -> Result<Vec<i32>> {
        let ports = self.runtime().find_free_ports(n).await.map_err(|e| match e {
            RuntimeError::Unavailable(_) => Error::Runtime(e),
            other => {
                warn!(error = %other, "Port allocation failed");
                Error::NoFreePorts
            }
        })?;
        if ports.len() < n {
            return Err(Error::NoFreePorts);
        }
        Ok(ports)
    }

    async fn push_firewall(&self, team_id: i32, ports: &[i32]) {
        if !self.inner.firewall.is_enabled() {
            return;
        }
        let allowed_ips = match self.deps().store.team_ips(team_id).await {
            Ok(ips) => ips,
            Err(e) => {
                warn!(team_id, error = %e, "Failed to load team IPs for firewall push");
                return;
            }
        };
        let rule = FirewallRule {
            team_id,
            ports: ports.to_vec(),
            allowed_ips,
        };
        if let Err(e) = self.inner.jobs.enqueue(Job::PushFirewall(rule)) {
            warn!(team_id, error = %e, "Firewall push not queued");
        }
    }

    fn outcome(&self, challenge: &Challenge, instance: &Instance) -> StartOutcome {
        StartOutcome {
            status: instance.status,
            name: instance.name.clone(),
            ports: instance.ports.clone(),
            expires_at: instance.expires_at,
            connection_info: self.connection_info(challenge, instance),
        }
    }

    fn connection_info(&self, challenge: &Challenge, instance: &Instance) -> Vec<String> {
        render_connection_info(
            &challenge.connection_info,
            &self.inner.config.worker_ip,
            &challenge.ports,
            &instance.ports,
        )
    }

    fn announce_running(
        &self,
        instance: &Instance,
        connection_info: &[String],
        actor: &Actor,
        audience: Audience,
    ) {
        let mut update = InstanceUpdate::new(
            instance.team_id,
            actor.user_id,
            &actor.username,
            instance.challenge_id,
            InstanceStatus::Running.as_str(),
        );
        update.name = Some(instance.name.clone());
        update.ports = Some(instance.ports.clone());
        update.connection_info = Some(connection_info.to_vec());
        update.created_at = Some(instance.created_at);
        update.expires_at = Some(instance.expires_at);
        publish(
            self.deps().broadcaster.as_ref(),
            audience,
            &Event::InstanceUpdate(update),
        );
    }

    // ========================================================================
    // Background compose bring-up
    // ========================================================================

    async fn run_compose_start(&self, job: ComposeStart) {
        if let Err(e) = self.try_compose_start(&job).await {
            warn!(
                instance_id = job.instance_id,
                project = %job.project,
                error = %e,
                "Compose start failed"
            );
            self.fail_compose_start(&job, &e).await;
        }
    }

    async fn try_compose_start(&self, job: &ComposeStart) -> Result<()> {
        let store = &self.deps().store;
        let Some(instance) = store.instance(job.instance_id).await? else {
            debug!(instance_id = job.instance_id, "Instance gone before compose start");
            return Ok(());
        };
        let challenge = store
            .challenge(job.challenge_id)
            .await?
            .ok_or(Error::ChallengeNotFound)?;
        let config = store.docker_config().await?;

        let dir = tempfile::tempdir()?;
        download_prefix(
            self.deps().objects.as_ref(),
            Bucket::Challenges,
            &challenge.slug,
            dir.path(),
        )
        .await?;
        let file = ComposeFile::load(dir.path()).await?;
        let network = self.runtime().ensure_network(job.team_id).await?;

        let plan = |ports: &[i32]| {
            plan_project(&file, &config, job, &challenge.slug, &network, dir.path(), ports)
        };

        let mut ports = instance.ports.clone();
        match self.compose_up(&plan(&ports)?).await {
            Ok(()) => {}
            Err(Error::Runtime(RuntimeError::PortBindFailed(msg))) => {
                warn!(project = %job.project, error = %msg, "Port bind failed, reallocating once");
                self.compose_down_quietly(&job.project).await;
                ports = self.allocate_ports(ports.len()).await?;
                store
                    .set_instance_ports(instance.id, &ports)
                    .await
                    .map_err(|e| match e {
                        Error::PortConflict(_) => Error::NoFreePorts,
                        other => other,
                    })?;
                match self.compose_up(&plan(&ports)?).await {
                    Ok(()) => {}
                    Err(Error::Runtime(RuntimeError::PortBindFailed(_))) => {
                        return Err(Error::NoFreePorts);
                    }
                    Err(e) => return Err(e),
                }
            }
            Err(e) => return Err(e),
        }

        // stopped while the project was coming up
        let Some(mut instance) = store.instance(instance.id).await? else {
            info!(project = %job.project, "Instance removed during compose start, tearing down");
            self.compose_down_quietly(&job.project).await;
            return Ok(());
        };
        store
            .set_instance_status(instance.id, InstanceStatus::Running)
            .await?;
        store
            .clear_instance_failure(job.team_id, job.challenge_id)
            .await?;
        instance.status = InstanceStatus::Running;
        instance.ports = ports;

        self.push_firewall(job.team_id, &instance.ports).await;
        info!(
            instance_id = instance.id,
            project = %instance.name,
            ports = ?instance.ports,
            "Compose instance running"
        );

        let username = self.username(job.user_id).await;
        let connection_info = self.connection_info(&challenge, &instance);
        self.announce_running(
            &instance,
            &connection_info,
            &Actor {
                user_id: job.user_id,
                username,
            },
            Audience::Team(job.team_id),
        );
        Ok(())
    }

    async fn compose_up(&self, plan: &ComposePlan) -> Result<()> {
        match tokio::time::timeout(COMPOSE_UP_TIMEOUT, self.runtime().compose_up(plan)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(RuntimeError::Compose(format!(
                "compose up for {} timed out",
                plan.project
            ))
            .into()),
        }
    }

    async fn fail_compose_start(&self, job: &ComposeStart, err: &Error) {
        let store = &self.deps().store;
        let reason = err
            .public_message()
            .unwrap_or_else(|| err.error_code().to_string());

        match store.delete_instance(job.instance_id).await {
            Ok(Some(_)) => {
                let now = self.deps().now();
                if let Err(e) = store
                    .record_instance_failure(job.team_id, job.challenge_id, &reason, now)
                    .await
                {
                    error!(error = %e, "Failed to record instance failure");
                }
                let username = self.username(job.user_id).await;
                let mut update = InstanceUpdate::new(
                    job.team_id,
                    job.user_id,
                    &username,
                    job.challenge_id,
                    "failed",
                );
                update.name = Some(job.project.clone());
                update.reason = Some(reason);
                update.updated_at = Some(now);
                publish(
                    self.deps().broadcaster.as_ref(),
                    Audience::Team(job.team_id),
                    &Event::InstanceUpdate(update),
                );
            }
            Ok(None) => {}
            Err(e) => error!(instance_id = job.instance_id, error = %e, "Failed to delete failed instance"),
        }
        self.compose_down_quietly(&job.project).await;
    }

    async fn compose_down_quietly(&self, project: &str) {
        match self.runtime().compose_down(project).await {
            Ok(()) | Err(RuntimeError::NotFound(_)) => {}
            Err(e) => debug!(project, error = %e, "Compose down failed"),
        }
    }

    async fn username(&self, user_id: i32) -> String {
        match self.deps().store.user(user_id).await {
            Ok(Some(user)) => user.username,
            _ => String::new(),
        }
    }

    // ========================================================================
    // Stop
    // ========================================================================

    /// Stop the caller's team instance for `challenge_id`.
    pub async fn stop(&self, user_id: i32, challenge_id: i32) -> Result<StopOutcome> {
        let store = &self.deps().store;
        let user = store.user(user_id).await?.ok_or(Error::Unauthorized)?;
        let challenge = store
            .challenge(challenge_id)
            .await?
            .ok_or(Error::ChallengeNotFound)?;
        if !scores::visible_to(store.as_ref(), &user, &challenge).await? {
            return Err(Error::ChallengeNotFound);
        }
        // Scoped to the caller's team, so the caller is the owner or a teammate.
        let team_id = user.team_id.ok_or(Error::InstanceNotFound)?;
        let instance = store
            .instance_for(team_id, challenge_id)
            .await?
            .ok_or(Error::InstanceNotFound)?;

        let removed = self
            .stop_instance(
                &instance,
                challenge.challenge_type,
                InstanceStatus::Stopped,
                &Actor::of(&user),
            )
            .await?;
        if !removed {
            return Err(Error::InstanceNotFound);
        }
        Ok(StopOutcome {
            message: "instance_stopped",
            name: instance.name,
        })
    }

    /// Record the cooldown, delete the row, then schedule runtime cleanup.
    ///
    /// Returns `false` when another caller deleted the row first; nothing is
    /// scheduled in that case.
    async fn stop_instance(
        &self,
        instance: &Instance,
        kind: ChallengeType,
        status: InstanceStatus,
        actor: &Actor,
    ) -> Result<bool> {
        let store = &self.deps().store;
        let permit = self.inner.jobs.reserve()?;
        let now = self.deps().now();

        store
            .upsert_cooldown(instance.team_id, instance.challenge_id, now)
            .await?;
        let Some(deleted) = store.delete_instance(instance.id).await? else {
            return Ok(false);
        };
        permit.send(stop_job(kind, &deleted.name));

        info!(
            instance_id = deleted.id,
            name = %deleted.name,
            team_id = deleted.team_id,
            status = %status,
            "Instance removed"
        );
        self.announce_removed(&deleted, status, actor, now);
        Ok(true)
    }

    fn announce_removed(
        &self,
        instance: &Instance,
        status: InstanceStatus,
        actor: &Actor,
        now: DateTime<Utc>,
    ) {
        let mut update = InstanceUpdate::new(
            instance.team_id,
            actor.user_id,
            &actor.username,
            instance.challenge_id,
            status.as_str(),
        );
        update.name = Some(instance.name.clone());
        update.updated_at = Some(now);
        publish(
            self.deps().broadcaster.as_ref(),
            Audience::Team(instance.team_id),
            &Event::InstanceUpdate(update),
        );
    }

    async fn kind_of(&self, challenge_id: i32) -> ChallengeType {
        match self.deps().store.challenge(challenge_id).await {
            Ok(Some(challenge)) => challenge.challenge_type,
            _ => ChallengeType::Docker,
        }
    }

    async fn owner(&self, instance: &Instance) -> Actor {
        Actor {
            user_id: instance.user_id,
            username: self.username(instance.user_id).await,
        }
    }

    /// Stop a team's instance after it solved the challenge. Runs detached;
    /// a missing instance is not an error.
    pub fn stop_after_solve(&self, team_id: i32, challenge_id: i32, kind: ChallengeType) {
        if !kind.supports_instances() {
            return;
        }
        let this = self.clone();
        tokio::spawn(async move {
            let instance = match this.deps().store.instance_for(team_id, challenge_id).await {
                Ok(Some(instance)) => instance,
                Ok(None) => return,
                Err(e) => {
                    warn!(team_id, challenge_id, error = %e, "Failed to look up solved instance");
                    return;
                }
            };
            let actor = this.owner(&instance).await;
            if let Err(e) = this
                .stop_instance(&instance, kind, InstanceStatus::Stopped, &actor)
                .await
            {
                warn!(team_id, challenge_id, error = %e, "Failed to stop instance after solve");
            }
        });
    }

    /// Remove every instance past its expiry. Returns how many were removed.
    pub async fn sweep_expired(&self) -> Result<usize> {
        let now = self.deps().now();
        let expired = self.deps().store.expired_instances(now).await?;
        let mut removed = 0;
        for instance in expired {
            let kind = self.kind_of(instance.challenge_id).await;
            let actor = self.owner(&instance).await;
            match self
                .stop_instance(&instance, kind, InstanceStatus::Expired, &actor)
                .await
            {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => warn!(instance_id = instance.id, error = %e, "Failed to expire instance"),
            }
        }
        Ok(removed)
    }

    // ========================================================================
    // Status
    // ========================================================================

    /// Current instance state for the caller's team.
    ///
    /// A running instance past its expiry is flagged `expired`; teardown is
    /// left to the sweeper.
    pub async fn status(&self, user_id: i32, challenge_id: i32) -> Result<InstanceView> {
        let store = &self.deps().store;
        let user = store.user(user_id).await?.ok_or(Error::Unauthorized)?;
        let challenge = store
            .challenge(challenge_id)
            .await?
            .ok_or(Error::ChallengeNotFound)?;
        if !scores::visible_to(store.as_ref(), &user, &challenge).await? {
            return Err(Error::ChallengeNotFound);
        }
        let Some(team_id) = user.team_id else {
            return Ok(InstanceView::absent("no_team"));
        };

        let Some(mut instance) = store.instance_for(team_id, challenge_id).await? else {
            return Ok(match store.instance_failure(team_id, challenge_id).await? {
                Some(failure) => InstanceView::failed(failure.reason),
                None => InstanceView::absent("no_instance"),
            });
        };

        if instance.status == InstanceStatus::Running && instance.is_expired(self.deps().now()) {
            store
                .set_instance_status(instance.id, InstanceStatus::Expired)
                .await?;
            instance.status = InstanceStatus::Expired;
        }

        Ok(InstanceView {
            has_instance: true,
            status: Some(instance.status.as_str().to_string()),
            reason: None,
            connection_info: Some(self.connection_info(&challenge, &instance)),
            name: Some(instance.name),
            ports: Some(instance.ports),
            created_at: Some(instance.created_at),
            expires_at: Some(instance.expires_at),
        })
    }

    // ========================================================================
    // Admin
    // ========================================================================

    /// Delete one instance regardless of owner.
    pub async fn admin_delete(&self, instance_id: i32) -> Result<()> {
        let instance = self
            .deps()
            .store
            .instance(instance_id)
            .await?
            .ok_or(Error::InstanceNotFound)?;
        let kind = self.kind_of(instance.challenge_id).await;
        let actor = self.owner(&instance).await;
        if !self
            .stop_instance(&instance, kind, InstanceStatus::Stopped, &actor)
            .await?
        {
            return Err(Error::InstanceNotFound);
        }
        Ok(())
    }

    /// Delete every instance. Runtime cleanup continues in the background with
    /// bounded parallelism. Returns how many rows were removed.
    pub async fn admin_stop_all(&self) -> Result<usize> {
        let store = &self.deps().store;
        let now = self.deps().now();
        let mut kinds: HashMap<i32, ChallengeType> = HashMap::new();
        let mut targets = Vec::new();

        for instance in store.list_instances().await? {
            store
                .upsert_cooldown(instance.team_id, instance.challenge_id, now)
                .await?;
            let Some(deleted) = store.delete_instance(instance.id).await? else {
                continue;
            };
            let kind = match kinds.get(&deleted.challenge_id) {
                Some(kind) => *kind,
                None => {
                    let kind = self.kind_of(deleted.challenge_id).await;
                    kinds.insert(deleted.challenge_id, kind);
                    kind
                }
            };
            let actor = self.owner(&deleted).await;
            self.announce_removed(&deleted, InstanceStatus::Stopped, &actor, now);
            targets.push((kind, deleted.name));
        }

        let count = targets.len();
        info!(count, "Stopping all instances");
        let this = self.clone();
        tokio::spawn(async move {
            futures::stream::iter(targets)
                .for_each_concurrent(CLEANUP_CONCURRENCY, |(kind, name)| {
                    let this = this.clone();
                    async move { this.cleanup(kind, &name).await }
                })
                .await;
        });
        Ok(count)
    }

    /// Clean up runtime resources of instances whose rows are already gone.
    pub async fn release_instances(&self, kind: ChallengeType, instances: &[Instance]) {
        let now = self.deps().now();
        for instance in instances {
            if let Err(e) = self.inner.jobs.enqueue(stop_job(kind, &instance.name)) {
                warn!(name = %instance.name, error = %e, "Cleanup not queued, running inline");
                self.cleanup(kind, &instance.name).await;
            }
            let actor = self.owner(instance).await;
            self.announce_removed(instance, InstanceStatus::Stopped, &actor, now);
        }
    }

    async fn discard(&self, kind: ChallengeType, name: &str) {
        debug!(name, "Discarding runtime resources of a losing start");
        self.cleanup(kind, name).await;
    }

    async fn cleanup(&self, kind: ChallengeType, name: &str) {
        let result = match kind {
            ChallengeType::Compose => self.runtime().compose_down(name).await,
            _ => self.runtime().stop_container(name).await,
        };
        match result {
            Ok(()) => debug!(name, "Runtime resources removed"),
            Err(RuntimeError::NotFound(_)) => debug!(name, "Runtime resources already gone"),
            Err(e) => warn!(name, error = %e, "Runtime cleanup failed"),
        }
    }
}

fn plan_project(
    file: &ComposeFile,
    config: &DockerConfig,
    job: &ComposeStart,
    slug: &str,
    network: &str,
    context_dir: &Path,
    ports: &[i32],
) -> Result<ComposePlan> {
    let ctx = PlanContext {
        project: &job.project,
        slug,
        team_id: job.team_id,
        network,
        image_prefix: &config.image_prefix,
        memory_bytes: config.memory_bytes(),
        nano_cpus: config.nano_cpus(),
        runtime: &config.runtime,
        context_dir,
    };
    Ok(ComposePlan::build(file, &ctx, ports)?)
}

#[async_trait]
impl JobExecutor for Orchestrator {
    async fn execute(&self, job: Job) {
        match job {
            Job::StartCompose(start) => self.run_compose_start(start).await,
            Job::StopContainer { name } => self.cleanup(ChallengeType::Docker, &name).await,
            Job::StopCompose { project } => self.cleanup(ChallengeType::Compose, &project).await,
            Job::PushFirewall(rule) => {
                if let Err(e) = self.inner.firewall.push(&rule).await {
                    warn!(team_id = rule.team_id, error = %e, "Firewall push failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_render_connection_info() {
        let rendered = render_connection_info(
            &["nc $ip [1337]".to_string(), "http://$ip:[80]/".to_string()],
            "10.0.0.5",
            &[1337, 80],
            &[40001, 40002],
        );
        assert_eq!(rendered, vec!["nc 10.0.0.5 40001", "http://10.0.0.5:40002/"]);
    }

    #[test]
    fn test_render_connection_info_without_ports() {
        let rendered = render_connection_info(
            &["ssh ctf@$ip -p [22]".to_string()],
            DEFAULT_WORKER_IP,
            &[22],
            &[],
        );
        assert_eq!(rendered, vec!["ssh ctf@instance-ip -p [22]"]);
    }

    #[test]
    fn test_cooldown_remaining() {
        assert_eq!(cooldown_remaining(30, Some(at(5)), at(20)), Some(15));
        assert_eq!(cooldown_remaining(30, Some(at(5)), at(35)), None);
        assert_eq!(cooldown_remaining(0, Some(at(5)), at(6)), None);
        assert_eq!(cooldown_remaining(30, None, at(6)), None);
    }

    #[test]
    fn test_stop_job_by_kind() {
        assert_eq!(
            stop_job(ChallengeType::Compose, "web_1_2"),
            Job::StopCompose {
                project: "web_1_2".into()
            }
        );
        assert_eq!(
            stop_job(ChallengeType::Docker, "pta-web"),
            Job::StopContainer {
                name: "pta-web".into()
            }
        );
    }

    #[test]
    fn test_failed_view_shape() {
        let view = serde_json::to_value(InstanceView::failed("docker_build_failed".into())).unwrap();
        assert_eq!(
            view,
            serde_json::json!({
                "hasInstance": false,
                "status": "failed",
                "reason": "docker_build_failed"
            })
        );
    }
}
