// Copyright (C) 2025 pwnthemall contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable platform runtime.
//!
//! [`PlatformRuntime`] wires the services together, serves the HTTP API and
//! runs the background workers (job pool, expiry sweeper, hint scheduler,
//! token reaper).
//!
//! ```rust,ignore
//! let runtime = PlatformRuntime::builder()
//!     .deps(deps)
//!     .hub(hub)
//!     .jwt_secret(&config.jwt_secret)
//!     .bind_addr(config.http_addr)
//!     .build()?
//!     .start()
//!     .await?;
//!
//! tokio::signal::ctrl_c().await?;
//! runtime.shutdown().await?;
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::broadcast::ConnectionHub;
use crate::config::{Config, DeletePolicy};
use crate::ctf::CtfWindow;
use crate::deps::Deps;
use crate::expiry_sweeper::{ExpirySweeper, ExpirySweeperConfig};
use crate::firewall::FirewallClient;
use crate::hint_scheduler::{HintScheduler, HintSchedulerConfig};
use crate::hints::HintService;
use crate::http::auth::Authenticator;
use crate::http::{self, AppState};
use crate::ingestor::{Ingestor, IngestorConfig};
use crate::jobs::{JobQueue, JobWorker, JobWorkerConfig};
use crate::orchestrator::{DEFAULT_WORKER_IP, Orchestrator, OrchestratorConfig};
use crate::submission::SubmissionService;
use crate::token_reaper::{TokenReaper, TokenReaperConfig};

/// Builder for a [`PlatformRuntime`].
pub struct PlatformRuntimeBuilder {
    deps: Option<Deps>,
    hub: Option<ConnectionHub>,
    jwt_secret: Option<String>,
    bind_addr: SocketAddr,
    webhook_token: Option<String>,
    worker_ip: String,
    firewall_agent_url: Option<String>,
    ctf_window: CtfWindow,
    job_queue_capacity: usize,
    job_workers: usize,
    sweep_interval: Duration,
    hint_interval: Duration,
    token_reap_interval: Duration,
    delete_policy: DeletePolicy,
}

impl Default for PlatformRuntimeBuilder {
    fn default() -> Self {
        Self {
            deps: None,
            hub: None,
            jwt_secret: None,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            webhook_token: None,
            worker_ip: DEFAULT_WORKER_IP.to_string(),
            firewall_agent_url: None,
            ctf_window: CtfWindow::default(),
            job_queue_capacity: 256,
            job_workers: 4,
            sweep_interval: Duration::from_secs(60),
            hint_interval: Duration::from_secs(60),
            token_reap_interval: Duration::from_secs(3600),
            delete_policy: DeletePolicy::Detach,
        }
    }
}

impl PlatformRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply every setting carried by `config`. Deps and hub are still
    /// required.
    pub fn config(self, config: &Config) -> Self {
        Self {
            jwt_secret: Some(config.jwt_secret.clone()),
            bind_addr: config.http_addr,
            webhook_token: config.webhook_token.clone(),
            worker_ip: config.docker_worker_ip.clone(),
            firewall_agent_url: config.firewall_agent_url.clone(),
            ctf_window: CtfWindow::new(config.ctf_start, config.ctf_end),
            job_queue_capacity: config.job_queue_capacity,
            job_workers: config.job_workers,
            sweep_interval: config.sweep_interval,
            hint_interval: config.hint_interval,
            delete_policy: config.delete_policy,
            ..self
        }
    }

    /// Set the shared clients (required). The broadcaster should be the
    /// same hub passed to [`hub`](Self::hub).
    pub fn deps(mut self, deps: Deps) -> Self {
        self.deps = Some(deps);
        self
    }

    /// Set the connection hub serving `GET /events` (required).
    pub fn hub(mut self, hub: ConnectionHub) -> Self {
        self.hub = Some(hub);
        self
    }

    /// Set the HS256 access token secret (required).
    pub fn jwt_secret(mut self, secret: impl Into<String>) -> Self {
        self.jwt_secret = Some(secret.into());
        self
    }

    /// Set the HTTP bind address.
    ///
    /// Default: `0.0.0.0:8080`
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Require this bearer token on object store webhooks.
    ///
    /// Default: none (webhooks unauthenticated)
    pub fn webhook_token(mut self, token: Option<String>) -> Self {
        self.webhook_token = token;
        self
    }

    /// Set the address substituted for `$ip` in connection info.
    ///
    /// Default: `instance-ip`
    pub fn worker_ip(mut self, ip: impl Into<String>) -> Self {
        self.worker_ip = ip.into();
        self
    }

    /// Set the firewall agent URL template.
    ///
    /// Default: none (pushes skipped)
    pub fn firewall_agent_url(mut self, url: Option<String>) -> Self {
        self.firewall_agent_url = url;
        self
    }

    /// Set the CTF window.
    ///
    /// Default: no timing
    pub fn ctf_window(mut self, window: CtfWindow) -> Self {
        self.ctf_window = window;
        self
    }

    /// Set the job queue capacity.
    ///
    /// Default: 256
    pub fn job_queue_capacity(mut self, capacity: usize) -> Self {
        self.job_queue_capacity = capacity;
        self
    }

    /// Set the number of job workers.
    ///
    /// Default: 4
    pub fn job_workers(mut self, workers: usize) -> Self {
        self.job_workers = workers;
        self
    }

    /// Set the expiry sweeper interval.
    ///
    /// Default: 60 seconds
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Set the hint scheduler interval.
    ///
    /// Default: 60 seconds
    pub fn hint_interval(mut self, interval: Duration) -> Self {
        self.hint_interval = interval;
        self
    }

    /// Set the token reaper interval.
    ///
    /// Default: 1 hour
    pub fn token_reap_interval(mut self, interval: Duration) -> Self {
        self.token_reap_interval = interval;
        self
    }

    /// Set what happens to instances of a deleted challenge.
    ///
    /// Default: `Detach`
    pub fn delete_policy(mut self, policy: DeletePolicy) -> Self {
        self.delete_policy = policy;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<PlatformRuntimeConfig> {
        let deps = self
            .deps
            .ok_or_else(|| anyhow::anyhow!("deps is required"))?;
        let hub = self.hub.ok_or_else(|| anyhow::anyhow!("hub is required"))?;
        let jwt_secret = self
            .jwt_secret
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow::anyhow!("jwt_secret is required"))?;

        Ok(PlatformRuntimeConfig {
            deps,
            hub,
            jwt_secret,
            bind_addr: self.bind_addr,
            webhook_token: self.webhook_token,
            worker_ip: self.worker_ip,
            firewall_agent_url: self.firewall_agent_url,
            ctf_window: self.ctf_window,
            job_queue_capacity: self.job_queue_capacity,
            job_workers: self.job_workers,
            sweep_interval: self.sweep_interval,
            hint_interval: self.hint_interval,
            token_reap_interval: self.token_reap_interval,
            delete_policy: self.delete_policy,
        })
    }
}

/// Configuration for a [`PlatformRuntime`].
pub struct PlatformRuntimeConfig {
    deps: Deps,
    hub: ConnectionHub,
    jwt_secret: String,
    bind_addr: SocketAddr,
    webhook_token: Option<String>,
    worker_ip: String,
    firewall_agent_url: Option<String>,
    ctf_window: CtfWindow,
    job_queue_capacity: usize,
    job_workers: usize,
    sweep_interval: Duration,
    hint_interval: Duration,
    token_reap_interval: Duration,
    delete_policy: DeletePolicy,
}

impl PlatformRuntimeConfig {
    /// Assemble the services without starting anything.
    pub fn services(&self) -> (AppState, crate::jobs::JobReceiver) {
        let deps = self.deps.clone();
        let (queue, receiver) = JobQueue::bounded(self.job_queue_capacity);
        let orchestrator = Orchestrator::new(
            deps.clone(),
            queue,
            FirewallClient::new(self.firewall_agent_url.clone()),
            OrchestratorConfig {
                worker_ip: self.worker_ip.clone(),
            },
        );
        let ingestor = Ingestor::new(
            deps.clone(),
            orchestrator.clone(),
            IngestorConfig {
                delete_policy: self.delete_policy,
                ..IngestorConfig::default()
            },
        );
        let state = AppState {
            submissions: SubmissionService::new(deps.clone(), orchestrator.clone(), self.ctf_window),
            hints: HintService::new(deps.clone()),
            hub: self.hub.clone(),
            auth: Arc::new(Authenticator::new(&self.jwt_secret)),
            webhook_token: self.webhook_token.clone(),
            deps,
            orchestrator,
            ingestor,
        };
        (state, receiver)
    }

    /// Start the runtime, spawning the HTTP server and background workers.
    pub async fn start(self) -> Result<PlatformRuntime> {
        let (state, receiver) = self.services();

        if let Err(e) = state
            .auth
            .load_revocations(state.deps.store.as_ref(), state.deps.now())
            .await
        {
            warn!(error = %e, "Failed to load token blacklist");
        }

        let job_worker = JobWorker::new(
            receiver,
            Arc::new(state.orchestrator.clone()),
            JobWorkerConfig {
                workers: self.job_workers,
            },
        );
        let jobs_shutdown = job_worker.shutdown_handle();
        let jobs_handle = tokio::spawn(async move {
            job_worker.run().await;
        });

        let sweeper = ExpirySweeper::new(
            state.orchestrator.clone(),
            ExpirySweeperConfig {
                poll_interval: self.sweep_interval,
            },
        );
        let sweeper_shutdown = sweeper.shutdown_handle();
        let sweeper_handle = tokio::spawn(async move {
            sweeper.run().await;
        });

        let hint_scheduler = HintScheduler::new(
            state.deps.clone(),
            HintSchedulerConfig {
                poll_interval: self.hint_interval,
            },
        );
        let hints_shutdown = hint_scheduler.shutdown_handle();
        let hints_handle = tokio::spawn(async move {
            hint_scheduler.run().await;
        });

        let reaper = TokenReaper::new(
            state.deps.clone(),
            state.auth.clone(),
            TokenReaperConfig {
                poll_interval: self.token_reap_interval,
            },
        );
        let reaper_shutdown = reaper.shutdown_handle();
        let reaper_handle = tokio::spawn(async move {
            reaper.run().await;
        });

        let listener = TcpListener::bind(self.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        let (server_shutdown_tx, mut server_shutdown_rx) = watch::channel(false);
        let app = http::router(state.clone());
        let server_handle = tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                let _ = server_shutdown_rx.changed().await;
            })
            .await
            .map_err(anyhow::Error::from)
        });

        info!(
            bind_addr = %local_addr,
            job_workers = self.job_workers,
            delete_policy = ?self.delete_policy,
            "PlatformRuntime started"
        );

        Ok(PlatformRuntime {
            server_handle,
            workers: vec![
                ("job workers", jobs_shutdown, jobs_handle),
                ("expiry sweeper", sweeper_shutdown, sweeper_handle),
                ("hint scheduler", hints_shutdown, hints_handle),
                ("token reaper", reaper_shutdown, reaper_handle),
            ],
            server_shutdown_tx,
            state,
            local_addr,
        })
    }
}

/// A running platform.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct PlatformRuntime {
    server_handle: JoinHandle<Result<()>>,
    workers: Vec<(&'static str, Arc<Notify>, JoinHandle<()>)>,
    server_shutdown_tx: watch::Sender<bool>,
    state: AppState,
    local_addr: SocketAddr,
}

impl PlatformRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> PlatformRuntimeBuilder {
        PlatformRuntimeBuilder::new()
    }

    /// Address the HTTP server is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Shared handler state.
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// The challenge ingestor.
    pub fn ingestor(&self) -> &Ingestor {
        &self.state.ingestor
    }

    /// Whether the server and every worker are still running.
    pub fn is_running(&self) -> bool {
        !self.server_handle.is_finished()
            && self.workers.iter().all(|(_, _, handle)| !handle.is_finished())
    }

    /// Gracefully shut down: stop accepting requests, signal every worker
    /// and wait for them.
    pub async fn shutdown(self) -> Result<()> {
        info!("PlatformRuntime shutting down...");

        let _ = self.server_shutdown_tx.send(true);

        for (_, shutdown, _) in &self.workers {
            shutdown.notify_one();
        }
        for (name, _, handle) in self.workers {
            if let Err(e) = handle.await {
                error!(worker = name, "Worker task panicked: {}", e);
            }
        }

        match self.server_handle.await {
            Ok(Ok(())) => {
                info!("PlatformRuntime shutdown complete");
                Ok(())
            }
            Ok(Err(e)) => {
                error!("HTTP server error during shutdown: {}", e);
                Err(e)
            }
            Err(e) => {
                error!("HTTP server task panicked: {}", e);
                Err(anyhow::anyhow!("server task panicked: {}", e))
            }
        }
    }
}
