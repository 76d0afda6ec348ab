// Copyright (C) 2025 pwnthemall contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker that removes instances past their expiry.
//!
//! Each pass deletes the expired rows through the same path as an explicit
//! stop, so a sweep racing a user's stop schedules runtime cleanup once.
//! Passes never overlap: the next sleep starts after the previous pass ends.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::orchestrator::Orchestrator;

/// Configuration for the expiry sweeper.
#[derive(Debug, Clone)]
pub struct ExpirySweeperConfig {
    /// How often to scan for expired instances.
    pub poll_interval: Duration,
}

impl Default for ExpirySweeperConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
        }
    }
}

/// Background worker that expires instances.
pub struct ExpirySweeper {
    orchestrator: Orchestrator,
    config: ExpirySweeperConfig,
    shutdown: Arc<Notify>,
}

impl ExpirySweeper {
    /// Create a new sweeper.
    pub fn new(orchestrator: Orchestrator, config: ExpirySweeperConfig) -> Self {
        Self {
            orchestrator,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the sweep loop until shutdown.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "Expiry sweeper started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Expiry sweeper received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    self.sweep_once().await;
                }
            }
        }

        info!("Expiry sweeper stopped");
    }

    /// One pass.
    pub async fn sweep_once(&self) {
        match self.orchestrator.sweep_expired().await {
            Ok(0) => debug!("No expired instances"),
            Ok(removed) => info!(removed, "Expired instances removed"),
            Err(e) => error!(error = %e, "Failed to sweep expired instances"),
        }
    }
}
