// Copyright (C) 2025 pwnthemall contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker that activates hints once their `auto_active_at` passes.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::deps::Deps;

/// Configuration for the hint scheduler.
#[derive(Debug, Clone)]
pub struct HintSchedulerConfig {
    /// How often to look for due hints.
    pub poll_interval: Duration,
}

impl Default for HintSchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
        }
    }
}

/// Background worker that activates scheduled hints.
pub struct HintScheduler {
    deps: Deps,
    config: HintSchedulerConfig,
    shutdown: Arc<Notify>,
}

impl HintScheduler {
    /// Create a new scheduler.
    pub fn new(deps: Deps, config: HintSchedulerConfig) -> Self {
        Self {
            deps,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run until shutdown. Due hints are activated once at startup too.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "Hint scheduler started"
        );

        self.activate_once().await;

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Hint scheduler received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    self.activate_once().await;
                }
            }
        }

        info!("Hint scheduler stopped");
    }

    /// One pass. Returns the number of hints activated.
    pub async fn activate_once(&self) -> usize {
        match self.deps.store.activate_due_hints(self.deps.now()).await {
            Ok(hints) if hints.is_empty() => {
                debug!("No hints due");
                0
            }
            Ok(hints) => {
                for hint in &hints {
                    info!(hint_id = hint.id, challenge_id = hint.challenge_id, "Hint activated");
                }
                hints.len()
            }
            Err(e) => {
                error!(error = %e, "Failed to activate scheduled hints");
                0
            }
        }
    }
}
