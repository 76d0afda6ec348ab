// Copyright (C) 2025 pwnthemall contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker that forgets revoked tokens once they have expired.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::deps::Deps;
use crate::http::auth::Authenticator;

/// Configuration for the token reaper.
#[derive(Debug, Clone)]
pub struct TokenReaperConfig {
    /// How often to purge expired revocations.
    pub poll_interval: Duration,
}

impl Default for TokenReaperConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3600),
        }
    }
}

/// Background worker that purges the token blacklist.
pub struct TokenReaper {
    deps: Deps,
    auth: Arc<Authenticator>,
    config: TokenReaperConfig,
    shutdown: Arc<Notify>,
}

impl TokenReaper {
    /// Create a new reaper.
    pub fn new(deps: Deps, auth: Arc<Authenticator>, config: TokenReaperConfig) -> Self {
        Self {
            deps,
            auth,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the purge loop until shutdown.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "Token reaper started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Token reaper received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    self.reap_once().await;
                }
            }
        }

        info!("Token reaper stopped");
    }

    /// One pass.
    pub async fn reap_once(&self) {
        let now = self.deps.now();
        let forgotten = self.auth.forget_expired(now);
        match self.deps.store.purge_blacklist(now).await {
            Ok(0) if forgotten == 0 => debug!("No expired revocations"),
            Ok(purged) => info!(purged, forgotten, "Expired revocations purged"),
            Err(e) => error!(error = %e, "Failed to purge token blacklist"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        assert_eq!(
            TokenReaperConfig::default().poll_interval,
            Duration::from_secs(3600)
        );
    }
}
