// Copyright (C) 2025 pwnthemall contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Outbound firewall push to the worker host's team agent.
//!
//! The agent admits TCP to an instance's host ports only from the IPs the
//! team's members authenticated from. Pushes are best effort.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

const PUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors from a firewall push.
#[derive(Debug, Error)]
pub enum FirewallError {
    /// Request could not be sent.
    #[error("firewall agent request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// Agent answered with a non-success status.
    #[error("firewall agent returned {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// Rule set for one instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FirewallRule {
    /// Team owning the ports.
    #[serde(rename = "teamId")]
    pub team_id: i32,
    /// Host ports to open.
    pub ports: Vec<i32>,
    /// Source addresses allowed through.
    #[serde(rename = "allowedIPs")]
    pub allowed_ips: Vec<String>,
}

/// HTTP client for the team agent.
#[derive(Clone)]
pub struct FirewallClient {
    client: reqwest::Client,
    url_template: Option<String>,
}

impl FirewallClient {
    /// Create a client. `url_template` may contain `{team_id}`; `None`
    /// disables pushes.
    pub fn new(url_template: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(PUSH_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            url_template,
        }
    }

    /// A client that never pushes.
    pub fn disabled() -> Self {
        Self::new(None)
    }

    /// Whether an agent URL is configured.
    pub fn is_enabled(&self) -> bool {
        self.url_template.is_some()
    }

    /// POST the rule to the agent. Returns `Ok(false)` when pushes are disabled.
    pub async fn push(&self, rule: &FirewallRule) -> Result<bool, FirewallError> {
        let Some(template) = &self.url_template else {
            debug!(team_id = rule.team_id, "Firewall agent not configured, skipping push");
            return Ok(false);
        };
        let url = template.replace("{team_id}", &rule.team_id.to_string());

        let response = self.client.post(&url).json(rule).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FirewallError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        info!(
            team_id = rule.team_id,
            ports = ?rule.ports,
            allowed_ips = rule.allowed_ips.len(),
            "Pushed firewall rules"
        );
        Ok(true)
    }
}
