// Copyright (C) 2025 pwnthemall contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for pta-core.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::container::DaemonAddress;
use crate::models::DockerConfig;

/// What the ingestor does with runtime state when a challenge disappears.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletePolicy {
    /// Let the database cascade the instance rows; leave containers alone.
    Detach,
    /// Also enqueue runtime cleanup for every cascaded instance.
    Stop,
}

impl FromStr for DeletePolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "detach" => Ok(Self::Detach),
            "stop" => Ok(Self::Stop),
            _ => Err(ConfigError::Invalid("PTA_CHALLENGE_DELETE_POLICY")),
        }
    }
}

/// Object store connection settings.
#[derive(Debug, Clone)]
pub struct S3Config {
    /// Endpoint base URL, path-style addressing is used.
    pub endpoint: String,
    /// SigV4 signing region.
    pub region: String,
    /// Access key id.
    pub access_key: String,
    /// Secret access key.
    pub secret_key: String,
}

/// Platform configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL
    pub database_url: String,
    /// HTTP server bind address
    pub http_addr: SocketAddr,
    /// HS256 secret for access tokens
    pub jwt_secret: String,
    /// Shared bearer token expected on object store webhooks
    pub webhook_token: Option<String>,
    /// Object store settings
    pub s3: S3Config,
    /// Container daemon endpoint
    pub docker_worker_url: String,
    /// Address substituted for `$ip` in connection info
    pub docker_worker_ip: String,
    /// Runtime policy seeded into the DockerConfig row at boot
    pub docker: DockerConfig,
    /// CTF start, `None` when unset or unparseable
    pub ctf_start: Option<DateTime<Utc>>,
    /// CTF end, `None` when unset or unparseable
    pub ctf_end: Option<DateTime<Utc>>,
    /// Firewall agent URL template; `{team_id}` is substituted
    pub firewall_agent_url: Option<String>,
    /// Job queue capacity
    pub job_queue_capacity: usize,
    /// Number of job workers
    pub job_workers: usize,
    /// Expiry sweeper interval
    pub sweep_interval: Duration,
    /// Hint scheduler interval
    pub hint_interval: Duration,
    /// Challenge deletion policy
    pub delete_policy: DeletePolicy,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("PTA_DATABASE_URL")
            .or_else(|_| std::env::var("DATABASE_URL"))
            .map_err(|_| ConfigError::MissingEnvVar("PTA_DATABASE_URL or DATABASE_URL"))?;

        let http_addr: SocketAddr = std::env::var("PTA_HTTP_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
            .parse()
            .map_err(|_| ConfigError::Invalid("PTA_HTTP_ADDR"))?;

        let jwt_secret = required("PTA_JWT_SECRET")?;
        let webhook_token = optional("PTA_WEBHOOK_TOKEN");

        let s3 = S3Config {
            endpoint: std::env::var("PTA_S3_ENDPOINT")
                .unwrap_or_else(|_| "http://localhost:9000".to_string()),
            region: std::env::var("PTA_S3_REGION").unwrap_or_else(|_| "us-east-1".to_string()),
            access_key: required("PTA_S3_ACCESS_KEY")?,
            secret_key: required("PTA_S3_SECRET_KEY")?,
        };

        let docker_worker_url = std::env::var("PTA_DOCKER_WORKER_URL")
            .unwrap_or_else(|_| "unix:///var/run/docker.sock".to_string());
        DaemonAddress::parse(&docker_worker_url)
            .map_err(|_| ConfigError::Invalid("PTA_DOCKER_WORKER_URL"))?;
        let docker_worker_ip =
            optional("PTA_DOCKER_WORKER_IP").unwrap_or_else(|| "instance-ip".to_string());

        let docker = DockerConfig {
            image_prefix: optional("PTA_DOCKER_IMAGE_PREFIX").unwrap_or_else(|| "pta-".into()),
            max_mem_mib: parse_or("PTA_DOCKER_MAXMEM_PER_INSTANCE", 256)?,
            max_cpu: parse_or("PTA_DOCKER_MAXCPU_PER_INSTANCE", 0.5)?,
            instances_by_user: parse_or("PTA_DOCKER_INSTANCES_BY_USER", 1)?,
            instances_by_team: parse_or("PTA_DOCKER_INSTANCES_BY_TEAM", 3)?,
            instance_timeout_minutes: parse_or("PTA_DOCKER_INSTANCE_TIMEOUT", 60)?,
            cooldown_seconds: parse_or("PTA_DOCKER_INSTANCE_COOLDOWN_SECONDS", 0)?,
            runtime: optional("PTA_DOCKER_RUNTIME").unwrap_or_else(|| "runc".into()),
        };

        let ctf_start = parse_time(std::env::var("PTA_CTF_START_TIME").ok().as_deref());
        let ctf_end = parse_time(std::env::var("PTA_CTF_END_TIME").ok().as_deref());

        let delete_policy = match optional("PTA_CHALLENGE_DELETE_POLICY") {
            Some(v) => v.parse()?,
            None => DeletePolicy::Detach,
        };

        Ok(Self {
            database_url,
            http_addr,
            jwt_secret,
            webhook_token,
            s3,
            docker_worker_url,
            docker_worker_ip,
            docker,
            ctf_start,
            ctf_end,
            firewall_agent_url: optional("PTA_FIREWALL_AGENT_URL"),
            job_queue_capacity: parse_or("PTA_JOB_QUEUE_CAPACITY", 256)?,
            job_workers: parse_or("PTA_JOB_WORKERS", 4)?,
            sweep_interval: Duration::from_secs(parse_or("PTA_INSTANCE_SWEEP_INTERVAL_SECS", 60)?),
            hint_interval: Duration::from_secs(parse_or("PTA_HINT_SCHEDULER_INTERVAL_SECS", 60)?),
            delete_policy,
        })
    }
}

/// Parse an RFC3339 timestamp; empty or malformed values mean "no timing".
pub fn parse_time(value: Option<&str>) -> Option<DateTime<Utc>> {
    let value = value?.trim();
    if value.is_empty() {
        return None;
    }
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    optional(name).ok_or(ConfigError::MissingEnvVar(name))
}

fn optional(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_or<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match optional(name) {
        Some(v) => v.trim().parse().map_err(|_| ConfigError::Invalid(name)),
        None => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// An environment variable has an unparseable value.
    #[error("Invalid value for environment variable: {0}")]
    Invalid(&'static str),
}
