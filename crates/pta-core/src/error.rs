// Copyright (C) 2025 pwnthemall contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for pta-core.
//!
//! Every variant maps to a stable machine-readable code via [`Error::error_code`]
//! and to an HTTP status via [`Error::status`]. Codes are what crosses the wire;
//! the `Display` text is for logs only.

use axum::http::StatusCode;
use thiserror::Error;

use crate::container::RuntimeError;
use crate::descriptor::DescriptorError;
use crate::object_store::ObjectStoreError;

/// Platform core errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Object store operation failed.
    #[error("Object store error: {0}")]
    ObjectStore(#[from] ObjectStoreError),

    /// Container runtime operation failed.
    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    /// A `chall.yml` descriptor was rejected.
    #[error("Descriptor error: {0}")]
    Descriptor(#[from] DescriptorError),

    /// Malformed request payload.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Caller is not authenticated.
    #[error("Unauthorized")]
    Unauthorized,

    /// Caller is authenticated but not allowed to act on the resource.
    #[error("Forbidden")]
    Forbidden,

    /// Caller must belong to a team.
    #[error("Team required")]
    TeamRequired,

    /// Admin without a team tried to start an instance.
    #[error("Admin must join a team to start instances")]
    AdminTeamRequired,

    /// Caller has no team (hint purchase).
    #[error("No team")]
    NoTeam,

    /// Challenge does not exist or is hidden behind an unsolved prerequisite.
    #[error("Challenge not found")]
    ChallengeNotFound,

    /// Instance does not exist.
    #[error("Instance not found")]
    InstanceNotFound,

    /// Hint does not exist.
    #[error("Hint not found")]
    HintNotFound,

    /// Challenge type does not support instances.
    #[error("Challenge type does not support instances")]
    Unsupported,

    /// Operation needs a `docker` challenge.
    #[error("Challenge is not a docker challenge")]
    NotDockerChallenge,

    /// Instance challenge declares no ports.
    #[error("No ports defined for challenge")]
    NoPortsDefined,

    /// Restart attempted before the cooldown elapsed.
    #[error("Cooldown active, {remaining_seconds}s remaining")]
    CooldownActive {
        /// Seconds until a start is accepted again.
        remaining_seconds: i64,
    },

    /// Per-user instance cap reached.
    #[error("Maximum instances per user reached")]
    PerUserLimit,

    /// Per-team instance cap reached.
    #[error("Maximum instances per team reached")]
    PerTeamLimit,

    /// Host ports could not be allocated.
    #[error("No free ports")]
    NoFreePorts,

    /// A host port is already reserved by another instance.
    #[error("Host port {0} already reserved")]
    PortConflict(i32),

    /// The background job queue is full.
    #[error("Job queue full")]
    QueueFull,

    /// Team already has a solve for the challenge.
    #[error("Challenge already solved")]
    AlreadySolved,

    /// Same wrong value was already submitted.
    #[error("Flag already submitted")]
    FlagAlreadySubmitted,

    /// Team exhausted its attempts.
    #[error("Maximum attempts reached")]
    MaxAttemptsReached,

    /// Submitted flag is wrong.
    #[error("Wrong flag")]
    WrongFlag,

    /// Submitted coordinates are outside every accepted radius.
    #[error("Incorrect location")]
    IncorrectLocation,

    /// CTF has not started yet.
    #[error("CTF not started")]
    CtfNotStarted,

    /// CTF is over.
    #[error("CTF ended")]
    CtfEnded,

    /// Hint is not active yet.
    #[error("Hint not active")]
    HintNotActive,

    /// Team already bought this hint.
    #[error("Hint already purchased")]
    HintAlreadyPurchased,

    /// Team cannot afford the hint.
    #[error("Insufficient points: required {required}, available {available}")]
    InsufficientPoints {
        /// Hint cost.
        required: i64,
        /// Team's spendable score.
        available: i64,
    },

    /// Anything else.
    #[error("{0}")]
    Internal(String),
}

impl Error {
    /// Stable machine-readable code sent to clients.
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::InvalidInput(_) => "invalid_input",
            Error::Descriptor(_) => "invalid_descriptor",
            Error::Unauthorized => "unauthorized",
            Error::Forbidden => "forbidden",
            Error::TeamRequired => "team_required",
            Error::AdminTeamRequired => "admin_team_required_for_instances",
            Error::NoTeam => "no_team",
            Error::ChallengeNotFound => "challenge_not_found",
            Error::InstanceNotFound => "instance_not_found",
            Error::HintNotFound => "hint_not_found",
            Error::Unsupported => "unsupported_challenge_type",
            Error::NotDockerChallenge => "challenge_not_docker_type",
            Error::NoPortsDefined => "no_ports_defined_for_challenge",
            Error::CooldownActive { .. } => "instance_cooldown_not_elapsed",
            Error::PerUserLimit => "max_instances_by_user_reached",
            Error::PerTeamLimit => "max_instances_by_team_reached",
            Error::NoFreePorts | Error::PortConflict(_) => "no_free_ports",
            Error::QueueFull => "queue_full",
            Error::AlreadySolved => "challenge_already_solved",
            Error::FlagAlreadySubmitted => "flag_already_submitted",
            Error::MaxAttemptsReached => "max_attempts_reached",
            Error::WrongFlag => "wrong_flag",
            Error::IncorrectLocation => "incorrect_location",
            Error::CtfNotStarted => "flag_submission_not_available_yet",
            Error::CtfEnded => "flag_submission_no_longer_available",
            Error::HintNotActive => "hint_not_active",
            Error::HintAlreadyPurchased => "hint_already_purchased",
            Error::InsufficientPoints { .. } => "insufficient_points",
            Error::Runtime(RuntimeError::Unavailable(_)) => "docker_unavailable",
            Error::Runtime(RuntimeError::BuildFailed(_)) => "docker_build_failed",
            Error::Runtime(RuntimeError::PortBindFailed(_)) => "no_free_ports",
            Error::Runtime(RuntimeError::NotFound(_)) => "instance_not_found",
            Error::ObjectStore(ObjectStoreError::NotFound(_)) => "object_not_found",
            _ => "internal_error",
        }
    }

    /// HTTP status for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            Error::InvalidInput(_)
            | Error::Descriptor(_)
            | Error::NoTeam
            | Error::Unsupported
            | Error::NotDockerChallenge
            | Error::NoPortsDefined
            | Error::HintNotActive
            | Error::HintAlreadyPurchased
            | Error::InsufficientPoints { .. } => StatusCode::BAD_REQUEST,
            Error::Unauthorized => StatusCode::UNAUTHORIZED,
            Error::Forbidden
            | Error::TeamRequired
            | Error::AdminTeamRequired
            | Error::PerUserLimit
            | Error::PerTeamLimit
            | Error::MaxAttemptsReached
            | Error::WrongFlag
            | Error::IncorrectLocation
            | Error::CtfNotStarted
            | Error::CtfEnded => StatusCode::FORBIDDEN,
            Error::ChallengeNotFound
            | Error::InstanceNotFound
            | Error::HintNotFound
            | Error::Runtime(RuntimeError::NotFound(_))
            | Error::ObjectStore(ObjectStoreError::NotFound(_)) => StatusCode::NOT_FOUND,
            Error::AlreadySolved | Error::FlagAlreadySubmitted => StatusCode::CONFLICT,
            Error::CooldownActive { .. } => too_early(),
            Error::NoFreePorts
            | Error::PortConflict(_)
            | Error::QueueFull
            | Error::Runtime(RuntimeError::Unavailable(_))
            | Error::Runtime(RuntimeError::PortBindFailed(_)) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the error detail may be shown to the caller.
    ///
    /// Build failures carry the daemon's message; everything mapped to
    /// `internal_error` stays opaque.
    pub fn public_message(&self) -> Option<String> {
        match self {
            Error::Runtime(RuntimeError::BuildFailed(msg)) => Some(msg.clone()),
            Error::Runtime(RuntimeError::Unavailable(_)) => {
                Some("container runtime is unavailable".to_string())
            }
            Error::InvalidInput(msg) => Some(msg.clone()),
            Error::Descriptor(e) => Some(e.to_string()),
            _ => None,
        }
    }
}

fn too_early() -> StatusCode {
    StatusCode::from_u16(425).unwrap_or(StatusCode::FORBIDDEN)
}

/// Result type using pta-core Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_errors_are_forbidden() {
        assert_eq!(Error::PerTeamLimit.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            Error::PerTeamLimit.error_code(),
            "max_instances_by_team_reached"
        );
        assert_eq!(
            Error::PerUserLimit.error_code(),
            "max_instances_by_user_reached"
        );
    }

    #[test]
    fn test_cooldown_maps_to_too_early() {
        let err = Error::CooldownActive {
            remaining_seconds: 15,
        };
        assert_eq!(err.status().as_u16(), 425);
        assert_eq!(err.error_code(), "instance_cooldown_not_elapsed");
    }

    #[test]
    fn test_runtime_errors() {
        let err = Error::from(RuntimeError::Unavailable("dial unix".into()));
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.error_code(), "docker_unavailable");

        let err = Error::from(RuntimeError::BuildFailed("COPY failed".into()));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.error_code(), "docker_build_failed");
        assert_eq!(err.public_message().as_deref(), Some("COPY failed"));
    }

    #[test]
    fn test_internal_errors_are_opaque() {
        let err = Error::Internal("connection reset at /var/lib/x".into());
        assert_eq!(err.error_code(), "internal_error");
        assert!(err.public_message().is_none());
    }

    #[test]
    fn test_solve_conflicts() {
        assert_eq!(Error::AlreadySolved.status(), StatusCode::CONFLICT);
        assert_eq!(Error::FlagAlreadySubmitted.status(), StatusCode::CONFLICT);
        assert_eq!(Error::WrongFlag.status(), StatusCode::FORBIDDEN);
    }
}
