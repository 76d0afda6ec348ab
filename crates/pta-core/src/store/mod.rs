// Copyright (C) 2025 pwnthemall contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interface and backends.
//!
//! Every service reaches the database through [`Store`]. Multi-row mutations
//! (challenge reconciliation, instance creation, solve recording,
//! recalculation) are single trait calls so each backend can make them atomic.

pub mod memory;
pub mod postgres;

pub use self::memory::MemoryStore;
pub use self::postgres::PostgresStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::models::{
    Challenge, ChallengeSync, DecayFormula, DockerConfig, FirstBlood, Flag, GeoSpec, Hint, HintPurchase,
    Instance, InstanceFailure, InstanceLimits, InstanceStatus, InstanceSummary, NewInstance,
    NewSubmission, RecordedSolve, Solve, SolveEntry, Submission, User,
};
use crate::scoring::Recalculation;

/// Outcome of an instance insert.
#[derive(Debug, Clone, PartialEq)]
pub enum InstanceInsert {
    /// Row inserted.
    Created(Instance),
    /// The team already had an instance for the challenge; nothing was written.
    Existing(Instance),
}

/// A challenge removed by the ingestor, with the instances that went with it.
#[derive(Debug, Clone, PartialEq)]
pub struct DeletedChallenge {
    /// The removed row.
    pub challenge: Challenge,
    /// Instances detached from it.
    pub instances: Vec<Instance>,
}

/// Persistence interface used by the services.
#[allow(missing_docs)]
#[async_trait]
pub trait Store: Send + Sync {
    /// Cheap connectivity check.
    async fn ping(&self) -> Result<()>;

    // ---- decay formulas --------------------------------------------------

    async fn decay_formula(&self, id: i32) -> Result<Option<DecayFormula>>;

    async fn decay_formula_by_name(&self, name: &str) -> Result<Option<DecayFormula>>;

    // ---- challenges ------------------------------------------------------

    async fn challenge(&self, id: i32) -> Result<Option<Challenge>>;

    async fn challenge_by_slug(&self, slug: &str) -> Result<Option<Challenge>>;

    async fn list_challenges(&self) -> Result<Vec<Challenge>>;

    /// Upsert the challenge and replace its flags, hints and geo spec in one
    /// transaction.
    async fn sync_challenge(&self, sync: &ChallengeSync) -> Result<Challenge>;

    /// Delete a challenge by slug. Dependent rows cascade.
    async fn delete_challenge_by_slug(&self, slug: &str) -> Result<Option<DeletedChallenge>>;

    async fn set_cover_img(&self, challenge_id: i32, cover_img: Option<&str>) -> Result<()>;

    async fn flags(&self, challenge_id: i32) -> Result<Vec<Flag>>;

    async fn geo_spec(&self, challenge_id: i32) -> Result<Option<GeoSpec>>;

    async fn hints_for_challenge(&self, challenge_id: i32) -> Result<Vec<Hint>>;

    // ---- users -----------------------------------------------------------

    async fn user(&self, id: i32) -> Result<Option<User>>;

    async fn team_name(&self, team_id: i32) -> Result<Option<String>>;

    async fn record_user_ip(&self, user_id: i32, ip: &str, at: DateTime<Utc>) -> Result<()>;

    /// Distinct IPs any member of the team authenticated from.
    async fn team_ips(&self, team_id: i32) -> Result<Vec<String>>;

    // ---- docker config ---------------------------------------------------

    async fn docker_config(&self) -> Result<DockerConfig>;

    async fn save_docker_config(&self, config: &DockerConfig) -> Result<()>;

    // ---- instances -------------------------------------------------------

    async fn instance(&self, id: i32) -> Result<Option<Instance>>;

    async fn instance_for(&self, team_id: i32, challenge_id: i32) -> Result<Option<Instance>>;

    async fn count_team_instances(&self, team_id: i32) -> Result<i64>;

    async fn count_user_instances(&self, user_id: i32) -> Result<i64>;

    /// Insert an instance, enforcing `(team, challenge)` uniqueness, the caps
    /// and host-port uniqueness atomically.
    ///
    /// Fails with `PerTeamLimit`, `PerUserLimit` or `PortConflict`.
    async fn create_instance(
        &self,
        instance: &NewInstance,
        limits: InstanceLimits,
    ) -> Result<InstanceInsert>;

    async fn set_instance_status(&self, id: i32, status: InstanceStatus) -> Result<()>;

    /// Swap an instance's reserved host ports. Fails with `PortConflict`.
    async fn set_instance_ports(&self, id: i32, ports: &[i32]) -> Result<()>;

    /// Delete an instance row. Returns the row only for the caller that
    /// actually deleted it.
    async fn delete_instance(&self, id: i32) -> Result<Option<Instance>>;

    /// Instances past `expires_at` that still hold resources.
    async fn expired_instances(&self, now: DateTime<Utc>) -> Result<Vec<Instance>>;

    async fn list_instances(&self) -> Result<Vec<Instance>>;

    /// Newest first, with display names.
    async fn list_instance_summaries(&self) -> Result<Vec<InstanceSummary>>;

    async fn last_stopped_at(
        &self,
        team_id: i32,
        challenge_id: i32,
    ) -> Result<Option<DateTime<Utc>>>;

    async fn upsert_cooldown(&self, team_id: i32, challenge_id: i32, at: DateTime<Utc>)
    -> Result<()>;

    async fn record_instance_failure(
        &self,
        team_id: i32,
        challenge_id: i32,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<()>;

    async fn instance_failure(
        &self,
        team_id: i32,
        challenge_id: i32,
    ) -> Result<Option<InstanceFailure>>;

    async fn clear_instance_failure(&self, team_id: i32, challenge_id: i32) -> Result<()>;

    // ---- submissions and solves -----------------------------------------

    async fn has_solved(&self, team_id: i32, challenge_id: i32) -> Result<bool>;

    /// Incorrect submissions by any member of the team.
    async fn count_failed_attempts(&self, team_id: i32, challenge_id: i32) -> Result<i64>;

    async fn find_submission(
        &self,
        user_id: i32,
        challenge_id: i32,
        value: &str,
    ) -> Result<Option<Submission>>;

    async fn insert_submission(&self, submission: &NewSubmission) -> Result<Submission>;

    /// Insert the team's solve at the next position, with its first-blood row
    /// when the position earns one. Fails with `AlreadySolved`.
    async fn record_solve(
        &self,
        challenge: &Challenge,
        team_id: i32,
        user_id: i32,
        at: DateTime<Utc>,
    ) -> Result<RecordedSolve>;

    async fn count_solves(&self, challenge_id: i32) -> Result<i64>;

    /// Oldest first.
    async fn solves_for_challenge(&self, challenge_id: i32) -> Result<Vec<SolveEntry>>;

    async fn team_solves(&self, team_id: i32) -> Result<Vec<Solve>>;

    async fn all_solves(&self) -> Result<Vec<Solve>>;

    async fn first_bloods(&self, challenge_id: i32) -> Result<Vec<FirstBlood>>;

    /// Replace every first blood and rewrite solve points in one transaction.
    async fn apply_recalculation(&self, recalculation: &Recalculation) -> Result<()>;

    // ---- hints -----------------------------------------------------------

    async fn hint(&self, id: i32) -> Result<Option<Hint>>;

    /// Activate inactive hints whose activation time has passed.
    async fn activate_due_hints(&self, now: DateTime<Utc>) -> Result<Vec<Hint>>;

    /// Record a purchase if `earned` minus the team's recorded spend covers
    /// the cost. The spend is read under the same lock as the insert.
    ///
    /// Fails with `HintAlreadyPurchased` or `InsufficientPoints`.
    async fn purchase_hint(&self, purchase: &HintPurchase, earned: i64) -> Result<()>;

    async fn team_hint_spend(&self, team_id: i32) -> Result<i64>;

    // ---- token blacklist -------------------------------------------------

    async fn blacklist_token(&self, jti: &str, expires_at: DateTime<Utc>) -> Result<()>;

    async fn load_blacklist(&self, now: DateTime<Utc>) -> Result<Vec<(String, DateTime<Utc>)>>;

    async fn purge_blacklist(&self, now: DateTime<Utc>) -> Result<u64>;
}

/// Reject a hint purchase the team cannot cover.
pub(crate) fn ensure_affordable(earned: i64, spent: i64, cost: i32) -> Result<()> {
    let required = i64::from(cost);
    let available = earned - spent;
    if available < required {
        return Err(Error::InsufficientPoints {
            required,
            available,
        });
    }
    Ok(())
}
