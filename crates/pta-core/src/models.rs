// Copyright (C) 2025 pwnthemall contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Domain entities read and written by the core.
//!
//! These are storage-agnostic; [`crate::store::postgres`] maps rows onto them
//! with explicit conversion functions.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Challenge kind; only `docker` and `compose` get instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeType {
    /// Flag only.
    Standard,
    /// Single container instance.
    Docker,
    /// Multi-container compose project.
    Compose,
    /// Location answer.
    Geo,
}

impl ChallengeType {
    /// Database / wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChallengeType::Standard => "standard",
            ChallengeType::Docker => "docker",
            ChallengeType::Compose => "compose",
            ChallengeType::Geo => "geo",
        }
    }

    /// Whether per-team instances can be started for this type.
    pub fn supports_instances(&self) -> bool {
        matches!(self, ChallengeType::Docker | ChallengeType::Compose)
    }
}

impl fmt::Display for ChallengeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChallengeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "standard" => Ok(ChallengeType::Standard),
            "docker" => Ok(ChallengeType::Docker),
            "compose" => Ok(ChallengeType::Compose),
            "geo" => Ok(ChallengeType::Geo),
            other => Err(format!("unknown challenge type: {}", other)),
        }
    }
}

/// Decay curve family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecayKind {
    /// Points never move.
    Fixed,
    /// Logarithmic decay bounded by `min_points`.
    Logarithmic,
}

impl DecayKind {
    /// Database name.
    pub fn as_str(&self) -> &'static str {
        match self {
            DecayKind::Fixed => "fixed",
            DecayKind::Logarithmic => "logarithmic",
        }
    }
}

impl FromStr for DecayKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fixed" => Ok(DecayKind::Fixed),
            "logarithmic" => Ok(DecayKind::Logarithmic),
            other => Err(format!("unknown decay type: {}", other)),
        }
    }
}

/// Named decay formula.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecayFormula {
    /// Row id.
    pub id: i32,
    /// Unique display name, referenced by descriptors.
    pub name: String,
    /// Curve family.
    pub kind: DecayKind,
    /// Solves per decay step.
    pub step: i32,
    /// Floor the decayed value never goes below.
    pub min_points: i32,
}

impl DecayFormula {
    /// Name of the formula assigned when a descriptor does not pick one.
    pub const DEFAULT_NAME: &'static str = "No Decay";

    /// A fixed formula, used when a challenge has no formula at all.
    pub fn fixed() -> Self {
        Self {
            id: 0,
            name: Self::DEFAULT_NAME.to_string(),
            kind: DecayKind::Fixed,
            step: 0,
            min_points: 0,
        }
    }
}

/// A challenge as materialized by the ingestor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Challenge {
    /// Row id.
    pub id: i32,
    /// Object store directory name.
    pub slug: String,
    /// Display name.
    pub name: String,
    /// Markdown body.
    pub description: String,
    /// Category label.
    pub category: String,
    /// Difficulty label.
    pub difficulty: String,
    /// Kind of challenge.
    pub challenge_type: ChallengeType,
    /// Author credit.
    pub author: String,
    /// Hidden from non-admins.
    pub hidden: bool,
    /// Base points before decay.
    pub points: i32,
    /// Assigned decay formula.
    pub decay_formula_id: Option<i32>,
    /// Whether positional bonuses apply.
    pub enable_first_blood: bool,
    /// Bonus per solve position.
    pub first_blood_bonuses: Vec<i32>,
    /// Badge per solve position.
    pub first_blood_badges: Vec<String>,
    /// Container ports to expose.
    pub ports: Vec<i32>,
    /// Connection templates shown to players.
    pub connection_info: Vec<String>,
    /// Wrong answers allowed per team; 0 is unlimited.
    pub max_attempts: i32,
    /// Name of a challenge that must be solved first.
    pub depends_on: Option<String>,
    /// Downloadable file names under the slug directory.
    pub files: Vec<String>,
    /// Cover image file name.
    pub cover_img: Option<String>,
    /// Emoji shown next to the name.
    pub emoji: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last sync time.
    pub updated_at: DateTime<Utc>,
}

/// Everything the ingestor reconciles for one challenge in a single transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct ChallengeSync {
    /// Object store directory name.
    pub slug: String,
    /// Display name.
    pub name: String,
    /// Markdown body.
    pub description: String,
    /// Category label.
    pub category: String,
    /// Difficulty label.
    pub difficulty: String,
    /// Kind of challenge.
    pub challenge_type: ChallengeType,
    /// Author credit.
    pub author: String,
    /// Hidden from non-admins.
    pub hidden: bool,
    /// Base points before decay.
    pub points: i32,
    /// `Some` replaces the assigned formula; `None` keeps the current one.
    pub decay_formula_id: Option<i32>,
    /// Whether positional bonuses apply.
    pub enable_first_blood: bool,
    /// Bonus per solve position.
    pub first_blood_bonuses: Vec<i32>,
    /// Badge per solve position.
    pub first_blood_badges: Vec<String>,
    /// Container ports to expose.
    pub ports: Vec<i32>,
    /// Connection templates shown to players.
    pub connection_info: Vec<String>,
    /// Wrong answers allowed per team; 0 is unlimited.
    pub max_attempts: i32,
    /// Name of a challenge that must be solved first.
    pub depends_on: Option<String>,
    /// Downloadable file names under the slug directory.
    pub files: Vec<String>,
    /// Cover image file name.
    pub cover_img: Option<String>,
    /// Emoji shown next to the name.
    pub emoji: Option<String>,
    /// Encoded flag values (SHA-256 hex or `geo:` spec), never plaintext.
    pub flags: Vec<String>,
    /// Hints, matched to stored rows by position.
    pub hints: Vec<NewHint>,
    /// Target for location challenges.
    pub geo: Option<GeoSpec>,
}

/// Stored acceptable answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flag {
    /// Row id.
    pub id: i32,
    /// Owning challenge.
    pub challenge_id: i32,
    /// Encoded answer.
    pub value: String,
}

/// Target and tolerance for a location challenge.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoSpec {
    /// Target latitude in degrees.
    pub target_lat: f64,
    /// Target longitude in degrees.
    pub target_lng: f64,
    /// Accepted distance from the target.
    pub radius_km: f64,
}

/// Platform role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Regular player.
    Member,
    /// Operator.
    Admin,
}

impl Role {
    /// Database name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Member => "member",
            Role::Admin => "admin",
        }
    }

    /// Anything other than `admin` is a member.
    pub fn parse(s: &str) -> Self {
        if s.eq_ignore_ascii_case("admin") {
            Role::Admin
        } else {
            Role::Member
        }
    }
}

/// Authenticated caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    /// Row id.
    pub id: i32,
    /// Login name.
    pub username: String,
    /// Platform role.
    pub role: Role,
    /// Team membership.
    pub team_id: Option<i32>,
}

impl User {
    /// Whether the user holds the admin role.
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

/// A team's first correct answer for a challenge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Solve {
    /// Solving team.
    pub team_id: i32,
    /// Solved challenge.
    pub challenge_id: i32,
    /// Member who submitted the flag.
    pub user_id: i32,
    /// Points at solve time, bonus included.
    pub points: i32,
    /// Solve time.
    pub created_at: DateTime<Utc>,
}

/// Solve plus display names, as listed per challenge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolveEntry {
    /// The solve row.
    #[serde(flatten)]
    pub solve: Solve,
    /// Submitting member.
    pub username: String,
    /// Solving team.
    pub team_name: String,
}

/// Every attempt, correct or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    /// Row id.
    pub id: i32,
    /// Submitting user.
    pub user_id: i32,
    /// Target challenge.
    pub challenge_id: i32,
    /// Submitted value; hashed when correct.
    pub value: String,
    /// Whether it matched a flag.
    pub is_correct: bool,
    /// Submission time.
    pub created_at: DateTime<Utc>,
}

/// Submission about to be inserted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSubmission {
    /// Submitting user.
    pub user_id: i32,
    /// Target challenge.
    pub challenge_id: i32,
    /// Submitted value; hashed when correct.
    pub value: String,
    /// Whether it matched a flag.
    pub is_correct: bool,
    /// Submission time.
    pub created_at: DateTime<Utc>,
}

/// Positional bonus record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirstBlood {
    /// Solved challenge.
    pub challenge_id: i32,
    /// Solving team.
    pub team_id: i32,
    /// Submitting member.
    pub user_id: i32,
    /// Zero-based solve position.
    pub position: i32,
    /// Bonus points awarded.
    pub bonus: i32,
    /// Badge awarded.
    pub badge: String,
    /// Award time.
    pub created_at: DateTime<Utc>,
}

/// Result of inserting a solve.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedSolve {
    /// Inserted solve.
    pub solve: Solve,
    /// Zero-based position among solves of the challenge.
    pub position: i64,
    /// Bonus record, when one was earned.
    pub first_blood: Option<FirstBlood>,
}

/// Recomputed points for one solve.
#[derive(Debug, Clone, PartialEq)]
pub struct SolveUpdate {
    /// Solving team.
    pub team_id: i32,
    /// Solved challenge.
    pub challenge_id: i32,
    /// Recomputed points.
    pub points: i32,
}

/// Instance lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    /// Compose project being brought up in the background.
    Starting,
    /// Up and reachable.
    Running,
    /// Stopped by a player or admin.
    Stopped,
    /// Past its expiry time.
    Expired,
}

impl InstanceStatus {
    /// Database / wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Starting => "starting",
            InstanceStatus::Running => "running",
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starting" => Ok(InstanceStatus::Starting),
            "running" => Ok(InstanceStatus::Running),
            "stopped" => Ok(InstanceStatus::Stopped),
            "expired" => Ok(InstanceStatus::Expired),
            other => Err(format!("unknown instance status: {}", other)),
        }
    }
}

/// A per-team deployment of a challenge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    /// Row id.
    pub id: i32,
    /// Container name or compose project name.
    pub name: String,
    /// Member who started it.
    pub user_id: i32,
    /// Owning team.
    pub team_id: i32,
    /// Deployed challenge.
    pub challenge_id: i32,
    /// Allocated host ports.
    pub ports: Vec<i32>,
    /// Lifecycle state.
    pub status: InstanceStatus,
    /// Start time.
    pub created_at: DateTime<Utc>,
    /// Time after which the sweeper stops it.
    pub expires_at: DateTime<Utc>,
}

impl Instance {
    /// Whether `now` is past the expiry time.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

/// Instance row about to be inserted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewInstance {
    /// Container name or compose project name.
    pub name: String,
    /// Member who started it.
    pub user_id: i32,
    /// Owning team.
    pub team_id: i32,
    /// Deployed challenge.
    pub challenge_id: i32,
    /// Allocated host ports.
    pub ports: Vec<i32>,
    /// Lifecycle state.
    pub status: InstanceStatus,
    /// Start time.
    pub created_at: DateTime<Utc>,
    /// Time after which the sweeper stops it.
    pub expires_at: DateTime<Utc>,
}

/// Caps applied while inserting an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceLimits {
    /// Live instances allowed per user.
    pub per_user: i32,
    /// Live instances allowed per team.
    pub per_team: i32,
}

/// Instance joined with display fields for admin listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSummary {
    /// The instance row.
    #[serde(flatten)]
    pub instance: Instance,
    /// Starting member.
    pub username: String,
    /// Owning team.
    pub team_name: String,
    /// Deployed challenge.
    pub challenge_name: String,
    /// Kind of deployment.
    pub challenge_type: ChallengeType,
}

/// Reason a background start failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceFailure {
    /// Error message from the runtime.
    pub reason: String,
    /// Failure time.
    pub failed_at: DateTime<Utc>,
}

/// Singleton runtime policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DockerConfig {
    /// Prefix for challenge image tags.
    pub image_prefix: String,
    /// Memory cap per container.
    pub max_mem_mib: i64,
    /// CPU cap per container.
    pub max_cpu: f64,
    /// Live instances allowed per user.
    pub instances_by_user: i32,
    /// Live instances allowed per team.
    pub instances_by_team: i32,
    /// Minutes; 0 means 24 hours.
    pub instance_timeout_minutes: i32,
    /// 0 disables the cooldown.
    pub cooldown_seconds: i32,
    /// OCI runtime passed to containers (`runc`, `runsc`, ...).
    pub runtime: String,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            image_prefix: "pta-".to_string(),
            max_mem_mib: 256,
            max_cpu: 0.5,
            instances_by_user: 1,
            instances_by_team: 3,
            instance_timeout_minutes: 60,
            cooldown_seconds: 0,
            runtime: "runc".to_string(),
        }
    }
}

impl DockerConfig {
    /// Instance lifetime.
    pub fn instance_lifetime(&self) -> chrono::Duration {
        if self.instance_timeout_minutes <= 0 {
            chrono::Duration::hours(24)
        } else {
            chrono::Duration::minutes(i64::from(self.instance_timeout_minutes))
        }
    }

    /// Memory cap in bytes.
    pub fn memory_bytes(&self) -> i64 {
        self.max_mem_mib.saturating_mul(1024 * 1024)
    }

    /// CPU cap in nano-CPUs.
    pub fn nano_cpus(&self) -> i64 {
        (self.max_cpu * 1_000_000_000.0) as i64
    }

    /// Image tag for a challenge.
    pub fn image_tag(&self, slug: &str) -> String {
        format!("{}{}", self.image_prefix, slug)
    }
}

/// Hint as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hint {
    /// Row id.
    pub id: i32,
    /// Owning challenge.
    pub challenge_id: i32,
    /// Title shown before purchase.
    pub title: String,
    /// Revealed text.
    pub content: String,
    /// Price in points.
    pub cost: i32,
    /// Whether it can be bought.
    pub is_active: bool,
    /// Time the scheduler activates it.
    pub auto_active_at: Option<DateTime<Utc>>,
}

/// Hint about to be inserted by the ingestor.
#[derive(Debug, Clone, PartialEq)]
pub struct NewHint {
    /// Title shown before purchase.
    pub title: String,
    /// Revealed text.
    pub content: String,
    /// Price in points.
    pub cost: i32,
    /// Whether it can be bought.
    pub is_active: bool,
    /// Time the scheduler activates it.
    pub auto_active_at: Option<DateTime<Utc>>,
}

/// A team's hint purchase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HintPurchase {
    /// Buying team.
    pub team_id: i32,
    /// Bought hint.
    pub hint_id: i32,
    /// Buying member.
    pub user_id: i32,
    /// Points spent.
    pub cost: i32,
    /// Purchase time.
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_challenge_type_parse() {
        assert_eq!("docker".parse::<ChallengeType>().unwrap(), ChallengeType::Docker);
        assert_eq!("".parse::<ChallengeType>().unwrap(), ChallengeType::Standard);
        assert_eq!(" Compose ".parse::<ChallengeType>().unwrap(), ChallengeType::Compose);
        assert!("kubernetes".parse::<ChallengeType>().is_err());
        assert!(ChallengeType::Compose.supports_instances());
        assert!(!ChallengeType::Geo.supports_instances());
    }

    #[test]
    fn test_instance_lifetime() {
        let mut cfg = DockerConfig::default();
        assert_eq!(cfg.instance_lifetime(), chrono::Duration::minutes(60));
        cfg.instance_timeout_minutes = 0;
        assert_eq!(cfg.instance_lifetime(), chrono::Duration::hours(24));
    }

    #[test]
    fn test_resource_caps() {
        let cfg = DockerConfig {
            max_mem_mib: 512,
            max_cpu: 1.5,
            ..Default::default()
        };
        assert_eq!(cfg.memory_bytes(), 512 * 1024 * 1024);
        assert_eq!(cfg.nano_cpus(), 1_500_000_000);
        assert_eq!(cfg.image_tag("web-1"), "pta-web-1");
    }
}
