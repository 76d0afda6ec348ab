// Copyright (C) 2025 pwnthemall contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL store.
//!
//! Every operation is a free function over a `PgPool` so callers that only
//! hold a pool can use them directly; [`PostgresStore`] delegates to them.
//! Multi-row writes run in one transaction. Quota and position checks are
//! serialized with transaction-scoped advisory locks.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};

use super::{DeletedChallenge, InstanceInsert, Store, ensure_affordable};
use crate::error::{Error, Result};
use crate::models::{
    Challenge, ChallengeSync, DecayFormula, DockerConfig, FirstBlood, Flag, GeoSpec, Hint,
    HintPurchase, Instance, InstanceFailure, InstanceLimits, InstanceStatus, InstanceSummary,
    NewInstance, NewSubmission, RecordedSolve, Role, Solve, SolveEntry, Submission, User,
};
use crate::scoring::{self, Recalculation};

/// Advisory lock namespaces (first key of `pg_advisory_xact_lock(int, int)`).
const LOCK_SOLVES: i32 = 1;
const LOCK_TEAM_INSTANCES: i32 = 2;
const LOCK_USER_INSTANCES: i32 = 3;
const LOCK_HINT_SPEND: i32 = 4;

/// PostgreSQL-backed store.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a store over an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

async fn advisory_lock(tx: &mut Transaction<'_, Postgres>, namespace: i32, key: i32) -> Result<()> {
    sqlx::query("SELECT pg_advisory_xact_lock($1, $2)")
        .bind(namespace)
        .bind(key)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

// ============================================================================
// Row Types
// ============================================================================

#[derive(Debug, sqlx::FromRow)]
struct DecayFormulaRow {
    id: i32,
    name: String,
    kind: String,
    step: i32,
    min_points: i32,
}

impl TryFrom<DecayFormulaRow> for DecayFormula {
    type Error = Error;

    fn try_from(row: DecayFormulaRow) -> Result<Self> {
        Ok(DecayFormula {
            id: row.id,
            name: row.name,
            kind: row.kind.parse().map_err(Error::Internal)?,
            step: row.step,
            min_points: row.min_points,
        })
    }
}

const CHALLENGE_COLUMNS: &str = r#"
    id, slug, name, description, category, difficulty, challenge_type, author, hidden,
    points, decay_formula_id, enable_first_blood, first_blood_bonuses, first_blood_badges,
    ports, connection_info, max_attempts, depends_on, files, cover_img, emoji,
    created_at, updated_at
"#;

#[derive(Debug, sqlx::FromRow)]
struct ChallengeRow {
    id: i32,
    slug: String,
    name: String,
    description: String,
    category: String,
    difficulty: String,
    challenge_type: String,
    author: String,
    hidden: bool,
    points: i32,
    decay_formula_id: Option<i32>,
    enable_first_blood: bool,
    first_blood_bonuses: Vec<i32>,
    first_blood_badges: Vec<String>,
    ports: Vec<i32>,
    connection_info: Vec<String>,
    max_attempts: i32,
    depends_on: Option<String>,
    files: Vec<String>,
    cover_img: Option<String>,
    emoji: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ChallengeRow> for Challenge {
    type Error = Error;

    fn try_from(row: ChallengeRow) -> Result<Self> {
        Ok(Challenge {
            id: row.id,
            slug: row.slug,
            name: row.name,
            description: row.description,
            category: row.category,
            difficulty: row.difficulty,
            challenge_type: row.challenge_type.parse().map_err(Error::Internal)?,
            author: row.author,
            hidden: row.hidden,
            points: row.points,
            decay_formula_id: row.decay_formula_id,
            enable_first_blood: row.enable_first_blood,
            first_blood_bonuses: row.first_blood_bonuses,
            first_blood_badges: row.first_blood_badges,
            ports: row.ports,
            connection_info: row.connection_info,
            max_attempts: row.max_attempts,
            depends_on: row.depends_on,
            files: row.files,
            cover_img: row.cover_img,
            emoji: row.emoji,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const INSTANCE_COLUMNS: &str =
    "id, name, user_id, team_id, challenge_id, ports, status, created_at, expires_at";

#[derive(Debug, sqlx::FromRow)]
struct InstanceRow {
    id: i32,
    name: String,
    user_id: i32,
    team_id: i32,
    challenge_id: i32,
    ports: Vec<i32>,
    status: String,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl TryFrom<InstanceRow> for Instance {
    type Error = Error;

    fn try_from(row: InstanceRow) -> Result<Self> {
        Ok(Instance {
            id: row.id,
            name: row.name,
            user_id: row.user_id,
            team_id: row.team_id,
            challenge_id: row.challenge_id,
            ports: row.ports,
            status: row.status.parse().map_err(Error::Internal)?,
            created_at: row.created_at,
            expires_at: row.expires_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct HintRow {
    id: i32,
    challenge_id: i32,
    title: String,
    content: String,
    cost: i32,
    is_active: bool,
    auto_active_at: Option<DateTime<Utc>>,
}

impl From<HintRow> for Hint {
    fn from(row: HintRow) -> Self {
        Hint {
            id: row.id,
            challenge_id: row.challenge_id,
            title: row.title,
            content: row.content,
            cost: row.cost,
            is_active: row.is_active,
            auto_active_at: row.auto_active_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SolveRow {
    team_id: i32,
    challenge_id: i32,
    user_id: i32,
    points: i32,
    created_at: DateTime<Utc>,
}

impl From<SolveRow> for Solve {
    fn from(row: SolveRow) -> Self {
        Solve {
            team_id: row.team_id,
            challenge_id: row.challenge_id,
            user_id: row.user_id,
            points: row.points,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SubmissionRow {
    id: i32,
    user_id: i32,
    challenge_id: i32,
    value: String,
    is_correct: bool,
    created_at: DateTime<Utc>,
}

impl From<SubmissionRow> for Submission {
    fn from(row: SubmissionRow) -> Self {
        Submission {
            id: row.id,
            user_id: row.user_id,
            challenge_id: row.challenge_id,
            value: row.value,
            is_correct: row.is_correct,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct FirstBloodRow {
    challenge_id: i32,
    team_id: i32,
    user_id: i32,
    position: i32,
    bonus: i32,
    badge: String,
    created_at: DateTime<Utc>,
}

impl From<FirstBloodRow> for FirstBlood {
    fn from(row: FirstBloodRow) -> Self {
        FirstBlood {
            challenge_id: row.challenge_id,
            team_id: row.team_id,
            user_id: row.user_id,
            position: row.position,
            bonus: row.bonus,
            badge: row.badge,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct DockerConfigRow {
    image_prefix: String,
    max_mem_mib: i64,
    max_cpu: f64,
    instances_by_user: i32,
    instances_by_team: i32,
    instance_timeout_minutes: i32,
    cooldown_seconds: i32,
    runtime: String,
}

impl From<DockerConfigRow> for DockerConfig {
    fn from(row: DockerConfigRow) -> Self {
        DockerConfig {
            image_prefix: row.image_prefix,
            max_mem_mib: row.max_mem_mib,
            max_cpu: row.max_cpu,
            instances_by_user: row.instances_by_user,
            instances_by_team: row.instances_by_team,
            instance_timeout_minutes: row.instance_timeout_minutes,
            cooldown_seconds: row.cooldown_seconds,
            runtime: row.runtime,
        }
    }
}

// ============================================================================
// Decay Formulas
// ============================================================================

/// Load a decay formula by id.
pub async fn get_decay_formula(pool: &PgPool, id: i32) -> Result<Option<DecayFormula>> {
    sqlx::query_as::<_, DecayFormulaRow>(
        "SELECT id, name, kind, step, min_points FROM decay_formulas WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?
    .map(DecayFormula::try_from)
    .transpose()
}

/// Load a decay formula by its unique name.
pub async fn get_decay_formula_by_name(pool: &PgPool, name: &str) -> Result<Option<DecayFormula>> {
    sqlx::query_as::<_, DecayFormulaRow>(
        "SELECT id, name, kind, step, min_points FROM decay_formulas WHERE name = $1",
    )
    .bind(name)
    .fetch_optional(pool)
    .await?
    .map(DecayFormula::try_from)
    .transpose()
}

// ============================================================================
// Challenges
// ============================================================================

/// Load a challenge by id.
pub async fn get_challenge(pool: &PgPool, id: i32) -> Result<Option<Challenge>> {
    sqlx::query_as::<_, ChallengeRow>(&format!(
        "SELECT {} FROM challenges WHERE id = $1",
        CHALLENGE_COLUMNS
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?
    .map(Challenge::try_from)
    .transpose()
}

/// Load a challenge by slug.
pub async fn get_challenge_by_slug(pool: &PgPool, slug: &str) -> Result<Option<Challenge>> {
    sqlx::query_as::<_, ChallengeRow>(&format!(
        "SELECT {} FROM challenges WHERE slug = $1",
        CHALLENGE_COLUMNS
    ))
    .bind(slug)
    .fetch_optional(pool)
    .await?
    .map(Challenge::try_from)
    .transpose()
}

/// Every challenge, ordered by id.
pub async fn list_challenges(pool: &PgPool) -> Result<Vec<Challenge>> {
    sqlx::query_as::<_, ChallengeRow>(&format!(
        "SELECT {} FROM challenges ORDER BY id",
        CHALLENGE_COLUMNS
    ))
    .fetch_all(pool)
    .await?
    .into_iter()
    .map(Challenge::try_from)
    .collect()
}

/// Upsert a challenge and reconcile its flags, hints and geo spec.
///
/// A new challenge without a formula gets the default one; an existing
/// challenge keeps its formula unless the sync names one. Hints are updated
/// in place by position so purchases survive a re-sync.
pub async fn sync_challenge(pool: &PgPool, sync: &ChallengeSync) -> Result<Challenge> {
    let mut tx = pool.begin().await?;

    let row = sqlx::query_as::<_, ChallengeRow>(&format!(
        r#"
        INSERT INTO challenges (
            slug, name, description, category, difficulty, challenge_type, author, hidden,
            points, decay_formula_id, enable_first_blood, first_blood_bonuses,
            first_blood_badges, ports, connection_info, max_attempts, depends_on, files,
            emoji, created_at, updated_at
        )
        VALUES (
            $1, $2, $3, $4, $5, $6, $7, $8, $9,
            COALESCE($10, (SELECT id FROM decay_formulas WHERE name = $20)),
            $11, $12, $13, $14, $15, $16, $17, $18, $19, NOW(), NOW()
        )
        ON CONFLICT (slug) DO UPDATE SET
            name = EXCLUDED.name,
            description = EXCLUDED.description,
            category = EXCLUDED.category,
            difficulty = EXCLUDED.difficulty,
            challenge_type = EXCLUDED.challenge_type,
            author = EXCLUDED.author,
            hidden = EXCLUDED.hidden,
            points = EXCLUDED.points,
            decay_formula_id = COALESCE($10, challenges.decay_formula_id),
            enable_first_blood = EXCLUDED.enable_first_blood,
            first_blood_bonuses = EXCLUDED.first_blood_bonuses,
            first_blood_badges = EXCLUDED.first_blood_badges,
            ports = EXCLUDED.ports,
            connection_info = EXCLUDED.connection_info,
            max_attempts = EXCLUDED.max_attempts,
            depends_on = EXCLUDED.depends_on,
            files = EXCLUDED.files,
            emoji = EXCLUDED.emoji,
            updated_at = NOW()
        RETURNING {}
        "#,
        CHALLENGE_COLUMNS
    ))
    .bind(&sync.slug)
    .bind(&sync.name)
    .bind(&sync.description)
    .bind(&sync.category)
    .bind(&sync.difficulty)
    .bind(sync.challenge_type.as_str())
    .bind(&sync.author)
    .bind(sync.hidden)
    .bind(sync.points)
    .bind(sync.decay_formula_id)
    .bind(sync.enable_first_blood)
    .bind(&sync.first_blood_bonuses)
    .bind(&sync.first_blood_badges)
    .bind(&sync.ports)
    .bind(&sync.connection_info)
    .bind(sync.max_attempts)
    .bind(&sync.depends_on)
    .bind(&sync.files)
    .bind(&sync.emoji)
    .bind(DecayFormula::DEFAULT_NAME)
    .fetch_one(&mut *tx)
    .await?;
    let challenge = Challenge::try_from(row)?;

    sqlx::query("DELETE FROM flags WHERE challenge_id = $1")
        .bind(challenge.id)
        .execute(&mut *tx)
        .await?;
    for value in &sync.flags {
        sqlx::query("INSERT INTO flags (challenge_id, value) VALUES ($1, $2)")
            .bind(challenge.id)
            .bind(value)
            .execute(&mut *tx)
            .await?;
    }

    let current: Vec<i32> = sqlx::query_scalar(
        "SELECT id FROM hints WHERE challenge_id = $1 ORDER BY id FOR UPDATE",
    )
    .bind(challenge.id)
    .fetch_all(&mut *tx)
    .await?;
    for (idx, hint) in sync.hints.iter().enumerate() {
        match current.get(idx) {
            Some(id) => {
                sqlx::query(
                    r#"
                    UPDATE hints
                    SET title = $2, content = $3, cost = $4, is_active = $5, auto_active_at = $6
                    WHERE id = $1
                    "#,
                )
                .bind(id)
                .bind(&hint.title)
                .bind(&hint.content)
                .bind(hint.cost)
                .bind(hint.is_active)
                .bind(hint.auto_active_at)
                .execute(&mut *tx)
                .await?;
            }
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO hints (challenge_id, title, content, cost, is_active, auto_active_at)
                    VALUES ($1, $2, $3, $4, $5, $6)
                    "#,
                )
                .bind(challenge.id)
                .bind(&hint.title)
                .bind(&hint.content)
                .bind(hint.cost)
                .bind(hint.is_active)
                .bind(hint.auto_active_at)
                .execute(&mut *tx)
                .await?;
            }
        }
    }
    let stale: Vec<i32> = current.iter().skip(sync.hints.len()).copied().collect();
    if !stale.is_empty() {
        sqlx::query("DELETE FROM hints WHERE id = ANY($1)")
            .bind(&stale)
            .execute(&mut *tx)
            .await?;
    }

    match sync.geo {
        Some(geo) => {
            sqlx::query(
                r#"
                INSERT INTO geo_specs (challenge_id, target_lat, target_lng, radius_km)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (challenge_id) DO UPDATE SET
                    target_lat = EXCLUDED.target_lat,
                    target_lng = EXCLUDED.target_lng,
                    radius_km = EXCLUDED.radius_km
                "#,
            )
            .bind(challenge.id)
            .bind(geo.target_lat)
            .bind(geo.target_lng)
            .bind(geo.radius_km)
            .execute(&mut *tx)
            .await?;
        }
        None => {
            sqlx::query("DELETE FROM geo_specs WHERE challenge_id = $1")
                .bind(challenge.id)
                .execute(&mut *tx)
                .await?;
        }
    }

    tx.commit().await?;
    Ok(challenge)
}

/// Delete a challenge and return it with the instances that cascaded away.
pub async fn delete_challenge_by_slug(pool: &PgPool, slug: &str) -> Result<Option<DeletedChallenge>> {
    let mut tx = pool.begin().await?;

    let Some(row) = sqlx::query_as::<_, ChallengeRow>(&format!(
        "SELECT {} FROM challenges WHERE slug = $1 FOR UPDATE",
        CHALLENGE_COLUMNS
    ))
    .bind(slug)
    .fetch_optional(&mut *tx)
    .await?
    else {
        return Ok(None);
    };
    let challenge = Challenge::try_from(row)?;

    let instances = sqlx::query_as::<_, InstanceRow>(&format!(
        "SELECT {} FROM instances WHERE challenge_id = $1",
        INSTANCE_COLUMNS
    ))
    .bind(challenge.id)
    .fetch_all(&mut *tx)
    .await?
    .into_iter()
    .map(Instance::try_from)
    .collect::<Result<Vec<_>>>()?;

    sqlx::query("DELETE FROM challenges WHERE id = $1")
        .bind(challenge.id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(Some(DeletedChallenge {
        challenge,
        instances,
    }))
}

/// Set or clear the processed cover image key.
pub async fn set_cover_img(pool: &PgPool, challenge_id: i32, cover_img: Option<&str>) -> Result<()> {
    let result = sqlx::query("UPDATE challenges SET cover_img = $2 WHERE id = $1")
        .bind(challenge_id)
        .bind(cover_img)
        .execute(pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(Error::ChallengeNotFound);
    }
    Ok(())
}

/// Stored flag values for a challenge.
pub async fn get_flags(pool: &PgPool, challenge_id: i32) -> Result<Vec<Flag>> {
    let rows: Vec<(i32, i32, String)> = sqlx::query_as(
        "SELECT id, challenge_id, value FROM flags WHERE challenge_id = $1 ORDER BY id",
    )
    .bind(challenge_id)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|(id, challenge_id, value)| Flag {
            id,
            challenge_id,
            value,
        })
        .collect())
}

/// Geo target of a challenge.
pub async fn get_geo_spec(pool: &PgPool, challenge_id: i32) -> Result<Option<GeoSpec>> {
    let row: Option<(f64, f64, f64)> = sqlx::query_as(
        "SELECT target_lat, target_lng, radius_km FROM geo_specs WHERE challenge_id = $1",
    )
    .bind(challenge_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|(target_lat, target_lng, radius_km)| GeoSpec {
        target_lat,
        target_lng,
        radius_km,
    }))
}

/// Hints of a challenge, in declaration order.
pub async fn get_hints_for_challenge(pool: &PgPool, challenge_id: i32) -> Result<Vec<Hint>> {
    let rows = sqlx::query_as::<_, HintRow>(
        r#"
        SELECT id, challenge_id, title, content, cost, is_active, auto_active_at
        FROM hints
        WHERE challenge_id = $1
        ORDER BY id
        "#,
    )
    .bind(challenge_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(Hint::from).collect())
}

// ============================================================================
// Users
// ============================================================================

/// Load a user.
pub async fn get_user(pool: &PgPool, id: i32) -> Result<Option<User>> {
    let row: Option<(i32, String, String, Option<i32>)> =
        sqlx::query_as("SELECT id, username, role, team_id FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await?;
    Ok(row.map(|(id, username, role, team_id)| User {
        id,
        username,
        role: Role::parse(&role),
        team_id,
    }))
}

/// Team display name.
pub async fn get_team_name(pool: &PgPool, team_id: i32) -> Result<Option<String>> {
    Ok(sqlx::query_scalar("SELECT name FROM teams WHERE id = $1")
        .bind(team_id)
        .fetch_optional(pool)
        .await?)
}

/// Remember that a user authenticated from `ip`.
pub async fn record_user_ip(pool: &PgPool, user_id: i32, ip: &str, at: DateTime<Utc>) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO user_ips (user_id, ip, last_seen)
        VALUES ($1, $2, $3)
        ON CONFLICT (user_id, ip) DO UPDATE SET last_seen = EXCLUDED.last_seen
        "#,
    )
    .bind(user_id)
    .bind(ip)
    .bind(at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Distinct IPs seen for any member of a team.
pub async fn get_team_ips(pool: &PgPool, team_id: i32) -> Result<Vec<String>> {
    Ok(sqlx::query_scalar(
        r#"
        SELECT DISTINCT ui.ip
        FROM user_ips ui
        JOIN users u ON u.id = ui.user_id
        WHERE u.team_id = $1
        ORDER BY ui.ip
        "#,
    )
    .bind(team_id)
    .fetch_all(pool)
    .await?)
}

// ============================================================================
// Docker Config
// ============================================================================

/// The singleton runtime policy, or defaults when the row is missing.
pub async fn get_docker_config(pool: &PgPool) -> Result<DockerConfig> {
    let row = sqlx::query_as::<_, DockerConfigRow>(
        r#"
        SELECT image_prefix, max_mem_mib, max_cpu, instances_by_user, instances_by_team,
               instance_timeout_minutes, cooldown_seconds, runtime
        FROM docker_config
        WHERE id = 1
        "#,
    )
    .fetch_optional(pool)
    .await?;
    Ok(row.map(DockerConfig::from).unwrap_or_default())
}

/// Overwrite the runtime policy.
pub async fn save_docker_config(pool: &PgPool, config: &DockerConfig) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO docker_config (
            id, image_prefix, max_mem_mib, max_cpu, instances_by_user, instances_by_team,
            instance_timeout_minutes, cooldown_seconds, runtime
        )
        VALUES (1, $1, $2, $3, $4, $5, $6, $7, $8)
        ON CONFLICT (id) DO UPDATE SET
            image_prefix = EXCLUDED.image_prefix,
            max_mem_mib = EXCLUDED.max_mem_mib,
            max_cpu = EXCLUDED.max_cpu,
            instances_by_user = EXCLUDED.instances_by_user,
            instances_by_team = EXCLUDED.instances_by_team,
            instance_timeout_minutes = EXCLUDED.instance_timeout_minutes,
            cooldown_seconds = EXCLUDED.cooldown_seconds,
            runtime = EXCLUDED.runtime
        "#,
    )
    .bind(&config.image_prefix)
    .bind(config.max_mem_mib)
    .bind(config.max_cpu)
    .bind(config.instances_by_user)
    .bind(config.instances_by_team)
    .bind(config.instance_timeout_minutes)
    .bind(config.cooldown_seconds)
    .bind(&config.runtime)
    .execute(pool)
    .await?;
    Ok(())
}

// ============================================================================
// Instances
// ============================================================================

/// Load an instance.
pub async fn get_instance(pool: &PgPool, id: i32) -> Result<Option<Instance>> {
    sqlx::query_as::<_, InstanceRow>(&format!(
        "SELECT {} FROM instances WHERE id = $1",
        INSTANCE_COLUMNS
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?
    .map(Instance::try_from)
    .transpose()
}

/// The team's instance for a challenge.
pub async fn get_instance_for(pool: &PgPool, team_id: i32, challenge_id: i32) -> Result<Option<Instance>> {
    sqlx::query_as::<_, InstanceRow>(&format!(
        "SELECT {} FROM instances WHERE team_id = $1 AND challenge_id = $2",
        INSTANCE_COLUMNS
    ))
    .bind(team_id)
    .bind(challenge_id)
    .fetch_optional(pool)
    .await?
    .map(Instance::try_from)
    .transpose()
}

/// Instances held by a team.
pub async fn count_team_instances(pool: &PgPool, team_id: i32) -> Result<i64> {
    Ok(sqlx::query_scalar("SELECT COUNT(*) FROM instances WHERE team_id = $1")
        .bind(team_id)
        .fetch_one(pool)
        .await?)
}

/// Instances started by a user.
pub async fn count_user_instances(pool: &PgPool, user_id: i32) -> Result<i64> {
    Ok(sqlx::query_scalar("SELECT COUNT(*) FROM instances WHERE user_id = $1")
        .bind(user_id)
        .fetch_one(pool)
        .await?)
}

/// Insert an instance with its port reservations.
///
/// Takes the team lock then the user lock, so two requests for the same team
/// or user never both pass the cap check.
pub async fn create_instance(
    pool: &PgPool,
    new: &NewInstance,
    limits: InstanceLimits,
) -> Result<InstanceInsert> {
    let mut tx = pool.begin().await?;
    advisory_lock(&mut tx, LOCK_TEAM_INSTANCES, new.team_id).await?;
    advisory_lock(&mut tx, LOCK_USER_INSTANCES, new.user_id).await?;

    if let Some(row) = sqlx::query_as::<_, InstanceRow>(&format!(
        "SELECT {} FROM instances WHERE team_id = $1 AND challenge_id = $2",
        INSTANCE_COLUMNS
    ))
    .bind(new.team_id)
    .bind(new.challenge_id)
    .fetch_optional(&mut *tx)
    .await?
    {
        return Ok(InstanceInsert::Existing(Instance::try_from(row)?));
    }

    let team_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM instances WHERE team_id = $1")
        .bind(new.team_id)
        .fetch_one(&mut *tx)
        .await?;
    if team_count >= i64::from(limits.per_team) {
        return Err(Error::PerTeamLimit);
    }
    let user_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM instances WHERE user_id = $1")
        .bind(new.user_id)
        .fetch_one(&mut *tx)
        .await?;
    if user_count >= i64::from(limits.per_user) {
        return Err(Error::PerUserLimit);
    }

    let row = sqlx::query_as::<_, InstanceRow>(&format!(
        r#"
        INSERT INTO instances (name, user_id, team_id, challenge_id, ports, status, created_at, expires_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        RETURNING {}
        "#,
        INSTANCE_COLUMNS
    ))
    .bind(&new.name)
    .bind(new.user_id)
    .bind(new.team_id)
    .bind(new.challenge_id)
    .bind(&new.ports)
    .bind(new.status.as_str())
    .bind(new.created_at)
    .bind(new.expires_at)
    .fetch_one(&mut *tx)
    .await?;
    let instance = Instance::try_from(row)?;

    for port in &new.ports {
        let reserved = sqlx::query("INSERT INTO instance_ports (port, instance_id) VALUES ($1, $2)")
            .bind(port)
            .bind(instance.id)
            .execute(&mut *tx)
            .await;
        match reserved {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => return Err(Error::PortConflict(*port)),
            Err(e) => return Err(e.into()),
        }
    }

    tx.commit().await?;
    Ok(InstanceInsert::Created(instance))
}

/// Update the lifecycle state of an instance.
pub async fn set_instance_status(pool: &PgPool, id: i32, status: InstanceStatus) -> Result<()> {
    sqlx::query("UPDATE instances SET status = $2 WHERE id = $1")
        .bind(id)
        .bind(status.as_str())
        .execute(pool)
        .await?;
    Ok(())
}

/// Replace the host ports reserved by an instance.
pub async fn set_instance_ports(pool: &PgPool, id: i32, ports: &[i32]) -> Result<()> {
    let mut tx = pool.begin().await?;

    let result = sqlx::query("UPDATE instances SET ports = $2 WHERE id = $1")
        .bind(id)
        .bind(ports)
        .execute(&mut *tx)
        .await?;
    if result.rows_affected() == 0 {
        return Err(Error::InstanceNotFound);
    }

    sqlx::query("DELETE FROM instance_ports WHERE instance_id = $1")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    for port in ports {
        let reserved = sqlx::query("INSERT INTO instance_ports (port, instance_id) VALUES ($1, $2)")
            .bind(port)
            .bind(id)
            .execute(&mut *tx)
            .await;
        match reserved {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => return Err(Error::PortConflict(*port)),
            Err(e) => return Err(e.into()),
        }
    }

    tx.commit().await?;
    Ok(())
}

/// Delete an instance; only the caller whose DELETE removed the row gets it back.
pub async fn delete_instance(pool: &PgPool, id: i32) -> Result<Option<Instance>> {
    sqlx::query_as::<_, InstanceRow>(&format!(
        "DELETE FROM instances WHERE id = $1 RETURNING {}",
        INSTANCE_COLUMNS
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?
    .map(Instance::try_from)
    .transpose()
}

/// Running or expired-flagged instances past their deadline.
pub async fn get_expired_instances(pool: &PgPool, now: DateTime<Utc>) -> Result<Vec<Instance>> {
    sqlx::query_as::<_, InstanceRow>(&format!(
        r#"
        SELECT {} FROM instances
        WHERE expires_at < $1 AND status IN ('running', 'expired')
        ORDER BY expires_at
        "#,
        INSTANCE_COLUMNS
    ))
    .bind(now)
    .fetch_all(pool)
    .await?
    .into_iter()
    .map(Instance::try_from)
    .collect()
}

/// Every instance.
pub async fn list_instances(pool: &PgPool) -> Result<Vec<Instance>> {
    sqlx::query_as::<_, InstanceRow>(&format!(
        "SELECT {} FROM instances ORDER BY id",
        INSTANCE_COLUMNS
    ))
    .fetch_all(pool)
    .await?
    .into_iter()
    .map(Instance::try_from)
    .collect()
}

#[derive(Debug, sqlx::FromRow)]
struct InstanceSummaryRow {
    #[sqlx(flatten)]
    instance: InstanceRow,
    username: String,
    team_name: String,
    challenge_name: String,
    challenge_type: String,
}

/// Instances with display names, newest first.
pub async fn list_instance_summaries(pool: &PgPool) -> Result<Vec<InstanceSummary>> {
    let rows = sqlx::query_as::<_, InstanceSummaryRow>(
        r#"
        SELECT i.id, i.name, i.user_id, i.team_id, i.challenge_id, i.ports, i.status,
               i.created_at, i.expires_at,
               COALESCE(u.username, '') AS username,
               COALESCE(t.name, '') AS team_name,
               c.name AS challenge_name,
               c.challenge_type AS challenge_type
        FROM instances i
        JOIN challenges c ON c.id = i.challenge_id
        LEFT JOIN users u ON u.id = i.user_id
        LEFT JOIN teams t ON t.id = i.team_id
        ORDER BY i.created_at DESC
        "#,
    )
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|row| {
            Ok(InstanceSummary {
                instance: Instance::try_from(row.instance)?,
                username: row.username,
                team_name: row.team_name,
                challenge_name: row.challenge_name,
                challenge_type: row.challenge_type.parse().map_err(Error::Internal)?,
            })
        })
        .collect()
}

/// When the team last stopped its instance of a challenge.
pub async fn get_last_stopped_at(
    pool: &PgPool,
    team_id: i32,
    challenge_id: i32,
) -> Result<Option<DateTime<Utc>>> {
    Ok(sqlx::query_scalar(
        "SELECT last_stopped_at FROM instance_cooldowns WHERE team_id = $1 AND challenge_id = $2",
    )
    .bind(team_id)
    .bind(challenge_id)
    .fetch_optional(pool)
    .await?)
}

/// Record a stop for cooldown purposes.
pub async fn upsert_cooldown(pool: &PgPool, team_id: i32, challenge_id: i32, at: DateTime<Utc>) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO instance_cooldowns (team_id, challenge_id, last_stopped_at)
        VALUES ($1, $2, $3)
        ON CONFLICT (team_id, challenge_id) DO UPDATE SET last_stopped_at = EXCLUDED.last_stopped_at
        "#,
    )
    .bind(team_id)
    .bind(challenge_id)
    .bind(at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Record why a background start failed.
pub async fn record_instance_failure(
    pool: &PgPool,
    team_id: i32,
    challenge_id: i32,
    reason: &str,
    at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO instance_failures (team_id, challenge_id, reason, failed_at)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (team_id, challenge_id) DO UPDATE SET
            reason = EXCLUDED.reason,
            failed_at = EXCLUDED.failed_at
        "#,
    )
    .bind(team_id)
    .bind(challenge_id)
    .bind(reason)
    .bind(at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Last background start failure, if any.
pub async fn get_instance_failure(
    pool: &PgPool,
    team_id: i32,
    challenge_id: i32,
) -> Result<Option<InstanceFailure>> {
    let row: Option<(String, DateTime<Utc>)> = sqlx::query_as(
        "SELECT reason, failed_at FROM instance_failures WHERE team_id = $1 AND challenge_id = $2",
    )
    .bind(team_id)
    .bind(challenge_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|(reason, failed_at)| InstanceFailure { reason, failed_at }))
}

/// Forget a recorded failure.
pub async fn clear_instance_failure(pool: &PgPool, team_id: i32, challenge_id: i32) -> Result<()> {
    sqlx::query("DELETE FROM instance_failures WHERE team_id = $1 AND challenge_id = $2")
        .bind(team_id)
        .bind(challenge_id)
        .execute(pool)
        .await?;
    Ok(())
}

// ============================================================================
// Submissions and Solves
// ============================================================================

/// Whether the team solved the challenge.
pub async fn has_solved(pool: &PgPool, team_id: i32, challenge_id: i32) -> Result<bool> {
    Ok(sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM solves WHERE team_id = $1 AND challenge_id = $2)",
    )
    .bind(team_id)
    .bind(challenge_id)
    .fetch_one(pool)
    .await?)
}

/// Incorrect submissions by members of the team.
pub async fn count_failed_attempts(pool: &PgPool, team_id: i32, challenge_id: i32) -> Result<i64> {
    Ok(sqlx::query_scalar(
        r#"
        SELECT COUNT(*)
        FROM submissions s
        JOIN users u ON u.id = s.user_id
        WHERE u.team_id = $1 AND s.challenge_id = $2 AND NOT s.is_correct
        "#,
    )
    .bind(team_id)
    .bind(challenge_id)
    .fetch_one(pool)
    .await?)
}

/// A user's previous submission of the same value.
pub async fn find_submission(
    pool: &PgPool,
    user_id: i32,
    challenge_id: i32,
    value: &str,
) -> Result<Option<Submission>> {
    Ok(sqlx::query_as::<_, SubmissionRow>(
        r#"
        SELECT id, user_id, challenge_id, value, is_correct, created_at
        FROM submissions
        WHERE user_id = $1 AND challenge_id = $2 AND value = $3
        ORDER BY id DESC
        LIMIT 1
        "#,
    )
    .bind(user_id)
    .bind(challenge_id)
    .bind(value)
    .fetch_optional(pool)
    .await?
    .map(Submission::from))
}

/// Store a submission.
pub async fn insert_submission(pool: &PgPool, new: &NewSubmission) -> Result<Submission> {
    let row = sqlx::query_as::<_, SubmissionRow>(
        r#"
        INSERT INTO submissions (user_id, challenge_id, value, is_correct, created_at)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING id, user_id, challenge_id, value, is_correct, created_at
        "#,
    )
    .bind(new.user_id)
    .bind(new.challenge_id)
    .bind(&new.value)
    .bind(new.is_correct)
    .bind(new.created_at)
    .fetch_one(pool)
    .await?;
    Ok(row.into())
}

/// Record a solve at the next position of the challenge.
pub async fn record_solve(
    pool: &PgPool,
    challenge: &Challenge,
    team_id: i32,
    user_id: i32,
    at: DateTime<Utc>,
) -> Result<RecordedSolve> {
    let mut tx = pool.begin().await?;
    advisory_lock(&mut tx, LOCK_SOLVES, challenge.id).await?;

    let position: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM solves WHERE challenge_id = $1")
        .bind(challenge.id)
        .fetch_one(&mut *tx)
        .await?;

    let solve = Solve {
        team_id,
        challenge_id: challenge.id,
        user_id,
        points: scoring::solve_points(challenge, position),
        created_at: at,
    };
    let inserted = sqlx::query(
        r#"
        INSERT INTO solves (team_id, challenge_id, user_id, points, created_at)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(solve.team_id)
    .bind(solve.challenge_id)
    .bind(solve.user_id)
    .bind(solve.points)
    .bind(solve.created_at)
    .execute(&mut *tx)
    .await;
    match inserted {
        Ok(_) => {}
        Err(e) if is_unique_violation(&e) => return Err(Error::AlreadySolved),
        Err(e) => return Err(e.into()),
    }

    let first_blood = scoring::first_blood_at(challenge, position)
        .map(|(bonus, badge)| scoring::first_blood_record(&solve, position, bonus, badge));
    if let Some(fb) = &first_blood {
        insert_first_blood(&mut tx, fb).await?;
    }

    tx.commit().await?;
    Ok(RecordedSolve {
        solve,
        position,
        first_blood,
    })
}

async fn insert_first_blood(tx: &mut Transaction<'_, Postgres>, fb: &FirstBlood) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO first_bloods (challenge_id, team_id, user_id, position, bonus, badge, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(fb.challenge_id)
    .bind(fb.team_id)
    .bind(fb.user_id)
    .bind(fb.position)
    .bind(fb.bonus)
    .bind(&fb.badge)
    .bind(fb.created_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Number of teams that solved a challenge.
pub async fn count_solves(pool: &PgPool, challenge_id: i32) -> Result<i64> {
    Ok(sqlx::query_scalar("SELECT COUNT(*) FROM solves WHERE challenge_id = $1")
        .bind(challenge_id)
        .fetch_one(pool)
        .await?)
}

#[derive(Debug, sqlx::FromRow)]
struct SolveEntryRow {
    #[sqlx(flatten)]
    solve: SolveRow,
    username: String,
    team_name: String,
}

/// Solves of a challenge with display names, oldest first.
pub async fn get_solves_for_challenge(pool: &PgPool, challenge_id: i32) -> Result<Vec<SolveEntry>> {
    let rows = sqlx::query_as::<_, SolveEntryRow>(
        r#"
        SELECT s.team_id, s.challenge_id, s.user_id, s.points, s.created_at,
               COALESCE(u.username, '') AS username,
               COALESCE(t.name, '') AS team_name
        FROM solves s
        LEFT JOIN users u ON u.id = s.user_id
        LEFT JOIN teams t ON t.id = s.team_id
        WHERE s.challenge_id = $1
        ORDER BY s.created_at
        "#,
    )
    .bind(challenge_id)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|row| SolveEntry {
            solve: row.solve.into(),
            username: row.username,
            team_name: row.team_name,
        })
        .collect())
}

/// Every solve of a team.
pub async fn get_team_solves(pool: &PgPool, team_id: i32) -> Result<Vec<Solve>> {
    let rows = sqlx::query_as::<_, SolveRow>(
        r#"
        SELECT team_id, challenge_id, user_id, points, created_at
        FROM solves
        WHERE team_id = $1
        ORDER BY created_at
        "#,
    )
    .bind(team_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(Solve::from).collect())
}

/// Every solve.
pub async fn get_all_solves(pool: &PgPool) -> Result<Vec<Solve>> {
    let rows = sqlx::query_as::<_, SolveRow>(
        r#"
        SELECT team_id, challenge_id, user_id, points, created_at
        FROM solves
        ORDER BY challenge_id, created_at
        "#,
    )
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(Solve::from).collect())
}

/// First bloods of a challenge by position.
pub async fn get_first_bloods(pool: &PgPool, challenge_id: i32) -> Result<Vec<FirstBlood>> {
    let rows = sqlx::query_as::<_, FirstBloodRow>(
        r#"
        SELECT challenge_id, team_id, user_id, position, bonus, badge, created_at
        FROM first_bloods
        WHERE challenge_id = $1
        ORDER BY position
        "#,
    )
    .bind(challenge_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(FirstBlood::from).collect())
}

/// Replace every first blood and rewrite solve points.
pub async fn apply_recalculation(pool: &PgPool, recalculation: &Recalculation) -> Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM first_bloods")
        .execute(&mut *tx)
        .await?;

    let teams: Vec<i32> = recalculation.updates.iter().map(|u| u.team_id).collect();
    let challenges: Vec<i32> = recalculation.updates.iter().map(|u| u.challenge_id).collect();
    let points: Vec<i32> = recalculation.updates.iter().map(|u| u.points).collect();
    sqlx::query(
        r#"
        UPDATE solves s
        SET points = u.points
        FROM UNNEST($1::int[], $2::int[], $3::int[]) AS u(team_id, challenge_id, points)
        WHERE s.team_id = u.team_id AND s.challenge_id = u.challenge_id
        "#,
    )
    .bind(&teams)
    .bind(&challenges)
    .bind(&points)
    .execute(&mut *tx)
    .await?;

    for fb in &recalculation.first_bloods {
        insert_first_blood(&mut tx, fb).await?;
    }

    tx.commit().await?;
    Ok(())
}

// ============================================================================
// Hints
// ============================================================================

/// Load a hint.
pub async fn get_hint(pool: &PgPool, id: i32) -> Result<Option<Hint>> {
    Ok(sqlx::query_as::<_, HintRow>(
        r#"
        SELECT id, challenge_id, title, content, cost, is_active, auto_active_at
        FROM hints
        WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?
    .map(Hint::from))
}

/// Flip due hints to active and return them.
pub async fn activate_due_hints(pool: &PgPool, now: DateTime<Utc>) -> Result<Vec<Hint>> {
    let rows = sqlx::query_as::<_, HintRow>(
        r#"
        UPDATE hints
        SET is_active = TRUE
        WHERE is_active = FALSE AND auto_active_at IS NOT NULL AND auto_active_at <= $1
        RETURNING id, challenge_id, title, content, cost, is_active, auto_active_at
        "#,
    )
    .bind(now)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(Hint::from).collect())
}

/// Store a purchase.
///
/// Takes the team's spend lock, so two purchases for the same team never both
/// pass the budget check.
pub async fn purchase_hint(pool: &PgPool, purchase: &HintPurchase, earned: i64) -> Result<()> {
    let mut tx = pool.begin().await?;
    advisory_lock(&mut tx, LOCK_HINT_SPEND, purchase.team_id).await?;

    let owned: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM hint_purchases WHERE team_id = $1 AND hint_id = $2)",
    )
    .bind(purchase.team_id)
    .bind(purchase.hint_id)
    .fetch_one(&mut *tx)
    .await?;
    if owned {
        return Err(Error::HintAlreadyPurchased);
    }

    let spent: i64 = sqlx::query_scalar(
        "SELECT COALESCE(SUM(cost), 0)::BIGINT FROM hint_purchases WHERE team_id = $1",
    )
    .bind(purchase.team_id)
    .fetch_one(&mut *tx)
    .await?;
    ensure_affordable(earned, spent, purchase.cost)?;

    let inserted = sqlx::query(
        r#"
        INSERT INTO hint_purchases (team_id, hint_id, user_id, cost, created_at)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(purchase.team_id)
    .bind(purchase.hint_id)
    .bind(purchase.user_id)
    .bind(purchase.cost)
    .bind(purchase.created_at)
    .execute(&mut *tx)
    .await;
    match inserted {
        Ok(_) => {}
        Err(e) if is_unique_violation(&e) => return Err(Error::HintAlreadyPurchased),
        Err(e) => return Err(e.into()),
    }

    tx.commit().await?;
    Ok(())
}

/// Points a team spent on hints.
pub async fn team_hint_spend(pool: &PgPool, team_id: i32) -> Result<i64> {
    Ok(sqlx::query_scalar(
        "SELECT COALESCE(SUM(cost), 0)::BIGINT FROM hint_purchases WHERE team_id = $1",
    )
    .bind(team_id)
    .fetch_one(pool)
    .await?)
}

// ============================================================================
// Token Blacklist
// ============================================================================

/// Revoke a token until it would have expired anyway.
pub async fn blacklist_token(pool: &PgPool, jti: &str, expires_at: DateTime<Utc>) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO jwt_blacklist (jti, expires_at)
        VALUES ($1, $2)
        ON CONFLICT (jti) DO NOTHING
        "#,
    )
    .bind(jti)
    .bind(expires_at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Revocations still in force.
pub async fn load_blacklist(pool: &PgPool, now: DateTime<Utc>) -> Result<Vec<(String, DateTime<Utc>)>> {
    Ok(
        sqlx::query_as("SELECT jti, expires_at FROM jwt_blacklist WHERE expires_at > $1")
            .bind(now)
            .fetch_all(pool)
            .await?,
    )
}

/// Drop revocations of tokens that expired anyway.
pub async fn purge_blacklist(pool: &PgPool, now: DateTime<Utc>) -> Result<u64> {
    let result = sqlx::query("DELETE FROM jwt_blacklist WHERE expires_at <= $1")
        .bind(now)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

/// Database connectivity check.
pub async fn health_check_db(pool: &PgPool) -> Result<()> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

// ============================================================================
// Store Implementation
// ============================================================================

#[async_trait]
impl Store for PostgresStore {
    async fn ping(&self) -> Result<()> {
        health_check_db(&self.pool).await
    }

    async fn decay_formula(&self, id: i32) -> Result<Option<DecayFormula>> {
        get_decay_formula(&self.pool, id).await
    }

    async fn decay_formula_by_name(&self, name: &str) -> Result<Option<DecayFormula>> {
        get_decay_formula_by_name(&self.pool, name).await
    }

    async fn challenge(&self, id: i32) -> Result<Option<Challenge>> {
        get_challenge(&self.pool, id).await
    }

    async fn challenge_by_slug(&self, slug: &str) -> Result<Option<Challenge>> {
        get_challenge_by_slug(&self.pool, slug).await
    }

    async fn list_challenges(&self) -> Result<Vec<Challenge>> {
        list_challenges(&self.pool).await
    }

    async fn sync_challenge(&self, sync: &ChallengeSync) -> Result<Challenge> {
        sync_challenge(&self.pool, sync).await
    }

    async fn delete_challenge_by_slug(&self, slug: &str) -> Result<Option<DeletedChallenge>> {
        delete_challenge_by_slug(&self.pool, slug).await
    }

    async fn set_cover_img(&self, challenge_id: i32, cover_img: Option<&str>) -> Result<()> {
        set_cover_img(&self.pool, challenge_id, cover_img).await
    }

    async fn flags(&self, challenge_id: i32) -> Result<Vec<Flag>> {
        get_flags(&self.pool, challenge_id).await
    }

    async fn geo_spec(&self, challenge_id: i32) -> Result<Option<GeoSpec>> {
        get_geo_spec(&self.pool, challenge_id).await
    }

    async fn hints_for_challenge(&self, challenge_id: i32) -> Result<Vec<Hint>> {
        get_hints_for_challenge(&self.pool, challenge_id).await
    }

    async fn user(&self, id: i32) -> Result<Option<User>> {
        get_user(&self.pool, id).await
    }

    async fn team_name(&self, team_id: i32) -> Result<Option<String>> {
        get_team_name(&self.pool, team_id).await
    }

    async fn record_user_ip(&self, user_id: i32, ip: &str, at: DateTime<Utc>) -> Result<()> {
        record_user_ip(&self.pool, user_id, ip, at).await
    }

    async fn team_ips(&self, team_id: i32) -> Result<Vec<String>> {
        get_team_ips(&self.pool, team_id).await
    }

    async fn docker_config(&self) -> Result<DockerConfig> {
        get_docker_config(&self.pool).await
    }

    async fn save_docker_config(&self, config: &DockerConfig) -> Result<()> {
        save_docker_config(&self.pool, config).await
    }

    async fn instance(&self, id: i32) -> Result<Option<Instance>> {
        get_instance(&self.pool, id).await
    }

    async fn instance_for(&self, team_id: i32, challenge_id: i32) -> Result<Option<Instance>> {
        get_instance_for(&self.pool, team_id, challenge_id).await
    }

    async fn count_team_instances(&self, team_id: i32) -> Result<i64> {
        count_team_instances(&self.pool, team_id).await
    }

    async fn count_user_instances(&self, user_id: i32) -> Result<i64> {
        count_user_instances(&self.pool, user_id).await
    }

    async fn create_instance(
        &self,
        instance: &NewInstance,
        limits: InstanceLimits,
    ) -> Result<InstanceInsert> {
        create_instance(&self.pool, instance, limits).await
    }

    async fn set_instance_status(&self, id: i32, status: InstanceStatus) -> Result<()> {
        set_instance_status(&self.pool, id, status).await
    }

    async fn set_instance_ports(&self, id: i32, ports: &[i32]) -> Result<()> {
        set_instance_ports(&self.pool, id, ports).await
    }

    async fn delete_instance(&self, id: i32) -> Result<Option<Instance>> {
        delete_instance(&self.pool, id).await
    }

    async fn expired_instances(&self, now: DateTime<Utc>) -> Result<Vec<Instance>> {
        get_expired_instances(&self.pool, now).await
    }

    async fn list_instances(&self) -> Result<Vec<Instance>> {
        list_instances(&self.pool).await
    }

    async fn list_instance_summaries(&self) -> Result<Vec<InstanceSummary>> {
        list_instance_summaries(&self.pool).await
    }

    async fn last_stopped_at(
        &self,
        team_id: i32,
        challenge_id: i32,
    ) -> Result<Option<DateTime<Utc>>> {
        get_last_stopped_at(&self.pool, team_id, challenge_id).await
    }

    async fn upsert_cooldown(
        &self,
        team_id: i32,
        challenge_id: i32,
        at: DateTime<Utc>,
    ) -> Result<()> {
        upsert_cooldown(&self.pool, team_id, challenge_id, at).await
    }

    async fn record_instance_failure(
        &self,
        team_id: i32,
        challenge_id: i32,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        record_instance_failure(&self.pool, team_id, challenge_id, reason, at).await
    }

    async fn instance_failure(
        &self,
        team_id: i32,
        challenge_id: i32,
    ) -> Result<Option<InstanceFailure>> {
        get_instance_failure(&self.pool, team_id, challenge_id).await
    }

    async fn clear_instance_failure(&self, team_id: i32, challenge_id: i32) -> Result<()> {
        clear_instance_failure(&self.pool, team_id, challenge_id).await
    }

    async fn has_solved(&self, team_id: i32, challenge_id: i32) -> Result<bool> {
        has_solved(&self.pool, team_id, challenge_id).await
    }

    async fn count_failed_attempts(&self, team_id: i32, challenge_id: i32) -> Result<i64> {
        count_failed_attempts(&self.pool, team_id, challenge_id).await
    }

    async fn find_submission(
        &self,
        user_id: i32,
        challenge_id: i32,
        value: &str,
    ) -> Result<Option<Submission>> {
        find_submission(&self.pool, user_id, challenge_id, value).await
    }

    async fn insert_submission(&self, submission: &NewSubmission) -> Result<Submission> {
        insert_submission(&self.pool, submission).await
    }

    async fn record_solve(
        &self,
        challenge: &Challenge,
        team_id: i32,
        user_id: i32,
        at: DateTime<Utc>,
    ) -> Result<RecordedSolve> {
        record_solve(&self.pool, challenge, team_id, user_id, at).await
    }

    async fn count_solves(&self, challenge_id: i32) -> Result<i64> {
        count_solves(&self.pool, challenge_id).await
    }

    async fn solves_for_challenge(&self, challenge_id: i32) -> Result<Vec<SolveEntry>> {
        get_solves_for_challenge(&self.pool, challenge_id).await
    }

    async fn team_solves(&self, team_id: i32) -> Result<Vec<Solve>> {
        get_team_solves(&self.pool, team_id).await
    }

    async fn all_solves(&self) -> Result<Vec<Solve>> {
        get_all_solves(&self.pool).await
    }

    async fn first_bloods(&self, challenge_id: i32) -> Result<Vec<FirstBlood>> {
        get_first_bloods(&self.pool, challenge_id).await
    }

    async fn apply_recalculation(&self, recalculation: &Recalculation) -> Result<()> {
        apply_recalculation(&self.pool, recalculation).await
    }

    async fn hint(&self, id: i32) -> Result<Option<Hint>> {
        get_hint(&self.pool, id).await
    }

    async fn activate_due_hints(&self, now: DateTime<Utc>) -> Result<Vec<Hint>> {
        activate_due_hints(&self.pool, now).await
    }

    async fn purchase_hint(&self, purchase: &HintPurchase, earned: i64) -> Result<()> {
        purchase_hint(&self.pool, purchase, earned).await
    }

    async fn team_hint_spend(&self, team_id: i32) -> Result<i64> {
        team_hint_spend(&self.pool, team_id).await
    }

    async fn blacklist_token(&self, jti: &str, expires_at: DateTime<Utc>) -> Result<()> {
        blacklist_token(&self.pool, jti, expires_at).await
    }

    async fn load_blacklist(&self, now: DateTime<Utc>) -> Result<Vec<(String, DateTime<Utc>)>> {
        load_blacklist(&self.pool, now).await
    }

    async fn purge_blacklist(&self, now: DateTime<Utc>) -> Result<u64> {
        purge_blacklist(&self.pool, now).await
    }
}
