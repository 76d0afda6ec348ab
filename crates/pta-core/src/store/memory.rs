// Copyright (C) 2025 pwnthemall contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory store for tests.
//!
//! Same semantics as [`super::PostgresStore`], with a single lock standing in
//! for transactions.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{DeletedChallenge, InstanceInsert, Store, ensure_affordable};
use crate::error::{Error, Result};
use crate::models::{
    Challenge, ChallengeSync, DecayFormula, DecayKind, DockerConfig, FirstBlood, Flag, GeoSpec,
    Hint, HintPurchase, Instance, InstanceFailure, InstanceLimits, InstanceStatus,
    InstanceSummary, NewInstance, NewSubmission, RecordedSolve, Role, Solve, SolveEntry,
    Submission, User,
};
use crate::scoring::{self, Recalculation};

/// Decay formulas every fresh database starts with: `(name, kind, step, min_points)`.
pub const SEEDED_DECAY_FORMULAS: [(&str, DecayKind, i32, i32); 6] = [
    (DecayFormula::DEFAULT_NAME, DecayKind::Fixed, 0, 0),
    ("Logarithmic - Ultra Slow", DecayKind::Logarithmic, 10, 10),
    ("Logarithmic - Very Slow", DecayKind::Logarithmic, 25, 25),
    ("Logarithmic - Slow", DecayKind::Logarithmic, 50, 100),
    ("Logarithmic - Medium", DecayKind::Logarithmic, 75, 75),
    ("Logarithmic - Fast", DecayKind::Logarithmic, 100, 50),
];

#[derive(Debug, Default)]
struct State {
    next_id: i32,
    formulas: BTreeMap<i32, DecayFormula>,
    teams: BTreeMap<i32, String>,
    users: BTreeMap<i32, User>,
    challenges: BTreeMap<i32, Challenge>,
    flags: Vec<Flag>,
    hints: BTreeMap<i32, Hint>,
    geo: HashMap<i32, GeoSpec>,
    submissions: Vec<Submission>,
    solves: Vec<Solve>,
    first_bloods: Vec<FirstBlood>,
    instances: BTreeMap<i32, Instance>,
    cooldowns: HashMap<(i32, i32), DateTime<Utc>>,
    failures: HashMap<(i32, i32), InstanceFailure>,
    docker: DockerConfig,
    purchases: Vec<HintPurchase>,
    user_ips: BTreeMap<(i32, String), DateTime<Utc>>,
    blacklist: HashMap<String, DateTime<Utc>>,
}

impl State {
    fn id(&mut self) -> i32 {
        self.next_id += 1;
        self.next_id
    }

    fn team_of(&self, user_id: i32) -> Option<i32> {
        self.users.get(&user_id).and_then(|u| u.team_id)
    }

    fn remove_challenge_rows(&mut self, challenge_id: i32) -> Vec<Instance> {
        self.flags.retain(|f| f.challenge_id != challenge_id);
        let hint_ids: HashSet<i32> = self
            .hints
            .values()
            .filter(|h| h.challenge_id == challenge_id)
            .map(|h| h.id)
            .collect();
        self.hints.retain(|id, _| !hint_ids.contains(id));
        self.purchases.retain(|p| !hint_ids.contains(&p.hint_id));
        self.geo.remove(&challenge_id);
        self.submissions.retain(|s| s.challenge_id != challenge_id);
        self.solves.retain(|s| s.challenge_id != challenge_id);
        self.first_bloods.retain(|f| f.challenge_id != challenge_id);
        self.cooldowns.retain(|(_, c), _| *c != challenge_id);
        self.failures.retain(|(_, c), _| *c != challenge_id);

        let doomed: Vec<i32> = self
            .instances
            .values()
            .filter(|i| i.challenge_id == challenge_id)
            .map(|i| i.id)
            .collect();
        doomed
            .into_iter()
            .filter_map(|id| self.instances.remove(&id))
            .collect()
    }
}

/// Store kept entirely in process memory.
#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create a store holding only the seeded decay formulas and default
    /// docker configuration.
    pub fn new() -> Self {
        let mut state = State::default();
        for (name, kind, step, min_points) in SEEDED_DECAY_FORMULAS {
            let id = state.id();
            state.formulas.insert(
                id,
                DecayFormula {
                    id,
                    name: name.to_string(),
                    kind,
                    step,
                    min_points,
                },
            );
        }
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Create a team.
    pub async fn add_team(&self, name: &str) -> i32 {
        let mut state = self.state.lock().await;
        let id = state.id();
        state.teams.insert(id, name.to_string());
        id
    }

    /// Create a user.
    pub async fn add_user(&self, username: &str, role: Role, team_id: Option<i32>) -> User {
        let mut state = self.state.lock().await;
        let id = state.id();
        let user = User {
            id,
            username: username.to_string(),
            role,
            team_id,
        };
        state.users.insert(id, user.clone());
        user
    }

    /// Replace a challenge row as-is (tests that bypass the ingestor).
    pub async fn put_challenge(&self, challenge: Challenge) {
        self.state
            .lock()
            .await
            .challenges
            .insert(challenge.id, challenge);
    }

    /// Every stored submission.
    pub async fn submissions(&self) -> Vec<Submission> {
        self.state.lock().await.submissions.clone()
    }

    /// Every stored first blood.
    pub async fn all_first_bloods(&self) -> Vec<FirstBlood> {
        self.state.lock().await.first_bloods.clone()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn decay_formula(&self, id: i32) -> Result<Option<DecayFormula>> {
        Ok(self.state.lock().await.formulas.get(&id).cloned())
    }

    async fn decay_formula_by_name(&self, name: &str) -> Result<Option<DecayFormula>> {
        Ok(self
            .state
            .lock()
            .await
            .formulas
            .values()
            .find(|f| f.name == name)
            .cloned())
    }

    async fn challenge(&self, id: i32) -> Result<Option<Challenge>> {
        Ok(self.state.lock().await.challenges.get(&id).cloned())
    }

    async fn challenge_by_slug(&self, slug: &str) -> Result<Option<Challenge>> {
        Ok(self
            .state
            .lock()
            .await
            .challenges
            .values()
            .find(|c| c.slug == slug)
            .cloned())
    }

    async fn list_challenges(&self) -> Result<Vec<Challenge>> {
        Ok(self.state.lock().await.challenges.values().cloned().collect())
    }

    async fn sync_challenge(&self, sync: &ChallengeSync) -> Result<Challenge> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let default_formula = state
            .formulas
            .values()
            .find(|f| f.name == DecayFormula::DEFAULT_NAME)
            .map(|f| f.id);

        let existing = state
            .challenges
            .values()
            .find(|c| c.slug == sync.slug)
            .cloned();

        let (id, created_at, decay_formula_id) = match &existing {
            Some(c) => (c.id, c.created_at, sync.decay_formula_id.or(c.decay_formula_id)),
            None => (state.id(), now, sync.decay_formula_id.or(default_formula)),
        };

        let challenge = Challenge {
            id,
            slug: sync.slug.clone(),
            name: sync.name.clone(),
            description: sync.description.clone(),
            category: sync.category.clone(),
            difficulty: sync.difficulty.clone(),
            challenge_type: sync.challenge_type,
            author: sync.author.clone(),
            hidden: sync.hidden,
            points: sync.points,
            decay_formula_id,
            enable_first_blood: sync.enable_first_blood,
            first_blood_bonuses: sync.first_blood_bonuses.clone(),
            first_blood_badges: sync.first_blood_badges.clone(),
            ports: sync.ports.clone(),
            connection_info: sync.connection_info.clone(),
            max_attempts: sync.max_attempts,
            depends_on: sync.depends_on.clone(),
            files: sync.files.clone(),
            cover_img: existing.as_ref().and_then(|c| c.cover_img.clone()),
            emoji: sync.emoji.clone(),
            created_at,
            updated_at: now,
        };
        state.challenges.insert(id, challenge.clone());

        state.flags.retain(|f| f.challenge_id != id);
        for value in &sync.flags {
            let flag_id = state.id();
            state.flags.push(Flag {
                id: flag_id,
                challenge_id: id,
                value: value.clone(),
            });
        }

        // Hints are updated in place by position so purchases keep pointing
        // at the same rows.
        let mut current: Vec<i32> = state
            .hints
            .values()
            .filter(|h| h.challenge_id == id)
            .map(|h| h.id)
            .collect();
        current.sort_unstable();
        for (idx, new) in sync.hints.iter().enumerate() {
            let hint_id = match current.get(idx) {
                Some(existing) => *existing,
                None => state.id(),
            };
            state.hints.insert(
                hint_id,
                Hint {
                    id: hint_id,
                    challenge_id: id,
                    title: new.title.clone(),
                    content: new.content.clone(),
                    cost: new.cost,
                    is_active: new.is_active,
                    auto_active_at: new.auto_active_at,
                },
            );
        }
        for stale in current.iter().skip(sync.hints.len()) {
            state.hints.remove(stale);
            state.purchases.retain(|p| p.hint_id != *stale);
        }

        match sync.geo {
            Some(spec) => {
                state.geo.insert(id, spec);
            }
            None => {
                state.geo.remove(&id);
            }
        }

        Ok(challenge)
    }

    async fn delete_challenge_by_slug(&self, slug: &str) -> Result<Option<DeletedChallenge>> {
        let mut state = self.state.lock().await;
        let Some(challenge) = state.challenges.values().find(|c| c.slug == slug).cloned() else {
            return Ok(None);
        };
        state.challenges.remove(&challenge.id);
        let instances = state.remove_challenge_rows(challenge.id);
        Ok(Some(DeletedChallenge {
            challenge,
            instances,
        }))
    }

    async fn set_cover_img(&self, challenge_id: i32, cover_img: Option<&str>) -> Result<()> {
        let mut state = self.state.lock().await;
        let challenge = state
            .challenges
            .get_mut(&challenge_id)
            .ok_or(Error::ChallengeNotFound)?;
        challenge.cover_img = cover_img.map(str::to_string);
        Ok(())
    }

    async fn flags(&self, challenge_id: i32) -> Result<Vec<Flag>> {
        Ok(self
            .state
            .lock()
            .await
            .flags
            .iter()
            .filter(|f| f.challenge_id == challenge_id)
            .cloned()
            .collect())
    }

    async fn geo_spec(&self, challenge_id: i32) -> Result<Option<GeoSpec>> {
        Ok(self.state.lock().await.geo.get(&challenge_id).copied())
    }

    async fn hints_for_challenge(&self, challenge_id: i32) -> Result<Vec<Hint>> {
        Ok(self
            .state
            .lock()
            .await
            .hints
            .values()
            .filter(|h| h.challenge_id == challenge_id)
            .cloned()
            .collect())
    }

    async fn user(&self, id: i32) -> Result<Option<User>> {
        Ok(self.state.lock().await.users.get(&id).cloned())
    }

    async fn team_name(&self, team_id: i32) -> Result<Option<String>> {
        Ok(self.state.lock().await.teams.get(&team_id).cloned())
    }

    async fn record_user_ip(&self, user_id: i32, ip: &str, at: DateTime<Utc>) -> Result<()> {
        self.state
            .lock()
            .await
            .user_ips
            .insert((user_id, ip.to_string()), at);
        Ok(())
    }

    async fn team_ips(&self, team_id: i32) -> Result<Vec<String>> {
        let state = self.state.lock().await;
        let mut ips: Vec<String> = state
            .user_ips
            .keys()
            .filter(|(user_id, _)| state.team_of(*user_id) == Some(team_id))
            .map(|(_, ip)| ip.clone())
            .collect();
        ips.sort();
        ips.dedup();
        Ok(ips)
    }

    async fn docker_config(&self) -> Result<DockerConfig> {
        Ok(self.state.lock().await.docker.clone())
    }

    async fn save_docker_config(&self, config: &DockerConfig) -> Result<()> {
        self.state.lock().await.docker = config.clone();
        Ok(())
    }

    async fn instance(&self, id: i32) -> Result<Option<Instance>> {
        Ok(self.state.lock().await.instances.get(&id).cloned())
    }

    async fn instance_for(&self, team_id: i32, challenge_id: i32) -> Result<Option<Instance>> {
        Ok(self
            .state
            .lock()
            .await
            .instances
            .values()
            .find(|i| i.team_id == team_id && i.challenge_id == challenge_id)
            .cloned())
    }

    async fn count_team_instances(&self, team_id: i32) -> Result<i64> {
        Ok(self
            .state
            .lock()
            .await
            .instances
            .values()
            .filter(|i| i.team_id == team_id)
            .count() as i64)
    }

    async fn count_user_instances(&self, user_id: i32) -> Result<i64> {
        Ok(self
            .state
            .lock()
            .await
            .instances
            .values()
            .filter(|i| i.user_id == user_id)
            .count() as i64)
    }

    async fn create_instance(
        &self,
        new: &NewInstance,
        limits: InstanceLimits,
    ) -> Result<InstanceInsert> {
        let mut state = self.state.lock().await;

        if let Some(existing) = state
            .instances
            .values()
            .find(|i| i.team_id == new.team_id && i.challenge_id == new.challenge_id)
        {
            return Ok(InstanceInsert::Existing(existing.clone()));
        }

        let team_count = state.instances.values().filter(|i| i.team_id == new.team_id).count();
        if team_count as i64 >= i64::from(limits.per_team) {
            return Err(Error::PerTeamLimit);
        }
        let user_count = state.instances.values().filter(|i| i.user_id == new.user_id).count();
        if user_count as i64 >= i64::from(limits.per_user) {
            return Err(Error::PerUserLimit);
        }

        let taken: HashSet<i32> = state
            .instances
            .values()
            .flat_map(|i| i.ports.iter().copied())
            .collect();
        if let Some(port) = new.ports.iter().find(|p| taken.contains(p)) {
            return Err(Error::PortConflict(*port));
        }

        let id = state.id();
        let instance = Instance {
            id,
            name: new.name.clone(),
            user_id: new.user_id,
            team_id: new.team_id,
            challenge_id: new.challenge_id,
            ports: new.ports.clone(),
            status: new.status,
            created_at: new.created_at,
            expires_at: new.expires_at,
        };
        state.instances.insert(id, instance.clone());
        Ok(InstanceInsert::Created(instance))
    }

    async fn set_instance_status(&self, id: i32, status: InstanceStatus) -> Result<()> {
        if let Some(instance) = self.state.lock().await.instances.get_mut(&id) {
            instance.status = status;
        }
        Ok(())
    }

    async fn set_instance_ports(&self, id: i32, ports: &[i32]) -> Result<()> {
        let mut state = self.state.lock().await;
        let taken: HashSet<i32> = state
            .instances
            .values()
            .filter(|i| i.id != id)
            .flat_map(|i| i.ports.iter().copied())
            .collect();
        if let Some(port) = ports.iter().find(|p| taken.contains(p)) {
            return Err(Error::PortConflict(*port));
        }
        let instance = state.instances.get_mut(&id).ok_or(Error::InstanceNotFound)?;
        instance.ports = ports.to_vec();
        Ok(())
    }

    async fn delete_instance(&self, id: i32) -> Result<Option<Instance>> {
        Ok(self.state.lock().await.instances.remove(&id))
    }

    async fn expired_instances(&self, now: DateTime<Utc>) -> Result<Vec<Instance>> {
        Ok(self
            .state
            .lock()
            .await
            .instances
            .values()
            .filter(|i| {
                i.expires_at < now
                    && matches!(i.status, InstanceStatus::Running | InstanceStatus::Expired)
            })
            .cloned()
            .collect())
    }

    async fn list_instances(&self) -> Result<Vec<Instance>> {
        Ok(self.state.lock().await.instances.values().cloned().collect())
    }

    async fn list_instance_summaries(&self) -> Result<Vec<InstanceSummary>> {
        let state = self.state.lock().await;
        let mut out: Vec<InstanceSummary> = state
            .instances
            .values()
            .filter_map(|i| {
                let challenge = state.challenges.get(&i.challenge_id)?;
                Some(InstanceSummary {
                    instance: i.clone(),
                    username: state
                        .users
                        .get(&i.user_id)
                        .map(|u| u.username.clone())
                        .unwrap_or_default(),
                    team_name: state.teams.get(&i.team_id).cloned().unwrap_or_default(),
                    challenge_name: challenge.name.clone(),
                    challenge_type: challenge.challenge_type,
                })
            })
            .collect();
        out.sort_by(|a, b| b.instance.created_at.cmp(&a.instance.created_at));
        Ok(out)
    }

    async fn last_stopped_at(
        &self,
        team_id: i32,
        challenge_id: i32,
    ) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .state
            .lock()
            .await
            .cooldowns
            .get(&(team_id, challenge_id))
            .copied())
    }

    async fn upsert_cooldown(
        &self,
        team_id: i32,
        challenge_id: i32,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.state
            .lock()
            .await
            .cooldowns
            .insert((team_id, challenge_id), at);
        Ok(())
    }

    async fn record_instance_failure(
        &self,
        team_id: i32,
        challenge_id: i32,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.state.lock().await.failures.insert(
            (team_id, challenge_id),
            InstanceFailure {
                reason: reason.to_string(),
                failed_at: at,
            },
        );
        Ok(())
    }

    async fn instance_failure(
        &self,
        team_id: i32,
        challenge_id: i32,
    ) -> Result<Option<InstanceFailure>> {
        Ok(self
            .state
            .lock()
            .await
            .failures
            .get(&(team_id, challenge_id))
            .cloned())
    }

    async fn clear_instance_failure(&self, team_id: i32, challenge_id: i32) -> Result<()> {
        self.state
            .lock()
            .await
            .failures
            .remove(&(team_id, challenge_id));
        Ok(())
    }

    async fn has_solved(&self, team_id: i32, challenge_id: i32) -> Result<bool> {
        Ok(self
            .state
            .lock()
            .await
            .solves
            .iter()
            .any(|s| s.team_id == team_id && s.challenge_id == challenge_id))
    }

    async fn count_failed_attempts(&self, team_id: i32, challenge_id: i32) -> Result<i64> {
        let state = self.state.lock().await;
        Ok(state
            .submissions
            .iter()
            .filter(|s| {
                s.challenge_id == challenge_id
                    && !s.is_correct
                    && state.team_of(s.user_id) == Some(team_id)
            })
            .count() as i64)
    }

    async fn find_submission(
        &self,
        user_id: i32,
        challenge_id: i32,
        value: &str,
    ) -> Result<Option<Submission>> {
        Ok(self
            .state
            .lock()
            .await
            .submissions
            .iter()
            .rev()
            .find(|s| s.user_id == user_id && s.challenge_id == challenge_id && s.value == value)
            .cloned())
    }

    async fn insert_submission(&self, new: &NewSubmission) -> Result<Submission> {
        let mut state = self.state.lock().await;
        let submission = Submission {
            id: state.id(),
            user_id: new.user_id,
            challenge_id: new.challenge_id,
            value: new.value.clone(),
            is_correct: new.is_correct,
            created_at: new.created_at,
        };
        state.submissions.push(submission.clone());
        Ok(submission)
    }

    async fn record_solve(
        &self,
        challenge: &Challenge,
        team_id: i32,
        user_id: i32,
        at: DateTime<Utc>,
    ) -> Result<RecordedSolve> {
        let mut state = self.state.lock().await;
        if state
            .solves
            .iter()
            .any(|s| s.team_id == team_id && s.challenge_id == challenge.id)
        {
            return Err(Error::AlreadySolved);
        }

        let position = state
            .solves
            .iter()
            .filter(|s| s.challenge_id == challenge.id)
            .count() as i64;
        let solve = Solve {
            team_id,
            challenge_id: challenge.id,
            user_id,
            points: scoring::solve_points(challenge, position),
            created_at: at,
        };
        state.solves.push(solve.clone());

        let first_blood = scoring::first_blood_at(challenge, position)
            .map(|(bonus, badge)| scoring::first_blood_record(&solve, position, bonus, badge));
        if let Some(fb) = &first_blood {
            state.first_bloods.push(fb.clone());
        }

        Ok(RecordedSolve {
            solve,
            position,
            first_blood,
        })
    }

    async fn count_solves(&self, challenge_id: i32) -> Result<i64> {
        Ok(self
            .state
            .lock()
            .await
            .solves
            .iter()
            .filter(|s| s.challenge_id == challenge_id)
            .count() as i64)
    }

    async fn solves_for_challenge(&self, challenge_id: i32) -> Result<Vec<SolveEntry>> {
        let state = self.state.lock().await;
        let mut solves: Vec<SolveEntry> = state
            .solves
            .iter()
            .filter(|s| s.challenge_id == challenge_id)
            .map(|s| SolveEntry {
                solve: s.clone(),
                username: state
                    .users
                    .get(&s.user_id)
                    .map(|u| u.username.clone())
                    .unwrap_or_default(),
                team_name: state.teams.get(&s.team_id).cloned().unwrap_or_default(),
            })
            .collect();
        solves.sort_by(|a, b| a.solve.created_at.cmp(&b.solve.created_at));
        Ok(solves)
    }

    async fn team_solves(&self, team_id: i32) -> Result<Vec<Solve>> {
        Ok(self
            .state
            .lock()
            .await
            .solves
            .iter()
            .filter(|s| s.team_id == team_id)
            .cloned()
            .collect())
    }

    async fn all_solves(&self) -> Result<Vec<Solve>> {
        Ok(self.state.lock().await.solves.clone())
    }

    async fn first_bloods(&self, challenge_id: i32) -> Result<Vec<FirstBlood>> {
        let mut out: Vec<FirstBlood> = self
            .state
            .lock()
            .await
            .first_bloods
            .iter()
            .filter(|f| f.challenge_id == challenge_id)
            .cloned()
            .collect();
        out.sort_by_key(|f| f.position);
        Ok(out)
    }

    async fn apply_recalculation(&self, recalculation: &Recalculation) -> Result<()> {
        let mut state = self.state.lock().await;
        state.first_bloods.clear();
        for update in &recalculation.updates {
            if let Some(solve) = state
                .solves
                .iter_mut()
                .find(|s| s.team_id == update.team_id && s.challenge_id == update.challenge_id)
            {
                solve.points = update.points;
            }
        }
        state
            .first_bloods
            .extend(recalculation.first_bloods.iter().cloned());
        Ok(())
    }

    async fn hint(&self, id: i32) -> Result<Option<Hint>> {
        Ok(self.state.lock().await.hints.get(&id).cloned())
    }

    async fn activate_due_hints(&self, now: DateTime<Utc>) -> Result<Vec<Hint>> {
        let mut state = self.state.lock().await;
        let mut activated = Vec::new();
        for hint in state.hints.values_mut() {
            if !hint.is_active && hint.auto_active_at.is_some_and(|t| t <= now) {
                hint.is_active = true;
                activated.push(hint.clone());
            }
        }
        Ok(activated)
    }

    async fn purchase_hint(&self, purchase: &HintPurchase, earned: i64) -> Result<()> {
        let mut state = self.state.lock().await;
        if state
            .purchases
            .iter()
            .any(|p| p.team_id == purchase.team_id && p.hint_id == purchase.hint_id)
        {
            return Err(Error::HintAlreadyPurchased);
        }
        let spent: i64 = state
            .purchases
            .iter()
            .filter(|p| p.team_id == purchase.team_id)
            .map(|p| i64::from(p.cost))
            .sum();
        ensure_affordable(earned, spent, purchase.cost)?;
        state.purchases.push(purchase.clone());
        Ok(())
    }

    async fn team_hint_spend(&self, team_id: i32) -> Result<i64> {
        Ok(self
            .state
            .lock()
            .await
            .purchases
            .iter()
            .filter(|p| p.team_id == team_id)
            .map(|p| i64::from(p.cost))
            .sum())
    }

    async fn blacklist_token(&self, jti: &str, expires_at: DateTime<Utc>) -> Result<()> {
        self.state
            .lock()
            .await
            .blacklist
            .insert(jti.to_string(), expires_at);
        Ok(())
    }

    async fn load_blacklist(&self, now: DateTime<Utc>) -> Result<Vec<(String, DateTime<Utc>)>> {
        Ok(self
            .state
            .lock()
            .await
            .blacklist
            .iter()
            .filter(|(_, exp)| **exp > now)
            .map(|(jti, exp)| (jti.clone(), *exp))
            .collect())
    }

    async fn purge_blacklist(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.lock().await;
        let before = state.blacklist.len();
        state.blacklist.retain(|_, exp| *exp > now);
        Ok((before - state.blacklist.len()) as u64)
    }
}
