// Copyright (C) 2025 pwnthemall contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Score queries and the admin recalculation, wiring [`crate::scoring`] to
//! the store.

use std::collections::HashMap;

use serde::Serialize;
use tracing::info;

use crate::error::{Error, Result};
use crate::models::{Challenge, DecayFormula, FirstBlood, SolveEntry, User};
use crate::scoring::{self, ScoredSolve, TeamScore};
use crate::store::Store;

/// Summary of a recalculation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecalculationSummary {
    /// Solves whose points changed.
    pub updated: usize,
    /// First-blood rows written.
    pub first_bloods: usize,
}

/// A solve as listed under its challenge.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SolveView {
    /// Solve with display names.
    #[serde(flatten)]
    pub entry: SolveEntry,
    /// Points under the current decay.
    pub current_points: i32,
    /// Badge, when one was earned.
    pub first_blood: Option<FirstBlood>,
}

/// Formula assigned to a challenge, falling back to a fixed curve.
pub async fn formula_for(store: &dyn Store, challenge: &Challenge) -> Result<DecayFormula> {
    Ok(match challenge.decay_formula_id {
        Some(id) => store.decay_formula(id).await?.unwrap_or_else(DecayFormula::fixed),
        None => DecayFormula::fixed(),
    })
}

/// Rewrite every solve's points and rebuild first bloods.
pub async fn recalculate(store: &dyn Store) -> Result<RecalculationSummary> {
    let mut formulas: HashMap<i32, DecayFormula> = HashMap::new();
    let mut challenges = HashMap::new();
    for challenge in store.list_challenges().await? {
        let formula = match challenge.decay_formula_id {
            Some(id) => match formulas.get(&id) {
                Some(f) => f.clone(),
                None => {
                    let f = store.decay_formula(id).await?.unwrap_or_else(DecayFormula::fixed);
                    formulas.insert(id, f.clone());
                    f
                }
            },
            None => DecayFormula::fixed(),
        };
        challenges.insert(challenge.id, (challenge, formula));
    }

    let solves = store.all_solves().await?;
    let recalculation = scoring::recalculate(&challenges, &solves);
    store.apply_recalculation(&recalculation).await?;

    let summary = RecalculationSummary {
        updated: recalculation.updates.len(),
        first_bloods: recalculation.first_bloods.len(),
    };
    info!(
        updated = summary.updated,
        first_bloods = summary.first_bloods,
        "Scores recalculated"
    );
    Ok(summary)
}

/// Solves of a challenge, oldest first, with its live value.
pub async fn challenge_solves(store: &dyn Store, challenge_id: i32) -> Result<Vec<SolveView>> {
    let challenge = store
        .challenge(challenge_id)
        .await?
        .ok_or(Error::ChallengeNotFound)?;
    let formula = formula_for(store, &challenge).await?;
    let entries = store.solves_for_challenge(challenge_id).await?;
    let current_points = scoring::current_points(&challenge, &formula, entries.len() as i64);

    let mut first_bloods: HashMap<i32, FirstBlood> = store
        .first_bloods(challenge_id)
        .await?
        .into_iter()
        .map(|fb| (fb.team_id, fb))
        .collect();

    Ok(entries
        .into_iter()
        .map(|entry| SolveView {
            first_blood: first_bloods.remove(&entry.solve.team_id),
            entry,
            current_points,
        })
        .collect())
}

/// Whether the team solved the challenge named by `depends_on`. A caller
/// without a team never meets a prerequisite.
pub async fn prerequisite_met(
    store: &dyn Store,
    team_id: Option<i32>,
    challenge: &Challenge,
) -> Result<bool> {
    let Some(required) = challenge.depends_on.as_deref() else {
        return Ok(true);
    };
    let Some(team_id) = team_id else {
        return Ok(false);
    };
    let solved = store.team_solves(team_id).await?;
    if solved.is_empty() {
        return Ok(false);
    }
    let challenges = store.list_challenges().await?;
    Ok(challenges
        .iter()
        .filter(|c| c.name == required)
        .any(|c| solved.iter().any(|s| s.challenge_id == c.id)))
}

/// Whether `user` may see the challenge at all: admins always, members when
/// it is not hidden and its prerequisite is solved.
pub async fn visible_to(store: &dyn Store, user: &User, challenge: &Challenge) -> Result<bool> {
    if user.is_admin() {
        return Ok(true);
    }
    if challenge.hidden {
        return Ok(false);
    }
    prerequisite_met(store, user.team_id, challenge).await
}

/// A team's displayed score minus hint spending.
pub async fn team_score(store: &dyn Store, team_id: i32) -> Result<TeamScore> {
    let solves = store.team_solves(team_id).await?;

    let mut resolved = Vec::with_capacity(solves.len());
    for solve in &solves {
        let Some(challenge) = store.challenge(solve.challenge_id).await? else {
            continue;
        };
        let formula = formula_for(store, &challenge).await?;
        let all = store.solves_for_challenge(challenge.id).await?;
        let position = scoring::position_of(solve.created_at, all.iter().map(|e| e.solve.created_at));
        resolved.push((challenge, formula, all.len() as i64, position));
    }

    let spent = store.team_hint_spend(team_id).await?;
    Ok(scoring::team_score(
        resolved
            .iter()
            .map(|(challenge, formula, solve_count, position)| ScoredSolve {
                challenge,
                formula,
                solve_count: *solve_count,
                position: *position,
            }),
        spent,
    ))
}
