// Copyright (C) 2025 pwnthemall contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Scoring engine.
//!
//! Pure functions over challenges, decay formulas and solves. Nothing here
//! touches storage.
//!
//! # Decay curve
//!
//! ```text
//! points(p) = max(floor, round(base / (1 + (step / 100) * ln(1 + p))))
//! floor     = min(min_points, base)
//! ```
//!
//! `p` is the 0-indexed solve position. The curve equals `base` at `p = 0`,
//! is non-increasing in `p` and never drops below `floor`. `step` spreads
//! from 10 (ultra slow) to 100 (fast).

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::models::{Challenge, DecayFormula, DecayKind, FirstBlood, Solve, SolveUpdate};

/// Badge used when a challenge lists fewer badges than bonuses.
pub const DEFAULT_BADGE: &str = "trophy";

/// Value of the decay curve at `position`.
pub fn decayed_points_at_position(base: i32, formula: &DecayFormula, position: i64) -> i32 {
    let base = base.max(0);
    if formula.kind == DecayKind::Fixed || position <= 0 {
        return base;
    }

    let floor = formula.min_points.max(0).min(base);
    let step = f64::from(formula.step.max(0)) / 100.0;
    let divisor = 1.0 + step * (1.0 + position as f64).ln();
    let value = (f64::from(base) / divisor).round() as i32;
    value.max(floor)
}

/// Live value of a challenge given how many teams solved it so far.
pub fn current_points(challenge: &Challenge, formula: &DecayFormula, solve_count: i64) -> i32 {
    if formula.kind == DecayKind::Fixed || solve_count <= 0 {
        return challenge.points.max(0);
    }
    decayed_points_at_position(challenge.points, formula, solve_count)
}

/// First-blood bonus and badge at `position`, if that position earns one.
pub fn first_blood_at(challenge: &Challenge, position: i64) -> Option<(i32, String)> {
    if !challenge.enable_first_blood || position < 0 {
        return None;
    }
    let idx = usize::try_from(position).ok()?;
    let bonus = *challenge.first_blood_bonuses.get(idx)?;
    let badge = challenge
        .first_blood_badges
        .get(idx)
        .filter(|b| !b.is_empty())
        .cloned()
        .unwrap_or_else(|| DEFAULT_BADGE.to_string());
    Some((bonus, badge))
}

/// First-blood bonus at `position`, 0 when none applies.
pub fn first_blood_bonus(challenge: &Challenge, position: i64) -> i32 {
    first_blood_at(challenge, position)
        .map(|(bonus, _)| bonus)
        .unwrap_or(0)
}

/// Points frozen on a solve at insertion time: base plus first-blood bonus.
pub fn solve_points(challenge: &Challenge, position: i64) -> i32 {
    challenge.points.max(0) + first_blood_bonus(challenge, position)
}

/// Points a team sees for a solve: live challenge value plus its frozen bonus.
pub fn displayed_points(
    challenge: &Challenge,
    formula: &DecayFormula,
    solve_count: i64,
    position: i64,
) -> i64 {
    i64::from(current_points(challenge, formula, solve_count))
        + i64::from(first_blood_bonus(challenge, position))
}

/// Output of a full recomputation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Recalculation {
    /// Solves whose points changed.
    pub updates: Vec<SolveUpdate>,
    /// First-blood rows to write.
    pub first_bloods: Vec<FirstBlood>,
}

/// Recompute every solve's points from scratch.
///
/// Solves are walked in `(challenge_id, created_at)` order regardless of the
/// input order. Solves whose challenge is missing from `challenges` are skipped.
pub fn recalculate(
    challenges: &HashMap<i32, (Challenge, DecayFormula)>,
    solves: &[Solve],
) -> Recalculation {
    let mut ordered: Vec<&Solve> = solves.iter().collect();
    ordered.sort_by(|a, b| {
        a.challenge_id
            .cmp(&b.challenge_id)
            .then(a.created_at.cmp(&b.created_at))
            .then(a.team_id.cmp(&b.team_id))
    });

    let mut out = Recalculation::default();
    let mut current: Option<i32> = None;
    let mut position: i64 = 0;

    for solve in ordered {
        if current != Some(solve.challenge_id) {
            current = Some(solve.challenge_id);
            position = 0;
        }
        let Some((challenge, formula)) = challenges.get(&solve.challenge_id) else {
            continue;
        };

        let first_blood = first_blood_at(challenge, position);
        let bonus = first_blood.as_ref().map(|(b, _)| *b).unwrap_or(0);
        out.updates.push(SolveUpdate {
            team_id: solve.team_id,
            challenge_id: solve.challenge_id,
            points: decayed_points_at_position(challenge.points, formula, position) + bonus,
        });
        if let Some((bonus, badge)) = first_blood {
            out.first_bloods.push(first_blood_record(solve, position, bonus, badge));
        }
        position += 1;
    }

    out
}

/// Build the FirstBlood row for a solve.
pub fn first_blood_record(solve: &Solve, position: i64, bonus: i32, badge: String) -> FirstBlood {
    FirstBlood {
        challenge_id: solve.challenge_id,
        team_id: solve.team_id,
        user_id: solve.user_id,
        position: position as i32,
        bonus,
        badge,
        created_at: solve.created_at,
    }
}

/// Team score summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub struct TeamScore {
    /// Sum of solve points.
    pub total: i64,
    /// Points spent on hints.
    pub spent: i64,
    /// Points left to spend.
    pub available: i64,
    /// Number of solves.
    pub solves: i64,
}

/// Per-solve input for [`team_score`].
#[derive(Debug, Clone)]
pub struct ScoredSolve<'a> {
    /// Solved challenge.
    pub challenge: &'a Challenge,
    /// Its decay formula.
    pub formula: &'a DecayFormula,
    /// Solves before this one.
    pub solve_count: i64,
    /// Zero-based solve position.
    pub position: i64,
}

/// Sum displayed points and subtract hint spending.
pub fn team_score<'a>(solves: impl IntoIterator<Item = ScoredSolve<'a>>, spent: i64) -> TeamScore {
    let mut total = 0;
    let mut count = 0;
    for s in solves {
        total += displayed_points(s.challenge, s.formula, s.solve_count, s.position);
        count += 1;
    }
    TeamScore {
        total,
        spent,
        available: total - spent,
        solves: count,
    }
}

/// Position of a solve made at `at` among `timestamps` of the same challenge.
pub fn position_of(at: DateTime<Utc>, timestamps: impl IntoIterator<Item = DateTime<Utc>>) -> i64 {
    timestamps.into_iter().filter(|t| *t < at).count() as i64
}
