// Copyright (C) 2025 pwnthemall contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Hint purchases.
//!
//! A purchase spends from the team's available score (displayed score minus
//! earlier hint purchases). Purchases for the same team are serialized in
//! process, and the store checks the spend under its own lock, so members
//! cannot overspend even when they hit different replicas.

use serde::Serialize;
use tracing::info;

use crate::broadcast::{Audience, Event, HintPurchased, publish};
use crate::deps::Deps;
use crate::error::{Error, Result};
use crate::keyed::KeyedLocks;
use crate::models::{Hint, HintPurchase};
use crate::scores;

/// Wire message for a successful purchase.
pub const PURCHASED_MESSAGE: &str = "hint_purchased";

/// Reply to a purchase.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseOutcome {
    /// Outcome code.
    pub message: &'static str,
    /// The revealed hint.
    pub hint: Hint,
    /// Points spent.
    pub cost: i32,
    /// Set when an admin without a team tried the hint.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub test_mode: bool,
}

/// Hint purchase service.
#[derive(Clone)]
pub struct HintService {
    deps: Deps,
    teams: std::sync::Arc<KeyedLocks<i32>>,
}

impl HintService {
    /// Create a service over `deps`.
    pub fn new(deps: Deps) -> Self {
        Self {
            deps,
            teams: std::sync::Arc::new(KeyedLocks::new()),
        }
    }

    /// Buy `hint_id` for the caller's team.
    pub async fn purchase(&self, user_id: i32, hint_id: i32) -> Result<PurchaseOutcome> {
        let store = &self.deps.store;
        let hint = store.hint(hint_id).await?.ok_or(Error::HintNotFound)?;
        let user = store.user(user_id).await?.ok_or(Error::Unauthorized)?;

        let Some(team_id) = user.team_id else {
            if user.is_admin() {
                return Ok(PurchaseOutcome {
                    message: PURCHASED_MESSAGE,
                    cost: hint.cost,
                    hint,
                    test_mode: true,
                });
            }
            return Err(Error::NoTeam);
        };

        if !hint.is_active {
            return Err(Error::HintNotActive);
        }

        let _guard = self.teams.lock(team_id).await;

        // The store checks ownership and spend atomically with the insert
        let score = scores::team_score(store.as_ref(), team_id).await?;

        let now = self.deps.now();
        let purchase = HintPurchase {
            team_id,
            hint_id: hint.id,
            user_id: user.id,
            cost: hint.cost,
            created_at: now,
        };
        store.purchase_hint(&purchase, score.total).await?;

        info!(
            team_id,
            user_id = user.id,
            hint_id = hint.id,
            cost = hint.cost,
            "Hint purchased"
        );

        publish(
            self.deps.broadcaster.as_ref(),
            Audience::TeamExcept {
                team_id,
                user_id: user.id,
            },
            &Event::HintPurchase(HintPurchased {
                team_id,
                challenge_id: hint.challenge_id,
                hint_id: hint.id,
                user_id: user.id,
                hint_title: hint.title.clone(),
                hint_content: hint.content.clone(),
                cost: hint.cost,
                timestamp: now,
            }),
        );

        Ok(PurchaseOutcome {
            message: PURCHASED_MESSAGE,
            cost: hint.cost,
            hint,
            test_mode: false,
        })
    }
}
