// Copyright (C) 2025 pwnthemall contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Submission pipeline.
//!
//! Checks a flag or coordinate guess against a challenge, records the
//! attempt and, when correct, the team's solve. Guards run in a fixed order:
//! team, CTF window, existing solve, attempt cap, prerequisite, duplicate.
//! An admin without a team is in test mode: answers are checked but nothing
//! is recorded.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::broadcast::{Audience, Event, TeamSolve, publish};
use crate::ctf::{CtfStatus, CtfWindow};
use crate::deps::Deps;
use crate::error::{Error, Result};
use crate::flag;
use crate::geo;
use crate::models::{Challenge, ChallengeType, GeoSpec, NewSubmission, User};
use crate::orchestrator::Orchestrator;
use crate::scores;

/// Wire message for a correct answer.
pub const SOLVED_MESSAGE: &str = "challenge_solved";

/// Request body: a flag, a coordinate pair, or both.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SubmitPayload {
    /// Text answer.
    #[serde(default)]
    pub flag: Option<String>,
    /// Latitude for location challenges.
    #[serde(default)]
    pub lat: Option<f64>,
    /// Longitude for location challenges.
    #[serde(default)]
    pub lng: Option<f64>,
}

/// Reply to a correct answer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitOutcome {
    /// Outcome code.
    pub message: &'static str,
    /// Set when an admin without a team submitted.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub test_mode: bool,
}

/// A validated answer.
#[derive(Debug, Clone, PartialEq)]
struct Answer {
    text: Option<String>,
    point: Option<(f64, f64)>,
}

impl Answer {
    fn from_payload(payload: &SubmitPayload) -> Result<Self> {
        let point = match (payload.lat, payload.lng) {
            (Some(lat), Some(lng)) => {
                if !geo::is_valid_coordinate(lat, lng) {
                    return Err(Error::InvalidInput("coordinates out of range".into()));
                }
                Some((lat, lng))
            }
            (None, None) => None,
            _ => return Err(Error::InvalidInput("lat and lng must be given together".into())),
        };
        let text = payload.flag.clone();
        if text.is_none() && point.is_none() {
            return Err(Error::InvalidInput("flag or coordinates required".into()));
        }
        Ok(Self { text, point })
    }

    /// Value used for duplicate detection and storage.
    fn value(&self) -> String {
        match (&self.text, self.point) {
            (Some(text), _) => text.clone(),
            (None, Some((lat, lng))) => flag::geo_submission_value(lat, lng),
            (None, None) => String::new(),
        }
    }
}

fn wrong_answer(challenge: &Challenge) -> Error {
    if challenge.challenge_type == ChallengeType::Geo {
        Error::IncorrectLocation
    } else {
        Error::WrongFlag
    }
}

/// Flag submission service.
#[derive(Clone)]
pub struct SubmissionService {
    deps: Deps,
    orchestrator: Orchestrator,
    window: CtfWindow,
}

impl SubmissionService {
    /// Create the service. `window` bounds when answers are accepted.
    pub fn new(deps: Deps, orchestrator: Orchestrator, window: CtfWindow) -> Self {
        Self {
            deps,
            orchestrator,
            window,
        }
    }

    /// Judge a submission from `user_id` for `challenge_id`.
    pub async fn submit(
        &self,
        user_id: i32,
        challenge_id: i32,
        payload: &SubmitPayload,
    ) -> Result<SubmitOutcome> {
        let store = &self.deps.store;
        let challenge = store
            .challenge(challenge_id)
            .await?
            .ok_or(Error::ChallengeNotFound)?;
        let answer = Answer::from_payload(payload)?;
        let user = store.user(user_id).await?.ok_or(Error::Unauthorized)?;

        let team_id = match user.team_id {
            Some(team_id) => team_id,
            None if user.is_admin() => return self.test_submission(&user, &challenge, &answer).await,
            None => return Err(Error::TeamRequired),
        };

        if !user.is_admin() {
            match self.window.status(self.deps.now()) {
                CtfStatus::NotStarted => return Err(Error::CtfNotStarted),
                CtfStatus::Ended => return Err(Error::CtfEnded),
                CtfStatus::Active | CtfStatus::NoTiming => {}
            }
            if challenge.hidden {
                return Err(Error::ChallengeNotFound);
            }
        }

        if store.has_solved(team_id, challenge.id).await? {
            return Err(Error::AlreadySolved);
        }
        if challenge.max_attempts > 0
            && store.count_failed_attempts(team_id, challenge.id).await?
                >= i64::from(challenge.max_attempts)
        {
            return Err(Error::MaxAttemptsReached);
        }
        if !user.is_admin()
            && !scores::prerequisite_met(store.as_ref(), Some(team_id), &challenge).await?
        {
            return Err(Error::ChallengeNotFound);
        }

        let stored_wrong = flag::truncate_submission(&answer.value());
        if challenge.challenge_type != ChallengeType::Geo
            && let Some(previous) = store
                .find_submission(user.id, challenge.id, &stored_wrong)
                .await?
        {
            return Err(if previous.is_correct {
                Error::AlreadySolved
            } else if challenge.max_attempts > 0 {
                Error::FlagAlreadySubmitted
            } else {
                wrong_answer(&challenge)
            });
        }

        let correct = self.is_correct(&challenge, &answer).await?;
        let now = self.deps.now();
        store
            .insert_submission(&NewSubmission {
                user_id: user.id,
                challenge_id: challenge.id,
                value: if correct {
                    flag::hash_flag(&answer.value())
                } else {
                    stored_wrong
                },
                is_correct: correct,
                created_at: now,
            })
            .await?;

        if !correct {
            debug!(user_id = user.id, challenge_id = challenge.id, "Wrong answer");
            return Err(wrong_answer(&challenge));
        }

        let recorded = store.record_solve(&challenge, team_id, user.id, now).await?;
        info!(
            team_id,
            user_id = user.id,
            challenge_id = challenge.id,
            position = recorded.position,
            points = recorded.solve.points,
            first_blood = recorded.first_blood.is_some(),
            "Challenge solved"
        );

        self.orchestrator
            .stop_after_solve(team_id, challenge.id, challenge.challenge_type);
        publish(
            self.deps.broadcaster.as_ref(),
            Audience::TeamExcept {
                team_id,
                user_id: user.id,
            },
            &Event::TeamSolve(TeamSolve {
                team_id,
                challenge_id: challenge.id,
                challenge_name: challenge.name.clone(),
                points: recorded.solve.points,
                user_id: user.id,
                username: user.username.clone(),
                timestamp: now,
            }),
        );

        Ok(SubmitOutcome {
            message: SOLVED_MESSAGE,
            test_mode: false,
        })
    }

    async fn test_submission(
        &self,
        user: &User,
        challenge: &Challenge,
        answer: &Answer,
    ) -> Result<SubmitOutcome> {
        let correct = self.is_correct(challenge, answer).await?;
        debug!(
            admin = %user.username,
            challenge_id = challenge.id,
            correct,
            "Test-mode submission"
        );
        if !correct {
            return Err(wrong_answer(challenge));
        }
        Ok(SubmitOutcome {
            message: SOLVED_MESSAGE,
            test_mode: true,
        })
    }

    async fn is_correct(&self, challenge: &Challenge, answer: &Answer) -> Result<bool> {
        let flags = self.deps.store.flags(challenge.id).await?;

        if let Some(text) = &answer.text
            && flag::matches_text(text, flags.iter().map(|f| f.value.as_str()))
        {
            return Ok(true);
        }

        let Some((lat, lng)) = answer.point else {
            return Ok(false);
        };
        let mut specs: Vec<GeoSpec> = flags
            .iter()
            .filter_map(|f| flag::decode_geo(&f.value))
            .collect();
        if challenge.challenge_type == ChallengeType::Geo
            && let Some(spec) = self.deps.store.geo_spec(challenge.id).await?
        {
            specs.push(spec);
        }
        Ok(flag::matches_geo(lat, lng, specs.iter()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_answer_requires_something() {
        let err = Answer::from_payload(&SubmitPayload::default()).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn test_answer_rejects_half_coordinates() {
        let payload = SubmitPayload {
            lat: Some(1.0),
            ..Default::default()
        };
        assert!(matches!(
            Answer::from_payload(&payload),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_answer_rejects_out_of_range() {
        let payload = SubmitPayload {
            lat: Some(91.0),
            lng: Some(0.0),
            ..Default::default()
        };
        assert!(matches!(
            Answer::from_payload(&payload),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_answer_value() {
        let text = Answer::from_payload(&SubmitPayload {
            flag: Some("PTA{x}".into()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(text.value(), "PTA{x}");

        let point = Answer::from_payload(&SubmitPayload {
            lat: Some(48.857),
            lng: Some(2.353),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(point.value(), "geo:48.857000,2.353000");
    }

    #[test]
    fn test_outcome_shape() {
        let solved = serde_json::to_value(SubmitOutcome {
            message: SOLVED_MESSAGE,
            test_mode: false,
        })
        .unwrap();
        assert_eq!(solved, serde_json::json!({"message": "challenge_solved"}));

        let test = serde_json::to_value(SubmitOutcome {
            message: SOLVED_MESSAGE,
            test_mode: true,
        })
        .unwrap();
        assert_eq!(
            test,
            serde_json::json!({"message": "challenge_solved", "testMode": true})
        );
    }
}
