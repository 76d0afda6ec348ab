// Copyright (C) 2025 pwnthemall contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Flag submission, first blood and score tests.

mod common;

use std::io::Read;

use common::TestContext;
use pta_core::Error;
use pta_core::broadcast::Audience;
use pta_core::ctf::CtfWindow;
use pta_core::export;
use pta_core::models::Role;
use pta_core::scores;
use pta_core::store::Store;
use pta_core::submission::{SubmissionService, SubmitPayload};

const FIRST_BLOOD_YAML: &str = r#"
name: Race
type: standard
points: 500
flags: ["FLAG{race}"]
first_blood:
  bonuses: [100, 50, 25]
  badges: [gold, silver, bronze]
"#;

const GEO_YAML: &str = r#"
name: Paris
type: geo
points: 300
target_lat: 48.8566
target_lng: 2.3522
radius_km: 1
"#;

fn flag(value: &str) -> SubmitPayload {
    SubmitPayload {
        flag: Some(value.to_string()),
        ..Default::default()
    }
}

fn point(lat: f64, lng: f64) -> SubmitPayload {
    SubmitPayload {
        lat: Some(lat),
        lng: Some(lng),
        ..Default::default()
    }
}

// ============================================================================
// Flags
// ============================================================================

#[tokio::test]
async fn test_correct_flag_records_solve() {
    let ctx = TestContext::new().await;
    let challenge = ctx.standard_challenge("quiz", "FLAG{quiz}").await;
    let (team_id, users) = ctx.team("red", 2).await;

    let outcome = ctx
        .state
        .submissions
        .submit(users[0].id, challenge.id, &flag("  FLAG{quiz}\n"))
        .await
        .unwrap();
    assert_eq!(outcome.message, "challenge_solved");
    assert!(!outcome.test_mode);

    let solves = ctx.store.team_solves(team_id).await.unwrap();
    assert_eq!(solves.len(), 1);
    assert_eq!(solves[0].points, 100);
    assert_eq!(solves[0].user_id, users[0].id);

    let solved = ctx.events.events("team_solve");
    assert_eq!(solved.len(), 1);
    assert_eq!(
        solved[0].0,
        Audience::TeamExcept {
            team_id,
            user_id: users[0].id
        }
    );
}

#[tokio::test]
async fn test_wrong_flag_is_stored_truncated() {
    let ctx = TestContext::new().await;
    let challenge = ctx.standard_challenge("quiz", "FLAG{quiz}").await;
    let (_, users) = ctx.team("red", 1).await;
    let guess = "x".repeat(1000);

    let err = ctx
        .state
        .submissions
        .submit(users[0].id, challenge.id, &flag(&guess))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::WrongFlag));
    assert_eq!(err.status().as_u16(), 403);

    let submissions = ctx.store.submissions().await;
    assert_eq!(submissions.len(), 1);
    assert!(!submissions[0].is_correct);
    assert_eq!(submissions[0].value.len(), 256);
}

#[tokio::test]
async fn test_repeated_correct_flags_solve_once() {
    let ctx = TestContext::new().await;
    let challenge = ctx.challenge("race", FIRST_BLOOD_YAML).await;
    let (team_id, users) = ctx.team("red", 3).await;

    ctx.state
        .submissions
        .submit(users[0].id, challenge.id, &flag("FLAG{race}"))
        .await
        .unwrap();
    for user in &users {
        let err = ctx
            .state
            .submissions
            .submit(user.id, challenge.id, &flag("FLAG{race}"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadySolved));
        assert_eq!(err.status().as_u16(), 409);
    }

    assert_eq!(ctx.store.team_solves(team_id).await.unwrap().len(), 1);
    assert_eq!(ctx.store.all_first_bloods().await.len(), 1);
}

#[tokio::test]
async fn test_duplicate_wrong_flag_with_attempt_limit() {
    let ctx = TestContext::new().await;
    let challenge = ctx
        .challenge("capped", "name: Capped\npoints: 50\nattempts: 3\nflags: [right]\n")
        .await;
    let (_, users) = ctx.team("red", 2).await;
    let submit = |user: i32, value: &'static str| {
        let submissions = ctx.state.submissions.clone();
        let id = challenge.id;
        async move { submissions.submit(user, id, &flag(value)).await }
    };

    assert!(matches!(submit(users[0].id, "one").await, Err(Error::WrongFlag)));
    assert!(matches!(
        submit(users[0].id, "one").await,
        Err(Error::FlagAlreadySubmitted)
    ));
    assert!(matches!(submit(users[1].id, "two").await, Err(Error::WrongFlag)));
    assert!(matches!(submit(users[1].id, "three").await, Err(Error::WrongFlag)));
    assert!(matches!(
        submit(users[0].id, "right").await,
        Err(Error::MaxAttemptsReached)
    ));
}

#[tokio::test]
async fn test_invalid_payloads() {
    let ctx = TestContext::new().await;
    let challenge = ctx.standard_challenge("quiz", "FLAG{quiz}").await;
    let (_, users) = ctx.team("red", 1).await;
    let submissions = &ctx.state.submissions;

    let empty = SubmitPayload::default();
    let half = SubmitPayload {
        lat: Some(10.0),
        ..Default::default()
    };
    for payload in [empty, half, point(91.0, 0.0)] {
        let err = submissions.submit(users[0].id, challenge.id, &payload).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)), "{:?}", payload);
    }
    assert!(ctx.store.submissions().await.is_empty());

    let err = submissions.submit(users[0].id, 777, &flag("x")).await.unwrap_err();
    assert!(matches!(err, Error::ChallengeNotFound));
}

#[tokio::test]
async fn test_user_without_team() {
    let ctx = TestContext::new().await;
    let challenge = ctx.standard_challenge("quiz", "FLAG{quiz}").await;
    let loner = ctx.store.add_user("loner", Role::Member, None).await;

    let err = ctx
        .state
        .submissions
        .submit(loner.id, challenge.id, &flag("FLAG{quiz}"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::TeamRequired));
}

#[tokio::test]
async fn test_admin_without_team_tests_flags() {
    let ctx = TestContext::new().await;
    let challenge = ctx
        .challenge("secret", "name: Secret\nhidden: true\npoints: 10\nflags: [s3cret]\n")
        .await;
    let admin = ctx.admin(None).await;

    let outcome = ctx
        .state
        .submissions
        .submit(admin.id, challenge.id, &flag("s3cret"))
        .await
        .unwrap();
    assert!(outcome.test_mode);
    assert_eq!(
        serde_json::to_value(&outcome).unwrap(),
        serde_json::json!({"message": "challenge_solved", "testMode": true})
    );

    let err = ctx
        .state
        .submissions
        .submit(admin.id, challenge.id, &flag("nope"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::WrongFlag));

    assert!(ctx.store.submissions().await.is_empty());
    assert!(ctx.store.all_solves().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_hidden_challenge_is_not_found_for_members() {
    let ctx = TestContext::new().await;
    let challenge = ctx
        .challenge("secret", "name: Secret\nhidden: true\npoints: 10\nflags: [s3cret]\n")
        .await;
    let (_, users) = ctx.team("red", 1).await;

    let err = ctx
        .state
        .submissions
        .submit(users[0].id, challenge.id, &flag("s3cret"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ChallengeNotFound));
}

#[tokio::test]
async fn test_prerequisite_must_be_solved() {
    let ctx = TestContext::new().await;
    let first = ctx.standard_challenge("first", "FLAG{1}").await;
    let second = ctx
        .challenge(
            "second",
            "name: second\npoints: 100\ndepends_on: first\nflags: [\"FLAG{2}\"]\n",
        )
        .await;
    let (_, users) = ctx.team("red", 1).await;
    let submissions = &ctx.state.submissions;

    let err = submissions
        .submit(users[0].id, second.id, &flag("FLAG{2}"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ChallengeNotFound));

    submissions.submit(users[0].id, first.id, &flag("FLAG{1}")).await.unwrap();
    submissions.submit(users[0].id, second.id, &flag("FLAG{2}")).await.unwrap();
}

#[tokio::test]
async fn test_ctf_window_is_enforced_for_members() {
    let ctx = TestContext::new().await;
    let challenge = ctx.standard_challenge("quiz", "FLAG{quiz}").await;
    let (_, users) = ctx.team("red", 1).await;
    let admin = ctx.admin(Some(users[0].team_id.unwrap())).await;

    let start = common::t0() + chrono::Duration::hours(1);
    let end = common::t0() + chrono::Duration::hours(2);
    let service = SubmissionService::new(
        ctx.state.deps.clone(),
        ctx.state.orchestrator.clone(),
        CtfWindow::new(Some(start), Some(end)),
    );

    let err = service.submit(users[0].id, challenge.id, &flag("FLAG{quiz}")).await.unwrap_err();
    assert!(matches!(err, Error::CtfNotStarted));
    assert_eq!(err.error_code(), "flag_submission_not_available_yet");

    ctx.advance(3 * 3600);
    let err = service.submit(users[0].id, challenge.id, &flag("FLAG{quiz}")).await.unwrap_err();
    assert!(matches!(err, Error::CtfEnded));

    service.submit(admin.id, challenge.id, &flag("FLAG{quiz}")).await.unwrap();
}

// ============================================================================
// First blood and scores
// ============================================================================

#[tokio::test]
async fn test_first_blood_bonuses_in_solve_order() {
    let ctx = TestContext::new().await;
    let challenge = ctx.challenge("race", FIRST_BLOOD_YAML).await;

    let mut teams = Vec::new();
    for name in ["t1", "t2", "t3", "t4"] {
        let (team_id, users) = ctx.team(name, 1).await;
        ctx.state
            .submissions
            .submit(users[0].id, challenge.id, &flag("FLAG{race}"))
            .await
            .unwrap();
        ctx.advance(1);
        teams.push(team_id);
    }

    let points: Vec<i32> = {
        let mut out = Vec::new();
        for team_id in &teams {
            out.push(ctx.store.team_solves(*team_id).await.unwrap()[0].points);
        }
        out
    };
    assert_eq!(points, vec![600, 550, 525, 500]);

    let bloods = ctx.store.first_bloods(challenge.id).await.unwrap();
    assert_eq!(bloods.len(), 3);
    let summary: Vec<(i32, i32, &str)> = bloods
        .iter()
        .map(|b| (b.team_id, b.position, b.badge.as_str()))
        .collect();
    assert_eq!(
        summary,
        vec![
            (teams[0], 0, "gold"),
            (teams[1], 1, "silver"),
            (teams[2], 2, "bronze"),
        ]
    );
}

#[tokio::test]
async fn test_recalculation_rebuilds_first_bloods() {
    let ctx = TestContext::new().await;
    let challenge = ctx.challenge("race", FIRST_BLOOD_YAML).await;
    for name in ["t1", "t2", "t3", "t4", "t5"] {
        let (_, users) = ctx.team(name, 1).await;
        ctx.state
            .submissions
            .submit(users[0].id, challenge.id, &flag("FLAG{race}"))
            .await
            .unwrap();
        ctx.advance(1);
    }

    let summary = scores::recalculate(ctx.store.as_ref()).await.unwrap();
    assert_eq!(summary.first_bloods, 3);

    let bloods = ctx.store.first_bloods(challenge.id).await.unwrap();
    let positions: Vec<(i32, i32)> = bloods.iter().map(|b| (b.position, b.bonus)).collect();
    assert_eq!(positions, vec![(0, 100), (1, 50), (2, 25)]);

    let solves = scores::challenge_solves(ctx.store.as_ref(), challenge.id).await.unwrap();
    assert_eq!(solves.len(), 5);
    assert!(solves[0].first_blood.is_some());
    assert!(solves[4].first_blood.is_none());
}

#[tokio::test]
async fn test_team_score_counts_solves() {
    let ctx = TestContext::new().await;
    let a = ctx.standard_challenge("alpha", "FLAG{a}").await;
    let b = ctx.standard_challenge("bravo", "FLAG{b}").await;
    let (team_id, users) = ctx.team("red", 2).await;

    ctx.state.submissions.submit(users[0].id, a.id, &flag("FLAG{a}")).await.unwrap();
    ctx.state.submissions.submit(users[1].id, b.id, &flag("FLAG{b}")).await.unwrap();

    let score = scores::team_score(ctx.store.as_ref(), team_id).await.unwrap();
    assert_eq!(score.solves, 2);
    assert_eq!(score.total, 200);
    assert_eq!(score.available, 200);
}

// ============================================================================
// Geo
// ============================================================================

#[tokio::test]
async fn test_geo_answer_within_radius() {
    let ctx = TestContext::new().await;
    let challenge = ctx.challenge("paris", GEO_YAML).await;
    let (team_id, users) = ctx.team("red", 1).await;

    ctx.state
        .submissions
        .submit(users[0].id, challenge.id, &point(48.8570, 2.3530))
        .await
        .unwrap();

    let solves = ctx.store.team_solves(team_id).await.unwrap();
    assert_eq!(solves.len(), 1);
    assert_eq!(solves[0].points, 300);
}

#[tokio::test]
async fn test_geo_answer_outside_radius() {
    let ctx = TestContext::new().await;
    let challenge = ctx.challenge("paris", GEO_YAML).await;
    let (_, users) = ctx.team("red", 1).await;

    let err = ctx
        .state
        .submissions
        .submit(users[0].id, challenge.id, &point(51.5074, -0.1278))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::IncorrectLocation));
    assert_eq!(err.error_code(), "incorrect_location");

    // Same wrong point again is judged again.
    let err = ctx
        .state
        .submissions
        .submit(users[0].id, challenge.id, &point(51.5074, -0.1278))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::IncorrectLocation));
    assert_eq!(ctx.store.submissions().await.len(), 2);
}

// ============================================================================
// Instances
// ============================================================================

#[tokio::test]
async fn test_solve_stops_running_instance() {
    let ctx = TestContext::new().await;
    let challenge = ctx.docker_challenge("web", "FLAG{web}").await;
    let (team_id, users) = ctx.team("red", 2).await;

    ctx.state.orchestrator.start(users[0].id, challenge.id).await.unwrap();
    ctx.state
        .submissions
        .submit(users[0].id, challenge.id, &flag("FLAG{web}"))
        .await
        .unwrap();
    assert_eq!(ctx.store.team_solves(team_id).await.unwrap().len(), 1);

    let store = ctx.store.clone();
    let challenge_id = challenge.id;
    assert!(
        ctx.eventually(|| {
            let store = store.clone();
            async move { matches!(store.instance_for(team_id, challenge_id).await, Ok(None)) }
        })
        .await
    );

    let stopped: Vec<_> = ctx
        .events
        .events("instance_update")
        .into_iter()
        .filter(|(_, v)| v["status"] == "stopped")
        .collect();
    assert_eq!(stopped.len(), 1);
    assert_eq!(stopped[0].0, Audience::Team(team_id));

    let err = ctx
        .state
        .submissions
        .submit(users[1].id, challenge.id, &flag("FLAG{web}"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AlreadySolved));
    assert!(ctx.store.instance_for(team_id, challenge.id).await.unwrap().is_none());
}

// ============================================================================
// Flag secrecy
// ============================================================================

#[tokio::test]
async fn test_plaintext_flags_are_never_persisted() {
    let ctx = TestContext::new().await;
    let secret = "FLAG{do_not_leak_me}";
    ctx.objects
        .put_text(
            pta_core::object_store::Bucket::Challenges,
            "leak/app.py",
            "print('hello')\n",
        )
        .await;
    let challenge = ctx
        .challenge(
            "leak",
            &format!(
                "name: Leak\npoints: 100\nfiles: [app.py]\nflags: [\"{}\"]\nfirst_blood:\n  bonuses: [10]\n  badges: [gold]\n",
                secret
            ),
        )
        .await;
    let (_, users) = ctx.team("red", 1).await;
    ctx.state
        .submissions
        .submit(users[0].id, challenge.id, &flag(secret))
        .await
        .unwrap();

    let stored = ctx.store.challenge(challenge.id).await.unwrap().unwrap();
    assert!(!format!("{:?}", stored).contains(secret));
    for f in ctx.store.flags(challenge.id).await.unwrap() {
        assert!(!f.value.contains("do_not_leak_me"));
    }
    for s in ctx.store.submissions().await {
        assert!(!s.value.contains("do_not_leak_me"));
    }
    assert!(!format!("{:?}", ctx.store.all_first_bloods().await).contains("do_not_leak_me"));

    let archive = export::export_challenge(&ctx.state.deps, challenge.id).await.unwrap();
    assert_eq!(archive.file_name, "leak.zip");
    let mut zip = zip::ZipArchive::new(std::io::Cursor::new(archive.bytes.to_vec())).unwrap();
    for i in 0..zip.len() {
        let mut entry = zip.by_index(i).unwrap();
        let mut body = Vec::new();
        entry.read_to_end(&mut body).unwrap();
        assert!(!String::from_utf8_lossy(&body).contains("do_not_leak_me"));
    }
}
