// Copyright (C) 2025 pwnthemall contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instance lifecycle tests over the memory store and mock runtime.

mod common;

use std::collections::HashSet;

use common::TestContext;
use pta_core::Error;
use pta_core::container::MockRuntime;
use pta_core::models::{InstanceStatus, Role};
use pta_core::object_store::Bucket;
use pta_core::store::Store;
use pta_core::submission::SubmitPayload;

const COMPOSE_YAML: &str = r#"
services:
  web:
    image: nginx:alpine
    ports:
      - "80"
  api:
    image: python:3.12-slim
    ports:
      - 5000
"#;

// ============================================================================
// Start
// ============================================================================

#[tokio::test]
async fn test_start_docker_instance() {
    let ctx = TestContext::new().await;
    let challenge = ctx.docker_challenge("web", "FLAG{web}").await;
    let (team_id, users) = ctx.team("red", 2).await;

    let outcome = ctx
        .state
        .orchestrator
        .start(users[0].id, challenge.id)
        .await
        .unwrap();

    assert_eq!(outcome.status, InstanceStatus::Running);
    assert_eq!(outcome.name, "pta-web");
    assert_eq!(outcome.ports, vec![40000]);
    assert_eq!(outcome.connection_info, vec!["http://10.0.0.5:40000"]);

    let spec = ctx.runtime.container("pta-web").await.unwrap();
    assert_eq!(spec.ports, vec![(80, 40000)]);
    assert_eq!(spec.network, format!("team_{}_network", team_id));

    let instance = ctx.store.instance_for(team_id, challenge.id).await.unwrap().unwrap();
    assert_eq!(instance.user_id, users[0].id);
    assert_eq!(instance.expires_at, common::t0() + chrono::Duration::minutes(60));

    let updates = ctx.events.events("instance_update");
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].1["status"], "running");
}

#[tokio::test]
async fn test_second_start_returns_existing_instance() {
    let ctx = TestContext::new().await;
    let challenge = ctx.docker_challenge("web", "FLAG{web}").await;
    let (team_id, users) = ctx.team("red", 2).await;
    ctx.docker_config(|c| c.instances_by_user = 5).await;

    let first = ctx.state.orchestrator.start(users[0].id, challenge.id).await.unwrap();
    let second = ctx.state.orchestrator.start(users[1].id, challenge.id).await.unwrap();

    assert_eq!(first.name, second.name);
    assert_eq!(first.ports, second.ports);
    assert_eq!(ctx.runtime.running().await.len(), 1);
    assert_eq!(ctx.store.count_team_instances(team_id).await.unwrap(), 1);
}

#[tokio::test]
async fn test_concurrent_starts_create_one_instance() {
    let ctx = TestContext::new().await;
    let challenge = ctx.docker_challenge("web", "FLAG{web}").await;
    let (team_id, users) = ctx.team("red", 4).await;
    ctx.docker_config(|c| c.instances_by_user = 5).await;

    let starts = users
        .iter()
        .map(|u| ctx.state.orchestrator.start(u.id, challenge.id));
    let results = futures::future::join_all(starts).await;

    assert!(results.iter().all(|r| r.is_ok()));
    let names: HashSet<_> = results.into_iter().map(|r| r.unwrap().name).collect();
    assert_eq!(names.len(), 1);
    assert_eq!(ctx.store.count_team_instances(team_id).await.unwrap(), 1);
    assert_eq!(ctx.runtime.running().await.len(), 1);
}

#[tokio::test]
async fn test_other_team_gets_suffixed_container() {
    let ctx = TestContext::new().await;
    let challenge = ctx.docker_challenge("web", "FLAG{web}").await;
    let (_, red) = ctx.team("red", 1).await;
    let (blue_id, blue) = ctx.team("blue", 1).await;

    let a = ctx.state.orchestrator.start(red[0].id, challenge.id).await.unwrap();
    let b = ctx.state.orchestrator.start(blue[0].id, challenge.id).await.unwrap();

    assert_eq!(a.name, "pta-web");
    assert_eq!(b.name, format!("pta-web_{}_{}", blue_id, blue[0].id));
    assert!(a.ports.iter().all(|p| !b.ports.contains(p)));
}

#[tokio::test]
async fn test_team_quota_blocks_start() {
    let ctx = TestContext::new().await;
    ctx.docker_config(|c| {
        c.instances_by_team = 1;
        c.instances_by_user = 5;
    })
    .await;
    let a = ctx.docker_challenge("alpha", "FLAG{a}").await;
    let b = ctx.docker_challenge("bravo", "FLAG{b}").await;
    let (team_id, users) = ctx.team("red", 2).await;

    ctx.state.orchestrator.start(users[0].id, a.id).await.unwrap();
    let err = ctx.state.orchestrator.start(users[1].id, b.id).await.unwrap_err();

    assert!(matches!(err, Error::PerTeamLimit));
    assert_eq!(err.error_code(), "max_instances_by_team_reached");
    assert_eq!(err.status().as_u16(), 403);
    assert_eq!(ctx.store.count_team_instances(team_id).await.unwrap(), 1);
    assert!(ctx.store.instance_for(team_id, b.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_user_quota_blocks_start() {
    let ctx = TestContext::new().await;
    let a = ctx.docker_challenge("alpha", "FLAG{a}").await;
    let b = ctx.docker_challenge("bravo", "FLAG{b}").await;
    let (_, users) = ctx.team("red", 1).await;

    ctx.state.orchestrator.start(users[0].id, a.id).await.unwrap();
    let err = ctx.state.orchestrator.start(users[0].id, b.id).await.unwrap_err();
    assert!(matches!(err, Error::PerUserLimit));
}

#[tokio::test]
async fn test_cooldown_reports_remaining_seconds() {
    let ctx = TestContext::new().await;
    ctx.docker_config(|c| c.cooldown_seconds = 30).await;
    let challenge = ctx.docker_challenge("web", "FLAG{web}").await;
    let (team_id, users) = ctx.team("red", 1).await;

    ctx.state.orchestrator.start(users[0].id, challenge.id).await.unwrap();
    ctx.advance(5);
    ctx.state.orchestrator.stop(users[0].id, challenge.id).await.unwrap();
    ctx.advance(15);

    let err = ctx
        .state
        .orchestrator
        .start(users[0].id, challenge.id)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::CooldownActive { remaining_seconds: 15 }));
    assert_eq!(err.error_code(), "instance_cooldown_not_elapsed");
    assert!(ctx.store.instance_for(team_id, challenge.id).await.unwrap().is_none());

    ctx.advance(15);
    ctx.state.orchestrator.start(users[0].id, challenge.id).await.unwrap();
}

#[tokio::test]
async fn test_cooldown_applies_after_expiry_sweep() {
    let ctx = TestContext::new().await;
    ctx.docker_config(|c| c.cooldown_seconds = 30).await;
    let challenge = ctx.docker_challenge("web", "FLAG{web}").await;
    let (_, users) = ctx.team("red", 1).await;

    ctx.state.orchestrator.start(users[0].id, challenge.id).await.unwrap();
    ctx.advance(61 * 60);
    assert_eq!(ctx.state.orchestrator.sweep_expired().await.unwrap(), 1);
    ctx.advance(5);

    let err = ctx
        .state
        .orchestrator
        .start(users[0].id, challenge.id)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::CooldownActive { remaining_seconds: 25 }));
}

#[tokio::test]
async fn test_cooldown_applies_after_admin_teardown() {
    let ctx = TestContext::new().await;
    ctx.docker_config(|c| {
        c.cooldown_seconds = 30;
        c.instances_by_user = 5;
    })
    .await;
    let alpha = ctx.docker_challenge("alpha", "FLAG{a}").await;
    let bravo = ctx.docker_challenge("bravo", "FLAG{b}").await;
    let (team_id, users) = ctx.team("red", 1).await;
    let orchestrator = &ctx.state.orchestrator;

    orchestrator.start(users[0].id, alpha.id).await.unwrap();
    let instance = ctx.store.instance_for(team_id, alpha.id).await.unwrap().unwrap();
    orchestrator.admin_delete(instance.id).await.unwrap();

    orchestrator.start(users[0].id, bravo.id).await.unwrap();
    assert_eq!(orchestrator.admin_stop_all().await.unwrap(), 1);

    ctx.advance(10);
    for challenge in [&alpha, &bravo] {
        let err = orchestrator.start(users[0].id, challenge.id).await.unwrap_err();
        assert!(matches!(err, Error::CooldownActive { .. }), "{}", challenge.slug);
    }
}

#[tokio::test]
async fn test_cooldown_applies_after_solve() {
    let ctx = TestContext::new().await;
    ctx.docker_config(|c| c.cooldown_seconds = 30).await;
    let challenge = ctx.docker_challenge("web", "FLAG{web}").await;
    let (team_id, users) = ctx.team("red", 1).await;

    ctx.state.orchestrator.start(users[0].id, challenge.id).await.unwrap();
    ctx.state
        .submissions
        .submit(
            users[0].id,
            challenge.id,
            &SubmitPayload {
                flag: Some("FLAG{web}".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let store = ctx.store.clone();
    assert!(
        ctx.eventually(|| {
            let store = store.clone();
            let challenge_id = challenge.id;
            async move { store.instance_for(team_id, challenge_id).await.unwrap().is_none() }
        })
        .await
    );
    assert!(ctx.store.last_stopped_at(team_id, challenge.id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_start_rejections() {
    let ctx = TestContext::new().await;
    let standard = ctx.standard_challenge("quiz", "FLAG{q}").await;
    let docker = ctx.docker_challenge("web", "FLAG{web}").await;
    let (_, users) = ctx.team("red", 1).await;
    let loner = ctx.store.add_user("loner", Role::Member, None).await;
    let admin = ctx.admin(None).await;

    let err = ctx.state.orchestrator.start(users[0].id, standard.id).await.unwrap_err();
    assert!(matches!(err, Error::Unsupported));

    let err = ctx.state.orchestrator.start(loner.id, docker.id).await.unwrap_err();
    assert!(matches!(err, Error::TeamRequired));

    let err = ctx.state.orchestrator.start(admin.id, docker.id).await.unwrap_err();
    assert_eq!(err.error_code(), "admin_team_required_for_instances");

    let err = ctx.state.orchestrator.start(users[0].id, 9999).await.unwrap_err();
    assert!(matches!(err, Error::ChallengeNotFound));
}

#[tokio::test]
async fn test_unsolved_prerequisite_hides_instance_routes() {
    let ctx = TestContext::new().await;
    let intro = ctx.standard_challenge("intro", "FLAG{intro}").await;
    ctx.runtime.add_image("pta-locked").await;
    let locked = ctx
        .challenge(
            "locked",
            "name: locked\ntype: docker\npoints: 100\nports: [80]\ndepends_on: intro\nflags: [\"FLAG{locked}\"]\n",
        )
        .await;
    let (team_id, users) = ctx.team("red", 1).await;
    let orchestrator = &ctx.state.orchestrator;

    let err = orchestrator.start(users[0].id, locked.id).await.unwrap_err();
    assert!(matches!(err, Error::ChallengeNotFound));
    let err = orchestrator.status(users[0].id, locked.id).await.unwrap_err();
    assert!(matches!(err, Error::ChallengeNotFound));
    let err = orchestrator.stop(users[0].id, locked.id).await.unwrap_err();
    assert!(matches!(err, Error::ChallengeNotFound));
    assert!(ctx.store.instance_for(team_id, locked.id).await.unwrap().is_none());
    assert!(ctx.runtime.running().await.is_empty());

    ctx.state
        .submissions
        .submit(
            users[0].id,
            intro.id,
            &SubmitPayload {
                flag: Some("FLAG{intro}".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    orchestrator.start(users[0].id, locked.id).await.unwrap();
    assert!(orchestrator.status(users[0].id, locked.id).await.unwrap().has_instance);
}

#[tokio::test]
async fn test_docker_challenge_without_ports() {
    let ctx = TestContext::new().await;
    ctx.runtime.add_image("pta-portless").await;
    let challenge = ctx
        .challenge("portless", "name: Portless\ntype: docker\nflags: [x]\n")
        .await;
    let (_, users) = ctx.team("red", 1).await;

    let err = ctx.state.orchestrator.start(users[0].id, challenge.id).await.unwrap_err();
    assert!(matches!(err, Error::NoPortsDefined));
}

#[tokio::test]
async fn test_port_bind_failure_is_retried_once() {
    let ctx = TestContext::new().await;
    let challenge = ctx.docker_challenge("web", "FLAG{web}").await;
    let (_, users) = ctx.team("red", 2).await;
    ctx.docker_config(|c| c.instances_by_user = 5).await;

    ctx.runtime.fail_next_binds(1);
    let outcome = ctx.state.orchestrator.start(users[0].id, challenge.id).await.unwrap();
    assert_eq!(outcome.ports, vec![40001]);
}

#[tokio::test]
async fn test_port_bind_failure_twice_is_no_free_ports() {
    let ctx = TestContext::new().await;
    let challenge = ctx.docker_challenge("web", "FLAG{web}").await;
    let (team_id, users) = ctx.team("red", 1).await;

    ctx.runtime.fail_next_binds(2);
    let err = ctx.state.orchestrator.start(users[0].id, challenge.id).await.unwrap_err();
    assert!(matches!(err, Error::NoFreePorts));
    assert!(ctx.store.instance_for(team_id, challenge.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_runtime_unavailable_leaves_no_row() {
    let ctx = TestContext::new().await;
    let challenge = ctx.docker_challenge("web", "FLAG{web}").await;
    let (team_id, users) = ctx.team("red", 1).await;

    ctx.runtime.set_unavailable(true);
    let err = ctx.state.orchestrator.start(users[0].id, challenge.id).await.unwrap_err();
    assert_eq!(err.error_code(), "docker_unavailable");
    assert_eq!(err.status().as_u16(), 503);
    assert!(ctx.store.instance_for(team_id, challenge.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_missing_image_is_built_from_object_store() {
    let ctx = TestContext::new().await;
    ctx.objects
        .put_text(Bucket::Challenges, "built/Dockerfile", "FROM alpine\nCMD [\"sh\"]\n")
        .await;
    let challenge = ctx
        .challenge("built", "name: Built\ntype: docker\nports: [1337]\nflags: [x]\n")
        .await;
    let (_, users) = ctx.team("red", 1).await;

    ctx.state.orchestrator.start(users[0].id, challenge.id).await.unwrap();
    assert_eq!(ctx.runtime.builds().await, vec!["pta-built".to_string()]);
}

#[tokio::test]
async fn test_build_failure_leaves_no_row() {
    let ctx = TestContext::with_runtime(MockRuntime::failing_builds("COPY failed")).await;
    ctx.objects
        .put_text(Bucket::Challenges, "broken/Dockerfile", "FROM alpine\nCOPY missing /\n")
        .await;
    let challenge = ctx
        .challenge("broken", "name: Broken\ntype: docker\nports: [80]\nflags: [x]\n")
        .await;
    let (team_id, users) = ctx.team("red", 1).await;

    let err = ctx.state.orchestrator.start(users[0].id, challenge.id).await.unwrap_err();
    assert_eq!(err.error_code(), "docker_build_failed");
    assert_eq!(err.public_message().as_deref(), Some("COPY failed"));
    assert!(ctx.store.instance_for(team_id, challenge.id).await.unwrap().is_none());
}

// ============================================================================
// Stop and status
// ============================================================================

#[tokio::test]
async fn test_stop_by_teammate() {
    let ctx = TestContext::new().await;
    let challenge = ctx.docker_challenge("web", "FLAG{web}").await;
    let (team_id, users) = ctx.team("red", 2).await;

    ctx.state.orchestrator.start(users[0].id, challenge.id).await.unwrap();
    let outcome = ctx.state.orchestrator.stop(users[1].id, challenge.id).await.unwrap();
    assert_eq!(outcome.message, "instance_stopped");
    assert!(ctx.store.instance_for(team_id, challenge.id).await.unwrap().is_none());

    let runtime = ctx.runtime.clone();
    assert!(
        ctx.eventually(|| {
            let runtime = runtime.clone();
            async move { runtime.stopped().await == vec!["pta-web".to_string()] }
        })
        .await
    );

    let err = ctx.state.orchestrator.stop(users[1].id, challenge.id).await.unwrap_err();
    assert!(matches!(err, Error::InstanceNotFound));
}

#[tokio::test]
async fn test_other_team_cannot_stop() {
    let ctx = TestContext::new().await;
    let challenge = ctx.docker_challenge("web", "FLAG{web}").await;
    let (red_id, red) = ctx.team("red", 1).await;
    let (_, blue) = ctx.team("blue", 1).await;

    ctx.state.orchestrator.start(red[0].id, challenge.id).await.unwrap();
    let err = ctx.state.orchestrator.stop(blue[0].id, challenge.id).await.unwrap_err();
    assert!(matches!(err, Error::InstanceNotFound));
    assert!(ctx.store.instance_for(red_id, challenge.id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_instance_status() {
    let ctx = TestContext::new().await;
    let challenge = ctx.docker_challenge("web", "FLAG{web}").await;
    let (_, users) = ctx.team("red", 1).await;
    let orchestrator = &ctx.state.orchestrator;

    let view = orchestrator.status(users[0].id, challenge.id).await.unwrap();
    assert!(!view.has_instance);
    assert_eq!(view.reason.as_deref(), Some("no_instance"));

    orchestrator.start(users[0].id, challenge.id).await.unwrap();
    let view = orchestrator.status(users[0].id, challenge.id).await.unwrap();
    assert!(view.has_instance);
    assert_eq!(view.status.as_deref(), Some("running"));
    assert_eq!(view.connection_info, Some(vec!["http://10.0.0.5:40000".to_string()]));

    ctx.advance(61 * 60);
    let view = orchestrator.status(users[0].id, challenge.id).await.unwrap();
    assert_eq!(view.status.as_deref(), Some("expired"));
}

#[tokio::test]
async fn test_sweep_removes_expired_instances() {
    let ctx = TestContext::new().await;
    ctx.docker_config(|c| c.instances_by_user = 5).await;
    let a = ctx.docker_challenge("alpha", "FLAG{a}").await;
    let b = ctx.docker_challenge("bravo", "FLAG{b}").await;
    let (team_id, users) = ctx.team("red", 1).await;

    ctx.state.orchestrator.start(users[0].id, a.id).await.unwrap();
    ctx.advance(30 * 60);
    ctx.state.orchestrator.start(users[0].id, b.id).await.unwrap();
    ctx.advance(31 * 60);

    assert_eq!(ctx.state.orchestrator.sweep_expired().await.unwrap(), 1);
    assert!(ctx.store.instance_for(team_id, a.id).await.unwrap().is_none());
    assert!(ctx.store.instance_for(team_id, b.id).await.unwrap().is_some());

    let expired = ctx.events.events("instance_update");
    assert!(expired.iter().any(|(_, v)| v["status"] == "expired"));
}

// ============================================================================
// Compose
// ============================================================================

#[tokio::test]
async fn test_compose_instance_comes_up_in_background() {
    let ctx = TestContext::new().await;
    ctx.objects
        .put_text(Bucket::Challenges, "stack/docker-compose.yml", COMPOSE_YAML)
        .await;
    let challenge = ctx
        .challenge(
            "stack",
            "name: Stack\ntype: compose\nconnection_info: [\"http://$ip:[80]\", \"nc $ip [5000]\"]\nflags: [x]\n",
        )
        .await;
    let (team_id, users) = ctx.team("red", 1).await;

    let outcome = ctx.state.orchestrator.start(users[0].id, challenge.id).await.unwrap();
    assert_eq!(outcome.status, InstanceStatus::Starting);
    assert_eq!(outcome.name, format!("stack_{}_{}", team_id, users[0].id));
    assert_eq!(outcome.ports.len(), 2);

    let store = ctx.store.clone();
    let challenge_id = challenge.id;
    assert!(
        ctx.eventually(|| {
            let store = store.clone();
            async move {
                matches!(
                    store.instance_for(team_id, challenge_id).await,
                    Ok(Some(i)) if i.status == InstanceStatus::Running
                )
            }
        })
        .await
    );
    assert!(ctx.runtime.has_project(&outcome.name).await);
}

#[tokio::test]
async fn test_failed_compose_start_is_reported() {
    let ctx = TestContext::with_runtime(MockRuntime::failing_compose("pull access denied")).await;
    ctx.objects
        .put_text(Bucket::Challenges, "stack/docker-compose.yml", COMPOSE_YAML)
        .await;
    let challenge = ctx
        .challenge("stack", "name: Stack\ntype: compose\nflags: [x]\n")
        .await;
    let (team_id, users) = ctx.team("red", 1).await;

    ctx.state.orchestrator.start(users[0].id, challenge.id).await.unwrap();

    let store = ctx.store.clone();
    let challenge_id = challenge.id;
    assert!(
        ctx.eventually(|| {
            let store = store.clone();
            async move {
                matches!(store.instance_failure(team_id, challenge_id).await, Ok(Some(_)))
            }
        })
        .await
    );

    let view = ctx.state.orchestrator.status(users[0].id, challenge.id).await.unwrap();
    assert!(!view.has_instance);
    assert_eq!(view.status.as_deref(), Some("failed"));
    assert!(view.reason.is_some());
    assert!(ctx.store.instance_for(team_id, challenge.id).await.unwrap().is_none());
}

// ============================================================================
// Admin
// ============================================================================

#[tokio::test]
async fn test_admin_stop_all() {
    let ctx = TestContext::new().await;
    let challenge = ctx.docker_challenge("web", "FLAG{web}").await;
    let (_, red) = ctx.team("red", 1).await;
    let (_, blue) = ctx.team("blue", 1).await;

    ctx.state.orchestrator.start(red[0].id, challenge.id).await.unwrap();
    ctx.state.orchestrator.start(blue[0].id, challenge.id).await.unwrap();

    assert_eq!(ctx.state.orchestrator.admin_stop_all().await.unwrap(), 2);
    assert!(ctx.store.list_instances().await.unwrap().is_empty());

    let runtime = ctx.runtime.clone();
    assert!(
        ctx.eventually(|| {
            let runtime = runtime.clone();
            async move { runtime.running().await.is_empty() }
        })
        .await
    );
}

#[tokio::test]
async fn test_admin_delete_unknown_instance() {
    let ctx = TestContext::new().await;
    let err = ctx.state.orchestrator.admin_delete(4242).await.unwrap_err();
    assert!(matches!(err, Error::InstanceNotFound));
}

#[tokio::test]
async fn test_running_ports_are_disjoint() {
    let ctx = TestContext::new().await;
    ctx.docker_config(|c| {
        c.instances_by_team = 10;
        c.instances_by_user = 10;
    })
    .await;
    let mut challenges = Vec::new();
    for slug in ["alpha", "bravo", "charlie"] {
        challenges.push(ctx.docker_challenge(slug, "FLAG{x}").await);
    }
    let (_, red) = ctx.team("red", 1).await;
    let (_, blue) = ctx.team("blue", 1).await;

    for challenge in &challenges {
        ctx.state.orchestrator.start(red[0].id, challenge.id).await.unwrap();
        ctx.state.orchestrator.start(blue[0].id, challenge.id).await.unwrap();
    }
    ctx.state.orchestrator.stop(red[0].id, challenges[1].id).await.unwrap();
    ctx.state.orchestrator.start(red[0].id, challenges[1].id).await.unwrap();

    let mut seen = HashSet::new();
    for instance in ctx.store.list_instances().await.unwrap() {
        for port in instance.ports {
            assert!(seen.insert(port), "port {} allocated twice", port);
        }
    }
}
