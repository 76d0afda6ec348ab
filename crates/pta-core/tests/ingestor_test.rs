// Copyright (C) 2025 pwnthemall contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Object store to database reconciliation tests.

mod common;

use std::io::Cursor;

use bytes::Bytes;
use common::TestContext;
use pta_core::Error;
use pta_core::config::DeletePolicy;
use pta_core::descriptor::DescriptorError;
use pta_core::ingestor::{Ingestor, IngestorConfig, SyncOutcome};
use pta_core::models::ChallengeType;
use pta_core::object_store::{Bucket, ObjectStore};
use pta_core::store::Store;

const WEB_YAML: &str = r#"
name: Baby Web
description: Find the flag
category: web
difficulty: easy
type: docker
decay: Logarithmic - Medium
points: 500
ports: [80]
flags: ["FLAG{one}", "FLAG{two}"]
hints:
  - title: Look closer
    content: Check the cookies
    cost: 50
  - title: Later
    content: Scheduled
    cost: 0
    is_active: false
    auto_active_at: "2025-03-01T13:00:00Z"
"#;

fn png(width: u32, height: u32) -> Bytes {
    let img = image::RgbImage::from_pixel(width, height, image::Rgb([200, 30, 30]));
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, image::ImageFormat::Png).unwrap();
    Bytes::from(out.into_inner())
}

#[tokio::test]
async fn test_sync_creates_challenge() {
    let ctx = TestContext::new().await;
    let challenge = ctx.challenge("baby-web", WEB_YAML).await;

    assert_eq!(challenge.slug, "baby-web");
    assert_eq!(challenge.name, "Baby Web");
    assert_eq!(challenge.challenge_type, ChallengeType::Docker);
    assert_eq!(challenge.ports, vec![80]);

    let formula = ctx
        .store
        .decay_formula(challenge.decay_formula_id.unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(formula.name, "Logarithmic - Medium");

    let flags = ctx.store.flags(challenge.id).await.unwrap();
    assert_eq!(flags.len(), 2);
    assert!(flags.iter().all(|f| f.value.len() == 64));

    let hints = ctx.store.hints_for_challenge(challenge.id).await.unwrap();
    assert_eq!(hints.len(), 2);
    assert!(hints[0].is_active);
    assert!(!hints[1].is_active);

    let changes = ctx.events.events("challenge-category");
    assert!(!changes.is_empty());
}

#[tokio::test]
async fn test_unknown_decay_falls_back_to_default() {
    let ctx = TestContext::new().await;
    let challenge = ctx
        .challenge("odd", "name: Odd\npoints: 10\ndecay: Exponential - Wild\nflags: [x]\n")
        .await;
    let formula = ctx
        .store
        .decay_formula(challenge.decay_formula_id.unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(formula.name, "No Decay");
}

#[tokio::test]
async fn test_resync_is_idempotent() {
    let ctx = TestContext::new().await;
    ctx.put_descriptor("baby-web", WEB_YAML).await;
    ctx.put_descriptor("quiz", "name: Quiz\npoints: 100\nflags: [q]\n").await;

    let first = ctx.state.ingestor.bulk_scan().await.unwrap();
    assert_eq!(first.synced, 2);
    let before = ctx.store.list_challenges().await.unwrap();
    let web = ctx.store.challenge_by_slug("baby-web").await.unwrap().unwrap();
    let flags_before = ctx.store.flags(web.id).await.unwrap();
    let hints_before = ctx.store.hints_for_challenge(web.id).await.unwrap();

    for _ in 0..3 {
        ctx.state.ingestor.bulk_scan().await.unwrap();
    }
    let after = ctx.store.list_challenges().await.unwrap();

    let key = |c: &pta_core::models::Challenge| (c.id, c.slug.clone(), c.points, c.decay_formula_id);
    assert_eq!(
        before.iter().map(key).collect::<Vec<_>>(),
        after.iter().map(key).collect::<Vec<_>>()
    );
    let flag_values = |flags: Vec<pta_core::models::Flag>| {
        let mut v: Vec<String> = flags.into_iter().map(|f| f.value).collect();
        v.sort();
        v
    };
    assert_eq!(
        flag_values(flags_before),
        flag_values(ctx.store.flags(web.id).await.unwrap())
    );
    let hint_ids: Vec<i32> = hints_before.iter().map(|h| h.id).collect();
    let hint_ids_after: Vec<i32> = ctx
        .store
        .hints_for_challenge(web.id)
        .await
        .unwrap()
        .iter()
        .map(|h| h.id)
        .collect();
    assert_eq!(hint_ids, hint_ids_after);
}

#[tokio::test]
async fn test_bulk_scan_reports_broken_descriptors() {
    let ctx = TestContext::new().await;
    ctx.put_descriptor("good", "name: Good\nflags: [x]\n").await;
    ctx.put_descriptor("nameless", "points: 10\n").await;
    ctx.put_descriptor("missing-file", "name: M\nfiles: [gone.bin]\nflags: [x]\n")
        .await;

    let report = ctx.state.ingestor.bulk_scan().await.unwrap();
    assert_eq!(report.synced, 1);
    let failed: Vec<&str> = report.errors.iter().map(|e| e.slug.as_str()).collect();
    assert_eq!(failed, vec!["missing-file", "nameless"]);
    assert!(ctx.store.challenge_by_slug("nameless").await.unwrap().is_none());
}

#[tokio::test]
async fn test_invalid_descriptor_is_rejected() {
    let ctx = TestContext::new().await;
    ctx.put_descriptor("evil", "name: Evil\nfiles: ['../../etc/passwd']\n").await;

    let err = ctx.state.ingestor.sync_slug("evil").await.unwrap_err();
    assert!(matches!(err, Error::Descriptor(_)));
    assert_eq!(err.status().as_u16(), 400);
}

#[tokio::test]
async fn test_directory_names_must_be_slugs() {
    let ctx = TestContext::new().await;
    ctx.put_descriptor("badname", "name: Good\nflags: [x]\n").await;
    ctx.put_descriptor("Bad_Name", "name: Bad\nflags: [x]\n").await;

    let err = ctx.state.ingestor.sync_slug("Bad_Name").await.unwrap_err();
    assert!(matches!(
        err,
        Error::Descriptor(DescriptorError::InvalidSlug(ref s)) if s == "Bad_Name"
    ));
    assert_eq!(err.status().as_u16(), 400);

    let report = ctx.state.ingestor.bulk_scan().await.unwrap();
    assert_eq!(report.synced, 1);
    let failed: Vec<&str> = report.errors.iter().map(|e| e.slug.as_str()).collect();
    assert_eq!(failed, vec!["Bad_Name"]);
    assert!(
        report.errors[0]
            .error
            .ends_with("rename the directory to 'badname-2'")
    );
    assert!(ctx.store.challenge_by_slug("Bad_Name").await.unwrap().is_none());
}

#[tokio::test]
async fn test_non_descriptor_keys_are_ignored() {
    let ctx = TestContext::new().await;
    let outcome = ctx
        .state
        .ingestor
        .sync_key("challenges/baby-web/app.py")
        .await
        .unwrap();
    assert_eq!(outcome, SyncOutcome::Ignored);
}

#[tokio::test]
async fn test_late_visible_descriptor_is_synced() {
    let ctx = TestContext::new().await;
    ctx.put_descriptor("late", "name: Late\nflags: [x]\n").await;
    ctx.objects.delay_visibility(1);

    let outcome = ctx.state.ingestor.sync_key("late/chall.yml").await.unwrap();
    assert!(matches!(outcome, SyncOutcome::Synced(_)));
}

#[tokio::test]
async fn test_deleted_descriptor_removes_challenge_and_detaches_instances() {
    let ctx = TestContext::new().await;
    let challenge = ctx.docker_challenge("foo", "FLAG{foo}").await;
    let (team_id, users) = ctx.team("red", 1).await;
    ctx.state.orchestrator.start(users[0].id, challenge.id).await.unwrap();

    ctx.remove_descriptor("foo").await;
    let outcome = ctx
        .state
        .ingestor
        .sync_key("challenges/foo/chall.yml")
        .await
        .unwrap();
    assert_eq!(
        outcome,
        SyncOutcome::Deleted {
            slug: "foo".to_string(),
            existed: true
        }
    );

    assert!(ctx.store.challenge_by_slug("foo").await.unwrap().is_none());
    assert!(ctx.store.flags(challenge.id).await.unwrap().is_empty());
    assert!(ctx.store.hints_for_challenge(challenge.id).await.unwrap().is_empty());
    assert!(ctx.store.instance_for(team_id, challenge.id).await.unwrap().is_none());

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert_eq!(ctx.runtime.running().await, vec!["pta-foo".to_string()]);
    assert!(ctx.runtime.stopped().await.is_empty());
}

#[tokio::test]
async fn test_stop_policy_cleans_up_instances() {
    let ctx = TestContext::new().await;
    let challenge = ctx.docker_challenge("foo", "FLAG{foo}").await;
    let (_, users) = ctx.team("red", 1).await;
    ctx.state.orchestrator.start(users[0].id, challenge.id).await.unwrap();

    let ingestor = Ingestor::new(
        ctx.state.deps.clone(),
        ctx.state.orchestrator.clone(),
        IngestorConfig {
            delete_policy: DeletePolicy::Stop,
            ..IngestorConfig::default()
        },
    );
    ctx.remove_descriptor("foo").await;
    ingestor.sync_slug("foo").await.unwrap();

    let runtime = ctx.runtime.clone();
    assert!(
        ctx.eventually(|| {
            let runtime = runtime.clone();
            async move { runtime.stopped().await == vec!["pta-foo".to_string()] }
        })
        .await
    );
}

#[tokio::test]
async fn test_missing_descriptor_without_challenge() {
    let ctx = TestContext::new().await;
    let outcome = ctx.state.ingestor.sync_slug("ghost").await.unwrap();
    assert_eq!(
        outcome,
        SyncOutcome::Deleted {
            slug: "ghost".to_string(),
            existed: false
        }
    );
}

#[tokio::test]
async fn test_cover_derivative_is_stored() {
    let ctx = TestContext::new().await;
    ctx.objects
        .put(Bucket::Challenges, "pretty/cover.png", png(64, 32), "image/png")
        .await
        .unwrap();
    let challenge = ctx
        .challenge("pretty", "name: Pretty\ncover_img: cover.png\nflags: [x]\n")
        .await;

    assert_eq!(challenge.cover_img.as_deref(), Some("cover_resized.png"));
    assert!(
        ctx.objects
            .contains(Bucket::Challenges, "pretty/cover_resized.png")
            .await
    );
}

#[tokio::test]
async fn test_broken_cover_does_not_fail_sync() {
    let ctx = TestContext::new().await;
    ctx.objects
        .put_text(Bucket::Challenges, "ugly/cover.png", "not an image")
        .await;
    let challenge = ctx
        .challenge("ugly", "name: Ugly\ncover_img: cover.png\nflags: [x]\n")
        .await;

    assert_eq!(challenge.cover_img.as_deref(), Some("cover.png"));
    assert!(!ctx.objects.contains(Bucket::Challenges, "ugly/cover_resized.png").await);
}

#[tokio::test]
async fn test_resync_drops_cached_export() {
    let ctx = TestContext::new().await;
    let challenge = ctx.standard_challenge("quiz", "FLAG{q}").await;

    pta_core::export::export_challenge(&ctx.state.deps, challenge.id).await.unwrap();
    assert!(ctx.objects.contains(Bucket::Challenges, "quiz.zip").await);

    ctx.challenge("quiz", "name: quiz\npoints: 250\nflags: [\"FLAG{q}\"]\n").await;
    assert!(!ctx.objects.contains(Bucket::Challenges, "quiz.zip").await);
}
