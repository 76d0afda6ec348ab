// Copyright (C) 2025 pwnthemall contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for pta-core integration tests.
//!
//! Provides TestContext wiring every service over the in-process backends.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::Notify;

use pta_core::broadcast::{ConnectionHub, RecordingBroadcaster};
use pta_core::container::MockRuntime;
use pta_core::deps::{Deps, ManualClock};
use pta_core::descriptor::DESCRIPTOR_FILE;
use pta_core::http::AppState;
use pta_core::ingestor::SyncOutcome;
use pta_core::jobs::{JobWorker, JobWorkerConfig};
use pta_core::models::{Challenge, DockerConfig, Role, User};
use pta_core::object_store::{Bucket, MemoryObjectStore};
use pta_core::runtime::PlatformRuntime;
use pta_core::store::{MemoryStore, Store};

pub const JWT_SECRET: &str = "integration-test-secret";

/// Helper macro to skip tests if the database URL is not set.
#[macro_export]
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        }
    };
}

/// Fixed start time for every test clock.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
}

/// Services wired over the memory store, memory object store and mock
/// runtime, with a job worker draining the queue in the background.
pub struct TestContext {
    pub store: Arc<MemoryStore>,
    pub objects: Arc<MemoryObjectStore>,
    pub runtime: Arc<MockRuntime>,
    pub events: RecordingBroadcaster,
    pub clock: Arc<ManualClock>,
    pub state: AppState,
    worker_shutdown: Arc<Notify>,
}

impl TestContext {
    pub async fn new() -> Self {
        Self::with_runtime(MockRuntime::new()).await
    }

    pub async fn with_runtime(runtime: MockRuntime) -> Self {
        let store = Arc::new(MemoryStore::new());
        let objects = Arc::new(MemoryObjectStore::new());
        let runtime = Arc::new(runtime);
        let events = RecordingBroadcaster::new();
        let clock = Arc::new(ManualClock::new(t0()));

        let deps = Deps {
            store: store.clone(),
            objects: objects.clone(),
            runtime: runtime.clone(),
            broadcaster: Arc::new(events.clone()),
            clock: clock.clone(),
        };

        let config = PlatformRuntime::builder()
            .deps(deps)
            .hub(ConnectionHub::new())
            .jwt_secret(JWT_SECRET)
            .worker_ip("10.0.0.5")
            .build()
            .expect("Failed to build runtime config");
        let (state, receiver) = config.services();

        let worker = JobWorker::new(
            receiver,
            Arc::new(state.orchestrator.clone()),
            JobWorkerConfig { workers: 2 },
        );
        let worker_shutdown = worker.shutdown_handle();
        tokio::spawn(async move { worker.run().await });

        Self {
            store,
            objects,
            runtime,
            events,
            clock,
            state,
            worker_shutdown,
        }
    }

    /// Overwrite the runtime policy.
    pub async fn docker_config(&self, edit: impl FnOnce(&mut DockerConfig)) {
        let mut config = DockerConfig::default();
        edit(&mut config);
        self.store
            .save_docker_config(&config)
            .await
            .expect("Failed to save docker config");
    }

    /// A team with `n` members named `<team>-<i>`.
    pub async fn team(&self, name: &str, n: usize) -> (i32, Vec<User>) {
        let team_id = self.store.add_team(name).await;
        let mut users = Vec::with_capacity(n);
        for i in 0..n {
            users.push(
                self.store
                    .add_user(&format!("{}-{}", name, i), Role::Member, Some(team_id))
                    .await,
            );
        }
        (team_id, users)
    }

    pub async fn admin(&self, team_id: Option<i32>) -> User {
        self.store.add_user("root", Role::Admin, team_id).await
    }

    /// Upload `chall.yml` for `slug` and sync it.
    pub async fn challenge(&self, slug: &str, yaml: &str) -> Challenge {
        self.put_descriptor(slug, yaml).await;
        match self
            .state
            .ingestor
            .sync_slug(slug)
            .await
            .expect("Failed to sync challenge")
        {
            SyncOutcome::Synced(challenge) => challenge,
            other => panic!("Unexpected sync outcome: {:?}", other),
        }
    }

    /// A docker challenge whose image is already present.
    pub async fn docker_challenge(&self, slug: &str, flag: &str) -> Challenge {
        self.runtime.add_image(&format!("pta-{}", slug)).await;
        self.challenge(
            slug,
            &format!(
                "name: {}\ntype: docker\npoints: 100\nports: [80]\nconnection_info: [\"http://$ip:[80]\"]\nflags: [\"{}\"]\n",
                slug, flag
            ),
        )
        .await
    }

    /// A flag-only challenge.
    pub async fn standard_challenge(&self, slug: &str, flag: &str) -> Challenge {
        self.challenge(
            slug,
            &format!("name: {}\ntype: standard\npoints: 100\nflags: [\"{}\"]\n", slug, flag),
        )
        .await
    }

    pub async fn put_descriptor(&self, slug: &str, yaml: &str) {
        self.objects
            .put_text(
                Bucket::Challenges,
                &format!("{}/{}", slug, DESCRIPTOR_FILE),
                yaml,
            )
            .await;
    }

    pub async fn remove_descriptor(&self, slug: &str) {
        use pta_core::object_store::ObjectStore;
        self.objects
            .delete(Bucket::Challenges, &format!("{}/{}", slug, DESCRIPTOR_FILE))
            .await
            .expect("Failed to delete descriptor");
    }

    pub fn advance(&self, seconds: i64) {
        self.clock.advance(chrono::Duration::seconds(seconds));
    }

    /// Poll `check` until it holds or two seconds pass.
    pub async fn eventually<F, Fut>(&self, mut check: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..100 {
            if check().await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    /// Issue an access token for `user`.
    pub fn token(&self, user: &User) -> String {
        self.state
            .auth
            .issue(user.id, &format!("jti-{}", user.id), Utc::now() + chrono::Duration::hours(1))
            .expect("Failed to issue token")
    }
}

impl Drop for TestContext {
    fn drop(&mut self) {
        self.worker_shutdown.notify_one();
    }
}
