// Copyright (C) 2025 pwnthemall contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! pwnthemall core server
//!
//! Serves the player and admin HTTP API, keeps challenges in sync with the
//! object store and manages per-team challenge instances.

use std::sync::Arc;

use tracing::{error, info, warn};

use pta_core::broadcast::ConnectionHub;
use pta_core::config::Config;
use pta_core::container::DockerRuntime;
use pta_core::deps::{Deps, SystemClock};
use pta_core::object_store::S3ObjectStore;
use pta_core::runtime::PlatformRuntime;
use pta_core::store::{PostgresStore, Store};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pta_core=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        http_addr = %config.http_addr,
        s3_endpoint = %config.s3.endpoint,
        docker = %config.docker_worker_url,
        "Starting pwnthemall core"
    );

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;

    info!("Connected to database");

    pta_core::migrations::run(&pool).await?;

    info!("Database migrations applied");

    let store = Arc::new(PostgresStore::new(pool));
    store.save_docker_config(&config.docker).await?;

    let hub = ConnectionHub::new();
    let deps = Deps {
        store,
        objects: Arc::new(S3ObjectStore::new(&config.s3)?),
        runtime: Arc::new(DockerRuntime::new(config.docker_worker_url.clone())),
        broadcaster: Arc::new(hub.clone()),
        clock: Arc::new(SystemClock),
    };

    let runtime = PlatformRuntime::builder()
        .config(&config)
        .deps(deps)
        .hub(hub)
        .build()?
        .start()
        .await?;

    info!(addr = %runtime.local_addr(), "HTTP server ready");

    let ingestor = runtime.ingestor().clone();
    tokio::spawn(async move {
        match ingestor.bulk_scan().await {
            Ok(report) => info!(
                synced = report.synced,
                failed = report.errors.len(),
                "Initial challenge sync finished"
            ),
            Err(e) => error!(error = %e, "Initial challenge sync failed"),
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await?;

    info!("pwnthemall core shut down");

    Ok(())
}
