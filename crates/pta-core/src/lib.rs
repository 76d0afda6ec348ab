// Copyright (C) 2025 pwnthemall contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! pwnthemall platform core
//!
//! Challenge ingestion from an object store, per-team instance orchestration
//! on a container daemon, and flag scoring for a CTF platform.
//!
//! # Architecture
//!
//! ```text
//!   object store ──webhook/scan──► Ingestor ──► Store (PostgreSQL)
//!                                     │            ▲
//!   HTTP API ──► Orchestrator ────────┼────────────┤
//!        │            │               │            │
//!        │            ▼               ▼            │
//!        │      JobQueue ──► JobWorker ──► ContainerRuntime (docker)
//!        │
//!        └────► SubmissionService / HintService ──► Broadcaster ──► /events
//! ```
//!
//! Services depend on four seams bundled in [`deps::Deps`]: [`store::Store`],
//! [`object_store::ObjectStore`], [`container::ContainerRuntime`] and
//! [`broadcast::Broadcaster`]. Each has a production implementation and an
//! in-process one used by the tests.

#![warn(missing_docs)]

/// Event fan-out to connected users.
pub mod broadcast;

/// Configuration loaded from environment variables.
pub mod config;

/// Container runtime adapter: images, containers, compose projects, networks.
pub mod container;

/// CTF timing window.
pub mod ctf;

/// Shared clients handed to every service.
pub mod deps;

/// `chall.yml` descriptor parsing.
pub mod descriptor;

/// Error types.
pub mod error;

/// Challenge export archives.
pub mod export;

/// Background worker removing expired instances.
pub mod expiry_sweeper;

/// Outbound firewall push.
pub mod firewall;

/// Flag hashing and matching.
pub mod flag;

/// Great-circle distance.
pub mod geo;

/// Background worker activating scheduled hints.
pub mod hint_scheduler;

/// Hint purchases.
pub mod hints;

/// HTTP API.
pub mod http;

/// Object store to database reconciliation.
pub mod ingestor;

/// Bounded background job queue.
pub mod jobs;

/// Per-key async locks.
pub mod keyed;

/// Database migrations.
///
/// ```ignore
/// let pool = PgPool::connect(&database_url).await?;
/// pta_core::migrations::run(&pool).await?;
/// ```
pub mod migrations;

/// Persisted domain types.
pub mod models;

/// S3-compatible object store gateway.
pub mod object_store;

/// Per-team instance lifecycle.
pub mod orchestrator;

/// Embeddable runtime wiring the services, HTTP server and workers.
pub mod runtime;

/// Score queries and recalculation.
pub mod scores;

/// Dynamic scoring rules.
pub mod scoring;

/// URL-safe slugs.
pub mod slug;

/// Persistence interface and backends.
pub mod store;

/// Flag submission pipeline.
pub mod submission;

/// Background worker purging expired token revocations.
pub mod token_reaper;

pub use config::Config;
pub use error::{Error, Result};
