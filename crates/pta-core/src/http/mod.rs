// Copyright (C) 2025 pwnthemall contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP surface.
//!
//! Player routes live under `/challenges`, `/hints`, `/teams`, `/events` and
//! `/auth`; operator routes under `/admin`. The object store posts change
//! notifications to `/webhooks/object-store`.

pub mod auth;
pub mod error;
pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{delete, get, post};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use self::auth::Authenticator;
use crate::broadcast::ConnectionHub;
use crate::deps::Deps;
use crate::hints::HintService;
use crate::ingestor::Ingestor;
use crate::orchestrator::Orchestrator;
use crate::submission::SubmissionService;

/// Shared handler state. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    /// Shared clients.
    pub deps: Deps,
    /// Instance lifecycle.
    pub orchestrator: Orchestrator,
    /// Object store to database sync.
    pub ingestor: Ingestor,
    /// Flag checks.
    pub submissions: SubmissionService,
    /// Hint purchases.
    pub hints: HintService,
    /// SSE subscribers.
    pub hub: ConnectionHub,
    /// Bearer token verification and revocation.
    pub auth: Arc<Authenticator>,
    /// Bearer token required on webhooks, when set.
    pub webhook_token: Option<String>,
}

/// Build the router.
pub fn router(state: AppState) -> Router {
    let challenges = Router::new()
        .route("/{id}/start", post(handlers::start_instance))
        .route("/{id}/stop", post(handlers::stop_instance))
        .route("/{id}/instance-status", get(handlers::instance_status))
        .route("/{id}/submit", post(handlers::submit))
        .route("/{id}/solves", get(handlers::challenge_solves));

    let admin = Router::new()
        .route("/instances", get(handlers::list_instances))
        .route("/instances/stop-all", post(handlers::stop_all_instances))
        .route("/instances/{id}", delete(handlers::delete_instance))
        .route("/challenges/{id}/build", post(handlers::build_image))
        .route("/challenges/{id}/export", get(handlers::export_challenge))
        .route("/scores/recalculate", post(handlers::recalculate_scores))
        .route("/sync", post(handlers::sync_challenges));

    Router::new()
        .route("/health", get(handlers::health))
        .nest("/challenges", challenges)
        .route("/hints/{id}/purchase", post(handlers::purchase_hint))
        .route("/teams/me/score", get(handlers::team_score))
        .route("/events", get(handlers::events))
        .route("/auth/logout", post(handlers::logout))
        .nest("/admin", admin)
        .route("/webhooks/object-store", post(handlers::object_store_webhook))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
