// Copyright (C) 2025 pwnthemall contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Route handlers. Each one authenticates, calls a service and serializes the
//! outcome; failures go through [`Error`]'s `IntoResponse`.

use std::convert::Infallible;

use axum::Json;
use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::header::{AUTHORIZATION, CONTENT_DISPOSITION, CONTENT_TYPE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::Stream;
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};

use super::AppState;
use super::auth::{AdminUser, AuthUser};
use crate::descriptor::descriptor_slug;
use crate::error::{Error, Result};
use crate::export;
use crate::hints::PurchaseOutcome;
use crate::ingestor::SyncReport;
use crate::models::InstanceSummary;
use crate::orchestrator::{InstanceView, StartOutcome, StopOutcome};
use crate::scores::{self, RecalculationSummary, SolveView};
use crate::scoring::TeamScore;
use crate::submission::{SubmitOutcome, SubmitPayload};

fn json_body<T>(payload: std::result::Result<Json<T>, JsonRejection>) -> Result<T> {
    payload
        .map(|Json(body)| body)
        .map_err(|e| Error::InvalidInput(e.body_text()))
}

// ============================================================================
// Health
// ============================================================================

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> Response {
    match state.deps.store.ping().await {
        Ok(()) => Json(json!({"status": "ok"})).into_response(),
        Err(e) => {
            error!(error = %e, "Health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"status": "unhealthy"})),
            )
                .into_response()
        }
    }
}

// ============================================================================
// Instances
// ============================================================================

/// `POST /challenges/{id}/start`
pub async fn start_instance(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(challenge_id): Path<i32>,
) -> Result<Json<StartOutcome>> {
    let outcome = state.orchestrator.start(auth.user.id, challenge_id).await?;
    Ok(Json(outcome))
}

/// `POST /challenges/{id}/stop`
pub async fn stop_instance(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(challenge_id): Path<i32>,
) -> Result<Json<StopOutcome>> {
    let outcome = state.orchestrator.stop(auth.user.id, challenge_id).await?;
    Ok(Json(outcome))
}

/// `GET /challenges/{id}/instance-status`
pub async fn instance_status(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(challenge_id): Path<i32>,
) -> Result<Json<InstanceView>> {
    let view = state.orchestrator.status(auth.user.id, challenge_id).await?;
    Ok(Json(view))
}

// ============================================================================
// Submissions, solves and scores
// ============================================================================

/// `POST /challenges/{id}/submit`
pub async fn submit(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(challenge_id): Path<i32>,
    payload: std::result::Result<Json<SubmitPayload>, JsonRejection>,
) -> Result<Json<SubmitOutcome>> {
    let payload = json_body(payload)?;
    let outcome = state
        .submissions
        .submit(auth.user.id, challenge_id, &payload)
        .await?;
    Ok(Json(outcome))
}

/// `GET /challenges/{id}/solves`
pub async fn challenge_solves(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(challenge_id): Path<i32>,
) -> Result<Json<Vec<SolveView>>> {
    let store = state.deps.store.as_ref();
    if !auth.user.is_admin() {
        let challenge = store
            .challenge(challenge_id)
            .await?
            .ok_or(Error::ChallengeNotFound)?;
        if challenge.hidden {
            return Err(Error::ChallengeNotFound);
        }
    }
    Ok(Json(scores::challenge_solves(store, challenge_id).await?))
}

/// `GET /teams/me/score`
pub async fn team_score(State(state): State<AppState>, auth: AuthUser) -> Result<Json<TeamScore>> {
    let team_id = auth.user.team_id.ok_or(Error::TeamRequired)?;
    Ok(Json(scores::team_score(state.deps.store.as_ref(), team_id).await?))
}

/// `POST /hints/{id}/purchase`
pub async fn purchase_hint(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(hint_id): Path<i32>,
) -> Result<Json<PurchaseOutcome>> {
    Ok(Json(state.hints.purchase(auth.user.id, hint_id).await?))
}

// ============================================================================
// Events and sessions
// ============================================================================

/// `GET /events`. Server-sent events scoped to the caller and their team.
pub async fn events(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Sse<impl Stream<Item = std::result::Result<SseEvent, Infallible>>> {
    let mut subscription = state.hub.subscribe(auth.user.id, auth.user.team_id);
    let user_id = auth.user.id;
    debug!(user_id, "Event stream opened");

    let stream = async_stream::stream! {
        while let Some(payload) = subscription.recv().await {
            yield Ok(SseEvent::default().data(String::from_utf8_lossy(&payload)));
        }
        debug!(user_id, "Event stream closed");
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// `POST /auth/logout`. Revokes the presented token.
pub async fn logout(State(state): State<AppState>, auth: AuthUser) -> Result<Json<Value>> {
    state
        .auth
        .revoke(state.deps.store.as_ref(), &auth.claims)
        .await?;
    info!(user_id = auth.user.id, "Token revoked");
    Ok(Json(json!({"message": "logged_out"})))
}

// ============================================================================
// Admin
// ============================================================================

/// `GET /admin/instances`
pub async fn list_instances(
    State(state): State<AppState>,
    _admin: AdminUser,
) -> Result<Json<Vec<InstanceSummary>>> {
    Ok(Json(state.deps.store.list_instance_summaries().await?))
}

/// `DELETE /admin/instances/{id}`
pub async fn delete_instance(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path(instance_id): Path<i32>,
) -> Result<Json<Value>> {
    state.orchestrator.admin_delete(instance_id).await?;
    info!(admin = %admin.username, instance_id, "Instance deleted by admin");
    Ok(Json(json!({"message": "instance_deleted"})))
}

/// `POST /admin/instances/stop-all`
pub async fn stop_all_instances(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
) -> Result<Json<Value>> {
    let count = state.orchestrator.admin_stop_all().await?;
    info!(admin = %admin.username, count, "All instances stopped by admin");
    Ok(Json(json!({"message": "all_instances_stopped", "count": count})))
}

/// `POST /admin/challenges/{id}/build`
pub async fn build_image(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(challenge_id): Path<i32>,
) -> Result<Json<Value>> {
    let image = state.orchestrator.build_image(challenge_id).await?;
    Ok(Json(json!({"message": "image_built", "image": image})))
}

/// `GET /admin/challenges/{id}/export`. Streams the ZIP bundle.
pub async fn export_challenge(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(challenge_id): Path<i32>,
) -> Result<Response> {
    let archive = export::export_challenge(&state.deps, challenge_id).await?;
    let disposition = format!("attachment; filename=\"{}\"", archive.file_name);
    Ok((
        [
            (CONTENT_TYPE, export::CONTENT_TYPE.to_string()),
            (CONTENT_DISPOSITION, disposition),
        ],
        Body::from(archive.bytes),
    )
        .into_response())
}

/// `POST /admin/scores/recalculate`
pub async fn recalculate_scores(
    State(state): State<AppState>,
    _admin: AdminUser,
) -> Result<Json<RecalculationSummary>> {
    Ok(Json(scores::recalculate(state.deps.store.as_ref()).await?))
}

/// `POST /admin/sync`. Runs a full bucket scan and returns the report.
pub async fn sync_challenges(
    State(state): State<AppState>,
    _admin: AdminUser,
) -> Result<Json<SyncReport>> {
    Ok(Json(state.ingestor.bulk_scan().await?))
}

// ============================================================================
// Object store webhook
// ============================================================================

/// `POST /webhooks/object-store`
pub async fn object_store_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: std::result::Result<Json<Value>, JsonRejection>,
) -> Result<Json<Value>> {
    if let Some(expected) = state.webhook_token.as_deref() {
        let presented = headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        if presented != Some(expected) {
            warn!("Webhook with missing or wrong token");
            return Err(Error::Unauthorized);
        }
    }

    let event = json_body(payload)?;
    let Some(key) = event.get("Key").and_then(Value::as_str) else {
        debug!("Webhook without a key");
        return Ok(Json(json!({"status": "webhook received"})));
    };

    if descriptor_slug(key).is_none() {
        debug!(key, "Webhook for non-descriptor key");
        return Ok(Json(json!({"status": "webhook received"})));
    }

    let ingestor = state.ingestor.clone();
    let key = key.to_string();
    tokio::spawn(async move {
        if let Err(e) = ingestor.sync_key(&key).await {
            error!(key = %key, error = %e, "Challenge sync from webhook failed");
        }
    });
    Ok(Json(json!({"status": "challenge sync started"})))
}
