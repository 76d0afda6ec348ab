// Copyright (C) 2025 pwnthemall contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Event fan-out to connected users.
//!
//! Services depend on [`Broadcaster`] only. [`ConnectionHub`] is the live
//! implementation behind `GET /events`; [`RecordingBroadcaster`] keeps every
//! delivery for assertions.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Per-connection buffer; slow readers lose events rather than block senders.
const SUBSCRIBER_BUFFER: usize = 64;

/// Delivery interface.
pub trait Broadcaster: Send + Sync {
    /// Every connection of one user.
    fn send_to_user(&self, user_id: i32, payload: Bytes);

    /// Every connection of every member of a team.
    fn send_to_team(&self, team_id: i32, payload: Bytes);

    /// Team members other than `except_user_id`.
    fn send_to_team_except(&self, team_id: i32, payload: Bytes, except_user_id: i32);

    /// Every connection.
    fn send_to_all(&self, payload: Bytes);

    /// Every connection except those of `except_user_id`.
    fn send_to_all_except(&self, payload: Bytes, except_user_id: i32);
}

// ============================================================================
// Events
// ============================================================================

/// `instance_update` payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceUpdate {
    /// Target team.
    pub team_id: i32,
    /// Acting member.
    pub user_id: i32,
    /// Acting member name.
    pub username: String,
    /// Challenge concerned.
    pub challenge_id: i32,
    /// New instance state.
    pub status: String,
    /// Container or project name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Allocated host ports.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ports: Option<Vec<i32>>,
    /// Rendered connection strings.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_info: Option<Vec<String>>,
    /// Start time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// Expiry time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Time of the state change.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    /// Failure reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl InstanceUpdate {
    /// Bare update with only the identifying fields set.
    pub fn new(team_id: i32, user_id: i32, username: &str, challenge_id: i32, status: &str) -> Self {
        Self {
            team_id,
            user_id,
            username: username.to_string(),
            challenge_id,
            status: status.to_string(),
            name: None,
            ports: None,
            connection_info: None,
            created_at: None,
            expires_at: None,
            updated_at: None,
            reason: None,
        }
    }
}

/// `team_solve` payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamSolve {
    /// Target team.
    pub team_id: i32,
    /// Challenge concerned.
    pub challenge_id: i32,
    /// Challenge name.
    pub challenge_name: String,
    /// Points awarded.
    pub points: i32,
    /// Acting member.
    pub user_id: i32,
    /// Acting member name.
    pub username: String,
    /// Event time.
    pub timestamp: DateTime<Utc>,
}

/// `hint_purchase` payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HintPurchased {
    /// Target team.
    pub team_id: i32,
    /// Challenge concerned.
    pub challenge_id: i32,
    /// Bought hint.
    pub hint_id: i32,
    /// Acting member.
    pub user_id: i32,
    /// Hint title.
    pub hint_title: String,
    /// Revealed text.
    pub hint_content: String,
    /// Points spent.
    pub cost: i32,
    /// Event time.
    pub timestamp: DateTime<Utc>,
}

/// `challenge-category` payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoryChange {
    /// What changed.
    pub action: String,
}

/// Broadcast envelope, tagged by `event`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event")]
pub enum Event {
    /// Instance lifecycle change.
    #[serde(rename = "instance_update")]
    InstanceUpdate(InstanceUpdate),
    /// A teammate solved a challenge.
    #[serde(rename = "team_solve")]
    TeamSolve(TeamSolve),
    /// A teammate bought a hint.
    #[serde(rename = "hint_purchase")]
    HintPurchase(HintPurchased),
    /// The challenge list changed.
    #[serde(rename = "challenge-category")]
    ChallengeCategory(CategoryChange),
}

impl Event {
    /// `challenge-category` event with the given action.
    pub fn category(action: &str) -> Self {
        Event::ChallengeCategory(CategoryChange {
            action: action.to_string(),
        })
    }

    /// JSON bytes as sent on the wire.
    pub fn to_bytes(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }
}

/// Who receives an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    /// One user.
    User(i32),
    /// Every member of a team.
    Team(i32),
    /// A team minus the acting member.
    TeamExcept {
        /// Target team.
        team_id: i32,
        /// Member left out.
        user_id: i32,
    },
    /// Every connection.
    All,
    /// Every connection except one user.
    AllExcept(i32),
}

/// Serialize `event` and hand it to `broadcaster`.
pub fn publish(broadcaster: &dyn Broadcaster, audience: Audience, event: &Event) {
    let payload = match event.to_bytes() {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %e, "Failed to serialize broadcast event");
            return;
        }
    };
    match audience {
        Audience::User(id) => broadcaster.send_to_user(id, payload),
        Audience::Team(id) => broadcaster.send_to_team(id, payload),
        Audience::TeamExcept { team_id, user_id } => {
            broadcaster.send_to_team_except(team_id, payload, user_id)
        }
        Audience::All => broadcaster.send_to_all(payload),
        Audience::AllExcept(id) => broadcaster.send_to_all_except(payload, id),
    }
}

// ============================================================================
// Connection hub
// ============================================================================

#[derive(Debug)]
struct Subscriber {
    id: u64,
    team_id: Option<i32>,
    tx: mpsc::Sender<Bytes>,
}

/// Live connections keyed by user id.
#[derive(Clone, Default)]
pub struct ConnectionHub {
    connections: Arc<DashMap<i32, Vec<Subscriber>>>,
    next_id: Arc<AtomicU64>,
}

/// One open connection. Dropping it unregisters the connection.
pub struct Subscription {
    hub: ConnectionHub,
    user_id: i32,
    id: u64,
    rx: mpsc::Receiver<Bytes>,
}

impl Subscription {
    /// Next payload, `None` once the hub is gone.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Payload already queued, without waiting.
    pub fn try_recv(&mut self) -> Option<Bytes> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.remove(self.user_id, self.id);
    }
}

impl ConnectionHub {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection for a user on an optional team.
    pub fn subscribe(&self, user_id: i32, team_id: Option<i32>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.connections
            .entry(user_id)
            .or_default()
            .push(Subscriber { id, team_id, tx });
        debug!(user_id, connection_id = id, "Connection registered");
        Subscription {
            hub: self.clone(),
            user_id,
            id,
            rx,
        }
    }

    /// Number of open connections.
    pub fn connection_count(&self) -> usize {
        self.connections.iter().map(|e| e.value().len()).sum()
    }

    fn remove(&self, user_id: i32, id: u64) {
        let now_empty = match self.connections.get_mut(&user_id) {
            Some(mut subs) => {
                subs.retain(|s| s.id != id);
                subs.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.connections.remove_if(&user_id, |_, subs| subs.is_empty());
        }
    }

    fn deliver(&self, payload: &Bytes, mut filter: impl FnMut(i32, &Subscriber) -> bool) {
        for entry in self.connections.iter() {
            let user_id = *entry.key();
            for sub in entry.value().iter().filter(|s| filter(user_id, s)) {
                if let Err(e) = sub.tx.try_send(payload.clone()) {
                    debug!(user_id, connection_id = sub.id, error = %e, "Dropped event");
                }
            }
        }
    }
}

impl Broadcaster for ConnectionHub {
    fn send_to_user(&self, user_id: i32, payload: Bytes) {
        self.deliver(&payload, |uid, _| uid == user_id);
    }

    fn send_to_team(&self, team_id: i32, payload: Bytes) {
        self.deliver(&payload, |_, s| s.team_id == Some(team_id));
    }

    fn send_to_team_except(&self, team_id: i32, payload: Bytes, except_user_id: i32) {
        self.deliver(&payload, |uid, s| {
            s.team_id == Some(team_id) && uid != except_user_id
        });
    }

    fn send_to_all(&self, payload: Bytes) {
        self.deliver(&payload, |_, _| true);
    }

    fn send_to_all_except(&self, payload: Bytes, except_user_id: i32) {
        self.deliver(&payload, |uid, _| uid != except_user_id);
    }
}

// ============================================================================
// Recording broadcaster
// ============================================================================

/// Broadcaster that remembers every delivery.
#[derive(Clone, Default)]
pub struct RecordingBroadcaster {
    sent: Arc<std::sync::Mutex<Vec<(Audience, serde_json::Value)>>>,
}

impl RecordingBroadcaster {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliveries so far, payloads decoded as JSON.
    pub fn sent(&self) -> Vec<(Audience, serde_json::Value)> {
        self.sent
            .lock()
            .map(|sent| sent.clone())
            .unwrap_or_default()
    }

    /// Deliveries whose `event` field equals `event`.
    pub fn events(&self, event: &str) -> Vec<(Audience, serde_json::Value)> {
        self.sent()
            .into_iter()
            .filter(|(_, v)| v["event"] == event)
            .collect()
    }

    fn record(&self, audience: Audience, payload: Bytes) {
        let value = serde_json::from_slice(&payload).unwrap_or(serde_json::Value::Null);
        if let Ok(mut sent) = self.sent.lock() {
            sent.push((audience, value));
        }
    }
}

impl Broadcaster for RecordingBroadcaster {
    fn send_to_user(&self, user_id: i32, payload: Bytes) {
        self.record(Audience::User(user_id), payload);
    }

    fn send_to_team(&self, team_id: i32, payload: Bytes) {
        self.record(Audience::Team(team_id), payload);
    }

    fn send_to_team_except(&self, team_id: i32, payload: Bytes, except_user_id: i32) {
        self.record(
            Audience::TeamExcept {
                team_id,
                user_id: except_user_id,
            },
            payload,
        );
    }

    fn send_to_all(&self, payload: Bytes) {
        self.record(Audience::All, payload);
    }

    fn send_to_all_except(&self, payload: Bytes, except_user_id: i32) {
        self.record(Audience::AllExcept(except_user_id), payload);
    }
}
