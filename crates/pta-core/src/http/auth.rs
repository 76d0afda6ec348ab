// Copyright (C) 2025 pwnthemall contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Request authentication.
//!
//! Access tokens are HS256 JWTs with `{sub, jti, exp}` claims, presented as
//! `Authorization: Bearer <token>` or in the `access_token` cookie. Revoked
//! token ids are kept in memory and mirrored to the `jwt_blacklist` table so
//! revocations survive restarts.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::header::{AUTHORIZATION, COOKIE};
use axum::http::request::Parts;
use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::AppState;
use crate::error::{Error, Result};
use crate::models::User;
use crate::store::Store;

/// Cookie carrying the access token.
pub const ACCESS_COOKIE: &str = "access_token";

/// Access token claims.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    /// User id.
    pub sub: String,
    /// Token id, used for revocation.
    pub jti: String,
    /// Expiry as a unix timestamp.
    pub exp: i64,
}

impl Claims {
    fn user_id(&self) -> Result<i32> {
        self.sub.parse().map_err(|_| Error::Unauthorized)
    }

    fn expires_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.exp, 0).unwrap_or_default()
    }
}

/// Token verification and revocation.
pub struct Authenticator {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    revoked: DashMap<String, DateTime<Utc>>,
}

impl Authenticator {
    /// Create an authenticator for the shared HS256 `secret`.
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_required_spec_claims(&["exp", "sub"]);
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            revoked: DashMap::new(),
        }
    }

    /// Sign a token for `user_id`.
    pub fn issue(&self, user_id: i32, jti: &str, expires_at: DateTime<Utc>) -> Result<String> {
        let claims = Claims {
            sub: user_id.to_string(),
            jti: jti.to_string(),
            exp: expires_at.timestamp(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| Error::Internal(format!("failed to sign token: {}", e)))
    }

    /// Decode and check a presented token.
    pub fn verify(&self, token: &str) -> Result<Claims> {
        let data = decode::<Claims>(token, &self.decoding, &self.validation).map_err(|e| {
            debug!(error = %e, "Token rejected");
            Error::Unauthorized
        })?;
        if self.revoked.contains_key(&data.claims.jti) {
            debug!("Revoked token presented");
            return Err(Error::Unauthorized);
        }
        Ok(data.claims)
    }

    /// Revoke a token until it expires.
    pub async fn revoke(&self, store: &dyn Store, claims: &Claims) -> Result<()> {
        let expires_at = claims.expires_at();
        store.blacklist_token(&claims.jti, expires_at).await?;
        self.revoked.insert(claims.jti.clone(), expires_at);
        Ok(())
    }

    /// Whether a token id is revoked.
    pub fn is_revoked(&self, jti: &str) -> bool {
        self.revoked.contains_key(jti)
    }

    /// Load unexpired revocations from the database.
    pub async fn load_revocations(&self, store: &dyn Store, now: DateTime<Utc>) -> Result<usize> {
        let entries = store.load_blacklist(now).await?;
        let count = entries.len();
        for (jti, expires_at) in entries {
            self.revoked.insert(jti, expires_at);
        }
        info!(count, "Token blacklist loaded");
        Ok(count)
    }

    /// Drop revocations whose tokens have expired. Returns how many were
    /// removed from memory.
    pub fn forget_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.revoked.len();
        self.revoked.retain(|_, expires_at| *expires_at > now);
        before - self.revoked.len()
    }
}

/// Token from the `Authorization` header or the access cookie.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    if let Some(token) = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    {
        return Some(token.trim());
    }
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .find_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            (name == ACCESS_COOKIE).then_some(value)
        })
}

/// Caller address: first `X-Forwarded-For` hop, else the socket peer.
pub fn client_ip(parts: &Parts) -> Option<String> {
    let forwarded = parts
        .headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if let Some(ip) = forwarded {
        return Some(ip.to_string());
    }
    parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
}

/// Authenticated caller.
#[derive(Debug, Clone)]
pub struct AuthUser {
    /// The caller.
    pub user: User,
    /// Verified token claims.
    pub claims: Claims,
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self> {
        let token = bearer_token(&parts.headers).ok_or(Error::Unauthorized)?;
        let claims = state.auth.verify(token)?;
        let user_id = claims.user_id()?;

        let store = &state.deps.store;
        let user = store.user(user_id).await?.ok_or(Error::Unauthorized)?;

        if let Some(ip) = client_ip(parts)
            && let Err(e) = store.record_user_ip(user.id, &ip, state.deps.now()).await
        {
            warn!(user_id = user.id, error = %e, "Failed to record client IP");
        }

        Ok(Self { user, claims })
    }
}

/// Authenticated admin.
#[derive(Debug, Clone)]
pub struct AdminUser(pub User);

impl FromRequestParts<AppState> for AdminUser {
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self> {
        let AuthUser { user, .. } = AuthUser::from_request_parts(parts, state).await?;
        if !user.is_admin() {
            return Err(Error::Forbidden);
        }
        Ok(Self(user))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_issue_and_verify() {
        let auth = Authenticator::new("s3cret");
        let token = auth
            .issue(42, "abc", Utc::now() + chrono::Duration::hours(1))
            .unwrap();
        let claims = auth.verify(&token).unwrap();
        assert_eq!(claims.sub, "42");
        assert_eq!(claims.user_id().unwrap(), 42);
        assert_eq!(claims.jti, "abc");
    }

    #[test]
    fn test_rejects_wrong_secret() {
        let token = Authenticator::new("a")
            .issue(1, "x", Utc::now() + chrono::Duration::hours(1))
            .unwrap();
        assert!(matches!(
            Authenticator::new("b").verify(&token),
            Err(Error::Unauthorized)
        ));
    }

    #[test]
    fn test_rejects_expired() {
        let auth = Authenticator::new("s3cret");
        let token = auth
            .issue(1, "x", Utc::now() - chrono::Duration::hours(1))
            .unwrap();
        assert!(auth.verify(&token).is_err());
    }

    #[test]
    fn test_forget_expired() {
        let auth = Authenticator::new("s3cret");
        let now = Utc::now();
        auth.revoked.insert("old".into(), now - chrono::Duration::minutes(1));
        auth.revoked.insert("live".into(), now + chrono::Duration::minutes(1));
        assert_eq!(auth.forget_expired(now), 1);
        assert!(auth.is_revoked("live"));
        assert!(!auth.is_revoked("old"));
    }

    #[test]
    fn test_bearer_token_sources() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc.def"));
        assert_eq!(bearer_token(&headers), Some("abc.def"));

        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_static("theme=dark; access_token=tok123; lang=en"),
        );
        assert_eq!(bearer_token(&headers), Some("tok123"));

        assert_eq!(bearer_token(&HeaderMap::new()), None);
    }

    #[test]
    fn test_client_ip_prefers_forwarded() {
        let (mut parts, _) = axum::http::Request::builder()
            .header("x-forwarded-for", "203.0.113.7, 10.0.0.1")
            .body(())
            .unwrap()
            .into_parts();
        parts
            .extensions
            .insert(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 9000))));
        assert_eq!(client_ip(&parts).as_deref(), Some("203.0.113.7"));

        parts.headers.remove("x-forwarded-for");
        assert_eq!(client_ip(&parts).as_deref(), Some("127.0.0.1"));
    }
}
