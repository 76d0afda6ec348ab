// Copyright (C) 2025 pwnthemall contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error responses.
//!
//! Every failure renders as `{"error": "<code>"}` with the status from
//! [`Error::status`]. A few codes carry extra fields the client needs.

use axum::Json;
use axum::response::{IntoResponse, Response};
use serde_json::{Map, Value, json};
use tracing::{debug, error, warn};

use crate::error::Error;

/// JSON body for `err`.
pub fn error_body(err: &Error) -> Value {
    let mut body = Map::new();
    body.insert("error".into(), json!(err.error_code()));
    match err {
        Error::CooldownActive { remaining_seconds } => {
            body.insert("remaining_seconds".into(), json!(remaining_seconds));
        }
        Error::InsufficientPoints {
            required,
            available,
        } => {
            body.insert("required".into(), json!(required));
            body.insert("available".into(), json!(available));
        }
        _ => {}
    }
    if let Some(message) = err.public_message() {
        body.insert("message".into(), json!(message));
    }
    Value::Object(body)
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, code = self.error_code(), "Request failed");
        } else if status.is_client_error() {
            debug!(code = self.error_code(), "Request rejected");
        } else {
            warn!(error = %self, "Unexpected error status");
        }
        (status, Json(error_body(&self))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[test]
    fn test_cooldown_body() {
        let body = error_body(&Error::CooldownActive {
            remaining_seconds: 15,
        });
        assert_eq!(
            body,
            json!({"error": "instance_cooldown_not_elapsed", "remaining_seconds": 15})
        );
    }

    #[test]
    fn test_insufficient_points_body() {
        let body = error_body(&Error::InsufficientPoints {
            required: 100,
            available: 40,
        });
        assert_eq!(
            body,
            json!({"error": "insufficient_points", "required": 100, "available": 40})
        );
    }

    #[test]
    fn test_internal_detail_hidden() {
        let err = Error::Internal("pool timed out on 10.0.0.5".into());
        assert_eq!(error_body(&err), json!({"error": "internal_error"}));
        assert_eq!(err.into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
