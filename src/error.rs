//! Error taxonomy shared by every stage.
//!
//! Per-request errors end only the request that raised them. CSRF failures
//! all collapse into one generic 403 so callers cannot tell a missing session
//! from a bad token.

use std::time::Duration;

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::config::ValidationError;

#[derive(Debug, Error)]
pub enum GuardError {
    #[error("session is unknown or expired")]
    SessionInvalid,

    #[error("request carries no session")]
    SessionMissing,

    #[error("request carries no anti-forgery token")]
    TokenMissing,

    #[error("anti-forgery token does not match")]
    TokenMismatch,

    #[error("rate limit exceeded, retry after {retry_after:?}")]
    RateLimitExceeded { retry_after: Duration },

    #[error("invalid policy configuration: {}", .0.iter().map(|e| e.to_string()).collect::<Vec<_>>().join(", "))]
    PolicyConfigInvalid(Vec<ValidationError>),

    #[error("markup could not be parsed: {0}")]
    SanitizationParse(String),
}

impl GuardError {
    /// Label used for metrics and logs.
    pub fn reason(&self) -> &'static str {
        match self {
            GuardError::SessionInvalid => "session_invalid",
            GuardError::SessionMissing => "session_missing",
            GuardError::TokenMissing => "token_missing",
            GuardError::TokenMismatch => "token_mismatch",
            GuardError::RateLimitExceeded { .. } => "rate_limited",
            GuardError::PolicyConfigInvalid(_) => "policy_invalid",
            GuardError::SanitizationParse(_) => "sanitization_parse",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GuardError::SessionInvalid
            | GuardError::SessionMissing
            | GuardError::TokenMissing
            | GuardError::TokenMismatch => StatusCode::FORBIDDEN,
            GuardError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            GuardError::PolicyConfigInvalid(_) | GuardError::SanitizationParse(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: &'static str,
    pub code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

/// Whole seconds a client should wait, rounded up so it never reads as zero.
pub fn retry_after_secs(retry_after: Duration) -> u64 {
    let secs = retry_after.as_secs();
    if retry_after.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs.max(1)
    }
}

impl IntoResponse for GuardError {
    fn into_response(self) -> Response {
        match self.status() {
            StatusCode::FORBIDDEN => (
                StatusCode::FORBIDDEN,
                Json(ErrorResponse {
                    error: "forbidden",
                    code: "FORBIDDEN",
                    retry_after_secs: None,
                }),
            )
                .into_response(),
            StatusCode::TOO_MANY_REQUESTS => {
                let secs = match self {
                    GuardError::RateLimitExceeded { retry_after } => retry_after_secs(retry_after),
                    _ => 1,
                };
                let mut response = (
                    StatusCode::TOO_MANY_REQUESTS,
                    Json(ErrorResponse {
                        error: "rate limit exceeded",
                        code: "RATE_LIMITED",
                        retry_after_secs: Some(secs),
                    }),
                )
                    .into_response();
                response
                    .headers_mut()
                    .insert(header::RETRY_AFTER, HeaderValue::from(secs));
                response
            }
            status => (
                status,
                Json(ErrorResponse {
                    error: "internal error",
                    code: "INTERNAL",
                    retry_after_secs: None,
                }),
            )
                .into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_csrf_failures_are_indistinguishable() {
        let statuses: Vec<_> = [
            GuardError::SessionInvalid,
            GuardError::SessionMissing,
            GuardError::TokenMissing,
            GuardError::TokenMismatch,
        ]
        .into_iter()
        .map(|e| e.into_response().status())
        .collect();
        assert!(statuses.iter().all(|s| *s == StatusCode::FORBIDDEN));
    }

    #[test]
    fn test_rate_limit_carries_retry_after() {
        let response = GuardError::RateLimitExceeded {
            retry_after: Duration::from_millis(49_200),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "50");
    }

    #[test]
    fn test_retry_after_rounds_up() {
        assert_eq!(retry_after_secs(Duration::from_secs(50)), 50);
        assert_eq!(retry_after_secs(Duration::from_millis(1)), 1);
        assert_eq!(retry_after_secs(Duration::ZERO), 1);
    }
}
