//! Anti-forgery check for state-changing requests.
//!
//! Safe methods pass untouched. Everything else must present a token in the
//! configured header that the [`TokenVerifier`] accepts for the requester's
//! session. Every failure looks the same from outside.

use std::sync::Arc;

use axum::{
    body::Body,
    http::{header, Extensions, HeaderMap, HeaderName, Request},
};

use crate::config::CsrfConfig;
use crate::error::GuardError;
use crate::pipeline::Stage;
use crate::security::tokens::TokenVerifier;

/// Session id established by an upstream authentication layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionId(pub String);

/// Pipeline stage enforcing anti-forgery tokens.
pub struct CsrfGuard {
    verifier: Arc<dyn TokenVerifier>,
    header_name: HeaderName,
    session_cookie: String,
}

impl CsrfGuard {
    pub fn new(verifier: Arc<dyn TokenVerifier>, config: &CsrfConfig) -> Result<Self, GuardError> {
        let header_name = HeaderName::from_bytes(config.header_name.as_bytes()).map_err(|_| {
            GuardError::PolicyConfigInvalid(vec![crate::config::ValidationError::new(
                "csrf.header_name",
                "not a valid header name",
            )])
        })?;
        Ok(Self {
            verifier,
            header_name,
            session_cookie: config.session_cookie.clone(),
        })
    }

    /// Check one request. `Ok` means it may proceed.
    pub fn check(&self, request: &Request<Body>) -> Result<(), GuardError> {
        if request.method().is_safe() {
            return Ok(());
        }

        let token = request
            .headers()
            .get(&self.header_name)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .ok_or(GuardError::TokenMissing)?;

        let session = self.session_id(request).ok_or(GuardError::SessionMissing)?;

        if self.verifier.validate(&session, token) {
            Ok(())
        } else {
            Err(GuardError::TokenMismatch)
        }
    }

    fn session_id(&self, request: &Request<Body>) -> Option<String> {
        if let Some(SessionId(id)) = request.extensions().get::<SessionId>() {
            return Some(id.clone());
        }
        cookie_value(request.headers(), &self.session_cookie)
    }
}

impl Stage for CsrfGuard {
    fn name(&self) -> &'static str {
        "csrf"
    }

    fn inspect(&self, request: &mut Request<Body>, _ctx: &mut Extensions) -> Result<(), GuardError> {
        self.check(request).map_err(|err| {
            tracing::debug!(
                method = %request.method(),
                path = %request.uri().path(),
                reason = err.reason(),
                "Anti-forgery check failed"
            );
            err
        })
    }
}

/// Find a cookie by name across every `Cookie` header.
pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| {
            let (key, value) = pair.trim().split_once('=')?;
            (key.trim() == name).then(|| value.trim().trim_matches('"').to_string())
        })
        .find(|value| !value.is_empty())
}
