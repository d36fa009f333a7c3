//! Request handlers.
//!
//! A session/token endpoint pair plus a small comment board whose markup is
//! user supplied and only ever leaves through [`RenderedHtml`]. The board page
//! also sanitizes each comment on its own, so one broken fragment cannot
//! swallow the markup after it.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::RwLock;

use crate::config::GuardConfig;
use crate::pipeline::RenderedHtml;
use crate::security::csrf::cookie_value;
use crate::security::sanitizer::{sanitize, SanitizationPolicy};
use crate::security::TokenStore;

/// Oldest comments are dropped beyond this.
const MAX_COMMENTS: usize = 500;

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub tokens: Arc<TokenStore>,
    pub comments: Arc<RwLock<Vec<Comment>>>,
    pub policy: Arc<SanitizationPolicy>,
    pub csrf_header: String,
    pub session_cookie: String,
}

impl AppState {
    pub fn new(config: &GuardConfig, tokens: Arc<TokenStore>) -> Self {
        Self {
            tokens,
            comments: Arc::new(RwLock::new(Vec::new())),
            policy: Arc::new(SanitizationPolicy::from_config(&config.sanitizer)),
            csrf_header: config.csrf.header_name.clone(),
            session_cookie: config.csrf.session_cookie.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Comment {
    pub id: u64,
    pub author: String,
    /// Raw markup as submitted.
    pub html: String,
}

#[derive(Debug, Deserialize)]
pub struct NewComment {
    pub author: String,
    pub html: String,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub token: String,
    pub header: String,
}

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// GET /session/token: issue an anti-forgery token, opening a session first
/// when the caller has none.
pub async fn issue_token(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let existing = cookie_value(&headers, &state.session_cookie)
        .filter(|session| state.tokens.has_session(session));

    let (session, opened) = match existing {
        Some(session) => (session, false),
        None => (state.tokens.open_session(), true),
    };

    let token = match state.tokens.issue(&session) {
        Ok(token) => token,
        Err(err) => return err.into_response(),
    };

    let mut response = Json(TokenResponse {
        token: token.value().to_string(),
        header: state.csrf_header.clone(),
    })
    .into_response();

    let response_headers = response.headers_mut();
    response_headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    if opened {
        let cookie = format!("{}={}; Path=/; HttpOnly", state.session_cookie, session);
        if let Ok(value) = HeaderValue::from_str(&cookie) {
            response_headers.append(header::SET_COOKIE, value);
        }
    }
    response
}

/// DELETE /session: end the caller's session and expire its cookie.
pub async fn end_session(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Some(session) = cookie_value(&headers, &state.session_cookie) {
        state.tokens.end_session(&session);
    }

    let mut response = StatusCode::NO_CONTENT.into_response();
    let cookie = format!("{}=; Path=/; HttpOnly; Max-Age=0", state.session_cookie);
    if let Ok(value) = HeaderValue::from_str(&cookie) {
        response.headers_mut().append(header::SET_COOKIE, value);
    }
    response
}

/// GET /comments
pub async fn list_comments(State(state): State<AppState>) -> RenderedHtml {
    let comments = state.comments.read().await;
    let fields = (0..comments.len()).map(|i| format!("/comments/{}/html", i));
    RenderedHtml::json(json!({ "comments": comments.as_slice() }), fields)
}

/// POST /comments
pub async fn create_comment(
    State(state): State<AppState>,
    Json(new): Json<NewComment>,
) -> Response {
    let comment = {
        let mut comments = state.comments.write().await;
        let id = comments.last().map(|c| c.id + 1).unwrap_or(1);
        let comment = Comment {
            id,
            author: new.author,
            html: new.html,
        };
        comments.push(comment.clone());
        if comments.len() > MAX_COMMENTS {
            let excess = comments.len() - MAX_COMMENTS;
            comments.drain(..excess);
        }
        comment
    };
    tracing::debug!(id = comment.id, "Comment stored");

    let mut response = RenderedHtml::json(json!(comment), ["/html".to_string()]).into_response();
    *response.status_mut() = StatusCode::CREATED;
    response
}

/// GET /board: the comment board as an HTML page.
pub async fn board(State(state): State<AppState>) -> RenderedHtml {
    let comments = state.comments.read().await;
    let text_only = SanitizationPolicy::text_only();
    let mut page = String::from("<h1>Comments</h1><ul>");
    for comment in comments.iter() {
        page.push_str("<li><strong>");
        page.push_str(&sanitize(&comment.author, &text_only));
        page.push_str("</strong> ");
        page.push_str(&sanitize(&comment.html, &state.policy));
        page.push_str("</li>");
    }
    page.push_str("</ul>");
    RenderedHtml::page(page)
}
