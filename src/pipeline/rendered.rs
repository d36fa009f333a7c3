//! Deferred HTML output.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::Value;

/// Markup produced by a handler, left for the sanitizer stage to render.
///
/// Handlers return this instead of writing untrusted markup into a body. The
/// response leaves with an empty body unless the sanitizer stage is present.
#[derive(Debug, Clone)]
pub enum RenderedHtml {
    /// A whole HTML page.
    Page(String),
    /// A JSON document with HTML in the string fields named by `fields`
    /// (JSON pointers, e.g. `/comments/0/html`).
    Json { document: Value, fields: Vec<String> },
}

impl RenderedHtml {
    pub fn page(markup: impl Into<String>) -> Self {
        RenderedHtml::Page(markup.into())
    }

    pub fn json(document: Value, fields: impl IntoIterator<Item = String>) -> Self {
        RenderedHtml::Json {
            document,
            fields: fields.into_iter().collect(),
        }
    }
}

impl IntoResponse for RenderedHtml {
    fn into_response(self) -> Response {
        let mut response = StatusCode::OK.into_response();
        response.extensions_mut().insert(self);
        response
    }
}
