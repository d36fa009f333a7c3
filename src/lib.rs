//! Request guard: CSRF tokens, rate limiting, HTML sanitization and security
//! headers as one ordered pipeline in front of an axum application.

pub mod config;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod observability;
pub mod pipeline;
pub mod security;

pub use config::GuardConfig;
pub use error::GuardError;
pub use http::GuardServer;
pub use lifecycle::Shutdown;
pub use pipeline::{RenderedHtml, RequestPipeline, Stage};
