//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming request:
//!     → rate_limit.rs (per-client admission)
//!     → csrf.rs (anti-forgery token check, backed by tokens.rs)
//!     → handler
//!     → sanitizer/ (materialize rendered HTML)
//!     → headers.rs (CSP, SameSite, hardening headers)
//! ```
//!
//! # Design Decisions
//! - Fail closed: reject on any security check failure
//! - No trust in client input
//! - Every stage is built once from validated config

pub mod csrf;
pub mod headers;
pub mod rate_limit;
pub mod sanitizer;
pub mod tokens;

pub use csrf::{CsrfGuard, SessionId};
pub use headers::PolicyHeaderInjector;
pub use rate_limit::{Admission, RateLimitStage, RateLimiter};
pub use sanitizer::{sanitize, SanitizationPolicy, SanitizeStage};
pub use tokens::{Token, TokenStore, TokenVerifier};
