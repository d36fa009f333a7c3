//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (axum setup, request id, trace, pipeline middleware, timeout)
//!     → handlers.rs (session tokens, comment board)
//!     → pipeline finish stages (sanitize, security headers)
//!     → Send to client
//! ```

pub mod handlers;
pub mod server;

pub use handlers::AppState;
pub use server::{spawn_sweeper, GuardServer};
