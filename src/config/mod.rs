//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → GuardConfig (validated, immutable)
//!     → each subsystem builds its own state from its section at startup
//! ```
//!
//! # Design Decisions
//! - Config is loaded once; a running guard never changes policy
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    CookieConfig, CspConfig, CspDirective, CsrfConfig, GuardConfig, HeadersConfig, LogFormat,
    ObservabilityConfig, RateLimitConfig, RateRule, SameSite, SanitizerConfig, ServerConfig,
    MAX_DURATION_SECS,
};
pub use validation::{config_warnings, validate_config, ValidationError};
