//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the guard.
//! All types derive Serde traits for deserialization from config files.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration for the request guard.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct GuardConfig {
    /// Listener and background task settings.
    pub server: ServerConfig,

    /// Anti-forgery token settings.
    pub csrf: CsrfConfig,

    /// Content-Security-Policy directives.
    pub csp: CspConfig,

    /// Cookie attribute enforcement.
    pub cookies: CookieConfig,

    /// Baseline hardening headers.
    pub headers: HeadersConfig,

    /// Rate limiting configuration.
    pub rate_limit: RateLimitConfig,

    /// Allow-list used for rendered HTML.
    pub sanitizer: SanitizerConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Request timeout in seconds.
    pub request_timeout_secs: u64,

    /// Interval between sweeps of idle rate windows and expired tokens.
    pub sweep_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            request_timeout_secs: 30,
            sweep_interval_secs: 60,
        }
    }
}

/// CSRF token configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CsrfConfig {
    /// Request header carrying the anti-forgery token.
    pub header_name: String,

    /// Cookie carrying the session id.
    pub session_cookie: String,

    /// Lifetime of an issued token.
    pub token_ttl_secs: u64,

    /// Lifetime of a session opened by the guard.
    pub session_ttl_secs: u64,

    /// Oldest tokens are dropped once a session holds this many.
    pub max_tokens_per_session: usize,
}

impl Default for CsrfConfig {
    fn default() -> Self {
        Self {
            header_name: "X-CSRF-Token".to_string(),
            session_cookie: "sessionid".to_string(),
            token_ttl_secs: 3600,
            session_ttl_secs: 86_400,
            max_tokens_per_session: 8,
        }
    }
}

/// Upper bound for every configured duration (ten years).
pub const MAX_DURATION_SECS: u64 = 10 * 365 * 24 * 60 * 60;

fn bounded_secs(secs: u64) -> Duration {
    Duration::from_secs(secs.min(MAX_DURATION_SECS))
}

impl CsrfConfig {
    pub fn token_ttl(&self) -> Duration {
        bounded_secs(self.token_ttl_secs)
    }

    pub fn session_ttl(&self) -> Duration {
        bounded_secs(self.session_ttl_secs)
    }
}

/// A single CSP directive, e.g. `script-src 'self'`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct CspDirective {
    pub name: String,

    /// Source list; empty for valueless directives like `upgrade-insecure-requests`.
    #[serde(default)]
    pub value: String,
}

impl CspDirective {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Content-Security-Policy configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CspConfig {
    /// Directives in emission order.
    pub directives: Vec<CspDirective>,

    /// Emit `Content-Security-Policy-Report-Only` instead of enforcing.
    pub report_only: bool,
}

impl Default for CspConfig {
    fn default() -> Self {
        Self {
            directives: vec![
                CspDirective::new("default-src", "'self'"),
                CspDirective::new("script-src", "'self'"),
                CspDirective::new("object-src", "'none'"),
                CspDirective::new("base-uri", "'self'"),
                CspDirective::new("frame-ancestors", "'none'"),
            ],
            report_only: false,
        }
    }
}

/// SameSite cookie attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
pub enum SameSite {
    /// Cookie only sent in first-party context.
    Strict,
    /// Cookie sent with top-level navigation.
    #[default]
    Lax,
    /// Cookie sent in all contexts (requires Secure).
    None,
}

impl SameSite {
    pub fn as_str(&self) -> &'static str {
        match self {
            SameSite::Strict => "Strict",
            SameSite::Lax => "Lax",
            SameSite::None => "None",
        }
    }
}

/// Cookie enforcement configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct CookieConfig {
    /// SameSite value forced onto every Set-Cookie.
    pub same_site: SameSite,
}

/// Baseline security headers.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HeadersConfig {
    /// Emit `X-Content-Type-Options: nosniff`.
    pub nosniff: bool,

    /// Value for `X-Frame-Options`, omitted when unset.
    pub frame_options: Option<String>,

    /// Value for `Referrer-Policy`, omitted when unset.
    pub referrer_policy: Option<String>,
}

impl Default for HeadersConfig {
    fn default() -> Self {
        Self {
            nosniff: true,
            frame_options: Some("DENY".to_string()),
            referrer_policy: Some("strict-origin-when-cross-origin".to_string()),
        }
    }
}

/// Limit applied to one fixed window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct RateRule {
    /// Maximum admitted requests per window.
    pub limit: u32,

    /// Window length in seconds.
    pub period_secs: u64,
}

impl RateRule {
    pub fn new(limit: u32, period_secs: u64) -> Self {
        Self { limit, period_secs }
    }

    pub fn period(&self) -> Duration {
        bounded_secs(self.period_secs)
    }
}

impl Default for RateRule {
    fn default() -> Self {
        Self {
            limit: 60,
            period_secs: 60,
        }
    }
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Rule used when no endpoint override matches.
    #[serde(rename = "default")]
    pub default_rule: RateRule,

    /// Overrides keyed by path prefix; the longest matching prefix wins.
    pub per_endpoint: BTreeMap<String, RateRule>,

    /// Idle windows are evicted after `period * retention_factor`.
    pub retention_factor: u32,

    /// Header identifying the client (e.g. `X-Forwarded-For` behind a trusted proxy).
    /// The peer address is used when unset.
    pub client_header: Option<String>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            default_rule: RateRule::default(),
            per_endpoint: BTreeMap::new(),
            retention_factor: 2,
            client_header: None,
        }
    }
}

/// HTML allow-list configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SanitizerConfig {
    pub allowed_tags: BTreeSet<String>,

    /// Attributes per tag; the `*` entry applies to every allowed tag.
    pub allowed_attributes: BTreeMap<String, BTreeSet<String>>,

    pub allowed_uri_schemes: BTreeSet<String>,

    /// Keep relative URLs (`/path`, `#frag`) in URI attributes.
    pub allow_relative_urls: bool,
}

impl Default for SanitizerConfig {
    fn default() -> Self {
        let tags = [
            "a", "abbr", "b", "blockquote", "br", "code", "em", "h1", "h2", "h3", "h4", "hr",
            "i", "img", "li", "ol", "p", "pre", "q", "s", "span", "strong", "sub", "sup", "u",
            "ul",
        ];
        let mut attributes = BTreeMap::new();
        attributes.insert("*".to_string(), set(&["title", "lang", "dir"]));
        attributes.insert("a".to_string(), set(&["href"]));
        attributes.insert("img".to_string(), set(&["src", "alt", "width", "height"]));
        attributes.insert("blockquote".to_string(), set(&["cite"]));
        attributes.insert("q".to_string(), set(&["cite"]));

        Self {
            allowed_tags: set(&tags),
            allowed_attributes: attributes,
            allowed_uri_schemes: set(&["http", "https", "mailto"]),
            allow_relative_urls: true,
        }
    }
}

fn set(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Json,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
