//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (limits > 0, durations within `MAX_DURATION_SECS`)
//! - Refuse CSP and sanitizer policies that would be unsafe or malformed
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: GuardConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::fmt;
use std::net::SocketAddr;

use axum::http::{HeaderName, HeaderValue};

use crate::config::schema::{GuardConfig, RateRule, SameSite, MAX_DURATION_SECS};
use crate::security::sanitizer::{is_content_dropping, is_raw_text};

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path of the offending field.
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Validate a parsed configuration.
pub fn validate_config(config: &GuardConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    validate_server(config, &mut errors);
    validate_csrf(config, &mut errors);
    validate_csp(config, &mut errors);
    validate_headers(config, &mut errors);
    validate_rate_limit(config, &mut errors);
    validate_sanitizer(config, &mut errors);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_server(config: &GuardConfig, errors: &mut Vec<ValidationError>) {
    let server = &config.server;
    if server.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "server.bind_address",
            format!("'{}' is not a socket address", server.bind_address),
        ));
    }
    validate_duration("server.request_timeout_secs", server.request_timeout_secs, errors);
    validate_duration("server.sweep_interval_secs", server.sweep_interval_secs, errors);
    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("'{}' is not a socket address", config.observability.metrics_address),
        ));
    }
}

fn validate_csrf(config: &GuardConfig, errors: &mut Vec<ValidationError>) {
    let csrf = &config.csrf;
    if HeaderName::from_bytes(csrf.header_name.as_bytes()).is_err() {
        errors.push(ValidationError::new(
            "csrf.header_name",
            format!("'{}' is not a valid header name", csrf.header_name),
        ));
    }
    if !is_token(&csrf.session_cookie) {
        errors.push(ValidationError::new(
            "csrf.session_cookie",
            format!("'{}' is not a valid cookie name", csrf.session_cookie),
        ));
    }
    validate_duration("csrf.token_ttl_secs", csrf.token_ttl_secs, errors);
    validate_duration("csrf.session_ttl_secs", csrf.session_ttl_secs, errors);
    if csrf.max_tokens_per_session == 0 {
        errors.push(ValidationError::new("csrf.max_tokens_per_session", "must be > 0"));
    }
}

fn validate_csp(config: &GuardConfig, errors: &mut Vec<ValidationError>) {
    let csp = &config.csp;
    if csp.directives.is_empty() {
        errors.push(ValidationError::new("csp.directives", "at least one directive is required"));
    }
    for (i, directive) in csp.directives.iter().enumerate() {
        let valid_name = !directive.name.is_empty()
            && directive
                .name
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-');
        if !valid_name {
            errors.push(ValidationError::new(
                format!("csp.directives[{}].name", i),
                format!("'{}' is not a directive name", directive.name),
            ));
        }
        if directive.value.contains(';') || HeaderValue::from_str(&directive.value).is_err() {
            errors.push(ValidationError::new(
                format!("csp.directives[{}].value", i),
                "must be a header-safe source list without ';'",
            ));
        }
    }
}

fn validate_headers(config: &GuardConfig, errors: &mut Vec<ValidationError>) {
    let headers = &config.headers;
    for (field, value) in [
        ("headers.frame_options", &headers.frame_options),
        ("headers.referrer_policy", &headers.referrer_policy),
    ] {
        if let Some(value) = value {
            if HeaderValue::from_str(value).is_err() {
                errors.push(ValidationError::new(field, "not a valid header value"));
            }
        }
    }
}

fn validate_rate_limit(config: &GuardConfig, errors: &mut Vec<ValidationError>) {
    let rate_limit = &config.rate_limit;
    let factor = rate_limit.retention_factor;
    validate_rule("rate_limit.default", &rate_limit.default_rule, factor, errors);
    for (endpoint, rule) in &rate_limit.per_endpoint {
        let field = format!("rate_limit.per_endpoint.\"{}\"", endpoint);
        if !endpoint.starts_with('/') {
            errors.push(ValidationError::new(field.clone(), "endpoint must start with '/'"));
        }
        if endpoint.contains('|') {
            errors.push(ValidationError::new(field.clone(), "endpoint must not contain '|'"));
        }
        validate_rule(&field, rule, factor, errors);
    }
    if factor == 0 {
        errors.push(ValidationError::new("rate_limit.retention_factor", "must be >= 1"));
    }
    if let Some(header) = &rate_limit.client_header {
        if HeaderName::from_bytes(header.as_bytes()).is_err() {
            errors.push(ValidationError::new(
                "rate_limit.client_header",
                format!("'{}' is not a valid header name", header),
            ));
        }
    }
}

fn validate_rule(
    field: &str,
    rule: &RateRule,
    retention_factor: u32,
    errors: &mut Vec<ValidationError>,
) {
    if rule.limit == 0 {
        errors.push(ValidationError::new(format!("{}.limit", field), "must be > 0"));
    }
    let period_field = format!("{}.period_secs", field);
    if validate_duration(&period_field, rule.period_secs, errors) {
        let retention = rule.period_secs.checked_mul(u64::from(retention_factor));
        if retention.map_or(true, |secs| secs > MAX_DURATION_SECS) {
            errors.push(ValidationError::new(
                period_field,
                format!(
                    "period_secs * retention_factor must be at most {} seconds",
                    MAX_DURATION_SECS
                ),
            ));
        }
    }
}

/// Durations must be non-zero and bounded. Returns true when `secs` passed.
fn validate_duration(field: &str, secs: u64, errors: &mut Vec<ValidationError>) -> bool {
    if secs == 0 {
        errors.push(ValidationError::new(field, "must be > 0"));
        false
    } else if secs > MAX_DURATION_SECS {
        errors.push(ValidationError::new(
            field,
            format!("must be at most {} seconds", MAX_DURATION_SECS),
        ));
        false
    } else {
        true
    }
}

/// Settings that are valid but worth a warning at startup.
pub fn config_warnings(config: &GuardConfig) -> Vec<String> {
    let mut warnings = Vec::new();
    if config.cookies.same_site == SameSite::None {
        warnings.push(
            "cookies.same_site = None sends cookies cross-site; Secure will be forced".to_string(),
        );
    }
    if config.rate_limit.client_header.is_some() {
        warnings.push(
            "rate_limit.client_header is trusted as the client identity; only set it behind a proxy that overwrites it"
                .to_string(),
        );
    }
    warnings
}

fn validate_sanitizer(config: &GuardConfig, errors: &mut Vec<ValidationError>) {
    let sanitizer = &config.sanitizer;
    for tag in &sanitizer.allowed_tags {
        if tag.is_empty() || !tag.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit()) {
            errors.push(ValidationError::new(
                "sanitizer.allowed_tags",
                format!("'{}' must be a lowercase tag name", tag),
            ));
        } else if is_raw_text(tag) || is_content_dropping(tag) {
            errors.push(ValidationError::new(
                "sanitizer.allowed_tags",
                format!("'{}' can carry active content and cannot be allowed", tag),
            ));
        }
    }
    for (tag, attributes) in &sanitizer.allowed_attributes {
        let field = format!("sanitizer.allowed_attributes.{}", tag);
        if tag != "*" && !sanitizer.allowed_tags.contains(tag) {
            errors.push(ValidationError::new(field.clone(), "tag is not in allowed_tags"));
        }
        for attribute in attributes {
            if attribute.starts_with("on") || attribute == "style" {
                errors.push(ValidationError::new(
                    field.clone(),
                    format!("'{}' can execute script and cannot be allowed", attribute),
                ));
            } else if attribute.is_empty()
                || !attribute
                    .bytes()
                    .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
            {
                errors.push(ValidationError::new(
                    field.clone(),
                    format!("'{}' must be a lowercase attribute name", attribute),
                ));
            }
        }
    }
    for scheme in &sanitizer.allowed_uri_schemes {
        let mut bytes = scheme.bytes();
        let valid = matches!(bytes.next(), Some(b) if b.is_ascii_lowercase())
            && bytes.all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b"+-.".contains(&b));
        if !valid {
            errors.push(ValidationError::new(
                "sanitizer.allowed_uri_schemes",
                format!("'{}' is not a lowercase URI scheme", scheme),
            ));
        } else if matches!(scheme.as_str(), "javascript" | "vbscript" | "data") {
            errors.push(ValidationError::new(
                "sanitizer.allowed_uri_schemes",
                format!("'{}' can execute script and cannot be allowed", scheme),
            ));
        }
    }
}

/// RFC 7230 token characters, used for cookie names.
fn is_token(value: &str) -> bool {
    !value.is_empty()
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::CspDirective;

    #[test]
    fn test_default_config_is_valid() {
        assert_eq!(validate_config(&GuardConfig::default()), Ok(()));
    }

    #[test]
    fn test_empty_csp_rejected() {
        let mut config = GuardConfig::default();
        config.csp.directives.clear();

        let errors = validate_config(&config).unwrap_err();
        assert!(errors.iter().any(|e| e.field == "csp.directives"));
    }

    #[test]
    fn test_all_errors_reported() {
        let mut config = GuardConfig::default();
        config.rate_limit.default_rule.limit = 0;
        config.rate_limit.default_rule.period_secs = 0;
        config.csp.directives.push(CspDirective::new("script-src", "'self'; object-src *"));
        config.csrf.header_name = "bad header".to_string();

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 4, "{:?}", errors);
    }

    #[test]
    fn test_dangerous_sanitizer_policy_rejected() {
        let mut config = GuardConfig::default();
        config.sanitizer.allowed_tags.insert("script".to_string());
        config
            .sanitizer
            .allowed_attributes
            .get_mut("a")
            .unwrap()
            .insert("onclick".to_string());
        config.sanitizer.allowed_uri_schemes.insert("javascript".to_string());

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 3, "{:?}", errors);
    }

    #[test]
    fn test_endpoint_must_be_path() {
        let mut config = GuardConfig::default();
        config
            .rate_limit
            .per_endpoint
            .insert("api".to_string(), RateRule::new(1, 1));

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors[0].field, "rate_limit.per_endpoint.\"api\"");
    }

    #[test]
    fn test_endpoint_separator_rejected() {
        let mut config = GuardConfig::default();
        config
            .rate_limit
            .per_endpoint
            .insert("/api|login".to_string(), RateRule::new(1, 1));

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 1, "{:?}", errors);
        assert!(errors[0].message.contains('|'));
    }

    #[test]
    fn test_oversized_durations_rejected() {
        let mut config = GuardConfig::default();
        config.csrf.token_ttl_secs = i64::MAX as u64;
        config.csrf.session_ttl_secs = u64::MAX;
        config.server.request_timeout_secs = MAX_DURATION_SECS + 1;
        config.rate_limit.default_rule.period_secs = u64::MAX;

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(
            fields,
            vec![
                "server.request_timeout_secs",
                "csrf.token_ttl_secs",
                "csrf.session_ttl_secs",
                "rate_limit.default.period_secs",
            ]
        );
    }

    #[test]
    fn test_largest_duration_accepted() {
        let mut config = GuardConfig::default();
        config.csrf.token_ttl_secs = MAX_DURATION_SECS;
        config.csrf.session_ttl_secs = MAX_DURATION_SECS;
        config.rate_limit.retention_factor = 1;
        config.rate_limit.default_rule.period_secs = MAX_DURATION_SECS;
        assert_eq!(validate_config(&config), Ok(()));
    }

    #[test]
    fn test_retention_window_bounded() {
        let mut config = GuardConfig::default();
        config.rate_limit.retention_factor = u32::MAX;
        config
            .rate_limit
            .per_endpoint
            .insert("/api".to_string(), RateRule::new(1, 60));

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 2, "{:?}", errors);
        assert!(errors.iter().all(|e| e.field.ends_with("period_secs")));
    }

    #[test]
    fn test_warnings_for_loose_settings() {
        assert!(config_warnings(&GuardConfig::default()).is_empty());

        let mut config = GuardConfig::default();
        config.cookies.same_site = SameSite::None;
        let warnings = config_warnings(&config);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("same_site"));
    }
}
