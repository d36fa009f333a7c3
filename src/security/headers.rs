//! Security response headers.
//!
//! # Responsibilities
//! - Content-Security-Policy (or its report-only variant)
//! - Force the configured `SameSite` attribute on every `Set-Cookie`
//! - Baseline hardening headers
//!
//! # Design Decisions
//! - Header values are rendered once at startup
//! - Runs on every response, rejections included

use axum::{
    http::{header, Extensions, HeaderName, HeaderValue},
    response::Response,
};

use crate::config::{CspConfig, CspDirective, GuardConfig, SameSite};
use crate::error::GuardError;
use crate::pipeline::Stage;

/// Render directives as a CSP header value.
pub fn csp_header_value(directives: &[CspDirective]) -> String {
    directives
        .iter()
        .map(|d| {
            if d.value.is_empty() {
                d.name.clone()
            } else {
                format!("{} {}", d.name, d.value)
            }
        })
        .collect::<Vec<_>>()
        .join("; ")
}

/// Rewrite one `Set-Cookie` value so it carries exactly `same_site`.
pub fn force_same_site(cookie: &str, same_site: SameSite) -> String {
    let mut parts = cookie.split(';').map(str::trim);
    let name_value = parts.next().unwrap_or_default();
    let attributes: Vec<&str> = parts
        .filter(|attr| !attr.is_empty() && !attribute_is(attr, "samesite"))
        .collect();

    let secure = attributes.iter().any(|attr| attribute_is(attr, "secure"));

    let mut rendered = name_value.to_string();
    for attr in &attributes {
        rendered.push_str("; ");
        rendered.push_str(attr);
    }
    rendered.push_str("; SameSite=");
    rendered.push_str(same_site.as_str());
    if same_site == SameSite::None && !secure {
        rendered.push_str("; Secure");
    }
    rendered
}

fn attribute_is(attribute: &str, name: &str) -> bool {
    let key = attribute.split('=').next().unwrap_or_default().trim();
    key.eq_ignore_ascii_case(name)
}

/// Pipeline stage applying the security headers.
#[derive(Debug, Clone)]
pub struct PolicyHeaderInjector {
    csp_name: HeaderName,
    csp_value: HeaderValue,
    same_site: SameSite,
    baseline: Vec<(HeaderName, HeaderValue)>,
}

impl PolicyHeaderInjector {
    pub fn from_config(config: &GuardConfig) -> Result<Self, GuardError> {
        let csp_value = render_csp(&config.csp)?;
        let csp_name = if config.csp.report_only {
            header::CONTENT_SECURITY_POLICY_REPORT_ONLY
        } else {
            header::CONTENT_SECURITY_POLICY
        };

        let mut baseline = Vec::new();
        if config.headers.nosniff {
            baseline.push((header::X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff")));
        }
        if let Some(value) = &config.headers.frame_options {
            baseline.push((header::X_FRAME_OPTIONS, header_value("headers.frame_options", value)?));
        }
        if let Some(value) = &config.headers.referrer_policy {
            baseline.push((header::REFERRER_POLICY, header_value("headers.referrer_policy", value)?));
        }

        Ok(Self {
            csp_name,
            csp_value,
            same_site: config.cookies.same_site,
            baseline,
        })
    }

    /// Apply every header to `response`.
    pub fn apply(&self, response: &mut Response) {
        let headers = response.headers_mut();

        headers.remove(header::CONTENT_SECURITY_POLICY);
        headers.remove(header::CONTENT_SECURITY_POLICY_REPORT_ONLY);
        headers.insert(self.csp_name.clone(), self.csp_value.clone());

        for (name, value) in &self.baseline {
            headers.insert(name.clone(), value.clone());
        }

        let cookies: Vec<HeaderValue> = headers
            .get_all(header::SET_COOKIE)
            .iter()
            .cloned()
            .collect();
        if cookies.is_empty() {
            return;
        }
        headers.remove(header::SET_COOKIE);
        for cookie in cookies {
            let Ok(raw) = cookie.to_str() else {
                tracing::debug!("Dropped Set-Cookie with non-visible characters");
                continue;
            };
            match HeaderValue::from_str(&force_same_site(raw, self.same_site)) {
                Ok(value) => {
                    headers.append(header::SET_COOKIE, value);
                }
                Err(_) => tracing::debug!("Dropped Set-Cookie that could not be rewritten"),
            }
        }
    }
}

impl Stage for PolicyHeaderInjector {
    fn name(&self) -> &'static str {
        "security_headers"
    }

    fn finish(&self, _ctx: &Extensions, response: &mut Response) {
        self.apply(response);
    }
}

fn render_csp(csp: &CspConfig) -> Result<HeaderValue, GuardError> {
    if csp.directives.is_empty() {
        return Err(invalid("csp.directives", "at least one directive is required"));
    }
    header_value("csp.directives", &csp_header_value(&csp.directives))
}

fn header_value(field: &str, value: &str) -> Result<HeaderValue, GuardError> {
    HeaderValue::from_str(value).map_err(|_| invalid(field, "not a valid header value"))
}

fn invalid(field: &str, message: &str) -> GuardError {
    GuardError::PolicyConfigInvalid(vec![crate::config::ValidationError::new(field, message)])
}
