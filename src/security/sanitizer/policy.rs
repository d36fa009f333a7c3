//! Allow-list policy for rendered HTML.

use std::collections::{HashMap, HashSet};

use url::Url;

use crate::config::SanitizerConfig;

/// Attributes whose values are URLs and need a scheme check.
const URI_ATTRIBUTES: &[&str] = &[
    "href",
    "src",
    "cite",
    "action",
    "formaction",
    "poster",
    "background",
    "longdesc",
    "usemap",
];

/// Immutable allow-list, built once at startup.
#[derive(Debug, Clone)]
pub struct SanitizationPolicy {
    allowed_tags: HashSet<String>,
    allowed_attributes: HashMap<String, HashSet<String>>,
    global_attributes: HashSet<String>,
    allowed_uri_schemes: HashSet<String>,
    allow_relative_urls: bool,
}

impl SanitizationPolicy {
    pub fn from_config(config: &SanitizerConfig) -> Self {
        let mut allowed_attributes: HashMap<String, HashSet<String>> = HashMap::new();
        let mut global_attributes = HashSet::new();
        for (tag, attributes) in &config.allowed_attributes {
            let attributes = attributes.iter().map(|a| a.to_ascii_lowercase());
            if tag == "*" {
                global_attributes.extend(attributes);
            } else {
                allowed_attributes
                    .entry(tag.to_ascii_lowercase())
                    .or_default()
                    .extend(attributes);
            }
        }

        Self {
            allowed_tags: config
                .allowed_tags
                .iter()
                .map(|t| t.to_ascii_lowercase())
                .collect(),
            allowed_attributes,
            global_attributes,
            allowed_uri_schemes: config
                .allowed_uri_schemes
                .iter()
                .map(|s| s.to_ascii_lowercase())
                .collect(),
            allow_relative_urls: config.allow_relative_urls,
        }
    }

    /// A policy that keeps no markup at all; every tag is unwrapped.
    pub fn text_only() -> Self {
        Self {
            allowed_tags: HashSet::new(),
            allowed_attributes: HashMap::new(),
            global_attributes: HashSet::new(),
            allowed_uri_schemes: HashSet::new(),
            allow_relative_urls: false,
        }
    }

    pub fn allows_tag(&self, tag: &str) -> bool {
        self.allowed_tags.contains(tag)
    }

    pub fn allows_attribute(&self, tag: &str, attribute: &str) -> bool {
        self.global_attributes.contains(attribute)
            || self
                .allowed_attributes
                .get(tag)
                .map(|set| set.contains(attribute))
                .unwrap_or(false)
    }

    /// Check an attribute value. Non-URI attributes always pass.
    pub fn allows_value(&self, attribute: &str, value: &str) -> bool {
        if !is_uri_attribute(attribute) {
            return true;
        }
        self.allows_uri(value)
    }

    /// Absolute URLs need an allowed scheme; relative ones need
    /// `allow_relative_urls`. Unparseable values are refused.
    pub fn allows_uri(&self, value: &str) -> bool {
        match Url::parse(value) {
            Ok(url) => self.allowed_uri_schemes.contains(url.scheme()),
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                self.allow_relative_urls && !looks_like_scheme(value)
            }
            Err(_) => false,
        }
    }
}

impl Default for SanitizationPolicy {
    fn default() -> Self {
        Self::from_config(&SanitizerConfig::default())
    }
}

pub fn is_uri_attribute(attribute: &str) -> bool {
    URI_ATTRIBUTES.contains(&attribute)
}

/// Catch `scheme:` prefixes the URL parser did not accept as absolute,
/// e.g. a scheme split by characters a browser would strip.
fn looks_like_scheme(value: &str) -> bool {
    let cleaned: String = value
        .chars()
        .filter(|c| !c.is_ascii_whitespace() && !c.is_control())
        .collect();
    match cleaned.find(':') {
        Some(colon) => {
            let head = &cleaned[..colon];
            !head.is_empty() && !head.contains(['/', '?', '#'])
        }
        None => false,
    }
}
