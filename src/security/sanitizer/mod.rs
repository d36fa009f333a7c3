//! Allow-list HTML sanitizer.
//!
//! # Responsibilities
//! - Tokenize untrusted markup
//! - Rebuild it as well-nested elements, unwrapping anything unbalanced
//! - Serialize only what the [`SanitizationPolicy`] allows
//!
//! # Design Decisions
//! - Unclosed elements are unwrapped, never auto-closed
//! - Content-dropping elements lose their whole subtree, whatever the policy says
//! - Output re-sanitizes to itself
//! - Nesting is capped; deeper start tags are unwrapped

mod policy;
mod tokenizer;

use std::sync::Arc;

use axum::{
    body::Body,
    http::{header, Extensions, HeaderValue},
    response::Response,
};
use serde_json::Value;

pub use policy::{is_uri_attribute, SanitizationPolicy};

use self::tokenizer::{tokenize, Token};
use crate::error::GuardError;
use crate::observability::metrics;
use crate::pipeline::{RenderedHtml, Stage};

const RAW_TEXT: &[&str] = &[
    "script", "style", "textarea", "title", "xmp", "iframe", "noembed", "noframes", "noscript",
];

const CONTENT_DROPPING: &[&str] = &[
    "script", "style", "iframe", "object", "embed", "template", "noscript", "textarea", "title",
    "xmp", "noembed", "noframes", "svg", "math",
];

const VOID: &[&str] = &[
    "br", "hr", "img", "wbr", "area", "col", "input", "source", "track", "param", "base", "link",
    "meta", "embed",
];

const MAX_DEPTH: usize = 256;

/// Elements whose content runs verbatim to the matching close tag.
pub fn is_raw_text(tag: &str) -> bool {
    RAW_TEXT.contains(&tag)
}

/// Elements discarded together with everything inside them.
pub fn is_content_dropping(tag: &str) -> bool {
    CONTENT_DROPPING.contains(&tag)
}

pub fn is_void(tag: &str) -> bool {
    VOID.contains(&tag)
}

/// Sanitizer output plus the parse problem that cut the input short, if any.
#[derive(Debug)]
pub struct Sanitized {
    pub html: String,
    pub parse_error: Option<GuardError>,
}

/// Sanitize `raw` under `policy`.
pub fn sanitize(raw: &str, policy: &SanitizationPolicy) -> String {
    sanitize_report(raw, policy).html
}

/// Like [`sanitize`], also reporting truncated input.
pub fn sanitize_report(raw: &str, policy: &SanitizationPolicy) -> Sanitized {
    let tokens = tokenize(raw);
    let mut builder = Builder::new(policy);
    for token in tokens.tokens {
        builder.push(token);
    }

    let parse_error = tokens.truncated.map(|reason| {
        tracing::debug!(%reason, "Discarded unterminated markup");
        metrics::record_sanitizer_parse_error();
        GuardError::SanitizationParse(reason)
    });

    Sanitized {
        html: builder.finish(),
        parse_error,
    }
}

/// An open element waiting for its close tag.
struct Frame {
    name: String,
    /// Rendered start tag, present only when the policy keeps the element.
    open_tag: Option<String>,
    dropping: bool,
    content: String,
}

/// Stack-based tree builder that serializes as elements close.
struct Builder<'p> {
    policy: &'p SanitizationPolicy,
    stack: Vec<Frame>,
    out: String,
}

impl<'p> Builder<'p> {
    fn new(policy: &'p SanitizationPolicy) -> Self {
        Self {
            policy,
            stack: Vec::new(),
            out: String::new(),
        }
    }

    fn push(&mut self, token: Token) {
        match token {
            Token::Text(text) => self.text(&text),
            Token::StartTag {
                name,
                attributes,
                self_closing,
            } => self.start_tag(name, &attributes, self_closing),
            Token::EndTag { name } => self.end_tag(&name),
        }
    }

    fn in_dropped_subtree(&self) -> bool {
        self.stack.last().map(|f| f.dropping).unwrap_or(false)
    }

    fn current(&mut self) -> &mut String {
        match self.stack.last_mut() {
            Some(frame) => &mut frame.content,
            None => &mut self.out,
        }
    }

    fn text(&mut self, text: &str) {
        if self.in_dropped_subtree() {
            return;
        }
        escape_into(self.current(), text);
    }

    fn start_tag(&mut self, name: String, attributes: &[(String, String)], self_closing: bool) {
        if self.in_dropped_subtree() {
            return;
        }

        if is_content_dropping(&name) {
            if !self_closing && !is_void(&name) {
                self.stack.push(Frame {
                    name,
                    open_tag: None,
                    dropping: true,
                    content: String::new(),
                });
            }
            return;
        }

        let open_tag = self
            .policy
            .allows_tag(&name)
            .then(|| render_start_tag(self.policy, &name, attributes));

        if is_void(&name) {
            if let Some(tag) = open_tag {
                self.current().push_str(&tag);
            }
            return;
        }

        if self_closing {
            if let Some(tag) = open_tag {
                let out = self.current();
                out.push_str(&tag);
                push_end_tag(out, &name);
            }
            return;
        }

        if self.stack.len() >= MAX_DEPTH {
            return;
        }
        self.stack.push(Frame {
            name,
            open_tag,
            dropping: false,
            content: String::new(),
        });
    }

    fn end_tag(&mut self, name: &str) {
        if self.in_dropped_subtree() {
            if self.stack.last().map(|f| f.name == name).unwrap_or(false) {
                self.stack.pop();
            }
            return;
        }

        let Some(index) = self.stack.iter().rposition(|f| f.name == name) else {
            return;
        };
        while self.stack.len() > index + 1 {
            self.close(false);
        }
        self.close(true);
    }

    /// Pop the innermost frame into its parent. Frames closed without their
    /// own end tag are unwrapped.
    fn close(&mut self, matched: bool) {
        let Some(frame) = self.stack.pop() else {
            return;
        };
        if frame.dropping {
            return;
        }
        let out = self.current();
        match frame.open_tag {
            Some(tag) if matched => {
                out.push_str(&tag);
                out.push_str(&frame.content);
                push_end_tag(out, &frame.name);
            }
            _ => out.push_str(&frame.content),
        }
    }

    fn finish(mut self) -> String {
        while !self.stack.is_empty() {
            self.close(false);
        }
        self.out
    }
}

fn render_start_tag(policy: &SanitizationPolicy, name: &str, attributes: &[(String, String)]) -> String {
    let mut tag = String::with_capacity(name.len() + 2);
    tag.push('<');
    tag.push_str(name);
    for (attribute, value) in attributes {
        if !policy.allows_attribute(name, attribute) || !policy.allows_value(attribute, value) {
            continue;
        }
        tag.push(' ');
        tag.push_str(attribute);
        tag.push_str("=\"");
        escape_into(&mut tag, value);
        tag.push('"');
    }
    tag.push('>');
    tag
}

fn push_end_tag(out: &mut String, name: &str) {
    out.push_str("</");
    out.push_str(name);
    out.push('>');
}

fn escape_into(out: &mut String, text: &str) {
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
}

/// Pipeline stage that turns [`RenderedHtml`] into a sanitized body.
pub struct SanitizeStage {
    policy: Arc<SanitizationPolicy>,
}

impl SanitizeStage {
    pub fn new(policy: Arc<SanitizationPolicy>) -> Self {
        Self { policy }
    }

    fn clean(&self, raw: &str) -> String {
        sanitize_report(raw, &self.policy).html
    }

    fn render_json(&self, mut document: Value, fields: &[String]) -> (String, usize) {
        let mut sanitized = 0;
        for pointer in fields {
            match document.pointer_mut(pointer) {
                Some(Value::String(markup)) => {
                    *markup = self.clean(markup);
                    sanitized += 1;
                }
                Some(slot) if !slot.is_null() => {
                    tracing::debug!(%pointer, "Marked HTML field is not a string, nulled");
                    *slot = Value::Null;
                }
                _ => {}
            }
        }
        (document.to_string(), sanitized)
    }
}

impl Stage for SanitizeStage {
    fn name(&self) -> &'static str {
        "sanitize"
    }

    fn finish(&self, _ctx: &Extensions, response: &mut Response) {
        let Some(rendered) = response.extensions_mut().remove::<RenderedHtml>() else {
            return;
        };

        let (body, content_type, fields) = match rendered {
            RenderedHtml::Page(markup) => (self.clean(&markup), "text/html; charset=utf-8", 1),
            RenderedHtml::Json { document, fields } => {
                let (body, sanitized) = self.render_json(document, &fields);
                (body, "application/json", sanitized)
            }
        };

        metrics::record_sanitized(fields);
        let headers = response.headers_mut();
        headers.remove(header::CONTENT_LENGTH);
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
        *response.body_mut() = Body::from(body);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SanitizerConfig;

    fn clean(raw: &str) -> String {
        sanitize(raw, &SanitizationPolicy::default())
    }

    #[test]
    fn test_script_dropped_and_unsafe_src_removed() {
        let policy = SanitizationPolicy::default();
        let out = sanitize(r#"<p>Hello<script>alert(1)</script><img src="javascript:x"></p>"#, &policy);
        assert_eq!(out, "<p>Hello<img></p>");
    }

    #[test]
    fn test_event_handlers_and_style_removed() {
        let out = clean(r#"<a href="https://example.com" onclick="steal()" style="x">go</a>"#);
        assert_eq!(out, r#"<a href="https://example.com">go</a>"#);
    }

    #[test]
    fn test_disallowed_tags_unwrapped() {
        assert_eq!(clean("<div><b>bold</b> <form>text</form></div>"), "<b>bold</b> text");
    }

    #[test]
    fn test_content_dropping_subtrees() {
        assert_eq!(clean("a<svg><p>inside</p></svg>b"), "ab");
        assert_eq!(clean("a<style>p { color: red }</style>b"), "ab");
        assert_eq!(clean("a<template><b>t</b></template>b"), "ab");
        assert_eq!(clean("a<embed src=x>b"), "ab");
    }

    #[test]
    fn test_unclosed_elements_unwrapped() {
        assert_eq!(clean("<b>bold"), "bold");
        assert_eq!(clean("<p><b>x</p>y"), "<p>x</p>y");
        assert_eq!(clean("<svg>never closed"), "");
    }

    #[test]
    fn test_stray_end_tags_dropped() {
        assert_eq!(clean("a</b>b</p>"), "ab");
        assert_eq!(clean("<br></br>"), "<br>");
    }

    #[test]
    fn test_self_closing_non_void_becomes_empty() {
        assert_eq!(clean("<b/>x<br/>"), "<b></b>x<br>");
    }

    #[test]
    fn test_text_is_escaped() {
        assert_eq!(clean("1 < 2 & \"3\" > '0'"), "1 &lt; 2 &amp; &quot;3&quot; &gt; &#39;0&#39;");
        assert_eq!(clean("&lt;script&gt;"), "&lt;script&gt;");
    }

    #[test]
    fn test_encoded_scheme_still_caught() {
        let out = clean(r#"<a href="java&#115;cript&colon;alert(1)">x</a>"#);
        assert_eq!(out, "<a>x</a>");
        let out = clean("<a href=\"jav&#x09;ascript:alert(1)\">x</a>");
        assert_eq!(out, "<a>x</a>");
    }

    #[test]
    fn test_relative_urls_follow_policy() {
        assert_eq!(clean(r#"<a href="/docs">d</a>"#), r#"<a href="/docs">d</a>"#);

        let mut config = SanitizerConfig::default();
        config.allow_relative_urls = false;
        let strict = SanitizationPolicy::from_config(&config);
        assert_eq!(sanitize(r#"<a href="/docs">d</a>"#, &strict), "<a>d</a>");
    }

    #[test]
    fn test_truncated_input_reports_parse_error() {
        let report = sanitize_report(r#"<p>ok</p><a href="x"#, &SanitizationPolicy::default());
        assert_eq!(report.html, "<p>ok</p>");
        assert!(matches!(report.parse_error, Some(GuardError::SanitizationParse(_))));
    }

    #[test]
    fn test_text_only_policy_strips_all_markup() {
        let out = sanitize("<p>a <b>b</b><script>c</script></p>", &SanitizationPolicy::text_only());
        assert_eq!(out, "a b");
    }

    #[test]
    fn test_depth_is_capped() {
        let raw = "<b>".repeat(MAX_DEPTH * 4) + "x" + &"</b>".repeat(MAX_DEPTH * 4);
        let once = clean(&raw);
        assert!(once.contains('x'));
        assert_eq!(clean(&once), once);
    }

    #[test]
    fn test_idempotent_on_hostile_inputs() {
        let inputs = [
            r#"<p title='"><script>x</script>'>t</p>"#,
            "<b><i>x</b></i>",
            "<a href=/x title=a&amp;b>l</a><a href=x:y>z</a>",
            "<<b>>",
            "</p><p>unclosed<b>",
            "<img src=\"https://x/y.png\" alt='a<b'>",
            "<ul><li>one<li>two</ul>",
        ];
        for input in inputs {
            let once = clean(input);
            assert_eq!(clean(&once), once, "input: {}", input);
        }
    }

    #[test]
    fn test_stage_materializes_json_fields() {
        let stage = SanitizeStage::new(Arc::new(SanitizationPolicy::default()));
        let mut response = Response::new(Body::empty());
        response.extensions_mut().insert(RenderedHtml::Json {
            document: serde_json::json!({
                "id": 1,
                "html": "<b>hi</b><script>x</script>",
                "nested": { "html": "<i onclick=x>n</i>" },
                "count": 3,
            }),
            fields: vec!["/html".into(), "/nested/html".into(), "/missing".into()],
        });

        stage.finish(&Extensions::new(), &mut response);

        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/json");
        assert!(response.extensions().get::<RenderedHtml>().is_none());
        let (document, _) = stage.render_json(
            serde_json::json!({ "html": "<b>hi</b><script>x</script>", "n": 2 }),
            &["/html".to_string(), "/n".to_string()],
        );
        let value: Value = serde_json::from_str(&document).unwrap();
        assert_eq!(value["html"], "<b>hi</b>");
        assert_eq!(value["n"], Value::Null);
    }
}
