//! Fixed-window rate limiting with per-endpoint rules.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{Extensions, HeaderName, HeaderValue, Request},
    response::Response,
};
use dashmap::{mapref::entry::Entry, DashMap};

use crate::config::{RateLimitConfig, RateRule};
use crate::error::GuardError;
use crate::observability::metrics;
use crate::pipeline::Stage;

/// Key prefix for windows under the default rule. Endpoint prefixes start
/// with '/' and never contain '|', so the namespaces cannot meet.
const DEFAULT_NAMESPACE: &str = "*";

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed {
        /// Requests left in the current window.
        remaining: u32,
    },
    Rejected {
        /// Time until the current window closes.
        retry_after: Duration,
    },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed { .. })
    }
}

/// Counter for one key in the current window.
#[derive(Debug, Clone)]
struct RateWindow {
    window_start: Instant,
    count: u32,
    limit: u32,
    period: Duration,
    last_seen: Instant,
}

impl RateWindow {
    fn new(rule: &RateRule, now: Instant) -> Self {
        Self {
            window_start: now,
            count: 0,
            limit: rule.limit,
            period: rule.period(),
            last_seen: now,
        }
    }

    fn admit(&mut self, now: Instant) -> Admission {
        // A clock reading older than the window start counts toward the current window.
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed >= self.period {
            self.window_start = now;
            self.count = 0;
        }
        self.last_seen = self.last_seen.max(now);
        self.count = self.count.saturating_add(1);

        if self.count > self.limit {
            let elapsed = now.saturating_duration_since(self.window_start);
            Admission::Rejected {
                retry_after: self.period - elapsed,
            }
        } else {
            Admission::Allowed {
                remaining: self.limit - self.count,
            }
        }
    }
}

/// Process-wide window table.
///
/// Each key's read-modify-write happens under its DashMap shard lock, so two
/// concurrent requests for the same key can never both take the last slot.
pub struct RateLimiter {
    windows: DashMap<String, RateWindow>,
    default_rule: RateRule,
    /// Sorted longest prefix first.
    endpoints: Vec<(String, RateRule)>,
    retention_factor: u32,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        let mut endpoints: Vec<(String, RateRule)> = config
            .per_endpoint
            .iter()
            .map(|(prefix, rule)| (prefix.clone(), *rule))
            .collect();
        endpoints.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));

        Self {
            windows: DashMap::new(),
            default_rule: config.default_rule,
            endpoints,
            retention_factor: config.retention_factor.max(1),
        }
    }

    /// Admit one request for `key` under the default rule.
    pub fn admit(&self, key: &str, now: Instant) -> Admission {
        self.admit_with(key, &self.default_rule, now)
    }

    /// Admit one request for `client` on `path`, using the most specific rule.
    pub fn admit_request(&self, path: &str, client: &str, now: Instant) -> Admission {
        match self.rule_for(path) {
            Some((prefix, rule)) => {
                let key = format!("{}|{}", prefix, client);
                self.admit_with(&key, rule, now)
            }
            None => {
                let key = format!("{}|{}", DEFAULT_NAMESPACE, client);
                self.admit_with(&key, &self.default_rule, now)
            }
        }
    }

    /// The endpoint override matching `path`, longest prefix first.
    pub fn rule_for(&self, path: &str) -> Option<(&str, &RateRule)> {
        self.endpoints
            .iter()
            .find(|(prefix, _)| prefix_matches(prefix, path))
            .map(|(prefix, rule)| (prefix.as_str(), rule))
    }

    /// The limit that applies to `path`.
    pub fn limit_for(&self, path: &str) -> u32 {
        self.rule_for(path)
            .map(|(_, rule)| rule.limit)
            .unwrap_or(self.default_rule.limit)
    }

    fn admit_with(&self, key: &str, rule: &RateRule, now: Instant) -> Admission {
        let (admission, inserted) = match self.windows.entry(key.to_string()) {
            Entry::Occupied(mut entry) => (entry.get_mut().admit(now), false),
            Entry::Vacant(entry) => (entry.insert(RateWindow::new(rule, now)).admit(now), true),
        };
        // The shard lock is released here; `len` takes every shard's lock.
        if inserted {
            metrics::record_rate_windows(self.windows.len());
        }
        admission
    }

    /// Evict windows idle past the retention period whose window has closed.
    /// Returns the number of windows removed.
    pub fn evict_idle(&self, now: Instant) -> usize {
        let before = self.windows.len();
        let factor = self.retention_factor;
        self.windows.retain(|_, window| {
            let closed = window
                .window_start
                .checked_add(window.period)
                .is_some_and(|end| now > end);
            let idle = window
                .period
                .checked_mul(factor)
                .is_some_and(|retention| now.saturating_duration_since(window.last_seen) > retention);
            !(closed && idle)
        });
        let removed = before.saturating_sub(self.windows.len());
        metrics::record_rate_windows(self.windows.len());
        removed
    }

    pub fn window_count(&self) -> usize {
        self.windows.len()
    }
}

/// Segment-aware prefix match: `/api` matches `/api` and `/api/x`, not `/apix`.
fn prefix_matches(prefix: &str, path: &str) -> bool {
    if prefix == "/" {
        return true;
    }
    let prefix = prefix.trim_end_matches('/');
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Remaining allowance, reported back on the response.
#[derive(Debug, Clone, Copy)]
struct RateAllowance {
    limit: u32,
    remaining: u32,
}

/// Pipeline stage running the admission check.
pub struct RateLimitStage {
    limiter: Arc<RateLimiter>,
    client_header: Option<HeaderName>,
}

impl RateLimitStage {
    pub fn new(limiter: Arc<RateLimiter>, config: &RateLimitConfig) -> Self {
        let client_header = config
            .client_header
            .as_deref()
            .and_then(|h| HeaderName::from_bytes(h.as_bytes()).ok());
        Self {
            limiter,
            client_header,
        }
    }

    /// Identify the client: configured header first, then the peer address.
    fn client_key(&self, request: &Request<Body>) -> String {
        let from_header = self.client_header.as_ref().and_then(|name| {
            request
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(',').next())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        });
        if let Some(client) = from_header {
            return client.to_string();
        }
        request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

impl Stage for RateLimitStage {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    fn inspect(&self, request: &mut Request<Body>, ctx: &mut Extensions) -> Result<(), GuardError> {
        let client = self.client_key(request);
        let path = request.uri().path().to_string();

        match self.limiter.admit_request(&path, &client, Instant::now()) {
            Admission::Allowed { remaining } => {
                let limit = self.limiter.limit_for(&path);
                ctx.insert(RateAllowance { limit, remaining });
                Ok(())
            }
            Admission::Rejected { retry_after } => {
                tracing::warn!(client = %client, path = %path, ?retry_after, "Rate limit exceeded");
                Err(GuardError::RateLimitExceeded { retry_after })
            }
        }
    }

    fn finish(&self, ctx: &Extensions, response: &mut Response) {
        if let Some(allowance) = ctx.get::<RateAllowance>() {
            let headers = response.headers_mut();
            headers.insert("x-ratelimit-limit", HeaderValue::from(allowance.limit));
            headers.insert("x-ratelimit-remaining", HeaderValue::from(allowance.remaining));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn limiter(limit: u32, period_secs: u64) -> RateLimiter {
        RateLimiter::new(&RateLimitConfig {
            default_rule: RateRule::new(limit, period_secs),
            ..Default::default()
        })
    }

    #[test]
    fn test_thirty_per_minute_scenario() {
        let limiter = limiter(30, 60);
        let start = Instant::now();

        for i in 0..30 {
            let now = start + Duration::from_millis(i * 333);
            assert!(limiter.admit("1.2.3.4", now).is_allowed(), "request {} should pass", i + 1);
        }

        let now = start + Duration::from_secs(10);
        match limiter.admit("1.2.3.4", now) {
            Admission::Rejected { retry_after } => assert_eq!(retry_after, Duration::from_secs(50)),
            other => panic!("31st request should be rejected, got {:?}", other),
        }
    }

    #[test]
    fn test_window_resets_after_period() {
        let limiter = limiter(2, 60);
        let start = Instant::now();

        assert!(limiter.admit("k", start).is_allowed());
        assert!(limiter.admit("k", start).is_allowed());
        assert!(!limiter.admit("k", start + Duration::from_secs(59)).is_allowed());
        assert_eq!(
            limiter.admit("k", start + Duration::from_secs(60)),
            Admission::Allowed { remaining: 1 }
        );
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = limiter(1, 60);
        let now = Instant::now();
        assert!(limiter.admit("a", now).is_allowed());
        assert!(!limiter.admit("a", now).is_allowed());
        assert!(limiter.admit("b", now).is_allowed());
    }

    #[test]
    fn test_retry_after_always_positive() {
        let limiter = limiter(1, 1);
        let now = Instant::now();
        limiter.admit("k", now);
        match limiter.admit("k", now + Duration::from_millis(999)) {
            Admission::Rejected { retry_after } => assert!(retry_after > Duration::ZERO),
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[test]
    fn test_most_specific_endpoint_wins() {
        let mut per_endpoint = BTreeMap::new();
        per_endpoint.insert("/api".to_string(), RateRule::new(10, 60));
        per_endpoint.insert("/api/login".to_string(), RateRule::new(1, 60));
        let limiter = RateLimiter::new(&RateLimitConfig {
            default_rule: RateRule::new(100, 60),
            per_endpoint,
            ..Default::default()
        });

        assert_eq!(limiter.limit_for("/api/login"), 1);
        assert_eq!(limiter.limit_for("/api/login/otp"), 1);
        assert_eq!(limiter.limit_for("/api/users"), 10);
        assert_eq!(limiter.limit_for("/apix"), 100);
        assert_eq!(limiter.limit_for("/"), 100);

        let now = Instant::now();
        assert!(limiter.admit_request("/api/login", "c", now).is_allowed());
        assert!(!limiter.admit_request("/api/login", "c", now).is_allowed());
        // Other rules keep their own windows.
        assert!(limiter.admit_request("/api/users", "c", now).is_allowed());
        assert!(limiter.admit_request("/home", "c", now).is_allowed());
    }

    #[test]
    fn test_eviction_waits_for_window_close_and_retention() {
        let limiter = RateLimiter::new(&RateLimitConfig {
            default_rule: RateRule::new(1, 10),
            retention_factor: 2,
            ..Default::default()
        });
        let start = Instant::now();
        limiter.admit("k", start);
        assert!(!limiter.admit("k", start).is_allowed());

        assert_eq!(limiter.evict_idle(start + Duration::from_secs(5)), 0);
        assert_eq!(limiter.evict_idle(start + Duration::from_secs(20)), 0);
        assert_eq!(limiter.evict_idle(start + Duration::from_secs(21)), 1);
        assert_eq!(limiter.window_count(), 0);
    }

    #[test]
    fn test_default_windows_separate_from_endpoint_windows() {
        let mut per_endpoint = BTreeMap::new();
        per_endpoint.insert("/api/login".to_string(), RateRule::new(5, 60));
        let limiter = RateLimiter::new(&RateLimitConfig {
            default_rule: RateRule::new(1, 60),
            per_endpoint,
            ..Default::default()
        });
        let now = Instant::now();

        // A client id spelled like an endpoint key stays in the default namespace.
        assert!(limiter.admit_request("/home", "/api/login|victim", now).is_allowed());
        assert!(!limiter.admit_request("/home", "/api/login|victim", now).is_allowed());
        assert_eq!(
            limiter.admit_request("/api/login", "victim", now),
            Admission::Allowed { remaining: 4 }
        );
    }

    #[test]
    fn test_huge_period_never_evicted_and_never_panics() {
        let limiter = RateLimiter::new(&RateLimitConfig {
            default_rule: RateRule::new(1, u64::MAX),
            retention_factor: u32::MAX,
            ..Default::default()
        });
        let now = Instant::now();
        limiter.admit("k", now);
        assert!(!limiter.admit("k", now).is_allowed());
        assert_eq!(limiter.evict_idle(now + Duration::from_secs(3600)), 0);
        assert_eq!(limiter.window_count(), 1);
    }

    /// Remembers the last value set on one gauge.
    struct LastGauge {
        name: &'static str,
        value: Arc<GaugeCell>,
    }

    struct GaugeCell(std::sync::atomic::AtomicU64);

    impl GaugeCell {
        fn get(&self) -> f64 {
            f64::from_bits(self.0.load(std::sync::atomic::Ordering::SeqCst))
        }
    }

    impl ::metrics::GaugeFn for GaugeCell {
        fn increment(&self, value: f64) {
            self.set(self.get() + value);
        }

        fn decrement(&self, value: f64) {
            self.set(self.get() - value);
        }

        fn set(&self, value: f64) {
            self.0.store(value.to_bits(), std::sync::atomic::Ordering::SeqCst);
        }
    }

    impl ::metrics::Recorder for LastGauge {
        fn describe_counter(&self, _: ::metrics::KeyName, _: Option<::metrics::Unit>, _: ::metrics::SharedString) {}
        fn describe_gauge(&self, _: ::metrics::KeyName, _: Option<::metrics::Unit>, _: ::metrics::SharedString) {}
        fn describe_histogram(&self, _: ::metrics::KeyName, _: Option<::metrics::Unit>, _: ::metrics::SharedString) {}

        fn register_counter(&self, _: &::metrics::Key, _: &::metrics::Metadata<'_>) -> ::metrics::Counter {
            ::metrics::Counter::noop()
        }

        fn register_gauge(&self, key: &::metrics::Key, _: &::metrics::Metadata<'_>) -> ::metrics::Gauge {
            if key.name() == self.name {
                ::metrics::Gauge::from_arc(self.value.clone())
            } else {
                ::metrics::Gauge::noop()
            }
        }

        fn register_histogram(&self, _: &::metrics::Key, _: &::metrics::Metadata<'_>) -> ::metrics::Histogram {
            ::metrics::Histogram::noop()
        }
    }

    #[test]
    fn test_window_gauge_tracks_new_keys() {
        let limiter = limiter(10, 60);
        let recorder = LastGauge {
            name: "guard_rate_windows",
            value: Arc::new(GaugeCell(std::sync::atomic::AtomicU64::new(0))),
        };
        let now = Instant::now();

        ::metrics::with_local_recorder(&recorder, || {
            limiter.admit("a", now);
            limiter.admit("b", now);
            limiter.admit("a", now);
        });
        assert_eq!(recorder.value.get(), 2.0);
    }

    #[test]
    fn test_concurrent_admissions_never_exceed_limit() {
        let limiter = Arc::new(limiter(50, 60));
        let now = Instant::now();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                std::thread::spawn(move || {
                    (0..25).filter(|_| limiter.admit("shared", now).is_allowed()).count()
                })
            })
            .collect();

        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 50);
    }

    #[test]
    fn test_client_key_prefers_configured_header() {
        let limiter = Arc::new(limiter(10, 60));
        let stage = RateLimitStage::new(
            limiter,
            &RateLimitConfig {
                client_header: Some("X-Forwarded-For".to_string()),
                ..Default::default()
            },
        );

        let request = Request::builder()
            .header("X-Forwarded-For", "203.0.113.9, 10.0.0.1")
            .body(Body::empty())
            .unwrap();
        assert_eq!(stage.client_key(&request), "203.0.113.9");

        let mut request = Request::builder().body(Body::empty()).unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo("198.51.100.4:5555".parse::<SocketAddr>().unwrap()));
        assert_eq!(stage.client_key(&request), "198.51.100.4");

        let request = Request::builder().body(Body::empty()).unwrap();
        assert_eq!(stage.client_key(&request), "unknown");
    }
}
