//! Session registry and anti-forgery token store.
//!
//! # Responsibilities
//! - Open and register sessions
//! - Issue CSPRNG tokens bound to a session
//! - Validate presented tokens in constant time
//! - Revoke tokens and end sessions
//!
//! # Design Decisions
//! - One DashMap entry per session: unrelated sessions never contend
//! - Token values never appear in logs or `Debug` output
//! - Expiry is checked on every read; the sweeper only reclaims memory

use std::fmt;
use std::time::{Duration, Instant};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use dashmap::DashMap;
use rand::{rngs::OsRng, RngCore};
use subtle::ConstantTimeEq;

use crate::config::CsrfConfig;
use crate::error::GuardError;
use crate::observability::metrics;

/// Token entropy in bytes (256 bits).
const TOKEN_BYTES: usize = 32;

/// Session id entropy in bytes (128 bits).
const SESSION_ID_BYTES: usize = 16;

/// Checks presented anti-forgery tokens.
///
/// `TokenStore` implements this in-process; a store shared between several
/// guard processes can be plugged in behind the same seam.
pub trait TokenVerifier: Send + Sync {
    /// True iff `presented` is a live token for `session_id`.
    fn validate(&self, session_id: &str, presented: &str) -> bool;
}

/// An issued anti-forgery token.
#[derive(Clone)]
pub struct Token {
    value: String,
    pub issued_at: Instant,
    pub expires_at: Instant,
    pub session_id: String,
}

impl Token {
    /// The encoded token value to hand to the client.
    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("value", &"<redacted>")
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .field("session_id", &self.session_id)
            .finish()
    }
}

#[derive(Debug)]
struct SessionEntry {
    expires_at: Instant,
    /// Oldest first.
    tokens: Vec<Token>,
}

/// Process-wide token table.
pub struct TokenStore {
    sessions: DashMap<String, SessionEntry>,
    token_ttl: Duration,
    session_ttl: Duration,
    max_tokens_per_session: usize,
}

impl TokenStore {
    pub fn new(config: &CsrfConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            token_ttl: config.token_ttl(),
            session_ttl: config.session_ttl(),
            max_tokens_per_session: config.max_tokens_per_session.max(1),
        }
    }

    /// Open a fresh session with a random id.
    pub fn open_session(&self) -> String {
        self.open_session_at(Instant::now())
    }

    pub fn open_session_at(&self, now: Instant) -> String {
        let mut bytes = [0u8; SESSION_ID_BYTES];
        OsRng.fill_bytes(&mut bytes);
        let session_id = hex::encode(bytes);
        self.register_session_at(&session_id, now);
        session_id
    }

    /// Register a session established elsewhere (e.g. by an auth layer).
    /// Re-registering an existing session extends its lifetime.
    pub fn register_session(&self, session_id: &str) {
        self.register_session_at(session_id, Instant::now());
    }

    pub fn register_session_at(&self, session_id: &str, now: Instant) {
        let expires_at = expiry(now, self.session_ttl);
        self.sessions
            .entry(session_id.to_string())
            .and_modify(|entry| entry.expires_at = expires_at)
            .or_insert_with(|| SessionEntry {
                expires_at,
                tokens: Vec::new(),
            });
        metrics::record_sessions(self.sessions.len());
    }

    /// True if the session is registered and unexpired.
    pub fn has_session(&self, session_id: &str) -> bool {
        let now = Instant::now();
        self.sessions
            .get(session_id)
            .map(|entry| now < entry.expires_at)
            .unwrap_or(false)
    }

    /// Issue a new token for a known session.
    pub fn issue(&self, session_id: &str) -> Result<Token, GuardError> {
        self.issue_at(session_id, Instant::now())
    }

    pub fn issue_at(&self, session_id: &str, now: Instant) -> Result<Token, GuardError> {
        let mut entry = self
            .sessions
            .get_mut(session_id)
            .ok_or(GuardError::SessionInvalid)?;
        if now >= entry.expires_at {
            return Err(GuardError::SessionInvalid);
        }

        let mut bytes = [0u8; TOKEN_BYTES];
        OsRng.fill_bytes(&mut bytes);
        let token = Token {
            value: URL_SAFE_NO_PAD.encode(bytes),
            issued_at: now,
            expires_at: expiry(now, self.token_ttl),
            session_id: session_id.to_string(),
        };

        entry.tokens.retain(|t| !t.is_expired(now));
        if entry.tokens.len() >= self.max_tokens_per_session {
            let excess = entry.tokens.len() + 1 - self.max_tokens_per_session;
            entry.tokens.drain(..excess);
        }
        entry.tokens.push(token.clone());

        tracing::debug!(session = %short(session_id), live_tokens = entry.tokens.len(), "Issued anti-forgery token");
        Ok(token)
    }

    pub fn validate_at(&self, session_id: &str, presented: &str, now: Instant) -> bool {
        let Some(entry) = self.sessions.get(session_id) else {
            return false;
        };
        if now >= entry.expires_at {
            return false;
        }

        // Compare against every token so timing does not reveal which one matched.
        let presented = presented.as_bytes();
        let mut matched = subtle::Choice::from(0u8);
        for token in &entry.tokens {
            let live = subtle::Choice::from(u8::from(!token.is_expired(now)));
            matched |= token.value.as_bytes().ct_eq(presented) & live;
        }
        matched.into()
    }

    /// Remove every token of a session; the session itself stays open.
    pub fn revoke(&self, session_id: &str) {
        if let Some(mut entry) = self.sessions.get_mut(session_id) {
            entry.tokens.clear();
            tracing::debug!(session = %short(session_id), "Revoked anti-forgery tokens");
        }
    }

    /// Revoke and forget a session.
    pub fn end_session(&self, session_id: &str) {
        if self.sessions.remove(session_id).is_some() {
            tracing::debug!(session = %short(session_id), "Session ended");
        }
        metrics::record_sessions(self.sessions.len());
    }

    /// Drop expired tokens and sessions. Returns the number of sessions removed.
    pub fn purge_expired(&self, now: Instant) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, entry| {
            entry.tokens.retain(|t| !t.is_expired(now));
            now < entry.expires_at
        });
        let removed = before.saturating_sub(self.sessions.len());
        metrics::record_sessions(self.sessions.len());
        removed
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

impl TokenVerifier for TokenStore {
    fn validate(&self, session_id: &str, presented: &str) -> bool {
        self.validate_at(session_id, presented, Instant::now())
    }
}

/// `now + ttl`. An unrepresentable instant expires immediately.
fn expiry(now: Instant, ttl: Duration) -> Instant {
    now.checked_add(ttl).unwrap_or(now)
}

/// Session ids are credentials too; logs only get a prefix.
fn short(session_id: &str) -> &str {
    let end = session_id
        .char_indices()
        .nth(8)
        .map(|(i, _)| i)
        .unwrap_or(session_id.len());
    &session_id[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> TokenStore {
        TokenStore::new(&CsrfConfig {
            token_ttl_secs: 60,
            session_ttl_secs: 600,
            max_tokens_per_session: 3,
            ..Default::default()
        })
    }

    #[test]
    fn test_issue_then_validate() {
        let store = store();
        let session = store.open_session();
        let token = store.issue(&session).unwrap();

        assert!(store.validate(&session, token.value()));
        assert!(!store.validate(&session, "not-the-token"));
        assert!(!store.validate(&session, ""));
        assert!(!store.validate("other-session", token.value()));
    }

    #[test]
    fn test_token_has_enough_entropy() {
        let store = store();
        let session = store.open_session();
        let token = store.issue(&session).unwrap();
        let decoded = URL_SAFE_NO_PAD.decode(token.value()).unwrap();
        assert!(decoded.len() * 8 >= 128);
        assert_ne!(token.value(), store.issue(&session).unwrap().value());
    }

    #[test]
    fn test_issue_for_unknown_session_fails() {
        let store = store();
        assert!(matches!(store.issue("ghost"), Err(GuardError::SessionInvalid)));
    }

    #[test]
    fn test_expired_token_rejected() {
        let store = store();
        let now = Instant::now();
        let session = store.open_session_at(now);
        let token = store.issue_at(&session, now).unwrap();

        assert!(store.validate_at(&session, token.value(), now + Duration::from_secs(59)));
        assert!(!store.validate_at(&session, token.value(), now + Duration::from_secs(60)));
    }

    #[test]
    fn test_expired_session_rejected() {
        let store = store();
        let now = Instant::now();
        let session = store.open_session_at(now);
        let later = now + Duration::from_secs(600);

        assert!(matches!(store.issue_at(&session, later), Err(GuardError::SessionInvalid)));
    }

    #[test]
    fn test_revoke_is_idempotent() {
        let store = store();
        let session = store.open_session();
        let token = store.issue(&session).unwrap();

        store.revoke(&session);
        store.revoke(&session);
        store.revoke("never-existed");
        assert!(!store.validate(&session, token.value()));
        // Session survives revocation and can get a new token.
        assert!(store.issue(&session).is_ok());
    }

    #[test]
    fn test_oldest_token_evicted_beyond_cap() {
        let store = store();
        let session = store.open_session();
        let first = store.issue(&session).unwrap();
        for _ in 0..3 {
            store.issue(&session).unwrap();
        }
        assert!(!store.validate(&session, first.value()));
    }

    #[test]
    fn test_end_session_and_purge() {
        let store = store();
        let now = Instant::now();
        let a = store.open_session_at(now);
        let b = store.open_session_at(now);
        store.end_session(&a);
        store.end_session(&a);
        assert!(matches!(store.issue(&a), Err(GuardError::SessionInvalid)));

        assert_eq!(store.purge_expired(now + Duration::from_secs(601)), 1);
        assert!(!store.has_session(&b));
        assert_eq!(store.session_count(), 0);
    }

    #[test]
    fn test_huge_ttl_does_not_overflow() {
        let store = TokenStore::new(&CsrfConfig {
            token_ttl_secs: i64::MAX as u64,
            session_ttl_secs: u64::MAX,
            ..Default::default()
        });
        let session = store.open_session();
        let token = store.issue(&session).unwrap();
        assert!(store.validate(&session, token.value()));
    }

    #[test]
    fn test_unrepresentable_expiry_fails_closed() {
        let now = Instant::now();
        assert_eq!(expiry(now, Duration::MAX), now);
        assert_eq!(expiry(now, Duration::from_secs(5)), now + Duration::from_secs(5));
    }

    #[test]
    fn test_debug_redacts_value() {
        let store = store();
        let session = store.open_session();
        let token = store.issue(&session).unwrap();
        let rendered = format!("{:?}", token);
        assert!(!rendered.contains(token.value()));
        assert!(rendered.contains("<redacted>"));
    }
}
