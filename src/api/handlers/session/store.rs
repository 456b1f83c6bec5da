//! Session store abstraction and cookie plumbing.
//!
//! Sessions are opaque random tokens handed to the browser in
//! `_portico_session`; stores only ever see the SHA-256 of the token. Every
//! successful lookup refreshes the idle timer.

use anyhow::Result;
use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderValue, header::InvalidHeaderValue};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::state::GatewayConfig;
use super::utils::{extract_cookie, generate_token, hash_token};

pub(super) const SESSION_COOKIE_NAME: &str = "_portico_session";

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Persist a new session for `user_id` and return the raw token.
    async fn create(&self, user_id: Uuid) -> Result<String>;

    /// Resolve a raw token to its user, refreshing the idle timer.
    async fn lookup(&self, token: &str) -> Result<Option<Uuid>>;

    /// Remove the session; unknown tokens are ignored.
    async fn destroy(&self, token: &str) -> Result<()>;
}

#[derive(Debug)]
struct SessionEntry {
    user_id: Uuid,
    last_seen: Instant,
}

/// Process-local store with an idle timeout.
#[derive(Debug)]
pub struct InMemorySessionStore {
    idle_ttl: Duration,
    sessions: Mutex<HashMap<Vec<u8>, SessionEntry>>,
}

impl InMemorySessionStore {
    #[must_use]
    pub fn new(idle_ttl: Duration) -> Self {
        Self {
            idle_ttl,
            sessions: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create(&self, user_id: Uuid) -> Result<String> {
        let token = generate_token()?;
        let mut sessions = self.sessions.lock().await;
        sessions.retain(|_, entry| entry.last_seen.elapsed() < self.idle_ttl);
        sessions.insert(
            hash_token(&token),
            SessionEntry {
                user_id,
                last_seen: Instant::now(),
            },
        );
        Ok(token)
    }

    async fn lookup(&self, token: &str) -> Result<Option<Uuid>> {
        let key = hash_token(token);
        let mut sessions = self.sessions.lock().await;
        let Some(entry) = sessions.get_mut(&key) else {
            return Ok(None);
        };
        if entry.last_seen.elapsed() >= self.idle_ttl {
            sessions.remove(&key);
            return Ok(None);
        }
        entry.last_seen = Instant::now();
        Ok(Some(entry.user_id))
    }

    async fn destroy(&self, token: &str) -> Result<()> {
        self.sessions.lock().await.remove(&hash_token(token));
        Ok(())
    }
}

pub(super) fn cookie_attributes(config: &GatewayConfig) -> &'static str {
    // Cross-origin logout needs the cookie on third-party requests, which
    // browsers only allow for `SameSite=None; Secure`.
    if config.session_cookie_secure() {
        "SameSite=None; Secure"
    } else {
        "SameSite=Lax"
    }
}

/// Build the `HttpOnly` session cookie for `token`.
pub(super) fn session_cookie(
    config: &GatewayConfig,
    token: &str,
) -> Result<HeaderValue, InvalidHeaderValue> {
    let ttl_seconds = config.session_ttl_seconds();
    let attributes = cookie_attributes(config);
    HeaderValue::from_str(&format!(
        "{SESSION_COOKIE_NAME}={token}; Path=/; HttpOnly; {attributes}; Max-Age={ttl_seconds}"
    ))
}

pub(super) fn clear_session_cookie(
    config: &GatewayConfig,
) -> Result<HeaderValue, InvalidHeaderValue> {
    let attributes = cookie_attributes(config);
    HeaderValue::from_str(&format!(
        "{SESSION_COOKIE_NAME}=; Path=/; HttpOnly; {attributes}; Max-Age=0"
    ))
}

pub(super) fn extract_session_token(headers: &HeaderMap) -> Option<String> {
    extract_cookie(headers, SESSION_COOKIE_NAME)
}
