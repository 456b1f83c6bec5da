//! Rate limiting primitives for session endpoints.
//!
//! Flow Overview:
//! 1) Each public action maps to one or more windows (hourly, per-minute).
//! 2) Every attempt increments the counter of the current wall-clock bucket.
//! 3) The attempt fails once the post-increment count exceeds the window limit;
//!    the increment is kept, so rejected attempts still count.
//!
//! Buckets from earlier windows are reset lazily the next time the same key is
//! seen, so there is no background sweeper.
//!
//! `InMemoryRateLimiter` serves a single process; `postgres::PgRateLimiter`
//! shares counters between instances.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::warn;

/// Forget idle keys once the table grows past this many entries.
const SWEEP_THRESHOLD: usize = 10_000;

const LOGIN_WINDOWS: [RateLimitWindow; 2] = [
    RateLimitWindow::per_hour(30),
    RateLimitWindow::per_minute(6),
];

const FORGOT_PASSWORD_WINDOWS: [RateLimitWindow; 2] = [
    RateLimitWindow::per_hour(6),
    RateLimitWindow::per_minute(3),
];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RateLimitAction {
    Login,
    ForgotPassword,
}

impl RateLimitAction {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Login => "login",
            Self::ForgotPassword => "forgot-password",
        }
    }

    /// Windows applied to the action, in the order they are checked.
    #[must_use]
    pub const fn windows(self) -> &'static [RateLimitWindow] {
        match self {
            Self::Login => &LOGIN_WINDOWS,
            Self::ForgotPassword => &FORGOT_PASSWORD_WINDOWS,
        }
    }
}

/// Counter identity: which action, performed by which client.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    action: RateLimitAction,
    client: String,
}

impl RateLimitKey {
    #[must_use]
    pub fn new(action: RateLimitAction, client: &str) -> Self {
        Self {
            action,
            client: client.to_string(),
        }
    }

    #[must_use]
    pub fn action(&self) -> RateLimitAction {
        self.action
    }

    #[must_use]
    pub fn client(&self) -> &str {
        &self.client
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RateLimitWindow {
    max_count: u32,
    duration: Duration,
}

impl RateLimitWindow {
    #[must_use]
    pub const fn new(max_count: u32, duration: Duration) -> Self {
        Self {
            max_count,
            duration,
        }
    }

    #[must_use]
    pub const fn per_hour(max_count: u32) -> Self {
        Self::new(max_count, Duration::from_secs(60 * 60))
    }

    #[must_use]
    pub const fn per_minute(max_count: u32) -> Self {
        Self::new(max_count, Duration::from_secs(60))
    }

    #[must_use]
    pub const fn max_count(&self) -> u32 {
        self.max_count
    }

    #[must_use]
    pub const fn duration(&self) -> Duration {
        self.duration
    }

    pub(crate) fn duration_seconds(self) -> u64 {
        self.duration.as_secs().max(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Rate limit exceeded: {max_count} attempts allowed, retry in {retry_after_seconds}s")]
pub struct LimitExceeded {
    pub max_count: u32,
    pub retry_after_seconds: u64,
}

impl LimitExceeded {
    /// Rejection used when the counter store cannot be consulted.
    #[must_use]
    pub fn fail_closed(window: RateLimitWindow) -> Self {
        Self {
            max_count: window.max_count,
            retry_after_seconds: window.duration_seconds(),
        }
    }
}

/// Increment-and-check capability shared by every rate-limited endpoint.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Record one attempt for `key` in the current bucket of `window`.
    ///
    /// # Errors
    /// Returns `LimitExceeded` when the attempt pushes the bucket over the limit.
    async fn performed(
        &self,
        key: &RateLimitKey,
        window: RateLimitWindow,
    ) -> Result<(), LimitExceeded>;
}

/// Run every window configured for `action`, stopping at the first one exceeded.
///
/// # Errors
/// Returns the `LimitExceeded` of the first window that rejected the attempt.
pub async fn check_action(
    limiter: &dyn RateLimiter,
    action: RateLimitAction,
    client: Option<&str>,
) -> Result<(), LimitExceeded> {
    let key = RateLimitKey::new(action, client.unwrap_or("unknown"));
    for window in action.windows() {
        if let Err(err) = limiter.performed(&key, *window).await {
            warn!(
                action = key.action().as_str(),
                client = key.client(),
                window_seconds = window.duration().as_secs(),
                "Rate limit exceeded"
            );
            return Err(err);
        }
    }
    Ok(())
}

#[derive(Clone, Debug)]
pub struct NoopRateLimiter;

#[async_trait]
impl RateLimiter for NoopRateLimiter {
    async fn performed(
        &self,
        _key: &RateLimitKey,
        _window: RateLimitWindow,
    ) -> Result<(), LimitExceeded> {
        Ok(())
    }
}

#[derive(Debug)]
struct Bucket {
    index: u64,
    count: u32,
}

/// Process-local limiter; counters are serialized behind a single mutex.
#[derive(Debug, Default)]
pub struct InMemoryRateLimiter {
    buckets: Mutex<HashMap<(RateLimitKey, u64), Bucket>>,
}

impl InMemoryRateLimiter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn performed_at(
        &self,
        key: &RateLimitKey,
        window: RateLimitWindow,
        now_unix: u64,
    ) -> Result<(), LimitExceeded> {
        let window_seconds = window.duration_seconds();
        let index = now_unix / window_seconds;

        let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
        if buckets.len() > SWEEP_THRESHOLD {
            buckets.retain(|(_, seconds), bucket| bucket.index == now_unix / seconds);
        }

        let bucket = buckets
            .entry((key.clone(), window_seconds))
            .or_insert(Bucket { index, count: 0 });
        if bucket.index != index {
            bucket.index = index;
            bucket.count = 0;
        }
        bucket.count = bucket.count.saturating_add(1);

        if bucket.count > window.max_count {
            return Err(LimitExceeded {
                max_count: window.max_count,
                retry_after_seconds: (index + 1) * window_seconds - now_unix,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RateLimiter for InMemoryRateLimiter {
    async fn performed(
        &self,
        key: &RateLimitKey,
        window: RateLimitWindow,
    ) -> Result<(), LimitExceeded> {
        let now_unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| elapsed.as_secs());
        self.performed_at(key, window, now_unix)
    }
}

/// Limiter pinned to a single instant, so tests never straddle a bucket edge.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct FrozenRateLimiter {
    inner: InMemoryRateLimiter,
}

#[cfg(test)]
#[async_trait]
impl RateLimiter for FrozenRateLimiter {
    async fn performed(
        &self,
        key: &RateLimitKey,
        window: RateLimitWindow,
    ) -> Result<(), LimitExceeded> {
        self.inner.performed_at(key, window, 1_700_000_040)
    }
}
