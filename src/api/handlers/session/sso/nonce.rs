//! Pending SSO nonces.
//!
//! A nonce is issued when the browser is sent to the identity provider and is
//! consumed exactly once on the way back. `consume` is the single
//! check-and-expire step, so two callbacks racing on the same nonce cannot
//! both win. `postgres::PgNonceStore` shares nonces between instances.

use anyhow::{Context, Result};
use async_trait::async_trait;
use rand::{RngCore, rngs::OsRng};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

#[async_trait]
pub trait NonceStore: Send + Sync {
    /// Mint a nonce and remember where to send the browser afterwards.
    async fn issue(&self, return_path: &str) -> Result<String>;

    /// True while the nonce is known, unexpired and unconsumed.
    async fn is_pending(&self, nonce: &str) -> Result<bool>;

    /// Atomically expire the nonce, returning its stored return path.
    ///
    /// `Ok(None)` when the nonce was unknown, expired or already consumed.
    async fn consume(&self, nonce: &str) -> Result<Option<String>>;
}

/// 32 random bytes, hex encoded.
pub(crate) fn generate_nonce() -> Result<String> {
    let mut bytes = [0u8; 32];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("failed to generate SSO nonce")?;
    Ok(hex::encode(bytes))
}

#[derive(Debug)]
struct PendingNonce {
    return_path: String,
    issued_at: Instant,
}

#[derive(Debug)]
pub struct InMemoryNonceStore {
    ttl: Duration,
    pending: Mutex<HashMap<String, PendingNonce>>,
}

impl InMemoryNonceStore {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            pending: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl NonceStore for InMemoryNonceStore {
    async fn issue(&self, return_path: &str) -> Result<String> {
        let nonce = generate_nonce()?;

        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        pending.retain(|_, entry| entry.issued_at.elapsed() < self.ttl);
        pending.insert(
            nonce.clone(),
            PendingNonce {
                return_path: return_path.to_string(),
                issued_at: Instant::now(),
            },
        );
        Ok(nonce)
    }

    async fn is_pending(&self, nonce: &str) -> Result<bool> {
        let pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(pending
            .get(nonce)
            .is_some_and(|entry| entry.issued_at.elapsed() < self.ttl))
    }

    async fn consume(&self, nonce: &str) -> Result<Option<String>> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(entry) = pending.remove(nonce) else {
            return Ok(None);
        };
        Ok((entry.issued_at.elapsed() < self.ttl).then_some(entry.return_path))
    }
}
