//! Outbound notification abstraction.
//!
//! The gateway only enqueues; delivery belongs to whatever consumes the queue.
//! `LogNotifier` is the development default, `PgOutboxNotifier` (see `postgres`)
//! writes rows into `email_outbox`.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Mutex;
use tracing::info;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Notification {
    ForgotPassword {
        user_id: Uuid,
        to_email: String,
        token: String,
    },
}

impl Notification {
    #[must_use]
    pub fn template(&self) -> &'static str {
        match self {
            Self::ForgotPassword { .. } => "forgot_password",
        }
    }

    #[must_use]
    pub fn to_email(&self) -> &str {
        match self {
            Self::ForgotPassword { to_email, .. } => to_email,
        }
    }

    #[must_use]
    pub fn user_id(&self) -> Uuid {
        match self {
            Self::ForgotPassword { user_id, .. } => *user_id,
        }
    }

    /// Template variables handed to the mailer.
    #[must_use]
    pub fn payload(&self) -> serde_json::Value {
        match self {
            Self::ForgotPassword { token, .. } => json!({ "email_token": token }),
        }
    }
}

/// Single-attempt enqueue; errors bubble up as a generic failure.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn enqueue(&self, notification: Notification) -> Result<()>;
}

/// Local dev notifier that logs the template instead of queueing mail.
#[derive(Clone, Debug)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn enqueue(&self, notification: Notification) -> Result<()> {
        // Tokens stay out of the log; only the routing fields are recorded.
        info!(
            user_id = %notification.user_id(),
            to_email = %notification.to_email(),
            template = notification.template(),
            "notification enqueue stub"
        );
        Ok(())
    }
}

/// Keeps every enqueued notification in memory.
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl MemoryNotifier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn sent(&self) -> Vec<Notification> {
        self.sent
            .lock()
            .map(|sent| sent.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn enqueue(&self, notification: Notification) -> Result<()> {
        self.sent
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(notification);
        Ok(())
    }
}
