//! Postgres-backed directory, session store, SSO nonces, rate-limit counters
//! and notification outbox.
//!
//! Every statement runs in a `db.query` span. Raw tokens never reach the
//! database; only their SHA-256 is stored. Nonces and counters live here so
//! that every gateway instance sharing the database sees the same state.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use sqlx::{PgPool, Row, postgres::PgPoolOptions, postgres::PgRow};
use std::time::Duration;
use tracing::{Instrument, error, info_span};
use uuid::Uuid;

use super::directory::{User, UserDirectory, suggest_username};
use super::notify::{Notification, Notifier};
use super::rate_limit::{LimitExceeded, RateLimitKey, RateLimitWindow, RateLimiter};
use super::sso::{NonceStore, SsoIdentity, generate_nonce};
use super::store::SessionStore;
use super::utils::{generate_token, hash_token, is_unique_violation};

const EMAIL_TOKEN_TTL_SECONDS: i64 = 24 * 60 * 60;
const MAX_USERNAME_SUFFIX: u32 = 100;

const USER_COLUMNS: &str = "users.id, users.username, users.name, users.email, \
    users.activation_email, users.password_hash, users.active, users.email_confirmed, \
    users.approved, users.admin, users.suspended, users.suspend_reason, users.suspended_till";

/// Connect the shared pool.
///
/// # Errors
/// Returns an error if the database is unreachable.
pub async fn connect(dsn: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .min_connections(1)
        .max_connections(5)
        .max_lifetime(Duration::from_secs(60 * 2))
        .test_before_acquire(true)
        .connect(dsn)
        .await
        .context("Failed to connect to database")
}

fn user_from_row(row: &PgRow) -> User {
    User {
        id: row.get("id"),
        username: row.get("username"),
        name: row.get("name"),
        email: row.get("email"),
        activation_email: row.get("activation_email"),
        password_hash: row.get("password_hash"),
        active: row.get("active"),
        email_confirmed: row.get("email_confirmed"),
        approved: row.get("approved"),
        admin: row.get("admin"),
        suspended: row.get("suspended"),
        suspend_reason: row.get("suspend_reason"),
        suspended_till: row.get("suspended_till"),
    }
}

#[derive(Clone, Debug)]
pub struct PgUserDirectory {
    pool: PgPool,
}

impl PgUserDirectory {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserDirectory for PgUserDirectory {
    async fn find_by_username_or_email(&self, login: &str) -> Result<Option<User>> {
        let query = format!(
            "SELECT {USER_COLUMNS} FROM users \
             WHERE LOWER(users.username) = LOWER($1) OR LOWER(users.email) = LOWER($1) \
             LIMIT 1"
        );
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query.as_str()
        );
        let row = sqlx::query(&query)
            .bind(login)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to lookup user by login")?;
        Ok(row.as_ref().map(user_from_row))
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>> {
        let query = format!("SELECT {USER_COLUMNS} FROM users WHERE users.id = $1");
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query.as_str()
        );
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to lookup user by id")?;
        Ok(row.as_ref().map(user_from_row))
    }

    async fn lookup_or_create_from_sso(&self, identity: &SsoIdentity) -> Result<Option<User>> {
        let mut tx = self.pool.begin().await.context("begin SSO transaction")?;

        let query = format!(
            "SELECT {USER_COLUMNS} FROM user_sso_identities \
             JOIN users ON users.id = user_sso_identities.user_id \
             WHERE user_sso_identities.external_id = $1"
        );
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query.as_str()
        );
        let linked = sqlx::query(&query)
            .bind(&identity.external_id)
            .fetch_optional(&mut *tx)
            .instrument(span)
            .await
            .context("failed to lookup SSO identity")?;
        if let Some(row) = linked {
            tx.commit().await.context("commit SSO transaction")?;
            return Ok(Some(user_from_row(&row)));
        }

        let Some(email) = identity.email.as_deref() else {
            return Ok(None);
        };

        let query = format!("SELECT {USER_COLUMNS} FROM users WHERE LOWER(users.email) = LOWER($1)");
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query.as_str()
        );
        let existing = sqlx::query(&query)
            .bind(email)
            .fetch_optional(&mut *tx)
            .instrument(span)
            .await
            .context("failed to lookup user by email")?;

        let user = if let Some(row) = existing {
            user_from_row(&row)
        } else {
            let Some(base) = suggest_username(identity) else {
                return Ok(None);
            };
            let username = free_username(&mut tx, &base).await?;

            let query = format!(
                "INSERT INTO users \
                    (username, name, email, active, email_confirmed, approved, admin) \
                 VALUES ($1, $2, $3, TRUE, TRUE, FALSE, $4) \
                 RETURNING {USER_COLUMNS}"
            );
            let span = info_span!(
                "db.query",
                db.system = "postgresql",
                db.operation = "INSERT",
                db.statement = query.as_str()
            );
            let row = sqlx::query(&query)
                .bind(&username)
                .bind(identity.name.as_deref())
                .bind(email)
                .bind(identity.admin)
                .fetch_one(&mut *tx)
                .instrument(span)
                .await
                .context("failed to create SSO user")?;
            user_from_row(&row)
        };

        let query = r"
            INSERT INTO user_sso_identities (external_id, user_id)
            VALUES ($1, $2)
            ON CONFLICT (external_id) DO NOTHING
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        sqlx::query(query)
            .bind(&identity.external_id)
            .bind(user.id)
            .execute(&mut *tx)
            .instrument(span)
            .await
            .context("failed to link SSO identity")?;

        tx.commit().await.context("commit SSO transaction")?;
        Ok(Some(user))
    }

    async fn invalidate_invites_for_email(&self, email: &str) -> Result<()> {
        let query = r"
            UPDATE invites
            SET invalidated_at = NOW()
            WHERE LOWER(email) = LOWER($1)
              AND invalidated_at IS NULL
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        sqlx::query(query)
            .bind(email)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to invalidate invites")?;
        Ok(())
    }

    async fn create_email_token(&self, user: &User) -> Result<String> {
        let query = r"
            INSERT INTO email_tokens (user_id, email, token_hash, expires_at)
            VALUES ($1, $2, $3, NOW() + ($4 * INTERVAL '1 second'))
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );

        for _ in 0..3 {
            let token = generate_token()?;
            let result = sqlx::query(query)
                .bind(user.id)
                .bind(&user.email)
                .bind(hash_token(&token))
                .bind(EMAIL_TOKEN_TTL_SECONDS)
                .execute(&self.pool)
                .instrument(span.clone())
                .await;

            match result {
                Ok(_) => return Ok(token),
                Err(err) if is_unique_violation(&err) => {}
                Err(err) => return Err(err).context("failed to insert email token"),
            }
        }

        Err(anyhow!("failed to generate unique email token"))
    }
}

async fn free_username(tx: &mut sqlx::Transaction<'_, sqlx::Postgres>, base: &str) -> Result<String> {
    let query = "SELECT 1 FROM users WHERE LOWER(username) = LOWER($1)";
    for suffix in 0..MAX_USERNAME_SUFFIX {
        let candidate = if suffix == 0 {
            base.to_string()
        } else {
            format!("{base}{suffix}")
        };
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let taken = sqlx::query(query)
            .bind(&candidate)
            .fetch_optional(&mut **tx)
            .instrument(span)
            .await
            .context("failed to check username")?
            .is_some();
        if !taken {
            return Ok(candidate);
        }
    }
    Err(anyhow!("no free username for `{base}`"))
}

/// Sessions keyed by token hash; `last_seen_at` drives the idle timeout.
#[derive(Clone, Debug)]
pub struct PgSessionStore {
    pool: PgPool,
    idle_ttl_seconds: i64,
}

impl PgSessionStore {
    #[must_use]
    pub fn new(pool: PgPool, idle_ttl_seconds: i64) -> Self {
        Self {
            pool,
            idle_ttl_seconds,
        }
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn create(&self, user_id: Uuid) -> Result<String> {
        let query = r"
            INSERT INTO user_sessions (user_id, session_hash)
            VALUES ($1, $2)
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );

        for _ in 0..3 {
            let token = generate_token()?;
            let result = sqlx::query(query)
                .bind(user_id)
                .bind(hash_token(&token))
                .execute(&self.pool)
                .instrument(span.clone())
                .await;

            match result {
                Ok(_) => return Ok(token),
                Err(err) if is_unique_violation(&err) => {}
                Err(err) => return Err(err).context("failed to insert session"),
            }
        }

        Err(anyhow!("failed to generate unique session token"))
    }

    async fn lookup(&self, token: &str) -> Result<Option<Uuid>> {
        // Expiry check and idle refresh happen in one statement.
        let query = r"
            UPDATE user_sessions
            SET last_seen_at = NOW()
            WHERE session_hash = $1
              AND last_seen_at > NOW() - ($2 * INTERVAL '1 second')
            RETURNING user_id
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(hash_token(token))
            .bind(self.idle_ttl_seconds)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to lookup session")?;
        Ok(row.map(|row| row.get("user_id")))
    }

    async fn destroy(&self, token: &str) -> Result<()> {
        let query = "DELETE FROM user_sessions WHERE session_hash = $1";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = query
        );
        sqlx::query(query)
            .bind(hash_token(token))
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to delete session")?;
        Ok(())
    }
}

/// Pending SSO nonces keyed by their hash; `consume` deletes the row.
#[derive(Clone, Debug)]
pub struct PgNonceStore {
    pool: PgPool,
    ttl_seconds: i64,
}

impl PgNonceStore {
    #[must_use]
    pub fn new(pool: PgPool, ttl: Duration) -> Self {
        Self {
            pool,
            ttl_seconds: i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX),
        }
    }
}

#[async_trait]
impl NonceStore for PgNonceStore {
    async fn issue(&self, return_path: &str) -> Result<String> {
        let query = "DELETE FROM sso_nonces WHERE expires_at <= NOW()";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = query
        );
        sqlx::query(query)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to sweep expired nonces")?;

        let nonce = generate_nonce()?;
        let query = r"
            INSERT INTO sso_nonces (nonce_hash, return_path, expires_at)
            VALUES ($1, $2, NOW() + ($3 * INTERVAL '1 second'))
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        sqlx::query(query)
            .bind(hash_token(&nonce))
            .bind(return_path)
            .bind(self.ttl_seconds)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to store nonce")?;
        Ok(nonce)
    }

    async fn is_pending(&self, nonce: &str) -> Result<bool> {
        let query = "SELECT 1 FROM sso_nonces WHERE nonce_hash = $1 AND expires_at > NOW()";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(hash_token(nonce))
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to lookup nonce")?;
        Ok(row.is_some())
    }

    async fn consume(&self, nonce: &str) -> Result<Option<String>> {
        // Only one concurrent DELETE can return the row.
        let query = r"
            DELETE FROM sso_nonces
            WHERE nonce_hash = $1
              AND expires_at > NOW()
            RETURNING return_path
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(hash_token(nonce))
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to consume nonce")?;
        Ok(row.map(|row| row.get("return_path")))
    }
}

/// Fixed-window counters shared by every instance; buckets are numbered on
/// the database clock.
#[derive(Clone, Debug)]
pub struct PgRateLimiter {
    pool: PgPool,
}

impl PgRateLimiter {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Bump the current bucket, returning the new count and the seconds left
    /// in the window.
    async fn increment(&self, key: &RateLimitKey, window_seconds: i64) -> Result<(i32, i64)> {
        // Older buckets of the same key are dropped on access.
        let query = r"
            DELETE FROM rate_limit_counters
            WHERE action = $1
              AND client = $2
              AND window_seconds = $3
              AND bucket < FLOOR(EXTRACT(EPOCH FROM NOW()) / $3)::BIGINT
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = query
        );
        sqlx::query(query)
            .bind(key.action().as_str())
            .bind(key.client())
            .bind(window_seconds)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to drop stale rate-limit buckets")?;

        let query = r"
            INSERT INTO rate_limit_counters (action, client, window_seconds, bucket, count)
            VALUES ($1, $2, $3, FLOOR(EXTRACT(EPOCH FROM NOW()) / $3)::BIGINT, 1)
            ON CONFLICT (action, client, window_seconds, bucket)
            DO UPDATE SET count = rate_limit_counters.count + 1
            RETURNING count,
                ((bucket + 1) * window_seconds - FLOOR(EXTRACT(EPOCH FROM NOW()))::BIGINT)
                    AS retry_after
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(key.action().as_str())
            .bind(key.client())
            .bind(window_seconds)
            .fetch_one(&self.pool)
            .instrument(span)
            .await
            .context("failed to increment rate-limit counter")?;
        Ok((row.get("count"), row.get("retry_after")))
    }
}

#[async_trait]
impl RateLimiter for PgRateLimiter {
    async fn performed(
        &self,
        key: &RateLimitKey,
        window: RateLimitWindow,
    ) -> Result<(), LimitExceeded> {
        let window_seconds = i64::try_from(window.duration_seconds()).unwrap_or(i64::MAX);
        let (count, retry_after) = match self.increment(key, window_seconds).await {
            Ok(result) => result,
            Err(err) => {
                // Fail closed.
                error!("Failed to record rate-limited attempt: {err:#}");
                return Err(LimitExceeded::fail_closed(window));
            }
        };

        if u32::try_from(count).unwrap_or(u32::MAX) > window.max_count() {
            return Err(LimitExceeded {
                max_count: window.max_count(),
                retry_after_seconds: u64::try_from(retry_after).unwrap_or(0).max(1),
            });
        }
        Ok(())
    }
}

/// Queues notifications as `pending` rows in `email_outbox`.
#[derive(Clone, Debug)]
pub struct PgOutboxNotifier {
    pool: PgPool,
}

impl PgOutboxNotifier {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Notifier for PgOutboxNotifier {
    async fn enqueue(&self, notification: Notification) -> Result<()> {
        let query = r"
            INSERT INTO email_outbox (to_email, template, payload_json)
            VALUES ($1, $2, $3::jsonb)
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        sqlx::query(query)
            .bind(notification.to_email())
            .bind(notification.template())
            .bind(notification.payload().to_string())
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to enqueue notification")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::handlers::session::rate_limit::RateLimitAction;

    const SCHEMA_SQL: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/sql/schema.sql"));

    /// Live database tests only run when `PORTICO_TEST_DSN` is set.
    async fn test_pool() -> Result<Option<PgPool>> {
        let Ok(dsn) = std::env::var("PORTICO_TEST_DSN") else {
            return Ok(None);
        };
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect(&dsn)
            .await
            .context("failed to connect test pool")?;
        sqlx::raw_sql(SCHEMA_SQL)
            .execute(&pool)
            .await
            .context("failed to apply schema")?;
        Ok(Some(pool))
    }

    #[tokio::test]
    async fn postgres_backends_round_trip() -> Result<()> {
        let Some(pool) = test_pool().await? else {
            return Ok(());
        };
        let suffix = Uuid::new_v4().simple().to_string();
        let email = format!("sso-{suffix}@example.com");

        // SSO provisioning creates an unapproved user, then reuses it.
        let directory = PgUserDirectory::new(pool.clone());
        let identity = SsoIdentity {
            external_id: format!("ext-{suffix}"),
            email: Some(email.clone()),
            username: Some(format!("sso{suffix}")),
            name: Some("Sso User".to_string()),
            admin: false,
        };
        let created = directory
            .lookup_or_create_from_sso(&identity)
            .await?
            .ok_or_else(|| anyhow!("SSO user not created"))?;
        assert!(!created.approved);
        assert!(created.is_activated());
        let again = directory.lookup_or_create_from_sso(&identity).await?;
        assert_eq!(again.map(|user| user.id), Some(created.id));

        let found = directory
            .find_by_username_or_email(&email.to_uppercase())
            .await?;
        assert_eq!(found.map(|user| user.id), Some(created.id));

        // Sessions.
        let sessions = PgSessionStore::new(pool.clone(), 60);
        let token = sessions.create(created.id).await?;
        assert_eq!(sessions.lookup(&token).await?, Some(created.id));
        sessions.destroy(&token).await?;
        assert_eq!(sessions.lookup(&token).await?, None);

        // Reset token and outbox row.
        let reset = directory.create_email_token(&created).await?;
        let stored: i64 = sqlx::query("SELECT COUNT(*) AS n FROM email_tokens WHERE token_hash = $1")
            .bind(hash_token(&reset))
            .fetch_one(&pool)
            .await?
            .get("n");
        assert_eq!(stored, 1);

        PgOutboxNotifier::new(pool.clone())
            .enqueue(Notification::ForgotPassword {
                user_id: created.id,
                to_email: email.clone(),
                token: reset,
            })
            .await?;
        let queued: i64 =
            sqlx::query("SELECT COUNT(*) AS n FROM email_outbox WHERE to_email = $1 AND template = 'forgot_password'")
                .bind(&email)
                .fetch_one(&pool)
                .await?
                .get("n");
        assert_eq!(queued, 1);
        Ok(())
    }

    #[tokio::test]
    async fn postgres_nonces_are_consumed_once() -> Result<()> {
        let Some(pool) = test_pool().await? else {
            return Ok(());
        };
        let store = PgNonceStore::new(pool.clone(), Duration::from_secs(60));
        let nonce = store.issue("/t/1").await?;
        assert!(store.is_pending(&nonce).await?);

        // Two instances racing on the same nonce.
        let other = PgNonceStore::new(pool.clone(), Duration::from_secs(60));
        let (first, second) = tokio::join!(store.consume(&nonce), other.consume(&nonce));
        let mut winners: Vec<String> = [first?, second?].into_iter().flatten().collect();
        assert_eq!(winners.pop().as_deref(), Some("/t/1"));
        assert!(winners.is_empty());
        assert!(!store.is_pending(&nonce).await?);

        let expired = PgNonceStore::new(pool, Duration::ZERO);
        let nonce = expired.issue("/").await?;
        assert_eq!(expired.consume(&nonce).await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn postgres_rate_limiter_counts_across_instances() -> Result<()> {
        let Some(pool) = test_pool().await? else {
            return Ok(());
        };
        let client = format!("test-{}", Uuid::new_v4().simple());
        let key = RateLimitKey::new(RateLimitAction::Login, &client);
        // An hour-long window keeps the test clear of bucket edges.
        let window = RateLimitWindow::per_hour(3);
        let first = PgRateLimiter::new(pool.clone());
        let second = PgRateLimiter::new(pool);

        assert!(first.performed(&key, window).await.is_ok());
        assert!(second.performed(&key, window).await.is_ok());
        assert!(first.performed(&key, window).await.is_ok());
        let err = second
            .performed(&key, window)
            .await
            .err()
            .ok_or_else(|| anyhow!("fourth attempt allowed"))?;
        assert_eq!(err.max_count, 3);
        assert!(err.retry_after_seconds <= 3600);
        Ok(())
    }
}
