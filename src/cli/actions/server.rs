use crate::{
    api::{
        self,
        handlers::session::{
            GatewayConfig, GatewayState,
            postgres::{
                self, PgNonceStore, PgOutboxNotifier, PgRateLimiter, PgSessionStore,
                PgUserDirectory,
            },
        },
    },
    cli::telemetry,
};
use anyhow::Result;
use secrecy::SecretString;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub dsn: Option<String>,
    pub base_url: String,
    pub enable_sso: bool,
    pub enable_local_logins: bool,
    pub must_approve_users: bool,
    pub session_ttl_seconds: i64,
    pub max_password_length: usize,
    pub sso_url: Option<String>,
    pub sso_secret: Option<SecretString>,
    pub sso_nonce_ttl_seconds: u64,
    pub trust_proxy_headers: bool,
}

impl Args {
    fn gateway_config(&self) -> GatewayConfig {
        let mut config = GatewayConfig::new(self.base_url.clone())
            .with_enable_sso(self.enable_sso)
            .with_enable_local_logins(self.enable_local_logins)
            .with_must_approve_users(self.must_approve_users)
            .with_session_ttl_seconds(self.session_ttl_seconds)
            .with_max_password_length(self.max_password_length)
            .with_nonce_ttl_seconds(self.sso_nonce_ttl_seconds)
            .with_trust_proxy_headers(self.trust_proxy_headers);
        if let Some(url) = &self.sso_url {
            config = config.with_sso_url(url.clone());
        }
        if let Some(secret) = &self.sso_secret {
            config = config.with_sso_secret(secret.clone());
        }
        config
    }
}

/// Execute the server action.
/// # Errors
/// Returns an error if the database is unreachable or the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    let config = args.gateway_config();
    info!(
        base_url = config.base_url(),
        sso = config.enable_sso(),
        local_logins = config.allow_local_auth(),
        must_approve_users = config.must_approve_users(),
        trust_proxy_headers = config.trust_proxy_headers(),
        "Gateway configuration loaded"
    );

    let nonce_ttl = config.nonce_ttl();
    let mut state = GatewayState::new(config);
    if let Some(dsn) = &args.dsn {
        let pool = postgres::connect(dsn).await?;
        state = state
            .with_nonces(Arc::new(PgNonceStore::new(pool.clone(), nonce_ttl)))
            .with_rate_limiter(Arc::new(PgRateLimiter::new(pool.clone())))
            .with_directory(Arc::new(PgUserDirectory::new(pool.clone())))
            .with_sessions(Arc::new(PgSessionStore::new(
                pool.clone(),
                args.session_ttl_seconds,
            )))
            .with_notifier(Arc::new(PgOutboxNotifier::new(pool)));
    } else {
        warn!(
            "No --dsn given, users, sessions, nonces and rate limits are kept in this process"
        );
    }

    let result = api::new(args.port, Arc::new(state)).await;

    telemetry::shutdown_tracer();

    result
}
