//! Gateway configuration and the shared state handed to every handler.

use secrecy::{ExposeSecret, SecretString};
use std::sync::Arc;
use std::time::Duration;

use super::directory::{Argon2Verifier, InMemoryUserDirectory, PasswordVerifier, UserDirectory};
use super::notify::{LogNotifier, Notifier};
use super::rate_limit::{InMemoryRateLimiter, RateLimiter};
use super::sso::{InMemoryNonceStore, NonceStore};
use super::store::{InMemorySessionStore, SessionStore};

const DEFAULT_SESSION_TTL_SECONDS: i64 = 120 * 60;
const DEFAULT_MAX_PASSWORD_LENGTH: usize = 200;
const DEFAULT_NONCE_TTL_SECONDS: u64 = 10 * 60;

#[derive(Clone, Debug)]
pub struct GatewayConfig {
    base_url: String,
    enable_sso: bool,
    enable_local_logins: bool,
    must_approve_users: bool,
    session_ttl_seconds: i64,
    max_password_length: usize,
    sso_url: Option<String>,
    sso_secret: SecretString,
    nonce_ttl_seconds: u64,
    trust_proxy_headers: bool,
}

impl GatewayConfig {
    /// Local logins on, SSO off, no approval required.
    #[must_use]
    pub fn new(base_url: String) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            enable_sso: false,
            enable_local_logins: true,
            must_approve_users: false,
            session_ttl_seconds: DEFAULT_SESSION_TTL_SECONDS,
            max_password_length: DEFAULT_MAX_PASSWORD_LENGTH,
            sso_url: None,
            sso_secret: SecretString::from(String::new()),
            nonce_ttl_seconds: DEFAULT_NONCE_TTL_SECONDS,
            trust_proxy_headers: false,
        }
    }

    #[must_use]
    pub fn with_enable_sso(mut self, enabled: bool) -> Self {
        self.enable_sso = enabled;
        self
    }

    #[must_use]
    pub fn with_enable_local_logins(mut self, enabled: bool) -> Self {
        self.enable_local_logins = enabled;
        self
    }

    #[must_use]
    pub fn with_must_approve_users(mut self, required: bool) -> Self {
        self.must_approve_users = required;
        self
    }

    #[must_use]
    pub fn with_session_ttl_seconds(mut self, seconds: i64) -> Self {
        self.session_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_max_password_length(mut self, length: usize) -> Self {
        self.max_password_length = length;
        self
    }

    #[must_use]
    pub fn with_sso_url(mut self, url: String) -> Self {
        self.sso_url = Some(url);
        self
    }

    #[must_use]
    pub fn with_sso_secret(mut self, secret: SecretString) -> Self {
        self.sso_secret = secret;
        self
    }

    #[must_use]
    pub fn with_nonce_ttl_seconds(mut self, seconds: u64) -> Self {
        self.nonce_ttl_seconds = seconds;
        self
    }

    /// Take the client address from `X-Forwarded-For`/`X-Real-IP` instead of
    /// the peer. Only safe behind a proxy that overwrites those headers.
    #[must_use]
    pub fn with_trust_proxy_headers(mut self, trusted: bool) -> Self {
        self.trust_proxy_headers = trusted;
        self
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    #[must_use]
    pub fn enable_sso(&self) -> bool {
        self.enable_sso
    }

    #[must_use]
    pub fn must_approve_users(&self) -> bool {
        self.must_approve_users
    }

    /// Local credentials are only accepted on deployments without SSO.
    #[must_use]
    pub fn allow_local_auth(&self) -> bool {
        !self.enable_sso && self.enable_local_logins
    }

    #[must_use]
    pub fn session_ttl_seconds(&self) -> i64 {
        self.session_ttl_seconds
    }

    #[must_use]
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(u64::try_from(self.session_ttl_seconds).unwrap_or(0))
    }

    #[must_use]
    pub fn max_password_length(&self) -> usize {
        self.max_password_length
    }

    #[must_use]
    pub fn sso_url(&self) -> Option<&str> {
        self.sso_url.as_deref()
    }

    pub(super) fn sso_secret(&self) -> &str {
        self.sso_secret.expose_secret()
    }

    #[must_use]
    pub fn nonce_ttl(&self) -> Duration {
        Duration::from_secs(self.nonce_ttl_seconds)
    }

    #[must_use]
    pub fn trust_proxy_headers(&self) -> bool {
        self.trust_proxy_headers
    }

    pub(super) fn session_cookie_secure(&self) -> bool {
        self.base_url.starts_with("https://")
    }
}

/// Collaborators shared by the session endpoints.
///
/// Defaults are process-local; `actions::server` swaps in the Postgres
/// implementations when a DSN is configured.
pub struct GatewayState {
    config: GatewayConfig,
    rate_limiter: Arc<dyn RateLimiter>,
    directory: Arc<dyn UserDirectory>,
    sessions: Arc<dyn SessionStore>,
    nonces: Arc<dyn NonceStore>,
    notifier: Arc<dyn Notifier>,
    verifier: Arc<dyn PasswordVerifier>,
}

impl GatewayState {
    #[must_use]
    pub fn new(config: GatewayConfig) -> Self {
        let sessions = InMemorySessionStore::new(config.session_ttl());
        let nonces = InMemoryNonceStore::new(config.nonce_ttl());
        Self {
            config,
            rate_limiter: Arc::new(InMemoryRateLimiter::new()),
            directory: Arc::new(InMemoryUserDirectory::new()),
            sessions: Arc::new(sessions),
            nonces: Arc::new(nonces),
            notifier: Arc::new(LogNotifier),
            verifier: Arc::new(Argon2Verifier),
        }
    }

    #[must_use]
    pub fn with_rate_limiter(mut self, rate_limiter: Arc<dyn RateLimiter>) -> Self {
        self.rate_limiter = rate_limiter;
        self
    }

    #[must_use]
    pub fn with_directory(mut self, directory: Arc<dyn UserDirectory>) -> Self {
        self.directory = directory;
        self
    }

    #[must_use]
    pub fn with_sessions(mut self, sessions: Arc<dyn SessionStore>) -> Self {
        self.sessions = sessions;
        self
    }

    #[must_use]
    pub fn with_nonces(mut self, nonces: Arc<dyn NonceStore>) -> Self {
        self.nonces = nonces;
        self
    }

    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    #[must_use]
    pub fn with_verifier(mut self, verifier: Arc<dyn PasswordVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    #[must_use]
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub(super) fn rate_limiter(&self) -> &dyn RateLimiter {
        self.rate_limiter.as_ref()
    }

    pub(super) fn directory(&self) -> &dyn UserDirectory {
        self.directory.as_ref()
    }

    pub(super) fn sessions(&self) -> &dyn SessionStore {
        self.sessions.as_ref()
    }

    pub(super) fn nonces(&self) -> &dyn NonceStore {
        self.nonces.as_ref()
    }

    pub(super) fn notifier(&self) -> &dyn Notifier {
        self.notifier.as_ref()
    }

    pub(super) fn verifier(&self) -> &dyn PasswordVerifier {
        self.verifier.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_config_defaults_and_overrides() {
        let config = GatewayConfig::new("https://forum.example.com/".to_string());
        assert_eq!(config.base_url(), "https://forum.example.com");
        assert!(config.allow_local_auth());
        assert!(!config.must_approve_users());
        assert_eq!(config.session_ttl(), Duration::from_secs(7200));
        assert_eq!(config.max_password_length(), 200);
        assert_eq!(config.nonce_ttl(), Duration::from_secs(600));
        assert!(config.session_cookie_secure());
        assert!(!config.trust_proxy_headers());

        let config = config
            .with_must_approve_users(true)
            .with_session_ttl_seconds(60)
            .with_max_password_length(8)
            .with_sso_url("https://idp.example.com/sso".to_string())
            .with_sso_secret(SecretString::from("shared".to_string()))
            .with_trust_proxy_headers(true);
        assert!(config.trust_proxy_headers());
        assert!(config.must_approve_users());
        assert_eq!(config.session_ttl_seconds(), 60);
        assert_eq!(config.max_password_length(), 8);
        assert_eq!(config.sso_url(), Some("https://idp.example.com/sso"));
        assert_eq!(config.sso_secret(), "shared");
    }

    #[test]
    fn local_auth_requires_sso_off_and_local_logins_on() {
        let base = GatewayConfig::new("http://localhost".to_string());
        assert!(base.clone().allow_local_auth());
        assert!(!base.clone().with_enable_sso(true).allow_local_auth());
        assert!(
            !base
                .clone()
                .with_enable_local_logins(false)
                .allow_local_auth()
        );
        assert!(!base.session_cookie_secure());
    }

    #[test]
    fn negative_session_ttl_clamps_to_zero() {
        let config = GatewayConfig::new("http://localhost".to_string()).with_session_ttl_seconds(-5);
        assert_eq!(config.session_ttl(), Duration::ZERO);
    }
}
