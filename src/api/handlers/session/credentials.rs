//! Local username/password authentication.
//!
//! Checks run in a fixed order and the first failure wins:
//! rate limits, required fields, password length, lookup, password,
//! approval, invite invalidation, suspension, activation.
//!
//! Unknown logins and wrong passwords produce the same error. Approval status
//! is the one account property revealed before the password is proven.

use once_cell::sync::Lazy;
use tracing::{debug, info};

use super::{
    directory::{User, hash_password},
    error::SessionError,
    rate_limit::{RateLimitAction, check_action},
    state::GatewayState,
    utils::normalize_login,
};

pub struct CredentialAuthenticator<'a> {
    state: &'a GatewayState,
}

impl<'a> CredentialAuthenticator<'a> {
    #[must_use]
    pub fn new(state: &'a GatewayState) -> Self {
        Self { state }
    }

    /// Authenticate a login attempt from `client`.
    ///
    /// # Errors
    /// Returns the `SessionError` of the first failing check.
    pub async fn authenticate(
        &self,
        client: Option<&str>,
        login: Option<&str>,
        password: Option<&str>,
    ) -> Result<User, SessionError> {
        let config = self.state.config();
        if !config.allow_local_auth() {
            return Err(SessionError::LocalAuthDisabled);
        }

        check_action(self.state.rate_limiter(), RateLimitAction::Login, client)
            .await
            .map_err(SessionError::RateLimited)?;

        let login = required(login, "login")?;
        let password = required(password, "password")?;

        if password.chars().count() > config.max_password_length() {
            debug!("Password exceeds maximum length");
            return Err(SessionError::InvalidCredentials);
        }

        let login = normalize_login(login);
        let Some(user) = self
            .state
            .directory()
            .find_by_username_or_email(login)
            .await?
        else {
            // Unknown logins pay the same hashing cost as wrong passwords.
            let _ = self
                .state
                .verifier()
                .confirm_password(&decoy_user(), password);
            return Err(SessionError::InvalidCredentials);
        };

        if !self.state.verifier().confirm_password(&user, password) {
            return Err(SessionError::InvalidCredentials);
        }

        if config.must_approve_users() && !user.approved && !user.admin {
            return Err(SessionError::NotApproved);
        }

        // A password login retires any outstanding invite links.
        self.state
            .directory()
            .invalidate_invites_for_email(&user.email)
            .await?;

        if user.suspended {
            info!(user_id = %user.id, "Login refused for suspended user");
            return Err(SessionError::Suspended {
                reason: user.suspend_reason.clone(),
                until: user.suspended_till,
            });
        }

        if !user.is_activated() {
            return Err(SessionError::NotActivated {
                sent_to_email: user.sent_to_email().to_string(),
                current_email: user.email.clone(),
            });
        }

        Ok(user)
    }
}

static DECOY_PASSWORD_HASH: Lazy<Option<String>> =
    Lazy::new(|| hash_password("portico-decoy-password").ok());

/// Account verified against when the login matches nobody.
fn decoy_user() -> User {
    let mut user = User::new("", "");
    user.password_hash = DECOY_PASSWORD_HASH.clone();
    user
}

fn required<'v>(value: Option<&'v str>, field: &'static str) -> Result<&'v str, SessionError> {
    match value {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(SessionError::MalformedRequest(field)),
    }
}
