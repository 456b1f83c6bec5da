//! `POST /session/forgot_password`.
//!
//! The response is `{result: "ok"}` whether or not the account exists; only an
//! existing account gets a reset token and a queued notification.

use axum::{
    Form, Json,
    extract::{Extension, rejection::FormRejection},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::{debug, info, instrument};

use super::{
    error::SessionError,
    notify::Notification,
    rate_limit::{RateLimitAction, check_action},
    state::GatewayState,
    types::{ErrorResponse, ForgotPasswordRequest, ForgotPasswordResponse},
    utils::{PeerAddr, client_ip, normalize_login},
};

#[utoipa::path(
    post,
    path = "/session/forgot_password",
    request_body(content = ForgotPasswordRequest, content_type = "application/x-www-form-urlencoded"),
    params(
        ("X-CSRF-Token" = String, Header, description = "Token from GET /session/csrf")
    ),
    responses(
        (status = 200, description = "Request accepted", body = ForgotPasswordResponse),
        (status = 400, description = "Missing login", body = ErrorResponse),
        (status = 403, description = "CSRF verification failed", body = String),
        (status = 422, description = "Rate limited", body = ErrorResponse),
        (status = 500, description = "Local logins are disabled")
    ),
    tag = "session"
)]
#[instrument(skip_all)]
pub async fn forgot_password(
    headers: HeaderMap,
    PeerAddr(peer): PeerAddr,
    state: Extension<Arc<GatewayState>>,
    form: Result<Form<ForgotPasswordRequest>, FormRejection>,
) -> Response {
    let request = form.map(|Form(request)| request).unwrap_or_else(|rejection| {
        debug!("Unreadable forgot-password form: {rejection}");
        ForgotPasswordRequest::default()
    });
    let client = client_ip(&headers, peer, state.config().trust_proxy_headers());

    match request_reset(&state, client.as_deref(), request.login.as_deref()).await {
        Ok(()) => (
            StatusCode::OK,
            Json(ForgotPasswordResponse {
                result: "ok".to_string(),
            }),
        )
            .into_response(),
        Err(err) => err.into_response(),
    }
}

async fn request_reset(
    state: &GatewayState,
    client: Option<&str>,
    login: Option<&str>,
) -> Result<(), SessionError> {
    let login = match login {
        Some(login) if !login.trim().is_empty() => normalize_login(login),
        _ => return Err(SessionError::MalformedRequest("login")),
    };
    if !state.config().allow_local_auth() {
        return Err(SessionError::LocalAuthDisabled);
    }
    check_action(state.rate_limiter(), RateLimitAction::ForgotPassword, client)
        .await
        .map_err(|_| SessionError::SlowDown)?;

    let Some(user) = state.directory().find_by_username_or_email(login).await? else {
        debug!("Password reset requested for unknown login");
        return Ok(());
    };

    let token = state.directory().create_email_token(&user).await?;
    state
        .notifier()
        .enqueue(Notification::ForgotPassword {
            user_id: user.id,
            to_email: user.email.clone(),
            token,
        })
        .await?;
    info!(user_id = %user.id, "Password reset requested");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::handlers::session::{
        directory::{InMemoryUserDirectory, User},
        notify::MemoryNotifier,
        rate_limit::FrozenRateLimiter,
        state::GatewayConfig,
    };

    async fn state_with(
        config: GatewayConfig,
    ) -> (GatewayState, Arc<InMemoryUserDirectory>, Arc<MemoryNotifier>) {
        let directory = Arc::new(InMemoryUserDirectory::new());
        directory.insert(User::new("bob", "bob@example.com")).await;
        let notifier = Arc::new(MemoryNotifier::new());
        let state = GatewayState::new(config)
            .with_directory(directory.clone())
            .with_notifier(notifier.clone())
            .with_rate_limiter(Arc::new(FrozenRateLimiter::default()));
        (state, directory, notifier)
    }

    fn config() -> GatewayConfig {
        GatewayConfig::new("http://localhost:3000".to_string())
    }

    #[tokio::test]
    async fn only_existing_accounts_get_a_token() -> anyhow::Result<()> {
        let (state, directory, notifier) = state_with(config()).await;

        request_reset(&state, Some("10.0.0.1"), Some("nobody")).await?;
        assert!(notifier.sent().is_empty());

        request_reset(&state, Some("10.0.0.1"), Some("@bob")).await?;
        let sent = notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to_email(), "bob@example.com");

        let tokens = directory.email_tokens().await;
        assert_eq!(tokens.len(), 1);
        assert_eq!(
            sent[0],
            Notification::ForgotPassword {
                user_id: tokens[0].user_id,
                to_email: "bob@example.com".to_string(),
                token: tokens[0].token.clone(),
            }
        );
        Ok(())
    }

    #[tokio::test]
    async fn missing_login_is_checked_before_disabled() {
        let (state, _, _) = state_with(config().with_enable_sso(true)).await;
        assert!(matches!(
            request_reset(&state, None, None).await,
            Err(SessionError::MalformedRequest("login"))
        ));
        assert!(matches!(
            request_reset(&state, None, Some("bob")).await,
            Err(SessionError::LocalAuthDisabled)
        ));
    }

    #[tokio::test]
    async fn fourth_request_in_a_minute_slows_down() -> anyhow::Result<()> {
        let (state, _, notifier) = state_with(config()).await;
        for _ in 0..3 {
            request_reset(&state, Some("10.0.0.2"), Some("bob")).await?;
        }
        assert!(matches!(
            request_reset(&state, Some("10.0.0.2"), Some("bob")).await,
            Err(SessionError::SlowDown)
        ));
        assert_eq!(notifier.sent().len(), 3);
        Ok(())
    }
}
