//! Error taxonomy of the session endpoints and its HTTP translation.
//!
//! Credential-class failures answer `200` with `{error, reason}` so client UIs
//! can branch on `reason`; only `NotApproved` reveals that an account exists.

use axum::{
    Json,
    http::{HeaderMap, HeaderValue, StatusCode, header::RETRY_AFTER},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use tracing::{error, warn};

use super::rate_limit::LimitExceeded;
use super::sso::SsoError;
use super::types::ErrorResponse;

pub(super) const INVALID_CREDENTIALS: &str = "Incorrect username, email or password";
pub(super) const NOT_APPROVED: &str = "Your account hasn't been approved yet. You will be notified by email when you are ready to log in.";
pub(super) const NOT_ACTIVATED: &str = "You can't log in yet. We previously sent an activation email to you. Please follow the instructions in that email to activate your account.";
pub(super) const SLOW_DOWN: &str =
    "You have performed this action too many times, try again later.";
pub(super) const NONCE_EXPIRED: &str = "Timeout expired, please try logging in again.";
pub(super) const UNABLE_TO_LOG_ON: &str = "unable to log on user";
pub(super) const INVALID_SSO_PAYLOAD: &str = "Invalid SSO payload";

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("SSO is not enabled")]
    SsoDisabled,
    #[error("local logins are not enabled")]
    LocalAuthDisabled,
    /// Login attempts over the limit.
    #[error(transparent)]
    RateLimited(LimitExceeded),
    /// Forgot-password attempts over the limit.
    #[error("slow down")]
    SlowDown,
    #[error("missing required parameter `{0}`")]
    MalformedRequest(&'static str),
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("account not approved")]
    NotApproved,
    #[error("account suspended")]
    Suspended {
        reason: Option<String>,
        until: Option<DateTime<Utc>>,
    },
    #[error("account not activated")]
    NotActivated {
        sent_to_email: String,
        current_email: String,
    },
    #[error("invalid SSO payload: {0}")]
    InvalidSsoPayload(#[from] SsoError),
    #[error("SSO nonce invalid or expired")]
    NonceInvalidOrExpired,
    #[error("SSO identity could not be resolved")]
    UserResolutionFailed,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl SessionError {
    /// Stable identifier for client UIs.
    #[must_use]
    pub fn reason(&self) -> Option<&'static str> {
        match self {
            Self::MalformedRequest(_) => Some("malformed_request"),
            Self::InvalidCredentials => Some("invalid_credentials"),
            Self::NotApproved => Some("not_approved"),
            Self::Suspended { .. } => Some("suspended"),
            Self::NotActivated { .. } => Some("not_activated"),
            Self::RateLimited(_) => Some("rate_limited"),
            _ => None,
        }
    }

    /// User-facing message; internals are never included.
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Self::MalformedRequest(field) => format!("param is missing or the value is empty: {field}"),
            Self::InvalidCredentials => INVALID_CREDENTIALS.to_string(),
            Self::NotApproved => NOT_APPROVED.to_string(),
            Self::Suspended { reason, until } => suspended_message(reason.as_deref(), *until),
            Self::NotActivated { .. } => NOT_ACTIVATED.to_string(),
            Self::RateLimited(_) | Self::SlowDown => SLOW_DOWN.to_string(),
            Self::InvalidSsoPayload(_) => INVALID_SSO_PAYLOAD.to_string(),
            Self::NonceInvalidOrExpired => NONCE_EXPIRED.to_string(),
            Self::UserResolutionFailed => UNABLE_TO_LOG_ON.to_string(),
            Self::SsoDisabled | Self::LocalAuthDisabled | Self::Internal(_) => String::new(),
        }
    }

    fn body(&self) -> ErrorResponse {
        let (sent_to_email, current_email) = match self {
            Self::NotActivated {
                sent_to_email,
                current_email,
            } => (Some(sent_to_email.clone()), Some(current_email.clone())),
            _ => (None, None),
        };
        ErrorResponse {
            error: self.message(),
            reason: self.reason().map(str::to_string),
            sent_to_email,
            current_email,
        }
    }
}

fn suspended_message(reason: Option<&str>, until: Option<DateTime<Utc>>) -> String {
    let date = until.map(|until| until.format("%B %-d, %Y").to_string());
    match (reason, date) {
        (Some(reason), Some(date)) => format!("Account suspended until {date}: {reason}"),
        (None, Some(date)) => format!("You can't log in until {date}."),
        (Some(reason), None) => format!("Account suspended: {reason}"),
        (None, None) => "Your account is suspended.".to_string(),
    }
}

impl IntoResponse for SessionError {
    fn into_response(self) -> Response {
        match &self {
            Self::SsoDisabled => StatusCode::NOT_FOUND.into_response(),
            Self::LocalAuthDisabled => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
            Self::Internal(err) => {
                error!("Session request failed: {err:#}");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
            Self::InvalidSsoPayload(err) => {
                warn!("Rejected SSO payload: {err}");
                (StatusCode::BAD_REQUEST, self.message()).into_response()
            }
            Self::NonceInvalidOrExpired | Self::UserResolutionFailed => {
                (StatusCode::INTERNAL_SERVER_ERROR, self.message()).into_response()
            }
            Self::RateLimited(limit) => {
                let mut headers = HeaderMap::new();
                headers.insert(RETRY_AFTER, HeaderValue::from(limit.retry_after_seconds));
                (StatusCode::TOO_MANY_REQUESTS, headers, Json(self.body())).into_response()
            }
            Self::SlowDown => {
                (StatusCode::UNPROCESSABLE_ENTITY, Json(self.body())).into_response()
            }
            Self::MalformedRequest(_) => (StatusCode::BAD_REQUEST, Json(self.body())).into_response(),
            Self::InvalidCredentials
            | Self::NotApproved
            | Self::Suspended { .. }
            | Self::NotActivated { .. } => (StatusCode::OK, Json(self.body())).into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use chrono::TimeZone;

    async fn body_json(response: Response) -> anyhow::Result<serde_json::Value> {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    #[test]
    fn suspended_message_variants() -> anyhow::Result<()> {
        let until = Utc
            .with_ymd_and_hms(2025, 1, 1, 0, 0, 0)
            .single()
            .ok_or_else(|| anyhow!("invalid date"))?;

        let message = suspended_message(Some("spam"), Some(until));
        assert!(message.contains("January 1, 2025"));
        assert!(message.contains("spam"));

        assert_eq!(
            suspended_message(None, Some(until)),
            "You can't log in until January 1, 2025."
        );
        assert_eq!(suspended_message(Some("spam"), None), "Account suspended: spam");
        assert_eq!(suspended_message(None, None), "Your account is suspended.");
        Ok(())
    }

    #[test]
    fn every_credential_branch_has_a_distinct_reason() {
        let errors = [
            SessionError::MalformedRequest("login"),
            SessionError::InvalidCredentials,
            SessionError::NotApproved,
            SessionError::Suspended {
                reason: None,
                until: None,
            },
            SessionError::NotActivated {
                sent_to_email: String::new(),
                current_email: String::new(),
            },
        ];
        let mut reasons: Vec<_> = errors.iter().filter_map(SessionError::reason).collect();
        reasons.sort_unstable();
        reasons.dedup();
        assert_eq!(reasons.len(), errors.len());
    }

    #[tokio::test]
    async fn not_activated_payload_carries_both_emails() -> anyhow::Result<()> {
        let response = SessionError::NotActivated {
            sent_to_email: "old@example.com".to_string(),
            current_email: "new@example.com".to_string(),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await?;
        assert_eq!(body["reason"], "not_activated");
        assert_eq!(body["sent_to_email"], "old@example.com");
        assert_eq!(body["current_email"], "new@example.com");
        Ok(())
    }

    #[tokio::test]
    async fn rate_limited_sets_retry_after() -> anyhow::Result<()> {
        let response = SessionError::RateLimited(LimitExceeded {
            max_count: 6,
            retry_after_seconds: 42,
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get(RETRY_AFTER),
            Some(&HeaderValue::from_static("42"))
        );
        let body = body_json(response).await?;
        assert_eq!(body["reason"], "rate_limited");
        Ok(())
    }

    #[tokio::test]
    async fn internal_errors_hide_details() -> anyhow::Result<()> {
        let response = SessionError::Internal(anyhow!("connection refused")).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await?;
        assert!(bytes.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn disabled_features_have_empty_bodies() -> anyhow::Result<()> {
        let response = SessionError::SsoDisabled.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let response = SessionError::LocalAuthDisabled.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await?;
        assert!(bytes.is_empty());
        Ok(())
    }
}
