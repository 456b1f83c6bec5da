//! SSO handshake endpoints.
//!
//! Flow Overview:
//! 1) `GET /session/sso` mints a nonce, remembers the local return path and
//!    redirects to the identity provider with a signed `nonce`/`return_sso_url`.
//! 2) The provider sends the browser back to `GET /session/sso_login` with its
//!    own signed payload carrying the nonce and identity claims.
//! 3) The nonce is checked and consumed in one step, then the identity is
//!    resolved to a local user and a session is created, unless the deployment
//!    requires approval and the user is still pending. Pending users are
//!    redirected without a session.

mod codec;
mod nonce;

pub use codec::{SsoCodec, SsoError, SsoIdentity, SsoPayload};
pub(crate) use nonce::generate_nonce;
pub use nonce::{InMemoryNonceStore, NonceStore};

use anyhow::anyhow;
use axum::{
    extract::{Extension, Query, RawQuery},
    http::{
        HeaderMap, HeaderValue, StatusCode,
        header::{LOCATION, SET_COOKIE},
    },
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::{error, info, instrument};

use super::{
    error::SessionError,
    state::GatewayState,
    store::session_cookie,
    types::SsoInitiateQuery,
    utils::local_return_path,
};

#[utoipa::path(
    get,
    path = "/session/sso",
    params(SsoInitiateQuery),
    responses(
        (status = 302, description = "Redirect to the identity provider"),
        (status = 404, description = "SSO is not enabled")
    ),
    tag = "session"
)]
pub async fn sso(
    state: Extension<Arc<GatewayState>>,
    Query(query): Query<SsoInitiateQuery>,
) -> Response {
    match initiate(&state, query.return_path.as_deref()).await {
        Ok(location) => found(&location, None),
        Err(err) => err.into_response(),
    }
}

async fn initiate(state: &GatewayState, return_path: Option<&str>) -> Result<String, SessionError> {
    let config = state.config();
    if !config.enable_sso() {
        return Err(SessionError::SsoDisabled);
    }
    let provider_url = config
        .sso_url()
        .ok_or_else(|| anyhow!("SSO is enabled without a provider URL"))?;
    let codec = SsoCodec::new(config.sso_secret()).map_err(anyhow::Error::from)?;

    let nonce = state
        .nonces()
        .issue(&local_return_path(return_path))
        .await?;
    let return_sso_url = format!("{}/session/sso_login", config.base_url());
    let location = codec
        .generate_url(provider_url, &nonce, &return_sso_url)
        .map_err(anyhow::Error::from)?;
    Ok(location)
}

#[utoipa::path(
    get,
    path = "/session/sso_login",
    params(
        ("sso" = String, Query, description = "Base64 payload signed by the identity provider"),
        ("sig" = String, Query, description = "Hex HMAC-SHA256 of `sso`")
    ),
    responses(
        (status = 302, description = "Redirect to the stored return path"),
        (status = 400, description = "Payload failed verification", body = String),
        (status = 404, description = "SSO is not enabled"),
        (status = 500, description = "Nonce expired or user could not be resolved", body = String)
    ),
    tag = "session"
)]
#[instrument(skip_all)]
pub async fn sso_login(state: Extension<Arc<GatewayState>>, RawQuery(query): RawQuery) -> Response {
    match complete(&state, query.as_deref().unwrap_or_default()).await {
        Ok((return_path, token)) => {
            let cookie = match token.map(|token| session_cookie(state.config(), &token)) {
                Some(Ok(cookie)) => Some(cookie),
                Some(Err(err)) => {
                    error!("Failed to build session cookie: {err}");
                    return StatusCode::INTERNAL_SERVER_ERROR.into_response();
                }
                None => None,
            };
            found(&return_path, cookie)
        }
        Err(err) => err.into_response(),
    }
}

/// Run the callback state machine, returning where to send the browser and
/// the new session token when one was established.
async fn complete(
    state: &GatewayState,
    query: &str,
) -> Result<(String, Option<String>), SessionError> {
    let config = state.config();
    if !config.enable_sso() {
        return Err(SessionError::SsoDisabled);
    }
    let codec = SsoCodec::new(config.sso_secret()).map_err(anyhow::Error::from)?;
    let payload = codec.parse(query)?;

    if !payload.nonce_valid(state.nonces()).await? {
        return Err(SessionError::NonceInvalidOrExpired);
    }
    // Expire before resolving the user so a failed lookup cannot be replayed.
    let Some(return_path) = payload.expire_nonce(state.nonces()).await? else {
        return Err(SessionError::NonceInvalidOrExpired);
    };

    let Some(user) = payload.lookup_or_create_user(state.directory()).await? else {
        return Err(SessionError::UserResolutionFailed);
    };

    if config.must_approve_users() && !user.approved {
        info!(user_id = %user.id, "SSO user awaiting approval, no session created");
        return Ok((return_path, None));
    }

    let token = state.sessions().create(user.id).await?;
    info!(user_id = %user.id, "SSO login");
    Ok((return_path, Some(token)))
}

/// `302 Found` with an optional session cookie.
fn found(location: &str, cookie: Option<HeaderValue>) -> Response {
    let mut headers = HeaderMap::new();
    let location = HeaderValue::from_str(location).unwrap_or_else(|_| HeaderValue::from_static("/"));
    headers.insert(LOCATION, location);
    if let Some(cookie) = cookie {
        headers.insert(SET_COOKIE, cookie);
    }
    (StatusCode::FOUND, headers).into_response()
}
