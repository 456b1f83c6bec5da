//! `POST /session`: local login.

use axum::{
    Form, Json,
    extract::{Extension, rejection::FormRejection},
    http::{HeaderMap, StatusCode, header::SET_COOKIE},
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::{debug, error, info, instrument};

use super::{
    credentials::CredentialAuthenticator,
    error::SessionError,
    state::GatewayState,
    store::session_cookie,
    types::{ErrorResponse, LoginRequest, UserResponse},
    utils::{PeerAddr, client_ip},
};

#[utoipa::path(
    post,
    path = "/session",
    request_body(content = LoginRequest, content_type = "application/x-www-form-urlencoded"),
    params(
        ("X-CSRF-Token" = String, Header, description = "Token from GET /session/csrf")
    ),
    responses(
        (status = 200, description = "Logged in, or a credential error with `reason`", body = UserResponse),
        (status = 400, description = "Missing login or password", body = ErrorResponse),
        (status = 403, description = "CSRF verification failed", body = String),
        (status = 429, description = "Rate limited", body = ErrorResponse),
        (status = 500, description = "Local logins are disabled")
    ),
    tag = "session"
)]
#[instrument(skip_all)]
pub async fn create(
    headers: HeaderMap,
    PeerAddr(peer): PeerAddr,
    state: Extension<Arc<GatewayState>>,
    form: Result<Form<LoginRequest>, FormRejection>,
) -> Response {
    // An unreadable body is handled like one without fields.
    let request = form.map(|Form(request)| request).unwrap_or_else(|rejection| {
        debug!("Unreadable login form: {rejection}");
        LoginRequest::default()
    });

    let client = client_ip(&headers, peer, state.config().trust_proxy_headers());
    let user = match CredentialAuthenticator::new(&state)
        .authenticate(
            client.as_deref(),
            request.login.as_deref(),
            request.password.as_deref(),
        )
        .await
    {
        Ok(user) => user,
        Err(err) => return err.into_response(),
    };

    let token = match state.sessions().create(user.id).await {
        Ok(token) => token,
        Err(err) => return SessionError::Internal(err).into_response(),
    };
    let mut response_headers = HeaderMap::new();
    match session_cookie(state.config(), &token) {
        Ok(cookie) => {
            response_headers.insert(SET_COOKIE, cookie);
        }
        Err(err) => {
            error!("Failed to build session cookie: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    }

    info!(user_id = %user.id, "Local login");
    (
        StatusCode::OK,
        response_headers,
        Json(UserResponse::from(&user)),
    )
        .into_response()
}
