//! `DELETE /session`: end the session.
//!
//! The session cookie and the CSRF cookie are both cleared, and the response
//! carries the CORS headers so a cross-origin caller can read the outcome.

use axum::{
    extract::Extension,
    http::{HeaderMap, StatusCode, header::SET_COOKIE},
    response::IntoResponse,
};
use std::sync::Arc;
use tracing::{error, instrument};

use super::{
    cors::cors_headers,
    csrf::clear_csrf_cookie,
    state::GatewayState,
    store::{clear_session_cookie, extract_session_token},
};

#[utoipa::path(
    delete,
    path = "/session",
    params(
        ("X-CSRF-Token" = String, Header, description = "Token from GET /session/csrf")
    ),
    responses(
        (status = 200, description = "Session cleared"),
        (status = 403, description = "CSRF verification failed", body = String)
    ),
    tag = "session"
)]
#[instrument(skip_all)]
pub async fn destroy(headers: HeaderMap, state: Extension<Arc<GatewayState>>) -> impl IntoResponse {
    if let Some(token) = extract_session_token(&headers) {
        if let Err(err) = state.sessions().destroy(&token).await {
            error!("Failed to destroy session: {err:#}");
        }
    }

    // Cookies are cleared even when no session record existed.
    let mut response_headers = cors_headers();
    match clear_session_cookie(state.config()) {
        Ok(cookie) => {
            response_headers.append(SET_COOKIE, cookie);
        }
        Err(err) => error!("Failed to build session cookie: {err}"),
    }
    match clear_csrf_cookie(state.config()) {
        Ok(cookie) => {
            response_headers.append(SET_COOKIE, cookie);
        }
        Err(err) => error!("Failed to build CSRF cookie: {err}"),
    }
    (StatusCode::OK, response_headers)
}
