//! `GET /session/current`.

use axum::{
    Json,
    extract::Extension,
    http::{HeaderMap, StatusCode, header::SET_COOKIE},
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::error;

use super::{
    directory::User,
    state::GatewayState,
    store::{extract_session_token, session_cookie},
    types::CurrentUserResponse,
};

#[utoipa::path(
    get,
    path = "/session/current",
    responses(
        (status = 200, description = "Current user; the session cookie is re-issued with a fresh Max-Age", body = CurrentUserResponse),
        (status = 404, description = "No active session")
    ),
    tag = "session"
)]
pub async fn current(headers: HeaderMap, state: Extension<Arc<GatewayState>>) -> Response {
    match current_user(&headers, &state).await {
        Ok(Some((user, token))) => {
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
            (
                StatusCode::OK,
                response_headers,
                Json(CurrentUserResponse::from(&user)),
            )
                .into_response()
        }
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(err) => {
            error!("Failed to resolve current session: {err:#}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Resolve the session cookie to a user and its token; `Ok(None)` when not
/// logged in. The lookup itself refreshes the idle timer.
async fn current_user(
    headers: &HeaderMap,
    state: &GatewayState,
) -> anyhow::Result<Option<(User, String)>> {
    let Some(token) = extract_session_token(headers) else {
        return Ok(None);
    };
    let Some(user_id) = state.sessions().lookup(&token).await? else {
        return Ok(None);
    };
    let user = state.directory().find_by_id(user_id).await?;
    Ok(user.map(|user| (user, token)))
}
