//! Anti-forgery tokens (double-submit cookie).
//!
//! `GET /session/csrf` hands out a token and stores the same value in the
//! `portico_csrf` cookie. Mutating requests must echo it in `X-CSRF-Token`;
//! the two are compared in constant time.

use axum::{
    Json,
    body::Body,
    extract::{Extension, Request},
    http::{
        HeaderMap, HeaderValue, Method, StatusCode,
        header::{InvalidHeaderValue, SET_COOKIE},
    },
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{error, warn};

use super::{
    state::{GatewayConfig, GatewayState},
    store::cookie_attributes,
    types::CsrfResponse,
    utils::{extract_cookie, generate_token},
};

pub(super) const CSRF_COOKIE_NAME: &str = "portico_csrf";
pub const CSRF_HEADER_NAME: &str = "x-csrf-token";

#[utoipa::path(
    get,
    path = "/session/csrf",
    responses(
        (status = 200, description = "Anti-forgery token issued", body = CsrfResponse)
    ),
    tag = "session"
)]
pub async fn csrf(headers: HeaderMap, state: Extension<Arc<GatewayState>>) -> Response {
    // An existing cookie token is reused.
    let token = match extract_cookie(&headers, CSRF_COOKIE_NAME) {
        Some(token) => token,
        None => match generate_token() {
            Ok(token) => token,
            Err(err) => {
                error!("Failed to generate CSRF token: {err}");
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
        },
    };

    let mut response_headers = HeaderMap::new();
    match csrf_cookie(state.config(), &token) {
        Ok(cookie) => {
            response_headers.insert(SET_COOKIE, cookie);
        }
        Err(err) => {
            error!("Failed to build CSRF cookie: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    }
    (
        StatusCode::OK,
        response_headers,
        Json(CsrfResponse { csrf: token }),
    )
        .into_response()
}

fn csrf_cookie(config: &GatewayConfig, token: &str) -> Result<HeaderValue, InvalidHeaderValue> {
    let attributes = cookie_attributes(config);
    HeaderValue::from_str(&format!(
        "{CSRF_COOKIE_NAME}={token}; Path=/; HttpOnly; {attributes}"
    ))
}

pub(super) fn clear_csrf_cookie(config: &GatewayConfig) -> Result<HeaderValue, InvalidHeaderValue> {
    let attributes = cookie_attributes(config);
    HeaderValue::from_str(&format!(
        "{CSRF_COOKIE_NAME}=; Path=/; HttpOnly; {attributes}; Max-Age=0"
    ))
}

fn token_matches(headers: &HeaderMap) -> bool {
    let Some(expected) = extract_cookie(headers, CSRF_COOKIE_NAME) else {
        return false;
    };
    let Some(presented) = headers
        .get(CSRF_HEADER_NAME)
        .and_then(|value| value.to_str().ok())
    else {
        return false;
    };
    expected.as_bytes().ct_eq(presented.trim().as_bytes()).into()
}

/// Reject non-safe requests whose `X-CSRF-Token` does not match the cookie.
///
/// `OPTIONS` is a safe method here, which is what lets the logout preflight
/// through without a token.
pub async fn verify_authenticity_token(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    if matches!(method, Method::GET | Method::HEAD | Method::OPTIONS) {
        return next.run(request).await;
    }
    if token_matches(request.headers()) {
        return next.run(request).await;
    }
    warn!(
        method = %method,
        path = %request.uri().path(),
        "CSRF verification failed"
    );
    (StatusCode::FORBIDDEN, "BAD CSRF").into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header::COOKIE;

    fn headers(cookie: Option<&'static str>, token: Option<&'static str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(cookie) = cookie {
            headers.insert(COOKIE, HeaderValue::from_static(cookie));
        }
        if let Some(token) = token {
            headers.insert(CSRF_HEADER_NAME, HeaderValue::from_static(token));
        }
        headers
    }

    #[test]
    fn token_must_match_cookie() {
        assert!(token_matches(&headers(Some("portico_csrf=abc"), Some("abc"))));
        assert!(!token_matches(&headers(Some("portico_csrf=abc"), Some("abd"))));
        assert!(!token_matches(&headers(Some("portico_csrf=abc"), Some("abcd"))));
        assert!(!token_matches(&headers(None, Some("abc"))));
        assert!(!token_matches(&headers(Some("portico_csrf=abc"), None)));
    }

    #[test]
    fn csrf_cookie_is_a_browser_session_cookie() -> anyhow::Result<()> {
        let config = GatewayConfig::new("https://forum.example.com".to_string());
        let cookie = csrf_cookie(&config, "abc")?;
        let cookie = cookie.to_str()?;
        assert!(cookie.starts_with("portico_csrf=abc;"));
        assert!(!cookie.contains("Max-Age"));

        let cleared = clear_csrf_cookie(&config)?;
        assert!(cleared.to_str()?.contains("Max-Age=0"));
        Ok(())
    }
}
