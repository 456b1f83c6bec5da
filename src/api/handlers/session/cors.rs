//! CORS handling for the logout endpoint only.
//!
//! Other origins of the same deployment end a session with a cross-origin
//! `DELETE /session`. The browser first sends an `OPTIONS` preflight, which is
//! answered here without touching the session or the CSRF check.

use axum::{
    http::{
        HeaderMap, HeaderValue, StatusCode,
        header::{
            ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
            ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_MAX_AGE, CONTENT_TYPE,
        },
    },
    response::IntoResponse,
};

const ALLOW_ORIGIN: &str = "*";
const ALLOW_METHODS: &str = "POST, GET, OPTIONS";
const ALLOW_HEADERS: &str = "X-Requested-With, X-Prototype-Version, X-CSRF-Token";
const MAX_AGE_SECONDS: &str = "1728000";

/// Headers attached to the logout response itself.
pub(super) fn cors_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static(ALLOW_ORIGIN),
    );
    headers.insert(
        ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static(ALLOW_METHODS),
    );
    headers.insert(
        ACCESS_CONTROL_MAX_AGE,
        HeaderValue::from_static(MAX_AGE_SECONDS),
    );
    headers
}

/// `OPTIONS /session`: empty `text/plain` with the preflight headers.
pub async fn preflight() -> impl IntoResponse {
    let mut headers = cors_headers();
    headers.insert(
        ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static(ALLOW_HEADERS),
    );
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    (StatusCode::OK, headers, "")
}
