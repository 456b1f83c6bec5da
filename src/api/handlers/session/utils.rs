//! Small helpers for token handling, cookies and request inspection.

use anyhow::{Context, Result};
use axum::{
    extract::{ConnectInfo, FromRequestParts},
    http::{HeaderMap, header::COOKIE, request::Parts},
};
use base64::Engine;
use rand::{RngCore, rngs::OsRng};
use sha2::{Digest, Sha256};
use std::{convert::Infallible, net::SocketAddr};

/// Create a random URL-safe token (sessions, CSRF, password resets).
pub(super) fn generate_token() -> Result<String> {
    let mut bytes = [0u8; 32];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("failed to generate random token")?;
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes))
}

/// Hash a token so raw values never touch storage.
pub(super) fn hash_token(token: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.finalize().to_vec()
}

/// Strip whitespace and a single leading `@` from a login identifier.
pub(super) fn normalize_login(login: &str) -> &str {
    let trimmed = login.trim();
    trimmed.strip_prefix('@').unwrap_or(trimmed)
}

/// Only local paths are accepted as post-login redirect targets.
pub(super) fn local_return_path(path: Option<&str>) -> String {
    match path.map(str::trim) {
        Some(path) if path.starts_with('/') && !path.starts_with("//") && !path.contains('\\') => {
            path.to_string()
        }
        _ => "/".to_string(),
    }
}

/// Read a cookie value by name from the `Cookie` header.
pub(super) fn extract_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    for header in headers.get_all(COOKIE) {
        let Ok(value) = header.to_str() else {
            continue;
        };
        for pair in value.split(';') {
            let mut parts = pair.trim().splitn(2, '=');
            let (Some(key), Some(val)) = (parts.next(), parts.next()) else {
                continue;
            };
            if key.trim() == name && !val.trim().is_empty() {
                return Some(val.trim().to_string());
            }
        }
    }
    None
}

/// Socket address of the connected peer, when the server records it.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct PeerAddr(pub(super) Option<SocketAddr>);

impl<S: Send + Sync> FromRequestParts<S> for PeerAddr {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(
            parts
                .extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| *addr),
        ))
    }
}

/// Client identity for rate limiting.
///
/// Proxy headers are only believed when the deployment sits behind a proxy
/// that overwrites them; otherwise the peer address is the identity.
pub(super) fn client_ip(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    trust_proxy_headers: bool,
) -> Option<String> {
    if trust_proxy_headers && let Some(forwarded) = forwarded_client_ip(headers) {
        return Some(forwarded);
    }
    peer.map(|addr| addr.ip().to_string())
}

/// Client IP as reported by `X-Forwarded-For` or `X-Real-IP`.
fn forwarded_client_ip(headers: &HeaderMap) -> Option<String> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty());
    if forwarded.is_some() {
        return forwarded.map(str::to_string);
    }
    headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

pub(super) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| code.as_ref() == "23505"),
        _ => false,
    }
}
