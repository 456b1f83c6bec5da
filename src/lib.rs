//! # Portico (Session Authentication Gateway)
//!
//! `portico` authenticates browser sessions for a web application, either through
//! a delegated Single Sign-On handshake or with local username/password
//! credentials, and manages the lifecycle of the resulting session cookie.
//!
//! ## Authentication paths
//!
//! - **SSO:** the gateway redirects to a trusted identity provider with a signed,
//!   nonce-bearing payload. The provider answers with its own signed payload; the
//!   nonce is consumed exactly once, so assertions cannot be replayed.
//! - **Local logins:** credentials are checked against the user directory in a
//!   fixed order (rate limits, input, lookup, password, approval, suspension,
//!   activation). Wrong logins and wrong passwords are indistinguishable to the
//!   client.
//!
//! ## Abuse protection
//!
//! Login and forgot-password requests are rate limited per client address with
//! hourly and per-minute windows. Mutating requests require a CSRF token
//! (double-submit cookie). The logout endpoint answers CORS preflights so other
//! origins of the same deployment can end a session.

pub mod api;
pub mod cli;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};
