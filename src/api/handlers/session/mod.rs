//! Session gateway: SSO handshake, local logins and session lifecycle.
//!
//! Request flow:
//! 1) CSRF verification for every non-safe method (`OPTIONS /session` passes
//!    through for the logout preflight).
//! 2) Rate limiting for login and forgot-password, per client address.
//! 3) Credential checks or the SSO nonce protocol.
//! 4) A session store mutation and the response.
//!
//! ## Rate limits
//!
//! | Action          | Windows (checked in order) |
//! |-----------------|----------------------------|
//! | login           | 30 per hour, 6 per minute  |
//! | forgot-password | 6 per hour, 3 per minute   |
//!
//! Rejected attempts still count toward the window.
//!
//! ## Storage
//!
//! The user directory, session store and notifier are trait objects. The
//! in-memory implementations are the defaults; `postgres` holds the
//! database-backed ones used when a DSN is configured.

pub(crate) mod cors;
pub(crate) mod credentials;
pub(crate) mod csrf;
pub(crate) mod current;
pub mod directory;
mod error;
pub(crate) mod login;
pub(crate) mod logout;
pub mod notify;
pub(crate) mod password;
pub mod postgres;
pub mod rate_limit;
pub(crate) mod sso;
mod state;
pub mod store;
pub(crate) mod types;
mod utils;

pub use credentials::CredentialAuthenticator;
pub use directory::{InMemoryUserDirectory, User, UserDirectory};
pub use error::SessionError;
pub use rate_limit::{InMemoryRateLimiter, NoopRateLimiter, RateLimiter};
pub use sso::{InMemoryNonceStore, NonceStore, SsoCodec, SsoError, SsoIdentity};
pub use state::{GatewayConfig, GatewayState};
