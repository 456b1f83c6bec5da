//! API handlers for the gateway.
//!
//! `session` holds the authentication endpoints and their collaborators;
//! `health` reports build metadata for load balancers and deploy checks.

pub mod health;
pub mod session;
