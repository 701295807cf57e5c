//! Codegate Server: quota-gated streaming gateway for AI code assistance.
//!
//! Thin binary crate composing the pieces:
//! - `codegate-service`: principals, window policy, ledgers, quota gate,
//!   generators and the stream relay
//! - `codegate-http`: REST API via axum (includes Swagger UI)
//!
//! This crate only adds configuration and startup wiring.

pub mod config;

pub use codegate_http::{AppState, router, serve};
pub use codegate_service::ServiceState;
