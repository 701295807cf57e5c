//! Service-layer error types.
//!
//! `ServiceError` is transport-agnostic. The HTTP crate maps it to status
//! codes and JSON bodies.

use crate::ledger::LedgerError;
use crate::policy::ResourceClass;

/// Service error shared across transports.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// Malformed input. No ledger was touched.
    #[error("{0}")]
    BadRequest(String),

    /// The action needs an authenticated principal. No ledger was touched.
    #[error("authentication required")]
    Unauthorized,

    /// A quota check failed. Raised before any generator is invoked.
    #[error("{resource_class} quota exceeded, retry in {retry_after_secs}s")]
    QuotaExceeded {
        resource_class: ResourceClass,
        retry_after_secs: u64,
    },

    /// The generator failed to start or failed before its first fragment.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// The generator failed after the response was committed. Only ever
    /// observed by the caller as a truncated body.
    #[error("stream interrupted: {0}")]
    StreamInterrupted(String),

    /// A counter store round trip failed.
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }
}
