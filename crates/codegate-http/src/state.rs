//! HTTP application state: wraps `ServiceState` with HTTP-specific fields.
//!
//! `AppState` provides transparent access to all `ServiceState` methods
//! via `Deref`, and adds transport-specific config like CORS origins and
//! whether proxy headers are trusted.

use std::ops::Deref;
use std::sync::Arc;

use codegate_service::principal::PrincipalResolver;
use codegate_service::{Generators, ServiceState};

/// Shared HTTP application state, cloneable across handlers.
///
/// Wraps `ServiceState` (business logic) and adds HTTP-specific fields.
/// All `ServiceState` methods are available directly via `Deref`.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppInner>,
}

struct AppInner {
    service: ServiceState,
    cors_origins: Vec<String>,
    trust_forwarded_for: bool,
}

impl Deref for AppState {
    type Target = ServiceState;

    fn deref(&self) -> &ServiceState {
        &self.inner.service
    }
}

impl AppState {
    /// Creates a new HTTP application state.
    pub fn new(
        service: ServiceState,
        cors_origins: Vec<String>,
        trust_forwarded_for: bool,
    ) -> Self {
        Self {
            inner: Arc::new(AppInner {
                service,
                cors_origins,
                trust_forwarded_for,
            }),
        }
    }

    /// Creates an in-memory application state (for tests and ephemeral use).
    pub fn new_in_memory(principals: PrincipalResolver, generators: Generators) -> Self {
        Self::new(
            ServiceState::new_in_memory(principals, generators),
            vec![],
            false,
        )
    }

    /// Returns the configured CORS allowed origins.
    pub fn cors_origins(&self) -> &[String] {
        &self.inner.cors_origins
    }

    /// Whether `X-Forwarded-For` may name the guest origin.
    pub fn trust_forwarded_for(&self) -> bool {
        self.inner.trust_forwarded_for
    }

    /// Returns a reference to the underlying service state.
    pub fn service(&self) -> &ServiceState {
        &self.inner.service
    }
}
