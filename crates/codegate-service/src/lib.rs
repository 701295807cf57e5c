//! Codegate Service: core logic for the quota-gated streaming gateway.
//!
//! This crate contains all transport-agnostic logic: principal resolution,
//! window policy, the volatile and durable ledgers, the quota gate, the
//! generator adapter and providers, the stream relay, and metrics.
//!
//! The transport crate (`codegate-http`) depends on this crate and provides
//! the HTTP adapter.
//!
//! **Zero transport dependencies**: no axum, no wire-protocol code.

pub mod clock;
pub mod error;
pub mod gate;
pub mod gateway;
pub mod generator;
pub mod ledger;
pub mod metrics;
pub mod policy;
pub mod principal;
pub mod relay;

use std::sync::Arc;
use std::time::{Duration, Instant};

use clock::{Clock, SystemClock};
use gate::QuotaGate;
use generator::{
    AssistantProvider, CompletionProvider, ConversionProvider, GeminiClient, GeminiConfig,
    GenerationError, Generator,
};
use ledger::{
    DurableLedger, LedgerError, MemoryDurableLedger, MemoryVolatileLedger, VolatileLedger,
};
use metrics::Metrics;
use policy::{Action, WindowPolicy};
use principal::PrincipalResolver;
use relay::StreamRelay;

/// Configuration subset relevant to the service layer.
///
/// Transport-specific config (ports, CORS origins) stays in the binary
/// crate's `Config` struct.
#[derive(Debug, Clone, Default)]
pub struct ServiceConfig {
    pub policy: WindowPolicy,
    /// `None` leaves streams unbounded.
    pub max_stream_duration: Option<Duration>,
}

/// Ledger handles, connected once at startup and shared by every request.
#[derive(Clone)]
pub struct Ledgers {
    pub volatile: Arc<dyn VolatileLedger>,
    pub durable: Arc<dyn DurableLedger>,
}

impl Ledgers {
    /// Process-local ledgers driven by `clock`.
    pub fn in_memory(clock: Arc<dyn Clock>) -> Self {
        Self {
            volatile: Arc::new(MemoryVolatileLedger::new(clock)),
            durable: Arc::new(MemoryDurableLedger::new()),
        }
    }
}

/// One generator per streamed action.
#[derive(Clone)]
pub struct Generators {
    pub assistant: Arc<dyn Generator>,
    pub completion: Arc<dyn Generator>,
    pub conversion: Arc<dyn Generator>,
}

impl Generators {
    /// The three Gemini providers over one shared client.
    pub fn gemini(config: GeminiConfig) -> Result<Self, GenerationError> {
        let client = Arc::new(GeminiClient::new(config)?);
        if !client.is_configured() {
            tracing::warn!("No Gemini API key configured, generation requests will fail");
        }
        Ok(Self {
            assistant: Arc::new(AssistantProvider::new(Arc::clone(&client))),
            completion: Arc::new(CompletionProvider::new(Arc::clone(&client))),
            conversion: Arc::new(ConversionProvider::new(client)),
        })
    }

    /// The same generator for every action.
    pub fn uniform(generator: Arc<dyn Generator>) -> Self {
        Self {
            assistant: Arc::clone(&generator),
            completion: Arc::clone(&generator),
            conversion: generator,
        }
    }

    /// `None` for actions that only consult the gate.
    pub fn for_action(&self, action: Action) -> Option<&Arc<dyn Generator>> {
        match action {
            Action::AiAssistant => Some(&self.assistant),
            Action::CodeSuggestion => Some(&self.completion),
            Action::CodeConversion => Some(&self.conversion),
            Action::FileCreation => None,
        }
    }
}

/// Shared service state, cloneable across all transport handlers.
///
/// Wraps all business-layer components in an `Arc`. Transport crates
/// receive this and delegate all logic to it.
#[derive(Clone)]
pub struct ServiceState {
    inner: Arc<Inner>,
}

struct Inner {
    gate: QuotaGate,
    principals: PrincipalResolver,
    generators: Generators,
    relay: StreamRelay,
    metrics: Arc<Metrics>,
    start_time: Instant,
}

impl ServiceState {
    /// Creates a new service state on the system clock.
    pub fn new(
        config: ServiceConfig,
        ledgers: Ledgers,
        principals: PrincipalResolver,
        generators: Generators,
    ) -> Self {
        Self::with_clock(config, ledgers, principals, generators, Arc::new(SystemClock))
    }

    /// Creates a service state whose durable periods follow `clock`.
    pub fn with_clock(
        config: ServiceConfig,
        ledgers: Ledgers,
        principals: PrincipalResolver,
        generators: Generators,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let metrics = Arc::new(Metrics::new());
        Self {
            inner: Arc::new(Inner {
                gate: QuotaGate::new(
                    Arc::new(config.policy),
                    ledgers.volatile,
                    ledgers.durable,
                    clock,
                ),
                principals,
                generators,
                relay: StreamRelay::new(config.max_stream_duration, Arc::clone(&metrics)),
                metrics,
                start_time: Instant::now(),
            }),
        }
    }

    /// Creates an in-memory state with the default policy (for tests and
    /// ephemeral use).
    pub fn new_in_memory(principals: PrincipalResolver, generators: Generators) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        Self::with_clock(
            ServiceConfig::default(),
            Ledgers::in_memory(Arc::clone(&clock)),
            principals,
            generators,
            clock,
        )
    }

    // --- Accessors ---

    pub fn gate(&self) -> &QuotaGate {
        &self.inner.gate
    }

    pub fn principals(&self) -> &PrincipalResolver {
        &self.inner.principals
    }

    pub fn generators(&self) -> &Generators {
        &self.inner.generators
    }

    pub fn relay(&self) -> &StreamRelay {
        &self.inner.relay
    }

    pub fn metrics(&self) -> &Metrics {
        &self.inner.metrics
    }

    pub fn policy(&self) -> &WindowPolicy {
        self.inner.gate.policy()
    }

    pub fn volatile_backend(&self) -> &'static str {
        self.inner.gate.volatile().backend()
    }

    pub fn durable_backend(&self) -> &'static str {
        self.inner.gate.durable().backend()
    }

    pub fn uptime_secs(&self) -> u64 {
        self.inner.start_time.elapsed().as_secs()
    }

    // --- Maintenance ---

    /// Drops expired volatile counters. Returns count removed.
    pub async fn cleanup_expired_counters(&self) -> usize {
        self.inner.gate.volatile().cleanup().await
    }

    /// Flushes and closes the ledger handles.
    pub async fn shutdown(&self) -> Result<(), LedgerError> {
        self.inner.gate.volatile().shutdown().await?;
        self.inner.gate.durable().shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::generator::ScriptedGenerator;
    use crate::principal::Principal;

    #[tokio::test]
    async fn cleanup_sweeps_expired_counters() {
        let clock = Arc::new(ManualClock::new(0));
        let state = ServiceState::with_clock(
            ServiceConfig::default(),
            Ledgers::in_memory(clock.clone()),
            PrincipalResolver::default(),
            Generators::uniform(Arc::new(ScriptedGenerator::default())),
            clock.clone(),
        );
        gateway::GatewayService::admit(&state, &Principal::authenticated("a"), Action::FileCreation)
            .await
            .unwrap();
        let guest = Principal::guest(None);
        state
            .gate()
            .admit(&guest, Action::CodeSuggestion)
            .await
            .unwrap();

        clock.advance(61);
        assert_eq!(state.cleanup_expired_counters().await, 1);
        state.shutdown().await.unwrap();
    }

    #[test]
    fn in_memory_state_reports_memory_backends() {
        let state = ServiceState::new_in_memory(
            PrincipalResolver::default(),
            Generators::uniform(Arc::new(ScriptedGenerator::default())),
        );
        assert_eq!(state.volatile_backend(), "memory");
        assert_eq!(state.durable_backend(), "memory");
    }

    #[test]
    fn file_creation_has_no_generator() {
        let generators = Generators::uniform(Arc::new(ScriptedGenerator::default()));
        assert!(generators.for_action(Action::FileCreation).is_none());
        assert!(generators.for_action(Action::CodeConversion).is_some());
    }
}
