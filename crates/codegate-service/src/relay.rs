//! Stream relay: pumps generator fragments to the caller.
//!
//! The relay waits for the first event before anything is committed, so a
//! generator that fails up front still gets a proper error response. Once
//! the first fragment is out the status is fixed; a later upstream failure
//! can only end the body early.

use std::sync::Arc;
use std::time::Duration;

use futures_util::Stream;
use tokio::time::Instant;

use crate::error::ServiceError;
use crate::generator::{CancelHandle, FragmentSequence, StreamEvent};
use crate::metrics::{Metrics, RelayOutcome};
use crate::policy::Action;

/// Relays fragment sequences, optionally bounded in duration.
#[derive(Clone)]
pub struct StreamRelay {
    max_duration: Option<Duration>,
    metrics: Arc<Metrics>,
}

impl StreamRelay {
    /// `max_duration` of `None` leaves streams unbounded.
    pub fn new(max_duration: Option<Duration>, metrics: Arc<Metrics>) -> Self {
        Self {
            max_duration,
            metrics,
        }
    }

    pub fn max_duration(&self) -> Option<Duration> {
        self.max_duration
    }

    /// Pulls the first event from `seq`.
    ///
    /// An upstream error (or the deadline passing) before any fragment is
    /// returned as [`ServiceError::UpstreamUnavailable`].
    pub async fn open(
        &self,
        mut seq: FragmentSequence,
        action: Action,
    ) -> Result<RelayStream, ServiceError> {
        let deadline = self.max_duration.map(|d| Instant::now() + d);
        // Armed before the first pull: the caller may go away while we wait.
        let mut guard = CancelOnDrop {
            handle: seq.cancel_handle(),
            metrics: Arc::clone(&self.metrics),
            action,
            armed: true,
        };

        let first = match pull(&mut seq, deadline).await {
            Some(event) => event,
            None => {
                guard.disarm();
                seq.cancel();
                self.metrics.record_upstream_failure();
                tracing::warn!(%action, "Generator produced nothing before the deadline");
                return Err(ServiceError::UpstreamUnavailable(
                    "generator timed out before producing output".to_string(),
                ));
            }
        };

        let first = match first {
            StreamEvent::Fragment(text) => Some(text),
            StreamEvent::Done => None,
            StreamEvent::Error(reason) => {
                guard.disarm();
                self.metrics.record_upstream_failure();
                tracing::error!(%action, %reason, "Generator failed before first fragment");
                return Err(ServiceError::UpstreamUnavailable(reason));
            }
        };

        Ok(RelayStream {
            finished: first.is_none(),
            first,
            seq,
            deadline,
            action,
            guard,
        })
    }
}

/// `None` when the deadline passed first.
async fn pull(seq: &mut FragmentSequence, deadline: Option<Instant>) -> Option<StreamEvent> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, seq.next_event()).await.ok(),
        None => Some(seq.next_event().await),
    }
}

/// An admitted stream whose first event has been pulled.
pub struct RelayStream {
    first: Option<String>,
    finished: bool,
    seq: FragmentSequence,
    deadline: Option<Instant>,
    action: Action,
    guard: CancelOnDrop,
}

impl RelayStream {
    /// True when the generator ended without producing anything.
    pub fn is_empty(&self) -> bool {
        self.finished
    }

    /// Converts into a fragment stream for the transport.
    ///
    /// Fragments are yielded in generator order, one item per fragment. An
    /// `Err` item means the body must be cut short. Dropping the stream
    /// before it ends cancels the generator exactly once.
    pub fn into_stream(self) -> impl Stream<Item = Result<String, ServiceError>> + Send + 'static {
        let Self {
            first,
            finished,
            mut seq,
            deadline,
            action,
            guard,
        } = self;

        async_stream::stream! {
            let mut guard = guard;
            if let Some(text) = first {
                yield Ok(text);
            }
            if finished {
                guard.finish(RelayOutcome::Completed);
                return;
            }

            loop {
                let Some(event) = pull(&mut seq, deadline).await else {
                    seq.cancel();
                    guard.finish(RelayOutcome::Cancelled);
                    tracing::warn!(%action, "Stream exceeded maximum duration, truncating");
                    yield Err(ServiceError::StreamInterrupted(
                        "maximum stream duration exceeded".to_string(),
                    ));
                    return;
                };
                match event {
                    StreamEvent::Fragment(text) => yield Ok(text),
                    StreamEvent::Done => {
                        guard.finish(RelayOutcome::Completed);
                        tracing::debug!(%action, "Stream completed");
                        return;
                    }
                    StreamEvent::Error(reason) => {
                        guard.finish(RelayOutcome::UpstreamError);
                        tracing::error!(%action, %reason, "Generator failed mid-stream, truncating");
                        yield Err(ServiceError::StreamInterrupted(reason));
                        return;
                    }
                }
            }
        }
    }
}

/// Cancels the generator if the relay is dropped before reaching a
/// terminal state.
struct CancelOnDrop {
    handle: CancelHandle,
    metrics: Arc<Metrics>,
    action: Action,
    armed: bool,
}

impl CancelOnDrop {
    /// Stops the guard without recording a stream outcome.
    fn disarm(&mut self) {
        self.armed = false;
    }

    fn finish(&mut self, outcome: RelayOutcome) {
        self.armed = false;
        self.metrics.record_stream(outcome);
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if self.armed && self.handle.cancel() {
            self.metrics.record_stream(RelayOutcome::Cancelled);
            tracing::debug!(action = %self.action, "Caller went away, generator cancelled");
        }
    }
}
