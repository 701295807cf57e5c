//! Deterministic generator replaying a fixed script.
//!
//! Stands in for a real provider in tests and local runs without an API key.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use super::{
    FragmentSequence, GenerationError, GenerationInput, GenerationOptions, Generator, StreamEvent,
};

/// Replays scripted events, optionally with a delay before each one.
///
/// Clones share their start and cancellation counters.
#[derive(Debug, Clone, Default)]
pub struct ScriptedGenerator {
    events: Vec<StreamEvent>,
    delay: Duration,
    hang: bool,
    start_failure: Option<String>,
    starts: Arc<AtomicUsize>,
    cancellations: Arc<AtomicUsize>,
}

impl ScriptedGenerator {
    /// Emits each fragment, then ends.
    pub fn fragments<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            events: fragments
                .into_iter()
                .map(|f| StreamEvent::Fragment(f.into()))
                .collect(),
            ..Self::default()
        }
    }

    /// Fails in `start`, before producing anything.
    pub fn failing(reason: impl Into<String>) -> Self {
        Self {
            start_failure: Some(reason.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Appends an upstream error after the scripted fragments.
    #[must_use]
    pub fn then_error(mut self, reason: impl Into<String>) -> Self {
        self.events.push(StreamEvent::Error(reason.into()));
        self
    }

    /// Never ends after the scripted events; only cancellation stops it.
    #[must_use]
    pub fn then_hang(mut self) -> Self {
        self.hang = true;
        self
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn cancellations(&self) -> usize {
        self.cancellations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn default_options(&self) -> GenerationOptions {
        GenerationOptions {
            max_output_tokens: 1024,
            temperature: None,
        }
    }

    async fn start(
        &self,
        _input: &GenerationInput,
        _options: &GenerationOptions,
    ) -> Result<FragmentSequence, GenerationError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if let Some(reason) = &self.start_failure {
            return Err(GenerationError::Status {
                status: 503,
                body: reason.clone(),
            });
        }

        let events = self.events.clone();
        let delay = self.delay;
        let hang = self.hang;
        let stream = async_stream::stream! {
            for event in events {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                yield event;
            }
            if hang {
                std::future::pending::<()>().await;
            }
        };

        let cancellations = Arc::clone(&self.cancellations);
        Ok(FragmentSequence::new(stream).with_cancel_hook(move || {
            cancellations.fetch_add(1, Ordering::SeqCst);
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input() -> GenerationInput {
        GenerationInput::Suggest {
            snippet: "let x =".into(),
        }
    }

    #[tokio::test]
    async fn replays_script_in_order() {
        let generator = ScriptedGenerator::fragments(["Hello", " ", "World"])
            .with_delay(Duration::from_millis(5));
        let mut seq = generator
            .start(&input(), &generator.default_options())
            .await
            .unwrap();

        let mut out = String::new();
        loop {
            match seq.next_event().await {
                StreamEvent::Fragment(f) => out.push_str(&f),
                StreamEvent::Done => break,
                StreamEvent::Error(e) => panic!("unexpected error {e}"),
            }
        }
        assert_eq!(out, "Hello World");
        assert_eq!(generator.starts(), 1);
    }

    #[tokio::test]
    async fn failing_start_produces_nothing() {
        let generator = ScriptedGenerator::failing("down");
        let err = generator
            .start(&input(), &generator.default_options())
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::Status { status: 503, .. }));
    }

    #[tokio::test]
    async fn cancellation_counter_is_shared_between_clones() {
        let generator = ScriptedGenerator::fragments(["a"]).then_hang();
        let observer = generator.clone();
        let seq = generator
            .start(&input(), &generator.default_options())
            .await
            .unwrap();
        seq.cancel();
        seq.cancel();
        assert_eq!(observer.cancellations(), 1);
    }
}
