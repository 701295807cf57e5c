//! Generator adapter: a provider-agnostic source of text fragments.
//!
//! Every upstream (assistant chat, line completion, language conversion)
//! starts a [`FragmentSequence`]: a single-use, finite, cancellable lazy
//! sequence of [`StreamEvent`]s. The relay consumes it without knowing which
//! provider produced it.

pub mod gemini;
pub mod scripted;

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

pub use gemini::{
    AssistantProvider, CompletionProvider, ConversionProvider, DEFAULT_ENDPOINT, DEFAULT_MODEL,
    GeminiClient, GeminiConfig,
};
pub use scripted::ScriptedGenerator;

/// One item pulled from a generator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Fragment(String),
    Done,
    Error(String),
}

/// Input for one generation, by action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationInput {
    Assist {
        prompt: String,
        code: String,
    },
    Suggest {
        snippet: String,
    },
    Convert {
        code: String,
        source_language: String,
        target_language: String,
    },
}

impl GenerationInput {
    /// Every field must be a non-empty string. Returns the offending field.
    pub fn validate(&self) -> Result<(), &'static str> {
        let fields: Vec<(&'static str, &str)> = match self {
            Self::Assist { prompt, code } => vec![("prompt", prompt.as_str()), ("code", code.as_str())],
            Self::Suggest { snippet } => vec![("codeSnippet", snippet.as_str())],
            Self::Convert {
                code,
                source_language,
                target_language,
            } => vec![
                ("codeSnippet", code.as_str()),
                ("sourceLanguage", source_language.as_str()),
                ("targetLanguage", target_language.as_str()),
            ],
        };
        match fields.into_iter().find(|(_, value)| value.trim().is_empty()) {
            Some((name, _)) => Err(name),
            None => Ok(()),
        }
    }
}

/// Output budget for one generation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationOptions {
    pub max_output_tokens: u32,
    pub temperature: Option<f32>,
}

/// A generator failed to start.
#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("generator is not configured")]
    NotConfigured,

    #[error("{0} cannot handle this input")]
    UnsupportedInput(&'static str),

    #[error("upstream request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("upstream returned {status}: {body}")]
    Status { status: u16, body: String },
}

/// Fragment-producing upstream operation.
#[async_trait]
pub trait Generator: Send + Sync {
    fn name(&self) -> &'static str;

    fn default_options(&self) -> GenerationOptions;

    /// Starts a generation. Fragments are produced lazily as the returned
    /// sequence is pulled.
    async fn start(
        &self,
        input: &GenerationInput,
        options: &GenerationOptions,
    ) -> Result<FragmentSequence, GenerationError>;
}

type CancelHook = Box<dyn FnOnce() + Send>;

struct CancelInner {
    token: CancellationToken,
    fired: AtomicBool,
    hook: Mutex<Option<CancelHook>>,
}

/// Idempotent cancellation for a [`FragmentSequence`].
///
/// Clones share state. Only the first [`cancel`](Self::cancel) has any
/// effect; later calls, including after natural completion, are no-ops.
#[derive(Clone)]
pub struct CancelHandle {
    inner: Arc<CancelInner>,
}

impl CancelHandle {
    fn new() -> Self {
        Self {
            inner: Arc::new(CancelInner {
                token: CancellationToken::new(),
                fired: AtomicBool::new(false),
                hook: Mutex::new(None),
            }),
        }
    }

    /// Returns `true` only for the call that actually cancelled.
    pub fn cancel(&self) -> bool {
        if self.inner.fired.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.inner.token.cancel();
        if let Some(hook) = self.inner.hook.lock().take() {
            hook();
        }
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.fired.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelHandle")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// Single-use lazy sequence of fragments.
///
/// After `Done`, an `Error`, or cancellation the upstream is dropped and
/// every further pull yields `Done`.
pub struct FragmentSequence {
    upstream: Option<EventStream>,
    cancel: CancelHandle,
}

impl FragmentSequence {
    pub fn new(upstream: impl Stream<Item = StreamEvent> + Send + 'static) -> Self {
        Self {
            upstream: Some(Box::pin(upstream)),
            cancel: CancelHandle::new(),
        }
    }

    /// Runs `hook` once, on the first effective cancel. Replaces any
    /// previous hook.
    #[must_use]
    pub fn with_cancel_hook(self, hook: impl FnOnce() + Send + 'static) -> Self {
        *self.cancel.inner.hook.lock() = Some(Box::new(hook));
        self
    }

    /// Sequence that ends immediately.
    pub fn empty() -> Self {
        Self::new(futures_util::stream::empty())
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn cancel(&self) -> bool {
        self.cancel.cancel()
    }

    pub fn is_finished(&self) -> bool {
        self.upstream.is_none()
    }

    /// Pulls the next event, suspending on upstream I/O.
    pub async fn next_event(&mut self) -> StreamEvent {
        let Some(upstream) = self.upstream.as_mut() else {
            return StreamEvent::Done;
        };

        let event = tokio::select! {
            biased;
            () = self.cancel.inner.token.cancelled() => None,
            event = upstream.next() => Some(event.unwrap_or(StreamEvent::Done)),
        };

        match event {
            Some(StreamEvent::Fragment(text)) => StreamEvent::Fragment(text),
            Some(terminal @ StreamEvent::Error(_)) => {
                self.upstream = None;
                terminal
            }
            Some(StreamEvent::Done) | None => {
                self.upstream = None;
                StreamEvent::Done
            }
        }
    }
}

impl std::fmt::Debug for FragmentSequence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FragmentSequence")
            .field("finished", &self.is_finished())
            .field("cancel", &self.cancel)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn fragments(parts: &[&str]) -> FragmentSequence {
        let events: Vec<_> = parts
            .iter()
            .map(|p| StreamEvent::Fragment((*p).to_string()))
            .collect();
        FragmentSequence::new(futures_util::stream::iter(events))
    }

    #[tokio::test]
    async fn yields_fragments_then_done_forever() {
        let mut seq = fragments(&["a", "b"]);
        assert_eq!(seq.next_event().await, StreamEvent::Fragment("a".into()));
        assert_eq!(seq.next_event().await, StreamEvent::Fragment("b".into()));
        assert_eq!(seq.next_event().await, StreamEvent::Done);
        assert!(seq.is_finished());
        assert_eq!(seq.next_event().await, StreamEvent::Done);
    }

    #[tokio::test]
    async fn nothing_follows_an_error() {
        let events = vec![
            StreamEvent::Fragment("x".into()),
            StreamEvent::Error("boom".into()),
            StreamEvent::Fragment("never".into()),
        ];
        let mut seq = FragmentSequence::new(futures_util::stream::iter(events));
        seq.next_event().await;
        assert_eq!(seq.next_event().await, StreamEvent::Error("boom".into()));
        assert_eq!(seq.next_event().await, StreamEvent::Done);
    }

    #[tokio::test]
    async fn cancel_is_idempotent_and_runs_hook_once() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let mut seq = fragments(&["a", "b"]).with_cancel_hook(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let handle = seq.cancel_handle();

        assert!(handle.cancel());
        assert!(!handle.cancel());
        assert!(!seq.cancel());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(seq.next_event().await, StreamEvent::Done);
    }

    #[tokio::test]
    async fn cancel_after_completion_is_harmless() {
        let mut seq = fragments(&["a"]);
        while seq.next_event().await != StreamEvent::Done {}
        assert!(seq.cancel());
        assert!(!seq.cancel());
    }

    #[tokio::test]
    async fn cancel_interrupts_pending_pull() {
        let mut seq = FragmentSequence::new(futures_util::stream::pending());
        let handle = seq.cancel_handle();
        let pull = tokio::spawn(async move { seq.next_event().await });
        tokio::task::yield_now().await;
        handle.cancel();
        assert_eq!(pull.await.unwrap(), StreamEvent::Done);
    }

    #[test]
    fn validate_names_first_empty_field() {
        let input = GenerationInput::Convert {
            code: "fn main() {}".into(),
            source_language: "rust".into(),
            target_language: "  ".into(),
        };
        assert_eq!(input.validate(), Err("targetLanguage"));
        let input = GenerationInput::Assist {
            prompt: "fix".into(),
            code: "x".into(),
        };
        assert_eq!(input.validate(), Ok(()));
    }
}
