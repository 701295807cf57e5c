//! Gemini streaming providers.
//!
//! One shared [`GeminiClient`] speaks `streamGenerateContent` over SSE. The
//! three providers differ only in prompt template and output budget.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};

use super::{
    FragmentSequence, GenerationError, GenerationInput, GenerationOptions, Generator, StreamEvent,
};

pub const DEFAULT_MODEL: &str = "gemini-1.5-flash";
pub const DEFAULT_ENDPOINT: &str = "https://generativelanguage.googleapis.com";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection settings for the Gemini API.
#[derive(Debug, Clone)]
pub struct GeminiConfig {
    /// `None` leaves every provider unconfigured.
    pub api_key: Option<String>,
    pub model: String,
    pub endpoint: String,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    contents: [Content<'a>; 1],
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct Content<'a> {
    role: &'static str,
    parts: [Part<'a>; 1],
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    max_output_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    candidates: Vec<Candidate>,
    error: Option<ChunkError>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

#[derive(Deserialize)]
struct ChunkError {
    message: String,
}

/// Parses one SSE line. `None` for lines carrying no text (blank lines,
/// comments, chunks without candidates).
fn parse_sse_line(line: &str) -> Option<StreamEvent> {
    let data = line.strip_prefix("data:")?.trim();
    if data.is_empty() || data == "[DONE]" {
        return None;
    }
    let chunk: StreamChunk = match serde_json::from_str(data) {
        Ok(chunk) => chunk,
        Err(e) => {
            tracing::debug!(error = %e, "Skipping unparseable stream chunk");
            return None;
        }
    };
    if let Some(err) = chunk.error {
        return Some(StreamEvent::Error(err.message));
    }
    let text: String = chunk
        .candidates
        .into_iter()
        .take(1)
        .filter_map(|c| c.content)
        .flat_map(|c| c.parts)
        .filter_map(|p| p.text)
        .collect();
    (!text.is_empty()).then_some(StreamEvent::Fragment(text))
}

/// Splits complete lines off the front of `buffer`.
///
/// Works on bytes so a multi-byte character split across network chunks is
/// decoded only once whole.
fn drain_lines(buffer: &mut Vec<u8>) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
        let line: Vec<u8> = buffer.drain(..=pos).collect();
        lines.push(String::from_utf8_lossy(&line).trim().to_string());
    }
    lines
}

/// Streaming client for the Gemini `generateContent` API.
#[derive(Debug, Clone)]
pub struct GeminiClient {
    http: reqwest::Client,
    config: GeminiConfig,
}

impl GeminiClient {
    pub fn new(config: GeminiConfig) -> Result<Self, GenerationError> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self { http, config })
    }

    pub fn is_configured(&self) -> bool {
        self.config.api_key.is_some()
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    /// Sends `prompt` and returns a sequence over the streamed reply.
    ///
    /// Fails before producing a sequence if the key is missing or the
    /// upstream rejects the request.
    pub async fn stream(
        &self,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<FragmentSequence, GenerationError> {
        let Some(api_key) = &self.config.api_key else {
            return Err(GenerationError::NotConfigured);
        };

        let url = format!(
            "{}/v1beta/models/{}:streamGenerateContent?alt=sse",
            self.config.endpoint.trim_end_matches('/'),
            self.config.model
        );
        let request = GenerateRequest {
            contents: [Content {
                role: "user",
                parts: [Part { text: prompt }],
            }],
            generation_config: GenerationConfig {
                max_output_tokens: options.max_output_tokens,
                temperature: options.temperature,
            },
        };

        let response = self
            .http
            .post(url)
            .header("x-goog-api-key", api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GenerationError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let mut bytes = Box::pin(response.bytes_stream());
        let events = async_stream::stream! {
            let mut buffer = Vec::new();
            while let Some(chunk) = bytes.next().await {
                match chunk {
                    Ok(chunk) => {
                        buffer.extend_from_slice(&chunk);
                        for line in drain_lines(&mut buffer) {
                            if let Some(event) = parse_sse_line(&line) {
                                let failed = matches!(event, StreamEvent::Error(_));
                                yield event;
                                if failed {
                                    return;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        yield StreamEvent::Error(e.to_string());
                        return;
                    }
                }
            }
            buffer.push(b'\n');
            for line in drain_lines(&mut buffer) {
                if let Some(event) = parse_sse_line(&line) {
                    yield event;
                }
            }
            yield StreamEvent::Done;
        };

        Ok(FragmentSequence::new(events))
    }
}

fn assistant_prompt(prompt: &str, code: &str) -> String {
    format!(
        "You are an expert programming assistant.\n\
         Analyze the following code and respond according to the user's request.\n\n\
         ### Code:\n```\n{code}\n```\n\n\
         ### User Request:\n{prompt}\n\n\
         ### Guidelines for Response:\n\
         - If the user asks for fixes, find and fix bugs (if any).\n\
         - If the user asks for improvements, suggest better coding practices.\n\
         - If the user asks for a function, only return the requested function without extra explanations.\n\
         - Always format the response in Markdown and use valid code syntax.\n\n\
         Now, generate the best possible response in Markdown format."
    )
}

fn completion_prompt(snippet: &str) -> String {
    format!(
        "You are a smart code completion AI. Suggest the next few words based on this partial code:\n\n\
         {snippet}\n\nSuggestion:"
    )
}

fn conversion_prompt(code: &str, source: &str, target: &str) -> String {
    format!(
        "You are a highly skilled AI that converts code from one programming language to another.\n\
         - Convert the given {source} code into {target}.\n\
         - Ensure that syntax, best practices, and performance are maintained.\n\
         - Do NOT add explanations, comments, or extra text. Only return the converted code.\n\n\
         Code in {source}:\n{code}\n\n\
         Converted Code in {target}:\n"
    )
}

/// Chat-style assistant over a piece of code.
#[derive(Debug, Clone)]
pub struct AssistantProvider {
    client: Arc<GeminiClient>,
}

impl AssistantProvider {
    pub fn new(client: Arc<GeminiClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Generator for AssistantProvider {
    fn name(&self) -> &'static str {
        "gemini-assistant"
    }

    fn default_options(&self) -> GenerationOptions {
        GenerationOptions {
            max_output_tokens: 3072,
            temperature: Some(0.7),
        }
    }

    async fn start(
        &self,
        input: &GenerationInput,
        options: &GenerationOptions,
    ) -> Result<FragmentSequence, GenerationError> {
        let GenerationInput::Assist { prompt, code } = input else {
            return Err(GenerationError::UnsupportedInput(self.name()));
        };
        self.client.stream(&assistant_prompt(prompt, code), options).await
    }
}

/// Inline completion for a partial snippet.
#[derive(Debug, Clone)]
pub struct CompletionProvider {
    client: Arc<GeminiClient>,
}

impl CompletionProvider {
    pub fn new(client: Arc<GeminiClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Generator for CompletionProvider {
    fn name(&self) -> &'static str {
        "gemini-completion"
    }

    fn default_options(&self) -> GenerationOptions {
        GenerationOptions {
            max_output_tokens: 1024,
            temperature: None,
        }
    }

    async fn start(
        &self,
        input: &GenerationInput,
        options: &GenerationOptions,
    ) -> Result<FragmentSequence, GenerationError> {
        let GenerationInput::Suggest { snippet } = input else {
            return Err(GenerationError::UnsupportedInput(self.name()));
        };
        self.client.stream(&completion_prompt(snippet), options).await
    }
}

/// Source-to-source language conversion.
#[derive(Debug, Clone)]
pub struct ConversionProvider {
    client: Arc<GeminiClient>,
}

impl ConversionProvider {
    pub fn new(client: Arc<GeminiClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Generator for ConversionProvider {
    fn name(&self) -> &'static str {
        "gemini-conversion"
    }

    fn default_options(&self) -> GenerationOptions {
        GenerationOptions {
            max_output_tokens: 2048,
            temperature: Some(0.7),
        }
    }

    async fn start(
        &self,
        input: &GenerationInput,
        options: &GenerationOptions,
    ) -> Result<FragmentSequence, GenerationError> {
        let GenerationInput::Convert {
            code,
            source_language,
            target_language,
        } = input
        else {
            return Err(GenerationError::UnsupportedInput(self.name()));
        };
        self.client
            .stream(
                &conversion_prompt(code, source_language, target_language),
                options,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_parts_of_first_candidate_are_joined() {
        let line = r#"data: {"candidates":[{"content":{"parts":[{"text":"Hel"},{"text":"lo"}]}},{"content":{"parts":[{"text":"ignored"}]}}]}"#;
        assert_eq!(parse_sse_line(line), Some(StreamEvent::Fragment("Hello".into())));
    }

    #[test]
    fn non_data_and_empty_chunks_are_skipped() {
        assert_eq!(parse_sse_line(""), None);
        assert_eq!(parse_sse_line(": keep-alive"), None);
        assert_eq!(parse_sse_line("data: [DONE]"), None);
        assert_eq!(parse_sse_line(r#"data: {"candidates":[]}"#), None);
        assert_eq!(parse_sse_line("data: {not json"), None);
    }

    #[test]
    fn error_payload_becomes_error_event() {
        let line = r#"data: {"error":{"code":429,"message":"Resource exhausted"}}"#;
        assert_eq!(
            parse_sse_line(line),
            Some(StreamEvent::Error("Resource exhausted".into()))
        );
    }

    #[test]
    fn lines_split_across_chunks_are_reassembled() {
        let mut buffer = b"data: {\"a\"".to_vec();
        assert!(drain_lines(&mut buffer).is_empty());
        buffer.extend_from_slice(b":1}\r\n\ndata: x");
        assert_eq!(drain_lines(&mut buffer), vec!["data: {\"a\":1}", ""]);
        assert_eq!(buffer, b"data: x");
    }

    #[test]
    fn multibyte_char_split_across_chunks_survives() {
        let text = "data: é\n".as_bytes();
        let (head, tail) = text.split_at(7);
        let mut buffer = head.to_vec();
        assert!(drain_lines(&mut buffer).is_empty());
        buffer.extend_from_slice(tail);
        assert_eq!(drain_lines(&mut buffer), vec!["data: é"]);
    }

    #[test]
    fn prompts_embed_their_inputs() {
        let p = conversion_prompt("print(1)", "python", "rust");
        assert!(p.contains("Convert the given python code into rust."));
        assert!(p.contains("print(1)"));
        assert!(assistant_prompt("add docs", "fn f() {}").contains("add docs"));
        assert!(completion_prompt("let x =").ends_with("Suggestion:"));
    }

    #[tokio::test]
    async fn unconfigured_client_fails_to_start() {
        let client = Arc::new(GeminiClient::new(GeminiConfig::default()).unwrap());
        let provider = AssistantProvider::new(client);
        let input = GenerationInput::Assist {
            prompt: "p".into(),
            code: "c".into(),
        };
        let err = provider
            .start(&input, &provider.default_options())
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::NotConfigured));
    }

    #[tokio::test]
    async fn provider_rejects_foreign_input() {
        let client = Arc::new(GeminiClient::new(GeminiConfig::default()).unwrap());
        let provider = CompletionProvider::new(client);
        let input = GenerationInput::Assist {
            prompt: "p".into(),
            code: "c".into(),
        };
        let err = provider
            .start(&input, &provider.default_options())
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::UnsupportedInput("gemini-completion")));
    }
}
