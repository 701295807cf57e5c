//! AI assistant and code suggestion endpoints.
//!
//! Validation, the quota gate and generator startup are delegated to
//! `codegate_service::gateway::GatewayService`.

use axum::Extension;
use axum::extract::State;
use axum::response::Response;
use codegate_service::gateway::GatewayService;
use codegate_service::generator::GenerationInput;
use codegate_service::policy::Action;
use codegate_service::principal::Principal;

use crate::encode::streaming_text_response;
use crate::error::{ApiError, ErrorBody, ValidJson};
use crate::state::AppState;
use crate::types::{AssistantRequest, QuotaExceededBody, SuggestionRequest};

/// Ask the assistant about a piece of code.
///
/// Requires a bearer token. Charged against the hourly and daily AI quotas.
/// The Markdown answer is streamed as plain text.
#[utoipa::path(
    post,
    path = "/ai/assistant",
    request_body = AssistantRequest,
    responses(
        (status = 200, description = "Streamed answer", content_type = "text/plain", body = String),
        (status = 400, description = "Missing field", body = ErrorBody),
        (status = 401, description = "Authentication required", body = ErrorBody),
        (status = 429, description = "Quota exceeded", body = QuotaExceededBody),
        (status = 502, description = "Generator unavailable", body = ErrorBody),
    ),
    tag = "AI"
)]
pub async fn assistant(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    ValidJson(req): ValidJson<AssistantRequest>,
) -> Result<Response, ApiError> {
    let input = GenerationInput::Assist {
        prompt: req.prompt,
        code: req.code,
    };
    let admitted = GatewayService::stream(&state, &principal, Action::AiAssistant, input).await?;
    Ok(streaming_text_response(admitted))
}

/// Complete a partial code snippet.
///
/// Open to guests, who get a smaller per-minute quota.
#[utoipa::path(
    post,
    path = "/ai/suggestion",
    request_body = SuggestionRequest,
    responses(
        (status = 200, description = "Streamed suggestion", content_type = "text/plain", body = String),
        (status = 400, description = "Missing field", body = ErrorBody),
        (status = 429, description = "Quota exceeded", body = QuotaExceededBody),
        (status = 502, description = "Generator unavailable", body = ErrorBody),
    ),
    tag = "AI"
)]
pub async fn suggestion(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    ValidJson(req): ValidJson<SuggestionRequest>,
) -> Result<Response, ApiError> {
    let input = GenerationInput::Suggest {
        snippet: req.code_snippet,
    };
    let admitted =
        GatewayService::stream(&state, &principal, Action::CodeSuggestion, input).await?;
    Ok(streaming_text_response(admitted))
}
