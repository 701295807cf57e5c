//! Code conversion endpoint.

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
use crate::types::{ConvertRequest, QuotaExceededBody};

/// Convert code between programming languages.
///
/// Requires a bearer token. Charged against both the volatile and the
/// durable conversion quota; whichever is stricter governs.
#[utoipa::path(
    post,
    path = "/convert",
    request_body = ConvertRequest,
    responses(
        (status = 200, description = "Streamed converted code", content_type = "text/plain", body = String),
        (status = 400, description = "Missing field", body = ErrorBody),
        (status = 401, description = "Authentication required", body = ErrorBody),
        (status = 429, description = "Quota exceeded", body = QuotaExceededBody),
        (status = 502, description = "Generator unavailable", body = ErrorBody),
    ),
    tag = "AI"
)]
pub async fn convert(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    ValidJson(req): ValidJson<ConvertRequest>,
) -> Result<Response, ApiError> {
    let input = GenerationInput::Convert {
        code: req.code_snippet,
        source_language: req.source_language,
        target_language: req.target_language,
    };
    let admitted =
        GatewayService::stream(&state, &principal, Action::CodeConversion, input).await?;
    Ok(streaming_text_response(admitted))
}
