//! Quota endpoints: file creation admission and usage snapshot.

use axum::Extension;
use axum::extract::{Json, State};
use codegate_service::gateway::GatewayService;
use codegate_service::policy::Action;
use codegate_service::principal::Principal;

use crate::error::{ApiError, ErrorBody, ValidJson};
use crate::state::AppState;
use crate::types::{FileCreationRequest, FileCreationResponse, QuotaExceededBody, QuotaResponse};

/// Admit one file creation.
///
/// The caller creates the file only on a 200. Counted against a rolling
/// monthly durable quota.
#[utoipa::path(
    post,
    path = "/quota/file-creation",
    request_body = FileCreationRequest,
    responses(
        (status = 200, description = "Creation admitted", body = FileCreationResponse),
        (status = 400, description = "Missing field", body = ErrorBody),
        (status = 401, description = "Authentication required", body = ErrorBody),
        (status = 429, description = "Quota exceeded", body = QuotaExceededBody),
    ),
    tag = "Quota"
)]
pub async fn file_creation(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    ValidJson(req): ValidJson<FileCreationRequest>,
) -> Result<Json<FileCreationResponse>, ApiError> {
    if req.file_name.trim().is_empty() {
        return Err(ApiError::BadRequest("fileName is required".to_string()));
    }
    let grant = GatewayService::admit(&state, &principal, Action::FileCreation).await?;
    tracing::debug!(principal = %principal.id, file = %req.file_name, "File creation admitted");
    Ok(Json(FileCreationResponse {
        resource_class: grant.resource_class,
        remaining: grant.remaining,
        reset_in_seconds: grant.reset_in_secs,
    }))
}

/// Show the caller's quota usage.
///
/// Reads every ledger without consuming anything.
#[utoipa::path(
    get,
    path = "/quota",
    responses(
        (status = 200, description = "Usage per resource class", body = QuotaResponse),
        (status = 500, description = "Ledger unavailable", body = ErrorBody),
    ),
    tag = "Quota"
)]
pub async fn usage(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<QuotaResponse>, ApiError> {
    let usage = GatewayService::usage(&state, &principal).await?;
    Ok(Json(QuotaResponse { principal, usage }))
}
