//! Request and response bodies for the HTTP API.
//!
//! Request fields default to empty so a missing field is reported the same
//! way as a blank one.

use codegate_service::gate::QuotaUsage;
use codegate_service::policy::ResourceClass;
use codegate_service::principal::Principal;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Body for `POST /ai/assistant`.
#[derive(Debug, Default, Deserialize, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AssistantRequest {
    /// What the user wants done with the code.
    #[serde(default)]
    #[schema(example = "Add error handling")]
    pub prompt: String,
    #[serde(default)]
    pub code: String,
}

/// Body for `POST /ai/suggestion`.
#[derive(Debug, Default, Deserialize, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SuggestionRequest {
    /// Partial code to complete.
    #[serde(default)]
    #[schema(example = "fn fibonacci(n: u32) -> u32 {")]
    pub code_snippet: String,
}

/// Body for `POST /convert`.
#[derive(Debug, Default, Deserialize, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConvertRequest {
    #[serde(default)]
    pub code_snippet: String,
    #[serde(default)]
    #[schema(example = "python")]
    pub source_language: String,
    #[serde(default)]
    #[schema(example = "rust")]
    pub target_language: String,
}

/// Body for `POST /quota/file-creation`.
#[derive(Debug, Default, Deserialize, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct FileCreationRequest {
    #[serde(default)]
    #[schema(example = "main.rs")]
    pub file_name: String,
}

/// Admission signal for a file creation.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct FileCreationResponse {
    pub resource_class: ResourceClass,
    /// Creations left in the current period.
    pub remaining: u64,
    pub reset_in_seconds: u64,
}

/// Caller identity plus per-class usage.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct QuotaResponse {
    pub principal: Principal,
    pub usage: Vec<QuotaUsage>,
}

/// Body of a 429 response.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct QuotaExceededBody {
    pub message: String,
    pub resource_class: ResourceClass,
    pub retry_after_seconds: u64,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    /// `memory` or `redis`.
    pub volatile_backend: String,
    /// `memory` or `sqlite`.
    pub durable_backend: String,
}
