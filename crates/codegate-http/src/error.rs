//! HTTP error mapping.
//!
//! `ApiError` converts service failures into status codes and JSON bodies.
//! Quota rejections get their own body shape and a `Retry-After` header.

use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequest, Request};
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use codegate_service::error::ServiceError;
use codegate_service::policy::ResourceClass;
use serde::Serialize;
use serde::de::DeserializeOwned;
use utoipa::ToSchema;

use crate::types::QuotaExceededBody;

/// API error returned by every handler.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Malformed or incomplete request body.
    #[error("{0}")]
    BadRequest(String),

    /// The action needs an authenticated principal.
    #[error("authentication required")]
    Unauthorized,

    /// A quota check failed.
    #[error("{resource_class} quota exceeded")]
    QuotaExceeded {
        resource_class: ResourceClass,
        retry_after_secs: u64,
    },

    /// The generator could not produce a stream.
    #[error("{0}")]
    BadGateway(String),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<ServiceError> for ApiError {
    fn from(e: ServiceError) -> Self {
        match e {
            ServiceError::BadRequest(msg) => Self::BadRequest(msg),
            ServiceError::Unauthorized => Self::Unauthorized,
            ServiceError::QuotaExceeded {
                resource_class,
                retry_after_secs,
            } => Self::QuotaExceeded {
                resource_class,
                retry_after_secs,
            },
            ServiceError::UpstreamUnavailable(msg) | ServiceError::StreamInterrupted(msg) => {
                Self::BadGateway(msg)
            }
            ServiceError::Ledger(e) => Self::Internal(e.to_string()),
            ServiceError::Internal(msg) => Self::Internal(msg),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

#[derive(Serialize, ToSchema)]
pub struct ErrorBody {
    /// Error code (e.g. "bad_request", "unauthorized", "internal_error").
    pub(crate) error: String,
    /// Human-readable error detail, if available.
    pub(crate) detail: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, detail) = match self {
            ApiError::QuotaExceeded {
                resource_class,
                retry_after_secs,
            } => return quota_exceeded(resource_class, retry_after_secs),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", Some(msg)),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized", None),
            ApiError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, "upstream_unavailable", Some(msg)),
            ApiError::Internal(msg) => {
                tracing::error!(%msg, "internal server error");
                // Ledger details stay in the logs.
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", None)
            }
        };

        let body = ErrorBody {
            error: error.to_string(),
            detail,
        };

        (status, axum::Json(body)).into_response()
    }
}

fn quota_exceeded(resource_class: ResourceClass, retry_after_secs: u64) -> Response {
    let body = QuotaExceededBody {
        message: format!("{resource_class} quota exceeded, try again later"),
        resource_class,
        retry_after_seconds: retry_after_secs,
    };
    let mut response = (StatusCode::TOO_MANY_REQUESTS, axum::Json(body)).into_response();
    response
        .headers_mut()
        .insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs));
    response
}

/// `Json` whose rejections are reported as 400 with an [`ErrorBody`].
pub struct ValidJson<T>(pub T);

impl<S, T> FromRequest<S> for ValidJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let axum::Json(value) = axum::Json::<T>::from_request(req, state).await?;
        Ok(Self(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_exceeded_sets_retry_after() {
        let response = ApiError::QuotaExceeded {
            resource_class: ResourceClass::CodeConversion,
            retry_after_secs: 86380,
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "86380");
    }

    #[test]
    fn service_errors_map_to_statuses() {
        let cases = [
            (ServiceError::bad_request("x"), StatusCode::BAD_REQUEST),
            (ServiceError::Unauthorized, StatusCode::UNAUTHORIZED),
            (
                ServiceError::UpstreamUnavailable("down".into()),
                StatusCode::BAD_GATEWAY,
            ),
            (ServiceError::Internal("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).into_response().status(), status);
        }
    }
}
