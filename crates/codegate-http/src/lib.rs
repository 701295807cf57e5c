//! Codegate HTTP: REST transport adapter for the codegate gateway.
//!
//! Provides the HTTP interface including:
//! - Streamed AI endpoints (assistant, suggestion, conversion)
//! - File creation admission and quota usage
//! - System/health and metrics endpoints
//! - OpenAPI/Swagger UI
//! - Request-ID and principal resolution middleware
//!
//! Responses are not compressed: a compression layer would buffer the
//! streamed bodies.

pub mod encode;
pub mod error;
pub mod middleware;
pub mod routes;
pub mod state;
pub mod types;

use std::net::SocketAddr;

use axum::Router;
use axum::http::{HeaderValue, Method, header};
use axum::routing::{get, post};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use codegate_service::gate::QuotaUsage;
use codegate_service::policy::{LedgerKind, ResourceClass};
use codegate_service::principal::{Principal, PrincipalClass};
use error::ErrorBody;
use types::{
    AssistantRequest, ConvertRequest, FileCreationRequest, FileCreationResponse, HealthResponse,
    QuotaExceededBody, QuotaResponse, SuggestionRequest,
};

pub use state::AppState;

// ---------------------------------------------------------------------------
// OpenAPI
// ---------------------------------------------------------------------------

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Codegate API",
        description = "Quota-gated streaming gateway for AI code assistance.\n\nEvery protected action runs its quota checks before any upstream work starts. Admitted requests stream the generated text as a chunked plain-text body; rejected ones get a 429 naming the exhausted resource class and when to retry.\n\nAuthenticate with `Authorization: Bearer <token>`. Requests without a recognised token are treated as guests keyed by client address.",
        version = "0.3.2",
        license(name = "Apache-2.0"),
    ),
    paths(
        routes::ai::assistant,
        routes::ai::suggestion,
        routes::convert::convert,
        routes::quota::file_creation,
        routes::quota::usage,
        routes::system::health,
    ),
    components(schemas(
        AssistantRequest,
        SuggestionRequest,
        ConvertRequest,
        FileCreationRequest,
        FileCreationResponse,
        QuotaResponse,
        QuotaUsage,
        QuotaExceededBody,
        HealthResponse,
        ErrorBody,
        Principal,
        PrincipalClass,
        ResourceClass,
        LedgerKind,
    )),
    tags(
        (name = "AI", description = "Streamed generation endpoints"),
        (name = "Quota", description = "Quota admission and usage"),
        (name = "System", description = "Health and diagnostics"),
    )
)]
pub struct ApiDoc;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the HTTP router with all routes and middleware.
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        // Generation
        .route("/ai/assistant", post(routes::ai::assistant))
        .route("/ai/suggestion", post(routes::ai::suggestion))
        .route("/convert", post(routes::convert::convert))
        // Quota
        .route("/quota", get(routes::quota::usage))
        .route("/quota/file-creation", post(routes::quota::file_creation))
        // System
        .route("/health", get(routes::system::health))
        .route("/metrics", get(routes::system::metrics_endpoint))
        .layer(TraceLayer::new_for_http());

    let api = api
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::principal::principal_middleware,
        ))
        .layer(axum::middleware::from_fn(
            middleware::request_id::request_id_middleware,
        ))
        .layer(cors_layer(&state))
        .with_state(state);

    api.merge(SwaggerUi::new("/api/docs").url("/api/openapi.json", ApiDoc::openapi()))
}

/// Serve the HTTP router on the given listener with graceful shutdown.
///
/// Wraps `axum::serve` with `ConnectInfo<SocketAddr>` so guests can be
/// fingerprinted by client address.
pub async fn serve(
    listener: tokio::net::TcpListener,
    app: Router,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}

fn cors_layer(state: &AppState) -> CorsLayer {
    let origins = state.cors_origins();

    // No origins configured → no CORS headers (deny cross-origin by default).
    if origins.is_empty() {
        return CorsLayer::new();
    }

    let x_request_id = middleware::request_id::X_REQUEST_ID.clone();
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION, x_request_id.clone()])
        .expose_headers([
            x_request_id,
            encode::X_QUOTA_REMAINING.clone(),
            header::RETRY_AFTER,
        ]);

    if origins.len() == 1 && origins[0] == "*" {
        tracing::warn!("CORS configured with wildcard origin, all cross-origin requests allowed");
        base.allow_origin(tower_http::cors::Any)
    } else {
        let parsed: Vec<HeaderValue> = origins
            .iter()
            .filter_map(|o| match o.parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    tracing::warn!(origin = %o, "Ignoring invalid CORS origin");
                    None
                }
            })
            .collect();
        base.allow_origin(parsed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use codegate_service::Generators;
    use codegate_service::generator::ScriptedGenerator;
    use codegate_service::principal::{ApiKeyResolver, PrincipalResolver};
    use tower::ServiceExt;

    use super::*;

    fn app(generator: ScriptedGenerator) -> Router {
        let keys = ApiKeyResolver::from_pairs(["tok-1=alice"]);
        let state = AppState::new_in_memory(
            PrincipalResolver::new(Some(Arc::new(keys))),
            Generators::uniform(Arc::new(generator)),
        );
        router(state)
    }

    fn post_json(uri: &str, token: Option<&str>, body: &str) -> Request<Body> {
        let mut builder = Request::post(uri).header("content-type", "application/json");
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    #[tokio::test]
    async fn guest_cannot_use_assistant() {
        let response = app(ScriptedGenerator::fragments(["x"]))
            .oneshot(post_json("/ai/assistant", None, r#"{"prompt":"p","code":"c"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn authenticated_assistant_streams_text() {
        let response = app(ScriptedGenerator::fragments(["Hello", " World"]))
            .oneshot(post_json(
                "/ai/assistant",
                Some("tok-1"),
                r#"{"prompt":"p","code":"c"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["content-type"],
            "text/plain; charset=utf-8"
        );
        // Hourly AI quota (10) is tighter than the daily one (30).
        assert_eq!(response.headers()["x-quota-remaining"], "9");
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"Hello World");
    }

    #[tokio::test]
    async fn malformed_json_is_bad_request() {
        let response = app(ScriptedGenerator::default())
            .oneshot(post_json("/ai/suggestion", None, "{not json"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn missing_field_names_the_field() {
        let response = app(ScriptedGenerator::default())
            .oneshot(post_json("/convert", Some("tok-1"), r#"{"codeSnippet":"x"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "bad_request");
        assert_eq!(json["detail"], "sourceLanguage is required");
    }

    #[test]
    fn openapi_document_lists_routes() {
        let doc = ApiDoc::openapi();
        for path in ["/ai/assistant", "/ai/suggestion", "/convert", "/quota", "/health"] {
            assert!(doc.paths.paths.contains_key(path), "{path}");
        }
    }
}
