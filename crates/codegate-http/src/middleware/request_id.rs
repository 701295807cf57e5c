//! Request ID middleware: ties one gateway request to its log lines.
//!
//! Admission, relay and upstream logs for a request all run inside the
//! `request` span opened here. The principal middleware fills the span's
//! `principal` field once the caller is known, so a quota rejection or a
//! truncated stream can be traced back to both the request and the caller.

use axum::extract::Request;
use axum::http::{HeaderName, HeaderValue};
use axum::middleware::Next;
use axum::response::Response;
use tracing::Instrument;
use uuid::Uuid;

pub(crate) static X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Client-supplied IDs longer than this are replaced.
const MAX_REQUEST_ID_LEN: usize = 128;

fn incoming_id(req: &Request) -> Option<String> {
    req.headers()
        .get(&X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty() && v.len() <= MAX_REQUEST_ID_LEN)
        .map(String::from)
}

/// Keeps a usable incoming `X-Request-Id` or generates a UUID v4, and
/// echoes it on the response, including streamed and 429 responses.
pub async fn request_id_middleware(mut req: Request, next: Next) -> Response {
    let request_id = incoming_id(&req).unwrap_or_else(|| Uuid::new_v4().to_string());

    let value = HeaderValue::from_str(&request_id).ok();
    if let Some(val) = &value {
        req.headers_mut().insert(X_REQUEST_ID.clone(), val.clone());
    }

    let span = tracing::info_span!(
        "request",
        request_id = %request_id,
        principal = tracing::field::Empty,
    );
    let mut response = next.run(req).instrument(span).await;

    if let Some(val) = value {
        response.headers_mut().insert(X_REQUEST_ID.clone(), val);
    }

    response
}

#[cfg(test)]
mod tests {
    use axum::body::Body;

    use super::*;

    fn with_id(id: &str) -> Request {
        Request::builder()
            .uri("/")
            .header("x-request-id", id)
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn incoming_id_is_kept_trimmed() {
        assert_eq!(incoming_id(&with_id(" req-42 ")).as_deref(), Some("req-42"));
    }

    #[test]
    fn blank_or_oversized_id_is_replaced() {
        assert_eq!(incoming_id(&with_id("   ")), None);
        let long = "x".repeat(MAX_REQUEST_ID_LEN + 1);
        assert_eq!(incoming_id(&with_id(&long)), None);
    }
}
