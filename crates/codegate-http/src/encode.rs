//! Relay encoding: bridges admitted service streams to chunked HTTP bodies.

use axum::body::Body;
use axum::http::{HeaderName, HeaderValue, StatusCode, header};
use axum::response::Response;
use codegate_service::gateway::AdmittedStream;

pub(crate) static X_QUOTA_REMAINING: HeaderName = HeaderName::from_static("x-quota-remaining");

/// Builds the 200 response for an admitted stream.
///
/// Each fragment becomes one body chunk. A relay error item aborts the
/// body, which the client sees as a truncated transfer. Dropping the body
/// (client disconnect) drops the relay, which cancels the generator.
pub fn streaming_text_response(admitted: AdmittedStream) -> Response {
    let remaining = admitted.grant.remaining;
    let body = Body::from_stream(admitted.stream.into_stream());

    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(X_QUOTA_REMAINING.clone(), HeaderValue::from(remaining));
    response
}
