//! Principal middleware: resolves who each request acts on behalf of.
//!
//! A bearer token is handed to the service's `PrincipalResolver`. Requests
//! without a recognised token become guests fingerprinted by client IP. The
//! result is stored as an `Extension<Principal>` for handlers.

use std::net::{IpAddr, SocketAddr};

use axum::extract::{ConnectInfo, Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::Response;

use crate::state::AppState;

/// Extracts the token from `Authorization: Bearer <token>`.
fn bearer_token(req: &Request) -> Option<&str> {
    let value = req.headers().get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

/// Extracts the client IP from the request.
fn extract_ip(req: &Request, trust_forwarded_for: bool) -> Option<IpAddr> {
    // X-Forwarded-For takes priority behind a trusted reverse proxy
    if trust_forwarded_for
        && let Some(xff) = req.headers().get("x-forwarded-for")
        && let Ok(s) = xff.to_str()
        && let Some(first) = s.split(',').next()
        && let Ok(ip) = first.trim().parse::<IpAddr>()
    {
        return Some(ip);
    }

    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip())
}

/// Resolves the request principal and attaches it as an extension.
pub async fn principal_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Response {
    let origin = extract_ip(&req, state.trust_forwarded_for());
    let principal = state.principals().resolve(bearer_token(&req), origin);
    tracing::Span::current().record("principal", principal.id.as_str());
    tracing::debug!(principal = %principal.id, class = %principal.class, "Resolved principal");
    req.extensions_mut().insert(principal);
    next.run(req).await
}

#[cfg(test)]
mod tests {
    use axum::body::Body;

    use super::*;

    fn request(headers: &[(&str, &str)]) -> Request {
        let mut builder = Request::builder().uri("/");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let mut req = builder.body(Body::empty()).unwrap();
        let peer: SocketAddr = "192.0.2.10:5000".parse().unwrap();
        req.extensions_mut().insert(ConnectInfo(peer));
        req
    }

    #[test]
    fn bearer_scheme_is_case_insensitive() {
        let req = request(&[("authorization", "bearer tok-1")]);
        assert_eq!(bearer_token(&req), Some("tok-1"));
        let req = request(&[("authorization", "Basic dXNlcjpwYXNz")]);
        assert_eq!(bearer_token(&req), None);
        let req = request(&[("authorization", "Bearer ")]);
        assert_eq!(bearer_token(&req), None);
    }

    #[test]
    fn forwarded_for_ignored_unless_trusted() {
        let req = request(&[("x-forwarded-for", "203.0.113.5, 10.0.0.1")]);
        let peer: IpAddr = "192.0.2.10".parse().unwrap();
        let forwarded: IpAddr = "203.0.113.5".parse().unwrap();
        assert_eq!(extract_ip(&req, false), Some(peer));
        assert_eq!(extract_ip(&req, true), Some(forwarded));
    }

    #[test]
    fn garbage_forwarded_for_falls_back_to_peer() {
        let req = request(&[("x-forwarded-for", "not-an-ip")]);
        let peer: IpAddr = "192.0.2.10".parse().unwrap();
        assert_eq!(extract_ip(&req, true), Some(peer));
    }
}
