//! Per-request rate limit enforcement for axum.
//!
//! Every rejection, whether from a quota, a block, a storage failure or a
//! timeout, produces the same 429 response so clients cannot tell a
//! backend outage from a legitimate limit.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, FromRequestParts, Request, State};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

use crate::ratelimit::{Decision, RateLimiter};

/// Header carrying the client's access token.
pub const API_KEY_HEADER: &str = "api_key";
/// Header set on allowed responses with the requests left in the window.
pub const REMAINING_HEADER: &str = "x-ratelimit-remaining";
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";
pub const REAL_IP_HEADER: &str = "x-real-ip";

/// Address used when no client address can be determined.
pub const FALLBACK_CLIENT_IP: &str = "127.0.0.1";

/// Body message of every 429 response.
pub const REJECTION_MESSAGE: &str =
    "you have reached the maximum number of requests or actions allowed within a certain time frame";

/// Who is making a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    /// Client IP address
    pub ip: String,
    /// Access token, if a non-empty one was sent
    pub token: Option<String>,
}

impl ClientIdentity {
    /// Extract the client from request headers and the transport peer.
    ///
    /// The IP comes from the first `X-Forwarded-For` entry, then
    /// `X-Real-IP`, then the peer address, then the loopback address.
    pub fn from_headers(headers: &HeaderMap, peer: Option<SocketAddr>) -> Self {
        let ip = forwarded_for(headers)
            .or_else(|| header_str(headers, REAL_IP_HEADER))
            .or_else(|| peer.map(|addr| addr.ip().to_string()))
            .unwrap_or_else(|| FALLBACK_CLIENT_IP.to_string());

        let token = header_str(headers, API_KEY_HEADER);

        Self { ip, token }
    }
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn forwarded_for(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(FORWARDED_FOR_HEADER)?.to_str().ok()?;
    value
        .split(',')
        .next()
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .map(str::to_string)
}

fn peer_addr(extensions: &axum::http::Extensions) -> Option<SocketAddr> {
    extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr)
}

impl<S> FromRequestParts<S> for ClientIdentity
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        if let Some(client) = parts.extensions.get::<ClientIdentity>() {
            return Ok(client.clone());
        }
        Ok(Self::from_headers(&parts.headers, peer_addr(&parts.extensions)))
    }
}

/// State for [`rate_limit_middleware`].
#[derive(Clone)]
pub struct RateLimitState {
    limiter: Arc<RateLimiter>,
    check_timeout: Duration,
}

impl RateLimitState {
    /// Create middleware state bounding each limiter call by `check_timeout`.
    pub fn new(limiter: Arc<RateLimiter>, check_timeout: Duration) -> Self {
        Self {
            limiter,
            check_timeout,
        }
    }
}

/// Rate limiting middleware.
///
/// Denied or failed checks answer 429 without running the inner handler.
/// Allowed requests get an `X-RateLimit-Remaining` response header when the
/// remaining count can be read.
pub async fn rate_limit_middleware(
    State(state): State<RateLimitState>,
    mut req: Request,
    next: Next,
) -> Response {
    let client = ClientIdentity::from_headers(req.headers(), peer_addr(req.extensions()));
    let span = info_span!(
        "rate_limit",
        request_id = %Uuid::new_v4(),
        ip = %client.ip,
        has_token = client.token.is_some()
    );

    async move {
        let token = client.token.as_deref();
        let checked = tokio::time::timeout(
            state.check_timeout,
            state.limiter.check_request(&client.ip, token),
        )
        .await;

        match checked {
            Ok(Ok(Decision::Allowed)) => {}
            Ok(Ok(Decision::Denied(denial))) => {
                warn!(reason = %denial, "Request denied");
                return reject();
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Rate limit check failed, rejecting request");
                return reject();
            }
            Err(_) => {
                warn!(
                    timeout_ms = state.check_timeout.as_millis() as u64,
                    "Rate limit check timed out, rejecting request"
                );
                return reject();
            }
        }

        let remaining = tokio::time::timeout(
            state.check_timeout,
            state.limiter.get_remaining_requests(&client.ip, token),
        )
        .await;

        req.extensions_mut().insert(client.clone());
        let mut response = next.run(req).await;

        match remaining {
            Ok(Ok(remaining)) => {
                response
                    .headers_mut()
                    .insert(HeaderName::from_static(REMAINING_HEADER), HeaderValue::from(remaining));
            }
            Ok(Err(e)) => debug!(error = %e, "Remaining requests unavailable"),
            Err(_) => debug!("Remaining requests lookup timed out"),
        }

        response
    }
    .instrument(span)
    .await
}

fn reject() -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        Json(json!({ "error": REJECTION_MESSAGE })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(*value));
        }
        map
    }

    fn peer() -> Option<SocketAddr> {
        Some("198.51.100.9:41000".parse().unwrap())
    }

    #[test]
    fn test_forwarded_for_first_entry_wins() {
        let map = headers(&[
            ("x-forwarded-for", " 203.0.113.5 , 10.0.0.1"),
            ("x-real-ip", "192.0.2.44"),
        ]);

        assert_eq!(ClientIdentity::from_headers(&map, peer()).ip, "203.0.113.5");
    }

    #[test]
    fn test_real_ip_before_peer() {
        let map = headers(&[("x-real-ip", "192.0.2.44")]);
        assert_eq!(ClientIdentity::from_headers(&map, peer()).ip, "192.0.2.44");
    }

    #[test]
    fn test_peer_address() {
        let client = ClientIdentity::from_headers(&HeaderMap::new(), peer());
        assert_eq!(client.ip, "198.51.100.9");
        assert_eq!(client.token, None);
    }

    #[test]
    fn test_fallback_to_loopback() {
        let client = ClientIdentity::from_headers(&HeaderMap::new(), None);
        assert_eq!(client.ip, FALLBACK_CLIENT_IP);
    }

    #[test]
    fn test_empty_forwarded_for_falls_through() {
        let map = headers(&[("x-forwarded-for", " , 10.0.0.1")]);
        assert_eq!(ClientIdentity::from_headers(&map, peer()).ip, "198.51.100.9");
    }

    #[test]
    fn test_token_header() {
        let map = headers(&[("api_key", "abc")]);
        assert_eq!(
            ClientIdentity::from_headers(&map, None).token.as_deref(),
            Some("abc")
        );

        let map = headers(&[("api_key", "")]);
        assert_eq!(ClientIdentity::from_headers(&map, None).token, None);
    }
}
