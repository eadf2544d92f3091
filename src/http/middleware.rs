//! Axum middleware that admits or throttles requests through a limiter.
//!
//! ```ignore
//! let guard = RateLimitGuard::new(registry.require(AUTH_POLICY)?, KeySource::PeerIp);
//! let app = Router::new()
//!     .route("/login", post(login))
//!     .layer(axum::middleware::from_fn_with_state(guard, enforce));
//! ```
//!
//! Forwarded headers are client controlled. They are only read when the
//! connecting peer is a listed proxy (`KeySource::ForwardedFor`).

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::debug;

use crate::ratelimit::{Decision, RateLimiter, Timestamp};

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_REAL_IP: &str = "x-real-ip";
const UNKNOWN_CLIENT: &str = "unknown";

/// Where the caller identifier comes from.
#[derive(Debug, Clone)]
pub enum KeySource {
    /// The connecting peer address from `ConnectInfo`.
    PeerIp,
    /// First `x-forwarded-for` hop, then `x-real-ip`, but only when the
    /// peer is one of `trusted_proxies`. Any other peer is keyed by its own
    /// address.
    ForwardedFor { trusted_proxies: Vec<IpAddr> },
    /// A request header such as a user or API key; falls back to the peer
    /// address.
    Header(HeaderName),
}

impl KeySource {
    /// Derive the identifier for `request`.
    pub fn identify(&self, request: &Request) -> String {
        let peer = peer_ip(request);
        match self {
            KeySource::PeerIp => peer_or_unknown(peer),
            KeySource::ForwardedFor { trusted_proxies } => match peer {
                Some(ip) if trusted_proxies.contains(&ip) => {
                    forwarded_ip(request.headers()).unwrap_or_else(|| ip.to_string())
                }
                _ => peer_or_unknown(peer),
            },
            KeySource::Header(name) => header_str(request.headers(), name.as_str())
                .map(str::to_owned)
                .unwrap_or_else(|| peer_or_unknown(peer)),
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn peer_ip(request: &Request) -> Option<IpAddr> {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
}

fn peer_or_unknown(peer: Option<IpAddr>) -> String {
    peer.map(|ip| ip.to_string())
        .unwrap_or_else(|| UNKNOWN_CLIENT.to_owned())
}

fn forwarded_ip(headers: &HeaderMap) -> Option<String> {
    header_str(headers, X_FORWARDED_FOR)
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .or_else(|| header_str(headers, X_REAL_IP))
        .map(str::to_owned)
}

/// Middleware state: the limiter to consult and how to key callers.
#[derive(Debug, Clone)]
pub struct RateLimitGuard {
    limiter: Arc<RateLimiter>,
    key_source: KeySource,
}

impl RateLimitGuard {
    pub fn new(limiter: Arc<RateLimiter>, key_source: KeySource) -> Self {
        Self {
            limiter,
            key_source,
        }
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }
}

/// Admit the request or answer `429 Too Many Requests`.
///
/// Use with `axum::middleware::from_fn_with_state`.
pub async fn enforce(State(guard): State<RateLimitGuard>, request: Request, next: Next) -> Response {
    let identifier = guard.key_source.identify(&request);
    let decision = guard.limiter.check(&identifier);

    if !decision.allowed {
        debug!(
            path = %request.uri().path(),
            reset_at = decision.reset_at,
            "Throttling request"
        );
        let body = serde_json::json!({
            "error": "too many requests",
            "retry_after_secs": decision.retry_after(guard.limiter.now()).as_secs(),
        });
        return throttled(&decision, guard.limiter.now(), body);
    }

    let mut response = next.run(request).await;
    apply_quota_headers(response.headers_mut(), &decision);
    response
}

/// Build a 429 response with quota and `Retry-After` headers.
pub(crate) fn throttled(decision: &Decision, now: Timestamp, body: serde_json::Value) -> Response {
    let retry_after = decision.retry_after(now).as_secs();
    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    let headers = response.headers_mut();
    apply_quota_headers(headers, decision);
    headers.insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
    response
}

/// Attach `x-ratelimit-*` headers. The reset header is in epoch seconds.
pub(crate) fn apply_quota_headers(headers: &mut HeaderMap, decision: &Decision) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(decision.reset_at.div_ceil(1_000)));
}
