//! Admission endpoints for callers that cannot embed the middleware.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, instrument};

use super::middleware::{apply_quota_headers, throttled};
use crate::error::TurnstileError;
use crate::ratelimit::{PolicyRegistry, PolicyStats, Timestamp};

/// Body of a check request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckRequest {
    pub identifier: String,
}

/// Query string of a quota request. Any string is a valid identifier.
#[derive(Debug, Clone, Deserialize)]
pub struct QuotaQuery {
    pub identifier: String,
}

/// Read-only quota view for one identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaResponse {
    pub policy: String,
    pub identifier: String,
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: Timestamp,
}

/// Error surfaced to HTTP callers.
#[derive(Debug)]
pub struct ApiError(TurnstileError);

impl From<TurnstileError> for ApiError {
    fn from(err: TurnstileError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0 {
            TurnstileError::UnknownPolicy(_) => StatusCode::NOT_FOUND,
            _ => {
                error!(error = %self.0, "Admission request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = serde_json::json!({ "error": self.0.to_string() });
        (status, Json(body)).into_response()
    }
}

/// Build the admission router over `registry`.
pub fn router(registry: Arc<PolicyRegistry>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/policies", get(list_policies))
        .route("/v1/policies/{policy}/check", post(check))
        .route("/v1/policies/{policy}/quota", get(quota))
        .with_state(registry)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn list_policies(State(registry): State<Arc<PolicyRegistry>>) -> Json<Vec<PolicyStats>> {
    Json(registry.stats())
}

#[instrument(skip_all, fields(policy = %policy))]
async fn check(
    State(registry): State<Arc<PolicyRegistry>>,
    Path(policy): Path<String>,
    Json(request): Json<CheckRequest>,
) -> Result<Response, ApiError> {
    let limiter = registry.require(&policy)?;
    let decision = limiter.check(&request.identifier);

    debug!(allowed = decision.allowed, remaining = decision.remaining, "Admission decision made");

    if !decision.allowed {
        let body = serde_json::to_value(decision).unwrap_or_default();
        return Ok(throttled(&decision, limiter.now(), body));
    }

    let mut response = Json(decision).into_response();
    apply_quota_headers(response.headers_mut(), &decision);
    Ok(response)
}

async fn quota(
    State(registry): State<Arc<PolicyRegistry>>,
    Path(policy): Path<String>,
    Query(QuotaQuery { identifier }): Query<QuotaQuery>,
) -> Result<Json<QuotaResponse>, ApiError> {
    let limiter = registry.require(&policy)?;

    Ok(Json(QuotaResponse {
        limit: limiter.config().max_requests,
        remaining: limiter.get_remaining(&identifier),
        reset_at: limiter.get_reset_time(&identifier),
        policy,
        identifier,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{Decision, ManualClock, PolicySet, RateLimiterConfig};
    use axum::body::Body;
    use axum::http::{header, Request};
    use std::time::Duration;
    use tower::ServiceExt;

    const T0: Timestamp = 1_700_000_000_000;

    fn test_app() -> (Router, Arc<PolicyRegistry>, ManualClock) {
        let clock = ManualClock::new(T0);
        let policies = PolicySet::new()
            .with_policy("auth", RateLimiterConfig::new(2, Duration::from_secs(900)))
            .with_policy("api", RateLimiterConfig::new(20, Duration::from_secs(60)));
        let registry = Arc::new(PolicyRegistry::with_clock(&policies, Arc::new(clock.clone())).unwrap());
        (router(registry.clone()), registry, clock)
    }

    fn check_request(policy: &str, identifier: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(format!("/v1/policies/{}/check", policy))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::json!({ "identifier": identifier }).to_string()))
            .unwrap()
    }

    async fn body_json<T: serde::de::DeserializeOwned>(response: Response) -> T {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _, _) = test_app();

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json: serde_json::Value = body_json(response).await;
        assert_eq!(json["status"], "healthy");
    }

    #[tokio::test]
    async fn test_check_allows_then_throttles() {
        let (app, _, _) = test_app();

        for remaining in [1, 0] {
            let response = app.clone().oneshot(check_request("auth", "alice")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            let decision: Decision = body_json(response).await;
            assert!(decision.allowed);
            assert_eq!(decision.remaining, remaining);
            assert_eq!(decision.reset_at, T0 + 900_000);
        }

        let response = app.clone().oneshot(check_request("auth", "alice")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "900");
        let decision: Decision = body_json(response).await;
        assert!(!decision.allowed);

        // Same identifier under another policy has its own quota
        let response = app.oneshot(check_request("api", "alice")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_policy_is_404() {
        let (app, _, _) = test_app();

        let response = app.oneshot(check_request("uploads", "bob")).await.unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let json: serde_json::Value = body_json(response).await;
        assert_eq!(json["error"], "Unknown policy: uploads");
    }

    #[tokio::test]
    async fn test_quota_is_read_only() {
        let (app, registry, clock) = test_app();
        let api = registry.require("api").unwrap();
        api.is_allowed("carol");
        clock.advance(Duration::from_secs(5));

        let uri = "/v1/policies/api/quota?identifier=carol";
        for _ in 0..2 {
            let response = app
                .clone()
                .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            let quota: QuotaResponse = body_json(response).await;
            assert_eq!(
                quota,
                QuotaResponse {
                    policy: "api".to_string(),
                    identifier: "carol".to_string(),
                    limit: 20,
                    remaining: 19,
                    reset_at: T0 + 60_000,
                }
            );
        }
        assert_eq!(api.get_tracked_count(), 1);
    }

    #[tokio::test]
    async fn test_quota_accepts_any_identifier() {
        let (app, registry, _) = test_app();
        let api = registry.require("api").unwrap();
        api.is_allowed("");
        api.is_allowed("a/b");
        api.is_allowed("a/b");

        for (query, identifier, remaining) in [("", "", 19), ("a%2Fb", "a/b", 18)] {
            let uri = format!("/v1/policies/api/quota?identifier={}", query);
            let response = app
                .clone()
                .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);

            let quota: QuotaResponse = body_json(response).await;
            assert_eq!(quota.identifier, identifier);
            assert_eq!(quota.remaining, remaining);
        }
    }

    #[tokio::test]
    async fn test_quota_requires_identifier() {
        let (app, _, _) = test_app();

        let response = app
            .oneshot(Request::builder().uri("/v1/policies/api/quota").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_list_policies_reports_tracked_counts() {
        let (app, registry, _) = test_app();
        let auth = registry.require("auth").unwrap();
        auth.is_allowed("a");
        auth.is_allowed("b");

        let response = app
            .oneshot(Request::builder().uri("/v1/policies").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let stats: serde_json::Value = body_json(response).await;
        assert_eq!(stats[0]["name"], "api");
        assert_eq!(stats[0]["tracked_identifiers"], 0);
        assert_eq!(stats[1]["name"], "auth");
        assert_eq!(stats[1]["tracked_identifiers"], 2);
    }

    #[tokio::test]
    async fn test_malformed_check_body_rejected() {
        let (app, _, _) = test_app();

        let request = Request::builder()
            .method("POST")
            .uri("/v1/policies/api/check")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{\"who\": 1}"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert!(response.status().is_client_error());
    }
}
