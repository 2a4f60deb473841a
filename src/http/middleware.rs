//! Tower middleware that runs an admission check before each request.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::extract::{ConnectInfo, Request};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::future::BoxFuture;
use serde_json::json;
use tower::{Layer, Service};
use tracing::{debug, warn};

use crate::config::{AdmissionConfig, FailMode};
use crate::error::{Result, WardenError};
use crate::ratelimit::{now_ms, AdmissionBackend, Decision, Identity, RequestContext};

pub const X_RATELIMIT_LIMIT: &str = "x-ratelimit-limit";
pub const X_RATELIMIT_REMAINING: &str = "x-ratelimit-remaining";
pub const X_RATELIMIT_RESET: &str = "x-ratelimit-reset";
pub const RETRY_AFTER: &str = "retry-after";

const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Layer that guards the wrapped service with one named policy.
#[derive(Clone)]
pub struct RateLimitLayer {
    backend: Arc<dyn AdmissionBackend>,
    policy: Arc<str>,
    admission: AdmissionConfig,
}

impl RateLimitLayer {
    /// Create a layer for `policy`.
    ///
    /// Fails if the backend does not know the policy, so a typo surfaces at
    /// startup instead of on the first request.
    pub fn new(
        backend: Arc<dyn AdmissionBackend>,
        policy: &str,
        admission: &AdmissionConfig,
    ) -> Result<Self> {
        if !backend.has_policy(policy) {
            return Err(WardenError::UnknownPolicy(policy.to_string()));
        }

        Ok(Self {
            backend,
            policy: Arc::from(policy),
            admission: admission.clone(),
        })
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            backend: self.backend.clone(),
            policy: self.policy.clone(),
            admission: self.admission.clone(),
        }
    }
}

/// Service produced by [`RateLimitLayer`].
#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    backend: Arc<dyn AdmissionBackend>,
    policy: Arc<str>,
    admission: AdmissionConfig,
}

impl<S> Service<Request> for RateLimitService<S>
where
    S: Service<Request, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, std::result::Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request) -> Self::Future {
        // Take the service that was polled ready and leave a fresh clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let backend = self.backend.clone();
        let policy = self.policy.clone();
        let admission = self.admission.clone();

        Box::pin(async move {
            let ctx = request_context(&request, admission.trust_forwarded_for);

            match backend.check(&policy, &ctx).await {
                Ok(decision) if decision.allowed => {
                    let mut response = inner.call(request).await?;
                    apply_quota_headers(response.headers_mut(), &decision);
                    Ok(response)
                }
                Ok(decision) => {
                    debug!(
                        policy = %policy,
                        remote_addr = ?ctx.remote_addr,
                        identity = ?ctx.identity,
                        "Request throttled"
                    );
                    Ok(throttled_response(&decision, now_ms()))
                }
                Err(e) => match admission.fail_mode {
                    FailMode::Open => {
                        warn!(policy = %policy, error = %e, "Admission check failed, failing open");
                        inner.call(request).await
                    }
                    FailMode::Closed => {
                        warn!(policy = %policy, error = %e, "Admission check failed, failing closed");
                        Ok(unavailable_response())
                    }
                },
            }
        })
    }
}

/// Build the subject-derivation context for a request.
pub fn request_context(request: &Request, trust_forwarded_for: bool) -> RequestContext {
    let forwarded = if trust_forwarded_for {
        forwarded_for(request.headers())
    } else {
        None
    };

    let remote_addr = forwarded.or_else(|| {
        request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ci| ci.0.ip())
    });
    let identity = request.extensions().get::<Identity>().map(|id| id.0.clone());

    RequestContext::new(remote_addr, identity)
}

/// First address in `X-Forwarded-For`, the original client.
fn forwarded_for(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get(X_FORWARDED_FOR)?
        .to_str()
        .ok()?
        .split(',')
        .next()?
        .trim()
        .parse()
        .ok()
}

/// Attach the quota headers carried by every checked response.
pub fn apply_quota_headers(headers: &mut HeaderMap, decision: &Decision) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(decision.reset_at_secs()));
}

fn throttled_response(decision: &Decision, now_ms: u64) -> Response {
    let body = json!({
        "message": "Too many requests",
        "statusCode": 429,
    });

    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    let headers = response.headers_mut();
    apply_quota_headers(headers, decision);
    headers.insert(RETRY_AFTER, HeaderValue::from(decision.retry_after_secs(now_ms)));
    response
}

fn unavailable_response() -> Response {
    let body = json!({
        "message": "Service unavailable",
        "statusCode": 503,
    });
    (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::registry::{AI_GENERATION, AUTH, GENERAL};
    use crate::ratelimit::{PolicyRegistry, RateLimiter};
    use crate::store::MemoryCounterStore;
    use axum::body::Body;
    use axum::routing::get;
    use axum::Router;
    use tower::ServiceExt;

    fn create_backend() -> (Arc<MemoryCounterStore>, Arc<dyn AdmissionBackend>) {
        let store = Arc::new(MemoryCounterStore::new());
        let limiter = RateLimiter::new(store.clone(), PolicyRegistry::with_defaults().unwrap());
        (store, Arc::new(limiter))
    }

    fn guarded_app(backend: Arc<dyn AdmissionBackend>, policy: &str, admission: AdmissionConfig) -> Router {
        let layer = RateLimitLayer::new(backend, policy, &admission).unwrap();
        Router::new().route("/", get(|| async { "ok" })).layer(layer)
    }

    fn request_from(addr: [u8; 4]) -> Request {
        let mut request = axum::http::Request::builder().uri("/").body(Body::empty()).unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from((addr, 40_000))));
        request
    }

    fn header(response: &Response, name: &str) -> String {
        response.headers()[name].to_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_unknown_policy_rejected_at_construction() {
        let (_, backend) = create_backend();
        let result = RateLimitLayer::new(backend, "missing", &AdmissionConfig::default());
        assert!(matches!(result, Err(WardenError::UnknownPolicy(_))));
    }

    #[tokio::test]
    async fn test_allowed_request_gets_headers() {
        let (_, backend) = create_backend();
        let app = guarded_app(backend, GENERAL, AdmissionConfig::default());

        let response = app.oneshot(request_from([10, 0, 0, 1])).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header(&response, X_RATELIMIT_LIMIT), "100");
        assert_eq!(header(&response, X_RATELIMIT_REMAINING), "99");
        let reset: u64 = header(&response, X_RATELIMIT_RESET).parse().unwrap();
        assert!(reset * 1000 > now_ms());
        assert!(response.headers().get(RETRY_AFTER).is_none());
    }

    #[tokio::test]
    async fn test_denied_request_gets_429() {
        let (_, backend) = create_backend();
        let app = guarded_app(backend, AUTH, AdmissionConfig::default());

        for _ in 0..5 {
            let response = app.clone().oneshot(request_from([10, 0, 0, 2])).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = app.clone().oneshot(request_from([10, 0, 0, 2])).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(header(&response, X_RATELIMIT_LIMIT), "5");
        assert_eq!(header(&response, X_RATELIMIT_REMAINING), "0");
        assert!(response.headers().contains_key(X_RATELIMIT_RESET));
        let retry: u64 = header(&response, RETRY_AFTER).parse().unwrap();
        assert!((1..=900).contains(&retry));

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body, json!({ "message": "Too many requests", "statusCode": 429 }));

        // A different caller is unaffected.
        let response = app.oneshot(request_from([10, 0, 0, 3])).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_store_outage_fails_open() {
        let (store, backend) = create_backend();
        store.set_available(false);
        let app = guarded_app(backend, AUTH, AdmissionConfig::default());

        for _ in 0..10 {
            let response = app.clone().oneshot(request_from([10, 0, 0, 4])).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert!(response.headers().get(X_RATELIMIT_LIMIT).is_none());
        }
    }

    #[tokio::test]
    async fn test_store_outage_fails_closed_when_configured() {
        let (store, backend) = create_backend();
        store.set_available(false);
        let admission = AdmissionConfig {
            fail_mode: FailMode::Closed,
            ..AdmissionConfig::default()
        };
        let app = guarded_app(backend, GENERAL, admission);

        let response = app.oneshot(request_from([10, 0, 0, 5])).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_identity_shares_quota_across_addresses() {
        let (_, backend) = create_backend();
        let app = guarded_app(backend, AI_GENERATION, AdmissionConfig::default());

        let with_identity = |addr: [u8; 4]| {
            let mut request = request_from(addr);
            request.extensions_mut().insert(Identity("dave".to_string()));
            request
        };

        app.clone().oneshot(with_identity([10, 0, 1, 1])).await.unwrap();
        let response = app.oneshot(with_identity([10, 0, 1, 2])).await.unwrap();

        assert_eq!(header(&response, X_RATELIMIT_REMAINING), "48");
    }

    #[test]
    fn test_forwarded_for_only_when_trusted() {
        let mut request = request_from([10, 0, 0, 9]);
        request
            .headers_mut()
            .insert(X_FORWARDED_FOR, HeaderValue::from_static("203.0.113.7, 10.0.0.9"));

        let untrusted = request_context(&request, false);
        assert_eq!(untrusted.remote_addr, Some("10.0.0.9".parse().unwrap()));

        let trusted = request_context(&request, true);
        assert_eq!(trusted.remote_addr, Some("203.0.113.7".parse().unwrap()));
    }

    #[test]
    fn test_missing_connect_info() {
        let request = axum::http::Request::builder().uri("/").body(Body::empty()).unwrap();
        let ctx = request_context(&request, false);
        assert_eq!(ctx, RequestContext::default());
    }
}
