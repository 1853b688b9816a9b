//! Tower middleware that runs an admission check before the wrapped service.

use axum::{
    body::Body,
    response::{IntoResponse, Response},
    Json,
};
use futures::future::BoxFuture;
use http::{
    header::{HeaderName, RETRY_AFTER},
    HeaderMap, HeaderValue, Request, StatusCode,
};
use serde::Serialize;
use std::{
    sync::Arc,
    task::{Context, Poll},
    time::Instant,
};
use tower::{Layer, Service};
use tracing::{debug, warn};

use crate::{
    clock::{ceil_secs, wall_clock_at, Clock, SystemClock},
    decision::Decision,
    identity::IdentityExtractor,
    limiter::Limiter,
    metrics::Metrics,
};

pub const RATE_LIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const RATE_LIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const RATE_LIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

pub const REJECTION_ERROR: &str = "rate_limit_exceeded";
pub const REJECTION_MESSAGE: &str = "Too many requests. Please try again later.";

#[derive(Debug, Serialize)]
struct RejectionBody {
    error: &'static str,
    message: &'static str,
}

/// `429 Too Many Requests` response for a denied decision
#[derive(Debug, Clone, Copy)]
pub struct Rejection {
    decision: Decision,
    now: Instant,
}

impl Rejection {
    pub fn new(decision: Decision, now: Instant) -> Self {
        Self { decision, now }
    }
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        apply_rate_limit_headers(&mut headers, &self.decision, self.now);
        headers.insert(
            RETRY_AFTER,
            HeaderValue::from(ceil_secs(self.decision.retry_after(self.now))),
        );

        let body = RejectionBody {
            error: REJECTION_ERROR,
            message: REJECTION_MESSAGE,
        };

        (StatusCode::TOO_MANY_REQUESTS, headers, Json(body)).into_response()
    }
}

/// Write `X-RateLimit-Limit`, `X-RateLimit-Remaining` and `X-RateLimit-Reset` (unix seconds)
pub fn apply_rate_limit_headers(headers: &mut HeaderMap, decision: &Decision, now: Instant) {
    let reset = wall_clock_at(decision.reset_at, now).timestamp();
    headers.insert(RATE_LIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(RATE_LIMIT_REMAINING, HeaderValue::from(decision.remaining));
    headers.insert(RATE_LIMIT_RESET, HeaderValue::from(reset));
}

/// Layer applying an admission check with one limiter and one identity extractor
#[derive(Clone)]
pub struct AdmissionLayer {
    limiter: Arc<dyn Limiter>,
    extractor: Arc<dyn IdentityExtractor>,
    clock: Arc<dyn Clock>,
    metrics: Option<Metrics>,
}

impl AdmissionLayer {
    pub fn new(limiter: Arc<dyn Limiter>, extractor: Arc<dyn IdentityExtractor>) -> Self {
        Self {
            limiter,
            extractor,
            clock: Arc::new(SystemClock),
            metrics: None,
        }
    }

    /// Clock used to turn reset instants into headers; should match the limiter's
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

impl<S> Layer<S> for AdmissionLayer {
    type Service = AdmissionService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AdmissionService {
            inner,
            layer: self.clone(),
        }
    }
}

/// Service produced by [`AdmissionLayer`]
#[derive(Clone)]
pub struct AdmissionService<S> {
    inner: S,
    layer: AdmissionLayer,
}

impl<S> Service<Request<Body>> for AdmissionService<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        // Keep the service that was driven to readiness
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let layer = self.layer.clone();

        Box::pin(async move {
            let Some(identity) = layer.extractor.identity(&request) else {
                debug!(path = %request.uri().path(), "No identity for request, skipping admission check");
                return inner.call(request).await;
            };

            let backend = layer.limiter.backend();
            match layer.limiter.allow(&identity).await {
                Ok(decision) => {
                    if let Some(metrics) = &layer.metrics {
                        metrics.record_decision(backend, decision.allowed);
                    }
                    let now = layer.clock.now();

                    if !decision.allowed {
                        debug!(identity = %identity, backend, "Request rate limited");
                        return Ok(Rejection::new(decision, now).into_response());
                    }

                    let mut response = inner.call(request).await?;
                    apply_rate_limit_headers(response.headers_mut(), &decision, now);
                    Ok(response)
                }
                Err(e) => {
                    warn!(
                        identity = %identity,
                        backend,
                        error = %e,
                        "Rate limiter backend failed, allowing request"
                    );
                    if let Some(metrics) = &layer.metrics {
                        metrics.record_fail_open(backend);
                    }
                    inner.call(request).await
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_rejection_response() {
        let now = Instant::now();
        let decision = Decision::denied(5, now + Duration::from_millis(1200));
        let response = Rejection::new(decision, now).into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[RETRY_AFTER], "2");
        assert_eq!(response.headers()[RATE_LIMIT_REMAINING], "0");
        assert_eq!(response.headers()[RATE_LIMIT_LIMIT], "5");
        assert_eq!(
            response.headers()[http::header::CONTENT_TYPE],
            "application/json"
        );

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "rate_limit_exceeded");
        assert_eq!(json["message"], REJECTION_MESSAGE);
    }

    #[test]
    fn test_rate_limit_headers() {
        let now = Instant::now();
        let decision = Decision::allowed(3, 10, now + Duration::from_secs(30));
        let mut headers = HeaderMap::new();

        let before = chrono::Utc::now().timestamp();
        apply_rate_limit_headers(&mut headers, &decision, now);

        assert_eq!(headers[RATE_LIMIT_LIMIT], "10");
        assert_eq!(headers[RATE_LIMIT_REMAINING], "3");
        let reset: i64 = headers[RATE_LIMIT_RESET].to_str().unwrap().parse().unwrap();
        assert!(reset >= before + 29 && reset <= before + 31);
    }
}
