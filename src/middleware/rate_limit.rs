use crate::algorithms::fixed_window::DEFAULT_SWEEP_INTERVAL;
use crate::algorithms::{FixedWindowLimiter, SlidingWindowRedisLimiter};
use crate::clock::{Clock, SystemClock};
use crate::{Policy, RateLimitConfig, RateLimitDecision, RateLimiter};
use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, Request, Response, StatusCode},
    middleware::Next,
};
use chrono::{DateTime, SecondsFormat, Utc};
use std::sync::Arc;
use tracing::warn;

/// What to do when the backing store cannot answer a rate limit check.
///
/// Open admits the request (the source system's behavior, but it hands an
/// attacker who can sever store connectivity an unlimited budget); Closed
/// rejects with 503. Auth-like policies may prefer Closed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    #[default]
    Open,
    Closed,
}

/// Shared state for the rate limiter middleware
#[derive(Clone)]
pub struct RateLimitState {
    policy: Policy,
    config: Arc<RateLimitConfig>,
    limiter: Arc<dyn RateLimiter>,
    failure_policy: FailurePolicy,
    key_override: Option<Arc<str>>,
    clock: Arc<dyn Clock>,
}

impl RateLimitState {
    /// Per-process fixed window limiter with a background sweep. Each
    /// instance enforces its own limit; use [`redis`](Self::redis) for
    /// cross-instance correctness. Must be called from within a tokio
    /// runtime so the sweep task can be spawned.
    pub fn in_memory(policy: Policy) -> Self {
        Self::with_limiter(policy, swept_fixed_window())
    }

    /// Sliding window limiter shared across instances through Redis.
    pub fn redis(policy: Policy, redis_url: &str) -> crate::error::Result<Self> {
        let limiter = SlidingWindowRedisLimiter::new(redis_url)?;
        Ok(Self::with_limiter(policy, Arc::new(limiter)))
    }

    /// Redis-backed when `REDIS_URL` is set and usable, in-memory otherwise.
    pub fn from_env(policy: Policy) -> Self {
        match std::env::var("REDIS_URL") {
            Ok(url) => match Self::redis(policy, &url) {
                Ok(state) => state,
                Err(e) => {
                    warn!(error = %e, "REDIS_URL is unusable, falling back to in-memory rate limiting");
                    Self::in_memory(policy)
                }
            },
            Err(_) => Self::in_memory(policy),
        }
    }

    /// Use an externally owned limiter, e.g. one fixed window limiter (and
    /// its sweeper) shared by several policy states.
    pub fn with_limiter(policy: Policy, limiter: Arc<dyn RateLimiter>) -> Self {
        Self {
            policy,
            config: Arc::new(policy.config()),
            limiter,
            failure_policy: FailurePolicy::default(),
            key_override: None,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_failure_policy(mut self, failure_policy: FailurePolicy) -> Self {
        self.failure_policy = failure_policy;
        self
    }

    /// Rate limit on a fixed identifier instead of the client IP.
    pub fn with_key_override(mut self, key: impl Into<Arc<str>>) -> Self {
        self.key_override = Some(key.into());
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn request_key(&self, request: &Request<Body>) -> String {
        if let Some(key) = &self.key_override {
            return key.to_string();
        }
        format!("{}:{}", self.policy.as_str(), extract_client_ip(request))
    }
}

fn swept_fixed_window() -> Arc<FixedWindowLimiter> {
    let limiter = Arc::new(FixedWindowLimiter::new());
    limiter.start_sweeper(DEFAULT_SWEEP_INTERVAL);
    limiter
}

/// Rate limiting middleware function
/// This runs BEFORE your route handlers
pub async fn rate_limit_middleware(
    State(state): State<RateLimitState>,
    request: Request<Body>,
    next: Next,
) -> Response<Body> {
    let key = state.request_key(&request);

    let decision = match state.limiter.check(&key, &state.config).await {
        Ok(decision) => decision,
        Err(e) => match state.failure_policy {
            FailurePolicy::Open => {
                warn!(policy = %state.policy.as_str(), error = %e, "rate limit store unavailable, failing open");
                return next.run(request).await;
            }
            FailurePolicy::Closed => {
                warn!(policy = %state.policy.as_str(), error = %e, "rate limit store unavailable, failing closed");
                return unavailable_response();
            }
        },
    };

    if decision.allowed {
        let mut response = next.run(request).await;
        apply_rate_limit_headers(response.headers_mut(), &state.config, &decision);
        response
    } else {
        denied_response(&state.config, &decision, state.clock.now_ms())
    }
}

/// Extract a client identifier from the request.
///
/// First X-Forwarded-For entry, then X-Real-IP, then "unknown". Both headers
/// are spoofable unless a trusted upstream proxy overwrites them.
fn extract_client_ip(request: &Request<Body>) -> String {
    request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.split(',').next())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .or_else(|| {
            request
                .headers()
                .get("x-real-ip")
                .and_then(|v| v.to_str().ok())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        })
        .unwrap_or_else(|| "unknown".to_string())
}

fn apply_rate_limit_headers(
    headers: &mut HeaderMap,
    config: &RateLimitConfig,
    decision: &RateLimitDecision,
) {
    headers.insert(
        "X-RateLimit-Limit",
        config
            .max_requests
            .to_string()
            .parse()
            .expect("valid header"),
    );
    headers.insert(
        "X-RateLimit-Remaining",
        decision.remaining.to_string().parse().expect("valid header"),
    );
    headers.insert(
        "X-RateLimit-Reset",
        iso_reset(decision.reset_ms).parse().expect("valid header"),
    );
}

fn denied_response(
    config: &RateLimitConfig,
    decision: &RateLimitDecision,
    now_ms: u64,
) -> Response<Body> {
    let body = serde_json::json!({ "error": config.message }).to_string();
    let mut response = Response::builder()
        .status(StatusCode::TOO_MANY_REQUESTS)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .expect("response build");

    let headers = response.headers_mut();
    apply_rate_limit_headers(headers, config, decision);
    headers.insert(
        "Retry-After",
        decision
            .retry_after_secs(now_ms)
            .to_string()
            .parse()
            .expect("valid header"),
    );
    response
}

fn unavailable_response() -> Response<Body> {
    let body = serde_json::json!({ "error": "Service temporarily unavailable" }).to_string();
    Response::builder()
        .status(StatusCode::SERVICE_UNAVAILABLE)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .expect("response build")
}

fn iso_reset(reset_ms: u64) -> String {
    DateTime::<Utc>::from_timestamp_millis(reset_ms as i64)
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_else(|| reset_ms.to_string())
}
