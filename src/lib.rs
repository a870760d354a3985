pub mod algorithms;
pub mod clock;
pub mod error;
pub mod lock;
pub mod middleware;

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

//configuration for a rate limiter
#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    //max requests allowed
    pub max_requests: u32,
    //time window
    pub window: Duration,
    //message returned to denied callers
    pub message: String,
}

impl RateLimitConfig {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            message: "Rate limit exceeded. Please try again later.".to_string(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn window_ms(&self) -> u64 {
        self.window.as_millis() as u64
    }
}

/// Named rate limit policies. The set is closed: an unknown policy name is a
/// construction-time error, never a silent fallthrough.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Policy {
    /// Login and credential endpoints: 5 requests per 15 minutes.
    Auth,
    /// General API traffic: 60 requests per minute.
    Api,
    /// Destructive or costly operations: 10 requests per hour.
    Sensitive,
    /// Contact forms: 5 requests per hour.
    Contact,
}

impl Policy {
    pub fn config(&self) -> RateLimitConfig {
        match self {
            Policy::Auth => RateLimitConfig::new(5, Duration::from_secs(900))
                .with_message("Too many authentication attempts. Please try again later."),
            Policy::Api => RateLimitConfig::new(60, Duration::from_secs(60))
                .with_message("Rate limit exceeded. Please slow down."),
            Policy::Sensitive => RateLimitConfig::new(10, Duration::from_secs(3600))
                .with_message("Too many requests for this operation. Please try again later."),
            Policy::Contact => RateLimitConfig::new(5, Duration::from_secs(3600))
                .with_message("Too many contact requests. Please try again later."),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Policy::Auth => "auth",
            Policy::Api => "api",
            Policy::Sensitive => "sensitive",
            Policy::Contact => "contact",
        }
    }
}

impl FromStr for Policy {
    type Err = RateGateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auth" => Ok(Policy::Auth),
            "api" => Ok(Policy::Api),
            "sensitive" => Ok(Policy::Sensitive),
            "contact" => Ok(Policy::Contact),
            other => Err(RateGateError::Config(format!(
                "unknown rate limit policy: {other}"
            ))),
        }
    }
}

/// Outcome of a rate limit check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    // whether the request is allowed
    pub allowed: bool,
    // remaining requests in the current window
    pub remaining: u32,
    // unix epoch ms at which the window resets
    pub reset_ms: u64,
}

impl RateLimitDecision {
    /// Seconds a denied caller should wait, rounded up. Never negative.
    pub fn retry_after_secs(&self, now_ms: u64) -> u64 {
        self.reset_ms.saturating_sub(now_ms).div_ceil(1000)
    }
}

//Core trait that all rate limiters must implement
#[async_trait::async_trait]
pub trait RateLimiter: Send + Sync {
    //check if a request is allowed for the given key
    //Err means the backing store could not answer; the caller picks the
    //fallback policy (fail open or fail closed), it is never a denial
    async fn check(&self, key: &str, config: &RateLimitConfig) -> error::Result<RateLimitDecision>;
}

//re-export main types
pub use algorithms::{FixedWindowLimiter, SlidingWindowRedisLimiter};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::RateGateError;
pub use lock::{DistributedLock, LockToken};
pub use middleware::{rate_limit_middleware, FailurePolicy, RateLimitState};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_table_matches_documented_limits() {
        let auth = Policy::Auth.config();
        assert_eq!(auth.max_requests, 5);
        assert_eq!(auth.window_ms(), 900_000);

        let api = Policy::Api.config();
        assert_eq!(api.max_requests, 60);
        assert_eq!(api.window_ms(), 60_000);

        let sensitive = Policy::Sensitive.config();
        assert_eq!(sensitive.max_requests, 10);
        assert_eq!(sensitive.window_ms(), 3_600_000);

        let contact = Policy::Contact.config();
        assert_eq!(contact.max_requests, 5);
        assert_eq!(contact.window_ms(), 3_600_000);
    }

    #[test]
    fn policy_round_trips_through_names() {
        for policy in [Policy::Auth, Policy::Api, Policy::Sensitive, Policy::Contact] {
            assert_eq!(policy.as_str().parse::<Policy>().unwrap(), policy);
        }
    }

    #[test]
    fn unknown_policy_name_is_an_error() {
        let err = "admin".parse::<Policy>().unwrap_err();
        assert!(matches!(err, RateGateError::Config(_)));
    }

    #[test]
    fn retry_after_rounds_up_and_never_underflows() {
        let decision = RateLimitDecision {
            allowed: false,
            remaining: 0,
            reset_ms: 10_500,
        };
        assert_eq!(decision.retry_after_secs(10_000), 1);
        assert_eq!(decision.retry_after_secs(9_400), 2);
        // reset already passed
        assert_eq!(decision.retry_after_secs(11_000), 0);
    }
}
