mod rate_limit;

pub use rate_limit::rate_limit_middleware;
pub use rate_limit::FailurePolicy;
pub use rate_limit::RateLimitState;
