use std::sync::Arc;

use redis::aio::MultiplexedConnection;
use tracing::debug;

use crate::clock::{Clock, SystemClock};
use crate::error::Result;
use crate::{RateLimitConfig, RateLimitDecision, RateLimiter};

/// Prune, count, and conditionally record a request in one server-side step.
///
/// KEYS[1] sorted set for the rate limit key
/// ARGV[1] window start (ms); members scored strictly below are expired
/// ARGV[2] max requests per window
/// ARGV[3] score for the current request (now, ms)
/// ARGV[4] unique member for the current request
/// ARGV[5] window length (ms), used as the key TTL
///
/// Returns {1, count, 0} when admitted, {0, count, oldest_score} when denied.
/// Denied requests are not recorded, so a saturated window drains as its
/// oldest members expire rather than being pinned by rejected traffic.
const CHECK_SCRIPT: &str = r#"
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', '(' .. ARGV[1])
local count = redis.call('ZCARD', KEYS[1])
if count < tonumber(ARGV[2]) then
    redis.call('ZADD', KEYS[1], ARGV[3], ARGV[4])
    redis.call('PEXPIRE', KEYS[1], ARGV[5])
    return {1, count, 0}
end
local oldest = redis.call('ZRANGE', KEYS[1], 0, 0, 'WITHSCORES')
return {0, count, tonumber(oldest[2]) or 0}
"#;

/// Exact sliding window rate limiter shared across processes via Redis.
///
/// Each admitted request is one member of a per-key sorted set, scored by its
/// arrival time. The prune/count/record sequence runs as a single atomic
/// script so two simultaneous requests can never both read a stale count.
/// Idle keys self-expire after one window.
pub struct SlidingWindowRedisLimiter {
    client: redis::Client,
    script: redis::Script,
    clock: Arc<dyn Clock>,
}

impl SlidingWindowRedisLimiter {
    /// url: "redis://127.0.0.1:6379"
    pub fn new(url: &str) -> Result<Self> {
        Self::with_clock(url, Arc::new(SystemClock))
    }

    pub fn with_clock(url: &str, clock: Arc<dyn Clock>) -> Result<Self> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            client,
            script: redis::Script::new(CHECK_SCRIPT),
            clock,
        })
    }

    async fn connection(&self) -> Result<MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    fn build_key(&self, key: &str) -> String {
        format!("ratelimit:{}", key)
    }

    /// Check and record one request for `key`.
    ///
    /// `Err` means the store could not answer (unreachable, or a reply that
    /// did not have the expected shape); the caller decides whether that
    /// fails open or closed.
    pub async fn check_window(
        &self,
        key: &str,
        window_ms: u64,
        max_requests: u32,
    ) -> Result<RateLimitDecision> {
        let mut conn = self.connection().await?;

        let now = self.clock.now_ms();
        let window_start = now.saturating_sub(window_ms);
        // unique member even when two requests land on the same millisecond
        let member = format!("{}-{:08x}", now, rand::random::<u32>());

        let (admitted, count, oldest_score): (i64, u32, u64) = self
            .script
            .key(self.build_key(key))
            .arg(window_start)
            .arg(max_requests)
            .arg(now)
            .arg(&member)
            .arg(window_ms)
            .invoke_async(&mut conn)
            .await?;

        if admitted == 1 {
            Ok(RateLimitDecision {
                allowed: true,
                remaining: max_requests.saturating_sub(count + 1),
                reset_ms: now + window_ms,
            })
        } else {
            debug!(key = %key, count, limit = max_requests, "sliding window limit exceeded");
            let reset_ms = if oldest_score > 0 {
                oldest_score + window_ms
            } else {
                now + window_ms
            };
            Ok(RateLimitDecision {
                allowed: false,
                remaining: 0,
                reset_ms,
            })
        }
    }
}

#[async_trait::async_trait]
impl RateLimiter for SlidingWindowRedisLimiter {
    async fn check(&self, key: &str, config: &RateLimitConfig) -> Result<RateLimitDecision> {
        self.check_window(key, config.window_ms(), config.max_requests)
            .await
    }
}
