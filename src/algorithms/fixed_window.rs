use dashmap::DashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::clock::{Clock, SystemClock};
use crate::{RateLimitConfig, RateLimitDecision, RateLimiter};

/// How often the background sweep runs unless the caller picks an interval.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
struct WindowEntry {
    count: u32,
    reset_ms: u64,
}

/// Fixed window rate limiter backed by an in-process map.
///
/// The counter for a key lives until its window passes; over-limit calls
/// never extend the window, only the natural boundary resets it. State is
/// per-instance and per-process: horizontally scaled deployments each
/// enforce their own limit. Callers that need cross-instance correctness
/// use [`SlidingWindowRedisLimiter`](crate::SlidingWindowRedisLimiter).
pub struct FixedWindowLimiter {
    entries: Arc<DashMap<String, WindowEntry>>,
    clock: Arc<dyn Clock>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl FixedWindowLimiter {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            clock,
            sweeper: Mutex::new(None),
        }
    }

    /// Check and record one request for `key`.
    ///
    /// Synchronous on purpose: the read-modify-write must not be split
    /// across an await point, or interleaved requests could both observe
    /// the same count.
    pub fn check(&self, key: &str, config: &RateLimitConfig) -> RateLimitDecision {
        let now = self.clock.now_ms();
        let max = config.max_requests;

        let mut entry = self.entries.entry(key.to_string()).or_insert(WindowEntry {
            count: 0,
            reset_ms: now + config.window_ms(),
        });

        if now > entry.reset_ms {
            entry.count = 0;
            entry.reset_ms = now + config.window_ms();
        }

        entry.count = entry.count.saturating_add(1);
        let allowed = entry.count <= max;
        if !allowed {
            debug!(key = %key, count = entry.count, limit = max, "fixed window limit exceeded");
        }

        RateLimitDecision {
            allowed,
            remaining: max.saturating_sub(entry.count),
            reset_ms: entry.reset_ms,
        }
    }

    /// Drop every entry whose window has already passed. Returns how many
    /// entries were removed.
    pub fn sweep(&self) -> usize {
        sweep_expired(&self.entries, self.clock.now_ms())
    }

    /// Spawn the periodic garbage-collection task.
    ///
    /// The task is owned by this limiter: it stops on [`shutdown`](Self::shutdown)
    /// or when the limiter is dropped. Calling this again replaces the
    /// previous task.
    pub fn start_sweeper(&self, interval: Duration) {
        let entries = Arc::clone(&self.entries);
        let clock = Arc::clone(&self.clock);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = sweep_expired(&entries, clock.now_ms());
                if removed > 0 {
                    debug!(removed, "swept expired rate limit entries");
                }
            }
        });

        if let Ok(mut sweeper) = self.sweeper.lock() {
            if let Some(old) = sweeper.replace(handle) {
                old.abort();
            }
        }
    }

    /// Stop the background sweep, if one is running.
    pub fn shutdown(&self) {
        if let Ok(mut sweeper) = self.sweeper.lock() {
            if let Some(handle) = sweeper.take() {
                handle.abort();
            }
        }
    }

    /// Whether the background sweep task is currently running.
    pub fn sweeper_running(&self) -> bool {
        self.sweeper
            .lock()
            .map(|sweeper| sweeper.as_ref().is_some_and(|handle| !handle.is_finished()))
            .unwrap_or(false)
    }

    /// Number of tracked keys, live or awaiting sweep.
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

fn sweep_expired(entries: &DashMap<String, WindowEntry>, now: u64) -> usize {
    let before = entries.len();
    entries.retain(|_, entry| entry.reset_ms >= now);
    before.saturating_sub(entries.len())
}

impl Drop for FixedWindowLimiter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Default for FixedWindowLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl RateLimiter for FixedWindowLimiter {
    async fn check(
        &self,
        key: &str,
        config: &RateLimitConfig,
    ) -> crate::error::Result<RateLimitDecision> {
        Ok(FixedWindowLimiter::check(self, key, config))
    }
}
