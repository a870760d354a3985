use std::sync::Arc;
use std::time::Duration;

use redis::aio::MultiplexedConnection;
use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::Result;

/// Delete the lock key only while it still holds our token. A plain GET then
/// DEL would race with TTL expiry: the lock could expire and be re-acquired
/// between the two calls, and we would delete the new holder's lock.
const RELEASE_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
else
    return 0
end
"#;

/// Proof of lock ownership. Only the caller holding the token minted by a
/// successful acquire can release that lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken(String);

impl LockToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Cross-process mutual exclusion over Redis.
///
/// `acquire` is non-blocking: a held lock returns `None` immediately and
/// callers bring their own retry policy (or use [`acquire_with_retry`](Self::acquire_with_retry)).
/// The TTL is a safety net against crashed holders; if it fires before
/// release, the lock simply becomes available again and the original
/// holder's release no-ops.
///
/// Store errors are logged and mapped to the "not acquired" / "not released"
/// outcome, since a caller that cannot reach the store must not proceed
/// assuming exclusivity anyway.
pub struct DistributedLock {
    client: redis::Client,
    release_script: redis::Script,
    clock: Arc<dyn Clock>,
}

impl DistributedLock {
    /// url: "redis://127.0.0.1:6379"
    pub fn new(url: &str) -> Result<Self> {
        Self::with_clock(url, Arc::new(SystemClock))
    }

    pub fn with_clock(url: &str, clock: Arc<dyn Clock>) -> Result<Self> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            client,
            release_script: redis::Script::new(RELEASE_SCRIPT),
            clock,
        })
    }

    async fn connection(&self) -> Result<MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    fn build_key(&self, name: &str) -> String {
        format!("lock:{}", name)
    }

    /// Try to take the lock. `None` means it is already held, or the store
    /// could not be reached; the two are deliberately indistinguishable here.
    pub async fn acquire(&self, name: &str, ttl: Duration) -> Option<LockToken> {
        let token = format!("{}-{:016x}", self.clock.now_ms(), rand::random::<u64>());

        match self.try_acquire(name, &token, ttl).await {
            Ok(true) => {
                debug!(lock = %name, "lock acquired");
                Some(LockToken(token))
            }
            Ok(false) => None,
            Err(e) => {
                warn!(lock = %name, error = %e, "lock acquire failed, treating as held");
                None
            }
        }
    }

    async fn try_acquire(&self, name: &str, token: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.connection().await?;

        // SET NX PX: create only if absent, with a millisecond TTL
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.build_key(name))
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;

        Ok(reply.is_some())
    }

    /// Release the lock if `token` still owns it. Returns false when the
    /// token no longer matches (TTL expired and someone else re-acquired,
    /// or it was never ours) or the store is unreachable.
    pub async fn release(&self, name: &str, token: &LockToken) -> bool {
        match self.try_release(name, token).await {
            Ok(released) => {
                if released {
                    debug!(lock = %name, "lock released");
                }
                released
            }
            Err(e) => {
                warn!(lock = %name, error = %e, "lock release failed");
                false
            }
        }
    }

    async fn try_release(&self, name: &str, token: &LockToken) -> Result<bool> {
        let mut conn = self.connection().await?;

        let deleted: i64 = self
            .release_script
            .key(self.build_key(name))
            .arg(token.as_str())
            .invoke_async(&mut conn)
            .await?;

        Ok(deleted == 1)
    }

    /// Poll `acquire` until it succeeds or `max_wait` elapses. The primitive
    /// itself stays non-blocking; this is just a convenience loop.
    pub async fn acquire_with_retry(
        &self,
        name: &str,
        ttl: Duration,
        max_wait: Duration,
    ) -> Option<LockToken> {
        let poll_interval = Duration::from_millis(50);
        let deadline = tokio::time::Instant::now() + max_wait;

        loop {
            if let Some(token) = self.acquire(name, ttl).await {
                return Some(token);
            }
            if tokio::time::Instant::now() + poll_interval > deadline {
                return None;
            }
            tokio::time::sleep(poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_lock_name(prefix: &str) -> String {
        format!("{}:{:08x}", prefix, rand::random::<u32>())
    }

    #[tokio::test]
    async fn unreachable_store_means_not_acquired() {
        let lock = DistributedLock::new("redis://127.0.0.1:1/").unwrap();
        let token = lock.acquire("refresh-cache", Duration::from_secs(5)).await;
        assert!(token.is_none());
    }

    #[tokio::test]
    async fn unreachable_store_means_not_released() {
        let lock = DistributedLock::new("redis://127.0.0.1:1/").unwrap();
        let token = LockToken("0-deadbeef".to_string());
        assert!(!lock.release("refresh-cache", &token).await);
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn second_acquire_fails_until_release() {
        let lock = DistributedLock::new("redis://127.0.0.1:6379").unwrap();
        let name = test_lock_name("exclusive");

        let t1 = lock.acquire(&name, Duration::from_secs(5)).await;
        assert!(t1.is_some());
        assert!(lock.acquire(&name, Duration::from_secs(5)).await.is_none());

        assert!(lock.release(&name, &t1.unwrap()).await);

        let t2 = lock.acquire(&name, Duration::from_secs(5)).await;
        assert!(t2.is_some());
        lock.release(&name, &t2.unwrap()).await;
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn concurrent_acquires_yield_a_single_holder() {
        let lock = Arc::new(DistributedLock::new("redis://127.0.0.1:6379").unwrap());
        let name = test_lock_name("race");

        let mut handles = Vec::new();
        for _ in 0..10 {
            let lock = Arc::clone(&lock);
            let name = name.clone();
            handles.push(tokio::spawn(async move {
                lock.acquire(&name, Duration::from_secs(5)).await
            }));
        }

        let mut winners = Vec::new();
        for handle in handles {
            if let Some(token) = handle.await.unwrap() {
                winners.push(token);
            }
        }
        assert_eq!(winners.len(), 1);

        lock.release(&name, &winners[0]).await;
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn stale_release_does_not_steal_the_new_holders_lock() {
        let lock = DistributedLock::new("redis://127.0.0.1:6379").unwrap();
        let name = test_lock_name("ttl");

        let t1 = lock.acquire(&name, Duration::from_millis(100)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        // t1 has expired; a new holder takes over
        let t2 = lock.acquire(&name, Duration::from_secs(5)).await.unwrap();

        // the stale token must not delete the new holder's lock
        assert!(!lock.release(&name, &t1).await);
        assert!(lock.release(&name, &t2).await);
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn acquire_with_retry_waits_for_release() {
        let lock = Arc::new(DistributedLock::new("redis://127.0.0.1:6379").unwrap());
        let name = test_lock_name("retry");

        let t1 = lock.acquire(&name, Duration::from_secs(5)).await.unwrap();

        let waiter = {
            let lock = Arc::clone(&lock);
            let name = name.clone();
            tokio::spawn(async move {
                lock.acquire_with_retry(&name, Duration::from_secs(5), Duration::from_secs(2))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(lock.release(&name, &t1).await);

        let t2 = waiter.await.unwrap();
        assert!(t2.is_some());
        lock.release(&name, &t2.unwrap()).await;
    }
}
