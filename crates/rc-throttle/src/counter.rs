//! Throttle counter backends
//!
//! The in-memory counter serves single-node deployments; the Redis counter
//! shares one count across the cluster so the limit holds globally. Both
//! count accepted calls per `(scope, window)` key.

use async_trait::async_trait;
use dashmap::DashMap;
use anyhow::Result;
use tracing::debug;

/// Storage for fixed-window call counts.
#[async_trait]
pub trait ThrottleCounter: Send + Sync {
    /// Add one call to the window and return the new count.
    /// `window_end` is the unix second at which the window expires.
    async fn increment(&self, key: &str, window_end: i64) -> Result<u64>;

    /// Drop windows that ended at or before `now_unix`.
    async fn prune(&self, now_unix: i64);
}

struct WindowSlot {
    window_end: i64,
    count: u64,
}

/// Per-node counter; acceptable wherever cluster-wide enforcement is not
/// required.
#[derive(Default)]
pub struct MemoryThrottleCounter {
    windows: DashMap<String, WindowSlot>,
}

impl MemoryThrottleCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn window_count(&self) -> usize {
        self.windows.len()
    }
}

#[async_trait]
impl ThrottleCounter for MemoryThrottleCounter {
    async fn increment(&self, key: &str, window_end: i64) -> Result<u64> {
        let mut slot = self.windows.entry(key.to_string()).or_insert(WindowSlot {
            window_end,
            count: 0,
        });
        slot.count += 1;
        Ok(slot.count)
    }

    async fn prune(&self, now_unix: i64) {
        let before = self.windows.len();
        self.windows.retain(|_, slot| slot.window_end > now_unix);
        let dropped = before - self.windows.len();
        if dropped > 0 {
            debug!(dropped, "Pruned expired throttle windows");
        }
    }
}

/// Cluster-shared counter: INCR + first-increment EXPIRE per window key.
/// Window keys die by TTL, so `prune` is a no-op here.
pub struct RedisThrottleCounter {
    connection: redis::aio::ConnectionManager,
    key_prefix: String,
}

impl RedisThrottleCounter {
    pub fn new(connection: redis::aio::ConnectionManager) -> Self {
        Self {
            connection,
            key_prefix: "relaycore:throttle".to_string(),
        }
    }

    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let connection = redis::aio::ConnectionManager::new(client).await?;
        Ok(Self::new(connection))
    }
}

#[async_trait]
impl ThrottleCounter for RedisThrottleCounter {
    async fn increment(&self, key: &str, window_end: i64) -> Result<u64> {
        let full_key = format!("{}:{}", self.key_prefix, key);
        let mut connection = self.connection.clone();

        let count: u64 = redis::cmd("INCR")
            .arg(&full_key)
            .query_async(&mut connection)
            .await?;

        if count == 1 {
            // Keep the key one interval past its window end so a late
            // reader still sees the final count.
            let ttl = (window_end - chrono::Utc::now().timestamp()).max(1) * 2;
            let _: () = redis::cmd("EXPIRE")
                .arg(&full_key)
                .arg(ttl)
                .query_async(&mut connection)
                .await?;
        }
        Ok(count)
    }

    async fn prune(&self, _now_unix: i64) {
        // TTL-based expiry; nothing to do.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_counter_increments_per_key() {
        let counter = MemoryThrottleCounter::new();
        assert_eq!(counter.increment("a:svc:1", 100).await.unwrap(), 1);
        assert_eq!(counter.increment("a:svc:1", 100).await.unwrap(), 2);
        assert_eq!(counter.increment("b:svc:1", 100).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_memory_counter_prune() {
        let counter = MemoryThrottleCounter::new();
        counter.increment("a:svc:1", 100).await.unwrap();
        counter.increment("a:svc:2", 200).await.unwrap();
        assert_eq!(counter.window_count(), 2);

        counter.prune(150).await;
        assert_eq!(counter.window_count(), 1);
    }
}
