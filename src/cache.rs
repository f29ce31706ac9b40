use async_trait::async_trait;
use moka::future::Cache;
use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tracing::info;

use crate::{
    config::{Quota, StoreBackend, StoreSettings},
    error::Result,
    redis::{RedisClient, RedisConfig},
    utils::TimeSource,
};

/// State of one window right after a hit was counted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSnapshot {
    pub count: u64,
    pub window_start_ms: u64,
    pub window_ms: u64,
    pub now_ms: u64,
}

impl WindowSnapshot {
    /// Milliseconds until this window closes
    pub fn reset_after_ms(&self) -> u64 {
        (self.window_start_ms + self.window_ms).saturating_sub(self.now_ms)
    }
}

/// Storage for per-key window counters.
///
/// Implementations must make `increment` atomic per key: two concurrent hits
/// on the same key always observe distinct counts.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Count one hit against `key`, opening a new window when the current one
    /// has elapsed
    async fn increment(&self, key: &str, quota: Quota) -> Result<WindowSnapshot>;

    /// Release one hit counted in the window starting at `window_start_ms`.
    /// Returns false when that window is already gone.
    async fn rollback(&self, key: &str, window_start_ms: u64) -> Result<bool>;

    /// Health check for the store
    async fn health_check(&self) -> Result<()>;

    fn name(&self) -> &'static str;
}

/// Mutable fixed-window state for one key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowCounter {
    pub count: u64,
    pub window_start_ms: u64,
    pub limit: u64,
    pub window_ms: u64,
}

impl WindowCounter {
    pub fn new(now_ms: u64, quota: Quota) -> Self {
        Self {
            count: 0,
            window_start_ms: now_ms,
            limit: quota.limit,
            window_ms: quota.window_ms,
        }
    }

    /// Count one hit at `now_ms`
    pub fn hit(&mut self, now_ms: u64, quota: Quota) -> WindowSnapshot {
        // A tier change takes effect on the next hit
        self.limit = quota.limit;
        self.window_ms = quota.window_ms;

        if now_ms >= self.window_start_ms + self.window_ms {
            self.count = 0;
            self.window_start_ms = now_ms;
        }
        self.count += 1;

        WindowSnapshot {
            count: self.count,
            window_start_ms: self.window_start_ms,
            window_ms: self.window_ms,
            now_ms,
        }
    }

    pub fn release(&mut self, window_start_ms: u64) -> bool {
        if self.window_start_ms == window_start_ms && self.count > 0 {
            self.count -= 1;
            true
        } else {
            false
        }
    }
}

/// In-process counter store.
///
/// Each key owns its own mutex, so hits on different keys never contend.
/// Counters are only dropped after idling for the eviction interval, which
/// must outlast the longest window. There is no size bound: evicting a live
/// counter would hand its key a fresh window. Limits are enforced per process
/// only.
pub struct MemoryCounterStore {
    counters: Cache<String, Arc<Mutex<WindowCounter>>>,
    time_source: TimeSource,
}

impl MemoryCounterStore {
    pub fn new(idle_eviction: Duration, time_source: TimeSource) -> Self {
        let counters = Cache::builder().time_to_idle(idle_eviction).build();

        Self {
            counters,
            time_source,
        }
    }

    /// Number of live counters
    pub async fn tracked_keys(&self) -> u64 {
        self.counters.run_pending_tasks().await;
        self.counters.entry_count()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment(&self, key: &str, quota: Quota) -> Result<WindowSnapshot> {
        let created_at = self.time_source.now_ms();
        let counter = self
            .counters
            .get_with(key.to_string(), async move {
                Arc::new(Mutex::new(WindowCounter::new(created_at, quota)))
            })
            .await;

        // No await past this point: a dropped caller either counted the hit
        // or did not, never half of it.
        let mut counter = counter.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(counter.hit(self.time_source.now_ms(), quota))
    }

    async fn rollback(&self, key: &str, window_start_ms: u64) -> Result<bool> {
        let Some(counter) = self.counters.get(key).await else {
            return Ok(false);
        };
        let mut counter = counter.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(counter.release(window_start_ms))
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Counter store shared by every instance through Redis
pub struct RedisCounterStore {
    client: RedisClient,
    key_prefix: String,
    time_source: TimeSource,
}

impl RedisCounterStore {
    pub fn new(client: RedisClient, key_prefix: String, time_source: TimeSource) -> Self {
        Self {
            client,
            key_prefix,
            time_source,
        }
    }

    fn redis_key(&self, key: &str) -> String {
        if self.key_prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}:{}", self.key_prefix, key)
        }
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment(&self, key: &str, quota: Quota) -> Result<WindowSnapshot> {
        let now_ms = self.time_source.now_ms();
        let (count, window_start_ms) = self
            .client
            .increment_window(&self.redis_key(key), now_ms, quota.window_ms)
            .await?;

        Ok(WindowSnapshot {
            count,
            window_start_ms,
            window_ms: quota.window_ms,
            now_ms,
        })
    }

    async fn rollback(&self, key: &str, window_start_ms: u64) -> Result<bool> {
        self.client
            .rollback_window(&self.redis_key(key), window_start_ms)
            .await
    }

    async fn health_check(&self) -> Result<()> {
        self.client.health_check().await
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

/// Build the configured counter store
pub async fn build_store(
    settings: &StoreSettings,
    time_source: TimeSource,
) -> Result<Box<dyn CounterStore>> {
    match settings.backend {
        StoreBackend::Memory => {
            info!(
                idle_eviction_ms = settings.idle_eviction_ms,
                "Using in-process counter store"
            );
            Ok(Box::new(MemoryCounterStore::new(
                Duration::from_millis(settings.idle_eviction_ms),
                time_source,
            )))
        }
        StoreBackend::Redis => {
            let client = RedisClient::new(RedisConfig {
                url: settings.redis_url.clone(),
                connection_timeout: Duration::from_millis(settings.connection_timeout_ms),
                command_timeout: Duration::from_millis(settings.command_timeout_ms),
            })
            .await?;
            info!(prefix = %settings.key_prefix, "Using Redis counter store");
            Ok(Box::new(RedisCounterStore::new(
                client,
                settings.key_prefix.clone(),
                time_source,
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    fn quota(limit: u64, window_ms: u64) -> Quota {
        Quota { limit, window_ms }
    }

    #[test]
    fn test_window_counter_resets_after_window() {
        let q = quota(3, 1_000);
        let mut counter = WindowCounter::new(10_000, q);

        assert_eq!(counter.hit(10_000, q).count, 1);
        assert_eq!(counter.hit(10_999, q).count, 2);

        let snapshot = counter.hit(11_000, q);
        assert_eq!(snapshot.count, 1);
        assert_eq!(snapshot.window_start_ms, 11_000);
        assert_eq!(snapshot.reset_after_ms(), 1_000);
    }

    #[test]
    fn test_release_only_in_issuing_window() {
        let q = quota(3, 1_000);
        let mut counter = WindowCounter::new(0, q);
        counter.hit(0, q);
        counter.hit(10, q);

        assert!(counter.release(0));
        assert_eq!(counter.count, 1);
        assert!(!counter.release(999));

        counter.hit(5_000, q);
        assert!(!counter.release(0));
        assert_eq!(counter.count, 1);
    }

    #[tokio::test]
    async fn test_memory_store_counts_per_key() {
        let clock = TimeSource::manual(1_000_000);
        let store = MemoryCounterStore::new(HOUR, clock.clone());
        let q = quota(10, 60_000);

        assert_eq!(store.increment("a", q).await.unwrap().count, 1);
        assert_eq!(store.increment("a", q).await.unwrap().count, 2);
        assert_eq!(store.increment("b", q).await.unwrap().count, 1);
        assert_eq!(store.tracked_keys().await, 2);

        clock.advance(Duration::from_millis(30_000));
        let snapshot = store.increment("a", q).await.unwrap();
        assert_eq!(snapshot.window_start_ms, 1_000_000);
        assert_eq!(snapshot.reset_after_ms(), 30_000);
    }

    #[tokio::test]
    async fn test_memory_store_rollback() {
        let clock = TimeSource::manual(0);
        let store = MemoryCounterStore::new(HOUR, clock.clone());
        let q = quota(5, 1_000);

        let first = store.increment("k", q).await.unwrap();
        store.increment("k", q).await.unwrap();
        assert!(store.rollback("k", first.window_start_ms).await.unwrap());
        assert_eq!(store.increment("k", q).await.unwrap().count, 2);

        assert!(!store.rollback("missing", 0).await.unwrap());
    }

    #[tokio::test]
    async fn test_throttled_key_survives_key_churn() {
        let store = MemoryCounterStore::new(2 * HOUR, TimeSource::manual(0));
        let q = quota(2, 3_600_000);

        for _ in 0..20 {
            store.increment("hot", q).await.unwrap();
        }
        for i in 0..5_000 {
            store.increment(&format!("churn-{}", i), q).await.unwrap();
        }
        store.counters.run_pending_tasks().await;

        let snapshot = store.increment("hot", q).await.unwrap();
        assert_eq!(snapshot.count, 21);
        assert_eq!(snapshot.window_start_ms, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_memory_store_concurrent_increments_are_not_lost() {
        let store = Arc::new(MemoryCounterStore::new(HOUR, TimeSource::manual(0)));
        let q = quota(1_000, 60_000);

        let handles: Vec<_> = (0..500)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.increment("hot", q).await.unwrap().count })
            })
            .collect();

        let mut counts = Vec::new();
        for handle in handles {
            counts.push(handle.await.unwrap());
        }
        counts.sort_unstable();
        assert_eq!(counts, (1..=500).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn test_build_memory_store() {
        let store = build_store(&StoreSettings::default(), TimeSource::new())
            .await
            .unwrap();
        assert_eq!(store.name(), "memory");
        store.health_check().await.unwrap();
    }
}
