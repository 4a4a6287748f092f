//! Time-bounded resolution cache.
//!
//! Maps a station id or raw URL to previously resolved data (for example the
//! stream URL behind a `.pls` playlist).  Entries older than `max_age` read as
//! absent and are purged lazily on read, plus periodically by a sweeper task.
//! There is no size bound: between sweeps memory grows with the number of
//! distinct keys resolved.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

/// Shortest sweep period; a zero period would make the timer panic.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    created: Instant,
}

#[derive(Debug)]
pub struct ResolutionCache<V> {
    entries: RwLock<HashMap<String, CacheEntry<V>>>,
    max_age: Duration,
}

impl<V> ResolutionCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(max_age: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_age,
        }
    }

    pub async fn put(&self, key: impl Into<String>, value: V) {
        let entry = CacheEntry {
            value,
            created: Instant::now(),
        };
        self.entries.write().await.insert(key.into(), entry);
    }

    pub async fn get(&self, key: &str) -> Option<V> {
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                None => return None,
                Some(entry) if !self.is_expired(entry) => return Some(entry.value.clone()),
                Some(_) => {}
            }
        }

        // Expired: purge unless a writer refreshed it in the meantime.
        let mut entries = self.entries.write().await;
        if entries.get(key).is_some_and(|e| self.is_expired(e)) {
            entries.remove(key);
            debug!("cache: expired entry '{}' purged on read", key);
        }
        None
    }

    /// Removes every expired entry; returns how many were dropped.
    pub async fn purge_expired(&self) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| e.created.elapsed() <= self.max_age);
        before - entries.len()
    }

    /// Number of stored entries, expired ones included until purged.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Periodic purge.  The task ends on its own once the cache is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let every = every.max(MIN_SWEEP_INTERVAL);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = weak.upgrade() else {
                    break;
                };
                let purged = cache.purge_expired().await;
                if purged > 0 {
                    debug!("cache: sweep removed {} expired entries", purged);
                }
            }
        })
    }

    fn is_expired(&self, entry: &CacheEntry<V>) -> bool {
        entry.created.elapsed() > self.max_age
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    #[tokio::test(start_paused = true)]
    async fn test_entry_present_within_max_age() {
        let cache = ResolutionCache::new(HOUR);
        cache.put("http://a/listen.pls", "http://a/stream".to_string()).await;

        tokio::time::advance(Duration::from_secs(3599)).await;
        assert_eq!(
            cache.get("http://a/listen.pls").await.as_deref(),
            Some("http://a/stream")
        );
        assert_eq!(cache.get("missing").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_absent_after_max_age_and_purged() {
        let cache = ResolutionCache::new(HOUR);
        cache.put("k", 7u32).await;

        tokio::time::advance(HOUR + Duration::from_secs(1)).await;
        assert_eq!(cache.get("k").await, None);
        assert!(cache.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_put_refreshes_timestamp() {
        let cache = ResolutionCache::new(HOUR);
        cache.put("k", 1u32).await;
        tokio::time::advance(Duration::from_secs(3000)).await;
        cache.put("k", 2u32).await;
        tokio::time::advance(Duration::from_secs(3000)).await;
        assert_eq!(cache.get("k").await, Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_removes_expired_without_reads() {
        let cache = Arc::new(ResolutionCache::new(HOUR));
        cache.put("old", 1u32).await;
        tokio::time::advance(Duration::from_secs(3000)).await;
        cache.put("fresh", 2u32).await;

        let sweeper = cache.spawn_sweeper(Duration::from_secs(300));
        // sweeps at +300, +600, +900; "old" is 3900s old at the third one
        tokio::time::sleep(Duration::from_secs(901)).await;
        assert_eq!(cache.len().await, 1);
        assert_eq!(cache.get("fresh").await, Some(2));
        sweeper.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_sweep_interval_is_clamped() {
        let cache = Arc::new(ResolutionCache::new(Duration::from_secs(10)));
        cache.put("k", 1u32).await;

        let sweeper = cache.spawn_sweeper(Duration::ZERO);
        tokio::time::sleep(Duration::from_secs(12)).await;
        assert!(!sweeper.is_finished());
        assert!(cache.is_empty().await);
        sweeper.abort();
    }

    #[tokio::test]
    async fn test_concurrent_readers_and_writers() {
        let cache = Arc::new(ResolutionCache::new(HOUR));
        let mut tasks = Vec::new();
        for i in 0..16u32 {
            let c = cache.clone();
            tasks.push(tokio::spawn(async move {
                let key = format!("k{}", i % 4);
                c.put(key.clone(), (i, i * 2)).await;
                let (a, b) = c.get(&key).await.expect("just written");
                assert_eq!(b, a * 2);
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(cache.len().await, 4);
    }
}
