use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use super::now_millis;
use super::traits::{compile_pattern, CacheEntry, CacheTier, CacheTierStats, PutOptions, TierCounters, TierError};
use crate::eviction::{EvictionStrategy, TierSnapshot};
use crate::payload::CachedValue;

/// In-memory tier (L1, and the in-process L3 stand-in).
///
/// Reads go straight to the `DashMap`; puts are serialized by a write lock so
/// capacity checks and eviction see a consistent view.
pub struct MemoryTier {
    name: String,
    entries: DashMap<String, CacheEntry>,
    size_bytes: AtomicUsize,
    max_entries: usize,
    max_bytes: usize,
    strategy: Arc<dyn EvictionStrategy>,
    tick: AtomicU64,
    counters: TierCounters,
    write_lock: Mutex<()>,
}

impl MemoryTier {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        max_entries: usize,
        max_bytes: usize,
        strategy: Arc<dyn EvictionStrategy>,
    ) -> Self {
        Self {
            name: name.into(),
            entries: DashMap::new(),
            size_bytes: AtomicUsize::new(0),
            max_entries,
            max_bytes,
            strategy,
            tick: AtomicU64::new(0),
            counters: TierCounters::default(),
            write_lock: Mutex::new(()),
        }
    }

    /// Unbounded tier, used for staging.
    #[must_use]
    pub fn unbounded(name: impl Into<String>) -> Self {
        Self::new(name, usize::MAX, usize::MAX, Arc::new(crate::eviction::LruStrategy))
    }

    /// Physically present entries (including expired, not yet swept).
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.size_bytes.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    /// Copy of an entry with its metadata, without touching access stats.
    #[must_use]
    pub fn peek_entry(&self, key: &str) -> Option<CacheEntry> {
        self.entries.get(key).map(|e| e.value().clone())
    }

    /// All live entries, sorted by key. Does not touch access stats.
    #[must_use]
    pub fn live_entries(&self) -> Vec<CacheEntry> {
        let now = now_millis();
        let mut entries: Vec<CacheEntry> = self
            .entries
            .iter()
            .filter(|e| !e.is_expired(now))
            .map(|e| e.value().clone())
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries
    }

    fn next_tick(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn entry_size(key: &str, value: &CachedValue) -> usize {
        key.len() + value.size_bytes()
    }

    fn remove_entry(&self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some((_, entry)) => {
                self.size_bytes.fetch_sub(entry.size_bytes, Ordering::AcqRel);
                true
            }
            None => false,
        }
    }

    fn remove_where(&self, predicate: impl Fn(&CacheEntry) -> bool) -> u64 {
        let doomed: Vec<String> = self
            .entries
            .iter()
            .filter(|e| predicate(e.value()))
            .map(|e| e.key().clone())
            .collect();
        doomed.iter().filter(|k| self.remove_entry(k)).count() as u64
    }

    fn over_capacity(&self, incoming: usize) -> bool {
        self.entries.len() + 1 > self.max_entries
            || self.size_bytes.load(Ordering::Acquire).saturating_add(incoming) > self.max_bytes
    }

    /// Evict until an entry of `incoming` bytes fits. Caller holds the write lock.
    fn make_room(&self, incoming: usize) -> bool {
        if !self.over_capacity(incoming) {
            return true;
        }

        let now = now_millis();
        let expired = self.remove_where(|e| e.is_expired(now));
        if expired > 0 {
            debug!(tier = %self.name, expired, "Dropped expired entries before eviction");
        }

        let mut evicted = 0u64;
        let mut evicted_bytes = 0usize;
        while self.over_capacity(incoming) {
            let snapshot = TierSnapshot::new(self.entries.iter().map(|e| e.meta()).collect(), now);
            let Some(victim) = self.strategy.select_victim(&snapshot) else {
                break;
            };
            if let Some((_, entry)) = self.entries.remove(&victim) {
                self.size_bytes.fetch_sub(entry.size_bytes, Ordering::AcqRel);
                evicted += 1;
                evicted_bytes += entry.size_bytes;
                debug!(tier = %self.name, key = %victim, strategy = self.strategy.name(), "Evicted entry");
            }
        }

        if evicted > 0 {
            self.counters.evicted(evicted);
            crate::metrics::record_eviction(&self.name, evicted as usize, evicted_bytes);
        }
        !self.over_capacity(incoming)
    }
}

#[async_trait]
impl CacheTier for MemoryTier {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> Result<Option<CachedValue>, TierError> {
        let now = now_millis();
        let expired = match self.entries.get_mut(key) {
            Some(mut entry) => {
                if entry.is_expired(now) {
                    true
                } else {
                    let tick = self.next_tick();
                    entry.record_access(now, tick);
                    self.counters.hit();
                    return Ok(Some(entry.value.clone()));
                }
            }
            None => false,
        };

        if expired {
            // Re-check under the shard lock; a concurrent put may have refreshed it.
            if let Some((_, entry)) = self.entries.remove_if(key, |_, e| e.is_expired(now)) {
                self.size_bytes.fetch_sub(entry.size_bytes, Ordering::AcqRel);
            }
        }
        self.counters.miss();
        Ok(None)
    }

    async fn put(&self, key: &str, value: &CachedValue, options: PutOptions) -> Result<(), TierError> {
        let size = Self::entry_size(key, value);
        if size > self.max_bytes || self.max_entries == 0 {
            debug!(tier = %self.name, key, size, "Entry exceeds tier capacity, not cached");
            return Ok(());
        }

        let _guard = self.write_lock.lock();
        self.remove_entry(key);

        if !self.make_room(size) {
            debug!(tier = %self.name, key, "Eviction could not free enough room, not cached");
            return Ok(());
        }

        let now = now_millis();
        let entry = CacheEntry::new(key.to_string(), value.clone(), size, &options, now, self.next_tick());
        self.entries.insert(key.to_string(), entry);
        self.size_bytes.fetch_add(size, Ordering::AcqRel);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), TierError> {
        let _guard = self.write_lock.lock();
        self.remove_entry(key);
        Ok(())
    }

    async fn remove_by_pattern(&self, pattern: &str) -> Result<u64, TierError> {
        let pattern = compile_pattern(pattern)?;
        let _guard = self.write_lock.lock();
        Ok(self.remove_where(|e| pattern.matches(&e.key)))
    }

    async fn remove_by_tag(&self, tag: &str) -> Result<u64, TierError> {
        let _guard = self.write_lock.lock();
        Ok(self.remove_where(|e| e.tags.contains(tag)))
    }

    async fn clear(&self) -> Result<(), TierError> {
        let _guard = self.write_lock.lock();
        self.entries.clear();
        self.size_bytes.store(0, Ordering::Release);
        self.counters.reset();
        Ok(())
    }

    async fn stats(&self) -> Result<CacheTierStats, TierError> {
        let now = now_millis();
        let total = self.entries.len() as u64;
        let expired = self.entries.iter().filter(|e| e.is_expired(now)).count() as u64;
        Ok(CacheTierStats {
            size_bytes: self.size_bytes() as u64,
            ..self.counters.stats(total, expired)
        })
    }

    async fn sweep_expired(&self) -> Result<u64, TierError> {
        let now = now_millis();
        let _guard = self.write_lock.lock();
        Ok(self.remove_where(|e| e.is_expired(now)))
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, TierError> {
        let pattern = compile_pattern(pattern)?;
        let now = now_millis();
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| !e.is_expired(now) && pattern.matches(e.key()))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eviction::{EvictionKind, LruStrategy, PriorityStrategy};
    use crate::payload::test_fund;
    use crate::tier::CachePriority;
    use std::time::Duration;

    fn fund_value(code: &str) -> CachedValue {
        CachedValue::Fund(test_fund(code))
    }

    fn lru_tier(max_entries: usize) -> MemoryTier {
        MemoryTier::new("L1", max_entries, usize::MAX, Arc::new(LruStrategy))
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let tier = lru_tier(10);
        tier.put("fund:a", &fund_value("a"), PutOptions::default()).await.unwrap();

        let value = tier.get("fund:a").await.unwrap().unwrap();
        assert_eq!(value.as_fund().unwrap().code, "a");
        assert!(tier.get("fund:missing").await.unwrap().is_none());

        let stats = tier.stats().await.unwrap();
        assert_eq!(stats.hit_count, 1);
        assert_eq!(stats.miss_count, 1);
        assert_eq!(stats.total_count, 1);
    }

    #[tokio::test]
    async fn test_lru_evicts_least_recently_accessed() {
        let tier = lru_tier(2);
        tier.put("a", &fund_value("a"), PutOptions::default()).await.unwrap();
        tier.put("b", &fund_value("b"), PutOptions::default()).await.unwrap();
        tier.get("a").await.unwrap();
        tier.put("c", &fund_value("c"), PutOptions::default()).await.unwrap();

        assert_eq!(tier.keys("*").await.unwrap(), vec!["a".to_string(), "c".to_string()]);
        assert_eq!(tier.stats().await.unwrap().eviction_count, 1);
    }

    #[tokio::test]
    async fn test_eviction_order_is_repeatable() {
        async fn run() -> Vec<String> {
            let tier = lru_tier(3);
            let mut survivors = Vec::new();
            for key in ["k1", "k2", "k3"] {
                tier.put(key, &fund_value(key), PutOptions::default()).await.unwrap();
            }
            tier.get("k1").await.unwrap();
            for key in ["k4", "k5"] {
                tier.put(key, &fund_value(key), PutOptions::default()).await.unwrap();
                survivors.push(tier.keys("*").await.unwrap().join(","));
            }
            survivors
        }
        let first = run().await;
        assert_eq!(first, vec!["k1,k3,k4".to_string(), "k1,k4,k5".to_string()]);
        assert_eq!(first, run().await);
    }

    #[tokio::test]
    async fn test_expired_entry_is_a_miss_and_lazily_removed() {
        let tier = lru_tier(10);
        tier.put("short", &fund_value("s"), PutOptions::default().with_ttl(Duration::from_millis(5)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(tier.get("short").await.unwrap().is_none());
        assert!(tier.is_empty());
        assert_eq!(tier.size_bytes(), 0);
    }

    #[tokio::test]
    async fn test_sweep_and_stats_count_expired() {
        let tier = lru_tier(10);
        tier.put("short", &fund_value("s"), PutOptions::default().with_ttl(Duration::from_millis(5)))
            .await
            .unwrap();
        tier.put("long", &fund_value("l"), PutOptions::default()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let stats = tier.stats().await.unwrap();
        assert_eq!(stats.total_count, 2);
        assert_eq!(stats.expired_count, 1);
        assert_eq!(stats.valid_count, 1);

        assert_eq!(tier.sweep_expired().await.unwrap(), 1);
        assert_eq!(tier.len(), 1);
    }

    #[tokio::test]
    async fn test_oversized_entry_silently_skipped() {
        let tier = MemoryTier::new("L1", 10, 64, Arc::new(LruStrategy));
        tier.put("big", &fund_value("big"), PutOptions::default()).await.unwrap();
        assert!(tier.is_empty());
    }

    #[tokio::test]
    async fn test_byte_capacity_triggers_eviction() {
        let one = MemoryTier::entry_size("a", &fund_value("a"));
        let tier = MemoryTier::new("L1", 100, one * 2 + one / 2, Arc::new(LruStrategy));
        for key in ["a", "b", "c"] {
            tier.put(key, &fund_value(key), PutOptions::default()).await.unwrap();
        }
        assert_eq!(tier.keys("*").await.unwrap(), vec!["b".to_string(), "c".to_string()]);
        assert!(tier.size_bytes() <= one * 2 + one / 2);
    }

    #[tokio::test]
    async fn test_priority_strategy_keeps_critical() {
        let tier = MemoryTier::new("L1", 2, usize::MAX, Arc::new(PriorityStrategy));
        let critical = PutOptions::default().with_priority(CachePriority::Critical);
        tier.put("state", &fund_value("s"), critical).await.unwrap();
        tier.put("a", &fund_value("a"), PutOptions::default()).await.unwrap();
        tier.put("b", &fund_value("b"), PutOptions::default()).await.unwrap();
        assert_eq!(tier.keys("*").await.unwrap(), vec!["b".to_string(), "state".to_string()]);
    }

    #[tokio::test]
    async fn test_overwrite_updates_size() {
        let tier = lru_tier(10);
        tier.put("k", &fund_value("a"), PutOptions::default()).await.unwrap();
        let big = CachedValue::FundList((0..20).map(|i| test_fund(&i.to_string())).collect());
        tier.put("k", &big, PutOptions::default()).await.unwrap();
        assert_eq!(tier.len(), 1);
        assert_eq!(tier.size_bytes(), MemoryTier::entry_size("k", &big));
    }

    #[tokio::test]
    async fn test_remove_by_pattern_and_tag() {
        let tier = lru_tier(10);
        let tagged = PutOptions::default().with_tag("fund-type:bond");
        tier.put("fund:1", &fund_value("1"), tagged.clone()).await.unwrap();
        tier.put("fund:2", &fund_value("2"), PutOptions::default()).await.unwrap();
        tier.put("funds:list:x", &CachedValue::FundList(vec![]), tagged).await.unwrap();
        tier.put("ranking:y", &CachedValue::Ranking(vec![]), PutOptions::default()).await.unwrap();

        assert_eq!(tier.remove_by_tag("fund-type:bond").await.unwrap(), 2);
        assert_eq!(tier.remove_by_pattern("fund:*").await.unwrap(), 1);
        assert_eq!(tier.keys("*").await.unwrap(), vec!["ranking:y".to_string()]);
        assert!(tier.remove_by_pattern("[").await.is_err());
    }

    #[tokio::test]
    async fn test_clear_resets_stats() {
        let tier = lru_tier(10);
        tier.put("a", &fund_value("a"), PutOptions::default()).await.unwrap();
        tier.get("a").await.unwrap();
        tier.get("nope").await.unwrap();
        tier.clear().await.unwrap();

        let stats = tier.stats().await.unwrap();
        assert_eq!(stats, CacheTierStats::default());
        assert_eq!(tier.size_bytes(), 0);
    }

    #[tokio::test]
    async fn test_default_l1_strategy_is_adaptive() {
        let tier = MemoryTier::new("L1", 10, usize::MAX, EvictionKind::Adaptive.build((0.5, 0.5)));
        assert_eq!(tier.strategy_name(), "adaptive");
    }

    #[tokio::test]
    async fn test_concurrent_access() {
        let tier = Arc::new(lru_tier(50));
        let mut handles = vec![];
        for batch in 0..10 {
            let tier = tier.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..10 {
                    let key = format!("b{}-{}", batch, i);
                    tier.put(&key, &fund_value(&key), PutOptions::default()).await.unwrap();
                    tier.get(&key).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(tier.len(), 50);
    }
}
