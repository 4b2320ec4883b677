use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::codec::CodecError;
use crate::eviction::EntryMeta;
use crate::payload::CachedValue;

#[derive(Error, Debug)]
pub enum TierError {
    /// Backing store cannot be reached (connection refused, pool closed, ...)
    #[error("tier unavailable: {0}")]
    Unavailable(String),
    #[error("stored value could not be decoded: {0}")]
    Codec(#[from] CodecError),
    #[error("invalid key pattern '{0}'")]
    InvalidPattern(String),
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Entry importance. Ordered so that `Low < Normal < High < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CachePriority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
    Critical = 3,
}

impl CachePriority {
    #[must_use]
    pub fn from_i64(value: i64) -> Self {
        match value {
            i64::MIN..=0 => Self::Low,
            1 => Self::Normal,
            2 => Self::High,
            _ => Self::Critical,
        }
    }
}

/// Optional attributes for [`CacheTier::put`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PutOptions {
    /// Time to live; `None` never expires
    pub ttl: Option<Duration>,
    pub priority: CachePriority,
    /// Tags for group invalidation via [`CacheTier::remove_by_tag`]
    pub tags: Vec<String>,
}

impl PutOptions {
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: CachePriority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Absolute expiry for an entry created at `now`.
    #[must_use]
    pub fn expires_at(&self, now: i64) -> Option<i64> {
        self.ttl
            .map(|ttl| now.saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)))
    }
}

/// A stored value plus the metadata eviction and invalidation work from.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: String,
    pub value: CachedValue,
    pub size_bytes: usize,
    /// Epoch millis
    pub created_at: i64,
    /// Never earlier than `created_at`
    pub expires_at: Option<i64>,
    pub last_accessed_at: i64,
    pub access_count: u64,
    pub access_tick: u64,
    pub priority: CachePriority,
    pub tags: BTreeSet<String>,
}

impl CacheEntry {
    #[must_use]
    pub fn new(key: String, value: CachedValue, size_bytes: usize, options: &PutOptions, now: i64, tick: u64) -> Self {
        Self {
            key,
            value,
            size_bytes,
            created_at: now,
            expires_at: options.expires_at(now),
            last_accessed_at: now,
            access_count: 0,
            access_tick: tick,
            priority: options.priority,
            tags: options.tags.iter().cloned().collect(),
        }
    }

    /// Logically absent once past `expires_at`, even if not yet swept.
    #[must_use]
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now)
    }

    pub fn record_access(&mut self, now: i64, tick: u64) {
        self.last_accessed_at = now;
        self.access_tick = tick;
        self.access_count = self.access_count.saturating_add(1);
    }

    #[must_use]
    pub fn meta(&self) -> EntryMeta {
        EntryMeta {
            key: self.key.clone(),
            size_bytes: self.size_bytes,
            created_at: self.created_at,
            expires_at: self.expires_at,
            last_accessed_at: self.last_accessed_at,
            access_tick: self.access_tick,
            access_count: self.access_count,
            priority: self.priority,
        }
    }
}

/// Point-in-time tier statistics. Hit/miss counters reset on `clear`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheTierStats {
    pub total_count: u64,
    pub valid_count: u64,
    pub expired_count: u64,
    pub hit_count: u64,
    pub miss_count: u64,
    pub eviction_count: u64,
    /// Stored bytes, where the tier tracks them (0 otherwise)
    pub size_bytes: u64,
}

impl CacheTierStats {
    /// `hits / (hits + misses)`, 0.0 before the first lookup.
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hit_count + self.miss_count;
        if total == 0 {
            0.0
        } else {
            self.hit_count as f64 / total as f64
        }
    }

    #[must_use]
    pub fn lookups(&self) -> u64 {
        self.hit_count + self.miss_count
    }
}

/// Monotonic hit/miss/eviction counters shared by tier implementations.
#[derive(Debug, Default)]
pub(crate) struct TierCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl TierCounters {
    pub(crate) fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn evicted(&self, count: u64) {
        self.evictions.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
    }

    pub(crate) fn stats(&self, total_count: u64, expired_count: u64) -> CacheTierStats {
        CacheTierStats {
            total_count,
            valid_count: total_count.saturating_sub(expired_count),
            expired_count,
            hit_count: self.hits.load(Ordering::Relaxed),
            miss_count: self.misses.load(Ordering::Relaxed),
            eviction_count: self.evictions.load(Ordering::Relaxed),
            size_bytes: 0,
        }
    }
}

/// Compile a glob key pattern (`*`, `?`, `[...]`).
pub(crate) fn compile_pattern(pattern: &str) -> Result<glob::Pattern, TierError> {
    glob::Pattern::new(pattern).map_err(|_| TierError::InvalidPattern(pattern.to_string()))
}

/// Uniform key → value store contract shared by L1, L2 and L3.
///
/// A tier is best-effort: a `put` that cannot make room is silently dropped,
/// and an expired entry reads as a miss.
#[async_trait]
pub trait CacheTier: Send + Sync {
    /// Tier label for logs and metrics ("L1", "L2", "L3").
    fn name(&self) -> &str;

    async fn get(&self, key: &str) -> Result<Option<CachedValue>, TierError>;

    async fn put(&self, key: &str, value: &CachedValue, options: PutOptions) -> Result<(), TierError>;

    async fn remove(&self, key: &str) -> Result<(), TierError>;

    /// Remove every key matching a glob pattern; returns the number removed.
    async fn remove_by_pattern(&self, pattern: &str) -> Result<u64, TierError>;

    /// Remove every entry carrying `tag`; returns the number removed.
    async fn remove_by_tag(&self, tag: &str) -> Result<u64, TierError>;

    /// Remove everything and reset hit/miss statistics.
    async fn clear(&self) -> Result<(), TierError>;

    async fn stats(&self) -> Result<CacheTierStats, TierError>;

    /// Physically drop expired entries; returns the number removed.
    async fn sweep_expired(&self) -> Result<u64, TierError>;

    /// Live (non-expired) keys matching a glob pattern, sorted.
    async fn keys(&self, pattern: &str) -> Result<Vec<String>, TierError>;

    /// Release backend resources. Further calls may fail with `Unavailable`.
    async fn close(&self) -> Result<(), TierError> {
        Ok(())
    }
}
