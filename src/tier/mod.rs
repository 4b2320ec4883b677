//! Cache tiers.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │ L1  MemoryTier   DashMap, adaptive eviction, entry+byte bound │
//! ├───────────────────────────────────────────────────────────────┤
//! │ L2  SqlTier      SQLite, survives restarts, LRU by default    │
//! ├───────────────────────────────────────────────────────────────┤
//! │ L3  RedisTier    shared remote cache (or an in-process        │
//! │                  MemoryTier when no Redis URL is configured)  │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! [`TierStack`] bundles the three tiers and downgrades tier failures to
//! misses: a broken cache never fails a query, it only makes it slower.

pub mod memory;
pub mod redis;
pub mod sql;
pub mod traits;

use std::fmt;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use tracing::warn;

use crate::error::DataLayerError;
use crate::payload::CachedValue;

pub use memory::MemoryTier;
pub use redis::RedisTier;
pub use sql::SqlTier;
pub use traits::{CacheEntry, CachePriority, CacheTier, CacheTierStats, PutOptions, TierError};

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TierLevel {
    L1,
    L2,
    L3,
}

impl TierLevel {
    pub const ALL: [TierLevel; 3] = [TierLevel::L1, TierLevel::L2, TierLevel::L3];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::L1 => "L1",
            Self::L2 => "L2",
            Self::L3 => "L3",
        }
    }
}

impl fmt::Display for TierLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn error_type(e: &TierError) -> &'static str {
    match e {
        TierError::Unavailable(_) => "unavailable",
        TierError::Codec(_) => "codec",
        TierError::InvalidPattern(_) => "pattern",
        TierError::Backend(_) => "backend",
    }
}

/// The three cache tiers, fastest first.
#[derive(Clone)]
pub struct TierStack {
    pub l1: Arc<dyn CacheTier>,
    pub l2: Arc<dyn CacheTier>,
    pub l3: Arc<dyn CacheTier>,
}

impl TierStack {
    #[must_use]
    pub fn new(l1: Arc<dyn CacheTier>, l2: Arc<dyn CacheTier>, l3: Arc<dyn CacheTier>) -> Self {
        Self { l1, l2, l3 }
    }

    /// Three unbounded in-memory tiers; handy for tests and tooling.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemoryTier::unbounded("L1")),
            Arc::new(MemoryTier::unbounded("L2")),
            Arc::new(MemoryTier::unbounded("L3")),
        )
    }

    #[must_use]
    pub fn tier(&self, level: TierLevel) -> &Arc<dyn CacheTier> {
        match level {
            TierLevel::L1 => &self.l1,
            TierLevel::L2 => &self.l2,
            TierLevel::L3 => &self.l3,
        }
    }

    /// Read one tier; errors are logged and read as a miss.
    pub async fn get_quiet(&self, level: TierLevel, key: &str) -> Option<CachedValue> {
        match self.tier(level).get(key).await {
            Ok(found) => {
                crate::metrics::record_cache_lookup(level.as_str(), found.is_some());
                found
            }
            Err(e) => {
                warn!(tier = %level, key, error = %e, "Tier read failed, treating as miss");
                crate::metrics::record_tier_error(level.as_str(), "get", error_type(&e));
                None
            }
        }
    }

    /// Write one tier; errors are logged and swallowed.
    pub async fn put_quiet(&self, level: TierLevel, key: &str, value: &CachedValue, options: PutOptions) {
        if let Err(e) = self.tier(level).put(key, value, options).await {
            warn!(tier = %level, key, error = %e, "Tier write failed");
            crate::metrics::record_tier_error(level.as_str(), "put", error_type(&e));
        }
    }

    /// Write one tier, surfacing the failure as [`DataLayerError::CacheUnavailable`].
    pub async fn put_checked(
        &self,
        level: TierLevel,
        key: &str,
        value: &CachedValue,
        options: PutOptions,
    ) -> crate::Result<()> {
        let start = Instant::now();
        let outcome = self.tier(level).put(key, value, options).await;
        self.checked(level, "put", key, start, outcome)
    }

    /// Remove from one tier, surfacing the failure.
    pub async fn remove_checked(&self, level: TierLevel, key: &str) -> crate::Result<()> {
        let start = Instant::now();
        let outcome = self.tier(level).remove(key).await;
        self.checked(level, "remove", key, start, outcome)
    }

    /// Read one tier, surfacing the failure.
    pub async fn get_checked(&self, level: TierLevel, key: &str) -> crate::Result<Option<CachedValue>> {
        let start = Instant::now();
        let outcome = self.tier(level).get(key).await;
        self.checked(level, "get", key, start, outcome)
    }

    fn checked<T>(
        &self,
        level: TierLevel,
        operation: &str,
        key: &str,
        start: Instant,
        outcome: Result<T, TierError>,
    ) -> crate::Result<T> {
        crate::metrics::record_latency(level.as_str(), operation, start.elapsed());
        match outcome {
            Ok(value) => {
                crate::metrics::record_operation(level.as_str(), operation, "success");
                Ok(value)
            }
            Err(e) => {
                warn!(tier = %level, key, operation, error = %e, "Tier operation failed");
                crate::metrics::record_operation(level.as_str(), operation, "error");
                crate::metrics::record_tier_error(level.as_str(), operation, error_type(&e));
                Err(DataLayerError::CacheUnavailable {
                    tier: level.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Remove a key from the given tiers.
    pub async fn remove_quiet(&self, levels: &[TierLevel], key: &str) {
        for &level in levels {
            if let Err(e) = self.tier(level).remove(key).await {
                warn!(tier = %level, key, error = %e, "Tier remove failed");
                crate::metrics::record_tier_error(level.as_str(), "remove", error_type(&e));
            }
        }
    }

    /// Remove a glob pattern from every tier; returns the total removed.
    pub async fn remove_pattern_everywhere(&self, pattern: &str) -> u64 {
        let mut removed = 0;
        for level in TierLevel::ALL {
            match self.tier(level).remove_by_pattern(pattern).await {
                Ok(n) => removed += n,
                Err(e) => {
                    warn!(tier = %level, pattern, error = %e, "Pattern invalidation failed");
                    crate::metrics::record_tier_error(level.as_str(), "remove_by_pattern", error_type(&e));
                }
            }
        }
        removed
    }

    /// Remove a tag from every tier; returns the total removed.
    pub async fn remove_tag_everywhere(&self, tag: &str) -> u64 {
        let mut removed = 0;
        for level in TierLevel::ALL {
            match self.tier(level).remove_by_tag(tag).await {
                Ok(n) => removed += n,
                Err(e) => {
                    warn!(tier = %level, tag, error = %e, "Tag invalidation failed");
                    crate::metrics::record_tier_error(level.as_str(), "remove_by_tag", error_type(&e));
                }
            }
        }
        removed
    }

    /// Sweep expired entries from every tier; returns the total removed.
    pub async fn sweep_expired(&self) -> u64 {
        let mut removed = 0;
        for level in TierLevel::ALL {
            match self.tier(level).sweep_expired().await {
                Ok(n) => removed += n,
                Err(e) => {
                    warn!(tier = %level, error = %e, "Expiry sweep failed");
                    crate::metrics::record_tier_error(level.as_str(), "sweep", error_type(&e));
                }
            }
        }
        removed
    }

    /// Stats per tier; an unreachable tier is omitted.
    pub async fn stats(&self) -> Vec<(TierLevel, CacheTierStats)> {
        let mut out = Vec::with_capacity(3);
        for level in TierLevel::ALL {
            match self.tier(level).stats().await {
                Ok(stats) => out.push((level, stats)),
                Err(e) => warn!(tier = %level, error = %e, "Tier stats unavailable"),
            }
        }
        out
    }

    /// Close every tier, logging failures.
    pub async fn close(&self) {
        for level in TierLevel::ALL {
            if let Err(e) = self.tier(level).close().await {
                warn!(tier = %level, error = %e, "Tier close failed");
            }
        }
    }
}
