//! Eviction strategies for capacity-bound cache tiers.
//!
//! A tier that is full builds a [`TierSnapshot`] of its entry metadata and
//! asks its strategy for one victim at a time until the incoming entry fits.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    Eviction Module                           │
//! ├──────────────────────────────────────────────────────────────┤
//! │  policies.rs  - Lru, Lfu, Ttl, Priority                      │
//! │  adaptive.rs  - Adaptive: weighted recency + frequency       │
//! │                 (default for L1)                             │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Determinism
//!
//! Every strategy is a pure function of the snapshot. Recency is ranked by
//! the tier's logical access tick rather than wall-clock time, and all ties
//! fall back to key order, so identical snapshots always produce the same
//! victim.

pub mod adaptive;
pub mod policies;

use std::fmt;
use std::sync::Arc;

use serde::Deserialize;

use crate::tier::CachePriority;

pub use adaptive::AdaptiveStrategy;
pub use policies::{LfuStrategy, LruStrategy, PriorityStrategy, TtlStrategy};

/// Eviction-relevant metadata of one entry.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryMeta {
    pub key: String,
    pub size_bytes: usize,
    /// Epoch millis
    pub created_at: i64,
    pub expires_at: Option<i64>,
    pub last_accessed_at: i64,
    /// Monotonic per-tier counter bumped on every get/put of this entry
    pub access_tick: u64,
    pub access_count: u64,
    pub priority: CachePriority,
}

impl EntryMeta {
    #[must_use]
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now)
    }
}

/// Point-in-time view of a tier handed to a strategy.
#[derive(Debug, Clone, Default)]
pub struct TierSnapshot {
    pub entries: Vec<EntryMeta>,
    /// Epoch millis at which the snapshot was taken
    pub now: i64,
}

impl TierSnapshot {
    #[must_use]
    pub fn new(entries: Vec<EntryMeta>, now: i64) -> Self {
        Self { entries, now }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Victim selection policy.
pub trait EvictionStrategy: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Pick the next entry to evict, or `None` if the snapshot is empty.
    fn select_victim(&self, snapshot: &TierSnapshot) -> Option<String>;

    /// Pick up to `count` victims in eviction order.
    fn select_victims(&self, snapshot: &TierSnapshot, count: usize) -> Vec<String> {
        let mut remaining = snapshot.clone();
        let mut victims = Vec::with_capacity(count.min(remaining.entries.len()));
        while victims.len() < count {
            let Some(victim) = self.select_victim(&remaining) else {
                break;
            };
            remaining.entries.retain(|e| e.key != victim);
            victims.push(victim);
        }
        victims
    }
}

/// Strategy selector used in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionKind {
    Lru,
    Lfu,
    Ttl,
    Priority,
    Adaptive,
}

impl EvictionKind {
    /// Build the strategy. `weights` is (recency, frequency) and only used by `Adaptive`.
    #[must_use]
    pub fn build(self, weights: (f64, f64)) -> Arc<dyn EvictionStrategy> {
        match self {
            Self::Lru => Arc::new(LruStrategy),
            Self::Lfu => Arc::new(LfuStrategy),
            Self::Ttl => Arc::new(TtlStrategy),
            Self::Priority => Arc::new(PriorityStrategy),
            Self::Adaptive => Arc::new(AdaptiveStrategy::new(weights.0, weights.1)),
        }
    }
}

impl fmt::Display for EvictionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lru => write!(f, "lru"),
            Self::Lfu => write!(f, "lfu"),
            Self::Ttl => write!(f, "ttl"),
            Self::Priority => write!(f, "priority"),
            Self::Adaptive => write!(f, "adaptive"),
        }
    }
}

#[cfg(test)]
pub(crate) fn meta(key: &str, tick: u64, count: u64) -> EntryMeta {
    EntryMeta {
        key: key.to_string(),
        size_bytes: 100,
        created_at: 1_000,
        expires_at: None,
        last_accessed_at: 1_000 + tick as i64,
        access_tick: tick,
        access_count: count,
        priority: CachePriority::Normal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_names() {
        let w = (0.5, 0.5);
        assert_eq!(EvictionKind::Lru.build(w).name(), "lru");
        assert_eq!(EvictionKind::Lfu.build(w).name(), "lfu");
        assert_eq!(EvictionKind::Ttl.build(w).name(), "ttl");
        assert_eq!(EvictionKind::Priority.build(w).name(), "priority");
        assert_eq!(EvictionKind::Adaptive.build(w).name(), "adaptive");
    }

    #[test]
    fn test_select_victims_in_order() {
        let snapshot = TierSnapshot::new(vec![meta("c", 3, 1), meta("a", 1, 1), meta("b", 2, 1)], 5_000);
        let victims = LruStrategy.select_victims(&snapshot, 2);
        assert_eq!(victims, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_select_victims_stops_when_empty() {
        let snapshot = TierSnapshot::new(vec![meta("a", 1, 1)], 5_000);
        assert_eq!(LruStrategy.select_victims(&snapshot, 10).len(), 1);
        assert!(LruStrategy.select_victim(&TierSnapshot::default()).is_none());
    }

    #[test]
    fn test_kind_deserializes_lowercase() {
        let kind: EvictionKind = serde_json::from_str("\"adaptive\"").unwrap();
        assert_eq!(kind, EvictionKind::Adaptive);
        assert_eq!(kind.to_string(), "adaptive");
    }
}
