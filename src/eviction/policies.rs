// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Classic eviction policies.
//!
//! Each policy is a total order over entries; the minimum is the victim.
//! Ties always end in key comparison.

use super::{EntryMeta, EvictionStrategy, TierSnapshot};

fn min_by_key<K: Ord>(snapshot: &TierSnapshot, rank: impl Fn(&EntryMeta) -> K) -> Option<String> {
    snapshot
        .entries
        .iter()
        .min_by(|a, b| rank(a).cmp(&rank(b)).then_with(|| a.key.cmp(&b.key)))
        .map(|e| e.key.clone())
}

/// Least recently used.
#[derive(Debug, Clone, Copy, Default)]
pub struct LruStrategy;

impl EvictionStrategy for LruStrategy {
    fn name(&self) -> &'static str {
        "lru"
    }

    fn select_victim(&self, snapshot: &TierSnapshot) -> Option<String> {
        min_by_key(snapshot, |e| e.access_tick)
    }
}

/// Least frequently used; recency breaks ties.
#[derive(Debug, Clone, Copy, Default)]
pub struct LfuStrategy;

impl EvictionStrategy for LfuStrategy {
    fn name(&self) -> &'static str {
        "lfu"
    }

    fn select_victim(&self, snapshot: &TierSnapshot) -> Option<String> {
        min_by_key(snapshot, |e| (e.access_count, e.access_tick))
    }
}

/// Earliest expiry first, regardless of usage. Entries without an expiry
/// sort after all expiring ones and fall back to LRU among themselves.
#[derive(Debug, Clone, Copy, Default)]
pub struct TtlStrategy;

impl EvictionStrategy for TtlStrategy {
    fn name(&self) -> &'static str {
        "ttl"
    }

    fn select_victim(&self, snapshot: &TierSnapshot) -> Option<String> {
        min_by_key(snapshot, |e| (e.expires_at.unwrap_or(i64::MAX), e.access_tick))
    }
}

/// Lowest priority first, LRU within a priority. `Critical` entries sort last,
/// so they are only chosen when nothing else is left.
#[derive(Debug, Clone, Copy, Default)]
pub struct PriorityStrategy;

impl EvictionStrategy for PriorityStrategy {
    fn name(&self) -> &'static str {
        "priority"
    }

    fn select_victim(&self, snapshot: &TierSnapshot) -> Option<String> {
        min_by_key(snapshot, |e| (e.priority, e.access_tick))
    }
}
