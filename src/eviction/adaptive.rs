// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use super::{EntryMeta, EvictionStrategy, TierSnapshot};

/// Blends recency and frequency into a keep-score (0.0 = evict first, 1.0 = keep).
///
/// Both components are normalized against the snapshot itself:
/// - recency: position of the entry's access tick between the oldest and newest tick
/// - frequency: `ln(1 + count) / ln(1 + max_count)`
#[derive(Debug, Clone)]
pub struct AdaptiveStrategy {
    pub recency_weight: f64,
    pub frequency_weight: f64,
}

impl Default for AdaptiveStrategy {
    fn default() -> Self {
        Self::new(0.5, 0.5)
    }
}

impl AdaptiveStrategy {
    #[must_use]
    pub fn new(recency_weight: f64, frequency_weight: f64) -> Self {
        Self {
            recency_weight: recency_weight.max(0.0),
            frequency_weight: frequency_weight.max(0.0),
        }
    }

    /// Score every entry of the snapshot.
    #[must_use]
    pub fn scores(&self, snapshot: &TierSnapshot) -> Vec<(String, f64)> {
        let Some(min_tick) = snapshot.entries.iter().map(|e| e.access_tick).min() else {
            return Vec::new();
        };
        let max_tick = snapshot.entries.iter().map(|e| e.access_tick).max().unwrap_or(min_tick);
        let max_count = snapshot.entries.iter().map(|e| e.access_count).max().unwrap_or(0);

        snapshot
            .entries
            .iter()
            .map(|e| (e.key.clone(), self.score(e, min_tick, max_tick, max_count)))
            .collect()
    }

    fn score(&self, entry: &EntryMeta, min_tick: u64, max_tick: u64, max_count: u64) -> f64 {
        let span = max_tick - min_tick;
        let recency = if span == 0 {
            1.0
        } else {
            (entry.access_tick - min_tick) as f64 / span as f64
        };

        let frequency = if max_count == 0 {
            0.0
        } else {
            (1.0 + entry.access_count as f64).ln() / (1.0 + max_count as f64).ln()
        };

        let total = self.recency_weight + self.frequency_weight;
        if total <= 0.0 {
            return recency;
        }
        (recency * self.recency_weight + frequency * self.frequency_weight) / total
    }
}

impl EvictionStrategy for AdaptiveStrategy {
    fn name(&self) -> &'static str {
        "adaptive"
    }

    fn select_victim(&self, snapshot: &TierSnapshot) -> Option<String> {
        let scores = self.scores(snapshot);
        snapshot
            .entries
            .iter()
            .zip(scores.iter())
            .min_by(|(ea, (_, sa)), (eb, (_, sb))| {
                sa.total_cmp(sb)
                    .then_with(|| ea.access_tick.cmp(&eb.access_tick))
                    .then_with(|| ea.key.cmp(&eb.key))
            })
            .map(|(e, _)| e.key.clone())
    }
}
