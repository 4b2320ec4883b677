//! Public types for the data layer coordinator.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::source::DataSourceDescriptor;

/// Coordinator lifecycle state.
///
/// Use [`super::DataLayerCoordinator::state()`] to check the current state or
/// [`super::DataLayerCoordinator::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CoordinatorState {
    /// Constructed, not yet started
    Created,
    /// Restoring sync state and starting background loops
    Initializing,
    /// Serving queries
    Ready,
    /// `dispose` in progress
    ShuttingDown,
    /// Every resource released; terminal
    Disposed,
}

impl std::fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Initializing => write!(f, "Initializing"),
            Self::Ready => write!(f, "Ready"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
            Self::Disposed => write!(f, "Disposed"),
        }
    }
}

/// Aggregated health of tiers, sync and sources.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub is_healthy: bool,
    /// Human-readable problems; empty when healthy
    pub issues: Vec<String>,
    /// Tier name → hit rate (tiers with no lookups yet are omitted)
    pub tier_hit_rates: BTreeMap<String, f64>,
    /// Failed runs in the sync history
    pub sync_failures: usize,
    pub sources: Vec<DataSourceDescriptor>,
    pub active_source: Option<String>,
    /// Epoch millis
    pub checked_at: i64,
}

/// Dashboard statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataLayerStats {
    /// Overall hit rate across all tiers
    pub cache_hit_rate: f64,
    /// Mean of the sources' smoothed response times
    pub average_response_time_ms: f64,
    pub memory_cache_entries: u64,
    pub memory_cache_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(format!("{}", CoordinatorState::Created), "Created");
        assert_eq!(format!("{}", CoordinatorState::Ready), "Ready");
        assert_eq!(format!("{}", CoordinatorState::Disposed), "Disposed");
    }
}
