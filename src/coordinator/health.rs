//! Health reporting, self-check and statistics.

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;

use tracing::{info, instrument, warn};

use crate::events::DataLayerEvent;
use crate::source::SourceHealth;
use crate::tier::{now_millis, TierLevel};

use super::{CoordinatorState, DataLayerCoordinator, DataLayerStats, HealthReport};

impl DataLayerCoordinator {
    /// Aggregate tier hit rates, sync failures and source health.
    pub async fn get_health_report(&self) -> HealthReport {
        let mut issues = Vec::new();

        let state = self.state();
        if state != CoordinatorState::Ready {
            issues.push(format!("coordinator is {}", state));
        }

        let mut tier_hit_rates = BTreeMap::new();
        for (level, stats) in self.tiers.stats().await {
            if stats.lookups() > 0 {
                crate::metrics::set_tier_hit_rate(level.as_str(), stats.hit_rate());
                tier_hit_rates.insert(level.to_string(), stats.hit_rate());
            }
        }

        let (hits, misses) = self.query_counts();
        let lookups = hits + misses;
        if lookups >= self.config.hit_rate_min_samples {
            let rate = hits as f64 / lookups as f64;
            if rate < self.config.min_hit_rate {
                issues.push(format!(
                    "cache hit rate {:.2} below {:.2}",
                    rate, self.config.min_hit_rate
                ));
            }
        }

        let sync_failures = self.sync.failure_count();
        if let Some(last) = self.sync.last_record().filter(|r| !r.success) {
            issues.push(format!(
                "last {} sync failed: {}",
                last.sync_type,
                last.error_detail.as_deref().unwrap_or("unknown error")
            ));
        }

        let sources = self.switcher.descriptors();
        if sources.is_empty() {
            issues.push("no data sources registered".to_string());
        }
        for source in sources.iter().filter(|s| s.health == SourceHealth::Down) {
            issues.push(format!("data source '{}' is down", source.id));
        }
        if !sources.is_empty() && !self.switcher.active_is_healthy() {
            issues.push("active data source is unhealthy".to_string());
        }

        HealthReport {
            is_healthy: issues.is_empty(),
            issues,
            tier_hit_rates,
            sync_failures,
            sources,
            active_source: self.switcher.active_source(),
            checked_at: now_millis(),
        }
    }

    /// Re-validate dependencies and react to breached thresholds:
    ///
    /// - hit rate since the previous check below `min_hit_rate` (with at
    ///   least `hit_rate_min_samples` lookups): refresh the cache
    /// - every registered source is probed first, so sources that stopped
    ///   receiving traffic still move towards down or back to healthy
    /// - a sync failed since the previous check: run an incremental sync
    ///
    /// Publishes `HealthDegraded` when the resulting report has issues.
    #[instrument(skip(self))]
    pub async fn run_self_check(&self) -> HealthReport {
        if self.is_ready() {
            let sources = self.switcher.run_health_checks().await;
            let unhealthy = sources.iter().filter(|s| s.health != SourceHealth::Healthy).count();
            if unhealthy > 0 {
                warn!(unhealthy, total = sources.len(), "Some data sources are not healthy");
            }

            let (hits, misses) = self.query_counts();
            let (window_hits, window_misses) = {
                let mut last = self.last_check_counts.lock();
                let window = (hits.saturating_sub(last.0), misses.saturating_sub(last.1));
                *last = (hits, misses);
                window
            };
            let window = window_hits + window_misses;
            if window >= self.config.hit_rate_min_samples {
                let rate = window_hits as f64 / window as f64;
                if rate < self.config.min_hit_rate {
                    warn!(hit_rate = rate, lookups = window, "Hit rate below threshold, refreshing cache");
                    if let Err(e) = self.refresh_cache(None).await {
                        warn!(error = %e, "Self-check cache refresh failed");
                    }
                }
            }

            let failures = self.sync.take_recent_failures();
            if failures > 0 {
                warn!(failures, "Sync failed since last check, running incremental sync");
                self.sync.sync_incremental(None).await;
            }
        }

        let report = self.get_health_report().await;
        if report.is_healthy {
            info!("Self-check healthy");
        } else {
            warn!(issues = ?report.issues, "Self-check found issues");
            self.events.publish(DataLayerEvent::HealthDegraded {
                issues: report.issues.clone(),
            });
        }
        report
    }

    /// Current statistics for dashboards.
    pub async fn stats(&self) -> DataLayerStats {
        let (hits, misses) = self.query_counts();
        let cache_hit_rate = if hits + misses == 0 {
            0.0
        } else {
            hits as f64 / (hits + misses) as f64
        };

        let latencies: Vec<f64> = self
            .switcher
            .descriptors()
            .iter()
            .filter_map(|d| d.average_response_time_ms)
            .collect();
        let average_response_time_ms = if latencies.is_empty() {
            0.0
        } else {
            latencies.iter().sum::<f64>() / latencies.len() as f64
        };

        let (memory_cache_entries, memory_cache_bytes) = match self.tiers.tier(TierLevel::L1).stats().await {
            Ok(stats) => (stats.valid_count, stats.size_bytes),
            Err(e) => {
                warn!(error = %e, "L1 stats unavailable");
                (0, 0)
            }
        };
        crate::metrics::set_l1_cache_size(memory_cache_entries as usize, memory_cache_bytes as usize);

        DataLayerStats {
            cache_hit_rate,
            average_response_time_ms,
            memory_cache_entries,
            memory_cache_bytes,
        }
    }

    fn query_counts(&self) -> (u64, u64) {
        (
            self.query_hits.load(Ordering::Relaxed),
            self.query_misses.load(Ordering::Relaxed),
        )
    }
}
