// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for the data layer.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The embedding application is responsible for installing an exporter.
//!
//! # Metric Naming Convention
//! - `fund_data_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `tier`: L1, L2, L3
//! - `source`: data source id
//! - `operation`: get, put, remove, funds, search, batch, ...
//! - `status`: success, error, timeout

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record a cache tier operation outcome
pub fn record_operation(tier: &str, operation: &str, status: &str) {
    counter!(
        "fund_data_tier_operations_total",
        "tier" => tier.to_string(),
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record operation latency
pub fn record_latency(tier: &str, operation: &str, duration: Duration) {
    histogram!(
        "fund_data_operation_seconds",
        "tier" => tier.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a cache lookup against a tier
pub fn record_cache_lookup(tier: &str, hit: bool) {
    let outcome = if hit { "hit" } else { "miss" };
    counter!(
        "fund_data_cache_lookups_total",
        "tier" => tier.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

/// Record entries evicted from a tier to make room
pub fn record_eviction(tier: &str, count: usize, bytes: usize) {
    counter!("fund_data_evictions_total", "tier" => tier.to_string()).increment(count as u64);
    counter!("fund_data_evicted_bytes_total", "tier" => tier.to_string()).increment(bytes as u64);
}

/// Record a tier error that was downgraded to a miss
pub fn record_tier_error(tier: &str, operation: &str, error_type: &str) {
    counter!(
        "fund_data_tier_errors_total",
        "tier" => tier.to_string(),
        "operation" => operation.to_string(),
        "error_type" => error_type.to_string()
    )
    .increment(1);
}

/// Set L1 cache size gauges
pub fn set_l1_cache_size(items: usize, bytes: usize) {
    gauge!("fund_data_l1_cache_items").set(items as f64);
    gauge!("fund_data_l1_cache_bytes").set(bytes as f64);
}

/// Set per-tier hit rate gauge
pub fn set_tier_hit_rate(tier: &str, hit_rate: f64) {
    gauge!("fund_data_tier_hit_rate", "tier" => tier.to_string()).set(hit_rate);
}

// ═══════════════════════════════════════════════════════════════════════════
// Data sources
// ═══════════════════════════════════════════════════════════════════════════

/// Record one upstream attempt
pub fn record_source_request(source: &str, operation: &str, status: &str, duration: Duration) {
    counter!(
        "fund_data_source_requests_total",
        "source" => source.to_string(),
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!(
        "fund_data_source_request_seconds",
        "source" => source.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Set source health gauge (0 = unknown, 1 = healthy, 2 = degraded, 3 = recovering, 4 = down)
pub fn set_source_health(source: &str, state: u8) {
    gauge!(
        "fund_data_source_health",
        "source" => source.to_string()
    )
    .set(state as f64);
}

/// Record a switch of the active source
pub fn record_source_switch(to: &str) {
    counter!("fund_data_source_switches_total", "to" => to.to_string()).increment(1);
}

/// Record an execute call that ran out of sources
pub fn record_sources_exhausted(operation: &str) {
    counter!(
        "fund_data_sources_exhausted_total",
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Record a request that joined an in-flight upstream call instead of issuing its own
pub fn record_coalesced(operation: &str) {
    counter!(
        "fund_data_coalesced_requests_total",
        "operation" => operation.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// Sync
// ═══════════════════════════════════════════════════════════════════════════

/// Record a finished sync operation
pub fn record_sync(sync_type: &str, success: bool, duration: Duration) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "fund_data_syncs_total",
        "type" => sync_type.to_string(),
        "status" => status
    )
    .increment(1);
    histogram!("fund_data_sync_seconds", "type" => sync_type.to_string()).record(duration.as_secs_f64());
}

/// Record items changed by a sync
pub fn record_sync_items(added: u64, updated: u64, deleted: u64) {
    counter!("fund_data_sync_items_total", "change" => "added").increment(added);
    counter!("fund_data_sync_items_total", "change" => "updated").increment(updated);
    counter!("fund_data_sync_items_total", "change" => "deleted").increment(deleted);
}

/// Record a consistency validation pass
pub fn record_consistency_check(checked: usize, inconsistent: usize) {
    counter!("fund_data_consistency_checked_total").increment(checked as u64);
    counter!("fund_data_consistency_inconsistent_total").increment(inconsistent as u64);
}

// ═══════════════════════════════════════════════════════════════════════════
// Events, workers, lifecycle
// ═══════════════════════════════════════════════════════════════════════════

/// Record an event delivered to (or dropped for) subscribers
pub fn record_event(kind: &str, delivered: bool) {
    let outcome = if delivered { "delivered" } else { "dropped" };
    counter!(
        "fund_data_events_total",
        "kind" => kind.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

/// Set worker queue depth gauge
pub fn set_worker_queue_depth(depth: usize) {
    gauge!("fund_data_worker_queue_depth").set(depth as f64);
}

/// Record a worker job outcome
pub fn record_worker_job(status: &str, duration: Duration) {
    counter!("fund_data_worker_jobs_total", "status" => status.to_string()).increment(1);
    histogram!("fund_data_worker_job_seconds").record(duration.as_secs_f64());
}

/// Track coordinator state transitions
pub fn set_coordinator_state(state: &str) {
    counter!(
        "fund_data_coordinator_state_transitions_total",
        "state" => state.to_string()
    )
    .increment(1);
}

/// Record total startup time
pub fn record_startup_total(duration: Duration) {
    histogram!("fund_data_startup_seconds").record(duration.as_secs_f64());
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    tier: &'static str,
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(tier: &'static str, operation: &'static str) -> Self {
        Self {
            tier,
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.tier, self.operation, self.start.elapsed());
    }
}
