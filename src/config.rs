//! Configuration for the data layer.
//!
//! Every threshold, interval and capacity the data layer uses lives here, so
//! there is exactly one authoritative value for each.
//!
//! # Example
//!
//! ```
//! use fund_data_layer::DataLayerConfig;
//!
//! let config = DataLayerConfig::default();
//! assert_eq!(config.down_threshold, 5);
//! assert_eq!(config.health_check_interval_secs, 300);
//!
//! let config = DataLayerConfig::from_toml_str(r#"
//!     l1_max_entries = 2
//!     l1_strategy = "lru"
//!
//!     [[sources]]
//!     id = "primary"
//!     display_name = "Primary API"
//!     base_endpoint = "https://funds.example.com/api"
//! "#).unwrap();
//! assert_eq!(config.l1_max_entries, 2);
//! assert_eq!(config.sources.len(), 1);
//! ```

use std::time::Duration;

use serde::Deserialize;

use crate::error::{DataLayerError, Result};
use crate::eviction::EvictionKind;

/// One upstream endpoint to register at startup.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct SourceConfig {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    pub base_endpoint: String,
    /// Serves `POST /funds/batch`
    #[serde(default)]
    pub supports_batch: bool,
}

/// Configuration for the data layer.
///
/// All fields have defaults. Configure `sources` (and usually `l2_path`) for
/// production use.
#[derive(Debug, Clone, Deserialize)]
pub struct DataLayerConfig {
    /// L1 (memory) capacity in entries
    #[serde(default = "default_l1_max_entries")]
    pub l1_max_entries: usize,
    /// L1 capacity in bytes
    #[serde(default = "default_l1_max_bytes")]
    pub l1_max_bytes: usize,
    #[serde(default = "default_l1_strategy")]
    pub l1_strategy: EvictionKind,
    /// Adaptive strategy weights (recency, frequency)
    #[serde(default = "default_adaptive_weight")]
    pub adaptive_recency_weight: f64,
    #[serde(default = "default_adaptive_weight")]
    pub adaptive_frequency_weight: f64,

    /// SQLite file for the durable L2 tier (None = in-memory, lost on restart)
    #[serde(default)]
    pub l2_path: Option<String>,
    #[serde(default = "default_l2_max_entries")]
    pub l2_max_entries: usize,
    #[serde(default = "default_l2_strategy")]
    pub l2_strategy: EvictionKind,

    /// Redis URL for the remote-backed L3 tier (None = in-process stand-in)
    #[serde(default)]
    pub l3_redis_url: Option<String>,
    #[serde(default = "default_l3_key_prefix")]
    pub l3_key_prefix: String,
    #[serde(default = "default_l3_max_entries")]
    pub l3_max_entries: usize,
    #[serde(default = "default_l3_strategy")]
    pub l3_strategy: EvictionKind,

    /// TTLs per value kind
    #[serde(default = "default_fund_ttl_secs")]
    pub fund_ttl_secs: u64,
    #[serde(default = "default_list_ttl_secs")]
    pub list_ttl_secs: u64,
    #[serde(default = "default_search_ttl_secs")]
    pub search_ttl_secs: u64,
    #[serde(default = "default_ranking_ttl_secs")]
    pub ranking_ttl_secs: u64,

    /// Upstream sources registered on start
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    /// Per-attempt timeout for upstream calls
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Consecutive failures before healthy → degraded
    #[serde(default = "default_degraded_threshold")]
    pub degraded_threshold: u32,
    /// Consecutive failures before any state → down
    #[serde(default = "default_down_threshold")]
    pub down_threshold: u32,
    /// Consecutive probe successes before down → healthy
    #[serde(default = "default_recovery_threshold")]
    pub recovery_threshold: u32,
    /// Sources tried per execute call (None = all registered)
    #[serde(default)]
    pub max_sources_tried: Option<usize>,
    /// Smoothing factor for the per-source response time average
    #[serde(default = "default_response_time_ema_alpha")]
    pub response_time_ema_alpha: f64,

    /// Background loops
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
    #[serde(default = "default_cache_sweep_interval_secs")]
    pub cache_sweep_interval_secs: u64,
    #[serde(default = "default_recovery_probe_interval_secs")]
    pub recovery_probe_interval_secs: u64,

    /// Self-check thresholds
    #[serde(default = "default_min_hit_rate")]
    pub min_hit_rate: f64,
    #[serde(default = "default_hit_rate_min_samples")]
    pub hit_rate_min_samples: u64,

    /// Sync
    #[serde(default = "default_sync_history_capacity")]
    pub sync_history_capacity: usize,
    #[serde(default = "default_consistency_sample_size")]
    pub consistency_sample_size: usize,
    /// Inconsistent fraction of a sample above which a full resync is recommended
    #[serde(default = "default_resync_ratio")]
    pub resync_ratio: f64,

    /// Bulk parsing workers
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default = "default_worker_queue_capacity")]
    pub worker_queue_capacity: usize,
    #[serde(default = "default_parse_batch_size")]
    pub parse_batch_size: usize,

    /// Per-subscriber event buffer
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,

    /// Durable-tier blobs above this size are zstd-compressed
    #[serde(default = "default_compress_threshold_bytes")]
    pub compress_threshold_bytes: usize,
}

fn default_l1_max_entries() -> usize { 1000 }
fn default_l1_max_bytes() -> usize { 64 * 1024 * 1024 } // 64 MB
fn default_l1_strategy() -> EvictionKind { EvictionKind::Adaptive }
fn default_adaptive_weight() -> f64 { 0.5 }
fn default_l2_max_entries() -> usize { 50_000 }
fn default_l2_strategy() -> EvictionKind { EvictionKind::Lru }
fn default_l3_key_prefix() -> String { "fund-data:".to_string() }
fn default_l3_max_entries() -> usize { 200_000 }
fn default_l3_strategy() -> EvictionKind { EvictionKind::Ttl }
fn default_fund_ttl_secs() -> u64 { 3600 }
fn default_list_ttl_secs() -> u64 { 900 }
fn default_search_ttl_secs() -> u64 { 600 }
fn default_ranking_ttl_secs() -> u64 { 1800 }
fn default_request_timeout_ms() -> u64 { 10_000 }
fn default_degraded_threshold() -> u32 { 2 }
fn default_down_threshold() -> u32 { 5 }
fn default_recovery_threshold() -> u32 { 3 }
fn default_response_time_ema_alpha() -> f64 { 0.3 }
fn default_health_check_interval_secs() -> u64 { 300 } // 5 minutes
fn default_cache_sweep_interval_secs() -> u64 { 60 }
fn default_recovery_probe_interval_secs() -> u64 { 30 }
fn default_min_hit_rate() -> f64 { 0.5 }
fn default_hit_rate_min_samples() -> u64 { 20 }
fn default_sync_history_capacity() -> usize { 50 }
fn default_consistency_sample_size() -> usize { 100 }
fn default_resync_ratio() -> f64 { 0.5 }
fn default_worker_count() -> usize { 4 }
fn default_worker_queue_capacity() -> usize { 64 }
fn default_parse_batch_size() -> usize { 500 }
fn default_event_channel_capacity() -> usize { 256 }
fn default_compress_threshold_bytes() -> usize { 4096 }

impl Default for DataLayerConfig {
    fn default() -> Self {
        Self {
            l1_max_entries: default_l1_max_entries(),
            l1_max_bytes: default_l1_max_bytes(),
            l1_strategy: default_l1_strategy(),
            adaptive_recency_weight: default_adaptive_weight(),
            adaptive_frequency_weight: default_adaptive_weight(),
            l2_path: None,
            l2_max_entries: default_l2_max_entries(),
            l2_strategy: default_l2_strategy(),
            l3_redis_url: None,
            l3_key_prefix: default_l3_key_prefix(),
            l3_max_entries: default_l3_max_entries(),
            l3_strategy: default_l3_strategy(),
            fund_ttl_secs: default_fund_ttl_secs(),
            list_ttl_secs: default_list_ttl_secs(),
            search_ttl_secs: default_search_ttl_secs(),
            ranking_ttl_secs: default_ranking_ttl_secs(),
            sources: Vec::new(),
            request_timeout_ms: default_request_timeout_ms(),
            degraded_threshold: default_degraded_threshold(),
            down_threshold: default_down_threshold(),
            recovery_threshold: default_recovery_threshold(),
            max_sources_tried: None,
            response_time_ema_alpha: default_response_time_ema_alpha(),
            health_check_interval_secs: default_health_check_interval_secs(),
            cache_sweep_interval_secs: default_cache_sweep_interval_secs(),
            recovery_probe_interval_secs: default_recovery_probe_interval_secs(),
            min_hit_rate: default_min_hit_rate(),
            hit_rate_min_samples: default_hit_rate_min_samples(),
            sync_history_capacity: default_sync_history_capacity(),
            consistency_sample_size: default_consistency_sample_size(),
            resync_ratio: default_resync_ratio(),
            worker_count: default_worker_count(),
            worker_queue_capacity: default_worker_queue_capacity(),
            parse_batch_size: default_parse_batch_size(),
            event_channel_capacity: default_event_channel_capacity(),
            compress_threshold_bytes: default_compress_threshold_bytes(),
        }
    }
}

impl DataLayerConfig {
    /// Shorter intervals and smaller caches for local development.
    #[must_use]
    pub fn development() -> Self {
        Self {
            l1_max_entries: 200,
            health_check_interval_secs: 30,
            cache_sweep_interval_secs: 15,
            recovery_probe_interval_secs: 10,
            list_ttl_secs: 120,
            search_ttl_secs: 120,
            ..Self::default()
        }
    }

    /// Larger caches for production deployments.
    #[must_use]
    pub fn production() -> Self {
        Self {
            l1_max_entries: 5000,
            l1_max_bytes: 256 * 1024 * 1024,
            l2_max_entries: 200_000,
            ..Self::default()
        }
    }

    /// Parse a TOML document; missing fields take their defaults.
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: Self = toml::from_str(input)
            .map_err(|e| DataLayerError::Initialization(format!("invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject combinations the health state machine or tiers cannot work with.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(DataLayerError::Initialization(msg.to_string()));

        if self.l1_max_entries == 0 || self.l1_max_bytes == 0 {
            return fail("l1 capacity must be non-zero");
        }
        if self.l2_max_entries == 0 || self.l3_max_entries == 0 {
            return fail("l2/l3 capacity must be non-zero");
        }
        if self.degraded_threshold == 0 || self.degraded_threshold >= self.down_threshold {
            return fail("degraded_threshold must be in 1..down_threshold");
        }
        if self.recovery_threshold == 0 {
            return fail("recovery_threshold must be non-zero");
        }
        if self.adaptive_recency_weight < 0.0
            || self.adaptive_frequency_weight < 0.0
            || self.adaptive_recency_weight + self.adaptive_frequency_weight <= 0.0
        {
            return fail("adaptive weights must be non-negative with a positive sum");
        }
        if !(0.0..=1.0).contains(&self.min_hit_rate) || !(0.0..=1.0).contains(&self.resync_ratio) {
            return fail("min_hit_rate and resync_ratio must be within 0..=1");
        }
        if !(0.0..=1.0).contains(&self.response_time_ema_alpha) || self.response_time_ema_alpha == 0.0 {
            return fail("response_time_ema_alpha must be within (0, 1]");
        }
        if self.worker_count == 0 || self.worker_queue_capacity == 0 || self.parse_batch_size == 0 {
            return fail("worker pool sizes must be non-zero");
        }
        if self.event_channel_capacity == 0 {
            return fail("event_channel_capacity must be non-zero");
        }
        let mut ids: Vec<&str> = self.sources.iter().map(|s| s.id.as_str()).collect();
        ids.sort_unstable();
        if ids.windows(2).any(|w| w[0] == w[1]) {
            return fail("source ids must be unique");
        }
        Ok(())
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
