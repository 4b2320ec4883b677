// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Data layer coordinator.
//!
//! The [`DataLayerCoordinator`] is the main orchestrator that ties together all components:
//! - three cache tiers (L1 memory, L2 SQLite, L3 Redis) read cache-aside
//! - the data source switcher with health tracking and failover
//! - the sync manager (full/incremental/selective sync, consistency reports)
//! - the event bus and the background worker pool
//!
//! # Lifecycle
//!
//! ```text
//! Created → Initializing → Ready → ShuttingDown → Disposed
//! ```
//!
//! Queries are only served in `Ready`; anywhere else they fail with
//! [`DataLayerError::NotReady`].
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use fund_data_layer::{DataLayerConfig, DataLayerCoordinator, CoordinatorState};
//! use fund_data_layer::model::FundCriteria;
//!
//! # #[tokio::main]
//! # async fn main() -> fund_data_layer::Result<()> {
//! let config = DataLayerConfig::from_toml_str(r#"
//!     [[sources]]
//!     id = "primary"
//!     base_endpoint = "https://funds.example.com/api"
//! "#)?;
//! let coordinator = Arc::new(DataLayerCoordinator::from_config(config).await?);
//! coordinator.start().await?;
//! assert_eq!(coordinator.state(), CoordinatorState::Ready);
//!
//! let funds = coordinator.get_funds(&FundCriteria::default(), false, None).await?;
//! println!("{} funds", funds.len());
//!
//! coordinator.dispose().await;
//! # Ok(())
//! # }
//! ```

mod api;
mod health;
mod inflight;
mod lifecycle;
mod types;

pub use types::{CoordinatorState, DataLayerStats, HealthReport};

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::DataLayerConfig;
use crate::error::{DataLayerError, Result};
use crate::events::{EventBus, Subscription};
use crate::model::{Fund, FundRanking};
use crate::source::{DataSource, DataSourceDescriptor, DataSourceSwitcher, HttpDataSource};
use crate::sync::{ConsistencyReport, SyncManager, SyncOperationRecord, SyncSettings};
use crate::tier::{CacheTier, MemoryTier, RedisTier, SqlTier, TierStack};
use crate::worker::WorkerPool;

use inflight::RequestCoalescer;

/// Main data layer coordinator.
///
/// # Thread Safety
///
/// The coordinator is `Send + Sync`; query methods take `&self` and may be
/// called concurrently. [`start`](Self::start) takes `&Arc<Self>` because
/// the background loops hold a weak reference back to it.
pub struct DataLayerCoordinator {
    pub(super) config: DataLayerConfig,

    /// Lifecycle state (broadcast to watchers)
    pub(super) state: watch::Sender<CoordinatorState>,
    pub(super) state_rx: watch::Receiver<CoordinatorState>,

    pub(super) tiers: TierStack,
    pub(super) switcher: Arc<DataSourceSwitcher>,
    pub(super) sync: Arc<SyncManager>,
    pub(super) workers: Arc<WorkerPool>,
    pub(super) events: Arc<EventBus>,

    /// In-flight list/search fetches keyed by cache key
    pub(super) fund_lists: Arc<RequestCoalescer<Result<Vec<Fund>>>>,
    pub(super) rankings: Arc<RequestCoalescer<Result<Vec<FundRanking>>>>,
    /// In-flight per-code fetches; one entry per code, shared by a group
    pub(super) fund_codes: Arc<RequestCoalescer<Result<Arc<HashMap<String, Fund>>>>>,

    /// Normalized search term → times searched
    pub(super) search_usage: DashMap<String, u64>,

    /// Queries answered by any tier / by the source (cumulative)
    pub(super) query_hits: AtomicU64,
    pub(super) query_misses: AtomicU64,
    /// (hits, misses) at the previous self-check
    pub(super) last_check_counts: Mutex<(u64, u64)>,

    pub(super) shutdown: watch::Sender<bool>,
    pub(super) background: Mutex<Vec<JoinHandle<()>>>,
}

impl DataLayerCoordinator {
    /// Assemble a coordinator from explicitly constructed tiers and sources.
    ///
    /// Must be called inside a Tokio runtime (the worker pool spawns its
    /// tasks here). The coordinator starts in `Created`; call
    /// [`start()`](Self::start) to make it serve queries.
    pub fn new(config: DataLayerConfig, tiers: TierStack, sources: Vec<Arc<dyn DataSource>>) -> Result<Self> {
        config.validate()?;

        let events = Arc::new(EventBus::new(config.event_channel_capacity));
        let switcher = Arc::new(DataSourceSwitcher::from_config(&config, events.clone()));
        for source in sources {
            switcher.register(source)?;
        }
        let workers = Arc::new(WorkerPool::new(config.worker_count, config.worker_queue_capacity));
        let sync = Arc::new(SyncManager::new(
            tiers.clone(),
            switcher.clone(),
            workers.clone(),
            events.clone(),
            SyncSettings::from_config(&config),
        ));

        let (state_tx, state_rx) = watch::channel(CoordinatorState::Created);
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            state: state_tx,
            state_rx,
            tiers,
            switcher,
            sync,
            workers,
            events,
            fund_lists: RequestCoalescer::new(),
            rankings: RequestCoalescer::new(),
            fund_codes: RequestCoalescer::new(),
            search_usage: DashMap::new(),
            query_hits: AtomicU64::new(0),
            query_misses: AtomicU64::new(0),
            last_check_counts: Mutex::new((0, 0)),
            shutdown: shutdown_tx,
            background: Mutex::new(Vec::new()),
        })
    }

    /// Build tiers and HTTP sources from configuration.
    ///
    /// L2 is SQLite at `l2_path` (in-memory SQLite when unset). L3 is Redis at
    /// `l3_redis_url`; without a URL an in-process memory tier stands in.
    pub async fn from_config(config: DataLayerConfig) -> Result<Self> {
        config.validate()?;
        let weights = (config.adaptive_recency_weight, config.adaptive_frequency_weight);
        let init = |tier: &str, e: &dyn std::fmt::Display| {
            DataLayerError::Initialization(format!("{} tier: {}", tier, e))
        };

        let l1: Arc<dyn CacheTier> = Arc::new(MemoryTier::new(
            "L1",
            config.l1_max_entries,
            config.l1_max_bytes,
            config.l1_strategy.build(weights),
        ));

        let l2 = match config.l2_path.as_deref() {
            Some(path) => SqlTier::open(path).await,
            None => SqlTier::in_memory().await,
        }
        .map_err(|e| init("L2", &e))?
        .with_capacity(config.l2_max_entries)
        .with_strategy(config.l2_strategy.build(weights))
        .with_compress_threshold(config.compress_threshold_bytes);
        let l2: Arc<dyn CacheTier> = Arc::new(l2);

        let l3: Arc<dyn CacheTier> = match config.l3_redis_url.as_deref() {
            Some(url) => Arc::new(
                RedisTier::connect(url, &config.l3_key_prefix)
                    .await
                    .map_err(|e| init("L3", &e))?
                    .with_compress_threshold(config.compress_threshold_bytes),
            ),
            None => {
                info!("No Redis URL configured, L3 runs in-process");
                Arc::new(MemoryTier::new(
                    "L3",
                    config.l3_max_entries,
                    usize::MAX,
                    config.l3_strategy.build(weights),
                ))
            }
        };

        let timeout = config.request_timeout();
        let sources = config
            .sources
            .iter()
            .map(|source| {
                HttpDataSource::new(source, timeout)
                    .map(|s| Arc::new(s) as Arc<dyn DataSource>)
                    .map_err(|e| DataLayerError::Initialization(format!("source '{}': {}", source.id, e)))
            })
            .collect::<Result<Vec<_>>>()?;

        Self::new(config, TierStack::new(l1, l2, l3), sources)
    }

    /// Get current lifecycle state.
    #[must_use]
    pub fn state(&self) -> CoordinatorState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<CoordinatorState> {
        self.state_rx.clone()
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state() == CoordinatorState::Ready
    }

    pub(super) fn set_state(&self, state: CoordinatorState) {
        crate::metrics::set_coordinator_state(&state.to_string());
        let _ = self.state.send(state);
    }

    pub(super) fn ensure_ready(&self) -> Result<()> {
        match self.state() {
            CoordinatorState::Ready => Ok(()),
            other => Err(DataLayerError::NotReady(other)),
        }
    }

    #[must_use]
    pub fn config(&self) -> &DataLayerConfig {
        &self.config
    }

    /// The tier stack, for administration and diagnostics.
    #[must_use]
    pub fn tiers(&self) -> &TierStack {
        &self.tiers
    }

    // ========== Events ==========

    pub fn subscribe(&self) -> Subscription {
        self.events.subscribe()
    }

    pub fn unsubscribe(&self, subscription_id: u64) -> bool {
        self.events.unsubscribe(subscription_id)
    }

    // ========== Sources ==========

    /// Add an upstream source. Allowed in any state before disposal.
    pub fn register_source(&self, source: Arc<dyn DataSource>) -> Result<()> {
        if matches!(self.state(), CoordinatorState::ShuttingDown | CoordinatorState::Disposed) {
            return Err(DataLayerError::NotReady(self.state()));
        }
        self.switcher.register(source)
    }

    #[must_use]
    pub fn source_descriptors(&self) -> Vec<DataSourceDescriptor> {
        self.switcher.descriptors()
    }

    #[must_use]
    pub fn active_source(&self) -> Option<String> {
        self.switcher.active_source()
    }

    /// Probe every source now and return the updated descriptors.
    pub async fn run_health_checks(&self) -> Vec<DataSourceDescriptor> {
        self.switcher.run_health_checks().await
    }

    /// Probe down/recovering sources now. Returns how many became healthy.
    pub async fn probe_down_sources(&self) -> usize {
        self.switcher.probe_down_sources().await
    }

    // ========== Sync ==========

    pub async fn sync_full(&self) -> Result<SyncOperationRecord> {
        self.ensure_ready()?;
        Ok(self.sync.sync_full().await)
    }

    pub async fn sync_incremental(&self, since: Option<String>) -> Result<SyncOperationRecord> {
        self.ensure_ready()?;
        Ok(self.sync.sync_incremental(since).await)
    }

    pub async fn sync_selective(&self, codes: Vec<String>) -> Result<SyncOperationRecord> {
        self.ensure_ready()?;
        Ok(self.sync.sync_selective(codes).await)
    }

    /// Sample local fingerprints against the source. Divergence is reported,
    /// never repaired; act on it with [`refresh_cache`](Self::refresh_cache).
    pub async fn validate_consistency(&self) -> Result<ConsistencyReport> {
        self.ensure_ready()?;
        self.sync.validate_consistency().await
    }

    /// Finished sync runs, oldest first.
    #[must_use]
    pub fn sync_history(&self) -> Vec<SyncOperationRecord> {
        self.sync.history()
    }
}
