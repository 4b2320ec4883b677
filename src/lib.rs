//! # Fund Data Layer
//!
//! A tiered data layer for mutual-fund data: a three-tier cache in front of
//! one or more upstream fund-data sources, with health-tracked failover and
//! incremental synchronization.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   DataLayerCoordinator                      │
//! │  • get_funds / search_funds / get_fund_rankings (cache-aside)│
//! │  • get_batch_funds (per-code request coalescing)           │
//! │  • self-check, expiry sweep and recovery probe loops       │
//! └─────────────────────────────────────────────────────────────┘
//!          │                    │                      │
//!          ▼                    ▼                      ▼
//! ┌─────────────────┐ ┌───────────────────┐ ┌────────────────────┐
//! │   TierStack     │ │ DataSourceSwitcher│ │    SyncManager     │
//! │ L1 memory       │ │ health state      │ │ full / incremental │
//! │ L2 SQLite       │ │ EMA latency       │ │ selective sync     │
//! │ L3 Redis        │ │ ordered failover  │ │ consistency report │
//! └─────────────────┘ └───────────────────┘ └────────────────────┘
//! ```
//!
//! Reads check L1, then L2, then L3; a hit in a slower tier is copied into
//! the faster ones. A miss everywhere goes to the active source, and
//! concurrent misses for the same key share a single upstream request.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use fund_data_layer::{DataLayerConfig, DataLayerCoordinator};
//!
//! # #[tokio::main]
//! # async fn main() -> fund_data_layer::Result<()> {
//! let config = DataLayerConfig::from_toml_str(r#"
//!     l2_path = "fund-cache.db"
//!
//!     [[sources]]
//!     id = "primary"
//!     base_endpoint = "https://funds.example.com/api"
//! "#)?;
//!
//! let coordinator = Arc::new(DataLayerCoordinator::from_config(config).await?);
//! coordinator.start().await?;
//!
//! let funds = coordinator
//!     .get_batch_funds(&["000001".to_string(), "110022".to_string()])
//!     .await?;
//! println!("{} funds", funds.len());
//!
//! let record = coordinator.sync_incremental(None).await?;
//! println!("sync {}: +{} ~{} -{}", record.sync_id, record.items_added, record.items_updated, record.items_deleted);
//!
//! coordinator.dispose().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`coordinator`]: the [`DataLayerCoordinator`] tying everything together
//! - [`tier`]: cache tiers (memory, SQLite, Redis) and the [`TierStack`]
//! - [`eviction`]: LRU, LFU, TTL, priority and adaptive eviction strategies
//! - [`source`]: upstream sources, health tracking and failover
//! - [`sync`]: sync runs, history and consistency reports
//! - [`events`]: the in-process event bus
//! - [`resilience`]: retry policies

pub mod codec;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod eviction;
pub mod metrics;
pub mod model;
pub mod payload;
pub mod resilience;
pub mod source;
pub mod sync;
pub mod tier;
pub mod worker;

// Note: We don't expose a `tracing` module to avoid conflict with the tracing crate

pub use config::{DataLayerConfig, SourceConfig};
pub use coordinator::{CoordinatorState, DataLayerCoordinator, DataLayerStats, HealthReport};
pub use error::{DataLayerError, Result};
pub use events::{DataLayerEvent, EventBus, Subscription};
pub use eviction::{EvictionKind, EvictionStrategy};
pub use model::{Fund, FundCriteria, FundRanking, RankingCriteria, RankingPeriod};
pub use payload::CachedValue;
pub use source::{DataSource, DataSourceDescriptor, SourceError, SourceHealth, SourceRequest, SourceResponse};
pub use sync::{ConsistencyReport, SyncOperationRecord, SyncType};
pub use tier::{CacheTier, CachePriority, PutOptions, TierLevel, TierStack};
pub use resilience::retry::RetryConfig;
pub use metrics::LatencyTimer;
