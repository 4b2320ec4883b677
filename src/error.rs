// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Caller-facing error taxonomy.
//!
//! Tier-level and single-source failures are recovered inside the data layer
//! (fallback to the next tier or source). Only the variants below ever reach
//! a caller of [`DataLayerCoordinator`](crate::DataLayerCoordinator).

use thiserror::Error;

use crate::coordinator::CoordinatorState;

/// Errors surfaced by the data layer.
///
/// `Clone` so a coalesced upstream result can be handed to every caller that
/// joined the same in-flight request.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DataLayerError {
    /// A cache tier cannot be read or written. Query paths degrade this to a
    /// miss; it escapes from tier administration calls and fails sync runs
    /// that cannot write L2.
    #[error("cache tier '{tier}' unavailable: {reason}")]
    CacheUnavailable { tier: String, reason: String },

    /// Every candidate source failed within one `execute` call.
    #[error("all data sources exhausted after trying [{}]: {last_error}", attempted.join(", "))]
    DataSourceExhausted {
        attempted: Vec<String>,
        last_error: String,
    },

    /// The last source tried exceeded its allotted time.
    #[error("data source '{source_id}' timed out after {after_ms}ms")]
    Timeout { source_id: String, after_ms: u64 },

    /// Local and remote state diverge in a way automatic reconciliation cannot resolve.
    #[error("sync conflict on {} key(s)", keys.len())]
    SyncConflict { keys: Vec<String> },

    /// A dependency failed to start; the coordinator never became ready.
    #[error("initialization failed: {0}")]
    Initialization(String),

    /// Operation attempted outside the `Ready` state.
    #[error("data layer not ready (state: {0})")]
    NotReady(CoordinatorState),

    /// The background worker pool rejected or lost a job.
    #[error("worker pool error: {0}")]
    WorkerPool(String),
}

impl DataLayerError {
    /// Short label used for the `error_type` metric dimension.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CacheUnavailable { .. } => "cache_unavailable",
            Self::DataSourceExhausted { .. } => "source_exhausted",
            Self::Timeout { .. } => "timeout",
            Self::SyncConflict { .. } => "sync_conflict",
            Self::Initialization(_) => "initialization",
            Self::NotReady(_) => "not_ready",
            Self::WorkerPool(_) => "worker_pool",
        }
    }
}

pub type Result<T> = std::result::Result<T, DataLayerError>;
