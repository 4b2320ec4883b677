//! Typed cache values.
//!
//! Every tier stores a [`CachedValue`]: one variant per data kind, so a cache
//! read can never hand back the wrong shape. The durable tiers serialize it
//! through [`crate::codec`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::model::{Fund, FundRanking};

/// Sync cursor and per-fund fingerprints, persisted so incremental sync
/// survives restarts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncStateSnapshot {
    /// Opaque cursor returned by the source on the last successful sync
    pub version_token: Option<String>,
    /// Fund code → content fingerprint of what local tiers hold
    pub index: BTreeMap<String, String>,
}

/// A value held by a cache tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum CachedValue {
    Fund(Fund),
    FundList(Vec<Fund>),
    SearchResult(Vec<Fund>),
    Ranking(Vec<FundRanking>),
    SyncState(SyncStateSnapshot),
}

impl CachedValue {
    /// Variant label for logs and metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Fund(_) => "fund",
            Self::FundList(_) => "fund_list",
            Self::SearchResult(_) => "search_result",
            Self::Ranking(_) => "ranking",
            Self::SyncState(_) => "sync_state",
        }
    }

    /// Approximate in-memory footprint, used for byte-capacity accounting.
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        std::mem::size_of::<Self>() + serde_json::to_vec(self).map(|v| v.len()).unwrap_or(0)
    }

    #[must_use]
    pub fn as_fund(&self) -> Option<&Fund> {
        match self {
            Self::Fund(f) => Some(f),
            _ => None,
        }
    }

    #[must_use]
    pub fn into_fund(self) -> Option<Fund> {
        match self {
            Self::Fund(f) => Some(f),
            _ => None,
        }
    }

    /// Fund list carried by list or search results.
    #[must_use]
    pub fn into_funds(self) -> Option<Vec<Fund>> {
        match self {
            Self::FundList(funds) | Self::SearchResult(funds) => Some(funds),
            _ => None,
        }
    }

    #[must_use]
    pub fn into_rankings(self) -> Option<Vec<FundRanking>> {
        match self {
            Self::Ranking(r) => Some(r),
            _ => None,
        }
    }

    #[must_use]
    pub fn into_sync_state(self) -> Option<SyncStateSnapshot> {
        match self {
            Self::SyncState(s) => Some(s),
            _ => None,
        }
    }
}

/// Content fingerprint of a fund (hex SHA-256 of its canonical JSON).
///
/// Used by sync to detect updates and by consistency checks to compare local
/// copies against the authoritative source.
#[must_use]
pub fn fund_fingerprint(fund: &Fund) -> String {
    let bytes = serde_json::to_vec(fund).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}

#[cfg(test)]
pub(crate) fn test_fund(code: &str) -> Fund {
    Fund {
        code: code.to_string(),
        name: format!("Fund {}", code),
        fund_type: "equity".to_string(),
        company: "Example AMC".to_string(),
        nav: 1.2345,
        accumulated_nav: 2.5,
        daily_return: 0.42,
        one_year_return: Some(12.5),
        nav_date: "2026-10-16".to_string(),
        updated_at: 1_760_000_000_000,
    }
}
