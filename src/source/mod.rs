//! Upstream fund-data sources.
//!
//! A [`DataSource`] is one interchangeable upstream endpoint. The
//! [`DataSourceSwitcher`] owns the registry of sources, tracks their health
//! and fails requests over between them.

pub mod health;
pub mod http;
pub mod switcher;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{Fund, FundCriteria, FundRanking, RankingCriteria};

pub use health::{DataSourceDescriptor, SourceHealth};
pub use http::HttpDataSource;
pub use switcher::DataSourceSwitcher;

/// Failure of a single attempt against a single source.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SourceError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("upstream returned HTTP {0}")]
    Status(u16),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("undecodable response: {0}")]
    Decode(String),
    #[error("response did not match request: expected {0}")]
    UnexpectedResponse(&'static str),
}

/// Upstream operations the data layer issues.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceRequest {
    Funds(FundCriteria),
    Search(FundCriteria),
    Fund(String),
    /// Several funds in one round trip; only sent when `supports_batch()`
    Batch(Vec<String>),
    Rankings(RankingCriteria),
    /// Changes after a cursor (`None` = from the beginning)
    Changes { since: Option<String> },
    /// Entire dataset, for full sync
    Snapshot,
    /// Authoritative content fingerprints for the given codes
    Fingerprints(Vec<String>),
    /// Cheap liveness probe
    Ping,
}

impl SourceRequest {
    /// Operation label for logs and metrics.
    #[must_use]
    pub fn operation(&self) -> &'static str {
        match self {
            Self::Funds(_) => "funds",
            Self::Search(_) => "search",
            Self::Fund(_) => "fund",
            Self::Batch(_) => "batch",
            Self::Rankings(_) => "rankings",
            Self::Changes { .. } => "changes",
            Self::Snapshot => "snapshot",
            Self::Fingerprints(_) => "fingerprints",
            Self::Ping => "ping",
        }
    }
}

/// Incremental change feed page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    #[serde(default)]
    pub upserts: Vec<Fund>,
    /// Codes removed upstream
    #[serde(default)]
    pub deletions: Vec<String>,
    /// Cursor for the next incremental request
    pub version_token: Option<String>,
}

/// The whole dataset at one version.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasetSnapshot {
    pub funds: Vec<Fund>,
    pub version_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SourceResponse {
    Funds(Vec<Fund>),
    Fund(Option<Fund>),
    Batch(Vec<Fund>),
    Rankings(Vec<FundRanking>),
    Changes(ChangeSet),
    Snapshot(DatasetSnapshot),
    /// Fund code → fingerprint; codes unknown upstream are absent
    Fingerprints(HashMap<String, String>),
    Pong,
}

impl SourceResponse {
    pub fn into_funds(self) -> Result<Vec<Fund>, SourceError> {
        match self {
            Self::Funds(funds) | Self::Batch(funds) => Ok(funds),
            _ => Err(SourceError::UnexpectedResponse("fund list")),
        }
    }

    pub fn into_fund(self) -> Result<Option<Fund>, SourceError> {
        match self {
            Self::Fund(fund) => Ok(fund),
            _ => Err(SourceError::UnexpectedResponse("fund")),
        }
    }

    pub fn into_rankings(self) -> Result<Vec<FundRanking>, SourceError> {
        match self {
            Self::Rankings(r) => Ok(r),
            _ => Err(SourceError::UnexpectedResponse("rankings")),
        }
    }

    pub fn into_changes(self) -> Result<ChangeSet, SourceError> {
        match self {
            Self::Changes(c) => Ok(c),
            _ => Err(SourceError::UnexpectedResponse("change set")),
        }
    }

    pub fn into_snapshot(self) -> Result<DatasetSnapshot, SourceError> {
        match self {
            Self::Snapshot(s) => Ok(s),
            _ => Err(SourceError::UnexpectedResponse("snapshot")),
        }
    }

    pub fn into_fingerprints(self) -> Result<HashMap<String, String>, SourceError> {
        match self {
            Self::Fingerprints(f) => Ok(f),
            _ => Err(SourceError::UnexpectedResponse("fingerprints")),
        }
    }
}

/// One upstream endpoint.
#[async_trait]
pub trait DataSource: Send + Sync {
    fn id(&self) -> &str;

    fn display_name(&self) -> &str {
        self.id()
    }

    fn base_endpoint(&self) -> &str;

    /// Whether [`SourceRequest::Batch`] is served in one round trip.
    fn supports_batch(&self) -> bool {
        false
    }

    async fn fetch(&self, request: &SourceRequest) -> Result<SourceResponse, SourceError>;

    /// Liveness probe used for health checks and recovery.
    async fn probe(&self) -> Result<(), SourceError> {
        match self.fetch(&SourceRequest::Ping).await? {
            SourceResponse::Pong => Ok(()),
            _ => Err(SourceError::UnexpectedResponse("pong")),
        }
    }
}

/// Fetch funds by code from one source: a single batch request when the
/// source supports it, otherwise one concurrent request per code. Codes the
/// source does not know are absent from the result.
pub async fn fetch_by_codes(source: &dyn DataSource, codes: &[String]) -> Result<Vec<Fund>, SourceError> {
    if codes.is_empty() {
        return Ok(Vec::new());
    }
    if source.supports_batch() {
        return source.fetch(&SourceRequest::Batch(codes.to_vec())).await?.into_funds();
    }
    let singles = codes.iter().map(|code| async move {
        source.fetch(&SourceRequest::Fund(code.clone())).await?.into_fund()
    });
    let found = futures::future::try_join_all(singles).await?;
    Ok(found.into_iter().flatten().collect())
}
