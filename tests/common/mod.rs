//! Shared test support: a scripted in-process fund source.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use fund_data_layer::model::RankingPeriod;
use fund_data_layer::payload::fund_fingerprint;
use fund_data_layer::source::{ChangeSet, DatasetSnapshot};
use fund_data_layer::{
    DataLayerConfig, DataLayerCoordinator, DataSource, Fund, FundRanking, SourceError, SourceRequest,
    SourceResponse, TierStack,
};

pub fn fund(code: &str) -> Fund {
    Fund {
        code: code.to_string(),
        name: format!("Fund {}", code),
        fund_type: "equity".to_string(),
        company: "Example AM".to_string(),
        nav: 1.0,
        accumulated_nav: 1.0,
        daily_return: 0.0,
        one_year_return: Some(5.0),
        nav_date: "2026-01-02".to_string(),
        updated_at: 0,
    }
}

pub fn codes(list: &[&str]) -> Vec<String> {
    list.iter().map(|c| c.to_string()).collect()
}

/// In-process upstream whose data, latency and failures are scripted by the test.
pub struct ScriptedSource {
    id: String,
    batch: bool,
    funds: RwLock<BTreeMap<String, Fund>>,
    /// Codes removed since the last version bump, reported by `Changes`
    removed: Mutex<Vec<String>>,
    version: AtomicU64,
    failing: AtomicBool,
    delay: Mutex<Duration>,
    requests: AtomicUsize,
    probes: AtomicUsize,
    by_operation: Mutex<HashMap<&'static str, usize>>,
}

impl ScriptedSource {
    pub fn new(id: &str, fund_codes: &[&str]) -> Arc<Self> {
        Arc::new(Self::build(id, fund_codes, false))
    }

    pub fn batching(id: &str, fund_codes: &[&str]) -> Arc<Self> {
        Arc::new(Self::build(id, fund_codes, true))
    }

    fn build(id: &str, fund_codes: &[&str], batch: bool) -> Self {
        Self {
            id: id.to_string(),
            batch,
            funds: RwLock::new(fund_codes.iter().map(|c| (c.to_string(), fund(c))).collect()),
            removed: Mutex::new(Vec::new()),
            version: AtomicU64::new(1),
            failing: AtomicBool::new(false),
            delay: Mutex::new(Duration::ZERO),
            requests: AtomicUsize::new(0),
            probes: AtomicUsize::new(0),
            by_operation: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    /// Replace or insert a fund and bump the dataset version.
    pub fn upsert(&self, fund: Fund) {
        self.funds.write().insert(fund.code.clone(), fund);
        self.version.fetch_add(1, Ordering::SeqCst);
    }

    pub fn delete(&self, code: &str) {
        self.funds.write().remove(code);
        self.removed.lock().push(code.to_string());
        self.version.fetch_add(1, Ordering::SeqCst);
    }

    /// Data requests served or attempted (probes excluded).
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn requests_for(&self, operation: &'static str) -> usize {
        self.by_operation.lock().get(operation).copied().unwrap_or(0)
    }

    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    fn token(&self) -> String {
        format!("v{}", self.version.load(Ordering::SeqCst))
    }

    fn matching(&self, keep: impl Fn(&Fund) -> bool) -> Vec<Fund> {
        self.funds.read().values().filter(|f| keep(f)).cloned().collect()
    }
}

#[async_trait]
impl DataSource for ScriptedSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn base_endpoint(&self) -> &str {
        "mem://scripted"
    }

    fn supports_batch(&self) -> bool {
        self.batch
    }

    async fn fetch(&self, request: &SourceRequest) -> Result<SourceResponse, SourceError> {
        if matches!(request, SourceRequest::Ping) {
            self.probes.fetch_add(1, Ordering::SeqCst);
        } else {
            self.requests.fetch_add(1, Ordering::SeqCst);
            *self.by_operation.lock().entry(request.operation()).or_insert(0) += 1;
        }

        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(SourceError::Status(503));
        }

        Ok(match request {
            SourceRequest::Funds(criteria) => SourceResponse::Funds(self.matching(|f| {
                criteria.fund_type.as_deref().map_or(true, |t| t == f.fund_type)
                    && (criteria.codes.is_empty() || criteria.codes.contains(&f.code))
            })),
            SourceRequest::Search(criteria) => {
                let term = criteria.search_term().unwrap_or_default();
                SourceResponse::Funds(self.matching(|f| f.name.to_lowercase().contains(&term) || f.code == term))
            }
            SourceRequest::Fund(code) => SourceResponse::Fund(self.funds.read().get(code).cloned()),
            SourceRequest::Batch(codes) => SourceResponse::Batch(self.matching(|f| codes.contains(&f.code))),
            SourceRequest::Rankings(criteria) => {
                let mut funds = self.matching(|f| criteria.fund_type.as_deref().map_or(true, |t| t == f.fund_type));
                funds.sort_by(|a, b| b.daily_return.total_cmp(&a.daily_return).then_with(|| a.code.cmp(&b.code)));
                SourceResponse::Rankings(
                    funds
                        .into_iter()
                        .take(criteria.limit as usize)
                        .enumerate()
                        .map(|(i, f)| FundRanking {
                            rank: i as u32 + 1,
                            code: f.code,
                            name: f.name,
                            fund_type: f.fund_type,
                            period: RankingPeriod::Day,
                            return_pct: f.daily_return,
                        })
                        .collect(),
                )
            }
            SourceRequest::Changes { since } => {
                let token = self.token();
                if since.as_deref() == Some(token.as_str()) {
                    SourceResponse::Changes(ChangeSet {
                        version_token: Some(token),
                        ..Default::default()
                    })
                } else {
                    SourceResponse::Changes(ChangeSet {
                        upserts: self.matching(|_| true),
                        deletions: std::mem::take(&mut *self.removed.lock()),
                        version_token: Some(token),
                    })
                }
            }
            SourceRequest::Snapshot => SourceResponse::Snapshot(DatasetSnapshot {
                funds: self.matching(|_| true),
                version_token: Some(self.token()),
            }),
            SourceRequest::Fingerprints(codes) => {
                let funds = self.funds.read();
                SourceResponse::Fingerprints(
                    codes
                        .iter()
                        .filter_map(|c| funds.get(c).map(|f| (c.clone(), fund_fingerprint(f))))
                        .collect(),
                )
            }
            SourceRequest::Ping => SourceResponse::Pong,
        })
    }
}

pub fn as_sources(sources: &[&Arc<ScriptedSource>]) -> Vec<Arc<dyn DataSource>> {
    sources.iter().map(|s| Arc::clone(*s) as Arc<dyn DataSource>).collect()
}

pub async fn started(config: DataLayerConfig, tiers: TierStack, sources: &[&Arc<ScriptedSource>]) -> Arc<DataLayerCoordinator> {
    let coordinator = Arc::new(DataLayerCoordinator::new(config, tiers, as_sources(sources)).unwrap());
    coordinator.start().await.unwrap();
    coordinator
}

pub async fn started_in_memory(sources: &[&Arc<ScriptedSource>]) -> Arc<DataLayerCoordinator> {
    started(DataLayerConfig::default(), TierStack::in_memory(), sources).await
}
