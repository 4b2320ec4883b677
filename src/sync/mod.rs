// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Synchronization between the local tiers and the upstream dataset.
//!
//! # Sync types
//!
//! | Type        | Upstream request          | Applies                                   |
//! |-------------|---------------------------|-------------------------------------------|
//! | Full        | `Snapshot`                | whole dataset, staged in a shadow tier    |
//! | Incremental | `Changes { since }`       | upserts and deletions after the cursor    |
//! | Selective   | `Batch` / `Fund` per code | just the requested codes                  |
//!
//! Local state is an index of fund code → content fingerprint plus the
//! source's version cursor ([`SyncStateSnapshot`]). A fund whose fingerprint
//! is unchanged is not rewritten, so a repeated full sync against unchanged
//! data reports zero added/updated/deleted.
//!
//! Sync writes go to L2 and L3. The affected L1 entries are dropped and
//! refill lazily on the next read. Whenever a run changes anything, the
//! aggregate keys (lists, searches, rankings) are invalidated everywhere.
//! A failed L2 write aborts the run: keys it already touched are restored
//! and neither the index nor the cursor moves, so the next run retries them.
//!
//! # Coalescing
//!
//! Runs are keyed by [`SyncScope`]. A request for a scope that already has a
//! run in flight joins that run and receives its record. The run itself is
//! spawned, so it completes even if every caller goes away.

pub mod consistency;
pub mod record;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{join_all, BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};

use crate::config::DataLayerConfig;
use crate::error::{DataLayerError, Result};
use crate::events::{DataLayerEvent, EventBus};
use crate::model::{keys, Fund};
use crate::payload::{fund_fingerprint, CachedValue, SyncStateSnapshot};
use crate::resilience::retry::{retry, RetryConfig};
use crate::source::{fetch_by_codes, DataSourceSwitcher, SourceRequest};
use crate::tier::{now_millis, CachePriority, CacheTier, MemoryTier, PutOptions, TierLevel, TierStack};
use crate::worker::WorkerPool;

pub use consistency::{ActionPriority, ActionType, ConsistencyReport, RecommendedAction};
pub use record::{SyncOperationRecord, SyncType};

use consistency::KeyObservation;
use record::SyncHistory;

/// What a sync run covers. Runs for the same scope are coalesced.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SyncScope {
    /// The whole dataset (full and incremental runs)
    All,
    /// A specific set of codes, keyed by the fingerprint of the sorted set
    Selective(String),
}

impl SyncScope {
    #[must_use]
    pub fn selective(codes: &[String]) -> Self {
        let set: BTreeSet<&str> = codes.iter().map(String::as_str).collect();
        let mut hasher = Sha256::new();
        for code in set {
            hasher.update(code.as_bytes());
            hasher.update([0u8]);
        }
        Self::Selective(hex::encode(hasher.finalize()))
    }
}

#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub fund_ttl: Duration,
    pub history_capacity: usize,
    pub sample_size: usize,
    pub resync_ratio: f64,
    pub parse_batch_size: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self::from_config(&DataLayerConfig::default())
    }
}

impl SyncSettings {
    #[must_use]
    pub fn from_config(config: &DataLayerConfig) -> Self {
        Self {
            fund_ttl: Duration::from_secs(config.fund_ttl_secs),
            history_capacity: config.sync_history_capacity,
            sample_size: config.consistency_sample_size,
            resync_ratio: config.resync_ratio,
            parse_batch_size: config.parse_batch_size,
        }
    }
}

#[derive(Debug, Default)]
struct SyncCounts {
    added: u64,
    updated: u64,
    deleted: u64,
    version_token: Option<String>,
}

impl SyncCounts {
    fn changed(&self) -> bool {
        self.added + self.updated + self.deleted > 0
    }
}

type SharedRun = Shared<BoxFuture<'static, SyncOperationRecord>>;

pub struct SyncManager {
    tiers: TierStack,
    switcher: Arc<DataSourceSwitcher>,
    workers: Arc<WorkerPool>,
    events: Arc<EventBus>,
    settings: SyncSettings,
    state: tokio::sync::Mutex<SyncStateSnapshot>,
    history: Mutex<SyncHistory>,
    inflight: Mutex<HashMap<SyncScope, SharedRun>>,
    sample_cursor: AtomicUsize,
    /// Failed runs not yet seen by a self-check
    unseen_failures: AtomicUsize,
}

impl SyncManager {
    #[must_use]
    pub fn new(
        tiers: TierStack,
        switcher: Arc<DataSourceSwitcher>,
        workers: Arc<WorkerPool>,
        events: Arc<EventBus>,
        settings: SyncSettings,
    ) -> Self {
        let history = SyncHistory::new(settings.history_capacity);
        Self {
            tiers,
            switcher,
            workers,
            events,
            settings,
            state: tokio::sync::Mutex::new(SyncStateSnapshot::default()),
            history: Mutex::new(history),
            inflight: Mutex::new(HashMap::new()),
            sample_cursor: AtomicUsize::new(0),
            unseen_failures: AtomicUsize::new(0),
        }
    }

    /// Replace the whole local dataset with the upstream snapshot.
    pub async fn sync_full(self: &Arc<Self>) -> SyncOperationRecord {
        self.coalesce(SyncScope::All, |manager| async move { manager.run_full().await }.boxed())
            .await
    }

    /// Apply upstream changes after `since`, or after the stored cursor when
    /// `since` is `None`. Without any cursor this is a full sync.
    pub async fn sync_incremental(self: &Arc<Self>, since: Option<String>) -> SyncOperationRecord {
        self.coalesce(SyncScope::All, move |manager| {
            async move {
                let cursor = match since {
                    Some(since) => Some(since),
                    None => manager.version_token().await,
                };
                match cursor {
                    Some(cursor) => manager.run_incremental(cursor).await,
                    None => {
                        debug!("No sync cursor yet, running full sync");
                        manager.run_full().await
                    }
                }
            }
            .boxed()
        })
        .await
    }

    /// Re-fetch just `codes` and reconcile them.
    pub async fn sync_selective(self: &Arc<Self>, codes: Vec<String>) -> SyncOperationRecord {
        let scope = SyncScope::selective(&codes);
        self.coalesce(scope, move |manager| async move { manager.run_selective(codes).await }.boxed())
            .await
    }

    fn coalesce<F>(self: &Arc<Self>, scope: SyncScope, start: F) -> SharedRun
    where
        F: FnOnce(Arc<Self>) -> BoxFuture<'static, SyncOperationRecord>,
    {
        let mut inflight = self.inflight.lock();
        if let Some(running) = inflight.get(&scope) {
            debug!(scope = ?scope, "Joining in-flight sync");
            crate::metrics::record_coalesced("sync");
            return running.clone();
        }

        let manager = Arc::clone(self);
        let key = scope.clone();
        let work = start(Arc::clone(self));
        let run = async move {
            let record = work.await;
            manager.inflight.lock().remove(&key);
            record
        }
        .boxed()
        .shared();

        inflight.insert(scope, run.clone());
        tokio::spawn(run.clone());
        run
    }

    /// Wait for every in-flight run to finish.
    pub async fn wait_idle(&self) {
        let running: Vec<SharedRun> = self.inflight.lock().values().cloned().collect();
        if !running.is_empty() {
            debug!(count = running.len(), "Waiting for in-flight syncs");
            join_all(running).await;
        }
    }

    #[must_use]
    pub fn is_syncing(&self) -> bool {
        !self.inflight.lock().is_empty()
    }

    #[instrument(skip(self))]
    async fn run_full(self: Arc<Self>) -> SyncOperationRecord {
        let started_at = now_millis();
        let outcome = self.apply_full().await;
        self.finish(SyncType::Full, started_at, outcome)
    }

    #[instrument(skip(self))]
    async fn run_incremental(self: Arc<Self>, since: String) -> SyncOperationRecord {
        let started_at = now_millis();
        let outcome = self.apply_incremental(since).await;
        self.finish(SyncType::Incremental, started_at, outcome)
    }

    #[instrument(skip(self, codes), fields(codes = codes.len()))]
    async fn run_selective(self: Arc<Self>, codes: Vec<String>) -> SyncOperationRecord {
        let started_at = now_millis();
        let outcome = self.apply_selective(codes).await;
        self.finish(SyncType::Selective, started_at, outcome)
    }

    async fn apply_full(&self) -> Result<SyncCounts> {
        let snapshot = self
            .switcher
            .execute("snapshot", None, |source| async move {
                source.fetch(&SourceRequest::Snapshot).await?.into_snapshot()
            })
            .await?;

        // Stage the complete dataset before touching any real tier. Any
        // failure from here to the swap leaves the tiers as they were.
        let fingerprinted = self.fingerprint(snapshot.funds).await?;
        let shadow = MemoryTier::unbounded("shadow");
        let mut staged_index = BTreeMap::new();
        for (fund, fingerprint) in fingerprinted {
            let key = keys::fund(&fund.code);
            shadow
                .put(&key, &CachedValue::Fund(fund.clone()), PutOptions::default())
                .await
                .map_err(|e| DataLayerError::CacheUnavailable {
                    tier: "shadow".to_string(),
                    reason: e.to_string(),
                })?;
            staged_index.insert(fund.code, fingerprint);
        }
        debug!(staged = staged_index.len(), "Snapshot staged");

        let upserts: Vec<(Fund, String)> = shadow
            .live_entries()
            .into_iter()
            .filter_map(|entry| {
                let fund = entry.value.into_fund()?;
                let fingerprint = staged_index.get(&fund.code)?.clone();
                Some((fund, fingerprint))
            })
            .collect();

        let mut state = self.state.lock().await;
        let deletions: Vec<String> = state
            .index
            .keys()
            .filter(|code| !staged_index.contains_key(*code))
            .cloned()
            .collect();
        let mut counts = self.apply_changes(&mut state, upserts, &deletions).await?;
        state.version_token = snapshot.version_token;
        counts.version_token = state.version_token.clone();
        self.persist_state(&state).await;
        Ok(counts)
    }

    async fn apply_incremental(&self, since: String) -> Result<SyncCounts> {
        let changes = self
            .switcher
            .execute("changes", None, |source| {
                let request = SourceRequest::Changes { since: Some(since.clone()) };
                async move { source.fetch(&request).await?.into_changes() }
            })
            .await?;

        let upserts = self.fingerprint(changes.upserts).await?;
        let mut state = self.state.lock().await;
        let mut counts = self.apply_changes(&mut state, upserts, &changes.deletions).await?;
        if changes.version_token.is_some() {
            state.version_token = changes.version_token;
        }
        counts.version_token = state.version_token.clone();
        self.persist_state(&state).await;
        Ok(counts)
    }

    async fn apply_selective(&self, mut codes: Vec<String>) -> Result<SyncCounts> {
        codes.sort();
        codes.dedup();
        let funds = self
            .switcher
            .execute("selective", None, |source| {
                let codes = codes.clone();
                async move { fetch_by_codes(source.as_ref(), &codes).await }
            })
            .await?;

        let found: BTreeSet<&str> = funds.iter().map(|f| f.code.as_str()).collect();
        let missing: Vec<String> = codes.iter().filter(|c| !found.contains(c.as_str())).cloned().collect();
        let upserts = self.fingerprint(funds).await?;

        let mut state = self.state.lock().await;
        let mut counts = self.apply_changes(&mut state, upserts, &missing).await?;
        counts.version_token = state.version_token.clone();
        self.persist_state(&state).await;
        Ok(counts)
    }

    async fn fingerprint(&self, funds: Vec<Fund>) -> Result<Vec<(Fund, String)>> {
        self.workers
            .map_batches(funds, self.settings.parse_batch_size, |fund| {
                let fingerprint = fund_fingerprint(&fund);
                (fund, fingerprint)
            })
            .await
    }

    fn fund_options(&self, fund: &Fund) -> PutOptions {
        keys::fund_tags(fund)
            .into_iter()
            .fold(PutOptions::default().with_ttl(self.settings.fund_ttl), |options, tag| options.with_tag(tag))
    }

    /// Write changed funds to L2/L3, drop deleted ones everywhere, update the
    /// index. Codes in `deletions` the index never held are not counted.
    ///
    /// L2 is the durable copy: any L2 failure aborts the batch, restores the
    /// keys already touched and leaves `state` as it was. L3 stays best-effort.
    async fn apply_changes(
        &self,
        state: &mut SyncStateSnapshot,
        upserts: Vec<(Fund, String)>,
        deletions: &[String],
    ) -> Result<SyncCounts> {
        let mut counts = SyncCounts::default();
        let mut index = state.index.clone();
        let mut journal = Vec::new();

        if let Err(e) = self
            .write_changes(&mut index, &mut counts, &mut journal, upserts, deletions)
            .await
        {
            warn!(touched = journal.len(), error = %e, "Sync write failed, rolling back");
            self.roll_back(journal).await;
            return Err(e);
        }

        state.index = index;
        if counts.changed() {
            let lists = self.tiers.remove_pattern_everywhere(keys::LIST_PATTERN).await;
            let rankings = self.tiers.remove_pattern_everywhere(keys::RANKING_PATTERN).await;
            debug!(lists, rankings, "Invalidated aggregate keys after sync");
        }
        Ok(counts)
    }

    async fn write_changes(
        &self,
        index: &mut BTreeMap<String, String>,
        counts: &mut SyncCounts,
        journal: &mut Vec<(String, Option<CachedValue>)>,
        upserts: Vec<(Fund, String)>,
        deletions: &[String],
    ) -> Result<()> {
        for (fund, fingerprint) in upserts {
            match index.get(&fund.code) {
                Some(existing) if *existing == fingerprint => continue,
                Some(_) => counts.updated += 1,
                None => counts.added += 1,
            }
            let code = fund.code.clone();
            let key = keys::fund(&code);
            let prior = self.tiers.get_checked(TierLevel::L2, &key).await?;
            journal.push((key.clone(), prior));

            let options = self.fund_options(&fund);
            let value = CachedValue::Fund(fund);
            self.tiers.put_checked(TierLevel::L2, &key, &value, options.clone()).await?;
            self.tiers.put_quiet(TierLevel::L3, &key, &value, options).await;
            self.tiers.remove_quiet(&[TierLevel::L1], &key).await;
            index.insert(code, fingerprint);
        }

        for code in deletions {
            let key = keys::fund(code);
            let prior = self.tiers.get_checked(TierLevel::L2, &key).await?;
            journal.push((key.clone(), prior));

            self.tiers.remove_checked(TierLevel::L2, &key).await?;
            self.tiers.remove_quiet(&[TierLevel::L1, TierLevel::L3], &key).await;
            if index.remove(code).is_some() {
                counts.deleted += 1;
            }
        }
        Ok(())
    }

    /// Put back what the journal saw before the failed batch, newest first.
    async fn roll_back(&self, journal: Vec<(String, Option<CachedValue>)>) {
        for (key, prior) in journal.into_iter().rev() {
            self.tiers.remove_quiet(&[TierLevel::L1], &key).await;
            match prior {
                Some(value) => {
                    let options = match &value {
                        CachedValue::Fund(fund) => self.fund_options(fund),
                        _ => PutOptions::default(),
                    };
                    self.tiers.put_quiet(TierLevel::L2, &key, &value, options.clone()).await;
                    self.tiers.put_quiet(TierLevel::L3, &key, &value, options).await;
                }
                None => self.tiers.remove_quiet(&[TierLevel::L2, TierLevel::L3], &key).await,
            }
        }
    }

    async fn persist_state(&self, state: &SyncStateSnapshot) {
        let value = CachedValue::SyncState(state.clone());
        let options = PutOptions::default().with_priority(CachePriority::Critical);
        let (value, options) = (&value, &options);
        let l2 = &self.tiers.l2;

        if let Err(e) = retry("persist_sync_state", &RetryConfig::write(), || {
            l2.put(keys::SYNC_STATE, value, options.clone())
        })
        .await
        {
            warn!(error = %e, "Failed to persist sync state; next start will run a full sync");
        }
    }

    fn finish(&self, sync_type: SyncType, started_at: i64, outcome: Result<SyncCounts>) -> SyncOperationRecord {
        let finished_at = now_millis();
        let sync_id = uuid::Uuid::new_v4().to_string();
        let record = match outcome {
            Ok(counts) => SyncOperationRecord {
                sync_id,
                sync_type,
                started_at,
                finished_at,
                items_added: counts.added,
                items_updated: counts.updated,
                items_deleted: counts.deleted,
                success: true,
                error_detail: None,
                source_version_token: counts.version_token,
            },
            Err(e) => SyncOperationRecord {
                sync_id,
                sync_type,
                started_at,
                finished_at,
                items_added: 0,
                items_updated: 0,
                items_deleted: 0,
                success: false,
                error_detail: Some(e.to_string()),
                source_version_token: None,
            },
        };

        let duration = Duration::from_millis(u64::try_from(record.duration_ms()).unwrap_or(0));
        crate::metrics::record_sync(sync_type.as_str(), record.success, duration);
        if record.success {
            crate::metrics::record_sync_items(record.items_added, record.items_updated, record.items_deleted);
            info!(
                sync_id = %record.sync_id,
                sync_type = %sync_type,
                added = record.items_added,
                updated = record.items_updated,
                deleted = record.items_deleted,
                duration_ms = record.duration_ms(),
                "Sync completed"
            );
        } else {
            self.unseen_failures.fetch_add(1, Ordering::AcqRel);
            warn!(
                sync_id = %record.sync_id,
                sync_type = %sync_type,
                error = record.error_detail.as_deref().unwrap_or_default(),
                "Sync failed"
            );
        }

        self.history.lock().push(record.clone());
        self.events.publish(DataLayerEvent::SyncCompleted { record: record.clone() });
        record
    }

    /// Load the persisted cursor and index from L2. Returns whether state was found.
    pub async fn restore(&self) -> bool {
        let restored = self
            .tiers
            .get_quiet(TierLevel::L2, keys::SYNC_STATE)
            .await
            .and_then(CachedValue::into_sync_state);
        match restored {
            Some(snapshot) => {
                info!(
                    funds = snapshot.index.len(),
                    has_cursor = snapshot.version_token.is_some(),
                    "Restored sync state"
                );
                *self.state.lock().await = snapshot;
                true
            }
            None => false,
        }
    }

    /// Compare a rotating sample of local fingerprints against the source.
    ///
    /// Divergence is only reported. Nothing is repaired here; acting on the
    /// recommendations is the caller's decision.
    #[instrument(skip(self))]
    pub async fn validate_consistency(&self) -> Result<ConsistencyReport> {
        let (sample, indexed) = {
            let state = self.state.lock().await;
            let codes: Vec<&String> = state.index.keys().collect();
            let take = self.settings.sample_size.min(codes.len());
            let start = if codes.is_empty() {
                0
            } else {
                self.sample_cursor.fetch_add(take, Ordering::AcqRel) % codes.len()
            };
            let sample: Vec<String> = codes.iter().cycle().skip(start).take(take).map(|c| (*c).clone()).collect();
            let indexed: HashMap<String, String> = sample
                .iter()
                .filter_map(|c| state.index.get(c).map(|fp| (c.clone(), fp.clone())))
                .collect();
            (sample, indexed)
        };

        let remote = if sample.is_empty() {
            HashMap::new()
        } else {
            self.switcher
                .execute("fingerprints", None, |source| {
                    let request = SourceRequest::Fingerprints(sample.clone());
                    async move { source.fetch(&request).await?.into_fingerprints() }
                })
                .await?
        };

        let mut observations = Vec::with_capacity(sample.len());
        for code in &sample {
            let key = keys::fund(code);
            observations.push(KeyObservation {
                code: code.clone(),
                remote: remote.get(code).cloned(),
                indexed: indexed.get(code).cloned(),
                l2: self.local_fingerprint(TierLevel::L2, &key).await,
                l3: self.local_fingerprint(TierLevel::L3, &key).await,
            });
        }

        let report = consistency::classify(&observations, self.settings.resync_ratio, now_millis());
        crate::metrics::record_consistency_check(report.total_checked, report.inconsistent_keys.len());
        if report.is_consistent() {
            debug!(checked = report.total_checked, "Consistency check clean");
        } else {
            warn!(
                checked = report.total_checked,
                inconsistent = report.inconsistent_keys.len(),
                "Consistency check found divergence"
            );
        }
        Ok(report)
    }

    async fn local_fingerprint(&self, level: TierLevel, key: &str) -> Option<String> {
        self.tiers
            .get_quiet(level, key)
            .await
            .and_then(CachedValue::into_fund)
            .map(|fund| fund_fingerprint(&fund))
    }

    /// Finished runs, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<SyncOperationRecord> {
        self.history.lock().to_vec()
    }

    #[must_use]
    pub fn last_record(&self) -> Option<SyncOperationRecord> {
        self.history.lock().last().cloned()
    }

    /// Failed runs currently in the history ring.
    #[must_use]
    pub fn failure_count(&self) -> usize {
        self.history.lock().failures()
    }

    /// Failed runs since the previous call.
    pub fn take_recent_failures(&self) -> usize {
        self.unseen_failures.swap(0, Ordering::AcqRel)
    }

    pub async fn version_token(&self) -> Option<String> {
        self.state.lock().await.version_token.clone()
    }

    /// Drop `codes` (every code when `None`) from the index so the next sync
    /// rewrites them instead of treating them as unchanged.
    pub async fn forget(&self, codes: Option<&[String]>) {
        let mut state = self.state.lock().await;
        match codes {
            Some(codes) => {
                for code in codes {
                    state.index.remove(code);
                }
            }
            None => state.index.clear(),
        }
    }

    /// Number of funds the local index tracks.
    pub async fn indexed_count(&self) -> usize {
        self.state.lock().await.index.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::test_fund;
    use crate::source::health::HealthThresholds;
    use crate::source::{ChangeSet, DataSource, DatasetSnapshot, SourceError, SourceResponse};
    use crate::tier::{CacheTierStats, TierError};
    use async_trait::async_trait;
    use parking_lot::RwLock;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    /// In-memory upstream whose dataset tests can edit.
    struct Upstream {
        funds: RwLock<BTreeMap<String, Fund>>,
        version: AtomicUsize,
        snapshots: AtomicUsize,
        fail: AtomicBool,
        delay: Duration,
    }

    impl Upstream {
        fn new(codes: &[&str]) -> Arc<Self> {
            Self::with_delay(codes, Duration::ZERO)
        }

        fn with_delay(codes: &[&str], delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                funds: RwLock::new(codes.iter().map(|c| (c.to_string(), test_fund(c))).collect()),
                version: AtomicUsize::new(1),
                snapshots: AtomicUsize::new(0),
                fail: AtomicBool::new(false),
                delay,
            })
        }
    }

    #[async_trait]
    impl DataSource for Upstream {
        fn id(&self) -> &str {
            "upstream"
        }
        fn base_endpoint(&self) -> &str {
            "mem://upstream"
        }
        async fn fetch(&self, request: &SourceRequest) -> std::result::Result<SourceResponse, SourceError> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(SourceError::Status(503));
            }
            let funds = self.funds.read();
            let token = Some(format!("v{}", self.version.load(Ordering::SeqCst)));
            match request {
                SourceRequest::Snapshot => {
                    self.snapshots.fetch_add(1, Ordering::SeqCst);
                    Ok(SourceResponse::Snapshot(DatasetSnapshot {
                        funds: funds.values().cloned().collect(),
                        version_token: token,
                    }))
                }
                SourceRequest::Changes { .. } => Ok(SourceResponse::Changes(ChangeSet {
                    upserts: funds.values().filter(|f| f.nav > 2.0).cloned().collect(),
                    deletions: vec!["gone".to_string()],
                    version_token: token,
                })),
                SourceRequest::Fund(code) => Ok(SourceResponse::Fund(funds.get(code).cloned())),
                SourceRequest::Fingerprints(codes) => Ok(SourceResponse::Fingerprints(
                    codes
                        .iter()
                        .filter_map(|c| funds.get(c).map(|f| (c.clone(), fund_fingerprint(f))))
                        .collect(),
                )),
                SourceRequest::Ping => Ok(SourceResponse::Pong),
                _ => Err(SourceError::Status(404)),
            }
        }
    }

    fn manager_with(upstream: Arc<Upstream>, tiers: TierStack) -> (Arc<SyncManager>, Arc<EventBus>) {
        let events = Arc::new(EventBus::new(32));
        let switcher = Arc::new(DataSourceSwitcher::new(
            HealthThresholds::default(),
            Duration::from_secs(2),
            None,
            events.clone(),
        ));
        switcher.register(upstream).unwrap();
        let manager = SyncManager::new(
            tiers,
            switcher,
            Arc::new(WorkerPool::new(2, 4)),
            events.clone(),
            SyncSettings { parse_batch_size: 2, ..SyncSettings::default() },
        );
        (Arc::new(manager), events)
    }

    #[tokio::test]
    async fn test_full_sync_is_idempotent() {
        let upstream = Upstream::new(&["a", "b", "c"]);
        let tiers = TierStack::in_memory();
        let (manager, _) = manager_with(upstream, tiers.clone());

        let first = manager.sync_full().await;
        assert!(first.success);
        assert_eq!((first.items_added, first.items_updated, first.items_deleted), (3, 0, 0));
        assert_eq!(first.source_version_token.as_deref(), Some("v1"));
        assert!(tiers.l2.get("fund:a").await.unwrap().is_some());
        assert!(tiers.l3.get("fund:c").await.unwrap().is_some());
        assert!(tiers.l1.get("fund:a").await.unwrap().is_none());

        let second = manager.sync_full().await;
        assert!(second.success);
        assert_eq!((second.items_added, second.items_updated, second.items_deleted), (0, 0, 0));
        assert_eq!(manager.history().len(), 2);
    }

    #[tokio::test]
    async fn test_full_sync_detects_updates_and_deletions() {
        let upstream = Upstream::new(&["a", "b"]);
        let tiers = TierStack::in_memory();
        let (manager, _) = manager_with(upstream.clone(), tiers.clone());
        manager.sync_full().await;

        tiers
            .l1
            .put("funds:list:x", &CachedValue::FundList(vec![]), PutOptions::default())
            .await
            .unwrap();
        {
            let mut funds = upstream.funds.write();
            funds.remove("b");
            if let Some(a) = funds.get_mut("a") {
                a.nav = 9.9;
            }
        }

        let record = manager.sync_full().await;
        assert_eq!((record.items_added, record.items_updated, record.items_deleted), (0, 1, 1));
        assert!(tiers.l2.get("fund:b").await.unwrap().is_none());
        assert_eq!(
            tiers.l2.get("fund:a").await.unwrap().and_then(CachedValue::into_fund).map(|f| f.nav),
            Some(9.9)
        );
        assert!(tiers.l1.get("funds:list:x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_full_sync_leaves_tiers_untouched() {
        let upstream = Upstream::new(&["a"]);
        let tiers = TierStack::in_memory();
        let (manager, events) = manager_with(upstream.clone(), tiers.clone());
        manager.sync_full().await;
        let mut sub = events.subscribe();

        upstream.funds.write().clear();
        upstream.fail.store(true, Ordering::SeqCst);
        let record = manager.sync_full().await;

        assert!(!record.success);
        assert!(record.error_detail.is_some());
        assert!(tiers.l2.get("fund:a").await.unwrap().is_some());
        assert_eq!(manager.failure_count(), 1);
        assert_eq!(manager.take_recent_failures(), 1);
        assert_eq!(manager.take_recent_failures(), 0);
        assert!(matches!(
            sub.try_recv(),
            Some(DataLayerEvent::SyncCompleted { record }) if !record.success
        ));
    }

    /// L2 stand-in that rejects the n-th fund write after being armed.
    struct FlakyTier {
        inner: MemoryTier,
        fund_puts: AtomicUsize,
        fail_on: AtomicUsize,
    }

    impl FlakyTier {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                inner: MemoryTier::unbounded("L2"),
                fund_puts: AtomicUsize::new(0),
                fail_on: AtomicUsize::new(0),
            })
        }

        fn fail_nth_fund_put(&self, n: usize) {
            self.fund_puts.store(0, Ordering::SeqCst);
            self.fail_on.store(n, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl CacheTier for FlakyTier {
        fn name(&self) -> &str {
            "flaky"
        }
        async fn get(&self, key: &str) -> std::result::Result<Option<CachedValue>, TierError> {
            self.inner.get(key).await
        }
        async fn put(&self, key: &str, value: &CachedValue, options: PutOptions) -> std::result::Result<(), TierError> {
            if key.starts_with("fund:") {
                let n = self.fund_puts.fetch_add(1, Ordering::SeqCst) + 1;
                if n == self.fail_on.load(Ordering::SeqCst) {
                    return Err(TierError::Unavailable("disk full".to_string()));
                }
            }
            self.inner.put(key, value, options).await
        }
        async fn remove(&self, key: &str) -> std::result::Result<(), TierError> {
            self.inner.remove(key).await
        }
        async fn remove_by_pattern(&self, pattern: &str) -> std::result::Result<u64, TierError> {
            self.inner.remove_by_pattern(pattern).await
        }
        async fn remove_by_tag(&self, tag: &str) -> std::result::Result<u64, TierError> {
            self.inner.remove_by_tag(tag).await
        }
        async fn clear(&self) -> std::result::Result<(), TierError> {
            self.inner.clear().await
        }
        async fn stats(&self) -> std::result::Result<CacheTierStats, TierError> {
            self.inner.stats().await
        }
        async fn sweep_expired(&self) -> std::result::Result<u64, TierError> {
            self.inner.sweep_expired().await
        }
        async fn keys(&self, pattern: &str) -> std::result::Result<Vec<String>, TierError> {
            self.inner.keys(pattern).await
        }
    }

    #[tokio::test]
    async fn test_l2_write_failure_rolls_back_full_sync() {
        let upstream = Upstream::new(&["a", "b"]);
        let l2 = FlakyTier::new();
        let tiers = TierStack::new(
            Arc::new(MemoryTier::unbounded("L1")),
            l2.clone(),
            Arc::new(MemoryTier::unbounded("L3")),
        );
        let (manager, _) = manager_with(upstream.clone(), tiers.clone());
        assert!(manager.sync_full().await.success);

        {
            let mut funds = upstream.funds.write();
            if let Some(a) = funds.get_mut("a") {
                a.nav = 9.9;
            }
            funds.insert("c".to_string(), test_fund("c"));
            funds.insert("d".to_string(), test_fund("d"));
        }
        upstream.version.store(2, Ordering::SeqCst);
        l2.fail_nth_fund_put(2);

        let failed = manager.sync_full().await;
        assert!(!failed.success);
        assert!(failed.error_detail.as_deref().unwrap().contains("disk full"));

        // Whatever landed before the failure was put back
        let nav_of = |value: Option<CachedValue>| value.and_then(CachedValue::into_fund).map(|f| f.nav);
        assert_eq!(nav_of(tiers.l2.get("fund:a").await.unwrap()), Some(test_fund("a").nav));
        assert_eq!(nav_of(tiers.l3.get("fund:a").await.unwrap()), Some(test_fund("a").nav));
        let mut l2_keys = tiers.l2.keys("fund:*").await.unwrap();
        l2_keys.sort();
        assert_eq!(l2_keys, vec!["fund:a", "fund:b"]);
        assert!(tiers.l3.get("fund:c").await.unwrap().is_none());
        assert_eq!(manager.indexed_count().await, 2);
        assert_eq!(manager.version_token().await.as_deref(), Some("v1"));

        // The next run redoes the whole batch
        let retried = manager.sync_full().await;
        assert!(retried.success);
        assert_eq!((retried.items_added, retried.items_updated, retried.items_deleted), (2, 1, 0));
        assert_eq!(tiers.l2.keys("fund:*").await.unwrap().len(), 4);
        assert_eq!(manager.version_token().await.as_deref(), Some("v2"));
        assert!(manager.validate_consistency().await.unwrap().is_consistent());
    }

    #[tokio::test]
    async fn test_consistency_flags_indexed_fund_missing_locally() {
        let upstream = Upstream::new(&["a", "b"]);
        let tiers = TierStack::in_memory();
        let (manager, _) = manager_with(upstream, tiers.clone());
        manager.sync_full().await;

        tiers.l2.remove("fund:b").await.unwrap();
        tiers.l3.remove("fund:b").await.unwrap();

        let report = manager.validate_consistency().await.unwrap();
        assert_eq!(report.inconsistent_keys, vec!["b"]);
        assert_eq!(report.actions_of(ActionType::RefreshCache).unwrap().affected_keys, vec!["b"]);
    }

    #[tokio::test]
    async fn test_concurrent_syncs_share_one_run() {
        let upstream = Upstream::with_delay(&["a", "b"], Duration::from_millis(50));
        let (manager, _) = manager_with(upstream.clone(), TierStack::in_memory());

        let (a, b, c) = tokio::join!(manager.sync_full(), manager.sync_full(), manager.sync_incremental(None));
        assert_eq!(a.sync_id, b.sync_id);
        assert_eq!(a.sync_id, c.sync_id);
        assert_eq!(upstream.snapshots.load(Ordering::SeqCst), 1);
        assert!(!manager.is_syncing());
    }

    #[tokio::test]
    async fn test_incremental_without_cursor_runs_full() {
        let (manager, _) = manager_with(Upstream::new(&["a"]), TierStack::in_memory());
        let record = manager.sync_incremental(None).await;
        assert_eq!(record.sync_type, SyncType::Full);
        assert_eq!(manager.version_token().await.as_deref(), Some("v1"));
    }

    #[tokio::test]
    async fn test_incremental_applies_changes_and_advances_cursor() {
        let upstream = Upstream::new(&["a", "b"]);
        let tiers = TierStack::in_memory();
        let (manager, _) = manager_with(upstream.clone(), tiers.clone());
        manager.sync_full().await;

        {
            let mut funds = upstream.funds.write();
            let mut rich = test_fund("c");
            rich.nav = 3.0;
            funds.insert("c".to_string(), rich);
        }
        upstream.version.store(2, Ordering::SeqCst);

        let record = manager.sync_incremental(None).await;
        assert_eq!(record.sync_type, SyncType::Incremental);
        assert!(record.success);
        assert_eq!(record.items_added, 1);
        // "gone" was never indexed
        assert_eq!(record.items_deleted, 0);
        assert_eq!(record.source_version_token.as_deref(), Some("v2"));
        assert_eq!(manager.indexed_count().await, 3);
    }

    #[tokio::test]
    async fn test_selective_sync_fetches_codes_and_drops_missing() {
        let upstream = Upstream::new(&["a", "b"]);
        let tiers = TierStack::in_memory();
        let (manager, _) = manager_with(upstream.clone(), tiers.clone());
        manager.sync_full().await;

        upstream.funds.write().remove("b");
        let record = manager.sync_selective(vec!["b".into(), "a".into(), "a".into()]).await;
        assert_eq!(record.sync_type, SyncType::Selective);
        assert_eq!((record.items_added, record.items_updated, record.items_deleted), (0, 0, 1));
        assert!(tiers.l3.get("fund:b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_state_survives_restore() {
        let tiers = TierStack::in_memory();
        let (first, _) = manager_with(Upstream::new(&["a", "b"]), tiers.clone());
        first.sync_full().await;

        let (second, _) = manager_with(Upstream::new(&["a", "b"]), tiers);
        assert!(second.restore().await);
        assert_eq!(second.version_token().await.as_deref(), Some("v1"));
        let record = second.sync_full().await;
        assert!(!record.changed());
    }

    #[tokio::test]
    async fn test_consistency_report_flags_drift() {
        let upstream = Upstream::new(&["a", "b", "c", "d"]);
        let tiers = TierStack::in_memory();
        let (manager, _) = manager_with(upstream.clone(), tiers.clone());
        manager.sync_full().await;
        assert!(manager.validate_consistency().await.unwrap().is_consistent());

        {
            let mut funds = upstream.funds.write();
            funds.remove("d");
            if let Some(a) = funds.get_mut("a") {
                a.nav = 5.0;
            }
        }
        let mut split = test_fund("b");
        split.nav = 7.0;
        tiers.l2.put("fund:b", &CachedValue::Fund(split.clone()), PutOptions::default()).await.unwrap();
        split.nav = 8.0;
        tiers.l3.put("fund:b", &CachedValue::Fund(split), PutOptions::default()).await.unwrap();

        let report = manager.validate_consistency().await.unwrap();
        assert_eq!(report.total_checked, 4);
        assert_eq!(report.inconsistent_keys, vec!["a", "b", "d"]);
        assert_eq!(report.actions_of(ActionType::RefreshCache).unwrap().affected_keys, vec!["a"]);
        assert_eq!(report.actions_of(ActionType::RepairData).unwrap().affected_keys, vec!["b"]);
        assert_eq!(report.actions_of(ActionType::Discard).unwrap().affected_keys, vec!["d"]);
        assert!(report.actions_of(ActionType::Resync).is_some());
        assert!(matches!(report.conflict(), Some(DataLayerError::SyncConflict { .. })));
    }

    #[test]
    fn test_selective_scope_ignores_order_and_duplicates() {
        let a = SyncScope::selective(&["x".into(), "y".into()]);
        let b = SyncScope::selective(&["y".into(), "x".into(), "x".into()]);
        assert_eq!(a, b);
        assert_ne!(a, SyncScope::selective(&["x".into()]));
    }
}
