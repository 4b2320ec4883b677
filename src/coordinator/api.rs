//! Query API: cache-aside reads, request coalescing, batch fan-out.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{join_all, try_join_all};
use futures::FutureExt;
use tracing::{debug, instrument, Span};

use crate::error::Result;
use crate::metrics::LatencyTimer;
use crate::model::{keys, Fund, FundCriteria, FundRanking, RankingCriteria};
use crate::payload::CachedValue;
use crate::source::{fetch_by_codes, DataSourceSwitcher, SourceError, SourceRequest, SourceResponse};
use crate::tier::{PutOptions, TierLevel, TierStack};

use super::inflight::RequestCoalescer;
use super::DataLayerCoordinator;

/// Everything needed to serve one aggregate key cache-aside.
struct Lookup<T> {
    key: String,
    request: SourceRequest,
    options: PutOptions,
    wrap: fn(T) -> CachedValue,
    unwrap: fn(CachedValue) -> Option<T>,
    decode: fn(SourceResponse) -> std::result::Result<T, SourceError>,
}

/// Write `value` to every tier, slowest first.
async fn backfill(tiers: &TierStack, key: &str, value: &CachedValue, options: &PutOptions) {
    for level in [TierLevel::L3, TierLevel::L2, TierLevel::L1] {
        tiers.put_quiet(level, key, value, options.clone()).await;
    }
}

fn fund_options(fund: &Fund, ttl: Duration) -> PutOptions {
    keys::fund_tags(fund)
        .into_iter()
        .fold(PutOptions::default().with_ttl(ttl), |options, tag| options.with_tag(tag))
}

impl DataLayerCoordinator {
    /// Fund list matching `criteria`.
    ///
    /// Read cache-aside through L1 → L2 → L3 unless `force_refresh`. On a full
    /// miss the source is queried (concurrent identical queries share one
    /// request) and the result is written back to all three tiers. A failed
    /// fetch writes nothing.
    #[instrument(skip(self, criteria), fields(tier))]
    pub async fn get_funds(
        &self,
        criteria: &FundCriteria,
        force_refresh: bool,
        timeout: Option<Duration>,
    ) -> Result<Vec<Fund>> {
        self.ensure_ready()?;
        let _timer = LatencyTimer::new("coordinator", "get_funds");
        let criteria = criteria.normalized();
        let lookup = Lookup {
            key: keys::fund_list(&criteria),
            options: self.list_options(&criteria, self.config.list_ttl_secs),
            request: SourceRequest::Funds(criteria),
            wrap: CachedValue::FundList,
            unwrap: CachedValue::into_funds,
            decode: SourceResponse::into_funds,
        };
        self.cache_aside(lookup, force_refresh, timeout, &self.fund_lists).await
    }

    /// Search results for `criteria`, keyed by the normalized criteria
    /// fingerprint. Records the search term for [`popular_searches`](Self::popular_searches).
    #[instrument(skip(self, criteria), fields(tier))]
    pub async fn search_funds(&self, criteria: &FundCriteria) -> Result<Vec<Fund>> {
        self.ensure_ready()?;
        let _timer = LatencyTimer::new("coordinator", "search_funds");
        let criteria = criteria.normalized();
        if let Some(term) = criteria.search_term() {
            *self.search_usage.entry(term).or_insert(0) += 1;
        }
        let lookup = Lookup {
            key: keys::search(&criteria),
            options: self.list_options(&criteria, self.config.search_ttl_secs),
            request: SourceRequest::Search(criteria),
            wrap: CachedValue::SearchResult,
            unwrap: CachedValue::into_funds,
            decode: SourceResponse::into_funds,
        };
        self.cache_aside(lookup, false, None, &self.fund_lists).await
    }

    /// Ranking table for `criteria`.
    #[instrument(skip(self, criteria), fields(tier))]
    pub async fn get_fund_rankings(&self, criteria: &RankingCriteria) -> Result<Vec<FundRanking>> {
        self.ensure_ready()?;
        let _timer = LatencyTimer::new("coordinator", "get_fund_rankings");
        let mut options = PutOptions::default()
            .with_ttl(Duration::from_secs(self.config.ranking_ttl_secs))
            .with_tag(keys::TAG_FUNDS);
        if let Some(fund_type) = criteria.fund_type.as_deref() {
            options = options.with_tag(keys::fund_type_tag(fund_type));
        }
        let lookup = Lookup {
            key: keys::ranking(criteria),
            options,
            request: SourceRequest::Rankings(criteria.clone()),
            wrap: CachedValue::Ranking,
            unwrap: CachedValue::into_rankings,
            decode: SourceResponse::into_rankings,
        };
        self.cache_aside(lookup, false, None, &self.rankings).await
    }

    /// Funds by code. Cached codes are served from the tiers; the rest are
    /// fetched in one fan-out (a single batch request when the source
    /// supports it). Concurrent callers asking for the same uncached code
    /// share one fetch. Codes unknown upstream are absent from the map.
    #[instrument(skip(self, codes), fields(requested = codes.len(), cached))]
    pub async fn get_batch_funds(&self, codes: &[String]) -> Result<HashMap<String, Fund>> {
        self.ensure_ready()?;
        let _timer = LatencyTimer::new("coordinator", "get_batch_funds");
        let codes: BTreeSet<String> = codes.iter().map(|c| c.trim().to_string()).filter(|c| !c.is_empty()).collect();
        let fund_ttl = Duration::from_secs(self.config.fund_ttl_secs);

        let mut found = HashMap::with_capacity(codes.len());
        let mut uncached = Vec::new();
        for code in codes {
            let key = keys::fund(&code);
            let cached = self
                .read_through(&key, |value| value.as_fund().map(|f| fund_options(f, fund_ttl)))
                .await
                .and_then(CachedValue::into_fund);
            match cached {
                Some(fund) => {
                    found.insert(code, fund);
                }
                None => uncached.push(code),
            }
        }
        Span::current().record("cached", found.len());
        self.record_query(found.len() as u64, uncached.len() as u64);

        if uncached.is_empty() {
            return Ok(found);
        }

        let switcher = self.switcher.clone();
        let tiers = self.tiers.clone();
        let (requests, joined) = self.fund_codes.join_or_start_many(&uncached, move |group| {
            fetch_group(switcher, tiers, group, fund_ttl).boxed()
        });
        if joined > 0 {
            debug!(joined, "Joined in-flight fund fetches");
            crate::metrics::record_coalesced("batch");
        }

        let fetched = try_join_all(requests).await?;
        for code in uncached {
            if let Some(fund) = fetched.iter().find_map(|group| group.get(&code)) {
                found.insert(code, fund.clone());
            }
        }
        Ok(found)
    }

    /// One fund by code; `None` when the source does not know it.
    pub async fn get_fund(&self, code: &str) -> Result<Option<Fund>> {
        let mut found = self.get_batch_funds(&[code.to_string()]).await?;
        Ok(found.remove(code.trim()))
    }

    /// Invalidate cached data and resynchronize.
    ///
    /// - no criteria: every fund, list and ranking key, then a full sync
    /// - criteria naming codes: those funds and the criteria's keys, then a
    ///   selective sync of the codes
    /// - other criteria: the criteria's list/search keys, then an incremental sync
    ///
    /// Returns whether the sync succeeded.
    #[instrument(skip(self, criteria))]
    pub async fn refresh_cache(&self, criteria: Option<&FundCriteria>) -> Result<bool> {
        self.ensure_ready()?;
        let record = match criteria.map(FundCriteria::normalized) {
            None => {
                let mut removed = 0;
                for pattern in [keys::FUND_PATTERN, keys::LIST_PATTERN, keys::RANKING_PATTERN] {
                    removed += self.tiers.remove_pattern_everywhere(pattern).await;
                }
                debug!(removed, "Invalidated all fund data");
                self.sync.forget(None).await;
                self.sync.sync_full().await
            }
            Some(criteria) => {
                let list_key = keys::fund_list(&criteria);
                let search_key = keys::search(&criteria);
                self.tiers.remove_quiet(&TierLevel::ALL, &list_key).await;
                self.tiers.remove_quiet(&TierLevel::ALL, &search_key).await;
                if criteria.codes.is_empty() {
                    self.sync.sync_incremental(None).await
                } else {
                    for code in &criteria.codes {
                        self.tiers.remove_quiet(&TierLevel::ALL, &keys::fund(code)).await;
                    }
                    self.sync.forget(Some(&criteria.codes)).await;
                    self.sync.sync_selective(criteria.codes.clone()).await
                }
            }
        };
        Ok(record.success)
    }

    /// Remove every entry carrying `tag` from all tiers.
    pub async fn remove_by_tag(&self, tag: &str) -> u64 {
        self.tiers.remove_tag_everywhere(tag).await
    }

    /// Sweep expired entries from all tiers now.
    pub async fn sweep_expired(&self) -> u64 {
        let removed = self.tiers.sweep_expired().await;
        if removed > 0 {
            debug!(removed, "Swept expired cache entries");
        }
        removed
    }

    /// The `limit` most frequent search terms, most frequent first.
    #[must_use]
    pub fn popular_searches(&self, limit: usize) -> Vec<(String, u64)> {
        let mut usage: Vec<(String, u64)> = self
            .search_usage
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        usage.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        usage.truncate(limit);
        usage
    }

    fn list_options(&self, criteria: &FundCriteria, ttl_secs: u64) -> PutOptions {
        let options = PutOptions::default()
            .with_ttl(Duration::from_secs(ttl_secs))
            .with_tag(keys::TAG_FUNDS);
        match criteria.fund_type.as_deref() {
            Some(fund_type) => options.with_tag(keys::fund_type_tag(fund_type)),
            None => options,
        }
    }

    pub(super) fn record_query(&self, hits: u64, misses: u64) {
        self.query_hits.fetch_add(hits, Ordering::Relaxed);
        self.query_misses.fetch_add(misses, Ordering::Relaxed);
    }

    /// L1 → L2 → L3. A hit in a slower tier is copied into the faster ones
    /// with the options `backfill_options` derives from the value.
    async fn read_through<F>(&self, key: &str, backfill_options: F) -> Option<CachedValue>
    where
        F: Fn(&CachedValue) -> Option<PutOptions>,
    {
        for (depth, level) in TierLevel::ALL.into_iter().enumerate() {
            let Some(value) = self.tiers.get_quiet(level, key).await else {
                continue;
            };
            Span::current().record("tier", level.as_str());
            if depth > 0 {
                if let Some(options) = backfill_options(&value) {
                    for faster in TierLevel::ALL[..depth].iter().rev() {
                        self.tiers.put_quiet(*faster, key, &value, options.clone()).await;
                    }
                }
            }
            return Some(value);
        }
        None
    }

    async fn cache_aside<T>(
        &self,
        lookup: Lookup<T>,
        force_refresh: bool,
        timeout: Option<Duration>,
        coalescer: &Arc<RequestCoalescer<Result<T>>>,
    ) -> Result<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        if !force_refresh {
            let options = lookup.options.clone();
            let cached = self
                .read_through(&lookup.key, |_| Some(options.clone()))
                .await
                .and_then(lookup.unwrap);
            if let Some(value) = cached {
                self.record_query(1, 0);
                return Ok(value);
            }
        }
        self.record_query(0, 1);
        Span::current().record("tier", "source");

        let operation = lookup.request.operation();
        let switcher = self.switcher.clone();
        let tiers = self.tiers.clone();
        let key = lookup.key.clone();
        let (request, joined) = coalescer.join_or_start(&key, move || {
            fetch_and_backfill(switcher, tiers, lookup, timeout).boxed()
        });
        if joined {
            debug!(operation, "Joined in-flight request");
            crate::metrics::record_coalesced(operation);
        }
        request.await
    }
}

async fn fetch_and_backfill<T>(
    switcher: Arc<DataSourceSwitcher>,
    tiers: TierStack,
    lookup: Lookup<T>,
    timeout: Option<Duration>,
) -> Result<T>
where
    T: Clone + Send + Sync + 'static,
{
    let decode = lookup.decode;
    let request = &lookup.request;
    let value = switcher
        .execute(request.operation(), timeout, |source| async move {
            source.fetch(request).await.and_then(decode)
        })
        .await?;
    backfill(&tiers, &lookup.key, &(lookup.wrap)(value.clone()), &lookup.options).await;
    Ok(value)
}

/// Fetch one group of uncached codes and backfill each fund into every tier.
async fn fetch_group(
    switcher: Arc<DataSourceSwitcher>,
    tiers: TierStack,
    codes: Vec<String>,
    fund_ttl: Duration,
) -> Result<Arc<HashMap<String, Fund>>> {
    let codes = &codes;
    let funds = switcher
        .execute("batch", None, |source| async move { fetch_by_codes(source.as_ref(), codes).await })
        .await?;

    join_all(funds.iter().map(|fund| {
        let key = keys::fund(&fund.code);
        let options = fund_options(fund, fund_ttl);
        let tiers = &tiers;
        async move { backfill(tiers, &key, &CachedValue::Fund(fund.clone()), &options).await }
    }))
    .await;

    Ok(Arc::new(funds.into_iter().map(|f| (f.code.clone(), f)).collect()))
}
