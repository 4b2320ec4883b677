//! Integration tests for the data layer.
//!
//! Everything here runs against scripted in-process sources and in-process
//! tiers, except the Redis tests, which need Docker and are `#[ignore]`d.
//!
//! # Running Tests
//! ```bash
//! # In-process scenarios
//! cargo test --test integration
//!
//! # Including the Redis-backed L3 (requires Docker)
//! cargo test --test integration -- --ignored
//! ```
//!
//! # Test Organization
//! - `happy_*` - cache-aside reads, coalescing, sync, persistence
//! - `redis_*` - the L3 tier against a real Redis

mod common;

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;

use fund_data_layer::model::keys;
use fund_data_layer::sync::ActionType;
use fund_data_layer::tier::{MemoryTier, RedisTier, SqlTier};
use fund_data_layer::{
    CacheTier, CachedValue, DataLayerConfig, DataLayerEvent, FundCriteria, PutOptions, RankingCriteria,
    SyncType, TierStack,
};

use common::{codes, fund, started, started_in_memory, ScriptedSource};

use testcontainers::{clients::Cli, core::WaitFor, Container, GenericImage};

// =============================================================================
// Cache-aside reads
// =============================================================================

#[tokio::test]
async fn happy_repeat_list_query_served_from_cache() {
    let source = ScriptedSource::new("primary", &["000001", "000002", "000003"]);
    let coordinator = started_in_memory(&[&source]).await;
    let criteria = FundCriteria::default();

    let first = coordinator.get_funds(&criteria, false, None).await.unwrap();
    let second = coordinator.get_funds(&criteria, false, None).await.unwrap();
    assert_eq!(first.len(), 3);
    assert_eq!(first, second);
    assert_eq!(source.requests_for("funds"), 1);

    // Equivalent criteria hit the same key
    let reordered = FundCriteria {
        codes: Vec::new(),
        keyword: Some("   ".to_string()),
        ..Default::default()
    };
    coordinator.get_funds(&reordered, false, None).await.unwrap();
    assert_eq!(source.requests_for("funds"), 1);

    coordinator.get_funds(&criteria, true, None).await.unwrap();
    assert_eq!(source.requests_for("funds"), 2);

    coordinator.dispose().await;
}

#[tokio::test]
async fn happy_slower_tier_hit_backfills_faster_tiers() {
    let source = ScriptedSource::new("primary", &["000001"]);
    let coordinator = started_in_memory(&[&source]).await;
    let criteria = FundCriteria::default();
    let key = keys::fund_list(&criteria);

    coordinator.get_funds(&criteria, false, None).await.unwrap();
    let tiers = coordinator.tiers().clone();
    assert!(tiers.l1.get(&key).await.unwrap().is_some());
    assert!(tiers.l3.get(&key).await.unwrap().is_some());

    tiers.l1.clear().await.unwrap();
    tiers.l2.clear().await.unwrap();
    coordinator.get_funds(&criteria, false, None).await.unwrap();
    assert_eq!(source.requests_for("funds"), 1, "served from L3");
    assert!(tiers.l2.get(&key).await.unwrap().is_some());
    assert!(tiers.l1.get(&key).await.unwrap().is_some());

    coordinator.dispose().await;
}

#[tokio::test]
async fn happy_search_and_rankings_are_cached() {
    let source = ScriptedSource::new("primary", &["000001", "000002"]);
    let coordinator = started_in_memory(&[&source]).await;

    let criteria = FundCriteria {
        keyword: Some("Fund 000001".to_string()),
        ..Default::default()
    };
    let found = coordinator.search_funds(&criteria).await.unwrap();
    assert_eq!(found.len(), 1);
    coordinator.search_funds(&criteria).await.unwrap();
    assert_eq!(source.requests_for("search"), 1);
    assert_eq!(coordinator.popular_searches(5), vec![("fund 000001".to_string(), 2)]);

    let rankings = coordinator.get_fund_rankings(&RankingCriteria::default()).await.unwrap();
    assert_eq!(rankings.len(), 2);
    assert_eq!(rankings[0].rank, 1);
    coordinator.get_fund_rankings(&RankingCriteria::default()).await.unwrap();
    assert_eq!(source.requests_for("rankings"), 1);

    coordinator.dispose().await;
}

#[tokio::test]
async fn happy_remove_by_tag_drops_fund_type_entries() {
    let source = ScriptedSource::new("primary", &["000001"]);
    let coordinator = started_in_memory(&[&source]).await;
    let criteria = FundCriteria {
        fund_type: Some("Equity".to_string()),
        ..Default::default()
    };

    coordinator.get_funds(&criteria, false, None).await.unwrap();
    let removed = coordinator.remove_by_tag(&keys::fund_type_tag("equity")).await;
    assert_eq!(removed, 3, "one list entry per tier");

    coordinator.get_funds(&criteria, false, None).await.unwrap();
    assert_eq!(source.requests_for("funds"), 2);

    coordinator.dispose().await;
}

// =============================================================================
// Batch reads and request coalescing
// =============================================================================

#[tokio::test]
async fn happy_concurrent_batch_requests_share_one_fetch() {
    let source = ScriptedSource::batching("primary", &["000001", "000002", "000003"]);
    source.set_delay(Duration::from_millis(50));
    let coordinator = started_in_memory(&[&source]).await;
    let wanted = codes(&["000001", "000002"]);

    let results = join_all((0..10).map(|_| coordinator.get_batch_funds(&wanted))).await;
    for result in results {
        let found = result.unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found["000001"], fund("000001"));
    }
    assert_eq!(source.requests(), 1);

    // Now cached per code
    let found = coordinator.get_batch_funds(&codes(&["000002", "000001"])).await.unwrap();
    assert_eq!(found.len(), 2);
    assert_eq!(source.requests(), 1);

    coordinator.dispose().await;
}

#[tokio::test]
async fn happy_batch_fetches_only_uncached_codes() {
    let source = ScriptedSource::new("primary", &["000001", "000002", "000003"]);
    let coordinator = started_in_memory(&[&source]).await;

    coordinator.get_fund("000001").await.unwrap().unwrap();
    assert_eq!(source.requests_for("fund"), 1);

    let found = coordinator
        .get_batch_funds(&codes(&["000001", "000002", "000003", "999999"]))
        .await
        .unwrap();
    assert_eq!(found.len(), 3, "unknown codes are absent");
    assert_eq!(source.requests_for("fund"), 4, "one per uncached code");
    assert!(coordinator.get_fund("999999").await.unwrap().is_none());

    coordinator.dispose().await;
}

#[tokio::test]
async fn happy_concurrent_list_queries_share_one_fetch() {
    let source = ScriptedSource::new("primary", &["000001"]);
    source.set_delay(Duration::from_millis(50));
    let coordinator = started_in_memory(&[&source]).await;
    let criteria = FundCriteria::default();

    let results = join_all((0..8).map(|_| coordinator.get_funds(&criteria, false, None))).await;
    assert!(results.iter().all(|r| r.as_ref().is_ok_and(|funds| funds.len() == 1)));
    assert_eq!(source.requests_for("funds"), 1);

    coordinator.dispose().await;
}

// =============================================================================
// Sync
// =============================================================================

#[tokio::test]
async fn happy_full_sync_is_idempotent() {
    let source = ScriptedSource::new("primary", &["000001", "000002", "000003"]);
    let coordinator = started_in_memory(&[&source]).await;
    let mut events = coordinator.subscribe();

    let first = coordinator.sync_full().await.unwrap();
    assert!(first.success);
    assert_eq!(first.items_added, 3);

    let second = coordinator.sync_full().await.unwrap();
    assert!(second.success);
    assert!(!second.changed());

    let mut changed = fund("000002");
    changed.nav = 1.25;
    source.upsert(changed.clone());
    source.delete("000003");
    let third = coordinator.sync_full().await.unwrap();
    assert_eq!((third.items_added, third.items_updated, third.items_deleted), (0, 1, 1));

    // Synced funds are served without asking the source
    let before = source.requests();
    assert_eq!(coordinator.get_fund("000002").await.unwrap(), Some(changed));
    assert_eq!(source.requests(), before);

    assert_eq!(coordinator.sync_history().len(), 3);
    let mut completed = 0;
    while let Some(event) = events.try_recv() {
        if matches!(event, DataLayerEvent::SyncCompleted { .. }) {
            completed += 1;
        }
    }
    assert_eq!(completed, 3);

    coordinator.dispose().await;
}

#[tokio::test]
async fn happy_incremental_sync_follows_the_cursor() {
    let source = ScriptedSource::new("primary", &["000001", "000002"]);
    let coordinator = started_in_memory(&[&source]).await;

    let first = coordinator.sync_incremental(None).await.unwrap();
    assert_eq!(first.sync_type, SyncType::Full, "no cursor yet");
    assert_eq!(first.source_version_token.as_deref(), Some("v1"));

    let idle = coordinator.sync_incremental(None).await.unwrap();
    assert_eq!(idle.sync_type, SyncType::Incremental);
    assert!(!idle.changed());

    source.upsert(fund("000003"));
    source.delete("000001");
    let next = coordinator.sync_incremental(None).await.unwrap();
    assert_eq!((next.items_added, next.items_deleted), (1, 1));
    assert_eq!(next.source_version_token.as_deref(), Some("v3"));
    assert!(coordinator.tiers().l2.get(&keys::fund("000001")).await.unwrap().is_none());

    coordinator.dispose().await;
}

#[tokio::test]
async fn happy_sync_invalidates_cached_lists() {
    let source = ScriptedSource::new("primary", &["000001"]);
    let coordinator = started_in_memory(&[&source]).await;
    let criteria = FundCriteria::default();

    coordinator.sync_full().await.unwrap();
    assert_eq!(coordinator.get_funds(&criteria, false, None).await.unwrap().len(), 1);

    source.upsert(fund("000002"));
    coordinator.sync_full().await.unwrap();
    assert_eq!(coordinator.get_funds(&criteria, false, None).await.unwrap().len(), 2);
    assert_eq!(source.requests_for("funds"), 2);

    coordinator.dispose().await;
}

#[tokio::test]
async fn happy_consistency_report_and_selective_refresh() {
    let source = ScriptedSource::new("primary", &["000001", "000002", "000003"]);
    let coordinator = started_in_memory(&[&source]).await;
    coordinator.sync_full().await.unwrap();
    assert!(coordinator.validate_consistency().await.unwrap().is_consistent());

    let mut changed = fund("000002");
    changed.name = "Renamed".to_string();
    source.upsert(changed.clone());

    let report = coordinator.validate_consistency().await.unwrap();
    assert_eq!(report.total_checked, 3);
    assert_eq!(report.inconsistent_keys, vec!["000002".to_string()]);
    let refresh = report.actions_of(ActionType::RefreshCache).unwrap();
    assert_eq!(refresh.affected_keys, vec!["000002".to_string()]);
    assert!(report.actions_of(ActionType::Resync).is_none());

    // Reporting never repairs
    assert_ne!(coordinator.get_fund("000002").await.unwrap(), Some(changed.clone()));

    let criteria = FundCriteria {
        codes: codes(&["000002"]),
        ..Default::default()
    };
    assert!(coordinator.refresh_cache(Some(&criteria)).await.unwrap());
    assert_eq!(coordinator.get_fund("000002").await.unwrap(), Some(changed));
    assert!(coordinator.validate_consistency().await.unwrap().is_consistent());

    coordinator.dispose().await;
}

#[tokio::test]
async fn happy_sync_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("l2.db");
    let path = path.to_str().unwrap();

    let tiers = |l2: SqlTier| {
        TierStack::new(
            Arc::new(MemoryTier::unbounded("L1")),
            Arc::new(l2),
            Arc::new(MemoryTier::unbounded("L3")),
        )
    };

    let source = ScriptedSource::new("primary", &["000001", "000002"]);
    let coordinator = started(DataLayerConfig::default(), tiers(SqlTier::open(path).await.unwrap()), &[&source]).await;
    coordinator.sync_full().await.unwrap();
    coordinator.dispose().await;

    let restarted_source = ScriptedSource::new("primary", &["000001", "000002"]);
    let restarted = started(
        DataLayerConfig::default(),
        tiers(SqlTier::open(path).await.unwrap()),
        &[&restarted_source],
    )
    .await;

    assert_eq!(restarted.get_fund("000001").await.unwrap(), Some(fund("000001")));
    assert_eq!(restarted_source.requests(), 0, "served from the persisted L2");

    let record = restarted.sync_incremental(None).await.unwrap();
    assert_eq!(record.sync_type, SyncType::Incremental, "cursor restored");
    assert!(!record.changed());

    restarted.dispose().await;
}

#[tokio::test]
async fn happy_full_refresh_resyncs_everything() {
    let source = ScriptedSource::new("primary", &["000001", "000002"]);
    let coordinator = started_in_memory(&[&source]).await;
    coordinator.sync_full().await.unwrap();
    coordinator.get_funds(&FundCriteria::default(), false, None).await.unwrap();

    assert!(coordinator.refresh_cache(None).await.unwrap());
    let last = coordinator.sync_history().pop().unwrap();
    assert_eq!(last.sync_type, SyncType::Full);
    assert_eq!(last.items_added, 2, "index was cleared before the resync");

    coordinator.get_funds(&FundCriteria::default(), false, None).await.unwrap();
    assert_eq!(source.requests_for("funds"), 2);

    coordinator.dispose().await;
}

// =============================================================================
// Health and statistics
// =============================================================================

#[tokio::test]
async fn happy_health_report_and_stats() {
    let source = ScriptedSource::new("primary", &["000001"]);
    let coordinator = started_in_memory(&[&source]).await;

    coordinator.get_funds(&FundCriteria::default(), false, None).await.unwrap();
    coordinator.get_funds(&FundCriteria::default(), false, None).await.unwrap();

    let report = coordinator.get_health_report().await;
    assert!(report.is_healthy, "issues: {:?}", report.issues);
    assert_eq!(report.active_source.as_deref(), Some("primary"));
    assert_eq!(report.sources.len(), 1);

    let stats = coordinator.stats().await;
    assert!((stats.cache_hit_rate - 0.5).abs() < f64::EPSILON);
    assert_eq!(stats.memory_cache_entries, 1);
    assert!(stats.memory_cache_bytes > 0);

    coordinator.dispose().await;
}

// =============================================================================
// Redis L3 (requires Docker)
// =============================================================================

fn redis_container(docker: &Cli) -> Container<'_, GenericImage> {
    let image = GenericImage::new("redis", "7-alpine")
        .with_exposed_port(6379)
        .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"));
    docker.run(image)
}

#[tokio::test]
#[ignore] // Requires Docker
async fn redis_tier_round_trip_and_invalidation() {
    let docker = Cli::default();
    let redis = redis_container(&docker);
    let url = format!("redis://127.0.0.1:{}", redis.get_host_port_ipv4(6379));

    let tier = RedisTier::connect(&url, "it:").await.unwrap();
    let value = CachedValue::Fund(fund("000001"));
    let options = PutOptions::default().with_tag("funds").with_tag(keys::fund_tag("000001"));

    tier.put(&keys::fund("000001"), &value, options.clone()).await.unwrap();
    tier.put(&keys::fund("000002"), &CachedValue::Fund(fund("000002")), PutOptions::default().with_tag("funds"))
        .await
        .unwrap();
    assert_eq!(tier.get(&keys::fund("000001")).await.unwrap(), Some(value));

    assert_eq!(tier.remove_by_tag(&keys::fund_tag("000001")).await.unwrap(), 1);
    assert!(tier.get(&keys::fund("000001")).await.unwrap().is_none());
    assert_eq!(tier.keys("fund:*").await.unwrap(), vec![keys::fund("000002")]);

    assert_eq!(tier.remove_by_pattern("fund:*").await.unwrap(), 1);
    let stats = tier.stats().await.unwrap();
    assert_eq!(stats.hit_count, 1);
}

#[tokio::test]
#[ignore] // Requires Docker
async fn redis_tier_expires_entries() {
    let docker = Cli::default();
    let redis = redis_container(&docker);
    let url = format!("redis://127.0.0.1:{}", redis.get_host_port_ipv4(6379));

    let tier = RedisTier::connect(&url, "ttl:").await.unwrap();
    let options = PutOptions::default().with_ttl(Duration::from_millis(200));
    tier.put("fund:short", &CachedValue::Fund(fund("short")), options).await.unwrap();
    assert!(tier.get("fund:short").await.unwrap().is_some());

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(tier.get("fund:short").await.unwrap().is_none());
}

#[tokio::test]
#[ignore] // Requires Docker
async fn redis_sweep_prunes_tag_sets() {
    let docker = Cli::default();
    let redis = redis_container(&docker);
    let url = format!("redis://127.0.0.1:{}", redis.get_host_port_ipv4(6379));

    let tier = RedisTier::connect(&url, "tags:").await.unwrap();
    let short = PutOptions::default().with_ttl(Duration::from_millis(100)).with_tag("funds");
    for code in ["a", "b", "c"] {
        let key = keys::fund_list(&FundCriteria { keyword: Some(code.to_string()), ..Default::default() });
        tier.put(&key, &CachedValue::FundList(vec![fund(code)]), short.clone()).await.unwrap();
    }
    tier.put("fund:kept", &CachedValue::Fund(fund("kept")), PutOptions::default().with_tag("funds"))
        .await
        .unwrap();
    // Rewritten without the tag
    tier.put("fund:retagged", &CachedValue::Fund(fund("retagged")), PutOptions::default().with_tag("funds"))
        .await
        .unwrap();
    tier.put("fund:retagged", &CachedValue::Fund(fund("retagged")), PutOptions::default())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(tier.sweep_expired().await.unwrap(), 4);
    assert_eq!(tier.sweep_expired().await.unwrap(), 0);

    let client = redis::Client::open(url.as_str()).unwrap();
    let mut conn = client.get_multiplexed_async_connection().await.unwrap();
    let members: Vec<String> = redis::AsyncCommands::smembers(&mut conn, "tags:t:funds").await.unwrap();
    assert_eq!(members, vec!["fund:kept".to_string()]);
}
