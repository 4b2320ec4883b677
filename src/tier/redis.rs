//! Redis-backed L3 tier.
//!
//! Layout under the configured prefix (e.g. `fund-data:`):
//!
//! ```text
//! {prefix}e:{key}   HASH  v = codec blob, p = priority, c = created_at, t = '|tag|...|'
//! {prefix}t:{tag}   SET   keys that were written with the tag
//! ```
//!
//! Expiry is delegated to Redis (`PEXPIRE`), and so is capacity: this tier
//! never evicts on its own and relies on the server's `maxmemory-policy`.
//! Tag sets are only an index; membership is re-checked against the entry's
//! `t` field before deleting. Members whose entry expired or was rewritten
//! without the tag are pruned by `sweep_expired`.

use std::sync::Arc;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tracing::{debug, warn};

use super::now_millis;
use super::traits::{compile_pattern, CacheTier, CacheTierStats, PutOptions, TierCounters, TierError};
use crate::codec;
use crate::payload::CachedValue;
use crate::resilience::retry::{retry, RetryConfig};

const SCAN_BATCH: usize = 500;

fn backend(e: redis::RedisError) -> TierError {
    if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout() {
        TierError::Unavailable(e.to_string())
    } else {
        TierError::Backend(e.to_string())
    }
}

pub struct RedisTier {
    name: String,
    connection: ConnectionManager,
    prefix: String,
    compress_threshold: usize,
    counters: Arc<TierCounters>,
}

impl RedisTier {
    /// Connect with the startup retry preset; fails fast on a bad URL or unreachable server.
    pub async fn connect(url: &str, prefix: &str) -> Result<Self, TierError> {
        let client = Client::open(url).map_err(backend)?;

        let connection = retry("l3_connect", &RetryConfig::startup(), || async {
            ConnectionManager::new(client.clone()).await
        })
        .await
        .map_err(backend)?;

        Ok(Self {
            name: "L3".to_string(),
            connection,
            prefix: prefix.to_string(),
            compress_threshold: codec::DEFAULT_COMPRESS_THRESHOLD,
            counters: Arc::new(TierCounters::default()),
        })
    }

    #[must_use]
    pub fn with_compress_threshold(mut self, threshold: usize) -> Self {
        self.compress_threshold = threshold;
        self
    }

    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    #[inline]
    fn entry_key(&self, key: &str) -> String {
        format!("{}e:{}", self.prefix, key)
    }

    #[inline]
    fn tag_key(&self, tag: &str) -> String {
        format!("{}t:{}", self.prefix, tag)
    }

    fn strip_entry_prefix<'a>(&self, redis_key: &'a str) -> Option<&'a str> {
        redis_key
            .strip_prefix(self.prefix.as_str())
            .and_then(|k| k.strip_prefix("e:"))
    }

    /// All Redis keys matching `match_pattern`, via cursor SCAN.
    async fn scan(&self, match_pattern: &str) -> Result<Vec<String>, TierError> {
        let mut conn = self.connection.clone();
        let mut cursor: u64 = 0;
        let mut found = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(match_pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(backend)?;
            found.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        found.sort();
        found.dedup();
        Ok(found)
    }

    /// Members of one tag set, via cursor SSCAN.
    async fn tag_members(&self, tag_key: &str) -> Result<Vec<String>, TierError> {
        let mut conn = self.connection.clone();
        let mut cursor: u64 = 0;
        let mut members = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SSCAN")
                .arg(tag_key)
                .arg(cursor)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(backend)?;
            members.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(members)
    }

    /// Drop members of `tag_key` whose entry no longer carries `tag`.
    async fn prune_tag(&self, tag_key: &str, tag: &str) -> Result<u64, TierError> {
        let members = self.tag_members(tag_key).await?;
        if members.is_empty() {
            return Ok(0);
        }
        let marker = format!("|{}|", tag);
        let mut conn = self.connection.clone();
        let mut pruned = 0u64;
        for chunk in members.chunks(SCAN_BATCH) {
            let mut pipeline = redis::pipe();
            for member in chunk {
                pipeline.cmd("HGET").arg(self.entry_key(member)).arg("t");
            }
            let tags: Vec<Option<String>> = pipeline.query_async(&mut conn).await.map_err(backend)?;
            let stale: Vec<&String> = chunk
                .iter()
                .zip(tags)
                .filter(|(_, t)| !t.as_deref().is_some_and(|t| t.contains(&marker)))
                .map(|(member, _)| member)
                .collect();
            if !stale.is_empty() {
                let n: u64 = conn.srem(tag_key, stale).await.map_err(backend)?;
                pruned += n;
            }
        }
        Ok(pruned)
    }

    async fn delete_keys(&self, keys: &[String]) -> Result<u64, TierError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection.clone();
        let mut removed = 0u64;
        for chunk in keys.chunks(SCAN_BATCH) {
            let n: u64 = conn.del(chunk).await.map_err(backend)?;
            removed += n;
        }
        Ok(removed)
    }
}

#[async_trait]
impl CacheTier for RedisTier {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> Result<Option<CachedValue>, TierError> {
        let mut conn = self.connection.clone();
        let redis_key = self.entry_key(key);
        let blob: Option<Vec<u8>> = conn.hget(&redis_key, "v").await.map_err(backend)?;

        let Some(blob) = blob else {
            self.counters.miss();
            return Ok(None);
        };

        match codec::decode(&blob) {
            Ok(value) => {
                self.counters.hit();
                Ok(Some(value))
            }
            Err(e) => {
                warn!(tier = %self.name, key, error = %e, "Dropping undecodable entry");
                let _: () = conn.del(&redis_key).await.map_err(backend)?;
                self.counters.miss();
                Err(e.into())
            }
        }
    }

    async fn put(&self, key: &str, value: &CachedValue, options: PutOptions) -> Result<(), TierError> {
        let blob = codec::encode(value, self.compress_threshold)?;
        let redis_key = self.entry_key(key);
        let tags = if options.tags.is_empty() {
            String::new()
        } else {
            format!("|{}|", options.tags.join("|"))
        };

        let mut pipeline = redis::pipe();
        pipeline
            .atomic()
            .cmd("DEL")
            .arg(&redis_key)
            .ignore()
            .cmd("HSET")
            .arg(&redis_key)
            .arg("v")
            .arg(blob.as_slice())
            .arg("p")
            .arg(options.priority as i64)
            .arg("c")
            .arg(now_millis())
            .arg("t")
            .arg(&tags)
            .ignore();
        if let Some(ttl) = options.ttl {
            let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
            pipeline.cmd("PEXPIRE").arg(&redis_key).arg(ttl_ms).ignore();
        }
        for tag in &options.tags {
            pipeline.cmd("SADD").arg(self.tag_key(tag)).arg(key).ignore();
        }

        let mut conn = self.connection.clone();
        pipeline.query_async::<()>(&mut conn).await.map_err(backend)?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), TierError> {
        let mut conn = self.connection.clone();
        let _: () = conn.del(self.entry_key(key)).await.map_err(backend)?;
        Ok(())
    }

    async fn remove_by_pattern(&self, pattern: &str) -> Result<u64, TierError> {
        compile_pattern(pattern)?;
        let keys = self.scan(&self.entry_key(pattern)).await?;
        self.delete_keys(&keys).await
    }

    async fn remove_by_tag(&self, tag: &str) -> Result<u64, TierError> {
        let mut conn = self.connection.clone();
        let tag_key = self.tag_key(tag);
        let members: Vec<String> = conn.smembers(&tag_key).await.map_err(backend)?;
        let marker = format!("|{}|", tag);

        let mut doomed = Vec::new();
        for member in members {
            let redis_key = self.entry_key(&member);
            let tags: Option<String> = conn.hget(&redis_key, "t").await.map_err(backend)?;
            if tags.is_some_and(|t| t.contains(&marker)) {
                doomed.push(redis_key);
            }
        }

        let removed = self.delete_keys(&doomed).await?;
        let _: () = conn.del(&tag_key).await.map_err(backend)?;
        debug!(tier = %self.name, tag, removed, "Removed entries by tag");
        Ok(removed)
    }

    async fn clear(&self) -> Result<(), TierError> {
        let keys = self.scan(&format!("{}*", self.prefix)).await?;
        self.delete_keys(&keys).await?;
        self.counters.reset();
        Ok(())
    }

    async fn stats(&self) -> Result<CacheTierStats, TierError> {
        let total = self.scan(&self.entry_key("*")).await?.len() as u64;
        // Redis drops expired keys itself; nothing expired is ever visible.
        Ok(self.counters.stats(total, 0))
    }

    /// Redis expires entries itself; this only prunes tag-set members left
    /// behind by them and returns how many were dropped.
    async fn sweep_expired(&self) -> Result<u64, TierError> {
        let tag_prefix = self.tag_key("");
        let mut pruned = 0u64;
        for tag_key in self.scan(&format!("{}*", tag_prefix)).await? {
            let Some(tag) = tag_key.strip_prefix(tag_prefix.as_str()) else {
                continue;
            };
            pruned += self.prune_tag(&tag_key, tag).await?;
        }
        if pruned > 0 {
            debug!(tier = %self.name, pruned, "Pruned stale tag members");
        }
        Ok(pruned)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, TierError> {
        compile_pattern(pattern)?;
        let raw = self.scan(&self.entry_key(pattern)).await?;
        Ok(raw
            .iter()
            .filter_map(|k| self.strip_entry_prefix(k))
            .map(str::to_string)
            .collect())
    }
}
