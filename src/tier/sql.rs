// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLite-backed L2 tier.
//!
//! One row per entry. Values are stored through the [`codec`](crate::codec),
//! so large payloads are zstd-compressed on disk:
//!
//! ```sql
//! CREATE TABLE cache_entries (
//!   key TEXT PRIMARY KEY,
//!   value_blob BLOB NOT NULL,   -- codec output (JSON or zstd frame)
//!   expires_at INTEGER,         -- epoch millis, NULL = never
//!   priority INTEGER NOT NULL,  -- 0 = low .. 3 = critical
//!   tags TEXT NOT NULL,         -- '|tag-a|tag-b|'
//!   size_bytes INTEGER NOT NULL,
//!   created_at INTEGER NOT NULL,
//!   last_accessed_at INTEGER NOT NULL,
//!   access_tick INTEGER NOT NULL,
//!   access_count INTEGER NOT NULL
//! )
//! ```
//!
//! Key patterns map directly onto SQLite `GLOB`, which shares the `*`, `?`
//! and `[...]` syntax of the in-memory tier.

use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use sqlx::Row;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::now_millis;
use super::traits::{compile_pattern, CacheTier, CacheTierStats, CachePriority, PutOptions, TierCounters, TierError};
use crate::codec;
use crate::eviction::{EntryMeta, EvictionStrategy, LruStrategy, TierSnapshot};
use crate::payload::CachedValue;
use crate::resilience::retry::{retry, RetryConfig};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cache_entries (
    key TEXT PRIMARY KEY,
    value_blob BLOB NOT NULL,
    expires_at INTEGER,
    priority INTEGER NOT NULL DEFAULT 1,
    tags TEXT NOT NULL DEFAULT '',
    size_bytes INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    last_accessed_at INTEGER NOT NULL,
    access_tick INTEGER NOT NULL DEFAULT 0,
    access_count INTEGER NOT NULL DEFAULT 0
)
"#;

const EXPIRY_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_cache_entries_expires ON cache_entries (expires_at)";

fn backend(e: sqlx::Error) -> TierError {
    match e {
        sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
            TierError::Unavailable(e.to_string())
        }
        other => TierError::Backend(other.to_string()),
    }
}

fn encode_tags(tags: &[String]) -> String {
    if tags.is_empty() {
        return String::new();
    }
    let mut out = String::from("|");
    for tag in tags {
        out.push_str(tag);
        out.push('|');
    }
    out
}

pub struct SqlTier {
    name: String,
    pool: SqlitePool,
    max_entries: usize,
    strategy: Arc<dyn EvictionStrategy>,
    compress_threshold: usize,
    tick: AtomicU64,
    counters: TierCounters,
    write_lock: Mutex<()>,
}

impl SqlTier {
    /// Open (or create) a database file, retrying with the startup preset.
    pub async fn open(path: &str) -> Result<Self, TierError> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path))
            .map_err(backend)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = retry("l2_connect", &RetryConfig::startup(), || {
            let options = options.clone();
            async move {
                SqlitePoolOptions::new()
                    .max_connections(8)
                    .acquire_timeout(Duration::from_secs(10))
                    .connect_with(options)
                    .await
                    .map_err(backend)
            }
        })
        .await?;

        Self::with_pool(pool).await
    }

    /// Private in-memory database. A single pinned connection keeps it alive.
    pub async fn in_memory() -> Result<Self, TierError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:").map_err(backend)?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(backend)?;
        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self, TierError> {
        sqlx::query(SCHEMA).execute(&pool).await.map_err(backend)?;
        sqlx::query(EXPIRY_INDEX).execute(&pool).await.map_err(backend)?;

        let max_tick: i64 = sqlx::query("SELECT COALESCE(MAX(access_tick), 0) AS t FROM cache_entries")
            .fetch_one(&pool)
            .await
            .map_err(backend)?
            .try_get("t")
            .map_err(backend)?;

        Ok(Self {
            name: "L2".to_string(),
            pool,
            max_entries: usize::MAX,
            strategy: Arc::new(LruStrategy),
            compress_threshold: codec::DEFAULT_COMPRESS_THRESHOLD,
            tick: AtomicU64::new(max_tick.max(0) as u64),
            counters: TierCounters::default(),
            write_lock: Mutex::new(()),
        })
    }

    #[must_use]
    pub fn with_capacity(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    #[must_use]
    pub fn with_strategy(mut self, strategy: Arc<dyn EvictionStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    #[must_use]
    pub fn with_compress_threshold(mut self, threshold: usize) -> Self {
        self.compress_threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    fn next_tick(&self) -> i64 {
        (self.tick.fetch_add(1, Ordering::AcqRel) + 1) as i64
    }

    async fn count(&self) -> Result<usize, TierError> {
        let n: i64 = sqlx::query("SELECT COUNT(*) AS n FROM cache_entries")
            .fetch_one(&self.pool)
            .await
            .map_err(backend)?
            .try_get("n")
            .map_err(backend)?;
        Ok(n.max(0) as usize)
    }

    async fn delete_expired(&self, now: i64) -> Result<u64, TierError> {
        let result = sqlx::query("DELETE FROM cache_entries WHERE expires_at IS NOT NULL AND expires_at <= ?")
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(result.rows_affected())
    }

    async fn snapshot(&self, now: i64) -> Result<TierSnapshot, TierError> {
        let rows = sqlx::query(
            "SELECT key, size_bytes, created_at, expires_at, last_accessed_at, access_tick, access_count, priority \
             FROM cache_entries",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            entries.push(EntryMeta {
                key: row.try_get("key").map_err(backend)?,
                size_bytes: row.try_get::<i64, _>("size_bytes").map_err(backend)?.max(0) as usize,
                created_at: row.try_get("created_at").map_err(backend)?,
                expires_at: row.try_get("expires_at").map_err(backend)?,
                last_accessed_at: row.try_get("last_accessed_at").map_err(backend)?,
                access_tick: row.try_get::<i64, _>("access_tick").map_err(backend)?.max(0) as u64,
                access_count: row.try_get::<i64, _>("access_count").map_err(backend)?.max(0) as u64,
                priority: CachePriority::from_i64(row.try_get("priority").map_err(backend)?),
            });
        }
        Ok(TierSnapshot::new(entries, now))
    }

    /// Evict until one more row fits. Caller holds the write lock.
    async fn make_room(&self, key: &str) -> Result<(), TierError> {
        let exists = sqlx::query("SELECT 1 FROM cache_entries WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?
            .is_some();
        if exists || self.count().await? < self.max_entries {
            return Ok(());
        }

        let now = now_millis();
        let expired = self.delete_expired(now).await?;
        let count = self.count().await?;
        if count < self.max_entries {
            debug!(tier = %self.name, expired, "Dropped expired rows to make room");
            return Ok(());
        }

        let needed = count + 1 - self.max_entries;
        let snapshot = self.snapshot(now).await?;
        let victims = self.strategy.select_victims(&snapshot, needed);
        let mut bytes = 0usize;
        for victim in &victims {
            if let Some(meta) = snapshot.entries.iter().find(|m| &m.key == victim) {
                bytes += meta.size_bytes;
            }
            sqlx::query("DELETE FROM cache_entries WHERE key = ?")
                .bind(victim)
                .execute(&self.pool)
                .await
                .map_err(backend)?;
        }

        self.counters.evicted(victims.len() as u64);
        crate::metrics::record_eviction(&self.name, victims.len(), bytes);
        debug!(tier = %self.name, evicted = victims.len(), strategy = self.strategy.name(), "Evicted rows");
        Ok(())
    }
}

#[async_trait]
impl CacheTier for SqlTier {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> Result<Option<CachedValue>, TierError> {
        let now = now_millis();
        let row = sqlx::query("SELECT value_blob, expires_at FROM cache_entries WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;

        let Some(row) = row else {
            self.counters.miss();
            return Ok(None);
        };

        let expires_at: Option<i64> = row.try_get("expires_at").map_err(backend)?;
        if expires_at.is_some_and(|exp| exp <= now) {
            sqlx::query("DELETE FROM cache_entries WHERE key = ? AND expires_at <= ?")
                .bind(key)
                .bind(now)
                .execute(&self.pool)
                .await
                .map_err(backend)?;
            self.counters.miss();
            return Ok(None);
        }

        let blob: Vec<u8> = row.try_get("value_blob").map_err(backend)?;
        let value = match codec::decode(&blob) {
            Ok(value) => value,
            Err(e) => {
                warn!(tier = %self.name, key, error = %e, "Dropping undecodable row");
                self.remove(key).await?;
                self.counters.miss();
                return Err(e.into());
            }
        };

        sqlx::query(
            "UPDATE cache_entries SET last_accessed_at = ?, access_tick = ?, access_count = access_count + 1 \
             WHERE key = ?",
        )
        .bind(now)
        .bind(self.next_tick())
        .bind(key)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        self.counters.hit();
        Ok(Some(value))
    }

    async fn put(&self, key: &str, value: &CachedValue, options: PutOptions) -> Result<(), TierError> {
        if self.max_entries == 0 {
            return Ok(());
        }
        let blob = codec::encode(value, self.compress_threshold)?;
        let now = now_millis();

        let _guard = self.write_lock.lock().await;
        self.make_room(key).await?;

        sqlx::query(
            "INSERT INTO cache_entries \
               (key, value_blob, expires_at, priority, tags, size_bytes, created_at, last_accessed_at, access_tick, access_count) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0) \
             ON CONFLICT(key) DO UPDATE SET \
               value_blob = excluded.value_blob, expires_at = excluded.expires_at, priority = excluded.priority, \
               tags = excluded.tags, size_bytes = excluded.size_bytes, created_at = excluded.created_at, \
               last_accessed_at = excluded.last_accessed_at, access_tick = excluded.access_tick, access_count = 0",
        )
        .bind(key)
        .bind(&blob)
        .bind(options.expires_at(now))
        .bind(options.priority as i64)
        .bind(encode_tags(&options.tags))
        .bind(blob.len() as i64)
        .bind(now)
        .bind(now)
        .bind(self.next_tick())
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), TierError> {
        sqlx::query("DELETE FROM cache_entries WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn remove_by_pattern(&self, pattern: &str) -> Result<u64, TierError> {
        compile_pattern(pattern)?;
        let result = sqlx::query("DELETE FROM cache_entries WHERE key GLOB ?")
            .bind(pattern)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(result.rows_affected())
    }

    async fn remove_by_tag(&self, tag: &str) -> Result<u64, TierError> {
        let result = sqlx::query("DELETE FROM cache_entries WHERE instr(tags, ?) > 0")
            .bind(format!("|{}|", tag))
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(result.rows_affected())
    }

    async fn clear(&self) -> Result<(), TierError> {
        let _guard = self.write_lock.lock().await;
        sqlx::query("DELETE FROM cache_entries")
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        self.counters.reset();
        Ok(())
    }

    async fn stats(&self) -> Result<CacheTierStats, TierError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS total, \
               COALESCE(SUM(CASE WHEN expires_at IS NOT NULL AND expires_at <= ? THEN 1 ELSE 0 END), 0) AS expired, \
               COALESCE(SUM(size_bytes), 0) AS bytes \
             FROM cache_entries",
        )
        .bind(now_millis())
        .fetch_one(&self.pool)
        .await
        .map_err(backend)?;

        let total: i64 = row.try_get("total").map_err(backend)?;
        let expired: i64 = row.try_get("expired").map_err(backend)?;
        let bytes: i64 = row.try_get("bytes").map_err(backend)?;
        Ok(CacheTierStats {
            size_bytes: bytes.max(0) as u64,
            ..self.counters.stats(total.max(0) as u64, expired.max(0) as u64)
        })
    }

    async fn sweep_expired(&self) -> Result<u64, TierError> {
        self.delete_expired(now_millis()).await
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, TierError> {
        compile_pattern(pattern)?;
        let rows = sqlx::query(
            "SELECT key FROM cache_entries \
             WHERE key GLOB ? AND (expires_at IS NULL OR expires_at > ?) ORDER BY key",
        )
        .bind(pattern)
        .bind(now_millis())
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.iter()
            .map(|r| r.try_get::<String, _>("key").map_err(backend))
            .collect()
    }

    async fn close(&self) -> Result<(), TierError> {
        self.pool.close().await;
        Ok(())
    }
}
