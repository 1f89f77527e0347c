use std::{
    path::Path,
    sync::Arc,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use moka::{Expiry, future::Cache};
use rusqlite::{Connection, OptionalExtension, params};
use thiserror::Error;
use tokio::{sync::Mutex as AsyncMutex, task};
use tracing::{debug, info, warn};

/// Fast, ephemeral tier. Implementations may drop entries at any time.
#[async_trait]
pub trait EdgeCache: Send + Sync {
    async fn lookup(&self, key: &str) -> Result<Option<Bytes>>;
    async fn insert(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()>;
    async fn remove(&self, key: &str) -> Result<()>;
}

/// Durable key/value tier. `ttl = None` means the entry never expires.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;
    async fn put(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("durable store unavailable: {0}")]
    Unavailable(String),
    #[error("no durable store configured")]
    NoDurableTier,
}

/// How far a `put` should reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Durability {
    Ephemeral,
    Durable { ttl: Option<Duration> },
}

/// Two-tier cache-aside store presenting a single key/value interface.
///
/// The edge tier is best-effort: its failures are logged and read as misses.
/// Durable-tier failures surface as [`StoreError::Unavailable`].
#[derive(Clone)]
pub struct CacheStore {
    edge: Arc<dyn EdgeCache>,
    durable: Option<Arc<dyn KvStore>>,
}

impl CacheStore {
    pub fn new(edge: Arc<dyn EdgeCache>, durable: Option<Arc<dyn KvStore>>) -> Self {
        Self { edge, durable }
    }

    pub fn has_durable_tier(&self) -> bool {
        self.durable.is_some()
    }

    /// Read `key`, consulting the durable tier on an edge miss only when
    /// `refill` is given. A durable hit is copied back into the edge tier
    /// for `refill`.
    pub async fn get(&self, key: &str, refill: Option<Duration>) -> Result<Option<Bytes>, StoreError> {
        match self.edge.lookup(key).await {
            Ok(Some(value)) => return Ok(Some(value)),
            Ok(None) => {}
            Err(err) => warn!(key = %key, error = %err, "Edge cache lookup failed; treating as miss"),
        }

        let Some(refill_ttl) = refill else {
            return Ok(None);
        };
        let Some(durable) = self.durable.as_ref() else {
            return Ok(None);
        };

        let value = durable
            .get(key)
            .await
            .map_err(|err| StoreError::Unavailable(format!("{err:#}")))?;

        if let Some(value) = &value {
            if let Err(err) = self
                .edge
                .insert(key, value.clone(), clamp_ttl(refill_ttl))
                .await
            {
                warn!(key = %key, error = %err, "Failed to repopulate edge cache");
            }
        }
        Ok(value)
    }

    pub async fn put(
        &self,
        key: &str,
        value: Bytes,
        ttl: Duration,
        durability: Durability,
    ) -> Result<(), StoreError> {
        if let Err(err) = self.edge.insert(key, value.clone(), clamp_ttl(ttl)).await {
            warn!(key = %key, error = %err, "Edge cache write failed");
        }

        if let Durability::Durable { ttl } = durability {
            let durable = self.durable.as_ref().ok_or(StoreError::NoDurableTier)?;
            durable
                .put(key, value, ttl.map(clamp_ttl))
                .await
                .map_err(|err| StoreError::Unavailable(format!("{err:#}")))?;
        }
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> Result<(), StoreError> {
        if let Err(err) = self.edge.remove(key).await {
            warn!(key = %key, error = %err, "Edge cache delete failed");
        }
        if let Some(durable) = self.durable.as_ref() {
            durable
                .delete(key)
                .await
                .map_err(|err| StoreError::Unavailable(format!("{err:#}")))?;
        }
        Ok(())
    }
}

/// Longest TTL any tier will honour.
pub const MAX_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

fn clamp_ttl(ttl: Duration) -> Duration {
    ttl.clamp(Duration::from_secs(1), MAX_TTL)
}

#[derive(Clone)]
struct EdgeEntry {
    value: Bytes,
    ttl: Duration,
}

/// Expires each edge entry after its own TTL rather than a cache-wide one.
struct PerEntryTtl;

impl Expiry<String, EdgeEntry> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        entry: &EdgeEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(entry.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        entry: &EdgeEntry,
        _updated_at: Instant,
        _remaining: Option<Duration>,
    ) -> Option<Duration> {
        Some(entry.ttl)
    }
}

/// In-process edge tier with per-entry expiry and a bounded entry count.
pub struct MemoryEdgeCache {
    entries: Cache<String, EdgeEntry>,
}

impl MemoryEdgeCache {
    pub fn new(capacity: usize) -> Self {
        let entries = Cache::builder()
            .max_capacity(capacity.max(1) as u64)
            .expire_after(PerEntryTtl)
            .build();
        Self { entries }
    }

    /// Entry count after pending evictions have been applied.
    pub async fn entry_count(&self) -> u64 {
        self.entries.run_pending_tasks().await;
        self.entries.entry_count()
    }
}

#[async_trait]
impl EdgeCache for MemoryEdgeCache {
    async fn lookup(&self, key: &str) -> Result<Option<Bytes>> {
        Ok(self.entries.get(key).await.map(|entry| entry.value))
    }

    async fn insert(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()> {
        let entry = EdgeEntry {
            value,
            ttl: clamp_ttl(ttl),
        };
        self.entries.insert(key.to_string(), entry).await;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.entries.invalidate(key).await;
        Ok(())
    }
}

/// Durable tier backed by a single SQLite table.
pub struct SqliteKvStore {
    conn: Arc<AsyncMutex<Connection>>,
}

impl SqliteKvStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create store directory {}", parent.display())
                })?;
            }
        }

        let connection = Connection::open(path)
            .with_context(|| format!("Failed to open durable store at {}", path.display()))?;
        let store = Self::from_connection(connection)?;
        info!(path = %path.display(), "Opened durable key/value store");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let connection =
            Connection::open_in_memory().context("Failed to open in-memory durable store")?;
        Self::from_connection(connection)
    }

    fn from_connection(connection: Connection) -> Result<Self> {
        connection.execute(
            "CREATE TABLE IF NOT EXISTS kv_store (
                store_key TEXT PRIMARY KEY,
                expires_at INTEGER,
                value BLOB NOT NULL
            )",
            [],
        )?;
        connection.execute(
            "CREATE INDEX IF NOT EXISTS idx_kv_store_expiry ON kv_store(expires_at)",
            [],
        )?;
        let purged = connection.execute(
            "DELETE FROM kv_store WHERE expires_at IS NOT NULL AND expires_at <= ?1",
            params![current_epoch()],
        )?;
        if purged > 0 {
            debug!(purged, "Purged expired durable entries");
        }

        Ok(Self {
            conn: Arc::new(AsyncMutex::new(connection)),
        })
    }
}

#[async_trait]
impl KvStore for SqliteKvStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let key = key.to_string();
        let conn = self.conn.clone();
        task::spawn_blocking(move || -> Result<Option<Bytes>> {
            let conn = conn.blocking_lock();
            let row: Option<(Vec<u8>, Option<i64>)> = conn
                .query_row(
                    "SELECT value, expires_at FROM kv_store WHERE store_key = ?1",
                    params![key.as_str()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            match row {
                Some((_, Some(expires_at))) if expires_at <= current_epoch() => {
                    conn.execute(
                        "DELETE FROM kv_store WHERE store_key = ?1",
                        params![key.as_str()],
                    )?;
                    Ok(None)
                }
                Some((value, _)) => Ok(Some(Bytes::from(value))),
                None => Ok(None),
            }
        })
        .await
        .context("Durable store lookup task failed")?
    }

    async fn put(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<()> {
        let key = key.to_string();
        let expires_at = ttl.map(|ttl| {
            let seconds = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
            current_epoch().saturating_add(seconds)
        });
        let conn = self.conn.clone();
        task::spawn_blocking(move || -> Result<()> {
            let conn = conn.blocking_lock();
            conn.execute(
                "INSERT INTO kv_store (store_key, expires_at, value)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(store_key) DO UPDATE SET
                    expires_at = excluded.expires_at,
                    value = excluded.value",
                params![key, expires_at, &value[..]],
            )?;
            Ok(())
        })
        .await
        .context("Durable store write task failed")?
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let key = key.to_string();
        let conn = self.conn.clone();
        task::spawn_blocking(move || -> Result<()> {
            let conn = conn.blocking_lock();
            conn.execute("DELETE FROM kv_store WHERE store_key = ?1", params![key])?;
            Ok(())
        })
        .await
        .context("Durable store delete task failed")?
    }
}

fn current_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs() as i64
}
