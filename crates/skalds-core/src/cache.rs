//! Cache adapter: typed operations on the shared cache.
//!
//! Executors write registration hashes, heartbeats, and error strings to
//! the cache; the controller only reads them (and deletes on eviction).
//! The adapter keeps "missing" (`Ok(None)` / empty) strictly separate
//! from transport errors so monitor cycles can skip on transient
//! failures.
//!
//! Two backends are provided:
//!
//! - [`RedisCacheBackend`]: production backend over an async connection
//!   manager that reconnects transparently
//! - [`MemoryCacheBackend`]: in-process backend honoring TTLs against an
//!   injected clock, for tests and local composition

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Result};

/// Cache key layout.
///
/// Authoritative contract with the executor fleet: executors write these
/// keys, the controller reads them.
pub mod keys {
    use crate::id::{SkaldId, TaskId};

    /// Fleet registry hash: field = skald id, value = last-active millis.
    pub const SKALD_REGISTRY_HASH: &str = "skalds:hash";
    /// Mode hash: field = skald id, value = kind (`node` / `edge`).
    pub const SKALD_MODE_HASH: &str = "skalds:mode:hash";

    /// Per-skald heartbeat counter (string, integer).
    #[must_use]
    pub fn skald_heartbeat(id: &SkaldId) -> String {
        format!("skalds:{id}:heartbeat")
    }

    /// Per-skald list of supported task class names.
    #[must_use]
    pub fn skald_allowed_classes(id: &SkaldId) -> String {
        format!("skalds:{id}:allow-task-class-name")
    }

    /// Per-skald list of task ids the executor claims to run.
    #[must_use]
    pub fn skald_all_tasks(id: &SkaldId) -> String {
        format!("skalds:{id}:all-task")
    }

    /// Per-task heartbeat counter (string, integer).
    #[must_use]
    pub fn task_heartbeat(id: &TaskId) -> String {
        format!("task:{id}:heartbeat")
    }

    /// Per-task error string (empty = none).
    #[must_use]
    pub fn task_error(id: &TaskId) -> String {
        format!("task:{id}:has-error")
    }

    /// Per-task exception string (empty = none).
    #[must_use]
    pub fn task_exception(id: &TaskId) -> String {
        format!("task:{id}:exception")
    }
}

/// Typed operations on the shared cache.
///
/// All operations return "missing" distinctly from "error": a missing key
/// is `Ok(None)` (or an empty collection), never an `Err`.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Sets a string value with an optional time-to-live.
    async fn set_string(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Gets a string value.
    async fn get_string(&self, key: &str) -> Result<Option<String>>;

    /// Sets a hash field with an optional per-field time-to-live.
    async fn set_hash_field(
        &self,
        key: &str,
        field: &str,
        value: &str,
        field_ttl: Option<Duration>,
    ) -> Result<()>;

    /// Gets a single hash field.
    async fn get_hash_field(&self, key: &str, field: &str) -> Result<Option<String>>;

    /// Gets all fields and values of a hash.
    async fn get_all_hash_fields(&self, key: &str) -> Result<HashMap<String, String>>;

    /// Deletes a key.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Appends a value to a list, refreshing the list TTL when given.
    async fn push_list(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Reads a list range (inclusive indices, negative from the tail).
    async fn read_list(&self, key: &str, start: i64, end: i64) -> Result<Vec<String>>;

    /// Verifies the backend is reachable.
    async fn ping(&self) -> Result<()>;
}

// ============================================================================
// Redis backend
// ============================================================================

/// Default per-operation deadline for cache calls.
pub const DEFAULT_CACHE_OP_TIMEOUT: Duration = Duration::from_secs(1);

/// Production cache backend over Redis.
///
/// Uses a [`ConnectionManager`] so reconnection is transparent; callers
/// see transient errors as retriable. Every operation is bounded by a
/// per-op deadline and retried once with a short backoff.
#[derive(Clone)]
pub struct RedisCacheBackend {
    conn: ConnectionManager,
    op_timeout: Duration,
}

impl std::fmt::Debug for RedisCacheBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCacheBackend")
            .field("op_timeout", &self.op_timeout)
            .finish_non_exhaustive()
    }
}

impl RedisCacheBackend {
    /// Connects to Redis at the given URL (e.g. `redis://localhost:6379`).
    ///
    /// # Errors
    ///
    /// Returns an error if the initial connection cannot be established;
    /// startup treats this as fatal.
    pub async fn connect(url: &str, op_timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| Error::cache_with_source(format!("invalid redis url {url}"), e))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| Error::cache_with_source(format!("failed to connect to redis {url}"), e))?;
        Ok(Self { conn, op_timeout })
    }

    async fn with_retry<T, F, Fut>(&self, operation: &'static str, run: F) -> Result<T>
    where
        F: Fn(ConnectionManager) -> Fut,
        Fut: Future<Output = redis::RedisResult<T>>,
        T: Send,
    {
        let mut backoff = Duration::from_millis(50);
        let mut last_err = Error::DeadlineExceeded { operation };
        for attempt in 0..2 {
            if attempt > 0 {
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
            match tokio::time::timeout(self.op_timeout, run(self.conn.clone())).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(err)) => {
                    tracing::debug!(operation, attempt, error = %err, "cache operation failed");
                    last_err = Error::cache_with_source(format!("{operation} failed"), err);
                }
                Err(_) => {
                    tracing::debug!(operation, attempt, "cache operation timed out");
                    last_err = Error::DeadlineExceeded { operation };
                }
            }
        }
        Err(last_err)
    }
}

#[async_trait]
impl CacheBackend for RedisCacheBackend {
    async fn set_string(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.with_retry("set_string", |mut conn| async move {
            match ttl {
                Some(ttl) => conn.set_ex(key, value, ttl.as_secs().max(1)).await,
                None => conn.set(key, value).await,
            }
        })
        .await
    }

    async fn get_string(&self, key: &str) -> Result<Option<String>> {
        self.with_retry("get_string", |mut conn| async move { conn.get(key).await })
            .await
    }

    async fn set_hash_field(
        &self,
        key: &str,
        field: &str,
        value: &str,
        field_ttl: Option<Duration>,
    ) -> Result<()> {
        self.with_retry("set_hash_field", |mut conn| async move {
            let () = conn.hset(key, field, value).await?;
            if let Some(ttl) = field_ttl {
                // Per-field TTL (HEXPIRE, Redis >= 7.4); required for the
                // fleet registry hash.
                let () = redis::cmd("HEXPIRE")
                    .arg(key)
                    .arg(ttl.as_secs().max(1))
                    .arg("FIELDS")
                    .arg(1)
                    .arg(field)
                    .query_async(&mut conn)
                    .await?;
            }
            Ok(())
        })
        .await
    }

    async fn get_hash_field(&self, key: &str, field: &str) -> Result<Option<String>> {
        self.with_retry("get_hash_field", |mut conn| async move {
            conn.hget(key, field).await
        })
        .await
    }

    async fn get_all_hash_fields(&self, key: &str) -> Result<HashMap<String, String>> {
        self.with_retry("get_all_hash_fields", |mut conn| async move {
            conn.hgetall(key).await
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.with_retry("delete", |mut conn| async move { conn.del(key).await })
            .await
    }

    async fn push_list(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.with_retry("push_list", |mut conn| async move {
            let () = conn.rpush(key, value).await?;
            if let Some(ttl) = ttl {
                let () = conn.expire(key, ttl.as_secs().max(1) as i64).await?;
            }
            Ok(())
        })
        .await
    }

    async fn read_list(&self, key: &str, start: i64, end: i64) -> Result<Vec<String>> {
        self.with_retry("read_list", |mut conn| async move {
            conn.lrange(key, start as isize, end as isize).await
        })
        .await
    }

    async fn ping(&self) -> Result<()> {
        self.with_retry("ping", |mut conn| async move {
            redis::cmd("PING").query_async::<()>(&mut conn).await
        })
        .await
    }
}

// ============================================================================
// In-memory backend
// ============================================================================

#[derive(Debug, Clone)]
enum Entry {
    String {
        value: String,
        expires_at: Option<DateTime<Utc>>,
    },
    Hash {
        fields: HashMap<String, (String, Option<DateTime<Utc>>)>,
    },
    List {
        items: Vec<String>,
        expires_at: Option<DateTime<Utc>>,
    },
}

/// In-process cache backend for tests and local composition.
///
/// TTLs are honored against the injected clock, so tests can expire keys
/// deterministically.
pub struct MemoryCacheBackend {
    entries: Mutex<HashMap<String, Entry>>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for MemoryCacheBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCacheBackend").finish_non_exhaustive()
    }
}

impl Default for MemoryCacheBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCacheBackend {
    /// Creates a backend on the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Creates a backend on an explicit clock.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    fn expiry(&self, ttl: Option<Duration>) -> Option<DateTime<Utc>> {
        ttl.map(|ttl| {
            self.clock.now() + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX)
        })
    }

    fn is_expired(&self, expires_at: Option<DateTime<Utc>>) -> bool {
        expires_at.is_some_and(|at| self.clock.now() >= at)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().expect("cache lock poisoned")
    }
}

#[async_trait]
impl CacheBackend for MemoryCacheBackend {
    async fn set_string(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let expires_at = self.expiry(ttl);
        self.lock().insert(
            key.to_string(),
            Entry::String {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn get_string(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.lock();
        match entries.get(key) {
            Some(Entry::String { value, expires_at }) => {
                if self.is_expired(*expires_at) {
                    entries.remove(key);
                    Ok(None)
                } else {
                    Ok(Some(value.clone()))
                }
            }
            _ => Ok(None),
        }
    }

    async fn set_hash_field(
        &self,
        key: &str,
        field: &str,
        value: &str,
        field_ttl: Option<Duration>,
    ) -> Result<()> {
        let expires_at = self.expiry(field_ttl);
        let mut entries = self.lock();
        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::Hash {
                fields: HashMap::new(),
            });
        if let Entry::Hash { fields } = entry {
            fields.insert(field.to_string(), (value.to_string(), expires_at));
        }
        Ok(())
    }

    async fn get_hash_field(&self, key: &str, field: &str) -> Result<Option<String>> {
        let entries = self.lock();
        if let Some(Entry::Hash { fields }) = entries.get(key) {
            if let Some((value, expires_at)) = fields.get(field) {
                if !self.is_expired(*expires_at) {
                    return Ok(Some(value.clone()));
                }
            }
        }
        Ok(None)
    }

    async fn get_all_hash_fields(&self, key: &str) -> Result<HashMap<String, String>> {
        let entries = self.lock();
        let mut out = HashMap::new();
        if let Some(Entry::Hash { fields }) = entries.get(key) {
            for (field, (value, expires_at)) in fields {
                if !self.is_expired(*expires_at) {
                    out.insert(field.clone(), value.clone());
                }
            }
        }
        Ok(out)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.lock().remove(key);
        Ok(())
    }

    async fn push_list(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let expires_at = self.expiry(ttl);
        let mut entries = self.lock();
        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::List {
                items: Vec::new(),
                expires_at,
            });
        if let Entry::List {
            items,
            expires_at: stored,
        } = entry
        {
            items.push(value.to_string());
            if expires_at.is_some() {
                *stored = expires_at;
            }
        }
        Ok(())
    }

    async fn read_list(&self, key: &str, start: i64, end: i64) -> Result<Vec<String>> {
        let mut entries = self.lock();
        match entries.get(key) {
            Some(Entry::List { items, expires_at }) => {
                if self.is_expired(*expires_at) {
                    entries.remove(key);
                    return Ok(Vec::new());
                }
                let len = items.len() as i64;
                let resolve = |index: i64| -> i64 {
                    if index < 0 { len + index } else { index }
                };
                let from = resolve(start).max(0);
                let to = resolve(end).min(len - 1);
                if from > to || len == 0 {
                    return Ok(Vec::new());
                }
                Ok(items[from as usize..=to as usize].to_vec())
            }
            _ => Ok(Vec::new()),
        }
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::id::{SkaldId, TaskId};

    fn manual_cache() -> (Arc<ManualClock>, MemoryCacheBackend) {
        let clock = Arc::new(ManualClock::new(
            DateTime::from_timestamp_millis(1_700_000_000_000).unwrap(),
        ));
        let cache = MemoryCacheBackend::with_clock(clock.clone());
        (clock, cache)
    }

    #[test]
    fn key_layout() {
        let skald = SkaldId::new("s1").unwrap();
        let task = TaskId::new("t1").unwrap();
        assert_eq!(keys::SKALD_REGISTRY_HASH, "skalds:hash");
        assert_eq!(keys::SKALD_MODE_HASH, "skalds:mode:hash");
        assert_eq!(keys::skald_heartbeat(&skald), "skalds:s1:heartbeat");
        assert_eq!(
            keys::skald_allowed_classes(&skald),
            "skalds:s1:allow-task-class-name"
        );
        assert_eq!(keys::skald_all_tasks(&skald), "skalds:s1:all-task");
        assert_eq!(keys::task_heartbeat(&task), "task:t1:heartbeat");
        assert_eq!(keys::task_error(&task), "task:t1:has-error");
        assert_eq!(keys::task_exception(&task), "task:t1:exception");
    }

    #[tokio::test]
    async fn string_ttl_expires_with_clock() {
        let (clock, cache) = manual_cache();
        cache
            .set_string("k", "v", Some(Duration::from_secs(10)))
            .await
            .unwrap();
        assert_eq!(cache.get_string("k").await.unwrap().as_deref(), Some("v"));

        clock.advance(chrono::Duration::seconds(11));
        assert_eq!(cache.get_string("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn missing_is_none_not_error() {
        let (_, cache) = manual_cache();
        assert_eq!(cache.get_string("absent").await.unwrap(), None);
        assert_eq!(cache.get_hash_field("absent", "f").await.unwrap(), None);
        assert!(cache.get_all_hash_fields("absent").await.unwrap().is_empty());
        assert!(cache.read_list("absent", 0, -1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn hash_fields_expire_independently() {
        let (clock, cache) = manual_cache();
        cache
            .set_hash_field("h", "fresh", "1", Some(Duration::from_secs(60)))
            .await
            .unwrap();
        cache
            .set_hash_field("h", "brief", "2", Some(Duration::from_secs(5)))
            .await
            .unwrap();

        clock.advance(chrono::Duration::seconds(10));
        let fields = cache.get_all_hash_fields("h").await.unwrap();
        assert_eq!(fields.len(), 1);
        assert_eq!(fields.get("fresh").map(String::as_str), Some("1"));
        assert_eq!(cache.get_hash_field("h", "brief").await.unwrap(), None);
    }

    #[tokio::test]
    async fn list_range_semantics() {
        let (_, cache) = manual_cache();
        for value in ["a", "b", "c"] {
            cache.push_list("l", value, None).await.unwrap();
        }
        assert_eq!(
            cache.read_list("l", 0, -1).await.unwrap(),
            vec!["a", "b", "c"]
        );
        assert_eq!(cache.read_list("l", 1, 1).await.unwrap(), vec!["b"]);
        assert!(cache.read_list("l", 5, 9).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_removes_key() {
        let (_, cache) = manual_cache();
        cache.set_string("k", "v", None).await.unwrap();
        cache.delete("k").await.unwrap();
        assert_eq!(cache.get_string("k").await.unwrap(), None);
    }
}
