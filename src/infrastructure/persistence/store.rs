//! Shared key-value store contract and the in-process implementation

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

use crate::domain::GatewayError;

#[derive(Error, Debug)]
pub enum StoreError {
    #[cfg(feature = "redis-store")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Value error: {0}")]
    Value(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl From<StoreError> for GatewayError {
    fn from(e: StoreError) -> Self {
        GatewayError::Store(e.to_string())
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Hash-per-key store with per-key TTL, shared by every gateway instance.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Write all fields; `ttl` replaces the key's expiry when given.
    async fn hset_all(
        &self,
        key: &str,
        fields: &[(String, String)],
        ttl: Option<Duration>,
    ) -> StoreResult<()>;

    /// Set a field only if it does not exist yet.
    async fn hset_nx(&self, key: &str, field: &str, value: &str) -> StoreResult<bool>;

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>>;

    /// Empty map when the key is absent.
    async fn hget_all(&self, key: &str) -> StoreResult<HashMap<String, String>>;

    /// Pipelined `hget_all`, one map per key in request order.
    async fn hget_all_many(&self, keys: &[String]) -> StoreResult<Vec<HashMap<String, String>>>;

    /// Atomic increment of a field on an existing key; returns the new
    /// value, or `None` without creating anything when the key is absent.
    async fn hincr_existing(&self, key: &str, field: &str, delta: i64) -> StoreResult<Option<i64>>;

    async fn del(&self, keys: &[String]) -> StoreResult<()>;

    /// All keys matching a glob `pattern`, fetched `batch` at a time.
    async fn scan(&self, pattern: &str, batch: usize) -> StoreResult<Vec<String>>;
}

#[derive(Debug, Clone)]
struct Entry {
    fields: HashMap<String, String>,
    deadline: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.deadline.map(|d| now < d).unwrap_or(true)
    }
}

/// In-process store for single-instance deployments and tests.
///
/// Clones share the same map, so two routers over clones of one
/// `MemoryStore` behave like two instances over one Redis.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: std::sync::Arc<DashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| e.is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn live_fields(&self, key: &str) -> Option<HashMap<String, String>> {
        let now = Instant::now();
        let expired = match self.entries.get(key) {
            Some(entry) if entry.is_live(now) => return Some(entry.fields.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove_if(key, |_, e| !e.is_live(now));
        }
        None
    }

    /// Entry for writing, dropping it first if it already expired.
    fn entry_mut(&self, key: &str) -> dashmap::mapref::one::RefMut<'_, String, Entry> {
        let now = Instant::now();
        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            fields: HashMap::new(),
            deadline: None,
        });
        if !entry.is_live(now) {
            entry.fields.clear();
            entry.deadline = None;
        }
        entry
    }
}

/// Glob match supporting `*` and `?`.
fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((sp, st)) = star {
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn hset_all(
        &self,
        key: &str,
        fields: &[(String, String)],
        ttl: Option<Duration>,
    ) -> StoreResult<()> {
        let mut entry = self.entry_mut(key);
        for (field, value) in fields {
            entry.fields.insert(field.clone(), value.clone());
        }
        if let Some(ttl) = ttl {
            entry.deadline = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn hset_nx(&self, key: &str, field: &str, value: &str) -> StoreResult<bool> {
        let mut entry = self.entry_mut(key);
        if entry.fields.contains_key(field) {
            return Ok(false);
        }
        entry.fields.insert(field.to_string(), value.to_string());
        Ok(true)
    }

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        Ok(self.live_fields(key).and_then(|f| f.get(field).cloned()))
    }

    async fn hget_all(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        Ok(self.live_fields(key).unwrap_or_default())
    }

    async fn hget_all_many(&self, keys: &[String]) -> StoreResult<Vec<HashMap<String, String>>> {
        Ok(keys
            .iter()
            .map(|k| self.live_fields(k).unwrap_or_default())
            .collect())
    }

    async fn hincr_existing(&self, key: &str, field: &str, delta: i64) -> StoreResult<Option<i64>> {
        let now = Instant::now();
        let Some(mut entry) = self.entries.get_mut(key).filter(|e| e.is_live(now)) else {
            return Ok(None);
        };
        let current = match entry.fields.get(field) {
            Some(v) => v
                .parse::<i64>()
                .map_err(|_| StoreError::Value(format!("{} {} is not an integer", key, field)))?,
            None => 0,
        };
        let next = current + delta;
        entry.fields.insert(field.to_string(), next.to_string());
        Ok(Some(next))
    }

    async fn del(&self, keys: &[String]) -> StoreResult<()> {
        for key in keys {
            self.entries.remove(key);
        }
        Ok(())
    }

    async fn scan(&self, pattern: &str, _batch: usize) -> StoreResult<Vec<String>> {
        let now = Instant::now();
        Ok(self
            .entries
            .iter()
            .filter(|e| e.is_live(now) && glob_match(pattern, e.key()))
            .map(|e| e.key().clone())
            .collect())
    }
}
