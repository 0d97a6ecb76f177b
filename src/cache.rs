use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

/// Durable key/value store reached through an injected handle (SQLite, Redis, ...).
///
/// The engine never persists state on its own; anything that should survive a
/// process restart goes through an implementation of this trait.
#[async_trait]
pub trait KeyValueCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: String) -> Result<()>;
}

/// Process-local cache, used in tests and when no durable cache is injected.
#[derive(Debug, Default)]
pub struct InMemoryCache {
    entries: DashMap<String, String>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl KeyValueCache for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        match self.entries.get(key) {
            Some(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(value.clone()))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }
}

/// Returns the cached value for `key`, or runs `op` and stores its result.
///
/// Cache failures never fail the operation: an unreadable or undecodable entry is
/// treated as a miss, and a failed write is only logged. Errors from `op` are
/// returned as-is and nothing is cached.
pub async fn cache_aside<T, E, F, Fut>(cache: &dyn KeyValueCache, key: &str, op: F) -> Result<T, E>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    match cache.get(key).await {
        Ok(Some(raw)) => match serde_json::from_str(&raw) {
            Ok(value) => {
                debug!("cache hit for {}", key);
                return Ok(value);
            }
            Err(e) => warn!("discarding undecodable cache entry {}: {}", key, e),
        },
        Ok(None) => debug!("cache miss for {}", key),
        Err(e) => warn!("cache read for {} failed: {}", key, e),
    }

    let value = op().await?;
    match serde_json::to_string(&value) {
        Ok(raw) => {
            if let Err(e) = cache.set(key, raw).await {
                warn!("cache write for {} failed: {}", key, e);
            }
        }
        Err(e) => warn!("could not serialize cache entry {}: {}", key, e),
    }
    Ok(value)
}
