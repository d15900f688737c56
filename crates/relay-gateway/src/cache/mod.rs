//! Tiered key/value cache shared by every gateway component.
//!
//! Plain string reads consult a process-local `moka` tier first and fall back
//! to the [`SharedStore`], backfilling the local tier on a hit. Writes go to
//! both tiers. Counters, locks and sets only live in the shared tier: they are
//! the values several workers race on, so the local tier never answers for
//! them.
//!
//! The two tiers are eventually consistent. A local entry lives at most
//! `local_ttl_ms` and never longer than the TTL it was written with.

pub mod error;
pub mod redis;
pub mod store;

use std::{
    collections::HashSet,
    sync::Arc,
    time::Duration,
};

use moka::sync::Cache;
use serde::{
    Deserialize,
    Serialize,
    de::DeserializeOwned,
};
use tokio::time::Instant;

pub use error::CacheError;
pub use store::{
    MemoryStore,
    SharedStore,
    SharedStoreHandle,
};

/// Configuration for the local cache tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of entries held in the local tier.
    #[serde(default = "default_max_local_entries")]
    pub max_local_entries: u64,
    /// Upper bound on how long the local tier serves a value without asking
    /// the shared tier again (milliseconds).
    #[serde(default = "default_local_ttl_ms")]
    pub local_ttl_ms: u64,
}

const fn default_max_local_entries() -> u64 {
    50_000
}

const fn default_local_ttl_ms() -> u64 {
    5_000
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_local_entries: default_max_local_entries(),
            local_ttl_ms: default_local_ttl_ms(),
        }
    }
}

#[derive(Debug, Clone)]
struct LocalEntry {
    value: Arc<str>,
    expires_at: Instant,
}

#[derive(Clone, Debug)]
pub struct TieredCache {
    local: Cache<String, LocalEntry>,
    shared: SharedStoreHandle,
    local_ttl: Duration,
}

impl TieredCache {
    pub fn new(shared: SharedStoreHandle, config: &CacheConfig) -> Self {
        let local_ttl = Duration::from_millis(config.local_ttl_ms.max(1));
        Self {
            local: Cache::builder()
                .max_capacity(config.max_local_entries)
                .time_to_live(local_ttl)
                .build(),
            shared,
            local_ttl,
        }
    }

    /// A cache over a fresh [`MemoryStore`] with default settings.
    pub fn in_memory() -> Self {
        Self::new(MemoryStore::shared(), &CacheConfig::default())
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let now = Instant::now();
        if let Some(entry) = self.local.get(key) {
            if entry.expires_at > now {
                return Ok(Some(entry.value.to_string()));
            }
            self.local.invalidate(key);
        }

        let value = self.shared.get(key).await?;
        if let Some(value) = &value {
            self.put_local(key, value, self.local_ttl);
        }
        Ok(value)
    }

    pub async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        self.put_local(key, value, ttl);
        self.shared.set(key, value, ttl).await
    }

    /// Best-effort lock acquisition: writes only when the key is absent in the
    /// shared tier.
    pub async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, CacheError> {
        self.shared.set_nx(key, value, ttl).await
    }

    pub async fn incr(&self, key: &str) -> Result<i64, CacheError> {
        self.local.invalidate(key);
        self.shared.incr(key).await
    }

    /// Increments a counter and arms its TTL when the increment created it.
    pub async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> Result<i64, CacheError> {
        let value = self.incr(key).await?;
        if value == 1 {
            self.shared.expire(key, ttl).await?;
        }
        Ok(value)
    }

    /// Reads a counter straight from the shared tier.
    pub async fn counter(&self, key: &str) -> Result<i64, CacheError> {
        match self.shared.get(key).await? {
            Some(raw) => raw
                .parse::<i64>()
                .map_err(|_| CacheError::NotAnInteger(key.to_string())),
            None => Ok(0),
        }
    }

    pub async fn expire(&self, key: &str, ttl: Duration) -> Result<(), CacheError> {
        self.shared.expire(key, ttl).await
    }

    pub async fn sadd(&self, key: &str, members: &[String]) -> Result<(), CacheError> {
        self.shared.sadd(key, members).await
    }

    pub async fn smembers(&self, key: &str) -> Result<HashSet<String>, CacheError> {
        self.shared.smembers(key).await
    }

    pub async fn del(&self, keys: &[String]) -> Result<(), CacheError> {
        for key in keys {
            self.local.invalidate(key);
        }
        self.shared.del(keys).await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
        match self.get(key).await? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|source| CacheError::Decode {
                    key: key.to_string(),
                    source,
                }),
            None => Ok(None),
        }
    }

    pub async fn set_json<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let raw = serde_json::to_string(value).map_err(|source| CacheError::Encode {
            key: key.to_string(),
            source,
        })?;
        self.set(key, &raw, ttl).await
    }

    fn put_local(&self, key: &str, value: &str, ttl: Duration) {
        let ttl = ttl.min(self.local_ttl);
        self.local.insert(
            key.to_string(),
            LocalEntry {
                value: Arc::from(value),
                expires_at: Instant::now() + ttl,
            },
        );
    }
}
