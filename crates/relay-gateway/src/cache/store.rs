use std::{
    collections::HashSet,
    fmt::Debug,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;

use super::error::CacheError;

/// The store every gateway worker shares.
///
/// Implementations must make `incr` and the set operations atomic: several
/// workers race to bump counters and to evict the same node, and an eviction
/// must never be lost to a concurrent overwrite.
#[async_trait]
pub trait SharedStore: Debug + Send + Sync {
    /// Reads a plain string value stored at `key`.
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;
    /// Writes a plain string value that expires after `ttl`.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;
    /// Writes `value` only when `key` is absent. Returns whether the write happened.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, CacheError>;
    /// Increments the integer at `key`, creating it at zero first.
    async fn incr(&self, key: &str) -> Result<i64, CacheError>;
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), CacheError>;
    async fn sadd(&self, key: &str, members: &[String]) -> Result<(), CacheError>;
    async fn smembers(&self, key: &str) -> Result<HashSet<String>, CacheError>;
    async fn del(&self, keys: &[String]) -> Result<(), CacheError>;
}

pub type SharedStoreHandle = Arc<dyn SharedStore>;

#[derive(Debug, Clone)]
enum MemoryValue {
    String(String),
    Set(HashSet<String>),
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: MemoryValue,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// Single-process store with redis-like semantics.
///
/// Used by tests and by deployments running a single gateway worker.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, MemoryEntry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedStoreHandle {
        Arc::new(Self::new())
    }

    fn purge_if_expired(&self, key: &str, now: Instant) {
        self.entries.remove_if(key, |_, entry| !entry.is_live(now));
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let now = Instant::now();
        self.purge_if_expired(key, now);
        match self.entries.get(key) {
            Some(entry) => match &entry.value {
                MemoryValue::String(value) => Ok(Some(value.clone())),
                MemoryValue::Set(_) => Err(CacheError::WrongType(key.to_string())),
            },
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        self.entries.insert(
            key.to_string(),
            MemoryEntry {
                value: MemoryValue::String(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, CacheError> {
        let now = Instant::now();
        self.purge_if_expired(key, now);
        let mut written = false;
        self.entries.entry(key.to_string()).or_insert_with(|| {
            written = true;
            MemoryEntry {
                value: MemoryValue::String(value.to_string()),
                expires_at: Some(now + ttl),
            }
        });
        Ok(written)
    }

    async fn incr(&self, key: &str) -> Result<i64, CacheError> {
        let now = Instant::now();
        self.purge_if_expired(key, now);
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| MemoryEntry {
                value: MemoryValue::String("0".to_string()),
                expires_at: None,
            });
        let current = match &entry.value {
            MemoryValue::String(value) => value
                .parse::<i64>()
                .map_err(|_| CacheError::NotAnInteger(key.to_string()))?,
            MemoryValue::Set(_) => return Err(CacheError::WrongType(key.to_string())),
        };
        let next = current + 1;
        entry.value = MemoryValue::String(next.to_string());
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), CacheError> {
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn sadd(&self, key: &str, members: &[String]) -> Result<(), CacheError> {
        let now = Instant::now();
        self.purge_if_expired(key, now);
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| MemoryEntry {
                value: MemoryValue::Set(HashSet::new()),
                expires_at: None,
            });
        match &mut entry.value {
            MemoryValue::Set(set) => {
                set.extend(members.iter().cloned());
                Ok(())
            }
            MemoryValue::String(_) => Err(CacheError::WrongType(key.to_string())),
        }
    }

    async fn smembers(&self, key: &str) -> Result<HashSet<String>, CacheError> {
        let now = Instant::now();
        self.purge_if_expired(key, now);
        match self.entries.get(key) {
            Some(entry) => match &entry.value {
                MemoryValue::Set(set) => Ok(set.clone()),
                MemoryValue::String(_) => Err(CacheError::WrongType(key.to_string())),
            },
            None => Ok(HashSet::new()),
        }
    }

    async fn del(&self, keys: &[String]) -> Result<(), CacheError> {
        for key in keys {
            self.entries.remove(key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn values_expire_after_ttl() {
        let store = MemoryStore::new();
        store.set("k", "v", Duration::from_secs(5)).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn set_nx_only_writes_absent_keys() {
        let store = MemoryStore::new();
        assert!(store.set_nx("lock", "1", Duration::from_secs(60)).await.unwrap());
        assert!(!store.set_nx("lock", "2", Duration::from_secs(60)).await.unwrap());
        assert_eq!(store.get("lock").await.unwrap().as_deref(), Some("1"));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(store.set_nx("lock", "3", Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn incr_starts_at_one_and_respects_expire() {
        let store = MemoryStore::new();
        assert_eq!(store.incr("c").await.unwrap(), 1);
        assert_eq!(store.incr("c").await.unwrap(), 2);
        store.expire("c", Duration::from_secs(1)).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.incr("c").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn incr_rejects_non_integers() {
        let store = MemoryStore::new();
        store.set("c", "abc", Duration::from_secs(10)).await.unwrap();
        assert!(matches!(
            store.incr("c").await,
            Err(CacheError::NotAnInteger(_))
        ));
    }

    #[tokio::test]
    async fn set_operations_merge_members() {
        let store = MemoryStore::new();
        store
            .sadd("s", &["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        store
            .sadd("s", &["b".to_string(), "c".to_string()])
            .await
            .unwrap();
        let members = store.smembers("s").await.unwrap();
        assert_eq!(members.len(), 3);
        assert!(members.contains("c"));

        store.del(&["s".to_string()]).await.unwrap();
        assert!(store.smembers("s").await.unwrap().is_empty());
    }
}
