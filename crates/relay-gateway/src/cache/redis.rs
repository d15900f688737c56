//! # Redis-backed shared store
//!
//! `RedisStore` wraps a `redis::Client` and runs every command on a blocking
//! thread so cache access stays a suspension point for the async callers.
//! Construct it with `RedisStore::new(client)` or
//! `RedisStore::from_url("redis://...")`.

use std::{
    collections::HashSet,
    fmt::{
        self,
        Debug,
    },
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;

use super::{
    error::CacheError,
    store::SharedStore,
};
use crate::critical;

pub struct RedisStore {
    client: Arc<redis::Client>,
}

impl Clone for RedisStore {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
        }
    }
}

impl Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("client", &self.client)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Wraps an existing `redis::Client`, allowing callers to share clients.
    pub fn new(client: redis::Client) -> Self {
        Self {
            client: Arc::new(client),
        }
    }

    /// Opens a client from the provided connection URL.
    pub fn from_url(url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(url).map_err(CacheError::Backend)?;
        Ok(Self::new(client))
    }

    /// Execute a synchronous Redis operation on a dedicated blocking thread.
    async fn with_connection<T, F>(&self, func: F) -> Result<T, CacheError>
    where
        T: Send + 'static,
        F: FnOnce(&mut redis::Connection) -> redis::RedisResult<T> + Send + 'static,
    {
        let client = self.client.clone();
        tokio::task::spawn_blocking(move || {
            let mut connection = client.get_connection().map_err(|err| {
                critical!(error = ?err, "redis store connection error");
                CacheError::Backend(err)
            })?;
            func(&mut connection).map_err(|err| {
                critical!(error = ?err, "redis store command error");
                CacheError::Backend(err)
            })
        })
        .await?
    }
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let key = key.to_string();
        self.with_connection(move |conn| redis::cmd("GET").arg(&key).query(conn))
            .await
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let (key, value) = (key.to_string(), value.to_string());
        self.with_connection(move |conn| {
            redis::cmd("SET")
                .arg(&key)
                .arg(&value)
                .arg("EX")
                .arg(ttl_secs(ttl))
                .query(conn)
        })
        .await
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, CacheError> {
        let (key, value) = (key.to_string(), value.to_string());
        let reply: Option<String> = self
            .with_connection(move |conn| {
                redis::cmd("SET")
                    .arg(&key)
                    .arg(&value)
                    .arg("NX")
                    .arg("EX")
                    .arg(ttl_secs(ttl))
                    .query(conn)
            })
            .await?;
        Ok(reply.is_some())
    }

    async fn incr(&self, key: &str) -> Result<i64, CacheError> {
        let key = key.to_string();
        self.with_connection(move |conn| redis::cmd("INCR").arg(&key).query(conn))
            .await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), CacheError> {
        let key = key.to_string();
        let _: i64 = self
            .with_connection(move |conn| {
                redis::cmd("EXPIRE")
                    .arg(&key)
                    .arg(ttl_secs(ttl))
                    .query(conn)
            })
            .await?;
        Ok(())
    }

    async fn sadd(&self, key: &str, members: &[String]) -> Result<(), CacheError> {
        if members.is_empty() {
            return Ok(());
        }
        let key = key.to_string();
        let members = members.to_vec();
        let _: i64 = self
            .with_connection(move |conn| redis::cmd("SADD").arg(&key).arg(&members).query(conn))
            .await?;
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<HashSet<String>, CacheError> {
        let key = key.to_string();
        self.with_connection(move |conn| redis::cmd("SMEMBERS").arg(&key).query(conn))
            .await
    }

    async fn del(&self, keys: &[String]) -> Result<(), CacheError> {
        if keys.is_empty() {
            return Ok(());
        }
        let keys = keys.to_vec();
        let _: i64 = self
            .with_connection(move |conn| redis::cmd("DEL").arg(&keys).query(conn))
            .await?;
        Ok(())
    }
}
