//! Rolling per (chain, candidate) service statistics.
//!
//! Entries are typed [`QualityLogEntry`] values that only get serialized at
//! the cache boundary. The `failure` flag lives under its own key because it
//! has its own, shorter, lifetime.

use std::{
    collections::BTreeMap,
    time::Duration,
};

use serde::{
    Deserialize,
    Serialize,
};
use tracing::warn;

use crate::cache::{
    CacheError,
    TieredCache,
};

/// Result code of a successful relay.
pub const SUCCESS_CODE: u16 = 200;
/// Result code recorded for node-level failures.
pub const FAILURE_CODE: u16 = 500;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityConfig {
    /// Lifetime of a service log window (seconds).
    #[serde(default = "default_service_log_ttl_secs")]
    pub service_log_ttl_secs: u64,
    /// Lifetime of a `failure` flag (seconds).
    #[serde(default = "default_failure_ttl_secs")]
    pub failure_ttl_secs: u64,
}

const fn default_service_log_ttl_secs() -> u64 {
    300
}

const fn default_failure_ttl_secs() -> u64 {
    300
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            service_log_ttl_secs: default_service_log_ttl_secs(),
            failure_ttl_secs: default_failure_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityLogEntry {
    /// Result code to number of relays that ended with it.
    pub results: BTreeMap<u16, u64>,
    /// Average latency of successful relays (seconds).
    pub average_success_latency: f64,
    #[serde(skip)]
    pub failure: bool,
}

impl QualityLogEntry {
    /// Folds one relay outcome into the entry.
    pub fn merge(&mut self, result_code: u16, elapsed_secs: f64) {
        *self.results.entry(result_code).or_insert(0) += 1;
        if result_code == SUCCESS_CODE {
            let successes = self.successes() as f64;
            self.average_success_latency =
                ((successes - 1.0) * self.average_success_latency + elapsed_secs) / successes;
        }
    }

    pub fn attempts(&self) -> u64 {
        self.results.values().sum()
    }

    pub fn successes(&self) -> u64 {
        self.results.get(&SUCCESS_CODE).copied().unwrap_or(0)
    }

    pub fn success_rate(&self) -> f64 {
        match self.attempts() {
            0 => 1.0,
            attempts => self.successes() as f64 / attempts as f64,
        }
    }
}

#[derive(Clone, Debug)]
pub struct QualityLog {
    cache: TieredCache,
    config: QualityConfig,
}

impl QualityLog {
    pub fn new(cache: TieredCache, config: QualityConfig) -> Self {
        Self { cache, config }
    }

    fn service_key(chain: &str, candidate: &str) -> String {
        format!("{chain}-{candidate}-service")
    }

    fn failure_key(chain: &str, candidate: &str) -> String {
        format!("{chain}-{candidate}-failure")
    }

    /// Loads the entry of a candidate, `None` when it has no history yet.
    pub async fn load(
        &self,
        chain: &str,
        candidate: &str,
    ) -> Result<Option<QualityLogEntry>, CacheError> {
        let entry = self
            .cache
            .get_json::<QualityLogEntry>(&Self::service_key(chain, candidate))
            .await?;
        let failure = self
            .cache
            .get(&Self::failure_key(chain, candidate))
            .await?
            .is_some();

        Ok(match (entry, failure) {
            (Some(mut entry), failure) => {
                entry.failure = failure;
                Some(entry)
            }
            (None, true) => Some(QualityLogEntry {
                failure: true,
                ..Default::default()
            }),
            (None, false) => None,
        })
    }

    /// Read-modify-write of the candidate's entry. Concurrent writers may lose
    /// each other's updates; the window tolerates it.
    pub async fn record(
        &self,
        chain: &str,
        candidate: &str,
        result_code: u16,
        elapsed_secs: f64,
    ) -> Result<QualityLogEntry, CacheError> {
        let key = Self::service_key(chain, candidate);
        let mut entry = self
            .cache
            .get_json::<QualityLogEntry>(&key)
            .await?
            .unwrap_or_default();
        entry.merge(result_code, elapsed_secs);
        self.cache
            .set_json(
                &key,
                &entry,
                Duration::from_secs(self.config.service_log_ttl_secs),
            )
            .await?;

        if result_code == SUCCESS_CODE {
            self.clear_failure(chain, candidate).await;
        }
        Ok(entry)
    }

    pub async fn mark_failure(&self, chain: &str, candidate: &str) {
        let result = self
            .cache
            .set(
                &Self::failure_key(chain, candidate),
                "true",
                Duration::from_secs(self.config.failure_ttl_secs),
            )
            .await;
        if let Err(err) = result {
            warn!(%err, chain, candidate, "failed to flag candidate as failing");
        }
    }

    async fn clear_failure(&self, chain: &str, candidate: &str) {
        if let Err(err) = self
            .cache
            .del(&[Self::failure_key(chain, candidate)])
            .await
        {
            warn!(%err, chain, candidate, "failed to clear failure flag");
        }
    }
}
