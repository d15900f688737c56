//! Read-only lookups of applications, blockchains and load balancers.
//!
//! The gateway never writes through these. Each lookup is fronted by a short
//! TTL cache so a burst of relays for one application hits the backing
//! repository once.

use std::{
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use moka::sync::Cache;
use serde::{
    Deserialize,
    Serialize,
};
use thiserror::Error;
use tracing::debug;

use crate::models::{
    Application,
    Blockchain,
    LoadBalancer,
};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("repository backend failed: {0}")]
    Backend(String),
}

#[async_trait]
pub trait ApplicationRepository: Send + Sync {
    async fn get_application(&self, id: &str) -> Result<Option<Application>, RepositoryError>;
}

#[async_trait]
pub trait BlockchainRepository: Send + Sync {
    async fn list_blockchains(&self) -> Result<Vec<Blockchain>, RepositoryError>;
}

#[async_trait]
pub trait LoadBalancerRepository: Send + Sync {
    async fn get_load_balancer(&self, id: &str) -> Result<Option<LoadBalancer>, RepositoryError>;
}

pub type SharedApplicationRepository = Arc<dyn ApplicationRepository>;
pub type SharedBlockchainRepository = Arc<dyn BlockchainRepository>;
pub type SharedLoadBalancerRepository = Arc<dyn LoadBalancerRepository>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    #[serde(default = "default_application_ttl_secs")]
    pub application_ttl_secs: u64,
    #[serde(default = "default_load_balancer_ttl_secs")]
    pub load_balancer_ttl_secs: u64,
    #[serde(default = "default_blockchain_ttl_ms")]
    pub blockchain_ttl_ms: u64,
    #[serde(default = "default_max_entries")]
    pub max_entries: u64,
}

const fn default_application_ttl_secs() -> u64 {
    60
}

const fn default_load_balancer_ttl_secs() -> u64 {
    60
}

const fn default_blockchain_ttl_ms() -> u64 {
    1_000
}

const fn default_max_entries() -> u64 {
    10_000
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            application_ttl_secs: default_application_ttl_secs(),
            load_balancer_ttl_secs: default_load_balancer_ttl_secs(),
            blockchain_ttl_ms: default_blockchain_ttl_ms(),
            max_entries: default_max_entries(),
        }
    }
}

const BLOCKCHAINS_KEY: &str = "blockchains";

/// Cached view over the three repositories.
#[derive(Clone)]
pub struct Repositories {
    applications: SharedApplicationRepository,
    blockchains: SharedBlockchainRepository,
    load_balancers: SharedLoadBalancerRepository,
    application_cache: Cache<String, Arc<Application>>,
    blockchain_cache: Cache<&'static str, Arc<Vec<Blockchain>>>,
    load_balancer_cache: Cache<String, Arc<LoadBalancer>>,
}

impl Repositories {
    pub fn new(
        applications: SharedApplicationRepository,
        blockchains: SharedBlockchainRepository,
        load_balancers: SharedLoadBalancerRepository,
        config: &RepositoryConfig,
    ) -> Self {
        Self {
            applications,
            blockchains,
            load_balancers,
            application_cache: Cache::builder()
                .max_capacity(config.max_entries)
                .time_to_live(Duration::from_secs(config.application_ttl_secs))
                .build(),
            blockchain_cache: Cache::builder()
                .max_capacity(1)
                .time_to_live(Duration::from_millis(config.blockchain_ttl_ms))
                .build(),
            load_balancer_cache: Cache::builder()
                .max_capacity(config.max_entries)
                .time_to_live(Duration::from_secs(config.load_balancer_ttl_secs))
                .build(),
        }
    }

    pub async fn application(&self, id: &str) -> Result<Option<Arc<Application>>, RepositoryError> {
        if let Some(application) = self.application_cache.get(id) {
            return Ok(Some(application));
        }
        let Some(application) = self.applications.get_application(id).await? else {
            return Ok(None);
        };
        let application = Arc::new(application);
        self.application_cache
            .insert(id.to_string(), application.clone());
        Ok(Some(application))
    }

    pub async fn load_balancer(
        &self,
        id: &str,
    ) -> Result<Option<Arc<LoadBalancer>>, RepositoryError> {
        if let Some(load_balancer) = self.load_balancer_cache.get(id) {
            return Ok(Some(load_balancer));
        }
        let Some(load_balancer) = self.load_balancers.get_load_balancer(id).await? else {
            return Ok(None);
        };
        let load_balancer = Arc::new(load_balancer);
        self.load_balancer_cache
            .insert(id.to_string(), load_balancer.clone());
        Ok(Some(load_balancer))
    }

    pub async fn blockchains(&self) -> Result<Arc<Vec<Blockchain>>, RepositoryError> {
        if let Some(blockchains) = self.blockchain_cache.get(BLOCKCHAINS_KEY) {
            return Ok(blockchains);
        }
        let blockchains = Arc::new(self.blockchains.list_blockchains().await?);
        self.blockchain_cache
            .insert(BLOCKCHAINS_KEY, blockchains.clone());
        Ok(blockchains)
    }

    /// Blockchain served under `host`, matched by its left-most label.
    pub async fn resolve_blockchain(
        &self,
        host: &str,
    ) -> Result<Option<Blockchain>, RepositoryError> {
        let alias = subdomain(host);
        let blockchains = self.blockchains().await?;
        let found = blockchains
            .iter()
            .find(|blockchain| {
                blockchain
                    .aliases
                    .iter()
                    .any(|candidate| candidate.eq_ignore_ascii_case(alias))
            })
            .cloned();
        if found.is_none() {
            debug!(host, alias, "no blockchain serves this host");
        }
        Ok(found)
    }
}

fn subdomain(host: &str) -> &str {
    let host = host.split(':').next().unwrap_or(host);
    host.split('.').next().unwrap_or(host)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{
        InMemoryRepository,
        application,
        blockchain,
    };

    fn repositories(store: Arc<InMemoryRepository>) -> Repositories {
        Repositories::new(
            store.clone(),
            store.clone(),
            store,
            &RepositoryConfig::default(),
        )
    }

    #[test]
    fn subdomain_is_the_leftmost_label() {
        assert_eq!(subdomain("eth-mainnet.gateway.example.com"), "eth-mainnet");
        assert_eq!(subdomain("eth-mainnet:8080"), "eth-mainnet");
        assert_eq!(subdomain("localhost"), "localhost");
    }

    #[tokio::test]
    async fn resolves_blockchains_by_alias() {
        let store = Arc::new(InMemoryRepository::default());
        store.add_blockchain(blockchain());
        let repositories = repositories(store);

        let found = repositories
            .resolve_blockchain("ETH-MAINNET.gateway.example.com")
            .await
            .unwrap();
        assert_eq!(found.map(|b| b.id), Some("0021".to_string()));
        assert!(repositories
            .resolve_blockchain("unknown.gateway.example.com")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn applications_are_served_from_cache() {
        let store = Arc::new(InMemoryRepository::default());
        store.add_application(application());
        let repositories = repositories(store.clone());

        repositories.application("app").await.unwrap().unwrap();
        repositories.application("app").await.unwrap().unwrap();
        assert_eq!(store.application_reads(), 1);
        assert!(repositories.application("missing").await.unwrap().is_none());
    }
}
