use std::{
    collections::HashSet,
    time::Duration,
};

use alloy_primitives::keccak256;
use serde::{
    Deserialize,
    Serialize,
};
use tracing::{
    debug,
    info,
    instrument,
    warn,
};

use crate::{
    cache::TieredCache,
    health::{
        CheckKind,
        check_cache_key,
        refresh_lock_key,
    },
    models::{
        Node,
        Session,
    },
    protocol::{
        ProtocolError,
        SharedProtocolClient,
    },
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// How long a dispatched session is reused before asking the network again (seconds).
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,
    /// How long a session remembers its exhausted nodes (seconds).
    #[serde(default = "default_exhausted_ttl_secs")]
    pub exhausted_ttl_secs: u64,
}

const fn default_session_ttl_secs() -> u64 {
    60
}

const fn default_exhausted_ttl_secs() -> u64 {
    3_600
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_ttl_secs: default_session_ttl_secs(),
            exhausted_ttl_secs: default_exhausted_ttl_secs(),
        }
    }
}

/// Canonical identity of a session's node set: keccak of the chain and the
/// sorted node public keys.
pub fn session_hash(chain: &str, nodes: &[Node]) -> String {
    let mut keys: Vec<&str> = nodes.iter().map(|node| node.public_key.as_str()).collect();
    keys.sort_unstable();

    let mut buf = Vec::with_capacity(chain.len() + keys.len() * 65);
    buf.extend_from_slice(chain.as_bytes());
    for key in keys {
        buf.push(b':');
        buf.extend_from_slice(key.as_bytes());
    }
    hex::encode(keccak256(buf).as_slice())
}

fn session_cache_key(application_public_key: &str, chain: &str) -> String {
    format!("session-{application_public_key}-{chain}")
}

fn exhausted_key(session: &Session) -> String {
    format!("session-exhausted-{}", session.key)
}

/// Fetches sessions from the protocol client and tracks the nodes evicted
/// from each session's working set.
#[derive(Clone)]
pub struct SessionManager {
    client: SharedProtocolClient,
    cache: TieredCache,
    config: SessionConfig,
}

impl SessionManager {
    pub fn new(client: SharedProtocolClient, cache: TieredCache, config: SessionConfig) -> Self {
        Self {
            client,
            cache,
            config,
        }
    }

    #[instrument(name = "session::get", skip(self), level = "debug")]
    pub async fn get_session(
        &self,
        application_public_key: &str,
        chain: &str,
    ) -> Result<Session, ProtocolError> {
        let key = session_cache_key(application_public_key, chain);
        match self.cache.get_json::<Session>(&key).await {
            Ok(Some(session)) => return Ok(session),
            Ok(None) => {}
            Err(err) => warn!(%err, "cached session unreadable, dispatching a new one"),
        }

        let session = self
            .client
            .get_session(application_public_key, chain)
            .await?;
        debug!(
            session_key = %session.key,
            nodes = session.nodes.len(),
            "dispatched new session"
        );

        let ttl = Duration::from_secs(self.config.session_ttl_secs);
        if let Err(err) = self.cache.set_json(&key, &session, ttl).await {
            warn!(%err, "failed to cache session");
        }
        Ok(session)
    }

    pub async fn invalidate_session(&self, application_public_key: &str, chain: &str) {
        let key = session_cache_key(application_public_key, chain);
        if let Err(err) = self.cache.del(&[key]).await {
            warn!(%err, "failed to invalidate session");
        }
    }

    /// Public keys evicted from the session. Fails open to an empty set.
    pub async fn exhausted_nodes(&self, session: &Session) -> HashSet<String> {
        match self.cache.smembers(&exhausted_key(session)).await {
            Ok(members) => members,
            Err(err) => {
                warn!(%err, "failed to read exhausted nodes, assuming none");
                HashSet::new()
            }
        }
    }

    /// Session nodes that are neither jailed nor evicted.
    pub async fn working_nodes(&self, session: &Session) -> Vec<Node> {
        let exhausted = self.exhausted_nodes(session).await;
        session
            .nodes
            .iter()
            .filter(|node| !node.jailed && !exhausted.contains(&node.public_key))
            .cloned()
            .collect()
    }

    /// Removes a node from the session's working set and drops every health
    /// check result cached for the session, so the next check re-probes.
    #[instrument(name = "session::evict_node", skip(self, session), level = "debug")]
    pub async fn evict_node(&self, chain: &str, session: &Session, public_key: &str) {
        let key = exhausted_key(session);
        if let Err(err) = self.cache.sadd(&key, &[public_key.to_string()]).await {
            warn!(%err, "failed to record evicted node");
            return;
        }
        let ttl = Duration::from_secs(self.config.exhausted_ttl_secs);
        if let Err(err) = self.cache.expire(&key, ttl).await {
            warn!(%err, "failed to arm eviction set expiry");
        }

        let hash = session_hash(chain, &session.nodes);
        let check_keys: Vec<String> = CheckKind::ALL
            .iter()
            .flat_map(|kind| {
                let cache_key = check_cache_key(*kind, &hash);
                [refresh_lock_key(&cache_key), cache_key]
            })
            .collect();
        if let Err(err) = self.cache.del(&check_keys).await {
            warn!(%err, "failed to invalidate health check caches");
        }

        metrics::counter!("relay_gateway_node_evictions_total").increment(1);
        info!(chain, session_key = %session.key, "node evicted from session");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{
        ScriptedProtocolClient,
        node,
        session_with,
    };
    use std::sync::Arc;

    fn manager(client: Arc<ScriptedProtocolClient>) -> SessionManager {
        SessionManager::new(client, TieredCache::in_memory(), SessionConfig::default())
    }

    #[test]
    fn session_hash_ignores_node_order() {
        let a = vec![node(1), node(2), node(3)];
        let b = vec![node(3), node(1), node(2)];
        assert_eq!(session_hash("0021", &a), session_hash("0021", &b));
        assert_ne!(session_hash("0021", &a), session_hash("0040", &a));
        assert_ne!(session_hash("0021", &a), session_hash("0021", &a[..2]));
    }

    #[tokio::test]
    async fn sessions_are_reused_until_invalidated() {
        let client = Arc::new(ScriptedProtocolClient::new(session_with(3)));
        let sessions = manager(client.clone());

        sessions.get_session("app", "0021").await.unwrap();
        sessions.get_session("app", "0021").await.unwrap();
        assert_eq!(client.session_calls(), 1);

        sessions.invalidate_session("app", "0021").await;
        sessions.get_session("app", "0021").await.unwrap();
        assert_eq!(client.session_calls(), 2);
    }

    #[tokio::test]
    async fn evicted_nodes_leave_the_working_set() {
        let client = Arc::new(ScriptedProtocolClient::new(session_with(3)));
        let sessions = manager(client);
        let session = sessions.get_session("app", "0021").await.unwrap();

        sessions
            .evict_node("0021", &session, &session.nodes[1].public_key)
            .await;
        let working = sessions.working_nodes(&session).await;
        assert_eq!(working.len(), 2);
        assert!(working.iter().all(|n| n.public_key != session.nodes[1].public_key));
    }

    #[tokio::test]
    async fn eviction_drops_cached_check_results() {
        let client = Arc::new(ScriptedProtocolClient::new(session_with(2)));
        let cache = TieredCache::in_memory();
        let sessions = SessionManager::new(client, cache.clone(), SessionConfig::default());
        let session = sessions.get_session("app", "0021").await.unwrap();

        let key = check_cache_key(CheckKind::Sync, &session_hash("0021", &session.nodes));
        cache
            .set(&key, "cached", Duration::from_secs(600))
            .await
            .unwrap();
        sessions
            .evict_node("0021", &session, &session.nodes[0].public_key)
            .await;
        assert_eq!(cache.get(&key).await.unwrap(), None);
    }
}
