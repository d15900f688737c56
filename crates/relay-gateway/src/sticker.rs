//! Client to node pinning.
//!
//! A binding maps one client (load balancer or application, chain, client IP
//! and optionally the next JSON-RPC id it is expected to send) to the
//! application and node that served it. Bindings expire after the configured
//! duration and are dropped early when the node misbehaves or the relay
//! ceiling is reached.

use std::{
    collections::HashSet,
    net::IpAddr,
    time::Duration,
};

use serde::{
    Deserialize,
    Serialize,
};
use tracing::{
    debug,
    warn,
};

use crate::{
    cache::TieredCache,
    models::{
        Node,
        StickinessOptions,
    },
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StickinessDefaults {
    /// Errors a bound node may cause before its bindings are dropped.
    #[serde(default = "default_max_errors")]
    pub max_errors: i64,
}

const fn default_max_errors() -> i64 {
    5
}

impl Default for StickinessDefaults {
    fn default() -> Self {
        Self {
            max_errors: default_max_errors(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StickyBinding {
    pub application_id: String,
    pub node_address: String,
}

/// Identity a binding is keyed on.
#[derive(Debug, Clone)]
pub struct StickyClient<'a> {
    /// Load balancer or application the client called.
    pub scope: &'a str,
    pub chain: &'a str,
    pub ip: IpAddr,
    /// JSON-RPC id of the current request.
    pub rpc_id: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct NodeSticker {
    cache: TieredCache,
    options: StickinessOptions,
    max_errors: i64,
    client_key: String,
    lookup_key: String,
    next_key: String,
}

impl NodeSticker {
    pub fn new(
        cache: TieredCache,
        options: StickinessOptions,
        defaults: &StickinessDefaults,
        client: &StickyClient<'_>,
    ) -> Self {
        let client_key = format!("{}-{}-{}", client.scope, client.ip, client.chain);
        let (lookup_key, next_key) = match (options.use_rpc_id, client.rpc_id) {
            (true, Some(id)) => (
                format!("{client_key}-{id}"),
                format!("{client_key}-{}", id.saturating_add(1)),
            ),
            _ => (client_key.clone(), client_key.clone()),
        };
        Self {
            cache,
            options,
            max_errors: defaults.max_errors,
            client_key,
            lookup_key,
            next_key,
        }
    }

    fn duration(&self) -> Duration {
        Duration::from_secs(self.options.duration_secs)
    }

    fn relays_key(&self) -> String {
        format!("{}-relays", self.client_key)
    }

    fn errors_key(&self, node_address: &str) -> String {
        format!("{}-{node_address}-errors", self.client_key)
    }

    /// Binding of the client, if any.
    pub async fn binding(&self) -> Option<StickyBinding> {
        match self.cache.get_json::<StickyBinding>(&self.lookup_key).await {
            Ok(binding) => binding,
            Err(err) => {
                warn!(%err, "sticky binding unreadable");
                None
            }
        }
    }

    /// The bound node when it is still usable. A binding to a node that left
    /// `nodes`, was evicted from its session or keeps failing is cleared.
    pub async fn get_sticky_node(
        &self,
        nodes: &[Node],
        exhausted: &HashSet<String>,
    ) -> Option<Node> {
        let binding = self.binding().await?;
        let Some(node) = nodes
            .iter()
            .find(|node| node.address == binding.node_address)
        else {
            self.remove("bound node left the candidate set").await;
            return None;
        };

        if exhausted.contains(&node.public_key) {
            self.remove("bound node is exhausted").await;
            return None;
        }

        let errors = self
            .cache
            .counter(&self.errors_key(&binding.node_address))
            .await
            .unwrap_or_else(|err| {
                warn!(%err, "sticky error counter unreadable");
                0
            });
        if errors > self.max_errors {
            self.remove("bound node exceeded its error threshold").await;
            return None;
        }

        Some(node.clone())
    }

    /// Binds the client to `node_address`, unless its origin may not stick.
    /// Every call counts one relay against the binding's ceiling.
    pub async fn set_stickiness_key(
        &self,
        application_id: &str,
        node_address: &str,
        origin: Option<&str>,
    ) {
        if !self.origin_allowed(origin) {
            return;
        }

        let binding = StickyBinding {
            application_id: application_id.to_string(),
            node_address: node_address.to_string(),
        };
        let needs_write = self.next_key != self.lookup_key || self.binding().await.is_none();
        if needs_write {
            if let Err(err) = self
                .cache
                .set_json(&self.next_key, &binding, self.duration())
                .await
            {
                warn!(%err, "failed to write sticky binding");
                return;
            }
        }

        let Some(limit) = self.options.relays_limit else {
            return;
        };
        match self
            .cache
            .incr_with_ttl(&self.relays_key(), self.duration())
            .await
        {
            Ok(relays) if relays >= i64::try_from(limit).unwrap_or(i64::MAX) => {
                self.remove("relay limit reached").await;
            }
            Ok(_) => {}
            Err(err) => warn!(%err, "failed to count sticky relay"),
        }
    }

    pub async fn increment_error_count(&self, node_address: &str) {
        if let Err(err) = self
            .cache
            .incr_with_ttl(&self.errors_key(node_address), self.duration())
            .await
        {
            warn!(%err, "failed to count sticky node error");
        }
    }

    pub async fn remove(&self, reason: &str) {
        debug!(reason, client = %self.client_key, "dropping sticky binding");
        let mut keys = vec![self.relays_key(), self.lookup_key.clone()];
        if self.next_key != self.lookup_key {
            keys.push(self.next_key.clone());
        }
        if let Some(binding) = self.binding().await {
            keys.push(self.errors_key(&binding.node_address));
        }
        if let Err(err) = self.cache.del(&keys).await {
            warn!(%err, "failed to drop sticky binding");
        }
    }

    fn origin_allowed(&self, origin: Option<&str>) -> bool {
        if self.options.sticky_origins.is_empty() {
            return true;
        }
        origin.is_some_and(|origin| {
            self.options
                .sticky_origins
                .iter()
                .any(|allowed| origin.contains(allowed.as_str()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::node;

    fn options() -> StickinessOptions {
        StickinessOptions {
            duration_secs: 300,
            use_rpc_id: false,
            relays_limit: None,
            sticky_origins: Vec::new(),
        }
    }

    fn sticker(
        cache: &TieredCache,
        options: StickinessOptions,
        rpc_id: Option<u64>,
    ) -> NodeSticker {
        NodeSticker::new(
            cache.clone(),
            options,
            &StickinessDefaults::default(),
            &StickyClient {
                scope: "lb",
                chain: "0021",
                ip: "10.0.0.1".parse().unwrap(),
                rpc_id,
            },
        )
    }

    #[tokio::test]
    async fn bound_nodes_are_returned_while_healthy() {
        let cache = TieredCache::in_memory();
        let sticker = sticker(&cache, options(), None);
        let nodes = vec![node(0), node(1)];

        sticker
            .set_stickiness_key("app", &nodes[1].address, None)
            .await;
        let picked = sticker.get_sticky_node(&nodes, &HashSet::new()).await;
        assert_eq!(picked, Some(nodes[1].clone()));
        assert_eq!(sticker.binding().await.unwrap().application_id, "app");
    }

    #[tokio::test]
    async fn bindings_to_missing_or_exhausted_nodes_are_cleared() {
        let cache = TieredCache::in_memory();
        let sticker = sticker(&cache, options(), None);
        let nodes = vec![node(0), node(1)];

        sticker
            .set_stickiness_key("app", &nodes[0].address, None)
            .await;
        let exhausted = HashSet::from([nodes[0].public_key.clone()]);
        assert!(sticker.get_sticky_node(&nodes, &exhausted).await.is_none());
        assert!(sticker.binding().await.is_none());

        sticker
            .set_stickiness_key("app", &nodes[0].address, None)
            .await;
        assert!(sticker.get_sticky_node(&nodes[1..], &HashSet::new()).await.is_none());
        assert!(sticker.binding().await.is_none());
    }

    #[tokio::test]
    async fn failing_nodes_lose_their_binding() {
        let cache = TieredCache::in_memory();
        let sticker = sticker(&cache, options(), None);
        let nodes = vec![node(0)];
        sticker
            .set_stickiness_key("app", &nodes[0].address, None)
            .await;

        for _ in 0..5 {
            sticker.increment_error_count(&nodes[0].address).await;
        }
        assert!(sticker.get_sticky_node(&nodes, &HashSet::new()).await.is_some());

        sticker.increment_error_count(&nodes[0].address).await;
        assert!(sticker.get_sticky_node(&nodes, &HashSet::new()).await.is_none());
    }

    #[tokio::test]
    async fn dropping_a_binding_forgets_the_node_errors() {
        let cache = TieredCache::in_memory();
        let sticker = sticker(&cache, options(), None);
        let nodes = vec![node(0)];
        sticker
            .set_stickiness_key("app", &nodes[0].address, None)
            .await;
        for _ in 0..6 {
            sticker.increment_error_count(&nodes[0].address).await;
        }
        assert!(sticker.get_sticky_node(&nodes, &HashSet::new()).await.is_none());

        let errors_key = sticker.errors_key(&nodes[0].address);
        assert_eq!(cache.counter(&errors_key).await.unwrap(), 0);

        sticker
            .set_stickiness_key("app", &nodes[0].address, None)
            .await;
        assert_eq!(
            sticker.get_sticky_node(&nodes, &HashSet::new()).await,
            Some(nodes[0].clone())
        );
    }

    #[tokio::test]
    async fn relay_ceiling_drops_the_binding() {
        let cache = TieredCache::in_memory();
        let sticker = sticker(
            &cache,
            StickinessOptions {
                relays_limit: Some(2),
                ..options()
            },
            None,
        );
        let nodes = vec![node(0)];

        sticker
            .set_stickiness_key("app", &nodes[0].address, None)
            .await;
        assert!(sticker.binding().await.is_some());
        sticker
            .set_stickiness_key("app", &nodes[0].address, None)
            .await;
        assert!(sticker.binding().await.is_none());
    }

    #[tokio::test]
    async fn only_whitelisted_origins_stick() {
        let cache = TieredCache::in_memory();
        let sticker = sticker(
            &cache,
            StickinessOptions {
                sticky_origins: vec!["wallet.example".into()],
                ..options()
            },
            None,
        );

        sticker.set_stickiness_key("app", "address0", None).await;
        sticker
            .set_stickiness_key("app", "address0", Some("https://evil.example"))
            .await;
        assert!(sticker.binding().await.is_none());

        sticker
            .set_stickiness_key("app", "address0", Some("https://wallet.example"))
            .await;
        assert!(sticker.binding().await.is_some());
    }

    #[tokio::test]
    async fn rpc_id_bindings_follow_the_conversation() {
        let cache = TieredCache::in_memory();
        let options = StickinessOptions {
            use_rpc_id: true,
            ..options()
        };
        let nodes = vec![node(0), node(1)];

        sticker(&cache, options.clone(), Some(7))
            .set_stickiness_key("app", &nodes[1].address, None)
            .await;

        let next = sticker(&cache, options.clone(), Some(8));
        assert_eq!(
            next.get_sticky_node(&nodes, &HashSet::new()).await,
            Some(nodes[1].clone())
        );
        let unrelated = sticker(&cache, options, Some(42));
        assert!(unrelated.get_sticky_node(&nodes, &HashSet::new()).await.is_none());
    }
}
