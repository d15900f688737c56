//! Node health validation.
//!
//! A [`HealthCheck`] probes every working node of a session concurrently and
//! keeps the nodes whose answers pass it. The passing set is cached per
//! session so one round of probes serves every relay in the session until the
//! cache expires. A short lock keeps concurrent requests from probing the
//! same session at once; requests that lose the lock race proceed with the
//! nodes they were given.

pub mod checks;

use std::{
    collections::HashSet,
    time::Duration,
};

use futures::future::join_all;
use serde::{
    Deserialize,
    Serialize,
};
use serde_json::Value;
use tracing::{
    debug,
    info,
    instrument,
    warn,
};

pub use checks::{
    HealthCheck,
    ProbeResponse,
};

use crate::{
    cache::TieredCache,
    models::{
        AuthToken,
        Node,
        Session,
    },
    protocol::{
        ChallengeCall,
        ProtocolError,
        RelayCall,
        SharedProtocolClient,
        relay_with_timeout,
    },
    session::{
        SessionManager,
        session_hash,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckKind {
    Chain,
    Sync,
    Archival,
    Merge,
}

impl CheckKind {
    pub const ALL: [CheckKind; 4] = [
        CheckKind::Chain,
        CheckKind::Sync,
        CheckKind::Archival,
        CheckKind::Merge,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CheckKind::Chain => "chain",
            CheckKind::Sync => "sync",
            CheckKind::Archival => "archival",
            CheckKind::Merge => "merge",
        }
    }
}

/// Cache key of a check's passing set for one session.
pub fn check_cache_key(kind: CheckKind, session_hash: &str) -> String {
    format!("{}-check-{session_hash}", kind.as_str())
}

pub fn refresh_lock_key(cache_key: &str) -> String {
    format!("lock-{cache_key}")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    /// Lifetime of a non-empty passing set (seconds).
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    /// Lifetime of an empty passing set (seconds).
    #[serde(default = "default_failure_cache_ttl_secs")]
    pub failure_cache_ttl_secs: u64,
    /// How long the refresh lock is held at most (seconds).
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,
    /// Budget of one probe relay (milliseconds).
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

const fn default_cache_ttl_secs() -> u64 {
    600
}

const fn default_failure_cache_ttl_secs() -> u64 {
    30
}

const fn default_lock_ttl_secs() -> u64 {
    60
}

const fn default_probe_timeout_ms() -> u64 {
    5_000
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_cache_ttl_secs(),
            failure_cache_ttl_secs: default_failure_cache_ttl_secs(),
            lock_ttl_secs: default_lock_ttl_secs(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

/// Cached outcome of a check round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct CheckCacheEntry {
    passing: Vec<String>,
}

/// What a validation round runs against.
#[derive(Debug, Clone, Copy)]
pub struct ValidationContext<'a> {
    pub chain: &'a str,
    pub session: &'a Session,
    /// Working nodes of the session, the candidates the check filters.
    pub nodes: &'a [Node],
    pub auth_token: &'a AuthToken,
}

enum ProbeOutcome {
    Answered(ProbeResponse),
    Exhausted,
    Failed,
}

#[derive(Clone)]
pub struct NodeValidator {
    client: SharedProtocolClient,
    cache: TieredCache,
    sessions: SessionManager,
    config: HealthCheckConfig,
}

impl NodeValidator {
    pub fn new(
        client: SharedProtocolClient,
        cache: TieredCache,
        sessions: SessionManager,
        config: HealthCheckConfig,
    ) -> Self {
        Self {
            client,
            cache,
            sessions,
            config,
        }
    }

    /// Nodes of `ctx.nodes` passing `check`.
    ///
    /// Never fails: when the check cannot run (cache unreachable, another
    /// request holding the refresh lock) the input nodes are returned
    /// unchanged.
    #[instrument(
        name = "health::validate",
        skip_all,
        fields(check = check.kind().as_str(), chain = ctx.chain, session_key = %ctx.session.key),
        level = "debug"
    )]
    pub async fn validate(&self, check: &HealthCheck, ctx: ValidationContext<'_>) -> Vec<Node> {
        if ctx.nodes.is_empty() {
            return Vec::new();
        }

        let cache_key = check_cache_key(check.kind(), &session_hash(ctx.chain, &ctx.session.nodes));
        match self.cache.get_json::<CheckCacheEntry>(&cache_key).await {
            Ok(Some(entry)) => return retain_passing(ctx.nodes, entry.passing),
            Ok(None) => {}
            Err(err) => {
                warn!(%err, "health check cache unreadable, skipping check");
                return ctx.nodes.to_vec();
            }
        }

        let lock_key = refresh_lock_key(&cache_key);
        let lock_ttl = Duration::from_secs(self.config.lock_ttl_secs);
        match self.cache.set_nx(&lock_key, "1", lock_ttl).await {
            Ok(true) => {}
            Ok(false) => {
                debug!("another request is refreshing this check");
                return ctx.nodes.to_vec();
            }
            Err(err) => {
                warn!(%err, "failed to take health check lock, skipping check");
                return ctx.nodes.to_vec();
            }
        }

        let passing = self.run_round(check, ctx, &cache_key).await;
        if let Err(err) = self.cache.del(&[lock_key]).await {
            warn!(%err, "failed to release health check lock");
        }
        passing
    }

    async fn run_round(
        &self,
        check: &HealthCheck,
        ctx: ValidationContext<'_>,
        cache_key: &str,
    ) -> Vec<Node> {
        let probe = check.probe();
        let timeout = Duration::from_millis(self.config.probe_timeout_ms);

        let outcomes = join_all(ctx.nodes.iter().map(|node| async move {
            let call = RelayCall {
                payload: &probe.body,
                chain: ctx.chain,
                auth_token: ctx.auth_token,
                node,
                path: probe.path.as_deref(),
                method: "POST",
                timeout,
            };
            (node, relay_with_timeout(self.client.as_ref(), call).await)
        }))
        .await;

        let mut responses = Vec::with_capacity(outcomes.len());
        let mut evicted = false;
        for (node, result) in outcomes {
            match classify(node, result) {
                ProbeOutcome::Answered(response) => responses.push(response),
                ProbeOutcome::Exhausted => {
                    evicted = true;
                    self.sessions
                        .evict_node(ctx.chain, ctx.session, &node.public_key)
                        .await;
                }
                ProbeOutcome::Failed => {}
            }
        }

        let passing_keys = check.select(&responses);
        let passing = retain_passing(ctx.nodes, passing_keys.iter().cloned());
        metrics::counter!(
            "relay_gateway_health_check_probe_total",
            "kind" => check.kind().as_str()
        )
        .increment(ctx.nodes.len() as u64);
        metrics::histogram!(
            "relay_gateway_health_check_passing_nodes",
            "kind" => check.kind().as_str()
        )
        .record(passing.len() as f64);

        if passing.len() < ctx.nodes.len() {
            info!(
                probed = ctx.nodes.len(),
                passing = passing.len(),
                "health check filtered nodes"
            );
            self.challenge(check, ctx, timeout).await;
        }

        // An eviction already dropped this session's check caches; writing the
        // round back would resurrect a result computed over a stale node set.
        if !evicted {
            self.persist(cache_key, &passing).await;
        }
        passing
    }

    /// Drops the cached passing set of `kind` for the session so the next
    /// validation probes again.
    pub async fn forget(&self, kind: CheckKind, chain: &str, session: &Session) {
        let cache_key = check_cache_key(kind, &session_hash(chain, &session.nodes));
        if let Err(err) = self.cache.del(&[cache_key]).await {
            warn!(%err, check = kind.as_str(), "failed to drop health check result");
        }
    }

    async fn persist(&self, cache_key: &str, passing: &[Node]) {
        let ttl = if passing.is_empty() {
            Duration::from_secs(self.config.failure_cache_ttl_secs)
        } else {
            Duration::from_secs(self.config.cache_ttl_secs)
        };
        let entry = CheckCacheEntry {
            passing: passing.iter().map(|node| node.public_key.clone()).collect(),
        };
        if let Err(err) = self.cache.set_json(cache_key, &entry, ttl).await {
            warn!(%err, "failed to cache health check result");
        }
    }

    /// Asks the network to verify the session's nodes once some of them failed
    /// a check. The outcome is only logged.
    async fn challenge(&self, check: &HealthCheck, ctx: ValidationContext<'_>, timeout: Duration) {
        let probe = check.probe();
        let call = ChallengeCall {
            payload: &probe.body,
            chain: ctx.chain,
            auth_token: ctx.auth_token,
            session: ctx.session,
            path: probe.path.as_deref(),
            timeout,
        };
        match tokio::time::timeout(timeout, self.client.send_challenge(call)).await {
            Ok(Ok(_)) => debug!("challenge accepted"),
            Ok(Err(err)) => debug!(%err, "challenge rejected"),
            Err(_) => debug!("challenge timed out"),
        }
    }
}

fn classify(node: &Node, result: Result<String, ProtocolError>) -> ProbeOutcome {
    match result {
        Ok(raw) => match serde_json::from_str::<Value>(&raw) {
            Ok(body) => ProbeOutcome::Answered(ProbeResponse {
                public_key: node.public_key.clone(),
                body,
            }),
            Err(err) => {
                debug!(%err, node = %node.public_key, "probe answer is not JSON");
                ProbeOutcome::Failed
            }
        },
        Err(ProtocolError::MaxRelaysExhausted) => ProbeOutcome::Exhausted,
        Err(err) => {
            debug!(%err, node = %node.public_key, "probe failed");
            ProbeOutcome::Failed
        }
    }
}

fn retain_passing(nodes: &[Node], passing: impl IntoIterator<Item = String>) -> Vec<Node> {
    let passing: HashSet<String> = passing.into_iter().collect();
    nodes
        .iter()
        .filter(|node| passing.contains(&node.public_key))
        .cloned()
        .collect()
}
