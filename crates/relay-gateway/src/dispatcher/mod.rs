//! Relay dispatch: preconditions, node selection, retries and the altruist
//! fallback.

pub mod altruist;
pub mod payload;
pub mod preconditions;

use std::{
    net::IpAddr,
    sync::Arc,
    time::Duration,
};

use rand::seq::IndexedRandom;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{
    debug,
    info,
    instrument,
    warn,
};

use self::{
    altruist::AltruistClient,
    payload::RequestPayload,
    preconditions::{
        check_call,
        check_caller,
    },
};
use crate::{
    cache::{
        MemoryStore,
        SharedStoreHandle,
        TieredCache,
    },
    cherry_picker::{
        BadTimeoutContext,
        CherryPicker,
    },
    config::GatewayConfig,
    error::{
        GatewayError,
        Result,
    },
    health::{
        CheckKind,
        HealthCheck,
        NodeValidator,
        ValidationContext,
    },
    metrics_recorder::{
        MetricsRecorder,
        NoopMetricsStore,
        RelayOutcome,
        SharedMetricsStore,
    },
    models::{
        Application,
        Blockchain,
        GatewaySettings,
        Node,
    },
    protocol::{
        ProtocolError,
        RelayCall,
        SharedProtocolClient,
        relay_with_timeout,
    },
    quality::{
        FAILURE_CODE,
        QualityLog,
        SUCCESS_CODE,
    },
    rate_limiter::{
        RateLimiter,
        RequestIdentity,
    },
    repository::{
        Repositories,
        SharedApplicationRepository,
        SharedBlockchainRepository,
        SharedLoadBalancerRepository,
    },
    secret::SecretKeyCipher,
    session::SessionManager,
    sticker::{
        NodeSticker,
        StickyClient,
    },
};

/// A client relay as received by the gateway.
#[derive(Debug, Clone)]
pub struct RelayRequest {
    /// Raw payload forwarded to the node.
    pub data: String,
    /// Optional path appended to the node's service URL.
    pub path: Option<String>,
    /// HTTP method of the upstream call.
    pub method: String,
    /// Host the client called; its subdomain selects the chain.
    pub host: String,
    pub request_id: String,
    pub origin: Option<String>,
    pub user_agent: Option<String>,
    pub secret_key: Option<String>,
    pub client_ip: Option<IpAddr>,
}

/// Per call overrides of the configured relay budgets.
#[derive(Debug, Clone, Default)]
pub struct RelayOptions {
    pub request_timeout: Option<Duration>,
    pub overall_timeout: Option<Duration>,
    pub relay_retries: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RelayBody {
    /// Parsed payload of chains that enforce JSON results.
    Json(Value),
    Raw(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelayResponse {
    pub body: RelayBody,
    /// Served by an altruist rather than a network node.
    pub fallback: bool,
}

/// Wires the gateway components from a configuration and its collaborators.
pub struct RelayDispatcherBuilder {
    config: GatewayConfig,
    protocol_client: Option<SharedProtocolClient>,
    shared_store: Option<SharedStoreHandle>,
    metrics_store: Option<SharedMetricsStore>,
    repositories: Option<(
        SharedApplicationRepository,
        SharedBlockchainRepository,
        SharedLoadBalancerRepository,
    )>,
}

impl RelayDispatcherBuilder {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            protocol_client: None,
            shared_store: None,
            metrics_store: None,
            repositories: None,
        }
    }

    pub fn with_protocol_client(mut self, client: SharedProtocolClient) -> Self {
        self.protocol_client = Some(client);
        self
    }

    pub fn with_shared_store(mut self, store: SharedStoreHandle) -> Self {
        self.shared_store = Some(store);
        self
    }

    pub fn with_metrics_store(mut self, store: SharedMetricsStore) -> Self {
        self.metrics_store = Some(store);
        self
    }

    pub fn with_repositories(
        mut self,
        applications: SharedApplicationRepository,
        blockchains: SharedBlockchainRepository,
        load_balancers: SharedLoadBalancerRepository,
    ) -> Self {
        self.repositories = Some((applications, blockchains, load_balancers));
        self
    }

    pub fn build(self) -> Result<RelayDispatcher> {
        let config = self.config.validate()?;
        let client = self.protocol_client.ok_or_else(|| {
            GatewayError::InvalidConfig("a protocol client is required".to_string())
        })?;
        let (applications, blockchains, load_balancers) = self.repositories.ok_or_else(|| {
            GatewayError::InvalidConfig("configuration repositories are required".to_string())
        })?;
        let store = self.shared_store.unwrap_or_else(MemoryStore::shared);
        let metrics_store = self
            .metrics_store
            .unwrap_or_else(|| Arc::new(NoopMetricsStore));

        let cache = TieredCache::new(store, &config.cache);
        let sessions = SessionManager::new(client.clone(), cache.clone(), config.session.clone());
        let quality = QualityLog::new(cache.clone(), config.quality.clone());
        let cherry_picker = CherryPicker::new(quality, sessions.clone(), cache.clone());
        let validator = NodeValidator::new(
            client.clone(),
            cache.clone(),
            sessions.clone(),
            config.health.clone(),
        );
        let recorder = MetricsRecorder::new(cherry_picker.clone(), metrics_store, &config.metrics);
        let repositories = Repositories::new(
            applications,
            blockchains,
            load_balancers,
            &config.repositories,
        );
        let cipher = config.secret_key_cipher()?;
        let rate_limiter = RateLimiter::new(cache.clone(), config.rate_limit.clone());

        Ok(RelayDispatcher {
            config: Arc::new(config),
            client,
            cache,
            sessions,
            validator,
            cherry_picker,
            recorder,
            repositories,
            altruist: AltruistClient::new(),
            rate_limiter,
            cipher,
        })
    }
}

#[derive(Clone)]
pub struct RelayDispatcher {
    config: Arc<GatewayConfig>,
    client: SharedProtocolClient,
    cache: TieredCache,
    sessions: SessionManager,
    validator: NodeValidator,
    cherry_picker: CherryPicker,
    recorder: MetricsRecorder,
    repositories: Repositories,
    altruist: AltruistClient,
    rate_limiter: RateLimiter,
    cipher: Option<SecretKeyCipher>,
}

/// Everything one relay carries through its attempts.
struct RelayContext<'a> {
    request: &'a RelayRequest,
    application: &'a Application,
    settings: &'a GatewaySettings,
    options: &'a RelayOptions,
    sticker: Option<&'a NodeSticker>,
    method_label: &'a str,
}

enum AttemptOutcome {
    Served(RelayResponse),
    /// The node failed; another attempt may pick a different one.
    NodeFailed,
    /// Nothing left to try on the network for this relay.
    Abandoned,
}

impl RelayDispatcher {
    pub fn metrics_recorder(&self) -> &MetricsRecorder {
        &self.recorder
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Relays on behalf of the application `application_id`.
    pub async fn send_application_relay(
        &self,
        application_id: &str,
        request: &RelayRequest,
        options: RelayOptions,
    ) -> Result<RelayResponse> {
        self.rate_limit(application_id, request).await?;
        let application = self.application(application_id).await?;
        self.send_relay(request, &application, options).await
    }

    /// Relays through a load balancer: one of its applications is picked by
    /// quality, or reused from the client's sticky binding.
    #[instrument(
        name = "dispatcher::load_balancer_relay",
        skip(self, request, options),
        fields(request_id = %request.request_id),
        level = "debug"
    )]
    pub async fn send_load_balancer_relay(
        &self,
        load_balancer_id: &str,
        request: &RelayRequest,
        options: RelayOptions,
    ) -> Result<RelayResponse> {
        self.rate_limit(load_balancer_id, request).await?;
        let load_balancer = self
            .repositories
            .load_balancer(load_balancer_id)
            .await
            .map_err(|err| {
                warn!(%err, "load balancer lookup failed");
                GatewayError::CollaboratorUnavailable("load balancer repository")
            })?
            .ok_or_else(|| GatewayError::Configuration("unknown load balancer".to_string()))?;
        let blockchain = self.resolve_blockchain(&request.host).await?;

        let payload = RequestPayload::parse(&request.data);
        let sticker = match (&load_balancer.stickiness, request.client_ip) {
            (Some(stickiness), Some(ip)) => Some(NodeSticker::new(
                self.cache.clone(),
                stickiness.clone(),
                &self.config.stickiness,
                &StickyClient {
                    scope: &load_balancer.id,
                    chain: &blockchain.id,
                    ip,
                    rpc_id: payload.rpc_id(),
                },
            )),
            _ => None,
        };

        let sticky_application = match &sticker {
            Some(sticker) => sticker
                .binding()
                .await
                .map(|binding| binding.application_id)
                .filter(|id| load_balancer.application_ids.contains(id)),
            None => None,
        };
        let application_id = match sticky_application {
            Some(id) => id,
            None => self
                .cherry_picker
                .cherry_pick_application(&load_balancer.application_ids, &blockchain.id)
                .await
                .ok_or_else(|| {
                    GatewayError::Configuration("load balancer has no applications".to_string())
                })?,
        };
        let application = self.application(&application_id).await?;

        let options = RelayOptions {
            request_timeout: options
                .request_timeout
                .or(load_balancer.request_timeout_ms.map(Duration::from_millis)),
            relay_retries: options.relay_retries.or(load_balancer.relay_retries),
            overall_timeout: options.overall_timeout,
        };
        let settings = load_balancer
            .gateway_settings
            .as_ref()
            .unwrap_or(&application.gateway_settings);
        let method_label = payload.method_label();
        self.dispatch(RelayContext {
            request,
            application: &application,
            settings,
            options: &options,
            sticker: sticker.as_ref(),
            method_label: &method_label,
        })
        .await
    }

    /// Relays `request` for `application`, retrying on other nodes and
    /// falling back to an altruist once the attempts are spent.
    #[instrument(
        name = "dispatcher::send_relay",
        skip_all,
        fields(request_id = %request.request_id, application = %application.id),
        level = "debug"
    )]
    pub async fn send_relay(
        &self,
        request: &RelayRequest,
        application: &Application,
        options: RelayOptions,
    ) -> Result<RelayResponse> {
        let method_label = RequestPayload::parse(&request.data).method_label();
        self.dispatch(RelayContext {
            request,
            application,
            settings: &application.gateway_settings,
            options: &options,
            sticker: None,
            method_label: &method_label,
        })
        .await
    }

    async fn dispatch(&self, ctx: RelayContext<'_>) -> Result<RelayResponse> {
        let started = Instant::now();
        check_caller(ctx.settings, ctx.request, self.cipher.as_ref())?;
        let blockchain = self.resolve_blockchain(&ctx.request.host).await?;
        check_call(
            ctx.settings,
            &blockchain,
            &RequestPayload::parse(&ctx.request.data),
        )?;

        let retries = ctx
            .options
            .relay_retries
            .unwrap_or(self.config.relay_retries);
        let overall_timeout = ctx
            .options
            .overall_timeout
            .unwrap_or(Duration::from_millis(self.config.overall_timeout_ms));

        for attempt in 0..=retries {
            let elapsed = started.elapsed();
            if elapsed > overall_timeout {
                warn!(attempt, elapsed_ms = elapsed.as_millis() as u64, "relay ran out of time");
                return Err(GatewayError::Timeout {
                    elapsed_ms: elapsed.as_millis() as u64,
                });
            }

            let blockchain = if attempt == 0 {
                blockchain.clone()
            } else {
                self.resolve_blockchain(&ctx.request.host).await?
            };
            match self.attempt(&ctx, &blockchain, attempt).await {
                AttemptOutcome::Served(response) => return Ok(response),
                AttemptOutcome::NodeFailed => {}
                AttemptOutcome::Abandoned => break,
            }
        }

        self.fallback(&ctx, &blockchain).await
    }

    async fn attempt(
        &self,
        ctx: &RelayContext<'_>,
        blockchain: &Blockchain,
        attempt: u32,
    ) -> AttemptOutcome {
        let chain = blockchain.id.as_str();
        let application = ctx.application;
        let session = match self
            .sessions
            .get_session(application.public_key(), chain)
            .await
        {
            Ok(session) => session,
            Err(err) => {
                if err == ProtocolError::InvalidSession {
                    self.sessions
                        .invalidate_session(application.public_key(), chain)
                        .await;
                }
                warn!(%err, chain, attempt, "no session to relay with");
                return AttemptOutcome::Abandoned;
            }
        };

        let exhausted = self.sessions.exhausted_nodes(&session).await;
        let mut nodes: Vec<Node> = session
            .nodes
            .iter()
            .filter(|node| !node.jailed && !exhausted.contains(&node.public_key))
            .cloned()
            .collect();
        for check in HealthCheck::for_blockchain(blockchain) {
            if nodes.is_empty() {
                break;
            }
            nodes = self
                .validator
                .validate(
                    &check,
                    ValidationContext {
                        chain,
                        session: &session,
                        nodes: &nodes,
                        auth_token: &application.auth_token,
                    },
                )
                .await;
        }
        if nodes.is_empty() {
            warn!(chain, attempt, session_key = %session.key, "no healthy node left in session");
            return AttemptOutcome::Abandoned;
        }

        let sticky = match ctx.sticker {
            Some(sticker) => sticker.get_sticky_node(&nodes, &exhausted).await,
            None => None,
        };
        let node = match sticky {
            Some(node) => node,
            None => match self
                .cherry_picker
                .cherry_pick_node(application, &nodes, chain)
                .await
            {
                Some(node) => node,
                None => return AttemptOutcome::Abandoned,
            },
        };

        let timeout = ctx
            .options
            .request_timeout
            .or(blockchain.request_timeout_ms.map(Duration::from_millis))
            .unwrap_or(Duration::from_millis(self.config.request_timeout_ms));
        let call = RelayCall {
            payload: &ctx.request.data,
            chain,
            auth_token: &application.auth_token,
            node: &node,
            path: ctx
                .request
                .path
                .as_deref()
                .or(blockchain.path.as_deref()),
            method: &ctx.request.method,
            timeout,
        };

        let relay_started = Instant::now();
        let result = relay_with_timeout(self.client.as_ref(), call)
            .await
            .and_then(|raw| conform(blockchain, raw));
        let elapsed = relay_started.elapsed();

        let error_key = format!("{chain}-{}-errors", node.public_key);
        match result {
            Ok((raw, body)) => {
                if let Err(err) = self.cache.del(&[error_key]).await {
                    warn!(%err, "failed to reset node error counter");
                }
                self.recorder
                    .record_metric(RelayOutcome {
                        request_id: &ctx.request.request_id,
                        application_id: &application.id,
                        application_public_key: application.public_key(),
                        chain,
                        node: Some(&node),
                        method: ctx.method_label,
                        elapsed,
                        result_code: SUCCESS_CODE,
                        bytes: raw.len(),
                        fallback: false,
                        bad_timeout: None,
                    })
                    .await;
                if let Some(sticker) = ctx.sticker {
                    let origin = ctx.request.origin.as_deref();
                    sticker
                        .set_stickiness_key(&application.id, &node.address, origin)
                        .await;
                }
                debug!(chain, attempt, node = %node.public_key, "relay served");
                AttemptOutcome::Served(RelayResponse {
                    body,
                    fallback: false,
                })
            }
            Err(err) => {
                warn!(%err, chain, attempt, node = %node.public_key, "relay attempt failed");
                match err {
                    ProtocolError::MaxRelaysExhausted => {
                        self.sessions
                            .evict_node(chain, &session, &node.public_key)
                            .await;
                    }
                    ProtocolError::InvalidSession => {
                        self.sessions
                            .invalidate_session(application.public_key(), chain)
                            .await;
                    }
                    ProtocolError::OutOfSync(_) => {
                        self.validator
                            .forget(CheckKind::Sync, chain, &session)
                            .await;
                    }
                    _ => {}
                }
                let ttl = Duration::from_secs(self.config.node_error_ttl_secs);
                if let Err(err) = self.cache.incr_with_ttl(&error_key, ttl).await {
                    warn!(%err, "failed to count node error");
                }
                self.recorder
                    .record_metric(RelayOutcome {
                        request_id: &ctx.request.request_id,
                        application_id: &application.id,
                        application_public_key: application.public_key(),
                        chain,
                        node: Some(&node),
                        method: ctx.method_label,
                        elapsed,
                        result_code: FAILURE_CODE,
                        bytes: 0,
                        fallback: false,
                        bad_timeout: Some(BadTimeoutContext {
                            session: &session,
                            request_timeout: timeout,
                            archival: blockchain.is_archival(),
                        }),
                    })
                    .await;
                if let Some(sticker) = ctx.sticker {
                    sticker.increment_error_count(&node.address).await;
                }
                AttemptOutcome::NodeFailed
            }
        }
    }

    async fn fallback(
        &self,
        ctx: &RelayContext<'_>,
        blockchain: &Blockchain,
    ) -> Result<RelayResponse> {
        let url = self
            .config
            .altruists_for(&blockchain.id)
            .choose(&mut rand::rng())
            .cloned();
        let Some(url) = url else {
            warn!(chain = %blockchain.id, "relay attempts exhausted and no altruist configured");
            return Err(GatewayError::Exhausted);
        };

        let started = Instant::now();
        let result = self
            .altruist
            .relay(
                &url,
                &ctx.request.data,
                &ctx.request.method,
                ctx.request.path.as_deref().or(blockchain.path.as_deref()),
                Duration::from_millis(self.config.altruist_timeout_ms),
            )
            .await;
        let elapsed = started.elapsed();

        let (result_code, bytes) = match &result {
            Ok(raw) => (SUCCESS_CODE, raw.len()),
            Err(_) => (FAILURE_CODE, 0),
        };
        self.recorder
            .record_metric(RelayOutcome {
                request_id: &ctx.request.request_id,
                application_id: &ctx.application.id,
                application_public_key: ctx.application.public_key(),
                chain: &blockchain.id,
                node: None,
                method: ctx.method_label,
                elapsed,
                result_code,
                bytes,
                fallback: true,
                bad_timeout: None,
            })
            .await;

        match result {
            Ok(raw) => {
                info!(chain = %blockchain.id, "relay served by altruist");
                let body = if blockchain.enforces_json() {
                    match serde_json::from_str(&raw) {
                        Ok(value) => RelayBody::Json(value),
                        Err(_) => RelayBody::Raw(raw),
                    }
                } else {
                    RelayBody::Raw(raw)
                };
                Ok(RelayResponse {
                    body,
                    fallback: true,
                })
            }
            Err(err) => {
                warn!(%err, chain = %blockchain.id, "altruist fallback failed");
                Err(GatewayError::Exhausted)
            }
        }
    }

    async fn application(&self, id: &str) -> Result<Arc<Application>> {
        self.repositories
            .application(id)
            .await
            .map_err(|err| {
                warn!(%err, "application lookup failed");
                GatewayError::CollaboratorUnavailable("application repository")
            })?
            .ok_or_else(|| GatewayError::Configuration("unknown application".to_string()))
    }

    async fn resolve_blockchain(&self, host: &str) -> Result<Blockchain> {
        self.repositories
            .resolve_blockchain(host)
            .await
            .map_err(|err| {
                warn!(%err, "blockchain lookup failed");
                GatewayError::CollaboratorUnavailable("blockchain repository")
            })?
            .ok_or_else(|| GatewayError::Configuration("unknown blockchain".to_string()))
    }

    async fn rate_limit(&self, scope: &str, request: &RelayRequest) -> Result<()> {
        self.rate_limiter
            .check(&RequestIdentity {
                application_id: Some(scope.to_string()),
                client_ip: request.client_ip,
            })
            .await
            .map_err(|throttled| {
                debug!(key = %throttled.key, "relay rate limited");
                GatewayError::RateLimited {
                    retry_after_ms: throttled.retry_after.as_millis() as u64,
                }
            })
    }
}

/// Applies the chain's result format to a node answer. Answers breaking it
/// count as node errors.
fn conform(blockchain: &Blockchain, raw: String) -> Result<(String, RelayBody), ProtocolError> {
    if !blockchain.enforces_json() {
        return Ok((raw.clone(), RelayBody::Raw(raw)));
    }

    let value: Value = serde_json::from_str(&raw)
        .map_err(|_| ProtocolError::Generic("node answer is not JSON".to_string()))?;
    let bare_error = value.as_object().is_some_and(|envelope| {
        envelope.get("error").is_some_and(|error| !error.is_null())
            && !envelope.contains_key("result")
    });
    if bare_error {
        return Err(ProtocolError::Generic(
            "node answered with an error envelope".to_string(),
        ));
    }
    Ok((raw, RelayBody::Json(value)))
}
