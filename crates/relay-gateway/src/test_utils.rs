//! Doubles and fixtures for exercising the gateway without a network.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{
            AtomicUsize,
            Ordering,
        },
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{
    dispatcher::RelayRequest,
    metrics_recorder::{
        MetricRow,
        MetricsStore,
        MetricsStoreError,
    },
    models::{
        Application,
        AuthToken,
        Blockchain,
        GatewaySettings,
        LoadBalancer,
        Node,
        ResultFormat,
        Session,
    },
    protocol::{
        ChallengeCall,
        ProtocolClient,
        ProtocolError,
        RelayCall,
    },
    repository::{
        ApplicationRepository,
        BlockchainRepository,
        LoadBalancerRepository,
        RepositoryError,
    },
};

pub const DEFAULT_RELAY_RESPONSE: &str = r#"{"jsonrpc":"2.0","id":1,"result":"0x1"}"#;

type Responder = Arc<dyn Fn(&RelayCall<'_>) -> Result<String, ProtocolError> + Send + Sync>;

/// Protocol client answering from a fixed session and a scripted responder.
pub struct ScriptedProtocolClient {
    session: Result<Session, ProtocolError>,
    responder: Responder,
    delay: Option<Duration>,
    session_calls: AtomicUsize,
    relay_calls: AtomicUsize,
    challenge_calls: AtomicUsize,
    relayed: Mutex<Vec<String>>,
}

impl ScriptedProtocolClient {
    pub fn new(session: Session) -> Self {
        Self {
            session: Ok(session),
            responder: Arc::new(|_| Ok(DEFAULT_RELAY_RESPONSE.to_string())),
            delay: None,
            session_calls: AtomicUsize::new(0),
            relay_calls: AtomicUsize::new(0),
            challenge_calls: AtomicUsize::new(0),
            relayed: Mutex::new(Vec::new()),
        }
    }

    pub fn with_responder<F>(mut self, responder: F) -> Self
    where
        F: Fn(&RelayCall<'_>) -> Result<String, ProtocolError> + Send + Sync + 'static,
    {
        self.responder = Arc::new(responder);
        self
    }

    /// Every relay waits `delay` before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn failing_sessions(mut self, err: ProtocolError) -> Self {
        self.session = Err(err);
        self
    }

    pub fn session_calls(&self) -> usize {
        self.session_calls.load(Ordering::SeqCst)
    }

    pub fn relay_calls(&self) -> usize {
        self.relay_calls.load(Ordering::SeqCst)
    }

    pub fn challenge_calls(&self) -> usize {
        self.challenge_calls.load(Ordering::SeqCst)
    }

    /// Public keys of the relayed nodes, in call order.
    pub fn relayed_nodes(&self) -> Vec<String> {
        self.relayed.lock().clone()
    }
}

#[async_trait]
impl ProtocolClient for ScriptedProtocolClient {
    async fn get_session(
        &self,
        _application_public_key: &str,
        _chain: &str,
    ) -> Result<Session, ProtocolError> {
        self.session_calls.fetch_add(1, Ordering::SeqCst);
        self.session.clone()
    }

    async fn send_relay(&self, call: RelayCall<'_>) -> Result<String, ProtocolError> {
        self.relay_calls.fetch_add(1, Ordering::SeqCst);
        self.relayed.lock().push(call.node.public_key.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        (self.responder)(&call)
    }

    async fn send_challenge(&self, _call: ChallengeCall<'_>) -> Result<String, ProtocolError> {
        self.challenge_calls.fetch_add(1, Ordering::SeqCst);
        Ok(r#"{"ok":true}"#.to_string())
    }
}

pub fn node(index: usize) -> Node {
    Node {
        public_key: format!("node{index}"),
        address: format!("address{index}"),
        service_url: format!("https://node{index}.example.com"),
        staked_tokens: 15_000,
        jailed: false,
    }
}

pub fn session_with(nodes: usize) -> Session {
    Session {
        key: "session-key".to_string(),
        block_height: 1,
        nodes: (0..nodes).map(node).collect(),
    }
}

pub fn application() -> Application {
    Application {
        id: "app".to_string(),
        auth_token: AuthToken {
            version: "0.0.1".to_string(),
            client_public_key: "client".to_string(),
            application_public_key: "app-public-key".to_string(),
            signature: "sig".to_string(),
        },
        gateway_settings: GatewaySettings::default(),
    }
}

pub fn blockchain() -> Blockchain {
    Blockchain {
        id: "0021".to_string(),
        aliases: vec!["eth-mainnet".to_string()],
        path: None,
        enforce_result: Some(ResultFormat::Json),
        request_timeout_ms: None,
        log_limit_blocks: None,
        chain_id_check: None,
        sync_check: None,
        archival_check: None,
        merge_check: None,
    }
}

pub fn load_balancer(id: &str, application_ids: &[&str]) -> LoadBalancer {
    LoadBalancer {
        id: id.to_string(),
        application_ids: application_ids.iter().map(|id| id.to_string()).collect(),
        request_timeout_ms: None,
        relay_retries: None,
        stickiness: None,
        gateway_settings: None,
    }
}

pub fn relay_request() -> RelayRequest {
    RelayRequest {
        data: r#"{"jsonrpc":"2.0","id":1,"method":"eth_blockNumber","params":[]}"#.to_string(),
        path: None,
        method: "POST".to_string(),
        host: "eth-mainnet.gateway.example.com".to_string(),
        request_id: "request-1".to_string(),
        origin: None,
        user_agent: None,
        secret_key: None,
        client_ip: None,
    }
}

/// Backs all three configuration repositories with in-process maps.
#[derive(Default)]
pub struct InMemoryRepository {
    applications: Mutex<HashMap<String, Application>>,
    blockchains: Mutex<Vec<Blockchain>>,
    load_balancers: Mutex<HashMap<String, LoadBalancer>>,
    application_reads: AtomicUsize,
}

impl InMemoryRepository {
    pub fn add_application(&self, application: Application) {
        self.applications
            .lock()
            .insert(application.id.clone(), application);
    }

    pub fn add_blockchain(&self, blockchain: Blockchain) {
        self.blockchains.lock().push(blockchain);
    }

    pub fn add_load_balancer(&self, load_balancer: LoadBalancer) {
        self.load_balancers
            .lock()
            .insert(load_balancer.id.clone(), load_balancer);
    }

    pub fn application_reads(&self) -> usize {
        self.application_reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ApplicationRepository for InMemoryRepository {
    async fn get_application(&self, id: &str) -> Result<Option<Application>, RepositoryError> {
        self.application_reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.applications.lock().get(id).cloned())
    }
}

#[async_trait]
impl BlockchainRepository for InMemoryRepository {
    async fn list_blockchains(&self) -> Result<Vec<Blockchain>, RepositoryError> {
        Ok(self.blockchains.lock().clone())
    }
}

#[async_trait]
impl LoadBalancerRepository for InMemoryRepository {
    async fn get_load_balancer(&self, id: &str) -> Result<Option<LoadBalancer>, RepositoryError> {
        Ok(self.load_balancers.lock().get(id).cloned())
    }
}

/// Keeps every inserted row, or rejects them all.
#[derive(Default)]
pub struct RecordingMetricsStore {
    rows: Mutex<Vec<MetricRow>>,
    failing: bool,
}

impl RecordingMetricsStore {
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    pub fn rows(&self) -> Vec<MetricRow> {
        self.rows.lock().clone()
    }
}

#[async_trait]
impl MetricsStore for RecordingMetricsStore {
    async fn insert_rows(&self, rows: Vec<MetricRow>) -> Result<(), MetricsStoreError> {
        if self.failing {
            return Err(MetricsStoreError::Rejected {
                rows: rows.len(),
                reason: "store unavailable".to_string(),
            });
        }
        self.rows.lock().extend(rows);
        Ok(())
    }
}
