//! Records the gateway reads from its configuration repositories and the
//! protocol client. None of them are mutated by the gateway.

use serde::{
    Deserialize,
    Serialize,
};

/// A serving node of the decentralized network.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Node {
    pub public_key: String,
    pub address: String,
    pub service_url: String,
    #[serde(default)]
    pub staked_tokens: u64,
    #[serde(default)]
    pub jailed: bool,
}

/// Nodes assigned to an (application, chain) pair for a bounded number of blocks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub key: String,
    pub block_height: u64,
    pub nodes: Vec<Node>,
}

/// Signed credential proving an application may relay through the network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthToken {
    pub version: String,
    pub client_public_key: String,
    pub application_public_key: String,
    pub signature: String,
}

/// Per-application access policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewaySettings {
    /// Stored secret: 32 hex characters in plaintext, or the hex encoding of
    /// an encrypted secret.
    #[serde(default)]
    pub secret_key: Option<String>,
    #[serde(default)]
    pub secret_key_required: bool,
    #[serde(default)]
    pub whitelist_origins: Vec<String>,
    #[serde(default)]
    pub whitelist_user_agents: Vec<String>,
    #[serde(default)]
    pub whitelist_blockchains: Vec<String>,
    #[serde(default)]
    pub whitelist_methods: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Application {
    pub id: String,
    pub auth_token: AuthToken,
    #[serde(default)]
    pub gateway_settings: GatewaySettings,
}

impl Application {
    pub fn public_key(&self) -> &str {
        &self.auth_token.application_public_key
    }
}

/// Probe relay sent to every node of a session by a health check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeRequest {
    pub body: String,
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainIdCheckOptions {
    #[serde(flatten)]
    pub probe: ProbeRequest,
    /// Chain id the node must report, hex (`0x64`) or decimal (`100`).
    pub expected_chain_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCheckOptions {
    #[serde(flatten)]
    pub probe: ProbeRequest,
    /// Dotted path to the block height in the probe response.
    #[serde(default = "default_result_key")]
    pub result_key: String,
    /// How many blocks a node may trail the highest reported height.
    #[serde(default)]
    pub allowance: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchivalCheckOptions {
    #[serde(flatten)]
    pub probe: ProbeRequest,
    #[serde(default = "default_result_key")]
    pub result_key: String,
    /// Value a pruned node answers with. Archival nodes answer anything else.
    pub comparator: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeCheckOptions {
    #[serde(flatten)]
    pub probe: ProbeRequest,
    /// Terminal total difficulty a post-merge node reports.
    pub terminal_total_difficulty: String,
}

fn default_result_key() -> String {
    "result".to_string()
}

/// Payload format a chain's relay responses must follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResultFormat {
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blockchain {
    pub id: String,
    /// Subdomains routed to this chain.
    pub aliases: Vec<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub enforce_result: Option<ResultFormat>,
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
    #[serde(default)]
    pub log_limit_blocks: Option<u64>,
    #[serde(default)]
    pub chain_id_check: Option<ChainIdCheckOptions>,
    #[serde(default)]
    pub sync_check: Option<SyncCheckOptions>,
    #[serde(default)]
    pub archival_check: Option<ArchivalCheckOptions>,
    #[serde(default)]
    pub merge_check: Option<MergeCheckOptions>,
}

impl Blockchain {
    /// Archival chains evict nodes that keep timing out.
    pub fn is_archival(&self) -> bool {
        self.archival_check.is_some()
    }

    pub fn enforces_json(&self) -> bool {
        self.enforce_result == Some(ResultFormat::Json)
    }
}

/// Client pinning policy of a load balancer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StickinessOptions {
    /// How long a binding lives (seconds).
    pub duration_secs: u64,
    /// Key bindings on the next expected JSON-RPC id as well.
    #[serde(default)]
    pub use_rpc_id: bool,
    /// Relays served through one binding before it is dropped.
    #[serde(default)]
    pub relays_limit: Option<u64>,
    /// Origins allowed to create bindings. Empty means any origin.
    #[serde(default)]
    pub sticky_origins: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBalancer {
    pub id: String,
    pub application_ids: Vec<String>,
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
    #[serde(default)]
    pub relay_retries: Option<u32>,
    #[serde(default)]
    pub stickiness: Option<StickinessOptions>,
    /// Overrides the access policy of the picked application.
    #[serde(default)]
    pub gateway_settings: Option<GatewaySettings>,
}
