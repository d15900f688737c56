//! Narrow interface to the decentralized network: session dispatch and relay
//! transport.

use std::{
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{
    AuthToken,
    Node,
    Session,
};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("node has exhausted its relays for this session")]
    MaxRelaysExhausted,
    #[error("session is no longer valid")]
    InvalidSession,
    #[error("node is out of sync: {0}")]
    OutOfSync(String),
    #[error("relay timed out")]
    Timeout,
    #[error("{0}")]
    Generic(String),
}

/// One relay towards a single node.
#[derive(Debug, Clone, Copy)]
pub struct RelayCall<'a> {
    pub payload: &'a str,
    pub chain: &'a str,
    pub auth_token: &'a AuthToken,
    pub node: &'a Node,
    pub path: Option<&'a str>,
    pub method: &'a str,
    pub timeout: Duration,
}

/// Elevated-verification relay issued against a whole session.
#[derive(Debug, Clone, Copy)]
pub struct ChallengeCall<'a> {
    pub payload: &'a str,
    pub chain: &'a str,
    pub auth_token: &'a AuthToken,
    pub session: &'a Session,
    pub path: Option<&'a str>,
    pub timeout: Duration,
}

#[async_trait]
pub trait ProtocolClient: Send + Sync {
    async fn get_session(
        &self,
        application_public_key: &str,
        chain: &str,
    ) -> Result<Session, ProtocolError>;

    async fn send_relay(&self, call: RelayCall<'_>) -> Result<String, ProtocolError>;

    async fn send_challenge(&self, call: ChallengeCall<'_>) -> Result<String, ProtocolError>;
}

pub type SharedProtocolClient = Arc<dyn ProtocolClient>;

/// Sends `call` and converts an elapsed per-call budget into [`ProtocolError::Timeout`].
pub(crate) async fn relay_with_timeout(
    client: &dyn ProtocolClient,
    call: RelayCall<'_>,
) -> Result<String, ProtocolError> {
    match tokio::time::timeout(call.timeout, client.send_relay(call)).await {
        Ok(result) => result,
        Err(_) => Err(ProtocolError::Timeout),
    }
}
