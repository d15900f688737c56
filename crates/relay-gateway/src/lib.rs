//! Relay gateway.
//!
//! Routes client JSON-RPC relays to nodes of a decentralized serving network.
//! A relay resolves its chain from the request host, passes the caller's
//! access policy, and is sent to a node that survived the chain's health
//! checks and ranks well in the quality log. Failed attempts retry on other
//! nodes until the budget runs out, then fall back to a trusted altruist
//! endpoint.
//!
//! [`RelayDispatcherBuilder`] wires every component from a [`GatewayConfig`]
//! and the collaborators the embedding service provides: a
//! [`ProtocolClient`](protocol::ProtocolClient), the configuration
//! repositories, the shared store and the metrics store.

mod macros;

pub mod cache;
pub mod cherry_picker;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod health;
pub mod metrics_recorder;
pub mod models;
pub mod protocol;
pub mod quality;
pub mod rate_limiter;
pub mod repository;
pub mod secret;
pub mod session;
pub mod sticker;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use config::GatewayConfig;
pub use dispatcher::{
    RelayBody,
    RelayDispatcher,
    RelayDispatcherBuilder,
    RelayOptions,
    RelayRequest,
    RelayResponse,
};
pub use error::{
    GatewayError,
    Result,
};
