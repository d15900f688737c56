use std::fmt;

use serde::Serialize;
use thiserror::Error;

pub type Result<T, E = GatewayError> = std::result::Result<T, E>;

/// Which caller-side precondition rejected a relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizationFailure {
    SecretKey,
    Origin,
    UserAgent,
    Blockchain,
    Method,
}

impl fmt::Display for AuthorizationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            AuthorizationFailure::SecretKey => "secret key does not match",
            AuthorizationFailure::Origin => "origin is not whitelisted",
            AuthorizationFailure::UserAgent => "user agent is not whitelisted",
            AuthorizationFailure::Blockchain => "blockchain is not whitelisted",
            AuthorizationFailure::Method => "method is not whitelisted",
        };
        f.write_str(reason)
    }
}

/// Top level error type for the gateway.
///
/// Node-level failures never show up here: they are recorded and retried by
/// the dispatcher. Messages are safe to hand to callers and never carry node
/// keys, cache keys or lock state.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("bad request: {0}")]
    Configuration(String),
    #[error("unauthorized: {0}")]
    Authorization(AuthorizationFailure),
    #[error("too many requests, retry in {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },
    #[error("relay timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },
    #[error("internal JSON-RPC connection error")]
    Exhausted,
    #[error("{0} unavailable")]
    CollaboratorUnavailable(&'static str),
}

impl GatewayError {
    /// HTTP-equivalent status for the error.
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::InvalidConfig(_) => 500,
            GatewayError::Configuration(_) => 400,
            GatewayError::Authorization(_) => 403,
            GatewayError::RateLimited { .. } => 429,
            GatewayError::Timeout { .. } | GatewayError::Exhausted => 504,
            GatewayError::CollaboratorUnavailable(_) => 503,
        }
    }
}

/// Structured error payload handed back to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorResponse {
    pub code: u16,
    pub message: String,
}

impl From<&GatewayError> for ErrorResponse {
    fn from(err: &GatewayError) -> Self {
        Self {
            code: err.status_code(),
            message: err.to_string(),
        }
    }
}

impl From<GatewayError> for ErrorResponse {
    fn from(err: GatewayError) -> Self {
        (&err).into()
    }
}
