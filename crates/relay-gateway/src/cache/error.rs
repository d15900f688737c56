//! cache error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("redis backend error: {0}")]
    Backend(#[source] redis::RedisError),
    #[error("blocking cache task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("failed to encode value for '{key}': {source}")]
    Encode {
        key: String,
        source: serde_json::Error,
    },
    #[error("failed to decode value for '{key}': {source}")]
    Decode {
        key: String,
        source: serde_json::Error,
    },
    #[error("value at '{0}' is not an integer")]
    NotAnInteger(String),
    #[error("wrong value type stored at '{0}'")]
    WrongType(String),
}
