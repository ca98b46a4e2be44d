//! Error types for event bus operations

use thiserror::Error;

/// Event bus errors
#[derive(Error, Debug)]
pub enum EventBusError {
    /// Redis connection or operation error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Message serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The background subscription driver is gone
    #[error("Subscription driver closed")]
    DriverClosed,
}
