//! Error types for the hub, the session transport and the delivery path.

use std::time::Duration;

use parley_cache::CacheError;
use parley_core::UserId;
use parley_settings::SettingsError;
use parley_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("user {0} is not connected")]
    NotConnected(UserId),

    /// The session exists but its outbound buffer has no room. The session
    /// is left registered; only fan-out evicts.
    #[error("outbound buffer full for user {0}")]
    BufferFull(UserId),

    #[error("invalid user id {0}")]
    InvalidUser(UserId),

    #[error("connection hub has stopped")]
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,

    #[error("no frame received within {0:?}")]
    ReadTimeout(Duration),

    #[error("write did not complete within {0:?}")]
    WriteTimeout(Duration),

    #[error("frame of {size} bytes exceeds limit of {limit}")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("transport error: {0}")]
    Io(String),
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("invalid message: {0}")]
    Validation(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Hub(#[from] HubError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("telemetry error: {0}")]
    Telemetry(String),
}
