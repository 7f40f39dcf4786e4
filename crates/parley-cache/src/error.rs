use std::time::Duration;

/// Failures of the recency cache. Callers in the delivery path treat every
/// variant as a miss.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache {op} timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },

    #[error("cache backend error: {0}")]
    Backend(String),

    #[error("cache backend unavailable")]
    Unavailable,

    #[error("cache serialization error: {0}")]
    Serialization(String),

    /// The message has no conversation of the requested kind.
    #[error("message {0} cannot be cached as {1}")]
    WrongKind(u64, &'static str),
}

impl From<redis::RedisError> for CacheError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_connection_dropped() || e.is_connection_refusal() {
            CacheError::Unavailable
        } else {
            CacheError::Backend(e.to_string())
        }
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::Serialization(e.to_string())
    }
}
