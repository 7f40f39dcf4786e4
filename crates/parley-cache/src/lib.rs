//! Recency cache for conversation history.
//!
//! The cache keeps the newest messages of each conversation in a list store
//! (Redis in production, [`MemoryBackend`] otherwise). It is never
//! authoritative: any entry may be missing, expired or evicted, and readers
//! fall back to the durable store.

#![deny(unsafe_code)]

pub mod backend;
pub mod error;
pub mod memory;
pub mod recency;
pub mod redis_backend;

pub use backend::ListBackend;
pub use error::CacheError;
pub use memory::MemoryBackend;
pub use recency::{CacheConfig, RecencyCache};
pub use redis_backend::RedisBackend;
