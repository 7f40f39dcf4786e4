//! Durable message store.
//!
//! The store is the authoritative record of every conversation; the recency
//! cache in front of it may lose entries at any time.

#![deny(unsafe_code)]

pub mod database;
pub mod error;
pub mod messages;
pub mod row_helpers;
pub mod schema;

pub use database::Database;
pub use error::StoreError;
pub use messages::{MessageRepo, MessageStore, SqliteMessageStore};
