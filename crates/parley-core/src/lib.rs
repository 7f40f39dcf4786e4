//! # parley-core
//!
//! Vocabulary shared by every parley crate.
//!
//! - [`ids`]: user, room, message and connection identifiers
//! - [`message`]: the tagged [`Message`] record and send drafts
//! - [`conversation`]: cache key derivation for private and group conversations

#![deny(unsafe_code)]

pub mod conversation;
pub mod ids;
pub mod message;

pub use conversation::ConversationKey;
pub use ids::{ConnectionId, MessageId, RoomId, UserId};
pub use message::{
    MediaKind, Message, MessageDraft, MessageKind, NewMessage, ParseKindError, Route,
};
