//! Cache keys for conversations.
//!
//! A private conversation is an unordered user pair, so both directions map to
//! the same key with the smaller id first.

use std::fmt;

use crate::ids::{RoomId, UserId};
use crate::message::{Message, Route};

pub const PRIVATE_PREFIX: &str = "conv:private:";
pub const GROUP_PREFIX: &str = "conv:group:";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConversationKey {
    Private { lo: UserId, hi: UserId },
    Group(RoomId),
}

impl ConversationKey {
    pub fn private(a: UserId, b: UserId) -> Self {
        if a <= b {
            Self::Private { lo: a, hi: b }
        } else {
            Self::Private { lo: b, hi: a }
        }
    }

    pub fn group(room: RoomId) -> Self {
        Self::Group(room)
    }

    /// Key a message would be cached under. System and heartbeat traffic is
    /// never cached.
    pub fn for_message(msg: &Message) -> Option<Self> {
        match msg.route {
            Route::Private { target_id } => Some(Self::private(msg.sender_id, target_id)),
            Route::Group { room_id } => Some(Self::Group(room_id)),
            Route::System | Route::Heartbeat => None,
        }
    }

    pub fn involves(&self, user: UserId) -> bool {
        match self {
            Self::Private { lo, hi } => *lo == user || *hi == user,
            Self::Group(_) => false,
        }
    }

    pub fn parse(key: &str) -> Option<Self> {
        if let Some(rest) = key.strip_prefix(PRIVATE_PREFIX) {
            let (a, b) = rest.split_once(':')?;
            return Some(Self::private(a.parse().ok()?, b.parse().ok()?));
        }
        key.strip_prefix(GROUP_PREFIX)
            .and_then(|room| room.parse().ok())
            .map(Self::Group)
    }

    /// Scan patterns matching every private key that contains `user`.
    pub fn private_patterns_for(user: UserId) -> [String; 2] {
        [
            format!("{PRIVATE_PREFIX}{user}:*"),
            format!("{PRIVATE_PREFIX}*:{user}"),
        ]
    }

    /// Scan pattern matching every conversation key.
    pub fn all_pattern() -> &'static str {
        "conv:*"
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Private { lo, hi } => write!(f, "{PRIVATE_PREFIX}{lo}:{hi}"),
            Self::Group(room) => write!(f, "{GROUP_PREFIX}{room}"),
        }
    }
}
