//! Conversation payload model.
//!
//! A [`Message`] carries its routing as a tagged [`Route`] so that exactly one
//! of target user / room is present for the kinds that need one. The JSON
//! shape is flat:
//!
//! ```json
//! {"id":1,"sender_id":3,"kind":"private","target_id":4,"media":"text",
//!  "content":"hi","created_at":"...","updated_at":"..."}
//! ```

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{MessageId, RoomId, UserId};

/// A stored or wire kind name that matches no variant.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ParseKindError {
    #[error("unknown media kind: {0}")]
    Media(String),
    #[error("unknown message kind: {0}")]
    Message(String),
}

/// Attachment type of a message body.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    #[default]
    Text,
    Image,
    Voice,
    Video,
    File,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Voice => "voice",
            Self::Video => "video",
            Self::File => "file",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MediaKind {
    type Err = ParseKindError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "image" => Ok(Self::Image),
            "voice" => Ok(Self::Voice),
            "video" => Ok(Self::Video),
            "file" => Ok(Self::File),
            other => Err(ParseKindError::Media(other.to_owned())),
        }
    }
}

/// Untagged classification, as stored in the `kind` column.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Private,
    Group,
    System,
    Heartbeat,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Private => "private",
            Self::Group => "group",
            Self::System => "system",
            Self::Heartbeat => "heartbeat",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = ParseKindError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "private" => Ok(Self::Private),
            "group" => Ok(Self::Group),
            "system" => Ok(Self::System),
            "heartbeat" => Ok(Self::Heartbeat),
            other => Err(ParseKindError::Message(other.to_owned())),
        }
    }
}

/// Where a message is addressed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Route {
    Private { target_id: UserId },
    Group { room_id: RoomId },
    System,
    Heartbeat,
}

impl Route {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Private { .. } => MessageKind::Private,
            Self::Group { .. } => MessageKind::Group,
            Self::System => MessageKind::System,
            Self::Heartbeat => MessageKind::Heartbeat,
        }
    }

    pub fn target(&self) -> Option<UserId> {
        match self {
            Self::Private { target_id } => Some(*target_id),
            _ => None,
        }
    }

    pub fn room(&self) -> Option<RoomId> {
        match self {
            Self::Group { room_id } => Some(*room_id),
            _ => None,
        }
    }

    /// Rebuild a route from its stored columns.
    pub fn from_parts(kind: MessageKind, target: Option<UserId>, room: Option<RoomId>) -> Option<Self> {
        match kind {
            MessageKind::Private => target.map(|target_id| Self::Private { target_id }),
            MessageKind::Group => room.map(|room_id| Self::Group { room_id }),
            MessageKind::System => Some(Self::System),
            MessageKind::Heartbeat => Some(Self::Heartbeat),
        }
    }
}

/// A durable conversation message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub sender_id: UserId,
    #[serde(flatten)]
    pub route: Route,
    #[serde(default)]
    pub media: MediaKind,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        self.route.kind()
    }
}

/// A validated message that has not been assigned an id yet.
#[derive(Clone, Debug, PartialEq)]
pub struct NewMessage {
    pub sender_id: UserId,
    pub route: Route,
    pub media: MediaKind,
    pub content: String,
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NewMessage {
    /// Attach the store-assigned id.
    pub fn with_id(self, id: MessageId) -> Message {
        Message {
            id,
            sender_id: self.sender_id,
            route: self.route,
            media: self.media,
            content: self.content,
            metadata: self.metadata,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Caller-supplied fields of a send. Unset ids are zero, unset media is `None`.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct MessageDraft {
    #[serde(default)]
    pub sender_id: UserId,
    #[serde(default)]
    pub target_id: UserId,
    #[serde(default)]
    pub room_id: RoomId,
    #[serde(default)]
    pub media: Option<MediaKind>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub metadata: Option<Value>,
}

impl MessageDraft {
    pub fn private(sender: UserId, target: UserId, content: impl Into<String>) -> Self {
        Self {
            sender_id: sender,
            target_id: target,
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn group(sender: UserId, room: RoomId, content: impl Into<String>) -> Self {
        Self {
            sender_id: sender,
            room_id: room,
            content: content.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_media(mut self, media: MediaKind) -> Self {
        self.media = Some(media);
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Stamp the draft into a [`NewMessage`] with the given route.
    pub fn stamp(self, route: Route, now: DateTime<Utc>) -> NewMessage {
        NewMessage {
            sender_id: self.sender_id,
            route,
            media: self.media.unwrap_or_default(),
            content: self.content,
            metadata: self.metadata,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(route: Route) -> Message {
        let now = Utc::now();
        MessageDraft::private(UserId::new(3), UserId::new(4), "hi")
            .stamp(route, now)
            .with_id(MessageId::new(1))
    }

    #[test]
    fn private_message_json_is_flat() {
        let msg = sample(Route::Private { target_id: UserId::new(4) });
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["kind"], "private");
        assert_eq!(v["target_id"], 4);
        assert_eq!(v["sender_id"], 3);
        assert_eq!(v["media"], "text");
        assert!(v.get("room_id").is_none());
        assert!(v.get("metadata").is_none());
    }

    #[test]
    fn group_message_parses_back() {
        let msg = sample(Route::Group { room_id: RoomId::new(12) });
        let json = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
        assert_eq!(back.route.room(), Some(RoomId::new(12)));
        assert_eq!(back.kind(), MessageKind::Group);
    }

    #[test]
    fn missing_media_defaults_to_text() {
        let json = r#"{"id":5,"sender_id":1,"kind":"system","content":"x",
            "created_at":"2026-01-01T00:00:00Z","updated_at":"2026-01-01T00:00:00Z"}"#;
        let msg: Message = serde_json::from_str(json).unwrap();
        assert_eq!(msg.media, MediaKind::Text);
        assert_eq!(msg.route, Route::System);
    }

    #[test]
    fn private_without_target_is_rejected() {
        let json = r#"{"id":5,"sender_id":1,"kind":"private","content":"x",
            "created_at":"2026-01-01T00:00:00Z","updated_at":"2026-01-01T00:00:00Z"}"#;
        assert!(serde_json::from_str::<Message>(json).is_err());
    }

    #[test]
    fn draft_stamp_keeps_explicit_media() {
        let now = Utc::now();
        let new = MessageDraft::group(UserId::new(1), RoomId::new(2), "pic")
            .with_media(MediaKind::Image)
            .stamp(Route::Group { room_id: RoomId::new(2) }, now);
        assert_eq!(new.media, MediaKind::Image);
        assert_eq!(new.created_at, new.updated_at);
    }

    #[test]
    fn route_from_parts() {
        assert_eq!(
            Route::from_parts(MessageKind::Private, Some(UserId::new(9)), None),
            Some(Route::Private { target_id: UserId::new(9) })
        );
        assert_eq!(Route::from_parts(MessageKind::Group, None, None), None);
        assert_eq!(Route::from_parts(MessageKind::System, None, None), Some(Route::System));
    }

    #[test]
    fn kind_and_media_parse_roundtrip_strings() {
        for kind in [MessageKind::Private, MessageKind::Group, MessageKind::System, MessageKind::Heartbeat] {
            assert_eq!(kind.as_str().parse::<MessageKind>().unwrap(), kind);
        }
        assert_eq!("voice".parse::<MediaKind>().unwrap(), MediaKind::Voice);
        assert_eq!(
            "gif".parse::<MediaKind>().unwrap_err(),
            ParseKindError::Media("gif".into())
        );
        let err = "shout".parse::<MessageKind>().unwrap_err();
        assert_eq!(err.to_string(), "unknown message kind: shout");
    }
}
