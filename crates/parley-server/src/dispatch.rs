//! Inbound message routing.
//!
//! Clients send JSON envelopes tagged by `type`:
//!
//! ```json
//! {"type":"private","target_id":4,"content":"hi"}
//! {"type":"group","room_id":9,"content":"hello room","media":"image"}
//! {"type":"heartbeat"}
//! ```
//!
//! The sender is always the session's user, whatever the envelope claims.
//! Payloads that do not parse are relayed verbatim to every session.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, instrument, warn};

use parley_core::{Message, MessageDraft, MessageKind, RoomId, UserId};

use crate::errors::HubError;
use crate::hub::HubHandle;
use crate::pipeline::DeliveryPipeline;
use crate::pump::InboundHandler;
use crate::session::Session;

/// Room membership lookup for group delivery.
#[async_trait]
pub trait RoomDirectory: Send + Sync + 'static {
    async fn members(&self, room: RoomId) -> Vec<UserId>;
}

/// Fixed in-process membership table.
#[derive(Default)]
pub struct StaticRooms {
    rooms: RwLock<HashMap<RoomId, HashSet<UserId>>>,
}

impl StaticRooms {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&self, room: RoomId, user: UserId) {
        let _ = self.rooms.write().entry(room).or_default().insert(user);
    }

    pub fn leave(&self, room: RoomId, user: UserId) {
        let mut rooms = self.rooms.write();
        if let Some(members) = rooms.get_mut(&room) {
            let _ = members.remove(&user);
            if members.is_empty() {
                let _ = rooms.remove(&room);
            }
        }
    }
}

#[async_trait]
impl RoomDirectory for StaticRooms {
    async fn members(&self, room: RoomId) -> Vec<UserId> {
        let mut members: Vec<UserId> = self
            .rooms
            .read()
            .get(&room)
            .map(|m| m.iter().copied().collect())
            .unwrap_or_default();
        members.sort_unstable();
        members
    }
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: MessageKind,
    #[serde(flatten)]
    draft: MessageDraft,
}

pub struct ChatDispatcher {
    hub: HubHandle,
    pipeline: DeliveryPipeline,
    rooms: Option<Arc<dyn RoomDirectory>>,
}

impl ChatDispatcher {
    pub fn new(hub: HubHandle, pipeline: DeliveryPipeline, rooms: Option<Arc<dyn RoomDirectory>>) -> Self {
        Self { hub, pipeline, rooms }
    }

    async fn relay(&self, payload: Bytes) {
        match self.hub.fanout(payload).await {
            Ok(report) => debug!(delivered = report.delivered, evicted = report.evicted, "relayed"),
            Err(e) => warn!(error = %e, "fanout failed"),
        }
    }

    async fn private(&self, session: &Session, mut draft: MessageDraft) {
        draft.sender_id = session.user_id();
        match self.pipeline.send_private(draft).await {
            Ok(msg) => {
                let target = msg.route.target().unwrap_or_default();
                self.deliver(target, &msg);
            }
            Err(e) => reject(session, &e.to_string()),
        }
    }

    async fn group(&self, session: &Session, mut draft: MessageDraft) {
        draft.sender_id = session.user_id();
        let msg = match self.pipeline.send_group(draft).await {
            Ok(msg) => msg,
            Err(e) => return reject(session, &e.to_string()),
        };
        let room = msg.route.room().unwrap_or_default();
        match &self.rooms {
            Some(rooms) => {
                for member in rooms.members(room).await {
                    if member != msg.sender_id {
                        self.deliver(member, &msg);
                    }
                }
            }
            None => match serde_json::to_vec(&msg) {
                Ok(payload) => self.relay(Bytes::from(payload)).await,
                Err(e) => warn!(message_id = %msg.id, error = %e, "failed to encode message"),
            },
        }
    }

    fn deliver(&self, user: UserId, msg: &Message) {
        let payload = match serde_json::to_vec(msg) {
            Ok(p) => Bytes::from(p),
            Err(e) => {
                warn!(message_id = %msg.id, error = %e, "failed to encode message");
                return;
            }
        };
        match self.hub.send_to_user(user, payload) {
            Ok(()) => {}
            Err(HubError::NotConnected(_)) => {
                debug!(user_id = %user, message_id = %msg.id, "recipient offline, stored only");
            }
            Err(e) => warn!(user_id = %user, message_id = %msg.id, error = %e, "delivery failed"),
        }
    }
}

/// Tell the sender its message was refused.
fn reject(session: &Session, reason: &str) {
    let frame = json!({ "type": "error", "error": reason });
    if session.try_send(Bytes::from(frame.to_string())).is_err() {
        debug!(user_id = %session.user_id(), "could not deliver error frame");
    }
}

#[async_trait]
impl InboundHandler for ChatDispatcher {
    #[instrument(skip_all, fields(user_id = %session.user_id()))]
    async fn handle(&self, session: &Arc<Session>, payload: Bytes) {
        let envelope: Envelope = match serde_json::from_slice(&payload) {
            Ok(env) => env,
            Err(e) => {
                debug!(error = %e, "unrecognised payload, relaying raw");
                return self.relay(payload).await;
            }
        };
        match envelope.kind {
            MessageKind::Heartbeat => session.touch_heartbeat(),
            MessageKind::Private => self.private(session, envelope.draft).await,
            MessageKind::Group => self.group(session, envelope.draft).await,
            MessageKind::System => self.relay(payload).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backfill::BackfillQueue;
    use crate::hub::Hub;
    use parley_cache::{CacheConfig, MemoryBackend, RecencyCache};
    use parley_store::{Database, SqliteMessageStore};
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    struct Fixture {
        hub: HubHandle,
        pipeline: DeliveryPipeline,
        rooms: Arc<StaticRooms>,
        _token: CancellationToken,
    }

    fn fixture() -> Fixture {
        let token = CancellationToken::new();
        let (hub, _hub_task) = Hub::spawn(16, token.clone());
        let cache = RecencyCache::new(Arc::new(MemoryBackend::new()), CacheConfig::default());
        let (backfill, _task) =
            BackfillQueue::spawn(cache.clone(), 16, Duration::from_secs(5), token.clone());
        let store = SqliteMessageStore::new(Database::in_memory().unwrap());
        let pipeline = DeliveryPipeline::new(Arc::new(store), cache, backfill, Duration::from_secs(3));
        Fixture {
            hub,
            pipeline,
            rooms: Arc::new(StaticRooms::new()),
            _token: token,
        }
    }

    impl Fixture {
        fn dispatcher(&self, with_rooms: bool) -> ChatDispatcher {
            let rooms = with_rooms.then(|| self.rooms.clone() as Arc<dyn RoomDirectory>);
            ChatDispatcher::new(self.hub.clone(), self.pipeline.clone(), rooms)
        }

        async fn connect(&self, user: u64) -> (Arc<Session>, mpsc::Receiver<Bytes>) {
            let (session, rx) = Session::new(UserId::new(user), 8);
            self.hub.register(session.clone()).await.unwrap();
            (session, rx)
        }
    }

    fn json(b: &Bytes) -> serde_json::Value {
        serde_json::from_slice(b).unwrap()
    }

    #[tokio::test]
    async fn private_message_reaches_target_only() {
        let f = fixture();
        let d = f.dispatcher(false);
        let (alice, mut alice_rx) = f.connect(1).await;
        let (_bob, mut bob_rx) = f.connect(2).await;

        d.handle(&alice, Bytes::from_static(br#"{"type":"private","target_id":2,"content":"hey"}"#))
            .await;

        let got = json(&bob_rx.recv().await.unwrap());
        assert_eq!(got["content"], "hey");
        assert_eq!(got["sender_id"], 1);
        assert_eq!(got["kind"], "private");
        assert!(alice_rx.try_recv().is_err());

        let history = f
            .pipeline
            .get_private_history(UserId::new(1), UserId::new(2))
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn claimed_sender_is_ignored() {
        let f = fixture();
        let d = f.dispatcher(false);
        let (alice, _a) = f.connect(1).await;
        let (_bob, mut bob_rx) = f.connect(2).await;

        d.handle(
            &alice,
            Bytes::from_static(br#"{"type":"private","sender_id":99,"target_id":2,"content":"x"}"#),
        )
        .await;
        assert_eq!(json(&bob_rx.recv().await.unwrap())["sender_id"], 1);
    }

    #[tokio::test]
    async fn offline_target_is_still_stored() {
        let f = fixture();
        let d = f.dispatcher(false);
        let (alice, mut alice_rx) = f.connect(1).await;

        d.handle(&alice, Bytes::from_static(br#"{"type":"private","target_id":5,"content":"later"}"#))
            .await;
        assert!(alice_rx.try_recv().is_err());
        let history = f
            .pipeline
            .get_private_history(UserId::new(5), UserId::new(1))
            .await
            .unwrap();
        assert_eq!(history[0].content, "later");
    }

    #[tokio::test]
    async fn invalid_send_returns_error_frame() {
        let f = fixture();
        let d = f.dispatcher(false);
        let (alice, mut alice_rx) = f.connect(1).await;

        d.handle(&alice, Bytes::from_static(br#"{"type":"private","content":"nobody"}"#))
            .await;
        let got = json(&alice_rx.recv().await.unwrap());
        assert_eq!(got["type"], "error");
        assert!(got["error"].as_str().unwrap().contains("target_id"));
    }

    #[tokio::test]
    async fn group_uses_room_members_excluding_sender() {
        let f = fixture();
        let d = f.dispatcher(true);
        let room = RoomId::new(9);
        for user in [1, 2, 3] {
            f.rooms.join(room, UserId::new(user));
        }
        let (alice, mut alice_rx) = f.connect(1).await;
        let (_bob, mut bob_rx) = f.connect(2).await;
        let (_carol, mut carol_rx) = f.connect(3).await;
        let (_dave, mut dave_rx) = f.connect(4).await;

        d.handle(&alice, Bytes::from_static(br#"{"type":"group","room_id":9,"content":"all"}"#))
            .await;

        assert_eq!(json(&bob_rx.recv().await.unwrap())["room_id"], 9);
        assert_eq!(json(&carol_rx.recv().await.unwrap())["content"], "all");
        assert!(alice_rx.try_recv().is_err());
        assert!(dave_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn group_without_directory_fans_out() {
        let f = fixture();
        let d = f.dispatcher(false);
        let (alice, mut alice_rx) = f.connect(1).await;
        let (_bob, mut bob_rx) = f.connect(2).await;

        d.handle(&alice, Bytes::from_static(br#"{"type":"group","room_id":3,"content":"hi"}"#))
            .await;
        assert_eq!(json(&alice_rx.recv().await.unwrap())["content"], "hi");
        assert_eq!(json(&bob_rx.recv().await.unwrap())["content"], "hi");
    }

    #[tokio::test]
    async fn heartbeat_touches_session() {
        let f = fixture();
        let d = f.dispatcher(false);
        let (alice, mut alice_rx) = f.connect(1).await;
        let before = alice.last_heartbeat();
        tokio::time::sleep(Duration::from_millis(5)).await;

        d.handle(&alice, Bytes::from_static(br#"{"type":"heartbeat"}"#)).await;
        assert!(alice.last_heartbeat() > before);
        assert!(alice_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn system_and_garbage_are_relayed_raw() {
        let f = fixture();
        let d = f.dispatcher(false);
        let (alice, _a) = f.connect(1).await;
        let (_bob, mut bob_rx) = f.connect(2).await;

        let system = Bytes::from_static(br#"{"type":"system","content":"maintenance"}"#);
        d.handle(&alice, system.clone()).await;
        assert_eq!(bob_rx.recv().await.unwrap(), system);

        let garbage = Bytes::from_static(b"not json");
        d.handle(&alice, garbage.clone()).await;
        assert_eq!(bob_rx.recv().await.unwrap(), garbage);
    }

    #[tokio::test]
    async fn static_rooms_membership() {
        let rooms = StaticRooms::new();
        let room = RoomId::new(1);
        rooms.join(room, UserId::new(3));
        rooms.join(room, UserId::new(1));
        rooms.join(room, UserId::new(3));
        assert_eq!(rooms.members(room).await, [UserId::new(1), UserId::new(3)]);
        rooms.leave(room, UserId::new(1));
        rooms.leave(room, UserId::new(3));
        assert!(rooms.members(room).await.is_empty());
    }
}
