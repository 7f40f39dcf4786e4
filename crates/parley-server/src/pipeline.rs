//! Store-then-cache writes and cache-then-store reads.
//!
//! The store is authoritative. A send succeeds once the store accepts the
//! message; the cache append that follows runs on its own task and its
//! failures are only logged. History reads try the cache, fall through to the
//! store on a miss or a cache error, and queue a backfill for the miss.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::counter;
use tracing::{debug, instrument, warn};

use parley_cache::{CacheError, RecencyCache};
use parley_core::{ConversationKey, Message, MessageDraft, RoomId, Route, UserId};
use parley_store::{MessageStore, StoreError};

use crate::backfill::BackfillQueue;
use crate::errors::PipelineError;
use crate::metrics as names;

#[derive(Clone)]
pub struct DeliveryPipeline {
    store: Arc<dyn MessageStore>,
    cache: RecencyCache,
    backfill: BackfillQueue,
    cache_write_timeout: Duration,
}

impl DeliveryPipeline {
    pub fn new(
        store: Arc<dyn MessageStore>,
        cache: RecencyCache,
        backfill: BackfillQueue,
        cache_write_timeout: Duration,
    ) -> Self {
        Self {
            store,
            cache,
            backfill,
            cache_write_timeout,
        }
    }

    pub fn cache(&self) -> &RecencyCache {
        &self.cache
    }

    /// Persist a private message and append it to the conversation cache.
    #[instrument(skip(self, draft), fields(sender_id = %draft.sender_id, target_id = %draft.target_id))]
    pub async fn send_private(&self, draft: MessageDraft) -> Result<Message, PipelineError> {
        require(draft.sender_id.is_valid(), "sender_id")?;
        require(draft.target_id.is_valid(), "target_id")?;
        let route = Route::Private {
            target_id: draft.target_id,
        };
        self.persist(draft, route).await
    }

    #[instrument(skip(self, draft), fields(sender_id = %draft.sender_id, room_id = %draft.room_id))]
    pub async fn send_group(&self, draft: MessageDraft) -> Result<Message, PipelineError> {
        require(draft.sender_id.is_valid(), "sender_id")?;
        require(draft.room_id.is_valid(), "room_id")?;
        let route = Route::Group {
            room_id: draft.room_id,
        };
        self.persist(draft, route).await
    }

    async fn persist(&self, draft: MessageDraft, route: Route) -> Result<Message, PipelineError> {
        let msg = draft.stamp(route, Utc::now());
        let stored = match self.store.create(msg).await {
            Ok(stored) => stored,
            Err(e) => {
                warn!(error = %e, "failed to persist message");
                counter!(names::STORE_WRITE_FAILURES_TOTAL).increment(1);
                return Err(e.into());
            }
        };
        self.cache_in_background(stored.clone()).await;
        Ok(stored)
    }

    /// Append on a separate task so a caller dropping its future cannot
    /// cancel the write halfway through.
    async fn cache_in_background(&self, msg: Message) {
        let cache = self.cache.clone();
        let limit = self.cache_write_timeout;
        let task = tokio::spawn(async move {
            match tokio::time::timeout(limit, cache.append(&msg)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(message_id = %msg.id, error = %e, "cache append failed");
                    counter!(names::CACHE_ERRORS_TOTAL, "op" => "append").increment(1);
                }
                Err(_) => {
                    warn!(message_id = %msg.id, timeout = ?limit, "cache append timed out");
                    counter!(names::CACHE_ERRORS_TOTAL, "op" => "append").increment(1);
                }
            }
        });
        if let Err(e) = task.await {
            warn!(error = %e, "cache append task failed");
        }
    }

    /// Messages between `a` and `b`, newest first.
    pub async fn get_private_history(&self, a: UserId, b: UserId) -> Result<Vec<Message>, PipelineError> {
        require(a.is_valid() && b.is_valid(), "user_id")?;
        let key = ConversationKey::private(a, b);
        let cached = self.cache.read_private(a, b).await;
        self.read_through("private", key, cached, self.store.find_between(a, b))
            .await
    }

    /// Messages of `room`, newest first.
    pub async fn get_group_history(&self, room: RoomId) -> Result<Vec<Message>, PipelineError> {
        require(room.is_valid(), "room_id")?;
        let key = ConversationKey::group(room);
        let cached = self.cache.read_group(room).await;
        self.read_through("group", key, cached, self.store.find_by_room(room))
            .await
    }

    async fn read_through(
        &self,
        scope: &'static str,
        key: ConversationKey,
        cached: Result<Vec<Message>, CacheError>,
        from_store: impl Future<Output = Result<Vec<Message>, StoreError>>,
    ) -> Result<Vec<Message>, PipelineError> {
        match cached {
            Ok(messages) if !messages.is_empty() => {
                counter!(names::CACHE_HITS_TOTAL, "scope" => scope).increment(1);
                return Ok(messages);
            }
            Ok(_) => {
                counter!(names::CACHE_MISSES_TOTAL, "scope" => scope).increment(1);
            }
            Err(e) => {
                warn!(key = %key, error = %e, "cache read failed, reading store");
                counter!(names::CACHE_ERRORS_TOTAL, "op" => "read").increment(1);
            }
        }

        let mut messages = from_store.await?;
        if !messages.is_empty() {
            let _ = self.backfill.enqueue(key.to_string(), messages.clone());
        }
        debug!(key = %key, count = messages.len(), "served history from store");
        messages.reverse();
        Ok(messages)
    }

    /// Recent private activity of `user` across conversations, newest first.
    pub async fn get_user_recent(&self, user: UserId) -> Result<Vec<Message>, PipelineError> {
        require(user.is_valid(), "user_id")?;
        match self.cache.read_user_conversations(user).await {
            Ok(messages) if !messages.is_empty() => {
                counter!(names::CACHE_HITS_TOTAL, "scope" => "user").increment(1);
                return Ok(messages);
            }
            Ok(_) => counter!(names::CACHE_MISSES_TOTAL, "scope" => "user").increment(1),
            Err(e) => {
                warn!(user_id = %user, error = %e, "cache scan failed, reading store");
                counter!(names::CACHE_ERRORS_TOTAL, "op" => "scan").increment(1);
            }
        }
        let mut messages = self.store.find_by_user(user).await?;
        messages.reverse();
        Ok(messages)
    }

    /// Wait for every backfill queued so far.
    pub async fn settle(&self) {
        self.backfill.settle().await;
    }
}

fn require(valid: bool, field: &str) -> Result<(), PipelineError> {
    if valid {
        Ok(())
    } else {
        Err(PipelineError::Validation(format!(
            "{field} must be between 1 and {}",
            UserId::MAX
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parley_cache::{CacheConfig, MemoryBackend};
    use parley_core::{MediaKind, NewMessage};
    use parley_store::{Database, SqliteMessageStore};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_util::sync::CancellationToken;

    struct BrokenStore {
        creates: AtomicUsize,
    }

    #[async_trait]
    impl MessageStore for BrokenStore {
        async fn create(&self, _msg: NewMessage) -> Result<Message, StoreError> {
            let _ = self.creates.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Io("disk full".into()))
        }
        async fn find_between(&self, _a: UserId, _b: UserId) -> Result<Vec<Message>, StoreError> {
            Err(StoreError::Io("disk full".into()))
        }
        async fn find_by_room(&self, _room: RoomId) -> Result<Vec<Message>, StoreError> {
            Err(StoreError::Io("disk full".into()))
        }
        async fn find_by_user(&self, _user: UserId) -> Result<Vec<Message>, StoreError> {
            Err(StoreError::Io("disk full".into()))
        }
    }

    struct Fixture {
        pipeline: DeliveryPipeline,
        backend: Arc<MemoryBackend>,
        _token: CancellationToken,
    }

    fn fixture_with(store: Arc<dyn MessageStore>) -> Fixture {
        let backend = Arc::new(MemoryBackend::new());
        let cache = RecencyCache::new(backend.clone(), CacheConfig::default());
        let token = CancellationToken::new();
        let (backfill, _task) =
            BackfillQueue::spawn(cache.clone(), 16, Duration::from_secs(5), token.clone());
        Fixture {
            pipeline: DeliveryPipeline::new(store, cache, backfill, Duration::from_secs(3)),
            backend,
            _token: token,
        }
    }

    fn fixture() -> Fixture {
        let store = SqliteMessageStore::new(Database::in_memory().unwrap());
        fixture_with(Arc::new(store))
    }

    fn uid(n: u64) -> UserId {
        UserId::new(n)
    }

    #[tokio::test]
    async fn send_private_writes_store_and_cache() {
        let f = fixture();
        let msg = f
            .pipeline
            .send_private(MessageDraft::private(uid(1), uid(2), "hi"))
            .await
            .unwrap();
        assert!(!msg.id.is_unset());
        assert_eq!(msg.media, MediaKind::Text);

        let cached = f.pipeline.cache().read_private(uid(2), uid(1)).await.unwrap();
        assert_eq!(cached, [msg]);
    }

    #[tokio::test]
    async fn unset_routing_ids_are_rejected() {
        let f = fixture();
        let err = f
            .pipeline
            .send_private(MessageDraft::private(uid(1), UserId::default(), "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));

        let err = f
            .pipeline
            .send_group(MessageDraft::group(uid(1), RoomId::default(), "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
    }

    #[tokio::test]
    async fn oversized_ids_never_alias_another_user() {
        let f = fixture();
        let err = f
            .pipeline
            .send_private(MessageDraft::private(uid(1), uid(u64::MAX), "for a"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
        let _ = f.pipeline.cache().purge().await.unwrap();

        let err = f
            .pipeline
            .get_private_history(uid(1), uid(u64::MAX - 1))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));

        let top = UserId::MAX;
        let sent = f
            .pipeline
            .send_private(MessageDraft::private(uid(1), top, "edge"))
            .await
            .unwrap();
        let _ = f.pipeline.cache().purge().await.unwrap();
        assert_eq!(f.pipeline.get_private_history(top, uid(1)).await.unwrap(), [sent]);
        assert!(f
            .pipeline
            .get_group_history(RoomId::new(u64::MAX))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn store_failure_fails_send_without_caching() {
        let store = Arc::new(BrokenStore {
            creates: AtomicUsize::new(0),
        });
        let f = fixture_with(store.clone());
        let err = f
            .pipeline
            .send_private(MessageDraft::private(uid(1), uid(2), "lost"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Store(_)));
        assert_eq!(store.creates.load(Ordering::SeqCst), 1);
        assert!(f.backend.is_empty());
    }

    #[tokio::test]
    async fn cache_failure_does_not_fail_send() {
        let f = fixture();
        f.backend.set_unavailable(true);
        let msg = f
            .pipeline
            .send_group(MessageDraft::group(uid(1), RoomId::new(7), "still sent"))
            .await
            .unwrap();
        assert_eq!(msg.route.room(), Some(RoomId::new(7)));

        // the store still has it
        f.backend.set_unavailable(false);
        let history = f.pipeline.get_group_history(RoomId::new(7)).await.unwrap();
        assert_eq!(history, [msg]);
    }

    #[tokio::test]
    async fn history_is_newest_first() {
        let f = fixture();
        for n in 0..3 {
            let _ = f
                .pipeline
                .send_private(MessageDraft::private(uid(1), uid(2), format!("m{n}")))
                .await
                .unwrap();
        }
        let cached = f.pipeline.get_private_history(uid(1), uid(2)).await.unwrap();
        let contents: Vec<&str> = cached.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["m2", "m1", "m0"]);
    }

    #[tokio::test]
    async fn cache_miss_reads_store_then_backfills() {
        let f = fixture();
        for n in 0..3 {
            let _ = f
                .pipeline
                .send_group(MessageDraft::group(uid(1), RoomId::new(9), format!("g{n}")))
                .await
                .unwrap();
        }
        // drop the cached copy, as an expiry would
        let _ = f.pipeline.cache().purge().await.unwrap();
        assert!(f.pipeline.cache().read_group(RoomId::new(9)).await.unwrap().is_empty());

        let from_store = f.pipeline.get_group_history(RoomId::new(9)).await.unwrap();
        assert_eq!(from_store.len(), 3);
        assert_eq!(from_store[0].content, "g2");

        f.pipeline.settle().await;
        let refilled = f.pipeline.cache().read_group(RoomId::new(9)).await.unwrap();
        assert_eq!(refilled, from_store);
    }

    #[tokio::test]
    async fn repeated_cold_reads_backfill_once() {
        let f = fixture();
        for n in 0..3 {
            let _ = f
                .pipeline
                .send_group(MessageDraft::group(uid(1), RoomId::new(8), format!("g{n}")))
                .await
                .unwrap();
        }
        let _ = f.pipeline.cache().purge().await.unwrap();

        let first = f.pipeline.get_group_history(RoomId::new(8)).await.unwrap();
        let second = f.pipeline.get_group_history(RoomId::new(8)).await.unwrap();
        assert_eq!(first, second);
        f.pipeline.settle().await;

        let warm = f.pipeline.get_group_history(RoomId::new(8)).await.unwrap();
        let ids: Vec<u64> = warm.iter().map(|m| m.id.get()).collect();
        assert_eq!(ids, [3, 2, 1]);
        assert_eq!(warm, first);
        assert_eq!(f.backend.len("conv:group:8"), 3);
    }

    #[tokio::test]
    async fn cache_outage_falls_back_to_store() {
        let f = fixture();
        let sent = f
            .pipeline
            .send_private(MessageDraft::private(uid(3), uid(4), "hello"))
            .await
            .unwrap();
        f.backend.set_unavailable(true);
        let history = f.pipeline.get_private_history(uid(4), uid(3)).await.unwrap();
        assert_eq!(history, [sent]);
    }

    #[tokio::test]
    async fn store_read_failure_surfaces() {
        let f = fixture_with(Arc::new(BrokenStore {
            creates: AtomicUsize::new(0),
        }));
        let err = f.pipeline.get_group_history(RoomId::new(1)).await.unwrap_err();
        assert!(matches!(err, PipelineError::Store(_)));
    }

    #[tokio::test]
    async fn empty_store_result_queues_nothing() {
        let f = fixture();
        assert!(f.pipeline.get_group_history(RoomId::new(5)).await.unwrap().is_empty());
        f.pipeline.settle().await;
        assert!(f.backend.is_empty());
    }

    #[tokio::test]
    async fn user_recent_spans_conversations() {
        let f = fixture();
        let _ = f
            .pipeline
            .send_private(MessageDraft::private(uid(1), uid(2), "to two"))
            .await
            .unwrap();
        let _ = f
            .pipeline
            .send_private(MessageDraft::private(uid(3), uid(1), "from three"))
            .await
            .unwrap();
        let _ = f
            .pipeline
            .send_private(MessageDraft::private(uid(2), uid(3), "unrelated"))
            .await
            .unwrap();

        let recent = f.pipeline.get_user_recent(uid(1)).await.unwrap();
        let contents: Vec<&str> = recent.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["from three", "to two"]);

        // with the cache gone the store answers in the same order
        let _ = f.pipeline.cache().purge().await.unwrap();
        let recent = f.pipeline.get_user_recent(uid(1)).await.unwrap();
        let contents: Vec<&str> = recent.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["from three", "to two"]);
    }
}
