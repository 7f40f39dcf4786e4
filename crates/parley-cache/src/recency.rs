//! Bounded, expiring, newest-first message lists per conversation.
//!
//! Every write is LPUSH, EXPIRE, LTRIM on the conversation key, so a list
//! never holds more than `max_entries` messages and expires a fixed time
//! after its last write. Reads never refresh the TTL.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parley_core::{ConversationKey, Message, RoomId, Route, UserId};
use parley_settings::CacheSettings;
use tracing::{debug, warn};

use crate::backend::ListBackend;
use crate::error::CacheError;

#[derive(Clone, Debug)]
pub struct CacheConfig {
    pub max_entries: usize,
    pub private_ttl: Duration,
    pub group_ttl: Duration,
    pub op_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::from(&CacheSettings::default())
    }
}

impl From<&CacheSettings> for CacheConfig {
    fn from(s: &CacheSettings) -> Self {
        Self {
            max_entries: s.max_entries.max(1),
            private_ttl: s.private_ttl(),
            group_ttl: s.group_ttl(),
            op_timeout: s.op_timeout(),
        }
    }
}

#[derive(Clone)]
pub struct RecencyCache {
    backend: Arc<dyn ListBackend>,
    config: CacheConfig,
}

impl RecencyCache {
    pub fn new(backend: Arc<dyn ListBackend>, config: CacheConfig) -> Self {
        Self { backend, config }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Append to whichever conversation `msg` belongs to.
    pub async fn append(&self, msg: &Message) -> Result<(), CacheError> {
        match msg.route {
            Route::Private { .. } => self.append_private(msg).await,
            Route::Group { .. } => self.append_group(msg).await,
            Route::System | Route::Heartbeat => Err(CacheError::WrongKind(msg.id.get(), "conversation")),
        }
    }

    pub async fn append_private(&self, msg: &Message) -> Result<(), CacheError> {
        let Route::Private { target_id } = msg.route else {
            return Err(CacheError::WrongKind(msg.id.get(), "private"));
        };
        let key = ConversationKey::private(msg.sender_id, target_id);
        self.push(&key, msg, self.config.private_ttl).await
    }

    pub async fn append_group(&self, msg: &Message) -> Result<(), CacheError> {
        let Route::Group { room_id } = msg.route else {
            return Err(CacheError::WrongKind(msg.id.get(), "group"));
        };
        let key = ConversationKey::group(room_id);
        self.push(&key, msg, self.config.group_ttl).await
    }

    async fn push(&self, key: &ConversationKey, msg: &Message, ttl: Duration) -> Result<(), CacheError> {
        let key = key.to_string();
        let payload = serde_json::to_string(msg).map_err(|e| {
            warn!(key = %key, message_id = %msg.id, error = %e, "failed to serialize message for cache");
            CacheError::from(e)
        })?;

        self.guarded("lpush", &key, self.backend.lpush(&key, payload)).await?;
        self.guarded("expire", &key, self.backend.expire(&key, ttl)).await?;
        self.guarded("ltrim", &key, self.backend.ltrim(&key, 0, self.last_index()))
            .await?;
        debug!(key = %key, message_id = %msg.id, "cached message");
        Ok(())
    }

    /// Newest-first messages between `a` and `b`.
    pub async fn read_private(&self, a: UserId, b: UserId) -> Result<Vec<Message>, CacheError> {
        self.read(&ConversationKey::private(a, b).to_string()).await
    }

    pub async fn read_group(&self, room: RoomId) -> Result<Vec<Message>, CacheError> {
        self.read(&ConversationKey::group(room).to_string()).await
    }

    /// Messages from every cached private conversation involving `user`,
    /// newest first. Keys that fail to read are skipped.
    pub async fn read_user_conversations(&self, user: UserId) -> Result<Vec<Message>, CacheError> {
        let mut keys = Vec::new();
        let mut seen = HashSet::new();
        for pattern in ConversationKey::private_patterns_for(user) {
            for key in self.guarded("scan", &pattern, self.backend.scan(&pattern)).await? {
                let relevant = ConversationKey::parse(&key).is_some_and(|k| k.involves(user));
                if relevant && seen.insert(key.clone()) {
                    keys.push(key);
                }
            }
        }

        let mut messages = Vec::new();
        for key in &keys {
            match self.read(key).await {
                Ok(mut batch) => messages.append(&mut batch),
                Err(e) => warn!(key = %key, user_id = %user, error = %e, "skipping unreadable conversation"),
            }
        }
        messages.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(messages)
    }

    /// Delete every conversation key. Returns how many were removed.
    pub async fn purge(&self) -> Result<u64, CacheError> {
        let pattern = ConversationKey::all_pattern();
        let keys = self.guarded("scan", pattern, self.backend.scan(pattern)).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        self.guarded("del", pattern, self.backend.del(&keys)).await
    }

    /// Merge `messages` (one conversation, oldest first) into its cached list
    /// and rewrite the list. Entries are unique by message id, so repeating
    /// a refill with the same history leaves the list unchanged. Returns how
    /// many messages were new to the list.
    pub async fn refill(&self, messages: &[Message]) -> Result<usize, CacheError> {
        let Some(first) = messages.first() else {
            return Ok(0);
        };
        let key = ConversationKey::for_message(first)
            .ok_or(CacheError::WrongKind(first.id.get(), "conversation"))?;
        let ttl = match key {
            ConversationKey::Private { .. } => self.config.private_ttl,
            ConversationKey::Group(_) => self.config.group_ttl,
        };
        let raw_key = key.to_string();

        let cached = self.read(&raw_key).await?;
        let before = cached.len();
        let mut merged = cached;
        merged.extend(
            messages
                .iter()
                .filter(|m| ConversationKey::for_message(m) == Some(key))
                .cloned(),
        );
        merged.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        merged.dedup_by_key(|m| m.id);
        let added = merged.len().saturating_sub(before);
        if added == 0 {
            debug!(key = %raw_key, "conversation already cached");
            return Ok(0);
        }

        let skip = merged.len().saturating_sub(self.config.max_entries);
        let _ = self
            .guarded("del", &raw_key, self.backend.del(std::slice::from_ref(&raw_key)))
            .await?;
        for msg in &merged[skip..] {
            self.push(&key, msg, ttl).await?;
        }
        Ok(added)
    }

    async fn read(&self, key: &str) -> Result<Vec<Message>, CacheError> {
        let raw = self
            .guarded("lrange", key, self.backend.lrange(key, 0, self.last_index()))
            .await?;
        Ok(raw
            .into_iter()
            .filter_map(|entry| match serde_json::from_str::<Message>(&entry) {
                Ok(msg) => Some(msg),
                Err(e) => {
                    warn!(key = %key, error = %e, "skipping corrupt cache entry");
                    None
                }
            })
            .collect())
    }

    fn last_index(&self) -> isize {
        isize::try_from(self.config.max_entries)
            .unwrap_or(isize::MAX)
            .saturating_sub(1)
    }

    /// Run one backend call under the per-op timeout, logging any failure.
    async fn guarded<T>(
        &self,
        op: &'static str,
        key: &str,
        fut: impl Future<Output = Result<T, CacheError>>,
    ) -> Result<T, CacheError> {
        let result = match tokio::time::timeout(self.config.op_timeout, fut).await {
            Ok(inner) => inner,
            Err(_) => Err(CacheError::Timeout {
                op,
                after: self.config.op_timeout,
            }),
        };
        if let Err(e) = &result {
            warn!(op, key = %key, error = %e, "cache operation failed");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use chrono::Utc;
    use parley_core::{MessageDraft, MessageId};

    fn uid(n: u64) -> UserId {
        UserId::new(n)
    }

    fn private(id: u64, from: u64, to: u64) -> Message {
        MessageDraft::private(uid(from), uid(to), format!("m{id}"))
            .stamp(Route::Private { target_id: uid(to) }, Utc::now())
            .with_id(MessageId::new(id))
    }

    fn group(id: u64, from: u64, room: u64) -> Message {
        MessageDraft::group(uid(from), RoomId::new(room), format!("g{id}"))
            .stamp(Route::Group { room_id: RoomId::new(room) }, Utc::now())
            .with_id(MessageId::new(id))
    }

    fn cache() -> (Arc<MemoryBackend>, RecencyCache) {
        let backend = Arc::new(MemoryBackend::new());
        let cache = RecencyCache::new(backend.clone(), CacheConfig::default());
        (backend, cache)
    }

    #[tokio::test]
    async fn appended_message_reads_first() {
        let (_, cache) = cache();
        cache.append_private(&private(1, 1, 2)).await.unwrap();
        cache.append_private(&private(2, 2, 1)).await.unwrap();

        let read = cache.read_private(uid(2), uid(1)).await.unwrap();
        let ids: Vec<u64> = read.iter().map(|m| m.id.get()).collect();
        assert_eq!(ids, [2, 1]);
    }

    #[tokio::test]
    async fn list_is_bounded_to_newest_hundred() {
        let (backend, cache) = cache();
        for id in 1..=150 {
            cache.append_private(&private(id, 1, 2)).await.unwrap();
        }
        assert_eq!(backend.len("conv:private:1:2"), 100);

        let read = cache.read_private(uid(1), uid(2)).await.unwrap();
        assert_eq!(read.len(), 100);
        assert_eq!(read[0].id.get(), 150);
        assert_eq!(read[99].id.get(), 51);
    }

    #[tokio::test(start_paused = true)]
    async fn writes_set_ttl_per_kind() {
        let (backend, cache) = cache();
        cache.append(&private(1, 3, 4)).await.unwrap();
        cache.append(&group(2, 3, 9)).await.unwrap();
        assert_eq!(backend.ttl("conv:private:3:4"), Some(Duration::from_secs(86_400)));
        assert_eq!(backend.ttl("conv:group:9"), Some(Duration::from_secs(172_800)));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_conversation_reads_empty() {
        let (_, cache) = cache();
        cache.append_group(&group(1, 1, 5)).await.unwrap();
        tokio::time::advance(Duration::from_secs(48 * 3600 + 1)).await;
        assert!(cache.read_group(RoomId::new(5)).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_private_conversation_reads_empty() {
        let (backend, cache) = cache();
        cache.append_private(&private(1, 1, 2)).await.unwrap();
        tokio::time::advance(Duration::from_secs(24 * 3600 - 1)).await;
        assert_eq!(cache.read_private(uid(2), uid(1)).await.unwrap().len(), 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cache.read_private(uid(2), uid(1)).await.unwrap().is_empty());
        assert_eq!(backend.len("conv:private:1:2"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_refill_keeps_one_copy() {
        let (backend, cache) = cache();
        let history: Vec<Message> = (1..=3).map(|id| group(id, 1, 6)).collect();
        assert_eq!(cache.refill(&history).await.unwrap(), 3);
        assert_eq!(cache.refill(&history).await.unwrap(), 0);

        let ids: Vec<u64> = cache
            .read_group(RoomId::new(6))
            .await
            .unwrap()
            .iter()
            .map(|m| m.id.get())
            .collect();
        assert_eq!(ids, [3, 2, 1]);
        assert_eq!(backend.ttl("conv:group:6"), Some(Duration::from_secs(172_800)));
    }

    #[tokio::test]
    async fn refill_merges_with_a_racing_append() {
        let (_, cache) = cache();
        let history: Vec<Message> = (1..=2).map(|id| private(id, 1, 2)).collect();
        let newer = private(3, 2, 1);
        cache.append(&newer).await.unwrap();

        assert_eq!(cache.refill(&history).await.unwrap(), 2);
        let ids: Vec<u64> = cache
            .read_private(uid(1), uid(2))
            .await
            .unwrap()
            .iter()
            .map(|m| m.id.get())
            .collect();
        assert_eq!(ids, [3, 2, 1]);
    }

    #[tokio::test]
    async fn refill_rejects_uncacheable_history() {
        let (backend, cache) = cache();
        assert_eq!(cache.refill(&[]).await.unwrap(), 0);
        let system = MessageDraft::private(uid(1), uid(2), "sys")
            .stamp(Route::System, Utc::now())
            .with_id(MessageId::new(1));
        assert!(matches!(
            cache.refill(&[system]).await,
            Err(CacheError::WrongKind(1, _))
        ));
        assert!(backend.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn reads_do_not_refresh_ttl() {
        let (backend, cache) = cache();
        cache.append_private(&private(1, 1, 2)).await.unwrap();
        tokio::time::advance(Duration::from_secs(3600)).await;
        let _ = cache.read_private(uid(1), uid(2)).await.unwrap();
        assert_eq!(backend.ttl("conv:private:1:2"), Some(Duration::from_secs(23 * 3600)));
    }

    #[tokio::test]
    async fn wrong_kind_rejected() {
        let (_, cache) = cache();
        assert!(matches!(
            cache.append_group(&private(1, 1, 2)).await,
            Err(CacheError::WrongKind(1, "group"))
        ));
    }

    #[tokio::test]
    async fn corrupt_entries_are_skipped() {
        let (backend, cache) = cache();
        cache.append_group(&group(1, 1, 7)).await.unwrap();
        backend.lpush("conv:group:7", "{not json".into()).await.unwrap();
        cache.append_group(&group(2, 1, 7)).await.unwrap();

        let read = cache.read_group(RoomId::new(7)).await.unwrap();
        let ids: Vec<u64> = read.iter().map(|m| m.id.get()).collect();
        assert_eq!(ids, [2, 1]);
    }

    #[tokio::test]
    async fn backend_down_is_an_error() {
        let (backend, cache) = cache();
        backend.set_unavailable(true);
        assert!(matches!(
            cache.append_private(&private(1, 1, 2)).await,
            Err(CacheError::Unavailable)
        ));
        assert!(cache.read_private(uid(1), uid(2)).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_backend_times_out() {
        let (backend, cache) = cache();
        backend.set_latency(Some(Duration::from_secs(10)));
        let err = cache.read_group(RoomId::new(1)).await.unwrap_err();
        assert!(matches!(err, CacheError::Timeout { op: "lrange", .. }));
    }

    #[tokio::test]
    async fn user_conversations_cover_both_slots() {
        let (_, cache) = cache();
        cache.append_private(&private(1, 5, 9)).await.unwrap();
        cache.append_private(&private(2, 2, 5)).await.unwrap();
        cache.append_private(&private(3, 2, 9)).await.unwrap();
        cache.append_private(&private(4, 15, 2)).await.unwrap();

        let mine = cache.read_user_conversations(uid(5)).await.unwrap();
        let mut ids: Vec<u64> = mine.iter().map(|m| m.id.get()).collect();
        ids.sort_unstable();
        assert_eq!(ids, [1, 2]);
    }

    #[tokio::test]
    async fn user_conversations_skip_failing_keys() {
        let (backend, cache) = cache();
        cache.append_private(&private(1, 1, 2)).await.unwrap();
        cache.append_private(&private(2, 1, 3)).await.unwrap();
        backend.poison_key("conv:private:1:3");

        let mine = cache.read_user_conversations(uid(1)).await.unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].id.get(), 1);
    }

    #[tokio::test]
    async fn purge_removes_every_conversation() {
        let (backend, cache) = cache();
        cache.append_private(&private(1, 1, 2)).await.unwrap();
        cache.append_group(&group(2, 1, 3)).await.unwrap();
        backend.lpush("unrelated", "x".into()).await.unwrap();

        assert_eq!(cache.purge().await.unwrap(), 2);
        assert_eq!(cache.purge().await.unwrap(), 0);
        assert_eq!(backend.len("unrelated"), 1);
    }
}
