//! Periodic cache purge.

use std::time::Duration;

use metrics::counter;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use parley_cache::RecencyCache;

use crate::metrics as names;

/// Purge every conversation key each `interval` until `token` is cancelled.
/// The first purge runs one interval after start.
pub fn spawn_janitor(cache: RecencyCache, interval: Duration, token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let _ = ticker.tick().await;
        info!(interval = ?interval, "cache janitor started");

        loop {
            tokio::select! {
                () = token.cancelled() => break,
                _ = ticker.tick() => match cache.purge().await {
                    Ok(0) => debug!("janitor found nothing to purge"),
                    Ok(removed) => {
                        info!(removed, "janitor purged conversation cache");
                        counter!(names::CACHE_PURGED_KEYS_TOTAL).increment(removed);
                    }
                    Err(e) => {
                        warn!(error = %e, "janitor purge failed");
                        counter!(names::CACHE_ERRORS_TOTAL, "op" => "purge").increment(1);
                    }
                },
            }
        }
        debug!("cache janitor stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use parley_cache::{CacheConfig, MemoryBackend};
    use parley_core::{MessageDraft, MessageId, RoomId, Route, UserId};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn purges_on_each_interval() {
        let backend = Arc::new(MemoryBackend::new());
        let cache = RecencyCache::new(backend.clone(), CacheConfig::default());
        let msg = MessageDraft::group(UserId::new(1), RoomId::new(2), "x")
            .stamp(Route::Group { room_id: RoomId::new(2) }, Utc::now())
            .with_id(MessageId::new(1));
        cache.append(&msg).await.unwrap();

        let token = CancellationToken::new();
        let task = spawn_janitor(cache, Duration::from_secs(60), token.clone());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(!backend.is_empty());

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(backend.is_empty());

        token.cancel();
        task.await.unwrap();
    }
}
