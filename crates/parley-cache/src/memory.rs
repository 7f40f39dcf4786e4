//! In-process [`ListBackend`].
//!
//! Expiry uses `tokio::time::Instant`, so tests running on a paused clock
//! can advance past a TTL. Expired keys are dropped lazily on access.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::backend::{glob_match, resolve_range, ListBackend};
use crate::error::CacheError;

struct Entry {
    items: VecDeque<String>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Default)]
pub struct MemoryBackend {
    lists: Mutex<HashMap<String, Entry>>,
    unavailable: AtomicBool,
    poisoned: Mutex<HashSet<String>>,
    latency: Mutex<Option<Duration>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with [`CacheError::Unavailable`].
    pub fn set_unavailable(&self, down: bool) {
        self.unavailable.store(down, Ordering::SeqCst);
    }

    /// Make reads of one key fail while the rest of the backend works.
    pub fn poison_key(&self, key: impl Into<String>) {
        let _ = self.poisoned.lock().insert(key.into());
    }

    /// Delay every call by `latency` before it runs.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// Remaining time-to-live of a live key.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let lists = self.lists.lock();
        let entry = lists.get(key).filter(|e| e.is_live(now))?;
        entry.expires_at.map(|at| at.saturating_duration_since(now))
    }

    pub fn len(&self, key: &str) -> usize {
        let now = Instant::now();
        self.lists
            .lock()
            .get(key)
            .filter(|e| e.is_live(now))
            .map_or(0, |e| e.items.len())
    }

    pub fn is_empty(&self) -> bool {
        let now = Instant::now();
        !self.lists.lock().values().any(|e| e.is_live(now))
    }

    async fn enter(&self) -> Result<(), CacheError> {
        let latency = *self.latency.lock();
        if let Some(delay) = latency {
            tokio::time::sleep(delay).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CacheError::Unavailable);
        }
        Ok(())
    }

    fn with_live<T>(&self, key: &str, f: impl FnOnce(Option<&mut Entry>) -> T) -> T {
        let now = Instant::now();
        let mut lists = self.lists.lock();
        if lists.get(key).is_some_and(|e| !e.is_live(now)) {
            let _ = lists.remove(key);
        }
        f(lists.get_mut(key))
    }
}

#[async_trait]
impl ListBackend for MemoryBackend {
    async fn lpush(&self, key: &str, value: String) -> Result<(), CacheError> {
        self.enter().await?;
        let now = Instant::now();
        let mut lists = self.lists.lock();
        let entry = lists.entry(key.to_string()).or_insert_with(|| Entry {
            items: VecDeque::new(),
            expires_at: None,
        });
        if !entry.is_live(now) {
            entry.items.clear();
            entry.expires_at = None;
        }
        entry.items.push_front(value);
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), CacheError> {
        self.enter().await?;
        self.with_live(key, |entry| {
            if let Some(entry) = entry {
                entry.expires_at = Some(Instant::now() + ttl);
            }
        });
        Ok(())
    }

    async fn ltrim(&self, key: &str, start: isize, stop: isize) -> Result<(), CacheError> {
        self.enter().await?;
        self.with_live(key, |entry| {
            if let Some(entry) = entry {
                match resolve_range(entry.items.len(), start, stop) {
                    Some((from, to)) => {
                        entry.items.truncate(to + 1);
                        drop(entry.items.drain(..from));
                    }
                    None => entry.items.clear(),
                }
            }
        });
        Ok(())
    }

    async fn lrange(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, CacheError> {
        self.enter().await?;
        if self.poisoned.lock().contains(key) {
            return Err(CacheError::Backend(format!("poisoned key {key}")));
        }
        Ok(self.with_live(key, |entry| {
            entry
                .and_then(|e| {
                    resolve_range(e.items.len(), start, stop)
                        .map(|(from, to)| e.items.range(from..=to).cloned().collect())
                })
                .unwrap_or_default()
        }))
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        self.enter().await?;
        let now = Instant::now();
        let lists = self.lists.lock();
        let mut keys: Vec<String> = lists
            .iter()
            .filter(|(k, e)| e.is_live(now) && !e.items.is_empty() && glob_match(pattern, k))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn del(&self, keys: &[String]) -> Result<u64, CacheError> {
        self.enter().await?;
        let now = Instant::now();
        let mut lists = self.lists.lock();
        let mut removed = 0;
        for key in keys {
            if lists.remove(key).is_some_and(|e| e.is_live(now)) {
                removed += 1;
            }
        }
        Ok(removed)
    }
}
