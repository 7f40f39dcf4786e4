use std::time::Duration;

use async_trait::async_trait;

use crate::error::CacheError;

/// The list-store primitives the recency cache is built on. Semantics follow
/// Redis: indices may be negative (counting from the tail), ranges are
/// inclusive, and operations on a missing key behave as on an empty list.
#[async_trait]
pub trait ListBackend: Send + Sync + 'static {
    /// Push `value` at the head of the list at `key`, creating it if needed.
    async fn lpush(&self, key: &str, value: String) -> Result<(), CacheError>;

    /// Set the time-to-live of `key`. A missing key is not an error.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), CacheError>;

    /// Keep only `start..=stop`.
    async fn ltrim(&self, key: &str, start: isize, stop: isize) -> Result<(), CacheError>;

    async fn lrange(&self, key: &str, start: isize, stop: isize)
        -> Result<Vec<String>, CacheError>;

    /// Every live key matching a glob `pattern` (`*` wildcards only).
    async fn scan(&self, pattern: &str) -> Result<Vec<String>, CacheError>;

    /// Delete `keys`, returning how many existed.
    async fn del(&self, keys: &[String]) -> Result<u64, CacheError>;
}

/// Resolve a Redis-style inclusive range against a list of `len` items.
pub(crate) fn resolve_range(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    let len = isize::try_from(len).ok()?;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len {
        return None;
    }
    Some((usize::try_from(start).ok()?, usize::try_from(stop).ok()?))
}

/// Match `key` against a glob made of literal segments and `*`.
pub(crate) fn glob_match(pattern: &str, key: &str) -> bool {
    let mut parts = pattern.split('*');
    let Some(first) = parts.next() else {
        return key.is_empty();
    };
    let Some(mut rest) = key.strip_prefix(first) else {
        return false;
    };
    let tail: Vec<&str> = parts.collect();
    let Some((last, middle)) = tail.split_last() else {
        return rest.is_empty();
    };
    for part in middle {
        match rest.find(part) {
            Some(pos) => rest = &rest[pos + part.len()..],
            None => return false,
        }
    }
    rest.len() >= last.len() && rest.ends_with(last)
}
