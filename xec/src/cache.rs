//! # Result Cache
//!
//! A keyed, TTL'd store of [`Outcome`]s with singleflight collapsing of concurrent
//! lookups for the same key (§4.12), grounded on the pack's
//! `operation_monitor::Operation` — a `RwLock<HashMap<..>>` of entries each paired
//! with an `Arc<Notify>` so a late arrival waits on the in-flight computation rather
//! than duplicating it.
//!
//! Cache and retry interact outer-only (§4 Open Questions): a `retry`-wrapped handle
//! that is itself wrapped in `cache` consults the cache once, before the retry loop
//! starts; individual retry attempts inside the loop always hit the adapter.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use crate::outcome::Outcome;

#[derive(Clone)]
struct Entry {
    outcome: Outcome,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self) -> bool {
        matches!(self.expires_at, Some(deadline) if Instant::now() >= deadline)
    }
}

/// Running totals, useful for diagnostics and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub stores: u64,
    pub invalidations: u64,
}

/// Options controlling how a single cached call behaves.
#[derive(Debug, Clone, Default)]
pub struct CacheOptions {
    /// Overrides the canonical key with a caller-chosen one.
    pub key: Option<String>,
    /// `None` or `Duration::ZERO` means the entry never expires.
    pub ttl: Option<Duration>,
    /// After a successful call, delete every cached entry whose key matches one of
    /// these patterns. A trailing `*` is a prefix glob; anything else is an exact match.
    pub invalidate_on: Vec<String>,
}

impl CacheOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn invalidate_on(mut self, patterns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.invalidate_on = patterns.into_iter().map(Into::into).collect();
        self
    }
}

/// A shared, singleflight-collapsing result cache.
#[derive(Default)]
pub struct ResultCache {
    entries: RwLock<HashMap<String, Entry>>,
    in_flight: Mutex<HashMap<String, Arc<Notify>>>,
    stats: Mutex<CacheStats>,
}

impl std::fmt::Debug for ResultCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCache").field("stats", &self.stats()).finish()
    }
}

/// What a cache lookup should do next.
pub enum Lookup {
    /// A live entry was found; here it is.
    Hit(Outcome),
    /// No live entry exists and this caller won the right to compute one. It must
    /// call [`ResultCache::store`] (success) or [`ResultCache::miss_without_store`]
    /// (failure, or success the caller chose not to cache) when done, so waiters
    /// parked behind the returned token get woken either way.
    Miss,
}

impl ResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> CacheStats {
        *self.stats.lock().expect("cache stats lock poisoned")
    }

    /// Looks up `key`. Concurrent callers racing on the same key after a miss all
    /// park on the same `Notify` rather than each computing their own result; only
    /// one of them receives [`Lookup::Miss`], and the others are woken once it calls
    /// [`Self::store`] or [`Self::miss_without_store`], at which point they re-check
    /// the entry table.
    pub async fn lookup(&self, key: &str) -> Lookup {
        loop {
            if let Some(entry) = self.entries.read().expect("cache entries lock poisoned").get(key).cloned() {
                if !entry.is_expired() {
                    self.stats.lock().expect("cache stats lock poisoned").hits += 1;
                    return Lookup::Hit(entry.outcome);
                }
            }

            let notify = {
                let mut in_flight = self.in_flight.lock().expect("cache in-flight lock poisoned");
                if let Some(existing) = in_flight.get(key) {
                    existing.clone()
                } else {
                    let notify = Arc::new(Notify::new());
                    in_flight.insert(key.to_string(), notify.clone());
                    self.stats.lock().expect("cache stats lock poisoned").misses += 1;
                    return Lookup::Miss;
                }
            };

            notify.notified().await;
        }
    }

    /// Records a successful `outcome` under `key` and wakes anyone parked behind it.
    pub fn store(&self, key: &str, outcome: Outcome, ttl: Option<Duration>) {
        let expires_at = ttl.filter(|d| !d.is_zero()).map(|d| Instant::now() + d);
        self.entries
            .write()
            .expect("cache entries lock poisoned")
            .insert(key.to_string(), Entry { outcome, expires_at });
        self.stats.lock().expect("cache stats lock poisoned").stores += 1;
        self.wake(key);
    }

    /// Releases the in-flight slot without caching anything (failed or opted-out
    /// results), waking anyone parked behind it so they retry independently.
    pub fn miss_without_store(&self, key: &str) {
        self.wake(key);
    }

    fn wake(&self, key: &str) {
        if let Some(notify) = self.in_flight.lock().expect("cache in-flight lock poisoned").remove(key) {
            notify.notify_waiters();
        }
    }

    /// Deletes every entry whose key matches one of `patterns` (trailing `*` is a
    /// prefix glob).
    pub fn invalidate(&self, patterns: &[String]) {
        if patterns.is_empty() {
            return;
        }
        let mut entries = self.entries.write().expect("cache entries lock poisoned");
        let before = entries.len();
        entries.retain(|key, _| !patterns.iter().any(|pattern| glob_matches(pattern, key)));
        let removed = before - entries.len();
        if removed > 0 {
            self.stats.lock().expect("cache stats lock poisoned").invalidations += removed as u64;
        }
    }
}

fn glob_matches(pattern: &str, key: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => key.starts_with(prefix),
        None => pattern == key,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;

    fn sample_outcome(stdout: &str) -> Outcome {
        Outcome {
            stdout: stdout.as_bytes().to_vec(),
            stderr: Vec::new(),
            exit_code: Some(0),
            signal: None,
            command_line: "echo".to_string(),
            duration: Duration::from_millis(1),
            started_at: SystemTime::now(),
            finished_at: SystemTime::now(),
            adapter: "local".to_string(),
            host: None,
            container: None,
            pod: None,
        }
    }

    #[tokio::test]
    async fn miss_then_store_then_hit() {
        let cache = ResultCache::new();
        assert!(matches!(cache.lookup("k").await, Lookup::Miss));
        cache.store("k", sample_outcome("hello"), None);
        match cache.lookup("k").await {
            Lookup::Hit(outcome) => assert_eq!(outcome.stdout, b"hello"),
            Lookup::Miss => panic!("expected a hit after store"),
        }
        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.stores, 1);
    }

    #[tokio::test]
    async fn expired_entries_are_treated_as_absent() {
        let cache = ResultCache::new();
        cache.store("k", sample_outcome("hello"), Some(Duration::from_millis(1)));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(matches!(cache.lookup("k").await, Lookup::Miss));
    }

    #[tokio::test]
    async fn concurrent_lookups_collapse_into_one_miss() {
        let cache = Arc::new(ResultCache::new());
        let second = cache.clone();
        let second_task = tokio::spawn(async move { matches!(second.lookup("k").await, Lookup::Hit(_)) });

        // give the second lookup a chance to park behind the first miss
        tokio::task::yield_now().await;
        assert!(matches!(cache.lookup("k").await, Lookup::Miss));
        cache.store("k", sample_outcome("hello"), None);

        assert!(second_task.await.unwrap());
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn glob_matches_trailing_star_as_prefix() {
        assert!(glob_matches("build:*", "build:frontend"));
        assert!(!glob_matches("build:*", "deploy:frontend"));
        assert!(glob_matches("exact", "exact"));
        assert!(!glob_matches("exact", "exactly"));
    }

    #[test]
    fn invalidate_removes_matching_entries_only() {
        let cache = ResultCache::new();
        cache.store("build:a", sample_outcome("a"), None);
        cache.store("build:b", sample_outcome("b"), None);
        cache.store("deploy:a", sample_outcome("c"), None);
        cache.invalidate(&["build:*".to_string()]);
        assert_eq!(cache.entries.read().unwrap().len(), 1);
        assert_eq!(cache.stats().invalidations, 2);
    }
}
