//! Best-effort cache of rendered API payloads

use crate::config::CacheSettings;
use moka::sync::Cache;
use std::time::Duration;

/// Rendered-response cache. A miss is never an error.
pub trait ResponseCache: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: String);

    /// Cached value for `key`, or the result of `init` stored under it.
    ///
    /// Concurrent callers missing on the same key share a single `init` run.
    /// `None` is handed to every waiter and nothing is stored.
    fn get_or_insert_with(&self, key: &str, init: Box<dyn FnOnce() -> Option<String> + '_>) -> Option<String>;
}

/// In-process cache with bounded size and a time-to-live
pub struct MokaResponseCache {
    inner: Cache<String, String>,
}

impl MokaResponseCache {
    pub fn new(max_capacity: u64, ttl: Duration) -> Self {
        let inner = Cache::builder()
            .max_capacity(max_capacity)
            .time_to_live(ttl)
            .build();
        Self { inner }
    }

    pub fn from_settings(settings: &CacheSettings) -> Self {
        Self::new(settings.max_capacity, Duration::from_secs(settings.ttl_secs))
    }
}

impl ResponseCache for MokaResponseCache {
    fn get(&self, key: &str) -> Option<String> {
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: String) {
        self.inner.insert(key.to_string(), value);
    }

    fn get_or_insert_with(&self, key: &str, init: Box<dyn FnOnce() -> Option<String> + '_>) -> Option<String> {
        self.inner.optionally_get_with(key.to_string(), init)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_and_set() {
        let cache = MokaResponseCache::new(100, Duration::from_secs(60));
        assert_eq!(cache.get("q:alien"), None);

        cache.set("q:alien", "[]".to_string());
        assert_eq!(cache.get("q:alien").as_deref(), Some("[]"));

        // Last write wins
        cache.set("q:alien", "[1]".to_string());
        assert_eq!(cache.get("q:alien").as_deref(), Some("[1]"));
    }

    #[test]
    fn test_get_or_insert_with_computes_once() {
        let cache = MokaResponseCache::new(100, Duration::from_secs(60));
        let mut runs = 0;
        let value = cache.get_or_insert_with("q:alien", Box::new(|| {
            runs += 1;
            Some("[1]".to_string())
        }));
        assert_eq!(value.as_deref(), Some("[1]"));

        let again = cache.get_or_insert_with("q:alien", Box::new(|| Some("[2]".to_string())));
        assert_eq!(again.as_deref(), Some("[1]"));
        assert_eq!(runs, 1);
    }

    #[test]
    fn test_get_or_insert_with_skips_none() {
        let cache = MokaResponseCache::new(100, Duration::from_secs(60));
        assert_eq!(cache.get_or_insert_with("q:zzz", Box::new(|| None)), None);
        assert_eq!(cache.get("q:zzz"), None);
    }

    #[test]
    fn test_entries_expire() {
        let cache = MokaResponseCache::new(100, Duration::from_millis(50));
        cache.set("id:/m/1", "{}".to_string());
        std::thread::sleep(Duration::from_millis(120));
        assert_eq!(cache.get("id:/m/1"), None);
    }
}
