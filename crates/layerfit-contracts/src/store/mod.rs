//! Fast local cache tier and the per-client session identifier.

mod cache;

use std::collections::HashMap;
use std::sync::Mutex;

use thiserror::Error;
use uuid::Uuid;

pub use cache::FileCache;

pub const SESSION_ID_KEY: &str = "layerfit_session_id";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache quota exceeded ({needed} bytes needed, {quota} allowed)")]
    QuotaExceeded { needed: usize, quota: usize },

    #[error("cache write failed: {0}")]
    Io(String),
}

/// Synchronous string key/value tier with a size quota.
pub trait LocalCache: Send + Sync {
    fn set(&self, key: &str, value: &str) -> Result<(), CacheError>;
    fn get(&self, key: &str) -> Option<String>;
    fn remove(&self, key: &str) -> Result<(), CacheError>;
}

/// In-process cache, mostly for tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, String>>,
    quota: Option<usize>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(quota: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            quota: Some(quota),
        }
    }
}

impl LocalCache for MemoryCache {
    fn set(&self, key: &str, value: &str) -> Result<(), CacheError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| CacheError::Io("memory cache lock poisoned".to_string()))?;
        if let Some(quota) = self.quota {
            let others: usize = entries
                .iter()
                .filter(|(existing, _)| existing.as_str() != key)
                .map(|(existing, stored)| existing.len() + stored.len())
                .sum();
            let needed = others + key.len() + value.len();
            if needed > quota {
                return Err(CacheError::QuotaExceeded { needed, quota });
            }
        }
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().ok()?.get(key).cloned()
    }

    fn remove(&self, key: &str) -> Result<(), CacheError> {
        self.entries
            .lock()
            .map_err(|_| CacheError::Io("memory cache lock poisoned".to_string()))?
            .remove(key);
        Ok(())
    }
}

/// Returns this client's session key, generating and storing one on first
/// use. The key is reused across restarts for as long as the cache keeps it.
pub fn session_key(cache: &dyn LocalCache) -> String {
    if let Some(existing) = cache.get(SESSION_ID_KEY).filter(|value| !value.trim().is_empty()) {
        return existing;
    }
    let fresh = format!("session_{}", Uuid::new_v4().simple());
    if let Err(err) = cache.set(SESSION_ID_KEY, &fresh) {
        tracing::warn!(error = %err, "session key could not be cached; it will not survive a restart");
    }
    fresh
}

/// Cache key under which a session's serialized state is kept.
pub fn state_key(session_key: &str) -> String {
    format!("layerfit_state_{session_key}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_key_is_generated_once_and_reused() {
        let cache = MemoryCache::new();
        let first = session_key(&cache);
        assert!(first.starts_with("session_"));
        assert_eq!(session_key(&cache), first);
    }

    #[test]
    fn distinct_clients_get_distinct_keys() {
        assert_ne!(session_key(&MemoryCache::new()), session_key(&MemoryCache::new()));
    }

    #[test]
    fn memory_cache_enforces_quota_per_total_size() {
        let cache = MemoryCache::with_quota(16);
        assert!(cache.set("a", "12345").is_ok());
        let err = cache.set("b", "1234567890123");
        assert!(matches!(err, Err(CacheError::QuotaExceeded { .. })));
        assert!(cache.get("b").is_none());
        assert!(cache.set("a", "123456789012345").is_ok());
    }
}
