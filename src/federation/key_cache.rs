//! Public Key Caching
//!
//! Keeps fetched remote public keys for a TTL so repeated inbox deliveries
//! from the same actor do not refetch its document.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Cached public key entry
#[derive(Debug, Clone)]
struct CachedKey {
    /// PEM-encoded public key
    pem: String,
    cached_at: Instant,
}

/// Public key cache
///
/// Thread-safe map of keyId to PEM.
pub struct PublicKeyCache {
    cache: RwLock<HashMap<String, CachedKey>>,
    ttl: Duration,
}

impl PublicKeyCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Cached PEM for `key_id`, if present and not expired.
    pub async fn get(&self, key_id: &str) -> Option<String> {
        let cache = self.cache.read().await;
        match cache.get(key_id) {
            Some(cached) if cached.cached_at.elapsed() < self.ttl => {
                tracing::debug!(%key_id, "Public key cache hit");
                Some(cached.pem.clone())
            }
            Some(_) => {
                tracing::debug!(%key_id, "Public key cache expired");
                None
            }
            None => None,
        }
    }

    pub async fn insert(&self, key_id: &str, pem: &str) {
        let mut cache = self.cache.write().await;
        cache.insert(
            key_id.to_string(),
            CachedKey {
                pem: pem.to_string(),
                cached_at: Instant::now(),
            },
        );
    }

    /// Invalidate a cached key
    ///
    /// Used when a signature fails against a cached key, the actor may have rotated it.
    pub async fn invalidate(&self, key_id: &str) {
        let mut cache = self.cache.write().await;
        cache.remove(key_id);
        tracing::debug!(%key_id, "Invalidated public key cache entry");
    }

    /// Get cache statistics
    pub async fn stats(&self) -> CacheStats {
        let cache = self.cache.read().await;
        let total = cache.len();
        let valid = cache
            .values()
            .filter(|v| v.cached_at.elapsed() < self.ttl)
            .count();

        CacheStats {
            total_entries: total,
            valid_entries: valid,
            expired_entries: total - valid,
        }
    }

    /// Prune expired entries
    pub async fn prune_expired(&self) {
        let mut cache = self.cache.write().await;
        let before = cache.len();
        let ttl = self.ttl;
        cache.retain(|_, v| v.cached_at.elapsed() < ttl);
        let removed = before - cache.len();

        if removed > 0 {
            tracing::info!("Pruned {} expired public key cache entries", removed);
        }
    }
}

/// Cache statistics
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub total_entries: usize,
    pub valid_entries: usize,
    pub expired_entries: usize,
}
