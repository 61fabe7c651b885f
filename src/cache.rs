// Expiring credential cache

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::Result;

#[derive(Clone, Debug)]
struct Entry<V> {
    value: V,
    expires_at: DateTime<Utc>,
}

/// Thread-safe key → (value, expiry) store with lazy eviction.
///
/// Entries observed at or after their expiry are reported absent. Concurrent
/// misses for the same key can be coalesced with [`ExpiringCache::get_or_try_insert_with`].
pub struct ExpiringCache<V = String> {
    /// Live entries indexed by cache key
    entries: Arc<DashMap<String, Entry<V>>>,

    /// Per-key gates for in-flight fetches
    inflight: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl<V: Clone + Send + Sync + 'static> ExpiringCache<V> {
    /// Create an empty cache
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            inflight: Arc::new(DashMap::new()),
        }
    }

    /// Store a value for `ttl`
    pub fn set(&self, key: &str, value: V, ttl: Duration) {
        self.set_until(key, value, Utc::now() + ttl);
    }

    /// Store a value until an absolute instant
    pub fn set_until(&self, key: &str, value: V, expires_at: DateTime<Utc>) {
        self.entries
            .insert(key.to_string(), Entry { value, expires_at });
    }

    /// Get a live value
    pub fn get(&self, key: &str) -> Option<V> {
        self.get_with_expiration(key).map(|(value, _)| value)
    }

    /// Get a live value together with its expiry
    pub fn get_with_expiration(&self, key: &str) -> Option<(V, DateTime<Utc>)> {
        let now = Utc::now();
        let hit = self
            .entries
            .get(key)
            .map(|entry| (entry.value.clone(), entry.expires_at))?;

        if hit.1 <= now {
            self.entries.remove_if(key, |_, entry| entry.expires_at <= now);
            return None;
        }
        Some(hit)
    }

    /// Drop an entry regardless of expiry
    pub fn invalidate(&self, key: &str) {
        self.entries.remove(key);
    }

    /// Remove every expired entry, returning how many were dropped
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before - self.entries.len()
    }

    /// Number of stored entries, including expired ones not yet evicted
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the cache is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Return the live value or run `fetch` once per key to produce it.
    ///
    /// Callers racing on the same key wait for the first fetch and reuse its
    /// result. A failed fetch is not cached; the next waiter retries.
    pub async fn get_or_try_insert_with<F, Fut>(
        &self,
        key: &str,
        fetch: F,
    ) -> Result<(V, DateTime<Utc>)>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(V, DateTime<Utc>)>>,
    {
        if let Some(hit) = self.get_with_expiration(key) {
            return Ok(hit);
        }

        let flight = InFlight {
            inflight: &self.inflight,
            key,
            gate: self
                .inflight
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone(),
        };

        let _guard = flight.gate.lock().await;
        if let Some(hit) = self.get_with_expiration(key) {
            return Ok(hit);
        }

        let fetched = fetch().await;
        if let Ok((value, expires_at)) = &fetched {
            self.set_until(key, value.clone(), *expires_at);
        }
        fetched
    }
}

/// Releases a per-key gate, also when the fetching future is dropped
struct InFlight<'a> {
    inflight: &'a DashMap<String, Arc<Mutex<()>>>,
    key: &'a str,
    gate: Arc<Mutex<()>>,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        // Only the map and this guard hold the gate: nobody is waiting on it
        self.inflight
            .remove_if(self.key, |_, g| Arc::ptr_eq(g, &self.gate) && Arc::strong_count(g) <= 2);
    }
}

impl<V: Clone + Send + Sync + 'static> Default for ExpiringCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Clone for ExpiringCache<V> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
            inflight: Arc::clone(&self.inflight),
        }
    }
}
