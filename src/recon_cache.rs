//! Bounded, TTL'd, single-flight recon result cache
//!
//! Built on `dashmap`, plus a per-key `tokio::sync::Mutex` guard so
//! concurrent callers for the same host share one in-flight probe instead
//! of duplicating the work.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

use crate::recon::ReconResult;

struct Entry {
    result: ReconResult,
    inserted_at: Instant,
}

/// Single-flight slot: while `busy` is held, concurrent callers for the
/// same host await the same future instead of re-probing.
type FlightSlot = Arc<AsyncMutex<()>>;

pub struct ReconCache {
    entries: DashMap<String, Entry>,
    flights: DashMap<String, FlightSlot>,
    ttl: Duration,
    capacity: usize,
    lru_order: StdMutex<VecDeque<String>>,
}

impl ReconCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            flights: DashMap::new(),
            ttl,
            capacity,
            lru_order: StdMutex::new(VecDeque::new()),
        }
    }

    pub fn with_default_ttl(capacity: usize) -> Self {
        Self::new(capacity, Duration::from_secs(120 * 60))
    }

    fn normalize(host: &str) -> String {
        host.to_ascii_lowercase()
    }

    /// Moves `key` to the back of the LRU queue, removing any prior
    /// occurrence first so the queue never accumulates duplicates for one
    /// key and `pop_front` always evicts true recency order.
    fn touch_lru(&self, key: &str) {
        let mut order = self.lru_order.lock().unwrap();
        if let Some(pos) = order.iter().position(|k| k == key) {
            order.remove(pos);
        }
        order.push_back(key.to_string());
    }

    fn remove_from_lru(&self, key: &str) {
        let mut order = self.lru_order.lock().unwrap();
        if let Some(pos) = order.iter().position(|k| k == key) {
            order.remove(pos);
        }
    }

    /// Returns `None` on miss or expiry. A hit promotes the entry to
    /// most-recently-used.
    pub fn get(&self, host: &str) -> Option<ReconResult> {
        let key = Self::normalize(host);
        let entry = self.entries.get(&key)?;
        if entry.inserted_at.elapsed() >= self.ttl {
            drop(entry);
            self.entries.remove(&key);
            self.remove_from_lru(&key);
            return None;
        }
        let result = entry.result.clone();
        drop(entry);
        self.touch_lru(&key);
        Some(result)
    }

    /// Best-effort insert; evicts the least-recently-used key at capacity,
    /// logging on failure as specified.
    pub fn set(&self, host: &str, result: ReconResult) {
        let key = Self::normalize(host);

        if self.entries.len() >= self.capacity && !self.entries.contains_key(&key) {
            let evicted = self.lru_order.lock().unwrap().pop_front();
            if let Some(evicted_key) = evicted {
                self.entries.remove(&evicted_key);
            } else {
                debug!("recon cache at capacity with no LRU candidate; skipping insert for {host}");
                return;
            }
        }

        self.touch_lru(&key);
        self.entries.insert(
            key,
            Entry {
                result,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Acquires (creating if needed) the single-flight slot for `host`.
    /// Callers hold the returned guard for the duration of their probe;
    /// a second caller for the same host blocks here until the first
    /// finishes, then re-checks `get` and shares the completed result.
    pub fn flight_slot(&self, host: &str) -> FlightSlot {
        let key = Self::normalize(host);
        self.flights
            .entry(key)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn dummy_result(host: &str) -> ReconResult {
        ReconResult {
            hostname: host.to_string(),
            cnames: Default::default(),
            ipv4_services: BTreeMap::new(),
            ipv6_services: BTreeMap::new(),
        }
    }

    #[test]
    fn miss_then_hit() {
        let cache = ReconCache::with_default_ttl(4);
        assert!(cache.get("example.com").is_none());
        cache.set("example.com", dummy_result("example.com"));
        assert!(cache.get("EXAMPLE.com").is_some());
    }

    #[test]
    fn expiry_evicts() {
        let cache = ReconCache::new(4, Duration::from_millis(1));
        cache.set("example.com", dummy_result("example.com"));
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get("example.com").is_none());
    }

    #[test]
    fn lru_eviction_at_capacity() {
        let cache = ReconCache::new(2, Duration::from_secs(60));
        cache.set("a.com", dummy_result("a.com"));
        cache.set("b.com", dummy_result("b.com"));
        cache.set("c.com", dummy_result("c.com"));
        assert!(cache.get("a.com").is_none());
        assert!(cache.get("b.com").is_some());
        assert!(cache.get("c.com").is_some());
    }

    #[test]
    fn get_promotes_entry_so_it_survives_eviction() {
        let cache = ReconCache::new(2, Duration::from_secs(60));
        cache.set("a.com", dummy_result("a.com"));
        cache.set("b.com", dummy_result("b.com"));
        // Touching "a.com" makes "b.com" the least-recently-used entry.
        assert!(cache.get("a.com").is_some());
        cache.set("c.com", dummy_result("c.com"));
        assert!(cache.get("b.com").is_none());
        assert!(cache.get("a.com").is_some());
        assert!(cache.get("c.com").is_some());
    }
}
