use std::time::{Duration, Instant};

use gravastar_lib::canonical_name;
use hashlink::LinkedHashMap;

/// The request fingerprint used as the cache key.
pub fn cache_key(name: &str, qtype: u16) -> String {
    format!("{}|{}", canonical_name(name), qtype)
}

struct CacheEntry {
    response: Vec<u8>,
    size: usize,
    expires_at: Instant,
}

/// Byte-budgeted TTL+LRU cache of raw upstream responses. Front of the map
/// is least-recent. Not internally synchronized: the shared state wraps it
/// in a mutex.
pub struct DnsCache {
    max_bytes: usize,
    ttl: Duration,
    current_bytes: usize,
    entries: LinkedHashMap<String, CacheEntry>,
}

impl DnsCache {
    pub fn new(max_bytes: usize, ttl: Duration) -> Self {
        DnsCache {
            max_bytes,
            ttl,
            current_bytes: 0,
            entries: LinkedHashMap::new(),
        }
    }

    /// Updates the budget and the TTL for subsequent inserts. Existing
    /// expiries are left as they are.
    pub fn set_limits(&mut self, max_bytes: usize, ttl: Duration) {
        self.max_bytes = max_bytes;
        self.ttl = ttl;
        self.evict_over_budget();
    }

    pub fn get(&mut self, key: &str) -> Option<Vec<u8>> {
        self.evict_expired();
        // Re-inserting moves the entry to the most-recent end
        let entry = self.entries.remove(key)?;
        let response = entry.response.clone();
        self.entries.insert(key.to_string(), entry);
        Some(response)
    }

    pub fn put(&mut self, key: &str, response: &[u8]) {
        self.evict_expired();
        if let Some(old) = self.entries.remove(key) {
            self.current_bytes -= old.size;
        }
        let entry = CacheEntry {
            response: response.to_vec(),
            size: response.len(),
            expires_at: Instant::now() + self.ttl,
        };
        self.current_bytes += entry.size;
        self.entries.insert(key.to_string(), entry);
        self.evict_over_budget();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn current_bytes(&self) -> usize {
        self.current_bytes
    }

    fn evict_expired(&mut self) {
        let now = Instant::now();
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            if let Some(entry) = self.entries.remove(&key) {
                self.current_bytes -= entry.size;
            }
        }
    }

    fn evict_over_budget(&mut self) {
        while self.current_bytes > self.max_bytes {
            match self.entries.pop_front() {
                Some((_, entry)) => self.current_bytes -= entry.size,
                None => break,
            }
        }
    }
}
