//! In-memory render cache. Amortizes headless-render cost within one run:
//! bounded, LRU-evicting, TTL-expiring, and never persisted.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

/// Cache key for a canonical URL.
pub fn cache_key(canonical_url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_url.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone)]
pub struct CachedRender {
    pub body: String,
    /// Content hash of the rendered body at insert time.
    pub fingerprint: String,
}

struct Entry {
    body: String,
    fingerprint: String,
    inserted_at: Instant,
}

struct CacheInner {
    map: HashMap<String, Entry>,
    /// Back of the deque is most recently used.
    order: Vec<String>,
}

pub struct RenderCache {
    inner: Mutex<CacheInner>,
    capacity: usize,
    ttl: Duration,
}

impl RenderCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        RenderCache {
            inner: Mutex::new(CacheInner {
                map: HashMap::new(),
                order: Vec::new(),
            }),
            capacity: capacity.max(1),
            ttl,
        }
    }

    pub fn get(&self, key: &str) -> Option<CachedRender> {
        let mut inner = self.inner.lock().unwrap();
        let expired = match inner.map.get(key) {
            Some(entry) => entry.inserted_at.elapsed() >= self.ttl,
            None => return None,
        };
        if expired {
            inner.map.remove(key);
            inner.order.retain(|k| k != key);
            return None;
        }
        // Promote to most recently used.
        inner.order.retain(|k| k != key);
        inner.order.push(key.to_string());
        let entry = &inner.map[key];
        Some(CachedRender {
            body: entry.body.clone(),
            fingerprint: entry.fingerprint.clone(),
        })
    }

    pub fn put(&self, key: String, body: String, fingerprint: String) {
        let mut inner = self.inner.lock().unwrap();
        if inner.map.contains_key(&key) {
            inner.order.retain(|k| k != &key);
        }
        while inner.map.len() >= self.capacity && !inner.map.contains_key(&key) {
            if inner.order.is_empty() {
                break;
            }
            let oldest = inner.order.remove(0);
            inner.map.remove(&oldest);
        }
        inner.map.insert(
            key.clone(),
            Entry {
                body,
                fingerprint,
                inserted_at: Instant::now(),
            },
        );
        inner.order.push(key);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
