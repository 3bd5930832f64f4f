//! Request deduplication
//!
//! Identical `(method, params)` pairs seen within the TTL are reported as
//! duplicates. Entries live in a bounded LRU so memory stays flat.

use lru::LruCache;
use parking_lot::Mutex;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::DedupSettings;

#[derive(Debug)]
pub struct RequestDeduplicator {
    ttl: Duration,
    seen: Mutex<LruCache<String, Instant>>,
}

impl RequestDeduplicator {
    pub fn new(ttl: Duration, max_size: usize) -> Self {
        let capacity = NonZeroUsize::new(max_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            ttl,
            seen: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn from_settings(settings: &DedupSettings) -> Self {
        Self::new(Duration::from_secs(settings.ttl_secs), settings.max_size)
    }

    /// Returns true when the request was already seen within the TTL;
    /// otherwise records it and returns false
    pub fn check_and_mark(&self, method: &str, params: &Value) -> bool {
        let key = request_hash(method, params);
        let now = Instant::now();
        let mut seen = self.seen.lock();

        // Expired entries at the cold end go first
        while let Some((_, marked)) = seen.peek_lru() {
            if now.duration_since(*marked) < self.ttl {
                break;
            }
            seen.pop_lru();
        }

        // A hit refreshes recency but not the mark time
        if let Some(marked) = seen.get(&key) {
            if now.duration_since(*marked) < self.ttl {
                tracing::debug!(method, "duplicate request");
                return true;
            }
        }
        seen.put(key, now);
        false
    }

    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.lock().is_empty()
    }

    pub fn clear(&self) {
        self.seen.lock().clear();
    }
}

/// Stable digest of a request, independent of object key order
pub fn request_hash(method: &str, params: &Value) -> String {
    let mut canonical = String::new();
    write_canonical(params, &mut canonical);

    let mut hasher = Sha256::new();
    hasher.update(method.as_bytes());
    hasher.update(b"\n");
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
