use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Replay cache for the `Idempotency-Key` header: a repeated mutating call
/// within the TTL gets the original status and body back instead of being
/// re-executed.
pub struct IdempotencyCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, Entry>>,
}

struct Entry {
    stored_at: Instant,
    status: u16,
    body: serde_json::Value,
}

impl IdempotencyCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<(u16, serde_json::Value)> {
        let entries = self.entries.lock().ok()?;
        let entry = entries.get(key)?;
        if entry.stored_at.elapsed() > self.ttl {
            return None;
        }
        Some((entry.status, entry.body.clone()))
    }

    pub fn store(&self, key: String, status: u16, body: serde_json::Value) {
        let Ok(mut entries) = self.entries.lock() else {
            return;
        };
        // Purge on write so the map stays bounded by the live window.
        let ttl = self.ttl;
        entries.retain(|_, e| e.stored_at.elapsed() <= ttl);
        entries.insert(
            key,
            Entry {
                stored_at: Instant::now(),
                status,
                body,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn replays_within_ttl() {
        let cache = IdempotencyCache::new(Duration::from_secs(300));
        assert!(cache.get("register:abc").is_none());

        cache.store("register:abc".into(), 200, json!({"outcome": "registered"}));
        let (status, body) = cache.get("register:abc").unwrap();
        assert_eq!(status, 200);
        assert_eq!(body["outcome"], "registered");
    }

    #[test]
    fn keys_are_scoped_per_endpoint() {
        let cache = IdempotencyCache::new(Duration::from_secs(300));
        cache.store("register:abc".into(), 200, json!({}));
        assert!(cache.get("release:abc").is_none());
    }

    #[test]
    fn entries_expire_after_ttl() {
        let cache = IdempotencyCache::new(Duration::from_millis(10));
        cache.store("heartbeat:k".into(), 200, json!({}));
        std::thread::sleep(Duration::from_millis(25));
        assert!(cache.get("heartbeat:k").is_none());

        // A new write purges the expired entry entirely.
        cache.store("other:k".into(), 200, json!({}));
        let entries = cache.entries.lock().unwrap();
        assert_eq!(entries.len(), 1);
    }
}
