//! TTL key-value store for resident signals
//!
//! Small shared store for flags that outlive a single task run but are not
//! worth persisting to disk. Keys may carry a time-to-live; expired entries
//! are dropped lazily on read and swept when the full map is requested.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now > at)
    }
}

/// Thread-safe TTL store
#[derive(Default)]
pub struct StateStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a value; `ttl = None` never expires. Re-setting without a TTL
    /// clears any previous expiry.
    pub fn set(&self, key: &str, value: Value, ttl: Option<Duration>) {
        let expires_at = ttl.map(|d| Instant::now() + d);
        self.entries
            .lock()
            .insert(key.to_string(), Entry { value, expires_at });
        debug!(key, ttl = ?ttl, "state store set");
    }

    /// Get a value; expired keys are removed and read as absent.
    pub fn get(&self, key: &str) -> Option<Value> {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        match entries.get(key) {
            Some(entry) if entry.expired(now) => {
                entries.remove(key);
                None
            }
            Some(entry) => Some(entry.value.clone()),
            None => None,
        }
    }

    pub fn delete(&self, key: &str) -> bool {
        self.entries.lock().remove(key).is_some()
    }

    /// All live entries, sweeping expired ones first.
    pub fn all(&self) -> HashMap<String, Value> {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        entries.retain(|_, entry| !entry.expired(now));
        entries
            .iter()
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_set_get_delete() {
        let store = StateStore::new();
        store.set("flag", json!(true), None);
        assert_eq!(store.get("flag"), Some(json!(true)));
        assert!(store.delete("flag"));
        assert!(!store.delete("flag"));
        assert_eq!(store.get("flag"), None);
    }

    #[test]
    fn test_ttl_expiry() {
        let store = StateStore::new();
        store.set("short", json!(1), Some(Duration::from_nanos(1)));
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(store.get("short"), None);
        assert!(store.is_empty());
    }

    #[test]
    fn test_reset_clears_ttl() {
        let store = StateStore::new();
        store.set("k", json!(1), Some(Duration::from_nanos(1)));
        store.set("k", json!(2), None);
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(store.get("k"), Some(json!(2)));
    }

    #[test]
    fn test_all_sweeps_expired() {
        let store = StateStore::new();
        store.set("live", json!(1), None);
        store.set("dead", json!(2), Some(Duration::from_nanos(1)));
        std::thread::sleep(Duration::from_millis(2));
        let all = store.all();
        assert_eq!(all.len(), 1);
        assert!(all.contains_key("live"));
    }
}
