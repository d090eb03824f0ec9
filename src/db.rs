use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;

pub struct DbHolder {
    pub db: Db,
}

/// Shared in-memory keyspace. Values and per-key absolute expiries live in
/// two maps guarded by one mutex; expired entries are evicted lazily on read.
#[derive(Clone)]
pub struct Db {
    shared: Arc<Mutex<State>>,
}

#[derive(Debug)]
struct State {
    entries: HashMap<String, Bytes>,
    expirations: HashMap<String, u64>,
}

impl DbHolder {
    pub fn new() -> DbHolder {
        DbHolder { db: Db::new() }
    }

    pub fn db(&self) -> Db {
        self.db.clone()
    }
}

impl Default for DbHolder {
    fn default() -> Self {
        Self::new()
    }
}

impl Db {
    pub fn new() -> Db {
        Db {
            shared: Arc::new(Mutex::new(State {
                entries: HashMap::new(),
                expirations: HashMap::new(),
            })),
        }
    }

    /// Unconditional overwrite. A `ttl_ms` records an absolute expiry of
    /// now + ttl; without one any previous expiry for the key is cleared.
    pub fn set(&self, key: String, value: Bytes, ttl_ms: Option<u64>) {
        let expires_at = ttl_ms.map(|ttl| now_ms() + ttl);

        self.set_at(key, value, expires_at);
    }

    /// Overwrite with an already-absolute expiry timestamp. The snapshot
    /// loader inserts entries whose expiry may already be in the past; they
    /// still land in the map and the next `get` evicts them.
    pub fn set_at(&self, key: String, value: Bytes, expires_at_ms: Option<u64>) {
        let mut state = self.shared.lock().unwrap();

        match expires_at_ms {
            Some(at) => {
                state.expirations.insert(key.clone(), at);
            }
            None => {
                state.expirations.remove(&key);
            }
        }
        state.entries.insert(key, value);
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        let mut state = self.shared.lock().unwrap();

        if let Some(&expires_at) = state.expirations.get(key) {
            if now_ms() > expires_at {
                state.entries.remove(key);
                state.expirations.remove(key);

                return None;
            }
        }

        state.entries.get(key).cloned()
    }

    /// `"*"` matches every key; any other pattern matches keys containing it
    /// as a literal substring. Glob semantics are deliberately absent.
    pub fn keys(&self, pattern: &str) -> Vec<String> {
        let state = self.shared.lock().unwrap();

        if pattern == "*" {
            state.entries.keys().cloned().collect()
        } else {
            state
                .entries
                .keys()
                .filter(|key| key.contains(pattern))
                .cloned()
                .collect()
        }
    }

    pub fn len(&self) -> usize {
        self.shared.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Db {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}
