use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

/// A stored value with an optional absolute expiry.
#[derive(Debug, Clone)]
pub struct StoredEntry {
    pub value: String,
    pub expires_at: Option<Instant>,
}

impl StoredEntry {
    fn new(value: String, ttl: Option<Duration>) -> Self {
        StoredEntry {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => Instant::now() > expires_at,
            None => false,
        }
    }
}

/// In-memory key-value store shared by the dispatcher and replication.
///
/// Expiry is lazy: expired entries are dropped when a lookup touches them,
/// there is no background sweeper.
#[derive(Clone, Default)]
pub struct Store {
    entries: Arc<RwLock<HashMap<String, StoredEntry>>>,
}

impl Store {
    pub fn new() -> Self {
        Store::default()
    }

    /// Set a key, replacing any previous value and expiry. A `None` TTL
    /// means the entry never expires.
    pub async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) {
        let mut entries = self.entries.write().await;
        entries.insert(key.to_string(), StoredEntry::new(value.to_string(), ttl));
    }

    /// Get a value by key. An entry past its expiry behaves as absent and is
    /// removed, which is why this takes the write lock.
    pub async fn get(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.write().await;
        match entries.get(key) {
            Some(entry) if entry.is_expired() => {
                entries.remove(key);
                None
            }
            Some(entry) => Some(entry.value.clone()),
            None => None,
        }
    }

    /// Number of entries, counting expired ones not yet collected.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
