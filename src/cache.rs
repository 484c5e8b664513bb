//! A thread-safe in-memory cache of snapshots keyed by project and environment, with TTL-based
//! eviction. Meant for servers that create one engine per request: the snapshot is fetched once
//! per TTL and shared between engines.
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
    time::Duration,
};

use chrono::{DateTime, Utc};

use crate::snapshot::ServerSnapshot;

struct CacheEntry {
    snapshot: Arc<ServerSnapshot>,
    expires_at: DateTime<Utc>,
}

/// `ConfigCache` provides concurrent access for readers and writers. Expired entries are never
/// returned and are evicted lazily.
pub struct ConfigCache {
    ttl: chrono::Duration,
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl ConfigCache {
    /// Default time-to-live of cached snapshots.
    pub const DEFAULT_TTL: Duration = Duration::from_secs(10);

    /// Create an empty cache whose entries live for `ttl`.
    pub fn new(ttl: Duration) -> ConfigCache {
        ConfigCache {
            ttl: chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX),
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Cache key of a project and environment.
    pub fn key(project_id: &str, environment: &str) -> String {
        format!("{project_id},{environment}")
    }

    /// Get a live snapshot. Returns `None` if absent or expired.
    pub fn get(&self, key: &str) -> Option<Arc<ServerSnapshot>> {
        self.get_at(key, Utc::now())
    }

    /// Store `snapshot` under `key`, replacing any previous value.
    pub fn set(&self, key: impl Into<String>, snapshot: ServerSnapshot) {
        self.set_at(key.into(), snapshot, Utc::now());
    }

    /// Remove `key`. Returns `true` if a value was removed.
    pub fn delete(&self, key: &str) -> bool {
        match self.entries.write() {
            Ok(mut entries) => entries.remove(key).is_some(),
            Err(_) => false,
        }
    }

    /// Evict every expired entry.
    pub fn purge_expired(&self) {
        self.purge_expired_at(Utc::now());
    }

    fn get_at(&self, key: &str, now: DateTime<Utc>) -> Option<Arc<ServerSnapshot>> {
        {
            // A poisoned lock means a writer panicked; behave as an empty cache.
            let entries = self.entries.read().ok()?;
            let entry = entries.get(key)?;
            if entry.expires_at > now {
                return Some(entry.snapshot.clone());
            }
        }

        log::trace!(target: "abby", key; "evicting expired project data");
        if let Ok(mut entries) = self.entries.write() {
            if entries.get(key).is_some_and(|entry| entry.expires_at <= now) {
                entries.remove(key);
            }
        }
        None
    }

    fn set_at(&self, key: String, snapshot: ServerSnapshot, now: DateTime<Utc>) {
        // Constructing new value before requesting the lock to minimize lock span.
        let entry = CacheEntry {
            snapshot: Arc::new(snapshot),
            expires_at: now.checked_add_signed(self.ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
        };

        if let Ok(mut entries) = self.entries.write() {
            entries.insert(key, entry);
        }
    }

    fn purge_expired_at(&self, now: DateTime<Utc>) {
        if let Ok(mut entries) = self.entries.write() {
            entries.retain(|_, entry| entry.expires_at > now);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.read().map(|entries| entries.len()).unwrap_or(0)
    }
}

impl Default for ConfigCache {
    fn default() -> ConfigCache {
        ConfigCache::new(ConfigCache::DEFAULT_TTL)
    }
}
