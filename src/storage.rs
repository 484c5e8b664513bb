//! Persistent storage port used to make assignments sticky.
//!
//! Browser adapters implement [`StoragePort`] on top of cookies or local storage. Servers and
//! tests usually use [`MemoryStorage`] or [`NoopStorage`]. The engine owns three independent ports
//! (tests, flags, remote config), see [`StoragePorts`].
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

/// Prefix of keys holding persisted test variants.
pub const TEST_KEY_PREFIX: &str = "__abby__ab__";
/// Prefix of keys holding flag overrides.
pub const FLAG_KEY_PREFIX: &str = "__abby__ff__";
/// Prefix of keys holding remote-config overrides.
pub const REMOTE_CONFIG_KEY_PREFIX: &str = "__abby__rc__";
/// Prefix of the per-project key holding the storage consent marker.
pub const CONSENT_KEY_PREFIX: &str = "__abby__cookie_consent__";

/// Options for [`StoragePort::set`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StorageOptions {
    /// Overrides the configured expiry (in days) of the stored value.
    pub expires_in_days_override: Option<u32>,
}

/// Key/value storage the engine persists assignments and overrides through.
///
/// Implementations should never panic: failures are expected to be swallowed (and logged) as
/// evaluation must keep working without storage.
pub trait StoragePort {
    /// Return the stored value or `None` if `key` is absent.
    fn get(&self, key: &str) -> Option<String>;
    /// Store `value` under `key`.
    fn set(&self, key: &str, value: &str, options: StorageOptions);
    /// Remove `key`. Removing an absent key is a no-op.
    fn remove(&self, key: &str);
}

/// Entity namespace of a storage key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageKind {
    /// Test assignments.
    Test,
    /// Flag overrides.
    Flag,
    /// Remote-config overrides.
    RemoteConfig,
}

impl StorageKind {
    /// Key prefix of this namespace.
    pub fn prefix(self) -> &'static str {
        match self {
            StorageKind::Test => TEST_KEY_PREFIX,
            StorageKind::Flag => FLAG_KEY_PREFIX,
            StorageKind::RemoteConfig => REMOTE_CONFIG_KEY_PREFIX,
        }
    }

    /// Full storage key of entity `name` in project `project_id`.
    ///
    /// ```
    /// # use abby::StorageKind;
    /// assert_eq!(StorageKind::Test.key("p1", "footer"), "__abby__ab__p1_footer");
    /// ```
    pub fn key(self, project_id: &str, name: &str) -> String {
        format!("{}{}_{}", self.prefix(), project_id, name)
    }

    /// Entity name encoded in `key` if it belongs to this namespace and project.
    pub fn entity_name<'a>(self, project_id: &str, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(self.prefix())?
            .strip_prefix(project_id)?
            .strip_prefix('_')
            .filter(|name| !name.is_empty())
    }
}

/// Key of the consent marker for `project_id`.
pub fn consent_key(project_id: &str) -> String {
    format!("{CONSENT_KEY_PREFIX}{project_id}")
}

/// The three storage ports injected into the engine.
#[derive(Clone)]
pub struct StoragePorts {
    /// Persists test assignments and the consent marker.
    pub tests: Arc<dyn StoragePort + Send + Sync>,
    /// Persists flag overrides.
    pub flags: Arc<dyn StoragePort + Send + Sync>,
    /// Persists remote-config overrides.
    pub remote_config: Arc<dyn StoragePort + Send + Sync>,
}

impl StoragePorts {
    /// Independent in-memory storage for each namespace.
    pub fn in_memory() -> StoragePorts {
        StoragePorts {
            tests: Arc::new(MemoryStorage::new()),
            flags: Arc::new(MemoryStorage::new()),
            remote_config: Arc::new(MemoryStorage::new()),
        }
    }

    /// Storage that never persists anything.
    pub fn noop() -> StoragePorts {
        StoragePorts {
            tests: Arc::new(NoopStorage),
            flags: Arc::new(NoopStorage),
            remote_config: Arc::new(NoopStorage),
        }
    }
}

impl Default for StoragePorts {
    fn default() -> StoragePorts {
        StoragePorts::in_memory()
    }
}

/// Thread-safe in-memory storage. Expiry options are ignored: values live as long as the
/// storage.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    values: RwLock<HashMap<String, String>>,
}

impl MemoryStorage {
    /// Create an empty store.
    pub fn new() -> MemoryStorage {
        MemoryStorage::default()
    }

    /// Copy of everything currently stored.
    pub fn entries(&self) -> HashMap<String, String> {
        self.values
            .read()
            .map(|values| values.clone())
            .unwrap_or_default()
    }
}

impl StoragePort for MemoryStorage {
    fn get(&self, key: &str) -> Option<String> {
        // A poisoned lock means a writer panicked; treat storage as unavailable.
        self.values.read().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str, _options: StorageOptions) {
        match self.values.write() {
            Ok(mut values) => {
                values.insert(key.to_owned(), value.to_owned());
            }
            Err(_) => log::warn!(target: "abby", key; "memory storage lock poisoned, value dropped"),
        }
    }

    fn remove(&self, key: &str) {
        if let Ok(mut values) = self.values.write() {
            values.remove(key);
        }
    }
}

/// Storage that stores nothing. Every read misses.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStorage;

impl StoragePort for NoopStorage {
    fn get(&self, _key: &str) -> Option<String> {
        None
    }

    fn set(&self, _key: &str, _value: &str, _options: StorageOptions) {}

    fn remove(&self, _key: &str) {}
}
