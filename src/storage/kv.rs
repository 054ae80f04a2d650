use std::sync::Arc;

use hashbrown::HashMap;
use once_cell::sync::OnceCell;
use parking_lot::RwLock;

use crate::error::{StorageError, StorageResult};

/// The process wide key-value store, the equivalent of the browser's
/// `localStorage`. Initialised on first use and shared by every adapter
/// pointed at it.
static SHARED: OnceCell<Arc<MemoryKeyValueStore>> = OnceCell::new();

/// A synchronous string key-value store.
///
/// Mutual exclusion across callers is the caller's problem, the store only
/// guarantees that a single call is applied atomically.
pub trait KeyValueStore: Send + Sync + 'static {
    fn get_item(&self, key: &str) -> Option<String>;

    fn set_item(&self, key: &str, value: String) -> StorageResult<()>;

    fn remove_item(&self, key: &str);

    fn keys(&self) -> Vec<String>;
}

/// An in-memory key-value store with an optional quota on the total
/// number of bytes held (keys and values).
#[derive(Default)]
pub struct MemoryKeyValueStore {
    quota: Option<usize>,
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(quota: usize) -> Self {
        Self {
            quota: Some(quota),
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// The process wide instance.
    ///
    /// The quota of the shared store is fixed by whoever touches it first.
    pub fn shared(quota: Option<usize>) -> Arc<Self> {
        SHARED
            .get_or_init(|| {
                let store = match quota {
                    Some(quota) => Self::with_quota(quota),
                    None => Self::new(),
                };
                Arc::new(store)
            })
            .clone()
    }

    /// The number of bytes currently held.
    pub fn used(&self) -> usize {
        self.entries
            .read()
            .iter()
            .map(|(k, v)| k.len() + v.len())
            .sum()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get_item(&self, key: &str) -> Option<String> {
        self.entries.read().get(key).cloned()
    }

    fn set_item(&self, key: &str, value: String) -> StorageResult<()> {
        let mut entries = self.entries.write();

        if let Some(quota) = self.quota {
            let current: usize = entries.iter().map(|(k, v)| k.len() + v.len()).sum();
            let replaced = entries.get(key).map(|v| key.len() + v.len()).unwrap_or(0);
            let required = current - replaced + key.len() + value.len();

            if required > quota {
                return Err(StorageError::StorageWrite(format!(
                    "quota exceeded, {} of {} bytes would be used",
                    required, quota,
                )));
            }
        }

        entries.insert(key.to_string(), value);
        Ok(())
    }

    fn remove_item(&self, key: &str) {
        self.entries.write().remove(key);
    }

    fn keys(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_rejects_oversized_writes() {
        let store = MemoryKeyValueStore::with_quota(10);
        store.set_item("a", "1234".into()).unwrap();

        let err = store.set_item("b", "123456789".into()).unwrap_err();
        assert!(err.is_write_error());
        assert!(store.get_item("b").is_none());
    }

    #[test]
    fn overwriting_counts_only_the_new_value() {
        let store = MemoryKeyValueStore::with_quota(6);
        store.set_item("k", "12345".into()).unwrap();
        store.set_item("k", "54321".into()).unwrap();
        assert_eq!(store.used(), 6);
    }
}
