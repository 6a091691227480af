//! Durable key/value storage seam
//!
//! Everything Ledgerkey persists is a JSON document under a well-known key.

use crate::{Error, Result};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// Key of the encrypted vault envelope
pub const VAULT_ENVELOPE_KEY: &str = "vault.envelope";

/// Key of the broadcast tracker queue
pub const TRACKER_KEY: &str = "tracker.broadcasts";

/// Key of the user preferences
pub const PREFERENCES_KEY: &str = "preferences";

/// String key/value store
pub trait KeyValueStore: Send + Sync {
    /// Read a value
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a value, replacing any previous one
    fn put(&self, key: &str, value: &str) -> Result<()>;

    /// Remove a value (no-op when absent)
    fn delete(&self, key: &str) -> Result<()>;
}

/// Read and decode a JSON document
pub fn load_json<T: DeserializeOwned>(store: &dyn KeyValueStore, key: &str) -> Result<Option<T>> {
    match store.get(key)? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

/// Encode and write a JSON document
pub fn save_json<T: Serialize>(store: &dyn KeyValueStore, key: &str, value: &T) -> Result<()> {
    let raw = serde_json::to_string(value)?;
    store.put(key, &raw)
}

/// Process-local store
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, String>>,
    read_only: AtomicBool,
}

impl MemoryStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every write until cleared
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    /// Number of keys held
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// True when no keys are held
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only.load(Ordering::SeqCst) {
            return Err(Error::WriteFailed("store is read-only".to_string()));
        }
        Ok(())
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        self.check_writable()?;
        self.entries.write().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.check_writable()?;
        self.entries.write().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Doc {
        n: u32,
    }

    #[test]
    fn test_json_helpers() {
        let store = MemoryStore::new();
        assert!(load_json::<Doc>(&store, "doc").unwrap().is_none());

        save_json(&store, "doc", &Doc { n: 7 }).unwrap();
        assert_eq!(load_json::<Doc>(&store, "doc").unwrap(), Some(Doc { n: 7 }));
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let store = MemoryStore::new();
        store.put("a", "1").unwrap();
        store.set_read_only(true);

        assert!(matches!(store.put("a", "2"), Err(Error::WriteFailed(_))));
        assert!(store.delete("a").is_err());
        assert_eq!(store.get("a").unwrap().as_deref(), Some("1"));
    }
}
