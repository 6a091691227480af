//! Non-secret user preferences

use crate::store::{load_json, save_json, KeyValueStore, PREFERENCES_KEY};
use crate::Result;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Most-recently-used accounts kept
pub const MAX_RECENT_ACCOUNTS: usize = 10;

/// Stored preferences
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Preferences {
    /// Account used last
    #[serde(default)]
    pub last_account: Option<String>,
    /// Signer backend chosen last
    #[serde(default)]
    pub last_backend: Option<String>,
    /// Recently used accounts, newest first
    #[serde(default)]
    pub recent_accounts: Vec<String>,
}

impl Preferences {
    fn touch_account(&mut self, account: &str) {
        self.recent_accounts.retain(|a| a != account);
        self.recent_accounts.insert(0, account.to_string());
        self.recent_accounts.truncate(MAX_RECENT_ACCOUNTS);
        self.last_account = Some(account.to_string());
    }
}

/// Preferences persisted under [`PREFERENCES_KEY`]
pub struct PreferenceStore {
    store: Arc<dyn KeyValueStore>,
    current: RwLock<Preferences>,
}

impl PreferenceStore {
    /// Load preferences (defaults when none are stored or they are unreadable)
    pub fn load(store: Arc<dyn KeyValueStore>) -> Self {
        let current = match load_json::<Preferences>(store.as_ref(), PREFERENCES_KEY) {
            Ok(Some(prefs)) => prefs,
            Ok(None) => Preferences::default(),
            Err(e) => {
                tracing::warn!("Ignoring unreadable preferences: {}", e);
                Preferences::default()
            }
        };
        Self {
            store,
            current: RwLock::new(current),
        }
    }

    /// Snapshot
    pub fn get(&self) -> Preferences {
        self.current.read().clone()
    }

    /// Record use of an account
    pub fn record_account(&self, account: &str) -> Result<()> {
        self.update(|prefs| prefs.touch_account(account))
    }

    /// Record the chosen backend
    pub fn record_backend(&self, backend: &str) -> Result<()> {
        self.update(|prefs| prefs.last_backend = Some(backend.to_string()))
    }

    fn update(&self, f: impl FnOnce(&mut Preferences)) -> Result<()> {
        let mut guard = self.current.write();
        let mut next = guard.clone();
        f(&mut next);
        save_json(self.store.as_ref(), PREFERENCES_KEY, &next)?;
        *guard = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn test_recent_accounts_are_mru_and_bounded() {
        let store = Arc::new(MemoryStore::new());
        let prefs = PreferenceStore::load(store.clone());

        for i in 0..12 {
            prefs.record_account(&format!("user{}", i)).unwrap();
        }
        prefs.record_account("user5").unwrap();

        let current = prefs.get();
        assert_eq!(current.recent_accounts.len(), MAX_RECENT_ACCOUNTS);
        assert_eq!(current.recent_accounts[0], "user5");
        assert_eq!(current.recent_accounts.iter().filter(|a| *a == "user5").count(), 1);
        assert_eq!(current.last_account.as_deref(), Some("user5"));

        let reloaded = PreferenceStore::load(store);
        assert_eq!(reloaded.get(), current);
    }

    #[test]
    fn test_backend_choice_persists() {
        let store = Arc::new(MemoryStore::new());
        PreferenceStore::load(store.clone()).record_backend("relay").unwrap();
        assert_eq!(
            PreferenceStore::load(store).get().last_backend.as_deref(),
            Some("relay")
        );
    }

    #[test]
    fn test_unreadable_preferences_fall_back_to_default() {
        let store = Arc::new(MemoryStore::new());
        store.put(PREFERENCES_KEY, "not json").unwrap();
        assert_eq!(PreferenceStore::load(store).get(), Preferences::default());
    }
}
