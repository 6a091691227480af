//! Session Gate
//!
//! Owns the decrypted vault and the PIN that seals it. Both live in a single
//! slot so that locking drops them together. Every vault change goes through
//! [`SessionHandle::mutate`]: clone, apply, seal, persist, then commit; the
//! in-memory vault only changes once the envelope has been written.

use crate::envelope::{EnvelopeParams, EnvelopeSlot};
use crate::security::{EncryptionAlgorithm, MasterKey};
use crate::store::{KeyValueStore, VAULT_ENVELOPE_KEY};
use crate::vault::Vault;
use ledgerkey_core::{Error, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, Zeroizing};

/// Minimum PIN length in characters
pub const MIN_PIN_LENGTH: usize = 4;

/// Gate state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No envelope has been written yet
    NoVault,
    /// Envelope exists, nothing decrypted
    Locked,
    /// Vault decrypted in memory
    Unlocked,
}

/// Reject PINs that are too short
pub fn validate_pin(pin: &str) -> Result<()> {
    if pin.chars().count() < MIN_PIN_LENGTH {
        return Err(Error::InvalidPin(format!(
            "PIN must be at least {} characters",
            MIN_PIN_LENGTH
        )));
    }
    Ok(())
}

struct Unlocked {
    vault: Vault,
    pin: Zeroizing<String>,
}

#[derive(Serialize, Deserialize)]
struct CachedSession {
    vault: Vault,
    pin: String,
}

/// Process-memory cache of an unlocked session.
///
/// Holds the vault and PIN sealed under a random per-process key so a new
/// handle can resume without prompting. Never persisted.
pub struct SessionCache {
    key: MasterKey,
    sealed: RwLock<Option<Vec<u8>>>,
}

impl SessionCache {
    /// Empty cache with a fresh key
    pub fn new() -> Self {
        Self {
            key: MasterKey::generate(EncryptionAlgorithm::ChaCha20Poly1305),
            sealed: RwLock::new(None),
        }
    }

    /// Replace the cached session
    pub fn store(&self, vault: &Vault, pin: &str) -> Result<()> {
        let mut doc = CachedSession {
            vault: vault.clone(),
            pin: pin.to_string(),
        };
        let plaintext = Zeroizing::new(serde_json::to_vec(&doc)?);
        doc.pin.zeroize();

        let sealed = self
            .key
            .encrypt(&plaintext)
            .map_err(|e| Error::Storage(e.to_string()))?;
        *self.sealed.write() = Some(sealed);
        Ok(())
    }

    fn load(&self) -> Option<(Vault, Zeroizing<String>)> {
        let guard = self.sealed.read();
        let plaintext = self.key.decrypt(guard.as_ref()?).ok()?;
        let doc: CachedSession = serde_json::from_slice(&plaintext).ok()?;
        Some((doc.vault, Zeroizing::new(doc.pin)))
    }

    /// Drop the cached session
    pub fn clear(&self) {
        *self.sealed.write() = None;
    }

    /// True when a session is cached
    pub fn is_populated(&self) -> bool {
        self.sealed.read().is_some()
    }
}

impl Default for SessionCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to the vault session; pass it to whatever needs vault access
pub struct SessionHandle {
    slot: EnvelopeSlot,
    unlocked: RwLock<Option<Unlocked>>,
    cache: Option<Arc<SessionCache>>,
}

impl SessionHandle {
    /// Session over the vault envelope in `store`
    pub fn new(store: Arc<dyn KeyValueStore>, params: EnvelopeParams) -> Self {
        Self {
            slot: EnvelopeSlot::new(store, VAULT_ENVELOPE_KEY, params),
            unlocked: RwLock::new(None),
            cache: None,
        }
    }

    /// Mirror unlocked state into `cache`
    pub fn with_cache(mut self, cache: Arc<SessionCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Current state
    pub fn state(&self) -> Result<SessionState> {
        if self.unlocked.read().is_some() {
            return Ok(SessionState::Unlocked);
        }
        if self.slot.exists()? {
            Ok(SessionState::Locked)
        } else {
            Ok(SessionState::NoVault)
        }
    }

    /// True when the vault is decrypted in memory
    pub fn is_unlocked(&self) -> bool {
        self.unlocked.read().is_some()
    }

    /// Create the vault under a first PIN
    pub fn create_pin(&self, pin: &str) -> Result<()> {
        validate_pin(pin)?;
        let mut guard = self.unlocked.write();
        if self.slot.exists()? {
            return Err(Error::Other("A vault already exists".to_string()));
        }

        let vault = Vault::new();
        self.slot.seal(&vault.to_bytes()?, pin)?;
        self.commit(&mut guard, vault, Zeroizing::new(pin.to_string()));

        tracing::info!("Vault created");
        Ok(())
    }

    /// Decrypt the vault with `pin`
    pub fn unlock(&self, pin: &str) -> Result<()> {
        let mut guard = self.unlocked.write();
        let plaintext = self.slot.unseal(pin)?;
        let vault = Vault::from_bytes(&plaintext)?;
        self.commit(&mut guard, vault, Zeroizing::new(pin.to_string()));

        tracing::info!("Vault unlocked");
        Ok(())
    }

    /// Drop the decrypted vault and PIN
    pub fn lock(&self) {
        *self.unlocked.write() = None;
        if let Some(cache) = &self.cache {
            cache.clear();
        }
        tracing::info!("Vault locked");
    }

    /// Re-seal the vault under a new PIN
    pub fn change_pin(&self, old_pin: &str, new_pin: &str) -> Result<()> {
        validate_pin(new_pin)?;
        let mut guard = self.unlocked.write();
        let current = match guard.as_ref() {
            Some(current) => current,
            None => return Err(self.locked_error()),
        };
        if !bool::from(current.pin.as_bytes().ct_eq(old_pin.as_bytes())) {
            return Err(Error::InvalidPasswordOrCorruptData);
        }

        let vault = current.vault.clone();
        self.slot.seal(&vault.to_bytes()?, new_pin)?;
        self.commit(&mut guard, vault, Zeroizing::new(new_pin.to_string()));

        tracing::info!("Vault PIN changed");
        Ok(())
    }

    /// Check `pin` against the unlocked session
    pub fn verify_pin(&self, pin: &str) -> Result<()> {
        let guard = self.unlocked.read();
        match guard.as_ref() {
            Some(current) if bool::from(current.pin.as_bytes().ct_eq(pin.as_bytes())) => Ok(()),
            Some(_) => Err(Error::InvalidPasswordOrCorruptData),
            None => Err(self.locked_error()),
        }
    }

    /// Restore from the session cache. Returns whether the vault is unlocked.
    pub fn resume(&self) -> Result<bool> {
        let mut guard = self.unlocked.write();
        if guard.is_some() {
            return Ok(true);
        }
        let Some(cache) = &self.cache else {
            return Ok(false);
        };
        match cache.load() {
            Some((vault, pin)) => {
                *guard = Some(Unlocked { vault, pin });
                tracing::debug!("Session resumed from cache");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Destroy the envelope and any cached session
    pub fn reset(&self) -> Result<()> {
        let mut guard = self.unlocked.write();
        *guard = None;
        if let Some(cache) = &self.cache {
            cache.clear();
        }
        self.slot.destroy()?;
        tracing::warn!("Vault reset; all stored keys destroyed");
        Ok(())
    }

    /// Read from the unlocked vault
    pub fn read<R>(&self, f: impl FnOnce(&Vault) -> R) -> Result<R> {
        let guard = self.unlocked.read();
        match guard.as_ref() {
            Some(current) => Ok(f(&current.vault)),
            None => Err(self.locked_error()),
        }
    }

    /// Apply `f` to a copy of the vault, persist it, then commit.
    ///
    /// If `f` or the write fails, the in-memory vault is unchanged.
    pub fn mutate<R>(&self, f: impl FnOnce(&mut Vault) -> Result<R>) -> Result<R> {
        let mut guard = self.unlocked.write();
        let current = match guard.as_mut() {
            Some(current) => current,
            None => return Err(self.locked_error()),
        };

        let mut next = current.vault.clone();
        let result = f(&mut next)?;
        self.slot.seal(&next.to_bytes()?, &current.pin)?;
        current.vault = next;

        if let Some(cache) = &self.cache {
            if let Err(e) = cache.store(&current.vault, &current.pin) {
                tracing::warn!("Failed to refresh session cache: {}", e);
            }
        }
        Ok(result)
    }

    fn commit(&self, guard: &mut Option<Unlocked>, vault: Vault, pin: Zeroizing<String>) {
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.store(&vault, &pin) {
                tracing::warn!("Failed to populate session cache: {}", e);
            }
        }
        *guard = Some(Unlocked { vault, pin });
    }

    fn locked_error(&self) -> Error {
        match self.slot.exists() {
            Ok(true) => Error::VaultLocked,
            Ok(false) => Error::NoVault,
            Err(e) => e,
        }
    }
}
