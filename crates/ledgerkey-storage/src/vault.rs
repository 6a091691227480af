//! Decrypted vault model
//!
//! Exists in plaintext only inside an unlocked session; the durable form is
//! the serialized vault sealed in an envelope.

use ledgerkey_core::{Error, KeyLevel, OperationType, Result, Secret};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use zeroize::Zeroizing;

/// Secrets and preferences for one account
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountSecrets {
    /// Secret per key level
    #[serde(default)]
    pub secrets: BTreeMap<KeyLevel, Secret>,
    /// "Don't ask again" flags per operation type
    #[serde(default)]
    pub suppressed: BTreeMap<OperationType, bool>,
    /// Account not yet on the network; keys are stored unverified
    #[serde(default)]
    pub pending_creation: bool,
}

impl AccountSecrets {
    /// First secret along the fallback chain of `level`
    pub fn secret_for(&self, level: KeyLevel) -> Option<(KeyLevel, &Secret)> {
        level
            .fallback_chain()
            .iter()
            .find_map(|l| self.secrets.get(l).map(|s| (*l, s)))
    }

    /// Whether confirmation is skipped for `op_type`
    pub fn is_suppressed(&self, op_type: &OperationType) -> bool {
        self.suppressed.get(op_type).copied().unwrap_or(false)
    }

    /// Levels with a stored secret
    pub fn levels(&self) -> Vec<KeyLevel> {
        self.secrets.keys().copied().collect()
    }
}

/// All accounts known to the vault
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Vault {
    /// Accounts by name
    #[serde(default)]
    pub accounts: BTreeMap<String, AccountSecrets>,
    /// A PIN has been set at least once
    #[serde(default)]
    pub unlocked: bool,
}

impl Vault {
    /// Fresh vault for a newly created PIN
    pub fn new() -> Self {
        Self {
            accounts: BTreeMap::new(),
            unlocked: true,
        }
    }

    /// Account entry, if present
    pub fn account(&self, name: &str) -> Option<&AccountSecrets> {
        self.accounts.get(name)
    }

    /// Account entry, created empty when absent
    pub fn account_mut(&mut self, name: &str) -> &mut AccountSecrets {
        self.accounts.entry(name.to_string()).or_default()
    }

    /// Account names in order
    pub fn account_names(&self) -> Vec<String> {
        self.accounts.keys().cloned().collect()
    }

    /// Secret for `(account, level)` with hierarchy fallback
    pub fn secret_for(&self, account: &str, level: KeyLevel) -> Option<(KeyLevel, Secret)> {
        self.account(account)
            .and_then(|a| a.secret_for(level))
            .map(|(l, s)| (l, s.clone()))
    }

    /// Whether confirmation is skipped for `op_type` on `account`
    pub fn is_suppressed(&self, account: &str, op_type: &OperationType) -> bool {
        self.account(account)
            .map(|a| a.is_suppressed(op_type))
            .unwrap_or(false)
    }

    /// Serialize into a zeroizing buffer
    pub fn to_bytes(&self) -> Result<Zeroizing<Vec<u8>>> {
        Ok(Zeroizing::new(serde_json::to_vec(self)?))
    }

    /// Parse a serialized vault. Undecodable content is treated as corruption.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|_| Error::InvalidPasswordOrCorruptData)
    }
}

/// Canonical account name: trimmed, lowercase, leading `@` removed
pub fn normalize_account(name: &str) -> Result<String> {
    let name = name.trim().trim_start_matches('@').to_ascii_lowercase();
    if name.is_empty() {
        return Err(Error::Other("Account name is empty".to_string()));
    }
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgerkey_core::Secp256k1Scheme;

    #[test]
    fn test_fallback_to_owner() {
        let mut vault = Vault::new();
        let owner = Secp256k1Scheme::generate_secret();
        vault
            .account_mut("alice")
            .secrets
            .insert(KeyLevel::Owner, owner.clone());

        let (level, secret) = vault.secret_for("alice", KeyLevel::Active).unwrap();
        assert_eq!(level, KeyLevel::Owner);
        assert_eq!(secret.expose(), owner.expose());

        assert!(vault.secret_for("alice", KeyLevel::Memo).is_none());
        assert!(vault.secret_for("bob", KeyLevel::Active).is_none());
    }

    #[test]
    fn test_serialized_layout() {
        let mut vault = Vault::new();
        let account = vault.account_mut("alice");
        account
            .secrets
            .insert(KeyLevel::Posting, Secp256k1Scheme::generate_secret());
        account
            .suppressed
            .insert(OperationType::from_raw("vote"), true);

        let bytes = vault.to_bytes().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert!(value["accounts"]["alice"]["secrets"]["posting"].is_string());
        assert_eq!(value["accounts"]["alice"]["suppressed"]["vote"], true);

        let decoded = Vault::from_bytes(&bytes).unwrap();
        assert!(decoded.is_suppressed("alice", &OperationType::from_raw("vote")));
        assert!(!decoded.is_suppressed("alice", &OperationType::from_raw("transfer")));
    }

    #[test]
    fn test_garbage_is_corruption() {
        assert!(matches!(
            Vault::from_bytes(b"not json"),
            Err(Error::InvalidPasswordOrCorruptData)
        ));
    }

    #[test]
    fn test_normalize_account() {
        assert_eq!(normalize_account(" @Alice ").unwrap(), "alice");
        assert!(normalize_account("  ").is_err());
    }
}
