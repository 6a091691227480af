//! Credential Vault
//!
//! Verified key entry and local account management on top of the session.
//! Entered keys are checked against the authorities the network reports
//! before anything is stored.

use crate::session::SessionHandle;
use crate::vault::normalize_account;
use ledgerkey_core::{
    strip_key_prefix, AccountKeyLookup, Error, KeyLevel, KeyScheme, OperationType, Result, Secret,
};
use std::sync::Arc;

/// Listing entry for one account (no secret material)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountSummary {
    /// Account name
    pub name: String,
    /// Levels with a stored key
    pub levels: Vec<KeyLevel>,
    /// Operation types that skip confirmation
    pub suppressed: Vec<OperationType>,
    /// Account not yet on the network
    pub pending_creation: bool,
}

/// Key storage with on-chain verification
pub struct CredentialVault {
    session: Arc<SessionHandle>,
    lookup: Arc<dyn AccountKeyLookup>,
    scheme: Arc<dyn KeyScheme>,
}

impl CredentialVault {
    /// Vault over `session`, verifying against `lookup`
    pub fn new(
        session: Arc<SessionHandle>,
        lookup: Arc<dyn AccountKeyLookup>,
        scheme: Arc<dyn KeyScheme>,
    ) -> Self {
        Self {
            session,
            lookup,
            scheme,
        }
    }

    /// Underlying session
    pub fn session(&self) -> &Arc<SessionHandle> {
        &self.session
    }

    /// Signing primitive used for derivation
    pub fn scheme(&self) -> &Arc<dyn KeyScheme> {
        &self.scheme
    }

    /// Check that `secret` is well formed and belongs to `(account, level)`
    pub async fn verify_secret(&self, account: &str, level: KeyLevel, secret: &Secret) -> Result<()> {
        self.scheme.validate(secret)?;
        let public = self.scheme.public_key(secret)?;
        let authorities = self.lookup.account_keys(account).await?;

        let derived = strip_key_prefix(&public);
        let matches = authorities
            .keys_for(level)
            .iter()
            .any(|key| strip_key_prefix(key) == derived);

        if matches {
            Ok(())
        } else {
            tracing::warn!("Entered {} key does not match @{}", level, account);
            Err(Error::KeyMismatch(format!(
                "not a {} key of @{}",
                level, account
            )))
        }
    }

    /// Store a verified secret for `(account, level)`.
    ///
    /// Accounts marked pending creation skip the network check.
    pub async fn set_secret(&self, account: &str, level: KeyLevel, secret: Secret) -> Result<()> {
        let account = normalize_account(account)?;
        self.scheme.validate(&secret)?;

        let pending = self.session.read(|vault| {
            vault
                .account(&account)
                .map(|a| a.pending_creation)
                .unwrap_or(false)
        })?;
        if !pending {
            self.verify_secret(&account, level, &secret).await?;
        }

        self.session.mutate(|vault| {
            vault.account_mut(&account).secrets.insert(level, secret);
            Ok(())
        })?;

        tracing::info!("Stored {} key for @{}", level, account);
        Ok(())
    }

    /// Remove one key. Returns whether a key was present.
    pub fn delete_secret(&self, account: &str, level: KeyLevel) -> Result<bool> {
        let account = normalize_account(account)?;
        let present = self.session.read(|vault| {
            vault
                .account(&account)
                .map(|a| a.secrets.contains_key(&level))
                .unwrap_or(false)
        })?;
        if !present {
            return Ok(false);
        }

        self.session.mutate(|vault| {
            vault.account_mut(&account).secrets.remove(&level);
            Ok(())
        })?;
        tracing::info!("Deleted {} key for @{}", level, account);
        Ok(true)
    }

    /// Remove an account and everything stored for it
    pub fn delete_account(&self, account: &str) -> Result<bool> {
        let account = normalize_account(account)?;
        if !self.session.read(|vault| vault.accounts.contains_key(&account))? {
            return Ok(false);
        }

        self.session.mutate(|vault| {
            vault.accounts.remove(&account);
            Ok(())
        })?;
        tracing::info!("Deleted account @{}", account);
        Ok(true)
    }

    /// Add an empty account entry
    pub fn add_account(&self, account: &str, pending_creation: bool) -> Result<()> {
        let account = normalize_account(account)?;
        self.session.mutate(|vault| {
            let entry = vault.account_mut(&account);
            entry.pending_creation = pending_creation;
            Ok(())
        })?;
        tracing::info!("Added account @{} (pending_creation={})", account, pending_creation);
        Ok(())
    }

    /// Clear the pending-creation mark once the account exists on the network
    pub fn mark_created(&self, account: &str) -> Result<()> {
        let account = normalize_account(account)?;
        self.session.mutate(|vault| match vault.accounts.get_mut(&account) {
            Some(entry) => {
                entry.pending_creation = false;
                Ok(())
            }
            None => Err(Error::AccountNotFound(account.clone())),
        })
    }

    /// Set or clear the confirmation-suppression flag
    pub fn set_suppressed(&self, account: &str, op_type: &OperationType, suppressed: bool) -> Result<()> {
        let account = normalize_account(account)?;
        self.session.mutate(|vault| {
            let entry = vault.account_mut(&account);
            if suppressed {
                entry.suppressed.insert(op_type.clone(), true);
            } else {
                entry.suppressed.remove(op_type);
            }
            Ok(())
        })?;
        tracing::debug!("Suppression for {} on @{} set to {}", op_type, account, suppressed);
        Ok(())
    }

    /// Whether confirmation is skipped
    pub fn is_suppressed(&self, account: &str, op_type: &OperationType) -> Result<bool> {
        let account = normalize_account(account)?;
        self.session.read(|vault| vault.is_suppressed(&account, op_type))
    }

    /// Secret for `(account, level)`, following the fallback chain
    pub fn secret_for(&self, account: &str, level: KeyLevel) -> Result<Option<(KeyLevel, Secret)>> {
        let account = normalize_account(account)?;
        self.session.read(|vault| vault.secret_for(&account, level))
    }

    /// All accounts, without secrets
    pub fn accounts(&self) -> Result<Vec<AccountSummary>> {
        self.session.read(|vault| {
            vault
                .accounts
                .iter()
                .map(|(name, entry)| AccountSummary {
                    name: name.clone(),
                    levels: entry.levels(),
                    suppressed: entry
                        .suppressed
                        .iter()
                        .filter(|(_, on)| **on)
                        .map(|(ty, _)| ty.clone())
                        .collect(),
                    pending_creation: entry.pending_creation,
                })
                .collect()
        })
    }
}
