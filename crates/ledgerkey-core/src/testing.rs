//! In-memory chain for tests
//!
//! `StubChain` answers account lookups from a local table and accepts
//! broadcasts into a log, so signer flows can run without a node.

use crate::chain::{
    AccountAuthorities, AccountKeyLookup, BroadcastResult, SignedTransaction, TransactionBroadcaster,
    UnsignedTransaction,
};
use crate::keys::{KeyLevel, KeyScheme, Secp256k1Scheme, Secret};
use crate::{Error, Operation, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Keys generated for a registered stub account
pub struct StubAccount {
    /// Account name
    pub name: String,
    /// Secret per level (master excluded)
    pub secrets: HashMap<KeyLevel, Secret>,
}

impl StubAccount {
    /// Secret for `level`
    pub fn secret(&self, level: KeyLevel) -> Secret {
        match self.secrets.get(&level) {
            Some(secret) => secret.clone(),
            None => panic!("stub account has no {} key", level),
        }
    }
}

/// Account table plus broadcast log
pub struct StubChain {
    scheme: Secp256k1Scheme,
    accounts: RwLock<HashMap<String, AccountAuthorities>>,
    broadcasts: RwLock<Vec<SignedTransaction>>,
    reject_next: RwLock<Option<String>>,
    lookups: AtomicU64,
    next_tx: AtomicU64,
}

impl StubChain {
    /// Empty chain
    pub fn new() -> Self {
        Self {
            scheme: Secp256k1Scheme::default(),
            accounts: RwLock::new(HashMap::new()),
            broadcasts: RwLock::new(Vec::new()),
            reject_next: RwLock::new(None),
            lookups: AtomicU64::new(0),
            next_tx: AtomicU64::new(1),
        }
    }

    /// Scheme used to derive the registered public keys
    pub fn scheme(&self) -> &Secp256k1Scheme {
        &self.scheme
    }

    /// Register an account with a fresh key per level
    pub fn register(&self, name: &str) -> StubAccount {
        let mut secrets = HashMap::new();
        let mut auths = AccountAuthorities::default();
        for level in [KeyLevel::Posting, KeyLevel::Active, KeyLevel::Owner, KeyLevel::Memo] {
            let secret = Secp256k1Scheme::generate_secret();
            let public = self
                .scheme
                .public_key(&secret)
                .unwrap_or_else(|e| panic!("generated key rejected: {}", e));
            match level {
                KeyLevel::Posting => auths.posting.push(public),
                KeyLevel::Active => auths.active.push(public),
                KeyLevel::Owner => auths.owner.push(public),
                _ => auths.memo = Some(public),
            }
            secrets.insert(level, secret);
        }
        self.accounts.write().insert(name.to_string(), auths);
        StubAccount {
            name: name.to_string(),
            secrets,
        }
    }

    /// Replace the authorities of an account
    pub fn set_authorities(&self, name: &str, auths: AccountAuthorities) {
        self.accounts.write().insert(name.to_string(), auths);
    }

    /// Make the next broadcast fail with `BroadcastRejected`
    pub fn reject_next_broadcast(&self, reason: &str) {
        *self.reject_next.write() = Some(reason.to_string());
    }

    /// Accepted transactions, oldest first
    pub fn broadcasts(&self) -> Vec<SignedTransaction> {
        self.broadcasts.read().clone()
    }

    /// Number of account lookups served
    pub fn lookup_count(&self) -> u64 {
        self.lookups.load(Ordering::SeqCst)
    }
}

impl Default for StubChain {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AccountKeyLookup for StubChain {
    async fn account_keys(&self, account: &str) -> Result<AccountAuthorities> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.accounts
            .read()
            .get(account)
            .cloned()
            .ok_or_else(|| Error::AccountNotFound(account.to_string()))
    }
}

#[async_trait]
impl TransactionBroadcaster for StubChain {
    async fn prepare(&self, account: &str, operations: &[Operation]) -> Result<UnsignedTransaction> {
        let transaction = json!({
            "account": account,
            "operations": operations,
        });
        let digest: [u8; 32] = Sha256::digest(serde_json::to_vec(&transaction)?).into();
        Ok(UnsignedTransaction { transaction, digest })
    }

    async fn broadcast(&self, transaction: SignedTransaction) -> Result<BroadcastResult> {
        if let Some(reason) = self.reject_next.write().take() {
            return Err(Error::BroadcastRejected(reason));
        }
        let n = self.next_tx.fetch_add(1, Ordering::SeqCst);
        self.broadcasts.write().push(transaction);
        Ok(BroadcastResult {
            tx_id: format!("{:040x}", n),
            api: "stub".to_string(),
            block_num: Some(n),
        })
    }
}
