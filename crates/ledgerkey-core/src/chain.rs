//! Chain-facing interfaces
//!
//! The vault only needs the authoritative public keys of an account; the
//! local signer additionally needs a way to build a transaction digest and
//! submit the signed result. Both are supplied by the embedding application.

use crate::keys::{KeyLevel, Signature};
use crate::{Operation, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Public keys the network holds for one account
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountAuthorities {
    /// Owner authority keys
    pub owner: Vec<String>,
    /// Active authority keys
    pub active: Vec<String>,
    /// Posting authority keys
    pub posting: Vec<String>,
    /// Memo key
    pub memo: Option<String>,
}

impl AccountAuthorities {
    /// Keys a secret of `level` may match
    pub fn keys_for(&self, level: KeyLevel) -> Vec<&str> {
        match level.authority() {
            KeyLevel::Owner => self.owner.iter().map(String::as_str).collect(),
            KeyLevel::Active => self.active.iter().map(String::as_str).collect(),
            KeyLevel::Posting => self.posting.iter().map(String::as_str).collect(),
            KeyLevel::Memo => self.memo.as_deref().into_iter().collect(),
            KeyLevel::Master => self.keys_for(KeyLevel::Owner),
        }
    }
}

/// Lookup of on-chain authorities
#[async_trait]
pub trait AccountKeyLookup: Send + Sync {
    /// Fails with `AccountNotFound` when the account does not exist
    async fn account_keys(&self, account: &str) -> Result<AccountAuthorities>;
}

/// Transaction ready to be signed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnsignedTransaction {
    /// Ledger-specific transaction body
    pub transaction: Value,
    /// Digest to sign (chain id and serialization are the builder's concern)
    pub digest: [u8; 32],
}

/// Transaction with signatures attached
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedTransaction {
    /// Ledger-specific transaction body
    pub transaction: Value,
    /// Signatures over the digest
    pub signatures: Vec<Signature>,
}

/// Network acceptance of a broadcast
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastResult {
    /// Transaction id
    pub tx_id: String,
    /// Node or API that accepted the transaction
    pub api: String,
    /// Block the node reported, if any
    pub block_num: Option<u64>,
}

/// Builds and submits transactions for the local signer
#[async_trait]
pub trait TransactionBroadcaster: Send + Sync {
    /// Attach reference block, expiration, and compute the signing digest
    async fn prepare(&self, account: &str, operations: &[Operation]) -> Result<UnsignedTransaction>;

    /// Submit; fails with `BroadcastRejected` when the node refuses it
    async fn broadcast(&self, transaction: SignedTransaction) -> Result<BroadcastResult>;
}

/// Network parameters shared by lookups and key derivation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    /// Prefix written in front of public keys
    pub public_prefix: String,
    /// JSON-RPC node used for account lookups
    pub node_url: String,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            public_prefix: crate::keys::KNOWN_KEY_PREFIXES[0].to_string(),
            node_url: crate::rpc::DEFAULT_NODE_URL.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_master_checks_owner_authority() {
        let auths = AccountAuthorities {
            owner: vec!["STM8owner".to_string()],
            active: vec!["STM8active".to_string()],
            posting: vec![],
            memo: Some("STM8memo".to_string()),
        };
        assert_eq!(auths.keys_for(KeyLevel::Master), vec!["STM8owner"]);
        assert_eq!(auths.keys_for(KeyLevel::Memo), vec!["STM8memo"]);
        assert!(auths.keys_for(KeyLevel::Posting).is_empty());
    }
}
