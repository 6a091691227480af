//! Ledgerkey core types
//!
//! Key levels and secret material, the signing primitive, operation tuples,
//! the shared error taxonomy and the narrow chain-facing interfaces the vault
//! and signers depend on.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod chain;
pub mod error;
pub mod keys;
pub mod operations;
pub mod rpc;

#[cfg(feature = "test-helpers")]
pub mod testing;

pub use chain::{
    AccountAuthorities, AccountKeyLookup, BroadcastResult, ChainConfig, SignedTransaction,
    TransactionBroadcaster, UnsignedTransaction,
};
pub use error::{Error, ErrorCategory, Result};
pub use keys::{
    strip_key_prefix, KeyLevel, KeyScheme, Secp256k1Scheme, Secret, Signature, KNOWN_KEY_PREFIXES,
    MIN_SECRET_LENGTH, SECRET_PREFIX,
};
pub use operations::{Operation, OperationType};
pub use rpc::{RpcKeyLookup, DEFAULT_NODE_URL};
