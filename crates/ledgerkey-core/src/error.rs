//! Error types for Ledgerkey
//!
//! One taxonomy shared by the vault, the signer backends and the tracker.

use std::fmt;

/// Result type
pub type Result<T> = std::result::Result<T, Error>;

/// Ledgerkey errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Wrong PIN/password or damaged envelope. Deliberately one variant for both.
    #[error("Invalid password or corrupt data")]
    InvalidPasswordOrCorruptData,

    /// Private key does not match the account's on-chain authority
    #[error("Key mismatch: {0}")]
    KeyMismatch(String),

    /// Private key failed structural validation
    #[error("Invalid key format: {0}")]
    InvalidKeyFormat(String),

    /// Account lookup on the network returned nothing
    #[error("Account not found: {0}")]
    AccountNotFound(String),

    /// The selected signer cannot be reached
    #[error("Signer unavailable: {0}")]
    SignerUnavailable(String),

    /// User declined the confirmation prompt
    #[error("Request cancelled by user")]
    UserCancelled,

    /// User closed the PIN prompt
    #[error("PIN entry cancelled")]
    PinEntryCancelled,

    /// User closed the key entry prompt
    #[error("Key entry cancelled")]
    KeyEntryCancelled,

    /// Relay session token expired
    #[error("Relay session expired")]
    SessionExpired,

    /// Network refused the transaction
    #[error("Broadcast rejected: {0}")]
    BroadcastRejected(String),

    /// Transaction was broadcast but never reached a terminal status
    #[error("Status poll timed out for transaction {0}")]
    StatusPollTimedOut(String),

    /// PIN does not satisfy length requirements
    #[error("Invalid PIN: {0}")]
    InvalidPin(String),

    /// Vault exists but is not decrypted in memory
    #[error("Vault is locked")]
    VaultLocked,

    /// No vault has been created yet
    #[error("No vault has been created")]
    NoVault,

    /// Backend cannot express the requested operation
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// Export payload exceeds the displayable size
    #[error("Export too large: {0}")]
    ExportTooLarge(String),

    /// Signing primitive failure
    #[error("Signing error: {0}")]
    Signing(String),

    /// Relay protocol error
    #[error("Relay error: {0}")]
    Relay(String),

    /// Network error
    #[error("Network error: {0}")]
    Network(String),

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True when the failure guarantees nothing reached the network.
    ///
    /// `StatusPollTimedOut` is the one outcome where a broadcast was sent but
    /// its fate is unknown; retrying blindly could double-spend.
    pub fn nothing_signed(&self) -> bool {
        !matches!(self, Error::StatusPollTimedOut(_))
    }

    /// Check if error is a user-facing error (vs internal error)
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidPasswordOrCorruptData
                | Error::KeyMismatch(_)
                | Error::InvalidKeyFormat(_)
                | Error::AccountNotFound(_)
                | Error::UserCancelled
                | Error::PinEntryCancelled
                | Error::KeyEntryCancelled
                | Error::InvalidPin(_)
                | Error::BroadcastRejected(_)
                | Error::StatusPollTimedOut(_)
        )
    }

    /// Get user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            Error::InvalidPasswordOrCorruptData => {
                "The PIN is incorrect or the stored data is damaged.".to_string()
            }
            Error::KeyMismatch(_) => {
                "This private key does not belong to the selected account and key level.".to_string()
            }
            Error::InvalidKeyFormat(_) => {
                "This does not look like a private key. Please check and try again.".to_string()
            }
            Error::AccountNotFound(_) => {
                "The account could not be found on the network. Please check the name.".to_string()
            }
            Error::InvalidPin(_) => "The PIN must be at least 4 characters long.".to_string(),
            Error::BroadcastRejected(_) => {
                "The network rejected the transaction. Nothing was sent; you can retry.".to_string()
            }
            Error::StatusPollTimedOut(tx_id) => format!(
                "Transaction {} was sent but its confirmation is unknown. Check a block explorer before retrying.",
                tx_id
            ),
            Error::SignerUnavailable(_) => {
                "The selected signer is not available. Choose another signing method.".to_string()
            }
            _ => self.to_string(),
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::InvalidPasswordOrCorruptData | Error::InvalidPin(_) | Error::VaultLocked | Error::NoVault => {
                ErrorCategory::Vault
            }
            Error::KeyMismatch(_) | Error::InvalidKeyFormat(_) | Error::Signing(_) => ErrorCategory::Keys,
            Error::UserCancelled | Error::PinEntryCancelled | Error::KeyEntryCancelled => {
                ErrorCategory::Cancelled
            }
            Error::SignerUnavailable(_) | Error::UnsupportedOperation(_) => ErrorCategory::Signer,
            Error::SessionExpired | Error::Relay(_) => ErrorCategory::Relay,
            Error::BroadcastRejected(_) | Error::StatusPollTimedOut(_) => ErrorCategory::Broadcast,
            Error::AccountNotFound(_) | Error::Network(_) => ErrorCategory::Network,
            Error::Storage(_) => ErrorCategory::Storage,
            Error::ExportTooLarge(_) | Error::Serialization(_) | Error::Other(_) => {
                ErrorCategory::Internal
            }
        }
    }
}

/// Error categories for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// PIN and envelope errors
    Vault,
    /// Key validation and signing errors
    Keys,
    /// User dismissed a prompt
    Cancelled,
    /// Backend selection errors
    Signer,
    /// Relay session and protocol errors
    Relay,
    /// Broadcast and confirmation errors
    Broadcast,
    /// Network lookups
    Network,
    /// Durable storage
    Storage,
    /// Internal/system errors
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Vault => write!(f, "Vault"),
            ErrorCategory::Keys => write!(f, "Keys"),
            ErrorCategory::Cancelled => write!(f, "Cancelled"),
            ErrorCategory::Signer => write!(f, "Signer"),
            ErrorCategory::Relay => write!(f, "Relay"),
            ErrorCategory::Broadcast => write!(f, "Broadcast"),
            ErrorCategory::Network => write!(f, "Network"),
            ErrorCategory::Storage => write!(f, "Storage"),
            ErrorCategory::Internal => write!(f, "Internal"),
        }
    }
}
