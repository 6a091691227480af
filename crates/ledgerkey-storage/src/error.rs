//! Error types

/// Storage errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Encryption error
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// Migration error
    #[error("Migration error: {0}")]
    Migration(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Store refused the write
    #[error("Write failed: {0}")]
    WriteFailed(String),

    /// Storage error (generic)
    #[error("Storage error: {0}")]
    Storage(String),
}

/// Result type
pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for ledgerkey_core::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Serialization(e) => ledgerkey_core::Error::Serialization(e),
            other => ledgerkey_core::Error::Storage(other.to_string()),
        }
    }
}
