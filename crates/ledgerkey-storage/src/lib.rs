//! Encrypted local storage for Ledgerkey
//!
//! Durable key/value storage (SQLite or in-memory), the password-sealed
//! Cipher Envelope, the decrypted vault model and the session that guards it,
//! verified key entry, preferences and key export.
//!
//! ## Security Features
//!
//! - **Envelope**: PBKDF2-HMAC-SHA256 + ChaCha20-Poly1305 with header-bound AAD
//! - **Legacy formats**: read transparently and migrated on first unlock
//! - **Session**: vault and PIN held together, dropped together on lock
//! - **Key entry**: derived public key checked against on-chain authorities
//! - **Export**: gated flow with warning → PIN → payload, audited

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod credentials;
pub mod database;
pub mod envelope;
pub mod error;
pub mod export;
pub mod migrations;
pub mod preferences;
pub mod security;
pub mod session;
pub mod store;
pub mod vault;

pub use credentials::{AccountSummary, CredentialVault};
pub use database::Database;
pub use envelope::{
    benchmark_iterations, Envelope, EnvelopeParams, EnvelopeSlot, EnvelopeVersion,
    DEFAULT_BENCHMARK_TARGET, DEFAULT_ITERATIONS, MAX_ITERATIONS, MIN_ITERATIONS,
};
pub use error::{Error, Result};
pub use export::{
    parse_import_uri, render_file, render_import_uri, warnings as export_warnings, ExportAuditEntry,
    ExportFlowState, ExportFormat, ExportResult, KeyExportManager, FILE_BANNER, IMPORT_URI_PREFIX,
    MAX_QR_PAYLOAD_BYTES,
};
pub use preferences::{PreferenceStore, Preferences, MAX_RECENT_ACCOUNTS};
pub use security::{generate_salt, hash_sha256, EncryptionAlgorithm, MasterKey};
pub use session::{validate_pin, SessionCache, SessionHandle, SessionState, MIN_PIN_LENGTH};
pub use store::{
    load_json, save_json, KeyValueStore, MemoryStore, PREFERENCES_KEY, TRACKER_KEY, VAULT_ENVELOPE_KEY,
};
pub use vault::{normalize_account, AccountSecrets, Vault};
