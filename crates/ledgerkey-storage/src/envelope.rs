//! Cipher Envelope
//!
//! A password-sealed blob with a self-describing header. Three formats are
//! readable; only [`EnvelopeVersion::CANONICAL`] is ever written. Reading an
//! older format through [`EnvelopeSlot::unseal`] re-seals the value in the
//! canonical format and persists it before the plaintext is returned.
//!
//! | version | key derivation                      | cipher              | AAD    |
//! |---------|-------------------------------------|---------------------|--------|
//! | 1       | SHA-256(password)                   | AES-256-GCM         | none   |
//! | 2       | PBKDF2-HMAC-SHA256(salt, iterations)| AES-256-GCM         | none   |
//! | 3       | PBKDF2-HMAC-SHA256(salt, iterations)| ChaCha20-Poly1305   | header |

use crate::security::{generate_salt, EncryptionAlgorithm, MasterKey};
use crate::store::{load_json, save_json, KeyValueStore};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use ledgerkey_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use zeroize::Zeroizing;

/// Default PBKDF2 iteration count
pub const DEFAULT_ITERATIONS: u32 = 100_000;

/// Lowest iteration count accepted when writing
pub const MIN_ITERATIONS: u32 = 10_000;

/// Highest iteration count the benchmark will recommend
pub const MAX_ITERATIONS: u32 = 5_000_000;

/// Default wall-clock cost the benchmark aims for
pub const DEFAULT_BENCHMARK_TARGET: Duration = Duration::from_secs(2);

/// Envelope format
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EnvelopeVersion {
    /// Legacy: unsalted SHA-256 key, AES-GCM
    V1,
    /// PBKDF2 key, AES-GCM
    V2,
    /// PBKDF2 key, ChaCha20-Poly1305 bound to the header
    V3,
}

impl EnvelopeVersion {
    /// Every readable format, oldest first
    pub const ALL: [EnvelopeVersion; 3] = [EnvelopeVersion::V1, EnvelopeVersion::V2, EnvelopeVersion::V3];

    /// Format used for every write
    pub const CANONICAL: EnvelopeVersion = EnvelopeVersion::V3;

    /// Header number
    pub fn number(self) -> u8 {
        match self {
            EnvelopeVersion::V1 => 1,
            EnvelopeVersion::V2 => 2,
            EnvelopeVersion::V3 => 3,
        }
    }

    /// Formats to try for a declared header number: the declared one, then
    /// older ones newest-first, then newer ones oldest-first.
    pub fn attempt_order(declared: u8) -> Vec<EnvelopeVersion> {
        let start = Self::ALL
            .iter()
            .rposition(|v| v.number() <= declared)
            .unwrap_or(0);

        let mut order: Vec<EnvelopeVersion> = Self::ALL[..=start].iter().rev().copied().collect();
        order.extend_from_slice(&Self::ALL[start + 1..]);
        order
    }

    fn key(self, password: &str, salt: &[u8], iterations: u32) -> MasterKey {
        match self {
            EnvelopeVersion::V1 => MasterKey::from_secret(password.as_bytes(), EncryptionAlgorithm::AesGcm),
            EnvelopeVersion::V2 => MasterKey::derive(password, salt, iterations, EncryptionAlgorithm::AesGcm),
            EnvelopeVersion::V3 => {
                MasterKey::derive(password, salt, iterations, EncryptionAlgorithm::ChaCha20Poly1305)
            }
        }
    }

    fn aad(self, salt_hex: &str, iterations: u32) -> Vec<u8> {
        match self {
            EnvelopeVersion::V3 => {
                format!("ledgerkey-envelope|v{}|{}|{}", self.number(), salt_hex, iterations).into_bytes()
            }
            _ => Vec::new(),
        }
    }
}

/// Tunable sealing parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeParams {
    /// PBKDF2 iteration count
    pub iterations: u32,
}

impl Default for EnvelopeParams {
    fn default() -> Self {
        Self {
            iterations: DEFAULT_ITERATIONS,
        }
    }
}

/// Sealed value with its header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Declared format number
    pub version: u8,
    /// Hex salt
    pub salt: String,
    /// PBKDF2 iterations
    pub iterations: u32,
    /// Base64 `nonce ‖ ciphertext`
    pub ciphertext: String,
    /// When this envelope was written
    pub created_at: DateTime<Utc>,
}

impl Envelope {
    /// Seal in the canonical format
    pub fn seal(plaintext: &[u8], password: &str, params: &EnvelopeParams) -> Result<Self> {
        if params.iterations < MIN_ITERATIONS {
            return Err(Error::Other(format!(
                "KDF iterations {} below minimum {}",
                params.iterations, MIN_ITERATIONS
            )));
        }
        Self::seal_as(EnvelopeVersion::CANONICAL, plaintext, password, params.iterations)
    }

    /// Seal in a specific format. Only useful for producing legacy data.
    pub fn seal_as(version: EnvelopeVersion, plaintext: &[u8], password: &str, iterations: u32) -> Result<Self> {
        let salt = generate_salt();
        let salt_hex = hex::encode(salt);
        let key = version.key(password, &salt, iterations);
        let sealed = key
            .seal(plaintext, &version.aad(&salt_hex, iterations))
            .map_err(|e| Error::Storage(e.to_string()))?;

        Ok(Self {
            version: version.number(),
            salt: salt_hex,
            iterations,
            ciphertext: BASE64.encode(sealed),
            created_at: Utc::now(),
        })
    }

    /// Open with whichever readable format authenticates.
    ///
    /// Every failure is reported as `InvalidPasswordOrCorruptData`.
    pub fn open(&self, password: &str) -> Result<(Zeroizing<Vec<u8>>, EnvelopeVersion)> {
        let salt = hex::decode(&self.salt).map_err(|_| Error::InvalidPasswordOrCorruptData)?;
        let sealed = BASE64
            .decode(&self.ciphertext)
            .map_err(|_| Error::InvalidPasswordOrCorruptData)?;

        for version in EnvelopeVersion::attempt_order(self.version) {
            let key = version.key(password, &salt, self.iterations);
            if let Ok(plaintext) = key.open(&sealed, &version.aad(&self.salt, self.iterations)) {
                if version.number() != self.version {
                    tracing::warn!(
                        "Envelope declared v{} but opened as v{}",
                        self.version,
                        version.number()
                    );
                }
                return Ok((plaintext, version));
            }
        }

        Err(Error::InvalidPasswordOrCorruptData)
    }

    /// True when written in the canonical format
    pub fn is_canonical(&self) -> bool {
        self.version == EnvelopeVersion::CANONICAL.number()
    }
}

/// One envelope persisted under a fixed key
#[derive(Clone)]
pub struct EnvelopeSlot {
    store: Arc<dyn KeyValueStore>,
    key: String,
    params: EnvelopeParams,
}

impl EnvelopeSlot {
    /// Slot at `key` in `store`
    pub fn new(store: Arc<dyn KeyValueStore>, key: impl Into<String>, params: EnvelopeParams) -> Self {
        Self {
            store,
            key: key.into(),
            params,
        }
    }

    /// Sealing parameters in use
    pub fn params(&self) -> EnvelopeParams {
        self.params
    }

    /// True when an envelope is stored
    pub fn exists(&self) -> Result<bool> {
        Ok(self.store.get(&self.key)?.is_some())
    }

    /// Stored envelope, if any
    pub fn load(&self) -> Result<Option<Envelope>> {
        Ok(load_json(self.store.as_ref(), &self.key)?)
    }

    /// Seal `plaintext` and replace the stored envelope
    pub fn seal(&self, plaintext: &[u8], password: &str) -> Result<()> {
        let envelope = Envelope::seal(plaintext, password, &self.params)?;
        save_json(self.store.as_ref(), &self.key, &envelope)?;
        Ok(())
    }

    /// Open the stored envelope.
    ///
    /// A legacy envelope is re-sealed canonically and persisted before
    /// returning; if that write fails the whole call fails.
    pub fn unseal(&self, password: &str) -> Result<Zeroizing<Vec<u8>>> {
        let envelope = self.load()?.ok_or(Error::NoVault)?;
        let (plaintext, version) = envelope.open(password)?;

        if version != EnvelopeVersion::CANONICAL || !envelope.is_canonical() {
            tracing::info!(
                "Migrating envelope '{}' from v{} to v{}",
                self.key,
                version.number(),
                EnvelopeVersion::CANONICAL.number()
            );
            let params = EnvelopeParams {
                iterations: envelope.iterations.max(self.params.iterations),
            };
            let migrated = Envelope::seal(&plaintext, password, &params)?;
            save_json(self.store.as_ref(), &self.key, &migrated)?;
        }

        Ok(plaintext)
    }

    /// Remove the stored envelope
    pub fn destroy(&self) -> Result<()> {
        self.store.delete(&self.key)?;
        Ok(())
    }
}

/// Iteration count that makes one derivation cost roughly `target` on this host.
///
/// Advisory only; the result is clamped to `[MIN_ITERATIONS, MAX_ITERATIONS]`.
pub fn benchmark_iterations(target: Duration) -> u32 {
    const PROBE: u32 = 20_000;

    let salt = generate_salt();
    let started = Instant::now();
    let _ = MasterKey::derive("benchmark", &salt, PROBE, EncryptionAlgorithm::ChaCha20Poly1305);
    let elapsed = started.elapsed().as_secs_f64().max(1e-6);

    let estimate = (PROBE as f64 * target.as_secs_f64() / elapsed) as u64;
    let iterations = estimate.clamp(MIN_ITERATIONS as u64, MAX_ITERATIONS as u64) as u32;
    tracing::debug!(
        "KDF benchmark: {} iterations in {:.3}s, recommending {}",
        PROBE,
        elapsed,
        iterations
    );
    iterations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    const FAST: EnvelopeParams = EnvelopeParams {
        iterations: MIN_ITERATIONS,
    };

    #[test]
    fn test_attempt_order() {
        use EnvelopeVersion::*;
        assert_eq!(EnvelopeVersion::attempt_order(3), vec![V3, V2, V1]);
        assert_eq!(EnvelopeVersion::attempt_order(2), vec![V2, V1, V3]);
        assert_eq!(EnvelopeVersion::attempt_order(1), vec![V1, V2, V3]);
        assert_eq!(EnvelopeVersion::attempt_order(0), vec![V1, V2, V3]);
        assert_eq!(EnvelopeVersion::attempt_order(9), vec![V3, V2, V1]);
    }

    #[test]
    fn test_round_trip() {
        let envelope = Envelope::seal(b"{\"accounts\":{}}", "1234", &FAST).unwrap();
        assert_eq!(envelope.version, 3);
        assert_eq!(hex::decode(&envelope.salt).unwrap().len(), 32);

        let (plaintext, version) = envelope.open("1234").unwrap();
        assert_eq!(plaintext.as_slice(), b"{\"accounts\":{}}");
        assert_eq!(version, EnvelopeVersion::V3);
    }

    #[test]
    fn test_wrong_password() {
        let envelope = Envelope::seal(b"data", "1234", &FAST).unwrap();
        assert!(matches!(envelope.open("4321"), Err(Error::InvalidPasswordOrCorruptData)));
    }

    #[test]
    fn test_header_tampering_detected() {
        let mut envelope = Envelope::seal(b"data", "1234", &FAST).unwrap();
        envelope.iterations += 1;
        assert!(matches!(envelope.open("1234"), Err(Error::InvalidPasswordOrCorruptData)));
    }

    #[test]
    fn test_corrupt_fields_collapse_to_one_error() {
        let mut envelope = Envelope::seal(b"data", "1234", &FAST).unwrap();
        envelope.salt = "not hex".to_string();
        assert!(matches!(envelope.open("1234"), Err(Error::InvalidPasswordOrCorruptData)));

        let mut envelope = Envelope::seal(b"data", "1234", &FAST).unwrap();
        envelope.ciphertext = "AAAA".to_string();
        assert!(matches!(envelope.open("1234"), Err(Error::InvalidPasswordOrCorruptData)));
    }

    #[test]
    fn test_low_iterations_rejected_on_write() {
        let params = EnvelopeParams { iterations: 10 };
        assert!(Envelope::seal(b"data", "1234", &params).is_err());
    }

    #[test]
    fn test_mislabelled_version_still_opens() {
        let mut envelope = Envelope::seal_as(EnvelopeVersion::V2, b"data", "1234", MIN_ITERATIONS).unwrap();
        envelope.version = 3;
        let (plaintext, version) = envelope.open("1234").unwrap();
        assert_eq!(plaintext.as_slice(), b"data");
        assert_eq!(version, EnvelopeVersion::V2);
    }

    #[test]
    fn test_slot_migrates_legacy_on_read() {
        let store = Arc::new(MemoryStore::new());
        let slot = EnvelopeSlot::new(store.clone(), "vault.envelope", FAST);

        let legacy = Envelope::seal_as(EnvelopeVersion::V1, b"legacy", "1234", MIN_ITERATIONS).unwrap();
        save_json(store.as_ref(), "vault.envelope", &legacy).unwrap();

        let plaintext = slot.unseal("1234").unwrap();
        assert_eq!(plaintext.as_slice(), b"legacy");

        let stored = slot.load().unwrap().unwrap();
        assert!(stored.is_canonical());
        assert_eq!(stored.open("1234").unwrap().0.as_slice(), b"legacy");
    }

    #[test]
    fn test_slot_migration_failure_fails_read() {
        let store = Arc::new(MemoryStore::new());
        let slot = EnvelopeSlot::new(store.clone(), "vault.envelope", FAST);

        let legacy = Envelope::seal_as(EnvelopeVersion::V2, b"legacy", "1234", MIN_ITERATIONS).unwrap();
        save_json(store.as_ref(), "vault.envelope", &legacy).unwrap();
        store.set_read_only(true);

        assert!(matches!(slot.unseal("1234"), Err(Error::Storage(_))));
        assert_eq!(slot.load().unwrap().unwrap(), legacy);
    }

    #[test]
    fn test_slot_wrong_password_leaves_store_untouched() {
        let store = Arc::new(MemoryStore::new());
        let slot = EnvelopeSlot::new(store.clone(), "vault.envelope", FAST);
        slot.seal(b"data", "1234").unwrap();
        let before = slot.load().unwrap();

        assert!(matches!(slot.unseal("0000"), Err(Error::InvalidPasswordOrCorruptData)));
        assert_eq!(slot.load().unwrap(), before);
    }

    #[test]
    fn test_missing_envelope_is_no_vault() {
        let slot = EnvelopeSlot::new(Arc::new(MemoryStore::new()), "vault.envelope", FAST);
        assert!(!slot.exists().unwrap());
        assert!(matches!(slot.unseal("1234"), Err(Error::NoVault)));
    }

    #[test]
    fn test_benchmark_is_clamped() {
        let iterations = benchmark_iterations(Duration::from_millis(1));
        assert!((MIN_ITERATIONS..=MAX_ITERATIONS).contains(&iterations));
    }
}
