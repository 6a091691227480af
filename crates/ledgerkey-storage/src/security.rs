//! Symmetric primitives for the vault
//!
//! Two AEADs (AES-256-GCM for legacy envelopes, ChaCha20-Poly1305 for current
//! ones), PBKDF2-HMAC-SHA256 password stretching, and a framed form used by
//! the session cache and the relay payloads.

use crate::{Error, Result};
use aes_gcm::{
    aead::{Aead, KeyInit, OsRng, Payload},
    Aes256Gcm, Nonce,
};
use chacha20poly1305::ChaCha20Poly1305;
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

/// AEAD nonce length for both algorithms
pub const NONCE_LEN: usize = 12;

const FRAME_VERSION: u8 = 1;
const FRAME_HEADER_LEN: usize = 2;

/// AEAD in use for a key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionAlgorithm {
    /// AES-256-GCM
    AesGcm,
    /// ChaCha20-Poly1305
    ChaCha20Poly1305,
}

impl EncryptionAlgorithm {
    fn tag(self) -> u8 {
        match self {
            EncryptionAlgorithm::AesGcm => 0,
            EncryptionAlgorithm::ChaCha20Poly1305 => 1,
        }
    }
}

/// 256-bit symmetric key bound to one algorithm; zeroized on drop
#[derive(Clone)]
pub struct MasterKey {
    key: Zeroizing<[u8; 32]>,
    algorithm: EncryptionAlgorithm,
}

impl MasterKey {
    /// Fresh random key
    pub fn generate(algorithm: EncryptionAlgorithm) -> Self {
        let mut key = Zeroizing::new([0u8; 32]);
        OsRng.fill_bytes(&mut key[..]);
        Self { key, algorithm }
    }

    /// Key = SHA-256(secret)
    pub fn from_secret(secret: &[u8], algorithm: EncryptionAlgorithm) -> Self {
        let key = Zeroizing::new(hash_sha256(secret));
        Self { key, algorithm }
    }

    /// Key = PBKDF2-HMAC-SHA256(password, salt, iterations)
    pub fn derive(password: &str, salt: &[u8], iterations: u32, algorithm: EncryptionAlgorithm) -> Self {
        let mut key = Zeroizing::new([0u8; 32]);
        pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, &mut key[..]);
        Self { key, algorithm }
    }

    /// Framed form: `[frame version][algorithm tag][nonce][ciphertext]`
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let sealed = self.seal(plaintext, &[])?;
        let mut framed = Vec::with_capacity(FRAME_HEADER_LEN + sealed.len());
        framed.extend_from_slice(&[FRAME_VERSION, self.algorithm.tag()]);
        framed.extend_from_slice(&sealed);
        Ok(framed)
    }

    /// Open the framed form; the header must match this key's algorithm
    pub fn decrypt(&self, data: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        let [version, tag, body @ ..] = data else {
            return Err(Error::Encryption("Frame too short".to_string()));
        };
        if *version != FRAME_VERSION {
            return Err(Error::Encryption(format!("Unknown frame version {}", version)));
        }
        if *tag != self.algorithm.tag() {
            return Err(Error::Encryption(format!(
                "Frame sealed with algorithm {}, key uses {:?}",
                tag, self.algorithm
            )));
        }
        self.open(body, &[])
    }

    /// `nonce ‖ ciphertext`, authenticating `aad`
    pub fn seal(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let payload = Payload { msg: plaintext, aad };

        let ciphertext = match self.algorithm {
            EncryptionAlgorithm::AesGcm => {
                Aes256Gcm::new(self.key.as_ref().into()).encrypt(Nonce::from_slice(&nonce), payload)
            }
            EncryptionAlgorithm::ChaCha20Poly1305 => ChaCha20Poly1305::new(self.key.as_ref().into())
                .encrypt(chacha20poly1305::Nonce::from_slice(&nonce), payload),
        }
        .map_err(|e| Error::Encryption(e.to_string()))?;

        Ok([nonce.as_slice(), ciphertext.as_slice()].concat())
    }

    /// Inverse of [`MasterKey::seal`]; fails on a wrong key or mismatched `aad`
    pub fn open(&self, data: &[u8], aad: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        if data.len() < NONCE_LEN {
            return Err(Error::Encryption("Sealed value shorter than its nonce".to_string()));
        }
        let (nonce, ciphertext) = data.split_at(NONCE_LEN);
        let payload = Payload { msg: ciphertext, aad };

        let plaintext = match self.algorithm {
            EncryptionAlgorithm::AesGcm => {
                Aes256Gcm::new(self.key.as_ref().into()).decrypt(Nonce::from_slice(nonce), payload)
            }
            EncryptionAlgorithm::ChaCha20Poly1305 => ChaCha20Poly1305::new(self.key.as_ref().into())
                .decrypt(chacha20poly1305::Nonce::from_slice(nonce), payload),
        }
        .map_err(|e| Error::Encryption(e.to_string()))?;

        Ok(Zeroizing::new(plaintext))
    }
}

/// Random 32-byte salt
pub fn generate_salt() -> [u8; 32] {
    let mut salt = [0u8; 32];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// SHA-256 digest
pub fn hash_sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}
