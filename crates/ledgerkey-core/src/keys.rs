//! Key levels, secret material and the signing primitive
//!
//! The ledger's signature scheme is consumed through [`KeyScheme`]. The
//! bundled [`Secp256k1Scheme`] handles WIF private keys and prefixed
//! base58 public keys (`STM...`).

use crate::{Error, Result};
use ripemd::Ripemd160;
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use zeroize::Zeroizing;

/// Minimum length of a formatted private key
pub const MIN_SECRET_LENGTH: usize = 50;

/// Leading character of a WIF private key
pub const SECRET_PREFIX: char = '5';

/// Network prefixes stripped before comparing public keys
pub const KNOWN_KEY_PREFIXES: [&str; 2] = ["STM", "TST"];

const WIF_VERSION: u8 = 0x80;

/// Privilege tier of an account key
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyLevel {
    /// Social actions (votes, posts, most custom messages)
    Posting,
    /// Financial actions
    Active,
    /// Account recovery and authority changes
    Owner,
    /// Memo encryption
    Memo,
    /// Master password
    Master,
}

impl KeyLevel {
    /// Every level, in display order
    pub const ALL: [KeyLevel; 5] = [
        KeyLevel::Posting,
        KeyLevel::Active,
        KeyLevel::Owner,
        KeyLevel::Memo,
        KeyLevel::Master,
    ];

    /// Lowercase identifier
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyLevel::Posting => "posting",
            KeyLevel::Active => "active",
            KeyLevel::Owner => "owner",
            KeyLevel::Memo => "memo",
            KeyLevel::Master => "master",
        }
    }

    /// Levels that may sign in place of this one, requested level first.
    ///
    /// `Posting ⊂ Active ⊂ Owner`; memo and master keys never stand in.
    pub fn fallback_chain(self) -> &'static [KeyLevel] {
        match self {
            KeyLevel::Posting => &[KeyLevel::Posting, KeyLevel::Active, KeyLevel::Owner],
            KeyLevel::Active => &[KeyLevel::Active, KeyLevel::Owner],
            KeyLevel::Owner => &[KeyLevel::Owner],
            KeyLevel::Memo => &[KeyLevel::Memo],
            KeyLevel::Master => &[KeyLevel::Master],
        }
    }

    /// On-chain authority a secret of this level is verified against
    pub fn authority(self) -> KeyLevel {
        match self {
            KeyLevel::Master => KeyLevel::Owner,
            other => other,
        }
    }
}

impl fmt::Display for KeyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "posting" => Ok(KeyLevel::Posting),
            "active" => Ok(KeyLevel::Active),
            "owner" => Ok(KeyLevel::Owner),
            "memo" => Ok(KeyLevel::Memo),
            "master" => Ok(KeyLevel::Master),
            other => Err(Error::Other(format!("Unknown key level: {}", other))),
        }
    }
}

/// Private key material (zeroized on drop, never printed)
#[derive(Clone)]
pub struct Secret(Zeroizing<String>);

impl Secret {
    /// Wrap a formatted private key. Surrounding whitespace is dropped.
    pub fn new(value: impl Into<String>) -> Result<Self> {
        let raw = Zeroizing::new(value.into());
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(Error::InvalidKeyFormat("empty key".to_string()));
        }
        Ok(Self(Zeroizing::new(trimmed.to_string())))
    }

    /// Borrow the formatted key
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Cheap structural check: prefix and minimum length
    pub fn has_valid_shape(&self) -> bool {
        self.0.starts_with(SECRET_PREFIX) && self.0.len() >= MIN_SECRET_LENGTH
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl Serialize for Secret {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Secret {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = Zeroizing::new(String::deserialize(deserializer)?);
        Secret::new(raw.as_str()).map_err(serde::de::Error::custom)
    }
}

/// Detached signature (hex)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(pub String);

impl Signature {
    /// Hex string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Remove a known network prefix from a public key
pub fn strip_key_prefix(key: &str) -> &str {
    let key = key.trim();
    KNOWN_KEY_PREFIXES
        .iter()
        .find_map(|prefix| key.strip_prefix(prefix))
        .unwrap_or(key)
}

/// External signing primitive
pub trait KeyScheme: Send + Sync {
    /// Structural validation; no network access
    fn validate(&self, secret: &Secret) -> Result<()>;

    /// Public key in the network's text encoding
    fn public_key(&self, secret: &Secret) -> Result<String>;

    /// Sign a 32-byte digest
    fn sign_digest(&self, secret: &Secret, digest: &[u8; 32]) -> Result<Signature>;

    /// Sign arbitrary bytes (SHA-256 of the message)
    fn sign_message(&self, secret: &Secret, message: &[u8]) -> Result<Signature> {
        let digest: [u8; 32] = Sha256::digest(message).into();
        self.sign_digest(secret, &digest)
    }
}

/// secp256k1 keys: WIF secrets, `<prefix><base58(pubkey ‖ ripemd160 checksum)>` public keys
pub struct Secp256k1Scheme {
    secp: Secp256k1<secp256k1::All>,
    public_prefix: String,
}

impl Secp256k1Scheme {
    /// Scheme with the given public key prefix
    pub fn new(public_prefix: impl Into<String>) -> Self {
        Self {
            secp: Secp256k1::new(),
            public_prefix: public_prefix.into(),
        }
    }

    /// Generate a fresh random WIF secret
    pub fn generate_secret() -> Secret {
        use rand::RngCore;

        let mut rng = rand::thread_rng();
        loop {
            let mut bytes = Zeroizing::new([0u8; 32]);
            rng.fill_bytes(&mut bytes[..]);
            if let Ok(key) = SecretKey::from_slice(&bytes[..]) {
                return Self::encode_wif(&key);
            }
        }
    }

    /// Encode a raw secret key as WIF
    pub fn encode_wif(key: &SecretKey) -> Secret {
        let mut payload = Zeroizing::new(Vec::with_capacity(33));
        payload.push(WIF_VERSION);
        payload.extend_from_slice(&key.secret_bytes());
        let encoded = bs58::encode(&payload[..]).with_check().into_string();
        Secret(Zeroizing::new(encoded))
    }

    fn decode_wif(&self, secret: &Secret) -> Result<SecretKey> {
        if !secret.has_valid_shape() {
            return Err(Error::InvalidKeyFormat(format!(
                "expected a key starting with '{}' of at least {} characters",
                SECRET_PREFIX, MIN_SECRET_LENGTH
            )));
        }

        let payload = Zeroizing::new(
            bs58::decode(secret.expose())
                .with_check(None)
                .into_vec()
                .map_err(|_| Error::InvalidKeyFormat("checksum mismatch".to_string()))?,
        );

        if payload.len() != 33 || payload[0] != WIF_VERSION {
            return Err(Error::InvalidKeyFormat("unexpected key payload".to_string()));
        }

        SecretKey::from_slice(&payload[1..])
            .map_err(|_| Error::InvalidKeyFormat("key out of range".to_string()))
    }

    fn encode_public(&self, key: &PublicKey) -> String {
        let compressed = key.serialize();
        let checksum = Ripemd160::digest(compressed);
        let mut data = Vec::with_capacity(37);
        data.extend_from_slice(&compressed);
        data.extend_from_slice(&checksum[..4]);
        format!("{}{}", self.public_prefix, bs58::encode(data).into_string())
    }
}

impl Default for Secp256k1Scheme {
    fn default() -> Self {
        Self::new(KNOWN_KEY_PREFIXES[0])
    }
}

impl KeyScheme for Secp256k1Scheme {
    fn validate(&self, secret: &Secret) -> Result<()> {
        self.decode_wif(secret).map(|_| ())
    }

    fn public_key(&self, secret: &Secret) -> Result<String> {
        let key = self.decode_wif(secret)?;
        let public = PublicKey::from_secret_key(&self.secp, &key);
        Ok(self.encode_public(&public))
    }

    fn sign_digest(&self, secret: &Secret, digest: &[u8; 32]) -> Result<Signature> {
        let key = self.decode_wif(secret)?;
        let message = Message::from_slice(digest).map_err(|e| Error::Signing(e.to_string()))?;
        let signature = self.secp.sign_ecdsa_recoverable(&message, &key);
        let (recovery_id, compact) = signature.serialize_compact();

        // Compact recoverable form: header byte (27 + 4 for compressed keys) then r ‖ s
        let mut out = Vec::with_capacity(65);
        out.push(recovery_id.to_i32() as u8 + 31);
        out.extend_from_slice(&compact);
        Ok(Signature(hex::encode(out)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_chain() {
        assert_eq!(
            KeyLevel::Posting.fallback_chain(),
            &[KeyLevel::Posting, KeyLevel::Active, KeyLevel::Owner]
        );
        assert_eq!(KeyLevel::Active.fallback_chain(), &[KeyLevel::Active, KeyLevel::Owner]);
        assert_eq!(KeyLevel::Memo.fallback_chain(), &[KeyLevel::Memo]);
    }

    #[test]
    fn test_key_level_parse() {
        assert_eq!("Posting".parse::<KeyLevel>().unwrap(), KeyLevel::Posting);
        assert_eq!(" ACTIVE ".parse::<KeyLevel>().unwrap(), KeyLevel::Active);
        assert!("root".parse::<KeyLevel>().is_err());
    }

    #[test]
    fn test_secret_debug_is_redacted() {
        let secret = Secp256k1Scheme::generate_secret();
        let printed = format!("{:?}", secret);
        assert_eq!(printed, "Secret(***)");
        assert!(!printed.contains(secret.expose()));
    }

    #[test]
    fn test_empty_secret_rejected() {
        assert!(Secret::new("   ").is_err());
    }

    #[test]
    fn test_generated_secret_is_valid_wif() {
        let scheme = Secp256k1Scheme::default();
        let secret = Secp256k1Scheme::generate_secret();
        assert!(secret.expose().starts_with('5'));
        assert_eq!(secret.expose().len(), 51);
        assert!(scheme.validate(&secret).is_ok());
    }

    #[test]
    fn test_public_key_prefix_and_determinism() {
        let scheme = Secp256k1Scheme::default();
        let secret = Secp256k1Scheme::generate_secret();
        let pk1 = scheme.public_key(&secret).unwrap();
        let pk2 = scheme.public_key(&secret).unwrap();
        assert_eq!(pk1, pk2);
        assert!(pk1.starts_with("STM"));

        let testnet = Secp256k1Scheme::new("TST");
        let pk3 = testnet.public_key(&secret).unwrap();
        assert_eq!(strip_key_prefix(&pk1), strip_key_prefix(&pk3));
    }

    #[test]
    fn test_corrupted_checksum_rejected() {
        let scheme = Secp256k1Scheme::default();
        let secret = Secp256k1Scheme::generate_secret();
        let mut chars: Vec<char> = secret.expose().chars().collect();
        let last = chars.len() - 1;
        chars[last] = if chars[last] == 'a' { 'b' } else { 'a' };
        let broken = Secret::new(chars.into_iter().collect::<String>()).unwrap();
        assert!(matches!(scheme.validate(&broken), Err(Error::InvalidKeyFormat(_))));
    }

    #[test]
    fn test_short_secret_rejected() {
        let scheme = Secp256k1Scheme::default();
        let secret = Secret::new("5abc").unwrap();
        assert!(matches!(scheme.public_key(&secret), Err(Error::InvalidKeyFormat(_))));
    }

    #[test]
    fn test_sign_message_shape() {
        let scheme = Secp256k1Scheme::default();
        let secret = Secp256k1Scheme::generate_secret();
        let sig = scheme.sign_message(&secret, b"login challenge").unwrap();
        assert_eq!(sig.as_str().len(), 130);
        let header = u8::from_str_radix(&sig.as_str()[..2], 16).unwrap();
        assert!((31..=34).contains(&header));
    }

    #[test]
    fn test_strip_key_prefix() {
        assert_eq!(strip_key_prefix("STM8abc"), "8abc");
        assert_eq!(strip_key_prefix("TST8abc"), "8abc");
        assert_eq!(strip_key_prefix("8abc"), "8abc");
    }
}
