//! Relay wire protocol
//!
//! JSON text frames tagged by `cmd`. Every request carries a client-generated
//! `uuid` and every reply echoes it. Payloads travel as base64 ChaCha20-Poly1305
//! ciphertext under the per-session auth key; the relay server only sees
//! routing fields.

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use ledgerkey_core::{Error, Operation, Result};
use ledgerkey_storage::{EncryptionAlgorithm, MasterKey};
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use zeroize::Zeroizing;

/// URI scheme prefix read by the companion app
pub const AUTH_URI_PREFIX: &str = "has://auth_req/";

/// Frames exchanged with the relay server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum RelayMessage {
    /// Start pairing; `data` is the encrypted [`AuthPayload`]
    AuthReq {
        /// Account to authenticate
        account: String,
        /// Request id
        uuid: Uuid,
        /// Encrypted payload
        data: String,
    },
    /// Server registered the pairing request
    AuthWait {
        /// Request id
        uuid: Uuid,
        /// Expiry, milliseconds since the epoch
        expire: i64,
    },
    /// Companion app approved; `data` is the encrypted [`AuthAckPayload`]
    AuthAck {
        /// Request id
        uuid: Uuid,
        /// Encrypted payload
        data: String,
    },
    /// Companion app declined
    AuthNack {
        /// Request id
        uuid: Uuid,
    },
    /// Server failed the request
    AuthErr {
        /// Request id
        uuid: Uuid,
        /// Reason
        error: String,
    },
    /// Sign request; `data` is the encrypted [`SignPayload`]
    SignReq {
        /// Account to sign for
        account: String,
        /// Session token
        token: String,
        /// Request id
        uuid: Uuid,
        /// Encrypted payload
        data: String,
    },
    /// Server forwarded the sign request
    SignWait {
        /// Request id
        uuid: Uuid,
        /// Expiry, milliseconds since the epoch
        expire: i64,
    },
    /// Companion app signed (and broadcast, when asked)
    SignAck {
        /// Request id
        uuid: Uuid,
        /// Result reported by the app, usually the transaction id
        #[serde(default)]
        data: Option<String>,
    },
    /// Companion app declined
    SignNack {
        /// Request id
        uuid: Uuid,
    },
    /// Signing failed on the app side
    SignErr {
        /// Request id
        uuid: Uuid,
        /// Reason
        error: String,
    },
    /// Detached signature request; `data` is the encrypted [`ChallengePayload`]
    ChallengeReq {
        /// Account to sign for
        account: String,
        /// Session token
        token: String,
        /// Request id
        uuid: Uuid,
        /// Encrypted payload
        data: String,
    },
    /// Server forwarded the challenge
    ChallengeWait {
        /// Request id
        uuid: Uuid,
        /// Expiry, milliseconds since the epoch
        expire: i64,
    },
    /// Challenge signed; `data` is the encrypted [`ChallengeAckPayload`]
    ChallengeAck {
        /// Request id
        uuid: Uuid,
        /// Encrypted payload
        data: String,
    },
    /// Companion app declined
    ChallengeNack {
        /// Request id
        uuid: Uuid,
    },
    /// Challenge failed
    ChallengeErr {
        /// Request id
        uuid: Uuid,
        /// Reason
        error: String,
    },
    /// The session or the request has expired on the server
    Expired {
        /// Request id
        uuid: Uuid,
    },
    /// Anything this client does not understand
    #[serde(other)]
    Unknown,
}

impl RelayMessage {
    /// Request id, when the frame carries one
    pub fn uuid(&self) -> Option<Uuid> {
        match self {
            RelayMessage::AuthReq { uuid, .. }
            | RelayMessage::AuthWait { uuid, .. }
            | RelayMessage::AuthAck { uuid, .. }
            | RelayMessage::AuthNack { uuid }
            | RelayMessage::AuthErr { uuid, .. }
            | RelayMessage::SignReq { uuid, .. }
            | RelayMessage::SignWait { uuid, .. }
            | RelayMessage::SignAck { uuid, .. }
            | RelayMessage::SignNack { uuid }
            | RelayMessage::SignErr { uuid, .. }
            | RelayMessage::ChallengeReq { uuid, .. }
            | RelayMessage::ChallengeWait { uuid, .. }
            | RelayMessage::ChallengeAck { uuid, .. }
            | RelayMessage::ChallengeNack { uuid }
            | RelayMessage::ChallengeErr { uuid, .. }
            | RelayMessage::Expired { uuid } => Some(*uuid),
            RelayMessage::Unknown => None,
        }
    }

    /// Encode as a text frame
    pub fn to_frame(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a text frame
    pub fn from_frame(frame: &str) -> Result<Self> {
        serde_json::from_str(frame).map_err(|e| Error::Relay(format!("Malformed relay frame: {}", e)))
    }
}

/// Application shown to the user on the companion app
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppDescriptor {
    /// Application name
    pub name: String,
    /// Short description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Icon URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
}

impl Default for AppDescriptor {
    fn default() -> Self {
        Self {
            name: "ledgerkey".to_string(),
            description: None,
            icon: None,
        }
    }
}

/// Encrypted body of `auth_req`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthPayload {
    /// Requesting application
    pub app: AppDescriptor,
}

/// Encrypted body of `auth_ack`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthAckPayload {
    /// Session token for later requests
    pub token: String,
    /// Token expiry, milliseconds since the epoch
    pub expire: i64,
}

/// Encrypted body of `sign_req`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignPayload {
    /// Requested authority
    pub key_type: String,
    /// Operations to sign
    pub ops: Vec<Operation>,
    /// Broadcast after signing
    pub broadcast: bool,
}

/// Encrypted body of `challenge_req`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengePayload {
    /// Requested authority
    pub key_type: String,
    /// Text to sign
    pub challenge: String,
}

/// Encrypted body of `challenge_ack`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeAckPayload {
    /// Signature over the challenge
    pub signature: String,
    /// Public key that signed
    pub pubkey: String,
}

/// Content of the pairing URI
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthUri {
    /// Account being paired
    pub account: String,
    /// Pairing request id
    pub uuid: Uuid,
    /// Auth key the companion app encrypts with
    pub key: String,
    /// Relay server the app should reach
    pub host: String,
}

/// Fresh random auth key, hex encoded
pub fn generate_auth_key() -> Zeroizing<String> {
    let mut bytes = Zeroizing::new([0u8; 32]);
    rand::thread_rng().fill_bytes(&mut *bytes);
    Zeroizing::new(hex::encode(&*bytes))
}

fn cipher(auth_key: &str) -> MasterKey {
    MasterKey::from_secret(auth_key.as_bytes(), EncryptionAlgorithm::ChaCha20Poly1305)
}

/// Encrypt `payload` under `auth_key`
pub fn encrypt_payload<T: Serialize>(auth_key: &str, payload: &T) -> Result<String> {
    let plaintext = Zeroizing::new(serde_json::to_vec(payload)?);
    let sealed = cipher(auth_key).encrypt(&plaintext)?;
    Ok(STANDARD.encode(sealed))
}

/// Decrypt a payload produced by [`encrypt_payload`]
pub fn decrypt_payload<T: DeserializeOwned>(auth_key: &str, data: &str) -> Result<T> {
    let sealed = STANDARD
        .decode(data)
        .map_err(|e| Error::Relay(format!("Payload is not base64: {}", e)))?;
    let plaintext = cipher(auth_key)
        .decrypt(&sealed)
        .map_err(|_| Error::Relay("Payload could not be decrypted".to_string()))?;
    serde_json::from_slice(&plaintext).map_err(|e| Error::Relay(format!("Malformed payload: {}", e)))
}

/// Pairing URI for QR display
pub fn auth_uri(uri: &AuthUri) -> Result<String> {
    let json = serde_json::to_vec(uri)?;
    Ok(format!("{}{}", AUTH_URI_PREFIX, URL_SAFE_NO_PAD.encode(json)))
}

/// Read a pairing URI
pub fn parse_auth_uri(uri: &str) -> Result<AuthUri> {
    let encoded = uri
        .strip_prefix(AUTH_URI_PREFIX)
        .ok_or_else(|| Error::Relay("Not a pairing URI".to_string()))?;
    let json = URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|e| Error::Relay(format!("Pairing URI is not base64: {}", e)))?;
    serde_json::from_slice(&json).map_err(|e| Error::Relay(format!("Malformed pairing URI: {}", e)))
}

/// Convert a millisecond epoch to a timestamp
pub fn expiry(millis: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| Error::Relay(format!("Invalid expiry: {}", millis)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_frames_are_tagged_by_cmd() {
        let uuid = Uuid::new_v4();
        let frame = RelayMessage::SignWait { uuid, expire: 1_700_000_000_000 }
            .to_frame()
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["cmd"], "sign_wait");
        assert_eq!(RelayMessage::from_frame(&frame).unwrap().uuid(), Some(uuid));
    }

    #[test]
    fn test_unknown_command_tolerated() {
        let message = RelayMessage::from_frame(r#"{"cmd":"connected","server":"1.0"}"#).unwrap();
        assert_eq!(message, RelayMessage::Unknown);
        assert!(RelayMessage::from_frame("not json").is_err());
    }

    #[test]
    fn test_payload_encryption() {
        let key = generate_auth_key();
        let payload = SignPayload {
            key_type: "posting".to_string(),
            ops: vec![Operation::new("vote", json!({"voter": "alice"}))],
            broadcast: true,
        };
        let data = encrypt_payload(&key, &payload).unwrap();
        assert!(!data.contains("alice"));

        let decoded: SignPayload = decrypt_payload(&key, &data).unwrap();
        assert_eq!(decoded, payload);

        let other = generate_auth_key();
        assert!(decrypt_payload::<SignPayload>(&other, &data).is_err());
    }

    #[test]
    fn test_auth_uri() {
        let uri = AuthUri {
            account: "alice".to_string(),
            uuid: Uuid::new_v4(),
            key: generate_auth_key().to_string(),
            host: "wss://relay.example".to_string(),
        };
        let encoded = auth_uri(&uri).unwrap();
        assert!(encoded.starts_with(AUTH_URI_PREFIX));
        assert_eq!(parse_auth_uri(&encoded).unwrap(), uri);
        assert!(parse_auth_uri("https://example.com").is_err());
    }
}
