//! Signer backend seam
//!
//! Every way of producing a signature implements [`SignerBackend`]. What a
//! successful `sign` means differs per backend, so the result is a
//! [`SignOutcome`] rather than a bare broadcast result.

use crate::cancel::CancelToken;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ledgerkey_core::{BroadcastResult, Error, KeyLevel, Operation, Result, Signature};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Available backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignerKind {
    /// Keys held in the local vault
    Local,
    /// Browser-extension signer
    Extension,
    /// Redirect-based web signer
    Redirect,
    /// Mobile signer over a relay socket
    Relay,
}

impl SignerKind {
    /// Lowercase identifier
    pub fn as_str(&self) -> &'static str {
        match self {
            SignerKind::Local => "local",
            SignerKind::Extension => "extension",
            SignerKind::Redirect => "redirect",
            SignerKind::Relay => "relay",
        }
    }
}

impl fmt::Display for SignerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignerKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(SignerKind::Local),
            "extension" => Ok(SignerKind::Extension),
            "redirect" => Ok(SignerKind::Redirect),
            "relay" => Ok(SignerKind::Relay),
            other => Err(Error::Other(format!("Unknown signer backend: {}", other))),
        }
    }
}

/// Per-request context handed to a backend
#[derive(Debug, Clone)]
pub struct SignContext {
    /// Request id; prompts raised for this request carry the same id
    pub request_id: Uuid,
    /// Set when the caller abandons the request
    pub cancel: CancelToken,
}

impl SignContext {
    /// Context with a fresh id
    pub fn new() -> Self {
        Self::with_id(Uuid::new_v4())
    }

    /// Context for a known id
    pub fn with_id(request_id: Uuid) -> Self {
        Self {
            request_id,
            cancel: CancelToken::new(),
        }
    }

    /// Fail with `UserCancelled` once the caller has cancelled
    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(Error::UserCancelled)
        } else {
            Ok(())
        }
    }
}

impl Default for SignContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Relay acknowledgment that signing was requested on the remote device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayAck {
    /// Relay request id; the final result arrives as an event with this id
    pub uuid: Uuid,
    /// When the remote request lapses
    pub expires_at: DateTime<Utc>,
}

/// URL handed to the platform for a redirect signer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectTicket {
    /// Signer URL that was opened
    pub url: String,
}

/// What a successful `sign` produced
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SignOutcome {
    /// Transaction accepted by the network
    Broadcast(BroadcastResult),
    /// Relay signer was asked; completion is reported asynchronously
    Requested(RelayAck),
    /// Redirect signer was opened; no result comes back
    Redirected(RedirectTicket),
}

impl SignOutcome {
    /// Broadcast result, when the network has accepted the transaction
    pub fn broadcast(&self) -> Option<&BroadcastResult> {
        match self {
            SignOutcome::Broadcast(result) => Some(result),
            _ => None,
        }
    }
}

/// A way to sign on behalf of an account
#[async_trait]
pub trait SignerBackend: Send + Sync {
    /// Which backend this is
    fn kind(&self) -> SignerKind;

    /// Sign `operations` as `account` with authority `level`
    async fn sign(
        &self,
        ctx: &SignContext,
        account: &str,
        operations: &[Operation],
        level: KeyLevel,
    ) -> Result<SignOutcome>;

    /// Sign an arbitrary challenge without broadcasting
    async fn sign_only(
        &self,
        ctx: &SignContext,
        account: &str,
        challenge: &str,
        level: KeyLevel,
    ) -> Result<Signature>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trip() {
        for kind in [SignerKind::Local, SignerKind::Extension, SignerKind::Redirect, SignerKind::Relay] {
            assert_eq!(kind.as_str().parse::<SignerKind>().unwrap(), kind);
        }
        assert!("ledger".parse::<SignerKind>().is_err());
    }

    #[test]
    fn test_cancelled_context() {
        let ctx = SignContext::new();
        assert!(ctx.check_cancelled().is_ok());
        ctx.cancel.cancel();
        assert!(matches!(ctx.check_cancelled(), Err(Error::UserCancelled)));
    }

    #[test]
    fn test_outcome_serialization() {
        let outcome = SignOutcome::Redirected(RedirectTicket {
            url: "https://signer.example/sign".to_string(),
        });
        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value["kind"], "redirected");
        assert!(outcome.broadcast().is_none());
    }
}
