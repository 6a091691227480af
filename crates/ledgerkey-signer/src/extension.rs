//! Browser-extension signer
//!
//! The extension itself lives outside this process; the host injects an
//! [`ExtensionBridge`] that forwards requests to it. Without a bridge every
//! request fails with `SignerUnavailable` before anything is prompted.

use crate::backend::{SignContext, SignOutcome, SignerBackend, SignerKind};
use async_trait::async_trait;
use ledgerkey_core::{BroadcastResult, Error, KeyLevel, Operation, Result, Signature};
use std::sync::Arc;
use tracing::debug;

/// Host-provided connection to the extension
#[async_trait]
pub trait ExtensionBridge: Send + Sync {
    /// Ask the extension to sign and broadcast
    async fn request_broadcast(
        &self,
        account: &str,
        operations: &[Operation],
        level: KeyLevel,
    ) -> Result<BroadcastResult>;

    /// Ask the extension to sign a message
    async fn request_sign_buffer(&self, account: &str, message: &str, level: KeyLevel) -> Result<Signature>;
}

/// Signer that delegates to an injected extension bridge
pub struct ExtensionSigner {
    bridge: Option<Arc<dyn ExtensionBridge>>,
}

impl ExtensionSigner {
    /// Signer over `bridge`, or an unavailable signer when `None`
    pub fn new(bridge: Option<Arc<dyn ExtensionBridge>>) -> Self {
        Self { bridge }
    }

    /// True when a bridge was injected
    pub fn is_available(&self) -> bool {
        self.bridge.is_some()
    }

    fn bridge(&self) -> Result<&Arc<dyn ExtensionBridge>> {
        self.bridge
            .as_ref()
            .ok_or_else(|| Error::SignerUnavailable("Browser extension not detected".to_string()))
    }
}

#[async_trait]
impl SignerBackend for ExtensionSigner {
    fn kind(&self) -> SignerKind {
        SignerKind::Extension
    }

    async fn sign(
        &self,
        ctx: &SignContext,
        account: &str,
        operations: &[Operation],
        level: KeyLevel,
    ) -> Result<SignOutcome> {
        let bridge = self.bridge()?;
        debug!("Forwarding {} operation(s) for @{} to extension", operations.len(), account);
        let result = ctx
            .cancel
            .run(bridge.request_broadcast(account, operations, level))
            .await?;
        Ok(SignOutcome::Broadcast(result))
    }

    async fn sign_only(
        &self,
        ctx: &SignContext,
        account: &str,
        challenge: &str,
        level: KeyLevel,
    ) -> Result<Signature> {
        let bridge = self.bridge()?;
        ctx.cancel.run(bridge.request_sign_buffer(account, challenge, level)).await
    }
}
