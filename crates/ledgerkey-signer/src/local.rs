//! Local-vault signer
//!
//! Signs with keys held in the credential vault. Before a key is used the
//! request walks a small loop, restarting from the top after every prompt:
//!
//! 1. no vault → park a `CreatePin` prompt; locked → resume from the session
//!    cache or park a `Pin` prompt
//! 2. no key at the requested level or above → park a `Key` prompt
//! 3. not yet confirmed and not suppressed → park a `Confirm` prompt
//!
//! Confirmation happens once per request. Signing only starts after the loop
//! has handed back a validated key.

use crate::backend::{SignContext, SignOutcome, SignerBackend, SignerKind};
use crate::confirmation::ConfirmationRequest;
use crate::prompt::{PromptAnswer, PromptBroker, PromptKind, Submission};
use async_trait::async_trait;
use ledgerkey_core::{
    Error, KeyLevel, Operation, Result, Secret, Signature, SignedTransaction, TransactionBroadcaster,
};
use ledgerkey_storage::{CredentialVault, SessionState};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Signer backed by the local credential vault
pub struct LocalSigner {
    vault: Arc<CredentialVault>,
    broadcaster: Arc<dyn TransactionBroadcaster>,
    prompts: Arc<PromptBroker>,
}

impl LocalSigner {
    /// New signer; prompts are parked on `prompts`
    pub fn new(
        vault: Arc<CredentialVault>,
        broadcaster: Arc<dyn TransactionBroadcaster>,
        prompts: Arc<PromptBroker>,
    ) -> Self {
        Self {
            vault,
            broadcaster,
            prompts,
        }
    }

    /// Vault this signer reads keys from
    pub fn vault(&self) -> &Arc<CredentialVault> {
        &self.vault
    }

    /// Run the prompt loop until a confirmed, validated key is available
    async fn authorize(&self, ctx: &SignContext, request: &ConfirmationRequest) -> Result<Secret> {
        let session = self.vault.session();
        let mut confirmed = false;

        loop {
            ctx.check_cancelled()?;

            match session.state()? {
                SessionState::NoVault => {
                    self.create_pin(ctx, request).await?;
                    continue;
                }
                SessionState::Locked => {
                    if !session.resume()? {
                        self.unlock(ctx, request).await?;
                    }
                    continue;
                }
                SessionState::Unlocked => {}
            }

            let secret = match self.vault.secret_for(&request.account, request.key_level) {
                Ok(Some((found, secret))) => {
                    if found != request.key_level {
                        debug!("Using {} key for {} request", found, request.key_level);
                    }
                    secret
                }
                Ok(None) => {
                    self.enter_key(ctx, request).await?;
                    continue;
                }
                // Locked by someone else between the state check and the read
                Err(Error::VaultLocked) => continue,
                Err(e) => return Err(e),
            };
            self.vault.scheme().validate(&secret)?;

            if !confirmed {
                if self.vault.is_suppressed(&request.account, &request.op_type)? {
                    debug!("Confirmation suppressed for @{} {}", request.account, request.op_type);
                } else {
                    self.confirm(ctx, request).await?;
                }
                confirmed = true;
                continue;
            }

            return Ok(secret);
        }
    }

    async fn create_pin(&self, ctx: &SignContext, request: &ConfirmationRequest) -> Result<()> {
        let mut parked = self
            .prompts
            .park(request.prompt(ctx.request_id, PromptKind::CreatePin));
        loop {
            let Submission { answer, reply } = parked.next(&ctx.cancel).await?;
            let PromptAnswer::Pin(pin) = answer else {
                reply.reject(Error::Other("Expected a PIN".to_string()));
                continue;
            };
            match self.vault.session().create_pin(&pin) {
                Ok(()) => {
                    reply.accept();
                    return Ok(());
                }
                Err(e @ Error::InvalidPin(_)) => reply.reject(e),
                Err(e) => return Err(reply.fail(e)),
            }
        }
    }

    async fn unlock(&self, ctx: &SignContext, request: &ConfirmationRequest) -> Result<()> {
        let mut parked = self.prompts.park(request.prompt(ctx.request_id, PromptKind::Pin));
        loop {
            let Submission { answer, reply } = parked.next(&ctx.cancel).await?;
            let PromptAnswer::Pin(pin) = answer else {
                reply.reject(Error::Other("Expected a PIN".to_string()));
                continue;
            };
            match self.vault.session().unlock(&pin) {
                Ok(()) => {
                    reply.accept();
                    return Ok(());
                }
                Err(e @ (Error::InvalidPasswordOrCorruptData | Error::InvalidPin(_))) => {
                    warn!("Unlock failed for request {}", ctx.request_id);
                    reply.reject(e);
                }
                Err(e) => return Err(reply.fail(e)),
            }
        }
    }

    async fn enter_key(&self, ctx: &SignContext, request: &ConfirmationRequest) -> Result<()> {
        let mut parked = self.prompts.park(request.prompt(ctx.request_id, PromptKind::Key));
        loop {
            let Submission { answer, reply } = parked.next(&ctx.cancel).await?;
            let PromptAnswer::Key(secret) = answer else {
                reply.reject(Error::Other("Expected a private key".to_string()));
                continue;
            };
            match self
                .vault
                .set_secret(&request.account, request.key_level, secret)
                .await
            {
                Ok(()) => {
                    reply.accept();
                    return Ok(());
                }
                Err(e) if e.is_user_error() => {
                    warn!("Key entry rejected for @{}: {}", request.account, e.category());
                    reply.reject(e);
                }
                Err(e) => return Err(reply.fail(e)),
            }
        }
    }

    async fn confirm(&self, ctx: &SignContext, request: &ConfirmationRequest) -> Result<()> {
        let mut parked = self
            .prompts
            .park(request.prompt(ctx.request_id, PromptKind::Confirm));
        loop {
            let Submission { answer, reply } = parked.next(&ctx.cancel).await?;
            let PromptAnswer::Confirm { remember } = answer else {
                reply.reject(Error::Other("Expected a confirmation".to_string()));
                continue;
            };
            if remember {
                if let Err(e) = self
                    .vault
                    .set_suppressed(&request.account, &request.op_type, true)
                {
                    return Err(reply.fail(e));
                }
                info!("Suppressed confirmation for @{} {}", request.account, request.op_type);
            }
            reply.accept();
            return Ok(());
        }
    }
}

#[async_trait]
impl SignerBackend for LocalSigner {
    fn kind(&self) -> SignerKind {
        SignerKind::Local
    }

    async fn sign(
        &self,
        ctx: &SignContext,
        account: &str,
        operations: &[Operation],
        level: KeyLevel,
    ) -> Result<SignOutcome> {
        let request = ConfirmationRequest::for_operations(account, level, operations)?;
        let secret = self.authorize(ctx, &request).await?;

        let unsigned = self.broadcaster.prepare(&request.account, operations).await?;
        let signature = self.vault.scheme().sign_digest(&secret, &unsigned.digest)?;
        drop(secret);
        ctx.check_cancelled()?;

        let result = self
            .broadcaster
            .broadcast(SignedTransaction {
                transaction: unsigned.transaction,
                signatures: vec![signature],
            })
            .await?;
        info!("Broadcast {} for @{} via {}", result.tx_id, request.account, result.api);
        Ok(SignOutcome::Broadcast(result))
    }

    async fn sign_only(
        &self,
        ctx: &SignContext,
        account: &str,
        challenge: &str,
        level: KeyLevel,
    ) -> Result<Signature> {
        let request = ConfirmationRequest::for_challenge(account, level, challenge)?;
        let secret = self.authorize(ctx, &request).await?;
        self.vault.scheme().sign_message(&secret, challenge.as_bytes())
    }
}
