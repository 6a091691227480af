//! Operation queue
//!
//! The single entry point callers use to sign. Requests run one at a time in
//! arrival order through the active backend; while one is parked on a prompt,
//! later requests wait their turn. Prompts are answered through the completion
//! handlers (`confirm`, `submit_pin`, `submit_key`, `cancel`).
//!
//! Broadcast outcomes are handed to the tracker, and the account and backend
//! last used are recorded in preferences.

use crate::backend::{SignContext, SignOutcome, SignerBackend, SignerKind};
use crate::prompt::{PromptAnswer, PromptBroker};
use crate::tracker::BroadcastTracker;
use chrono::{DateTime, Utc};
use ledgerkey_core::{Error, KeyLevel, Operation, Result, Secret, Signature};
use ledgerkey_storage::PreferenceStore;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

/// Finished requests kept for display
pub const MAX_RECENT_REQUESTS: usize = 20;

/// Request flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    /// Sign and broadcast operations
    Sign,
    /// Detached challenge signature
    SignOnly,
}

/// Request progress
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum RequestStatus {
    /// Waiting for an earlier request
    Queued,
    /// Running on a backend
    Running,
    /// Finished successfully
    Succeeded,
    /// Finished with an error
    Failed(String),
    /// Caller went away before it finished
    Abandoned,
}

/// Request log entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestEntry {
    /// Request id, shared with its prompts
    pub id: Uuid,
    /// Flavour
    pub kind: RequestKind,
    /// Account
    pub account: String,
    /// Backend that ran it
    pub backend: Option<SignerKind>,
    /// Progress
    pub status: RequestStatus,
    /// Arrival time
    pub created_at: DateTime<Utc>,
}

#[derive(Default)]
struct RequestLog {
    outstanding: Vec<(RequestEntry, SignContext)>,
    recent: VecDeque<RequestEntry>,
}

impl RequestLog {
    fn set_running(&mut self, id: Uuid, backend: SignerKind) {
        if let Some((entry, _)) = self.outstanding.iter_mut().find(|(e, _)| e.id == id) {
            entry.status = RequestStatus::Running;
            entry.backend = Some(backend);
        }
    }

    fn finish(&mut self, id: Uuid, status: RequestStatus) {
        if let Some(index) = self.outstanding.iter().position(|(e, _)| e.id == id) {
            let (mut entry, _) = self.outstanding.remove(index);
            entry.status = status;
            self.recent.push_front(entry);
            self.recent.truncate(MAX_RECENT_REQUESTS);
        }
    }
}

/// Moves a request out of `outstanding` when the caller's future is dropped
struct RequestGuard<'a> {
    log: &'a Mutex<RequestLog>,
    ctx: SignContext,
    finished: bool,
}

impl RequestGuard<'_> {
    fn finish(mut self, status: RequestStatus) {
        self.finished = true;
        self.log.lock().finish(self.ctx.request_id, status);
    }
}

impl Drop for RequestGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            debug!("Request {} abandoned", self.ctx.request_id);
            self.ctx.cancel.cancel();
            self.log.lock().finish(self.ctx.request_id, RequestStatus::Abandoned);
        }
    }
}

/// Serialized signing front end over the registered backends
pub struct OperationQueue {
    backends: RwLock<HashMap<SignerKind, Arc<dyn SignerBackend>>>,
    active: RwLock<Option<SignerKind>>,
    prompts: Arc<PromptBroker>,
    tracker: Option<Arc<BroadcastTracker>>,
    preferences: Option<Arc<PreferenceStore>>,
    turn: Semaphore,
    log: Mutex<RequestLog>,
}

impl OperationQueue {
    /// Queue answering prompts through `prompts`
    pub fn new(prompts: Arc<PromptBroker>) -> Self {
        Self {
            backends: RwLock::new(HashMap::new()),
            active: RwLock::new(None),
            prompts,
            tracker: None,
            preferences: None,
            turn: Semaphore::new(1),
            log: Mutex::new(RequestLog::default()),
        }
    }

    /// Register a backend. The first one registered becomes active unless
    /// preferences name another registered backend.
    pub fn with_backend(self, backend: Arc<dyn SignerBackend>) -> Self {
        let kind = backend.kind();
        self.backends.write().insert(kind, backend);
        {
            let mut active = self.active.write();
            if active.is_none() {
                *active = Some(kind);
            }
        }
        self.restore_preferred_backend();
        self
    }

    /// Hand broadcast outcomes to `tracker`
    pub fn with_tracker(mut self, tracker: Arc<BroadcastTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    /// Record account and backend choices in `preferences`. The backend
    /// recorded last becomes active once it is registered.
    pub fn with_preferences(mut self, preferences: Arc<PreferenceStore>) -> Self {
        self.preferences = Some(preferences);
        self.restore_preferred_backend();
        self
    }

    fn restore_preferred_backend(&self) {
        let preferred = self
            .preferences
            .as_ref()
            .and_then(|p| p.get().last_backend)
            .and_then(|name| name.parse::<SignerKind>().ok());
        if let Some(kind) = preferred {
            if self.backends.read().contains_key(&kind) {
                *self.active.write() = Some(kind);
            }
        }
    }

    /// Prompt broker shared with the backends
    pub fn prompts(&self) -> &Arc<PromptBroker> {
        &self.prompts
    }

    /// Tracker, when one is attached
    pub fn tracker(&self) -> Option<&Arc<BroadcastTracker>> {
        self.tracker.as_ref()
    }

    /// Backend requests currently run on
    pub fn active_backend(&self) -> Option<SignerKind> {
        *self.active.read()
    }

    /// Switch the active backend
    pub fn set_backend(&self, kind: SignerKind) -> Result<()> {
        if !self.backends.read().contains_key(&kind) {
            return Err(Error::SignerUnavailable(format!("{} signer is not configured", kind)));
        }
        *self.active.write() = Some(kind);
        info!("Active signer set to {}", kind);
        if let Some(preferences) = &self.preferences {
            preferences.record_backend(kind.as_str())?;
        }
        Ok(())
    }

    /// Sign and broadcast `operations` as `account`
    pub async fn sign(&self, account: &str, operations: &[Operation], level: KeyLevel) -> Result<SignOutcome> {
        self.sign_and_refresh(account, operations, level, Vec::new()).await
    }

    /// Like [`sign`](Self::sign); refresh handlers named in `refresh_ops` run
    /// once the broadcast is confirmed
    pub async fn sign_and_refresh(
        &self,
        account: &str,
        operations: &[Operation],
        level: KeyLevel,
        refresh_ops: Vec<String>,
    ) -> Result<SignOutcome> {
        let outcome = self
            .run(RequestKind::Sign, account, |backend, ctx| async move {
                backend.sign(&ctx, account, operations, level).await
            })
            .await?;

        if let (SignOutcome::Broadcast(result), Some(tracker)) = (&outcome, &self.tracker) {
            // Already broadcast; tracking errors are only logged
            if let Err(e) = tracker.track(result, refresh_ops) {
                warn!("Failed to track broadcast {}: {}", result.tx_id, e);
            }
        }
        Ok(outcome)
    }

    /// Detached signature over `challenge`
    pub async fn sign_only(&self, account: &str, challenge: &str, level: KeyLevel) -> Result<Signature> {
        self.run(RequestKind::SignOnly, account, |backend, ctx| async move {
            backend.sign_only(&ctx, account, challenge, level).await
        })
        .await
    }

    async fn run<T, F, Fut>(&self, kind: RequestKind, account: &str, call: F) -> Result<T>
    where
        F: FnOnce(Arc<dyn SignerBackend>, SignContext) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let ctx = SignContext::new();
        let id = ctx.request_id;
        self.log.lock().outstanding.push((
            RequestEntry {
                id,
                kind,
                account: account.to_string(),
                backend: None,
                status: RequestStatus::Queued,
                created_at: Utc::now(),
            },
            ctx.clone(),
        ));
        let guard = RequestGuard {
            log: &self.log,
            ctx: ctx.clone(),
            finished: false,
        };

        let result = self.run_in_turn(&ctx, account, call).await;

        let status = match &result {
            Ok(_) => RequestStatus::Succeeded,
            Err(e) => {
                debug!("Request {} failed ({}): {}", id, e.category(), e);
                RequestStatus::Failed(e.to_string())
            }
        };
        guard.finish(status);
        result
    }

    async fn run_in_turn<T, F, Fut>(&self, ctx: &SignContext, account: &str, call: F) -> Result<T>
    where
        F: FnOnce(Arc<dyn SignerBackend>, SignContext) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let _turn = ctx
            .cancel
            .run(async {
                self.turn
                    .acquire()
                    .await
                    .map_err(|_| Error::Other("Operation queue closed".to_string()))
            })
            .await?;

        let (kind, backend) = {
            let active = *self.active.read();
            let kind = active.ok_or_else(|| Error::SignerUnavailable("No signer configured".to_string()))?;
            let backend = self
                .backends
                .read()
                .get(&kind)
                .cloned()
                .ok_or_else(|| Error::SignerUnavailable(format!("{} signer is not configured", kind)))?;
            (kind, backend)
        };
        self.log.lock().set_running(ctx.request_id, kind);
        debug!("Request {} running on {} signer", ctx.request_id, kind);

        let result = call(backend, ctx.clone()).await;

        if result.is_ok() {
            if let Some(preferences) = &self.preferences {
                if let Err(e) = preferences.record_account(account) {
                    warn!("Failed to record last account: {}", e);
                }
            }
        }
        result
    }

    /// Answer a confirmation prompt
    pub async fn confirm(&self, request_id: Uuid, remember: bool) -> Result<()> {
        self.prompts
            .submit(request_id, PromptAnswer::Confirm { remember })
            .await
    }

    /// Answer a PIN prompt; a wrong PIN returns an error and the prompt stays
    pub async fn submit_pin(&self, request_id: Uuid, pin: &str) -> Result<()> {
        self.prompts
            .submit(request_id, PromptAnswer::Pin(Zeroizing::new(pin.to_string())))
            .await
    }

    /// Answer a key prompt; a rejected key returns an error and the prompt stays
    pub async fn submit_key(&self, request_id: Uuid, secret: Secret) -> Result<()> {
        self.prompts.submit(request_id, PromptAnswer::Key(secret)).await
    }

    /// Cancel a request: close its prompt if one is parked, otherwise abandon it
    pub async fn cancel(&self, request_id: Uuid) -> Result<()> {
        if self.prompts.get(&request_id).is_some() {
            return self.prompts.submit(request_id, PromptAnswer::Cancel).await;
        }
        let ctx = self
            .log
            .lock()
            .outstanding
            .iter()
            .find(|(e, _)| e.id == request_id)
            .map(|(_, ctx)| ctx.clone());
        match ctx {
            Some(ctx) => {
                ctx.cancel.cancel();
                Ok(())
            }
            None => Err(Error::Other(format!("No outstanding request {}", request_id))),
        }
    }

    /// Outstanding requests followed by recent ones, newest first
    pub fn requests(&self) -> Vec<RequestEntry> {
        let log = self.log.lock();
        log.outstanding
            .iter()
            .rev()
            .map(|(e, _)| e.clone())
            .chain(log.recent.iter().cloned())
            .collect()
    }

    /// Forget finished requests
    pub fn clear_recent(&self) {
        self.log.lock().recent.clear();
    }

    /// Close every parked prompt; their callers fail with the cancel error
    pub fn close_prompts(&self) {
        self.prompts.close_all();
    }
}
