//! Relay signer
//!
//! Talks to a companion signing app through a relay server over one shared
//! connection. Pairing (`auth_req`) shows a URI for QR display and waits for
//! the app to approve; later requests reuse the session token until it
//! expires.
//!
//! `sign` does not wait for the transaction. It resolves with
//! [`SignOutcome::Requested`] as soon as the server has forwarded the request;
//! the app's verdict arrives later as a [`RelayEvent`] with the same uuid.

pub mod protocol;
pub mod transport;

use crate::backend::{RelayAck, SignContext, SignOutcome, SignerBackend, SignerKind};
use crate::prompt::PromptBroker;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ledgerkey_core::{Error, KeyLevel, Operation, Result, Signature};
use ledgerkey_storage::normalize_account;
use parking_lot::Mutex;
use protocol::{
    auth_uri, decrypt_payload, encrypt_payload, expiry, generate_auth_key, AppDescriptor, AuthAckPayload,
    AuthPayload, AuthUri, ChallengeAckPayload, ChallengePayload, RelayMessage, SignPayload,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use transport::{RelayConnection, RelayConnector};
use uuid::Uuid;
use zeroize::Zeroizing;

const EVENT_CAPACITY: usize = 64;

/// Relay signer configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Relay server URL
    pub url: String,
    /// Application shown on the companion app
    pub app: AppDescriptor,
    /// How long to wait for the server to acknowledge a request
    pub ack_timeout_ms: u64,
    /// Connection timeout
    pub connect_timeout_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            url: "wss://hive-auth.arcange.eu".to_string(),
            app: AppDescriptor::default(),
            ack_timeout_ms: 10_000,
            connect_timeout_ms: 10_000,
        }
    }
}

impl RelayConfig {
    fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

/// Authenticated relay session
pub struct RelaySession {
    /// Account the session signs for
    pub account: String,
    /// Session token
    pub token: String,
    /// Token expiry
    pub expires_at: DateTime<Utc>,
    auth_key: Zeroizing<String>,
}

impl RelaySession {
    fn is_valid_for(&self, account: &str) -> bool {
        self.account == account && self.expires_at > Utc::now()
    }
}

/// Asynchronous relay notifications
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RelayEvent {
    /// Pairing URI ready for display
    AuthRequested {
        /// Pairing request id
        uuid: Uuid,
        /// URI to render as a QR code
        uri: String,
        /// When the pairing request lapses
        expires_at: DateTime<Utc>,
    },
    /// Pairing approved
    Authenticated {
        /// Account paired
        account: String,
        /// Session expiry
        expires_at: DateTime<Utc>,
    },
    /// The app signed a request
    SignAccepted {
        /// Sign request id
        uuid: Uuid,
        /// Result reported by the app
        data: Option<String>,
    },
    /// The app declined a request
    SignRejected {
        /// Sign request id
        uuid: Uuid,
    },
    /// Signing failed on the app side
    SignFailed {
        /// Sign request id
        uuid: Uuid,
        /// Reason
        error: String,
    },
    /// The connection closed
    Disconnected,
    /// The session was dropped locally
    LoggedOut,
}

/// Connection state shared with the reader tasks.
///
/// Every connection gets a fresh id; waiters remember the id of the
/// connection their request went out on.
struct Shared {
    outgoing: Mutex<Option<(u64, mpsc::Sender<String>)>>,
    next_connection: AtomicU64,
    waiters: Mutex<HashMap<Uuid, (u64, mpsc::UnboundedSender<RelayMessage>)>>,
    events: broadcast::Sender<RelayEvent>,
}

impl Shared {
    fn dispatch(&self, message: RelayMessage) {
        match &message {
            RelayMessage::SignAck { uuid, data } => {
                let _ = self.events.send(RelayEvent::SignAccepted {
                    uuid: *uuid,
                    data: data.clone(),
                });
            }
            RelayMessage::SignNack { uuid } => {
                let _ = self.events.send(RelayEvent::SignRejected { uuid: *uuid });
            }
            RelayMessage::SignErr { uuid, error } => {
                let _ = self.events.send(RelayEvent::SignFailed {
                    uuid: *uuid,
                    error: error.clone(),
                });
            }
            _ => {}
        }

        let Some(uuid) = message.uuid() else {
            debug!("Ignoring relay frame without a request id");
            return;
        };
        let waiter = self.waiters.lock().get(&uuid).map(|(_, tx)| tx.clone());
        match waiter {
            Some(waiter) => {
                let _ = waiter.send(message);
            }
            None => debug!("No waiter for relay reply {}", uuid),
        }
    }

    fn disconnected(&self, connection: u64) {
        let current = {
            let mut outgoing = self.outgoing.lock();
            let current = outgoing.as_ref().is_some_and(|(id, _)| *id == connection);
            if current {
                *outgoing = None;
            }
            current
        };
        // Dropping the senders fails the requests sent on this connection
        self.waiters.lock().retain(|_, (id, _)| *id != connection);
        if current {
            let _ = self.events.send(RelayEvent::Disconnected);
        }
    }
}

/// Removes a waiter when the request is done
struct Waiter {
    shared: Arc<Shared>,
    uuid: Uuid,
    replies: mpsc::UnboundedReceiver<RelayMessage>,
}

impl Waiter {
    /// Next reply within `wait`, unless the request is cancelled first
    async fn next(&mut self, ctx: &SignContext, wait: Duration) -> Result<RelayMessage> {
        tokio::select! {
            reply = self.replies.recv() => {
                reply.ok_or_else(|| Error::Relay("Relay connection closed".to_string()))
            }
            _ = tokio::time::sleep(wait) => {
                Err(Error::Relay(format!("No relay reply within {:?}", wait)))
            }
            _ = ctx.cancel.cancelled() => Err(Error::UserCancelled),
        }
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        self.shared.waiters.lock().remove(&self.uuid);
    }
}

/// Signer reached through a relay server
pub struct RelaySigner {
    config: RelayConfig,
    connector: Arc<dyn RelayConnector>,
    prompts: Arc<PromptBroker>,
    shared: Arc<Shared>,
    session: Mutex<Option<Arc<RelaySession>>>,
    connecting: tokio::sync::Mutex<()>,
}

impl RelaySigner {
    /// New relay signer
    pub fn new(config: RelayConfig, connector: Arc<dyn RelayConnector>, prompts: Arc<PromptBroker>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            connector,
            prompts,
            shared: Arc::new(Shared {
                outgoing: Mutex::new(None),
                next_connection: AtomicU64::new(0),
                waiters: Mutex::new(HashMap::new()),
                events,
            }),
            session: Mutex::new(None),
            connecting: tokio::sync::Mutex::new(()),
        }
    }

    /// Relay notifications
    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.shared.events.subscribe()
    }

    /// Account and expiry of the current session
    pub fn session_info(&self) -> Option<(String, DateTime<Utc>)> {
        self.session
            .lock()
            .as_ref()
            .map(|s| (s.account.clone(), s.expires_at))
    }

    /// Drop the session; the next request pairs again
    pub fn logout(&self) {
        if self.session.lock().take().is_some() {
            info!("Relay session dropped");
            let _ = self.shared.events.send(RelayEvent::LoggedOut);
        }
    }

    async fn ensure_connected(&self) -> Result<(u64, mpsc::Sender<String>)> {
        let _guard = self.connecting.lock().await;
        let existing = self
            .shared
            .outgoing
            .lock()
            .clone()
            .filter(|(_, s)| !s.is_closed());
        if let Some(connection) = existing {
            return Ok(connection);
        }

        let RelayConnection { outgoing, mut incoming } = self.connector.connect().await?;
        let id = self.shared.next_connection.fetch_add(1, Ordering::Relaxed);
        *self.shared.outgoing.lock() = Some((id, outgoing.clone()));
        debug!("Relay connection {} open", id);

        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            while let Some(frame) = incoming.recv().await {
                match RelayMessage::from_frame(&frame) {
                    Ok(message) => shared.dispatch(message),
                    Err(e) => warn!("{}", e),
                }
            }
            info!("Relay connection {} closed", id);
            shared.disconnected(id);
        });

        Ok((id, outgoing))
    }

    /// Register a waiter for `uuid`, then send `message`
    async fn request(&self, uuid: Uuid, message: RelayMessage) -> Result<Waiter> {
        let (connection, sender) = self.ensure_connected().await?;
        let (tx, replies) = mpsc::unbounded_channel();
        self.shared.waiters.lock().insert(uuid, (connection, tx));
        let waiter = Waiter {
            shared: Arc::clone(&self.shared),
            uuid,
            replies,
        };
        sender
            .send(message.to_frame()?)
            .await
            .map_err(|_| Error::Relay("Relay connection closed".to_string()))?;
        Ok(waiter)
    }

    /// Existing valid session for `account`, or a new pairing
    async fn session_for(&self, ctx: &SignContext, account: &str) -> Result<Arc<RelaySession>> {
        let existing = self
            .session
            .lock()
            .as_ref()
            .filter(|s| s.is_valid_for(account))
            .cloned();
        if let Some(session) = existing {
            return Ok(session);
        }
        let session = Arc::new(self.authenticate(ctx, account).await?);
        *self.session.lock() = Some(Arc::clone(&session));
        Ok(session)
    }

    async fn authenticate(&self, ctx: &SignContext, account: &str) -> Result<RelaySession> {
        let auth_key = generate_auth_key();
        let uuid = Uuid::new_v4();
        let data = encrypt_payload(
            &auth_key,
            &AuthPayload {
                app: self.config.app.clone(),
            },
        )?;

        info!("Pairing @{} with relay signer", account);
        let mut waiter = self
            .request(
                uuid,
                RelayMessage::AuthReq {
                    account: account.to_string(),
                    uuid,
                    data,
                },
            )
            .await?;

        let expires_at = match waiter.next(ctx, self.config.ack_timeout()).await? {
            RelayMessage::AuthWait { expire, .. } => expiry(expire)?,
            other => return Err(reply_error(other)),
        };

        let uri = auth_uri(&AuthUri {
            account: account.to_string(),
            uuid,
            key: auth_key.to_string(),
            host: self.config.url.clone(),
        })?;
        self.prompts.display(ctx.request_id, uri.clone());
        let _ = self.shared.events.send(RelayEvent::AuthRequested {
            uuid,
            uri,
            expires_at,
        });

        match waiter.next(ctx, until(expires_at)).await? {
            RelayMessage::AuthAck { data, .. } => {
                let ack: AuthAckPayload = decrypt_payload(&auth_key, &data)?;
                let session_expiry = expiry(ack.expire)?;
                info!("Relay session for @{} valid until {}", account, session_expiry);
                let _ = self.shared.events.send(RelayEvent::Authenticated {
                    account: account.to_string(),
                    expires_at: session_expiry,
                });
                Ok(RelaySession {
                    account: account.to_string(),
                    token: ack.token,
                    expires_at: session_expiry,
                    auth_key,
                })
            }
            other => Err(reply_error(other)),
        }
    }

    async fn try_sign(
        &self,
        ctx: &SignContext,
        account: &str,
        operations: &[Operation],
        level: KeyLevel,
    ) -> Result<SignOutcome> {
        let session = self.session_for(ctx, account).await?;
        let uuid = Uuid::new_v4();
        let data = encrypt_payload(
            &session.auth_key,
            &SignPayload {
                key_type: level.authority().as_str().to_string(),
                ops: operations.to_vec(),
                broadcast: true,
            },
        )?;

        let mut waiter = self
            .request(
                uuid,
                RelayMessage::SignReq {
                    account: account.to_string(),
                    token: session.token.clone(),
                    uuid,
                    data,
                },
            )
            .await?;

        match waiter.next(ctx, self.config.ack_timeout()).await? {
            RelayMessage::SignWait { expire, .. } => {
                let expires_at = expiry(expire)?;
                debug!("Relay sign request {} forwarded", uuid);
                Ok(SignOutcome::Requested(RelayAck { uuid, expires_at }))
            }
            // The app answered before the server's wait notice
            RelayMessage::SignAck { .. } => Ok(SignOutcome::Requested(RelayAck {
                uuid,
                expires_at: Utc::now(),
            })),
            other => Err(reply_error(other)),
        }
    }

    async fn try_sign_only(
        &self,
        ctx: &SignContext,
        account: &str,
        challenge: &str,
        level: KeyLevel,
    ) -> Result<Signature> {
        let session = self.session_for(ctx, account).await?;
        let uuid = Uuid::new_v4();
        let data = encrypt_payload(
            &session.auth_key,
            &ChallengePayload {
                key_type: level.authority().as_str().to_string(),
                challenge: challenge.to_string(),
            },
        )?;

        let mut waiter = self
            .request(
                uuid,
                RelayMessage::ChallengeReq {
                    account: account.to_string(),
                    token: session.token.clone(),
                    uuid,
                    data,
                },
            )
            .await?;

        let mut wait = self.config.ack_timeout();
        loop {
            match waiter.next(ctx, wait).await? {
                RelayMessage::ChallengeWait { expire, .. } => wait = until(expiry(expire)?),
                RelayMessage::ChallengeAck { data, .. } => {
                    let ack: ChallengeAckPayload = decrypt_payload(&session.auth_key, &data)?;
                    return Ok(Signature(ack.signature));
                }
                other => return Err(reply_error(other)),
            }
        }
    }

    /// Run `attempt`, pairing again once when the server reports the session expired
    async fn with_session_retry<T, F, Fut>(&self, ctx: &SignContext, mut attempt: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        match attempt().await {
            Err(Error::SessionExpired) if !ctx.cancel.is_cancelled() => {
                warn!("Relay session expired, pairing again");
                self.logout();
                attempt().await
            }
            other => other,
        }
    }
}

fn until(deadline: DateTime<Utc>) -> Duration {
    (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}

fn reply_error(message: RelayMessage) -> Error {
    match message {
        RelayMessage::AuthNack { .. } | RelayMessage::SignNack { .. } | RelayMessage::ChallengeNack { .. } => {
            Error::UserCancelled
        }
        RelayMessage::AuthErr { error, .. }
        | RelayMessage::SignErr { error, .. }
        | RelayMessage::ChallengeErr { error, .. } => Error::Relay(error),
        RelayMessage::Expired { .. } => Error::SessionExpired,
        other => Error::Relay(format!("Unexpected relay reply: {:?}", other)),
    }
}

#[async_trait]
impl SignerBackend for RelaySigner {
    fn kind(&self) -> SignerKind {
        SignerKind::Relay
    }

    async fn sign(
        &self,
        ctx: &SignContext,
        account: &str,
        operations: &[Operation],
        level: KeyLevel,
    ) -> Result<SignOutcome> {
        let account = normalize_account(account)?;
        if operations.is_empty() {
            return Err(Error::Other("Nothing to sign: no operations".to_string()));
        }
        let account = account.as_str();
        self.with_session_retry(ctx, || self.try_sign(ctx, account, operations, level))
            .await
    }

    async fn sign_only(
        &self,
        ctx: &SignContext,
        account: &str,
        challenge: &str,
        level: KeyLevel,
    ) -> Result<Signature> {
        let account = normalize_account(account)?;
        let account = account.as_str();
        self.with_session_retry(ctx, || self.try_sign_only(ctx, account, challenge, level))
            .await
    }
}
