//! Parked prompts
//!
//! A signing flow that needs the user (confirmation, PIN, key entry) parks a
//! [`Prompt`] with the broker and waits on the returned [`ParkedPrompt`]. The
//! UI side lists pending prompts or subscribes to [`PromptEvent`]s, and answers
//! through [`PromptBroker::submit`]. Each answer carries a reply channel, so
//! a wrong PIN is reported to whoever typed it while the prompt stays parked.
//!
//! Dropping a `ParkedPrompt` removes the prompt. Closing the broker drops every
//! answer channel, which rejects the waiting flows with the kind's cancel error.

use crate::cancel::CancelToken;
use ledgerkey_core::{Error, KeyLevel, Result, Secret};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::debug;
use uuid::Uuid;
use zeroize::Zeroizing;

const EVENT_CAPACITY: usize = 64;
const ANSWER_CAPACITY: usize = 4;

/// What the user is asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptKind {
    /// Approve the operations
    Confirm,
    /// Enter the PIN to unlock
    Pin,
    /// Choose a PIN for a new vault
    CreatePin,
    /// Enter a private key
    Key,
}

impl PromptKind {
    /// Error the waiting caller sees when this prompt is closed
    pub fn cancel_error(self) -> Error {
        match self {
            PromptKind::Confirm => Error::UserCancelled,
            PromptKind::Pin | PromptKind::CreatePin => Error::PinEntryCancelled,
            PromptKind::Key => Error::KeyEntryCancelled,
        }
    }

    fn accepts(self, answer: &PromptAnswer) -> bool {
        matches!(
            (self, answer),
            (_, PromptAnswer::Cancel)
                | (PromptKind::Confirm, PromptAnswer::Confirm { .. })
                | (PromptKind::Pin | PromptKind::CreatePin, PromptAnswer::Pin(_))
                | (PromptKind::Key, PromptAnswer::Key(_))
        )
    }
}

/// A question waiting for the user
#[derive(Debug, Clone, Serialize)]
pub struct Prompt {
    /// Id of the signing request that raised it
    pub request_id: Uuid,
    /// What is asked
    pub kind: PromptKind,
    /// Account the request signs for
    pub account: String,
    /// Requested authority
    pub key_level: KeyLevel,
    /// One line per operation
    pub summaries: Vec<String>,
    /// Normalized type of the first operation
    pub op_type: Option<String>,
}

/// The user's answer
pub enum PromptAnswer {
    /// Approve; `remember` suppresses future prompts for this account and type
    Confirm {
        /// Persist a suppression flag
        remember: bool,
    },
    /// PIN for unlock or creation
    Pin(Zeroizing<String>),
    /// Private key for the requested level
    Key(Secret),
    /// Close the prompt
    Cancel,
}

impl fmt::Debug for PromptAnswer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PromptAnswer::Confirm { remember } => f.debug_struct("Confirm").field("remember", remember).finish(),
            PromptAnswer::Pin(_) => f.write_str("Pin([REDACTED])"),
            PromptAnswer::Key(secret) => f.debug_tuple("Key").field(secret).finish(),
            PromptAnswer::Cancel => f.write_str("Cancel"),
        }
    }
}

/// Notifications for whoever renders prompts
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PromptEvent {
    /// A prompt was parked
    Opened(Prompt),
    /// Something to show the user, such as a pairing URI for QR display
    Display {
        /// Request it belongs to
        request_id: Uuid,
        /// Content to render
        uri: String,
    },
    /// The prompt is gone (answered, cancelled or abandoned)
    Closed {
        /// Request it belonged to
        request_id: Uuid,
    },
}

/// Reply channel for one submitted answer
#[derive(Debug)]
pub struct Reply(oneshot::Sender<Result<()>>);

impl Reply {
    /// Tell the submitter the answer was taken
    pub fn accept(self) {
        let _ = self.0.send(Ok(()));
    }

    /// Tell the submitter the answer was refused; the prompt stays parked
    pub fn reject(self, error: Error) {
        let _ = self.0.send(Err(error));
    }

    /// Report `error` to the submitter and hand it back to the flow
    pub fn fail(self, error: Error) -> Error {
        let _ = self.0.send(Err(Error::Other(error.to_string())));
        error
    }
}

/// An answer together with its reply channel
#[derive(Debug)]
pub struct Submission {
    /// What the user entered
    pub answer: PromptAnswer,
    /// Where to report acceptance
    pub reply: Reply,
}

struct Entry {
    prompt: Prompt,
    answers: mpsc::Sender<Submission>,
}

/// Registry of parked prompts keyed by request id
pub struct PromptBroker {
    parked: Mutex<HashMap<Uuid, Entry>>,
    events: broadcast::Sender<PromptEvent>,
}

impl PromptBroker {
    /// Empty broker
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            parked: Mutex::new(HashMap::new()),
            events,
        })
    }

    /// Park `prompt` until it is answered or the handle is dropped.
    ///
    /// A request has at most one parked prompt; parking again replaces it.
    pub fn park(self: &Arc<Self>, prompt: Prompt) -> ParkedPrompt {
        let (tx, rx) = mpsc::channel(ANSWER_CAPACITY);
        let request_id = prompt.request_id;
        let kind = prompt.kind;
        debug!("Parking {:?} prompt for request {}", kind, request_id);
        self.parked.lock().insert(
            request_id,
            Entry {
                prompt: prompt.clone(),
                answers: tx,
            },
        );
        let _ = self.events.send(PromptEvent::Opened(prompt));
        ParkedPrompt {
            broker: Arc::clone(self),
            request_id,
            kind,
            answers: rx,
        }
    }

    /// Answer the prompt parked for `request_id` and wait for the flow's verdict
    pub async fn submit(&self, request_id: Uuid, answer: PromptAnswer) -> Result<()> {
        let sender = {
            let parked = self.parked.lock();
            let entry = parked
                .get(&request_id)
                .ok_or_else(|| Error::Other(format!("No prompt is waiting for request {}", request_id)))?;
            if !entry.prompt.kind.accepts(&answer) {
                return Err(Error::Other(format!(
                    "Answer does not fit a {:?} prompt",
                    entry.prompt.kind
                )));
            }
            entry.answers.clone()
        };

        let (tx, rx) = oneshot::channel();
        sender
            .send(Submission {
                answer,
                reply: Reply(tx),
            })
            .await
            .map_err(|_| Error::Other("Prompt closed".to_string()))?;
        rx.await
            .map_err(|_| Error::Other("Prompt closed before answering".to_string()))?
    }

    /// Show `uri` to the user on behalf of `request_id`
    pub fn display(&self, request_id: Uuid, uri: String) {
        let _ = self.events.send(PromptEvent::Display { request_id, uri });
    }

    /// Prompts currently waiting
    pub fn pending(&self) -> Vec<Prompt> {
        self.parked.lock().values().map(|e| e.prompt.clone()).collect()
    }

    /// Prompt parked for one request
    pub fn get(&self, request_id: &Uuid) -> Option<Prompt> {
        self.parked.lock().get(request_id).map(|e| e.prompt.clone())
    }

    /// Prompt notifications
    pub fn subscribe(&self) -> broadcast::Receiver<PromptEvent> {
        self.events.subscribe()
    }

    /// Drop every parked prompt; waiting flows fail with their cancel error
    pub fn close_all(&self) {
        let closed: Vec<Uuid> = self.parked.lock().drain().map(|(id, _)| id).collect();
        for request_id in closed {
            let _ = self.events.send(PromptEvent::Closed { request_id });
        }
    }

    fn remove(&self, request_id: &Uuid) {
        if self.parked.lock().remove(request_id).is_some() {
            let _ = self.events.send(PromptEvent::Closed {
                request_id: *request_id,
            });
        }
    }
}

/// Flow-side handle of a parked prompt
pub struct ParkedPrompt {
    broker: Arc<PromptBroker>,
    request_id: Uuid,
    kind: PromptKind,
    answers: mpsc::Receiver<Submission>,
}

impl ParkedPrompt {
    /// Next answer other than a cancel.
    ///
    /// A `Cancel` answer or a closed broker ends the wait with the kind's
    /// cancel error; cancelling the request token ends it with `UserCancelled`.
    pub async fn next(&mut self, cancel: &CancelToken) -> Result<Submission> {
        tokio::select! {
            submission = self.answers.recv() => match submission {
                Some(Submission { answer: PromptAnswer::Cancel, reply }) => {
                    reply.accept();
                    Err(self.kind.cancel_error())
                }
                Some(submission) => Ok(submission),
                None => Err(self.kind.cancel_error()),
            },
            _ = cancel.cancelled() => Err(Error::UserCancelled),
        }
    }

    /// Request this prompt belongs to
    pub fn request_id(&self) -> Uuid {
        self.request_id
    }
}

impl Drop for ParkedPrompt {
    fn drop(&mut self) {
        self.broker.remove(&self.request_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prompt(kind: PromptKind) -> Prompt {
        Prompt {
            request_id: Uuid::new_v4(),
            kind,
            account: "alice".to_string(),
            key_level: KeyLevel::Posting,
            summaries: vec!["vote".to_string()],
            op_type: Some("vote".to_string()),
        }
    }

    #[tokio::test]
    async fn test_submit_reaches_parked_flow() {
        let broker = PromptBroker::new();
        let p = prompt(PromptKind::Confirm);
        let id = p.request_id;
        let mut parked = broker.park(p);
        assert_eq!(broker.pending().len(), 1);

        let submitter = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.submit(id, PromptAnswer::Confirm { remember: true }).await })
        };

        let submission = parked.next(&CancelToken::new()).await.unwrap();
        assert!(matches!(submission.answer, PromptAnswer::Confirm { remember: true }));
        submission.reply.accept();
        submitter.await.unwrap().unwrap();

        drop(parked);
        assert!(broker.pending().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_answer_keeps_prompt() {
        let broker = PromptBroker::new();
        let p = prompt(PromptKind::Pin);
        let id = p.request_id;
        let mut parked = broker.park(p);

        let submitter = {
            let broker = broker.clone();
            tokio::spawn(async move {
                broker
                    .submit(id, PromptAnswer::Pin(Zeroizing::new("0000".to_string())))
                    .await
            })
        };
        let submission = parked.next(&CancelToken::new()).await.unwrap();
        submission.reply.reject(Error::InvalidPasswordOrCorruptData);

        let result = submitter.await.unwrap();
        assert!(matches!(result, Err(Error::InvalidPasswordOrCorruptData)));
        assert!(broker.get(&id).is_some());
    }

    #[tokio::test]
    async fn test_mismatched_answer_refused() {
        let broker = PromptBroker::new();
        let p = prompt(PromptKind::Pin);
        let id = p.request_id;
        let _parked = broker.park(p);

        let result = broker.submit(id, PromptAnswer::Confirm { remember: false }).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_cancel_uses_kind_error() {
        let broker = PromptBroker::new();
        let p = prompt(PromptKind::Key);
        let id = p.request_id;
        let mut parked = broker.park(p);

        let submitter = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.submit(id, PromptAnswer::Cancel).await })
        };
        let result = parked.next(&CancelToken::new()).await;
        assert!(matches!(result, Err(Error::KeyEntryCancelled)));
        submitter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_close_all_rejects_waiters() {
        let broker = PromptBroker::new();
        let mut events = broker.subscribe();
        let mut parked = broker.park(prompt(PromptKind::CreatePin));

        broker.close_all();
        let result = parked.next(&CancelToken::new()).await;
        assert!(matches!(result, Err(Error::PinEntryCancelled)));

        assert!(matches!(events.recv().await.unwrap(), PromptEvent::Opened(_)));
        assert!(matches!(events.recv().await.unwrap(), PromptEvent::Closed { .. }));
    }

    #[tokio::test]
    async fn test_token_cancel_ends_wait() {
        let broker = PromptBroker::new();
        let mut parked = broker.park(prompt(PromptKind::Confirm));
        let token = CancelToken::new();
        token.cancel();
        assert!(matches!(parked.next(&token).await, Err(Error::UserCancelled)));
    }
}
