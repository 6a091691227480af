//! Signing for Ledgerkey
//!
//! Four interchangeable backends behind [`SignerBackend`], a serialized
//! [`OperationQueue`] that gates every request behind user prompts, and the
//! [`BroadcastTracker`] that follows broadcasts to a terminal status.
//!
//! ## Backends
//!
//! - **Local**: keys from the credential vault; prompts for PIN, key entry and
//!   confirmation as needed
//! - **Extension**: delegates to a host-injected bridge
//! - **Redirect**: opens a web signer URL; returns no result
//! - **Relay**: companion app over a relay socket; `sign` resolves when the
//!   request is forwarded, not when it is broadcast

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backend;
pub mod cancel;
pub mod confirmation;
pub mod extension;
pub mod local;
pub mod prompt;
pub mod queue;
pub mod redirect;
pub mod relay;
pub mod tracker;

pub use backend::{RedirectTicket, RelayAck, SignContext, SignOutcome, SignerBackend, SignerKind};
pub use cancel::CancelToken;
pub use confirmation::{ConfirmationRequest, SIGN_ONLY_TYPE};
pub use extension::{ExtensionBridge, ExtensionSigner};
pub use local::LocalSigner;
pub use prompt::{ParkedPrompt, Prompt, PromptAnswer, PromptBroker, PromptEvent, PromptKind};
pub use queue::{OperationQueue, RequestEntry, RequestKind, RequestStatus, MAX_RECENT_REQUESTS};
pub use redirect::{RedirectConfig, RedirectSigner, UrlOpener};
pub use relay::transport::{memory_pair, MemoryConnector, RelayConnection, RelayConnector, WsConnector};
pub use relay::{RelayConfig, RelayEvent, RelaySession, RelaySigner};
pub use tracker::{
    BroadcastRecord, BroadcastStatus, BroadcastTracker, HttpStatusEndpoint, RefreshHandler, StatusEndpoint,
    TrackerConfig, TrackerEvent,
};
