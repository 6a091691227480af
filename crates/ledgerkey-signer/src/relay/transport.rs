//! Relay transports
//!
//! A connection is a pair of text-frame channels. [`WsConnector`] bridges them
//! onto a WebSocket; [`MemoryConnector`] hands the far ends to an in-process
//! peer.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use ledgerkey_core::{Error, Result};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, error, info, warn};

const CHANNEL_CAPACITY: usize = 64;

/// One duplex text connection
pub struct RelayConnection {
    /// Frames to send
    pub outgoing: mpsc::Sender<String>,
    /// Frames received; `None` once the connection is gone
    pub incoming: mpsc::Receiver<String>,
}

/// Opens relay connections
#[async_trait]
pub trait RelayConnector: Send + Sync {
    /// Open a new connection
    async fn connect(&self) -> Result<RelayConnection>;
}

/// Two connected ends
pub fn memory_pair() -> (RelayConnection, RelayConnection) {
    let (a_tx, a_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (b_tx, b_rx) = mpsc::channel(CHANNEL_CAPACITY);
    (
        RelayConnection {
            outgoing: a_tx,
            incoming: b_rx,
        },
        RelayConnection {
            outgoing: b_tx,
            incoming: a_rx,
        },
    )
}

/// WebSocket connector
pub struct WsConnector {
    url: String,
    connect_timeout: Duration,
}

impl WsConnector {
    /// Connector for `url` (`ws://` or `wss://`)
    pub fn new(url: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            connect_timeout,
        }
    }
}

#[async_trait]
impl RelayConnector for WsConnector {
    async fn connect(&self) -> Result<RelayConnection> {
        info!("Connecting to relay at {}", self.url);
        let (ws_stream, _) = timeout(self.connect_timeout, connect_async(self.url.as_str()))
            .await
            .map_err(|_| Error::Network(format!("Timed out connecting to {}", self.url)))?
            .map_err(|e| Error::Network(format!("Failed to connect to {}: {}", self.url, e)))?;
        let (mut ws_sink, mut ws_source) = ws_stream.split();

        let (local, remote) = memory_pair();
        let RelayConnection {
            outgoing: to_local,
            incoming: mut from_local,
        } = remote;

        tokio::spawn(async move {
            while let Some(frame) = from_local.recv().await {
                if let Err(e) = ws_sink.send(Message::Text(frame)).await {
                    error!("Relay send failed: {}", e);
                    break;
                }
            }
            let _ = ws_sink.close().await;
            debug!("Relay writer stopped");
        });

        tokio::spawn(async move {
            while let Some(message) = ws_source.next().await {
                match message {
                    Ok(Message::Text(frame)) => {
                        if to_local.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => {
                        info!("Relay closed the connection");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Relay receive failed: {}", e);
                        break;
                    }
                }
            }
            debug!("Relay reader stopped");
        });

        Ok(local)
    }
}

/// In-process connector; each `connect` delivers the far end to the peer
pub struct MemoryConnector {
    peers: mpsc::UnboundedSender<RelayConnection>,
}

impl MemoryConnector {
    /// Connector plus the receiver of server-side ends
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RelayConnection>) {
        let (peers, rx) = mpsc::unbounded_channel();
        (Self { peers }, rx)
    }
}

#[async_trait]
impl RelayConnector for MemoryConnector {
    async fn connect(&self) -> Result<RelayConnection> {
        let (local, remote) = memory_pair();
        self.peers
            .send(remote)
            .map_err(|_| Error::Network("Relay peer is gone".to_string()))?;
        Ok(local)
    }
}
