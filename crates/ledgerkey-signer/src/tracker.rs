//! Broadcast status tracker
//!
//! Every broadcast is recorded under one durable key and polled at a fixed
//! interval until the status endpoint reports something other than a pending
//! status. A terminal status runs the refresh handlers named by the record and
//! removes it; running out of attempts keeps the record as `TimedOut`.
//!
//! Records survive restarts: [`BroadcastTracker::load`] drops entries older
//! than the TTL and resumes polling for the rest.

use crate::cancel::CancelToken;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ledgerkey_core::{BroadcastResult, Error, Result};
use ledgerkey_storage::{load_json, save_json, KeyValueStore, TRACKER_KEY};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use url::Url;

const EVENT_CAPACITY: usize = 64;

/// Tracker configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Delay between polls
    pub poll_interval_ms: u64,
    /// Polls before giving up
    pub max_attempts: u32,
    /// Age after which stored records are dropped on load
    pub ttl_ms: u64,
    /// Status strings starting with this keep polling
    pub pending_prefix: String,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 3_000,
            max_attempts: 20,
            ttl_ms: 60 * 60 * 1000,
            pending_prefix: "pending".to_string(),
        }
    }
}

impl TrackerConfig {
    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    fn is_expired(&self, record: &BroadcastRecord, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(record.created_at);
        age.num_milliseconds() > self.ttl_ms as i64
    }
}

/// Where a broadcast stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BroadcastStatus {
    /// Recorded, not yet polled
    Submitted,
    /// At least one poll returned a pending status
    Polling,
    /// Terminal status reported
    Confirmed,
    /// Gave up without a terminal status
    TimedOut,
}

impl BroadcastStatus {
    fn is_active(self) -> bool {
        matches!(self, BroadcastStatus::Submitted | BroadcastStatus::Polling)
    }
}

/// One tracked broadcast
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastRecord {
    /// Transaction id
    pub tx_id: String,
    /// API that accepted it
    pub api: String,
    /// When it was recorded
    pub created_at: DateTime<Utc>,
    /// Current status
    pub status: BroadcastStatus,
    /// Refresh handlers to run once confirmed
    #[serde(default)]
    pub related_refresh_ops: Vec<String>,
    /// Polls made so far
    #[serde(default)]
    pub attempts: u32,
}

/// Status lookups by transaction id
#[async_trait]
pub trait StatusEndpoint: Send + Sync {
    /// Raw status string for `tx_id`
    async fn status(&self, tx_id: &str) -> Result<String>;
}

#[derive(Deserialize)]
struct StatusResponse {
    status: String,
}

/// `GET {base}/{tx_id}` returning `{"status": "..."}`
pub struct HttpStatusEndpoint {
    client: reqwest::Client,
    base: Url,
}

impl HttpStatusEndpoint {
    /// Endpoint rooted at `base`
    pub fn new(base: &str, timeout: Duration) -> Result<Self> {
        let base = Url::parse(base).map_err(|e| Error::Other(format!("Invalid status URL {}: {}", base, e)))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Network(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client, base })
    }

    fn status_url(&self, tx_id: &str) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| Error::Other(format!("Status URL cannot take a path: {}", self.base)))?
            .pop_if_empty()
            .push(tx_id);
        Ok(url)
    }
}

#[async_trait]
impl StatusEndpoint for HttpStatusEndpoint {
    async fn status(&self, tx_id: &str) -> Result<String> {
        let url = self.status_url(tx_id)?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::Network(format!("Status request failed: {}", e)))?
            .error_for_status()
            .map_err(|e| Error::Network(format!("Status request failed: {}", e)))?;
        let body: StatusResponse = response
            .json()
            .await
            .map_err(|e| Error::Network(format!("Malformed status response: {}", e)))?;
        Ok(body.status)
    }
}

/// Called with the confirmed record
pub type RefreshHandler = Arc<dyn Fn(&BroadcastRecord) + Send + Sync>;

/// Tracker notifications
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TrackerEvent {
    /// A broadcast is being tracked
    Tracked {
        /// Transaction id
        tx_id: String,
    },
    /// Terminal status reported; refresh handlers have run
    Confirmed {
        /// Transaction id
        tx_id: String,
        /// Status string reported
        status: String,
    },
    /// Attempts exhausted
    TimedOut {
        /// Transaction id
        tx_id: String,
    },
    /// Removed by the user
    Dismissed {
        /// Transaction id
        tx_id: String,
    },
}

impl TrackerEvent {
    /// Error form of a timeout event
    pub fn error(&self) -> Option<Error> {
        match self {
            TrackerEvent::TimedOut { tx_id } => Some(Error::StatusPollTimedOut(tx_id.clone())),
            _ => None,
        }
    }
}

/// Polls broadcast status and keeps the durable record list
pub struct BroadcastTracker {
    config: TrackerConfig,
    store: Arc<dyn KeyValueStore>,
    endpoint: Arc<dyn StatusEndpoint>,
    records: RwLock<Vec<BroadcastRecord>>,
    handlers: RwLock<HashMap<String, RefreshHandler>>,
    pollers: Mutex<HashMap<String, CancelToken>>,
    events: broadcast::Sender<TrackerEvent>,
}

impl BroadcastTracker {
    /// Empty tracker; nothing is read from `store`
    pub fn new(config: TrackerConfig, store: Arc<dyn KeyValueStore>, endpoint: Arc<dyn StatusEndpoint>) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            config,
            store,
            endpoint,
            records: RwLock::new(Vec::new()),
            handlers: RwLock::new(HashMap::new()),
            pollers: Mutex::new(HashMap::new()),
            events,
        })
    }

    /// Tracker restored from `store`.
    ///
    /// Records past the TTL are dropped; active records resume polling.
    /// Must be called inside a tokio runtime.
    pub fn load(
        config: TrackerConfig,
        store: Arc<dyn KeyValueStore>,
        endpoint: Arc<dyn StatusEndpoint>,
    ) -> Result<Arc<Self>> {
        let tracker = Self::new(config, store, endpoint);
        let stored: Vec<BroadcastRecord> = match load_json(tracker.store.as_ref(), TRACKER_KEY) {
            Ok(records) => records.unwrap_or_default(),
            Err(e) => {
                warn!("Discarding unreadable broadcast queue: {}", e);
                Vec::new()
            }
        };

        let now = Utc::now();
        let total = stored.len();
        let kept: Vec<BroadcastRecord> = stored
            .into_iter()
            .filter(|r| !tracker.config.is_expired(r, now))
            .collect();
        if kept.len() != total {
            info!("Pruned {} expired broadcast record(s)", total - kept.len());
        }

        let resume: Vec<String> = kept
            .iter()
            .filter(|r| r.status.is_active())
            .map(|r| r.tx_id.clone())
            .collect();
        *tracker.records.write() = kept;
        tracker.persist()?;

        for tx_id in resume {
            debug!("Resuming status polling for {}", tx_id);
            tracker.spawn_poller(tx_id);
        }
        Ok(tracker)
    }

    /// Register the handler run for refresh op `name`
    pub fn register_refresh(&self, name: impl Into<String>, handler: RefreshHandler) {
        self.handlers.write().insert(name.into(), handler);
    }

    /// Start tracking a broadcast, replacing any record with the same id
    pub fn track(self: &Arc<Self>, result: &BroadcastResult, related_refresh_ops: Vec<String>) -> Result<()> {
        let record = BroadcastRecord {
            tx_id: result.tx_id.clone(),
            api: result.api.clone(),
            created_at: Utc::now(),
            status: BroadcastStatus::Submitted,
            related_refresh_ops,
            attempts: 0,
        };

        self.stop_poller(&record.tx_id);
        {
            let mut records = self.records.write();
            records.retain(|r| r.tx_id != record.tx_id);
            records.push(record.clone());
        }
        self.persist()?;

        info!("Tracking broadcast {}", record.tx_id);
        let _ = self.events.send(TrackerEvent::Tracked {
            tx_id: record.tx_id.clone(),
        });
        self.spawn_poller(record.tx_id);
        Ok(())
    }

    /// Forget a record. Returns whether it existed.
    pub fn dismiss(&self, tx_id: &str) -> Result<bool> {
        self.stop_poller(tx_id);
        let removed = {
            let mut records = self.records.write();
            let before = records.len();
            records.retain(|r| r.tx_id != tx_id);
            records.len() != before
        };
        if removed {
            self.persist()?;
            let _ = self.events.send(TrackerEvent::Dismissed {
                tx_id: tx_id.to_string(),
            });
        }
        Ok(removed)
    }

    /// Snapshot of the tracked records
    pub fn records(&self) -> Vec<BroadcastRecord> {
        self.records.read().clone()
    }

    /// Tracker notifications
    pub fn subscribe(&self) -> broadcast::Receiver<TrackerEvent> {
        self.events.subscribe()
    }

    /// Stop every poller; records stay stored for the next load
    pub fn shutdown(&self) {
        for (_, token) in self.pollers.lock().drain() {
            token.cancel();
        }
    }

    fn persist(&self) -> Result<()> {
        let records = self.records.read().clone();
        save_json(self.store.as_ref(), TRACKER_KEY, &records)?;
        Ok(())
    }

    fn stop_poller(&self, tx_id: &str) {
        if let Some(token) = self.pollers.lock().remove(tx_id) {
            token.cancel();
        }
    }

    fn spawn_poller(self: &Arc<Self>, tx_id: String) {
        let token = CancelToken::new();
        self.pollers.lock().insert(tx_id.clone(), token.clone());
        let weak = Arc::downgrade(self);
        let interval = self.config.poll_interval();
        tokio::spawn(poll(weak, tx_id, interval, token));
    }

    /// Count one attempt; returns the new count, or `None` if the record is gone
    fn begin_attempt(&self, tx_id: &str) -> Option<u32> {
        let attempts = {
            let mut records = self.records.write();
            let record = records.iter_mut().find(|r| r.tx_id == tx_id)?;
            record.attempts += 1;
            record.status = BroadcastStatus::Polling;
            record.attempts
        };
        if let Err(e) = self.persist() {
            warn!("Failed to persist broadcast queue: {}", e);
        }
        Some(attempts)
    }

    fn confirm(&self, tx_id: &str, status: String) {
        let record = {
            let mut records = self.records.write();
            let Some(record) = records.iter_mut().find(|r| r.tx_id == tx_id) else {
                return;
            };
            record.status = BroadcastStatus::Confirmed;
            record.clone()
        };
        self.pollers.lock().remove(tx_id);
        if let Err(e) = self.persist() {
            warn!("Failed to persist broadcast queue: {}", e);
        }

        info!("Broadcast {} reached status {}", tx_id, status);
        for name in &record.related_refresh_ops {
            let handler = self.handlers.read().get(name).cloned();
            match handler {
                Some(handler) => handler(&record),
                None => debug!("No refresh handler registered for {}", name),
            }
        }

        // Removed only once every handler has run
        self.records.write().retain(|r| r.tx_id != tx_id);
        if let Err(e) = self.persist() {
            warn!("Failed to persist broadcast queue: {}", e);
        }
        let _ = self.events.send(TrackerEvent::Confirmed {
            tx_id: tx_id.to_string(),
            status,
        });
    }

    fn time_out(&self, tx_id: &str) {
        {
            let mut records = self.records.write();
            if let Some(record) = records.iter_mut().find(|r| r.tx_id == tx_id) {
                record.status = BroadcastStatus::TimedOut;
            }
        }
        self.pollers.lock().remove(tx_id);
        if let Err(e) = self.persist() {
            warn!("Failed to persist broadcast queue: {}", e);
        }
        warn!("{}", Error::StatusPollTimedOut(tx_id.to_string()));
        let _ = self.events.send(TrackerEvent::TimedOut {
            tx_id: tx_id.to_string(),
        });
    }
}

async fn poll(tracker: Weak<BroadcastTracker>, tx_id: String, interval: Duration, token: CancelToken) {
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
        let Some(tracker) = tracker.upgrade() else {
            return;
        };
        if token.is_cancelled() {
            return;
        }
        let Some(attempts) = tracker.begin_attempt(&tx_id) else {
            return;
        };

        match tracker.endpoint.status(&tx_id).await {
            Ok(status) if !status.starts_with(&tracker.config.pending_prefix) => {
                if !token.is_cancelled() {
                    tracker.confirm(&tx_id, status);
                }
                return;
            }
            Ok(status) => debug!("Broadcast {} still {} (attempt {})", tx_id, status, attempts),
            Err(e) => warn!("Status poll for {} failed: {}", tx_id, e),
        }

        if attempts >= tracker.config.max_attempts {
            if !token.is_cancelled() {
                tracker.time_out(&tx_id);
            }
            return;
        }
    }
}
