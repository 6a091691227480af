//! Broadcast tracker tests on paused time
//!
//! Tests cover:
//! - Terminal status runs refresh handlers and removes the record
//! - Attempts exhausted keeps the record as TimedOut
//! - TTL pruning and resume on load
//! - Dismiss and shutdown

use async_trait::async_trait;
use chrono::Utc;
use ledgerkey_core::{BroadcastResult, Error, Result};
use ledgerkey_signer::{
    BroadcastRecord, BroadcastStatus, BroadcastTracker, StatusEndpoint, TrackerConfig, TrackerEvent,
};
use ledgerkey_storage::{load_json, save_json, KeyValueStore, MemoryStore, TRACKER_KEY};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Replies from a per-transaction script, then "pending" forever
#[derive(Default)]
struct ScriptedStatus {
    scripts: Mutex<HashMap<String, VecDeque<Result<String>>>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedStatus {
    fn script(&self, tx_id: &str, replies: Vec<Result<String>>) {
        self.scripts.lock().insert(tx_id.to_string(), replies.into());
    }

    fn calls_for(&self, tx_id: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.as_str() == tx_id).count()
    }
}

#[async_trait]
impl StatusEndpoint for ScriptedStatus {
    async fn status(&self, tx_id: &str) -> Result<String> {
        self.calls.lock().push(tx_id.to_string());
        self.scripts
            .lock()
            .get_mut(tx_id)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Ok("pending".to_string()))
    }
}

fn result(tx_id: &str) -> BroadcastResult {
    BroadcastResult {
        tx_id: tx_id.to_string(),
        api: "stub".to_string(),
        block_num: None,
    }
}

fn record(tx_id: &str, age_minutes: i64, status: BroadcastStatus) -> BroadcastRecord {
    BroadcastRecord {
        tx_id: tx_id.to_string(),
        api: "stub".to_string(),
        created_at: Utc::now() - chrono::Duration::minutes(age_minutes),
        status,
        related_refresh_ops: vec!["balance".to_string()],
        attempts: 2,
    }
}

async fn wait_for(events: &mut broadcast::Receiver<TrackerEvent>, tx: &str) -> TrackerEvent {
    loop {
        let event = events.recv().await.unwrap();
        match &event {
            TrackerEvent::Confirmed { tx_id, .. } | TrackerEvent::TimedOut { tx_id } if tx_id == tx => {
                return event
            }
            _ => {}
        }
    }
}

fn stored(store: &MemoryStore) -> Vec<BroadcastRecord> {
    load_json(store, TRACKER_KEY).unwrap().unwrap_or_default()
}

// =============================================================================
// Polling
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_terminal_status_runs_refresh_and_removes() {
    let store = Arc::new(MemoryStore::new());
    let endpoint = Arc::new(ScriptedStatus::default());
    endpoint.script(
        "abc",
        vec![
            Ok("pending".to_string()),
            Err(Error::Network("flaky".to_string())),
            Ok("within_irreversible_block".to_string()),
        ],
    );
    let tracker = BroadcastTracker::new(TrackerConfig::default(), store.clone(), endpoint.clone());

    let refreshed = Arc::new(AtomicUsize::new(0));
    let counter = refreshed.clone();
    let durable = store.clone();
    tracker.register_refresh(
        "balance",
        Arc::new(move |record: &BroadcastRecord| {
            assert_eq!(record.status, BroadcastStatus::Confirmed);
            // Still queued while the handler runs
            let queued = stored(&durable);
            assert_eq!(queued.len(), 1);
            assert_eq!(queued[0].status, BroadcastStatus::Confirmed);
            counter.fetch_add(1, Ordering::SeqCst);
        }),
    );

    let mut events = tracker.subscribe();
    tracker.track(&result("abc"), vec!["balance".to_string()]).unwrap();
    assert_eq!(stored(&store).len(), 1);

    let event = wait_for(&mut events, "abc").await;
    assert_eq!(
        event,
        TrackerEvent::Confirmed {
            tx_id: "abc".to_string(),
            status: "within_irreversible_block".to_string()
        }
    );
    assert_eq!(refreshed.load(Ordering::SeqCst), 1);
    assert_eq!(endpoint.calls_for("abc"), 3);
    assert!(tracker.records().is_empty());
    assert!(stored(&store).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_attempts_time_out() {
    let store = Arc::new(MemoryStore::new());
    let endpoint = Arc::new(ScriptedStatus::default());
    let config = TrackerConfig {
        max_attempts: 3,
        ..TrackerConfig::default()
    };
    let tracker = BroadcastTracker::new(config, store.clone(), endpoint.clone());

    let mut events = tracker.subscribe();
    tracker.track(&result("slow"), vec![]).unwrap();

    let event = wait_for(&mut events, "slow").await;
    assert!(matches!(event.error(), Some(Error::StatusPollTimedOut(ref id)) if id == "slow"));
    assert!(!event.error().unwrap().nothing_signed());

    let records = tracker.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, BroadcastStatus::TimedOut);
    assert_eq!(records[0].attempts, 3);
    assert_eq!(stored(&store)[0].status, BroadcastStatus::TimedOut);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(endpoint.calls_for("slow"), 3);
}

// =============================================================================
// Persistence
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_load_prunes_expired_and_resumes_active() {
    let store = Arc::new(MemoryStore::new());
    save_json(
        store.as_ref(),
        TRACKER_KEY,
        &vec![
            record("old", 120, BroadcastStatus::Polling),
            record("fresh", 5, BroadcastStatus::Submitted),
            record("gave-up", 5, BroadcastStatus::TimedOut),
        ],
    )
    .unwrap();

    let endpoint = Arc::new(ScriptedStatus::default());
    endpoint.script("fresh", vec![Ok("confirmed".to_string())]);
    let tracker = BroadcastTracker::load(TrackerConfig::default(), store.clone(), endpoint.clone()).unwrap();

    let ids: Vec<String> = tracker.records().into_iter().map(|r| r.tx_id).collect();
    assert_eq!(ids, vec!["fresh".to_string(), "gave-up".to_string()]);
    assert_eq!(stored(&store).len(), 2);

    let mut events = tracker.subscribe();
    wait_for(&mut events, "fresh").await;

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(endpoint.calls_for("fresh"), 1);
    assert_eq!(endpoint.calls_for("gave-up"), 0);
    assert_eq!(endpoint.calls_for("old"), 0);
    assert_eq!(tracker.records().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unreadable_queue_starts_empty() {
    let store = Arc::new(MemoryStore::new());
    store.put(TRACKER_KEY, "not json").unwrap();
    let tracker =
        BroadcastTracker::load(TrackerConfig::default(), store.clone(), Arc::new(ScriptedStatus::default())).unwrap();
    assert!(tracker.records().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_dismiss_stops_polling() {
    let store = Arc::new(MemoryStore::new());
    let endpoint = Arc::new(ScriptedStatus::default());
    let tracker = BroadcastTracker::new(TrackerConfig::default(), store.clone(), endpoint.clone());

    tracker.track(&result("abc"), vec![]).unwrap();
    assert!(tracker.dismiss("abc").unwrap());
    assert!(!tracker.dismiss("abc").unwrap());

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(endpoint.calls_for("abc"), 0);
    assert!(stored(&store).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_keeps_records_for_next_load() {
    let store = Arc::new(MemoryStore::new());
    let endpoint = Arc::new(ScriptedStatus::default());
    let tracker = BroadcastTracker::new(TrackerConfig::default(), store.clone(), endpoint.clone());

    tracker.track(&result("abc"), vec![]).unwrap();
    tracker.shutdown();
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(endpoint.calls_for("abc"), 0);

    let reloaded = BroadcastTracker::load(TrackerConfig::default(), store.clone(), endpoint.clone()).unwrap();
    assert_eq!(reloaded.records().len(), 1);
    reloaded.shutdown();
}
