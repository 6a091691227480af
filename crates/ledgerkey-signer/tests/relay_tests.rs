//! Relay signer against an in-process relay server
//!
//! Tests cover:
//! - Pairing handshake with QR display, then sign resolving on `sign_wait`
//! - Final results delivered as events
//! - Session reuse and transparent re-pairing on expiry
//! - Declines, detached challenges and disconnects
//! - Slow replies and reconnects leave the session and live requests alone

use chrono::Utc;
use ledgerkey_core::{Error, KeyLevel, Operation};
use ledgerkey_signer::relay::protocol::{
    decrypt_payload, encrypt_payload, parse_auth_uri, AuthAckPayload, ChallengeAckPayload, ChallengePayload,
    RelayMessage, SignPayload,
};
use ledgerkey_signer::{
    MemoryConnector, PromptBroker, PromptEvent, RelayConfig, RelayConnection, RelayEvent, RelaySigner,
    SignContext, SignOutcome, SignerBackend,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;

struct Fixture {
    signer: Arc<RelaySigner>,
    peers: mpsc::UnboundedReceiver<RelayConnection>,
    prompt_events: broadcast::Receiver<PromptEvent>,
    relay_events: broadcast::Receiver<RelayEvent>,
}

fn fixture() -> Fixture {
    fixture_with(RelayConfig::default())
}

fn fixture_with(config: RelayConfig) -> Fixture {
    let (connector, peers) = MemoryConnector::new();
    let prompts = PromptBroker::new();
    let prompt_events = prompts.subscribe();
    let signer = Arc::new(RelaySigner::new(config, Arc::new(connector), prompts));
    let relay_events = signer.subscribe();
    Fixture {
        signer,
        peers,
        prompt_events,
        relay_events,
    }
}

fn vote() -> Vec<Operation> {
    vec![Operation::new(
        "vote",
        json!({"voter": "alice", "author": "bob", "permlink": "hello", "weight": 10000}),
    )]
}

fn in_ms(seconds: i64) -> i64 {
    (Utc::now() + chrono::Duration::seconds(seconds)).timestamp_millis()
}

async fn recv(server: &mut RelayConnection) -> RelayMessage {
    let frame = timeout(Duration::from_secs(5), server.incoming.recv())
        .await
        .expect("client sent nothing")
        .expect("client hung up");
    RelayMessage::from_frame(&frame).unwrap()
}

async fn send(server: &RelayConnection, message: RelayMessage) {
    server.outgoing.send(message.to_frame().unwrap()).await.unwrap();
}

/// Serve one pairing; returns the auth key taken from the displayed URI
async fn pair(server: &mut RelayConnection, prompt_events: &mut broadcast::Receiver<PromptEvent>) -> String {
    let RelayMessage::AuthReq { account, uuid, .. } = recv(server).await else {
        panic!("expected auth_req");
    };
    assert_eq!(account, "alice");
    send(server, RelayMessage::AuthWait { uuid, expire: in_ms(60) }).await;

    let uri = loop {
        let event = timeout(Duration::from_secs(5), prompt_events.recv())
            .await
            .unwrap()
            .unwrap();
        if let PromptEvent::Display { uri, .. } = event {
            break uri;
        }
    };
    let pairing = parse_auth_uri(&uri).unwrap();
    assert_eq!(pairing.uuid, uuid);
    assert_eq!(pairing.account, "alice");

    let data = encrypt_payload(
        &pairing.key,
        &AuthAckPayload {
            token: "session-token".to_string(),
            expire: in_ms(3600),
        },
    )
    .unwrap();
    send(server, RelayMessage::AuthAck { uuid, data }).await;
    pairing.key
}

fn spawn_sign(
    signer: &Arc<RelaySigner>,
) -> tokio::task::JoinHandle<ledgerkey_core::Result<SignOutcome>> {
    let signer = signer.clone();
    tokio::spawn(async move {
        signer
            .sign(&SignContext::new(), "alice", &vote(), KeyLevel::Posting)
            .await
    })
}

// =============================================================================
// Pairing and signing
// =============================================================================

#[tokio::test]
async fn test_pair_then_sign_resolves_on_wait() {
    let mut f = fixture();
    let task = spawn_sign(&f.signer);
    let mut server = f.peers.recv().await.unwrap();
    let key = pair(&mut server, &mut f.prompt_events).await;

    let RelayMessage::SignReq { token, uuid, data, .. } = recv(&mut server).await else {
        panic!("expected sign_req");
    };
    assert_eq!(token, "session-token");
    let payload: SignPayload = decrypt_payload(&key, &data).unwrap();
    assert_eq!(payload.key_type, "posting");
    assert_eq!(payload.ops, vote());
    assert!(payload.broadcast);

    send(&server, RelayMessage::SignWait { uuid, expire: in_ms(60) }).await;
    let outcome = task.await.unwrap().unwrap();
    let SignOutcome::Requested(ack) = outcome else {
        panic!("relay signing resolves with an acknowledgment");
    };
    assert_eq!(ack.uuid, uuid);
    assert!(f.signer.session_info().is_some());

    // The transaction result arrives later, as an event
    send(
        &server,
        RelayMessage::SignAck {
            uuid,
            data: Some("deadbeef".to_string()),
        },
    )
    .await;
    loop {
        let event = timeout(Duration::from_secs(5), f.relay_events.recv())
            .await
            .unwrap()
            .unwrap();
        if let RelayEvent::SignAccepted { uuid: id, data } = event {
            assert_eq!(id, uuid);
            assert_eq!(data.as_deref(), Some("deadbeef"));
            break;
        }
    }
}

#[tokio::test]
async fn test_session_is_reused() {
    let mut f = fixture();
    let task = spawn_sign(&f.signer);
    let mut server = f.peers.recv().await.unwrap();
    pair(&mut server, &mut f.prompt_events).await;
    let RelayMessage::SignReq { uuid, .. } = recv(&mut server).await else {
        panic!("expected sign_req");
    };
    send(&server, RelayMessage::SignWait { uuid, expire: in_ms(60) }).await;
    task.await.unwrap().unwrap();

    let task = spawn_sign(&f.signer);
    let RelayMessage::SignReq { uuid, .. } = recv(&mut server).await else {
        panic!("expected sign_req without a new pairing");
    };
    send(&server, RelayMessage::SignWait { uuid, expire: in_ms(60) }).await;
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_expired_session_pairs_again_once() {
    let mut f = fixture();
    let task = spawn_sign(&f.signer);
    let mut server = f.peers.recv().await.unwrap();
    pair(&mut server, &mut f.prompt_events).await;
    let RelayMessage::SignReq { uuid, .. } = recv(&mut server).await else {
        panic!("expected sign_req");
    };
    send(&server, RelayMessage::SignWait { uuid, expire: in_ms(60) }).await;
    task.await.unwrap().unwrap();

    let task = spawn_sign(&f.signer);
    let RelayMessage::SignReq { uuid, .. } = recv(&mut server).await else {
        panic!("expected sign_req");
    };
    send(&server, RelayMessage::Expired { uuid }).await;

    let key = pair(&mut server, &mut f.prompt_events).await;
    let RelayMessage::SignReq { uuid, data, .. } = recv(&mut server).await else {
        panic!("expected sign_req after pairing again");
    };
    assert!(decrypt_payload::<SignPayload>(&key, &data).is_ok());
    send(&server, RelayMessage::SignWait { uuid, expire: in_ms(60) }).await;
    assert!(matches!(task.await.unwrap().unwrap(), SignOutcome::Requested(_)));
}

#[tokio::test]
async fn test_declined_sign_is_user_cancelled() {
    let mut f = fixture();
    let task = spawn_sign(&f.signer);
    let mut server = f.peers.recv().await.unwrap();
    pair(&mut server, &mut f.prompt_events).await;
    let RelayMessage::SignReq { uuid, .. } = recv(&mut server).await else {
        panic!("expected sign_req");
    };
    send(&server, RelayMessage::SignNack { uuid }).await;
    assert!(matches!(task.await.unwrap(), Err(Error::UserCancelled)));
}

#[tokio::test]
async fn test_declined_pairing_is_user_cancelled() {
    let mut f = fixture();
    let task = spawn_sign(&f.signer);
    let mut server = f.peers.recv().await.unwrap();
    let RelayMessage::AuthReq { uuid, .. } = recv(&mut server).await else {
        panic!("expected auth_req");
    };
    send(&server, RelayMessage::AuthWait { uuid, expire: in_ms(60) }).await;
    send(&server, RelayMessage::AuthNack { uuid }).await;
    assert!(matches!(task.await.unwrap(), Err(Error::UserCancelled)));
    assert!(f.signer.session_info().is_none());
}

// =============================================================================
// Challenges, logout and disconnects
// =============================================================================

#[tokio::test]
async fn test_sign_only_returns_decrypted_signature() {
    let mut f = fixture();
    let signer = f.signer.clone();
    let task = tokio::spawn(async move {
        signer
            .sign_only(&SignContext::new(), "alice", "login:42", KeyLevel::Posting)
            .await
    });
    let mut server = f.peers.recv().await.unwrap();
    let key = pair(&mut server, &mut f.prompt_events).await;

    let RelayMessage::ChallengeReq { uuid, data, .. } = recv(&mut server).await else {
        panic!("expected challenge_req");
    };
    let payload: ChallengePayload = decrypt_payload(&key, &data).unwrap();
    assert_eq!(payload.challenge, "login:42");

    send(&server, RelayMessage::ChallengeWait { uuid, expire: in_ms(60) }).await;
    let data = encrypt_payload(
        &key,
        &ChallengeAckPayload {
            signature: "1f2e3d".to_string(),
            pubkey: "STM000".to_string(),
        },
    )
    .unwrap();
    send(&server, RelayMessage::ChallengeAck { uuid, data }).await;

    let signature = task.await.unwrap().unwrap();
    assert_eq!(signature.as_str(), "1f2e3d");
}

#[tokio::test]
async fn test_logout_forces_new_pairing() {
    let mut f = fixture();
    let task = spawn_sign(&f.signer);
    let mut server = f.peers.recv().await.unwrap();
    pair(&mut server, &mut f.prompt_events).await;
    let RelayMessage::SignReq { uuid, .. } = recv(&mut server).await else {
        panic!("expected sign_req");
    };
    send(&server, RelayMessage::SignWait { uuid, expire: in_ms(60) }).await;
    task.await.unwrap().unwrap();

    f.signer.logout();
    assert!(f.signer.session_info().is_none());

    let _task = spawn_sign(&f.signer);
    assert!(matches!(recv(&mut server).await, RelayMessage::AuthReq { .. }));
}

#[tokio::test]
async fn test_disconnect_fails_pending_request() {
    let mut f = fixture();
    let task = spawn_sign(&f.signer);
    let mut server = f.peers.recv().await.unwrap();
    assert!(matches!(recv(&mut server).await, RelayMessage::AuthReq { .. }));
    drop(server);

    assert!(matches!(task.await.unwrap(), Err(Error::Relay(_))));
    loop {
        let event = timeout(Duration::from_secs(5), f.relay_events.recv())
            .await
            .unwrap()
            .unwrap();
        if event == RelayEvent::Disconnected {
            break;
        }
    }
}

#[tokio::test]
async fn test_silent_server_times_out_without_dropping_session() {
    let mut f = fixture_with(RelayConfig {
        ack_timeout_ms: 500,
        ..RelayConfig::default()
    });
    let task = spawn_sign(&f.signer);
    let mut server = f.peers.recv().await.unwrap();
    pair(&mut server, &mut f.prompt_events).await;
    let RelayMessage::SignReq { uuid, .. } = recv(&mut server).await else {
        panic!("expected sign_req");
    };
    send(&server, RelayMessage::SignWait { uuid, expire: in_ms(60) }).await;
    task.await.unwrap().unwrap();

    let task = spawn_sign(&f.signer);
    assert!(matches!(recv(&mut server).await, RelayMessage::SignReq { .. }));

    let result = task.await.unwrap();
    assert!(matches!(result, Err(Error::Relay(_))));
    assert!(f.signer.session_info().is_some());

    // No second pairing and no resent request
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(server.incoming.try_recv().is_err());
}

#[tokio::test]
async fn test_old_connection_closing_spares_new_one() {
    let mut f = fixture();
    let task = spawn_sign(&f.signer);
    let mut first = f.peers.recv().await.unwrap();
    pair(&mut first, &mut f.prompt_events).await;
    let RelayMessage::SignReq { uuid, .. } = recv(&mut first).await else {
        panic!("expected sign_req");
    };
    send(&first, RelayMessage::SignWait { uuid, expire: in_ms(60) }).await;
    task.await.unwrap().unwrap();

    // Half-close the first connection: the client can no longer send on it
    let RelayConnection {
        outgoing: first_outgoing,
        incoming: first_incoming,
    } = first;
    drop(first_incoming);

    let task = spawn_sign(&f.signer);
    let mut second = timeout(Duration::from_secs(5), f.peers.recv())
        .await
        .unwrap()
        .unwrap();
    let RelayMessage::SignReq { uuid, token, .. } = recv(&mut second).await else {
        panic!("expected sign_req on the new connection");
    };
    assert_eq!(token, "session-token");

    // The first connection's reader finishes while the request is in flight
    drop(first_outgoing);
    tokio::time::sleep(Duration::from_millis(50)).await;

    send(&second, RelayMessage::SignWait { uuid, expire: in_ms(60) }).await;
    let outcome = task.await.unwrap().unwrap();
    assert!(matches!(outcome, SignOutcome::Requested(ack) if ack.uuid == uuid));
}
