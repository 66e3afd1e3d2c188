//! Presence integration tests.
//!
//! Cursor and identity metadata travelling through a live server: relay to
//! peers, snapshot for late joiners, cleanup on disconnect, and republishing
//! after a reconnect.

use std::sync::Arc;
use tandem_collab::awareness::{AwarenessChange, UserPresence};
use tandem_collab::client::{SyncClient, SyncEvent};
use tandem_collab::server::{ServerConfig, SyncServer};
use tandem_collab::storage::{FileRecord, MemoryStore};
use tandem_core::binding::shared;
use tandem_core::{ClientId, Document};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

async fn start_test_server() -> String {
    let store = Arc::new(MemoryStore::new());
    store.insert_file("1", FileRecord::new("shared text")).await;
    let server = SyncServer::new(ServerConfig::for_testing(), store);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    format!("ws://127.0.0.1:{port}")
}

async fn connected_client(url: &str, client: u64) -> (SyncClient, mpsc::Receiver<SyncEvent>) {
    let mut client = SyncClient::new(url, "file-1", shared(Document::new(ClientId(client))));
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    next_matching(&mut events, |e| *e == SyncEvent::Synced).await;
    (client, events)
}

async fn next_matching(events: &mut mpsc::Receiver<SyncEvent>, wanted: impl Fn(&SyncEvent) -> bool) -> SyncEvent {
    timeout(Duration::from_secs(3), async {
        loop {
            match events.recv().await {
                Some(event) if wanted(&event) => return event,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn next_presence(events: &mut mpsc::Receiver<SyncEvent>) -> AwarenessChange {
    match next_matching(events, |e| matches!(e, SyncEvent::Presence(_))).await {
        SyncEvent::Presence(change) => change,
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_presence_relayed_to_peers() {
    let url = start_test_server().await;
    let (alice, _alice_events) = connected_client(&url, 1).await;
    let (bob, mut bob_events) = connected_client(&url, 2).await;

    alice
        .set_presence(UserPresence::new(ClientId(1), "Alice").with_cursor(0, 6))
        .await
        .unwrap();

    let change = next_presence(&mut bob_events).await;
    assert_eq!(change.added, vec![ClientId(1)]);
    let seen = bob.presence_of(ClientId(1)).await.unwrap();
    assert_eq!(seen.name, "Alice");
    assert_eq!(seen.cursor.map(|c| (c.anchor, c.head)), Some((0, 6)));

    // A moved cursor is an update, not a new entry.
    alice
        .set_presence(UserPresence::new(ClientId(1), "Alice").with_cursor(3, 3))
        .await
        .unwrap();
    let change = next_presence(&mut bob_events).await;
    assert_eq!(change.updated, vec![ClientId(1)]);
}

#[tokio::test]
async fn test_late_joiner_receives_snapshot() {
    let url = start_test_server().await;
    let (alice, _alice_events) = connected_client(&url, 1).await;
    let (_bob, mut bob_events) = connected_client(&url, 2).await;
    alice.set_presence(UserPresence::new(ClientId(1), "Alice")).await.unwrap();
    // The server has the entry once Bob has seen it.
    next_presence(&mut bob_events).await;

    let mut carol = SyncClient::new(&url, "file-1", shared(Document::new(ClientId(3))));
    let mut carol_events = carol.take_event_rx().unwrap();
    carol.connect().await.unwrap();
    let change = next_presence(&mut carol_events).await;
    assert_eq!(change.added, vec![ClientId(1)]);
    assert_eq!(carol.presence_of(ClientId(1)).await.unwrap().name, "Alice");
}

#[tokio::test]
async fn test_disconnect_removes_presence() {
    let url = start_test_server().await;
    let (mut alice, _alice_events) = connected_client(&url, 1).await;
    let (bob, mut bob_events) = connected_client(&url, 2).await;
    alice.set_presence(UserPresence::new(ClientId(1), "Alice")).await.unwrap();
    next_presence(&mut bob_events).await;

    alice.disconnect().await;
    let change = next_presence(&mut bob_events).await;
    assert_eq!(change.removed, vec![ClientId(1)]);
    assert!(bob.presence_of(ClientId(1)).await.is_none());

    // The removal is announced exactly once.
    tokio::time::sleep(Duration::from_millis(200)).await;
    while let Ok(event) = bob_events.try_recv() {
        assert!(!matches!(event, SyncEvent::Presence(_)), "extra presence event {event:?}");
    }
}

#[tokio::test]
async fn test_presence_republished_after_reconnect() {
    let url = start_test_server().await;
    let (mut alice, mut alice_events) = connected_client(&url, 1).await;
    let (_bob, mut bob_events) = connected_client(&url, 2).await;
    alice.set_presence(UserPresence::new(ClientId(1), "Alice")).await.unwrap();
    next_presence(&mut bob_events).await;

    alice.disconnect().await;
    assert_eq!(next_presence(&mut bob_events).await.removed, vec![ClientId(1)]);

    alice.connect().await.unwrap();
    next_matching(&mut alice_events, |e| *e == SyncEvent::Synced).await;
    assert_eq!(next_presence(&mut bob_events).await.added, vec![ClientId(1)]);
}

#[tokio::test]
async fn test_presence_set_before_connect_is_sent() {
    let url = start_test_server().await;
    let (bob, mut bob_events) = connected_client(&url, 2).await;

    let mut alice = SyncClient::new(&url, "file-1", shared(Document::new(ClientId(1))));
    alice.set_presence(UserPresence::new(ClientId(1), "Early")).await.unwrap();
    alice.connect().await.unwrap();

    assert_eq!(next_presence(&mut bob_events).await.added, vec![ClientId(1)]);
    assert_eq!(bob.presence_of(ClientId(1)).await.unwrap().name, "Early");
}
