//! Integration tests for real-time presence and cursor synchronization.
//!
//! These tests start a real server and connect peers, verifying presence
//! relay, bootstrap for late joiners, removal on disconnect and the full
//! resync fallback through the full network stack.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use scribe_collab::client::{ClientStatus, SyncClient};
use scribe_collab::config::{ClientConfig, ServerConfig};
use scribe_collab::crdt::Document;
use scribe_collab::presence::{
    CursorPosition, PresenceDiff, PresenceEntry, PresenceEvent, PresenceSet, SelectionRange,
};
use scribe_collab::protocol::{WireMessage, USER_HEADER};
use scribe_collab::room::SERVER_ORIGIN;
use scribe_collab::server::SyncServer;
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

const ROOM: &str = "s1-main.py";

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a server on a free port, return the port.
async fn start_test_server() -> u16 {
    let port = free_port().await;
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        ..ServerConfig::default()
    };
    let server = Arc::new(SyncServer::in_memory(config));
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    port
}

struct RawPeer {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    id: String,
}

impl RawPeer {
    /// Connect and join [`ROOM`], discarding the snapshot.
    async fn joined(port: u16, user: &str) -> Self {
        let mut request = format!("ws://127.0.0.1:{port}").into_client_request().unwrap();
        request.headers_mut().insert(USER_HEADER, user.parse().unwrap());
        let (ws, _) = tokio_tungstenite::connect_async(request).await.unwrap();
        let mut peer = Self { ws, id: String::new() };
        match peer.recv().await {
            WireMessage::Welcome { connection_id } => peer.id = connection_id,
            other => panic!("expected welcome, got {other:?}"),
        }
        peer.send(WireMessage::JoinRoom { room: ROOM.into() }).await;
        assert!(matches!(peer.recv().await, WireMessage::SyncResponse { .. }));
        peer
    }

    async fn send(&mut self, msg: WireMessage) {
        let bytes = msg.encode().unwrap();
        self.ws.send(Message::Binary(bytes.into())).await.unwrap();
    }

    async fn recv(&mut self) -> WireMessage {
        self.try_recv(Duration::from_secs(2)).await.expect("no message within timeout")
    }

    async fn try_recv(&mut self, wait: Duration) -> Option<WireMessage> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let frame = tokio::time::timeout_at(deadline, self.ws.next()).await.ok()??;
            if let Ok(Message::Binary(data)) = frame {
                return Some(WireMessage::decode(&data).unwrap());
            }
        }
    }

    /// Publish an entry under this connection's id.
    async fn publish(&mut self, presence: &mut PresenceSet, entry: PresenceEntry) {
        let diff = presence.set(&self.id, entry);
        let id = self.id.clone();
        self.send(WireMessage::awareness(ROOM, diff.encode().unwrap(), id)).await;
    }

    /// Next awareness frame as `(origin, diff)`.
    async fn recv_presence(&mut self) -> (String, PresenceDiff) {
        match self.recv().await {
            WireMessage::AwarenessUpdate { update, origin, .. } => {
                (origin, PresenceDiff::decode(&update).unwrap())
            }
            other => panic!("expected awareness-update, got {other:?}"),
        }
    }
}

/// Every added/updated id carries a payload; removed ids carry none.
fn assert_symmetric(diff: &PresenceDiff) {
    for id in diff.added.iter().chain(&diff.updated) {
        assert!(diff.entries.iter().any(|r| &r.client_id == id), "no payload for {id}");
    }
    for id in &diff.removed {
        assert!(!diff.entries.iter().any(|r| &r.client_id == id), "payload for removed {id}");
    }
}

// ─── Wire-level presence ─────────────────────────────────────────

#[tokio::test]
async fn test_presence_relayed_to_others() {
    let port = start_test_server().await;
    let mut a = RawPeer::joined(port, "ada").await;
    let mut b = RawPeer::joined(port, "bob").await;

    let mut local = PresenceSet::new();
    let entry = PresenceEntry::new("Ada", &a.id).with_cursor(CursorPosition::new(4, 2));
    a.publish(&mut local, entry.clone()).await;

    let (origin, diff) = b.recv_presence().await;
    assert_eq!(origin, a.id);
    assert_symmetric(&diff);
    assert_eq!(diff.added, vec![a.id.clone()]);
    assert_eq!(diff.entries[0].entry, entry);
    assert_eq!(a.try_recv(Duration::from_millis(200)).await, None);
}

#[tokio::test]
async fn test_cursor_moves_arrive_as_updates() {
    let port = start_test_server().await;
    let mut a = RawPeer::joined(port, "ada").await;
    let mut b = RawPeer::joined(port, "bob").await;

    let mut local = PresenceSet::new();
    let entry = PresenceEntry::new("Ada", &a.id);
    a.publish(&mut local, entry.clone()).await;
    b.recv_presence().await;

    let moved = entry.with_selection(SelectionRange {
        anchor: CursorPosition::new(1, 0),
        head: CursorPosition::new(1, 8),
    });
    a.publish(&mut local, moved.clone()).await;

    let (_, diff) = b.recv_presence().await;
    assert_symmetric(&diff);
    assert_eq!(diff.updated, vec![a.id.clone()]);
    assert_eq!(diff.entries[0].entry, moved);
}

#[tokio::test]
async fn test_late_joiner_gets_presence_bootstrap() {
    let port = start_test_server().await;
    let mut a = RawPeer::joined(port, "ada").await;
    let mut local = PresenceSet::new();
    a.publish(&mut local, PresenceEntry::new("Ada", &a.id)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut c = RawPeer::joined(port, "cy").await;
    let (origin, diff) = c.recv_presence().await;
    assert_eq!(origin, SERVER_ORIGIN);
    assert!(diff.full);
    assert_symmetric(&diff);
    assert_eq!(diff.added, vec![a.id.clone()]);
}

#[tokio::test]
async fn test_disconnect_broadcasts_removal() {
    let port = start_test_server().await;
    let mut a = RawPeer::joined(port, "ada").await;
    let mut b = RawPeer::joined(port, "bob").await;
    let mut local = PresenceSet::new();
    a.publish(&mut local, PresenceEntry::new("Ada", &a.id)).await;
    b.recv_presence().await;

    let a_id = a.id.clone();
    drop(a);

    let (_, diff) = b.recv_presence().await;
    assert_symmetric(&diff);
    assert_eq!(diff.removed, vec![a_id]);
    assert!(diff.entries.is_empty());
}

#[tokio::test]
async fn test_spoofed_entries_are_ignored() {
    let port = start_test_server().await;
    let mut a = RawPeer::joined(port, "ada").await;
    let mut b = RawPeer::joined(port, "bob").await;

    let mut forged = PresenceSet::new();
    let diff = forged.set(&b.id, PresenceEntry::new("Not Bob", &b.id));
    let a_id = a.id.clone();
    a.send(WireMessage::awareness(ROOM, diff.encode().unwrap(), a_id)).await;

    assert_eq!(b.try_recv(Duration::from_millis(200)).await, None);
}

#[tokio::test]
async fn test_malformed_presence_triggers_full_resync() {
    let port = start_test_server().await;
    let mut a = RawPeer::joined(port, "ada").await;
    let mut b = RawPeer::joined(port, "bob").await;
    let mut local = PresenceSet::new();
    b.publish(&mut local, PresenceEntry::new("Bob", &b.id)).await;
    a.recv_presence().await;

    let a_id = a.id.clone();
    a.send(WireMessage::awareness(ROOM, vec![0xff, 0xff, 0xff], a_id)).await;

    for peer in [&mut a, &mut b] {
        let (origin, diff) = peer.recv_presence().await;
        assert_eq!(origin, SERVER_ORIGIN);
        assert!(diff.full);
        assert_eq!(diff.added.len(), 1);
    }
}

// ─── Sync client presence ────────────────────────────────────────

#[tokio::test]
async fn test_client_cursor_reaches_other_client() {
    let port = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");

    let (alice, _ea) = SyncClient::start(
        ClientConfig::new(&url, ROOM, "alice").with_display_name("Alice"),
        Document::new(),
    )
    .unwrap();
    let (bob, _eb) = SyncClient::start(ClientConfig::new(&url, ROOM, "bob"), Document::new()).unwrap();
    for client in [&alice, &bob] {
        timeout(
            Duration::from_secs(3),
            client.wait_for_status(|s| *s == ClientStatus::Synced),
        )
        .await
        .unwrap();
    }
    let mut cursors = bob.subscribe_presence();

    alice.update_cursor(Some(CursorPosition::new(10, 4)), None);

    let alice_id = alice.connection_id().unwrap();
    let seen = timeout(Duration::from_secs(2), async {
        while let Some(event) = cursors.recv().await {
            match event {
                PresenceEvent::Added { client_id, entry } | PresenceEvent::Updated { client_id, entry }
                    if client_id == alice_id && entry.cursor == Some(CursorPosition::new(10, 4)) =>
                {
                    return entry;
                }
                _ => {}
            }
        }
        panic!("presence stream ended");
    })
    .await
    .unwrap();
    assert_eq!(seen.display_name, "Alice");

    alice.destroy();
    let removed = timeout(Duration::from_secs(2), async {
        while let Some(event) = cursors.recv().await {
            if let PresenceEvent::Removed { client_id } = event {
                return client_id;
            }
        }
        String::new()
    })
    .await
    .unwrap();
    assert_eq!(removed, alice_id);
    assert!(bob.remote_presence().is_empty());
}
