//! WebSocket sync server with room-based document routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐                      ┌── Room (s1-main.py) ── Document + PresenceSet
//!            ├── SyncServer ── RoomRegistry                      │
//! Client B ──┘                      └── Room (s1-util.rs)        ├── PersistenceBridge
//!                                                                │       │
//!                                                                │       └── FileStorage
//!                                                     ┌──────────┼──────────┐
//!                                                     ▼          ▼          ▼
//!                                                  Client A   Client B   Client C
//! ```
//!
//! Each connection gets a server-assigned id, sent in the `welcome` frame
//! and used as the origin tag on everything the connection produces. The
//! identity in the `x-scribe-user` handshake header is checked against the
//! access-control collaborator before every `join-room`.
//!
//! All frames for a connection, replies included, go through its bounded
//! outbound queue so they reach the socket in the order rooms produced them.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::access::{AccessControl, AccessLevel, AllowAll};
use crate::config::ServerConfig;
use crate::error::{RoomError, ServerError};
use crate::persistence::PersistenceBridge;
use crate::protocol::{ErrorKind, WireMessage, USER_HEADER};
use crate::registry::{FlushSummary, RoomRegistry};
use crate::room::{ConnectionHandle, Room};
use crate::room_id::RoomId;
use crate::storage::{FileStorage, MemoryStorage};

const ANONYMOUS: &str = "anonymous";

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub malformed_messages: u64,
    pub rejected_joins: u64,
    pub dropped_connections: u64,
    pub active_rooms: usize,
    pub flushes: u64,
    pub flush_failures: u64,
}

#[derive(Default)]
struct Counters {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
    malformed_messages: AtomicU64,
    rejected_joins: AtomicU64,
    dropped_connections: AtomicU64,
}

struct Shared {
    config: ServerConfig,
    registry: Arc<RoomRegistry>,
    access: Arc<dyn AccessControl>,
    counters: Counters,
}

/// A room this connection has joined.
struct Joined {
    id: RoomId,
    room: Arc<Room>,
}

/// The sync server.
pub struct SyncServer {
    shared: Arc<Shared>,
    sweeper: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl SyncServer {
    pub fn new(
        config: ServerConfig,
        storage: Arc<dyn FileStorage>,
        access: Arc<dyn AccessControl>,
    ) -> Self {
        let bridge = PersistenceBridge::new(storage);
        let registry = Arc::new(RoomRegistry::new(bridge, config.room.clone()));
        Self {
            shared: Arc::new(Shared {
                config,
                registry,
                access,
                counters: Counters::default(),
            }),
            sweeper: parking_lot::Mutex::new(None),
        }
    }

    /// In-memory storage, everyone allowed. Development and tests.
    pub fn in_memory(config: ServerConfig) -> Self {
        Self::new(config, Arc::new(MemoryStorage::new()), Arc::new(AllowAll))
    }

    /// Bind `bind_addr` and serve until the listener fails.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        log::info!("Sync server listening on {}", listener.local_addr()?);
        self.start_sweeper();

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let shared = self.shared.clone();
            tokio::spawn(async move {
                shared.handle_connection(stream, addr).await;
            });
        }
    }

    fn start_sweeper(&self) {
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_none() {
            let interval = self.shared.config.sweep_interval();
            *sweeper = Some(self.shared.registry.spawn_sweeper(interval));
        }
    }

    /// Stop the idle sweeper and flush every dirty room.
    pub async fn shutdown(&self) -> FlushSummary {
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.abort();
        }
        log::info!("Sync server shutting down");
        self.shared.registry.flush_all().await
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.shared.registry
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    pub async fn stats(&self) -> ServerStats {
        let c = &self.shared.counters;
        let persistence = self.shared.registry.bridge().stats();
        ServerStats {
            total_connections: c.total_connections.load(Ordering::Relaxed),
            active_connections: c.active_connections.load(Ordering::Relaxed),
            total_messages: c.total_messages.load(Ordering::Relaxed),
            total_bytes: c.total_bytes.load(Ordering::Relaxed),
            malformed_messages: c.malformed_messages.load(Ordering::Relaxed),
            rejected_joins: c.rejected_joins.load(Ordering::Relaxed),
            dropped_connections: c.dropped_connections.load(Ordering::Relaxed),
            active_rooms: self.shared.registry.room_count().await,
            flushes: persistence.flushes,
            flush_failures: persistence.flush_failures,
        }
    }
}

impl Drop for SyncServer {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.get_mut().take() {
            sweeper.abort();
        }
    }
}

impl Shared {
    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let mut user = None;
        let handshake = tokio_tungstenite::accept_hdr_async(
            stream,
            |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                user = req
                    .headers()
                    .get(USER_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                Ok(resp)
            },
        )
        .await;
        let ws = match handshake {
            Ok(ws) => ws,
            Err(e) => {
                log::warn!("WebSocket handshake with {addr} failed: {e}");
                return;
            }
        };
        let user = user.unwrap_or_else(|| ANONYMOUS.to_string());
        let conn_id = Uuid::new_v4().to_string();
        log::info!("Connection {conn_id} ({user}) established from {addr}");

        self.counters.total_connections.fetch_add(1, Ordering::Relaxed);
        self.counters.active_connections.fetch_add(1, Ordering::Relaxed);

        let (conn, outbound) = ConnectionHandle::channel(&conn_id, user, self.config.outbound_capacity);
        let mut joined = HashMap::new();
        if let Err(e) = self.drive(ws, &conn, outbound, &mut joined).await {
            log::debug!("Connection {conn_id} ended with error: {e}");
        }

        conn.close();
        for (_, j) in joined.drain() {
            if let Err(e) = self.registry.leave(&j.id, conn.id()).await {
                log::error!("Cleanup of {conn_id} in {} failed: {e}", j.id);
            }
        }
        self.counters.active_connections.fetch_sub(1, Ordering::Relaxed);
        log::info!("Connection {conn_id} from {addr} closed");
    }

    async fn drive(
        &self,
        ws: tokio_tungstenite::WebSocketStream<TcpStream>,
        conn: &ConnectionHandle,
        mut outbound: tokio::sync::mpsc::Receiver<Arc<Vec<u8>>>,
        joined: &mut HashMap<String, Joined>,
    ) -> Result<(), tokio_tungstenite::tungstenite::Error> {
        let (mut ws_sender, mut ws_receiver) = ws.split();
        conn.send_message(&WireMessage::Welcome {
            connection_id: conn.id().to_string(),
        });

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval());
        heartbeat.tick().await;

        loop {
            tokio::select! {
                incoming = ws_receiver.next() => {
                    match incoming {
                        Some(Ok(Message::Binary(data))) => {
                            self.counters.total_messages.fetch_add(1, Ordering::Relaxed);
                            self.counters.total_bytes.fetch_add(data.len() as u64, Ordering::Relaxed);
                            match WireMessage::decode(&data) {
                                Ok(msg) => self.dispatch(conn, joined, msg).await,
                                Err(e) => {
                                    self.counters.malformed_messages.fetch_add(1, Ordering::Relaxed);
                                    log::warn!("Malformed frame from {}: {e}", conn.id());
                                    conn.send_message(&WireMessage::error(
                                        None,
                                        ErrorKind::MalformedPayload,
                                        e.to_string(),
                                    ));
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            log::warn!("WebSocket error from {}: {e}", conn.id());
                            break;
                        }
                    }
                }

                frame = outbound.recv() => {
                    let Some(frame) = frame else { break };
                    let bytes = Arc::try_unwrap(frame).unwrap_or_else(|shared| shared.as_ref().clone());
                    ws_sender.send(Message::Binary(bytes.into())).await?;
                }

                _ = conn.closed() => {
                    self.counters.dropped_connections.fetch_add(1, Ordering::Relaxed);
                    log::warn!("Connection {} dropped by its rooms", conn.id());
                    break;
                }

                _ = heartbeat.tick() => {
                    ws_sender.send(Message::Ping(Vec::new().into())).await?;
                }
            }
        }

        let _ = ws_sender.close().await;
        Ok(())
    }

    async fn dispatch(&self, conn: &ConnectionHandle, joined: &mut HashMap<String, Joined>, msg: WireMessage) {
        log::trace!("{} from {}", msg.msg_type(), conn.id());
        match msg {
            WireMessage::JoinRoom { room } => self.join(conn, joined, room).await,

            WireMessage::LeaveRoom { room } => {
                if let Some(j) = joined.remove(&room) {
                    if let Err(e) = self.registry.leave(&j.id, conn.id()).await {
                        log::error!("Leave of {room} by {} failed: {e}", conn.id());
                    }
                }
            }

            WireMessage::RequestSync { room } => {
                let Some(j) = joined.get(&room) else {
                    return not_joined(conn, room);
                };
                if let Err(e) = j.room.request_sync(conn.id()).await {
                    report(conn, room, &e);
                }
            }

            WireMessage::Update { room, update, .. } => {
                let Some(j) = joined.get(&room) else {
                    return not_joined(conn, room);
                };
                if let Err(e) = j.room.apply_update(conn.id(), &update).await {
                    report(conn, room, &e);
                }
            }

            WireMessage::AwarenessUpdate { room, update, .. } => {
                let Some(j) = joined.get(&room) else {
                    return not_joined(conn, room);
                };
                if let Err(e) = j.room.apply_presence(conn.id(), &update).await {
                    report(conn, room, &e);
                }
            }

            WireMessage::SaveFile { room } => {
                let Some(j) = joined.get(&room) else {
                    return not_joined(conn, room);
                };
                let result = j.room.save(conn.id()).await;
                conn.send_message(&WireMessage::SaveResult {
                    room,
                    ok: result.is_ok(),
                    error: result.err().map(|e| e.to_string()),
                });
            }

            WireMessage::Ping => {
                conn.send_message(&WireMessage::Pong);
            }

            other => {
                log::debug!("Ignoring {} from {}", other.msg_type(), conn.id());
            }
        }
    }

    async fn join(&self, conn: &ConnectionHandle, joined: &mut HashMap<String, Joined>, room: String) {
        if let Some(j) = joined.get(&room) {
            if let Err(e) = j.room.request_sync(conn.id()).await {
                report(conn, room, &e);
            }
            return;
        }

        let id = match RoomId::parse(&room) {
            Ok(id) => id,
            Err(e) => {
                log::warn!("{} asked to join invalid room: {e}", conn.id());
                conn.send_message(&WireMessage::error(Some(room), ErrorKind::MalformedPayload, e.to_string()));
                return;
            }
        };

        let level = self.access.access_level(id.session_id(), conn.user());
        let Some(level) = level.filter(|l| *l >= AccessLevel::Read) else {
            self.counters.rejected_joins.fetch_add(1, Ordering::Relaxed);
            log::warn!("{} ({}) denied access to {room}", conn.id(), conn.user());
            conn.send_message(&WireMessage::error(
                Some(room),
                ErrorKind::Unauthorized,
                "no access to this session",
            ));
            return;
        };

        match self.registry.join(&id, conn.clone().with_access(level)).await {
            Ok((handle, _)) => {
                joined.insert(room, Joined { id, room: handle });
            }
            Err(e) => {
                self.counters.rejected_joins.fetch_add(1, Ordering::Relaxed);
                log::warn!("Join of {room} by {} failed: {e}", conn.id());
                report(conn, room, &e);
            }
        }
    }
}

/// Error category reported to the client for a failed room operation.
fn error_kind(e: &RoomError) -> ErrorKind {
    match e {
        RoomError::ReadOnly(_) => ErrorKind::ReadOnly,
        RoomError::NotJoined(_) => ErrorKind::NotJoined,
        RoomError::Full { .. } => ErrorKind::RoomFull,
        RoomError::Crdt(_) | RoomError::Presence(_) | RoomError::Protocol(_) => ErrorKind::MalformedPayload,
        RoomError::Closed(_) | RoomError::Persistence(_) => ErrorKind::Internal,
    }
}

fn report(conn: &ConnectionHandle, room: String, e: &RoomError) {
    conn.send_message(&WireMessage::error(Some(room), error_kind(e), e.to_string()));
}

fn not_joined(conn: &ConnectionHandle, room: String) {
    log::debug!("{} addressed {room} without joining it", conn.id());
    conn.send_message(&WireMessage::error(Some(room), ErrorKind::NotJoined, "join the room first"));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CrdtError, PersistenceError, StorageError};
    use tokio::time::{timeout, Duration};

    async fn next_message(
        ws: &mut tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>,
    ) -> WireMessage {
        loop {
            let frame = timeout(Duration::from_secs(2), ws.next())
                .await
                .expect("timed out")
                .expect("stream ended")
                .expect("ws error");
            if let Message::Binary(data) = frame {
                return WireMessage::decode(&data).unwrap();
            }
        }
    }

    #[test]
    fn test_error_kind_mapping() {
        assert_eq!(error_kind(&RoomError::ReadOnly("c".into())), ErrorKind::ReadOnly);
        assert_eq!(
            error_kind(&RoomError::Full { room: "s-a".into(), limit: 1 }),
            ErrorKind::RoomFull
        );
        assert_eq!(
            error_kind(&RoomError::Crdt(CrdtError::MalformedUpdate("x".into()))),
            ErrorKind::MalformedPayload
        );
        assert_eq!(
            error_kind(&RoomError::Persistence(PersistenceError::Storage(StorageError::Backend("x".into())))),
            ErrorKind::Internal
        );
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = SyncServer::in_memory(ServerConfig::default());
        let stats = server.stats().await;
        assert_eq!(stats, ServerStats::default());
    }

    #[tokio::test]
    async fn test_welcome_then_join_sync_response() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(SyncServer::in_memory(ServerConfig::default()));
        let serving = server.clone();
        tokio::spawn(async move { serving.serve(listener).await });

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}")).await.unwrap();
        let WireMessage::Welcome { connection_id } = next_message(&mut ws).await else {
            panic!("expected welcome first");
        };
        assert!(!connection_id.is_empty());

        let join = WireMessage::JoinRoom { room: "s1-main.py".into() }.encode().unwrap();
        ws.send(Message::Binary(join.into())).await.unwrap();
        assert_eq!(
            next_message(&mut ws).await,
            WireMessage::SyncResponse { room: "s1-main.py".into(), content: None }
        );

        let ping = WireMessage::Ping.encode().unwrap();
        ws.send(Message::Binary(ping.into())).await.unwrap();
        assert_eq!(next_message(&mut ws).await, WireMessage::Pong);

        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 1);
        assert_eq!(stats.active_rooms, 1);
    }

    #[tokio::test]
    async fn test_update_before_join_is_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = SyncServer::in_memory(ServerConfig::default());
        tokio::spawn(async move { server.serve(listener).await });

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}")).await.unwrap();
        next_message(&mut ws).await;

        let update = WireMessage::update("s1-main.py", vec![1, 2, 3], "me").encode().unwrap();
        ws.send(Message::Binary(update.into())).await.unwrap();
        match next_message(&mut ws).await {
            WireMessage::Error { kind, fatal, .. } => {
                assert_eq!(kind, ErrorKind::NotJoined);
                assert!(!fatal);
            }
            other => panic!("expected error, got {other:?}"),
        }
    }
}
