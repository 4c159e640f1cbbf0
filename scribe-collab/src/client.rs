//! Client sync wrapper bridging a local [`Document`] to the sync server.
//!
//! Provides:
//! - Connection lifecycle as an explicit state machine ([`Lifecycle`])
//! - Exponential reconnect backoff with a bounded attempt count
//! - Local update relay with origin tagging, so server echoes are discarded
//! - Presence (cursor/selection) publishing and remote presence tracking
//! - Offline queue for edits made while not synced
//! - On every resync, a diff against the server's snapshot so nothing sent
//!   on a dropped connection is lost
//!
//! ```text
//! Disconnected ─► Connecting ─► Joined ─► Synced
//!                     ▲                      │ transport lost
//!                     └──── Retrying(n) ◄────┘
//!                               │
//!                               ├─► Exhausted   (attempt budget spent)
//!                               └─► Failed      (authorization failure)
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

use crate::config::ClientConfig;
use crate::crdt::Document;
use crate::error::{CrdtError, TransportError};
use crate::events::{EventBus, Subscription};
use crate::presence::{
    CursorPosition, PresenceEntry, PresenceEvent, PresenceRecord, PresenceSet, SelectionRange,
};
use crate::protocol::{ErrorKind, WireMessage, USER_HEADER};

// ───────────────────────────────────────────────────────────────────
// Backoff and lifecycle
// ───────────────────────────────────────────────────────────────────

/// Reconnect delays: `base_delay * 2^attempt`, capped at `max_delay`, for at
/// most `max_attempts` attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl BackoffPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self { base_delay, max_delay, max_attempts }
    }

    /// Delay before retry number `attempt` (zero based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay)
    }
}

/// Client connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStatus {
    Disconnected,
    Connecting,
    /// Join sent, initial snapshot not yet applied.
    Joined,
    Synced,
    Retrying { attempt: u32 },
    /// Reconnect budget spent. Terminal.
    Exhausted,
    /// Fatal error such as an authorization failure. Terminal.
    Failed,
    Destroyed,
}

impl ClientStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ClientStatus::Exhausted | ClientStatus::Failed | ClientStatus::Destroyed)
    }
}

/// What to do after losing the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    Retry { attempt: u32, delay: Duration },
    Exhausted { attempts: u32 },
    Fatal,
    /// Already terminal; nothing to do.
    Ignored,
}

/// Connection state machine. Holds the retry counter so that reconnect
/// behavior can be driven without a network.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    status: ClientStatus,
    attempts: u32,
    synced_before: bool,
    policy: BackoffPolicy,
}

impl Lifecycle {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            status: ClientStatus::Disconnected,
            attempts: 0,
            synced_before: false,
            policy,
        }
    }

    pub fn status(&self) -> ClientStatus {
        self.status
    }

    /// Reconnect attempts made since the last successful sync.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// True once any connection has reached `Synced`.
    pub fn synced_before(&self) -> bool {
        self.synced_before
    }

    /// Enter `Connecting`. False once terminal.
    pub fn begin_connect(&mut self) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = ClientStatus::Connecting;
        true
    }

    pub fn joined(&mut self) {
        if self.status == ClientStatus::Connecting {
            self.status = ClientStatus::Joined;
        }
    }

    /// Enter `Synced` and reset the retry budget. True only on the
    /// transition itself, so the initial snapshot is handled once per
    /// connection.
    pub fn synced(&mut self) -> bool {
        if self.status != ClientStatus::Joined {
            return false;
        }
        self.status = ClientStatus::Synced;
        self.attempts = 0;
        self.synced_before = true;
        true
    }

    pub fn transport_lost(&mut self, error: &TransportError) -> Recovery {
        if self.status.is_terminal() {
            return Recovery::Ignored;
        }
        if error.is_fatal() {
            self.status = ClientStatus::Failed;
            return Recovery::Fatal;
        }
        if self.attempts >= self.policy.max_attempts {
            self.status = ClientStatus::Exhausted;
            return Recovery::Exhausted { attempts: self.attempts };
        }
        let delay = self.policy.delay_for(self.attempts);
        self.attempts += 1;
        self.status = ClientStatus::Retrying { attempt: self.attempts };
        Recovery::Retry { attempt: self.attempts, delay }
    }

    /// Enter `Destroyed`. True the first time only.
    pub fn destroy(&mut self) -> bool {
        if self.status == ClientStatus::Destroyed {
            return false;
        }
        self.status = ClientStatus::Destroyed;
        true
    }
}

// ───────────────────────────────────────────────────────────────────
// Events
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
}

/// Events emitted by the sync client, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Status(ConnectionStatus),
    /// Initial snapshot applied; local edits now flow live.
    Synced,
    ConnectionError(String),
    Reconnecting { attempt: u32, delay: Duration },
    MaxReconnectAttempts { attempts: u32 },
    FatalError(String),
    /// Non-fatal error reported by the server.
    ServerError { kind: ErrorKind, message: String },
    SaveResult { ok: bool, error: Option<String> },
}

// ───────────────────────────────────────────────────────────────────
// Offline queue
// ───────────────────────────────────────────────────────────────────

/// What to send once synced again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Replay {
    Updates(Vec<Vec<u8>>),
    /// The queue overflowed; send the full document state instead.
    FullState,
}

/// Bounded queue of local updates made while not synced.
#[derive(Debug)]
pub struct OfflineQueue {
    updates: VecDeque<Vec<u8>>,
    capacity: usize,
    overflowed: bool,
}

impl OfflineQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            updates: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            overflowed: false,
        }
    }

    /// Queue an update. On overflow the queued updates are discarded and the
    /// next replay becomes a full-state send.
    pub fn push(&mut self, update: Vec<u8>) -> bool {
        if self.overflowed {
            return false;
        }
        if self.updates.len() >= self.capacity {
            log::warn!("Offline queue full ({} updates), falling back to full state", self.capacity);
            self.updates.clear();
            self.overflowed = true;
            return false;
        }
        self.updates.push_back(update);
        true
    }

    /// Force the next replay to send the full state.
    pub fn require_full_state(&mut self) {
        self.updates.clear();
        self.overflowed = true;
    }

    pub fn take(&mut self) -> Replay {
        if std::mem::take(&mut self.overflowed) {
            Replay::FullState
        } else {
            Replay::Updates(self.updates.drain(..).collect())
        }
    }

    pub fn len(&self) -> usize {
        self.updates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty() && !self.overflowed
    }

    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    pub fn total_bytes(&self) -> usize {
        self.updates.iter().map(Vec::len).sum()
    }
}

// ───────────────────────────────────────────────────────────────────
// Sync client
// ───────────────────────────────────────────────────────────────────

/// How a newly synced session brings the server up to date.
enum CatchUp<'a> {
    /// First sync: replay the offline queue.
    Queue,
    /// Resync: diff the document against the server's snapshot. Updates
    /// sent on a dying connection may never have arrived, so the queue
    /// alone is not enough.
    Diff(Option<&'a [u8]>),
}

/// Where local updates go: straight to the session while synced,
/// otherwise into the offline queue.
struct Link {
    outbound: Option<mpsc::UnboundedSender<WireMessage>>,
    queue: OfflineQueue,
}

struct Inner {
    config: ClientConfig,
    document: Document,
    lifecycle: Mutex<Lifecycle>,
    status: watch::Sender<ClientStatus>,
    connection_id: Mutex<Option<String>>,
    link: Mutex<Link>,
    presence: Mutex<PresenceSet>,
    local_presence: Mutex<PresenceEntry>,
    events: EventBus<ClientEvent>,
}

/// The sync client.
///
/// Owns a background driver task that connects, joins the configured room,
/// relays updates both ways and reconnects with backoff. Dropping the
/// client destroys it.
pub struct SyncClient {
    inner: Arc<Inner>,
    shutdown: watch::Sender<bool>,
    driver: Mutex<Option<JoinHandle<()>>>,
    local_updates: Mutex<Option<yrs::Subscription>>,
}

impl SyncClient {
    /// Create a client for `document` and register its local update
    /// listener. Nothing connects until [`connect`](Self::connect).
    pub fn new(config: ClientConfig, document: Document) -> Result<Self, CrdtError> {
        let mut queue = OfflineQueue::new(config.offline_queue_capacity);
        if !document.is_empty() {
            queue.require_full_state();
        }
        let local_presence = PresenceEntry::new(config.display_name.clone(), &config.user);
        let (status, _) = watch::channel(ClientStatus::Disconnected);
        let inner = Arc::new(Inner {
            lifecycle: Mutex::new(Lifecycle::new(config.backoff)),
            config,
            document,
            status,
            connection_id: Mutex::new(None),
            link: Mutex::new(Link { outbound: None, queue }),
            presence: Mutex::new(PresenceSet::new()),
            local_presence: Mutex::new(local_presence),
            events: EventBus::new(),
        });

        let weak: Weak<Inner> = Arc::downgrade(&inner);
        let subscription = inner.document.observe_local_updates(move |update| {
            if let Some(inner) = weak.upgrade() {
                inner.on_local_update(update);
            }
        })?;

        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            inner,
            shutdown,
            driver: Mutex::new(None),
            local_updates: Mutex::new(Some(subscription)),
        })
    }

    /// Create, subscribe and connect in one step, so no event is missed.
    pub fn start(config: ClientConfig, document: Document) -> Result<(Self, Subscription<ClientEvent>), CrdtError> {
        let client = Self::new(config, document)?;
        let events = client.subscribe();
        client.connect();
        Ok((client, events))
    }

    /// Spawn the connection driver. No-op if already running or destroyed.
    pub fn connect(&self) {
        let mut driver = self.driver.lock();
        if driver.is_some() || self.status() == ClientStatus::Destroyed {
            return;
        }
        let inner = self.inner.clone();
        let shutdown = self.shutdown.subscribe();
        *driver = Some(tokio::spawn(drive(inner, shutdown)));
    }

    pub fn subscribe(&self) -> Subscription<ClientEvent> {
        self.inner.events.subscribe()
    }

    /// Cursor add/update/remove notifications for remote participants.
    pub fn subscribe_presence(&self) -> Subscription<PresenceEvent> {
        self.inner.presence.lock().subscribe()
    }

    pub fn document(&self) -> &Document {
        &self.inner.document
    }

    pub fn status(&self) -> ClientStatus {
        *self.inner.status.borrow()
    }

    /// Resolves once `pred` holds for the current status.
    pub async fn wait_for_status(&self, pred: impl FnMut(&ClientStatus) -> bool) -> ClientStatus {
        let mut rx = self.inner.status.subscribe();
        match rx.wait_for(pred).await {
            Ok(status) => *status,
            Err(_) => self.status(),
        }
    }

    /// Server-assigned id of the current connection.
    pub fn connection_id(&self) -> Option<String> {
        self.inner.connection_id.lock().clone()
    }

    pub fn remote_presence(&self) -> Vec<PresenceRecord> {
        self.inner.presence.lock().remote_entries()
    }

    /// Reconnect attempts since the last successful sync.
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.lifecycle.lock().attempts()
    }

    pub fn offline_queue_len(&self) -> usize {
        self.inner.link.lock().queue.len()
    }

    /// Replace the local presence entry and publish it if synced.
    pub fn set_presence(&self, entry: PresenceEntry) {
        *self.inner.local_presence.lock() = entry;
        self.inner.publish_presence();
    }

    /// Move the local cursor and selection.
    pub fn update_cursor(&self, cursor: Option<CursorPosition>, selection: Option<SelectionRange>) {
        {
            let mut entry = self.inner.local_presence.lock();
            entry.cursor = cursor;
            entry.selection = selection;
        }
        self.inner.publish_presence();
    }

    /// Ask the server for a fresh snapshot.
    pub fn request_sync(&self) -> Result<(), TransportError> {
        self.inner.send(WireMessage::RequestSync { room: self.inner.config.room.clone() })
    }

    /// Ask the server to persist the document now. The outcome arrives as
    /// [`ClientEvent::SaveResult`].
    pub fn save(&self) -> Result<(), TransportError> {
        self.inner.send(WireMessage::SaveFile { room: self.inner.config.room.clone() })
    }

    /// Stop syncing and detach every listener. Safe to call repeatedly and
    /// while a reconnect is pending; only the first call has an effect.
    pub fn destroy(&self) -> bool {
        if !self.inner.transition(Lifecycle::destroy) {
            return false;
        }
        log::info!("Sync client for {} destroyed", self.inner.config.room);
        let _ = self.shutdown.send(true);

        drop(self.local_updates.lock().take());
        self.inner.link.lock().outbound = None;
        self.inner.events.clear();
        true
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl Inner {
    /// Run `f` on the lifecycle and publish the resulting status.
    fn transition<R>(&self, f: impl FnOnce(&mut Lifecycle) -> R) -> R {
        let mut lifecycle = self.lifecycle.lock();
        let result = f(&mut lifecycle);
        self.status.send_replace(lifecycle.status());
        result
    }

    fn emit(&self, event: ClientEvent) {
        self.events.emit(event);
    }

    /// Called from inside the committing transaction; must not touch the
    /// document.
    fn on_local_update(&self, update: Vec<u8>) {
        let mut link = self.link.lock();
        if let Some(outbound) = &link.outbound {
            let origin = self.connection_id.lock().clone().unwrap_or_default();
            if outbound.send(WireMessage::update(&self.config.room, update.clone(), origin)).is_ok() {
                return;
            }
            link.outbound = None;
        }
        link.queue.push(update);
    }

    fn send(&self, msg: WireMessage) -> Result<(), TransportError> {
        let link = self.link.lock();
        let outbound = link.outbound.as_ref().ok_or(TransportError::Closed)?;
        outbound.send(msg).map_err(|_| TransportError::Closed)
    }

    fn publish_presence(&self) {
        let Some(conn_id) = self.connection_id.lock().clone() else {
            return;
        };
        let entry = self.local_presence.lock().clone();
        let diff = self.presence.lock().set(&conn_id, entry);
        match diff.encode() {
            Ok(bytes) => {
                let _ = self.send(WireMessage::awareness(&self.config.room, bytes, conn_id));
            }
            Err(e) => log::error!("Failed to encode local presence: {e}"),
        }
    }

    /// One connection: connect, wait for `welcome`, join, then relay until
    /// the transport fails. `Ok` means shutdown was requested.
    async fn run_session(&self, shutdown: &mut watch::Receiver<bool>) -> Result<(), TransportError> {
        let mut request = self.config.server_url.as_str().into_client_request()?;
        let user = HeaderValue::from_str(&self.config.user)
            .map_err(|e| TransportError::Io(format!("invalid user header: {e}")))?;
        request.headers_mut().insert(USER_HEADER, user);

        let connect = tokio::time::timeout(
            self.config.connect_timeout,
            tokio_tungstenite::connect_async(request),
        );
        let (ws, _) = tokio::select! {
            result = connect => result.map_err(|_| TransportError::Timeout)??,
            _ = shutdown.changed() => return Ok(()),
        };
        log::info!("Connected to {}", self.config.server_url);

        let (mut sink, mut stream) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<WireMessage>();

        loop {
            tokio::select! {
                frame = stream.next() => {
                    match frame {
                        Some(Ok(Message::Binary(data))) => match WireMessage::decode(&data) {
                            Ok(msg) => self.handle_message(msg, &tx)?,
                            Err(e) => log::warn!("Malformed frame from server: {e}"),
                        },
                        Some(Ok(Message::Close(_))) | None => return Err(TransportError::Closed),
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                    }
                }

                msg = rx.recv() => {
                    let Some(msg) = msg else { return Err(TransportError::Closed) };
                    sink.send(Message::Binary(msg.encode()?.into())).await?;
                }

                _ = shutdown.changed() => {
                    let leave = WireMessage::LeaveRoom { room: self.config.room.clone() };
                    if let Ok(bytes) = leave.encode() {
                        let _ = sink.send(Message::Binary(bytes.into())).await;
                    }
                    let _ = sink.close().await;
                    return Ok(());
                }
            }
        }
    }

    fn handle_message(
        &self,
        msg: WireMessage,
        tx: &mpsc::UnboundedSender<WireMessage>,
    ) -> Result<(), TransportError> {
        if msg.room().is_some_and(|room| room != self.config.room) && !matches!(msg, WireMessage::Error { .. }) {
            log::debug!("Ignoring {} for another room", msg.msg_type());
            return Ok(());
        }

        match msg {
            WireMessage::Welcome { connection_id } => {
                log::debug!("Assigned connection id {connection_id}");
                *self.connection_id.lock() = Some(connection_id.clone());
                self.presence.lock().set_local_id(connection_id);
                tx.send(WireMessage::JoinRoom { room: self.config.room.clone() })
                    .map_err(|_| TransportError::Closed)?;
                self.transition(Lifecycle::joined);
                self.emit(ClientEvent::Status(ConnectionStatus::Connected));
            }

            WireMessage::SyncResponse { content, .. } => {
                if let Some(bytes) = &content {
                    if let Err(e) = self.document.apply_remote_update(bytes) {
                        log::warn!("Snapshot for {} rejected: {e}", self.config.room);
                    }
                }
                let resync = self.lifecycle.lock().synced_before();
                if self.transition(Lifecycle::synced) {
                    let catch_up = if resync { CatchUp::Diff(content.as_deref()) } else { CatchUp::Queue };
                    self.go_live(tx, catch_up);
                }
            }

            WireMessage::Update { update, origin, .. } => {
                if self.is_own(&origin) {
                    log::trace!("Discarding echo of own update");
                    return Ok(());
                }
                if let Err(e) = self.document.apply_remote_update(&update) {
                    log::warn!("Remote update from {origin} rejected: {e}");
                }
            }

            WireMessage::AwarenessUpdate { update, origin, .. } => {
                if self.is_own(&origin) {
                    return Ok(());
                }
                if let Err(e) = self.presence.lock().apply_bytes(&update) {
                    log::warn!("Presence from {origin} rejected: {e}");
                }
            }

            WireMessage::SaveResult { ok, error, .. } => {
                self.emit(ClientEvent::SaveResult { ok, error });
            }

            WireMessage::Error { kind, fatal, message, .. } => {
                if fatal {
                    return Err(TransportError::Unauthorized(message));
                }
                log::warn!("Server reported {kind:?}: {message}");
                self.emit(ClientEvent::ServerError { kind, message });
            }

            other => log::trace!("Ignoring {}", other.msg_type()),
        }
        Ok(())
    }

    fn is_own(&self, origin: &str) -> bool {
        self.connection_id.lock().as_deref() == Some(origin)
    }

    /// Route local updates to the session and send the server what it
    /// lacks.
    fn go_live(&self, tx: &mpsc::UnboundedSender<WireMessage>, catch_up: CatchUp<'_>) {
        let origin = self.connection_id.lock().clone().unwrap_or_default();
        let replay = {
            let mut link = self.link.lock();
            link.outbound = Some(tx.clone());
            link.queue.take()
        };

        // The document is read only after the link is live, so an edit made
        // meanwhile is either in the diff or sent directly.
        let pending = match (catch_up, replay) {
            (CatchUp::Diff(snapshot), _) => match self.document.missing_from(snapshot) {
                Ok(diff) => diff.into_iter().collect(),
                Err(e) => {
                    log::warn!("Cannot diff against snapshot of {}: {e}", self.config.room);
                    vec![self.document.encode_state()]
                }
            },
            (CatchUp::Queue, Replay::Updates(updates)) => updates,
            (CatchUp::Queue, Replay::FullState) => vec![self.document.encode_state()],
        };
        if !pending.is_empty() {
            log::info!("Sending {} catch-up updates to {}", pending.len(), self.config.room);
        }
        for update in pending {
            let _ = tx.send(WireMessage::update(&self.config.room, update, origin.clone()));
        }

        log::info!("Synced {}", self.config.room);
        self.emit(ClientEvent::Synced);
        self.publish_presence();
    }

    /// Tear down per-connection state after the transport is gone.
    fn end_session(&self) {
        self.link.lock().outbound = None;
        self.presence.lock().clear_remote();
        *self.connection_id.lock() = None;
    }
}

/// Connection driver: one session after another until a terminal state.
async fn drive(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() || !inner.transition(Lifecycle::begin_connect) {
            return;
        }
        inner.emit(ClientEvent::Status(ConnectionStatus::Connecting));

        let result = inner.run_session(&mut shutdown).await;
        inner.end_session();
        if *shutdown.borrow() {
            return;
        }
        inner.emit(ClientEvent::Status(ConnectionStatus::Disconnected));

        let error = result.err().unwrap_or(TransportError::Closed);
        match inner.transition(|l| l.transport_lost(&error)) {
            Recovery::Retry { attempt, delay } => {
                log::info!(
                    "Connection to {} lost ({error}), retry {attempt} in {delay:?}",
                    inner.config.server_url
                );
                inner.emit(ClientEvent::ConnectionError(error.to_string()));
                inner.emit(ClientEvent::Reconnecting { attempt, delay });
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => return,
                }
            }
            Recovery::Exhausted { attempts } => {
                log::error!("Giving up on {} after {attempts} attempts", inner.config.server_url);
                inner.emit(ClientEvent::ConnectionError(error.to_string()));
                inner.emit(ClientEvent::MaxReconnectAttempts { attempts });
                return;
            }
            Recovery::Fatal => {
                log::error!("Fatal error from {}: {error}", inner.config.server_url);
                inner.emit(ClientEvent::FatalError(error.to_string()));
                return;
            }
            Recovery::Ignored => return,
        }
    }
}
