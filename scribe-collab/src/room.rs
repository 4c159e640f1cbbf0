//! One collaborative file: live document, presence set and connections.
//!
//! ```text
//! Connection A ──update──► Room::apply_update ──► Document (yrs)
//!                               │
//!                               ├── fan-out (try_send) ──► Connection B
//!                               │                    └──► Connection C
//!                               │
//!                               └── flush signal ──► debounce worker ──► PersistenceBridge
//! ```
//!
//! All state sits behind one async mutex, and handlers never await while
//! holding it; the first snapshot is read from storage before the lock is
//! taken. The order in which the room applies updates is therefore the
//! order every connection sees them.
//! Fan-out uses bounded per-connection queues; a connection whose queue is
//! full or closed is dropped from the room instead of stalling the others.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;

use crate::access::AccessLevel;
use crate::config::RoomConfig;
use crate::crdt::Document;
use crate::error::RoomError;
use crate::persistence::PersistenceBridge;
use crate::presence::{PresenceDiff, PresenceSet};
use crate::protocol::WireMessage;
use crate::room_id::RoomId;
use crate::storage::FileMetadata;

/// Origin used for frames the room itself produces.
pub const SERVER_ORIGIN: &str = "scribe-server";

/// Actor recorded on flushes when no editor is known.
const SYSTEM_ACTOR: &str = "scribe";

// ───────────────────────────────────────────────────────────────────
// Connection handle
// ───────────────────────────────────────────────────────────────────

/// Server-side end of one client connection, as seen by rooms.
///
/// Frames are pushed into a bounded queue drained by the connection's
/// writer task. Once a send fails the handle is dead for good.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: String,
    user: String,
    access: AccessLevel,
    outbound: mpsc::Sender<Arc<Vec<u8>>>,
    live: Arc<AtomicBool>,
    dropped: Arc<Notify>,
}

impl ConnectionHandle {
    /// Create a handle and the receiver its writer task drains.
    pub fn channel(
        id: impl Into<String>,
        user: impl Into<String>,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<Arc<Vec<u8>>>) {
        let (outbound, rx) = mpsc::channel(capacity.max(1));
        let handle = Self {
            id: id.into(),
            user: user.into(),
            access: AccessLevel::Write,
            outbound,
            live: Arc::new(AtomicBool::new(true)),
            dropped: Arc::new(Notify::new()),
        };
        (handle, rx)
    }

    pub fn with_access(mut self, access: AccessLevel) -> Self {
        self.access = access;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn access(&self) -> AccessLevel {
        self.access
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Queue a frame without waiting. Returns false and marks the handle
    /// dead if the queue is full or closed.
    pub fn send(&self, frame: Arc<Vec<u8>>) -> bool {
        if !self.is_live() {
            return false;
        }
        match self.outbound.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::warn!("Connection {} is not keeping up, dropping it", self.id);
                self.close();
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.close();
                false
            }
        }
    }

    pub fn send_message(&self, msg: &WireMessage) -> bool {
        match msg.encode() {
            Ok(bytes) => self.send(Arc::new(bytes)),
            Err(e) => {
                log::error!("Failed to encode {} for {}: {e}", msg.msg_type(), self.id);
                false
            }
        }
    }

    /// Mark dead and wake whoever waits in [`closed`](Self::closed).
    pub fn close(&self) {
        if self.live.swap(false, Ordering::AcqRel) {
            self.dropped.notify_one();
        }
    }

    /// Resolves once the handle is dead.
    pub async fn closed(&self) {
        if !self.is_live() {
            return;
        }
        self.dropped.notified().await;
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("user", &self.user)
            .field("access", &self.access)
            .field("live", &self.is_live())
            .finish()
    }
}

// ───────────────────────────────────────────────────────────────────
// Outcomes and stats
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    /// Full encoded state; `None` for an empty document.
    pub content: Option<Vec<u8>>,
    pub connections: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceOutcome {
    Relayed { recipients: usize },
    /// Nothing new (stale or duplicate diff).
    Unchanged,
    /// Malformed diff answered with a full-state broadcast.
    Resynced { recipients: usize },
    /// Malformed diff dropped because the resync budget is spent.
    Suppressed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaveOutcome {
    pub removed: bool,
    pub remaining: usize,
    /// A snapshot was written because the room became empty.
    pub flushed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    Debounced,
    LastLeave,
    Explicit,
    Sweep,
    Shutdown,
}

impl std::fmt::Display for FlushReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FlushReason::Debounced => "debounced",
            FlushReason::LastLeave => "last-leave",
            FlushReason::Explicit => "explicit",
            FlushReason::Sweep => "sweep",
            FlushReason::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomStats {
    pub connections: usize,
    pub presence_entries: usize,
    pub dirty: bool,
    pub updates_applied: u64,
    pub updates_rejected: u64,
    pub presence_resyncs: u64,
    pub flushes: u64,
    pub flush_failures: u64,
    pub dropped_connections: u64,
}

#[derive(Default)]
struct RoomCounters {
    updates_applied: AtomicU64,
    updates_rejected: AtomicU64,
    presence_resyncs: AtomicU64,
    flushes: AtomicU64,
    flush_failures: AtomicU64,
    dropped_connections: AtomicU64,
}

/// Sliding-window cap on full presence resyncs.
struct ResyncLimiter {
    limit: usize,
    window: Duration,
    recent: VecDeque<Instant>,
}

impl ResyncLimiter {
    fn new(limit: usize, window: Duration) -> Self {
        Self { limit, window, recent: VecDeque::new() }
    }

    fn allow(&mut self, now: Instant) -> bool {
        while self
            .recent
            .front()
            .is_some_and(|t| now.duration_since(*t) >= self.window)
        {
            self.recent.pop_front();
        }
        if self.recent.len() >= self.limit {
            return false;
        }
        self.recent.push_back(now);
        true
    }
}

// ───────────────────────────────────────────────────────────────────
// Room
// ───────────────────────────────────────────────────────────────────

struct RoomState {
    /// `None` until the first join loads the snapshot.
    document: Option<Document>,
    presence: PresenceSet,
    connections: HashMap<String, ConnectionHandle>,
    /// Holds changes not yet handed to storage.
    dirty: bool,
    last_editor: Option<String>,
    flushes_in_flight: usize,
    closed: bool,
    empty_since: Option<Instant>,
    resync: ResyncLimiter,
}

pub struct Room {
    id: RoomId,
    name: String,
    config: RoomConfig,
    bridge: PersistenceBridge,
    state: Mutex<RoomState>,
    flush_lock: Mutex<()>,
    flush_signal: Arc<Notify>,
    worker: parking_lot::Mutex<Option<JoinHandle<()>>>,
    counters: RoomCounters,
}

impl Room {
    /// Construct without touching storage; the snapshot loads on first join.
    pub fn new(id: RoomId, config: RoomConfig, bridge: PersistenceBridge) -> Self {
        let resync = ResyncLimiter::new(
            config.presence_resync_limit,
            config.presence_resync_window(),
        );
        Self {
            name: id.to_string(),
            id,
            config,
            bridge,
            state: Mutex::new(RoomState {
                document: None,
                presence: PresenceSet::new(),
                connections: HashMap::new(),
                dirty: false,
                last_editor: None,
                flushes_in_flight: 0,
                closed: false,
                empty_since: Some(Instant::now()),
                resync,
            }),
            flush_lock: Mutex::new(()),
            flush_signal: Arc::new(Notify::new()),
            worker: parking_lot::Mutex::new(None),
            counters: RoomCounters::default(),
        }
    }

    pub fn id(&self) -> &RoomId {
        &self.id
    }

    /// Register `conn` and queue the current snapshot to it.
    ///
    /// The joiner receives `sync-response` first, then the presence of the
    /// other participants if there is any. Nothing is broadcast.
    pub async fn join(self: &Arc<Self>, conn: ConnectionHandle) -> Result<JoinOutcome, RoomError> {
        let needs_load = {
            let state = self.state.lock().await;
            if state.closed {
                return Err(RoomError::Closed(self.name.clone()));
            }
            state.document.is_none()
        };
        // Concurrent first joins may each read storage; the first to
        // re-acquire the lock installs its copy.
        let loaded = if needs_load {
            Some(self.bridge.load(&self.id).await?)
        } else {
            None
        };

        let mut state = self.state.lock().await;
        if state.closed {
            return Err(RoomError::Closed(self.name.clone()));
        }
        if state.connections.len() >= self.config.max_peers
            && !state.connections.contains_key(conn.id())
        {
            return Err(RoomError::Full {
                room: self.name.clone(),
                limit: self.config.max_peers,
            });
        }

        if state.document.is_none() {
            if let Some(snapshot) = loaded {
                let document = Document::from_snapshot(snapshot.bytes())?;
                log::info!(
                    "Room {} loaded ({} bytes stored)",
                    self.name,
                    snapshot.bytes().len()
                );
                state.document = Some(document);
            }
        }
        let content = state
            .document
            .as_ref()
            .filter(|doc| !doc.is_empty())
            .map(Document::encode_state);

        conn.send_message(&WireMessage::SyncResponse {
            room: self.name.clone(),
            content: content.clone(),
        });
        if !state.presence.is_empty() {
            let bootstrap = state.presence.encode_full()?;
            conn.send_message(&WireMessage::awareness(&self.name, bootstrap, SERVER_ORIGIN));
        }

        log::info!("{} ({}) joined {}", conn.id(), conn.user(), self.name);
        state.connections.insert(conn.id().to_string(), conn);
        state.empty_since = None;
        let connections = state.connections.len();
        drop(state);

        self.ensure_worker();
        Ok(JoinOutcome { content, connections })
    }

    /// Apply a CRDT update from `conn_id` and relay it to everyone else.
    ///
    /// Malformed bytes are rejected without touching the document or any
    /// other connection. Returns the number of connections that got the
    /// update.
    pub async fn apply_update(&self, conn_id: &str, update: &[u8]) -> Result<usize, RoomError> {
        let mut state = self.state.lock().await;
        let conn = state
            .connections
            .get(conn_id)
            .ok_or_else(|| RoomError::NotJoined(conn_id.to_string()))?;
        if !conn.access().can_write() {
            self.counters.updates_rejected.fetch_add(1, Ordering::Relaxed);
            return Err(RoomError::ReadOnly(conn_id.to_string()));
        }
        let editor = conn.user().to_string();

        let document = state
            .document
            .as_ref()
            .ok_or_else(|| RoomError::NotJoined(conn_id.to_string()))?;
        if let Err(e) = document.apply_update(update) {
            self.counters.updates_rejected.fetch_add(1, Ordering::Relaxed);
            log::warn!("Rejected update from {conn_id} in {}: {e}", self.name);
            return Err(e.into());
        }
        self.counters.updates_applied.fetch_add(1, Ordering::Relaxed);

        state.dirty = true;
        state.last_editor = Some(editor);

        let frame = Arc::new(WireMessage::update(&self.name, update.to_vec(), conn_id).encode()?);
        let recipients = self.fan_out(&mut state, &frame, Some(conn_id));
        drop(state);

        self.flush_signal.notify_one();
        Ok(recipients)
    }

    /// Merge a presence diff from `conn_id` and relay what changed.
    ///
    /// A diff that fails to decode triggers a full presence broadcast to
    /// every connection, at most `presence_resync_limit` times per window.
    pub async fn apply_presence(&self, conn_id: &str, bytes: &[u8]) -> Result<PresenceOutcome, RoomError> {
        let mut state = self.state.lock().await;
        if !state.connections.contains_key(conn_id) {
            return Err(RoomError::NotJoined(conn_id.to_string()));
        }

        match PresenceDiff::decode(bytes) {
            Ok(diff) => {
                let own = diff.restricted_to(conn_id);
                let change = state.presence.apply_diff(&own)?;
                if change.is_empty() {
                    return Ok(PresenceOutcome::Unchanged);
                }
                let relay = state.presence.diff_for(&change).encode()?;
                let frame = Arc::new(WireMessage::awareness(&self.name, relay, conn_id).encode()?);
                let recipients = self.fan_out(&mut state, &frame, Some(conn_id));
                Ok(PresenceOutcome::Relayed { recipients })
            }
            Err(e) => {
                log::warn!("Malformed presence from {conn_id} in {}: {e}", self.name);
                if !state.resync.allow(Instant::now()) {
                    log::warn!("Presence resync limit reached in {}, dropping diff", self.name);
                    return Ok(PresenceOutcome::Suppressed);
                }
                self.counters.presence_resyncs.fetch_add(1, Ordering::Relaxed);
                let full = state.presence.encode_full()?;
                let frame = Arc::new(WireMessage::awareness(&self.name, full, SERVER_ORIGIN).encode()?);
                let recipients = self.fan_out(&mut state, &frame, None);
                Ok(PresenceOutcome::Resynced { recipients })
            }
        }
    }

    /// Queue a fresh `sync-response` to `conn_id`.
    pub async fn request_sync(&self, conn_id: &str) -> Result<Option<Vec<u8>>, RoomError> {
        let state = self.state.lock().await;
        let conn = state
            .connections
            .get(conn_id)
            .ok_or_else(|| RoomError::NotJoined(conn_id.to_string()))?;
        let content = state
            .document
            .as_ref()
            .filter(|doc| !doc.is_empty())
            .map(Document::encode_state);
        conn.send_message(&WireMessage::SyncResponse {
            room: self.name.clone(),
            content: content.clone(),
        });
        Ok(content)
    }

    /// Remove `conn_id` and its presence. When the room becomes empty the
    /// pending changes are flushed right away. The flush only writes when
    /// the room holds changes that are not yet durable, so the last leave
    /// of a clean room writes nothing.
    ///
    /// Leaving twice is a no-op.
    pub async fn leave(&self, conn_id: &str) -> Result<LeaveOutcome, RoomError> {
        let (removed, remaining) = {
            let mut state = self.state.lock().await;
            let removed = state.connections.remove(conn_id).is_some();
            if removed {
                log::info!("{conn_id} left {}", self.name);
                self.broadcast_removal(&mut state, conn_id);
            }
            if state.connections.is_empty() && state.empty_since.is_none() {
                state.empty_since = Some(Instant::now());
            }
            (removed, state.connections.len())
        };

        let mut flushed = false;
        if remaining == 0 {
            match self.flush(FlushReason::LastLeave).await {
                Ok(meta) => flushed = meta.is_some(),
                Err(e) => log::error!("Flush of {} after last leave failed: {e}", self.name),
            }
        }
        Ok(LeaveOutcome { removed, remaining, flushed })
    }

    /// Hand the current state to storage if it has unsaved changes.
    ///
    /// Explicit flushes write even when clean. On failure the room stays
    /// dirty so a later flush retries.
    pub async fn flush(&self, reason: FlushReason) -> Result<Option<FileMetadata>, RoomError> {
        self.flush_as(reason, None).await
    }

    async fn flush_as(
        &self,
        reason: FlushReason,
        actor: Option<&str>,
    ) -> Result<Option<FileMetadata>, RoomError> {
        let _serial = self.flush_lock.lock().await;

        let (bytes, actor) = {
            let mut state = self.state.lock().await;
            let Some(document) = state.document.as_ref() else {
                return Ok(None);
            };
            if !state.dirty && reason != FlushReason::Explicit {
                return Ok(None);
            }
            let bytes = document.encode_state();
            let actor = actor
                .map(str::to_string)
                .or_else(|| state.last_editor.clone())
                .unwrap_or_else(|| SYSTEM_ACTOR.to_string());
            state.dirty = false;
            state.flushes_in_flight += 1;
            (bytes, actor)
        };

        let result = self.bridge.flush(&self.id, bytes, &actor).await;

        let mut state = self.state.lock().await;
        state.flushes_in_flight -= 1;
        match result {
            Ok(meta) => {
                self.counters.flushes.fetch_add(1, Ordering::Relaxed);
                log::debug!("Flushed {} ({reason}, {} bytes)", self.name, meta.size);
                Ok(Some(meta))
            }
            Err(e) => {
                self.counters.flush_failures.fetch_add(1, Ordering::Relaxed);
                state.dirty = true;
                log::error!("Flush of {} ({reason}) failed: {e}", self.name);
                Err(e.into())
            }
        }
    }

    /// Explicit save requested by `conn_id`. Errors go back to the requester.
    pub async fn save(&self, conn_id: &str) -> Result<FileMetadata, RoomError> {
        let user = {
            let state = self.state.lock().await;
            state
                .connections
                .get(conn_id)
                .ok_or_else(|| RoomError::NotJoined(conn_id.to_string()))?
                .user()
                .to_string()
        };
        self.flush_as(FlushReason::Explicit, Some(&user))
            .await?
            .ok_or_else(|| RoomError::NotJoined(conn_id.to_string()))
    }

    /// Mark the room closed if it is empty, clean and has no flush in
    /// flight. A closed room refuses joins and stops its worker.
    ///
    /// Never waits: a room whose state is busy is not idle.
    pub fn try_close(&self) -> bool {
        let Ok(mut state) = self.state.try_lock() else {
            return false;
        };
        if state.closed {
            return true;
        }
        if !state.connections.is_empty() || state.dirty || state.flushes_in_flight > 0 {
            return false;
        }
        state.closed = true;
        drop(state);

        if let Some(worker) = self.worker.lock().take() {
            worker.abort();
        }
        true
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    pub async fn connection_count(&self) -> usize {
        self.state.lock().await.connections.len()
    }

    pub async fn is_dirty(&self) -> bool {
        self.state.lock().await.dirty
    }

    /// How long the room has had no connections.
    pub async fn empty_for(&self) -> Option<Duration> {
        self.state.lock().await.empty_since.map(|t| t.elapsed())
    }

    /// Current text, if the document is loaded.
    pub async fn content(&self) -> Option<String> {
        self.state.lock().await.document.as_ref().map(Document::content)
    }

    pub async fn stats(&self) -> RoomStats {
        let state = self.state.lock().await;
        RoomStats {
            connections: state.connections.len(),
            presence_entries: state.presence.len(),
            dirty: state.dirty,
            updates_applied: self.counters.updates_applied.load(Ordering::Relaxed),
            updates_rejected: self.counters.updates_rejected.load(Ordering::Relaxed),
            presence_resyncs: self.counters.presence_resyncs.load(Ordering::Relaxed),
            flushes: self.counters.flushes.load(Ordering::Relaxed),
            flush_failures: self.counters.flush_failures.load(Ordering::Relaxed),
            dropped_connections: self.counters.dropped_connections.load(Ordering::Relaxed),
        }
    }

    // ─── Fan-out ─────────────────────────────────────────────────────

    fn fan_out(&self, state: &mut RoomState, frame: &Arc<Vec<u8>>, except: Option<&str>) -> usize {
        let mut delivered = 0;
        let mut dead = Vec::new();
        for (id, conn) in &state.connections {
            if Some(id.as_str()) == except {
                continue;
            }
            if conn.send(frame.clone()) {
                delivered += 1;
            } else {
                dead.push(id.clone());
            }
        }
        if !dead.is_empty() {
            self.drop_connections(state, dead);
        }
        delivered
    }

    /// Remove dead connections, announcing each presence removal to the
    /// rest. Connections that fail during those announcements go too.
    fn drop_connections(&self, state: &mut RoomState, mut dead: Vec<String>) {
        while let Some(id) = dead.pop() {
            if state.connections.remove(&id).is_none() {
                continue;
            }
            self.counters.dropped_connections.fetch_add(1, Ordering::Relaxed);
            log::warn!("Dropped dead connection {id} from {}", self.name);

            let Some(frame) = self.removal_frame(state, &id) else {
                continue;
            };
            for (other, conn) in &state.connections {
                if !conn.send(frame.clone()) && !dead.contains(other) {
                    dead.push(other.clone());
                }
            }
        }
        if state.connections.is_empty() && state.empty_since.is_none() {
            state.empty_since = Some(Instant::now());
        }
    }

    fn broadcast_removal(&self, state: &mut RoomState, conn_id: &str) {
        if let Some(frame) = self.removal_frame(state, conn_id) {
            self.fan_out(state, &frame, None);
        }
    }

    fn removal_frame(&self, state: &mut RoomState, conn_id: &str) -> Option<Arc<Vec<u8>>> {
        let diff = state.presence.remove(conn_id)?;
        let encoded = diff
            .encode()
            .map_err(RoomError::from)
            .and_then(|bytes| {
                WireMessage::awareness(&self.name, bytes, conn_id)
                    .encode()
                    .map_err(RoomError::from)
            });
        match encoded {
            Ok(frame) => Some(Arc::new(frame)),
            Err(e) => {
                log::error!("Failed to encode presence removal for {conn_id}: {e}");
                None
            }
        }
    }

    // ─── Debounced flush worker ──────────────────────────────────────

    fn ensure_worker(self: &Arc<Self>) {
        let mut worker = self.worker.lock();
        if worker.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let weak = Arc::downgrade(self);
        let signal = self.flush_signal.clone();
        let debounce = self.config.flush_debounce();
        let max_wait = self.config.flush_max_wait();
        *worker = Some(tokio::spawn(flush_worker(weak, signal, debounce, max_wait)));
    }
}

impl Drop for Room {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.get_mut().take() {
            worker.abort();
        }
    }
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room").field("id", &self.name).finish()
    }
}

/// Flush after `debounce` of quiet, or `max_wait` after the first
/// unflushed update, whichever comes first.
async fn flush_worker(room: Weak<Room>, signal: Arc<Notify>, debounce: Duration, max_wait: Duration) {
    loop {
        signal.notified().await;
        let hard_deadline = tokio::time::Instant::now() + max_wait;

        loop {
            let quiet_deadline = (tokio::time::Instant::now() + debounce).min(hard_deadline);
            match tokio::time::timeout_at(quiet_deadline, signal.notified()).await {
                Ok(()) if tokio::time::Instant::now() < hard_deadline => continue,
                _ => break,
            }
        }

        let Some(room) = room.upgrade() else {
            return;
        };
        if let Err(e) = room.flush(FlushReason::Debounced).await {
            log::warn!("Debounced flush of {} failed, will retry: {e}", room.name);
        }
    }
}
