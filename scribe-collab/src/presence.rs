//! Presence encoder: ephemeral per-connection cursor and selection state.
//!
//! ## Flow
//!
//! ```text
//! Local cursor move
//!       │
//!       ▼
//! PresenceSet::set()          (clock += 1)
//!       │
//!       ▼
//! PresenceDiff { updated: [id], entries: [record] }
//!       │
//!       ▼   awareness-update (relayed by the room)
//! Remote PresenceSet::apply_diff()
//!       │
//!       ▼
//! PresenceEvent::{Added, Updated, Removed}  → cursor renderer
//! ```
//!
//! Entries are keyed by connection id, never persisted, and versioned by a
//! per-entry clock so a late diff cannot overwrite a newer one.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::PresenceError;
use crate::events::{EventBus, Subscription};

/// Ephemeral client identifier (the server-assigned connection id).
pub type ClientId = String;

// ───────────────────────────────────────────────────────────────────
// Entry types
// ───────────────────────────────────────────────────────────────────

/// Zero-based caret location in a text file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub line: u32,
    pub column: u32,
}

impl CursorPosition {
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionRange {
    pub anchor: CursorPosition,
    pub head: CursorPosition,
}

/// Cursor color, stable for a given client id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl CursorColor {
    /// Derive a vivid color from the client id's hash.
    pub fn for_client(client_id: &str) -> Self {
        let mut hash: u32 = 0x811c_9dc5;
        for byte in client_id.as_bytes() {
            hash ^= *byte as u32;
            hash = hash.wrapping_mul(0x0100_0193);
        }
        let hue = (hash % 360) as f32 / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self {
            r: (r * 255.0).round() as u8,
            g: (g * 255.0).round() as u8,
            b: (b * 255.0).round() as u8,
        }
    }

    /// `#rrggbb`
    pub fn to_hex(&self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }
    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;
    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

/// One client's presence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub display_name: String,
    pub color: CursorColor,
    pub cursor: Option<CursorPosition>,
    pub selection: Option<SelectionRange>,
}

impl PresenceEntry {
    pub fn new(display_name: impl Into<String>, client_id: &str) -> Self {
        Self {
            display_name: display_name.into(),
            color: CursorColor::for_client(client_id),
            cursor: None,
            selection: None,
        }
    }

    pub fn with_cursor(mut self, cursor: CursorPosition) -> Self {
        self.cursor = Some(cursor);
        self
    }

    pub fn with_selection(mut self, selection: SelectionRange) -> Self {
        self.selection = Some(selection);
        self
    }
}

/// An entry as carried in a diff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub client_id: ClientId,
    pub clock: u64,
    pub entry: PresenceEntry,
}

// ───────────────────────────────────────────────────────────────────
// Diffs
// ───────────────────────────────────────────────────────────────────

/// Presence delta. `entries` carries payloads for `added` and `updated`
/// ids only; removed ids carry none.
///
/// A `full` diff lists the complete state: receivers drop every remote
/// entry it does not mention.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceDiff {
    pub full: bool,
    pub added: Vec<ClientId>,
    pub updated: Vec<ClientId>,
    pub removed: Vec<ClientId>,
    pub entries: Vec<PresenceRecord>,
}

impl PresenceDiff {
    pub fn removal(client_id: impl Into<ClientId>) -> Self {
        Self {
            removed: vec![client_id.into()],
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.full && self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// Every added or updated id must have exactly one payload record.
    pub fn validate(&self) -> Result<(), PresenceError> {
        let records: HashSet<&str> = self.entries.iter().map(|r| r.client_id.as_str()).collect();
        if records.len() != self.entries.len() {
            return Err(PresenceError::Malformed("duplicate presence record".into()));
        }
        for id in self.added.iter().chain(&self.updated) {
            if !records.contains(id.as_str()) {
                return Err(PresenceError::Malformed(format!("no payload for {id}")));
            }
        }
        Ok(())
    }

    /// Keep only what `sender` is allowed to say: its own entry.
    pub fn restricted_to(&self, sender: &str) -> Self {
        let own = |id: &ClientId| id == sender;
        Self {
            full: false,
            added: self.added.iter().filter(|id| own(id)).cloned().collect(),
            updated: self.updated.iter().filter(|id| own(id)).cloned().collect(),
            removed: self.removed.iter().filter(|id| own(id)).cloned().collect(),
            entries: self.entries.iter().filter(|r| own(&r.client_id)).cloned().collect(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, PresenceError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| PresenceError::Encode(e.to_string()))
    }

    /// Decode and validate.
    pub fn decode(bytes: &[u8]) -> Result<Self, PresenceError> {
        let (diff, read): (Self, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| PresenceError::Malformed(e.to_string()))?;
        if read != bytes.len() {
            return Err(PresenceError::Malformed("trailing bytes".into()));
        }
        diff.validate()?;
        Ok(diff)
    }
}

/// What an applied diff actually changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceChange {
    pub added: Vec<ClientId>,
    pub updated: Vec<ClientId>,
    pub removed: Vec<ClientId>,
}

impl PresenceChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

/// Cursor add/update/remove notifications for renderers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceEvent {
    Added { client_id: ClientId, entry: PresenceEntry },
    Updated { client_id: ClientId, entry: PresenceEntry },
    Removed { client_id: ClientId },
}

// ───────────────────────────────────────────────────────────────────
// Presence set
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Versioned {
    clock: u64,
    entry: PresenceEntry,
}

/// All presence entries of one room (server) or one replica (client).
///
/// On the client, `local_id` names the replica's own entry; incoming diffs
/// never touch it.
pub struct PresenceSet {
    entries: HashMap<ClientId, Versioned>,
    local_id: Option<ClientId>,
    events: EventBus<PresenceEvent>,
}

impl PresenceSet {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            local_id: None,
            events: EventBus::new(),
        }
    }

    pub fn local_id(&self) -> Option<&str> {
        self.local_id.as_deref()
    }

    /// Adopt a new local identity. Any entry under the previous one is dropped.
    pub fn set_local_id(&mut self, id: impl Into<ClientId>) {
        if let Some(old) = self.local_id.take() {
            self.entries.remove(&old);
        }
        self.local_id = Some(id.into());
    }

    pub fn subscribe(&self) -> Subscription<PresenceEvent> {
        self.events.subscribe()
    }

    /// Insert or replace `client_id`'s entry, bumping its clock.
    pub fn set(&mut self, client_id: &str, entry: PresenceEntry) -> PresenceDiff {
        let mut diff = PresenceDiff::default();
        let clock = match self.entries.get(client_id) {
            Some(prev) => {
                diff.updated.push(client_id.to_string());
                prev.clock + 1
            }
            None => {
                diff.added.push(client_id.to_string());
                1
            }
        };
        self.entries.insert(
            client_id.to_string(),
            Versioned { clock, entry: entry.clone() },
        );
        diff.entries.push(PresenceRecord {
            client_id: client_id.to_string(),
            clock,
            entry,
        });
        diff
    }

    /// Remove an entry, returning the removal diff if it existed.
    pub fn remove(&mut self, client_id: &str) -> Option<PresenceDiff> {
        self.entries.remove(client_id)?;
        if self.local_id.as_deref() != Some(client_id) {
            self.events.emit(PresenceEvent::Removed { client_id: client_id.to_string() });
        }
        Some(PresenceDiff::removal(client_id))
    }

    /// Drop every remote entry, as after losing the connection.
    pub fn clear_remote(&mut self) -> Vec<ClientId> {
        let remote: Vec<ClientId> = self
            .entries
            .keys()
            .filter(|id| Some(id.as_str()) != self.local_id.as_deref())
            .cloned()
            .collect();
        for id in &remote {
            self.entries.remove(id);
            self.events.emit(PresenceEvent::Removed { client_id: id.clone() });
        }
        remote
    }

    /// Merge a remote diff. Stale records (clock not newer) are ignored.
    pub fn apply_diff(&mut self, diff: &PresenceDiff) -> Result<PresenceChange, PresenceError> {
        diff.validate()?;
        let mut change = PresenceChange::default();
        let local = self.local_id.clone();
        let is_local = |id: &str| local.as_deref() == Some(id);

        let announced: HashSet<&str> =
            diff.added.iter().chain(&diff.updated).map(String::as_str).collect();

        for record in &diff.entries {
            if !announced.contains(record.client_id.as_str()) || is_local(&record.client_id) {
                continue;
            }
            match self.entries.get_mut(&record.client_id) {
                Some(current) if record.clock <= current.clock => {}
                Some(current) => {
                    current.clock = record.clock;
                    current.entry = record.entry.clone();
                    change.updated.push(record.client_id.clone());
                }
                None => {
                    self.entries.insert(
                        record.client_id.clone(),
                        Versioned { clock: record.clock, entry: record.entry.clone() },
                    );
                    change.added.push(record.client_id.clone());
                }
            }
        }

        let mut gone: Vec<ClientId> = diff
            .removed
            .iter()
            .filter(|id| !is_local(id.as_str()))
            .cloned()
            .collect();
        if diff.full {
            gone.extend(
                self.entries
                    .keys()
                    .filter(|id| !is_local(id.as_str()) && !announced.contains(id.as_str()))
                    .cloned(),
            );
        }
        for id in gone {
            if self.entries.remove(&id).is_some() && !change.removed.contains(&id) {
                change.removed.push(id);
            }
        }

        self.emit_change(&change);
        Ok(change)
    }

    /// Decode and merge an encoded diff.
    pub fn apply_bytes(&mut self, bytes: &[u8]) -> Result<PresenceChange, PresenceError> {
        let diff = PresenceDiff::decode(bytes)?;
        self.apply_diff(&diff)
    }

    /// Diff describing `change` against the current state.
    pub fn diff_for(&self, change: &PresenceChange) -> PresenceDiff {
        let entries = change
            .added
            .iter()
            .chain(&change.updated)
            .filter_map(|id| self.record(id))
            .collect();
        PresenceDiff {
            full: false,
            added: change.added.clone(),
            updated: change.updated.clone(),
            removed: change.removed.clone(),
            entries,
        }
    }

    /// Complete state as a `full` diff.
    pub fn full_diff(&self) -> PresenceDiff {
        let entries = self.entries();
        PresenceDiff {
            full: true,
            added: entries.iter().map(|r| r.client_id.clone()).collect(),
            updated: Vec::new(),
            removed: Vec::new(),
            entries,
        }
    }

    pub fn encode_full(&self) -> Result<Vec<u8>, PresenceError> {
        self.full_diff().encode()
    }

    pub fn get(&self, client_id: &str) -> Option<&PresenceEntry> {
        self.entries.get(client_id).map(|v| &v.entry)
    }

    fn record(&self, client_id: &str) -> Option<PresenceRecord> {
        self.entries.get(client_id).map(|v| PresenceRecord {
            client_id: client_id.to_string(),
            clock: v.clock,
            entry: v.entry.clone(),
        })
    }

    /// All records, ordered by client id.
    pub fn entries(&self) -> Vec<PresenceRecord> {
        let mut ids: Vec<&ClientId> = self.entries.keys().collect();
        ids.sort();
        ids.into_iter().filter_map(|id| self.record(id)).collect()
    }

    /// Remote entries only.
    pub fn remote_entries(&self) -> Vec<PresenceRecord> {
        self.entries()
            .into_iter()
            .filter(|r| Some(r.client_id.as_str()) != self.local_id.as_deref())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn emit_change(&self, change: &PresenceChange) {
        for id in &change.added {
            if let Some(entry) = self.get(id) {
                self.events.emit(PresenceEvent::Added { client_id: id.clone(), entry: entry.clone() });
            }
        }
        for id in &change.updated {
            if let Some(entry) = self.get(id) {
                self.events.emit(PresenceEvent::Updated { client_id: id.clone(), entry: entry.clone() });
            }
        }
        for id in &change.removed {
            self.events.emit(PresenceEvent::Removed { client_id: id.clone() });
        }
    }
}

impl Default for PresenceSet {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PresenceSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresenceSet")
            .field("entries", &self.entries.len())
            .field("local_id", &self.local_id)
            .finish()
    }
}

// ===================================================================
// Tests
// ===================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, id: &str, line: u32) -> PresenceEntry {
        PresenceEntry::new(name, id).with_cursor(CursorPosition::new(line, 0))
    }

    // ── Color ────────────────────────────────────────────────────

    #[test]
    fn test_color_is_stable_per_client() {
        assert_eq!(CursorColor::for_client("abc"), CursorColor::for_client("abc"));
        let hex = CursorColor::for_client("abc").to_hex();
        assert_eq!(hex.len(), 7);
        assert!(hex.starts_with('#'));
    }

    #[test]
    fn test_hsl_gray_when_unsaturated() {
        assert_eq!(hsl_to_rgb(0.3, 0.0, 0.5), (0.5, 0.5, 0.5));
    }

    // ── Diffs ────────────────────────────────────────────────────

    #[test]
    fn test_set_produces_added_then_updated() {
        let mut set = PresenceSet::new();
        let first = set.set("c1", entry("Ada", "c1", 1));
        assert_eq!(first.added, vec!["c1".to_string()]);
        assert_eq!(first.entries[0].clock, 1);

        let second = set.set("c1", entry("Ada", "c1", 2));
        assert_eq!(second.updated, vec!["c1".to_string()]);
        assert_eq!(second.entries[0].clock, 2);
    }

    #[test]
    fn test_every_announced_id_has_payload() {
        let mut set = PresenceSet::new();
        set.set("c1", entry("Ada", "c1", 1));
        set.set("c2", entry("Bob", "c2", 1));
        let full = set.full_diff();

        full.validate().unwrap();
        for id in full.added.iter().chain(&full.updated) {
            assert!(full.entries.iter().any(|r| &r.client_id == id));
        }
        let removal = set.remove("c1").unwrap();
        assert!(removal.entries.is_empty());
        removal.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_missing_payload() {
        let diff = PresenceDiff {
            added: vec!["ghost".into()],
            ..PresenceDiff::default()
        };
        assert!(diff.validate().is_err());
        assert!(PresenceDiff::decode(&diff.encode().unwrap()).is_err());
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(PresenceDiff::decode(&[0xFF, 0xFF, 0xFF, 0xFF]).is_err());
    }

    #[test]
    fn test_restricted_to_sender() {
        let mut set = PresenceSet::new();
        set.set("a", entry("A", "a", 0));
        set.set("b", entry("B", "b", 0));
        let mut diff = set.full_diff();
        diff.removed.push("c".into());

        let own = diff.restricted_to("a");
        assert!(!own.full);
        assert_eq!(own.added, vec!["a".to_string()]);
        assert!(own.removed.is_empty());
        assert_eq!(own.entries.len(), 1);
    }

    // ── Apply ────────────────────────────────────────────────────

    #[test]
    fn test_apply_diff_add_update_remove() {
        let mut source = PresenceSet::new();
        let mut replica = PresenceSet::new();
        let mut events = replica.subscribe();

        let d1 = source.set("c1", entry("Ada", "c1", 1));
        let change = replica.apply_bytes(&d1.encode().unwrap()).unwrap();
        assert_eq!(change.added, vec!["c1".to_string()]);

        let d2 = source.set("c1", entry("Ada", "c1", 5));
        let change = replica.apply_diff(&d2).unwrap();
        assert_eq!(change.updated, vec!["c1".to_string()]);
        assert_eq!(replica.get("c1").unwrap().cursor, Some(CursorPosition::new(5, 0)));

        let d3 = source.remove("c1").unwrap();
        let change = replica.apply_diff(&d3).unwrap();
        assert_eq!(change.removed, vec!["c1".to_string()]);
        assert!(replica.is_empty());

        assert!(matches!(events.try_recv(), Some(PresenceEvent::Added { .. })));
        assert!(matches!(events.try_recv(), Some(PresenceEvent::Updated { .. })));
        assert_eq!(events.try_recv(), Some(PresenceEvent::Removed { client_id: "c1".into() }));
    }

    #[test]
    fn test_stale_record_ignored() {
        let mut source = PresenceSet::new();
        let mut replica = PresenceSet::new();
        let old = source.set("c1", entry("Ada", "c1", 1));
        let new = source.set("c1", entry("Ada", "c1", 9));

        replica.apply_diff(&new).unwrap();
        let change = replica.apply_diff(&old).unwrap();
        assert!(change.is_empty());
        assert_eq!(replica.get("c1").unwrap().cursor, Some(CursorPosition::new(9, 0)));

        // Duplicate delivery is a no-op.
        assert!(replica.apply_diff(&new).unwrap().is_empty());
    }

    #[test]
    fn test_full_diff_drops_unmentioned_entries() {
        let mut server = PresenceSet::new();
        server.set("a", entry("A", "a", 0));

        let mut client = PresenceSet::new();
        client.set_local_id("me");
        client.set("me", entry("Me", "me", 0));
        let mut stale = PresenceSet::new();
        let d = stale.set("gone", entry("Gone", "gone", 0));
        client.apply_diff(&d).unwrap();

        let change = client.apply_diff(&server.full_diff()).unwrap();
        assert_eq!(change.added, vec!["a".to_string()]);
        assert_eq!(change.removed, vec!["gone".to_string()]);
        assert!(client.get("me").is_some());
    }

    #[test]
    fn test_local_entry_untouched_by_remote_diffs() {
        let mut client = PresenceSet::new();
        client.set_local_id("me");
        client.set("me", entry("Me", "me", 3));

        let mut other = PresenceSet::new();
        other.set("me", entry("Spoof", "me", 0));
        other.set("me", entry("Spoof", "me", 0));
        let change = client.apply_diff(&other.full_diff()).unwrap();

        assert!(change.is_empty());
        assert_eq!(client.get("me").unwrap().display_name, "Me");
        assert_eq!(client.remote_entries().len(), 0);
    }

    #[test]
    fn test_clear_remote_emits_removals() {
        let mut client = PresenceSet::new();
        client.set_local_id("me");
        client.set("me", entry("Me", "me", 0));
        let mut source = PresenceSet::new();
        client.apply_diff(&source.set("x", entry("X", "x", 0))).unwrap();
        let mut events = client.subscribe();

        assert_eq!(client.clear_remote(), vec!["x".to_string()]);
        assert_eq!(events.try_recv(), Some(PresenceEvent::Removed { client_id: "x".into() }));
        assert_eq!(client.len(), 1);
    }

    #[test]
    fn test_diff_for_change() {
        let mut set = PresenceSet::new();
        set.set("a", entry("A", "a", 0));
        let change = PresenceChange {
            added: vec!["a".into()],
            updated: vec![],
            removed: vec!["z".into()],
        };
        let diff = set.diff_for(&change);
        diff.validate().unwrap();
        assert_eq!(diff.entries.len(), 1);
        assert_eq!(diff.removed, vec!["z".to_string()]);
    }
}
