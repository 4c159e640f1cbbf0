//! Yrs document holding one file's text.
//!
//! The merge algorithm lives entirely in `yrs`; this module only fixes the
//! shared type layout (a single text named [`CONTENT_TEXT`]) and the byte
//! formats exchanged with peers and storage (lib0 v1 updates).

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, Origin, ReadTxn, StateVector, Text, TextRef, Transact, Update};

use crate::error::CrdtError;

/// Name of the root text type shared by every replica.
pub const CONTENT_TEXT: &str = "content";

/// Transaction origin for updates that arrived from the network.
///
/// Local-update observers skip transactions carrying this origin so that
/// remote edits are never re-sent upstream.
pub const REMOTE_ORIGIN: &str = "scribe-remote";

/// One replica of a collaborative text file.
///
/// Cloning shares the underlying document.
#[derive(Clone)]
pub struct Document {
    doc: Doc,
    text: TextRef,
}

impl Document {
    pub fn new() -> Self {
        let doc = Doc::new();
        let text = doc.get_or_insert_text(CONTENT_TEXT);
        Self { doc, text }
    }

    /// Seed a document from a stored snapshot. Empty bytes yield an empty document.
    pub fn from_snapshot(bytes: &[u8]) -> Result<Self, CrdtError> {
        let document = Self::new();
        if !bytes.is_empty() {
            document.apply_update(bytes)?;
        }
        Ok(document)
    }

    /// Decode and apply a v1 update. Applying the same bytes twice is a no-op.
    pub fn apply_update(&self, bytes: &[u8]) -> Result<(), CrdtError> {
        let update = decode(bytes)?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| CrdtError::Rejected(e.to_string()))
    }

    /// Apply an update received from a peer, tagged with [`REMOTE_ORIGIN`].
    pub fn apply_remote_update(&self, bytes: &[u8]) -> Result<(), CrdtError> {
        let update = decode(bytes)?;
        let mut txn = self.doc.transact_mut_with(REMOTE_ORIGIN);
        txn.apply_update(update)
            .map_err(|e| CrdtError::Rejected(e.to_string()))
    }

    /// Full state as a single v1 update.
    pub fn encode_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    pub fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Everything the holder of `remote_sv` is missing.
    pub fn encode_diff(&self, remote_sv: &[u8]) -> Result<Vec<u8>, CrdtError> {
        let sv = StateVector::decode_v1(remote_sv)
            .map_err(|e| CrdtError::MalformedUpdate(e.to_string()))?;
        let txn = self.doc.transact();
        Ok(txn.encode_state_as_update_v1(&sv))
    }

    /// What a replica whose whole state is `snapshot` lacks, or `None` when
    /// it lacks nothing. No snapshot means the replica is empty.
    pub fn missing_from(&self, snapshot: Option<&[u8]>) -> Result<Option<Vec<u8>>, CrdtError> {
        let remote = Document::from_snapshot(snapshot.unwrap_or_default())?;
        let diff = self.encode_diff(&remote.state_vector())?;
        if diff == Document::new().encode_state() {
            return Ok(None);
        }
        Ok(Some(diff))
    }

    /// True when no operation has ever been integrated.
    pub fn is_empty(&self) -> bool {
        let txn = self.doc.transact();
        txn.state_vector().is_empty()
    }

    pub fn content(&self) -> String {
        let txn = self.doc.transact();
        self.text.get_string(&txn)
    }

    pub fn len(&self) -> u32 {
        let txn = self.doc.transact();
        self.text.len(&txn)
    }

    pub fn insert(&self, index: u32, chunk: &str) {
        let mut txn = self.doc.transact_mut();
        self.text.insert(&mut txn, index, chunk);
    }

    pub fn push(&self, chunk: &str) {
        let mut txn = self.doc.transact_mut();
        let end = self.text.len(&txn);
        self.text.insert(&mut txn, end, chunk);
    }

    pub fn remove(&self, index: u32, len: u32) {
        let mut txn = self.doc.transact_mut();
        self.text.remove_range(&mut txn, index, len);
    }

    /// Replace the whole text in one transaction.
    pub fn replace_all(&self, content: &str) {
        let mut txn = self.doc.transact_mut();
        let len = self.text.len(&txn);
        if len > 0 {
            self.text.remove_range(&mut txn, 0, len);
        }
        self.text.insert(&mut txn, 0, content);
    }

    /// Register `f` for every update produced by a local transaction.
    ///
    /// The callback runs synchronously inside the committing transaction and
    /// must not touch the document. Dropping the returned subscription
    /// detaches it.
    pub fn observe_local_updates<F>(&self, f: F) -> Result<yrs::Subscription, CrdtError>
    where
        F: Fn(Vec<u8>) + Send + Sync + 'static,
    {
        let remote = Origin::from(REMOTE_ORIGIN);
        self.doc
            .observe_update_v1(move |txn, event| {
                if txn.origin() == Some(&remote) {
                    return;
                }
                f(event.update.clone());
            })
            .map_err(|e| CrdtError::Observer(e.to_string()))
    }
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Document {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Document")
            .field("client_id", &self.doc.client_id())
            .field("len", &self.len())
            .finish()
    }
}

fn decode(bytes: &[u8]) -> Result<Update, CrdtError> {
    if bytes.is_empty() {
        return Err(CrdtError::MalformedUpdate("empty payload".into()));
    }
    Update::decode_v1(bytes).map_err(|e| CrdtError::MalformedUpdate(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_from_empty_snapshot() {
        let doc = Document::from_snapshot(&[]).unwrap();
        assert!(doc.is_empty());
        assert_eq!(doc.content(), "");
    }

    #[test]
    fn test_snapshot_reconstructs_content() {
        let a = Document::new();
        a.insert(0, "fn main() {}");

        let b = Document::from_snapshot(&a.encode_state()).unwrap();
        assert_eq!(b.content(), "fn main() {}");
        assert!(!b.is_empty());
    }

    #[test]
    fn test_missing_from_snapshot() {
        let server = Document::new();
        server.insert(0, "shared ");

        let local = Document::from_snapshot(&server.encode_state()).unwrap();
        assert_eq!(local.missing_from(Some(&server.encode_state())).unwrap(), None);

        local.push("local only");
        let missing = local.missing_from(Some(&server.encode_state())).unwrap().unwrap();
        server.apply_update(&missing).unwrap();
        assert_eq!(server.content(), "shared local only");

        let everything = local.missing_from(None).unwrap().unwrap();
        let fresh = Document::from_snapshot(&everything).unwrap();
        assert_eq!(fresh.content(), "shared local only");
        assert_eq!(Document::new().missing_from(None).unwrap(), None);
    }

    #[test]
    fn test_apply_update_is_idempotent() {
        let a = Document::new();
        a.insert(0, "hello");
        let update = a.encode_state();

        let b = Document::new();
        b.apply_update(&update).unwrap();
        let once = b.encode_state();
        b.apply_update(&update).unwrap();

        assert_eq!(b.content(), "hello");
        assert_eq!(b.encode_state(), once);
    }

    #[test]
    fn test_concurrent_edits_converge_in_any_order() {
        let base = Document::new();
        base.insert(0, "shared");
        let seed = base.encode_state();

        let a = Document::from_snapshot(&seed).unwrap();
        let b = Document::from_snapshot(&seed).unwrap();
        let sv_a = a.state_vector();
        let sv_b = b.state_vector();
        a.insert(0, "A:");
        b.push(":B");
        let ua = a.encode_diff(&sv_a).unwrap();
        let ub = b.encode_diff(&sv_b).unwrap();

        let x = Document::from_snapshot(&seed).unwrap();
        x.apply_update(&ua).unwrap();
        x.apply_update(&ub).unwrap();

        let y = Document::from_snapshot(&seed).unwrap();
        y.apply_update(&ub).unwrap();
        y.apply_update(&ua).unwrap();
        y.apply_update(&ua).unwrap();

        assert_eq!(x.content(), y.content());
        assert_eq!(x.content(), "A:shared:B");
    }

    #[test]
    fn test_malformed_update_rejected() {
        let doc = Document::new();
        assert!(matches!(doc.apply_update(&[]), Err(CrdtError::MalformedUpdate(_))));
        assert!(doc.apply_update(&[1, 2, 3]).is_err());
        assert!(doc.is_empty());
    }

    #[test]
    fn test_replace_all() {
        let doc = Document::new();
        doc.insert(0, "old text");
        doc.replace_all("new");
        assert_eq!(doc.content(), "new");
        doc.remove(0, 1);
        assert_eq!(doc.content(), "ew");
    }

    #[test]
    fn test_local_observer_skips_remote_updates() {
        let doc = Document::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = doc
            .observe_local_updates(move |u| sink.lock().unwrap().push(u))
            .unwrap();

        doc.insert(0, "local");
        assert_eq!(seen.lock().unwrap().len(), 1);

        let other = Document::new();
        other.insert(0, "remote ");
        doc.apply_remote_update(&other.encode_state()).unwrap();
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert!(doc.content().contains("remote"));
    }

    #[test]
    fn test_observer_detaches_on_drop() {
        let doc = Document::new();
        let seen = Arc::new(Mutex::new(0usize));
        let sink = seen.clone();
        let sub = doc
            .observe_local_updates(move |_| *sink.lock().unwrap() += 1)
            .unwrap();
        doc.insert(0, "a");
        drop(sub);
        doc.insert(0, "b");
        assert_eq!(*seen.lock().unwrap(), 1);
    }
}
