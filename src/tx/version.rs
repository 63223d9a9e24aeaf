//! In-memory MVCC version store.
//!
//! `current` records the last committed transaction per document; a key
//! that is absent has not changed since open and is visible to every
//! snapshot. `undo` keeps pre-images of committed overwrites for as long
//! as an active snapshot may need them: an entry `{valid_until, payload}`
//! is what a reader with `snapshot < valid_until` observes (payload None
//! means the document did not exist yet). Entries are pruned against the
//! minimum active snapshot.

use std::collections::{BTreeMap, HashMap};

pub type DocKey = (String, i64);

#[derive(Debug, Clone)]
pub enum Visibility {
    /// The committed tree state is what this snapshot sees.
    Current,
    /// The snapshot predates the latest commit; this is its payload
    /// (None = the document was not visible at the snapshot).
    Payload(Option<Vec<u8>>),
}

#[derive(Debug, Clone)]
struct UndoEntry {
    valid_until: u64,
    payload: Option<Vec<u8>>,
}

#[derive(Default)]
pub struct VersionStore {
    current: HashMap<DocKey, u64>,
    undo: HashMap<DocKey, Vec<UndoEntry>>,
    active: BTreeMap<u64, usize>,
}

impl VersionStore {
    pub fn new() -> Self {
        VersionStore::default()
    }

    pub fn register_snapshot(&mut self, snapshot: u64) {
        *self.active.entry(snapshot).or_insert(0) += 1;
    }

    pub fn release_snapshot(&mut self, snapshot: u64) {
        if let Some(count) = self.active.get_mut(&snapshot) {
            *count -= 1;
            if *count == 0 {
                self.active.remove(&snapshot);
            }
        }
        self.prune();
    }

    pub fn min_active(&self) -> Option<u64> {
        self.active.keys().next().copied()
    }

    /// Committed version of a document, 0 when untouched since open.
    pub fn current_version(&self, key: &DocKey) -> u64 {
        self.current.get(key).copied().unwrap_or(0)
    }

    /// What a snapshot sees for a document.
    pub fn visible(&self, key: &DocKey, snapshot: u64) -> Visibility {
        match self.current.get(key) {
            None => Visibility::Current,
            Some(&version) if version <= snapshot => Visibility::Current,
            Some(_) => {
                if let Some(entries) = self.undo.get(key) {
                    for entry in entries {
                        if entry.valid_until > snapshot {
                            return Visibility::Payload(entry.payload.clone());
                        }
                    }
                }
                // Pruning only drops entries no registered snapshot can
                // reach, so this branch means the snapshot was never
                // registered; report the document as not visible.
                Visibility::Payload(None)
            }
        }
    }

    /// Record a commit touching `key`. `old_payload` is the committed
    /// state the change replaced (None = the document did not exist).
    pub fn record_commit(&mut self, key: DocKey, txn_id: u64, old_payload: Option<Vec<u8>>) {
        if !self.active.is_empty() {
            self.undo.entry(key.clone()).or_default().push(UndoEntry {
                valid_until: txn_id,
                payload: old_payload,
            });
        }
        self.current.insert(key, txn_id);
    }

    /// Ids in `collection` whose committed version postdates `snapshot`.
    pub fn modified_after(&self, collection: &str, snapshot: u64) -> Vec<i64> {
        self.current
            .iter()
            .filter(|((coll, _), &version)| coll == collection && version > snapshot)
            .map(|((_, id), _)| *id)
            .collect()
    }

    fn prune(&mut self) {
        match self.min_active() {
            None => self.undo.clear(),
            Some(min) => {
                self.undo.retain(|_, entries| {
                    entries.retain(|e| e.valid_until > min);
                    !entries.is_empty()
                });
            }
        }
    }

    #[cfg(test)]
    fn undo_len(&self) -> usize {
        self.undo.values().map(|v| v.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: i64) -> DocKey {
        ("c".to_string(), id)
    }

    #[test]
    fn test_untouched_is_current_for_all_snapshots() {
        let store = VersionStore::new();
        assert!(matches!(store.visible(&key(1), 0), Visibility::Current));
        assert!(matches!(store.visible(&key(1), 99), Visibility::Current));
    }

    #[test]
    fn test_snapshot_sees_pre_image() {
        let mut store = VersionStore::new();
        store.register_snapshot(5);
        store.record_commit(key(1), 6, Some(b"old".to_vec()));

        match store.visible(&key(1), 5) {
            Visibility::Payload(Some(p)) => assert_eq!(p, b"old"),
            other => panic!("expected pre-image, got {:?}", other),
        }
        assert!(matches!(store.visible(&key(1), 6), Visibility::Current));
    }

    #[test]
    fn test_snapshot_hides_later_insert() {
        let mut store = VersionStore::new();
        store.register_snapshot(3);
        store.record_commit(key(9), 4, None);

        match store.visible(&key(9), 3) {
            Visibility::Payload(None) => {}
            other => panic!("expected invisibility, got {:?}", other),
        }
    }

    #[test]
    fn test_chained_overwrites_pick_oldest_applicable() {
        let mut store = VersionStore::new();
        store.register_snapshot(1);
        store.record_commit(key(1), 2, Some(b"v1".to_vec()));
        store.register_snapshot(2);
        store.record_commit(key(1), 3, Some(b"v2".to_vec()));

        match store.visible(&key(1), 1) {
            Visibility::Payload(Some(p)) => assert_eq!(p, b"v1"),
            other => panic!("snapshot 1 should see v1, got {:?}", other),
        }
        match store.visible(&key(1), 2) {
            Visibility::Payload(Some(p)) => assert_eq!(p, b"v2"),
            other => panic!("snapshot 2 should see v2, got {:?}", other),
        }
    }

    #[test]
    fn test_prune_on_release() {
        let mut store = VersionStore::new();
        store.register_snapshot(1);
        store.record_commit(key(1), 2, Some(b"v1".to_vec()));
        assert_eq!(store.undo_len(), 1);

        store.release_snapshot(1);
        assert_eq!(store.undo_len(), 0);
    }

    #[test]
    fn test_no_undo_kept_without_snapshots() {
        let mut store = VersionStore::new();
        store.record_commit(key(1), 2, Some(b"v1".to_vec()));
        assert_eq!(store.undo_len(), 0);
        assert_eq!(store.current_version(&key(1)), 2);
    }

    #[test]
    fn test_modified_after() {
        let mut store = VersionStore::new();
        store.record_commit(key(1), 2, None);
        store.record_commit(key(2), 5, None);
        store.record_commit(("other".into(), 3), 9, None);

        let mut ids = store.modified_after("c", 2);
        ids.sort_unstable();
        assert_eq!(ids, vec![2]);
        let mut ids = store.modified_after("c", 0);
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2]);
    }
}
