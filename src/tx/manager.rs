//! Transaction id issuance, snapshot registry and optimistic conflict
//! detection. The engine drives the commit pipeline; this type owns the
//! ordering state.

use crate::error::{GaldrError, Result};
use crate::tx::transaction::{TxMode, TxState};
use crate::tx::version::{DocKey, VersionStore, Visibility};

pub struct TransactionManager {
    versions: VersionStore,
    next_txn_id: u64,
    last_committed: u64,
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionManager {
    pub fn new() -> Self {
        TransactionManager {
            versions: VersionStore::new(),
            next_txn_id: 1,
            last_committed: 0,
        }
    }

    pub fn last_committed(&self) -> u64 {
        self.last_committed
    }

    /// Open a transaction whose snapshot is the highest committed txn id.
    pub fn begin(&mut self, mode: TxMode) -> TxState {
        let snapshot = self.last_committed;
        self.versions.register_snapshot(snapshot);
        TxState::begin(snapshot, mode)
    }

    /// Release a transaction's snapshot once it is final.
    pub fn release(&mut self, tx: &TxState) {
        self.versions.release_snapshot(tx.snapshot_id);
    }

    /// First-committer-wins validation: every write's base version must
    /// still be the committed version.
    pub fn validate(&self, tx: &TxState) -> Result<()> {
        for (key, op) in &tx.write_set {
            let current = self.versions.current_version(key);
            if current != op.base_version {
                return Err(GaldrError::WriteConflict {
                    collection: key.0.clone(),
                    id: key.1,
                });
            }
        }
        Ok(())
    }

    /// Reserve the txn id a validated commit will publish under.
    pub fn assign_txn_id(&mut self) -> u64 {
        let id = self.next_txn_id;
        self.next_txn_id += 1;
        id
    }

    /// Make a commit visible: bump per-document versions (stashing
    /// pre-images for older snapshots) and advance the committed horizon.
    pub fn publish(&mut self, txn_id: u64, changes: Vec<(DocKey, Option<Vec<u8>>)>) {
        for (key, old_payload) in changes {
            self.versions.record_commit(key, txn_id, old_payload);
        }
        if txn_id > self.last_committed {
            self.last_committed = txn_id;
        }
    }

    pub fn current_version(&self, key: &DocKey) -> u64 {
        self.versions.current_version(key)
    }

    pub fn visible(&self, key: &DocKey, snapshot: u64) -> Visibility {
        self.versions.visible(key, snapshot)
    }

    pub fn modified_after(&self, collection: &str, snapshot: u64) -> Vec<i64> {
        self.versions.modified_after(collection, snapshot)
    }
}
