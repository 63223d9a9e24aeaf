//! Transaction-local state: the write set and the read cache.

use std::collections::{BTreeMap, HashMap};

use crate::error::{GaldrError, Result};
use crate::tx::version::DocKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxMode {
    ReadOnly,
    ReadWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Active,
    Committed,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    Insert,
    Replace,
    Delete,
}

#[derive(Debug, Clone)]
pub struct WriteOp {
    pub kind: WriteKind,
    pub payload: Option<Vec<u8>>,
    /// Committed version this write is based on (0 = document untouched
    /// since open, or absent for inserts). Checked again at commit.
    pub base_version: u64,
}

/// State of one transaction. Owned exclusively by its handle; the engine
/// inspects it during reads and consumes it at commit.
pub struct TxState {
    pub snapshot_id: u64,
    pub mode: TxMode,
    pub status: TxStatus,
    pub write_set: BTreeMap<DocKey, WriteOp>,
    /// Snapshot reads pinned for repeatability (None = not visible).
    pub read_cache: HashMap<DocKey, Option<Vec<u8>>>,
}

impl TxState {
    pub fn begin(snapshot_id: u64, mode: TxMode) -> Self {
        TxState {
            snapshot_id,
            mode,
            status: TxStatus::Active,
            write_set: BTreeMap::new(),
            read_cache: HashMap::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == TxStatus::Active
    }

    pub fn ensure_writable(&self) -> Result<()> {
        if !self.is_active() {
            return Err(GaldrError::TransactionEnded);
        }
        if self.mode == TxMode::ReadOnly {
            return Err(GaldrError::InvalidArgument(
                "write attempted in a read-only transaction".into(),
            ));
        }
        Ok(())
    }

    /// Stage an insert. `base_version` is the committed version observed
    /// for the id (the caller has verified no live document carries it).
    pub fn stage_insert(&mut self, key: DocKey, payload: Vec<u8>, base_version: u64) -> Result<()> {
        match self.write_set.get(&key) {
            Some(op) if op.kind == WriteKind::Delete => {
                // Delete-then-insert collapses into a replace of the
                // original committed document.
                let base = op.base_version;
                self.write_set.insert(
                    key,
                    WriteOp {
                        kind: WriteKind::Replace,
                        payload: Some(payload),
                        base_version: base,
                    },
                );
                Ok(())
            }
            Some(_) => Err(GaldrError::InvalidArgument(format!(
                "document {}:{} already written in this transaction",
                key.0, key.1
            ))),
            None => {
                self.write_set.insert(
                    key,
                    WriteOp {
                        kind: WriteKind::Insert,
                        payload: Some(payload),
                        base_version,
                    },
                );
                Ok(())
            }
        }
    }

    /// Stage a replace over a document visible at `base_version`.
    pub fn stage_replace(&mut self, key: DocKey, payload: Vec<u8>, base_version: u64) {
        match self.write_set.get_mut(&key) {
            Some(op) => {
                // An insert stays an insert; anything else becomes a
                // replace of the original base.
                op.payload = Some(payload);
                if op.kind == WriteKind::Delete {
                    op.kind = WriteKind::Replace;
                }
            }
            None => {
                self.write_set.insert(
                    key,
                    WriteOp {
                        kind: WriteKind::Replace,
                        payload: Some(payload),
                        base_version,
                    },
                );
            }
        }
    }

    /// Stage a delete. Deleting an own uncommitted insert cancels it.
    pub fn stage_delete(&mut self, key: DocKey, base_version: u64) {
        match self.write_set.get(&key) {
            Some(op) if op.kind == WriteKind::Insert => {
                self.write_set.remove(&key);
            }
            Some(op) => {
                let base = op.base_version;
                self.write_set.insert(
                    key,
                    WriteOp {
                        kind: WriteKind::Delete,
                        payload: None,
                        base_version: base,
                    },
                );
            }
            None => {
                self.write_set.insert(
                    key,
                    WriteOp {
                        kind: WriteKind::Delete,
                        payload: None,
                        base_version,
                    },
                );
            }
        }
    }

    /// Resolve a read against the write set: Some(Some) = own write,
    /// Some(None) = deleted by this transaction, None = fall through.
    pub fn read_own(&self, key: &DocKey) -> Option<Option<&Vec<u8>>> {
        self.write_set.get(key).map(|op| match op.kind {
            WriteKind::Delete => None,
            _ => op.payload.as_ref(),
        })
    }
}
