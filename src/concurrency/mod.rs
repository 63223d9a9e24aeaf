//! Concurrency primitives: process-level file lock and per-page latches.
//!
//! Single-process access is a design constraint; the exclusive file lock
//! enforces it. In-process, readers share the engine lock while staging
//! and apply take it exclusively, and the commit/checkpoint phases
//! additionally serialize on the writer lock. Page latches protect
//! individual page access in the shared backends: readers take them
//! shared during descent, writers exclusively.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fs4::fs_std::FileExt;
use parking_lot::{Mutex, RwLock};

use crate::error::{GaldrError, Result};
use crate::storage::page::PageId;

/// Exclusive advisory lock on a sidecar `.lock` file, held for the life
/// of the database handle.
pub struct ProcessLock {
    lock_file: File,
    #[allow(dead_code)]
    lock_path: PathBuf,
}

impl ProcessLock {
    pub fn acquire(db_path: &Path) -> Result<Self> {
        let lock_path = db_path.with_extension("lock");
        let lock_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&lock_path)?;

        if let Err(e) = lock_file.try_lock_exclusive() {
            if e.kind() == std::io::ErrorKind::WouldBlock {
                return Err(GaldrError::Lock(format!(
                    "database {} is locked by another process",
                    db_path.display()
                )));
            }
            return Err(GaldrError::Lock(format!("failed to acquire file lock: {}", e)));
        }

        Ok(ProcessLock { lock_file, lock_path })
    }
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        let _ = self.lock_file.unlock();
    }
}

/// Reader/writer latches per page id, acquired root-to-leaf during tree
/// descent and released bottom-up.
#[derive(Default)]
pub struct PageLockManager {
    latches: Mutex<HashMap<PageId, Arc<RwLock<()>>>>,
}

impl PageLockManager {
    pub fn new() -> Self {
        PageLockManager::default()
    }

    fn latch(&self, id: PageId) -> Arc<RwLock<()>> {
        let mut latches = self.latches.lock();
        latches.entry(id).or_insert_with(|| Arc::new(RwLock::new(()))).clone()
    }

    pub fn shared(&self, id: PageId) -> PageLatch {
        let latch = self.latch(id);
        std::mem::forget(latch.read());
        PageLatch { latch, exclusive: false }
    }

    pub fn exclusive(&self, id: PageId) -> PageLatch {
        let latch = self.latch(id);
        std::mem::forget(latch.write());
        PageLatch { latch, exclusive: true }
    }
}

/// RAII page latch; unlocks on drop.
pub struct PageLatch {
    latch: Arc<RwLock<()>>,
    exclusive: bool,
}

impl Drop for PageLatch {
    fn drop(&mut self) {
        // Safety: constructed only after the matching forgotten guard was
        // acquired on this latch.
        unsafe {
            if self.exclusive {
                self.latch.force_unlock_write();
            } else {
                self.latch.force_unlock_read();
            }
        }
    }
}
