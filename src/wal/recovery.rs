//! Crash recovery: replay committed WAL frames into the main file.
//!
//! Runs before the pager opens. Page images belonging to transactions with
//! a Commit record are applied in log order; everything else is discarded.
//! The caller truncates the WAL durably afterwards.

use std::collections::HashSet;
use std::path::Path;

use log::{info, warn};

use crate::crypto::aead::PageCrypto;
use crate::error::{GaldrError, Result};
use crate::storage::page_io::PageIo;
use crate::wal::reader::WalReader;
use crate::wal::record::{TxnId, WalRecord};

#[derive(Debug, Default)]
pub struct RecoveryResult {
    pub committed_txns: usize,
    pub pages_replayed: usize,
    pub discarded_txns: usize,
}

pub fn replay(
    io: &dyn PageIo,
    wal_path: &Path,
    crypto: Option<PageCrypto>,
) -> Result<RecoveryResult> {
    if !wal_path.exists() {
        return Ok(RecoveryResult::default());
    }

    let reader = WalReader::open(wal_path, crypto)?;
    let records = reader.read_all();
    if records.is_empty() {
        return Ok(RecoveryResult::default());
    }

    let mut committed: HashSet<TxnId> = HashSet::new();
    let mut seen: HashSet<TxnId> = HashSet::new();
    for (_, record) in &records {
        seen.insert(record.txn_id());
        if let WalRecord::Commit { txn_id, .. } = record {
            committed.insert(*txn_id);
        }
    }
    let discarded = seen.len() - committed.len();
    if discarded > 0 {
        warn!("wal: discarding {} uncommitted transaction(s)", discarded);
    }

    let mut pages_replayed = 0usize;
    for (lsn, record) in &records {
        if let WalRecord::PageImage { txn_id, page_id, data, .. } = record {
            if !committed.contains(txn_id) {
                continue;
            }
            if data.len() != io.page_size() {
                return Err(GaldrError::Corruption(format!(
                    "wal frame {} carries a {}-byte image for {}-byte pages",
                    lsn,
                    data.len(),
                    io.page_size()
                )));
            }
            io.write_page(*page_id, data)?;
            pages_replayed += 1;
        }
    }
    io.flush()?;

    info!(
        "wal: replayed {} page(s) from {} committed transaction(s)",
        pages_replayed,
        committed.len()
    );
    Ok(RecoveryResult {
        committed_txns: committed.len(),
        pages_replayed,
        discarded_txns: discarded,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page_io::{FilePageIo, PageIo};
    use crate::wal::writer::WalWriter;
    use tempfile::TempDir;

    const PS: usize = 4096;

    #[test]
    fn test_replay_committed_only() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("test.db");
        let wal_path = dir.path().join("test.wal");

        {
            let io = FilePageIo::create(&db_path, PS).unwrap();
            io.set_len_pages(4).unwrap();
            io.flush().unwrap();
        }

        {
            let mut writer = WalWriter::create(&wal_path, None).unwrap();
            let salt = writer.salt();
            // txn 1: committed
            writer
                .append(&WalRecord::PageImage {
                    txn_id: 1,
                    page_id: 2,
                    frame_index: 0,
                    salt,
                    data: vec![0xAA; PS],
                })
                .unwrap();
            writer.append(&WalRecord::Commit { txn_id: 1, salt }).unwrap();
            // txn 2: no commit record
            writer
                .append(&WalRecord::PageImage {
                    txn_id: 2,
                    page_id: 3,
                    frame_index: 0,
                    salt,
                    data: vec![0xBB; PS],
                })
                .unwrap();
            writer.sync().unwrap();
        }

        let io = FilePageIo::open(&db_path, PS).unwrap();
        let result = replay(&io, &wal_path, None).unwrap();
        assert_eq!(result.committed_txns, 1);
        assert_eq!(result.pages_replayed, 1);
        assert_eq!(result.discarded_txns, 1);

        let mut buf = vec![0u8; PS];
        io.read_page(2, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0xAA));
        io.read_page(3, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0x00));
    }

    #[test]
    fn test_missing_wal_is_noop() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("test.db");
        let io = FilePageIo::create(&db_path, PS).unwrap();
        let result = replay(&io, &dir.path().join("absent.wal"), None).unwrap();
        assert_eq!(result.pages_replayed, 0);
    }
}
