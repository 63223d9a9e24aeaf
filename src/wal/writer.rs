use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use rand::RngCore;

use crate::crypto::aead::PageCrypto;
use crate::error::Result;
use crate::wal::record::{Lsn, WalRecord};

/// Append-only WAL writer. Each frame is `[len u32][payload]`; payload is
/// `record || crc32`, sealed with AES-GCM (LSN-bound) when the database is
/// encrypted.
pub struct WalWriter {
    file: File,
    crypto: Option<PageCrypto>,
    lsn: Lsn,
    salt: u32,
    bytes: u64,
}

impl WalWriter {
    /// Create (truncating any leftover log; recovery has already consumed
    /// it). A fresh random salt ties this log generation's frames together.
    pub fn create(path: &Path, crypto: Option<PageCrypto>) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        Ok(WalWriter {
            file,
            crypto,
            lsn: 0,
            salt: rand::thread_rng().next_u32(),
            bytes: 0,
        })
    }

    pub fn salt(&self) -> u32 {
        self.salt
    }

    pub fn current_lsn(&self) -> Lsn {
        self.lsn
    }

    pub fn size_bytes(&self) -> u64 {
        self.bytes
    }

    pub fn append(&mut self, record: &WalRecord) -> Result<Lsn> {
        let lsn = self.lsn;

        let mut payload = record.serialize();
        let crc = crc32fast::hash(&payload);
        payload.extend_from_slice(&crc.to_le_bytes());

        let framed = match &self.crypto {
            Some(crypto) => crypto.seal(lsn as u32, 0, &payload)?,
            None => payload,
        };

        self.file.write_all(&(framed.len() as u32).to_le_bytes())?;
        self.file.write_all(&framed)?;
        self.bytes += 4 + framed.len() as u64;
        self.lsn += 1;
        Ok(lsn)
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Durably truncate after a checkpoint and start a new log generation.
    pub fn truncate(&mut self) -> Result<()> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.sync_all()?;
        self.lsn = 0;
        self.bytes = 0;
        self.salt = rand::thread_rng().next_u32();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::aead::MasterKey;
    use tempfile::TempDir;

    #[test]
    fn test_append_and_truncate() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.wal");
        let mut writer = WalWriter::create(&path, None).unwrap();

        let lsn0 = writer
            .append(&WalRecord::PageImage {
                txn_id: 1,
                page_id: 5,
                frame_index: 0,
                salt: writer.salt(),
                data: vec![0xFF; 64],
            })
            .unwrap();
        let lsn1 = writer
            .append(&WalRecord::Commit { txn_id: 1, salt: writer.salt() })
            .unwrap();
        assert_eq!((lsn0, lsn1), (0, 1));
        writer.sync().unwrap();
        assert!(writer.size_bytes() > 0);

        writer.truncate().unwrap();
        assert_eq!(writer.size_bytes(), 0);
        assert_eq!(writer.current_lsn(), 0);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
    }

    #[test]
    fn test_encrypted_frames_hide_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.wal");
        let key = MasterKey::new([0x42u8; 32]);
        let mut writer = WalWriter::create(&path, Some(PageCrypto::new(&key))).unwrap();

        let body = b"very recognizable page bytes".to_vec();
        writer
            .append(&WalRecord::PageImage {
                txn_id: 1,
                page_id: 1,
                frame_index: 0,
                salt: writer.salt(),
                data: body.clone(),
            })
            .unwrap();
        writer.sync().unwrap();

        let raw = std::fs::read(&path).unwrap();
        assert!(!raw.windows(body.len()).any(|w| w == body.as_slice()));
    }
}
