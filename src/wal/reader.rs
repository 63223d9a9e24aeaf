use std::fs::File;
use std::io::Read;
use std::path::Path;

use log::warn;

use crate::crypto::aead::PageCrypto;
use crate::error::Result;
use crate::wal::record::WalRecord;

/// Sequential WAL reader used by recovery.
///
/// A torn tail (truncated frame, bad checksum, failed decryption) ends the
/// scan: everything before it is intact, everything after it never became
/// durable.
pub struct WalReader {
    data: Vec<u8>,
    crypto: Option<PageCrypto>,
}

impl WalReader {
    pub fn open(path: &Path, crypto: Option<PageCrypto>) -> Result<Self> {
        let mut data = Vec::new();
        File::open(path)?.read_to_end(&mut data)?;
        Ok(WalReader { data, crypto })
    }

    pub fn read_all(&self) -> Vec<(u64, WalRecord)> {
        let mut records = Vec::new();
        let mut offset = 0usize;
        let mut lsn = 0u64;

        loop {
            if offset + 4 > self.data.len() {
                break;
            }
            let frame_len =
                u32::from_le_bytes(self.data[offset..offset + 4].try_into().unwrap()) as usize;
            offset += 4;
            if offset + frame_len > self.data.len() {
                warn!("wal: torn frame at lsn {}, discarding tail", lsn);
                break;
            }
            let frame = &self.data[offset..offset + frame_len];
            offset += frame_len;

            let payload = match &self.crypto {
                Some(crypto) => match crypto.open(lsn as u32, 0, frame) {
                    Ok(p) => p,
                    Err(_) => {
                        warn!("wal: frame {} failed authentication, discarding tail", lsn);
                        break;
                    }
                },
                None => frame.to_vec(),
            };

            if payload.len() < 4 {
                warn!("wal: frame {} too short, discarding tail", lsn);
                break;
            }
            let (body, crc_bytes) = payload.split_at(payload.len() - 4);
            let stored_crc = u32::from_le_bytes(crc_bytes.try_into().unwrap());
            if crc32fast::hash(body) != stored_crc {
                warn!("wal: frame {} checksum mismatch, discarding tail", lsn);
                break;
            }

            match WalRecord::deserialize(body) {
                Some(record) => records.push((lsn, record)),
                None => {
                    warn!("wal: frame {} is malformed, discarding tail", lsn);
                    break;
                }
            }
            lsn += 1;
        }
        records
    }
}
