//! WAL record types.
//!
//! Frame on disk: `[frame_len u32][payload]` where payload is the record
//! bytes followed by a crc32 (the whole payload is sealed with AES-GCM in
//! encrypted databases). Records:
//!   PageImage { txn_id, page_id, frame_index, salt, data }
//!   Commit    { magic, txn_id, salt }
//!
//! A transaction is durable once its Commit record hits the log; replay
//! discards page images of transactions without one.

use crate::storage::page::PageId;

pub type TxnId = u64;
pub type Lsn = u64;

/// "GLDC" little-endian.
pub const COMMIT_MAGIC: u32 = 0x43_44_4C_47;

const TAG_PAGE_IMAGE: u8 = 1;
const TAG_COMMIT: u8 = 2;

#[derive(Debug, Clone)]
pub enum WalRecord {
    PageImage {
        txn_id: TxnId,
        page_id: PageId,
        frame_index: u32,
        salt: u32,
        data: Vec<u8>,
    },
    Commit {
        txn_id: TxnId,
        salt: u32,
    },
}

impl WalRecord {
    pub fn txn_id(&self) -> TxnId {
        match self {
            WalRecord::PageImage { txn_id, .. } => *txn_id,
            WalRecord::Commit { txn_id, .. } => *txn_id,
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        match self {
            WalRecord::PageImage {
                txn_id,
                page_id,
                frame_index,
                salt,
                data,
            } => {
                let mut buf = Vec::with_capacity(1 + 8 + 4 + 4 + 4 + 4 + data.len());
                buf.push(TAG_PAGE_IMAGE);
                buf.extend_from_slice(&txn_id.to_le_bytes());
                buf.extend_from_slice(&page_id.to_le_bytes());
                buf.extend_from_slice(&frame_index.to_le_bytes());
                buf.extend_from_slice(&salt.to_le_bytes());
                buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
                buf.extend_from_slice(data);
                buf
            }
            WalRecord::Commit { txn_id, salt } => {
                let mut buf = Vec::with_capacity(1 + 4 + 8 + 4);
                buf.push(TAG_COMMIT);
                buf.extend_from_slice(&COMMIT_MAGIC.to_le_bytes());
                buf.extend_from_slice(&txn_id.to_le_bytes());
                buf.extend_from_slice(&salt.to_le_bytes());
                buf
            }
        }
    }

    pub fn deserialize(data: &[u8]) -> Option<WalRecord> {
        match *data.first()? {
            TAG_PAGE_IMAGE => {
                if data.len() < 25 {
                    return None;
                }
                let txn_id = u64::from_le_bytes(data[1..9].try_into().unwrap());
                let page_id = u32::from_le_bytes(data[9..13].try_into().unwrap());
                let frame_index = u32::from_le_bytes(data[13..17].try_into().unwrap());
                let salt = u32::from_le_bytes(data[17..21].try_into().unwrap());
                let len = u32::from_le_bytes(data[21..25].try_into().unwrap()) as usize;
                if data.len() < 25 + len {
                    return None;
                }
                Some(WalRecord::PageImage {
                    txn_id,
                    page_id,
                    frame_index,
                    salt,
                    data: data[25..25 + len].to_vec(),
                })
            }
            TAG_COMMIT => {
                if data.len() < 17 {
                    return None;
                }
                let magic = u32::from_le_bytes(data[1..5].try_into().unwrap());
                if magic != COMMIT_MAGIC {
                    return None;
                }
                let txn_id = u64::from_le_bytes(data[5..13].try_into().unwrap());
                let salt = u32::from_le_bytes(data[13..17].try_into().unwrap());
                Some(WalRecord::Commit { txn_id, salt })
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_image_roundtrip() {
        let record = WalRecord::PageImage {
            txn_id: 7,
            page_id: 42,
            frame_index: 3,
            salt: 0xDEAD,
            data: vec![0xAB; 128],
        };
        let parsed = WalRecord::deserialize(&record.serialize()).unwrap();
        match parsed {
            WalRecord::PageImage { txn_id, page_id, frame_index, salt, data } => {
                assert_eq!((txn_id, page_id, frame_index, salt), (7, 42, 3, 0xDEAD));
                assert_eq!(data, vec![0xAB; 128]);
            }
            _ => panic!("wrong record kind"),
        }
    }

    #[test]
    fn test_commit_roundtrip_and_magic() {
        let record = WalRecord::Commit { txn_id: 9, salt: 5 };
        let bytes = record.serialize();
        assert!(WalRecord::deserialize(&bytes).is_some());

        let mut tampered = bytes.clone();
        tampered[2] ^= 0xFF; // clobber the magic
        assert!(WalRecord::deserialize(&tampered).is_none());
    }

    #[test]
    fn test_truncated_rejected() {
        let record = WalRecord::PageImage {
            txn_id: 1,
            page_id: 1,
            frame_index: 0,
            salt: 0,
            data: vec![1, 2, 3],
        };
        let bytes = record.serialize();
        assert!(WalRecord::deserialize(&bytes[..bytes.len() - 1]).is_none());
    }
}
