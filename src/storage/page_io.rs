//! Page I/O backends.
//!
//! All variants share one contract: fixed-size pages addressed by id,
//! reads of a never-written page return zeros, `flush` makes prior writes
//! durable. Backends are shared between concurrent readers and are
//! internally synchronized: only the raw file access sits behind a lock,
//! so page decryption and buffer copies overlap across threads. The
//! encrypted variant stores the first page at file offset 32 (after the
//! plaintext crypto header) and authenticates every page with
//! AES-256-GCM, keeping nonce/tag/version in the page trailer.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use memmap2::MmapMut;
use parking_lot::{Mutex, RwLock};

use crate::crypto::aead::{PageCrypto, NONCE_SIZE, TAG_SIZE};
use crate::crypto::kdf::CRYPTO_HEADER_SIZE;
use crate::error::{GaldrError, Result};
use crate::storage::page::{PageId, ENCRYPTION_TRAILER, FORMAT_VERSION};

pub trait PageIo: Send + Sync {
    fn page_size(&self) -> usize;

    /// Bytes usable by page layouts (page size minus any trailer).
    fn usable_size(&self) -> usize;

    /// Read a full page into `buf` (length = page size). Pages beyond the
    /// current file length read as zeros.
    fn read_page(&self, id: PageId, buf: &mut [u8]) -> Result<()>;

    /// Write a full page from `buf` (length = page size).
    fn write_page(&self, id: PageId, buf: &[u8]) -> Result<()>;

    fn flush(&self) -> Result<()>;

    /// Grow or shrink the backing store to hold `pages` pages.
    fn set_len_pages(&self, pages: u32) -> Result<()>;
}

// --- Standard file-backed variant ---

pub struct FilePageIo {
    file: Mutex<File>,
    page_size: usize,
    len_bytes: AtomicU64,
}

impl FilePageIo {
    pub fn create(path: &Path, page_size: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        Ok(FilePageIo {
            file: Mutex::new(file),
            page_size,
            len_bytes: AtomicU64::new(0),
        })
    }

    pub fn open(path: &Path, page_size: usize) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len_bytes = file.metadata()?.len();
        Ok(FilePageIo {
            file: Mutex::new(file),
            page_size,
            len_bytes: AtomicU64::new(len_bytes),
        })
    }
}

impl PageIo for FilePageIo {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn usable_size(&self) -> usize {
        self.page_size
    }

    fn read_page(&self, id: PageId, buf: &mut [u8]) -> Result<()> {
        let offset = id as u64 * self.page_size as u64;
        if offset >= self.len_bytes.load(Ordering::Acquire) {
            buf.fill(0);
            return Ok(());
        }
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }

    fn write_page(&self, id: PageId, buf: &[u8]) -> Result<()> {
        let offset = id as u64 * self.page_size as u64;
        {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(buf)?;
        }
        self.len_bytes
            .fetch_max(offset + self.page_size as u64, Ordering::AcqRel);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }

    fn set_len_pages(&self, pages: u32) -> Result<()> {
        let len = pages as u64 * self.page_size as u64;
        self.file.lock().set_len(len)?;
        self.len_bytes.store(len, Ordering::Release);
        Ok(())
    }
}

// --- Memory-mapped variant ---

pub struct MmapPageIo {
    file: Mutex<File>,
    map: RwLock<Option<MmapMut>>,
    page_size: usize,
}

impl MmapPageIo {
    pub fn create(path: &Path, page_size: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        Ok(MmapPageIo {
            file: Mutex::new(file),
            map: RwLock::new(None),
            page_size,
        })
    }

    pub fn open(path: &Path, page_size: usize) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len_bytes = file.metadata()?.len();
        let map = if len_bytes > 0 {
            // Safety: the process file lock guarantees no other process maps
            // this file while we hold it.
            Some(unsafe { MmapMut::map_mut(&file)? })
        } else {
            None
        };
        Ok(MmapPageIo {
            file: Mutex::new(file),
            map: RwLock::new(map),
            page_size,
        })
    }
}

impl PageIo for MmapPageIo {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn usable_size(&self) -> usize {
        self.page_size
    }

    fn read_page(&self, id: PageId, buf: &mut [u8]) -> Result<()> {
        let offset = id as usize * self.page_size;
        match &*self.map.read() {
            Some(map) if offset + self.page_size <= map.len() => {
                buf.copy_from_slice(&map[offset..offset + self.page_size]);
            }
            _ => buf.fill(0),
        }
        Ok(())
    }

    fn write_page(&self, id: PageId, buf: &[u8]) -> Result<()> {
        let offset = id as usize * self.page_size;
        let end = (offset + self.page_size) as u64;
        let mut map = self.map.write();
        let too_small = map.as_ref().map(|m| m.len() < end as usize).unwrap_or(true);
        if too_small {
            let file = self.file.lock();
            file.set_len(end)?;
            *map = Some(unsafe { MmapMut::map_mut(&*file)? });
        }
        let map = map
            .as_mut()
            .ok_or_else(|| GaldrError::Corruption("mmap missing after growth".into()))?;
        map[offset..offset + self.page_size].copy_from_slice(buf);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        if let Some(map) = &*self.map.read() {
            map.flush()?;
        }
        self.file.lock().sync_all()?;
        Ok(())
    }

    fn set_len_pages(&self, pages: u32) -> Result<()> {
        let len = pages as u64 * self.page_size as u64;
        let mut map = self.map.write();
        *map = None;
        let file = self.file.lock();
        file.set_len(len)?;
        *map = if len > 0 {
            Some(unsafe { MmapMut::map_mut(&*file)? })
        } else {
            None
        };
        Ok(())
    }
}

// --- In-memory variant (tests) ---

pub struct MemoryPageIo {
    data: RwLock<Vec<u8>>,
    page_size: usize,
}

impl MemoryPageIo {
    pub fn new(page_size: usize) -> Self {
        MemoryPageIo {
            data: RwLock::new(Vec::new()),
            page_size,
        }
    }
}

impl PageIo for MemoryPageIo {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn usable_size(&self) -> usize {
        self.page_size
    }

    fn read_page(&self, id: PageId, buf: &mut [u8]) -> Result<()> {
        let offset = id as usize * self.page_size;
        let data = self.data.read();
        if offset + self.page_size <= data.len() {
            buf.copy_from_slice(&data[offset..offset + self.page_size]);
        } else {
            buf.fill(0);
        }
        Ok(())
    }

    fn write_page(&self, id: PageId, buf: &[u8]) -> Result<()> {
        let offset = id as usize * self.page_size;
        let end = offset + self.page_size;
        let mut data = self.data.write();
        if end > data.len() {
            data.resize(end, 0);
        }
        data[offset..end].copy_from_slice(buf);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn set_len_pages(&self, pages: u32) -> Result<()> {
        self.data.write().resize(pages as usize * self.page_size, 0);
        Ok(())
    }
}

// --- Encrypted variant ---

/// On-disk page layout: ciphertext(page_size - 32) || nonce(12) || tag(16)
/// || version(4). The first page lives at file offset 32, after the
/// plaintext crypto header. Raw reads happen under the file lock; the
/// AEAD work runs outside it, so concurrent readers decrypt in parallel.
pub struct EncryptedPageIo {
    file: Mutex<File>,
    crypto: PageCrypto,
    page_size: usize,
    len_bytes: AtomicU64,
}

impl EncryptedPageIo {
    pub fn create(path: &Path, page_size: usize, crypto: PageCrypto, header: &[u8]) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        file.write_all(header)?;
        Ok(EncryptedPageIo {
            file: Mutex::new(file),
            crypto,
            page_size,
            len_bytes: AtomicU64::new(CRYPTO_HEADER_SIZE as u64),
        })
    }

    pub fn open(path: &Path, page_size: usize, crypto: PageCrypto) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len_bytes = file.metadata()?.len();
        Ok(EncryptedPageIo {
            file: Mutex::new(file),
            crypto,
            page_size,
            len_bytes: AtomicU64::new(len_bytes),
        })
    }

    fn page_offset(&self, id: PageId) -> u64 {
        CRYPTO_HEADER_SIZE as u64 + id as u64 * self.page_size as u64
    }
}

impl PageIo for EncryptedPageIo {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn usable_size(&self) -> usize {
        self.page_size - ENCRYPTION_TRAILER
    }

    fn read_page(&self, id: PageId, buf: &mut [u8]) -> Result<()> {
        let offset = self.page_offset(id);
        if offset + self.page_size as u64 > self.len_bytes.load(Ordering::Acquire) {
            buf.fill(0);
            return Ok(());
        }
        {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(buf)?;
        }

        // A grown-but-never-written page is all zeros; not ciphertext.
        if buf.iter().all(|&b| b == 0) {
            return Ok(());
        }

        let usable = self.usable_size();
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&buf[usable..usable + NONCE_SIZE]);
        let mut tag = [0u8; TAG_SIZE];
        tag.copy_from_slice(&buf[usable + NONCE_SIZE..usable + NONCE_SIZE + TAG_SIZE]);
        let version =
            u32::from_le_bytes(buf[usable + NONCE_SIZE + TAG_SIZE..self.page_size].try_into().unwrap());

        self.crypto
            .decrypt_detached(id, version, &nonce, &tag, &mut buf[..usable])
            .map_err(|_| {
                if id == 0 {
                    // Page 0 is the password oracle.
                    GaldrError::InvalidPassword
                } else {
                    GaldrError::Corruption(format!("page {} failed authentication", id))
                }
            })?;
        for b in buf[usable..].iter_mut() {
            *b = 0;
        }
        Ok(())
    }

    fn write_page(&self, id: PageId, buf: &[u8]) -> Result<()> {
        let usable = self.usable_size();
        let mut out = buf[..usable].to_vec();
        let (nonce, tag) = self.crypto.encrypt_detached(id, FORMAT_VERSION, &mut out)?;
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&tag);
        out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        debug_assert_eq!(out.len(), self.page_size);

        let offset = self.page_offset(id);
        {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(&out)?;
        }
        self.len_bytes
            .fetch_max(offset + self.page_size as u64, Ordering::AcqRel);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }

    fn set_len_pages(&self, pages: u32) -> Result<()> {
        let len = CRYPTO_HEADER_SIZE as u64 + pages as u64 * self.page_size as u64;
        self.file.lock().set_len(len)?;
        self.len_bytes.store(len, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::aead::MasterKey;
    use tempfile::TempDir;

    #[test]
    fn test_memory_io_zero_reads() {
        let io = MemoryPageIo::new(4096);
        let mut buf = vec![0xFFu8; 4096];
        io.read_page(10, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_file_io_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pages.db");
        let io = FilePageIo::create(&path, 4096).unwrap();

        let page = vec![0xABu8; 4096];
        io.write_page(3, &page).unwrap();
        io.flush().unwrap();

        let mut buf = vec![0u8; 4096];
        io.read_page(3, &mut buf).unwrap();
        assert_eq!(buf, page);

        // Unwritten pages in the hole read as zeros.
        io.read_page(1, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_mmap_io_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pages.db");
        let io = MmapPageIo::create(&path, 4096).unwrap();

        let page = vec![0x5Au8; 4096];
        io.write_page(2, &page).unwrap();
        io.flush().unwrap();

        let mut buf = vec![0u8; 4096];
        io.read_page(2, &mut buf).unwrap();
        assert_eq!(buf, page);
    }

    #[test]
    fn test_concurrent_readers_share_backend() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pages.db");
        let io = std::sync::Arc::new(FilePageIo::create(&path, 4096).unwrap());
        for id in 0..8u32 {
            io.write_page(id, &vec![id as u8; 4096]).unwrap();
        }

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let io = std::sync::Arc::clone(&io);
                std::thread::spawn(move || {
                    let mut buf = vec![0u8; 4096];
                    for round in 0..50u32 {
                        let id = round % 8;
                        io.read_page(id, &mut buf).unwrap();
                        assert!(buf.iter().all(|&b| b == id as u8));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_encrypted_io_roundtrip_and_wrong_key() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pages.db");
        let key = MasterKey::new([0x42u8; 32]);
        let header = [0x11u8; CRYPTO_HEADER_SIZE];

        {
            let io =
                EncryptedPageIo::create(&path, 4096, PageCrypto::new(&key), &header).unwrap();
            let mut page = vec![0u8; 4096];
            page[..5].copy_from_slice(b"hello");
            io.write_page(0, &page).unwrap();
            io.flush().unwrap();
        }

        {
            let io = EncryptedPageIo::open(&path, 4096, PageCrypto::new(&key)).unwrap();
            let mut buf = vec![0u8; 4096];
            io.read_page(0, &mut buf).unwrap();
            assert_eq!(&buf[..5], b"hello");
        }

        {
            let wrong = MasterKey::new([0x99u8; 32]);
            let io = EncryptedPageIo::open(&path, 4096, PageCrypto::new(&wrong)).unwrap();
            let mut buf = vec![0u8; 4096];
            let err = io.read_page(0, &mut buf).unwrap_err();
            assert!(matches!(err, GaldrError::InvalidPassword));
        }
    }

    #[test]
    fn test_encrypted_io_no_plaintext_on_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pages.db");
        let key = MasterKey::new([0x42u8; 32]);
        let header = [0u8; CRYPTO_HEADER_SIZE];

        let io = EncryptedPageIo::create(&path, 4096, PageCrypto::new(&key), &header).unwrap();
        let mut page = vec![0u8; 4096];
        page[100..118].copy_from_slice(b"super secret value");
        io.write_page(1, &page).unwrap();
        io.flush().unwrap();
        drop(io);

        let raw = std::fs::read(&path).unwrap();
        assert!(!raw
            .windows(b"super secret value".len())
            .any(|w| w == b"super secret value"));
    }
}
