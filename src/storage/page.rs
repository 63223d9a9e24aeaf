/// Fixed-size page buffer and the common page-type prefix.
///
/// Every page except the header (page 0) carries its type in byte 0.
/// In encrypted files the trailing 32 bytes of each page hold the
/// nonce/tag/version trailer; `limit` marks the end of the usable prefix.

pub type PageId = u32;

/// Null page reference in chains and sibling links. Page 0 is the header
/// and is never a chain target.
pub const NO_PAGE: PageId = 0;

/// "GLDB" little-endian.
pub const DB_MAGIC: u32 = 0x42_44_4C_47;
pub const FORMAT_VERSION: u32 = 1;

/// Reserved trailer in encrypted pages: nonce(12) + tag(16) + version(4).
pub const ENCRYPTION_TRAILER: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    Header,
    AllocationBitmap,
    FreeSpaceMap,
    CollectionsCatalog,
    SlottedData,
    PrimaryBTreeNode,
    SecondaryBTreeNode,
    LargeDocumentOverflow,
    Free,
}

impl PageType {
    pub fn code(&self) -> u8 {
        match self {
            PageType::Header => 0,
            PageType::AllocationBitmap => 1,
            PageType::FreeSpaceMap => 2,
            PageType::CollectionsCatalog => 3,
            PageType::SlottedData => 4,
            PageType::PrimaryBTreeNode => 5,
            PageType::SecondaryBTreeNode => 6,
            PageType::LargeDocumentOverflow => 7,
            PageType::Free => 8,
        }
    }

    pub fn from_code(code: u8) -> Option<PageType> {
        Some(match code {
            0 => PageType::Header,
            1 => PageType::AllocationBitmap,
            2 => PageType::FreeSpaceMap,
            3 => PageType::CollectionsCatalog,
            4 => PageType::SlottedData,
            5 => PageType::PrimaryBTreeNode,
            6 => PageType::SecondaryBTreeNode,
            7 => PageType::LargeDocumentOverflow,
            8 => PageType::Free,
            _ => return None,
        })
    }
}

/// Physical location of a document: data page + slot index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DocLocation {
    pub page: PageId,
    pub slot: u16,
}

pub const LOCATION_SIZE: usize = 6;

impl DocLocation {
    pub fn new(page: PageId, slot: u16) -> Self {
        DocLocation { page, slot }
    }

    pub fn to_bytes(&self) -> [u8; LOCATION_SIZE] {
        let mut buf = [0u8; LOCATION_SIZE];
        buf[0..4].copy_from_slice(&self.page.to_le_bytes());
        buf[4..6].copy_from_slice(&self.slot.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < LOCATION_SIZE {
            return None;
        }
        Some(DocLocation {
            page: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            slot: u16::from_le_bytes(buf[4..6].try_into().unwrap()),
        })
    }
}

#[derive(Clone)]
pub struct Page {
    id: PageId,
    data: Vec<u8>,
    limit: usize,
}

impl Page {
    pub fn new(id: PageId, page_size: usize, limit: usize) -> Self {
        Page {
            id,
            data: vec![0u8; page_size],
            limit,
        }
    }

    pub fn from_bytes(id: PageId, data: Vec<u8>, limit: usize) -> Self {
        Page { id, data, limit }
    }

    pub fn id(&self) -> PageId {
        self.id
    }

    /// End of the usable region (page size minus the encryption trailer).
    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn page_type(&self) -> Option<PageType> {
        PageType::from_code(self.data[0])
    }

    pub fn set_page_type(&mut self, page_type: PageType) {
        self.data[0] = page_type.code();
    }

    pub fn read_u8(&self, offset: usize) -> u8 {
        self.data[offset]
    }

    pub fn write_u8(&mut self, offset: usize, value: u8) {
        self.data[offset] = value;
    }

    pub fn read_u16(&self, offset: usize) -> u16 {
        u16::from_le_bytes(self.data[offset..offset + 2].try_into().unwrap())
    }

    pub fn write_u16(&mut self, offset: usize, value: u16) {
        self.data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }

    pub fn read_u32(&self, offset: usize) -> u32 {
        u32::from_le_bytes(self.data[offset..offset + 4].try_into().unwrap())
    }

    pub fn write_u32(&mut self, offset: usize, value: u32) {
        self.data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub fn read_u64(&self, offset: usize) -> u64 {
        u64::from_le_bytes(self.data[offset..offset + 8].try_into().unwrap())
    }

    pub fn write_u64(&mut self, offset: usize, value: u64) {
        self.data[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }

    pub fn read_bytes(&self, offset: usize, len: usize) -> &[u8] {
        &self.data[offset..offset + len]
    }

    pub fn write_bytes(&mut self, offset: usize, bytes: &[u8]) {
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    /// Zero the usable region, keeping the buffer size.
    pub fn clear(&mut self) {
        for b in self.data.iter_mut() {
            *b = 0;
        }
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("id", &self.id)
            .field("type", &self.page_type())
            .field("limit", &self.limit)
            .finish()
    }
}

/// Database header stored at fixed offsets in page 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbHeader {
    pub page_size: u32,
    pub total_pages: u32,
    pub bitmap_start: PageId,
    pub bitmap_pages: u32,
    pub fsm_start: PageId,
    pub fsm_pages: u32,
    pub catalog_start: PageId,
    pub catalog_pages: u32,
    pub flags: u32,
}

pub const HEADER_FLAG_ENCRYPTED: u32 = 1;
pub const HEADER_FLAG_WAL: u32 = 2;

impl DbHeader {
    pub fn write_to(&self, page: &mut Page) {
        page.write_u32(0, DB_MAGIC);
        page.write_u32(4, FORMAT_VERSION);
        page.write_u32(8, self.page_size);
        page.write_u32(12, self.total_pages);
        page.write_u32(16, self.bitmap_start);
        page.write_u32(20, self.bitmap_pages);
        page.write_u32(24, self.fsm_start);
        page.write_u32(28, self.fsm_pages);
        page.write_u32(32, self.catalog_start);
        page.write_u32(36, self.catalog_pages);
        page.write_u32(40, self.flags);
    }

    pub fn read_from(page: &Page) -> crate::error::Result<DbHeader> {
        let magic = page.read_u32(0);
        if magic != DB_MAGIC {
            return Err(crate::error::GaldrError::Corruption(
                "bad database magic".into(),
            ));
        }
        let version = page.read_u32(4);
        if version != FORMAT_VERSION {
            return Err(crate::error::GaldrError::Corruption(format!(
                "unsupported format version {}",
                version
            )));
        }
        Ok(DbHeader {
            page_size: page.read_u32(8),
            total_pages: page.read_u32(12),
            bitmap_start: page.read_u32(16),
            bitmap_pages: page.read_u32(20),
            fsm_start: page.read_u32(24),
            fsm_pages: page.read_u32(28),
            catalog_start: page.read_u32(32),
            catalog_pages: page.read_u32(36),
            flags: page.read_u32(40),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let header = DbHeader {
            page_size: 8192,
            total_pages: 42,
            bitmap_start: 1,
            bitmap_pages: 1,
            fsm_start: 2,
            fsm_pages: 1,
            catalog_start: 3,
            catalog_pages: 1,
            flags: HEADER_FLAG_WAL,
        };
        let mut page = Page::new(0, 8192, 8192);
        header.write_to(&mut page);
        assert_eq!(DbHeader::read_from(&page).unwrap(), header);
    }

    #[test]
    fn test_bad_magic() {
        let page = Page::new(0, 8192, 8192);
        assert!(DbHeader::read_from(&page).is_err());
    }

    #[test]
    fn test_location_roundtrip() {
        let loc = DocLocation::new(77, 5);
        assert_eq!(DocLocation::from_bytes(&loc.to_bytes()), Some(loc));
    }
}
