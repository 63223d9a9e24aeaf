/// Free-space map: one byte per page, a 0-255 bucket of the free bytes in
/// slotted data pages. Non-data pages keep bucket 0. The map is a hint:
/// inserts verify the actual page before using it, so a stale bucket is
/// harmless.

use crate::error::{GaldrError, Result};
use crate::storage::page::{Page, PageId, PageType, NO_PAGE};

const PAGE_HEADER: usize = 4;
const NEXT_PTR: usize = 4;

pub fn entries_per_page(usable: usize) -> u32 {
    (usable - PAGE_HEADER - NEXT_PTR) as u32
}

pub fn bucket_for(free_bytes: usize, usable: usize) -> u8 {
    ((free_bytes * 255) / usable).min(255) as u8
}

pub struct FreeSpaceMap {
    buckets: Vec<u8>,
    page_ids: Vec<PageId>,
    entries_per_page: u32,
    dirty: bool,
}

impl FreeSpaceMap {
    pub fn new(usable: usize, first_page: PageId) -> Self {
        let epp = entries_per_page(usable);
        FreeSpaceMap {
            buckets: vec![0u8; epp as usize],
            page_ids: vec![first_page],
            entries_per_page: epp,
            dirty: true,
        }
    }

    pub fn from_chain(pages: &[Page], usable: usize) -> Result<Self> {
        let epp = entries_per_page(usable);
        let mut buckets = Vec::with_capacity(pages.len() * epp as usize);
        let mut page_ids = Vec::with_capacity(pages.len());
        for page in pages {
            if page.page_type() != Some(PageType::FreeSpaceMap) {
                return Err(GaldrError::Corruption(format!(
                    "page {} is not a free-space map page",
                    page.id()
                )));
            }
            buckets.extend_from_slice(page.read_bytes(PAGE_HEADER, epp as usize));
            page_ids.push(page.id());
        }
        Ok(FreeSpaceMap {
            buckets,
            page_ids,
            entries_per_page: epp,
            dirty: false,
        })
    }

    pub fn capacity(&self) -> u32 {
        self.buckets.len() as u32
    }

    pub fn page_ids(&self) -> &[PageId] {
        &self.page_ids
    }

    pub fn page_count(&self) -> u32 {
        self.page_ids.len() as u32
    }

    pub fn bucket(&self, id: PageId) -> u8 {
        self.buckets.get(id as usize).copied().unwrap_or(0)
    }

    pub fn set_bucket(&mut self, id: PageId, bucket: u8) {
        if let Some(entry) = self.buckets.get_mut(id as usize) {
            if *entry != bucket {
                *entry = bucket;
                self.dirty = true;
            }
        }
    }

    /// Find a data page whose bucket suggests at least `min_bucket` of free
    /// space, preferring pages near `hint`.
    pub fn find_with_space(&self, min_bucket: u8, hint: PageId, limit: u32) -> Option<PageId> {
        let limit = limit.min(self.capacity());
        if limit == 0 {
            return None;
        }
        let start = if hint < limit { hint } else { 0 };
        for i in 0..limit {
            let id = (start + i) % limit;
            if id == 0 {
                continue;
            }
            if self.buckets[id as usize] >= min_bucket && self.buckets[id as usize] > 0 {
                return Some(id);
            }
        }
        None
    }

    pub fn add_page(&mut self, page_id: PageId) {
        self.page_ids.push(page_id);
        self.buckets
            .resize(self.buckets.len() + self.entries_per_page as usize, 0);
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    pub fn force_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn serialize(&self, page_size: usize, usable: usize) -> Vec<Page> {
        let epp = self.entries_per_page as usize;
        let mut pages = Vec::with_capacity(self.page_ids.len());
        for (i, &id) in self.page_ids.iter().enumerate() {
            let mut page = Page::new(id, page_size, usable);
            page.set_page_type(PageType::FreeSpaceMap);
            let start = i * epp;
            let end = (start + epp).min(self.buckets.len());
            page.write_bytes(PAGE_HEADER, &self.buckets[start..end]);
            let next = self.page_ids.get(i + 1).copied().unwrap_or(NO_PAGE);
            page.write_u32(usable - NEXT_PTR, next);
            pages.push(page);
        }
        pages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const USABLE: usize = 4096;

    #[test]
    fn test_bucket_math() {
        assert_eq!(bucket_for(0, 4096), 0);
        assert_eq!(bucket_for(4096, 4096), 255);
        assert!(bucket_for(2048, 4096) > 120);
    }

    #[test]
    fn test_find_with_space() {
        let mut fsm = FreeSpaceMap::new(USABLE, 2);
        fsm.set_bucket(5, 200);
        fsm.set_bucket(9, 40);

        assert_eq!(fsm.find_with_space(100, 0, 100), Some(5));
        assert_eq!(fsm.find_with_space(30, 6, 100), Some(9));
        assert_eq!(fsm.find_with_space(250, 0, 100), None);
    }

    #[test]
    fn test_serialize_roundtrip() {
        let mut fsm = FreeSpaceMap::new(USABLE, 2);
        fsm.set_bucket(7, 123);
        let pages = fsm.serialize(USABLE, USABLE);
        let restored = FreeSpaceMap::from_chain(&pages, USABLE).unwrap();
        assert_eq!(restored.bucket(7), 123);
        assert_eq!(restored.bucket(8), 0);
    }
}
