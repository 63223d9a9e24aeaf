//! Transactional page store: the commit pipeline's dirty buffer.
//!
//! Reads fall through to the pager, writes stay in the buffer, and
//! allocations go through the pager's bitmap but are tracked so a failed
//! commit can revert them before anything became visible.

use std::collections::HashMap;

use crate::error::Result;
use crate::storage::page::{Page, PageId, PageType};
use crate::storage::page_store::PageStore;
use crate::storage::pager::PageManager;

pub struct TxPageStore<'a> {
    pager: &'a mut PageManager,
    dirty: HashMap<PageId, Page>,
    allocated: Vec<PageId>,
    freed: Vec<PageId>,
}

impl<'a> TxPageStore<'a> {
    pub fn new(pager: &'a mut PageManager) -> Self {
        TxPageStore {
            pager,
            dirty: HashMap::new(),
            allocated: Vec::new(),
            freed: Vec::new(),
        }
    }

    pub fn pager(&mut self) -> &mut PageManager {
        self.pager
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }

    /// Consume the buffer: dirty pages in id order plus the allocation
    /// trace for rollback.
    pub fn into_parts(self) -> (Vec<Page>, Vec<PageId>, Vec<PageId>) {
        let mut pages: Vec<Page> = self.dirty.into_values().collect();
        pages.sort_by_key(|p| p.id());
        (pages, self.allocated, self.freed)
    }

    /// Revert allocations and frees after a failed commit.
    pub fn abort(self) {
        self.pager.rollback_alloc(&self.allocated);
        self.pager.rollback_free(&self.freed);
    }
}

impl PageStore for TxPageStore<'_> {
    fn read_page(&mut self, id: PageId) -> Result<Page> {
        if let Some(page) = self.dirty.get(&id) {
            return Ok(page.clone());
        }
        self.pager.read_page(id)
    }

    fn write_page(&mut self, page: &Page) -> Result<()> {
        self.dirty.insert(page.id(), page.clone());
        Ok(())
    }

    fn allocate_page(&mut self, hint: PageId, page_type: PageType) -> Result<Page> {
        let id = self.pager.allocate(hint)?;
        self.allocated.push(id);
        let mut page = Page::new(id, self.pager.page_size(), self.pager.usable_size());
        page.set_page_type(page_type);
        Ok(page)
    }

    fn free_page(&mut self, id: PageId) -> Result<()> {
        self.pager.free(id);
        self.freed.push(id);
        self.dirty.remove(&id);
        Ok(())
    }

    fn page_size(&self) -> usize {
        PageStore::page_size(self.pager)
    }

    fn usable_size(&self) -> usize {
        PageStore::usable_size(self.pager)
    }

    fn find_data_page(&mut self, min_free: usize) -> Option<PageId> {
        self.pager.fsm_find(min_free, 0)
    }

    fn note_data_page_free(&mut self, id: PageId, free_bytes: usize) {
        self.pager.fsm_update(id, free_bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page_io::MemoryPageIo;

    fn pager() -> PageManager {
        PageManager::create(Box::new(MemoryPageIo::new(4096)), 0, 16, 64).unwrap()
    }

    #[test]
    fn test_buffered_writes_not_visible_until_applied() {
        let mut pager = pager();
        let id;
        {
            let mut store = TxPageStore::new(&mut pager);
            let mut page = store.allocate_page(0, PageType::SlottedData).unwrap();
            id = page.id();
            page.write_bytes(100, b"buffered");
            store.write_page(&page).unwrap();

            // Read through the buffer sees the write.
            let read = store.read_page(id).unwrap();
            assert_eq!(read.read_bytes(100, 8), b"buffered");

            let (pages, allocated, _) = store.into_parts();
            assert_eq!(pages.len(), 1);
            assert_eq!(allocated, vec![id]);
            pager.apply_committed(pages);
        }
        let read = pager.read_page(id).unwrap();
        assert_eq!(read.read_bytes(100, 8), b"buffered");
    }

    #[test]
    fn test_abort_reverts_allocation() {
        let mut pager = pager();
        let id;
        {
            let mut store = TxPageStore::new(&mut pager);
            let page = store.allocate_page(0, PageType::SlottedData).unwrap();
            id = page.id();
            assert!(store.pager().is_allocated(id));
            store.abort();
        }
        assert!(!pager.is_allocated(id));
    }
}
