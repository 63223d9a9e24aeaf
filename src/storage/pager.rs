use std::collections::HashMap;
use std::num::NonZeroUsize;

use log::debug;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};

use crate::concurrency::PageLockManager;
use crate::error::{GaldrError, Result};
use crate::storage::bitmap::AllocationBitmap;
use crate::storage::fsm::{bucket_for, FreeSpaceMap};
use crate::storage::page::{
    DbHeader, Page, PageId, PageType, NO_PAGE,
};
use crate::storage::page_io::PageIo;
use crate::storage::page_store::PageStore;

/// Initial layout: header, one bitmap page, one FSM page, one catalog page.
const INITIAL_PAGES: u32 = 4;

/// Page allocation, file growth, caching and the committed-page overlay.
///
/// The bitmap and FSM mirrors are authoritative at runtime; their page
/// images are regenerated at every commit that changes them. Pages
/// committed through the WAL sit in the overlay until a checkpoint folds
/// them into the main file.
///
/// Reads take `&self`: concurrent readers go through the overlay and the
/// cache under brief internal locks and latch individual pages around
/// backend I/O. Allocation, growth and metadata changes take `&mut self`
/// and only happen inside writer-exclusive sections.
pub struct PageManager {
    io: Box<dyn PageIo>,
    page_size: usize,
    usable: usize,
    header: DbHeader,
    bitmap: AllocationBitmap,
    fsm: FreeSpaceMap,
    cache: Mutex<LruCache<PageId, Page>>,
    overlay: RwLock<HashMap<PageId, Page>>,
    locks: PageLockManager,
    expansion: u32,
    header_dirty: bool,
}

impl PageManager {
    pub fn create(
        io: Box<dyn PageIo>,
        flags: u32,
        expansion: u32,
        cache_pages: usize,
    ) -> Result<Self> {
        let page_size = io.page_size();
        let usable = io.usable_size();

        let header = DbHeader {
            page_size: page_size as u32,
            total_pages: INITIAL_PAGES,
            bitmap_start: 1,
            bitmap_pages: 1,
            fsm_start: 2,
            fsm_pages: 1,
            catalog_start: 3,
            catalog_pages: 1,
            flags,
        };

        let mut bitmap = AllocationBitmap::new(usable, 1);
        for id in 0..INITIAL_PAGES {
            bitmap.set_allocated(id, true);
        }
        let fsm = FreeSpaceMap::new(usable, 2);

        io.set_len_pages(INITIAL_PAGES)?;

        let mut pager = PageManager {
            io,
            page_size,
            usable,
            header,
            bitmap,
            fsm,
            cache: Mutex::new(LruCache::new(NonZeroUsize::new(cache_pages.max(1)).unwrap())),
            overlay: RwLock::new(HashMap::new()),
            locks: PageLockManager::new(),
            expansion,
            header_dirty: false,
        };

        let mut header_page = Page::new(0, page_size, usable);
        pager.header.write_to(&mut header_page);
        pager.write_direct(&header_page)?;

        for page in pager.bitmap.serialize(page_size, usable) {
            pager.write_direct(&page)?;
        }
        pager.bitmap.clear_dirty();
        for page in pager.fsm.serialize(page_size, usable) {
            pager.write_direct(&page)?;
        }
        pager.fsm.clear_dirty();

        let mut catalog_page = Page::new(3, page_size, usable);
        catalog_page.set_page_type(PageType::CollectionsCatalog);
        pager.write_direct(&catalog_page)?;
        pager.io.flush()?;

        Ok(pager)
    }

    pub fn open(io: Box<dyn PageIo>, expansion: u32, cache_pages: usize) -> Result<Self> {
        let page_size = io.page_size();
        let usable = io.usable_size();

        let mut buf = vec![0u8; page_size];
        io.read_page(0, &mut buf)?;
        let header_page = Page::from_bytes(0, buf, usable);
        let header = DbHeader::read_from(&header_page)?;
        if header.page_size as usize != page_size {
            return Err(GaldrError::Corruption(format!(
                "header page size {} does not match file page size {}",
                header.page_size, page_size
            )));
        }

        let mut pager = PageManager {
            io,
            page_size,
            usable,
            header,
            bitmap: AllocationBitmap::new(usable, header.bitmap_start),
            fsm: FreeSpaceMap::new(usable, header.fsm_start),
            cache: Mutex::new(LruCache::new(NonZeroUsize::new(cache_pages.max(1)).unwrap())),
            overlay: RwLock::new(HashMap::new()),
            locks: PageLockManager::new(),
            expansion,
            header_dirty: false,
        };

        let bitmap_chain = pager.read_chain(header.bitmap_start)?;
        pager.bitmap = AllocationBitmap::from_chain(&bitmap_chain, usable)?;
        let fsm_chain = pager.read_chain(header.fsm_start)?;
        pager.fsm = FreeSpaceMap::from_chain(&fsm_chain, usable)?;

        Ok(pager)
    }

    /// Read a chain of metadata pages linked by a trailing next pointer.
    pub fn read_chain(&self, start: PageId) -> Result<Vec<Page>> {
        let mut pages = Vec::new();
        let mut id = start;
        let mut guard = 0usize;
        while id != NO_PAGE {
            guard += 1;
            if guard > self.header.total_pages as usize + 1 {
                return Err(GaldrError::Corruption(format!(
                    "metadata page chain starting at {} has a cycle",
                    start
                )));
            }
            let page = self.read_page(id)?;
            let next = page.read_u32(self.usable - 4);
            pages.push(page);
            id = next;
        }
        Ok(pages)
    }

    pub fn header(&self) -> DbHeader {
        self.header
    }

    pub fn total_pages(&self) -> u32 {
        self.header.total_pages
    }

    pub fn flags(&self) -> u32 {
        self.header.flags
    }

    pub fn set_catalog_region(&mut self, start: PageId, pages: u32) {
        if self.header.catalog_start != start || self.header.catalog_pages != pages {
            self.header.catalog_start = start;
            self.header.catalog_pages = pages;
            self.header_dirty = true;
        }
    }

    pub fn catalog_start(&self) -> PageId {
        self.header.catalog_start
    }

    /// Shared read: overlay, then cache, then the backend under a brief
    /// shared page latch. Safe to call from any number of reader threads.
    pub fn read_page(&self, id: PageId) -> Result<Page> {
        if let Some(page) = self.overlay.read().get(&id) {
            return Ok(page.clone());
        }
        if let Some(page) = self.cache.lock().get(&id) {
            return Ok(page.clone());
        }
        let mut buf = vec![0u8; self.page_size];
        {
            let _latch = self.locks.shared(id);
            self.io.read_page(id, &mut buf)?;
        }
        let page = Page::from_bytes(id, buf, self.usable);
        self.cache.lock().put(id, page.clone());
        Ok(page)
    }

    /// Write a page straight to the backing store, bypassing the overlay.
    /// Used while creating the file, during WAL replay and by checkpoint.
    pub fn write_direct(&mut self, page: &Page) -> Result<()> {
        {
            let _latch = self.locks.exclusive(page.id());
            self.io.write_page(page.id(), page.data())?;
        }
        self.overlay.write().remove(&page.id());
        self.cache.lock().put(page.id(), page.clone());
        Ok(())
    }

    /// Publish committed page images into the overlay. They become visible
    /// to readers immediately and reach the main file at checkpoint.
    pub fn apply_committed(&mut self, pages: Vec<Page>) {
        let mut cache = self.cache.lock();
        let mut overlay = self.overlay.write();
        for page in pages {
            cache.put(page.id(), page.clone());
            overlay.insert(page.id(), page);
        }
    }

    /// Fold the overlay into the main file and fsync. Returns the number of
    /// pages written.
    pub fn checkpoint(&mut self) -> Result<usize> {
        let mut pages: Vec<Page> = self.overlay.read().values().cloned().collect();
        pages.sort_by_key(|p| p.id());
        let count = pages.len();
        for page in &pages {
            let _latch = self.locks.exclusive(page.id());
            self.io.write_page(page.id(), page.data())?;
        }
        self.io.flush()?;
        self.overlay.write().clear();
        if count > 0 {
            debug!("checkpoint wrote {} pages", count);
        }
        Ok(count)
    }

    pub fn overlay_len(&self) -> usize {
        self.overlay.read().len()
    }

    pub fn flush(&mut self) -> Result<()> {
        self.io.flush()
    }

    pub fn allocate(&mut self, hint: PageId) -> Result<PageId> {
        if let Some(id) = self.bitmap.find_free_from(hint, self.header.total_pages) {
            self.bitmap.set_allocated(id, true);
            return Ok(id);
        }
        self.grow()?;
        let id = self
            .bitmap
            .find_free_from(hint, self.header.total_pages)
            .ok_or_else(|| GaldrError::Corruption("no free page after growth".into()))?;
        self.bitmap.set_allocated(id, true);
        Ok(id)
    }

    pub fn free(&mut self, id: PageId) {
        self.bitmap.set_allocated(id, false);
        self.fsm.set_bucket(id, 0);
    }

    /// Revert allocations made by a failed commit.
    pub fn rollback_alloc(&mut self, ids: &[PageId]) {
        for &id in ids {
            self.bitmap.set_allocated(id, false);
        }
    }

    /// Re-apply frees reverted by a failed commit.
    pub fn rollback_free(&mut self, ids: &[PageId]) {
        for &id in ids {
            self.bitmap.set_allocated(id, true);
        }
    }

    fn grow(&mut self) -> Result<()> {
        let old_total = self.header.total_pages;
        let new_total = old_total
            .checked_add(self.expansion)
            .ok_or_else(|| GaldrError::InvalidArgument("database file is full".into()))?;

        // New bitmap/FSM pages come from the front of the fresh region.
        let mut next_meta = old_total;
        while self.bitmap.capacity() < new_total {
            self.bitmap.add_page(next_meta);
            self.bitmap.set_allocated(next_meta, true);
            next_meta += 1;
        }
        while self.fsm.capacity() < new_total {
            self.fsm.add_page(next_meta);
            self.bitmap.set_allocated(next_meta, true);
            next_meta += 1;
        }
        if next_meta >= new_total {
            return Err(GaldrError::InvalidArgument(
                "expansion page count too small for metadata growth".into(),
            ));
        }

        self.io.set_len_pages(new_total)?;
        self.header.total_pages = new_total;
        self.header.bitmap_pages = self.bitmap.page_count();
        self.header.fsm_pages = self.fsm.page_count();
        self.header_dirty = true;
        debug!("grew file from {} to {} pages", old_total, new_total);
        Ok(())
    }

    /// Page images for all dirty metadata (header, bitmap, FSM). The
    /// caller includes them in the committing transaction's frame set.
    pub fn take_meta_images(&mut self) -> Vec<Page> {
        let mut images = Vec::new();
        if self.header_dirty {
            let mut header_page = Page::new(0, self.page_size, self.usable);
            self.header.write_to(&mut header_page);
            images.push(header_page);
            self.header_dirty = false;
        }
        if self.bitmap.is_dirty() {
            images.extend(self.bitmap.serialize(self.page_size, self.usable));
            self.bitmap.clear_dirty();
        }
        if self.fsm.is_dirty() {
            images.extend(self.fsm.serialize(self.page_size, self.usable));
            self.fsm.clear_dirty();
        }
        images
    }

    /// Mark all metadata dirty again after a failed commit so the next
    /// commit re-emits consistent images.
    pub fn mark_meta_dirty(&mut self) {
        self.header_dirty = true;
        self.bitmap.force_dirty();
        self.fsm.force_dirty();
    }

    pub fn fsm_find(&self, min_free: usize, hint: PageId) -> Option<PageId> {
        let min_bucket = bucket_for(min_free, self.usable);
        self.fsm
            .find_with_space(min_bucket.saturating_add(1).min(255), hint, self.header.total_pages)
    }

    pub fn fsm_update(&mut self, id: PageId, free_bytes: usize) {
        let bucket = bucket_for(free_bytes, self.usable);
        self.fsm.set_bucket(id, bucket);
    }

    pub fn allocated_pages(&self) -> u32 {
        self.bitmap.allocated_count()
    }

    pub fn is_allocated(&self, id: PageId) -> bool {
        self.bitmap.is_allocated(id)
    }
}

impl PageStore for PageManager {
    fn read_page(&mut self, id: PageId) -> Result<Page> {
        PageManager::read_page(self, id)
    }

    fn write_page(&mut self, page: &Page) -> Result<()> {
        self.write_direct(page)
    }

    fn allocate_page(&mut self, hint: PageId, page_type: PageType) -> Result<Page> {
        let id = self.allocate(hint)?;
        let mut page = Page::new(id, self.page_size, self.usable);
        page.set_page_type(page_type);
        Ok(page)
    }

    fn free_page(&mut self, id: PageId) -> Result<()> {
        self.free(id);
        Ok(())
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    fn usable_size(&self) -> usize {
        self.usable
    }

    fn find_data_page(&mut self, min_free: usize) -> Option<PageId> {
        self.fsm_find(min_free, 0)
    }

    fn note_data_page_free(&mut self, id: PageId, free_bytes: usize) {
        self.fsm_update(id, free_bytes);
    }
}

/// Read-only `PageStore` view over a shared pager.
///
/// Snapshot reads and query scans run on `&PageManager` while other
/// readers proceed concurrently; any attempt to mutate through this view
/// is a logic error and surfaces as corruption.
pub struct ReadPager<'a> {
    pager: &'a PageManager,
}

impl<'a> ReadPager<'a> {
    pub fn new(pager: &'a PageManager) -> Self {
        ReadPager { pager }
    }
}

impl PageStore for ReadPager<'_> {
    fn read_page(&mut self, id: PageId) -> Result<Page> {
        self.pager.read_page(id)
    }

    fn write_page(&mut self, page: &Page) -> Result<()> {
        Err(GaldrError::Corruption(format!(
            "write of page {} through a read-only page store",
            page.id()
        )))
    }

    fn allocate_page(&mut self, _hint: PageId, _page_type: PageType) -> Result<Page> {
        Err(GaldrError::Corruption(
            "allocation through a read-only page store".into(),
        ))
    }

    fn free_page(&mut self, id: PageId) -> Result<()> {
        Err(GaldrError::Corruption(format!(
            "free of page {} through a read-only page store",
            id
        )))
    }

    fn page_size(&self) -> usize {
        self.pager.page_size
    }

    fn usable_size(&self) -> usize {
        self.pager.usable
    }

    fn find_data_page(&mut self, _min_free: usize) -> Option<PageId> {
        None
    }

    fn note_data_page_free(&mut self, _id: PageId, _free_bytes: usize) {}
}
