use crate::error::Result;
use crate::storage::page::{Page, PageId, PageType};

/// Abstraction over page access.
///
/// Implemented by `PageManager` (direct I/O, used while creating, during
/// recovery and by compaction) and `TxPageStore` (commit-time dirty
/// buffer).
pub trait PageStore {
    fn read_page(&mut self, id: PageId) -> Result<Page>;
    fn write_page(&mut self, page: &Page) -> Result<()>;
    fn allocate_page(&mut self, hint: PageId, page_type: PageType) -> Result<Page>;
    fn free_page(&mut self, id: PageId) -> Result<()>;
    fn page_size(&self) -> usize;
    fn usable_size(&self) -> usize;

    /// Free-space-map lookup for slotted data pages. A returned page is a
    /// hint; callers verify actual space before use.
    fn find_data_page(&mut self, min_free: usize) -> Option<PageId>;

    /// Update the free-space hint for a data page.
    fn note_data_page_free(&mut self, id: PageId, free_bytes: usize);
}
