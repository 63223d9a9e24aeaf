/// Allocation bitmap: one bit per page, set = allocated.
///
/// The bitmap lives in a chain of dedicated pages (4-byte header, bit
/// payload, 4-byte next-page pointer at the end). At runtime the flat
/// in-memory mirror is authoritative; page images are regenerated from it
/// whenever a commit changes allocation state.

use crate::error::{GaldrError, Result};
use crate::storage::page::{Page, PageId, PageType, NO_PAGE};

const PAGE_HEADER: usize = 4;
const NEXT_PTR: usize = 4;

pub fn bits_per_page(usable: usize) -> u32 {
    ((usable - PAGE_HEADER - NEXT_PTR) * 8) as u32
}

pub struct AllocationBitmap {
    bits: Vec<u8>,
    page_ids: Vec<PageId>,
    bits_per_page: u32,
    dirty: bool,
}

impl AllocationBitmap {
    /// Fresh bitmap with a single backing page.
    pub fn new(usable: usize, first_page: PageId) -> Self {
        let bpp = bits_per_page(usable);
        AllocationBitmap {
            bits: vec![0u8; (bpp as usize) / 8],
            page_ids: vec![first_page],
            bits_per_page: bpp,
            dirty: true,
        }
    }

    /// Rebuild the mirror from a loaded page chain.
    pub fn from_chain(pages: &[Page], usable: usize) -> Result<Self> {
        let bpp = bits_per_page(usable);
        let mut bits = Vec::with_capacity(pages.len() * (bpp as usize) / 8);
        let mut page_ids = Vec::with_capacity(pages.len());
        for page in pages {
            if page.page_type() != Some(PageType::AllocationBitmap) {
                return Err(GaldrError::Corruption(format!(
                    "page {} is not an allocation bitmap page",
                    page.id()
                )));
            }
            bits.extend_from_slice(page.read_bytes(PAGE_HEADER, (bpp as usize) / 8));
            page_ids.push(page.id());
        }
        Ok(AllocationBitmap {
            bits,
            page_ids,
            bits_per_page: bpp,
            dirty: false,
        })
    }

    /// Highest page id representable plus one.
    pub fn capacity(&self) -> u32 {
        (self.bits.len() * 8) as u32
    }

    pub fn page_ids(&self) -> &[PageId] {
        &self.page_ids
    }

    pub fn page_count(&self) -> u32 {
        self.page_ids.len() as u32
    }

    pub fn is_allocated(&self, id: PageId) -> bool {
        let byte = (id / 8) as usize;
        byte < self.bits.len() && self.bits[byte] & (1 << (id % 8)) != 0
    }

    pub fn set_allocated(&mut self, id: PageId, allocated: bool) {
        let byte = (id / 8) as usize;
        if byte >= self.bits.len() {
            return;
        }
        if allocated {
            self.bits[byte] |= 1 << (id % 8);
        } else {
            self.bits[byte] &= !(1 << (id % 8));
        }
        self.dirty = true;
    }

    /// Find a free page below `limit`, scanning from `hint` and wrapping.
    pub fn find_free_from(&self, hint: PageId, limit: u32) -> Option<PageId> {
        let limit = limit.min(self.capacity());
        if limit == 0 {
            return None;
        }
        let start = if hint < limit { hint } else { 0 };
        for i in 0..limit {
            let id = (start + i) % limit;
            if id == 0 {
                continue; // header page
            }
            if !self.is_allocated(id) {
                return Some(id);
            }
        }
        None
    }

    pub fn allocated_count(&self) -> u32 {
        self.bits.iter().map(|b| b.count_ones()).sum()
    }

    /// Extend coverage with a newly allocated bitmap page.
    pub fn add_page(&mut self, page_id: PageId) {
        self.page_ids.push(page_id);
        self.bits.resize(self.bits.len() + (self.bits_per_page as usize) / 8, 0);
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

    /// Render the mirror as page images, chained in order.
    pub fn serialize(&self, page_size: usize, usable: usize) -> Vec<Page> {
        let bytes_per_page = (self.bits_per_page as usize) / 8;
        let mut pages = Vec::with_capacity(self.page_ids.len());
        for (i, &id) in self.page_ids.iter().enumerate() {
            let mut page = Page::new(id, page_size, usable);
            page.set_page_type(PageType::AllocationBitmap);
            let start = i * bytes_per_page;
            let end = (start + bytes_per_page).min(self.bits.len());
            page.write_bytes(PAGE_HEADER, &self.bits[start..end]);
            let next = self.page_ids.get(i + 1).copied().unwrap_or(NO_PAGE);
            page.write_u32(usable - NEXT_PTR, next);
            pages.push(page);
        }
        pages
    }
}
