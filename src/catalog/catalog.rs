//! Persistent collection catalog.
//!
//! All collection definitions serialize into one blob folded across a
//! chain of catalog pages (`[type u8][reserved u8][data_len u16][data...]
//! [next u32 at the end]`). The in-memory map is authoritative at runtime;
//! dirty state is re-serialized into page images by the committing
//! transaction, which also updates the header's catalog region.

use std::collections::BTreeMap;

use crate::catalog::collection::CollectionDef;
use crate::error::{GaldrError, Result};
use crate::storage::page::{Page, PageId, PageType, NO_PAGE};
use crate::storage::page_store::PageStore;
use crate::storage::pager::PageManager;

const PAGE_HEADER: usize = 4;
const NEXT_PTR: usize = 4;

pub struct CollectionsCatalog {
    collections: BTreeMap<String, CollectionDef>,
    page_ids: Vec<PageId>,
    dirty: bool,
}

impl CollectionsCatalog {
    pub fn new(first_page: PageId) -> Self {
        CollectionsCatalog {
            collections: BTreeMap::new(),
            page_ids: vec![first_page],
            dirty: false,
        }
    }

    pub fn load(pager: &PageManager) -> Result<Self> {
        let start = pager.catalog_start();
        let chain = pager.read_chain(start)?;
        let mut blob = Vec::new();
        let mut page_ids = Vec::with_capacity(chain.len());
        for page in &chain {
            if page.page_type() != Some(PageType::CollectionsCatalog) {
                return Err(GaldrError::Corruption(format!(
                    "page {} is not a catalog page",
                    page.id()
                )));
            }
            let len = page.read_u16(2) as usize;
            blob.extend_from_slice(page.read_bytes(PAGE_HEADER, len));
            page_ids.push(page.id());
        }

        let mut collections = BTreeMap::new();
        if !blob.is_empty() {
            let mut offset = 0usize;
            if blob.len() < 4 {
                return Err(GaldrError::Corruption("catalog blob truncated".into()));
            }
            let count = u32::from_le_bytes(blob[0..4].try_into().unwrap()) as usize;
            offset += 4;
            for _ in 0..count {
                let (def, consumed) = CollectionDef::deserialize(&blob[offset..])?;
                offset += consumed;
                collections.insert(def.name.clone(), def);
            }
        }

        Ok(CollectionsCatalog {
            collections,
            page_ids,
            dirty: false,
        })
    }

    pub fn get(&self, name: &str) -> Option<&CollectionDef> {
        self.collections.get(name)
    }

    /// Mutable access marks the catalog dirty; the next commit persists it.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut CollectionDef> {
        self.dirty = true;
        self.collections.get_mut(name)
    }

    pub fn insert(&mut self, def: CollectionDef) {
        self.dirty = true;
        self.collections.insert(def.name.clone(), def);
    }

    pub fn remove(&mut self, name: &str) -> Option<CollectionDef> {
        self.dirty = true;
        self.collections.remove(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.collections.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.collections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    fn blob(&self) -> Vec<u8> {
        let mut blob = Vec::new();
        blob.extend_from_slice(&(self.collections.len() as u32).to_le_bytes());
        for def in self.collections.values() {
            blob.extend_from_slice(&def.serialize());
        }
        blob
    }

    /// Serialize into page images through the transactional store,
    /// extending or shrinking the page chain as needed. Returns
    /// `(start, page_count)` for the header.
    pub fn write_to(&mut self, store: &mut impl PageStore) -> Result<(PageId, u32)> {
        let usable = store.usable_size();
        let capacity = usable - PAGE_HEADER - NEXT_PTR;
        let blob = self.blob();
        let pages_needed = blob.len().div_ceil(capacity).max(1);

        while self.page_ids.len() < pages_needed {
            let hint = *self.page_ids.last().unwrap();
            let page = store.allocate_page(hint, PageType::CollectionsCatalog)?;
            self.page_ids.push(page.id());
        }
        while self.page_ids.len() > pages_needed {
            let id = self.page_ids.pop().unwrap();
            store.free_page(id)?;
        }

        for (i, &id) in self.page_ids.iter().enumerate() {
            let mut page = Page::new(id, store.page_size(), usable);
            page.set_page_type(PageType::CollectionsCatalog);
            let start = i * capacity;
            let end = ((i + 1) * capacity).min(blob.len());
            let chunk: &[u8] = if start < blob.len() { &blob[start..end] } else { &[] };
            page.write_u16(2, chunk.len() as u16);
            page.write_bytes(PAGE_HEADER, chunk);
            let next = self.page_ids.get(i + 1).copied().unwrap_or(NO_PAGE);
            page.write_u32(usable - NEXT_PTR, next);
            store.write_page(&page)?;
        }

        Ok((self.page_ids[0], self.page_ids.len() as u32))
    }
}
