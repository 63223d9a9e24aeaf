//! Slotted data pages and large-document overflow chains.
//!
//! Data page layout:
//!   [page_type u8][flags u8][slot_count u16][free_start u16][free_end u16]
//!   [next_overflow_page u32]
//!   [slot_dir: {offset u16, len u16, flags u16} * slot_count]
//!   ... free space ...
//!   payloads grow down from free_end
//!
//! A slot with the deleted flag is a tombstone: its directory entry stays
//! so sibling slot indices remain stable, and `insert` reuses it.
//!
//! Documents larger than one page's usable area store a head slot
//! `total_len u32 | overflow_head u32 | first chunk...` and chain the rest
//! across overflow pages `page_type u8 | reserved u8 | chunk_len u16 |
//! next_page u32 | chunk...`.

use crate::error::{GaldrError, Result};
use crate::storage::page::{DocLocation, Page, PageId, PageType, NO_PAGE};
use crate::storage::page_store::PageStore;

pub const DATA_HEADER: usize = 12;
pub const SLOT_SIZE: usize = 6;

pub const SLOT_DELETED: u16 = 0x1;
pub const SLOT_OVERFLOW_HEAD: u16 = 0x2;

const OVERFLOW_HEADER: usize = 8;
const OVERFLOW_META: usize = 8;
const MAX_CHAIN: usize = 1_000_000;

const OFF_SLOT_COUNT: usize = 2;
const OFF_FREE_START: usize = 4;
const OFF_FREE_END: usize = 6;
const OFF_NEXT_OVERFLOW: usize = 8;

pub fn init_data_page(page: &mut Page) {
    page.clear();
    page.set_page_type(PageType::SlottedData);
    page.write_u16(OFF_SLOT_COUNT, 0);
    page.write_u16(OFF_FREE_START, DATA_HEADER as u16);
    page.write_u16(OFF_FREE_END, page.limit() as u16);
    page.write_u32(OFF_NEXT_OVERFLOW, NO_PAGE);
}

pub fn slot_count(page: &Page) -> u16 {
    page.read_u16(OFF_SLOT_COUNT)
}

fn dir_offset(slot: u16) -> usize {
    DATA_HEADER + slot as usize * SLOT_SIZE
}

pub fn slot_entry(page: &Page, slot: u16) -> Option<(u16, u16, u16)> {
    if slot >= slot_count(page) {
        return None;
    }
    let off = dir_offset(slot);
    Some((
        page.read_u16(off),
        page.read_u16(off + 2),
        page.read_u16(off + 4),
    ))
}

fn set_slot_entry(page: &mut Page, slot: u16, offset: u16, len: u16, flags: u16) {
    let off = dir_offset(slot);
    page.write_u16(off, offset);
    page.write_u16(off + 2, len);
    page.write_u16(off + 4, flags);
}

pub fn slot_flags(page: &Page, slot: u16) -> Option<u16> {
    slot_entry(page, slot).map(|(_, _, f)| f)
}

pub fn live_slots(page: &Page) -> u16 {
    (0..slot_count(page))
        .filter(|&s| slot_flags(page, s).map_or(false, |f| f & SLOT_DELETED == 0))
        .count() as u16
}

fn live_payload_bytes(page: &Page) -> usize {
    (0..slot_count(page))
        .filter_map(|s| slot_entry(page, s))
        .filter(|(_, _, f)| f & SLOT_DELETED == 0)
        .map(|(_, len, _)| len as usize)
        .sum()
}

/// Contiguous free bytes between the slot directory and the payload area.
pub fn contiguous_free(page: &Page) -> usize {
    let start = page.read_u16(OFF_FREE_START) as usize;
    let end = page.read_u16(OFF_FREE_END) as usize;
    end.saturating_sub(start)
}

/// Total reclaimable free bytes, counting tombstoned payloads.
pub fn total_free(page: &Page) -> usize {
    let dir_end = DATA_HEADER + slot_count(page) as usize * SLOT_SIZE;
    page.limit()
        .saturating_sub(dir_end)
        .saturating_sub(live_payload_bytes(page))
}

/// Coalesce free bytes by rewriting live payloads contiguously.
/// Slot indices and directory entries are preserved; only offsets move.
pub fn compact(page: &mut Page) {
    let count = slot_count(page);
    let mut live: Vec<(u16, Vec<u8>, u16)> = Vec::new();
    for slot in 0..count {
        if let Some((offset, len, flags)) = slot_entry(page, slot) {
            if flags & SLOT_DELETED == 0 && len > 0 {
                let bytes = page.read_bytes(offset as usize, len as usize).to_vec();
                live.push((slot, bytes, flags));
            }
        }
    }

    let mut write_end = page.limit();
    for (slot, bytes, flags) in &live {
        write_end -= bytes.len();
        page.write_bytes(write_end, bytes);
        set_slot_entry(page, *slot, write_end as u16, bytes.len() as u16, *flags);
    }
    for slot in 0..count {
        if let Some((_, _, flags)) = slot_entry(page, slot) {
            if flags & SLOT_DELETED != 0 {
                set_slot_entry(page, slot, 0, 0, flags);
            }
        }
    }
    page.write_u16(OFF_FREE_END, write_end as u16);
}

/// Insert a payload, reusing a tombstone slot when one exists.
/// Returns the slot index, or None when the page cannot fit the payload
/// even after compaction.
pub fn insert_payload(page: &mut Page, payload: &[u8], flags: u16) -> Option<u16> {
    let count = slot_count(page);
    let tombstone = (0..count).find(|&s| {
        slot_flags(page, s).map_or(false, |f| f & SLOT_DELETED != 0)
    });

    let dir_cost = if tombstone.is_some() { 0 } else { SLOT_SIZE };
    if total_free(page) < payload.len() + dir_cost {
        return None;
    }
    if contiguous_free(page) < payload.len() + dir_cost {
        compact(page);
    }
    if contiguous_free(page) < payload.len() + dir_cost {
        return None;
    }

    let slot = match tombstone {
        Some(s) => s,
        None => {
            page.write_u16(OFF_SLOT_COUNT, count + 1);
            page.write_u16(OFF_FREE_START, (dir_offset(count + 1)) as u16);
            count
        }
    };

    let free_end = page.read_u16(OFF_FREE_END) as usize;
    let offset = free_end - payload.len();
    page.write_bytes(offset, payload);
    page.write_u16(OFF_FREE_END, offset as u16);
    set_slot_entry(page, slot, offset as u16, payload.len() as u16, flags);
    Some(slot)
}

pub fn payload(page: &Page, slot: u16) -> Result<&[u8]> {
    let (offset, len, flags) = slot_entry(page, slot).ok_or_else(|| {
        GaldrError::Corruption(format!("slot {} out of range on page {}", slot, page.id()))
    })?;
    if flags & SLOT_DELETED != 0 {
        return Err(GaldrError::Corruption(format!(
            "slot {} on page {} is a tombstone",
            slot,
            page.id()
        )));
    }
    Ok(page.read_bytes(offset as usize, len as usize))
}

/// Replace a slot's payload in place. Returns false when the new payload
/// does not fit this page (caller relocates the document).
pub fn replace_payload(page: &mut Page, slot: u16, new_payload: &[u8], flags: u16) -> bool {
    let Some((offset, len, _)) = slot_entry(page, slot) else {
        return false;
    };
    if new_payload.len() <= len as usize {
        // Shrink in place; the tail bytes become reclaimable on compaction.
        let start = offset as usize + (len as usize - new_payload.len());
        page.write_bytes(start, new_payload);
        set_slot_entry(page, slot, start as u16, new_payload.len() as u16, flags);
        return true;
    }

    let growth = new_payload.len() - len as usize;
    if total_free(page) < growth {
        return false;
    }
    // Tombstone the old bytes, compact, then append.
    set_slot_entry(page, slot, 0, 0, SLOT_DELETED);
    compact(page);
    let free_end = page.read_u16(OFF_FREE_END) as usize;
    let new_offset = free_end - new_payload.len();
    page.write_bytes(new_offset, new_payload);
    page.write_u16(OFF_FREE_END, new_offset as u16);
    set_slot_entry(page, slot, new_offset as u16, new_payload.len() as u16, flags);
    true
}

pub fn delete_payload(page: &mut Page, slot: u16) -> Result<()> {
    let (_, _, flags) = slot_entry(page, slot).ok_or_else(|| {
        GaldrError::Corruption(format!("slot {} out of range on page {}", slot, page.id()))
    })?;
    set_slot_entry(page, slot, 0, 0, flags | SLOT_DELETED);
    Ok(())
}

// --- Document-level operations over a PageStore ---

fn max_inline(usable: usize) -> usize {
    usable - DATA_HEADER - SLOT_SIZE
}

/// Store a document payload, chaining overflow pages when it exceeds one
/// page's usable area. `hint` steers allocation for locality.
pub fn store_document(
    store: &mut impl PageStore,
    hint: PageId,
    payload: &[u8],
) -> Result<DocLocation> {
    let usable = store.usable_size();
    if payload.len() <= max_inline(usable) {
        return store_slot(store, hint, payload, 0);
    }

    // Large document: chunk the tail across overflow pages, newest first so
    // each page's next pointer is known when written.
    let chunk_capacity = usable - OVERFLOW_HEADER;
    let head_capacity = max_inline(usable) - OVERFLOW_META;
    let head_chunk = &payload[..head_capacity];
    let mut rest = &payload[head_capacity..];

    let mut chunks: Vec<&[u8]> = Vec::new();
    while !rest.is_empty() {
        let take = rest.len().min(chunk_capacity);
        chunks.push(&rest[..take]);
        rest = &rest[take..];
    }

    // Bulk-allocate the chain, preferring contiguous page ids.
    let mut chain: Vec<Page> = Vec::with_capacity(chunks.len());
    let mut alloc_hint = hint;
    for _ in 0..chunks.len() {
        let page = store.allocate_page(alloc_hint, PageType::LargeDocumentOverflow)?;
        alloc_hint = page.id() + 1;
        chain.push(page);
    }

    for i in (0..chunks.len()).rev() {
        let next = chain.get(i + 1).map(|p| p.id()).unwrap_or(NO_PAGE);
        let page = &mut chain[i];
        page.clear();
        page.set_page_type(PageType::LargeDocumentOverflow);
        page.write_u16(2, chunks[i].len() as u16);
        page.write_u32(4, next);
        page.write_bytes(OVERFLOW_HEADER, chunks[i]);
    }
    let overflow_head = chain.first().map(|p| p.id()).unwrap_or(NO_PAGE);
    for page in &chain {
        store.write_page(page)?;
    }

    let mut head = Vec::with_capacity(OVERFLOW_META + head_chunk.len());
    head.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    head.extend_from_slice(&overflow_head.to_le_bytes());
    head.extend_from_slice(head_chunk);
    store_slot(store, hint, &head, SLOT_OVERFLOW_HEAD)
}

fn store_slot(
    store: &mut impl PageStore,
    hint: PageId,
    payload: &[u8],
    flags: u16,
) -> Result<DocLocation> {
    let needed = payload.len() + SLOT_SIZE;
    if let Some(candidate) = store.find_data_page(needed) {
        let mut page = store.read_page(candidate)?;
        if page.page_type() == Some(PageType::SlottedData) && total_free(&page) >= needed {
            if let Some(slot) = insert_payload(&mut page, payload, flags) {
                let free = total_free(&page);
                store.note_data_page_free(candidate, free);
                store.write_page(&page)?;
                return Ok(DocLocation::new(candidate, slot));
            }
        }
    }

    let mut page = store.allocate_page(hint, PageType::SlottedData)?;
    init_data_page(&mut page);
    let slot = insert_payload(&mut page, payload, flags).ok_or_else(|| {
        GaldrError::InvalidArgument("document does not fit a fresh data page".into())
    })?;
    let free = total_free(&page);
    let id = page.id();
    store.note_data_page_free(id, free);
    store.write_page(&page)?;
    Ok(DocLocation::new(id, slot))
}

/// Read a document payload, following the overflow chain when present.
pub fn read_document(store: &mut impl PageStore, loc: DocLocation) -> Result<Vec<u8>> {
    let page = store.read_page(loc.page)?;
    if page.page_type() != Some(PageType::SlottedData) {
        return Err(GaldrError::Corruption(format!(
            "page {} is not a data page",
            loc.page
        )));
    }
    let (_, _, flags) = slot_entry(&page, loc.slot).ok_or_else(|| {
        GaldrError::Corruption(format!("slot {} missing on page {}", loc.slot, loc.page))
    })?;
    let bytes = payload(&page, loc.slot)?;

    if flags & SLOT_OVERFLOW_HEAD == 0 {
        return Ok(bytes.to_vec());
    }

    if bytes.len() < OVERFLOW_META {
        return Err(GaldrError::Corruption("overflow head slot truncated".into()));
    }
    let total_len = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
    let mut next = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
    let mut out = Vec::with_capacity(total_len);
    out.extend_from_slice(&bytes[OVERFLOW_META..]);
    drop(page);

    let mut guard = 0usize;
    while next != NO_PAGE {
        guard += 1;
        if guard > MAX_CHAIN {
            return Err(GaldrError::Corruption("overflow chain loop detected".into()));
        }
        let page = store.read_page(next)?;
        if page.page_type() != Some(PageType::LargeDocumentOverflow) {
            return Err(GaldrError::Corruption(format!(
                "page {} is not an overflow page",
                next
            )));
        }
        let chunk_len = page.read_u16(2) as usize;
        if OVERFLOW_HEADER + chunk_len > page.limit() || out.len() + chunk_len > total_len {
            return Err(GaldrError::Corruption("overflow chunk exceeds bounds".into()));
        }
        out.extend_from_slice(page.read_bytes(OVERFLOW_HEADER, chunk_len));
        next = page.read_u32(4);
    }

    if out.len() != total_len {
        return Err(GaldrError::Corruption(format!(
            "overflow chain length {} does not match recorded {}",
            out.len(),
            total_len
        )));
    }
    Ok(out)
}

/// Tombstone a document slot, free its overflow chain, and free the page
/// itself once no live slot remains.
pub fn delete_document(store: &mut impl PageStore, loc: DocLocation) -> Result<()> {
    let mut page = store.read_page(loc.page)?;
    let (_, _, flags) = slot_entry(&page, loc.slot).ok_or_else(|| {
        GaldrError::Corruption(format!("slot {} missing on page {}", loc.slot, loc.page))
    })?;

    if flags & SLOT_OVERFLOW_HEAD != 0 {
        let bytes = payload(&page, loc.slot)?;
        let mut next = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        let mut guard = 0usize;
        while next != NO_PAGE {
            guard += 1;
            if guard > MAX_CHAIN {
                return Err(GaldrError::Corruption("overflow chain loop detected".into()));
            }
            let chain_page = store.read_page(next)?;
            let following = chain_page.read_u32(4);
            store.free_page(next)?;
            next = following;
        }
    }

    delete_payload(&mut page, loc.slot)?;
    if live_slots(&page) == 0 {
        store.free_page(loc.page)?;
        store.note_data_page_free(loc.page, 0);
    } else {
        let free = total_free(&page);
        store.note_data_page_free(loc.page, free);
        store.write_page(&page)?;
    }
    Ok(())
}

pub enum ReplaceOutcome {
    InPlace,
    Relocated(DocLocation),
}

/// Replace a document's payload. Stays in place when the new payload fits
/// the same slot page; otherwise the document is relocated and the caller
/// rewrites index entries.
pub fn replace_document(
    store: &mut impl PageStore,
    loc: DocLocation,
    new_payload: &[u8],
) -> Result<ReplaceOutcome> {
    let usable = store.usable_size();
    let mut page = store.read_page(loc.page)?;
    let (_, _, flags) = slot_entry(&page, loc.slot).ok_or_else(|| {
        GaldrError::Corruption(format!("slot {} missing on page {}", loc.slot, loc.page))
    })?;

    let was_overflow = flags & SLOT_OVERFLOW_HEAD != 0;
    let fits_inline = new_payload.len() <= max_inline(usable);

    if !was_overflow && fits_inline && replace_payload(&mut page, loc.slot, new_payload, 0) {
        let free = total_free(&page);
        store.note_data_page_free(loc.page, free);
        store.write_page(&page)?;
        return Ok(ReplaceOutcome::InPlace);
    }
    drop(page);

    delete_document(store, loc)?;
    let new_loc = store_document(store, loc.page, new_payload)?;
    Ok(ReplaceOutcome::Relocated(new_loc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page_io::MemoryPageIo;
    use crate::storage::pager::PageManager;

    fn test_page() -> Page {
        let mut page = Page::new(7, 4096, 4096);
        init_data_page(&mut page);
        page
    }

    fn test_store() -> PageManager {
        PageManager::create(Box::new(MemoryPageIo::new(4096)), 0, 8, 64).unwrap()
    }

    #[test]
    fn test_insert_and_read() {
        let mut page = test_page();
        let a = insert_payload(&mut page, b"first", 0).unwrap();
        let b = insert_payload(&mut page, b"second", 0).unwrap();
        assert_eq!((a, b), (0, 1));
        assert_eq!(payload(&page, 0).unwrap(), b"first");
        assert_eq!(payload(&page, 1).unwrap(), b"second");
    }

    #[test]
    fn test_delete_keeps_slot_indices() {
        let mut page = test_page();
        insert_payload(&mut page, b"aaa", 0).unwrap();
        insert_payload(&mut page, b"bbb", 0).unwrap();
        insert_payload(&mut page, b"ccc", 0).unwrap();

        delete_payload(&mut page, 1).unwrap();
        assert_eq!(live_slots(&page), 2);
        assert_eq!(payload(&page, 2).unwrap(), b"ccc");
        assert!(payload(&page, 1).is_err());
    }

    #[test]
    fn test_tombstone_reuse() {
        let mut page = test_page();
        insert_payload(&mut page, b"aaa", 0).unwrap();
        insert_payload(&mut page, b"bbb", 0).unwrap();
        delete_payload(&mut page, 0).unwrap();

        let slot = insert_payload(&mut page, b"replacement", 0).unwrap();
        assert_eq!(slot, 0);
        assert_eq!(payload(&page, 0).unwrap(), b"replacement");
        assert_eq!(slot_count(&page), 2);
    }

    #[test]
    fn test_compaction_reclaims_space() {
        let mut page = test_page();
        let filler = vec![0xAAu8; 900];
        let mut slots = Vec::new();
        while let Some(s) = insert_payload(&mut page, &filler, 0) {
            slots.push(s);
        }
        assert!(slots.len() >= 4);

        // Delete every other slot, then a payload larger than any single
        // hole but smaller than the combined free space must fit.
        for &s in slots.iter().step_by(2) {
            delete_payload(&mut page, s).unwrap();
        }
        let big = vec![0xBBu8; 1200];
        let slot = insert_payload(&mut page, &big, 0).expect("fits after compaction");
        assert_eq!(payload(&page, slot).unwrap(), big.as_slice());
    }

    #[test]
    fn test_replace_in_place_and_grow() {
        let mut page = test_page();
        let slot = insert_payload(&mut page, b"short", 0).unwrap();
        assert!(replace_payload(&mut page, slot, b"tiny", 0));
        assert_eq!(payload(&page, slot).unwrap(), b"tiny");

        assert!(replace_payload(&mut page, slot, b"a considerably longer payload", 0));
        assert_eq!(payload(&page, slot).unwrap(), b"a considerably longer payload");
    }

    #[test]
    fn test_replace_rejects_oversize() {
        let mut page = test_page();
        let slot = insert_payload(&mut page, b"x", 0).unwrap();
        let huge = vec![0u8; 5000];
        assert!(!replace_payload(&mut page, slot, &huge, 0));
    }

    #[test]
    fn test_store_and_read_document() {
        let mut store = test_store();
        let loc = store_document(&mut store, 0, b"hello document").unwrap();
        assert_eq!(read_document(&mut store, loc).unwrap(), b"hello document");
    }

    #[test]
    fn test_large_document_chain() {
        let mut store = test_store();
        let payload: Vec<u8> = (0..20_000).map(|i| (i % 251) as u8).collect();
        let loc = store_document(&mut store, 0, &payload).unwrap();
        assert_eq!(read_document(&mut store, loc).unwrap(), payload);

        // Delete frees the chain pages for reuse.
        let before = store.allocated_pages();
        delete_document(&mut store, loc).unwrap();
        assert!(store.allocated_pages() < before);
    }

    #[test]
    fn test_replace_document_relocates() {
        let mut store = test_store();
        let loc = store_document(&mut store, 0, b"small").unwrap();
        let big: Vec<u8> = vec![0xCD; 12_000];
        match replace_document(&mut store, loc, &big).unwrap() {
            ReplaceOutcome::Relocated(new_loc) => {
                assert_eq!(read_document(&mut store, new_loc).unwrap(), big);
            }
            ReplaceOutcome::InPlace => panic!("expected relocation"),
        }
    }
}
