//! B+-tree node layout on pages.
//!
//! Header (12 bytes):
//!   [page_type u8][node_kind u8][key_count u16][max_entries u16]
//!   [link u32][free_end u16]
//!
//! `link` is the right sibling for leaves (NO_PAGE terminates the chain)
//! and the rightmost child for internal nodes. `max_entries` is fixed at
//! node creation from the page size and an average-key-size hint, so
//! different subtrees may carry different fanouts.
//!
//! An entry directory of {offset u16, len u16} pairs grows up after the
//! header; entry payloads grow down from `free_end`. Leaf entries are
//! `key || location(6)`; internal entries are `child u32 || key`. Keys
//! within a node are kept in ascending order.

use crate::storage::page::{DocLocation, Page, PageId, PageType, LOCATION_SIZE};

pub const NODE_LEAF: u8 = 1;
pub const NODE_INTERNAL: u8 = 2;

pub const NODE_HEADER: usize = 12;
const DIR_ENTRY: usize = 4;

const OFF_KIND: usize = 1;
const OFF_KEY_COUNT: usize = 2;
const OFF_MAX_ENTRIES: usize = 4;
const OFF_LINK: usize = 6;
const OFF_FREE_END: usize = 10;

/// Entry capacity for a fresh node, from the usable page size and an
/// average-key-size heuristic.
pub fn capacity_for(usable: usize, avg_key_size: usize) -> u16 {
    let per_entry = avg_key_size + LOCATION_SIZE + DIR_ENTRY + 2;
    (((usable - NODE_HEADER) / per_entry).clamp(4, 4096)) as u16
}

pub fn init_node(page: &mut Page, page_type: PageType, kind: u8, max_entries: u16) {
    page.clear();
    page.set_page_type(page_type);
    page.write_u8(OFF_KIND, kind);
    page.write_u16(OFF_KEY_COUNT, 0);
    page.write_u16(OFF_MAX_ENTRIES, max_entries);
    page.write_u32(OFF_LINK, crate::storage::page::NO_PAGE);
    page.write_u16(OFF_FREE_END, page.limit() as u16);
}

pub fn node_kind(page: &Page) -> u8 {
    page.read_u8(OFF_KIND)
}

pub fn key_count(page: &Page) -> u16 {
    page.read_u16(OFF_KEY_COUNT)
}

pub fn max_entries(page: &Page) -> u16 {
    page.read_u16(OFF_MAX_ENTRIES)
}

pub fn link(page: &Page) -> PageId {
    page.read_u32(OFF_LINK)
}

pub fn set_link(page: &mut Page, link: PageId) {
    page.write_u32(OFF_LINK, link);
}

fn dir_offset(idx: u16) -> usize {
    NODE_HEADER + idx as usize * DIR_ENTRY
}

pub fn entry(page: &Page, idx: u16) -> &[u8] {
    let off = page.read_u16(dir_offset(idx)) as usize;
    let len = page.read_u16(dir_offset(idx) + 2) as usize;
    page.read_bytes(off, len)
}

pub fn contiguous_free(page: &Page) -> usize {
    let dir_end = dir_offset(key_count(page));
    (page.read_u16(OFF_FREE_END) as usize).saturating_sub(dir_end)
}

pub fn total_free(page: &Page) -> usize {
    let count = key_count(page);
    let used: usize = (0..count)
        .map(|i| page.read_u16(dir_offset(i) + 2) as usize)
        .sum();
    page.limit()
        .saturating_sub(dir_offset(count))
        .saturating_sub(used)
}

fn compact(page: &mut Page) {
    let count = key_count(page);
    let entries: Vec<Vec<u8>> = (0..count).map(|i| entry(page, i).to_vec()).collect();
    let mut write_end = page.limit();
    for (i, bytes) in entries.iter().enumerate() {
        write_end -= bytes.len();
        page.write_bytes(write_end, bytes);
        page.write_u16(dir_offset(i as u16), write_end as u16);
        page.write_u16(dir_offset(i as u16) + 2, bytes.len() as u16);
    }
    page.write_u16(OFF_FREE_END, write_end as u16);
}

/// Insert an entry at directory position `idx`, shifting later entries.
/// Returns false when the node cannot hold the entry even compacted.
pub fn insert_entry(page: &mut Page, idx: u16, bytes: &[u8]) -> bool {
    let count = key_count(page);
    debug_assert!(idx <= count);
    let needed = bytes.len() + DIR_ENTRY;
    if total_free(page) < needed {
        return false;
    }
    if contiguous_free(page) < needed {
        compact(page);
    }
    if contiguous_free(page) < needed {
        return false;
    }

    // Shift directory entries right.
    let start = dir_offset(idx);
    let end = dir_offset(count);
    if start < end {
        page.data_mut().copy_within(start..end, start + DIR_ENTRY);
    }

    let free_end = page.read_u16(OFF_FREE_END) as usize;
    let offset = free_end - bytes.len();
    page.write_bytes(offset, bytes);
    page.write_u16(OFF_FREE_END, offset as u16);
    page.write_u16(start, offset as u16);
    page.write_u16(start + 2, bytes.len() as u16);
    page.write_u16(OFF_KEY_COUNT, count + 1);
    true
}

/// Remove the entry at `idx`; its payload bytes are reclaimed lazily.
pub fn remove_entry(page: &mut Page, idx: u16) {
    let count = key_count(page);
    debug_assert!(idx < count);
    let start = dir_offset(idx);
    let end = dir_offset(count);
    if start + DIR_ENTRY < end {
        page.data_mut().copy_within(start + DIR_ENTRY..end, start);
    }
    page.write_u16(OFF_KEY_COUNT, count - 1);
}

/// Replace the entry at `idx`. Returns false on overflow, leaving the
/// original entry in place.
pub fn replace_entry(page: &mut Page, idx: u16, bytes: &[u8]) -> bool {
    let old = entry(page, idx).to_vec();
    remove_entry(page, idx);
    if insert_entry(page, idx, bytes) {
        return true;
    }
    let restored = insert_entry(page, idx, &old);
    debug_assert!(restored);
    false
}

// --- Leaf entries: key || location ---

pub fn encode_leaf_entry(key: &[u8], loc: DocLocation) -> Vec<u8> {
    let mut buf = Vec::with_capacity(key.len() + LOCATION_SIZE);
    buf.extend_from_slice(key);
    buf.extend_from_slice(&loc.to_bytes());
    buf
}

pub fn decode_leaf_entry(entry: &[u8]) -> (&[u8], DocLocation) {
    let split = entry.len() - LOCATION_SIZE;
    let loc = DocLocation::from_bytes(&entry[split..]).expect("location suffix");
    (&entry[..split], loc)
}

pub fn leaf_key(page: &Page, idx: u16) -> &[u8] {
    let e = entry(page, idx);
    &e[..e.len() - LOCATION_SIZE]
}

pub fn leaf_location(page: &Page, idx: u16) -> DocLocation {
    let e = entry(page, idx);
    decode_leaf_entry(e).1
}

// --- Internal entries: child || key ---

pub fn encode_internal_entry(child: PageId, key: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + key.len());
    buf.extend_from_slice(&child.to_le_bytes());
    buf.extend_from_slice(key);
    buf
}

pub fn decode_internal_entry(entry: &[u8]) -> (PageId, &[u8]) {
    let child = u32::from_le_bytes(entry[0..4].try_into().unwrap());
    (child, &entry[4..])
}

pub fn internal_key(page: &Page, idx: u16) -> &[u8] {
    &entry(page, idx)[4..]
}

pub fn internal_child(page: &Page, idx: u16) -> PageId {
    let e = entry(page, idx);
    u32::from_le_bytes(e[0..4].try_into().unwrap())
}

/// Child page to descend into for `key`: the first entry whose key is
/// greater than `key`, else the rightmost child from the header link.
pub fn find_child_index(page: &Page, key: &[u8]) -> (usize, PageId) {
    let n = key_count(page);
    for i in 0..n {
        if key < internal_key(page, i) {
            return (i as usize, internal_child(page, i));
        }
    }
    (n as usize, link(page))
}

/// Binary search for `key` among leaf entries. Ok(idx) = exact match,
/// Err(idx) = insertion point.
pub fn leaf_search(page: &Page, key: &[u8]) -> std::result::Result<u16, u16> {
    let mut lo = 0u16;
    let mut hi = key_count(page);
    while lo < hi {
        let mid = (lo + hi) / 2;
        match leaf_key(page, mid).cmp(key) {
            std::cmp::Ordering::Less => lo = mid + 1,
            std::cmp::Ordering::Greater => hi = mid,
            std::cmp::Ordering::Equal => return Ok(mid),
        }
    }
    Err(lo)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::NO_PAGE;

    fn leaf_page() -> Page {
        let mut page = Page::new(5, 4096, 4096);
        init_node(&mut page, PageType::PrimaryBTreeNode, NODE_LEAF, 64);
        page
    }

    #[test]
    fn test_init_and_header() {
        let page = leaf_page();
        assert_eq!(node_kind(&page), NODE_LEAF);
        assert_eq!(key_count(&page), 0);
        assert_eq!(max_entries(&page), 64);
        assert_eq!(link(&page), NO_PAGE);
    }

    #[test]
    fn test_insert_ordered_entries() {
        let mut page = leaf_page();
        let loc = DocLocation::new(9, 3);
        assert!(insert_entry(&mut page, 0, &encode_leaf_entry(b"bb", loc)));
        assert!(insert_entry(&mut page, 0, &encode_leaf_entry(b"aa", loc)));
        assert!(insert_entry(&mut page, 2, &encode_leaf_entry(b"cc", loc)));

        assert_eq!(key_count(&page), 3);
        assert_eq!(leaf_key(&page, 0), b"aa");
        assert_eq!(leaf_key(&page, 1), b"bb");
        assert_eq!(leaf_key(&page, 2), b"cc");
        assert_eq!(leaf_location(&page, 1), loc);
    }

    #[test]
    fn test_remove_and_compact_reuse() {
        let mut page = leaf_page();
        let loc = DocLocation::new(1, 0);
        let big = vec![0xAB; 900];
        let mut inserted = 0u16;
        while insert_entry(&mut page, inserted, &encode_leaf_entry(&big, loc)) {
            inserted += 1;
        }
        assert!(inserted >= 4);

        remove_entry(&mut page, 0);
        remove_entry(&mut page, 0);
        // Space from removed entries is reclaimable via compaction.
        let idx = key_count(&page);
        assert!(insert_entry(&mut page, idx, &encode_leaf_entry(&big, loc)));
    }

    #[test]
    fn test_leaf_search() {
        let mut page = leaf_page();
        let loc = DocLocation::new(1, 0);
        for key in [b"b", b"d", b"f"] {
            let idx = key_count(&page);
            insert_entry(&mut page, idx, &encode_leaf_entry(key, loc));
        }
        assert_eq!(leaf_search(&page, b"d"), Ok(1));
        assert_eq!(leaf_search(&page, b"a"), Err(0));
        assert_eq!(leaf_search(&page, b"c"), Err(1));
        assert_eq!(leaf_search(&page, b"z"), Err(3));
    }

    #[test]
    fn test_internal_entries_and_child_lookup() {
        let mut page = Page::new(6, 4096, 4096);
        init_node(&mut page, PageType::PrimaryBTreeNode, NODE_INTERNAL, 64);
        set_link(&mut page, 99);

        insert_entry(&mut page, 0, &encode_internal_entry(10, b"m"));
        insert_entry(&mut page, 1, &encode_internal_entry(20, b"t"));

        assert_eq!(find_child_index(&page, b"a"), (0, 10));
        assert_eq!(find_child_index(&page, b"m"), (1, 20));
        assert_eq!(find_child_index(&page, b"s"), (1, 20));
        assert_eq!(find_child_index(&page, b"t"), (2, 99));
        assert_eq!(find_child_index(&page, b"z"), (2, 99));
    }

    #[test]
    fn test_capacity_heuristic() {
        let primary = capacity_for(8192, 8);
        let wide = capacity_for(8192, 200);
        assert!(primary > wide);
        assert!(wide >= 4);
    }
}
