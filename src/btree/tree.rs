//! Disk-resident B+-tree over byte-string keys.
//!
//! Rebalancing is preemptive: descent for insert splits any full node
//! before entering it, and descent for delete tops up any minimal node by
//! borrow-left / borrow-right / merge before entering it, so no change
//! ever propagates back up the path. Leaves are chained through their
//! right-sibling link in ascending key order; range scans descend once and
//! then walk the chain.

use crate::btree::node::*;
use crate::error::{GaldrError, Result};
use crate::storage::page::{DocLocation, Page, PageId, PageType, NO_PAGE};
use crate::storage::page_store::PageStore;

/// Depth guard against cycles in corrupted trees.
const MAX_DEPTH: usize = 64;

/// Leaf-chain guard for scans.
const MAX_SCAN_PAGES: usize = 100_000_000;

/// A node counts as full once it cannot absorb a worst-case entry.
const FULL_RESERVE: usize = crate::btree::key_encoding::MAX_KEY_LEN + 16;

pub struct BTree {
    root: PageId,
    page_type: PageType,
    avg_key_size: usize,
}

impl BTree {
    /// Create a tree with a fresh empty root leaf.
    pub fn create(
        store: &mut impl PageStore,
        page_type: PageType,
        avg_key_size: usize,
    ) -> Result<Self> {
        let mut root = store.allocate_page(0, page_type)?;
        let capacity = capacity_for(store.usable_size(), avg_key_size);
        init_node(&mut root, page_type, NODE_LEAF, capacity);
        let root_id = root.id();
        store.write_page(&root)?;
        Ok(BTree {
            root: root_id,
            page_type,
            avg_key_size,
        })
    }

    pub fn open(root: PageId, page_type: PageType, avg_key_size: usize) -> Self {
        BTree {
            root,
            page_type,
            avg_key_size,
        }
    }

    pub fn root(&self) -> PageId {
        self.root
    }

    fn is_full(&self, page: &Page) -> bool {
        key_count(page) >= max_entries(page) || total_free(page) < FULL_RESERVE
    }

    fn min_entries(page: &Page) -> u16 {
        (max_entries(page) / 2).max(1)
    }

    fn child_at(page: &Page, idx: usize) -> PageId {
        if idx < key_count(page) as usize {
            internal_child(page, idx as u16)
        } else {
            link(page)
        }
    }

    /// Look up a key. O(log N) root-to-leaf descent with binary search in
    /// the leaf.
    pub fn search(&self, store: &mut impl PageStore, key: &[u8]) -> Result<Option<DocLocation>> {
        let mut cur = self.root;
        for _ in 0..MAX_DEPTH {
            let page = store.read_page(cur)?;
            match node_kind(&page) {
                NODE_LEAF => {
                    return Ok(match leaf_search(&page, key) {
                        Ok(idx) => Some(leaf_location(&page, idx)),
                        Err(_) => None,
                    });
                }
                NODE_INTERNAL => {
                    cur = find_child_index(&page, key).1;
                }
                _ => return Err(GaldrError::Corruption(format!("page {} is not a tree node", cur))),
            }
        }
        Err(GaldrError::Corruption("tree depth exceeds maximum".into()))
    }

    /// Insert or replace. Returns the prior location for a duplicate key.
    pub fn insert(
        &mut self,
        store: &mut impl PageStore,
        key: &[u8],
        loc: DocLocation,
    ) -> Result<Option<DocLocation>> {
        let root_page = store.read_page(self.root)?;
        if self.is_full(&root_page) {
            self.split_root(store, root_page)?;
        }

        let mut cur = self.root;
        for _ in 0..MAX_DEPTH {
            let mut page = store.read_page(cur)?;
            match node_kind(&page) {
                NODE_LEAF => match leaf_search(&page, key) {
                    Ok(idx) => {
                        let old = leaf_location(&page, idx);
                        if !replace_entry(&mut page, idx, &encode_leaf_entry(key, loc)) {
                            return Err(GaldrError::Corruption(
                                "leaf replace overflow on equal-size entry".into(),
                            ));
                        }
                        store.write_page(&page)?;
                        return Ok(Some(old));
                    }
                    Err(idx) => {
                        if !insert_entry(&mut page, idx, &encode_leaf_entry(key, loc)) {
                            return Err(GaldrError::Corruption(
                                "leaf overflow after preemptive split".into(),
                            ));
                        }
                        store.write_page(&page)?;
                        return Ok(None);
                    }
                },
                NODE_INTERNAL => {
                    let (idx, child_id) = find_child_index(&page, key);
                    let child = store.read_page(child_id)?;
                    if self.is_full(&child) {
                        self.split_child(store, &mut page, idx, child)?;
                        store.write_page(&page)?;
                        cur = find_child_index(&page, key).1;
                    } else {
                        cur = child_id;
                    }
                }
                _ => {
                    return Err(GaldrError::Corruption(format!(
                        "page {} is not a tree node",
                        cur
                    )))
                }
            }
        }
        Err(GaldrError::Corruption("tree depth exceeds maximum".into()))
    }

    fn split_root(&mut self, store: &mut impl PageStore, root_page: Page) -> Result<()> {
        let mut new_root = store.allocate_page(self.root, self.page_type)?;
        let capacity = capacity_for(store.usable_size(), self.avg_key_size);
        init_node(&mut new_root, self.page_type, NODE_INTERNAL, capacity);
        set_link(&mut new_root, root_page.id());
        self.split_child(store, &mut new_root, 0, root_page)?;
        store.write_page(&new_root)?;
        self.root = new_root.id();
        Ok(())
    }

    /// Split a full child; `parent_idx` is the directory position through
    /// which the child was reached (== key_count for the rightmost child).
    fn split_child(
        &mut self,
        store: &mut impl PageStore,
        parent: &mut Page,
        parent_idx: usize,
        mut child: Page,
    ) -> Result<()> {
        let child_id = child.id();
        let n = key_count(&child);
        if n < 2 {
            return Err(GaldrError::Corruption("splitting a node with < 2 keys".into()));
        }
        let mid = n / 2;

        let mut right = store.allocate_page(child_id.wrapping_add(1), self.page_type)?;
        init_node(&mut right, self.page_type, node_kind(&child), max_entries(&child));
        let right_id = right.id();

        let separator: Vec<u8>;
        match node_kind(&child) {
            NODE_LEAF => {
                // B+ leaf split: the right half keeps the median, the
                // separator is copied up.
                for i in mid..n {
                    let bytes = entry(&child, i).to_vec();
                    if !insert_entry(&mut right, i - mid, &bytes) {
                        return Err(GaldrError::Corruption("split target overflow".into()));
                    }
                }
                for _ in mid..n {
                    remove_entry(&mut child, mid);
                }
                separator = leaf_key(&right, 0).to_vec();
                set_link(&mut right, link(&child));
                set_link(&mut child, right_id);
            }
            NODE_INTERNAL => {
                // The median key moves up; its child becomes the left
                // half's rightmost child.
                separator = internal_key(&child, mid).to_vec();
                let median_child = internal_child(&child, mid);
                for i in mid + 1..n {
                    let bytes = entry(&child, i).to_vec();
                    if !insert_entry(&mut right, i - mid - 1, &bytes) {
                        return Err(GaldrError::Corruption("split target overflow".into()));
                    }
                }
                set_link(&mut right, link(&child));
                for _ in mid..n {
                    remove_entry(&mut child, mid);
                }
                set_link(&mut child, median_child);
            }
            _ => return Err(GaldrError::Corruption("splitting a non-node page".into())),
        }

        let parent_count = key_count(parent) as usize;
        if parent_idx < parent_count {
            // The entry that routed to the child keeps its key but must now
            // route to the right half.
            let old = entry(parent, parent_idx as u16).to_vec();
            let (_, old_key) = decode_internal_entry(&old);
            let fixed = encode_internal_entry(right_id, old_key);
            if !replace_entry(parent, parent_idx as u16, &fixed) {
                return Err(GaldrError::Corruption("parent overflow during split".into()));
            }
        } else {
            set_link(parent, right_id);
        }
        if !insert_entry(
            parent,
            parent_idx as u16,
            &encode_internal_entry(child_id, &separator),
        ) {
            return Err(GaldrError::Corruption("parent overflow during split".into()));
        }

        store.write_page(&child)?;
        store.write_page(&right)?;
        Ok(())
    }

    /// Delete a key. Returns true when it was present.
    pub fn delete(&mut self, store: &mut impl PageStore, key: &[u8]) -> Result<bool> {
        let mut cur = self.root;
        for _ in 0..MAX_DEPTH {
            let mut page = store.read_page(cur)?;
            match node_kind(&page) {
                NODE_LEAF => match leaf_search(&page, key) {
                    Ok(idx) => {
                        remove_entry(&mut page, idx);
                        store.write_page(&page)?;
                        return Ok(true);
                    }
                    Err(_) => return Ok(false),
                },
                NODE_INTERNAL => {
                    let (idx, child_id) = find_child_index(&page, key);
                    let child = store.read_page(child_id)?;
                    if key_count(&child) <= Self::min_entries(&child) {
                        self.fix_child(store, &mut page, idx)?;
                        store.write_page(&page)?;
                        if page.id() == self.root && key_count(&page) == 0 {
                            // Height shrink: the lone child becomes the root.
                            let new_root = link(&page);
                            store.free_page(self.root)?;
                            self.root = new_root;
                            cur = new_root;
                        } else {
                            cur = find_child_index(&page, key).1;
                        }
                    } else {
                        cur = child_id;
                    }
                }
                _ => {
                    return Err(GaldrError::Corruption(format!(
                        "page {} is not a tree node",
                        cur
                    )))
                }
            }
        }
        Err(GaldrError::Corruption("tree depth exceeds maximum".into()))
    }

    /// Top up a minimal child before descending into it: borrow from the
    /// left sibling, else the right sibling, else merge. With
    /// variable-length keys a rebalance can be impossible by byte count;
    /// it is then skipped, which keeps the tree valid but underfull.
    fn fix_child(
        &mut self,
        store: &mut impl PageStore,
        parent: &mut Page,
        idx: usize,
    ) -> Result<()> {
        let n = key_count(parent) as usize;
        let child_id = Self::child_at(parent, idx);
        let mut child = store.read_page(child_id)?;

        if idx > 0 {
            let left_id = Self::child_at(parent, idx - 1);
            let mut left = store.read_page(left_id)?;
            if key_count(&left) > Self::min_entries(&left)
                && self.borrow_from_left(parent, idx, &mut left, &mut child)?
            {
                store.write_page(&left)?;
                store.write_page(&child)?;
                return Ok(());
            }
        }
        if idx < n {
            let right_id = Self::child_at(parent, idx + 1);
            let mut right = store.read_page(right_id)?;
            if key_count(&right) > Self::min_entries(&right)
                && self.borrow_from_right(parent, idx, &mut child, &mut right)?
            {
                store.write_page(&child)?;
                store.write_page(&right)?;
                return Ok(());
            }
        }

        // Merge with a neighbor: prefer the left pair so the surviving
        // node keeps the smaller keys.
        if idx > 0 {
            let left_id = Self::child_at(parent, idx - 1);
            let left = store.read_page(left_id)?;
            if self.merge_pair(store, parent, idx - 1, left, child)? {
                return Ok(());
            }
        } else if idx < n {
            let right_id = Self::child_at(parent, idx + 1);
            let right = store.read_page(right_id)?;
            if self.merge_pair(store, parent, idx, child, right)? {
                return Ok(());
            }
        }
        Ok(())
    }

    /// Move the left sibling's last entry into the child.
    fn borrow_from_left(
        &self,
        parent: &mut Page,
        idx: usize,
        left: &mut Page,
        child: &mut Page,
    ) -> Result<bool> {
        let sep_idx = (idx - 1) as u16;
        let last = key_count(left) - 1;
        match node_kind(child) {
            NODE_LEAF => {
                let moved = entry(left, last).to_vec();
                if total_free(child) < moved.len() + 8 {
                    return Ok(false);
                }
                let (moved_key, _) = decode_leaf_entry(&moved);
                let new_sep = encode_internal_entry(Self::child_at_entry(parent, sep_idx), moved_key);
                if !replace_entry(parent, sep_idx, &new_sep) {
                    return Ok(false);
                }
                remove_entry(left, last);
                if !insert_entry(child, 0, &moved) {
                    return Err(GaldrError::Corruption("borrow target overflow".into()));
                }
                Ok(true)
            }
            NODE_INTERNAL => {
                let sep_key = internal_key(parent, sep_idx).to_vec();
                let moved = entry(left, last).to_vec();
                let (moved_child, moved_key) = decode_internal_entry(&moved);
                let incoming = encode_internal_entry(link(left), &sep_key);
                if total_free(child) < incoming.len() + 8 {
                    return Ok(false);
                }
                let new_sep =
                    encode_internal_entry(Self::child_at_entry(parent, sep_idx), moved_key);
                if !replace_entry(parent, sep_idx, &new_sep) {
                    return Ok(false);
                }
                if !insert_entry(child, 0, &incoming) {
                    return Err(GaldrError::Corruption("borrow target overflow".into()));
                }
                set_link(left, moved_child);
                remove_entry(left, last);
                Ok(true)
            }
            _ => Err(GaldrError::Corruption("borrow through non-node page".into())),
        }
    }

    /// Move the right sibling's first entry into the child.
    fn borrow_from_right(
        &self,
        parent: &mut Page,
        idx: usize,
        child: &mut Page,
        right: &mut Page,
    ) -> Result<bool> {
        let sep_idx = idx as u16;
        match node_kind(child) {
            NODE_LEAF => {
                let moved = entry(right, 0).to_vec();
                if total_free(child) < moved.len() + 8 {
                    return Ok(false);
                }
                remove_entry(right, 0);
                let new_first = leaf_key(right, 0).to_vec();
                let new_sep =
                    encode_internal_entry(Self::child_at_entry(parent, sep_idx), &new_first);
                if !replace_entry(parent, sep_idx, &new_sep) {
                    // Roll the moved entry back.
                    let restored = insert_entry(right, 0, &moved);
                    debug_assert!(restored);
                    return Ok(false);
                }
                let count = key_count(child);
                if !insert_entry(child, count, &moved) {
                    return Err(GaldrError::Corruption("borrow target overflow".into()));
                }
                Ok(true)
            }
            NODE_INTERNAL => {
                let sep_key = internal_key(parent, sep_idx).to_vec();
                let first = entry(right, 0).to_vec();
                let (first_child, first_key) = decode_internal_entry(&first);
                let incoming = encode_internal_entry(link(child), &sep_key);
                if total_free(child) < incoming.len() + 8 {
                    return Ok(false);
                }
                let new_sep =
                    encode_internal_entry(Self::child_at_entry(parent, sep_idx), first_key);
                if !replace_entry(parent, sep_idx, &new_sep) {
                    return Ok(false);
                }
                let count = key_count(child);
                if !insert_entry(child, count, &incoming) {
                    return Err(GaldrError::Corruption("borrow target overflow".into()));
                }
                set_link(child, first_child);
                remove_entry(right, 0);
                Ok(true)
            }
            _ => Err(GaldrError::Corruption("borrow through non-node page".into())),
        }
    }

    fn child_at_entry(parent: &Page, idx: u16) -> PageId {
        internal_child(parent, idx)
    }

    /// Merge the right node of a sibling pair into the left and drop the
    /// separator. Returns false when the combined entries cannot fit.
    fn merge_pair(
        &mut self,
        store: &mut impl PageStore,
        parent: &mut Page,
        sep_idx: usize,
        mut left: Page,
        right: Page,
    ) -> Result<bool> {
        let right_bytes: usize = (0..key_count(&right))
            .map(|i| entry(&right, i).len() + 4)
            .sum();
        let sep_key = internal_key(parent, sep_idx as u16).to_vec();
        let extra = if node_kind(&left) == NODE_INTERNAL {
            sep_key.len() + 8
        } else {
            0
        };
        if total_free(&left) < right_bytes + extra {
            return Ok(false);
        }

        match node_kind(&left) {
            NODE_LEAF => {
                for i in 0..key_count(&right) {
                    let bytes = entry(&right, i).to_vec();
                    let count = key_count(&left);
                    if !insert_entry(&mut left, count, &bytes) {
                        return Err(GaldrError::Corruption("merge overflow".into()));
                    }
                }
                set_link(&mut left, link(&right));
            }
            NODE_INTERNAL => {
                // The separator comes down between the two entry runs.
                let bridge = encode_internal_entry(link(&left), &sep_key);
                let count = key_count(&left);
                if !insert_entry(&mut left, count, &bridge) {
                    return Err(GaldrError::Corruption("merge overflow".into()));
                }
                for i in 0..key_count(&right) {
                    let bytes = entry(&right, i).to_vec();
                    let count = key_count(&left);
                    if !insert_entry(&mut left, count, &bytes) {
                        return Err(GaldrError::Corruption("merge overflow".into()));
                    }
                }
                set_link(&mut left, link(&right));
            }
            _ => return Err(GaldrError::Corruption("merging non-node pages".into())),
        }

        // Remove the separator; the pointer that routed to the right node
        // now routes to the merged left node.
        let left_id = left.id();
        let right_id = right.id();
        remove_entry(parent, sep_idx as u16);
        let n = key_count(parent) as usize;
        if sep_idx < n {
            let old = entry(parent, sep_idx as u16).to_vec();
            let (old_child, old_key) = decode_internal_entry(&old);
            debug_assert_eq!(old_child, right_id);
            if !replace_entry(
                parent,
                sep_idx as u16,
                &encode_internal_entry(left_id, old_key),
            ) {
                return Err(GaldrError::Corruption("parent fix-up overflow".into()));
            }
        } else {
            set_link(parent, left_id);
        }

        store.write_page(&left)?;
        store.free_page(right_id)?;
        Ok(true)
    }

    /// Ordered scan over `[lo, hi]` with per-bound inclusivity; `None`
    /// means unbounded. Descends to the first in-range leaf and follows
    /// sibling links.
    pub fn range(
        &self,
        store: &mut impl PageStore,
        lo: Option<(&[u8], bool)>,
        hi: Option<(&[u8], bool)>,
    ) -> Result<Vec<(Vec<u8>, DocLocation)>> {
        let mut out = Vec::new();
        self.range_with(store, lo, hi, |key, loc| {
            out.push((key.to_vec(), loc));
            true
        })?;
        Ok(out)
    }

    /// Callback-driven range scan; the callback returns false to stop.
    pub fn range_with(
        &self,
        store: &mut impl PageStore,
        lo: Option<(&[u8], bool)>,
        hi: Option<(&[u8], bool)>,
        mut visit: impl FnMut(&[u8], DocLocation) -> bool,
    ) -> Result<()> {
        // Descend to the leaf that may hold the lower bound.
        let mut cur = self.root;
        let mut depth = 0usize;
        let leaf = loop {
            depth += 1;
            if depth > MAX_DEPTH {
                return Err(GaldrError::Corruption("tree depth exceeds maximum".into()));
            }
            let page = store.read_page(cur)?;
            match node_kind(&page) {
                NODE_LEAF => break page,
                NODE_INTERNAL => {
                    cur = match lo {
                        Some((key, _)) => find_child_index(&page, key).1,
                        None => Self::child_at(&page, 0),
                    };
                }
                _ => {
                    return Err(GaldrError::Corruption(format!(
                        "page {} is not a tree node",
                        cur
                    )))
                }
            }
        };

        let mut page = leaf;
        let mut start_idx = match lo {
            Some((key, inclusive)) => match leaf_search(&page, key) {
                Ok(idx) if inclusive => idx,
                Ok(idx) => idx + 1,
                Err(idx) => idx,
            },
            None => 0,
        };

        let mut visited = 0usize;
        loop {
            visited += 1;
            if visited > MAX_SCAN_PAGES {
                return Err(GaldrError::Corruption("leaf chain loop detected".into()));
            }
            let count = key_count(&page);
            for idx in start_idx..count {
                let key = leaf_key(&page, idx);
                if let Some((bound, inclusive)) = hi {
                    let over = if inclusive { key > bound } else { key >= bound };
                    if over {
                        return Ok(());
                    }
                }
                let loc = leaf_location(&page, idx);
                if !visit(key, loc) {
                    return Ok(());
                }
            }
            let next = link(&page);
            if next == NO_PAGE {
                return Ok(());
            }
            page = store.read_page(next)?;
            start_idx = 0;
        }
    }

    /// All entries in key order, via the leftmost leaf and sibling links.
    pub fn all_entries(&self, store: &mut impl PageStore) -> Result<Vec<(Vec<u8>, DocLocation)>> {
        self.range(store, None, None)
    }

    /// Every page id the tree occupies (for drop-index and compaction).
    pub fn collect_pages(&self, store: &mut impl PageStore) -> Result<Vec<PageId>> {
        let mut pages = Vec::new();
        let mut stack = vec![(self.root, 0usize)];
        while let Some((id, depth)) = stack.pop() {
            if depth > MAX_DEPTH {
                return Err(GaldrError::Corruption("tree depth exceeds maximum".into()));
            }
            let page = store.read_page(id)?;
            pages.push(id);
            if node_kind(&page) == NODE_INTERNAL {
                for i in 0..key_count(&page) {
                    stack.push((internal_child(&page, i), depth + 1));
                }
                stack.push((link(&page), depth + 1));
            }
        }
        Ok(pages)
    }
}
