//! Primary index: document id -> location.

use crate::btree::key_encoding::{decode_id, encode_id};
use crate::btree::tree::BTree;
use crate::error::Result;
use crate::storage::page::{DocLocation, PageId, PageType};
use crate::storage::page_store::PageStore;

/// Ids are fixed 8-byte encoded keys.
const AVG_KEY_SIZE: usize = 8;

pub struct PrimaryIndex {
    tree: BTree,
}

impl PrimaryIndex {
    pub fn create(store: &mut impl PageStore) -> Result<Self> {
        Ok(PrimaryIndex {
            tree: BTree::create(store, PageType::PrimaryBTreeNode, AVG_KEY_SIZE)?,
        })
    }

    pub fn open(root: PageId) -> Self {
        PrimaryIndex {
            tree: BTree::open(root, PageType::PrimaryBTreeNode, AVG_KEY_SIZE),
        }
    }

    pub fn root(&self) -> PageId {
        self.tree.root()
    }

    /// Insert or move a document. Returns the prior location when the id
    /// was already present.
    pub fn insert(
        &mut self,
        store: &mut impl PageStore,
        id: i64,
        loc: DocLocation,
    ) -> Result<Option<DocLocation>> {
        self.tree.insert(store, &encode_id(id), loc)
    }

    pub fn search(&self, store: &mut impl PageStore, id: i64) -> Result<Option<DocLocation>> {
        self.tree.search(store, &encode_id(id))
    }

    pub fn delete(&mut self, store: &mut impl PageStore, id: i64) -> Result<bool> {
        self.tree.delete(store, &encode_id(id))
    }

    /// Ordered id range scan.
    pub fn range(
        &self,
        store: &mut impl PageStore,
        lo: Option<(i64, bool)>,
        hi: Option<(i64, bool)>,
    ) -> Result<Vec<(i64, DocLocation)>> {
        let lo_key = lo.map(|(id, inc)| (encode_id(id), inc));
        let hi_key = hi.map(|(id, inc)| (encode_id(id), inc));
        let entries = self.tree.range(
            store,
            lo_key.as_ref().map(|(k, inc)| (k.as_slice(), *inc)),
            hi_key.as_ref().map(|(k, inc)| (k.as_slice(), *inc)),
        )?;
        Ok(entries
            .into_iter()
            .map(|(key, loc)| (decode_id(&key), loc))
            .collect())
    }

    pub fn all_entries(&self, store: &mut impl PageStore) -> Result<Vec<(i64, DocLocation)>> {
        self.range(store, None, None)
    }

    pub fn collect_pages(&self, store: &mut impl PageStore) -> Result<Vec<PageId>> {
        self.tree.collect_pages(store)
    }
}
