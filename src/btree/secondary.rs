//! Secondary index: `encoded_field_value || big_endian(id)` -> location.
//!
//! The id suffix makes every tree key unique even when field values
//! collide, and records which document each entry points at; equality and
//! prefix probes become half-open key ranges via `prefix_end`.

use crate::btree::key_encoding::{decode_id, encode_id, prefix_end, TAG_NULL};
use crate::btree::tree::BTree;
use crate::error::Result;
use crate::storage::page::{DocLocation, PageId, PageType};
use crate::storage::page_store::PageStore;

const ID_SUFFIX: usize = 8;

pub struct SecondaryIndex {
    tree: BTree,
    unique: bool,
}

impl SecondaryIndex {
    pub fn create(store: &mut impl PageStore, avg_key_size: usize, unique: bool) -> Result<Self> {
        Ok(SecondaryIndex {
            tree: BTree::create(store, PageType::SecondaryBTreeNode, avg_key_size + ID_SUFFIX)?,
            unique,
        })
    }

    pub fn open(root: PageId, avg_key_size: usize, unique: bool) -> Self {
        SecondaryIndex {
            tree: BTree::open(root, PageType::SecondaryBTreeNode, avg_key_size + ID_SUFFIX),
            unique,
        }
    }

    pub fn root(&self) -> PageId {
        self.tree.root()
    }

    pub fn is_unique(&self) -> bool {
        self.unique
    }

    fn compose(encoded: &[u8], id: i64) -> Vec<u8> {
        let mut key = Vec::with_capacity(encoded.len() + ID_SUFFIX);
        key.extend_from_slice(encoded);
        key.extend_from_slice(&encode_id(id));
        key
    }

    fn split(key: &[u8]) -> (&[u8], i64) {
        let at = key.len() - ID_SUFFIX;
        (&key[..at], decode_id(&key[at..]))
    }

    pub fn insert_entry(
        &mut self,
        store: &mut impl PageStore,
        encoded: &[u8],
        id: i64,
        loc: DocLocation,
    ) -> Result<()> {
        self.tree.insert(store, &Self::compose(encoded, id), loc)?;
        Ok(())
    }

    pub fn remove_entry(
        &mut self,
        store: &mut impl PageStore,
        encoded: &[u8],
        id: i64,
    ) -> Result<bool> {
        self.tree.delete(store, &Self::compose(encoded, id))
    }

    /// All documents whose encoded value equals `encoded`, in id order.
    pub fn equal_scan(
        &self,
        store: &mut impl PageStore,
        encoded: &[u8],
    ) -> Result<Vec<(i64, DocLocation)>> {
        let end = prefix_end(encoded);
        let entries = self.tree.range(
            store,
            Some((encoded, true)),
            end.as_deref().map(|e| (e, false)),
        )?;
        Ok(entries
            .into_iter()
            .map(|(key, loc)| {
                let (_, id) = Self::split(&key);
                (id, loc)
            })
            .collect())
    }

    /// Range scan over encoded values with per-bound inclusivity.
    /// An exclusive bound on a value is realized as the half-open range
    /// beyond every key carrying that value's prefix.
    pub fn range_scan(
        &self,
        store: &mut impl PageStore,
        lo: Option<(&[u8], bool)>,
        hi: Option<(&[u8], bool)>,
    ) -> Result<Vec<(Vec<u8>, i64, DocLocation)>> {
        let lo_key: Option<(Vec<u8>, bool)> = match lo {
            Some((enc, true)) => Some((enc.to_vec(), true)),
            Some((enc, false)) => match prefix_end(enc) {
                Some(end) => Some((end, true)),
                // Nothing can sort above an all-0xFF prefix.
                None => return Ok(Vec::new()),
            },
            None => None,
        };
        let hi_key: Option<(Vec<u8>, bool)> = match hi {
            // Inclusive upper bound covers every key carrying the value's
            // prefix; no prefix end means unbounded.
            Some((enc, true)) => prefix_end(enc).map(|end| (end, false)),
            Some((enc, false)) => Some((enc.to_vec(), false)),
            None => None,
        };

        let entries = self.tree.range(
            store,
            lo_key.as_ref().map(|(k, inc)| (k.as_slice(), *inc)),
            hi_key.as_ref().map(|(k, inc)| (k.as_slice(), *inc)),
        )?;
        Ok(entries
            .into_iter()
            .map(|(key, loc)| {
                let (encoded, id) = Self::split(&key);
                (encoded.to_vec(), id, loc)
            })
            .collect())
    }

    /// Prefix scan: all entries whose encoded value starts with `prefix`.
    pub fn prefix_scan(
        &self,
        store: &mut impl PageStore,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, i64, DocLocation)>> {
        let end = prefix_end(prefix);
        let entries = self.tree.range(
            store,
            Some((prefix, true)),
            end.as_deref().map(|e| (e, false)),
        )?;
        Ok(entries
            .into_iter()
            .map(|(key, loc)| {
                let (encoded, id) = Self::split(&key);
                (encoded.to_vec(), id, loc)
            })
            .collect())
    }

    /// Ids already holding `encoded` in this index. Null values (reserved
    /// leading tag byte) are exempt from uniqueness.
    pub fn unique_check(
        &self,
        store: &mut impl PageStore,
        encoded: &[u8],
    ) -> Result<Vec<i64>> {
        if encoded.first() == Some(&TAG_NULL) {
            return Ok(Vec::new());
        }
        Ok(self
            .equal_scan(store, encoded)?
            .into_iter()
            .map(|(id, _)| id)
            .collect())
    }

    pub fn all_entries(
        &self,
        store: &mut impl PageStore,
    ) -> Result<Vec<(Vec<u8>, i64, DocLocation)>> {
        let entries = self.tree.range(store, None, None)?;
        Ok(entries
            .into_iter()
            .map(|(key, loc)| {
                let (encoded, id) = Self::split(&key);
                (encoded.to_vec(), id, loc)
            })
            .collect())
    }

    pub fn collect_pages(&self, store: &mut impl PageStore) -> Result<Vec<PageId>> {
        self.tree.collect_pages(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::key_encoding::{encode_string_prefix, encode_value};
    use crate::storage::page_io::MemoryPageIo;
    use crate::storage::pager::PageManager;
    use crate::types::Value;

    fn store() -> PageManager {
        PageManager::create(Box::new(MemoryPageIo::new(4096)), 0, 16, 256).unwrap()
    }

    fn enc(s: &str) -> Vec<u8> {
        encode_value(&Value::String(s.into())).unwrap()
    }

    #[test]
    fn test_equal_scan_with_duplicates() {
        let mut s = store();
        let mut index = SecondaryIndex::create(&mut s, 16, false).unwrap();

        index.insert_entry(&mut s, &enc("blue"), 1, DocLocation::new(9, 0)).unwrap();
        index.insert_entry(&mut s, &enc("blue"), 3, DocLocation::new(9, 1)).unwrap();
        index.insert_entry(&mut s, &enc("red"), 2, DocLocation::new(9, 2)).unwrap();

        let hits = index.equal_scan(&mut s, &enc("blue")).unwrap();
        let ids: Vec<i64> = hits.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![1, 3]);
        assert!(index.equal_scan(&mut s, &enc("green")).unwrap().is_empty());
    }

    #[test]
    fn test_remove_single_entry() {
        let mut s = store();
        let mut index = SecondaryIndex::create(&mut s, 16, false).unwrap();
        index.insert_entry(&mut s, &enc("x"), 1, DocLocation::new(1, 0)).unwrap();
        index.insert_entry(&mut s, &enc("x"), 2, DocLocation::new(1, 1)).unwrap();

        assert!(index.remove_entry(&mut s, &enc("x"), 1).unwrap());
        let ids: Vec<i64> = index
            .equal_scan(&mut s, &enc("x"))
            .unwrap()
            .iter()
            .map(|(id, _)| *id)
            .collect();
        assert_eq!(ids, vec![2]);
    }

    #[test]
    fn test_prefix_scan() {
        let mut s = store();
        let mut index = SecondaryIndex::create(&mut s, 16, false).unwrap();
        for (i, name) in ["Alice", "Albert", "Bob", "Alfred", "Carol"].iter().enumerate() {
            index
                .insert_entry(&mut s, &enc(name), i as i64, DocLocation::new(1, i as u16))
                .unwrap();
        }

        let probe = encode_string_prefix("Al").unwrap();
        let hits = index.prefix_scan(&mut s, &probe).unwrap();
        let mut ids: Vec<i64> = hits.iter().map(|(_, id, _)| *id).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 1, 3]);
    }

    #[test]
    fn test_range_scan_exclusive_bounds() {
        let mut s = store();
        let mut index = SecondaryIndex::create(&mut s, 16, false).unwrap();
        for (i, v) in [10i64, 20, 30, 40].iter().enumerate() {
            let encoded = encode_value(&Value::Int64(*v)).unwrap();
            index
                .insert_entry(&mut s, &encoded, i as i64, DocLocation::new(1, i as u16))
                .unwrap();
        }

        let lo = encode_value(&Value::Int64(10)).unwrap();
        let hi = encode_value(&Value::Int64(40)).unwrap();
        let hits = index
            .range_scan(&mut s, Some((&lo, false)), Some((&hi, false)))
            .unwrap();
        let ids: Vec<i64> = hits.iter().map(|(_, id, _)| *id).collect();
        assert_eq!(ids, vec![1, 2]);

        let hits = index
            .range_scan(&mut s, Some((&lo, true)), Some((&hi, true)))
            .unwrap();
        assert_eq!(hits.len(), 4);
    }

    #[test]
    fn test_unique_check_skips_nulls() {
        let mut s = store();
        let mut index = SecondaryIndex::create(&mut s, 16, true).unwrap();
        let null_key = encode_value(&Value::Null).unwrap();
        index.insert_entry(&mut s, &null_key, 1, DocLocation::new(1, 0)).unwrap();
        index.insert_entry(&mut s, &enc("taken"), 2, DocLocation::new(1, 1)).unwrap();

        assert!(index.unique_check(&mut s, &null_key).unwrap().is_empty());
        assert_eq!(index.unique_check(&mut s, &enc("taken")).unwrap(), vec![2]);
        assert!(index.unique_check(&mut s, &enc("free")).unwrap().is_empty());
    }
}
