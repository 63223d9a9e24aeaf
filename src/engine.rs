//! Engine: owns the pager, catalog, WAL and transaction manager, and
//! drives the commit pipeline.
//!
//! Commit ordering: validate (conflicts, unique constraints), assign a
//! txn id, apply the write set into a transactional page buffer, append
//! page images plus the commit record to the WAL and fsync, then publish
//! (page overlay, version store, committed horizon). Nothing is visible
//! to other snapshots before publish; a failure after the apply phase
//! poisons the handle.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use log::{info, warn};

use crate::btree::key_encoding::{encode_compound, encode_string_prefix, encode_value};
use crate::btree::primary::PrimaryIndex;
use crate::btree::secondary::SecondaryIndex;
use crate::catalog::catalog::CollectionsCatalog;
use crate::catalog::collection::{CollectionDef, FieldDef, IndexDef};
use crate::config::{DbOptions, MIN_PAGE_SIZE};
use crate::crypto::aead::{MasterKey, PageCrypto};
use crate::crypto::kdf::{self, CryptoHeader, CRYPTO_HEADER_SIZE, CRYPTO_MAGIC};
use crate::document::Document;
use crate::error::{GaldrError, Result};
use crate::query::exec::{self, QueryParams};
use crate::query::planner::{self, Plan, ScanSpec, TrailingBound};
use crate::record::Record;
use crate::storage::data_page::{self, ReplaceOutcome};
use crate::storage::page::{
    DocLocation, Page, DB_MAGIC, HEADER_FLAG_ENCRYPTED, HEADER_FLAG_WAL,
};
use crate::storage::page_io::{EncryptedPageIo, FilePageIo, MmapPageIo, PageIo};
use crate::storage::page_store::PageStore;
use crate::storage::pager::{PageManager, ReadPager};
use crate::tx::manager::TransactionManager;
use crate::tx::page_store::TxPageStore;
use crate::tx::transaction::{TxMode, TxState, WriteKind};
use crate::tx::version::{DocKey, Visibility};
use crate::wal::record::WalRecord;
use crate::wal::recovery;
use crate::wal::writer::WalWriter;

#[derive(Debug, Clone)]
pub struct IndexHint {
    pub fields: Vec<String>,
    pub unique: bool,
}

/// Declared schema carried from the typed `Record` contract (or supplied
/// explicitly for dynamic collections).
#[derive(Debug, Clone, Default)]
pub struct SchemaHint {
    pub fields: Vec<FieldDef>,
    pub indexes: Vec<IndexHint>,
}

impl SchemaHint {
    pub fn from_record<T: Record>() -> Self {
        let mut indexes = Vec::new();
        for field in T::fields() {
            if field.indexed {
                indexes.push(IndexHint {
                    fields: vec![field.name.to_string()],
                    unique: field.unique,
                });
            }
        }
        for index in T::indexes() {
            indexes.push(IndexHint {
                fields: index.fields.iter().map(|f| f.to_string()).collect(),
                unique: index.unique,
            });
        }
        SchemaHint {
            fields: T::fields()
                .iter()
                .map(|f| FieldDef {
                    name: f.name.to_string(),
                    field_type: f.field_type,
                })
                .collect(),
            indexes,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IndexInfo {
    pub name: String,
    pub fields: Vec<String>,
    pub unique: bool,
}

#[derive(Debug, Clone)]
pub struct CollectionInfo {
    pub name: String,
    pub document_count: u64,
    pub next_id: i64,
    pub indexes: Vec<IndexInfo>,
}

#[derive(Debug, Clone)]
pub struct CompactResult {
    pub collections: usize,
    pub documents_copied: u64,
    pub target_file_size: u64,
    pub bytes_saved: u64,
}

pub struct Engine {
    db_path: PathBuf,
    options: DbOptions,
    pager: PageManager,
    catalog: CollectionsCatalog,
    txns: TransactionManager,
    wal: Option<WalWriter>,
    #[allow(dead_code)]
    master_key: Option<MasterKey>,
    poisoned: Option<String>,
}

fn wal_path_for(db_path: &Path) -> PathBuf {
    db_path.with_extension("wal")
}

fn truncate_wal_durably(wal_path: &Path) -> Result<()> {
    let wal_file = File::create(wal_path)?;
    wal_file.sync_all()?;
    if let Some(parent) = wal_path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

/// Encoded compound key for one index over one document; the flag reports
/// whether any component was null (exempt from unique checks).
pub(crate) fn index_key_for(doc: &Document, index: &IndexDef) -> Result<(Vec<u8>, bool)> {
    let values: Vec<crate::types::Value> = index
        .fields
        .iter()
        .map(|f| doc.value_of(f).unwrap_or(crate::types::Value::Null))
        .collect();
    let has_null = values.iter().any(|v| v.is_null());
    Ok((encode_compound(&values)?, has_null))
}

impl Engine {
    pub fn create(path: &Path, options: DbOptions) -> Result<Self> {
        options.validate()?;
        let page_size = options.page_size as usize;
        let wal_path = wal_path_for(path);

        let mut flags = 0u32;
        if options.use_wal {
            flags |= HEADER_FLAG_WAL;
        }

        let (io, master_key): (Box<dyn PageIo>, Option<MasterKey>) = match &options.encryption {
            Some(enc) => {
                flags |= HEADER_FLAG_ENCRYPTED;
                let salt = kdf::generate_salt();
                let key = kdf::derive_key(enc.password.as_bytes(), &salt, enc.kdf_iterations);
                let header = CryptoHeader::new(salt, enc.kdf_iterations, options.page_size);
                let io = EncryptedPageIo::create(
                    path,
                    page_size,
                    PageCrypto::new(&key),
                    &header.serialize(),
                )?;
                (Box::new(io), Some(key))
            }
            None if options.use_mmap => (Box::new(MmapPageIo::create(path, page_size)?), None),
            None => (Box::new(FilePageIo::create(path, page_size)?), None),
        };

        let pager =
            PageManager::create(io, flags, options.expansion_page_count, options.cache_pages)?;
        let catalog = CollectionsCatalog::new(pager.catalog_start());
        let wal = if options.use_wal {
            Some(WalWriter::create(
                &wal_path,
                master_key.as_ref().map(PageCrypto::new),
            )?)
        } else {
            None
        };

        info!("created database at {}", path.display());
        Ok(Engine {
            db_path: path.to_path_buf(),
            options,
            pager,
            catalog,
            txns: TransactionManager::new(),
            wal,
            master_key,
            poisoned: None,
        })
    }

    pub fn open(path: &Path, options: DbOptions) -> Result<Self> {
        options.validate()?;
        let wal_path = wal_path_for(path);

        let mut probe = [0u8; 4];
        {
            let mut file = File::open(path)?;
            file.read_exact(&mut probe)
                .map_err(|_| GaldrError::Corruption("file too small for a header".into()))?;
        }
        let first_word = u32::from_le_bytes(probe);

        let (io, master_key): (Box<dyn PageIo>, Option<MasterKey>) = if first_word
            == CRYPTO_MAGIC
        {
            let enc = options.encryption.as_ref().ok_or(GaldrError::InvalidPassword)?;
            let mut buf = [0u8; CRYPTO_HEADER_SIZE];
            File::open(path)?.read_exact(&mut buf)?;
            let header = CryptoHeader::deserialize(&buf)?;
            if header.page_size < MIN_PAGE_SIZE {
                return Err(GaldrError::Corruption(format!(
                    "crypto header page size {} below minimum",
                    header.page_size
                )));
            }
            let key = kdf::derive_key(enc.password.as_bytes(), &header.salt, header.iterations);
            let io = EncryptedPageIo::open(path, header.page_size as usize, PageCrypto::new(&key))?;
            (Box::new(io), Some(key))
        } else if first_word == DB_MAGIC {
            let mut buf = [0u8; 12];
            File::open(path)?.read_exact(&mut buf)?;
            let page_size = u32::from_le_bytes(buf[8..12].try_into().unwrap());
            if page_size < MIN_PAGE_SIZE || page_size > 32768 || !page_size.is_power_of_two() {
                return Err(GaldrError::Corruption(format!(
                    "header page size {} out of range",
                    page_size
                )));
            }
            let io: Box<dyn PageIo> = if options.use_mmap {
                Box::new(MmapPageIo::open(path, page_size as usize)?)
            } else {
                Box::new(FilePageIo::open(path, page_size as usize)?)
            };
            (io, None)
        } else {
            return Err(GaldrError::Corruption("bad database magic".into()));
        };

        // Page 0 is the password oracle: a wrong key must fail with
        // InvalidPassword here, before recovery can touch the WAL.
        {
            let mut oracle = vec![0u8; io.page_size()];
            io.read_page(0, &mut oracle)?;
        }

        // Replay committed WAL frames before the pager reads anything.
        if wal_path.exists() {
            recovery::replay(
                io.as_ref(),
                &wal_path,
                master_key.as_ref().map(PageCrypto::new),
            )?;
            truncate_wal_durably(&wal_path)?;
        }

        let pager =
            PageManager::open(io, options.expansion_page_count, options.cache_pages)?;
        let catalog = CollectionsCatalog::load(&pager)?;
        let wal = if options.use_wal {
            Some(WalWriter::create(
                &wal_path,
                master_key.as_ref().map(PageCrypto::new),
            )?)
        } else {
            None
        };

        info!(
            "opened database at {} ({} collections)",
            path.display(),
            catalog.len()
        );
        Ok(Engine {
            db_path: path.to_path_buf(),
            options,
            pager,
            catalog,
            txns: TransactionManager::new(),
            wal,
            master_key,
            poisoned: None,
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn options(&self) -> &DbOptions {
        &self.options
    }

    pub fn check_usable(&self) -> Result<()> {
        match &self.poisoned {
            Some(reason) => Err(GaldrError::Poisoned(reason.clone())),
            None => Ok(()),
        }
    }

    // --- Transactions ---

    pub fn begin(&mut self, mode: TxMode) -> Result<TxState> {
        self.check_usable()?;
        Ok(self.txns.begin(mode))
    }

    pub fn rollback(&mut self, tx: &mut TxState) {
        if tx.is_active() {
            tx.status = crate::tx::transaction::TxStatus::Aborted;
            tx.write_set.clear();
            self.txns.release(tx);
        }
    }

    pub fn commit(&mut self, tx: &mut TxState) -> Result<()> {
        if !tx.is_active() {
            return Err(GaldrError::TransactionEnded);
        }
        self.check_usable()?;

        if tx.write_set.is_empty() {
            tx.status = crate::tx::transaction::TxStatus::Committed;
            self.txns.release(tx);
            return Ok(());
        }

        if let Err(e) = self.txns.validate(tx) {
            tx.status = crate::tx::transaction::TxStatus::Aborted;
            self.txns.release(tx);
            return Err(e);
        }
        if let Err(e) = self.check_unique(tx) {
            tx.status = crate::tx::transaction::TxStatus::Aborted;
            self.txns.release(tx);
            return Err(e);
        }

        let txn_id = self.txns.assign_txn_id();
        match self.apply_and_log(tx, txn_id) {
            Ok(changes) => {
                self.txns.publish(txn_id, changes);
                tx.status = crate::tx::transaction::TxStatus::Committed;
                self.txns.release(tx);
                self.catalog.clear_dirty();
                self.maybe_auto_checkpoint();
                Ok(())
            }
            Err(e) => {
                tx.status = crate::tx::transaction::TxStatus::Aborted;
                self.txns.release(tx);
                self.poisoned = Some(format!("commit apply failed: {}", e));
                Err(e)
            }
        }
    }

    fn apply_and_log(
        &mut self,
        tx: &TxState,
        txn_id: u64,
    ) -> Result<Vec<(DocKey, Option<Vec<u8>>)>> {
        let mut store = TxPageStore::new(&mut self.pager);
        let changes = match apply_ops(&mut store, &mut self.catalog, tx) {
            Ok(changes) => changes,
            Err(e) => {
                store.abort();
                return Err(e);
            }
        };

        if self.catalog.is_dirty() {
            match self.catalog.write_to(&mut store) {
                Ok((start, count)) => store.pager().set_catalog_region(start, count),
                Err(e) => {
                    store.abort();
                    return Err(e);
                }
            }
        }

        let meta = store.pager().take_meta_images();
        let (mut pages, _allocated, _freed) = store.into_parts();
        pages.extend(meta);

        self.log_pages(txn_id, pages)?;
        Ok(changes)
    }

    /// Make page images durable: WAL frames + commit record + fsync, then
    /// the overlay; or direct write-through without a WAL.
    fn log_pages(&mut self, txn_id: u64, pages: Vec<Page>) -> Result<()> {
        match self.wal.as_mut() {
            Some(wal) => {
                let salt = wal.salt();
                for (i, page) in pages.iter().enumerate() {
                    wal.append(&WalRecord::PageImage {
                        txn_id,
                        page_id: page.id(),
                        frame_index: i as u32,
                        salt,
                        data: page.data().to_vec(),
                    })?;
                }
                wal.append(&WalRecord::Commit { txn_id, salt })?;
                wal.sync()?;
                self.pager.apply_committed(pages);
            }
            None => {
                for page in &pages {
                    self.pager.write_direct(page)?;
                }
                self.pager.flush()?;
            }
        }
        Ok(())
    }

    fn maybe_auto_checkpoint(&mut self) {
        let due = self.options.auto_checkpoint
            && self
                .wal
                .as_ref()
                .map(|w| w.size_bytes() > self.options.wal_autocheckpoint_threshold_bytes)
                .unwrap_or(false);
        if due {
            if let Err(e) = self.checkpoint() {
                warn!("auto-checkpoint failed, keeping WAL: {}", e);
            }
        }
    }

    pub fn checkpoint(&mut self) -> Result<usize> {
        self.check_usable()?;
        let pages = self.pager.checkpoint()?;
        if let Some(wal) = self.wal.as_mut() {
            wal.truncate()?;
        }
        Ok(pages)
    }

    // --- Reads ---

    /// Snapshot read; runs on a shared engine reference so readers
    /// overlap, reaching pages through per-page latches only.
    pub fn get_visible(
        &self,
        mut tx: Option<&mut TxState>,
        collection: &str,
        id: i64,
    ) -> Result<Option<Vec<u8>>> {
        self.check_usable()?;
        let key: DocKey = (collection.to_string(), id);

        if let Some(tx) = tx.as_deref_mut() {
            if !tx.is_active() {
                return Err(GaldrError::TransactionEnded);
            }
            match tx.read_own(&key) {
                Some(None) => return Ok(None),
                Some(Some(payload)) => return Ok(Some(payload.clone())),
                None => {}
            }
            if let Some(cached) = tx.read_cache.get(&key) {
                return Ok(cached.clone());
            }
        }

        let snapshot = tx
            .as_deref()
            .map(|t| t.snapshot_id)
            .unwrap_or(self.txns.last_committed());

        let result = match self.txns.visible(&key, snapshot) {
            Visibility::Current => match self.catalog.get(collection) {
                None => None,
                Some(def) => {
                    let mut store = ReadPager::new(&self.pager);
                    let primary = PrimaryIndex::open(def.primary_root);
                    match primary.search(&mut store, id)? {
                        Some(loc) => Some(data_page::read_document(&mut store, loc)?),
                        None => None,
                    }
                }
            },
            Visibility::Payload(payload) => payload,
        };

        if let Some(tx) = tx {
            tx.read_cache.insert(key, result.clone());
        }
        Ok(result)
    }

    // --- Staging ---

    pub fn stage_insert(
        &mut self,
        tx: &mut TxState,
        collection: &str,
        doc: &mut Document,
        hint: Option<&SchemaHint>,
    ) -> Result<i64> {
        tx.ensure_writable()?;
        self.check_usable()?;
        self.ensure_collection_internal(collection, hint)?;

        let id = if doc.id() == 0 {
            let def = self
                .catalog
                .get_mut(collection)
                .ok_or_else(|| GaldrError::Corruption("collection vanished".into()))?;
            let id = def.next_id;
            def.next_id += 1;
            id
        } else {
            let id = doc.id();
            if id < 1 {
                return Err(GaldrError::InvalidArgument(
                    "document id must be positive".into(),
                ));
            }
            let key: DocKey = (collection.to_string(), id);
            let deleted_by_self = matches!(
                tx.write_set.get(&key),
                Some(op) if op.kind == WriteKind::Delete
            );
            if !deleted_by_self {
                let def = self
                    .catalog
                    .get(collection)
                    .ok_or_else(|| GaldrError::Corruption("collection vanished".into()))?;
                let primary = PrimaryIndex::open(def.primary_root);
                if primary.search(&mut self.pager, id)?.is_some() {
                    return Err(GaldrError::InvalidArgument(format!(
                        "insert would overwrite live document {}:{}",
                        collection, id
                    )));
                }
            }
            let def = self
                .catalog
                .get_mut(collection)
                .ok_or_else(|| GaldrError::Corruption("collection vanished".into()))?;
            if id >= def.next_id {
                def.next_id = id + 1;
            }
            id
        };

        doc.set_id(id);
        let key: DocKey = (collection.to_string(), id);
        let base = self.txns.current_version(&key);
        if base > tx.snapshot_id {
            return Err(GaldrError::WriteConflict {
                collection: collection.to_string(),
                id,
            });
        }

        // Surface bad index keys (NUL strings, oversize) at staging time.
        if let Some(def) = self.catalog.get(collection) {
            for index in &def.indexes {
                index_key_for(doc, index)?;
            }
        }

        tx.stage_insert(key, doc.encode(), base)?;
        Ok(id)
    }

    pub fn stage_replace(
        &self,
        tx: &mut TxState,
        collection: &str,
        doc: &Document,
    ) -> Result<bool> {
        tx.ensure_writable()?;
        self.check_usable()?;
        let id = doc.id();
        if id < 1 {
            return Ok(false);
        }
        if self.get_visible(Some(tx), collection, id)?.is_none() {
            return Ok(false);
        }

        let key: DocKey = (collection.to_string(), id);
        let base = self.txns.current_version(&key);
        if base > tx.snapshot_id {
            return Err(GaldrError::WriteConflict {
                collection: collection.to_string(),
                id,
            });
        }
        if let Some(def) = self.catalog.get(collection) {
            for index in &def.indexes {
                index_key_for(doc, index)?;
            }
        }
        tx.stage_replace(key, doc.encode(), base);
        Ok(true)
    }

    pub fn stage_delete(&self, tx: &mut TxState, collection: &str, id: i64) -> Result<bool> {
        tx.ensure_writable()?;
        self.check_usable()?;
        if id < 1 {
            return Ok(false);
        }
        if self.get_visible(Some(tx), collection, id)?.is_none() {
            return Ok(false);
        }
        let key: DocKey = (collection.to_string(), id);
        let base = self.txns.current_version(&key);
        if base > tx.snapshot_id {
            return Err(GaldrError::WriteConflict {
                collection: collection.to_string(),
                id,
            });
        }
        tx.stage_delete(key, base);
        Ok(true)
    }

    // --- Unique constraints ---

    fn check_unique(&mut self, tx: &TxState) -> Result<()> {
        let mut staged: HashMap<(String, String, Vec<u8>), i64> = HashMap::new();

        for (key, op) in &tx.write_set {
            if op.kind == WriteKind::Delete {
                continue;
            }
            let (collection, id) = key;
            let Some(def) = self.catalog.get(collection) else {
                continue;
            };
            let payload = op
                .payload
                .as_ref()
                .ok_or_else(|| GaldrError::Corruption("write op without payload".into()))?;
            let doc = Document::decode(payload)?;

            for index in def.indexes.iter().filter(|i| i.unique) {
                let (encoded, has_null) = index_key_for(&doc, index)?;
                if has_null {
                    continue;
                }

                let staged_key = (collection.clone(), index.name.clone(), encoded.clone());
                if let Some(&other) = staged.get(&staged_key) {
                    if other != *id {
                        return Err(GaldrError::UniqueViolation {
                            index: index.name.clone(),
                        });
                    }
                }
                staged.insert(staged_key, *id);

                let sec = SecondaryIndex::open(index.root, index.avg_key_size(), true);
                for holder in sec.unique_check(&mut self.pager, &encoded)? {
                    if holder == *id {
                        continue;
                    }
                    match tx.write_set.get(&(collection.clone(), holder)) {
                        Some(other_op) if other_op.kind == WriteKind::Delete => continue,
                        Some(other_op) => {
                            // The holder is rewritten in this transaction;
                            // the key is free if its new value moved away.
                            let other_payload = other_op.payload.as_ref().ok_or_else(|| {
                                GaldrError::Corruption("write op without payload".into())
                            })?;
                            let other_doc = Document::decode(other_payload)?;
                            let (other_encoded, other_null) =
                                index_key_for(&other_doc, index)?;
                            if other_null || other_encoded != encoded {
                                continue;
                            }
                            return Err(GaldrError::UniqueViolation {
                                index: index.name.clone(),
                            });
                        }
                        None => {
                            return Err(GaldrError::UniqueViolation {
                                index: index.name.clone(),
                            })
                        }
                    }
                }
            }
        }
        Ok(())
    }

    // --- Schema operations ---

    pub fn ensure_collection_internal(
        &mut self,
        name: &str,
        hint: Option<&SchemaHint>,
    ) -> Result<()> {
        if self.catalog.get(name).is_some() {
            return Ok(());
        }
        if name.is_empty() {
            return Err(GaldrError::InvalidArgument("empty collection name".into()));
        }

        let txn_id = self.txns.assign_txn_id();
        let mut store = TxPageStore::new(&mut self.pager);
        let built = build_collection(&mut store, name, hint);
        let def = match built {
            Ok(def) => def,
            Err(e) => {
                store.abort();
                return Err(e);
            }
        };
        self.catalog.insert(def);
        let region = match self.catalog.write_to(&mut store) {
            Ok(region) => region,
            Err(e) => {
                store.abort();
                self.catalog.remove(name);
                return Err(e);
            }
        };
        store.pager().set_catalog_region(region.0, region.1);
        let meta = store.pager().take_meta_images();
        let (mut pages, _, _) = store.into_parts();
        pages.extend(meta);

        if let Err(e) = self.log_pages(txn_id, pages) {
            self.poisoned = Some(format!("metadata commit failed: {}", e));
            return Err(e);
        }
        self.txns.publish(txn_id, vec![]);
        self.catalog.clear_dirty();
        Ok(())
    }

    pub fn ensure_index(
        &mut self,
        collection: &str,
        fields: Vec<String>,
        unique: bool,
    ) -> Result<bool> {
        self.check_usable()?;
        if fields.is_empty() {
            return Err(GaldrError::InvalidArgument("index needs fields".into()));
        }
        let name = IndexDef::name_for(&fields);
        let Some(def) = self.catalog.get(collection).cloned() else {
            return Err(GaldrError::InvalidArgument(format!(
                "unknown collection '{}'",
                collection
            )));
        };
        if def.index(&name).is_some() {
            return Ok(false);
        }

        let txn_id = self.txns.assign_txn_id();
        let mut store = TxPageStore::new(&mut self.pager);
        let built = backfill_index(&mut store, &def, fields.clone(), unique);
        let index_def = match built {
            Ok(index_def) => index_def,
            Err(e) => {
                store.abort();
                return Err(e);
            }
        };
        self.catalog
            .get_mut(collection)
            .ok_or_else(|| GaldrError::Corruption("collection vanished".into()))?
            .indexes
            .push(index_def);
        let region = match self.catalog.write_to(&mut store) {
            Ok(region) => region,
            Err(e) => {
                store.abort();
                return Err(e);
            }
        };
        store.pager().set_catalog_region(region.0, region.1);
        let meta = store.pager().take_meta_images();
        let (mut pages, _, _) = store.into_parts();
        pages.extend(meta);

        if let Err(e) = self.log_pages(txn_id, pages) {
            self.poisoned = Some(format!("metadata commit failed: {}", e));
            return Err(e);
        }
        self.txns.publish(txn_id, vec![]);
        self.catalog.clear_dirty();
        Ok(true)
    }

    /// Drop an index by name or by its single field.
    pub fn drop_index(&mut self, collection: &str, index: &str) -> Result<bool> {
        self.check_usable()?;
        let Some(def) = self.catalog.get(collection) else {
            return Ok(false);
        };
        let Some(position) = def
            .indexes
            .iter()
            .position(|i| i.name == index || (i.fields.len() == 1 && i.fields[0] == index))
        else {
            return Ok(false);
        };
        let dropped = def.indexes[position].clone();

        let txn_id = self.txns.assign_txn_id();
        let mut store = TxPageStore::new(&mut self.pager);
        let sec = SecondaryIndex::open(dropped.root, dropped.avg_key_size(), dropped.unique);
        let freed = match sec.collect_pages(&mut store) {
            Ok(pages) => pages,
            Err(e) => {
                store.abort();
                return Err(e);
            }
        };
        for page in freed {
            if let Err(e) = store.free_page(page) {
                store.abort();
                return Err(e);
            }
        }
        self.catalog
            .get_mut(collection)
            .ok_or_else(|| GaldrError::Corruption("collection vanished".into()))?
            .indexes
            .remove(position);
        let region = match self.catalog.write_to(&mut store) {
            Ok(region) => region,
            Err(e) => {
                store.abort();
                return Err(e);
            }
        };
        store.pager().set_catalog_region(region.0, region.1);
        let meta = store.pager().take_meta_images();
        let (mut pages, _, _) = store.into_parts();
        pages.extend(meta);

        if let Err(e) = self.log_pages(txn_id, pages) {
            self.poisoned = Some(format!("metadata commit failed: {}", e));
            return Err(e);
        }
        self.txns.publish(txn_id, vec![]);
        self.catalog.clear_dirty();
        Ok(true)
    }

    pub fn get_indexes(&self, collection: &str) -> Vec<IndexInfo> {
        self.catalog
            .get(collection)
            .map(|def| {
                def.indexes
                    .iter()
                    .map(|i| IndexInfo {
                        name: i.name.clone(),
                        fields: i.fields.clone(),
                        unique: i.unique,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn collection_names(&self) -> Vec<String> {
        self.catalog.names()
    }

    pub fn get_collection_info(&self, collection: &str) -> Result<Option<CollectionInfo>> {
        self.check_usable()?;
        let Some(def) = self.catalog.get(collection).cloned() else {
            return Ok(None);
        };
        let mut store = ReadPager::new(&self.pager);
        let primary = PrimaryIndex::open(def.primary_root);
        let count = primary.all_entries(&mut store)?.len() as u64;
        Ok(Some(CollectionInfo {
            name: def.name.clone(),
            document_count: count,
            next_id: def.next_id,
            indexes: def
                .indexes
                .iter()
                .map(|i| IndexInfo {
                    name: i.name.clone(),
                    fields: i.fields.clone(),
                    unique: i.unique,
                })
                .collect(),
        }))
    }

    // --- Queries ---

    pub fn explain(&self, collection: &str, params: &QueryParams) -> Result<planner::QueryExplanation> {
        self.check_usable()?;
        let def = self.catalog.get(collection);
        Ok(planner::plan(def, &params.filters).explanation)
    }

    pub fn query_documents(
        &self,
        tx: Option<&TxState>,
        collection: &str,
        params: &QueryParams,
    ) -> Result<Vec<Document>> {
        self.check_usable()?;
        if let Some(tx) = tx {
            if !tx.is_active() {
                return Err(GaldrError::TransactionEnded);
            }
        }
        let def = self.catalog.get(collection).cloned();
        let snapshot = tx
            .map(|t| t.snapshot_id)
            .unwrap_or(self.txns.last_committed());
        let plan = planner::plan(def.as_ref(), &params.filters);

        let candidates = self.scan_candidates(def.as_ref(), &plan)?;

        let mut seen: HashSet<i64> = HashSet::new();
        let mut docs: Vec<Document> = Vec::new();

        for (id, loc) in candidates {
            if !seen.insert(id) {
                continue;
            }
            let key: DocKey = (collection.to_string(), id);

            if let Some(t) = tx {
                match t.read_own(&key) {
                    Some(None) => continue,
                    Some(Some(payload)) => {
                        let doc = Document::decode(payload)?;
                        if exec::passes_all(&doc, &params.filters) {
                            docs.push(doc);
                        }
                        continue;
                    }
                    None => {}
                }
            }

            match self.txns.visible(&key, snapshot) {
                Visibility::Current => {
                    let mut store = ReadPager::new(&self.pager);
                    let payload = data_page::read_document(&mut store, loc)?;
                    let doc = Document::decode(&payload)?;
                    if exec::passes(&doc, &params.filters, &plan.residual) {
                        docs.push(doc);
                    }
                }
                Visibility::Payload(Some(payload)) => {
                    // Snapshot-era payload; the index no longer vouches
                    // for it, so the full predicate list applies.
                    let doc = Document::decode(&payload)?;
                    if exec::passes_all(&doc, &params.filters) {
                        docs.push(doc);
                    }
                }
                Visibility::Payload(None) => {}
            }
        }

        // Documents visible at this snapshot but modified or deleted by
        // later commits never appear in the committed scan; recover them
        // from the version store.
        for id in self.txns.modified_after(collection, snapshot) {
            if !seen.insert(id) {
                continue;
            }
            let key: DocKey = (collection.to_string(), id);
            if let Some(t) = tx {
                match t.read_own(&key) {
                    Some(None) => continue,
                    Some(Some(payload)) => {
                        let doc = Document::decode(payload)?;
                        if exec::passes_all(&doc, &params.filters) {
                            docs.push(doc);
                        }
                        continue;
                    }
                    None => {}
                }
            }
            if let Visibility::Payload(Some(payload)) = self.txns.visible(&key, snapshot) {
                let doc = Document::decode(&payload)?;
                if exec::passes_all(&doc, &params.filters) {
                    docs.push(doc);
                }
            }
        }

        // Finally, the transaction's own pending inserts and replaces the
        // scan could not have yielded.
        if let Some(t) = tx {
            for (key, op) in &t.write_set {
                if key.0 != collection || seen.contains(&key.1) {
                    continue;
                }
                if op.kind == WriteKind::Delete {
                    continue;
                }
                if let Some(payload) = &op.payload {
                    let doc = Document::decode(payload)?;
                    if exec::passes_all(&doc, &params.filters) {
                        docs.push(doc);
                    }
                }
            }
        }

        exec::sort_documents(&mut docs, params.order.as_ref());
        Ok(exec::apply_window(docs, params.skip, params.limit))
    }

    fn scan_candidates(
        &self,
        def: Option<&CollectionDef>,
        plan: &Plan,
    ) -> Result<Vec<(i64, DocLocation)>> {
        let Some(def) = def else {
            return Ok(Vec::new());
        };
        let mut store = ReadPager::new(&self.pager);
        match &plan.spec {
            ScanSpec::Primary { lo, hi } => {
                PrimaryIndex::open(def.primary_root).range(&mut store, *lo, *hi)
            }
            ScanSpec::Full => PrimaryIndex::open(def.primary_root).all_entries(&mut store),
            ScanSpec::Secondary {
                index_name,
                eq_values,
                trailing,
            } => {
                let index = def.index(index_name).ok_or_else(|| {
                    GaldrError::Corruption(format!("planned index '{}' missing", index_name))
                })?;
                let sec = SecondaryIndex::open(index.root, index.avg_key_size(), index.unique);
                let base = encode_compound(eq_values)?;

                let (lo_key, hi_key): (Option<(Vec<u8>, bool)>, Option<(Vec<u8>, bool)>) =
                    match trailing {
                        None => (Some((base.clone(), true)), Some((base, true))),
                        Some(TrailingBound::Prefix(prefix)) => {
                            let mut ext = base;
                            ext.extend(encode_string_prefix(prefix)?);
                            (Some((ext.clone(), true)), Some((ext, true)))
                        }
                        Some(TrailingBound::Range { lo, hi }) => {
                            let lo_key = match lo {
                                Some((value, inclusive)) => {
                                    let mut k = base.clone();
                                    k.extend(encode_value(value)?);
                                    Some((k, *inclusive))
                                }
                                None => Some((base.clone(), true)),
                            };
                            let hi_key = match hi {
                                Some((value, inclusive)) => {
                                    let mut k = base.clone();
                                    k.extend(encode_value(value)?);
                                    Some((k, *inclusive))
                                }
                                None => Some((base, true)),
                            };
                            (lo_key, hi_key)
                        }
                    };

                let hits = sec.range_scan(
                    &mut store,
                    lo_key.as_ref().map(|(k, inc)| (k.as_slice(), *inc)),
                    hi_key.as_ref().map(|(k, inc)| (k.as_slice(), *inc)),
                )?;
                Ok(hits.into_iter().map(|(_, id, loc)| (id, loc)).collect())
            }
        }
    }

    // --- Maintenance ---

    /// Copy every live document into a fresh file at `target`, rebuilding
    /// all indexes and dropping dead space.
    pub fn compact_to(&mut self, target: &Path) -> Result<CompactResult> {
        self.check_usable()?;
        if target.exists() {
            return Err(GaldrError::InvalidArgument(format!(
                "compaction target {} already exists",
                target.display()
            )));
        }

        let mut target_options = self.options.clone();
        target_options.use_wal = false;
        let mut target_engine = Engine::create(target, target_options)?;

        let names = self.catalog.names();
        let mut documents_copied = 0u64;
        for name in &names {
            let def = self
                .catalog
                .get(name)
                .cloned()
                .ok_or_else(|| GaldrError::Corruption("collection vanished".into()))?;
            let hint = SchemaHint {
                fields: def.fields.clone(),
                indexes: def
                    .indexes
                    .iter()
                    .map(|i| IndexHint {
                        fields: i.fields.clone(),
                        unique: i.unique,
                    })
                    .collect(),
            };
            target_engine.ensure_collection_internal(name, Some(&hint))?;

            let primary = PrimaryIndex::open(def.primary_root);
            let entries = primary.all_entries(&mut self.pager)?;
            let mut tx = target_engine.begin(TxMode::ReadWrite)?;
            for (_, loc) in entries {
                let payload = data_page::read_document(&mut self.pager, loc)?;
                let mut doc = Document::decode(&payload)?;
                target_engine.stage_insert(&mut tx, name, &mut doc, None)?;
                documents_copied += 1;
            }
            target_engine.commit(&mut tx)?;

            // Preserve the exact id watermark.
            if let Some(target_def) = target_engine.catalog.get_mut(name) {
                target_def.next_id = def.next_id;
            }
        }
        target_engine.persist_catalog()?;
        target_engine.pager.flush()?;
        drop(target_engine);

        let source_size = std::fs::metadata(&self.db_path)?.len();
        let target_file_size = std::fs::metadata(target)?.len();
        info!(
            "compacted {} -> {} ({} -> {} bytes)",
            self.db_path.display(),
            target.display(),
            source_size,
            target_file_size
        );
        Ok(CompactResult {
            collections: names.len(),
            documents_copied,
            target_file_size,
            bytes_saved: source_size.saturating_sub(target_file_size),
        })
    }

    fn persist_catalog(&mut self) -> Result<()> {
        if !self.catalog.is_dirty() {
            return Ok(());
        }
        let txn_id = self.txns.assign_txn_id();
        let mut store = TxPageStore::new(&mut self.pager);
        let region = match self.catalog.write_to(&mut store) {
            Ok(region) => region,
            Err(e) => {
                store.abort();
                return Err(e);
            }
        };
        store.pager().set_catalog_region(region.0, region.1);
        let meta = store.pager().take_meta_images();
        let (mut pages, _, _) = store.into_parts();
        pages.extend(meta);
        if let Err(e) = self.log_pages(txn_id, pages) {
            self.poisoned = Some(format!("metadata commit failed: {}", e));
            return Err(e);
        }
        self.txns.publish(txn_id, vec![]);
        self.catalog.clear_dirty();
        Ok(())
    }

}

fn build_collection(
    store: &mut TxPageStore<'_>,
    name: &str,
    hint: Option<&SchemaHint>,
) -> Result<CollectionDef> {
    let primary = PrimaryIndex::create(store)?;
    let mut indexes = Vec::new();
    let mut fields = Vec::new();
    if let Some(hint) = hint {
        fields = hint.fields.clone();
        for index_hint in &hint.indexes {
            let index_name = IndexDef::name_for(&index_hint.fields);
            if indexes.iter().any(|i: &IndexDef| i.name == index_name) {
                continue;
            }
            let avg = 16 * index_hint.fields.len().max(1);
            let sec = SecondaryIndex::create(store, avg, index_hint.unique)?;
            indexes.push(IndexDef {
                name: index_name,
                fields: index_hint.fields.clone(),
                unique: index_hint.unique,
                root: sec.root(),
            });
        }
    }
    Ok(CollectionDef {
        name: name.to_string(),
        primary_root: primary.root(),
        next_id: 1,
        fields,
        indexes,
    })
}

fn backfill_index(
    store: &mut TxPageStore<'_>,
    def: &CollectionDef,
    fields: Vec<String>,
    unique: bool,
) -> Result<IndexDef> {
    let name = IndexDef::name_for(&fields);
    let avg = 16 * fields.len().max(1);
    let mut sec = SecondaryIndex::create(store, avg, unique)?;
    let mut index_def = IndexDef {
        name: name.clone(),
        fields,
        unique,
        root: sec.root(),
    };

    let primary = PrimaryIndex::open(def.primary_root);
    let entries = primary.all_entries(store)?;
    let mut seen_keys: HashSet<Vec<u8>> = HashSet::new();
    for (id, loc) in entries {
        let payload = data_page::read_document(store, loc)?;
        let doc = Document::decode(&payload)?;
        let (encoded, has_null) = index_key_for(&doc, &index_def)?;
        if unique && !has_null && !seen_keys.insert(encoded.clone()) {
            return Err(GaldrError::UniqueViolation { index: name });
        }
        sec.insert_entry(store, &encoded, id, loc)?;
    }
    index_def.root = sec.root();
    Ok(index_def)
}

fn apply_ops(
    store: &mut TxPageStore<'_>,
    catalog: &mut CollectionsCatalog,
    tx: &TxState,
) -> Result<Vec<(DocKey, Option<Vec<u8>>)>> {
    let mut changes: Vec<(DocKey, Option<Vec<u8>>)> = Vec::new();
    let mut current: Option<(String, CollectionDef, PrimaryIndex, Vec<SecondaryIndex>)> = None;

    for (key, op) in &tx.write_set {
        let (collection, id) = key;

        let switch = current
            .as_ref()
            .map(|(name, _, _, _)| name != collection)
            .unwrap_or(true);
        if switch {
            if let Some(previous) = current.take() {
                write_back_roots(catalog, previous)?;
            }
            let def = catalog
                .get(collection)
                .cloned()
                .ok_or_else(|| GaldrError::Corruption("collection vanished".into()))?;
            let primary = PrimaryIndex::open(def.primary_root);
            let secondaries = def
                .indexes
                .iter()
                .map(|i| SecondaryIndex::open(i.root, i.avg_key_size(), i.unique))
                .collect();
            current = Some((collection.clone(), def, primary, secondaries));
        }
        let (_, def, primary, secondaries) = current.as_mut().unwrap();

        match op.kind {
            WriteKind::Insert => {
                let payload = op
                    .payload
                    .as_ref()
                    .ok_or_else(|| GaldrError::Corruption("insert without payload".into()))?;
                let doc = Document::decode(payload)?;
                let loc = data_page::store_document(store, primary.root(), payload)?;
                if primary.insert(store, *id, loc)?.is_some() {
                    return Err(GaldrError::Corruption(format!(
                        "duplicate id {} surfaced during apply",
                        id
                    )));
                }
                for (sec, index) in secondaries.iter_mut().zip(def.indexes.iter()) {
                    let (encoded, _) = index_key_for(&doc, index)?;
                    sec.insert_entry(store, &encoded, *id, loc)?;
                }
                changes.push((key.clone(), None));
            }
            WriteKind::Replace => {
                let payload = op
                    .payload
                    .as_ref()
                    .ok_or_else(|| GaldrError::Corruption("replace without payload".into()))?;
                let new_doc = Document::decode(payload)?;
                let old_loc = primary.search(store, *id)?.ok_or_else(|| {
                    GaldrError::Corruption(format!("replace target {} missing", id))
                })?;
                let old_payload = data_page::read_document(store, old_loc)?;
                let old_doc = Document::decode(&old_payload)?;

                let new_loc = match data_page::replace_document(store, old_loc, payload)? {
                    ReplaceOutcome::InPlace => old_loc,
                    ReplaceOutcome::Relocated(loc) => {
                        primary.insert(store, *id, loc)?;
                        loc
                    }
                };

                for (sec, index) in secondaries.iter_mut().zip(def.indexes.iter()) {
                    let (old_encoded, _) = index_key_for(&old_doc, index)?;
                    let (new_encoded, _) = index_key_for(&new_doc, index)?;
                    if old_encoded != new_encoded || new_loc != old_loc {
                        sec.remove_entry(store, &old_encoded, *id)?;
                        sec.insert_entry(store, &new_encoded, *id, new_loc)?;
                    }
                }
                changes.push((key.clone(), Some(old_payload)));
            }
            WriteKind::Delete => {
                let old_loc = primary.search(store, *id)?.ok_or_else(|| {
                    GaldrError::Corruption(format!("delete target {} missing", id))
                })?;
                let old_payload = data_page::read_document(store, old_loc)?;
                let old_doc = Document::decode(&old_payload)?;

                primary.delete(store, *id)?;
                for (sec, index) in secondaries.iter_mut().zip(def.indexes.iter()) {
                    let (encoded, _) = index_key_for(&old_doc, index)?;
                    sec.remove_entry(store, &encoded, *id)?;
                }
                data_page::delete_document(store, old_loc)?;
                changes.push((key.clone(), Some(old_payload)));
            }
        }
    }

    if let Some(previous) = current.take() {
        write_back_roots(catalog, previous)?;
    }
    Ok(changes)
}

fn write_back_roots(
    catalog: &mut CollectionsCatalog,
    state: (String, CollectionDef, PrimaryIndex, Vec<SecondaryIndex>),
) -> Result<()> {
    let (name, def, primary, secondaries) = state;
    let roots_changed = def.primary_root != primary.root()
        || def
            .indexes
            .iter()
            .zip(secondaries.iter())
            .any(|(index, sec)| index.root != sec.root());
    if !roots_changed {
        return Ok(());
    }
    let stored = catalog
        .get_mut(&name)
        .ok_or_else(|| GaldrError::Corruption("collection vanished".into()))?;
    stored.primary_root = primary.root();
    for (index, sec) in stored.indexes.iter_mut().zip(secondaries.iter()) {
        index.root = sec.root();
    }
    Ok(())
}
