//! Public façade: `Db`, `Transaction`, and the fluent query/update
//! builders.
//!
//! `Db` is cloneable and thread-safe. Reads acquire the engine lock in
//! shared mode, so any number of reader threads overlap and reach pages
//! through brief per-page latches; the commit phase, checkpoint and
//! compaction run in a writer-exclusive section serialized by the writer
//! mutex. No lock is ever held across user code. Implicit operations
//! open a read-write transaction and commit it on success; explicit
//! transactions are obtained from `begin_transaction` and roll back on
//! drop unless committed.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::concurrency::ProcessLock;
use crate::config::DbOptions;
use crate::document::{Document, ID_FIELD};
use crate::engine::{
    CollectionInfo, CompactResult, Engine, IndexInfo, SchemaHint,
};
use crate::error::{GaldrError, Result};
use crate::query::exec::QueryParams;
use crate::query::filter::{Filter, FilterOp, OrderBy, SortOrder};
use crate::query::planner::QueryExplanation;
use crate::record::Record;
use crate::tx::transaction::{TxMode, TxState};
use crate::types::Value;

struct DbShared {
    /// Readers share; staging, commit and schema changes take it
    /// exclusively for their in-memory apply.
    engine: RwLock<Engine>,
    /// Serializes the commit phase and checkpoint/compaction.
    writer: Mutex<()>,
    _process_lock: ProcessLock,
}

#[derive(Clone)]
pub struct Db {
    shared: Arc<DbShared>,
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db").finish_non_exhaustive()
    }
}

impl Db {
    pub fn create(path: impl AsRef<Path>, options: DbOptions) -> Result<Db> {
        let path = path.as_ref();
        let process_lock = ProcessLock::acquire(path)?;
        let engine = Engine::create(path, options)?;
        Ok(Db {
            shared: Arc::new(DbShared {
                engine: RwLock::new(engine),
                writer: Mutex::new(()),
                _process_lock: process_lock,
            }),
        })
    }

    pub fn open(path: impl AsRef<Path>, options: DbOptions) -> Result<Db> {
        let path = path.as_ref();
        let process_lock = ProcessLock::acquire(path)?;
        let engine = Engine::open(path, options)?;
        Ok(Db {
            shared: Arc::new(DbShared {
                engine: RwLock::new(engine),
                writer: Mutex::new(()),
                _process_lock: process_lock,
            }),
        })
    }

    /// Open, creating the file first when it does not exist.
    pub fn open_or_create(path: impl AsRef<Path>, options: DbOptions) -> Result<Db> {
        if path.as_ref().exists() {
            Db::open(path, options)
        } else {
            Db::create(path, options)
        }
    }

    pub async fn create_async(path: PathBuf, options: DbOptions) -> Result<Db> {
        tokio::task::spawn_blocking(move || Db::create(&path, options))
            .await
            .map_err(|e| GaldrError::InvalidArgument(format!("task join failed: {}", e)))?
    }

    pub async fn open_async(path: PathBuf, options: DbOptions) -> Result<Db> {
        tokio::task::spawn_blocking(move || Db::open(&path, options))
            .await
            .map_err(|e| GaldrError::InvalidArgument(format!("task join failed: {}", e)))?
    }

    fn with_write_txn<R>(
        &self,
        f: impl FnOnce(&mut Engine, &mut TxState) -> Result<R>,
    ) -> Result<R> {
        let _writer = self.shared.writer.lock();
        let mut engine = self.shared.engine.write();
        let mut tx = engine.begin(TxMode::ReadWrite)?;
        match f(&mut engine, &mut tx) {
            Ok(value) => {
                engine.commit(&mut tx)?;
                Ok(value)
            }
            Err(e) => {
                engine.rollback(&mut tx);
                Err(e)
            }
        }
    }

    // --- Typed API ---

    /// Insert a record; assigns and returns its id (also written back into
    /// the record). Creates the collection with its declared indexes on
    /// first use.
    pub fn insert<T: Record>(&self, record: &mut T) -> Result<i64> {
        let hint = SchemaHint::from_record::<T>();
        let mut doc = record.to_document();
        doc.set_id(record.id());
        let id = self.with_write_txn(|engine, tx| {
            engine.stage_insert(tx, T::collection_name(), &mut doc, Some(&hint))
        })?;
        record.set_id(id);
        Ok(id)
    }

    pub fn get_by_id<T: Record>(&self, id: i64) -> Result<Option<T>> {
        let engine = self.shared.engine.read();
        match engine.get_visible(None, T::collection_name(), id)? {
            Some(payload) => Ok(Some(T::from_document(&Document::decode(&payload)?)?)),
            None => Ok(None),
        }
    }

    pub fn replace<T: Record>(&self, record: &T) -> Result<bool> {
        let mut doc = record.to_document();
        doc.set_id(record.id());
        self.with_write_txn(|engine, tx| engine.stage_replace(tx, T::collection_name(), &doc))
    }

    pub fn delete_by_id<T: Record>(&self, id: i64) -> Result<bool> {
        self.with_write_txn(|engine, tx| engine.stage_delete(tx, T::collection_name(), id))
    }

    pub fn update_by_id<T: Record>(&self, id: i64) -> UpdateBuilder<'_> {
        UpdateBuilder::new(&self.shared, T::collection_name().to_string(), id)
    }

    // --- Dynamic API ---

    pub fn insert_dynamic(&self, collection: &str, doc: &mut Document) -> Result<i64> {
        self.with_write_txn(|engine, tx| engine.stage_insert(tx, collection, doc, None))
    }

    pub fn get_by_id_dynamic(&self, collection: &str, id: i64) -> Result<Option<Document>> {
        let engine = self.shared.engine.read();
        match engine.get_visible(None, collection, id)? {
            Some(payload) => Ok(Some(Document::decode(&payload)?)),
            None => Ok(None),
        }
    }

    pub fn replace_dynamic(&self, collection: &str, doc: &Document) -> Result<bool> {
        self.with_write_txn(|engine, tx| engine.stage_replace(tx, collection, doc))
    }

    pub fn delete_by_id_dynamic(&self, collection: &str, id: i64) -> Result<bool> {
        self.with_write_txn(|engine, tx| engine.stage_delete(tx, collection, id))
    }

    pub fn update_by_id_dynamic(&self, collection: &str, id: i64) -> UpdateBuilder<'_> {
        UpdateBuilder::new(&self.shared, collection.to_string(), id)
    }

    // --- Queries ---

    pub fn query(&self, collection: &str) -> QueryBuilder<'_> {
        QueryBuilder::new(&self.shared, None, collection.to_string())
    }

    // --- Transactions ---

    pub fn begin_transaction(&self) -> Result<Transaction> {
        let mut engine = self.shared.engine.write();
        let state = engine.begin(TxMode::ReadWrite)?;
        Ok(Transaction {
            shared: Arc::clone(&self.shared),
            state: Some(state),
        })
    }

    pub fn begin_read_only_transaction(&self) -> Result<Transaction> {
        let mut engine = self.shared.engine.write();
        let state = engine.begin(TxMode::ReadOnly)?;
        Ok(Transaction {
            shared: Arc::clone(&self.shared),
            state: Some(state),
        })
    }

    // --- Schema ---

    pub fn ensure_collection<T: Record>(&self) -> Result<()> {
        let hint = SchemaHint::from_record::<T>();
        let mut engine = self.shared.engine.write();
        engine.ensure_collection_internal(T::collection_name(), Some(&hint))
    }

    pub fn ensure_collection_dynamic(&self, collection: &str) -> Result<()> {
        let mut engine = self.shared.engine.write();
        engine.ensure_collection_internal(collection, None)
    }

    pub fn ensure_index(&self, collection: &str, fields: &[&str], unique: bool) -> Result<bool> {
        let _writer = self.shared.writer.lock();
        let mut engine = self.shared.engine.write();
        engine.ensure_index(
            collection,
            fields.iter().map(|f| f.to_string()).collect(),
            unique,
        )
    }

    pub fn get_indexes(&self, collection: &str) -> Vec<IndexInfo> {
        self.shared.engine.read().get_indexes(collection)
    }

    pub fn get_collection_info(&self, collection: &str) -> Result<Option<CollectionInfo>> {
        self.shared.engine.read().get_collection_info(collection)
    }

    pub fn collection_names(&self) -> Vec<String> {
        self.shared.engine.read().collection_names()
    }

    pub fn drop_index(&self, collection: &str, index: &str) -> Result<bool> {
        let _writer = self.shared.writer.lock();
        let mut engine = self.shared.engine.write();
        engine.drop_index(collection, index)
    }

    // --- Maintenance ---

    /// Fold the WAL into the main file and truncate it. Returns the number
    /// of pages written.
    pub fn checkpoint(&self) -> Result<usize> {
        let _writer = self.shared.writer.lock();
        self.shared.engine.write().checkpoint()
    }

    pub async fn checkpoint_async(&self) -> Result<usize> {
        let db = self.clone();
        tokio::task::spawn_blocking(move || db.checkpoint())
            .await
            .map_err(|e| GaldrError::InvalidArgument(format!("task join failed: {}", e)))?
    }

    /// Rewrite every live document into a fresh file at `target`.
    pub fn compact_to(&self, target: impl AsRef<Path>) -> Result<CompactResult> {
        let _writer = self.shared.writer.lock();
        self.shared.engine.write().compact_to(target.as_ref())
    }

    pub async fn compact_to_async(&self, target: PathBuf) -> Result<CompactResult> {
        let db = self.clone();
        tokio::task::spawn_blocking(move || db.compact_to(&target))
            .await
            .map_err(|e| GaldrError::InvalidArgument(format!("task join failed: {}", e)))?
    }
}

/// An explicit transaction. Dropping an active handle rolls back.
pub struct Transaction {
    shared: Arc<DbShared>,
    state: Option<TxState>,
}

impl Transaction {
    fn state_ref(&self) -> Result<&TxState> {
        self.state.as_ref().ok_or(GaldrError::TransactionEnded)
    }

    pub fn insert<T: Record>(&mut self, record: &mut T) -> Result<i64> {
        let hint = SchemaHint::from_record::<T>();
        let mut doc = record.to_document();
        doc.set_id(record.id());
        let id = {
            let mut engine = self.shared.engine.write();
            let state = self.state.as_mut().ok_or(GaldrError::TransactionEnded)?;
            engine.stage_insert(state, T::collection_name(), &mut doc, Some(&hint))?
        };
        record.set_id(id);
        Ok(id)
    }

    pub fn get_by_id<T: Record>(&mut self, id: i64) -> Result<Option<T>> {
        let engine = self.shared.engine.read();
        let state = self.state.as_mut().ok_or(GaldrError::TransactionEnded)?;
        match engine.get_visible(Some(state), T::collection_name(), id)? {
            Some(payload) => Ok(Some(T::from_document(&Document::decode(&payload)?)?)),
            None => Ok(None),
        }
    }

    pub fn replace<T: Record>(&mut self, record: &T) -> Result<bool> {
        let mut doc = record.to_document();
        doc.set_id(record.id());
        let engine = self.shared.engine.read();
        let state = self.state.as_mut().ok_or(GaldrError::TransactionEnded)?;
        engine.stage_replace(state, T::collection_name(), &doc)
    }

    pub fn delete_by_id<T: Record>(&mut self, id: i64) -> Result<bool> {
        let engine = self.shared.engine.read();
        let state = self.state.as_mut().ok_or(GaldrError::TransactionEnded)?;
        engine.stage_delete(state, T::collection_name(), id)
    }

    pub fn insert_dynamic(&mut self, collection: &str, doc: &mut Document) -> Result<i64> {
        let mut engine = self.shared.engine.write();
        let state = self.state.as_mut().ok_or(GaldrError::TransactionEnded)?;
        engine.stage_insert(state, collection, doc, None)
    }

    pub fn get_by_id_dynamic(&mut self, collection: &str, id: i64) -> Result<Option<Document>> {
        let engine = self.shared.engine.read();
        let state = self.state.as_mut().ok_or(GaldrError::TransactionEnded)?;
        match engine.get_visible(Some(state), collection, id)? {
            Some(payload) => Ok(Some(Document::decode(&payload)?)),
            None => Ok(None),
        }
    }

    pub fn replace_dynamic(&mut self, collection: &str, doc: &Document) -> Result<bool> {
        let engine = self.shared.engine.read();
        let state = self.state.as_mut().ok_or(GaldrError::TransactionEnded)?;
        engine.stage_replace(state, collection, doc)
    }

    pub fn delete_by_id_dynamic(&mut self, collection: &str, id: i64) -> Result<bool> {
        let engine = self.shared.engine.read();
        let state = self.state.as_mut().ok_or(GaldrError::TransactionEnded)?;
        engine.stage_delete(state, collection, id)
    }

    pub fn update_by_id<T: Record>(&mut self, id: i64) -> UpdateBuilder<'_> {
        UpdateBuilder::new_in_txn(self, T::collection_name().to_string(), id)
    }

    pub fn update_by_id_dynamic(&mut self, collection: &str, id: i64) -> UpdateBuilder<'_> {
        UpdateBuilder::new_in_txn(self, collection.to_string(), id)
    }

    pub fn query(&self, collection: &str) -> QueryBuilder<'_> {
        QueryBuilder::new(&self.shared, Some(self), collection.to_string())
    }

    pub fn commit(mut self) -> Result<()> {
        let mut state = self.state.take().ok_or(GaldrError::TransactionEnded)?;
        let _writer = self.shared.writer.lock();
        let mut engine = self.shared.engine.write();
        engine.commit(&mut state)
    }

    pub async fn commit_async(self) -> Result<()> {
        tokio::task::spawn_blocking(move || self.commit())
            .await
            .map_err(|e| GaldrError::InvalidArgument(format!("task join failed: {}", e)))?
    }

    pub fn rollback(mut self) -> Result<()> {
        let mut state = self.state.take().ok_or(GaldrError::TransactionEnded)?;
        let mut engine = self.shared.engine.write();
        engine.rollback(&mut state);
        Ok(())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if let Some(mut state) = self.state.take() {
            if state.is_active() {
                let mut engine = self.shared.engine.write();
                engine.rollback(&mut state);
            }
        }
    }
}

enum UpdateTarget<'a> {
    Implicit(&'a DbShared),
    Txn(&'a mut Transaction),
}

/// Fluent partial update: `update_by_id(id).set(...).set(...).execute()`.
/// Only the named fields change; secondary-index entries whose keys are
/// untouched are left alone by the replace path.
pub struct UpdateBuilder<'a> {
    target: UpdateTarget<'a>,
    collection: String,
    id: i64,
    sets: Vec<(String, Value)>,
}

fn apply_update(
    engine: &Engine,
    state: &mut TxState,
    collection: &str,
    id: i64,
    sets: &[(String, Value)],
) -> Result<bool> {
    let Some(payload) = engine.get_visible(Some(state), collection, id)? else {
        return Ok(false);
    };
    let mut doc = Document::decode(&payload)?;
    for (field, value) in sets {
        if field == ID_FIELD {
            return Err(GaldrError::InvalidArgument(
                "the id field cannot be updated".into(),
            ));
        }
        doc.put(field.clone(), value.clone());
    }
    engine.stage_replace(state, collection, &doc)
}

impl<'a> UpdateBuilder<'a> {
    fn new(shared: &'a DbShared, collection: String, id: i64) -> Self {
        UpdateBuilder {
            target: UpdateTarget::Implicit(shared),
            collection,
            id,
            sets: Vec::new(),
        }
    }

    fn new_in_txn(txn: &'a mut Transaction, collection: String, id: i64) -> Self {
        UpdateBuilder {
            target: UpdateTarget::Txn(txn),
            collection,
            id,
            sets: Vec::new(),
        }
    }

    pub fn set(mut self, field: impl Into<String>, value: Value) -> Self {
        self.sets.push((field.into(), value));
        self
    }

    /// Apply the staged field updates. Returns false when the id does not
    /// exist.
    pub fn execute(self) -> Result<bool> {
        if self.id < 1 {
            return Err(GaldrError::InvalidArgument(
                "update requires a positive id".into(),
            ));
        }
        if self.sets.is_empty() {
            return Err(GaldrError::InvalidArgument("update sets no fields".into()));
        }

        match self.target {
            UpdateTarget::Txn(txn) => {
                let engine = txn.shared.engine.read();
                let state = txn.state.as_mut().ok_or(GaldrError::TransactionEnded)?;
                apply_update(&engine, state, &self.collection, self.id, &self.sets)
            }
            UpdateTarget::Implicit(shared) => {
                let _writer = shared.writer.lock();
                let mut engine = shared.engine.write();
                let mut state = engine.begin(TxMode::ReadWrite)?;
                match apply_update(&engine, &mut state, &self.collection, self.id, &self.sets)
                {
                    Ok(changed) => {
                        engine.commit(&mut state)?;
                        Ok(changed)
                    }
                    Err(e) => {
                        engine.rollback(&mut state);
                        Err(e)
                    }
                }
            }
        }
    }
}

/// Fluent query builder over one collection.
pub struct QueryBuilder<'a> {
    shared: &'a DbShared,
    txn: Option<&'a Transaction>,
    collection: String,
    params: QueryParams,
}

impl<'a> QueryBuilder<'a> {
    fn new(shared: &'a DbShared, txn: Option<&'a Transaction>, collection: String) -> Self {
        QueryBuilder {
            shared,
            txn,
            collection,
            params: QueryParams::default(),
        }
    }

    pub fn r#where(mut self, field: impl Into<String>, op: FilterOp, value: Value) -> Self {
        self.params.filters.push(Filter::new(field, op, value));
        self
    }

    pub fn where_eq(self, field: impl Into<String>, value: Value) -> Self {
        self.r#where(field, FilterOp::Eq, value)
    }

    pub fn where_between(mut self, field: impl Into<String>, lo: Value, hi: Value) -> Self {
        self.params.filters.push(Filter::between(field, lo, hi));
        self
    }

    pub fn where_in(mut self, field: impl Into<String>, values: Vec<Value>) -> Self {
        self.params.filters.push(Filter::in_set(field, values));
        self
    }

    pub fn where_not_in(mut self, field: impl Into<String>, values: Vec<Value>) -> Self {
        self.params.filters.push(Filter::not_in_set(field, values));
        self
    }

    pub fn order_by(mut self, field: impl Into<String>) -> Self {
        self.params.order = Some(OrderBy {
            field: field.into(),
            order: SortOrder::Ascending,
        });
        self
    }

    pub fn order_by_descending(mut self, field: impl Into<String>) -> Self {
        self.params.order = Some(OrderBy {
            field: field.into(),
            order: SortOrder::Descending,
        });
        self
    }

    pub fn skip(mut self, n: usize) -> Self {
        self.params.skip = n;
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.params.limit = Some(n);
        self
    }

    fn run(&self) -> Result<Vec<Document>> {
        let engine = self.shared.engine.read();
        let state = match self.txn {
            Some(txn) => Some(txn.state_ref()?),
            None => None,
        };
        engine.query_documents(state, &self.collection, &self.params)
    }

    pub fn to_documents(&self) -> Result<Vec<Document>> {
        self.run()
    }

    pub fn to_list<T: Record>(&self) -> Result<Vec<T>> {
        self.run()?
            .iter()
            .map(|doc| T::from_document(doc))
            .collect()
    }

    pub fn first_or_default(&self) -> Result<Option<Document>> {
        let engine = self.shared.engine.read();
        let state = match self.txn {
            Some(txn) => Some(txn.state_ref()?),
            None => None,
        };
        let mut params = self.params.clone();
        params.limit = Some(1);
        Ok(engine
            .query_documents(state, &self.collection, &params)?
            .into_iter()
            .next())
    }

    pub fn count(&self) -> Result<usize> {
        Ok(self.run()?.len())
    }

    pub fn any(&self) -> Result<bool> {
        Ok(self.first_or_default()?.is_some())
    }

    pub fn explain(&self) -> Result<QueryExplanation> {
        let engine = self.shared.engine.read();
        engine.explain(&self.collection, &self.params)
    }
}
