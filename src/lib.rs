//! GaldrDb: embedded single-file document database.
//!
//! A paged file store with:
//! - ACID transactions (snapshot isolation + optimistic conflict checks)
//! - B+-tree primary and secondary indexes with order-preserving key
//!   encoding for range and prefix queries
//! - Page-image WAL with crash recovery and checkpointing
//! - Optional AES-256-GCM at-rest encryption (PBKDF2-derived key)
//! - Typed record API, schema-less dynamic API, and a query builder

pub mod btree;
pub mod catalog;
pub mod concurrency;
pub mod config;
pub mod crypto;
pub mod db;
pub mod document;
pub mod engine;
pub mod error;
pub mod query;
pub mod record;
pub mod storage;
pub mod tx;
pub mod types;
pub mod wal;

pub use crate::config::{DbOptions, EncryptionOptions};
pub use crate::db::{Db, QueryBuilder, Transaction, UpdateBuilder};
pub use crate::document::{Document, ID_FIELD};
pub use crate::engine::{CollectionInfo, CompactResult, IndexInfo};
pub use crate::error::{GaldrError, Result};
pub use crate::query::filter::{Filter, FilterOp, SortOrder};
pub use crate::query::planner::{QueryExplanation, ScanType};
pub use crate::record::{FieldSpec, IndexSpec, Record};
pub use crate::types::{FieldType, Value};
