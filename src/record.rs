//! The typed-record contract.
//!
//! A build-time generator (or a hand-written impl) supplies this metadata
//! per record type; the engine only consumes the trait. `fields` drives
//! collection schema and single-field indexes, `indexes` declares compound
//! indexes.

use crate::document::Document;
use crate::error::Result;
use crate::types::FieldType;

#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub field_type: FieldType,
    pub indexed: bool,
    pub unique: bool,
}

impl FieldSpec {
    pub const fn plain(name: &'static str, field_type: FieldType) -> Self {
        FieldSpec {
            name,
            field_type,
            indexed: false,
            unique: false,
        }
    }

    pub const fn indexed(name: &'static str, field_type: FieldType) -> Self {
        FieldSpec {
            name,
            field_type,
            indexed: true,
            unique: false,
        }
    }

    pub const fn unique(name: &'static str, field_type: FieldType) -> Self {
        FieldSpec {
            name,
            field_type,
            indexed: true,
            unique: true,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct IndexSpec {
    pub fields: &'static [&'static str],
    pub unique: bool,
}

pub trait Record: Sized {
    fn collection_name() -> &'static str;
    fn fields() -> &'static [FieldSpec];

    fn indexes() -> &'static [IndexSpec] {
        &[]
    }

    fn id(&self) -> i64;
    fn set_id(&mut self, id: i64);

    fn to_document(&self) -> Document;
    fn from_document(doc: &Document) -> Result<Self>;
}
