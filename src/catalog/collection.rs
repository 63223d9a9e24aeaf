//! Collection definitions: declared fields, secondary indexes, tree roots
//! and the id watermark. Serialized with fixed little-endian framing.

use crate::error::{GaldrError, Result};
use crate::storage::page::PageId;
use crate::types::FieldType;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDef {
    pub name: String,
    pub field_type: FieldType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDef {
    pub name: String,
    pub fields: Vec<String>,
    pub unique: bool,
    pub root: PageId,
}

impl IndexDef {
    /// Index names derive from their field list: `Status_CreatedDate`.
    pub fn name_for(fields: &[String]) -> String {
        fields.join("_")
    }

    /// Average-key-size heuristic feeding node fanout.
    pub fn avg_key_size(&self) -> usize {
        16 * self.fields.len().max(1)
    }

    pub fn is_compound(&self) -> bool {
        self.fields.len() > 1
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionDef {
    pub name: String,
    pub primary_root: PageId,
    pub next_id: i64,
    pub fields: Vec<FieldDef>,
    pub indexes: Vec<IndexDef>,
}

impl CollectionDef {
    pub fn index(&self, name: &str) -> Option<&IndexDef> {
        self.indexes.iter().find(|i| i.name == name)
    }

    pub fn index_on_field(&self, field: &str) -> Option<&IndexDef> {
        self.indexes
            .iter()
            .find(|i| i.fields.len() == 1 && i.fields[0] == field)
    }

    pub fn declared_type(&self, field: &str) -> Option<FieldType> {
        self.fields
            .iter()
            .find(|f| f.name == field)
            .map(|f| f.field_type)
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        write_string(&mut buf, &self.name);
        buf.extend_from_slice(&self.primary_root.to_le_bytes());
        buf.extend_from_slice(&self.next_id.to_le_bytes());

        buf.extend_from_slice(&(self.fields.len() as u16).to_le_bytes());
        for field in &self.fields {
            write_string(&mut buf, &field.name);
            buf.push(field.field_type.code());
        }

        buf.extend_from_slice(&(self.indexes.len() as u16).to_le_bytes());
        for index in &self.indexes {
            write_string(&mut buf, &index.name);
            buf.extend_from_slice(&(index.fields.len() as u16).to_le_bytes());
            for field in &index.fields {
                write_string(&mut buf, field);
            }
            buf.push(index.unique as u8);
            buf.extend_from_slice(&index.root.to_le_bytes());
        }
        buf
    }

    pub fn deserialize(data: &[u8]) -> Result<(CollectionDef, usize)> {
        let mut offset = 0usize;
        let name = read_string(data, &mut offset)?;
        let primary_root = read_u32(data, &mut offset)?;
        let next_id = read_i64(data, &mut offset)?;

        let field_count = read_u16(data, &mut offset)? as usize;
        let mut fields = Vec::with_capacity(field_count);
        for _ in 0..field_count {
            let fname = read_string(data, &mut offset)?;
            let code = read_u8(data, &mut offset)?;
            let field_type = FieldType::from_code(code).ok_or_else(|| {
                GaldrError::Corruption(format!("unknown field type code {}", code))
            })?;
            fields.push(FieldDef {
                name: fname,
                field_type,
            });
        }

        let index_count = read_u16(data, &mut offset)? as usize;
        let mut indexes = Vec::with_capacity(index_count);
        for _ in 0..index_count {
            let iname = read_string(data, &mut offset)?;
            let nfields = read_u16(data, &mut offset)? as usize;
            let mut ifields = Vec::with_capacity(nfields);
            for _ in 0..nfields {
                ifields.push(read_string(data, &mut offset)?);
            }
            let unique = read_u8(data, &mut offset)? != 0;
            let root = read_u32(data, &mut offset)?;
            indexes.push(IndexDef {
                name: iname,
                fields: ifields,
                unique,
                root,
            });
        }

        Ok((
            CollectionDef {
                name,
                primary_root,
                next_id,
                fields,
                indexes,
            },
            offset,
        ))
    }
}

fn write_string(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u16).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
}

fn read_u8(data: &[u8], offset: &mut usize) -> Result<u8> {
    if *offset + 1 > data.len() {
        return Err(GaldrError::Corruption("collection def truncated".into()));
    }
    let v = data[*offset];
    *offset += 1;
    Ok(v)
}

fn read_u16(data: &[u8], offset: &mut usize) -> Result<u16> {
    if *offset + 2 > data.len() {
        return Err(GaldrError::Corruption("collection def truncated".into()));
    }
    let v = u16::from_le_bytes(data[*offset..*offset + 2].try_into().unwrap());
    *offset += 2;
    Ok(v)
}

fn read_u32(data: &[u8], offset: &mut usize) -> Result<u32> {
    if *offset + 4 > data.len() {
        return Err(GaldrError::Corruption("collection def truncated".into()));
    }
    let v = u32::from_le_bytes(data[*offset..*offset + 4].try_into().unwrap());
    *offset += 4;
    Ok(v)
}

fn read_i64(data: &[u8], offset: &mut usize) -> Result<i64> {
    if *offset + 8 > data.len() {
        return Err(GaldrError::Corruption("collection def truncated".into()));
    }
    let v = i64::from_le_bytes(data[*offset..*offset + 8].try_into().unwrap());
    *offset += 8;
    Ok(v)
}

fn read_string(data: &[u8], offset: &mut usize) -> Result<String> {
    let len = read_u16(data, offset)? as usize;
    if *offset + len > data.len() {
        return Err(GaldrError::Corruption("collection def truncated".into()));
    }
    let s = String::from_utf8(data[*offset..*offset + len].to_vec())
        .map_err(|_| GaldrError::Corruption("collection def name is not UTF-8".into()))?;
    *offset += len;
    Ok(s)
}
