//! Dynamic documents and the binary payload codec.
//!
//! Payload layout: `id i64 | field_count u16 | {name_len u16, name,
//! tag u8, value...}*`. Field order in the payload follows the map order
//! and is irrelevant to equality.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use uuid::Uuid;

use crate::error::{GaldrError, Result};
use crate::types::Value;

/// Pseudo-field name under which the document id is visible to queries.
pub const ID_FIELD: &str = "_id";

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Document {
    id: i64,
    fields: BTreeMap<String, Value>,
}

impl Document {
    pub fn new() -> Self {
        Document::default()
    }

    pub fn with_id(id: i64) -> Self {
        Document {
            id,
            fields: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn set_id(&mut self, id: i64) {
        self.id = id;
    }

    pub fn set(mut self, name: impl Into<String>, value: Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    pub fn put(&mut self, name: impl Into<String>, value: Value) {
        self.fields.insert(name.into(), value);
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.fields.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Field lookup used by filters and ordering; resolves the id
    /// pseudo-field too.
    pub fn value_of(&self, name: &str) -> Option<Value> {
        if name == ID_FIELD {
            return Some(Value::Int64(self.id));
        }
        self.fields.get(name).cloned()
    }

    pub fn fields(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn get_string(&self, name: &str) -> Option<String> {
        self.fields.get(name).and_then(|v| v.as_str()).map(String::from)
    }

    pub fn get_int32(&self, name: &str) -> Option<i32> {
        self.fields.get(name).and_then(|v| v.as_i32())
    }

    pub fn get_int64(&self, name: &str) -> Option<i64> {
        self.fields.get(name).and_then(|v| v.as_i64())
    }

    pub fn get_double(&self, name: &str) -> Option<f64> {
        self.fields.get(name).and_then(|v| v.as_f64())
    }

    pub fn get_decimal(&self, name: &str) -> Option<Decimal> {
        self.fields.get(name).and_then(|v| v.as_decimal())
    }

    pub fn get_boolean(&self, name: &str) -> Option<bool> {
        self.fields.get(name).and_then(|v| v.as_bool())
    }

    pub fn get_guid(&self, name: &str) -> Option<Uuid> {
        self.fields.get(name).and_then(|v| v.as_guid())
    }

    // --- Binary payload codec ---

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(32);
        buf.extend_from_slice(&self.id.to_le_bytes());
        buf.extend_from_slice(&(self.fields.len() as u16).to_le_bytes());
        for (name, value) in &self.fields {
            let name_bytes = name.as_bytes();
            buf.extend_from_slice(&(name_bytes.len() as u16).to_le_bytes());
            buf.extend_from_slice(name_bytes);
            encode_value_payload(value, &mut buf);
        }
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Document> {
        let mut cursor = Cursor { data, offset: 0 };
        let id = cursor.i64()?;
        let count = cursor.u16()? as usize;
        let mut fields = BTreeMap::new();
        for _ in 0..count {
            let name_len = cursor.u16()? as usize;
            let name = String::from_utf8(cursor.bytes(name_len)?.to_vec())
                .map_err(|_| GaldrError::Corruption("field name is not UTF-8".into()))?;
            let value = decode_value_payload(&mut cursor)?;
            fields.insert(name, value);
        }
        Ok(Document { id, fields })
    }

    // --- JSON conversion for the dynamic API and the CLI ---

    pub fn to_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        map.insert(ID_FIELD.into(), serde_json::Value::from(self.id));
        for (name, value) in &self.fields {
            map.insert(name.clone(), value_to_json(value));
        }
        serde_json::Value::Object(map)
    }

    pub fn from_json(json: &serde_json::Value) -> Result<Document> {
        let obj = json.as_object().ok_or_else(|| {
            GaldrError::InvalidArgument("dynamic document must be a JSON object".into())
        })?;
        let mut doc = Document::new();
        for (name, value) in obj {
            if name == ID_FIELD {
                doc.id = value.as_i64().ok_or_else(|| {
                    GaldrError::InvalidArgument("_id must be an integer".into())
                })?;
                continue;
            }
            doc.fields.insert(name.clone(), json_to_value(value)?);
        }
        Ok(doc)
    }

    pub fn from_json_str(json: &str) -> Result<Document> {
        let parsed: serde_json::Value = serde_json::from_str(json)
            .map_err(|e| GaldrError::InvalidArgument(format!("invalid JSON: {}", e)))?;
        Document::from_json(&parsed)
    }

    pub fn to_json_string(&self) -> String {
        self.to_json().to_string()
    }
}

struct Cursor<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.offset + len > self.data.len() {
            return Err(GaldrError::Corruption("document payload truncated".into()));
        }
        let out = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.bytes(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.bytes(4)?.try_into().unwrap()))
    }

    fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.bytes(8)?.try_into().unwrap()))
    }

    fn i16(&mut self) -> Result<i16> {
        Ok(i16::from_le_bytes(self.bytes(2)?.try_into().unwrap()))
    }
}

const P_NULL: u8 = 0;
const P_BOOL: u8 = 1;
const P_INT32: u8 = 2;
const P_INT64: u8 = 3;
const P_DOUBLE: u8 = 4;
const P_DECIMAL: u8 = 5;
const P_STRING: u8 = 6;
const P_GUID: u8 = 7;
const P_DATETIME: u8 = 8;
const P_DATEONLY: u8 = 9;
const P_TIMEONLY: u8 = 10;
const P_TIMESPAN: u8 = 11;
const P_DTOFFSET: u8 = 12;
const P_BYTES: u8 = 13;
const P_UINT32: u8 = 14;
const P_UINT64: u8 = 15;

fn encode_value_payload(value: &Value, buf: &mut Vec<u8>) {
    match value {
        Value::Null => buf.push(P_NULL),
        Value::Boolean(v) => {
            buf.push(P_BOOL);
            buf.push(*v as u8);
        }
        Value::Int32(v) => {
            buf.push(P_INT32);
            buf.extend_from_slice(&v.to_le_bytes());
        }
        Value::Int64(v) => {
            buf.push(P_INT64);
            buf.extend_from_slice(&v.to_le_bytes());
        }
        Value::UInt32(v) => {
            buf.push(P_UINT32);
            buf.extend_from_slice(&v.to_le_bytes());
        }
        Value::UInt64(v) => {
            buf.push(P_UINT64);
            buf.extend_from_slice(&v.to_le_bytes());
        }
        Value::Double(v) => {
            buf.push(P_DOUBLE);
            buf.extend_from_slice(&v.to_bits().to_le_bytes());
        }
        Value::Decimal(v) => {
            buf.push(P_DECIMAL);
            buf.extend_from_slice(&v.mantissa().to_le_bytes());
            buf.extend_from_slice(&v.scale().to_le_bytes());
        }
        Value::String(v) => {
            buf.push(P_STRING);
            buf.extend_from_slice(&(v.len() as u32).to_le_bytes());
            buf.extend_from_slice(v.as_bytes());
        }
        Value::Guid(v) => {
            buf.push(P_GUID);
            buf.extend_from_slice(v.as_bytes());
        }
        Value::DateTime(v) => {
            buf.push(P_DATETIME);
            buf.extend_from_slice(&v.to_le_bytes());
        }
        Value::DateOnly(v) => {
            buf.push(P_DATEONLY);
            buf.extend_from_slice(&v.to_le_bytes());
        }
        Value::TimeOnly(v) => {
            buf.push(P_TIMEONLY);
            buf.extend_from_slice(&v.to_le_bytes());
        }
        Value::TimeSpan(v) => {
            buf.push(P_TIMESPAN);
            buf.extend_from_slice(&v.to_le_bytes());
        }
        Value::DateTimeOffset { ticks, offset_minutes } => {
            buf.push(P_DTOFFSET);
            buf.extend_from_slice(&ticks.to_le_bytes());
            buf.extend_from_slice(&offset_minutes.to_le_bytes());
        }
        Value::Bytes(v) => {
            buf.push(P_BYTES);
            buf.extend_from_slice(&(v.len() as u32).to_le_bytes());
            buf.extend_from_slice(v);
        }
    }
}

fn decode_value_payload(cursor: &mut Cursor<'_>) -> Result<Value> {
    let tag = cursor.u8()?;
    Ok(match tag {
        P_NULL => Value::Null,
        P_BOOL => Value::Boolean(cursor.u8()? != 0),
        P_INT32 => Value::Int32(i32::from_le_bytes(cursor.bytes(4)?.try_into().unwrap())),
        P_INT64 => Value::Int64(cursor.i64()?),
        P_UINT32 => Value::UInt32(cursor.u32()?),
        P_UINT64 => Value::UInt64(u64::from_le_bytes(cursor.bytes(8)?.try_into().unwrap())),
        P_DOUBLE => Value::Double(f64::from_bits(u64::from_le_bytes(
            cursor.bytes(8)?.try_into().unwrap(),
        ))),
        P_DECIMAL => {
            let mantissa = i128::from_le_bytes(cursor.bytes(16)?.try_into().unwrap());
            let scale = cursor.u32()?;
            Value::Decimal(
                Decimal::try_from_i128_with_scale(mantissa, scale)
                    .map_err(|_| GaldrError::Corruption("decimal out of range".into()))?,
            )
        }
        P_STRING => {
            let len = cursor.u32()? as usize;
            Value::String(
                String::from_utf8(cursor.bytes(len)?.to_vec())
                    .map_err(|_| GaldrError::Corruption("string field is not UTF-8".into()))?,
            )
        }
        P_GUID => Value::Guid(Uuid::from_bytes(cursor.bytes(16)?.try_into().unwrap())),
        P_DATETIME => Value::DateTime(cursor.i64()?),
        P_DATEONLY => Value::DateOnly(cursor.i64()?),
        P_TIMEONLY => Value::TimeOnly(cursor.i64()?),
        P_TIMESPAN => Value::TimeSpan(cursor.i64()?),
        P_DTOFFSET => Value::DateTimeOffset {
            ticks: cursor.i64()?,
            offset_minutes: cursor.i16()?,
        },
        P_BYTES => {
            let len = cursor.u32()? as usize;
            Value::Bytes(cursor.bytes(len)?.to_vec())
        }
        _ => return Err(GaldrError::Corruption(format!("unknown value tag {}", tag))),
    })
}

fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Boolean(v) => serde_json::Value::from(*v),
        Value::Int32(v) => serde_json::Value::from(*v),
        Value::Int64(v) => serde_json::Value::from(*v),
        Value::UInt32(v) => serde_json::Value::from(*v),
        Value::UInt64(v) => serde_json::Value::from(*v),
        Value::Double(v) => serde_json::Number::from_f64(*v)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::Decimal(v) => serde_json::Value::from(v.to_string()),
        Value::String(v) => serde_json::Value::from(v.clone()),
        Value::Guid(v) => serde_json::Value::from(v.to_string()),
        Value::DateTime(v)
        | Value::DateOnly(v)
        | Value::TimeOnly(v)
        | Value::TimeSpan(v) => serde_json::Value::from(*v),
        Value::DateTimeOffset { ticks, offset_minutes } => serde_json::Value::from(vec![
            serde_json::Value::from(*ticks),
            serde_json::Value::from(*offset_minutes),
        ]),
        Value::Bytes(v) => {
            serde_json::Value::from(v.iter().map(|b| format!("{:02x}", b)).collect::<String>())
        }
    }
}

fn json_to_value(json: &serde_json::Value) -> Result<Value> {
    Ok(match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(v) => Value::Boolean(*v),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int64(i)
            } else if let Some(u) = n.as_u64() {
                Value::UInt64(u)
            } else if let Some(f) = n.as_f64() {
                Value::Double(f)
            } else {
                return Err(GaldrError::InvalidArgument(format!(
                    "unsupported JSON number {}",
                    n
                )));
            }
        }
        serde_json::Value::String(s) => Value::String(s.clone()),
        serde_json::Value::Array(_) | serde_json::Value::Object(_) => {
            return Err(GaldrError::InvalidArgument(
                "nested JSON values are not supported in dynamic documents".into(),
            ))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn sample() -> Document {
        Document::with_id(42)
            .set("name", Value::String("Alice".into()))
            .set("age", Value::Int32(30))
            .set("balance", Value::Decimal(Decimal::from_str("1234.56").unwrap()))
            .set("score", Value::Double(0.75))
            .set("active", Value::Boolean(true))
            .set("token", Value::Guid(Uuid::from_bytes([7u8; 16])))
            .set("joined", Value::DateTime(638_000_000_000_000_000))
            .set("note", Value::Null)
            .set("blob", Value::Bytes(vec![1, 2, 3]))
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let doc = sample();
        let decoded = Document::decode(&doc.encode()).unwrap();
        assert_eq!(decoded, doc);
        assert_eq!(decoded.id(), 42);
    }

    #[test]
    fn test_typed_accessors() {
        let doc = sample();
        assert_eq!(doc.get_string("name").as_deref(), Some("Alice"));
        assert_eq!(doc.get_int32("age"), Some(30));
        assert_eq!(doc.get_double("score"), Some(0.75));
        assert_eq!(doc.get_boolean("active"), Some(true));
        assert_eq!(doc.get_guid("token"), Some(Uuid::from_bytes([7u8; 16])));
        assert_eq!(
            doc.get_decimal("balance"),
            Some(Decimal::from_str("1234.56").unwrap())
        );
        assert_eq!(doc.get_string("missing"), None);
    }

    #[test]
    fn test_value_of_resolves_id() {
        let doc = sample();
        assert_eq!(doc.value_of(ID_FIELD), Some(Value::Int64(42)));
        assert_eq!(doc.value_of("age"), Some(Value::Int32(30)));
    }

    #[test]
    fn test_json_roundtrip() {
        let doc = Document::with_id(7)
            .set("name", Value::String("Bob".into()))
            .set("age", Value::Int64(41))
            .set("height", Value::Double(1.82));
        let json = doc.to_json_string();
        let back = Document::from_json_str(&json).unwrap();
        assert_eq!(back.id(), 7);
        assert_eq!(back.get_string("name").as_deref(), Some("Bob"));
        assert_eq!(back.get_int64("age"), Some(41));
        assert_eq!(back.get_double("height"), Some(1.82));
    }

    #[test]
    fn test_json_rejects_nested() {
        assert!(Document::from_json_str(r#"{"a": {"b": 1}}"#).is_err());
        assert!(Document::from_json_str(r#"{"a": [1, 2]}"#).is_err());
    }

    #[test]
    fn test_truncated_payload_rejected() {
        let doc = sample();
        let bytes = doc.encode();
        assert!(Document::decode(&bytes[..bytes.len() - 3]).is_err());
    }
}
