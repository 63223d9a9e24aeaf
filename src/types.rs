use std::fmt;

use rust_decimal::Decimal;
use uuid::Uuid;

/// A typed scalar stored in a document field.
///
/// Temporal values carry raw signed tick counts (100ns units); the engine
/// never interprets them beyond ordering.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    Int32(i32),
    Int64(i64),
    UInt32(u32),
    UInt64(u64),
    Double(f64),
    Decimal(Decimal),
    String(String),
    Guid(Uuid),
    DateTime(i64),
    DateOnly(i64),
    TimeOnly(i64),
    TimeSpan(i64),
    DateTimeOffset { ticks: i64, offset_minutes: i16 },
    Bytes(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn field_type(&self) -> Option<FieldType> {
        match self {
            Value::Null => None,
            Value::Boolean(_) => Some(FieldType::Boolean),
            Value::Int32(_) => Some(FieldType::Int32),
            Value::Int64(_) => Some(FieldType::Int64),
            Value::UInt32(_) => Some(FieldType::UInt32),
            Value::UInt64(_) => Some(FieldType::UInt64),
            Value::Double(_) => Some(FieldType::Double),
            Value::Decimal(_) => Some(FieldType::Decimal),
            Value::String(_) => Some(FieldType::String),
            Value::Guid(_) => Some(FieldType::Guid),
            Value::DateTime(_) => Some(FieldType::DateTime),
            Value::DateOnly(_) => Some(FieldType::DateOnly),
            Value::TimeOnly(_) => Some(FieldType::TimeOnly),
            Value::TimeSpan(_) => Some(FieldType::TimeSpan),
            Value::DateTimeOffset { .. } => Some(FieldType::DateTimeOffset),
            Value::Bytes(_) => Some(FieldType::Bytes),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int32(v) => Some(*v as i64),
            Value::Int64(v) => Some(*v),
            Value::UInt32(v) => Some(*v as i64),
            Value::UInt64(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::Int32(v) => Some(*v),
            Value::Int64(v) => i32::try_from(*v).ok(),
            Value::UInt32(v) => i32::try_from(*v).ok(),
            Value::UInt64(v) => i32::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::UInt32(v) => Some(*v as u64),
            Value::UInt64(v) => Some(*v),
            _ => None,
        }
    }

    /// Widened integral value, signed or unsigned.
    fn as_integer(&self) -> Option<i128> {
        match self {
            Value::Int32(v) => Some(*v as i128),
            Value::Int64(v) => Some(*v as i128),
            Value::UInt32(v) => Some(*v as i128),
            Value::UInt64(v) => Some(*v as i128),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(v) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_decimal(&self) -> Option<Decimal> {
        match self {
            Value::Decimal(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_guid(&self) -> Option<Uuid> {
        match self {
            Value::Guid(v) => Some(*v),
            _ => None,
        }
    }

    /// Ordering used by filters and ORDER BY. Integers of different widths
    /// compare numerically; otherwise only same-type values are ordered.
    pub fn partial_cmp_value(&self, other: &Value) -> Option<std::cmp::Ordering> {
        use Value::*;
        match (self, other) {
            (Null, Null) => Some(std::cmp::Ordering::Equal),
            (Null, _) => Some(std::cmp::Ordering::Less),
            (_, Null) => Some(std::cmp::Ordering::Greater),
            (Boolean(a), Boolean(b)) => Some(a.cmp(b)),
            _ if self.as_integer().is_some() && other.as_integer().is_some() => {
                Some(self.as_integer()?.cmp(&other.as_integer()?))
            }
            (Double(a), Double(b)) => a.partial_cmp(b),
            (Decimal(a), Decimal(b)) => Some(a.cmp(b)),
            (String(a), String(b)) => Some(a.cmp(b)),
            (Guid(a), Guid(b)) => Some(a.as_bytes().cmp(b.as_bytes())),
            (DateTime(a), DateTime(b)) => Some(a.cmp(b)),
            (DateOnly(a), DateOnly(b)) => Some(a.cmp(b)),
            (TimeOnly(a), TimeOnly(b)) => Some(a.cmp(b)),
            (TimeSpan(a), TimeSpan(b)) => Some(a.cmp(b)),
            (
                DateTimeOffset { ticks: a, offset_minutes: ao },
                DateTimeOffset { ticks: b, offset_minutes: bo },
            ) => Some(a.cmp(b).then(ao.cmp(bo))),
            (Bytes(a), Bytes(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Boolean(v) => write!(f, "{}", v),
            Value::Int32(v) => write!(f, "{}", v),
            Value::Int64(v) => write!(f, "{}", v),
            Value::UInt32(v) => write!(f, "{}", v),
            Value::UInt64(v) => write!(f, "{}", v),
            Value::Double(v) => write!(f, "{}", v),
            Value::Decimal(v) => write!(f, "{}", v),
            Value::String(v) => write!(f, "{}", v),
            Value::Guid(v) => write!(f, "{}", v),
            Value::DateTime(v) => write!(f, "datetime({})", v),
            Value::DateOnly(v) => write!(f, "date({})", v),
            Value::TimeOnly(v) => write!(f, "time({})", v),
            Value::TimeSpan(v) => write!(f, "timespan({})", v),
            Value::DateTimeOffset { ticks, offset_minutes } => {
                write!(f, "datetimeoffset({}, {}m)", ticks, offset_minutes)
            }
            Value::Bytes(v) => write!(f, "<binary {} bytes>", v.len()),
        }
    }
}

/// Declared type of a document field.
///
/// `Guid` values are stored and compared byte-wise; only equality is
/// meaningful for range purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Boolean,
    Int32,
    Int64,
    UInt32,
    UInt64,
    Double,
    Decimal,
    String,
    Guid,
    DateTime,
    DateOnly,
    TimeOnly,
    TimeSpan,
    DateTimeOffset,
    Bytes,
}

impl FieldType {
    pub fn code(&self) -> u8 {
        match self {
            FieldType::Boolean => 1,
            FieldType::Int32 => 2,
            FieldType::Int64 => 3,
            FieldType::Double => 4,
            FieldType::UInt32 => 14,
            FieldType::UInt64 => 15,
            FieldType::Decimal => 5,
            FieldType::String => 6,
            FieldType::Guid => 7,
            FieldType::DateTime => 8,
            FieldType::DateOnly => 9,
            FieldType::TimeOnly => 10,
            FieldType::TimeSpan => 11,
            FieldType::DateTimeOffset => 12,
            FieldType::Bytes => 13,
        }
    }

    pub fn from_code(code: u8) -> Option<FieldType> {
        Some(match code {
            1 => FieldType::Boolean,
            2 => FieldType::Int32,
            3 => FieldType::Int64,
            4 => FieldType::Double,
            5 => FieldType::Decimal,
            6 => FieldType::String,
            7 => FieldType::Guid,
            8 => FieldType::DateTime,
            9 => FieldType::DateOnly,
            10 => FieldType::TimeOnly,
            11 => FieldType::TimeSpan,
            12 => FieldType::DateTimeOffset,
            13 => FieldType::Bytes,
            14 => FieldType::UInt32,
            15 => FieldType::UInt64,
            _ => return None,
        })
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldType::Boolean => "BOOLEAN",
            FieldType::Int32 => "INT32",
            FieldType::Int64 => "INT64",
            FieldType::UInt32 => "UINT32",
            FieldType::UInt64 => "UINT64",
            FieldType::Double => "DOUBLE",
            FieldType::Decimal => "DECIMAL",
            FieldType::String => "STRING",
            FieldType::Guid => "GUID",
            FieldType::DateTime => "DATETIME",
            FieldType::DateOnly => "DATEONLY",
            FieldType::TimeOnly => "TIMEONLY",
            FieldType::TimeSpan => "TIMESPAN",
            FieldType::DateTimeOffset => "DATETIMEOFFSET",
            FieldType::Bytes => "BYTES",
        };
        write!(f, "{}", name)
    }
}
