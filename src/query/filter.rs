//! Query predicates and ordering.

use crate::document::Document;
use crate::types::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Between,
    StartsWith,
    In,
    NotIn,
}

#[derive(Debug, Clone)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
    /// Upper bound for `Between`.
    pub upper: Option<Value>,
    /// Probe set for `In` / `NotIn`.
    pub values: Vec<Value>,
}

impl Filter {
    pub fn new(field: impl Into<String>, op: FilterOp, value: Value) -> Self {
        Filter {
            field: field.into(),
            op,
            value,
            upper: None,
            values: Vec::new(),
        }
    }

    pub fn between(field: impl Into<String>, lo: Value, hi: Value) -> Self {
        Filter {
            field: field.into(),
            op: FilterOp::Between,
            value: lo,
            upper: Some(hi),
            values: Vec::new(),
        }
    }

    pub fn in_set(field: impl Into<String>, values: Vec<Value>) -> Self {
        Filter {
            field: field.into(),
            op: FilterOp::In,
            value: Value::Null,
            upper: None,
            values,
        }
    }

    pub fn not_in_set(field: impl Into<String>, values: Vec<Value>) -> Self {
        Filter {
            field: field.into(),
            op: FilterOp::NotIn,
            value: Value::Null,
            upper: None,
            values,
        }
    }

    pub fn matches(&self, doc: &Document) -> bool {
        let actual = doc.value_of(&self.field).unwrap_or(Value::Null);
        match self.op {
            FilterOp::Eq => eq(&actual, &self.value),
            FilterOp::Ne => !eq(&actual, &self.value),
            FilterOp::Lt => cmp_is(&actual, &self.value, |o| o == std::cmp::Ordering::Less),
            FilterOp::Le => cmp_is(&actual, &self.value, |o| o != std::cmp::Ordering::Greater),
            FilterOp::Gt => cmp_is(&actual, &self.value, |o| o == std::cmp::Ordering::Greater),
            FilterOp::Ge => cmp_is(&actual, &self.value, |o| o != std::cmp::Ordering::Less),
            FilterOp::Between => {
                let hi = self.upper.as_ref().unwrap_or(&self.value);
                cmp_is(&actual, &self.value, |o| o != std::cmp::Ordering::Less)
                    && cmp_is(&actual, hi, |o| o != std::cmp::Ordering::Greater)
            }
            FilterOp::StartsWith => match (&actual, &self.value) {
                (Value::String(s), Value::String(prefix)) => s.starts_with(prefix.as_str()),
                _ => false,
            },
            FilterOp::In => self.values.iter().any(|v| eq(&actual, v)),
            FilterOp::NotIn => !self.values.iter().any(|v| eq(&actual, v)),
        }
    }
}

fn eq(a: &Value, b: &Value) -> bool {
    a.partial_cmp_value(b) == Some(std::cmp::Ordering::Equal)
}

fn cmp_is(a: &Value, b: &Value, pred: impl Fn(std::cmp::Ordering) -> bool) -> bool {
    match a.partial_cmp_value(b) {
        Some(ordering) if !a.is_null() && !b.is_null() => pred(ordering),
        _ => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

#[derive(Debug, Clone)]
pub struct OrderBy {
    pub field: String,
    pub order: SortOrder,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc() -> Document {
        Document::with_id(3)
            .set("Name", Value::String("Alice".into()))
            .set("Age", Value::Int32(30))
    }

    #[test]
    fn test_eq_and_ne() {
        let d = doc();
        assert!(Filter::new("Name", FilterOp::Eq, Value::String("Alice".into())).matches(&d));
        assert!(!Filter::new("Name", FilterOp::Eq, Value::String("Bob".into())).matches(&d));
        assert!(Filter::new("Name", FilterOp::Ne, Value::String("Bob".into())).matches(&d));
    }

    #[test]
    fn test_numeric_comparisons_cross_width() {
        let d = doc();
        assert!(Filter::new("Age", FilterOp::Gt, Value::Int64(29)).matches(&d));
        assert!(Filter::new("Age", FilterOp::Le, Value::Int64(30)).matches(&d));
        assert!(!Filter::new("Age", FilterOp::Lt, Value::Int64(30)).matches(&d));
        assert!(Filter::between("Age", Value::Int64(20), Value::Int64(40)).matches(&d));
    }

    #[test]
    fn test_id_pseudo_field() {
        let d = doc();
        assert!(Filter::new("_id", FilterOp::Eq, Value::Int64(3)).matches(&d));
    }

    #[test]
    fn test_starts_with() {
        let d = doc();
        assert!(Filter::new("Name", FilterOp::StartsWith, Value::String("Al".into())).matches(&d));
        assert!(!Filter::new("Name", FilterOp::StartsWith, Value::String("Bo".into())).matches(&d));
    }

    #[test]
    fn test_in_and_not_in() {
        let d = doc();
        let hit = vec![Value::String("Alice".into()), Value::String("Eve".into())];
        assert!(Filter::in_set("Name", hit.clone()).matches(&d));
        assert!(!Filter::not_in_set("Name", hit).matches(&d));
    }

    #[test]
    fn test_missing_field_is_null() {
        let d = doc();
        assert!(Filter::new("Missing", FilterOp::Eq, Value::Null).matches(&d));
        assert!(!Filter::new("Missing", FilterOp::Lt, Value::Int64(5)).matches(&d));
    }
}
