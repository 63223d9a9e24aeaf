//! Query execution helpers: parameter bundle and post-processing.
//! The scan itself runs inside the engine, which owns the trees and the
//! version store; ordering, skip and limit are applied here.

use crate::document::Document;
use crate::query::filter::{Filter, OrderBy, SortOrder};

#[derive(Debug, Clone, Default)]
pub struct QueryParams {
    pub filters: Vec<Filter>,
    pub order: Option<OrderBy>,
    pub skip: usize,
    pub limit: Option<usize>,
}

/// Residual predicate application.
pub fn passes(doc: &Document, filters: &[Filter], which: &[usize]) -> bool {
    which.iter().all(|&i| filters[i].matches(doc))
}

pub fn passes_all(doc: &Document, filters: &[Filter]) -> bool {
    filters.iter().all(|f| f.matches(doc))
}

/// Order results; without an explicit ordering, ascending id keeps the
/// merge with write-set inserts deterministic.
pub fn sort_documents(docs: &mut [Document], order: Option<&OrderBy>) {
    match order {
        Some(order_by) => {
            docs.sort_by(|a, b| {
                let va = a.value_of(&order_by.field);
                let vb = b.value_of(&order_by.field);
                let ordering = match (va, vb) {
                    (Some(va), Some(vb)) => {
                        va.partial_cmp_value(&vb).unwrap_or(std::cmp::Ordering::Equal)
                    }
                    (None, Some(_)) => std::cmp::Ordering::Less,
                    (Some(_), None) => std::cmp::Ordering::Greater,
                    (None, None) => std::cmp::Ordering::Equal,
                };
                match order_by.order {
                    SortOrder::Ascending => ordering,
                    SortOrder::Descending => ordering.reverse(),
                }
                .then(a.id().cmp(&b.id()))
            });
        }
        None => docs.sort_by_key(|d| d.id()),
    }
}

pub fn apply_window(mut docs: Vec<Document>, skip: usize, limit: Option<usize>) -> Vec<Document> {
    if skip > 0 {
        if skip >= docs.len() {
            return Vec::new();
        }
        docs.drain(..skip);
    }
    if let Some(limit) = limit {
        docs.truncate(limit);
    }
    docs
}
