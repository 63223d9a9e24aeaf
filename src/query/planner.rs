//! Rule-based, deterministic plan selection.
//!
//! 1. Primary-key range when any filter bounds the id pseudo-field.
//! 2. Otherwise the secondary index maximizing `(fields_used,
//!    equality_prefix_length)`: leading fields constrained by equality,
//!    optionally one trailing range/prefix on the next field. Ties break
//!    by equality prefix length, then declaration order.
//! 3. Otherwise a full scan of the primary tree's leaves.

use crate::catalog::collection::CollectionDef;
use crate::document::ID_FIELD;
use crate::query::filter::{Filter, FilterOp};
use crate::types::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanType {
    PrimaryKeyRange,
    SecondaryIndex,
    FullScan,
}

impl std::fmt::Display for ScanType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanType::PrimaryKeyRange => write!(f, "primary-key range"),
            ScanType::SecondaryIndex => write!(f, "secondary index"),
            ScanType::FullScan => write!(f, "full scan"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum TrailingBound {
    Range {
        lo: Option<(Value, bool)>,
        hi: Option<(Value, bool)>,
    },
    Prefix(String),
}

#[derive(Debug, Clone)]
pub enum ScanSpec {
    Primary {
        lo: Option<(i64, bool)>,
        hi: Option<(i64, bool)>,
    },
    Secondary {
        index_name: String,
        eq_values: Vec<Value>,
        trailing: Option<TrailingBound>,
    },
    Full,
}

/// Inspectable plan summary; used by tests to assert plan choices.
#[derive(Debug, Clone)]
pub struct QueryExplanation {
    pub scan_type: ScanType,
    pub indexed_field: Option<String>,
    pub range_start: Option<String>,
    pub range_end: Option<String>,
    pub includes_start: bool,
    pub includes_end: bool,
    pub total_filters: usize,
    pub filters_used_by_index: usize,
    pub filters_applied_after_scan: usize,
    pub scan_description: String,
}

#[derive(Debug, Clone)]
pub struct Plan {
    pub spec: ScanSpec,
    /// Indices (into the filter list) the scan itself satisfies.
    pub index_filters: Vec<usize>,
    /// Indices applied as residual predicates after the scan.
    pub residual: Vec<usize>,
    pub explanation: QueryExplanation,
}

pub fn plan(def: Option<&CollectionDef>, filters: &[Filter]) -> Plan {
    if let Some(primary) = plan_primary(filters) {
        return primary;
    }
    if let Some(def) = def {
        if let Some(secondary) = plan_secondary(def, filters) {
            return secondary;
        }
    }
    full_scan(filters)
}

fn residual_of(filters: &[Filter], used: &[usize]) -> Vec<usize> {
    (0..filters.len()).filter(|i| !used.contains(i)).collect()
}

fn plan_primary(filters: &[Filter]) -> Option<Plan> {
    let mut lo: Option<(i64, bool)> = None;
    let mut hi: Option<(i64, bool)> = None;
    let mut used = Vec::new();

    for (i, filter) in filters.iter().enumerate() {
        if filter.field != ID_FIELD {
            continue;
        }
        let Some(value) = filter.value.as_i64() else {
            continue;
        };
        match filter.op {
            FilterOp::Eq => {
                tighten_lo(&mut lo, value, true);
                tighten_hi(&mut hi, value, true);
                used.push(i);
            }
            FilterOp::Lt => {
                tighten_hi(&mut hi, value, false);
                used.push(i);
            }
            FilterOp::Le => {
                tighten_hi(&mut hi, value, true);
                used.push(i);
            }
            FilterOp::Gt => {
                tighten_lo(&mut lo, value, false);
                used.push(i);
            }
            FilterOp::Ge => {
                tighten_lo(&mut lo, value, true);
                used.push(i);
            }
            FilterOp::Between => {
                let upper = filter.upper.as_ref().and_then(|v| v.as_i64());
                if let Some(upper) = upper {
                    tighten_lo(&mut lo, value, true);
                    tighten_hi(&mut hi, upper, true);
                    used.push(i);
                }
            }
            _ => {}
        }
    }

    if used.is_empty() {
        return None;
    }

    let residual = residual_of(filters, &used);
    let explanation = QueryExplanation {
        scan_type: ScanType::PrimaryKeyRange,
        indexed_field: Some(ID_FIELD.to_string()),
        range_start: lo.map(|(v, _)| v.to_string()),
        range_end: hi.map(|(v, _)| v.to_string()),
        includes_start: lo.map(|(_, inc)| inc).unwrap_or(true),
        includes_end: hi.map(|(_, inc)| inc).unwrap_or(true),
        total_filters: filters.len(),
        filters_used_by_index: used.len(),
        filters_applied_after_scan: residual.len(),
        scan_description: describe_primary(lo, hi),
    };
    Some(Plan {
        spec: ScanSpec::Primary { lo, hi },
        index_filters: used,
        residual,
        explanation,
    })
}

fn tighten_lo(lo: &mut Option<(i64, bool)>, value: i64, inclusive: bool) {
    let tighter = match *lo {
        None => true,
        Some((cur, cur_inc)) => value > cur || (value == cur && cur_inc && !inclusive),
    };
    if tighter {
        *lo = Some((value, inclusive));
    }
}

fn tighten_hi(hi: &mut Option<(i64, bool)>, value: i64, inclusive: bool) {
    let tighter = match *hi {
        None => true,
        Some((cur, cur_inc)) => value < cur || (value == cur && cur_inc && !inclusive),
    };
    if tighter {
        *hi = Some((value, inclusive));
    }
}

fn describe_primary(lo: Option<(i64, bool)>, hi: Option<(i64, bool)>) -> String {
    match (lo, hi) {
        (Some((l, _)), Some((h, _))) if l == h => format!("primary tree seek id {}", l),
        (lo, hi) => format!(
            "primary tree range {} .. {}",
            lo.map(|(v, inc)| format!("{}{}", if inc { "[" } else { "(" }, v))
                .unwrap_or_else(|| "(-inf".into()),
            hi.map(|(v, inc)| format!("{}{}", v, if inc { "]" } else { ")" }))
                .unwrap_or_else(|| "+inf)".into()),
        ),
    }
}

struct Candidate {
    index_name: String,
    eq_values: Vec<Value>,
    trailing: Option<TrailingBound>,
    used: Vec<usize>,
    fields_used: usize,
    eq_prefix: usize,
    declaration_order: usize,
}

fn plan_secondary(def: &CollectionDef, filters: &[Filter]) -> Option<Plan> {
    let mut best: Option<Candidate> = None;

    for (order, index) in def.indexes.iter().enumerate() {
        let Some(candidate) = match_index(index, order, filters) else {
            continue;
        };
        let better = match &best {
            None => true,
            Some(cur) => {
                (candidate.fields_used, candidate.eq_prefix)
                    > (cur.fields_used, cur.eq_prefix)
                    || ((candidate.fields_used, candidate.eq_prefix)
                        == (cur.fields_used, cur.eq_prefix)
                        && candidate.declaration_order < cur.declaration_order)
            }
        };
        if better {
            best = Some(candidate);
        }
    }

    let candidate = best?;
    let residual = residual_of(filters, &candidate.used);
    let (range_start, range_end, includes_start, includes_end) =
        describe_trailing(&candidate);
    let explanation = QueryExplanation {
        scan_type: ScanType::SecondaryIndex,
        indexed_field: Some(candidate.index_name.clone()),
        range_start,
        range_end,
        includes_start,
        includes_end,
        total_filters: filters.len(),
        filters_used_by_index: candidate.used.len(),
        filters_applied_after_scan: residual.len(),
        scan_description: format!(
            "index '{}' with {} equality field(s){}",
            candidate.index_name,
            candidate.eq_prefix,
            match &candidate.trailing {
                Some(TrailingBound::Range { .. }) => " and a trailing range",
                Some(TrailingBound::Prefix(_)) => " and a trailing prefix",
                None => "",
            }
        ),
    };
    Some(Plan {
        spec: ScanSpec::Secondary {
            index_name: candidate.index_name,
            eq_values: candidate.eq_values,
            trailing: candidate.trailing,
        },
        index_filters: candidate.used.clone(),
        residual,
        explanation,
    })
}

fn match_index(
    index: &crate::catalog::collection::IndexDef,
    order: usize,
    filters: &[Filter],
) -> Option<Candidate> {
    let mut eq_values = Vec::new();
    let mut used = Vec::new();

    // Leading fields must be equality-constrained, in order.
    let mut next_field = 0usize;
    for field in &index.fields {
        let eq = filters
            .iter()
            .enumerate()
            .find(|(i, f)| f.field == *field && f.op == FilterOp::Eq && !used.contains(i));
        match eq {
            Some((i, f)) => {
                eq_values.push(f.value.clone());
                used.push(i);
                next_field += 1;
            }
            None => break,
        }
    }

    // At most one trailing range or prefix on the next field.
    let mut trailing = None;
    if next_field < index.fields.len() {
        let field = &index.fields[next_field];
        let mut lo: Option<(Value, bool)> = None;
        let mut hi: Option<(Value, bool)> = None;
        let mut range_used = Vec::new();

        for (i, filter) in filters.iter().enumerate() {
            if filter.field != *field || used.contains(&i) {
                continue;
            }
            match filter.op {
                FilterOp::StartsWith => {
                    if let Value::String(prefix) = &filter.value {
                        if range_used.is_empty() && lo.is_none() && hi.is_none() {
                            trailing = Some(TrailingBound::Prefix(prefix.clone()));
                            range_used.push(i);
                            break;
                        }
                    }
                }
                FilterOp::Gt => {
                    if lo.is_none() {
                        lo = Some((filter.value.clone(), false));
                        range_used.push(i);
                    }
                }
                FilterOp::Ge => {
                    if lo.is_none() {
                        lo = Some((filter.value.clone(), true));
                        range_used.push(i);
                    }
                }
                FilterOp::Lt => {
                    if hi.is_none() {
                        hi = Some((filter.value.clone(), false));
                        range_used.push(i);
                    }
                }
                FilterOp::Le => {
                    if hi.is_none() {
                        hi = Some((filter.value.clone(), true));
                        range_used.push(i);
                    }
                }
                FilterOp::Between => {
                    if lo.is_none() && hi.is_none() {
                        lo = Some((filter.value.clone(), true));
                        hi = Some((
                            filter.upper.clone().unwrap_or(filter.value.clone()),
                            true,
                        ));
                        range_used.push(i);
                    }
                }
                _ => {}
            }
        }
        if trailing.is_none() && (lo.is_some() || hi.is_some()) {
            trailing = Some(TrailingBound::Range { lo, hi });
        }
        used.extend(range_used);
    }

    let fields_used = eq_values.len() + trailing.is_some() as usize;
    if fields_used == 0 {
        return None;
    }
    Some(Candidate {
        index_name: index.name.clone(),
        eq_prefix: eq_values.len(),
        eq_values,
        trailing,
        used,
        fields_used,
        declaration_order: order,
    })
}

fn describe_trailing(candidate: &Candidate) -> (Option<String>, Option<String>, bool, bool) {
    match &candidate.trailing {
        Some(TrailingBound::Range { lo, hi }) => (
            lo.as_ref().map(|(v, _)| v.to_string()),
            hi.as_ref().map(|(v, _)| v.to_string()),
            lo.as_ref().map(|(_, inc)| *inc).unwrap_or(true),
            hi.as_ref().map(|(_, inc)| *inc).unwrap_or(true),
        ),
        Some(TrailingBound::Prefix(prefix)) => {
            (Some(prefix.clone()), Some(format!("{}\u{10FFFF}", prefix)), true, false)
        }
        None => (
            candidate.eq_values.first().map(|v| v.to_string()),
            candidate.eq_values.first().map(|v| v.to_string()),
            true,
            true,
        ),
    }
}

fn full_scan(filters: &[Filter]) -> Plan {
    let residual: Vec<usize> = (0..filters.len()).collect();
    Plan {
        spec: ScanSpec::Full,
        index_filters: Vec::new(),
        residual: residual.clone(),
        explanation: QueryExplanation {
            scan_type: ScanType::FullScan,
            indexed_field: None,
            range_start: None,
            range_end: None,
            includes_start: true,
            includes_end: true,
            total_filters: filters.len(),
            filters_used_by_index: 0,
            filters_applied_after_scan: residual.len(),
            scan_description: "full scan of primary tree leaves".into(),
        },
    }
}
