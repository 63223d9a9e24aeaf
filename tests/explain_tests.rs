use galdrdb::{Db, DbOptions, Document, FilterOp, ScanType, Value};
use tempfile::TempDir;

const DAY: i64 = 864_000_000_000; // ticks

fn setup_orders() -> (Db, TempDir) {
    let dir = TempDir::new().unwrap();
    let db = Db::create(dir.path().join("test.db"), DbOptions::default()).unwrap();
    db.ensure_collection_dynamic("Order").unwrap();
    db.ensure_index("Order", &["Status", "CreatedDate"], false).unwrap();
    db.ensure_index("Order", &["Customer"], false).unwrap();

    let base = 638_000_000_000_000_000i64;
    for i in 0..20 {
        let status = if i % 2 == 0 { "Pending" } else { "Shipped" };
        db.insert_dynamic(
            "Order",
            &mut Document::new()
                .set("Status", Value::String(status.into()))
                .set("CreatedDate", Value::DateTime(base + i * DAY))
                .set("Customer", Value::String(format!("c{}", i % 5))),
        )
        .unwrap();
    }
    (db, dir)
}

#[test]
fn test_compound_index_with_range_is_chosen() {
    let (db, _dir) = setup_orders();
    let base = 638_000_000_000_000_000i64;
    let d1 = base + 4 * DAY;
    let d2 = base + 12 * DAY;

    let query = db
        .query("Order")
        .where_eq("Status", Value::String("Pending".into()))
        .where_between("CreatedDate", Value::DateTime(d1), Value::DateTime(d2));

    let explanation = query.explain().unwrap();
    assert_eq!(explanation.scan_type, ScanType::SecondaryIndex);
    assert_eq!(explanation.indexed_field.as_deref(), Some("Status_CreatedDate"));
    assert_eq!(explanation.filters_used_by_index, 2);
    assert_eq!(explanation.filters_applied_after_scan, 0);
    assert!(explanation.includes_start && explanation.includes_end);

    // The plan returns exactly the brute-force answer: Pending orders on
    // even days 4..=12.
    let docs = query.to_documents().unwrap();
    assert_eq!(docs.len(), 5);
    for doc in &docs {
        assert_eq!(doc.get_string("Status").as_deref(), Some("Pending"));
        let ticks = match doc.get("CreatedDate") {
            Some(Value::DateTime(t)) => *t,
            other => panic!("bad CreatedDate: {:?}", other),
        };
        assert!((d1..=d2).contains(&ticks));
    }
}

#[test]
fn test_better_scoring_index_wins() {
    let (db, _dir) = setup_orders();

    // One equality on Customer scores below equality + range on the
    // compound index.
    let explanation = db
        .query("Order")
        .where_eq("Status", Value::String("Pending".into()))
        .where_eq("Customer", Value::String("c1".into()))
        .r#where("CreatedDate", FilterOp::Ge, Value::DateTime(0))
        .explain()
        .unwrap();
    assert_eq!(explanation.indexed_field.as_deref(), Some("Status_CreatedDate"));
    assert_eq!(explanation.filters_used_by_index, 2);
    assert_eq!(explanation.filters_applied_after_scan, 1);
}

#[test]
fn test_id_bounds_beat_secondary_indexes() {
    let (db, _dir) = setup_orders();
    let explanation = db
        .query("Order")
        .where_eq("Status", Value::String("Pending".into()))
        .r#where("_id", FilterOp::Le, Value::Int64(10))
        .explain()
        .unwrap();
    assert_eq!(explanation.scan_type, ScanType::PrimaryKeyRange);
    assert_eq!(explanation.indexed_field.as_deref(), Some("_id"));
    assert_eq!(explanation.filters_used_by_index, 1);
    assert_eq!(explanation.filters_applied_after_scan, 1);

    let count = db
        .query("Order")
        .where_eq("Status", Value::String("Pending".into()))
        .r#where("_id", FilterOp::Le, Value::Int64(10))
        .count()
        .unwrap();
    assert_eq!(count, 5);
}

#[test]
fn test_unconstrained_query_is_full_scan() {
    let (db, _dir) = setup_orders();
    let explanation = db.query("Order").explain().unwrap();
    assert_eq!(explanation.scan_type, ScanType::FullScan);
    assert_eq!(explanation.total_filters, 0);
    assert_eq!(explanation.filters_used_by_index, 0);
}

#[test]
fn test_non_leading_compound_field_cannot_use_index() {
    let (db, _dir) = setup_orders();
    let explanation = db
        .query("Order")
        .r#where("CreatedDate", FilterOp::Ge, Value::DateTime(0))
        .explain()
        .unwrap();
    assert_eq!(explanation.scan_type, ScanType::FullScan);
    assert_eq!(explanation.filters_applied_after_scan, 1);
}

#[test]
fn test_explain_does_not_execute() {
    let (db, _dir) = setup_orders();
    // An index probe on a type the encoder rejects at execution time still
    // explains cleanly.
    let explanation = db
        .query("Order")
        .where_eq("Customer", Value::String("c0".into()))
        .explain()
        .unwrap();
    assert_eq!(explanation.scan_type, ScanType::SecondaryIndex);
    assert_eq!(explanation.indexed_field.as_deref(), Some("Customer"));
    assert!(!explanation.scan_description.is_empty());
}
