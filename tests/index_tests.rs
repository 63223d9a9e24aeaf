use galdrdb::{Db, DbOptions, Document, FilterOp, GaldrError, Value};
use tempfile::TempDir;

fn setup_db() -> (Db, TempDir) {
    let dir = TempDir::new().unwrap();
    let db = Db::create(dir.path().join("test.db"), DbOptions::default()).unwrap();
    (db, dir)
}

fn employee(department: &str, number: &str) -> Document {
    Document::new()
        .set("Department", Value::String(department.into()))
        .set("EmployeeNumber", Value::String(number.into()))
}

fn setup_employees() -> (Db, TempDir) {
    let (db, dir) = setup_db();
    db.ensure_collection_dynamic("Employee").unwrap();
    assert!(db
        .ensure_index("Employee", &["Department", "EmployeeNumber"], true)
        .unwrap());
    (db, dir)
}

#[test]
fn test_unique_compound_index() {
    let (db, _dir) = setup_employees();

    let first = db.insert_dynamic("Employee", &mut employee("Eng", "001")).unwrap();

    let err = db
        .insert_dynamic("Employee", &mut employee("Eng", "001"))
        .unwrap_err();
    assert!(matches!(err, GaldrError::UniqueViolation { ref index } if index == "Department_EmployeeNumber"));

    // A different department with the same number is fine.
    db.insert_dynamic("Employee", &mut employee("Mkt", "001")).unwrap();

    // Delete the first, then the key is free again.
    assert!(db.delete_by_id_dynamic("Employee", first).unwrap());
    db.insert_dynamic("Employee", &mut employee("Eng", "001")).unwrap();
}

#[test]
fn test_unique_violation_aborts_whole_transaction() {
    let (db, _dir) = setup_employees();
    db.insert_dynamic("Employee", &mut employee("Eng", "007")).unwrap();

    let mut tx = db.begin_transaction().unwrap();
    tx.insert_dynamic("Employee", &mut employee("Sales", "100")).unwrap();
    tx.insert_dynamic("Employee", &mut employee("Eng", "007")).unwrap();
    let err = tx.commit().unwrap_err();
    assert!(matches!(err, GaldrError::UniqueViolation { .. }));

    // Nothing from the aborted transaction landed.
    assert_eq!(
        db.query("Employee")
            .where_eq("Department", Value::String("Sales".into()))
            .count()
            .unwrap(),
        0
    );
}

#[test]
fn test_unique_check_spots_in_transaction_duplicates() {
    let (db, _dir) = setup_employees();
    let mut tx = db.begin_transaction().unwrap();
    tx.insert_dynamic("Employee", &mut employee("Eng", "042")).unwrap();
    tx.insert_dynamic("Employee", &mut employee("Eng", "042")).unwrap();
    assert!(matches!(
        tx.commit().unwrap_err(),
        GaldrError::UniqueViolation { .. }
    ));
}

#[test]
fn test_same_transaction_delete_frees_unique_key() {
    let (db, _dir) = setup_employees();
    let id = db.insert_dynamic("Employee", &mut employee("Eng", "055")).unwrap();

    let mut tx = db.begin_transaction().unwrap();
    assert!(tx.delete_by_id_dynamic("Employee", id).unwrap());
    tx.insert_dynamic("Employee", &mut employee("Eng", "055")).unwrap();
    tx.commit().unwrap();

    assert_eq!(
        db.query("Employee")
            .where_eq("Department", Value::String("Eng".into()))
            .count()
            .unwrap(),
        1
    );
}

#[test]
fn test_nulls_exempt_from_unique() {
    let (db, _dir) = setup_db();
    db.ensure_collection_dynamic("Badge").unwrap();
    db.ensure_index("Badge", &["Serial"], true).unwrap();

    // Two documents without the field coexist under a unique index.
    db.insert_dynamic("Badge", &mut Document::new().set("Label", Value::String("a".into())))
        .unwrap();
    db.insert_dynamic("Badge", &mut Document::new().set("Label", Value::String("b".into())))
        .unwrap();
    db.insert_dynamic(
        "Badge",
        &mut Document::new().set("Serial", Value::String("S1".into())),
    )
    .unwrap();
    let err = db
        .insert_dynamic(
            "Badge",
            &mut Document::new().set("Serial", Value::String("S1".into())),
        )
        .unwrap_err();
    assert!(matches!(err, GaldrError::UniqueViolation { .. }));
}

#[test]
fn test_secondary_index_consistency_through_updates() {
    let (db, _dir) = setup_db();
    db.ensure_collection_dynamic("Item").unwrap();
    db.ensure_index("Item", &["Color"], false).unwrap();

    let mut ids = Vec::new();
    for color in ["red", "blue", "red", "green", "blue", "red"] {
        let id = db
            .insert_dynamic("Item", &mut Document::new().set("Color", Value::String(color.into())))
            .unwrap();
        ids.push(id);
    }

    let reds = db
        .query("Item")
        .where_eq("Color", Value::String("red".into()))
        .to_documents()
        .unwrap();
    assert_eq!(reds.len(), 3);

    // Moving a document between keys updates the index.
    assert!(db
        .update_by_id_dynamic("Item", ids[0])
        .set("Color", Value::String("blue".into()))
        .execute()
        .unwrap());
    assert_eq!(
        db.query("Item").where_eq("Color", Value::String("red".into())).count().unwrap(),
        2
    );
    assert_eq!(
        db.query("Item").where_eq("Color", Value::String("blue".into())).count().unwrap(),
        3
    );

    // Deleting removes the entry.
    db.delete_by_id_dynamic("Item", ids[1]).unwrap();
    assert_eq!(
        db.query("Item").where_eq("Color", Value::String("blue".into())).count().unwrap(),
        2
    );
}

#[test]
fn test_index_backfill_covers_existing_documents() {
    let (db, _dir) = setup_db();
    for age in [30, 40, 30, 50] {
        db.insert_dynamic("Person", &mut Document::new().set("Age", Value::Int32(age)))
            .unwrap();
    }

    // Index created after the fact still finds everything.
    assert!(db.ensure_index("Person", &["Age"], false).unwrap());
    let explanation = db
        .query("Person")
        .where_eq("Age", Value::Int32(30))
        .explain()
        .unwrap();
    assert_eq!(explanation.scan_type, galdrdb::ScanType::SecondaryIndex);
    assert_eq!(
        db.query("Person").where_eq("Age", Value::Int32(30)).count().unwrap(),
        2
    );
}

#[test]
fn test_backfill_unique_rejects_existing_duplicates() {
    let (db, _dir) = setup_db();
    for serial in ["a", "b", "a"] {
        db.insert_dynamic(
            "Part",
            &mut Document::new().set("Serial", Value::String(serial.into())),
        )
        .unwrap();
    }
    let err = db.ensure_index("Part", &["Serial"], true).unwrap_err();
    assert!(matches!(err, GaldrError::UniqueViolation { .. }));
}

#[test]
fn test_drop_index_falls_back_to_full_scan() {
    let (db, _dir) = setup_db();
    db.ensure_collection_dynamic("Item").unwrap();
    db.ensure_index("Item", &["Color"], false).unwrap();
    db.insert_dynamic("Item", &mut Document::new().set("Color", Value::String("red".into())))
        .unwrap();

    assert!(db.drop_index("Item", "Color").unwrap());
    assert!(!db.drop_index("Item", "Color").unwrap());
    assert!(db.get_indexes("Item").is_empty());

    let explanation = db
        .query("Item")
        .where_eq("Color", Value::String("red".into()))
        .explain()
        .unwrap();
    assert_eq!(explanation.scan_type, galdrdb::ScanType::FullScan);
    assert_eq!(
        db.query("Item").where_eq("Color", Value::String("red".into())).count().unwrap(),
        1
    );
}

#[test]
fn test_indexed_string_rejects_embedded_nul() {
    let (db, _dir) = setup_db();
    db.ensure_collection_dynamic("Item").unwrap();
    db.ensure_index("Item", &["Name"], false).unwrap();
    let err = db
        .insert_dynamic(
            "Item",
            &mut Document::new().set("Name", Value::String("a\0b".into())),
        )
        .unwrap_err();
    assert!(matches!(err, GaldrError::InvalidArgument(_)));
    assert_eq!(db.query("Item").count().unwrap(), 0);
}

#[test]
fn test_where_in_uses_probe_values() {
    let (db, _dir) = setup_db();
    db.ensure_collection_dynamic("Item").unwrap();
    db.ensure_index("Item", &["Color"], false).unwrap();
    for color in ["red", "blue", "green", "cyan"] {
        db.insert_dynamic("Item", &mut Document::new().set("Color", Value::String(color.into())))
            .unwrap();
    }

    let hits = db
        .query("Item")
        .where_in(
            "Color",
            vec![Value::String("red".into()), Value::String("cyan".into())],
        )
        .to_documents()
        .unwrap();
    assert_eq!(hits.len(), 2);

    let rest = db
        .query("Item")
        .where_not_in(
            "Color",
            vec![Value::String("red".into()), Value::String("cyan".into())],
        )
        .to_documents()
        .unwrap();
    assert_eq!(rest.len(), 2);

    // Mixed with an equality filter the probes act as residuals.
    let none = db
        .query("Item")
        .where_eq("Color", Value::String("red".into()))
        .where_in("Color", vec![Value::String("blue".into())])
        .count()
        .unwrap();
    assert_eq!(none, 0);
}

#[test]
fn test_filter_op_variants() {
    let (db, _dir) = setup_db();
    for age in [10, 20, 30, 40] {
        db.insert_dynamic("P", &mut Document::new().set("Age", Value::Int32(age)))
            .unwrap();
    }
    let q = |op, v: i32| {
        db.query("P")
            .r#where("Age", op, Value::Int32(v))
            .count()
            .unwrap()
    };
    assert_eq!(q(FilterOp::Lt, 30), 2);
    assert_eq!(q(FilterOp::Le, 30), 3);
    assert_eq!(q(FilterOp::Gt, 30), 1);
    assert_eq!(q(FilterOp::Ge, 30), 2);
    assert_eq!(q(FilterOp::Ne, 30), 3);
}
