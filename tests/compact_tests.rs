use galdrdb::{Db, DbOptions, Document, Value};
use tempfile::TempDir;

fn person(name: &str, age: i32) -> Document {
    Document::new()
        .set("Name", Value::String(name.into()))
        .set("Age", Value::Int32(age))
}

#[test]
fn test_compact_preserves_documents_ids_and_indexes() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("source.db");
    let target = dir.path().join("compacted.db");

    {
        let db = Db::create(&path, DbOptions::default()).unwrap();
        db.ensure_collection_dynamic("Person").unwrap();
        db.ensure_index("Person", &["Name"], false).unwrap();
        let padding = "x".repeat(2000);
        for i in 0..200 {
            let mut doc = person(&format!("p{}", i), i)
                .set("Pad", Value::String(padding.clone()));
            db.insert_dynamic("Person", &mut doc).unwrap();
        }
        for id in 1..=150 {
            db.delete_by_id_dynamic("Person", id).unwrap();
        }
        db.checkpoint().unwrap();

        let result = db.compact_to(&target).unwrap();
        assert_eq!(result.collections, 1);
        assert_eq!(result.documents_copied, 50);
        assert!(result.bytes_saved > 0, "dead space should shrink the file");
    }

    let db = Db::open(&target, DbOptions::default()).unwrap();
    assert_eq!(db.query("Person").count().unwrap(), 50);

    // Ids survive compaction verbatim.
    let doc = db.get_by_id_dynamic("Person", 180).unwrap().unwrap();
    assert_eq!(doc.get_string("Name").as_deref(), Some("p179"));
    assert!(db.get_by_id_dynamic("Person", 150).unwrap().is_none());

    // Indexes were rebuilt and are used.
    let explanation = db
        .query("Person")
        .where_eq("Name", Value::String("p179".into()))
        .explain()
        .unwrap();
    assert_eq!(explanation.scan_type, galdrdb::ScanType::SecondaryIndex);
    assert_eq!(
        db.query("Person").where_eq("Name", Value::String("p179".into())).count().unwrap(),
        1
    );

    // The id watermark continues past the old maximum.
    let next = db.insert_dynamic("Person", &mut person("fresh", 1)).unwrap();
    assert_eq!(next, 201);
}

#[test]
fn test_compact_multiple_collections() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("source.db");
    let target = dir.path().join("compacted.db");

    {
        let db = Db::create(&path, DbOptions::default()).unwrap();
        for i in 0..10 {
            db.insert_dynamic("A", &mut person(&format!("a{}", i), i)).unwrap();
            db.insert_dynamic("B", &mut person(&format!("b{}", i), i)).unwrap();
        }
        let result = db.compact_to(&target).unwrap();
        assert_eq!(result.collections, 2);
        assert_eq!(result.documents_copied, 20);
    }

    let db = Db::open(&target, DbOptions::default()).unwrap();
    let mut names = db.collection_names();
    names.sort();
    assert_eq!(names, vec!["A".to_string(), "B".to_string()]);
    assert_eq!(db.query("A").count().unwrap(), 10);
    assert_eq!(db.query("B").count().unwrap(), 10);
}

#[test]
fn test_compact_refuses_existing_target() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("source.db");
    let target = dir.path().join("existing.db");
    std::fs::write(&target, b"already here").unwrap();

    let db = Db::create(&path, DbOptions::default()).unwrap();
    assert!(db.compact_to(&target).is_err());
}

#[test]
fn test_compact_empty_database() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("source.db");
    let target = dir.path().join("compacted.db");

    let db = Db::create(&path, DbOptions::default()).unwrap();
    let result = db.compact_to(&target).unwrap();
    assert_eq!(result.collections, 0);
    assert_eq!(result.documents_copied, 0);
    drop(db);

    let db = Db::open(&target, DbOptions::default()).unwrap();
    assert!(db.collection_names().is_empty());
}
