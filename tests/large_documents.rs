use galdrdb::{Db, DbOptions, Document, Value};
use tempfile::TempDir;

fn setup_db() -> (Db, TempDir) {
    let dir = TempDir::new().unwrap();
    let db = Db::create(dir.path().join("test.db"), DbOptions::default()).unwrap();
    (db, dir)
}

fn blob_doc(marker: u8, len: usize) -> Document {
    let blob: Vec<u8> = (0..len).map(|i| marker.wrapping_add((i % 251) as u8)).collect();
    Document::new().set("Data", Value::Bytes(blob))
}

#[test]
fn test_document_spanning_many_pages() {
    let (db, _dir) = setup_db();

    let doc = blob_doc(1, 100_000);
    let id = db.insert_dynamic("Blob", &mut doc.clone()).unwrap();

    let mut expected = doc;
    expected.set_id(id);
    let loaded = db.get_by_id_dynamic("Blob", id).unwrap().unwrap();
    assert_eq!(loaded, expected);
}

#[test]
fn test_large_document_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("test.db");

    let doc = blob_doc(7, 60_000);
    {
        let db = Db::create(&path, DbOptions::default()).unwrap();
        db.insert_dynamic("Blob", &mut doc.clone()).unwrap();
    }
    let db = Db::open(&path, DbOptions::default()).unwrap();
    let loaded = db.get_by_id_dynamic("Blob", 1).unwrap().unwrap();
    assert_eq!(loaded.get("Data"), doc.get("Data"));
}

#[test]
fn test_replace_small_with_large_and_back() {
    let (db, _dir) = setup_db();

    let id = db
        .insert_dynamic("Blob", &mut Document::new().set("Data", Value::Bytes(vec![1, 2, 3])))
        .unwrap();

    let big = blob_doc(3, 80_000);
    let mut replacement = big.clone();
    replacement.set_id(id);
    assert!(db.replace_dynamic("Blob", &replacement).unwrap());
    let loaded = db.get_by_id_dynamic("Blob", id).unwrap().unwrap();
    assert_eq!(loaded.get("Data"), big.get("Data"));

    let mut small = Document::with_id(id).set("Data", Value::Bytes(vec![9]));
    assert!(db.replace_dynamic("Blob", &small).unwrap());
    small.set_id(id);
    let loaded = db.get_by_id_dynamic("Blob", id).unwrap().unwrap();
    assert_eq!(loaded.get("Data"), Some(&Value::Bytes(vec![9])));
}

#[test]
fn test_delete_large_document_releases_pages() {
    let (db, _dir) = setup_db();

    let id = db.insert_dynamic("Blob", &mut blob_doc(5, 150_000)).unwrap();
    let info_before = db.get_collection_info("Blob").unwrap().unwrap();
    assert_eq!(info_before.document_count, 1);

    assert!(db.delete_by_id_dynamic("Blob", id).unwrap());
    assert_eq!(db.get_collection_info("Blob").unwrap().unwrap().document_count, 0);

    // Freed chain pages get reused instead of growing the file further.
    let id2 = db.insert_dynamic("Blob", &mut blob_doc(6, 150_000)).unwrap();
    assert!(db.get_by_id_dynamic("Blob", id2).unwrap().is_some());
}

#[test]
fn test_many_small_documents_share_pages() {
    let (db, _dir) = setup_db();
    for i in 0..500 {
        db.insert_dynamic(
            "Small",
            &mut Document::new().set("N", Value::Int32(i)),
        )
        .unwrap();
    }
    assert_eq!(db.query("Small").count().unwrap(), 500);
    let doc = db.get_by_id_dynamic("Small", 250).unwrap().unwrap();
    assert_eq!(doc.get_int32("N"), Some(249));
}
