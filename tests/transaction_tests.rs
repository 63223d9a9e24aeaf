use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use galdrdb::{Db, DbOptions, Document, GaldrError, Value};
use tempfile::TempDir;

fn setup_db() -> (Db, TempDir) {
    let dir = TempDir::new().unwrap();
    let db = Db::create(dir.path().join("test.db"), DbOptions::default()).unwrap();
    (db, dir)
}

fn person(name: &str) -> Document {
    Document::new().set("Name", Value::String(name.into()))
}

#[test]
fn test_commit_makes_writes_visible() {
    let (db, _dir) = setup_db();

    let mut tx = db.begin_transaction().unwrap();
    let id = tx.insert_dynamic("Person", &mut person("Alice")).unwrap();
    tx.commit().unwrap();

    assert!(db.get_by_id_dynamic("Person", id).unwrap().is_some());
}

#[test]
fn test_rollback_discards_writes() {
    let (db, _dir) = setup_db();
    let id0 = db.insert_dynamic("Person", &mut person("Base")).unwrap();

    let tx_id;
    {
        let mut tx = db.begin_transaction().unwrap();
        tx_id = tx.insert_dynamic("Person", &mut person("Ghost")).unwrap();
        tx.rollback().unwrap();
    }

    assert!(db.get_by_id_dynamic("Person", id0).unwrap().is_some());
    assert!(db.get_by_id_dynamic("Person", tx_id).unwrap().is_none());
    assert_eq!(db.query("Person").count().unwrap(), 1);
}

#[test]
fn test_drop_rolls_back() {
    let (db, _dir) = setup_db();
    let id;
    {
        let mut tx = db.begin_transaction().unwrap();
        id = tx.insert_dynamic("Person", &mut person("Dropped")).unwrap();
        // Transaction dropped without commit.
    }
    assert!(db.get_by_id_dynamic("Person", id).unwrap().is_none());
}

#[test]
fn test_read_your_writes() {
    let (db, _dir) = setup_db();

    let mut tx = db.begin_transaction().unwrap();
    let id = tx.insert_dynamic("Person", &mut person("Mine")).unwrap();

    // Visible inside the transaction, invisible outside.
    assert!(tx.get_by_id_dynamic("Person", id).unwrap().is_some());
    assert!(db.get_by_id_dynamic("Person", id).unwrap().is_none());
    assert_eq!(tx.query("Person").count().unwrap(), 1);
    assert_eq!(db.query("Person").count().unwrap(), 0);

    tx.rollback().unwrap();
}

#[test]
fn test_snapshot_immutability() {
    let (db, _dir) = setup_db();
    let id = db.insert_dynamic("Person", &mut person("Alice")).unwrap();

    let mut reader = db.begin_read_only_transaction().unwrap();
    let before = reader.get_by_id_dynamic("Person", id).unwrap().unwrap();
    assert_eq!(before.get_string("Name").as_deref(), Some("Alice"));

    // Concurrent committed overwrite and delete.
    let mut replacement = Document::with_id(id).set("Name", Value::String("Zoe".into()));
    assert!(db.replace_dynamic("Person", &replacement).unwrap());
    replacement.put("Name", Value::String("Yve".into()));
    assert!(db.replace_dynamic("Person", &replacement).unwrap());

    let again = reader.get_by_id_dynamic("Person", id).unwrap().unwrap();
    assert_eq!(again.get_string("Name").as_deref(), Some("Alice"));
    assert_eq!(reader.query("Person").count().unwrap(), 1);

    db.delete_by_id_dynamic("Person", id).unwrap();
    let still = reader.get_by_id_dynamic("Person", id).unwrap().unwrap();
    assert_eq!(still.get_string("Name").as_deref(), Some("Alice"));
    // The snapshot-era document also still shows up in scans.
    assert_eq!(reader.query("Person").count().unwrap(), 1);
    drop(reader);

    assert_eq!(db.query("Person").count().unwrap(), 0);
}

#[test]
fn test_snapshot_hides_later_inserts() {
    let (db, _dir) = setup_db();
    db.insert_dynamic("Person", &mut person("First")).unwrap();

    let mut reader = db.begin_read_only_transaction().unwrap();
    let late = db.insert_dynamic("Person", &mut person("Late")).unwrap();

    assert!(reader.get_by_id_dynamic("Person", late).unwrap().is_none());
    assert_eq!(reader.query("Person").count().unwrap(), 1);
    drop(reader);
    assert_eq!(db.query("Person").count().unwrap(), 2);
}

#[test]
fn test_write_conflict_on_same_document() {
    let (db, _dir) = setup_db();
    let id = db.insert_dynamic("Person", &mut person("Orig")).unwrap();

    let mut t1 = db.begin_transaction().unwrap();
    let mut t2 = db.begin_transaction().unwrap();

    let doc1 = Document::with_id(id).set("Name", Value::String("FromT1".into()));
    let doc2 = Document::with_id(id).set("Name", Value::String("FromT2".into()));
    assert!(t1.replace_dynamic("Person", &doc1).unwrap());
    assert!(t2.replace_dynamic("Person", &doc2).unwrap());

    t1.commit().unwrap();
    let err = t2.commit().unwrap_err();
    assert!(matches!(err, GaldrError::WriteConflict { .. }));

    let winner = db.get_by_id_dynamic("Person", id).unwrap().unwrap();
    assert_eq!(winner.get_string("Name").as_deref(), Some("FromT1"));
}

#[test]
fn test_non_overlapping_transactions_both_commit() {
    let (db, _dir) = setup_db();
    let a = db.insert_dynamic("Person", &mut person("A")).unwrap();
    let b = db.insert_dynamic("Person", &mut person("B")).unwrap();

    let mut t1 = db.begin_transaction().unwrap();
    let mut t2 = db.begin_transaction().unwrap();
    assert!(t1
        .replace_dynamic("Person", &Document::with_id(a).set("Name", Value::String("A2".into())))
        .unwrap());
    assert!(t2
        .replace_dynamic("Person", &Document::with_id(b).set("Name", Value::String("B2".into())))
        .unwrap());
    t1.commit().unwrap();
    t2.commit().unwrap();

    assert_eq!(
        db.get_by_id_dynamic("Person", a).unwrap().unwrap().get_string("Name").as_deref(),
        Some("A2")
    );
    assert_eq!(
        db.get_by_id_dynamic("Person", b).unwrap().unwrap().get_string("Name").as_deref(),
        Some("B2")
    );
}

#[test]
fn test_concurrent_replacers_exactly_one_winner_per_round() {
    let (db, _dir) = setup_db();
    let id = db.insert_dynamic("Person", &mut person("Start")).unwrap();

    let commits = Arc::new(AtomicUsize::new(0));
    let conflicts = Arc::new(AtomicUsize::new(0));

    let threads: Vec<_> = (0..4)
        .map(|n| {
            let db = db.clone();
            let commits = Arc::clone(&commits);
            let conflicts = Arc::clone(&conflicts);
            std::thread::spawn(move || {
                for round in 0..10 {
                    let mut tx = match db.begin_transaction() {
                        Ok(tx) => tx,
                        Err(_) => continue,
                    };
                    let doc = Document::with_id(id)
                        .set("Name", Value::String(format!("w{}-{}", n, round)));
                    match tx.replace_dynamic("Person", &doc) {
                        Ok(true) => {}
                        _ => continue,
                    }
                    match tx.commit() {
                        Ok(()) => {
                            commits.fetch_add(1, Ordering::SeqCst);
                        }
                        Err(GaldrError::WriteConflict { .. }) => {
                            conflicts.fetch_add(1, Ordering::SeqCst);
                        }
                        Err(e) => panic!("unexpected error: {}", e),
                    }
                }
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }

    assert!(commits.load(Ordering::SeqCst) >= 1);
    // The document survived the storm and carries a winner's payload.
    let survivor = db.get_by_id_dynamic("Person", id).unwrap().unwrap();
    assert!(survivor.get_string("Name").unwrap().starts_with('w'));
}

#[test]
fn test_commit_then_rollback_sequence() {
    let (db, _dir) = setup_db();
    let mut tx = db.begin_transaction().unwrap();
    let kept = tx.insert_dynamic("Person", &mut person("X")).unwrap();
    tx.commit().unwrap();

    let mut dead = db.begin_transaction().unwrap();
    let discarded = dead.insert_dynamic("Person", &mut person("Y")).unwrap();
    dead.rollback().unwrap();

    assert!(db.get_by_id_dynamic("Person", kept).unwrap().is_some());
    assert!(db.get_by_id_dynamic("Person", discarded).unwrap().is_none());
}

#[test]
fn test_read_only_transaction_rejects_writes() {
    let (db, _dir) = setup_db();
    db.insert_dynamic("Person", &mut person("R")).unwrap();
    let mut tx = db.begin_read_only_transaction().unwrap();
    let err = tx.insert_dynamic("Person", &mut person("W")).unwrap_err();
    assert!(matches!(err, GaldrError::InvalidArgument(_)));
    assert!(tx.get_by_id_dynamic("Person", 1).unwrap().is_some());
}

#[test]
fn test_delete_then_insert_same_id_in_transaction() {
    let (db, _dir) = setup_db();
    let id = db.insert_dynamic("Person", &mut person("Old")).unwrap();

    let mut tx = db.begin_transaction().unwrap();
    assert!(tx.delete_by_id_dynamic("Person", id).unwrap());
    assert!(tx.get_by_id_dynamic("Person", id).unwrap().is_none());
    let mut doc = person("New");
    doc.set_id(id);
    assert_eq!(tx.insert_dynamic("Person", &mut doc).unwrap(), id);
    tx.commit().unwrap();

    let loaded = db.get_by_id_dynamic("Person", id).unwrap().unwrap();
    assert_eq!(loaded.get_string("Name").as_deref(), Some("New"));
}
