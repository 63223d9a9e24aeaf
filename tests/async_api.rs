use galdrdb::{Db, DbOptions, Document, Value};
use tempfile::TempDir;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Runtime::new().unwrap()
}

#[test]
fn test_async_open_insert_checkpoint() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("test.db");
    let rt = runtime();

    rt.block_on(async {
        let db = Db::create_async(path.clone(), DbOptions::default()).await.unwrap();
        let mut tx = db.begin_transaction().unwrap();
        tx.insert_dynamic(
            "Person",
            &mut Document::new().set("Name", Value::String("Async".into())),
        )
        .unwrap();
        tx.commit_async().await.unwrap();
        db.checkpoint_async().await.unwrap();
        drop(db);

        let db = Db::open_async(path.clone(), DbOptions::default()).await.unwrap();
        let doc = db.get_by_id_dynamic("Person", 1).unwrap().unwrap();
        assert_eq!(doc.get_string("Name").as_deref(), Some("Async"));
    });
}

#[test]
fn test_async_compact() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("test.db");
    let target = dir.path().join("compacted.db");
    let rt = runtime();

    rt.block_on(async {
        let db = Db::create(&path, DbOptions::default()).unwrap();
        for i in 0..10 {
            db.insert_dynamic(
                "Person",
                &mut Document::new().set("N", Value::Int32(i)),
            )
            .unwrap();
        }
        let result = db.compact_to_async(target.clone()).await.unwrap();
        assert_eq!(result.documents_copied, 10);
    });

    let db = Db::open(&target, DbOptions::default()).unwrap();
    assert_eq!(db.query("Person").count().unwrap(), 10);
}
