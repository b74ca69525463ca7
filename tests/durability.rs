use rand::prelude::SliceRandom;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use radarstore::{Config, Database, Error, FieldType, ObjectSchema, RowId, Value};
use std::collections::BTreeMap;
use std::io::Write;
use tempfile::NamedTempFile;

fn entry_schema() -> ObjectSchema {
    ObjectSchema::builder("Entry")
        .primary_key("Key", FieldType::String)
        .field("Value", FieldType::Int)
        .field("Note", FieldType::String)
        .build()
}

fn config() -> Config {
    Config::default()
        .with_page_size(1024)
        .with_region_size(64 * 1024 * 1024)
        .with_fsync(false)
}

fn open(tmpfile: &NamedTempFile, schemas: &[ObjectSchema]) -> radarstore::Result<Database> {
    unsafe { Database::open_with_config(tmpfile.path(), schemas, config()) }
}

fn entry(key: &str, value: i64, note: &str) -> [(&'static str, Value); 3] {
    [
        ("Key", Value::from(key)),
        ("Value", Value::Int(value)),
        ("Note", Value::from(note)),
    ]
}

#[test]
fn reopen() {
    let tmpfile: NamedTempFile = NamedTempFile::new().unwrap();
    let txn_id = {
        let db = open(&tmpfile, &[entry_schema()]).unwrap();
        db.write(|txn| {
            txn.insert("Entry", entry("hello", 1, "first"))?;
            txn.insert("Entry", entry("world", 2, "second"))?;
            Ok(())
        })
        .unwrap();
        db.snapshot().txn_id()
    };

    let db = open(&tmpfile, &[entry_schema()]).unwrap();
    let snapshot = db.snapshot();
    assert_eq!(snapshot.txn_id(), txn_id);
    let row = snapshot.lookup_by_key("Entry", "world").unwrap().unwrap();
    let record = snapshot.get("Entry", row).unwrap();
    assert_eq!(record.value::<i64>("Value").unwrap(), 2);
    assert_eq!(record.value::<String>("Note").unwrap(), "second");
    // the page size comes from the file, not the configuration
    drop(snapshot);
    drop(db);
    let db = unsafe {
        Database::open_with_config(
            tmpfile.path(),
            &[entry_schema()],
            config().with_page_size(4096),
        )
        .unwrap()
    };
    assert_eq!(db.snapshot().len("Entry").unwrap(), 2);
}

#[test]
fn schema_changes_on_reopen() {
    let tmpfile: NamedTempFile = NamedTempFile::new().unwrap();
    {
        let db = open(&tmpfile, &[entry_schema()]).unwrap();
        db.write(|txn| txn.insert("Entry", entry("a", 1, ""))).unwrap();
    }

    let changed = ObjectSchema::builder("Entry")
        .primary_key("Key", FieldType::String)
        .field("Value", FieldType::Double)
        .field("Note", FieldType::String)
        .build();
    assert!(matches!(
        open(&tmpfile, &[changed]),
        Err(Error::SchemaMismatch(_))
    ));

    // a new type is added next to the stored ones
    let tag = ObjectSchema::builder("Tag")
        .field("Label", FieldType::String)
        .list("Entries", "Entry")
        .build();
    {
        let db = open(&tmpfile, &[tag.clone()]).unwrap();
        db.write(|txn| {
            txn.insert(
                "Tag",
                [
                    ("Label", Value::from("x")),
                    ("Entries", Value::List(vec![RowId(0)])),
                ],
            )
        })
        .unwrap();
        assert_eq!(db.snapshot().len("Entry").unwrap(), 1);
    }

    let db = open(&tmpfile, &[entry_schema(), tag]).unwrap();
    let names: Vec<String> = db.schemas().iter().map(|s| s.name().to_string()).collect();
    assert_eq!(names, vec!["Entry", "Tag"]);
    assert_eq!(db.check_integrity().unwrap().relationships, 1);
}

#[test]
fn rejects_broken_schemas() {
    let tmpfile: NamedTempFile = NamedTempFile::new().unwrap();
    let dangling = ObjectSchema::builder("Tag").link("Owner", "Nobody").build();
    assert!(matches!(
        open(&tmpfile, &[dangling]),
        Err(Error::SchemaMismatch(_))
    ));
    assert!(matches!(
        open(&tmpfile, &[entry_schema(), entry_schema()]),
        Err(Error::SchemaMismatch(_))
    ));
}

#[test]
fn rejects_foreign_files() {
    let mut tmpfile: NamedTempFile = NamedTempFile::new().unwrap();
    tmpfile.write_all(b"definitely not a database").unwrap();
    tmpfile.flush().unwrap();
    assert!(matches!(
        open(&tmpfile, &[entry_schema()]),
        Err(Error::Corrupted(_))
    ));

    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("missing.db");
    assert!(matches!(
        unsafe { Database::open_existing(&missing) },
        Err(Error::StorageFault(_))
    ));
    assert!(!missing.exists());
}

#[test]
fn rejects_invalid_config() {
    let tmpfile: NamedTempFile = NamedTempFile::new().unwrap();
    let result = unsafe {
        Database::open_with_config(
            tmpfile.path(),
            &[entry_schema()],
            Config::default().with_page_size(3000),
        )
    };
    assert!(matches!(result, Err(Error::InvalidConfig(_))));
}

#[test]
fn record_too_large() {
    let tmpfile: NamedTempFile = NamedTempFile::new().unwrap();
    let db = open(&tmpfile, &[entry_schema()]).unwrap();
    let huge = "x".repeat(10_000);

    let mut txn = db.begin_write().unwrap();
    assert!(matches!(
        txn.insert("Entry", entry("big", 1, &huge)),
        Err(Error::RecordTooLarge { .. })
    ));
    let row = txn.insert("Entry", entry("small", 1, "ok")).unwrap();
    assert!(matches!(
        txn.set_field("Entry", row, "Note", huge.as_str()),
        Err(Error::RecordTooLarge { .. })
    ));
    txn.commit().unwrap();
    let record = db.snapshot().get("Entry", row).unwrap();
    assert_eq!(record.value::<String>("Note").unwrap(), "ok");
}

#[test]
fn database_full() {
    let tmpfile: NamedTempFile = NamedTempFile::new().unwrap();
    let config = Config::default()
        .with_page_size(1024)
        .with_region_size(16 * 1024)
        .with_fsync(false);
    let db = unsafe { Database::open_with_config(tmpfile.path(), &[entry_schema()], config).unwrap() };
    db.write(|txn| txn.insert("Entry", entry("kept", 1, "still here")))
        .unwrap();

    let note = "n".repeat(150);
    let result = db.write(|txn| {
        for i in 0..200 {
            txn.insert("Entry", entry(&format!("key{i:04}"), i, &note))?;
        }
        Ok(())
    });
    assert!(matches!(result, Err(Error::DatabaseFull { .. })));

    // the failed commit left the last one intact
    let snapshot = db.snapshot();
    assert_eq!(snapshot.len("Entry").unwrap(), 1);
    assert!(snapshot.lookup_by_key("Entry", "kept").unwrap().is_some());
    drop(snapshot);
    db.write(|txn| txn.insert("Entry", entry("after", 2, ""))).unwrap();
    assert_eq!(db.check_integrity().unwrap().objects["Entry"], 2);
}

#[test]
fn random_workload() {
    let tmpfile: NamedTempFile = NamedTempFile::new().unwrap();
    let mut rng = StdRng::seed_from_u64(0x5eed);
    // key -> (row, value)
    let mut model: BTreeMap<String, (RowId, i64)> = BTreeMap::new();

    for round in 0..20 {
        let db = open(&tmpfile, &[entry_schema()]).unwrap();
        db.write(|txn| {
            for _ in 0..100 {
                let key = format!("key{:05}", rng.gen_range(0..2000));
                let value: i64 = rng.gen();
                let delete = rng.gen_bool(0.5);
                match model.get(&key).copied() {
                    Some((row, _)) if delete => {
                        txn.delete("Entry", row)?;
                        model.remove(&key);
                    }
                    Some((row, _)) => {
                        txn.set_field("Entry", row, "Value", value)?;
                        model.insert(key, (row, value));
                    }
                    None => {
                        let note = "z".repeat(rng.gen_range(0..100));
                        let row = txn.insert("Entry", entry(&key, value, &note))?;
                        model.insert(key, (row, value));
                    }
                }
            }
            Ok(())
        })
        .unwrap();

        let snapshot = db.snapshot();
        assert_eq!(snapshot.len("Entry").unwrap(), model.len() as u64);
        let mut sample: Vec<&String> = model.keys().collect();
        sample.shuffle(&mut rng);
        for key in sample.into_iter().take(50) {
            let (row, value) = model[key];
            assert_eq!(snapshot.lookup_by_key("Entry", key.as_str()).unwrap(), Some(row));
            let record = snapshot.get("Entry", row).unwrap();
            assert_eq!(record.value::<i64>("Value").unwrap(), value, "round {round}");
        }
        let report = db.check_integrity().unwrap();
        assert_eq!(report.objects["Entry"], model.len() as u64);
        assert!(report.tree.entries > 0);
    }

    // deleting everything leaves an index with no stale entries
    let db = open(&tmpfile, &[entry_schema()]).unwrap();
    db.write(|txn| {
        for (row, _) in model.values() {
            txn.delete("Entry", *row)?;
        }
        Ok(())
    })
    .unwrap();
    assert_eq!(db.snapshot().len("Entry").unwrap(), 0);
    assert_eq!(db.check_integrity().unwrap().objects["Entry"], 0);
}
