use tempfile::NamedTempFile;

use rand::prelude::SliceRandom;
use rand::Rng;
use radarstore::{Config, Database, FieldType, ObjectSchema, RowId, Value};
use std::path::Path;
use std::time::SystemTime;

const ITERATIONS: usize = 3;
const ELEMENTS: usize = 100_000;

/// Returns pairs of key, note
fn gen_data(count: usize, key_size: usize, note_size: usize) -> Vec<(String, String)> {
    let mut pairs = vec![];

    for _ in 0..count {
        let key: String = (0..key_size)
            .map(|_| rand::thread_rng().gen_range(b'a'..=b'z') as char)
            .collect();
        let note: String = (0..note_size)
            .map(|_| rand::thread_rng().gen_range(b'a'..=b'z') as char)
            .collect();
        pairs.push((key, note));
    }

    pairs
}

fn store_bench(path: &Path) {
    let schema = ObjectSchema::builder("Entry")
        .primary_key("Key", FieldType::String)
        .field("Value", FieldType::Int)
        .field("Note", FieldType::String)
        .build();
    let config = Config::default().with_fsync(false);
    let db = unsafe { Database::open_with_config(path, &[schema], config).unwrap() };

    let pairs = gen_data(1000, 16, 500);

    let start = SystemTime::now();
    let mut txn = db.begin_write().unwrap();
    {
        for i in 0..ELEMENTS {
            let (key, note) = &pairs[i % pairs.len()];
            txn.insert(
                "Entry",
                [
                    ("Key", Value::String(format!("{key}{i}"))),
                    ("Value", Value::Int(i as i64)),
                    ("Note", Value::from(note.as_str())),
                ],
            )
            .unwrap();
        }
    }
    txn.commit().unwrap();

    let end = SystemTime::now();
    let duration = end.duration_since(start).unwrap();
    println!(
        "radarstore: Loaded {} items in {}ms",
        ELEMENTS,
        duration.as_millis()
    );

    let mut key_order: Vec<usize> = (0..ELEMENTS).collect();
    key_order.shuffle(&mut rand::thread_rng());

    let snapshot = db.snapshot();
    {
        for _ in 0..ITERATIONS {
            let start = SystemTime::now();
            let mut checksum = 0u64;
            let mut expected_checksum = 0u64;
            for i in &key_order {
                let (key, note) = &pairs[*i % pairs.len()];
                let row = snapshot
                    .lookup_by_key("Entry", format!("{key}{i}"))
                    .unwrap()
                    .unwrap();
                let record = snapshot.get("Entry", row).unwrap();
                let result = record.value::<String>("Note").unwrap();
                checksum += result.as_bytes()[0] as u64;
                expected_checksum += note.as_bytes()[0] as u64;
            }
            assert_eq!(checksum, expected_checksum);
            let end = SystemTime::now();
            let duration = end.duration_since(start).unwrap();
            println!(
                "radarstore: Random read {} items in {}ms",
                ELEMENTS,
                duration.as_millis()
            );
        }
    }

    let start = SystemTime::now();
    let count = snapshot
        .filter("Entry", |entry| {
            entry.value::<i64>("Value").map_or(false, |v| v % 2 == 0)
        })
        .unwrap()
        .count();
    assert_eq!(count, ELEMENTS / 2);
    let end = SystemTime::now();
    let duration = end.duration_since(start).unwrap();
    println!(
        "radarstore: Filtered {} items in {}ms",
        ELEMENTS,
        duration.as_millis()
    );

    let start = SystemTime::now();
    db.write(|txn| {
        for i in key_order.iter().take(ELEMENTS / 10) {
            txn.delete("Entry", RowId(*i as u64))?;
        }
        Ok(())
    })
    .unwrap();
    let end = SystemTime::now();
    let duration = end.duration_since(start).unwrap();
    println!(
        "radarstore: Deleted {} items in {}ms",
        ELEMENTS / 10,
        duration.as_millis()
    );
}

fn main() {
    {
        let tmpfile: NamedTempFile = NamedTempFile::new().unwrap();
        store_bench(tmpfile.path());
    }
}
