use radarstore::{Config, Database, Error, FieldType, ObjectSchema, RowId, Value};
use tempfile::NamedTempFile;

fn schemas() -> Vec<ObjectSchema> {
    vec![
        ObjectSchema::builder("Owner")
            .primary_key("Name", FieldType::String)
            .list("Pets", "Dog")
            .link("Favorite", "Dog")
            .build(),
        ObjectSchema::builder("Dog")
            .field("Name", FieldType::String)
            .link("Parent", "Dog")
            .build(),
    ]
}

fn open(tmpfile: &NamedTempFile) -> Database {
    let config = Config::default()
        .with_region_size(64 * 1024 * 1024)
        .with_fsync(false);
    unsafe { Database::open_with_config(tmpfile.path(), &schemas(), config).unwrap() }
}

fn name(value: &str) -> [(&'static str, Value); 1] {
    [("Name", Value::from(value))]
}

/// One owner with three dogs in its list, the second one its favorite.
fn populate(db: &Database) -> (RowId, Vec<RowId>) {
    db.write(|txn| {
        let owner = txn.insert("Owner", name("tim"))?;
        let dogs = ["fido", "rex", "spot"]
            .iter()
            .map(|dog| txn.insert("Dog", name(dog)))
            .collect::<radarstore::Result<Vec<_>>>()?;
        for dog in &dogs {
            txn.add_relation("Owner", owner, "Pets", *dog)?;
        }
        txn.add_relation("Owner", owner, "Favorite", dogs[1])?;
        Ok((owner, dogs))
    })
    .unwrap()
}

#[test]
fn add_and_remove_relations() {
    let tmpfile: NamedTempFile = NamedTempFile::new().unwrap();
    let db = open(&tmpfile);
    let (owner, dogs) = populate(&db);

    let snapshot = db.snapshot();
    assert_eq!(snapshot.related_rows("Owner", owner, "Pets").unwrap(), dogs);
    assert_eq!(
        snapshot.related_rows("Owner", owner, "Favorite").unwrap(),
        vec![dogs[1]]
    );

    db.write(|txn| {
        // lists keep duplicates and order
        txn.add_relation("Owner", owner, "Pets", dogs[0])?;
        assert_eq!(
            txn.related_rows("Owner", owner, "Pets")?,
            vec![dogs[0], dogs[1], dogs[2], dogs[0]]
        );
        assert!(txn.remove_relation("Owner", owner, "Pets", dogs[0])?);
        assert_eq!(
            txn.related_rows("Owner", owner, "Pets")?,
            vec![dogs[1], dogs[2], dogs[0]]
        );
        assert!(!txn.remove_relation("Owner", owner, "Favorite", dogs[0])?);
        assert!(txn.remove_relation("Owner", owner, "Favorite", dogs[1])?);
        assert!(txn.related_rows("Owner", owner, "Favorite")?.is_empty());
        // a link holds one target
        txn.add_relation("Owner", owner, "Favorite", dogs[2])?;
        txn.add_relation("Owner", owner, "Favorite", dogs[0])?;
        assert_eq!(txn.related_rows("Owner", owner, "Favorite")?, vec![dogs[0]]);
        Ok(())
    })
    .unwrap();

    // the earlier snapshot is unchanged
    assert_eq!(snapshot.related_rows("Owner", owner, "Pets").unwrap(), dogs);
    let latest = db.snapshot();
    assert_eq!(
        latest.related_rows("Owner", owner, "Pets").unwrap(),
        vec![dogs[1], dogs[2], dogs[0]]
    );
    assert_eq!(
        latest.get("Owner", owner).unwrap().value::<Option<RowId>>("Favorite").unwrap(),
        Some(dogs[0])
    );
    assert_eq!(db.check_integrity().unwrap().relationships, 4);
}

#[test]
fn relation_fields_are_checked() {
    let tmpfile: NamedTempFile = NamedTempFile::new().unwrap();
    let db = open(&tmpfile);
    let (owner, dogs) = populate(&db);

    let mut txn = db.begin_write().unwrap();
    assert!(matches!(
        txn.add_relation("Owner", owner, "Name", dogs[0]),
        Err(Error::SchemaMismatch(_))
    ));
    assert!(matches!(
        txn.related_rows("Owner", owner, "Missing"),
        Err(Error::SchemaMismatch(_))
    ));
    assert!(matches!(
        txn.add_relation("Owner", RowId(7), "Pets", dogs[0]),
        Err(Error::NotFound { .. })
    ));
    assert!(matches!(
        txn.add_relation("Cat", owner, "Pets", dogs[0]),
        Err(Error::UnknownType(_))
    ));
    txn.rollback();
}

#[test]
fn delete_unlinks_referrers() {
    let tmpfile: NamedTempFile = NamedTempFile::new().unwrap();
    let db = open(&tmpfile);
    let (owner, dogs) = populate(&db);
    db.write(|txn| txn.add_relation("Dog", dogs[2], "Parent", dogs[1]))
        .unwrap();

    db.write(|txn| txn.delete("Dog", dogs[1])).unwrap();

    let snapshot = db.snapshot();
    let record = snapshot.get("Owner", owner).unwrap();
    assert_eq!(
        record.value::<Vec<RowId>>("Pets").unwrap(),
        vec![dogs[0], dogs[2]]
    );
    assert_eq!(record.value::<Option<RowId>>("Favorite").unwrap(), None);
    assert_eq!(
        snapshot.get("Dog", dogs[2]).unwrap().value::<Option<RowId>>("Parent").unwrap(),
        None
    );
    let report = db.check_integrity().unwrap();
    assert_eq!(report.relationships, 2);
    assert_eq!(report.objects["Dog"], 2);
}

#[test]
fn delete_unlinks_staged_referrers() {
    let tmpfile: NamedTempFile = NamedTempFile::new().unwrap();
    let db = open(&tmpfile);
    db.write(|txn| {
        let dog = txn.insert("Dog", name("fido"))?;
        let owner = txn.insert(
            "Owner",
            [
                ("Name", Value::from("tim")),
                ("Pets", Value::List(vec![dog, dog])),
                ("Favorite", Value::from(dog)),
            ],
        )?;
        txn.delete("Dog", dog)?;
        assert!(txn.related_rows("Owner", owner, "Pets")?.is_empty());
        assert!(txn.related_rows("Owner", owner, "Favorite")?.is_empty());
        Ok(())
    })
    .unwrap();
    assert_eq!(db.check_integrity().unwrap().relationships, 0);
}

#[test]
fn stale_reference_fails_commit() {
    let tmpfile: NamedTempFile = NamedTempFile::new().unwrap();
    let db = open(&tmpfile);
    let (owner, dogs) = populate(&db);
    let before = db.snapshot().txn_id();

    let mut txn = db.begin_write().unwrap();
    txn.delete("Dog", dogs[0]).unwrap();
    // the row id is stale, so the commit cannot proceed
    txn.add_relation("Owner", owner, "Pets", dogs[0]).unwrap();
    match txn.commit() {
        Err(Error::DanglingReference {
            object_type,
            owner: holder,
            field,
            target_type,
            target,
        }) => {
            assert_eq!(object_type, "Owner");
            assert_eq!(holder, owner);
            assert_eq!(field, "Pets");
            assert_eq!(target_type, "Dog");
            assert_eq!(target, dogs[0]);
        }
        other => panic!("expected a dangling reference, got {other:?}"),
    }

    let snapshot = db.snapshot();
    assert_eq!(snapshot.txn_id(), before);
    assert!(snapshot.get("Dog", dogs[0]).is_ok());
    assert_eq!(snapshot.related_rows("Owner", owner, "Pets").unwrap(), dogs);
}

#[test]
fn reference_to_missing_row_fails_commit() {
    let tmpfile: NamedTempFile = NamedTempFile::new().unwrap();
    let db = open(&tmpfile);
    let (owner, _) = populate(&db);

    let result = db.write(|txn| txn.add_relation("Owner", owner, "Favorite", RowId(1000)));
    assert!(matches!(
        result,
        Err(Error::DanglingReference { target: RowId(1000), .. })
    ));
    let result = db.write(|txn| {
        txn.insert(
            "Owner",
            [("Name", Value::from("ann")), ("Pets", Value::List(vec![RowId(55)]))],
        )
    });
    assert!(matches!(result, Err(Error::DanglingReference { .. })));
    assert_eq!(db.snapshot().len("Owner").unwrap(), 1);
}

#[test]
fn links_to_rows_of_the_same_transaction() {
    let tmpfile: NamedTempFile = NamedTempFile::new().unwrap();
    let db = open(&tmpfile);
    let (owner, puppy) = db
        .write(|txn| {
            let owner = txn.insert("Owner", name("kim"))?;
            let parent = txn.insert("Dog", name("lady"))?;
            let puppy = txn.insert(
                "Dog",
                [("Name", Value::from("pup")), ("Parent", Value::from(parent))],
            )?;
            txn.add_relation("Owner", owner, "Pets", puppy)?;
            txn.add_relation("Owner", owner, "Pets", parent)?;
            Ok((owner, puppy))
        })
        .unwrap();

    let snapshot = db.snapshot();
    assert_eq!(
        snapshot.related_rows("Owner", owner, "Pets").unwrap(),
        vec![puppy, RowId(0)]
    );
    assert_eq!(
        snapshot.related_rows("Dog", puppy, "Parent").unwrap(),
        vec![RowId(0)]
    );
    assert_eq!(db.check_integrity().unwrap().relationships, 3);
}

#[test]
fn relationships_survive_reopen() {
    let tmpfile: NamedTempFile = NamedTempFile::new().unwrap();
    let (owner, dogs) = {
        let db = open(&tmpfile);
        populate(&db)
    };
    let db = open(&tmpfile);
    assert_eq!(db.snapshot().related_rows("Owner", owner, "Pets").unwrap(), dogs);

    // backlinks were persisted too
    db.write(|txn| txn.delete("Dog", dogs[1])).unwrap();
    assert_eq!(
        db.snapshot().related_rows("Owner", owner, "Pets").unwrap(),
        vec![dogs[0], dogs[2]]
    );
    assert_eq!(db.check_integrity().unwrap().relationships, 2);
}
