//! Object tables.
//!
//! Every type owns a table of records keyed by row id. All tables share the
//! single tree of the store; keys start with a one-byte prefix naming the
//! part of the keyspace they belong to:
//!
//! * `0x00` name                                   -> catalog entry
//! * `0x01` table                                  -> next row id
//! * `0x02` table, row                             -> record
//! * `0x03` table, encoded key                     -> row
//! * `0x04` target table, target row, owner table, field, owner row -> empty
//!
//! Integers are big-endian so keys sort numerically.

use crate::btree::{self, RangeIter};
use crate::error::{Error, Result};
use crate::page_manager::PageManager;
use crate::query::{Filter, Objects, Results};
use crate::record::{self, Record};
use crate::schema::{Object, TableInfo};
use crate::transactions::{Staged, WriteTransaction};
use crate::types::{PageNumber, RowId, TableId, Value};
use std::convert::TryInto;
use tracing::debug;

pub(crate) const CATALOG: u8 = 0x00;
pub(crate) const SEQUENCES: u8 = 0x01;
pub(crate) const OBJECTS: u8 = 0x02;
pub(crate) const PRIMARY_KEYS: u8 = 0x03;
pub(crate) const BACKLINKS: u8 = 0x04;

const OBJECT_KEY_LEN: usize = 1 + 4 + 8;

pub(crate) fn catalog_key(name: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + name.len());
    key.push(CATALOG);
    key.extend_from_slice(name.as_bytes());
    key
}

pub(crate) fn sequence_key(table: TableId) -> Vec<u8> {
    let mut key = vec![SEQUENCES];
    key.extend_from_slice(&table.to_be_bytes());
    key
}

pub(crate) fn objects_prefix(table: TableId) -> Vec<u8> {
    let mut key = Vec::with_capacity(OBJECT_KEY_LEN);
    key.push(OBJECTS);
    key.extend_from_slice(&table.to_be_bytes());
    key
}

pub(crate) fn object_key(table: TableId, row: RowId) -> Vec<u8> {
    let mut key = objects_prefix(table);
    key.extend_from_slice(&row.to_be_bytes());
    key
}

fn parse_object_key(key: &[u8]) -> Result<RowId> {
    if key.len() != OBJECT_KEY_LEN {
        return Err(Error::Corrupted(format!(
            "object key of {} bytes",
            key.len()
        )));
    }
    key[(OBJECT_KEY_LEN - 8)..]
        .try_into()
        .map(|raw| RowId(u64::from_be_bytes(raw)))
        .map_err(|_| Error::Corrupted("object key".to_string()))
}

/// Table and row of an object key, `None` for keys of other parts of the
/// keyspace.
pub(crate) fn split_object_key(key: &[u8]) -> Option<(TableId, RowId)> {
    if key.len() != OBJECT_KEY_LEN || key[0] != OBJECTS {
        return None;
    }
    let table = TableId::from_be_bytes(key[1..5].try_into().ok()?);
    let row = u64::from_be_bytes(key[5..OBJECT_KEY_LEN].try_into().ok()?);
    Some((table, RowId(row)))
}

/// Read access to the tables of one committed root.
#[derive(Clone, Copy)]
pub(crate) struct TableView<'a> {
    pub(crate) store: &'a PageManager,
    pub(crate) root: Option<PageNumber>,
}

impl<'a> TableView<'a> {
    pub(crate) fn new(store: &'a PageManager, root: Option<PageNumber>) -> Self {
        TableView { store, root }
    }

    pub(crate) fn values(&self, table: &TableInfo, row: RowId) -> Result<Option<Vec<Value>>> {
        match btree::get(self.store, self.root, &object_key(table.id, row))? {
            Some(raw) => Ok(Some(record::decode(&table.schema, row, &raw)?)),
            None => Ok(None),
        }
    }

    pub(crate) fn contains(&self, table: TableId, row: RowId) -> Result<bool> {
        Ok(btree::get(self.store, self.root, &object_key(table, row))?.is_some())
    }

    /// Encoded records of a table in row order.
    pub(crate) fn rows(&self, table: TableId) -> RawRecords<'a> {
        RawRecords {
            inner: btree::scan_prefix(self.store, self.root, &objects_prefix(table)),
        }
    }

    pub(crate) fn next_row(&self, table: TableId) -> Result<u64> {
        match btree::get(self.store, self.root, &sequence_key(table))? {
            None => Ok(0),
            Some(raw) => raw
                .as_slice()
                .try_into()
                .map(u64::from_be_bytes)
                .map_err(|_| Error::Corrupted(format!("sequence of table {table}"))),
        }
    }

    /// Number of records in a table, without decoding them.
    pub(crate) fn count(&self, table: TableId) -> Result<u64> {
        let mut count = 0;
        for entry in self.rows(table) {
            entry?;
            count += 1;
        }
        Ok(count)
    }
}

pub(crate) struct RawRecords<'a> {
    inner: RangeIter<'a>,
}

impl<'a> Iterator for RawRecords<'a> {
    type Item = Result<(RowId, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner
            .next()
            .map(|entry| entry.and_then(|(key, raw)| Ok((parse_object_key(&key)?, raw))))
    }
}

impl<'db> WriteTransaction<'db> {
    /// The record as this transaction sees it: staged changes first, then the
    /// committed state it started from.
    pub(crate) fn current(&self, table: &TableInfo, row: RowId) -> Result<Option<Vec<Value>>> {
        match self.working_set.records.get(&(table.id, row)) {
            Some(Staged::Put(values)) => Ok(Some(values.clone())),
            Some(Staged::Delete) => Ok(None),
            None => self.view().values(table, row),
        }
    }

    pub(crate) fn exists(&self, table: TableId, row: RowId) -> Result<bool> {
        match self.working_set.records.get(&(table, row)) {
            Some(Staged::Put(_)) => Ok(true),
            Some(Staged::Delete) => Ok(false),
            None => self.view().contains(table, row),
        }
    }

    pub(crate) fn require(&self, table: &TableInfo, row: RowId) -> Result<Vec<Value>> {
        self.current(table, row)?.ok_or_else(|| Error::NotFound {
            object_type: table.name().to_string(),
            row,
        })
    }

    pub(crate) fn stage_put(&mut self, table: &TableInfo, row: RowId, values: Vec<Value>) -> Result<()> {
        let size = OBJECT_KEY_LEN + record::encode(&values).len();
        let max = btree::max_entry_size(self.shared.store.page_size());
        if size > max {
            return Err(Error::RecordTooLarge { size, max });
        }
        self.working_set
            .records
            .insert((table.id, row), Staged::Put(values));
        Ok(())
    }

    fn allocate_row(&mut self, table: TableId) -> Result<RowId> {
        let next = match self.working_set.sequences.get(&table) {
            Some(next) => *next,
            None => self.view().next_row(table)?,
        };
        self.working_set.sequences.insert(table, next + 1);
        Ok(RowId(next))
    }

    /// Inserts a record and returns its row id.
    ///
    /// Every scalar field must be given exactly once; link and list fields
    /// may be omitted and start empty. Primary key uniqueness is checked at
    /// commit.
    pub fn insert<I, K>(&mut self, object_type: &str, fields: I) -> Result<RowId>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: AsRef<str>,
    {
        let table = self.table(object_type)?;
        let values = table.schema.values_from(fields)?;
        let key = match table.schema.primary_key_index() {
            Some(index) => Some(crate::index::encode_key(&values[index])?),
            None => None,
        };
        let row = self.allocate_row(table.id)?;
        self.stage_put(table, row, values)?;
        if let Some(key) = key {
            self.working_set.keys.add(table.id, key, row);
        }
        debug!(txn_id = self.txn_id(), object_type, %row, "staged insert");
        Ok(row)
    }

    /// Inserts a typed object.
    pub fn add<T: Object>(&mut self, object: T) -> Result<RowId> {
        let schema = T::schema();
        self.insert(schema.name(), object.into_fields())
    }

    /// Replaces the given fields of an existing record. Fields not named keep
    /// their value; the primary key cannot change.
    pub fn update<I, K>(&mut self, object_type: &str, row: RowId, fields: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: AsRef<str>,
    {
        let table = self.table(object_type)?;
        let mut values = self.require(table, row)?;
        let primary_key = table.schema.primary_key_index();
        for (name, value) in fields {
            let index = table.schema.require_field(name.as_ref())?;
            table.schema.check_value(index, &value)?;
            if Some(index) == primary_key && values[index] != value {
                return Err(Error::SchemaMismatch(format!(
                    "primary key {}.{} cannot change",
                    object_type,
                    name.as_ref()
                )));
            }
            values[index] = value;
        }
        self.stage_put(table, row, values)
    }

    pub fn set_field(
        &mut self,
        object_type: &str,
        row: RowId,
        field: &str,
        value: impl Into<Value>,
    ) -> Result<()> {
        self.update(object_type, row, [(field, value.into())])
    }

    pub fn get_field(&self, object_type: &str, row: RowId, field: &str) -> Result<Value> {
        let table = self.table(object_type)?;
        let index = table.schema.require_field(field)?;
        let mut values = self.require(table, row)?;
        Ok(values.swap_remove(index))
    }

    /// Deletes a record. The row is removed from every link and list that
    /// references it; its row id is never handed out again.
    pub fn delete(&mut self, object_type: &str, row: RowId) -> Result<()> {
        let table = self.table(object_type)?;
        let values = self.require(table, row)?;
        if let Some(index) = table.schema.primary_key_index() {
            let key = crate::index::encode_key(&values[index])?;
            self.working_set.keys.remove(table.id, key, row);
        }
        self.working_set
            .records
            .insert((table.id, row), Staged::Delete);
        let unlinked = self.unlink_referrers(table, row)?;
        debug!(txn_id = self.txn_id(), object_type, %row, unlinked, "staged delete");
        Ok(())
    }

    pub fn get(&self, object_type: &str, row: RowId) -> Result<Record> {
        let table = self.table(object_type)?;
        let values = self.require(table, row)?;
        Ok(Record::new(table.schema.clone(), row, values))
    }

    /// Every record of a type, including this transaction's changes, in row
    /// order.
    pub fn scan(&self, object_type: &str) -> Result<Results<'_>> {
        let table = self.table(object_type)?;
        Ok(Results::new(table, self.view(), Some(&self.working_set)))
    }

    pub fn filter<P>(&self, object_type: &str, predicate: P) -> Result<Filter<Results<'_>, P>>
    where
        P: FnMut(&Record) -> bool,
    {
        Ok(Filter::new(self.scan(object_type)?, predicate))
    }

    pub fn objects<T: Object>(&self) -> Result<Objects<'_, T>> {
        Ok(Objects::new(self.scan(T::schema().name())?))
    }
}
