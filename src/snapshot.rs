use crate::db::Shared;
use crate::error::{Error, Result};
use crate::index;
use crate::query::{Changes, Filter, Objects, Results};
use crate::record::Record;
use crate::schema::{Object, TableInfo};
use crate::table::TableView;
use crate::types::{PageNumber, RowId, Value};
use std::sync::Arc;

/// A consistent, read-only view of the database as of one commit.
///
/// Every page reachable from the snapshot stays untouched for as long as the
/// snapshot, or any clone of it, is alive. Readers never block the writer.
pub struct Snapshot {
    shared: Arc<Shared>,
    txn_id: u64,
    root: Option<PageNumber>,
}

impl Snapshot {
    /// Pins the latest commit.
    pub(crate) fn pin(shared: &Arc<Shared>) -> Snapshot {
        let (txn_id, root) = shared.register_reader();
        Snapshot {
            shared: shared.clone(),
            txn_id,
            root,
        }
    }

    /// Pins the commit before the latest one, if the file still has it.
    pub(crate) fn pin_previous(shared: &Arc<Shared>) -> Option<Snapshot> {
        let (txn_id, root) = shared.register_previous_reader()?;
        Some(Snapshot {
            shared: shared.clone(),
            txn_id,
            root,
        })
    }

    pub(crate) fn root(&self) -> Option<PageNumber> {
        self.root
    }

    pub(crate) fn view(&self) -> TableView<'_> {
        TableView::new(&self.shared.store, self.root)
    }

    fn table(&self, name: &str) -> Result<&TableInfo> {
        self.shared.catalog.table(name)
    }

    /// Id of the commit this snapshot shows.
    pub fn txn_id(&self) -> u64 {
        self.txn_id
    }

    pub fn get(&self, object_type: &str, row: RowId) -> Result<Record> {
        let table = self.table(object_type)?;
        let values = self.view().values(table, row)?.ok_or_else(|| Error::NotFound {
            object_type: object_type.to_string(),
            row,
        })?;
        Ok(Record::new(table.schema.clone(), row, values))
    }

    /// Every record of a type in row order, decoded lazily.
    pub fn all(&self, object_type: &str) -> Result<Results<'_>> {
        let table = self.table(object_type)?;
        Ok(Results::new(table, self.view(), None))
    }

    /// Records of a type for which `predicate` holds. The predicate runs as
    /// the results are consumed.
    pub fn filter<P>(&self, object_type: &str, predicate: P) -> Result<Filter<Results<'_>, P>>
    where
        P: FnMut(&Record) -> bool,
    {
        Ok(Filter::new(self.all(object_type)?, predicate))
    }

    pub fn objects<T: Object>(&self) -> Result<Objects<'_, T>> {
        Ok(Objects::new(self.all(T::schema().name())?))
    }

    /// Number of records of a type.
    pub fn len(&self, object_type: &str) -> Result<u64> {
        let table = self.table(object_type)?;
        self.view().count(table.id)
    }

    pub fn lookup_by_key(&self, object_type: &str, key: impl Into<Value>) -> Result<Option<RowId>> {
        let table = self.table(object_type)?;
        index::lookup_by_key_in(table, key.into(), None, &self.view())
    }

    pub fn related_rows(&self, object_type: &str, owner: RowId, field: &str) -> Result<Vec<RowId>> {
        let record = self.get(object_type, owner)?;
        let table = self.table(object_type)?;
        index::related_rows_in(table, field, record.values())
    }

    /// Rows of a type inserted, updated or deleted between `earlier` and this
    /// snapshot.
    pub fn changes_since(&self, earlier: &Snapshot, object_type: &str) -> Result<Changes> {
        let later = self.table(object_type)?;
        let before = earlier.table(object_type)?;
        Changes::between(earlier.view().rows(before.id), self.view().rows(later.id))
    }
}

impl Clone for Snapshot {
    fn clone(&self) -> Self {
        self.shared.retain_reader(self.txn_id);
        Snapshot {
            shared: self.shared.clone(),
            txn_id: self.txn_id,
            root: self.root,
        }
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        self.shared.release_reader(self.txn_id);
    }
}
