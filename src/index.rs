//! Primary key index and relationships.
//!
//! Primary keys map `(table, encoded key)` to a row. Inside a write
//! transaction key changes are staged in [`StagedKeys`] and checked for
//! uniqueness at commit.
//!
//! Relationships live on the owning record as link and list values. Each
//! reference also has a backlink entry keyed by its target, so deleting a row
//! can find every record pointing at it without a scan.

use crate::btree::{self, BtreeMut};
use crate::error::{Error, Result};
use crate::schema::{Catalog, TableInfo};
use crate::table::{TableView, BACKLINKS, PRIMARY_KEYS};
use crate::transactions::{Staged, WriteTransaction};
use crate::types::{FieldType, RowId, TableId, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::convert::TryInto;
use tracing::debug;

const SIGN_BIT: u64 = 1 << 63;
const BACKLINK_KEY_LEN: usize = 1 + 4 + 8 + 4 + 2 + 8;

/// Encodes a primary key value so that byte order matches value order.
pub(crate) fn encode_key(value: &Value) -> Result<Vec<u8>> {
    match value {
        Value::Int(v) => Ok(((*v as u64) ^ SIGN_BIT).to_be_bytes().to_vec()),
        Value::String(v) => Ok(v.as_bytes().to_vec()),
        other => Err(Error::SchemaMismatch(format!(
            "{} values cannot be primary keys",
            other.field_type()
        ))),
    }
}

fn describe_key(field_type: FieldType, key: &[u8]) -> String {
    let int: Option<[u8; 8]> = key.try_into().ok();
    match (field_type, int) {
        (FieldType::Int, Some(raw)) => ((u64::from_be_bytes(raw) ^ SIGN_BIT) as i64).to_string(),
        _ => format!("{:?}", String::from_utf8_lossy(key)),
    }
}

pub(crate) fn primary_key_key(table: TableId, key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(5 + key.len());
    out.push(PRIMARY_KEYS);
    out.extend_from_slice(&table.to_be_bytes());
    out.extend_from_slice(key);
    out
}

fn backlinks_prefix(target_table: TableId, target: RowId) -> Vec<u8> {
    let mut out = Vec::with_capacity(BACKLINK_KEY_LEN);
    out.push(BACKLINKS);
    out.extend_from_slice(&target_table.to_be_bytes());
    out.extend_from_slice(&target.to_be_bytes());
    out
}

pub(crate) fn backlink_key(
    target_table: TableId,
    target: RowId,
    owner_table: TableId,
    field: u16,
    owner: RowId,
) -> Vec<u8> {
    let mut out = backlinks_prefix(target_table, target);
    out.extend_from_slice(&owner_table.to_be_bytes());
    out.extend_from_slice(&field.to_be_bytes());
    out.extend_from_slice(&owner.to_be_bytes());
    out
}

/// A record that references some row: owner table, field index and row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct Backlink {
    pub(crate) owner_table: TableId,
    pub(crate) field: usize,
    pub(crate) owner: RowId,
}

fn parse_backlink(key: &[u8]) -> Result<Backlink> {
    let corrupted = || Error::Corrupted(format!("backlink key of {} bytes", key.len()));
    if key.len() != BACKLINK_KEY_LEN {
        return Err(corrupted());
    }
    let owner_table = key[13..17].try_into().map_err(|_| corrupted())?;
    let field = key[17..19].try_into().map_err(|_| corrupted())?;
    let owner = key[19..27].try_into().map_err(|_| corrupted())?;
    Ok(Backlink {
        owner_table: u32::from_be_bytes(owner_table),
        field: u16::from_be_bytes(field) as usize,
        owner: RowId(u64::from_be_bytes(owner)),
    })
}

impl<'a> TableView<'a> {
    pub(crate) fn lookup_key(&self, table: TableId, key: &[u8]) -> Result<Option<RowId>> {
        match btree::get(self.store, self.root, &primary_key_key(table, key))? {
            None => Ok(None),
            Some(raw) => raw
                .as_slice()
                .try_into()
                .map(|raw| Some(RowId(u64::from_be_bytes(raw))))
                .map_err(|_| Error::Corrupted(format!("primary key entry of table {table}"))),
        }
    }

    /// Number of primary key entries of a table.
    pub(crate) fn key_count(&self, table: TableId) -> Result<u64> {
        let mut prefix = vec![PRIMARY_KEYS];
        prefix.extend_from_slice(&table.to_be_bytes());
        let mut count = 0;
        for entry in btree::scan_prefix(self.store, self.root, &prefix) {
            entry?;
            count += 1;
        }
        Ok(count)
    }

    /// Committed records referencing `target`.
    pub(crate) fn backlinks(&self, target_table: TableId, target: RowId) -> Result<Vec<Backlink>> {
        btree::scan_prefix(self.store, self.root, &backlinks_prefix(target_table, target))
            .map(|entry| entry.and_then(|(key, _)| parse_backlink(&key)))
            .collect()
    }

    pub(crate) fn has_backlink(
        &self,
        target_table: TableId,
        target: RowId,
        owner_table: TableId,
        field: usize,
        owner: RowId,
    ) -> Result<bool> {
        let key = backlink_key(target_table, target, owner_table, field as u16, owner);
        Ok(btree::get(self.store, self.root, &key)?.is_some())
    }
}

/// Primary key changes of one write transaction.
#[derive(Debug, Default)]
pub(crate) struct StagedKeys {
    // rows claiming each key; more than one is a conflict at commit
    added: BTreeMap<(TableId, Vec<u8>), Vec<RowId>>,
    // committed keys whose row was deleted
    removed: BTreeSet<(TableId, Vec<u8>)>,
}

impl StagedKeys {
    pub(crate) fn add(&mut self, table: TableId, key: Vec<u8>, row: RowId) {
        self.added.entry((table, key)).or_default().push(row);
    }

    pub(crate) fn remove(&mut self, table: TableId, key: Vec<u8>, row: RowId) {
        let entry = (table, key);
        if let Some(rows) = self.added.get_mut(&entry) {
            if let Some(position) = rows.iter().position(|r| *r == row) {
                rows.remove(position);
                if rows.is_empty() {
                    self.added.remove(&entry);
                }
                return;
            }
        }
        self.removed.insert(entry);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    /// Some if this transaction decides the key, None to fall back to the
    /// committed index.
    fn lookup(&self, table: TableId, key: &[u8]) -> Option<Option<RowId>> {
        let entry = (table, key.to_vec());
        if let Some(rows) = self.added.get(&entry) {
            return Some(rows.first().copied());
        }
        self.removed.contains(&entry).then_some(None)
    }

    fn validate(&self, catalog: &Catalog, base: &TableView) -> Result<()> {
        for ((table, key), rows) in &self.added {
            let taken = rows.len() > 1
                || (!self.removed.contains(&(*table, key.clone()))
                    && base.lookup_key(*table, key)?.is_some());
            if taken {
                let info = catalog.by_id(*table)?;
                let field_type = info
                    .schema
                    .primary_key()
                    .map_or(FieldType::String, |f| f.field_type());
                return Err(Error::DuplicateKey {
                    object_type: info.name().to_string(),
                    key: describe_key(field_type, key),
                });
            }
        }
        Ok(())
    }

    pub(crate) fn apply(&self, tree: &mut BtreeMut) -> Result<()> {
        for (table, key) in &self.removed {
            tree.remove(&primary_key_key(*table, key))?;
        }
        for ((table, key), rows) in &self.added {
            if let Some(row) = rows.first() {
                tree.insert(&primary_key_key(*table, key), &row.to_be_bytes())?;
            }
        }
        Ok(())
    }
}

/// Rewrites the backlinks of `row` from its old references to its new ones.
/// `None` stands for a record that does not exist.
pub(crate) fn apply_backlinks(
    tree: &mut BtreeMut,
    table: &TableInfo,
    row: RowId,
    old: Option<&[Value]>,
    new: Option<&[Value]>,
) -> Result<()> {
    let targets = |values: Option<&[Value]>, field: usize| -> BTreeSet<RowId> {
        values
            .map(|values| values[field].references().iter().copied().collect())
            .unwrap_or_default()
    };
    for (field, target_table) in table.reference_fields() {
        let before = targets(old, field);
        let after = targets(new, field);
        for target in before.difference(&after) {
            tree.remove(&backlink_key(target_table, *target, table.id, field as u16, row))?;
        }
        for target in after.difference(&before) {
            tree.insert(&backlink_key(target_table, *target, table.id, field as u16, row), &[])?;
        }
    }
    Ok(())
}

fn reference_field(table: &TableInfo, field: &str) -> Result<usize> {
    let index = table.schema.require_field(field)?;
    if table.targets[index].is_none() {
        return Err(Error::SchemaMismatch(format!(
            "{}.{} is not a link or list",
            table.name(),
            field
        )));
    }
    Ok(index)
}

pub(crate) fn lookup_by_key_in(
    table: &TableInfo,
    key: Value,
    staged: Option<&StagedKeys>,
    base: &TableView,
) -> Result<Option<RowId>> {
    let index = table.schema.primary_key_index().ok_or_else(|| {
        Error::SchemaMismatch(format!("{} has no primary key", table.name()))
    })?;
    table.schema.check_value(index, &key)?;
    let key = encode_key(&key)?;
    if let Some(decided) = staged.and_then(|staged| staged.lookup(table.id, &key)) {
        return Ok(decided);
    }
    base.lookup_key(table.id, &key)
}

pub(crate) fn related_rows_in(
    table: &TableInfo,
    field: &str,
    values: &[Value],
) -> Result<Vec<RowId>> {
    let index = reference_field(table, field)?;
    Ok(values[index].references().to_vec())
}

impl<'db> WriteTransaction<'db> {
    /// Finds the row holding a primary key value, including rows inserted by
    /// this transaction.
    pub fn lookup_by_key(&self, object_type: &str, key: impl Into<Value>) -> Result<Option<RowId>> {
        let table = self.table(object_type)?;
        lookup_by_key_in(table, key.into(), Some(&self.working_set.keys), &self.view())
    }

    /// Appends `target` to a list field, or points a link field at it. The
    /// target must exist when the transaction commits.
    pub fn add_relation(
        &mut self,
        object_type: &str,
        owner: RowId,
        field: &str,
        target: RowId,
    ) -> Result<()> {
        let table = self.table(object_type)?;
        let index = reference_field(table, field)?;
        let mut values = self.require(table, owner)?;
        match &mut values[index] {
            Value::List(rows) => rows.push(target),
            link => *link = Value::Link(Some(target)),
        }
        self.stage_put(table, owner, values)
    }

    /// Removes the first occurrence of `target` from a list field, or clears a
    /// link field pointing at it. Returns false if it was not referenced.
    pub fn remove_relation(
        &mut self,
        object_type: &str,
        owner: RowId,
        field: &str,
        target: RowId,
    ) -> Result<bool> {
        let table = self.table(object_type)?;
        let index = reference_field(table, field)?;
        let mut values = self.require(table, owner)?;
        let removed = match &mut values[index] {
            Value::List(rows) => match rows.iter().position(|row| *row == target) {
                Some(position) => {
                    rows.remove(position);
                    true
                }
                None => false,
            },
            Value::Link(link) if *link == Some(target) => {
                *link = None;
                true
            }
            _ => false,
        };
        if removed {
            self.stage_put(table, owner, values)?;
        }
        Ok(removed)
    }

    pub fn related_rows(&self, object_type: &str, owner: RowId, field: &str) -> Result<Vec<RowId>> {
        let table = self.table(object_type)?;
        let values = self.require(table, owner)?;
        related_rows_in(table, field, &values)
    }

    /// Strips `row` from every link and list that references it, staging the
    /// changed owners. Returns how many owners changed.
    pub(crate) fn unlink_referrers(&mut self, table: &TableInfo, row: RowId) -> Result<usize> {
        // owner -> fields that may hold `row`
        let mut owners: BTreeMap<(TableId, RowId), BTreeSet<usize>> = BTreeMap::new();
        for backlink in self.view().backlinks(table.id, row)? {
            owners
                .entry((backlink.owner_table, backlink.owner))
                .or_default()
                .insert(backlink.field);
        }
        for ((owner_table, owner), staged) in &self.working_set.records {
            if let Staged::Put(values) = staged {
                let info = self.catalog().by_id(*owner_table)?;
                for (field, target) in info.reference_fields() {
                    if target == table.id && values[field].references().contains(&row) {
                        owners.entry((*owner_table, *owner)).or_default().insert(field);
                    }
                }
            }
        }
        owners.remove(&(table.id, row));

        let mut changed = 0;
        for ((owner_table, owner), fields) in owners {
            let info = self.catalog().by_id(owner_table)?;
            let mut values = match self.current(info, owner)? {
                Some(values) => values,
                None => continue,
            };
            let mut touched = false;
            for field in fields {
                match values.get_mut(field) {
                    Some(Value::List(rows)) => {
                        let before = rows.len();
                        rows.retain(|r| *r != row);
                        touched |= rows.len() != before;
                    }
                    Some(Value::Link(link)) if *link == Some(row) => {
                        *link = None;
                        touched = true;
                    }
                    _ => {}
                }
            }
            if touched {
                self.stage_put(info, owner, values)?;
                changed += 1;
            }
        }
        Ok(changed)
    }

    pub(crate) fn validate_keys(&self) -> Result<()> {
        self.working_set
            .keys
            .validate(self.catalog(), &self.view())
    }

    /// Every reference held by a staged record must resolve to a row that
    /// exists once this transaction commits.
    pub(crate) fn validate_references(&self) -> Result<()> {
        for ((table, row), staged) in &self.working_set.records {
            let values = match staged {
                Staged::Put(values) => values,
                Staged::Delete => continue,
            };
            let info = self.catalog().by_id(*table)?;
            for (field, target_table) in info.reference_fields() {
                for target in values[field].references() {
                    if !self.exists(target_table, *target)? {
                        let target_info = self.catalog().by_id(target_table)?;
                        return Err(Error::DanglingReference {
                            object_type: info.name().to_string(),
                            owner: *row,
                            field: info.schema.fields()[field].name().to_string(),
                            target_type: target_info.name().to_string(),
                            target: *target,
                        });
                    }
                }
            }
        }
        debug!(
            txn_id = self.txn_id(),
            staged = self.working_set.records.len(),
            "references resolved"
        );
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::{backlink_key, describe_key, encode_key, parse_backlink, Backlink, StagedKeys};
    use crate::types::{FieldType, RowId, Value};

    #[test]
    fn int_keys_sort_numerically() {
        let keys: Vec<Vec<u8>> = [-300i64, -1, 0, 1, 300]
            .iter()
            .map(|v| encode_key(&Value::Int(*v)).unwrap())
            .collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
        assert_eq!(describe_key(FieldType::Int, &keys[0]), "-300");
        assert!(encode_key(&Value::Double(1.0)).is_err());
    }

    #[test]
    fn backlink_keys() {
        let key = backlink_key(1, RowId(2), 3, 4, RowId(5));
        assert_eq!(
            parse_backlink(&key).unwrap(),
            Backlink {
                owner_table: 3,
                field: 4,
                owner: RowId(5)
            }
        );
        assert!(parse_backlink(&key[..20]).is_err());
    }

    #[test]
    fn staged_keys() {
        let mut keys = StagedKeys::default();
        let key = encode_key(&Value::from("alice")).unwrap();
        assert_eq!(keys.lookup(0, &key), None);

        keys.add(0, key.clone(), RowId(1));
        assert_eq!(keys.lookup(0, &key), Some(Some(RowId(1))));

        // Deleting a row inserted by the same transaction leaves no trace
        keys.remove(0, key.clone(), RowId(1));
        assert!(keys.is_empty());

        // Deleting a committed row hides the committed key
        keys.remove(0, key.clone(), RowId(0));
        assert_eq!(keys.lookup(0, &key), Some(None));
        keys.add(0, key.clone(), RowId(2));
        assert_eq!(keys.lookup(0, &key), Some(Some(RowId(2))));
    }
}
