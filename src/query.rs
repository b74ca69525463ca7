//! Lazy queries over one type.
//!
//! [`Results`] walks a table in row order. Inside a write transaction it
//! merges two sorted sources, the committed rows and the staged changes; for
//! a row present in both the staged version wins, and staged deletes are
//! skipped. Records are decoded one at a time as the caller advances.
//!
//! [`Changes`] merges the rows of one type under two commits the same way.

use crate::error::{Error, Result};
use crate::record::{self, Record};
use crate::schema::{Object, ObjectSchema, TableInfo};
use crate::table::{RawRecords, TableView};
use crate::transactions::{Staged, WorkingSet};
use crate::types::{RowId, TableId};
use std::cmp::Ordering;
use std::collections::btree_map;
use std::iter::Peekable;
use std::marker::PhantomData;
use std::sync::Arc;

type StagedRange<'a> = Peekable<btree_map::Range<'a, (TableId, RowId), Staged>>;

/// Records of one type in ascending row order.
pub struct Results<'a> {
    schema: Arc<ObjectSchema>,
    base: Peekable<RawRecords<'a>>,
    staged: Option<StagedRange<'a>>,
}

impl<'a> Results<'a> {
    pub(crate) fn new(
        table: &TableInfo,
        view: TableView<'a>,
        working_set: Option<&'a WorkingSet>,
    ) -> Self {
        let staged = working_set.map(|working_set| {
            working_set
                .records
                .range((table.id, RowId(0))..=(table.id, RowId(u64::MAX)))
                .peekable()
        });
        Results {
            schema: table.schema.clone(),
            base: view.rows(table.id).peekable(),
            staged,
        }
    }

    pub fn schema(&self) -> &ObjectSchema {
        &self.schema
    }

    fn next_base(&mut self) -> Option<Result<Record>> {
        let entry = self.base.next()?;
        Some(entry.and_then(|(row, raw)| {
            let values = record::decode(&self.schema, row, &raw)?;
            Ok(Record::new(self.schema.clone(), row, values))
        }))
    }
}

impl<'a> Iterator for Results<'a> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let base_row = match self.base.peek() {
                Some(Ok((row, _))) => Some(*row),
                // surface the error
                Some(Err(_)) => return self.next_base(),
                None => None,
            };
            let staged_row = self
                .staged
                .as_mut()
                .and_then(|staged| staged.peek())
                .map(|((_, row), _)| *row);
            let take_base = match (base_row, staged_row) {
                (None, None) => return None,
                (Some(base), Some(staged)) => base < staged,
                (Some(_), None) => true,
                (None, Some(_)) => false,
            };
            if take_base {
                return self.next_base();
            }

            let ((_, row), staged) = self.staged.as_mut()?.next()?;
            if base_row == Some(*row) {
                // shadowed by the staged version
                self.base.next();
            }
            match staged {
                Staged::Put(values) => {
                    return Some(Ok(Record::new(self.schema.clone(), *row, values.clone())))
                }
                Staged::Delete => continue,
            }
        }
    }
}

/// Results for which a predicate holds, evaluated as the caller advances.
/// Errors are passed through.
pub struct Filter<I, P> {
    inner: I,
    predicate: P,
}

impl<I, P> Filter<I, P> {
    pub(crate) fn new(inner: I, predicate: P) -> Self {
        Filter { inner, predicate }
    }
}

impl<I, P> Iterator for Filter<I, P>
where
    I: Iterator<Item = Result<Record>>,
    P: FnMut(&Record) -> bool,
{
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        for entry in self.inner.by_ref() {
            match entry {
                Ok(record) if !(self.predicate)(&record) => continue,
                other => return Some(other),
            }
        }
        None
    }
}

/// Results converted to an application type.
pub struct Objects<'a, T> {
    inner: Results<'a>,
    _object_type: PhantomData<T>,
}

impl<'a, T> Objects<'a, T> {
    pub(crate) fn new(inner: Results<'a>) -> Self {
        Objects {
            inner,
            _object_type: Default::default(),
        }
    }
}

impl<'a, T: Object> Iterator for Objects<'a, T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner
            .next()
            .map(|entry| entry.and_then(|record| T::from_record(&record)))
    }
}

/// Rows of one type that differ between an earlier and a later commit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Changes {
    pub inserted: Vec<RowId>,
    pub updated: Vec<RowId>,
    pub deleted: Vec<RowId>,
}

impl Changes {
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    /// Compares two row sources by their encoded records, both in row order.
    pub(crate) fn between(earlier: RawRecords<'_>, later: RawRecords<'_>) -> Result<Changes> {
        let mut changes = Changes::default();
        let mut earlier = earlier.peekable();
        let mut later = later.peekable();
        loop {
            let order = match (earlier.peek(), later.peek()) {
                (None, None) => return Ok(changes),
                (Some(Err(_)), _) => return Err(next_error(&mut earlier)),
                (_, Some(Err(_))) => return Err(next_error(&mut later)),
                (Some(Ok((old, _))), Some(Ok((new, _)))) => old.cmp(new),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
            };
            match order {
                Ordering::Less => {
                    if let Some(Ok((row, _))) = earlier.next() {
                        changes.deleted.push(row);
                    }
                }
                Ordering::Greater => {
                    if let Some(Ok((row, _))) = later.next() {
                        changes.inserted.push(row);
                    }
                }
                Ordering::Equal => {
                    if let (Some(Ok((row, old))), Some(Ok((_, new)))) = (earlier.next(), later.next()) {
                        if old != new {
                            changes.updated.push(row);
                        }
                    }
                }
            }
        }
    }
}

fn next_error(source: &mut Peekable<RawRecords<'_>>) -> Error {
    match source.next() {
        Some(Err(err)) => err,
        _ => Error::Corrupted("row source changed while peeking".to_string()),
    }
}
