use crate::btree::BtreeMut;
use crate::db::Shared;
use crate::error::Result;
use crate::index::{self, StagedKeys};
use crate::record;
use crate::schema::{Catalog, TableInfo};
use crate::snapshot::Snapshot;
use crate::table::{catalog_key, object_key, sequence_key, TableView};
use crate::types::{PageNumber, RowId, TableId, Value};
use parking_lot::MutexGuard;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Lifecycle of a write transaction.
///
/// `Active` until [`commit`](WriteTransaction::commit) moves it through
/// `Committing` to `Committed`, or a failed commit or
/// [`rollback`](WriteTransaction::rollback) moves it through `Aborting` to
/// `Aborted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committing,
    Committed,
    Aborting,
    Aborted,
}

pub(crate) enum Staged {
    Put(Vec<Value>),
    Delete,
}

/// Uncommitted changes of one write transaction.
#[derive(Default)]
pub(crate) struct WorkingSet {
    pub(crate) records: BTreeMap<(TableId, RowId), Staged>,
    pub(crate) keys: StagedKeys,
    // next row id per table
    pub(crate) sequences: BTreeMap<TableId, u64>,
    // catalog entries of newly registered types
    pub(crate) catalog: Vec<(String, Vec<u8>)>,
}

impl WorkingSet {
    fn is_empty(&self) -> bool {
        self.records.is_empty()
            && self.keys.is_empty()
            && self.sequences.is_empty()
            && self.catalog.is_empty()
    }
}

/// The single write transaction of a database.
///
/// Mutations are staged in memory and invisible to every snapshot until
/// [`commit`](Self::commit). Dropping an active transaction rolls it back.
pub struct WriteTransaction<'db> {
    pub(crate) shared: &'db Arc<Shared>,
    base: Snapshot,
    txn_id: u64,
    pub(crate) working_set: WorkingSet,
    state: TransactionState,
    _writer: MutexGuard<'db, ()>,
}

impl<'db> WriteTransaction<'db> {
    pub(crate) fn new(shared: &'db Arc<Shared>, writer: MutexGuard<'db, ()>) -> Self {
        let base = Snapshot::pin(shared);
        shared.store.release(shared.oldest_reader());
        shared.store.begin();
        let txn_id = base.txn_id() + 1;
        debug!(txn_id, "began write transaction");
        WriteTransaction {
            shared,
            base,
            txn_id,
            working_set: WorkingSet::default(),
            state: TransactionState::Active,
            _writer: writer,
        }
    }

    /// Id this transaction's commit will carry.
    pub fn txn_id(&self) -> u64 {
        self.txn_id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub(crate) fn view(&self) -> TableView<'_> {
        self.base.view()
    }

    pub(crate) fn catalog(&self) -> &'db Catalog {
        &self.shared.catalog
    }

    pub(crate) fn table(&self, name: &str) -> Result<&'db TableInfo> {
        self.catalog().table(name)
    }

    /// Validates primary keys and references, then durably publishes every
    /// staged change at once. On error nothing is published and the
    /// transaction is rolled back.
    pub fn commit(mut self) -> Result<()> {
        self.state = TransactionState::Committing;
        if self.working_set.is_empty() {
            self.shared.store.rollback();
            self.state = TransactionState::Committed;
            debug!(txn_id = self.txn_id, "nothing to commit");
            return Ok(());
        }
        match self.try_commit() {
            Ok(root) => {
                self.state = TransactionState::Committed;
                debug!(
                    txn_id = self.txn_id,
                    records = self.working_set.records.len(),
                    ?root,
                    "committed write transaction"
                );
                Ok(())
            }
            Err(err) => {
                warn!(txn_id = self.txn_id, error = %err, "commit failed, rolling back");
                self.abort();
                Err(err)
            }
        }
    }

    /// Discards every staged change.
    pub fn rollback(mut self) {
        self.abort();
    }

    fn abort(&mut self) {
        self.state = TransactionState::Aborting;
        self.shared.store.rollback();
        self.working_set = WorkingSet::default();
        self.state = TransactionState::Aborted;
        debug!(txn_id = self.txn_id, "rolled back write transaction");
    }

    fn try_commit(&mut self) -> Result<Option<PageNumber>> {
        self.validate_keys()?;
        self.validate_references()?;
        let root = self.apply()?;
        self.shared.store.commit(self.txn_id, root)?;
        self.shared.publish(self.txn_id, root);
        Ok(root)
    }

    // Writes the working set into a copy of the base tree
    fn apply(&self) -> Result<Option<PageNumber>> {
        let view = self.view();
        let mut tree = BtreeMut::new(&self.shared.store, self.base.root());

        for (name, entry) in &self.working_set.catalog {
            tree.insert(&catalog_key(name), entry)?;
        }
        for (table, next) in &self.working_set.sequences {
            tree.insert(&sequence_key(*table), &next.to_be_bytes())?;
        }
        for ((table, row), staged) in &self.working_set.records {
            let info = self.catalog().by_id(*table)?;
            let old = view.values(info, *row)?;
            let new = match staged {
                Staged::Put(values) => {
                    tree.insert(&object_key(*table, *row), &record::encode(values))?;
                    Some(values.as_slice())
                }
                Staged::Delete => {
                    tree.remove(&object_key(*table, *row))?;
                    None
                }
            };
            index::apply_backlinks(&mut tree, info, *row, old.as_deref(), new)?;
        }
        self.working_set.keys.apply(&mut tree)?;
        Ok(tree.root())
    }
}

impl<'db> Drop for WriteTransaction<'db> {
    fn drop(&mut self) {
        if self.state == TransactionState::Active {
            self.abort();
        }
    }
}
