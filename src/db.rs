use crate::btree::{self, TreeStats};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::index;
use crate::page_manager::{PageManager, PageStats};
use crate::record::{self, Record};
use crate::schema::{Catalog, ObjectSchema};
use crate::snapshot::Snapshot;
use crate::table::{self, CATALOG};
use crate::transactions::WriteTransaction;
use crate::types::PageNumber;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, trace};

struct CommitState {
    txn_id: u64,
    root: Option<PageNumber>,
    // the commit before, while the file still holds it
    previous: Option<(u64, Option<PageNumber>)>,
    // live snapshots per commit
    readers: BTreeMap<u64, usize>,
}

/// State shared by the database handle, its snapshots and its writer.
pub(crate) struct Shared {
    pub(crate) store: PageManager,
    pub(crate) catalog: Catalog,
    state: Mutex<CommitState>,
    writer: Mutex<()>,
    config: Config,
}

impl Shared {
    /// Registers a reader of the latest commit and returns it.
    pub(crate) fn register_reader(&self) -> (u64, Option<PageNumber>) {
        let mut state = self.state.lock();
        let (txn_id, root) = (state.txn_id, state.root);
        *state.readers.entry(txn_id).or_default() += 1;
        (txn_id, root)
    }

    /// Registers a reader of the commit before the latest one.
    pub(crate) fn register_previous_reader(&self) -> Option<(u64, Option<PageNumber>)> {
        let mut state = self.state.lock();
        let (txn_id, root) = state.previous?;
        *state.readers.entry(txn_id).or_default() += 1;
        Some((txn_id, root))
    }

    pub(crate) fn retain_reader(&self, txn_id: u64) {
        *self.state.lock().readers.entry(txn_id).or_default() += 1;
    }

    pub(crate) fn release_reader(&self, txn_id: u64) {
        let mut state = self.state.lock();
        if let Some(count) = state.readers.get_mut(&txn_id) {
            *count -= 1;
            if *count == 0 {
                state.readers.remove(&txn_id);
            }
        }
    }

    pub(crate) fn oldest_reader(&self) -> Option<u64> {
        self.state.lock().readers.keys().next().copied()
    }

    pub(crate) fn publish(&self, txn_id: u64, root: Option<PageNumber>) {
        let mut state = self.state.lock();
        state.previous = Some((state.txn_id, state.root));
        state.txn_id = txn_id;
        state.root = root;
    }
}

/// Result of [`Database::check_integrity`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrityReport {
    /// Commit that was checked.
    pub txn_id: u64,
    pub tree: TreeStats,
    pub pages: PageStats,
    /// Record count per type.
    pub objects: BTreeMap<String, u64>,
    /// References held by link and list fields.
    pub relationships: u64,
}

/// A record found on a page no committed root references, as returned by
/// [`Database::recover_unreferenced`].
#[derive(Debug, Clone)]
pub struct RecoveredRecord {
    /// Page the record was found on.
    pub page: u64,
    pub record: Record,
}

/// An embedded object store in a single file.
pub struct Database {
    shared: Arc<Shared>,
}

impl Database {
    /// Opens the specified file as a radarstore database, registering
    /// `schemas`.
    ///
    /// * if the file does not exist, or is an empty file, a new database will be initialized in it
    /// * if the file is a valid radarstore database, its stored schemas must match `schemas`;
    ///   types the file does not know yet are added
    /// * otherwise this function will return an error
    ///
    /// # Safety
    ///
    /// The file is memory-mapped: it must not be modified or truncated by
    /// another process, or opened twice, while the database is open.
    pub unsafe fn open(path: impl AsRef<Path>, schemas: &[ObjectSchema]) -> Result<Database> {
        Self::open_with_config(path, schemas, Config::default())
    }

    /// Like [`open`](Self::open), with explicit configuration.
    ///
    /// # Safety
    ///
    /// See [`open`](Self::open).
    pub unsafe fn open_with_config(
        path: impl AsRef<Path>,
        schemas: &[ObjectSchema],
        config: Config,
    ) -> Result<Database> {
        Self::open_inner(path.as_ref(), Some(schemas), config)
    }

    /// Opens a database with the types stored in the file, without
    /// registering any. Used to inspect a file without the application's
    /// schemas.
    ///
    /// # Safety
    ///
    /// See [`open`](Self::open).
    pub unsafe fn open_existing(path: impl AsRef<Path>) -> Result<Database> {
        Self::open_inner(path.as_ref(), None, Config::default())
    }

    fn open_inner(path: &Path, schemas: Option<&[ObjectSchema]>, config: Config) -> Result<Database> {
        config.validate()?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(schemas.is_some())
            .open(path)?;
        let (store, slot) = PageManager::open(&file, &config)?;
        let previous = store.previous_commit(&slot);

        let mut stored = vec![];
        for entry in btree::scan_prefix(&store, slot.root, &[CATALOG]) {
            let (key, raw) = entry?;
            stored.push(Catalog::decode_entry(&key[1..], &raw)?);
        }
        let (catalog, new_entries) = Catalog::resolve(stored, schemas.unwrap_or(&[]))?;

        info!(
            path = %path.display(),
            txn_id = slot.txn_id,
            page_size = store.page_size(),
            types = catalog.tables().count(),
            "opened database"
        );
        let database = Database {
            shared: Arc::new(Shared {
                store,
                catalog,
                state: Mutex::new(CommitState {
                    txn_id: slot.txn_id,
                    root: slot.root,
                    previous: previous.map(|previous| (previous.txn_id, previous.root)),
                    readers: BTreeMap::new(),
                }),
                writer: Mutex::new(()),
                config,
            }),
        };
        if !new_entries.is_empty() {
            let mut txn = database.begin_write()?;
            txn.working_set.catalog = new_entries;
            txn.commit()?;
        }
        Ok(database)
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Every type known to the file, including ones this handle was not
    /// opened with.
    pub fn schemas(&self) -> Vec<Arc<ObjectSchema>> {
        self.shared
            .catalog
            .tables()
            .map(|table| table.schema.clone())
            .collect()
    }

    pub fn stats(&self) -> PageStats {
        self.shared.store.stats()
    }

    /// Starts the write transaction, blocking until the previous one has
    /// committed or rolled back. With a configured write lock timeout, fails
    /// with `WriteLockTimeout` instead of waiting longer.
    pub fn begin_write(&self) -> Result<WriteTransaction<'_>> {
        let writer = match self.shared.config.write_lock_timeout {
            Some(timeout) => self
                .shared
                .writer
                .try_lock_for(timeout)
                .ok_or(Error::WriteLockTimeout(timeout))?,
            None => self.shared.writer.lock(),
        };
        Ok(WriteTransaction::new(&self.shared, writer))
    }

    /// Pins the latest commit for reading.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot::pin(&self.shared)
    }

    /// Pins the commit before the latest one for reading, or `None` if there
    /// is no earlier commit or its header slot did not survive.
    ///
    /// The pages the latest commit replaced are kept until the next commit,
    /// and for as long as this snapshot lives.
    pub fn previous_snapshot(&self) -> Option<Snapshot> {
        Snapshot::pin_previous(&self.shared)
    }

    /// Runs `f` in a write transaction, committing if it returns `Ok` and
    /// rolling back if it returns `Err`.
    pub fn write<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut WriteTransaction<'_>) -> Result<T>,
    {
        let mut txn = self.begin_write()?;
        match f(&mut txn) {
            Ok(value) => {
                txn.commit()?;
                Ok(value)
            }
            Err(err) => {
                txn.rollback();
                Err(err)
            }
        }
    }

    /// Walks the latest commit: tree structure, every record against its
    /// schema, the primary key index and every relationship.
    pub fn check_integrity(&self) -> Result<IntegrityReport> {
        let snapshot = self.snapshot();
        let view = snapshot.view();
        let tree = btree::verify(&self.shared.store, snapshot.root())?;
        let mut objects = BTreeMap::new();
        let mut relationships = 0;

        for table in self.shared.catalog.tables() {
            let primary_key = table.schema.primary_key_index();
            let mut count = 0;
            for entry in view.rows(table.id) {
                let (row, raw) = entry?;
                let values = record::decode(&table.schema, row, &raw)?;
                count += 1;
                if let Some(index) = primary_key {
                    let key = index::encode_key(&values[index])?;
                    if view.lookup_key(table.id, &key)? != Some(row) {
                        return Err(Error::Corrupted(format!(
                            "{} row {} missing from the primary key index",
                            table.name(),
                            row
                        )));
                    }
                }
                for (field, target_table) in table.reference_fields() {
                    for target in values[field].references() {
                        if !view.contains(target_table, *target)? {
                            return Err(Error::DanglingReference {
                                object_type: table.name().to_string(),
                                owner: row,
                                field: table.schema.fields()[field].name().to_string(),
                                target_type: self.shared.catalog.by_id(target_table)?.name().to_string(),
                                target: *target,
                            });
                        }
                        if !view.has_backlink(target_table, *target, table.id, field, row)? {
                            return Err(Error::Corrupted(format!(
                                "{} row {} reference to {} has no backlink",
                                table.name(),
                                row,
                                target
                            )));
                        }
                        relationships += 1;
                    }
                }
            }
            if primary_key.is_some() && view.key_count(table.id)? != count {
                return Err(Error::Corrupted(format!(
                    "primary key index of {} has stale entries",
                    table.name()
                )));
            }
            objects.insert(table.name().to_string(), count);
        }

        Ok(IntegrityReport {
            txn_id: snapshot.txn_id(),
            tree,
            pages: self.shared.store.stats(),
            objects,
            relationships,
        })
    }

    /// Scans the pages no committed root references, free ones and ones kept
    /// for older snapshots, for records of known types. Superseded and
    /// deleted versions stay there until the page is reused. Pages or entries
    /// that do not decode are skipped.
    pub fn recover_unreferenced(&self) -> Vec<RecoveredRecord> {
        let store = &self.shared.store;
        let mut recovered = vec![];
        for page in store.unreferenced_pages() {
            let entries = match btree::leaf_entries(store, page) {
                Ok(Some(entries)) => entries,
                Ok(None) => continue,
                Err(err) => {
                    trace!(page, error = %err, "skipped page");
                    continue;
                }
            };
            for (key, raw) in entries {
                let found = table::split_object_key(&key)
                    .and_then(|(table, row)| Some((self.shared.catalog.by_id(table).ok()?, row)));
                let (info, row) = match found {
                    Some(found) => found,
                    None => continue,
                };
                match record::decode(&info.schema, row, &raw) {
                    Ok(values) => recovered.push(RecoveredRecord {
                        page,
                        record: Record::new(info.schema.clone(), row, values),
                    }),
                    Err(err) => trace!(page, error = %err, "skipped entry"),
                }
            }
        }
        debug!(records = recovered.len(), "scanned unreferenced pages");
        recovered
    }
}
