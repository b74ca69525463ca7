//! An embedded transactional object store.
//!
//! Records of declared types live in a single memory-mapped file. Writes go
//! through one [`WriteTransaction`] at a time and become visible atomically
//! on commit; any number of [`Snapshot`]s read consistent past states without
//! blocking the writer.
//!
//! ```
//! use radarstore::{Database, FieldType, ObjectSchema, Value};
//!
//! # fn main() -> radarstore::Result<()> {
//! let tmpfile = tempfile::NamedTempFile::new().unwrap();
//! let book = ObjectSchema::builder("Book")
//!     .field("Title", FieldType::String)
//!     .field("Price", FieldType::Double)
//!     .build();
//! let db = unsafe { Database::open(tmpfile.path(), &[book])? };
//!
//! db.write(|txn| {
//!     txn.insert("Book", [("Title", Value::from("C# Programming")), ("Price", Value::from(29.99))])?;
//!     txn.insert("Book", [("Title", Value::from("Learn Realm")), ("Price", Value::from(19.99))])?;
//!     Ok(())
//! })?;
//!
//! let snapshot = db.snapshot();
//! let expensive: Vec<_> = snapshot
//!     .filter("Book", |book| book.value::<f64>("Price").map_or(false, |p| p > 20.0))?
//!     .collect::<radarstore::Result<_>>()?;
//! assert_eq!(expensive.len(), 1);
//! # Ok(())
//! # }
//! ```

mod btree;
mod config;
mod db;
mod error;
mod index;
mod page_manager;
mod query;
mod record;
mod schema;
mod snapshot;
mod storage;
mod table;
mod transactions;
mod types;

pub use btree::TreeStats;
pub use config::Config;
pub use db::{Database, IntegrityReport, RecoveredRecord};
pub use error::{Error, Result};
pub use page_manager::PageStats;
pub use query::{Changes, Filter, Objects, Results};
pub use record::{FromValue, Record};
pub use schema::{FieldSchema, Object, ObjectSchema, SchemaBuilder};
pub use snapshot::Snapshot;
pub use transactions::{TransactionState, WriteTransaction};
pub use types::{FieldType, RowId, Timestamp, Value};
