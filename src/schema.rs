//! Type schemas and the catalog that maps them to tables.
//!
//! Types are declared by description rather than by inheritance: each one is
//! an [`ObjectSchema`] listing its fields in order. Application structs that
//! want typed access implement [`Object`].

use crate::error::{Error, Result};
use crate::record::{Cursor, Record};
use crate::types::{FieldType, TableId, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::info;

const FLAG_PRIMARY_KEY: u8 = 1;

/// One declared field of a type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSchema {
    name: String,
    field_type: FieldType,
    target: Option<String>,
    primary_key: bool,
}

impl FieldSchema {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn field_type(&self) -> FieldType {
        self.field_type
    }

    /// Target type of a link or list field.
    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    pub fn is_primary_key(&self) -> bool {
        self.primary_key
    }
}

/// Static description of a record type: its name and ordered fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSchema {
    name: String,
    fields: Vec<FieldSchema>,
}

impl ObjectSchema {
    pub fn builder(name: impl Into<String>) -> SchemaBuilder {
        SchemaBuilder {
            schema: ObjectSchema {
                name: name.into(),
                fields: vec![],
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[FieldSchema] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    pub fn primary_key(&self) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.primary_key)
    }

    pub(crate) fn primary_key_index(&self) -> Option<usize> {
        self.fields.iter().position(|f| f.primary_key)
    }

    pub(crate) fn require_field(&self, name: &str) -> Result<usize> {
        self.field_index(name).ok_or_else(|| {
            Error::SchemaMismatch(format!("{} has no field {}", self.name, name))
        })
    }

    pub(crate) fn check_value(&self, index: usize, value: &Value) -> Result<()> {
        let field = &self.fields[index];
        if value.field_type() != field.field_type {
            return Err(Error::SchemaMismatch(format!(
                "{}.{} is {}, got {}",
                self.name,
                field.name,
                field.field_type,
                value.field_type()
            )));
        }
        Ok(())
    }

    /// Builds a full value list for an insert. Every non-reference field must
    /// be named exactly once; omitted link and list fields start empty.
    pub(crate) fn values_from<I, K>(&self, fields: I) -> Result<Vec<Value>>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: AsRef<str>,
    {
        let mut slots: Vec<Option<Value>> = vec![None; self.fields.len()];
        for (name, value) in fields {
            let index = self.require_field(name.as_ref())?;
            self.check_value(index, &value)?;
            if slots[index].replace(value).is_some() {
                return Err(Error::SchemaMismatch(format!(
                    "{}.{} given twice",
                    self.name,
                    name.as_ref()
                )));
            }
        }
        slots
            .into_iter()
            .zip(&self.fields)
            .map(|(slot, field)| {
                slot.or_else(|| Value::default_for(field.field_type))
                    .ok_or_else(|| {
                        Error::SchemaMismatch(format!(
                            "missing value for {}.{}",
                            self.name, field.name
                        ))
                    })
            })
            .collect()
    }

    fn validate(&self, known: &HashSet<&str>) -> Result<()> {
        let mismatch = |what: String| Err(Error::SchemaMismatch(format!("{}: {}", self.name, what)));
        if self.name.is_empty() {
            return Err(Error::SchemaMismatch("type name is empty".to_string()));
        }
        if self.fields.len() > usize::from(u16::MAX) {
            return mismatch(format!("{} fields, at most {} allowed", self.fields.len(), u16::MAX));
        }
        let mut names = HashSet::new();
        for field in &self.fields {
            if field.name.is_empty() {
                return mismatch("empty field name".to_string());
            }
            // names are stored with a two-byte length
            for text in [field.name.as_str(), field.target.as_deref().unwrap_or("")] {
                if text.len() > usize::from(u16::MAX) {
                    return mismatch(format!("name of {} bytes is too long", text.len()));
                }
            }
            if !names.insert(field.name.as_str()) {
                return mismatch(format!("field {} declared twice", field.name));
            }
            match (&field.target, field.field_type.is_reference()) {
                (Some(target), true) if !known.contains(target.as_str()) => {
                    return mismatch(format!("{} links to unknown type {}", field.name, target))
                }
                (None, true) => return mismatch(format!("{} has no target type", field.name)),
                _ => {}
            }
        }
        let keys: Vec<&FieldSchema> = self.fields.iter().filter(|f| f.primary_key).collect();
        if keys.len() > 1 {
            return mismatch("more than one primary key".to_string());
        }
        if let Some(key) = keys.first() {
            if !matches!(key.field_type, FieldType::Int | FieldType::String) {
                return mismatch(format!(
                    "primary key {} must be int or string, not {}",
                    key.name, key.field_type
                ));
            }
        }
        Ok(())
    }

    // Catalog entry format is:
    // * (4 bytes) table id
    // * (2 bytes) field count
    // * per field: (1 byte) type tag, (1 byte) flags, (2 bytes) name_len,
    //   name_data, (2 bytes) target_len, target_data
    fn to_bytes(&self, table: TableId) -> Vec<u8> {
        let mut out = vec![];
        out.extend_from_slice(&table.to_be_bytes());
        out.extend_from_slice(&(self.fields.len() as u16).to_be_bytes());
        for field in &self.fields {
            out.push(field.field_type.tag());
            out.push(if field.primary_key { FLAG_PRIMARY_KEY } else { 0 });
            for text in [field.name.as_str(), field.target.as_deref().unwrap_or("")] {
                out.extend_from_slice(&(text.len() as u16).to_be_bytes());
                out.extend_from_slice(text.as_bytes());
            }
        }
        out
    }

    fn from_bytes(name: &str, raw: &[u8]) -> Result<(TableId, ObjectSchema)> {
        let decode = || -> Option<(TableId, Vec<FieldSchema>)> {
            let mut cursor = Cursor::new(raw);
            let table = cursor.u32()?;
            let count = cursor.u16()?;
            let mut fields = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let field_type = FieldType::from_tag(cursor.u8()?)?;
                let flags = cursor.u8()?;
                let name = cursor.string()?;
                let target = cursor.string()?;
                fields.push(FieldSchema {
                    name,
                    field_type,
                    target: (!target.is_empty()).then_some(target),
                    primary_key: flags & FLAG_PRIMARY_KEY != 0,
                });
            }
            cursor.is_empty().then_some((table, fields))
        };
        let (table, fields) =
            decode().ok_or_else(|| Error::Corrupted(format!("catalog entry for {name}")))?;
        Ok((
            table,
            ObjectSchema {
                name: name.to_string(),
                fields,
            },
        ))
    }
}

/// Builder returned by [`ObjectSchema::builder`].
#[derive(Debug, Clone)]
pub struct SchemaBuilder {
    schema: ObjectSchema,
}

impl SchemaBuilder {
    fn push(mut self, name: &str, field_type: FieldType, target: Option<&str>, primary_key: bool) -> Self {
        self.schema.fields.push(FieldSchema {
            name: name.to_string(),
            field_type,
            target: target.map(str::to_string),
            primary_key,
        });
        self
    }

    /// Declares a scalar field. Use [`link`](Self::link) and
    /// [`list`](Self::list) for references.
    pub fn field(self, name: &str, field_type: FieldType) -> Self {
        self.push(name, field_type, None, false)
    }

    /// Declares the primary key field, unique within the type.
    pub fn primary_key(self, name: &str, field_type: FieldType) -> Self {
        self.push(name, field_type, None, true)
    }

    /// Declares an optional reference to one row of `target`.
    pub fn link(self, name: &str, target: &str) -> Self {
        self.push(name, FieldType::Link, Some(target), false)
    }

    /// Declares an ordered collection of references to rows of `target`.
    pub fn list(self, name: &str, target: &str) -> Self {
        self.push(name, FieldType::List, Some(target), false)
    }

    pub fn build(self) -> ObjectSchema {
        self.schema
    }
}

/// A type whose values are stored as records.
///
/// ```
/// use radarstore::{FieldType, Object, ObjectSchema, Record, Result, Value};
///
/// struct Book {
///     title: String,
///     price: f64,
/// }
///
/// impl Object for Book {
///     fn schema() -> ObjectSchema {
///         ObjectSchema::builder("Book")
///             .field("Title", FieldType::String)
///             .field("Price", FieldType::Double)
///             .build()
///     }
///
///     fn into_fields(self) -> Vec<(&'static str, Value)> {
///         vec![("Title", self.title.into()), ("Price", self.price.into())]
///     }
///
///     fn from_record(record: &Record) -> Result<Self> {
///         Ok(Book {
///             title: record.value("Title")?,
///             price: record.value("Price")?,
///         })
///     }
/// }
/// ```
pub trait Object: Sized {
    fn schema() -> ObjectSchema;

    fn into_fields(self) -> Vec<(&'static str, Value)>;

    fn from_record(record: &Record) -> Result<Self>;
}

/// A type as registered in the file.
#[derive(Debug)]
pub(crate) struct TableInfo {
    pub(crate) id: TableId,
    pub(crate) schema: Arc<ObjectSchema>,
    // target table of each field, None for scalar fields
    pub(crate) targets: Vec<Option<TableId>>,
}

impl TableInfo {
    pub(crate) fn name(&self) -> &str {
        self.schema.name()
    }

    /// Reference fields and the table they point into.
    pub(crate) fn reference_fields(&self) -> impl Iterator<Item = (usize, TableId)> + '_ {
        self.targets
            .iter()
            .enumerate()
            .filter_map(|(field, target)| target.map(|target| (field, target)))
    }
}

/// All registered types. Fixed for the lifetime of an open database.
#[derive(Debug, Default)]
pub(crate) struct Catalog {
    tables: BTreeMap<TableId, TableInfo>,
    names: HashMap<String, TableId>,
}

impl Catalog {
    /// Decodes one stored catalog entry.
    pub(crate) fn decode_entry(key_name: &[u8], raw: &[u8]) -> Result<(TableId, ObjectSchema)> {
        let name = std::str::from_utf8(key_name)
            .map_err(|_| Error::Corrupted("catalog entry name is not utf-8".to_string()))?;
        ObjectSchema::from_bytes(name, raw)
    }

    /// Merges the stored catalog with the schemas an application opens the
    /// file with. Returns the catalog and the entries to persist for types
    /// the file does not know yet.
    pub(crate) fn resolve(
        stored: Vec<(TableId, ObjectSchema)>,
        requested: &[ObjectSchema],
    ) -> Result<(Catalog, Vec<(String, Vec<u8>)>)> {
        let mut by_name: BTreeMap<String, (TableId, ObjectSchema)> = BTreeMap::new();
        let mut next_id: TableId = 0;
        for (id, schema) in stored {
            next_id = next_id.max(id + 1);
            by_name.insert(schema.name.clone(), (id, schema));
        }

        let mut requested_names = HashSet::new();
        let mut new_entries = vec![];
        for schema in requested {
            if !requested_names.insert(schema.name.as_str()) {
                return Err(Error::SchemaMismatch(format!(
                    "type {} declared twice",
                    schema.name
                )));
            }
            match by_name.get(&schema.name) {
                Some((_, existing)) if existing != schema => {
                    return Err(Error::SchemaMismatch(format!(
                        "{} differs from the schema stored in the file",
                        schema.name
                    )))
                }
                Some(_) => {}
                None => {
                    let id = next_id;
                    next_id += 1;
                    info!(object_type = %schema.name, table = id, "registering new type");
                    new_entries.push((schema.name.clone(), schema.to_bytes(id)));
                    by_name.insert(schema.name.clone(), (id, schema.clone()));
                }
            }
        }

        let known: HashSet<&str> = by_name.keys().map(String::as_str).collect();
        for (_, schema) in by_name.values() {
            schema.validate(&known)?;
        }

        let names: HashMap<String, TableId> = by_name
            .iter()
            .map(|(name, (id, _))| (name.clone(), *id))
            .collect();
        let mut tables = BTreeMap::new();
        for (id, schema) in by_name.into_values() {
            let targets = schema
                .fields
                .iter()
                .map(|field| field.target.as_ref().and_then(|t| names.get(t).copied()))
                .collect();
            tables.insert(
                id,
                TableInfo {
                    id,
                    schema: Arc::new(schema),
                    targets,
                },
            );
        }
        Ok((Catalog { tables, names }, new_entries))
    }

    pub(crate) fn table(&self, name: &str) -> Result<&TableInfo> {
        self.names
            .get(name)
            .and_then(|id| self.tables.get(id))
            .ok_or_else(|| Error::UnknownType(name.to_string()))
    }

    pub(crate) fn by_id(&self, id: TableId) -> Result<&TableInfo> {
        self.tables
            .get(&id)
            .ok_or_else(|| Error::Corrupted(format!("unknown table id {id}")))
    }

    pub(crate) fn tables(&self) -> impl Iterator<Item = &TableInfo> {
        self.tables.values()
    }
}

#[cfg(test)]
mod test {
    use super::{Catalog, ObjectSchema};
    use crate::error::Error;
    use crate::types::{FieldType, RowId, Value};

    fn person() -> ObjectSchema {
        ObjectSchema::builder("Person")
            .primary_key("Id", FieldType::Int)
            .field("Name", FieldType::String)
            .list("Dogs", "Dog")
            .build()
    }

    fn dog() -> ObjectSchema {
        ObjectSchema::builder("Dog")
            .field("Name", FieldType::String)
            .field("Age", FieldType::Int)
            .link("Owner", "Person")
            .build()
    }

    #[test]
    fn resolves_links() {
        let (catalog, new_entries) = Catalog::resolve(vec![], &[person(), dog()]).unwrap();
        assert_eq!(new_entries.len(), 2);
        let person = catalog.table("Person").unwrap();
        let dog = catalog.table("Dog").unwrap();
        assert_eq!(person.targets, vec![None, None, Some(dog.id)]);
        assert_eq!(dog.targets, vec![None, None, Some(person.id)]);
        assert_eq!(person.schema.primary_key_index(), Some(0));
        assert!(matches!(catalog.table("Cat"), Err(Error::UnknownType(_))));
    }

    #[test]
    fn catalog_entries_round_trip() {
        let (_, new_entries) = Catalog::resolve(vec![], &[person(), dog()]).unwrap();
        let stored: Vec<_> = new_entries
            .iter()
            .map(|(name, raw)| Catalog::decode_entry(name.as_bytes(), raw).unwrap())
            .collect();
        assert_eq!(stored[0], (0, person()));
        assert_eq!(stored[1], (1, dog()));

        // Reopening with the same schemas registers nothing
        let (catalog, new_entries) = Catalog::resolve(stored, &[dog()]).unwrap();
        assert!(new_entries.is_empty());
        assert_eq!(catalog.table("Person").unwrap().id, 0);
    }

    #[test]
    fn rejects_changed_schema() {
        let (_, entries) = Catalog::resolve(vec![], &[dog(), person()]).unwrap();
        let stored: Vec<_> = entries
            .iter()
            .map(|(name, raw)| Catalog::decode_entry(name.as_bytes(), raw).unwrap())
            .collect();
        let changed = ObjectSchema::builder("Dog")
            .field("Name", FieldType::String)
            .build();
        assert!(matches!(
            Catalog::resolve(stored, &[changed]),
            Err(Error::SchemaMismatch(_))
        ));
    }

    #[test]
    fn rejects_invalid_schemas() {
        let dangling = ObjectSchema::builder("Dog").link("Owner", "Person").build();
        assert!(Catalog::resolve(vec![], &[dangling]).is_err());

        let two_keys = ObjectSchema::builder("Thing")
            .primary_key("A", FieldType::Int)
            .primary_key("B", FieldType::Int)
            .build();
        assert!(Catalog::resolve(vec![], &[two_keys]).is_err());

        let float_key = ObjectSchema::builder("Thing")
            .primary_key("A", FieldType::Double)
            .build();
        assert!(Catalog::resolve(vec![], &[float_key]).is_err());

        let repeated = ObjectSchema::builder("Thing")
            .field("A", FieldType::Int)
            .field("A", FieldType::Bool)
            .build();
        assert!(Catalog::resolve(vec![], &[repeated]).is_err());

        let bare_link = ObjectSchema::builder("Thing")
            .field("A", FieldType::Link)
            .build();
        assert!(Catalog::resolve(vec![], &[bare_link]).is_err());
    }

    #[test]
    fn rejects_names_beyond_the_length_prefix() {
        let long = "f".repeat(usize::from(u16::MAX) + 1);
        let long_field = ObjectSchema::builder("Thing")
            .field(&long, FieldType::Int)
            .build();
        assert!(matches!(
            Catalog::resolve(vec![], &[long_field]),
            Err(Error::SchemaMismatch(_))
        ));

        // the longest name that fits still survives a round trip
        let longest = "f".repeat(usize::from(u16::MAX));
        let schema = ObjectSchema::builder("Thing")
            .field(&longest, FieldType::Int)
            .build();
        let (_, entries) = Catalog::resolve(vec![], &[schema.clone()]).unwrap();
        let (name, raw) = &entries[0];
        assert_eq!(Catalog::decode_entry(name.as_bytes(), raw).unwrap(), (0, schema));
    }

    #[test]
    fn values_from_fields() {
        let schema = dog();
        let values = schema
            .values_from([("Age", Value::Int(3)), ("Name", Value::from("Rex"))])
            .unwrap();
        assert_eq!(
            values,
            vec![Value::from("Rex"), Value::Int(3), Value::Link(None)]
        );

        let with_owner = schema
            .values_from([
                ("Name", Value::from("Rex")),
                ("Age", Value::Int(3)),
                ("Owner", Value::from(RowId(7))),
            ])
            .unwrap();
        assert_eq!(with_owner[2], Value::Link(Some(RowId(7))));

        assert!(matches!(
            schema.values_from([("Name", Value::from("Rex"))]),
            Err(Error::SchemaMismatch(_))
        ));
        assert!(matches!(
            schema.values_from([("Name", Value::Int(1)), ("Age", Value::Int(3))]),
            Err(Error::SchemaMismatch(_))
        ));
        assert!(matches!(
            schema.values_from([
                ("Name", Value::from("Rex")),
                ("Age", Value::Int(3)),
                ("Tail", Value::Bool(true))
            ]),
            Err(Error::SchemaMismatch(_))
        ));
    }
}
