use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Page number within the database file. Page 0 is the header.
pub(crate) type PageNumber = u64;

/// Identifier of a table in the catalog.
pub(crate) type TableId = u32;

/// Stable, type-scoped handle of a record.
///
/// Row identifiers are assigned from a per-type sequence on insert and are
/// never reused, even after the record is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RowId(pub u64);

impl RowId {
    pub(crate) fn to_be_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A point in time, stored as seconds and nanoseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp {
    seconds: i64,
    nanos: u32,
}

impl Timestamp {
    const NANOS_PER_SEC: u32 = 1_000_000_000;

    /// Normalizes `nanos` into whole seconds, saturating at `i64::MAX`.
    pub fn new(seconds: i64, nanos: u32) -> Self {
        Timestamp {
            seconds: seconds.saturating_add(i64::from(nanos / Self::NANOS_PER_SEC)),
            nanos: nanos % Self::NANOS_PER_SEC,
        }
    }

    /// Like [`new`](Self::new), but `None` if the seconds overflow.
    pub fn checked_new(seconds: i64, nanos: u32) -> Option<Self> {
        Some(Timestamp {
            seconds: seconds.checked_add(i64::from(nanos / Self::NANOS_PER_SEC))?,
            nanos: nanos % Self::NANOS_PER_SEC,
        })
    }

    pub fn now() -> Self {
        SystemTime::now().into()
    }

    pub fn seconds(&self) -> i64 {
        self.seconds
    }

    pub fn nanos(&self) -> u32 {
        self.nanos
    }

    /// Shifts the timestamp back by `duration`.
    pub fn saturating_sub(self, duration: Duration) -> Self {
        let total = i128::from(self.seconds) * i128::from(Self::NANOS_PER_SEC)
            + i128::from(self.nanos)
            - duration.as_nanos() as i128;
        let seconds = total.div_euclid(i128::from(Self::NANOS_PER_SEC));
        let nanos = total.rem_euclid(i128::from(Self::NANOS_PER_SEC));
        Timestamp {
            seconds: seconds.clamp(i128::from(i64::MIN), i128::from(i64::MAX)) as i64,
            nanos: nanos as u32,
        }
    }
}

impl From<SystemTime> for Timestamp {
    fn from(time: SystemTime) -> Self {
        match time.duration_since(UNIX_EPOCH) {
            Ok(since) => Timestamp::new(since.as_secs() as i64, since.subsec_nanos()),
            Err(before) => Timestamp::new(0, 0).saturating_sub(before.duration()),
        }
    }
}

/// Declared type of a field. The discriminants are the column type codes
/// written to the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FieldType {
    Int = 0x0,
    Bool = 0x1,
    String = 0x2,
    Timestamp = 0x8,
    Float = 0x9,
    Double = 0xA,
    Link = 0xC,
    List = 0xD,
}

impl FieldType {
    pub(crate) fn from_tag(tag: u8) -> Option<FieldType> {
        match tag {
            0x0 => Some(FieldType::Int),
            0x1 => Some(FieldType::Bool),
            0x2 => Some(FieldType::String),
            0x8 => Some(FieldType::Timestamp),
            0x9 => Some(FieldType::Float),
            0xA => Some(FieldType::Double),
            0xC => Some(FieldType::Link),
            0xD => Some(FieldType::List),
            _ => None,
        }
    }

    pub(crate) fn tag(self) -> u8 {
        self as u8
    }

    /// Link and list fields point at rows of another type.
    pub fn is_reference(self) -> bool {
        matches!(self, FieldType::Link | FieldType::List)
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldType::Int => "int",
            FieldType::Bool => "bool",
            FieldType::String => "string",
            FieldType::Timestamp => "timestamp",
            FieldType::Float => "float",
            FieldType::Double => "double",
            FieldType::Link => "link",
            FieldType::List => "list",
        };
        f.write_str(name)
    }
}

/// A field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Bool(bool),
    Float(f32),
    Double(f64),
    String(String),
    Timestamp(Timestamp),
    Link(Option<RowId>),
    List(Vec<RowId>),
}

impl Value {
    pub fn field_type(&self) -> FieldType {
        match self {
            Value::Int(_) => FieldType::Int,
            Value::Bool(_) => FieldType::Bool,
            Value::Float(_) => FieldType::Float,
            Value::Double(_) => FieldType::Double,
            Value::String(_) => FieldType::String,
            Value::Timestamp(_) => FieldType::Timestamp,
            Value::Link(_) => FieldType::Link,
            Value::List(_) => FieldType::List,
        }
    }

    /// Default for a field omitted on insert. Only reference fields have one.
    pub(crate) fn default_for(field_type: FieldType) -> Option<Value> {
        match field_type {
            FieldType::Link => Some(Value::Link(None)),
            FieldType::List => Some(Value::List(vec![])),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f32> {
        match self {
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Numeric value widened to `f64`, for predicates over any number field.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(f64::from(*v)),
            Value::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<Timestamp> {
        match self {
            Value::Timestamp(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_link(&self) -> Option<RowId> {
        match self {
            Value::Link(v) => *v,
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[RowId]> {
        match self {
            Value::List(v) => Some(v),
            _ => None,
        }
    }

    /// Rows referenced by this value, in order. Empty for non-reference values.
    pub(crate) fn references(&self) -> &[RowId] {
        match self {
            Value::Link(Some(row)) => std::slice::from_ref(row),
            Value::List(rows) => rows,
            _ => &[],
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Double(v) => write!(f, "{v}"),
            Value::String(v) => write!(f, "{v:?}"),
            Value::Timestamp(v) => write!(f, "{}.{:09}", v.seconds(), v.nanos()),
            Value::Link(Some(row)) => write!(f, "{row}"),
            Value::Link(None) => f.write_str("null"),
            Value::List(rows) => {
                f.write_str("[")?;
                for (i, row) in rows.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{row}")?;
                }
                f.write_str("]")
            }
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Timestamp> for Value {
    fn from(v: Timestamp) -> Self {
        Value::Timestamp(v)
    }
}

impl From<RowId> for Value {
    fn from(v: RowId) -> Self {
        Value::Link(Some(v))
    }
}

impl From<Vec<RowId>> for Value {
    fn from(v: Vec<RowId>) -> Self {
        Value::List(v)
    }
}
