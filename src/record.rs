use crate::error::{Error, Result};
use crate::schema::ObjectSchema;
use crate::types::{FieldType, RowId, Timestamp, Value};
use std::convert::TryInto;
use std::fmt;
use std::sync::Arc;

/// A record read from a snapshot or a write transaction.
///
/// Records are detached copies: changing one requires an explicit
/// `update`/`set_field` on a write transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    schema: Arc<ObjectSchema>,
    row: RowId,
    values: Vec<Value>,
}

impl Record {
    pub(crate) fn new(schema: Arc<ObjectSchema>, row: RowId, values: Vec<Value>) -> Self {
        Record {
            schema,
            row,
            values,
        }
    }

    pub fn row_id(&self) -> RowId {
        self.row
    }

    pub fn object_type(&self) -> &str {
        self.schema.name()
    }

    pub fn schema(&self) -> &ObjectSchema {
        &self.schema
    }

    /// Values in field declaration order.
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.schema.field_index(field).map(|i| &self.values[i])
    }

    /// Typed access to a field, failing with `SchemaMismatch` if the field is
    /// missing or holds another type.
    pub fn value<T: FromValue>(&self, field: &str) -> Result<T> {
        let value = self.get(field).ok_or_else(|| {
            Error::SchemaMismatch(format!("{} has no field {}", self.object_type(), field))
        })?;
        T::from_value(value).ok_or_else(|| {
            Error::SchemaMismatch(format!(
                "{}.{} is {}",
                self.object_type(),
                field,
                value.field_type()
            ))
        })
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{} {{", self.object_type(), self.row)?;
        for (i, (field, value)) in self.schema.fields().iter().zip(&self.values).enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, " {}: {}", field.name(), value)?;
        }
        f.write_str(" }")
    }
}

/// Conversion out of a [`Value`], used by [`Record::value`].
pub trait FromValue: Sized {
    fn from_value(value: &Value) -> Option<Self>;
}

impl FromValue for Value {
    fn from_value(value: &Value) -> Option<Self> {
        Some(value.clone())
    }
}

impl FromValue for i64 {
    fn from_value(value: &Value) -> Option<Self> {
        value.as_int()
    }
}

impl FromValue for bool {
    fn from_value(value: &Value) -> Option<Self> {
        value.as_bool()
    }
}

impl FromValue for f32 {
    fn from_value(value: &Value) -> Option<Self> {
        value.as_float()
    }
}

impl FromValue for f64 {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Double(v) => Some(*v),
            _ => None,
        }
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> Option<Self> {
        value.as_str().map(str::to_string)
    }
}

impl FromValue for Timestamp {
    fn from_value(value: &Value) -> Option<Self> {
        value.as_timestamp()
    }
}

impl FromValue for Option<RowId> {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Link(link) => Some(*link),
            _ => None,
        }
    }
}

impl FromValue for Vec<RowId> {
    fn from_value(value: &Value) -> Option<Self> {
        value.as_list().map(<[RowId]>::to_vec)
    }
}

/// Big-endian reader over a byte slice. Every read returns None once the
/// input runs out.
pub(crate) struct Cursor<'a> {
    raw: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(raw: &'a [u8]) -> Self {
        Cursor { raw, offset: 0 }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.offset == self.raw.len()
    }

    pub(crate) fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        let slice = self.raw.get(self.offset..self.offset.checked_add(len)?)?;
        self.offset += len;
        Some(slice)
    }

    pub(crate) fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    pub(crate) fn u16(&mut self) -> Option<u16> {
        self.take(2)?.try_into().ok().map(u16::from_be_bytes)
    }

    pub(crate) fn u32(&mut self) -> Option<u32> {
        self.take(4)?.try_into().ok().map(u32::from_be_bytes)
    }

    pub(crate) fn u64(&mut self) -> Option<u64> {
        self.take(8)?.try_into().ok().map(u64::from_be_bytes)
    }

    pub(crate) fn i64(&mut self) -> Option<i64> {
        self.take(8)?.try_into().ok().map(i64::from_be_bytes)
    }

    /// A string prefixed by a `u16` length.
    pub(crate) fn string(&mut self) -> Option<String> {
        let len = self.u16()? as usize;
        String::from_utf8(self.take(len)?.to_vec()).ok()
    }
}

// Record format is:
// * (2 bytes) field count
// * per field: (1 byte) type tag, then the payload:
//   int: (8 bytes) i64
//   bool: (1 byte)
//   string: (4 bytes) len, utf-8 data
//   timestamp: (8 bytes) seconds, (4 bytes) nanoseconds
//   float: (4 bytes) f32 bits
//   double: (8 bytes) f64 bits
//   link: (1 byte) 1 if set, then (8 bytes) row id if set
//   list: (4 bytes) count, count * (8 bytes) row id
pub(crate) fn encode(values: &[Value]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + values.len() * 9);
    out.extend_from_slice(&(values.len() as u16).to_be_bytes());
    for value in values {
        out.push(value.field_type().tag());
        match value {
            Value::Int(v) => out.extend_from_slice(&v.to_be_bytes()),
            Value::Bool(v) => out.push(u8::from(*v)),
            Value::String(v) => {
                out.extend_from_slice(&(v.len() as u32).to_be_bytes());
                out.extend_from_slice(v.as_bytes());
            }
            Value::Timestamp(v) => {
                out.extend_from_slice(&v.seconds().to_be_bytes());
                out.extend_from_slice(&v.nanos().to_be_bytes());
            }
            Value::Float(v) => out.extend_from_slice(&v.to_bits().to_be_bytes()),
            Value::Double(v) => out.extend_from_slice(&v.to_bits().to_be_bytes()),
            Value::Link(None) => out.push(0),
            Value::Link(Some(row)) => {
                out.push(1);
                out.extend_from_slice(&row.to_be_bytes());
            }
            Value::List(rows) => {
                out.extend_from_slice(&(rows.len() as u32).to_be_bytes());
                for row in rows {
                    out.extend_from_slice(&row.to_be_bytes());
                }
            }
        }
    }
    out
}

fn decode_value(cursor: &mut Cursor, field_type: FieldType) -> Option<Value> {
    Some(match field_type {
        FieldType::Int => Value::Int(cursor.i64()?),
        FieldType::Bool => Value::Bool(cursor.u8()? != 0),
        FieldType::String => {
            let len = cursor.u32()? as usize;
            Value::String(String::from_utf8(cursor.take(len)?.to_vec()).ok()?)
        }
        FieldType::Timestamp => {
            let seconds = cursor.i64()?;
            Value::Timestamp(Timestamp::checked_new(seconds, cursor.u32()?)?)
        }
        FieldType::Float => Value::Float(f32::from_bits(cursor.u32()?)),
        FieldType::Double => Value::Double(f64::from_bits(cursor.u64()?)),
        FieldType::Link => match cursor.u8()? {
            0 => Value::Link(None),
            _ => Value::Link(Some(RowId(cursor.u64()?))),
        },
        FieldType::List => {
            let count = cursor.u32()? as usize;
            let mut rows = Vec::with_capacity(count.min(cursor.raw.len() / 8));
            for _ in 0..count {
                rows.push(RowId(cursor.u64()?));
            }
            Value::List(rows)
        }
    })
}

/// Decodes a stored record, checking it against the schema it was written
/// with.
pub(crate) fn decode(schema: &ObjectSchema, row: RowId, raw: &[u8]) -> Result<Vec<Value>> {
    let corrupted = |what: &str| Error::Corrupted(format!("{} row {}: {}", schema.name(), row, what));
    let mut cursor = Cursor::new(raw);
    let count = cursor.u16().ok_or_else(|| corrupted("truncated"))? as usize;
    if count != schema.fields().len() {
        return Err(corrupted("field count does not match the schema"));
    }
    let mut values = Vec::with_capacity(count);
    for field in schema.fields() {
        let tag = cursor.u8().ok_or_else(|| corrupted("truncated"))?;
        if tag != field.field_type().tag() {
            return Err(corrupted("field type does not match the schema"));
        }
        values.push(
            decode_value(&mut cursor, field.field_type())
                .ok_or_else(|| corrupted("truncated or out of range value"))?,
        );
    }
    if !cursor.is_empty() {
        return Err(corrupted("trailing bytes"));
    }
    Ok(values)
}
