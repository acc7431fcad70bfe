//! Table definitions and the fixed-width record format.
//!
//! A record is the concatenation of its fields in column order. Every field
//! starts with a one byte null marker (0 = null, 1 = present) followed by a
//! fixed-width payload:
//!
//! | type        | payload                                      |
//! |-------------|----------------------------------------------|
//! | `Int`       | `i64`, big-endian, sign bit flipped          |
//! | `UInt`      | `u64`, big-endian                            |
//! | `Text(n)`   | UTF-8, zero-padded to `n` bytes              |
//! | `Bytes(n)`  | zero-padded to `n` bytes                     |
//! | `Blob(_)`   | `u32` big-endian length of the blob payload  |
//!
//! The encoding preserves order, so index keys are simply the concatenated
//! fields of the indexed columns.

use std::cmp::Ordering;

use thiserror::Error;

use crate::expr::Expr;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColumnType {
    Int,
    UInt,
    Text(u16),
    Bytes(u16),
    /// A large object stored outside the record, as blob number `.0` of the
    /// row's [`livesc_store::BlobSet`].
    Blob(usize),
}

impl ColumnType {
    /// Width of the field payload, excluding the null marker.
    pub fn payload_len(&self) -> usize {
        match self {
            Self::Int | Self::UInt => 8,
            Self::Text(n) | Self::Bytes(n) => *n as usize,
            Self::Blob(_) => 4,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    Null,
    Int(i64),
    UInt(u64),
    Text(String),
    Bytes(Vec<u8>),
    /// Length of the blob payload.
    Blob(u32),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Compare two non-null values of compatible types.
    pub fn compare(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => Some(a.cmp(b)),
            (Self::UInt(a), Self::UInt(b)) => Some(a.cmp(b)),
            (Self::Int(a), Self::UInt(b)) => Some(i128::from(*a).cmp(&i128::from(*b))),
            (Self::UInt(a), Self::Int(b)) => Some(i128::from(*a).cmp(&i128::from(*b))),
            (Self::Text(a), Self::Text(b)) => Some(a.cmp(b)),
            (Self::Bytes(a), Self::Bytes(b)) => Some(a.cmp(b)),
            (Self::Blob(a), Self::Blob(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Column {
    pub name: String,
    pub ty: ColumnType,
    pub nullable: bool,
    /// Value for rows converted from a table version without this column.
    pub default: Option<Value>,
}

impl Column {
    pub fn new(name: impl Into<String>, ty: ColumnType) -> Self {
        Self {
            name: name.into(),
            ty,
            nullable: false,
            default: None,
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct IndexDef {
    pub name: String,
    pub columns: Vec<usize>,
    pub unique: bool,
    /// Rows for which the predicate is not true are not part of the index.
    pub predicate: Option<Expr>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CheckDef {
    pub name: String,
    pub expr: Expr,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ForeignKeyDef {
    pub name: String,
    pub columns: Vec<usize>,
    pub parent_table: String,
    pub parent_index: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TableDef {
    pub name: String,
    pub version: u8,
    pub columns: Vec<Column>,
    /// Index 0 is the primary key.
    pub indexes: Vec<IndexDef>,
    pub checks: Vec<CheckDef>,
    pub foreign_keys: Vec<ForeignKeyDef>,
    /// Store records and blobs deflate compressed.
    pub compressed: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("column {column}: {reason}")]
pub struct FieldError {
    pub column: String,
    pub reason: String,
}

impl FieldError {
    fn new(column: &Column, reason: impl Into<String>) -> Self {
        Self {
            column: column.name.clone(),
            reason: reason.into(),
        }
    }
}

const NULL: u8 = 0;
const PRESENT: u8 = 1;

impl TableDef {
    pub fn new(name: impl Into<String>, version: u8, columns: Vec<Column>) -> Self {
        Self {
            name: name.into(),
            version,
            columns,
            indexes: Vec::new(),
            checks: Vec::new(),
            foreign_keys: Vec::new(),
            compressed: false,
        }
    }

    pub fn compressed(mut self) -> Self {
        self.compressed = true;
        self
    }

    pub fn with_index(mut self, index: IndexDef) -> Self {
        self.indexes.push(index);
        self
    }

    pub fn with_check(mut self, check: CheckDef) -> Self {
        self.checks.push(check);
        self
    }

    pub fn with_foreign_key(mut self, fk: ForeignKeyDef) -> Self {
        self.foreign_keys.push(fk);
        self
    }

    /// Length in bytes of every record of this table.
    pub fn record_len(&self) -> usize {
        self.columns.iter().map(|c| 1 + c.ty.payload_len()).sum()
    }

    pub fn blob_count(&self) -> usize {
        self.columns.iter().filter(|c| matches!(c.ty, ColumnType::Blob(_))).count()
    }

    pub fn has_partial_indexes(&self) -> bool {
        self.indexes.iter().any(|ix| ix.predicate.is_some())
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name.eq_ignore_ascii_case(name))
    }

    fn field_offset(&self, column: usize) -> usize {
        self.columns[..column].iter().map(|c| 1 + c.ty.payload_len()).sum()
    }

    pub fn encode(&self, values: &[Value]) -> Result<Vec<u8>, FieldError> {
        if values.len() != self.columns.len() {
            return Err(FieldError {
                column: self.name.clone(),
                reason: format!("expected {} values, got {}", self.columns.len(), values.len()),
            });
        }
        let mut buf = Vec::with_capacity(self.record_len());
        for (column, value) in self.columns.iter().zip(values) {
            encode_field(column, value, &mut buf)?;
        }
        Ok(buf)
    }

    /// Decode a record. The caller checks the record length beforehand.
    pub fn decode(&self, record: &[u8]) -> Result<Vec<Value>, FieldError> {
        let mut values = Vec::with_capacity(self.columns.len());
        let mut rest = record;
        for column in &self.columns {
            let width = 1 + column.ty.payload_len();
            if rest.len() < width {
                return Err(FieldError::new(column, "record too short"));
            }
            let (field, tail) = rest.split_at(width);
            values.push(decode_field(column, field)?);
            rest = tail;
        }
        Ok(values)
    }

    /// Key of `record` in index `index`.
    pub fn index_key(&self, index: usize, record: &[u8]) -> Vec<u8> {
        self.key(&self.indexes[index].columns, record)
    }

    /// Concatenation of the encoded fields `columns` of `record`.
    pub fn key(&self, columns: &[usize], record: &[u8]) -> Vec<u8> {
        let mut key = Vec::new();
        for &column in columns {
            let off = self.field_offset(column);
            let width = 1 + self.columns[column].ty.payload_len();
            key.extend_from_slice(&record[off..off + width]);
        }
        key
    }
}

fn encode_field(column: &Column, value: &Value, buf: &mut Vec<u8>) -> Result<(), FieldError> {
    let width = column.ty.payload_len();
    if value.is_null() {
        if !column.nullable {
            return Err(FieldError::new(column, "null in non-nullable column"));
        }
        buf.push(NULL);
        buf.resize(buf.len() + width, 0);
        return Ok(());
    }
    buf.push(PRESENT);
    match (&column.ty, value) {
        (ColumnType::Int, Value::Int(v)) => buf.extend_from_slice(&((*v as u64) ^ (1 << 63)).to_be_bytes()),
        (ColumnType::UInt, Value::UInt(v)) => buf.extend_from_slice(&v.to_be_bytes()),
        (ColumnType::Text(_), Value::Text(s)) => pad(column, s.as_bytes(), width, buf)?,
        (ColumnType::Bytes(_), Value::Bytes(b)) => pad(column, b, width, buf)?,
        (ColumnType::Blob(_), Value::Blob(len)) => buf.extend_from_slice(&len.to_be_bytes()),
        (ty, value) => return Err(FieldError::new(column, format!("cannot store {value:?} as {ty:?}"))),
    }
    Ok(())
}

fn pad(column: &Column, data: &[u8], width: usize, buf: &mut Vec<u8>) -> Result<(), FieldError> {
    if data.len() > width {
        return Err(FieldError::new(
            column,
            format!("{} bytes exceed width {width}", data.len()),
        ));
    }
    buf.extend_from_slice(data);
    buf.resize(buf.len() + width - data.len(), 0);
    Ok(())
}

fn decode_field(column: &Column, field: &[u8]) -> Result<Value, FieldError> {
    let (marker, payload) = field.split_at(1);
    match marker[0] {
        NULL => return Ok(Value::Null),
        PRESENT => {}
        other => return Err(FieldError::new(column, format!("invalid null marker {other:#x}"))),
    }
    let value = match column.ty {
        ColumnType::Int => Value::Int((be_u64(payload) ^ (1 << 63)) as i64),
        ColumnType::UInt => Value::UInt(be_u64(payload)),
        ColumnType::Text(_) => {
            let s = std::str::from_utf8(trim_padding(payload)).map_err(|e| FieldError::new(column, e.to_string()))?;
            Value::Text(s.to_owned())
        }
        ColumnType::Bytes(_) => Value::Bytes(trim_padding(payload).to_vec()),
        ColumnType::Blob(_) => {
            let mut len = [0; 4];
            len.copy_from_slice(payload);
            Value::Blob(u32::from_be_bytes(len))
        }
    };
    Ok(value)
}

fn be_u64(payload: &[u8]) -> u64 {
    let mut buf = [0; 8];
    buf.copy_from_slice(payload);
    u64::from_be_bytes(buf)
}

fn trim_padding(payload: &[u8]) -> &[u8] {
    let end = payload.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
    &payload[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn def() -> TableDef {
        TableDef::new(
            "t",
            1,
            vec![
                Column::new("id", ColumnType::Int),
                Column::new("name", ColumnType::Text(8)).nullable(),
                Column::new("doc", ColumnType::Blob(0)).nullable(),
            ],
        )
        .with_index(IndexDef {
            name: "pk".into(),
            columns: vec![0],
            unique: true,
            predicate: None,
        })
    }

    #[test]
    fn encode_decode() {
        let def = def();
        let values = vec![Value::Int(-3), Value::Text("abc".into()), Value::Null];
        let rec = def.encode(&values).unwrap();
        assert_eq!(rec.len(), def.record_len());
        assert_eq!(def.decode(&rec).unwrap(), values);
        assert_eq!(def.blob_count(), 1);
        assert_eq!(def.column_index("NAME"), Some(1));
    }

    #[test]
    fn rejects_oversized_and_null() {
        let def = def();
        let err = def
            .encode(&[Value::Int(1), Value::Text("too long!!".into()), Value::Null])
            .unwrap_err();
        assert_eq!(err.column, "name");
        assert!(def.encode(&[Value::Null, Value::Null, Value::Null]).is_err());
    }

    proptest! {
        #[test]
        fn int_keys_sort_numerically(a: i64, b: i64) {
            let def = def();
            let ka = def.index_key(0, &def.encode(&[Value::Int(a), Value::Null, Value::Null]).unwrap());
            let kb = def.index_key(0, &def.encode(&[Value::Int(b), Value::Null, Value::Null]).unwrap());
            prop_assert_eq!(a.cmp(&b), ka.cmp(&kb));
        }
    }
}
