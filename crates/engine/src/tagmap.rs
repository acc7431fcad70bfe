//! Field mappings between two table definitions.

use std::{collections::BTreeMap, sync::Arc};

use livesc_store::BlobSet;

use crate::{
    error::{Result, SchemaChangeError},
    schema::{Column, ColumnType, TableDef, Value},
};

/// Where a target column takes its value from.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldSource {
    Column(usize),
    Default(Value),
    Null,
}

/// Mapping of the columns of table definition `from` onto `to`.
///
/// Built once per pair of definitions and shared read-only between workers.
#[derive(Debug)]
pub struct TagMap {
    from: Arc<TableDef>,
    to: Arc<TableDef>,
    fields: Vec<FieldSource>,
    /// Target blob number -> source blob number.
    blobs: BTreeMap<usize, usize>,
}

fn conversion_failure(table: &TableDef, column: &Column, reason: impl Into<String>) -> SchemaChangeError {
    SchemaChangeError::ConversionFailure {
        table: table.name.clone(),
        column: column.name.clone(),
        reason: reason.into(),
    }
}

fn compatible(from: ColumnType, to: ColumnType) -> bool {
    use ColumnType::*;
    matches!(
        (from, to),
        (Int | UInt, Int | UInt) | (Text(_) | Bytes(_), Text(_) | Bytes(_)) | (Blob(_), Blob(_))
    )
}

impl TagMap {
    pub fn new(from: Arc<TableDef>, to: Arc<TableDef>) -> Result<Self> {
        let mut fields = Vec::with_capacity(to.columns.len());
        let mut blobs = BTreeMap::new();
        for column in &to.columns {
            let source = match from.column_index(&column.name) {
                Some(i) => {
                    let src = &from.columns[i];
                    if !compatible(src.ty, column.ty) {
                        return Err(conversion_failure(
                            &to,
                            column,
                            format!("incompatible types {:?} -> {:?}", src.ty, column.ty),
                        ));
                    }
                    if let (ColumnType::Blob(s), ColumnType::Blob(t)) = (src.ty, column.ty) {
                        blobs.insert(t, s);
                    }
                    FieldSource::Column(i)
                }
                None => match &column.default {
                    Some(value) => FieldSource::Default(value.clone()),
                    None if column.nullable => FieldSource::Null,
                    None => {
                        return Err(conversion_failure(
                            &to,
                            column,
                            "new column needs a default or must be nullable",
                        ));
                    }
                },
            };
            fields.push(source);
        }
        Ok(Self { from, to, fields, blobs })
    }

    pub fn from(&self) -> &Arc<TableDef> {
        &self.from
    }

    pub fn to(&self) -> &Arc<TableDef> {
        &self.to
    }

    pub fn fields(&self) -> &[FieldSource] {
        &self.fields
    }

    /// Convert decoded source values into values of the target definition.
    pub fn convert(&self, values: &[Value]) -> Result<Vec<Value>> {
        self.to
            .columns
            .iter()
            .zip(&self.fields)
            .map(|(column, source)| match source {
                FieldSource::Column(i) => {
                    let value = values.get(*i).cloned().unwrap_or(Value::Null);
                    self.convert_value(column, value)
                }
                FieldSource::Default(value) => Ok(value.clone()),
                FieldSource::Null => Ok(Value::Null),
            })
            .collect()
    }

    fn convert_value(&self, column: &Column, value: Value) -> Result<Value> {
        let fail = |reason: String| conversion_failure(&self.to, column, reason);
        let converted = match (value, column.ty) {
            (Value::Null, _) if column.nullable => Value::Null,
            (Value::Null, _) => match &column.default {
                Some(default) => default.clone(),
                None => return Err(fail("null in non-nullable column".into())),
            },
            (Value::Int(v), ColumnType::Int) => Value::Int(v),
            (Value::Int(v), ColumnType::UInt) => {
                Value::UInt(u64::try_from(v).map_err(|_| fail(format!("{v} out of range")))?)
            }
            (Value::UInt(v), ColumnType::UInt) => Value::UInt(v),
            (Value::UInt(v), ColumnType::Int) => {
                Value::Int(i64::try_from(v).map_err(|_| fail(format!("{v} out of range")))?)
            }
            (Value::Text(s), ColumnType::Text(n)) => {
                if s.len() > n as usize {
                    return Err(fail(format!("{} bytes would be truncated to {n}", s.len())));
                }
                Value::Text(s)
            }
            (Value::Text(s), ColumnType::Bytes(n)) => {
                if s.len() > n as usize {
                    return Err(fail(format!("{} bytes would be truncated to {n}", s.len())));
                }
                Value::Bytes(s.into_bytes())
            }
            (Value::Bytes(b), ColumnType::Bytes(n)) => {
                if b.len() > n as usize {
                    return Err(fail(format!("{} bytes would be truncated to {n}", b.len())));
                }
                Value::Bytes(b)
            }
            (Value::Bytes(b), ColumnType::Text(n)) => {
                if b.len() > n as usize {
                    return Err(fail(format!("{} bytes would be truncated to {n}", b.len())));
                }
                Value::Text(String::from_utf8(b).map_err(|e| fail(e.to_string()))?)
            }
            (Value::Blob(len), ColumnType::Blob(_)) => Value::Blob(len),
            (value, ty) => return Err(fail(format!("cannot convert {value:?} to {ty:?}"))),
        };
        Ok(converted)
    }

    /// Renumber the blobs of a source row for the target definition.
    pub fn convert_blobs(&self, blobs: &BlobSet) -> BlobSet {
        self.blobs
            .iter()
            .filter_map(|(to, from)| blobs.get(*from).map(|data| (*to, data.to_vec())))
            .collect()
    }
}

/// The versions a table went through, with the mappings needed to upgrade
/// records stored under an older version to the current one.
#[derive(Debug)]
pub struct SchemaHistory {
    current: Arc<TableDef>,
    upgrades: BTreeMap<u8, Arc<TagMap>>,
}

impl SchemaHistory {
    pub fn new(current: TableDef) -> Self {
        Self {
            current: Arc::new(current),
            upgrades: BTreeMap::new(),
        }
    }

    /// Register an older version of the table.
    pub fn with_previous(mut self, previous: TableDef) -> Result<Self> {
        let version = previous.version;
        let map = TagMap::new(Arc::new(previous), self.current.clone())?;
        self.upgrades.insert(version, Arc::new(map));
        Ok(self)
    }

    pub fn current(&self) -> &Arc<TableDef> {
        &self.current
    }

    /// The mapping from `version` to the current version, `None` if `version`
    /// is the current one or unknown.
    pub fn upgrade_map(&self, version: u8) -> Option<&Arc<TagMap>> {
        self.upgrades.get(&version)
    }

    pub fn is_current(&self, version: u8) -> bool {
        version == self.current.version
    }
}
