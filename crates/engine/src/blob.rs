//! Reconstruction of row and blob images from the write-ahead log.
//!
//! The store hands out the raw images written or removed by a log record.
//! Everything here strips the on-disk header and brings records up to the
//! current version of the source table, ready to be converted to the target
//! definition.

use std::collections::HashMap;

use livesc_store::{BlobSet, DataOp, LogBody, LogRecord, RowId, Store, UpdateOp};
use log::trace;

use crate::{
    error::{Result, SchemaChangeError},
    odh,
    schema::{ColumnType, TableDef, Value},
    tagmap::SchemaHistory,
};

/// Before and after blob images of one row within a transaction.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlobImages {
    pub old: BlobSet,
    pub new: BlobSet,
}

impl BlobImages {
    fn merge(&mut self, other: BlobImages) {
        for (no, data) in other.old.iter() {
            self.old.insert(no, data.to_vec());
        }
        for (no, data) in other.new.iter() {
            self.new.insert(no, data.to_vec());
        }
    }
}

/// Blob images gathered from the log records of one transaction, keyed by
/// the [`RowId::base`] of the row they belong to.
#[derive(Debug, Default)]
pub struct BlobRecordSet {
    rows: HashMap<RowId, BlobImages>,
}

impl BlobRecordSet {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    fn entry(&mut self, row: RowId) -> &mut BlobImages {
        self.rows.entry(row.base()).or_default()
    }

    /// Remove and return the images of `row`.
    pub fn take(&mut self, row: RowId) -> BlobImages {
        self.rows.remove(&row.base()).unwrap_or_default()
    }

    /// Remove and return the images of a row updated from `old` to `new`.
    pub fn take_update(&mut self, old: RowId, new: RowId) -> BlobImages {
        let mut images = self.take(old);
        if !old.same_row(new) {
            images.merge(self.take(new));
        }
        images
    }
}

/// Reconstructs images of rows of one source table.
pub struct Reconstructor<'a, S> {
    store: &'a S,
    history: &'a SchemaHistory,
}

fn corrupt(table: &str, row: RowId, reason: impl ToString) -> SchemaChangeError {
    SchemaChangeError::CorruptRecord {
        table: table.to_owned(),
        row,
        reason: reason.to_string(),
    }
}

/// Strip the on-disk header of a stored record, verify its length and
/// upgrade it to the current version of the table.
pub fn unpack_record(history: &SchemaHistory, row: RowId, image: &[u8]) -> Result<Vec<Value>> {
    let current = history.current();
    let table = current.name.as_str();
    let unpacked = odh::unpack(image).map_err(|e| corrupt(table, row, e))?;
    let upgrade = history.upgrade_map(unpacked.version);
    let def: &TableDef = match upgrade {
        Some(map) => map.from(),
        None if history.is_current(unpacked.version) => current,
        None => return Err(corrupt(table, row, format!("unknown version {}", unpacked.version))),
    };
    if unpacked.payload.len() != def.record_len() {
        return Err(corrupt(
            table,
            row,
            format!(
                "record is {} bytes but expected {}",
                unpacked.payload.len(),
                def.record_len()
            ),
        ));
    }
    let values = def.decode(&unpacked.payload).map_err(|e| corrupt(table, row, e))?;
    match upgrade {
        Some(map) => map.convert(&values),
        None => Ok(values),
    }
}

/// The schema version a stored record was written with.
pub fn record_version(table: &str, row: RowId, image: &[u8]) -> Result<u8> {
    odh::unpack(image)
        .map(|unpacked| unpacked.version)
        .map_err(|e| corrupt(table, row, e))
}

pub fn unpack_blob(table: &str, row: RowId, image: &[u8]) -> Result<Vec<u8>> {
    odh::unpack(image)
        .map(|unpacked| unpacked.payload)
        .map_err(|e| corrupt(table, row, e))
}

/// Check that the blob columns of `values` agree with `blobs`.
pub fn check_blob_consistency(def: &TableDef, row: RowId, values: &[Value], blobs: &BlobSet) -> Result<()> {
    for (column, value) in def.columns.iter().zip(values) {
        let ColumnType::Blob(blob_no) = column.ty else {
            continue;
        };
        let ok = match (value, blobs.get(blob_no)) {
            (Value::Null, None) => true,
            (Value::Blob(len), Some(data)) => *len as usize == data.len(),
            _ => false,
        };
        if !ok {
            return Err(corrupt(
                &def.name,
                row,
                format!("blob {blob_no} of column {} is inconsistent with the record", column.name),
            ));
        }
    }
    Ok(())
}

impl<'a, S: Store> Reconstructor<'a, S> {
    pub fn new(store: &'a S, history: &'a SchemaHistory) -> Self {
        Self { store, history }
    }

    fn table(&self) -> &str {
        &self.history.current().name
    }

    /// The row written by an add record.
    pub fn add(&self, rec: &LogRecord, op: &DataOp) -> Result<Vec<Value>> {
        let image = self.store.reconstruct_add(rec.lsn)?;
        unpack_record(self.history, op.genid, &image)
    }

    /// The row removed by a delete record.
    pub fn delete(&self, rec: &LogRecord, op: &DataOp) -> Result<Vec<Value>> {
        let image = self.store.reconstruct_delete(rec.lsn)?;
        unpack_record(self.history, op.genid, &image)
    }

    /// The rows before and after an update record.
    pub fn update(&self, rec: &LogRecord, op: &UpdateOp) -> Result<(Vec<Value>, Vec<Value>)> {
        let image = self.store.reconstruct_update(rec.lsn)?;
        let prev = unpack_record(self.history, op.old_genid, &image.prev)?;
        let next = unpack_record(self.history, op.new_genid, &image.next)?;
        Ok((prev, next))
    }

    /// Collect the blob images of all blob records in `records`.
    pub fn gather_blobs<'r>(&self, records: impl IntoIterator<Item = &'r LogRecord>) -> Result<BlobRecordSet> {
        let mut set = BlobRecordSet::new();
        for rec in records {
            match &rec.body {
                LogBody::Add(op) if op.dtafile > 0 => {
                    let image = self.store.reconstruct_add(rec.lsn)?;
                    let data = unpack_blob(self.table(), op.genid, &image)?;
                    set.entry(op.genid).new.insert(op.dtafile as usize - 1, data);
                }
                LogBody::Delete(op) if op.dtafile > 0 => {
                    let image = self.store.reconstruct_delete(rec.lsn)?;
                    let data = unpack_blob(self.table(), op.genid, &image)?;
                    set.entry(op.genid).old.insert(op.dtafile as usize - 1, data);
                }
                LogBody::Update(op) if op.dtafile > 0 => {
                    let blob_no = op.dtafile as usize - 1;
                    let image = self.store.reconstruct_update(rec.lsn)?;
                    let entry = set.entry(op.old_genid);
                    if op.old_dta_len > 0 {
                        entry.old.insert(blob_no, unpack_blob(self.table(), op.old_genid, &image.prev)?);
                        entry.new.insert(blob_no, unpack_blob(self.table(), op.new_genid, &image.next)?);
                    } else if op.is_inplace() {
                        entry.new.insert(blob_no, unpack_blob(self.table(), op.new_genid, &image.next)?);
                    } else {
                        // Without a before-image the new blob is found in `prev`.
                        entry.new.insert(blob_no, unpack_blob(self.table(), op.new_genid, &image.prev)?);
                    }
                }
                _ => continue,
            }
            trace!("blob image lsn={} row={:?}", rec.lsn, rec.genid());
        }
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Column;
    use livesc_store::{IndexKey, MemStore, Priority, RowWrite};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn history() -> SchemaHistory {
        let v2 = TableDef::new(
            "src",
            2,
            vec![
                Column::new("id", ColumnType::Int),
                Column::new("doc", ColumnType::Blob(0)).nullable(),
                Column::new("extra", ColumnType::UInt).with_default(Value::UInt(9)),
            ],
        );
        let v1 = TableDef::new(
            "src",
            1,
            vec![
                Column::new("id", ColumnType::Int),
                Column::new("doc", ColumnType::Blob(0)).nullable(),
            ],
        );
        SchemaHistory::new(v2).with_previous(v1).unwrap()
    }

    fn v1_record(id: i64, blob_len: u32) -> Vec<u8> {
        let h = history();
        let v1 = h.upgrade_map(1).unwrap().from().clone();
        odh::pack(1, &v1.encode(&[Value::Int(id), Value::Blob(blob_len)]).unwrap(), true)
    }

    #[test]
    fn upgrades_old_versions() {
        let h = history();
        let values = unpack_record(&h, RowId::new(1, 0), &v1_record(4, 3)).unwrap();
        assert_eq!(values, vec![Value::Int(4), Value::Blob(3), Value::UInt(9)]);
    }

    #[test]
    fn rejects_wrong_length_and_unknown_version() {
        let h = history();
        let short = odh::pack(2, &[1, 2, 3], false);
        assert!(matches!(
            unpack_record(&h, RowId::new(1, 0), &short),
            Err(SchemaChangeError::CorruptRecord { .. })
        ));
        let unknown = odh::pack(7, &[], false);
        assert!(unpack_record(&h, RowId::new(1, 0), &unknown).is_err());
    }

    #[test]
    fn blob_consistency() {
        let h = history();
        let def: Arc<TableDef> = h.current().clone();
        let mut blobs = BlobSet::new();
        blobs.insert(0, b"abc".to_vec());
        let row = RowId::new(1, 0);
        let values = [Value::Int(1), Value::Blob(3), Value::UInt(0)];
        assert!(check_blob_consistency(&def, row, &values, &blobs).is_ok());
        assert!(check_blob_consistency(&def, row, &values, &BlobSet::new()).is_err());
        let values = [Value::Int(1), Value::Null, Value::UInt(0)];
        assert!(check_blob_consistency(&def, row, &values, &blobs).is_err());
    }

    #[test]
    fn gathers_images_of_a_relocating_update() {
        let store = MemStore::new();
        store.create_table("src");
        let h = history();
        let old = RowId::new(1, 0);
        let new = RowId::new(2, 0);

        let write = |id: RowId, blobs: &[(usize, &[u8])]| RowWrite {
            id,
            record: v1_record(1, 0),
            blobs: blobs.iter().map(|(no, data)| (*no, odh::pack(1, data, false))).collect(),
            keys: vec![IndexKey {
                index: 0,
                key: vec![1],
                unique: true,
            }],
        };
        let mut txn = store.begin_txn(Priority::Normal).unwrap();
        store.insert_row(&mut txn, "src", write(old, &[(0, b"before")])).unwrap();
        store.commit_txn(txn).unwrap();

        let mut txn = store.begin_txn(Priority::Normal).unwrap();
        store
            .update_row(&mut txn, "src", old, write(new, &[(0, b"after"), (1, b"added")]))
            .unwrap();
        store.commit_txn(txn).unwrap();

        let records = store_records(&store);
        let r = Reconstructor::new(&store, &h);
        let mut set = r.gather_blobs(&records).unwrap();
        // Images of the old row and the blob only the new row has.
        assert_eq!(set.len(), 2);
        let images = set.take_update(old, new);
        assert_eq!(images.old.get(0), Some(&b"before"[..]));
        assert_eq!(images.new.get(0), Some(&b"after"[..]));
        assert_eq!(images.new.get(1), Some(&b"added"[..]));
        assert!(set.is_empty());
    }

    fn store_records(store: &MemStore) -> Vec<LogRecord> {
        use livesc_store::{Direction, Lsn};
        let mut out = Vec::new();
        let mut lsn = Lsn::ZERO;
        while let Some(rec) = store.log_get(lsn, Direction::Next).unwrap() {
            lsn = rec.lsn;
            out.push(rec);
        }
        out
    }
}
