//! Turning a row of the source table into a write against the target table.

use std::sync::Arc;

use livesc_store::{BlobSet, IndexKey, RowId, RowWrite, Store};

use crate::{
    error::{ConstraintKind, Result, RowError, SchemaChangeError},
    odh,
    schema::{TableDef, Value},
    tagmap::{SchemaHistory, TagMap},
};

/// Everything needed to convert rows from the source to the target table,
/// built once per schema change and shared between all workers.
#[derive(Debug)]
pub struct Conversion {
    history: Arc<SchemaHistory>,
    map: TagMap,
    fetch_blobs: bool,
}

/// Source blobs to carry into the target row.
pub enum Blobs<'a> {
    /// Blobs were not fetched. The record is checked without them and the
    /// target row carries none.
    Skipped,
    Fetched(&'a BlobSet),
}

impl Conversion {
    /// `rebuild_index_only` conversions leave blobs with the source table
    /// unless `force_rebuild` is set or the target needs them to verify
    /// partial indexes or checks.
    pub fn new(
        history: Arc<SchemaHistory>,
        target: Arc<TableDef>,
        rebuild_index_only: bool,
        force_rebuild: bool,
    ) -> Result<Self> {
        let map = TagMap::new(history.current().clone(), target.clone())?;
        let fetch_blobs = history.current().blob_count() > 0
            && (!rebuild_index_only || force_rebuild || target.has_partial_indexes() || !target.checks.is_empty());
        Ok(Self {
            history,
            map,
            fetch_blobs,
        })
    }

    pub fn history(&self) -> &Arc<SchemaHistory> {
        &self.history
    }

    pub fn source(&self) -> &Arc<TableDef> {
        self.history.current()
    }

    pub fn target(&self) -> &Arc<TableDef> {
        self.map.to()
    }

    pub fn fetch_blobs(&self) -> bool {
        self.fetch_blobs
    }

    /// Convert the source row `values` to a write of row `id` of the target
    /// table, verifying the target's constraints.
    ///
    /// Foreign keys are looked up in `txn`, so a conflicting parent row
    /// surfaces as [`RowError::Retry`].
    pub(crate) fn prepare<S: Store>(
        &self,
        store: &S,
        txn: &mut S::Txn,
        id: RowId,
        values: &[Value],
        blobs: Blobs<'_>,
    ) -> std::result::Result<RowWrite, RowError> {
        let target = self.target();
        let values = self.map.convert(values)?;
        let encoded = target.encode(&values).map_err(|e| SchemaChangeError::ConversionFailure {
            table: target.name.clone(),
            column: e.column,
            reason: e.reason,
        })?;

        let mut keys = Vec::with_capacity(target.indexes.len());
        for (i, index) in target.indexes.iter().enumerate() {
            if let Some(predicate) = &index.predicate {
                match predicate.eval(&values) {
                    Ok(Some(true)) => {}
                    Ok(_) => continue,
                    Err(_) => return Err(RowError::Constraint(ConstraintKind::PartialIndex { index: i })),
                }
            }
            keys.push(IndexKey {
                index: i,
                key: target.index_key(i, &encoded),
                unique: index.unique,
            });
        }

        for check in &target.checks {
            // Unknown passes.
            if !matches!(check.expr.eval(&values), Ok(Some(true) | None)) {
                return Err(RowError::Constraint(ConstraintKind::Check {
                    name: check.name.clone(),
                }));
            }
        }

        for fk in &target.foreign_keys {
            if fk.columns.iter().any(|c| values.get(*c).is_none_or(Value::is_null)) {
                continue;
            }
            let key = target.key(&fk.columns, &encoded);
            if !store.key_exists(txn, &fk.parent_table, fk.parent_index, &key)? {
                return Err(RowError::Constraint(ConstraintKind::ForeignKey { name: fk.name.clone() }));
            }
        }

        let blobs = match blobs {
            Blobs::Skipped => BlobSet::new(),
            Blobs::Fetched(blobs) => self
                .map
                .convert_blobs(blobs)
                .iter()
                .map(|(no, data)| (no, odh::pack(target.version, data, target.compressed)))
                .collect(),
        };

        Ok(RowWrite {
            id,
            record: odh::pack(target.version, &encoded, target.compressed),
            blobs,
            keys,
        })
    }
}
