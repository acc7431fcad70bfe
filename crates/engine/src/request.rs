use std::sync::Arc;

use livesc_store::{RowId, ScanMode, MAX_STRIPES};

use crate::{
    error::{Result, SchemaChangeError},
    schema::TableDef,
    tagmap::SchemaHistory,
};

/// Description of one schema change: copy every row of `source` into the
/// table `target`, converting records to the target definition.
#[derive(Clone, Debug)]
pub struct SchemaChangeRequest {
    /// The table being changed, with the versions its records may still be
    /// stored under.
    pub source: Arc<SchemaHistory>,
    /// Definition of the new table. A table of that name must exist and be
    /// empty, unless resuming.
    pub target: Arc<TableDef>,
    pub scan_mode: ScanMode,
    /// Number of data stripes of the source table.
    pub stripes: u8,
    /// The source table stays writable while the change runs.
    pub live: bool,
    /// Replay concurrent writes from the log into the target table.
    pub logical: bool,
    /// Only the indexes change. Records keep their layout and blobs are left
    /// with the source table unless needed to compute keys.
    pub rebuild_index_only: bool,
    /// Give every copied row a freshly allocated row id.
    pub use_new_row_ids: bool,
    /// Rewrite every record, even for an index only rebuild.
    pub force_rebuild: bool,
    /// Proceed despite low disk headroom.
    pub force: bool,
    /// Continue an interrupted change from its persisted progress.
    pub resume: bool,
    /// Exchange source and target once the change completed.
    pub cutover: bool,
}

impl SchemaChangeRequest {
    pub fn new(source: Arc<SchemaHistory>, target: Arc<TableDef>) -> Self {
        Self {
            source,
            target,
            scan_mode: ScanMode::ParallelByStripe,
            stripes: 1,
            live: false,
            logical: false,
            rebuild_index_only: false,
            use_new_row_ids: false,
            force_rebuild: false,
            force: false,
            resume: false,
            cutover: false,
        }
    }

    /// A live change with logical redo.
    pub fn live(mut self) -> Self {
        self.live = true;
        self.logical = true;
        self
    }

    pub fn with_stripes(mut self, stripes: u8) -> Self {
        self.stripes = stripes;
        self
    }

    pub fn with_scan_mode(mut self, scan_mode: ScanMode) -> Self {
        self.scan_mode = scan_mode;
        self
    }

    pub fn source_table(&self) -> &str {
        &self.source.current().name
    }

    pub fn target_table(&self) -> &str {
        &self.target.name
    }

    /// Number of converter workers.
    pub fn workers(&self) -> u8 {
        if self.scan_mode.is_parallel() { self.stripes } else { 1 }
    }

    pub fn validate(&self) -> Result<()> {
        let refuse = |msg: &str| -> Result<()> { Err(SchemaChangeError::Config(msg.to_owned())) };
        if self.stripes == 0 || self.stripes > MAX_STRIPES {
            return Err(SchemaChangeError::Config(format!(
                "stripes must be between 1 and {MAX_STRIPES}, got {}",
                self.stripes
            )));
        }
        if self.source_table().eq_ignore_ascii_case(self.target_table()) {
            return refuse("source and target must be different tables");
        }
        if self.live && !self.logical {
            return refuse("a live schema change requires logical redo");
        }
        if self.logical && !self.scan_mode.is_parallel() {
            return refuse("logical redo requires a parallel stripe scan");
        }
        if self.logical && self.use_new_row_ids {
            return refuse("logical redo cannot follow rows whose id changes");
        }
        if self.resume && self.use_new_row_ids {
            return refuse("cannot resume a schema change that assigns new row ids");
        }
        if self.resume && !self.scan_mode.is_parallel() {
            return refuse("only parallel stripe scans can be resumed");
        }
        Ok(())
    }
}

/// How many records [`crate::upgrade_all_records`] rewrites.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpgradeKind {
    /// Every record of the table.
    Full,
    /// Stop after `max_records` upgraded records, or at the first record
    /// that is already current.
    Partial { max_records: u64 },
}

/// Rewrite the records of a table in place to its current version.
#[derive(Clone, Debug)]
pub struct UpgradeRequest {
    pub history: Arc<SchemaHistory>,
    pub scan_mode: ScanMode,
    pub stripes: u8,
    pub kind: UpgradeKind,
    /// A sequential scan visits only rows after this one. Ignored by parallel
    /// scans.
    pub start: Option<RowId>,
    pub force: bool,
}

impl UpgradeRequest {
    pub fn new(history: Arc<SchemaHistory>, stripes: u8) -> Self {
        Self {
            history,
            scan_mode: ScanMode::ParallelByStripe,
            stripes,
            kind: UpgradeKind::Full,
            start: None,
            force: false,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.stripes == 0 || self.stripes > MAX_STRIPES {
            return Err(SchemaChangeError::Config(format!(
                "stripes must be between 1 and {MAX_STRIPES}, got {}",
                self.stripes
            )));
        }
        if self.scan_mode == ScanMode::IndexOrder {
            return Err(SchemaChangeError::Config(
                "records can not be upgraded in index order".to_owned(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Column, ColumnType};

    fn request() -> SchemaChangeRequest {
        let def = TableDef::new("t", 1, vec![Column::new("id", ColumnType::Int)]);
        let target = TableDef::new("new_t", 2, def.columns.clone());
        SchemaChangeRequest::new(Arc::new(SchemaHistory::new(def)), Arc::new(target)).with_stripes(4)
    }

    #[test]
    fn validation() {
        assert!(request().validate().is_ok());
        assert!(request().live().validate().is_ok());
        assert!(request().with_stripes(0).validate().is_err());
        assert!(request().with_stripes(MAX_STRIPES + 1).validate().is_err());

        let mut req = request();
        req.live = true;
        assert!(req.validate().is_err());

        let req = request().live().with_scan_mode(ScanMode::BulkDump);
        assert!(req.validate().is_err());
        assert_eq!(request().with_scan_mode(ScanMode::BulkDump).workers(), 1);

        let mut req = request().live();
        req.use_new_row_ids = true;
        assert!(req.validate().is_err());

        let mut req = request();
        req.target = Arc::new(TableDef::new("T", 2, Vec::new()));
        assert!(req.validate().is_err());
    }
}
