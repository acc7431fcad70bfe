use enum_as_inner::EnumAsInner;

use crate::{Lsn, RowId, TxnId};

/// How [`crate::Store::log_get`] positions the log cursor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// The record at exactly the given position.
    Set,
    /// The first record after the given position.
    Next,
    /// The last record before the given position.
    Prev,
    First,
    Last,
}

/// A record of the write-ahead log.
///
/// Records of one transaction are chained backwards through `prev_lsn`,
/// starting from the transaction's [`LogBody::Commit`] record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogRecord {
    pub lsn: Lsn,
    pub txnid: TxnId,
    pub prev_lsn: Option<Lsn>,
    pub body: LogBody,
}

impl LogRecord {
    /// The table a logical data operation applies to.
    pub fn table(&self) -> Option<&str> {
        match &self.body {
            LogBody::Add(op) | LogBody::Delete(op) => Some(op.table.as_str()),
            LogBody::Update(op) => Some(op.table.as_str()),
            LogBody::Commit | LogBody::Other => None,
        }
    }

    /// True for logical add, delete and update records.
    pub fn is_data_op(&self) -> bool {
        matches!(self.body, LogBody::Add(_) | LogBody::Delete(_) | LogBody::Update(_))
    }

    /// The data file the record was written to: 0 for the row itself, blob
    /// number + 1 for blobs.
    pub fn dtafile(&self) -> Option<u8> {
        match &self.body {
            LogBody::Add(op) | LogBody::Delete(op) => Some(op.dtafile),
            LogBody::Update(op) => Some(op.dtafile),
            LogBody::Commit | LogBody::Other => None,
        }
    }

    /// The row id the record refers to. For updates this is the id before
    /// the update.
    pub fn genid(&self) -> Option<RowId> {
        match &self.body {
            LogBody::Add(op) | LogBody::Delete(op) => Some(op.genid),
            LogBody::Update(op) => Some(op.old_genid),
            LogBody::Commit | LogBody::Other => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, EnumAsInner)]
pub enum LogBody {
    Add(DataOp),
    Delete(DataOp),
    Update(UpdateOp),
    Commit,
    /// A record the schema change engine has no interest in, e.g. index
    /// maintenance or page allocation.
    Other,
}

/// A logical add or delete of a row or one of its blobs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataOp {
    pub table: String,
    pub dtafile: u8,
    pub genid: RowId,
    /// Length of the image written or removed.
    pub len: u32,
}

/// A logical update of a row or one of its blobs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdateOp {
    pub table: String,
    pub dtafile: u8,
    pub old_genid: RowId,
    pub new_genid: RowId,
    /// Length of the image before the update. Zero means the update image
    /// carries no separate before-image.
    pub old_dta_len: u32,
}

impl UpdateOp {
    /// True if the update kept the physical row in place.
    pub fn is_inplace(&self) -> bool {
        self.old_genid.same_row(self.new_genid)
    }
}

/// Both images recovered by [`crate::Store::reconstruct_update`].
///
/// For a blob updated out of place whose record carries no before-image
/// (`old_dta_len == 0`) the store leaves the new image in `prev`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UpdateImage {
    pub prev: Vec<u8>,
    pub next: Vec<u8>,
}

/// Notification sent by the commit path of the store for every committed
/// transaction that touched a subscribed table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommitNotice {
    /// Position of the transaction's commit record.
    pub lsn: Lsn,
    pub txnid: TxnId,
}
