use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{Lsn, RowId, StripeCursor};

/// The order in which a converter walks the source table.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    /// Physical row-id order within a single stripe.
    #[default]
    ParallelByStripe,
    /// Primary key order over the whole table.
    IndexOrder,
    /// Store-provided ordered dump of the whole table.
    BulkDump,
}

impl ScanMode {
    pub fn is_parallel(&self) -> bool {
        matches!(self, Self::ParallelByStripe)
    }
}

/// Position of a scan, passed to [`crate::Store::scan_next`].
///
/// Each variant yields the first row strictly after the position it
/// describes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScanCursor {
    Stripe { stripe: u8, after: StripeCursor },
    /// Position in the primary key (index 0) as `(key, row)`.
    Index { after: Option<(Vec<u8>, RowId)> },
    Dump { after: Option<RowId> },
}

impl ScanCursor {
    /// Move the cursor past `row`.
    pub fn advance(&mut self, row: &StoredRow) {
        match self {
            Self::Stripe { after, .. } => *after = StripeCursor::At(row.id),
            Self::Index { after } => *after = Some((row.index_key.clone(), row.id)),
            Self::Dump { after } => *after = Some(row.id),
        }
    }
}

/// A row as returned by a scan.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredRow {
    pub id: RowId,
    /// The record as stored, including its on-disk header.
    pub record: Vec<u8>,
    /// Primary key of the row. Only filled in by index-order scans.
    pub index_key: Vec<u8>,
}

/// The blobs of a single row, keyed by blob number.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlobSet(BTreeMap<usize, Vec<u8>>);

impl BlobSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, blob_no: usize, data: Vec<u8>) -> Option<Vec<u8>> {
        self.0.insert(blob_no, data)
    }

    pub fn get(&self, blob_no: usize) -> Option<&[u8]> {
        self.0.get(&blob_no).map(Vec::as_slice)
    }

    pub fn remove(&mut self, blob_no: usize) -> Option<Vec<u8>> {
        self.0.remove(&blob_no)
    }

    pub fn contains(&self, blob_no: usize) -> bool {
        self.0.contains_key(&blob_no)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &[u8])> {
        self.0.iter().map(|(no, data)| (*no, data.as_slice()))
    }

    /// Total payload size of all blobs.
    pub fn byte_len(&self) -> usize {
        self.0.values().map(Vec::len).sum()
    }
}

impl FromIterator<(usize, Vec<u8>)> for BlobSet {
    fn from_iter<T: IntoIterator<Item = (usize, Vec<u8>)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// An index entry of a row to be written.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexKey {
    pub index: usize,
    pub key: Vec<u8>,
    pub unique: bool,
}

/// A fully prepared row: the record, its blobs and the keys of every index
/// the row is a member of.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RowWrite {
    pub id: RowId,
    pub record: Vec<u8>,
    pub blobs: BlobSet,
    pub keys: Vec<IndexKey>,
}

impl RowWrite {
    /// Bytes this write will add to the log, before any overhead.
    pub fn estimated_log_bytes(&self) -> usize {
        self.record.len() + self.blobs.byte_len() + self.keys.iter().map(|k| k.key.len()).sum::<usize>()
    }
}

/// Transaction priority. Schema change transactions run at low priority so
/// that they lose lock conflicts against application writes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Priority {
    #[default]
    Normal,
    Low,
}

/// Cumulative lock statistics of the store.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LockStats {
    pub deadlocks: u64,
    pub lock_waits: u64,
}

/// Key of a schema change progress entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ProgressKey {
    /// Log position the logical redo resumes from.
    StartLsn,
    /// Conversion watermark of one stripe.
    StripeWatermark(u8),
    /// An outstanding race entry of the logical redo.
    RedoGenid(RowId),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProgressValue {
    Lsn(Lsn),
    Cursor(StripeCursor),
}

impl ProgressValue {
    pub fn as_lsn(&self) -> Option<Lsn> {
        match self {
            Self::Lsn(lsn) => Some(*lsn),
            Self::Cursor(_) => None,
        }
    }

    pub fn as_cursor(&self) -> Option<StripeCursor> {
        match self {
            Self::Cursor(cursor) => Some(*cursor),
            Self::Lsn(_) => None,
        }
    }
}
