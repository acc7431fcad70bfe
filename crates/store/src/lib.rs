//! The transactional record store as seen by the online schema change
//! engine.
//!
//! The engine never touches pages, locks or log files directly. Everything it
//! needs is expressed by the [`Store`] trait: row level transactions over
//! named tables, a cursor over the logical write-ahead log, a commit
//! notification stream and a small key/value store for progress metadata.
//!
//! With the `test` feature enabled, [`mem::MemStore`] provides an in-memory
//! implementation suitable for exercising the engine.

use std::time::Duration;

use crossbeam_channel::Receiver;

mod ids;
mod row;
mod wal;

pub mod error;
#[cfg(any(test, feature = "test"))]
pub mod mem;

pub use crate::{
    error::{Result, StoreError},
    ids::{Lsn, RowId, SeqNum, StripeCursor, TxnId, MAX_STRIPES},
    row::{
        BlobSet, IndexKey, LockStats, Priority, ProgressKey, ProgressValue, RowWrite, ScanCursor, ScanMode, StoredRow,
    },
    wal::{CommitNotice, DataOp, Direction, LogBody, LogRecord, UpdateImage, UpdateOp},
};
#[cfg(any(test, feature = "test"))]
pub use mem::MemStore;

/// A transactional record store.
///
/// Row operations take place inside a transaction obtained from
/// [`Store::begin_txn`], which must be finished by either
/// [`Store::commit_txn`] or [`Store::abort_txn`]. Lock conflicts are reported
/// as [`StoreError::Deadlock`], after which the caller is expected to abort
/// the transaction and try again.
///
/// Table names compare case-insensitively.
pub trait Store: Send + Sync + 'static {
    type Txn: Send;

    // Transactions

    fn begin_txn(&self, priority: Priority) -> Result<Self::Txn>;

    /// Commit `txn`, returning the replication sequence number of the commit.
    fn commit_txn(&self, txn: Self::Txn) -> Result<SeqNum>;

    /// Roll back all changes made by `txn` and release its locks.
    fn abort_txn(&self, txn: Self::Txn);

    /// Number of log bytes `txn` has generated so far.
    fn txn_log_bytes(&self, txn: &Self::Txn) -> usize;

    // Rows

    /// Return the first row after `cursor`, or `None` if the scan is
    /// exhausted.
    fn scan_next(&self, txn: &mut Self::Txn, table: &str, cursor: &ScanCursor) -> Result<Option<StoredRow>>;

    /// The stored record of row `id`, if it exists.
    ///
    /// The lookup ignores the update id of `id`.
    fn fetch_row(&self, txn: &mut Self::Txn, table: &str, id: RowId) -> Result<Option<StoredRow>>;

    fn fetch_blobs(&self, txn: &mut Self::Txn, table: &str, id: RowId) -> Result<BlobSet>;

    /// Insert a new row.
    ///
    /// Fails with [`StoreError::Exists`] if a row with the same base id is
    /// present, and with [`StoreError::DuplicateKey`] if a unique index
    /// already contains one of the row's keys.
    fn insert_row(&self, txn: &mut Self::Txn, table: &str, row: RowWrite) -> Result<()>;

    /// Replace row `old` by `row`, including its blobs and index keys.
    ///
    /// Fails with [`StoreError::NotFound`] if `old` does not exist, and with
    /// [`StoreError::Exists`] if `row.id` refers to a different row which is
    /// present.
    fn update_row(&self, txn: &mut Self::Txn, table: &str, old: RowId, row: RowWrite) -> Result<()>;

    /// Rewrite the stored record of row `id` without changing its id, blobs
    /// or keys.
    fn upgrade_row(&self, txn: &mut Self::Txn, table: &str, id: RowId, record: Vec<u8>) -> Result<()>;

    /// Delete row `id` and its blobs. Fails with [`StoreError::NotFound`] if
    /// it does not exist.
    fn delete_row(&self, txn: &mut Self::Txn, table: &str, id: RowId) -> Result<()>;

    /// True if index `index` of `table` contains `key`.
    fn key_exists(&self, txn: &mut Self::Txn, table: &str, index: usize, key: &[u8]) -> Result<bool>;

    /// Allocate a fresh row id in `stripe`.
    fn next_row_id(&self, table: &str, stripe: u8) -> Result<RowId>;

    // Write-ahead log

    fn log_get(&self, lsn: Lsn, direction: Direction) -> Result<Option<LogRecord>>;

    /// Position of the most recent commit record.
    fn last_commit_lsn(&self) -> Lsn;

    /// The image written by the add record at `lsn`.
    fn reconstruct_add(&self, lsn: Lsn) -> Result<Vec<u8>>;

    /// The image removed by the delete record at `lsn`.
    fn reconstruct_delete(&self, lsn: Lsn) -> Result<Vec<u8>>;

    /// The before and after images of the update record at `lsn`.
    fn reconstruct_update(&self, lsn: Lsn) -> Result<UpdateImage>;

    /// Receive a [`CommitNotice`] for every transaction committed from now on
    /// which wrote to `table`.
    ///
    /// Delivery is asynchronous: a notice may arrive after `commit_txn` or
    /// [`Store::quiesce_writes`] returned, and after its commit record became
    /// readable through [`Store::log_get`].
    fn subscribe_commits(&self, table: &str) -> Receiver<CommitNotice>;

    fn unsubscribe_commits(&self, table: &str);

    /// Keep log files starting at `file` around for readers of `table`.
    fn pin_log(&self, table: &str, file: u32);

    // Write control

    /// Block all further writes to `table` and return the position of the
    /// last commit that wrote to it.
    fn quiesce_writes(&self, table: &str) -> Result<Lsn>;

    fn resume_writes(&self, table: &str);

    /// Exchange the contents of tables `a` and `b`.
    fn swap_tables(&self, a: &str, b: &str) -> Result<()>;

    // Progress metadata

    /// Store a progress entry, either as part of `txn` or on its own.
    fn save_progress(
        &self,
        txn: Option<&mut Self::Txn>,
        table: &str,
        key: ProgressKey,
        value: ProgressValue,
    ) -> Result<()>;

    fn load_progress(&self, table: &str, key: ProgressKey) -> Result<Option<ProgressValue>>;

    /// Remove a progress entry. Removing an absent entry is not an error.
    fn delete_progress(&self, txn: Option<&mut Self::Txn>, table: &str, key: ProgressKey) -> Result<()>;

    /// All progress entries of `table`, in key order.
    fn list_progress(&self, table: &str) -> Result<Vec<(ProgressKey, ProgressValue)>>;

    /// The persisted conversion watermark of `stripe`.
    fn high_watermark_row_id(&self, table: &str, stripe: u8) -> Result<StripeCursor> {
        let cursor = self
            .load_progress(table, ProgressKey::StripeWatermark(stripe))?
            .and_then(|value| value.as_cursor())
            .unwrap_or_default();
        Ok(cursor)
    }

    fn set_high_watermark_row_id(
        &self,
        txn: Option<&mut Self::Txn>,
        table: &str,
        stripe: u8,
        cursor: StripeCursor,
    ) -> Result<()> {
        self.save_progress(
            txn,
            table,
            ProgressKey::StripeWatermark(stripe),
            ProgressValue::Cursor(cursor),
        )
    }

    // Environment

    /// Wait until the commit with sequence number `seqnum` has been
    /// acknowledged by the replicas, or `timeout` expires.
    fn wait_for_seqnum(&self, seqnum: SeqNum, timeout: Duration) -> Result<()>;

    /// Number of replicas currently lagging behind.
    fn incoherent_nodes(&self) -> usize;

    fn lock_stats(&self) -> LockStats;

    /// Free disk space in percent.
    fn disk_headroom_pct(&self) -> f64;

    /// True if some other thread is waiting for locks held by background
    /// work, which should yield as soon as possible.
    fn lock_desired(&self) -> bool {
        false
    }
}
