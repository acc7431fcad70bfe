use std::io;

use thiserror::Error;

use crate::{Lsn, RowId};

pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors reported by a [`crate::Store`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// The operation lost a lock conflict and the transaction must be
    /// aborted and retried.
    #[error("deadlock")]
    Deadlock,
    #[error("duplicate key in unique index: table={table} index={index}")]
    DuplicateKey { table: String, index: usize },
    /// The row to update or delete does not exist.
    #[error("row not found: table={table} row={row}")]
    NotFound { table: String, row: RowId },
    /// A row with the same id already exists.
    #[error("row already exists: table={table} row={row}")]
    Exists { table: String, row: RowId },
    #[error("no such table: {0}")]
    NoSuchTable(String),
    #[error("no log record at lsn={lsn}")]
    LogNotFound { lsn: Lsn },
    /// Writes to the table are currently blocked.
    #[error("table is locked for writing: {0}")]
    TableLocked(String),
    #[error("replication wait timed out: seqnum={seqnum}")]
    ReplicationTimeout { seqnum: u64 },
    #[error("corrupt store data: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl StoreError {
    /// True if the caller should abort the transaction and try again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Deadlock)
    }
}
