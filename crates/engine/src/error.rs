use std::{fmt, io};

use livesc_store::{Lsn, RowId, StoreError};
use thiserror::Error;

/// Why an operation stopped without failing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AbortReason {
    /// [`crate::SchemaChange::request_abort`] was called.
    Requested,
    /// This node stopped being the write master.
    MasterDowngrade,
    /// Free disk space dropped below the configured minimum.
    DiskHeadroom,
    /// Another worker of the same operation failed.
    PeerFailed { stripe: Option<u8> },
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Requested => f.write_str("requested"),
            Self::MasterDowngrade => f.write_str("master downgrade"),
            Self::DiskHeadroom => f.write_str("insufficient disk headroom"),
            Self::PeerFailed { stripe: Some(stripe) } => write!(f, "stripe {stripe} failed"),
            Self::PeerFailed { stripe: None } => f.write_str("logical redo failed"),
        }
    }
}

/// The constraint a row of the target table violates.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConstraintKind {
    DuplicateKey { index: usize },
    Check { name: String },
    ForeignKey { name: String },
    PartialIndex { index: usize },
}

impl fmt::Display for ConstraintKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateKey { index } => write!(f, "duplicate key in index {index}"),
            Self::Check { name } => write!(f, "check constraint {name}"),
            Self::ForeignKey { name } => write!(f, "foreign key {name}"),
            Self::PartialIndex { index } => write!(f, "partial index {index} predicate"),
        }
    }
}

#[derive(Debug, Error)]
pub enum SchemaChangeError {
    #[error("corrupt record: table={table} row={row}: {reason}")]
    CorruptRecord { table: String, row: RowId, reason: String },
    #[error("conversion failed: table={table} column={column}: {reason}")]
    ConversionFailure {
        table: String,
        column: String,
        reason: String,
    },
    #[error("constraint violation: table={table} row={row}: {kind}")]
    ConstraintViolation {
        table: String,
        row: RowId,
        kind: ConstraintKind,
    },
    #[error("integrity violation: table={table} row={row} lsn={lsn}: {reason}")]
    IntegrityViolation {
        table: String,
        row: RowId,
        lsn: Lsn,
        reason: String,
    },
    #[error("schema change aborted: {0}")]
    Aborted(AbortReason),
    #[error("retry limit exceeded: table={table} retries={retries}")]
    RetryLimit { table: String, retries: u64 },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("failed to read configuration")]
    ConfigIo(#[source] io::Error),
    #[error("failed to spawn worker thread")]
    Spawn(#[source] io::Error),
    #[error("{0} thread panicked")]
    Panicked(String),
}

impl SchemaChangeError {
    /// False for intentional stops, which should not be reported as failures.
    pub fn is_failure(&self) -> bool {
        !matches!(self, Self::Aborted(_))
    }

    pub(crate) fn constraint(table: &str, row: RowId, kind: ConstraintKind) -> Self {
        Self::ConstraintViolation {
            table: table.to_owned(),
            row,
            kind,
        }
    }
}

pub type Result<T> = std::result::Result<T, SchemaChangeError>;

/// Outcome of processing a single row, used inside the workers.
#[derive(Debug)]
pub(crate) enum RowError {
    /// Lock conflict: abort the transaction and try the row again.
    Retry,
    /// The prepared row violates a constraint of the target table.
    Constraint(ConstraintKind),
    Fatal(SchemaChangeError),
}

impl From<StoreError> for RowError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Deadlock => Self::Retry,
            StoreError::DuplicateKey { index, .. } => Self::Constraint(ConstraintKind::DuplicateKey { index }),
            e => Self::Fatal(e.into()),
        }
    }
}

impl From<SchemaChangeError> for RowError {
    fn from(e: SchemaChangeError) -> Self {
        Self::Fatal(e)
    }
}
