//! Online schema change.
//!
//! A [`SchemaChange`] copies every row of a table into a new table built from
//! a different definition, while the source table may keep taking writes.
//! The source is split into stripes, each scanned by its own converter
//! thread. In live mode a logical redo thread follows the write-ahead log and
//! replays writes committed behind the converters' backs into the new table.
//! Once all stripes are converted, writes to the source are quiesced, the redo
//! catches up to the last commit and the tables may be swapped.
//!
//! [`upgrade_all_records`] rewrites the records of a table in place to the
//! current version of its definition, using the same scan and pacing
//! machinery.
//!
//! The engine runs against any [`livesc_store::Store`].

mod blob;
mod converter;
mod orchestrator;
mod prepare;
mod redo;
mod state;
mod tracker;
mod upgrade;

pub mod config;
pub mod error;
pub mod expr;
pub mod metrics;
pub mod odh;
pub mod report;
pub mod request;
pub mod schema;
pub mod tagmap;
pub mod throttle;

pub use crate::{
    config::Options,
    error::{AbortReason, ConstraintKind, Result, SchemaChangeError},
    expr::{CmpOp, Expr},
    orchestrator::{SchemaChange, SchemaChangeHandle},
    report::{LogSink, ProgressSink, ProgressSnapshot},
    request::{SchemaChangeRequest, UpgradeKind, UpgradeRequest},
    schema::{CheckDef, Column, ColumnType, ForeignKeyDef, IndexDef, TableDef, Value},
    tagmap::SchemaHistory,
    throttle::Throttle,
    upgrade::{upgrade_all_records, RecordUpgrade, UpgradeStats},
};
