//! Bookkeeping of rows inserted out of turn by the logical redo.
//!
//! When the redo finds a row it is about to insert already present in the
//! new table, the two sides of the schema change raced for that row. The
//! redo removes its copy and records the row id with the log position of the
//! race, so that the delete of the stale row which must follow is recognized
//! as already handled.
//!
//! The tracker is owned by the redo thread and is not synchronized.

use std::collections::{BTreeSet, HashMap};

use livesc_store::{Lsn, RowId};
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RedoGenidEntry {
    pub row: RowId,
    pub lsn: Lsn,
}

#[derive(Debug, Error)]
#[error("row {row} is already tracked since {lsn}")]
pub struct AlreadyTracked {
    pub row: RowId,
    pub lsn: Lsn,
}

enum Change {
    Recorded(RowId),
    Resolved(RowId, Lsn),
}

/// Race entries, by row id and by log position.
///
/// Row ids are tracked by their [`RowId::base`].
#[derive(Default)]
pub struct GenidTracker {
    by_row: HashMap<RowId, Lsn>,
    by_lsn: BTreeSet<(Lsn, RowId)>,
    journal: Option<Vec<Change>>,
}

impl GenidTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `row` as raced at `lsn`.
    ///
    /// A row can only be tracked once at a time.
    pub fn record(&mut self, row: RowId, lsn: Lsn) -> Result<(), AlreadyTracked> {
        let row = row.base();
        if let Some(lsn) = self.by_row.get(&row) {
            return Err(AlreadyTracked { row, lsn: *lsn });
        }
        self.by_row.insert(row, lsn);
        self.by_lsn.insert((lsn, row));
        if let Some(journal) = &mut self.journal {
            journal.push(Change::Recorded(row));
        }
        Ok(())
    }

    /// Stop tracking `row`, returning the position it was recorded at.
    pub fn resolve(&mut self, row: RowId) -> Option<Lsn> {
        let row = row.base();
        let lsn = self.by_row.remove(&row)?;
        self.by_lsn.remove(&(lsn, row));
        if let Some(journal) = &mut self.journal {
            journal.push(Change::Resolved(row, lsn));
        }
        Some(lsn)
    }

    pub fn get(&self, row: RowId) -> Option<Lsn> {
        self.by_row.get(&row.base()).copied()
    }

    /// The entry with the lowest log position.
    pub fn oldest(&self) -> Option<RedoGenidEntry> {
        self.by_lsn.first().map(|(lsn, row)| RedoGenidEntry { row: *row, lsn: *lsn })
    }

    pub fn len(&self) -> usize {
        self.by_row.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_row.is_empty()
    }

    /// All entries, oldest first.
    pub fn entries(&self) -> impl Iterator<Item = RedoGenidEntry> + '_ {
        self.by_lsn.iter().map(|(lsn, row)| RedoGenidEntry { row: *row, lsn: *lsn })
    }

    /// Start journaling changes, so they can be undone if the transaction
    /// they belong to aborts.
    pub fn begin_batch(&mut self) {
        self.journal = Some(Vec::new());
    }

    pub fn commit_batch(&mut self) {
        self.journal = None;
    }

    /// Undo all changes since [`Self::begin_batch`].
    pub fn rollback_batch(&mut self) {
        let Some(journal) = self.journal.take() else {
            return;
        };
        for change in journal.into_iter().rev() {
            match change {
                Change::Recorded(row) => {
                    if let Some(lsn) = self.by_row.remove(&row) {
                        self.by_lsn.remove(&(lsn, row));
                    }
                }
                Change::Resolved(row, lsn) => {
                    self.by_row.insert(row, lsn);
                    self.by_lsn.insert((lsn, row));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn lsn(n: u32) -> Lsn {
        Lsn::new(1, n)
    }

    #[test]
    fn rejects_duplicates() {
        let mut t = GenidTracker::new();
        let row = RowId::new(99, 1);
        t.record(row, lsn(5)).unwrap();
        let err = t.record(row.next_update(), lsn(7)).unwrap_err();
        assert_eq!(err.lsn, lsn(5));
        assert_eq!(t.len(), 1);
        assert_eq!(t.resolve(row), Some(lsn(5)));
        assert_eq!(t.resolve(row), None);
        assert!(t.is_empty());
    }

    #[test]
    fn oldest_follows_log_order() {
        let mut t = GenidTracker::new();
        t.record(RowId::new(1, 0), lsn(30)).unwrap();
        t.record(RowId::new(2, 0), lsn(10)).unwrap();
        t.record(RowId::new(3, 0), lsn(20)).unwrap();
        assert_eq!(t.oldest().map(|e| e.row), Some(RowId::new(2, 0)));
        t.resolve(RowId::new(2, 0));
        assert_eq!(t.oldest().map(|e| e.lsn), Some(lsn(20)));
    }

    #[test]
    fn rollback_restores_state() {
        let mut t = GenidTracker::new();
        t.record(RowId::new(1, 0), lsn(1)).unwrap();
        t.begin_batch();
        t.resolve(RowId::new(1, 0));
        t.record(RowId::new(2, 0), lsn(2)).unwrap();
        t.rollback_batch();
        assert_eq!(
            t.entries().collect::<Vec<_>>(),
            vec![RedoGenidEntry {
                row: RowId::new(1, 0),
                lsn: lsn(1)
            }]
        );
    }

    proptest! {
        #[test]
        fn map_and_order_agree(ops in proptest::collection::vec((0u64..32, 0u32..1000, any::<bool>()), 0..200)) {
            let mut t = GenidTracker::new();
            for (seq, pos, add) in ops {
                let row = RowId::new(seq, 0);
                if add {
                    let had = t.get(row).is_some();
                    prop_assert_eq!(t.record(row, lsn(pos)).is_err(), had);
                } else {
                    t.resolve(row);
                }
                prop_assert_eq!(t.by_row.len(), t.by_lsn.len());
                let min = t.by_row.values().min().copied();
                prop_assert_eq!(t.oldest().map(|e| e.lsn), min);
            }
        }
    }
}
