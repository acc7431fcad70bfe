//! Progress reporting.

use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use livesc_store::{Lsn, StripeCursor};

use crate::{
    error::SchemaChangeError,
    state::{Counters, Watermarks},
};

/// Point-in-time view of a running schema change.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub per_stripe_rows: Vec<u64>,
    pub stripes: Vec<StripeCursor>,
    pub total_converted: u64,
    pub retries: u64,
    pub redo_transactions_applied: u64,
    /// Rows that were given a new row id in the target table.
    pub genids_changed: u64,
    pub skipped: u64,
    pub redo_lsn: Lsn,
    /// Outstanding race entries of the logical redo.
    pub pending_races: u64,
}

impl ProgressSnapshot {
    pub(crate) fn collect(counters: &Counters, watermarks: &Watermarks, redo_lsn: Lsn) -> Self {
        let per_stripe_rows: Vec<u64> = counters
            .per_stripe_rows
            .iter()
            .map(|n| n.load(Ordering::Relaxed))
            .collect();
        Self {
            total_converted: per_stripe_rows.iter().sum(),
            per_stripe_rows,
            stripes: watermarks.all(),
            retries: counters.retries.load(Ordering::Relaxed),
            redo_transactions_applied: counters.redo_txns.load(Ordering::Relaxed),
            genids_changed: counters.genids_changed.load(Ordering::Relaxed),
            skipped: counters.skipped.load(Ordering::Relaxed),
            redo_lsn,
            pending_races: counters.tracker_size.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Display for ProgressSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "converted={} retries={} redo_txns={} genids_changed={} redo_lsn={} races={}",
            self.total_converted,
            self.retries,
            self.redo_transactions_applied,
            self.genids_changed,
            self.redo_lsn,
            self.pending_races
        )?;
        for (stripe, (rows, cursor)) in self.per_stripe_rows.iter().zip(&self.stripes).enumerate() {
            write!(f, " [{stripe}] rows={rows} at={cursor:?}")?;
        }
        Ok(())
    }
}

/// Receiver of progress lines, e.g. an admin connection.
pub trait ProgressSink: Send + Sync {
    /// A periodic report.
    fn progress(&self, table: &str, snapshot: &ProgressSnapshot);

    /// The operation finished, successfully or not.
    fn finished(&self, table: &str, outcome: Result<&ProgressSnapshot, &SchemaChangeError>);
}

/// Writes progress to the log.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogSink;

impl ProgressSink for LogSink {
    fn progress(&self, table: &str, snapshot: &ProgressSnapshot) {
        log::info!("schema change progress table={table} {snapshot}");
    }

    fn finished(&self, table: &str, outcome: Result<&ProgressSnapshot, &SchemaChangeError>) {
        match outcome {
            Ok(snapshot) => log::info!("schema change done table={table} {snapshot}"),
            Err(e) if e.is_failure() => log::error!("schema change failed table={table}: {e}"),
            Err(e) => log::warn!("schema change stopped table={table}: {e}"),
        }
    }
}

/// Hands out the right to report to one caller per interval.
pub(crate) struct ReportClock {
    epoch: Instant,
    /// Millis since `epoch` of the last report.
    last: AtomicU64,
    interval: Duration,
}

impl ReportClock {
    pub fn new(interval: Duration) -> Self {
        Self {
            epoch: Instant::now(),
            last: AtomicU64::new(0),
            interval,
        }
    }

    pub fn try_claim(&self) -> bool {
        let now = self.epoch.elapsed().as_millis() as u64;
        let last = self.last.load(Ordering::Relaxed);
        if now.saturating_sub(last) < self.interval.as_millis() as u64 {
            return false;
        }
        self.last
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use livesc_store::RowId;

    #[test]
    fn snapshot_totals() {
        let counters = Counters::new(2);
        counters.per_stripe_rows[0].store(3, Ordering::Relaxed);
        counters.per_stripe_rows[1].store(4, Ordering::Relaxed);
        counters.retries.store(2, Ordering::Relaxed);
        let marks = Watermarks::new([StripeCursor::Pending, StripeCursor::Pending]);
        marks.advance(1, RowId::new(8, 1));
        marks.set_done(0);

        let snap = ProgressSnapshot::collect(&counters, &marks, Lsn::new(1, 2));
        assert_eq!(snap.total_converted, 7);
        assert_eq!(snap.stripes, vec![StripeCursor::Done, StripeCursor::At(RowId::new(8, 1))]);
        let line = snap.to_string();
        assert!(line.starts_with("converted=7 retries=2"), "{line}");
        assert!(line.contains("[1] rows=4"), "{line}");
    }

    #[test]
    fn one_report_per_interval() {
        let clock = ReportClock::new(Duration::from_millis(20));
        assert!(!clock.try_claim());
        std::thread::sleep(Duration::from_millis(25));
        assert!(clock.try_claim());
        assert!(!clock.try_claim());
    }
}
