//! State shared between the converters, the logical redo and the
//! orchestrator of one schema change.

use std::{
    sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering},
    time::{Duration, Instant},
};

use livesc_store::{Lsn, RowId, StripeCursor};
use parking_lot::{Condvar, Mutex};

use crate::error::{AbortReason, SchemaChangeError};

const PENDING: u64 = 0;
const DONE: u64 = u64::MAX;

fn encode(cursor: StripeCursor) -> u64 {
    match cursor {
        StripeCursor::Pending => PENDING,
        StripeCursor::At(id) => id.base().into_raw(),
        StripeCursor::Done => DONE,
    }
}

fn decode(raw: u64) -> StripeCursor {
    match raw {
        PENDING => StripeCursor::Pending,
        DONE => StripeCursor::Done,
        raw => StripeCursor::At(RowId::from_raw(raw)),
    }
}

/// Per-stripe conversion watermarks.
///
/// Each stripe's cursor is written only by the converter of that stripe and
/// read by everyone else. Cursors only move forward, and [`StripeCursor::Done`]
/// is final.
pub struct Watermarks {
    cursors: Vec<AtomicU64>,
    /// Set when the converter of a stripe has reached the end of the stripe
    /// in logical mode, where the cursor is kept at the last converted row.
    converted: Vec<AtomicBool>,
}

impl Watermarks {
    pub fn new(cursors: impl IntoIterator<Item = StripeCursor>) -> Self {
        let cursors: Vec<_> = cursors.into_iter().map(|c| AtomicU64::new(encode(c))).collect();
        let converted = cursors.iter().map(|_| AtomicBool::new(false)).collect();
        Self { cursors, converted }
    }

    pub fn stripes(&self) -> u8 {
        self.cursors.len() as u8
    }

    pub fn get(&self, stripe: u8) -> StripeCursor {
        decode(self.cursors[stripe as usize].load(Ordering::Acquire))
    }

    pub fn all(&self) -> Vec<StripeCursor> {
        (0..self.stripes()).map(|s| self.get(s)).collect()
    }

    /// Move the cursor of `stripe` to `id`. Does nothing if the cursor is
    /// already at or past `id`.
    pub fn advance(&self, stripe: u8, id: RowId) -> bool {
        let new = id.base().into_raw();
        self.cursors[stripe as usize]
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| (cur != DONE && cur < new).then_some(new))
            .is_ok()
    }

    pub fn set_done(&self, stripe: u8) {
        self.cursors[stripe as usize].store(DONE, Ordering::Release);
    }

    pub fn mark_converted(&self, stripe: u8) {
        self.converted[stripe as usize].store(true, Ordering::Release);
    }

    pub fn is_converted(&self, stripe: u8) -> bool {
        self.converted[stripe as usize].load(Ordering::Acquire)
    }

    /// True if the row `id` has not been reached by its stripe's converter
    /// yet, so any change to it will be picked up by the converter.
    pub fn is_ahead(&self, id: RowId) -> bool {
        let stripe = id.stripe();
        if stripe >= self.stripes() || self.is_converted(stripe) {
            return false;
        }
        self.get(stripe).is_behind(id)
    }
}

/// A worker of a schema change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Worker {
    Stripe(u8),
    Redo,
}

const NO_FAILURE: u8 = 0;
const REDO_FAILED: u8 = u8::MAX;

/// Cancellation and failure propagation.
#[derive(Default)]
pub struct Control {
    aborted: AtomicBool,
    abort_reason: Mutex<Option<AbortReason>>,
    downgraded: AtomicBool,
    /// `stripe + 1` of the first failed worker, [`REDO_FAILED`] for the redo.
    failed: AtomicU8,
    error: Mutex<Option<SchemaChangeError>>,
    pause_redo: AtomicBool,
}

impl Control {
    pub fn request_abort(&self, reason: AbortReason) {
        let mut slot = self.abort_reason.lock();
        if slot.is_none() {
            *slot = Some(reason);
        }
        self.aborted.store(true, Ordering::Release);
    }

    pub fn abort_reason(&self) -> Option<AbortReason> {
        if !self.aborted.load(Ordering::Acquire) {
            return None;
        }
        *self.abort_reason.lock()
    }

    /// Signal that this node stopped being the write master.
    pub fn downgrade(&self) {
        self.downgraded.store(true, Ordering::Release);
    }

    pub fn is_downgraded(&self) -> bool {
        self.downgraded.load(Ordering::Acquire)
    }

    /// Record a terminal error of `worker`. Only the first failure is kept.
    pub fn fail(&self, worker: Worker, err: SchemaChangeError) -> bool {
        let code = match worker {
            Worker::Stripe(stripe) => stripe + 1,
            Worker::Redo => REDO_FAILED,
        };
        if self
            .failed
            .compare_exchange(NO_FAILURE, code, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        *self.error.lock() = Some(err);
        true
    }

    pub fn failed_worker(&self) -> Option<Worker> {
        match self.failed.load(Ordering::Acquire) {
            NO_FAILURE => None,
            REDO_FAILED => Some(Worker::Redo),
            code => Some(Worker::Stripe(code - 1)),
        }
    }

    pub fn take_error(&self) -> Option<SchemaChangeError> {
        self.error.lock().take()
    }

    /// The reason `worker` has to stop, if any. A master downgrade takes
    /// priority over everything else.
    pub fn check(&self, worker: Worker) -> Result<(), SchemaChangeError> {
        if self.is_downgraded() {
            return Err(SchemaChangeError::Aborted(AbortReason::MasterDowngrade));
        }
        match self.failed_worker() {
            Some(failed) if failed != worker => {
                let stripe = match failed {
                    Worker::Stripe(stripe) => Some(stripe),
                    Worker::Redo => None,
                };
                return Err(SchemaChangeError::Aborted(AbortReason::PeerFailed { stripe }));
            }
            _ => {}
        }
        match self.abort_reason() {
            Some(reason) => Err(SchemaChangeError::Aborted(reason)),
            None => Ok(()),
        }
    }

    pub fn set_pause_redo(&self, pause: bool) {
        self.pause_redo.store(pause, Ordering::Release);
    }

    pub fn is_redo_paused(&self) -> bool {
        self.pause_redo.load(Ordering::Acquire)
    }
}

/// The log position up to which the logical redo has replayed.
#[derive(Default)]
pub struct RedoPosition {
    lsn: Mutex<Lsn>,
    cond: Condvar,
}

impl RedoPosition {
    pub fn get(&self) -> Lsn {
        *self.lsn.lock()
    }

    pub fn advance(&self, lsn: Lsn) {
        let mut cur = self.lsn.lock();
        if lsn > *cur {
            *cur = lsn;
            self.cond.notify_all();
        }
    }

    /// Wait up to `timeout` for the redo to reach `target`. Returns whether it
    /// did.
    pub fn wait_for(&self, target: Lsn, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut cur = self.lsn.lock();
        while *cur < target {
            if self.cond.wait_until(&mut cur, deadline).timed_out() {
                return *cur >= target;
            }
        }
        true
    }
}

/// Counters reported by progress snapshots.
pub struct Counters {
    pub per_stripe_rows: Vec<AtomicU64>,
    pub retries: AtomicU64,
    pub redo_txns: AtomicU64,
    pub genids_changed: AtomicU64,
    pub skipped: AtomicU64,
    pub tracker_size: AtomicU64,
}

impl Counters {
    pub fn new(stripes: u8) -> Self {
        Self {
            per_stripe_rows: (0..stripes).map(|_| AtomicU64::new(0)).collect(),
            retries: AtomicU64::new(0),
            redo_txns: AtomicU64::new(0),
            genids_changed: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            tracker_size: AtomicU64::new(0),
        }
    }

    pub fn total_rows(&self) -> u64 {
        self.per_stripe_rows.iter().map(|n| n.load(Ordering::Relaxed)).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn first_failure_wins() {
        let ctl = Control::default();
        assert!(ctl.check(Worker::Stripe(0)).is_ok());
        assert!(ctl.fail(
            Worker::Stripe(2),
            SchemaChangeError::Config("first".into())
        ));
        assert!(!ctl.fail(Worker::Redo, SchemaChangeError::Config("second".into())));
        assert_eq!(ctl.failed_worker(), Some(Worker::Stripe(2)));
        assert!(ctl.check(Worker::Stripe(2)).is_ok());
        assert!(matches!(
            ctl.check(Worker::Redo),
            Err(SchemaChangeError::Aborted(AbortReason::PeerFailed { stripe: Some(2) }))
        ));
        assert!(matches!(ctl.take_error(), Some(SchemaChangeError::Config(msg)) if msg == "first"));
    }

    #[test]
    fn downgrade_takes_priority() {
        let ctl = Control::default();
        ctl.request_abort(AbortReason::Requested);
        ctl.request_abort(AbortReason::DiskHeadroom);
        assert_eq!(ctl.abort_reason(), Some(AbortReason::Requested));
        ctl.downgrade();
        assert!(matches!(
            ctl.check(Worker::Redo),
            Err(SchemaChangeError::Aborted(AbortReason::MasterDowngrade))
        ));
    }

    #[test]
    fn redo_position_wakes_waiters() {
        let pos = std::sync::Arc::new(RedoPosition::default());
        let target = Lsn::new(1, 10);
        assert!(!pos.wait_for(target, Duration::from_millis(5)));
        let waiter = {
            let pos = pos.clone();
            std::thread::spawn(move || pos.wait_for(target, Duration::from_secs(5)))
        };
        pos.advance(Lsn::new(1, 12));
        assert!(waiter.join().unwrap());
        pos.advance(Lsn::new(1, 3));
        assert_eq!(pos.get(), Lsn::new(1, 12));
    }

    proptest! {
        #[test]
        fn watermarks_are_monotonic(seqs in proptest::collection::vec(1u64..1000, 1..100), done_at in 0usize..100) {
            let marks = Watermarks::new([StripeCursor::Pending]);
            let mut prev = marks.get(0);
            for (i, seq) in seqs.into_iter().enumerate() {
                if i == done_at {
                    marks.set_done(0);
                }
                marks.advance(0, RowId::new(seq, 0));
                let cur = marks.get(0);
                match (prev, cur) {
                    (StripeCursor::Done, cur) => prop_assert_eq!(cur, StripeCursor::Done),
                    (StripeCursor::At(a), StripeCursor::At(b)) => prop_assert!(a <= b),
                    (StripeCursor::At(_), StripeCursor::Pending) => prop_assert!(false, "cursor moved back"),
                    _ => {}
                }
                prev = cur;
            }
        }
    }
}
