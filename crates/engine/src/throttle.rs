//! Log byte rate limiting and the adaptive converter thread ceiling.

use std::{
    collections::VecDeque,
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
    thread,
    time::{Duration, Instant},
};

use livesc_store::{LockStats, SeqNum, Store, StoreError};
use log::{debug, trace, warn};
use parking_lot::{Condvar, Mutex};

use crate::{
    config::Options,
    error::Result,
    metrics::{SC_ACTIVE_CONVERTERS, SC_THROTTLE_WAIT_TIME},
};

const WINDOW: Duration = Duration::from_secs(1);

#[derive(Default)]
struct Window {
    /// Reservations and corrections, oldest first.
    entries: VecDeque<(Instant, i64)>,
    used: i64,
}

impl Window {
    fn expire(&mut self, now: Instant) {
        while let Some((at, bytes)) = self.entries.front().copied() {
            if at + WINDOW > now {
                break;
            }
            self.used -= bytes;
            self.entries.pop_front();
        }
    }

    fn push(&mut self, now: Instant, bytes: i64) {
        self.entries.push_back((now, bytes));
        self.used += bytes;
    }
}

/// Limits the log bytes generated per rolling one-second window.
///
/// A caller reserves its estimated transaction size with
/// [`Throttle::throttle_bytes`] before committing and corrects the reservation with
/// [`Throttle::account_actual`] afterwards. A reservation is granted as long
/// as the window is below the limit, so the window exceeds the limit by at
/// most one transaction.
pub struct Throttle {
    limit: AtomicU64,
    window: Mutex<Window>,
    cond: Condvar,
}

impl Throttle {
    /// A limit of zero disables throttling.
    pub fn new(bytes_per_second: u64) -> Self {
        Self {
            limit: AtomicU64::new(bytes_per_second),
            window: Mutex::default(),
            cond: Condvar::new(),
        }
    }

    pub fn set_limit(&self, bytes_per_second: u64) {
        self.limit.store(bytes_per_second, Ordering::Relaxed);
        self.cond.notify_all();
    }

    pub fn limit(&self) -> u64 {
        self.limit.load(Ordering::Relaxed)
    }

    /// Block until the current window has room, then reserve `estimate`
    /// bytes. Returns the time spent waiting.
    pub fn throttle_bytes(&self, estimate: usize) -> Duration {
        let start = Instant::now();
        let mut window = self.window.lock();
        loop {
            let limit = self.limit();
            if limit == 0 {
                return start.elapsed();
            }
            let now = Instant::now();
            window.expire(now);
            if window.used < limit as i64 {
                window.push(now, estimate as i64);
                break;
            }
            // Nothing can change before the oldest entry leaves the window,
            // unless a correction frees up bytes.
            let wait = window
                .entries
                .front()
                .map_or(WINDOW, |(at, _)| (*at + WINDOW).saturating_duration_since(now))
                .min(WINDOW);
            trace!("throttle wait={wait:?} used={} limit={limit}", window.used);
            self.cond.wait_for(&mut window, wait);
        }
        let waited = start.elapsed();
        if !waited.is_zero() {
            SC_THROTTLE_WAIT_TIME.observe(waited.as_secs_f64());
        }
        waited
    }

    /// Correct the last reservation by `delta` bytes, which may be negative.
    pub fn account_actual(&self, delta: i64) {
        if self.limit() == 0 || delta == 0 {
            return;
        }
        self.window.lock().push(Instant::now(), delta);
        if delta < 0 {
            self.cond.notify_all();
        }
    }

    /// Bytes accounted in the current window.
    pub fn used(&self) -> i64 {
        let mut window = self.window.lock();
        window.expire(Instant::now());
        window.used
    }
}

/// Adaptive ceiling for the number of concurrently active converters.
///
/// Converters obtain a [`ThreadSlot`] for every row they process. The
/// ceiling shrinks (down to 1) when converters run into deadlocks and grows
/// back up to its initial value when periodic lock statistics show little
/// contention.
pub struct ThreadGovernor {
    ceiling: usize,
    max: AtomicUsize,
    active: Mutex<usize>,
    cond: Condvar,
    epoch: Instant,
    /// Millis since `epoch` of the last lock statistics sample.
    last_sample: AtomicU64,
    last_stats: Mutex<Option<LockStats>>,
    sample_interval: Duration,
    lockwait_grow_threshold: u64,
}

/// Permission to run one conversion step. Released on drop.
pub struct ThreadSlot<'a> {
    governor: &'a ThreadGovernor,
}

impl Drop for ThreadSlot<'_> {
    fn drop(&mut self) {
        let mut active = self.governor.active.lock();
        *active -= 1;
        SC_ACTIVE_CONVERTERS.dec();
        self.governor.cond.notify_one();
    }
}

impl ThreadGovernor {
    pub fn new(ceiling: usize, sample_interval: Duration, lockwait_grow_threshold: u64) -> Self {
        let ceiling = ceiling.max(1);
        Self {
            ceiling,
            max: AtomicUsize::new(ceiling),
            active: Mutex::new(0),
            cond: Condvar::new(),
            epoch: Instant::now(),
            last_sample: AtomicU64::new(0),
            last_stats: Mutex::new(None),
            sample_interval,
            lockwait_grow_threshold,
        }
    }

    pub fn max_threads(&self) -> usize {
        self.max.load(Ordering::Relaxed)
    }

    pub fn active_threads(&self) -> usize {
        *self.active.lock()
    }

    /// Wait up to `timeout` for the number of active converters to drop
    /// below the ceiling.
    pub fn acquire(&self, timeout: Duration) -> Option<ThreadSlot<'_>> {
        let deadline = Instant::now() + timeout;
        let mut active = self.active.lock();
        while *active >= self.max_threads() {
            if self.cond.wait_until(&mut active, deadline).timed_out() && *active >= self.max_threads() {
                return None;
            }
        }
        *active += 1;
        SC_ACTIVE_CONVERTERS.inc();
        Some(ThreadSlot { governor: self })
    }

    pub fn increase_max_threads(&self) {
        let res = self
            .max
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |max| {
                (max < self.ceiling).then_some(max + 1)
            });
        if let Ok(prev) = res {
            debug!("increase max threads {prev} -> {}", prev + 1);
            self.cond.notify_all();
        }
    }

    pub fn decrease_max_threads(&self) {
        let res = self
            .max
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |max| (max > 1).then_some(max - 1));
        if let Ok(prev) = res {
            debug!("decrease max threads {prev} -> {}", prev - 1);
        }
    }

    /// Feed the store's cumulative lock statistics. At most once per sample
    /// interval, grows the ceiling if no deadlocks and few lock waits
    /// happened since the previous sample.
    pub fn sample(&self, stats: LockStats) {
        let now = self.epoch.elapsed().as_millis() as u64;
        let last = self.last_sample.load(Ordering::Relaxed);
        if now.saturating_sub(last) < self.sample_interval.as_millis() as u64 {
            return;
        }
        if self
            .last_sample
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        let prev = self.last_stats.lock().replace(stats);
        let Some(prev) = prev else {
            return;
        };
        let deadlocks = stats.deadlocks.saturating_sub(prev.deadlocks);
        let lock_waits = stats.lock_waits.saturating_sub(prev.lock_waits);
        trace!("lock sample deadlocks={deadlocks} lock_waits={lock_waits}");
        if deadlocks == 0 && lock_waits < self.lockwait_grow_threshold {
            self.increase_max_threads();
        }
    }
}

/// Keeps a worker's commits from outrunning replication.
///
/// Every `records_per_trans` commits the worker waits for the replicas to
/// acknowledge its last commit. While replicas lag, every commit is followed
/// by a delay proportional to their number, which only grows until all
/// replicas are coherent again.
pub(crate) struct ReplicationPacer {
    every: u64,
    timeout: Duration,
    step: Duration,
    commits: u64,
    delay: Duration,
}

impl ReplicationPacer {
    pub fn new(opts: &Options) -> Self {
        Self {
            every: opts.records_per_trans.max(1),
            timeout: opts.replication_wait,
            step: opts.incoherent_delay_step,
            commits: 0,
            delay: Duration::ZERO,
        }
    }

    pub fn committed<S: Store>(&mut self, store: &S, seqnum: SeqNum) -> Result<()> {
        self.commits += 1;
        if self.commits % self.every == 0 {
            match store.wait_for_seqnum(seqnum, self.timeout) {
                Ok(()) => {}
                Err(StoreError::ReplicationTimeout { seqnum }) => {
                    warn!("replication wait timed out seqnum={seqnum:?} timeout={:?}", self.timeout)
                }
                Err(e) => return Err(e.into()),
            }
        }
        let nodes = store.incoherent_nodes();
        if nodes == 0 {
            self.delay = Duration::ZERO;
            return Ok(());
        }
        self.delay = self.delay.max(self.step * nodes as u32);
        trace!("incoherent nodes={nodes} delay={:?}", self.delay);
        thread::sleep(self.delay);
        Ok(())
    }

    #[cfg(test)]
    pub fn delay(&self) -> Duration {
        self.delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, thread};

    #[test]
    fn disabled_throttle_never_waits() {
        let throttle = Throttle::new(0);
        for _ in 0..100 {
            assert_eq!(throttle.throttle_bytes(1 << 20), Duration::ZERO);
        }
        assert_eq!(throttle.used(), 0);
    }

    #[test]
    fn rolling_window_bounded_by_one_transaction() {
        const LIMIT: u64 = 20_000;
        const CHUNK: usize = 5_000;

        let throttle = Arc::new(Throttle::new(LIMIT));
        let events = Arc::new(Mutex::new(Vec::new()));
        let workers = (0..2)
            .map(|_| {
                let throttle = throttle.clone();
                let events = events.clone();
                thread::spawn(move || {
                    for _ in 0..6 {
                        throttle.throttle_bytes(CHUNK);
                        events.lock().push(Instant::now());
                    }
                })
            })
            .collect::<Vec<_>>();
        for w in workers {
            w.join().unwrap();
        }

        let events = events.lock();
        // Allow for the time between reservation and recording.
        let window = WINDOW - Duration::from_millis(50);
        for start in events.iter() {
            let bytes = events
                .iter()
                .filter(|at| **at >= *start && **at < *start + window)
                .count()
                * CHUNK;
            assert!(bytes as u64 <= LIMIT + CHUNK as u64, "window starting {start:?} has {bytes} bytes");
        }
    }

    #[test]
    fn corrections_release_budget() {
        let throttle = Throttle::new(1_000);
        throttle.throttle_bytes(2_000);
        throttle.account_actual(-1_900);
        assert_eq!(throttle.used(), 100);
        let start = Instant::now();
        throttle.throttle_bytes(10);
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn pacer_delay_grows_until_coherent() {
        let store = livesc_store::MemStore::new();
        let opts = Options {
            records_per_trans: 2,
            incoherent_delay_step: Duration::from_millis(1),
            ..Options::default()
        };
        let mut pacer = ReplicationPacer::new(&opts);
        store.set_incoherent_nodes(3);
        pacer.committed(&store, SeqNum(1)).unwrap();
        assert_eq!(pacer.delay(), Duration::from_millis(3));
        store.set_incoherent_nodes(1);
        pacer.committed(&store, SeqNum(2)).unwrap();
        assert_eq!(pacer.delay(), Duration::from_millis(3));
        store.set_incoherent_nodes(0);
        pacer.committed(&store, SeqNum(3)).unwrap();
        assert_eq!(pacer.delay(), Duration::ZERO);
        assert_eq!(store.replication_waits(), 1);
    }

    #[test]
    fn governor_bounds() {
        let gov = ThreadGovernor::new(2, Duration::ZERO, 10);
        let a = gov.acquire(Duration::ZERO).unwrap();
        let _b = gov.acquire(Duration::ZERO).unwrap();
        assert!(gov.acquire(Duration::from_millis(10)).is_none());
        drop(a);
        assert!(gov.acquire(Duration::ZERO).is_some());

        gov.decrease_max_threads();
        gov.decrease_max_threads();
        assert_eq!(gov.max_threads(), 1);
        gov.increase_max_threads();
        gov.increase_max_threads();
        gov.increase_max_threads();
        assert_eq!(gov.max_threads(), 2);
    }

    #[test]
    fn sampling_grows_only_without_contention() {
        let gov = ThreadGovernor::new(4, Duration::from_millis(1), 10);
        gov.decrease_max_threads();
        gov.decrease_max_threads();
        gov.sample(LockStats::default());

        thread::sleep(Duration::from_millis(5));
        gov.sample(LockStats {
            deadlocks: 1,
            lock_waits: 0,
        });
        assert_eq!(gov.max_threads(), 2);

        thread::sleep(Duration::from_millis(5));
        gov.sample(LockStats {
            deadlocks: 1,
            lock_waits: 3,
        });
        assert_eq!(gov.max_threads(), 3);
    }
}
