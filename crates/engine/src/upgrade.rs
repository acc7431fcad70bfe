//! Rewriting the records of a table to the current version of its
//! definition, in place.

use std::{
    sync::{atomic::Ordering, Arc},
    thread,
};

use livesc_store::{Priority, ScanCursor, ScanMode, Store, StoreError, StripeCursor};
use log::{debug, error, info, trace};
use scopeguard::ScopeGuard;

use crate::{
    blob::{record_version, unpack_record},
    config::Options,
    error::{AbortReason, Result, SchemaChangeError},
    metrics,
    odh,
    orchestrator::{check_headroom, SchemaChangeHandle, Shared},
    report::{LogSink, ProgressSink, ProgressSnapshot, ReportClock},
    request::{UpgradeKind, UpgradeRequest},
    state::Worker,
    throttle::{ReplicationPacer, Throttle},
};

/// Outcome of an upgrade.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UpgradeStats {
    pub upgraded: u64,
    /// Rows left at their old version because they were locked.
    pub skipped: u64,
    pub retries: u64,
}

/// Rewrite all records of `req.history`'s table to its current version.
pub fn upgrade_all_records<S: Store>(store: Arc<S>, req: UpgradeRequest, opts: Options) -> Result<UpgradeStats> {
    RecordUpgrade::new(store, req, opts)?.run()
}

/// An upgrade of the records of one table, ready to [`run`](Self::run).
pub struct RecordUpgrade<S: Store> {
    store: Arc<S>,
    req: UpgradeRequest,
    opts: Options,
    throttle: Arc<Throttle>,
    sink: Arc<dyn ProgressSink>,
    shared: Arc<Shared>,
    clock: ReportClock,
}

enum Step {
    Upgraded,
    /// Already current, or locked by someone else.
    Kept { current: bool },
    Retry,
    End,
}

impl<S: Store> RecordUpgrade<S> {
    pub fn new(store: Arc<S>, req: UpgradeRequest, opts: Options) -> Result<Self> {
        req.validate()?;
        opts.validate()?;
        Ok(Self {
            store,
            throttle: Arc::new(Throttle::new(opts.log_bytes_per_second)),
            sink: Arc::new(LogSink),
            shared: Arc::new(Shared::new(req.stripes)),
            clock: ReportClock::new(opts.report_interval),
            req,
            opts,
        })
    }

    pub fn with_throttle(mut self, throttle: Arc<Throttle>) -> Self {
        self.throttle = throttle;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn handle(&self) -> SchemaChangeHandle {
        SchemaChangeHandle::new(self.shared.clone())
    }

    fn table(&self) -> &str {
        &self.req.history.current().name
    }

    fn workers(&self) -> u8 {
        if self.req.scan_mode.is_parallel() {
            self.req.stripes
        } else {
            1
        }
    }

    pub fn run(self) -> Result<UpgradeStats> {
        metrics::register_custom_metrics();
        info!(
            "upgrading records table={} version={} kind={:?} mode={:?}",
            self.table(),
            self.req.history.current().version,
            self.req.kind,
            self.req.scan_mode
        );
        let this = &self;
        thread::scope(|scope| {
            let mut workers = Vec::new();
            for worker in 0..this.workers() {
                let spawned = thread::Builder::new()
                    .name(format!("sc-upgrade-{}-{worker}", this.table()))
                    .spawn_scoped(scope, move || this.run_worker(worker));
                match spawned {
                    Ok(join) => workers.push((worker, join)),
                    Err(e) => {
                        this.shared.control.fail(Worker::Stripe(worker), SchemaChangeError::Spawn(e));
                        break;
                    }
                }
            }
            for (worker, join) in workers {
                if join.join().is_err() {
                    this.shared
                        .control
                        .fail(Worker::Stripe(worker), SchemaChangeError::Panicked(format!("upgrade {worker}")));
                }
            }
        });

        let snapshot = self.shared.snapshot();
        let res = self.outcome(&snapshot);
        match &res {
            Ok(_) => self.sink.finished(self.table(), Ok(&snapshot)),
            Err(e) => self.sink.finished(self.table(), Err(e)),
        }
        res
    }

    fn outcome(&self, snapshot: &ProgressSnapshot) -> Result<UpgradeStats> {
        let control = &self.shared.control;
        if let Some(e) = control.take_error() {
            return Err(e);
        }
        if control.is_downgraded() {
            return Err(SchemaChangeError::Aborted(AbortReason::MasterDowngrade));
        }
        if let Some(reason) = control.abort_reason() {
            return Err(SchemaChangeError::Aborted(reason));
        }
        Ok(UpgradeStats {
            upgraded: snapshot.total_converted,
            skipped: snapshot.skipped,
            retries: snapshot.retries,
        })
    }

    fn run_worker(&self, worker: u8) {
        match self.upgrade_worker(worker) {
            Ok(()) => debug!("upgrade worker done table={} worker={worker}", self.table()),
            Err(e) if e.is_failure() => {
                error!("upgrade failed table={} worker={worker}: {e}", self.table());
                self.shared.control.fail(Worker::Stripe(worker), e);
            }
            Err(e) => debug!("upgrade worker stopped table={} worker={worker}: {e}", self.table()),
        }
    }

    fn upgrade_worker(&self, worker: u8) -> Result<()> {
        let mut cursor = match self.req.scan_mode {
            ScanMode::ParallelByStripe => ScanCursor::Stripe {
                stripe: worker,
                after: StripeCursor::Pending,
            },
            _ => ScanCursor::Dump { after: self.req.start },
        };
        let mut pacer = ReplicationPacer::new(&self.opts);
        let mut retries = 0;
        loop {
            self.shared.control.check(Worker::Stripe(worker))?;
            if let UpgradeKind::Partial { max_records } = self.req.kind {
                if self.shared.counters.total_rows() >= max_records {
                    return Ok(());
                }
            }

            match self.upgrade_next(worker, &mut cursor, &mut pacer)? {
                Step::End => return Ok(()),
                Step::Retry => {
                    retries += 1;
                    self.shared.counters.retries.fetch_add(1, Ordering::Relaxed);
                    if retries > self.opts.max_retries {
                        return Err(SchemaChangeError::RetryLimit {
                            table: self.table().to_owned(),
                            retries,
                        });
                    }
                    thread::sleep(self.opts.retry_sleep());
                    continue;
                }
                Step::Kept { current: true } if matches!(self.req.kind, UpgradeKind::Partial { .. }) => {
                    debug!("reached current records table={} worker={worker}", self.table());
                    return Ok(());
                }
                Step::Kept { .. } | Step::Upgraded => retries = 0,
            }

            if self.clock.try_claim() {
                self.sink.progress(self.table(), &self.shared.snapshot());
                check_headroom(
                    &*self.store,
                    &self.opts,
                    self.req.force,
                    &self.shared.control,
                    self.table(),
                );
            }
        }
    }

    fn upgrade_next(&self, worker: u8, cursor: &mut ScanCursor, pacer: &mut ReplicationPacer) -> Result<Step> {
        let store = &*self.store;
        let table = self.table();
        let history = &*self.req.history;
        let mut txn = scopeguard::guard(store.begin_txn(Priority::Low)?, |txn| store.abort_txn(txn));

        let row = match store.scan_next(&mut txn, table, cursor) {
            Ok(Some(row)) => row,
            Ok(None) => return Ok(Step::End),
            Err(StoreError::Deadlock) => return Ok(Step::Retry),
            Err(e) => return Err(e.into()),
        };
        cursor.advance(&row);
        if self.req.scan_mode.is_parallel() {
            self.shared.watermarks.advance(worker, row.id);
        }

        if history.is_current(record_version(table, row.id, &row.record)?) {
            return Ok(Step::Kept { current: true });
        }
        let values = unpack_record(history, row.id, &row.record)?;
        let current = history.current();
        let encoded = current
            .encode(&values)
            .map_err(|e| SchemaChangeError::ConversionFailure {
                table: table.to_owned(),
                column: e.column,
                reason: e.reason,
            })?;
        let record = odh::pack(current.version, &encoded, current.compressed);
        let estimate = record.len();
        self.throttle.throttle_bytes(estimate);

        match store.upgrade_row(&mut txn, table, row.id, record) {
            Ok(()) => {}
            Err(StoreError::Deadlock) => {
                trace!("upgrade skipped locked row table={table} row={}", row.id);
                self.shared.counters.skipped.fetch_add(1, Ordering::Relaxed);
                return Ok(Step::Kept { current: false });
            }
            Err(e) => return Err(e.into()),
        }
        let used = store.txn_log_bytes(&txn);
        self.throttle.account_actual(used as i64 - estimate as i64);
        let seqnum = store.commit_txn(ScopeGuard::into_inner(txn))?;
        self.shared.counters.per_stripe_rows[worker as usize].fetch_add(1, Ordering::Relaxed);
        pacer.committed(store, seqnum)?;
        Ok(Step::Upgraded)
    }
}
