//! Copying the rows of one stripe of the source table into the target
//! table.

use std::{
    sync::{atomic::Ordering, Arc},
    thread,
    time::Duration,
};

use livesc_store::{BlobSet, Lsn, Priority, RowId, ScanCursor, ScanMode, Store, StoreError, StripeCursor};
use log::{debug, error, info, warn};
use scopeguard::ScopeGuard;

use crate::{
    blob::{check_blob_consistency, unpack_blob, unpack_record},
    error::{ConstraintKind, Result, RowError, SchemaChangeError},
    metrics::{SC_CONVERTED_ROWS, SC_RETRIES},
    orchestrator::Context,
    prepare::Blobs,
    state::Worker,
    throttle::ReplicationPacer,
};

/// How long a converter waits at a time for the redo to replay a write that
/// may clear a constraint violation.
const CONSTRAINT_WAIT: Duration = Duration::from_millis(200);

enum Outcome {
    End,
    Copied { genid_changed: bool },
    /// The row is already present in the target table.
    AlreadyCopied,
}

enum Step {
    Row,
    Retry,
    End,
}

pub(crate) struct StripeConverter<S: Store> {
    ctx: Arc<Context<S>>,
    worker: u8,
    cursor: ScanCursor,
    /// The row being converted by the current transaction.
    current: Option<RowId>,
    rows: u64,
    /// Consecutive retries of the current row.
    row_retries: u64,
    /// Row and end of log position of the last constraint violation.
    violation: Option<(RowId, Lsn)>,
    pacer: ReplicationPacer,
}

impl<S: Store> StripeConverter<S> {
    pub fn new(ctx: Arc<Context<S>>, worker: u8) -> Self {
        let cursor = match ctx.req.scan_mode {
            ScanMode::ParallelByStripe => ScanCursor::Stripe {
                stripe: worker,
                after: ctx.shared.watermarks.get(worker),
            },
            ScanMode::IndexOrder => ScanCursor::Index { after: None },
            ScanMode::BulkDump => ScanCursor::Dump { after: None },
        };
        let pacer = ReplicationPacer::new(&ctx.opts);
        Self {
            ctx,
            worker,
            cursor,
            current: None,
            rows: 0,
            row_retries: 0,
            violation: None,
            pacer,
        }
    }

    /// Convert rows until the stripe is exhausted or the operation stops.
    /// Failures are handed to the shared control. Returns the number of rows
    /// copied.
    pub fn run(mut self) -> u64 {
        let ctx = self.ctx.clone();
        debug!(
            "converter start table={} worker={} cursor={:?}",
            ctx.source(),
            self.worker,
            self.cursor
        );
        match self.convert_all(&ctx) {
            Ok(()) => {}
            Err(e) if e.is_failure() => {
                error!(
                    "converter failed table={} worker={} row={:?}: {e}",
                    ctx.source(),
                    self.worker,
                    self.current
                );
                ctx.shared.control.fail(Worker::Stripe(self.worker), e);
            }
            Err(e) => debug!("converter stopped table={} worker={}: {e}", ctx.source(), self.worker),
        }
        self.rows
    }

    fn convert_all(&mut self, ctx: &Context<S>) -> Result<()> {
        if let ScanCursor::Stripe {
            after: StripeCursor::Done,
            ..
        } = self.cursor
        {
            return Ok(());
        }
        loop {
            ctx.shared.control.check(Worker::Stripe(self.worker))?;
            let Some(_slot) = ctx.governor.acquire(ctx.opts.lock_check_interval) else {
                continue;
            };
            match self.step(ctx)? {
                Step::End => return Ok(()),
                Step::Row => {
                    self.row_retries = 0;
                    self.violation = None;
                }
                Step::Retry => {}
            }
            ctx.periodic();
        }
    }

    /// Convert one row in its own transaction.
    fn step(&mut self, ctx: &Context<S>) -> Result<Step> {
        let store = &*ctx.store;
        let mut txn = scopeguard::guard(store.begin_txn(Priority::Low)?, |txn| store.abort_txn(txn));
        let mut reserved = 0;
        let res = self.convert_row(ctx, &mut txn, &mut reserved);
        let used = store.txn_log_bytes(&txn);
        ctx.throttle.account_actual(used as i64 - reserved as i64);

        match res {
            Ok(Outcome::End) => {
                if self.finish_stripe(ctx, &mut txn)? {
                    store.commit_txn(ScopeGuard::into_inner(txn))?;
                }
                info!(
                    "converter reached end table={} worker={} rows={}",
                    ctx.source(),
                    self.worker,
                    self.rows
                );
                Ok(Step::End)
            }
            Ok(Outcome::AlreadyCopied) => Ok(Step::Row),
            Ok(Outcome::Copied { genid_changed }) => {
                let seqnum = store.commit_txn(ScopeGuard::into_inner(txn))?;
                self.rows += 1;
                let counters = &ctx.shared.counters;
                counters.per_stripe_rows[self.worker as usize].fetch_add(1, Ordering::Relaxed);
                if genid_changed {
                    counters.genids_changed.fetch_add(1, Ordering::Relaxed);
                }
                SC_CONVERTED_ROWS.with_label_values(&[ctx.source()]).inc();
                if ctx.req.live {
                    self.pacer.committed(store, seqnum)?;
                }
                Ok(Step::Row)
            }
            Err(RowError::Retry) => {
                drop(txn);
                self.retry(ctx)?;
                Ok(Step::Retry)
            }
            Err(RowError::Constraint(kind)) => {
                drop(txn);
                self.constraint_violation(ctx, kind)
            }
            Err(RowError::Fatal(e)) => Err(e),
        }
    }

    fn convert_row(
        &mut self,
        ctx: &Context<S>,
        txn: &mut S::Txn,
        reserved: &mut usize,
    ) -> std::result::Result<Outcome, RowError> {
        let store = &*ctx.store;
        let source = ctx.source();
        let Some(row) = store.scan_next(txn, source, &self.cursor)? else {
            self.current = None;
            return Ok(Outcome::End);
        };
        self.current = Some(row.id);

        let values = unpack_record(ctx.conv.history(), row.id, &row.record)?;
        let fetched;
        let blobs = if ctx.conv.fetch_blobs() {
            let stored = store.fetch_blobs(txn, source, row.id)?;
            fetched = unpack_blobs(source, row.id, &stored)?;
            check_blob_consistency(ctx.conv.source(), row.id, &values, &fetched)?;
            Blobs::Fetched(&fetched)
        } else {
            Blobs::Skipped
        };

        let id = if ctx.req.use_new_row_ids {
            store.next_row_id(ctx.target(), row.id.stripe())?
        } else {
            row.id
        };
        let write = ctx.conv.prepare(store, txn, id, &values, blobs)?;
        *reserved = write.estimated_log_bytes();
        ctx.throttle.throttle_bytes(*reserved);

        let outcome = match store.insert_row(txn, ctx.target(), write) {
            Ok(()) => Outcome::Copied {
                genid_changed: id != row.id,
            },
            Err(StoreError::Exists { .. }) if ctx.req.resume => {
                debug!("row already converted table={source} row={}", row.id);
                Outcome::AlreadyCopied
            }
            Err(e) => return Err(e.into()),
        };

        if ctx.req.scan_mode.is_parallel() && (self.rows + 1) % ctx.opts.save_every_n == 0 {
            store.set_high_watermark_row_id(Some(txn), source, self.worker, StripeCursor::At(row.id))?;
        }
        // Still holding the row lock, so the redo sees the row as converted
        // no earlier than its copy becomes visible.
        if ctx.req.scan_mode.is_parallel() {
            ctx.shared.watermarks.advance(self.worker, row.id);
        }
        self.cursor.advance(&row);
        Ok(outcome)
    }

    /// Called at the end of the scan while the transaction still holds the
    /// end of stripe lock. Returns whether `txn` has to be committed.
    fn finish_stripe(&self, ctx: &Context<S>, txn: &mut S::Txn) -> Result<bool> {
        let marks = &ctx.shared.watermarks;
        if !ctx.req.scan_mode.is_parallel() {
            for stripe in 0..marks.stripes() {
                marks.set_done(stripe);
            }
            Ok(false)
        } else if ctx.req.logical {
            marks.mark_converted(self.worker);
            Ok(false)
        } else {
            ctx.store
                .set_high_watermark_row_id(Some(txn), ctx.source(), self.worker, StripeCursor::Done)?;
            marks.set_done(self.worker);
            Ok(true)
        }
    }

    fn retry(&mut self, ctx: &Context<S>) -> Result<()> {
        self.row_retries += 1;
        ctx.shared.counters.retries.fetch_add(1, Ordering::Relaxed);
        SC_RETRIES.with_label_values(&[ctx.source()]).inc();
        if !ctx.req.live && self.row_retries > ctx.opts.max_retries {
            return Err(SchemaChangeError::RetryLimit {
                table: ctx.source().to_owned(),
                retries: self.row_retries,
            });
        }
        if ctx.opts.adaptive_threads {
            ctx.governor.decrease_max_threads();
        } else {
            thread::sleep(ctx.opts.retry_sleep());
        }
        Ok(())
    }

    fn constraint_violation(&mut self, ctx: &Context<S>, kind: ConstraintKind) -> Result<Step> {
        let Some(row) = self.current else {
            return Err(SchemaChangeError::Config(format!("constraint violation without a row: {kind}")));
        };

        // The conflicting row may be a stale copy the redo is about to
        // remove. Give it the chance to replay everything committed so far.
        if ctx.req.logical {
            let lsn = match self.violation {
                Some((r, lsn)) if r == row => lsn,
                _ => {
                    let lsn = ctx.store.last_commit_lsn();
                    self.violation = Some((row, lsn));
                    lsn
                }
            };
            if ctx.shared.redo_pos.get() < lsn {
                debug!(
                    "waiting for redo table={} row={row} lsn={lsn}: {kind}",
                    ctx.source()
                );
                ctx.shared.counters.retries.fetch_add(1, Ordering::Relaxed);
                ctx.shared.redo_pos.wait_for(lsn, CONSTRAINT_WAIT);
                return Ok(Step::Retry);
            }
        }

        if ctx.req.rebuild_index_only
            && ctx.req.scan_mode.is_parallel()
            && matches!(kind, ConstraintKind::DuplicateKey { .. })
        {
            warn!(
                "skipping duplicate key during index rebuild table={} row={row}: {kind}",
                ctx.source()
            );
            ctx.shared.counters.skipped.fetch_add(1, Ordering::Relaxed);
            ctx.shared.watermarks.advance(self.worker, row);
            self.cursor = ScanCursor::Stripe {
                stripe: self.worker,
                after: StripeCursor::At(row),
            };
            return Ok(Step::Row);
        }

        Err(SchemaChangeError::constraint(ctx.target(), row, kind))
    }
}

fn unpack_blobs(table: &str, row: RowId, stored: &BlobSet) -> Result<BlobSet> {
    stored
        .iter()
        .map(|(no, image)| -> Result<(usize, Vec<u8>)> { Ok((no, unpack_blob(table, row, image)?)) })
        .collect()
}
