//! Logical redo: replays writes to the source table that were committed
//! while the converters run.
//!
//! The redo follows the log from the position recorded when the schema change
//! started. Each committed transaction that touched the source table is read
//! back from the log and its row operations are applied to the target table,
//! unless the converter of the row's stripe has not reached the row yet and
//! will copy its latest state anyway.
//!
//! Races between the two sides surface as duplicate keys on insert. The redo
//! then keeps the converter's copy and records the row in a [`GenidTracker`],
//! expecting the delete of the row to follow in the log.

use std::{
    sync::{atomic::Ordering, Arc},
    thread,
    time::Duration,
};

use crossbeam_channel::{never, select, Receiver};
use itertools::Itertools as _;
use livesc_store::{
    BlobSet, CommitNotice, DataOp, Direction, LogBody, LogRecord, Lsn, Priority, ProgressKey, ProgressValue, RowId,
    RowWrite, Store, StoreError, StripeCursor, UpdateOp,
};
use log::{debug, error, info, trace, warn};
use scopeguard::ScopeGuard;

use crate::{
    blob::{check_blob_consistency, BlobRecordSet, Reconstructor},
    error::{Result, RowError, SchemaChangeError},
    metrics::{SC_REDO_TXNS, SC_TRACKER_SIZE},
    orchestrator::Context,
    prepare::Blobs,
    schema::Value,
    state::Worker,
    tracker::GenidTracker,
};

/// Pause between checks while the redo is paused or yields its locks.
const YIELD_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Starting,
    /// Replaying the log in order up to its current end, after a restart.
    Serial,
    /// Replaying transactions as their commits are announced.
    EventDriven,
    /// The converters are done and writes are blocked. Replay up to the
    /// given position, the last commit to the source table.
    Finalizing(Lsn),
    Done,
}

pub(crate) struct LogicalRedo<S: Store> {
    ctx: Arc<Context<S>>,
    notices: Receiver<CommitNotice>,
    done: Receiver<Lsn>,
    pos: Lsn,
    pinned_file: u32,
    tracker: GenidTracker,
    txns: u64,
}

impl<S: Store> LogicalRedo<S> {
    pub fn new(ctx: Arc<Context<S>>, notices: Receiver<CommitNotice>, done: Receiver<Lsn>, start: Lsn) -> Self {
        Self {
            ctx,
            notices,
            done,
            pos: start,
            pinned_file: start.file,
            tracker: GenidTracker::new(),
            txns: 0,
        }
    }

    /// Replay until the orchestrator signals the end of conversion and the
    /// log is drained, or the operation stops. Failures are handed to the
    /// shared control.
    pub fn run(mut self) {
        let ctx = self.ctx.clone();
        match self.replay(&ctx) {
            Ok(()) => info!(
                "logical redo done table={} lsn={} txns={}",
                ctx.source(),
                self.pos,
                self.txns
            ),
            Err(e) if e.is_failure() => {
                error!("logical redo failed table={} lsn={}: {e}", ctx.source(), self.pos);
                ctx.shared.control.fail(Worker::Redo, e);
            }
            Err(e) => debug!("logical redo stopped table={} lsn={}: {e}", ctx.source(), self.pos),
        }
    }

    fn replay(&mut self, ctx: &Context<S>) -> Result<()> {
        let mut state = State::Starting;
        loop {
            trace!("redo state={state:?} lsn={}", self.pos);
            state = match state {
                State::Starting => {
                    ctx.shared.redo_pos.advance(self.pos);
                    if ctx.req.resume {
                        self.load_races(ctx)?;
                        State::Serial
                    } else {
                        State::EventDriven
                    }
                }
                State::Serial => {
                    self.replay_serial(ctx)?;
                    State::EventDriven
                }
                State::EventDriven => self.next_event(ctx)?,
                State::Finalizing(snapshot) => {
                    self.finalize(ctx, snapshot)?;
                    State::Done
                }
                State::Done => return Ok(()),
            };
        }
    }

    fn load_races(&mut self, ctx: &Context<S>) -> Result<()> {
        for (key, value) in ctx.store.list_progress(ctx.source())? {
            let (ProgressKey::RedoGenid(row), Some(lsn)) = (key, value.as_lsn()) else {
                continue;
            };
            self.tracker.record(row, lsn).map_err(|e| self.integrity(ctx, e.row, e.lsn, e.to_string()))?;
        }
        self.update_tracker_size(ctx);
        if !self.tracker.is_empty() {
            info!("resumed races table={} n={}", ctx.source(), self.tracker.len());
        }
        Ok(())
    }

    fn replay_serial(&mut self, ctx: &Context<S>) -> Result<()> {
        let end = ctx.store.last_commit_lsn();
        info!("serial redo table={} from={} to={end}", ctx.source(), self.pos);
        self.replay_log(ctx, end)
    }

    /// Replay every commit in the log after the current position, up to and
    /// including `end`.
    fn replay_log(&mut self, ctx: &Context<S>, end: Lsn) -> Result<()> {
        let mut cursor = self.pos;
        while let Some(rec) = ctx.store.log_get(cursor, Direction::Next)? {
            if rec.lsn > end {
                break;
            }
            cursor = rec.lsn;
            if rec.body.is_commit() {
                self.on_commit(ctx, rec)?;
            }
        }
        self.advance(ctx, end);
        Ok(())
    }

    fn next_event(&mut self, ctx: &Context<S>) -> Result<State> {
        ctx.shared.control.check(Worker::Redo)?;
        let (notices, done) = (self.notices.clone(), self.done.clone());
        select! {
            recv(notices) -> notice => match notice {
                Ok(notice) => self.on_notice(ctx, notice)?,
                Err(_) => {
                    warn!("commit notifications closed table={}", ctx.source());
                    self.notices = never();
                }
            },
            recv(done) -> snapshot => match snapshot {
                Ok(snapshot) => return Ok(State::Finalizing(snapshot)),
                Err(_) => {
                    ctx.shared.control.check(Worker::Redo)?;
                    return Ok(State::Done);
                }
            },
            default(ctx.opts.redo_wait_timeout) => self.idle(ctx)?,
        }
        Ok(State::EventDriven)
    }

    /// No commits were announced for a while. Notices may trail their
    /// commits, so pick up whatever the log holds beyond the current
    /// position.
    fn idle(&mut self, ctx: &Context<S>) -> Result<()> {
        let last = ctx.store.last_commit_lsn();
        if last > self.pos {
            self.replay_log(ctx, last)?;
        }
        Ok(())
    }

    fn finalize(&mut self, ctx: &Context<S>, snapshot: Lsn) -> Result<()> {
        debug!("finalizing redo table={} lsn={} snapshot={snapshot}", ctx.source(), self.pos);
        self.replay_log(ctx, snapshot)?;
        // Whatever is still queued was just replayed from the log.
        let stale = self.notices.try_iter().filter(|notice| notice.lsn > snapshot).count();
        if stale > 0 {
            warn!("commits after quiesce table={} n={stale}", ctx.source());
        }

        if let Some(oldest) = self.tracker.oldest() {
            error!(
                "unresolved races table={} entries=[{}]",
                ctx.source(),
                self.tracker
                    .entries()
                    .map(|entry| format!("{}@{}", entry.row, entry.lsn))
                    .join(", ")
            );
            return Err(self.integrity(
                ctx,
                oldest.row,
                oldest.lsn,
                format!("{} rows still conflict in the target table", self.tracker.len()),
            ));
        }
        Ok(())
    }

    fn on_notice(&mut self, ctx: &Context<S>, notice: CommitNotice) -> Result<()> {
        if notice.lsn <= self.pos {
            trace!("skip replayed commit lsn={} txn={:?}", notice.lsn, notice.txnid);
            return Ok(());
        }
        // Commits announced out of order are replayed in log order.
        self.find_commit(ctx, notice.lsn)?;
        self.replay_log(ctx, notice.lsn)
    }

    /// Wait for the commit record at `lsn`, which may take a moment to become
    /// readable after the commit was announced.
    fn find_commit(&self, ctx: &Context<S>, lsn: Lsn) -> Result<()> {
        let mut attempts = 0;
        loop {
            match ctx.store.log_get(lsn, Direction::Set) {
                Ok(Some(_)) => return Ok(()),
                Ok(None) | Err(StoreError::LogNotFound { .. }) if attempts < ctx.opts.find_txn_retries => {
                    attempts += 1;
                    thread::sleep(ctx.opts.find_txn_interval);
                }
                Ok(None) => return Err(StoreError::LogNotFound { lsn }.into()),
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn on_commit(&mut self, ctx: &Context<S>, commit: LogRecord) -> Result<()> {
        ctx.shared.control.check(Worker::Redo)?;
        self.yield_if_needed(ctx)?;
        let records = self.read_txn(ctx, &commit)?;
        if !records.is_empty() {
            self.apply_txn(ctx, commit.lsn, &records)?;
        }
        self.advance(ctx, commit.lsn);
        Ok(())
    }

    /// The row operations on the source table of the transaction ending in
    /// `commit`, in log order.
    fn read_txn(&self, ctx: &Context<S>, commit: &LogRecord) -> Result<Vec<LogRecord>> {
        let source = ctx.source();
        let mut records = Vec::new();
        let mut prev = commit.prev_lsn;
        while let Some(lsn) = prev {
            let rec = ctx
                .store
                .log_get(lsn, Direction::Set)?
                .ok_or(StoreError::LogNotFound { lsn })?;
            prev = rec.prev_lsn;
            if rec.is_data_op() && rec.table().is_some_and(|t| t.eq_ignore_ascii_case(source)) {
                records.push(rec);
            }
        }
        records.reverse();
        Ok(records)
    }

    /// Apply one log transaction in a transaction of its own, retrying it as
    /// a whole on lock conflicts.
    fn apply_txn(&mut self, ctx: &Context<S>, commit: Lsn, records: &[LogRecord]) -> Result<()> {
        loop {
            ctx.shared.control.check(Worker::Redo)?;
            match self.try_apply(ctx, commit, records) {
                Ok(()) => break,
                Err(RowError::Retry) => {
                    ctx.shared.counters.retries.fetch_add(1, Ordering::Relaxed);
                    debug!("redo retry table={} commit={commit}", ctx.source());
                    thread::sleep(ctx.opts.retry_sleep());
                }
                Err(RowError::Constraint(kind)) => {
                    return Err(SchemaChangeError::Config(format!("unattributed constraint violation: {kind}")));
                }
                Err(RowError::Fatal(e)) => return Err(e),
            }
        }

        self.txns += 1;
        ctx.shared.counters.redo_txns.fetch_add(1, Ordering::Relaxed);
        SC_REDO_TXNS.with_label_values(&[ctx.source()]).inc();
        self.update_tracker_size(ctx);
        trace!("redone commit={commit} ops={}", records.len());
        Ok(())
    }

    fn try_apply(
        &mut self,
        ctx: &Context<S>,
        commit: Lsn,
        records: &[LogRecord],
    ) -> std::result::Result<(), RowError> {
        let store = &*ctx.store;
        let recon = Reconstructor::new(store, ctx.conv.history());
        let mut blobs = recon.gather_blobs(records)?;

        let mut txn = scopeguard::guard(store.begin_txn(Priority::Normal)?, |txn| store.abort_txn(txn));
        self.tracker.begin_batch();
        if let Err(e) = self.apply_ops(ctx, &mut txn, &recon, records, &mut blobs) {
            self.tracker.rollback_batch();
            return Err(e);
        }
        ctx.throttle.throttle_bytes(store.txn_log_bytes(&txn));
        if (self.txns + 1) % ctx.opts.redo_save_lsn_every_n == 0 {
            let saved = store.save_progress(
                Some(&mut *txn),
                ctx.source(),
                ProgressKey::StartLsn,
                ProgressValue::Lsn(commit),
            );
            if let Err(e) = saved {
                self.tracker.rollback_batch();
                return Err(e.into());
            }
        }
        match store.commit_txn(ScopeGuard::into_inner(txn)) {
            Ok(_) => {
                self.tracker.commit_batch();
                Ok(())
            }
            Err(e) => {
                self.tracker.rollback_batch();
                Err(e.into())
            }
        }
    }

    fn apply_ops(
        &mut self,
        ctx: &Context<S>,
        txn: &mut S::Txn,
        recon: &Reconstructor<'_, S>,
        records: &[LogRecord],
        blobs: &mut BlobRecordSet,
    ) -> std::result::Result<(), RowError> {
        for rec in records {
            if let Some(oldest) = self.tracker.oldest() {
                if oldest.lsn < rec.lsn {
                    return Err(self
                        .integrity(ctx, oldest.row, oldest.lsn, format!("race still unresolved at {}", rec.lsn))
                        .into());
                }
            }
            let Some(row) = rec.genid() else {
                continue;
            };
            let res = match &rec.body {
                LogBody::Add(op) if op.dtafile == 0 => self.redo_add(ctx, txn, recon, rec, op, blobs),
                LogBody::Delete(op) if op.dtafile == 0 => self.redo_delete(ctx, txn, recon, rec, op, blobs),
                LogBody::Update(op) if op.dtafile == 0 => self.redo_update(ctx, txn, recon, rec, op, blobs),
                _ => Ok(()),
            };
            res.map_err(|e| match e {
                RowError::Constraint(kind) => SchemaChangeError::constraint(ctx.target(), row, kind).into(),
                e => e,
            })?;
        }
        Ok(())
    }

    fn redo_add(
        &mut self,
        ctx: &Context<S>,
        txn: &mut S::Txn,
        recon: &Reconstructor<'_, S>,
        rec: &LogRecord,
        op: &DataOp,
        blobs: &mut BlobRecordSet,
    ) -> std::result::Result<(), RowError> {
        let id = op.genid;
        let images = blobs.take(id);
        if self.is_converted_row(ctx, id) || ctx.shared.watermarks.is_ahead(id) {
            trace!("redo add skipped row={id} lsn={}", rec.lsn);
            return Ok(());
        }
        let values = recon.add(rec, op)?;
        self.insert(ctx, txn, id, &values, &images.new)
    }

    fn redo_delete(
        &mut self,
        ctx: &Context<S>,
        txn: &mut S::Txn,
        recon: &Reconstructor<'_, S>,
        rec: &LogRecord,
        op: &DataOp,
        blobs: &mut BlobRecordSet,
    ) -> std::result::Result<(), RowError> {
        let id = op.genid;
        recon.delete(rec, op)?;
        blobs.take(id);
        if self.resolve(ctx, txn, rec, id)? {
            trace!("redo delete of raced row={id} lsn={}", rec.lsn);
            return Ok(());
        }
        self.delete(ctx, txn, id)
    }

    fn redo_update(
        &mut self,
        ctx: &Context<S>,
        txn: &mut S::Txn,
        recon: &Reconstructor<'_, S>,
        rec: &LogRecord,
        op: &UpdateOp,
        blobs: &mut BlobRecordSet,
    ) -> std::result::Result<(), RowError> {
        let (old, new) = (op.old_genid, op.new_genid);
        let (_, next) = recon.update(rec, op)?;
        let images = blobs.take_update(old, new);

        // The converter will copy the new row, only the old one may have to
        // go.
        if ctx.shared.watermarks.is_ahead(new) {
            if !self.resolve(ctx, txn, rec, old)? {
                self.delete(ctx, txn, old)?;
            }
            // The delete holds the row lock. A converter that passed the row
            // in the meantime has committed its copy, which is now gone.
            if ctx.shared.watermarks.is_ahead(new) {
                return Ok(());
            }
            return self.insert(ctx, txn, new, &next, &images.new);
        }
        if self.resolve(ctx, txn, rec, old)? {
            return self.insert(ctx, txn, new, &next, &images.new);
        }

        let write = self.prepare(ctx, txn, new, &next, &images.new)?;
        match ctx.store.update_row(txn, ctx.target(), old, write.clone()) {
            Ok(()) => Ok(()),
            Err(StoreError::DuplicateKey { .. }) => {
                self.track_race(ctx, txn, new)?;
                self.delete(ctx, txn, old)
            }
            Err(StoreError::NotFound { .. } | StoreError::Exists { .. }) => {
                debug!("redo update falls back to delete and insert old={old} new={new}");
                self.delete(ctx, txn, old)?;
                self.insert_write(ctx, txn, write)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn prepare(
        &self,
        ctx: &Context<S>,
        txn: &mut S::Txn,
        id: RowId,
        values: &[Value],
        blobs: &BlobSet,
    ) -> std::result::Result<RowWrite, RowError> {
        let blobs = if ctx.conv.fetch_blobs() {
            check_blob_consistency(ctx.conv.source(), id, values, blobs)?;
            Blobs::Fetched(blobs)
        } else {
            Blobs::Skipped
        };
        ctx.conv.prepare(&*ctx.store, txn, id, values, blobs)
    }

    fn insert(
        &mut self,
        ctx: &Context<S>,
        txn: &mut S::Txn,
        id: RowId,
        values: &[Value],
        blobs: &BlobSet,
    ) -> std::result::Result<(), RowError> {
        let write = self.prepare(ctx, txn, id, values, blobs)?;
        self.insert_write(ctx, txn, write)
    }

    fn insert_write(
        &mut self,
        ctx: &Context<S>,
        txn: &mut S::Txn,
        write: RowWrite,
    ) -> std::result::Result<(), RowError> {
        let id = write.id;
        match ctx.store.insert_row(txn, ctx.target(), write) {
            Ok(()) => Ok(()),
            Err(StoreError::Exists { .. }) => {
                trace!("redo insert of present row={id}");
                Ok(())
            }
            Err(StoreError::DuplicateKey { .. }) => self.track_race(ctx, txn, id),
            Err(e) => Err(e.into()),
        }
    }

    fn delete(&self, ctx: &Context<S>, txn: &mut S::Txn, id: RowId) -> std::result::Result<(), RowError> {
        match ctx.store.delete_row(txn, ctx.target(), id) {
            Ok(()) | Err(StoreError::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// The converter's copy of `id` is already in the target table. Keep it
    /// and expect the stale row to be deleted.
    fn track_race(&mut self, ctx: &Context<S>, txn: &mut S::Txn, id: RowId) -> std::result::Result<(), RowError> {
        if self.tracker.get(id).is_some() {
            trace!("race already tracked row={id}");
            return Ok(());
        }
        let lsn = ctx.store.last_commit_lsn();
        self.tracker
            .record(id, lsn)
            .map_err(|e| self.integrity(ctx, e.row, e.lsn, e.to_string()))?;
        ctx.store
            .save_progress(Some(txn), ctx.source(), ProgressKey::RedoGenid(id.base()), ProgressValue::Lsn(lsn))?;
        debug!("race recorded table={} row={id} lsn={lsn}", ctx.source());
        Ok(())
    }

    /// Consume the race entry of `id`, if any.
    fn resolve(
        &mut self,
        ctx: &Context<S>,
        txn: &mut S::Txn,
        rec: &LogRecord,
        id: RowId,
    ) -> std::result::Result<bool, RowError> {
        let Some(lsn) = self.tracker.resolve(id) else {
            return Ok(false);
        };
        if lsn < rec.lsn {
            return Err(self
                .integrity(ctx, id, lsn, format!("race resolved late at {}", rec.lsn))
                .into());
        }
        ctx.store
            .delete_progress(Some(txn), ctx.source(), ProgressKey::RedoGenid(id.base()))?;
        debug!("race resolved table={} row={id} lsn={lsn}", ctx.source());
        Ok(true)
    }

    /// True if `id` is the row its stripe's converter copied last.
    fn is_converted_row(&self, ctx: &Context<S>, id: RowId) -> bool {
        let marks = &ctx.shared.watermarks;
        id.stripe() < marks.stripes() && marks.get(id.stripe()) == StripeCursor::At(id.base())
    }

    fn advance(&mut self, ctx: &Context<S>, lsn: Lsn) {
        if lsn <= self.pos {
            return;
        }
        self.pos = lsn;
        ctx.shared.redo_pos.advance(lsn);
        if lsn.file != self.pinned_file {
            ctx.store.pin_log(ctx.source(), lsn.file);
            self.pinned_file = lsn.file;
        }
    }

    fn yield_if_needed(&self, ctx: &Context<S>) -> Result<()> {
        while ctx.shared.control.is_redo_paused() {
            ctx.shared.control.check(Worker::Redo)?;
            thread::sleep(YIELD_INTERVAL);
        }
        if ctx.store.lock_desired() {
            trace!("redo yields table={}", ctx.source());
            thread::sleep(YIELD_INTERVAL);
        }
        Ok(())
    }

    fn update_tracker_size(&self, ctx: &Context<S>) {
        let n = self.tracker.len();
        ctx.shared.counters.tracker_size.store(n as u64, Ordering::Relaxed);
        SC_TRACKER_SIZE.with_label_values(&[ctx.source()]).set(n as i64);
    }

    fn integrity(&self, ctx: &Context<S>, row: RowId, lsn: Lsn, reason: String) -> SchemaChangeError {
        SchemaChangeError::IntegrityViolation {
            table: ctx.source().to_owned(),
            row,
            lsn,
            reason,
        }
    }
}
