//! Running a schema change: the stripe converters and the logical redo,
//! their coordination and the final cutover.

use std::{sync::Arc, thread};

use crossbeam_channel::bounded;
use livesc_store::{Lsn, ProgressKey, ProgressValue, Store, StripeCursor};
use log::{debug, info, warn};

use crate::{
    config::Options,
    converter::StripeConverter,
    error::{AbortReason, Result, SchemaChangeError},
    metrics,
    prepare::Conversion,
    redo::LogicalRedo,
    report::{LogSink, ProgressSink, ProgressSnapshot, ReportClock},
    request::SchemaChangeRequest,
    state::{Control, Counters, RedoPosition, Watermarks, Worker},
    throttle::{Throttle, ThreadGovernor},
};

/// State visible from outside while a schema change runs.
pub(crate) struct Shared {
    pub control: Control,
    pub watermarks: Watermarks,
    pub counters: Counters,
    pub redo_pos: RedoPosition,
}

impl Shared {
    pub fn new(stripes: u8) -> Self {
        Self {
            control: Control::default(),
            watermarks: Watermarks::new((0..stripes).map(|_| StripeCursor::Pending)),
            counters: Counters::new(stripes),
            redo_pos: RedoPosition::default(),
        }
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot::collect(&self.counters, &self.watermarks, self.redo_pos.get())
    }
}

/// Everything the workers of one schema change share.
pub(crate) struct Context<S: Store> {
    pub store: Arc<S>,
    pub req: SchemaChangeRequest,
    pub conv: Conversion,
    pub opts: Options,
    pub throttle: Arc<Throttle>,
    pub governor: ThreadGovernor,
    pub shared: Arc<Shared>,
    sink: Arc<dyn ProgressSink>,
    clock: ReportClock,
}

impl<S: Store> Context<S> {
    pub fn source(&self) -> &str {
        self.req.source_table()
    }

    pub fn target(&self) -> &str {
        self.req.target_table()
    }

    /// Called by converters after every row. One caller per report interval
    /// reports progress and checks the disk headroom.
    pub fn periodic(&self) {
        self.governor.sample(self.store.lock_stats());
        if self.clock.try_claim() {
            self.sink.progress(self.source(), &self.shared.snapshot());
            check_headroom(&*self.store, &self.opts, self.req.force, &self.shared.control, self.source());
        }
    }
}

/// Abort unless forced if free disk space is below the configured minimum.
pub(crate) fn check_headroom<S: Store>(store: &S, opts: &Options, force: bool, control: &Control, table: &str) {
    let headroom = store.disk_headroom_pct();
    if headroom >= opts.min_disk_headroom_pct {
        return;
    }
    if force {
        warn!("proceeding despite low disk headroom table={table} headroom={headroom:.1}%");
    } else {
        warn!("aborting on low disk headroom table={table} headroom={headroom:.1}%");
        control.request_abort(AbortReason::DiskHeadroom);
    }
}

/// Controls a running schema change from another thread.
#[derive(Clone)]
pub struct SchemaChangeHandle {
    shared: Arc<Shared>,
}

impl SchemaChangeHandle {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Ask all workers to stop. Idempotent.
    pub fn request_abort(&self) {
        self.shared.control.request_abort(AbortReason::Requested);
    }

    /// Signal that this node is no longer the write master.
    pub fn master_downgrade(&self) {
        self.shared.control.downgrade();
    }

    /// Pause or unpause the logical redo.
    pub fn pause_redo(&self, pause: bool) {
        self.shared.control.set_pause_redo(pause);
    }

    pub fn progress_snapshot(&self) -> ProgressSnapshot {
        self.shared.snapshot()
    }
}

/// A schema change of one table, ready to [`start`](Self::start).
pub struct SchemaChange<S: Store> {
    ctx: Arc<Context<S>>,
}

impl<S: Store> SchemaChange<S> {
    pub fn new(store: Arc<S>, req: SchemaChangeRequest, opts: Options) -> Result<Self> {
        req.validate()?;
        opts.validate()?;
        let conv = Conversion::new(
            req.source.clone(),
            req.target.clone(),
            req.rebuild_index_only,
            req.force_rebuild,
        )?;
        let throttle = Arc::new(Throttle::new(opts.log_bytes_per_second));
        let governor = ThreadGovernor::new(opts.max_threads, opts.lock_check_interval, opts.lockwait_grow_threshold);
        let shared = Arc::new(Shared::new(req.stripes));
        let clock = ReportClock::new(opts.report_interval);
        Ok(Self {
            ctx: Arc::new(Context {
                store,
                req,
                conv,
                opts,
                throttle,
                governor,
                shared,
                sink: Arc::new(LogSink),
                clock,
            }),
        })
    }

    fn ctx_mut(&mut self) -> &mut Context<S> {
        Arc::get_mut(&mut self.ctx).unwrap_or_else(|| unreachable!("context is only shared once started"))
    }

    /// Share a log byte budget with other operations.
    pub fn with_throttle(mut self, throttle: Arc<Throttle>) -> Self {
        self.ctx_mut().throttle = throttle;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.ctx_mut().sink = sink;
        self
    }

    pub fn handle(&self) -> SchemaChangeHandle {
        SchemaChangeHandle::new(self.ctx.shared.clone())
    }

    pub fn request_abort(&self) {
        self.handle().request_abort();
    }

    pub fn progress_snapshot(&self) -> ProgressSnapshot {
        self.ctx.shared.snapshot()
    }

    /// Run the schema change to completion.
    pub fn start(self) -> Result<ProgressSnapshot> {
        metrics::register_custom_metrics();
        let ctx = self.ctx;
        info!(
            "starting schema change table={} target={} stripes={} mode={:?} live={} logical={} resume={}",
            ctx.source(),
            ctx.target(),
            ctx.req.stripes,
            ctx.req.scan_mode,
            ctx.req.live,
            ctx.req.logical,
            ctx.req.resume
        );
        let res = run(&ctx);
        if ctx.req.logical {
            ctx.store.unsubscribe_commits(ctx.source());
        }
        let snapshot = ctx.shared.snapshot();
        match &res {
            Ok(()) => ctx.sink.finished(ctx.source(), Ok(&snapshot)),
            Err(e) => ctx.sink.finished(ctx.source(), Err(e)),
        }
        res.map(|()| snapshot)
    }
}

fn run<S: Store>(ctx: &Arc<Context<S>>) -> Result<()> {
    let store = &*ctx.store;
    let source = ctx.source();
    if ctx.req.resume {
        if !ctx.req.logical && store.load_progress(source, ProgressKey::StartLsn)?.is_some() {
            return Err(SchemaChangeError::Config(
                "cannot resume without logical redo, the interrupted change used it".to_owned(),
            ));
        }
        for stripe in 0..ctx.req.stripes {
            let cursor = store.high_watermark_row_id(source, stripe)?;
            debug!("resume table={source} stripe={stripe} cursor={cursor:?}");
            match cursor {
                StripeCursor::Done => ctx.shared.watermarks.set_done(stripe),
                StripeCursor::At(id) => {
                    ctx.shared.watermarks.advance(stripe, id);
                }
                StripeCursor::Pending => {}
            }
        }
    } else {
        clear_progress(store, source)?;
    }

    let redo = if ctx.req.logical {
        // Subscribe before reading the start position, so no commit after it
        // goes unnoticed.
        let notices = store.subscribe_commits(source);
        let saved = if ctx.req.resume {
            store.load_progress(source, ProgressKey::StartLsn)?.and_then(|v| v.as_lsn())
        } else {
            None
        };
        let start = match saved {
            Some(lsn) => lsn,
            None => {
                let lsn = store.last_commit_lsn();
                store.save_progress(None, source, ProgressKey::StartLsn, ProgressValue::Lsn(lsn))?;
                lsn
            }
        };
        store.pin_log(source, start.file);
        info!("logical redo table={source} start={start}");
        let (done_tx, done_rx) = bounded::<Lsn>(1);
        let redo = LogicalRedo::new(ctx.clone(), notices, done_rx, start);
        let join = thread::Builder::new()
            .name(format!("sc-redo-{source}"))
            .spawn(move || redo.run())
            .map_err(SchemaChangeError::Spawn)?;
        Some((join, done_tx))
    } else {
        None
    };

    let mut converters = Vec::with_capacity(ctx.req.workers() as usize);
    for worker in 0..ctx.req.workers() {
        let converter = StripeConverter::new(ctx.clone(), worker);
        let spawned = thread::Builder::new()
            .name(format!("sc-convert-{source}-{worker}"))
            .spawn(move || converter.run());
        match spawned {
            Ok(join) => converters.push((worker, join)),
            Err(e) => {
                ctx.shared.control.fail(Worker::Stripe(worker), SchemaChangeError::Spawn(e));
                break;
            }
        }
    }
    for (worker, join) in converters {
        match join.join() {
            Ok(rows) => debug!("converter joined table={source} worker={worker} rows={rows}"),
            Err(_) => {
                ctx.shared.control.fail(
                    Worker::Stripe(worker),
                    SchemaChangeError::Panicked(format!("converter {worker}")),
                );
            }
        }
    }
    let converted = ctx.shared.control.check(Worker::Redo).is_ok() && ctx.shared.control.failed_worker().is_none();

    // Writes stay blocked until the cutover finished.
    let mut resume_writes = None;
    if let Some((join, done_tx)) = redo {
        let mut quiesce_failed = None;
        if converted {
            match store.quiesce_writes(source) {
                Ok(snapshot) => {
                    resume_writes = Some(scopeguard::guard((), |()| store.resume_writes(source)));
                    info!("converters done, finalizing redo table={source} snapshot={snapshot}");
                    let _ = done_tx.send(snapshot);
                }
                Err(e) => quiesce_failed = Some(e),
            }
        }
        drop(done_tx);
        if let Some(e) = quiesce_failed {
            let _ = join.join();
            return Err(e.into());
        }
        match join.join() {
            Ok(()) => {}
            Err(_) => {
                ctx.shared
                    .control
                    .fail(Worker::Redo, SchemaChangeError::Panicked("redo".to_owned()));
            }
        }
    }

    if let Some(e) = ctx.shared.control.take_error() {
        return Err(e);
    }
    if ctx.shared.control.is_downgraded() {
        return Err(SchemaChangeError::Aborted(AbortReason::MasterDowngrade));
    }
    if let Some(reason) = ctx.shared.control.abort_reason() {
        return Err(SchemaChangeError::Aborted(reason));
    }

    if ctx.req.cutover {
        store.swap_tables(source, ctx.target())?;
        info!("swapped tables table={source} target={}", ctx.target());
    }
    clear_progress(store, source)?;
    drop(resume_writes);
    Ok(())
}

/// Remove all persisted progress of a schema change of `table`.
fn clear_progress<S: Store>(store: &S, table: &str) -> Result<()> {
    for (key, _) in store.list_progress(table)? {
        store.delete_progress(None, table, key)?;
    }
    Ok(())
}
