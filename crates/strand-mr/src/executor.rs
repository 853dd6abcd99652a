//! Pipeline stage execution.
//!
//! `run` wires one stage: a shared file-name queue (capacity 16), and on
//! every reactor a record queue (capacity 256), N worker fibers popping
//! file names and decoding through the runner, and one mapper fiber
//! draining records into the stage's do-function. Shutdown is ordered:
//! close the file queue, join the workers, `start_closing` each record
//! queue, join the mappers, flush the contexts.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use strand_core::channel::{self, Channel};
use strand_core::{block_on, yield_now, Error, Result};
use strand_runtime::{JoinHandle, ReactorPool};

use crate::input::{FileInput, InputSpec};
use crate::runner::{DoFn, OperatorContext, RecordQueue, Runner, Stage};

const FILE_QUEUE_CAP: usize = 16;
const RECORD_QUEUE_CAP: usize = 256;

/// How often the mapper yields for cooperative fairness.
const MAP_YIELD_EVERY: u64 = 1000;

#[derive(Clone, Copy)]
pub struct PipelineOptions {
    /// Per-reactor cap on mapped records; 0 disables. Records past the
    /// cap are counted and discarded.
    pub map_limit: u64,
    /// Worker fibers per reactor.
    pub process_fibers: usize,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self { map_limit: 0, process_fibers: 1 }
    }
}

impl PipelineOptions {
    pub fn validate(&self) -> Result<()> {
        if self.process_fibers == 0 {
            return Err(Error::Resource("process_fibers must be at least 1"));
        }
        Ok(())
    }
}

/// Accounting for one finished run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PipelineSummary {
    pub records_pushed: u64,
    pub records_mapped: u64,
    pub records_skipped: u64,
    pub parse_errors: u64,
}

struct PerIo {
    record_q: RecordQueue,
    stop_early: Rc<Cell<bool>>,
    context: Rc<RefCell<Box<dyn OperatorContext>>>,
    process_handles: Vec<JoinHandle<u64>>,
    map_handle: Option<JoinHandle<(u64, u64)>>,
}

thread_local! {
    static PER_IO: RefCell<Option<PerIo>> = const { RefCell::new(None) };
}

#[derive(Default)]
struct RunStats {
    pushed: AtomicU64,
    mapped: AtomicU64,
    skipped: AtomicU64,
    parse_errors: AtomicU64,
    first_error: Mutex<Option<Error>>,
}

impl RunStats {
    fn record_error(&self, e: Error) {
        let mut slot = self.first_error.lock().expect("stats poisoned");
        if slot.is_none() {
            *slot = Some(e);
        }
    }
}

/// Executes pipeline stages over a reactor pool.
pub struct PipelineExecutor {
    pool: Arc<ReactorPool>,
    runner: Arc<dyn Runner>,
    opts: PipelineOptions,
    file_name_q: Mutex<Option<Channel<FileInput>>>,
}

impl PipelineExecutor {
    pub fn new(pool: Arc<ReactorPool>, runner: Arc<dyn Runner>, opts: PipelineOptions) -> Result<Self> {
        opts.validate()?;
        Ok(Self { pool, runner, opts, file_name_q: Mutex::new(None) })
    }

    pub fn init(&self) {
        self.runner.init();
    }

    pub fn shutdown(&self) {
        self.runner.shutdown();
    }

    /// Run one stage over `inputs`. Called from a non-reactor thread;
    /// returns once every fiber has drained and contexts are flushed.
    pub fn run(&self, inputs: &[InputSpec], stage: Arc<dyn Stage>) -> Result<PipelineSummary> {
        let file_q: Channel<FileInput> = channel::channel(FILE_QUEUE_CAP);
        *self.file_name_q.lock().expect("file queue slot poisoned") = Some(file_q.clone());

        let op = stage.op_name().to_string();
        self.runner.operator_start(&op);

        // Per-reactor setup: record queue, workers, mapper, context.
        {
            let runner = self.runner.clone();
            let stage = stage.clone();
            let file_q = file_q.clone();
            let opts = self.opts;
            self.pool.await_on_all(move |_, r| {
                let record_q = RecordQueue::new(RECORD_QUEUE_CAP);
                let stop_early = Rc::new(Cell::new(false));
                let context =
                    Rc::new(RefCell::new(runner.create_context(stage.op_name())));
                let mut process_handles = Vec::with_capacity(opts.process_fibers);
                for _ in 0..opts.process_fibers {
                    process_handles.push(r.spawn(process_files(
                        file_q.clone(),
                        runner.clone(),
                        record_q.clone(),
                        stop_early.clone(),
                    )));
                }
                let map_handle = r.spawn(map_fiber(
                    record_q.clone(),
                    stage.setup_do_fn(),
                    context.clone(),
                    opts.map_limit,
                ));
                PER_IO.with(|p| {
                    *p.borrow_mut() = Some(PerIo {
                        record_q,
                        stop_early,
                        context,
                        process_handles,
                        map_handle: Some(map_handle),
                    })
                });
            });
        }

        // Expand globs and feed the file-name queue from this thread.
        'inputs: for input in inputs {
            let mut files = Vec::new();
            for spec in &input.file_specs {
                let format = spec.format;
                self.runner.expand_glob(&spec.url_glob, &mut |path| {
                    files.push(FileInput { path, format });
                });
            }
            tracing::info!(input = %input.name, files = files.len(), "running input");
            for file in files {
                if block_on(file_q.push(file)).is_err() {
                    // Stop() closed the queue; drop the rest.
                    break 'inputs;
                }
            }
        }
        file_q.close();

        // Drain every reactor: join workers, close record queues, join
        // mappers, flush contexts, aggregate accounting.
        let stats = Arc::new(RunStats::default());
        {
            let stats_outer = stats.clone();
            self.pool.await_fiber_on_all(move |_, _r| {
                let stats = stats_outer.clone();
                async move {
                    let Some(per) = PER_IO.with(|p| p.borrow_mut().take()) else {
                        return;
                    };
                    for handle in per.process_handles {
                        match handle.join().await {
                            Ok(count) => tracing::debug!(count, "process fiber joined"),
                            Err(e) => stats.record_error(e),
                        }
                    }
                    // Workers are done: every record is in the queue, so
                    // now tell the mapper no more will come.
                    per.record_q.start_closing();
                    if let Some(map_handle) = per.map_handle {
                        match map_handle.join().await {
                            Ok((mapped, skipped)) => {
                                stats.mapped.fetch_add(mapped, Ordering::Relaxed);
                                stats.skipped.fetch_add(skipped, Ordering::Relaxed);
                            }
                            Err(e) => stats.record_error(e),
                        }
                    }
                    per.context.borrow_mut().flush();
                    stats
                        .parse_errors
                        .fetch_add(per.context.borrow().parse_errors(), Ordering::Relaxed);
                    stats.pushed.fetch_add(per.record_q.pushed(), Ordering::Relaxed);
                }
            });
        }

        self.runner.operator_end(&op);
        *self.file_name_q.lock().expect("file queue slot poisoned") = None;

        let summary = PipelineSummary {
            records_pushed: stats.pushed.load(Ordering::Relaxed),
            records_mapped: stats.mapped.load(Ordering::Relaxed),
            records_skipped: stats.skipped.load(Ordering::Relaxed),
            parse_errors: stats.parse_errors.load(Ordering::Relaxed),
        };
        if summary.parse_errors > 0 {
            tracing::warn!(op = %op, errors = summary.parse_errors, "stage had parse errors");
        }
        tracing::info!(
            op = %op,
            pushed = summary.records_pushed,
            mapped = summary.records_mapped,
            skipped = summary.records_skipped,
            "stage finished"
        );

        let first_error = stats.first_error.lock().expect("stats poisoned").take();
        match first_error {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }

    /// Abort the run: close the file-name queue and flag every reactor.
    /// Workers check the flag between pops; mappers drain what is
    /// already queued.
    pub fn stop(&self) {
        let file_q = self.file_name_q.lock().expect("file queue slot poisoned").clone();
        if let Some(file_q) = file_q {
            file_q.close();
            self.pool.dispatch_on_all(|_, _| {
                PER_IO.with(|p| {
                    if let Some(per) = p.borrow().as_ref() {
                        per.stop_early.set(true);
                    }
                });
            });
        }
    }
}

async fn process_files(
    file_q: Channel<FileInput>,
    runner: Arc<dyn Runner>,
    record_q: RecordQueue,
    stop_early: Rc<Cell<bool>>,
) -> u64 {
    let mut count = 0u64;
    loop {
        if stop_early.get() {
            break;
        }
        let Some(file) = file_q.pop().await else {
            break;
        };
        match runner.process_file(&file.path, file.format, &record_q).await {
            Ok(n) => count += n as u64,
            // A bad file is local damage; the stage keeps going.
            Err(e) => tracing::warn!(file = %file.path, error = %e, "process_file failed"),
        }
    }
    tracing::debug!(count, "process fiber drained");
    count
}

/// Closes the record queue if the mapper unwinds, so producers blocked
/// on a full queue fail with `Closed` instead of wedging the shutdown.
struct MapperGuard {
    record_q: RecordQueue,
    armed: bool,
}

impl Drop for MapperGuard {
    fn drop(&mut self) {
        if self.armed {
            self.record_q.close();
        }
    }
}

async fn map_fiber(
    record_q: RecordQueue,
    mut do_fn: DoFn,
    context: Rc<RefCell<Box<dyn OperatorContext>>>,
    map_limit: u64,
) -> (u64, u64) {
    let mut guard = MapperGuard { record_q: record_q.clone(), armed: true };
    let mut record_num = 0u64;
    let mut mapped = 0u64;
    let mut skipped = 0u64;
    while let Some(record) = record_q.pop().await {
        record_num += 1;
        if map_limit > 0 && record_num > map_limit {
            skipped += 1;
            continue;
        }
        do_fn(record, &mut **context.borrow_mut());
        mapped += 1;
        if record_num % MAP_YIELD_EVERY == 0 {
            yield_now().await;
        }
    }
    guard.armed = false;
    tracing::debug!(record_num, mapped, skipped, "map fiber finished");
    (mapped, skipped)
}
