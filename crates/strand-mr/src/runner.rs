//! The runner and stage interfaces the executor drives.
//!
//! A `Runner` owns everything format- and storage-specific: glob
//! expansion, file decoding, per-operator output contexts. The executor
//! only moves records between queues and fibers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use strand_core::channel::{self, Channel};
use strand_core::Result;

use crate::input::WireFormat;

/// Opaque record bytes.
pub type Record = Vec<u8>;

/// Per-reactor bounded queue of decoded records. Wraps the channel with
/// a relaxed push counter so runs can account for every record.
#[derive(Clone)]
pub struct RecordQueue {
    chan: Channel<Record>,
    pushed: Arc<AtomicU64>,
}

impl RecordQueue {
    pub fn new(capacity: usize) -> Self {
        Self { chan: channel::channel(capacity), pushed: Arc::new(AtomicU64::new(0)) }
    }

    /// Push one record, suspending while the queue is full.
    pub async fn push(&self, record: Record) -> Result<()> {
        self.chan.push(record).await?;
        self.pushed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub(crate) async fn pop(&self) -> Option<Record> {
        self.chan.pop().await
    }

    pub(crate) fn start_closing(&self) {
        self.chan.start_closing();
    }

    /// Hard close: suspended producers fail with `Closed`. Used when the
    /// consuming mapper dies so workers cannot wedge on a full queue.
    pub(crate) fn close(&self) {
        self.chan.close();
    }

    pub fn pushed(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }
}

/// Per-reactor user state for one mapping operator. Created by the
/// runner in `create_context`, flushed when the reactor's mapper joins.
pub trait OperatorContext: Send {
    fn flush(&mut self) {}

    /// Decode failures seen by this context's do-function.
    fn parse_errors(&self) -> u64 {
        0
    }
}

/// The per-record user function, set up once per reactor.
pub type DoFn = Box<dyn FnMut(Record, &mut dyn OperatorContext) + Send>;

/// One mapping stage of a pipeline.
pub trait Stage: Send + Sync {
    fn op_name(&self) -> &str;

    /// Build the do-function for one reactor's mapper fiber.
    fn setup_do_fn(&self) -> DoFn;
}

/// Storage/format backend for pipeline runs. Implementations must be
/// thread-safe: `process_file` and `create_context` are called from
/// every reactor.
#[async_trait(?Send)]
pub trait Runner: Send + Sync {
    fn init(&self) {}

    fn shutdown(&self) {}

    fn operator_start(&self, _op: &str) {}

    fn operator_end(&self, _op: &str) {}

    /// Expand one url glob, calling `visit` per match.
    fn expand_glob(&self, pattern: &str, visit: &mut dyn FnMut(String));

    /// Decode `path` and push records into `out`. Fiber-friendly: it
    /// runs on a reactor and must suspend (not block) when the queue is
    /// full. Returns the number of records produced.
    async fn process_file(&self, path: &str, format: WireFormat, out: &RecordQueue) -> Result<usize>;

    /// Per-reactor context for `op`.
    fn create_context(&self, op: &str) -> Box<dyn OperatorContext>;
}
