//! Pipeline executor integration tests with an in-memory runner.

use std::collections::BTreeMap;
use std::sync::{Arc, Barrier, Mutex};

use async_trait::async_trait;
use strand_core::Result;
use strand_mr::{
    DoFn, InputSpec, OperatorContext, PipelineExecutor, PipelineOptions, Record, RecordQueue,
    Runner, Stage, WireFormat,
};
use strand_runtime::{PoolConfig, ReactorConfig, ReactorKind, ReactorPool};

const FMT: WireFormat = WireFormat(1);

struct NullContext;

impl OperatorContext for NullContext {}

/// Runner over an in-memory file map. An optional barrier in
/// `process_file` forces each reactor to hold exactly one file before
/// any decoding starts, making per-reactor record counts deterministic.
struct MemRunner {
    files: BTreeMap<String, Vec<Record>>,
    barrier: Option<Arc<Barrier>>,
}

impl MemRunner {
    fn new(files: BTreeMap<String, Vec<Record>>) -> Self {
        Self { files, barrier: None }
    }

    fn with_barrier(mut self, parties: usize) -> Self {
        self.barrier = Some(Arc::new(Barrier::new(parties)));
        self
    }
}

#[async_trait(?Send)]
impl Runner for MemRunner {
    fn expand_glob(&self, pattern: &str, visit: &mut dyn FnMut(String)) {
        if let Some(prefix) = pattern.strip_suffix('*') {
            for name in self.files.keys().filter(|k| k.starts_with(prefix)) {
                visit(name.clone());
            }
        } else {
            visit(pattern.to_string());
        }
    }

    async fn process_file(&self, path: &str, _format: WireFormat, out: &RecordQueue) -> Result<usize> {
        if let Some(barrier) = &self.barrier {
            barrier.wait();
        }
        let records = self.files.get(path).cloned().unwrap_or_default();
        let count = records.len();
        for record in records {
            out.push(record).await?;
        }
        Ok(count)
    }

    fn create_context(&self, _op: &str) -> Box<dyn OperatorContext> {
        Box::new(NullContext)
    }
}

/// Stage collecting every record into a shared vector.
struct CollectStage {
    out: Arc<Mutex<Vec<Record>>>,
}

impl Stage for CollectStage {
    fn op_name(&self) -> &str {
        "collect"
    }

    fn setup_do_fn(&self) -> DoFn {
        let out = self.out.clone();
        Box::new(move |record, _cx| out.lock().unwrap().push(record))
    }
}

struct PanicStage;

impl Stage for PanicStage {
    fn op_name(&self) -> &str {
        "panics"
    }

    fn setup_do_fn(&self) -> DoFn {
        Box::new(|_record, _cx| panic!("mapper exploded"))
    }
}

fn records(prefix: &str, n: usize) -> Vec<Record> {
    (0..n).map(|i| format!("{}-{}", prefix, i).into_bytes()).collect()
}

fn pool_of(size: usize) -> Arc<ReactorPool> {
    ReactorPool::run(PoolConfig {
        size,
        reactor: ReactorConfig { kind: ReactorKind::Epoll, ..Default::default() },
        pin_threads: false,
    })
    .expect("pool start failed")
}

#[test]
fn test_two_files_twenty_records() {
    let pool = pool_of(2);
    let mut files = BTreeMap::new();
    files.insert("mem/a".to_string(), records("a", 10));
    files.insert("mem/b".to_string(), records("b", 10));
    let runner = Arc::new(MemRunner::new(files));
    let executor = PipelineExecutor::new(pool.clone(), runner, PipelineOptions::default()).unwrap();
    executor.init();

    let out = Arc::new(Mutex::new(Vec::new()));
    let stage = Arc::new(CollectStage { out: out.clone() });
    let inputs = [InputSpec::new("twenty", "mem/*", FMT)];
    let summary = executor.run(&inputs, stage).unwrap();

    let mut got = out.lock().unwrap().clone();
    got.sort();
    let mut expected: Vec<Record> = records("a", 10).into_iter().chain(records("b", 10)).collect();
    expected.sort();
    assert_eq!(got, expected);

    assert_eq!(summary.records_pushed, 20);
    assert_eq!(summary.records_mapped, 20);
    assert_eq!(summary.records_skipped, 0);
    assert_eq!(
        summary.records_pushed,
        summary.records_mapped + summary.records_skipped
    );

    executor.shutdown();
    pool.stop();
}

#[test]
fn test_map_limit_counts_and_discards() {
    // Two reactors, one 50-record file each (the barrier guarantees the
    // split); with map_limit=5 exactly 10 records reach the user
    // function and 90 are skipped.
    let pool = pool_of(2);
    let mut files = BTreeMap::new();
    files.insert("mem/a".to_string(), records("a", 50));
    files.insert("mem/b".to_string(), records("b", 50));
    let runner = Arc::new(MemRunner::new(files).with_barrier(2));
    let executor = PipelineExecutor::new(
        pool.clone(),
        runner,
        PipelineOptions { map_limit: 5, process_fibers: 1 },
    )
    .unwrap();

    let out = Arc::new(Mutex::new(Vec::new()));
    let stage = Arc::new(CollectStage { out: out.clone() });
    let inputs = [InputSpec::new("limited", "mem/*", FMT)];
    let summary = executor.run(&inputs, stage).unwrap();

    assert_eq!(out.lock().unwrap().len(), 10);
    assert_eq!(summary.records_mapped, 10);
    assert_eq!(summary.records_skipped, 90);
    assert_eq!(summary.records_pushed, 100);

    pool.stop();
}

#[test]
fn test_mapper_panic_surfaces_as_run_error() {
    let pool = pool_of(2);
    let mut files = BTreeMap::new();
    files.insert("mem/a".to_string(), records("a", 3));
    let runner = Arc::new(MemRunner::new(files));
    let executor = PipelineExecutor::new(pool.clone(), runner, PipelineOptions::default()).unwrap();

    let inputs = [InputSpec::new("boom", "mem/a", FMT)];
    let err = executor.run(&inputs, Arc::new(PanicStage)).unwrap_err();
    assert!(err.to_string().contains("mapper exploded"), "got: {}", err);

    pool.stop();
}

#[test]
fn test_multiple_workers_per_reactor() {
    let pool = pool_of(1);
    let mut files = BTreeMap::new();
    for i in 0..8 {
        files.insert(format!("mem/f{}", i), records(&format!("f{}", i), 5));
    }
    let runner = Arc::new(MemRunner::new(files));
    let executor = PipelineExecutor::new(
        pool.clone(),
        runner,
        PipelineOptions { map_limit: 0, process_fibers: 3 },
    )
    .unwrap();

    let out = Arc::new(Mutex::new(Vec::new()));
    let stage = Arc::new(CollectStage { out: out.clone() });
    let inputs = [InputSpec::new("many", "mem/*", FMT)];
    let summary = executor.run(&inputs, stage).unwrap();

    assert_eq!(summary.records_mapped, 40);
    assert_eq!(out.lock().unwrap().len(), 40);

    pool.stop();
}
