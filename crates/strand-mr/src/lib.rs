//! # strand-mr — the pipeline executor
//!
//! Runs one mapping stage over a set of input files: a shared file-name
//! queue feeds per-reactor worker fibers that decode records (through a
//! user-supplied [`Runner`]) into per-reactor bounded record queues; a
//! mapper fiber per reactor drains its queue into the stage's
//! do-function. Records are processed at least once per input file; the
//! pipeline assumes idempotent output.

pub mod executor;
pub mod input;
pub mod runner;

pub use executor::{PipelineExecutor, PipelineOptions, PipelineSummary};
pub use input::{FileInput, FileSpec, InputSpec, WireFormat};
pub use runner::{DoFn, OperatorContext, Record, RecordQueue, Runner, Stage};
