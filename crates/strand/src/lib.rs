//! # strand — fiber-aware I/O runtime for Linux
//!
//! Per-thread reactors (io_uring or epoll) each run a cooperative fiber
//! scheduler; sockets, channels and timers suspend fibers instead of
//! threads. On top sit an accept server that fans connections out across
//! the pool and a pipeline executor for record map/shuffle runs.
//!
//! ## Quick start
//!
//! ```ignore
//! use std::sync::Arc;
//! use strand::{AcceptServer, PoolConfig, ReactorPool};
//!
//! let pool = ReactorPool::run(PoolConfig::default())?;
//! let server = AcceptServer::new(pool.clone());
//! let port = server.add_listener(0, Arc::new(MyListener))?;
//! server.run();
//! // ...
//! server.stop(true);
//! pool.stop();
//! ```

pub use strand_core::{
    block_on, channel, varz, yield_now, BlockingCounter, Channel, Done, Error, Result, VarzCount,
    VarzQps,
};
pub use strand_mr::{
    DoFn, FileInput, FileSpec, InputSpec, OperatorContext, PipelineExecutor, PipelineOptions,
    PipelineSummary, Record, RecordQueue, Runner, Stage, WireFormat,
};
pub use strand_net::{
    bind_listener, frame, AcceptServer, AcceptedSocket, Connection, FiberSocket, FrameDecoder,
    ListenerInterface, MAX_FRAME,
};
pub use strand_runtime::{
    deadline, sleep, JoinHandle, PoolConfig, Reactor, ReactorConfig, ReactorKind, ReactorPool,
    Remote, WorkGuard,
};
pub use strand_uring::{FdEvent, UringManager, UringManagerConfig, WakeHandle};
