//! # strand-runtime — per-thread reactors and fibers
//!
//! Each [`Reactor`] runs on its own OS thread and couples an I/O driver
//! with a single-threaded cooperative scheduler. Fibers are lightweight
//! tasks multiplexed on kernel readiness/completions; they suspend only
//! at awaits (socket I/O, channels, timers, explicit yield), so state
//! owned by one reactor never needs a lock.
//!
//! Two interchangeable drivers share the scheduling contract:
//!
//! - [`ReactorKind::Uring`]: an io_uring submission/completion pair; the
//!   sentinel timer is a `Timeout` SQE and cross-thread wakeups arrive
//!   through an eventfd kept under a one-shot poll.
//! - [`ReactorKind::Epoll`]: a general epoll loop with a timerfd sentinel
//!   and an eventfd notifier.
//!
//! [`ReactorPool`] pins one reactor per core and offers round-robin
//! selection plus the `await_on_all` fan-out family.

mod fiber;
mod notify;
mod poll_backend;
mod scheduler;
mod uring_backend;

pub mod pool;
pub mod reactor;
pub mod timer;

pub use fiber::JoinHandle;
pub use pool::{PoolConfig, ReactorPool};
pub use reactor::{Reactor, ReactorConfig, ReactorKind, Remote, WorkGuard};
pub use strand_core::task::yield_now;
pub use timer::{deadline, sleep, Deadline, Sleep};
