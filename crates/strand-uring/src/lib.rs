//! # strand-uring — the io_uring manager
//!
//! A thin layer over one submission/completion ring pair:
//!
//! 1. Callers queue SQEs tagged with a completion-entry index; the entry
//!    pins the callback (and whatever state it captures) until the
//!    terminal CQE arrives.
//! 2. [`UringManager::run_until`] drives the standalone drain loop:
//!    submit pending SQEs, wait for one CQE, batch-peek up to 32, invoke
//!    callbacks, repeat. EINTR exits cleanly.
//! 3. Persistent per-fd events ([`FdEvent`]) keep a callback alive across
//!    any number of one-shot poll submissions.
//!
//! The fiber reactor embeds the same manager and calls the non-blocking
//! and wait-one entry points from its own drive loop.

pub mod fdevent;
pub mod manager;

pub use fdevent::FdEvent;
pub use manager::{UringManager, UringManagerConfig, WakeHandle, DEFAULT_RING_DEPTH};
