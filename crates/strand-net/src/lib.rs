//! # strand-net — fiber sockets and connection serving
//!
//! [`FiberSocket`] wraps a non-blocking TCP socket bound to one reactor;
//! its operations suspend the calling fiber until the reactor reports
//! readiness or completion. [`AcceptServer`] listens on any number of
//! ports, accepts on a dedicated reactor, and fans accepted connections
//! out round-robin across the pool, one handler fiber each.

pub mod accept_server;
pub mod frame;
pub mod socket;

pub use accept_server::{AcceptServer, Connection, ListenerInterface};
pub use frame::{FrameDecoder, MAX_FRAME};
pub use socket::{bind_listener, AcceptedSocket, FiberSocket};
