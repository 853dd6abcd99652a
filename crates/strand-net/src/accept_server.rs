//! The accept server.
//!
//! One accept fiber per listener runs on the pool's first reactor (the
//! accept reactor). Each accepted fd is handed round-robin to a target
//! reactor, where a fiber drives the user's [`Connection`] handler. The
//! connection table lives on the accept reactor and is mutated only
//! there; removals are posted back to it, and `stop(true)` waits until
//! the table drains.

use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use strand_core::sync::{BlockingCounter, Done};
use strand_core::varz::VarzCount;
use strand_core::Result;
use strand_runtime::{Reactor, ReactorPool, Remote};

use crate::socket::{bind_listener, AcceptedSocket, FiberSocket};

/// A user connection handler. Created by the listener's factory on the
/// accept reactor and moved to its target reactor, where
/// `handle_requests` runs as a fiber with the accepted socket.
#[async_trait(?Send)]
pub trait Connection: Send {
    async fn handle_requests(&mut self, socket: &mut FiberSocket, reactor: &Reactor) -> Result<()>;
}

/// Factory plus lifecycle hooks for one listening port.
pub trait ListenerInterface: Send + Sync {
    fn new_connection(&self) -> Box<dyn Connection>;

    /// Called when shutdown starts, before connections are closed.
    fn pre_shutdown(&self) {}

    /// Called after every connection has drained.
    fn post_shutdown(&self) {}
}

struct ConnMap {
    next_id: u64,
    conns: HashMap<u64, RawFd>,
}

/// Connection table owned by the accept reactor.
struct ConnTable {
    cell: UnsafeCell<ConnMap>,
}

// Safety: the map behind the cell is read and written only from the
// accept reactor's thread; other threads reach it exclusively by
// posting tasks there.
unsafe impl Send for ConnTable {}
unsafe impl Sync for ConnTable {}

impl ConnTable {
    fn new() -> Self {
        Self { cell: UnsafeCell::new(ConnMap { next_id: 0, conns: HashMap::new() }) }
    }

    fn with<R>(&self, f: impl FnOnce(&mut ConnMap) -> R) -> R {
        // Safety: see type-level comment.
        unsafe { f(&mut *self.cell.get()) }
    }
}

struct ServerShared {
    table: ConnTable,
    drained: Done,
    stopping: AtomicBool,
    accept_loops: BlockingCounter,
    accepted: VarzCount,
}

impl ServerShared {
    /// Accept reactor only.
    fn link(&self, fd: RawFd) -> u64 {
        let id = self.table.with(|m| {
            let id = m.next_id;
            m.next_id += 1;
            m.conns.insert(id, fd);
            id
        });
        // A connection linked after stop() raced the shutdown_conns
        // task; half-close it here so its handler still drains.
        if self.stopping.load(Ordering::SeqCst) {
            unsafe { libc::shutdown(fd, libc::SHUT_RDWR) };
        }
        id
    }

    /// Accept reactor only. The fd is closed here, after unlinking, so
    /// a connection is never destroyed while still listed.
    fn unlink(&self, id: u64, fd: RawFd) {
        let empty = self.table.with(|m| {
            m.conns.remove(&id);
            m.conns.is_empty()
        });
        unsafe { libc::close(fd) };
        if empty && self.stopping.load(Ordering::SeqCst) {
            self.drained.notify();
        }
    }

    /// Accept reactor only.
    fn shutdown_conns(&self) {
        let empty = self.table.with(|m| {
            for fd in m.conns.values() {
                unsafe { libc::shutdown(*fd, libc::SHUT_RDWR) };
            }
            m.conns.is_empty()
        });
        if empty {
            self.drained.notify();
        }
    }
}

struct Listener {
    fd: RawFd,
    port: u16,
    iface: Arc<dyn ListenerInterface>,
}

/// Accepts connections on registered ports and dispatches them across
/// the reactor pool.
pub struct AcceptServer {
    pool: Arc<ReactorPool>,
    shared: Arc<ServerShared>,
    listeners: Mutex<Vec<Listener>>,
    backlog: AtomicU32,
    was_run: AtomicBool,
    finished: AtomicBool,
}

impl AcceptServer {
    pub fn new(pool: Arc<ReactorPool>) -> Self {
        Self {
            pool,
            shared: Arc::new(ServerShared {
                table: ConnTable::new(),
                drained: Done::new(),
                stopping: AtomicBool::new(false),
                accept_loops: BlockingCounter::new(0),
                accepted: VarzCount::new("accepted-connections"),
            }),
            listeners: Mutex::new(Vec::new()),
            backlog: AtomicU32::new(128),
            was_run: AtomicBool::new(false),
            finished: AtomicBool::new(false),
        }
    }

    pub fn set_backlog(&self, backlog: u32) {
        self.backlog.store(backlog, Ordering::Relaxed);
    }

    /// Bind a listener before `run`. Returns the bound port (useful for
    /// port 0).
    pub fn add_listener(&self, port: u16, iface: Arc<dyn ListenerInterface>) -> Result<u16> {
        assert!(
            !self.was_run.load(Ordering::SeqCst),
            "add_listener after AcceptServer::run"
        );
        let (fd, bound) = bind_listener(port, self.backlog.load(Ordering::Relaxed))?;
        tracing::info!(port = bound, "listening");
        self.listeners.lock().expect("listeners poisoned").push(Listener { fd, port: bound, iface });
        Ok(bound)
    }

    /// Start one accept fiber per listener on the accept reactor.
    pub fn run(&self) {
        self.was_run.store(true, Ordering::SeqCst);
        let listeners = self.listeners.lock().expect("listeners poisoned");
        if listeners.is_empty() {
            return;
        }
        let accept_remote = self.accept_remote();
        for listener in listeners.iter() {
            self.shared.accept_loops.add(1);
            let shared = self.shared.clone();
            let pool = self.pool.clone();
            let iface = listener.iface.clone();
            let fd = listener.fd;
            let port = listener.port;
            let remote = accept_remote.clone();
            accept_remote.spawn(move |r| async move {
                accept_loop(r, shared, pool, iface, fd, port, remote).await;
            });
        }
    }

    /// Stop accepting and shut live connections down. With `wait`, block
    /// until every handler has exited and the table is empty.
    pub fn stop(&self, wait: bool) {
        if !self.was_run.load(Ordering::SeqCst) {
            return;
        }
        if !self.shared.stopping.swap(true, Ordering::SeqCst) {
            let listeners = self.listeners.lock().expect("listeners poisoned");
            for listener in listeners.iter() {
                listener.iface.pre_shutdown();
                // Breaks the pending accept: the listener becomes
                // readable and accept4 reports EINVAL.
                unsafe { libc::shutdown(listener.fd, libc::SHUT_RDWR) };
            }
            let shared = self.shared.clone();
            self.accept_remote().post(move |_| shared.shutdown_conns());
        }
        if wait {
            self.wait();
        }
    }

    /// Wait for shutdown to finish: accept fibers joined, connection
    /// table drained, listeners closed.
    pub fn wait(&self) {
        if !self.was_run.load(Ordering::SeqCst) {
            let listeners = self.listeners.lock().expect("listeners poisoned");
            assert!(listeners.is_empty(), "run() must be called after add_listener");
            return;
        }
        self.shared.accept_loops.wait();
        if self.shared.stopping.load(Ordering::SeqCst) {
            self.shared.drained.wait();
        }
        if !self.finished.swap(true, Ordering::SeqCst) {
            let listeners = self.listeners.lock().expect("listeners poisoned");
            for listener in listeners.iter() {
                listener.iface.post_shutdown();
                unsafe { libc::close(listener.fd) };
            }
            tracing::info!(
                accepted = self.shared.accepted.get(),
                "accept server drained"
            );
        }
    }

    fn accept_remote(&self) -> Remote {
        // All accept fibers and every table mutation live on reactor 0.
        self.pool.remote(0).clone()
    }
}

impl Drop for AcceptServer {
    fn drop(&mut self) {
        if self.was_run.load(Ordering::SeqCst) && !self.finished.load(Ordering::SeqCst) {
            self.stop(true);
        } else if !self.was_run.load(Ordering::SeqCst) {
            let listeners = self.listeners.lock().expect("listeners poisoned");
            for listener in listeners.iter() {
                unsafe { libc::close(listener.fd) };
            }
        }
    }
}

async fn accept_loop(
    reactor: Reactor,
    shared: Arc<ServerShared>,
    pool: Arc<ReactorPool>,
    iface: Arc<dyn ListenerInterface>,
    listener_fd: RawFd,
    port: u16,
    accept_remote: Remote,
) {
    // The server owns the listener fd and closes it in wait(); wrapping
    // in ManuallyDrop keeps it open even if this fiber is torn down.
    let listener = std::mem::ManuallyDrop::new(FiberSocket::from_raw(&reactor, listener_fd));
    loop {
        if shared.stopping.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept().await {
            Ok(accepted) => {
                shared.accepted.inc();
                let id = shared.link(accepted.fd());
                let conn = iface.new_connection();
                let target = pool.next().clone();
                let shared = shared.clone();
                let accept_remote = accept_remote.clone();
                target.spawn(move |r| {
                    run_single_connection(r, conn, accepted, id, shared, accept_remote)
                });
            }
            Err(e) => {
                if !shared.stopping.load(Ordering::SeqCst) {
                    tracing::error!(port, error = %e, "accept failed");
                }
                break;
            }
        }
    }
    shared.accept_loops.dec();
    tracing::debug!(port, "accept loop finished");
}

async fn run_single_connection(
    reactor: Reactor,
    mut conn: Box<dyn Connection>,
    accepted: AcceptedSocket,
    id: u64,
    shared: Arc<ServerShared>,
    accept_remote: Remote,
) {
    let mut socket = accepted.into_socket(&reactor);
    if let Err(e) = conn.handle_requests(&mut socket, &reactor).await {
        if !e.is_eof() {
            tracing::debug!(conn = id, error = %e, "connection handler ended");
        }
    }
    let _ = socket.shutdown();
    // Keep the fd alive until the unlink runs: a connection is removed
    // from the table before it is destroyed.
    let fd = socket.into_raw();
    accept_remote.post(move |_| shared.unlink(id, fd));
}
