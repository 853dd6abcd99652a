//! Ping server and load client.
//!
//! Server mode drives connections straight off the io_uring manager with
//! the WAIT_READ → READ → WRITE state machine; requests are
//! length-prefixed frames (≤ 1024 bytes) echoed back one response per
//! request. Client mode runs fibers over a reactor pool.
//!
//! Usage:
//!     pingsrv [port=6380] [http_port=8080] [linked_sqe=1]
//!     pingsrv connect=127.0.0.1:6380 [count=100000] [num_connections=16] \
//!             [threads=2] [backend=uring|epoll]

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context as _};
use io_uring::{opcode, types};
use strand::{
    frame, varz, BlockingCounter, FdEvent, FiberSocket, FrameDecoder, PoolConfig, ReactorConfig,
    ReactorKind, ReactorPool, UringManager, UringManagerConfig, VarzQps,
};

const RECV_BUF: usize = 4096;

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn handle_signal(_sig: libc::c_int) {
    RUNNING.store(false, Ordering::Relaxed);
}

// ── Flag parsing (flag=value pairs) ──────────────────────────────────

struct Flags {
    args: Vec<String>,
}

impl Flags {
    fn parse() -> Self {
        Self { args: std::env::args().skip(1).collect() }
    }

    fn get(&self, name: &str) -> Option<&str> {
        let prefix = format!("{}=", name);
        self.args.iter().rev().find_map(|a| a.strip_prefix(&prefix))
    }

    fn get_i64(&self, name: &str, default: i64) -> i64 {
        self.get(name).and_then(|v| v.parse().ok()).unwrap_or(default)
    }

    fn get_bool(&self, name: &str, default: bool) -> bool {
        match self.get(name) {
            Some(v) => matches!(v, "1" | "true" | "yes"),
            None => default,
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_target(false).init();
    unsafe {
        libc::signal(libc::SIGINT, handle_signal as usize);
        libc::signal(libc::SIGTERM, handle_signal as usize);
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }

    let flags = Flags::parse();
    let http_port = flags.get_i64("http_port", 8080);
    if http_port >= 0 {
        start_status_reporter();
    }

    match flags.get("connect") {
        Some(endpoint) => {
            let endpoint: SocketAddr =
                endpoint.parse().context("connect= expects host:port")?;
            run_client(&flags, endpoint)
        }
        None => run_server(&flags),
    }
}

/// Periodic varz dump; stands in for the status port, which has no HTTP
/// layer in this build.
fn start_status_reporter() {
    std::thread::Builder::new()
        .name("status".into())
        .spawn(|| loop {
            std::thread::sleep(std::time::Duration::from_secs(5));
            for (name, value) in varz::snapshot() {
                tracing::info!(varz = %name, value);
            }
        })
        .expect("failed to spawn status thread");
}

// ── Server ───────────────────────────────────────────────────────────

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum ConnState {
    WaitRead,
    Read,
    Write,
}

struct PingConn {
    fd: i32,
    state: ConnState,
    decoder: FrameDecoder,
    buf: Box<[u8; RECV_BUF]>,
    /// Response bytes for the in-flight send.
    out: Vec<u8>,
    sent: usize,
    event: Option<FdEvent>,
    linked: bool,
}

struct ServerStats {
    accepts: u64,
    closes: u64,
    bytes_in: u64,
    bytes_out: u64,
    errors: u64,
}

fn run_server(flags: &Flags) -> anyhow::Result<()> {
    let port = flags.get_i64("port", 6380);
    if port <= 0 || port > u16::MAX as i64 {
        bail!("port must be in (0, 65535]");
    }
    let linked = flags.get_bool("linked_sqe", false);

    let (listener_fd, bound) = bind_server_socket(port as u16)?;
    let mut mgr = UringManager::new(UringManagerConfig::default())
        .map_err(|e| anyhow::anyhow!("io_uring init failed: {}", e))?;
    tracing::info!(port = bound, linked, fast_poll = mgr.has_fast_poll(), "pingsrv listening");

    let ping_qps = VarzQps::new("ping-qps");
    let stats = Rc::new(RefCell::new(ServerStats {
        accepts: 0,
        closes: 0,
        bytes_in: 0,
        bytes_out: 0,
        errors: 0,
    }));

    // Accept handler: drain the backlog, then re-arm the listener poll.
    let accept_stats = stats.clone();
    let accept_qps = ping_qps.clone();
    let listener_ev_slot: Rc<RefCell<Option<FdEvent>>> = Rc::new(RefCell::new(None));
    let listener_ev_inner = listener_ev_slot.clone();
    let listener_ev = mgr.assign(listener_fd, move |res, mgr| {
        if res < 0 {
            tracing::error!(errno = -res, "listener poll failed");
            return;
        }
        loop {
            let fd = unsafe {
                libc::accept4(
                    listener_fd,
                    std::ptr::null_mut(),
                    std::ptr::null_mut(),
                    libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                )
            };
            if fd < 0 {
                break;
            }
            accept_stats.borrow_mut().accepts += 1;
            start_connection(mgr, fd, linked, accept_stats.clone(), accept_qps.clone());
        }
        if let Some(ev) = listener_ev_inner.borrow().as_ref() {
            let _ = mgr.add_poll_in(ev);
        }
    });
    *listener_ev_slot.borrow_mut() = Some(listener_ev.clone());
    mgr.add_poll_in(&listener_ev)
        .map_err(|e| anyhow::anyhow!("listener poll submit failed: {}", e))?;

    let started = Instant::now();
    mgr.run_until(&RUNNING)
        .map_err(|e| anyhow::anyhow!("uring loop failed: {}", e))?;

    let st = stats.borrow();
    tracing::info!(
        elapsed_s = started.elapsed().as_secs(),
        accepts = st.accepts,
        closes = st.closes,
        bytes_in = st.bytes_in,
        bytes_out = st.bytes_out,
        errors = st.errors,
        lifetime_pings = ping_qps.lifetime_total(),
        "pingsrv shutting down"
    );
    unsafe { libc::close(listener_fd) };
    Ok(())
}

fn bind_server_socket(port: u16) -> anyhow::Result<(i32, u16)> {
    strand::bind_listener(port, 4096).map_err(|e| anyhow::anyhow!("bind failed: {}", e))
}

fn start_connection(
    mgr: &mut UringManager,
    fd: i32,
    linked: bool,
    stats: Rc<RefCell<ServerStats>>,
    qps: VarzQps,
) {
    let conn = Rc::new(RefCell::new(PingConn {
        fd,
        state: ConnState::WaitRead,
        decoder: FrameDecoder::new(),
        buf: Box::new([0u8; RECV_BUF]),
        out: Vec::new(),
        sent: 0,
        event: None,
        linked,
    }));
    // The closure's strong reference keeps the connection alive across
    // every in-flight submission; it is released in close_connection.
    let handler_conn = conn.clone();
    let ev = mgr.assign(fd, move |res, mgr| {
        on_connection_event(&handler_conn, res, mgr, &stats, &qps);
    });
    conn.borrow_mut().event = Some(ev.clone());
    arm_read(mgr, &conn, &ev);
}

/// Queue the next read: chained poll+recv in linked mode, plain poll in
/// WAIT_READ otherwise.
fn arm_read(mgr: &mut UringManager, conn: &Rc<RefCell<PingConn>>, ev: &FdEvent) {
    let mut c = conn.borrow_mut();
    let fd = c.fd;
    let recv_entry = opcode::Recv::new(
        types::Fd(fd),
        c.buf.as_mut_ptr(),
        RECV_BUF as u32,
    )
    .build();
    if c.linked {
        let poll = opcode::PollAdd::new(types::Fd(fd), libc::POLLIN as u32).build();
        c.state = ConnState::Read;
        drop(c);
        let _ = mgr.submit_linked_with_event(poll, recv_entry, ev);
    } else {
        c.state = ConnState::WaitRead;
        drop(c);
        let _ = mgr.add_poll_in(ev);
    }
}

fn on_connection_event(
    conn: &Rc<RefCell<PingConn>>,
    res: i32,
    mgr: &mut UringManager,
    stats: &Rc<RefCell<ServerStats>>,
    qps: &VarzQps,
) {
    let state = conn.borrow().state;
    match state {
        ConnState::WaitRead => {
            // Poll completed; start the actual read.
            if res < 0 {
                close_connection(conn, mgr, stats);
                return;
            }
            let mut c = conn.borrow_mut();
            let fd = c.fd;
            let entry =
                opcode::Recv::new(types::Fd(fd), c.buf.as_mut_ptr(), RECV_BUF as u32).build();
            c.state = ConnState::Read;
            let ev = c.event.clone().expect("connection without event");
            drop(c);
            let _ = mgr.submit_with_event(entry, &ev);
        }
        ConnState::Read => {
            if res <= 0 {
                close_connection(conn, mgr, stats);
                return;
            }
            let n = res as usize;
            stats.borrow_mut().bytes_in += n as u64;
            let mut c = conn.borrow_mut();
            let chunk = c.buf[..n].to_vec();
            c.decoder.feed(&chunk);
            // Answer every complete frame coalesced in this read, not
            // just the first; a partial trailing frame stays buffered.
            c.out.clear();
            c.sent = 0;
            loop {
                match c.decoder.next_frame() {
                    Ok(Some(payload)) => {
                        qps.inc();
                        c.out.extend_from_slice(&frame::encode(&payload));
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!(error = %e, "bad frame");
                        drop(c);
                        close_connection(conn, mgr, stats);
                        return;
                    }
                }
            }
            let ev = c.event.clone().expect("connection without event");
            if c.out.is_empty() {
                // Short read inside a frame: keep reading.
                let fd = c.fd;
                let entry = opcode::Recv::new(types::Fd(fd), c.buf.as_mut_ptr(), RECV_BUF as u32)
                    .build();
                drop(c);
                let _ = mgr.submit_with_event(entry, &ev);
            } else {
                c.state = ConnState::Write;
                let fd = c.fd;
                let entry = opcode::Send::new(types::Fd(fd), c.out.as_ptr(), c.out.len() as u32)
                    .flags(libc::MSG_NOSIGNAL)
                    .build();
                drop(c);
                let _ = mgr.submit_with_event(entry, &ev);
            }
        }
        ConnState::Write => {
            if res <= 0 {
                stats.borrow_mut().errors += 1;
                close_connection(conn, mgr, stats);
                return;
            }
            let n = res as usize;
            stats.borrow_mut().bytes_out += n as u64;
            let mut c = conn.borrow_mut();
            c.sent += n;
            if c.sent < c.out.len() {
                // Short write: push the remainder.
                let fd = c.fd;
                let ptr = unsafe { c.out.as_ptr().add(c.sent) };
                let len = (c.out.len() - c.sent) as u32;
                let entry = opcode::Send::new(types::Fd(fd), ptr, len)
                    .flags(libc::MSG_NOSIGNAL)
                    .build();
                let ev = c.event.clone().expect("connection without event");
                drop(c);
                let _ = mgr.submit_with_event(entry, &ev);
                return;
            }
            let ev = c.event.clone().expect("connection without event");
            drop(c);
            arm_read(mgr, conn, &ev);
        }
    }
}

fn close_connection(
    conn: &Rc<RefCell<PingConn>>,
    mgr: &mut UringManager,
    stats: &Rc<RefCell<ServerStats>>,
) {
    let mut c = conn.borrow_mut();
    stats.borrow_mut().closes += 1;
    unsafe {
        libc::shutdown(c.fd, libc::SHUT_RDWR);
        libc::close(c.fd);
    }
    if let Some(ev) = c.event.take() {
        // Releasing the event drops the handler's strong reference; the
        // connection is destroyed once the last in-flight completion is
        // consumed against the vacant slot.
        mgr.release(&ev);
    }
}

// ── Client ───────────────────────────────────────────────────────────

fn run_client(flags: &Flags, endpoint: SocketAddr) -> anyhow::Result<()> {
    let count = flags.get_i64("count", 100_000).max(1) as u64;
    let num_connections = flags.get_i64("num_connections", 16).max(1) as usize;
    let threads = flags.get_i64("threads", 2).max(1) as usize;
    let kind = match flags.get("backend") {
        Some("epoll") => ReactorKind::Epoll,
        _ => ReactorKind::Uring,
    };

    let pool = ReactorPool::run(PoolConfig {
        size: threads,
        reactor: ReactorConfig { kind, ..Default::default() },
        pin_threads: true,
    })
    .map_err(|e| anyhow::anyhow!("pool start failed: {}", e))?;

    let done = BlockingCounter::new(num_connections as u64);
    let sent = Arc::new(AtomicU64::new(0));
    let started = Instant::now();

    for i in 0..num_connections {
        let done = done.clone();
        let sent = sent.clone();
        let per_conn = count / num_connections as u64 + u64::from(i == 0) * (count % num_connections as u64);
        pool.next().spawn(move |r| async move {
            match FiberSocket::connect(&r, endpoint).await {
                Ok(sock) => {
                    let payload: &[u8] = b"PING";
                    for _ in 0..per_conn {
                        if frame::write_frame(&sock, payload).await.is_err() {
                            break;
                        }
                        match frame::read_frame(&sock).await {
                            Ok(reply) if reply == payload => {
                                sent.fetch_add(1, Ordering::Relaxed);
                            }
                            Ok(_) => {
                                tracing::error!("payload mismatch");
                                break;
                            }
                            Err(e) => {
                                tracing::error!(error = %e, "read failed");
                                break;
                            }
                        }
                    }
                }
                Err(e) => tracing::error!(conn = i, error = %e, "connect failed"),
            }
            done.dec();
        });
    }

    done.wait();
    let elapsed = started.elapsed();
    let total = sent.load(Ordering::Relaxed);
    tracing::info!(
        total,
        elapsed_ms = elapsed.as_millis() as u64,
        qps = (total as f64 / elapsed.as_secs_f64()) as u64,
        "client finished"
    );
    pool.stop();
    Ok(())
}
