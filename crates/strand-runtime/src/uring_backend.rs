//! io_uring completion backend for the reactor.
//!
//! Socket operations are completion-based: the op submits an SQE whose
//! buffer and waker live in a shared cell pinned by the manager's
//! callback, suspends the fiber, and resumes it when the CQE arrives.
//! Dropping an op future before completion never dangles a kernel
//! reference: the shared cell stays alive inside the pinned callback
//! and a best-effort async cancel is issued.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::os::unix::io::RawFd;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use io_uring::{opcode, squeue, types};
use strand_core::{Error, Result};
use strand_uring::{UringManager, UringManagerConfig};

use crate::reactor::Reactor;

pub(crate) struct UringBackend {
    pub(crate) mgr: UringManager,
    armed_deadline: Option<Instant>,
    pub(crate) sqe_waiters: VecDeque<Waker>,
    link_polls: bool,
}

impl UringBackend {
    pub fn new(ring_depth: u32, wake_fd: RawFd) -> Result<Self> {
        let mgr = UringManager::new(UringManagerConfig { ring_depth, wake_fd: Some(wake_fd) })?;
        // Without FAST_POLL the kernel would hand back EAGAIN on
        // non-blocking sockets, so chain a poll-add in front of each
        // recv/send.
        let link_polls = !mgr.has_fast_poll();
        Ok(Self { mgr, armed_deadline: None, sqe_waiters: VecDeque::new(), link_polls })
    }

    /// Non-blocking flush + completion drain.
    pub fn drain(&mut self) -> usize {
        if let Err(e) = self.mgr.flush() {
            tracing::error!(error = %e, "uring flush failed");
        }
        let n = self.mgr.dispatch_completions();
        if n > 0 {
            self.wake_sqe_waiters();
        }
        n
    }

    /// Block for at least one completion, arming the sentinel timer for
    /// `deadline` first.
    pub fn suspend_until(&mut self, deadline: Option<Instant>) {
        match (deadline, self.armed_deadline) {
            // Re-arming to the same deadline must be a no-op, otherwise
            // the dispatcher and the timer ping-pong forever.
            (Some(d), Some(armed)) if d == armed => {}
            (Some(d), armed) => {
                if armed.is_some() {
                    let _ = self.mgr.remove_sentinel_timer();
                }
                let rel = d
                    .saturating_duration_since(Instant::now())
                    .max(Duration::from_nanos(1));
                if let Err(e) = self.mgr.arm_sentinel_timer(rel) {
                    tracing::error!(error = %e, "failed to arm sentinel timer");
                }
                self.armed_deadline = Some(d);
            }
            // Infinity: leave whatever is armed alone.
            (None, _) => {}
        }
        match self.mgr.submit_and_wait_dispatch(1) {
            Ok(n) if n > 0 => self.wake_sqe_waiters(),
            Ok(_) => {}
            Err(e) => tracing::error!(error = %e, "uring wait failed"),
        }
        if self.mgr.take_timer_fired() {
            self.armed_deadline = None;
        }
        self.mgr.take_woken();
    }

    fn wake_sqe_waiters(&mut self) {
        for w in self.sqe_waiters.drain(..) {
            w.wake();
        }
    }
}

struct OpShared {
    result: Option<i32>,
    waker: Option<Waker>,
    /// Owned I/O buffer; its heap allocation is what the SQE points at,
    /// so it must not be released before the CQE.
    buf: Option<Box<[u8]>>,
}

#[derive(Clone, Copy)]
enum OpKind {
    Recv { fd: RawFd },
    Send { fd: RawFd },
    Poll { fd: RawFd, events: u32 },
}

/// One in-flight submission, owned by the fiber awaiting it.
pub(crate) struct UringOp {
    reactor: Reactor,
    kind: OpKind,
    shared: Rc<RefCell<OpShared>>,
    token: Option<u64>,
    done: bool,
}

impl UringOp {
    pub fn recv(reactor: Reactor, fd: RawFd, len: usize) -> Self {
        Self::with_buf(reactor, OpKind::Recv { fd }, Some(vec![0u8; len].into_boxed_slice()))
    }

    pub fn send(reactor: Reactor, fd: RawFd, data: &[u8]) -> Self {
        Self::with_buf(reactor, OpKind::Send { fd }, Some(data.to_vec().into_boxed_slice()))
    }

    pub fn poll_fd(reactor: Reactor, fd: RawFd, events: u32) -> Self {
        Self::with_buf(reactor, OpKind::Poll { fd, events }, None)
    }

    fn with_buf(reactor: Reactor, kind: OpKind, buf: Option<Box<[u8]>>) -> Self {
        Self {
            reactor,
            kind,
            shared: Rc::new(RefCell::new(OpShared { result: None, waker: None, buf })),
            token: None,
            done: false,
        }
    }

    fn shared_buf(&self) -> Rc<RefCell<OpShared>> {
        self.shared.clone()
    }

    fn build_entry(&self) -> squeue::Entry {
        let shared = self.shared.borrow();
        match self.kind {
            OpKind::Recv { fd } => {
                let buf = shared.buf.as_ref().expect("recv op without buffer");
                opcode::Recv::new(types::Fd(fd), buf.as_ptr() as *mut u8, buf.len() as u32).build()
            }
            OpKind::Send { fd } => {
                let buf = shared.buf.as_ref().expect("send op without buffer");
                opcode::Send::new(types::Fd(fd), buf.as_ptr(), buf.len() as u32)
                    .flags(libc::MSG_NOSIGNAL)
                    .build()
            }
            OpKind::Poll { fd, events } => opcode::PollAdd::new(types::Fd(fd), events).build(),
        }
    }

    /// Poll-add entry chained in front of recv/send when the kernel has
    /// no fast-poll.
    fn link_entry(&self) -> Option<squeue::Entry> {
        match self.kind {
            OpKind::Recv { fd } => {
                Some(opcode::PollAdd::new(types::Fd(fd), libc::POLLIN as u32).build())
            }
            OpKind::Send { fd } => {
                Some(opcode::PollAdd::new(types::Fd(fd), libc::POLLOUT as u32).build())
            }
            OpKind::Poll { .. } => None,
        }
    }
}

impl Future for UringOp {
    type Output = Result<i32>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<i32>> {
        let this = self.get_mut();
        assert!(!this.done, "UringOp polled after completion");
        {
            let sh = this.shared.borrow();
            if let Some(res) = sh.result {
                drop(sh);
                this.done = true;
                return Poll::Ready(Ok(res));
            }
        }
        if this.token.is_none() {
            let reactor = this.reactor.clone();
            let mut backend = reactor.uring_backend_mut();
            if !backend.mgr.has_room() {
                // SQE exhaustion: wait for completions to free capacity.
                backend.sqe_waiters.push_back(cx.waker().clone());
                return Poll::Pending;
            }
            let entry = this.build_entry();
            let shared = this.shared.clone();
            let cb = move |res: i32, _flags: u32, _mgr: &mut UringManager| {
                let mut sh = shared.borrow_mut();
                sh.result = Some(res);
                if let Some(w) = sh.waker.take() {
                    w.wake();
                }
            };
            let submit = if backend.link_polls {
                match this.link_entry() {
                    Some(link) => backend.mgr.submit_linked(link, entry, cb),
                    None => backend.mgr.submit_op(entry, cb),
                }
            } else {
                backend.mgr.submit_op(entry, cb)
            };
            match submit {
                Ok(token) => this.token = Some(token),
                Err(e) => {
                    this.done = true;
                    return Poll::Ready(Err(e));
                }
            }
        }
        this.shared.borrow_mut().waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl Drop for UringOp {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if let Some(token) = self.token {
            if self.shared.borrow().result.is_none() {
                // Cancelled mid-flight (deadline, fiber teardown). The
                // pinned callback keeps the buffer alive until the
                // -ECANCELED completion lands.
                self.reactor.uring_backend_mut().mgr.cancel_token(token);
            }
        }
    }
}

pub(crate) async fn recv(reactor: &Reactor, fd: RawFd, buf: &mut [u8]) -> Result<usize> {
    loop {
        let op = UringOp::recv(reactor.clone(), fd, buf.len());
        let shared = op.shared_buf();
        let res = op.await?;
        if res >= 0 {
            let n = (res as usize).min(buf.len());
            if n > 0 {
                let sh = shared.borrow();
                let data = sh.buf.as_ref().expect("recv buffer vanished");
                buf[..n].copy_from_slice(&data[..n]);
            }
            return Ok(n);
        }
        match -res {
            e if e == libc::EAGAIN || e == libc::EBUSY => {
                wait_fd(reactor, fd, libc::POLLIN as u32).await?;
            }
            e if e == libc::EINTR => {}
            e => return Err(Error::Io(e)),
        }
    }
}

pub(crate) async fn send(reactor: &Reactor, fd: RawFd, buf: &[u8]) -> Result<usize> {
    loop {
        let res = UringOp::send(reactor.clone(), fd, buf).await?;
        if res >= 0 {
            return Ok(res as usize);
        }
        match -res {
            e if e == libc::EAGAIN || e == libc::EBUSY => {
                wait_fd(reactor, fd, libc::POLLOUT as u32).await?;
            }
            e if e == libc::EINTR => {}
            e => return Err(Error::Io(e)),
        }
    }
}

pub(crate) async fn wait_fd(reactor: &Reactor, fd: RawFd, events: u32) -> Result<()> {
    let res = UringOp::poll_fd(reactor.clone(), fd, events).await?;
    if res < 0 {
        return Err(Error::Io(-res));
    }
    Ok(())
}
