//! General epoll backend for the reactor.
//!
//! Readiness-oriented: socket operations run the non-blocking syscall
//! and, on EAGAIN, register interest and suspend until epoll reports the
//! fd ready. The sentinel timer is a timerfd, cross-thread wakeups an
//! eventfd, both registered in the same epoll set.

use std::collections::HashMap;
use std::future::Future;
use std::os::unix::io::RawFd;
use std::pin::Pin;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use strand_core::{Error, Result};

use crate::reactor::Reactor;

const KEY_TIMER: u64 = u64::MAX;
const KEY_NOTIFY: u64 = u64::MAX - 1;

const MAX_EVENTS: usize = 64;

#[derive(Default)]
struct FdInterest {
    read: Option<Waker>,
    write: Option<Waker>,
    in_epoll: bool,
}

pub(crate) struct EpollBackend {
    epfd: RawFd,
    timer_fd: RawFd,
    notify_fd: RawFd,
    interests: HashMap<RawFd, FdInterest>,
    armed_deadline: Option<Instant>,
}

fn last_errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

impl EpollBackend {
    pub fn new(notify_fd: RawFd) -> Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(Error::Resource("epoll_create1 failed"));
        }
        let timer_fd = unsafe {
            libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_NONBLOCK | libc::TFD_CLOEXEC)
        };
        if timer_fd < 0 {
            unsafe { libc::close(epfd) };
            return Err(Error::Resource("timerfd_create failed"));
        }
        let backend = Self {
            epfd,
            timer_fd,
            notify_fd,
            interests: HashMap::new(),
            armed_deadline: None,
        };
        backend.ctl(libc::EPOLL_CTL_ADD, timer_fd, libc::EPOLLIN as u32, KEY_TIMER)?;
        backend.ctl(libc::EPOLL_CTL_ADD, notify_fd, libc::EPOLLIN as u32, KEY_NOTIFY)?;
        Ok(backend)
    }

    fn ctl(&self, op: i32, fd: RawFd, events: u32, key: u64) -> Result<()> {
        let mut ev = libc::epoll_event { events, u64: key };
        let ret = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if ret < 0 {
            return Err(Error::Io(last_errno()));
        }
        Ok(())
    }

    pub fn register_waiter(&mut self, fd: RawFd, write: bool, waker: Waker) -> Result<()> {
        let interest = self.interests.entry(fd).or_default();
        if write {
            interest.write = Some(waker);
        } else {
            interest.read = Some(waker);
        }
        self.sync_interest(fd)
    }

    pub fn clear_waiter(&mut self, fd: RawFd, write: bool) {
        if let Some(interest) = self.interests.get_mut(&fd) {
            if write {
                interest.write = None;
            } else {
                interest.read = None;
            }
            let _ = self.sync_interest(fd);
        }
    }

    /// Reconcile the epoll registration for `fd` with its live waiters.
    /// Level-triggered fds with no waiter are removed so an unread event
    /// cannot spin the loop.
    fn sync_interest(&mut self, fd: RawFd) -> Result<()> {
        let (events, in_epoll) = match self.interests.get(&fd) {
            None => return Ok(()),
            Some(interest) => {
                let mut events = 0u32;
                if interest.read.is_some() {
                    events |= libc::EPOLLIN as u32;
                }
                if interest.write.is_some() {
                    events |= libc::EPOLLOUT as u32;
                }
                (events, interest.in_epoll)
            }
        };
        if events == 0 {
            self.interests.remove(&fd);
            if in_epoll {
                let _ = self.ctl(libc::EPOLL_CTL_DEL, fd, 0, fd as u64);
            }
            return Ok(());
        }
        let op = if in_epoll { libc::EPOLL_CTL_MOD } else { libc::EPOLL_CTL_ADD };
        if let Some(interest) = self.interests.get_mut(&fd) {
            interest.in_epoll = true;
        }
        self.ctl(op, fd, events, fd as u64)
    }

    /// Non-blocking event drain.
    pub fn drain(&mut self) -> usize {
        self.wait(0)
    }

    /// Block for one batch of events, arming the sentinel timer first.
    pub fn suspend_until(&mut self, deadline: Option<Instant>) {
        match (deadline, self.armed_deadline) {
            // Same deadline: the timer is already armed; re-setting it
            // would just churn.
            (Some(d), Some(armed)) if d == armed => {}
            (Some(d), _) => {
                self.arm_timer(d);
            }
            (None, _) => {}
        }
        self.wait(-1);
    }

    fn arm_timer(&mut self, deadline: Instant) {
        let rel = deadline
            .saturating_duration_since(Instant::now())
            .max(Duration::from_nanos(1));
        let spec = libc::itimerspec {
            it_interval: libc::timespec { tv_sec: 0, tv_nsec: 0 },
            it_value: libc::timespec {
                tv_sec: rel.as_secs() as libc::time_t,
                tv_nsec: rel.subsec_nanos() as libc::c_long,
            },
        };
        let ret = unsafe { libc::timerfd_settime(self.timer_fd, 0, &spec, std::ptr::null_mut()) };
        if ret < 0 {
            tracing::error!(errno = last_errno(), "timerfd_settime failed");
        }
        self.armed_deadline = Some(deadline);
    }

    fn wait(&mut self, timeout_ms: i32) -> usize {
        let mut events: [libc::epoll_event; MAX_EVENTS] = unsafe { std::mem::zeroed() };
        let n = unsafe { libc::epoll_wait(self.epfd, events.as_mut_ptr(), MAX_EVENTS as i32, timeout_ms) };
        if n < 0 {
            let errno = last_errno();
            if errno != libc::EINTR {
                tracing::error!(errno, "epoll_wait failed");
            }
            return 0;
        }
        let mut woken = 0;
        let mut resync = Vec::new();
        for ev in events.iter().take(n as usize) {
            match ev.u64 {
                KEY_TIMER => {
                    let mut expirations = 0u64;
                    unsafe {
                        libc::read(self.timer_fd, &mut expirations as *mut u64 as *mut libc::c_void, 8);
                    }
                    self.armed_deadline = None;
                }
                KEY_NOTIFY => {
                    let mut val = 0u64;
                    loop {
                        let ret = unsafe {
                            libc::read(self.notify_fd, &mut val as *mut u64 as *mut libc::c_void, 8)
                        };
                        if ret <= 0 {
                            break;
                        }
                    }
                }
                key => {
                    let fd = key as RawFd;
                    if let Some(interest) = self.interests.get_mut(&fd) {
                        let bits = ev.events;
                        let err = bits & (libc::EPOLLERR as u32 | libc::EPOLLHUP as u32) != 0;
                        if err || bits & libc::EPOLLIN as u32 != 0 {
                            if let Some(w) = interest.read.take() {
                                w.wake();
                                woken += 1;
                            }
                        }
                        if err || bits & libc::EPOLLOUT as u32 != 0 {
                            if let Some(w) = interest.write.take() {
                                w.wake();
                                woken += 1;
                            }
                        }
                        resync.push(fd);
                    }
                }
            }
        }
        for fd in resync {
            let _ = self.sync_interest(fd);
        }
        woken
    }
}

impl Drop for EpollBackend {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.timer_fd);
            libc::close(self.epfd);
        }
    }
}

/// Suspend until `fd` is ready in the given direction.
pub(crate) struct Readiness {
    reactor: Reactor,
    fd: RawFd,
    write: bool,
    registered: bool,
}

impl Readiness {
    pub fn new(reactor: Reactor, fd: RawFd, write: bool) -> Self {
        Self { reactor, fd, write, registered: false }
    }
}

impl Future for Readiness {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        let this = self.get_mut();
        if this.registered {
            // Woken; the caller retries the syscall and re-registers on
            // another EAGAIN, so a spurious fiber wake is harmless.
            this.registered = false;
            return Poll::Ready(Ok(()));
        }
        let reactor = this.reactor.clone();
        reactor
            .epoll_backend_mut()
            .register_waiter(this.fd, this.write, cx.waker().clone())?;
        this.registered = true;
        Poll::Pending
    }
}

impl Drop for Readiness {
    fn drop(&mut self) {
        if self.registered {
            self.reactor.epoll_backend_mut().clear_waiter(self.fd, self.write);
        }
    }
}

pub(crate) async fn recv(reactor: &Reactor, fd: RawFd, buf: &mut [u8]) -> Result<usize> {
    loop {
        let res = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
        if res >= 0 {
            return Ok(res as usize);
        }
        match last_errno() {
            libc::EAGAIN => Readiness::new(reactor.clone(), fd, false).await?,
            libc::EINTR => {}
            e => return Err(Error::Io(e)),
        }
    }
}

pub(crate) async fn send(reactor: &Reactor, fd: RawFd, buf: &[u8]) -> Result<usize> {
    loop {
        let res = unsafe {
            libc::send(fd, buf.as_ptr() as *const libc::c_void, buf.len(), libc::MSG_NOSIGNAL)
        };
        if res >= 0 {
            return Ok(res as usize);
        }
        match last_errno() {
            libc::EAGAIN => Readiness::new(reactor.clone(), fd, true).await?,
            libc::EINTR => {}
            e => return Err(Error::Io(e)),
        }
    }
}

pub(crate) async fn wait_fd(reactor: &Reactor, fd: RawFd, events: u32) -> Result<()> {
    let write = events & libc::POLLOUT as u32 != 0;
    Readiness::new(reactor.clone(), fd, write).await
}
