//! Ring ownership, completion-entry slab and the drain loop.

use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use io_uring::{opcode, squeue, types, IoUring};
use strand_core::{Error, Result};

use crate::fdevent::FdEvent;

/// Default ring depth: 4096 operations in flight before submitters wait.
pub const DEFAULT_RING_DEPTH: u32 = 4096;

/// How many CQEs one dispatch round peeks at a time.
const CQE_BATCH: usize = 32;

// Reserved user-data tokens. Completion-entry indices start above these.
/// A linked predecessor SQE; its success is implied by the next CQE.
pub(crate) const TOKEN_NULL: u64 = 0;
/// The eventfd wake sentinel.
pub(crate) const TOKEN_WAKE: u64 = 1;
/// The sentinel timer.
pub(crate) const TOKEN_TIMER: u64 = 2;
/// Internal bookkeeping submissions (timeout removals, cancels).
pub(crate) const TOKEN_CANCEL: u64 = 3;
const TOKEN_BASE: u64 = 16;

pub struct UringManagerConfig {
    /// SQ depth; must be a power of two.
    pub ring_depth: u32,
    /// Use an externally owned eventfd for wakes instead of creating one.
    pub wake_fd: Option<RawFd>,
}

impl Default for UringManagerConfig {
    fn default() -> Self {
        Self { ring_depth: DEFAULT_RING_DEPTH, wake_fd: None }
    }
}

impl UringManagerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.ring_depth == 0 || !self.ring_depth.is_power_of_two() {
            return Err(Error::Resource("ring depth must be a power of two"));
        }
        Ok(())
    }
}

/// Completion callback: result, CQE flags, and the manager for follow-up
/// submissions.
pub type CompleteCb = Box<dyn FnOnce(i32, u32, &mut UringManager)>;

enum EntryCb {
    Oneshot(CompleteCb),
    Event(FdEvent),
}

/// One slot of the completion slab. `next_free` links vacant slots, as in
/// a classic freelist arena.
struct CompletionEntry {
    cb: Option<EntryCb>,
    next_free: i32,
}

/// Cross-thread wake handle backed by the manager's eventfd. Multiple
/// notifies before the loop drains the fd coalesce into one wakeup.
#[derive(Clone)]
pub struct WakeHandle {
    fd: RawFd,
}

// Safety: writes to an eventfd are atomic and thread-safe; the fd stays
// open for as long as the manager (or its external owner) lives.
unsafe impl Send for WakeHandle {}
unsafe impl Sync for WakeHandle {}

impl WakeHandle {
    pub fn notify(&self) {
        let val: u64 = 1;
        let ret = unsafe {
            libc::write(self.fd, &val as *const u64 as *const libc::c_void, std::mem::size_of::<u64>())
        };
        // EAGAIN means the counter is saturated: a wake is already
        // pending, which is all we need.
        if ret < 0 {
            let errno = unsafe { *libc::__errno_location() };
            if errno != libc::EAGAIN {
                tracing::warn!(errno, "eventfd wake failed");
            }
        }
    }
}

/// Owns one io_uring instance plus the slab of pinned completion
/// callbacks.
pub struct UringManager {
    ring: IoUring,
    centries: Vec<CompletionEntry>,
    next_free: i32,
    inflight: usize,
    pending_submit: u32,
    wake_fd: RawFd,
    owns_wake_fd: bool,
    /// Scratch timespec for the sentinel timer. Boxed so the pointer
    /// handed to the kernel stays stable.
    sentinel_ts: Box<types::Timespec>,
    timer_fired: bool,
    woken: bool,
    interrupted: bool,
    completions_seen: u64,
}

impl UringManager {
    pub fn new(config: UringManagerConfig) -> Result<Self> {
        config.validate()?;
        let ring = IoUring::builder()
            .build(config.ring_depth)
            .map_err(|e| {
                tracing::error!(error = %e, "io_uring setup failed");
                Error::Resource("io_uring setup failed")
            })?;

        let (wake_fd, owns_wake_fd) = match config.wake_fd {
            Some(fd) => (fd, false),
            None => {
                let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
                if fd < 0 {
                    return Err(Error::Resource("eventfd creation failed"));
                }
                (fd, true)
            }
        };

        let mut mgr = Self {
            ring,
            centries: Vec::new(),
            next_free: -1,
            inflight: 0,
            pending_submit: 0,
            wake_fd,
            owns_wake_fd,
            sentinel_ts: Box::new(types::Timespec::new()),
            timer_fired: false,
            woken: false,
            interrupted: false,
            completions_seen: 0,
        };
        mgr.arm_wake_poll()?;
        Ok(mgr)
    }

    pub fn wake_handle(&self) -> WakeHandle {
        WakeHandle { fd: self.wake_fd }
    }

    /// True if the kernel polls sockets internally before recv/send, so
    /// explicit poll-add links are unnecessary.
    pub fn has_fast_poll(&self) -> bool {
        self.ring.params().is_feature_fast_poll()
    }

    pub fn capacity(&self) -> usize {
        self.ring.params().sq_entries() as usize
    }

    pub fn inflight(&self) -> usize {
        self.inflight
    }

    /// True while another operation can be submitted without exceeding
    /// the ring depth. Callers that see `false` must wait for
    /// completions, not drop requests.
    pub fn has_room(&self) -> bool {
        self.inflight + self.pending_submit as usize + 2 <= self.capacity()
    }

    pub fn completions_seen(&self) -> u64 {
        self.completions_seen
    }

    pub fn interrupted(&self) -> bool {
        self.interrupted
    }

    pub fn take_timer_fired(&mut self) -> bool {
        std::mem::take(&mut self.timer_fired)
    }

    pub fn take_woken(&mut self) -> bool {
        std::mem::take(&mut self.woken)
    }

    // ── Completion slab ──────────────────────────────────────────────

    fn alloc_entry(&mut self, cb: EntryCb) -> usize {
        if self.next_free < 0 {
            self.regrow_centries();
        }
        let idx = self.next_free as usize;
        self.next_free = self.centries[idx].next_free;
        self.centries[idx].cb = Some(cb);
        self.centries[idx].next_free = -1;
        idx
    }

    fn release_entry(&mut self, idx: usize) {
        self.centries[idx].cb = None;
        self.centries[idx].next_free = self.next_free;
        self.next_free = idx as i32;
    }

    fn regrow_centries(&mut self) {
        let old = self.centries.len();
        let new = (old * 2).max(64);
        for i in old..new {
            self.centries.push(CompletionEntry {
                cb: None,
                next_free: if i + 1 < new { (i + 1) as i32 } else { -1 },
            });
        }
        self.next_free = old as i32;
    }

    // ── Submission ───────────────────────────────────────────────────

    fn push_sqe(&mut self, entry: squeue::Entry) -> Result<()> {
        // Safety: every entry built in this crate carries pointers that
        // its completion slab entry keeps alive until the CQE arrives.
        unsafe {
            if self.ring.submission().push(&entry).is_err() {
                self.flush()?;
                if self.ring.submission().push(&entry).is_err() {
                    return Err(Error::Resource("submission queue full"));
                }
            }
        }
        self.pending_submit += 1;
        Ok(())
    }

    /// Queue one SQE; `cb` runs when its completion arrives and the slab
    /// entry pinning it is released. Returns the user-data token, usable
    /// with [`UringManager::cancel_token`].
    pub fn submit_op(
        &mut self,
        entry: squeue::Entry,
        cb: impl FnOnce(i32, u32, &mut UringManager) + 'static,
    ) -> Result<u64> {
        let idx = self.alloc_entry(EntryCb::Oneshot(Box::new(cb)));
        let token = TOKEN_BASE + idx as u64;
        let entry = entry.user_data(token);
        match self.push_sqe(entry) {
            Ok(()) => Ok(token),
            Err(e) => {
                self.release_entry(idx);
                Err(e)
            }
        }
    }

    /// Queue two SQEs chained with `IOSQE_IO_LINK`. Only the trailing
    /// entry's user data is honoured; the first completes with a null
    /// token whose success is implied by the second CQE.
    pub fn submit_linked(
        &mut self,
        first: squeue::Entry,
        second: squeue::Entry,
        cb: impl FnOnce(i32, u32, &mut UringManager) + 'static,
    ) -> Result<u64> {
        let idx = self.alloc_entry(EntryCb::Oneshot(Box::new(cb)));
        let token = TOKEN_BASE + idx as u64;
        let first = first.flags(squeue::Flags::IO_LINK).user_data(TOKEN_NULL);
        let second = second.user_data(token);
        if let Err(e) = self.push_sqe(first) {
            self.release_entry(idx);
            return Err(e);
        }
        if let Err(e) = self.push_sqe(second) {
            // The poll half is already queued; its completion carries the
            // null token and is skipped.
            self.release_entry(idx);
            return Err(e);
        }
        Ok(token)
    }

    /// Pin `handler` for `fd`; the returned event can be polled any
    /// number of times and stays alive until [`UringManager::release`].
    pub fn assign(
        &mut self,
        fd: RawFd,
        handler: impl FnMut(i32, &mut UringManager) + 'static,
    ) -> FdEvent {
        let ev = FdEvent::new(fd, handler);
        let idx = self.alloc_entry(EntryCb::Event(ev.clone()));
        ev.set_slot(idx as i32);
        ev
    }

    /// Submit a one-shot POLLIN request tagged with `ev`.
    pub fn add_poll_in(&mut self, ev: &FdEvent) -> Result<()> {
        let entry = opcode::PollAdd::new(types::Fd(ev.fd()), libc::POLLIN as u32).build();
        self.submit_with_event(entry, ev)
    }

    /// Submit an arbitrary SQE whose completion dispatches to `ev`.
    pub fn submit_with_event(&mut self, entry: squeue::Entry, ev: &FdEvent) -> Result<()> {
        let slot = ev.slot();
        debug_assert!(slot >= 0, "event already released");
        self.push_sqe(entry.user_data(TOKEN_BASE + slot as u64))
    }

    /// Chain two SQEs with `IOSQE_IO_LINK`, dispatching the trailing
    /// completion to `ev`. The leading CQE carries the null token.
    pub fn submit_linked_with_event(
        &mut self,
        first: squeue::Entry,
        second: squeue::Entry,
        ev: &FdEvent,
    ) -> Result<()> {
        let slot = ev.slot();
        debug_assert!(slot >= 0, "event already released");
        self.push_sqe(first.flags(squeue::Flags::IO_LINK).user_data(TOKEN_NULL))?;
        self.push_sqe(second.user_data(TOKEN_BASE + slot as u64))
    }

    /// Drop the pinned handler. In-flight polls for the event complete
    /// against a vacant slot and are ignored.
    pub fn release(&mut self, ev: &FdEvent) {
        let slot = ev.slot();
        if slot >= 0 {
            self.release_entry(slot as usize);
            ev.set_slot(-1);
        }
    }

    /// Tell the kernel about queued SQEs without waiting.
    pub fn flush(&mut self) -> Result<usize> {
        if self.pending_submit == 0 {
            return Ok(0);
        }
        let submitted = self.ring.submit().map_err(|e| Error::from(e))?;
        self.inflight += submitted;
        self.pending_submit = 0;
        Ok(submitted)
    }

    // ── Sentinel timer ───────────────────────────────────────────────

    /// Arm the sentinel timer `rel` from now. The caller is responsible
    /// for the no-re-arm-on-equal-deadline rule.
    pub fn arm_sentinel_timer(&mut self, rel: Duration) -> Result<()> {
        *self.sentinel_ts =
            types::Timespec::new().sec(rel.as_secs()).nsec(rel.subsec_nanos());
        let entry = opcode::Timeout::new(&*self.sentinel_ts as *const types::Timespec)
            .build()
            .user_data(TOKEN_TIMER);
        self.push_sqe(entry)
    }

    /// Cancel an armed sentinel timer. The removed timeout still produces
    /// a CQE (with `-ECANCELED`), consumed as a sentinel event.
    pub fn remove_sentinel_timer(&mut self) -> Result<()> {
        let entry = opcode::TimeoutRemove::new(TOKEN_TIMER).build().user_data(TOKEN_CANCEL);
        self.push_sqe(entry)
    }

    /// Best-effort cancellation of an in-flight one-shot by its token.
    /// The cancelled operation still completes (with `-ECANCELED`) and
    /// releases its pinned state through the normal path.
    pub fn cancel_token(&mut self, token: u64) {
        let entry = opcode::AsyncCancel::new(token).build().user_data(TOKEN_CANCEL);
        let _ = self.push_sqe(entry);
    }

    fn arm_wake_poll(&mut self) -> Result<()> {
        let entry = opcode::PollAdd::new(types::Fd(self.wake_fd), libc::POLLIN as u32)
            .build()
            .user_data(TOKEN_WAKE);
        self.push_sqe(entry)
    }

    fn drain_wake_fd(&mut self) {
        let mut buf = 0u64;
        loop {
            let ret = unsafe {
                libc::read(self.wake_fd, &mut buf as *mut u64 as *mut libc::c_void, 8)
            };
            if ret <= 0 {
                break;
            }
        }
    }

    // ── Completion dispatch ──────────────────────────────────────────

    /// Drain every available CQE without blocking. Returns the number of
    /// user callbacks dispatched.
    pub fn dispatch_completions(&mut self) -> usize {
        let mut dispatched = 0;
        loop {
            let mut batch: [(u64, i32, u32); CQE_BATCH] = [(0, 0, 0); CQE_BATCH];
            let mut count = 0;
            {
                let mut cq = self.ring.completion();
                cq.sync();
                for cqe in &mut cq {
                    batch[count] = (cqe.user_data(), cqe.result(), cqe.flags());
                    count += 1;
                    if count == CQE_BATCH {
                        break;
                    }
                }
            }
            if count == 0 {
                return dispatched;
            }
            for &(user_data, res, flags) in &batch[..count] {
                self.inflight = self.inflight.saturating_sub(1);
                self.completions_seen += 1;
                if self.handle_completion(user_data, res, flags) {
                    dispatched += 1;
                }
            }
            if count < CQE_BATCH {
                return dispatched;
            }
        }
    }

    /// Returns true if a user callback ran.
    fn handle_completion(&mut self, user_data: u64, res: i32, flags: u32) -> bool {
        match user_data {
            TOKEN_NULL => false,
            TOKEN_WAKE => {
                self.drain_wake_fd();
                self.woken = true;
                if let Err(e) = self.arm_wake_poll() {
                    tracing::error!(error = %e, "failed to re-arm wake poll");
                }
                false
            }
            TOKEN_TIMER => {
                // -ETIME is normal expiry, -ECANCELED a removal.
                if res == -libc::ETIME {
                    self.timer_fired = true;
                }
                false
            }
            TOKEN_CANCEL => false,
            token if token < TOKEN_BASE => {
                tracing::error!(token, "completion with reserved token");
                false
            }
            token => {
                let idx = (token - TOKEN_BASE) as usize;
                if idx >= self.centries.len() {
                    tracing::error!(token, "completion with unknown token");
                    return false;
                }
                if matches!(self.centries[idx].cb, Some(EntryCb::Event(_))) {
                    let ev = match &self.centries[idx].cb {
                        Some(EntryCb::Event(ev)) => ev.clone(),
                        _ => unreachable!(),
                    };
                    ev.run(res, self);
                    true
                } else if self.centries[idx].cb.is_some() {
                    let cb = match self.centries[idx].cb.take() {
                        Some(EntryCb::Oneshot(cb)) => cb,
                        _ => unreachable!(),
                    };
                    self.release_entry(idx);
                    cb(res, flags, self);
                    true
                } else {
                    // Released while a poll was in flight.
                    false
                }
            }
        }
    }

    /// Submit queued SQEs and block until at least `want` CQEs are
    /// available, then dispatch everything. EINTR sets the interrupted
    /// flag and returns cleanly.
    pub fn submit_and_wait_dispatch(&mut self, want: usize) -> Result<usize> {
        match self.ring.submit_and_wait(want) {
            Ok(submitted) => {
                self.inflight += submitted;
                self.pending_submit = 0;
            }
            Err(e) if e.raw_os_error() == Some(libc::EINTR) => {
                self.interrupted = true;
                return Ok(0);
            }
            Err(e) => return Err(Error::from(e)),
        }
        Ok(self.dispatch_completions())
    }

    /// The standalone drain loop: submit, wait for one CQE, batch-peek,
    /// dispatch. Exits when `running` clears or the wait is interrupted.
    pub fn run_until(&mut self, running: &AtomicBool) -> Result<()> {
        tracing::debug!(depth = self.capacity(), fast_poll = self.has_fast_poll(), "uring loop starting");
        while running.load(Ordering::Relaxed) {
            self.submit_and_wait_dispatch(1)?;
            if self.interrupted {
                break;
            }
        }
        tracing::debug!(completions = self.completions_seen, "uring loop finished");
        Ok(())
    }
}

impl Drop for UringManager {
    fn drop(&mut self) {
        // Drain whatever already completed so pinned state is released.
        self.dispatch_completions();
        if self.owns_wake_fd {
            unsafe {
                libc::close(self.wake_fd);
            }
        }
    }
}

impl AsRawFd for UringManager {
    fn as_raw_fd(&self) -> RawFd {
        self.ring.as_raw_fd()
    }
}
