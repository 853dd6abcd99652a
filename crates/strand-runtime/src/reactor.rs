//! The reactor: one OS thread's I/O driver plus fiber scheduler.
//!
//! The drive loop interleaves scheduler and I/O: while fibers are ready
//! it drains immediately available events non-blockingly between
//! scheduler passes, so a fiber resumed by a completion runs without a
//! cross-thread hop; when nothing is ready it blocks in the backend for
//! one event, with the sentinel timer armed at the earliest fiber
//! deadline. The loop exits once the work-guard count reaches zero and
//! no fiber is ready.
//!
//! Cross-thread access goes through [`Remote`]: a task queue of brief
//! closures (executed inline by the loop), a wake queue of fiber ids,
//! and an eventfd notifier that fires only when the loop is actually
//! asleep.

use std::cell::{RefCell, RefMut};
use std::collections::VecDeque;
use std::future::Future;
use std::os::unix::io::RawFd;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Wake, Waker};
use std::thread::ThreadId;
use std::time::Instant;

use crossbeam_queue::ArrayQueue;
use strand_core::sync::Done;
use strand_core::Result;

use crate::fiber::{join_error, FiberId, JoinCell, JoinHandle};
use crate::notify::Notifier;
use crate::poll_backend::{self, EpollBackend};
use crate::scheduler::Scheduler;
use crate::timer::{TimerQueue, TimerSlot};
use crate::uring_backend::{self, UringBackend};

/// Which I/O driver a reactor runs on.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ReactorKind {
    Uring,
    Epoll,
}

#[derive(Clone, Copy)]
pub struct ReactorConfig {
    pub kind: ReactorKind,
    /// io_uring SQ depth; ignored by the epoll flavour.
    pub ring_depth: u32,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self { kind: ReactorKind::Uring, ring_depth: strand_uring::DEFAULT_RING_DEPTH }
    }
}

const TASK_QUEUE_DEPTH: usize = 1024;
const WAKE_QUEUE_DEPTH: usize = 8192;

type Task = Box<dyn FnOnce(&Reactor) + Send>;

pub(crate) struct RemoteShared {
    idx: u32,
    tasks: ArrayQueue<Task>,
    task_overflow: Mutex<VecDeque<Task>>,
    wakes: ArrayQueue<FiberId>,
    wake_overflow: Mutex<Vec<FiberId>>,
    /// True while the drive loop is blocked in the backend.
    sleeping: AtomicBool,
    /// Service keep-alive count; starts at 1 for the run guard dropped
    /// by `stop`.
    guards: AtomicUsize,
    stop_called: AtomicBool,
    notifier: Notifier,
    thread_id: Mutex<Option<ThreadId>>,
}

impl RemoteShared {
    fn queues_empty(&self) -> bool {
        self.tasks.is_empty()
            && self.wakes.is_empty()
            && self.task_overflow.lock().expect("task overflow poisoned").is_empty()
            && self.wake_overflow.lock().expect("wake overflow poisoned").is_empty()
    }

    fn maybe_notify(&self) {
        if self.sleeping.load(Ordering::SeqCst) {
            self.notifier.notify();
        }
    }

    pub(crate) fn wake_fiber(&self, id: FiberId) {
        if self.wakes.push(id).is_err() {
            self.wake_overflow.lock().expect("wake overflow poisoned").push(id);
        }
        self.maybe_notify();
    }

    fn push_task(&self, task: Task) {
        if let Err(task) = self.tasks.push(task) {
            self.task_overflow.lock().expect("task overflow poisoned").push_back(task);
        }
        self.maybe_notify();
    }

    fn is_current_thread(&self) -> bool {
        let tid = self.thread_id.lock().expect("thread id poisoned");
        *tid == Some(std::thread::current().id())
    }
}

struct FiberWaker {
    shared: Arc<RemoteShared>,
    id: FiberId,
}

impl Wake for FiberWaker {
    fn wake(self: Arc<Self>) {
        self.shared.wake_fiber(self.id);
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.shared.wake_fiber(self.id);
    }
}

/// Send + Sync handle to a reactor on another thread.
#[derive(Clone)]
pub struct Remote {
    shared: Arc<RemoteShared>,
}

impl Remote {
    pub fn idx(&self) -> u32 {
        self.shared.idx
    }

    /// Queue a brief closure that the drive loop executes inline. It
    /// must not suspend; spawn a fiber for anything that does.
    pub fn post(&self, f: impl FnOnce(&Reactor) + Send + 'static) {
        self.shared.push_task(Box::new(f));
    }

    /// Spawn a fiber on the remote reactor. The closure runs there and
    /// produces the fiber's future.
    pub fn spawn<F, Fut>(&self, f: F)
    where
        F: FnOnce(Reactor) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        self.post(move |r| {
            let fut = f(r.clone());
            r.spawn_detached(fut);
        });
    }

    /// Run `f` on the remote reactor and block the calling OS thread for
    /// its result. Must not be called from any reactor thread, since a
    /// fiber would stall its whole reactor; fibers use [`Remote::run_on`].
    pub fn await_on<R, F>(&self, f: F) -> R
    where
        R: Send + 'static,
        F: FnOnce(&Reactor) -> R + Send + 'static,
    {
        assert!(
            Reactor::try_current().is_none(),
            "Remote::await_on called from a reactor thread; use run_on from fibers"
        );
        let done = Done::new();
        let slot: Arc<Mutex<Option<R>>> = Arc::new(Mutex::new(None));
        let (done2, slot2) = (done.clone(), slot.clone());
        self.post(move |r| {
            *slot2.lock().expect("await_on slot poisoned") = Some(f(r));
            done2.notify();
        });
        done.wait();
        let mut slot = slot.lock().expect("await_on slot poisoned");
        slot.take().expect("await_on completed without result")
    }

    /// Fiber-friendly migration: enqueue a trampoline on the target
    /// reactor and suspend the calling fiber until it completes.
    pub async fn run_on<R, F>(&self, f: F) -> R
    where
        R: Send + 'static,
        F: FnOnce(&Reactor) -> R + Send + 'static,
    {
        let done = Done::new();
        let slot: Arc<Mutex<Option<R>>> = Arc::new(Mutex::new(None));
        let (done2, slot2) = (done.clone(), slot.clone());
        self.post(move |r| {
            *slot2.lock().expect("run_on slot poisoned") = Some(f(r));
            done2.notify();
        });
        done.notified().await;
        let mut slot = slot.lock().expect("run_on slot poisoned");
        slot.take().expect("run_on completed without result")
    }

    /// Drop the run guard: the reactor exits once its ready fibers and
    /// queues drain. Idempotent.
    pub fn stop(&self) {
        if !self.shared.stop_called.swap(true, Ordering::SeqCst) {
            self.shared.guards.fetch_sub(1, Ordering::SeqCst);
        }
        self.shared.notifier.notify();
    }

    /// Keep the reactor alive until the guard drops.
    pub fn work_guard(&self) -> WorkGuard {
        self.shared.guards.fetch_add(1, Ordering::SeqCst);
        WorkGuard { shared: self.shared.clone() }
    }

    pub fn is_reactor_thread(&self) -> bool {
        self.shared.is_current_thread()
    }
}

/// RAII keep-alive for a reactor; see [`Remote::work_guard`].
pub struct WorkGuard {
    shared: Arc<RemoteShared>,
}

impl Drop for WorkGuard {
    fn drop(&mut self) {
        if self.shared.guards.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.shared.notifier.notify();
        }
    }
}

pub(crate) enum Backend {
    Uring(UringBackend),
    Epoll(EpollBackend),
}

impl Backend {
    fn drain(&mut self) -> usize {
        match self {
            Backend::Uring(b) => b.drain(),
            Backend::Epoll(b) => b.drain(),
        }
    }

    /// Block the dispatcher for one I/O event, arming the sentinel timer
    /// for `deadline` (re-arming to an equal deadline is a no-op;
    /// infinity leaves the timer untouched).
    fn suspend_until(&mut self, deadline: Option<Instant>) {
        match self {
            Backend::Uring(b) => b.suspend_until(deadline),
            Backend::Epoll(b) => b.suspend_until(deadline),
        }
    }
}

pub(crate) struct ReactorInner {
    pub(crate) shared: Arc<RemoteShared>,
    pub(crate) sched: Scheduler,
    pub(crate) timers: RefCell<TimerQueue>,
    pub(crate) backend: RefCell<Backend>,
    kind: ReactorKind,
}

thread_local! {
    static CURRENT: RefCell<Option<Reactor>> = const { RefCell::new(None) };
}

/// Handle to the reactor owning the current thread. `!Send`: per-reactor
/// state is partitioned by thread, never locked.
#[derive(Clone)]
pub struct Reactor {
    inner: Rc<ReactorInner>,
    // Rc already makes this !Send; the marker documents intent.
    _not_send: std::marker::PhantomData<*const ()>,
}

impl Reactor {
    /// Create a reactor owned by the calling thread.
    pub fn new(idx: u32, config: &ReactorConfig) -> Result<Reactor> {
        let notifier = Notifier::create()?;
        let notify_fd = notifier.fd();
        let shared = Arc::new(RemoteShared {
            idx,
            tasks: ArrayQueue::new(TASK_QUEUE_DEPTH),
            task_overflow: Mutex::new(VecDeque::new()),
            wakes: ArrayQueue::new(WAKE_QUEUE_DEPTH),
            wake_overflow: Mutex::new(Vec::new()),
            sleeping: AtomicBool::new(false),
            guards: AtomicUsize::new(1),
            stop_called: AtomicBool::new(false),
            notifier,
            thread_id: Mutex::new(Some(std::thread::current().id())),
        });
        let backend = match config.kind {
            ReactorKind::Uring => Backend::Uring(UringBackend::new(config.ring_depth, notify_fd)?),
            ReactorKind::Epoll => Backend::Epoll(EpollBackend::new(notify_fd)?),
        };
        Ok(Reactor {
            inner: Rc::new(ReactorInner {
                shared,
                sched: Scheduler::new(),
                timers: RefCell::new(TimerQueue::new()),
                backend: RefCell::new(backend),
                kind: config.kind,
            }),
            _not_send: std::marker::PhantomData,
        })
    }

    /// The reactor whose thread we are on. Panics elsewhere.
    pub fn current() -> Reactor {
        Self::try_current().expect("not on a reactor thread")
    }

    pub fn try_current() -> Option<Reactor> {
        CURRENT.with(|c| c.borrow().clone())
    }

    pub fn idx(&self) -> u32 {
        self.inner.shared.idx
    }

    pub fn kind(&self) -> ReactorKind {
        self.inner.kind
    }

    pub fn remote(&self) -> Remote {
        Remote { shared: self.inner.shared.clone() }
    }

    /// Spawn a fiber and get a handle to its result.
    pub fn spawn<T, F>(&self, fut: F) -> JoinHandle<T>
    where
        T: 'static,
        F: Future<Output = T> + 'static,
    {
        let cell = Rc::new(RefCell::new(JoinCell { result: None, waker: None }));
        let completion = cell.clone();
        let wrapped = async move {
            let out = fut.await;
            let mut cell = completion.borrow_mut();
            cell.result = Some(Ok(out));
            if let Some(w) = cell.waker.take() {
                w.wake();
            }
        };
        let abort_cell = cell.clone();
        let hook = Box::new(move |msg: String| {
            let mut cell = abort_cell.borrow_mut();
            cell.result = Some(Err(join_error(msg)));
            if let Some(w) = cell.waker.take() {
                w.wake();
            }
        });
        self.inner.sched.insert(Box::pin(wrapped), Some(hook));
        JoinHandle { cell }
    }

    /// Spawn a fiber whose result nobody joins.
    pub fn spawn_detached(&self, fut: impl Future<Output = ()> + 'static) {
        self.inner.sched.insert(Box::pin(fut), None);
    }

    /// Number of live fibers, the dispatcher excluded.
    pub fn live_fibers(&self) -> usize {
        self.inner.sched.live()
    }

    // ── Drive loop ───────────────────────────────────────────────────

    /// Run the drive loop on the calling thread until stopped.
    pub fn run(&self) {
        {
            let mut tid = self.inner.shared.thread_id.lock().expect("thread id poisoned");
            *tid = Some(std::thread::current().id());
        }
        CURRENT.with(|c| *c.borrow_mut() = Some(self.clone()));
        tracing::debug!(idx = self.idx(), kind = ?self.kind(), "reactor running");

        loop {
            loop {
                let mut progressed = 0usize;
                progressed += self.drain_tasks();
                progressed += self.drain_wakes();
                progressed += self.inner.timers.borrow_mut().expire(Instant::now());
                progressed += self.run_ready();
                if progressed == 0 {
                    break;
                }
                // Fibers are (or were just) ready: pick up completed I/O
                // without blocking before the next scheduler pass.
                self.inner.backend.borrow_mut().drain();
            }

            if self.should_exit() {
                break;
            }
            self.park();
        }

        // Drop whatever fibers remain so their destructors run on the
        // owning thread (sockets close, in-flight ops cancel).
        self.inner.sched.clear();
        self.inner.backend.borrow_mut().drain();
        CURRENT.with(|c| *c.borrow_mut() = None);
        tracing::debug!(idx = self.idx(), "reactor stopped");
    }

    fn should_exit(&self) -> bool {
        self.inner.shared.guards.load(Ordering::SeqCst) == 0
            && !self.inner.sched.has_ready()
            && self.inner.shared.queues_empty()
    }

    fn park(&self) {
        let shared = &self.inner.shared;
        shared.sleeping.store(true, Ordering::SeqCst);
        // A wake may have slipped in between the last drain and the flag
        // store; re-check before actually blocking.
        if !shared.queues_empty() {
            shared.sleeping.store(false, Ordering::SeqCst);
            return;
        }
        let deadline = self.inner.timers.borrow_mut().next_deadline();
        self.inner.backend.borrow_mut().suspend_until(deadline);
        shared.sleeping.store(false, Ordering::SeqCst);
    }

    fn drain_tasks(&self) -> usize {
        let mut ran = 0;
        while let Some(task) = self.inner.shared.tasks.pop() {
            task(self);
            ran += 1;
        }
        let overflow: Vec<Task> = {
            let mut of = self.inner.shared.task_overflow.lock().expect("task overflow poisoned");
            of.drain(..).collect()
        };
        for task in overflow {
            task(self);
            ran += 1;
        }
        ran
    }

    fn drain_wakes(&self) -> usize {
        let mut woken = 0;
        while let Some(id) = self.inner.shared.wakes.pop() {
            if self.inner.sched.awakened(id) {
                woken += 1;
            }
        }
        let overflow: Vec<FiberId> = {
            let mut of = self.inner.shared.wake_overflow.lock().expect("wake overflow poisoned");
            of.drain(..).collect()
        };
        for id in overflow {
            if self.inner.sched.awakened(id) {
                woken += 1;
            }
        }
        woken
    }

    fn run_ready(&self) -> usize {
        let mut ran = 0;
        while let Some(id) = self.inner.sched.pick_next() {
            let Some(mut fut) = self.inner.sched.take_future(id) else {
                continue;
            };
            ran += 1;
            let waker = Waker::from(Arc::new(FiberWaker {
                shared: self.inner.shared.clone(),
                id,
            }));
            let mut cx = Context::from_waker(&waker);
            match catch_unwind(AssertUnwindSafe(|| fut.as_mut().poll(&mut cx))) {
                Ok(Poll::Ready(())) => {
                    self.inner.sched.finish(id);
                }
                Ok(Poll::Pending) => {
                    self.inner.sched.park_fiber(id, fut);
                }
                Err(payload) => {
                    // A fiber panic terminates the fiber, never the
                    // reactor.
                    let msg = panic_message(payload);
                    tracing::error!(fiber = id, idx = self.idx(), %msg, "fiber panicked");
                    if let Some(hook) = self.inner.sched.take_abort_hook(id) {
                        hook(msg);
                    }
                    self.inner.sched.finish(id);
                }
            }
        }
        ran
    }

    // ── Socket primitives (used by strand-net) ───────────────────────

    /// Receive into `buf`. `Ok(0)` is EOF; EAGAIN is retried after
    /// waiting for readiness.
    pub async fn recv(&self, fd: RawFd, buf: &mut [u8]) -> Result<usize> {
        match self.inner.kind {
            ReactorKind::Uring => uring_backend::recv(self, fd, buf).await,
            ReactorKind::Epoll => poll_backend::recv(self, fd, buf).await,
        }
    }

    /// Send from `buf`; may be a short write.
    pub async fn send(&self, fd: RawFd, buf: &[u8]) -> Result<usize> {
        match self.inner.kind {
            ReactorKind::Uring => uring_backend::send(self, fd, buf).await,
            ReactorKind::Epoll => poll_backend::send(self, fd, buf).await,
        }
    }

    /// Suspend until `fd` is readable.
    pub async fn readable(&self, fd: RawFd) -> Result<()> {
        match self.inner.kind {
            ReactorKind::Uring => uring_backend::wait_fd(self, fd, libc::POLLIN as u32).await,
            ReactorKind::Epoll => poll_backend::wait_fd(self, fd, libc::POLLIN as u32).await,
        }
    }

    /// Suspend until `fd` is writable.
    pub async fn writable(&self, fd: RawFd) -> Result<()> {
        match self.inner.kind {
            ReactorKind::Uring => uring_backend::wait_fd(self, fd, libc::POLLOUT as u32).await,
            ReactorKind::Epoll => poll_backend::wait_fd(self, fd, libc::POLLOUT as u32).await,
        }
    }

    // ── Internal accessors ───────────────────────────────────────────

    pub(crate) fn uring_backend_mut(&self) -> RefMut<'_, UringBackend> {
        RefMut::map(self.inner.backend.borrow_mut(), |b| match b {
            Backend::Uring(u) => u,
            Backend::Epoll(_) => panic!("uring op on an epoll reactor"),
        })
    }

    pub(crate) fn epoll_backend_mut(&self) -> RefMut<'_, EpollBackend> {
        RefMut::map(self.inner.backend.borrow_mut(), |b| match b {
            Backend::Epoll(e) => e,
            Backend::Uring(_) => panic!("epoll op on a uring reactor"),
        })
    }

    pub(crate) fn register_timer(
        &self,
        deadline: Instant,
    ) -> (u64, Rc<RefCell<TimerSlot>>) {
        self.inner.timers.borrow_mut().register(deadline)
    }

    pub(crate) fn cancel_timer(&self, id: u64) {
        self.inner.timers.borrow_mut().cancel(id);
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "opaque panic payload".to_string()
    }
}
