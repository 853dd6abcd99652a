//! The per-reactor scheduler.
//!
//! Owns the fiber arena and the FIFO ready queue. The drive loop plays
//! the dispatcher role: it calls `pick_next` until the queue is empty and
//! `suspend_until`/`notify` are realised by the I/O backend's sentinel
//! timer and eventfd. A fiber is linked into the ready queue at most
//! once; `ready_cnt` tracks linked fibers so `has_ready` is O(1).

use std::cell::{Cell, RefCell};

use crate::fiber::{AbortHook, Fiber, FiberArena, FiberFuture, FiberId, FiberState, ReadyQueue};

pub(crate) struct Scheduler {
    arena: RefCell<FiberArena>,
    ready: RefCell<ReadyQueue>,
    ready_cnt: Cell<usize>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            arena: RefCell::new(FiberArena::new()),
            ready: RefCell::new(ReadyQueue::new()),
            ready_cnt: Cell::new(0),
        }
    }

    /// Insert a new fiber and link it into the ready queue.
    pub fn insert(&self, future: FiberFuture, abort_hook: Option<AbortHook>) -> FiberId {
        let id = self.arena.borrow_mut().insert(Fiber {
            state: FiberState::Ready,
            future: Some(future),
            abort_hook,
        });
        self.link(id);
        id
    }

    /// Attach a waiting fiber to the ready queue. Wakes that race the
    /// fiber's completion or duplicate an earlier wake are ignored.
    pub fn awakened(&self, id: FiberId) -> bool {
        let awakened = {
            let mut arena = self.arena.borrow_mut();
            match arena.get_mut(id) {
                Some(fiber) if fiber.state == FiberState::Waiting => {
                    fiber.state = FiberState::Ready;
                    true
                }
                _ => false,
            }
        };
        if awakened {
            self.link(id);
        }
        awakened
    }

    fn link(&self, id: FiberId) {
        self.ready.borrow_mut().push_back(id);
        self.ready_cnt.set(self.ready_cnt.get() + 1);
    }

    /// Pop the ready-queue head, marking the fiber running.
    pub fn pick_next(&self) -> Option<FiberId> {
        let id = self.ready.borrow_mut().pop_front()?;
        self.ready_cnt.set(self.ready_cnt.get() - 1);
        Some(id)
    }

    pub fn has_ready(&self) -> bool {
        self.ready_cnt.get() > 0
    }

    pub fn live(&self) -> usize {
        self.arena.borrow().live()
    }

    /// Take the fiber's future out for polling.
    pub fn take_future(&self, id: FiberId) -> Option<FiberFuture> {
        let mut arena = self.arena.borrow_mut();
        let fiber = arena.get_mut(id)?;
        fiber.state = FiberState::Running;
        fiber.future.take()
    }

    /// Return the future after a `Pending` poll; the fiber waits for a
    /// wake.
    pub fn park_fiber(&self, id: FiberId, future: FiberFuture) {
        let mut arena = self.arena.borrow_mut();
        if let Some(fiber) = arena.get_mut(id) {
            fiber.future = Some(future);
            fiber.state = FiberState::Waiting;
        }
    }

    pub fn take_abort_hook(&self, id: FiberId) -> Option<AbortHook> {
        self.arena.borrow_mut().get_mut(id)?.abort_hook.take()
    }

    /// Terminal state: drop the slot.
    pub fn finish(&self, id: FiberId) {
        self.arena.borrow_mut().remove(id);
    }

    /// Drop every remaining fiber. Futures are collected first so their
    /// destructors run without the arena borrowed.
    pub fn clear(&self) {
        let fibers = self.arena.borrow_mut().drain_all();
        self.ready.borrow_mut().clear();
        self.ready_cnt.set(0);
        drop(fibers);
    }
}
