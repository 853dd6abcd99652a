//! Fiber slots and join handles.
//!
//! Fibers live in a per-reactor arena of stable indices; the ready queue
//! links them by index, which models the original's intrusive list
//! without allocation per wakeup.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use strand_core::{Error, Result};

pub(crate) type FiberId = u32;

pub(crate) type FiberFuture = Pin<Box<dyn Future<Output = ()>>>;

/// Called when the fiber's future panics, with the panic message.
pub(crate) type AbortHook = Box<dyn FnOnce(String)>;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum FiberState {
    Ready,
    Running,
    Waiting,
}

pub(crate) struct Fiber {
    pub state: FiberState,
    /// Taken out while the fiber is being polled.
    pub future: Option<FiberFuture>,
    pub abort_hook: Option<AbortHook>,
}

pub(crate) struct FiberArena {
    slots: Vec<Option<Fiber>>,
    free: Vec<FiberId>,
    live: usize,
}

impl FiberArena {
    pub fn new() -> Self {
        Self { slots: Vec::new(), free: Vec::new(), live: 0 }
    }

    pub fn insert(&mut self, fiber: Fiber) -> FiberId {
        self.live += 1;
        match self.free.pop() {
            Some(id) => {
                self.slots[id as usize] = Some(fiber);
                id
            }
            None => {
                self.slots.push(Some(fiber));
                (self.slots.len() - 1) as FiberId
            }
        }
    }

    pub fn get_mut(&mut self, id: FiberId) -> Option<&mut Fiber> {
        self.slots.get_mut(id as usize)?.as_mut()
    }

    pub fn remove(&mut self, id: FiberId) -> Option<Fiber> {
        let fiber = self.slots.get_mut(id as usize)?.take();
        if fiber.is_some() {
            self.live -= 1;
            self.free.push(id);
        }
        fiber
    }

    pub fn live(&self) -> usize {
        self.live
    }

    pub fn drain_all(&mut self) -> Vec<Fiber> {
        let mut out = Vec::new();
        for (id, slot) in self.slots.iter_mut().enumerate() {
            if let Some(f) = slot.take() {
                out.push(f);
                self.free.push(id as FiberId);
            }
        }
        self.live = 0;
        out
    }
}

pub(crate) struct JoinCell<T> {
    pub result: Option<Result<T>>,
    pub waker: Option<Waker>,
}

/// Handle to a fiber spawned on the local reactor. Dropping it detaches
/// the fiber; `join` resolves when the fiber finishes and yields its
/// output, or an `Internal` error if the fiber panicked.
pub struct JoinHandle<T> {
    pub(crate) cell: Rc<RefCell<JoinCell<T>>>,
}

impl<T> JoinHandle<T> {
    pub fn is_finished(&self) -> bool {
        self.cell.borrow().result.is_some()
    }

    pub fn join(self) -> Join<T> {
        Join { cell: self.cell }
    }

    pub fn detach(self) {}
}

/// Future returned by [`JoinHandle::join`].
pub struct Join<T> {
    cell: Rc<RefCell<JoinCell<T>>>,
}

impl<T> Future for Join<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<T>> {
        let mut cell = self.cell.borrow_mut();
        if let Some(result) = cell.result.take() {
            return Poll::Ready(result);
        }
        cell.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

/// Ready queue: FIFO of fiber ids awaiting CPU.
pub(crate) type ReadyQueue = VecDeque<FiberId>;

pub(crate) fn join_error(msg: String) -> Error {
    Error::Internal(format!("fiber panicked: {}", msg))
}
