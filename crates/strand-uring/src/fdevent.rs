//! Persistent per-fd completion events.
//!
//! An `FdEvent` pins a callback (and whatever state its closure owns) in
//! the manager's completion slab so that it outlives any number of
//! in-flight poll submissions. Connection handlers keep themselves alive
//! by capturing a strong reference in the closure; the reference is
//! released when the manager [`release`](crate::UringManager::release)s
//! the event at close.

use std::cell::{Cell, RefCell};
use std::os::unix::io::RawFd;
use std::rc::Rc;

use crate::manager::UringManager;

type Handler = Box<dyn FnMut(i32, &mut UringManager)>;

/// Handle to a pinned per-fd callback. Clones share the same handler.
#[derive(Clone)]
pub struct FdEvent {
    inner: Rc<FdEventInner>,
}

struct FdEventInner {
    fd: RawFd,
    /// Index into the manager's completion slab; -1 once released.
    slot: Cell<i32>,
    handler: RefCell<Handler>,
}

impl FdEvent {
    pub(crate) fn new(fd: RawFd, handler: impl FnMut(i32, &mut UringManager) + 'static) -> Self {
        FdEvent {
            inner: Rc::new(FdEventInner {
                fd,
                slot: Cell::new(-1),
                handler: RefCell::new(Box::new(handler)),
            }),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.inner.fd
    }

    pub(crate) fn slot(&self) -> i32 {
        self.inner.slot.get()
    }

    pub(crate) fn set_slot(&self, slot: i32) {
        self.inner.slot.set(slot);
    }

    /// Invoke the handler with a completion result. The handler may
    /// resubmit through the manager but must not recursively run itself.
    pub(crate) fn run(&self, res: i32, mgr: &mut UringManager) {
        let mut handler = self
            .inner
            .handler
            .try_borrow_mut()
            .expect("re-entrant FdEvent dispatch");
        (handler)(res, mgr);
    }
}
