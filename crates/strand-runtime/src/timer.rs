//! Fiber timers.
//!
//! Deadlines are kept in a binary heap per reactor; the drive loop asks
//! for the earliest one before blocking and arms the sentinel timer with
//! it, so a sleeping reactor wakes exactly when the next fiber is due.

use std::cell::RefCell;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use strand_core::{Error, Result};

use crate::reactor::Reactor;

pub(crate) struct TimerSlot {
    pub fired: bool,
    pub waker: Option<Waker>,
}

pub(crate) struct TimerQueue {
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    slots: HashMap<u64, Rc<RefCell<TimerSlot>>>,
    next_id: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self { heap: BinaryHeap::new(), slots: HashMap::new(), next_id: 0 }
    }

    pub fn register(&mut self, deadline: Instant) -> (u64, Rc<RefCell<TimerSlot>>) {
        let id = self.next_id;
        self.next_id += 1;
        let slot = Rc::new(RefCell::new(TimerSlot { fired: false, waker: None }));
        self.slots.insert(id, slot.clone());
        self.heap.push(Reverse((deadline, id)));
        (id, slot)
    }

    pub fn cancel(&mut self, id: u64) {
        // The heap entry is pruned lazily by expire/next_deadline.
        self.slots.remove(&id);
    }

    /// Fire every timer at or before `now`. Returns the number woken.
    pub fn expire(&mut self, now: Instant) -> usize {
        let mut woken = 0;
        while let Some(Reverse((deadline, id))) = self.heap.peek().copied() {
            if deadline > now {
                break;
            }
            self.heap.pop();
            if let Some(slot) = self.slots.remove(&id) {
                let mut slot = slot.borrow_mut();
                slot.fired = true;
                if let Some(w) = slot.waker.take() {
                    w.wake();
                }
                woken += 1;
            }
        }
        woken
    }

    /// Earliest live deadline, pruning cancelled heap heads.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, id))) = self.heap.peek().copied() {
            if self.slots.contains_key(&id) {
                return Some(deadline);
            }
            self.heap.pop();
        }
        None
    }
}

/// Sleep until `dur` has elapsed on the current reactor.
pub fn sleep(dur: Duration) -> Sleep {
    sleep_until(Instant::now() + dur)
}

pub fn sleep_until(deadline: Instant) -> Sleep {
    Sleep { reactor: Reactor::current(), deadline, entry: None }
}

/// Future returned by [`sleep`].
pub struct Sleep {
    reactor: Reactor,
    deadline: Instant,
    entry: Option<(u64, Rc<RefCell<TimerSlot>>)>,
}

impl Future for Sleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if this.entry.is_none() {
            if this.deadline <= Instant::now() {
                return Poll::Ready(());
            }
            let (id, slot) = this.reactor.register_timer(this.deadline);
            slot.borrow_mut().waker = Some(cx.waker().clone());
            this.entry = Some((id, slot));
            return Poll::Pending;
        }
        let slot = this.entry.as_ref().map(|(_, slot)| slot.clone()).expect("sleep entry vanished");
        let mut slot = slot.borrow_mut();
        if slot.fired {
            return Poll::Ready(());
        }
        slot.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        if let Some((id, slot)) = self.entry.take() {
            if !slot.borrow().fired {
                self.reactor.cancel_timer(id);
            }
        }
    }
}

/// Run `fut` with a deadline; expiry resolves to `Err(Cancelled)` and
/// drops the inner future, which cancels any operation it had in flight.
pub fn deadline<F: Future>(dur: Duration, fut: F) -> Deadline<F> {
    Deadline { fut, sleep: sleep(dur) }
}

/// Future returned by [`deadline`].
pub struct Deadline<F> {
    fut: F,
    sleep: Sleep,
}

impl<F: Future> Future for Deadline<F> {
    type Output = Result<F::Output>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<F::Output>> {
        // Safety: `fut` is structurally pinned and never moved out;
        // `sleep` is Unpin.
        let this = unsafe { self.get_unchecked_mut() };
        let fut = unsafe { Pin::new_unchecked(&mut this.fut) };
        if let Poll::Ready(v) = fut.poll(cx) {
            return Poll::Ready(Ok(v));
        }
        if let Poll::Ready(()) = Pin::new(&mut this.sleep).poll(cx) {
            return Poll::Ready(Err(Error::Cancelled));
        }
        Poll::Pending
    }
}
