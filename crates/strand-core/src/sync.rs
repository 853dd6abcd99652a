//! Completion signals shared between threads and fibers.
//!
//! `Done` is a one-shot event with both a blocking wait (for plain
//! threads) and an async wait (for fibers). `BlockingCounter` counts a
//! fan-out down to zero; the accept server and the reactor pool use it to
//! join their fibers during shutdown.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex};
use std::task::{Context, Poll, Waker};

/// One-shot completion event.
#[derive(Clone)]
pub struct Done {
    inner: Arc<DoneInner>,
}

struct DoneInner {
    state: Mutex<DoneState>,
    cond: Condvar,
}

struct DoneState {
    done: bool,
    wakers: Vec<Waker>,
}

impl Done {
    pub fn new() -> Self {
        Done {
            inner: Arc::new(DoneInner {
                state: Mutex::new(DoneState { done: false, wakers: Vec::new() }),
                cond: Condvar::new(),
            }),
        }
    }

    /// Fire the event, releasing every waiter. Idempotent.
    pub fn notify(&self) {
        let mut st = self.inner.state.lock().expect("done state poisoned");
        if st.done {
            return;
        }
        st.done = true;
        for w in st.wakers.drain(..) {
            w.wake();
        }
        self.inner.cond.notify_all();
    }

    pub fn is_done(&self) -> bool {
        self.inner.state.lock().expect("done state poisoned").done
    }

    /// Block the calling OS thread until the event fires. Never call this
    /// from a fiber; use [`Done::notified`] there.
    pub fn wait(&self) {
        let mut st = self.inner.state.lock().expect("done state poisoned");
        while !st.done {
            st = self.inner.cond.wait(st).expect("done state poisoned");
        }
    }

    /// Fiber-friendly wait.
    pub fn notified(&self) -> Notified {
        Notified { done: self.clone() }
    }
}

impl Default for Done {
    fn default() -> Self {
        Self::new()
    }
}

/// Future returned by [`Done::notified`].
pub struct Notified {
    done: Done,
}

impl Future for Notified {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let mut st = self.done.inner.state.lock().expect("done state poisoned");
        if st.done {
            return Poll::Ready(());
        }
        if !st.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            st.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

/// Counts outstanding work items; `wait` releases once the count hits
/// zero.
#[derive(Clone)]
pub struct BlockingCounter {
    inner: Arc<(Mutex<u64>, Condvar)>,
}

impl BlockingCounter {
    pub fn new(initial: u64) -> Self {
        BlockingCounter { inner: Arc::new((Mutex::new(initial), Condvar::new())) }
    }

    pub fn add(&self, n: u64) {
        let mut cnt = self.inner.0.lock().expect("counter poisoned");
        *cnt += n;
    }

    pub fn dec(&self) {
        let mut cnt = self.inner.0.lock().expect("counter poisoned");
        assert!(*cnt > 0, "BlockingCounter underflow");
        *cnt -= 1;
        if *cnt == 0 {
            self.inner.1.notify_all();
        }
    }

    /// Block until the count reaches zero.
    pub fn wait(&self) {
        let mut cnt = self.inner.0.lock().expect("counter poisoned");
        while *cnt > 0 {
            cnt = self.inner.1.wait(cnt).expect("counter poisoned");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_done_wait() {
        let d = Done::new();
        let d2 = d.clone();
        let t = std::thread::spawn(move || d2.wait());
        d.notify();
        t.join().unwrap();
        assert!(d.is_done());
    }

    #[test]
    fn test_done_notified_async() {
        let d = Done::new();
        d.notify();
        crate::task::block_on(d.notified());
    }

    #[test]
    fn test_counter() {
        let bc = BlockingCounter::new(2);
        let bc2 = bc.clone();
        let t = std::thread::spawn(move || {
            bc2.dec();
            bc2.dec();
        });
        bc.wait();
        t.join().unwrap();
    }
}
