//! Bounded MPMC channel for fiber communication.
//!
//! `push` suspends the calling fiber while the queue is full and `pop`
//! suspends while it is empty; waiters are resumed in FIFO order and the
//! order of pushed elements is preserved. Closing comes in two flavours:
//!
//! - [`Channel::close`] marks the channel closed and wakes *every* waiter.
//!   Later pushes fail with [`Error::Closed`]; pops drain the remaining
//!   elements and then report closed.
//! - [`Channel::start_closing`] wakes only consumers. Producers that are
//!   already suspended keep their place and complete once space frees up,
//!   which is what the pipeline executor relies on when it drains record
//!   queues after the workers have joined.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll, Waker};

use crate::error::{Error, Result};

/// Create a bounded channel with room for `capacity` elements.
pub fn channel<T>(capacity: usize) -> Channel<T> {
    assert!(capacity > 0, "channel capacity must be positive");
    Channel {
        inner: Arc::new(Inner {
            state: Mutex::new(State {
                queue: VecDeque::with_capacity(capacity),
                closing: false,
                closed: false,
                push_waiters: VecDeque::new(),
                pop_waiters: VecDeque::new(),
            }),
            capacity,
            next_waiter: AtomicU64::new(0),
        }),
    }
}

/// A bounded multi-producer multi-consumer queue. Cheap to clone; all
/// clones share the same buffer.
pub struct Channel<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Channel { inner: Arc::clone(&self.inner) }
    }
}

struct Inner<T> {
    state: Mutex<State<T>>,
    capacity: usize,
    next_waiter: AtomicU64,
}

struct State<T> {
    queue: VecDeque<T>,
    /// No new elements expected; consumers drain and stop.
    closing: bool,
    /// Hard close; pushes fail immediately.
    closed: bool,
    push_waiters: VecDeque<(u64, Waker)>,
    pop_waiters: VecDeque<(u64, Waker)>,
}

impl<T> State<T> {
    fn wake_one_pusher(&mut self) {
        if let Some((_, w)) = self.push_waiters.pop_front() {
            w.wake();
        }
    }

    fn wake_one_popper(&mut self) {
        if let Some((_, w)) = self.pop_waiters.pop_front() {
            w.wake();
        }
    }

    fn wake_all_poppers(&mut self) {
        for (_, w) in self.pop_waiters.drain(..) {
            w.wake();
        }
    }

    fn wake_all_pushers(&mut self) {
        for (_, w) in self.push_waiters.drain(..) {
            w.wake();
        }
    }
}

/// Register `waker` under `id`, replacing a previous registration in place
/// so a re-polled future keeps its position in the FIFO.
fn register(list: &mut VecDeque<(u64, Waker)>, id: u64, waker: &Waker) {
    for (wid, slot) in list.iter_mut() {
        if *wid == id {
            slot.clone_from(waker);
            return;
        }
    }
    list.push_back((id, waker.clone()));
}

fn unregister(list: &mut VecDeque<(u64, Waker)>, id: u64) {
    list.retain(|(wid, _)| *wid != id);
}

/// Error returned by [`Channel::try_push`].
#[derive(Debug, PartialEq, Eq)]
pub enum TryPushError<T> {
    Full(T),
    Closed(T),
}

/// Error returned by [`Channel::try_pop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryPopError {
    Empty,
    Closed,
}

impl<T> Channel<T> {
    /// Push an element, suspending while the queue is full.
    ///
    /// Returns `Err(Closed)` if the channel was closed before the element
    /// could be enqueued; the element is dropped in that case.
    pub fn push(&self, value: T) -> Push<'_, T> {
        Push {
            chan: self,
            value: Some(value),
            id: self.inner.next_waiter.fetch_add(1, Ordering::Relaxed),
            registered: false,
        }
    }

    /// Pop an element, suspending while the queue is empty. Returns `None`
    /// once the channel is closed (or closing) and fully drained.
    pub fn pop(&self) -> Pop<'_, T> {
        Pop {
            chan: self,
            id: self.inner.next_waiter.fetch_add(1, Ordering::Relaxed),
            registered: false,
        }
    }

    /// Non-suspending push.
    pub fn try_push(&self, value: T) -> std::result::Result<(), TryPushError<T>> {
        let mut st = self.lock();
        if st.closed {
            return Err(TryPushError::Closed(value));
        }
        if st.queue.len() >= self.inner.capacity {
            return Err(TryPushError::Full(value));
        }
        st.queue.push_back(value);
        st.wake_one_popper();
        Ok(())
    }

    /// Non-suspending pop.
    pub fn try_pop(&self) -> std::result::Result<T, TryPopError> {
        let mut st = self.lock();
        match st.queue.pop_front() {
            Some(v) => {
                st.wake_one_pusher();
                Ok(v)
            }
            None if st.closed || st.closing => Err(TryPopError::Closed),
            None => Err(TryPopError::Empty),
        }
    }

    /// Close the channel and wake every waiter. Idempotent; closing an
    /// empty channel with no waiters only flips the state.
    pub fn close(&self) {
        let mut st = self.lock();
        if st.closed {
            return;
        }
        st.closed = true;
        st.closing = true;
        st.wake_all_poppers();
        st.wake_all_pushers();
    }

    /// Mark the channel as closing and wake only consumers. Producers that
    /// are already suspended complete normally once space frees up.
    pub fn start_closing(&self) {
        let mut st = self.lock();
        if st.closing {
            return;
        }
        st.closing = true;
        st.wake_all_poppers();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        // Fibers never hold the lock across a suspension point, so a
        // poisoned mutex can only mean a panic inside this module.
        self.inner.state.lock().expect("channel state poisoned")
    }
}

/// Future returned by [`Channel::push`].
pub struct Push<'a, T> {
    chan: &'a Channel<T>,
    value: Option<T>,
    id: u64,
    registered: bool,
}

// The futures never project into `T`, so they are Unpin regardless of it.
impl<T> Unpin for Push<'_, T> {}
impl<T> Unpin for Pop<'_, T> {}

impl<T> Future for Push<'_, T> {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        let this = self.get_mut();
        let mut st = this.chan.lock();
        if st.closed {
            if this.registered {
                unregister(&mut st.push_waiters, this.id);
                this.registered = false;
            }
            this.value = None;
            return Poll::Ready(Err(Error::Closed));
        }
        if st.queue.len() < this.chan.inner.capacity {
            let value = this.value.take().expect("push polled after completion");
            st.queue.push_back(value);
            if this.registered {
                unregister(&mut st.push_waiters, this.id);
                this.registered = false;
            }
            st.wake_one_popper();
            return Poll::Ready(Ok(()));
        }
        register(&mut st.push_waiters, this.id, cx.waker());
        this.registered = true;
        Poll::Pending
    }
}

impl<T> Drop for Push<'_, T> {
    fn drop(&mut self) {
        if self.registered {
            let mut st = self.chan.lock();
            unregister(&mut st.push_waiters, self.id);
            // We may have been woken for a slot we never took; hand the
            // wakeup to the next producer in line.
            if st.queue.len() < self.chan.inner.capacity {
                st.wake_one_pusher();
            }
        }
    }
}

/// Future returned by [`Channel::pop`].
pub struct Pop<'a, T> {
    chan: &'a Channel<T>,
    id: u64,
    registered: bool,
}

impl<T> Future for Pop<'_, T> {
    type Output = Option<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        let this = self.get_mut();
        let mut st = this.chan.lock();
        if let Some(v) = st.queue.pop_front() {
            if this.registered {
                unregister(&mut st.pop_waiters, this.id);
                this.registered = false;
            }
            st.wake_one_pusher();
            return Poll::Ready(Some(v));
        }
        if st.closed || st.closing {
            if this.registered {
                unregister(&mut st.pop_waiters, this.id);
                this.registered = false;
            }
            return Poll::Ready(None);
        }
        register(&mut st.pop_waiters, this.id, cx.waker());
        this.registered = true;
        Poll::Pending
    }
}

impl<T> Drop for Pop<'_, T> {
    fn drop(&mut self) {
        if self.registered {
            let mut st = self.chan.lock();
            unregister(&mut st.pop_waiters, self.id);
            if !st.queue.is_empty() {
                st.wake_one_popper();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::block_on;

    #[test]
    fn test_push_pop() {
        let ch = channel(4);
        block_on(ch.push(1)).unwrap();
        block_on(ch.push(2)).unwrap();
        assert_eq!(block_on(ch.pop()), Some(1));
        assert_eq!(block_on(ch.pop()), Some(2));
    }

    #[test]
    fn test_try_full() {
        let ch = channel(2);
        ch.try_push(1).unwrap();
        ch.try_push(2).unwrap();
        assert!(matches!(ch.try_push(3), Err(TryPushError::Full(3))));
        assert_eq!(ch.try_pop().unwrap(), 1);
        ch.try_push(3).unwrap();
    }

    #[test]
    fn test_close_drains_then_reports_closed() {
        let ch = channel(4);
        ch.try_push(7).unwrap();
        ch.close();
        assert!(matches!(ch.try_push(8), Err(TryPushError::Closed(8))));
        assert_eq!(block_on(ch.pop()), Some(7));
        assert_eq!(block_on(ch.pop()), None);
    }

    #[test]
    fn test_close_empty_is_state_only() {
        let ch = channel::<u32>(4);
        ch.close();
        assert!(ch.is_closed());
        assert!(ch.is_empty());
        ch.close();
        assert_eq!(block_on(ch.pop()), None);
    }

    #[test]
    fn test_start_closing_wakes_consumers_only() {
        let ch = channel(4);
        ch.try_push(1).unwrap();
        ch.start_closing();
        // Consumers drain everything pushed before the close, then see
        // the closed marker.
        assert_eq!(block_on(ch.pop()), Some(1));
        assert_eq!(block_on(ch.pop()), None);
        assert!(!ch.is_closed());
    }

    #[test]
    fn test_blocking_push_across_threads() {
        let ch = channel(2);
        let tx = ch.clone();
        let producer = std::thread::spawn(move || {
            for i in 0..100u32 {
                block_on(tx.push(i)).unwrap();
            }
            tx.close();
        });
        let mut got = Vec::new();
        while let Some(v) = block_on(ch.pop()) {
            got.push(v);
        }
        producer.join().unwrap();
        assert_eq!(got, (0..100).collect::<Vec<_>>());
    }
}
