//! Glue between plain OS threads and fiber code.
//!
//! `block_on` is a minimal thread-parking executor. It exists so that
//! non-reactor threads (the pipeline's main thread, tests) can drive a
//! single future to completion, e.g. pushing into a fiber channel.

use std::future::Future;
use std::pin::{pin, Pin};
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};
use std::thread::Thread;

struct ThreadWaker {
    thread: Thread,
}

impl Wake for ThreadWaker {
    fn wake(self: Arc<Self>) {
        self.thread.unpark();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.thread.unpark();
    }
}

/// Drive `fut` to completion on the current OS thread, parking between
/// polls. Do not call this from a fiber (it would stall the whole
/// reactor); fibers just `.await`.
pub fn block_on<F: Future>(fut: F) -> F::Output {
    let mut fut = pin!(fut);
    let waker = Waker::from(Arc::new(ThreadWaker { thread: std::thread::current() }));
    let mut cx = Context::from_waker(&waker);
    loop {
        match fut.as_mut().poll(&mut cx) {
            Poll::Ready(v) => return v,
            // unpark() before park() leaves a token behind, so a wake
            // that races the poll is not lost.
            Poll::Pending => std::thread::park(),
        }
    }
}

/// Yield the current fiber back to its scheduler once.
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

/// Future returned by [`yield_now`].
pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            Poll::Ready(())
        } else {
            self.yielded = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_on_ready() {
        assert_eq!(block_on(async { 41 + 1 }), 42);
    }

    #[test]
    fn test_block_on_yield() {
        assert_eq!(
            block_on(async {
                yield_now().await;
                yield_now().await;
                7
            }),
            7
        );
    }
}
