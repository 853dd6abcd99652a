//! Fixed-size pool of reactors, one per OS thread.
//!
//! Threads are named `strand-N` and pinned to CPU N by default. The
//! fan-out primitives come in three shapes:
//!
//! - [`ReactorPool::await_on_all`]: run a brief closure inline in every
//!   drive loop and wait for all of them. The closure must not suspend.
//! - [`ReactorPool::await_fiber_on_all`]: spawn a fiber per reactor and
//!   wait; the fiber may suspend (join handles, channels, sockets).
//! - [`ReactorPool::dispatch_on_all`]: fire-and-forget variant.
//!
//! Calling either waiting variant from one of the pool's own reactor
//! threads would deadlock the caller against itself, so it panics.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;

use strand_core::sync::BlockingCounter;
use strand_core::{Error, Result};

use crate::reactor::{Reactor, ReactorConfig, Remote};

pub struct PoolConfig {
    /// Number of reactors; 0 means one per available core.
    pub size: usize,
    pub reactor: ReactorConfig,
    /// Pin reactor N to CPU N (mod core count).
    pub pin_threads: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { size: 0, reactor: ReactorConfig::default(), pin_threads: true }
    }
}

pub struct ReactorPool {
    remotes: Vec<Remote>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    rr: AtomicUsize,
}

impl ReactorPool {
    /// Start `config.size` reactor threads and wait until every reactor
    /// is live. Ring/epoll setup failures abort the whole pool.
    pub fn run(config: PoolConfig) -> Result<Arc<ReactorPool>> {
        let size = if config.size == 0 {
            thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        } else {
            config.size
        };
        let ncpu = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);

        let (tx, rx) = mpsc::channel::<Result<Remote>>();
        let mut threads = Vec::with_capacity(size);
        for i in 0..size {
            let tx = tx.clone();
            let reactor_cfg = config.reactor;
            let pin = config.pin_threads;
            let handle = thread::Builder::new()
                .name(format!("strand-{}", i))
                .spawn(move || {
                    if pin {
                        pin_to_cpu(i % ncpu);
                    }
                    match Reactor::new(i as u32, &reactor_cfg) {
                        Ok(reactor) => {
                            let _ = tx.send(Ok(reactor.remote()));
                            reactor.run();
                        }
                        Err(e) => {
                            let _ = tx.send(Err(e));
                        }
                    }
                })
                .map_err(|_| Error::Resource("failed to spawn reactor thread"))?;
            threads.push(handle);
        }
        drop(tx);

        let mut remotes: Vec<Option<Remote>> = (0..size).map(|_| None).collect();
        let mut first_err = None;
        for _ in 0..size {
            match rx.recv() {
                Ok(Ok(remote)) => {
                    let idx = remote.idx() as usize;
                    remotes[idx] = Some(remote);
                }
                Ok(Err(e)) => first_err = Some(e),
                Err(_) => first_err = Some(Error::Internal("reactor thread died during startup".into())),
            }
        }
        if let Some(e) = first_err {
            for remote in remotes.iter().flatten() {
                remote.stop();
            }
            for handle in threads {
                let _ = handle.join();
            }
            return Err(e);
        }

        let pool = Arc::new(ReactorPool {
            remotes: remotes.into_iter().map(|r| r.expect("missing reactor remote")).collect(),
            threads: Mutex::new(threads),
            rr: AtomicUsize::new(0),
        });
        tracing::info!(size, kind = ?config.reactor.kind, "reactor pool running");
        Ok(pool)
    }

    pub fn size(&self) -> usize {
        self.remotes.len()
    }

    pub fn remote(&self, idx: usize) -> &Remote {
        &self.remotes[idx]
    }

    /// Round-robin selection.
    pub fn next(&self) -> &Remote {
        let idx = self.rr.fetch_add(1, Ordering::Relaxed) % self.remotes.len();
        &self.remotes[idx]
    }

    pub fn is_pool_thread(&self) -> bool {
        self.remotes.iter().any(|r| r.is_reactor_thread())
    }

    /// Run `f(index, reactor)` inline in every drive loop; wait for all.
    pub fn await_on_all<F>(&self, f: F)
    where
        F: Fn(u32, &Reactor) + Send + Sync + 'static,
    {
        self.assert_not_pool_thread("await_on_all");
        let f = Arc::new(f);
        let bc = BlockingCounter::new(self.remotes.len() as u64);
        for remote in &self.remotes {
            let f = f.clone();
            let bc = bc.clone();
            remote.post(move |r| {
                f(r.idx(), r);
                bc.dec();
            });
        }
        bc.wait();
    }

    /// Spawn a fiber per reactor running `f(index, reactor)`; wait until
    /// every fiber finishes. The fibers may suspend.
    pub fn await_fiber_on_all<F, Fut>(&self, f: F)
    where
        F: Fn(u32, Reactor) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        self.assert_not_pool_thread("await_fiber_on_all");
        let f = Arc::new(f);
        let bc = BlockingCounter::new(self.remotes.len() as u64);
        for remote in &self.remotes {
            let f = f.clone();
            let bc = bc.clone();
            remote.post(move |r| {
                let fut = f(r.idx(), r.clone());
                r.spawn_detached(async move {
                    fut.await;
                    bc.dec();
                });
            });
        }
        bc.wait();
    }

    /// Non-blocking fan-out: returns after dispatch.
    pub fn dispatch_on_all<F>(&self, f: F)
    where
        F: Fn(u32, &Reactor) + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        for remote in &self.remotes {
            let f = f.clone();
            remote.post(move |r| f(r.idx(), r));
        }
    }

    fn assert_not_pool_thread(&self, what: &str) {
        assert!(
            !self.is_pool_thread(),
            "ReactorPool::{} called from a pool reactor thread; use dispatch_on_all",
            what
        );
    }

    /// Stop every reactor and join the threads. Idempotent.
    pub fn stop(&self) {
        for remote in &self.remotes {
            remote.stop();
        }
        let mut threads = self.threads.lock().expect("pool threads poisoned");
        for handle in threads.drain(..) {
            if let Err(e) = handle.join() {
                tracing::error!(?e, "reactor thread panicked");
            }
        }
    }
}

impl Drop for ReactorPool {
    fn drop(&mut self) {
        self.stop();
    }
}

fn pin_to_cpu(cpu: usize) {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
        let rc = libc::pthread_setaffinity_np(
            libc::pthread_self(),
            std::mem::size_of::<libc::cpu_set_t>(),
            &set,
        );
        if rc != 0 {
            tracing::warn!(cpu, rc, "pthread_setaffinity_np failed");
        }
    }
}
