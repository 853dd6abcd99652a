//! Reactor pool integration tests: thread identity, fiber joins, timers
//! and panic isolation, over both backend flavours.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use strand_core::channel::channel;
use strand_core::sync::{BlockingCounter, Done};
use strand_runtime::{
    deadline, sleep, PoolConfig, ReactorConfig, ReactorKind, ReactorPool,
};

fn pool_of(kind: ReactorKind, size: usize) -> Arc<ReactorPool> {
    ReactorPool::run(PoolConfig {
        size,
        reactor: ReactorConfig { kind, ..Default::default() },
        pin_threads: false,
    })
    .expect("pool start failed")
}

fn both_kinds() -> [ReactorKind; 2] {
    [ReactorKind::Uring, ReactorKind::Epoll]
}

#[test]
fn test_tasks_run_on_their_reactor_thread() {
    for kind in both_kinds() {
        let pool = pool_of(kind, 2);

        let ids: Arc<Mutex<HashMap<u32, ThreadId>>> = Arc::new(Mutex::new(HashMap::new()));
        {
            let ids = ids.clone();
            pool.await_on_all(move |idx, _r| {
                ids.lock().unwrap().insert(idx, std::thread::current().id());
            });
        }
        assert_eq!(ids.lock().unwrap().len(), 2);

        // 1000 fan-out tasks: each must land on the thread recorded for
        // its reactor index.
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..500 {
            let ids = ids.clone();
            let ran = ran.clone();
            pool.await_on_all(move |idx, r| {
                let expected = ids.lock().unwrap()[&idx];
                assert_eq!(expected, std::thread::current().id());
                assert_eq!(idx, r.idx());
                ran.fetch_add(1, Ordering::Relaxed);
            });
        }
        assert_eq!(ran.load(Ordering::Relaxed), 1000);
        pool.stop();
    }
}

#[test]
fn test_fiber_resumes_on_owning_reactor() {
    for kind in both_kinds() {
        let pool = pool_of(kind, 2);
        let ch = channel::<u32>(1);
        let done = Done::new();

        {
            let ch = ch.clone();
            let done = done.clone();
            pool.remote(0).spawn(move |_r| async move {
                let before = std::thread::current().id();
                let v = ch.pop().await;
                assert_eq!(v, Some(7));
                // Woken by a push from the other reactor, but still at
                // home.
                assert_eq!(before, std::thread::current().id());
                done.notify();
            });
        }
        {
            let ch = ch.clone();
            pool.remote(1).spawn(move |_r| async move {
                sleep(Duration::from_millis(20)).await;
                ch.push(7).await.unwrap();
            });
        }
        done.wait();
        pool.stop();
    }
}

#[test]
fn test_spawn_join_and_panic_isolation() {
    for kind in both_kinds() {
        let pool = pool_of(kind, 1);
        let done = Done::new();
        {
            let done = done.clone();
            pool.remote(0).spawn(move |r| async move {
                let ok = r.spawn(async { 6 * 7 });
                assert_eq!(ok.join().await.unwrap(), 42);

                let boom = r.spawn(async {
                    panic!("boom");
                });
                let err = boom.join().await.unwrap_err();
                assert!(err.to_string().contains("boom"));
                done.notify();
            });
        }
        done.wait();

        // The reactor survived the panic and still schedules fibers.
        let alive = Arc::new(AtomicBool::new(false));
        let bc = BlockingCounter::new(1);
        {
            let alive = alive.clone();
            let bc = bc.clone();
            pool.remote(0).spawn(move |_r| async move {
                alive.store(true, Ordering::Relaxed);
                bc.dec();
            });
        }
        bc.wait();
        assert!(alive.load(Ordering::Relaxed));
        pool.stop();
    }
}

#[test]
fn test_sleep_and_deadline() {
    for kind in both_kinds() {
        let pool = pool_of(kind, 1);
        let done = Done::new();
        {
            let done = done.clone();
            pool.remote(0).spawn(move |_r| async move {
                let start = Instant::now();
                sleep(Duration::from_millis(50)).await;
                assert!(start.elapsed() >= Duration::from_millis(50));

                // A pop on an empty, never-pushed channel only ends via
                // the deadline.
                let ch = channel::<u8>(1);
                let res = deadline(Duration::from_millis(20), ch.pop()).await;
                assert!(res.is_err());
                done.notify();
            });
        }
        done.wait();
        pool.stop();
    }
}

#[test]
fn test_same_deadline_sleepers_both_wake() {
    // Two fibers sleeping to the same deadline exercise the
    // no-re-arm-on-equal-deadline path; both must still wake promptly.
    for kind in both_kinds() {
        let pool = pool_of(kind, 1);
        let bc = BlockingCounter::new(2);
        let start = Instant::now();
        for _ in 0..2 {
            let bc = bc.clone();
            pool.remote(0).spawn(move |_r| async move {
                sleep(Duration::from_millis(40)).await;
                bc.dec();
            });
        }
        bc.wait();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(40));
        assert!(elapsed < Duration::from_secs(2), "sleepers stalled: {:?}", elapsed);
        pool.stop();
    }
}

#[test]
fn test_await_fiber_on_all_may_suspend() {
    for kind in both_kinds() {
        let pool = pool_of(kind, 2);
        let count = Arc::new(AtomicUsize::new(0));
        {
            let count = count.clone();
            pool.await_fiber_on_all(move |_idx, _r| {
                let count = count.clone();
                async move {
                    sleep(Duration::from_millis(10)).await;
                    count.fetch_add(1, Ordering::Relaxed);
                }
            });
        }
        assert_eq!(count.load(Ordering::Relaxed), 2);
        pool.stop();
    }
}

#[test]
fn test_cross_reactor_channel_order() {
    for kind in both_kinds() {
        let pool = pool_of(kind, 2);
        let ch = channel::<u32>(4);
        let got = Arc::new(Mutex::new(Vec::new()));
        let done = Done::new();

        {
            let ch = ch.clone();
            pool.remote(0).spawn(move |_r| async move {
                for i in 0..100 {
                    ch.push(i).await.unwrap();
                }
                ch.close();
            });
        }
        {
            let ch = ch.clone();
            let got = got.clone();
            let done = done.clone();
            pool.remote(1).spawn(move |_r| async move {
                while let Some(v) = ch.pop().await {
                    got.lock().unwrap().push(v);
                }
                done.notify();
            });
        }
        done.wait();
        assert_eq!(*got.lock().unwrap(), (0..100).collect::<Vec<_>>());
        pool.stop();
    }
}

#[test]
fn test_is_pool_thread_inside_callbacks() {
    let pool = pool_of(ReactorKind::Epoll, 2);
    assert!(!pool.is_pool_thread());
    let seen = Arc::new(AtomicUsize::new(0));
    {
        let seen = seen.clone();
        let pool2 = pool.clone();
        pool.await_on_all(move |_idx, _r| {
            assert!(pool2.is_pool_thread());
            seen.fetch_add(1, Ordering::Relaxed);
        });
    }
    assert_eq!(seen.load(Ordering::Relaxed), 2);
    pool.stop();
}

#[test]
fn test_run_on_migrates_and_returns() {
    let pool = pool_of(ReactorKind::Epoll, 2);
    let done = Done::new();
    {
        let done = done.clone();
        let target = pool.remote(1).clone();
        pool.remote(0).spawn(move |_r| async move {
            let idx = target.run_on(|r| r.idx()).await;
            assert_eq!(idx, 1);
            done.notify();
        });
    }
    done.wait();
    pool.stop();
}
