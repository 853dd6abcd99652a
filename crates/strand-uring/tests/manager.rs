//! Manager integration tests over a unix socketpair.

use std::cell::RefCell;
use std::rc::Rc;

use io_uring::{opcode, types};
use strand_uring::{UringManager, UringManagerConfig};

fn socketpair() -> (i32, i32) {
    let mut fds = [0i32; 2];
    let ret = unsafe {
        libc::socketpair(
            libc::AF_UNIX,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
            fds.as_mut_ptr(),
        )
    };
    assert_eq!(ret, 0, "socketpair failed");
    (fds[0], fds[1])
}

fn write_all(fd: i32, data: &[u8]) {
    let ret = unsafe { libc::write(fd, data.as_ptr() as *const libc::c_void, data.len()) };
    assert_eq!(ret as usize, data.len());
}

#[test]
fn test_oneshot_recv_callback() {
    let (a, b) = socketpair();
    let mut mgr = UringManager::new(UringManagerConfig { ring_depth: 64, wake_fd: None }).unwrap();

    write_all(a, b"hello");

    let got: Rc<RefCell<Option<Vec<u8>>>> = Rc::new(RefCell::new(None));
    let mut buf = vec![0u8; 64];
    let entry = opcode::Recv::new(types::Fd(b), buf.as_mut_ptr(), buf.len() as u32).build();
    let buf_ptr = buf.as_ptr();
    {
        let got = got.clone();
        mgr.submit_op(entry, move |res, _flags, _mgr| {
            assert!(res > 0, "recv failed: {}", res);
            let data = unsafe { std::slice::from_raw_parts(buf_ptr, res as usize) };
            *got.borrow_mut() = Some(data.to_vec());
        })
        .unwrap();
    }

    while got.borrow().is_none() {
        mgr.submit_and_wait_dispatch(1).unwrap();
    }
    assert_eq!(got.borrow().clone().unwrap(), b"hello");

    unsafe {
        libc::close(a);
        libc::close(b);
    }
}

#[test]
fn test_fdevent_persists_across_polls() {
    let (a, b) = socketpair();
    let mut mgr = UringManager::new(UringManagerConfig { ring_depth: 64, wake_fd: None }).unwrap();

    let fired = Rc::new(RefCell::new(0u32));
    let ev = {
        let fired = fired.clone();
        mgr.assign(b, move |res, _mgr| {
            assert!(res >= 0);
            let mut buf = [0u8; 16];
            let n = unsafe { libc::read(b, buf.as_mut_ptr() as *mut libc::c_void, 16) };
            assert!(n > 0);
            *fired.borrow_mut() += 1;
        })
    };

    for round in 1..=3u32 {
        mgr.add_poll_in(&ev).unwrap();
        write_all(a, b"x");
        while *fired.borrow() < round {
            mgr.submit_and_wait_dispatch(1).unwrap();
        }
    }
    assert_eq!(*fired.borrow(), 3);

    mgr.release(&ev);
    unsafe {
        libc::close(a);
        libc::close(b);
    }
}

#[test]
fn test_linked_submissions_halve_wakeups() {
    let (a, b) = socketpair();
    let mut mgr = UringManager::new(UringManagerConfig { ring_depth: 256, wake_fd: None }).unwrap();

    const EXCHANGES: u64 = 200;
    let mut buf = vec![0u8; 16];
    let done = Rc::new(RefCell::new(false));

    for _ in 0..EXCHANGES {
        write_all(a, b"ping");
        *done.borrow_mut() = false;
        let poll = opcode::PollAdd::new(types::Fd(b), libc::POLLIN as u32).build();
        let recv = opcode::Recv::new(types::Fd(b), buf.as_mut_ptr(), buf.len() as u32).build();
        {
            let done = done.clone();
            mgr.submit_linked(poll, recv, move |res, _flags, _mgr| {
                assert_eq!(res, 4, "recv result {}", res);
                *done.borrow_mut() = true;
            })
            .unwrap();
        }
        while !*done.borrow() {
            mgr.submit_and_wait_dispatch(1).unwrap();
        }
    }

    // Each exchange costs the linked pair's two CQEs at most; linking
    // avoids a separate wake per stage. Allow a small constant for the
    // eventfd sentinel plumbing.
    assert!(
        mgr.completions_seen() <= 2 * EXCHANGES + 8,
        "too many completions: {}",
        mgr.completions_seen()
    );

    unsafe {
        libc::close(a);
        libc::close(b);
    }
}

#[test]
fn test_ring_capacity_is_visible() {
    let mgr = UringManager::new(UringManagerConfig::default()).unwrap();
    assert!(mgr.capacity() >= 4096);
    assert!(mgr.has_room());
}
