//! Eventfd-based cross-thread wakeups.
//!
//! Multiple notifies before the reactor drains the fd coalesce into a
//! single wakeup, so a remote wake costs at most one spurious loop
//! iteration.

use std::os::unix::io::RawFd;

use strand_core::{Error, Result};

pub(crate) struct Notifier {
    fd: RawFd,
}

// Safety: eventfd reads/writes are atomic; the fd lives as long as the
// reactor's shared state that owns this notifier.
unsafe impl Send for Notifier {}
unsafe impl Sync for Notifier {}

impl Notifier {
    pub fn create() -> Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(Error::Resource("eventfd creation failed"));
        }
        Ok(Self { fd })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn notify(&self) {
        let val: u64 = 1;
        let ret = unsafe {
            libc::write(self.fd, &val as *const u64 as *const libc::c_void, std::mem::size_of::<u64>())
        };
        if ret < 0 {
            let errno = unsafe { *libc::__errno_location() };
            // EAGAIN: counter saturated, a wake is already pending.
            if errno != libc::EAGAIN {
                tracing::warn!(errno, "reactor notify failed");
            }
        }
    }

}

impl Drop for Notifier {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}
