//! Fiber sockets.
//!
//! A `FiberSocket` is owned by exactly one reactor and is `!Send`, so
//! the compiler enforces the data-partitioning invariant: only fibers of
//! the owning reactor touch it. Moving a connection to another reactor
//! happens as a raw fd through [`AcceptedSocket`].

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::unix::io::RawFd;

use strand_core::{Error, Result};
use strand_runtime::Reactor;

fn last_errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

fn set_nodelay(fd: RawFd) {
    let opt: i32 = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            &opt as *const _ as *const libc::c_void,
            std::mem::size_of::<i32>() as libc::socklen_t,
        );
    }
}

fn sockaddr_v4(addr: SocketAddrV4) -> libc::sockaddr_in {
    let mut sin: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    sin.sin_family = libc::AF_INET as libc::sa_family_t;
    sin.sin_port = addr.port().to_be();
    sin.sin_addr.s_addr = u32::from_ne_bytes(addr.ip().octets());
    sin
}

/// Bind and listen on `port` (0 lets the kernel pick). Plain syscalls:
/// no reactor needed, callable from any thread before the pool runs.
/// Returns the fd and the bound port.
pub fn bind_listener(port: u16, backlog: u32) -> Result<(RawFd, u16)> {
    let fd = unsafe {
        libc::socket(
            libc::AF_INET,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if fd < 0 {
        return Err(Error::Resource("socket creation failed"));
    }

    let opt: i32 = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &opt as *const _ as *const libc::c_void,
            std::mem::size_of::<i32>() as libc::socklen_t,
        );
    }

    let addr = sockaddr_v4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
    let ret = unsafe {
        libc::bind(
            fd,
            &addr as *const _ as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        let errno = last_errno();
        unsafe { libc::close(fd) };
        tracing::error!(port, errno, "bind failed");
        return Err(Error::Io(errno));
    }

    if unsafe { libc::listen(fd, backlog as i32) } != 0 {
        let errno = last_errno();
        unsafe { libc::close(fd) };
        return Err(Error::Io(errno));
    }

    Ok((fd, local_port(fd)?))
}

fn local_port(fd: RawFd) -> Result<u16> {
    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockname(fd, &mut addr as *mut _ as *mut libc::sockaddr, &mut len)
    };
    if ret != 0 {
        return Err(Error::Io(last_errno()));
    }
    Ok(u16::from_be(addr.sin_port))
}

/// An accepted connection that has not been bound to a reactor yet.
/// `Send`, so the accept fiber can hand it to the target reactor.
pub struct AcceptedSocket {
    fd: RawFd,
}

// Safety: only the raw fd crosses threads; all I/O state is created by
// `into_socket` on the owning reactor.
unsafe impl Send for AcceptedSocket {}

impl AcceptedSocket {
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Bind to the target reactor, enabling TCP_NODELAY.
    pub fn into_socket(self, reactor: &Reactor) -> FiberSocket {
        let fd = self.fd;
        std::mem::forget(self);
        set_nodelay(fd);
        FiberSocket { fd, reactor: reactor.clone() }
    }
}

impl Drop for AcceptedSocket {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

/// A non-blocking TCP socket bound to one reactor.
pub struct FiberSocket {
    fd: RawFd,
    reactor: Reactor,
}

impl FiberSocket {
    /// Adopt an fd already owned by this reactor's thread.
    pub fn from_raw(reactor: &Reactor, fd: RawFd) -> Self {
        Self { fd, reactor: reactor.clone() }
    }

    /// Listening socket on `port` (0 = kernel-assigned). Returns the
    /// socket and the bound port.
    pub fn listen(reactor: &Reactor, port: u16, backlog: u32) -> Result<(Self, u16)> {
        let (fd, bound) = bind_listener(port, backlog)?;
        Ok((Self::from_raw(reactor, fd), bound))
    }

    /// Connect to `addr`, suspending until the handshake finishes.
    pub async fn connect(reactor: &Reactor, addr: SocketAddr) -> Result<Self> {
        let SocketAddr::V4(v4) = addr else {
            return Err(Error::Resource("only AF_INET endpoints supported"));
        };
        let fd = unsafe {
            libc::socket(
                libc::AF_INET,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
            )
        };
        if fd < 0 {
            return Err(Error::Resource("socket creation failed"));
        }
        let sock = Self::from_raw(reactor, fd);

        let sin = sockaddr_v4(v4);
        let ret = unsafe {
            libc::connect(
                fd,
                &sin as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if ret == 0 {
            set_nodelay(fd);
            return Ok(sock);
        }
        let errno = last_errno();
        if errno != libc::EINPROGRESS {
            return Err(Error::Io(errno));
        }
        reactor.writable(fd).await?;

        // The handshake outcome lands in SO_ERROR.
        let mut err: i32 = 0;
        let mut len = std::mem::size_of::<i32>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut err as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };
        if ret != 0 {
            return Err(Error::Io(last_errno()));
        }
        if err != 0 {
            return Err(Error::Io(err));
        }
        set_nodelay(fd);
        Ok(sock)
    }

    /// Accept one connection, suspending until a client arrives.
    pub async fn accept(&self) -> Result<AcceptedSocket> {
        loop {
            let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
            let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
            let res = unsafe {
                libc::accept4(
                    self.fd,
                    &mut addr as *mut _ as *mut libc::sockaddr,
                    &mut len,
                    libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                )
            };
            if res >= 0 {
                return Ok(AcceptedSocket { fd: res });
            }
            match last_errno() {
                libc::EAGAIN => self.reactor.readable(self.fd).await?,
                libc::EINTR => {}
                e => return Err(Error::Io(e)),
            }
        }
    }

    /// Read into `buf`. EOF is reported as `Err(Eof)`, distinct from
    /// transport failures.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let n = self.reactor.recv(self.fd, buf).await?;
        if n == 0 {
            return Err(Error::Eof);
        }
        Ok(n)
    }

    /// Write from `buf`; may be short.
    pub async fn write(&self, buf: &[u8]) -> Result<usize> {
        self.reactor.send(self.fd, buf).await
    }

    pub async fn write_all(&self, buf: &[u8]) -> Result<()> {
        let mut off = 0;
        while off < buf.len() {
            let n = self.write(&buf[off..]).await?;
            if n == 0 {
                return Err(Error::Eof);
            }
            off += n;
        }
        Ok(())
    }

    /// Half-close both directions; pending reads unblock with EOF.
    pub fn shutdown(&self) -> Result<()> {
        let ret = unsafe { libc::shutdown(self.fd, libc::SHUT_RDWR) };
        if ret != 0 {
            return Err(Error::Io(last_errno()));
        }
        Ok(())
    }

    pub fn local_port(&self) -> Result<u16> {
        local_port(self.fd)
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn reactor(&self) -> &Reactor {
        &self.reactor
    }

    /// Release ownership of the fd without closing it.
    pub fn into_raw(self) -> RawFd {
        let fd = self.fd;
        std::mem::forget(self);
        fd
    }

    /// Close explicitly; equivalent to drop.
    pub fn close(self) {}
}

impl Drop for FiberSocket {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}
