// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Non-blocking syscall futures.
//!
//! Each future tries the syscall first; on `EWOULDBLOCK` it registers
//! with the reactor and parks the task. A wake retries. The caller owns
//! the buffer for the whole await, so the borrow stays safe.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use crate::reactor::{Interest, Reactor};

/// Put `fd` into non-blocking mode.
pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn would_block(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
}

fn interrupted(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::Interrupted
}

/// Shared park-retry plumbing for one fd.
struct Registered {
    reactor: Arc<Reactor>,
    fd: RawFd,
    active: bool,
}

impl Registered {
    fn new(reactor: Arc<Reactor>, fd: RawFd) -> Self {
        Self {
            reactor,
            fd,
            active: false,
        }
    }

    fn park(&mut self, interest: Interest, cx: &Context<'_>) -> io::Result<()> {
        // Re-registering refreshes the waker after a worker migration.
        self.reactor.register(self.fd, interest, cx.waker().clone())?;
        self.active = true;
        Ok(())
    }

    fn finish(&mut self) {
        if self.active {
            let _ = self.reactor.deregister(self.fd);
            self.active = false;
        }
    }
}

impl Drop for Registered {
    fn drop(&mut self) {
        self.finish();
    }
}

pub struct FdRead<'a> {
    buf: &'a mut [u8],
    reg: Registered,
}

impl<'a> FdRead<'a> {
    pub fn new(fd: RawFd, reactor: Arc<Reactor>, buf: &'a mut [u8]) -> Self {
        Self {
            buf,
            reg: Registered::new(reactor, fd),
        }
    }
}

impl Future for FdRead<'_> {
    type Output = io::Result<usize>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        loop {
            let n = unsafe {
                libc::read(
                    this.reg.fd,
                    this.buf.as_mut_ptr() as *mut libc::c_void,
                    this.buf.len(),
                )
            };
            if n >= 0 {
                this.reg.finish();
                return Poll::Ready(Ok(n as usize));
            }
            let err = io::Error::last_os_error();
            if interrupted(&err) {
                continue;
            }
            if would_block(&err) {
                if let Err(e) = this.reg.park(Interest::Readable, cx) {
                    return Poll::Ready(Err(e));
                }
                return Poll::Pending;
            }
            this.reg.finish();
            return Poll::Ready(Err(err));
        }
    }
}

pub struct FdWrite<'a> {
    buf: &'a [u8],
    reg: Registered,
}

impl<'a> FdWrite<'a> {
    pub fn new(fd: RawFd, reactor: Arc<Reactor>, buf: &'a [u8]) -> Self {
        Self {
            buf,
            reg: Registered::new(reactor, fd),
        }
    }
}

impl Future for FdWrite<'_> {
    type Output = io::Result<usize>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        loop {
            let n = unsafe {
                libc::write(
                    this.reg.fd,
                    this.buf.as_ptr() as *const libc::c_void,
                    this.buf.len(),
                )
            };
            if n >= 0 {
                this.reg.finish();
                return Poll::Ready(Ok(n as usize));
            }
            let err = io::Error::last_os_error();
            if interrupted(&err) {
                continue;
            }
            if would_block(&err) {
                if let Err(e) = this.reg.park(Interest::Writable, cx) {
                    return Poll::Ready(Err(e));
                }
                return Poll::Pending;
            }
            this.reg.finish();
            return Poll::Ready(Err(err));
        }
    }
}

pub struct FdAccept {
    reg: Registered,
}

impl FdAccept {
    pub fn new(fd: RawFd, reactor: Arc<Reactor>) -> Self {
        Self {
            reg: Registered::new(reactor, fd),
        }
    }
}

impl Future for FdAccept {
    type Output = io::Result<(RawFd, SocketAddr)>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        loop {
            let mut addr: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
            let mut addrlen = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            let client = unsafe {
                libc::accept4(
                    this.reg.fd,
                    &mut addr as *mut _ as *mut libc::sockaddr,
                    &mut addrlen,
                    libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                )
            };
            if client >= 0 {
                this.reg.finish();
                return Poll::Ready(Ok((client, sockaddr_to_std(&addr))));
            }
            let err = io::Error::last_os_error();
            if interrupted(&err) {
                continue;
            }
            if would_block(&err) {
                if let Err(e) = this.reg.park(Interest::Readable, cx) {
                    return Poll::Ready(Err(e));
                }
                return Poll::Pending;
            }
            this.reg.finish();
            return Poll::Ready(Err(err));
        }
    }
}

/// Completes a non-blocking `connect`. The initial syscall happens
/// before construction; this future waits for writability and then
/// reads `SO_ERROR`.
pub struct FdConnect {
    reg: Registered,
    submitted: bool,
}

impl FdConnect {
    pub fn new(fd: RawFd, reactor: Arc<Reactor>) -> Self {
        Self {
            reg: Registered::new(reactor, fd),
            submitted: false,
        }
    }
}

impl Future for FdConnect {
    type Output = io::Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if !this.submitted {
            this.submitted = true;
            if let Err(e) = this.reg.park(Interest::Writable, cx) {
                return Poll::Ready(Err(e));
            }
            return Poll::Pending;
        }
        this.reg.finish();

        let mut err_code: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockopt(
                this.reg.fd,
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut err_code as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };
        if ret < 0 {
            return Poll::Ready(Err(io::Error::last_os_error()));
        }
        if err_code != 0 {
            return Poll::Ready(Err(io::Error::from_raw_os_error(err_code)));
        }
        Poll::Ready(Ok(()))
    }
}

pub struct FdRecvFrom<'a> {
    buf: &'a mut [u8],
    reg: Registered,
}

impl<'a> FdRecvFrom<'a> {
    pub fn new(fd: RawFd, reactor: Arc<Reactor>, buf: &'a mut [u8]) -> Self {
        Self {
            buf,
            reg: Registered::new(reactor, fd),
        }
    }
}

impl Future for FdRecvFrom<'_> {
    type Output = io::Result<(usize, SocketAddr)>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        loop {
            let mut addr: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
            let mut addrlen = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            let n = unsafe {
                libc::recvfrom(
                    this.reg.fd,
                    this.buf.as_mut_ptr() as *mut libc::c_void,
                    this.buf.len(),
                    0,
                    &mut addr as *mut _ as *mut libc::sockaddr,
                    &mut addrlen,
                )
            };
            if n >= 0 {
                this.reg.finish();
                return Poll::Ready(Ok((n as usize, sockaddr_to_std(&addr))));
            }
            let err = io::Error::last_os_error();
            if interrupted(&err) {
                continue;
            }
            if would_block(&err) {
                if let Err(e) = this.reg.park(Interest::Readable, cx) {
                    return Poll::Ready(Err(e));
                }
                return Poll::Pending;
            }
            this.reg.finish();
            return Poll::Ready(Err(err));
        }
    }
}

pub struct FdSendTo<'a> {
    buf: &'a [u8],
    to: SocketAddr,
    reg: Registered,
}

impl<'a> FdSendTo<'a> {
    pub fn new(fd: RawFd, reactor: Arc<Reactor>, buf: &'a [u8], to: SocketAddr) -> Self {
        Self {
            buf,
            to,
            reg: Registered::new(reactor, fd),
        }
    }
}

impl Future for FdSendTo<'_> {
    type Output = io::Result<usize>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let (addr, addrlen) = sockaddr_from_std(&this.to);
        loop {
            let n = unsafe {
                libc::sendto(
                    this.reg.fd,
                    this.buf.as_ptr() as *const libc::c_void,
                    this.buf.len(),
                    0,
                    &addr as *const _ as *const libc::sockaddr,
                    addrlen,
                )
            };
            if n >= 0 {
                this.reg.finish();
                return Poll::Ready(Ok(n as usize));
            }
            let err = io::Error::last_os_error();
            if interrupted(&err) {
                continue;
            }
            if would_block(&err) {
                if let Err(e) = this.reg.park(Interest::Writable, cx) {
                    return Poll::Ready(Err(e));
                }
                return Poll::Pending;
            }
            this.reg.finish();
            return Poll::Ready(Err(err));
        }
    }
}

/// Decode a kernel sockaddr into a std address.
pub fn sockaddr_to_std(addr: &libc::sockaddr_storage) -> SocketAddr {
    match addr.ss_family as i32 {
        libc::AF_INET => {
            let a4 = unsafe { &*(addr as *const _ as *const libc::sockaddr_in) };
            let ip = std::net::Ipv4Addr::from(u32::from_be(a4.sin_addr.s_addr));
            SocketAddr::V4(std::net::SocketAddrV4::new(ip, u16::from_be(a4.sin_port)))
        }
        libc::AF_INET6 => {
            let a6 = unsafe { &*(addr as *const _ as *const libc::sockaddr_in6) };
            let ip = std::net::Ipv6Addr::from(a6.sin6_addr.s6_addr);
            SocketAddr::V6(std::net::SocketAddrV6::new(
                ip,
                u16::from_be(a6.sin6_port),
                a6.sin6_flowinfo,
                a6.sin6_scope_id,
            ))
        }
        _ => SocketAddr::V4(std::net::SocketAddrV4::new(
            std::net::Ipv4Addr::UNSPECIFIED,
            0,
        )),
    }
}

/// Encode a std address into kernel form.
pub fn sockaddr_from_std(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    match addr {
        SocketAddr::V4(a4) => {
            let out = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in) };
            out.sin_family = libc::AF_INET as libc::sa_family_t;
            out.sin_port = a4.port().to_be();
            out.sin_addr.s_addr = u32::from(*a4.ip()).to_be();
            (storage, std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(a6) => {
            let out = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in6) };
            out.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            out.sin6_port = a6.port().to_be();
            out.sin6_addr.s6_addr = a6.ip().octets();
            out.sin6_flowinfo = a6.flowinfo();
            out.sin6_scope_id = a6.scope_id();
            (
                storage,
                std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
            )
        }
    }
}
