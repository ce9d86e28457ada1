// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Datagram socket bound to one address.

use std::os::unix::io::RawFd;
use std::time::Duration;

use ember_rt::io::{sockaddr_from_std, sockaddr_to_std, set_nonblocking, FdRecvFrom, FdSendTo};
use ember_rt::{drive_io, with_timeout, Runtime};
use ember_value::{ErrorKind, RtError, RtResult};

use crate::addr::Address;

pub struct UdpSocket {
    fd: RawFd,
    rt: Runtime,
    timeout: Option<Duration>,
    local: Address,
}

impl UdpSocket {
    pub fn bind(rt: &Runtime, address: &Address, timeout: Option<Duration>) -> RtResult<Self> {
        rt.ensure_inited()?;
        let fd = unsafe {
            libc::socket(
                libc::AF_INET6,
                libc::SOCK_DGRAM | libc::SOCK_CLOEXEC,
                libc::IPPROTO_UDP,
            )
        };
        if fd < 0 {
            return Err(RtError::system(std::io::Error::last_os_error()));
        }
        let off: libc::c_int = 0;
        unsafe {
            libc::setsockopt(
                fd,
                libc::IPPROTO_IPV6,
                libc::IPV6_V6ONLY,
                &off as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }
        let (raw, raw_len) = sockaddr_from_std(&address.to_v6().to_std());
        if unsafe { libc::bind(fd, &raw as *const _ as *const libc::sockaddr, raw_len) } < 0 {
            let err = std::io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(RtError::system(err));
        }
        if let Err(e) = set_nonblocking(fd) {
            unsafe { libc::close(fd) };
            return Err(RtError::system(e));
        }

        let mut bound: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut bound_len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let local = if unsafe {
            libc::getsockname(fd, &mut bound as *mut _ as *mut libc::sockaddr, &mut bound_len)
        } == 0
        {
            Address::from_std(sockaddr_to_std(&bound))
        } else {
            *address
        };

        Ok(Self {
            fd,
            rt: rt.clone(),
            timeout,
            local,
        })
    }

    pub fn local_address(&self) -> Address {
        self.local
    }

    /// Receive one datagram: `(bytes_read, sender)`.
    pub async fn recv(&self, buf: &mut [u8]) -> RtResult<(usize, Address)> {
        let fut = FdRecvFrom::new(self.fd, self.rt.reactor().clone(), buf);
        let out = match self.timeout {
            Some(limit) => match with_timeout(limit, fut).await? {
                Some(io) => io.map_err(RtError::from),
                None => return Err(RtError::new(ErrorKind::System, "receive timed out")),
            },
            None => drive_io(fut).await,
        }?;
        Ok((out.0, Address::from_std(out.1)))
    }

    /// Send one datagram to `to`; returns bytes sent.
    pub async fn send(&self, buf: &[u8], to: &Address) -> RtResult<usize> {
        let fut = FdSendTo::new(self.fd, self.rt.reactor().clone(), buf, to.to_v6().to_std());
        drive_io(fut).await
    }
}

impl Drop for UdpSocket {
    fn drop(&mut self) {
        self.rt.reactor().evict(self.fd);
        unsafe { libc::close(self.fd) };
    }
}
