// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! TCP client connect.
//!
//! Plain connect, optional deadline, and optional first-payload via
//! TCP fast-open with a silent fallback to connect-then-send.

use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

use ember_rt::io::{sockaddr_from_std, set_nonblocking, FdConnect};
use ember_rt::{drive_io, with_timeout, Runtime};
use ember_value::{ErrorKind, RtError, RtResult};
use log::debug;

use crate::addr::Address;
use crate::stream::{StreamConfig, TcpStream};

pub struct TcpClient;

impl TcpClient {
    /// Connect to `address`, optionally bounded by `timeout`.
    pub async fn connect(
        rt: &Runtime,
        address: &Address,
        timeout: Option<Duration>,
        cfg: StreamConfig,
    ) -> RtResult<Arc<TcpStream>> {
        rt.ensure_inited()?;
        let fd = Self::socket()?;
        if let Err(e) = Self::start_connect(fd, address) {
            unsafe { libc::close(fd) };
            return Err(e);
        }
        Self::finish_connect(rt, fd, address, timeout, cfg).await
    }

    /// Connect carrying an initial payload. Fast-open sends it with the
    /// SYN when the kernel allows; otherwise it goes right after the
    /// handshake.
    pub async fn connect_with_payload(
        rt: &Runtime,
        address: &Address,
        payload: &[u8],
        timeout: Option<Duration>,
        cfg: StreamConfig,
    ) -> RtResult<Arc<TcpStream>> {
        rt.ensure_inited()?;
        let fd = Self::socket()?;
        let (raw, raw_len) = sockaddr_from_std(&address.to_v6().to_std());
        let sent = unsafe {
            libc::sendto(
                fd,
                payload.as_ptr() as *const libc::c_void,
                payload.len(),
                libc::MSG_FASTOPEN,
                &raw as *const _ as *const libc::sockaddr,
                raw_len,
            )
        };
        if sent >= 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EINPROGRESS) {
            let stream = Self::finish_connect(rt, fd, address, timeout, cfg).await?;
            if sent < 0 {
                // SYN queued without data; payload goes now.
                stream.write(payload).await?;
            } else if (sent as usize) < payload.len() {
                stream.write(&payload[sent as usize..]).await?;
            }
            return Ok(stream);
        }

        debug!("fast-open unavailable, falling back to plain connect");
        if let Err(e) = Self::start_connect(fd, address) {
            unsafe { libc::close(fd) };
            return Err(e);
        }
        let stream = Self::finish_connect(rt, fd, address, timeout, cfg).await?;
        stream.write(payload).await?;
        Ok(stream)
    }

    fn socket() -> RtResult<RawFd> {
        let fd = unsafe {
            libc::socket(
                libc::AF_INET6,
                libc::SOCK_STREAM | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
                libc::IPPROTO_TCP,
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
        Ok(fd)
    }

    fn start_connect(fd: RawFd, address: &Address) -> RtResult<()> {
        let (raw, raw_len) = sockaddr_from_std(&address.to_v6().to_std());
        let ret =
            unsafe { libc::connect(fd, &raw as *const _ as *const libc::sockaddr, raw_len) };
        if ret == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINPROGRESS) {
            return Ok(());
        }
        Err(RtError::system(err))
    }

    async fn finish_connect(
        rt: &Runtime,
        fd: RawFd,
        address: &Address,
        timeout: Option<Duration>,
        cfg: StreamConfig,
    ) -> RtResult<Arc<TcpStream>> {
        set_nonblocking(fd).map_err(RtError::system)?;
        let wait = FdConnect::new(fd, rt.reactor().clone());
        let connected = match timeout {
            Some(limit) => match with_timeout(limit, wait).await? {
                Some(io) => io.map_err(RtError::from),
                None => {
                    unsafe { libc::close(fd) };
                    return Err(RtError::new(ErrorKind::System, "connect timed out"));
                }
            },
            None => drive_io(wait).await,
        };
        if let Err(e) = connected {
            unsafe { libc::close(fd) };
            return Err(e);
        }

        // Recover the local endpoint for the handle.
        let mut bound: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut bound_len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let local = if unsafe {
            libc::getsockname(fd, &mut bound as *mut _ as *mut libc::sockaddr, &mut bound_len)
        } == 0
        {
            Address::from_std(ember_rt::io::sockaddr_to_std(&bound))
        } else {
            *address
        };
        Ok(TcpStream::from_fd(rt, fd, *address, local, &cfg))
    }
}
