// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! TCP server manager.
//!
//! Owns the dual-stack listener and an acceptor-task pool. Each
//! accepted connection passes the optional filter, then a handler task
//! starts with `{stream, remote, local}`. Pausing flips the accept gate
//! without tearing the listener down.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ember_rt::io::{set_nonblocking, FdAccept};
use ember_rt::{drive_io, Runtime, Task};
use ember_value::{ErrorKind, FuncRef, RtError, RtResult, StructBody, Value};
use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

use crate::addr::Address;
use crate::stream::{ManageType, StreamConfig, TcpStream};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Disabled,
    Paused,
    Running,
    Corrupted,
}

/// Construction parameters matching the original server surface.
#[derive(Debug, Clone)]
pub struct TcpServerConfig {
    pub manage: ManageType,
    pub acceptors: usize,
    pub recv_timeout: Option<Duration>,
    pub default_buffer: usize,
    pub max_read_queue: usize,
}

impl Default for TcpServerConfig {
    fn default() -> Self {
        Self {
            manage: ManageType::Blocking,
            acceptors: 4,
            recv_timeout: None,
            default_buffer: 4096,
            max_read_queue: 10,
        }
    }
}

struct ServerInner {
    rt: Runtime,
    handler: FuncRef,
    filter: Mutex<Option<FuncRef>>,
    listen_fd: AtomicI32,
    state: Mutex<ServerState>,
    state_changed: Condvar,
    paused: AtomicBool,
    local: Address,
    config: TcpServerConfig,
}

pub struct TcpServer {
    inner: Arc<ServerInner>,
}

fn corrupted_error() -> RtError {
    RtError::new(ErrorKind::EnvironmentRuin, "server is corrupted")
}

impl TcpServer {
    /// Bind the listener. Failure leaves the server corrupted rather
    /// than panicking; `start` then reports it.
    pub fn new(
        rt: &Runtime,
        handler: FuncRef,
        address: Address,
        config: TcpServerConfig,
    ) -> RtResult<Self> {
        rt.ensure_inited()?;
        let (fd, local, state) = match Self::bind_listener(&address) {
            Ok((fd, local)) => (fd, local, ServerState::Disabled),
            Err(e) => {
                warn!("listener bind failed for {address}: {e}");
                (-1, address, ServerState::Corrupted)
            }
        };
        Ok(Self {
            inner: Arc::new(ServerInner {
                rt: rt.clone(),
                handler,
                filter: Mutex::new(None),
                listen_fd: AtomicI32::new(fd),
                state: Mutex::new(state),
                state_changed: Condvar::new(),
                paused: AtomicBool::new(false),
                local,
                config,
            }),
        })
    }

    fn bind_listener(address: &Address) -> RtResult<(RawFd, Address)> {
        let fd = unsafe {
            libc::socket(
                libc::AF_INET6,
                libc::SOCK_STREAM | libc::SOCK_CLOEXEC,
                libc::IPPROTO_TCP,
            )
        };
        if fd < 0 {
            return Err(RtError::system(std::io::Error::last_os_error()));
        }
        let close_on_err = |e: RtError| {
            unsafe { libc::close(fd) };
            Err(e)
        };

        let off: libc::c_int = 0;
        let on: libc::c_int = 1;
        unsafe {
            // Dual-stack v6 listener; v4 arrives as v4-mapped.
            libc::setsockopt(
                fd,
                libc::IPPROTO_IPV6,
                libc::IPV6_V6ONLY,
                &off as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &on as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
            // Fast-open is best effort; absence is not fatal.
            let qlen: libc::c_int = 16;
            let ret = libc::setsockopt(
                fd,
                libc::IPPROTO_TCP,
                libc::TCP_FASTOPEN,
                &qlen as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
            if ret < 0 {
                debug!("TCP_FASTOPEN unavailable: {}", std::io::Error::last_os_error());
            }
        }

        let v6 = address.to_v6();
        let (raw, raw_len) = ember_rt::io::sockaddr_from_std(&v6.to_std());
        if unsafe { libc::bind(fd, &raw as *const _ as *const libc::sockaddr, raw_len) } < 0 {
            return close_on_err(RtError::system(std::io::Error::last_os_error()));
        }
        if let Err(e) = set_nonblocking(fd) {
            return close_on_err(RtError::system(e));
        }

        // Read back the bound port (useful with port 0).
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
        Ok((fd, local))
    }

    pub fn state(&self) -> ServerState {
        *self.inner.state.lock()
    }

    pub fn is_corrupted(&self) -> bool {
        self.state() == ServerState::Corrupted
    }

    pub fn local_address(&self) -> Address {
        self.inner.local
    }

    pub fn set_accept_filter(&self, filter: Option<FuncRef>) {
        *self.inner.filter.lock() = filter;
    }

    /// Listen and post the acceptor pool; `disabled → running`.
    pub fn start(&self) -> RtResult<()> {
        let inner = &self.inner;
        {
            let mut state = inner.state.lock();
            match *state {
                ServerState::Corrupted => return Err(corrupted_error()),
                ServerState::Running | ServerState::Paused => return Ok(()),
                ServerState::Disabled => {}
            }
            let fd = inner.listen_fd.load(Ordering::Acquire);
            if unsafe { libc::listen(fd, 128) } < 0 {
                *state = ServerState::Corrupted;
                return Err(RtError::system(std::io::Error::last_os_error()));
            }
            *state = ServerState::Running;
            inner.state_changed.notify_all();
        }

        for n in 0..inner.config.acceptors.max(1) {
            let server = inner.clone();
            let task = Task::from_future(Box::pin(async move {
                acceptor_loop(server, n).await;
                Ok(Value::None)
            }));
            task.start(&inner.rt)?;
        }
        debug!(
            "server on {} running with {} acceptors",
            inner.local, inner.config.acceptors
        );
        Ok(())
    }

    /// Gate new connections without tearing the listener down; paused
    /// connections are accepted and immediately closed.
    pub fn pause(&self) -> RtResult<()> {
        if self.is_corrupted() {
            return Err(corrupted_error());
        }
        self.inner.paused.store(true, Ordering::Release);
        let mut state = self.inner.state.lock();
        if *state == ServerState::Running {
            *state = ServerState::Paused;
            self.inner.state_changed.notify_all();
        }
        Ok(())
    }

    pub fn resume(&self) -> RtResult<()> {
        if self.is_corrupted() {
            return Err(corrupted_error());
        }
        self.inner.paused.store(false, Ordering::Release);
        let mut state = self.inner.state.lock();
        if *state == ServerState::Paused {
            *state = ServerState::Running;
            self.inner.state_changed.notify_all();
        }
        Ok(())
    }

    /// Close the listener and wake `_await` callers.
    pub fn shutdown(&self) {
        let fd = self.inner.listen_fd.swap(-1, Ordering::AcqRel);
        if fd >= 0 {
            // Wake parked acceptors so they observe the closed listener.
            self.inner.rt.reactor().evict(fd);
            unsafe { libc::close(fd) };
        }
        let mut state = self.inner.state.lock();
        if *state != ServerState::Corrupted {
            *state = ServerState::Disabled;
        }
        self.inner.state_changed.notify_all();
    }

    /// Block the calling thread until the server is disabled.
    pub fn _await(&self) {
        let mut state = self.inner.state.lock();
        while !matches!(*state, ServerState::Disabled | ServerState::Corrupted) {
            self.inner.state_changed.wait(&mut state);
        }
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn acceptor_loop(server: Arc<ServerInner>, n: usize) {
    debug!("acceptor {n} on {}", server.local);
    loop {
        let fd = server.listen_fd.load(Ordering::Acquire);
        if fd < 0 {
            return;
        }
        let accepted = drive_io(FdAccept::new(fd, server.rt.reactor().clone())).await;
        let (client_fd, remote_std) = match accepted {
            Ok(pair) => pair,
            Err(e) if e.is_cancellation() => return,
            Err(_) => {
                // Listener closed under us.
                if server.listen_fd.load(Ordering::Acquire) < 0 {
                    return;
                }
                continue;
            }
        };
        let remote = Address::from_std(remote_std);

        if server.paused.load(Ordering::Acquire) {
            unsafe { libc::close(client_fd) };
            continue;
        }

        let filter = server.filter.lock().clone();
        if let Some(filter) = filter {
            let verdict = filter
                .call(Value::Array(vec![
                    Value::Str(remote.full_address()),
                    Value::Str(server.local.full_address()),
                ]))
                .await;
            let rejected = !matches!(verdict, Ok(v) if v.as_bool().unwrap_or(false));
            if rejected {
                debug!("filter rejected {remote}");
                unsafe { libc::close(client_fd) };
                continue;
            }
        }

        let cfg = StreamConfig {
            buffer_size: server.config.default_buffer,
            max_read_queue: server.config.max_read_queue,
            recv_timeout: server.config.recv_timeout,
            manage: server.config.manage,
        };
        let stream = TcpStream::from_fd(&server.rt, client_fd, remote, server.local, &cfg);

        let args = Value::Array(vec![
            Value::Struct(stream as Arc<dyn StructBody>),
            Value::Str(remote.full_address()),
            Value::Str(server.local.full_address()),
        ]);
        let task = Task::new(server.handler.clone(), args);
        if let Err(e) = task.start(&server.rt) {
            warn!("handler task failed to start: {e}");
        }
    }
}
