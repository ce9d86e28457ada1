// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Connection-oriented stream handle.
//!
//! One fixed buffer serves the in-flight submission; buffered chunks
//! queue in the read FIFO, user writes in the write FIFO. Public
//! operations serialize through the handle's task mutex, so at most one
//! submission is in flight. An invalidated handle keeps its error kind;
//! later operations observe it instead of touching the socket.

use std::collections::VecDeque;
use std::fs::File;
use std::future::Future;
use std::os::unix::io::{AsRawFd, RawFd};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use ember_rt::io::FdRead;
use ember_rt::reactor::{Interest, Reactor};
use ember_rt::{drive_io, with_timeout, Runtime};
use ember_value::{RtError, RtResult, StructBody};
use log::debug;
use parking_lot::Mutex;

use crate::addr::Address;

/// What invalidated the handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamError {
    None,
    RemoteClose,
    LocalClose,
    LocalReset,
    ReadQueueOverflow,
    InvalidState,
    UndefinedError,
}

/// Current submission kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    Accept,
    Read,
    Write,
    TransmitFile,
    InternalRead,
    InternalClose,
}

/// Write scheduling policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ManageType {
    /// Writes drain opportunistically as they are queued.
    #[default]
    Blocking,
    /// Writes only queue; the FIFO drains on reads, force_write, close.
    WriteDelayed,
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub buffer_size: usize,
    pub max_read_queue: usize,
    pub recv_timeout: Option<Duration>,
    pub manage: ManageType,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            buffer_size: 4096,
            max_read_queue: 10,
            recv_timeout: None,
            manage: ManageType::Blocking,
        }
    }
}

/// Map an OS failure onto the handle error table. `None` means retry.
fn classify(err: &std::io::Error) -> Option<StreamError> {
    match err.raw_os_error() {
        Some(libc::ECONNRESET) => Some(StreamError::RemoteClose),
        Some(libc::ECONNABORTED) | Some(libc::ENETRESET) | Some(libc::ECANCELED) => {
            Some(StreamError::LocalClose)
        }
        Some(libc::EWOULDBLOCK) => None,
        _ => Some(StreamError::UndefinedError),
    }
}

struct StreamInner {
    fd: RawFd,
    valid: bool,
    error: StreamError,
    state: StreamState,
    /// Fixed submission buffer.
    buf: Box<[u8]>,
    /// Chunk currently being drained to the reader, with its offset.
    current: Option<(Vec<u8>, usize)>,
    read_queue: VecDeque<Vec<u8>>,
    write_queue: VecDeque<Vec<u8>>,
    total_bytes: u64,
    sent_bytes: u64,
    readed_bytes: u64,
}

impl StreamInner {
    fn buffered(&self) -> bool {
        self.current.is_some() || !self.read_queue.is_empty()
    }
}

pub struct TcpStream {
    op_mutex: Arc<ember_rt::sync::TaskMutex>,
    inner: Mutex<StreamInner>,
    reactor: Arc<Reactor>,
    max_read_queue: usize,
    recv_timeout: Option<Duration>,
    manage: ManageType,
    remote: Address,
    local: Address,
}

impl TcpStream {
    pub(crate) fn from_fd(
        rt: &Runtime,
        fd: RawFd,
        remote: Address,
        local: Address,
        cfg: &StreamConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            op_mutex: Arc::new(ember_rt::sync::TaskMutex::new()),
            inner: Mutex::new(StreamInner {
                fd,
                valid: true,
                error: StreamError::None,
                state: StreamState::Accept,
                buf: vec![0u8; cfg.buffer_size.max(1)].into_boxed_slice(),
                current: None,
                read_queue: VecDeque::new(),
                write_queue: VecDeque::new(),
                total_bytes: 0,
                sent_bytes: 0,
                readed_bytes: 0,
            }),
            reactor: rt.reactor().clone(),
            max_read_queue: cfg.max_read_queue,
            recv_timeout: cfg.recv_timeout,
            manage: cfg.manage,
            remote,
            local,
        })
    }

    pub fn remote_address(&self) -> Address {
        self.remote
    }

    pub fn local_address(&self) -> Address {
        self.local
    }

    pub fn error(&self) -> StreamError {
        self.inner.lock().error
    }

    pub fn is_closed(&self) -> bool {
        !self.inner.lock().valid
    }

    /// True when a buffered chunk or kernel bytes are waiting.
    pub fn data_available(&self) -> bool {
        let st = self.inner.lock();
        if !st.valid {
            return st.buffered();
        }
        if st.buffered() {
            return true;
        }
        let mut pending: libc::c_int = 0;
        let ret = unsafe { libc::ioctl(st.fd, libc::FIONREAD as _, &mut pending) };
        ret == 0 && pending > 0
    }

    /// Read up to `out.len()` bytes, draining buffered chunks before
    /// touching the socket.
    pub async fn read_available(&self, out: &mut [u8]) -> RtResult<usize> {
        self.op_mutex.lock().await?;
        let result = self.read_available_inner(out).await;
        self.op_mutex.unlock()?;
        result
    }

    async fn read_available_inner(&self, out: &mut [u8]) -> RtResult<usize> {
        self.drain_writes_while_idle().await?;
        if self.is_closed() {
            return Ok(0);
        }
        if !self.ensure_chunk().await? {
            return Ok(0);
        }

        let mut st = self.inner.lock();
        let Some((chunk, off)) = st.current.take() else {
            return Ok(0);
        };
        let n = (chunk.len() - off).min(out.len());
        out[..n].copy_from_slice(&chunk[off..off + n]);
        if off + n < chunk.len() {
            st.current = Some((chunk, off + n));
        }
        Ok(n)
    }

    /// Zero-copy view of the next buffered chunk; valid independently
    /// of the handle's later operations.
    pub async fn read_available_ref(&self) -> RtResult<Arc<[u8]>> {
        self.op_mutex.lock().await?;
        let result = self.read_available_ref_inner().await;
        self.op_mutex.unlock()?;
        result
    }

    async fn read_available_ref_inner(&self) -> RtResult<Arc<[u8]>> {
        self.drain_writes_while_idle().await?;
        if self.is_closed() || !self.ensure_chunk().await? {
            return Ok(Arc::from(Vec::new()));
        }
        let mut st = self.inner.lock();
        match st.current.take() {
            Some((chunk, 0)) => Ok(Arc::from(chunk)),
            Some((chunk, off)) => Ok(Arc::from(chunk[off..].to_vec())),
            None => Ok(Arc::from(Vec::new())),
        }
    }

    /// Make a chunk current: pop the FIFO or submit a socket read.
    async fn ensure_chunk(&self) -> RtResult<bool> {
        {
            let mut st = self.inner.lock();
            if st.current.is_some() {
                return Ok(true);
            }
            if let Some(chunk) = st.read_queue.pop_front() {
                st.current = Some((chunk, 0));
                return Ok(true);
            }
            st.state = StreamState::Read;
        }
        // One submission in flight: read into the fixed buffer.
        let (fd, mut buf) = {
            let mut st = self.inner.lock();
            let taken = std::mem::replace(&mut st.buf, Vec::new().into_boxed_slice());
            (st.fd, taken.into_vec())
        };
        let read: RtResult<usize> = {
            let fut = FdRead::new(fd, self.reactor.clone(), &mut buf);
            match self.recv_timeout {
                Some(limit) => match with_timeout(limit, fut).await? {
                    Some(io) => io.map_err(RtError::from),
                    None => {
                        self.restore_buf(buf);
                        return Err(RtError::new(
                            ember_value::ErrorKind::System,
                            "receive timed out",
                        ));
                    }
                },
                None => drive_io(fut).await,
            }
        };
        match read {
            Ok(0) => {
                self.restore_buf(buf);
                self.invalidate(StreamError::RemoteClose);
                Ok(false)
            }
            Ok(n) => {
                let chunk = buf[..n].to_vec();
                let mut st = self.inner.lock();
                st.buf = buf.into_boxed_slice();
                st.readed_bytes += n as u64;
                st.current = Some((chunk, 0));
                Ok(true)
            }
            Err(e) if e.is_cancellation() => {
                self.restore_buf(buf);
                Err(e)
            }
            Err(e) => {
                self.restore_buf(buf);
                self.fail_from_message(&e);
                Ok(false)
            }
        }
    }

    fn restore_buf(&self, buf: Vec<u8>) {
        let mut st = self.inner.lock();
        if st.buf.is_empty() {
            st.buf = buf.into_boxed_slice();
        }
    }

    /// Queue a write. Blocking manage-type drains the queue while no
    /// inbound data is pending.
    pub async fn write(&self, data: &[u8]) -> RtResult<()> {
        self.op_mutex.lock().await?;
        let result = self.write_inner(data).await;
        self.op_mutex.unlock()?;
        result
    }

    async fn write_inner(&self, data: &[u8]) -> RtResult<()> {
        {
            let mut st = self.inner.lock();
            if !st.valid {
                return Ok(());
            }
            st.write_queue.push_back(data.to_vec());
        }
        if self.manage == ManageType::Blocking {
            self.drain_writes_while_idle().await?;
        }
        Ok(())
    }

    /// Drain queued writes as long as no inbound data is waiting.
    async fn drain_writes_while_idle(&self) -> RtResult<()> {
        while !self.data_available() {
            if !self.send_queue_item().await? {
                break;
            }
        }
        Ok(())
    }

    /// Pop one FIFO entry and push it through the fixed buffer.
    /// Inbound bytes that arrived while the send was in flight are
    /// pulled into the read FIFO so a long drain cannot stall the peer.
    async fn send_queue_item(&self) -> RtResult<bool> {
        let item = {
            let mut st = self.inner.lock();
            if !st.valid {
                return Ok(false);
            }
            st.write_queue.pop_front()
        };
        match item {
            Some(data) => {
                self.send_chunked(&data).await?;
                self.slurp_inbound();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Move whatever the kernel has buffered into the read FIFO without
    /// blocking. Exceeding the queue cap closes the handle with
    /// `read_queue_overflow`; end-of-stream is left for the next
    /// blocking read to discover.
    fn slurp_inbound(&self) {
        loop {
            let (fd, mut buf) = {
                let mut st = self.inner.lock();
                if !st.valid {
                    return;
                }
                st.state = StreamState::InternalRead;
                let taken = std::mem::replace(&mut st.buf, Vec::new().into_boxed_slice());
                (st.fd, taken.into_vec())
            };
            let n = unsafe {
                libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            };
            if n > 0 {
                let chunk = buf[..n as usize].to_vec();
                self.restore_buf(buf);
                self.queue_inbound(chunk);
                if self.is_closed() {
                    return; // queue cap tripped
                }
                continue;
            }
            self.restore_buf(buf);
            if n == 0 {
                return;
            }
            let err = std::io::Error::last_os_error();
            match err.kind() {
                std::io::ErrorKind::Interrupted => continue,
                std::io::ErrorKind::WouldBlock => return,
                _ => {
                    let kind = classify(&err).unwrap_or(StreamError::UndefinedError);
                    self.invalidate(kind);
                    return;
                }
            }
        }
    }

    async fn send_chunked(&self, data: &[u8]) -> RtResult<()> {
        let (fd, chunk_len) = {
            let mut st = self.inner.lock();
            if !st.valid {
                return Ok(());
            }
            st.state = StreamState::Write;
            st.total_bytes += data.len() as u64;
            (st.fd, st.buf.len())
        };
        for chunk in data.chunks(chunk_len.max(1)) {
            let mut written = 0;
            while written < chunk.len() {
                let n = drive_io(ember_rt::io::FdWrite::new(
                    fd,
                    self.reactor.clone(),
                    &chunk[written..],
                ))
                .await;
                match n {
                    Ok(n) => {
                        written += n;
                        self.inner.lock().sent_bytes += n as u64;
                    }
                    Err(e) if e.is_cancellation() => return Err(e),
                    Err(e) => {
                        self.fail_from_message(&e);
                        return Ok(());
                    }
                }
            }
            if self.is_closed() {
                return Ok(());
            }
        }
        Ok(())
    }

    /// Drain the whole write queue.
    pub async fn force_write(&self) -> RtResult<()> {
        self.op_mutex.lock().await?;
        let result = async {
            while self.send_queue_item().await? {}
            Ok(())
        }
        .await;
        self.op_mutex.unlock()?;
        result
    }

    /// Discard queued writes, push `data` out, then close.
    pub async fn force_write_and_close(&self, data: &[u8]) -> RtResult<()> {
        self.op_mutex.lock().await?;
        let result = async {
            self.inner.lock().write_queue.clear();
            self.send_chunked(data).await?;
            self.close_with(StreamError::LocalClose);
            Ok(())
        }
        .await;
        self.op_mutex.unlock()?;
        result
    }

    /// Kernel-assisted file transfer, drains queued writes first.
    pub async fn write_file(
        &self,
        file: &File,
        len: u64,
        offset: u64,
        chunk_size: u32,
    ) -> RtResult<bool> {
        self.op_mutex.lock().await?;
        let result = async {
            while self.send_queue_item().await? {}
            if self.is_closed() {
                return Ok(false);
            }
            self.transfer_file(file.as_raw_fd(), len, offset, chunk_size)
                .await
        }
        .await;
        self.op_mutex.unlock()?;
        result
    }

    pub async fn write_file_path(
        &self,
        path: &std::path::Path,
        len: u64,
        offset: u64,
        chunk_size: u32,
    ) -> RtResult<bool> {
        let file = File::open(path).map_err(RtError::system)?;
        self.write_file(&file, len, offset, chunk_size).await
    }

    async fn transfer_file(
        &self,
        file_fd: RawFd,
        len: u64,
        offset: u64,
        chunk_size: u32,
    ) -> RtResult<bool> {
        // Single sendfile submissions cap just below i32::MAX.
        const MAX_BLOCK: u64 = 0x7FFF_FFFE;
        let chunk = if chunk_size == 0 { 0x1000 } else { chunk_size };

        let total = if len == 0 {
            let mut stat: libc::stat = unsafe { std::mem::zeroed() };
            if unsafe { libc::fstat(file_fd, &mut stat) } < 0 {
                return Err(RtError::system(std::io::Error::last_os_error()));
            }
            (stat.st_size as u64).saturating_sub(offset)
        } else {
            len
        };

        self.inner.lock().state = StreamState::TransmitFile;
        let mut position = offset;
        let blocks = total / MAX_BLOCK;
        let last_block = total % MAX_BLOCK;
        for _ in 0..blocks {
            if !self.sendfile_block(file_fd, &mut position, MAX_BLOCK, chunk).await? {
                return Ok(false);
            }
        }
        if last_block > 0 {
            // Exactly the remainder; not the whole length again.
            if !self
                .sendfile_block(file_fd, &mut position, last_block, chunk)
                .await?
            {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn sendfile_block(
        &self,
        file_fd: RawFd,
        position: &mut u64,
        mut remaining: u64,
        chunk: u32,
    ) -> RtResult<bool> {
        let sock_fd = {
            let st = self.inner.lock();
            if !st.valid {
                return Ok(false);
            }
            st.fd
        };
        while remaining > 0 {
            let ask = remaining.min(chunk as u64) as usize;
            let mut off = *position as libc::off_t;
            let n = unsafe { libc::sendfile(sock_fd, file_fd, &mut off, ask) };
            if n > 0 {
                *position += n as u64;
                remaining -= n as u64;
                self.inner.lock().sent_bytes += n as u64;
                continue;
            }
            if n == 0 {
                return Ok(true); // file exhausted early
            }
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            match classify(&err) {
                None => {
                    drive_io(Writable::new(sock_fd, self.reactor.clone())).await?;
                }
                Some(kind) => {
                    self.invalidate(kind);
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Replace the fixed buffer.
    pub fn rebuffer(&self, new_size: usize) -> RtResult<()> {
        if new_size == 0 {
            return Err(RtError::invalid_arguments("buffer size must be positive"));
        }
        let mut st = self.inner.lock();
        if !st.valid {
            return Ok(());
        }
        st.buf = vec![0u8; new_size].into_boxed_slice();
        Ok(())
    }

    /// Orderly close: queued writes are dropped, the handle is
    /// invalidated with `local_close`.
    pub fn close(&self) {
        self.close_with(StreamError::LocalClose);
    }

    fn close_with(&self, err: StreamError) {
        let fd = {
            let mut st = self.inner.lock();
            if !st.valid {
                return;
            }
            st.write_queue.clear();
            st.current = None;
            st.valid = false;
            st.error = err;
            st.state = StreamState::InternalClose;
            st.fd
        };
        // A fiber may be parked on this fd; wake it so it observes the
        // closed socket instead of waiting forever.
        self.reactor.evict(fd);
        unsafe {
            libc::shutdown(fd, libc::SHUT_RDWR);
            libc::close(fd);
        }
        debug!("stream to {} closed: {:?}", self.remote, err);
    }

    /// Abortive close: linger zero makes the kernel send RST.
    pub fn reset(&self) {
        {
            let st = self.inner.lock();
            if !st.valid {
                return;
            }
            let linger = libc::linger {
                l_onoff: 1,
                l_linger: 0,
            };
            unsafe {
                libc::setsockopt(
                    st.fd,
                    libc::SOL_SOCKET,
                    libc::SO_LINGER,
                    &linger as *const _ as *const libc::c_void,
                    std::mem::size_of::<libc::linger>() as libc::socklen_t,
                );
            }
        }
        self.close_with(StreamError::LocalReset);
    }

    fn invalidate(&self, err: StreamError) {
        self.close_with(err);
    }

    fn fail_from_message(&self, err: &RtError) {
        // The errno travels in the message as "(os error N)".
        let kind = os_code_from_message(&err.message)
            .map(std::io::Error::from_raw_os_error)
            .and_then(|e| classify(&e))
            .unwrap_or(StreamError::UndefinedError);
        self.invalidate(kind);
    }

    /// Buffer an inbound chunk (internal read path). Overflow closes
    /// the handle with `read_queue_overflow`.
    fn queue_inbound(&self, chunk: Vec<u8>) {
        let overflow = {
            let mut st = self.inner.lock();
            if !st.valid {
                return;
            }
            st.state = StreamState::InternalRead;
            st.readed_bytes += chunk.len() as u64;
            st.read_queue.push_back(chunk);
            st.read_queue.len() > self.max_read_queue
        };
        if overflow {
            self.invalidate(StreamError::ReadQueueOverflow);
        }
    }

    pub fn counters(&self) -> (u64, u64, u64) {
        let st = self.inner.lock();
        (st.total_bytes, st.sent_bytes, st.readed_bytes)
    }
}

impl Drop for TcpStream {
    fn drop(&mut self) {
        self.close();
    }
}

impl StructBody for TcpStream {
    fn type_name(&self) -> &str {
        "tcp_stream"
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

impl std::fmt::Debug for TcpStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.inner.lock();
        f.debug_struct("TcpStream")
            .field("remote", &self.remote)
            .field("state", &st.state)
            .field("valid", &st.valid)
            .field("error", &st.error)
            .finish()
    }
}

fn os_code_from_message(message: &str) -> Option<i32> {
    let tail = message.rsplit("os error ").next()?;
    let digits: String = tail.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

/// One-shot writability wait used by sendfile retries.
struct Writable {
    fd: RawFd,
    reactor: Arc<Reactor>,
    registered: bool,
}

impl Writable {
    fn new(fd: RawFd, reactor: Arc<Reactor>) -> Self {
        Self {
            fd,
            reactor,
            registered: false,
        }
    }
}

impl Future for Writable {
    type Output = std::io::Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if !self.registered {
            self.registered = true;
            if let Err(e) = self
                .reactor
                .register(self.fd, Interest::Writable, cx.waker().clone())
            {
                return Poll::Ready(Err(e));
            }
            return Poll::Pending;
        }
        self.registered = false;
        let _ = self.reactor.deregister(self.fd);
        Poll::Ready(Ok(()))
    }
}

impl Drop for Writable {
    fn drop(&mut self) {
        // An abandoned wait (cancellation) must disarm the fd.
        if self.registered {
            let _ = self.reactor.deregister(self.fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_matches_error_table() {
        let reset = std::io::Error::from_raw_os_error(libc::ECONNRESET);
        assert_eq!(classify(&reset), Some(StreamError::RemoteClose));
        let aborted = std::io::Error::from_raw_os_error(libc::ECONNABORTED);
        assert_eq!(classify(&aborted), Some(StreamError::LocalClose));
        let netreset = std::io::Error::from_raw_os_error(libc::ENETRESET);
        assert_eq!(classify(&netreset), Some(StreamError::LocalClose));
        let block = std::io::Error::from_raw_os_error(libc::EWOULDBLOCK);
        assert_eq!(classify(&block), None);
        let other = std::io::Error::from_raw_os_error(libc::EACCES);
        assert_eq!(classify(&other), Some(StreamError::UndefinedError));
    }

    #[test]
    fn inbound_queue_overflow_invalidates() {
        let rt = ember_rt::Runtime::with_config(ember_rt::RuntimeConfig {
            workers: 1,
            eager_timer: false,
        })
        .unwrap();
        let mut fds = [0i32; 2];
        unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
        let addr = Address::parse("127.0.0.1:1").unwrap();
        let cfg = StreamConfig {
            max_read_queue: 2,
            ..Default::default()
        };
        let stream = TcpStream::from_fd(&rt, fds[0], addr, addr, &cfg);

        stream.queue_inbound(vec![1]);
        stream.queue_inbound(vec![2]);
        assert!(!stream.is_closed());
        assert!(stream.data_available());

        stream.queue_inbound(vec![3]);
        assert!(stream.is_closed());
        assert_eq!(stream.error(), StreamError::ReadQueueOverflow);

        unsafe { libc::close(fds[1]) };
        rt.shutdown();
    }

    #[test]
    fn slurp_buffers_kernel_bytes_into_read_fifo() {
        let rt = ember_rt::Runtime::with_config(ember_rt::RuntimeConfig {
            workers: 1,
            eager_timer: false,
        })
        .unwrap();
        let mut fds = [0i32; 2];
        unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
        let addr = Address::parse("127.0.0.1:1").unwrap();
        let stream = TcpStream::from_fd(&rt, fds[0], addr, addr, &StreamConfig::default());

        unsafe {
            libc::write(fds[1], b"mid-drain".as_ptr() as *const libc::c_void, 9);
        }
        stream.slurp_inbound();
        assert!(stream.data_available());
        assert!(!stream.is_closed());
        let (_, _, readed) = stream.counters();
        assert_eq!(readed, 9);

        unsafe { libc::close(fds[1]) };
        rt.shutdown();
    }

    #[test]
    fn slurp_overflow_closes_with_read_queue_overflow() {
        let rt = ember_rt::Runtime::with_config(ember_rt::RuntimeConfig {
            workers: 1,
            eager_timer: false,
        })
        .unwrap();
        let mut fds = [0i32; 2];
        unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
        let addr = Address::parse("127.0.0.1:1").unwrap();
        // Tiny submission buffer: every 8 inbound bytes become a chunk.
        let cfg = StreamConfig {
            buffer_size: 8,
            max_read_queue: 2,
            ..Default::default()
        };
        let stream = TcpStream::from_fd(&rt, fds[0], addr, addr, &cfg);

        let flood = [7u8; 64];
        unsafe {
            libc::write(fds[1], flood.as_ptr() as *const libc::c_void, flood.len());
        }
        stream.slurp_inbound();
        assert!(stream.is_closed());
        assert_eq!(stream.error(), StreamError::ReadQueueOverflow);

        unsafe { libc::close(fds[1]) };
        rt.shutdown();
    }

    #[test]
    fn os_code_extraction() {
        let err = std::io::Error::from_raw_os_error(libc::ECONNRESET);
        let code = os_code_from_message(&err.to_string());
        assert_eq!(code, Some(libc::ECONNRESET));
        assert_eq!(os_code_from_message("no code here"), None);
    }

    #[test]
    fn default_config() {
        let cfg = StreamConfig::default();
        assert_eq!(cfg.buffer_size, 4096);
        assert_eq!(cfg.max_read_queue, 10);
        assert_eq!(cfg.manage, ManageType::Blocking);
    }
}
