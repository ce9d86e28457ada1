// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! I/O readiness hub.
//!
//! Level-triggered epoll over a slab of waiter slots. The epoll payload
//! is a `(slot, generation)` token, never a raw fd: an event queued for
//! a waiter that has since disarmed (or for an fd number the kernel
//! recycled) carries a stale token and is discarded instead of waking a
//! stranger. Delivery is one-shot — the waker is taken out of the slot
//! on wake, and the retrying future re-arms with a fresh one.
//!
//! Arming encodes only the direction of interest. Error and hang-up
//! conditions are reported by the kernel whether or not they were
//! requested, so a waiter parked in either direction wakes on failure
//! and classifies it at the syscall.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::Waker;

use parking_lot::Mutex;

/// Direction a waiter cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Readable,
    Writable,
}

impl Interest {
    fn direction_bits(self) -> u32 {
        // RDHUP must be asked for; ERR/HUP arrive regardless.
        match self {
            Interest::Readable => (libc::EPOLLIN | libc::EPOLLRDHUP) as u32,
            Interest::Writable => libc::EPOLLOUT as u32,
        }
    }
}

/// Token reserved for the doorbell pipe; no slab slot can produce it.
const DOORBELL_TOKEN: u64 = u64::MAX;

fn pack_token(index: usize, generation: u32) -> u64 {
    ((index as u64) << 32) | generation as u64
}

fn unpack_token(token: u64) -> (usize, u32) {
    ((token >> 32) as usize, token as u32)
}

struct Slot {
    generation: u32,
    waker: Option<Waker>,
}

#[derive(Default)]
struct Registry {
    slots: Vec<Slot>,
    free: Vec<usize>,
    by_fd: HashMap<RawFd, usize>,
}

impl Registry {
    /// Claim a slot for `fd`, bumping its generation so any event still
    /// queued under the previous arming goes stale.
    fn arm(&mut self, fd: RawFd, waker: Waker) -> (usize, u32, bool) {
        if let Some(&index) = self.by_fd.get(&fd) {
            let slot = &mut self.slots[index];
            slot.generation = slot.generation.wrapping_add(1);
            slot.waker = Some(waker);
            return (index, slot.generation, false);
        }
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    waker: None,
                });
                self.slots.len() - 1
            }
        };
        let slot = &mut self.slots[index];
        slot.generation = slot.generation.wrapping_add(1);
        slot.waker = Some(waker);
        self.by_fd.insert(fd, index);
        (index, slot.generation, true)
    }

    /// Release `fd`'s slot, returning any parked waker.
    fn disarm(&mut self, fd: RawFd) -> Option<Waker> {
        let index = self.by_fd.remove(&fd)?;
        let slot = &mut self.slots[index];
        slot.generation = slot.generation.wrapping_add(1);
        let waker = slot.waker.take();
        self.free.push(index);
        waker
    }

    /// One-shot pickup: a live token yields the waker exactly once.
    fn claim(&mut self, token: u64) -> Option<Waker> {
        let (index, generation) = unpack_token(token);
        let slot = self.slots.get_mut(index)?;
        if slot.generation != generation {
            return None;
        }
        slot.waker.take()
    }
}

pub struct Reactor {
    epoll_fd: RawFd,
    /// Self-pipe: write end rings, read end is armed permanently.
    doorbell_rx: RawFd,
    doorbell_tx: RawFd,
    registry: Mutex<Registry>,
    shutdown: AtomicBool,
}

impl Reactor {
    pub fn new() -> io::Result<Self> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let mut pipe = [0 as RawFd; 2];
        if unsafe { libc::pipe2(pipe.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) } < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(epoll_fd) };
            return Err(err);
        }
        let mut ev = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: DOORBELL_TOKEN,
        };
        if unsafe { libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_ADD, pipe[0], &mut ev) } < 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(pipe[0]);
                libc::close(pipe[1]);
                libc::close(epoll_fd);
            }
            return Err(err);
        }
        Ok(Self {
            epoll_fd,
            doorbell_rx: pipe[0],
            doorbell_tx: pipe[1],
            registry: Mutex::new(Registry::default()),
            shutdown: AtomicBool::new(false),
        })
    }

    /// Arm `fd` for one wake in the given direction. Re-arming replaces
    /// the waker and orphans any event already queued for the old one.
    /// No doorbell: `epoll_ctl` is visible to an in-progress wait.
    pub fn register(&self, fd: RawFd, interest: Interest, waker: Waker) -> io::Result<()> {
        let mut registry = self.registry.lock();
        let (index, generation, fresh) = registry.arm(fd, waker);
        let mut ev = libc::epoll_event {
            events: interest.direction_bits(),
            u64: pack_token(index, generation),
        };
        let op = if fresh {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        if unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut ev) } < 0 {
            let err = io::Error::last_os_error();
            registry.disarm(fd);
            return Err(err);
        }
        Ok(())
    }

    /// Quietly stand down: the completing future no longer wants wakes.
    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        drop(self.registry.lock().disarm(fd));
        let ret = unsafe {
            libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // The fd may already be gone from the interest list.
            if err.raw_os_error() != Some(libc::ENOENT)
                && err.raw_os_error() != Some(libc::EBADF)
            {
                return Err(err);
            }
        }
        Ok(())
    }

    /// Stand down AND wake: the fd is being closed under a parked
    /// waiter, which must retry and observe the failure at the syscall.
    pub fn evict(&self, fd: RawFd) {
        let waker = self.registry.lock().disarm(fd);
        unsafe {
            libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut());
        }
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// One wait cycle; returns how many waiters woke. Tokens are
    /// validated and wakers claimed under the registry lock, then woken
    /// outside it — wakers take scheduler locks of their own.
    pub fn poll_once(&self, timeout_ms: i32) -> io::Result<usize> {
        const EVENT_BATCH: usize = 64;
        let mut events: [libc::epoll_event; EVENT_BATCH] =
            [libc::epoll_event { events: 0, u64: 0 }; EVENT_BATCH];

        let n = unsafe {
            libc::epoll_wait(
                self.epoll_fd,
                events.as_mut_ptr(),
                EVENT_BATCH as i32,
                timeout_ms,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }

        let mut ready = Vec::new();
        {
            let mut registry = self.registry.lock();
            for event in events.iter().take(n as usize) {
                if event.u64 == DOORBELL_TOKEN {
                    self.drain_doorbell();
                    continue;
                }
                if let Some(waker) = registry.claim(event.u64) {
                    ready.push(waker);
                }
            }
        }

        let woken = ready.len();
        for waker in ready {
            waker.wake();
        }
        Ok(woken)
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.ring_doorbell();
    }

    pub fn should_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn ring_doorbell(&self) {
        let byte = 1u8;
        unsafe {
            libc::write(self.doorbell_tx, &byte as *const u8 as *const libc::c_void, 1);
        }
    }

    fn drain_doorbell(&self) {
        let mut sink = [0u8; 16];
        loop {
            let n = unsafe {
                libc::read(
                    self.doorbell_rx,
                    sink.as_mut_ptr() as *mut libc::c_void,
                    sink.len(),
                )
            };
            if n < sink.len() as isize {
                return;
            }
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        // Closing the epoll fd detaches every remaining registration;
        // there is nothing to unwind per fd.
        unsafe {
            libc::close(self.doorbell_rx);
            libc::close(self.doorbell_tx);
            libc::close(self.epoll_fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::task::Wake;

    struct CountWaker {
        hits: AtomicUsize,
    }

    impl CountWaker {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                hits: AtomicUsize::new(0),
            })
        }

        fn hits(&self) -> usize {
            self.hits.load(Ordering::Acquire)
        }
    }

    impl Wake for CountWaker {
        fn wake(self: Arc<Self>) {
            self.hits.fetch_add(1, Ordering::AcqRel);
        }
    }

    fn pipe_pair() -> (RawFd, RawFd) {
        let mut fds = [0i32; 2];
        unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        (fds[0], fds[1])
    }

    #[test]
    fn readiness_wakes_once() {
        let reactor = Reactor::new().unwrap();
        let (rx, tx) = pipe_pair();
        let cw = CountWaker::new();
        reactor
            .register(rx, Interest::Readable, Waker::from(cw.clone()))
            .unwrap();

        unsafe {
            libc::write(tx, b"x".as_ptr() as *const libc::c_void, 1);
        }
        assert_eq!(reactor.poll_once(100).unwrap(), 1);
        assert_eq!(cw.hits(), 1);
        // One-shot: the level stays readable but the waker was claimed.
        assert_eq!(reactor.poll_once(10).unwrap(), 0);
        assert_eq!(cw.hits(), 1);

        reactor.deregister(rx).unwrap();
        unsafe {
            libc::close(rx);
            libc::close(tx);
        }
    }

    #[test]
    fn stale_token_is_discarded() {
        let reactor = Reactor::new().unwrap();
        let (rx, tx) = pipe_pair();
        let first = CountWaker::new();
        let second = CountWaker::new();

        reactor
            .register(rx, Interest::Readable, Waker::from(first.clone()))
            .unwrap();
        // Re-arming bumps the generation; events minted for the first
        // arming may still wake, but only the fresh waker runs.
        reactor
            .register(rx, Interest::Readable, Waker::from(second.clone()))
            .unwrap();

        unsafe {
            libc::write(tx, b"y".as_ptr() as *const libc::c_void, 1);
        }
        reactor.poll_once(100).unwrap();
        assert_eq!(first.hits(), 0);
        assert_eq!(second.hits(), 1);

        reactor.deregister(rx).unwrap();
        unsafe {
            libc::close(rx);
            libc::close(tx);
        }
    }

    #[test]
    fn disarmed_fd_never_wakes() {
        let reactor = Reactor::new().unwrap();
        let (rx, tx) = pipe_pair();
        let cw = CountWaker::new();
        reactor
            .register(rx, Interest::Readable, Waker::from(cw.clone()))
            .unwrap();
        reactor.deregister(rx).unwrap();

        unsafe {
            libc::write(tx, b"z".as_ptr() as *const libc::c_void, 1);
        }
        assert_eq!(reactor.poll_once(10).unwrap(), 0);
        assert_eq!(cw.hits(), 0);
        unsafe {
            libc::close(rx);
            libc::close(tx);
        }
    }

    #[test]
    fn evict_wakes_the_parked_waiter() {
        let reactor = Reactor::new().unwrap();
        let (rx, tx) = pipe_pair();
        let cw = CountWaker::new();
        reactor
            .register(rx, Interest::Readable, Waker::from(cw.clone()))
            .unwrap();

        // Nothing readable: the wake comes from the eviction itself.
        reactor.evict(rx);
        assert_eq!(cw.hits(), 1);
        unsafe {
            libc::close(rx);
            libc::close(tx);
        }
    }

    #[test]
    fn slot_reuse_cannot_cross_wake() {
        let reactor = Reactor::new().unwrap();
        let (rx_a, tx_a) = pipe_pair();
        let (rx_b, tx_b) = pipe_pair();
        let gone = CountWaker::new();
        let live = CountWaker::new();

        // First waiter leaves; its slot is recycled for another fd.
        reactor
            .register(rx_a, Interest::Readable, Waker::from(gone.clone()))
            .unwrap();
        reactor.deregister(rx_a).unwrap();
        reactor
            .register(rx_b, Interest::Readable, Waker::from(live.clone()))
            .unwrap();

        unsafe {
            libc::write(tx_b, b"w".as_ptr() as *const libc::c_void, 1);
        }
        reactor.poll_once(100).unwrap();
        assert_eq!(gone.hits(), 0);
        assert_eq!(live.hits(), 1);

        reactor.deregister(rx_b).unwrap();
        unsafe {
            libc::close(rx_a);
            libc::close(tx_a);
            libc::close(rx_b);
            libc::close(tx_b);
        }
    }

    #[test]
    fn shutdown_doorbell_interrupts_wait() {
        let reactor = Reactor::new().unwrap();
        reactor.request_shutdown();
        assert!(reactor.should_shutdown());
        // The doorbell event itself wakes no waiter.
        assert_eq!(reactor.poll_once(100).unwrap(), 0);
        assert_eq!(reactor.poll_once(1).unwrap(), 0);
    }
}
