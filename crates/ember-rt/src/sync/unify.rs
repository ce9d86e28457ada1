// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! The lock union.
//!
//! One lock/unlock interface over five lock kinds, so the scheduler can
//! release an arbitrary caller-held lock around a suspension and
//! reacquire it before the fiber resumes. `relock_begin` fully releases
//! (recording recursion depth where it applies); `relock_end` restores.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ember_value::{RtError, RtResult};
use parking_lot::lock_api::{RawMutex as RawMutexApi, RawMutexTimed};
use parking_lot::RawMutex;

use crate::sync::mutex::TaskMutex;

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_ID: u64 = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn thread_id() -> u64 {
    THREAD_ID.with(|id| *id)
}

/// Guard-less native mutex. Blocks the OS thread; fibers must only
/// hold it across non-suspending sections or route it through a relock
/// slot.
pub struct NativeMutex {
    raw: RawMutex,
}

impl NativeMutex {
    pub fn new() -> Self {
        Self {
            raw: RawMutex::INIT,
        }
    }

    pub fn lock(&self) {
        self.raw.lock();
    }

    pub fn try_lock(&self) -> bool {
        self.raw.try_lock()
    }

    pub fn try_lock_for(&self, timeout: Duration) -> bool {
        self.raw.try_lock_for(timeout)
    }

    pub fn unlock(&self) {
        unsafe { self.raw.unlock() }
    }
}

impl Default for NativeMutex {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard-less native recursive mutex keyed by thread identity.
pub struct NativeRecursiveMutex {
    raw: RawMutex,
    owner: AtomicU64,
    depth: AtomicU32,
}

impl NativeRecursiveMutex {
    pub fn new() -> Self {
        Self {
            raw: RawMutex::INIT,
            owner: AtomicU64::new(0),
            depth: AtomicU32::new(0),
        }
    }

    pub fn lock(&self) {
        let me = thread_id();
        if self.owner.load(Ordering::Acquire) == me {
            self.depth.fetch_add(1, Ordering::AcqRel);
            return;
        }
        self.raw.lock();
        self.owner.store(me, Ordering::Release);
        self.depth.store(1, Ordering::Release);
    }

    pub fn try_lock(&self) -> bool {
        let me = thread_id();
        if self.owner.load(Ordering::Acquire) == me {
            self.depth.fetch_add(1, Ordering::AcqRel);
            return true;
        }
        if self.raw.try_lock() {
            self.owner.store(me, Ordering::Release);
            self.depth.store(1, Ordering::Release);
            return true;
        }
        false
    }

    pub fn try_lock_for(&self, timeout: Duration) -> bool {
        let me = thread_id();
        if self.owner.load(Ordering::Acquire) == me {
            self.depth.fetch_add(1, Ordering::AcqRel);
            return true;
        }
        if self.raw.try_lock_for(timeout) {
            self.owner.store(me, Ordering::Release);
            self.depth.store(1, Ordering::Release);
            return true;
        }
        false
    }

    pub fn unlock(&self) -> RtResult<()> {
        if self.owner.load(Ordering::Acquire) != thread_id() {
            return Err(RtError::invalid_unlock("recursive mutex owned elsewhere"));
        }
        if self.depth.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.owner.store(0, Ordering::Release);
            unsafe { self.raw.unlock() }
        }
        Ok(())
    }

    /// Release all levels, returning the depth to restore.
    fn release_all(&self) -> u32 {
        let depth = self.depth.swap(0, Ordering::AcqRel);
        if depth > 0 {
            self.owner.store(0, Ordering::Release);
            unsafe { self.raw.unlock() }
        }
        depth
    }

    fn restore(&self, depth: u32) {
        if depth == 0 {
            return;
        }
        self.raw.lock();
        self.owner.store(thread_id(), Ordering::Release);
        self.depth.store(depth, Ordering::Release);
    }
}

impl Default for NativeRecursiveMutex {
    fn default() -> Self {
        Self::new()
    }
}

/// Saved relock state handed back by `relock_begin`.
pub struct RelockToken {
    kind: TokenKind,
}

enum TokenKind {
    Unit,
    Depth(u32),
    Multi(Vec<RelockToken>),
}

/// Tagged reference over the five lock kinds.
#[derive(Clone)]
pub enum LockRef {
    /// Plain native mutex; timed acquire is unsupported.
    Thread(Arc<NativeMutex>),
    /// Native mutex allowing timed acquire.
    ThreadTimed(Arc<NativeMutex>),
    ThreadRecursive(Arc<NativeRecursiveMutex>),
    Task(Arc<TaskMutex>),
    Multi(Arc<MultiLock>),
}

/// Leaf acquire: every kind except `Multi`, which composes leaves.
async fn leaf_lock(lock: &LockRef) -> RtResult<()> {
    match lock {
        LockRef::Thread(m) | LockRef::ThreadTimed(m) => {
            m.lock();
            Ok(())
        }
        LockRef::ThreadRecursive(m) => {
            m.lock();
            Ok(())
        }
        LockRef::Task(m) => m.lock().await,
        LockRef::Multi(_) => Err(RtError::invalid_arguments("nested multi-lock")),
    }
}

fn leaf_try_lock(lock: &LockRef) -> RtResult<bool> {
    match lock {
        LockRef::Thread(m) | LockRef::ThreadTimed(m) => Ok(m.try_lock()),
        LockRef::ThreadRecursive(m) => Ok(m.try_lock()),
        LockRef::Task(m) => m.try_lock(),
        LockRef::Multi(_) => Err(RtError::invalid_arguments("nested multi-lock")),
    }
}

fn leaf_unlock(lock: &LockRef) -> RtResult<()> {
    match lock {
        LockRef::Thread(m) | LockRef::ThreadTimed(m) => {
            m.unlock();
            Ok(())
        }
        LockRef::ThreadRecursive(m) => m.unlock(),
        LockRef::Task(m) => m.unlock(),
        LockRef::Multi(_) => Err(RtError::invalid_arguments("nested multi-lock")),
    }
}

impl LockRef {
    pub async fn lock(&self) -> RtResult<()> {
        match self {
            LockRef::Multi(m) => m.lock_all().await,
            leaf => leaf_lock(leaf).await,
        }
    }

    pub fn try_lock(&self) -> RtResult<bool> {
        match self {
            LockRef::Multi(m) => m.try_lock_all(),
            leaf => leaf_try_lock(leaf),
        }
    }

    pub async fn try_lock_for(&self, timeout: Duration) -> RtResult<bool> {
        match self {
            LockRef::Thread(_) => Err(RtError::new(
                ember_value::ErrorKind::UnsupportedOperation,
                "plain mutex has no timed acquire",
            )),
            LockRef::ThreadTimed(m) => Ok(m.try_lock_for(timeout)),
            LockRef::ThreadRecursive(m) => Ok(m.try_lock_for(timeout)),
            LockRef::Task(m) => m.try_lock_for(timeout).await,
            LockRef::Multi(m) => m.try_lock_all_for(timeout).await,
        }
    }

    pub fn unlock(&self) -> RtResult<()> {
        match self {
            LockRef::Multi(m) => m.unlock_all(),
            leaf => leaf_unlock(leaf),
        }
    }

    /// Verify the caller may release this lock (done before a waiter
    /// record is registered, so the release itself cannot fail).
    pub fn relock_precheck(&self) -> RtResult<()> {
        match self {
            LockRef::Task(m) => {
                if m.is_owned() {
                    Ok(())
                } else {
                    Err(RtError::invalid_lock("relock of a mutex not held"))
                }
            }
            LockRef::Multi(m) => {
                for l in &m.locks {
                    l.relock_precheck()?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Fully release, saving whatever is needed to restore.
    pub fn relock_begin(&self) -> RelockToken {
        match self {
            LockRef::Thread(m) | LockRef::ThreadTimed(m) => {
                m.unlock();
                RelockToken {
                    kind: TokenKind::Unit,
                }
            }
            LockRef::ThreadRecursive(m) => RelockToken {
                kind: TokenKind::Depth(m.release_all()),
            },
            LockRef::Task(m) => {
                let _ = m.unlock();
                RelockToken {
                    kind: TokenKind::Unit,
                }
            }
            LockRef::Multi(m) => {
                // Release in reverse acquisition order.
                let mut tokens = Vec::with_capacity(m.locks.len());
                for l in m.locks.iter().rev() {
                    tokens.push(l.relock_begin());
                }
                tokens.reverse();
                RelockToken {
                    kind: TokenKind::Multi(tokens),
                }
            }
        }
    }

    /// Reacquire what `relock_begin` released.
    pub async fn relock_end(&self, token: RelockToken) -> RtResult<()> {
        match (self, token.kind) {
            (LockRef::Thread(m) | LockRef::ThreadTimed(m), TokenKind::Unit) => {
                m.lock();
                Ok(())
            }
            (LockRef::ThreadRecursive(m), TokenKind::Depth(depth)) => {
                m.restore(depth);
                Ok(())
            }
            (LockRef::Task(m), TokenKind::Unit) => m.lock().await,
            (LockRef::Multi(m), TokenKind::Multi(tokens)) => {
                for (l, t) in m.locks.iter().zip(tokens) {
                    match l {
                        LockRef::Task(tm) => tm.lock().await?,
                        LockRef::ThreadRecursive(rm) => {
                            if let TokenKind::Depth(d) = t.kind {
                                rm.restore(d);
                            }
                        }
                        LockRef::Thread(nm) | LockRef::ThreadTimed(nm) => nm.lock(),
                        LockRef::Multi(_) => {
                            return Err(RtError::invalid_arguments("nested multi-lock"))
                        }
                    }
                }
                Ok(())
            }
            _ => Err(RtError::internal("relock token does not match lock kind")),
        }
    }
}

/// Ordered set of locks acquired together. Elements must be leaves.
pub struct MultiLock {
    locks: Vec<LockRef>,
}

impl MultiLock {
    pub fn new(locks: Vec<LockRef>) -> RtResult<Arc<Self>> {
        if locks.iter().any(|l| matches!(l, LockRef::Multi(_))) {
            return Err(RtError::invalid_arguments("multi-lock cannot nest"));
        }
        Ok(Arc::new(Self { locks }))
    }

    async fn lock_all(&self) -> RtResult<()> {
        for lock in &self.locks {
            leaf_lock(lock).await?;
        }
        Ok(())
    }

    /// All-or-nothing; releases what it took on failure.
    fn try_lock_all(&self) -> RtResult<bool> {
        for (i, lock) in self.locks.iter().enumerate() {
            let got = leaf_try_lock(lock)?;
            if !got {
                for held in self.locks[..i].iter().rev() {
                    let _ = leaf_unlock(held);
                }
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn try_lock_all_for(&self, timeout: Duration) -> RtResult<bool> {
        let deadline = std::time::Instant::now() + timeout;
        for (i, lock) in self.locks.iter().enumerate() {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            let got = match lock {
                LockRef::Thread(_) => leaf_try_lock(lock)?,
                LockRef::ThreadTimed(m) => m.try_lock_for(remaining),
                LockRef::ThreadRecursive(m) => m.try_lock_for(remaining),
                LockRef::Task(m) => m.try_lock_for(remaining).await?,
                LockRef::Multi(_) => return Err(RtError::invalid_arguments("nested multi-lock")),
            };
            if !got {
                for held in self.locks[..i].iter().rev() {
                    let _ = leaf_unlock(held);
                }
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn unlock_all(&self) -> RtResult<()> {
        for lock in self.locks.iter().rev() {
            leaf_unlock(lock)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_mutex_lock_unlock() {
        let m = NativeMutex::new();
        m.lock();
        assert!(!m.try_lock());
        m.unlock();
        assert!(m.try_lock());
        m.unlock();
    }

    #[test]
    fn native_recursive_depth() {
        let m = NativeRecursiveMutex::new();
        m.lock();
        m.lock();
        m.unlock().unwrap();
        // Still held at depth 1.
        let m2 = Arc::new(m);
        let other = m2.clone();
        let contended = std::thread::spawn(move || other.try_lock())
            .join()
            .unwrap();
        assert!(!contended);
        m2.unlock().unwrap();
    }

    #[test]
    fn recursive_relock_restores_depth() {
        let m = NativeRecursiveMutex::new();
        m.lock();
        m.lock();
        let depth = m.release_all();
        assert_eq!(depth, 2);
        m.restore(depth);
        m.unlock().unwrap();
        m.unlock().unwrap();
        assert_eq!(m.depth.load(Ordering::Acquire), 0);
    }

    #[test]
    fn unlock_from_wrong_thread_fails() {
        let m = Arc::new(NativeRecursiveMutex::new());
        m.lock();
        let other = m.clone();
        let err = std::thread::spawn(move || other.unlock()).join().unwrap();
        assert!(err.is_err());
        m.unlock().unwrap();
    }

    #[test]
    fn multi_lock_rejects_nesting() {
        let inner = MultiLock::new(vec![]).unwrap();
        let err = MultiLock::new(vec![LockRef::Multi(inner)]);
        assert!(err.is_err());
    }

    #[test]
    fn multi_try_lock_rolls_back() {
        let a = Arc::new(NativeMutex::new());
        let b = Arc::new(NativeMutex::new());
        b.lock(); // contended from this thread; try from multi fails
        let multi = MultiLock::new(vec![
            LockRef::Thread(a.clone()),
            LockRef::Thread(b.clone()),
        ])
        .unwrap();
        assert!(!multi.try_lock_all().unwrap());
        // `a` was rolled back.
        assert!(a.try_lock());
        a.unlock();
        b.unlock();
    }
}
