// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Recursive task mutex: a task mutex plus a depth counter.
//! Depth 0 ⇔ not owned.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use ember_value::{RtError, RtResult};

use crate::sync::mutex::TaskMutex;

#[derive(Default)]
pub struct TaskRecursiveMutex {
    inner: TaskMutex,
    depth: AtomicU32,
}

impl TaskRecursiveMutex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self) -> RtResult<()> {
        if self.inner.is_owned() {
            self.depth.fetch_add(1, Ordering::AcqRel);
            return Ok(());
        }
        self.inner.lock().await?;
        self.depth.store(1, Ordering::Release);
        Ok(())
    }

    pub fn try_lock(&self) -> RtResult<bool> {
        if self.inner.is_owned() {
            self.depth.fetch_add(1, Ordering::AcqRel);
            return Ok(true);
        }
        if self.inner.try_lock()? {
            self.depth.store(1, Ordering::Release);
            return Ok(true);
        }
        Ok(false)
    }

    pub async fn try_lock_for(&self, timeout: Duration) -> RtResult<bool> {
        self.try_lock_until(Instant::now() + timeout).await
    }

    pub async fn try_lock_until(&self, deadline: Instant) -> RtResult<bool> {
        if self.inner.is_owned() {
            self.depth.fetch_add(1, Ordering::AcqRel);
            return Ok(true);
        }
        if self.inner.try_lock_until(deadline).await? {
            self.depth.store(1, Ordering::Release);
            return Ok(true);
        }
        Ok(false)
    }

    /// Drop one level; the base mutex is released only at depth zero.
    pub fn unlock(&self) -> RtResult<()> {
        if !self.inner.is_owned() {
            return Err(RtError::invalid_unlock("unlock by non-owner"));
        }
        if self.depth.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.unlock()?;
        }
        Ok(())
    }

    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }

    pub fn is_owned(&self) -> bool {
        self.inner.is_owned()
    }

    pub fn depth(&self) -> u32 {
        self.depth.load(Ordering::Acquire)
    }
}
