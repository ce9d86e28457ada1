// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Task semaphore: a permit gate with FIFO waiters.
//!
//! Permits start at zero; `release` produces them up to the configured
//! threshold, `lock` consumes or parks.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use ember_value::{RtError, RtResult};
use parking_lot::Mutex;

use crate::sched::core::{current, WaitRecord};
use crate::sched::park::{suspend, Wake};

#[derive(Default)]
struct SemState {
    max: usize,
    allow: usize,
    waiters: VecDeque<WaitRecord>,
}

#[derive(Default)]
pub struct TaskSemaphore {
    state: Mutex<SemState>,
}

impl TaskSemaphore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_max_threshold(&self, max: usize) {
        let mut st = self.state.lock();
        st.max = max;
        st.allow = st.allow.min(max);
    }

    /// Consume a permit, parking FIFO when none are available.
    pub async fn lock(&self) -> RtResult<()> {
        let core = current()
            .ok_or_else(|| RtError::invalid_lock("semaphore used outside task context"))?;
        loop {
            let wake = suspend(|rec| {
                let mut st = self.state.lock();
                if st.allow > 0 {
                    st.allow -= 1;
                    false
                } else {
                    st.waiters.push_back(rec);
                    true
                }
            })
            .await;
            match wake {
                Wake::Cancelled => {
                    self.state.lock().waiters.retain(|r| !r.is_for(&core));
                    return Err(RtError::cancellation());
                }
                _ => {
                    let mut st = self.state.lock();
                    if st.allow > 0 {
                        st.allow -= 1;
                        return Ok(());
                    }
                    // Another fiber took the permit first; queue again.
                }
            }
        }
    }

    pub fn try_lock(&self) -> bool {
        let mut st = self.state.lock();
        if st.allow > 0 {
            st.allow -= 1;
            true
        } else {
            false
        }
    }

    pub async fn try_lock_for(&self, timeout: Duration) -> RtResult<bool> {
        self.try_lock_until(Instant::now() + timeout).await
    }

    pub async fn try_lock_until(&self, deadline: Instant) -> RtResult<bool> {
        let core = current()
            .ok_or_else(|| RtError::invalid_lock("semaphore used outside task context"))?;
        let pool = core
            .pool()
            .ok_or_else(|| RtError::invalid_lock("task has no pool"))?
            .clone();
        loop {
            let timer_core = core.clone();
            let timer_pool = pool.clone();
            let wake = suspend(|rec| {
                let mut st = self.state.lock();
                if st.allow > 0 {
                    st.allow -= 1;
                    false
                } else {
                    timer_pool.timer.enqueue(deadline, &timer_core, rec.generation);
                    st.waiters.push_back(rec);
                    true
                }
            })
            .await;
            match wake {
                Wake::Cancelled => {
                    self.state.lock().waiters.retain(|r| !r.is_for(&core));
                    return Err(RtError::cancellation());
                }
                Wake::Timeout => {
                    self.state.lock().waiters.retain(|r| !r.is_for(&core));
                    return Ok(false);
                }
                Wake::Notified => {
                    let mut st = self.state.lock();
                    if st.allow > 0 {
                        st.allow -= 1;
                        return Ok(true);
                    }
                    if Instant::now() >= deadline {
                        st.waiters.retain(|r| !r.is_for(&core));
                        return Ok(false);
                    }
                }
            }
        }
    }

    /// Produce one permit (capped by the threshold) and wake the first
    /// waiter whose record is still live.
    pub fn release(&self) {
        {
            let mut st = self.state.lock();
            st.allow = (st.allow + 1).min(st.max);
        }
        loop {
            let rec = self.state.lock().waiters.pop_front();
            match rec {
                Some(rec) => {
                    if rec.wake() {
                        return;
                    }
                }
                None => return,
            }
        }
    }

    /// Refill to the threshold and wake everyone.
    pub fn release_all(&self) {
        let drained: Vec<WaitRecord> = {
            let mut st = self.state.lock();
            st.allow = st.max;
            st.waiters.drain(..).collect()
        };
        for rec in drained {
            rec.wake();
        }
    }

    pub fn is_locked(&self) -> bool {
        self.state.lock().allow == 0
    }
}
