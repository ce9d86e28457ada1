// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Task limiter.
//!
//! A semaphore that remembers which fibers hold it: re-acquisition by a
//! holder is a no-op and does not consume a slot; unlock by a
//! non-holder is refused.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use ember_value::{RtError, RtResult};
use parking_lot::Mutex;

use crate::sched::core::{current, WaitRecord};
use crate::sched::park::{suspend, Wake};

struct LimState {
    max: usize,
    holders: Vec<u64>,
    waiters: VecDeque<WaitRecord>,
}

pub struct TaskLimiter {
    state: Mutex<LimState>,
}

impl Default for TaskLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskLimiter {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LimState {
                max: 1,
                holders: Vec::new(),
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Raise or lower the slot count; raising admits queued waiters.
    pub fn set_max_threshold(&self, max: usize) {
        let woken = {
            let mut st = self.state.lock();
            st.max = max.max(1);
            let mut woken = Vec::new();
            while st.holders.len() < st.max {
                match st.waiters.pop_front() {
                    Some(rec) => woken.push(rec),
                    None => break,
                }
            }
            woken
        };
        for rec in woken {
            rec.wake();
        }
    }

    pub async fn lock(&self) -> RtResult<()> {
        let core = current()
            .ok_or_else(|| RtError::invalid_lock("limiter used outside task context"))?;
        let me = core.task_id();
        loop {
            let wake = suspend(|rec| {
                let mut st = self.state.lock();
                if st.holders.contains(&me) {
                    // Already holding: no extra slot consumed.
                    false
                } else if st.holders.len() < st.max {
                    st.holders.push(me);
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
                    let st = self.state.lock();
                    if st.holders.contains(&me) {
                        return Ok(());
                    }
                    if st.holders.len() < st.max {
                        drop(st);
                        // Slot freed; claim on the next pass.
                        continue;
                    }
                }
            }
        }
    }

    pub fn try_lock(&self) -> RtResult<bool> {
        let core = current()
            .ok_or_else(|| RtError::invalid_lock("limiter used outside task context"))?;
        let me = core.task_id();
        let mut st = self.state.lock();
        if st.holders.contains(&me) {
            return Ok(true);
        }
        if st.holders.len() < st.max {
            st.holders.push(me);
            return Ok(true);
        }
        Ok(false)
    }

    pub async fn try_lock_for(&self, timeout: Duration) -> RtResult<bool> {
        self.try_lock_until(Instant::now() + timeout).await
    }

    pub async fn try_lock_until(&self, deadline: Instant) -> RtResult<bool> {
        let core = current()
            .ok_or_else(|| RtError::invalid_lock("limiter used outside task context"))?;
        let me = core.task_id();
        let pool = core
            .pool()
            .ok_or_else(|| RtError::invalid_lock("task has no pool"))?
            .clone();
        loop {
            let timer_core = core.clone();
            let timer_pool = pool.clone();
            let wake = suspend(|rec| {
                let mut st = self.state.lock();
                if st.holders.contains(&me) || st.holders.len() < st.max {
                    if !st.holders.contains(&me) {
                        st.holders.push(me);
                    }
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
                    if st.holders.contains(&me) {
                        return Ok(true);
                    }
                    if st.holders.len() < st.max {
                        st.holders.push(me);
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

    /// Release the caller's slot and wake the first live waiter.
    pub fn unlock(&self) -> RtResult<()> {
        let core = current()
            .ok_or_else(|| RtError::invalid_unlock("limiter used outside task context"))?;
        let me = core.task_id();
        {
            let mut st = self.state.lock();
            let Some(pos) = st.holders.iter().position(|&h| h == me) else {
                return Err(RtError::invalid_unlock("unlock by non-holder"));
            };
            st.holders.remove(pos);
        }
        loop {
            let rec = self.state.lock().waiters.pop_front();
            match rec {
                Some(rec) => {
                    if rec.wake() {
                        return Ok(());
                    }
                }
                None => return Ok(()),
            }
        }
    }

    pub fn is_locked(&self) -> bool {
        let st = self.state.lock();
        st.holders.len() >= st.max
    }
}
