// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Task mutex.
//!
//! FIFO handoff: unlock passes ownership to the first live waiter
//! before waking it, so a woken fiber checks `owner == self` and either
//! proceeds or re-queues. Timed acquire races a timer entry against the
//! wait record under one generation; whichever fires first invalidates
//! the other.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ember_value::{RtError, RtResult, Value};
use parking_lot::Mutex;

use crate::sched::core::{current, TaskCore, WaitRecord};
use crate::sched::park::{suspend, Wake};
use crate::task::{await_task, start_with_ambient, yield_iterate, Task};

#[derive(Default)]
struct MxState {
    owner: Option<u64>,
    waiters: VecDeque<WaitRecord>,
}

#[derive(Default)]
pub struct TaskMutex {
    state: Mutex<MxState>,
}

fn current_task() -> RtResult<Arc<TaskCore>> {
    current().ok_or_else(|| RtError::invalid_lock("task mutex used outside task context"))
}

impl TaskMutex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self) -> RtResult<()> {
        let core = current_task()?;
        let me = core.task_id();
        if self.state.lock().owner == Some(me) {
            return Err(RtError::invalid_lock("recursive lock of a task mutex"));
        }
        loop {
            let wake = suspend(|rec| {
                let mut st = self.state.lock();
                match st.owner {
                    None => {
                        st.owner = Some(me);
                        false
                    }
                    Some(_) => {
                        st.waiters.push_back(rec);
                        true
                    }
                }
            })
            .await;

            match wake {
                Wake::Cancelled => {
                    self.release_or_cleanup(&core, me);
                    return Err(RtError::cancellation());
                }
                _ => {
                    if self.state.lock().owner == Some(me) {
                        return Ok(());
                    }
                    // Spurious: ownership went elsewhere; queue again.
                }
            }
        }
    }

    pub fn try_lock(&self) -> RtResult<bool> {
        let core = current_task()?;
        let me = core.task_id();
        let mut st = self.state.lock();
        match st.owner {
            None => {
                st.owner = Some(me);
                Ok(true)
            }
            Some(owner) if owner == me => {
                Err(RtError::invalid_lock("recursive lock of a task mutex"))
            }
            Some(_) => Ok(false),
        }
    }

    pub async fn try_lock_for(&self, timeout: Duration) -> RtResult<bool> {
        self.try_lock_until(Instant::now() + timeout).await
    }

    pub async fn try_lock_until(&self, deadline: Instant) -> RtResult<bool> {
        let core = current_task()?;
        let me = core.task_id();
        if self.state.lock().owner == Some(me) {
            return Err(RtError::invalid_lock("recursive lock of a task mutex"));
        }
        let pool = core
            .pool()
            .ok_or_else(|| RtError::invalid_lock("task has no pool"))?
            .clone();
        loop {
            let timer_core = core.clone();
            let timer_pool = pool.clone();
            let wake = suspend(|rec| {
                let mut st = self.state.lock();
                match st.owner {
                    None => {
                        st.owner = Some(me);
                        false
                    }
                    Some(_) => {
                        // One generation covers both the wait record and
                        // the timer entry; the first wake wins.
                        timer_pool.timer.enqueue(deadline, &timer_core, rec.generation);
                        st.waiters.push_back(rec);
                        true
                    }
                }
            })
            .await;

            // The lock may have been handed to us in the same instant a
            // timeout or cancel fired; ownership decides.
            let owned = self.state.lock().owner == Some(me);
            match wake {
                Wake::Cancelled => {
                    self.release_or_cleanup(&core, me);
                    return Err(RtError::cancellation());
                }
                Wake::Timeout => {
                    if owned {
                        return Ok(true);
                    }
                    self.remove_waiter(&core);
                    return Ok(false);
                }
                Wake::Notified => {
                    if owned {
                        return Ok(true);
                    }
                    if Instant::now() >= deadline {
                        self.remove_waiter(&core);
                        return Ok(false);
                    }
                }
            }
        }
    }

    /// Release; ownership moves to the head waiter (FIFO), skipping
    /// records whose generation went stale.
    pub fn unlock(&self) -> RtResult<()> {
        let core = current_task().map_err(|_| RtError::invalid_unlock("outside task context"))?;
        let me = core.task_id();
        let mut st = self.state.lock();
        if st.owner != Some(me) {
            return Err(RtError::invalid_unlock("unlock by non-owner"));
        }
        let next = Self::pass_ownership(&mut st);
        drop(st);
        if let Some(rec) = next {
            rec.wake();
        }
        Ok(())
    }

    fn pass_ownership(st: &mut MxState) -> Option<WaitRecord> {
        while let Some(rec) = st.waiters.pop_front() {
            if let Some(task) = rec.task.upgrade() {
                if task.generation() == rec.generation {
                    st.owner = Some(task.task_id());
                    return Some(rec);
                }
            }
        }
        st.owner = None;
        None
    }

    /// After a cancelled/aborted wait: if ownership was handed to us in
    /// the race, pass it on; otherwise drop our queue entry.
    fn release_or_cleanup(&self, core: &Arc<TaskCore>, me: u64) {
        let mut st = self.state.lock();
        if st.owner == Some(me) {
            let next = Self::pass_ownership(&mut st);
            drop(st);
            if let Some(rec) = next {
                rec.wake();
            }
        } else {
            st.waiters.retain(|r| !r.is_for(core));
        }
    }

    fn remove_waiter(&self, core: &Arc<TaskCore>) {
        self.state.lock().waiters.retain(|r| !r.is_for(core));
    }

    pub fn is_locked(&self) -> bool {
        self.state.lock().owner.is_some()
    }

    /// Does the current task own this mutex?
    pub fn is_owned(&self) -> bool {
        match current() {
            Some(core) => self.state.lock().owner == Some(core.task_id()),
            None => false,
        }
    }

    /// Hold the mutex for the whole life of `child`: acquired before it
    /// starts, released when it ends. Returns the supervisor task.
    pub fn lifecycle_lock(self: &Arc<Self>, child: Task) -> RtResult<Task> {
        let mutex = self.clone();
        let supervisor = Task::from_future(Box::pin(async move {
            mutex.lock().await?;
            let out = await_task(&child).await;
            mutex.unlock()?;
            out.map(|_| Value::None)
        }));
        start_with_ambient(&supervisor)?;
        Ok(supervisor)
    }

    /// Hold the mutex while `child` runs, releasing and reacquiring
    /// around every value it yields, releasing for good at end of life.
    pub fn sequence_lock(self: &Arc<Self>, child: Task) -> RtResult<Task> {
        let mutex = self.clone();
        let supervisor = Task::from_future(Box::pin(async move {
            mutex.lock().await?;
            start_with_ambient(&child)?;
            loop {
                let more = match yield_iterate(&child).await {
                    Ok(more) => more,
                    Err(e) => {
                        mutex.unlock()?;
                        return Err(e);
                    }
                };
                mutex.unlock()?;
                if !more {
                    break;
                }
                mutex.lock().await?;
            }
            Ok(Value::None)
        }));
        start_with_ambient(&supervisor)?;
        Ok(supervisor)
    }
}
