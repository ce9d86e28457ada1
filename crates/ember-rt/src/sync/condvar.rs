// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Task condition variable.
//!
//! `wait` registers the waiter record first, then releases the caller's
//! lock through the relock slot, so a notify between release and park
//! cannot be lost. Wakes come only from notify, timeout, or
//! cancellation — never spuriously.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use ember_value::{RtError, RtResult};
use parking_lot::Mutex;

use crate::sched::core::{current, WaitRecord};
use crate::sched::park::{suspend_with, Wake};
use crate::sync::unify::LockRef;
use crate::task::Task;

#[derive(Default)]
pub struct TaskCondVar {
    waiters: Mutex<VecDeque<WaitRecord>>,
}

impl TaskCondVar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically release `lock`, park, reacquire on wake.
    pub async fn wait(&self, lock: &LockRef) -> RtResult<()> {
        match self.wait_inner(lock, None).await? {
            true => Ok(()),
            false => Ok(()), // timeout impossible without a deadline
        }
    }

    /// Timed wait. False = the timer fired first. The lock is held
    /// again on return either way.
    pub async fn wait_for(&self, lock: &LockRef, timeout: Duration) -> RtResult<bool> {
        self.wait_until(lock, Instant::now() + timeout).await
    }

    pub async fn wait_until(&self, lock: &LockRef, deadline: Instant) -> RtResult<bool> {
        self.wait_inner(lock, Some(deadline)).await
    }

    async fn wait_inner(&self, lock: &LockRef, deadline: Option<Instant>) -> RtResult<bool> {
        let core = current()
            .ok_or_else(|| RtError::invalid_lock("condition variable used outside task"))?;
        lock.relock_precheck()?;
        let pool = core
            .pool()
            .ok_or_else(|| RtError::invalid_lock("task has no pool"))?
            .clone();

        let mut token = None;
        let timer_core = core.clone();
        let wake = suspend_with(
            |rec| {
                if let Some(at) = deadline {
                    pool.timer.enqueue(at, &timer_core, rec.generation);
                }
                self.waiters.lock().push_back(rec);
                true
            },
            || {
                token = Some(lock.relock_begin());
            },
        )
        .await;

        self.waiters.lock().retain(|r| !r.is_for(&core));

        // Reacquire before reporting the outcome, error paths included.
        if let Some(token) = token {
            lock.relock_end(token).await?;
        }
        match wake {
            Wake::Notified => Ok(true),
            Wake::Timeout => Ok(false),
            Wake::Cancelled => Err(RtError::cancellation()),
        }
    }

    /// Park an externally-supplied task record instead of the caller.
    /// Its wake shows up at that task's next poll as a notify.
    pub fn dummy_wait(&self, task: &Task) {
        self.waiters
            .lock()
            .push_back(WaitRecord::for_core(task_core(task)));
    }

    /// `dummy_wait` plus a timer entry under the same generation.
    pub fn dummy_wait_for(&self, task: &Task, timeout: Duration) -> RtResult<()> {
        let core = task_core(task);
        let pool = core
            .pool()
            .ok_or_else(|| RtError::invalid_lock("task has no pool"))?
            .clone();
        let rec = WaitRecord::for_core(core);
        pool.timer
            .enqueue(Instant::now() + timeout, core, rec.generation);
        self.waiters.lock().push_back(rec);
        Ok(())
    }

    /// Wake the head waiter whose record is still live.
    pub fn notify_one(&self) {
        loop {
            let rec = self.waiters.lock().pop_front();
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

    /// Wake every waiter in enqueue order.
    pub fn notify_all(&self) {
        let drained: Vec<WaitRecord> = self.waiters.lock().drain(..).collect();
        for rec in drained {
            rec.wake();
        }
    }

    pub fn has_waiters(&self) -> bool {
        !self.waiters.lock().is_empty()
    }
}

fn task_core(task: &Task) -> &std::sync::Arc<crate::sched::core::TaskCore> {
    task.core()
}
