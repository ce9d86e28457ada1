// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Task query: bounded-concurrency work aggregation.
//!
//! Added tasks run at most `max_at_execution` at a time; each
//! completion pulls the next queued task in. `wait` parks until the
//! query drains.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ember_value::{native_async, FuncRef, RtError, RtResult, Value};
use parking_lot::Mutex;

use crate::runtime::Runtime;
use crate::sched::core::{current, WaitRecord};
use crate::sched::park::{suspend, Wake};
use crate::task::{Task, TaskOptions};

struct QState {
    queued: VecDeque<Task>,
    running: Vec<Task>,
    max: usize,
    enabled: bool,
    waiters: Vec<WaitRecord>,
}

struct QueryInner {
    rt: Runtime,
    state: Mutex<QState>,
}

impl QueryInner {
    fn pump(self: &Arc<Self>) {
        let to_start = {
            let mut st = self.state.lock();
            let mut out = Vec::new();
            while st.enabled && (st.max == 0 || st.running.len() < st.max) {
                match st.queued.pop_front() {
                    Some(task) => {
                        st.running.push(task.clone());
                        out.push(task);
                    }
                    None => break,
                }
            }
            out
        };
        for task in to_start {
            if let Err(e) = task.start(&self.rt) {
                log::warn!("query task failed to start: {e}");
                self.on_done(&task);
            }
        }
    }

    fn on_done(self: &Arc<Self>, task: &Task) {
        let drained = {
            let mut st = self.state.lock();
            if let Some(pos) = st.running.iter().position(|t| t.same(task)) {
                st.running.remove(pos);
            }
            if st.running.is_empty() && st.queued.is_empty() {
                std::mem::take(&mut st.waiters)
            } else {
                Vec::new()
            }
        };
        for rec in drained {
            rec.wake();
        }
        self.pump();
    }
}

pub struct TaskQuery {
    inner: Arc<QueryInner>,
}

impl TaskQuery {
    /// `at_execution_max` of 0 means unbounded.
    pub fn new(rt: &Runtime, at_execution_max: usize) -> Self {
        Self {
            inner: Arc::new(QueryInner {
                rt: rt.clone(),
                state: Mutex::new(QState {
                    queued: VecDeque::new(),
                    running: Vec::new(),
                    max: at_execution_max,
                    enabled: true,
                    waiters: Vec::new(),
                }),
            }),
        }
    }

    /// Queue a function; it starts as soon as a slot frees up. The
    /// returned task can be awaited like any other.
    pub fn add_task(&self, func: FuncRef, args: Value, options: TaskOptions) -> Task {
        let inner = self.inner.clone();
        let done_inner = self.inner.clone();
        let done_slot: Arc<Mutex<Option<Task>>> = Arc::new(Mutex::new(None));
        let call_slot = done_slot.clone();
        // Decorate the body so completion pulls the next queued task.
        let wrapped = native_async(func.name().to_string(), move |call_args| {
            let func = func.clone();
            let done_inner = done_inner.clone();
            let call_slot = call_slot.clone();
            Box::pin(async move {
                let out = func.call(call_args).await;
                if let Some(task) = call_slot.lock().clone() {
                    done_inner.on_done(&task);
                }
                out
            })
        });
        let task = Task::with_options(wrapped, args, options);
        *done_slot.lock() = Some(task.clone());

        self.inner.state.lock().queued.push_back(task.clone());
        inner.pump();
        task
    }

    pub fn enable(&self) {
        self.inner.state.lock().enabled = true;
        self.inner.pump();
    }

    /// Stop pulling queued tasks in; running tasks finish normally.
    pub fn disable(&self) {
        self.inner.state.lock().enabled = false;
    }

    pub fn in_query(&self, task: &Task) -> bool {
        let st = self.inner.state.lock();
        st.queued.iter().any(|t| t.same(task)) || st.running.iter().any(|t| t.same(task))
    }

    pub fn set_max_at_execution(&self, max: usize) {
        self.inner.state.lock().max = max;
        self.inner.pump();
    }

    pub fn get_max_at_execution(&self) -> usize {
        self.inner.state.lock().max
    }

    fn is_drained(&self) -> bool {
        let st = self.inner.state.lock();
        st.queued.is_empty() && st.running.is_empty()
    }

    /// Park until every queued and running task has finished.
    pub async fn wait(&self) -> RtResult<()> {
        current().ok_or_else(|| RtError::invalid_operation("query wait outside task context"))?;
        loop {
            let wake = suspend(|rec| {
                let mut st = self.inner.state.lock();
                if st.queued.is_empty() && st.running.is_empty() {
                    return false;
                }
                st.waiters.push(rec);
                true
            })
            .await;
            match wake {
                Wake::Cancelled => return Err(RtError::cancellation()),
                _ => {
                    if self.is_drained() {
                        return Ok(());
                    }
                }
            }
        }
    }

    pub async fn wait_for(&self, timeout: Duration) -> RtResult<bool> {
        self.wait_until(Instant::now() + timeout).await
    }

    /// Timed drain wait; false if the deadline passed first.
    pub async fn wait_until(&self, deadline: Instant) -> RtResult<bool> {
        let core = current()
            .ok_or_else(|| RtError::invalid_operation("query wait outside task context"))?;
        let pool = core
            .pool()
            .ok_or_else(|| RtError::invalid_operation("task has no pool"))?
            .clone();
        loop {
            let timer_core = core.clone();
            let timer_pool = pool.clone();
            let wake = suspend(|rec| {
                let mut st = self.inner.state.lock();
                if st.queued.is_empty() && st.running.is_empty() {
                    return false;
                }
                timer_pool.timer.enqueue(deadline, &timer_core, rec.generation);
                st.waiters.push(rec);
                true
            })
            .await;
            match wake {
                Wake::Cancelled => return Err(RtError::cancellation()),
                Wake::Timeout => return Ok(self.is_drained()),
                Wake::Notified => {
                    if self.is_drained() {
                        return Ok(true);
                    }
                    if Instant::now() >= deadline {
                        return Ok(false);
                    }
                }
            }
        }
    }
}
