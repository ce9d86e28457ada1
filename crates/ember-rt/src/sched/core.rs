// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Task core: the scheduler-facing half of a fiber.
//!
//! State machine driven by poll(); wake-ups are generation-checked so a
//! record enqueued before a timeout/cancel bump can never resume the
//! task. The stored waker is refreshed on every poll, which lets timer
//! entries and wait records carry only `(weak task, generation)`.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::task::{Context, Poll, Wake, Waker};
use std::time::Instant;

use ember_value::{RtError, Value};
use parking_lot::{Condvar, Mutex};

use crate::env::ValueEnv;
use crate::sched::pool::PoolShared;

/// Dispatch priority, strongest first when selecting from the global
/// queue. Aging prevents starvation of the weak bands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Priority {
    Background,
    Low,
    Lower,
    #[default]
    Normal,
    Higher,
    High,
    Realtime,
}

impl Priority {
    /// Queue band index; 0 is dispatched first.
    pub(crate) fn band(self) -> usize {
        match self {
            Priority::Realtime => 0,
            Priority::High => 1,
            Priority::Higher => 2,
            Priority::Normal => 3,
            Priority::Lower => 4,
            Priority::Low => 5,
            Priority::Background => 6,
        }
    }

    pub(crate) const BANDS: usize = 7;
}

/// Task lifecycle states.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskState {
    /// Built but never started.
    Created = 0,
    /// Queued, waiting for a worker.
    Ready = 1,
    /// Being polled right now.
    Running = 2,
    /// Parked on a primitive, timer, or I/O.
    Waiting = 3,
    /// Terminal.
    Ended = 4,
}

impl TaskState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Created,
            1 => Self::Ready,
            2 => Self::Running,
            3 => Self::Waiting,
            _ => Self::Ended,
        }
    }
}

/// How a task finished.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum TaskFinish {
    /// Still running (or never started).
    #[default]
    Pending,
    Completed,
    Failed(RtError),
    Cancelled,
}

pub(crate) type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

pub(crate) struct TaskCore {
    state: AtomicU8,
    pub priority: Priority,
    /// Wake generation. Records carrying an older value are stale.
    awake_check: AtomicU16,
    pub started: AtomicBool,
    pub end_of_life: AtomicBool,
    pub make_cancel: AtomicBool,
    pub time_end: AtomicBool,
    pub awaked: AtomicBool,
    pub yield_mode: AtomicBool,
    pub auto_bind: AtomicBool,
    pub bind_worker: Mutex<Option<u16>>,
    pub deadline: Mutex<Option<Instant>>,
    waker: Mutex<Option<Waker>>,
    future: Mutex<Option<BoxFuture>>,
    pool: OnceLock<Arc<PoolShared>>,
    /// Arena handle, packed; assigned at start.
    pub id: OnceLock<u64>,
    pub result: Arc<TaskResult>,
    pub task_local: OnceLock<Arc<ValueEnv>>,
}

impl TaskCore {
    pub fn new(priority: Priority) -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU8::new(TaskState::Created as u8),
            priority,
            awake_check: AtomicU16::new(0),
            started: AtomicBool::new(false),
            end_of_life: AtomicBool::new(false),
            make_cancel: AtomicBool::new(false),
            time_end: AtomicBool::new(false),
            awaked: AtomicBool::new(false),
            yield_mode: AtomicBool::new(false),
            auto_bind: AtomicBool::new(false),
            bind_worker: Mutex::new(None),
            deadline: Mutex::new(None),
            waker: Mutex::new(None),
            future: Mutex::new(None),
            pool: OnceLock::new(),
            id: OnceLock::new(),
            result: Arc::new(TaskResult::new()),
            task_local: OnceLock::new(),
        })
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn store_state(&self, s: TaskState) {
        self.state.store(s as u8, Ordering::Release);
    }

    pub fn cas_state(&self, from: TaskState, to: TaskState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn generation(&self) -> u16 {
        self.awake_check.load(Ordering::Acquire)
    }

    /// Invalidate every outstanding wait/timer record for this task.
    pub fn bump_generation(&self) -> u16 {
        self.awake_check.fetch_add(1, Ordering::AcqRel).wrapping_add(1)
    }

    pub fn set_future(&self, fut: BoxFuture) {
        *self.future.lock() = Some(fut);
    }

    pub fn set_pool(&self, pool: Arc<PoolShared>) {
        let _ = self.pool.set(pool);
    }

    pub fn pool(&self) -> Option<&Arc<PoolShared>> {
        self.pool.get()
    }

    pub fn task_id(&self) -> u64 {
        self.id.get().copied().unwrap_or(0)
    }

    /// Wake if `generation` is still current. Stale wakes are dropped.
    pub fn try_wake(&self, generation: u16) -> bool {
        if self.generation() != generation {
            return false;
        }
        self.awaked.store(true, Ordering::Release);
        if let Some(w) = self.waker.lock().as_ref() {
            w.wake_by_ref();
        }
        true
    }

    /// Unconditional wake, used by cancellation after the generation
    /// bump has already orphaned pending records.
    pub fn force_wake(&self) {
        self.awaked.store(true, Ordering::Release);
        if let Some(w) = self.waker.lock().as_ref() {
            w.wake_by_ref();
        }
    }

    /// Poll the task's future once. Returns true when it completed.
    pub fn poll(self: &Arc<Self>) -> bool {
        let waker = task_waker(self.clone());
        *self.waker.lock() = Some(waker.clone());
        let mut cx = Context::from_waker(&waker);

        let mut slot = self.future.lock();
        let Some(fut) = slot.as_mut() else {
            return true;
        };
        match fut.as_mut().poll(&mut cx) {
            Poll::Ready(()) => {
                *slot = None;
                true
            }
            Poll::Pending => false,
        }
    }
}

impl std::fmt::Debug for TaskCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskCore")
            .field("id", &self.task_id())
            .field("state", &self.state())
            .field("priority", &self.priority)
            .field("awaked", &self.awaked.load(Ordering::Relaxed))
            .finish()
    }
}

/// Waiter record: weak task + the generation it was enqueued under.
#[derive(Clone)]
pub(crate) struct WaitRecord {
    pub task: Weak<TaskCore>,
    pub generation: u16,
}

impl WaitRecord {
    pub fn for_core(core: &Arc<TaskCore>) -> Self {
        Self {
            task: Arc::downgrade(core),
            generation: core.generation(),
        }
    }

    /// Attempt the wake. False for dead tasks and stale generations.
    pub fn wake(&self) -> bool {
        match self.task.upgrade() {
            Some(core) => core.try_wake(self.generation),
            None => false,
        }
    }

    pub fn is_for(&self, core: &Arc<TaskCore>) -> bool {
        self.task
            .upgrade()
            .map(|t| Arc::ptr_eq(&t, core))
            .unwrap_or(false)
    }
}

struct TaskWaker {
    core: Arc<TaskCore>,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        loop {
            match self.core.state() {
                TaskState::Waiting => {
                    if !self.core.cas_state(TaskState::Waiting, TaskState::Ready) {
                        continue;
                    }
                    if let Some(pool) = self.core.pool() {
                        pool.reschedule(self.core.clone());
                    }
                    return;
                }
                TaskState::Running => {
                    // Wake raced with poll. Flip to Ready so the worker's
                    // Running→Waiting CAS fails and re-enqueues.
                    if !self.core.cas_state(TaskState::Running, TaskState::Ready) {
                        continue;
                    }
                    return;
                }
                TaskState::Created | TaskState::Ready | TaskState::Ended => return,
            }
        }
    }
}

pub(crate) fn task_waker(core: Arc<TaskCore>) -> Waker {
    Waker::from(Arc::new(TaskWaker { core }))
}

// Current-task slot, set only while a worker polls a task.
thread_local! {
    static CURRENT: RefCell<Option<Arc<TaskCore>>> = const { RefCell::new(None) };
}

pub(crate) fn current() -> Option<Arc<TaskCore>> {
    CURRENT.with(|c| c.borrow().clone())
}

pub(crate) struct CurrentGuard {
    prev: Option<Arc<TaskCore>>,
}

impl CurrentGuard {
    pub fn enter(core: Arc<TaskCore>) -> Self {
        let prev = CURRENT.with(|c| c.borrow_mut().replace(core));
        Self { prev }
    }
}

impl Drop for CurrentGuard {
    fn drop(&mut self) {
        let prev = self.prev.take();
        CURRENT.with(|c| *c.borrow_mut() = prev);
    }
}

/// Shared result channel of a task: yielded values, finish status, and
/// both wake paths — fiber records and an OS condvar for plain threads.
pub struct TaskResult {
    state: Mutex<ResultState>,
    os_notify: Condvar,
}

pub(crate) struct ResultState {
    pub results: Vec<Value>,
    pub end_of_life: bool,
    pub finish: TaskFinish,
    waiters: Vec<WaitRecord>,
    /// Parked yield-mode producer waiting for a consumer.
    producer_waiters: Vec<WaitRecord>,
}

impl TaskResult {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(ResultState {
                results: Vec::new(),
                end_of_life: false,
                finish: TaskFinish::Pending,
                waiters: Vec::new(),
                producer_waiters: Vec::new(),
            }),
            os_notify: Condvar::new(),
        }
    }

    /// Append a yielded value and wake every awaiter.
    pub(crate) fn yield_value(&self, value: Value) {
        let waiters = {
            let mut st = self.state.lock();
            st.results.push(value);
            std::mem::take(&mut st.waiters)
        };
        for rec in waiters {
            rec.wake();
        }
        self.os_notify.notify_all();
    }

    /// Terminal transition: record the finish, optionally append a last
    /// value, broadcast. Idempotent.
    pub(crate) fn finish(&self, finish: TaskFinish, last: Option<Value>) {
        let waiters = {
            let mut st = self.state.lock();
            if st.end_of_life {
                return;
            }
            if let Some(v) = last {
                st.results.push(v);
            }
            st.end_of_life = true;
            st.finish = finish;
            let mut waiters = std::mem::take(&mut st.waiters);
            waiters.append(&mut st.producer_waiters);
            waiters
        };
        for rec in waiters {
            rec.wake();
        }
        self.os_notify.notify_all();
    }

    pub(crate) fn push_waiter(&self, rec: WaitRecord) {
        self.state.lock().waiters.push(rec);
    }

    /// Register unless the task already ended. The check happens under
    /// the state lock so a concurrent finish cannot slip between.
    pub(crate) fn register_unless_end(&self, rec: WaitRecord) -> bool {
        let mut st = self.state.lock();
        if st.end_of_life {
            return false;
        }
        st.waiters.push(rec);
        true
    }

    /// Register unless `count` results already exist (or end of life).
    pub(crate) fn register_unless_count(&self, rec: WaitRecord, count: usize) -> bool {
        let mut st = self.state.lock();
        if st.results.len() >= count || st.end_of_life {
            return false;
        }
        st.waiters.push(rec);
        true
    }

    pub(crate) fn register_producer(&self, rec: WaitRecord) {
        self.state.lock().producer_waiters.push(rec);
    }

    /// Wake a parked yield-mode producer, if any.
    pub(crate) fn wake_producer(&self) {
        let waiters = std::mem::take(&mut self.state.lock().producer_waiters);
        for rec in waiters {
            rec.wake();
        }
    }

    pub(crate) fn snapshot(&self) -> (usize, bool, TaskFinish) {
        let st = self.state.lock();
        (st.results.len(), st.end_of_life, st.finish.clone())
    }

    pub(crate) fn get(&self, index: usize) -> Option<Value> {
        self.state.lock().results.get(index).cloned()
    }

    pub(crate) fn take_all(&self) -> Vec<Value> {
        std::mem::take(&mut self.state.lock().results)
    }

    pub fn end_of_life(&self) -> bool {
        self.state.lock().end_of_life
    }

    /// Block the calling OS thread until end of life. For use outside
    /// task context only.
    pub(crate) fn os_wait_end(&self) -> TaskFinish {
        let mut st = self.state.lock();
        while !st.end_of_life {
            self.os_notify.wait(&mut st);
        }
        st.finish.clone()
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_band_order() {
        assert_eq!(Priority::Realtime.band(), 0);
        assert_eq!(Priority::Background.band(), 6);
        assert!(Priority::High > Priority::Normal);
    }

    #[test]
    fn generation_invalidates_records() {
        let core = TaskCore::new(Priority::Normal);
        let rec = WaitRecord::for_core(&core);
        core.bump_generation();
        assert!(!rec.wake());
    }

    #[test]
    fn stale_state_transitions() {
        let core = TaskCore::new(Priority::Normal);
        assert_eq!(core.state(), TaskState::Created);
        core.store_state(TaskState::Running);
        assert!(core.cas_state(TaskState::Running, TaskState::Waiting));
        assert!(!core.cas_state(TaskState::Running, TaskState::Ready));
    }

    #[test]
    fn result_thread_wait() {
        let result = Arc::new(TaskResult::new());
        let r2 = result.clone();
        let t = std::thread::spawn(move || r2.os_wait_end());
        std::thread::sleep(std::time::Duration::from_millis(10));
        result.yield_value(Value::I32(1));
        result.finish(TaskFinish::Completed, Some(Value::I32(2)));
        assert_eq!(t.join().unwrap(), TaskFinish::Completed);
        assert_eq!(result.get(0), Some(Value::I32(1)));
        assert_eq!(result.get(1), Some(Value::I32(2)));
    }
}
