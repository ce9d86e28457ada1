// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Public task surface.
//!
//! A `Task` pairs a function reference with its argument and a shared
//! result. Starting hands the core to the pool; awaiting parks the
//! caller on the result's waiter list. Cancellation bumps the wake
//! generation (orphaning timer/wait records) and is observed at the
//! task's next suspension point.

use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ember_value::{FuncRef, RtError, RtResult, Value};
use parking_lot::Mutex;

use crate::env::ValueEnv;
use crate::runtime::Runtime;
use crate::sched::core::{current, TaskCore};
use crate::sched::park::{suspend, yield_now_future, Wake};
use crate::sched::pool::PoolShared;

pub use crate::sched::core::{Priority, TaskFinish, TaskResult};

/// Construction options mirroring the scheduling fields of a task.
#[derive(Default)]
pub struct TaskOptions {
    pub priority: Priority,
    pub exception_handler: Option<FuncRef>,
    /// Absolute deadline; the task is cancelled when it fires.
    pub timeout: Option<Instant>,
    pub use_task_local: bool,
}

enum Body {
    Func {
        func: FuncRef,
        args: Value,
        exception_handler: Option<FuncRef>,
    },
    /// Pre-built future for runtime-internal tasks (lock supervisors,
    /// acceptor loops, event dispatch).
    Future(ember_value::CallFuture),
}

struct TaskShared {
    core: Arc<TaskCore>,
    payload: Mutex<Option<Body>>,
    /// Yield cursor for `yield_iterate`.
    cursor: Mutex<usize>,
}

/// Cheaply cloneable handle to one fiber.
#[derive(Clone)]
pub struct Task {
    inner: Arc<TaskShared>,
}

impl Task {
    pub fn new(func: FuncRef, args: Value) -> Self {
        Self::with_options(func, args, TaskOptions::default())
    }

    pub fn with_options(func: FuncRef, args: Value, options: TaskOptions) -> Self {
        let core = TaskCore::new(options.priority);
        if let Some(deadline) = options.timeout {
            *core.deadline.lock() = Some(deadline);
        }
        if options.use_task_local {
            let _ = core.task_local.set(Arc::new(ValueEnv::new()));
        }
        Self {
            inner: Arc::new(TaskShared {
                core,
                payload: Mutex::new(Some(Body::Func {
                    func,
                    args,
                    exception_handler: options.exception_handler,
                })),
                cursor: Mutex::new(0),
            }),
        }
    }

    /// Wrap a ready-made future as a task body. The future's value and
    /// errors land in the task result exactly like a function body's.
    pub fn from_future(future: ember_value::CallFuture) -> Self {
        let core = TaskCore::new(Priority::Normal);
        Self {
            inner: Arc::new(TaskShared {
                core,
                payload: Mutex::new(Some(Body::Future(future))),
                cursor: Mutex::new(0),
            }),
        }
    }

    /// A never-scheduled placeholder completed externally. The async
    /// bridge parks a fiber on it and the completion side calls
    /// `complete`/`fail`.
    pub fn dummy() -> Self {
        let core = TaskCore::new(Priority::Normal);
        core.started.store(true, Ordering::Release);
        Self {
            inner: Arc::new(TaskShared {
                core,
                payload: Mutex::new(None),
                cursor: Mutex::new(0),
            }),
        }
    }

    /// An already-ended task carrying the given results.
    pub fn fulfilled(results: Vec<Value>) -> Self {
        let task = Self::dummy();
        for v in results {
            task.inner.core.result.yield_value(v);
        }
        task.inner.core.result.finish(TaskFinish::Completed, None);
        task.inner.core.end_of_life.store(true, Ordering::Release);
        task
    }

    pub(crate) fn core(&self) -> &Arc<TaskCore> {
        &self.inner.core
    }

    /// Allow migration between regular workers.
    pub fn auto_bind_worker_enable(&self, enable: bool) {
        self.inner.core.auto_bind.store(enable, Ordering::Release);
    }

    /// Pin to one worker/executor id; disables auto-bind. Rebinding a
    /// pinned task is refused.
    pub fn set_worker_id(&self, id: u16) -> RtResult<()> {
        let mut bind = self.inner.core.bind_worker.lock();
        if bind.is_some() && !self.inner.core.auto_bind.load(Ordering::Acquire) {
            return Err(RtError::invalid_operation("task is already pinned"));
        }
        *bind = Some(id);
        self.inner.core.auto_bind.store(false, Ordering::Release);
        Ok(())
    }

    pub fn priority(&self) -> Priority {
        self.inner.core.priority
    }

    /// Identity comparison between handles of the same task.
    pub fn same(&self, other: &Task) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn id(&self) -> u64 {
        self.inner.core.task_id()
    }

    pub fn is_ended(&self) -> bool {
        self.inner.core.result.end_of_life()
    }

    pub fn result(&self) -> &Arc<TaskResult> {
        &self.inner.core.result
    }

    /// Hand the task to the scheduler. Starting twice is a no-op;
    /// `started` is entered exactly once.
    pub fn start(&self, rt: &Runtime) -> RtResult<()> {
        rt.ensure_inited()?;
        self.start_on(rt.pool_shared().clone())
    }

    pub(crate) fn start_on(&self, pool: Arc<PoolShared>) -> RtResult<()> {
        let core = self.inner.core.clone();
        if core.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(id) = *core.bind_worker.lock() {
            if !pool.bind_target_exists(id) {
                core.started.store(false, Ordering::Release);
                return Err(RtError::invalid_operation(format!(
                    "bind target {id} does not exist"
                )));
            }
        }
        let Some(payload) = self.inner.payload.lock().take() else {
            core.started.store(false, Ordering::Release);
            return Err(RtError::invalid_operation("dummy task cannot be started"));
        };

        // The boundary future: run the body, land errors/cancellation
        // into the result so awaiters always observe an outcome.
        let wrap_core = core.clone();
        let future = async move {
            let (out, exception_handler) = match payload {
                Body::Func {
                    func,
                    args,
                    exception_handler,
                } => (func.call(args).await, exception_handler),
                Body::Future(fut) => (fut.await, None),
            };
            let result = &wrap_core.result;
            match out {
                Ok(v) => result.finish(TaskFinish::Completed, Some(v)),
                Err(e) if e.is_cancellation() => result.finish(TaskFinish::Cancelled, None),
                Err(e) => match exception_handler {
                    Some(handler) => {
                        let handled = handler
                            .call(Value::Array(vec![Value::Str(e.to_string())]))
                            .await;
                        match handled {
                            Ok(v) => result.finish(TaskFinish::Completed, Some(v)),
                            Err(e2) => result.finish(TaskFinish::Failed(e2), None),
                        }
                    }
                    None => result.finish(TaskFinish::Failed(e), None),
                },
            }
        };
        core.set_future(Box::pin(future));

        if let Some(deadline) = *core.deadline.lock() {
            pool.timer.enqueue_cancel(deadline, &core, core.generation());
        }
        if core.make_cancel.load(Ordering::Acquire) {
            // Cancelled before it ever ran.
            core.result.finish(TaskFinish::Cancelled, None);
            core.end_of_life.store(true, Ordering::Release);
            return Ok(());
        }
        pool.start_task(core);
        Ok(())
    }

    /// Request cancellation: orphan pending wait/timer records, then
    /// wake the task so its next suspension point observes it.
    pub fn notify_cancel(&self) {
        let core = &self.inner.core;
        core.make_cancel.store(true, Ordering::Release);
        core.bump_generation();
        if core.started.load(Ordering::Acquire) {
            core.force_wake();
        } else {
            core.result.finish(TaskFinish::Cancelled, None);
            core.end_of_life.store(true, Ordering::Release);
        }
    }

    /// Complete a dummy task (async-bridge completion side).
    pub fn complete(&self, value: Value) {
        self.inner.core.result.finish(TaskFinish::Completed, Some(value));
        self.inner.core.end_of_life.store(true, Ordering::Release);
    }

    pub fn fail(&self, error: RtError) {
        self.inner.core.result.finish(TaskFinish::Failed(error), None);
        self.inner.core.end_of_life.store(true, Ordering::Release);
    }

    /// Block the calling OS thread until the task ends. For non-task
    /// threads; inside a fiber use `await_task`.
    pub fn join(&self) -> RtResult<Value> {
        let finish = self.inner.core.result.os_wait_end();
        finish_to_value(&self.inner.core, finish)
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id())
            .field("ended", &self.is_ended())
            .finish()
    }
}

fn finish_to_value(core: &Arc<TaskCore>, finish: TaskFinish) -> RtResult<Value> {
    match finish {
        TaskFinish::Completed => {
            let (len, _, _) = core.result.snapshot();
            Ok(if len == 0 {
                Value::None
            } else {
                core.result.get(len - 1).unwrap_or(Value::None)
            })
        }
        TaskFinish::Failed(e) => Err(e),
        TaskFinish::Cancelled => Err(RtError::cancellation()),
        TaskFinish::Pending => Ok(Value::None),
    }
}

fn ambient_pool() -> Option<Arc<PoolShared>> {
    current().and_then(|c| c.pool().cloned())
}

/// Await a task's end, starting it first if the caller's pool can.
/// Returns the final result value; failures and cancellation surface
/// as errors.
pub async fn await_task(task: &Task) -> RtResult<Value> {
    if !task.inner.core.started.load(Ordering::Acquire) {
        match ambient_pool() {
            Some(pool) => task.start_on(pool)?,
            None => return Err(RtError::invalid_operation("task was never started")),
        }
    }
    let result = task.inner.core.result.clone();
    let in_task = current().is_some();
    loop {
        if result.end_of_life() {
            let (_, _, finish) = result.snapshot();
            return finish_to_value(&task.inner.core, finish);
        }
        if !in_task {
            return Err(RtError::invalid_operation(
                "await outside task context; use join",
            ));
        }
        let wake = suspend(|rec| result.register_unless_end(rec)).await;
        if wake == Wake::Cancelled {
            return Err(RtError::cancellation());
        }
    }
}

/// Await every task in order.
pub async fn await_multiple(tasks: &[Task]) -> RtResult<()> {
    for task in tasks {
        let _ = await_task(task).await?;
    }
    Ok(())
}

/// Await all tasks and collect every yielded value of each.
pub async fn await_results(tasks: &[Task]) -> RtResult<Vec<Value>> {
    let mut out = Vec::new();
    for task in tasks {
        let _ = await_task(task).await?;
        out.extend(task.inner.core.result.take_all());
    }
    Ok(out)
}

/// Fetch the i-th yielded value, parking until it exists or the task
/// ends.
pub async fn get_result(task: &Task, index: usize) -> RtResult<Value> {
    if !task.inner.core.started.load(Ordering::Acquire) {
        if let Some(pool) = ambient_pool() {
            task.start_on(pool)?;
        }
    }
    let result = task.inner.core.result.clone();
    let in_task = current().is_some();
    loop {
        if let Some(v) = result.get(index) {
            return Ok(v);
        }
        if result.end_of_life() {
            return Err(RtError::out_of_range(format!(
                "task ended before yield {index}"
            )));
        }
        if !in_task {
            return Err(RtError::invalid_operation("await outside task context"));
        }
        let wake = suspend(|rec| result.register_unless_count(rec, index + 1)).await;
        if wake == Wake::Cancelled {
            return Err(RtError::cancellation());
        }
    }
}

pub fn has_result(task: &Task, index: usize) -> bool {
    task.inner.core.result.get(index).is_some()
}

/// Advance to the next yielded value. True if one was produced, false
/// once the task is out of values and ended.
pub async fn yield_iterate(task: &Task) -> RtResult<bool> {
    let next = *task.inner.cursor.lock();
    // Let a parked yield-mode producer run past its last yield.
    task.inner.core.result.wake_producer();
    let result = task.inner.core.result.clone();
    let in_task = current().is_some();
    loop {
        let (len, eol, _) = result.snapshot();
        if len > next {
            *task.inner.cursor.lock() = next + 1;
            return Ok(true);
        }
        if eol {
            return Ok(false);
        }
        if !in_task {
            return Err(RtError::invalid_operation("await outside task context"));
        }
        let wake = suspend(|rec| result.register_unless_count(rec, next + 1)).await;
        if wake == Wake::Cancelled {
            return Err(RtError::cancellation());
        }
    }
}

/// Yield a value from inside a task. In yield mode the producer parks
/// until an iterator consumes it.
pub async fn yield_result(value: Value) -> RtResult<()> {
    let core = current().ok_or_else(|| RtError::invalid_operation("yield outside task"))?;
    core.result.yield_value(value);
    if core.yield_mode.load(Ordering::Acquire) {
        let result = core.result.clone();
        let wake = suspend(move |rec| {
            result.register_producer(rec);
            true
        })
        .await;
        if wake == Wake::Cancelled {
            return Err(RtError::cancellation());
        }
    }
    Ok(())
}

/// Mark the current task as a lockstep producer: `yield_result` parks
/// until consumed.
pub fn enable_yield_mode() -> RtResult<()> {
    let core = current().ok_or_else(|| RtError::invalid_operation("outside task"))?;
    core.yield_mode.store(true, Ordering::Release);
    Ok(())
}

/// Suspend until `deadline`. External wakes that are neither the timer
/// nor a cancellation put the task back to sleep.
pub async fn sleep_until(deadline: Instant) -> RtResult<()> {
    let core = current().ok_or_else(|| RtError::invalid_operation("sleep outside task"))?;
    let pool = core
        .pool()
        .ok_or_else(|| RtError::invalid_operation("task has no pool"))?
        .clone();
    loop {
        if Instant::now() >= deadline {
            return Ok(());
        }
        let timer_core = core.clone();
        let timer_pool = pool.clone();
        let wake = suspend(move |rec| {
            timer_pool.timer.enqueue(deadline, &timer_core, rec.generation);
            true
        })
        .await;
        match wake {
            Wake::Cancelled => return Err(RtError::cancellation()),
            Wake::Timeout => return Ok(()),
            Wake::Notified => {}
        }
    }
}

pub async fn sleep(duration: Duration) -> RtResult<()> {
    sleep_until(Instant::now() + duration).await
}

/// Reschedule to the back of the queue; observes pending cancellation.
pub async fn yield_now() -> RtResult<()> {
    yield_now_future().await;
    check_cancellation()
}

/// Error out if cancellation is pending on the current task.
pub fn check_cancellation() -> RtResult<()> {
    match current() {
        Some(core) if core.make_cancel.swap(false, Ordering::AcqRel) => {
            Err(RtError::cancellation())
        }
        _ => Ok(()),
    }
}

/// Cancel the current task: the caller returns the error and the task
/// boundary records the cancellation.
pub fn self_cancel() -> RtResult<()> {
    Err(RtError::cancellation())
}

/// Current task's id, 0 outside task context.
pub fn task_id() -> u64 {
    current().map(|c| c.task_id()).unwrap_or(0)
}

pub fn is_task() -> bool {
    current().is_some()
}

/// The current task's local environment, if it was created with one.
pub fn task_local() -> Option<Arc<ValueEnv>> {
    current().and_then(|c| c.task_local.get().cloned())
}

/// Race `future` against a wall-clock budget. `Ok(None)` means the
/// budget elapsed first. Intended for reactor-parked futures; the
/// completion path re-arms the generation so the leftover timer record
/// cannot misfire into a later wait.
pub async fn with_timeout<F: Future>(duration: Duration, future: F) -> RtResult<Option<F::Output>> {
    let core = current().ok_or_else(|| RtError::invalid_operation("timeout outside task"))?;
    let pool = core
        .pool()
        .ok_or_else(|| RtError::invalid_operation("task has no pool"))?
        .clone();
    let deadline = Instant::now() + duration;
    let mut future = Box::pin(future);
    let mut armed = false;

    std::future::poll_fn(move |cx| {
        use std::task::Poll;
        if !armed {
            armed = true;
            pool.timer.enqueue(deadline, &core, core.generation());
        }
        match future.as_mut().poll(cx) {
            Poll::Ready(v) => {
                core.bump_generation();
                core.time_end.store(false, Ordering::Release);
                Poll::Ready(Ok(Some(v)))
            }
            Poll::Pending => {
                if core.time_end.swap(false, Ordering::AcqRel) {
                    core.bump_generation();
                    return Poll::Ready(Ok(None));
                }
                if core.make_cancel.swap(false, Ordering::AcqRel) {
                    core.bump_generation();
                    return Poll::Ready(Err(RtError::cancellation()));
                }
                Poll::Pending
            }
        }
    })
    .await
}

/// Drive a reactor-parked I/O future with cancellation observation:
/// a pending cancel interrupts the wait instead of re-parking.
pub async fn drive_io<T, F>(future: F) -> RtResult<T>
where
    F: Future<Output = std::io::Result<T>>,
{
    let core = current().ok_or_else(|| RtError::invalid_operation("I/O outside task"))?;
    let mut future = Box::pin(future);
    std::future::poll_fn(move |cx| {
        use std::task::Poll;
        match future.as_mut().poll(cx) {
            Poll::Ready(Ok(v)) => Poll::Ready(Ok(v)),
            Poll::Ready(Err(e)) => Poll::Ready(Err(RtError::system(e))),
            Poll::Pending => {
                if core.make_cancel.swap(false, Ordering::AcqRel) {
                    core.bump_generation();
                    return Poll::Ready(Err(RtError::cancellation()));
                }
                Poll::Pending
            }
        }
    })
    .await
}

/// Internal start used by primitives that spawn helper tasks with the
/// ambient pool.
pub(crate) fn start_with_ambient(task: &Task) -> RtResult<()> {
    match ambient_pool() {
        Some(pool) => task.start_on(pool),
        None => Err(RtError::invalid_operation("no ambient pool")),
    }
}
