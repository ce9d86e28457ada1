// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! The runtime value.
//!
//! One `Runtime` owns the executor pool, timer queue, reactor, and the
//! registry environment. There are no hidden globals: everything that
//! needs the runtime holds a clone of this handle, and tasks reach it
//! through the pool captured at start.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ember_registry::Environment;
use ember_value::{FuncRef, RtError, RtResult, Value};

use crate::reactor::Reactor;
use crate::sched::pool::PoolShared;
use crate::task::{Task, TaskOptions};

/// Pool sizing and startup knobs.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Regular worker threads; 0 = one per CPU.
    pub workers: usize,
    /// Start the timer thread eagerly instead of on first timed wait.
    pub eager_timer: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            eager_timer: false,
        }
    }
}

struct RuntimeInner {
    pool: Arc<PoolShared>,
    env: Arc<Environment>,
    inited: AtomicBool,
}

/// Cloneable handle to one runtime instance.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    pub fn new() -> RtResult<Self> {
        Self::with_config(RuntimeConfig::default())
    }

    pub fn with_config(config: RuntimeConfig) -> RtResult<Self> {
        let pool = PoolShared::new(config.workers).map_err(RtError::system)?;
        if config.eager_timer {
            pool.timer.explicit_start();
        }
        Ok(Self {
            inner: Arc::new(RuntimeInner {
                pool,
                env: Environment::new(),
                inited: AtomicBool::new(true),
            }),
        })
    }

    pub fn env(&self) -> &Arc<Environment> {
        &self.inner.env
    }

    pub fn reactor(&self) -> &Arc<Reactor> {
        &self.inner.pool.reactor
    }

    pub(crate) fn pool_shared(&self) -> &Arc<PoolShared> {
        &self.inner.pool
    }

    pub fn is_inited(&self) -> bool {
        self.inner.inited.load(Ordering::Acquire)
    }

    pub fn ensure_inited(&self) -> RtResult<()> {
        if self.is_inited() {
            Ok(())
        } else {
            Err(RtError::not_initialized())
        }
    }

    /// Build and start a task in one step.
    pub fn spawn(&self, func: FuncRef, args: Value) -> RtResult<Task> {
        self.spawn_with(func, args, TaskOptions::default())
    }

    pub fn spawn_with(&self, func: FuncRef, args: Value, options: TaskOptions) -> RtResult<Task> {
        let task = Task::with_options(func, args, options);
        task.start(self)?;
        Ok(task)
    }

    /// Add `count` regular workers.
    pub fn create_executor(&self, count: usize) -> RtResult<()> {
        self.ensure_inited()?;
        self.inner.pool.add_regular_workers(count);
        Ok(())
    }

    /// Retire `count` regular workers after their current task.
    pub fn reduce_executor(&self, count: usize) -> RtResult<()> {
        self.ensure_inited()?;
        self.inner.pool.reduce_regular_workers(count);
        Ok(())
    }

    pub fn total_executors(&self) -> usize {
        self.inner.pool.regular_worker_count()
    }

    /// Create a bind-only executor; its id is the pin target for
    /// `Task::set_worker_id`.
    pub fn create_bind_only_executor(
        &self,
        fixed_count: usize,
        allow_implicit_start: bool,
    ) -> RtResult<u16> {
        self.ensure_inited()?;
        Ok(self
            .inner
            .pool
            .create_bind_only(fixed_count, allow_implicit_start))
    }

    pub fn close_bind_only_executor(&self, id: u16) -> RtResult<()> {
        self.ensure_inited()?;
        self.inner.pool.close_bind_only(id)
    }

    /// Start the timer thread now rather than on first timed wait.
    pub fn explicit_start_timer(&self) {
        self.inner.pool.timer.explicit_start();
    }

    /// Block the calling thread until no tasks are active.
    pub fn await_no_tasks(&self) {
        self.inner.pool.await_no_tasks();
    }

    /// Block until every started task has ended. Planned-but-unstarted
    /// tasks do not count; they are not the scheduler's yet.
    pub fn await_end_tasks(&self) {
        self.inner.pool.await_no_tasks();
    }

    /// Turn the calling thread into an executor until the pool shuts
    /// down or runs out of work.
    pub fn become_task_executor(&self) {
        self.inner.pool.become_task_executor();
    }

    /// Wait for tasks, stop workers, timer, reactor. The runtime is
    /// no longer initialized afterwards.
    pub fn shutdown(&self) {
        if self.inner.inited.swap(false, Ordering::AcqRel) {
            self.inner.pool.shutdown();
        }
    }
}

impl Drop for RuntimeInner {
    fn drop(&mut self) {
        if self.inited.swap(false, Ordering::AcqRel) {
            self.pool.shutdown();
        }
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("inited", &self.is_inited())
            .field("executors", &self.total_executors())
            .finish()
    }
}
