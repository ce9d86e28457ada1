// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Executor pool.
//!
//! Regular workers own a local queue plus a bound queue and fall back to
//! stealing, then to the global priority injector. Bind-only executors
//! run a fixed set of threads that serve exactly one bound queue. A
//! dedicated reactor thread drives I/O completions.

use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use ember_value::{RtError, RtResult};
use log::{debug, warn};
use parking_lot::{Condvar, Mutex, RwLock};

use crate::arena::{Arena, ArenaHandle};
use crate::reactor::Reactor;
use crate::sched::core::{CurrentGuard, TaskCore, TaskState};
use crate::sched::queue::{InjectorQueue, WorkerQueue};
use crate::sched::timer::TimerQueue;

const PARK_INTERVAL: Duration = Duration::from_millis(5);

pub(crate) struct RegularWorker {
    pub id: u16,
    pub local: WorkerQueue,
    pub bound: WorkerQueue,
    pub retired: AtomicBool,
}

pub(crate) struct BindExecutor {
    pub id: u16,
    pub queue: WorkerQueue,
    pub fixed_count: usize,
    pub implicit_start: bool,
    pub started: AtomicBool,
    pub closed: AtomicBool,
}

pub(crate) struct PoolShared {
    pub injector: InjectorQueue,
    regular: RwLock<Vec<Arc<RegularWorker>>>,
    bind_only: RwLock<Vec<Arc<BindExecutor>>>,
    work_available: (Mutex<bool>, Condvar),
    pub shutdown: AtomicBool,
    pub active_tasks: AtomicUsize,
    all_done: (Mutex<bool>, Condvar),
    reduce_requests: AtomicUsize,
    pub timer: Arc<TimerQueue>,
    pub reactor: Arc<Reactor>,
    pub tasks: Arena<TaskCore>,
    next_worker_id: AtomicU16,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl PoolShared {
    /// Build the pool with `workers` regular workers (0 = CPU count)
    /// and start the reactor thread.
    pub fn new(workers: usize) -> std::io::Result<Arc<Self>> {
        let count = if workers == 0 {
            thread::available_parallelism().map(|p| p.get()).unwrap_or(4)
        } else {
            workers
        };

        let shared = Arc::new(Self {
            injector: InjectorQueue::new(),
            regular: RwLock::new(Vec::new()),
            bind_only: RwLock::new(Vec::new()),
            work_available: (Mutex::new(false), Condvar::new()),
            shutdown: AtomicBool::new(false),
            active_tasks: AtomicUsize::new(0),
            all_done: (Mutex::new(false), Condvar::new()),
            reduce_requests: AtomicUsize::new(0),
            timer: TimerQueue::new(),
            reactor: Arc::new(Reactor::new()?),
            tasks: Arena::new(),
            next_worker_id: AtomicU16::new(0),
            handles: Mutex::new(Vec::new()),
        });

        {
            let s = shared.clone();
            let handle = thread::Builder::new()
                .name("ember-reactor".to_string())
                .spawn(move || reactor_loop(&s))
                .expect("failed to spawn reactor thread");
            shared.handles.lock().push(handle);
        }

        shared.add_regular_workers(count);
        Ok(shared)
    }

    pub fn add_regular_workers(self: &Arc<Self>, count: usize) {
        for _ in 0..count {
            let id = self.next_worker_id.fetch_add(1, Ordering::AcqRel);
            let worker = Arc::new(RegularWorker {
                id,
                local: WorkerQueue::new(),
                bound: WorkerQueue::new(),
                retired: AtomicBool::new(false),
            });
            self.regular.write().push(worker.clone());

            let shared = self.clone();
            let handle = thread::Builder::new()
                .name(format!("ember-worker-{id}"))
                .spawn(move || worker_loop(&worker, &shared))
                .expect("failed to spawn worker thread");
            self.handles.lock().push(handle);
        }
        debug!("pool grew by {count} regular workers");
    }

    /// Ask `count` regular workers to retire after their current task.
    pub fn reduce_regular_workers(&self, count: usize) {
        self.reduce_requests.fetch_add(count, Ordering::AcqRel);
        self.notify_all_workers();
    }

    pub fn regular_worker_count(&self) -> usize {
        self.regular
            .read()
            .iter()
            .filter(|w| !w.retired.load(Ordering::Acquire))
            .count()
    }

    /// Create a bind-only executor with `fixed_count` threads serving
    /// one queue. Returns its id.
    pub fn create_bind_only(self: &Arc<Self>, fixed_count: usize, implicit_start: bool) -> u16 {
        let id = self.next_worker_id.fetch_add(1, Ordering::AcqRel);
        let fixed_count = fixed_count.max(1);
        let executor = Arc::new(BindExecutor {
            id,
            queue: WorkerQueue::new(),
            fixed_count,
            implicit_start,
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        self.bind_only.write().push(executor.clone());
        if !implicit_start {
            self.start_bind_executor(&executor);
        }
        id
    }

    fn start_bind_executor(self: &Arc<Self>, executor: &Arc<BindExecutor>) {
        if executor.started.swap(true, Ordering::AcqRel) {
            return;
        }
        for n in 0..executor.fixed_count {
            let shared = self.clone();
            let ex = executor.clone();
            let handle = thread::Builder::new()
                .name(format!("ember-bound-{}-{n}", executor.id))
                .spawn(move || bind_only_loop(&ex, &shared))
                .expect("failed to spawn bind-only worker");
            self.handles.lock().push(handle);
        }
        debug!(
            "bind-only executor {} started with {} threads",
            executor.id, executor.fixed_count
        );
    }

    pub fn close_bind_only(&self, id: u16) -> RtResult<()> {
        let mut executors = self.bind_only.write();
        let Some(pos) = executors.iter().position(|e| e.id == id) else {
            return Err(RtError::invalid_arguments(format!(
                "unknown bind-only executor {id}"
            )));
        };
        let executor = executors.remove(pos);
        executor.closed.store(true, Ordering::Release);
        drop(executors);
        // Tasks still queued lose their pinning target.
        for task in executor.queue.drain_all() {
            warn!("task {} rescheduled off closed executor {id}", task.task_id());
            self.injector.push(task);
        }
        self.notify_all_workers();
        Ok(())
    }

    pub fn bind_target_exists(&self, id: u16) -> bool {
        self.regular
            .read()
            .iter()
            .any(|w| w.id == id && !w.retired.load(Ordering::Acquire))
            || self.bind_only.read().iter().any(|e| e.id == id)
    }

    /// First schedule of a task: counts it active and assigns its id.
    pub fn start_task(self: &Arc<Self>, core: Arc<TaskCore>) {
        self.active_tasks.fetch_add(1, Ordering::AcqRel);
        let handle = self.tasks.insert(&core);
        let _ = core.id.set(handle.0);
        core.set_pool(self.clone());
        core.store_state(TaskState::Ready);
        self.place(core);
        self.notify_one_worker();
    }

    /// Re-enqueue a woken task.
    pub fn reschedule(self: &Arc<Self>, core: Arc<TaskCore>) {
        self.place(core);
        self.notify_one_worker();
    }

    fn place(self: &Arc<Self>, core: Arc<TaskCore>) {
        let bind = *core.bind_worker.lock();
        match bind {
            Some(id) => {
                if let Some(w) = self
                    .regular
                    .read()
                    .iter()
                    .find(|w| w.id == id && !w.retired.load(Ordering::Acquire))
                {
                    w.bound.push(core);
                    return;
                }
                let executor = self.bind_only.read().iter().find(|e| e.id == id).cloned();
                if let Some(ex) = executor {
                    if !ex.started.load(Ordering::Acquire) && ex.implicit_start {
                        self.start_bind_executor(&ex);
                    }
                    ex.queue.push(core);
                    return;
                }
                warn!(
                    "task {} bound to missing worker {id}; running unbound",
                    core.task_id()
                );
                self.injector.push(core);
            }
            None if core.auto_bind.load(Ordering::Acquire) => {
                // Affinity, not pinning: shortest local queue wins.
                let regular = self.regular.read();
                let target = regular
                    .iter()
                    .filter(|w| !w.retired.load(Ordering::Acquire))
                    .min_by_key(|w| w.local.len());
                match target {
                    Some(w) => w.local.push(core),
                    None => self.injector.push(core),
                }
            }
            None => self.injector.push(core),
        }
    }

    pub fn task_ended(&self, core: &Arc<TaskCore>) {
        if let Some(&id) = core.id.get() {
            self.tasks.remove(ArenaHandle(id));
        }
        let prev = self.active_tasks.fetch_sub(1, Ordering::AcqRel);
        if prev == 1 {
            let (lock, cvar) = &self.all_done;
            let mut done = lock.lock();
            *done = true;
            cvar.notify_all();
        }
    }

    /// Block the calling thread until no tasks remain active.
    pub fn await_no_tasks(&self) {
        let (lock, cvar) = &self.all_done;
        let mut done = lock.lock();
        while self.active_tasks.load(Ordering::Acquire) > 0 {
            *done = false;
            cvar.wait(&mut done);
        }
    }

    pub fn notify_one_worker(&self) {
        let (lock, cvar) = &self.work_available;
        let mut ready = lock.lock();
        *ready = true;
        cvar.notify_all();
    }

    pub fn notify_all_workers(&self) {
        let (lock, cvar) = &self.work_available;
        let mut ready = lock.lock();
        *ready = true;
        cvar.notify_all();
    }

    /// Wait for all tasks, then stop workers, timer, reactor.
    pub fn shutdown(&self) {
        self.await_no_tasks();
        self.shutdown.store(true, Ordering::Release);
        self.timer.stop();
        self.reactor.request_shutdown();
        self.notify_all_workers();

        let mut handles = self.handles.lock();
        for handle in handles.drain(..) {
            let _ = handle.join();
        }
    }

    /// Run tasks on the calling thread until the pool shuts down or no
    /// work remains.
    pub fn become_task_executor(self: &Arc<Self>) {
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return;
            }
            if let Some(task) = self.injector.pop() {
                run_task(task, self);
                continue;
            }
            if self.active_tasks.load(Ordering::Acquire) == 0 {
                return;
            }
            self.park_briefly();
        }
    }

    fn park_briefly(&self) {
        let (lock, cvar) = &self.work_available;
        let mut ready = lock.lock();
        if !*ready {
            cvar.wait_for(&mut ready, PARK_INTERVAL);
        }
        *ready = false;
    }
}

fn worker_loop(worker: &Arc<RegularWorker>, shared: &Arc<PoolShared>) {
    let mut rng: u64 = (worker.id as u64).wrapping_add(0x9E3779B97F4A7C15);

    loop {
        // Pinned work first, then local, steal, global.
        if let Some(task) = worker.bound.pop() {
            run_task(task, shared);
            continue;
        }
        if let Some(task) = worker.local.pop() {
            run_task(task, shared);
            continue;
        }

        {
            let regular = shared.regular.read();
            if regular.len() > 1 {
                let victim = &regular[(xorshift64(&mut rng) as usize) % regular.len()];
                if victim.id != worker.id {
                    let stolen = victim.local.steal_batch();
                    if !stolen.is_empty() {
                        let mut iter = stolen.into_iter();
                        let first = iter.next().unwrap();
                        for task in iter {
                            worker.local.push(task);
                        }
                        drop(regular);
                        run_task(first, shared);
                        continue;
                    }
                }
            }
        }

        if let Some(task) = shared.injector.pop() {
            run_task(task, shared);
            continue;
        }

        // Retire if a reduction was requested.
        let mut reduce = shared.reduce_requests.load(Ordering::Acquire);
        while reduce > 0 {
            match shared.reduce_requests.compare_exchange(
                reduce,
                reduce - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    worker.retired.store(true, Ordering::Release);
                    for task in worker.local.drain_all() {
                        shared.injector.push(task);
                    }
                    for task in worker.bound.drain_all() {
                        shared.injector.push(task);
                    }
                    debug!("worker {} retired", worker.id);
                    return;
                }
                Err(actual) => reduce = actual,
            }
        }

        if shared.shutdown.load(Ordering::Acquire) {
            while let Some(task) = worker.bound.pop() {
                run_task(task, shared);
            }
            while let Some(task) = worker.local.pop() {
                run_task(task, shared);
            }
            return;
        }

        shared.park_briefly();
    }
}

fn bind_only_loop(executor: &Arc<BindExecutor>, shared: &Arc<PoolShared>) {
    loop {
        if let Some(task) = executor.queue.pop() {
            run_task(task, shared);
            continue;
        }
        if executor.closed.load(Ordering::Acquire) || shared.shutdown.load(Ordering::Acquire) {
            return;
        }
        shared.park_briefly();
    }
}

/// Poll one task: state discipline per the waker contract. A wake that
/// lands during poll flips Running→Ready; our Running→Waiting CAS then
/// fails and the task is re-enqueued immediately.
pub(crate) fn run_task(core: Arc<TaskCore>, shared: &Arc<PoolShared>) {
    if core.state() == TaskState::Ended {
        return;
    }
    core.store_state(TaskState::Running);

    let completed = {
        let _guard = CurrentGuard::enter(core.clone());
        core.poll()
    };

    if completed {
        core.store_state(TaskState::Ended);
        core.end_of_life.store(true, Ordering::Release);
        shared.task_ended(&core);
    } else if !core.cas_state(TaskState::Running, TaskState::Waiting) {
        shared.reschedule(core);
    }
}

fn reactor_loop(shared: &Arc<PoolShared>) {
    while !shared.reactor.should_shutdown() {
        let _ = shared.reactor.poll_once(1);
    }
}

fn xorshift64(state: &mut u64) -> u64 {
    let mut x = *state;
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    *state = x;
    x
}
