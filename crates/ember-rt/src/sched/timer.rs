// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Global timer queue.
//!
//! Min-heap of `(deadline, weak task, generation)` drained by one timer
//! thread. The thread starts lazily on the first timed wait, or eagerly
//! via `explicit_start`. A popped entry whose generation is stale is
//! discarded — the wait it belonged to already resolved another way.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Instant;

use log::trace;
use parking_lot::{Condvar, Mutex};

use crate::sched::core::TaskCore;

struct TimerEntry {
    at: Instant,
    seq: u64,
    task: Weak<TaskCore>,
    generation: u16,
    /// Task-deadline entries cancel instead of merely timing out.
    cancel: bool,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}
impl Eq for TimerEntry {}
impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.at, self.seq).cmp(&(other.at, other.seq))
    }
}

pub(crate) struct TimerQueue {
    inner: Mutex<TimerState>,
    cv: Condvar,
    started: AtomicBool,
    shutdown: AtomicBool,
}

struct TimerState {
    heap: BinaryHeap<Reverse<TimerEntry>>,
    next_seq: u64,
}

impl TimerQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(TimerState {
                heap: BinaryHeap::new(),
                next_seq: 0,
            }),
            cv: Condvar::new(),
            started: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        })
    }

    /// Enqueue a timed wake for `task` under its current generation.
    /// Starts the timer thread on first use.
    pub fn enqueue(self: &Arc<Self>, at: Instant, task: &Arc<TaskCore>, generation: u16) {
        self.push_entry(at, task, generation, false);
    }

    /// Enqueue a task deadline: firing requests cancellation.
    pub fn enqueue_cancel(self: &Arc<Self>, at: Instant, task: &Arc<TaskCore>, generation: u16) {
        self.push_entry(at, task, generation, true);
    }

    fn push_entry(self: &Arc<Self>, at: Instant, task: &Arc<TaskCore>, generation: u16, cancel: bool) {
        {
            let mut st = self.inner.lock();
            let seq = st.next_seq;
            st.next_seq += 1;
            st.heap.push(Reverse(TimerEntry {
                at,
                seq,
                task: Arc::downgrade(task),
                generation,
                cancel,
            }));
        }
        self.cv.notify_one();
        self.ensure_started();
    }

    /// Start the timer thread eagerly.
    pub fn explicit_start(self: &Arc<Self>) {
        self.ensure_started();
    }

    fn ensure_started(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let queue = self.clone();
        thread::Builder::new()
            .name("ember-timer".to_string())
            .spawn(move || queue.run())
            .expect("failed to spawn timer thread");
    }

    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.cv.notify_all();
    }

    fn run(self: Arc<Self>) {
        let mut st = self.inner.lock();
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return;
            }
            let now = Instant::now();
            // Fire everything due.
            while let Some(Reverse(head)) = st.heap.peek() {
                if head.at > now {
                    break;
                }
                let Reverse(entry) = st.heap.pop().unwrap();
                if let Some(core) = entry.task.upgrade() {
                    if core.generation() == entry.generation {
                        trace!("timer fired for task {}", core.task_id());
                        if entry.cancel {
                            core.make_cancel.store(true, Ordering::Release);
                        }
                        core.time_end.store(true, Ordering::Release);
                        core.try_wake(entry.generation);
                    }
                }
            }
            match st.heap.peek() {
                Some(Reverse(head)) => {
                    let wait = head.at.saturating_duration_since(Instant::now());
                    self.cv.wait_for(&mut st, wait);
                }
                None => self.cv.wait(&mut st),
            }
        }
    }

    #[cfg(test)]
    pub fn pending(&self) -> usize {
        self.inner.lock().heap.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::core::Priority;
    use std::time::Duration;

    #[test]
    fn due_entry_sets_time_end() {
        let q = TimerQueue::new();
        let core = TaskCore::new(Priority::Normal);
        q.enqueue(Instant::now() + Duration::from_millis(10), &core, core.generation());
        std::thread::sleep(Duration::from_millis(80));
        assert!(core.time_end.load(Ordering::Acquire));
        q.stop();
    }

    #[test]
    fn stale_generation_is_dropped() {
        let q = TimerQueue::new();
        let core = TaskCore::new(Priority::Normal);
        let gen = core.generation();
        q.enqueue(Instant::now() + Duration::from_millis(10), &core, gen);
        core.bump_generation();
        std::thread::sleep(Duration::from_millis(80));
        assert!(!core.time_end.load(Ordering::Acquire));
        q.stop();
    }

    #[test]
    fn dead_task_entry_ignored() {
        let q = TimerQueue::new();
        {
            let core = TaskCore::new(Priority::Normal);
            q.enqueue(Instant::now() + Duration::from_millis(5), &core, 0);
        }
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(q.pending(), 0);
        q.stop();
    }
}
