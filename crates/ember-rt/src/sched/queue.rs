// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Ready queues.
//!
//! The global injector is a seven-band priority queue with an aging
//! guard; per-worker queues are plain FIFOs (priority applies at the
//! global selection point). Stealers take half a victim's local queue
//! from the back.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::sched::core::{Priority, TaskCore};

/// Consecutive strong-band dispatches allowed while a weaker band has
/// runnable tasks.
const AGING_LIMIT: u32 = 16;

/// Global injection queue, one FIFO band per priority.
pub(crate) struct InjectorQueue {
    inner: Mutex<InjectorState>,
}

struct InjectorState {
    bands: [VecDeque<Arc<TaskCore>>; Priority::BANDS],
    /// Dispatches from stronger bands since the last weak-band pick.
    strong_streak: u32,
}

impl InjectorQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(InjectorState {
                bands: std::array::from_fn(|_| VecDeque::new()),
                strong_streak: 0,
            }),
        }
    }

    pub fn push(&self, task: Arc<TaskCore>) {
        let band = task.priority.band();
        self.inner.lock().bands[band].push_back(task);
    }

    /// Strict priority pop with aging: after `AGING_LIMIT` consecutive
    /// strong picks, a runnable weaker band gets the slot.
    pub fn pop(&self) -> Option<Arc<TaskCore>> {
        let mut st = self.inner.lock();
        let first = st.bands.iter().position(|b| !b.is_empty())?;
        let lower = st.bands[first + 1..]
            .iter()
            .position(|b| !b.is_empty())
            .map(|off| first + 1 + off);

        let pick = match lower {
            Some(lower) if st.strong_streak >= AGING_LIMIT => {
                st.strong_streak = 0;
                lower
            }
            Some(_) => {
                st.strong_streak += 1;
                first
            }
            None => {
                st.strong_streak = 0;
                first
            }
        };
        st.bands[pick].pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().bands.iter().all(|b| b.is_empty())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().bands.iter().map(|b| b.len()).sum()
    }

    pub fn drain_all(&self) -> Vec<Arc<TaskCore>> {
        let mut st = self.inner.lock();
        let mut out = Vec::new();
        for band in st.bands.iter_mut() {
            out.extend(band.drain(..));
        }
        out
    }
}

/// Per-worker FIFO. The owner pops from the front, stealers take half
/// from the back.
pub(crate) struct WorkerQueue {
    deque: Mutex<VecDeque<Arc<TaskCore>>>,
}

impl WorkerQueue {
    pub fn new() -> Self {
        Self {
            deque: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, task: Arc<TaskCore>) {
        self.deque.lock().push_back(task);
    }

    pub fn pop(&self) -> Option<Arc<TaskCore>> {
        self.deque.lock().pop_front()
    }

    /// Steal half (at least one when non-empty).
    pub fn steal_batch(&self) -> Vec<Arc<TaskCore>> {
        let mut q = self.deque.lock();
        let count = (q.len() / 2).max(usize::from(!q.is_empty()));
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            match q.pop_back() {
                Some(t) => out.push(t),
                None => break,
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.deque.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.deque.lock().is_empty()
    }

    pub fn drain_all(&self) -> Vec<Arc<TaskCore>> {
        self.deque.lock().drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(p: Priority) -> Arc<TaskCore> {
        TaskCore::new(p)
    }

    #[test]
    fn strict_priority_order() {
        let q = InjectorQueue::new();
        q.push(task(Priority::Low));
        q.push(task(Priority::Realtime));
        q.push(task(Priority::Normal));
        assert_eq!(q.pop().unwrap().priority, Priority::Realtime);
        assert_eq!(q.pop().unwrap().priority, Priority::Normal);
        assert_eq!(q.pop().unwrap().priority, Priority::Low);
        assert!(q.pop().is_none());
    }

    #[test]
    fn aging_lets_weak_band_through() {
        let q = InjectorQueue::new();
        for _ in 0..AGING_LIMIT + 8 {
            q.push(task(Priority::High));
        }
        q.push(task(Priority::Background));

        let mut weak_seen_at = None;
        for i in 0..AGING_LIMIT as usize + 9 {
            let t = q.pop().unwrap();
            if t.priority == Priority::Background {
                weak_seen_at = Some(i);
                break;
            }
        }
        // The background task ran before the strong band drained.
        assert_eq!(weak_seen_at, Some(AGING_LIMIT as usize));
    }

    #[test]
    fn worker_queue_steals_half_from_back() {
        let q = WorkerQueue::new();
        for _ in 0..10 {
            q.push(task(Priority::Normal));
        }
        let stolen = q.steal_batch();
        assert_eq!(stolen.len(), 5);
        assert_eq!(q.len(), 5);

        let single = WorkerQueue::new();
        single.push(task(Priority::Normal));
        assert_eq!(single.steal_batch().len(), 1);
        assert!(single.is_empty());
    }
}
