// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Event system: five-level priority fan-out of function references.
//!
//! Sync handlers run on the notifying fiber, strongest level first; a
//! truthy return consumes the event and stops the walk. Async handlers
//! are spawned as tasks (`notify`) or awaited in order (`await_notify`).

use std::sync::Arc;

use ember_value::{FuncRef, RtResult, Value};
use parking_lot::Mutex;

use crate::runtime::Runtime;
use crate::task::Task;

/// Delivery priority, strongest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventPriority {
    High,
    UpperAvg,
    #[default]
    Avg,
    LowerAvg,
    Low,
}

impl EventPriority {
    fn index(self) -> usize {
        match self {
            EventPriority::High => 0,
            EventPriority::UpperAvg => 1,
            EventPriority::Avg => 2,
            EventPriority::LowerAvg => 3,
            EventPriority::Low => 4,
        }
    }

    const LEVELS: usize = 5;
}

struct Lists {
    sync_handlers: [Vec<FuncRef>; EventPriority::LEVELS],
    async_handlers: [Vec<FuncRef>; EventPriority::LEVELS],
}

impl Default for Lists {
    fn default() -> Self {
        Self {
            sync_handlers: std::array::from_fn(|_| Vec::new()),
            async_handlers: std::array::from_fn(|_| Vec::new()),
        }
    }
}

#[derive(Default)]
pub struct EventSystem {
    lists: Mutex<Lists>,
}

impl EventSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&self, func: FuncRef, async_mode: bool, priority: EventPriority) {
        let mut lists = self.lists.lock();
        let target = if async_mode {
            &mut lists.async_handlers[priority.index()]
        } else {
            &mut lists.sync_handlers[priority.index()]
        };
        target.push(func);
    }

    /// Remove one registration; true if it was present.
    pub fn leave(&self, func: &FuncRef, async_mode: bool, priority: EventPriority) -> bool {
        let mut lists = self.lists.lock();
        let target = if async_mode {
            &mut lists.async_handlers[priority.index()]
        } else {
            &mut lists.sync_handlers[priority.index()]
        };
        match target.iter().position(|f| Arc::ptr_eq(f, func)) {
            Some(pos) => {
                target.remove(pos);
                true
            }
            None => false,
        }
    }

    fn snapshot_sync(&self) -> Vec<FuncRef> {
        let lists = self.lists.lock();
        lists.sync_handlers.iter().flatten().cloned().collect()
    }

    fn snapshot_async(&self) -> Vec<FuncRef> {
        let lists = self.lists.lock();
        lists.async_handlers.iter().flatten().cloned().collect()
    }

    /// Walk sync handlers high → low; a truthy return consumes the
    /// event.
    pub async fn sync_notify(&self, args: Value) -> RtResult<bool> {
        for handler in self.snapshot_sync() {
            let out = handler.call(args.clone()).await?;
            if out.as_bool().unwrap_or(false) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Sync walk plus fire-and-forget tasks for the async handlers.
    pub async fn notify(&self, rt: &Runtime, args: Value) -> RtResult<bool> {
        for handler in self.snapshot_async() {
            rt.spawn(handler, args.clone())?;
        }
        self.sync_notify(args).await
    }

    /// Sync walk, then await each async handler in priority order.
    pub async fn await_notify(&self, args: Value) -> RtResult<bool> {
        if self.sync_notify(args.clone()).await? {
            return Ok(true);
        }
        for handler in self.snapshot_async() {
            let out = handler.call(args.clone()).await?;
            if out.as_bool().unwrap_or(false) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Perform the whole notification inside a spawned task.
    pub fn async_notify(self: &Arc<Self>, rt: &Runtime, args: Value) -> RtResult<Task> {
        let this = self.clone();
        let rt2 = rt.clone();
        let task = Task::from_future(Box::pin(async move {
            let consumed = this.notify(&rt2, args).await?;
            Ok(Value::Bool(consumed))
        }));
        task.start(rt)?;
        Ok(task)
    }

    pub fn clear(&self) {
        let mut lists = self.lists.lock();
        for list in lists.sync_handlers.iter_mut() {
            list.clear();
        }
        for list in lists.async_handlers.iter_mut() {
            list.clear();
        }
    }
}
