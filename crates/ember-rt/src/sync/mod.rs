// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Task-aware synchronization primitives.
//!
//! Every primitive keeps a short internal lock for its own bookkeeping
//! and parks fibers through `(task, generation)` records; user-visible
//! lock references go through the `LockRef` union so the relock
//! discipline works across all lock kinds.

pub mod condvar;
pub mod event;
pub mod limiter;
pub mod mutex;
pub mod query;
pub mod rmutex;
pub mod semaphore;
pub mod unify;

pub use condvar::TaskCondVar;
pub use event::{EventPriority, EventSystem};
pub use limiter::TaskLimiter;
pub use mutex::TaskMutex;
pub use query::TaskQuery;
pub use rmutex::TaskRecursiveMutex;
pub use semaphore::TaskSemaphore;
pub use unify::{LockRef, MultiLock, NativeMutex, NativeRecursiveMutex, RelockToken};
