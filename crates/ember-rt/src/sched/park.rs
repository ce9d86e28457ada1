// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Suspension points.
//!
//! `suspend` is the single place a fiber parks: it registers a
//! `(task, generation)` record with whatever primitive is waiting on,
//! runs the park hook (lock releases) after registration, and on wake
//! bumps the generation — orphaning every other record from the same
//! wait — before classifying the wake as notified, timeout, or
//! cancellation.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::task::{Context, Poll};

use crate::sched::core::{current, WaitRecord};

/// Why a suspension ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Wake {
    Notified,
    Timeout,
    Cancelled,
}

pub(crate) struct Suspend<R, P> {
    register: Option<R>,
    on_park: Option<P>,
    parked: bool,
}

/// Park the current task. `register` receives the wait record and
/// returns false to skip parking (condition already satisfied).
pub(crate) fn suspend<R>(register: R) -> Suspend<R, fn()>
where
    R: FnOnce(WaitRecord) -> bool + Unpin,
{
    Suspend {
        register: Some(register),
        on_park: None,
        parked: false,
    }
}

/// Like `suspend`, with a hook that runs after the record is
/// registered and before control returns to the worker. Lock releases
/// go here so a wake between release and park cannot be lost.
pub(crate) fn suspend_with<R, P>(register: R, on_park: P) -> Suspend<R, P>
where
    R: FnOnce(WaitRecord) -> bool + Unpin,
    P: FnOnce() + Unpin,
{
    Suspend {
        register: Some(register),
        on_park: Some(on_park),
        parked: false,
    }
}

impl<R, P> Future for Suspend<R, P>
where
    R: FnOnce(WaitRecord) -> bool + Unpin,
    P: FnOnce() + Unpin,
{
    type Output = Wake;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Wake> {
        let this = self.get_mut();
        let core = current().expect("suspension point outside task context");

        if !this.parked {
            // Pending cancellation is observed before parking.
            if core.make_cancel.swap(false, Ordering::AcqRel) {
                return Poll::Ready(Wake::Cancelled);
            }
            let rec = WaitRecord::for_core(&core);
            let register = this.register.take().expect("polled after completion");
            if !register(rec) {
                return Poll::Ready(Wake::Notified);
            }
            if let Some(hook) = this.on_park.take() {
                hook();
            }
            this.parked = true;
            return Poll::Pending;
        }

        // Woken. Invalidate sibling records (timer vs. waiter race),
        // then classify.
        core.bump_generation();
        core.awaked.store(false, Ordering::Release);
        if core.make_cancel.swap(false, Ordering::AcqRel) {
            return Poll::Ready(Wake::Cancelled);
        }
        if core.time_end.swap(false, Ordering::AcqRel) {
            return Poll::Ready(Wake::Timeout);
        }
        Poll::Ready(Wake::Notified)
    }
}

/// Reschedule the current task to the back of its queue.
pub(crate) struct YieldNow {
    yielded: bool,
}

pub(crate) fn yield_now_future() -> YieldNow {
    YieldNow { yielded: false }
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}
