// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Caller-synchronous generator.
//!
//! The callee runs on a dedicated thread in strict lockstep with the
//! iterating thread: exactly one side runs at a time, handed off
//! through rendezvous channels. Not task-safe — intended for
//! single-thread iterator use, independent of the scheduler.

use std::collections::VecDeque;
use std::sync::mpsc;
use std::sync::Arc;

use ember_value::{RtError, RtResult, Value};
use parking_lot::Mutex;

use crate::env::ValueEnv;

enum GenEvent {
    Yield(Value),
    Return(Value),
    Error(RtError),
}

enum Resume {
    Continue,
    Kill,
}

/// Handed to the generator body; `yield_` parks the callee until the
/// iterator asks for the next value.
pub struct GenScope {
    events: mpsc::SyncSender<GenEvent>,
    resume: mpsc::Receiver<Resume>,
    local: Arc<ValueEnv>,
}

impl GenScope {
    /// Emit one value and wait for the next iteration. Errors with
    /// cancellation when the generator is dropped mid-iteration.
    pub fn yield_(&self, value: Value) -> RtResult<()> {
        self.events
            .send(GenEvent::Yield(value))
            .map_err(|_| RtError::cancellation())?;
        match self.resume.recv() {
            Ok(Resume::Continue) => Ok(()),
            Ok(Resume::Kill) | Err(_) => Err(RtError::cancellation()),
        }
    }

    /// Generator-local value environment.
    pub fn local(&self) -> &Arc<ValueEnv> {
        &self.local
    }
}

type GenBody = Box<dyn FnOnce(&GenScope, Value) -> RtResult<Value> + Send>;

struct GenShared {
    results: Mutex<VecDeque<Value>>,
    /// Error captured from the callee, rethrown once on next get.
    pending_error: Mutex<Option<RtError>>,
}

enum DriveState {
    /// Not yet started; holds the body and its argument.
    Fresh(GenBody, Value),
    Running {
        resume: mpsc::SyncSender<Resume>,
        events: mpsc::Receiver<GenEvent>,
        thread: std::thread::JoinHandle<()>,
    },
    Done,
}

pub struct Generator {
    shared: Arc<GenShared>,
    drive: Mutex<DriveState>,
    local: Arc<ValueEnv>,
}

impl Generator {
    pub fn new<F>(body: F, args: Value) -> Self
    where
        F: FnOnce(&GenScope, Value) -> RtResult<Value> + Send + 'static,
    {
        Self {
            shared: Arc::new(GenShared {
                results: Mutex::new(VecDeque::new()),
                pending_error: Mutex::new(None),
            }),
            drive: Mutex::new(DriveState::Fresh(Box::new(body), args)),
            local: Arc::new(ValueEnv::new()),
        }
    }

    /// Run the callee until its next yield or its end. True while
    /// values keep coming.
    pub fn yield_iterate(&self) -> RtResult<bool> {
        let mut drive = self.drive.lock();
        match std::mem::replace(&mut *drive, DriveState::Done) {
            DriveState::Fresh(body, args) => {
                // Rendezvous channels: zero capacity, strict handoff.
                let (event_tx, event_rx) = mpsc::sync_channel::<GenEvent>(0);
                let (resume_tx, resume_rx) = mpsc::sync_channel::<Resume>(0);
                let local = self.local.clone();
                let thread = std::thread::Builder::new()
                    .name("ember-generator".to_string())
                    .spawn(move || {
                        let scope = GenScope {
                            events: event_tx,
                            resume: resume_rx,
                            local,
                        };
                        let out = body(&scope, args);
                        let event = match out {
                            Ok(v) => GenEvent::Return(v),
                            Err(e) if e.is_cancellation() => return,
                            Err(e) => GenEvent::Error(e),
                        };
                        let _ = scope.events.send(event);
                    })
                    .map_err(|e| RtError::internal(format!("generator thread: {e}")))?;
                *drive = DriveState::Running {
                    resume: resume_tx,
                    events: event_rx,
                    thread,
                };
                drop(drive);
                self.pump_one()
            }
            DriveState::Running {
                resume,
                events,
                thread,
            } => {
                if resume.send(Resume::Continue).is_err() {
                    // Callee already gone.
                    let _ = thread.join();
                    return Ok(false);
                }
                *drive = DriveState::Running {
                    resume,
                    events,
                    thread,
                };
                drop(drive);
                self.pump_one()
            }
            DriveState::Done => Ok(false),
        }
    }

    /// Receive exactly one event from the callee.
    fn pump_one(&self) -> RtResult<bool> {
        let mut drive = self.drive.lock();
        let outcome = {
            let DriveState::Running { events, .. } = &*drive else {
                return Ok(false);
            };
            events.recv()
        };
        match outcome {
            Ok(GenEvent::Yield(v)) => {
                self.shared.results.lock().push_back(v);
                Ok(true)
            }
            Ok(GenEvent::Return(v)) => {
                self.shared.results.lock().push_back(v);
                self.finish_thread(&mut drive);
                Ok(false)
            }
            Ok(GenEvent::Error(e)) => {
                *self.shared.pending_error.lock() = Some(e);
                self.finish_thread(&mut drive);
                Ok(false)
            }
            Err(_) => {
                self.finish_thread(&mut drive);
                Ok(false)
            }
        }
    }

    fn finish_thread(&self, drive: &mut DriveState) {
        if let DriveState::Running { thread, .. } = std::mem::replace(drive, DriveState::Done) {
            let _ = thread.join();
        }
    }

    /// Pop the next buffered value. A stored callee error surfaces
    /// here exactly once.
    pub fn get_result(&self) -> RtResult<Option<Value>> {
        if let Some(e) = self.shared.pending_error.lock().take() {
            return Err(e);
        }
        Ok(self.shared.results.lock().pop_front())
    }

    pub fn has_result(&self) -> bool {
        !self.shared.results.lock().is_empty()
    }

    /// Iteration is total: past the final value this keeps returning
    /// an empty list deterministically.
    pub fn await_results(&self) -> RtResult<Vec<Value>> {
        while self.yield_iterate()? {}
        if let Some(e) = self.shared.pending_error.lock().take() {
            return Err(e);
        }
        Ok(self.shared.results.lock().drain(..).collect())
    }

    pub fn is_ended(&self) -> bool {
        matches!(*self.drive.lock(), DriveState::Done)
    }

    /// Generator-local value environment.
    pub fn local(&self) -> &Arc<ValueEnv> {
        &self.local
    }
}

impl Drop for Generator {
    fn drop(&mut self) {
        let drive = self.drive.get_mut();
        if let DriveState::Running { resume, thread, .. } =
            std::mem::replace(drive, DriveState::Done)
        {
            // Unblock a callee parked in yield_; it unwinds as cancelled.
            let _ = resume.send(Resume::Kill);
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yields_then_returns() {
        let generator = Generator::new(
            |scope, args| {
                let n = args.as_i64()?;
                for i in 0..n {
                    scope.yield_(Value::I64(i))?;
                }
                Ok(Value::Str("done".into()))
            },
            Value::I64(3),
        );

        assert!(generator.yield_iterate().unwrap());
        assert_eq!(generator.get_result().unwrap(), Some(Value::I64(0)));
        assert!(generator.yield_iterate().unwrap());
        assert!(generator.yield_iterate().unwrap());
        // Final resume runs past the last yield to the return value.
        assert!(!generator.yield_iterate().unwrap());
        assert_eq!(generator.get_result().unwrap(), Some(Value::I64(1)));
        assert_eq!(generator.get_result().unwrap(), Some(Value::I64(2)));
        assert_eq!(
            generator.get_result().unwrap(),
            Some(Value::Str("done".into()))
        );
        assert_eq!(generator.get_result().unwrap(), None);
        assert!(generator.is_ended());
    }

    #[test]
    fn iteration_past_end_is_total() {
        let generator = Generator::new(|_, _| Ok(Value::I32(7)), Value::None);
        assert!(!generator.yield_iterate().unwrap());
        assert!(!generator.yield_iterate().unwrap());
        assert_eq!(generator.get_result().unwrap(), Some(Value::I32(7)));
        assert_eq!(generator.get_result().unwrap(), None);
    }

    #[test]
    fn callee_error_reappears_exactly_once() {
        let generator = Generator::new(
            |scope, _| {
                scope.yield_(Value::I32(1))?;
                Err(RtError::invalid_operation("boom"))
            },
            Value::None,
        );
        assert!(generator.yield_iterate().unwrap());
        assert!(!generator.yield_iterate().unwrap());
        assert_eq!(generator.get_result().unwrap(), Some(Value::I32(1)));
        let err = generator.get_result().unwrap_err();
        assert_eq!(err.kind(), ember_value::ErrorKind::InvalidOperation);
        // Only once.
        assert_eq!(generator.get_result().unwrap(), None);
    }

    #[test]
    fn await_results_collects_everything() {
        let generator = Generator::new(
            |scope, _| {
                scope.yield_(Value::I32(1))?;
                scope.yield_(Value::I32(2))?;
                Ok(Value::I32(3))
            },
            Value::None,
        );
        let all = generator.await_results().unwrap();
        assert_eq!(all, vec![Value::I32(1), Value::I32(2), Value::I32(3)]);
    }

    #[test]
    fn drop_mid_iteration_unwinds_callee() {
        let generator = Generator::new(
            |scope, _| {
                loop {
                    scope.yield_(Value::I32(0))?;
                }
            },
            Value::None,
        );
        assert!(generator.yield_iterate().unwrap());
        drop(generator); // must not hang
    }

    #[test]
    fn generator_local_env() {
        let generator = Generator::new(
            |scope, _| {
                scope.local().set("seen", Value::Bool(true));
                Ok(Value::None)
            },
            Value::None,
        );
        generator.await_results().unwrap();
        assert_eq!(generator.local().get("seen"), Some(Value::Bool(true)));
    }
}
