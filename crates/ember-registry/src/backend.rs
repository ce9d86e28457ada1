// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! The IL execution seam.
//!
//! Decoding and JIT compilation are external collaborators; the
//! registry only needs a way to run an IL body. Without a registered
//! backend, calling an IL body fails with `missing_dependency`.

use ember_value::{CallFuture, Value};

use crate::body::FuncBody;

pub trait IlBackend: Send + Sync {
    /// Execute an IL body. `body.code` is guaranteed to be `Il`.
    fn execute(&self, body: &FuncBody, args: Value) -> CallFuture;
}
