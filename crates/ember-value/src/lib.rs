// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Ember runtime base types.
//!
//! The tagged `Value` container, the error taxonomy, and the `Callable`
//! seam that function handles and native bindings plug into. Every other
//! crate in the workspace builds on these.

pub mod call;
pub mod errors;
pub mod value;

pub use call::{native, native_async, CallFuture, Callable, FuncRef, NativeFn};
pub use errors::{ErrorKind, RtError, RtResult};
pub use value::{StructBody, Value};
