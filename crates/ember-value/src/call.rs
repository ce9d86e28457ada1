// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! The function-reference seam.
//!
//! Tasks, event handlers, accept filters, and patch targets are all
//! `FuncRef`s. A call produces a boxed future so bodies may suspend at
//! scheduler-aware points; plain native bindings wrap a sync closure.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::errors::RtResult;
use crate::value::Value;

/// In-flight call. Completion yields the function's result value.
pub type CallFuture = Pin<Box<dyn Future<Output = RtResult<Value>> + Send + 'static>>;

/// Anything invokable by the runtime.
pub trait Callable: Send + Sync {
    fn name(&self) -> &str;
    fn call(&self, args: Value) -> CallFuture;
}

/// Shared function reference.
pub type FuncRef = Arc<dyn Callable>;

/// Native synchronous binding. The closure runs to completion on the
/// polling worker, so it must not block on non-scheduler primitives.
pub struct NativeFn {
    name: String,
    body: Box<dyn Fn(Value) -> RtResult<Value> + Send + Sync>,
}

impl Callable for NativeFn {
    fn name(&self) -> &str {
        &self.name
    }

    fn call(&self, args: Value) -> CallFuture {
        let result = (self.body)(args);
        Box::pin(std::future::ready(result))
    }
}

/// Wrap a sync closure as a `FuncRef`.
pub fn native<F>(name: impl Into<String>, body: F) -> FuncRef
where
    F: Fn(Value) -> RtResult<Value> + Send + Sync + 'static,
{
    Arc::new(NativeFn {
        name: name.into(),
        body: Box::new(body),
    })
}

struct NativeAsyncFn<F> {
    name: String,
    body: F,
}

impl<F> Callable for NativeAsyncFn<F>
where
    F: Fn(Value) -> CallFuture + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn call(&self, args: Value) -> CallFuture {
        (self.body)(args)
    }
}

/// Wrap a future-returning closure as a `FuncRef`. The usual shape is
/// `native_async("f", |args| Box::pin(async move { ... }))`.
pub fn native_async<F>(name: impl Into<String>, body: F) -> FuncRef
where
    F: Fn(Value) -> CallFuture + Send + Sync + 'static,
{
    Arc::new(NativeAsyncFn {
        name: name.into(),
        body,
    })
}
