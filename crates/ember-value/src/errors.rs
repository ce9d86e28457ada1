// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime error taxonomy.
//!
//! One kind per failure class, a message, and an optional cause chain.
//! Scheduler primitives raise `InvalidLock`/`InvalidUnlock` synchronously;
//! cancellation travels as `TaskCancellation` through ordinary `Result`
//! returns and is landed at the task boundary.

use thiserror::Error;

/// Classification of a runtime failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum ErrorKind {
    #[error("invalid_cast")]
    InvalidCast,
    #[error("invalid_operation")]
    InvalidOperation,
    #[error("invalid_arguments")]
    InvalidArguments,
    #[error("invalid_lock")]
    InvalidLock,
    #[error("invalid_unlock")]
    InvalidUnlock,
    #[error("invalid_input")]
    InvalidInput,
    #[error("not_implemented")]
    NotImplemented,
    #[error("unsupported_operation")]
    UnsupportedOperation,
    #[error("out_of_range")]
    OutOfRange,
    #[error("bad_class_declaration")]
    BadClassDeclaration,
    #[error("library_not_found")]
    LibraryNotFound,
    #[error("library_function_not_found")]
    LibraryFunctionNotFound,
    #[error("function_not_found")]
    FunctionNotFound,
    #[error("environment_ruin")]
    EnvironmentRuin,
    #[error("invalid_architecture")]
    InvalidArchitecture,
    #[error("stack_overflow")]
    StackOverflow,
    #[error("divide_by_zero")]
    DivideByZero,
    #[error("bad_instruction")]
    BadInstruction,
    #[error("numeric_overflow")]
    NumericOverflow,
    #[error("numeric_underflow")]
    NumericUnderflow,
    #[error("segmentation_fault")]
    SegmentationFault,
    #[error("null_pointer")]
    NullPointer,
    #[error("out_of_memory")]
    OutOfMemory,
    #[error("allocation_failure")]
    AllocationFailure,
    /// OS-level failure; the errno travels in the message.
    #[error("system")]
    System,
    #[error("internal")]
    Internal,
    #[error("deprecated")]
    Deprecated,
    #[error("missing_dependency")]
    MissingDependency,
    #[error("task_cancellation")]
    TaskCancellation,
    #[error("runtime_not_initialized")]
    RuntimeNotInitialized,

    // Compile-time group: raised while loading or linking symbols.
    #[error("compile_time")]
    CompileTime,
    #[error("hot_path")]
    HotPath,
    #[error("symbol")]
    Symbol,
    #[error("invalid_function")]
    InvalidFunction,
    #[error("invalid_il")]
    InvalidIl,
    #[error("invalid_type")]
    InvalidType,
    #[error("bad_operation")]
    BadOperation,
}

/// A runtime error: kind, human message, optional inner cause.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind}: {message}")]
pub struct RtError {
    pub kind: ErrorKind,
    pub message: String,
    #[source]
    pub cause: Option<Box<RtError>>,
}

pub type RtResult<T> = Result<T, RtError>;

impl RtError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
        }
    }

    /// Attach an inner cause, keeping the outer kind.
    pub fn with_cause(mut self, cause: RtError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Walk the cause chain to the innermost error.
    pub fn root_cause(&self) -> &RtError {
        let mut err = self;
        while let Some(ref inner) = err.cause {
            err = inner;
        }
        err
    }

    pub fn is_cancellation(&self) -> bool {
        self.kind == ErrorKind::TaskCancellation
    }

    pub fn invalid_cast(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidCast, message)
    }

    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidOperation, message)
    }

    pub fn invalid_arguments(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArguments, message)
    }

    pub fn invalid_lock(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidLock, message)
    }

    pub fn invalid_unlock(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidUnlock, message)
    }

    pub fn out_of_range(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::OutOfRange, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn cancellation() -> Self {
        Self::new(ErrorKind::TaskCancellation, "task cancelled")
    }

    pub fn not_initialized() -> Self {
        Self::new(ErrorKind::RuntimeNotInitialized, "runtime not initialized")
    }

    /// Wrap an OS error, preserving the errno text.
    pub fn system(err: std::io::Error) -> Self {
        Self::new(ErrorKind::System, err.to_string())
    }
}

impl From<std::io::Error> for RtError {
    fn from(err: std::io::Error) -> Self {
        RtError::system(err)
    }
}
