// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Symbol and type registries with hot-patch support.
//!
//! A symbol maps to a `FuncHandle` whose inner body can be swapped
//! atomically while callers are in flight; patch lists stage a batch of
//! rebindings and apply them per symbol. VTables describe structure
//! types in either static (frozen) or dynamic (mutable) mode.

pub mod backend;
pub mod body;
pub mod patch;
pub mod registry;
pub mod vtable;

pub use backend::IlBackend;
pub use body::{FuncBody, FuncCode};
pub use patch::PatchList;
pub use registry::{Environment, FuncHandle, SymbolRegistry};
pub use vtable::{StructObj, TypeRegistry, VTable, VtMode};
