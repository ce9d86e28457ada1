// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Function bodies (inner handles).
//!
//! A body is either a native entry or an IL payload awaiting the
//! backend. Bodies are shared through `Arc`; a hot patch drops the
//! registry's reference and the old body is reclaimed once the last
//! in-flight caller returns.

use ember_value::FuncRef;

/// Executable payload of a function body.
pub enum FuncCode {
    /// Compiled-in entry point.
    Native(FuncRef),
    /// Loaded bytecode, executed through the registered `IlBackend`.
    Il {
        bytecode: Vec<u8>,
        cross_compiler_version: Option<String>,
        /// Cheap bodies may be inlined by the backend; carried verbatim.
        is_cheap: bool,
    },
}

pub struct FuncBody {
    pub code: FuncCode,
}

impl FuncBody {
    pub fn native(entry: FuncRef) -> Self {
        Self {
            code: FuncCode::Native(entry),
        }
    }

    pub fn il(bytecode: Vec<u8>, cross_compiler_version: Option<String>, is_cheap: bool) -> Self {
        Self {
            code: FuncCode::Il {
                bytecode,
                cross_compiler_version,
                is_cheap,
            },
        }
    }

    pub fn is_native(&self) -> bool {
        matches!(self.code, FuncCode::Native(_))
    }
}

impl std::fmt::Debug for FuncBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.code {
            FuncCode::Native(entry) => write!(f, "FuncBody::Native({})", entry.name()),
            FuncCode::Il {
                bytecode, is_cheap, ..
            } => write!(f, "FuncBody::Il({} bytes, cheap={})", bytecode.len(), is_cheap),
        }
    }
}
