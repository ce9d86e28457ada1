// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Hot-patch loader pipeline.
//!
//! A watched source directory drives language handlers keyed by file
//! extension. During init every handler's patches aggregate into one
//! list applied in a single step; afterwards each file event patches
//! the registry live. The precompiled handler reads the binary
//! function format and skips unchanged symbols by content hash.

pub mod handler;
pub mod precompiled;
pub mod provider;

pub use handler::LanguageHandler;
pub use precompiled::{
    parse_precompiled, write_precompiled, PrecompiledFn, PrecompiledHandler,
};
pub use provider::LanguageProvider;
