// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! The language-handler contract.
//!
//! A handler may do anything with the file, but the intended shape is:
//! compile sources and return a patch list for the runtime to apply.

use std::path::Path;

use ember_registry::PatchList;
use ember_value::RtResult;

pub trait LanguageHandler: Send + Sync {
    /// Pre-start pass: parse the file, stage its symbols. Nothing is
    /// applied until init completes.
    fn handle_init(&self, path: &Path) -> RtResult<PatchList>;

    /// After every file was seen: cross-file linking patches.
    fn handle_init_complete(&self) -> RtResult<PatchList>;

    /// A file appeared while running.
    fn handle_create(&self, path: &Path) -> RtResult<PatchList>;

    /// A file moved; per-file bookkeeping follows the new name.
    fn handle_renamed(&self, old: &Path, new: &Path) -> RtResult<PatchList>;

    fn handle_changed(&self, path: &Path) -> RtResult<PatchList>;

    /// A file vanished: every symbol it declared unloads.
    fn handle_removed(&self, path: &Path) -> RtResult<PatchList>;
}
