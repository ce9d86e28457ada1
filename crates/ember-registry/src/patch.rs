// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Staged symbol patches.
//!
//! A patch list maps symbol → body-or-unload. Handlers build one per
//! file event; the provider aggregates lists during init and applies
//! the whole batch in one step. Apply is atomic per symbol: each entry
//! is a single rebind.

use std::collections::HashMap;
use std::sync::Arc;

use ember_value::{ErrorKind, RtError, RtResult};

use crate::body::FuncBody;
use crate::registry::SymbolRegistry;

/// Staged map of rebindings. `None` stages an unload.
#[derive(Default)]
pub struct PatchList {
    patches: HashMap<String, Option<Arc<FuncBody>>>,
}

impl PatchList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage one symbol. A second non-null definition for the same
    /// symbol is a per-file guarantee violation.
    pub fn add_patch(&mut self, symbol: &str, body: Option<Arc<FuncBody>>) -> RtResult<()> {
        match self.patches.get(symbol) {
            Some(Some(_)) if body.is_some() => Err(RtError::new(
                ErrorKind::CompileTime,
                format!(
                    "Symbol must be defined once. Got more than one definition for {symbol} symbol."
                ),
            )),
            // A staged definition wins over a later unload of the same name.
            Some(Some(_)) => Ok(()),
            _ => {
                self.patches.insert(symbol.to_string(), body);
                Ok(())
            }
        }
    }

    /// Merge another list into this one, consuming it.
    pub fn add_patches(&mut self, other: PatchList) -> RtResult<()> {
        for (symbol, body) in other.patches {
            self.add_patch(&symbol, body)?;
        }
        Ok(())
    }

    pub fn remove_patch(&mut self, symbol: &str) {
        self.patches.remove(symbol);
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }

    pub fn len(&self) -> usize {
        self.patches.len()
    }

    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.patches.keys().map(String::as_str)
    }

    /// Apply every staged entry and clear the list. Order across
    /// symbols is unspecified; each symbol flips atomically.
    pub fn apply(&mut self, registry: &SymbolRegistry) {
        for (symbol, body) in self.patches.drain() {
            match body {
                Some(body) => registry.hot_patch(&symbol, body),
                None => registry.unload(&symbol),
            }
        }
    }

    pub fn clear(&mut self) {
        self.patches.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_value::{native, Value};

    fn body(n: i32) -> Arc<FuncBody> {
        Arc::new(FuncBody::native(native("n", move |_| Ok(Value::I32(n)))))
    }

    #[test]
    fn duplicate_definition_rejected() {
        let mut list = PatchList::new();
        list.add_patch("f", Some(body(1))).unwrap();
        let err = list.add_patch("f", Some(body(2))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CompileTime);
        assert!(err.message.contains("defined once"));
    }

    #[test]
    fn unload_then_define_keeps_definition() {
        let mut list = PatchList::new();
        list.add_patch("f", None).unwrap();
        list.add_patch("f", Some(body(1))).unwrap();
        assert_eq!(list.len(), 1);

        let reg = SymbolRegistry::new();
        list.apply(&reg);
        assert!(reg.resolve("f").is_some());
        assert!(list.is_empty());
    }

    #[test]
    fn apply_binds_and_unloads() {
        let reg = SymbolRegistry::new();
        reg.hot_patch("gone", body(9));

        let mut list = PatchList::new();
        list.add_patch("f", Some(body(1))).unwrap();
        list.add_patch("gone", None).unwrap();
        list.apply(&reg);

        assert!(reg.resolve("f").is_some());
        assert!(reg.resolve("gone").is_none());
    }

    #[test]
    fn merge_detects_cross_list_duplicates() {
        let mut a = PatchList::new();
        a.add_patch("f", Some(body(1))).unwrap();
        let mut b = PatchList::new();
        b.add_patch("f", Some(body(2))).unwrap();
        assert!(a.add_patches(b).is_err());
    }
}
