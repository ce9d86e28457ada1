// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Symbol registry: name → function handle, with atomic rebinding.
//!
//! Lookups take the map's read lock; a hot patch swaps one handle's
//! body slot under its write lock, so a concurrent caller observes the
//! pre- or post-patch body, never a torn state. Handles stay in the map
//! after unload so outstanding `FuncRef`s resolve to `function_not_found`
//! instead of dangling.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use ember_value::{CallFuture, Callable, ErrorKind, RtError, Value};
use log::debug;

use crate::backend::IlBackend;
use crate::body::{FuncBody, FuncCode};
use crate::vtable::TypeRegistry;

type BackendSlot = RwLock<Option<Arc<dyn IlBackend>>>;

/// Named function handle. At most one body is bound at any moment.
pub struct FuncHandle {
    name: String,
    slot: RwLock<Option<Arc<FuncBody>>>,
    backend: Arc<BackendSlot>,
}

impl FuncHandle {
    fn new(name: String, backend: Arc<BackendSlot>) -> Self {
        Self {
            name,
            slot: RwLock::new(None),
            backend,
        }
    }

    /// Current body, if bound.
    pub fn body(&self) -> Option<Arc<FuncBody>> {
        self.slot.read().unwrap().clone()
    }

    pub fn is_bound(&self) -> bool {
        self.slot.read().unwrap().is_some()
    }

    /// Swap the bound body. The previous body lives until the last
    /// in-flight caller drops its `Arc`.
    pub fn rebind(&self, body: Option<Arc<FuncBody>>) {
        *self.slot.write().unwrap() = body;
    }
}

impl Callable for FuncHandle {
    fn name(&self) -> &str {
        &self.name
    }

    fn call(&self, args: Value) -> CallFuture {
        // Clone out of the slot before dispatch; the read lock is never
        // held across the call itself.
        let body = self.body();
        match body {
            None => {
                let name = self.name.clone();
                Box::pin(std::future::ready(Err(RtError::new(
                    ErrorKind::FunctionNotFound,
                    format!("symbol {name} is not bound"),
                ))))
            }
            Some(body) => match &body.code {
                FuncCode::Native(entry) => entry.call(args),
                FuncCode::Il { .. } => {
                    let backend = self.backend.read().unwrap().clone();
                    match backend {
                        Some(backend) => backend.execute(&body, args),
                        None => Box::pin(std::future::ready(Err(RtError::new(
                            ErrorKind::MissingDependency,
                            "no IL backend registered",
                        )))),
                    }
                }
            },
        }
    }
}

/// Process-wide symbol table. Owned by an `Environment`, never global.
pub struct SymbolRegistry {
    map: RwLock<HashMap<String, Arc<FuncHandle>>>,
    backend: Arc<BackendSlot>,
}

impl SymbolRegistry {
    pub fn new() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
            backend: Arc::new(RwLock::new(None)),
        }
    }

    /// Look up a bound symbol. Unbound handles are reported as missing.
    pub fn resolve(&self, name: &str) -> Option<Arc<FuncHandle>> {
        let map = self.map.read().unwrap();
        map.get(name).filter(|h| h.is_bound()).cloned()
    }

    /// Get or create the handle for `name`. The handle's identity is
    /// stable across patches, so held references follow rebinds.
    pub fn handle(&self, name: &str) -> Arc<FuncHandle> {
        if let Some(h) = self.map.read().unwrap().get(name) {
            return h.clone();
        }
        let mut map = self.map.write().unwrap();
        map.entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(FuncHandle::new(name.to_string(), self.backend.clone()))
            })
            .clone()
    }

    /// Atomically bind `body` to `name`.
    pub fn hot_patch(&self, name: &str, body: Arc<FuncBody>) {
        debug!("hot patch {name}");
        self.handle(name).rebind(Some(body));
    }

    /// Remove the binding; subsequent calls fail with `function_not_found`.
    pub fn unload(&self, name: &str) {
        debug!("unload {name}");
        if let Some(h) = self.map.read().unwrap().get(name) {
            h.rebind(None);
        }
    }

    /// Bind a native entry point.
    pub fn register_native(&self, name: &str, entry: ember_value::FuncRef) {
        self.hot_patch(name, Arc::new(FuncBody::native(entry)));
    }

    pub fn set_backend(&self, backend: Arc<dyn IlBackend>) {
        *self.backend.write().unwrap() = Some(backend);
    }

    /// Run a body that is not (and will not be) registered — the
    /// initializer-symbol path of the precompiled loader.
    pub fn execute_detached(&self, body: Arc<FuncBody>, args: Value) -> CallFuture {
        match &body.code {
            FuncCode::Native(entry) => entry.call(args),
            FuncCode::Il { .. } => {
                let backend = self.backend.read().unwrap().clone();
                match backend {
                    Some(backend) => backend.execute(&body, args),
                    None => Box::pin(std::future::ready(Err(RtError::new(
                        ErrorKind::MissingDependency,
                        "no IL backend registered",
                    )))),
                }
            }
        }
    }

    pub fn bound_symbols(&self) -> Vec<String> {
        let map = self.map.read().unwrap();
        map.iter()
            .filter(|(_, h)| h.is_bound())
            .map(|(k, _)| k.clone())
            .collect()
    }
}

impl Default for SymbolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The registry environment: symbols plus structure types. One per
/// runtime, constructed at startup and passed explicitly.
pub struct Environment {
    pub symbols: SymbolRegistry,
    pub types: TypeRegistry,
}

impl Environment {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            symbols: SymbolRegistry::new(),
            types: TypeRegistry::new(),
        })
    }
}
