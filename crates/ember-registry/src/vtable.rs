// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Structure types: VTables and instances.
//!
//! A VTable is the method/field descriptor of a structure type. Static
//! tables are frozen at attach time; dynamic tables accept definition
//! and removal at runtime. One `TypeRegistry` per environment maps type
//! names to their tables.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use ember_value::{CallFuture, FuncRef, RtError, RtResult, StructBody, Value};

/// Table mode: static forbids mutation after construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VtMode {
    Static,
    Dynamic,
}

/// Method/field descriptor for one structure type.
pub struct VTable {
    name: String,
    mode: VtMode,
    methods: RwLock<HashMap<String, FuncRef>>,
    /// Declared field set. Static instances may only hold these fields.
    fields: RwLock<Vec<String>>,
}

impl VTable {
    /// Fixed table baked at attach time.
    pub fn new_static(
        name: impl Into<String>,
        methods: Vec<(String, FuncRef)>,
        fields: Vec<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            mode: VtMode::Static,
            methods: RwLock::new(methods.into_iter().collect()),
            fields: RwLock::new(fields),
        })
    }

    /// Mutable table.
    pub fn new_dynamic(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            mode: VtMode::Dynamic,
            methods: RwLock::new(HashMap::new()),
            fields: RwLock::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> VtMode {
        self.mode
    }

    fn require_dynamic(&self, op: &str) -> RtResult<()> {
        if self.mode == VtMode::Static {
            return Err(RtError::invalid_operation(format!(
                "{op} on static vtable {}",
                self.name
            )));
        }
        Ok(())
    }

    pub fn define_method(&self, name: &str, entry: FuncRef) -> RtResult<()> {
        self.require_dynamic("define_method")?;
        self.methods.write().unwrap().insert(name.to_string(), entry);
        Ok(())
    }

    pub fn remove_method(&self, name: &str) -> RtResult<()> {
        self.require_dynamic("remove_method")?;
        self.methods.write().unwrap().remove(name);
        Ok(())
    }

    pub fn define_field(&self, name: &str) -> RtResult<()> {
        self.require_dynamic("define_field")?;
        let mut fields = self.fields.write().unwrap();
        if !fields.iter().any(|f| f == name) {
            fields.push(name.to_string());
        }
        Ok(())
    }

    pub fn method(&self, name: &str) -> RtResult<FuncRef> {
        self.methods.read().unwrap().get(name).cloned().ok_or_else(|| {
            RtError::new(
                ember_value::ErrorKind::FunctionNotFound,
                format!("method {name} of {}", self.name),
            )
        })
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.fields.read().unwrap().iter().any(|f| f == name)
    }

    pub fn method_names(&self) -> Vec<String> {
        self.methods.read().unwrap().keys().cloned().collect()
    }
}

/// A structure instance: field map + its table.
pub struct StructObj {
    vtable: Arc<VTable>,
    fields: RwLock<HashMap<String, Value>>,
}

impl StructObj {
    pub fn new(vtable: Arc<VTable>) -> Arc<Self> {
        Arc::new(Self {
            vtable,
            fields: RwLock::new(HashMap::new()),
        })
    }

    pub fn vtable(&self) -> &Arc<VTable> {
        &self.vtable
    }

    pub fn get_field(&self, name: &str) -> RtResult<Value> {
        self.fields.read().unwrap().get(name).cloned().ok_or_else(|| {
            RtError::out_of_range(format!("field {name} of {}", self.vtable.name()))
        })
    }

    /// Static types accept only declared fields.
    pub fn set_field(&self, name: &str, value: Value) -> RtResult<()> {
        if self.vtable.mode() == VtMode::Static && !self.vtable.has_field(name) {
            return Err(RtError::invalid_operation(format!(
                "field {name} not declared on static type {}",
                self.vtable.name()
            )));
        }
        self.fields.write().unwrap().insert(name.to_string(), value);
        Ok(())
    }

    /// Dispatch a method, passing the instance as the first argument.
    pub fn call_method(self: &Arc<Self>, name: &str, mut args: Vec<Value>) -> RtResult<CallFuture> {
        let entry = self.vtable.method(name)?;
        args.insert(0, Value::Struct(self.clone() as Arc<dyn StructBody>));
        Ok(entry.call(Value::Array(args)))
    }
}

impl StructBody for StructObj {
    fn type_name(&self) -> &str {
        self.vtable.name()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Name → VTable map. Attach replaces any previous table of the same name.
pub struct TypeRegistry {
    map: RwLock<HashMap<String, Arc<VTable>>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
        }
    }

    pub fn attach(&self, table: Arc<VTable>) {
        self.map
            .write()
            .unwrap()
            .insert(table.name().to_string(), table);
    }

    pub fn find(&self, name: &str) -> Option<Arc<VTable>> {
        self.map.read().unwrap().get(name).cloned()
    }

    pub fn detach(&self, name: &str) -> bool {
        self.map.write().unwrap().remove(name).is_some()
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}
