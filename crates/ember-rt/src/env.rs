// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Task-local and generator-local value environments.

use std::collections::HashMap;

use ember_value::Value;
use parking_lot::Mutex;

/// Named value store attached to one task or generator.
#[derive(Default)]
pub struct ValueEnv {
    map: Mutex<HashMap<String, Value>>,
}

impl ValueEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.map.lock().get(name).cloned()
    }

    pub fn set(&self, name: &str, value: Value) {
        self.map.lock().insert(name.to_string(), value);
    }

    pub fn remove(&self, name: &str) -> Option<Value> {
        self.map.lock().remove(name)
    }

    pub fn clear(&self) {
        self.map.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_remove() {
        let env = ValueEnv::new();
        env.set("k", Value::I32(1));
        assert_eq!(env.get("k"), Some(Value::I32(1)));
        assert_eq!(env.remove("k"), Some(Value::I32(1)));
        assert_eq!(env.get("k"), None);
    }
}
