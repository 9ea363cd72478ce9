//! Values and handles that cross the worker boundary.
//!
//! Nothing in here borrows engine memory: a `ScriptValue` is a plain Rust
//! copy of a script result and a `FunctionRef` is an index into the engine's
//! function table, so both are `Send` and can outlive the task that made them.

use std::fmt;
use std::sync::Arc;

use rquickjs::{Type, Value as JsValue};

// ─────────────────────────────────────────────────────────────────────────────
// Script values
// ─────────────────────────────────────────────────────────────────────────────

/// A script value copied out of the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptValue {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    /// Any value without a plain Rust counterpart, tagged with its type name.
    Other(String),
}

impl ScriptValue {
    pub(crate) fn from_js(value: &JsValue<'_>) -> Self {
        match value.type_of() {
            Type::Undefined => ScriptValue::Undefined,
            Type::Null => ScriptValue::Null,
            Type::Bool => value
                .get::<bool>()
                .map(ScriptValue::Bool)
                .unwrap_or_else(|_| ScriptValue::Other("bool".to_string())),
            Type::Int => value
                .get::<i32>()
                .map(|i| ScriptValue::Number(f64::from(i)))
                .unwrap_or_else(|_| ScriptValue::Other("int".to_string())),
            Type::Float => value
                .get::<f64>()
                .map(ScriptValue::Number)
                .unwrap_or_else(|_| ScriptValue::Other("float".to_string())),
            Type::String => value
                .get::<String>()
                .map(ScriptValue::String)
                .unwrap_or_else(|_| ScriptValue::Other("string".to_string())),
            other => ScriptValue::Other(format!("{:?}", other).to_lowercase()),
        }
    }

    /// The numeric payload, if this is a number.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            ScriptValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Short type name used in error messages.
    pub fn type_name(&self) -> &str {
        match self {
            ScriptValue::Undefined => "undefined",
            ScriptValue::Null => "null",
            ScriptValue::Bool(_) => "bool",
            ScriptValue::Number(_) => "number",
            ScriptValue::String(_) => "string",
            ScriptValue::Other(name) => name,
        }
    }
}

impl From<ScriptValue> for serde_json::Value {
    fn from(value: ScriptValue) -> Self {
        match value {
            ScriptValue::Undefined | ScriptValue::Null => serde_json::Value::Null,
            ScriptValue::Bool(b) => serde_json::Value::Bool(b),
            ScriptValue::Number(n) => serde_json::Number::from_f64(n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            ScriptValue::String(s) => serde_json::Value::String(s),
            ScriptValue::Other(name) => serde_json::Value::String(format!("<{}>", name)),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Function handles
// ─────────────────────────────────────────────────────────────────────────────

/// Handle to a function living inside a script engine.
///
/// Only the engine that issued the handle can call it. Any other engine, or
/// the same engine after shutdown, rejects it with `StaleFunction` or
/// `Terminated`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionRef {
    pub(crate) engine: u64,
    pub(crate) slot: usize,
    module: Arc<str>,
    name: Arc<str>,
}

impl FunctionRef {
    pub(crate) fn new(engine: u64, slot: usize, module: &str, name: &str) -> Self {
        Self {
            engine,
            slot,
            module: Arc::from(module),
            name: Arc::from(name),
        }
    }

    /// Module the function was resolved from.
    pub fn module(&self) -> &str {
        &self.module
    }

    /// Function name inside its module.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for FunctionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.module, self.name)
    }
}
