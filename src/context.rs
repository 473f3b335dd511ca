use std::fmt;
use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};

use crate::invocation::Invocation;

/// Mutable object shared by reference across every step of an invocation
/// and all of its nested chains.
///
/// Cloning a `Context` clones the handle, never the contents.
#[derive(Clone, Default)]
pub struct Context {
    inner: Arc<Mutex<Map<String, Value>>>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: Map<String, Value>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(map)),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.lock().get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    pub fn set(&self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.lock().insert(key.into(), value)
    }

    /// Runs `f` with exclusive access to the underlying map.
    pub fn update<R>(&self, f: impl FnOnce(&mut Map<String, Value>) -> R) -> R {
        f(&mut self.lock())
    }

    pub fn snapshot(&self) -> Map<String, Value> {
        self.lock().clone()
    }

    pub fn ptr_eq(&self, other: &Context) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Map<String, Value>> {
        self.inner.lock().expect("context poisoned")
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Context").field(&*self.lock()).finish()
    }
}

impl From<Map<String, Value>> for Context {
    fn from(map: Map<String, Value>) -> Self {
        Self::from_map(map)
    }
}

/// Parent invocation environment handed to a top-level run.
///
/// `context` is adopted by reference when present; every entry of `fields`
/// is forwarded to each step, and to the steps of nested chains.
///
/// With an `enclosing` invocation the run behaves like a chain nested in
/// that step: exhaustion advances it, a resolution is handed to its
/// `resolve`, and its context is shared unless `context` is set.
#[derive(Clone, Debug, Default)]
pub struct Environment {
    pub context: Option<Context>,
    pub fields: Map<String, Value>,
    pub enclosing: Option<Invocation>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_context(mut self, context: Context) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_enclosing(mut self, invocation: Invocation) -> Self {
        self.enclosing = Some(invocation);
        self
    }

    /// Splits a JSON object into an environment: a `context` object becomes
    /// the shared context, every other entry becomes a forwarded field.
    pub fn from_value(value: Value) -> anyhow::Result<Self> {
        let mut map = match value {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => anyhow::bail!("environment must be an object, got {other}"),
        };
        let context = match map.remove("context") {
            Some(Value::Object(ctx)) => Some(Context::from_map(ctx)),
            Some(Value::Null) | None => None,
            Some(other) => anyhow::bail!("environment 'context' must be an object, got {other}"),
        };
        Ok(Self {
            context,
            fields: map,
            enclosing: None,
        })
    }
}
