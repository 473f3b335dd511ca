use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::context::Context;
use crate::execution::{Eventual, Record, StepGate};

/// Argument handed to every step: the shared context, the forwarded fields
/// of the parent environment, and the `advance` / `resolve` handles of the
/// current step.
#[derive(Clone)]
pub struct Invocation {
    pub(crate) record: Arc<Record>,
    gate: Arc<StepGate>,
    index: usize,
}

impl Invocation {
    pub(crate) fn new(record: Arc<Record>, gate: Arc<StepGate>, index: usize) -> Self {
        Self {
            record,
            gate,
            index,
        }
    }

    pub fn context(&self) -> &Context {
        self.record.context()
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.record.fields().get(name)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        self.record.fields()
    }

    /// Position of this step inside its own chain.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Number of chains this step is nested in; zero for a top-level step.
    pub fn depth(&self) -> usize {
        self.record.depth()
    }

    /// Starts the following step on the first call and returns the eventual
    /// outcome of the rest of the chain. Later calls return the same
    /// eventual without running anything.
    pub fn advance(&self) -> Eventual {
        self.gate.advance(&self.record)
    }

    /// Marks the chain resolved and, on the first call from this step, fixes
    /// the final value unless `value` is `None`. No step after this one is
    /// invoked. The returned eventual settles to the final value once the
    /// whole invocation, enclosing chains included, has settled.
    pub fn resolve(&self, value: impl Into<Option<Value>>) -> Eventual {
        self.gate.resolve(&self.record, value.into())
    }
}

impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invocation")
            .field("index", &self.index)
            .field("depth", &self.depth())
            .field("context", self.context())
            .field("fields", self.fields())
            .finish()
    }
}
