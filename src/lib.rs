//! Sequential middleware composition.
//!
//! A [`Runner`] executes its steps one after another, threading one shared
//! [`Context`] through all of them. Each step receives an [`Invocation`]
//! carrying two idempotent handles: `advance` runs the rest of the chain and
//! lets the step observe its outcome, `resolve` fixes the final value and
//! stops every later step. Runners are steps themselves, so chains nest.

pub mod builtins;
pub mod compose;
pub mod config;
pub mod context;
pub mod error;
pub mod execution;
pub mod invocation;
pub mod logging;
pub mod registry;
pub mod runner;
pub mod step;

pub use builtins::register_builtins;
pub use compose::{load_chain, parse_chain, ChainStep};
pub use config::RunConfig;
pub use context::{Context, Environment};
pub use error::{Outcome, StepError};
pub use execution::{Eventual, Leftovers};
pub use invocation::Invocation;
pub use registry::{Registry, StepFactory};
pub use runner::{Launch, Runner};
pub use step::{from_fn, from_sync_fn, Step, StepFuture, StepRef, SyncStep};
