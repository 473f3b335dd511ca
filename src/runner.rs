use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt};
use serde_json::json;

use crate::context::Environment;
use crate::error::Outcome;
use crate::execution::{Leftovers, Record};
use crate::logging::{self, Level};
use crate::invocation::Invocation;
use crate::step::{Step, StepFuture, StepRef};

/// Immutable, reusable sequence of steps.
///
/// A runner is itself a [`Step`]: placed inside another runner it shares the
/// enclosing context, hands control back when its own steps are exhausted,
/// and carries its resolution outward.
#[derive(Clone)]
pub struct Runner {
    steps: Arc<[StepRef]>,
}

impl Runner {
    pub fn new<I>(steps: I) -> Self
    where
        I: IntoIterator<Item = StepRef>,
    {
        Self {
            steps: steps.into_iter().collect(),
        }
    }

    pub fn single(step: StepRef) -> Self {
        Self::new([step])
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn into_step(self) -> StepRef {
        Arc::new(self)
    }

    /// Runs the chain with a fresh, empty context.
    pub fn invoke(&self) -> BoxFuture<'static, Outcome> {
        self.invoke_with(Environment::default())
    }

    /// Runs the chain inside `environment`. Settles to the resolved value,
    /// `None` when no step resolved, or the first step failure.
    ///
    /// The run settles as soon as the chain does. Steps still working after
    /// their own `resolve` keep running on the current tokio runtime; with
    /// no runtime around they are dropped, use [`Runner::launch`] to keep
    /// them.
    pub fn invoke_with(&self, environment: Environment) -> BoxFuture<'static, Outcome> {
        let Launch { outcome, leftovers } = self.launch(environment);
        async move {
            let outcome = outcome.await;
            if !leftovers.is_empty() {
                logging::emit(
                    Level::Warn,
                    "no async runtime to finish steps after resolution",
                    Some(json!({ "dropped": leftovers.len() })),
                );
            }
            outcome
        }
        .boxed()
    }

    /// Starts a run and hands back both its outcome and the queue of step
    /// remainders that could not be spawned.
    pub fn launch(&self, environment: Environment) -> Launch {
        let leftovers = Leftovers::new();
        let record = Record::top(self.steps.clone(), environment, &leftovers);
        Launch {
            outcome: settle(record).boxed(),
            leftovers,
        }
    }
}

async fn settle(record: Arc<Record>) -> Outcome {
    let value = record.clone().drive().await?;
    record.propagate();
    Ok(value)
}

/// A started top-level run.
///
/// `outcome` settles with the chain. `leftovers` collects the rest of any
/// step overtaken by its own `resolve` while no tokio runtime was current;
/// drain it to let that work finish.
pub struct Launch {
    pub outcome: BoxFuture<'static, Outcome>,
    pub leftovers: Leftovers,
}

impl Step for Runner {
    fn call(&self, invocation: Invocation) -> StepFuture {
        let record = Record::nested(self.steps.clone(), invocation);
        async move {
            record.clone().drive().await?;
            record.propagate();
            Ok(())
        }
        .boxed()
    }
}

impl From<Runner> for StepRef {
    fn from(runner: Runner) -> Self {
        runner.into_step()
    }
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("steps", &self.steps.len())
            .finish()
    }
}
