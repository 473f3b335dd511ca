//! Per-invocation state machine: the step iterator, the control-signal gate
//! handed to each step, and the bookkeeping that lets a record nested inside
//! another one hand control and results back to its parent.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::task::{Context as TaskContext, Poll};

use futures_util::future::{self, BoxFuture, Either, FutureExt, Shared};
use futures_util::stream::{FuturesUnordered, StreamExt};
use serde_json::{json, Map, Value};
use tokio::runtime::Handle;
use tokio::sync::oneshot;

use crate::context::{Context, Environment};
use crate::error::{Outcome, StepError};
use crate::invocation::Invocation;
use crate::logging::{self, Level};
use crate::step::{StepFuture, StepRef};

/// Shared handle on an eventual outcome.
///
/// Clones observe the same underlying computation; `ptr_eq` tells whether
/// two handles came from the same memo.
#[derive(Clone)]
pub struct Eventual {
    inner: Shared<BoxFuture<'static, Outcome>>,
}

impl Eventual {
    pub(crate) fn new<F>(fut: F) -> Self
    where
        F: Future<Output = Outcome> + Send + 'static,
    {
        Self {
            inner: fut.boxed().shared(),
        }
    }

    pub(crate) fn ready(outcome: Outcome) -> Self {
        Self::new(future::ready(outcome))
    }

    pub fn ptr_eq(&self, other: &Eventual) -> bool {
        self.inner.ptr_eq(&other.inner)
    }

    /// The outcome, if some clone already drove this eventual to completion.
    pub fn peek(&self) -> Option<&Outcome> {
        self.inner.peek()
    }
}

impl Future for Eventual {
    type Output = Outcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Outcome> {
        self.inner.poll_unpin(cx)
    }
}

impl std::fmt::Debug for Eventual {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Eventual")
            .field("settled", &self.peek().is_some())
            .finish()
    }
}

type Continuations = Mutex<Vec<StepFuture>>;

/// Remainders of steps that were overtaken by their own `resolve` while no
/// tokio runtime was available to spawn them.
///
/// Records only hold a weak handle; once the owner drops it, later
/// remainders are dropped too.
pub struct Leftovers {
    pending: Arc<Continuations>,
}

impl Leftovers {
    pub(crate) fn new() -> Self {
        Self {
            pending: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn handle(&self) -> Weak<Continuations> {
        Arc::downgrade(&self.pending)
    }

    fn take(&self) -> Vec<StepFuture> {
        std::mem::take(&mut *self.pending.lock().expect("continuations poisoned"))
    }

    pub fn len(&self) -> usize {
        self.pending.lock().expect("continuations poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drives every queued remainder to completion, including those queued
    /// while draining. Failures are logged and dropped.
    pub async fn drain(self) {
        let mut running = FuturesUnordered::new();
        loop {
            running.extend(self.take());
            match running.next().await {
                Some(Ok(())) => {}
                Some(Err(err)) => report_late_failure(&err),
                None => break,
            }
        }
    }
}

impl std::fmt::Debug for Leftovers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Leftovers")
            .field("pending", &self.len())
            .finish()
    }
}

fn report_late_failure(err: &anyhow::Error) {
    logging::emit(
        Level::Warn,
        "detached step failed after resolution",
        Some(json!({ "error": format!("{err:#}") })),
    );
}

async fn finish_detached(rest: StepFuture) {
    if let Err(err) = rest.await {
        report_late_failure(&err);
    }
}

fn detach(handle: &Weak<Continuations>, rest: StepFuture) {
    if let Ok(runtime) = Handle::try_current() {
        runtime.spawn(finish_detached(rest));
        return;
    }
    match handle.upgrade() {
        Some(pending) => pending.lock().expect("continuations poisoned").push(rest),
        None => logging::emit(Level::Warn, "step remainder dropped after resolution", None),
    }
}

#[derive(Default)]
struct RecordState {
    cursor: usize,
    resolved: bool,
    value: Option<Value>,
}

fn read_state(state: &Mutex<RecordState>) -> (bool, Option<Value>) {
    let state = state.lock().expect("execution record poisoned");
    (state.resolved, state.value.clone())
}

/// Control handles of a single step: the advance memo and the one-shot
/// resolution signal raced against the step's own future.
pub(crate) struct StepGate {
    advanced: OnceLock<Eventual>,
    signal: Mutex<Option<oneshot::Sender<()>>>,
}

impl StepGate {
    fn new() -> (Arc<Self>, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        let gate = Arc::new(Self {
            advanced: OnceLock::new(),
            signal: Mutex::new(Some(tx)),
        });
        (gate, rx)
    }

    pub(crate) fn advance(&self, record: &Arc<Record>) -> Eventual {
        self.advanced.get_or_init(|| record.next_step()).clone()
    }

    pub(crate) fn resolve(&self, record: &Record, value: Option<Value>) -> Eventual {
        let signal = self.signal.lock().expect("step gate poisoned").take();
        if let Some(signal) = signal {
            record.mark_resolved(value);
            let _ = signal.send(());
        }
        record.settled()
    }
}

/// Mutable state of one invocation of a runner.
pub(crate) struct Record {
    steps: Arc<[StepRef]>,
    context: Context,
    fields: Arc<Map<String, Value>>,
    enclosing: Option<Invocation>,
    depth: usize,
    state: Arc<Mutex<RecordState>>,
    settled: OnceLock<Eventual>,
    done_tx: Mutex<Option<oneshot::Sender<Outcome>>>,
    done: Eventual,
    leftovers: Weak<Continuations>,
}

impl Record {
    pub(crate) fn top(
        steps: Arc<[StepRef]>,
        environment: Environment,
        leftovers: &Leftovers,
    ) -> Arc<Self> {
        let Environment {
            context,
            fields,
            enclosing,
        } = environment;
        let context = context
            .or_else(|| enclosing.as_ref().map(|inv| inv.context().clone()))
            .unwrap_or_default();
        let depth = enclosing.as_ref().map_or(0, |inv| inv.depth() + 1);
        Self::build(
            steps,
            context,
            Arc::new(fields),
            enclosing,
            depth,
            leftovers.handle(),
        )
    }

    pub(crate) fn nested(steps: Arc<[StepRef]>, enclosing: Invocation) -> Arc<Self> {
        let parent = enclosing.record.clone();
        Self::build(
            steps,
            parent.context.clone(),
            parent.fields.clone(),
            Some(enclosing),
            parent.depth + 1,
            parent.leftovers.clone(),
        )
    }

    fn build(
        steps: Arc<[StepRef]>,
        context: Context,
        fields: Arc<Map<String, Value>>,
        enclosing: Option<Invocation>,
        depth: usize,
        leftovers: Weak<Continuations>,
    ) -> Arc<Self> {
        let (done_tx, done_rx) = oneshot::channel::<Outcome>();
        // a dropped sender means the run was abandoned before settling
        let done = Eventual::new(async move { done_rx.await.unwrap_or(Ok(None)) });
        Arc::new(Self {
            steps,
            context,
            fields,
            enclosing,
            depth,
            state: Arc::new(Mutex::new(RecordState::default())),
            settled: OnceLock::new(),
            done_tx: Mutex::new(Some(done_tx)),
            done,
            leftovers,
        })
    }

    pub(crate) fn context(&self) -> &Context {
        &self.context
    }

    pub(crate) fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub(crate) fn depth(&self) -> usize {
        self.depth
    }

    /// Invokes the step under the cursor and returns the eventual outcome of
    /// it and everything after it.
    pub(crate) fn next_step(self: &Arc<Self>) -> Eventual {
        let index = {
            let mut state = self.state.lock().expect("execution record poisoned");
            if state.resolved {
                return Eventual::ready(Ok(state.value.clone()));
            }
            if state.cursor >= self.steps.len() {
                let value = state.value.clone();
                drop(state);
                logging::emit(
                    Level::Debug,
                    "chain exhausted",
                    Some(json!({ "depth": self.depth, "steps": self.steps.len() })),
                );
                return match &self.enclosing {
                    Some(parent) => parent.advance(),
                    None => Eventual::ready(Ok(value)),
                };
            }
            state.cursor += 1;
            state.cursor - 1
        };

        if logging::enabled(Level::Trace) {
            logging::emit(
                Level::Trace,
                "step invoked",
                Some(json!({ "depth": self.depth, "index": index })),
            );
        }

        let (gate, signal) = StepGate::new();
        let invocation = Invocation::new(self.clone(), gate, index);
        let running = self.steps[index].call(invocation.clone());
        let leftovers = self.leftovers.clone();
        Eventual::new(async move {
            match future::select(running, signal).await {
                Either::Left((result, _)) => result.map_err(StepError::new)?,
                Either::Right((_, rest)) => detach(&leftovers, rest),
            }
            invocation.advance().await
        })
    }

    fn mark_resolved(&self, value: Option<Value>) {
        let current = {
            let mut state = self.state.lock().expect("execution record poisoned");
            state.resolved = true;
            if value.is_some() {
                state.value = value;
            }
            state.value.clone()
        };
        logging::emit(
            Level::Debug,
            "chain resolved",
            Some(json!({ "depth": self.depth, "value": current })),
        );
    }

    /// Eventual of the final value once this invocation, and every chain it
    /// is nested in, has settled.
    pub(crate) fn settled(&self) -> Eventual {
        self.settled
            .get_or_init(|| {
                let done = self.done.clone();
                let state = self.state.clone();
                let enclosing = self.enclosing.clone();
                Eventual::new(async move {
                    done.await?;
                    let (resolved, value) = read_state(&state);
                    match enclosing {
                        Some(parent) if resolved => parent.resolve(value).await,
                        _ => Ok(value),
                    }
                })
            })
            .clone()
    }

    /// Runs the chain from its first step and reports the record's value.
    pub(crate) async fn drive(self: Arc<Self>) -> Outcome {
        let outcome = self.next_step().await;
        let tx = self.done_tx.lock().expect("execution record poisoned").take();
        if let Some(tx) = tx {
            let _ = tx.send(outcome.clone());
        }
        outcome?;
        Ok(read_state(&self.state).1)
    }

    /// Hands a resolution reached inside a nested chain to the step that
    /// embedded it.
    pub(crate) fn propagate(&self) {
        let (resolved, value) = read_state(&self.state);
        if let (true, Some(parent)) = (resolved, &self.enclosing) {
            let _ = parent.resolve(value);
        }
    }
}
