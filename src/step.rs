use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use futures_util::future::{self, BoxFuture, FutureExt};

use crate::invocation::Invocation;

/// Future returned by a step; its output only matters as a settlement
/// signal or a failure.
pub type StepFuture = BoxFuture<'static, Result<()>>;

pub type StepRef = Arc<dyn Step>;

pub trait Step: Send + Sync {
    fn call(&self, invocation: Invocation) -> StepFuture;
}

impl<F, Fut> Step for F
where
    F: Fn(Invocation) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn call(&self, invocation: Invocation) -> StepFuture {
        (self)(invocation).boxed()
    }
}

/// Step whose body runs to completion the moment it is invoked.
pub struct SyncStep<F> {
    func: F,
}

impl<F> Step for SyncStep<F>
where
    F: Fn(Invocation) -> Result<()> + Send + Sync,
{
    fn call(&self, invocation: Invocation) -> StepFuture {
        future::ready((self.func)(invocation)).boxed()
    }
}

pub fn from_fn<F, Fut>(func: F) -> StepRef
where
    F: Fn(Invocation) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(func)
}

pub fn from_sync_fn<F>(func: F) -> StepRef
where
    F: Fn(Invocation) -> Result<()> + Send + Sync + 'static,
{
    Arc::new(SyncStep { func })
}
