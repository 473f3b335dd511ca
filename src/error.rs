use std::fmt;
use std::sync::Arc;

use serde_json::Value;

/// Failure raised by a step, shared by every eventual that observes it.
///
/// Eventuals are cloned freely, so the original `anyhow::Error` lives behind
/// an `Arc`. Converting back and forth through `anyhow::Error` keeps pointing
/// at the same allocation, which is how a nested chain hands the exact error
/// to its enclosing chain.
#[derive(Clone)]
pub struct StepError {
    inner: Arc<anyhow::Error>,
}

impl StepError {
    pub fn new(err: anyhow::Error) -> Self {
        match err.downcast::<StepError>() {
            Ok(step_error) => step_error,
            Err(err) => Self {
                inner: Arc::new(err),
            },
        }
    }

    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.inner.downcast_ref::<E>()
    }

    pub fn ptr_eq(&self, other: &StepError) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl From<anyhow::Error> for StepError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(err)
    }
}

impl fmt::Display for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.inner, f)
    }
}

impl fmt::Debug for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.inner, f)
    }
}

impl std::error::Error for StepError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner.source()
    }
}

/// What an invocation settles to: the final value (`None` when no step
/// resolved one) or the failure of the first step that raised.
pub type Outcome = Result<Option<Value>, StepError>;
