use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context as AnyhowContext, Result};

use crate::compose::ChainStep;
use crate::runner::Runner;
use crate::step::StepRef;

/// Builds a step from its chain-document description. The registry is
/// passed along so factories can build nested children.
pub trait StepFactory: Send + Sync {
    fn build(&self, registry: &Registry, step: &ChainStep) -> Result<StepRef>;
}

impl<F> StepFactory for F
where
    F: Fn(&Registry, &ChainStep) -> Result<StepRef> + Send + Sync + 'static,
{
    fn build(&self, registry: &Registry, step: &ChainStep) -> Result<StepRef> {
        (self)(registry, step)
    }
}

struct RegistryInner {
    factories: HashMap<String, Arc<dyn StepFactory>>,
}

impl RegistryInner {
    fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }
}

pub struct Registry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for Registry {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegistryInner::new())),
        }
    }

    pub fn register<F>(&self, name: impl Into<String>, factory: F)
    where
        F: StepFactory + 'static,
    {
        let mut inner = self.inner.lock().expect("registry poisoned");
        inner.factories.insert(name.into(), Arc::new(factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        let inner = self.inner.lock().expect("registry poisoned");
        inner.factories.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let inner = self.inner.lock().expect("registry poisoned");
        let mut names: Vec<String> = inner.factories.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn build_step(&self, step: &ChainStep) -> Result<StepRef> {
        let factory = {
            let inner = self.inner.lock().expect("registry poisoned");
            inner.factories.get(&step.call).cloned()
        };
        let factory = factory.ok_or_else(|| anyhow!("step not found: {}", step.call))?;
        factory.build(self, step)
    }

    pub fn build_runner(&self, steps: &[ChainStep]) -> Result<Runner> {
        let built = steps
            .iter()
            .enumerate()
            .map(|(index, step)| {
                self.build_step(step)
                    .with_context(|| format!("unable to build step #{index} ({})", step.call))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Runner::new(built))
    }
}
