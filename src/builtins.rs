use anyhow::{anyhow, Result};
use serde_json::{json, Map, Value};

use crate::compose::ChainStep;
use crate::invocation::Invocation;
use crate::logging::{self, Level};
use crate::registry::Registry;
use crate::runner::Runner;
use crate::step::{from_fn, from_sync_fn, Step, StepRef};

pub const CHAIN: &str = "chain";
pub const CONTEXT_SET: &str = "context/set";
pub const CONTEXT_INCREMENT: &str = "context/increment";
pub const CONTEXT_PUSH: &str = "context/push";
pub const FLOW_RESOLVE: &str = "flow/resolve";
pub const FLOW_OBSERVE: &str = "flow/observe";
pub const FLOW_WHEN: &str = "flow/when";
pub const FLOW_FAIL: &str = "flow/fail";
pub const LOG: &str = "log";

fn required_str(step: &ChainStep, key: &str) -> Result<String> {
    step.input(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .ok_or_else(|| anyhow!("{}: missing '{key}'", step.call))
}

fn required_value(step: &ChainStep, key: &str) -> Result<Value> {
    step.input(key)
        .cloned()
        .ok_or_else(|| anyhow!("{}: missing '{key}'", step.call))
}

fn build_chain(registry: &Registry, step: &ChainStep) -> Result<StepRef> {
    Ok(registry.build_runner(step.children())?.into_step())
}

fn build_context_set(_registry: &Registry, step: &ChainStep) -> Result<StepRef> {
    let key = required_str(step, "key")?;
    let value = required_value(step, "value")?;
    Ok(from_sync_fn(move |inv: Invocation| {
        inv.context().set(key.clone(), value.clone());
        Ok(())
    }))
}

fn build_context_increment(_registry: &Registry, step: &ChainStep) -> Result<StepRef> {
    let key = required_str(step, "key")?;
    let by = match step.input("by") {
        None => 1,
        Some(value) => value
            .as_i64()
            .ok_or_else(|| anyhow!("{CONTEXT_INCREMENT}: 'by' must be an integer"))?,
    };
    Ok(from_sync_fn(move |inv: Invocation| {
        inv.context().update(|map| {
            let current = match map.get(&key) {
                None | Some(Value::Null) => 0,
                Some(value) => value
                    .as_i64()
                    .ok_or_else(|| anyhow!("{CONTEXT_INCREMENT}: '{key}' is not an integer"))?,
            };
            let next = current
                .checked_add(by)
                .ok_or_else(|| anyhow!("{CONTEXT_INCREMENT}: '{key}' overflowed"))?;
            map.insert(key.clone(), json!(next));
            Ok(())
        })
    }))
}

fn build_context_push(_registry: &Registry, step: &ChainStep) -> Result<StepRef> {
    let key = required_str(step, "key")?;
    let value = required_value(step, "value")?;
    Ok(from_sync_fn(move |inv: Invocation| {
        inv.context().update(|map| {
            let entry = map
                .entry(key.clone())
                .or_insert_with(|| Value::Array(Vec::new()));
            match entry {
                Value::Array(items) => {
                    items.push(value.clone());
                    Ok(())
                }
                _ => Err(anyhow!("{CONTEXT_PUSH}: '{key}' is not an array")),
            }
        })
    }))
}

fn build_flow_resolve(_registry: &Registry, step: &ChainStep) -> Result<StepRef> {
    let literal = step.input("value").cloned();
    let from = step.input("from").and_then(Value::as_str).map(str::to_owned);
    if literal.is_some() && from.is_some() {
        return Err(anyhow!("{FLOW_RESOLVE}: 'value' and 'from' are exclusive"));
    }
    Ok(from_sync_fn(move |inv: Invocation| {
        let value = match &from {
            Some(key) => inv.context().get(key),
            None => literal.clone(),
        };
        let _ = inv.resolve(value);
        Ok(())
    }))
}

async fn observe(inv: Invocation, key: String) -> Result<()> {
    let observed = inv.advance().await?;
    inv.context().set(key, observed.unwrap_or(Value::Null));
    Ok(())
}

fn build_flow_observe(_registry: &Registry, step: &ChainStep) -> Result<StepRef> {
    let key = required_str(step, "key")?;
    Ok(from_fn(move |inv: Invocation| observe(inv, key.clone())))
}

async fn run_when(inv: Invocation, key: String, expected: Value, body: Runner) -> Result<()> {
    if inv.context().get(&key).as_ref() == Some(&expected) {
        body.call(inv).await?;
    }
    Ok(())
}

fn build_flow_when(registry: &Registry, step: &ChainStep) -> Result<StepRef> {
    let key = required_str(step, "key")?;
    let expected = step.input("equals").cloned().unwrap_or(Value::Bool(true));
    let body = registry.build_runner(step.children())?;
    Ok(from_fn(move |inv: Invocation| {
        run_when(inv, key.clone(), expected.clone(), body.clone())
    }))
}

fn build_flow_fail(_registry: &Registry, step: &ChainStep) -> Result<StepRef> {
    let message = step
        .input("message")
        .and_then(Value::as_str)
        .unwrap_or("step failed")
        .to_string();
    Ok(from_sync_fn(move |_inv: Invocation| Err(anyhow!(message.clone()))))
}

fn build_log(_registry: &Registry, step: &ChainStep) -> Result<StepRef> {
    let level = match step.input("level").and_then(Value::as_str) {
        Some(raw) => raw.parse::<Level>()?,
        None => Level::Info,
    };
    let message = required_str(step, "message")?;
    let data = step.input("data").cloned();
    if matches!(data, Some(ref value) if !value.is_object()) {
        return Err(anyhow!("{LOG}: 'data' must be an object"));
    }
    Ok(from_sync_fn(move |inv: Invocation| {
        let mut tags = Map::new();
        tags.insert("step".to_string(), json!(LOG));
        tags.insert("index".to_string(), json!(inv.index()));
        tags.insert("depth".to_string(), json!(inv.depth()));
        logging::emit_tagged(level, &message, data.clone(), &tags);
        Ok(())
    }))
}

pub fn register_builtins(registry: &Registry) {
    registry.register(CHAIN, build_chain);
    registry.register(CONTEXT_SET, build_context_set);
    registry.register(CONTEXT_INCREMENT, build_context_increment);
    registry.register(CONTEXT_PUSH, build_context_push);
    registry.register(FLOW_RESOLVE, build_flow_resolve);
    registry.register(FLOW_OBSERVE, build_flow_observe);
    registry.register(FLOW_WHEN, build_flow_when);
    registry.register(FLOW_FAIL, build_flow_fail);
    registry.register(LOG, build_log);
}
