use std::fs;

use anyhow::Result;
use serde_json::{json, Value};

use middle_run::builtins::{CONTEXT_PUSH, FLOW_RESOLVE};
use middle_run::{
    load_chain, parse_chain, register_builtins, ChainStep, Context, Environment, Registry,
};

fn registry_with_builtins() -> Registry {
    let registry = Registry::new();
    register_builtins(&registry);
    registry
}

async fn run_document(document: Value) -> Result<(Option<Value>, Context)> {
    let registry = registry_with_builtins();
    let steps = parse_chain(&document)?;
    let runner = registry.build_runner(&steps)?;
    let context = Context::new();
    let value = runner
        .invoke_with(Environment::new().with_context(context.clone()))
        .await?;
    Ok((value, context))
}

#[tokio::test]
async fn builtin_steps_share_the_context_across_nested_chains() -> Result<()> {
    let (value, context) = run_document(json!({
        "chain": [
            { "call": "context/push", "in": { "key": "trail", "value": "a" } },
            { "call": "chain", "children": [
                { "call": "context/push", "in": { "key": "trail", "value": "b" } },
                { "call": "context/increment", "in": { "key": "count" } },
                { "call": "context/increment", "in": { "key": "count", "by": 5 } }
            ] },
            { "call": "context/set", "in": { "key": "status", "value": "ok" } },
            { "call": "flow/resolve", "in": { "from": "count" } },
            { "call": "context/push", "in": { "key": "trail", "value": "never" } }
        ]
    }))
    .await?;

    assert_eq!(value, Some(json!(6)));
    assert_eq!(context.get("trail"), Some(json!(["a", "b"])));
    assert_eq!(context.get("status"), Some(json!("ok")));
    Ok(())
}

#[tokio::test]
async fn observe_records_what_the_rest_of_the_chain_resolved() -> Result<()> {
    let (value, context) = run_document(json!([
        { "call": "flow/observe", "in": { "key": "seen" } },
        { "call": "chain", "children": [
            { "call": "flow/resolve", "in": { "value": { "answer": 42 } } }
        ] },
        { "call": "context/set", "in": { "key": "skipped", "value": false } }
    ]))
    .await?;

    assert_eq!(value, Some(json!({ "answer": 42 })));
    assert_eq!(context.get("seen"), Some(json!({ "answer": 42 })));
    assert!(!context.contains("skipped"));
    Ok(())
}

#[tokio::test]
async fn when_runs_its_children_only_on_a_match() -> Result<()> {
    let document = |mode: &str| {
        json!([
            { "call": "context/set", "in": { "key": "mode", "value": mode } },
            { "call": "flow/when", "in": { "key": "mode", "equals": "fast" }, "children": [
                { "call": "context/push", "in": { "key": "trail", "value": "fast path" } },
                { "call": "flow/resolve", "in": { "value": "short-circuit" } }
            ] },
            { "call": "context/push", "in": { "key": "trail", "value": "slow path" } }
        ])
    };

    let (value, context) = run_document(document("fast")).await?;
    assert_eq!(value, Some(json!("short-circuit")));
    assert_eq!(context.get("trail"), Some(json!(["fast path"])));

    let (value, context) = run_document(document("slow")).await?;
    assert_eq!(value, None);
    assert_eq!(context.get("trail"), Some(json!(["slow path"])));
    Ok(())
}

#[tokio::test]
async fn resolve_without_inputs_leaves_the_value_unset() -> Result<()> {
    let (value, context) = run_document(json!([
        { "call": "flow/resolve" },
        { "call": "context/set", "in": { "key": "late", "value": 1 } }
    ]))
    .await?;
    assert_eq!(value, None);
    assert!(!context.contains("late"));
    Ok(())
}

#[tokio::test]
async fn fail_rejects_the_run_with_its_message() -> Result<()> {
    let err = run_document(json!([
        { "call": "chain", "children": [
            { "call": "flow/fail", "in": { "message": "payment declined" } }
        ] },
        { "call": "context/set", "in": { "key": "late", "value": 1 } }
    ]))
    .await
    .expect_err("flow/fail must reject");
    assert_eq!(err.to_string(), "payment declined");
    Ok(())
}

#[tokio::test]
async fn increment_rejects_non_integer_entries() -> Result<()> {
    let err = run_document(json!([
        { "call": "context/set", "in": { "key": "count", "value": "three" } },
        { "call": "context/increment", "in": { "key": "count" } }
    ]))
    .await
    .expect_err("incrementing a string must fail");
    assert!(err.to_string().contains("'count' is not an integer"));
    Ok(())
}

#[tokio::test]
async fn increment_reports_overflow_and_leaves_the_context_usable() -> Result<()> {
    let registry = registry_with_builtins();
    let runner = registry.build_runner(&parse_chain(&json!([
        { "call": "context/set", "in": { "key": "n", "value": i64::MAX } },
        { "call": "context/increment", "in": { "key": "n" } }
    ]))?)?;
    let context = Context::new();

    let err = runner
        .invoke_with(Environment::new().with_context(context.clone()))
        .await
        .expect_err("incrementing past i64::MAX must fail");

    assert_eq!(err.to_string(), "context/increment: 'n' overflowed");
    assert_eq!(context.get("n"), Some(json!(i64::MAX)));
    Ok(())
}

#[test]
fn unknown_calls_and_bad_inputs_fail_at_build_time() -> Result<()> {
    let registry = registry_with_builtins();

    let unknown = registry
        .build_runner(&[ChainStep::new("flow/teleport")])
        .expect_err("unknown call");
    assert!(format!("{unknown:#}").contains("step not found: flow/teleport"));

    let missing = registry
        .build_step(&ChainStep::new(CONTEXT_PUSH).with_input("key", json!("trail")))
        .err()
        .expect("missing value");
    assert_eq!(missing.to_string(), "context/push: missing 'value'");

    let exclusive = registry
        .build_step(
            &ChainStep::new(FLOW_RESOLVE)
                .with_input("value", json!(1))
                .with_input("from", json!("count")),
        )
        .err()
        .expect("exclusive inputs");
    assert!(exclusive.to_string().contains("exclusive"));

    let nested = registry
        .build_step(&ChainStep::new("chain").with_children(vec![ChainStep::new("nope")]))
        .err()
        .expect("nested unknown call");
    assert!(format!("{nested:#}").contains("step not found: nope"));
    Ok(())
}

#[test]
fn builtins_are_registered_by_name() {
    let registry = registry_with_builtins();
    for name in [
        "chain",
        "context/set",
        "context/increment",
        "context/push",
        "flow/resolve",
        "flow/observe",
        "flow/when",
        "flow/fail",
        "log",
    ] {
        assert!(registry.contains(name), "{name} should be registered");
    }
    assert_eq!(registry.names().len(), 9);
}

#[tokio::test]
async fn chains_load_from_yaml_and_toml_files() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let yaml_path = dir.path().join("chain.yaml");
    fs::write(
        &yaml_path,
        r#"
chain:
  - call: context/increment
    in: { key: hits }
  - call: chain
    children:
      - call: flow/resolve
        in: { from: hits }
"#,
    )?;
    let toml_path = dir.path().join("chain.toml");
    fs::write(
        &toml_path,
        r#"
[[chain]]
call = "context/set"
in = { key = "greeting", value = "hello" }

[[chain]]
call = "flow/resolve"
in = { from = "greeting" }
"#,
    )?;

    let registry = registry_with_builtins();

    let yaml = registry.build_runner(&load_chain(&yaml_path)?)?;
    assert_eq!(yaml.invoke().await?, Some(json!(1)));

    let toml = registry.build_runner(&load_chain(&toml_path)?)?;
    assert_eq!(toml.invoke().await?, Some(json!("hello")));

    let broken = dir.path().join("broken.json");
    fs::write(&broken, "{ not json")?;
    let err = load_chain(&broken).expect_err("invalid JSON");
    assert!(format!("{err:#}").contains("invalid document"));
    Ok(())
}
