use std::fs;
use std::io::{self, Read};
use std::path::PathBuf;

use anyhow::{anyhow, Context as AnyhowContext, Result};
use clap::Parser;
use serde_json::{json, Map, Value};

use middle_run::config::parse_field;
use middle_run::logging::{self, Level};
use middle_run::{load_chain, register_builtins, Registry, RunConfig};

#[derive(Parser, Debug)]
#[command(name = "middle-run")]
#[command(about = "Execute a middleware chain document and print its outcome")]
struct CliOptions {
    /// Chain document to execute (JSON, YAML or TOML)
    #[arg(long = "chain", short = 'c')]
    chain: Option<PathBuf>,

    /// Run configuration file
    #[arg(long = "config")]
    config: Option<PathBuf>,

    /// JSON file holding the initial context object (use '-' for stdin)
    #[arg(long = "context")]
    context: Option<String>,

    /// Extra invocation field, KEY=VALUE (VALUE parsed as JSON when possible)
    #[arg(long = "field", value_parser = parse_field)]
    fields: Vec<(String, Value)>,

    /// Log threshold: trace, debug, info, warn or error
    #[arg(long = "log-level")]
    log_level: Option<Level>,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let opts = CliOptions::parse();

    let mut config = match &opts.config {
        Some(path) => RunConfig::load(path)?,
        None => RunConfig::default(),
    };
    if let Some(level) = opts.log_level {
        config.log_level = Some(level);
    }
    logging::set_level(config.effective_log_level());

    if let Some(source) = &opts.context {
        config.context = load_context(source)?;
    }
    for (key, value) in opts.fields {
        config.fields.insert(key, value);
    }

    let chain_path = opts
        .chain
        .or_else(|| config.chain.clone())
        .ok_or_else(|| anyhow!("--chain is required (or set 'chain' in the configuration)"))?;
    let steps = load_chain(&chain_path)?;

    let registry = Registry::new();
    register_builtins(&registry);
    let runner = registry
        .build_runner(&steps)
        .with_context(|| format!("unable to build chain from {}", chain_path.display()))?;

    let environment = config.environment();
    let context = environment.context.clone().unwrap_or_default();

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("unable to start async runtime")?;
    let outcome = rt.block_on(runner.invoke_with(environment));
    let value = outcome.map_err(|err| anyhow!("chain execution failed: {err:#}"))?;

    let report = json!({
        "value": value.unwrap_or(Value::Null),
        "context": Value::Object(context.snapshot()),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn load_context(source: &str) -> Result<Map<String, Value>> {
    let text = if source == "-" {
        let mut buf = String::new();
        io::stdin()
            .read_to_string(&mut buf)
            .context("unable to read context from stdin")?;
        buf
    } else {
        fs::read_to_string(source).with_context(|| format!("unable to read context file {source}"))?
    };
    match serde_json::from_str(&text).context("invalid context JSON")? {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        other => Err(anyhow!("context must be a JSON object, got {other}")),
    }
}
