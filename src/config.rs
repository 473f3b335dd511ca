use std::path::{Path, PathBuf};

use anyhow::{Context as AnyhowContext, Result};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::compose::read_document;
use crate::context::{Context, Environment};
use crate::logging::{self, Level};

/// Settings for one `middle-run` execution, loaded from a JSON, YAML or TOML
/// file and then overridden by command-line flags.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct RunConfig {
    #[serde(default)]
    pub chain: Option<PathBuf>,
    #[serde(default)]
    pub context: Map<String, Value>,
    #[serde(default)]
    pub fields: Map<String, Value>,
    #[serde(default)]
    pub log_level: Option<Level>,
}

fn resolve_path(base: &Path, target: &Path) -> PathBuf {
    if target.is_absolute() {
        target.to_path_buf()
    } else {
        base.join(target)
    }
}

impl RunConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let value = read_document(path)?;
        let mut config: RunConfig = serde_json::from_value(value)
            .with_context(|| format!("invalid run configuration: {}", path.display()))?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        config.chain = config.chain.map(|chain| resolve_path(base, &chain));
        Ok(config)
    }

    /// Threshold in effect: explicit setting, then `MIDDLE_RUN_LOG`, then
    /// `warn`.
    pub fn effective_log_level(&self) -> Level {
        self.log_level
            .or_else(logging::level_from_env)
            .unwrap_or(Level::Warn)
    }

    pub fn environment(&self) -> Environment {
        Environment {
            context: Some(Context::from_map(self.context.clone())),
            fields: self.fields.clone(),
            enclosing: None,
        }
    }
}

/// Parses a `KEY=VALUE` flag; VALUE is read as JSON and falls back to a
/// plain string.
pub fn parse_field(raw: &str) -> Result<(String, Value)> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow::anyhow!("field must look like KEY=VALUE, got {raw}"))?;
    let key = key.trim();
    if key.is_empty() {
        anyhow::bail!("field name must not be empty in {raw}");
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}
