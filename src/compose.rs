use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context as AnyhowContext, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Data description of one step of a chain document.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ChainStep {
    pub call: String,
    #[serde(default, rename = "in")]
    pub inputs: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<ChainStep>>,
}

impl ChainStep {
    pub fn new(call: impl Into<String>) -> Self {
        Self {
            call: call.into(),
            inputs: Map::new(),
            children: None,
        }
    }

    pub fn with_input(mut self, key: impl Into<String>, value: Value) -> Self {
        self.inputs.insert(key.into(), value);
        self
    }

    pub fn with_children(mut self, children: Vec<ChainStep>) -> Self {
        self.children = Some(children);
        self
    }

    pub fn input(&self, key: &str) -> Option<&Value> {
        self.inputs.get(key)
    }

    pub fn children(&self) -> &[ChainStep] {
        self.children.as_deref().unwrap_or(&[])
    }
}

/// Accepts either a bare array of steps or an object with a `chain` array.
pub fn parse_chain(value: &Value) -> Result<Vec<ChainStep>> {
    let steps = match value {
        Value::Array(_) => value.clone(),
        Value::Object(map) => map
            .get("chain")
            .cloned()
            .ok_or_else(|| anyhow!("chain root missing"))?,
        _ => return Err(anyhow!("chain document must be an array or an object")),
    };
    let steps: Vec<ChainStep> = serde_json::from_value(steps)?;
    Ok(steps)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Json,
    Yaml,
    Toml,
}

impl DocumentFormat {
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();
        match ext.as_str() {
            "yaml" | "yml" => DocumentFormat::Yaml,
            "toml" => DocumentFormat::Toml,
            _ => DocumentFormat::Json,
        }
    }

    pub fn parse(&self, text: &str) -> Result<Value> {
        let value = match self {
            DocumentFormat::Json => serde_json::from_str(text)?,
            DocumentFormat::Yaml => serde_yaml::from_str(text)?,
            DocumentFormat::Toml => {
                let table: toml::Value = toml::from_str(text)?;
                serde_json::to_value(table)?
            }
        };
        Ok(value)
    }
}

/// Reads a JSON, YAML or TOML file, picking the format by extension.
pub fn read_document(path: &Path) -> Result<Value> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("unable to read document: {}", path.display()))?;
    DocumentFormat::from_path(path)
        .parse(&text)
        .with_context(|| format!("invalid document: {}", path.display()))
}

pub fn load_chain(path: &Path) -> Result<Vec<ChainStep>> {
    let value = read_document(path)?;
    parse_chain(&value).with_context(|| format!("invalid chain structure in {}", path.display()))
}
