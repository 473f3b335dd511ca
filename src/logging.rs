use std::fmt;
use std::io::{stderr, Write};
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, RwLock};

use anyhow::{anyhow, Result};
use humantime::format_rfc3339;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const LOG_ENV: &str = "MIDDLE_RUN_LOG";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
        }
    }

    fn from_u8(raw: u8) -> Level {
        match raw {
            0 => Level::Trace,
            1 => Level::Debug,
            2 => Level::Info,
            3 => Level::Warn,
            _ => Level::Error,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Level {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(Level::Trace),
            "debug" => Ok(Level::Debug),
            "info" => Ok(Level::Info),
            "warn" | "warning" => Ok(Level::Warn),
            "error" => Ok(Level::Error),
            other => Err(anyhow!("unsupported log level: {other}")),
        }
    }
}

pub type Sink = Arc<dyn Fn(&Map<String, Value>) + Send + Sync>;

static THRESHOLD: AtomicU8 = AtomicU8::new(Level::Warn as u8);
static SINK: OnceLock<RwLock<Option<Sink>>> = OnceLock::new();

fn sink_slot() -> &'static RwLock<Option<Sink>> {
    SINK.get_or_init(|| RwLock::new(None))
}

pub fn set_level(level: Level) {
    THRESHOLD.store(level as u8, Ordering::Relaxed);
}

pub fn level() -> Level {
    Level::from_u8(THRESHOLD.load(Ordering::Relaxed))
}

pub fn enabled(level: Level) -> bool {
    level >= self::level()
}

/// Level named by `MIDDLE_RUN_LOG`, if it is set and valid.
pub fn level_from_env() -> Option<Level> {
    std::env::var(LOG_ENV).ok().and_then(|raw| raw.parse().ok())
}

/// Routes every entry at or above the threshold to `sink` instead of stderr.
pub fn set_sink(sink: Sink) {
    *sink_slot().write().expect("log sink poisoned") = Some(sink);
}

pub fn reset_sink() {
    *sink_slot().write().expect("log sink poisoned") = None;
}

fn current_timestamp() -> String {
    format_rfc3339(std::time::SystemTime::now()).to_string()
}

fn stable_tags(tags: &Map<String, Value>) -> Map<String, Value> {
    tags.iter()
        .filter(|(_, value)| matches!(value, Value::String(_) | Value::Number(_) | Value::Bool(_)))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Builds a log entry; only scalar tags are kept, and an empty tag set is
/// omitted.
pub fn build_entry(
    level: Level,
    message: &str,
    data: Option<Value>,
    tags: &Map<String, Value>,
) -> Map<String, Value> {
    let mut entry = Map::new();
    entry.insert("level".to_string(), Value::String(level.to_string()));
    entry.insert("message".to_string(), Value::String(message.to_string()));
    if let Some(data) = data {
        entry.insert("data".to_string(), data);
    }
    let tags = stable_tags(tags);
    if !tags.is_empty() {
        entry.insert("tags".to_string(), Value::Object(tags));
    }
    entry.insert("timestamp".to_string(), Value::String(current_timestamp()));
    entry
}

fn write_line(entry: &Map<String, Value>) {
    if let Ok(serialized) = serde_json::to_string(entry) {
        let _ = writeln!(stderr(), "{serialized}");
    }
}

pub fn emit(level: Level, message: &str, data: Option<Value>) {
    emit_tagged(level, message, data, &Map::new());
}

pub fn emit_tagged(level: Level, message: &str, data: Option<Value>, tags: &Map<String, Value>) {
    if !enabled(level) {
        return;
    }
    let entry = build_entry(level, message, data, tags);
    let sink = sink_slot().read().expect("log sink poisoned").clone();
    match sink {
        Some(sink) => sink(&entry),
        None => write_line(&entry),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_levels_case_insensitively() {
        assert_eq!("WARN".parse::<Level>().unwrap(), Level::Warn);
        assert_eq!("warning".parse::<Level>().unwrap(), Level::Warn);
        assert_eq!(" trace ".parse::<Level>().unwrap(), Level::Trace);
        assert!("fatal".parse::<Level>().is_err());
    }

    #[test]
    fn entry_keeps_only_scalar_tags() {
        let mut tags = Map::new();
        tags.insert("step".to_string(), json!("log"));
        tags.insert("depth".to_string(), json!(2));
        tags.insert("nested".to_string(), json!({ "a": 1 }));
        let entry = build_entry(Level::Info, "hello", Some(json!({ "k": 1 })), &tags);
        assert_eq!(entry.get("level"), Some(&json!("info")));
        assert_eq!(entry.get("message"), Some(&json!("hello")));
        assert_eq!(entry.get("data"), Some(&json!({ "k": 1 })));
        assert_eq!(entry.get("tags"), Some(&json!({ "step": "log", "depth": 2 })));
        assert!(entry.get("timestamp").and_then(Value::as_str).is_some());
    }

    #[test]
    fn entry_omits_empty_tags() {
        let entry = build_entry(Level::Error, "boom", None, &Map::new());
        assert!(entry.get("tags").is_none());
        assert!(entry.get("data").is_none());
    }

    #[test]
    fn levels_order_by_severity() {
        assert!(Level::Error > Level::Warn);
        assert!(Level::Trace < Level::Debug);
    }
}
