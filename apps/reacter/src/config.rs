//! YAML configuration model and loader.
//!
//! A configuration document may carry a `checks:` list, a `handlers:` list,
//! or both. The loader reads the unified config file first (when it is a
//! non-empty regular file), then every regular `*.yml` file found by a
//! recursive walk of the config directory.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{CommandError, ConfigError};

pub const DEFAULT_CONFIG_FILE: &str = "/etc/reacter.yml";
pub const DEFAULT_CONFIG_DIR: &str = "/etc/reacter/conf.d";

/// A duration field that accepts either a bare number or a string with a
/// unit suffix. Bare numbers below 1000 are read as seconds, larger ones as
/// milliseconds; zero defers to the caller's fallback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FlexDuration {
    Number(i64),
    Text(String),
}

impl FlexDuration {
    pub fn coerce(&self, fallback: Duration) -> Duration {
        match self {
            FlexDuration::Number(0) => fallback,
            FlexDuration::Number(n) if *n < 0 => fallback,
            FlexDuration::Number(n) if *n < 1000 => Duration::from_secs(*n as u64),
            FlexDuration::Number(n) => Duration::from_millis(*n as u64),
            FlexDuration::Text(s) => parse_duration(s).unwrap_or(fallback),
        }
    }

    /// Reject values that cannot be coerced at runtime: negative numbers and
    /// unparseable strings.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            FlexDuration::Number(n) if *n < 0 => Err(format!("negative duration ({n})")),
            FlexDuration::Number(_) => Ok(()),
            FlexDuration::Text(s) => parse_duration(s).map(|_| ()),
        }
    }
}

/// Coerce an optional flexible duration, falling back when absent or zero.
pub fn duration_or(value: &Option<FlexDuration>, fallback: Duration) -> Duration {
    value.as_ref().map_or(fallback, |v| v.coerce(fallback))
}

/// Suffix to nanoseconds multiplier (order matters: longer suffixes first).
const UNITS: &[(&str, f64)] = &[
    ("ns", 1.0),
    ("us", 1_000.0),
    ("ms", 1_000_000.0),
    ("s", 1_000_000_000.0),
    ("m", 60_000_000_000.0),
    ("h", 3_600_000_000_000.0),
];

/// Parse duration strings like `"30s"`, `"250ms"`, `"5m"`, `"1h"`.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();

    for (suffix, multiplier) in UNITS {
        if let Some(value) = s.strip_suffix(suffix) {
            let value: f64 =
                value.trim().parse().map_err(|_| format!("invalid duration '{s}'"))?;
            return Ok(Duration::from_nanos((value * multiplier) as u64));
        }
    }

    Err(format!("unknown duration format '{s}'"))
}

/// A command line: either a pre-split argument vector or a single string
/// that is split with shell quoting rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandLine {
    Argv(Vec<String>),
    Shell(String),
}

impl CommandLine {
    /// Resolve to a non-empty argument vector.
    pub fn argv(&self) -> Result<Vec<String>, CommandError> {
        let args = match self {
            CommandLine::Argv(args) => args.clone(),
            CommandLine::Shell(line) => shell_words::split(line)?,
        };

        if args.is_empty() { Err(CommandError::Empty) } else { Ok(args) }
    }
}

/// Configuration view of a single check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckDef {
    pub name: String,
    #[serde(default)]
    pub command: Option<CommandLine>,
    #[serde(default)]
    pub timeout: Option<FlexDuration>,
    #[serde(default)]
    pub interval: Option<FlexDuration>,
    #[serde(default)]
    pub directory: Option<String>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub flap_threshold_high: Option<f64>,
    #[serde(default)]
    pub flap_threshold_low: Option<f64>,
    #[serde(default)]
    pub rise: Option<usize>,
    #[serde(default)]
    pub fall: Option<usize>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for CheckDef {
    fn default() -> Self {
        CheckDef {
            name: String::new(),
            command: None,
            timeout: None,
            interval: None,
            directory: None,
            environment: HashMap::new(),
            parameters: HashMap::new(),
            flap_threshold_high: None,
            flap_threshold_low: None,
            rise: None,
            fall: None,
            enabled: default_true(),
        }
    }
}

/// Configuration view of a single handler.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HandlerDef {
    pub name: String,
    #[serde(default)]
    pub command: Option<CommandLine>,
    #[serde(default, rename = "query")]
    pub query_command: Option<CommandLine>,
    #[serde(default, rename = "nodefile")]
    pub node_file: Option<String>,
    #[serde(default, rename = "nodefile_autoreload")]
    pub node_file_autoreload: bool,
    #[serde(default)]
    pub node_names: Vec<String>,
    #[serde(default, rename = "checks")]
    pub check_names: Vec<String>,
    /// Reserved: accepted but not evaluated by the handler predicate.
    #[serde(default)]
    pub states: Vec<i64>,
    #[serde(default)]
    pub skip_ok: bool,
    #[serde(default)]
    pub skip_flapping: bool,
    #[serde(default)]
    pub only_changes: bool,
    #[serde(default)]
    pub disable: bool,
    #[serde(default)]
    pub directory: Option<String>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    #[serde(default)]
    pub timeout: Option<FlexDuration>,
    #[serde(default)]
    pub cooldown: Option<FlexDuration>,
    #[serde(default)]
    pub query_timeout: Option<FlexDuration>,
}

/// One parsed configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigDocument {
    #[serde(default)]
    pub checks: Vec<CheckDef>,
    #[serde(default)]
    pub handlers: Vec<HandlerDef>,
}

impl ConfigDocument {
    fn merge(&mut self, other: ConfigDocument) {
        self.checks.extend(other.checks);
        self.handlers.extend(other.handlers);
    }
}

fn default_true() -> bool {
    true
}

/// Expand a leading `~` or `~/` to the current user's home directory.
pub fn expand_user(path: &str) -> PathBuf {
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    } else if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }

    PathBuf::from(path)
}

/// Load the unified config file (if present and non-empty), then every
/// `*.yml` under the config directory, recursively, in path order.
pub fn load_config_files(config_file: &str, config_dir: &str) -> Result<ConfigDocument, ConfigError> {
    let mut document = ConfigDocument::default();

    let config_file = expand_user(config_file);
    if config_file.is_file() && fs::metadata(&config_file)?.len() > 0 {
        info!("loading: {}", config_file.display());
        document.merge(load_config(&config_file)?);
    }

    let config_dir = expand_user(config_dir);
    if config_dir.is_dir() {
        debug!("scanning for config files in {}", config_dir.display());

        let mut paths = Vec::new();
        collect_yaml_files(&config_dir, &mut paths)?;
        paths.sort();

        for path in paths {
            info!("loading: {}", path.display());
            document.merge(load_config(&path)?);
        }
    }

    Ok(document)
}

/// Parse a single YAML configuration file.
pub fn load_config(path: &Path) -> Result<ConfigDocument, ConfigError> {
    let data = fs::read_to_string(path)?;

    serde_yaml::from_str(&data).map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })
}

fn collect_yaml_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), ConfigError> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            collect_yaml_files(&path, out)?;
        } else if file_type.is_file() && path.extension().is_some_and(|ext| ext == "yml") {
            out.push(path);
        }
    }

    Ok(())
}
