use std::io::Error as IoError;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Configuration loading and validation failures. Fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0:#}")]
    Io(#[from] IoError),
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("'{0}' is not a directory")]
    NotADirectory(String),
    #[error("check '{name}': {reason}")]
    InvalidCheck { name: String, reason: String },
    #[error("handler '{name}': {reason}")]
    InvalidHandler { name: String, reason: String },
}

/// An empty or unparseable command line. Permanently disables its owner.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("command not specified")]
    Empty,
    #[error("malformed command: {0}")]
    Unparseable(#[from] shell_words::ParseError),
}

/// Failures surfaced by a single check execution.
#[derive(Debug, Error)]
pub enum CheckError {
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("check is disabled")]
    Disabled,
    #[error("failed to start check process: {0}")]
    Spawn(#[source] IoError),
    #[error("timed out after {0:?} waiting for the command to execute")]
    Timeout(Duration),
    #[error("cannot push observation onto a zero-capacity observation set")]
    ZeroCapacity,
}

/// Failures surfaced by a single handler dispatch or node query.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("failed to start handler process: {0}")]
    Spawn(#[source] IoError),
    #[error("timed out after {0:?} waiting for the handler command to execute")]
    Timeout(Duration),
    #[error("query command failed with {0}")]
    QueryFailed(String),
    #[error("query command returned no nodes")]
    NoNodes,
}
