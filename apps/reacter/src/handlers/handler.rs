//! One dispatch rule: predicate evaluation, node-set resolution, and
//! subprocess execution under the `REACTER_*` environment contract.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::{self, Instant};
use tracing::{debug, warn};

use crate::checks::{Check, CheckEvent};
use crate::config::{self, CommandLine, FlexDuration, HandlerDef};
use crate::error::{CommandError, ConfigError, HandlerError};

pub const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(6);
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(3);

/// A rule that dispatches an external command for events matching its
/// predicate. The target node set comes from an explicit list, a node file,
/// or a query command.
#[derive(Debug, Clone)]
pub struct Handler {
    pub name: String,
    pub command: Option<CommandLine>,
    pub query_command: Option<CommandLine>,
    pub node_file: Option<String>,
    pub node_file_autoreload: bool,
    pub node_names: Vec<String>,
    pub check_names: Vec<String>,
    /// Reserved: carried through config but not evaluated by the predicate.
    pub states: Vec<i64>,
    pub skip_ok: bool,
    pub skip_flapping: bool,
    pub only_changes: bool,
    pub disable: bool,
    pub directory: Option<String>,
    pub environment: HashMap<String, String>,
    pub parameters: HashMap<String, String>,
    pub timeout: Option<FlexDuration>,
    pub cooldown: Option<FlexDuration>,
    pub query_timeout: Option<FlexDuration>,
    pub cache_dir: PathBuf,
    pub last_fired_at: Option<Instant>,
}

impl Handler {
    /// Build a runtime handler from its configuration view, validating
    /// durations and the working directory, and loading the node file once.
    pub fn from_def(def: HandlerDef, cache_dir: &Path) -> Result<Self, ConfigError> {
        let invalid =
            |reason: String| ConfigError::InvalidHandler { name: def.name.clone(), reason };

        if let Some(directory) = &def.directory {
            if !config::expand_user(directory).is_dir() {
                return Err(ConfigError::NotADirectory(directory.clone()));
            }
        }

        for duration in [&def.timeout, &def.cooldown, &def.query_timeout].into_iter().flatten() {
            duration.validate().map_err(|reason| invalid(reason))?;
        }

        let mut handler = Handler {
            name: def.name,
            command: def.command,
            query_command: def.query_command,
            node_file: def.node_file,
            node_file_autoreload: def.node_file_autoreload,
            node_names: def.node_names,
            check_names: def.check_names,
            states: def.states,
            skip_ok: def.skip_ok,
            skip_flapping: def.skip_flapping,
            only_changes: def.only_changes,
            disable: def.disable,
            directory: def.directory,
            environment: def.environment,
            parameters: def.parameters,
            timeout: def.timeout,
            cooldown: def.cooldown,
            query_timeout: def.query_timeout,
            cache_dir: cache_dir.to_path_buf(),
            last_fired_at: None,
        };

        handler.load_node_file();

        Ok(handler)
    }

    /// Conventional location of this handler's cached node query output.
    pub fn cache_filename(&self) -> PathBuf {
        self.cache_dir.join(format!("{}.txt", self.name))
    }

    /// Evaluate the dispatch predicate against a check snapshot, resolving
    /// the target node set on the way.
    pub async fn should_exec(&mut self, check: &Check) -> bool {
        if self.disable {
            return false;
        }

        if let Some(cooldown) = &self.cooldown {
            let cooldown = cooldown.coerce(Duration::ZERO);
            if !cooldown.is_zero() {
                if let Some(last) = self.last_fired_at {
                    let since = last.elapsed();
                    if since < cooldown {
                        debug!(
                            "skipping handler '{}' because it is in a cooldown period \
                             ({since:?} < {cooldown:?})",
                            self.name
                        );
                        return false;
                    }
                }
            }
        }

        if self.skip_flapping && check.is_flapping() {
            debug!(
                "skipping handler '{}' because it doesn't handle flapping but this check is \
                 flapping",
                self.name
            );
            return false;
        }

        if self.only_changes && !check.state_changed {
            debug!(
                "skipping handler '{}' because it only handles state changes and this check \
                 has not changed",
                self.name
            );
            return false;
        }

        if self.skip_ok && check.is_ok() {
            debug!("skipping handler '{}' because the check is okay", self.name);
            return false;
        }

        if self.node_file_autoreload {
            self.load_node_file();
        }

        // run the query now only when no node file caches its output; the
        // cache file exists so an external process can absorb the cost of
        // querying on every event
        if self.node_file.is_none() && self.query_command.is_some() {
            match self.execute_node_query().await {
                Ok(nodes) => self.node_names = nodes,
                Err(HandlerError::NoNodes) => {
                    debug!(
                        "skipping handler '{}' because the query command returned no nodes",
                        self.name
                    );
                    return false;
                }
                Err(err) => warn!("query command for handler '{}' failed: {err}", self.name),
            }
        }

        if !self.node_names.is_empty() && !self.node_names.iter().any(|n| *n == check.node_name) {
            debug!(
                "skipping handler '{}' because node '{}' is not in the list of nodes to handle",
                self.name, check.node_name
            );
            return false;
        }

        if !self.check_names.is_empty() && !self.check_names.iter().any(|n| *n == check.name) {
            debug!(
                "skipping handler '{}' because check '{}' is not in the list of checks to \
                 handle",
                self.name, check.name
            );
            return false;
        }

        // the `states` allow-list is reserved and intentionally not
        // evaluated here

        true
    }

    /// Run the query command under its own timeout and split its stdout
    /// into a node list, dropping blanks and `#`-prefixed lines.
    pub async fn execute_node_query(&self) -> Result<Vec<String>, HandlerError> {
        let Some(query) = &self.query_command else {
            return Ok(Vec::new());
        };

        let args = query.argv()?;
        debug!(handler = %self.name, ?args, "executing query command");

        let mut command = Command::new(&args[0]);
        command
            .args(&args[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let timeout = config::duration_or(&self.query_timeout, DEFAULT_QUERY_TIMEOUT);
        let output = match time::timeout(timeout, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => return Err(HandlerError::Spawn(err)),
            Err(_) => return Err(HandlerError::Timeout(timeout)),
        };

        if !output.status.success() {
            return Err(HandlerError::QueryFailed(output.status.to_string()));
        }

        let nodes: Vec<String> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_string)
            .collect();

        debug!("query command returned {} nodes", nodes.len());

        if nodes.is_empty() {
            return Err(HandlerError::NoNodes);
        }

        Ok(nodes)
    }

    /// Replace the node set from the node file. The literal value `true`
    /// selects the conventional cache filename. A missing or unreadable
    /// file leaves the current set in place.
    pub fn load_node_file(&mut self) {
        let Some(node_file) = &self.node_file else {
            return;
        };

        let path = if node_file == "true" {
            self.cache_filename()
        } else {
            config::expand_user(node_file)
        };

        debug!("loading nodes from nodefile at '{}'", path.display());

        match fs::read_to_string(&path) {
            Ok(data) => {
                self.node_names = data
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .map(str::to_string)
                    .collect();

                debug!("node file contained {} nodes", self.node_names.len());
            }
            Err(err) => warn!("unable to read node file '{}': {err}", path.display()),
        }
    }

    /// Dispatch the handler command for one event: working directory and
    /// merged environment per the contract, the event output piped to the
    /// subprocess's stdin, the whole run bounded by the handler timeout.
    pub async fn execute(&mut self, event: &CheckEvent) -> Result<(), HandlerError> {
        if self.disable {
            return Ok(());
        }

        let args = match self.command.as_ref().map_or(Err(CommandError::Empty), CommandLine::argv)
        {
            Ok(args) => args,
            Err(err) => {
                warn!("cannot execute handler '{}': {err}; disabling handler", self.name);
                self.disable = true;
                return Err(err.into());
            }
        };

        debug!(handler = %self.name, ?args, "executing handler");

        let mut command = Command::new(&args[0]);
        command.args(&args[1..]).stdin(Stdio::piped()).kill_on_drop(true);

        if let Some(directory) = &self.directory {
            let directory = config::expand_user(directory);
            if directory.is_dir() {
                command.current_dir(directory);
            }
        }

        self.apply_environment(&mut command, event);

        let mut child = command.spawn().map_err(HandlerError::Spawn)?;
        let timeout = config::duration_or(&self.timeout, DEFAULT_HANDLER_TIMEOUT);

        let run = async {
            if let Some(mut stdin) = child.stdin.take() {
                if let Err(err) = stdin.write_all(event.output.as_bytes()).await {
                    warn!("handler '{}' did not consume its input: {err}", self.name);
                }
                // dropping the pipe closes the subprocess's stdin
            }

            child.wait().await
        };

        match time::timeout(timeout, run).await {
            Ok(Ok(status)) if status.success() => {
                debug!("handler '{}' executed successfully", self.name);
                Ok(())
            }
            Ok(Ok(status)) => {
                warn!("handler '{}' failed during execution: {status}", self.name);
                Ok(())
            }
            Ok(Err(err)) => {
                warn!("handler '{}' failed during execution: {err}", self.name);
                Ok(())
            }
            // the abandoned child is killed when it drops with the future
            Err(_) => Err(HandlerError::Timeout(timeout)),
        }
    }

    /// Assemble the subprocess environment: the inherited environment plus
    /// the handler's own variables (minus the reserved `REACTER_` names),
    /// exported parameters, and the well-known event variables.
    fn apply_environment(&self, command: &mut Command, event: &CheckEvent) {
        for (key, value) in &self.environment {
            if !key.to_uppercase().starts_with("REACTER_") {
                command.env(key, value);
            }
        }

        for (key, value) in &self.parameters {
            command.env(format!("REACTER_PARAM_{}", key.to_uppercase()), value);
        }

        let check = &event.check;
        let flag = |on: bool| if on { "1" } else { "0" };

        command
            .env("REACTER_STATE_CHANGED", flag(check.state_changed))
            .env("REACTER_STATE_FLAPPING", flag(check.is_flapping()))
            .env("REACTER_STATE_HARD", flag(check.hard_state))
            .env("REACTER_STATE", check.state.as_str())
            .env("REACTER_STATE_ID", check.state.id().to_string())
            .env("REACTER_CHECK_ID", check.id())
            .env("REACTER_CHECK_NODE", &check.node_name)
            .env("REACTER_CHECK_NAME", &check.name)
            .env("REACTER_EPOCH", event.timestamp.timestamp().to_string())
            .env("REACTER_EPOCH_MS", event.timestamp.timestamp_millis().to_string())
            .env("REACTER_HANDLER", &self.name);
    }
}
