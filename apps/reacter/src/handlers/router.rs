//! The event router: consumes newline-delimited JSON check events and
//! dispatches them to every matching handler. Also hosts the query-cache
//! writer that periodically materializes handler node queries to files.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use futures::future::join_all;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::checks::CheckEvent;
use crate::config::{self, DEFAULT_CONFIG_DIR, DEFAULT_CONFIG_FILE};
use crate::handlers::Handler;

pub const DEFAULT_CACHE_DIR: &str = "/dev/shm/reacter/handler-queries";

/// Reads check events and applies every configured handler to each one.
pub struct EventRouter {
    pub config_file: String,
    pub config_dir: String,
    pub cache_dir: PathBuf,
    handlers: Vec<Handler>,
}

impl Default for EventRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl EventRouter {
    pub fn new() -> Self {
        EventRouter {
            config_file: DEFAULT_CONFIG_FILE.to_string(),
            config_dir: DEFAULT_CONFIG_DIR.to_string(),
            cache_dir: PathBuf::from(DEFAULT_CACHE_DIR),
            handlers: Vec::new(),
        }
    }

    /// Load handler definitions from the unified file and the config
    /// directory. Invalid definitions are fatal.
    pub fn reload_config(&mut self) -> Result<()> {
        let document = config::load_config_files(&self.config_file, &self.config_dir)?;

        for def in document.handlers {
            self.handlers.push(Handler::from_def(def, &self.cache_dir)?);
        }

        Ok(())
    }

    pub fn add_handler(&mut self, handler: Handler) {
        self.handlers.push(handler);
    }

    /// Consume newline-delimited JSON events from `input` until end of
    /// stream. Each line's handlers are evaluated and dispatched
    /// concurrently; malformed lines are logged and skipped. Returns an
    /// aggregate error if any handler invocation errored.
    pub async fn run<R>(&mut self, input: R) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        self.reload_config()?;

        if self.handlers.is_empty() {
            bail!("no handlers defined, nothing to do");
        }

        debug!("handling check events read from input stream");

        let mut reader = BufReader::new(input);
        let mut line = String::new();
        let mut has_errored = false;

        loop {
            line.clear();
            if reader.read_line(&mut line).await.context("failed reading event stream")? == 0 {
                break;
            }

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let event: CheckEvent = match serde_json::from_str(trimmed) {
                Ok(event) => event,
                Err(err) => {
                    warn!("failed to parse input line: {err}");
                    continue;
                }
            };

            let dispatches = self.handlers.iter_mut().map(|handler| dispatch(handler, &event));

            if join_all(dispatches).await.into_iter().any(|errored| errored) {
                has_errored = true;
            }
        }

        if has_errored {
            bail!("encountered one or more errors during handler execution");
        }

        Ok(())
    }

    /// Materialize every query-backed handler's node list into the cache
    /// directory, then keep regenerating on the given interval. A zero
    /// interval regenerates once and returns.
    pub async fn run_query_cacher(&mut self, interval: Duration) -> Result<()> {
        self.reload_config()?;

        tokio::fs::create_dir_all(&self.cache_dir)
            .await
            .with_context(|| format!("failed to create cache dir {}", self.cache_dir.display()))?;

        self.regenerate_cache().await;

        if !interval.is_zero() {
            info!("starting query cache refresh every {interval:?}");

            let mut ticker = time::interval(interval);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                self.regenerate_cache().await;
            }
        }

        Ok(())
    }

    /// Run every handler's node query concurrently and atomically replace
    /// its cache file with the result, one node per line.
    pub async fn regenerate_cache(&self) {
        let refreshes = self
            .handlers
            .iter()
            .filter(|handler| handler.query_command.is_some())
            .map(|handler| async move {
                match handler.execute_node_query().await {
                    Ok(nodes) => {
                        let path = handler.cache_filename();
                        debug!("caching output of query for handler '{}'", handler.name);

                        let data = nodes.join("\n") + "\n";
                        if let Err(err) = write_atomic(&path, data.as_bytes()).await {
                            error!("failed to write cache file '{}': {err}", path.display());
                        }
                    }
                    Err(err) => {
                        warn!("query command for handler '{}' failed: {err}", handler.name)
                    }
                }
            });

        join_all(refreshes).await;
    }
}

/// Evaluate and run one handler against one event, recording the firing
/// time either way. Returns whether the dispatch errored.
async fn dispatch(handler: &mut Handler, event: &CheckEvent) -> bool {
    if !handler.should_exec(&event.check).await {
        return false;
    }

    let result = handler.execute(event).await;
    handler.last_fired_at = Some(time::Instant::now());

    match result {
        Ok(()) => {
            info!(
                "executed handler '{}' for check {}/{}",
                handler.name, event.check.node_name, event.check.name
            );
            false
        }
        Err(err) => {
            error!("error executing handler {}: {err}", handler.name);
            true
        }
    }
}

/// Replace `path` with `data` via a temp file in the same directory, so a
/// concurrent reader never observes a partial write.
async fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, data).await?;
    tokio::fs::rename(&tmp, path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CommandLine, HandlerDef};
    use std::io::Cursor;

    fn capture_handler(name: &str, out_file: &Path) -> Handler {
        Handler::from_def(
            HandlerDef {
                name: name.into(),
                command: Some(CommandLine::Shell(format!(
                    "sh -c 'cat >> {}'",
                    out_file.display()
                ))),
                ..Default::default()
            },
            Path::new("/tmp/reacter-test-cache"),
        )
        .unwrap()
    }

    fn event_line(check_name: &str, node: &str, state: u8, output: &str) -> String {
        format!(
            r#"{{"check":{{"id":"","node_name":"{node}","name":"{check_name}","state":{state},"changed":true}},"observation":null,"output":"{output}","error":false,"timestamp":"2026-01-05T12:00:00Z"}}"#
        )
    }

    #[tokio::test]
    async fn test_router_dispatches_matching_events() {
        let dir = tempfile::tempdir().unwrap();
        let out_file = dir.path().join("dispatched.txt");

        let mut router = EventRouter::new();
        router.config_file = "/nonexistent/reacter.yml".into();
        router.config_dir = dir.path().join("conf.d").to_string_lossy().into_owned();

        std::fs::create_dir_all(dir.path().join("conf.d")).unwrap();
        std::fs::write(
            dir.path().join("conf.d/handlers.yml"),
            format!(
                "handlers:\n  - name: capture\n    command: \"sh -c 'cat >> {}'\"\n    checks: [disk]\n",
                out_file.display()
            ),
        )
        .unwrap();

        let input = [
            event_line("disk", "n1", 2, "disk is full"),
            "not valid json".to_string(),
            event_line("load", "n1", 2, "load is high"),
        ]
        .join("\n")
            + "\n";

        router.run(Cursor::new(input)).await.unwrap();

        let captured = std::fs::read_to_string(&out_file).unwrap();
        assert!(captured.contains("disk is full"));
        assert!(!captured.contains("load is high"));
    }

    #[tokio::test]
    async fn test_router_records_last_fired_at() {
        let dir = tempfile::tempdir().unwrap();
        let out_file = dir.path().join("fired.txt");

        let mut handler = capture_handler("capture", &out_file);
        let event: CheckEvent =
            serde_json::from_str(&event_line("disk", "n1", 2, "boom")).unwrap();

        assert!(handler.last_fired_at.is_none());
        assert!(!dispatch(&mut handler, &event).await);
        assert!(handler.last_fired_at.is_some());
    }

    #[tokio::test]
    async fn test_router_aggregates_handler_errors() {
        let dir = tempfile::tempdir().unwrap();

        let mut router = EventRouter::new();
        router.config_file = "/nonexistent/reacter.yml".into();
        router.config_dir = dir.path().to_string_lossy().into_owned();

        // a handler whose command times out produces a dispatch error
        std::fs::write(
            dir.path().join("handlers.yml"),
            "handlers:\n  - name: slow\n    command: sleep 5\n    timeout: \"50ms\"\n",
        )
        .unwrap();

        let input = event_line("disk", "n1", 2, "boom") + "\n";
        let err = router.run(Cursor::new(input)).await.unwrap_err();
        assert!(err.to_string().contains("one or more errors"));
    }

    #[tokio::test]
    async fn test_router_without_handlers_fails() {
        let mut router = EventRouter::new();
        router.config_file = "/nonexistent/reacter.yml".into();
        router.config_dir = "/nonexistent/conf.d".into();

        let err = router.run(Cursor::new(String::new())).await.unwrap_err();
        assert!(err.to_string().contains("no handlers"));
    }

    #[tokio::test]
    async fn test_query_cacher_writes_cache_files() {
        let dir = tempfile::tempdir().unwrap();

        let mut router = EventRouter::new();
        router.cache_dir = dir.path().join("cache");

        let handler = Handler::from_def(
            HandlerDef {
                name: "queried".into(),
                command: Some(CommandLine::Shell("cat".into())),
                query_command: Some(CommandLine::Argv(vec![
                    "printf".into(),
                    "n1\nn2\n".into(),
                ])),
                ..Default::default()
            },
            &router.cache_dir,
        )
        .unwrap();
        router.add_handler(handler);

        tokio::fs::create_dir_all(&router.cache_dir).await.unwrap();
        router.regenerate_cache().await;

        let cached =
            std::fs::read_to_string(router.cache_dir.join("queried.txt")).unwrap();
        assert_eq!(cached, "n1\nn2\n");
    }

    #[tokio::test]
    async fn test_failed_query_leaves_no_cache_file() {
        let dir = tempfile::tempdir().unwrap();

        let mut router = EventRouter::new();
        router.cache_dir = dir.path().to_path_buf();

        let handler = Handler::from_def(
            HandlerDef {
                name: "broken".into(),
                command: Some(CommandLine::Shell("cat".into())),
                query_command: Some(CommandLine::Shell("false".into())),
                ..Default::default()
            },
            &router.cache_dir,
        )
        .unwrap();
        router.add_handler(handler);

        router.regenerate_cache().await;
        assert!(!router.cache_dir.join("broken.txt").exists());
    }
}
