//! The check engine: one monitor task per check, a single consumer draining
//! the shared event channel into the log and the JSON event sink.

use anyhow::{Context, Result, bail};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::checks::{Check, CheckEvent, ObservationState};
use crate::config::{self, DEFAULT_CONFIG_DIR, DEFAULT_CONFIG_FILE};

/// A boxed line sink for serialized check events.
pub type JsonSink = Box<dyn AsyncWrite + Send + Unpin>;

/// Owns a set of checks and fans their event streams into one consumer.
pub struct CheckEngine {
    pub node_name: String,
    pub config_file: String,
    pub config_dir: String,
    /// Print serialized events on standard output.
    pub print_json: bool,
    /// Skip serializing events whose check state did not change.
    pub only_print_changes: bool,
    /// Skip serializing events whose check is flapping.
    pub suppress_flapping: bool,
    checks: Vec<Check>,
}

impl CheckEngine {
    pub fn new(node_name: impl Into<String>) -> Self {
        CheckEngine {
            node_name: node_name.into(),
            config_file: DEFAULT_CONFIG_FILE.to_string(),
            config_dir: DEFAULT_CONFIG_DIR.to_string(),
            print_json: false,
            only_print_changes: false,
            suppress_flapping: false,
            checks: Vec::new(),
        }
    }

    /// Load check definitions from the unified file and the config
    /// directory. Invalid definitions are fatal.
    pub fn reload_config(&mut self) -> Result<()> {
        let document = config::load_config_files(&self.config_file, &self.config_dir)?;

        for def in document.checks {
            self.checks.push(Check::from_def(def, &self.node_name)?);
        }

        Ok(())
    }

    /// Load config, start one monitor per check and serve their events
    /// until the process terminates.
    pub async fn run(mut self, json_sink: Option<JsonSink>) -> Result<()> {
        self.reload_config()?;

        if self.checks.is_empty() {
            bail!("no checks defined, nothing to do");
        }

        info!("start monitoring {} checks", self.checks.len());

        let (event_tx, event_rx) = mpsc::channel(64);
        let (stop_tx, stop_rx) = watch::channel(false);

        for check in self.checks.drain(..) {
            debug!(
                "starting monitor for check '{}' every {:?}; {} observation(s) must fail to \
                 enter a failed state, {} must pass to recover",
                check.name,
                check.interval(),
                check.fall,
                check.rise
            );
            tokio::spawn(monitor(check, event_tx.clone(), stop_rx.clone()));
        }

        drop(event_tx);
        let result = self.serve_events(event_rx, json_sink).await;
        let _ = stop_tx.send(true);

        result
    }

    /// Single consumer for the shared event channel: log each event at a
    /// state-keyed severity and serialize it through the configured sinks.
    pub async fn serve_events(
        &self,
        mut events: mpsc::Receiver<CheckEvent>,
        mut json_sink: Option<JsonSink>,
    ) -> Result<()> {
        while let Some(event) = events.recv().await {
            self.log_event(&event);

            if !self.print_json && json_sink.is_none() {
                continue;
            }

            // either always, or only when the state changed from its
            // previous value
            if self.only_print_changes && !event.check.state_changed {
                continue;
            }

            // either always, or only when the check is not flapping
            if self.suppress_flapping && event.check.is_flapping() {
                continue;
            }

            match serde_json::to_string(&event) {
                Ok(line) => {
                    if self.print_json {
                        println!("{line}");
                    }

                    if let Some(sink) = json_sink.as_mut() {
                        sink.write_all(line.as_bytes())
                            .await
                            .context("failed writing event to JSON sink")?;
                        sink.write_all(b"\n").await.context("failed writing event to JSON sink")?;
                    }
                }
                Err(err) => error!("failed to serialize event for check '{}': {err}", event.check.name),
            }
        }

        Ok(())
    }

    fn log_event(&self, event: &CheckEvent) {
        let suffix = if event.check.is_flapping() { " [FLAPPING]" } else { "" };

        if event.error {
            error!(
                "check '{}' encountered an error during execution: {}{suffix}",
                event.check.name, event.output
            );
            return;
        }

        let out = if event.output.is_empty() {
            String::new()
        } else {
            format!(": {}", event.output)
        };

        match event.check.state {
            ObservationState::Success => info!("{} is healthy{suffix}{out}", event.check.name),
            ObservationState::Warning => {
                warn!("{} is in a warning state{suffix}{out}", event.check.name)
            }
            _ => error!("{} is in a critical state{suffix}{out}", event.check.name),
        }
    }
}

/// One monitor loop: execute immediately, then on every interval tick,
/// emitting an event per attempt until the stop signal fires.
async fn monitor(mut check: Check, events: mpsc::Sender<CheckEvent>, mut stop: watch::Receiver<bool>) {
    let mut ticker = time::interval(check.interval());
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let event = check.observe().await;
                if events.send(event).await.is_err() {
                    break;
                }
            }
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    info!("check '{}' monitor is stopping", check.name);
                    break;
                }
            }
        }
    }
}
