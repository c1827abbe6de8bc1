//! A single scheduled probe: subprocess execution bounded by a timeout,
//! plugin-protocol output parsing, and the rise/fall state debouncer.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use tokio::process::Command;
use tokio::time;
use tracing::{debug, warn};

use crate::checks::{Measurement, Observation, ObservationState, Observations};
use crate::config::{self, CheckDef, CommandLine, FlexDuration};
use crate::error::{CheckError, CommandError, ConfigError};

pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_CHECK_TIMEOUT: Duration = Duration::from_millis(10_000);

/// One scheduled probe and the state it maintains. This is also the shape
/// of the `check` object on the event wire, so everything a downstream
/// router needs (identity, state, flap flag, ring) serializes with it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Check {
    #[serde(rename = "id", default)]
    pub uid: String,
    #[serde(default)]
    pub node_name: String,
    pub name: String,
    #[serde(default)]
    pub command: Option<CommandLine>,
    #[serde(default)]
    pub timeout: Option<FlexDuration>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub state: ObservationState,
    #[serde(rename = "hard", default = "default_true")]
    pub hard_state: bool,
    #[serde(rename = "changed", default)]
    pub state_changed: bool,
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,
    #[serde(default)]
    pub interval: Option<FlexDuration>,
    #[serde(default = "default_flap_high")]
    pub flap_threshold_high: f64,
    #[serde(default = "default_flap_low")]
    pub flap_threshold_low: f64,
    #[serde(default = "default_one")]
    pub rise: usize,
    #[serde(default = "default_one")]
    pub fall: usize,
    #[serde(default)]
    pub observations: Observations,
}

fn default_true() -> bool {
    true
}

fn default_one() -> usize {
    1
}

fn default_flap_high() -> f64 {
    crate::checks::observations::DEFAULT_FLAP_HIGH_THRESHOLD
}

fn default_flap_low() -> f64 {
    crate::checks::observations::DEFAULT_FLAP_LOW_THRESHOLD
}

/// Emitted after every execution attempt, carrying a snapshot of the check
/// taken after its state was updated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckEvent {
    pub check: Check,
    #[serde(default)]
    pub observation: Option<Observation>,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub error: bool,
    pub timestamp: DateTime<Utc>,
}

impl Check {
    /// Build a runtime check from its configuration view, validating
    /// durations, thresholds and the working directory.
    pub fn from_def(def: CheckDef, node_name: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidCheck { name: def.name.clone(), reason };

        if let Some(directory) = &def.directory {
            if !config::expand_user(directory).is_dir() {
                return Err(ConfigError::NotADirectory(directory.clone()));
            }
        }

        for duration in [&def.interval, &def.timeout].into_iter().flatten() {
            duration.validate().map_err(|reason| invalid(reason))?;
        }

        if config::duration_or(&def.interval, DEFAULT_CHECK_INTERVAL).is_zero() {
            return Err(invalid("interval must be positive".into()));
        }

        if config::duration_or(&def.timeout, DEFAULT_CHECK_TIMEOUT).is_zero() {
            return Err(invalid("timeout must be positive".into()));
        }

        let mut observations = Observations::default();

        if let Some(high) = def.flap_threshold_high {
            if high < 0.0 {
                return Err(invalid(format!("negative high flap threshold ({high})")));
            }
            observations.flap_threshold_high = high;
        }

        if let Some(low) = def.flap_threshold_low {
            if low < 0.0 {
                return Err(invalid(format!("negative low flap threshold ({low})")));
            }
            observations.flap_threshold_low = low;
        }

        let mut rise = def.rise.unwrap_or(1).max(1);
        let mut fall = def.fall.unwrap_or(1).max(1);

        if fall > observations.size {
            warn!(
                "check '{}' fall threshold ({fall}) is larger than the number of saved \
                 observations ({}), clamping",
                def.name, observations.size
            );
            fall = observations.size;
        }

        if rise > observations.size {
            warn!(
                "check '{}' rise threshold ({rise}) is larger than the number of saved \
                 observations ({}), clamping",
                def.name, observations.size
            );
            rise = observations.size;
        }

        let mut check = Check {
            uid: String::new(),
            node_name: node_name.to_string(),
            name: def.name,
            command: def.command,
            timeout: def.timeout,
            enabled: def.enabled,
            state: ObservationState::Success,
            hard_state: true,
            state_changed: true,
            parameters: def.parameters,
            environment: def.environment,
            directory: def.directory,
            interval: def.interval,
            flap_threshold_high: observations.flap_threshold_high,
            flap_threshold_low: observations.flap_threshold_low,
            rise,
            fall,
            observations,
        };
        check.uid = check.id();

        Ok(check)
    }

    /// Stable identifier: hex SHA-1 over `"<node>:<name>"`, reproducible
    /// across processes and restarts.
    pub fn id(&self) -> String {
        let digest = Sha1::digest(format!("{}:{}", self.node_name, self.name).as_bytes());
        format!("{digest:x}")
    }

    pub fn is_flapping(&self) -> bool {
        self.observations.flapping
    }

    pub fn is_ok(&self) -> bool {
        self.state == ObservationState::Success
    }

    pub fn interval(&self) -> Duration {
        config::duration_or(&self.interval, DEFAULT_CHECK_INTERVAL)
    }

    pub fn timeout(&self) -> Duration {
        config::duration_or(&self.timeout, DEFAULT_CHECK_TIMEOUT)
    }

    /// Run the probe once: spawn the command under the configured timeout,
    /// parse its stdout, push the observation and apply the rise/fall
    /// debouncer.
    pub async fn execute(&mut self) -> Result<Observation, CheckError> {
        if !self.enabled {
            return Err(CheckError::Disabled);
        }

        let args = match self.command.as_ref().map_or(Err(CommandError::Empty), CommandLine::argv) {
            Ok(args) => args,
            Err(err) => {
                warn!("cannot execute check '{}': {err}; disabling check", self.name);
                self.enabled = false;
                return Err(err.into());
            }
        };

        debug!(check = %self.name, ?args, "executing check");

        let mut command = Command::new(&args[0]);
        command
            .args(&args[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .envs(&self.environment)
            .kill_on_drop(true);

        if let Some(directory) = &self.directory {
            command.current_dir(config::expand_user(directory));
        }

        let timeout = self.timeout();
        let output = match time::timeout(timeout, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => return Err(CheckError::Spawn(err)),
            // the abandoned child is killed when its future drops
            Err(_) => return Err(CheckError::Timeout(timeout)),
        };

        let exit_status = output.status.code().unwrap_or(3);
        let mut observation = Observation::new(ObservationState::from_exit_status(exit_status));
        self.parse_output(&output.stdout, &mut observation);

        self.observations.push(observation.clone())?;
        self.apply_rise_fall(&observation);

        Ok(observation)
    }

    /// Split each stdout line on the first `|`: the left side becomes an
    /// output line, the right side is tokenized into performance data.
    fn parse_output(&self, stdout: &[u8], observation: &mut Observation) {
        for line in String::from_utf8_lossy(stdout).lines() {
            let (text, perfdata) = match line.split_once('|') {
                Some((text, perfdata)) => (text, Some(perfdata)),
                None => (line, None),
            };

            observation.output.push(text.trim().to_string());

            let Some(perfdata) = perfdata else { continue };

            for token in perfdata.trim().split(' ') {
                let Some((label, values)) = token.split_once('=') else { continue };
                let fields: Vec<&str> = values.split(';').collect();

                if fields.len() >= 5 {
                    match Measurement::parse(fields[0], fields[1], fields[2], fields[3], fields[4])
                    {
                        Ok(measurement) => {
                            observation.measurements.insert(label.to_string(), measurement);
                        }
                        Err(err) => warn!(
                            check = %self.name,
                            label,
                            "skipping unparseable performance datum: {err}"
                        ),
                    }
                }
            }
        }
    }

    /// Update the declared state from the newest observation, honoring the
    /// rise/fall debounce thresholds.
    fn apply_rise_fall(&mut self, observation: &Observation) {
        if self.rise > 1 && self.state != ObservationState::Success {
            // currently failed; recover only once the last `rise`
            // observations all passed
            if self.is_risen() {
                self.state = ObservationState::Success;
                self.state_changed = true;
            } else {
                self.state_changed = false;
            }
        } else if self.fall > 1 && self.state == ObservationState::Success {
            // currently okay; fail only once the last `fall` observations
            // all failed
            if self.is_fallen() {
                self.state = observation.state;
                self.state_changed = true;
            } else {
                self.state_changed = false;
            }
        } else {
            let values = &self.observations.values;
            self.state_changed = match values.len() {
                0 | 1 => true,
                len => values[len - 2].state != observation.state,
            };
            self.state = observation.state;
        }
    }

    fn is_risen(&self) -> bool {
        let values = &self.observations.values;

        values.len() >= self.rise
            && values[values.len() - self.rise..]
                .iter()
                .all(|o| o.state == ObservationState::Success)
    }

    fn is_fallen(&self) -> bool {
        let values = &self.observations.values;

        values.len() >= self.fall
            && values[values.len() - self.fall..]
                .iter()
                .all(|o| o.state != ObservationState::Success)
    }

    /// Stamp the error sentinel after a failed execution attempt. The state
    /// change flag flips only on the transition into the error state.
    pub fn observe_error(&mut self) {
        if self.state != ObservationState::Error {
            self.state_changed = true;
        }

        self.state = ObservationState::Error;
    }

    /// Execute once and wrap the outcome into an event carrying a snapshot
    /// of this check.
    pub async fn observe(&mut self) -> CheckEvent {
        match self.execute().await {
            Ok(observation) => CheckEvent {
                timestamp: Utc::now(),
                output: observation.output.join("\n"),
                observation: Some(observation),
                error: false,
                check: self.clone(),
            },
            Err(err) => {
                self.observe_error();

                CheckEvent {
                    timestamp: Utc::now(),
                    output: err.to_string(),
                    observation: None,
                    error: true,
                    check: self.clone(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check_with(command: &str, rise: usize, fall: usize) -> Check {
        Check::from_def(
            CheckDef {
                name: "test".into(),
                command: Some(CommandLine::Shell(command.into())),
                rise: Some(rise),
                fall: Some(fall),
                ..Default::default()
            },
            "node1",
        )
        .unwrap()
    }

    fn push_observed_state(check: &mut Check, state: ObservationState) {
        let observation = Observation::new(state);
        check.observations.push(observation.clone()).unwrap();
        check.apply_rise_fall(&observation);
    }

    #[test]
    fn test_id_is_stable_and_pid_free() {
        let a = check_with("true", 1, 1);
        let b = check_with("true", 1, 1);
        assert_eq!(a.id(), b.id());
        assert_eq!(a.id().len(), 40);
        assert_eq!(a.uid, a.id());

        let mut c = check_with("true", 1, 1);
        c.node_name = "node2".into();
        assert_ne!(a.id(), c.id());
    }

    #[test]
    fn test_fall_debounce() {
        let mut check = check_with("true", 2, 3);
        assert_eq!(check.state, ObservationState::Success);

        push_observed_state(&mut check, ObservationState::Success);
        assert_eq!(check.state, ObservationState::Success);

        push_observed_state(&mut check, ObservationState::Critical);
        assert_eq!(check.state, ObservationState::Success);
        assert!(!check.state_changed);

        push_observed_state(&mut check, ObservationState::Critical);
        assert_eq!(check.state, ObservationState::Success);
        assert!(!check.state_changed);

        // third consecutive failure confirms the transition
        push_observed_state(&mut check, ObservationState::Critical);
        assert_eq!(check.state, ObservationState::Critical);
        assert!(check.state_changed);
    }

    #[test]
    fn test_rise_debounce() {
        let mut check = check_with("true", 2, 1);
        push_observed_state(&mut check, ObservationState::Critical);
        assert_eq!(check.state, ObservationState::Critical);

        push_observed_state(&mut check, ObservationState::Success);
        assert_eq!(check.state, ObservationState::Critical);
        assert!(!check.state_changed);

        push_observed_state(&mut check, ObservationState::Success);
        assert_eq!(check.state, ObservationState::Success);
        assert!(check.state_changed);
    }

    #[test]
    fn test_rise_requires_full_window() {
        let mut check = check_with("true", 3, 1);
        check.state = ObservationState::Critical;

        // a single success is not enough history for a rise of three
        push_observed_state(&mut check, ObservationState::Success);
        assert_eq!(check.state, ObservationState::Critical);
    }

    #[test]
    fn test_single_rise_fall_tracks_latest_observation() {
        let mut check = check_with("true", 1, 1);

        push_observed_state(&mut check, ObservationState::Warning);
        assert_eq!(check.state, ObservationState::Warning);
        assert!(check.state_changed, "a lone observation always reads as changed");

        push_observed_state(&mut check, ObservationState::Warning);
        assert!(!check.state_changed);

        push_observed_state(&mut check, ObservationState::Success);
        assert_eq!(check.state, ObservationState::Success);
        assert!(check.state_changed);
    }

    #[test]
    fn test_rise_fall_clamped_to_ring_size() {
        let check = Check::from_def(
            CheckDef {
                name: "clamped".into(),
                command: Some(CommandLine::Shell("true".into())),
                rise: Some(100),
                fall: Some(50),
                ..Default::default()
            },
            "node1",
        )
        .unwrap();

        assert_eq!(check.rise, check.observations.size);
        assert_eq!(check.fall, check.observations.size);
    }

    #[test]
    fn test_negative_interval_rejected() {
        let result = Check::from_def(
            CheckDef {
                name: "bad".into(),
                command: Some(CommandLine::Shell("true".into())),
                interval: Some(FlexDuration::Number(-5)),
                ..Default::default()
            },
            "node1",
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_interval_rejected() {
        let result = Check::from_def(
            CheckDef {
                name: "bad".into(),
                command: Some(CommandLine::Shell("true".into())),
                interval: Some(FlexDuration::Text("0s".into())),
                ..Default::default()
            },
            "node1",
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_execute_parses_performance_data() {
        let mut check = check_with("true", 1, 1);
        check.command = Some(CommandLine::Argv(vec![
            "echo".into(),
            "OK | load=0.82;1;2;0;4 rtt=250ms;;;0;".into(),
        ]));

        let observation = check.execute().await.unwrap();

        assert_eq!(observation.state, ObservationState::Success);
        assert_eq!(observation.output, vec!["OK"]);

        let load = &observation.measurements["load"];
        assert_eq!(load.unit, crate::checks::MeasurementUnit::Numeric);
        assert_eq!(load.value, 0.82);
        assert_eq!(load.warning_threshold, 1.0);
        assert_eq!(load.critical_threshold, 2.0);
        assert_eq!(load.maximum, 4.0);

        let rtt = &observation.measurements["rtt"];
        assert_eq!(rtt.unit, crate::checks::MeasurementUnit::Time);
        assert_eq!(rtt.value, 250.0);
        assert_eq!(rtt.minimum, 0.0);
    }

    #[tokio::test]
    async fn test_execute_maps_exit_status() {
        let mut warning = check_with("sh -c 'exit 1'", 1, 1);
        assert_eq!(warning.execute().await.unwrap().state, ObservationState::Warning);

        let mut critical = check_with("sh -c 'exit 2'", 1, 1);
        assert_eq!(critical.execute().await.unwrap().state, ObservationState::Critical);

        let mut unknown = check_with("sh -c 'exit 42'", 1, 1);
        assert_eq!(unknown.execute().await.unwrap().state, ObservationState::Unknown);
    }

    #[tokio::test]
    async fn test_execute_times_out() {
        let mut check = check_with("sleep 5", 1, 1);
        check.timeout = Some(FlexDuration::Text("100ms".into()));

        let result = check.execute().await;
        assert!(matches!(result, Err(CheckError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_timeout_event_stamps_error_state() {
        let mut check = check_with("sleep 5", 1, 1);
        check.timeout = Some(FlexDuration::Text("50ms".into()));
        check.state_changed = false;

        let event = check.observe().await;
        assert!(event.error);
        assert!(event.output.contains("timed out"));
        assert_eq!(event.check.state, ObservationState::Error);
        assert!(event.check.state_changed, "first error flips the changed flag");

        let event = check.observe().await;
        assert_eq!(event.check.state, ObservationState::Error);
    }

    #[tokio::test]
    async fn test_empty_command_disables_check() {
        let mut check = check_with("true", 1, 1);
        check.command = None;

        assert!(check.execute().await.is_err());
        assert!(!check.enabled);
        assert!(matches!(check.execute().await, Err(CheckError::Disabled)));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_an_error() {
        let mut check = check_with("/nonexistent/binary-for-reacter-tests", 1, 1);
        assert!(matches!(check.execute().await, Err(CheckError::Spawn(_))));
        assert!(check.enabled, "a spawn failure does not disable the check");
    }

    #[test]
    fn test_event_round_trip_preserves_state_fields() {
        let mut check = check_with("true", 2, 3);
        check.state = ObservationState::Critical;
        check.state_changed = true;
        check.observations.flapping = true;

        let event = CheckEvent {
            check: check.clone(),
            observation: Some(Observation::new(ObservationState::Critical)),
            output: "CRITICAL - load too high".into(),
            error: false,
            timestamp: Utc::now(),
        };

        let line = serde_json::to_string(&event).unwrap();
        let parsed: CheckEvent = serde_json::from_str(&line).unwrap();

        assert_eq!(parsed.check.name, check.name);
        assert_eq!(parsed.check.node_name, check.node_name);
        assert_eq!(parsed.check.state, ObservationState::Critical);
        assert!(parsed.check.state_changed);
        assert!(parsed.check.is_flapping());
        assert_eq!(parsed.check.rise, 2);
        assert_eq!(parsed.check.fall, 3);
        assert_eq!(parsed.check.uid, check.uid);
        assert_eq!(parsed.output, event.output);
        assert_eq!(parsed.timestamp, event.timestamp);
    }
}
