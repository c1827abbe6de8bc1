//! Per-check observation history and Nagios-style flap detection.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::checks::Measurement;
use crate::error::CheckError;

pub const DEFAULT_MAX_OBSERVATIONS: usize = 21;
pub const DEFAULT_FLAP_HIGH_THRESHOLD: f64 = 0.5;
pub const DEFAULT_FLAP_LOW_THRESHOLD: f64 = 0.25;
const FLAP_BASE_COEFFICIENT: f64 = 0.8;
const FLAP_WEIGHT_MULTIPLIER: f64 = 0.02;

/// Classified outcome of one check execution. `Error` is an internal
/// sentinel stamped by the engine when the check itself could not run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum ObservationState {
    #[default]
    Success,
    Warning,
    Critical,
    Unknown,
    Error,
}

impl ObservationState {
    /// Map a subprocess exit status into a state. Anything above critical
    /// clamps to unknown.
    pub fn from_exit_status(status: i32) -> Self {
        match status {
            0 => ObservationState::Success,
            1 => ObservationState::Warning,
            2 => ObservationState::Critical,
            _ => ObservationState::Unknown,
        }
    }

    pub fn id(&self) -> u8 {
        match self {
            ObservationState::Success => 0,
            ObservationState::Warning => 1,
            ObservationState::Critical => 2,
            ObservationState::Unknown => 3,
            ObservationState::Error => 128,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ObservationState::Success => "okay",
            ObservationState::Warning => "warning",
            ObservationState::Critical => "critical",
            ObservationState::Unknown | ObservationState::Error => "unknown",
        }
    }
}

impl From<u8> for ObservationState {
    fn from(id: u8) -> Self {
        match id {
            0 => ObservationState::Success,
            1 => ObservationState::Warning,
            2 => ObservationState::Critical,
            128 => ObservationState::Error,
            _ => ObservationState::Unknown,
        }
    }
}

impl From<ObservationState> for u8 {
    fn from(state: ObservationState) -> Self {
        state.id()
    }
}

impl std::fmt::Display for ObservationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One execution outcome: classified state, the non-performance portion of
/// each stdout line, and the parsed measurements. Immutable once pushed.
///
/// Only the measurements travel on the wire; the remaining fields are local
/// to the producing process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    #[serde(skip, default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(skip)]
    pub state: ObservationState,
    #[serde(skip)]
    pub output: Vec<String>,
    #[serde(skip)]
    pub errors: Vec<String>,
    #[serde(rename = "measurements", default)]
    pub measurements: HashMap<String, Measurement>,
}

impl Observation {
    pub fn new(state: ObservationState) -> Self {
        Observation {
            timestamp: Utc::now(),
            state,
            output: Vec::new(),
            errors: Vec::new(),
            measurements: HashMap::new(),
        }
    }
}

/// Bounded, oldest-evicted sequence of observations, carrying the live flap
/// flag and the thresholds driving its hysteresis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observations {
    #[serde(skip)]
    pub values: Vec<Observation>,
    pub size: usize,
    pub flapping: bool,
    #[serde(rename = "flap_detection")]
    pub flap_detect: bool,
    pub flap_threshold_low: f64,
    pub flap_threshold_high: f64,
    #[serde(rename = "flap_factor")]
    pub state_change_factor: f64,
}

impl Default for Observations {
    fn default() -> Self {
        Observations {
            values: Vec::new(),
            size: DEFAULT_MAX_OBSERVATIONS,
            flapping: false,
            flap_detect: true,
            flap_threshold_low: DEFAULT_FLAP_LOW_THRESHOLD,
            flap_threshold_high: DEFAULT_FLAP_HIGH_THRESHOLD,
            state_change_factor: 0.0,
        }
    }
}

impl Observations {
    /// Append an observation, evicting the oldest entry once the ring is at
    /// capacity, and recompute the flap flag when flap detection is on.
    pub fn push(&mut self, observation: Observation) -> Result<(), CheckError> {
        if self.size == 0 {
            return Err(CheckError::ZeroCapacity);
        }

        if self.values.len() >= self.size {
            self.values.remove(0);
        }

        self.values.push(observation);

        if self.flap_detect {
            self.detect_flapping();
        }

        Ok(())
    }

    /// Nagios standard service flap detection: every adjacent state
    /// transition contributes `0.8 + 0.02 * i`, weighting recent transitions
    /// higher, and the sum is divided by the ring length. The flag switches
    /// on above the high threshold and off below the low one.
    fn detect_flapping(&mut self) -> bool {
        let mut state_changes = 0.0;

        for (i, pair) in self.values.windows(2).enumerate() {
            if pair[1].state != pair[0].state {
                state_changes += FLAP_BASE_COEFFICIENT + (i as f64 * FLAP_WEIGHT_MULTIPLIER);
            }
        }

        self.state_change_factor = state_changes / self.values.len() as f64;
        debug!(
            factor = self.state_change_factor,
            high = self.flap_threshold_high,
            low = self.flap_threshold_low,
            "state change factor recomputed"
        );

        if !self.flapping {
            if self.state_change_factor > self.flap_threshold_high {
                self.flapping = true;
            }
        } else if self.state_change_factor < self.flap_threshold_low {
            self.flapping = false;
        }

        self.flapping
    }
}
