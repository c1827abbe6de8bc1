//! The check engine: periodic subprocess probes, plugin-output parsing,
//! rise/fall debouncing and flap detection.

pub mod check;
pub mod engine;
pub mod measurement;
pub mod observations;

pub use check::{Check, CheckEvent};
pub use engine::CheckEngine;
pub use measurement::{Measurement, MeasurementUnit};
pub use observations::{Observation, ObservationState, Observations};
