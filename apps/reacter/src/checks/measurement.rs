//! Parsing of a single performance-data token (`label=value;warn;crit;min;max`).

use std::num::ParseFloatError;

use serde::{Deserialize, Serialize};

/// Unit of measure attached to a performance-data value, inferred from the
/// suffix on the value token.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeasurementUnit {
    #[default]
    Unknown,
    Numeric,
    Time,
    Percent,
    Bytes,
    Counter,
}

/// Byte-unit suffix to multiplier (longer suffixes first; a bare `b` is 1).
const BYTE_UNITS: &[(&str, f64)] = &[
    ("kb", 1_024.0),
    ("mb", 1_048_576.0),
    ("gb", 1_073_741_824.0),
    ("tb", 1_099_511_627_776.0),
    ("pb", 1_125_899_906_842_624.0),
    ("eb", 1_152_921_504_606_846_976.0),
    ("zb", 1_180_591_620_717_411_303_424.0),
    ("yb", 1_208_925_819_614_629_174_706_176.0),
];

/// One normalized performance datum. Time values are normalized to
/// milliseconds and byte values to bytes; the same factor is applied to the
/// thresholds and bounds so all five numbers share a unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub unit: MeasurementUnit,
    pub value: f64,
    #[serde(rename = "warning")]
    pub warning_threshold: f64,
    #[serde(rename = "critical")]
    pub critical_threshold: f64,
    pub minimum: f64,
    pub maximum: f64,
}

impl Measurement {
    /// Parse the five fields of a performance-data token. Empty threshold
    /// and bound fields read as zero; any other unparseable field is an
    /// error and the caller skips the whole token.
    pub fn parse(
        value_uom: &str,
        warn: &str,
        crit: &str,
        min: &str,
        max: &str,
    ) -> Result<Self, ParseFloatError> {
        let value_uom = value_uom.to_lowercase();
        let (unit, factor) = unit_and_factor(&value_uom);

        // numeric prefix of the value, sans unit-of-measure
        let value_str =
            value_uom.trim_matches(|c: char| !(c == '-' || c == '.' || c.is_ascii_digit()));

        Ok(Measurement {
            unit,
            value: value_str.parse::<f64>()? * factor,
            warning_threshold: parse_field(warn)? * factor,
            critical_threshold: parse_field(crit)? * factor,
            minimum: parse_field(min)? * factor,
            maximum: parse_field(max)? * factor,
        })
    }
}

fn parse_field(field: &str) -> Result<f64, ParseFloatError> {
    let field = field.trim();
    if field.is_empty() { Ok(0.0) } else { field.parse() }
}

fn unit_and_factor(value: &str) -> (MeasurementUnit, f64) {
    if value.ends_with('s') {
        // normalize all time values as milliseconds
        let factor = if value.ends_with("ns") {
            0.000_001
        } else if value.ends_with("us") {
            0.001
        } else if value.ends_with("ms") {
            1.0
        } else {
            1000.0
        };

        (MeasurementUnit::Time, factor)
    } else if value.ends_with('c') {
        (MeasurementUnit::Counter, 1.0)
    } else if value.ends_with('%') {
        (MeasurementUnit::Percent, 1.0)
    } else if value.ends_with('b') {
        let factor = BYTE_UNITS
            .iter()
            .find(|(suffix, _)| value.ends_with(suffix))
            .map_or(1.0, |(_, factor)| *factor);

        (MeasurementUnit::Bytes, factor)
    } else if value == "u" {
        (MeasurementUnit::Unknown, 1.0)
    } else {
        (MeasurementUnit::Numeric, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_numeric() {
        let m = Measurement::parse("0.82", "1", "2", "0", "4").unwrap();
        assert_eq!(m.unit, MeasurementUnit::Numeric);
        assert_eq!(m.value, 0.82);
        assert_eq!(m.warning_threshold, 1.0);
        assert_eq!(m.critical_threshold, 2.0);
        assert_eq!(m.minimum, 0.0);
        assert_eq!(m.maximum, 4.0);
    }

    #[test]
    fn test_time_normalized_to_milliseconds() {
        let m = Measurement::parse("250ms", "", "", "0", "").unwrap();
        assert_eq!(m.unit, MeasurementUnit::Time);
        assert_eq!(m.value, 250.0);

        let m = Measurement::parse("2s", "5", "10", "0", "60").unwrap();
        assert_eq!(m.value, 2000.0);
        assert_eq!(m.warning_threshold, 5000.0);

        let m = Measurement::parse("1500us", "", "", "", "").unwrap();
        assert_eq!(m.value, 1.5);

        let m = Measurement::parse("4000ns", "", "", "", "").unwrap();
        assert!((m.value - 0.004).abs() < 1e-9);
    }

    #[test]
    fn test_bytes_normalized() {
        let kb = Measurement::parse("1kb", "", "", "", "").unwrap();
        let b = Measurement::parse("1024b", "", "", "", "").unwrap();
        assert_eq!(kb.unit, MeasurementUnit::Bytes);
        assert_eq!(kb.value, 1024.0);
        assert_eq!(kb.value, b.value);

        let gb = Measurement::parse("2GB", "", "", "", "").unwrap();
        assert_eq!(gb.value, 2.0 * 1_073_741_824.0);
    }

    #[test]
    fn test_percent_counter_unknown() {
        let m = Measurement::parse("87%", "90", "95", "0", "100").unwrap();
        assert_eq!(m.unit, MeasurementUnit::Percent);
        assert_eq!(m.value, 87.0);

        let m = Measurement::parse("1234c", "", "", "", "").unwrap();
        assert_eq!(m.unit, MeasurementUnit::Counter);
        assert_eq!(m.value, 1234.0);

        let m = Measurement::parse("u", "", "", "", "");
        assert!(m.is_err(), "a bare unit with no numeric prefix cannot parse");
    }

    #[test]
    fn test_negative_values() {
        let m = Measurement::parse("-12.5", "-1", "-2", "-100", "100").unwrap();
        assert_eq!(m.value, -12.5);
        assert_eq!(m.minimum, -100.0);
    }

    #[test]
    fn test_unparseable_field_is_an_error() {
        assert!(Measurement::parse("abc", "1", "2", "0", "4").is_err());
        assert!(Measurement::parse("1.0", "oops", "2", "0", "4").is_err());
    }

    #[test]
    fn test_parse_is_idempotent_on_normalized_input() {
        let once = Measurement::parse("250ms", "500", "1000", "0", "5000").unwrap();
        let again = Measurement::parse(
            &format!("{}ms", once.value),
            &once.warning_threshold.to_string(),
            &once.critical_threshold.to_string(),
            &once.minimum.to_string(),
            &once.maximum.to_string(),
        )
        .unwrap();
        assert_eq!(once, again);
    }
}
