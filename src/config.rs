use std::fmt::Display;
use std::str::FromStr;

use crate::audio::BitDepth;
use crate::controller::ControllerOptions;
use crate::error::ConfigError;
use crate::zaxis::DripSettings;

/// Where the controller gets its height feedback from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DripperType {
    /// Microphone with the fixed threshold and hold detector.
    Audio,
    /// Microphone with the adaptive threshold detector.
    AudioAdaptive,
    /// Timer-driven drips at a set rate.
    Emulated,
    /// No z-axis: every layer is printed unpaced.
    None,
}

impl FromStr for DripperType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "audio" => Ok(DripperType::Audio),
            "audio-adaptive" => Ok(DripperType::AudioAdaptive),
            "emulated" => Ok(DripperType::Emulated),
            "none" => Ok(DripperType::None),
            other => Err(ConfigError::UnknownDripperType(other.to_string())),
        }
    }
}

/// Configuration for the drip printer loaded from environment variables.
///
/// Every field has a default so the binary runs a dry calibration print with
/// no environment at all.
#[derive(Debug, Clone)]
pub struct Config {
    /// Height feedback source.
    /// Environment variable: `DRIPPER_TYPE`
    pub dripper_type: DripperType,

    /// Calibration ratio between drips and millimetres of resin.
    /// Environment variable: `DRIPS_PER_MM`
    pub drips_per_mm: f64,

    /// Height the print starts from.
    /// Environment variable: `INITIAL_HEIGHT_MM`
    pub initial_height_mm: f64,

    /// Microphone capture rate in Hz.
    /// Environment variable: `SAMPLE_RATE`
    pub sample_rate: u32,

    /// Microphone capture depth, e.g. "16 bit".
    /// Environment variable: `BIT_DEPTH`
    pub bit_depth: BitDepth,

    /// Trigger level of the threshold detector as a fraction of full scale.
    /// Environment variable: `THRESHOLD_PERCENT`
    pub threshold_percent: f64,

    /// Hold time of the threshold detector.
    /// Environment variable: `RELEASE_MS`
    pub release_ms: u32,

    /// Reporting cadence of the adaptive detector.
    /// Environment variable: `CALLBACKS_PER_SECOND`
    pub callbacks_per_second: u32,

    /// Drip rate of the emulated dripper.
    /// Environment variable: `EMULATED_DRIPS_PER_SECOND`
    pub emulated_drips_per_second: f64,

    /// How far ahead of a layer the measured height may be before the layer
    /// is skipped. Unbounded when unset.
    /// Environment variable: `MAX_LEAD_DISTANCE_MM`
    pub max_lead_distance_mm: f64,

    /// Speed limit for every motion. Unlimited when unset.
    /// Environment variable: `MAX_SPEED`
    pub max_speed: Option<f64>,

    /// Stop the print on the first layer fault.
    /// Environment variable: `ABORT_ON_ERROR`
    pub abort_on_error: bool,

    /// Number of layers in the calibration print.
    /// Environment variable: `CALIBRATION_LAYERS`
    pub calibration_layers: usize,

    /// Height step between calibration layers.
    /// Environment variable: `LAYER_HEIGHT_MM`
    pub layer_height_mm: f64,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set but cannot be parsed, or is out
    /// of range. See [`Config`] for the variable names.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from any key/value lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let config = Config {
            dripper_type: parse(&lookup, "DRIPPER_TYPE", "emulated")?,
            drips_per_mm: parse(&lookup, "DRIPS_PER_MM", "100.0")?,
            initial_height_mm: parse(&lookup, "INITIAL_HEIGHT_MM", "0.0")?,
            sample_rate: parse(&lookup, "SAMPLE_RATE", "44100")?,
            bit_depth: parse(&lookup, "BIT_DEPTH", "16 bit")?,
            threshold_percent: parse(&lookup, "THRESHOLD_PERCENT", "0.5")?,
            release_ms: parse(&lookup, "RELEASE_MS", "6")?,
            callbacks_per_second: parse(&lookup, "CALLBACKS_PER_SECOND", "15")?,
            emulated_drips_per_second: parse(&lookup, "EMULATED_DRIPS_PER_SECOND", "10.0")?,
            max_lead_distance_mm: parse_optional(&lookup, "MAX_LEAD_DISTANCE_MM")?
                .unwrap_or(f64::MAX),
            max_speed: parse_optional(&lookup, "MAX_SPEED")?,
            abort_on_error: parse(&lookup, "ABORT_ON_ERROR", "true")?,
            calibration_layers: parse(&lookup, "CALIBRATION_LAYERS", "40")?,
            layer_height_mm: parse(&lookup, "LAYER_HEIGHT_MM", "0.1")?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        require_positive("DRIPS_PER_MM", self.drips_per_mm)?;
        require_non_negative("EMULATED_DRIPS_PER_SECOND", self.emulated_drips_per_second)?;
        require_non_negative("INITIAL_HEIGHT_MM", self.initial_height_mm)?;
        require_non_negative("LAYER_HEIGHT_MM", self.layer_height_mm)?;
        require_non_negative("MAX_LEAD_DISTANCE_MM", self.max_lead_distance_mm)?;
        if let Some(max_speed) = self.max_speed {
            require_positive("MAX_SPEED", max_speed)?;
        }
        if self.sample_rate == 0 {
            return Err(ConfigError::invalid("SAMPLE_RATE", "0", "must be greater than zero"));
        }
        if !(0.0..=1.0).contains(&self.threshold_percent) {
            return Err(ConfigError::invalid(
                "THRESHOLD_PERCENT",
                &self.threshold_percent.to_string(),
                "must be between 0.0 and 1.0",
            ));
        }
        Ok(())
    }

    pub fn controller_options(&self) -> ControllerOptions {
        ControllerOptions {
            max_lead_distance: self.max_lead_distance_mm,
            abort_on_error: self.abort_on_error,
            max_speed: self.max_speed,
        }
    }

    pub fn drip_settings(&self) -> DripSettings {
        DripSettings {
            drips_per_mm: self.drips_per_mm,
            initial_height_mm: self.initial_height_mm,
        }
    }
}

fn require_positive(field: &str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::invalid(
            field,
            &value.to_string(),
            "must be a finite number greater than zero",
        ))
    }
}

fn require_non_negative(field: &str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(ConfigError::invalid(
            field,
            &value.to_string(),
            "must be a finite number of zero or more",
        ))
    }
}

fn parse<T, F>(lookup: &F, key: &str, default: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    let value = lookup(key).unwrap_or_else(|| default.to_string());
    value
        .parse::<T>()
        .map_err(|e| ConfigError::invalid(key, &value, e))
}

fn parse_optional<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(value) if !value.trim().is_empty() => value
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::invalid(key, &value, e)),
        _ => Ok(None),
    }
}

/// Application constants used throughout the system.
pub mod constants {
    /// Every this many layers the controller waits for the measured height
    /// to reach the layer before drawing it.
    pub const BATCH_LAYERS: u64 = 8;

    /// Position the machine is parked at when the layer source changes.
    pub const PARKED_POSITION: [f64; 3] = [0.0, 0.0, 1.0];

    /// Speed the machine is parked with when the layer source changes.
    pub const PARKED_SPEED: f64 = 100.0;

    /// Sleep between height checks while waiting for drips.
    pub const WAIT_POLL_INTERVAL_MS: u64 = 10;

    /// Cure speed of the calibration pattern.
    pub const CALIBRATION_SPEED: f64 = 10.0;

    /// Interval between status lines logged by the binary.
    pub const STATUS_LOG_INTERVAL_SECONDS: u64 = 2;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_without_environment() {
        let config = from_pairs(&[]).unwrap();
        assert_eq!(config.dripper_type, DripperType::Emulated);
        assert_eq!(config.sample_rate, 44_100);
        assert_eq!(config.bit_depth, BitDepth::Int16);
        assert_eq!(config.max_lead_distance_mm, f64::MAX);
        assert!(config.max_speed.is_none());
        assert!(config.abort_on_error);
    }

    #[test]
    fn reads_overrides() {
        let config = from_pairs(&[
            ("DRIPPER_TYPE", "audio-adaptive"),
            ("BIT_DEPTH", "24 bit"),
            ("MAX_LEAD_DISTANCE_MM", "0.5"),
            ("MAX_SPEED", "250"),
            ("ABORT_ON_ERROR", "false"),
        ])
        .unwrap();
        assert_eq!(config.dripper_type, DripperType::AudioAdaptive);
        assert_eq!(config.bit_depth, BitDepth::Int24);

        let options = config.controller_options();
        assert_eq!(options.max_lead_distance, 0.5);
        assert_eq!(options.max_speed, Some(250.0));
        assert!(!options.abort_on_error);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(
            from_pairs(&[("BIT_DEPTH", "12 bit")]),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            from_pairs(&[("DRIPPER_TYPE", "photo")]),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            from_pairs(&[("DRIPS_PER_MM", "0")]),
            Err(ConfigError::InvalidValue { field, .. }) if field == "DRIPS_PER_MM"
        ));
        assert!(from_pairs(&[("SAMPLE_RATE", "fast")]).is_err());
    }

    #[test]
    fn rejects_non_finite_and_negative_numbers() {
        let cases = [
            ("DRIPS_PER_MM", "NaN"),
            ("DRIPS_PER_MM", "inf"),
            ("EMULATED_DRIPS_PER_SECOND", "NaN"),
            ("EMULATED_DRIPS_PER_SECOND", "inf"),
            ("EMULATED_DRIPS_PER_SECOND", "-1"),
            ("INITIAL_HEIGHT_MM", "NaN"),
            ("INITIAL_HEIGHT_MM", "-0.5"),
            ("LAYER_HEIGHT_MM", "inf"),
            ("LAYER_HEIGHT_MM", "-0.1"),
            ("MAX_LEAD_DISTANCE_MM", "NaN"),
            ("MAX_LEAD_DISTANCE_MM", "-1"),
            ("MAX_SPEED", "inf"),
            ("MAX_SPEED", "0"),
            ("THRESHOLD_PERCENT", "NaN"),
        ];
        for (key, value) in cases {
            match from_pairs(&[(key, value)]) {
                Err(ConfigError::InvalidValue { field, .. }) => assert_eq!(field, key),
                other => panic!("{}={} accepted: {:?}", key, value, other),
            }
        }

        let config = from_pairs(&[("EMULATED_DRIPS_PER_SECOND", "0"), ("LAYER_HEIGHT_MM", "0")]).unwrap();
        assert_eq!(config.emulated_drips_per_second, 0.0);
    }
}
