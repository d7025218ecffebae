//! Run parameters and tracker tuning.
//!
//! [`RunParameters`] come from the command line and are fixed for a run.
//! [`TrackerConfig`] holds the algorithm constants; it defaults to the
//! reference configuration and can be overridden from a TOML file:
//!
//! ```toml
//! d_angle_max = 20.0
//! status_policy = "abort"
//!
//! [simulator]
//! latency_seconds = 0.02
//!
//! [simulator.diode]
//! photocurrent = 0.0055
//! ```

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::device::Terminals;
use crate::diode::DiodeParameters;
use crate::measurement::Polarity;

/// Keithley 2400 status bits treated as faults by default:
/// measurement overflow (bit 0), compliance (bit 3) and over-voltage (bit 4).
pub const DEFAULT_FAULT_MASK: u32 = 0x0001 | 0x0008 | 0x0010;

/// Errors loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Total run duration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TimeBudget {
    Unbounded,
    Limited(f64),
}

impl TimeBudget {
    /// Zero (or less) means run forever.
    pub fn from_seconds(seconds: f64) -> Self {
        if seconds > 0.0 {
            TimeBudget::Limited(seconds)
        } else {
            TimeBudget::Unbounded
        }
    }

    /// True once `elapsed` run seconds are past the budget.
    pub fn is_exhausted(&self, elapsed: f64) -> bool {
        match self {
            TimeBudget::Unbounded => false,
            TimeBudget::Limited(total) => elapsed > *total,
        }
    }
}

impl fmt::Display for TimeBudget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeBudget::Unbounded => write!(f, "forever"),
            TimeBudget::Limited(total) => write!(f, "for {total} seconds"),
        }
    }
}

/// What to do when a reading's status word matches the fault mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StatusPolicy {
    Ignore,
    #[default]
    Log,
    Abort,
}

/// How the exploration angle metric is normalized each cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum AngleNormalization {
    /// Use Voc/Isc from the initial sweep for the whole run.
    #[default]
    Frozen,
    /// Scale Isc by the drift of the dwell current relative to the first dwell.
    Rescaled,
}

/// Parameters fixed for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunParameters {
    pub dwell: Duration,
    pub budget: TimeBudget,
    pub polarity: Polarity,
    pub terminals: Terminals,
}

impl RunParameters {
    pub fn new(
        dwell_seconds: f64,
        total_seconds: f64,
        reverse_polarity: bool,
        rear_terminals: bool,
    ) -> Result<Self, ConfigError> {
        let dwell = Duration::try_from_secs_f64(dwell_seconds).map_err(|_| {
            ConfigError::Invalid(format!(
                "dwell time must be a non-negative number of seconds, got {dwell_seconds}"
            ))
        })?;
        if !total_seconds.is_finite() || total_seconds < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "total time must be a non-negative number of seconds, got {total_seconds}"
            )));
        }
        Ok(Self {
            dwell,
            budget: TimeBudget::from_seconds(total_seconds),
            polarity: Polarity::from_reversed(reverse_polarity),
            terminals: Terminals::from_rear(rear_terminals),
        })
    }
}

/// Simulated instrument settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimulatorConfig {
    /// Time one reading takes (s).
    pub latency_seconds: f64,
    pub diode: DiodeParameters,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            latency_seconds: 0.01,
            diode: DiodeParameters::default(),
        }
    }
}

impl SimulatorConfig {
    pub fn latency(&self) -> Duration {
        Duration::try_from_secs_f64(self.latency_seconds).unwrap_or(Duration::MAX)
    }
}

/// Tracker constants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrackerConfig {
    /// Half-width of the exploration window as an angle deviation (degrees).
    pub d_angle_max: f64,
    /// Light-soak wait before the open-circuit reading (s).
    pub settle_seconds: f64,
    /// Points in the initial sweep.
    pub sweep_points: usize,
    /// Current compliance during the sweep and tracking (A).
    pub max_current: f64,
    /// Voltage compliance during the open-circuit reading (V).
    pub open_circuit_compliance: f64,
    /// Source delay between sweep points (s).
    pub step_delay: f64,
    pub status_policy: StatusPolicy,
    pub fault_mask: u32,
    pub normalization: AngleNormalization,
    pub simulator: SimulatorConfig,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            d_angle_max: 25.0,
            settle_seconds: 10.0,
            sweep_points: 1001,
            max_current: 0.01,
            open_circuit_compliance: 10.0,
            step_delay: 0.0,
            status_policy: StatusPolicy::default(),
            fault_mask: DEFAULT_FAULT_MASK,
            normalization: AngleNormalization::default(),
            simulator: SimulatorConfig::default(),
        }
    }
}

impl TrackerConfig {
    /// Load from a TOML file; missing keys keep their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&content)?;
        tracing::info!(path = %path.display(), "Loaded tracker configuration");
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: TrackerConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.d_angle_max > 0.0 && self.d_angle_max < 90.0) {
            return Err(ConfigError::Invalid(format!(
                "d_angle_max must lie in (0, 90) degrees, got {}",
                self.d_angle_max
            )));
        }
        if self.sweep_points < 2 {
            return Err(ConfigError::Invalid(format!(
                "sweep_points must be at least 2, got {}",
                self.sweep_points
            )));
        }
        let non_negative = [
            ("settle_seconds", self.settle_seconds),
            ("step_delay", self.step_delay),
            ("simulator.latency_seconds", self.simulator.latency_seconds),
        ];
        for (name, value) in non_negative {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be a non-negative number, got {value}"
                )));
            }
        }
        let durations = [
            ("settle_seconds", self.settle_seconds),
            ("simulator.latency_seconds", self.simulator.latency_seconds),
        ];
        for (name, value) in durations {
            if Duration::try_from_secs_f64(value).is_err() {
                return Err(ConfigError::Invalid(format!(
                    "{name} is too large for a duration, got {value}"
                )));
            }
        }
        let positive = [
            ("max_current", self.max_current),
            ("open_circuit_compliance", self.open_circuit_compliance),
        ];
        for (name, value) in positive {
            if !value.is_finite() || value <= 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be positive, got {value}"
                )));
            }
        }
        Ok(())
    }

    /// Saturates at [`Duration::MAX`] on a config that skipped validation.
    pub fn settle_time(&self) -> Duration {
        Duration::try_from_secs_f64(self.settle_seconds).unwrap_or(Duration::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_zero_total_means_unbounded() {
        assert_eq!(TimeBudget::from_seconds(0.0), TimeBudget::Unbounded);
        assert!(!TimeBudget::Unbounded.is_exhausted(1e12));
        let budget = TimeBudget::from_seconds(60.0);
        assert!(!budget.is_exhausted(60.0));
        assert!(budget.is_exhausted(60.001));
        assert_eq!(budget.to_string(), "for 60 seconds");
    }

    #[test]
    fn test_run_parameters_from_flags() {
        let params = RunParameters::new(5.0, 0.0, true, true).unwrap();
        assert_eq!(params.dwell, Duration::from_secs(5));
        assert_eq!(params.budget, TimeBudget::Unbounded);
        assert_eq!(params.polarity, Polarity::Reversed);
        assert_eq!(params.terminals, Terminals::Rear);
        assert!(RunParameters::new(-1.0, 10.0, false, false).is_err());
        assert!(RunParameters::new(1.0, f64::NAN, false, false).is_err());
    }

    #[test]
    fn test_oversized_times_are_rejected() {
        assert!(matches!(
            RunParameters::new(1e20, 10.0, false, false),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            TrackerConfig::from_toml_str("settle_seconds = 1e30"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            TrackerConfig::from_toml_str("[simulator]\nlatency_seconds = 1e30"),
            Err(ConfigError::Invalid(_))
        ));

        let unchecked = TrackerConfig {
            settle_seconds: 1e30,
            ..TrackerConfig::default()
        };
        assert_eq!(unchecked.settle_time(), Duration::MAX);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = TrackerConfig::from_toml_str(
            r#"
            d_angle_max = 20.0
            status_policy = "abort"
            normalization = "rescaled"

            [simulator.diode]
            photocurrent = 0.0055
            "#,
        )
        .unwrap();
        assert_eq!(config.d_angle_max, 20.0);
        assert_eq!(config.status_policy, StatusPolicy::Abort);
        assert_eq!(config.normalization, AngleNormalization::Rescaled);
        assert_eq!(config.sweep_points, 1001);
        assert_eq!(config.simulator.diode.photocurrent, 0.0055);
        assert_eq!(config.simulator.diode.series_resistance, 9.28);
    }

    #[test]
    fn test_rejects_unknown_and_invalid_keys() {
        assert!(matches!(
            TrackerConfig::from_toml_str("d_angel_max = 20.0"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            TrackerConfig::from_toml_str("d_angle_max = 95.0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            TrackerConfig::from_toml_str("sweep_points = 1"),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "settle_seconds = 2.5").unwrap();
        let config = TrackerConfig::load(file.path()).unwrap();
        assert_eq!(config.settle_time(), Duration::from_millis(2500));

        let missing = TrackerConfig::load(Path::new("/nonexistent/mpp.toml"));
        assert!(matches!(missing, Err(ConfigError::Io { .. })));
    }
}
