//! Run configuration
//!
//! Loaded from a JSON file; every field has a default so a partial file (or
//! none at all) is a valid configuration.

use calibration::CalibrationError;
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_RATE: f64 = 2000.0;
pub const DEFAULT_PHASE_SECS: f64 = 100.0;
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

/// Highest rate whose regular interval is still at least one nanosecond
pub const MAX_RATE: f64 = 1e9;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("phase {phase}: rate must be a finite value in (0, {max}], got {rate}")]
    InvalidRate { phase: u32, rate: f64, max: f64 },
    #[error("phase {phase}: duration must be a positive, representable number of seconds, got {secs}")]
    InvalidDuration { phase: u32, secs: f64 },
    #[error("queue capacity must be > 0")]
    InvalidCapacity,
    #[error("at least one worker is required")]
    NoWorkers,
    #[error("at least one phase is required")]
    NoPhases,
    #[error("transaction kinds must be > 0")]
    NoTransactionKinds,
    #[error("unknown log level {0:?}")]
    InvalidLogLevel(String),
    #[error("cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Calibration(#[from] CalibrationError),
}

/// Inter-arrival distribution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArrivalDistribution {
    /// Fixed interval of `1/rate`
    #[default]
    Regular,
    /// Exponential intervals with mean `1/rate`
    Poisson,
}

/// Which rate paces a phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateBasis {
    /// Each phase uses its own rate
    #[default]
    Fixed,
    /// Every phase paces at the lowest configured rate
    LowestOfPhases,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseConfig {
    /// Target transactions per second
    pub rate: f64,
    pub duration_secs: f64,
}

impl Default for PhaseConfig {
    fn default() -> Self {
        Self {
            rate: DEFAULT_RATE,
            duration_secs: DEFAULT_PHASE_SECS,
        }
    }
}

impl PhaseConfig {
    /// Phase length; `phase` only labels the error.
    pub fn duration(&self, phase: u32) -> Result<Duration, ConfigError> {
        phase_duration(phase, self.duration_secs)
    }
}

/// Simulated clock setup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockConfig {
    /// Rate the clock density is calibrated for; defaults to the first phase's rate
    pub target_tps: Option<f64>,
    pub warehouses: u32,
    /// Slide the analytical window along with new transactional data
    pub hybrid: bool,
    /// Directory holding the population anchors; `None` starts a fresh timeline
    pub anchor_dir: Option<PathBuf>,
    /// Write the clock anchors to this directory when the run ends
    pub write_anchors_to: Option<PathBuf>,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            target_tps: None,
            warehouses: 1,
            hybrid: false,
            anchor_dir: None,
            write_anchors_to: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub phases: Vec<PhaseConfig>,
    pub arrival: ArrivalDistribution,
    pub rate_basis: RateBasis,
    pub queue_capacity: usize,
    pub workers: usize,
    /// Simulated service time per request
    pub service_time_us: u64,
    /// Uniform jitter added on top of the service time
    pub service_jitter_us: u64,
    pub transaction_kinds: u32,
    /// Seed for arrival and service randomness; random when unset
    pub seed: Option<u64>,
    pub clock: ClockConfig,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
    /// Per-kind latency summary written as CSV after the run
    pub summary_csv: Option<PathBuf>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            phases: vec![PhaseConfig::default()],
            arrival: ArrivalDistribution::Regular,
            rate_basis: RateBasis::Fixed,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            workers: 1,
            service_time_us: 0,
            service_jitter_us: 0,
            transaction_kinds: 1,
            seed: None,
            clock: ClockConfig::default(),
            log_level: "info".to_string(),
            log_file: None,
            summary_csv: None,
        }
    }
}

impl RunConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(path, &text)
    }

    pub fn from_json(path: &Path, text: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Reject anything that would make the run meaningless.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.phases.is_empty() {
            return Err(ConfigError::NoPhases);
        }
        for (i, phase) in self.phases.iter().enumerate() {
            validate_phase(i as u32 + 1, phase.rate, phase.duration_secs)?;
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::InvalidCapacity);
        }
        if self.workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if self.transaction_kinds == 0 {
            return Err(ConfigError::NoTransactionKinds);
        }
        if let Some(tps) = self.clock.target_tps {
            calibration::DensityParameters::new(tps)?;
        }
        self.level_filter()?;
        Ok(())
    }

    pub fn level_filter(&self) -> Result<LevelFilter, ConfigError> {
        LevelFilter::from_str(&self.log_level)
            .map_err(|_| ConfigError::InvalidLogLevel(self.log_level.clone()))
    }

    /// Rate the simulated clock is calibrated for
    pub fn clock_rate(&self) -> f64 {
        self.clock
            .target_tps
            .or_else(|| self.phases.first().map(|p| p.rate))
            .unwrap_or(DEFAULT_RATE)
    }
}

fn validate_phase(phase: u32, rate: f64, duration_secs: f64) -> Result<(), ConfigError> {
    validate_rate(phase, rate)?;
    phase_duration(phase, duration_secs)?;
    Ok(())
}

pub(crate) fn validate_rate(phase: u32, rate: f64) -> Result<(), ConfigError> {
    if !rate.is_finite() || rate <= 0.0 || rate > MAX_RATE {
        return Err(ConfigError::InvalidRate {
            phase,
            rate,
            max: MAX_RATE,
        });
    }
    Ok(())
}

fn phase_duration(phase: u32, secs: f64) -> Result<Duration, ConfigError> {
    match Duration::try_from_secs_f64(secs) {
        Ok(duration) if !duration.is_zero() => Ok(duration),
        _ => Err(ConfigError::InvalidDuration { phase, secs }),
    }
}
