//! Density Calibration
//!
//! Maps a target transaction rate to the logical clock step used while
//! populating and running the benchmark, so the timestamp density of the
//! loaded data matches what the transactional mix produces at that rate.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod anchor;
pub mod clock;

pub use anchor::{AnchorError, AnchorStore, Anchors, FileAnchorStore};
pub use clock::{ClockMode, ReferenceRange, SimulatedClock};

/// Density slope, fitted against the standard transaction mix with think time
pub const DENSITY_SLOPE: f64 = 1.26956;

/// Density intercept for the same fit
pub const DENSITY_INTERCEPT: f64 = 0.0103497;

/// Calibration failure
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CalibrationError {
    #[error("target rate must be a finite value > 0, got {0}")]
    InvalidRate(f64),
    #[error("density model yields non-positive density {density} for rate {rate}")]
    NonPositiveDensity { rate: f64, density: f64 },
    #[error("reference range is empty: start {start_ms} >= end {end_ms}")]
    EmptyReferenceRange { start_ms: i64, end_ms: i64 },
}

/// Linear density model: `density = slope * rate + intercept`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DensityModel {
    pub slope: f64,
    pub intercept: f64,
}

impl DensityModel {
    pub fn new(slope: f64, intercept: f64) -> Self {
        Self { slope, intercept }
    }

    /// Compute density and clock step for `target_rate` (transactions/s).
    pub fn calibrate(&self, target_rate: f64) -> Result<DensityParameters, CalibrationError> {
        if !target_rate.is_finite() || target_rate <= 0.0 {
            return Err(CalibrationError::InvalidRate(target_rate));
        }

        let density = self.slope * target_rate + self.intercept;
        if !density.is_finite() || density <= 0.0 {
            return Err(CalibrationError::NonPositiveDensity {
                rate: target_rate,
                density,
            });
        }

        let delta_ts = (1000.0 / density).round() as i64;
        if delta_ts == 0 {
            log::warn!(
                "rate {} gives density {:.3}; clock step rounds to 0 ms and the logical clock will not advance",
                target_rate,
                density
            );
        }

        Ok(DensityParameters {
            target_rate,
            density,
            delta_ts,
        })
    }
}

impl Default for DensityModel {
    fn default() -> Self {
        Self::new(DENSITY_SLOPE, DENSITY_INTERCEPT)
    }
}

/// Calibrated parameters for one target rate.
///
/// Fields are read-only; a rate change means calibrating again, which yields
/// a fresh value instead of mutating a step somebody already holds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DensityParameters {
    target_rate: f64,
    density: f64,
    delta_ts: i64,
}

impl DensityParameters {
    /// Calibrate with the reference density model.
    pub fn new(target_rate: f64) -> Result<Self, CalibrationError> {
        DensityModel::default().calibrate(target_rate)
    }

    pub fn target_rate(&self) -> f64 {
        self.target_rate
    }

    /// Transactions per logical tick
    pub fn density(&self) -> f64 {
        self.density
    }

    /// Milliseconds the logical clock advances per tick
    pub fn delta_ts(&self) -> i64 {
        self.delta_ts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_rate_128() {
        let params = DensityParameters::new(128.0).unwrap();
        let expected_density = 1.26956 * 128.0 + 0.0103497;

        assert_eq!(params.density(), expected_density);
        assert_eq!(params.delta_ts(), (1000.0 / expected_density).round() as i64);
        assert_eq!(params.delta_ts(), 6);
    }

    #[test]
    fn test_rounding_not_truncation() {
        // 1000 / (1.26956 * 20 + 0.0103497) = 39.37...
        assert_eq!(DensityParameters::new(20.0).unwrap().delta_ts(), 39);
        let model = DensityModel::new(1.0, 0.0);
        // 1000 / 1.5 = 666.67 rounds up
        assert_eq!(model.calibrate(1.5).unwrap().delta_ts(), 667);
    }

    #[test]
    fn test_invalid_rate_rejected() {
        assert_eq!(
            DensityParameters::new(0.0),
            Err(CalibrationError::InvalidRate(0.0))
        );
        assert!(DensityParameters::new(-5.0).is_err());
        assert!(DensityParameters::new(f64::NAN).is_err());
        assert!(DensityParameters::new(f64::INFINITY).is_err());
    }

    #[test]
    fn test_custom_model_non_positive_density() {
        let model = DensityModel::new(-1.0, 0.0);
        assert!(matches!(
            model.calibrate(10.0),
            Err(CalibrationError::NonPositiveDensity { .. })
        ));
    }

    #[test]
    fn test_recalibration_yields_new_step() {
        let slow = DensityParameters::new(10.0).unwrap();
        let fast = DensityParameters::new(100.0).unwrap();
        assert!(fast.delta_ts() < slow.delta_ts());
        assert_eq!(slow.target_rate(), 10.0);
    }
}
