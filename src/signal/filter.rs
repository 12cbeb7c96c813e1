use serde::{Deserialize, Serialize};

use super::is_valid;

/// Starting estimate before the first measurement, a typical resting rate
const INITIAL_ESTIMATE: f64 = 70.0;

/// Starting error covariance, large so the first readings dominate
const INITIAL_VARIANCE: f64 = 10.0;

/// Noise parameters for the heart rate filter
///
/// The defaults were tuned for a single chest strap; other sensors may need
/// recalibration, so both values are read from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Variance added to the estimate on every prediction step
    pub process_noise: f64,

    /// Expected variance of a single sensor reading
    pub measurement_noise: f64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            process_noise: 0.1,
            measurement_noise: 2.0,
        }
    }
}

impl FilterConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !(self.process_noise.is_finite() && self.process_noise > 0.0) {
            return Err(format!(
                "process_noise must be positive, got {}",
                self.process_noise
            ));
        }
        if !(self.measurement_noise.is_finite() && self.measurement_noise > 0.0) {
            return Err(format!(
                "measurement_noise must be positive, got {}",
                self.measurement_noise
            ));
        }
        Ok(())
    }
}

/// Single-state recursive estimator for heart rate
#[derive(Debug, Clone, PartialEq)]
pub struct KalmanFilter {
    process_noise: f64,
    measurement_noise: f64,
    estimate: f64,
    variance: f64,
}

impl Default for KalmanFilter {
    fn default() -> Self {
        Self::from_config(&FilterConfig::default())
    }
}

impl KalmanFilter {
    pub fn new(process_noise: f64, measurement_noise: f64) -> Self {
        Self {
            process_noise,
            measurement_noise,
            estimate: INITIAL_ESTIMATE,
            variance: INITIAL_VARIANCE,
        }
    }

    pub fn from_config(config: &FilterConfig) -> Self {
        Self::new(config.process_noise, config.measurement_noise)
    }

    /// Fold one measurement into the estimate and return the new estimate
    pub fn update(&mut self, measurement: f64) -> f64 {
        // Predict
        self.variance += self.process_noise;

        // Correct
        let gain = self.variance / (self.variance + self.measurement_noise);
        self.estimate += gain * (measurement - self.estimate);
        self.variance *= 1.0 - gain;

        self.estimate
    }

    /// Update only for physiologically plausible values.
    ///
    /// Rejected values leave the filter untouched and return `None`.
    pub fn filter_if_valid(&mut self, bpm: u16) -> Option<f64> {
        if !is_valid(bpm) {
            return None;
        }
        Some(self.update(bpm as f64))
    }

    pub fn estimate(&self) -> f64 {
        self.estimate
    }

    pub fn variance(&self) -> f64 {
        self.variance
    }

    /// How settled the estimate is, in [0, 1]
    pub fn confidence(&self) -> f64 {
        1.0 - self.variance / (self.variance + self.measurement_noise)
    }
}
