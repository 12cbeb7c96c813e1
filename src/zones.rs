use crate::models::{Zone, ZoneDeviation};
use std::cmp::Ordering;

/// Lowest accepted maximum heart rate for zone calculation
pub const MIN_MAX_HR: u16 = 100;

/// Highest accepted maximum heart rate for zone calculation
pub const MAX_MAX_HR: u16 = 220;

/// Errors that can occur during zone calculations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ZoneError {
    #[error("Invalid threshold value: {0}")]
    InvalidThreshold(String),
}

/// Where a heart rate sits relative to a target zone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZonePosition {
    Below,
    Within,
    Above,
}

impl ZonePosition {
    pub fn as_deviation(&self) -> ZoneDeviation {
        match self {
            ZonePosition::Below => ZoneDeviation::TooLow,
            ZonePosition::Within => ZoneDeviation::InZone,
            ZonePosition::Above => ZoneDeviation::TooHigh,
        }
    }
}

/// Zone calculation utilities based on percentage of maximum heart rate
///
/// - Z1: 50-60% MaxHR (Recovery)
/// - Z2: 60-70% MaxHR (Endurance)
/// - Z3: 70-80% MaxHR (Aerobic)
/// - Z4: 80-90% MaxHR (Threshold)
/// - Z5: 90%+ MaxHR (Maximum)
pub struct ZoneCalculator;

impl ZoneCalculator {
    /// Zone for a heart rate, `None` below 50% of max HR
    pub fn zone_for(bpm: u16, max_hr: u16) -> Result<Option<Zone>, ZoneError> {
        Self::validate_max_hr(max_hr)?;

        // Integer percentages keep the boundaries exact
        let scaled = bpm as u32 * 100;
        let below = |pct: u32| scaled < max_hr as u32 * pct;

        Ok(if below(50) {
            None
        } else if below(60) {
            Some(Zone::Zone1)
        } else if below(70) {
            Some(Zone::Zone2)
        } else if below(80) {
            Some(Zone::Zone3)
        } else if below(90) {
            Some(Zone::Zone4)
        } else {
            Some(Zone::Zone5)
        })
    }

    /// Compare a heart rate against a target zone.
    ///
    /// Anything under 50% of max HR counts as below every zone.
    pub fn position(bpm: u16, target: Zone, max_hr: u16) -> Result<ZonePosition, ZoneError> {
        let position = match Self::zone_for(bpm, max_hr)? {
            None => ZonePosition::Below,
            Some(current) => match current.cmp(&target) {
                Ordering::Less => ZonePosition::Below,
                Ordering::Equal => ZonePosition::Within,
                Ordering::Greater => ZonePosition::Above,
            },
        };
        Ok(position)
    }

    /// Inclusive BPM range covered by a zone
    pub fn bounds(zone: Zone, max_hr: u16) -> Result<(u16, u16), ZoneError> {
        Self::validate_max_hr(max_hr)?;

        let (low_pct, high_pct) = match zone {
            Zone::Zone1 => (50, 60),
            Zone::Zone2 => (60, 70),
            Zone::Zone3 => (70, 80),
            Zone::Zone4 => (80, 90),
            Zone::Zone5 => (90, 100),
        };

        let low = Self::percentage_ceil(max_hr, low_pct);
        let high = if zone == Zone::Zone5 {
            max_hr
        } else {
            Self::percentage_ceil(max_hr, high_pct) - 1
        };
        Ok((low, high))
    }

    /// Estimate max heart rate from age (220 - age formula)
    pub fn estimate_max_hr_from_age(age: u8) -> Result<u16, ZoneError> {
        if !(10..=100).contains(&age) {
            return Err(ZoneError::InvalidThreshold(format!(
                "Age must be between 10 and 100, got {}",
                age
            )));
        }
        Ok(220u16.saturating_sub(age as u16))
    }

    pub fn validate_max_hr(max_hr: u16) -> Result<(), ZoneError> {
        if !(MIN_MAX_HR..=MAX_MAX_HR).contains(&max_hr) {
            return Err(ZoneError::InvalidThreshold(format!(
                "Max HR must be between {} and {} bpm, got {}",
                MIN_MAX_HR, MAX_MAX_HR, max_hr
            )));
        }
        Ok(())
    }

    // Smallest bpm whose percentage of max_hr is at least pct
    fn percentage_ceil(max_hr: u16, pct: u32) -> u16 {
        ((max_hr as u32 * pct + 99) / 100) as u16
    }
}
