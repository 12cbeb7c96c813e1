use crate::models::{Zone, ZoneDeviation};
use crate::zones::{ZoneCalculator, ZonePosition};

/// Ticks a heart rate must stay out of zone before it is reported
pub const DEFAULT_DEBOUNCE_TICKS: u32 = 5;

/// Debounced in-zone/out-of-zone tracking.
///
/// At most one of the two counters is non-zero; both reset whenever the
/// heart rate changes side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZoneTracker {
    consecutive_low_secs: u32,
    consecutive_high_secs: u32,
    last_deviation: ZoneDeviation,
    debounce: u32,
}

impl Default for ZoneTracker {
    fn default() -> Self {
        Self::new(DEFAULT_DEBOUNCE_TICKS)
    }
}

impl ZoneTracker {
    pub fn new(debounce: u32) -> Self {
        Self {
            consecutive_low_secs: 0,
            consecutive_high_secs: 0,
            last_deviation: ZoneDeviation::InZone,
            debounce: debounce.max(1),
        }
    }

    /// Classify one tick's heart rate and report a change of deviation.
    ///
    /// An invalid max HR leaves the tracker untouched.
    pub fn check(&mut self, bpm: u16, target: Zone, max_hr: u16) -> Option<ZoneDeviation> {
        let position = ZoneCalculator::position(bpm, target, max_hr).ok()?;
        self.observe(position)
    }

    pub fn observe(&mut self, position: ZonePosition) -> Option<ZoneDeviation> {
        let held = match position {
            ZonePosition::Below => {
                self.consecutive_low_secs += 1;
                self.consecutive_high_secs = 0;
                self.consecutive_low_secs
            }
            ZonePosition::Above => {
                self.consecutive_high_secs += 1;
                self.consecutive_low_secs = 0;
                self.consecutive_high_secs
            }
            // Coming back into zone is reported straight away
            ZonePosition::Within => {
                self.consecutive_low_secs = 0;
                self.consecutive_high_secs = 0;
                self.debounce
            }
        };

        let deviation = position.as_deviation();
        if held >= self.debounce && self.last_deviation != deviation {
            self.last_deviation = deviation;
            return Some(deviation);
        }
        None
    }

    pub fn consecutive_low_secs(&self) -> u32 {
        self.consecutive_low_secs
    }

    pub fn consecutive_high_secs(&self) -> u32 {
        self.consecutive_high_secs
    }

    pub fn last_deviation(&self) -> ZoneDeviation {
        self.last_deviation
    }
}
