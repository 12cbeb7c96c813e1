//! Sensor frame decoding, artifact rejection and smoothing

pub mod filter;
pub mod hrv;
pub mod parse;
pub mod pipeline;

pub use filter::{FilterConfig, KalmanFilter};
pub use hrv::rmssd;
pub use parse::{parse, rr_to_ms};
pub use pipeline::{PipelineStats, SignalPipeline};

/// Lowest physiologically plausible heart rate
pub const MIN_VALID_BPM: u16 = 30;

/// Highest physiologically plausible heart rate
pub const MAX_VALID_BPM: u16 = 220;

/// True for heart rates a sensor can genuinely report
pub fn is_valid(bpm: u16) -> bool {
    (MIN_VALID_BPM..=MAX_VALID_BPM).contains(&bpm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_valid_range_edges() {
        assert!(!is_valid(29));
        assert!(is_valid(30));
        assert!(is_valid(220));
        assert!(!is_valid(221));
    }

    proptest! {
        #[test]
        fn out_of_range_is_invalid(bpm in prop_oneof![0u16..30, 221u16..=u16::MAX]) {
            prop_assert!(!is_valid(bpm));
        }
    }
}
