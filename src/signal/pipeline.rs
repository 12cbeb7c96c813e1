use tracing::{debug, trace};

use super::{hrv, parse, FilterConfig, KalmanFilter};
use crate::models::FilteredMeasurement;

/// Counters for frames that went through the pipeline
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub frames: u64,
    pub accepted: u64,
    pub parse_failures: u64,
    pub rejected: u64,
}

/// Turns raw sensor frames into filtered measurements.
///
/// One pipeline belongs to one link; a new connection starts a fresh filter.
#[derive(Debug, Clone)]
pub struct SignalPipeline {
    filter: KalmanFilter,
    stats: PipelineStats,
}

impl Default for SignalPipeline {
    fn default() -> Self {
        Self::new(&FilterConfig::default())
    }
}

impl SignalPipeline {
    pub fn new(config: &FilterConfig) -> Self {
        Self {
            filter: KalmanFilter::from_config(config),
            stats: PipelineStats::default(),
        }
    }

    /// Parse, validate and smooth one frame.
    ///
    /// Malformed frames and implausible heart rates are counted and dropped.
    pub fn process(&mut self, bytes: &[u8]) -> Option<FilteredMeasurement> {
        self.stats.frames += 1;

        let raw = match parse(bytes) {
            Ok(raw) => raw,
            Err(e) => {
                self.stats.parse_failures += 1;
                debug!(error = %e, len = bytes.len(), "Dropping malformed frame");
                return None;
            }
        };

        let Some(filtered_bpm) = self.filter.filter_if_valid(raw.bpm) else {
            self.stats.rejected += 1;
            debug!(bpm = raw.bpm, "Rejecting implausible heart rate");
            return None;
        };
        let confidence = self.filter.confidence();
        let rmssd_ms = hrv::rmssd(&raw.rr_intervals);
        self.stats.accepted += 1;

        trace!(
            "HR filter: raw={} -> filtered={:.1} (confidence={:.2})",
            raw.bpm,
            filtered_bpm,
            confidence
        );

        Some(FilteredMeasurement {
            raw_bpm: raw.bpm,
            filtered_bpm,
            confidence: Some(confidence),
            rmssd_ms,
            timestamp: raw.timestamp,
        })
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    pub fn filter(&self) -> &KalmanFilter {
        &self.filter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_valid_frame() {
        let mut pipeline = SignalPipeline::default();
        let m = pipeline.process(&[0x00, 0x58]).unwrap();
        assert_eq!(m.raw_bpm, 88);
        assert!(m.filtered_bpm > 70.0 && m.filtered_bpm < 88.0);
        assert!(m.confidence.unwrap() > 0.0);
        assert_eq!(m.rmssd_ms, None);
        assert_eq!(pipeline.stats().accepted, 1);
    }

    #[test]
    fn test_process_absorbs_failures() {
        let mut pipeline = SignalPipeline::default();
        assert!(pipeline.process(&[]).is_none());
        assert!(pipeline.process(&[0x01, 0x50]).is_none());
        // 250 bpm is an artifact
        assert!(pipeline.process(&[0x00, 0xFA]).is_none());

        let stats = pipeline.stats();
        assert_eq!(stats.frames, 3);
        assert_eq!(stats.parse_failures, 2);
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.accepted, 0);
        assert_eq!(pipeline.filter(), &KalmanFilter::default());
    }

    #[test]
    fn test_process_computes_rmssd() {
        let mut pipeline = SignalPipeline::default();
        let m = pipeline
            .process(&[0x10, 0x48, 0x00, 0x04, 0x00, 0x02, 0x00, 0x04])
            .unwrap();
        let rmssd = m.rmssd_ms.unwrap();
        assert!((rmssd - 500.0).abs() < 1e-9);
    }

    #[test]
    fn test_confidence_grows_with_samples() {
        let mut pipeline = SignalPipeline::default();
        let first = pipeline.process(&[0x00, 120]).unwrap().confidence.unwrap();
        let mut last = first;
        for _ in 0..10 {
            last = pipeline.process(&[0x00, 120]).unwrap().confidence.unwrap();
        }
        assert!(last > first);
    }
}
