use chrono::Utc;

use crate::models::SessionSummary;
use crate::zones::ZoneCalculator;

/// Running statistics for the session in progress
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SummaryBuilder {
    bpm_sum: u64,
    bpm_count: u64,
    max_bpm: Option<u16>,
    time_in_zone: [u32; 5],
    time_below_zones: u32,
    total_elapsed_secs: u32,
    phases_completed: u32,
}

impl SummaryBuilder {
    /// Resume statistics from checkpointed progress
    pub fn resumed(total_elapsed_secs: u32, phases_completed: u32) -> Self {
        Self {
            total_elapsed_secs,
            phases_completed,
            ..Self::default()
        }
    }

    pub fn record_bpm(&mut self, bpm: u16) {
        self.bpm_sum += bpm as u64;
        self.bpm_count += 1;
        self.max_bpm = Some(self.max_bpm.map_or(bpm, |max| max.max(bpm)));
    }

    /// Account one second of progress at the current heart rate
    pub fn record_tick(&mut self, current_bpm: Option<u16>, max_hr: u16) {
        self.total_elapsed_secs += 1;

        if let Some(bpm) = current_bpm {
            match ZoneCalculator::zone_for(bpm, max_hr) {
                Ok(Some(zone)) => self.time_in_zone[zone.index()] += 1,
                Ok(None) => self.time_below_zones += 1,
                Err(_) => {}
            }
        }
    }

    pub fn record_phase_completed(&mut self) {
        self.phases_completed += 1;
    }

    pub fn total_elapsed_secs(&self) -> u32 {
        self.total_elapsed_secs
    }

    pub fn finish(&self, plan_name: &str, stopped_early: bool) -> SessionSummary {
        let avg_bpm = if self.bpm_count > 0 {
            Some(((self.bpm_sum as f64) / (self.bpm_count as f64)).round() as u16)
        } else {
            None
        };

        SessionSummary {
            plan_name: plan_name.to_string(),
            total_elapsed_secs: self.total_elapsed_secs,
            phases_completed: self.phases_completed,
            avg_bpm,
            max_bpm: self.max_bpm,
            time_in_zone: self.time_in_zone,
            time_below_zones: self.time_below_zones,
            stopped_early,
            finished_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bpm_statistics() {
        let mut builder = SummaryBuilder::default();
        for bpm in [120, 130, 141] {
            builder.record_bpm(bpm);
        }
        let summary = builder.finish("Test", false);
        assert_eq!(summary.avg_bpm, Some(130));
        assert_eq!(summary.max_bpm, Some(141));
    }

    #[test]
    fn test_zone_histogram() {
        let mut builder = SummaryBuilder::default();
        builder.record_tick(Some(130), 200); // Zone 2
        builder.record_tick(Some(130), 200);
        builder.record_tick(Some(185), 200); // Zone 5
        builder.record_tick(Some(80), 200); // below Zone 1
        builder.record_tick(None, 200);

        let summary = builder.finish("Test", true);
        assert_eq!(summary.time_in_zone, [0, 2, 0, 0, 1]);
        assert_eq!(summary.time_below_zones, 1);
        assert_eq!(summary.total_elapsed_secs, 5);
        assert!(summary.stopped_early);
    }

    #[test]
    fn test_empty_session() {
        let summary = SummaryBuilder::default().finish("Empty", true);
        assert_eq!(summary.avg_bpm, None);
        assert_eq!(summary.max_bpm, None);
        assert_eq!(summary.phases_completed, 0);
    }

    #[test]
    fn test_resumed_keeps_progress() {
        let mut builder = SummaryBuilder::resumed(600, 1);
        builder.record_tick(None, 180);
        builder.record_phase_completed();
        let summary = builder.finish("Tempo", false);
        assert_eq!(summary.total_elapsed_secs, 601);
        assert_eq!(summary.phases_completed, 2);
    }
}
