use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::SessionError;
use crate::models::Zone;
use crate::signal::{MAX_VALID_BPM, MIN_VALID_BPM};
use crate::zones::ZoneCalculator;

/// Longest plan accepted, in seconds (4 hours)
pub const MAX_PLAN_SECS: u32 = 4 * 60 * 60;

/// Condition that moves a session to the next phase
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransitionCondition {
    /// Advance once the phase duration has elapsed
    TimeElapsed,

    /// Advance once the heart rate has held at or above a target
    HeartRateReached { target_bpm: u16, hold_secs: u32 },
}

/// A single phase within a training plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingPhase {
    pub name: String,
    pub target_zone: Zone,
    /// Phase length for time-based transitions, guidance otherwise
    pub duration_secs: u32,
    pub transition: TransitionCondition,
}

impl TrainingPhase {
    pub fn timed(name: impl Into<String>, target_zone: Zone, duration_secs: u32) -> Self {
        Self {
            name: name.into(),
            target_zone,
            duration_secs,
            transition: TransitionCondition::TimeElapsed,
        }
    }
}

/// An ordered sequence of phases personalised to a maximum heart rate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingPlan {
    pub name: String,
    pub phases: Vec<TrainingPhase>,
    pub created_at: DateTime<Utc>,
    pub max_hr: u16,
}

impl TrainingPlan {
    /// Check that the plan can be executed.
    ///
    /// - at least one phase
    /// - every phase has a non-zero duration
    /// - total duration of at most 4 hours
    /// - heart rate targets within 30-220 bpm
    /// - max HR within 100-220 bpm
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.phases.is_empty() {
            return Err(SessionError::InvalidPlan(
                "Plan must have at least 1 phase".to_string(),
            ));
        }

        ZoneCalculator::validate_max_hr(self.max_hr)
            .map_err(|e| SessionError::InvalidPlan(e.to_string()))?;

        let total = self.total_duration_secs();
        if total > MAX_PLAN_SECS as u64 {
            return Err(SessionError::InvalidPlan(format!(
                "Plan exceeds 4 hours (total: {}s)",
                total
            )));
        }

        for (idx, phase) in self.phases.iter().enumerate() {
            if phase.duration_secs == 0 {
                return Err(SessionError::InvalidPlan(format!(
                    "Phase {} '{}' has zero duration",
                    idx, phase.name
                )));
            }

            if let TransitionCondition::HeartRateReached {
                target_bpm,
                hold_secs,
            } = phase.transition
            {
                if !(MIN_VALID_BPM..=MAX_VALID_BPM).contains(&target_bpm) {
                    return Err(SessionError::InvalidPlan(format!(
                        "Phase {} '{}' has invalid target_bpm: {} (must be {}-{})",
                        idx, phase.name, target_bpm, MIN_VALID_BPM, MAX_VALID_BPM
                    )));
                }
                if hold_secs == 0 {
                    return Err(SessionError::InvalidPlan(format!(
                        "Phase {} '{}' has zero hold time",
                        idx, phase.name
                    )));
                }
            }
        }

        Ok(())
    }

    pub fn total_duration_secs(&self) -> u64 {
        self.phases.iter().map(|p| p.duration_secs as u64).sum()
    }

    /// Load a plan from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        use anyhow::Context;

        let content = fs::read_to_string(&path).with_context(|| {
            format!("Failed to read plan file: {}", path.as_ref().display())
        })?;
        let plan: TrainingPlan =
            serde_json::from_str(&content).with_context(|| "Failed to parse training plan JSON")?;
        Ok(plan)
    }
}

/// Built-in plans for quick starts
pub struct PlanTemplates;

impl PlanTemplates {
    pub fn from_name(name: &str, max_hr: u16) -> Option<TrainingPlan> {
        match name.to_lowercase().as_str() {
            "tempo" | "tempo-run" => Some(Self::tempo_run(max_hr)),
            "endurance" | "base" => Some(Self::base_endurance(max_hr)),
            "vo2" | "intervals" => Some(Self::vo2_intervals(max_hr)),
            "warmup-test" | "ramp" => Some(Self::ramp_test(max_hr)),
            _ => None,
        }
    }

    /// 10min Z2 warmup, 20min Z3 tempo, 10min Z1 cooldown
    pub fn tempo_run(max_hr: u16) -> TrainingPlan {
        TrainingPlan {
            name: "Tempo Run".to_string(),
            phases: vec![
                TrainingPhase::timed("Warmup", Zone::Zone2, 600),
                TrainingPhase::timed("Tempo", Zone::Zone3, 1200),
                TrainingPhase::timed("Cooldown", Zone::Zone1, 600),
            ],
            created_at: Utc::now(),
            max_hr,
        }
    }

    pub fn base_endurance(max_hr: u16) -> TrainingPlan {
        TrainingPlan {
            name: "Base Endurance".to_string(),
            phases: vec![TrainingPhase::timed("Steady State", Zone::Zone2, 2700)],
            created_at: Utc::now(),
            max_hr,
        }
    }

    /// Warmup, 5 x (3min Z5 work, 2min Z2 recovery), cooldown
    pub fn vo2_intervals(max_hr: u16) -> TrainingPlan {
        let mut phases = vec![TrainingPhase::timed("Warmup", Zone::Zone2, 300)];

        for i in 1..=5 {
            phases.push(TrainingPhase::timed(
                format!("Interval {} - Work", i),
                Zone::Zone5,
                180,
            ));
            phases.push(TrainingPhase::timed(
                format!("Interval {} - Recovery", i),
                Zone::Zone2,
                120,
            ));
        }

        phases.push(TrainingPhase::timed("Cooldown", Zone::Zone1, 300));

        TrainingPlan {
            name: "VO2 Max Intervals".to_string(),
            phases,
            created_at: Utc::now(),
            max_hr,
        }
    }

    /// Warm up until the heart rate holds at 70% of max, then a steady block
    pub fn ramp_test(max_hr: u16) -> TrainingPlan {
        let target_bpm = (max_hr as u32 * 70 / 100) as u16;
        TrainingPlan {
            name: "Ramp Warmup".to_string(),
            phases: vec![
                TrainingPhase {
                    name: "Ramp".to_string(),
                    target_zone: Zone::Zone2,
                    duration_secs: 900,
                    transition: TransitionCondition::HeartRateReached {
                        target_bpm,
                        hold_secs: 30,
                    },
                },
                TrainingPhase::timed("Steady", Zone::Zone3, 1200),
            ],
            created_at: Utc::now(),
            max_hr,
        }
    }
}
