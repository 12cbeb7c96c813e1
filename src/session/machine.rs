use serde::{Deserialize, Serialize};
use std::mem;
use tracing::{debug, info};

use super::{
    PauseReason, ResumeTrigger, SessionEffect, SessionEvent, SessionState, SummaryBuilder,
    ZoneTracker, DEFAULT_DEBOUNCE_TICKS,
};
use crate::error::CheckpointError;
use crate::models::{Zone, ZoneDeviation};
use crate::notification::NotificationEvent;
use crate::training_plan::{TrainingPhase, TrainingPlan, TransitionCondition};
use crate::zones::ZoneCalculator;

/// Point-in-time view of a session for display
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub state: String,
    pub plan_name: Option<String>,
    pub phase_index: Option<usize>,
    pub phase_name: Option<String>,
    pub phase_count: usize,
    pub phase_elapsed_secs: u32,
    pub phase_remaining_secs: Option<u32>,
    pub total_elapsed_secs: u32,
    pub current_bpm: Option<u16>,
    pub current_zone: Option<Zone>,
    pub target_zone: Option<Zone>,
    pub last_deviation: Option<ZoneDeviation>,
    pub pause_reason: Option<PauseReason>,
}

/// Drives a training plan through its phases.
///
/// Single writer: only the executor feeds events. Every reaction the outside
/// world needs is returned as a [`SessionEffect`].
#[derive(Debug, Clone)]
pub struct SessionMachine {
    plan: Option<TrainingPlan>,
    state: SessionState,
    current_bpm: Option<u16>,
    summary: SummaryBuilder,
    debounce: u32,
}

impl Default for SessionMachine {
    fn default() -> Self {
        Self::new(DEFAULT_DEBOUNCE_TICKS)
    }
}

impl SessionMachine {
    pub fn new(debounce: u32) -> Self {
        Self {
            plan: None,
            state: SessionState::Idle,
            current_bpm: None,
            summary: SummaryBuilder::default(),
            debounce,
        }
    }

    /// Rebuild a session from checkpointed progress
    pub fn restore(
        plan: TrainingPlan,
        state_name: &str,
        phase_index: usize,
        elapsed_secs: u32,
        debounce: u32,
    ) -> Result<Self, CheckpointError> {
        if phase_index >= plan.phases.len() {
            return Err(CheckpointError::Inconsistent(format!(
                "phase {} of a {}-phase plan",
                phase_index,
                plan.phases.len()
            )));
        }

        let state = match state_name {
            "in_progress" => SessionState::InProgress {
                phase_index,
                elapsed_secs,
                hold_count: 0,
                zone_tracker: ZoneTracker::new(debounce),
            },
            // Nobody is there to resume automatically after a restart
            "paused" => SessionState::Paused {
                saved_phase: phase_index,
                saved_elapsed: elapsed_secs,
                pause_reason: PauseReason::User,
            },
            other => return Err(CheckpointError::UnknownState(other.to_string())),
        };

        let earlier: u32 = plan.phases[..phase_index]
            .iter()
            .map(|p| p.duration_secs)
            .sum();

        Ok(Self {
            summary: SummaryBuilder::resumed(earlier + elapsed_secs, phase_index as u32),
            plan: Some(plan),
            state,
            current_bpm: None,
            debounce,
        })
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn plan(&self) -> Option<&TrainingPlan> {
        self.plan.as_ref()
    }

    pub fn current_bpm(&self) -> Option<u16> {
        self.current_bpm
    }

    /// Phase currently running or paused
    pub fn current_phase(&self) -> Option<&TrainingPhase> {
        let index = match &self.state {
            SessionState::InProgress { phase_index, .. } => *phase_index,
            SessionState::Paused { saved_phase, .. } => *saved_phase,
            _ => return None,
        };
        self.plan.as_ref()?.phases.get(index)
    }

    /// Feed one event and collect the resulting effects
    pub fn handle(&mut self, event: SessionEvent) -> Vec<SessionEffect> {
        let mut effects = Vec::new();

        match event {
            SessionEvent::Start(plan) => self.start(plan, &mut effects),
            SessionEvent::Tick => self.tick(&mut effects),
            SessionEvent::UpdateBpm(bpm) => self.update_bpm(bpm, &mut effects),
            SessionEvent::Pause(reason) => self.pause(reason),
            SessionEvent::Resume(trigger) => self.resume(trigger),
            SessionEvent::Stop => {
                if self.state.is_active() {
                    info!("Session stopped");
                    self.complete(true, &mut effects);
                }
            }
        }

        effects
    }

    fn start(&mut self, plan: TrainingPlan, effects: &mut Vec<SessionEffect>) {
        info!(plan = %plan.name, phases = plan.phases.len(), "Session started");

        // The last reading stays valid across sessions
        self.summary = SummaryBuilder::default();
        self.state = SessionState::InProgress {
            phase_index: 0,
            elapsed_secs: 0,
            hold_count: 0,
            zone_tracker: ZoneTracker::new(self.debounce),
        };
        let empty = plan.phases.is_empty();
        self.plan = Some(plan);

        if empty {
            self.complete(false, effects);
        }
    }

    fn tick(&mut self, effects: &mut Vec<SessionEffect>) {
        let Some(plan) = &self.plan else { return };
        let max_hr = plan.max_hr;
        let current_bpm = self.current_bpm;

        let SessionState::InProgress {
            phase_index,
            elapsed_secs,
            zone_tracker,
            ..
        } = &mut self.state
        else {
            return;
        };
        let Some(phase) = plan.phases.get(*phase_index) else {
            return;
        };

        *elapsed_secs += 1;
        self.summary.record_tick(current_bpm, max_hr);

        // No zone tracking until the first measurement arrives
        if let Some(bpm) = current_bpm {
            if let Some(deviation) = zone_tracker.check(bpm, phase.target_zone, max_hr) {
                debug!(deviation = %deviation, bpm, "Zone deviation");
                effects.push(SessionEffect::Notify(NotificationEvent::ZoneDeviation {
                    deviation,
                    current_bpm: bpm,
                    target_zone: phase.target_zone,
                }));
            }
        }

        let time_up = phase.transition == TransitionCondition::TimeElapsed
            && *elapsed_secs >= phase.duration_secs;
        if time_up {
            self.advance(effects);
        }
    }

    fn update_bpm(&mut self, bpm: u16, effects: &mut Vec<SessionEffect>) {
        self.current_bpm = Some(bpm);

        let Some(plan) = &self.plan else { return };
        let SessionState::InProgress {
            phase_index,
            hold_count,
            ..
        } = &mut self.state
        else {
            return;
        };
        self.summary.record_bpm(bpm);

        let Some(TransitionCondition::HeartRateReached {
            target_bpm,
            hold_secs,
        }) = plan.phases.get(*phase_index).map(|p| &p.transition)
        else {
            return;
        };

        if bpm >= *target_bpm {
            *hold_count += 1;
            if *hold_count >= *hold_secs {
                debug!(bpm, target_bpm = *target_bpm, "Heart rate target held");
                self.advance(effects);
            }
        } else {
            *hold_count = 0;
        }
    }

    fn pause(&mut self, reason: PauseReason) {
        match self.state {
            SessionState::InProgress {
                phase_index,
                elapsed_secs,
                ..
            } => {
                info!(reason = ?reason, phase = phase_index, "Session paused");
                self.state = SessionState::Paused {
                    saved_phase: phase_index,
                    saved_elapsed: elapsed_secs,
                    pause_reason: reason,
                };
            }
            // A user pause outranks a connectivity pause
            SessionState::Paused {
                ref mut pause_reason,
                ..
            } if reason == PauseReason::User => {
                *pause_reason = PauseReason::User;
            }
            _ => {}
        }
    }

    fn resume(&mut self, trigger: ResumeTrigger) {
        let SessionState::Paused {
            saved_phase,
            saved_elapsed,
            pause_reason,
        } = self.state
        else {
            return;
        };

        if trigger == ResumeTrigger::Reconnected && pause_reason == PauseReason::User {
            debug!("Ignoring reconnection resume of a user pause");
            return;
        }

        info!(trigger = ?trigger, phase = saved_phase, "Session resumed");
        self.state = SessionState::InProgress {
            phase_index: saved_phase,
            elapsed_secs: saved_elapsed,
            hold_count: 0,
            zone_tracker: ZoneTracker::new(self.debounce),
        };
    }

    fn advance(&mut self, effects: &mut Vec<SessionEffect>) {
        let Some(plan) = &self.plan else { return };
        let SessionState::InProgress { phase_index, .. } = self.state else {
            return;
        };

        self.summary.record_phase_completed();
        let next = phase_index + 1;

        match plan.phases.get(next) {
            Some(phase) => {
                info!(from = phase_index, to = next, phase = %phase.name, "Phase transition");
                effects.push(SessionEffect::Notify(NotificationEvent::PhaseTransition {
                    from_phase: phase_index,
                    to_phase: next,
                    phase_name: phase.name.clone(),
                }));
                self.state = SessionState::InProgress {
                    phase_index: next,
                    elapsed_secs: 0,
                    hold_count: 0,
                    zone_tracker: ZoneTracker::new(self.debounce),
                };
            }
            None => self.complete(false, effects),
        }
    }

    fn complete(&mut self, stopped_early: bool, effects: &mut Vec<SessionEffect>) {
        let plan_name = self
            .plan
            .as_ref()
            .map(|p| p.name.as_str())
            .unwrap_or_default();
        let summary = self.summary.finish(plan_name, stopped_early);

        info!(
            plan = %summary.plan_name,
            elapsed = summary.total_elapsed_secs,
            phases = summary.phases_completed,
            stopped_early,
            "Session completed"
        );

        let previous = mem::replace(
            &mut self.state,
            SessionState::Completed {
                summary: summary.clone(),
            },
        );
        debug!(previous = %previous, "Session state replaced");
        effects.push(SessionEffect::Completed(summary));
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let plan = self.plan.as_ref();
        let phase = self.current_phase();
        let max_hr = plan.map(|p| p.max_hr);

        let (phase_index, phase_elapsed, last_deviation, pause_reason) = match &self.state {
            SessionState::InProgress {
                phase_index,
                elapsed_secs,
                zone_tracker,
                ..
            } => (
                Some(*phase_index),
                *elapsed_secs,
                Some(zone_tracker.last_deviation()),
                None,
            ),
            SessionState::Paused {
                saved_phase,
                saved_elapsed,
                pause_reason,
            } => (Some(*saved_phase), *saved_elapsed, None, Some(*pause_reason)),
            _ => (None, 0, None, None),
        };

        let current_zone = match (self.current_bpm, max_hr) {
            (Some(bpm), Some(max_hr)) => ZoneCalculator::zone_for(bpm, max_hr).ok().flatten(),
            _ => None,
        };

        let total_elapsed_secs = match &self.state {
            SessionState::Completed { summary } => summary.total_elapsed_secs,
            _ => self.summary.total_elapsed_secs(),
        };

        SessionSnapshot {
            state: self.state.name().to_string(),
            plan_name: plan.map(|p| p.name.clone()),
            phase_index,
            phase_name: phase.map(|p| p.name.clone()),
            phase_count: plan.map_or(0, |p| p.phases.len()),
            phase_elapsed_secs: phase_elapsed,
            phase_remaining_secs: phase.map(|p| p.duration_secs.saturating_sub(phase_elapsed)),
            total_elapsed_secs,
            current_bpm: self.current_bpm,
            current_zone,
            target_zone: phase.map(|p| p.target_zone),
            last_deviation,
            pause_reason,
        }
    }
}
