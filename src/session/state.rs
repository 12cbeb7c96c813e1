use serde::{Deserialize, Serialize};
use std::fmt;

use super::ZoneTracker;
use crate::models::SessionSummary;
use crate::notification::NotificationEvent;
use crate::training_plan::TrainingPlan;

/// Why a session was paused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    User,
    ConnectionLost,
}

/// What asked for a session to resume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeTrigger {
    User,
    Reconnected,
}

/// Lifecycle of one session attempt
#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    Idle,
    InProgress {
        phase_index: usize,
        /// Seconds into the current phase
        elapsed_secs: u32,
        /// Consecutive measurements at or above a heart rate target
        hold_count: u32,
        zone_tracker: ZoneTracker,
    },
    Paused {
        saved_phase: usize,
        saved_elapsed: u32,
        pause_reason: PauseReason,
    },
    Completed {
        summary: SessionSummary,
    },
}

impl SessionState {
    /// Stable name used in checkpoints
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::InProgress { .. } => "in_progress",
            SessionState::Paused { .. } => "paused",
            SessionState::Completed { .. } => "completed",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SessionState::InProgress { .. } | SessionState::Paused { .. }
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Inputs to the session state machine
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Start(TrainingPlan),
    /// One heartbeat second
    Tick,
    UpdateBpm(u16),
    Pause(PauseReason),
    Resume(ResumeTrigger),
    Stop,
}

/// Work for the executor after handling an event
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEffect {
    Notify(NotificationEvent),
    Completed(SessionSummary),
}
