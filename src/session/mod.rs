//! Session state machine
//!
//! A pure, synchronous machine that walks a [`TrainingPlan`](crate::training_plan::TrainingPlan)
//! one heartbeat at a time. The executor owns the clock and feeds it events.

pub mod machine;
pub mod state;
pub mod summary;
pub mod zone_tracker;

pub use machine::{SessionMachine, SessionSnapshot};
pub use state::{PauseReason, ResumeTrigger, SessionEffect, SessionEvent, SessionState};
pub use summary::SummaryBuilder;
pub use zone_tracker::{ZoneTracker, DEFAULT_DEBOUNCE_TICKS};
