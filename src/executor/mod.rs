//! Session execution
//!
//! Runs the heartbeat, feeds measurements and link status into the session
//! machine, persists recovery checkpoints and keeps the workout calendar.

pub mod checkpoint;
pub mod runner;
pub mod scheduler;

pub use checkpoint::{Checkpoint, CheckpointStore};
pub use runner::SessionExecutor;
pub use scheduler::{AttemptStatus, ScheduleBook, ScheduleUpdate, ScheduledAttempt, ScheduledSession};
