use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::StorageConfig;
use crate::error::CheckpointError;
use crate::models::SessionSummary;
use crate::session::{SessionMachine, SessionState};
use crate::training_plan::TrainingPlan;

/// Recovery snapshot of a session in progress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub plan: TrainingPlan,
    /// Session state name, `in_progress` or `paused`
    pub state: String,
    pub phase_index: usize,
    pub elapsed_secs: u32,
    pub last_checkpoint: DateTime<Utc>,
}

impl Checkpoint {
    /// Capture the machine's progress, if it has any worth saving
    pub fn capture(machine: &SessionMachine, now: DateTime<Utc>) -> Option<Self> {
        let plan = machine.plan()?;
        let (phase_index, elapsed_secs) = match machine.state() {
            SessionState::InProgress {
                phase_index,
                elapsed_secs,
                ..
            } => (*phase_index, *elapsed_secs),
            SessionState::Paused {
                saved_phase,
                saved_elapsed,
                ..
            } => (*saved_phase, *saved_elapsed),
            _ => return None,
        };

        Some(Self {
            plan: plan.clone(),
            state: machine.state().name().to_string(),
            phase_index,
            elapsed_secs,
            last_checkpoint: now,
        })
    }

    /// Strictly younger than `max_age`
    pub fn is_fresh(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        now - self.last_checkpoint < max_age
    }

    pub fn restore(self, debounce: u32) -> Result<SessionMachine, CheckpointError> {
        SessionMachine::restore(
            self.plan,
            &self.state,
            self.phase_index,
            self.elapsed_secs,
            debounce,
        )
    }
}

/// File-backed storage for the recovery checkpoint and the last summary
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    checkpoint_path: PathBuf,
    summary_path: PathBuf,
}

impl CheckpointStore {
    pub fn new(checkpoint_path: impl Into<PathBuf>, summary_path: impl Into<PathBuf>) -> Self {
        Self {
            checkpoint_path: checkpoint_path.into(),
            summary_path: summary_path.into(),
        }
    }

    pub fn from_config(storage: &StorageConfig) -> Self {
        Self::new(storage.checkpoint_path(), storage.summary_path())
    }

    pub fn checkpoint_path(&self) -> &Path {
        &self.checkpoint_path
    }

    pub fn summary_path(&self) -> &Path {
        &self.summary_path
    }

    /// Read the checkpoint; `None` when there is none
    pub fn load(&self) -> Result<Option<Checkpoint>, CheckpointError> {
        read_json(&self.checkpoint_path)
    }

    /// Load a checkpoint that may still be restored.
    ///
    /// Stale and unreadable checkpoints are deleted.
    pub fn load_fresh(&self, now: DateTime<Utc>, max_age: Duration) -> Option<Checkpoint> {
        let checkpoint = match self.load() {
            Ok(Some(checkpoint)) => checkpoint,
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, "Discarding unreadable checkpoint");
                self.clear_logged();
                return None;
            }
        };

        if checkpoint.is_fresh(now, max_age) {
            Some(checkpoint)
        } else {
            info!(
                written_at = %checkpoint.last_checkpoint,
                plan = %checkpoint.plan.name,
                "Discarding stale checkpoint"
            );
            self.clear_logged();
            None
        }
    }

    pub fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        write_json(&self.checkpoint_path, checkpoint)?;
        debug!(
            phase = checkpoint.phase_index,
            elapsed = checkpoint.elapsed_secs,
            "Checkpoint written"
        );
        Ok(())
    }

    pub fn clear(&self) -> Result<(), CheckpointError> {
        match fs::remove_file(&self.checkpoint_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(CheckpointError::Io {
                path: self.checkpoint_path.clone(),
                source,
            }),
        }
    }

    pub fn save_summary(&self, summary: &SessionSummary) -> Result<(), CheckpointError> {
        write_json(&self.summary_path, summary)
    }

    pub fn load_summary(&self) -> Result<Option<SessionSummary>, CheckpointError> {
        read_json(&self.summary_path)
    }

    fn clear_logged(&self) {
        if let Err(e) = self.clear() {
            warn!(error = %e, "Failed to remove checkpoint");
        }
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>, CheckpointError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(CheckpointError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    serde_json::from_str(&content)
        .map(Some)
        .map_err(|source| CheckpointError::Malformed {
            path: path.to_path_buf(),
            source,
        })
}

/// Write through a temporary file so a crash never leaves half a document
fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), CheckpointError> {
    let io_err = |source| CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err)?;
    }

    let content = serde_json::to_string_pretty(value).map_err(|source| CheckpointError::Malformed {
        path: path.to_path_buf(),
        source,
    })?;

    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, content).map_err(io_err)?;
    fs::rename(&tmp, path).map_err(io_err)
}
