//! Events the athlete should be told about, and the port that delivers them

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::models::{Zone, ZoneDeviation};

/// Queue size between the session loop and the notification adapter
pub const NOTIFICATION_BUFFER: usize = 64;

/// Something the athlete should be told
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotificationEvent {
    ZoneDeviation {
        deviation: ZoneDeviation,
        current_bpm: u16,
        target_zone: Zone,
    },
    PhaseTransition {
        from_phase: usize,
        to_phase: usize,
        phase_name: String,
    },
    BatteryLow {
        pct: u8,
    },
    ConnectionLost,
    WorkoutReady {
        plan_name: String,
    },
}

impl fmt::Display for NotificationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotificationEvent::ZoneDeviation {
                deviation: ZoneDeviation::InZone,
                target_zone,
                ..
            } => write!(f, "Back in {}", target_zone),
            NotificationEvent::ZoneDeviation {
                deviation,
                current_bpm,
                target_zone,
            } => write!(f, "Heart rate {} at {} bpm (target {})", deviation, current_bpm, target_zone),
            NotificationEvent::PhaseTransition { phase_name, to_phase, .. } => {
                write!(f, "Phase {}: {}", to_phase + 1, phase_name)
            }
            NotificationEvent::BatteryLow { pct } => write!(f, "Sensor battery low ({}%)", pct),
            NotificationEvent::ConnectionLost => write!(f, "Sensor connection lost"),
            NotificationEvent::WorkoutReady { plan_name } => {
                write!(f, "Time for your workout: {}", plan_name)
            }
        }
    }
}

/// Delivery failure reported by an adapter
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NotifyError {
    #[error("Notification channel unavailable: {0}")]
    Unavailable(String),

    #[error("Notification rejected: {0}")]
    Rejected(String),
}

/// Adapter that renders events to the athlete (audio, haptics, UI)
#[async_trait]
pub trait NotificationPort: Send + Sync {
    async fn notify(&self, event: NotificationEvent) -> Result<(), NotifyError>;
}

/// Non-blocking handle to a notification adapter.
///
/// Events are queued and delivered by a dispatcher task; a full queue or a
/// failing adapter is logged and otherwise ignored.
#[derive(Debug, Clone)]
pub struct Notifier {
    sender: mpsc::Sender<NotificationEvent>,
}

impl Notifier {
    /// Start a dispatcher for the given adapter, stopped by `cancel`
    pub fn spawn(port: Arc<dyn NotificationPort>, cancel: CancellationToken) -> Self {
        let (sender, mut receiver) = mpsc::channel::<NotificationEvent>(NOTIFICATION_BUFFER);

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = receiver.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };

                if let Err(e) = port.notify(event.clone()).await {
                    warn!(error = %e, event = ?event, "Notification delivery failed");
                }
            }
            debug!("Notification dispatcher stopped");
        });

        Self { sender }
    }

    /// Queue an event without waiting for delivery
    pub fn notify(&self, event: NotificationEvent) {
        if let Err(e) = self.sender.try_send(event) {
            warn!("Dropping notification: {}", e);
        }
    }
}

/// Writes events to the log
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl NotificationPort for LogNotifier {
    async fn notify(&self, event: NotificationEvent) -> Result<(), NotifyError> {
        info!(target: "zonecoach::notify", "{}", event);
        Ok(())
    }
}

/// Keeps every event in memory, for embedding and tests
#[derive(Debug, Default, Clone)]
pub struct RecordingNotifier {
    events: Arc<Mutex<Vec<NotificationEvent>>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<NotificationEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn count_matching(&self, predicate: impl Fn(&NotificationEvent) -> bool) -> usize {
        self.events().iter().filter(|e| predicate(e)).count()
    }
}

#[async_trait]
impl NotificationPort for RecordingNotifier {
    async fn notify(&self, event: NotificationEvent) -> Result<(), NotifyError> {
        let mut events = self
            .events
            .lock()
            .map_err(|e| NotifyError::Unavailable(e.to_string()))?;
        events.push(event);
        Ok(())
    }
}
