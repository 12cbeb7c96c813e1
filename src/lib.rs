// Library interface for ZoneCoach
// The binary and the integration tests drive everything through these modules

pub mod api;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod executor;
pub mod fanout;
pub mod logging;
pub mod models;
pub mod notification;
pub mod session;
pub mod signal;
pub mod training_plan;
pub mod transport;
pub mod zones;

// Re-export commonly used types for convenience
pub use api::CoachService;
pub use config::AppConfig;
pub use connectivity::{ConnectionManager, ReconnectionPolicy};
pub use error::{CoachError, Result};
pub use executor::{CheckpointStore, SessionExecutor};
pub use logging::{LogConfig, LogFormat, LogLevel};
pub use models::*;
pub use notification::{LogNotifier, NotificationEvent, NotificationPort, RecordingNotifier};
pub use session::{SessionMachine, SessionSnapshot};
pub use training_plan::{PlanTemplates, TrainingPhase, TrainingPlan, TransitionCondition};
pub use transport::{SimulatedSensor, SimulatedTransport, Transport};
pub use zones::ZoneCalculator;
