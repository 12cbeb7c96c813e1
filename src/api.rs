//! Command surface for UI and CLI layers
//!
//! `CoachService` wires the connection manager, the session executor and the
//! notification dispatcher together and exposes them as one handle. It is
//! constructed once at startup and torn down with [`CoachService::shutdown`].

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::AppConfig;
use crate::connectivity::{ConnectionManager, ManagerConfig};
use crate::error::Result;
use crate::executor::{CheckpointStore, ScheduledSession, SessionExecutor};
use crate::fanout::Subscription;
use crate::models::{ConnectionStatus, DiscoveredDevice, FilteredMeasurement, SessionSummary};
use crate::notification::{NotificationPort, Notifier};
use crate::session::SessionSnapshot;
use crate::training_plan::TrainingPlan;
use crate::transport::Transport;

/// Owner of every background task in a running coach
#[derive(Debug, Clone)]
pub struct CoachService {
    connection: ConnectionManager,
    executor: SessionExecutor,
    config: Arc<AppConfig>,
    cancel: CancellationToken,
}

impl CoachService {
    /// Spawn the notification dispatcher, the connection manager and the
    /// session executor. A fresh checkpoint in the data directory is restored.
    pub fn start(
        config: AppConfig,
        transport: Arc<dyn Transport>,
        port: Arc<dyn NotificationPort>,
    ) -> Result<Self> {
        config.validate()?;

        let cancel = CancellationToken::new();
        let notifier = Notifier::spawn(port, cancel.child_token());

        let connection = ConnectionManager::spawn(
            transport,
            ManagerConfig::from(&config),
            notifier.clone(),
            cancel.child_token(),
        );

        // Subscribe before the link exists so no early update is missed
        let executor = SessionExecutor::spawn(
            config.session.clone(),
            CheckpointStore::from_config(&config.storage),
            connection.subscribe_measurements(),
            connection.subscribe_status(),
            notifier,
            cancel.child_token(),
        );

        info!(data_dir = %config.storage.data_dir.display(), "Coach service started");

        Ok(Self {
            connection,
            executor,
            config: Arc::new(config),
            cancel,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Scan for the configured duration
    pub async fn scan_devices(&self) -> Result<Vec<DiscoveredDevice>> {
        let devices = self
            .connection
            .scan(self.config.connection.scan_duration())
            .await?;
        Ok(devices)
    }

    pub async fn connect_device(&self, device_id: &str) -> Result<()> {
        self.connection.connect(device_id).await?;
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.connection.disconnect().await?;
        Ok(())
    }

    /// Abandon an automatic reconnection in progress
    pub async fn cancel_reconnect(&self) -> Result<()> {
        self.connection.cancel_reconnect().await?;
        Ok(())
    }

    /// Explicit retry after reconnection gave up
    pub async fn retry_connection(&self) -> Result<()> {
        self.connection.retry().await?;
        Ok(())
    }

    pub async fn connection_status(&self) -> Result<ConnectionStatus> {
        Ok(self.connection.status().await?)
    }

    pub fn subscribe_filtered_measurements(&self) -> Subscription<FilteredMeasurement> {
        self.connection.subscribe_measurements()
    }

    pub fn subscribe_connection_status(&self) -> Subscription<ConnectionStatus> {
        self.connection.subscribe_status()
    }

    /// Measurements lost by lagging subscribers
    pub fn dropped_measurements(&self) -> u64 {
        self.connection.dropped_measurements()
    }

    pub async fn start_session(&self, plan: TrainingPlan) -> Result<()> {
        self.executor.start_session(plan).await?;
        Ok(())
    }

    pub async fn pause_session(&self) -> Result<()> {
        self.executor.pause_session().await?;
        Ok(())
    }

    pub async fn resume_session(&self) -> Result<()> {
        self.executor.resume_session().await?;
        Ok(())
    }

    pub async fn stop_session(&self) -> Result<SessionSummary> {
        Ok(self.executor.stop_session().await?)
    }

    pub async fn session_snapshot(&self) -> Result<SessionSnapshot> {
        Ok(self.executor.snapshot().await?)
    }

    /// Announce `plan` whenever the cron expression fires
    pub async fn schedule_session(&self, plan: TrainingPlan, expression: &str) -> Result<String> {
        Ok(self.executor.schedule_session(plan, expression).await?)
    }

    pub async fn cancel_schedule(&self, id: &str) -> Result<()> {
        self.executor.cancel_schedule(id).await?;
        Ok(())
    }

    pub async fn scheduled_sessions(&self) -> Result<Vec<ScheduledSession>> {
        Ok(self.executor.scheduled_sessions().await?)
    }

    /// Checkpoint any active session, drop the link and stop every task
    pub async fn shutdown(&self) {
        self.executor.shutdown().await;
        self.connection.shutdown().await;
        self.cancel.cancel();
        info!("Coach service stopped");
    }
}
