use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{transition, ConnectionEffect, ConnectionEvent, ConnectionState, ReconnectionPolicy};
use crate::config::{AppConfig, ConnectionConfig};
use crate::error::ConnectionError;
use crate::fanout::{FanOut, Subscription};
use crate::models::{ConnectionStatus, DiscoveredDevice, FilteredMeasurement};
use crate::notification::{NotificationEvent, Notifier};
use crate::signal::{FilterConfig, SignalPipeline};
use crate::transport::Transport;

const COMMAND_BUFFER: usize = 32;
const REPORT_BUFFER: usize = 32;

type Reply<T> = oneshot::Sender<Result<T, ConnectionError>>;

/// Settings the connection manager runs with
#[derive(Debug, Clone, Default)]
pub struct ManagerConfig {
    pub policy: ReconnectionPolicy,
    pub connection: ConnectionConfig,
    pub filter: FilterConfig,
}

impl From<&AppConfig> for ManagerConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            policy: config.reconnection.clone(),
            connection: config.connection.clone(),
            filter: config.filter,
        }
    }
}

enum Command {
    Scan {
        duration: Duration,
        reply: Reply<Vec<DiscoveredDevice>>,
    },
    Connect {
        device_id: String,
        reply: Reply<()>,
    },
    Disconnect {
        reply: Reply<()>,
    },
    CancelReconnect {
        reply: Reply<()>,
    },
    Retry {
        reply: Reply<()>,
    },
    Status {
        reply: oneshot::Sender<ConnectionStatus>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Outcomes reported back by tasks the driver spawned
enum TaskReport {
    ScanFinished {
        devices: Vec<DiscoveredDevice>,
    },
    ScanFailed {
        reason: String,
    },
    ConnectFinished {
        generation: u64,
        result: Result<(), ConnectionError>,
    },
    StreamStarted {
        generation: u64,
    },
    LinkLost {
        generation: u64,
        reason: String,
    },
}

/// Owner of the single sensor link.
///
/// A driver task holds the connectivity state machine and the transport;
/// this handle talks to it over a command channel and can be cloned freely.
/// Filtered measurements and status changes are published on fan-out
/// channels.
#[derive(Debug, Clone)]
pub struct ConnectionManager {
    commands: mpsc::Sender<Command>,
    measurements: FanOut<FilteredMeasurement>,
    status: FanOut<ConnectionStatus>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Command::Scan { .. } => "Scan",
            Command::Connect { .. } => "Connect",
            Command::Disconnect { .. } => "Disconnect",
            Command::CancelReconnect { .. } => "CancelReconnect",
            Command::Retry { .. } => "Retry",
            Command::Status { .. } => "Status",
            Command::Shutdown { .. } => "Shutdown",
        };
        f.write_str(name)
    }
}

impl ConnectionManager {
    /// Start the driver task. It stops on `shutdown` or when `cancel` fires.
    pub fn spawn(
        transport: Arc<dyn Transport>,
        config: ManagerConfig,
        notifier: Notifier,
        cancel: CancellationToken,
    ) -> Self {
        let (commands, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (reports, report_rx) = mpsc::channel(REPORT_BUFFER);
        let measurements = FanOut::new(config.connection.measurement_buffer);
        let status = FanOut::new(config.connection.measurement_buffer);

        let driver = Driver {
            state: ConnectionState::Idle,
            status: ConnectionStatus::Disconnected,
            config,
            transport,
            measurements: measurements.clone(),
            status_out: status.clone(),
            notifier,
            cancel,
            reports,
            generation: 0,
            link_token: None,
            attempt_token: None,
            pending_connect: None,
            last_device: None,
        };
        tokio::spawn(driver.run(command_rx, report_rx));

        Self {
            commands,
            measurements,
            status,
        }
    }

    pub async fn scan(&self, duration: Duration) -> Result<Vec<DiscoveredDevice>, ConnectionError> {
        self.request(|reply| Command::Scan { duration, reply }).await
    }

    /// Connect to a sensor, replacing any existing link.
    ///
    /// Failed attempts are retried with the reconnection backoff. Resolves
    /// once the link is up, or with `ReconnectFailed` when the retries run
    /// out.
    pub async fn connect(&self, device_id: &str) -> Result<(), ConnectionError> {
        let device_id = device_id.to_string();
        self.request(|reply| Command::Connect { device_id, reply })
            .await
    }

    pub async fn disconnect(&self) -> Result<(), ConnectionError> {
        self.request(|reply| Command::Disconnect { reply }).await
    }

    /// Abandon automatic reconnection and settle into `Disconnected`
    pub async fn cancel_reconnect(&self) -> Result<(), ConnectionError> {
        self.request(|reply| Command::CancelReconnect { reply })
            .await
    }

    /// Reconnect to the last device after reconnection gave up
    pub async fn retry(&self) -> Result<(), ConnectionError> {
        self.request(|reply| Command::Retry { reply }).await
    }

    pub async fn status(&self) -> Result<ConnectionStatus, ConnectionError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Status { reply })
            .await
            .map_err(|_| ConnectionError::ManagerStopped)?;
        rx.await.map_err(|_| ConnectionError::ManagerStopped)
    }

    pub fn subscribe_measurements(&self) -> Subscription<FilteredMeasurement> {
        self.measurements.subscribe()
    }

    pub fn subscribe_status(&self) -> Subscription<ConnectionStatus> {
        self.status.subscribe()
    }

    /// Measurements lost by lagging subscribers so far
    pub fn dropped_measurements(&self) -> u64 {
        self.measurements.dropped()
    }

    /// Tear down the link and stop the driver
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, ConnectionError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| ConnectionError::ManagerStopped)?;
        rx.await.map_err(|_| ConnectionError::ManagerStopped)?
    }
}

struct Driver {
    state: ConnectionState,
    status: ConnectionStatus,
    config: ManagerConfig,
    transport: Arc<dyn Transport>,
    measurements: FanOut<FilteredMeasurement>,
    status_out: FanOut<ConnectionStatus>,
    notifier: Notifier,
    cancel: CancellationToken,
    reports: mpsc::Sender<TaskReport>,
    /// Bumped whenever spawned work is superseded; stale reports are dropped
    generation: u64,
    link_token: Option<CancellationToken>,
    attempt_token: Option<CancellationToken>,
    pending_connect: Option<Reply<()>>,
    last_device: Option<String>,
}

impl Driver {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut reports: mpsc::Receiver<TaskReport>,
    ) {
        info!("Connection manager started");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.stop().await;
                        let _ = reply.send(());
                        return;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(report) = reports.recv() => self.handle_report(report).await,
            }
        }

        self.stop().await;
    }

    async fn stop(&mut self) {
        self.fail_pending("connection manager stopped");
        if let Some(token) = self.attempt_token.take() {
            token.cancel();
        }
        if self.link_token.is_some() || self.state.holds_link() {
            self.teardown_link().await;
        }
        info!("Connection manager stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        debug!(command = ?command, state = %self.state, "Connection command");

        match command {
            Command::Scan { duration, reply } => {
                self.apply(ConnectionEvent::StartScan).await;
                self.spawn_scan(duration, reply);
            }
            Command::Connect { device_id, reply } => {
                self.fail_pending("superseded by a new connection request");
                self.last_device = Some(device_id.clone());
                self.pending_connect = Some(reply);
                self.apply(ConnectionEvent::Connect(device_id)).await;
            }
            Command::Disconnect { reply } => {
                self.fail_pending("cancelled by disconnect");
                self.apply(ConnectionEvent::UserDisconnect).await;
                let _ = reply.send(Ok(()));
            }
            Command::CancelReconnect { reply } => {
                if matches!(self.state, ConnectionState::Reconnecting { .. }) {
                    self.fail_pending("reconnection cancelled");
                }
                self.apply(ConnectionEvent::CancelReconnect).await;
                let _ = reply.send(Ok(()));
            }
            Command::Retry { reply } => self.retry(reply).await,
            Command::Status { reply } => {
                let _ = reply.send(self.status.clone());
            }
            Command::Shutdown { reply } => {
                // Handled by the run loop
                let _ = reply.send(());
            }
        }
    }

    async fn retry(&mut self, reply: Reply<()>) {
        if matches!(
            self.state,
            ConnectionState::Connected { .. } | ConnectionState::Streaming { .. }
        ) {
            let _ = reply.send(Ok(()));
            return;
        }

        let Some(device_id) = self.last_device.clone() else {
            let _ = reply.send(Err(ConnectionError::NotConnected));
            return;
        };

        info!(device_id = %device_id, "Manual reconnection requested");
        self.apply(ConnectionEvent::ManualRetry).await;
        self.fail_pending("superseded by a retry");
        self.pending_connect = Some(reply);
        self.apply(ConnectionEvent::Connect(device_id)).await;
    }

    async fn handle_report(&mut self, report: TaskReport) {
        match report {
            TaskReport::ScanFinished { devices } => {
                for device in devices {
                    debug!(id = %device.id, name = ?device.name, rssi = device.rssi, "Device found");
                    self.apply(ConnectionEvent::DeviceFound(device)).await;
                }
            }
            TaskReport::ScanFailed { reason } => {
                warn!(reason = %reason, "Scan failed");
                // A connect issued meanwhile owns the state now
                if self.state == ConnectionState::Scanning {
                    self.apply(ConnectionEvent::Error(reason)).await;
                }
            }
            TaskReport::ConnectFinished { generation, result } => {
                if generation != self.generation {
                    debug!(generation, current = self.generation, "Ignoring stale connect result");
                    return;
                }
                match result {
                    Ok(()) => {
                        self.apply(ConnectionEvent::Connected).await;
                        if let Some(reply) = self.pending_connect.take() {
                            let _ = reply.send(Ok(()));
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, state = %self.state, "Connect attempt failed");
                        let attempts = match self.state {
                            ConnectionState::Reconnecting { attempt, .. } => attempt,
                            _ => 0,
                        };
                        self.apply(ConnectionEvent::Error(e.to_string())).await;

                        // The caller only hears about it once retrying is over
                        if self.state == ConnectionState::Disconnected {
                            if let Some(reply) = self.pending_connect.take() {
                                let err = if attempts == 0 {
                                    e
                                } else {
                                    ConnectionError::ReconnectFailed {
                                        attempts,
                                        reason: e.to_string(),
                                    }
                                };
                                let _ = reply.send(Err(err));
                            }
                        }
                    }
                }
            }
            TaskReport::StreamStarted { generation } => {
                if generation == self.generation {
                    self.apply(ConnectionEvent::StreamStarted).await;
                }
            }
            TaskReport::LinkLost { generation, reason } => {
                if generation != self.generation {
                    debug!(generation, "Ignoring loss of a superseded link");
                    return;
                }
                warn!(reason = %reason, state = %self.state, "Sensor link lost");
                self.apply(ConnectionEvent::Disconnected).await;
            }
        }
    }

    async fn apply(&mut self, event: ConnectionEvent) {
        let t = transition(&self.state, event, &self.config.policy);
        if t.state != self.state {
            debug!(from = %self.state, to = %t.state, "Connection state changed");
        }
        self.state = t.state;

        for effect in t.effects {
            self.perform(effect).await;
        }
    }

    async fn perform(&mut self, effect: ConnectionEffect) {
        match effect {
            ConnectionEffect::EmitStatus(status) => {
                info!(status = ?status, "Connection status");
                self.status = status.clone();
                self.status_out.publish(status);
            }
            ConnectionEffect::AttemptConnect { device_id } => {
                self.spawn_attempt(device_id, Duration::ZERO);
            }
            ConnectionEffect::ScheduleRetry {
                device_id,
                attempt,
                delay,
            } => {
                info!(device_id = %device_id, attempt, delay_ms = delay.as_millis() as u64, "Scheduling reconnection");
                self.spawn_attempt(device_id, delay);
            }
            ConnectionEffect::OpenStream { device_id } => {
                debug!(device_id = %device_id, "Opening measurement stream");
                self.spawn_link();
            }
            ConnectionEffect::CancelRetry => {
                if let Some(token) = self.attempt_token.take() {
                    token.cancel();
                }
                self.generation += 1;
            }
            ConnectionEffect::TeardownLink => self.teardown_link().await,
            ConnectionEffect::NotifyConnectionLost => {
                self.notifier.notify(NotificationEvent::ConnectionLost);
            }
        }
    }

    async fn teardown_link(&mut self) {
        self.generation += 1;
        if let Some(token) = self.attempt_token.take() {
            token.cancel();
        }
        if let Some(token) = self.link_token.take() {
            token.cancel();
        }
        if let Err(e) = self.transport.disconnect().await {
            debug!(error = %e, "Transport disconnect");
        }
    }

    fn fail_pending(&mut self, reason: &str) {
        if let Some(reply) = self.pending_connect.take() {
            let device_id = self.last_device.clone().unwrap_or_default();
            let _ = reply.send(Err(ConnectionError::ConnectionFailed {
                device_id,
                reason: reason.to_string(),
            }));
        }
    }

    fn spawn_scan(&self, duration: Duration, reply: Reply<Vec<DiscoveredDevice>>) {
        let transport = Arc::clone(&self.transport);
        let reports = self.reports.clone();
        let token = self.cancel.child_token();

        tokio::spawn(async move {
            let result = tokio::select! {
                _ = token.cancelled() => Err(ConnectionError::ManagerStopped),
                result = transport.scan(duration) => result,
            };
            let report = match &result {
                Ok(devices) => Some(TaskReport::ScanFinished {
                    devices: devices.clone(),
                }),
                Err(ConnectionError::ManagerStopped) => None,
                Err(e) => Some(TaskReport::ScanFailed {
                    reason: e.to_string(),
                }),
            };
            if let Some(report) = report {
                let _ = reports.send(report).await;
            }
            let _ = reply.send(result);
        });
    }

    /// One connect attempt after `delay`, reported as `ConnectFinished`
    fn spawn_attempt(&mut self, device_id: String, delay: Duration) {
        self.generation += 1;
        let generation = self.generation;
        let token = self.cancel.child_token();
        if let Some(old) = self.attempt_token.replace(token.clone()) {
            old.cancel();
        }

        let transport = Arc::clone(&self.transport);
        let reports = self.reports.clone();
        let timeout = self.config.connection.connect_timeout();

        tokio::spawn(async move {
            let attempt = async {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                match tokio::time::timeout(timeout, transport.connect(&device_id)).await {
                    Ok(result) => result,
                    Err(_) => Err(ConnectionError::Timeout {
                        device_id: device_id.clone(),
                        secs: timeout.as_secs(),
                    }),
                }
            };

            let result = tokio::select! {
                _ = token.cancelled() => return,
                result = attempt => result,
            };
            let _ = reports
                .send(TaskReport::ConnectFinished { generation, result })
                .await;
        });
    }

    /// Measurement pump and battery poller for a freshly connected link
    fn spawn_link(&mut self) {
        self.generation += 1;
        let generation = self.generation;
        let token = self.cancel.child_token();
        if let Some(old) = self.link_token.replace(token.clone()) {
            old.cancel();
        }

        tokio::spawn(pump_measurements(
            Arc::clone(&self.transport),
            generation,
            token.clone(),
            self.config.filter,
            self.measurements.clone(),
            self.reports.clone(),
        ));

        tokio::spawn(poll_battery(
            Arc::clone(&self.transport),
            token,
            self.config.connection.battery_poll_interval(),
            self.config.connection.low_battery_pct,
            self.notifier.clone(),
        ));
    }
}

async fn pump_measurements(
    transport: Arc<dyn Transport>,
    generation: u64,
    token: CancellationToken,
    filter: FilterConfig,
    measurements: FanOut<FilteredMeasurement>,
    reports: mpsc::Sender<TaskReport>,
) {
    let subscribed = tokio::select! {
        _ = token.cancelled() => return,
        result = transport.subscribe_measurements() => result,
    };
    let mut frames = match subscribed {
        Ok(frames) => frames,
        Err(e) => {
            let _ = reports
                .send(TaskReport::LinkLost {
                    generation,
                    reason: e.to_string(),
                })
                .await;
            return;
        }
    };
    let _ = reports.send(TaskReport::StreamStarted { generation }).await;

    // Fresh filter per link
    let mut pipeline = SignalPipeline::new(&filter);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            frame = frames.recv() => match frame {
                Some(bytes) => {
                    if let Some(measurement) = pipeline.process(&bytes) {
                        measurements.publish(measurement);
                    }
                }
                None => {
                    let _ = reports
                        .send(TaskReport::LinkLost {
                            generation,
                            reason: "measurement stream closed".to_string(),
                        })
                        .await;
                    break;
                }
            },
        }
    }

    let stats = pipeline.stats();
    debug!(
        frames = stats.frames,
        accepted = stats.accepted,
        parse_failures = stats.parse_failures,
        rejected = stats.rejected,
        estimate = pipeline.filter().estimate(),
        "Measurement pump stopped"
    );
}

async fn poll_battery(
    transport: Arc<dyn Transport>,
    token: CancellationToken,
    interval: Duration,
    low_pct: u8,
    notifier: Notifier,
) {
    let mut ticker = tokio::time::interval(interval);
    let mut warned = false;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => match transport.read_battery().await {
                Ok(pct) => {
                    debug!(pct, "Sensor battery");
                    // Once per link
                    if pct < low_pct && !warned {
                        warned = true;
                        notifier.notify(NotificationEvent::BatteryLow { pct });
                    }
                }
                Err(e) => debug!(error = %e, "Battery read failed"),
            },
        }
    }
}
