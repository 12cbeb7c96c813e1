use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::checkpoint::{Checkpoint, CheckpointStore};
use super::scheduler::{ScheduleBook, ScheduleUpdate, ScheduledSession};
use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::fanout::Subscription;
use crate::models::{ConnectionStatus, FilteredMeasurement, SessionSummary};
use crate::notification::{NotificationEvent, Notifier};
use crate::session::{
    PauseReason, ResumeTrigger, SessionEffect, SessionEvent, SessionMachine, SessionSnapshot,
    SessionState,
};
use crate::training_plan::TrainingPlan;

const COMMAND_BUFFER: usize = 32;
const TICK_BUFFER: usize = 8;

/// How far the system clock may run ahead before the executor clock follows it
const CLOCK_TOLERANCE_SECS: i64 = 5;

/// Longest the driver sleeps on a calendar deadline before re-checking the clock
const CLOCK_CHECK_PERIOD: Duration = Duration::from_secs(60);

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

enum Command {
    Start {
        plan: TrainingPlan,
        reply: Reply<()>,
    },
    Pause {
        reply: Reply<()>,
    },
    Resume {
        reply: Reply<()>,
    },
    Stop {
        reply: Reply<SessionSummary>,
    },
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
    Schedule {
        plan: TrainingPlan,
        expression: String,
        reply: Reply<String>,
    },
    CancelSchedule {
        id: String,
        reply: Reply<()>,
    },
    ListSchedules {
        reply: oneshot::Sender<Vec<ScheduledSession>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Command::Start { .. } => "Start",
            Command::Pause { .. } => "Pause",
            Command::Resume { .. } => "Resume",
            Command::Stop { .. } => "Stop",
            Command::Snapshot { .. } => "Snapshot",
            Command::Schedule { .. } => "Schedule",
            Command::CancelSchedule { .. } => "CancelSchedule",
            Command::ListSchedules { .. } => "ListSchedules",
            Command::Shutdown { .. } => "Shutdown",
        };
        f.write_str(name)
    }
}

/// Wall clock that advances with the runtime clock.
///
/// Calendar triggers and checkpoint timestamps follow tokio time, so paused
/// test runtimes see whole hours pass instantly. The runtime clock stands
/// still while the host is suspended; `resync` catches up with the system
/// clock afterwards.
#[derive(Debug, Clone, Copy)]
struct Clock {
    wall_origin: DateTime<Utc>,
    instant_origin: Instant,
}

impl Clock {
    fn start() -> Self {
        Self::anchored(Utc::now())
    }

    fn anchored(wall: DateTime<Utc>) -> Self {
        Self {
            wall_origin: wall,
            instant_origin: Instant::now(),
        }
    }

    /// Re-anchor when the system clock has moved ahead. Never goes back.
    fn resync(&mut self) -> bool {
        let system = Utc::now();
        let behind = system - self.now();
        if behind <= chrono::Duration::seconds(CLOCK_TOLERANCE_SECS) {
            return false;
        }
        info!(behind_secs = behind.num_seconds(), "Wall clock jumped ahead, re-anchoring");
        *self = Self::anchored(system);
        true
    }

    fn now(&self) -> DateTime<Utc> {
        let elapsed = Instant::now().duration_since(self.instant_origin);
        let elapsed = chrono::Duration::from_std(elapsed).unwrap_or_else(|_| chrono::Duration::zero());
        self.wall_origin + elapsed
    }

    fn instant_at(&self, at: DateTime<Utc>) -> Instant {
        let offset = (at - self.wall_origin).to_std().unwrap_or(Duration::ZERO);
        self.instant_origin + offset
    }
}

/// Runs training sessions.
///
/// A driver task owns the session state machine, the 1 Hz heartbeat, the
/// recovery checkpoint and the workout calendar. It consumes filtered
/// measurements and connection status updates and pauses or resumes the
/// session as the sensor link comes and goes.
#[derive(Debug, Clone)]
pub struct SessionExecutor {
    commands: mpsc::Sender<Command>,
}

impl SessionExecutor {
    /// Start the driver task, restoring a fresh checkpoint if one exists
    pub fn spawn(
        config: SessionConfig,
        store: CheckpointStore,
        measurements: Subscription<FilteredMeasurement>,
        status: Subscription<ConnectionStatus>,
        notifier: Notifier,
        cancel: CancellationToken,
    ) -> Self {
        let (commands, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (ticks, tick_rx) = mpsc::channel(TICK_BUFFER);
        let clock = Clock::start();

        let machine = restore_session(&store, &config, clock.now())
            .unwrap_or_else(|| SessionMachine::new(config.deviation_debounce_ticks));

        let driver = Driver {
            machine,
            schedules: ScheduleBook::new(config.start_window()),
            config,
            store,
            notifier,
            cancel,
            clock,
            ticks,
            heartbeat: None,
            generation: 0,
            ticks_since_checkpoint: 0,
        };
        tokio::spawn(driver.run(command_rx, tick_rx, measurements, status));

        Self { commands }
    }

    /// Start a plan, replacing any session in progress
    pub async fn start_session(&self, plan: TrainingPlan) -> Result<(), SessionError> {
        self.request(|reply| Command::Start { plan, reply }).await
    }

    pub async fn pause_session(&self) -> Result<(), SessionError> {
        self.request(|reply| Command::Pause { reply }).await
    }

    pub async fn resume_session(&self) -> Result<(), SessionError> {
        self.request(|reply| Command::Resume { reply }).await
    }

    /// Stop the active session and return its summary
    pub async fn stop_session(&self) -> Result<SessionSummary, SessionError> {
        self.request(|reply| Command::Stop { reply }).await
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Snapshot { reply })
            .await
            .map_err(|_| SessionError::ExecutorStopped)?;
        rx.await.map_err(|_| SessionError::ExecutorStopped)
    }

    /// Register a cron expression that announces `plan`; returns the schedule id
    pub async fn schedule_session(
        &self,
        plan: TrainingPlan,
        expression: &str,
    ) -> Result<String, SessionError> {
        let expression = expression.to_string();
        self.request(|reply| Command::Schedule {
            plan,
            expression,
            reply,
        })
        .await
    }

    pub async fn cancel_schedule(&self, id: &str) -> Result<(), SessionError> {
        let id = id.to_string();
        self.request(|reply| Command::CancelSchedule { id, reply })
            .await
    }

    pub async fn scheduled_sessions(&self) -> Result<Vec<ScheduledSession>, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::ListSchedules { reply })
            .await
            .map_err(|_| SessionError::ExecutorStopped)?;
        rx.await.map_err(|_| SessionError::ExecutorStopped)
    }

    /// Stop the heartbeat and the driver, keeping a checkpoint of any active session
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| SessionError::ExecutorStopped)?;
        rx.await.map_err(|_| SessionError::ExecutorStopped)?
    }
}

fn restore_session(
    store: &CheckpointStore,
    config: &SessionConfig,
    now: DateTime<Utc>,
) -> Option<SessionMachine> {
    let checkpoint = store.load_fresh(now, config.checkpoint_max_age())?;
    let plan_name = checkpoint.plan.name.clone();

    match checkpoint.restore(config.deviation_debounce_ticks) {
        Ok(machine) => {
            info!(plan = %plan_name, state = %machine.state(), "Session restored from checkpoint");
            Some(machine)
        }
        Err(e) => {
            warn!(error = %e, "Discarding checkpoint");
            if let Err(e) = store.clear() {
                warn!(error = %e, "Failed to remove checkpoint");
            }
            None
        }
    }
}

struct Driver {
    machine: SessionMachine,
    schedules: ScheduleBook,
    config: SessionConfig,
    store: CheckpointStore,
    notifier: Notifier,
    cancel: CancellationToken,
    clock: Clock,
    ticks: mpsc::Sender<u64>,
    heartbeat: Option<CancellationToken>,
    /// Tags heartbeat ticks; ticks from a cancelled heartbeat are dropped
    generation: u64,
    ticks_since_checkpoint: u32,
}

impl Driver {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut ticks: mpsc::Receiver<u64>,
        mut measurements: Subscription<FilteredMeasurement>,
        mut status: Subscription<ConnectionStatus>,
    ) {
        info!("Session executor started");
        self.sync_heartbeat();

        let mut measurements_open = true;
        let mut status_open = true;

        loop {
            self.clock.resync();
            let wake = self
                .schedules
                .next_deadline()
                .map(|at| self.clock.instant_at(at).min(Instant::now() + CLOCK_CHECK_PERIOD));

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.stop();
                        let _ = reply.send(());
                        return;
                    }
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(generation) = ticks.recv() => {
                    if generation == self.generation {
                        self.tick();
                    }
                }
                measurement = measurements.recv(), if measurements_open => match measurement {
                    Some(m) => self.apply(SessionEvent::UpdateBpm(m.bpm())),
                    None => {
                        debug!("Measurement stream closed");
                        measurements_open = false;
                    }
                },
                update = status.recv(), if status_open => match update {
                    Some(s) => self.connection_changed(&s),
                    None => status_open = false,
                },
                _ = sleep_until(wake) => self.poll_schedules(),
            }
        }

        self.stop();
    }

    fn stop(&mut self) {
        if self.machine.state().is_active() {
            self.write_checkpoint();
        }
        self.stop_heartbeat();
        info!("Session executor stopped");
    }

    fn handle_command(&mut self, command: Command) {
        debug!(command = ?command, state = %self.machine.state(), "Session command");

        match command {
            Command::Start { plan, reply } => {
                let _ = reply.send(self.start(plan));
            }
            Command::Pause { reply } => {
                let result = if self.machine.state().is_active() {
                    self.apply(SessionEvent::Pause(PauseReason::User));
                    Ok(())
                } else {
                    Err(SessionError::SessionNotFound)
                };
                let _ = reply.send(result);
            }
            Command::Resume { reply } => {
                let result = if self.machine.state().is_active() {
                    self.apply(SessionEvent::Resume(ResumeTrigger::User));
                    Ok(())
                } else {
                    Err(SessionError::SessionNotFound)
                };
                let _ = reply.send(result);
            }
            Command::Stop { reply } => {
                let result = if self.machine.state().is_active() {
                    self.apply(SessionEvent::Stop);
                    let outcome = match self.machine.state() {
                        SessionState::Completed { summary } => Ok(summary.clone()),
                        other => Err(format!("stop left the session {}", other)),
                    };
                    outcome.map_err(|reason| {
                        self.halt(&reason);
                        SessionError::Internal(reason)
                    })
                } else {
                    Err(SessionError::SessionNotFound)
                };
                let _ = reply.send(result);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.machine.snapshot());
            }
            Command::Schedule {
                plan,
                expression,
                reply,
            } => {
                let result = plan
                    .validate()
                    .and_then(|_| self.schedules.add(&plan, &expression, self.clock.now()));
                let _ = reply.send(result);
            }
            Command::CancelSchedule { id, reply } => {
                let _ = reply.send(self.schedules.remove(&id));
            }
            Command::ListSchedules { reply } => {
                let _ = reply.send(self.schedules.list());
            }
            Command::Shutdown { reply } => {
                // Handled by the run loop
                let _ = reply.send(());
            }
        }
    }

    fn start(&mut self, plan: TrainingPlan) -> Result<(), SessionError> {
        plan.validate()?;

        if self.machine.state().is_active() {
            info!(plan = %plan.name, "Replacing the active session");
        }
        if let Some(id) = self.schedules.claim(&plan.name, self.clock.now()) {
            debug!(schedule = %id, "Start claims a scheduled workout");
        }

        self.stop_heartbeat();
        self.ticks_since_checkpoint = 0;
        self.apply(SessionEvent::Start(plan));
        Ok(())
    }

    fn tick(&mut self) {
        self.apply(SessionEvent::Tick);

        if matches!(self.machine.state(), SessionState::InProgress { .. }) {
            self.ticks_since_checkpoint += 1;
            if self.ticks_since_checkpoint >= self.config.checkpoint_every_ticks {
                self.ticks_since_checkpoint = 0;
                self.write_checkpoint();
            }
        }
    }

    fn connection_changed(&mut self, status: &ConnectionStatus) {
        match status {
            s if s.is_link_down() => {
                if matches!(self.machine.state(), SessionState::InProgress { .. }) {
                    info!(status = ?s, "Pausing session for lost sensor");
                    self.apply(SessionEvent::Pause(PauseReason::ConnectionLost));
                }
            }
            ConnectionStatus::Connected { .. } => {
                self.apply(SessionEvent::Resume(ResumeTrigger::Reconnected));
            }
            _ => {}
        }
    }

    fn apply(&mut self, event: SessionEvent) {
        let effects = self.machine.handle(event);
        for effect in effects {
            self.perform(effect);
        }
        self.sync_heartbeat();
    }

    fn perform(&mut self, effect: SessionEffect) {
        match effect {
            SessionEffect::Notify(event) => self.notifier.notify(event),
            SessionEffect::Completed(summary) => {
                self.stop_heartbeat();
                if let Err(e) = self.store.clear() {
                    warn!(error = %e, "Failed to remove checkpoint");
                }
                if let Err(e) = self.store.save_summary(&summary) {
                    warn!(error = %e, "Failed to save session summary");
                }
            }
        }
    }

    /// Run the heartbeat exactly while a session is in progress
    fn sync_heartbeat(&mut self) {
        let running = matches!(self.machine.state(), SessionState::InProgress { .. });
        match (running, self.heartbeat.is_some()) {
            (true, false) => self.start_heartbeat(),
            (false, true) => self.stop_heartbeat(),
            _ => {}
        }
    }

    fn start_heartbeat(&mut self) {
        self.generation += 1;
        let generation = self.generation;
        let token = self.cancel.child_token();
        self.heartbeat = Some(token.clone());

        let ticks = self.ticks.clone();
        let period = self.config.tick_interval();
        debug!(generation, period_ms = period.as_millis() as u64, "Heartbeat started");

        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        if ticks.send(generation).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }

    fn stop_heartbeat(&mut self) {
        if let Some(token) = self.heartbeat.take() {
            token.cancel();
            self.generation += 1;
            debug!("Heartbeat stopped");
        }
    }

    /// Drop a session whose state can no longer be trusted. The last
    /// checkpoint stays on disk.
    fn halt(&mut self, reason: &str) {
        error!(reason, state = %self.machine.state(), "Halting session");
        self.stop_heartbeat();
        self.machine = SessionMachine::new(self.config.deviation_debounce_ticks);
    }

    fn write_checkpoint(&self) {
        let Some(checkpoint) = Checkpoint::capture(&self.machine, self.clock.now()) else {
            return;
        };
        if let Err(e) = self.store.save(&checkpoint) {
            warn!(error = %e, "Checkpoint write failed");
        }
    }

    fn poll_schedules(&mut self) {
        for update in self.schedules.poll(self.clock.now()) {
            match update {
                ScheduleUpdate::Fired { id, plan_name } => {
                    info!(schedule = %id, plan = %plan_name, "Scheduled workout ready");
                    self.notifier
                        .notify(NotificationEvent::WorkoutReady { plan_name });
                }
                ScheduleUpdate::Skipped { id, plan_name } => {
                    info!(schedule = %id, plan = %plan_name, "Scheduled workout skipped");
                }
            }
        }
    }
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::scheduler::AttemptStatus;
    use crate::fanout::FanOut;
    use crate::models::{Zone, ZoneDeviation};
    use crate::notification::RecordingNotifier;
    use crate::training_plan::{PlanTemplates, TrainingPhase};
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Harness {
        executor: SessionExecutor,
        measurements: FanOut<FilteredMeasurement>,
        status: FanOut<ConnectionStatus>,
        recorder: RecordingNotifier,
        store: CheckpointStore,
        _dir: TempDir,
    }

    fn store_in(dir: &TempDir) -> CheckpointStore {
        CheckpointStore::new(
            dir.path().join("checkpoint.json"),
            dir.path().join("last_session.json"),
        )
    }

    fn start_with(dir: TempDir) -> Harness {
        let store = store_in(&dir);
        let measurements = FanOut::new(100);
        let status = FanOut::new(100);
        let recorder = RecordingNotifier::new();
        let cancel = CancellationToken::new();
        let notifier = Notifier::spawn(Arc::new(recorder.clone()), cancel.clone());

        let executor = SessionExecutor::spawn(
            SessionConfig::default(),
            store.clone(),
            measurements.subscribe(),
            status.subscribe(),
            notifier,
            cancel,
        );

        Harness {
            executor,
            measurements,
            status,
            recorder,
            store,
            _dir: dir,
        }
    }

    fn start() -> Harness {
        start_with(TempDir::new().unwrap())
    }

    fn plan(phases: Vec<TrainingPhase>) -> TrainingPlan {
        TrainingPlan {
            name: "Test".to_string(),
            phases,
            created_at: Utc::now(),
            max_hr: 200,
        }
    }

    fn measurement(bpm: u16) -> FilteredMeasurement {
        FilteredMeasurement {
            raw_bpm: bpm,
            filtered_bpm: bpm as f64,
            confidence: None,
            rmssd_ms: None,
            timestamp: Utc::now(),
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    async fn seconds(n: u64) {
        tokio::time::sleep(Duration::from_secs(n)).await;
        settle().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_based_plan_completes() {
        let h = start();
        h.executor
            .start_session(plan(vec![
                TrainingPhase::timed("A", Zone::Zone2, 3),
                TrainingPhase::timed("B", Zone::Zone3, 2),
            ]))
            .await
            .unwrap();

        seconds(6).await;

        let snapshot = h.executor.snapshot().await.unwrap();
        assert_eq!(snapshot.state, "completed");
        assert_eq!(snapshot.total_elapsed_secs, 5);

        let summary = h.store.load_summary().unwrap().unwrap();
        assert_eq!(summary.phases_completed, 2);
        assert_eq!(summary.total_elapsed_secs, 5);
        assert!(h.store.load().unwrap().is_none());

        let transitions = h
            .recorder
            .count_matching(|e| matches!(e, NotificationEvent::PhaseTransition { .. }));
        assert_eq!(transitions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_plan_rejected() {
        let h = start();
        let err = h.executor.start_session(plan(vec![])).await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidPlan(_)));
        assert_eq!(h.executor.snapshot().await.unwrap().state, "idle");
    }

    #[tokio::test(start_paused = true)]
    async fn test_commands_without_session() {
        let h = start();
        assert_eq!(
            h.executor.pause_session().await,
            Err(SessionError::SessionNotFound)
        );
        assert_eq!(
            h.executor.resume_session().await,
            Err(SessionError::SessionNotFound)
        );
        assert_eq!(
            h.executor.stop_session().await,
            Err(SessionError::SessionNotFound)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_checkpoint_every_ten_ticks() {
        let h = start();
        h.executor
            .start_session(PlanTemplates::tempo_run(180))
            .await
            .unwrap();

        seconds(9).await;
        assert!(h.store.load().unwrap().is_none());

        seconds(1).await;
        let checkpoint = h.store.load().unwrap().unwrap();
        assert_eq!(checkpoint.state, "in_progress");
        assert_eq!(checkpoint.phase_index, 0);
        assert_eq!(checkpoint.elapsed_secs, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restores_recent_checkpoint() {
        let dir = TempDir::new().unwrap();
        store_in(&dir)
            .save(&Checkpoint {
                plan: PlanTemplates::tempo_run(180),
                state: "in_progress".to_string(),
                phase_index: 1,
                elapsed_secs: 300,
                last_checkpoint: Utc::now() - chrono::Duration::minutes(59),
            })
            .unwrap();

        let h = start_with(dir);
        let snapshot = h.executor.snapshot().await.unwrap();
        assert_eq!(snapshot.state, "in_progress");
        assert_eq!(snapshot.phase_index, Some(1));
        assert_eq!(snapshot.phase_elapsed_secs, 300);

        // The heartbeat resumes
        seconds(2).await;
        assert_eq!(h.executor.snapshot().await.unwrap().phase_elapsed_secs, 302);
    }

    #[tokio::test(start_paused = true)]
    async fn test_discards_stale_checkpoint() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store
            .save(&Checkpoint {
                plan: PlanTemplates::tempo_run(180),
                state: "in_progress".to_string(),
                phase_index: 1,
                elapsed_secs: 300,
                last_checkpoint: Utc::now() - chrono::Duration::minutes(61),
            })
            .unwrap();

        let h = start_with(dir);
        assert_eq!(h.executor.snapshot().await.unwrap().state, "idle");
        assert!(!store.checkpoint_path().exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_measurements_drive_deviation() {
        let h = start();
        h.executor
            .start_session(plan(vec![TrainingPhase::timed("Tempo", Zone::Zone3, 600)]))
            .await
            .unwrap();

        h.measurements.publish(measurement(110));
        seconds(6).await;

        let events = h.recorder.events();
        assert_eq!(
            events,
            vec![NotificationEvent::ZoneDeviation {
                deviation: ZoneDeviation::TooLow,
                current_bpm: 110,
                target_zone: Zone::Zone3,
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_loss_pauses_and_reconnect_resumes() {
        let h = start();
        h.executor
            .start_session(PlanTemplates::tempo_run(180))
            .await
            .unwrap();
        seconds(3).await;

        h.status.publish(ConnectionStatus::Reconnecting {
            attempt: 1,
            max_attempts: 5,
        });
        settle().await;
        let snapshot = h.executor.snapshot().await.unwrap();
        assert_eq!(snapshot.state, "paused");
        assert_eq!(snapshot.pause_reason, Some(PauseReason::ConnectionLost));

        // No progress while paused
        seconds(5).await;
        assert_eq!(h.executor.snapshot().await.unwrap().phase_elapsed_secs, 3);

        h.status.publish(ConnectionStatus::Connected {
            device_id: "SIM-HR-0001".to_string(),
        });
        settle().await;
        assert_eq!(h.executor.snapshot().await.unwrap().state, "in_progress");
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_does_not_resume_user_pause() {
        let h = start();
        h.executor
            .start_session(PlanTemplates::tempo_run(180))
            .await
            .unwrap();
        h.executor.pause_session().await.unwrap();

        h.status.publish(ConnectionStatus::Disconnected);
        h.status.publish(ConnectionStatus::Connected {
            device_id: "SIM-HR-0001".to_string(),
        });
        settle().await;

        let snapshot = h.executor.snapshot().await.unwrap();
        assert_eq!(snapshot.state, "paused");
        assert_eq!(snapshot.pause_reason, Some(PauseReason::User));

        h.executor.resume_session().await.unwrap();
        assert_eq!(h.executor.snapshot().await.unwrap().state, "in_progress");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_returns_summary() {
        let h = start();
        h.executor
            .start_session(PlanTemplates::tempo_run(180))
            .await
            .unwrap();
        h.measurements.publish(measurement(140));
        seconds(4).await;

        let summary = h.executor.stop_session().await.unwrap();
        assert!(summary.stopped_early);
        assert_eq!(summary.total_elapsed_secs, 4);
        assert_eq!(summary.avg_bpm, Some(140));
        assert_eq!(h.store.load_summary().unwrap(), Some(summary));
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_session_replaces_active_one() {
        let h = start();
        h.executor
            .start_session(PlanTemplates::tempo_run(180))
            .await
            .unwrap();
        seconds(5).await;

        h.executor
            .start_session(PlanTemplates::base_endurance(180))
            .await
            .unwrap();
        seconds(2).await;

        let snapshot = h.executor.snapshot().await.unwrap();
        assert_eq!(snapshot.plan_name.as_deref(), Some("Base Endurance"));
        // Only the new heartbeat drives the session
        assert_eq!(snapshot.phase_elapsed_secs, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_keeps_checkpoint() {
        let h = start();
        h.executor
            .start_session(PlanTemplates::tempo_run(180))
            .await
            .unwrap();
        seconds(3).await;

        h.executor.shutdown().await;
        let checkpoint = h.store.load().unwrap().unwrap();
        assert_eq!(checkpoint.elapsed_secs, 3);
        assert_eq!(
            h.executor.snapshot().await,
            Err(SessionError::ExecutorStopped)
        );
    }

    /// Advance until just after the first trigger of a schedule
    async fn until_fired(h: &Harness) {
        let listed = h.executor.scheduled_sessions().await.unwrap();
        let next_fire = listed[0].next_fire.unwrap();
        let wait = (next_fire - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        tokio::time::sleep(wait + Duration::from_secs(1)).await;
        settle().await;
    }

    async fn last_status(h: &Harness) -> AttemptStatus {
        let listed = h.executor.scheduled_sessions().await.unwrap();
        listed[0].last_attempt.as_ref().unwrap().status
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_workout_announced_then_skipped() {
        let h = start();
        let id = h
            .executor
            .schedule_session(PlanTemplates::tempo_run(180), "0 0 * * * *")
            .await
            .unwrap();

        until_fired(&h).await;
        assert_eq!(
            h.recorder
                .count_matching(|e| matches!(e, NotificationEvent::WorkoutReady { .. })),
            1
        );
        assert_eq!(h.executor.scheduled_sessions().await.unwrap()[0].id, id);
        assert_eq!(last_status(&h).await, AttemptStatus::Pending);

        seconds(600).await;
        assert_eq!(last_status(&h).await, AttemptStatus::Skipped);
        // Nothing was started automatically
        assert_eq!(h.executor.snapshot().await.unwrap().state, "idle");
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_claims_scheduled_workout() {
        let h = start();
        h.executor
            .schedule_session(PlanTemplates::tempo_run(180), "0 0 * * * *")
            .await
            .unwrap();
        until_fired(&h).await;

        h.executor
            .start_session(PlanTemplates::tempo_run(180))
            .await
            .unwrap();
        assert_eq!(last_status(&h).await, AttemptStatus::Started);
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_errors() {
        let h = start();
        let err = h
            .executor
            .schedule_session(PlanTemplates::tempo_run(180), "not a schedule")
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::InvalidSchedule { .. }));

        assert!(matches!(
            h.executor.cancel_schedule("missing").await,
            Err(SessionError::ScheduleNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_clock_catches_up_after_suspend() {
        // Runtime clock that missed an hour of wall time
        let mut clock = Clock::anchored(Utc::now() - chrono::Duration::hours(1));
        assert!(clock.resync());

        let drift = (Utc::now() - clock.now()).num_seconds().abs();
        assert!(drift <= 1, "drift {}s after resync", drift);
        assert!(!clock.resync());
    }

    #[tokio::test]
    async fn test_clock_ahead_of_system_is_kept() {
        let ahead = Utc::now() + chrono::Duration::hours(3);
        let mut clock = Clock::anchored(ahead);
        assert!(!clock.resync());
        assert!(clock.now() >= ahead);
    }
}
