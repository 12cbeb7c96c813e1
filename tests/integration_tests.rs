use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use zonecoach::error::{ConnectionError, SessionError};
use zonecoach::executor::{Checkpoint, CheckpointStore};
use zonecoach::session::PauseReason;
use zonecoach::{
    AppConfig, CoachError, CoachService, ConnectionStatus, NotificationEvent, PlanTemplates,
    RecordingNotifier, ReconnectionPolicy, SimulatedSensor, SimulatedTransport, TrainingPhase,
    TrainingPlan, Zone,
};

/// End-to-end tests: simulated sensor -> connection manager -> executor

#[cfg(test)]
mod integration_tests {
    use super::*;

    const DEVICE: &str = "SIM-HR-0001";

    struct Coach {
        service: CoachService,
        transport: Arc<SimulatedTransport>,
        recorder: RecordingNotifier,
        store: CheckpointStore,
        _dir: TempDir,
    }

    fn config_in(dir: &TempDir) -> AppConfig {
        let mut config = AppConfig::default();
        config.storage.data_dir = dir.path().to_path_buf();
        config
    }

    fn start_coach(sensor: SimulatedSensor, config: AppConfig, dir: TempDir) -> Coach {
        let transport = Arc::new(SimulatedTransport::new(sensor));
        let recorder = RecordingNotifier::new();
        let store = CheckpointStore::from_config(&config.storage);
        let service =
            CoachService::start(config, transport.clone(), Arc::new(recorder.clone())).unwrap();

        Coach {
            service,
            transport,
            recorder,
            store,
            _dir: dir,
        }
    }

    fn steady_coach(bpm: u16) -> Coach {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);
        start_coach(SimulatedSensor::steady(bpm), config, dir)
    }

    async fn connected_coach(bpm: u16) -> Coach {
        let coach = steady_coach(bpm);
        let devices = coach.service.scan_devices().await.unwrap();
        assert_eq!(devices[0].id, DEVICE);
        coach.service.connect_device(DEVICE).await.unwrap();
        coach
    }

    fn short_plan() -> TrainingPlan {
        TrainingPlan {
            name: "Short".to_string(),
            phases: vec![
                TrainingPhase::timed("Warmup", Zone::Zone2, 5),
                TrainingPhase::timed("Work", Zone::Zone3, 5),
            ],
            created_at: Utc::now(),
            max_hr: 200,
        }
    }

    async fn advance(duration: Duration) {
        tokio::time::sleep(duration).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    async fn state(coach: &Coach) -> String {
        coach.service.session_snapshot().await.unwrap().state
    }

    /// A full session: scan, connect, stream, complete, persist the summary
    #[tokio::test(start_paused = true)]
    async fn test_session_runs_to_completion() {
        let coach = connected_coach(150).await;
        coach.service.start_session(short_plan()).await.unwrap();

        advance(Duration::from_secs(11)).await;

        assert_eq!(state(&coach).await, "completed");
        let summary = coach.store.load_summary().unwrap().unwrap();
        assert_eq!(summary.plan_name, "Short");
        assert_eq!(summary.phases_completed, 2);
        assert_eq!(summary.total_elapsed_secs, 10);
        assert!(!summary.stopped_early);
        assert!(summary.avg_bpm.is_some());
        assert!(coach.store.load().unwrap().is_none());

        assert_eq!(
            coach
                .recorder
                .count_matching(|e| matches!(e, NotificationEvent::PhaseTransition { .. })),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_measurements_reach_subscribers() {
        let coach = connected_coach(150).await;
        let mut measurements = coach.service.subscribe_filtered_measurements();

        advance(Duration::from_secs(3)).await;
        let m = measurements.recv().await.unwrap();
        assert_eq!(m.raw_bpm, 150);
        // One RR interval per frame is not enough for RMSSD
        assert!(m.rmssd_ms.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_drop_pauses_then_reconnect_resumes() {
        let coach = connected_coach(150).await;
        coach
            .service
            .start_session(PlanTemplates::tempo_run(200))
            .await
            .unwrap();
        advance(Duration::from_secs(3)).await;

        coach.transport.drop_link();
        advance(Duration::from_millis(100)).await;

        let snapshot = coach.service.session_snapshot().await.unwrap();
        assert_eq!(snapshot.state, "paused");
        assert_eq!(snapshot.pause_reason, Some(PauseReason::ConnectionLost));
        assert_eq!(snapshot.phase_elapsed_secs, 3);

        // First retry after 1s
        advance(Duration::from_secs(2)).await;
        assert_eq!(state(&coach).await, "in_progress");
        assert!(matches!(
            coach.service.connection_status().await.unwrap(),
            ConnectionStatus::Connected { .. }
        ));
        assert_eq!(
            coach
                .recorder
                .count_matching(|e| *e == NotificationEvent::ConnectionLost),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_user_pause_survives_reconnection() {
        let coach = connected_coach(150).await;
        coach
            .service
            .start_session(PlanTemplates::tempo_run(200))
            .await
            .unwrap();
        advance(Duration::from_secs(2)).await;

        coach.service.pause_session().await.unwrap();
        coach.transport.drop_link();
        advance(Duration::from_secs(5)).await;

        assert!(matches!(
            coach.service.connection_status().await.unwrap(),
            ConnectionStatus::Connected { .. }
        ));
        let snapshot = coach.service.session_snapshot().await.unwrap();
        assert_eq!(snapshot.state, "paused");
        assert_eq!(snapshot.pause_reason, Some(PauseReason::User));

        coach.service.resume_session().await.unwrap();
        assert_eq!(state(&coach).await, "in_progress");
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_gives_up_then_manual_retry() {
        let dir = TempDir::new().unwrap();
        let mut config = config_in(&dir);
        config.reconnection = ReconnectionPolicy {
            max_attempts: 3,
            ..ReconnectionPolicy::default()
        };
        let coach = start_coach(SimulatedSensor::steady(150), config, dir);
        coach.service.connect_device(DEVICE).await.unwrap();
        coach
            .service
            .start_session(PlanTemplates::tempo_run(200))
            .await
            .unwrap();
        advance(Duration::from_secs(2)).await;

        coach.transport.fail_next_connects(10);
        coach.transport.drop_link();
        // Backoff of 1s, 2s and 4s
        advance(Duration::from_secs(20)).await;

        assert!(matches!(
            coach.service.connection_status().await.unwrap(),
            ConnectionStatus::ReconnectFailed { .. }
        ));
        assert_eq!(coach.transport.connect_attempts(), 4);
        let snapshot = coach.service.session_snapshot().await.unwrap();
        assert_eq!(snapshot.state, "paused");
        assert_eq!(snapshot.phase_elapsed_secs, 2);

        coach.transport.fail_next_connects(0);
        coach.service.retry_connection().await.unwrap();
        advance(Duration::from_millis(100)).await;
        assert_eq!(state(&coach).await, "in_progress");
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_connect_survives_transient_failure() {
        let coach = steady_coach(150);
        let mut status = coach.service.subscribe_connection_status();
        coach.transport.fail_next_connects(1);

        coach.service.connect_device(DEVICE).await.unwrap();

        assert_eq!(coach.transport.connect_attempts(), 2);
        assert!(coach.transport.is_connected());
        assert!(matches!(
            coach.service.connection_status().await.unwrap(),
            ConnectionStatus::Connected { .. }
        ));
        let mut seen = Vec::new();
        while let Some(update) = status.try_recv() {
            seen.push(update);
        }
        assert!(seen.contains(&ConnectionStatus::Reconnecting {
            attempt: 1,
            max_attempts: 5
        }));
        // Nothing had been connected yet, so nothing was lost
        assert_eq!(
            coach
                .recorder
                .count_matching(|e| *e == NotificationEvent::ConnectionLost),
            0
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_reconnect_settles_disconnected() {
        let coach = connected_coach(150).await;
        coach.transport.fail_next_connects(100);
        coach.transport.drop_link();
        advance(Duration::from_millis(1500)).await;

        coach.service.cancel_reconnect().await.unwrap();
        let attempts = coach.transport.connect_attempts();
        assert_eq!(
            coach.service.connection_status().await.unwrap(),
            ConnectionStatus::Disconnected
        );

        advance(Duration::from_secs(60)).await;
        assert_eq!(coach.transport.connect_attempts(), attempts);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_returns_summary() {
        let coach = connected_coach(150).await;
        coach
            .service
            .start_session(PlanTemplates::tempo_run(200))
            .await
            .unwrap();
        advance(Duration::from_secs(30)).await;

        let summary = coach.service.stop_session().await.unwrap();
        assert!(summary.stopped_early);
        assert_eq!(summary.phases_completed, 0);
        assert_eq!(summary.total_elapsed_secs, 30);
        assert_eq!(
            summary.time_in_zone.iter().sum::<u32>() + summary.time_below_zones,
            30
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_restores_checkpoint_on_startup() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);
        CheckpointStore::from_config(&config.storage)
            .save(&Checkpoint {
                plan: PlanTemplates::tempo_run(200),
                state: "in_progress".to_string(),
                phase_index: 2,
                elapsed_secs: 120,
                last_checkpoint: Utc::now() - chrono::Duration::minutes(59),
            })
            .unwrap();

        let coach = start_coach(SimulatedSensor::steady(150), config, dir);
        let snapshot = coach.service.session_snapshot().await.unwrap();
        assert_eq!(snapshot.state, "in_progress");
        assert_eq!(snapshot.phase_index, Some(2));
        assert_eq!(snapshot.phase_name.as_deref(), Some("Cooldown"));
        assert_eq!(snapshot.phase_remaining_secs, Some(480));
    }

    #[tokio::test(start_paused = true)]
    async fn test_caller_errors() {
        let coach = steady_coach(150);

        let mut empty = short_plan();
        empty.phases.clear();
        assert!(matches!(
            coach.service.start_session(empty).await,
            Err(CoachError::Session(SessionError::InvalidPlan(_)))
        ));
        assert!(matches!(
            coach.service.pause_session().await,
            Err(CoachError::Session(SessionError::SessionNotFound))
        ));
        assert!(matches!(
            coach
                .service
                .schedule_session(short_plan(), "sometime soon")
                .await,
            Err(CoachError::Session(SessionError::InvalidSchedule { .. }))
        ));
        // An unknown sensor is retried with backoff before the caller hears
        assert!(matches!(
            coach.service.connect_device("SIM-HR-9999").await,
            Err(CoachError::Connection(ConnectionError::ReconnectFailed { attempts: 5, .. }))
        ));
        assert_eq!(coach.transport.connect_attempts(), 6);
        // Retry targets the last requested device
        assert!(matches!(
            coach.service.retry_connection().await,
            Err(CoachError::Connection(ConnectionError::ReconnectFailed { .. }))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_config_rejected() {
        let dir = TempDir::new().unwrap();
        let mut config = config_in(&dir);
        config.session.tick_interval_ms = 0;

        let transport = Arc::new(SimulatedTransport::new(SimulatedSensor::manual()));
        let result = CoachService::start(config, transport, Arc::new(RecordingNotifier::new()));
        assert!(matches!(result, Err(CoachError::Configuration(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_subscriber_loses_oldest() {
        let dir = TempDir::new().unwrap();
        let mut config = config_in(&dir);
        config.connection.measurement_buffer = 4;
        let coach = start_coach(SimulatedSensor::steady(150), config, dir);
        coach.service.connect_device(DEVICE).await.unwrap();

        let mut slow = coach.service.subscribe_filtered_measurements();
        advance(Duration::from_secs(20)).await;

        assert!(slow.recv().await.is_some());
        assert!(slow.dropped() > 0);
        assert!(coach.service.dropped_measurements() >= slow.dropped());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_checkpoints_and_stops() {
        let coach = connected_coach(150).await;
        coach
            .service
            .start_session(PlanTemplates::tempo_run(200))
            .await
            .unwrap();
        advance(Duration::from_secs(4)).await;

        coach.service.shutdown().await;

        let checkpoint = coach.store.load().unwrap().unwrap();
        assert_eq!(checkpoint.elapsed_secs, 4);
        assert!(!coach.transport.is_connected());
        assert!(matches!(
            coach.service.start_session(short_plan()).await,
            Err(CoachError::Session(SessionError::ExecutorStopped))
        ));
        assert!(matches!(
            coach.service.connect_device(DEVICE).await,
            Err(CoachError::Connection(ConnectionError::ManagerStopped))
        ));
    }
}
