use std::fmt;
use std::time::Duration;

use super::ReconnectionPolicy;
use crate::models::{ConnectionStatus, DiscoveredDevice};

/// Lifecycle of the single sensor link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Scanning,
    Connecting { device_id: String },
    Connected { device_id: String },
    Streaming { device_id: String },
    Reconnecting { device_id: String, attempt: u8 },
    Disconnected,
}

impl ConnectionState {
    pub fn device_id(&self) -> Option<&str> {
        match self {
            ConnectionState::Connecting { device_id }
            | ConnectionState::Connected { device_id }
            | ConnectionState::Streaming { device_id }
            | ConnectionState::Reconnecting { device_id, .. } => Some(device_id),
            _ => None,
        }
    }

    /// True while a link exists or is being re-established
    pub fn holds_link(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connected { .. }
                | ConnectionState::Streaming { .. }
                | ConnectionState::Reconnecting { .. }
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Idle => write!(f, "idle"),
            ConnectionState::Scanning => write!(f, "scanning"),
            ConnectionState::Connecting { device_id } => write!(f, "connecting to {}", device_id),
            ConnectionState::Connected { device_id } => write!(f, "connected to {}", device_id),
            ConnectionState::Streaming { device_id } => write!(f, "streaming from {}", device_id),
            ConnectionState::Reconnecting { device_id, attempt } => {
                write!(f, "reconnecting to {} (attempt {})", device_id, attempt)
            }
            ConnectionState::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Inputs to the connectivity state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    StartScan,
    DeviceFound(DiscoveredDevice),
    Connect(String),
    /// A connect attempt succeeded
    Connected,
    StreamStarted,
    /// The link dropped without being asked to
    Disconnected,
    /// A connect attempt or the link failed
    Error(String),
    UserDisconnect,
    CancelReconnect,
    ManualRetry,
}

/// Work the owner of the state machine must carry out, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEffect {
    EmitStatus(ConnectionStatus),
    AttemptConnect { device_id: String },
    OpenStream { device_id: String },
    ScheduleRetry {
        device_id: String,
        attempt: u8,
        delay: Duration,
    },
    CancelRetry,
    TeardownLink,
    NotifyConnectionLost,
}

/// Result of feeding one event to the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub state: ConnectionState,
    pub effects: Vec<ConnectionEffect>,
}

impl Transition {
    fn to(state: ConnectionState, effects: Vec<ConnectionEffect>) -> Self {
        Self { state, effects }
    }

    fn unchanged(state: &ConnectionState) -> Self {
        Self {
            state: state.clone(),
            effects: Vec::new(),
        }
    }
}

/// Compute the next state and the effects to perform.
///
/// Events that make no sense in the current state leave it unchanged.
pub fn transition(
    state: &ConnectionState,
    event: ConnectionEvent,
    policy: &ReconnectionPolicy,
) -> Transition {
    use ConnectionEffect as Fx;
    use ConnectionState as S;

    match (state, event) {
        (S::Idle | S::Disconnected, ConnectionEvent::StartScan) => {
            Transition::to(S::Scanning, Vec::new())
        }

        (S::Scanning, ConnectionEvent::DeviceFound(_)) => Transition::unchanged(state),

        // A new link always replaces the existing one
        (current, ConnectionEvent::Connect(device_id)) => {
            let mut effects = Vec::new();
            match current {
                S::Reconnecting { .. } => {
                    effects.push(Fx::CancelRetry);
                    effects.push(Fx::TeardownLink);
                }
                S::Connecting { .. } | S::Connected { .. } | S::Streaming { .. } => {
                    effects.push(Fx::TeardownLink);
                }
                _ => {}
            }
            effects.push(Fx::EmitStatus(ConnectionStatus::Connecting));
            effects.push(Fx::AttemptConnect {
                device_id: device_id.clone(),
            });
            Transition::to(S::Connecting { device_id }, effects)
        }

        (S::Connecting { device_id } | S::Reconnecting { device_id, .. }, ConnectionEvent::Connected) => {
            Transition::to(
                S::Connected {
                    device_id: device_id.clone(),
                },
                vec![
                    Fx::EmitStatus(ConnectionStatus::Connected {
                        device_id: device_id.clone(),
                    }),
                    Fx::OpenStream {
                        device_id: device_id.clone(),
                    },
                ],
            )
        }

        // A failed first attempt goes through the same backoff as a lost link
        (S::Connecting { device_id }, ConnectionEvent::Error(reason)) => {
            first_attempt_failed(device_id, reason, policy)
        }

        (S::Connecting { device_id }, ConnectionEvent::Disconnected) => {
            first_attempt_failed(device_id, "link dropped".to_string(), policy)
        }

        (S::Scanning, ConnectionEvent::Error(_)) => Transition::to(S::Idle, Vec::new()),

        (S::Connected { device_id }, ConnectionEvent::StreamStarted) => Transition::to(
            S::Streaming {
                device_id: device_id.clone(),
            },
            Vec::new(),
        ),

        (
            S::Connected { device_id } | S::Streaming { device_id },
            ConnectionEvent::Disconnected | ConnectionEvent::Error(_),
        ) => Transition::to(
            S::Reconnecting {
                device_id: device_id.clone(),
                attempt: 1,
            },
            vec![
                Fx::TeardownLink,
                Fx::EmitStatus(ConnectionStatus::Reconnecting {
                    attempt: 1,
                    max_attempts: policy.max_attempts,
                }),
                Fx::NotifyConnectionLost,
                Fx::ScheduleRetry {
                    device_id: device_id.clone(),
                    attempt: 1,
                    delay: policy.delay(1),
                },
            ],
        ),

        (S::Reconnecting { device_id, attempt }, ConnectionEvent::Error(reason)) => {
            reconnect_failed(device_id, *attempt, reason, policy)
        }

        (S::Reconnecting { device_id, attempt }, ConnectionEvent::Disconnected) => {
            reconnect_failed(device_id, *attempt, "link dropped".to_string(), policy)
        }

        (S::Reconnecting { .. }, ConnectionEvent::CancelReconnect) => Transition::to(
            S::Disconnected,
            vec![
                Fx::CancelRetry,
                Fx::TeardownLink,
                Fx::EmitStatus(ConnectionStatus::Disconnected),
            ],
        ),

        (S::Idle, ConnectionEvent::UserDisconnect) => Transition::unchanged(state),

        (S::Scanning, ConnectionEvent::UserDisconnect) => Transition::to(S::Idle, Vec::new()),

        (_, ConnectionEvent::UserDisconnect) => Transition::to(
            S::Disconnected,
            vec![
                Fx::CancelRetry,
                Fx::TeardownLink,
                Fx::EmitStatus(ConnectionStatus::Disconnected),
            ],
        ),

        (S::Disconnected | S::Idle, ConnectionEvent::ManualRetry) => {
            Transition::to(S::Scanning, Vec::new())
        }

        _ => Transition::unchanged(state),
    }
}

fn first_attempt_failed(device_id: &str, reason: String, policy: &ReconnectionPolicy) -> Transition {
    let mut t = reconnect_failed(device_id, 0, reason, policy);
    if t.effects.first() != Some(&ConnectionEffect::TeardownLink) {
        t.effects.insert(0, ConnectionEffect::TeardownLink);
    }
    t
}

fn reconnect_failed(
    device_id: &str,
    attempt: u8,
    reason: String,
    policy: &ReconnectionPolicy,
) -> Transition {
    let next = attempt.saturating_add(1);
    if next > policy.max_attempts {
        return Transition::to(
            ConnectionState::Disconnected,
            vec![
                ConnectionEffect::TeardownLink,
                ConnectionEffect::EmitStatus(ConnectionStatus::ReconnectFailed {
                    reason: format!("gave up after {} attempts: {}", attempt, reason),
                }),
            ],
        );
    }

    Transition::to(
        ConnectionState::Reconnecting {
            device_id: device_id.to_string(),
            attempt: next,
        },
        vec![
            ConnectionEffect::EmitStatus(ConnectionStatus::Reconnecting {
                attempt: next,
                max_attempts: policy.max_attempts,
            }),
            ConnectionEffect::ScheduleRetry {
                device_id: device_id.to_string(),
                attempt: next,
                delay: policy.delay(next),
            },
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(
        mut state: ConnectionState,
        events: Vec<ConnectionEvent>,
        policy: &ReconnectionPolicy,
    ) -> (ConnectionState, Vec<ConnectionEffect>) {
        let mut all = Vec::new();
        for event in events {
            let t = transition(&state, event, policy);
            state = t.state;
            all.extend(t.effects);
        }
        (state, all)
    }

    fn streaming() -> ConnectionState {
        ConnectionState::Streaming {
            device_id: "hr-1".to_string(),
        }
    }

    #[test]
    fn test_happy_path() {
        let policy = ReconnectionPolicy::default();
        let (state, effects) = run(
            ConnectionState::Idle,
            vec![
                ConnectionEvent::StartScan,
                ConnectionEvent::DeviceFound(DiscoveredDevice {
                    id: "hr-1".to_string(),
                    name: None,
                    rssi: -60,
                }),
                ConnectionEvent::Connect("hr-1".to_string()),
                ConnectionEvent::Connected,
                ConnectionEvent::StreamStarted,
            ],
            &policy,
        );

        assert_eq!(state, streaming());
        assert_eq!(
            effects,
            vec![
                ConnectionEffect::EmitStatus(ConnectionStatus::Connecting),
                ConnectionEffect::AttemptConnect {
                    device_id: "hr-1".to_string()
                },
                ConnectionEffect::EmitStatus(ConnectionStatus::Connected {
                    device_id: "hr-1".to_string()
                }),
                ConnectionEffect::OpenStream {
                    device_id: "hr-1".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_link_loss_starts_reconnecting() {
        let policy = ReconnectionPolicy::default();
        let t = transition(&streaming(), ConnectionEvent::Disconnected, &policy);

        assert_eq!(
            t.state,
            ConnectionState::Reconnecting {
                device_id: "hr-1".to_string(),
                attempt: 1
            }
        );
        assert!(t.effects.contains(&ConnectionEffect::NotifyConnectionLost));
        assert!(t.effects.contains(&ConnectionEffect::ScheduleRetry {
            device_id: "hr-1".to_string(),
            attempt: 1,
            delay: Duration::from_secs(1),
        }));
    }

    #[test]
    fn test_retry_delays_follow_policy() {
        let policy = ReconnectionPolicy::default();
        let mut state = streaming();
        let mut delays = Vec::new();

        let t = transition(&state, ConnectionEvent::Disconnected, &policy);
        state = t.state;
        delays.extend(t.effects.iter().filter_map(|e| match e {
            ConnectionEffect::ScheduleRetry { delay, .. } => Some(delay.as_secs()),
            _ => None,
        }));

        for _ in 0..4 {
            let t = transition(&state, ConnectionEvent::Error("timeout".to_string()), &policy);
            state = t.state;
            delays.extend(t.effects.iter().filter_map(|e| match e {
                ConnectionEffect::ScheduleRetry { delay, .. } => Some(delay.as_secs()),
                _ => None,
            }));
        }

        assert_eq!(delays, vec![1, 2, 4, 8, 16]);
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let policy = ReconnectionPolicy {
            max_attempts: 3,
            ..ReconnectionPolicy::default()
        };
        let fail = || ConnectionEvent::Error("out of range".to_string());
        let (state, effects) = run(
            streaming(),
            vec![ConnectionEvent::Disconnected, fail(), fail(), fail()],
            &policy,
        );

        assert_eq!(state, ConnectionState::Disconnected);
        let retries = effects
            .iter()
            .filter(|e| matches!(e, ConnectionEffect::ScheduleRetry { .. }))
            .count();
        assert_eq!(retries, 3);
        assert!(matches!(
            effects.last(),
            Some(ConnectionEffect::EmitStatus(ConnectionStatus::ReconnectFailed { .. }))
        ));
    }

    #[test]
    fn test_reconnect_success() {
        let policy = ReconnectionPolicy::default();
        let state = ConnectionState::Reconnecting {
            device_id: "hr-1".to_string(),
            attempt: 2,
        };
        let t = transition(&state, ConnectionEvent::Connected, &policy);
        assert_eq!(
            t.state,
            ConnectionState::Connected {
                device_id: "hr-1".to_string()
            }
        );
    }

    #[test]
    fn test_cancel_reconnect_settles_disconnected() {
        let policy = ReconnectionPolicy::default();
        let state = ConnectionState::Reconnecting {
            device_id: "hr-1".to_string(),
            attempt: 2,
        };
        let t = transition(&state, ConnectionEvent::CancelReconnect, &policy);
        assert_eq!(t.state, ConnectionState::Disconnected);
        assert_eq!(t.effects[0], ConnectionEffect::CancelRetry);

        // Nothing to cancel elsewhere
        let t = transition(&streaming(), ConnectionEvent::CancelReconnect, &policy);
        assert_eq!(t.state, streaming());
        assert!(t.effects.is_empty());
    }

    #[test]
    fn test_connect_tears_down_existing_link() {
        let policy = ReconnectionPolicy::default();
        let t = transition(&streaming(), ConnectionEvent::Connect("hr-2".to_string()), &policy);
        assert_eq!(t.effects[0], ConnectionEffect::TeardownLink);
        assert_eq!(
            t.state,
            ConnectionState::Connecting {
                device_id: "hr-2".to_string()
            }
        );
    }

    #[test]
    fn test_initial_connect_failure_starts_reconnecting() {
        let policy = ReconnectionPolicy::default();
        let state = ConnectionState::Connecting {
            device_id: "hr-1".to_string(),
        };
        let t = transition(&state, ConnectionEvent::Error("refused".to_string()), &policy);
        assert_eq!(
            t.state,
            ConnectionState::Reconnecting {
                device_id: "hr-1".to_string(),
                attempt: 1
            }
        );
        assert_eq!(
            t.effects,
            vec![
                ConnectionEffect::TeardownLink,
                ConnectionEffect::EmitStatus(ConnectionStatus::Reconnecting {
                    attempt: 1,
                    max_attempts: 5
                }),
                ConnectionEffect::ScheduleRetry {
                    device_id: "hr-1".to_string(),
                    attempt: 1,
                    delay: Duration::from_secs(1),
                },
            ]
        );
        // Nothing was lost, so the athlete is not told about it
        assert!(!t.effects.contains(&ConnectionEffect::NotifyConnectionLost));
    }

    #[test]
    fn test_initial_connect_failure_without_retries_gives_up() {
        let policy = ReconnectionPolicy {
            max_attempts: 0,
            ..ReconnectionPolicy::default()
        };
        let state = ConnectionState::Connecting {
            device_id: "hr-1".to_string(),
        };
        let t = transition(&state, ConnectionEvent::Error("refused".to_string()), &policy);
        assert_eq!(t.state, ConnectionState::Disconnected);
        assert_eq!(t.effects[0], ConnectionEffect::TeardownLink);
        assert_eq!(
            t.effects
                .iter()
                .filter(|e| **e == ConnectionEffect::TeardownLink)
                .count(),
            1
        );
        assert!(matches!(
            t.effects.last(),
            Some(ConnectionEffect::EmitStatus(ConnectionStatus::ReconnectFailed { .. }))
        ));
    }

    #[test]
    fn test_failed_scan_returns_to_idle() {
        let policy = ReconnectionPolicy::default();
        let t = transition(
            &ConnectionState::Scanning,
            ConnectionEvent::Error("radio off".to_string()),
            &policy,
        );
        assert_eq!(t.state, ConnectionState::Idle);
        assert!(t.effects.is_empty());
    }

    #[test]
    fn test_manual_retry_rescans() {
        let policy = ReconnectionPolicy::default();
        let t = transition(&ConnectionState::Disconnected, ConnectionEvent::ManualRetry, &policy);
        assert_eq!(t.state, ConnectionState::Scanning);
    }

    #[test]
    fn test_user_disconnect() {
        let policy = ReconnectionPolicy::default();
        let t = transition(&streaming(), ConnectionEvent::UserDisconnect, &policy);
        assert_eq!(t.state, ConnectionState::Disconnected);
        assert!(t.effects.contains(&ConnectionEffect::TeardownLink));
        assert!(!t.effects.contains(&ConnectionEffect::NotifyConnectionLost));
    }
}
