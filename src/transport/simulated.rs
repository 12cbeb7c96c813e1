use async_trait::async_trait;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::Transport;
use crate::error::ConnectionError;
use crate::models::DiscoveredDevice;

/// Contact supported and detected, RR intervals present
const SIMULATED_FLAGS: u8 = 0b0001_0110;

const FRAME_BUFFER: usize = 64;

/// Behaviour of the synthetic sensor
#[derive(Debug, Clone)]
pub struct SimulatedSensor {
    pub device: DiscoveredDevice,

    /// Heart rates emitted in order, repeating once exhausted
    pub profile: Vec<u16>,

    /// Time between frames; `None` emits nothing until frames are injected
    pub frame_interval: Option<Duration>,

    pub connect_latency: Duration,

    pub battery_pct: u8,
}

impl Default for SimulatedSensor {
    fn default() -> Self {
        Self {
            device: DiscoveredDevice {
                id: "SIM-HR-0001".to_string(),
                name: Some("Simulated HRM".to_string()),
                rssi: -55,
            },
            profile: vec![120, 124, 128, 131, 133, 134, 132, 130, 127, 125],
            frame_interval: Some(Duration::from_secs(1)),
            connect_latency: Duration::from_millis(50),
            battery_pct: 80,
        }
    }
}

impl SimulatedSensor {
    /// Sensor that holds a fixed heart rate
    pub fn steady(bpm: u16) -> Self {
        Self {
            profile: vec![bpm],
            ..Self::default()
        }
    }

    /// Sensor that only sends injected frames
    pub fn manual() -> Self {
        Self {
            frame_interval: None,
            ..Self::default()
        }
    }
}

#[derive(Debug, Default)]
struct LinkState {
    connected: Option<String>,
    frames: Option<mpsc::Sender<Vec<u8>>>,
    feeder: Option<CancellationToken>,
    failures_remaining: u32,
    connect_attempts: u32,
    battery_pct: u8,
    radio_off: bool,
}

/// Deterministic in-process sensor for the CLI and tests
#[derive(Debug)]
pub struct SimulatedTransport {
    sensor: SimulatedSensor,
    link: Mutex<LinkState>,
}

impl SimulatedTransport {
    pub fn new(sensor: SimulatedSensor) -> Self {
        let link = LinkState {
            battery_pct: sensor.battery_pct,
            ..LinkState::default()
        };
        Self {
            sensor,
            link: Mutex::new(link),
        }
    }

    /// Make the next `n` connect attempts fail
    pub fn fail_next_connects(&self, n: u32) {
        self.with_link(|link| link.failures_remaining = n);
    }

    pub fn connect_attempts(&self) -> u32 {
        self.with_link(|link| link.connect_attempts)
    }

    pub fn is_connected(&self) -> bool {
        self.with_link(|link| link.connected.is_some())
    }

    /// Switch the host radio off or back on. With the radio off, scans and
    /// connects fail and any open link drops.
    pub fn set_radio(&self, enabled: bool) {
        self.with_link(|link| {
            link.radio_off = !enabled;
            if !enabled {
                Self::close(link);
            }
        });
    }

    pub fn set_battery(&self, pct: u8) {
        self.with_link(|link| link.battery_pct = pct.min(100));
    }

    /// Drop the link as if the sensor went out of range
    pub fn drop_link(&self) {
        self.with_link(|link| {
            debug!("Simulated link dropped");
            Self::close(link);
        });
    }

    /// Deliver a raw frame on the open measurement stream.
    ///
    /// Returns false when no stream is open or its buffer is full.
    pub fn inject(&self, frame: Vec<u8>) -> bool {
        self.with_link(|link| match &link.frames {
            Some(tx) => tx.try_send(frame).is_ok(),
            None => false,
        })
    }

    /// Encode a heart rate the way the simulated sensor sends it
    pub fn frame_for(bpm: u16) -> Vec<u8> {
        let rr = (60.0 * 1024.0 / bpm.max(1) as f64).round() as u16;
        let mut frame = vec![SIMULATED_FLAGS];
        if bpm > u8::MAX as u16 {
            frame[0] |= 0x01;
            frame.extend_from_slice(&bpm.to_le_bytes());
        } else {
            frame.push(bpm as u8);
        }
        frame.extend_from_slice(&rr.to_le_bytes());
        frame
    }

    fn with_link<R>(&self, f: impl FnOnce(&mut LinkState) -> R) -> R {
        // A poisoned lock only means a test panicked mid-update
        let mut guard = match self.link.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    fn radio_check(&self) -> Result<(), ConnectionError> {
        if self.with_link(|link| link.radio_off) {
            return Err(ConnectionError::Transport("radio unavailable".to_string()));
        }
        Ok(())
    }

    fn close(link: &mut LinkState) {
        if let Some(token) = link.feeder.take() {
            token.cancel();
        }
        link.frames = None;
        link.connected = None;
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    async fn scan(&self, duration: Duration) -> Result<Vec<DiscoveredDevice>, ConnectionError> {
        self.radio_check()?;
        tokio::time::sleep(duration).await;
        Ok(vec![self.sensor.device.clone()])
    }

    async fn connect(&self, device_id: &str) -> Result<(), ConnectionError> {
        self.with_link(|link| link.connect_attempts += 1);
        tokio::time::sleep(self.sensor.connect_latency).await;

        self.radio_check()?;
        self.with_link(|link| {
            if link.failures_remaining > 0 {
                link.failures_remaining -= 1;
                return Err(ConnectionError::ConnectionFailed {
                    device_id: device_id.to_string(),
                    reason: "simulated failure".to_string(),
                });
            }
            if device_id != self.sensor.device.id {
                return Err(ConnectionError::ConnectionFailed {
                    device_id: device_id.to_string(),
                    reason: "device not found".to_string(),
                });
            }
            Self::close(link);
            link.connected = Some(device_id.to_string());
            Ok(())
        })
    }

    async fn disconnect(&self) -> Result<(), ConnectionError> {
        self.with_link(|link| {
            if link.connected.is_none() {
                return Err(ConnectionError::NotConnected);
            }
            Self::close(link);
            Ok(())
        })
    }

    async fn subscribe_measurements(&self) -> Result<mpsc::Receiver<Vec<u8>>, ConnectionError> {
        let (tx, rx) = mpsc::channel(FRAME_BUFFER);
        let token = CancellationToken::new();

        self.with_link(|link| {
            if link.connected.is_none() {
                return Err(ConnectionError::NotConnected);
            }
            if let Some(old) = link.feeder.replace(token.clone()) {
                old.cancel();
            }
            link.frames = Some(tx.clone());
            Ok(())
        })?;

        if let Some(interval) = self.sensor.frame_interval {
            let profile = if self.sensor.profile.is_empty() {
                vec![70]
            } else {
                self.sensor.profile.clone()
            };
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                for bpm in profile.iter().cycle() {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = ticker.tick() => {
                            if tx.send(Self::frame_for(*bpm)).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }

        Ok(rx)
    }

    async fn read_battery(&self) -> Result<u8, ConnectionError> {
        self.with_link(|link| {
            if link.connected.is_none() {
                return Err(ConnectionError::NotConnected);
            }
            Ok(link.battery_pct)
        })
    }
}
