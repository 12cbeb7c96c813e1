//! Port to the wireless sensor link
//!
//! The radio stack lives outside this crate; anything that can scan, connect
//! and hand over raw Heart Rate Measurement frames can drive a session.

pub mod simulated;

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::ConnectionError;
use crate::models::DiscoveredDevice;

pub use simulated::{SimulatedSensor, SimulatedTransport};

/// Adapter for a heart rate sensor transport
///
/// Implementations manage at most one physical link; the connection manager
/// guarantees `disconnect` is called before a new `connect`.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Discover nearby sensors for the given duration
    async fn scan(&self, duration: Duration) -> Result<Vec<DiscoveredDevice>, ConnectionError>;

    async fn connect(&self, device_id: &str) -> Result<(), ConnectionError>;

    async fn disconnect(&self) -> Result<(), ConnectionError>;

    /// Raw measurement frames from the connected sensor.
    ///
    /// The receiver closes when the link drops.
    async fn subscribe_measurements(&self) -> Result<mpsc::Receiver<Vec<u8>>, ConnectionError>;

    /// Battery level in percent
    async fn read_battery(&self) -> Result<u8, ConnectionError>;
}
