use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Heart rate training zones by percentage of maximum heart rate
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Zone {
    /// 50-60% of max HR (recovery)
    Zone1,
    /// 60-70% of max HR (endurance)
    Zone2,
    /// 70-80% of max HR (aerobic)
    Zone3,
    /// 80-90% of max HR (threshold)
    Zone4,
    /// 90-100% of max HR (maximum)
    Zone5,
}

impl Zone {
    pub const ALL: [Zone; 5] = [Zone::Zone1, Zone::Zone2, Zone::Zone3, Zone::Zone4, Zone::Zone5];

    /// Zero-based index, used for per-zone histograms
    pub fn index(&self) -> usize {
        match self {
            Zone::Zone1 => 0,
            Zone::Zone2 => 1,
            Zone::Zone3 => 2,
            Zone::Zone4 => 3,
            Zone::Zone5 => 4,
        }
    }
}

impl fmt::Display for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Zone::Zone1 => write!(f, "Zone 1 (Recovery)"),
            Zone::Zone2 => write!(f, "Zone 2 (Endurance)"),
            Zone::Zone3 => write!(f, "Zone 3 (Aerobic)"),
            Zone::Zone4 => write!(f, "Zone 4 (Threshold)"),
            Zone::Zone5 => write!(f, "Zone 5 (Maximum)"),
        }
    }
}

/// A device found while scanning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    /// Platform-specific identifier (UUID or MAC address)
    pub id: String,

    /// Advertised name, if any
    pub name: Option<String>,

    /// Signal strength in dBm
    pub rssi: i16,
}

/// One decoded sensor frame, before validation and smoothing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMeasurement {
    /// Heart rate in beats per minute
    pub bpm: u16,

    /// Whether the sensor reports skin contact
    pub contact_detected: bool,

    /// RR intervals in 1/1024 second units
    pub rr_intervals: Vec<u16>,

    /// When the frame was decoded
    pub timestamp: DateTime<Utc>,
}

/// Validated and smoothed heart rate, broadcast to every subscriber
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilteredMeasurement {
    /// Heart rate as reported by the sensor
    pub raw_bpm: u16,

    /// Filter estimate in beats per minute
    pub filtered_bpm: f64,

    /// Filter confidence in [0, 1], higher is more settled
    pub confidence: Option<f64>,

    /// RMSSD over the frame's RR intervals, in milliseconds
    pub rmssd_ms: Option<f64>,

    pub timestamp: DateTime<Utc>,
}

impl FilteredMeasurement {
    /// Filtered value rounded to whole beats per minute
    pub fn bpm(&self) -> u16 {
        self.filtered_bpm.round().clamp(0.0, u16::MAX as f64) as u16
    }
}

/// Authoritative link status, broadcast on every connectivity transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// No link and no reconnection in progress
    Disconnected,

    /// Initial connection attempt in progress
    Connecting,

    /// Link established
    Connected { device_id: String },

    /// Automatic reconnection in progress
    Reconnecting { attempt: u8, max_attempts: u8 },

    /// Reconnection gave up; an explicit retry is required
    ReconnectFailed { reason: String },
}

impl ConnectionStatus {
    /// True when the link cannot deliver measurements
    pub fn is_link_down(&self) -> bool {
        matches!(
            self,
            ConnectionStatus::Disconnected
                | ConnectionStatus::Reconnecting { .. }
                | ConnectionStatus::ReconnectFailed { .. }
        )
    }
}

/// Position of the current heart rate relative to the target zone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ZoneDeviation {
    InZone,
    TooLow,
    TooHigh,
}

impl fmt::Display for ZoneDeviation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ZoneDeviation::InZone => write!(f, "in zone"),
            ZoneDeviation::TooLow => write!(f, "too low"),
            ZoneDeviation::TooHigh => write!(f, "too high"),
        }
    }
}

/// Statistics for a finished session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    /// Name of the executed plan
    pub plan_name: String,

    /// Seconds spent in progress, excluding pauses
    pub total_elapsed_secs: u32,

    /// Number of phases finished
    pub phases_completed: u32,

    /// Average heart rate over accepted measurements
    pub avg_bpm: Option<u16>,

    /// Highest heart rate over accepted measurements
    pub max_bpm: Option<u16>,

    /// Seconds spent in each zone, indexed Zone1..Zone5
    pub time_in_zone: [u32; 5],

    /// Seconds spent below Zone1
    pub time_below_zones: u32,

    /// True when the session was stopped before the last phase finished
    pub stopped_early: bool,

    pub finished_at: DateTime<Utc>,
}
