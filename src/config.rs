use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::connectivity::ReconnectionPolicy;
use crate::error::CoachError;
use crate::logging::LogConfig;
use crate::signal::FilterConfig;
use crate::zones::ZoneCalculator;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Configuration metadata
    pub metadata: ConfigMetadata,

    /// Athlete physiology used to personalise plans
    pub athlete: AthleteSettings,

    /// Heart rate filter tuning
    pub filter: FilterConfig,

    /// Automatic reconnection backoff
    pub reconnection: ReconnectionPolicy,

    /// Sensor link settings
    pub connection: ConnectionConfig,

    /// Session loop timing
    pub session: SessionConfig,

    /// Where checkpoints and summaries are kept
    pub storage: StorageConfig,

    /// Logging output
    pub logging: LogConfig,
}

/// Configuration metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigMetadata {
    /// Configuration format version
    pub version: String,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last modification timestamp
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AthleteSettings {
    /// Maximum heart rate in bpm
    pub max_hr: u16,

    /// Age, used to estimate max HR when none was measured
    pub age: Option<u8>,
}

/// Sensor link settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Give up on a single connect attempt after this many seconds
    pub connect_timeout_secs: u64,

    /// Default scan length in seconds
    pub scan_duration_secs: u64,

    /// Fan-out buffer for measurements and status updates
    pub measurement_buffer: usize,

    /// Battery polling interval in seconds while streaming
    pub battery_poll_secs: u64,

    /// Battery percentage below which the athlete is warned
    pub low_battery_pct: u8,
}

/// Session loop timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Heartbeat period in milliseconds
    pub tick_interval_ms: u64,

    /// Write a checkpoint every N ticks
    pub checkpoint_every_ticks: u32,

    /// Checkpoints older than this are discarded on startup
    pub checkpoint_max_age_secs: u64,

    /// Ticks out of zone before a deviation is reported
    pub deviation_debounce_ticks: u32,

    /// How long a scheduled workout waits to be started
    pub start_window_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding the checkpoint and the last session summary
    pub data_dir: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        let now = Utc::now();

        AppConfig {
            metadata: ConfigMetadata {
                version: "1.0".to_string(),
                created_at: now,
                updated_at: now,
            },
            athlete: AthleteSettings::default(),
            filter: FilterConfig::default(),
            reconnection: ReconnectionPolicy::default(),
            connection: ConnectionConfig::default(),
            session: SessionConfig::default(),
            storage: StorageConfig::default(),
            logging: LogConfig::default(),
        }
    }
}

impl Default for ConfigMetadata {
    fn default() -> Self {
        let now = Utc::now();
        ConfigMetadata {
            version: "1.0".to_string(),
            created_at: now,
            updated_at: now,
        }
    }
}

impl Default for AthleteSettings {
    fn default() -> Self {
        AthleteSettings {
            max_hr: 180,
            age: None,
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            connect_timeout_secs: 15,
            scan_duration_secs: 5,
            measurement_buffer: crate::fanout::DEFAULT_CAPACITY,
            battery_poll_secs: 60,
            low_battery_pct: 15,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            tick_interval_ms: 1000,
            checkpoint_every_ticks: 10,
            checkpoint_max_age_secs: 60 * 60,
            deviation_debounce_ticks: 5,
            start_window_secs: 10 * 60,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            data_dir: AppConfig::default_data_dir(),
        }
    }
}

impl AthleteSettings {
    /// Configured max HR, or the age estimate when only age is known
    pub fn effective_max_hr(&self) -> u16 {
        match self.age {
            Some(age) if self.max_hr == 0 => {
                ZoneCalculator::estimate_max_hr_from_age(age).unwrap_or(self.max_hr)
            }
            _ => self.max_hr,
        }
    }
}

impl ConnectionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn scan_duration(&self) -> Duration {
        Duration::from_secs(self.scan_duration_secs)
    }

    pub fn battery_poll_interval(&self) -> Duration {
        Duration::from_secs(self.battery_poll_secs)
    }
}

impl SessionConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn checkpoint_max_age(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.checkpoint_max_age_secs as i64)
    }

    pub fn start_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.start_window_secs as i64)
    }
}

impl StorageConfig {
    pub fn checkpoint_path(&self) -> PathBuf {
        self.data_dir.join("checkpoint.json")
    }

    pub fn summary_path(&self) -> PathBuf {
        self.data_dir.join("last_session.json")
    }
}

/// Configuration management implementation
impl AppConfig {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: AppConfig =
            toml::from_str(&content).with_context(|| "Failed to parse TOML configuration")?;

        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        self.metadata.updated_at = Utc::now();

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let toml_content = toml::to_string_pretty(self)
            .with_context(|| "Failed to serialize configuration to TOML")?;

        fs::write(&path, toml_content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        Ok(())
    }

    /// Get default configuration file path
    pub fn default_config_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".zonecoach")
            .join("config.toml")
    }

    /// App-scoped data directory
    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .map(|dir| dir.join("zonecoach"))
            .unwrap_or_else(|| {
                dirs::home_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join(".zonecoach")
                    .join("data")
            })
    }

    /// Load `path`, or the defaults when no file exists there. A file that
    /// exists but does not parse is still an error.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::load_from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Reject settings the runtime cannot honour
    pub fn validate(&self) -> std::result::Result<(), CoachError> {
        let invalid = |msg: String| Err(CoachError::Configuration(msg));

        ZoneCalculator::validate_max_hr(self.athlete.effective_max_hr())
            .map_err(|e| CoachError::Configuration(e.to_string()))?;
        self.filter.validate().map_err(CoachError::Configuration)?;
        self.reconnection
            .validate()
            .map_err(CoachError::Configuration)?;

        if self.connection.connect_timeout_secs == 0 {
            return invalid("connection.connect_timeout_secs must be positive".to_string());
        }
        if self.connection.measurement_buffer == 0 {
            return invalid("connection.measurement_buffer must be positive".to_string());
        }
        if self.connection.battery_poll_secs == 0 {
            return invalid("connection.battery_poll_secs must be positive".to_string());
        }
        if self.connection.low_battery_pct > 100 {
            return invalid(format!(
                "connection.low_battery_pct must be a percentage, got {}",
                self.connection.low_battery_pct
            ));
        }
        if self.session.tick_interval_ms == 0 {
            return invalid("session.tick_interval_ms must be positive".to_string());
        }
        if self.session.checkpoint_every_ticks == 0 {
            return invalid("session.checkpoint_every_ticks must be positive".to_string());
        }
        if self.session.deviation_debounce_ticks == 0 {
            return invalid("session.deviation_debounce_ticks must be positive".to_string());
        }

        Ok(())
    }
}
