use crate::domain::telemetry::LogType;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Highest output data rate the firmware accepts.
pub const MAX_LOG_RATE_HZ: u16 = 200;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_false")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_true")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_false(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_true(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

/// Which telemetry kinds are requested when logging starts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnabledLogs {
    #[serde(default)]
    pub quaternion_9axis: bool,
    #[serde(default)]
    pub quaternion_mag_accel: bool,
    #[serde(default)]
    pub linear_accel: bool,
    #[serde(default)]
    pub gyro_bias: bool,
    #[serde(default)]
    pub mag_raw: bool,
    #[serde(default = "default_true")]
    pub mag_autocal: bool,
    #[serde(default)]
    pub accel_raw: bool,
    #[serde(default = "default_true")]
    pub accel_autocal: bool,
    #[serde(default)]
    pub gyro_raw: bool,
    #[serde(default = "default_true")]
    pub gyro_autocal: bool,
    #[serde(default)]
    pub temperature: bool,
    #[serde(default)]
    pub pressure: bool,
}

impl Default for EnabledLogs {
    fn default() -> Self {
        Self {
            quaternion_9axis: false,
            quaternion_mag_accel: false,
            linear_accel: false,
            gyro_bias: false,
            mag_raw: false,
            mag_autocal: true,
            accel_raw: false,
            accel_autocal: true,
            gyro_raw: false,
            gyro_autocal: true,
            temperature: false,
            pressure: false,
        }
    }
}

impl EnabledLogs {
    /// The enabled kinds in wire order. Pressure is only included when at
    /// least one attached sensor can produce it.
    pub fn to_list(&self, include_pressure: bool) -> Vec<LogType> {
        let flags = [
            (self.mag_raw, LogType::MagRaw),
            (self.mag_autocal, LogType::MagAutocal),
            (self.accel_raw, LogType::AccelRaw),
            (self.accel_autocal, LogType::AccelAutocal),
            (self.gyro_raw, LogType::GyroRaw),
            (self.gyro_autocal, LogType::GyroAutocal),
            (self.quaternion_mag_accel, LogType::QuaternionMagAccel),
            (self.quaternion_9axis, LogType::Quaternion9Axis),
            (self.linear_accel, LogType::LinearAccel),
            (self.gyro_bias, LogType::GyroBias),
            (self.temperature, LogType::Temperature),
            (self.pressure && include_pressure, LogType::Pressure),
        ];

        flags
            .into_iter()
            .filter_map(|(enabled, log_type)| enabled.then_some(log_type))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,

    // Telemetry
    #[serde(default = "default_log_rate_hz")]
    pub log_rate_hz: u16,
    #[serde(default)]
    pub enabled_logs: EnabledLogs,

    // Connection Settings
    #[serde(default = "default_reconnect_timeout_secs")]
    pub reconnect_timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
    /// Resend cap for unacknowledged commands. `None` resends forever.
    #[serde(default)]
    pub max_command_retries: Option<u32>,
    #[serde(default = "default_battery_poll_interval_secs")]
    pub battery_poll_interval_secs: u64,
    #[serde(default = "default_rssi_poll_interval_ms")]
    pub rssi_poll_interval_ms: u64,

    // Scanning
    #[serde(default)]
    pub scan_serial_filter: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_settings: LogSettings::default(),
            log_rate_hz: default_log_rate_hz(),
            enabled_logs: EnabledLogs::default(),
            reconnect_timeout_secs: default_reconnect_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            response_timeout_ms: default_response_timeout_ms(),
            max_command_retries: None,
            battery_poll_interval_secs: default_battery_poll_interval_secs(),
            rssi_poll_interval_ms: default_rssi_poll_interval_ms(),
            scan_serial_filter: String::new(),
        }
    }
}

impl Settings {
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn reconnect_timeout(&self) -> Duration {
        Duration::from_secs(self.reconnect_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn battery_poll_interval(&self) -> Duration {
        Duration::from_secs(self.battery_poll_interval_secs)
    }

    pub fn rssi_poll_interval(&self) -> Duration {
        Duration::from_millis(self.rssi_poll_interval_ms)
    }

    /// Configured log rate, capped at the firmware maximum.
    pub fn capped_log_rate_hz(&self) -> u16 {
        self.log_rate_hz.min(MAX_LOG_RATE_HZ)
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "motion_sensor_logger".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}
fn default_log_rate_hz() -> u16 {
    30
}
fn default_reconnect_timeout_secs() -> u64 {
    60 * 10
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_response_timeout_ms() -> u64 {
    800
}
fn default_battery_poll_interval_secs() -> u64 {
    // The second generation firmware drops the link after 60 s of silence.
    20
}
fn default_rssi_poll_interval_ms() -> u64 {
    1000
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::from_file(settings_path))
    }

    /// Load settings from `path`, falling back to defaults when the file is
    /// missing or malformed.
    pub fn from_file(settings_path: PathBuf) -> Self {
        let settings = match Self::load_from_file(&settings_path) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::debug!(
                    "Using default settings ({}): {}",
                    settings_path.display(),
                    e
                );
                Settings::default()
            }
        };

        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("MotionSensorLogger");
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        Settings::from_json(&contents)
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }
}
