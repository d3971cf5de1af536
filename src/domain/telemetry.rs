//! Telemetry Records
//!
//! Decoded log frames and the flattened records handed to export and
//! streaming collaborators.

use serde::{Deserialize, Serialize};
use std::fmt;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// The kinds of telemetry a sensor can stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LogType {
    #[serde(rename = "MAG_RAW")]
    MagRaw,
    #[serde(rename = "MAG_AUTOCAL")]
    MagAutocal,
    #[serde(rename = "ACCEL_RAW")]
    AccelRaw,
    #[serde(rename = "ACCEL_AUTOCAL")]
    AccelAutocal,
    #[serde(rename = "GYRO_RAW")]
    GyroRaw,
    #[serde(rename = "GYRO_AUTOCAL")]
    GyroAutocal,
    #[serde(rename = "Q_MAG_ACCEL")]
    QuaternionMagAccel,
    #[serde(rename = "Q_9AXIS")]
    Quaternion9Axis,
    #[serde(rename = "LINEAR_ACCEL")]
    LinearAccel,
    #[serde(rename = "GYRO_BIAS")]
    GyroBias,
    #[serde(rename = "TEMPERATURE")]
    Temperature,
    #[serde(rename = "TIMESTAMP_FULL")]
    TimestampFull,
    #[serde(rename = "PRESSURE")]
    Pressure,
}

impl LogType {
    pub const ALL: [LogType; 13] = [
        LogType::MagRaw,
        LogType::MagAutocal,
        LogType::AccelRaw,
        LogType::AccelAutocal,
        LogType::GyroRaw,
        LogType::GyroAutocal,
        LogType::QuaternionMagAccel,
        LogType::Quaternion9Axis,
        LogType::LinearAccel,
        LogType::GyroBias,
        LogType::Temperature,
        LogType::TimestampFull,
        LogType::Pressure,
    ];

    /// Name used in exported records.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MagRaw => "MAG_RAW",
            Self::MagAutocal => "MAG_AUTOCAL",
            Self::AccelRaw => "ACCEL_RAW",
            Self::AccelAutocal => "ACCEL_AUTOCAL",
            Self::GyroRaw => "GYRO_RAW",
            Self::GyroAutocal => "GYRO_AUTOCAL",
            Self::QuaternionMagAccel => "Q_MAG_ACCEL",
            Self::Quaternion9Axis => "Q_9AXIS",
            Self::LinearAccel => "LINEAR_ACCEL",
            Self::GyroBias => "GYRO_BIAS",
            Self::Temperature => "TEMPERATURE",
            Self::TimestampFull => "TIMESTAMP_FULL",
            Self::Pressure => "PRESSURE",
        }
    }
}

impl fmt::Display for LogType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of a decoded frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Sample {
    /// Three sensor axes. Raw kinds hold unscaled sensor counts.
    Axes { x: f32, y: f32, z: f32 },
    /// Unit quaternion, each component in [-1, 1].
    Quaternion { x: f32, y: f32, z: f32, w: f32 },
    /// Temperature in degrees or pressure in hPa.
    Scalar(f32),
    /// Upper 32 bits of the 64-bit microsecond clock.
    FullTimestamp { upper: u32 },
}

impl Sample {
    pub fn values(&self) -> Vec<f32> {
        match *self {
            Sample::Axes { x, y, z } => vec![x, y, z],
            Sample::Quaternion { x, y, z, w } => vec![x, y, z, w],
            Sample::Scalar(v) => vec![v],
            Sample::FullTimestamp { upper } => vec![upper as f32],
        }
    }
}

/// One decoded telemetry frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TelemetryFrame {
    pub log_type: LogType,
    /// Relative device time in microseconds, wraps at 32 bits.
    pub timestamp: u32,
    pub sample: Sample,
}

/// Telemetry observed by a Telemetry Service subscriber
#[derive(Debug, Clone)]
pub enum TelemetryEvent {
    /// The service finished its startup sequence.
    Started { device_id: String },
    /// A frame was decoded; `received_at` is the host clock at receipt.
    Frame {
        device_id: String,
        received_at: OffsetDateTime,
        frame: TelemetryFrame,
    },
}

/// A record in the merged downstream sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryRecord {
    pub device_id: String,
    pub type_tag: LogType,
    pub device_timestamp: u32,
    /// ISO 8601 host timestamp.
    pub host_timestamp: String,
    pub values: Vec<f32>,
}

impl TelemetryRecord {
    pub fn new(device_id: &str, received_at: OffsetDateTime, frame: &TelemetryFrame) -> Self {
        Self {
            device_id: device_id.to_string(),
            type_tag: frame.log_type,
            device_timestamp: frame.timestamp,
            host_timestamp: iso_timestamp(received_at),
            values: frame.sample.values(),
        }
    }
}

/// Sensor entry of an export header
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorHeader {
    pub firmware: String,
    pub serial_number: String,
}

/// Header describing a logging session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogHeader {
    pub sensors: Vec<SensorHeader>,
    pub app_ts: String,
}

/// Format a host time as RFC 3339 / ISO 8601.
pub fn iso_timestamp(at: OffsetDateTime) -> String {
    at.format(&Rfc3339)
        .unwrap_or_else(|_| at.unix_timestamp().to_string())
}
