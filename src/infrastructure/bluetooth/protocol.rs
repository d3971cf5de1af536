//! Sensor Wire Protocol
//!
//! Service identifiers for each protocol revision, the log command encoding,
//! the log frame decoder, and the factory (battery) request/response codec.

use crate::domain::firmware::ProtocolRevision;
use crate::domain::telemetry::{LogType, Sample, TelemetryFrame};
use thiserror::Error;
use uuid::Uuid;

/// Log tags as they appear in commands and in the first byte of every frame
pub mod log_id {
    /// Acknowledgement of a command; never telemetry.
    pub const RESPONSE: u8 = 0;
    pub const MAG_RAW: u8 = 1;
    pub const TEMPERATURE: u8 = 7;
    pub const ACCEL_RAW: u8 = 15;
    pub const GYRO_RAW: u8 = 62;
    pub const QUATERNION_MAG_ACCEL: u8 = 77;
    pub const MAG_AUTOCAL: u8 = 93;
    pub const ACCEL_AUTOCAL: u8 = 99;
    pub const GYRO_AUTOCAL: u8 = 108;
    pub const TIMESTAMP_FULL: u8 = 111;
    pub const LINEAR_ACCEL: u8 = 202;
    pub const QUATERNION_9AXIS: u8 = 204;
    pub const GYRO_BIAS: u8 = 205;
    pub const PRESSURE: u8 = 233;
}

/// Factory service commands
pub mod factory_id {
    pub const GET_BATTERY_INFO: u8 = 147;
    pub const GET_BATTERY_INFO_RESP: u8 = 148;
    /// Battery info selector: remaining capacity in percent.
    pub const CAPACITY_PERCENT: u8 = 46;
}

/// Fixed-point divisor of 24-bit quaternion components (2^23 - 1).
pub const QUATERNION_SCALE: f32 = 8_388_607.0;

/// Most log tags a single command can carry.
pub const MAX_LOG_TAGS: usize = 20;

/// Highest output data rate the firmware accepts.
pub const MAX_RATE_HZ: u16 = 200;

/// Rate the firmware uses when the rate byte is 0.
pub const DEFAULT_RATE_HZ: u16 = 30;

/// Length of a factory battery response.
const BATTERY_RESPONSE_LEN: usize = 6;

/// Service and characteristic pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceIds {
    pub service: Uuid,
    pub characteristic: Uuid,
}

/// Identifiers and quirks of one protocol revision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolProfile {
    pub revision: ProtocolRevision,
    pub log: ServiceIds,
    pub factory: ServiceIds,
    /// Log commands are not link-layer acknowledged and must be resent until
    /// the device answers with a `RESPONSE` frame.
    pub resend_unacknowledged: bool,
    /// Leave notifications on after an all-off command until its
    /// acknowledgement arrives.
    pub await_off_ack: bool,
}

const R01_LOG: ServiceIds = ServiceIds {
    service: Uuid::from_u128(0xc00f3950_eb93_11e9_81b4_2a2ae2dbcce4),
    characteristic: Uuid::from_u128(0xc00f3a86_eb93_11e9_81b4_2a2ae2dbcce4),
};

const R01_FACTORY: ServiceIds = ServiceIds {
    service: Uuid::from_u128(0x32f6dee0_0f99_11ea_8d71_362b9e155667),
    characteristic: Uuid::from_u128(0x32f6e1e2_0f99_11ea_8d71_362b9e155667),
};

// Later revisions share one base: 0000000N-<group>-11ea-8d71-362b9e155667
const LOG: ServiceIds = ServiceIds {
    service: Uuid::from_u128(0x00000000_0001_11ea_8d71_362b9e155667),
    characteristic: Uuid::from_u128(0x00000001_0001_11ea_8d71_362b9e155667),
};

const FACTORY: ServiceIds = ServiceIds {
    service: Uuid::from_u128(0x00000000_0004_11ea_8d71_362b9e155667),
    characteristic: Uuid::from_u128(0x00000001_0004_11ea_8d71_362b9e155667),
};

impl ProtocolProfile {
    pub fn for_revision(revision: ProtocolRevision) -> Self {
        let (log, factory) = match revision {
            ProtocolRevision::R01 => (R01_LOG, R01_FACTORY),
            ProtocolRevision::R02 | ProtocolRevision::R03 | ProtocolRevision::R04 => {
                (LOG, FACTORY)
            }
        };

        Self {
            revision,
            log,
            factory,
            resend_unacknowledged: revision == ProtocolRevision::R03,
            await_off_ack: revision != ProtocolRevision::R02,
        }
    }
}

pub fn log_id(log_type: LogType) -> u8 {
    match log_type {
        LogType::MagRaw => log_id::MAG_RAW,
        LogType::MagAutocal => log_id::MAG_AUTOCAL,
        LogType::AccelRaw => log_id::ACCEL_RAW,
        LogType::AccelAutocal => log_id::ACCEL_AUTOCAL,
        LogType::GyroRaw => log_id::GYRO_RAW,
        LogType::GyroAutocal => log_id::GYRO_AUTOCAL,
        LogType::QuaternionMagAccel => log_id::QUATERNION_MAG_ACCEL,
        LogType::Quaternion9Axis => log_id::QUATERNION_9AXIS,
        LogType::LinearAccel => log_id::LINEAR_ACCEL,
        LogType::GyroBias => log_id::GYRO_BIAS,
        LogType::Temperature => log_id::TEMPERATURE,
        LogType::TimestampFull => log_id::TIMESTAMP_FULL,
        LogType::Pressure => log_id::PRESSURE,
    }
}

pub fn log_type_from_id(id: u8) -> Option<LogType> {
    LogType::ALL.into_iter().find(|t| log_id(*t) == id)
}

/// Exact frame length mandated for each log type.
pub fn frame_len(log_type: LogType) -> usize {
    match log_type {
        LogType::Temperature | LogType::Pressure | LogType::TimestampFull => 10,
        LogType::AccelRaw | LogType::GyroRaw => 12,
        LogType::MagRaw => 15,
        LogType::QuaternionMagAccel
        | LogType::Quaternion9Axis
        | LogType::MagAutocal
        | LogType::AccelAutocal
        | LogType::GyroAutocal
        | LogType::LinearAccel
        | LogType::GyroBias => 18,
    }
}

/// Output data rate byte. 0 selects the firmware default of 30 Hz.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LogRate(u8);

impl LogRate {
    pub const DEFAULT: LogRate = LogRate(0);

    /// Rate in Hz, clamped to the firmware maximum.
    pub fn from_hz(hz: u16) -> Self {
        Self(hz.min(MAX_RATE_HZ) as u8)
    }

    pub fn byte(self) -> u8 {
        self.0
    }

    pub fn hz(self) -> u16 {
        match self.0 {
            0 => DEFAULT_RATE_HZ,
            hz => hz as u16,
        }
    }
}

/// Command written to the log characteristic
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogCommand {
    /// Enable the listed kinds at `rate`. Enabled kinds accumulate on the
    /// device until an `AllOff`.
    Enable {
        rate: LogRate,
        log_types: Vec<LogType>,
    },
    /// Turn every log kind off.
    AllOff,
}

impl LogCommand {
    /// An empty list turns everything off.
    pub fn enable(rate: LogRate, log_types: &[LogType]) -> Self {
        if log_types.is_empty() {
            Self::AllOff
        } else {
            Self::Enable {
                rate,
                log_types: log_types.to_vec(),
            }
        }
    }

    /// ```text
    /// [0]    : Rate byte
    /// [1..]  : Log tags, or a single 0x00 to turn every log off
    /// ```
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::AllOff => vec![0, log_id::RESPONSE],
            Self::Enable { rate, log_types } => {
                let mut bytes = Vec::with_capacity(log_types.len() + 1);
                bytes.push(rate.byte());
                bytes.extend(log_types.iter().map(|t| log_id(*t)));
                bytes
            }
        }
    }

    /// Interpret command bytes the way the firmware does. A rate byte
    /// followed by a lone 0x00 is the all-off form whatever the rate.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let (&rate, tags) = bytes.split_first()?;
        if tags == [log_id::RESPONSE] {
            return Some(Self::AllOff);
        }

        let log_types = tags
            .iter()
            .map(|id| log_type_from_id(*id))
            .collect::<Option<Vec<_>>>()?;
        Some(Self::Enable {
            rate: LogRate(rate),
            log_types,
        })
    }

    pub fn tag_count(&self) -> usize {
        match self {
            Self::AllOff => 0,
            Self::Enable { log_types, .. } => log_types.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("Empty frame")]
    Empty,
    #[error("Unknown log tag {0}")]
    UnknownTag(u8),
    #[error("Frame with tag {tag} must be {expected} bytes, got {actual}")]
    Length {
        tag: u8,
        expected: usize,
        actual: usize,
    },
    #[error("Unknown factory command {0}")]
    UnknownCommand(u8),
    #[error("Unknown battery info id {0}")]
    UnknownInfo(u8),
}

/// A decoded log characteristic notification
#[derive(Debug, Clone, PartialEq)]
pub enum LogFrame {
    /// Command acknowledgement.
    Response(Vec<u8>),
    Telemetry(TelemetryFrame),
}

/// Decode a log frame.
///
/// # Frame Structure
///
/// ```text
/// [0]     : Log tag
/// [1]     : Reserved
/// [2-5]   : Relative timestamp (u32 little-endian, microseconds)
/// [6..]   : Payload
///           i16 x3      raw accel / gyro            (12 bytes total)
///           i24 x3      raw mag                     (15 bytes total)
///           i24 x4      quaternion, / 8388607       (18 bytes total)
///           f32 x3      autocal, linear accel, bias (18 bytes total)
///           f32         temperature, pressure       (10 bytes total)
///           u32         timestamp upper word        (10 bytes total)
/// ```
///
/// The frame length must match its tag exactly; nothing is read from a
/// frame of any other length.
pub fn decode_frame(bytes: &[u8]) -> Result<LogFrame, DecodeError> {
    let tag = *bytes.first().ok_or(DecodeError::Empty)?;
    if tag == log_id::RESPONSE {
        return Ok(LogFrame::Response(bytes.to_vec()));
    }

    let log_type = log_type_from_id(tag).ok_or(DecodeError::UnknownTag(tag))?;
    let expected = frame_len(log_type);
    if bytes.len() != expected {
        return Err(DecodeError::Length {
            tag,
            expected,
            actual: bytes.len(),
        });
    }

    let timestamp = read_u32(bytes, 2);
    let sample = match log_type {
        LogType::AccelRaw | LogType::GyroRaw => Sample::Axes {
            x: read_i16(bytes, 6) as f32,
            y: read_i16(bytes, 8) as f32,
            z: read_i16(bytes, 10) as f32,
        },
        LogType::MagRaw => Sample::Axes {
            x: read_i24(bytes, 6) as f32,
            y: read_i24(bytes, 9) as f32,
            z: read_i24(bytes, 12) as f32,
        },
        LogType::QuaternionMagAccel | LogType::Quaternion9Axis => Sample::Quaternion {
            x: read_i24(bytes, 6) as f32 / QUATERNION_SCALE,
            y: read_i24(bytes, 9) as f32 / QUATERNION_SCALE,
            z: read_i24(bytes, 12) as f32 / QUATERNION_SCALE,
            w: read_i24(bytes, 15) as f32 / QUATERNION_SCALE,
        },
        LogType::MagAutocal
        | LogType::AccelAutocal
        | LogType::GyroAutocal
        | LogType::LinearAccel
        | LogType::GyroBias => Sample::Axes {
            x: read_f32(bytes, 6),
            y: read_f32(bytes, 10),
            z: read_f32(bytes, 14),
        },
        LogType::Temperature | LogType::Pressure => Sample::Scalar(read_f32(bytes, 6)),
        LogType::TimestampFull => Sample::FullTimestamp {
            upper: read_u32(bytes, 6),
        },
    };

    Ok(LogFrame::Telemetry(TelemetryFrame {
        log_type,
        timestamp,
        sample,
    }))
}

/// Decoded factory characteristic notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FactoryResponse {
    BatteryCapacity(i32),
}

/// Request for the remaining battery capacity.
pub fn battery_request() -> [u8; 2] {
    [factory_id::GET_BATTERY_INFO, factory_id::CAPACITY_PERCENT]
}

/// ```text
/// [0]   : Command id (148)
/// [1]   : Info id (46 = capacity percent)
/// [2-5] : Value (i32 little-endian)
/// ```
pub fn decode_factory_response(bytes: &[u8]) -> Result<FactoryResponse, DecodeError> {
    let command = *bytes.first().ok_or(DecodeError::Empty)?;
    if command != factory_id::GET_BATTERY_INFO_RESP {
        return Err(DecodeError::UnknownCommand(command));
    }
    if bytes.len() != BATTERY_RESPONSE_LEN {
        return Err(DecodeError::Length {
            tag: command,
            expected: BATTERY_RESPONSE_LEN,
            actual: bytes.len(),
        });
    }

    match bytes[1] {
        factory_id::CAPACITY_PERCENT => Ok(FactoryResponse::BatteryCapacity(i32::from_le_bytes([
            bytes[2], bytes[3], bytes[4], bytes[5],
        ]))),
        info => Err(DecodeError::UnknownInfo(info)),
    }
}

// Callers check the frame length against the table first.

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn read_i16(bytes: &[u8], at: usize) -> i16 {
    i16::from_le_bytes([bytes[at], bytes[at + 1]])
}

/// Sign-extend a 24-bit little-endian integer.
fn read_i24(bytes: &[u8], at: usize) -> i32 {
    let sign = if bytes[at + 2] & 0x80 != 0 { 0xFF } else { 0x00 };
    i32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], sign])
}

fn read_f32(bytes: &[u8], at: usize) -> f32 {
    f32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(tag: u8, ts: u32) -> Vec<u8> {
        let mut bytes = vec![tag, 0];
        bytes.extend_from_slice(&ts.to_le_bytes());
        bytes
    }

    fn push_i24(bytes: &mut Vec<u8>, value: i32) {
        bytes.extend_from_slice(&value.to_le_bytes()[..3]);
    }

    #[test]
    fn test_gyro_raw_frame() {
        let bytes = [62, 0, 0, 0, 0, 0, 0x05, 0x00, 0x03, 0x00, 0x00, 0x00];
        let frame = decode_frame(&bytes).unwrap();
        assert_eq!(
            frame,
            LogFrame::Telemetry(TelemetryFrame {
                log_type: LogType::GyroRaw,
                timestamp: 0,
                sample: Sample::Axes {
                    x: 5.0,
                    y: 3.0,
                    z: 0.0
                },
            })
        );
    }

    #[test]
    fn test_wrong_length_is_rejected_for_every_tag() {
        for log_type in LogType::ALL {
            let len = frame_len(log_type);
            for actual in [len - 1, len + 1, 1] {
                let mut bytes = vec![0u8; actual];
                bytes[0] = log_id(log_type);
                assert_eq!(
                    decode_frame(&bytes),
                    Err(DecodeError::Length {
                        tag: log_id(log_type),
                        expected: len,
                        actual,
                    }),
                    "{} with {} bytes",
                    log_type,
                    actual
                );
            }

            let mut exact = vec![0u8; len];
            exact[0] = log_id(log_type);
            assert!(decode_frame(&exact).is_ok());
        }
    }

    #[test]
    fn test_quaternion_fixed_point() {
        for v in [-1.0f32, -0.75, -0.333, 0.0, 0.1, 0.5, 0.999, 1.0] {
            let fixed = (v * QUATERNION_SCALE).round() as i32;
            let mut bytes = header(log_id::QUATERNION_9AXIS, 1000);
            for _ in 0..4 {
                push_i24(&mut bytes, fixed);
            }

            let LogFrame::Telemetry(frame) = decode_frame(&bytes).unwrap() else {
                panic!("expected telemetry");
            };
            assert_eq!(frame.timestamp, 1000);
            let Sample::Quaternion { x, y, z, w } = frame.sample else {
                panic!("expected quaternion");
            };
            for decoded in [x, y, z, w] {
                assert!((decoded - v).abs() <= 1.0 / QUATERNION_SCALE, "{v} -> {decoded}");
                assert!((-1.0..=1.0).contains(&decoded));
            }
        }
    }

    #[test]
    fn test_mag_raw_is_sign_extended_and_unscaled() {
        let mut bytes = header(log_id::MAG_RAW, 7);
        push_i24(&mut bytes, -2);
        push_i24(&mut bytes, 300_000);
        push_i24(&mut bytes, -8_388_608);

        let LogFrame::Telemetry(frame) = decode_frame(&bytes).unwrap() else {
            panic!("expected telemetry");
        };
        assert_eq!(
            frame.sample,
            Sample::Axes {
                x: -2.0,
                y: 300_000.0,
                z: -8_388_608.0
            }
        );
    }

    #[test]
    fn test_float_and_scalar_frames() {
        let mut bytes = header(log_id::LINEAR_ACCEL, u32::MAX);
        for v in [1.5f32, -2.25, 9.81] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        let LogFrame::Telemetry(frame) = decode_frame(&bytes).unwrap() else {
            panic!("expected telemetry");
        };
        assert_eq!(frame.timestamp, u32::MAX);
        assert_eq!(
            frame.sample,
            Sample::Axes {
                x: 1.5,
                y: -2.25,
                z: 9.81
            }
        );

        let mut pressure = header(log_id::PRESSURE, 3);
        pressure.extend_from_slice(&1013.25f32.to_le_bytes());
        let LogFrame::Telemetry(frame) = decode_frame(&pressure).unwrap() else {
            panic!("expected telemetry");
        };
        assert_eq!(frame.sample, Sample::Scalar(1013.25));

        let mut full = header(log_id::TIMESTAMP_FULL, 3);
        full.extend_from_slice(&9u32.to_le_bytes());
        let LogFrame::Telemetry(frame) = decode_frame(&full).unwrap() else {
            panic!("expected telemetry");
        };
        assert_eq!(frame.sample, Sample::FullTimestamp { upper: 9 });
    }

    #[test]
    fn test_response_and_unknown_frames() {
        assert_eq!(
            decode_frame(&[0, 0]),
            Ok(LogFrame::Response(vec![0, 0]))
        );
        assert_eq!(decode_frame(&[]), Err(DecodeError::Empty));
        assert_eq!(decode_frame(&[2, 0, 0]), Err(DecodeError::UnknownTag(2)));
    }

    #[test]
    fn test_command_encoding() {
        let cmd = LogCommand::enable(
            LogRate::from_hz(100),
            &[LogType::GyroRaw, LogType::Pressure],
        );
        assert_eq!(cmd.encode(), vec![100, 62, 233]);
        assert_eq!(LogCommand::enable(LogRate::DEFAULT, &[]), LogCommand::AllOff);
        assert_eq!(LogCommand::AllOff.encode(), vec![0, 0]);
    }

    #[test]
    fn test_rate_then_zero_is_all_off() {
        assert_eq!(LogCommand::parse(&[30, 0x00]), Some(LogCommand::AllOff));
        assert_eq!(
            LogCommand::parse(&[30, 62]),
            Some(LogCommand::Enable {
                rate: LogRate::from_hz(30),
                log_types: vec![LogType::GyroRaw],
            })
        );
        assert_eq!(LogCommand::parse(&[]), None);
    }

    #[test]
    fn test_log_rate() {
        assert_eq!(LogRate::DEFAULT.hz(), 30);
        assert_eq!(LogRate::from_hz(1000).byte(), 200);
        assert_eq!(LogRate::from_hz(50).hz(), 50);
    }

    #[test]
    fn test_profiles() {
        let r01 = ProtocolProfile::for_revision(ProtocolRevision::R01);
        assert_eq!(
            r01.log.service.to_string(),
            "c00f3950-eb93-11e9-81b4-2a2ae2dbcce4"
        );
        assert!(!r01.resend_unacknowledged);

        let r03 = ProtocolProfile::for_revision(ProtocolRevision::R03);
        assert_eq!(
            r03.factory.characteristic.to_string(),
            "00000001-0004-11ea-8d71-362b9e155667"
        );
        assert!(r03.resend_unacknowledged);
        assert!(r03.await_off_ack);
        assert!(!ProtocolProfile::for_revision(ProtocolRevision::R02).await_off_ack);
    }

    #[test]
    fn test_factory_codec() {
        assert_eq!(battery_request(), [147, 46]);
        assert_eq!(
            decode_factory_response(&[148, 46, 87, 0, 0, 0]),
            Ok(FactoryResponse::BatteryCapacity(87))
        );
        assert!(matches!(
            decode_factory_response(&[148, 46, 87]),
            Err(DecodeError::Length { .. })
        ));
        assert_eq!(
            decode_factory_response(&[148, 1, 0, 0, 0, 0]),
            Err(DecodeError::UnknownInfo(1))
        );
        assert_eq!(
            decode_factory_response(&[1, 46]),
            Err(DecodeError::UnknownCommand(1))
        );
    }
}
