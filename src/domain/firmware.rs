//! Sensor Identity
//!
//! Firmware family, protocol revision and serial number, all parsed from the
//! manufacturer data a sensor advertises.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Bluetooth company id carried by every supported sensor.
pub const COMPANY_ID: u16 = 0x04A1;

/// Length of a manufacturer data block that carries every identity field.
const IDENTITY_LEN: usize = 9;

/// The family of firmware running on a sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FirmwareType {
    /// Standard tracker firmware, first generation hardware.
    TrackerA,
    /// First generation hardware with the extended feature set.
    TrackerAExtended,
    /// Standard tracker firmware, second generation hardware (battery, pressure).
    TrackerB,
    /// Second generation hardware with the extended feature set.
    TrackerBExtended,
    Unknown,
}

impl FirmwareType {
    /// Map the firmware type byte from the advertisement.
    pub fn from_id(id: u8) -> Self {
        match id {
            0 => Self::TrackerA,
            1 => Self::TrackerAExtended,
            6 => Self::TrackerB,
            7 => Self::TrackerBExtended,
            _ => Self::Unknown,
        }
    }

    pub fn is_tracker_a(&self) -> bool {
        matches!(self, Self::TrackerA | Self::TrackerAExtended)
    }

    pub fn is_tracker_b(&self) -> bool {
        matches!(self, Self::TrackerB | Self::TrackerBExtended)
    }

    pub fn is_extended(&self) -> bool {
        matches!(self, Self::TrackerAExtended | Self::TrackerBExtended)
    }

    /// Only the second generation carries a barometer.
    pub fn supports_pressure(&self) -> bool {
        self.is_tracker_b()
    }

    /// Battery queries (and the keep-alive they provide) are second generation only.
    pub fn supports_battery(&self) -> bool {
        self.is_tracker_b()
    }
}

/// Firmware type and version of a sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Firmware {
    pub firmware_type: FirmwareType,
    pub version: u16,
}

impl Firmware {
    pub fn new(firmware_type: FirmwareType, version: u16) -> Self {
        Self {
            firmware_type,
            version,
        }
    }

    /// Human readable name, e.g. `Tracker B Extended (24)`.
    pub fn name(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Firmware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let family = match self.firmware_type {
            FirmwareType::TrackerA => "Tracker A",
            FirmwareType::TrackerAExtended => "Tracker A Extended",
            FirmwareType::TrackerB => "Tracker B",
            FirmwareType::TrackerBExtended => "Tracker B Extended",
            FirmwareType::Unknown => "Unknown",
        };
        write!(f, "{} ({})", family, self.version)
    }
}

/// Wire protocol revision, selects service identifiers and write/ack quirks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolRevision {
    R01,
    R02,
    R03,
    R04,
}

impl fmt::Display for ProtocolRevision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::R01 => write!(f, "R01"),
            Self::R02 => write!(f, "R02"),
            Self::R03 => write!(f, "R03"),
            Self::R04 => write!(f, "R04"),
        }
    }
}

/// Identity of a sensor, immutable once parsed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub company_id: u16,
    /// Decimal serial number, or `"Unknown"` when the advertisement is too short.
    pub serial: String,
    pub firmware: Firmware,
    pub revision: ProtocolRevision,
    /// The raw manufacturer data the identity was parsed from.
    pub manufacturer_data: Vec<u8>,
}

impl DeviceIdentity {
    pub const UNKNOWN_SERIAL: &'static str = "Unknown";

    /// Parse the manufacturer data block of an advertisement.
    ///
    /// ```text
    /// [0-1] : Company id (u16 little-endian)
    /// [2-3] : Firmware version (u16 little-endian)
    /// [4-7] : Serial number (u32 little-endian)
    /// [8]   : Firmware type id
    /// [9]   : Protocol revision (optional, 3 = R03, 4 = R04, other = R02)
    /// ```
    ///
    /// Blocks shorter than 9 bytes yield an unknown R01 identity.
    pub fn from_advertisement(data: &[u8]) -> Self {
        if data.len() < IDENTITY_LEN {
            return Self {
                company_id: 0,
                serial: Self::UNKNOWN_SERIAL.to_string(),
                firmware: Firmware::new(FirmwareType::Unknown, 0),
                revision: ProtocolRevision::R01,
                manufacturer_data: data.to_vec(),
            };
        }

        let company_id = u16::from_le_bytes([data[0], data[1]]);
        let version = u16::from_le_bytes([data[2], data[3]]);
        let serial = u32::from_le_bytes([data[4], data[5], data[6], data[7]]).to_string();
        let firmware_type = FirmwareType::from_id(data[8]);

        let revision = match data.get(9) {
            None => ProtocolRevision::R01,
            Some(3) => ProtocolRevision::R03,
            Some(4) => ProtocolRevision::R04,
            Some(_) => ProtocolRevision::R02,
        };

        Self {
            company_id,
            serial,
            firmware: Firmware::new(firmware_type, version),
            revision,
            manufacturer_data: data.to_vec(),
        }
    }

    /// Case-insensitive serial comparison.
    pub fn matches_serial(&self, serial: &str) -> bool {
        self.serial.eq_ignore_ascii_case(serial)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_r04_advertisement() {
        let data = [0xA1, 0x04, 0x18, 0x00, 0x6F, 0xCA, 0x9A, 0x3B, 0x07, 0x04];
        let identity = DeviceIdentity::from_advertisement(&data);

        assert_eq!(identity.company_id, COMPANY_ID);
        assert_eq!(identity.firmware.version, 24);
        assert_eq!(identity.serial, "1000000111");
        assert_eq!(
            identity.firmware.firmware_type,
            FirmwareType::TrackerBExtended
        );
        assert_eq!(identity.revision, ProtocolRevision::R04);
    }

    #[test]
    fn test_serial_is_little_endian_decimal() {
        let data = [0xA1, 0x04, 0x18, 0x00, 0x6F, 0x12, 0xA3, 0x3B, 0x07, 0x04];
        let identity = DeviceIdentity::from_advertisement(&data);
        assert_eq!(identity.serial, 0x3BA3_126Fu32.to_string());
    }

    #[test]
    fn test_revision_selection() {
        let base = [0xA1, 0x04, 0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00];
        assert_eq!(
            DeviceIdentity::from_advertisement(&base).revision,
            ProtocolRevision::R01
        );

        let mut r03 = base.to_vec();
        r03.push(3);
        assert_eq!(
            DeviceIdentity::from_advertisement(&r03).revision,
            ProtocolRevision::R03
        );

        let mut r02 = base.to_vec();
        r02.push(9);
        assert_eq!(
            DeviceIdentity::from_advertisement(&r02).revision,
            ProtocolRevision::R02
        );
    }

    #[test]
    fn test_short_advertisement_defaults() {
        let identity = DeviceIdentity::from_advertisement(&[0xA1, 0x04, 0x18, 0x00, 0x01]);
        assert_eq!(identity.serial, DeviceIdentity::UNKNOWN_SERIAL);
        assert_eq!(identity.company_id, 0);
        assert_eq!(identity.firmware.version, 0);
        assert_eq!(identity.firmware.firmware_type, FirmwareType::Unknown);
        assert_eq!(identity.revision, ProtocolRevision::R01);
    }

    #[test]
    fn test_firmware_names() {
        assert_eq!(
            Firmware::new(FirmwareType::TrackerA, 3).name(),
            "Tracker A (3)"
        );
        assert!(FirmwareType::TrackerBExtended.supports_pressure());
        assert!(!FirmwareType::TrackerAExtended.supports_battery());
        assert_eq!(FirmwareType::from_id(2), FirmwareType::Unknown);
    }
}
