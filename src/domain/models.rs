use serde::{Deserialize, Serialize};

/// Connection state of a device session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    /// The link was lost and a reconnect attempt is in flight.
    Reconnecting,
}

/// Peripheral operations whose failures are reported to the owner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeripheralErrorKind {
    ReadRssi,
    DiscoverServices,
    DiscoverCharacteristics,
    UpdateNotificationState,
    UpdateValue,
}

/// Notification emitted by a device session
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceEvent {
    /// Serial number of the device.
    pub device_id: String,
    pub kind: DeviceEventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEventKind {
    Connected,
    /// The link dropped unexpectedly; a reconnect is being attempted.
    Reconnecting,
    Reconnected,
    /// The device is gone and will not be reconnected.
    Disconnected,
    Rssi(i16),
    BatteryLevel(i32),
    Error {
        kind: PeripheralErrorKind,
        message: String,
    },
}

impl DeviceEvent {
    pub fn new(device_id: &str, kind: DeviceEventKind) -> Self {
        Self {
            device_id: device_id.to_string(),
            kind,
        }
    }
}
