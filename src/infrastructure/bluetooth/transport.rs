//! Transport Adapter
//!
//! The abstract radio the core drives. Requests are fire-and-forget; their
//! results come back as [`TransportEvent`]s on the coordinator's serialized
//! queue.

use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Transport-assigned peripheral identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeripheralId(pub String);

impl PeripheralId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// First eight characters, used to tag log lines.
    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(8)
            .map(|(i, _)| i)
            .unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A characteristic, addressed by its owning service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicRef {
    pub service: Uuid,
    pub uuid: Uuid,
}

impl CharacteristicRef {
    pub fn new(service: Uuid, uuid: Uuid) -> Self {
        Self { service, uuid }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteType {
    WithResponse,
    WithoutResponse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioState {
    Unknown,
    Resetting,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Peripheral {0} is not connected")]
    NotConnected(PeripheralId),
    #[error("Radio is not powered on ({0:?})")]
    RadioUnavailable(RadioState),
    #[error("Unknown peripheral: {0}")]
    UnknownPeripheral(PeripheralId),
    #[error("{operation} failed: {message}")]
    Operation {
        operation: &'static str,
        message: String,
    },
}

/// A peripheral seen while scanning
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredPeripheral {
    pub id: PeripheralId,
    pub name: Option<String>,
    pub manufacturer_data: Option<Vec<u8>>,
    pub rssi: i16,
}

/// Per-peripheral GATT callbacks
#[derive(Debug, Clone, PartialEq)]
pub enum GattEvent {
    RssiRead(Result<i16, TransportError>),
    ServicesDiscovered(Result<Vec<Uuid>, TransportError>),
    CharacteristicsDiscovered {
        service: Uuid,
        result: Result<Vec<Uuid>, TransportError>,
    },
    /// Carries the resulting notifying state.
    NotifyStateChanged {
        characteristic: CharacteristicRef,
        result: Result<bool, TransportError>,
    },
    /// A notification or the reply to a read.
    ValueUpdated {
        characteristic: CharacteristicRef,
        result: Result<Vec<u8>, TransportError>,
    },
}

/// Callbacks delivered by the transport
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    RadioStateChanged(RadioState),
    Discovered(DiscoveredPeripheral),
    Connected(PeripheralId),
    ConnectFailed {
        peripheral: PeripheralId,
        error: Option<TransportError>,
    },
    /// `error` is `None` for a clean, requested disconnect.
    Disconnected {
        peripheral: PeripheralId,
        error: Option<TransportError>,
    },
    Peripheral {
        peripheral: PeripheralId,
        event: GattEvent,
    },
}

/// The radio primitives the core consumes
pub trait Transport: Send + Sync {
    fn start_scan(&self, service_filter: &[Uuid]) -> Result<(), TransportError>;
    fn stop_scan(&self) -> Result<(), TransportError>;
    fn connect(&self, peripheral: &PeripheralId) -> Result<(), TransportError>;
    fn cancel_connection(&self, peripheral: &PeripheralId) -> Result<(), TransportError>;
    fn discover_services(
        &self,
        peripheral: &PeripheralId,
        services: Option<&[Uuid]>,
    ) -> Result<(), TransportError>;
    fn discover_characteristics(
        &self,
        peripheral: &PeripheralId,
        service: Uuid,
        characteristics: Option<&[Uuid]>,
    ) -> Result<(), TransportError>;
    fn set_notify(
        &self,
        peripheral: &PeripheralId,
        characteristic: &CharacteristicRef,
        enabled: bool,
    ) -> Result<(), TransportError>;
    fn write(
        &self,
        peripheral: &PeripheralId,
        characteristic: &CharacteristicRef,
        bytes: &[u8],
        write_type: WriteType,
    ) -> Result<(), TransportError>;
    fn read_value(
        &self,
        peripheral: &PeripheralId,
        characteristic: &CharacteristicRef,
    ) -> Result<(), TransportError>;
    fn read_rssi(&self, peripheral: &PeripheralId) -> Result<(), TransportError>;
    fn is_connected(&self, peripheral: &PeripheralId) -> bool;
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_peripheral_id() {
        assert_eq!(PeripheralId::new("0123456789AB").short(), "01234567");
        assert_eq!(PeripheralId::new("abc").short(), "abc");
    }
}
