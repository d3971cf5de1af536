//! BLE Scanner Module
//!
//! Filters the transport's discovery stream down to motion sensors and keeps
//! them in an RSSI-ranked list until one is selected for connection.

use crate::domain::firmware::{DeviceIdentity, COMPANY_ID};
use crate::infrastructure::bluetooth::registry::{DeviceRegistry, RegistryEntry};
use crate::infrastructure::bluetooth::transport::{
    DiscoveredPeripheral, PeripheralId, Transport, TransportError,
};
use std::sync::Arc;
use tracing::{info, trace};

/// Shortest manufacturer data block worth parsing.
const MIN_MANUFACTURER_DATA_LEN: usize = 6;

/// A sensor seen while scanning
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredDevice {
    pub identity: DeviceIdentity,
    pub peripheral_id: PeripheralId,
    pub rssi: i16,
}

impl RegistryEntry for DiscoveredDevice {
    fn serial(&self) -> &str {
        &self.identity.serial
    }

    fn peripheral_id(&self) -> &PeripheralId {
        &self.peripheral_id
    }

    fn rssi(&self) -> i16 {
        self.rssi
    }
}

/// Whether an advertisement comes from one of our sensors.
///
/// Sensors advertise the vendor's company id and never a local name.
pub fn is_sensor_advertisement(peripheral: &DiscoveredPeripheral) -> bool {
    let Some(data) = peripheral.manufacturer_data.as_deref() else {
        return false;
    };
    if data.len() < MIN_MANUFACTURER_DATA_LEN {
        return false;
    }
    let company_id = u16::from_le_bytes([data[0], data[1]]);
    company_id == COMPANY_ID && peripheral.name.as_deref().map_or(true, str::is_empty)
}

/// BLE Scanner for discovering motion sensors
pub struct BleScanner {
    transport: Arc<dyn Transport>,
    available: DeviceRegistry<DiscoveredDevice>,
    serial_filter: String,
    scanning: bool,
}

impl BleScanner {
    pub fn new(transport: Arc<dyn Transport>, serial_filter: &str) -> Self {
        Self {
            transport,
            available: DeviceRegistry::new(true),
            serial_filter: serial_filter.to_string(),
            scanning: false,
        }
    }

    /// Start a fresh scan. The available list is cleared first.
    pub fn start(&mut self) -> Result<(), TransportError> {
        self.available.clear();
        info!("Starting BLE scan for motion sensors");
        self.transport.start_scan(&[])?;
        self.scanning = true;
        Ok(())
    }

    pub fn stop(&mut self) -> Result<(), TransportError> {
        if !self.scanning {
            return Ok(());
        }
        info!("Stopping BLE scan...");
        self.scanning = false;
        self.transport.stop_scan()
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    /// Narrow the list to serials containing `filter` (case-insensitive).
    /// An empty filter accepts everything.
    pub fn set_serial_filter(&mut self, filter: &str) {
        self.serial_filter = filter.to_string();
    }

    /// Radio went down; nothing seen so far is reachable.
    pub fn reset(&mut self) {
        self.scanning = false;
        self.available.clear();
    }

    /// Feed one discovery result. Returns the device's rank when accepted.
    pub fn on_discovered(&mut self, peripheral: DiscoveredPeripheral) -> Option<usize> {
        if !is_sensor_advertisement(&peripheral) {
            trace!("Ignoring peripheral {}", peripheral.id.short());
            return None;
        }
        let data = peripheral.manufacturer_data.unwrap_or_default();
        let identity = DeviceIdentity::from_advertisement(&data);

        if !self.matches_filter(&identity.serial) {
            return None;
        }

        Some(self.available.upsert(DiscoveredDevice {
            identity,
            peripheral_id: peripheral.id,
            rssi: peripheral.rssi,
        }))
    }

    fn matches_filter(&self, serial: &str) -> bool {
        self.serial_filter.is_empty()
            || serial
                .to_ascii_lowercase()
                .contains(&self.serial_filter.to_ascii_lowercase())
    }

    pub fn available(&self) -> &DeviceRegistry<DiscoveredDevice> {
        &self.available
    }

    pub fn get(&self, serial: &str) -> Option<&DiscoveredDevice> {
        self.available.get(serial)
    }

    /// Hand a device over for connection.
    pub fn take(&mut self, serial: &str) -> Option<DiscoveredDevice> {
        self.available.remove(serial).map(|(_, device)| device)
    }
}

impl Drop for BleScanner {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
