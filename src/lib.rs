//! Device session and protocol layer for BLE motion sensors.
//!
//! The application feeds transport callbacks into a
//! [`BluetoothService`](infrastructure::bluetooth::BluetoothService) and reads
//! back device events and merged telemetry records.

pub mod domain;
pub mod infrastructure;
