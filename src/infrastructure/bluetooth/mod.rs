//! Bluetooth Module
//!
//! Device sessions and protocol codecs for the motion sensors.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    BluetoothService                      │
//! │   (serialized event queue, public API for the app)       │
//! └──────┬─────────────────────┬────────────────────────────┘
//!        │                     │
//!        ▼                     ▼
//! ┌───────────┐        ┌───────────────────┐
//! │  Scanner  │        │ SessionAggregator │
//! │ available │        │ connected devices │
//! │  devices  │        │ telemetry records │
//! └───────────┘        └─────────┬─────────┘
//!                                │ 1..n
//!                                ▼
//!                      ┌───────────────────┐
//!                      │   DeviceSession   │
//!                      │ reconnect policy  │
//!                      └─────────┬─────────┘
//!                                │
//!                                ▼
//!                      ┌───────────────────┐
//!                      │ PeripheralSession │──▶ Transport
//!                      │     dispatch      │
//!                      └────┬─────────┬────┘
//!                           ▼         ▼
//!                    ┌───────────┐ ┌─────────┐
//!                    │ Telemetry │ │ Factory │
//!                    │  Service  │ │ Service │
//!                    └───────────┘ └─────────┘
//! ```
//!
//! ## Modules
//!
//! - [`transport`] - Abstract radio consumed by the core
//! - [`protocol`] - Service identifiers, log commands and frame decoding
//! - [`scheduler`] - Cancellable timers posting onto the event queue
//! - [`peripheral`] - One connection and its service dispatch
//! - [`log_service`] - Telemetry service handler
//! - [`factory_service`] - Battery/factory service handler
//! - [`device`] - Device session state machine
//! - [`registry`] - RSSI-ranked device collection
//! - [`scanner`] - Discovery filtering
//! - [`aggregator`] - Logging fan-out and record buffer
//! - [`service`] - Main service coordinator

pub mod aggregator;
pub mod device;
pub mod factory_service;
pub mod log_service;
pub mod peripheral;
pub mod protocol;
pub mod registry;
pub mod scanner;
pub mod scheduler;
pub mod service;
pub mod transport;

// Re-export main service for convenience
pub use service::{BleEvent, BluetoothService};
