//! Plain data shared by the Bluetooth layer and the application.

pub mod firmware;
pub mod models;
pub mod settings;
pub mod telemetry;
