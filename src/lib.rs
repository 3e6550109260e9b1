//! Export ABB B23 meter readings to MQTT
//!
//! This library polls an ABB B23 three-phase energy meter over a serial
//! M-Bus line, decodes the two proprietary response telegrams and publishes
//! the merged readings as one retained JSON message per polling cycle.

pub mod config;
pub mod health;
pub mod metering_mbus;
pub mod models;
pub mod mqtt;

// Re-export common types for easier access
pub use config::{Config, EnergyEncoding};
pub use health::{FatalReason, HealthState};
pub use metering_mbus::MbusManager;
pub use models::{Measurement, MeasurementSet, Metadata};
pub use mqtt::MqttManager;
