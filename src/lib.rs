//! navwatch: MQTT telemetry ingestion for the naval surveillance dashboard.
//!
//! [`mqtt`] keeps a single broker connection alive and publishes the latest
//! GPS fix as a [`mqtt::TelemetrySnapshot`]; [`config`] loads the TOML
//! configuration; [`format`] renders coordinates for operators.

pub mod config;
pub mod format;
pub mod mqtt;
