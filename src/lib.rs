//! IoT device console library.
//!
//! Follows one device's live sensor telemetry over MQTT (WebSocket
//! transport) and sends it commands through an HTTP backend. The
//! [`panel::ControlPanel`] ties both together for interactive use.

pub mod command;
pub mod config;
pub mod error;
pub mod panel;
pub mod telemetry;
