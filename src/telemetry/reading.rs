//! Sensor reading snapshot and telemetry payload parsing.
//!
//! Devices publish `{device_id, timestamp, readings: {name: {value, unit, timestamp}}}`.
//! Only each sensor's `value` is kept, flattened into a [`SensorReading`].

use crate::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Most recent reading of one device. Every field is optional because a
/// payload may report any subset of sensors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub pressure: Option<f64>,
    pub light: Option<f64>,
    pub timestamp: Option<String>,
    pub device_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TelemetryPayload {
    #[serde(default)]
    device_id: Option<Value>,
    #[serde(default)]
    timestamp: Option<Value>,
    #[serde(default)]
    readings: HashMap<String, Value>,
}

impl SensorReading {
    /// Parse a telemetry payload.
    ///
    /// `fallback_device` and `now` fill in `device_id` / `timestamp` when the
    /// envelope lacks them.
    pub fn from_payload(payload: &[u8], fallback_device: &str, now: &str) -> Result<Self> {
        let parsed: TelemetryPayload = serde_json::from_slice(payload)?;
        // unit and per-sensor timestamp are carried by devices but not kept
        let value_of = |name: &str| {
            parsed
                .readings
                .get(name)
                .and_then(|sensor| sensor.get("value"))
                .and_then(as_number)
        };

        let device_id =
            as_text(parsed.device_id.as_ref()).unwrap_or_else(|| fallback_device.to_string());
        let timestamp = as_text(parsed.timestamp.as_ref()).unwrap_or_else(|| now.to_string());

        Ok(Self {
            temperature: value_of("temperature"),
            humidity: value_of("humidity"),
            pressure: value_of("pressure"),
            light: value_of("light"),
            timestamp: Some(timestamp),
            device_id: Some(device_id),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.temperature.is_none()
            && self.humidity.is_none()
            && self.pressure.is_none()
            && self.light.is_none()
    }
}

fn as_text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Numbers pass through, numeric strings are parsed, anything else is absent.
fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}
