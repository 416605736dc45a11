//! Read-only text rendering of the panel.

use super::toggle::ToggleState;
use crate::telemetry::{LinkStatus, SensorReading};
use std::fmt;

/// Everything the panel shows at one instant.
#[derive(Debug, Clone, PartialEq)]
pub struct PanelView {
    pub device_id: String,
    pub status: LinkStatus,
    pub reading: Option<SensorReading>,
    pub led: ToggleState,
    pub loading: bool,
    /// Last command error, if the most recent call failed
    pub command_error: Option<String>,
}

fn metric(value: Option<f64>, unit: &str) -> String {
    match value {
        Some(v) => format!("{:.1}{}", v, unit),
        None => "--".to_string(),
    }
}

impl fmt::Display for PanelView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Device:      {}", self.device_id)?;
        write!(f, "Connection:  {}", self.status.state)?;
        if let Some(error) = &self.status.error {
            write!(f, " ({})", error)?;
        }
        writeln!(f)?;

        match &self.reading {
            Some(reading) => {
                writeln!(f, "Temperature: {}", metric(reading.temperature, " °C"))?;
                writeln!(f, "Humidity:    {}", metric(reading.humidity, " %"))?;
                writeln!(f, "Pressure:    {}", metric(reading.pressure, " hPa"))?;
                writeln!(f, "Light:       {}", metric(reading.light, " %"))?;
                if let Some(timestamp) = &reading.timestamp {
                    writeln!(f, "Updated:     {}", timestamp)?;
                }
            }
            None => writeln!(f, "Readings:    waiting for data")?,
        }

        writeln!(f, "LED:         {}", self.led.label())?;
        if self.loading {
            writeln!(f, "Command:     in progress")?;
        }
        if let Some(error) = &self.command_error {
            writeln!(f, "Last error:  {}", error)?;
        }
        Ok(())
    }
}
