//! Synthetic telemetry for development and demos.
//!
//! Produces randomized readings within realistic ranges instead of
//! connecting to a broker.

use super::reading::SensorReading;
use chrono::Utc;
use log::debug;
use rand::Rng;
use std::ops::RangeInclusive;
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior, interval};

pub const TEMPERATURE_RANGE: RangeInclusive<f64> = 20.0..=35.0;
pub const HUMIDITY_RANGE: RangeInclusive<f64> = 30.0..=70.0;
pub const PRESSURE_RANGE: RangeInclusive<f64> = 1000.0..=1020.0;
pub const LIGHT_RANGE: RangeInclusive<f64> = 0.0..=100.0;

/// Generate one random reading for `device_id`.
pub fn synthetic_reading(device_id: &str, rng: &mut impl Rng) -> SensorReading {
    SensorReading {
        temperature: Some(round1(rng.gen_range(TEMPERATURE_RANGE))),
        humidity: Some(round1(rng.gen_range(HUMIDITY_RANGE))),
        pressure: Some(round1(rng.gen_range(PRESSURE_RANGE))),
        light: Some(round1(rng.gen_range(LIGHT_RANGE))),
        timestamp: Some(Utc::now().to_rfc3339()),
        device_id: Some(device_id.to_string()),
    }
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Spawn a task handing a fresh synthetic reading to `publish` every `period`.
///
/// The first reading is published immediately. Abort the returned handle to
/// stop the feed.
pub fn run_mock_feed<F>(device_id: String, period: Duration, publish: F) -> JoinHandle<()>
where
    F: Fn(SensorReading) + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let reading = synthetic_reading(&device_id, &mut rand::thread_rng());
            debug!("[Mock] {} reading: {:?}", device_id, reading);
            publish(reading);
        }
    })
}
