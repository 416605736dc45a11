//! Probe binary for live device telemetry.
//!
//! Usage:
//!   DEVICE_ID=d1 MQTT_USERNAME=u MQTT_PASSWORD=p cargo run --bin telemetry-probe
//!
//! Connects to the broker over WebSocket, subscribes to the device's
//! telemetry topics, and logs every connection change and reading until
//! Ctrl+C. Set MQTT_MOCK=true to try it without a broker.

use log::{info, warn};
use std::sync::Arc;

use iot_device_console::config::{self, Config};
use iot_device_console::telemetry::{
    Credentials, MqttWsTransport, SubscriptionManager, telemetry_topic,
};

#[tokio::main]
async fn main() {
    // Load .env file before anything else
    config::load_dotenv();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let config = Config::from_env();
    let device_id = std::env::var("DEVICE_ID").unwrap_or_default();
    let credentials = match (std::env::var("MQTT_USERNAME"), std::env::var("MQTT_PASSWORD")) {
        (Ok(username), Ok(password)) => Some(Credentials::new(username, password)),
        _ => None,
    };

    info!(
        "Probing {} on ws://{}:{}/mqtt (mock: {})",
        telemetry_topic(&device_id),
        config.mqtt.broker_host,
        config.mqtt.ws_port,
        config.mock.enabled
    );

    let manager = Arc::new(SubscriptionManager::new(
        Arc::new(MqttWsTransport::new()),
        config.mqtt,
        config.mock,
    ));
    let mut status = manager.watch_status();
    let mut readings = manager.watch_readings();

    manager.connect(&device_id, credentials).await;

    let status_handle = tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = status.borrow_and_update().clone();
            match current.error {
                Some(e) => warn!("State: {} ({})", current.state, e),
                None => info!("State: {}", current.state),
            }
        }
    });

    let reading_handle = tokio::spawn(async move {
        while readings.changed().await.is_ok() {
            let reading = readings.borrow_and_update().clone();
            if let Some(r) = reading {
                info!(
                    ">>> {:?} at {:?}: temp={:?}°C humidity={:?}% pressure={:?}hPa light={:?}%",
                    r.device_id, r.timestamp, r.temperature, r.humidity, r.pressure, r.light
                );
            }
        }
    });

    info!("Listening... Press Ctrl+C to exit.");

    tokio::select! {
        _ = status_handle => {
            warn!("Status watcher ended");
        }
        _ = reading_handle => {
            warn!("Reading watcher ended");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
        }
    }

    manager.disconnect().await;
    info!("Probe complete.");
}
