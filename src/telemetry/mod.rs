//! Live device telemetry over MQTT.
//!
//! A [`SubscriptionManager`] follows one device's `iot/sensors/{id}/#` topics
//! through a pluggable [`TelemetryTransport`] (rumqttc over WebSocket by
//! default) or a synthetic mock feed.

mod manager;
mod mock;
mod mqtt;
mod reading;
mod state;
mod transport;

pub use manager::{SubscriptionManager, telemetry_topic};
pub use mock::synthetic_reading;
pub use mqtt::MqttWsTransport;
pub use reading::SensorReading;
pub use state::{ConnectionState, LinkStatus};
pub use transport::{
    Credentials, SessionOptions, TelemetryTransport, TransportEvent, TransportLink,
};
