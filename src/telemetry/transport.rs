//! Transport abstraction between the subscription manager and the broker.
//!
//! The manager never talks to an MQTT library directly. It opens a
//! [`TransportLink`] through a [`TelemetryTransport`] and consumes the
//! [`TransportEvent`]s the link reports, so tests can drive the manager
//! with a fake transport.

use crate::error::Result;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// MQTT credentials of one device. Supplied by the caller, never stored.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    /// Overrides the configured broker host
    pub broker_host: Option<String>,
    /// Native MQTT port issued with the credentials. Kept for callers and
    /// logs only: sessions always use the configured WebSocket port.
    pub broker_port: Option<u16>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            broker_host: None,
            broker_port: None,
        }
    }

    pub fn with_broker_host(mut self, host: impl Into<String>) -> Self {
        self.broker_host = Some(host.into());
        self
    }

    pub fn with_broker_port(mut self, port: u16) -> Self {
        self.broker_port = Some(port);
        self
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("broker_host", &self.broker_host)
            .field("broker_port", &self.broker_port)
            .finish()
    }
}

/// Everything a transport needs to open one session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Full WebSocket URL, e.g. `ws://broker:8083/mqtt`
    pub url: String,
    pub port: u16,
    pub client_id: String,
    pub credentials: Credentials,
    pub clean_session: bool,
    pub keep_alive: Duration,
    pub reconnect_period: Duration,
}

/// Events reported by a live link, in delivery order.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Broker accepted the session
    Connected,
    /// Publish received on a subscribed topic
    Message { topic: String, payload: Vec<u8> },
    /// Broker rejected a subscription
    SubscribeFailed(String),
    Error(String),
    /// Transport is retrying on its own
    Reconnecting,
    Closed,
}

/// One open session. Dropping the manager's last handle does not close it;
/// `close()` must be called.
#[async_trait]
pub trait TransportLink: Send + Sync {
    async fn subscribe(&self, topic: &str) -> Result<()>;

    /// Forcibly end the session and stop any automatic reconnects.
    async fn close(&self);
}

/// Factory for links. `events` receives everything the link reports.
#[async_trait]
pub trait TelemetryTransport: Send + Sync {
    async fn open(
        &self,
        options: SessionOptions,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Arc<dyn TransportLink>>;
}
