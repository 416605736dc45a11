//! Connection state of a telemetry link.

use serde::Serialize;
use strum::{AsRefStr, Display};

/// Lifecycle of the transport owned by a `SubscriptionManager`.
///
/// `Disconnected` is also the initial state before any `connect()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display, AsRefStr)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

/// Connection state paired with the last error message, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkStatus {
    pub state: ConnectionState,
    pub error: Option<String>,
}

impl LinkStatus {
    pub fn disconnected() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            error: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

impl Default for LinkStatus {
    fn default() -> Self {
        Self::disconnected()
    }
}
