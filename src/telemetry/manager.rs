//! Live telemetry subscription for a single device.
//!
//! The manager owns at most one transport link (or one mock feed) at a time.
//! Connection state and the latest reading are published on watch channels,
//! so any number of observers can follow them without callbacks.

use super::mock::run_mock_feed;
use super::reading::SensorReading;
use super::state::{ConnectionState, LinkStatus};
use super::transport::{
    Credentials, SessionOptions, TelemetryTransport, TransportEvent, TransportLink,
};
use crate::config::{MockConfig, MqttConfig};
use crate::error::ConsoleError;
use chrono::Utc;
use log::{debug, info, warn};
use parking_lot::Mutex as SyncMutex;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tokio::task::JoinHandle;

/// Telemetry topic filter for one device.
pub fn telemetry_topic(device_id: &str) -> String {
    format!("iot/sensors/{}/#", device_id)
}

/// Device id used by the mock feed when none was given.
const MOCK_DEVICE_ID: &str = "mock-device";

/// What the manager currently owns.
enum Active {
    Idle,
    Live {
        link: Arc<dyn TransportLink>,
        pump: JoinHandle<()>,
    },
    Mock {
        feed: JoinHandle<()>,
    },
}

/// Observable state shared with the event pump.
struct Shared {
    status: watch::Sender<LinkStatus>,
    snapshot: watch::Sender<Option<SensorReading>>,
}

#[derive(Clone)]
struct ConnectParams {
    device_id: String,
    credentials: Option<Credentials>,
}

pub struct SubscriptionManager {
    transport: Arc<dyn TelemetryTransport>,
    mqtt: MqttConfig,
    mock: MockConfig,
    shared: Arc<Shared>,
    /// Async lock: connect/disconnect serialize on it across teardown awaits
    active: AsyncMutex<Active>,
    last_params: SyncMutex<Option<ConnectParams>>,
}

impl SubscriptionManager {
    pub fn new(transport: Arc<dyn TelemetryTransport>, mqtt: MqttConfig, mock: MockConfig) -> Self {
        let (status, _) = watch::channel(LinkStatus::disconnected());
        let (snapshot, _) = watch::channel(None);
        Self {
            transport,
            mqtt,
            mock,
            shared: Arc::new(Shared { status, snapshot }),
            active: AsyncMutex::new(Active::Idle),
            last_params: SyncMutex::new(None),
        }
    }

    pub fn is_mock(&self) -> bool {
        self.mock.enabled
    }

    /// Current connection state and error message.
    pub fn status(&self) -> LinkStatus {
        self.shared.status.borrow().clone()
    }

    /// Stable handle for following connection state changes.
    pub fn watch_status(&self) -> watch::Receiver<LinkStatus> {
        self.shared.status.subscribe()
    }

    /// Latest reading, if any arrived since the device was selected.
    pub fn latest(&self) -> Option<SensorReading> {
        self.shared.snapshot.borrow().clone()
    }

    /// Stable handle for following reading snapshots.
    pub fn watch_readings(&self) -> watch::Receiver<Option<SensorReading>> {
        self.shared.snapshot.subscribe()
    }

    /// Start following `device_id`.
    ///
    /// In mock mode this starts the synthetic feed. Otherwise a missing device
    /// id or missing credentials put the manager in the error state without
    /// any connection attempt. Any previous link or feed is torn down first.
    /// Failures never escape; they end up in [`Self::status`].
    pub async fn connect(&self, device_id: &str, credentials: Option<Credentials>) {
        let device_id = device_id.trim();
        let device_changed = self.remember(device_id, credentials.clone());

        if self.mock.enabled {
            self.start_mock(device_id, device_changed).await;
            return;
        }

        let credentials = match (device_id.is_empty(), credentials) {
            (true, _) => {
                warn!("[MQTT] Cannot connect: device id is missing");
                Err(ConsoleError::MissingDeviceId)
            }
            (false, None) => {
                warn!("[MQTT] Cannot connect {}: credentials are missing", device_id);
                Err(ConsoleError::MissingCredentials(device_id.to_string()))
            }
            (false, Some(credentials)) => Ok(credentials),
        };

        let mut active = self.active.lock().await;
        teardown(&mut active).await;
        if device_changed {
            self.clear_snapshot();
        }

        let credentials = match credentials {
            Ok(credentials) => credentials,
            Err(e) => {
                self.set_status(ConnectionState::Error, Some(e.to_string()));
                return;
            }
        };
        self.set_status(ConnectionState::Connecting, None);

        let options = self.session_options(device_id, credentials);
        info!(
            "[MQTT] Connecting {} to {} as {}",
            device_id, options.url, options.client_id
        );

        let (events_tx, events_rx) = mpsc::channel(64);
        match self.transport.open(options, events_tx).await {
            Ok(link) => {
                let pump = tokio::spawn(pump_events(
                    events_rx,
                    EventContext {
                        device_id: device_id.to_string(),
                        topic: telemetry_topic(device_id),
                        link: link.clone(),
                        shared: self.shared.clone(),
                    },
                ));
                *active = Active::Live { link, pump };
            }
            Err(e) => {
                warn!("[MQTT] Failed to open transport for {}: {}", device_id, e);
                self.set_status(ConnectionState::Error, Some(e.to_string()));
            }
        }
    }

    /// End the link and stop the mock feed. Safe to call repeatedly.
    pub async fn disconnect(&self) {
        let mut active = self.active.lock().await;
        teardown(&mut active).await;
        self.set_status(ConnectionState::Disconnected, None);
    }

    /// Disconnect, pause briefly, then connect again with the last parameters.
    pub async fn reconnect(&self) {
        self.disconnect().await;
        tokio::time::sleep(self.mqtt.reconnect_delay()).await;

        let params = self.last_params.lock().clone();
        match params {
            Some(params) => self.connect(&params.device_id, params.credentials).await,
            None => warn!("[MQTT] Reconnect requested before any connect"),
        }
    }

    /// Record the parameters for `reconnect()`. Returns whether the device
    /// differs from the previous one.
    fn remember(&self, device_id: &str, credentials: Option<Credentials>) -> bool {
        let mut last = self.last_params.lock();
        let device_changed = last.as_ref().is_none_or(|p| p.device_id != device_id);
        *last = Some(ConnectParams {
            device_id: device_id.to_string(),
            credentials,
        });
        device_changed
    }

    /// Readings belong to the previous device. Only call after teardown, so
    /// no old pump or feed can publish afterwards.
    fn clear_snapshot(&self) {
        self.shared.snapshot.send_replace(None);
    }

    async fn start_mock(&self, device_id: &str, device_changed: bool) {
        let device_id = if device_id.is_empty() {
            MOCK_DEVICE_ID
        } else {
            device_id
        };

        let mut active = self.active.lock().await;
        teardown(&mut active).await;
        if device_changed {
            self.clear_snapshot();
        }

        info!(
            "[Mock] Generating telemetry for {} every {:?}",
            device_id,
            self.mock.interval()
        );
        self.set_status(ConnectionState::Connected, None);
        let shared = self.shared.clone();
        let feed = run_mock_feed(device_id.to_string(), self.mock.interval(), move |reading| {
            shared.snapshot.send_replace(Some(reading));
        });
        *active = Active::Mock { feed };
    }

    fn session_options(&self, device_id: &str, credentials: Credentials) -> SessionOptions {
        let host = credentials
            .broker_host
            .clone()
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| self.mqtt.broker_host.clone());

        SessionOptions {
            url: format!("ws://{}:{}/mqtt", host, self.mqtt.ws_port),
            port: self.mqtt.ws_port,
            client_id: format!(
                "{}_{}_{}",
                self.mqtt.client_id_prefix,
                device_id,
                Utc::now().timestamp_millis()
            ),
            credentials,
            clean_session: true,
            keep_alive: self.mqtt.keep_alive(),
            reconnect_period: self.mqtt.reconnect_period(),
        }
    }

    fn set_status(&self, state: ConnectionState, error: Option<String>) {
        self.shared.status.send_replace(LinkStatus { state, error });
    }
}

impl Drop for SubscriptionManager {
    fn drop(&mut self) {
        match self.active.get_mut() {
            Active::Live { pump, .. } => pump.abort(),
            Active::Mock { feed } => feed.abort(),
            Active::Idle => {}
        }
    }
}

async fn teardown(active: &mut Active) {
    match std::mem::replace(active, Active::Idle) {
        Active::Live { link, pump } => {
            debug!("[MQTT] Closing previous link");
            pump.abort();
            // Wait for cancellation so no stale event lands after teardown
            let _ = pump.await;
            link.close().await;
        }
        Active::Mock { feed } => {
            debug!("[Mock] Stopping feed");
            feed.abort();
            let _ = feed.await;
        }
        Active::Idle => {}
    }
}

struct EventContext {
    device_id: String,
    topic: String,
    link: Arc<dyn TransportLink>,
    shared: Arc<Shared>,
}

async fn pump_events(mut events: mpsc::Receiver<TransportEvent>, ctx: EventContext) {
    while let Some(event) = events.recv().await {
        apply_event(&ctx, event).await;
    }
    debug!("[MQTT] Event stream for {} ended", ctx.device_id);
}

async fn apply_event(ctx: &EventContext, event: TransportEvent) {
    match event {
        TransportEvent::Connected => {
            let error = match ctx.link.subscribe(&ctx.topic).await {
                Ok(()) => None,
                Err(e) => {
                    warn!("[MQTT] {}", e);
                    Some(e.to_string())
                }
            };
            info!("[MQTT] {} connected", ctx.device_id);
            ctx.shared.status.send_replace(LinkStatus {
                state: ConnectionState::Connected,
                error,
            });
        }
        TransportEvent::Message { topic, payload } => {
            let now = Utc::now().to_rfc3339();
            match SensorReading::from_payload(&payload, &ctx.device_id, &now) {
                Ok(reading) => {
                    debug!("[MQTT] Reading on {}: {:?}", topic, reading);
                    ctx.shared.snapshot.send_replace(Some(reading));
                }
                Err(e) => warn!("[MQTT] Ignoring malformed payload on {}: {}", topic, e),
            }
        }
        TransportEvent::SubscribeFailed(reason) => {
            warn!("[MQTT] Subscription to {} failed: {}", ctx.topic, reason);
            ctx.shared.status.send_modify(|status| {
                status.error = Some(format!("Subscription to {} failed: {}", ctx.topic, reason));
            });
        }
        TransportEvent::Error(message) => {
            ctx.shared.status.send_replace(LinkStatus {
                state: ConnectionState::Error,
                error: Some(message),
            });
        }
        TransportEvent::Reconnecting => {
            ctx.shared.status.send_modify(|status| {
                status.state = ConnectionState::Connecting;
            });
        }
        TransportEvent::Closed => {
            ctx.shared.status.send_modify(|status| {
                status.state = ConnectionState::Disconnected;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::telemetry::transport::fake::FakeTransport;
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    fn manager(transport: &FakeTransport, mock: bool) -> SubscriptionManager {
        let mut config = Config::default();
        config.mock.enabled = mock;
        config.mock.interval_ms = 20;
        config.mqtt.reconnect_delay_ms = 10;
        SubscriptionManager::new(Arc::new(transport.clone()), config.mqtt, config.mock)
    }

    fn creds() -> Option<Credentials> {
        Some(Credentials::new("d1-user", "secret"))
    }

    async fn wait_status(
        manager: &SubscriptionManager,
        pred: impl FnMut(&LinkStatus) -> bool,
    ) -> LinkStatus {
        let mut rx = manager.watch_status();
        let status = timeout(WAIT, rx.wait_for(pred))
            .await
            .expect("status not reached")
            .expect("status channel closed")
            .clone();
        status
    }

    async fn wait_reading(manager: &SubscriptionManager) -> SensorReading {
        let mut rx = manager.watch_readings();
        let reading = timeout(WAIT, rx.wait_for(|r| r.is_some()))
            .await
            .expect("no reading")
            .expect("reading channel closed")
            .clone();
        reading.expect("reading present")
    }

    #[tokio::test]
    async fn test_connect_then_connected_subscribes_once() {
        let transport = FakeTransport::default();
        let manager = manager(&transport, false);

        manager.connect("d1", creds()).await;
        assert_eq!(manager.status().state, ConnectionState::Connecting);

        {
            let state = transport.state.lock();
            let opened = &state.opened[0];
            assert_eq!(opened.url, "ws://localhost:8083/mqtt");
            assert!(opened.client_id.starts_with("iot_console_d1_"));
            assert!(opened.clean_session);
            assert_eq!(opened.credentials.username, "d1-user");
        }

        transport.emit(TransportEvent::Connected).await;
        let status = wait_status(&manager, |s| s.is_connected()).await;
        assert!(status.error.is_none());
        assert_eq!(
            transport.state.lock().subscriptions,
            vec!["iot/sensors/d1/#".to_string()]
        );
    }

    #[tokio::test]
    async fn test_broker_host_from_credentials() {
        let transport = FakeTransport::default();
        let manager = manager(&transport, false);

        manager
            .connect("d1", Some(Credentials::new("u", "p").with_broker_host("emqx.lan")))
            .await;
        assert_eq!(
            transport.state.lock().opened[0].url,
            "ws://emqx.lan:8083/mqtt"
        );
    }

    #[tokio::test]
    async fn test_native_broker_port_does_not_change_websocket_port() {
        let transport = FakeTransport::default();
        let manager = manager(&transport, false);
        let credentials = Credentials::new("u", "p")
            .with_broker_host("emqx.lan")
            .with_broker_port(1883);

        manager.connect("d1", Some(credentials)).await;
        let state = transport.state.lock();
        assert_eq!(state.opened[0].port, 8083);
        assert_eq!(state.opened[0].url, "ws://emqx.lan:8083/mqtt");
        assert_eq!(state.opened[0].credentials.broker_port, Some(1883));
    }

    #[tokio::test]
    async fn test_subscribe_failure_keeps_connected() {
        let transport = FakeTransport::default();
        transport.state.lock().fail_subscribe = Some("not authorized".to_string());
        let manager = manager(&transport, false);

        manager.connect("d1", creds()).await;
        transport.emit(TransportEvent::Connected).await;
        let status = wait_status(&manager, |s| s.is_connected()).await;
        assert!(status.error.unwrap().contains("not authorized"));

        transport
            .emit(TransportEvent::SubscribeFailed("rejected".to_string()))
            .await;
        let status = wait_status(&manager, |s| {
            s.error.as_deref().is_some_and(|e| e.contains("rejected"))
        })
        .await;
        assert_eq!(status.state, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_message_updates_snapshot() {
        let transport = FakeTransport::default();
        let manager = manager(&transport, false);
        manager.connect("d1", creds()).await;

        transport
            .emit(TransportEvent::Message {
                topic: "iot/sensors/d1/env".to_string(),
                payload: br#"{"device_id":"d1","timestamp":"T","readings":{"temperature":{"value":21.5,"unit":"C"}}}"#.to_vec(),
            })
            .await;

        let reading = wait_reading(&manager).await;
        assert_eq!(
            reading,
            SensorReading {
                temperature: Some(21.5),
                timestamp: Some("T".to_string()),
                device_id: Some("d1".to_string()),
                ..Default::default()
            }
        );
    }

    #[tokio::test]
    async fn test_malformed_message_leaves_state_untouched() {
        let transport = FakeTransport::default();
        let manager = manager(&transport, false);
        manager.connect("d1", creds()).await;
        transport.emit(TransportEvent::Connected).await;
        wait_status(&manager, |s| s.is_connected()).await;

        transport
            .emit(TransportEvent::Message {
                topic: "iot/sensors/d1/env".to_string(),
                payload: br#"{"readings":{"humidity":{"value":40}}}"#.to_vec(),
            })
            .await;
        let before = wait_reading(&manager).await;

        for garbage in [&b"{oops"[..], &b""[..], &b"\xff\xfe"[..]] {
            transport
                .emit(TransportEvent::Message {
                    topic: "iot/sensors/d1/env".to_string(),
                    payload: garbage.to_vec(),
                })
                .await;
        }
        // Events are applied in order; once the marker lands the garbage was processed
        transport
            .emit(TransportEvent::SubscribeFailed("marker".to_string()))
            .await;
        let status = wait_status(&manager, |s| {
            s.error.as_deref().is_some_and(|e| e.contains("marker"))
        })
        .await;

        assert_eq!(status.state, ConnectionState::Connected);
        assert_eq!(manager.latest(), Some(before));
    }

    #[tokio::test]
    async fn test_transport_lifecycle_events() {
        let transport = FakeTransport::default();
        let manager = manager(&transport, false);
        manager.connect("d1", creds()).await;

        transport
            .emit(TransportEvent::Error("broker unreachable".to_string()))
            .await;
        let status = wait_status(&manager, |s| s.state == ConnectionState::Error).await;
        assert_eq!(status.error.as_deref(), Some("broker unreachable"));

        transport.emit(TransportEvent::Reconnecting).await;
        wait_status(&manager, |s| s.state == ConnectionState::Connecting).await;

        transport.emit(TransportEvent::Closed).await;
        wait_status(&manager, |s| s.state == ConnectionState::Disconnected).await;
    }

    #[tokio::test]
    async fn test_missing_parameters_set_error_without_connecting() {
        let transport = FakeTransport::default();
        let manager = manager(&transport, false);

        manager.connect("d1", None).await;
        let status = manager.status();
        assert_eq!(status.state, ConnectionState::Error);
        assert!(status.error.unwrap().contains("credentials"));

        manager.connect("  ", creds()).await;
        assert_eq!(manager.status().state, ConnectionState::Error);
        assert!(transport.state.lock().opened.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_connect_closes_previous_link() {
        let transport = FakeTransport::default();
        let manager = manager(&transport, false);

        manager.connect("d1", creds()).await;
        manager.connect("d2", None).await;

        assert_eq!(manager.status().state, ConnectionState::Error);
        let state = transport.state.lock();
        assert_eq!(state.opened.len(), 1);
        assert_eq!(state.live(), 0);
    }

    #[tokio::test]
    async fn test_open_failure_sets_error() {
        let transport = FakeTransport::default();
        transport.state.lock().fail_open = Some("bad url".to_string());
        let manager = manager(&transport, false);

        manager.connect("d1", creds()).await;
        let status = manager.status();
        assert_eq!(status.state, ConnectionState::Error);
        assert!(status.error.unwrap().contains("bad url"));
    }

    #[tokio::test]
    async fn test_connect_twice_keeps_one_live_link() {
        let transport = FakeTransport::default();
        let manager = manager(&transport, false);

        manager.connect("d1", creds()).await;
        manager.connect("d1", creds()).await;

        let state = transport.state.lock();
        assert_eq!(state.opened.len(), 2);
        assert_eq!(state.closed, 1);
        assert_eq!(state.live(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let transport = FakeTransport::default();
        let manager = manager(&transport, false);

        manager.disconnect().await;
        manager.connect("d1", creds()).await;
        manager.disconnect().await;
        manager.disconnect().await;

        assert_eq!(manager.status().state, ConnectionState::Disconnected);
        assert_eq!(transport.state.lock().closed, 1);
        assert_eq!(transport.state.lock().live(), 0);
    }

    #[tokio::test]
    async fn test_reconnect_reuses_last_parameters() {
        let transport = FakeTransport::default();
        let manager = manager(&transport, false);

        manager.reconnect().await;
        assert!(transport.state.lock().opened.is_empty());

        manager.connect("d1", creds()).await;
        manager.reconnect().await;

        let state = transport.state.lock();
        assert_eq!(state.opened.len(), 2);
        assert_eq!(state.live(), 1);
        assert!(state.opened[1].client_id.starts_with("iot_console_d1_"));
        assert_eq!(state.opened[1].credentials, creds().unwrap());
    }

    #[tokio::test]
    async fn test_switching_device_clears_snapshot() {
        let transport = FakeTransport::default();
        let manager = manager(&transport, false);
        manager.connect("d1", creds()).await;
        transport
            .emit(TransportEvent::Message {
                topic: "iot/sensors/d1/env".to_string(),
                payload: br#"{"readings":{"light":{"value":3}}}"#.to_vec(),
            })
            .await;
        wait_reading(&manager).await;

        manager.connect("d2", creds()).await;
        assert!(manager.latest().is_none());
        assert_eq!(
            transport.state.lock().opened[1].client_id.split('_').nth(2),
            Some("d2")
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_switch_under_traffic_never_shows_previous_device() {
        for _ in 0..50 {
            let transport = FakeTransport::default();
            let manager = manager(&transport, false);
            manager.connect("d1", creds()).await;

            let d1_events = transport.events();
            let flood = tokio::spawn(async move {
                let payload = br#"{"readings":{"temperature":{"value":21}}}"#.to_vec();
                let message = || TransportEvent::Message {
                    topic: "iot/sensors/d1/env".to_string(),
                    payload: payload.clone(),
                };
                while d1_events.send(message()).await.is_ok() {}
            });
            wait_reading(&manager).await;

            manager.connect("d2", creds()).await;
            tokio::time::sleep(Duration::from_millis(5)).await;
            let shown = manager.latest().and_then(|r| r.device_id);
            assert_ne!(shown.as_deref(), Some("d1"));
            flood.abort();
        }
    }

    #[tokio::test]
    async fn test_disconnect_clears_stale_error() {
        let transport = FakeTransport::default();
        let manager = manager(&transport, false);
        manager.connect("d1", creds()).await;
        transport
            .emit(TransportEvent::Error("broker unreachable".to_string()))
            .await;
        wait_status(&manager, |s| s.state == ConnectionState::Error).await;

        manager.disconnect().await;
        assert_eq!(manager.status(), LinkStatus::disconnected());
    }

    #[tokio::test]
    async fn test_mock_mode_never_opens_transport() {
        let transport = FakeTransport::default();
        let manager = manager(&transport, true);

        manager.connect("", None).await;
        assert!(manager.status().is_connected());

        let reading = wait_reading(&manager).await;
        assert_eq!(reading.device_id.as_deref(), Some(MOCK_DEVICE_ID));
        assert!(transport.state.lock().opened.is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_stops_mock_feed() {
        let transport = FakeTransport::default();
        let manager = manager(&transport, true);

        manager.connect("d1", None).await;
        wait_reading(&manager).await;
        manager.disconnect().await;
        assert_eq!(manager.status().state, ConnectionState::Disconnected);

        let mut rx = manager.watch_readings();
        rx.mark_unchanged();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!rx.has_changed().unwrap());
    }
}
