//! MQTT over WebSocket transport backed by rumqttc.

use super::transport::{SessionOptions, TelemetryTransport, TransportEvent, TransportLink};
use crate::error::{ConsoleError, Result};
use async_trait::async_trait;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet, QoS, SubscribeReasonCode, Transport,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Opens rumqttc sessions over `ws://host:port/mqtt`.
#[derive(Debug, Default, Clone)]
pub struct MqttWsTransport;

impl MqttWsTransport {
    pub fn new() -> Self {
        Self
    }
}

/// How long `close()` waits for the DISCONNECT packet to go out.
const DISCONNECT_GRACE: Duration = Duration::from_millis(500);

/// A live rumqttc session plus the task polling its event loop.
struct MqttWsLink {
    client: AsyncClient,
    driver: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl TelemetryTransport for MqttWsTransport {
    async fn open(
        &self,
        options: SessionOptions,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Arc<dyn TransportLink>> {
        if !options.url.starts_with("ws://") && !options.url.starts_with("wss://") {
            return Err(ConsoleError::Transport(format!(
                "URL must start with ws:// or wss://, got: {}",
                options.url
            )));
        }

        let mut mqtt = MqttOptions::new(&options.client_id, &options.url, options.port);
        mqtt.set_transport(Transport::Ws);
        mqtt.set_keep_alive(options.keep_alive);
        mqtt.set_clean_session(options.clean_session);
        mqtt.set_credentials(&options.credentials.username, &options.credentials.password);

        let (client, event_loop) = AsyncClient::new(mqtt, 64);

        info!(
            "[MQTT] Opening session {} to {}",
            options.client_id, options.url
        );

        let driver = tokio::spawn(drive(event_loop, events, options.reconnect_period));

        Ok(Arc::new(MqttWsLink {
            client,
            driver: Mutex::new(Some(driver)),
        }))
    }
}

#[async_trait]
impl TransportLink for MqttWsLink {
    async fn subscribe(&self, topic: &str) -> Result<()> {
        info!("[MQTT] Subscribing to {}", topic);
        self.client
            .subscribe(topic, QoS::AtMostOnce)
            .await
            .map_err(|e| ConsoleError::Subscribe {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    async fn close(&self) {
        let driver = self.driver.lock().take();
        let Some(mut driver) = driver else {
            return;
        };

        // The driver stops by itself once DISCONNECT has been written
        match self.client.try_disconnect() {
            Ok(()) => {
                if tokio::time::timeout(DISCONNECT_GRACE, &mut driver).await.is_err() {
                    debug!("[MQTT] DISCONNECT not flushed within {:?}", DISCONNECT_GRACE);
                }
            }
            Err(e) => debug!("[MQTT] Disconnect request not queued: {}", e),
        }
        // The event loop would otherwise keep reconnecting on its own
        driver.abort();
    }
}

/// Poll the event loop until the receiver goes away, translating rumqttc
/// events into [`TransportEvent`]s.
///
/// rumqttc reconnects on the next `poll()` after an error; the pause between
/// attempts is the reconnect period.
async fn drive(
    mut event_loop: EventLoop,
    events: mpsc::Sender<TransportEvent>,
    reconnect_period: Duration,
) {
    let mut session_up = false;

    loop {
        let outcome = match event_loop.poll().await {
            Ok(event) => {
                let translated = translate(event);
                if translated == Some(TransportEvent::Connected) {
                    session_up = true;
                }
                translated
            }
            Err(e) => {
                let failure = poll_failure(&e, session_up);
                session_up = false;
                match &failure {
                    TransportEvent::Closed => warn!("[MQTT] Connection lost: {}", e),
                    _ => error!("[MQTT] Connection error: {}", e),
                }
                if events.send(failure).await.is_err() {
                    break;
                }
                tokio::time::sleep(reconnect_period).await;
                warn!("[MQTT] Reconnecting");
                Some(TransportEvent::Reconnecting)
            }
        };

        if let Some(event) = outcome {
            let closing = event == TransportEvent::Closed;
            if events.send(event).await.is_err() {
                debug!("[MQTT] Event receiver dropped, stopping event loop");
                break;
            }
            if closing {
                break;
            }
        }
    }
}

/// Event for a failed `poll()`.
///
/// Losing an established session (socket closed, I/O or keep-alive
/// failure) is a close. Everything else, including any failure before the
/// broker accepted the session, is an error.
fn poll_failure(err: &ConnectionError, session_up: bool) -> TransportEvent {
    let dropped = matches!(
        err,
        ConnectionError::Io(_)
            | ConnectionError::MqttState(_)
            | ConnectionError::NetworkTimeout
            | ConnectionError::FlushTimeout
    );

    if session_up && dropped {
        TransportEvent::Closed
    } else {
        TransportEvent::Error(err.to_string())
    }
}

fn translate(event: Event) -> Option<TransportEvent> {
    match event {
        Event::Incoming(Packet::ConnAck(ack)) => {
            if ack.code == ConnectReturnCode::Success {
                info!("[MQTT] Connected to broker");
                Some(TransportEvent::Connected)
            } else {
                Some(TransportEvent::Error(format!(
                    "Connection refused: {:?}",
                    ack.code
                )))
            }
        }
        Event::Incoming(Packet::Publish(publish)) => Some(TransportEvent::Message {
            topic: publish.topic.clone(),
            payload: publish.payload.to_vec(),
        }),
        Event::Incoming(Packet::SubAck(ack)) => {
            if ack
                .return_codes
                .iter()
                .any(|code| matches!(code, SubscribeReasonCode::Failure))
            {
                Some(TransportEvent::SubscribeFailed(format!(
                    "Broker rejected subscription (packet {})",
                    ack.pkid
                )))
            } else {
                debug!("[MQTT] Subscription acknowledged: {:?}", ack.return_codes);
                None
            }
        }
        Event::Incoming(Packet::Disconnect) | Event::Outgoing(Outgoing::Disconnect) => {
            info!("[MQTT] Session closed");
            Some(TransportEvent::Closed)
        }
        other => {
            debug!("[MQTT] Unhandled event: {:?}", other);
            None
        }
    }
}
