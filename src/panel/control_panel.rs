//! Control panel for a single device.
//!
//! Binds user actions to [`CommandDispatcher`] calls and renders the
//! [`SubscriptionManager`] state read-only. Command outcomes are announced
//! as [`PanelEvent`]s on a broadcast channel, so any number of listeners can
//! follow them with their own receiver.

use super::toggle::{ToggleAction, ToggleState};
use super::view::PanelView;
use crate::command::{CommandDispatcher, CommandResponse, DeviceCommand, DispatcherState};
use crate::telemetry::SubscriptionManager;
use async_trait::async_trait;
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde_json::Value;
use std::ops::RangeInclusive;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

pub const DIMMER_RANGE: RangeInclusive<i64> = 0..=100;

const EVENT_CAPACITY: usize = 16;

/// Notification for whoever hosts the panel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PanelEvent {
    Success(String),
    Error(String),
}

/// Asks the user before a destructive action.
#[async_trait]
pub trait Confirm: Send + Sync {
    async fn confirm(&self, prompt: &str) -> bool;
}

/// Confirms everything. For non-interactive use.
pub struct AlwaysConfirm;

#[async_trait]
impl Confirm for AlwaysConfirm {
    async fn confirm(&self, _prompt: &str) -> bool {
        true
    }
}

pub struct ControlPanel {
    device_id: String,
    dispatcher: Arc<CommandDispatcher>,
    manager: Arc<SubscriptionManager>,
    confirm: Arc<dyn Confirm>,
    led: Arc<Mutex<ToggleState>>,
    events: broadcast::Sender<PanelEvent>,
    notifier: JoinHandle<()>,
}

/// Settles a pending LED request. Dropped unsettled (the call was
/// cancelled) it rolls back like a failure.
struct LedRequest {
    led: Arc<Mutex<ToggleState>>,
    settled: bool,
}

impl LedRequest {
    fn settle(mut self, action: ToggleAction) {
        let mut led = self.led.lock();
        *led = led.reduce(action);
        self.settled = true;
    }
}

impl Drop for LedRequest {
    fn drop(&mut self) {
        if !self.settled {
            let mut led = self.led.lock();
            *led = led.reduce(ToggleAction::Failed);
        }
    }
}

impl ControlPanel {
    /// Must be called inside a tokio runtime: spawns the notification task.
    pub fn new(
        device_id: impl Into<String>,
        dispatcher: Arc<CommandDispatcher>,
        manager: Arc<SubscriptionManager>,
        confirm: Arc<dyn Confirm>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let state = dispatcher.watch();
        let seen = slot_ids(&state.borrow());
        let notifier = tokio::spawn(notify_changes(state, events.clone(), seen));

        Self {
            device_id: device_id.into(),
            dispatcher,
            manager,
            confirm,
            led: Arc::new(Mutex::new(ToggleState::default())),
            events,
            notifier,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Stable handle for panel notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<PanelEvent> {
        self.events.subscribe()
    }

    pub fn led(&self) -> ToggleState {
        *self.led.lock()
    }

    pub fn view(&self) -> PanelView {
        let dispatcher = self.dispatcher.state();
        PanelView {
            device_id: self.device_id.clone(),
            status: self.manager.status(),
            reading: self.manager.latest(),
            led: self.led(),
            loading: dispatcher.loading,
            command_error: dispatcher.error.map(|e| e.message),
        }
    }

    pub async fn led_on(&self) -> Option<CommandResponse> {
        self.drive_led(DeviceCommand::LedOn, |_| true).await
    }

    pub async fn led_off(&self) -> Option<CommandResponse> {
        self.drive_led(DeviceCommand::LedOff, |_| false).await
    }

    pub async fn led_toggle(&self) -> Option<CommandResponse> {
        self.drive_led(DeviceCommand::LedToggle, |current| !current)
            .await
    }

    pub async fn relay1(&self, on: bool) -> Option<CommandResponse> {
        match on {
            true => self.dispatcher.relay1_on(&self.device_id).await,
            false => self.dispatcher.relay1_off(&self.device_id).await,
        }
    }

    pub async fn relay2(&self, on: bool) -> Option<CommandResponse> {
        match on {
            true => self.dispatcher.relay2_on(&self.device_id).await,
            false => self.dispatcher.relay2_off(&self.device_id).await,
        }
    }

    pub async fn relay_both(&self, on: bool) -> Option<CommandResponse> {
        match on {
            true => self.dispatcher.relay_both_on(&self.device_id).await,
            false => self.dispatcher.relay_both_off(&self.device_id).await,
        }
    }

    /// Slider input. Levels outside 0..=100 are rejected and nothing is sent.
    pub async fn dimmer(&self, level: i64) -> Option<CommandResponse> {
        if !DIMMER_RANGE.contains(&level) {
            self.reject(format!(
                "Dimmer level must be between {} and {}, got {}",
                DIMMER_RANGE.start(),
                DIMMER_RANGE.end(),
                level
            ));
            return None;
        }
        self.dispatcher.dimmer_set(&self.device_id, level).await
    }

    pub async fn read_sensors(&self) -> Option<CommandResponse> {
        self.dispatcher.read_sensors(&self.device_id).await
    }

    pub async fn get_status(&self) -> Option<CommandResponse> {
        self.dispatcher.get_status(&self.device_id).await
    }

    /// Sent only once the [`Confirm`] guard agrees.
    pub async fn restart(&self) -> Option<CommandResponse> {
        let prompt = format!("Restart device {}?", self.device_id);
        if !self.confirm.confirm(&prompt).await {
            info!("[Panel] Restart of {} cancelled", self.device_id);
            return None;
        }
        self.dispatcher.restart(&self.device_id).await
    }

    pub async fn custom(&self, command: &str, params: Option<Value>) -> Option<CommandResponse> {
        self.dispatcher
            .custom(&self.device_id, command, params)
            .await
    }

    async fn drive_led(
        &self,
        command: DeviceCommand,
        target: impl FnOnce(bool) -> bool,
    ) -> Option<CommandResponse> {
        let request = {
            let mut led = self.led.lock();
            if led.is_pending() {
                drop(led);
                self.reject("LED command already in progress".to_string());
                return None;
            }
            *led = led.reduce(ToggleAction::Request(target(led.value())));
            LedRequest {
                led: self.led.clone(),
                settled: false,
            }
        };

        let response = self.dispatcher.execute(&self.device_id, command).await;
        let action = match &response {
            Some(r) if r.success => ToggleAction::Succeeded,
            _ => ToggleAction::Failed,
        };
        request.settle(action);
        debug!("[Panel] LED now {}", self.led().label());
        response
    }

    fn reject(&self, message: String) {
        warn!("[Panel] {}", message);
        let _ = self.events.send(PanelEvent::Error(message));
    }
}

impl Drop for ControlPanel {
    fn drop(&mut self) {
        self.notifier.abort();
    }
}

/// Emit one event per change of the dispatcher's error or last-response
/// slot. Changes are tracked by correlation id, so a repeated identical
/// message still counts as a change.
async fn notify_changes(
    mut state: watch::Receiver<DispatcherState>,
    events: broadcast::Sender<PanelEvent>,
    seen: (Option<Uuid>, Option<Uuid>),
) {
    let (mut seen_error, mut seen_reply) = seen;

    while state.changed().await.is_ok() {
        let current = state.borrow_and_update().clone();

        if let Some(failure) = current.error {
            if seen_error != Some(failure.id) {
                seen_error = Some(failure.id);
                let _ = events.send(PanelEvent::Error(failure.message));
            }
        }

        if let Some(reply) = current.last_response {
            if seen_reply != Some(reply.id) {
                seen_reply = Some(reply.id);
                let message = reply.response.message;
                let event = if reply.response.success {
                    PanelEvent::Success(non_empty(message, "Command sent"))
                } else {
                    PanelEvent::Error(non_empty(message, "Command rejected by device"))
                };
                let _ = events.send(event);
            }
        }
    }
}

fn slot_ids(state: &DispatcherState) -> (Option<Uuid>, Option<Uuid>) {
    (
        state.error.as_ref().map(|e| e.id),
        state.last_response.as_ref().map(|r| r.id),
    )
}

fn non_empty(message: String, fallback: &str) -> String {
    if message.is_empty() {
        fallback.to_string()
    } else {
        message
    }
}
