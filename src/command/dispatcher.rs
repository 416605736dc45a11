//! Command dispatch with loading / error / last-response tracking.

use super::backend::CommandBackend;
use super::envelope::{CommandInfo, CommandResponse, DeviceCommand};
use super::history::{CommandLog, CommandOutcome, CommandRecord};
use chrono::Utc;
use log::{error, info, warn};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

/// Failure of one command, tagged with its correlation id.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandFailure {
    pub id: Uuid,
    pub message: String,
}

/// Successful reply of one command, tagged with its correlation id.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandReply {
    pub id: Uuid,
    pub response: CommandResponse,
}

/// Observable dispatcher state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatcherState {
    /// True while any command is in flight
    pub loading: bool,
    pub in_flight: usize,
    pub error: Option<CommandFailure>,
    pub last_response: Option<CommandReply>,
}

/// Sends device commands through a [`CommandBackend`].
///
/// Every call goes through one wrapper that raises `loading`, clears the
/// previous error, and records the outcome. Failures never propagate: they
/// become `None` plus an error message.
pub struct CommandDispatcher {
    backend: Arc<dyn CommandBackend>,
    state: watch::Sender<DispatcherState>,
    log: Mutex<CommandLog>,
}

/// Lowers the loading flag when dropped, whatever happened to the call.
struct InFlight<'a> {
    state: &'a watch::Sender<DispatcherState>,
}

impl<'a> InFlight<'a> {
    fn start(state: &'a watch::Sender<DispatcherState>) -> Self {
        state.send_modify(|s| {
            s.in_flight += 1;
            s.loading = true;
            s.error = None;
        });
        Self { state }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.state.send_modify(|s| {
            s.in_flight = s.in_flight.saturating_sub(1);
            s.loading = s.in_flight > 0;
        });
    }
}

impl CommandDispatcher {
    pub fn new(backend: Arc<dyn CommandBackend>) -> Self {
        Self::with_log_capacity(backend, super::history::DEFAULT_LOG_CAPACITY)
    }

    pub fn with_log_capacity(backend: Arc<dyn CommandBackend>, capacity: usize) -> Self {
        let (state, _) = watch::channel(DispatcherState::default());
        Self {
            backend,
            state,
            log: Mutex::new(CommandLog::new(capacity)),
        }
    }

    pub fn state(&self) -> DispatcherState {
        self.state.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<DispatcherState> {
        self.state.subscribe()
    }

    /// Snapshot of recent outcomes, oldest first.
    pub fn history(&self) -> Vec<CommandRecord> {
        self.log.lock().iter().cloned().collect()
    }

    pub fn record(&self, id: Uuid) -> Option<CommandRecord> {
        self.log.lock().get(id).cloned()
    }

    /// Send `command` to `device_id`. `None` means the call failed; see
    /// [`DispatcherState::error`] for why.
    pub async fn execute(&self, device_id: &str, command: DeviceCommand) -> Option<CommandResponse> {
        match self.execute_recorded(device_id, command).await.outcome {
            CommandOutcome::Succeeded { response } => Some(response),
            CommandOutcome::Failed { .. } => None,
        }
    }

    /// Like [`Self::execute`] but returns the full record with its
    /// correlation id.
    pub async fn execute_recorded(&self, device_id: &str, command: DeviceCommand) -> CommandRecord {
        let id = Uuid::new_v4();
        let envelope = command.envelope(device_id);
        let _in_flight = InFlight::start(&self.state);

        info!(
            "[Command] {} -> {} ({})",
            envelope.command, envelope.device_id, id
        );

        let outcome = match self.backend.send(&envelope).await {
            Ok(response) => {
                self.state.send_modify(|s| {
                    s.last_response = Some(CommandReply {
                        id,
                        response: response.clone(),
                    });
                });
                CommandOutcome::Succeeded { response }
            }
            Err(e) => {
                let message = format!("Failed to send {}: {}", envelope.command, e);
                error!("[Command] {}", message);
                self.state.send_modify(|s| {
                    s.error = Some(CommandFailure {
                        id,
                        message: message.clone(),
                    });
                });
                CommandOutcome::Failed { message }
            }
        };

        let record = CommandRecord {
            id,
            device_id: envelope.device_id,
            command: envelope.command,
            finished_at: Utc::now(),
            outcome,
        };
        self.log.lock().push(record.clone());
        record
    }

    pub async fn led_on(&self, device_id: &str) -> Option<CommandResponse> {
        self.execute(device_id, DeviceCommand::LedOn).await
    }

    pub async fn led_off(&self, device_id: &str) -> Option<CommandResponse> {
        self.execute(device_id, DeviceCommand::LedOff).await
    }

    pub async fn led_toggle(&self, device_id: &str) -> Option<CommandResponse> {
        self.execute(device_id, DeviceCommand::LedToggle).await
    }

    pub async fn relay1_on(&self, device_id: &str) -> Option<CommandResponse> {
        self.execute(device_id, DeviceCommand::Relay1On).await
    }

    pub async fn relay1_off(&self, device_id: &str) -> Option<CommandResponse> {
        self.execute(device_id, DeviceCommand::Relay1Off).await
    }

    pub async fn relay2_on(&self, device_id: &str) -> Option<CommandResponse> {
        self.execute(device_id, DeviceCommand::Relay2On).await
    }

    pub async fn relay2_off(&self, device_id: &str) -> Option<CommandResponse> {
        self.execute(device_id, DeviceCommand::Relay2Off).await
    }

    pub async fn relay_both_on(&self, device_id: &str) -> Option<CommandResponse> {
        self.execute(device_id, DeviceCommand::RelayBothOn).await
    }

    pub async fn relay_both_off(&self, device_id: &str) -> Option<CommandResponse> {
        self.execute(device_id, DeviceCommand::RelayBothOff).await
    }

    /// Forwarded as-is: no clamping to 0..=100.
    pub async fn dimmer_set(&self, device_id: &str, level: i64) -> Option<CommandResponse> {
        self.execute(device_id, DeviceCommand::DimmerSet(level)).await
    }

    pub async fn read_sensors(&self, device_id: &str) -> Option<CommandResponse> {
        self.execute(device_id, DeviceCommand::ReadSensors).await
    }

    pub async fn get_status(&self, device_id: &str) -> Option<CommandResponse> {
        self.execute(device_id, DeviceCommand::GetStatus).await
    }

    pub async fn restart(&self, device_id: &str) -> Option<CommandResponse> {
        self.execute(device_id, DeviceCommand::Restart).await
    }

    pub async fn custom(
        &self,
        device_id: &str,
        command: impl Into<String>,
        params: Option<Value>,
    ) -> Option<CommandResponse> {
        let command = DeviceCommand::Custom {
            command: command.into(),
            params,
        };
        self.execute(device_id, command).await
    }

    /// Backend command catalog. Advisory only, so failures yield an empty list.
    pub async fn get_available_commands(&self) -> Vec<CommandInfo> {
        match self.backend.available_commands().await {
            Ok(commands) => commands,
            Err(e) => {
                warn!("[Command] Failed to fetch command catalog: {}", e);
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! Scripted backend recording every envelope it receives.

    use super::super::envelope::CommandEnvelope;
    use super::*;
    use crate::error::{ConsoleError, Result};
    use async_trait::async_trait;
    use std::time::Duration;

    #[derive(Default)]
    pub struct FakeBackend {
        pub sent: Mutex<Vec<CommandEnvelope>>,
        /// Commands that fail with a network-style error
        pub failing: Mutex<Vec<String>>,
        pub delay: Option<Duration>,
        pub catalog: Option<Vec<CommandInfo>>,
    }

    impl FakeBackend {
        pub fn failing(commands: &[&str]) -> Self {
            Self {
                failing: Mutex::new(commands.iter().map(|c| c.to_string()).collect()),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl CommandBackend for FakeBackend {
        async fn send(&self, envelope: &CommandEnvelope) -> Result<CommandResponse> {
            self.sent.lock().push(envelope.clone());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.failing.lock().contains(&envelope.command) {
                return Err(ConsoleError::Backend("connection refused".to_string()));
            }
            Ok(CommandResponse::ok(format!("{} sent", envelope.command)))
        }

        async fn available_commands(&self) -> Result<Vec<CommandInfo>> {
            self.catalog
                .clone()
                .ok_or_else(|| ConsoleError::Backend("catalog unavailable".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeBackend;
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn setup(backend: FakeBackend) -> (Arc<FakeBackend>, CommandDispatcher) {
        let backend = Arc::new(backend);
        (backend.clone(), CommandDispatcher::new(backend))
    }

    #[tokio::test]
    async fn test_success_stores_last_response() {
        let (backend, dispatcher) = setup(FakeBackend::default());

        let response = dispatcher.led_on("d1").await.expect("led_on failed");
        assert_eq!(response.message, "led_on sent");

        let state = dispatcher.state();
        assert!(!state.loading);
        assert!(state.error.is_none());
        assert_eq!(state.last_response.unwrap().response, response);
        assert_eq!(backend.sent.lock()[0].device_id, "d1");
    }

    #[tokio::test]
    async fn test_failure_returns_none_and_clears_loading() {
        let (_, dispatcher) = setup(FakeBackend::failing(&["restart"]));

        assert!(dispatcher.restart("d1").await.is_none());

        let state = dispatcher.state();
        assert!(!state.loading);
        assert_eq!(state.in_flight, 0);
        let message = state.error.expect("error recorded").message;
        assert!(!message.is_empty());
        assert!(message.contains("connection refused"));
    }

    #[tokio::test]
    async fn test_next_call_clears_previous_error() {
        let (_, dispatcher) = setup(FakeBackend::failing(&["restart"]));
        dispatcher.restart("d1").await;
        assert!(dispatcher.state().error.is_some());

        dispatcher.get_status("d1").await;
        assert!(dispatcher.state().error.is_none());
    }

    #[tokio::test]
    async fn test_dimmer_forwards_out_of_range_levels() {
        let (backend, dispatcher) = setup(FakeBackend::default());
        dispatcher.dimmer_set("d1", 150).await;
        dispatcher.dimmer_set("d1", -10).await;

        let sent = backend.sent.lock();
        assert_eq!(sent[0].params, Some(json!({"level": 150})));
        assert_eq!(sent[1].params, Some(json!({"level": -10})));
    }

    #[tokio::test]
    async fn test_named_operations_map_to_wire_commands() {
        let (backend, dispatcher) = setup(FakeBackend::default());
        dispatcher.led_off("d1").await;
        dispatcher.led_toggle("d1").await;
        dispatcher.relay1_on("d1").await;
        dispatcher.relay1_off("d1").await;
        dispatcher.relay2_on("d1").await;
        dispatcher.relay2_off("d1").await;
        dispatcher.relay_both_on("d1").await;
        dispatcher.relay_both_off("d1").await;
        dispatcher.read_sensors("d1").await;
        dispatcher
            .custom("d1", "blink", Some(json!({"times": 3})))
            .await;

        let names: Vec<_> = backend.sent.lock().iter().map(|e| e.command.clone()).collect();
        assert_eq!(
            names,
            vec![
                "led_off",
                "led_toggle",
                "relay1_on",
                "relay1_off",
                "relay2_on",
                "relay2_off",
                "relay_both_on",
                "relay_both_off",
                "read_sensors",
                "blink",
            ]
        );
        assert_eq!(backend.sent.lock()[9].params, Some(json!({"times": 3})));
    }

    #[tokio::test]
    async fn test_loading_while_in_flight() {
        let backend = FakeBackend {
            delay: Some(Duration::from_millis(100)),
            ..Default::default()
        };
        let (_, dispatcher) = setup(backend);
        let dispatcher = Arc::new(dispatcher);

        let mut rx = dispatcher.watch();
        let task = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.led_on("d1").await })
        };

        tokio::time::timeout(Duration::from_secs(1), rx.wait_for(|s| s.loading))
            .await
            .unwrap()
            .unwrap();
        assert!(task.await.unwrap().is_some());
        assert!(!dispatcher.state().loading);
    }

    #[tokio::test]
    async fn test_cancelled_call_still_clears_loading() {
        let backend = FakeBackend {
            delay: Some(Duration::from_secs(10)),
            ..Default::default()
        };
        let (_, dispatcher) = setup(backend);

        let result =
            tokio::time::timeout(Duration::from_millis(20), dispatcher.led_on("d1")).await;
        assert!(result.is_err());
        assert!(!dispatcher.state().loading);
        assert_eq!(dispatcher.state().in_flight, 0);
    }

    #[tokio::test]
    async fn test_concurrent_results_are_correlated() {
        let (_, dispatcher) = setup(FakeBackend::failing(&["led_off"]));

        let (on, off) = tokio::join!(
            dispatcher.execute_recorded("d1", DeviceCommand::LedOn),
            dispatcher.execute_recorded("d1", DeviceCommand::LedOff),
        );
        assert_ne!(on.id, off.id);
        assert!(on.succeeded());
        assert!(!off.succeeded());
        assert_eq!(dispatcher.record(on.id).unwrap().command, "led_on");
        assert_eq!(dispatcher.record(off.id).unwrap().command, "led_off");
        assert_eq!(dispatcher.history().len(), 2);
    }

    #[tokio::test]
    async fn test_catalog_failure_yields_empty_list() {
        let (_, dispatcher) = setup(FakeBackend::default());
        assert!(dispatcher.get_available_commands().await.is_empty());

        let backend = FakeBackend {
            catalog: Some(vec![CommandInfo {
                name: "led_on".to_string(),
                description: None,
                params: None,
            }]),
            ..Default::default()
        };
        let (_, dispatcher) = setup(backend);
        assert_eq!(dispatcher.get_available_commands().await.len(), 1);
    }
}
