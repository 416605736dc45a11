//! Device command vocabulary and backend wire types.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use strum::IntoStaticStr;

/// Operations a device understands.
///
/// Names are the wire names expected by the command backend.
#[derive(Debug, Clone, PartialEq, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum DeviceCommand {
    LedOn,
    LedOff,
    LedToggle,
    #[strum(serialize = "relay1_on")]
    Relay1On,
    #[strum(serialize = "relay1_off")]
    Relay1Off,
    #[strum(serialize = "relay2_on")]
    Relay2On,
    #[strum(serialize = "relay2_off")]
    Relay2Off,
    RelayBothOn,
    RelayBothOff,
    /// Level is forwarded unchanged; range checks belong to the caller
    #[strum(serialize = "dimmer")]
    DimmerSet(i64),
    ReadSensors,
    GetStatus,
    Restart,
    Custom { command: String, params: Option<Value> },
}

impl DeviceCommand {
    pub fn name(&self) -> &str {
        match self {
            DeviceCommand::Custom { command, .. } => command,
            other => {
                let name: &'static str = other.into();
                name
            }
        }
    }

    /// Build a command from its wire name. Unknown names, and a `dimmer`
    /// without an integer `level`, become [`DeviceCommand::Custom`].
    pub fn from_wire(name: &str, params: Option<Value>) -> Self {
        let level = params
            .as_ref()
            .and_then(|p| p.get("level"))
            .and_then(Value::as_i64);

        match name {
            "led_on" => DeviceCommand::LedOn,
            "led_off" => DeviceCommand::LedOff,
            "led_toggle" => DeviceCommand::LedToggle,
            "relay1_on" => DeviceCommand::Relay1On,
            "relay1_off" => DeviceCommand::Relay1Off,
            "relay2_on" => DeviceCommand::Relay2On,
            "relay2_off" => DeviceCommand::Relay2Off,
            "relay_both_on" => DeviceCommand::RelayBothOn,
            "relay_both_off" => DeviceCommand::RelayBothOff,
            "read_sensors" => DeviceCommand::ReadSensors,
            "get_status" => DeviceCommand::GetStatus,
            "restart" => DeviceCommand::Restart,
            "dimmer" => match level {
                Some(level) => DeviceCommand::DimmerSet(level),
                None => DeviceCommand::custom(name, params),
            },
            _ => DeviceCommand::custom(name, params),
        }
    }

    fn custom(name: &str, params: Option<Value>) -> Self {
        DeviceCommand::Custom {
            command: name.to_string(),
            params,
        }
    }

    pub fn params(&self) -> Option<Value> {
        match self {
            DeviceCommand::DimmerSet(level) => Some(json!({ "level": level })),
            DeviceCommand::Custom { params, .. } => params.clone(),
            _ => None,
        }
    }

    pub fn envelope(&self, device_id: &str) -> CommandEnvelope {
        CommandEnvelope {
            device_id: device_id.to_string(),
            command: self.name().to_string(),
            params: self.params(),
        }
    }
}

/// Request body sent to the command endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandEnvelope {
    pub device_id: String,
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub params: Option<Value>,
}

/// Backend reply. Fields beyond `success` and `message` are preserved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CommandResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            extra: Map::new(),
        }
    }
}

/// One entry of the backend's command catalog.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandInfo {
    pub name: String,
    pub description: Option<String>,
    pub params: Option<Value>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CatalogEntry {
    Name(String),
    Detailed {
        #[serde(alias = "command")]
        name: String,
        #[serde(default)]
        description: Option<String>,
        #[serde(default)]
        params: Option<Value>,
    },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Catalog {
    List(Vec<CatalogEntry>),
    Wrapped { commands: Vec<CatalogEntry> },
}

/// Accepts a bare list or `{"commands": [...]}`, entries as names or objects.
pub fn parse_catalog(body: &[u8]) -> serde_json::Result<Vec<CommandInfo>> {
    let entries = match serde_json::from_slice::<Catalog>(body)? {
        Catalog::List(entries) | Catalog::Wrapped { commands: entries } => entries,
    };

    Ok(entries
        .into_iter()
        .map(|entry| match entry {
            CatalogEntry::Name(name) => CommandInfo {
                name,
                description: None,
                params: None,
            },
            CatalogEntry::Detailed {
                name,
                description,
                params,
            } => CommandInfo {
                name,
                description,
                params,
            },
        })
        .collect())
}
