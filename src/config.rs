use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Load environment variables from .env file.
/// Values with spaces don't need quotes; surrounding quotes are stripped.
pub fn load_dotenv() {
    let env_path = Path::new(".env");
    if !env_path.exists() {
        return;
    }

    let content = match fs::read_to_string(env_path) {
        Ok(c) => c,
        Err(_) => return,
    };

    for (key, value) in parse_dotenv(&content) {
        // Env vars already set take precedence
        if std::env::var(key).is_err() {
            // SAFETY: called before the async runtime starts any threads
            unsafe { std::env::set_var(key, value) };
        }
    }
}

fn parse_dotenv(content: &str) -> Vec<(&str, &str)> {
    let mut pairs = Vec::new();

    for line in content.lines() {
        let line = line.trim();

        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some(eq_pos) = line.find('=') {
            let key = line[..eq_pos].trim();
            let mut value = line[eq_pos + 1..].trim();

            if value.len() >= 2
                && ((value.starts_with('"') && value.ends_with('"'))
                    || (value.starts_with('\'') && value.ends_with('\'')))
            {
                value = &value[1..value.len() - 1];
            }

            pairs.push((key, value));
        }
    }

    pairs
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub mock: MockConfig,
    pub backend: BackendConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    /// Used when the device credentials carry no broker host
    pub broker_host: String,
    /// WebSocket listener of the broker (EMQX serves /mqtt on 8083)
    pub ws_port: u16,
    pub client_id_prefix: String,
    /// Period between automatic reconnect attempts of the transport
    pub reconnect_period_ms: u64,
    pub keep_alive_secs: u64,
    /// Pause between teardown and connect in `reconnect()`
    pub reconnect_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MockConfig {
    pub enabled: bool,
    pub interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub base_url: String,
    pub send_path: String,
    pub catalog_path: String,
    pub token: Option<String>,
    pub timeout_secs: u64,
}

impl MqttConfig {
    pub fn reconnect_period(&self) -> Duration {
        Duration::from_millis(self.reconnect_period_ms)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

impl MockConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl BackendConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn send_url(&self) -> String {
        join_url(&self.base_url, &self.send_path)
    }

    pub fn catalog_url(&self) -> String {
        join_url(&self.base_url, &self.catalog_path)
    }
}

fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mqtt: MqttConfig {
                broker_host: "localhost".to_string(),
                ws_port: 8083,
                client_id_prefix: "iot_console".to_string(),
                reconnect_period_ms: 5000,
                keep_alive_secs: 60,
                reconnect_delay_ms: 1000,
            },
            mock: MockConfig {
                enabled: false,
                interval_ms: 2000,
            },
            backend: BackendConfig {
                base_url: "http://localhost:8000/api".to_string(),
                send_path: "mqtt/device-commands/send/".to_string(),
                catalog_path: "mqtt/device-commands/available/".to_string(),
                token: None,
                timeout_secs: 15,
            },
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from any key lookup. Unparsable numbers keep the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        // MQTT configuration
        if let Some(host) = lookup("MQTT_BROKER_HOST") {
            config.mqtt.broker_host = host;
        }
        set_parsed(&lookup, "MQTT_WS_PORT", &mut config.mqtt.ws_port);
        if let Some(prefix) = lookup("MQTT_CLIENT_PREFIX") {
            config.mqtt.client_id_prefix = prefix;
        }
        set_parsed(
            &lookup,
            "MQTT_RECONNECT_PERIOD_MS",
            &mut config.mqtt.reconnect_period_ms,
        );
        set_parsed(&lookup, "MQTT_KEEP_ALIVE_SECS", &mut config.mqtt.keep_alive_secs);
        set_parsed(
            &lookup,
            "MQTT_RECONNECT_DELAY_MS",
            &mut config.mqtt.reconnect_delay_ms,
        );

        // Mock telemetry
        if let Some(flag) = lookup("MQTT_MOCK") {
            config.mock.enabled = parse_flag(&flag);
        }
        set_parsed(&lookup, "MQTT_MOCK_INTERVAL_MS", &mut config.mock.interval_ms);

        // Command backend
        if let Some(url) = lookup("BACKEND_URL") {
            config.backend.base_url = url;
        }
        if let Some(path) = lookup("BACKEND_SEND_PATH") {
            config.backend.send_path = path;
        }
        if let Some(path) = lookup("BACKEND_CATALOG_PATH") {
            config.backend.catalog_path = path;
        }
        if let Some(token) = lookup("BACKEND_TOKEN")
            && !token.is_empty()
        {
            config.backend.token = Some(token);
        }
        set_parsed(&lookup, "BACKEND_TIMEOUT_SECS", &mut config.backend.timeout_secs);

        config
    }
}

fn set_parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    if let Some(raw) = lookup(key) {
        match raw.trim().parse() {
            Ok(value) => *slot = value,
            Err(_) => log::warn!("Ignoring invalid value for {}: {:?}", key, raw),
        }
    }
}

fn parse_flag(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
