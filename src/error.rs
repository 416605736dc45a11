use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum ConsoleError {
    #[error("Device id is required")]
    MissingDeviceId,

    #[error("MQTT credentials are required for device {0}")]
    MissingCredentials(String),

    #[error("MQTT transport error: {0}")]
    Transport(String),

    #[error("Failed to subscribe to {topic}: {reason}")]
    Subscribe { topic: String, reason: String },

    #[error("Command backend error: {0}")]
    Backend(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    SerdeJsonError(#[from] serde_json::Error),

    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ConsoleError>;
