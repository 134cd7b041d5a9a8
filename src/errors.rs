//! Error types for Eveus-MQTT bridge
//!
//! Uses thiserror for ergonomic error definitions.
//! These errors can be converted to anyhow::Error in the main application.

/// Charger connection and communication errors
#[derive(Debug, thiserror::Error)]
pub enum EveusError {
    #[error("Charger at {host} rejected the configured credentials")]
    AuthFailed { host: String },

    #[error("Request to charger at {host} timed out")]
    Timeout { host: String },

    #[error("Failed to connect to charger at {host}: {reason}")]
    ConnectionFailed { host: String, reason: String },

    #[error("Charger returned HTTP {status} for {endpoint}")]
    HttpStatus { endpoint: String, status: u16 },

    #[error("Failed to parse charger response: {0}")]
    ParseError(String),

    #[error("Charger rejected command '{command}': {reason}")]
    CommandRejected { command: String, reason: String },

    #[error("Failed to build HTTP client: {0}")]
    ClientSetup(String),
}

impl EveusError {
    /// Authentication failures need operator action and are never retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EveusError::AuthFailed { .. })
    }

    /// Short classification used in connection diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            EveusError::AuthFailed { .. } => "auth",
            EveusError::Timeout { .. } => "timeout",
            EveusError::ConnectionFailed { .. } => "connection",
            EveusError::HttpStatus { .. } => "http",
            EveusError::ParseError(_) => "malformed",
            EveusError::CommandRejected { .. } => "rejected",
            EveusError::ClientSetup(_) => "setup",
        }
    }
}

/// Command validation and dispatch errors
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("Invalid value for {command}: '{value}' is not a number")]
    NotANumber { command: &'static str, value: String },

    #[error("Requested current {requested}A is below the {minimum}A safety floor")]
    BelowMinimum { requested: f64, minimum: u8 },

    #[error(transparent)]
    Device(#[from] EveusError),
}

/// MQTT connection and publishing errors
#[derive(Debug, thiserror::Error)]
pub enum MqttError {
    #[error("Failed to publish message to topic '{topic}': {reason}")]
    PublishFailed { topic: String, reason: String },

    #[error("Failed to subscribe to topic '{topic}': {reason}")]
    SubscribeFailed { topic: String, reason: String },

    #[error("Failed to serialize data: {error:?}")]
    SerializationError { error: serde_json::Error },

    #[error("Unsupported payload on '{topic}': {payload}")]
    InvalidPayload { topic: String, payload: String },

    #[error("MQTT client error: {0}")]
    ClientError(String),
}
