//! Configuration module for Eveus-MQTT bridge
//!
//! Loads configuration from a TOML file:
//! - [default] - General settings (log_level)
//! - [eveus] - Charger connection and polling settings
//! - [battery] - Optional initial battery parameters
//! - [mqtt] - MQTT broker settings

use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Log level for the application
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Convert to tracing LevelFilter string
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str().to_uppercase())
    }
}

/// Charger hardware variant, selects the maximum settable current.
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
pub enum ChargerModel {
    #[serde(rename = "16A")]
    Model16A,
    #[default]
    #[serde(rename = "32A")]
    Model32A,
}

impl ChargerModel {
    pub fn max_current(&self) -> u8 {
        match self {
            ChargerModel::Model16A => 16,
            ChargerModel::Model32A => 32,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChargerModel::Model16A => "16A",
            ChargerModel::Model32A => "32A",
        }
    }
}

/// Main configuration structure
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub default: DefaultConfig,
    pub eveus: EveusConfig,
    #[serde(default)]
    pub battery: BatteryConfig,
    pub mqtt: MqttConfig,
}

/// General application settings
#[derive(Debug, Deserialize, Clone, Default)]
pub struct DefaultConfig {
    /// Log level: TRACE, DEBUG, INFO, WARN, ERROR
    #[serde(default)]
    pub log_level: LogLevel,
}

/// Charger connection configuration
#[derive(Deserialize, Clone)]
pub struct EveusConfig {
    /// Charger IP address or hostname (required)
    pub host: String,

    /// Web interface username (required)
    pub username: String,

    /// Web interface password (required)
    pub password: String,

    /// Charger model, "16A" or "32A"
    #[serde(default)]
    pub model: ChargerModel,

    /// Poll interval while charging
    #[serde(default = "default_charging_interval", with = "humantime_serde")]
    pub charging_interval: Duration,

    /// Poll interval in every other state
    #[serde(default = "default_idle_interval", with = "humantime_serde")]
    pub idle_interval: Duration,

    /// Upper bound for a single HTTP exchange
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,

    /// First retry delay unit after a failed poll
    #[serde(default = "default_retry_base_delay", with = "humantime_serde")]
    pub retry_base_delay: Duration,

    /// Retry delay ceiling
    #[serde(default = "default_retry_max_delay", with = "humantime_serde")]
    pub retry_max_delay: Duration,

    /// Fraction of the retry delay added as random jitter
    #[serde(default = "default_retry_jitter")]
    pub retry_jitter: f64,

    /// Missed polls before the last snapshot is reported stale
    #[serde(default = "default_stale_after_cycles")]
    pub stale_after_cycles: u32,

    /// Polls to wait for a command to show up on the device
    #[serde(default = "default_reconcile_cycles")]
    pub reconcile_cycles: u32,

    /// Number of poll outcomes in the connection quality window
    #[serde(default = "default_quality_window")]
    pub quality_window: usize,

    /// Minimum gap between two commands
    #[serde(default = "default_command_spacing", with = "humantime_serde")]
    pub command_spacing: Duration,
}

fn default_charging_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_idle_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_retry_base_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_retry_max_delay() -> Duration {
    Duration::from_secs(300)
}

fn default_retry_jitter() -> f64 {
    0.2
}

fn default_stale_after_cycles() -> u32 {
    3
}

fn default_reconcile_cycles() -> u32 {
    3
}

/// Smallest quality window that still recovers gradually
pub const MIN_QUALITY_WINDOW: usize = 2;

fn default_quality_window() -> usize {
    20
}

fn default_command_spacing() -> Duration {
    Duration::from_secs(1)
}

impl std::fmt::Debug for EveusConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("EveusConfig")
            .field("host", &self.host)
            .field("username", &self.username)
            .field("password", &"***REDACTED***")
            .field("model", &self.model)
            .field("charging_interval", &self.charging_interval)
            .field("idle_interval", &self.idle_interval)
            .field("request_timeout", &self.request_timeout)
            .field("retry_base_delay", &self.retry_base_delay)
            .field("retry_max_delay", &self.retry_max_delay)
            .field("retry_jitter", &self.retry_jitter)
            .field("stale_after_cycles", &self.stale_after_cycles)
            .field("reconcile_cycles", &self.reconcile_cycles)
            .field("quality_window", &self.quality_window)
            .field("command_spacing", &self.command_spacing)
            .finish()
    }
}

/// Initial battery parameters. Any value may also be set later over MQTT.
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct BatteryConfig {
    /// Usable battery capacity in kWh
    pub capacity: Option<f64>,
    /// State of charge when the session started, %
    pub initial_soc: Option<f64>,
    /// Charging loss, %
    pub correction: Option<f64>,
    /// Desired state of charge, %
    pub target_soc: Option<f64>,
}

/// MQTT broker configuration
#[derive(Deserialize, Clone)]
pub struct MqttConfig {
    /// MQTT root topic (e.g., "eveus")
    #[serde(default = "default_mqtt_root")]
    pub root: String,

    /// MQTT broker hostname
    pub host: Option<String>,

    /// MQTT broker port (default 1883)
    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    /// Unix socket path, takes precedence over host
    pub socket: Option<String>,

    /// MQTT username
    #[serde(default)]
    pub username: String,

    /// MQTT password
    #[serde(default)]
    pub password: String,

    /// Topic segment identifying this charger, defaults to one derived from the host
    pub device_id: Option<String>,
}

fn default_mqtt_root() -> String {
    "eveus".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

impl std::fmt::Debug for MqttConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("MqttConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("socket", &self.socket)
            .field("username", &self.username)
            .field("password", &"***REDACTED***")
            .field("root", &self.root)
            .field("device_id", &self.device_id)
            .finish()
    }
}

impl Config {
    /// Load configuration from TOML file
    ///
    /// # Arguments
    /// * `path` - Path to the config.toml file
    ///
    /// # Errors
    /// Returns error if file cannot be read, parsed or validated
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound(
                path.to_string_lossy().to_string(),
            ));
        }

        let contents =
            fs::read_to_string(path).map_err(|e| ConfigError::ReadError(e.to_string()))?;

        Self::from_toml(&contents)
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let mut config: Config =
            toml::from_str(contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.eveus.host = normalize_host(&config.eveus.host)?;
        config.validate()?;

        Ok(config)
    }

    /// Topic segment for this charger
    pub fn device_id(&self) -> String {
        match &self.mqtt.device_id {
            Some(id) if !id.is_empty() => id.clone(),
            _ => format!("eveus-{}", self.eveus.host.replace(['.', ':'], "-")),
        }
    }

    /// Validate configuration logic (semantic validation beyond type checks)
    fn validate(&self) -> Result<(), ConfigError> {
        if self.eveus.username.trim().is_empty() || self.eveus.password.is_empty() {
            return Err(ConfigError::ValidationError(
                "eveus.username and eveus.password must not be empty".to_string(),
            ));
        }

        if self.eveus.charging_interval.is_zero() || self.eveus.idle_interval.is_zero() {
            return Err(ConfigError::ValidationError(
                "poll intervals must be greater than zero".to_string(),
            ));
        }

        if self.eveus.retry_base_delay.is_zero()
            || self.eveus.retry_max_delay < self.eveus.retry_base_delay
        {
            return Err(ConfigError::ValidationError(
                "eveus.retry_max_delay must be >= eveus.retry_base_delay > 0".to_string(),
            ));
        }

        if !(0.0..1.0).contains(&self.eveus.retry_jitter) {
            return Err(ConfigError::ValidationError(
                "eveus.retry_jitter must be within 0.0..1.0".to_string(),
            ));
        }

        if self.eveus.quality_window < MIN_QUALITY_WINDOW {
            return Err(ConfigError::ValidationError(format!(
                "eveus.quality_window must be at least {}",
                MIN_QUALITY_WINDOW
            )));
        }

        if self.eveus.reconcile_cycles == 0 || self.eveus.stale_after_cycles == 0 {
            return Err(ConfigError::ValidationError(
                "reconcile_cycles and stale_after_cycles must be positive".to_string(),
            ));
        }

        let host_missing = self.mqtt.host.as_deref().map_or(true, str::is_empty);
        if host_missing && self.mqtt.socket.is_none() {
            return Err(ConfigError::ValidationError(
                "mqtt.host or mqtt.socket must be configured".to_string(),
            ));
        }

        Ok(())
    }
}

/// Strip scheme and trailing slashes, then check that what is left is a
/// bare IP address or hostname (optionally with a port).
pub fn normalize_host(raw: &str) -> Result<String, ConfigError> {
    let trimmed = raw.trim();
    let without_scheme = trimmed
        .strip_prefix("http://")
        .or_else(|| trimmed.strip_prefix("https://"))
        .unwrap_or(trimmed);
    let host = without_scheme.trim_end_matches('/');

    if host.is_empty() {
        return Err(ConfigError::InvalidHost(raw.to_string()));
    }

    let (name, port) = match host.rsplit_once(':') {
        Some((name, port)) => (name, Some(port)),
        None => (host, None),
    };

    if let Some(port) = port {
        if port.parse::<u16>().is_err() {
            return Err(ConfigError::InvalidHost(raw.to_string()));
        }
    }

    let label_ok = |label: &str| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    };

    if name.len() > 253 || !name.split('.').all(label_ok) {
        return Err(ConfigError::InvalidHost(raw.to_string()));
    }

    Ok(host.to_string())
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to read configuration file: {0}")]
    ReadError(String),

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Malformed charger address: '{0}'")]
    InvalidHost(String),

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
