//! Eveus to MQTT Bridge
//!
//! Polls an Eveus EV charger over its local HTTP API, estimates the
//! vehicle state of charge and publishes everything to MQTT.

pub mod config;
pub mod errors;
pub mod eveus;
pub mod mqtt;
pub mod soc;
pub mod state;

pub use config::Config;
pub use eveus::client::{DeviceLink, HttpTransport};
pub use eveus::commands::CommandDispatcher;
pub use eveus::poller::Poller;
pub use mqtt::publisher::MqttPublisher;
pub use soc::SocMonitor;
pub use state::SharedState;
