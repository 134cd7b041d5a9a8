//! MQTT surface
//!
//! Retained per-metric topics out, command and parameter topics in.

pub mod context;
pub mod inbound;
pub mod publisher;
pub mod types;

pub use inbound::{InboundHandler, InboundMessage};
pub use publisher::MqttPublisher;
pub use types::*;
