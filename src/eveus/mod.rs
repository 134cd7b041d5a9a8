//! Eveus charger module
//!
//! HTTP transport, polling, state classification and command dispatch.

pub mod client;
pub mod commands;
pub mod poller;
pub mod status;
pub mod types;

pub use client::{DeviceLink, DeviceTransport, HttpTransport};
pub use commands::{CommandDispatcher, CommandRequest, PendingCommands};
pub use poller::{ConnectionHealth, Poller, PollerSettings};
pub use status::{classify, ChargerState, ChargerStatus, ErrorKind, Substate};
pub use types::*;
