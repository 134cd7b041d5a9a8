//! Command dispatch
//!
//! Commands are validated, sent through the shared [`DeviceLink`] token and
//! then tracked as pending expectations until a poll confirms them.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::client::DeviceLink;
use super::types::DeviceSnapshot;
use crate::config::ChargerModel;
use crate::errors::CommandError;
use crate::state::{SharedState, Update};

/// Lowest current the charger may be set to
pub const MIN_CURRENT: u8 = 8;

const CMD_CURRENT_SET: &str = "currentSet";
const CMD_STOP_CHARGING: &str = "evseEnabled";
const CMD_ONE_CHARGE: &str = "oneCharge";
const CMD_RESET_COUNTER_A: &str = "rstEM1";

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CommandRequest {
    SetCurrent(u8),
    SetEnabled(bool),
    SetOneCharge(bool),
    ResetCounterA,
}

impl CommandRequest {
    /// Device command name and value.
    ///
    /// `evseEnabled` is the stop toggle on the device: 1 stops charging.
    pub fn wire(&self) -> (&'static str, String) {
        match self {
            CommandRequest::SetCurrent(amps) => (CMD_CURRENT_SET, amps.to_string()),
            CommandRequest::SetEnabled(enabled) => {
                (CMD_STOP_CHARGING, if *enabled { "0" } else { "1" }.to_string())
            }
            CommandRequest::SetOneCharge(on) => {
                (CMD_ONE_CHARGE, if *on { "1" } else { "0" }.to_string())
            }
            CommandRequest::ResetCounterA => (CMD_RESET_COUNTER_A, "0".to_string()),
        }
    }

    fn expectation(&self) -> Expected {
        match self {
            CommandRequest::SetCurrent(amps) => Expected::CurrentSet(*amps),
            CommandRequest::SetEnabled(enabled) => Expected::StopCharging(!enabled),
            CommandRequest::SetOneCharge(on) => Expected::OneCharge(*on),
            CommandRequest::ResetCounterA => Expected::CounterAReset,
        }
    }
}

/// Device value a command should produce
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Expected {
    CurrentSet(u8),
    StopCharging(bool),
    OneCharge(bool),
    CounterAReset,
}

impl Expected {
    pub fn field(&self) -> &'static str {
        match self {
            Expected::CurrentSet(_) => "current_set",
            Expected::StopCharging(_) => "stop_charging",
            Expected::OneCharge(_) => "one_charge",
            Expected::CounterAReset => "counter_a_energy",
        }
    }

    fn value(&self) -> String {
        match self {
            Expected::CurrentSet(amps) => amps.to_string(),
            Expected::StopCharging(on) | Expected::OneCharge(on) => on.to_string(),
            Expected::CounterAReset => "0".to_string(),
        }
    }

    fn observed(&self, snapshot: &DeviceSnapshot) -> Option<String> {
        match self {
            Expected::CurrentSet(_) => snapshot.current_set.map(|v| v.to_string()),
            Expected::StopCharging(_) => snapshot.stop_charging.map(|v| v.to_string()),
            Expected::OneCharge(_) => snapshot.one_charge.map(|v| v.to_string()),
            Expected::CounterAReset => snapshot.counter_a_energy.map(|v| v.to_string()),
        }
    }

    fn is_confirmed_by(&self, snapshot: &DeviceSnapshot) -> bool {
        match self {
            Expected::CurrentSet(amps) => snapshot
                .current_set
                .is_some_and(|v| (v - f64::from(*amps)).abs() < 0.5),
            Expected::StopCharging(on) => snapshot.stop_charging == Some(*on),
            Expected::OneCharge(on) => snapshot.one_charge == Some(*on),
            Expected::CounterAReset => snapshot.counter_a_energy.is_some_and(|v| v.abs() < 0.01),
        }
    }
}

/// Optimistic view of commanded values awaiting confirmation
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ExpectedState {
    pub current_set: Option<u8>,
    pub stop_charging: Option<bool>,
    pub one_charge: Option<bool>,
    pub counter_a_reset: bool,
}

/// A command whose effect never showed up on the device
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandMismatch {
    pub field: &'static str,
    pub expected: String,
    pub observed: String,
    pub issued_at: DateTime<Utc>,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct Pending {
    expected: Expected,
    remaining_cycles: u32,
    issued_at: DateTime<Utc>,
}

/// Expectations shared between the dispatcher (writer) and the poller
/// (reconciler). At most one per field; the newest command wins.
pub struct PendingCommands {
    entries: Mutex<Vec<Pending>>,
    reconcile_cycles: u32,
}

impl PendingCommands {
    pub fn new(reconcile_cycles: u32) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            reconcile_cycles: reconcile_cycles.max(1),
        }
    }

    pub fn expect(&self, expected: Expected) {
        let mut entries = self.entries.lock();
        entries.retain(|p| p.expected.field() != expected.field());
        entries.push(Pending {
            expected,
            remaining_cycles: self.reconcile_cycles,
            issued_at: Utc::now(),
        });
    }

    pub fn expected(&self) -> ExpectedState {
        self.entries
            .lock()
            .iter()
            .fold(ExpectedState::default(), |mut state, pending| {
                match pending.expected {
                    Expected::CurrentSet(amps) => state.current_set = Some(amps),
                    Expected::StopCharging(on) => state.stop_charging = Some(on),
                    Expected::OneCharge(on) => state.one_charge = Some(on),
                    Expected::CounterAReset => state.counter_a_reset = true,
                }
                state
            })
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check every expectation against a fresh snapshot. Confirmed entries
    /// are dropped, entries out of cycles become mismatches.
    pub fn reconcile(&self, snapshot: &DeviceSnapshot) -> Vec<CommandMismatch> {
        let mut mismatches = Vec::new();
        let mut entries = self.entries.lock();

        entries.retain_mut(|pending| {
            if pending.expected.is_confirmed_by(snapshot) {
                debug!(
                    "Confirmed {}={}",
                    pending.expected.field(),
                    pending.expected.value()
                );
                return false;
            }

            pending.remaining_cycles = pending.remaining_cycles.saturating_sub(1);
            if pending.remaining_cycles > 0 {
                return true;
            }

            let mismatch = CommandMismatch {
                field: pending.expected.field(),
                expected: pending.expected.value(),
                observed: pending
                    .expected
                    .observed(snapshot)
                    .unwrap_or_else(|| "unavailable".to_string()),
                issued_at: pending.issued_at,
                detected_at: snapshot.time_stamp,
            };
            warn!(
                "Command not reflected by charger: {} expected {} but device reports {}",
                mismatch.field, mismatch.expected, mismatch.observed
            );
            mismatches.push(mismatch);
            false
        });

        mismatches
    }
}

pub struct CommandDispatcher {
    link: Arc<DeviceLink>,
    pending: Arc<PendingCommands>,
    state: Arc<SharedState>,
    max_current: u8,
    wake: Option<Sender<()>>,
}

impl CommandDispatcher {
    pub fn new(
        link: Arc<DeviceLink>,
        pending: Arc<PendingCommands>,
        state: Arc<SharedState>,
        model: ChargerModel,
    ) -> Self {
        Self {
            link,
            pending,
            state,
            max_current: model.max_current(),
            wake: None,
        }
    }

    /// Ask the poller for an early confirming poll after each command.
    pub fn with_wake(mut self, wake: Sender<()>) -> Self {
        self.wake = Some(wake);
        self
    }

    pub fn max_current(&self) -> u8 {
        self.max_current
    }

    /// Reject non-numbers and values under the safety floor, clamp the rest
    /// to the model maximum.
    pub fn validate_current(&self, value: f64) -> Result<u8, CommandError> {
        if !value.is_finite() {
            return Err(CommandError::NotANumber {
                command: CMD_CURRENT_SET,
                value: value.to_string(),
            });
        }
        if value < f64::from(MIN_CURRENT) {
            return Err(CommandError::BelowMinimum {
                requested: value,
                minimum: MIN_CURRENT,
            });
        }
        Ok(value.min(f64::from(self.max_current)).round() as u8)
    }

    pub fn set_current(&self, value: f64) -> Result<u8, CommandError> {
        let amps = self.validate_current(value)?;
        if value > f64::from(amps) + 0.5 {
            info!("Requested {}A clamped to {}A", value, amps);
        }
        self.dispatch(CommandRequest::SetCurrent(amps))?;
        Ok(amps)
    }

    /// Current from a raw text payload.
    pub fn set_current_raw(&self, raw: &str) -> Result<u8, CommandError> {
        let value = raw
            .trim()
            .parse::<f64>()
            .map_err(|_| CommandError::NotANumber {
                command: CMD_CURRENT_SET,
                value: raw.to_string(),
            })?;
        self.set_current(value)
    }

    pub fn set_enabled(&self, enabled: bool) -> Result<(), CommandError> {
        self.dispatch(CommandRequest::SetEnabled(enabled))
    }

    /// The "stop charging" toggle: on means charging is stopped.
    pub fn set_stop_charging(&self, stop: bool) -> Result<(), CommandError> {
        self.set_enabled(!stop)
    }

    pub fn set_one_charge(&self, on: bool) -> Result<(), CommandError> {
        self.dispatch(CommandRequest::SetOneCharge(on))
    }

    pub fn reset_counter_a(&self) -> Result<(), CommandError> {
        self.dispatch(CommandRequest::ResetCounterA)
    }

    pub fn dispatch(&self, request: CommandRequest) -> Result<(), CommandError> {
        let (command, value) = request.wire();
        self.link.send_command(command, &value)?;
        info!("Command {}={} accepted by charger", command, value);

        self.pending.expect(request.expectation());
        self.state.notify(Update::Commands);
        if let Some(wake) = &self.wake {
            let _ = wake.try_send(());
        }
        Ok(())
    }
}
