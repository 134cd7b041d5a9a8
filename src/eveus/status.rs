//! Charger state classification
//!
//! Pure mapping from the device's numeric state/substate codes to closed
//! enumerations. Codes the firmware adds later land in `Unknown`, never in
//! `Error`.

use std::fmt;

use super::types::DeviceSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChargerState {
    Startup,
    SystemTest,
    Standby,
    Connected,
    Charging,
    ChargeComplete,
    Paused,
    Error,
    Unknown,
}

impl ChargerState {
    pub fn from_code(code: Option<i64>) -> Self {
        match code {
            Some(0) => ChargerState::Startup,
            Some(1) => ChargerState::SystemTest,
            Some(2) => ChargerState::Standby,
            Some(3) => ChargerState::Connected,
            Some(4) => ChargerState::Charging,
            Some(5) => ChargerState::ChargeComplete,
            Some(6) => ChargerState::Paused,
            Some(7) => ChargerState::Error,
            _ => ChargerState::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChargerState::Startup => "Startup",
            ChargerState::SystemTest => "System Test",
            ChargerState::Standby => "Standby",
            ChargerState::Connected => "Connected",
            ChargerState::Charging => "Charging",
            ChargerState::ChargeComplete => "Charge Complete",
            ChargerState::Paused => "Paused",
            ChargerState::Error => "Error",
            ChargerState::Unknown => "Unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    None,
    Grounding,
    CurrentLeakHigh,
    CurrentLeakLow,
    Relay,
    TempBox,
    TempPlug,
    Pilot,
    VoltageError,
    Overcurrent,
    SystemError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::None => "None",
            ErrorKind::Grounding => "Grounding",
            ErrorKind::CurrentLeakHigh => "Current Leak High",
            ErrorKind::CurrentLeakLow => "Current Leak Low",
            ErrorKind::Relay => "Relay",
            ErrorKind::TempBox => "Box Temperature",
            ErrorKind::TempPlug => "Plug Temperature",
            ErrorKind::Pilot => "Pilot",
            ErrorKind::VoltageError => "Voltage",
            ErrorKind::Overcurrent => "Overcurrent",
            ErrorKind::SystemError => "System",
        }
    }
}

/// Detail code. Its meaning depends on whether the charger is in Error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Substate {
    NoLimits,
    LimitedByUser,
    EnergyLimit,
    TimeLimit,
    CostLimit,
    Schedule1Limit,
    Schedule1EnergyLimit,
    Schedule2Limit,
    Schedule2EnergyLimit,
    WaitingForActivation,
    PausedByAdaptiveMode,
    Fault(DeviceFault),
    Unknown,
}

/// Device error codes 0..=14.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceFault {
    NoError,
    Grounding,
    CurrentLeakHigh,
    Relay,
    CurrentLeakLow,
    BoxOverheat,
    PlugOverheat,
    Pilot,
    LowVoltage,
    Diode,
    Overcurrent,
    InterfaceTimeout,
    SoftwareFailure,
    GfciTestFailure,
    HighVoltage,
}

impl DeviceFault {
    fn from_code(code: i64) -> Option<Self> {
        let fault = match code {
            0 => DeviceFault::NoError,
            1 => DeviceFault::Grounding,
            2 => DeviceFault::CurrentLeakHigh,
            3 => DeviceFault::Relay,
            4 => DeviceFault::CurrentLeakLow,
            5 => DeviceFault::BoxOverheat,
            6 => DeviceFault::PlugOverheat,
            7 => DeviceFault::Pilot,
            8 => DeviceFault::LowVoltage,
            9 => DeviceFault::Diode,
            10 => DeviceFault::Overcurrent,
            11 => DeviceFault::InterfaceTimeout,
            12 => DeviceFault::SoftwareFailure,
            13 => DeviceFault::GfciTestFailure,
            14 => DeviceFault::HighVoltage,
            _ => return None,
        };
        Some(fault)
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            DeviceFault::NoError => ErrorKind::None,
            DeviceFault::Grounding => ErrorKind::Grounding,
            DeviceFault::CurrentLeakHigh => ErrorKind::CurrentLeakHigh,
            DeviceFault::Relay => ErrorKind::Relay,
            DeviceFault::CurrentLeakLow => ErrorKind::CurrentLeakLow,
            DeviceFault::BoxOverheat => ErrorKind::TempBox,
            DeviceFault::PlugOverheat => ErrorKind::TempPlug,
            DeviceFault::Pilot | DeviceFault::Diode => ErrorKind::Pilot,
            DeviceFault::LowVoltage | DeviceFault::HighVoltage => ErrorKind::VoltageError,
            DeviceFault::Overcurrent => ErrorKind::Overcurrent,
            DeviceFault::InterfaceTimeout
            | DeviceFault::SoftwareFailure
            | DeviceFault::GfciTestFailure => ErrorKind::SystemError,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceFault::NoError => "No Error",
            DeviceFault::Grounding => "Grounding Error",
            DeviceFault::CurrentLeakHigh => "Current Leak High",
            DeviceFault::Relay => "Relay Error",
            DeviceFault::CurrentLeakLow => "Current Leak Low",
            DeviceFault::BoxOverheat => "Box Overheat",
            DeviceFault::PlugOverheat => "Plug Overheat",
            DeviceFault::Pilot => "Pilot Error",
            DeviceFault::LowVoltage => "Low Voltage",
            DeviceFault::Diode => "Diode Error",
            DeviceFault::Overcurrent => "Overcurrent",
            DeviceFault::InterfaceTimeout => "Interface Timeout",
            DeviceFault::SoftwareFailure => "Software Failure",
            DeviceFault::GfciTestFailure => "GFCI Test Failure",
            DeviceFault::HighVoltage => "High Voltage",
        }
    }
}

impl Substate {
    fn normal(code: i64) -> Self {
        match code {
            0 => Substate::NoLimits,
            1 => Substate::LimitedByUser,
            2 => Substate::EnergyLimit,
            3 => Substate::TimeLimit,
            4 => Substate::CostLimit,
            5 => Substate::Schedule1Limit,
            6 => Substate::Schedule1EnergyLimit,
            7 => Substate::Schedule2Limit,
            8 => Substate::Schedule2EnergyLimit,
            9 => Substate::WaitingForActivation,
            10 => Substate::PausedByAdaptiveMode,
            _ => Substate::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Substate::NoLimits => "No Limits",
            Substate::LimitedByUser => "Limited by User",
            Substate::EnergyLimit => "Energy Limit",
            Substate::TimeLimit => "Time Limit",
            Substate::CostLimit => "Cost Limit",
            Substate::Schedule1Limit => "Schedule 1 Limit",
            Substate::Schedule1EnergyLimit => "Schedule 1 Energy Limit",
            Substate::Schedule2Limit => "Schedule 2 Limit",
            Substate::Schedule2EnergyLimit => "Schedule 2 Energy Limit",
            Substate::WaitingForActivation => "Waiting for Activation",
            Substate::PausedByAdaptiveMode => "Paused by Adaptive Mode",
            Substate::Fault(fault) => fault.as_str(),
            Substate::Unknown => "Unknown",
        }
    }
}

/// Classified charger status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChargerStatus {
    pub state: ChargerState,
    pub substate: Substate,
    pub error: ErrorKind,
}

impl ChargerStatus {
    pub fn is_charging(&self) -> bool {
        self.state == ChargerState::Charging
    }
}

impl fmt::Display for ChargerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.state.as_str(), self.substate.as_str())
    }
}

/// Classify raw codes. An unrecognised error code while in Error still
/// reports a system error so that the error state is never silent.
pub fn classify_codes(state: Option<i64>, substate: Option<i64>) -> ChargerStatus {
    let state = ChargerState::from_code(state);

    let (substate, error) = match (state, substate) {
        (ChargerState::Error, Some(code)) => match DeviceFault::from_code(code) {
            Some(fault) => (Substate::Fault(fault), fault.kind()),
            None => (Substate::Unknown, ErrorKind::SystemError),
        },
        (ChargerState::Error, None) => (Substate::Unknown, ErrorKind::SystemError),
        (_, Some(code)) => (Substate::normal(code), ErrorKind::None),
        (_, None) => (Substate::Unknown, ErrorKind::None),
    };

    ChargerStatus {
        state,
        substate,
        error,
    }
}

pub fn classify(snapshot: &DeviceSnapshot) -> ChargerStatus {
    classify_codes(snapshot.raw_state, snapshot.raw_substate)
}
