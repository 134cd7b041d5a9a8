use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::ChargerModel;
use crate::eveus::commands::ExpectedState;
use crate::eveus::poller::HealthReport;
use crate::eveus::types::RateSchedule;
use crate::soc::{SocEstimate, TimeToTarget};
use crate::state::PolledDevice;

pub fn round(value: f64, decimals: i32) -> f64 {
    let multiplier = 10_f64.powi(decimals);
    (value * multiplier).round() / multiplier
}

fn round_opt(value: Option<f64>, decimals: i32) -> Option<f64> {
    value.map(|v| round(v, decimals))
}

/// "1d 2h 5m" style, minutes always shown when nothing larger is.
pub fn format_duration(seconds: u64) -> String {
    let days = seconds / 86_400;
    let hours = (seconds % 86_400) / 3_600;
    let minutes = (seconds % 3_600) / 60;

    let mut parts = Vec::new();
    if days > 0 {
        parts.push(format!("{}d", days));
    }
    if hours > 0 {
        parts.push(format!("{}h", hours));
    }
    if minutes > 0 || parts.is_empty() {
        parts.push(format!("{}m", minutes));
    }
    parts.join(" ")
}

/// Device clock as HH:MM
fn format_system_time(epoch: i64) -> Option<String> {
    DateTime::from_timestamp(epoch, 0).map(|t| t.format("%H:%M").to_string())
}

/// Values published under `status/`
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceStatus {
    pub time: DateTime<Utc>,
    pub voltage: Option<f64>,
    pub current: Option<f64>,
    pub power: Option<f64>,
    pub current_set: Option<f64>,
    pub session_energy: Option<f64>,
    pub session_time: Option<String>,
    pub total_energy: Option<f64>,
    pub counter_a_energy: Option<f64>,
    pub counter_b_energy: Option<f64>,
    pub counter_a_cost: Option<f64>,
    pub counter_b_cost: Option<f64>,
    pub box_temperature: Option<f64>,
    pub plug_temperature: Option<f64>,
    pub battery_voltage: Option<f64>,
    pub ground: Option<bool>,
    pub system_time: Option<String>,
    pub stop_charging: Option<bool>,
    pub one_charge: Option<bool>,
    pub state: &'static str,
    pub substate: &'static str,
    pub error: &'static str,
    pub stale: bool,
}

impl DeviceStatus {
    /// Device values with not yet confirmed command results laid over them.
    pub fn from_device(device: &PolledDevice, expected: &ExpectedState, stale: bool) -> Self {
        let snapshot = &device.snapshot;
        let counter_a_energy = if expected.counter_a_reset {
            Some(0.0)
        } else {
            round_opt(snapshot.counter_a_energy, 2)
        };

        Self {
            time: snapshot.time_stamp,
            voltage: round_opt(snapshot.voltage, 1),
            current: round_opt(snapshot.current, 1),
            power: round_opt(snapshot.power, 1),
            current_set: expected
                .current_set
                .map(f64::from)
                .or(snapshot.current_set),
            session_energy: round_opt(snapshot.session_energy, 2),
            session_time: snapshot
                .session_time
                .map(|s| format_duration(s.max(0) as u64)),
            total_energy: round_opt(snapshot.total_energy, 2),
            counter_a_energy,
            counter_b_energy: round_opt(snapshot.counter_b_energy, 2),
            counter_a_cost: round_opt(snapshot.counter_a_cost, 2),
            counter_b_cost: round_opt(snapshot.counter_b_cost, 2),
            box_temperature: round_opt(snapshot.box_temperature, 1),
            plug_temperature: round_opt(snapshot.plug_temperature, 1),
            battery_voltage: round_opt(snapshot.battery_voltage, 2),
            ground: snapshot.ground_ok,
            system_time: snapshot.system_time.and_then(format_system_time),
            stop_charging: expected.stop_charging.or(snapshot.stop_charging),
            one_charge: expected.one_charge.or(snapshot.one_charge),
            state: device.status.state.as_str(),
            substate: device.status.substate.as_str(),
            error: device.status.error.as_str(),
            stale,
        }
    }
}

/// Values published under `rate/`
#[derive(Debug, Clone, PartialEq)]
pub struct RateStatus {
    pub primary_cost: Option<f64>,
    pub rate2_cost: Option<f64>,
    pub rate3_cost: Option<f64>,
    pub rate2_enabled: Option<bool>,
    pub rate3_enabled: Option<bool>,
    pub active: Option<&'static str>,
    pub active_cost: Option<f64>,
}

impl RateStatus {
    pub fn from_schedule(rates: &RateSchedule) -> Self {
        Self {
            primary_cost: round_opt(rates.primary_cost, 2),
            rate2_cost: round_opt(rates.rate2_cost, 2),
            rate3_cost: round_opt(rates.rate3_cost, 2),
            rate2_enabled: rates.rate2_enabled,
            rate3_enabled: rates.rate3_enabled,
            active: rates.active.map(|a| a.as_str()),
            active_cost: round_opt(rates.active_cost(), 2),
        }
    }
}

/// Values published under `soc/`
#[derive(Debug, Clone, PartialEq)]
pub struct SocStatus {
    pub available: bool,
    pub reason: String,
    pub energy_kwh: Option<f64>,
    pub percent: Option<f64>,
    pub time_to_target: Option<String>,
    pub time_to_target_minutes: Option<f64>,
}

impl SocStatus {
    pub fn from_estimate(estimate: Option<&SocEstimate>) -> Self {
        match estimate.map(|e| e.result) {
            Some(Ok(reading)) => Self {
                available: true,
                reason: String::new(),
                energy_kwh: Some(reading.display_energy_kwh()),
                percent: Some(reading.display_percent()),
                time_to_target: Some(reading.time_to_target.to_string()),
                time_to_target_minutes: match reading.time_to_target {
                    TimeToTarget::Minutes(m) => Some(m.round()),
                    _ => None,
                },
            },
            Some(Err(reason)) => Self::unavailable(reason.to_string()),
            None => Self::unavailable("no data".to_string()),
        }
    }

    fn unavailable(reason: String) -> Self {
        Self {
            available: false,
            reason,
            energy_kwh: None,
            percent: None,
            time_to_target: None,
            time_to_target_minutes: None,
        }
    }
}

/// Values published under `connection/`
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionStatus {
    pub quality: f64,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub total_successes: u64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub backoff: u64, // s
    pub stale: bool,
    pub auth_failed: bool,
    pub pending_commands: u64,
}

impl ConnectionStatus {
    pub fn from_report(report: &HealthReport, pending_commands: usize) -> Self {
        Self {
            quality: round(report.quality, 1),
            consecutive_failures: report.consecutive_failures,
            total_failures: report.total_failures,
            total_successes: report.total_successes,
            last_success: report.last_success,
            last_error: report.last_error.clone(),
            backoff: report.backoff.as_secs(),
            stale: report.stale,
            auth_failed: report.auth_failed,
            pending_commands: pending_commands as u64,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct DeviceInfo<'a> {
    pub time: DateTime<Utc>,
    pub device_id: &'a str,
    pub host: &'a str,
    pub model: &'static str,
    pub max_current: u8,
    pub firmware: Option<&'a str>,
    pub station_id: Option<&'a str>,
}

impl<'a> DeviceInfo<'a> {
    pub fn new(
        device_id: &'a str,
        host: &'a str,
        model: ChargerModel,
        device: &'a PolledDevice,
    ) -> Self {
        Self {
            time: device.snapshot.time_stamp,
            device_id,
            host,
            model: model.as_str(),
            max_current: model.max_current(),
            firmware: device.snapshot.firmware.as_deref(),
            station_id: device.snapshot.station_id.as_deref(),
        }
    }
}
