//! Data types for charger responses
//!
//! The charger answers `/main` with one flat JSON object. Field names are
//! firmware defined; anything missing or unparsable becomes `None`.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::errors::EveusError;

pub const FIELD_VOLTAGE: &str = "voltMeas1";
pub const FIELD_CURRENT: &str = "curMeas1";
pub const FIELD_POWER: &str = "powerMeas";
pub const FIELD_CURRENT_SET: &str = "currentSet";
pub const FIELD_SESSION_ENERGY: &str = "sessionEnergy";
pub const FIELD_TOTAL_ENERGY: &str = "totalEnergy";
pub const FIELD_SESSION_TIME: &str = "sessionTime";
pub const FIELD_COUNTER_A_ENERGY: &str = "IEM1";
pub const FIELD_COUNTER_B_ENERGY: &str = "IEM2";
pub const FIELD_COUNTER_A_COST: &str = "IEM1_money";
pub const FIELD_COUNTER_B_COST: &str = "IEM2_money";
pub const FIELD_BOX_TEMPERATURE: &str = "temperature1";
pub const FIELD_PLUG_TEMPERATURE: &str = "temperature2";
pub const FIELD_BATTERY_VOLTAGE: &str = "vBat";
pub const FIELD_GROUND: &str = "ground";
pub const FIELD_STATE: &str = "state";
pub const FIELD_SUBSTATE: &str = "subState";
pub const FIELD_SYSTEM_TIME: &str = "systemTime";
pub const FIELD_STOP_CHARGING: &str = "evseEnabled";
pub const FIELD_ONE_CHARGE: &str = "oneCharge";
pub const FIELD_PRIMARY_RATE: &str = "tarif";
pub const FIELD_RATE_A: &str = "tarifAValue";
pub const FIELD_RATE_B: &str = "tarifBValue";
pub const FIELD_RATE_A_ENABLED: &str = "tarifAEnable";
pub const FIELD_RATE_B_ENABLED: &str = "tarifBEnable";
pub const FIELD_ACTIVE_RATE: &str = "activeTarif";
pub const FIELD_FIRMWARE: &str = "verFWMain";
pub const FIELD_STATION_ID: &str = "stationId";

/// One successful poll. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSnapshot {
    pub time_stamp: DateTime<Utc>,
    pub voltage: Option<f64>,          // V
    pub current: Option<f64>,          // A
    pub power: Option<f64>,            // W
    pub current_set: Option<f64>,      // A
    pub session_energy: Option<f64>,   // kWh
    pub total_energy: Option<f64>,     // kWh
    pub counter_a_energy: Option<f64>, // kWh
    pub counter_b_energy: Option<f64>, // kWh
    pub counter_a_cost: Option<f64>,
    pub counter_b_cost: Option<f64>,
    pub box_temperature: Option<f64>,  // °C
    pub plug_temperature: Option<f64>, // °C
    pub battery_voltage: Option<f64>,  // V (RTC backup cell)
    pub ground_ok: Option<bool>,
    pub raw_state: Option<i64>,
    pub raw_substate: Option<i64>,
    pub system_time: Option<i64>,  // device local clock, epoch seconds
    pub session_time: Option<i64>, // seconds
    /// Device `evseEnabled`: true means the "stop charging" toggle is on.
    pub stop_charging: Option<bool>,
    pub one_charge: Option<bool>,
    pub rates: RateSchedule,
    pub firmware: Option<String>,
    pub station_id: Option<String>,
}

/// Tariff information reported by the charger
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RateSchedule {
    pub primary_cost: Option<f64>, // currency per kWh
    pub rate2_cost: Option<f64>,
    pub rate3_cost: Option<f64>,
    pub rate2_enabled: Option<bool>,
    pub rate3_enabled: Option<bool>,
    pub active: Option<ActiveRate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveRate {
    Primary,
    Rate2,
    Rate3,
}

impl ActiveRate {
    fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(ActiveRate::Primary),
            1 => Some(ActiveRate::Rate2),
            2 => Some(ActiveRate::Rate3),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActiveRate::Primary => "Primary Rate",
            ActiveRate::Rate2 => "Rate 2",
            ActiveRate::Rate3 => "Rate 3",
        }
    }
}

impl RateSchedule {
    pub fn active_cost(&self) -> Option<f64> {
        match self.active? {
            ActiveRate::Primary => self.primary_cost,
            ActiveRate::Rate2 => self.rate2_cost,
            ActiveRate::Rate3 => self.rate3_cost,
        }
    }
}

/// Read a numeric field. Accepts JSON numbers and numeric strings, rejects
/// placeholders and non-finite values.
pub fn number_field(data: &Map<String, Value>, key: &str) -> Option<f64> {
    let value = match data.get(key)? {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => {
            let s = s.trim();
            if matches!(s, "" | "unknown" | "unavailable" | "null" | "undefined" | "ERROR") {
                return None;
            }
            s.parse::<f64>().ok()?
        }
        Value::Bool(b) => f64::from(u8::from(*b)),
        _ => return None,
    };
    value.is_finite().then_some(value)
}

fn integer_field(data: &Map<String, Value>, key: &str) -> Option<i64> {
    number_field(data, key).map(|v| v.round() as i64)
}

fn flag_field(data: &Map<String, Value>, key: &str) -> Option<bool> {
    integer_field(data, key).map(|v| v == 1)
}

fn text_field(data: &Map<String, Value>, key: &str) -> Option<String> {
    let text = match data.get(key)? {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}

/// Device reports tariffs in hundredths of the currency unit.
fn rate_field(data: &Map<String, Value>, key: &str) -> Option<f64> {
    number_field(data, key).map(|v| v / 100.0)
}

impl DeviceSnapshot {
    pub fn from_json(data: &Map<String, Value>, time_stamp: DateTime<Utc>) -> Self {
        Self {
            time_stamp,
            voltage: number_field(data, FIELD_VOLTAGE),
            current: number_field(data, FIELD_CURRENT),
            power: number_field(data, FIELD_POWER),
            current_set: number_field(data, FIELD_CURRENT_SET),
            session_energy: number_field(data, FIELD_SESSION_ENERGY),
            total_energy: number_field(data, FIELD_TOTAL_ENERGY),
            counter_a_energy: number_field(data, FIELD_COUNTER_A_ENERGY),
            counter_b_energy: number_field(data, FIELD_COUNTER_B_ENERGY),
            counter_a_cost: number_field(data, FIELD_COUNTER_A_COST),
            counter_b_cost: number_field(data, FIELD_COUNTER_B_COST),
            box_temperature: number_field(data, FIELD_BOX_TEMPERATURE),
            plug_temperature: number_field(data, FIELD_PLUG_TEMPERATURE),
            battery_voltage: number_field(data, FIELD_BATTERY_VOLTAGE),
            ground_ok: flag_field(data, FIELD_GROUND),
            raw_state: integer_field(data, FIELD_STATE),
            raw_substate: integer_field(data, FIELD_SUBSTATE),
            system_time: integer_field(data, FIELD_SYSTEM_TIME),
            session_time: integer_field(data, FIELD_SESSION_TIME),
            stop_charging: flag_field(data, FIELD_STOP_CHARGING),
            one_charge: flag_field(data, FIELD_ONE_CHARGE),
            rates: RateSchedule {
                primary_cost: rate_field(data, FIELD_PRIMARY_RATE),
                rate2_cost: rate_field(data, FIELD_RATE_A),
                rate3_cost: rate_field(data, FIELD_RATE_B),
                rate2_enabled: flag_field(data, FIELD_RATE_A_ENABLED),
                rate3_enabled: flag_field(data, FIELD_RATE_B_ENABLED),
                active: integer_field(data, FIELD_ACTIVE_RATE).and_then(ActiveRate::from_code),
            },
            firmware: text_field(data, FIELD_FIRMWARE),
            station_id: text_field(data, FIELD_STATION_ID),
        }
    }

    /// Parse a raw `/main` response body.
    pub fn parse(body: &str, time_stamp: DateTime<Utc>) -> Result<Self, EveusError> {
        let value: Value =
            serde_json::from_str(body).map_err(|e| EveusError::ParseError(e.to_string()))?;
        match value {
            Value::Object(map) => Ok(Self::from_json(&map, time_stamp)),
            other => Err(EveusError::ParseError(format!(
                "expected a JSON object, got {}",
                json_type(&other)
            ))),
        }
    }

    /// Charging is allowed unless the stop toggle is on.
    pub fn charging_enabled(&self) -> Option<bool> {
        self.stop_charging.map(|stop| !stop)
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(value: Value) -> DeviceSnapshot {
        DeviceSnapshot::parse(&value.to_string(), Utc::now()).unwrap()
    }

    #[test]
    fn test_parses_numbers_and_numeric_strings() {
        let snapshot = parse(json!({
            "voltMeas1": 229.5,
            "curMeas1": "15.9",
            "powerMeas": 3650,
            "IEM1": "12.34",
            "state": 4,
            "subState": "1",
            "ground": 1,
            "evseEnabled": 0,
            "oneCharge": 1,
            "verFWMain": " 3.0.2 ",
            "someFutureField": [1, 2, 3]
        }));

        assert_eq!(snapshot.voltage, Some(229.5));
        assert_eq!(snapshot.current, Some(15.9));
        assert_eq!(snapshot.power, Some(3650.0));
        assert_eq!(snapshot.counter_a_energy, Some(12.34));
        assert_eq!(snapshot.raw_state, Some(4));
        assert_eq!(snapshot.raw_substate, Some(1));
        assert_eq!(snapshot.ground_ok, Some(true));
        assert_eq!(snapshot.stop_charging, Some(false));
        assert_eq!(snapshot.charging_enabled(), Some(true));
        assert_eq!(snapshot.one_charge, Some(true));
        assert_eq!(snapshot.firmware.as_deref(), Some("3.0.2"));
    }

    #[test]
    fn test_placeholders_become_missing_not_zero() {
        let snapshot = parse(json!({
            "IEM1": "unavailable",
            "powerMeas": "",
            "voltMeas1": null,
            "curMeas1": "abc",
            "temperature1": "unknown"
        }));

        assert_eq!(snapshot.counter_a_energy, None);
        assert_eq!(snapshot.power, None);
        assert_eq!(snapshot.voltage, None);
        assert_eq!(snapshot.current, None);
        assert_eq!(snapshot.box_temperature, None);
        assert_eq!(snapshot.total_energy, None);
        assert_eq!(snapshot.raw_state, None);
    }

    #[test]
    fn test_rate_schedule() {
        let snapshot = parse(json!({
            "tarif": 432,
            "tarifAValue": 216,
            "tarifBValue": "150",
            "tarifAEnable": 1,
            "tarifBEnable": 0,
            "activeTarif": 1
        }));

        let rates = &snapshot.rates;
        assert_eq!(rates.primary_cost, Some(4.32));
        assert_eq!(rates.rate3_cost, Some(1.5));
        assert_eq!(rates.rate2_enabled, Some(true));
        assert_eq!(rates.rate3_enabled, Some(false));
        assert_eq!(rates.active, Some(ActiveRate::Rate2));
        assert_eq!(rates.active_cost(), Some(2.16));
    }

    #[test]
    fn test_non_object_body_is_rejected() {
        assert!(matches!(
            DeviceSnapshot::parse("[1,2]", Utc::now()),
            Err(EveusError::ParseError(_))
        ));
        assert!(matches!(
            DeviceSnapshot::parse("<html>", Utc::now()),
            Err(EveusError::ParseError(_))
        ));
    }
}
