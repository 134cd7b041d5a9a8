//! Battery parameters
//!
//! Owned by whoever feeds them in (config seed, MQTT parameter topics); the
//! estimator only reads them and listens for changes.

use std::fmt;
use std::ops::RangeInclusive;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::BatteryConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BatteryParameter {
    Capacity,
    InitialSoc,
    Correction,
    TargetSoc,
}

impl BatteryParameter {
    pub const ALL: [BatteryParameter; 4] = [
        BatteryParameter::Capacity,
        BatteryParameter::InitialSoc,
        BatteryParameter::Correction,
        BatteryParameter::TargetSoc,
    ];

    /// Accepted range; anything outside is treated as invalid, never clamped.
    pub fn range(&self) -> RangeInclusive<f64> {
        match self {
            BatteryParameter::Capacity => 10.0..=160.0,
            BatteryParameter::InitialSoc | BatteryParameter::TargetSoc => 0.0..=100.0,
            BatteryParameter::Correction => 0.0..=15.0,
        }
    }

    /// Suffix of the `set/` command topic.
    pub fn topic(&self) -> &'static str {
        match self {
            BatteryParameter::Capacity => "battery_capacity",
            BatteryParameter::InitialSoc => "initial_soc",
            BatteryParameter::Correction => "soc_correction",
            BatteryParameter::TargetSoc => "target_soc",
        }
    }

    pub fn from_topic(topic: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.topic() == topic)
    }

    /// Value if present and within range.
    pub fn validate(&self, value: Option<f64>) -> Option<f64> {
        value.filter(|v| v.is_finite() && self.range().contains(v))
    }
}

impl fmt::Display for BatteryParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BatteryParameter::Capacity => "capacity",
            BatteryParameter::InitialSoc => "initialSoc",
            BatteryParameter::Correction => "correction",
            BatteryParameter::TargetSoc => "targetSoc",
        };
        f.write_str(name)
    }
}

/// Parameter values as supplied, unvalidated
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RawBatteryParameters {
    pub capacity: Option<f64>,
    pub initial_soc: Option<f64>,
    pub correction: Option<f64>,
    pub target_soc: Option<f64>,
}

impl RawBatteryParameters {
    pub fn from_config(config: &BatteryConfig) -> Self {
        Self {
            capacity: config.capacity,
            initial_soc: config.initial_soc,
            correction: config.correction,
            target_soc: config.target_soc,
        }
    }

    pub fn get(&self, parameter: BatteryParameter) -> Option<f64> {
        match parameter {
            BatteryParameter::Capacity => self.capacity,
            BatteryParameter::InitialSoc => self.initial_soc,
            BatteryParameter::Correction => self.correction,
            BatteryParameter::TargetSoc => self.target_soc,
        }
    }

    pub fn set(&mut self, parameter: BatteryParameter, value: Option<f64>) {
        let slot = match parameter {
            BatteryParameter::Capacity => &mut self.capacity,
            BatteryParameter::InitialSoc => &mut self.initial_soc,
            BatteryParameter::Correction => &mut self.correction,
            BatteryParameter::TargetSoc => &mut self.target_soc,
        };
        *slot = value;
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParameterChange {
    pub parameter: BatteryParameter,
    pub value: Option<f64>,
}

/// Read/observe access to the battery parameters.
pub trait BatteryParameterSource: Send + Sync {
    fn current(&self) -> RawBatteryParameters;

    /// Receiver that gets every subsequent change.
    fn subscribe(&self) -> Receiver<ParameterChange>;
}

/// In-memory parameter source with change fan-out
#[derive(Default)]
pub struct ParameterStore {
    values: Mutex<RawBatteryParameters>,
    subscribers: Mutex<Vec<Sender<ParameterChange>>>,
}

impl ParameterStore {
    pub fn new(initial: RawBatteryParameters) -> Self {
        Self {
            values: Mutex::new(initial),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Update one value. Subscribers are only told about actual changes.
    pub fn set(&self, parameter: BatteryParameter, value: Option<f64>) {
        {
            let mut values = self.values.lock();
            if values.get(parameter) == value {
                debug!("{} unchanged", parameter);
                return;
            }
            values.set(parameter, value);
        }

        match value {
            Some(v) => info!("Battery parameter {} set to {}", parameter, v),
            None => info!("Battery parameter {} cleared", parameter),
        }

        let change = ParameterChange { parameter, value };
        self.subscribers
            .lock()
            .retain(|subscriber| subscriber.send(change).is_ok());
    }
}

impl BatteryParameterSource for ParameterStore {
    fn current(&self) -> RawBatteryParameters {
        *self.values.lock()
    }

    fn subscribe(&self) -> Receiver<ParameterChange> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().push(tx);
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ranges() {
        assert_eq!(BatteryParameter::Capacity.validate(Some(60.0)), Some(60.0));
        assert_eq!(BatteryParameter::Capacity.validate(Some(5.0)), None);
        assert_eq!(BatteryParameter::Correction.validate(Some(15.0)), Some(15.0));
        assert_eq!(BatteryParameter::Correction.validate(Some(15.1)), None);
        assert_eq!(BatteryParameter::InitialSoc.validate(Some(f64::NAN)), None);
        assert_eq!(BatteryParameter::TargetSoc.validate(None), None);
    }

    #[test]
    fn test_topics_round_trip() {
        for parameter in BatteryParameter::ALL {
            assert_eq!(BatteryParameter::from_topic(parameter.topic()), Some(parameter));
        }
        assert_eq!(BatteryParameter::from_topic("current"), None);
    }

    #[test]
    fn test_store_notifies_only_on_change() {
        let store = ParameterStore::default();
        let changes = store.subscribe();

        store.set(BatteryParameter::InitialSoc, Some(50.0));
        store.set(BatteryParameter::InitialSoc, Some(50.0));
        store.set(BatteryParameter::InitialSoc, None);

        assert_eq!(
            changes.try_recv().unwrap(),
            ParameterChange {
                parameter: BatteryParameter::InitialSoc,
                value: Some(50.0)
            }
        );
        assert_eq!(changes.try_recv().unwrap().value, None);
        assert!(changes.try_recv().is_err());
        assert_eq!(store.current().initial_soc, None);
    }

    #[test]
    fn test_dropped_subscriber_is_pruned() {
        let store = ParameterStore::default();
        drop(store.subscribe());
        store.set(BatteryParameter::Capacity, Some(60.0));
        assert!(store.subscribers.lock().is_empty());
    }
}
