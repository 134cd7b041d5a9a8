//! State of charge estimation
//!
//! Pure computation plus a one-entry cache keyed by an input fingerprint.

use std::fmt;

use serde::Serialize;
use xxhash_rust::xxh3::Xxh3;

use super::params::{BatteryParameter, RawBatteryParameters};

/// Below this charging power no time-to-target is computed.
pub const MIN_CHARGING_POWER_W: f64 = 100.0;

/// Everything an estimate depends on
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SocInputs {
    pub counter_a_energy: Option<f64>,
    pub power: Option<f64>,
    pub charging: bool,
    pub parameters: RawBatteryParameters,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Fingerprint(pub u64);

impl SocInputs {
    pub fn fingerprint(&self) -> Fingerprint {
        fn feed(hasher: &mut Xxh3, value: Option<f64>) {
            match value {
                Some(v) => {
                    hasher.update(&[1]);
                    hasher.update(&v.to_bits().to_le_bytes());
                }
                None => hasher.update(&[0]),
            }
        }

        let mut hasher = Xxh3::new();
        feed(&mut hasher, self.counter_a_energy);
        feed(&mut hasher, self.power);
        hasher.update(&[self.charging as u8]);
        for parameter in BatteryParameter::ALL {
            feed(&mut hasher, self.parameters.get(parameter));
        }
        Fingerprint(hasher.digest())
    }
}

/// Why no estimate could be produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SocInputError {
    #[error("{0} invalid")]
    InvalidParameter(BatteryParameter),

    #[error("counterAEnergy invalid")]
    InvalidCounter,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TimeToTarget {
    Minutes(f64),
    TargetReached,
    NotCharging,
    InsufficientPower,
    NoTarget,
}

impl TimeToTarget {
    pub fn minutes(&self) -> Option<f64> {
        match self {
            TimeToTarget::Minutes(m) => Some(*m),
            _ => None,
        }
    }
}

impl fmt::Display for TimeToTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeToTarget::Minutes(minutes) => {
                // whole seconds, truncated
                let seconds = (minutes * 60.0) as u64;
                let days = seconds / 86_400;
                let hours = seconds % 86_400 / 3600;
                let mins = seconds % 3600 / 60;
                if seconds < 60 {
                    f.write_str("< 1m")
                } else if days > 0 {
                    write!(f, "{}d {:02}h {:02}m", days, hours, mins)
                } else if hours > 0 {
                    write!(f, "{}h {:02}m", hours, mins)
                } else {
                    write!(f, "{}m", mins)
                }
            }
            TimeToTarget::TargetReached => f.write_str("Target reached"),
            TimeToTarget::NotCharging => f.write_str("Not charging"),
            TimeToTarget::InsufficientPower => f.write_str("Insufficient power"),
            TimeToTarget::NoTarget => f.write_str("No target"),
        }
    }
}

/// Unrounded estimate
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SocReading {
    pub soc_energy_kwh: f64,
    pub soc_percent: f64,
    pub time_to_target: TimeToTarget,
}

impl SocReading {
    pub fn display_percent(&self) -> f64 {
        self.soc_percent.round()
    }

    pub fn display_energy_kwh(&self) -> f64 {
        (self.soc_energy_kwh * 10.0).round() / 10.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SocEstimate {
    pub fingerprint: Fingerprint,
    pub result: Result<SocReading, SocInputError>,
}

impl SocEstimate {
    pub fn reading(&self) -> Option<&SocReading> {
        self.result.as_ref().ok()
    }

    pub fn is_available(&self) -> bool {
        self.result.is_ok()
    }
}

fn required(
    parameters: &RawBatteryParameters,
    parameter: BatteryParameter,
) -> Result<f64, SocInputError> {
    parameter
        .validate(parameters.get(parameter))
        .ok_or(SocInputError::InvalidParameter(parameter))
}

pub fn compute(inputs: &SocInputs) -> Result<SocReading, SocInputError> {
    let params = &inputs.parameters;
    let capacity = required(params, BatteryParameter::Capacity)?;
    let initial_soc = required(params, BatteryParameter::InitialSoc)?;
    let correction = required(params, BatteryParameter::Correction)?;
    let counter = inputs
        .counter_a_energy
        .filter(|v| v.is_finite() && *v >= 0.0)
        .ok_or(SocInputError::InvalidCounter)?;

    let initial_kwh = capacity * initial_soc / 100.0;
    let efficiency = 1.0 - correction / 100.0;
    let total_kwh = initial_kwh + counter * efficiency;

    let soc_percent = (total_kwh / capacity * 100.0).clamp(0.0, 100.0);
    let soc_energy_kwh = total_kwh.clamp(0.0, capacity);

    let time_to_target = match BatteryParameter::TargetSoc.validate(params.target_soc) {
        None => TimeToTarget::NoTarget,
        Some(target) if soc_percent >= target => TimeToTarget::TargetReached,
        Some(_) if !inputs.charging => TimeToTarget::NotCharging,
        Some(target) => match inputs.power {
            Some(power) if power > MIN_CHARGING_POWER_W => {
                let remaining_kwh = (target - soc_percent) / 100.0 * capacity;
                let power_kw = power * efficiency / 1000.0;
                TimeToTarget::Minutes(remaining_kwh / power_kw * 60.0)
            }
            _ => TimeToTarget::InsufficientPower,
        },
    };

    Ok(SocReading {
        soc_energy_kwh,
        soc_percent,
        time_to_target,
    })
}

/// Recomputes only when the input fingerprint changes.
#[derive(Debug, Default)]
pub struct SocEstimator {
    cached: Option<SocEstimate>,
    recomputations: u64,
}

impl SocEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the estimate and whether it was freshly computed.
    pub fn estimate(&mut self, inputs: &SocInputs) -> (SocEstimate, bool) {
        let fingerprint = inputs.fingerprint();
        if let Some(cached) = self.cached {
            if cached.fingerprint == fingerprint {
                return (cached, false);
            }
        }

        let estimate = SocEstimate {
            fingerprint,
            result: compute(inputs),
        };
        self.recomputations += 1;
        self.cached = Some(estimate);
        (estimate, true)
    }

    pub fn cached(&self) -> Option<SocEstimate> {
        self.cached
    }

    pub fn recomputations(&self) -> u64 {
        self.recomputations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn scenario_a() -> SocInputs {
        SocInputs {
            counter_a_energy: Some(10.0),
            power: Some(7000.0),
            charging: true,
            parameters: RawBatteryParameters {
                capacity: Some(60.0),
                initial_soc: Some(50.0),
                correction: Some(7.5),
                target_soc: Some(80.0),
            },
        }
    }

    #[test]
    fn test_scenario_a() {
        let reading = compute(&scenario_a()).unwrap();
        assert!((reading.soc_energy_kwh - 39.25).abs() < 1e-9);
        assert_eq!(reading.display_percent(), 65.0);
        assert_eq!(reading.display_energy_kwh(), 39.3);

        // 80 - 65.4166% of 60 kWh at 6.475 kW
        let minutes = reading.time_to_target.minutes().unwrap();
        assert!((minutes - 8.75 / 6.475 * 60.0).abs() < 1e-6);
    }

    #[test]
    fn test_missing_counter_is_unavailable() {
        let mut inputs = scenario_a();
        inputs.counter_a_energy = None;
        let err = compute(&inputs).unwrap_err();
        assert_eq!(err, SocInputError::InvalidCounter);
        assert_eq!(err.to_string(), "counterAEnergy invalid");
    }

    #[test]
    fn test_out_of_range_parameter_is_reported() {
        let mut inputs = scenario_a();
        inputs.parameters.correction = Some(20.0);
        assert_eq!(
            compute(&inputs).unwrap_err().to_string(),
            "correction invalid"
        );

        inputs.parameters.correction = Some(7.5);
        inputs.parameters.capacity = None;
        assert_eq!(
            compute(&inputs),
            Err(SocInputError::InvalidParameter(BatteryParameter::Capacity))
        );
    }

    #[test]
    fn test_time_to_target_cases() {
        let mut inputs = scenario_a();
        inputs.parameters.target_soc = None;
        assert_eq!(compute(&inputs).unwrap().time_to_target, TimeToTarget::NoTarget);

        inputs.parameters.target_soc = Some(60.0);
        assert_eq!(
            compute(&inputs).unwrap().time_to_target,
            TimeToTarget::TargetReached
        );

        inputs.parameters.target_soc = Some(90.0);
        inputs.charging = false;
        assert_eq!(
            compute(&inputs).unwrap().time_to_target,
            TimeToTarget::NotCharging
        );

        inputs.charging = true;
        inputs.power = Some(50.0);
        assert_eq!(
            compute(&inputs).unwrap().time_to_target,
            TimeToTarget::InsufficientPower
        );
    }

    #[test]
    fn test_time_to_target_display() {
        assert_eq!(TimeToTarget::Minutes(0.3).to_string(), "< 1m");
        assert_eq!(TimeToTarget::Minutes(42.0).to_string(), "42m");
        assert_eq!(TimeToTarget::Minutes(65.0).to_string(), "1h 05m");
        assert_eq!(TimeToTarget::Minutes(0.99).to_string(), "< 1m");
        assert_eq!(TimeToTarget::Minutes(1.5).to_string(), "1m");
        assert_eq!(TimeToTarget::Minutes(59.5).to_string(), "59m");
        assert_eq!(TimeToTarget::Minutes(25.0 * 60.0 + 5.0).to_string(), "1d 01h 05m");
        assert_eq!(TimeToTarget::TargetReached.to_string(), "Target reached");
    }

    #[test]
    fn test_cache_reuses_identical_inputs() {
        let mut estimator = SocEstimator::new();
        let inputs = scenario_a();

        let (first, fresh) = estimator.estimate(&inputs);
        assert!(fresh);
        let (second, fresh) = estimator.estimate(&inputs);
        assert!(!fresh);
        assert_eq!(first, second);
        assert_eq!(estimator.recomputations(), 1);

        let mut changed = inputs;
        changed.parameters.initial_soc = Some(40.0);
        let (third, fresh) = estimator.estimate(&changed);
        assert!(fresh);
        assert_ne!(third.fingerprint, first.fingerprint);
        assert_eq!(estimator.recomputations(), 2);
    }

    #[test]
    fn test_missing_and_zero_fingerprint_differently() {
        let mut zero = scenario_a();
        zero.counter_a_energy = Some(0.0);
        let mut missing = scenario_a();
        missing.counter_a_energy = None;
        assert_ne!(zero.fingerprint(), missing.fingerprint());
    }

    proptest! {
        #[test]
        fn prop_soc_is_clamped(
            capacity in 10.0f64..=160.0,
            initial in 0.0f64..=100.0,
            correction in 0.0f64..=15.0,
            counter in 0.0f64..1000.0,
        ) {
            let inputs = SocInputs {
                counter_a_energy: Some(counter),
                power: None,
                charging: false,
                parameters: RawBatteryParameters {
                    capacity: Some(capacity),
                    initial_soc: Some(initial),
                    correction: Some(correction),
                    target_soc: None,
                },
            };
            let reading = compute(&inputs).unwrap();
            prop_assert!((0.0..=100.0).contains(&reading.soc_percent));
            prop_assert!(reading.soc_energy_kwh <= capacity);
        }
    }
}
