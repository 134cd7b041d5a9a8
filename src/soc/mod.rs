//! State of charge module
//!
//! [`SocMonitor`] joins the latest snapshot with the battery parameters and
//! publishes a new estimate whenever the inputs change, either after a poll
//! or immediately on a parameter change.

pub mod estimator;
pub mod params;

pub use estimator::{SocEstimate, SocEstimator, SocInputError, SocInputs, SocReading, TimeToTarget};
pub use params::{
    BatteryParameter, BatteryParameterSource, ParameterChange, ParameterStore,
    RawBatteryParameters,
};

use std::sync::Arc;

use crossbeam_channel::{select, Receiver};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::state::SharedState;

pub struct SocMonitor {
    params: Arc<dyn BatteryParameterSource>,
    state: Arc<SharedState>,
    estimator: Mutex<SocEstimator>,
}

impl SocMonitor {
    pub fn new(params: Arc<dyn BatteryParameterSource>, state: Arc<SharedState>) -> Self {
        Self {
            params,
            state,
            estimator: Mutex::new(SocEstimator::new()),
        }
    }

    pub fn inputs(&self) -> SocInputs {
        let device = self.state.device();
        SocInputs {
            counter_a_energy: device.as_ref().and_then(|d| d.snapshot.counter_a_energy),
            power: device.as_ref().and_then(|d| d.snapshot.power),
            charging: device.as_ref().is_some_and(|d| d.status.is_charging()),
            parameters: self.params.current(),
        }
    }

    /// Re-evaluate against current inputs; publishes only a recomputed
    /// estimate.
    ///
    /// Inputs are read and the result published under the estimator lock, so
    /// the last refresh to finish always saw the newest inputs.
    pub fn refresh(&self) -> SocEstimate {
        let mut estimator = self.estimator.lock();
        let inputs = self.inputs();
        let (estimate, recomputed) = estimator.estimate(&inputs);
        if recomputed {
            match &estimate.result {
                Ok(reading) => debug!(
                    "SOC {:.1}% ({:.2} kWh), target: {}",
                    reading.soc_percent, reading.soc_energy_kwh, reading.time_to_target
                ),
                Err(reason) => debug!("SOC unavailable: {}", reason),
            }
            self.state.publish_soc(estimate);
        }
        estimate
    }

    pub fn recomputations(&self) -> u64 {
        self.estimator.lock().recomputations()
    }

    /// React to parameter changes until shutdown.
    pub fn run(&self, changes: Receiver<ParameterChange>, shutdown: Receiver<()>) {
        info!("SOC monitor started");
        self.refresh();
        loop {
            select! {
                recv(shutdown) -> _ => break,
                recv(changes) -> change => match change {
                    Ok(change) => {
                        debug!("Parameter change: {} = {:?}", change.parameter, change.value);
                        // coalesce a burst of changes into one recompute
                        while changes.try_recv().is_ok() {}
                        self.refresh();
                    }
                    Err(_) => break,
                },
            }
        }
        info!("SOC monitor stopped");
    }
}
