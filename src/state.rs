//! Published charger state
//!
//! Single writer per section (poller for device and health, SOC monitor for
//! the estimate), any number of readers. Readers get cheap copies; every
//! write emits an [`Update`] so the MQTT side knows what to republish.

use std::collections::VecDeque;
use std::sync::Arc;

use crossbeam_channel::Sender;
use parking_lot::{Mutex, RwLock};

use crate::eveus::commands::CommandMismatch;
use crate::eveus::poller::HealthReport;
use crate::eveus::status::ChargerStatus;
use crate::eveus::types::DeviceSnapshot;
use crate::soc::SocEstimate;

const MISMATCH_HISTORY: usize = 10;

/// Change notification for consumers of [`SharedState`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Update {
    Device,
    Health,
    Soc,
    Commands,
    /// The poller gave up (authentication rejected).
    Halted,
}

/// Latest good snapshot together with its classification
#[derive(Debug, Clone, PartialEq)]
pub struct PolledDevice {
    pub snapshot: DeviceSnapshot,
    pub status: ChargerStatus,
}

pub struct SharedState {
    device: RwLock<Option<Arc<PolledDevice>>>,
    health: RwLock<HealthReport>,
    soc: RwLock<Option<SocEstimate>>,
    mismatches: Mutex<VecDeque<CommandMismatch>>,
    notify: Sender<Update>,
}

impl SharedState {
    pub fn new(notify: Sender<Update>) -> Self {
        Self {
            device: RwLock::new(None),
            health: RwLock::new(HealthReport::default()),
            soc: RwLock::new(None),
            mismatches: Mutex::new(VecDeque::with_capacity(MISMATCH_HISTORY)),
            notify,
        }
    }

    pub fn device(&self) -> Option<Arc<PolledDevice>> {
        self.device.read().clone()
    }

    pub fn health(&self) -> HealthReport {
        self.health.read().clone()
    }

    pub fn soc(&self) -> Option<SocEstimate> {
        *self.soc.read()
    }

    pub fn mismatches(&self) -> Vec<CommandMismatch> {
        self.mismatches.lock().iter().cloned().collect()
    }

    /// Swap in a new snapshot. Readers holding the previous `Arc` keep it.
    pub fn publish_device(&self, device: PolledDevice) {
        *self.device.write() = Some(Arc::new(device));
        self.notify(Update::Device);
    }

    pub fn publish_health(&self, report: HealthReport) {
        *self.health.write() = report;
        self.notify(Update::Health);
    }

    pub fn publish_soc(&self, estimate: SocEstimate) {
        *self.soc.write() = Some(estimate);
        self.notify(Update::Soc);
    }

    pub fn record_mismatch(&self, mismatch: CommandMismatch) {
        {
            let mut mismatches = self.mismatches.lock();
            if mismatches.len() == MISMATCH_HISTORY {
                mismatches.pop_front();
            }
            mismatches.push_back(mismatch);
        }
        self.notify(Update::Commands);
    }

    /// Notifications are best effort; nobody listening is not an error.
    pub fn notify(&self, update: Update) {
        let _ = self.notify.try_send(update);
    }
}
