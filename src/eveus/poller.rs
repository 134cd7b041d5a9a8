//! Resilient poller
//!
//! Owns [`ConnectionHealth`] and is the only writer of the device snapshot.
//! Cadence depends on the charger state; failures back off exponentially.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{never, select, Receiver};
use rand::Rng;
use tracing::{debug, error, info, warn};

use super::client::DeviceLink;
use super::commands::PendingCommands;
use super::status::{classify, ChargerState, ChargerStatus};
use super::types::DeviceSnapshot;
use crate::config::{EveusConfig, MIN_QUALITY_WINDOW};
use crate::errors::EveusError;
use crate::soc::SocMonitor;
use crate::state::{PolledDevice, SharedState, Update};

/// Largest fraction of a retry delay jitter may shave off
pub const MAX_JITTER: f64 = 0.9;

/// Exponential retry delay, `min(max, base * 2^failures)`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    /// Up to this fraction is shaved off each delay at random.
    pub jitter: f64,
}

impl BackoffPolicy {
    pub fn delay(&self, consecutive_failures: u32) -> Duration {
        let factor = 2u32.checked_pow(consecutive_failures).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Jittered delay, never above the unjittered one and never zero for a
    /// non-zero delay.
    pub fn with_jitter<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        if self.jitter <= 0.0 {
            return delay;
        }
        let jitter = self.jitter.min(MAX_JITTER);
        delay.mul_f64(1.0 - rng.gen_range(0.0..=jitter))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollerSettings {
    pub charging_interval: Duration,
    pub idle_interval: Duration,
    pub backoff: BackoffPolicy,
    pub stale_after_cycles: u32,
    pub quality_window: usize,
}

impl PollerSettings {
    pub fn from_config(config: &EveusConfig) -> Self {
        Self {
            charging_interval: config.charging_interval,
            idle_interval: config.idle_interval,
            backoff: BackoffPolicy {
                base: config.retry_base_delay,
                max: config.retry_max_delay,
                jitter: config.retry_jitter,
            },
            stale_after_cycles: config.stale_after_cycles,
            quality_window: config.quality_window,
        }
    }

    pub fn interval_for(&self, status: Option<&ChargerStatus>) -> Duration {
        match status {
            Some(status) if status.is_charging() => self.charging_interval,
            _ => self.idle_interval,
        }
    }
}

/// Read-only copy of the connection health for publishing
#[derive(Debug, Clone, PartialEq)]
pub struct HealthReport {
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub total_successes: u64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub backoff: Duration,
    pub quality: f64, // 0..=100
    pub stale: bool,
    pub auth_failed: bool,
}

impl Default for HealthReport {
    fn default() -> Self {
        Self {
            consecutive_failures: 0,
            total_failures: 0,
            total_successes: 0,
            last_success: None,
            last_error: None,
            backoff: Duration::ZERO,
            quality: 100.0,
            stale: false,
            auth_failed: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionHealth {
    consecutive_failures: u32,
    total_failures: u64,
    total_successes: u64,
    last_success: Option<DateTime<Utc>>,
    last_error: Option<String>,
    backoff: Duration,
    window: VecDeque<bool>,
    window_size: usize,
    stale_after: u32,
    auth_failed: bool,
}

impl ConnectionHealth {
    pub fn new(window_size: usize, stale_after: u32) -> Self {
        let window_size = window_size.max(MIN_QUALITY_WINDOW);
        Self {
            consecutive_failures: 0,
            total_failures: 0,
            total_successes: 0,
            last_success: None,
            last_error: None,
            backoff: Duration::ZERO,
            window: VecDeque::with_capacity(window_size),
            window_size,
            stale_after,
            auth_failed: false,
        }
    }

    fn push_outcome(&mut self, success: bool) {
        if self.window.len() == self.window_size {
            self.window.pop_front();
        }
        self.window.push_back(success);
    }

    pub fn record_success(&mut self, at: DateTime<Utc>) {
        self.push_outcome(true);
        self.consecutive_failures = 0;
        self.total_successes += 1;
        self.last_success = Some(at);
        self.backoff = Duration::ZERO;
        self.auth_failed = false;
    }

    /// Count a failure. Returns the retry delay, or `None` for failures that
    /// must not be retried.
    pub fn record_failure(&mut self, error: &EveusError, policy: &BackoffPolicy) -> Option<Duration> {
        self.push_outcome(false);
        self.total_failures += 1;
        self.last_error = Some(error.to_string());

        if error.is_fatal() {
            self.auth_failed = true;
            return None;
        }

        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.backoff = policy.delay(self.consecutive_failures);
        Some(self.backoff)
    }

    /// Success rate over the window, newer outcomes weighted higher.
    ///
    /// With weights 1..=n from oldest to newest, a success after any failure
    /// always raises the score, and a single success can never lift it from
    /// 0 straight to 100.
    pub fn quality_score(&self) -> f64 {
        if self.window.is_empty() {
            return 100.0;
        }
        let (hits, total) = self
            .window
            .iter()
            .enumerate()
            .fold((0.0, 0.0), |(hits, total), (i, ok)| {
                let weight = (i + 1) as f64;
                (hits + if *ok { weight } else { 0.0 }, total + weight)
            });
        hits / total * 100.0
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn backoff(&self) -> Duration {
        self.backoff
    }

    pub fn last_success(&self) -> Option<DateTime<Utc>> {
        self.last_success
    }

    pub fn is_stale(&self) -> bool {
        self.consecutive_failures >= self.stale_after
    }

    pub fn report(&self) -> HealthReport {
        HealthReport {
            consecutive_failures: self.consecutive_failures,
            total_failures: self.total_failures,
            total_successes: self.total_successes,
            last_success: self.last_success,
            last_error: self.last_error.clone(),
            backoff: self.backoff,
            quality: self.quality_score(),
            stale: self.is_stale(),
            auth_failed: self.auth_failed,
        }
    }
}

/// Result of a single poll
#[derive(Debug)]
pub enum PollOutcome {
    Updated { next_poll: Duration },
    Failed { retry_in: Duration },
    Halted(EveusError),
}

pub struct Poller {
    link: Arc<DeviceLink>,
    settings: PollerSettings,
    health: ConnectionHealth,
    state: Arc<SharedState>,
    pending: Arc<PendingCommands>,
    soc: Option<Arc<SocMonitor>>,
    last_state: Option<ChargerState>,
}

impl Poller {
    pub fn new(
        link: Arc<DeviceLink>,
        settings: PollerSettings,
        state: Arc<SharedState>,
        pending: Arc<PendingCommands>,
    ) -> Self {
        Self {
            link,
            health: ConnectionHealth::new(settings.quality_window, settings.stale_after_cycles),
            settings,
            state,
            pending,
            soc: None,
            last_state: None,
        }
    }

    /// Refresh the SOC estimate after every new snapshot.
    pub fn with_soc(mut self, soc: Arc<SocMonitor>) -> Self {
        self.soc = Some(soc);
        self
    }

    pub fn health(&self) -> &ConnectionHealth {
        &self.health
    }

    pub fn poll_once(&mut self) -> PollOutcome {
        let result = self
            .link
            .fetch_state()
            .and_then(|body| DeviceSnapshot::parse(&body, Utc::now()));

        match result {
            Ok(snapshot) => {
                let status = classify(&snapshot);
                if self.last_state != Some(status.state) {
                    info!("Charger state: {}", status);
                    self.last_state = Some(status.state);
                }
                if self.health.consecutive_failures() > 0 {
                    info!(
                        "Charger reachable again after {} failed polls",
                        self.health.consecutive_failures()
                    );
                }
                self.health.record_success(snapshot.time_stamp);

                for mismatch in self.pending.reconcile(&snapshot) {
                    self.state.record_mismatch(mismatch);
                }
                self.state.publish_device(PolledDevice { snapshot, status });
                if let Some(soc) = &self.soc {
                    soc.refresh();
                }
                self.state.publish_health(self.health.report());

                let next_poll = self.settings.interval_for(Some(&status));
                debug!("Next poll in {:?}", next_poll);
                PollOutcome::Updated { next_poll }
            }
            Err(err) => {
                let was_stale = self.health.is_stale();
                let retry = self.health.record_failure(&err, &self.settings.backoff);
                self.state.publish_health(self.health.report());

                match retry {
                    None => {
                        error!("Polling stopped: {}", err);
                        PollOutcome::Halted(err)
                    }
                    Some(backoff) => {
                        warn!(
                            "Poll failed ({} in a row, {}): {}",
                            self.health.consecutive_failures(),
                            err.kind(),
                            err
                        );
                        if !was_stale && self.health.is_stale() {
                            warn!(
                                "No fresh data since {:?}, marking snapshot stale",
                                self.health.last_success()
                            );
                        }
                        let retry_in = self
                            .settings
                            .backoff
                            .with_jitter(backoff, &mut rand::thread_rng());
                        PollOutcome::Failed { retry_in }
                    }
                }
            }
        }
    }

    /// Poll until `shutdown` fires or closes. A message on `wake` triggers an
    /// early poll, except while backing off.
    pub fn run(mut self, shutdown: Receiver<()>, wake: Receiver<()>) -> Result<(), EveusError> {
        info!("Poller started");
        let mut wake = wake;
        loop {
            let (wait, backing_off) = match self.poll_once() {
                PollOutcome::Updated { next_poll } => (next_poll, false),
                PollOutcome::Failed { retry_in } => (retry_in, true),
                PollOutcome::Halted(err) => {
                    self.state.notify(Update::Halted);
                    return Err(err);
                }
            };

            let idle_wake = if backing_off { never() } else { wake.clone() };
            select! {
                recv(shutdown) -> _ => {
                    info!("Poller stopped");
                    return Ok(());
                }
                recv(idle_wake) -> msg => {
                    if msg.is_err() {
                        wake = never();
                    } else {
                        debug!("Early poll requested");
                    }
                }
                default(wait) => {}
            }
        }
    }
}
