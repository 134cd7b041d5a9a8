//! Poller, dispatcher and SOC monitor driven through a scripted charger.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use serde_json::json;

use eveus_mqtt_rs::config::{ChargerModel, Config};
use eveus_mqtt_rs::errors::{CommandError, EveusError};
use eveus_mqtt_rs::eveus::poller::PollOutcome;
use eveus_mqtt_rs::eveus::{
    ChargerState, CommandDispatcher, DeviceLink, DeviceTransport, PendingCommands, Poller,
    PollerSettings,
};
use eveus_mqtt_rs::soc::{
    BatteryParameter, BatteryParameterSource, ParameterChange, ParameterStore,
    RawBatteryParameters, SocInputError, SocMonitor,
};
use eveus_mqtt_rs::state::{SharedState, Update};

#[derive(Default)]
struct Script {
    responses: VecDeque<Result<String, EveusError>>,
    commands: Vec<(String, String)>,
    fetches: usize,
}

/// Replays queued responses; once empty, repeats an idle standby body.
#[derive(Clone, Default)]
struct ScriptedTransport {
    script: Arc<Mutex<Script>>,
    delay: Duration,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl ScriptedTransport {
    fn push(&self, body: serde_json::Value) {
        self.script.lock().responses.push_back(Ok(body.to_string()));
    }

    fn push_raw(&self, body: &str) {
        self.script.lock().responses.push_back(Ok(body.to_string()));
    }

    fn push_error(&self, error: EveusError) {
        self.script.lock().responses.push_back(Err(error));
    }

    fn commands(&self) -> Vec<(String, String)> {
        self.script.lock().commands.clone()
    }

    fn fetches(&self) -> usize {
        self.script.lock().fetches
    }

    fn enter(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        thread::sleep(self.delay);
    }

    fn leave(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl DeviceTransport for ScriptedTransport {
    fn fetch_state(&mut self) -> Result<String, EveusError> {
        self.enter();
        let response = {
            let mut script = self.script.lock();
            script.fetches += 1;
            script
                .responses
                .pop_front()
                .unwrap_or_else(|| Ok(json!({"state": 2, "subState": 0}).to_string()))
        };
        self.leave();
        response
    }

    fn send_command(&mut self, command: &str, value: &str) -> Result<(), EveusError> {
        self.enter();
        self.script
            .lock()
            .commands
            .push((command.to_string(), value.to_string()));
        self.leave();
        Ok(())
    }

    fn host(&self) -> &str {
        "scripted"
    }
}

fn timeout() -> EveusError {
    EveusError::Timeout {
        host: "scripted".to_string(),
    }
}

fn settings() -> PollerSettings {
    let config = Config::from_toml(
        r#"
        [eveus]
        host = "192.168.1.50"
        username = "admin"
        password = "secret"
        retry_jitter = 0.0

        [mqtt]
        host = "broker"
        "#,
    )
    .unwrap();
    PollerSettings::from_config(&config.eveus)
}

fn scenario_a_params() -> RawBatteryParameters {
    RawBatteryParameters {
        capacity: Some(60.0),
        initial_soc: Some(50.0),
        correction: Some(7.5),
        target_soc: Some(80.0),
    }
}

struct Harness {
    transport: ScriptedTransport,
    state: Arc<SharedState>,
    updates: Receiver<Update>,
    pending: Arc<PendingCommands>,
    link: Arc<DeviceLink>,
}

impl Harness {
    fn new() -> Self {
        Self::with_transport(ScriptedTransport::default())
    }

    fn with_transport(transport: ScriptedTransport) -> Self {
        let (tx, updates) = unbounded();
        Self {
            link: Arc::new(DeviceLink::new(transport.clone(), Duration::ZERO)),
            transport,
            state: Arc::new(SharedState::new(tx)),
            updates,
            pending: Arc::new(PendingCommands::new(3)),
        }
    }

    fn poller(&self) -> Poller {
        Poller::new(
            self.link.clone(),
            settings(),
            self.state.clone(),
            self.pending.clone(),
        )
    }

    fn dispatcher(&self, model: ChargerModel) -> CommandDispatcher {
        CommandDispatcher::new(
            self.link.clone(),
            self.pending.clone(),
            self.state.clone(),
            model,
        )
    }
}

#[test]
fn test_interval_shortens_when_charging_starts() {
    let harness = Harness::new();
    harness.transport.push(json!({"state": 3, "subState": 0}));
    harness.transport.push(json!({"state": 4, "subState": 1, "powerMeas": 7200}));
    let mut poller = harness.poller();

    assert!(matches!(
        poller.poll_once(),
        PollOutcome::Updated { next_poll } if next_poll == Duration::from_secs(60)
    ));
    assert!(matches!(
        poller.poll_once(),
        PollOutcome::Updated { next_poll } if next_poll == Duration::from_secs(30)
    ));

    let device = harness.state.device().unwrap();
    assert_eq!(device.status.state, ChargerState::Charging);
    assert_eq!(device.snapshot.power, Some(7200.0));
}

#[test]
fn test_current_is_clamped_or_rejected() {
    let harness = Harness::new();
    let dispatcher = harness.dispatcher(ChargerModel::Model32A);

    assert_eq!(dispatcher.set_current(40.0).unwrap(), 32);
    assert!(matches!(
        dispatcher.set_current(2.0),
        Err(CommandError::BelowMinimum { minimum: 8, .. })
    ));
    assert!(matches!(
        dispatcher.set_current_raw("sixteen"),
        Err(CommandError::NotANumber { .. })
    ));
    assert!(matches!(
        dispatcher.set_current(f64::NAN),
        Err(CommandError::NotANumber { .. })
    ));

    // only the accepted command reached the charger
    assert_eq!(
        harness.transport.commands(),
        vec![("currentSet".to_string(), "32".to_string())]
    );
    assert_eq!(harness.pending.expected().current_set, Some(32));

    let small = harness.dispatcher(ChargerModel::Model16A);
    assert_eq!(small.set_current_raw("20").unwrap(), 16);
    assert_eq!(small.set_current(8.0).unwrap(), 8);
}

#[test]
fn test_enable_writes_inverted_stop_flag() {
    let harness = Harness::new();
    let dispatcher = harness.dispatcher(ChargerModel::Model32A);

    dispatcher.set_enabled(true).unwrap();
    dispatcher.set_enabled(false).unwrap();
    dispatcher.set_stop_charging(true).unwrap();

    assert_eq!(
        harness.transport.commands(),
        vec![
            ("evseEnabled".to_string(), "0".to_string()),
            ("evseEnabled".to_string(), "1".to_string()),
            ("evseEnabled".to_string(), "1".to_string()),
        ]
    );
    assert_eq!(harness.pending.expected().stop_charging, Some(true));
}

#[test]
fn test_failures_back_off_then_reset() {
    let harness = Harness::new();
    for _ in 0..5 {
        harness.transport.push_error(timeout());
    }
    harness.transport.push(json!({"state": 2}));
    let mut poller = harness.poller();

    let mut failures = Vec::new();
    let mut backoffs = Vec::new();
    for _ in 0..6 {
        poller.poll_once();
        failures.push(poller.health().consecutive_failures());
        backoffs.push(poller.health().backoff());
    }

    assert_eq!(failures, vec![1, 2, 3, 4, 5, 0]);
    assert!(backoffs[..5].windows(2).all(|w| w[1] >= w[0]));
    assert_eq!(backoffs[5], Duration::ZERO);

    let health = harness.state.health();
    assert!(!health.stale);
    assert_eq!(health.total_failures, 5);
    assert!(health.quality < 100.0);
}

#[test]
fn test_stale_flag_keeps_last_snapshot() {
    let harness = Harness::new();
    harness.transport.push(json!({"state": 4, "powerMeas": 3000}));
    for _ in 0..3 {
        harness.transport.push_error(timeout());
    }
    let mut poller = harness.poller();
    for _ in 0..4 {
        poller.poll_once();
    }

    assert!(harness.state.health().stale);
    let device = harness.state.device().unwrap();
    assert_eq!(device.snapshot.power, Some(3000.0));
}

#[test]
fn test_malformed_body_is_retried() {
    let harness = Harness::new();
    harness.transport.push_raw("<html>Rebooting</html>");
    let mut poller = harness.poller();

    assert!(matches!(poller.poll_once(), PollOutcome::Failed { .. }));
    assert!(matches!(poller.poll_once(), PollOutcome::Updated { .. }));
}

#[test]
fn test_auth_failure_halts_polling() {
    let harness = Harness::new();
    harness.transport.push_error(EveusError::AuthFailed {
        host: "scripted".to_string(),
    });
    let poller = harness.poller();

    let (_shutdown_tx, shutdown_rx) = bounded::<()>(0);
    let (_wake_tx, wake_rx) = bounded(1);
    let result = poller.run(shutdown_rx, wake_rx);

    assert!(matches!(result, Err(EveusError::AuthFailed { .. })));
    assert!(harness.state.health().auth_failed);
    assert!(harness.updates.try_iter().any(|u| u == Update::Halted));
    assert_eq!(harness.transport.fetches(), 1);
}

#[test]
fn test_unavailable_counter_degrades_soc_only() {
    let harness = Harness::new();
    harness
        .transport
        .push(json!({"state": 4, "IEM1": "unavailable", "powerMeas": 7000}));
    let params = Arc::new(ParameterStore::new(scenario_a_params()));
    let soc = Arc::new(SocMonitor::new(params, harness.state.clone()));
    let mut poller = harness.poller().with_soc(soc);

    assert!(matches!(poller.poll_once(), PollOutcome::Updated { .. }));

    let estimate = harness.state.soc().unwrap();
    assert_eq!(estimate.result, Err(SocInputError::InvalidCounter));
    assert_eq!(
        estimate.result.unwrap_err().to_string(),
        "counterAEnergy invalid"
    );
    assert!(harness.state.device().is_some());
}

#[test]
fn test_soc_follows_poll_and_caches() {
    let harness = Harness::new();
    let charging = json!({"state": 4, "IEM1": 10, "powerMeas": 7000});
    harness.transport.push(charging.clone());
    harness.transport.push(charging);
    let params = Arc::new(ParameterStore::new(scenario_a_params()));
    let soc = Arc::new(SocMonitor::new(params, harness.state.clone()));
    let mut poller = harness.poller().with_soc(soc.clone());

    poller.poll_once();
    let reading = *harness.state.soc().unwrap().reading().unwrap();
    assert_eq!(reading.display_percent(), 65.0);
    assert_eq!(reading.display_energy_kwh(), 39.3);

    // identical inputs, no recomputation
    poller.poll_once();
    assert_eq!(soc.recomputations(), 1);
}

#[test]
fn test_parameter_change_recomputes_without_poll() {
    let harness = Harness::new();
    harness
        .transport
        .push(json!({"state": 4, "IEM1": 10, "powerMeas": 7000}));
    let params = Arc::new(ParameterStore::new(scenario_a_params()));
    let soc = Arc::new(SocMonitor::new(params.clone(), harness.state.clone()));
    let mut poller = harness.poller().with_soc(soc.clone());
    poller.poll_once();
    let before = harness.state.soc().unwrap();

    let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
    let changes = params.subscribe();
    let monitor = {
        let soc = soc.clone();
        thread::spawn(move || soc.run(changes, shutdown_rx))
    };

    params.set(BatteryParameter::InitialSoc, Some(40.0));

    let deadline = Duration::from_secs(2);
    let mut updated = None;
    while let Ok(update) = harness.updates.recv_timeout(deadline) {
        if update == Update::Soc {
            let estimate = harness.state.soc().unwrap();
            if estimate.fingerprint != before.fingerprint {
                updated = Some(estimate);
                break;
            }
        }
    }
    drop(shutdown_tx);
    monitor.join().unwrap();

    let reading = *updated.expect("no recompute after parameter change").reading().unwrap();
    // 24 kWh initial + 9.25 kWh charged of 60 kWh
    assert_eq!(reading.display_percent(), 55.0);
    assert_eq!(harness.transport.fetches(), 1);
}

/// Parameter source that, once armed, hands out its current values and then
/// stalls until released.
struct StallingParameters {
    store: Arc<ParameterStore>,
    armed: AtomicBool,
    reading: Sender<()>,
    release: Receiver<()>,
}

impl BatteryParameterSource for StallingParameters {
    fn current(&self) -> RawBatteryParameters {
        let values = self.store.current();
        if self.armed.swap(false, Ordering::SeqCst) {
            self.reading.send(()).unwrap();
            self.release.recv().unwrap();
        }
        values
    }

    fn subscribe(&self) -> Receiver<ParameterChange> {
        self.store.subscribe()
    }
}

#[test]
fn test_parameter_change_wins_over_concurrent_poll_refresh() {
    let harness = Harness::new();
    harness
        .transport
        .push(json!({"state": 4, "IEM1": 10, "powerMeas": 7000}));
    assert!(matches!(
        harness.poller().poll_once(),
        PollOutcome::Updated { .. }
    ));

    let store = Arc::new(ParameterStore::new(scenario_a_params()));
    let (reading_tx, reading_rx) = bounded(1);
    let (release_tx, release_rx) = bounded(1);
    let source = Arc::new(StallingParameters {
        store: store.clone(),
        armed: AtomicBool::new(true),
        reading: reading_tx,
        release: release_rx,
    });
    let soc = Arc::new(SocMonitor::new(source, harness.state.clone()));

    // poll-side refresh picks up initial_soc = 50 and stalls
    let poll_refresh = {
        let soc = soc.clone();
        thread::spawn(move || soc.refresh())
    };
    reading_rx.recv_timeout(Duration::from_secs(2)).unwrap();

    store.set(BatteryParameter::InitialSoc, Some(20.0));
    let change_refresh = {
        let soc = soc.clone();
        thread::spawn(move || soc.refresh())
    };
    thread::sleep(Duration::from_millis(50));
    release_tx.send(()).unwrap();

    poll_refresh.join().unwrap();
    change_refresh.join().unwrap();

    // 12 kWh initial + 9.25 kWh charged of 60 kWh
    let reading = *harness.state.soc().unwrap().reading().unwrap();
    assert!((reading.soc_percent - 35.416_666).abs() < 1e-3);
    assert_eq!(soc.recomputations(), 2);
}

#[test]
fn test_invalid_parameter_reports_which() {
    let harness = Harness::new();
    harness.transport.push(json!({"state": 2, "IEM1": 10}));
    let mut params = scenario_a_params();
    params.capacity = Some(500.0);
    let soc = Arc::new(SocMonitor::new(
        Arc::new(ParameterStore::new(params)),
        harness.state.clone(),
    ));
    let mut poller = harness.poller().with_soc(soc);
    poller.poll_once();

    let estimate = harness.state.soc().unwrap();
    assert_eq!(estimate.result.unwrap_err().to_string(), "capacity invalid");
}

#[test]
fn test_unconfirmed_command_becomes_mismatch() {
    let harness = Harness::new();
    let dispatcher = harness.dispatcher(ChargerModel::Model32A);
    dispatcher.set_one_charge(true).unwrap();
    dispatcher.set_current(16.0).unwrap();

    let mut poller = harness.poller();
    for _ in 0..3 {
        harness
            .transport
            .push(json!({"state": 2, "oneCharge": 0, "currentSet": 16}));
        poller.poll_once();
    }

    let mismatches = harness.state.mismatches();
    assert_eq!(mismatches.len(), 1);
    assert_eq!(mismatches[0].field, "one_charge");
    assert_eq!(mismatches[0].observed, "false");
    assert!(harness.pending.is_empty());
    // not retried
    assert_eq!(harness.transport.commands().len(), 2);
}

#[test]
fn test_confirmed_reset_clears_expectation() {
    let harness = Harness::new();
    let dispatcher = harness.dispatcher(ChargerModel::Model32A);
    dispatcher.reset_counter_a().unwrap();
    assert_eq!(
        harness.transport.commands(),
        vec![("rstEM1".to_string(), "0".to_string())]
    );
    assert!(harness.pending.expected().counter_a_reset);

    harness.transport.push(json!({"state": 2, "IEM1": 0}));
    harness.poller().poll_once();
    assert!(harness.pending.is_empty());
    assert!(harness.state.mismatches().is_empty());
}

#[test]
fn test_poll_and_commands_never_overlap() {
    let transport = ScriptedTransport {
        delay: Duration::from_millis(20),
        ..ScriptedTransport::default()
    };
    let harness = Harness::with_transport(transport);
    let dispatcher = Arc::new(harness.dispatcher(ChargerModel::Model32A));

    let workers: Vec<_> = (0..3)
        .map(|i| {
            let dispatcher = dispatcher.clone();
            thread::spawn(move || {
                for amps in 0..5 {
                    dispatcher.set_current(f64::from(10 + i * 5 + amps)).unwrap();
                }
            })
        })
        .collect();

    let mut poller = harness.poller();
    for _ in 0..5 {
        poller.poll_once();
    }
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(harness.transport.max_in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(harness.transport.commands().len(), 15);
}

#[test]
fn test_command_wakes_poller() {
    let harness = Harness::new();
    let (wake_tx, wake_rx) = bounded(1);
    let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
    let dispatcher = harness
        .dispatcher(ChargerModel::Model32A)
        .with_wake(wake_tx);

    let poller = harness.poller();
    let handle = thread::spawn(move || poller.run(shutdown_rx, wake_rx));

    // first poll happens immediately, the next one is 60 s away
    let wait_for = |count: usize| {
        for _ in 0..200 {
            if harness.transport.fetches() >= count {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    };
    assert!(wait_for(1));
    dispatcher.set_current(12.0).unwrap();
    assert!(wait_for(2));

    drop(shutdown_tx);
    assert!(handle.join().unwrap().is_ok());
}
