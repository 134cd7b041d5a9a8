use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use crossbeam_channel::{bounded, select, unbounded};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use eveus_mqtt_rs::config::Config;
use eveus_mqtt_rs::eveus::commands::CommandMismatch;
use eveus_mqtt_rs::eveus::{
    CommandDispatcher, DeviceLink, HttpTransport, PendingCommands, Poller, PollerSettings,
};
use eveus_mqtt_rs::mqtt::{
    ConnectionStatus, DeviceInfo, DeviceStatus, InboundHandler, MqttPublisher, RateStatus,
    SocStatus,
};
use eveus_mqtt_rs::soc::{BatteryParameterSource, ParameterStore, RawBatteryParameters, SocMonitor};
use eveus_mqtt_rs::state::{SharedState, Update};

/// Eveus MQTT Bridge - Publishes Eveus EV charger data to MQTT
#[derive(Parser)]
#[command(name = "eveus-mqtt-rs")]
#[command(version)]
#[command(about = "Eveus MQTT Bridge - Publishes Eveus EV charger data to MQTT", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

/// Last published values, for per-field change detection
#[derive(Default)]
struct Published {
    info: bool,
    device: Option<DeviceStatus>,
    rates: Option<RateStatus>,
    soc: Option<SocStatus>,
    connection: Option<ConnectionStatus>,
    mismatches: Vec<CommandMismatch>,
}

fn publish_state(
    publisher: &MqttPublisher,
    config: &Config,
    device_id: &str,
    state: &SharedState,
    pending: &PendingCommands,
    last: &mut Published,
) -> anyhow::Result<()> {
    let health = state.health();

    if let Some(device) = state.device() {
        if !last.info {
            let info = DeviceInfo::new(device_id, &config.eveus.host, config.eveus.model, &device);
            publisher.publish_device_info(&info)?;
            info!(
                "Charger firmware {}",
                device.snapshot.firmware.as_deref().unwrap_or("unknown")
            );
            last.info = true;
        }

        let status = DeviceStatus::from_device(&device, &pending.expected(), health.stale);
        publisher.publish_device_status(&status, last.device.as_ref())?;
        last.device = Some(status);

        let rates = RateStatus::from_schedule(&device.snapshot.rates);
        publisher.publish_rate_status(&rates, last.rates.as_ref())?;
        last.rates = Some(rates);
    }

    let soc = SocStatus::from_estimate(state.soc().as_ref());
    publisher.publish_soc_status(&soc, last.soc.as_ref())?;
    last.soc = Some(soc);

    let connection = ConnectionStatus::from_report(&health, pending.len());
    publisher.publish_connection_status(&connection, last.connection.as_ref())?;
    last.connection = Some(connection);

    let mismatches = state.mismatches();
    if mismatches != last.mismatches {
        publisher.publish_command_mismatches(&mismatches)?;
        last.mismatches = mismatches;
    }

    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration first (to get log level)
    let config_path = cli.config;
    let config = Config::from_file(&config_path)?;

    let app_log_level = config.default.log_level.as_str();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("eveus_mqtt_rs={}", app_log_level).parse()?)
                .add_directive("reqwest=warn".parse()?)
                .add_directive("rumqttc=warn".parse()?),
        )
        .init();

    let device_id = config.device_id();

    info!("Configuration loaded from: {}", config_path);
    info!("Log level: {}", config.default.log_level);
    debug!("Debug logging is enabled");
    info!("  Charger: {} ({})", config.eveus.host, config.eveus.model.as_str());
    info!("  MQTT Root: {}/{}", config.mqtt.root, device_id);
    info!(
        "  Poll interval: {:?} charging, {:?} idle",
        config.eveus.charging_interval, config.eveus.idle_interval
    );

    let (publisher, inbound) = MqttPublisher::new(&config, &device_id)?;
    info!("MQTT publisher created");

    // Give MQTT a moment to connect
    thread::sleep(Duration::from_millis(500));
    publisher.publish_online_status(true)?;

    let (update_tx, update_rx) = unbounded();
    let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
    let (wake_tx, wake_rx) = bounded(1);

    let shutdown = Arc::new(Mutex::new(Some(shutdown_tx)));
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            info!("Shutdown requested");
            shutdown.lock().take();
        })?;
    }

    let state = Arc::new(SharedState::new(update_tx));
    let link = Arc::new(DeviceLink::new(
        HttpTransport::new(&config.eveus)?,
        config.eveus.command_spacing,
    ));
    let pending = Arc::new(PendingCommands::new(config.eveus.reconcile_cycles));

    let params = Arc::new(ParameterStore::new(RawBatteryParameters::from_config(
        &config.battery,
    )));
    let changes = params.subscribe();
    let soc = Arc::new(SocMonitor::new(params.clone(), state.clone()));

    let dispatcher = Arc::new(
        CommandDispatcher::new(link.clone(), pending.clone(), state.clone(), config.eveus.model)
            .with_wake(wake_tx),
    );
    let inbound_handler = InboundHandler::new(publisher.root_topic(), dispatcher, params);

    let poller = Poller::new(
        link,
        PollerSettings::from_config(&config.eveus),
        state.clone(),
        pending.clone(),
    )
    .with_soc(soc.clone());

    let poller_thread = {
        let shutdown = shutdown_rx.clone();
        thread::Builder::new()
            .name("poller".to_string())
            .spawn(move || poller.run(shutdown, wake_rx))?
    };
    let soc_thread = {
        let shutdown = shutdown_rx.clone();
        let soc = soc.clone();
        thread::Builder::new()
            .name("soc".to_string())
            .spawn(move || soc.run(changes, shutdown))?
    };
    let inbound_thread = {
        let shutdown = shutdown_rx.clone();
        thread::Builder::new()
            .name("commands".to_string())
            .spawn(move || inbound_handler.run(inbound, shutdown))?
    };

    info!("Starting main loop...");
    let mut last = Published::default();
    let mut publish_error = None;
    loop {
        select! {
            recv(shutdown_rx) -> _ => break,
            recv(update_rx) -> update => {
                let Ok(update) = update else { break };
                // fold a burst of notifications into one publish pass
                let halted = update == Update::Halted
                    || update_rx.try_iter().any(|u| u == Update::Halted);

                if let Err(e) = publish_state(
                    &publisher,
                    &config,
                    &device_id,
                    &state,
                    &pending,
                    &mut last,
                ) {
                    error!("Failed to publish state: {:?}", e);
                    publish_error = Some(e);
                    break;
                }
                if halted {
                    warn!("Charger polling halted, shutting down");
                    break;
                }
            }
        }
    }

    shutdown.lock().take();

    let poll_result = poller_thread
        .join()
        .map_err(|_| anyhow::anyhow!("poller thread panicked"))?;
    if soc_thread.join().is_err() {
        error!("SOC thread panicked");
    }
    if inbound_thread.join().is_err() {
        error!("Command thread panicked");
    }

    if let Err(e) = publisher.publish_online_status(false) {
        warn!("Failed to publish offline status: {}", e);
    }
    // Give the connection thread a moment to flush
    thread::sleep(Duration::from_millis(200));
    info!("Bridge stopped");

    if let Some(e) = publish_error {
        return Err(e);
    }
    poll_result?;
    Ok(())
}
