use crate::config::Config;
use crate::errors::MqttError;
use crate::eveus::commands::CommandMismatch;
use crate::mqtt::context::PublishContext;
use crate::mqtt::{ConnectionStatus, DeviceInfo, DeviceStatus, RateStatus, SocStatus};
use crossbeam_channel::{unbounded, Receiver};
use rumqttc::{Client, Event, MqttOptions, Packet, QoS};
use std::thread;
use std::time::Duration;

/// Raw `(topic, payload)` received on a command topic
pub type InboundPublish = (String, String);

pub struct MqttPublisher {
    client: Client,
    root_topic: String,
}

macro_rules! publish_if_changed {
    ($context:expr, $src:ident , $old:ident, $field:ident) => {
        if $old.as_ref().map_or(true, |o| o.$field != $src.$field) {
            $context.publish(stringify!($field), &$src.$field)?;
        }
    };
}

impl MqttPublisher {
    /// Connect and subscribe to `<root>/<device_id>/set/+`. Messages on those
    /// topics arrive on the returned receiver.
    pub fn new(
        config: &Config,
        device_id: &str,
    ) -> Result<(Self, Receiver<InboundPublish>), MqttError> {
        let client_id = format!("eveus-mqtt-rs-{}", device_id);

        let mut mqtt_options = if let Some(socket_path) = &config.mqtt.socket {
            tracing::info!("Using MQTT Unix socket: {}", socket_path);
            MqttOptions::new(client_id, socket_path, 0)
        } else {
            let host = config.mqtt.host.as_ref().ok_or_else(|| {
                MqttError::ClientError("MQTT host or socket must be configured".to_string())
            })?;

            tracing::info!("Using MQTT TCP connection: {}:{}", host, config.mqtt.port);
            MqttOptions::new(client_id, host, config.mqtt.port)
        };

        if !config.mqtt.username.is_empty() {
            mqtt_options.set_credentials(&config.mqtt.username, &config.mqtt.password);
        }

        mqtt_options.set_keep_alive(Duration::from_secs(60));

        let root_topic = format!("{}/{}", config.mqtt.root, device_id);
        mqtt_options.set_last_will(rumqttc::LastWill {
            topic: format!("{}/online", root_topic),
            message: b"false".to_vec().into(),
            qos: QoS::AtLeastOnce,
            retain: true,
        });

        let (client, mut connection) = Client::new(mqtt_options, 10);
        let (inbound_tx, inbound_rx) = unbounded();

        let command_filter = format!("{}/set/+", root_topic);
        let subscriber = client.clone();
        thread::Builder::new()
            .name("mqtt-connection".to_string())
            .spawn(move || {
                for notification in connection.iter() {
                    match notification {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            tracing::info!("MQTT connected");
                            // never block here, this thread drives the request queue
                            if let Err(e) =
                                subscriber.try_subscribe(command_filter.as_str(), QoS::AtLeastOnce)
                            {
                                let error = MqttError::SubscribeFailed {
                                    topic: command_filter.clone(),
                                    reason: e.to_string(),
                                };
                                tracing::error!("{}", error);
                            }
                        }
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            let payload = String::from_utf8_lossy(&publish.payload).into_owned();
                            if inbound_tx.send((publish.topic, payload)).is_err() {
                                tracing::debug!("Inbound receiver gone, dropping message");
                            }
                        }
                        Ok(_) => {}
                        Err(e) => {
                            // Let it crash: a supervisor restarts the bridge
                            tracing::error!("MQTT connection error: {:?}", e);
                            std::process::exit(1);
                        }
                    }
                }
            })
            .map_err(|e| MqttError::ClientError(e.to_string()))?;

        Ok((Self { client, root_topic }, inbound_rx))
    }

    pub fn root_topic(&self) -> &str {
        &self.root_topic
    }

    pub fn context(&'_ self, topic: &str) -> PublishContext<'_> {
        let full_topic = if topic.is_empty() {
            self.root_topic.clone()
        } else {
            format!("{}/{}", self.root_topic, topic)
        };
        PublishContext::new(&self.client, full_topic)
    }

    pub fn publish_online_status(&self, online: bool) -> Result<(), MqttError> {
        let context = self.context("");
        context.publish("online", &online)
    }

    /// Publish charger identity as JSON
    pub fn publish_device_info(&self, info: &DeviceInfo) -> Result<(), MqttError> {
        let context = self.context("");
        let json =
            serde_json::to_string(info).map_err(|error| MqttError::SerializationError { error })?;
        context.publish("info", &json)
    }

    /// Only publishes fields that differ from `old`
    pub fn publish_device_status(
        &self,
        status: &DeviceStatus,
        old: Option<&DeviceStatus>,
    ) -> Result<(), MqttError> {
        let context = self.context("status");
        publish_if_changed!(context, status, old, time);
        publish_if_changed!(context, status, old, voltage);
        publish_if_changed!(context, status, old, current);
        publish_if_changed!(context, status, old, power);
        publish_if_changed!(context, status, old, current_set);
        publish_if_changed!(context, status, old, session_energy);
        publish_if_changed!(context, status, old, session_time);
        publish_if_changed!(context, status, old, total_energy);
        publish_if_changed!(context, status, old, counter_a_energy);
        publish_if_changed!(context, status, old, counter_b_energy);
        publish_if_changed!(context, status, old, counter_a_cost);
        publish_if_changed!(context, status, old, counter_b_cost);
        publish_if_changed!(context, status, old, box_temperature);
        publish_if_changed!(context, status, old, plug_temperature);
        publish_if_changed!(context, status, old, battery_voltage);
        publish_if_changed!(context, status, old, ground);
        publish_if_changed!(context, status, old, system_time);
        publish_if_changed!(context, status, old, stop_charging);
        publish_if_changed!(context, status, old, one_charge);
        publish_if_changed!(context, status, old, state);
        publish_if_changed!(context, status, old, substate);
        publish_if_changed!(context, status, old, error);
        publish_if_changed!(context, status, old, stale);

        Ok(())
    }

    pub fn publish_rate_status(
        &self,
        rates: &RateStatus,
        old: Option<&RateStatus>,
    ) -> Result<(), MqttError> {
        let context = self.context("rate");
        publish_if_changed!(context, rates, old, primary_cost);
        publish_if_changed!(context, rates, old, rate2_cost);
        publish_if_changed!(context, rates, old, rate3_cost);
        publish_if_changed!(context, rates, old, rate2_enabled);
        publish_if_changed!(context, rates, old, rate3_enabled);
        publish_if_changed!(context, rates, old, active);
        publish_if_changed!(context, rates, old, active_cost);

        Ok(())
    }

    pub fn publish_soc_status(
        &self,
        soc: &SocStatus,
        old: Option<&SocStatus>,
    ) -> Result<(), MqttError> {
        let context = self.context("soc");
        publish_if_changed!(context, soc, old, available);
        publish_if_changed!(context, soc, old, reason);
        publish_if_changed!(context, soc, old, energy_kwh);
        publish_if_changed!(context, soc, old, percent);
        publish_if_changed!(context, soc, old, time_to_target);
        publish_if_changed!(context, soc, old, time_to_target_minutes);

        Ok(())
    }

    pub fn publish_connection_status(
        &self,
        connection: &ConnectionStatus,
        old: Option<&ConnectionStatus>,
    ) -> Result<(), MqttError> {
        let context = self.context("connection");
        publish_if_changed!(context, connection, old, quality);
        publish_if_changed!(context, connection, old, consecutive_failures);
        publish_if_changed!(context, connection, old, total_failures);
        publish_if_changed!(context, connection, old, total_successes);
        publish_if_changed!(context, connection, old, last_success);
        publish_if_changed!(context, connection, old, last_error);
        publish_if_changed!(context, connection, old, backoff);
        publish_if_changed!(context, connection, old, stale);
        publish_if_changed!(context, connection, old, auth_failed);
        publish_if_changed!(context, connection, old, pending_commands);

        Ok(())
    }

    /// Recent command mismatches as a JSON array, newest last
    pub fn publish_command_mismatches(
        &self,
        mismatches: &[CommandMismatch],
    ) -> Result<(), MqttError> {
        let context = self.context("diagnostics");
        let json = serde_json::to_string(mismatches)
            .map_err(|error| MqttError::SerializationError { error })?;
        context.publish("command_mismatch", &json)
    }
}
