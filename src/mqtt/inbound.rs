//! Command and parameter topics
//!
//! Everything under `<root>/<device_id>/set/` is turned into a dispatcher
//! call or a battery parameter update.

use std::sync::Arc;

use crossbeam_channel::{select, Receiver};
use tracing::{debug, info, warn};

use super::publisher::InboundPublish;
use crate::errors::MqttError;
use crate::eveus::commands::CommandDispatcher;
use crate::soc::{BatteryParameter, ParameterStore};

#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// Raw payload, validated by the dispatcher
    SetCurrent(String),
    SetStopCharging(bool),
    SetOneCharge(bool),
    ResetCounterA,
    SetParameter(BatteryParameter, Option<f64>),
}

fn parse_switch(topic: &str, payload: &str) -> Result<bool, MqttError> {
    match payload.trim().to_lowercase().as_str() {
        "true" | "on" | "1" => Ok(true),
        "false" | "off" | "0" => Ok(false),
        _ => Err(MqttError::InvalidPayload {
            topic: topic.to_string(),
            payload: payload.to_string(),
        }),
    }
}

fn parse_parameter(topic: &str, payload: &str) -> Result<Option<f64>, MqttError> {
    let payload = payload.trim();
    if matches!(payload.to_lowercase().as_str(), "" | "unknown" | "unavailable") {
        return Ok(None);
    }
    payload
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .map(Some)
        .ok_or_else(|| MqttError::InvalidPayload {
            topic: topic.to_string(),
            payload: payload.to_string(),
        })
}

impl InboundMessage {
    /// `Ok(None)` for topics outside `<base>/set/`.
    pub fn parse(base: &str, topic: &str, payload: &str) -> Result<Option<Self>, MqttError> {
        let Some(name) = topic
            .strip_prefix(base)
            .and_then(|rest| rest.strip_prefix("/set/"))
        else {
            return Ok(None);
        };

        let message = match name {
            "current" => InboundMessage::SetCurrent(payload.trim().to_string()),
            "stop_charging" => InboundMessage::SetStopCharging(parse_switch(topic, payload)?),
            "one_charge" => InboundMessage::SetOneCharge(parse_switch(topic, payload)?),
            "reset_counter_a" => InboundMessage::ResetCounterA,
            other => match BatteryParameter::from_topic(other) {
                Some(parameter) => {
                    InboundMessage::SetParameter(parameter, parse_parameter(topic, payload)?)
                }
                None => {
                    return Err(MqttError::InvalidPayload {
                        topic: topic.to_string(),
                        payload: payload.to_string(),
                    })
                }
            },
        };
        Ok(Some(message))
    }
}

pub struct InboundHandler {
    base: String,
    dispatcher: Arc<CommandDispatcher>,
    params: Arc<ParameterStore>,
}

impl InboundHandler {
    pub fn new(
        base: impl Into<String>,
        dispatcher: Arc<CommandDispatcher>,
        params: Arc<ParameterStore>,
    ) -> Self {
        Self {
            base: base.into(),
            dispatcher,
            params,
        }
    }

    /// Apply one message. Failures are logged, the device state stays as the
    /// next poll reports it.
    pub fn handle(&self, topic: &str, payload: &str) {
        let message = match InboundMessage::parse(&self.base, topic, payload) {
            Ok(Some(message)) => message,
            Ok(None) => {
                debug!("Ignoring message on {}", topic);
                return;
            }
            Err(e) => {
                warn!("{}", e);
                return;
            }
        };

        let result = match message {
            InboundMessage::SetCurrent(raw) => self.dispatcher.set_current_raw(&raw).map(|amps| {
                info!("Charging current set to {}A", amps);
            }),
            InboundMessage::SetStopCharging(stop) => self.dispatcher.set_stop_charging(stop),
            InboundMessage::SetOneCharge(on) => self.dispatcher.set_one_charge(on),
            InboundMessage::ResetCounterA => self.dispatcher.reset_counter_a(),
            InboundMessage::SetParameter(parameter, value) => {
                self.params.set(parameter, value);
                Ok(())
            }
        };

        if let Err(e) = result {
            warn!("Command from {} failed: {}", topic, e);
        }
    }

    pub fn run(&self, messages: Receiver<InboundPublish>, shutdown: Receiver<()>) {
        info!("Listening for commands on {}/set/+", self.base);
        loop {
            select! {
                recv(shutdown) -> _ => break,
                recv(messages) -> message => match message {
                    Ok((topic, payload)) => self.handle(&topic, &payload),
                    Err(_) => break,
                },
            }
        }
        info!("Command listener stopped");
    }
}
