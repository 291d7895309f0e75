use serde::Serialize;

use crate::{
    command::{require_bool, CommandAction, CommandSpec, Parameters},
    devices::DeviceModel,
    error::CommandError,
    identity::DeviceKind,
};

/// Wired gateway: one relay plus a DHT and an analog input. Only `power` is
/// persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Gateway {
    pub power: bool,
    pub temperature: f32,
    pub humidity: f32,
    pub analog_value: u16,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GatewayReadings {
    pub temperature: Option<f32>,
    pub humidity: Option<f32>,
    pub analog_value: u16,
}

pub trait GatewayIo {
    fn set_relay(&mut self, on: bool);
    fn read(&mut self) -> GatewayReadings;
}

fn set_power(gateway: &mut Gateway, parameters: &Parameters) -> Result<(), CommandError> {
    gateway.power = require_bool(parameters, "power")?;
    Ok(())
}

fn toggle(gateway: &mut Gateway, _: &Parameters) -> Result<(), CommandError> {
    gateway.power = !gateway.power;
    Ok(())
}

// The gateway firmware never exposed `restart` over MQTT.
static COMMANDS: [CommandSpec<Gateway>; 4] = [
    CommandSpec::mutate("set_power", set_power),
    CommandSpec::mutate("toggle", toggle),
    CommandSpec::new("get_status", CommandAction::ReportStatus),
    CommandSpec::new("get_sensors", CommandAction::RefreshSensors),
];

impl DeviceModel for Gateway {
    const KIND: DeviceKind = DeviceKind::Gateway;
    const LAYOUT_VERSION: u8 = 1;
    const RECORD_LEN: usize = 1;
    const HAS_SENSORS: bool = true;

    type Io = dyn GatewayIo;

    fn commands() -> &'static [CommandSpec<Self>] {
        &COMMANDS
    }

    fn encode(&self, record: &mut [u8]) {
        record[0] = u8::from(self.power);
    }

    fn decode(record: &[u8]) -> Self {
        Self {
            power: record.first() == Some(&1),
            ..Self::default()
        }
    }

    fn drive_outputs(&self, io: &mut Self::Io) {
        io.set_relay(self.power);
    }

    fn poll_inputs(&mut self, io: &mut Self::Io) {
        let readings = io.read();
        if let (Some(temperature), Some(humidity)) = (
            readings.temperature.filter(|t| t.is_finite()),
            readings.humidity.filter(|h| h.is_finite()),
        ) {
            self.temperature = temperature;
            self.humidity = humidity;
        }
        self.analog_value = readings.analog_value;
    }

    fn on_button(&mut self) -> bool {
        self.power = !self.power;
        true
    }
}
