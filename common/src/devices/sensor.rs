use serde::Serialize;

use crate::{
    command::{CommandAction, CommandSpec},
    devices::DeviceModel,
    identity::DeviceKind,
};

/// Latest environment readings. Nothing here survives a restart.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SensorNode {
    pub temperature: f32,
    pub humidity: f32,
    /// hPa.
    pub pressure: f32,
    pub light_level: u16,
    pub motion_detected: bool,
}

/// One sampling pass. `None` means the sensor did not answer (or returned
/// NaN), in which case the previous value is kept.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SensorReadings {
    pub temperature: Option<f32>,
    pub humidity: Option<f32>,
    pub pressure: Option<f32>,
    pub light_level: Option<u16>,
    pub motion_detected: Option<bool>,
}

pub trait EnvironmentSensors {
    fn read(&mut self) -> SensorReadings;
}

static COMMANDS: [CommandSpec<SensorNode>; 3] = [
    CommandSpec::new("get_sensors", CommandAction::RefreshSensors),
    CommandSpec::new("get_status", CommandAction::ReportStatus),
    CommandSpec::new("restart", CommandAction::Restart),
];

impl DeviceModel for SensorNode {
    const KIND: DeviceKind = DeviceKind::SensorNode;
    const LAYOUT_VERSION: u8 = 1;
    const RECORD_LEN: usize = 0;
    const HAS_SENSORS: bool = true;

    type Io = dyn EnvironmentSensors;

    fn commands() -> &'static [CommandSpec<Self>] {
        &COMMANDS
    }

    fn encode(&self, _record: &mut [u8]) {}

    fn decode(_record: &[u8]) -> Self {
        Self::default()
    }

    fn drive_outputs(&self, _io: &mut Self::Io) {}

    fn poll_inputs(&mut self, io: &mut Self::Io) {
        let readings = io.read();

        // Temperature and humidity come from the same DHT transaction; a
        // half-valid pair is discarded.
        if let (Some(temperature), Some(humidity)) = (
            readings.temperature.filter(|t| t.is_finite()),
            readings.humidity.filter(|h| h.is_finite()),
        ) {
            self.temperature = temperature;
            self.humidity = humidity;
        }
        if let Some(pressure) = readings.pressure.filter(|p| p.is_finite()) {
            self.pressure = pressure;
        }
        if let Some(light_level) = readings.light_level {
            self.light_level = light_level;
        }
        if let Some(motion) = readings.motion_detected {
            self.motion_detected = motion;
        }
    }
}
