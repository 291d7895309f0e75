use serde::Serialize;

use crate::{
    command::{
        clamp_channel, clamp_percent, require_bool, require_int, CommandAction, CommandSpec,
        Parameters,
    },
    devices::DeviceModel,
    error::CommandError,
    identity::DeviceKind,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SmartLight {
    pub power: bool,
    /// Percent, 0..=100.
    pub brightness: u8,
    pub color_r: u8,
    pub color_g: u8,
    pub color_b: u8,
}

impl Default for SmartLight {
    fn default() -> Self {
        Self {
            power: false,
            brightness: 100,
            color_r: 255,
            color_g: 255,
            color_b: 255,
        }
    }
}

/// What the light hardware should show right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LightOutput {
    pub relay_on: bool,
    /// PWM duty, 0..=255.
    pub duty: u8,
    pub rgb: [u8; 3],
}

pub trait LightDriver {
    fn write(&mut self, output: LightOutput);
}

impl SmartLight {
    pub fn output(&self) -> LightOutput {
        let duty = if self.power {
            (u16::from(self.brightness.min(100)) * 255 / 100) as u8
        } else {
            0
        };
        LightOutput {
            relay_on: self.power,
            duty,
            rgb: [self.color_r, self.color_g, self.color_b],
        }
    }
}

fn set_power(light: &mut SmartLight, parameters: &Parameters) -> Result<(), CommandError> {
    light.power = require_bool(parameters, "power")?;
    Ok(())
}

fn set_brightness(light: &mut SmartLight, parameters: &Parameters) -> Result<(), CommandError> {
    light.brightness = clamp_percent(require_int(parameters, "brightness")?);
    Ok(())
}

fn set_color(light: &mut SmartLight, parameters: &Parameters) -> Result<(), CommandError> {
    let r = require_int(parameters, "r")?;
    let g = require_int(parameters, "g")?;
    let b = require_int(parameters, "b")?;
    light.color_r = clamp_channel(r);
    light.color_g = clamp_channel(g);
    light.color_b = clamp_channel(b);
    Ok(())
}

fn toggle(light: &mut SmartLight, _: &Parameters) -> Result<(), CommandError> {
    light.power = !light.power;
    Ok(())
}

static COMMANDS: [CommandSpec<SmartLight>; 6] = [
    CommandSpec::mutate("set_power", set_power),
    CommandSpec::mutate("set_brightness", set_brightness),
    CommandSpec::mutate("set_color", set_color),
    CommandSpec::mutate("toggle", toggle),
    CommandSpec::new("get_status", CommandAction::ReportStatus),
    CommandSpec::new("restart", CommandAction::Restart),
];

impl DeviceModel for SmartLight {
    const KIND: DeviceKind = DeviceKind::SmartLight;
    const LAYOUT_VERSION: u8 = 1;
    const RECORD_LEN: usize = 5;

    type Io = dyn LightDriver;

    fn commands() -> &'static [CommandSpec<Self>] {
        &COMMANDS
    }

    fn encode(&self, record: &mut [u8]) {
        record.copy_from_slice(&[
            u8::from(self.power),
            self.brightness,
            self.color_r,
            self.color_g,
            self.color_b,
        ]);
    }

    fn decode(record: &[u8]) -> Self {
        match *record {
            [power, brightness, color_r, color_g, color_b] => Self {
                power: power == 1,
                brightness: brightness.min(100),
                color_r,
                color_g,
                color_b,
            },
            _ => Self::default(),
        }
    }

    fn drive_outputs(&self, io: &mut Self::Io) {
        io.write(self.output());
    }

    fn on_button(&mut self) -> bool {
        self.power = !self.power;
        true
    }
}
